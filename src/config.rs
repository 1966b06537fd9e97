//! Analysis configuration and cooperative cancellation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::decoder::CpuMode;
use crate::AnalysisError;

/// Operational knobs for one analysis run.
///
/// Heuristic thresholds are not configurable; they live as constants next to
/// the passes that use them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Default operand/address size of the code
    pub cpu_mode: CpuMode,
    /// Treat `push imm32` / `mov reg, imm32` immediates that land in code as
    /// guesses worth decoding.
    pub follow_immediate_pointers: bool,
    /// Read the tables behind `jmp [table + reg*4]`
    pub follow_jump_tables: bool,
    /// Recoveries allowed before discovery is abandoned
    pub max_recoveries: usize,
    /// Length of the erased-span diagnostic log
    pub erase_history_limit: usize,
    /// Worklist pops allowed, 0 for no limit
    pub max_attempts: usize,
    pub detect_strings: bool,
    pub detect_address_tables: bool,
    pub validate_code: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cpu_mode: CpuMode::Bits32,
            follow_immediate_pointers: true,
            follow_jump_tables: true,
            max_recoveries: 4096,
            erase_history_limit: 64,
            max_attempts: 0,
            detect_strings: true,
            detect_address_tables: true,
            validate_code: true,
        }
    }
}

impl AnalysisConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, AnalysisError> {
        serde_json::from_str(json).map_err(|e| AnalysisError::Config(e.to_string()))
    }

    /// Load a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn to_json_string(&self) -> Result<String, AnalysisError> {
        serde_json::to_string_pretty(self).map_err(|e| AnalysisError::Serialization(e.to_string()))
    }
}

/// Shared flag asking a running analysis to stop discovering code.
///
/// The driver checks it once per worklist pop. A cancelled run still
/// finalizes, so its output covers every byte.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
