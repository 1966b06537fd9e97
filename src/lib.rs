//! Heuristic static disassembler for 32-bit x86 PE images.
//!
//! The library classifies every byte of an image's executable sections as
//! code or data without running it. Decoding starts at the entry point and
//! the exports, follows every branch, call and jump table it can resolve,
//! and erases its own guesses when they lead into garbage. Leftover bytes
//! are then searched for pointer tables and strings, speculative code is
//! validated, and whatever is still undecided becomes raw data.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use heurasm::{
//!     config::AnalysisConfig,
//!     format::ReportFormat,
//!     parser::PeParser,
//!     ImageParser, // Import the trait to bring parse() method into scope
//! };
//!
//! // Read and parse the image
//! let image = fs::read("path/to/program.exe").unwrap();
//! let layout = PeParser::new().parse(&image).unwrap();
//!
//! // Run the analysis
//! let analysis = heurasm::analyze_with(&image, &layout, &AnalysisConfig::default(), None).unwrap();
//!
//! // Walk the listing
//! for (addr, insn) in &analysis.instructions {
//!     let name = analysis.names.name_of(*addr).unwrap_or("");
//!     println!("{:08x} {:<16} {:?}", addr, name, insn.flow);
//! }
//!
//! // Or produce a machine-readable report
//! let report = ReportFormat::Json.get_formatter().format(&analysis).unwrap();
//! ```

pub mod config;
pub mod decoder;
pub mod driver;
pub mod format;
pub mod image;
pub mod index;
pub mod listing;
pub mod map;
pub mod parser;
pub mod passes;
pub mod symbols;
pub mod worklist;
#[cfg(test)]
mod scenario_tests;

use std::path::Path;

use anyhow::Context;
use rayon::prelude::*;

use crate::config::{AnalysisConfig, CancelToken};
use crate::decoder::{DecodedInstruction, X86Decoder};
use crate::driver::Driver;
use crate::image::{ByteStore, ImageLayout};
use crate::index::AddressIndex;
use crate::map::{ByteKind, ClassificationMap};
use crate::symbols::SymbolTable;

pub use crate::driver::{AnalysisStats, ConflictKind, DriverState, ErasedSpan};

/// A virtual address inside a 32-bit image
pub type Address = u32;

/// Longest encoding an x86 instruction may have
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// Error type for analysis operations
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Failed to parse the container format
    #[error("Failed to parse image: {0}")]
    Parsing(String),

    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// No executable section has any raw bytes
    #[error("Image has no executable bytes")]
    EmptyCodeRegion,

    #[error("Entry point RVA 0x{0:x} is outside every section")]
    EntryPointOutsideSections(u32),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Parser trait: turn raw file bytes into an `ImageLayout`.
pub trait ImageParser: Send + Sync {
    /// Parse image data into a layout
    ///
    /// # Arguments
    /// * `data` - The raw file bytes
    ///
    /// # Returns
    /// Result containing the ImageLayout if parsing was successful
    fn parse(&self, data: &[u8]) -> Result<ImageLayout, AnalysisError>;
}

/// Everything a finished analysis hands to a renderer or report.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Final per-byte classification
    pub classification: ClassificationMap,
    /// Every relationship the analysis kept, both halves
    pub symbols: AddressIndex,
    pub names: SymbolTable,
    /// Instructions in ascending address order
    pub instructions: Vec<(Address, DecodedInstruction)>,
    pub stats: AnalysisStats,
    /// Most recent erased spans, oldest first
    pub erase_history: Vec<ErasedSpan>,
}

impl Analysis {
    pub fn code_bytes(&self) -> usize {
        self.classification.count(ByteKind::InstructionStart)
            + self.classification.count(ByteKind::InstructionBody)
    }

    pub fn data_bytes(&self) -> usize {
        self.classification.count(ByteKind::DataByte)
    }
}

/// Analyze an image with the default configuration.
pub fn analyze(image: &[u8], layout: &ImageLayout) -> Result<Analysis, AnalysisError> {
    analyze_with(image, layout, &AnalysisConfig::default(), None)
}

/// Analyze an image.
///
/// Fails only on precondition errors (no executable bytes, entry point
/// outside the sections); decode trouble inside the image is recovered
/// from and reported through `stats` and `erase_history`.
pub fn analyze_with(
    image: &[u8],
    layout: &ImageLayout,
    config: &AnalysisConfig,
    cancel: Option<&CancelToken>,
) -> Result<Analysis, AnalysisError> {
    let store = ByteStore::new(image, layout)?;
    let decoder = X86Decoder::for_store(&store, config.cpu_mode);

    let mut driver = Driver::new(&store, &decoder, config);
    if let Some(token) = cancel {
        driver = driver.with_cancel(token.clone());
    }
    let output = driver.run();

    let names = SymbolTable::build(&store, &output.map, &output.index);
    let instructions = listing::build(&store, &decoder, &output.map);

    let analysis = Analysis {
        classification: output.map,
        symbols: output.index,
        names,
        instructions,
        stats: output.stats,
        erase_history: output.erase_history,
    };
    log::info!(
        "Analyzed {} executable bytes: {} instructions, {} code bytes, {} data bytes, {} recoveries",
        analysis.classification.len(),
        analysis.instructions.len(),
        analysis.code_bytes(),
        analysis.data_bytes(),
        analysis.stats.recoveries
    );
    Ok(analysis)
}

/// Read, parse and analyze a PE file.
pub fn analyze_file(path: impl AsRef<Path>, config: &AnalysisConfig) -> anyhow::Result<Analysis> {
    let path = path.as_ref();
    let image = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let layout = parser::PeParser::new()
        .parse(&image)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let analysis = analyze_with(&image, &layout, config, None)
        .with_context(|| format!("Failed to analyze {}", path.display()))?;
    Ok(analysis)
}

/// Parse and analyze independent PE images in parallel.
///
/// Results come back in input order; each image gets its own structures.
pub fn analyze_batch(images: &[&[u8]], config: &AnalysisConfig) -> Vec<Result<Analysis, AnalysisError>> {
    let parser = parser::PeParser::new();
    images
        .par_iter()
        .map(|image| {
            let layout = parser.parse(image)?;
            analyze_with(image, &layout, config, None)
        })
        .collect()
}
