//! Machine-readable reports of a finished analysis

mod csv;
mod json;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::{Analysis, AnalysisError};

/// Supported report formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ReportFormat {
    /// One JSON document: statistics, classification runs, names, listing
    #[default]
    Json,
    /// Instruction listing, one row per instruction
    Csv,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Json => write!(f, "json"),
            ReportFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            _ => Err(format!("Unknown report format: {}", s)),
        }
    }
}

impl ReportFormat {
    /// Get all available report formats
    pub fn available_formats() -> &'static [Self] {
        &[ReportFormat::Json, ReportFormat::Csv]
    }

    /// Get a formatter for this report format
    pub fn get_formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            ReportFormat::Json => Box::new(JsonFormatter),
            ReportFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for analysis reports
pub trait ReportFormatter {
    /// Serialise a finished analysis
    fn format(&self, analysis: &Analysis) -> Result<String, AnalysisError>;
}

/// Format an analysis as a JSON document
pub struct JsonFormatter;

/// Format an analysis as a CSV instruction listing
pub struct CsvFormatter;

/// Opcode bytes as lowercase hex, escape bytes included (`0f 84`).
pub(crate) fn opcode_hex(insn: &crate::decoder::DecodedInstruction) -> String {
    use crate::decoder::OpcodeMap;

    let escape: &[u8] = match insn.opcode_map {
        OpcodeMap::OneByte => &[],
        OpcodeMap::TwoByte => &[0x0f],
        OpcodeMap::ThreeByte38 => &[0x0f, 0x38],
        OpcodeMap::ThreeByte3A => &[0x0f, 0x3a],
    };
    escape
        .iter()
        .chain(std::iter::once(&insn.opcode))
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
