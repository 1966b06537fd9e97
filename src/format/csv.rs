//! CSV report formatter

use serde::Serialize;

use crate::decoder::FlowKind;
use crate::{Analysis, AnalysisError};

use super::{opcode_hex, ReportFormatter};

/// One listing row
#[derive(Serialize)]
struct InstructionRow<'a> {
    address: String,
    name: &'a str,
    length: u8,
    opcode: String,
    flow: FlowKind,
    reference: String,
    reference_name: &'a str,
}

impl ReportFormatter for super::CsvFormatter {
    fn format(&self, analysis: &Analysis) -> Result<String, AnalysisError> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        for (addr, insn) in &analysis.instructions {
            let row = InstructionRow {
                address: format!("0x{:08x}", addr),
                name: analysis.names.name_of(*addr).unwrap_or(""),
                length: insn.length,
                opcode: opcode_hex(insn),
                flow: insn.flow,
                reference: insn
                    .computed_reference
                    .map(|r| format!("0x{:08x}", r))
                    .unwrap_or_default(),
                reference_name: insn
                    .computed_reference
                    .and_then(|r| analysis.names.name_of(r))
                    .unwrap_or(""),
            };
            writer
                .serialize(row)
                .map_err(|e| AnalysisError::Serialization(format!("CSV serialization error: {}", e)))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| AnalysisError::Serialization(format!("CSV serialization error: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| AnalysisError::Serialization(e.to_string()))
    }
}
