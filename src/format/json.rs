//! JSON report formatter

use serde::Serialize;

use crate::decoder::FlowKind;
use crate::driver::{AnalysisStats, ErasedSpan};
use crate::index::IndexEntry;
use crate::map::ClassRun;
use crate::symbols::SymbolKind;
use crate::{Analysis, AnalysisError};

use super::{opcode_hex, ReportFormatter};

/// Serializable name for JSON output
#[derive(Serialize)]
struct NameJson<'a> {
    address: String,
    name: &'a str,
    kind: SymbolKind,
}

/// Serializable instruction for JSON output
#[derive(Serialize)]
struct InstructionJson<'a> {
    address: String,
    length: u8,
    /// Opcode bytes as hex, escape bytes included
    opcode: String,
    flow: FlowKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

/// Serializable report for JSON output
#[derive(Serialize)]
struct ReportJson<'a> {
    stats: &'a AnalysisStats,
    runs: Vec<ClassRun>,
    names: Vec<NameJson<'a>>,
    relations: Vec<IndexEntry>,
    instructions: Vec<InstructionJson<'a>>,
    erase_history: &'a [ErasedSpan],
}

impl ReportFormatter for super::JsonFormatter {
    fn format(&self, analysis: &Analysis) -> Result<String, AnalysisError> {
        let names = analysis
            .names
            .iter()
            .map(|(addr, sym)| NameJson {
                address: format!("0x{:08x}", addr),
                name: &sym.name,
                kind: sym.kind,
            })
            .collect();

        let instructions = analysis
            .instructions
            .iter()
            .map(|(addr, insn)| InstructionJson {
                address: format!("0x{:08x}", addr),
                length: insn.length,
                opcode: opcode_hex(insn),
                flow: insn.flow,
                reference: insn.computed_reference.map(|r| format!("0x{:08x}", r)),
                name: insn
                    .computed_reference
                    .and_then(|r| analysis.names.name_of(r)),
            })
            .collect();

        // Forward halves only; the reverse halves carry no extra information
        let relations = analysis
            .symbols
            .iter()
            .filter(|e| !e.class.is_reverse())
            .collect();

        let report = ReportJson {
            stats: &analysis.stats,
            runs: analysis.classification.runs(),
            names,
            relations,
            instructions,
            erase_history: &analysis.erase_history,
        };

        serde_json::to_string_pretty(&report)
            .map_err(|e| AnalysisError::Serialization(format!("JSON serialization error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::JsonFormatter;
    use super::*;
    use crate::image::ImageLayout;
    use serde_json::Value;

    #[test]
    fn test_json_report() {
        // call +0; ret; ret
        let image = [0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3];
        let layout = ImageLayout::flat(0x40_0000, 0x1000, image.len() as u32);
        let analysis = crate::analyze(&image, &layout).unwrap();

        let text = JsonFormatter.format(&analysis).unwrap();
        let doc: Value = serde_json::from_str(&text).unwrap();

        let insns = doc["instructions"].as_array().unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0]["address"], "0x00401000");
        assert_eq!(insns[0]["opcode"], "e8");
        assert_eq!(insns[0]["flow"], "call");
        assert_eq!(insns[0]["reference"], "0x00401005");
        assert_eq!(insns[0]["name"], "sub_00401005");
        assert!(insns[1].get("reference").is_none());

        assert_eq!(doc["names"][0]["name"], "entry");
        assert_eq!(doc["relations"].as_array().unwrap().len(), 1);
        assert_eq!(doc["relations"][0]["position"], 0x40_1000);
        assert_eq!(doc["runs"][0]["kind"], "instruction_start");
        assert_eq!(doc["stats"]["recoveries"], 0);
        assert!(doc["erase_history"].as_array().unwrap().is_empty());
    }
}
