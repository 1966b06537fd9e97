//! Goblin-based PE parser producing the layout the analysis consumes.

use std::fmt;

use goblin::{pe, Object};

use crate::image::{Export, ImageLayout, Import, Section};
use crate::{AnalysisError, ImageParser};

/// A parser for 32-bit x86 PE images via Goblin.
#[derive(Debug, Default)]
pub struct PeParser;

impl PeParser {
    /// Construct a new PeParser.
    pub fn new() -> Self {
        PeParser
    }

    /// Translate a parsed PE image.
    fn parse_pe(&self, pe: pe::PE<'_>) -> Result<ImageLayout, AnalysisError> {
        let machine = pe.header.coff_header.machine;
        if machine != pe::header::COFF_MACHINE_X86 {
            return Err(AnalysisError::UnsupportedArchitecture(format!(
                "COFF machine 0x{:04x}",
                machine
            )));
        }
        if pe.is_64 {
            return Err(AnalysisError::UnsupportedArchitecture("PE32+ image".into()));
        }

        let image_base = u32::try_from(pe.image_base)
            .map_err(|_| AnalysisError::Parsing(format!("Image base 0x{:x} exceeds 32 bits", pe.image_base)))?;
        let entry_point_rva = u32::try_from(pe.entry)
            .map_err(|_| AnalysisError::Parsing(format!("Entry point 0x{:x} exceeds 32 bits", pe.entry)))?;

        let sections = pe
            .sections
            .iter()
            .map(|sect| {
                Section::new(
                    sect.name().unwrap_or(""),
                    sect.virtual_address,
                    sect.pointer_to_raw_data,
                    sect.size_of_raw_data,
                    sect.characteristics,
                )
            })
            .collect();

        let exports = pe
            .exports
            .iter()
            .filter_map(|e| {
                let rva = u32::try_from(e.rva).ok()?;
                let name = e.name.map(str::to_string).unwrap_or_else(|| format!("export_{:08X}", rva));
                Some(Export { name, rva })
            })
            .collect();

        let imports = pe
            .imports
            .iter()
            .filter_map(|i| {
                Some(Import {
                    dll: i.dll.to_string(),
                    name: i.name.to_string(),
                    slot_rva: u32::try_from(i.rva).ok()?,
                })
            })
            .collect();

        let layout = ImageLayout {
            image_base,
            entry_point_rva,
            sections,
            exports,
            imports,
        };
        log::debug!(
            "PE image base 0x{:08x}, entry rva 0x{:x}, {} sections, {} exports, {} imports",
            layout.image_base,
            layout.entry_point_rva,
            layout.sections.len(),
            layout.exports.len(),
            layout.imports.len()
        );
        Ok(layout)
    }
}

impl fmt::Display for PeParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeParser")
    }
}

impl ImageParser for PeParser {
    fn parse(&self, data: &[u8]) -> Result<ImageLayout, AnalysisError> {
        match Object::parse(data) {
            Ok(Object::PE(pe)) => self.parse_pe(pe),
            Ok(_) => Err(AnalysisError::Parsing("Not a PE image".into())),
            Err(e) => Err(AnalysisError::Parsing(e.to_string())),
        }
    }
}
