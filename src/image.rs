//! Read-only byte store over a loaded PE image.
//!
//! The store never mutates the image. It translates between relative virtual
//! addresses, absolute addresses and file offsets, and hands out bounded
//! windows so the decoder can never read past the end of a section.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Address, AnalysisError};

/// Section contains executable code.
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
/// Section can be executed as code.
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
/// Section can be read.
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;

/// A section in the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Section name
    pub name: String,
    /// RVA of the first byte of the section
    pub virtual_address: u32,
    /// Size of the raw data in the file
    pub raw_size: u32,
    /// File offset of the raw data
    pub raw_offset: u32,
    /// `IMAGE_SCN_*` flags
    pub characteristics: u32,
}

impl Section {
    /// Create a new section
    pub fn new(
        name: impl Into<String>,
        virtual_address: u32,
        raw_offset: u32,
        raw_size: u32,
        characteristics: u32,
    ) -> Self {
        Self {
            name: name.into(),
            virtual_address,
            raw_size,
            raw_offset,
            characteristics,
        }
    }

    /// Whether this section holds executable code
    pub fn is_executable(&self) -> bool {
        self.characteristics & (IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE) != 0
    }

    /// Whether this section can be read
    pub fn is_readable(&self) -> bool {
        self.is_executable() || self.characteristics & IMAGE_SCN_MEM_READ != 0
    }

    /// Whether `rva` falls inside the raw data of this section
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.raw_size
    }

    /// RVA one past the last raw byte
    pub fn end_rva(&self) -> u32 {
        self.virtual_address.saturating_add(self.raw_size)
    }
}

/// An exported function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub name: String,
    pub rva: u32,
}

/// An imported function, bound through an IAT slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub dll: String,
    pub name: String,
    /// RVA of the import address table slot
    pub slot_rva: u32,
}

/// Container metadata consumed by the analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayout {
    pub image_base: u32,
    pub entry_point_rva: u32,
    pub sections: Vec<Section>,
    pub exports: Vec<Export>,
    pub imports: Vec<Import>,
}

impl ImageLayout {
    /// Layout with no exports or imports
    pub fn new(image_base: u32, entry_point_rva: u32, sections: Vec<Section>) -> Self {
        Self {
            image_base,
            entry_point_rva,
            sections,
            exports: Vec::new(),
            imports: Vec::new(),
        }
    }

    /// Single executable section whose raw data starts at file offset zero.
    ///
    /// Handy for raw code blobs and tests.
    pub fn flat(image_base: u32, code_rva: u32, code_len: u32) -> Self {
        Self::new(
            image_base,
            code_rva,
            vec![Section::new(
                ".text",
                code_rva,
                0,
                code_len,
                IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
            )],
        )
    }

    pub fn with_exports(mut self, exports: Vec<Export>) -> Self {
        self.exports = exports;
        self
    }

    pub fn with_imports(mut self, imports: Vec<Import>) -> Self {
        self.imports = imports;
        self
    }

    /// Find the section holding `rva`
    pub fn section_for_rva(&self, rva: u32) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// Map an RVA to a file offset, or `None` outside every section.
    pub fn resolve_rva(&self, rva: u32) -> Option<usize> {
        let section = self.section_for_rva(rva)?;
        Some(section.raw_offset as usize + (rva - section.virtual_address) as usize)
    }
}

/// One section translated into absolute addresses and clamped to the file.
#[derive(Debug, Clone)]
struct MappedSection {
    range: Range<Address>,
    offset: usize,
    executable: bool,
    readable: bool,
}

/// Read-only view over the image bytes.
#[derive(Debug, Clone)]
pub struct ByteStore<'a> {
    image: &'a [u8],
    layout: &'a ImageLayout,
    mapped: Vec<MappedSection>,
}

impl<'a> ByteStore<'a> {
    /// Build the store and check the analysis preconditions.
    ///
    /// Fails when no executable section carries any bytes, or when the entry
    /// point lies outside every section.
    pub fn new(image: &'a [u8], layout: &'a ImageLayout) -> Result<Self, AnalysisError> {
        let mut mapped = Vec::new();
        for section in &layout.sections {
            let offset = section.raw_offset as usize;
            if offset >= image.len() || section.raw_size == 0 {
                continue;
            }
            let available = (image.len() - offset).min(section.raw_size as usize) as u32;
            let Some(start) = layout.image_base.checked_add(section.virtual_address) else {
                log::warn!("Section '{}' wraps the address space, ignoring", section.name);
                continue;
            };
            let end = start.saturating_add(available);
            mapped.push(MappedSection {
                range: start..end,
                offset,
                executable: section.is_executable(),
                readable: section.is_readable(),
            });
        }
        mapped.sort_by_key(|m| m.range.start);

        if !mapped.iter().any(|m| m.executable && !m.range.is_empty()) {
            return Err(AnalysisError::EmptyCodeRegion);
        }
        if layout.section_for_rva(layout.entry_point_rva).is_none() {
            return Err(AnalysisError::EntryPointOutsideSections(layout.entry_point_rva));
        }

        Ok(Self { image, layout, mapped })
    }

    pub fn layout(&self) -> &'a ImageLayout {
        self.layout
    }

    pub fn image_base(&self) -> Address {
        self.layout.image_base
    }

    /// Absolute address of an RVA
    pub fn va(&self, rva: u32) -> Address {
        self.layout.image_base.wrapping_add(rva)
    }

    /// Absolute address of the entry point
    pub fn entry_point(&self) -> Address {
        self.va(self.layout.entry_point_rva)
    }

    fn mapped_for(&self, addr: Address) -> Option<&MappedSection> {
        self.mapped.iter().find(|m| m.range.contains(&addr))
    }

    pub fn is_mapped(&self, addr: Address) -> bool {
        self.mapped_for(addr).is_some()
    }

    pub fn is_executable(&self, addr: Address) -> bool {
        self.mapped_for(addr).is_some_and(|m| m.executable)
    }

    pub fn is_readable(&self, addr: Address) -> bool {
        self.mapped_for(addr).is_some_and(|m| m.readable)
    }

    /// Absolute ranges of every executable section, ascending.
    pub fn executable_ranges(&self) -> Vec<Range<Address>> {
        self.mapped
            .iter()
            .filter(|m| m.executable)
            .map(|m| m.range.clone())
            .collect()
    }

    /// Smallest range covering every mapped section.
    ///
    /// Absolute operands outside this range are never treated as references.
    pub fn image_range(&self) -> Range<Address> {
        let start = self.mapped.iter().map(|m| m.range.start).min().unwrap_or(0);
        let end = self.mapped.iter().map(|m| m.range.end).max().unwrap_or(0);
        start..end
    }

    /// Bytes from `addr` to the end of its section, empty when unmapped.
    pub fn window(&self, addr: Address) -> &'a [u8] {
        match self.mapped_for(addr) {
            Some(m) => {
                let start = m.offset + (addr - m.range.start) as usize;
                let end = m.offset + (m.range.end - m.range.start) as usize;
                &self.image[start..end]
            }
            None => &[],
        }
    }

    pub fn byte(&self, addr: Address) -> Option<u8> {
        self.window(addr).first().copied()
    }

    /// Little-endian dword at `addr`, if all four bytes sit in one section.
    pub fn read_u32(&self, addr: Address) -> Option<u32> {
        let bytes = self.window(addr).get(..4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_section_layout() -> ImageLayout {
        ImageLayout::new(
            0x40_0000,
            0x1000,
            vec![
                Section::new(".text", 0x1000, 0x200, 0x10, IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE),
                Section::new(".data", 0x2000, 0x210, 0x08, IMAGE_SCN_MEM_READ),
            ],
        )
    }

    #[test]
    fn test_resolve_rva() {
        let layout = two_section_layout();
        assert_eq!(layout.resolve_rva(0x1000), Some(0x200));
        assert_eq!(layout.resolve_rva(0x100f), Some(0x20f));
        assert_eq!(layout.resolve_rva(0x1010), None);
        assert_eq!(layout.resolve_rva(0x2004), Some(0x214));
        assert_eq!(layout.resolve_rva(0x0fff), None);
    }

    #[test]
    fn test_windows_are_clamped_to_the_section() {
        let layout = two_section_layout();
        let mut image = vec![0u8; 0x218];
        image[0x20e] = 0xaa;
        image[0x20f] = 0xbb;
        let store = ByteStore::new(&image, &layout).unwrap();

        assert_eq!(store.window(0x40_100e), &[0xaa, 0xbb]);
        assert!(store.window(0x40_1010).is_empty());
        assert_eq!(store.read_u32(0x40_100e), None);
        assert_eq!(store.read_u32(0x40_2000), Some(0));
        assert!(store.is_executable(0x40_1000));
        assert!(!store.is_executable(0x40_2000));
        assert!(store.is_readable(0x40_2000));
        assert_eq!(store.executable_ranges(), vec![0x40_1000..0x40_1010]);
        assert_eq!(store.image_range(), 0x40_1000..0x40_2008);
    }

    #[test]
    fn test_truncated_file_shrinks_the_section() {
        let layout = two_section_layout();
        let image = vec![0x90u8; 0x204];
        let store = ByteStore::new(&image, &layout).unwrap();
        assert_eq!(store.executable_ranges(), vec![0x40_1000..0x40_1004]);
        assert!(!store.is_mapped(0x40_2000));
    }

    #[test]
    fn test_preconditions() {
        let layout = ImageLayout::new(0x40_0000, 0x1000, vec![]);
        assert!(matches!(
            ByteStore::new(&[0x90], &layout),
            Err(AnalysisError::EmptyCodeRegion)
        ));

        let mut layout = ImageLayout::flat(0x40_0000, 0x1000, 1);
        layout.entry_point_rva = 0x5000;
        assert!(matches!(
            ByteStore::new(&[0xc3], &layout),
            Err(AnalysisError::EntryPointOutsideSections(0x5000))
        ));
    }
}
