//! Final listing pass: re-walk the classification map and decode every
//! instruction start for the renderer.

use crate::decoder::{DecodedInstruction, Decoder};
use crate::image::ByteStore;
use crate::map::ClassificationMap;
use crate::Address;

/// Decode every instruction start in ascending address order.
///
/// Starts that no longer decode to the length recorded in the map are
/// skipped with a warning.
pub fn build(
    store: &ByteStore<'_>,
    decoder: &dyn Decoder,
    map: &ClassificationMap,
) -> Vec<(Address, DecodedInstruction)> {
    let mut listing = Vec::new();
    for start in map.instruction_starts() {
        match decoder.decode(store.window(start), start) {
            Ok(insn) if insn.end() == map.instruction_end(start) => listing.push((start, insn)),
            Ok(insn) => log::warn!(
                "Instruction at 0x{:08x} decodes to {} bytes, map says {}",
                start,
                insn.length,
                map.instruction_end(start) - start
            ),
            Err(e) => log::warn!("Instruction at 0x{:08x} no longer decodes: {}", start, e),
        }
    }
    listing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{CpuMode, X86Decoder};
    use crate::image::ImageLayout;
    use crate::map::ByteFlags;

    #[test]
    fn test_listing_follows_the_map() {
        let image = [0x55, 0x8b, 0xec, 0xc3, 0xc3];
        let layout = ImageLayout::flat(0x40_0000, 0x1000, image.len() as u32);
        let store = ByteStore::new(&image, &layout).unwrap();
        let decoder = X86Decoder::for_store(&store, CpuMode::Bits32);
        let mut map = ClassificationMap::for_store(&store);
        map.or(0x40_1000, ByteFlags::INSTRUCTION_START);
        map.or(0x40_1001, ByteFlags::INSTRUCTION_START);
        map.or(0x40_1002, ByteFlags::INSTRUCTION_BODY);
        map.or(0x40_1003, ByteFlags::INSTRUCTION_START);
        // Wrong length on purpose: ret is one byte
        map.or(0x40_1004, ByteFlags::INSTRUCTION_BODY);

        let listing = build(&store, &decoder, &map);
        let starts: Vec<Address> = listing.iter().map(|(a, _)| *a).collect();
        assert_eq!(starts, vec![0x40_1000, 0x40_1001]);
        assert_eq!(listing[1].1.length, 2);
    }
}
