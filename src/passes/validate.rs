//! Code-block validation.
//!
//! Code reached only through speculative seeds is reviewed block by block.
//! A block whose bytes do not look like machine code is turned back into
//! data and the relationships it created are dropped.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::decoder::Decoder;
use crate::image::ByteStore;
use crate::index::AddressIndex;
use crate::map::{ByteFlags, ClassificationMap, DataClass};
use crate::Address;

/// Blocks where more than this share of bytes are ASCII letters read as text.
pub const MAX_LETTER_FRACTION_PERCENT: usize = 50;

/// Blocks where more than this share of bytes are `00..=03` read as
/// zero-padded integers.
pub const MAX_LOW_BYTE_FRACTION_PERCENT: usize = 40;

/// Fewer instructions per hundred bytes than this is implausible.
pub const MIN_INSTRUCTION_DENSITY_PERCENT: usize = 15;

/// Statistical signature of a block of decoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeSignature {
    pub bytes: usize,
    pub instructions: usize,
    /// Bytes in `A..=Z` or `a..=z`
    pub letters: usize,
    /// Bytes in `00..=03`
    pub low_bytes: usize,
    /// Returns and unconditional jumps
    pub terminators: usize,
    /// The block runs straight into confirmed code
    pub flows_into_code: bool,
}

impl CodeSignature {
    fn percent(part: usize, whole: usize) -> usize {
        if whole == 0 {
            0
        } else {
            part * 100 / whole
        }
    }

    pub fn letter_percent(&self) -> usize {
        Self::percent(self.letters, self.bytes)
    }

    pub fn low_byte_percent(&self) -> usize {
        Self::percent(self.low_bytes, self.bytes)
    }

    pub fn density_percent(&self) -> usize {
        Self::percent(self.instructions, self.bytes)
    }

    /// The one scoring rule for decoded blocks: a block is kept when it ends
    /// somewhere, is not mostly text or padding, and is dense enough.
    pub fn is_plausible(&self) -> bool {
        (self.terminators > 0 || self.flows_into_code)
            && self.letter_percent() <= MAX_LETTER_FRACTION_PERCENT
            && self.low_byte_percent() <= MAX_LOW_BYTE_FRACTION_PERCENT
            && self.density_percent() >= MIN_INSTRUCTION_DENSITY_PERCENT
    }
}

/// Outcome of one validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub blocks_reviewed: usize,
    pub blocks_reclassified: usize,
    pub bytes_reclassified: usize,
}

fn is_suspicious_start(flags: ByteFlags) -> bool {
    flags.is_instruction_start() && flags.contains(ByteFlags::SUSPICIOUS_START) && !flags.is_anchored()
}

/// Maximal runs of contiguous suspicious instructions.
fn suspicious_blocks(map: &ClassificationMap) -> Vec<Range<Address>> {
    let mut blocks: Vec<Range<Address>> = Vec::new();
    for start in map.instruction_starts() {
        if !is_suspicious_start(map.get(start)) {
            continue;
        }
        let end = map.instruction_end(start);
        match blocks.last_mut() {
            Some(block) if block.end == start => block.end = end,
            _ => blocks.push(start..end),
        }
    }
    blocks
}

/// Compute the signature of `block` by re-decoding its instructions.
pub fn signature(
    store: &ByteStore<'_>,
    decoder: &dyn Decoder,
    map: &ClassificationMap,
    block: Range<Address>,
) -> CodeSignature {
    let mut sig = CodeSignature {
        bytes: block.len(),
        flows_into_code: map.get(block.end).is_instruction_start(),
        ..CodeSignature::default()
    };
    for addr in block.clone() {
        let b = store.byte(addr).unwrap_or(0);
        if b.is_ascii_alphabetic() {
            sig.letters += 1;
        }
        if b <= 0x03 {
            sig.low_bytes += 1;
        }
    }
    let mut at = block.start;
    while at < block.end {
        match decoder.decode(store.window(at), at) {
            Ok(insn) => {
                sig.instructions += 1;
                if insn.is_terminator() {
                    sig.terminators += 1;
                }
                at = insn.end();
            }
            Err(_) => break,
        }
    }
    sig
}

/// Review every suspicious block and reclassify the implausible ones.
pub fn run(
    store: &ByteStore<'_>,
    decoder: &dyn Decoder,
    map: &mut ClassificationMap,
    index: &mut AddressIndex,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    for block in suspicious_blocks(map) {
        report.blocks_reviewed += 1;
        let sig = signature(store, decoder, map, block.clone());
        if sig.is_plausible() {
            continue;
        }
        log::debug!(
            "Reclassifying 0x{:08x}..0x{:08x} as data: {:?}",
            block.start,
            block.end,
            sig
        );
        index.remove_positions_in(block.clone());
        map.clear_range(block.clone());
        map.mark_data(block.clone(), DataClass::Raw);
        report.blocks_reclassified += 1;
        report.bytes_reclassified += block.len();
    }
    report
}
