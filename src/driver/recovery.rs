//! Erase-uncertain recovery.
//!
//! When an attempt ends in a conflict, the code it just laid down is no
//! longer trusted. The span around the failing cursor is reset to
//! unprocessed and every relationship that starts inside it is dropped.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::decoder::DecodeFailure;
use crate::map::ClassificationMap;
use crate::Address;

/// Why an attempt stopped with a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    #[error("decode failed: {0}")]
    DecodeFailure(DecodeFailure),
    /// The instruction would cover bytes already decided
    #[error("instruction overlaps classified bytes")]
    Overlap,
    /// The instruction would cover an entry or anchor byte
    #[error("instruction swallows an anchored boundary")]
    SwallowsAnchor,
    #[error("cursor lands inside an existing instruction")]
    StartInsideInstruction,
}

/// One erased span, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasedSpan {
    pub start: Address,
    pub end: Address,
    /// Where the conflict was detected
    pub cursor: Address,
    /// Seed of the failing attempt
    pub seed: Address,
    pub kind: ConflictKind,
    /// Relationships dropped with the span
    pub relations_removed: usize,
}

impl ErasedSpan {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// The span to erase for a conflict at `cursor` in an attempt seeded at
/// `seed`, and whether an anchored instruction cut the walk short.
///
/// Walking backward covers code bytes and stops at the seed or at a labelled
/// instruction start (both included), or just after an anchored instruction
/// (never included). Walking forward covers code bytes up to the next
/// labelled or anchored start, or the first byte that is not code. Both ends
/// fall on instruction boundaries.
pub(crate) fn erase_span(
    map: &ClassificationMap,
    seed: Address,
    cursor: Address,
) -> (Range<Address>, bool) {
    let floor = seed.min(cursor);
    let mut start = cursor;
    let mut anchored = false;
    while start > floor {
        let prev = start - 1;
        let flags = map.get(prev);
        if !flags.is_code() {
            break;
        }
        if flags.is_instruction_start() && flags.is_anchored() {
            // Keep the whole anchored instruction, body included
            start = map.instruction_end(prev).min(cursor);
            anchored = true;
            break;
        }
        start = prev;
        if flags.is_instruction_start() && flags.is_label() {
            break;
        }
    }

    let mut end = cursor;
    while map.contains(end) {
        let flags = map.get(end);
        if !flags.is_code() || flags.is_anchored() {
            break;
        }
        if end != cursor && flags.is_instruction_start() && flags.is_label() {
            break;
        }
        end += 1;
    }

    (start..end.max(start), anchored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::ByteFlags;

    /// Marks `[start, start + len)` as one instruction.
    fn instruction(map: &mut ClassificationMap, start: Address, len: Address, extra: ByteFlags) {
        map.or(start, ByteFlags::INSTRUCTION_START | extra);
        for b in start + 1..start + len {
            map.or(b, ByteFlags::INSTRUCTION_BODY);
        }
    }

    #[test]
    fn test_walks_back_to_the_seed() {
        let mut map = ClassificationMap::new(0x1000..0x1020);
        instruction(&mut map, 0x1000, 2, ByteFlags::UNPROCESSED);
        instruction(&mut map, 0x1002, 3, ByteFlags::UNPROCESSED);
        instruction(&mut map, 0x1005, 1, ByteFlags::UNPROCESSED);

        let (span, anchored) = erase_span(&map, 0x1002, 0x1006);
        assert_eq!(span, 0x1002..0x1006);
        assert!(!anchored);
    }

    #[test]
    fn test_stops_at_a_label_inclusive() {
        let mut map = ClassificationMap::new(0x1000..0x1020);
        instruction(&mut map, 0x1000, 2, ByteFlags::UNPROCESSED);
        instruction(&mut map, 0x1002, 2, ByteFlags::LABEL_RESOLVED);
        instruction(&mut map, 0x1004, 2, ByteFlags::UNPROCESSED);

        let (span, _) = erase_span(&map, 0x1000, 0x1006);
        assert_eq!(span, 0x1002..0x1006);
    }

    #[test]
    fn test_never_erases_an_anchored_instruction() {
        let mut map = ClassificationMap::new(0x1000..0x1020);
        instruction(&mut map, 0x1000, 5, ByteFlags::ENTRY_MARK);
        instruction(&mut map, 0x1005, 2, ByteFlags::UNPROCESSED);

        let (span, anchored) = erase_span(&map, 0x1000, 0x1007);
        assert_eq!(span, 0x1005..0x1007);
        assert!(anchored);

        // Failing right after the anchored instruction leaves nothing to erase
        let mut map = ClassificationMap::new(0x1000..0x1020);
        instruction(&mut map, 0x1000, 5, ByteFlags::ANCHOR_MARK);
        let (span, anchored) = erase_span(&map, 0x1000, 0x1005);
        assert!(span.is_empty());
        assert!(anchored);
    }

    #[test]
    fn test_forward_walk_covers_whole_instructions() {
        let mut map = ClassificationMap::new(0x1000..0x1020);
        instruction(&mut map, 0x1000, 3, ByteFlags::UNPROCESSED);
        instruction(&mut map, 0x1003, 2, ByteFlags::UNPROCESSED);
        instruction(&mut map, 0x1005, 2, ByteFlags::LABEL_HERE);

        // Conflict detected inside the instruction at 0x1000
        let (span, _) = erase_span(&map, 0x1000, 0x1001);
        assert_eq!(span, 0x1000..0x1005);
    }

    #[test]
    fn test_nothing_decoded_gives_an_empty_span() {
        let map = ClassificationMap::new(0x1000..0x1020);
        let (span, anchored) = erase_span(&map, 0x1004, 0x1004);
        assert!(span.is_empty());
        assert!(!anchored);
    }
}
