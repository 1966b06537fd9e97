//! Classification map: one flag set per byte of the executable sections.

use std::fmt;
use std::ops::{BitOr, BitOrAssign, Range};

use serde::{Deserialize, Serialize};

use crate::image::ByteStore;
use crate::Address;

/// Per-byte classification flags. Several flags may be set at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ByteFlags(u16);

impl ByteFlags {
    pub const UNPROCESSED: Self = Self(0);
    pub const INSTRUCTION_START: Self = Self(1 << 0);
    /// Instruction start reached only through a low-confidence seed
    pub const SUSPICIOUS_START: Self = Self(1 << 1);
    pub const INSTRUCTION_BODY: Self = Self(1 << 2);
    pub const DATA_BYTE: Self = Self(1 << 3);
    /// Something references this byte
    pub const LABEL_HERE: Self = Self(1 << 4);
    /// A referenced byte that was decoded as an instruction start
    pub const LABEL_RESOLVED: Self = Self(1 << 5);
    pub const ENTRY_MARK: Self = Self(1 << 6);
    pub const ANCHOR_MARK: Self = Self(1 << 7);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_code(self) -> bool {
        self.intersects(Self(Self::INSTRUCTION_START.0 | Self::INSTRUCTION_BODY.0))
    }

    pub const fn is_instruction_start(self) -> bool {
        self.contains(Self::INSTRUCTION_START)
    }

    pub const fn is_body(self) -> bool {
        self.contains(Self::INSTRUCTION_BODY)
    }

    pub const fn is_data(self) -> bool {
        self.contains(Self::DATA_BYTE)
    }

    pub const fn is_label(self) -> bool {
        self.intersects(Self(Self::LABEL_HERE.0 | Self::LABEL_RESOLVED.0))
    }

    /// Entry point or anchor; recovery never erases these.
    pub const fn is_anchored(self) -> bool {
        self.intersects(Self(Self::ENTRY_MARK.0 | Self::ANCHOR_MARK.0))
    }

    /// The primary kind of the byte, ignoring label and anchor marks.
    pub const fn kind(self) -> ByteKind {
        if self.is_instruction_start() {
            ByteKind::InstructionStart
        } else if self.is_body() {
            ByteKind::InstructionBody
        } else if self.is_data() {
            ByteKind::DataByte
        } else {
            ByteKind::Unprocessed
        }
    }
}

impl BitOr for ByteFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ByteFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Primary kind of a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteKind {
    Unprocessed,
    InstructionStart,
    InstructionBody,
    DataByte,
}

impl fmt::Display for ByteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteKind::Unprocessed => write!(f, "unprocessed"),
            ByteKind::InstructionStart | ByteKind::InstructionBody => write!(f, "code"),
            ByteKind::DataByte => write!(f, "data"),
        }
    }
}

/// What the data passes decided a byte is (the touch map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    #[default]
    None,
    PointerTable,
    AsciiString,
    PascalString,
    WideString,
    /// Reclassified or backfilled raw data
    Raw,
}

/// Coalesced run of bytes with the same kind and data class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRun {
    pub start: Address,
    pub end: Address,
    pub kind: ByteKind,
    pub data_class: DataClass,
}

/// Flags and touch classes of one contiguous stretch of executable bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    base: Address,
    flags: Vec<ByteFlags>,
    touch: Vec<DataClass>,
}

impl Segment {
    fn new(range: Range<Address>) -> Self {
        let len = range.end.saturating_sub(range.start) as usize;
        Self {
            base: range.start,
            flags: vec![ByteFlags::UNPROCESSED; len],
            touch: vec![DataClass::None; len],
        }
    }

    fn range(&self) -> Range<Address> {
        self.base..self.base + self.flags.len() as Address
    }
}

/// Flags and touch classes for every byte of the executable sections.
///
/// Storage is kept per section, so the holes between sections cost nothing.
/// Addresses outside the map read as raw data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationMap {
    /// Disjoint, ascending
    segments: Vec<Segment>,
}

impl ClassificationMap {
    /// Zeroed map covering `range`
    pub fn new(range: Range<Address>) -> Self {
        Self::from_ranges([range])
    }

    /// Zeroed map covering every range; overlapping and touching ranges are
    /// merged.
    pub fn from_ranges(ranges: impl IntoIterator<Item = Range<Address>>) -> Self {
        let mut ranges: Vec<Range<Address>> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<Address>> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        Self {
            segments: merged.into_iter().map(Segment::new).collect(),
        }
    }

    /// Map over the executable sections of `store`.
    ///
    /// Bytes an earlier non-executable section shadows are not code and
    /// start out as data.
    pub fn for_store(store: &ByteStore<'_>) -> Self {
        let mut map = Self::from_ranges(store.executable_ranges());
        let shadowed: Vec<Address> = map
            .iter()
            .map(|(addr, _)| addr)
            .filter(|&addr| !store.is_executable(addr))
            .collect();
        for addr in shadowed {
            map.mark_data(addr..addr + 1, DataClass::Raw);
        }
        map
    }

    /// Covered address ranges, ascending
    pub fn ranges(&self) -> impl Iterator<Item = Range<Address>> + '_ {
        self.segments.iter().map(Segment::range)
    }

    /// Number of covered bytes
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.flags.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.flags.is_empty())
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.slot(addr).is_some()
    }

    /// Segment and offset holding `addr`
    fn slot(&self, addr: Address) -> Option<(usize, usize)> {
        let seg = self.segments.partition_point(|s| s.base <= addr).checked_sub(1)?;
        let offset = (addr - self.segments[seg].base) as usize;
        (offset < self.segments[seg].flags.len()).then_some((seg, offset))
    }

    pub fn get(&self, addr: Address) -> ByteFlags {
        match self.slot(addr) {
            Some((s, i)) => self.segments[s].flags[i],
            None => ByteFlags::DATA_BYTE,
        }
    }

    pub fn set(&mut self, addr: Address, flags: ByteFlags) {
        if let Some((s, i)) = self.slot(addr) {
            self.segments[s].flags[i] = flags;
        }
    }

    pub fn or(&mut self, addr: Address, flags: ByteFlags) {
        if let Some((s, i)) = self.slot(addr) {
            self.segments[s].flags[i] |= flags;
        }
    }

    pub fn and_not(&mut self, addr: Address, flags: ByteFlags) {
        if let Some((s, i)) = self.slot(addr) {
            let slot = &mut self.segments[s].flags[i];
            *slot = slot.without(flags);
        }
    }

    pub fn touch(&self, addr: Address) -> DataClass {
        match self.slot(addr) {
            Some((s, i)) => self.segments[s].touch[i],
            None => DataClass::Raw,
        }
    }

    /// Mark `range` as data of the given class.
    pub fn mark_data(&mut self, range: Range<Address>, class: DataClass) {
        for addr in range {
            if let Some((s, i)) = self.slot(addr) {
                self.segments[s].flags[i] |= ByteFlags::DATA_BYTE;
                self.segments[s].touch[i] = class;
            }
        }
    }

    /// Reset `range` to unprocessed, dropping every flag and touch class.
    pub fn clear_range(&mut self, range: Range<Address>) {
        for addr in range {
            if let Some((s, i)) = self.slot(addr) {
                self.segments[s].flags[i] = ByteFlags::UNPROCESSED;
                self.segments[s].touch[i] = DataClass::None;
            }
        }
    }

    /// Whether every byte of `range` is inside the map and unprocessed.
    pub fn is_unprocessed(&self, range: Range<Address>) -> bool {
        !range.is_empty()
            && range
                .into_iter()
                .all(|a| self.contains(a) && self.get(a).kind() == ByteKind::Unprocessed)
    }

    /// Iterate `(address, flags)` in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (Address, ByteFlags)> + '_ {
        self.segments.iter().flat_map(|s| {
            s.flags
                .iter()
                .enumerate()
                .map(move |(i, f)| (s.base + i as Address, *f))
        })
    }

    /// Addresses of every instruction start, ascending.
    pub fn instruction_starts(&self) -> impl Iterator<Item = Address> + '_ {
        self.iter()
            .filter(|(_, f)| f.is_instruction_start())
            .map(|(a, _)| a)
    }

    /// End of the instruction starting at `start`.
    pub fn instruction_end(&self, start: Address) -> Address {
        let mut end = start.saturating_add(1);
        while self.contains(end) && self.get(end).is_body() {
            end += 1;
        }
        end
    }

    /// Number of bytes of each primary kind.
    pub fn count(&self, kind: ByteKind) -> usize {
        self.segments
            .iter()
            .flat_map(|s| s.flags.iter())
            .filter(|f| f.kind() == kind)
            .count()
    }

    /// Number of bytes carrying the given data class.
    pub fn count_class(&self, class: DataClass) -> usize {
        self.segments
            .iter()
            .flat_map(|s| s.touch.iter())
            .filter(|c| **c == class)
            .count()
    }

    /// Coalesce the map into runs. Code bytes form one run per contiguous
    /// stretch of instructions.
    pub fn runs(&self) -> Vec<ClassRun> {
        let mut runs: Vec<ClassRun> = Vec::new();
        for (addr, flags) in self.iter() {
            let kind = match flags.kind() {
                ByteKind::InstructionBody => ByteKind::InstructionStart,
                other => other,
            };
            let data_class = self.touch(addr);
            match runs.last_mut() {
                Some(run) if run.kind == kind && run.data_class == data_class && run.end == addr => {
                    run.end = addr + 1;
                }
                _ => runs.push(ClassRun {
                    start: addr,
                    end: addr + 1,
                    kind,
                    data_class,
                }),
            }
        }
        runs
    }
}

/// Whether `addr` may be the start of code.
///
/// The address has to be inside an executable section and must not already
/// be decided as data or as the middle of an instruction.
pub fn is_good_address(store: &ByteStore<'_>, map: &ClassificationMap, addr: Address) -> bool {
    if !store.is_executable(addr) || !map.contains(addr) {
        return false;
    }
    let flags = map.get(addr);
    !flags.is_data() && !(flags.is_body() && !flags.is_instruction_start())
}
