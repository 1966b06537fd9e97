//! Dual-keyed address index.
//!
//! Every relationship is stored twice: `(class, position, reference)` and
//! `(-class, reference, position)`. Both halves live in two ordered sets, one
//! keyed by position and one keyed by reference, so every question ("who
//! points here", "what does this point to") is a range query.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::Address;

/// Kind of relationship between two addresses.
///
/// Negative tags mark the reverse half of a dual entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefClass(i8);

impl RefClass {
    /// Direct call target
    pub const CALL_TARGET: Self = Self(1);
    /// Unconditional direct jump target
    pub const JUMP_TARGET: Self = Self(2);
    /// Conditional branch or loop target
    pub const BRANCH_TARGET: Self = Self(3);
    /// Absolute memory operand in a readable section
    pub const DATA_REFERENCE: Self = Self(4);
    /// Slot of a pointer table -> code address it holds
    pub const TABLE_ENTRY: Self = Self(5);
    /// Indirect jump -> base of its jump table
    pub const JUMP_TABLE: Self = Self(6);
    /// Indirect call/jump -> import address table slot
    pub const IMPORT_BINDING: Self = Self(7);
    /// Immediate operand that looks like a code address
    pub const IMMEDIATE_POINTER: Self = Self(8);

    const MIN: Self = Self(i8::MIN);
    const MAX: Self = Self(i8::MAX);

    pub const fn new(tag: i8) -> Self {
        Self(tag)
    }

    pub const fn tag(self) -> i8 {
        self.0
    }

    pub const fn reversed(self) -> Self {
        Self(self.0.wrapping_neg())
    }

    pub const fn is_reverse(self) -> bool {
        self.0 < 0
    }

    /// The forward class of either half
    pub const fn forward(self) -> Self {
        if self.is_reverse() {
            self.reversed()
        } else {
            self
        }
    }

    pub fn name(self) -> &'static str {
        match self.forward() {
            Self::CALL_TARGET => "call",
            Self::JUMP_TARGET => "jump",
            Self::BRANCH_TARGET => "branch",
            Self::DATA_REFERENCE => "data",
            Self::TABLE_ENTRY => "table_entry",
            Self::JUMP_TABLE => "jump_table",
            Self::IMPORT_BINDING => "import",
            Self::IMMEDIATE_POINTER => "immediate",
            _ => "unknown",
        }
    }
}

impl fmt::Display for RefClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_reverse() {
            write!(f, "{}<-", self.name())
        } else {
            write!(f, "{}", self.name())
        }
    }
}

/// One half of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub class: RefClass,
    pub position: Address,
    pub reference: Address,
}

impl IndexEntry {
    pub fn new(class: RefClass, position: Address, reference: Address) -> Self {
        Self {
            class,
            position,
            reference,
        }
    }

    /// The other half of the dual entry
    pub fn partner(&self) -> Self {
        Self::new(self.class.reversed(), self.reference, self.position)
    }
}

impl fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x} -{}-> 0x{:08x}", self.position, self.class, self.reference)
    }
}

/// Ordered dual-keyed index of address relationships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressIndex {
    /// (position, reference, class)
    by_position: BTreeSet<(Address, Address, RefClass)>,
    /// (reference, position, class)
    by_reference: BTreeSet<(Address, Address, RefClass)>,
}

impl AddressIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_one(&mut self, e: IndexEntry) -> bool {
        let fresh = self.by_position.insert((e.position, e.reference, e.class));
        self.by_reference.insert((e.reference, e.position, e.class));
        fresh
    }

    fn remove_one(&mut self, e: IndexEntry) -> bool {
        let removed = self.by_position.remove(&(e.position, e.reference, e.class));
        self.by_reference.remove(&(e.reference, e.position, e.class));
        removed
    }

    /// Insert a relationship in both directions.
    ///
    /// Returns `false` when the relationship was already present.
    pub fn insert_dual(&mut self, class: RefClass, position: Address, reference: Address) -> bool {
        let entry = IndexEntry::new(class, position, reference);
        let fresh = self.insert_one(entry);
        self.insert_one(entry.partner());
        fresh
    }

    /// Remove a relationship in both directions.
    ///
    /// Removing a missing relationship is a no-op and returns `false`.
    pub fn delete_dual(&mut self, class: RefClass, position: Address, reference: Address) -> bool {
        let entry = IndexEntry::new(class, position, reference);
        let removed = self.remove_one(entry);
        let partner_removed = self.remove_one(entry.partner());
        if removed != partner_removed {
            log::trace!("Index held only one half of {}", entry);
        }
        removed || partner_removed
    }

    pub fn contains(&self, class: RefClass, position: Address, reference: Address) -> bool {
        self.by_position.contains(&(position, reference, class))
    }

    /// First entry positioned at `position`
    pub fn find_by_position(&self, position: Address) -> Option<IndexEntry> {
        self.entries_at(position).next()
    }

    /// First entry referencing `reference`
    pub fn find_by_reference(&self, reference: Address) -> Option<IndexEntry> {
        self.references_to(reference).next()
    }

    /// Every entry positioned at `position`, ordered by reference.
    pub fn entries_at(&self, position: Address) -> impl Iterator<Item = IndexEntry> + '_ {
        self.by_position
            .range((position, Address::MIN, RefClass::MIN)..=(position, Address::MAX, RefClass::MAX))
            .map(|&(p, r, c)| IndexEntry::new(c, p, r))
    }

    /// Every entry whose reference is `reference`, ordered by position.
    pub fn references_to(&self, reference: Address) -> impl Iterator<Item = IndexEntry> + '_ {
        self.by_reference
            .range((reference, Address::MIN, RefClass::MIN)..=(reference, Address::MAX, RefClass::MAX))
            .map(|&(r, p, c)| IndexEntry::new(c, p, r))
    }

    /// Every entry positioned inside `range`
    pub fn entries_in(&self, range: Range<Address>) -> impl Iterator<Item = IndexEntry> + '_ {
        self.by_position
            .range((range.start, Address::MIN, RefClass::MIN)..(range.end, Address::MIN, RefClass::MIN))
            .map(|&(p, r, c)| IndexEntry::new(c, p, r))
    }

    /// Every entry of exactly this class (forward or reverse half).
    pub fn find_by_class(&self, class: RefClass) -> impl Iterator<Item = IndexEntry> + '_ {
        self.iter().filter(move |e| e.class == class)
    }

    /// Every entry in (position, reference) order
    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.by_position
            .iter()
            .map(|&(p, r, c)| IndexEntry::new(c, p, r))
    }

    /// Drop every forward relationship positioned inside `range`, together
    /// with its reverse half. Reverse halves positioned inside the range
    /// belong to relationships that start elsewhere and are kept.
    ///
    /// Returns the forward halves of the removed relationships.
    pub fn remove_positions_in(&mut self, range: Range<Address>) -> Vec<IndexEntry> {
        let doomed: Vec<IndexEntry> = self
            .entries_in(range)
            .filter(|e| !e.class.is_reverse())
            .collect();
        for e in &doomed {
            self.delete_dual(e.class, e.position, e.reference);
        }
        doomed
    }

    /// Number of stored halves
    pub fn len(&self) -> usize {
        self.by_position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_position.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dual_symmetry() {
        let mut index = AddressIndex::new();
        assert!(index.insert_dual(RefClass::CALL_TARGET, 0x1000, 0x2000));

        assert!(index
            .entries_at(0x1000)
            .any(|e| e.reference == 0x2000 && e.class == RefClass::CALL_TARGET));
        assert!(index
            .references_to(0x2000)
            .any(|e| e.position == 0x1000 && e.class == RefClass::CALL_TARGET));
        assert_eq!(
            index.find_by_position(0x2000),
            Some(IndexEntry::new(RefClass::CALL_TARGET.reversed(), 0x2000, 0x1000))
        );
        assert_eq!(index.len(), 2);

        assert!(index.delete_dual(RefClass::CALL_TARGET, 0x1000, 0x2000));
        assert_eq!(index.find_by_position(0x1000), None);
        assert_eq!(index.find_by_reference(0x2000), None);
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_is_idempotent_and_missing_delete_is_a_no_op() {
        let mut index = AddressIndex::new();
        assert!(index.insert_dual(RefClass::JUMP_TARGET, 0x10, 0x20));
        assert!(!index.insert_dual(RefClass::JUMP_TARGET, 0x10, 0x20));
        assert_eq!(index.len(), 2);

        assert!(!index.delete_dual(RefClass::JUMP_TARGET, 0x10, 0x30));
        assert!(!index.delete_dual(RefClass::CALL_TARGET, 0x10, 0x20));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_find_by_class() {
        let mut index = AddressIndex::new();
        index.insert_dual(RefClass::TABLE_ENTRY, 0x100, 0x1000);
        index.insert_dual(RefClass::TABLE_ENTRY, 0x104, 0x1010);
        index.insert_dual(RefClass::CALL_TARGET, 0x1000, 0x1010);

        assert_eq!(index.find_by_class(RefClass::TABLE_ENTRY).count(), 2);
        assert_eq!(index.find_by_class(RefClass::TABLE_ENTRY.reversed()).count(), 2);
        assert_eq!(index.references_to(0x1010).count(), 2);
    }

    #[test]
    fn test_remove_positions_in_keeps_incoming_references() {
        let mut index = AddressIndex::new();
        // 0x50 calls into the erased range, 0x104 jumps out of it
        index.insert_dual(RefClass::CALL_TARGET, 0x50, 0x100);
        index.insert_dual(RefClass::JUMP_TARGET, 0x104, 0x200);

        assert_eq!(
            index.remove_positions_in(0x100..0x110),
            vec![IndexEntry::new(RefClass::JUMP_TARGET, 0x104, 0x200)]
        );
        assert!(index.contains(RefClass::CALL_TARGET, 0x50, 0x100));
        assert!(!index.contains(RefClass::JUMP_TARGET, 0x104, 0x200));
        assert_eq!(index.find_by_reference(0x200), None);
    }
}
