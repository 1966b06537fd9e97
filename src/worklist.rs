//! Deduplicated priority queue of addresses awaiting analysis.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Address;

/// How much the analysis trusts that an address starts code.
///
/// Ordered from least to most trusted; the worklist pops the most trusted
/// address first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Derived from data: an immediate or a reference found in guessed code
    Guess,
    /// Read out of a pointer table found in unclassified bytes
    TableEntry,
    /// Read out of a jump table used by decoded code
    ComputedJump,
    DirectJump,
    DirectCall,
    Export,
    Entry,
}

impl Confidence {
    /// Seeds at or below this level are probed before decoding, and the code
    /// they reach is flagged suspicious.
    pub fn is_speculative(self) -> bool {
        self <= Confidence::TableEntry
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Confidence::Guess => "guess",
            Confidence::TableEntry => "table entry",
            Confidence::ComputedJump => "computed jump",
            Confidence::DirectJump => "direct jump",
            Confidence::DirectCall => "direct call",
            Confidence::Export => "export",
            Confidence::Entry => "entry",
        };
        write!(f, "{}", name)
    }
}

/// Priority queue of pending addresses. Each address is queued at most once,
/// at the highest confidence it was pushed with.
#[derive(Debug, Clone, Default)]
pub struct Worklist {
    heap: BinaryHeap<(Confidence, Reverse<Address>)>,
    queued: HashMap<Address, Confidence>,
}

impl Worklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `addr`. Returns `false` when it is already queued at the same or
    /// a higher confidence.
    pub fn push(&mut self, addr: Address, confidence: Confidence) -> bool {
        match self.queued.get(&addr) {
            Some(&existing) if existing >= confidence => false,
            _ => {
                self.queued.insert(addr, confidence);
                self.heap.push((confidence, Reverse(addr)));
                true
            }
        }
    }

    /// Pop the most trusted address; ties go to the lowest address.
    pub fn pop(&mut self) -> Option<(Address, Confidence)> {
        while let Some((confidence, Reverse(addr))) = self.heap.pop() {
            // Stale heap entries left behind by a later, higher-confidence push
            if self.queued.get(&addr) == Some(&confidence) {
                self.queued.remove(&addr);
                return Some((addr, confidence));
            }
        }
        None
    }

    /// Withdraw `addr`. Returns `false` when it was not queued.
    pub fn remove(&mut self, addr: Address) -> bool {
        // The heap entry goes stale and `pop` skips it
        self.queued.remove(&addr).is_some()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.queued.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.queued.clear();
    }
}
