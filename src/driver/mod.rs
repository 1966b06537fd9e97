//! Heuristic disassembly driver.
//!
//! The driver owns the classification map, the address index and the
//! worklist for one image. It runs a small state machine:
//!
//! * `Preprocessing` pops the most trusted pending address and decodes
//!   forward from it, marking bytes and scheduling every target it finds.
//! * `Recovering` erases the span around a failed attempt.
//! * `Finalizing` runs the post-processing passes once.
//! * `Done` is terminal.

pub mod recovery;

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::{AnalysisConfig, CancelToken};
use crate::decoder::{DecodedInstruction, Decoder, FlowKind};
use crate::image::ByteStore;
use crate::index::{AddressIndex, RefClass};
use crate::map::{is_good_address, ByteFlags, ByteKind, ClassificationMap, DataClass};
use crate::passes::{self, address_tables, strings, validate};
use crate::worklist::{Confidence, Worklist};
use crate::Address;

pub use self::recovery::{ConflictKind, ErasedSpan};

/// Instructions a speculative seed has to decode cleanly before it is
/// trusted, unless a terminator comes first.
pub const PROBE_INSTRUCTIONS: usize = 4;

/// Upper bound on the entries read from one jump table.
pub const MAX_JUMP_TABLE_ENTRIES: u32 = 256;

/// Driver states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Preprocessing,
    Recovering,
    Finalizing,
    Done,
}

/// Which phase an attempt belongs to. Finalizing attempts decode table
/// targets without scheduling anything new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassMode {
    Preprocessing,
    Finalizing,
}

/// State of one decode attempt.
#[derive(Debug, Clone)]
struct Session {
    start: Address,
    cursor: Address,
    consumed: usize,
    mode: PassMode,
    confidence: Confidence,
    last_error: Option<ConflictKind>,
}

impl Session {
    fn new(start: Address, confidence: Confidence, mode: PassMode) -> Self {
        Self {
            start,
            cursor: start,
            consumed: 0,
            mode,
            confidence,
            last_error: None,
        }
    }
}

/// Counters describing one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStats {
    /// Decode attempts started
    pub attempts: usize,
    pub instructions_decoded: usize,
    pub recoveries: usize,
    pub bytes_erased: usize,
    pub relations_erased: usize,
    /// Recoveries cut short by an entry or anchor
    pub anchor_conflicts: usize,
    /// Speculative seeds that failed their probe
    pub rejected_seeds: usize,
    pub jump_tables: usize,
    pub address_tables: usize,
    pub strings: usize,
    pub code_blocks_reclassified: usize,
    pub code_bytes_reclassified: usize,
    pub bytes_backfilled: usize,
    pub cancelled: bool,
}

/// Everything the driver leaves behind once it is done.
#[derive(Debug, Clone)]
pub struct DriverOutput {
    pub map: ClassificationMap,
    pub index: AddressIndex,
    pub stats: AnalysisStats,
    pub erase_history: Vec<ErasedSpan>,
}

/// The heuristic disassembly driver for one image.
pub struct Driver<'a> {
    store: &'a ByteStore<'a>,
    decoder: &'a dyn Decoder,
    config: &'a AnalysisConfig,
    cancel: Option<CancelToken>,
    map: ClassificationMap,
    index: AddressIndex,
    worklist: Worklist,
    state: DriverState,
    /// Seeds whose attempt failed; never scheduled again
    failed_seeds: HashSet<Address>,
    /// Absolute addresses of import address table slots
    import_slots: HashSet<Address>,
    failed: Option<Session>,
    stats: AnalysisStats,
    history: VecDeque<ErasedSpan>,
}

impl<'a> Driver<'a> {
    /// Create a driver with the entry point and exports already seeded.
    pub fn new(store: &'a ByteStore<'a>, decoder: &'a dyn Decoder, config: &'a AnalysisConfig) -> Self {
        let import_slots = store
            .layout()
            .imports
            .iter()
            .map(|i| store.va(i.slot_rva))
            .collect();
        let mut driver = Self {
            store,
            decoder,
            config,
            cancel: None,
            map: ClassificationMap::for_store(store),
            index: AddressIndex::new(),
            worklist: Worklist::new(),
            state: DriverState::Preprocessing,
            failed_seeds: HashSet::new(),
            import_slots,
            failed: None,
            stats: AnalysisStats::default(),
            history: VecDeque::new(),
        };
        driver.seed();
        driver
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn map(&self) -> &ClassificationMap {
        &self.map
    }

    pub fn index(&self) -> &AddressIndex {
        &self.index
    }

    pub fn stats(&self) -> &AnalysisStats {
        &self.stats
    }

    pub fn pending(&self) -> usize {
        self.worklist.len()
    }

    fn seed(&mut self) {
        let entry = self.store.entry_point();
        if self.store.is_executable(entry) {
            self.map.or(entry, ByteFlags::ENTRY_MARK | ByteFlags::LABEL_HERE);
            self.worklist.push(entry, Confidence::Entry);
        } else {
            log::warn!("Entry point 0x{:08x} is not in an executable section", entry);
        }

        for export in &self.store.layout().exports {
            let addr = self.store.va(export.rva);
            if !self.store.is_executable(addr) {
                log::debug!("Export '{}' at 0x{:08x} is not code", export.name, addr);
                continue;
            }
            self.map.or(addr, ByteFlags::ANCHOR_MARK | ByteFlags::LABEL_HERE);
            self.worklist.push(addr, Confidence::Export);
        }
        log::debug!("Seeded {} addresses", self.worklist.len());
    }

    /// Run one state transition.
    pub fn step(&mut self) -> DriverState {
        self.state = match self.state {
            DriverState::Preprocessing => self.preprocess(),
            DriverState::Recovering => self.recover_failed(),
            DriverState::Finalizing => self.finalize(),
            DriverState::Done => DriverState::Done,
        };
        self.state
    }

    /// Run to completion.
    pub fn run(mut self) -> DriverOutput {
        while self.step() != DriverState::Done {}
        self.into_output()
    }

    pub fn into_output(self) -> DriverOutput {
        DriverOutput {
            map: self.map,
            index: self.index,
            stats: self.stats,
            erase_history: self.history.into_iter().collect(),
        }
    }

    fn after_attempt(&self) -> DriverState {
        if self.worklist.is_empty() {
            DriverState::Finalizing
        } else {
            DriverState::Preprocessing
        }
    }

    fn preprocess(&mut self) -> DriverState {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            log::warn!("Analysis cancelled with {} addresses pending", self.worklist.len());
            self.stats.cancelled = true;
            self.worklist.clear();
            return DriverState::Finalizing;
        }
        if self.config.max_attempts != 0 && self.stats.attempts >= self.config.max_attempts {
            log::warn!("Attempt budget of {} exhausted", self.config.max_attempts);
            self.worklist.clear();
            return DriverState::Finalizing;
        }

        let Some((addr, confidence)) = self.worklist.pop() else {
            return DriverState::Finalizing;
        };
        if self.map.get(addr).is_code()
            || self.failed_seeds.contains(&addr)
            || !is_good_address(self.store, &self.map, addr)
        {
            log::trace!("Skipping 0x{:08x}, already decided", addr);
            return self.after_attempt();
        }
        if confidence.is_speculative() && !self.probe(addr) {
            log::trace!("Rejected {} seed 0x{:08x}", confidence, addr);
            self.stats.rejected_seeds += 1;
            self.failed_seeds.insert(addr);
            return self.after_attempt();
        }

        self.stats.attempts += 1;
        let mut session = Session::new(addr, confidence, PassMode::Preprocessing);
        match self.attempt(&mut session) {
            Ok(()) => {
                log::trace!(
                    "Attempt at 0x{:08x} ({}) consumed {} bytes",
                    session.start,
                    session.confidence,
                    session.consumed
                );
                self.after_attempt()
            }
            Err(kind) => {
                session.last_error = Some(kind);
                self.failed = Some(session);
                DriverState::Recovering
            }
        }
    }

    /// Decode forward from the session cursor until a terminator, known
    /// code, or a conflict.
    fn attempt(&mut self, session: &mut Session) -> Result<(), ConflictKind> {
        let suspicious = session.confidence.is_speculative();
        loop {
            let at = session.cursor;
            let flags = self.map.get(at);
            match flags.kind() {
                ByteKind::InstructionStart => return Ok(()),
                ByteKind::InstructionBody => return Err(ConflictKind::StartInsideInstruction),
                ByteKind::DataByte => return Err(ConflictKind::Overlap),
                ByteKind::Unprocessed => {}
            }

            let insn = self
                .decoder
                .decode(self.store.window(at), at)
                .map_err(ConflictKind::DecodeFailure)?;
            let end = insn.end();
            for b in at + 1..end {
                let body = self.map.get(b);
                if body.is_anchored() {
                    return Err(ConflictKind::SwallowsAnchor);
                }
                if body.kind() != ByteKind::Unprocessed {
                    return Err(ConflictKind::Overlap);
                }
            }

            let mut start = ByteFlags::INSTRUCTION_START;
            if flags.contains(ByteFlags::LABEL_HERE) {
                start |= ByteFlags::LABEL_RESOLVED;
            }
            if suspicious {
                start |= ByteFlags::SUSPICIOUS_START;
            }
            self.map.or(at, start);
            for b in at + 1..end {
                self.map.or(b, ByteFlags::INSTRUCTION_BODY);
            }
            self.stats.instructions_decoded += 1;
            session.consumed += insn.length as usize;
            session.cursor = end;
            log::trace!("0x{:08x}: {:?} len {}", at, insn.flow, insn.length);

            if session.mode == PassMode::Preprocessing {
                self.follow_references(&insn, suspicious);
            }
            if insn.is_terminator() {
                return Ok(());
            }
        }
    }

    /// Try-decode from a speculative seed without touching the map.
    fn probe(&self, start: Address) -> bool {
        let mut at = start;
        for _ in 0..PROBE_INSTRUCTIONS {
            let flags = self.map.get(at);
            if flags.is_instruction_start() {
                return at != start;
            }
            if flags.kind() != ByteKind::Unprocessed {
                return false;
            }
            let Ok(insn) = self.decoder.decode(self.store.window(at), at) else {
                return false;
            };
            let end = insn.end();
            if (at + 1..end).any(|b| {
                let body = self.map.get(b);
                body.is_anchored() || body.kind() != ByteKind::Unprocessed
            }) {
                return false;
            }
            if insn.is_terminator() {
                return true;
            }
            at = end;
        }
        true
    }

    fn follow_references(&mut self, insn: &DecodedInstruction, suspicious: bool) {
        let at = insn.address;
        if let Some(target) = insn.branch_target() {
            let (class, confidence) = match insn.flow {
                FlowKind::Call => (RefClass::CALL_TARGET, Confidence::DirectCall),
                FlowKind::Jump => (RefClass::JUMP_TARGET, Confidence::DirectJump),
                _ => (RefClass::BRANCH_TARGET, Confidence::DirectJump),
            };
            let confidence = if suspicious { Confidence::Guess } else { confidence };
            self.add_code_reference(class, at, target, confidence);
        }

        if insn.flow == FlowKind::JumpIndirect && self.config.follow_jump_tables {
            self.follow_jump_table(insn, suspicious);
        }

        if let Some(addr) = insn.memory_reference() {
            if self.import_slots.contains(&addr) {
                self.index.insert_dual(RefClass::IMPORT_BINDING, at, addr);
            } else if self.store.is_readable(addr) {
                self.index.insert_dual(RefClass::DATA_REFERENCE, at, addr);
            }
        }

        if self.config.follow_immediate_pointers {
            if let Some(value) = insn.immediate_value32() {
                if is_good_address(self.store, &self.map, value) {
                    self.add_code_reference(RefClass::IMMEDIATE_POINTER, at, value, Confidence::Guess);
                }
            }
        }
    }

    /// Index a reference to code and schedule the target.
    fn add_code_reference(
        &mut self,
        class: RefClass,
        position: Address,
        target: Address,
        confidence: Confidence,
    ) {
        if !is_good_address(self.store, &self.map, target) {
            log::trace!("Ignoring {} target 0x{:08x} from 0x{:08x}", class, target, position);
            return;
        }
        self.index.insert_dual(class, position, target);

        let flags = self.map.get(target);
        if !confidence.is_speculative() {
            self.map.or(target, ByteFlags::LABEL_HERE);
            if flags.is_instruction_start() {
                self.map.or(target, ByteFlags::LABEL_RESOLVED);
            }
        }
        if !flags.is_instruction_start() && !self.failed_seeds.contains(&target) {
            self.worklist.push(target, confidence);
        }
    }

    /// Read the table behind `jmp [table + reg*4]`.
    fn follow_jump_table(&mut self, insn: &DecodedInstruction, suspicious: bool) {
        let Some(base) = insn.jump_table_base() else {
            return;
        };
        if !self.store.is_mapped(base) {
            return;
        }
        self.index.insert_dual(RefClass::JUMP_TABLE, insn.address, base);
        let confidence = if suspicious {
            Confidence::Guess
        } else {
            Confidence::ComputedJump
        };

        let mut entries = 0;
        for i in 0..MAX_JUMP_TABLE_ENTRIES {
            let Some(slot) = base.checked_add(i * 4) else {
                break;
            };
            if self.map.contains(slot) && !self.map.is_unprocessed(slot..slot + 4) {
                break;
            }
            let Some(target) = self.store.read_u32(slot) else {
                break;
            };
            if !is_good_address(self.store, &self.map, target) {
                break;
            }
            self.map.mark_data(slot..slot + 4, DataClass::PointerTable);
            self.index.insert_dual(RefClass::TABLE_ENTRY, slot, target);
            self.add_code_reference(RefClass::JUMP_TARGET, insn.address, target, confidence);
            entries += 1;
        }
        self.stats.jump_tables += 1;
        log::debug!(
            "Jump table at 0x{:08x} for 0x{:08x}: {} entries",
            base,
            insn.address,
            entries
        );
    }

    fn recover_failed(&mut self) -> DriverState {
        let Some(session) = self.failed.take() else {
            return self.after_attempt();
        };
        self.recover(&session);
        if self.stats.recoveries >= self.config.max_recoveries {
            log::warn!(
                "Recovery budget of {} exhausted, abandoning {} pending addresses",
                self.config.max_recoveries,
                self.worklist.len()
            );
            self.worklist.clear();
            return DriverState::Finalizing;
        }
        self.after_attempt()
    }

    /// Erase the uncertain span around a failed attempt.
    fn recover(&mut self, session: &Session) {
        let kind = session
            .last_error
            .unwrap_or(ConflictKind::Overlap);
        self.failed_seeds.insert(session.start);
        self.stats.recoveries += 1;

        let (span, anchored) = recovery::erase_span(&self.map, session.start, session.cursor);
        if anchored || kind == ConflictKind::SwallowsAnchor {
            self.stats.anchor_conflicts += 1;
            log::warn!(
                "Conflict at 0x{:08x} ({}) runs into an anchored instruction",
                session.cursor,
                kind
            );
        }

        let removed = self.index.remove_positions_in(span.clone());
        let relations_removed = removed.len();
        self.map.clear_range(span.clone());
        for entry in &removed {
            self.withdraw_orphan(entry.reference);
        }
        let erased = ErasedSpan {
            start: span.start,
            end: span.end,
            cursor: session.cursor,
            seed: session.start,
            kind,
            relations_removed,
        };
        self.stats.bytes_erased += erased.len();
        self.stats.relations_erased += relations_removed;
        log::debug!(
            "Erased 0x{:08x}..0x{:08x} after {} at 0x{:08x}",
            erased.start,
            erased.end,
            kind,
            erased.cursor
        );

        if self.config.erase_history_limit > 0 {
            if self.history.len() >= self.config.erase_history_limit {
                self.history.pop_front();
            }
            self.history.push_back(erased);
        }
    }

    /// Forget a target nothing references any more: it leaves the worklist
    /// and loses its label. Decoded code and anchors stay as they are.
    fn withdraw_orphan(&mut self, target: Address) {
        let flags = self.map.get(target);
        if flags.is_instruction_start() || flags.is_anchored() {
            return;
        }
        if self.index.references_to(target).any(|e| !e.class.is_reverse()) {
            return;
        }
        if self.worklist.remove(target) {
            log::trace!("Withdrew 0x{:08x}, only erased code referenced it", target);
        }
        self.map.and_not(target, ByteFlags::LABEL_HERE);
    }

    fn finalize(&mut self) -> DriverState {
        log::debug!(
            "Finalizing after {} attempts and {} recoveries",
            self.stats.attempts,
            self.stats.recoveries
        );
        self.worklist.clear();

        if self.config.detect_address_tables {
            let scan = address_tables::detect(self.store, &mut self.map, &mut self.index);
            self.stats.address_tables += scan.tables.len();
            self.drain(&scan.targets);
        }
        if self.config.detect_strings {
            let scan = strings::detect(self.store, &mut self.map);
            self.stats.strings += scan.strings.len();
        }
        if self.config.validate_code {
            let report = validate::run(self.store, self.decoder, &mut self.map, &mut self.index);
            self.stats.code_blocks_reclassified += report.blocks_reclassified;
            self.stats.code_bytes_reclassified += report.bytes_reclassified;
        }
        self.stats.bytes_backfilled += passes::backfill(&mut self.map);
        DriverState::Done
    }

    /// Decode pointer-table targets linearly, scheduling nothing new.
    fn drain(&mut self, targets: &[Address]) {
        for &target in targets {
            if self.map.get(target).is_code()
                || self.failed_seeds.contains(&target)
                || !is_good_address(self.store, &self.map, target)
            {
                continue;
            }
            if !self.probe(target) {
                self.stats.rejected_seeds += 1;
                self.failed_seeds.insert(target);
                continue;
            }
            self.stats.attempts += 1;
            let mut session = Session::new(target, Confidence::TableEntry, PassMode::Finalizing);
            if let Err(kind) = self.attempt(&mut session) {
                session.last_error = Some(kind);
                self.recover(&session);
            }
        }
    }
}
