//! Post-processing passes, run once the worklist is exhausted.
//!
//! In order: address tables, strings, code-block validation, backfill. Each
//! pass only ever looks at bytes the earlier ones left undecided, so running
//! the sequence again over a finished map changes nothing.

pub mod address_tables;
pub mod strings;
pub mod validate;

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::decoder::Decoder;
use crate::image::ByteStore;
use crate::index::AddressIndex;
use crate::map::{ByteKind, ClassificationMap, DataClass};
use crate::Address;

/// What one run of the passes changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub tables: usize,
    pub table_entries: usize,
    pub strings: usize,
    pub blocks_reclassified: usize,
    pub bytes_reclassified: usize,
    pub bytes_backfilled: usize,
}

impl PassReport {
    /// Whether the run left the map and index untouched.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Maximal runs of unprocessed bytes, ascending.
pub(crate) fn unprocessed_runs(map: &ClassificationMap) -> Vec<Range<Address>> {
    let mut runs: Vec<Range<Address>> = Vec::new();
    for (addr, flags) in map.iter() {
        if flags.kind() != ByteKind::Unprocessed {
            continue;
        }
        match runs.last_mut() {
            Some(run) if run.end == addr => run.end = addr + 1,
            _ => runs.push(addr..addr + 1),
        }
    }
    runs
}

/// Finalize every byte still unprocessed as raw data.
pub fn backfill(map: &mut ClassificationMap) -> usize {
    let runs = unprocessed_runs(map);
    let mut filled = 0;
    for run in runs {
        filled += run.len();
        map.mark_data(run, DataClass::Raw);
    }
    if filled > 0 {
        log::debug!("Backfilled {} bytes as data", filled);
    }
    filled
}

/// Run every enabled pass over `map` without decoding anything new.
///
/// Pointer-table targets are indexed but left for the caller to decode.
pub fn run_all(
    store: &ByteStore<'_>,
    decoder: &dyn Decoder,
    map: &mut ClassificationMap,
    index: &mut AddressIndex,
    config: &AnalysisConfig,
) -> PassReport {
    let mut report = PassReport::default();
    if config.detect_address_tables {
        let scan = address_tables::detect(store, map, index);
        report.tables = scan.tables.len();
        report.table_entries = scan.entries;
    }
    if config.detect_strings {
        report.strings = strings::detect(store, map).strings.len();
    }
    if config.validate_code {
        let validation = validate::run(store, decoder, map, index);
        report.blocks_reclassified = validation.blocks_reclassified;
        report.bytes_reclassified = validation.bytes_reclassified;
    }
    report.bytes_backfilled = backfill(map);
    report
}
