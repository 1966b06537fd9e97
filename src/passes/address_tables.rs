//! Address-table detection over unprocessed bytes.

use std::ops::Range;

use crate::image::ByteStore;
use crate::index::{AddressIndex, RefClass};
use crate::map::{is_good_address, ClassificationMap, DataClass};
use crate::Address;

use super::unprocessed_runs;

/// Consecutive good dwords needed before a run counts as a table.
pub const MIN_TABLE_ENTRIES: usize = 4;

/// Tables found by one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableScan {
    pub tables: Vec<Range<Address>>,
    /// Number of entries across all tables
    pub entries: usize,
    /// Entry targets not yet decoded, ascending and deduplicated
    pub targets: Vec<Address>,
}

/// Number of consecutive dwords from `start` that hold good code
/// addresses, reading no further than `limit`.
fn table_length(store: &ByteStore<'_>, map: &ClassificationMap, start: Address, limit: Address) -> usize {
    let mut count = 0;
    loop {
        let Some(slot) = start.checked_add(4 * count as Address) else {
            break;
        };
        if slot.saturating_add(4) > limit {
            break;
        }
        let Some(target) = store.read_u32(slot) else {
            break;
        };
        // A table never points into itself
        if (start..slot + 4).contains(&target) || !is_good_address(store, map, target) {
            break;
        }
        count += 1;
    }
    count
}

/// Scan unprocessed bytes for pointer tables, first on 4-byte boundaries and
/// then at every offset.
///
/// Each table is marked as pointer-table data and every slot is indexed as a
/// `TABLE_ENTRY` relation.
pub fn detect(store: &ByteStore<'_>, map: &mut ClassificationMap, index: &mut AddressIndex) -> TableScan {
    let mut scan = TableScan::default();
    for aligned in [true, false] {
        for run in unprocessed_runs(map) {
            let mut addr = if aligned {
                match run.start.checked_add(3) {
                    Some(a) => a & !3,
                    None => continue,
                }
            } else {
                run.start
            };
            while addr.saturating_add(4) <= run.end {
                let count = table_length(store, map, addr, run.end);
                if count < MIN_TABLE_ENTRIES {
                    addr += if aligned { 4 } else { 1 };
                    continue;
                }
                let table = addr..addr + 4 * count as Address;
                map.mark_data(table.clone(), DataClass::PointerTable);
                for slot in table.clone().step_by(4) {
                    let Some(target) = store.read_u32(slot) else {
                        continue;
                    };
                    index.insert_dual(RefClass::TABLE_ENTRY, slot, target);
                    if !map.get(target).is_instruction_start() {
                        scan.targets.push(target);
                    }
                }
                log::debug!(
                    "Pointer table at 0x{:08x}: {} entries{}",
                    table.start,
                    count,
                    if aligned { "" } else { " (unaligned)" }
                );
                scan.entries += count;
                addr = table.end;
                scan.tables.push(table);
            }
        }
    }
    scan.targets.sort_unstable();
    scan.targets.dedup();
    scan
}
