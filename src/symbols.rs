//! Symbol names for addresses the analysis found.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::image::ByteStore;
use crate::index::{AddressIndex, RefClass};
use crate::map::{ClassificationMap, DataClass};
use crate::Address;

/// Where a name came from. Later variants lose to earlier ones when two
/// sources name the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Entry,
    Export,
    Import,
    /// Target of a call
    Function,
    /// Target of a jump, branch or table entry
    Label,
    /// Start of a pointer table
    Table,
    /// Target of an absolute memory operand
    Data,
}

impl SymbolKind {
    /// Prefix of generated names
    fn prefix(self) -> &'static str {
        match self {
            SymbolKind::Function => "sub",
            SymbolKind::Label => "loc",
            SymbolKind::Table => "off",
            SymbolKind::Data => "dword",
            SymbolKind::Entry | SymbolKind::Export | SymbolKind::Import => "sym",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Address to name, one name per address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    names: BTreeMap<Address, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the entry point, exports, imports and every referenced address.
    pub fn build(store: &ByteStore<'_>, map: &ClassificationMap, index: &AddressIndex) -> Self {
        let mut table = Self::new();
        let layout = store.layout();

        table.insert(store.entry_point(), "entry", SymbolKind::Entry);
        for export in &layout.exports {
            table.insert(store.va(export.rva), export.name.clone(), SymbolKind::Export);
        }
        for import in &layout.imports {
            table.insert(
                store.va(import.slot_rva),
                format!("{}!{}", import.dll, import.name),
                SymbolKind::Import,
            );
        }

        for entry in index.iter().filter(|e| !e.class.is_reverse()) {
            let target = entry.reference;
            let code = map.get(target).is_instruction_start();
            let kind = match entry.class {
                RefClass::CALL_TARGET if code => SymbolKind::Function,
                RefClass::JUMP_TARGET
                | RefClass::BRANCH_TARGET
                | RefClass::TABLE_ENTRY
                | RefClass::IMMEDIATE_POINTER
                    if code =>
                {
                    SymbolKind::Label
                }
                RefClass::JUMP_TABLE => SymbolKind::Table,
                RefClass::DATA_REFERENCE => SymbolKind::Data,
                _ => continue,
            };
            table.insert_generated(target, kind);
        }

        for run in map.runs() {
            if run.data_class == DataClass::PointerTable {
                table.insert_generated(run.start, SymbolKind::Table);
            }
        }
        table
    }

    /// Name `addr`, unless it already has a name from a stronger source.
    pub fn insert(&mut self, addr: Address, name: impl Into<String>, kind: SymbolKind) -> bool {
        match self.names.get(&addr) {
            Some(existing) if existing.kind <= kind => false,
            _ => {
                self.names.insert(
                    addr,
                    Symbol {
                        name: name.into(),
                        kind,
                    },
                );
                true
            }
        }
    }

    fn insert_generated(&mut self, addr: Address, kind: SymbolKind) -> bool {
        self.insert(addr, format!("{}_{:08X}", kind.prefix(), addr), kind)
    }

    pub fn get(&self, addr: Address) -> Option<&Symbol> {
        self.names.get(&addr)
    }

    pub fn name_of(&self, addr: Address) -> Option<&str> {
        self.get(addr).map(|s| s.name.as_str())
    }

    /// Names in ascending address order
    pub fn iter(&self) -> impl Iterator<Item = (Address, &Symbol)> + '_ {
        self.names.iter().map(|(a, s)| (*a, s))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Export, Import, ImageLayout};
    use crate::map::ByteFlags;

    const CODE: Address = 0x40_1000;

    #[test]
    fn test_stronger_names_win() {
        let mut table = SymbolTable::new();
        assert!(table.insert_generated(CODE, SymbolKind::Label));
        assert!(table.insert_generated(CODE, SymbolKind::Function));
        assert!(!table.insert_generated(CODE, SymbolKind::Label));
        assert_eq!(table.name_of(CODE), Some("sub_00401000"));

        assert!(table.insert(CODE, "entry", SymbolKind::Entry));
        assert!(!table.insert(CODE, "Other", SymbolKind::Export));
        assert_eq!(table.name_of(CODE), Some("entry"));
    }

    #[test]
    fn test_build() {
        let image = [0x90u8; 0x20];
        let layout = ImageLayout::flat(0x40_0000, 0x1000, 0x20)
            .with_exports(vec![Export {
                name: "DllMain".into(),
                rva: 0x1004,
            }])
            .with_imports(vec![Import {
                dll: "user32.dll".into(),
                name: "MessageBoxA".into(),
                slot_rva: 0x3000,
            }]);
        let store = ByteStore::new(&image, &layout).unwrap();
        let mut map = ClassificationMap::for_store(&store);
        for a in [CODE, CODE + 4, CODE + 8, CODE + 12] {
            map.or(a, ByteFlags::INSTRUCTION_START);
        }
        map.mark_data(CODE + 16..CODE + 24, DataClass::PointerTable);

        let mut index = AddressIndex::new();
        index.insert_dual(RefClass::CALL_TARGET, CODE, CODE + 8);
        index.insert_dual(RefClass::BRANCH_TARGET, CODE, CODE + 12);
        index.insert_dual(RefClass::CALL_TARGET, CODE, CODE + 4);
        // Target was never decoded
        index.insert_dual(RefClass::JUMP_TARGET, CODE, CODE + 2);
        index.insert_dual(RefClass::DATA_REFERENCE, CODE, 0x40_2000);

        let table = SymbolTable::build(&store, &map, &index);
        assert_eq!(table.name_of(CODE), Some("entry"));
        assert_eq!(table.name_of(CODE + 4), Some("DllMain"));
        assert_eq!(table.name_of(CODE + 8), Some("sub_00401008"));
        assert_eq!(table.name_of(CODE + 12), Some("loc_0040100C"));
        assert_eq!(table.name_of(CODE + 16), Some("off_00401010"));
        assert_eq!(table.name_of(0x40_2000), Some("dword_00402000"));
        assert_eq!(table.name_of(0x40_3000), Some("user32.dll!MessageBoxA"));
        assert_eq!(table.get(CODE + 2), None);
    }
}
