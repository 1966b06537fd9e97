//! Whole-pipeline scenarios: PE bytes in, finished analysis out.

use crate::config::{AnalysisConfig, CancelToken};
use crate::decoder::{CpuMode, DecodeFailure, DecodedInstruction, Decoder, X86Decoder};
use crate::driver::{Driver, DriverState};
use crate::image::{ByteStore, ImageLayout, Section, IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE};
use crate::index::RefClass;
use crate::map::{ByteKind, DataClass};
use crate::parser::PeParser;
use crate::passes;
use crate::{analyze, analyze_batch, analyze_file, analyze_with, Address, Analysis, AnalysisError, ImageParser};

const CODE: Address = 0x40_1000;

/// Smallest PE32 image goblin accepts: one `.text` section at RVA 0x1000
/// whose raw data (`code`, unpadded) starts at file offset 0x200, with the
/// entry point at its first byte.
pub(crate) fn minimal_pe(code: &[u8], machine: u16) -> Vec<u8> {
    fn put16(image: &mut [u8], at: usize, v: u16) {
        image[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn put32(image: &mut [u8], at: usize, v: u32) {
        image[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    const PE: usize = 0x80;
    const OPTIONAL: usize = PE + 4 + 20;
    const SECTIONS: usize = OPTIONAL + 0xe0;
    const RAW: usize = 0x200;

    let mut image = vec![0u8; RAW];
    image[..2].copy_from_slice(b"MZ");
    put32(&mut image, 0x3c, PE as u32);
    image[PE..PE + 4].copy_from_slice(b"PE\0\0");

    // COFF header
    put16(&mut image, PE + 4, machine);
    put16(&mut image, PE + 6, 1);
    put16(&mut image, PE + 20, 0xe0);
    // executable image, 32-bit machine
    put16(&mut image, PE + 22, 0x0102);

    // Standard fields
    put16(&mut image, OPTIONAL, 0x10b);
    put32(&mut image, OPTIONAL + 4, code.len() as u32);
    put32(&mut image, OPTIONAL + 16, 0x1000);
    put32(&mut image, OPTIONAL + 20, 0x1000);
    put32(&mut image, OPTIONAL + 24, 0x2000);
    // Windows fields
    put32(&mut image, OPTIONAL + 28, 0x40_0000);
    put32(&mut image, OPTIONAL + 32, 0x1000);
    put32(&mut image, OPTIONAL + 36, 0x200);
    put16(&mut image, OPTIONAL + 40, 4);
    put16(&mut image, OPTIONAL + 48, 4);
    put32(&mut image, OPTIONAL + 56, 0x2000);
    put32(&mut image, OPTIONAL + 60, RAW as u32);
    // console subsystem
    put16(&mut image, OPTIONAL + 68, 3);
    put32(&mut image, OPTIONAL + 72, 0x10_0000);
    put32(&mut image, OPTIONAL + 76, 0x1000);
    put32(&mut image, OPTIONAL + 80, 0x10_0000);
    put32(&mut image, OPTIONAL + 84, 0x1000);
    put32(&mut image, OPTIONAL + 92, 16);

    // Section table
    image[SECTIONS..SECTIONS + 5].copy_from_slice(b".text");
    put32(&mut image, SECTIONS + 8, code.len() as u32);
    put32(&mut image, SECTIONS + 12, 0x1000);
    put32(&mut image, SECTIONS + 16, code.len() as u32);
    put32(&mut image, SECTIONS + 20, RAW as u32);
    put32(&mut image, SECTIONS + 36, 0x6000_0020);

    image.extend_from_slice(code);
    image
}

/// Every executable byte decided, instructions never overlapping.
fn assert_invariants(analysis: &Analysis) {
    let map = &analysis.classification;
    for (addr, flags) in map.iter() {
        assert_ne!(flags.kind(), ByteKind::Unprocessed, "0x{:08x} left unprocessed", addr);
    }
    for pair in analysis.instructions.windows(2) {
        let (a, first) = &pair[0];
        let (b, _) = &pair[1];
        assert!(a < b);
        assert!(first.end() <= *b, "0x{:08x} overlaps 0x{:08x}", a, b);
    }
    for (addr, insn) in &analysis.instructions {
        assert_eq!(map.instruction_end(*addr), insn.end());
    }
}

/// Running the passes again over a finished analysis changes nothing.
fn assert_idempotent(image: &[u8], layout: &ImageLayout, analysis: &Analysis) {
    let store = ByteStore::new(image, layout).unwrap();
    let decoder = X86Decoder::for_store(&store, CpuMode::Bits32);
    let mut map = analysis.classification.clone();
    let mut index = analysis.symbols.clone();

    let report = passes::run_all(&store, &decoder, &mut map, &mut index, &AnalysisConfig::default());
    assert!(report.is_noop(), "{:?}", report);
    assert_eq!(map, analysis.classification);
    assert_eq!(index, analysis.symbols);
}

#[test]
fn test_mov_ret_image() {
    let _ = env_logger::builder().is_test(true).try_init();
    let image = minimal_pe(&[0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3], 0x14c);
    let layout = PeParser::new().parse(&image).unwrap();

    let store = ByteStore::new(&image, &layout).unwrap();
    let decoder = X86Decoder::for_store(&store, CpuMode::Bits32);
    let config = AnalysisConfig::default();
    let mut driver = Driver::new(&store, &decoder, &config);
    while driver.step() != DriverState::Done {}
    assert_eq!(driver.pending(), 0);
    assert!(driver.index().is_empty());

    let analysis = analyze(&image, &layout).unwrap();
    assert_eq!(analysis.code_bytes(), 6);
    assert_eq!(analysis.data_bytes(), 0);
    assert!(analysis.symbols.is_empty());
    assert_eq!(analysis.instructions.len(), 2);
    assert_eq!(analysis.instructions[0].1.length, 5);
    assert_eq!(analysis.instructions[1].1.length, 1);
    assert_eq!(analysis.names.name_of(CODE), Some("entry"));
    assert_eq!(analysis.stats.recoveries, 0);
    assert_invariants(&analysis);
    assert_idempotent(&image, &layout, &analysis);
}

#[test]
fn test_undiscovered_address_table() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut code = vec![
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xc3, // ret
        0xcc, 0xcc, // padding
    ];
    for target in [CODE, CODE + 5, CODE, CODE + 5] {
        code.extend_from_slice(&target.to_le_bytes());
    }
    let layout = ImageLayout::flat(0x40_0000, 0x1000, code.len() as u32);
    let analysis = analyze(&code, &layout).unwrap();

    let table = CODE + 8..CODE + 24;
    assert!(analysis.classification.runs().iter().any(|run| run.start == table.start
        && run.end == table.end
        && run.kind == ByteKind::DataByte
        && run.data_class == DataClass::PointerTable));
    let entries: Vec<_> = analysis.symbols.find_by_class(RefClass::TABLE_ENTRY).collect();
    assert_eq!(entries.len(), 4);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.position, table.start + 4 * i as Address);
    }
    assert_eq!(analysis.stats.address_tables, 1);
    assert_eq!(analysis.names.name_of(table.start), Some("off_00401008"));
    assert_eq!(analysis.classification.touch(CODE + 6), DataClass::Raw);
    assert_invariants(&analysis);
    assert_idempotent(&code, &layout, &analysis);
}

#[test]
fn test_mixed_image() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut code = vec![
        0x55, // push ebp
        0x8b, 0xec, // mov ebp, esp
        0xe8, 0x0c, 0x00, 0x00, 0x00, // call 0x401014
        0x68, 0x1b, 0x10, 0x40, 0x00, // push 0x40101b (string)
        0x85, 0xc0, // test eax, eax
        0x74, 0x01, // jz 0x401012
        0x40, // inc eax
        0x5d, // pop ebp
        0xc3, // ret
        0x31, 0xc0, // xor eax, eax
        0x40, // inc eax
        0xc3, // ret
        0xcc, 0xcc, 0xcc, // padding
    ];
    code.extend_from_slice(b"Hello, world\0");
    code.extend_from_slice(&[0xff; 5]);
    let layout = ImageLayout::flat(0x40_0000, 0x1000, code.len() as u32);
    let analysis = analyze(&code, &layout).unwrap();

    let map = &analysis.classification;
    assert!(analysis.symbols.contains(RefClass::CALL_TARGET, CODE + 3, CODE + 0x14));
    assert!(analysis.symbols.contains(RefClass::BRANCH_TARGET, CODE + 15, CODE + 0x12));
    assert_eq!(analysis.names.name_of(CODE + 0x14), Some("sub_00401014"));
    assert_eq!(analysis.names.name_of(CODE + 0x12), Some("loc_00401012"));
    assert!(map.get(CODE + 0x17).is_instruction_start());
    assert_eq!(map.touch(CODE + 0x1b), DataClass::AsciiString);
    assert_eq!(map.touch(CODE + 0x1b + 12), DataClass::AsciiString);
    assert_eq!(analysis.stats.strings, 1);
    assert_eq!(map.touch(CODE + 0x18), DataClass::Raw);
    assert_invariants(&analysis);
    assert_idempotent(&code, &layout, &analysis);
}

/// Wraps the real decoder and always fails at one address.
struct FailingAt {
    inner: X86Decoder,
    bad: Address,
}

impl Decoder for FailingAt {
    fn decode(&self, bytes: &[u8], at: Address) -> Result<DecodedInstruction, DecodeFailure> {
        if at == self.bad {
            return Err(DecodeFailure::EndOfRegion);
        }
        self.inner.decode(bytes, at)
    }
}

#[test]
fn test_recovery_terminates_on_a_fixed_failure() {
    let _ = env_logger::builder().is_test(true).try_init();
    let code = [
        0xe8, 0x0b, 0x00, 0x00, 0x00, // call 0x401010
        0xe8, 0x07, 0x00, 0x00, 0x00, // call 0x401011
        0xe8, 0x03, 0x00, 0x00, 0x00, // call 0x401012
        0xc3, // ret
        0x90, 0x90, 0x90, // three labelled nops
        0x90, 0x90, 0xc3, // the decoder fails at the first of these
    ];
    let layout = ImageLayout::flat(0x40_0000, 0x1000, code.len() as u32);
    let store = ByteStore::new(&code, &layout).unwrap();
    let decoder = FailingAt {
        inner: X86Decoder::for_store(&store, CpuMode::Bits32),
        bad: CODE + 0x13,
    };

    let config = AnalysisConfig::default();
    let out = Driver::new(&store, &decoder, &config).run();
    assert!(out.stats.recoveries >= 1 && out.stats.recoveries <= 3);
    assert!(out.map.iter().all(|(_, f)| f.kind() != ByteKind::Unprocessed));
    assert_eq!(out.map.get(CODE + 0x13).kind(), ByteKind::DataByte);
    assert!(out.map.get(CODE + 15).is_instruction_start());

    let config = AnalysisConfig {
        max_recoveries: 1,
        ..AnalysisConfig::default()
    };
    let out = Driver::new(&store, &decoder, &config).run();
    assert_eq!(out.stats.recoveries, 1);
    assert!(out.map.iter().all(|(_, f)| f.kind() != ByteKind::Unprocessed));
}

/// Deterministic garbage: xorshift32.
fn noise(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

#[test]
fn test_garbage_images_keep_the_invariants() {
    let _ = env_logger::builder().is_test(true).try_init();
    for seed in [1, 0xdead_beef, 0x1234_5678, 42, 7] {
        let image = noise(seed, 0x400);
        let layout = ImageLayout::flat(0x40_0000, 0x1000, image.len() as u32);
        let analysis = analyze(&image, &layout).unwrap();
        assert_invariants(&analysis);
        assert_idempotent(&image, &layout, &analysis);
    }
}

#[test]
fn test_cancelled_analysis_covers_everything() {
    let image = minimal_pe(&[0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3], 0x14c);
    let layout = PeParser::new().parse(&image).unwrap();
    let token = CancelToken::new();
    token.cancel();

    let analysis = analyze_with(&image, &layout, &AnalysisConfig::default(), Some(&token)).unwrap();
    assert!(analysis.stats.cancelled);
    assert_eq!(analysis.code_bytes(), 0);
    assert_eq!(analysis.data_bytes(), 6);
    assert!(analysis.instructions.is_empty());
}

#[test]
fn test_precondition_errors() {
    let layout = ImageLayout::flat(0x40_0000, 0x1000, 0);
    assert!(matches!(analyze(&[], &layout), Err(AnalysisError::EmptyCodeRegion)));

    let mut layout = ImageLayout::flat(0x40_0000, 0x1000, 4);
    layout.entry_point_rva = 0x9000;
    assert!(matches!(
        analyze(&[0xc3; 4], &layout),
        Err(AnalysisError::EntryPointOutsideSections(0x9000))
    ));
}

#[test]
fn test_far_apart_sections() {
    let flags = IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE;
    let layout = ImageLayout::new(
        0x40_0000,
        0x1000,
        vec![
            Section::new(".text", 0x1000, 0, 6, flags),
            Section::new(".far", 0x7fff_0000, 6, 1, flags),
        ],
    );
    let mut image = vec![0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];
    image.push(0xc3);
    let analysis = analyze(&image, &layout).unwrap();

    assert_eq!(analysis.classification.len(), 7);
    assert_eq!(analysis.code_bytes(), 6);
    assert_eq!(analysis.data_bytes(), 1);
    assert_eq!(analysis.instructions.len(), 2);
    assert_invariants(&analysis);
    assert_idempotent(&image, &layout, &analysis);
}

#[test]
fn test_analyze_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&minimal_pe(&[0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3], 0x14c))
        .unwrap();
    let analysis = analyze_file(file.path(), &AnalysisConfig::default()).unwrap();
    assert_eq!(analysis.code_bytes(), 6);

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.exe");
    let err = analyze_file(&missing, &AnalysisConfig::default()).unwrap_err();
    assert!(err.to_string().starts_with("Failed to read"));
}

#[test]
fn test_analyze_batch() {
    let good = minimal_pe(&[0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3], 0x14c);
    let other = minimal_pe(&[0x55, 0x8b, 0xec, 0x5d, 0xc3], 0x14c);
    let images = [good.as_slice(), b"not a PE".as_slice(), other.as_slice()];

    let results = analyze_batch(&images, &AnalysisConfig::default());
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().instructions.len(), 2);
    assert!(matches!(results[1], Err(AnalysisError::Parsing(_))));
    assert_eq!(results[2].as_ref().unwrap().instructions.len(), 4);
}
