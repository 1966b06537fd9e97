//! String detection over unprocessed bytes.
//!
//! Three shapes are recognised: length-prefixed (Pascal) strings, ASCII runs
//! ending in NUL or CR-LF, and UTF-16LE runs ending in a wide NUL.

use std::ops::Range;

use crate::image::ByteStore;
use crate::map::{is_good_address, ClassificationMap, DataClass};
use crate::Address;

use super::unprocessed_runs;

/// Shortest string, in characters, the pass accepts.
pub const MIN_STRING_LEN: usize = 4;

/// Strings shorter than this are only accepted when no plausible address
/// sits right before or after them.
pub const SHORT_STRING_LEN: usize = 8;

/// Strings found by one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringScan {
    pub strings: Vec<(Range<Address>, DataClass)>,
}

impl StringScan {
    pub fn bytes(&self) -> usize {
        self.strings.iter().map(|(r, _)| r.len()).sum()
    }
}

fn is_printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b) || b == b'\t'
}

/// Length-prefixed string at the start of `bytes`, as a byte count.
fn pascal_at(bytes: &[u8]) -> Option<usize> {
    let len = *bytes.first()? as usize;
    if len < MIN_STRING_LEN {
        return None;
    }
    let body = bytes.get(1..1 + len)?;
    body.iter().all(|&b| is_printable(b)).then_some(1 + len)
}

/// UTF-16LE string at the start of `bytes`, terminator included.
fn wide_at(bytes: &[u8]) -> Option<usize> {
    let mut chars = 0;
    let mut pairs = bytes.chunks_exact(2);
    for pair in pairs.by_ref() {
        match (pair[0], pair[1]) {
            (0, 0) => {
                return (chars >= MIN_STRING_LEN).then_some(2 * chars + 2);
            }
            (lo, 0) if is_printable(lo) => chars += 1,
            _ => return None,
        }
    }
    None
}

/// NUL- or CR-LF-terminated string at the start of `bytes`, terminator
/// included, with its character count.
fn ascii_at(bytes: &[u8]) -> Option<(usize, usize)> {
    let chars = bytes.iter().take_while(|&&b| is_printable(b)).count();
    if chars < MIN_STRING_LEN {
        return None;
    }
    let rest = &bytes[chars..];
    let terminator = match rest {
        [0, ..] => 1,
        [b'\r', b'\n', 0, ..] => 3,
        [b'\r', b'\n', ..] => 2,
        _ => return None,
    };
    Some((chars + terminator, chars))
}

/// Whether the dword ending right before `range` or starting right after it
/// is a good code address, which makes a short string look like part of a
/// pointer table instead.
fn next_to_address(store: &ByteStore<'_>, map: &ClassificationMap, range: &Range<Address>) -> bool {
    let before = range
        .start
        .checked_sub(4)
        .and_then(|a| store.read_u32(a));
    let after = store.read_u32(range.end);
    [before, after]
        .into_iter()
        .flatten()
        .any(|value| is_good_address(store, map, value))
}

/// Scan unprocessed bytes for strings and mark them as string data.
pub fn detect(store: &ByteStore<'_>, map: &mut ClassificationMap) -> StringScan {
    let mut scan = StringScan::default();
    for run in unprocessed_runs(map) {
        let bytes: Vec<u8> = run.clone().map(|a| store.byte(a).unwrap_or(0)).collect();
        let mut i = 0;
        while i < bytes.len() {
            let rest = &bytes[i..];
            let found = if let Some(len) = pascal_at(rest) {
                Some((len, DataClass::PascalString, len - 1))
            } else if let Some(len) = wide_at(rest) {
                Some((len, DataClass::WideString, len / 2 - 1))
            } else {
                ascii_at(rest).map(|(len, chars)| (len, DataClass::AsciiString, chars))
            };

            let Some((len, class, chars)) = found else {
                i += 1;
                continue;
            };
            let start = run.start + i as Address;
            let range = start..start + len as Address;
            if chars < SHORT_STRING_LEN && next_to_address(store, map, &range) {
                log::trace!("Short string at 0x{:08x} sits next to an address", start);
                i += 1;
                continue;
            }
            map.mark_data(range.clone(), class);
            scan.strings.push((range, class));
            i += len;
        }
    }
    if !scan.strings.is_empty() {
        log::debug!("Found {} strings ({} bytes)", scan.strings.len(), scan.bytes());
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageLayout;
    use crate::map::{ByteFlags, ByteKind};
    use rstest::rstest;

    const CODE: Address = 0x40_1000;

    fn detect_in(image: &[u8]) -> (ClassificationMap, StringScan) {
        let layout = ImageLayout::flat(0x40_0000, 0x1000, image.len() as u32);
        let store = ByteStore::new(image, &layout).unwrap();
        let mut map = ClassificationMap::for_store(&store);
        map.or(CODE, ByteFlags::INSTRUCTION_START);
        let scan = detect(&store, &mut map);
        (map, scan)
    }

    #[rstest]
    #[case::nul(b"\xc3Hello, world\0\xff", 1..14, DataClass::AsciiString)]
    #[case::crlf(b"\xc3Status OK\r\n\xff", 1..12, DataClass::AsciiString)]
    #[case::crlf_nul(b"\xc3Status OK\r\n\0\xff", 1..13, DataClass::AsciiString)]
    #[case::pascal(b"\xc3\x09Copyright\xff", 1..11, DataClass::PascalString)]
    #[case::wide(b"\xc3F\0i\0l\0e\0.\0t\0x\0t\0\0\0\xff", 1..19, DataClass::WideString)]
    fn test_string_shapes(
        #[case] image: &[u8],
        #[case] range: Range<u32>,
        #[case] class: DataClass,
    ) {
        let (map, scan) = detect_in(image);
        let expected = CODE + range.start..CODE + range.end;
        assert_eq!(scan.strings, vec![(expected.clone(), class)]);
        for a in expected {
            assert_eq!(map.touch(a), class);
            assert_eq!(map.get(a).kind(), ByteKind::DataByte);
        }
    }

    #[test]
    fn test_unterminated_and_tiny_runs_are_ignored() {
        let (_, scan) = detect_in(b"\xc3abc\0\xffHello\xff");
        assert!(scan.strings.is_empty());
    }

    #[test]
    fn test_short_string_next_to_an_address_is_rejected() {
        let mut image = b"\xc3\xc3\xc3\xc3".to_vec();
        image.extend_from_slice(&CODE.to_le_bytes());
        image.extend_from_slice(b"abcd\0");
        let (_, scan) = detect_in(&image);
        assert!(scan.strings.is_empty());

        let mut image = b"\xc3\xc3\xc3\xc3".to_vec();
        image.extend_from_slice(&CODE.to_le_bytes());
        image.extend_from_slice(b"long enough\0");
        let (_, scan) = detect_in(&image);
        assert_eq!(scan.strings.len(), 1);
    }
}
