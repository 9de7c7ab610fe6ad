//! Hand-rolled TAR (ustar) walker.
//!
//! A TAR stream is a flat run of 512-byte blocks: a header block followed by
//! the entry's content rounded up to a whole number of blocks, repeated until
//! an all-zero header or the end of the buffer.  Only the three header fields
//! a preview needs are decoded: name, size and type flag.

use std::ops::Range;

use tracing::{debug, trace};

use super::{ArchiveEntry, ExtractOptions, Extraction, ParseWarning};

const BLOCK_SIZE: usize = 512;
const NAME_FIELD: Range<usize> = 0..100;
const SIZE_FIELD: Range<usize> = 124..136;
const TYPEFLAG_OFFSET: usize = 156;
const DIRECTORY_TYPEFLAG: u8 = b'5';

/// Pseudo-entry written by `git archive` and pax-aware tars; carries no path.
const PAX_GLOBAL_HEADER: &str = "pax_global_header";

/// Walk `buf` as a TAR archive.  Never fails; see [`ParseWarning`].
pub fn walk(buf: &[u8], options: &ExtractOptions) -> Extraction {
    let mut extraction = Extraction::default();
    let mut offset = 0usize;

    while buf.len().saturating_sub(offset) >= BLOCK_SIZE {
        let header = &buf[offset..offset + BLOCK_SIZE];

        // End-of-archive marker; must be checked before decoding the name.
        if header.iter().all(|&b| b == 0) {
            trace!(offset, "zero block, end of archive");
            break;
        }

        let name = decode_name(&header[NAME_FIELD]);
        let size = match parse_octal_size(&header[SIZE_FIELD]) {
            Some(size) => size,
            None => {
                extraction.warnings.push(ParseWarning::MalformedSize {
                    path: name.clone(),
                    raw: raw_field_text(&header[SIZE_FIELD]),
                });
                0
            }
        };
        let is_directory = header[TYPEFLAG_OFFSET] == DIRECTORY_TYPEFLAG || name.ends_with('/');

        if name.is_empty() || name == PAX_GLOBAL_HEADER {
            trace!(offset, %name, size, "skipping pseudo-entry");
        } else if is_directory {
            extraction.entries.push(ArchiveEntry::directory(name));
        } else {
            let content_start = offset + BLOCK_SIZE;
            let entry = read_file(buf, content_start, name, size, options, &mut extraction.warnings);
            extraction.entries.push(entry);
        }

        match entry_span(size).and_then(|span| offset.checked_add(span)) {
            Some(next) => offset = next,
            None => {
                debug!(offset, size, "entry span overflows, stopping walk");
                break;
            }
        }
    }

    extraction
}

/// Build a file entry whose content starts at `start`.  Padding past `size`
/// is never part of the content.
fn read_file(
    buf: &[u8],
    start: usize,
    name: String,
    size: u64,
    options: &ExtractOptions,
    warnings: &mut Vec<ParseWarning>,
) -> ArchiveEntry {
    let available = buf.len() - start;
    let wanted = usize::try_from(size).unwrap_or(usize::MAX);
    if wanted > available {
        warnings.push(ParseWarning::TruncatedContent {
            path: name.clone(),
            declared: size,
            available: available as u64,
        });
    }
    let bytes = &buf[start..start + wanted.min(available)];

    let content = if options.inlines(size) {
        match std::str::from_utf8(bytes) {
            Ok(text) => Some(text.to_owned()),
            Err(_) => {
                warnings.push(ParseWarning::UndecodableContent { path: name.clone() });
                Some(String::new())
            }
        }
    } else {
        None
    };

    ArchiveEntry::file(name, size, content)
}

/// Header block plus content blocks for an entry of `size` bytes.
pub(crate) fn entry_span(size: u64) -> Option<usize> {
    let blocks = size.div_ceil(BLOCK_SIZE as u64);
    let content = blocks.checked_mul(BLOCK_SIZE as u64)?;
    let span = content.checked_add(BLOCK_SIZE as u64)?;
    usize::try_from(span).ok()
}

/// NUL-terminated (or field-filling) name, one character per byte.
fn decode_name(field: &[u8]) -> String {
    field
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}

/// Parse the space/NUL padded octal size field.
///
/// Leading and trailing padding is trimmed and the leading run of octal digits
/// is used.  Returns `None` when there is no digit at all or the value does
/// not fit in a `u64`.
pub(crate) fn parse_octal_size(field: &[u8]) -> Option<u64> {
    let trimmed = trim_padding(field);
    let digits = trimmed
        .iter()
        .take_while(|b| (b'0'..=b'7').contains(*b))
        .count();
    if digits == 0 {
        return None;
    }
    trimmed[..digits].iter().try_fold(0u64, |acc, &b| {
        acc.checked_mul(8)?.checked_add(u64::from(b - b'0'))
    })
}

fn trim_padding(field: &[u8]) -> &[u8] {
    let is_pad = |b: &u8| *b == 0 || b.is_ascii_whitespace();
    let start = field.iter().position(|b| !is_pad(b)).unwrap_or(field.len());
    let end = field.iter().rposition(|b| !is_pad(b)).map_or(start, |i| i + 1);
    &field[start..end]
}

fn raw_field_text(field: &[u8]) -> String {
    String::from_utf8_lossy(trim_padding(field)).into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A header block with the given name, raw size field and type flag.
    pub(crate) fn header(name: &str, size_field: &[u8], typeflag: u8) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        block[SIZE_FIELD.start..SIZE_FIELD.start + size_field.len()].copy_from_slice(size_field);
        block[TYPEFLAG_OFFSET] = typeflag;
        // Magic, so the header looks like something a real tar wrote.
        block[257..263].copy_from_slice(b"ustar\0");
        block
    }

    pub(crate) fn octal(size: usize) -> Vec<u8> {
        format!("{size:011o}\0").into_bytes()
    }

    /// Header plus padded content for a regular file.
    pub(crate) fn file_block(name: &str, content: &[u8]) -> Vec<u8> {
        let mut out = header(name, &octal(content.len()), b'0');
        out.extend_from_slice(content);
        let padding = (BLOCK_SIZE - content.len() % BLOCK_SIZE) % BLOCK_SIZE;
        out.extend(std::iter::repeat(0u8).take(padding));
        out
    }

    pub(crate) fn dir_block(name: &str) -> Vec<u8> {
        header(name, &octal(0), DIRECTORY_TYPEFLAG)
    }

    fn zero_block() -> Vec<u8> {
        vec![0u8; BLOCK_SIZE]
    }

    fn walk_default(buf: &[u8]) -> Extraction {
        walk(buf, &ExtractOptions::default())
    }

    // ── End-to-end ─────────────────────────────────────────────────────

    #[test]
    fn directory_then_file_then_terminator() {
        let mut buf = dir_block("docs/");
        buf.extend(file_block("docs/readme.txt", b"hello world!\n"));
        buf.extend(zero_block());

        let extraction = walk_default(&buf);
        assert_eq!(
            extraction.entries,
            vec![
                ArchiveEntry::directory("docs/"),
                ArchiveEntry::file("docs/readme.txt", 13, Some("hello world!\n".into())),
            ]
        );
        assert!(extraction.warnings.is_empty());
    }

    #[test]
    fn input_exhausted_without_terminator() {
        let mut buf = file_block("p/a.txt", b"a");
        buf.extend(file_block("p/b.txt", b"bb"));

        let extraction = walk_default(&buf);
        let paths: Vec<_> = extraction.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["p/a.txt", "p/b.txt"]);
    }

    #[test]
    fn short_buffer_yields_nothing() {
        assert!(walk_default(&[]).entries.is_empty());
        assert!(walk_default(&[b'x'; 511]).entries.is_empty());
    }

    // ── Termination ────────────────────────────────────────────────────

    #[test]
    fn zero_block_halts_even_with_trailing_data() {
        let mut buf = file_block("p/first.txt", b"1");
        buf.extend(zero_block());
        buf.extend(file_block("p/hidden.txt", b"2"));

        let extraction = walk_default(&buf);
        assert_eq!(extraction.entries.len(), 1);
        assert_eq!(extraction.entries[0].path, "p/first.txt");
    }

    // ── Cursor arithmetic ──────────────────────────────────────────────

    #[test]
    fn entry_span_rounds_up_to_blocks() {
        assert_eq!(entry_span(0), Some(512));
        assert_eq!(entry_span(1), Some(1024));
        assert_eq!(entry_span(512), Some(1024));
        assert_eq!(entry_span(513), Some(1536));
        assert_eq!(entry_span(u64::MAX), None);
    }

    #[test]
    fn multi_block_content_is_skipped_exactly() {
        let big = vec![b'x'; 513];
        let mut buf = file_block("p/big.txt", &big);
        assert_eq!(buf.len(), 512 + 1024);
        buf.extend(file_block("p/next.txt", b"next"));

        let extraction = walk_default(&buf);
        assert_eq!(extraction.entries.len(), 2);
        assert_eq!(extraction.entries[0].size, 513);
        assert_eq!(extraction.entries[0].content.as_deref().map(str::len), Some(513));
        assert_eq!(
            extraction.entries[1],
            ArchiveEntry::file("p/next.txt", 4, Some("next".into()))
        );
    }

    #[test]
    fn padding_is_not_content() {
        let buf = file_block("p/a.txt", b"abc");
        let extraction = walk_default(&buf);
        assert_eq!(extraction.entries[0].content.as_deref(), Some("abc"));
    }

    // ── Skipped pseudo-entries ─────────────────────────────────────────

    #[test]
    fn pax_global_header_is_skipped_but_its_content_is_consumed() {
        let pax = b"52 comment=0123456789abcdef0123456789abcdef01234567\n";
        let mut buf = header("pax_global_header", &octal(pax.len()), b'g');
        buf.extend_from_slice(pax);
        buf.extend(vec![0u8; BLOCK_SIZE - pax.len()]);
        buf.extend(file_block("proj/main.rs", b"fn main() {}\n"));
        buf.extend(zero_block());

        let extraction = walk_default(&buf);
        assert_eq!(
            extraction.entries,
            vec![ArchiveEntry::file(
                "proj/main.rs",
                13,
                Some("fn main() {}\n".into())
            )]
        );
    }

    #[test]
    fn empty_name_is_skipped() {
        let mut buf = header("", &octal(3), b'0');
        buf.extend_from_slice(b"xyz");
        buf.extend(vec![0u8; BLOCK_SIZE - 3]);
        buf.extend(file_block("p/ok.txt", b"ok"));

        let extraction = walk_default(&buf);
        assert_eq!(extraction.entries.len(), 1);
        assert_eq!(extraction.entries[0].path, "p/ok.txt");
    }

    // ── Header fields ──────────────────────────────────────────────────

    #[test]
    fn trailing_slash_marks_directory() {
        let buf = header("p/sub/", &octal(0), b'0');
        let extraction = walk_default(&buf);
        assert_eq!(extraction.entries, vec![ArchiveEntry::directory("p/sub/")]);
    }

    #[test]
    fn directory_typeflag_without_slash() {
        let buf = header("p/sub", &octal(0), b'5');
        let extraction = walk_default(&buf);
        assert!(extraction.entries[0].is_directory);
        assert_eq!(extraction.entries[0].content, None);
    }

    #[test]
    fn name_filling_the_whole_field() {
        let name = "n".repeat(100);
        let buf = header(&name, &octal(0), b'0');
        let extraction = walk_default(&buf);
        assert_eq!(extraction.entries[0].path, name);
    }

    #[test]
    fn octal_size_parsing() {
        assert_eq!(parse_octal_size(b"00000000015\0"), Some(13));
        assert_eq!(parse_octal_size(b"        15 \0"), Some(13));
        assert_eq!(parse_octal_size(b"0000644\0    "), Some(0o644));
        assert_eq!(parse_octal_size(b"17z"), Some(0o17));
        assert_eq!(parse_octal_size(b"\0\0\0\0"), None);
        assert_eq!(parse_octal_size(b"zzzz"), None);
        assert_eq!(parse_octal_size(b"8"), None);
        assert_eq!(parse_octal_size(b"77777777777777777777777"), None);
    }

    #[test]
    fn malformed_size_becomes_zero_with_warning() {
        let mut buf = header("p/bad.txt", b"not-octal\0", b'0');
        buf.extend(file_block("p/good.txt", b"good"));

        let extraction = walk_default(&buf);
        assert_eq!(
            extraction.entries,
            vec![
                ArchiveEntry::file("p/bad.txt", 0, Some(String::new())),
                ArchiveEntry::file("p/good.txt", 4, Some("good".into())),
            ]
        );
        assert_eq!(
            extraction.warnings,
            vec![ParseWarning::MalformedSize {
                path: "p/bad.txt".into(),
                raw: "not-octal".into(),
            }]
        );
    }

    // ── Content decoding ───────────────────────────────────────────────

    #[test]
    fn non_utf8_content_becomes_empty_text() {
        let buf = file_block("p/blob.bin", &[0xff, 0xfe, 0x00, 0x80]);
        let extraction = walk_default(&buf);
        assert_eq!(
            extraction.entries,
            vec![ArchiveEntry::file("p/blob.bin", 4, Some(String::new()))]
        );
        assert_eq!(
            extraction.warnings,
            vec![ParseWarning::UndecodableContent {
                path: "p/blob.bin".into()
            }]
        );
    }

    #[test]
    fn content_at_or_above_threshold_is_omitted() {
        let options = ExtractOptions {
            inline_threshold: 4,
        };
        let mut buf = file_block("p/three.txt", b"abc");
        buf.extend(file_block("p/four.txt", b"abcd"));
        buf.extend(file_block("p/ten.txt", b"0123456789"));

        let extraction = walk(&buf, &options);
        assert_eq!(extraction.entries[0].content.as_deref(), Some("abc"));
        assert_eq!(extraction.entries[1].content, None);
        assert_eq!(extraction.entries[1].size, 4);
        assert_eq!(extraction.entries[2].content, None);
        assert_eq!(extraction.entries[2].size, 10);
    }

    #[test]
    fn truncated_content_is_clamped() {
        let mut buf = header("p/cut.txt", &octal(600), b'0');
        buf.extend_from_slice(b"partial");

        let extraction = walk_default(&buf);
        assert_eq!(
            extraction.entries,
            vec![ArchiveEntry::file("p/cut.txt", 600, Some("partial".into()))]
        );
        assert_eq!(
            extraction.warnings,
            vec![ParseWarning::TruncatedContent {
                path: "p/cut.txt".into(),
                declared: 600,
                available: 7,
            }]
        );
    }

    #[test]
    fn duplicate_paths_are_kept() {
        let mut buf = file_block("p/a.txt", b"one");
        buf.extend(file_block("p/a.txt", b"two"));

        let extraction = walk_default(&buf);
        assert_eq!(extraction.entries.len(), 2);
        assert_eq!(extraction.entries[1].content.as_deref(), Some("two"));
    }
}
