//! ZIP listing via the `zip` crate.

use std::io::{Cursor, Read};

use super::{ArchiveEntry, ArchiveError, ExtractOptions, Extraction};

/// List every entry of a ZIP archive in central-directory order.
///
/// File bytes are decoded as UTF-8 with replacement characters, and the
/// reported size is the decoded length in characters.
pub fn read_zip(bytes: &[u8], options: &ExtractOptions) -> Result<Extraction, ArchiveError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(corrupt)?;
    let mut extraction = Extraction::default();

    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(corrupt)?;
        let path = file.name().to_string();

        if file.is_dir() {
            extraction.entries.push(ArchiveEntry::directory(path));
            continue;
        }

        let mut raw = Vec::new();
        file.read_to_end(&mut raw).map_err(|e| ArchiveError::Corrupt {
            format: "zip",
            reason: format!("{path}: {e}"),
        })?;

        let text = String::from_utf8_lossy(&raw).into_owned();
        let size = text.chars().count() as u64;
        let content = options.inlines(size).then_some(text);
        extraction.entries.push(ArchiveEntry::file(path, size, content));
    }

    Ok(extraction)
}

fn corrupt(err: zip::result::ZipError) -> ArchiveError {
    ArchiveError::Corrupt {
        format: "zip",
        reason: err.to_string(),
    }
}
