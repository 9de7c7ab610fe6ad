//! Archive extraction for uploaded bundles.
//!
//! Turns the raw bytes of an uploaded `.zip`, `.tar`, `.tar.gz` or `.tgz`
//! file into an ordered list of [`ArchiveEntry`] values suitable for a
//! preview and for a later push.  ZIP decoding is delegated to the `zip`
//! crate; TAR is walked by hand in [`tar_handler`].
//!
//! Extraction is lenient: a malformed TAR size field or a file whose bytes
//! are not valid UTF-8 never aborts the walk.  Such conditions are reported
//! as [`ParseWarning`]s next to the entries instead.

pub mod tar_handler;
pub mod zip_handler;

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Files at or above this size (bytes for TAR, characters for ZIP) are
/// listed without their text content.
pub const DEFAULT_INLINE_THRESHOLD: usize = 100_000;

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

/// Archive container formats accepted for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    /// Gzip-compressed TAR (`.tar.gz` / `.tgz`).
    TarGz,
}

impl ArchiveFormat {
    /// Pick the format from the uploaded file name (case-insensitive).
    pub fn from_filename(filename: &str) -> Result<Self, ArchiveError> {
        let lower = filename.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Ok(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Ok(Self::Tar)
        } else {
            Err(ArchiveError::UnsupportedFormat(filename.to_string()))
        }
    }

    /// Tag persisted on upload records.  Compressed and plain TAR share `tar`.
    pub fn file_type(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar | Self::TarGz => "tar",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The declared archive type is not one we can read.
    #[error("unsupported file type {0:?}: use .zip, .tar, .tar.gz or .tgz")]
    UnsupportedFormat(String),
    /// The byte stream could not be parsed as the declared format.
    #[error("corrupt {format} archive: {reason}")]
    Corrupt {
        format: &'static str,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One file or directory listed in an archive.
///
/// `content` is `None` both for directories and for files too large to
/// inline; an empty file carries `Some("")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ArchiveEntry {
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            is_directory: true,
            content: None,
        }
    }

    pub fn file(path: impl Into<String>, size: u64, content: Option<String>) -> Self {
        Self {
            path: path.into(),
            size,
            is_directory: false,
            content,
        }
    }

    /// Whether this entry can be committed: a regular file with inline text.
    pub fn is_publishable(&self) -> bool {
        !self.is_directory && self.content.is_some()
    }
}

/// A non-fatal oddity met while walking an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseWarning {
    /// The header size field held no octal number; the entry was read as
    /// zero bytes long.
    MalformedSize { path: String, raw: String },
    /// The file bytes were not valid UTF-8; the content was replaced by an
    /// empty string.
    UndecodableContent { path: String },
    /// The archive ended before the declared number of content bytes.
    TruncatedContent {
        path: String,
        declared: u64,
        available: u64,
    },
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedSize { path, raw } => {
                write!(f, "{path}: malformed size field {raw:?}, assuming 0")
            }
            Self::UndecodableContent { path } => {
                write!(f, "{path}: content is not valid UTF-8, using empty text")
            }
            Self::TruncatedContent {
                path,
                declared,
                available,
            } => write!(
                f,
                "{path}: declared {declared} bytes but only {available} remain"
            ),
        }
    }
}

/// Result of one extraction: the entries in archive order plus any warnings.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entries: Vec<ArchiveEntry>,
    pub warnings: Vec<ParseWarning>,
}

impl Extraction {
    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_directory).count()
    }

    pub fn directory_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_directory).count()
    }
}

/// Tunables for [`extract`].
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Entries whose size is below this value get their text inlined.
    pub inline_threshold: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }
}

impl ExtractOptions {
    pub(crate) fn inlines(&self, size: u64) -> bool {
        size < self.inline_threshold as u64
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Extract the entry list from an in-memory archive.
pub fn extract(
    bytes: &[u8],
    format: ArchiveFormat,
    options: &ExtractOptions,
) -> Result<Extraction, ArchiveError> {
    let extraction = match format {
        ArchiveFormat::Zip => zip_handler::read_zip(bytes, options)?,
        ArchiveFormat::Tar => tar_handler::walk(bytes, options),
        ArchiveFormat::TarGz => {
            let tar = gunzip(bytes)?;
            debug!(
                compressed = bytes.len(),
                decompressed = tar.len(),
                "gzip payload decompressed"
            );
            tar_handler::walk(&tar, options)
        }
    };

    for warning in &extraction.warnings {
        warn!(%warning, "archive parse warning");
    }

    Ok(extraction)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ArchiveError::Corrupt {
            format: "gzip",
            reason: e.to_string(),
        })?;
    Ok(out)
}
