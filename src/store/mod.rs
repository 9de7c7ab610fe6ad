//! Persistence for upload and repository records.
//!
//! An upload is extracted once and stored as an [`UploadRecord`]; a later
//! push re-reads the entries from here.  Two backends exist: [`MemoryStore`]
//! for single-process deployments and tests, and [`KeyDbStore`] backed by a
//! fred pool.

pub mod keydb;
pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveEntry;

pub use keydb::KeyDbStore;
pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Extracted,
    Pushed,
    Failed,
}

/// An extracted archive, kept until it is pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: String,
    pub user_id: String,
    pub original_filename: String,
    /// `zip` or `tar`.
    pub file_type: String,
    pub file_size: u64,
    pub entries: Vec<ArchiveEntry>,
    pub status: UploadStatus,
    /// Full name of the repository the upload was pushed to or linked with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A GitHub repository created through this service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRecord {
    pub id: String,
    pub user_id: String,
    pub github_repo_id: u64,
    pub name: String,
    pub full_name: String,
    pub html_url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub is_private: bool,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_upload(&self, record: &UploadRecord) -> Result<()>;

    /// Fetch an upload owned by `user_id`.  Uploads of other users read as
    /// absent.
    async fn get_upload(&self, id: &str, user_id: &str) -> Result<Option<UploadRecord>>;

    /// All uploads of `user_id`, newest first.
    async fn list_uploads(&self, user_id: &str) -> Result<Vec<UploadRecord>>;

    /// Set the status (and, if given, the linked repository) of an upload.
    /// Returns `false` when the upload does not exist.
    async fn update_upload(
        &self,
        id: &str,
        status: UploadStatus,
        repository: Option<&str>,
    ) -> Result<bool>;

    async fn put_repository(&self, record: &RepositoryRecord) -> Result<()>;

    /// All repositories created by `user_id`, newest first.
    async fn list_repositories(&self, user_id: &str) -> Result<Vec<RepositoryRecord>>;

    async fn ping(&self) -> Result<()>;
}
