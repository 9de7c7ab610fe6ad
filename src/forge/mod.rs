//! Git hosting API abstraction.
//!
//! Provides the [`GitDataApi`] trait: the seven Git Data API calls needed to
//! build one commit out of uploaded files.  The publisher drives this trait
//! so that no GitHub URL construction or response parsing leaks outside this
//! module, and so tests can swap in an in-memory forge.

pub mod github;
pub mod rate_limit;

use serde::Serialize;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failed call to the hosting API.
///
/// `status` is the HTTP status for non-2xx responses and `None` when the
/// request never produced one (connect failure, timeout, unreadable body).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("GitHub API {}: {message}", outcome(.status))]
pub struct RemoteError {
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the response means "this ref does not exist yet".
    ///
    /// GitHub answers 404 for a missing branch and 409 ("Git Repository is
    /// empty") for a repository without any commit.
    pub fn is_not_found(&self) -> bool {
        matches!(self.status, Some(404 | 409))
    }
}

fn outcome(status: &Option<u16>) -> String {
    match status {
        Some(status) => format!("error ({status})"),
        None => "request failed".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Mode of a regular, non-executable file.
pub const REGULAR_FILE_MODE: &str = "100644";

/// One blob entry of a tree creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sha: String,
}

impl TreeEntry {
    pub fn blob(path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: REGULAR_FILE_MODE,
            kind: "blob",
            sha: sha.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The Git Data API calls a publish needs.  `repo` is always `owner/name`.
#[async_trait::async_trait]
pub trait GitDataApi: Send + Sync {
    /// Commit SHA that `refs/heads/{branch}` points at.
    async fn get_branch_head(&self, repo: &str, branch: &str) -> Result<String, RemoteError>;

    /// Root tree SHA of a commit.
    async fn get_commit_tree(&self, repo: &str, commit_sha: &str) -> Result<String, RemoteError>;

    /// Upload file content; returns the blob SHA.
    async fn create_blob(&self, repo: &str, content: &[u8]) -> Result<String, RemoteError>;

    /// Create a tree, layered over `base_tree` when given; returns the tree SHA.
    async fn create_tree(
        &self,
        repo: &str,
        base_tree: Option<&str>,
        entries: &[TreeEntry],
    ) -> Result<String, RemoteError>;

    /// Create a commit; returns its SHA.
    async fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String, RemoteError>;

    /// Move an existing branch to `sha` (fast-forward only).
    async fn update_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), RemoteError>;

    /// Create `refs/heads/{branch}` pointing at `sha`.
    async fn create_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), RemoteError>;
}
