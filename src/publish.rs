//! One-commit publishing over the Git Data API.
//!
//! Given archive entries and a target branch, [`Publisher::publish`] uploads
//! every inline file as a blob, layers a tree over the branch head (if the
//! branch exists), commits it, and moves or creates the branch ref.
//!
//! The sequence is: resolve base → blobs (concurrent) → tree → commit → ref.
//! Only the base lookup may fail softly; every later failure aborts the
//! publish.  Blobs created before a failure are left for GitHub to collect.

use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::archive::ArchiveEntry;
use crate::config::PublishConfig;
use crate::forge::{GitDataApi, RemoteError, TreeEntry};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// None of the entries is a regular file with inline content.
    #[error("no files to push")]
    NoFiles,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// What the branch looked like before this publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchBase {
    /// The branch does not exist yet: root commit, new ref.
    NoBase,
    /// The branch exists: child commit over its tree, ref fast-forward.
    HasBase { commit_sha: String, tree_sha: String },
}

impl BranchBase {
    fn tree_sha(&self) -> Option<&str> {
        match self {
            Self::NoBase => None,
            Self::HasBase { tree_sha, .. } => Some(tree_sha),
        }
    }

    fn parents(&self) -> Vec<String> {
        match self {
            Self::NoBase => Vec::new(),
            Self::HasBase { commit_sha, .. } => vec![commit_sha.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResult {
    pub commit_sha: String,
    #[serde(rename = "filesCount")]
    pub file_count: usize,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub max_concurrent_blob_uploads: usize,
    /// Propagate branch-lookup failures other than "not found".
    pub strict_branch_lookup: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::from(&PublishConfig::default())
    }
}

impl From<&PublishConfig> for PublishOptions {
    fn from(config: &PublishConfig) -> Self {
        Self {
            max_concurrent_blob_uploads: config.max_concurrent_blob_uploads,
            strict_branch_lookup: config.strict_branch_lookup,
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct Publisher<'a> {
    api: &'a dyn GitDataApi,
    options: PublishOptions,
}

impl<'a> Publisher<'a> {
    pub fn new(api: &'a dyn GitDataApi, options: PublishOptions) -> Self {
        Self { api, options }
    }

    /// Commit every publishable entry to `branch` of `repo` as one commit.
    ///
    /// `message` falls back to a timestamped default when absent or blank.
    #[instrument(skip(self, entries, message), fields(%repo, %branch))]
    pub async fn publish(
        &self,
        repo: &str,
        branch: &str,
        entries: &[ArchiveEntry],
        message: Option<&str>,
    ) -> Result<PublishResult, PublishError> {
        let files: Vec<&ArchiveEntry> = entries.iter().filter(|e| e.is_publishable()).collect();
        if files.is_empty() {
            return Err(PublishError::NoFiles);
        }

        let started = Instant::now();
        let base = self.resolve_base(repo, branch).await?;
        debug!(?base, files = files.len(), "branch base resolved");

        let tree_entries = self.upload_blobs(repo, &files).await?;
        let tree_sha = self
            .api
            .create_tree(repo, base.tree_sha(), &tree_entries)
            .await?;

        let message = match message.map(str::trim) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => default_commit_message(),
        };
        let commit_sha = self
            .api
            .create_commit(repo, &message, &tree_sha, &base.parents())
            .await?;

        match base {
            BranchBase::HasBase { .. } => self.api.update_branch(repo, branch, &commit_sha).await?,
            BranchBase::NoBase => self.api.create_branch(repo, branch, &commit_sha).await?,
        }

        info!(
            %commit_sha,
            files = files.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "published commit"
        );

        Ok(PublishResult {
            commit_sha,
            file_count: files.len(),
            branch: branch.to_string(),
        })
    }

    /// Look up the branch head and its tree.  A missing branch is `NoBase`.
    async fn resolve_base(&self, repo: &str, branch: &str) -> Result<BranchBase, RemoteError> {
        let lookup = async {
            let commit_sha = self.api.get_branch_head(repo, branch).await?;
            let tree_sha = self.api.get_commit_tree(repo, &commit_sha).await?;
            Ok::<_, RemoteError>(BranchBase::HasBase {
                commit_sha,
                tree_sha,
            })
        };

        match lookup.await {
            Ok(base) => Ok(base),
            Err(err) if err.is_not_found() => {
                debug!(error = %err, "branch not found, creating it");
                Ok(BranchBase::NoBase)
            }
            Err(err) if !self.options.strict_branch_lookup => {
                warn!(error = %err, "branch lookup failed, treating as first push");
                Ok(BranchBase::NoBase)
            }
            Err(err) => Err(err),
        }
    }

    /// Upload all blobs with bounded concurrency.  The returned entries keep
    /// the input order; the first failure cancels the rest.
    async fn upload_blobs(
        &self,
        repo: &str,
        files: &[&ArchiveEntry],
    ) -> Result<Vec<TreeEntry>, RemoteError> {
        let concurrency = self.options.max_concurrent_blob_uploads.max(1);
        // Owned inputs keep the buffered futures free of borrowed entry
        // lifetimes, so callers' futures stay `Send` for any lifetime.
        let uploads: Vec<(String, String)> = files
            .iter()
            .map(|entry| {
                let path = repository_path(&entry.path).to_string();
                (path, entry.content.clone().unwrap_or_default())
            })
            .collect();
        let api: &dyn GitDataApi = self.api;

        stream::iter(uploads.into_iter().map(|(path, content)| async move {
            let sha = api.create_blob(repo, content.as_bytes()).await?;
            Ok::<_, RemoteError>(TreeEntry::blob(path, sha))
        }))
        .buffered(concurrency)
        .try_collect()
        .await
    }
}

/// Drop the archive's top-level folder: everything up to and including the
/// first `/`.  Paths without a leading segment are kept as they are.
pub fn repository_path(archive_path: &str) -> &str {
    match archive_path.find('/') {
        Some(i) if i > 0 => &archive_path[i + 1..],
        _ => archive_path,
    }
}

fn default_commit_message() -> String {
    format!(
        "Upload files from {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        GetRef(String),
        GetCommit(String),
        CreateBlob(String),
        CreateTree {
            base: Option<String>,
            entries: Vec<TreeEntry>,
        },
        CreateCommit {
            message: String,
            tree: String,
            parents: Vec<String>,
        },
        UpdateRef {
            branch: String,
            sha: String,
        },
        CreateRef {
            branch: String,
            sha: String,
        },
    }

    /// In-memory forge that records every call.
    #[derive(Default)]
    pub(crate) struct FakeForge {
        /// `(commit, tree)` of the existing branch head, if any.
        pub head: Option<(String, String)>,
        /// Returned by the ref lookup instead of a 404 / the head.
        pub lookup_error: Option<RemoteError>,
        /// Blob uploads with exactly this content fail.
        pub failing_blob: Option<String>,
        pub calls: Mutex<Vec<Call>>,
    }

    impl FakeForge {
        pub(crate) fn with_head(commit: &str, tree: &str) -> Self {
            Self {
                head: Some((commit.to_string(), tree.to_string())),
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait::async_trait]
    impl GitDataApi for FakeForge {
        async fn get_branch_head(&self, _repo: &str, branch: &str) -> Result<String, RemoteError> {
            self.record(Call::GetRef(branch.to_string()));
            if let Some(err) = &self.lookup_error {
                return Err(err.clone());
            }
            self.head
                .as_ref()
                .map(|(commit, _)| commit.clone())
                .ok_or_else(|| RemoteError::status(404, "Not Found"))
        }

        async fn get_commit_tree(&self, _repo: &str, commit_sha: &str) -> Result<String, RemoteError> {
            self.record(Call::GetCommit(commit_sha.to_string()));
            self.head
                .as_ref()
                .map(|(_, tree)| tree.clone())
                .ok_or_else(|| RemoteError::status(404, "Not Found"))
        }

        async fn create_blob(&self, _repo: &str, content: &[u8]) -> Result<String, RemoteError> {
            let text = String::from_utf8_lossy(content).into_owned();
            self.record(Call::CreateBlob(text.clone()));
            if self.failing_blob.as_deref() == Some(text.as_str()) {
                return Err(RemoteError::status(403, "Resource not accessible by integration"));
            }
            Ok(format!("blob:{text}"))
        }

        async fn create_tree(
            &self,
            _repo: &str,
            base_tree: Option<&str>,
            entries: &[TreeEntry],
        ) -> Result<String, RemoteError> {
            self.record(Call::CreateTree {
                base: base_tree.map(str::to_string),
                entries: entries.to_vec(),
            });
            Ok("t1".to_string())
        }

        async fn create_commit(
            &self,
            _repo: &str,
            message: &str,
            tree_sha: &str,
            parents: &[String],
        ) -> Result<String, RemoteError> {
            self.record(Call::CreateCommit {
                message: message.to_string(),
                tree: tree_sha.to_string(),
                parents: parents.to_vec(),
            });
            Ok("c1".to_string())
        }

        async fn update_branch(&self, _repo: &str, branch: &str, sha: &str) -> Result<(), RemoteError> {
            self.record(Call::UpdateRef {
                branch: branch.to_string(),
                sha: sha.to_string(),
            });
            Ok(())
        }

        async fn create_branch(&self, _repo: &str, branch: &str, sha: &str) -> Result<(), RemoteError> {
            self.record(Call::CreateRef {
                branch: branch.to_string(),
                sha: sha.to_string(),
            });
            Ok(())
        }
    }

    fn entries() -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry::directory("project-main/"),
            ArchiveEntry::directory("project-main/src/"),
            ArchiveEntry::file("project-main/src/index.js", 12, Some("console.log".into())),
            ArchiveEntry::file("project-main/README.md", 2, Some("hi".into())),
            ArchiveEntry::file("project-main/big.bin", 500_000, None),
        ]
    }

    fn options() -> PublishOptions {
        PublishOptions {
            max_concurrent_blob_uploads: 2,
            ..PublishOptions::default()
        }
    }

    fn strict() -> PublishOptions {
        PublishOptions {
            strict_branch_lookup: true,
            ..options()
        }
    }

    // ── Path stripping ──────────────────────────────────────────────────

    #[test]
    fn repository_path_drops_first_segment() {
        assert_eq!(repository_path("project-main/src/index.js"), "src/index.js");
        assert_eq!(repository_path("top/file.txt"), "file.txt");
        assert_eq!(repository_path("README.md"), "README.md");
        assert_eq!(repository_path("/abs/path"), "/abs/path");
    }

    // ── Branch handling ─────────────────────────────────────────────────

    #[tokio::test]
    async fn new_branch_gets_root_commit_and_created_ref() {
        let forge = FakeForge::default();
        let result = Publisher::new(&forge, options())
            .publish("octo/demo", "main", &entries(), Some("initial import"))
            .await
            .unwrap();

        assert_eq!(
            result,
            PublishResult {
                commit_sha: "c1".into(),
                file_count: 2,
                branch: "main".into(),
            }
        );
        assert_eq!(
            forge.calls(),
            vec![
                Call::GetRef("main".into()),
                Call::CreateBlob("console.log".into()),
                Call::CreateBlob("hi".into()),
                Call::CreateTree {
                    base: None,
                    entries: vec![
                        TreeEntry::blob("src/index.js", "blob:console.log"),
                        TreeEntry::blob("README.md", "blob:hi"),
                    ],
                },
                Call::CreateCommit {
                    message: "initial import".into(),
                    tree: "t1".into(),
                    parents: vec![],
                },
                Call::CreateRef {
                    branch: "main".into(),
                    sha: "c1".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn existing_branch_gets_child_commit_over_base_tree() {
        let forge = FakeForge::with_head("c0", "t0");
        Publisher::new(&forge, options())
            .publish("octo/demo", "main", &entries(), Some("update"))
            .await
            .unwrap();

        let calls = forge.calls();
        assert_eq!(calls[0], Call::GetRef("main".into()));
        assert_eq!(calls[1], Call::GetCommit("c0".into()));
        assert!(calls.contains(&Call::CreateCommit {
            message: "update".into(),
            tree: "t1".into(),
            parents: vec!["c0".into()],
        }));
        assert!(matches!(
            calls.iter().find(|c| matches!(c, Call::CreateTree { .. })),
            Some(Call::CreateTree { base: Some(base), .. }) if base == "t0"
        ));
        assert_eq!(
            calls.last(),
            Some(&Call::UpdateRef {
                branch: "main".into(),
                sha: "c1".into(),
            })
        );
        assert!(!calls.iter().any(|c| matches!(c, Call::CreateRef { .. })));
    }

    #[tokio::test]
    async fn empty_repository_conflict_means_no_base() {
        let forge = FakeForge {
            lookup_error: Some(RemoteError::status(409, "Git Repository is empty.")),
            ..FakeForge::default()
        };
        Publisher::new(&forge, strict())
            .publish("octo/demo", "main", &entries(), None)
            .await
            .unwrap();

        assert!(matches!(forge.calls().last(), Some(Call::CreateRef { .. })));
    }

    #[tokio::test]
    async fn strict_lookup_propagates_auth_failures() {
        let forge = FakeForge {
            lookup_error: Some(RemoteError::status(401, "Bad credentials")),
            ..FakeForge::default()
        };
        let err = Publisher::new(&forge, strict())
            .publish("octo/demo", "main", &entries(), None)
            .await
            .unwrap_err();

        assert!(
            matches!(err, PublishError::Remote(ref e) if e.status == Some(401)),
            "got {err:?}"
        );
        assert_eq!(forge.calls(), vec![Call::GetRef("main".into())]);
    }

    #[tokio::test]
    async fn lenient_lookup_swallows_every_failure() {
        let failures = [
            RemoteError::transport("connection reset"),
            RemoteError::status(401, "Bad credentials"),
            RemoteError::status(502, "Bad Gateway"),
        ];
        for failure in failures {
            let forge = FakeForge {
                lookup_error: Some(failure),
                ..FakeForge::default()
            };
            let result = Publisher::new(&forge, PublishOptions::default())
                .publish("octo/demo", "main", &entries(), None)
                .await
                .unwrap();

            assert_eq!(result.file_count, 2);
            assert!(matches!(forge.calls().last(), Some(Call::CreateRef { .. })));
        }
    }

    #[test]
    fn lookup_is_lenient_unless_configured() {
        assert!(!PublishOptions::default().strict_branch_lookup);
    }

    // ── Preconditions and failures ──────────────────────────────────────

    #[tokio::test]
    async fn nothing_publishable_makes_no_remote_call() {
        let forge = FakeForge::default();
        let only_dirs_and_large = vec![
            ArchiveEntry::directory("p/"),
            ArchiveEntry::file("p/huge.bin", 1 << 20, None),
        ];
        let err = Publisher::new(&forge, options())
            .publish("octo/demo", "main", &only_dirs_and_large, None)
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::NoFiles));
        assert!(forge.calls().is_empty());

        let err = Publisher::new(&forge, options())
            .publish("octo/demo", "main", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NoFiles));
        assert!(forge.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_blob_aborts_before_tree() {
        let forge = FakeForge {
            failing_blob: Some("hi".into()),
            ..FakeForge::with_head("c0", "t0")
        };
        let err = Publisher::new(&forge, options())
            .publish("octo/demo", "main", &entries(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Remote(ref e) if e.status == Some(403)));
        assert!(!forge
            .calls()
            .iter()
            .any(|c| matches!(c, Call::CreateTree { .. } | Call::CreateCommit { .. })));
    }

    // ── Commit message ──────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_or_blank_message_gets_timestamped_default() {
        for message in [None, Some("   ")] {
            let forge = FakeForge::default();
            Publisher::new(&forge, options())
                .publish("octo/demo", "main", &entries(), message)
                .await
                .unwrap();

            let commit_message = forge
                .calls()
                .into_iter()
                .find_map(|c| match c {
                    Call::CreateCommit { message, .. } => Some(message),
                    _ => None,
                })
                .unwrap();
            assert!(commit_message.starts_with("Upload files from "));
            assert!(commit_message.ends_with('Z'));
        }
    }

    // ── Entry selection ─────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_files_are_published() {
        let forge = FakeForge::default();
        let with_empty = vec![ArchiveEntry::file("p/.gitkeep", 0, Some(String::new()))];
        let result = Publisher::new(&forge, options())
            .publish("octo/demo", "dev", &with_empty, None)
            .await
            .unwrap();

        assert_eq!(result.file_count, 1);
        assert_eq!(result.branch, "dev");
        assert!(forge.calls().contains(&Call::CreateBlob(String::new())));
    }

    #[tokio::test]
    async fn tree_order_follows_input_under_concurrency() {
        let forge = FakeForge::default();
        let many: Vec<ArchiveEntry> = (0..20)
            .map(|i| ArchiveEntry::file(format!("p/f{i:02}.txt"), 1, Some(format!("{i}"))))
            .collect();
        let options = PublishOptions {
            max_concurrent_blob_uploads: 8,
            ..options()
        };
        Publisher::new(&forge, options)
            .publish("octo/demo", "main", &many, None)
            .await
            .unwrap();

        let tree = forge
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::CreateTree { entries, .. } => Some(entries),
                _ => None,
            })
            .unwrap();
        let paths: Vec<_> = tree.iter().map(|e| e.path.clone()).collect();
        let expected: Vec<_> = (0..20).map(|i| format!("f{i:02}.txt")).collect();
        assert_eq!(paths, expected);
    }

    #[tokio::test]
    async fn publish_future_can_be_spawned() {
        let forge = std::sync::Arc::new(FakeForge::default());
        let task = tokio::spawn({
            let forge = std::sync::Arc::clone(&forge);
            async move {
                let entries = entries();
                let publisher = Publisher::new(forge.as_ref(), options());
                publisher
                    .publish("octo/demo", "main", &entries, None)
                    .await
                    .map(|result| result.file_count)
            }
        });

        assert_eq!(task.await.unwrap().unwrap(), 2);
        assert_eq!(
            forge.calls().iter().filter(|c| matches!(c, Call::CreateBlob(_))).count(),
            2
        );
    }

    #[test]
    fn result_wire_shape() {
        let result = PublishResult {
            commit_sha: "c1".into(),
            file_count: 3,
            branch: "main".into(),
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({"commitSha": "c1", "filesCount": 3, "branch": "main"})
        );
    }
}
