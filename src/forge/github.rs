//! GitHub / GitHub Enterprise REST client.
//!
//! One [`GitHubClient`] is built per request around the caller's access
//! token; the underlying `reqwest::Client` (and its connection pool) is
//! shared.  Besides the [`GitDataApi`] calls used for publishing, the client
//! covers repository creation, listing and tree browsing.

use std::sync::Arc;

use base64::Engine;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::rate_limit::RateLimitState;
use super::{GitDataApi, RemoteError, TreeEntry};
use crate::metrics::Metrics;

const ACCEPT: &str = "application/vnd.github.v3+json";

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: ShaRef,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    tree: ShaRef,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<RepoFile>,
    #[serde(default)]
    truncated: bool,
}

/// Repository as returned by `/user/repos`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubRepository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub html_url: String,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// One item of a recursive tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFile {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: u64,
    pub sha: String,
}

/// Contents of a branch, flattened.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoTree {
    pub branch: String,
    pub commit_sha: String,
    pub files: Vec<RepoFile>,
    /// Number of blobs in `files`.
    pub total_files: usize,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    rate_limit: RateLimitState,
    metrics: Arc<Metrics>,
}

impl GitHubClient {
    pub fn new(
        http: reqwest::Client,
        api_url: &str,
        token: impl Into<String>,
        rate_limit: RateLimitState,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.into(),
            rate_limit,
            metrics,
        }
    }

    /// Create a repository owned by the authenticated user, without an
    /// initial commit.
    pub async fn create_repository(
        &self,
        name: &str,
        description: Option<&str>,
        private: bool,
    ) -> Result<GitHubRepository, RemoteError> {
        let body = json!({
            "name": name,
            "description": description.unwrap_or_default(),
            "private": private,
            "auto_init": false,
        });
        let url = self.url(&["user", "repos"])?;
        self.call("create_repository", Method::POST, url, Some(&body))
            .await
    }

    /// The authenticated user's repositories, most recently updated first.
    pub async fn list_repositories(&self) -> Result<Vec<GitHubRepository>, RemoteError> {
        let mut url = self.url(&["user", "repos"])?;
        url.query_pairs_mut()
            .append_pair("sort", "updated")
            .append_pair("per_page", "100");
        self.call("list_repositories", Method::GET, url, None).await
    }

    /// Every path reachable from the head of `branch`.
    pub async fn list_tree(&self, repo: &str, branch: &str) -> Result<RepoTree, RemoteError> {
        let commit_sha = self.get_branch_head(repo, branch).await?;
        let tree_sha = self.get_commit_tree(repo, &commit_sha).await?;
        let mut url = self.url(&["repos", repo, "git", "trees", tree_sha.as_str()])?;
        url.query_pairs_mut().append_pair("recursive", "1");
        let tree: TreeResponse = self.call("get_tree", Method::GET, url, None).await?;
        if tree.truncated {
            warn!(%repo, %branch, "GitHub truncated the recursive tree listing");
        }

        let total_files = tree.tree.iter().filter(|f| f.kind == "blob").count();
        Ok(RepoTree {
            branch: branch.to_string(),
            commit_sha,
            files: tree.tree,
            total_files,
        })
    }

    /// API URL for `segments` under the configured base.
    ///
    /// Each segment is split on `/` and the pieces are percent-encoded, so a
    /// branch such as `fix#12` or `feature/a b` names exactly that ref.
    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| RemoteError::transport(format!("invalid API URL {}: {e}", self.api_url)))?;
        url.path_segments_mut()
            .map_err(|()| RemoteError::transport(format!("invalid API URL {}", self.api_url)))?
            .pop_if_empty()
            .extend(segments.iter().flat_map(|s| s.split('/')));
        Ok(url)
    }

    /// Issue one API call and decode the JSON response.
    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
    ) -> Result<T, RemoteError> {
        self.metrics.record_upstream_call(endpoint);
        debug!(endpoint, %method, %url, "calling GitHub API");

        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, ACCEPT);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request.send().await.map_err(transport_error)?;

        if let Some(remaining) = self.rate_limit.update_from_headers(resp.headers()) {
            self.metrics
                .upstream_api_rate_limit_remaining
                .set(i64::try_from(remaining).unwrap_or(i64::MAX));
        }

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = error_message(status, &text);
            warn!(endpoint, %status, %message, "GitHub API returned non-success");
            if self.rate_limit.is_exhausted() {
                warn!(endpoint, reset_at = self.rate_limit.reset_at(), "GitHub rate limit exhausted");
            }
            return Err(RemoteError::status(status.as_u16(), message));
        }

        resp.json::<T>().await.map_err(|e| {
            RemoteError::transport(format!("unexpected {endpoint} response body: {e}"))
        })
    }
}

#[async_trait::async_trait]
impl GitDataApi for GitHubClient {
    async fn get_branch_head(&self, repo: &str, branch: &str) -> Result<String, RemoteError> {
        let url = self.url(&["repos", repo, "git", "ref", "heads", branch])?;
        let resp: RefResponse = self.call("get_ref", Method::GET, url, None).await?;
        Ok(resp.object.sha)
    }

    async fn get_commit_tree(&self, repo: &str, commit_sha: &str) -> Result<String, RemoteError> {
        let url = self.url(&["repos", repo, "git", "commits", commit_sha])?;
        let resp: CommitResponse = self.call("get_commit", Method::GET, url, None).await?;
        Ok(resp.tree.sha)
    }

    async fn create_blob(&self, repo: &str, content: &[u8]) -> Result<String, RemoteError> {
        let url = self.url(&["repos", repo, "git", "blobs"])?;
        let body = json!({
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "encoding": "base64",
        });
        let resp: ShaRef = self
            .call("create_blob", Method::POST, url, Some(&body))
            .await?;
        Ok(resp.sha)
    }

    async fn create_tree(
        &self,
        repo: &str,
        base_tree: Option<&str>,
        entries: &[TreeEntry],
    ) -> Result<String, RemoteError> {
        let url = self.url(&["repos", repo, "git", "trees"])?;
        let mut body = json!({ "tree": entries });
        if let Some(base) = base_tree {
            body["base_tree"] = json!(base);
        }
        let resp: ShaRef = self
            .call("create_tree", Method::POST, url, Some(&body))
            .await?;
        Ok(resp.sha)
    }

    async fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String, RemoteError> {
        let url = self.url(&["repos", repo, "git", "commits"])?;
        let mut body = json!({ "message": message, "tree": tree_sha });
        if !parents.is_empty() {
            body["parents"] = json!(parents);
        }
        let resp: ShaRef = self
            .call("create_commit", Method::POST, url, Some(&body))
            .await?;
        Ok(resp.sha)
    }

    async fn update_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), RemoteError> {
        let url = self.url(&["repos", repo, "git", "refs", "heads", branch])?;
        let body = json!({ "sha": sha });
        let _: serde_json::Value = self
            .call("update_ref", Method::PATCH, url, Some(&body))
            .await?;
        Ok(())
    }

    async fn create_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), RemoteError> {
        let url = self.url(&["repos", repo, "git", "refs"])?;
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": sha });
        let _: serde_json::Value = self
            .call("create_ref", Method::POST, url, Some(&body))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::transport("request timed out")
    } else {
        RemoteError::transport(err.to_string())
    }
}

/// The `message` field of a GitHub error body, or the status reason phrase.
fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message")?.as_str().map(str::to_string))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
