//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `POST /uploads?filename=<name>`  - Extract an archive (raw body) and store it
//! - `GET  /uploads`                  - The caller's uploads, newest first
//! - `GET  /uploads/{id}`             - One upload with its entries
//! - `POST /push`                     - Commit an upload to a GitHub branch
//! - `GET  /repos`                    - GitHub repositories + repositories created here
//! - `POST /repos`                    - Create a GitHub repository
//! - `GET  /repos/pull`               - Flattened tree of a branch
//! - `GET  /healthz`                  - Health check
//! - `GET  /metrics`                  - Prometheus metrics

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::archive::{self, ArchiveEntry, ArchiveError, ArchiveFormat, ExtractOptions, ParseWarning};
use crate::forge::github::GitHubRepository;
use crate::forge::RemoteError;
use crate::metrics::{FormatLabels, PublishOutcome};
use crate::publish::{PublishError, PublishOptions, Publisher};
use crate::store::{RepositoryRecord, UploadRecord, UploadStatus};
use crate::AppState;

const USER_ID_HEADER: &str = "x-user-id";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_body_bytes;
    Router::new()
        .route("/uploads", post(handle_upload).get(handle_list_uploads))
        .route("/uploads/{id}", get(handle_get_upload))
        .route("/push", post(handle_push))
        .route("/repos", get(handle_list_repos).post(handle_create_repo))
        .route("/repos/pull", get(handle_pull))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    upload_id: String,
    files: Vec<ArchiveEntry>,
    total_files: usize,
    total_directories: usize,
    warnings: Vec<ParseWarning>,
}

/// Listing view of an upload, without entry contents.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadSummary {
    id: String,
    original_filename: String,
    file_type: String,
    file_size: u64,
    total_files: usize,
    status: UploadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    repository: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<UploadRecord> for UploadSummary {
    fn from(record: UploadRecord) -> Self {
        Self {
            total_files: record.entries.iter().filter(|e| !e.is_directory).count(),
            id: record.id,
            original_filename: record.original_filename,
            file_type: record.file_type,
            file_size: record.file_size,
            status: record.status,
            repository: record.repository,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest {
    repo_full_name: Option<String>,
    upload_id: Option<String>,
    commit_message: Option<String>,
    branch: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRepoRequest {
    name: Option<String>,
    description: Option<String>,
    is_private: Option<bool>,
    upload_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRepoResponse {
    repository: RepositoryRecord,
    github_repo: GitHubRepository,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepositoriesResponse {
    repositories: Vec<GitHubRepository>,
    managed_repos: Vec<RepositoryRecord>,
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    repo: Option<String>,
    branch: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /uploads?filename=<name>`
///
/// The request body is the archive itself.  The format is chosen from the
/// file name before any byte is parsed.
#[instrument(skip(state, headers, body), fields(bytes = body.len()))]
async fn handle_upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let caller = extract_caller(&headers)?;
    let filename = non_empty(query.filename)
        .ok_or_else(|| AppError::BadRequest("missing filename query parameter".into()))?;
    if body.is_empty() {
        return Err(AppError::BadRequest("no file uploaded".into()));
    }

    let format = ArchiveFormat::from_filename(&filename)?;
    let file_size = body.len() as u64;
    let options = ExtractOptions {
        inline_threshold: state.config.archive.inline_threshold,
    };
    let extraction = tokio::task::spawn_blocking(move || archive::extract(&body, format, &options))
        .await
        .context("archive extraction task failed")??;

    let metrics = &state.metrics.metrics;
    metrics
        .uploads_total
        .get_or_create(&FormatLabels {
            format: format.into(),
        })
        .inc();
    metrics
        .archive_entries_total
        .inc_by(extraction.entries.len() as u64);
    metrics
        .archive_parse_warnings_total
        .inc_by(extraction.warnings.len() as u64);

    let total_files = extraction.file_count();
    let total_directories = extraction.directory_count();
    let record = UploadRecord {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: caller.user_id,
        original_filename: filename,
        file_type: format.file_type().to_string(),
        file_size,
        entries: extraction.entries,
        status: UploadStatus::Extracted,
        repository: None,
        created_at: Utc::now(),
    };
    state.store.put_upload(&record).await?;

    info!(
        upload_id = %record.id,
        total_files,
        total_directories,
        warnings = extraction.warnings.len(),
        "archive extracted"
    );

    Ok(Json(UploadResponse {
        upload_id: record.id,
        files: record.entries,
        total_files,
        total_directories,
        warnings: extraction.warnings,
    })
    .into_response())
}

/// `GET /uploads`
#[instrument(skip(state, headers))]
async fn handle_list_uploads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let caller = extract_caller(&headers)?;
    let uploads: Vec<UploadSummary> = state
        .store
        .list_uploads(&caller.user_id)
        .await?
        .into_iter()
        .map(UploadSummary::from)
        .collect();
    Ok(Json(uploads).into_response())
}

/// `GET /uploads/{id}`
#[instrument(skip(state, headers), fields(%id))]
async fn handle_get_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let caller = extract_caller(&headers)?;
    let record = state
        .store
        .get_upload(&id, &caller.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("upload {id} not found")))?;
    Ok(Json(record).into_response())
}

/// `POST /push`
///
/// Commits the stored entries of an upload to `branch` (default from
/// config) of `repoFullName` as a single commit.
#[instrument(skip(state, headers, payload))]
async fn handle_push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<PushRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let caller = extract_caller(&headers)?;
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let (Some(repo), Some(upload_id)) = (
        non_empty(request.repo_full_name),
        non_empty(request.upload_id),
    ) else {
        return Err(AppError::BadRequest(
            "repoFullName and uploadId are required".into(),
        ));
    };
    validate_full_name(&repo)?;
    let branch = non_empty(request.branch)
        .unwrap_or_else(|| state.config.publish.default_branch.clone());

    let upload = state
        .store
        .get_upload(&upload_id, &caller.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("upload {upload_id} not found")))?;

    let client = state.github(&caller.token);
    let publisher = Publisher::new(&client, PublishOptions::from(&state.config.publish));

    let metrics = &state.metrics.metrics;
    let started = Instant::now();
    let outcome = publisher
        .publish(&repo, &branch, &upload.entries, request.commit_message.as_deref())
        .await;
    metrics
        .publish_duration_seconds
        .observe(started.elapsed().as_secs_f64());

    match outcome {
        Ok(result) => {
            metrics.record_publish(PublishOutcome::Success);
            metrics.publish_files_total.inc_by(result.file_count as u64);
            state
                .store
                .update_upload(&upload_id, UploadStatus::Pushed, Some(&repo))
                .await?;
            Ok(Json(result).into_response())
        }
        Err(PublishError::NoFiles) => {
            metrics.record_publish(PublishOutcome::NoFiles);
            Err(AppError::BadRequest("no files to push".into()))
        }
        Err(PublishError::Remote(err)) => {
            metrics.record_publish(PublishOutcome::RemoteError);
            if let Err(e) = state
                .store
                .update_upload(&upload_id, UploadStatus::Failed, None)
                .await
            {
                warn!(error = %e, %upload_id, "failed to mark upload as failed");
            }
            Err(AppError::Upstream(err))
        }
    }
}

/// `GET /repos`
#[instrument(skip(state, headers))]
async fn handle_list_repos(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let caller = extract_caller(&headers)?;
    let repositories = state
        .github(&caller.token)
        .list_repositories()
        .await?;
    let managed_repos = state.store.list_repositories(&caller.user_id).await?;

    Ok(Json(RepositoriesResponse {
        repositories,
        managed_repos,
    })
    .into_response())
}

/// `POST /repos`
///
/// Creates an empty repository for the caller.  When `uploadId` names one
/// of the caller's uploads, the upload is linked to the new repository.
#[instrument(skip(state, headers, payload))]
async fn handle_create_repo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateRepoRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let caller = extract_caller(&headers)?;
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let name = non_empty(request.name)
        .ok_or_else(|| AppError::BadRequest("repository name is required".into()))?;

    let github_repo = state
        .github(&caller.token)
        .create_repository(
            &name,
            request.description.as_deref(),
            request.is_private.unwrap_or(false),
        )
        .await?;

    let record = RepositoryRecord {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: caller.user_id.clone(),
        github_repo_id: github_repo.id,
        name: github_repo.name.clone(),
        full_name: github_repo.full_name.clone(),
        html_url: github_repo.html_url.clone(),
        description: github_repo.description.clone(),
        is_private: github_repo.private,
        default_branch: github_repo
            .default_branch
            .clone()
            .unwrap_or_else(|| state.config.publish.default_branch.clone()),
        created_at: Utc::now(),
    };
    state.store.put_repository(&record).await?;
    info!(full_name = %record.full_name, private = record.is_private, "repository created");

    if let Some(upload_id) = non_empty(request.upload_id) {
        match state.store.get_upload(&upload_id, &caller.user_id).await? {
            Some(upload) => {
                state
                    .store
                    .update_upload(&upload_id, upload.status, Some(&record.full_name))
                    .await?;
            }
            None => warn!(%upload_id, "upload to link not found"),
        }
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateRepoResponse {
            repository: record,
            github_repo,
        }),
    )
        .into_response())
}

/// `GET /repos/pull?repo=<owner/name>&branch=<branch>`
#[instrument(skip(state, headers))]
async fn handle_pull(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PullQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let caller = extract_caller(&headers)?;
    let repo = non_empty(query.repo)
        .ok_or_else(|| AppError::BadRequest("repo query parameter is required".into()))?;
    validate_full_name(&repo)?;
    let branch =
        non_empty(query.branch).unwrap_or_else(|| state.config.publish.default_branch.clone());

    let tree = state
        .github(&caller.token)
        .list_tree(&repo, &branch)
        .await?;
    Ok(Json(tree).into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = crate::health::run_checks(
        state.store.as_ref(),
        &state.http_client,
        &state.config.upstream.api_url,
    )
    .await;
    (status, Json(body))
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Who is calling: the GitHub token to act with and the user the records
/// belong to.
#[derive(Debug)]
struct Caller {
    token: String,
    user_id: String,
}

/// Read the bearer token and user id headers, failing with 401 if either is
/// missing.
fn extract_caller(headers: &HeaderMap) -> Result<Caller, AppError> {
    let auth = header_str(headers, header::AUTHORIZATION.as_str())
        .ok_or_else(|| AppError::Unauthorized("missing Authorization header".into()))?;
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .or_else(|| auth.strip_prefix("token "))
        .unwrap_or(auth)
        .trim();
    if token.is_empty() {
        return Err(AppError::Unauthorized("empty access token".into()));
    }

    let user_id = header_str(headers, USER_ID_HEADER)
        .ok_or_else(|| AppError::Unauthorized("missing X-User-Id header".into()))?;

    Ok(Caller {
        token: token.to_string(),
        user_id: user_id.to_string(),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `owner/name`, both parts non-empty, nothing else.
fn validate_full_name(full_name: &str) -> Result<(), AppError> {
    match full_name.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(())
        }
        _ => Err(AppError::BadRequest(format!(
            "repository must be given as owner/name, got {full_name:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The caller did not identify themselves.
    Unauthorized(String),
    BadRequest(String),
    NotFound(String),
    /// GitHub refused a call or could not be reached.
    Upstream(RemoteError),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(msg) => {
                let mut resp = error_body(StatusCode::UNAUTHORIZED, msg);
                resp.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    header::HeaderValue::from_static("Bearer realm=\"forgepush\""),
                );
                resp
            }
            AppError::BadRequest(msg) => error_body(StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => error_body(StatusCode::NOT_FOUND, msg),
            // Rate limits are per token, so no Retry-After is derived from
            // the process-wide rate-limit state.
            AppError::Upstream(error) => {
                warn!(error = %error, "upstream call failed");
                let body = json!({
                    "error": error.to_string(),
                    "upstreamStatus": error.status,
                });
                (StatusCode::BAD_GATEWAY, Json(body)).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<RemoteError> for AppError {
    fn from(err: RemoteError) -> Self {
        AppError::Upstream(err)
    }
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
