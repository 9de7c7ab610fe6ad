use axum::http::StatusCode;
use serde::Serialize;

use crate::store::RecordStore;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub github: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_store(store: &dyn RecordStore) -> CheckResult {
    match store.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("ping failed: {e:#}")),
    }
}

async fn check_github(client: &reqwest::Client, api_url: &str) -> CheckResult {
    let url = format!("{}/meta", api_url.trim_end_matches('/'));
    match client.head(&url).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
            CheckResult::healthy()
        }
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {url} returned {}", resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {url} failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// Uploads cannot be recorded without the store; GitHub being down only
/// affects pushes.
fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if checks.store.ok && checks.github.ok {
        HealthStatus::Ok
    } else if !checks.store.ok {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

/// Run every check concurrently.  Returns 200 on Ok/Degraded, 503 on
/// Unhealthy.
pub async fn run_checks(
    store: &dyn RecordStore,
    client: &reqwest::Client,
    api_url: &str,
) -> (StatusCode, HealthResponse) {
    let (store, github) = tokio::join!(check_store(store), check_github(client, api_url));

    let checks = HealthChecks { store, github };
    let status = aggregate_status(&checks);
    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, HealthResponse { status, checks })
}
