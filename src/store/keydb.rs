//! KeyDB-backed record store.
//!
//! Records are stored as JSON strings:
//!
//! * `forgepush:upload:{id}` / `forgepush:repo:{id}`: the record itself.
//! * `forgepush:user:{user_id}:uploads` / `:repos`: hash of record id to
//!   `created_at`, used to list a user's records without a key scan.

use std::collections::HashMap;

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::{ClientLike, HashesInterface, KeysInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::{RecordStore, RepositoryRecord, UploadRecord, UploadStatus};
use crate::config::KeyDbConfig;

const POOL_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn upload_key(id: &str) -> String {
    format!("forgepush:upload:{id}")
}

fn repo_key(id: &str) -> String {
    format!("forgepush:repo:{id}")
}

fn user_uploads_key(user_id: &str) -> String {
    format!("forgepush:user:{user_id}:uploads")
}

fn user_repos_key(user_id: &str) -> String {
    format!("forgepush:user:{user_id}:repos")
}

/// Ids of an index hash ordered newest first.  RFC 3339 timestamps in UTC
/// sort lexically.
fn newest_first(index: HashMap<String, String>) -> Vec<String> {
    let mut pairs: Vec<(String, String)> = index.into_iter().collect();
    pairs.sort_by(|(a_id, a_ts), (b_id, b_ts)| b_ts.cmp(a_ts).then_with(|| a_id.cmp(b_id)));
    pairs.into_iter().map(|(id, _)| id).collect()
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
            Ok((host, port))
        }
        None => Ok((endpoint, 6379)),
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct KeyDbStore {
    pool: Pool,
}

impl KeyDbStore {
    /// Connect to KeyDB and verify the connection with a PING.
    ///
    /// The auth token, if any, is read from the environment variable named by
    /// `config.auth_token_env`.
    pub async fn connect(config: &KeyDbConfig) -> Result<Self> {
        let (host, port) = parse_host_port(&config.endpoint)?;

        let mut fred_config = fred::types::config::Config {
            server: ServerConfig::new_centralized(host, port),
            ..fred::types::config::Config::default()
        };
        if config.tls {
            fred_config.tls = Some(TlsConnector::default_rustls()?.into());
        }
        fred_config.password = std::env::var(&config.auth_token_env).ok();

        let mut builder = Builder::from_config(fred_config);
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));
        let pool = builder
            .build_pool(POOL_SIZE)
            .context("failed to build KeyDB connection pool")?;
        pool.init().await.context("failed to connect to KeyDB")?;

        let store = Self { pool };
        store.ping().await.context("KeyDB PING failed after connect")?;

        info!(host, port, tls = config.tls, pool_size = POOL_SIZE, "KeyDB store ready");
        Ok(store)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self.pool.get(key).await.with_context(|| format!("GET {key}"))?;
        raw.map(|s| serde_json::from_str(&s).with_context(|| format!("decode {key}")))
            .transpose()
    }

    async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let _: () = self
            .pool
            .set(key, json.as_str(), None, None, false)
            .await
            .with_context(|| format!("SET {key}"))?;
        Ok(())
    }

    /// Load every record listed in a user's index hash, newest first.
    /// Index entries whose record has disappeared are skipped.
    async fn list_indexed<T: DeserializeOwned>(
        &self,
        index_key: &str,
        record_key: fn(&str) -> String,
    ) -> Result<Vec<T>> {
        let index: HashMap<String, String> = self
            .pool
            .hgetall(index_key)
            .await
            .with_context(|| format!("HGETALL {index_key}"))?;

        let mut records = Vec::with_capacity(index.len());
        for id in newest_first(index) {
            match self.get_json(&record_key(&id)).await? {
                Some(record) => records.push(record),
                None => warn!(%index_key, %id, "index points at a missing record"),
            }
        }
        Ok(records)
    }
}

#[async_trait::async_trait]
impl RecordStore for KeyDbStore {
    async fn put_upload(&self, record: &UploadRecord) -> Result<()> {
        self.set_json(&upload_key(&record.id), record).await?;
        let _: () = self
            .pool
            .hset(
                user_uploads_key(&record.user_id),
                vec![(record.id.clone(), record.created_at.to_rfc3339())],
            )
            .await
            .context("HSET upload index")?;
        debug!(id = %record.id, user_id = %record.user_id, "upload record written");
        Ok(())
    }

    async fn get_upload(&self, id: &str, user_id: &str) -> Result<Option<UploadRecord>> {
        let record: Option<UploadRecord> = self.get_json(&upload_key(id)).await?;
        Ok(record.filter(|r| r.user_id == user_id))
    }

    async fn list_uploads(&self, user_id: &str) -> Result<Vec<UploadRecord>> {
        self.list_indexed(&user_uploads_key(user_id), upload_key)
            .await
    }

    async fn update_upload(
        &self,
        id: &str,
        status: UploadStatus,
        repository: Option<&str>,
    ) -> Result<bool> {
        let key = upload_key(id);
        let Some(mut record) = self.get_json::<UploadRecord>(&key).await? else {
            return Ok(false);
        };
        record.status = status;
        if let Some(repo) = repository {
            record.repository = Some(repo.to_string());
        }
        self.set_json(&key, &record).await?;
        debug!(%id, ?status, "upload record updated");
        Ok(true)
    }

    async fn put_repository(&self, record: &RepositoryRecord) -> Result<()> {
        self.set_json(&repo_key(&record.id), record).await?;
        let _: () = self
            .pool
            .hset(
                user_repos_key(&record.user_id),
                vec![(record.id.clone(), record.created_at.to_rfc3339())],
            )
            .await
            .context("HSET repository index")?;
        debug!(id = %record.id, full_name = %record.full_name, "repository record written");
        Ok(())
    }

    async fn list_repositories(&self, user_id: &str) -> Result<Vec<RepositoryRecord>> {
        self.list_indexed(&user_repos_key(user_id), repo_key).await
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.pool.ping(None).await.context("KeyDB PING")?;
        Ok(())
    }
}
