use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::RwLock;

use super::{RecordStore, RepositoryRecord, UploadRecord, UploadStatus};

/// Process-local record store.  Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    uploads: RwLock<HashMap<String, UploadRecord>>,
    repositories: RwLock<HashMap<String, RepositoryRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn put_upload(&self, record: &UploadRecord) -> Result<()> {
        self.uploads
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_upload(&self, id: &str, user_id: &str) -> Result<Option<UploadRecord>> {
        Ok(self
            .uploads
            .read()
            .await
            .get(id)
            .filter(|r| r.user_id == user_id)
            .cloned())
    }

    async fn list_uploads(&self, user_id: &str) -> Result<Vec<UploadRecord>> {
        let mut records: Vec<_> = self
            .uploads
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn update_upload(
        &self,
        id: &str,
        status: UploadStatus,
        repository: Option<&str>,
    ) -> Result<bool> {
        let mut uploads = self.uploads.write().await;
        let Some(record) = uploads.get_mut(id) else {
            return Ok(false);
        };
        record.status = status;
        if let Some(repo) = repository {
            record.repository = Some(repo.to_string());
        }
        Ok(true)
    }

    async fn put_repository(&self, record: &RepositoryRecord) -> Result<()> {
        self.repositories
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list_repositories(&self, user_id: &str) -> Result<Vec<RepositoryRecord>> {
        let mut records: Vec<_> = self
            .repositories
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
