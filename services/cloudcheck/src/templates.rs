//! Rendered job templates: rendering cache, persistence, cleanup.
//!
//! Persist-then-clean: stale archives are only removed after the new one is
//! safely in the blobstore and recorded, so an instance always has at least
//! one valid template set.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use keel_reconcile::SpecHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::{InstanceRecord, InstanceStore, RenderedTemplatesArchive};
use crate::plan::{InstancePlan, LinkProviderIntent};

/// Template errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("templates for '{0}' were never rendered")]
    NotRendered(String),

    #[error("rendering failed")]
    Render(#[source] anyhow::Error),

    #[error("blobstore request failed")]
    Blobstore(#[source] anyhow::Error),

    #[error("encoding rendered templates")]
    Encode(#[from] serde_json::Error),

    #[error("instance store update failed")]
    Store(#[source] anyhow::Error),
}

/// Blob storage.
#[async_trait]
pub trait Blobstore: Send + Sync {
    /// Store `contents` and return the new blob id.
    async fn create(&self, contents: Bytes) -> anyhow::Result<String>;

    async fn get(&self, blob_id: &str) -> anyhow::Result<Bytes>;

    async fn delete(&self, blob_id: &str) -> anyhow::Result<()>;
}

/// Rendered files per job: job name → relative path → contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplates {
    pub jobs: BTreeMap<String, BTreeMap<String, String>>,
}

impl RenderedTemplates {
    /// Digest over the canonical JSON form.
    pub fn digest(&self) -> Result<SpecHash, serde_json::Error> {
        Ok(SpecHash::from_json(&serde_json::to_value(self)?))
    }
}

/// Renders job templates for a plan.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        plan: &InstancePlan,
        cache: &TemplateBlobCache,
        links: &[LinkProviderIntent],
    ) -> anyhow::Result<RenderedTemplates>;
}

/// Job template blobs downloaded during one operation.
///
/// Create one per recreate; dropping it discards everything it fetched.
pub struct TemplateBlobCache {
    blobstore: Arc<dyn Blobstore>,
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl TemplateBlobCache {
    pub fn new(blobstore: Arc<dyn Blobstore>) -> Self {
        Self {
            blobstore,
            blobs: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a template blob, hitting the blobstore at most once per id.
    pub async fn download_blob(&self, blob_id: &str) -> anyhow::Result<Bytes> {
        let mut blobs = self.blobs.lock().await;
        if let Some(blob) = blobs.get(blob_id) {
            return Ok(blob.clone());
        }

        let blob = self.blobstore.get(blob_id).await?;
        blobs.insert(blob_id.to_string(), blob.clone());
        Ok(blob)
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Uploads a plan's rendered templates and records the archive.
pub struct RenderedTemplatesPersister {
    blobstore: Arc<dyn Blobstore>,
    store: Arc<dyn InstanceStore>,
}

impl RenderedTemplatesPersister {
    pub fn new(blobstore: Arc<dyn Blobstore>, store: Arc<dyn InstanceStore>) -> Self {
        Self { blobstore, store }
    }

    /// Upload unless the latest archive already has the same digest.
    pub async fn persist(
        &self,
        instance: &mut InstanceRecord,
        plan: &InstancePlan,
    ) -> Result<RenderedTemplatesArchive, TemplateError> {
        let rendered = plan
            .rendered_templates
            .as_ref()
            .ok_or_else(|| TemplateError::NotRendered(plan.instance_name()))?;
        let digest = rendered.digest()?.to_string();

        if let Some(latest) = instance.latest_rendered_templates_archive() {
            if latest.digest == digest {
                debug!(instance = %instance.name(), digest = %digest, "Rendered templates unchanged");
                return Ok(latest.clone());
            }
        }

        let contents = Bytes::from(serde_json::to_vec(rendered)?);
        let blob_id = self
            .blobstore
            .create(contents)
            .await
            .map_err(TemplateError::Blobstore)?;

        let archive = RenderedTemplatesArchive {
            blob_id,
            digest,
            created_at: Utc::now(),
        };
        instance.rendered_templates_archives.push(archive.clone());
        self.store
            .update_instance(instance)
            .await
            .map_err(TemplateError::Store)?;

        info!(
            instance = %instance.name(),
            blob_id = %archive.blob_id,
            digest = %archive.digest,
            "Persisted rendered templates"
        );
        Ok(archive)
    }
}

/// Removes every archive but the latest.
pub struct RenderedJobTemplatesCleaner {
    blobstore: Arc<dyn Blobstore>,
    store: Arc<dyn InstanceStore>,
}

impl RenderedJobTemplatesCleaner {
    pub fn new(blobstore: Arc<dyn Blobstore>, store: Arc<dyn InstanceStore>) -> Self {
        Self { blobstore, store }
    }

    /// Returns the number of archives removed.
    pub async fn clean(&self, instance: &mut InstanceRecord) -> Result<usize, TemplateError> {
        let Some(latest) = instance.latest_rendered_templates_archive().cloned() else {
            return Ok(0);
        };

        let stale: Vec<RenderedTemplatesArchive> = instance
            .rendered_templates_archives
            .iter()
            .filter(|archive| archive.blob_id != latest.blob_id)
            .cloned()
            .collect();

        for archive in &stale {
            self.blobstore
                .delete(&archive.blob_id)
                .await
                .map_err(TemplateError::Blobstore)?;
            instance
                .rendered_templates_archives
                .retain(|a| a.blob_id != archive.blob_id);
            debug!(instance = %instance.name(), blob_id = %archive.blob_id, "Deleted stale templates");
        }

        if !stale.is_empty() {
            self.store
                .update_instance(instance)
                .await
                .map_err(TemplateError::Store)?;
        }

        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{self, MemoryBlobstore, MemoryInstanceStore};
    use crate::plan::InstancePlanBuilder;

    async fn rendered_plan(record: &InstanceRecord, marker: &str) -> InstancePlan {
        let builder = InstancePlanBuilder::new(Arc::new(fakes::PassthroughInterpolator));
        let mut plan = builder.resurrection_plan(record).await.unwrap();
        let mut files = BTreeMap::new();
        files.insert("config/app.yml".to_string(), marker.to_string());
        plan.rendered_templates = Some(RenderedTemplates {
            jobs: BTreeMap::from([("app".to_string(), files)]),
        });
        plan
    }

    #[tokio::test]
    async fn test_persist_uploads_and_records() {
        let blobstore = Arc::new(MemoryBlobstore::new());
        let store = Arc::new(MemoryInstanceStore::new());
        let persister = RenderedTemplatesPersister::new(blobstore.clone(), store.clone());

        let mut record = fakes::instance_record();
        let plan = rendered_plan(&record, "v1").await;
        let archive = persister.persist(&mut record, &plan).await.unwrap();

        assert!(blobstore.contains(&archive.blob_id));
        assert_eq!(record.rendered_templates_archives, vec![archive]);
        assert_eq!(store.instance_updates(), 1);
    }

    #[tokio::test]
    async fn test_persist_skips_identical_templates() {
        let blobstore = Arc::new(MemoryBlobstore::new());
        let persister =
            RenderedTemplatesPersister::new(blobstore.clone(), Arc::new(MemoryInstanceStore::new()));

        let mut record = fakes::instance_record();
        let plan = rendered_plan(&record, "v1").await;
        let first = persister.persist(&mut record, &plan).await.unwrap();
        let second = persister.persist(&mut record, &plan).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(blobstore.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_requires_rendering() {
        let persister = RenderedTemplatesPersister::new(
            Arc::new(MemoryBlobstore::new()),
            Arc::new(MemoryInstanceStore::new()),
        );
        let mut record = fakes::instance_record();
        let mut plan = rendered_plan(&record, "v1").await;
        plan.rendered_templates = None;

        assert!(matches!(
            persister.persist(&mut record, &plan).await,
            Err(TemplateError::NotRendered(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_keeps_latest_only() {
        let blobstore = Arc::new(MemoryBlobstore::new());
        let store = Arc::new(MemoryInstanceStore::new());
        let persister = RenderedTemplatesPersister::new(blobstore.clone(), store.clone());
        let cleaner = RenderedJobTemplatesCleaner::new(blobstore.clone(), store.clone());

        let mut record = fakes::instance_record();
        let plan_v1 = rendered_plan(&record, "v1").await;
        let old = persister
            .persist(&mut record, &plan_v1)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let plan_v2 = rendered_plan(&record, "v2").await;
        let new = persister
            .persist(&mut record, &plan_v2)
            .await
            .unwrap();

        assert_eq!(cleaner.clean(&mut record).await.unwrap(), 1);
        assert_eq!(record.rendered_templates_archives, vec![new.clone()]);
        assert!(!blobstore.contains(&old.blob_id));
        assert!(blobstore.contains(&new.blob_id));

        assert_eq!(cleaner.clean(&mut record).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blob_cache_fetches_once() {
        let blobstore = Arc::new(MemoryBlobstore::new());
        let id = blobstore.create(Bytes::from_static(b"job tgz")).await.unwrap();
        let cache = TemplateBlobCache::new(blobstore.clone());

        assert_eq!(cache.download_blob(&id).await.unwrap(), Bytes::from_static(b"job tgz"));
        assert_eq!(cache.download_blob(&id).await.unwrap(), Bytes::from_static(b"job tgz"));
        assert_eq!(blobstore.gets(), 1);
        assert_eq!(cache.len().await, 1);
    }
}
