//! Artifact upload with compensating-delete registration.
//!
//! Every successful put registers its own delete in the shared ledger before
//! returning, so a failing sibling upload never hides a cleanup.

pub mod rollback;

use crate::core::error::ProvisionError;
use crate::provider::{LifecyclePolicy, ObjectStorage};
use rollback::{RollbackAction, RollbackLedger};
use std::path::Path;
use std::sync::Arc;

/// Keys of the uploaded artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedArtifacts {
    pub archive_key: String,
    pub site_key: Option<String>,
}

/// Uploads artifacts for one service into one bucket.
#[derive(Clone)]
pub struct UploadManager {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    service_name: String,
    dry_run: bool,
    ledger: RollbackLedger,
}

impl UploadManager {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        bucket: &str,
        service_name: &str,
        dry_run: bool,
        ledger: RollbackLedger,
    ) -> Self {
        Self {
            storage,
            bucket: bucket.to_string(),
            service_name: service_name.to_string(),
            dry_run,
            ledger,
        }
    }

    pub fn ledger(&self) -> &RollbackLedger {
        &self.ledger
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Remote key for a local artifact: `<service>/<basename>`.
    pub fn key_for(&self, local: &Path) -> String {
        let base = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/{}", self.service_name, base)
    }

    /// Warn when the bucket has no expiration rules. Never fails.
    pub async fn ensure_lifecycle_policy(&self) {
        if self.dry_run {
            tracing::debug!(bucket = %self.bucket, "dry run: lifecycle check skipped");
            return;
        }
        match self.storage.lifecycle_policy(&self.bucket).await {
            Ok(LifecyclePolicy::Enabled(rules)) => {
                tracing::debug!(bucket = %self.bucket, rules = rules.len(), "lifecycle policy present");
            }
            Ok(LifecyclePolicy::NotConfigured) => {
                tracing::warn!(
                    bucket = %self.bucket,
                    "bucket has no lifecycle expiration policy; old artifacts will accumulate"
                );
            }
            Err(e) => {
                tracing::warn!(bucket = %self.bucket, error = %e, "cannot read lifecycle policy");
            }
        }
    }

    /// Upload a local file. The local file is removed afterwards whatever
    /// the outcome. Dry runs return the key without any I/O.
    pub async fn upload(&self, local: &Path) -> Result<String, ProvisionError> {
        let key = self.key_for(local);
        let result = self.upload_file(local, &key).await;
        if local.exists() {
            if let Err(e) = std::fs::remove_file(local) {
                tracing::warn!(file = %local.display(), error = %e, "failed to delete local artifact");
            }
        }
        result.map(|()| key)
    }

    async fn upload_file(&self, local: &Path, key: &str) -> Result<(), ProvisionError> {
        if self.dry_run {
            tracing::info!(bucket = %self.bucket, key, "dry run: upload skipped");
            return Ok(());
        }
        let body = std::fs::read(local)
            .map_err(|e| ProvisionError::Upload(format!("cannot read {}: {}", local.display(), e)))?;
        self.put(key, body).await
    }

    /// Upload in-memory bytes under `key`.
    pub async fn upload_bytes(&self, key: &str, body: Vec<u8>) -> Result<(), ProvisionError> {
        if self.dry_run {
            tracing::info!(bucket = %self.bucket, key, "dry run: upload skipped");
            return Ok(());
        }
        self.put(key, body).await
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ProvisionError> {
        let bytes = body.len();
        self.storage
            .put(&self.bucket, key, body)
            .await
            .map_err(|e| ProvisionError::Upload(format!("{}: {}", key, e)))?;
        tracing::info!(bucket = %self.bucket, key, bytes, "uploaded");
        self.ledger.register(RollbackAction::delete_object(
            Arc::clone(&self.storage),
            &self.bucket,
            key,
        ));
        Ok(())
    }

    /// Upload the archive and the optional site bundle concurrently. Every
    /// failure is reported; each success keeps its rollback registration.
    pub async fn upload_artifacts(
        &self,
        archive: &Path,
        site: Option<&Path>,
    ) -> Result<UploadedArtifacts, ProvisionError> {
        self.ensure_lifecycle_policy().await;

        let site_upload = async {
            match site {
                Some(path) => self.upload(path).await.map(Some),
                None => Ok(None),
            }
        };
        let (archive_result, site_result) = tokio::join!(self.upload(archive), site_upload);

        match (archive_result, site_result) {
            (Ok(archive_key), Ok(site_key)) => Ok(UploadedArtifacts {
                archive_key,
                site_key,
            }),
            (archive_result, site_result) => {
                let errors: Vec<ProvisionError> = [archive_result.err(), site_result.err()]
                    .into_iter()
                    .flatten()
                    .collect();
                Err(ProvisionError::Aggregate(errors))
            }
        }
    }
}
