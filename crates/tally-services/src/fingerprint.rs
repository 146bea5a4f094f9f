use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tally_core::models::{FingerprintMatch, FingerprintRecord};
use tally_core::{AppError, FingerprintConfig};
use tally_db::FingerprintRepository;
use uuid::Uuid;

/// Per-tenant duplicate detection over content hashes
#[derive(Clone)]
pub struct FingerprintStore {
    repo: Arc<dyn FingerprintRepository>,
    lookback: Duration,
}

impl FingerprintStore {
    pub fn new(repo: Arc<dyn FingerprintRepository>, config: &FingerprintConfig) -> Self {
        Self {
            repo,
            lookback: Duration::hours(config.lookback_hours),
        }
    }

    /// Read-only lookup. Fingerprints older than the lookback window do not match.
    pub async fn check(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<FingerprintMatch, AppError> {
        let Some(record) = self.repo.find_fingerprint(tenant_id, content_hash).await? else {
            return Ok(FingerprintMatch::none());
        };
        if record.registered_at <= now - self.lookback {
            return Ok(FingerprintMatch::none());
        }
        Ok(FingerprintMatch::from_prior(&record, now))
    }

    /// Record `upload_id` as the latest admitted upload for this digest.
    pub async fn register(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        upload_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FingerprintRecord, AppError> {
        self.repo
            .upsert_fingerprint(tenant_id, content_hash, upload_id, now)
            .await
    }

    /// Drop the fingerprint if it still points at `upload_id`.
    pub async fn release(&self, tenant_id: Uuid, content_hash: &str, upload_id: Uuid) -> Result<bool, AppError> {
        self.repo
            .remove_fingerprint(tenant_id, content_hash, upload_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_db::MemoryStore;

    #[tokio::test]
    async fn test_duplicate_inside_and_outside_lookback() {
        let store = FingerprintStore::new(Arc::new(MemoryStore::new()), &FingerprintConfig::default());
        let tenant_id = Uuid::new_v4();
        let first = Uuid::new_v4();
        let t0 = Utc::now();

        assert!(!store.check(tenant_id, "abc", t0).await.unwrap().is_duplicate);
        store.register(tenant_id, "abc", first, t0).await.unwrap();

        let soon = store.check(tenant_id, "abc", t0 + Duration::hours(2)).await.unwrap();
        assert!(soon.is_duplicate);
        assert_eq!(soon.prior_upload_id, Some(first));
        assert!((soon.age_hours.unwrap() - 2.0).abs() < 1e-6);

        let later = store.check(tenant_id, "abc", t0 + Duration::hours(25)).await.unwrap();
        assert!(!later.is_duplicate);
    }

    #[tokio::test]
    async fn test_tenants_do_not_share_fingerprints() {
        let store = FingerprintStore::new(Arc::new(MemoryStore::new()), &FingerprintConfig::default());
        let now = Utc::now();
        store.register(Uuid::new_v4(), "abc", Uuid::new_v4(), now).await.unwrap();
        assert!(!store.check(Uuid::new_v4(), "abc", now).await.unwrap().is_duplicate);
    }

    #[tokio::test]
    async fn test_release_only_matching_upload() {
        let store = FingerprintStore::new(Arc::new(MemoryStore::new()), &FingerprintConfig::default());
        let tenant_id = Uuid::new_v4();
        let now = Utc::now();
        let newer = Uuid::new_v4();
        store.register(tenant_id, "abc", newer, now).await.unwrap();

        assert!(!store.release(tenant_id, "abc", Uuid::new_v4()).await.unwrap());
        assert!(store.release(tenant_id, "abc", newer).await.unwrap());
        assert!(!store.check(tenant_id, "abc", now).await.unwrap().is_duplicate);
    }
}
