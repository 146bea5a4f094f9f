use std::sync::Arc;

use sqlx::PgPool;
use tally_db::{
    AuditRepository, CounterRepository, FingerprintRepository, InventoryRepository, MemoryStore,
    PgAuditRepository, PgCounterRepository, PgFingerprintRepository, PgInventoryRepository,
    PgQuarantineRepository, PgSessionRepository, PgUploadRepository, QuarantineRepository,
    SessionRepository, UploadRepository,
};

/// Repository handles shared by every service
#[derive(Clone)]
pub struct Stores {
    pub uploads: Arc<dyn UploadRepository>,
    pub fingerprints: Arc<dyn FingerprintRepository>,
    pub quarantine: Arc<dyn QuarantineRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub inventory: Arc<dyn InventoryRepository>,
    pub audit: Arc<dyn AuditRepository>,
    pub counters: Arc<dyn CounterRepository>,
}

impl Stores {
    pub fn postgres(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            uploads: Arc::new(PgUploadRepository::new(pool.clone())),
            fingerprints: Arc::new(PgFingerprintRepository::new(pool.clone())),
            quarantine: Arc::new(PgQuarantineRepository::new(pool.clone())),
            sessions: Arc::new(PgSessionRepository::new(pool.clone(), lock_timeout_ms)),
            inventory: Arc::new(PgInventoryRepository::new(pool.clone())),
            audit: Arc::new(PgAuditRepository::new(pool.clone())),
            counters: Arc::new(PgCounterRepository::new(pool)),
        }
    }

    pub fn memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            uploads: store.clone(),
            fingerprints: store.clone(),
            quarantine: store.clone(),
            sessions: store.clone(),
            inventory: store.clone(),
            audit: store.clone(),
            counters: store,
        }
    }
}
