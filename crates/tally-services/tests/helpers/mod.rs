pub mod fixtures;
pub mod workflows;

use std::sync::Arc;

use tally_core::{
    AbuseConfig, AdmissionConfig, FingerprintConfig, LedgerConfig, RequestContext, Role,
};
use tally_db::MemoryStore;
use tally_services::{
    AbuseGuard, AdmissionGate, AuditSigner, AuditTrail, BlobStore, FingerprintStore,
    IntakeService, InventoryLedger, LocalStorage, ProcessingService, QuarantineService,
    ReceivingService, SessionCommitCoordinator, StockService, Stores,
};
use tempfile::TempDir;
use uuid::Uuid;

pub const SIGNING_SECRET: &str = "test-audit-secret";

/// Every service wired against an in-memory store and a temp blob directory
pub struct TestEngine {
    pub store: MemoryStore,
    pub stores: Stores,
    pub storage: Arc<dyn BlobStore>,
    pub audit: AuditTrail,
    pub intake: IntakeService,
    pub processing: ProcessingService,
    pub quarantine: QuarantineService,
    pub receiving: ReceivingService,
    pub ledger: InventoryLedger,
    pub stock: StockService,
    pub _temp_dir: TempDir,
}

pub async fn setup_test_engine() -> TestEngine {
    setup_test_engine_with(AbuseConfig::default()).await
}

pub async fn setup_test_engine_with(abuse_config: AbuseConfig) -> TestEngine {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let storage: Arc<dyn BlobStore> = Arc::new(
        LocalStorage::new(temp_dir.path())
            .await
            .expect("Failed to create local storage"),
    );

    let store = MemoryStore::new();
    let stores = Stores::memory(store.clone());
    let admission = AdmissionConfig::default();

    let signer = AuditSigner::new(SIGNING_SECRET).expect("signer");
    let audit = AuditTrail::new(stores.audit.clone(), signer);
    let fingerprints = FingerprintStore::new(stores.fingerprints.clone(), &FingerprintConfig::default());
    let bulk_floor = abuse_config.bulk_confirm_floor_secs;
    let abuse = AbuseGuard::new(stores.counters.clone(), abuse_config);
    let ledger = InventoryLedger::new(stores.inventory.clone(), audit.clone());
    let coordinator = SessionCommitCoordinator::new(
        stores.sessions.clone(),
        ledger.clone(),
        audit.clone(),
        &LedgerConfig::default(),
        bulk_floor,
    );

    let intake = IntakeService::new(
        stores.uploads.clone(),
        stores.quarantine.clone(),
        storage.clone(),
        AdmissionGate::new(&admission),
        fingerprints.clone(),
        abuse.clone(),
        audit.clone(),
    );
    let processing = ProcessingService::new(
        stores.uploads.clone(),
        stores.quarantine.clone(),
        storage.clone(),
        fingerprints.clone(),
        audit.clone(),
        admission.min_ocr_chars,
    );
    let quarantine = QuarantineService::new(
        stores.quarantine.clone(),
        stores.uploads.clone(),
        fingerprints,
        audit.clone(),
    );
    let receiving = ReceivingService::new(
        stores.sessions.clone(),
        stores.uploads.clone(),
        stores.inventory.clone(),
        abuse,
        audit.clone(),
        coordinator,
    );
    let stock = StockService::new(stores.inventory.clone(), audit.clone());

    TestEngine {
        store,
        stores,
        storage,
        audit,
        intake,
        processing,
        quarantine,
        receiving,
        ledger,
        stock,
        _temp_dir: temp_dir,
    }
}

pub fn crew(tenant_id: Uuid) -> RequestContext {
    RequestContext::new(tenant_id, Uuid::new_v4(), vec![Role::Crew])
}

pub fn hod(tenant_id: Uuid) -> RequestContext {
    RequestContext::new(tenant_id, Uuid::new_v4(), vec![Role::Hod])
}
