//! Services layer for credential-service.
//!
//! Storage-backed components of the credential pool and the budget-driven
//! rotation engine.

pub mod audit_log;
pub mod cipher;
pub mod credential_pool;
mod database;
pub mod error;
pub mod metrics;
pub mod rotation_engine;
pub mod rotation_schedule;
pub mod spending_ledger;
pub mod tier_selector;

pub use audit_log::AuditLog;
pub use cipher::{SecretCipher, XChaChaCipher};
pub use credential_pool::{Activation, CredentialPool};
pub use database::Database;
pub use error::ServiceError;
pub use rotation_engine::{
    evaluate, RotationDecision, RotationEngine, RotationResult, RotationSettings, TierFailure,
};
pub use rotation_schedule::ScheduleStore;
pub use spending_ledger::{LedgerObserver, SpendingLedger};
pub use tier_selector::{select_tier_for, tier_for_month, TierSelector, TierThresholds};

use std::sync::Arc;

/// Every component wired against one database and cipher.
#[derive(Clone)]
pub struct CredentialServices {
    pub pool: CredentialPool,
    pub schedules: ScheduleStore,
    pub audit: AuditLog,
    /// Ledger that notifies the rotation engine after each cost event.
    pub ledger: SpendingLedger,
    pub engine: Arc<RotationEngine>,
    pub tier_selector: TierSelector,
}

impl CredentialServices {
    pub fn new(
        db: Database,
        cipher: Arc<dyn SecretCipher>,
        rotation: RotationSettings,
        thresholds: TierThresholds,
    ) -> Self {
        let engine = Arc::new(RotationEngine::new(db.clone(), rotation));
        let ledger = SpendingLedger::new(db.clone()).with_observer(engine.clone());
        let tier_selector = TierSelector::new(SpendingLedger::new(db.clone()), thresholds);

        Self {
            pool: CredentialPool::new(db.clone(), cipher),
            schedules: ScheduleStore::new(db.clone()),
            audit: AuditLog::new(db),
            ledger,
            engine,
            tier_selector,
        }
    }
}
