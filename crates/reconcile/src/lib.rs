//! Apiary reconcile: the engine that keeps declared objects and the management
//! plane in agreement.
//!
//! Flow per change event: admission check, remote synchronize, status record,
//! cascade to dependents for shared resources, deletion guard on removal.

#![forbid(unsafe_code)]

pub mod gate;
pub mod guard;
pub mod index;
pub mod planes;
pub mod reconciler;
pub mod runner;
pub mod settings;
pub mod status;

use std::sync::Arc;

use apiary_admission::{AdmissionValidator, SecretLookup};
use apiary_core::ApiaryResult;
use apiary_store::ObjectStore;
use apiary_sync::Synchronizer;
use tracing::info;

pub use gate::AdmissionGate;
pub use guard::{DeletionGuard, GuardState, Release};
pub use index::{References, ReverseIndex, ScanIndex};
pub use planes::{ContextPlanes, PlaneProvider, StaticPlane};
pub use reconciler::{Action, Outcome, Reconciler};
pub use runner::{forward, RunStats, Runner};
pub use settings::{IndexMode, Settings};
pub use status::{RemoteIds, StatusTracker, Subresource};

/// Wire a reconciler from its collaborators. A reverse index is primed before use.
pub async fn build(
    store: Arc<dyn ObjectStore>,
    planes: Arc<dyn PlaneProvider>,
    secrets: Arc<dyn SecretLookup>,
    settings: &Settings,
) -> ApiaryResult<Arc<Reconciler>> {
    let index: Arc<dyn References> = match settings.reference_index {
        IndexMode::Scan => Arc::new(ScanIndex::new(store.clone())),
        IndexMode::Reverse => {
            let idx = ReverseIndex::new(store.clone());
            idx.prime().await?;
            Arc::new(idx)
        }
    };
    let sync = Synchronizer::new(settings.carry_forward.clone(), settings.remote_timeout)
        .skip_unchanged_metadata(settings.skip_unchanged_metadata);
    info!(
        index = ?settings.reference_index,
        conflict_attempts = settings.conflict_attempts,
        carry_forward = ?settings.carry_forward.fields().collect::<Vec<_>>(),
        timeout_ms = %settings.remote_timeout.as_millis(),
        "reconcile: engine ready"
    );
    Ok(Arc::new(Reconciler::new(
        store,
        planes,
        Arc::new(AdmissionValidator::new(secrets)),
        sync,
        index,
        settings.conflict_attempts,
        settings.requeue,
    )))
}
