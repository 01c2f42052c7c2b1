//! Deletion Guard: a finalizer that keeps an object in the store until nothing
//! references it and its remote teardown is done.

use std::sync::Arc;

use apiary_core::{ApiaryResult, Resource, ResourceId};
use tracing::info;

use crate::index::References;
use crate::status::{StatusTracker, Subresource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Unguarded,
    Guarded,
    ReleasePending,
}

impl GuardState {
    pub fn of(obj: &Resource) -> Self {
        match (obj.has_finalizer(obj.kind().finalizer()), obj.is_being_deleted()) {
            (false, _) => Self::Unguarded,
            (true, false) => Self::Guarded,
            (true, true) => Self::ReleasePending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Guard removed; the store may now drop the object.
    Released,
    /// Still referenced; the deletion request stays pending.
    Blocked { by: Vec<ResourceId> },
    /// No guard was attached.
    Absent,
}

pub struct DeletionGuard {
    tracker: Arc<StatusTracker>,
    index: Arc<dyn References>,
}

impl DeletionGuard {
    pub fn new(tracker: Arc<StatusTracker>, index: Arc<dyn References>) -> Self { Self { tracker, index } }

    /// Attach the guard. Returns the latest object, or `None` if it vanished.
    pub async fn ensure(&self, obj: &Resource) -> ApiaryResult<Option<Resource>> {
        let marker = obj.kind().finalizer();
        self.tracker
            .retry_on_conflict(obj, Subresource::Finalizers, |o| !o.is_being_deleted() && o.add_finalizer(marker))
            .await
    }

    /// Release the guard of an object pending deletion once no spec references it.
    /// Remote teardown, when the kind has one, must have succeeded before this is called.
    pub async fn try_release(&self, obj: &Resource) -> ApiaryResult<Release> {
        let marker = obj.kind().finalizer();
        if !obj.has_finalizer(marker) {
            return Ok(Release::Absent);
        }
        let id = obj.id();
        if !id.kind.referenced_by().is_empty() {
            let by: Vec<ResourceId> = self.index.find_referencing(&id).await?.iter().map(Resource::id).collect();
            if !by.is_empty() {
                metrics::counter!("guard_blocked", 1u64);
                info!(id = %id, referenced_by = by.len(), first = %by[0], "guard: deletion blocked");
                return Ok(Release::Blocked { by });
            }
        }
        self.tracker.retry_on_conflict(obj, Subresource::Finalizers, |o| o.remove_finalizer(marker)).await?;
        info!(id = %id, "guard: released");
        Ok(Release::Released)
    }
}
