//! Status Tracker: the only writer of processing status.
//!
//! Every write goes through a bounded optimistic retry. On a version conflict the
//! latest object is re-fetched and the same mutation re-applied; any other error
//! is returned at once. An object that vanished mid-flight is never written.

use std::sync::Arc;

use apiary_core::{ApiaryError, ApiaryResult, Kind, Phase, Resource};
use apiary_store::ObjectStore;
use tracing::debug;

/// Which part of the object a retried write persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subresource {
    Status,
    Finalizers,
}

/// Remote identifiers recorded after a successful synchronize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteIds {
    pub remote_id: String,
    pub env_id: String,
    pub org_id: String,
}

fn record_ids(obj: &mut Resource, ids: Option<&RemoteIds>) -> bool {
    let Some(ids) = ids else { return false };
    let s = &mut obj.status;
    let changed = s.remote_id.as_deref() != Some(ids.remote_id.as_str())
        || s.env_id.as_deref() != Some(ids.env_id.as_str())
        || s.org_id.as_deref() != Some(ids.org_id.as_str());
    s.remote_id = Some(ids.remote_id.clone());
    s.env_id = Some(ids.env_id.clone());
    s.org_id = Some(ids.org_id.clone());
    changed
}

pub struct StatusTracker {
    store: Arc<dyn ObjectStore>,
    attempts: usize,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn ObjectStore>, attempts: usize) -> Self { Self { store, attempts: attempts.max(1) } }

    /// Apply `mutate` and persist, retrying on conflicts. `mutate` returns false
    /// when there is nothing to write. `Ok(None)` means the object is gone.
    pub async fn retry_on_conflict<F>(&self, obj: &Resource, part: Subresource, mutate: F) -> ApiaryResult<Option<Resource>>
    where
        F: Fn(&mut Resource) -> bool + Send + Sync,
    {
        let id = obj.id();
        let mut cur = obj.clone();
        for attempt in 1..=self.attempts {
            if !mutate(&mut cur) {
                return Ok(Some(cur));
            }
            let res = match part {
                Subresource::Status => self.store.update_status(&cur).await,
                Subresource::Finalizers => self.store.update_finalizers(&cur).await,
            };
            match res {
                Ok(written) => return Ok(Some(written)),
                Err(ApiaryError::Conflict(msg)) if attempt < self.attempts => {
                    metrics::counter!("status_conflict_retries", 1u64);
                    debug!(id = %id, attempt, error = %msg, "status: conflict; refetching");
                    match self.store.get(&id).await? {
                        Some(latest) => cur = latest,
                        None => return Ok(None),
                    }
                }
                Err(ApiaryError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Err(ApiaryError::Conflict(format!("{}: gave up after {} attempts", id, self.attempts)))
    }

    /// Record that remote state matches the current generation of `obj`.
    pub async fn mark_success(&self, obj: &Resource, ids: Option<&RemoteIds>) -> ApiaryResult<Option<Resource>> {
        self.mark_synced(obj, obj.meta.generation, ids).await
    }

    /// Record that generation `synced` reached the remote side. `obj` may already
    /// be newer; then the phase stays Reconciling so the next attempt ships the
    /// newer spec. No-op while the object is being deleted, and when nothing
    /// would change.
    pub async fn mark_synced(&self, obj: &Resource, synced: i64, ids: Option<&RemoteIds>) -> ApiaryResult<Option<Resource>> {
        if obj.kind() == Kind::Secret { return Ok(Some(obj.clone())); }
        self.retry_on_conflict(obj, Subresource::Status, |o| {
            if o.is_being_deleted() || o.status.observed_generation > synced { return false; }
            let ids_changed = record_ids(o, ids);
            let phase = if o.meta.generation == synced { Phase::Completed } else { Phase::Reconciling };
            if o.status.observed_generation == synced && o.status.phase == phase && o.status.message.is_none() && !ids_changed {
                return false;
            }
            o.status.observed_generation = synced;
            o.status.phase = phase;
            o.status.message = None;
            true
        })
        .await
    }

    /// Record a failed attempt. `observed_generation` is left alone so drift detection retries it.
    pub async fn mark_failure(&self, obj: &Resource, err: &ApiaryError, ids: Option<&RemoteIds>) -> ApiaryResult<Option<Resource>> {
        if obj.kind() == Kind::Secret { return Ok(Some(obj.clone())); }
        let message = err.to_string();
        self.retry_on_conflict(obj, Subresource::Status, |o| {
            if o.is_being_deleted() { return false; }
            let ids_changed = record_ids(o, ids);
            if o.status.phase == Phase::Failed && o.status.message.as_deref() == Some(message.as_str()) && !ids_changed {
                return false;
            }
            o.status.phase = Phase::Failed;
            o.status.message = Some(message.clone());
            true
        })
        .await
    }

    /// Reset to Reconciling so the next attempt re-synchronizes.
    pub async fn mark_reconciling(&self, obj: &Resource) -> ApiaryResult<Option<Resource>> {
        if obj.kind() == Kind::Secret { return Ok(Some(obj.clone())); }
        self.retry_on_conflict(obj, Subresource::Status, |o| {
            if o.is_being_deleted() || o.status.phase == Phase::Reconciling { return false; }
            o.status.phase = Phase::Reconciling;
            true
        })
        .await
    }
}
