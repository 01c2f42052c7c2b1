//! Apiary store: the declarative-store seam, an in-RAM implementation and the
//! coalescing work queue that serializes attempts per identity.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use apiary_core::{ApiaryError, ApiaryResult, Delta, Kind, Resource, ResourceId};
use arc_swap::ArcSwap;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Declarative object store as seen by the reconciliation core.
///
/// Writes carry the version token found in `meta.resource_version`; a stale token
/// yields `ApiaryError::Conflict`, a vanished object `ApiaryError::NotFound`.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, id: &ResourceId) -> ApiaryResult<Option<Resource>>;

    /// Point-in-time listing of one kind, in stable order.
    async fn list(&self, kind: Kind) -> ApiaryResult<Vec<Resource>>;

    /// Create the object or replace its spec. Status and finalizers are kept.
    async fn apply(&self, obj: &Resource) -> ApiaryResult<Resource>;

    /// Request removal. Returns true when the object is gone, false when guards keep it.
    async fn delete(&self, id: &ResourceId) -> ApiaryResult<bool>;

    async fn update_status(&self, obj: &Resource) -> ApiaryResult<Resource>;

    /// Persist `meta.finalizers`. An object pending deletion is removed once none remain.
    async fn update_finalizers(&self, obj: &Resource) -> ApiaryResult<Resource>;
}

/// Frozen view of every object held by a `MemoryStore`.
#[derive(Debug, Clone, Default)]
struct World {
    epoch: u64,
    items: FxHashMap<ResourceId, Resource>,
}

/// In-RAM store with copy-on-write snapshots. Readers never block writers.
pub struct MemoryStore {
    snap: ArcSwap<World>,
    write: Mutex<()>,
    events: broadcast::Sender<Delta>,
    pending_conflicts: AtomicUsize,
    write_attempts: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self { Self::with_capacity(1024) }

    pub fn with_capacity(cap: usize) -> Self {
        let (events, _) = broadcast::channel(cap.max(1));
        Self {
            snap: ArcSwap::from_pointee(World::default()),
            write: Mutex::new(()),
            events,
            pending_conflicts: AtomicUsize::new(0),
            write_attempts: AtomicUsize::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delta> { self.events.subscribe() }

    pub fn len(&self) -> usize { self.snap.load().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Make the next `n` status/finalizer writes fail with a conflict.
    pub fn inject_conflicts(&self, n: usize) { self.pending_conflicts.store(n, Ordering::SeqCst); }

    /// Status and finalizer writes attempted so far, including rejected ones.
    pub fn write_attempts(&self) -> usize { self.write_attempts.load(Ordering::SeqCst) }

    fn mutate<T>(&self, f: impl FnOnce(&mut World) -> ApiaryResult<(T, Option<Delta>)>) -> ApiaryResult<T> {
        let _guard = self.write.lock().map_err(|_| ApiaryError::Internal("store lock poisoned".into()))?;
        let mut next = (**self.snap.load()).clone();
        next.epoch = next.epoch.saturating_add(1);
        let (out, delta) = f(&mut next)?;
        self.snap.store(Arc::new(next));
        if let Some(d) = delta {
            // No receivers is fine; events are best-effort notifications.
            let _ = self.events.send(d);
        }
        Ok(out)
    }

    fn checked_write(&self, obj: &Resource, apply: impl FnOnce(&mut Resource)) -> ApiaryResult<Resource> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let id = obj.id();
        if injected {
            return Err(ApiaryError::Conflict(format!("{} was modified concurrently", id)));
        }
        self.mutate(|w| {
            let epoch = w.epoch;
            let cur = w.items.get_mut(&id).ok_or_else(|| ApiaryError::NotFound(id.to_string()))?;
            if cur.meta.resource_version != obj.meta.resource_version {
                return Err(ApiaryError::Conflict(format!(
                    "{}: version {} is stale (current {})",
                    id, obj.meta.resource_version, cur.meta.resource_version
                )));
            }
            apply(cur);
            cur.meta.resource_version = epoch.to_string();
            if cur.meta.deletion_requested && cur.meta.finalizers.is_empty() {
                let gone = w.items.remove(&id).ok_or_else(|| ApiaryError::NotFound(id.to_string()))?;
                debug!(id = %id, "last guard released; object removed");
                return Ok((gone, Some(Delta::deleted(id.clone()))));
            }
            Ok((cur.clone(), None))
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, id: &ResourceId) -> ApiaryResult<Option<Resource>> {
        Ok(self.snap.load().items.get(id).cloned())
    }

    async fn list(&self, kind: Kind) -> ApiaryResult<Vec<Resource>> {
        let snap = self.snap.load_full();
        let mut out: Vec<Resource> = snap.items.values().filter(|r| r.kind() == kind).cloned().collect();
        out.sort_by(|a, b| a.meta.namespace.cmp(&b.meta.namespace).then(a.meta.name.cmp(&b.meta.name)));
        Ok(out)
    }

    async fn apply(&self, obj: &Resource) -> ApiaryResult<Resource> {
        let id = obj.id();
        self.mutate(|w| {
            let epoch = w.epoch;
            let mut next = match w.items.get(&id) {
                Some(cur) => {
                    if !obj.meta.resource_version.is_empty() && obj.meta.resource_version != cur.meta.resource_version {
                        return Err(ApiaryError::Conflict(format!("{}: version {} is stale", id, obj.meta.resource_version)));
                    }
                    let mut next = cur.clone();
                    if next.spec != obj.spec {
                        next.spec = obj.spec.clone();
                        next.meta.generation = next.meta.generation.saturating_add(1);
                    }
                    next
                }
                None => {
                    let mut next = obj.clone();
                    next.meta.generation = 1;
                    next.meta.uid = Some(uuid::Uuid::new_v4().to_string());
                    next.meta.deletion_requested = false;
                    next.status = Default::default();
                    next
                }
            };
            next.meta.resource_version = epoch.to_string();
            w.items.insert(id.clone(), next.clone());
            let delta = Delta::applied(&next);
            Ok((next, Some(delta)))
        })
    }

    async fn delete(&self, id: &ResourceId) -> ApiaryResult<bool> {
        self.mutate(|w| {
            let epoch = w.epoch;
            let cur = w.items.get_mut(id).ok_or_else(|| ApiaryError::NotFound(id.to_string()))?;
            if cur.meta.finalizers.is_empty() {
                w.items.remove(id);
                return Ok((true, Some(Delta::deleted(id.clone()))));
            }
            if cur.meta.deletion_requested {
                return Ok((false, None));
            }
            cur.meta.deletion_requested = true;
            cur.meta.resource_version = epoch.to_string();
            let delta = Delta::applied(cur);
            Ok((false, Some(delta)))
        })
    }

    async fn update_status(&self, obj: &Resource) -> ApiaryResult<Resource> {
        let status = obj.status.clone();
        self.checked_write(obj, move |cur| cur.status = status)
    }

    async fn update_finalizers(&self, obj: &Resource) -> ApiaryResult<Resource> {
        let finalizers = obj.meta.finalizers.clone();
        self.checked_write(obj, move |cur| cur.meta.finalizers = finalizers)
    }
}

/// Coalescing queue keyed by identity with FIFO order and fixed capacity.
pub struct Coalescer {
    set: FxHashSet<ResourceId>,
    order: VecDeque<ResourceId>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { set: FxHashSet::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.set.len() }
    pub fn is_empty(&self) -> bool { self.set.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, id: ResourceId) {
        if self.set.contains(&id) { return; }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
                self.dropped += 1;
                metrics::counter!("queue_dropped", 1u64);
                warn!(id = %old, "work queue full; dropped oldest entry (resync will pick it up)");
            }
        }
        self.set.insert(id.clone());
        self.order.push_back(id);
    }

    pub fn pop(&mut self) -> Option<ResourceId> {
        let id = self.order.pop_front()?;
        self.set.remove(&id);
        Some(id)
    }
}

/// Work queue guaranteeing at most one in-flight attempt per identity.
///
/// Identities pushed while in flight are parked and handed out again after `done`.
pub struct WorkQueue {
    ready: Coalescer,
    in_flight: FxHashSet<ResourceId>,
    dirty: FxHashSet<ResourceId>,
}

impl WorkQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self { ready: Coalescer::with_capacity(cap), in_flight: FxHashSet::default(), dirty: FxHashSet::default() }
    }

    pub fn push(&mut self, id: ResourceId) {
        if self.in_flight.contains(&id) {
            self.dirty.insert(id);
        } else {
            self.ready.push(id);
        }
    }

    /// Next identity to work on; it stays in flight until `done`.
    pub fn next(&mut self) -> Option<ResourceId> {
        let id = self.ready.pop()?;
        self.in_flight.insert(id.clone());
        Some(id)
    }

    pub fn done(&mut self, id: &ResourceId) {
        self.in_flight.remove(id);
        if self.dirty.remove(id) { self.ready.push(id.clone()); }
    }

    pub fn pending(&self) -> usize { self.ready.len() }
    pub fn dropped(&self) -> u64 { self.ready.dropped() }
}
