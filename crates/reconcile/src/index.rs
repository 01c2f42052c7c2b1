//! Reference Index: which specs declare a reference to a given resource.

use std::sync::{Arc, Mutex};

use apiary_core::{ApiaryResult, Kind, Resource, ResourceId};
use apiary_store::ObjectStore;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

#[async_trait::async_trait]
pub trait References: Send + Sync {
    /// Specs whose reference declarations match `target` by kind, name and namespace,
    /// in listing order (namespace, then name).
    async fn find_referencing(&self, target: &ResourceId) -> ApiaryResult<Vec<Resource>>;

    /// Record the current reference declarations of `obj`.
    fn observe(&self, _obj: &Resource) {}

    /// Drop every edge originating at `id`.
    fn forget(&self, _id: &ResourceId) {}
}

/// Linear scan over every kind able to reference the target.
pub struct ScanIndex {
    store: Arc<dyn ObjectStore>,
}

impl ScanIndex {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store } }
}

#[async_trait::async_trait]
impl References for ScanIndex {
    async fn find_referencing(&self, target: &ResourceId) -> ApiaryResult<Vec<Resource>> {
        let mut out = Vec::new();
        for kind in target.kind.referenced_by() {
            for obj in self.store.list(*kind).await? {
                if obj.references_target(target) { out.push(obj); }
            }
        }
        Ok(out)
    }
}

#[derive(Default)]
struct Edges {
    /// target -> referencing objects
    postings: FxHashMap<ResourceId, FxHashSet<ResourceId>>,
    /// referencing object -> targets, to retract stale edges
    forward: FxHashMap<ResourceId, Vec<ResourceId>>,
}

/// Reverse index keyed by target identity, maintained as specs are observed.
///
/// Candidates are re-checked against the store, so a stale edge costs one `get`
/// and never a wrong answer.
pub struct ReverseIndex {
    store: Arc<dyn ObjectStore>,
    edges: Mutex<Edges>,
}

impl ReverseIndex {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store, edges: Mutex::new(Edges::default()) } }

    fn edges(&self) -> std::sync::MutexGuard<'_, Edges> { self.edges.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Observe every object of the kinds that declare references.
    pub async fn prime(&self) -> ApiaryResult<usize> {
        let mut n = 0usize;
        for kind in Kind::ALL.into_iter().filter(|k| k.declares_references()) {
            for obj in self.store.list(kind).await? {
                self.observe(&obj);
                n += 1;
            }
        }
        debug!(objects = n, "index: primed");
        Ok(n)
    }
}

#[async_trait::async_trait]
impl References for ReverseIndex {
    async fn find_referencing(&self, target: &ResourceId) -> ApiaryResult<Vec<Resource>> {
        let mut candidates: Vec<ResourceId> =
            self.edges().postings.get(target).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        candidates.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.key.cmp(&b.key)));
        let mut out = Vec::with_capacity(candidates.len());
        for id in candidates {
            match self.store.get(&id).await? {
                Some(obj) if obj.references_target(target) => out.push(obj),
                Some(obj) => self.observe(&obj),
                None => self.forget(&id),
            }
        }
        Ok(out)
    }

    fn observe(&self, obj: &Resource) {
        if !obj.kind().declares_references() { return; }
        let from = obj.id();
        let targets: Vec<ResourceId> = obj.references().into_iter().collect();
        let mut e = self.edges();
        if let Some(old) = e.forward.remove(&from) {
            for t in old {
                if let Some(set) = e.postings.get_mut(&t) {
                    set.remove(&from);
                    if set.is_empty() { e.postings.remove(&t); }
                }
            }
        }
        for t in targets.iter() {
            e.postings.entry(t.clone()).or_default().insert(from.clone());
        }
        if !targets.is_empty() { e.forward.insert(from, targets); }
    }

    fn forget(&self, id: &ResourceId) {
        let mut e = self.edges();
        if let Some(old) = e.forward.remove(id) {
            for t in old {
                if let Some(set) = e.postings.get_mut(&t) {
                    set.remove(id);
                    if set.is_empty() { e.postings.remove(&t); }
                }
            }
        }
    }
}
