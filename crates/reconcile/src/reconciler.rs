use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use apiary_admission::AdmissionValidator;
use apiary_core::gateway::Materializer;
use apiary_core::{
    ApiDefinitionSpec, ApiaryError, ApiaryResult, Kind, ObjectRef, Resource, ResourceEntry, ResourceId, Spec,
};
use apiary_mgmt::ManagementApi;
use apiary_store::ObjectStore;
use apiary_sync::{application_payload, Synchronizer};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::guard::{DeletionGuard, GuardState, Release};
use crate::index::References;
use crate::planes::PlaneProvider;
use crate::status::{RemoteIds, StatusTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    Requeue(Duration),
}

/// Result of one attempt: what to do with this identity, and which other
/// identities must be re-evaluated because of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub action: Action,
    pub enqueue: Vec<ResourceId>,
}

impl Outcome {
    fn done() -> Self { Self { action: Action::Done, enqueue: Vec::new() } }
    fn requeue(after: Duration) -> Self { Self { action: Action::Requeue(after), enqueue: Vec::new() } }
    fn with(mut self, ids: Vec<ResourceId>) -> Self {
        self.enqueue.extend(ids);
        self
    }
}

/// Drives one object toward its declared state. Attempts for one identity must
/// not overlap; the runner's work queue guarantees that.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    planes: Arc<dyn PlaneProvider>,
    admission: Arc<AdmissionValidator>,
    sync: Synchronizer,
    status: Arc<StatusTracker>,
    guard: DeletionGuard,
    index: Arc<dyn References>,
    requeue: Duration,
    /// Last seen content of each secret; secrets carry no generation.
    secret_digests: Mutex<FxHashMap<ResourceId, u64>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        planes: Arc<dyn PlaneProvider>,
        admission: Arc<AdmissionValidator>,
        sync: Synchronizer,
        index: Arc<dyn References>,
        conflict_attempts: usize,
        requeue: Duration,
    ) -> Self {
        let status = Arc::new(StatusTracker::new(store.clone(), conflict_attempts));
        let guard = DeletionGuard::new(status.clone(), index.clone());
        Self {
            store,
            planes,
            admission,
            sync,
            status,
            guard,
            index,
            requeue,
            secret_digests: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> { &self.store }
    pub fn status(&self) -> &StatusTracker { &self.status }

    pub async fn reconcile(&self, id: &ResourceId) -> ApiaryResult<Outcome> {
        let t0 = Instant::now();
        let Some(obj) = self.store.get(id).await? else {
            self.index.forget(id);
            self.secret_digests.lock().unwrap_or_else(|p| p.into_inner()).remove(id);
            debug!(id = %id, "reconcile: object gone");
            return Ok(Outcome::done());
        };
        self.index.observe(&obj);
        debug!(id = %id, generation = obj.meta.generation, guard = ?GuardState::of(&obj), "reconcile: start");
        let res = if obj.is_being_deleted() { self.finalize(&obj).await } else { self.apply(&obj).await };
        histogram_ms(t0);
        match &res {
            Ok(out) => {
                metrics::counter!("reconcile_ok", 1u64);
                info!(id = %id, action = ?out.action, enqueued = out.enqueue.len(), took_ms = %t0.elapsed().as_millis(), "reconcile: ok");
            }
            Err(e) => {
                metrics::counter!("reconcile_err", 1u64);
                warn!(id = %id, error = %e, took_ms = %t0.elapsed().as_millis(), "reconcile: error");
            }
        }
        res
    }

    async fn apply(&self, obj: &Resource) -> ApiaryResult<Outcome> {
        match obj.kind() {
            Kind::ApiDefinition | Kind::Application => self.apply_remote(obj).await,
            Kind::ApiResource | Kind::ManagementContext | Kind::Secret => self.apply_shared(obj).await,
        }
    }

    /// Shared resources have no remote record; a change resets their dependents.
    /// Secrets are only guarded while something references them.
    async fn apply_shared(&self, obj: &Resource) -> ApiaryResult<Outcome> {
        let seen = obj.meta.generation;
        let changed = match &obj.spec {
            Spec::Secret(s) => {
                let digest = digest(&s.data);
                let mut seen = self.secret_digests.lock().unwrap_or_else(|p| p.into_inner());
                seen.insert(obj.id(), digest) != Some(digest)
            }
            _ => !obj.is_up_to_date(),
        };
        if obj.kind() != Kind::Secret {
            if let Err(e) = self.admission.validate(obj).await {
                self.status.mark_failure(obj, &e, None).await?;
                return Ok(Outcome::done());
            }
        }
        let dependents = self.index.find_referencing(&obj.id()).await?;
        let obj = if obj.kind() != Kind::Secret || !dependents.is_empty() {
            match self.guard.ensure(obj).await? {
                Some(latest) => latest,
                None => return Ok(Outcome::done()),
            }
        } else {
            obj.clone()
        };
        let enqueue = if changed { self.reset(&obj.id(), dependents).await } else { Vec::new() };
        self.status.mark_synced(&obj, seen, None).await?;
        Ok(Outcome::done().with(enqueue).with(referenced_secrets(&obj)))
    }

    /// Reset every dependent of `target` to Reconciling and hand them back for
    /// re-evaluation. One failed reset does not stop the others.
    async fn reset(&self, target: &ResourceId, dependents: Vec<Resource>) -> Vec<ResourceId> {
        let mut out = Vec::new();
        for dependent in dependents {
            if dependent.is_being_deleted() { continue; }
            if let Err(e) = self.status.mark_reconciling(&dependent).await {
                warn!(changed = %target, dependent = %dependent.id(), error = %e, "cascade: reset failed");
            }
            out.push(dependent.id());
        }
        if !out.is_empty() {
            info!(changed = %target, dependents = out.len(), "cascade: dependents reset");
        }
        out
    }

    async fn apply_remote(&self, obj: &Resource) -> ApiaryResult<Outcome> {
        if obj.is_up_to_date() && obj.has_finalizer(obj.kind().finalizer()) {
            debug!(id = %obj.id(), "reconcile: up to date");
            return Ok(Outcome::done());
        }
        let mut obj = obj.clone();
        if obj.status.phase == apiary_core::Phase::Completed && obj.status.observed_generation != obj.meta.generation {
            match self.status.mark_reconciling(&obj).await? {
                Some(latest) => obj = latest,
                None => return Ok(Outcome::done()),
            }
        }
        let synced = obj.meta.generation;
        let rendered = match self.admit_and_render(&obj).await {
            Ok(r) => r,
            Err(e) => return self.fail(&obj, e, None).await,
        };
        let plane = match self.planes.plane_for(&rendered).await {
            Ok(p) => p,
            Err(e) => return self.fail(&obj, e, None).await,
        };
        let Some(plane) = plane else {
            debug!(id = %obj.id(), "reconcile: local only");
            return self.complete(&obj, synced, None).await;
        };
        let ids = match self.push(plane.as_ref(), &obj, &rendered).await {
            Ok(ids) => ids,
            Err(e) => return self.fail(&obj, e, None).await,
        };
        // Guard as soon as a remote record exists.
        let guarded = match self.guard.ensure(&obj).await {
            Ok(Some(g)) => g,
            Ok(None) => return Ok(Outcome::done()),
            Err(e) => return self.fail(&obj, e, Some(ids)).await,
        };
        match self.push_metadata(plane.as_ref(), &guarded, &rendered, &ids).await {
            Ok(()) => self.complete(&guarded, synced, Some(ids)).await,
            Err(e) => self.fail(&guarded, e, Some(ids)).await,
        }
    }

    async fn admit_and_render(&self, obj: &Resource) -> ApiaryResult<Resource> {
        self.admission.validate(obj).await?;
        self.admission.render(obj).await
    }

    /// Create or update the remote record.
    async fn push(&self, plane: &dyn ManagementApi, obj: &Resource, rendered: &Resource) -> ApiaryResult<RemoteIds> {
        let payload = self.payload(rendered).await?;
        let outcome = self
            .sync
            .synchronize(plane, obj.kind(), &obj.key().to_string(), obj.status.remote_id.as_deref(), &payload)
            .await?;
        Ok(RemoteIds { remote_id: outcome.remote_id, env_id: outcome.env_id, org_id: outcome.org_id })
    }

    async fn push_metadata(&self, plane: &dyn ManagementApi, obj: &Resource, rendered: &Resource, ids: &RemoteIds) -> ApiaryResult<()> {
        let Spec::Application(app) = &rendered.spec else { return Ok(()) };
        let Some(desired) = &app.metadata else { return Ok(()) };
        self.sync
            .reconcile_metadata(plane, &ids.remote_id, desired)
            .await
            .map(|_| ())
            .map_err(|e| e.scoped(&obj.key().to_string()))
    }

    async fn payload(&self, rendered: &Resource) -> ApiaryResult<Json> {
        match &rendered.spec {
            Spec::ApiDefinition(api) => {
                let resolved = self.resolve_resources(&rendered.meta.namespace, api).await?;
                Materializer::new().materialize(&resolved)
            }
            Spec::Application(app) => application_payload(app),
            other => Err(ApiaryError::Internal(format!("{} has no remote payload", other.kind()))),
        }
    }

    /// Inline every referenced `ApiResource`, with its own templates rendered.
    async fn resolve_resources(&self, namespace: &str, api: &ApiDefinitionSpec) -> ApiaryResult<ApiDefinitionSpec> {
        let mut out = api.clone();
        for entry in out.resources.iter_mut() {
            let ResourceEntry::Ref { reference } = entry else { continue };
            let id = ObjectRef::new(Kind::ApiResource, reference).resolve(namespace);
            let found = self
                .store
                .get(&id)
                .await?
                .ok_or_else(|| ApiaryError::Validation(format!("api resource [{}] not found", id.key)))?;
            let found = self.admission.render(&found).await?;
            match found.spec {
                Spec::ApiResource(spec) => *entry = ResourceEntry::Inline(spec),
                other => return Err(ApiaryError::Internal(format!("{} resolved to a {}", id, other.kind()))),
            }
        }
        Ok(out)
    }

    /// `obj` may be newer than `synced`, the generation this attempt shipped.
    async fn complete(&self, obj: &Resource, synced: i64, ids: Option<RemoteIds>) -> ApiaryResult<Outcome> {
        let Some(guarded) = self.guard.ensure(obj).await? else { return Ok(Outcome::done()) };
        self.status.mark_synced(&guarded, synced, ids.as_ref()).await?;
        Ok(Outcome::done().with(referenced_secrets(&guarded)))
    }

    async fn fail(&self, obj: &Resource, err: ApiaryError, ids: Option<RemoteIds>) -> ApiaryResult<Outcome> {
        warn!(id = %obj.id(), error = %err, "reconcile: failed");
        self.status.mark_failure(obj, &err, ids.as_ref()).await?;
        Ok(if err.is_retryable() { Outcome::requeue(self.requeue) } else { Outcome::done() })
    }

    /// Teardown, then release our own guard, then notify everything we referenced.
    async fn finalize(&self, obj: &Resource) -> ApiaryResult<Outcome> {
        let id = obj.id();
        if !obj.has_finalizer(obj.kind().finalizer()) {
            return Ok(Outcome::done());
        }
        if obj.kind().is_remote() {
            if let Some(remote_id) = obj.status.remote_id.as_deref() {
                let plane = match self.planes.plane_for(obj).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(id = %id, error = %e, "finalize: no plane; guard kept");
                        return Ok(Outcome::requeue(self.requeue));
                    }
                };
                if let Some(plane) = plane {
                    if let Err(e) = self.sync.teardown(plane.as_ref(), obj.kind(), &obj.key().to_string(), remote_id).await {
                        warn!(id = %id, error = %e, "finalize: teardown failed; guard kept");
                        return Ok(Outcome::requeue(self.requeue));
                    }
                }
            }
        }
        match self.guard.try_release(obj).await? {
            Release::Blocked { .. } => Ok(Outcome::done()),
            Release::Released | Release::Absent => {
                let referenced: Vec<ResourceId> = obj.references().into_iter().collect();
                Ok(Outcome::done().with(referenced))
            }
        }
    }
}

/// Referenced secrets re-evaluate their guard once a dependent is in place.
fn referenced_secrets(obj: &Resource) -> Vec<ResourceId> {
    obj.references().into_iter().filter(|r| r.kind == Kind::Secret).collect()
}

fn histogram_ms(t0: Instant) {
    metrics::histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
}

fn digest(data: &std::collections::BTreeMap<String, String>) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = rustc_hash::FxHasher::default();
    data.hash(&mut h);
    h.finish()
}
