use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apiary_admission::StoreSecrets;
use apiary_core::{
    ApiDefinitionSpec, ApiResourceSpec, ApiaryError, ApplicationSpec, Delta, Kind, MetadataEntry, NamespacedName, Phase,
    Plan, Resource, ResourceEntry, ResourceId, SecretSpec, Spec,
};
use apiary_mgmt::{Call, ManagementApi, MemoryPlane, RemoteRecord};
use apiary_reconcile::{build, AdmissionGate, Action, IndexMode, Reconciler, Runner, Settings, StaticPlane};
use apiary_store::{MemoryStore, ObjectStore};
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;

struct Harness {
    store: Arc<MemoryStore>,
    plane: Arc<MemoryPlane>,
    rec: Arc<Reconciler>,
    gate: AdmissionGate,
}

async fn harness_with(mode: IndexMode, remote: bool) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let plane = Arc::new(MemoryPlane::new("dev", "acme"));
    let planes = if remote { StaticPlane::new(plane.clone()) } else { StaticPlane::none() };
    assemble(store, plane, planes, mode).await
}

async fn assemble(store: Arc<MemoryStore>, plane: Arc<MemoryPlane>, planes: StaticPlane, mode: IndexMode) -> Harness {
    let secrets = Arc::new(StoreSecrets::new(store.clone()));
    let settings = Settings { reference_index: mode, requeue: Duration::from_millis(20), ..Settings::default() };
    let rec = build(store.clone(), Arc::new(planes), secrets.clone(), &settings).await.unwrap();
    let gate = AdmissionGate::new(store.clone(), Arc::new(apiary_admission::AdmissionValidator::new(secrets)));
    Harness { store, plane, rec, gate }
}

async fn harness() -> Harness { harness_with(IndexMode::Scan, true).await }

/// Memory plane whose metadata endpoints can be taken down, and which can apply
/// a spec edit to the store while a create is in flight.
struct Flaky {
    inner: Arc<MemoryPlane>,
    store: Arc<MemoryStore>,
    metadata_down: AtomicBool,
    edit_during_create: Mutex<Option<Resource>>,
}

#[async_trait::async_trait]
impl ManagementApi for Flaky {
    fn env_id(&self) -> &str { self.inner.env_id() }
    fn org_id(&self) -> &str { self.inner.org_id() }

    async fn create(&self, kind: Kind, payload: &Json) -> apiary_core::ApiaryResult<RemoteRecord> {
        let edit = self.edit_during_create.lock().unwrap().take();
        if let Some(edit) = edit {
            self.store.apply(&edit).await?;
        }
        self.inner.create(kind, payload).await
    }

    async fn update(&self, kind: Kind, remote_id: &str, payload: &Json) -> apiary_core::ApiaryResult<RemoteRecord> {
        self.inner.update(kind, remote_id, payload).await
    }

    async fn get(&self, kind: Kind, remote_id: &str) -> apiary_core::ApiaryResult<Option<RemoteRecord>> {
        self.inner.get(kind, remote_id).await
    }

    async fn delete(&self, kind: Kind, remote_id: &str) -> apiary_core::ApiaryResult<()> { self.inner.delete(kind, remote_id).await }

    async fn list_metadata(&self, app_id: &str) -> apiary_core::ApiaryResult<Vec<MetadataEntry>> {
        if self.metadata_down.load(Ordering::SeqCst) {
            return Err(ApiaryError::from_status(401, "list metadata", app_id, "denied"));
        }
        self.inner.list_metadata(app_id).await
    }

    async fn create_metadata(&self, app_id: &str, entry: &MetadataEntry) -> apiary_core::ApiaryResult<MetadataEntry> {
        self.inner.create_metadata(app_id, entry).await
    }

    async fn update_metadata(&self, app_id: &str, entry: &MetadataEntry) -> apiary_core::ApiaryResult<MetadataEntry> {
        self.inner.update_metadata(app_id, entry).await
    }

    async fn delete_metadata(&self, app_id: &str, key: &str) -> apiary_core::ApiaryResult<()> {
        self.inner.delete_metadata(app_id, key).await
    }
}

async fn flaky_harness() -> (Harness, Arc<Flaky>) {
    let store = Arc::new(MemoryStore::new());
    let plane = Arc::new(MemoryPlane::new("dev", "acme"));
    let flaky = Arc::new(Flaky {
        inner: plane.clone(),
        store: store.clone(),
        metadata_down: AtomicBool::new(false),
        edit_during_create: Mutex::new(None),
    });
    let h = assemble(store, plane, StaticPlane::new(flaky.clone()), IndexMode::Scan).await;
    (h, flaky)
}

fn secret(name: &str, pairs: &[(&str, &str)]) -> Resource {
    let data = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Resource::new("default", name, Spec::Secret(SecretSpec { data }))
}

/// Reconcile until no identity is handed back. Requeues are ignored.
async fn settle(rec: &Reconciler, ids: Vec<ResourceId>) {
    let mut q: VecDeque<ResourceId> = ids.into();
    let mut rounds = 0;
    while let Some(id) = q.pop_front() {
        rounds += 1;
        assert!(rounds < 200, "reconciliation did not settle");
        let out = rec.reconcile(&id).await.unwrap();
        for next in out.enqueue {
            if !q.contains(&next) { q.push_back(next); }
        }
    }
}

fn app(metadata: &[(&str, &str)]) -> Resource {
    Resource::new("default", "shop", Spec::Application(ApplicationSpec {
        name: "shop".into(),
        metadata: Some(metadata.iter().map(|(n, v)| MetadataEntry::new(*n, *v)).collect()),
        ..Default::default()
    }))
}

fn cache(ttl: u64) -> Resource {
    Resource::new("default", "cache", Spec::ApiResource(ApiResourceSpec {
        name: "cache".into(),
        resource_type: "cache".into(),
        configuration: json!({ "timeToLiveSeconds": ttl }),
        enabled: true,
    }))
}

fn orders(security: &str) -> Resource {
    Resource::new("default", "orders", Spec::ApiDefinition(ApiDefinitionSpec {
        name: "orders".into(),
        version: "1".into(),
        plans: vec![Plan { name: "free".into(), security: security.into(), security_definition: None }],
        resources: vec![ResourceEntry::Ref { reference: NamespacedName::new("cache") }],
        ..Default::default()
    }))
}

async fn get(h: &Harness, kind: Kind, name: &str) -> Option<Resource> {
    h.store.get(&ResourceId::new(kind, "default", name)).await.unwrap()
}

fn metadata_names(plane: &MemoryPlane, app_id: &str) -> Vec<String> {
    let mut n: Vec<String> = plane.metadata(app_id).into_iter().map(|m| m.name).collect();
    n.sort();
    n
}

#[tokio::test]
async fn application_metadata_follows_edits() {
    let h = harness().await;
    let created = h.gate.apply(&app(&[("owner", "alice"), ("team", "core")])).await.unwrap();
    settle(&h.rec, vec![created.id()]).await;

    let obj = get(&h, Kind::Application, "shop").await.unwrap();
    assert_eq!(obj.status.phase, Phase::Completed);
    assert_eq!(obj.status.observed_generation, 1);
    assert_eq!(obj.status.env_id.as_deref(), Some("dev"));
    assert!(obj.has_finalizer(Kind::Application.finalizer()));
    let app_id = obj.status.remote_id.clone().unwrap();
    assert_eq!(h.plane.count(|c| matches!(c, Call::Create(Kind::Application))), 1);
    assert_eq!(h.plane.count(|c| matches!(c, Call::CreateMetadata(..))), 2);
    assert_eq!(h.plane.record(Kind::Application, &app_id).unwrap().payload["origin"], "KUBERNETES");

    h.plane.clear_calls();
    h.gate.apply(&app(&[("owner", "alice"), ("region", "eu")])).await.unwrap();
    settle(&h.rec, vec![created.id()]).await;

    assert_eq!(h.plane.count(|c| matches!(c, Call::Create(_))), 0);
    assert_eq!(h.plane.count(|c| matches!(c, Call::Update(Kind::Application, id) if *id == app_id)), 1);
    assert_eq!(h.plane.count(|c| matches!(c, Call::UpdateMetadata(..))), 1);
    assert_eq!(h.plane.count(|c| matches!(c, Call::DeleteMetadata(..))), 1);
    assert_eq!(h.plane.count(|c| matches!(c, Call::CreateMetadata(_, n) if n == "region")), 1);
    assert_eq!(metadata_names(&h.plane, &app_id), vec!["owner", "region"]);
    let obj = get(&h, Kind::Application, "shop").await.unwrap();
    assert_eq!((obj.status.phase, obj.status.observed_generation), (Phase::Completed, 2));
    assert_eq!(obj.status.remote_id.as_deref(), Some(app_id.as_str()));
}

#[tokio::test]
async fn up_to_date_objects_cause_no_writes() {
    let h = harness().await;
    let created = h.gate.apply(&app(&[("owner", "alice")])).await.unwrap();
    settle(&h.rec, vec![created.id()]).await;

    let writes = h.store.write_attempts();
    let calls = h.plane.calls().len();
    for _ in 0..3 {
        let out = h.rec.reconcile(&created.id()).await.unwrap();
        assert_eq!(out.action, Action::Done);
    }
    assert_eq!(h.store.write_attempts(), writes);
    assert_eq!(h.plane.calls().len(), calls);
}

#[tokio::test]
async fn missing_secret_is_rejected_before_any_remote_call() {
    let h = harness().await;
    h.store.apply(&cache(60)).await.unwrap();
    let err = h.gate.apply(&orders("[[ secret `missing-secret/security` ]]")).await.unwrap_err();
    assert_eq!(err, ApiaryError::Validation("secret [default/missing-secret] not found".into()));
    assert!(get(&h, Kind::ApiDefinition, "orders").await.is_none());
    assert!(h.plane.calls().is_empty());
}

#[tokio::test]
async fn secret_arrival_heals_a_failed_spec() {
    let h = harness().await;
    let c = h.store.apply(&cache(60)).await.unwrap();
    // Stored without the gate, as happens when no admission hook is installed.
    let api = h.store.apply(&orders("[[ secret `plans/security` ]]")).await.unwrap();
    settle(&h.rec, vec![c.id(), api.id()]).await;

    let failed = get(&h, Kind::ApiDefinition, "orders").await.unwrap();
    assert_eq!(failed.status.phase, Phase::Failed);
    assert_eq!(failed.status.message.as_deref(), Some("validation: secret [default/plans] not found"));
    assert!(h.plane.calls().is_empty());

    let mut data = std::collections::BTreeMap::new();
    data.insert("security".to_string(), "KEY_LESS".to_string());
    let secret = h.store.apply(&Resource::new("default", "plans", Spec::Secret(SecretSpec { data }))).await.unwrap();
    settle(&h.rec, vec![secret.id()]).await;

    let healed = get(&h, Kind::ApiDefinition, "orders").await.unwrap();
    assert_eq!(healed.status.phase, Phase::Completed);
    let rec = h.plane.record(Kind::ApiDefinition, healed.status.remote_id.as_deref().unwrap()).unwrap();
    assert_eq!(rec.payload["plans"][0]["security"], "KEY_LESS");
    assert_eq!(rec.payload["resources"][0]["type"], "cache");
    let stored = get(&h, Kind::ApiDefinition, "orders").await.unwrap();
    assert!(matches!(&stored.spec, Spec::ApiDefinition(a) if a.plans[0].security.starts_with("[[")));
    assert!(get(&h, Kind::Secret, "plans").await.unwrap().has_finalizer(Kind::Secret.finalizer()));
}

async fn deletion_guard_scenario(mode: IndexMode) {
    let h = harness_with(mode, true).await;
    let c = h.gate.apply(&cache(60)).await.unwrap();
    let api = h.gate.apply(&orders("KEY_LESS")).await.unwrap();
    settle(&h.rec, vec![c.id(), api.id()]).await;
    assert_eq!(h.plane.records(Kind::ApiDefinition).len(), 1);

    assert!(!h.gate.delete(&c.id()).await.unwrap());
    settle(&h.rec, vec![c.id()]).await;
    let pending = get(&h, Kind::ApiResource, "cache").await.expect("guard must keep the referenced resource");
    assert!(pending.is_being_deleted());

    assert!(!h.gate.delete(&api.id()).await.unwrap());
    settle(&h.rec, vec![api.id()]).await;
    assert!(get(&h, Kind::ApiDefinition, "orders").await.is_none());
    assert!(get(&h, Kind::ApiResource, "cache").await.is_none(), "finalizing the api re-evaluates the resource guard");
    assert!(h.plane.records(Kind::ApiDefinition).is_empty());
    assert_eq!(h.plane.count(|c| matches!(c, Call::Delete(Kind::ApiDefinition, _))), 1);
}

#[tokio::test]
async fn referenced_resource_outlives_its_dependent_scan() { deletion_guard_scenario(IndexMode::Scan).await; }

#[tokio::test]
async fn referenced_resource_outlives_its_dependent_reverse() { deletion_guard_scenario(IndexMode::Reverse).await; }

#[tokio::test]
async fn teardown_of_a_vanished_record_still_releases() {
    let h = harness().await;
    let created = h.gate.apply(&app(&[])).await.unwrap();
    settle(&h.rec, vec![created.id()]).await;
    let remote_id = get(&h, Kind::Application, "shop").await.unwrap().status.remote_id.unwrap();
    h.plane.forget(Kind::Application, &remote_id);

    h.store.delete(&created.id()).await.unwrap();
    settle(&h.rec, vec![created.id()]).await;
    assert!(get(&h, Kind::Application, "shop").await.is_none());
}

#[tokio::test]
async fn failed_teardown_keeps_the_guard() {
    let h = harness().await;
    let created = h.gate.apply(&app(&[])).await.unwrap();
    settle(&h.rec, vec![created.id()]).await;
    h.store.delete(&created.id()).await.unwrap();

    h.plane.fail_next(ApiaryError::from_status(503, "delete", "Application", "down"));
    let out = h.rec.reconcile(&created.id()).await.unwrap();
    assert!(matches!(out.action, Action::Requeue(_)));
    assert!(get(&h, Kind::Application, "shop").await.is_some());

    settle(&h.rec, vec![created.id()]).await;
    assert!(get(&h, Kind::Application, "shop").await.is_none());
}

#[tokio::test]
async fn changed_resource_resets_and_resyncs_dependents() {
    let h = harness().await;
    let c = h.gate.apply(&cache(60)).await.unwrap();
    let api = h.gate.apply(&orders("KEY_LESS")).await.unwrap();
    settle(&h.rec, vec![c.id(), api.id()]).await;
    h.plane.clear_calls();

    h.gate.apply(&cache(120)).await.unwrap();
    let out = h.rec.reconcile(&c.id()).await.unwrap();
    assert_eq!(out.enqueue, vec![api.id()]);
    let reset = get(&h, Kind::ApiDefinition, "orders").await.unwrap();
    assert_eq!(reset.status.phase, Phase::Reconciling);

    settle(&h.rec, out.enqueue).await;
    let done = get(&h, Kind::ApiDefinition, "orders").await.unwrap();
    assert_eq!(done.status.phase, Phase::Completed);
    let rec = h.plane.record(Kind::ApiDefinition, done.status.remote_id.as_deref().unwrap()).unwrap();
    assert_eq!(rec.payload["resources"][0]["configuration"]["timeToLiveSeconds"], 120);
    assert_eq!(h.plane.count(|c| matches!(c, Call::Update(Kind::ApiDefinition, _))), 1);
}

#[tokio::test]
async fn transient_failure_is_recorded_and_requeued() {
    let h = harness().await;
    let created = h.gate.apply(&app(&[])).await.unwrap();
    h.plane.fail_next(ApiaryError::from_status(503, "create", "Application", "down"));
    let out = h.rec.reconcile(&created.id()).await.unwrap();
    assert!(matches!(out.action, Action::Requeue(_)));
    let failed = get(&h, Kind::Application, "shop").await.unwrap();
    assert_eq!(failed.status.phase, Phase::Failed);
    assert!(failed.status.message.unwrap().contains("down"));

    h.rec.reconcile(&created.id()).await.unwrap();
    assert_eq!(get(&h, Kind::Application, "shop").await.unwrap().status.phase, Phase::Completed);
}

#[tokio::test]
async fn objects_without_a_plane_complete_locally() {
    let h = harness_with(IndexMode::Scan, false).await;
    let created = h.gate.apply(&app(&[("owner", "alice")])).await.unwrap();
    settle(&h.rec, vec![created.id()]).await;
    let obj = get(&h, Kind::Application, "shop").await.unwrap();
    assert_eq!(obj.status.phase, Phase::Completed);
    assert!(obj.status.remote_id.is_none());
}

#[tokio::test]
async fn runner_coalesces_events_and_drains() {
    let h = harness().await;
    let a = h.gate.apply(&app(&[("owner", "alice")])).await.unwrap();
    let c = h.gate.apply(&cache(60)).await.unwrap();
    let api = h.gate.apply(&orders("KEY_LESS")).await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    for obj in [&a, &a, &c, &api] {
        tx.send(Delta::applied(obj)).await.unwrap();
    }
    drop(tx);
    let settings = Settings { workers: 2, resync: None, requeue: Duration::from_millis(10), ..Settings::default() };
    let stats = Runner::new(h.rec.clone(), &settings).run(rx, std::future::pending()).await;

    assert_eq!(stats.skipped_events, 1);
    assert_eq!(stats.errors, 0);
    for (kind, name) in [(Kind::Application, "shop"), (Kind::ApiResource, "cache"), (Kind::ApiDefinition, "orders")] {
        assert_eq!(get(&h, kind, name).await.unwrap().status.phase, Phase::Completed, "{} {}", kind, name);
    }
    assert_eq!(h.plane.count(|c| matches!(c, Call::Create(Kind::Application))), 1);
}

#[tokio::test]
async fn edit_landing_mid_sync_is_shipped_by_the_next_attempt() {
    let (h, flaky) = flaky_harness().await;
    let created = h.gate.apply(&app(&[("owner", "alice")])).await.unwrap();
    *flaky.edit_during_create.lock().unwrap() = Some(app(&[("owner", "carol")]));

    h.rec.reconcile(&created.id()).await.unwrap();
    let obj = get(&h, Kind::Application, "shop").await.unwrap();
    assert_eq!(obj.meta.generation, 2);
    assert_eq!(obj.status.observed_generation, 1);
    assert_eq!(obj.status.phase, Phase::Reconciling);
    assert!(obj.has_finalizer(Kind::Application.finalizer()));
    let app_id = obj.status.remote_id.clone().unwrap();
    assert_eq!(h.plane.metadata(&app_id)[0].value, "alice");

    settle(&h.rec, vec![created.id()]).await;
    let obj = get(&h, Kind::Application, "shop").await.unwrap();
    assert_eq!((obj.status.phase, obj.status.observed_generation), (Phase::Completed, 2));
    assert_eq!(h.plane.count(|c| matches!(c, Call::Create(Kind::Application))), 1);
    let values: Vec<String> = h.plane.metadata(&app_id).into_iter().map(|m| m.value).collect();
    assert_eq!(values, vec!["carol"]);
}

#[tokio::test]
async fn record_synced_before_a_metadata_failure_is_guarded() {
    let (h, flaky) = flaky_harness().await;
    flaky.metadata_down.store(true, Ordering::SeqCst);
    let created = h.gate.apply(&app(&[("owner", "alice")])).await.unwrap();

    let out = h.rec.reconcile(&created.id()).await.unwrap();
    assert_eq!(out.action, Action::Done);
    let failed = get(&h, Kind::Application, "shop").await.unwrap();
    assert_eq!(failed.status.phase, Phase::Failed);
    assert!(failed.status.remote_id.is_some());
    assert!(failed.has_finalizer(Kind::Application.finalizer()));
    assert_eq!(h.plane.records(Kind::Application).len(), 1);

    assert!(!h.store.delete(&created.id()).await.unwrap(), "guard must hold the object");
    settle(&h.rec, vec![created.id()]).await;
    assert!(get(&h, Kind::Application, "shop").await.is_none());
    assert!(h.plane.records(Kind::Application).is_empty());
}

#[tokio::test]
async fn templates_inside_referenced_resources_are_rendered_and_tracked() {
    let h = harness().await;
    let ttl = h.store.apply(&secret("cache-ttl", &[("ttl", "60")])).await.unwrap();
    let mut templated = cache(0);
    if let Spec::ApiResource(r) = &mut templated.spec {
        r.configuration = json!({ "timeToLiveSeconds": "[[ secret `cache-ttl/ttl` ]]" });
    }
    let c = h.gate.apply(&templated).await.unwrap();
    let api = h.gate.apply(&orders("KEY_LESS")).await.unwrap();
    settle(&h.rec, vec![ttl.id(), c.id(), api.id()]).await;

    let done = get(&h, Kind::ApiDefinition, "orders").await.unwrap();
    assert_eq!(done.status.phase, Phase::Completed);
    let rec = h.plane.record(Kind::ApiDefinition, done.status.remote_id.as_deref().unwrap()).unwrap();
    assert_eq!(rec.payload["resources"][0]["configuration"]["timeToLiveSeconds"], "60");
    assert!(get(&h, Kind::Secret, "cache-ttl").await.unwrap().has_finalizer(Kind::Secret.finalizer()));

    h.store.apply(&secret("cache-ttl", &[("ttl", "120")])).await.unwrap();
    h.plane.clear_calls();
    settle(&h.rec, vec![ttl.id()]).await;
    let rec = h.plane.record(Kind::ApiDefinition, done.status.remote_id.as_deref().unwrap()).unwrap();
    assert_eq!(rec.payload["resources"][0]["configuration"]["timeToLiveSeconds"], "120");
    assert_eq!(h.plane.count(|c| matches!(c, Call::Update(Kind::ApiDefinition, _))), 1);

    assert!(!h.store.delete(&ttl.id()).await.unwrap(), "secret used by a resource must be guarded");
    settle(&h.rec, vec![ttl.id()]).await;
    assert!(get(&h, Kind::Secret, "cache-ttl").await.unwrap().is_being_deleted());
}
