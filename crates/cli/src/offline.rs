//! Manifest-file commands that need no cluster: admission checks and a dry
//! reconcile against an in-memory management plane.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use apiary_admission::{AdmissionValidator, MemorySecrets, StoreSecrets};
use apiary_core::{manifest, Delta, Kind, MetadataEntry, Phase, Resource, Spec};
use apiary_mgmt::MemoryPlane;
use apiary_reconcile::{build, Runner, Settings, StaticPlane};
use apiary_store::{MemoryStore, ObjectStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Every non-empty document of a multi-document YAML (or JSON) text.
pub fn parse_documents(text: &str) -> Result<Vec<Json>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let v = Json::deserialize(doc).context("parsing manifest document")?;
        if !v.is_null() { out.push(v); }
    }
    Ok(out)
}

pub fn load(text: &str, namespace: &str) -> Result<Vec<Resource>> {
    let docs = parse_documents(text)?;
    Ok(manifest::from_documents(&docs, namespace)?)
}

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Admission checks for every non-secret object. Secrets in the same file are the
/// only secrets visible to templates.
pub async fn validate(objs: &[Resource]) -> Vec<Verdict> {
    let secrets = Arc::new(MemorySecrets::new());
    for o in objs {
        if let Spec::Secret(s) = &o.spec {
            secrets.insert(&o.meta.namespace, &o.meta.name, s.data.clone());
        }
    }
    let admission = AdmissionValidator::new(secrets);
    let mut out = Vec::new();
    for o in objs.iter().filter(|o| o.kind() != Kind::Secret) {
        let error = admission.validate_create(o).await.err().map(|e| e.to_string());
        out.push(Verdict { kind: o.kind(), namespace: o.meta.namespace.clone(), name: o.meta.name.clone(), error });
    }
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Materialized {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Json>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<MetadataEntry>,
}

/// Reconcile `objs` to idle against a fresh in-memory plane and report what each
/// remote kind would have shipped. Gives up after `deadline`.
pub async fn materialize(objs: Vec<Resource>, deadline: Duration) -> Result<Vec<Materialized>> {
    let store = Arc::new(MemoryStore::new());
    let plane = Arc::new(MemoryPlane::default());
    let settings = Settings { resync: None, requeue: Duration::from_millis(200), ..Settings::from_env() };
    let (tx, rx) = mpsc::channel(objs.len().max(1));
    for o in &objs {
        let stored = store.apply(o).await?;
        tx.send(Delta::applied(&stored)).await.context("queueing object")?;
    }
    drop(tx);

    let secrets = Arc::new(StoreSecrets::new(store.clone()));
    let rec = build(store.clone(), Arc::new(StaticPlane::new(plane.clone())), secrets, &settings).await?;
    let stats = Runner::new(rec, &settings).run(rx, tokio::time::sleep(deadline)).await;
    info!(attempts = stats.attempts, errors = stats.errors, "materialize: settled");
    if stats.requeues > 0 {
        warn!(requeues = stats.requeues, "materialize: some objects were still retrying");
    }

    let mut out = Vec::new();
    for kind in [Kind::ApiDefinition, Kind::Application] {
        for o in store.list(kind).await? {
            let remote_id = o.status.remote_id.clone();
            let payload = remote_id.as_deref().and_then(|id| plane.record(kind, id)).map(|r| r.payload);
            let metadata = match (kind, remote_id.as_deref()) {
                (Kind::Application, Some(id)) => plane.metadata(id),
                _ => Vec::new(),
            };
            out.push(Materialized {
                kind,
                namespace: o.meta.namespace.clone(),
                name: o.meta.name.clone(),
                phase: o.status.phase,
                message: o.status.message.clone(),
                payload,
                metadata,
            });
        }
    }
    Ok(out)
}
