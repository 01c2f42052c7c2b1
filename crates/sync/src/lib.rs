//! Apiary remote synchronizer: maps one declared object onto create/update/delete
//! calls against the management plane.
//!
//! The verb is chosen from the remote id recorded in status: no id (or an id the
//! plane no longer knows) means create, otherwise update. Errors are scoped to the
//! local identity and returned as-is; retry cadence belongs to the caller.

#![forbid(unsafe_code)]

pub mod metadata;

use std::collections::BTreeSet;
use std::time::Duration;

use apiary_core::{ApiaryError, ApiaryResult, ApplicationSpec, Kind, MetadataEntry, ResultExt};
use apiary_mgmt::{with_timeout, ManagementApi, RemoteRecord};
use serde_json::Value as Json;
use tracing::{debug, info};

pub use metadata::{plan_metadata, summarize, DiffSummary, MetadataOp};

pub const ORIGIN: &str = "KUBERNETES";

/// Payload fields that keep the remote value when the desired payload omits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarryForward(BTreeSet<String>);

impl Default for CarryForward {
    fn default() -> Self { Self::parse("settings") }
}

impl CarryForward {
    /// Comma-separated top-level field names.
    pub fn parse(list: &str) -> Self {
        Self(list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> { self.0.iter().map(String::as_str) }

    /// Copy omitted fields from the remote payload into `desired`.
    pub fn apply(&self, desired: &mut Json, remote: &Json) -> usize {
        let Some(obj) = desired.as_object_mut() else { return 0 };
        let mut carried = 0;
        for field in self.0.iter() {
            let omitted = obj.get(field).map(Json::is_null).unwrap_or(true);
            match remote.get(field) {
                Some(v) if omitted && !v.is_null() => {
                    obj.insert(field.clone(), v.clone());
                    carried += 1;
                }
                _ => {}
            }
        }
        carried
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub remote_id: String,
    pub verb: Verb,
    pub env_id: String,
    pub org_id: String,
    pub record: RemoteRecord,
}

/// Application payload as shipped: local-only fields removed, metadata synced separately.
pub fn application_payload(spec: &ApplicationSpec) -> ApiaryResult<Json> {
    let mut v = serde_json::to_value(spec).map_err(|e| ApiaryError::Internal(e.to_string()))?;
    if let Some(obj) = v.as_object_mut() {
        obj.remove("contextRef");
        obj.remove("metadata");
        obj.insert("origin".into(), Json::String(ORIGIN.to_string()));
    }
    Ok(v)
}

#[derive(Debug, Clone)]
pub struct Synchronizer {
    carry: CarryForward,
    timeout: Duration,
    skip_unchanged: bool,
}

impl Default for Synchronizer {
    fn default() -> Self { Self::new(CarryForward::default(), Duration::from_secs(10)) }
}

impl Synchronizer {
    pub fn new(carry: CarryForward, timeout: Duration) -> Self { Self { carry, timeout, skip_unchanged: false } }

    /// Skip metadata updates whose remote content already matches.
    pub fn skip_unchanged_metadata(mut self, on: bool) -> Self {
        self.skip_unchanged = on;
        self
    }

    pub fn timeout(&self) -> Duration { self.timeout }

    /// Create or update the remote record for `scope` (the local identity).
    pub async fn synchronize(
        &self,
        plane: &dyn ManagementApi,
        kind: Kind,
        scope: &str,
        previous_id: Option<&str>,
        payload: &Json,
    ) -> ApiaryResult<SyncOutcome> {
        self.upsert(plane, kind, previous_id, payload).await.map_err(|e| e.scoped(scope))
    }

    async fn upsert(
        &self,
        plane: &dyn ManagementApi,
        kind: Kind,
        previous_id: Option<&str>,
        payload: &Json,
    ) -> ApiaryResult<SyncOutcome> {
        let existing = match previous_id {
            Some(id) => {
                let target = format!("{} {}", kind, id);
                with_timeout(self.timeout, "get", &target, plane.get(kind, id)).await?
            }
            None => None,
        };
        let (record, verb) = match existing {
            Some(current) => {
                let mut desired = payload.clone();
                let carried = self.carry.apply(&mut desired, &current.payload);
                let target = format!("{} {}", kind, current.remote_id);
                debug!(kind = %kind, remote_id = %current.remote_id, carried, "sync: update");
                let rec = with_timeout(self.timeout, "update", &target, plane.update(kind, &current.remote_id, &desired)).await?;
                (rec, Verb::Updated)
            }
            None => {
                if let Some(id) = previous_id {
                    info!(kind = %kind, remote_id = %id, "sync: recorded remote id is gone; creating");
                }
                let rec = with_timeout(self.timeout, "create", kind.as_str(), plane.create(kind, payload)).await?;
                (rec, Verb::Created)
            }
        };
        info!(kind = %kind, remote_id = %record.remote_id, verb = ?verb, "sync: upserted");
        Ok(SyncOutcome {
            remote_id: record.remote_id.clone(),
            verb,
            env_id: plane.env_id().to_string(),
            org_id: plane.org_id().to_string(),
            record,
        })
    }

    /// Bring the remote metadata of `app_id` to `desired`. Entries that vanish
    /// concurrently before their delete count as removed.
    pub async fn reconcile_metadata(
        &self,
        plane: &dyn ManagementApi,
        app_id: &str,
        desired: &[MetadataEntry],
    ) -> ApiaryResult<DiffSummary> {
        let target = format!("Application {}", app_id);
        let actual = with_timeout(self.timeout, "list_metadata", &target, plane.list_metadata(app_id)).await?;
        let ops = plan_metadata(desired, &actual, self.skip_unchanged);
        for op in ops.iter() {
            match op {
                MetadataOp::Create(m) => {
                    with_timeout(self.timeout, "create_metadata", &target, plane.create_metadata(app_id, m)).await?;
                }
                MetadataOp::Update(m) => {
                    with_timeout(self.timeout, "update_metadata", &target, plane.update_metadata(app_id, m)).await?;
                }
                MetadataOp::Delete { name, key } => {
                    let gone = with_timeout(self.timeout, "delete_metadata", &target, plane.delete_metadata(app_id, key))
                        .await
                        .ignore_not_found()?;
                    if gone.is_none() { debug!(app_id, name = %name, "sync: metadata already removed"); }
                }
            }
        }
        let summary = summarize(&ops);
        metrics::counter!("metadata_ops", (summary.adds + summary.updates + summary.removes) as u64);
        debug!(app_id, adds = summary.adds, updates = summary.updates, removes = summary.removes, "sync: metadata");
        Ok(summary)
    }

    /// Remove the remote record. Returns false when it was already gone.
    pub async fn teardown(&self, plane: &dyn ManagementApi, kind: Kind, scope: &str, remote_id: &str) -> ApiaryResult<bool> {
        let target = format!("{} {}", kind, remote_id);
        let res = with_timeout(self.timeout, "delete", &target, plane.delete(kind, remote_id))
            .await
            .ignore_not_found()
            .map_err(|e| e.scoped(scope))?;
        info!(kind = %kind, remote_id, existed = res.is_some(), "sync: teardown");
        Ok(res.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn carry_forward_only_fills_omitted_fields() {
        let carry = CarryForward::default();
        let mut desired = json!({ "name": "shop" });
        assert_eq!(carry.apply(&mut desired, &json!({ "name": "old", "settings": { "app": { "type": "web" } } })), 1);
        assert_eq!(desired["settings"]["app"]["type"], "web");
        assert_eq!(desired["name"], "shop");

        let mut explicit = json!({ "settings": { "app": { "type": "native" } } });
        carry.apply(&mut explicit, &json!({ "settings": { "app": { "type": "web" } } }));
        assert_eq!(explicit["settings"]["app"]["type"], "native");
    }

    #[test]
    fn carry_forward_set_is_configurable() {
        let carry = CarryForward::parse(" settings , description,");
        assert_eq!(carry.fields().collect::<Vec<_>>(), vec!["description", "settings"]);
        let mut desired = json!({});
        assert_eq!(CarryForward::parse("").apply(&mut desired, &json!({ "settings": {} })), 0);
    }

    #[test]
    fn application_payload_marks_origin_and_drops_local_fields() {
        let spec = ApplicationSpec {
            name: "shop".into(),
            context_ref: Some(apiary_core::NamespacedName::new("dev")),
            metadata: Some(vec![MetadataEntry::new("owner", "a")]),
            ..Default::default()
        };
        let v = application_payload(&spec).unwrap();
        assert_eq!(v["origin"], ORIGIN);
        assert!(v.get("contextRef").is_none());
        assert!(v.get("metadata").is_none());
    }
}
