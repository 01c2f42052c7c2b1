use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use apiary_core::{ApiaryError, ApiaryResult, Kind, MetadataEntry};
use serde_json::Value as Json;

use crate::{collection, ManagementApi, RemoteRecord};

/// One call received by a `MemoryPlane`, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(Kind),
    Update(Kind, String),
    Get(Kind, String),
    Delete(Kind, String),
    ListMetadata(String),
    /// App id and entry name.
    CreateMetadata(String, String),
    /// App id and remote key.
    UpdateMetadata(String, String),
    DeleteMetadata(String, String),
}

impl Call {
    pub fn is_write(&self) -> bool { !matches!(self, Call::Get(..) | Call::ListMetadata(_)) }
}

#[derive(Default)]
struct PlaneState {
    records: BTreeMap<(Kind, String), RemoteRecord>,
    metadata: BTreeMap<String, Vec<MetadataEntry>>,
    calls: Vec<Call>,
    failures: VecDeque<ApiaryError>,
    seq: u64,
}

/// In-RAM management plane with a call log and one-shot fault injection.
pub struct MemoryPlane {
    env: String,
    org: String,
    state: Mutex<PlaneState>,
}

impl Default for MemoryPlane {
    fn default() -> Self { Self::new("DEFAULT", "DEFAULT") }
}

impl MemoryPlane {
    pub fn new(env: &str, org: &str) -> Self {
        Self { env: env.to_string(), org: org.to_string(), state: Mutex::new(PlaneState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, PlaneState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Log the call, then surface an injected failure if one is queued.
    fn enter(&self, call: Call) -> ApiaryResult<MutexGuard<'_, PlaneState>> {
        let mut st = self.state();
        st.calls.push(call);
        match st.failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(st),
        }
    }

    /// The next call fails with `err` (after being logged).
    pub fn fail_next(&self, err: ApiaryError) { self.state().failures.push_back(err); }

    pub fn calls(&self) -> Vec<Call> { self.state().calls.clone() }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize { self.state().calls.iter().filter(|c| pred(c)).count() }

    pub fn clear_calls(&self) { self.state().calls.clear(); }

    pub fn record(&self, kind: Kind, remote_id: &str) -> Option<RemoteRecord> {
        self.state().records.get(&(kind, remote_id.to_string())).cloned()
    }

    pub fn records(&self, kind: Kind) -> Vec<RemoteRecord> {
        self.state().records.iter().filter(|((k, _), _)| *k == kind).map(|(_, r)| r.clone()).collect()
    }

    pub fn metadata(&self, app_id: &str) -> Vec<MetadataEntry> {
        self.state().metadata.get(app_id).cloned().unwrap_or_default()
    }

    /// Out-of-band removal, as done by an operator on the plane itself.
    pub fn forget(&self, kind: Kind, remote_id: &str) -> bool {
        self.state().records.remove(&(kind, remote_id.to_string())).is_some()
    }

}

fn not_found(what: String) -> ApiaryError { ApiaryError::NotFound(what) }

fn bump(version: &Option<String>) -> Option<String> {
    let n: u64 = version.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);
    Some((n + 1).to_string())
}

#[async_trait::async_trait]
impl ManagementApi for MemoryPlane {
    fn env_id(&self) -> &str { &self.env }
    fn org_id(&self) -> &str { &self.org }

    async fn create(&self, kind: Kind, payload: &Json) -> ApiaryResult<RemoteRecord> {
        let prefix = collection(kind)?;
        let mut st = self.enter(Call::Create(kind))?;
        st.seq += 1;
        let remote_id = format!("{}-{}", prefix.trim_end_matches('s'), st.seq);
        let mut body = payload.clone();
        if let Some(obj) = body.as_object_mut() { obj.insert("id".into(), Json::String(remote_id.clone())); }
        let record = RemoteRecord { remote_id: remote_id.clone(), version: Some("1".into()), payload: body };
        st.records.insert((kind, remote_id), record.clone());
        Ok(record)
    }

    async fn update(&self, kind: Kind, remote_id: &str, payload: &Json) -> ApiaryResult<RemoteRecord> {
        let mut st = self.enter(Call::Update(kind, remote_id.to_string()))?;
        let cur = st
            .records
            .get_mut(&(kind, remote_id.to_string()))
            .ok_or_else(|| not_found(format!("{} {}", kind, remote_id)))?;
        let mut body = payload.clone();
        if let Some(obj) = body.as_object_mut() { obj.insert("id".into(), Json::String(remote_id.to_string())); }
        cur.version = bump(&cur.version);
        cur.payload = body;
        Ok(cur.clone())
    }

    async fn get(&self, kind: Kind, remote_id: &str) -> ApiaryResult<Option<RemoteRecord>> {
        let st = self.enter(Call::Get(kind, remote_id.to_string()))?;
        Ok(st.records.get(&(kind, remote_id.to_string())).cloned())
    }

    async fn delete(&self, kind: Kind, remote_id: &str) -> ApiaryResult<()> {
        let mut st = self.enter(Call::Delete(kind, remote_id.to_string()))?;
        st.records
            .remove(&(kind, remote_id.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(format!("{} {}", kind, remote_id)))?;
        st.metadata.remove(remote_id);
        Ok(())
    }

    async fn list_metadata(&self, app_id: &str) -> ApiaryResult<Vec<MetadataEntry>> {
        let st = self.enter(Call::ListMetadata(app_id.to_string()))?;
        Ok(st.metadata.get(app_id).cloned().unwrap_or_default())
    }

    async fn create_metadata(&self, app_id: &str, entry: &MetadataEntry) -> ApiaryResult<MetadataEntry> {
        let mut st = self.enter(Call::CreateMetadata(app_id.to_string(), entry.name.clone()))?;
        if !st.records.contains_key(&(Kind::Application, app_id.to_string())) {
            return Err(not_found(format!("Application {}", app_id)));
        }
        st.seq += 1;
        let created = MetadataEntry { remote_key: Some(format!("md-{}", st.seq)), ..entry.clone() };
        st.metadata.entry(app_id.to_string()).or_default().push(created.clone());
        Ok(created)
    }

    async fn update_metadata(&self, app_id: &str, entry: &MetadataEntry) -> ApiaryResult<MetadataEntry> {
        let key = entry.remote_key.clone().unwrap_or_default();
        let mut st = self.enter(Call::UpdateMetadata(app_id.to_string(), key.clone()))?;
        let slot = st
            .metadata
            .get_mut(app_id)
            .and_then(|list| list.iter_mut().find(|m| m.remote_key.as_deref() == Some(key.as_str())))
            .ok_or_else(|| not_found(format!("Application {} metadata {}", app_id, key)))?;
        *slot = entry.clone();
        Ok(slot.clone())
    }

    async fn delete_metadata(&self, app_id: &str, key: &str) -> ApiaryResult<()> {
        let mut st = self.enter(Call::DeleteMetadata(app_id.to_string(), key.to_string()))?;
        let list = st.metadata.get_mut(app_id).ok_or_else(|| not_found(format!("Application {}", app_id)))?;
        let before = list.len();
        list.retain(|m| m.remote_key.as_deref() != Some(key));
        if list.len() == before {
            return Err(not_found(format!("Application {} metadata {}", app_id, key)));
        }
        Ok(())
    }
}
