//! Apiary management plane: the remote collaborator that owns the authoritative
//! runtime configuration of the gateway fleet.
//!
//! `ManagementApi` is the seam the synchronizer talks to. `HttpPlane` speaks the
//! management REST API; `MemoryPlane` keeps records in RAM and logs every call.

#![forbid(unsafe_code)]

mod http;
mod memory;

use std::future::Future;
use std::time::{Duration, Instant};

use apiary_core::{ApiaryError, ApiaryResult, Kind, MetadataEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub use http::{HttpPlane, PlaneAuth};
pub use memory::{Call, MemoryPlane};

/// The plane's view of one record. Fetched on demand, never cached across attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub remote_id: String,
    /// Etag-equivalent, when the plane exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub payload: Json,
}

impl RemoteRecord {
    /// Build from a plane response body carrying an `id` field.
    pub fn from_payload(payload: Json, version: Option<String>) -> ApiaryResult<Self> {
        let remote_id = payload
            .get("id")
            .and_then(Json::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiaryError::Internal("management plane response has no id".into()))?;
        Ok(Self { remote_id, version, payload })
    }
}

#[async_trait::async_trait]
pub trait ManagementApi: Send + Sync {
    fn env_id(&self) -> &str;
    fn org_id(&self) -> &str;

    async fn create(&self, kind: Kind, payload: &Json) -> ApiaryResult<RemoteRecord>;
    async fn update(&self, kind: Kind, remote_id: &str, payload: &Json) -> ApiaryResult<RemoteRecord>;
    /// `Ok(None)` when the record does not exist.
    async fn get(&self, kind: Kind, remote_id: &str) -> ApiaryResult<Option<RemoteRecord>>;
    /// `ApiaryError::NotFound` when the record does not exist.
    async fn delete(&self, kind: Kind, remote_id: &str) -> ApiaryResult<()>;

    async fn list_metadata(&self, app_id: &str) -> ApiaryResult<Vec<MetadataEntry>>;
    async fn create_metadata(&self, app_id: &str, entry: &MetadataEntry) -> ApiaryResult<MetadataEntry>;
    /// Keyed by `entry.remote_key`.
    async fn update_metadata(&self, app_id: &str, entry: &MetadataEntry) -> ApiaryResult<MetadataEntry>;
    async fn delete_metadata(&self, app_id: &str, key: &str) -> ApiaryResult<()>;
}

/// Collection segment of a kind on the plane, for kinds that own a remote record.
pub fn collection(kind: Kind) -> ApiaryResult<&'static str> {
    match kind {
        Kind::ApiDefinition => Ok("apis"),
        Kind::Application => Ok("applications"),
        other => Err(ApiaryError::Internal(format!("{} has no management plane record", other))),
    }
}

/// Run one remote call under a caller-supplied deadline. Elapsed deadlines are transient.
pub async fn with_timeout<T, F>(limit: Duration, call: &'static str, target: &str, fut: F) -> ApiaryResult<T>
where
    F: Future<Output = ApiaryResult<T>>,
{
    let t0 = Instant::now();
    metrics::counter!("remote_calls", 1u64, "call" => call);
    let res = match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(ApiaryError::timeout(call, target, limit.as_millis())),
    };
    debug!(call, on = %target, ok = res.is_ok(), took_ms = %t0.elapsed().as_millis(), "mgmt: call");
    res
}
