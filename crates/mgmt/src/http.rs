use std::time::Duration;

use apiary_core::{ApiaryError, ApiaryResult, Kind, MetadataEntry, RemoteFailure};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde_json::Value as Json;
use tracing::debug;

use crate::{collection, ManagementApi, RemoteRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaneAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

/// Management REST client scoped to one organization and environment.
#[derive(Clone)]
pub struct HttpPlane {
    client: Client,
    base: String,
    org: String,
    env: String,
    auth: PlaneAuth,
}

impl HttpPlane {
    pub fn new(base: &str, org: &str, env: &str, auth: PlaneAuth, timeout: Duration) -> ApiaryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiaryError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            org: org.to_string(),
            env: env.to_string(),
            auth,
        })
    }

    pub fn base(&self) -> &str { &self.base }

    fn url(&self, tail: &str) -> String {
        format!("{}/management/organizations/{}/environments/{}/{}", self.base, self.org, self.env, tail)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            PlaneAuth::Bearer(token) => req.bearer_auth(token),
            PlaneAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
        }
    }

    /// Send and classify. `Ok(None)` means 404.
    async fn send(&self, call: &'static str, target: &str, req: RequestBuilder) -> ApiaryResult<Option<Response>> {
        let res = self.authed(req).send().await.map_err(|e| transport_error(call, target, e))?;
        let status = res.status();
        debug!(call, on = %target, status = status.as_u16(), "mgmt: http");
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let msg = if body.is_empty() { status.to_string() } else { format!("{} {}", status, body) };
            return Err(ApiaryError::from_status(status.as_u16(), call, target, msg));
        }
        Ok(Some(res))
    }

    async fn send_required(&self, call: &'static str, target: &str, req: RequestBuilder) -> ApiaryResult<Response> {
        self.send(call, target, req)
            .await?
            .ok_or_else(|| ApiaryError::NotFound(RemoteFailure::new(call, target, "404 Not Found").to_string()))
    }

    async fn record(call: &'static str, target: &str, res: Response) -> ApiaryResult<RemoteRecord> {
        let version = res.headers().get(header::ETAG).and_then(|v| v.to_str().ok()).map(str::to_string);
        let body: Json = res.json().await.map_err(|e| transport_error(call, target, e))?;
        RemoteRecord::from_payload(body, version)
    }

    async fn entry(call: &'static str, target: &str, res: Response) -> ApiaryResult<MetadataEntry> {
        res.json().await.map_err(|e| transport_error(call, target, e))
    }
}

fn transport_error(call: &str, target: &str, e: reqwest::Error) -> ApiaryError {
    let failure = RemoteFailure::new(call, target, e.to_string());
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ApiaryError::Transient(failure)
    } else if e.is_decode() {
        ApiaryError::Internal(failure.to_string())
    } else {
        ApiaryError::Fatal(failure)
    }
}

#[async_trait::async_trait]
impl ManagementApi for HttpPlane {
    fn env_id(&self) -> &str { &self.env }
    fn org_id(&self) -> &str { &self.org }

    async fn create(&self, kind: Kind, payload: &Json) -> ApiaryResult<RemoteRecord> {
        let target = kind.as_str();
        let req = self.client.post(self.url(collection(kind)?)).json(payload);
        let res = self.send_required("create", target, req).await?;
        Self::record("create", target, res).await
    }

    async fn update(&self, kind: Kind, remote_id: &str, payload: &Json) -> ApiaryResult<RemoteRecord> {
        let target = format!("{} {}", kind, remote_id);
        let req = self.client.put(self.url(&format!("{}/{}", collection(kind)?, remote_id))).json(payload);
        let res = self.send_required("update", &target, req).await?;
        Self::record("update", &target, res).await
    }

    async fn get(&self, kind: Kind, remote_id: &str) -> ApiaryResult<Option<RemoteRecord>> {
        let target = format!("{} {}", kind, remote_id);
        let req = self.client.get(self.url(&format!("{}/{}", collection(kind)?, remote_id)));
        match self.send("get", &target, req).await? {
            Some(res) => Ok(Some(Self::record("get", &target, res).await?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, kind: Kind, remote_id: &str) -> ApiaryResult<()> {
        let target = format!("{} {}", kind, remote_id);
        let req = self.client.delete(self.url(&format!("{}/{}", collection(kind)?, remote_id)));
        self.send_required("delete", &target, req).await.map(|_| ())
    }

    async fn list_metadata(&self, app_id: &str) -> ApiaryResult<Vec<MetadataEntry>> {
        let target = format!("Application {}", app_id);
        let req = self.client.get(self.url(&format!("applications/{}/metadata", app_id)));
        let res = self.send_required("list_metadata", &target, req).await?;
        res.json().await.map_err(|e| transport_error("list_metadata", &target, e))
    }

    async fn create_metadata(&self, app_id: &str, entry: &MetadataEntry) -> ApiaryResult<MetadataEntry> {
        let target = format!("Application {} metadata {}", app_id, entry.name);
        let req = self.client.post(self.url(&format!("applications/{}/metadata", app_id))).json(entry);
        let res = self.send_required("create_metadata", &target, req).await?;
        Self::entry("create_metadata", &target, res).await
    }

    async fn update_metadata(&self, app_id: &str, entry: &MetadataEntry) -> ApiaryResult<MetadataEntry> {
        let target = format!("Application {} metadata {}", app_id, entry.name);
        let key = entry
            .remote_key
            .as_deref()
            .ok_or_else(|| ApiaryError::Internal(format!("{}: metadata update without a remote key", target)))?;
        let req = self.client.put(self.url(&format!("applications/{}/metadata/{}", app_id, key))).json(entry);
        let res = self.send_required("update_metadata", &target, req).await?;
        Self::entry("update_metadata", &target, res).await
    }

    async fn delete_metadata(&self, app_id: &str, key: &str) -> ApiaryResult<()> {
        let target = format!("Application {} metadata {}", app_id, key);
        let req = self.client.delete(self.url(&format!("applications/{}/metadata/{}", app_id, key)));
        self.send_required("delete_metadata", &target, req).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_scoped_to_org_and_env() {
        let p = HttpPlane::new("https://apim.local/", "DEFAULT", "dev", PlaneAuth::Bearer("t".into()), Duration::from_secs(1)).unwrap();
        assert_eq!(p.url("apis/42"), "https://apim.local/management/organizations/DEFAULT/environments/dev/apis/42");
        assert_eq!(p.env_id(), "dev");
        assert_eq!(p.org_id(), "DEFAULT");
    }
}
