//! Which management plane an object synchronizes to.

use std::sync::Arc;
use std::time::Duration;

use apiary_admission::{render, SecretLookup};
use apiary_core::{ApiaryError, ApiaryResult, ContextAuth, Kind, ObjectRef, Resource, Spec};
use apiary_mgmt::{HttpPlane, ManagementApi, PlaneAuth};
use apiary_store::ObjectStore;

#[async_trait::async_trait]
pub trait PlaneProvider: Send + Sync {
    /// `Ok(None)` when the object is local-only.
    async fn plane_for(&self, obj: &Resource) -> ApiaryResult<Option<Arc<dyn ManagementApi>>>;
}

/// One plane for every object, or none at all.
pub struct StaticPlane(Option<Arc<dyn ManagementApi>>);

impl StaticPlane {
    pub fn new(plane: Arc<dyn ManagementApi>) -> Self { Self(Some(plane)) }
    pub fn none() -> Self { Self(None) }
}

#[async_trait::async_trait]
impl PlaneProvider for StaticPlane {
    async fn plane_for(&self, obj: &Resource) -> ApiaryResult<Option<Arc<dyn ManagementApi>>> {
        Ok(if obj.kind().is_remote() { self.0.clone() } else { None })
    }
}

/// Planes built from the `ManagementContext` an object references. Objects without
/// a context reference use `fallback`, if any.
pub struct ContextPlanes {
    store: Arc<dyn ObjectStore>,
    secrets: Arc<dyn SecretLookup>,
    fallback: Option<Arc<dyn ManagementApi>>,
    timeout: Duration,
}

impl ContextPlanes {
    pub fn new(store: Arc<dyn ObjectStore>, secrets: Arc<dyn SecretLookup>, timeout: Duration) -> Self {
        Self { store, secrets, fallback: None, timeout }
    }

    pub fn with_fallback(mut self, plane: Arc<dyn ManagementApi>) -> Self {
        self.fallback = Some(plane);
        self
    }

    async fn auth(&self, namespace: &str, auth: &ContextAuth) -> ApiaryResult<PlaneAuth> {
        if let Some(token) = &auth.bearer_token {
            return Ok(PlaneAuth::Bearer(token.clone()));
        }
        if let Some(c) = &auth.credentials {
            return Ok(PlaneAuth::Basic { username: c.username.clone(), password: c.password.clone() });
        }
        let sr = auth
            .secret_ref
            .as_ref()
            .ok_or_else(|| ApiaryError::Validation("management context has no auth method".into()))?;
        let ns = sr.namespace.as_deref().unwrap_or(namespace);
        let data = self
            .secrets
            .data(ns, &sr.name)
            .await?
            .ok_or_else(|| ApiaryError::Validation(format!("secret [{}/{}] not found", ns, sr.name)))?;
        if let Some(token) = data.get("bearerToken") {
            return Ok(PlaneAuth::Bearer(token.clone()));
        }
        match (data.get("username"), data.get("password")) {
            (Some(u), Some(p)) => Ok(PlaneAuth::Basic { username: u.clone(), password: p.clone() }),
            _ => Err(ApiaryError::Validation(format!(
                "secret [{}/{}] holds neither bearerToken nor username/password",
                ns, sr.name
            ))),
        }
    }
}

#[async_trait::async_trait]
impl PlaneProvider for ContextPlanes {
    async fn plane_for(&self, obj: &Resource) -> ApiaryResult<Option<Arc<dyn ManagementApi>>> {
        if !obj.kind().is_remote() {
            return Ok(None);
        }
        let Some(reference) = obj.spec.context_ref() else { return Ok(self.fallback.clone()) };
        let id = ObjectRef::new(Kind::ManagementContext, reference).resolve(&obj.meta.namespace);
        let ctx = self
            .store
            .get(&id)
            .await?
            .ok_or_else(|| ApiaryError::NotFound(format!("management context [{}] not found", id.key)))?;
        let ctx = render(&ctx, self.secrets.as_ref()).await?;
        let Spec::ManagementContext(spec) = &ctx.spec else {
            return Err(ApiaryError::Internal(format!("{} is not a management context", id)));
        };
        let auth = self.auth(&ctx.meta.namespace, &spec.auth).await?;
        let plane = HttpPlane::new(&spec.base_url, &spec.organization_id, &spec.environment_id, auth, self.timeout)?;
        Ok(Some(Arc::new(plane)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_admission::MemorySecrets;
    use apiary_core::{ApplicationSpec, ManagementContextSpec, NamespacedName};
    use apiary_mgmt::MemoryPlane;
    use apiary_store::MemoryStore;

    fn app(ctx: Option<&str>) -> Resource {
        Resource::new("default", "shop", Spec::Application(ApplicationSpec {
            name: "shop".into(),
            context_ref: ctx.map(NamespacedName::new),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn static_plane_only_serves_remote_kinds() {
        let p = StaticPlane::new(Arc::new(MemoryPlane::default()));
        assert!(p.plane_for(&app(None)).await.unwrap().is_some());
        let secret = Resource::new("default", "s", Spec::Secret(Default::default()));
        assert!(p.plane_for(&secret).await.unwrap().is_none());
        assert!(StaticPlane::none().plane_for(&app(None)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn context_plane_resolves_secret_credentials() {
        let store = Arc::new(MemoryStore::new());
        let secrets = Arc::new(MemorySecrets::new());
        secrets.insert("default", "apim-creds", [("username", "admin"), ("password", "admin")]);
        let mut spec = ManagementContextSpec {
            base_url: "http://apim:8083".into(),
            environment_id: "DEFAULT".into(),
            organization_id: "DEFAULT".into(),
            ..Default::default()
        };
        spec.auth.secret_ref = Some(NamespacedName::new("apim-creds"));
        store.apply(&Resource::new("default", "dev", Spec::ManagementContext(spec))).await.unwrap();

        let planes = ContextPlanes::new(store.clone(), secrets.clone(), Duration::from_secs(1));
        let plane = planes.plane_for(&app(Some("dev"))).await.unwrap().unwrap();
        assert_eq!(plane.env_id(), "DEFAULT");

        assert!(planes.plane_for(&app(None)).await.unwrap().is_none());
        let missing = planes.plane_for(&app(Some("prod"))).await.err().unwrap();
        assert!(missing.is_not_found());

        secrets.remove("default", "apim-creds");
        assert!(planes.plane_for(&app(Some("dev"))).await.err().unwrap().is_validation());
    }
}
