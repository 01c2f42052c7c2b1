//! Apiary admission: secret template resolution and the validator that runs
//! before a spec is persisted. Admission is all-or-nothing.

#![forbid(unsafe_code)]

mod secrets;

use std::sync::Arc;

use apiary_core::template::{self, Segment};
use apiary_core::{ApiaryError, ApiaryResult, ContextAuth, Resource, Spec};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tracing::{debug, info};

pub use secrets::{MemorySecrets, SecretLookup, StoreSecrets};

/// Evaluate one field: literal text is kept, each secret expression is substituted.
pub async fn resolve(raw: &str, namespace: &str, secrets: &dyn SecretLookup) -> ApiaryResult<String> {
    let mut out = String::with_capacity(raw.len());
    for seg in template::parse(raw)? {
        match seg {
            Segment::Literal(s) => out.push_str(s),
            Segment::Secret(p) => out.push_str(&secrets.get(namespace, &p.name, &p.key).await?),
        }
    }
    Ok(out)
}

fn substitute(value: &mut Json, resolved: &FxHashMap<String, String>) {
    match value {
        Json::String(s) => {
            if let Some(v) = resolved.get(s.as_str()) { *s = v.clone(); }
        }
        Json::Array(items) => items.iter_mut().for_each(|v| substitute(v, resolved)),
        Json::Object(map) => map.values_mut().for_each(|v| substitute(v, resolved)),
        _ => {}
    }
}

/// Copy of `obj` with every templated field replaced by its resolved value.
/// The stored object keeps its templates.
pub async fn render(obj: &Resource, secrets: &dyn SecretLookup) -> ApiaryResult<Resource> {
    let mut value = obj.spec.to_value()?;
    let fields = template::templated_fields(&value);
    if fields.is_empty() {
        return Ok(obj.clone());
    }
    let mut resolved: FxHashMap<String, String> = FxHashMap::default();
    for (_, raw) in fields {
        if resolved.contains_key(&raw) { continue; }
        let v = resolve(&raw, &obj.meta.namespace, secrets).await?;
        resolved.insert(raw, v);
    }
    substitute(&mut value, &resolved);
    let mut out = obj.clone();
    out.spec = Spec::from_value(obj.kind(), value)?;
    Ok(out)
}

fn check_auth(auth: &ContextAuth) -> ApiaryResult<()> {
    let methods = [auth.bearer_token.is_some(), auth.credentials.is_some(), auth.secret_ref.is_some()];
    match methods.iter().filter(|m| **m).count() {
        1 => Ok(()),
        0 => Err(ApiaryError::Validation("management context needs one auth method".into())),
        _ => Err(ApiaryError::Validation("management context auth methods are mutually exclusive".into())),
    }
}

/// Structural checks that do not need any collaborator.
pub fn check_structure(obj: &Resource) -> ApiaryResult<()> {
    match &obj.spec {
        Spec::Application(app) => {
            let mut seen = FxHashSet::default();
            for m in app.metadata.iter().flatten() {
                if !seen.insert(m.name.as_str()) {
                    return Err(ApiaryError::Validation(format!("duplicate metadata name [{}]", m.name)));
                }
            }
            Ok(())
        }
        Spec::ManagementContext(ctx) => {
            if ctx.base_url.trim().is_empty() {
                return Err(ApiaryError::Validation("management context base URL is empty".into()));
            }
            check_auth(&ctx.auth)
        }
        _ => Ok(()),
    }
}

/// Gate run on create and update, strictly before persistence.
pub struct AdmissionValidator {
    secrets: Arc<dyn SecretLookup>,
}

impl AdmissionValidator {
    pub fn new(secrets: Arc<dyn SecretLookup>) -> Self { Self { secrets } }

    /// Resolve every templated field; the first failure rejects the whole object.
    pub async fn validate(&self, obj: &Resource) -> ApiaryResult<()> {
        let res = self.check(obj).await;
        match &res {
            Ok(()) => debug!(id = %obj.id(), "admission: admitted"),
            Err(e) => {
                metrics::counter!("admission_rejected", 1u64);
                info!(id = %obj.id(), error = %e, "admission: rejected");
            }
        }
        res
    }

    async fn check(&self, obj: &Resource) -> ApiaryResult<()> {
        check_structure(obj)?;
        let value = obj.spec.to_value()?;
        for (path, raw) in template::templated_fields(&value) {
            if let Err(e) = resolve(&raw, &obj.meta.namespace, self.secrets.as_ref()).await {
                debug!(id = %obj.id(), field = %path, "admission: template failed");
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn validate_create(&self, obj: &Resource) -> ApiaryResult<()> { self.validate(obj).await }

    pub async fn validate_update(&self, _old: &Resource, new: &Resource) -> ApiaryResult<()> { self.validate(new).await }

    /// Deletion safety belongs to the deletion guard.
    pub async fn validate_delete(&self, _obj: &Resource) -> ApiaryResult<()> { Ok(()) }

    pub async fn render(&self, obj: &Resource) -> ApiaryResult<Resource> { render(obj, self.secrets.as_ref()).await }

    pub fn secrets(&self) -> &Arc<dyn SecretLookup> { &self.secrets }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::{ApiDefinitionSpec, ApplicationSpec, ManagementContextSpec, MetadataEntry, Plan};

    fn secrets() -> Arc<MemorySecrets> {
        let s = MemorySecrets::new();
        s.insert("default", "plans", [("security", "KEY_LESS"), ("def", "{\"a\":1}")]);
        Arc::new(s)
    }

    fn api_with_security(security: &str) -> Resource {
        let spec = ApiDefinitionSpec {
            name: "orders".into(),
            plans: vec![Plan { name: "free".into(), security: security.into(), security_definition: None }],
            ..Default::default()
        };
        Resource::new("default", "orders", Spec::ApiDefinition(spec))
    }

    #[tokio::test]
    async fn plain_specs_always_validate() {
        let v = AdmissionValidator::new(Arc::new(MemorySecrets::new()));
        assert!(v.validate(&api_with_security("KEY_LESS")).await.is_ok());
    }

    #[tokio::test]
    async fn missing_secret_names_the_path() {
        let v = AdmissionValidator::new(secrets());
        let err = v.validate(&api_with_security("[[ secret `missing-secret/security` ]]")).await.unwrap_err();
        assert_eq!(err, ApiaryError::Validation("secret [default/missing-secret] not found".into()));
        let err = v.validate(&api_with_security("[[ secret `plans/nope` ]]")).await.unwrap_err();
        assert_eq!(err, ApiaryError::Validation("key [nope] not found in secret [default/plans]".into()));
    }

    #[tokio::test]
    async fn render_substitutes_and_keeps_literals() {
        let s = secrets();
        let obj = api_with_security("[[secret `plans/security`]]");
        let out = render(&obj, s.as_ref()).await.unwrap();
        match &out.spec {
            Spec::ApiDefinition(a) => assert_eq!(a.plans[0].security, "KEY_LESS"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(resolve("x-[[ secret `plans/security` ]]-y", "default", s.as_ref()).await.unwrap(), "x-KEY_LESS-y");
    }

    #[tokio::test]
    async fn duplicate_metadata_names_are_rejected() {
        let v = AdmissionValidator::new(secrets());
        let app = ApplicationSpec {
            name: "shop".into(),
            metadata: Some(vec![MetadataEntry::new("owner", "a"), MetadataEntry::new("owner", "b")]),
            ..Default::default()
        };
        let err = v.validate(&Resource::new("default", "shop", Spec::Application(app))).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn context_needs_exactly_one_auth_method() {
        let v = AdmissionValidator::new(secrets());
        let mut ctx = ManagementContextSpec { base_url: "http://apim".into(), ..Default::default() };
        let obj = |c: &ManagementContextSpec| Resource::new("default", "dev", Spec::ManagementContext(c.clone()));
        assert!(v.validate(&obj(&ctx)).await.is_err());
        ctx.auth.bearer_token = Some("t".into());
        assert!(v.validate(&obj(&ctx)).await.is_ok());
        ctx.auth.secret_ref = Some(apiary_core::NamespacedName::new("creds"));
        assert!(v.validate(&obj(&ctx)).await.is_err());
    }

    #[tokio::test]
    async fn delete_is_always_admitted() {
        let v = AdmissionValidator::new(Arc::new(MemorySecrets::new()));
        assert!(v.validate_delete(&api_with_security("[[ secret `gone/x` ]]")).await.is_ok());
    }
}
