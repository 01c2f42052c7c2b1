//! Pure conversions between API server objects and the internal resource model.

use apiary_core::{manifest, ApiaryError, ApiaryResult, Kind, RemoteFailure, Resource, ResourceId};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::core::DynamicObject;
use serde_json::{json, Map, Value as Json};

fn internal(e: impl std::fmt::Display) -> ApiaryError { ApiaryError::Internal(e.to_string()) }

/// Manifest for `obj` with `kind` pinned (list items may omit it), managed fields
/// dropped and, for secrets, `data` decoded into `stringData`.
pub fn document(kind: Kind, obj: &DynamicObject) -> ApiaryResult<Json> {
    let mut doc = serde_json::to_value(obj).map_err(internal)?;
    let map = doc.as_object_mut().ok_or_else(|| internal("object did not serialize to a map"))?;
    map.insert("kind".into(), Json::String(kind.as_str().to_string()));
    if let Some(md) = map.get_mut("metadata").and_then(Json::as_object_mut) {
        md.remove("managedFields");
    }
    if kind == Kind::Secret {
        decode_secret_data(map)?;
    }
    Ok(doc)
}

fn decode_secret_data(map: &mut Map<String, Json>) -> ApiaryResult<()> {
    let mut plain = match map.remove("stringData") {
        Some(Json::Object(m)) => m,
        _ => Map::new(),
    };
    if let Some(Json::Object(data)) = map.remove("data") {
        for (key, value) in data {
            let Some(encoded) = value.as_str() else { continue };
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|e| ApiaryError::Validation(format!("secret key [{}] is not base64: {}", key, e)))?;
            let text = String::from_utf8(bytes)
                .map_err(|_| ApiaryError::Validation(format!("secret key [{}] is not utf-8", key)))?;
            plain.entry(key).or_insert(Json::String(text));
        }
    }
    map.insert("stringData".into(), Json::Object(plain));
    Ok(())
}

pub fn decode(kind: Kind, obj: &DynamicObject) -> ApiaryResult<Resource> {
    manifest::from_manifest(&document(kind, obj)?, "default")
}

pub fn identity(kind: Kind, obj: &DynamicObject) -> Option<ResourceId> {
    let name = obj.metadata.name.clone()?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    Some(ResourceId::new(kind, namespace, name))
}

/// Merge patch writing the status under the object's version token.
pub fn status_patch(obj: &Resource) -> ApiaryResult<Json> {
    let status = serde_json::to_value(&obj.status).map_err(internal)?;
    Ok(json!({ "metadata": { "resourceVersion": obj.meta.resource_version }, "status": status }))
}

/// Merge patch replacing the finalizer list under the object's version token.
pub fn finalizer_patch(obj: &Resource) -> Json {
    json!({ "metadata": { "resourceVersion": obj.meta.resource_version, "finalizers": obj.meta.finalizers } })
}

/// Map an API server failure onto the shared taxonomy. A 409 is a version token
/// mismatch; transport failures are transient.
pub fn map_error(err: kube::Error, call: &str, id: &ResourceId) -> ApiaryError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => ApiaryError::Conflict(format!("{}: {}", id, ae.message)),
        kube::Error::Api(ae) if ae.code == 404 => ApiaryError::NotFound(format!("{}: {}", id, ae.message)),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => ApiaryError::Validation(ae.message),
        kube::Error::Api(ae) => ApiaryError::from_status(ae.code, call, &id.to_string(), ae.message),
        other => ApiaryError::Transient(RemoteFailure::new(call, id.to_string(), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::{Phase, Spec};
    use kube::error::ErrorResponse;

    fn dynamic(v: Json) -> DynamicObject { serde_json::from_value(v).unwrap() }

    #[test]
    fn secret_data_is_decoded_and_string_data_wins() {
        let obj = dynamic(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "plans", "namespace": "shop", "resourceVersion": "7" },
            "data": { "security": "S0VZX0xFU1M=", "token": "b2xk" },
            "stringData": { "token": "new" }
        }));
        let r = decode(Kind::Secret, &obj).unwrap();
        let Spec::Secret(s) = &r.spec else { panic!("not a secret") };
        assert_eq!(s.data.get("security").map(String::as_str), Some("KEY_LESS"));
        assert_eq!(s.data.get("token").map(String::as_str), Some("new"));
        assert_eq!(r.meta.resource_version, "7");
        assert_eq!(r.id(), ResourceId::new(Kind::Secret, "shop", "plans"));
    }

    #[test]
    fn bad_secret_encoding_is_a_validation_error() {
        let obj = dynamic(json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "s" }, "data": { "k": "%%%" } }));
        assert!(decode(Kind::Secret, &obj).unwrap_err().is_validation());
    }

    #[test]
    fn custom_resource_keeps_status_and_deletion_marker() {
        let obj = dynamic(json!({
            "apiVersion": "apiary.dev/v1alpha1",
            "kind": "Application",
            "metadata": {
                "name": "shop",
                "generation": 3,
                "deletionTimestamp": "2026-01-01T00:00:00Z",
                "finalizers": ["apiary.dev/application"],
                "managedFields": [{ "manager": "kubectl" }]
            },
            "spec": { "name": "shop" },
            "status": { "observedGeneration": 2, "phase": "Completed", "remoteId": "app-1" }
        }));
        let doc = document(Kind::Application, &obj).unwrap();
        assert!(doc["metadata"].get("managedFields").is_none());
        let r = decode(Kind::Application, &obj).unwrap();
        assert_eq!(r.meta.namespace, "default");
        assert_eq!(r.meta.generation, 3);
        assert!(r.is_being_deleted());
        assert_eq!(r.meta.finalizers, vec!["apiary.dev/application".to_string()]);
        assert_eq!(r.status.phase, Phase::Completed);
        assert_eq!(r.status.remote_id.as_deref(), Some("app-1"));
    }

    #[test]
    fn patches_carry_the_version_token() {
        let mut r = Resource::new("ns", "a", Spec::Secret(Default::default()));
        r.meta.resource_version = "42".into();
        r.meta.finalizers = vec!["x".into()];
        assert_eq!(finalizer_patch(&r), json!({ "metadata": { "resourceVersion": "42", "finalizers": ["x"] } }));
        assert_eq!(status_patch(&r).unwrap()["metadata"]["resourceVersion"], "42");
    }

    #[test]
    fn api_errors_map_onto_the_taxonomy() {
        let id = ResourceId::new(Kind::Application, "ns", "a");
        let api = |code: u16| {
            kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "m".into(), reason: "r".into(), code })
        };
        assert!(map_error(api(409), "status", &id).is_conflict());
        assert!(map_error(api(404), "get", &id).is_not_found());
        assert!(map_error(api(422), "apply", &id).is_validation());
        assert!(map_error(api(503), "list", &id).is_retryable());
        assert!(!map_error(api(403), "list", &id).is_retryable());
    }
}
