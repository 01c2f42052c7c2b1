//! Kubernetes-shaped manifests (`apiVersion`, `kind`, `metadata`, `spec`, `status`)
//! to and from the internal resource model.

use serde_json::{json, Map, Value as Json};

use crate::{ApiaryError, ApiaryResult, Kind, Meta, ProcessingStatus, Resource, SecretSpec, Spec, API_GROUP, API_VERSION};

fn api_version(kind: Kind) -> String {
    match kind {
        Kind::Secret => "v1".to_string(),
        _ => format!("{}/{}", API_GROUP, API_VERSION),
    }
}

fn str_field(v: &Json, key: &str) -> Option<String> { v.get(key).and_then(Json::as_str).map(str::to_string) }

/// Decode one manifest. Objects without a namespace land in `default_namespace`.
///
/// Secrets carry plain values under `stringData`; adapters decode `data` before calling.
pub fn from_manifest(doc: &Json, default_namespace: &str) -> ApiaryResult<Resource> {
    let kind_s = str_field(doc, "kind").ok_or_else(|| ApiaryError::Validation("manifest has no kind".into()))?;
    let kind = Kind::parse(&kind_s).ok_or_else(|| ApiaryError::Validation(format!("unsupported kind {}", kind_s)))?;
    let md = doc.get("metadata").cloned().unwrap_or(Json::Null);
    let name = str_field(&md, "name").ok_or_else(|| ApiaryError::Validation(format!("{} has no metadata.name", kind)))?;
    let namespace = str_field(&md, "namespace").unwrap_or_else(|| default_namespace.to_string());

    let spec = match kind {
        Kind::Secret => {
            let data = doc.get("stringData").cloned().unwrap_or_else(|| json!({}));
            let data = serde_json::from_value(data)
                .map_err(|e| ApiaryError::Validation(format!("secret {}/{}: {}", namespace, name, e)))?;
            Spec::Secret(SecretSpec { data })
        }
        _ => Spec::from_value(kind, doc.get("spec").cloned().unwrap_or_else(|| json!({})))?,
    };

    let finalizers = md
        .get("finalizers")
        .and_then(Json::as_array)
        .map(|xs| xs.iter().filter_map(Json::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let meta = Meta {
        namespace,
        name,
        uid: str_field(&md, "uid"),
        generation: md.get("generation").and_then(Json::as_i64).unwrap_or(1),
        resource_version: str_field(&md, "resourceVersion").unwrap_or_default(),
        deletion_requested: md.get("deletionTimestamp").map(|t| !t.is_null()).unwrap_or(false),
        finalizers,
    };
    let status: ProcessingStatus = match doc.get("status") {
        Some(s) if !s.is_null() => serde_json::from_value(s.clone()).unwrap_or_default(),
        _ => ProcessingStatus::default(),
    };
    Ok(Resource { meta, spec, status })
}

/// Encode a resource as a manifest suitable for server-side apply.
pub fn to_manifest(obj: &Resource) -> ApiaryResult<Json> {
    let kind = obj.kind();
    let mut metadata = Map::new();
    metadata.insert("name".into(), Json::String(obj.meta.name.clone()));
    metadata.insert("namespace".into(), Json::String(obj.meta.namespace.clone()));
    if !obj.meta.resource_version.is_empty() {
        metadata.insert("resourceVersion".into(), Json::String(obj.meta.resource_version.clone()));
    }
    let mut doc = Map::new();
    doc.insert("apiVersion".into(), Json::String(api_version(kind)));
    doc.insert("kind".into(), Json::String(kind.as_str().to_string()));
    doc.insert("metadata".into(), Json::Object(metadata));
    match &obj.spec {
        Spec::Secret(s) => {
            let data = serde_json::to_value(&s.data).map_err(|e| ApiaryError::Internal(e.to_string()))?;
            doc.insert("stringData".into(), data);
        }
        other => {
            doc.insert("spec".into(), other.to_value()?);
        }
    }
    Ok(Json::Object(doc))
}

/// Split a multi-document YAML-ish stream already parsed into JSON values.
pub fn from_documents(docs: &[Json], default_namespace: &str) -> ApiaryResult<Vec<Resource>> {
    docs.iter().filter(|d| !d.is_null()).map(|d| from_manifest(d, default_namespace)).collect()
}
