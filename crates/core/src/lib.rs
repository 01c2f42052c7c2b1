//! Apiary core types: resource model, processing status and reference declarations.

#![forbid(unsafe_code)]

pub mod error;
pub mod gateway;
pub mod manifest;
pub mod template;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;

pub use error::{ApiaryError, ApiaryResult, RemoteFailure, ResultExt};
pub use gateway::{Endpoint, EndpointGroup, LoadBalancer, LoadBalancerType};

pub const API_GROUP: &str = "apiary.dev";
pub const API_VERSION: &str = "v1alpha1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    ApiDefinition,
    Application,
    ApiResource,
    ManagementContext,
    Secret,
}

impl Kind {
    pub const ALL: [Kind; 5] = [
        Kind::ApiDefinition,
        Kind::Application,
        Kind::ApiResource,
        Kind::ManagementContext,
        Kind::Secret,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::ApiDefinition => "ApiDefinition",
            Kind::Application => "Application",
            Kind::ApiResource => "ApiResource",
            Kind::ManagementContext => "ManagementContext",
            Kind::Secret => "Secret",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str().eq_ignore_ascii_case(s))
    }

    /// Kinds whose specs may declare references to other resources.
    pub fn declares_references(self) -> bool {
        matches!(self, Kind::ApiDefinition | Kind::Application | Kind::ApiResource | Kind::ManagementContext)
    }

    /// Kinds that own a record on the management plane.
    pub fn is_remote(self) -> bool { matches!(self, Kind::ApiDefinition | Kind::Application) }

    /// Kinds whose specs can point at `self`.
    pub fn referenced_by(self) -> &'static [Kind] {
        match self {
            Kind::ApiResource => &[Kind::ApiDefinition],
            Kind::ManagementContext => &[Kind::ApiDefinition, Kind::Application],
            Kind::Secret => &[Kind::ManagementContext, Kind::ApiResource, Kind::ApiDefinition, Kind::Application],
            Kind::ApiDefinition | Kind::Application => &[],
        }
    }

    /// Deletion-guard marker name stored in the object's finalizers.
    pub fn finalizer(self) -> &'static str {
        match self {
            Kind::ApiDefinition => "finalizers.apiary.dev/api-definition",
            Kind::Application => "finalizers.apiary.dev/application",
            Kind::ApiResource => "finalizers.apiary.dev/api-resource",
            Kind::ManagementContext => "finalizers.apiary.dev/management-context",
            Kind::Secret => "finalizers.apiary.dev/secret",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Stable identity of an object inside one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: Kind,
    pub key: ObjectKey,
}

impl ResourceId {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, key: ObjectKey::new(namespace, name) }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} {}", self.kind, self.key) }
}

/// `name` plus optional `namespace`, as authored in a spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl NamespacedName {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), namespace: None } }

    pub fn in_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: Some(namespace.into()) }
    }
}

/// Reference declaration: a typed pointer to another resource this spec depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: Kind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn new(kind: Kind, target: &NamespacedName) -> Self {
        Self { kind, name: target.name.clone(), namespace: target.namespace.clone() }
    }

    /// Resolve against the referencing object's namespace.
    pub fn resolve(&self, default_namespace: &str) -> ResourceId {
        ResourceId::new(self.kind, self.namespace.as_deref().unwrap_or(default_namespace), self.name.clone())
    }

    /// Exact kind + name + namespace match.
    pub fn matches(&self, default_namespace: &str, target: &ResourceId) -> bool {
        self.kind == target.kind
            && self.name == target.key.name
            && self.namespace.as_deref().unwrap_or(default_namespace) == target.key.namespace
    }
}

// ---- payloads ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub security: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_definition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub encrypted: bool,
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub configuration: Json,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Resource used by an API definition, inline or by reference to an `ApiResource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceEntry {
    Ref {
        #[serde(rename = "ref")]
        reference: NamespacedName,
    },
    Inline(ApiResourceSpec),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDefinitionSpec {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<NamespacedName>,
    #[serde(default)]
    pub local: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<Plan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Property>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoint_groups: Vec<EndpointGroup>,
}

/// Application metadata entry. `name` is the stable local key; `key` is assigned
/// by the management plane once the entry exists there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub name: String,
    #[serde(rename = "key", default, skip_serializing_if = "Option::is_none")]
    pub remote_key: Option<String>,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl MetadataEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), remote_key: None, value: value.into(), format: None }
    }

    /// Same content, ignoring the remote key.
    pub fn same_content(&self, other: &MetadataEntry) -> bool {
        self.name == other.name && self.value == other.value && self.format == other.format
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<NamespacedName>,
    /// Free-form settings; carried forward from the remote record when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<MetadataEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Secret holding `bearerToken`, or `username` and `password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<NamespacedName>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementContextSpec {
    pub base_url: String,
    pub environment_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub auth: ContextAuth,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Desired-state payload, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec")]
pub enum Spec {
    ApiDefinition(ApiDefinitionSpec),
    Application(ApplicationSpec),
    ApiResource(ApiResourceSpec),
    ManagementContext(ManagementContextSpec),
    Secret(SecretSpec),
}

impl Spec {
    pub fn kind(&self) -> Kind {
        match self {
            Spec::ApiDefinition(_) => Kind::ApiDefinition,
            Spec::Application(_) => Kind::Application,
            Spec::ApiResource(_) => Kind::ApiResource,
            Spec::ManagementContext(_) => Kind::ManagementContext,
            Spec::Secret(_) => Kind::Secret,
        }
    }

    pub fn from_value(kind: Kind, value: Json) -> ApiaryResult<Self> {
        let map = |e: serde_json::Error| ApiaryError::Validation(format!("invalid {} spec: {}", kind, e));
        Ok(match kind {
            Kind::ApiDefinition => Spec::ApiDefinition(serde_json::from_value(value).map_err(map)?),
            Kind::Application => Spec::Application(serde_json::from_value(value).map_err(map)?),
            Kind::ApiResource => Spec::ApiResource(serde_json::from_value(value).map_err(map)?),
            Kind::ManagementContext => Spec::ManagementContext(serde_json::from_value(value).map_err(map)?),
            Kind::Secret => Spec::Secret(serde_json::from_value(value).map_err(map)?),
        })
    }

    /// The payload alone, without the kind tag.
    pub fn to_value(&self) -> ApiaryResult<Json> {
        let r = match self {
            Spec::ApiDefinition(s) => serde_json::to_value(s),
            Spec::Application(s) => serde_json::to_value(s),
            Spec::ApiResource(s) => serde_json::to_value(s),
            Spec::ManagementContext(s) => serde_json::to_value(s),
            Spec::Secret(s) => serde_json::to_value(s),
        };
        r.map_err(|e| ApiaryError::Internal(e.to_string()))
    }

    pub fn context_ref(&self) -> Option<&NamespacedName> {
        match self {
            Spec::ApiDefinition(s) => s.context_ref.as_ref(),
            Spec::Application(s) => s.context_ref.as_ref(),
            _ => None,
        }
    }

    /// Declared references, namespaces left as authored.
    pub fn references(&self) -> SmallVec<[ObjectRef; 4]> {
        let mut out: SmallVec<[ObjectRef; 4]> = SmallVec::new();
        if let Some(ctx) = self.context_ref() {
            out.push(ObjectRef::new(Kind::ManagementContext, ctx));
        }
        match self {
            Spec::ApiDefinition(s) => {
                for r in s.resources.iter() {
                    if let ResourceEntry::Ref { reference } = r {
                        out.push(ObjectRef::new(Kind::ApiResource, reference));
                    }
                }
            }
            Spec::ManagementContext(s) => {
                if let Some(sr) = &s.auth.secret_ref {
                    out.push(ObjectRef::new(Kind::Secret, sr));
                }
            }
            _ => {}
        }
        if self.kind().declares_references() {
            if let Ok(v) = self.to_value() {
                for p in template::secret_refs(&v) {
                    out.push(ObjectRef { kind: Kind::Secret, name: p.name, namespace: None });
                }
            }
        }
        let mut seen: SmallVec<[ObjectRef; 4]> = SmallVec::new();
        for r in out {
            if !seen.contains(&r) { seen.push(r); }
        }
        seen
    }
}

// ---- status ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Reconciling,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// Human-readable failure surface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Object metadata owned by the declarative store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default)]
    pub generation: i64,
    /// Optimistic-concurrency token.
    #[serde(default)]
    pub resource_version: String,
    /// Set by the store when removal was requested but guards are still present.
    #[serde(default)]
    pub deletion_requested: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub meta: Meta,
    #[serde(flatten)]
    pub spec: Spec,
    #[serde(default)]
    pub status: ProcessingStatus,
}

impl Resource {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: Spec) -> Self {
        Self {
            meta: Meta { namespace: namespace.into(), name: name.into(), generation: 1, ..Default::default() },
            spec,
            status: ProcessingStatus::default(),
        }
    }

    pub fn kind(&self) -> Kind { self.spec.kind() }
    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.meta.namespace.clone(), self.meta.name.clone()) }
    pub fn id(&self) -> ResourceId { ResourceId { kind: self.kind(), key: self.key() } }
    pub fn is_being_deleted(&self) -> bool { self.meta.deletion_requested }

    pub fn has_finalizer(&self, f: &str) -> bool { self.meta.finalizers.iter().any(|x| x == f) }

    /// Returns false when already present.
    pub fn add_finalizer(&mut self, f: &str) -> bool {
        if self.has_finalizer(f) { return false; }
        self.meta.finalizers.push(f.to_string());
        true
    }

    /// Returns false when absent.
    pub fn remove_finalizer(&mut self, f: &str) -> bool {
        let before = self.meta.finalizers.len();
        self.meta.finalizers.retain(|x| x != f);
        before != self.meta.finalizers.len()
    }

    /// Resolved reference declarations of this object.
    pub fn references(&self) -> SmallVec<[ResourceId; 4]> {
        self.spec.references().iter().map(|r| r.resolve(&self.meta.namespace)).collect()
    }

    pub fn references_target(&self, target: &ResourceId) -> bool {
        self.spec.references().iter().any(|r| r.matches(&self.meta.namespace, target))
    }

    /// Remote state is known to match this generation of the spec.
    pub fn is_up_to_date(&self) -> bool {
        self.status.phase == Phase::Completed && self.status.observed_generation == self.meta.generation
    }
}

/// Change notification delivered by a declarative store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub id: ResourceId,
    pub kind: DeltaKind,
    pub generation: i64,
    /// Removal was requested but guards are still attached.
    pub deleting: bool,
}

impl Delta {
    pub fn applied(obj: &Resource) -> Self {
        Self { id: obj.id(), kind: DeltaKind::Applied, generation: obj.meta.generation, deleting: obj.is_being_deleted() }
    }

    pub fn deleted(id: ResourceId) -> Self {
        Self { id, kind: DeltaKind::Deleted, generation: 0, deleting: true }
    }
}
