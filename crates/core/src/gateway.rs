//! Gateway-definition materialization: the last transform before an API definition
//! is shipped to the management plane.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::VecDeque;

use crate::{ApiDefinitionSpec, ApiaryError, ApiaryResult};

pub const ENDPOINT_TYPE_HTTP: &str = "http-proxy";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerType {
    #[default]
    #[serde(alias = "round-robin")]
    RoundRobin,
    #[serde(alias = "random")]
    Random,
    #[serde(alias = "weighted-round-robin")]
    WeightedRoundRobin,
    #[serde(alias = "weighted-random")]
    WeightedRandom,
}

impl LoadBalancerType {
    /// Canonical representation expected by gateways.
    pub fn to_gateway_definition(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::WeightedRandom => "weighted-random",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    #[serde(rename = "type", default)]
    pub lb_type: LoadBalancerType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub endpoint_type: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Json>,
    #[serde(default)]
    pub secondary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointGroup {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub group_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_configuration: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
}

/// Source of display names for sub-resources the author left unnamed.
pub trait NameSource: Send {
    fn next_name(&mut self) -> String;
}

const ADJECTIVES: &[&str] = &[
    "admiring", "brave", "clever", "dazzling", "eager", "focused", "gallant", "happy",
    "jolly", "keen", "lucid", "modest", "nifty", "optimistic", "quirky", "relaxed",
    "serene", "tender", "upbeat", "vibrant", "wizardly", "zealous",
];

const SURNAMES: &[&str] = &[
    "archimedes", "babbage", "curie", "dijkstra", "euclid", "feynman", "galileo", "hopper",
    "johnson", "kepler", "lovelace", "meitner", "noether", "pascal", "ritchie", "shannon",
    "thompson", "turing", "wozniak", "yalow",
];

/// `adjective_surname` names drawn from a fixed corpus with v4 UUID randomness.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNames;

impl NameSource for RandomNames {
    fn next_name(&mut self) -> String {
        let bits = uuid::Uuid::new_v4().as_u128();
        let left = ADJECTIVES[(bits % ADJECTIVES.len() as u128) as usize];
        let right = SURNAMES[((bits >> 64) % SURNAMES.len() as u128) as usize];
        format!("{}_{}", left, right)
    }
}

/// Deterministic names, handed out in order then suffixed once exhausted.
#[derive(Debug, Default, Clone)]
pub struct FixedNames {
    queue: VecDeque<String>,
    issued: usize,
}

impl FixedNames {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self { queue: names.into_iter().map(Into::into).collect(), issued: 0 }
    }
}

impl NameSource for FixedNames {
    fn next_name(&mut self) -> String {
        self.issued += 1;
        self.queue.pop_front().unwrap_or_else(|| format!("group-{}", self.issued))
    }
}

pub struct Materializer<N: NameSource = RandomNames> {
    names: N,
}

impl Materializer<RandomNames> {
    pub fn new() -> Self { Self { names: RandomNames } }
}

impl Default for Materializer<RandomNames> {
    fn default() -> Self { Self::new() }
}

impl<N: NameSource> Materializer<N> {
    pub fn with_names(names: N) -> Self { Self { names } }

    /// Gateway-ready copy of one endpoint group. The input is never modified.
    pub fn endpoint_group(&mut self, group: &EndpointGroup) -> ApiaryResult<Json> {
        let mut g = group.clone();
        if g.name.is_empty() { g.name = self.names.next_name(); }
        if g.group_type.is_empty() { g.group_type = ENDPOINT_TYPE_HTTP.to_string(); }
        for ep in g.endpoints.iter_mut() {
            if ep.endpoint_type.is_empty() { ep.endpoint_type = ENDPOINT_TYPE_HTTP.to_string(); }
        }
        let lb = g.load_balancer.take();
        let mut v = serde_json::to_value(&g).map_err(|e| ApiaryError::Internal(e.to_string()))?;
        if let Some(lb) = lb {
            let obj = v
                .as_object_mut()
                .ok_or_else(|| ApiaryError::Internal(format!("endpoint group [{}] did not serialize to an object", g.name)))?;
            obj.insert("loadBalancer".into(), serde_json::json!({ "type": lb.lb_type.to_gateway_definition() }));
        }
        Ok(v)
    }

    /// Payload for the management plane. Local-only fields (context reference,
    /// `local`, unresolved resource references) are not shipped.
    pub fn materialize(&mut self, spec: &ApiDefinitionSpec) -> ApiaryResult<Json> {
        let mut v = serde_json::to_value(spec).map_err(|e| ApiaryError::Internal(e.to_string()))?;
        let groups = spec.endpoint_groups.iter().map(|g| self.endpoint_group(g)).collect::<ApiaryResult<Vec<Json>>>()?;
        let obj = v
            .as_object_mut()
            .ok_or_else(|| ApiaryError::Internal("api definition did not serialize to an object".into()))?;
        obj.remove("contextRef");
        obj.remove("local");
        if let Some(Json::Array(resources)) = obj.get_mut("resources") {
            if resources.iter().any(|r| r.get("ref").is_some()) {
                return Err(ApiaryError::Validation("api resource references must be resolved before materialization".into()));
            }
        }
        if !groups.is_empty() { obj.insert("endpointGroups".into(), Json::Array(groups)); }
        obj.insert("definitionContext".into(), serde_json::json!({ "origin": "KUBERNETES" }));
        Ok(v)
    }
}
