use std::collections::BTreeMap;

use apiary_admission::SecretLookup;
use apiary_core::{ApiaryError, ApiaryResult, Kind, ResourceId};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::convert::map_error;

/// Secret lookup reading core v1 secrets directly. Values that are not UTF-8 are
/// reported as validation errors naming the path.
#[derive(Clone)]
pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self { Self { client } }
}

/// Plain view of a secret; `stringData` entries take precedence over `data`.
pub fn plain_data(namespace: &str, name: &str, secret: Secret) -> ApiaryResult<BTreeMap<String, String>> {
    let mut out = secret.string_data.unwrap_or_default();
    for (key, bytes) in secret.data.unwrap_or_default() {
        if out.contains_key(&key) { continue; }
        let value = String::from_utf8(bytes.0).map_err(|_| {
            ApiaryError::Validation(format!("key [{}] in secret [{}/{}] is not utf-8", key, namespace, name))
        })?;
        out.insert(key, value);
    }
    Ok(out)
}

#[async_trait::async_trait]
impl SecretLookup for KubeSecrets {
    async fn data(&self, namespace: &str, name: &str) -> ApiaryResult<Option<BTreeMap<String, String>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let id = ResourceId::new(Kind::Secret, namespace, name);
        let found = api.get_opt(name).await.map_err(|e| map_error(e, "get", &id))?;
        found.map(|s| plain_data(namespace, name, s)).transpose()
    }
}
