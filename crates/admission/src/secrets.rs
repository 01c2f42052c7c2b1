use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use apiary_core::{ApiaryError, ApiaryResult, Kind, ResourceId, Spec};
use apiary_store::ObjectStore;

/// Secret lookup collaborator. Paths are resolved in the owning object's namespace.
#[async_trait::async_trait]
pub trait SecretLookup: Send + Sync {
    /// Every key of a secret, or `None` when the secret does not exist.
    async fn data(&self, namespace: &str, name: &str) -> ApiaryResult<Option<BTreeMap<String, String>>>;

    /// One value. Missing secrets and missing keys are validation errors naming the path.
    async fn get(&self, namespace: &str, name: &str, key: &str) -> ApiaryResult<String> {
        let data = self
            .data(namespace, name)
            .await?
            .ok_or_else(|| ApiaryError::Validation(format!("secret [{}/{}] not found", namespace, name)))?;
        data.get(key)
            .cloned()
            .ok_or_else(|| ApiaryError::Validation(format!("key [{}] not found in secret [{}/{}]", key, namespace, name)))
    }
}

/// Fixed secret table for tests and offline validation.
#[derive(Default)]
pub struct MemorySecrets {
    items: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
}

impl MemorySecrets {
    pub fn new() -> Self { Self::default() }

    pub fn insert<I, K, V>(&self, namespace: &str, name: &str, data: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let data = data.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.items.lock().unwrap_or_else(|p| p.into_inner()).insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.items.lock().unwrap_or_else(|p| p.into_inner()).remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait::async_trait]
impl SecretLookup for MemorySecrets {
    async fn data(&self, namespace: &str, name: &str) -> ApiaryResult<Option<BTreeMap<String, String>>> {
        let items = self.items.lock().unwrap_or_else(|p| p.into_inner());
        Ok(items.get(&(namespace.to_string(), name.to_string())).cloned())
    }
}

/// Secrets read from the declarative store, where they are `Secret` resources.
pub struct StoreSecrets {
    store: Arc<dyn ObjectStore>,
}

impl StoreSecrets {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store } }
}

#[async_trait::async_trait]
impl SecretLookup for StoreSecrets {
    async fn data(&self, namespace: &str, name: &str) -> ApiaryResult<Option<BTreeMap<String, String>>> {
        let id = ResourceId::new(Kind::Secret, namespace, name);
        Ok(self.store.get(&id).await?.and_then(|r| match r.spec {
            Spec::Secret(s) => Some(s.data),
            _ => None,
        }))
    }
}
