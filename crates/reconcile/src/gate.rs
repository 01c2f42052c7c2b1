use std::sync::Arc;

use apiary_admission::AdmissionValidator;
use apiary_core::{ApiaryResult, Resource, ResourceId};
use apiary_store::ObjectStore;

/// Write path in front of the declarative store: nothing reaches it unadmitted.
pub struct AdmissionGate {
    store: Arc<dyn ObjectStore>,
    admission: Arc<AdmissionValidator>,
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn ObjectStore>, admission: Arc<AdmissionValidator>) -> Self { Self { store, admission } }

    pub async fn apply(&self, obj: &Resource) -> ApiaryResult<Resource> {
        match self.store.get(&obj.id()).await? {
            Some(old) => self.admission.validate_update(&old, obj).await?,
            None => self.admission.validate_create(obj).await?,
        }
        self.store.apply(obj).await
    }

    pub async fn delete(&self, id: &ResourceId) -> ApiaryResult<bool> {
        if let Some(obj) = self.store.get(id).await? {
            self.admission.validate_delete(&obj).await?;
        }
        self.store.delete(id).await
    }
}
