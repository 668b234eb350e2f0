use std::sync::Arc;

use crate::error::StoreError;
use crate::paths;
use crate::persistent::PersistentStore;

/// Stores the framework identity the master assigns on first registration.
/// The id must be recovered on restart so the scheduler re-registers as the
/// same framework instead of forking a new one.
#[derive(Clone)]
pub struct FrameworkStore {
    store: Arc<dyn PersistentStore>,
}

impl FrameworkStore {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        FrameworkStore { store }
    }

    pub async fn store_framework_id(&self, id: &str) -> Result<(), StoreError> {
        self.store
            .set(paths::FRAMEWORK_ID, id.as_bytes().to_vec())
            .await
    }

    pub async fn fetch_framework_id(&self) -> Result<Option<String>, StoreError> {
        match self.store.get(paths::FRAMEWORK_ID).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn clear_framework_id(&self) -> Result<(), StoreError> {
        match self.store.delete(paths::FRAMEWORK_ID).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
