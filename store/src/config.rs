use std::collections::HashSet;
use std::sync::Arc;

use kestrel_types::ServiceSpec;
use uuid::Uuid;

use crate::error::StoreError;
use crate::paths;
use crate::persistent::PersistentStore;

/// Versioned service specs plus the `target` pointer. Exactly one target
/// configuration exists at any moment; the pointer is written last so a
/// crash between the two writes leaves the previous target intact.
#[derive(Clone)]
pub struct ConfigStore {
    store: Arc<dyn PersistentStore>,
}

impl ConfigStore {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        ConfigStore { store }
    }

    pub async fn store(&self, spec: &ServiceSpec) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let bytes = serde_json::to_vec(spec)?;
        self.store
            .set(&paths::config_path(&id.to_string()), bytes)
            .await?;
        Ok(id)
    }

    pub async fn fetch(&self, id: Uuid) -> Result<ServiceSpec, StoreError> {
        let bytes = self.store.get(&paths::config_path(&id.to_string())).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn set_target(&self, id: Uuid) -> Result<(), StoreError> {
        self.store
            .set(paths::CONFIG_TARGET, id.to_string().into_bytes())
            .await
    }

    pub async fn target(&self) -> Result<Option<Uuid>, StoreError> {
        match self.store.get(paths::CONFIG_TARGET).await {
            Ok(bytes) => {
                let s = String::from_utf8_lossy(&bytes);
                Uuid::parse_str(s.trim())
                    .map(Some)
                    .map_err(|e| StoreError::Storage(format!("corrupt target pointer: {e}")))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        for name in self.store.list(paths::CONFIGURATIONS).await? {
            match Uuid::parse_str(&name) {
                Ok(id) => ids.push(id),
                Err(_) => tracing::warn!(%name, "ignoring non-uuid configuration entry"),
            }
        }
        Ok(ids)
    }

    /// Garbage-collect specs that are neither the target nor referenced by
    /// any running task.
    pub async fn prune(&self, in_use: &HashSet<Uuid>) -> Result<(), StoreError> {
        let target = self.target().await?;
        for id in self.list().await? {
            if Some(id) == target || in_use.contains(&id) {
                continue;
            }
            tracing::info!(%id, "pruning unreferenced configuration");
            self.store
                .recursive_delete(&paths::config_path(&id.to_string()))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent::MemoryStore;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            role: "role".into(),
            principal: "principal".into(),
            pods: vec![],
        }
    }

    fn store() -> ConfigStore {
        ConfigStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn target_pointer_round_trip() {
        let c = store();
        assert_eq!(c.target().await.unwrap(), None);
        let id = c.store(&spec("svc")).await.unwrap();
        c.set_target(id).await.unwrap();
        assert_eq!(c.target().await.unwrap(), Some(id));
        assert_eq!(c.fetch(id).await.unwrap().name, "svc");
    }

    #[tokio::test]
    async fn prune_keeps_target_and_referenced() {
        let c = store();
        let target = c.store(&spec("target")).await.unwrap();
        let referenced = c.store(&spec("referenced")).await.unwrap();
        let stale = c.store(&spec("stale")).await.unwrap();
        c.set_target(target).await.unwrap();

        let in_use: HashSet<Uuid> = [referenced].into_iter().collect();
        c.prune(&in_use).await.unwrap();

        let mut left = c.list().await.unwrap();
        left.sort();
        let mut expected = vec![target, referenced];
        expected.sort();
        assert_eq!(left, expected);
        assert!(c.fetch(stale).await.is_err());
    }
}
