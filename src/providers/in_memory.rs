use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{InstanceInfo, InstanceStore, ProviderError};
use crate::runtime::snapshot::WorkflowSnapshot;

#[derive(Default)]
struct State {
    // snapshots are kept serialized so loads exercise the same path as durable stores
    instances: HashMap<Uuid, (InstanceInfo, Vec<u8>)>,
    keys: HashMap<Uuid, Uuid>,
}

#[derive(Default)]
pub struct InMemoryInstanceStore {
    inner: Mutex<State>,
}

impl InMemoryInstanceStore {
    /// Drop everything (test utility).
    pub async fn reset(&self) {
        let mut g = self.inner.lock().await;
        g.instances.clear();
        g.keys.clear();
    }

    pub async fn instance_count(&self) -> usize {
        self.inner.lock().await.instances.len()
    }

    /// Pretty-printed dump of all instances (test utility).
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.inner.lock().await;
        let mut out = String::new();
        for (id, (info, _)) in g.instances.iter() {
            out.push_str(&format!(
                "instance={id} identity={} completed={}\n",
                info.identity, info.completed
            ));
            for (key, owner) in g.keys.iter().filter(|(_, owner)| *owner == id) {
                out.push_str(&format!("  key={key} -> {owner}\n"));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<(), ProviderError> {
        let bytes = snapshot.to_json().map_err(|e| ProviderError::corrupt_snapshot("save", e))?;
        let mut g = self.inner.lock().await;
        g.instances
            .insert(snapshot.instance_id, (InstanceInfo::of(snapshot), bytes));
        Ok(())
    }

    async fn load(&self, instance: Uuid) -> Result<Option<WorkflowSnapshot>, ProviderError> {
        let g = self.inner.lock().await;
        match g.instances.get(&instance) {
            Some((_, bytes)) => WorkflowSnapshot::from_json(bytes)
                .map(Some)
                .map_err(|e| ProviderError::corrupt_snapshot("load", e)),
            None => Ok(None),
        }
    }

    async fn delete(&self, instance: Uuid) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        g.keys.retain(|_, owner| *owner != instance);
        Ok(g.instances.remove(&instance).is_some())
    }

    async fn associate_keys(&self, instance: Uuid, keys: &[Uuid]) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        if let Some((key, owner)) = keys
            .iter()
            .find_map(|k| g.keys.get(k).filter(|owner| **owner != instance).map(|owner| (*k, *owner)))
        {
            return Err(ProviderError::key_conflict(key, owner));
        }
        for key in keys {
            g.keys.insert(*key, instance);
        }
        Ok(())
    }

    async fn disassociate_keys(&self, keys: &[Uuid]) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        for key in keys {
            g.keys.remove(key);
        }
        Ok(())
    }

    async fn lookup_key(&self, key: Uuid) -> Result<Option<Uuid>, ProviderError> {
        Ok(self.inner.lock().await.keys.get(&key).copied())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, ProviderError> {
        let g = self.inner.lock().await;
        let mut out: Vec<InstanceInfo> = g.instances.values().map(|(info, _)| info.clone()).collect();
        out.sort_by_key(|i| i.instance_id);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::snapshot;

    #[tokio::test]
    async fn save_overwrites_and_load_round_trips() {
        let store = InMemoryInstanceStore::default();
        let id = Uuid::new_v4();
        let mut snap = snapshot(id, "orders");
        store.save(&snap).await.unwrap();
        snap.next_tracking_record_number = 9;
        store.save(&snap).await.unwrap();

        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.next_tracking_record_number, 9);
        assert_eq!(store.instance_count().await, 1);
    }

    #[tokio::test]
    async fn keys_belong_to_one_instance() {
        let store = InMemoryInstanceStore::default();
        let (a, b, key) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.associate_keys(a, &[key]).await.unwrap();
        store.associate_keys(a, &[key]).await.unwrap();
        let err = store.associate_keys(b, &[key]).await.unwrap_err();
        assert_eq!(err.failure, crate::providers::StoreFailure::KeyConflict);
        assert_eq!(store.lookup_key(key).await.unwrap(), Some(a));

        store.disassociate_keys(&[key]).await.unwrap();
        store.associate_keys(b, &[key]).await.unwrap();
        assert_eq!(store.lookup_key(key).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn delete_drops_keys() {
        let store = InMemoryInstanceStore::default();
        let (id, key) = (Uuid::new_v4(), Uuid::new_v4());
        store.save(&snapshot(id, "orders")).await.unwrap();
        store.associate_keys(id, &[key]).await.unwrap();
        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert_eq!(store.lookup_key(key).await.unwrap(), None);
        assert!(store.list_instances().await.unwrap().is_empty());
    }
}
