use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use super::{InstanceInfo, InstanceStore, ProviderError};
use crate::runtime::snapshot::WorkflowSnapshot;

/// Filesystem-backed store writing one JSON file per instance.
///
/// Layout: `<root>/instances/<id>.json` and `<root>/keys/<key>` (holding the
/// owning instance id). Snapshot writes go to a temporary file that is then
/// renamed over the previous one.
#[derive(Clone, Debug)]
pub struct FsInstanceStore {
    root: PathBuf,
}

impl FsInstanceStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create
        let _ = std::fs::create_dir_all(path.join("instances"));
        let _ = std::fs::create_dir_all(path.join("keys"));
        Self { root: path }
    }

    fn instance_path(&self, instance: Uuid) -> PathBuf {
        self.root.join("instances").join(format!("{instance}.json"))
    }

    fn key_path(&self, key: Uuid) -> PathBuf {
        self.root.join("keys").join(key.to_string())
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8], operation: &str) -> Result<(), ProviderError> {
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await.map_err(|e| ProviderError::io(operation, e))?;
        file.write_all(bytes).await.map_err(|e| ProviderError::io(operation, e))?;
        file.flush().await.map_err(|e| ProviderError::io(operation, e))?;
        drop(file);
        fs::rename(&tmp, path).await.map_err(|e| ProviderError::io(operation, e))
    }

    async fn key_owner(&self, key: Uuid) -> Result<Option<Uuid>, ProviderError> {
        match fs::read_to_string(self.key_path(key)).await {
            Ok(s) => Uuid::parse_str(s.trim())
                .map(Some)
                .map_err(|e| ProviderError::permanent("lookup_key", format!("corrupt key file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::io("lookup_key", e)),
        }
    }
}

#[async_trait::async_trait]
impl InstanceStore for FsInstanceStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<(), ProviderError> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|e| ProviderError::corrupt_snapshot("save", e))?;
        self.write_atomic(&self.instance_path(snapshot.instance_id), &bytes, "save")
            .await
    }

    async fn load(&self, instance: Uuid) -> Result<Option<WorkflowSnapshot>, ProviderError> {
        let data = match fs::read(self.instance_path(instance)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ProviderError::io("load", e)),
        };
        WorkflowSnapshot::from_json(&data)
            .map(Some)
            .map_err(|e| ProviderError::corrupt_snapshot("load", e))
    }

    async fn delete(&self, instance: Uuid) -> Result<bool, ProviderError> {
        let mut entries = fs::read_dir(self.root.join("keys"))
            .await
            .map_err(|e| ProviderError::io("delete", e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| ProviderError::io("delete", e))? {
            let owned = fs::read_to_string(entry.path())
                .await
                .map(|s| s.trim() == instance.to_string())
                .unwrap_or(false);
            if owned {
                let _ = fs::remove_file(entry.path()).await;
            }
        }
        match fs::remove_file(self.instance_path(instance)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProviderError::io("delete", e)),
        }
    }

    async fn associate_keys(&self, instance: Uuid, keys: &[Uuid]) -> Result<(), ProviderError> {
        for key in keys {
            if let Some(owner) = self.key_owner(*key).await?
                && owner != instance
            {
                return Err(ProviderError::key_conflict(*key, owner));
            }
        }
        for key in keys {
            self.write_atomic(&self.key_path(*key), instance.to_string().as_bytes(), "associate_keys")
                .await?;
        }
        Ok(())
    }

    async fn disassociate_keys(&self, keys: &[Uuid]) -> Result<(), ProviderError> {
        for key in keys {
            match fs::remove_file(self.key_path(*key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ProviderError::io("disassociate_keys", e)),
            }
        }
        Ok(())
    }

    async fn lookup_key(&self, key: Uuid) -> Result<Option<Uuid>, ProviderError> {
        self.key_owner(key).await
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, ProviderError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(self.root.join("instances"))
            .await
            .map_err(|e| ProviderError::io("list_instances", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProviderError::io("list_instances", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = fs::read(&path).await else {
                continue;
            };
            match WorkflowSnapshot::from_json(&data) {
                Ok(snapshot) => out.push(InstanceInfo::of(&snapshot)),
                Err(e) => tracing::warn!(
                    target: "duroflow::providers::fs",
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable snapshot"
                ),
            }
        }
        out.sort_by_key(|i| i.instance_id);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::snapshot;

    #[tokio::test]
    async fn snapshots_survive_a_new_store_handle() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let store = FsInstanceStore::new(dir.path(), false);
            store.save(&snapshot(id, "billing")).await.unwrap();
        }
        let store = FsInstanceStore::new(dir.path(), false);
        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.identity.name, "billing");
        let listed = store.list_instances().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].instance_id, id);
    }

    #[tokio::test]
    async fn damaged_snapshot_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsInstanceStore::new(dir.path(), false);
        let id = Uuid::new_v4();
        store.save(&snapshot(id, "billing")).await.unwrap();
        fs::write(store.instance_path(id), b"{\"instance_id\":").await.unwrap();

        let err = store.load(id).await.unwrap_err();
        assert_eq!(err.failure, crate::providers::StoreFailure::CorruptSnapshot);
        assert_eq!(err.operation, "load");
    }

    #[tokio::test]
    async fn reset_on_create_clears_data() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        FsInstanceStore::new(dir.path(), false)
            .save(&snapshot(id, "billing"))
            .await
            .unwrap();
        let store = FsInstanceStore::new(dir.path(), true);
        assert!(store.load(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn key_conflicts_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsInstanceStore::new(dir.path(), false);
        let (a, b, key) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.save(&snapshot(a, "billing")).await.unwrap();
        store.associate_keys(a, &[key]).await.unwrap();
        let err = store.associate_keys(b, &[key]).await.unwrap_err();
        assert_eq!(err.failure, crate::providers::StoreFailure::KeyConflict);
        assert_eq!(store.lookup_key(key).await.unwrap(), Some(a));

        assert!(store.delete(a).await.unwrap());
        assert_eq!(store.lookup_key(key).await.unwrap(), None);
        assert!(store.load(a).await.unwrap().is_none());
    }
}
