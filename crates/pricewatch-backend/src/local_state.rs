//! Small JSON state files (persisted session, folder expansion) written atomically.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LocalStateStore {
    root: PathBuf,
}

impl LocalStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// Returns `None` when nothing has been saved under `key`.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading state file {}", path.display()))
            }
        };
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing state file {}", path.display()))?;
        Ok(Some(value))
    }

    /// Write through a temp file in the same directory, then rename over the target.
    pub async fn save<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<PathBuf> {
        let path = self.path_for(key);
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating state directory {}", self.root.display()))?;

        let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {key}"))?;
        let temp_path = self.root.join(format!(".{key}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(path)
    }

    /// Returns whether a file was actually removed.
    pub async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing state file {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn saves_replace_previous_values_without_leaving_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStateStore::new(dir.path().join("state"));

        let mut keys = BTreeMap::new();
        keys.insert("3".to_string(), true);
        store.save("folder_tree.expanded", &keys).await.expect("first save");
        keys.insert("7".to_string(), false);
        let path = store.save("folder_tree.expanded", &keys).await.expect("second save");

        let loaded: BTreeMap<String, bool> = store
            .load("folder_tree.expanded")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded, keys);
        assert!(path.ends_with("folder_tree.expanded.json"));

        let entries = std::fs::read_dir(store.root()).expect("read dir").count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn missing_state_loads_as_none_and_remove_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStateStore::new(dir.path());
        let missing: Option<Vec<String>> = store.load("auth_session").await.expect("load");
        assert!(missing.is_none());

        store.save("auth_session", &vec!["x"]).await.expect("save");
        assert!(store.remove("auth_session").await.expect("remove"));
        assert!(!store.remove("auth_session").await.expect("remove again"));
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStateStore::new(dir.path());
        std::fs::write(store.path_for("broken"), b"{not json").expect("write");
        let result: anyhow::Result<Option<Vec<String>>> = store.load("broken").await;
        assert!(result.is_err());
    }
}
