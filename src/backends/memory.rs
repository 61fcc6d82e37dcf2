//! In-memory key/value backend.
//!
//! Keys stand in for file paths under the root prefix; directories are
//! implicit. No command execution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::boundary::{absolutize, relative_to, resolve_within};
use super::{
    BackendType, ConnectionStatus, Content, Disposable, Encoding, ExecOptions, FileBackend,
    FileStat, Lifecycle, ReadOptions, RemoveOptions, StatusListener, Subscription,
};
use crate::config::MemoryConfig;
use crate::error::{BackendError, Result};

struct Entry {
    content: Content,
    modified: DateTime<Utc>,
}

impl Entry {
    fn new(content: Content) -> Self {
        Self {
            content,
            modified: Utc::now(),
        }
    }
}

pub struct MemoryBackend {
    root: String,
    /// Root-relative keys ("dir/a.txt"); the root itself is never a key.
    store: Mutex<BTreeMap<String, Entry>>,
    lifecycle: Lifecycle,
}

impl MemoryBackend {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        let root = absolutize(&config.root);
        let backend = Self {
            root,
            store: Mutex::new(BTreeMap::new()),
            lifecycle: Lifecycle::new(ConnectionStatus::Connected),
        };

        {
            let mut store = backend.store.lock();
            for (key, value) in config.initial_data {
                let storage_key = backend.storage_key(&key).map_err(|e| {
                    BackendError::invalid_config(format!("invalid initial_data key '{key}': {e}"))
                })?;
                if storage_key.is_empty() {
                    return Err(BackendError::invalid_config(format!(
                        "initial_data key '{key}' names the backend root"
                    )));
                }
                store.insert(storage_key, Entry::new(Content::Text(value)));
            }
        }

        info!(
            "Memory backend ready at {} ({} seeded keys)",
            backend.root,
            backend.store.lock().len()
        );
        Ok(backend)
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn storage_key(&self, path: &str) -> Result<String> {
        let resolved = resolve_within(path, &self.root)?;
        relative_to(&resolved, &self.root)
            .map(str::to_string)
            .ok_or_else(|| BackendError::path_escape(path))
    }

    fn not_found(key: &str, operation: &'static str) -> BackendError {
        BackendError::KeyNotFound {
            key: key.to_string(),
            operation,
        }
    }

    /// Removes a key if present. Never fails on a missing key.
    pub fn delete(&self, path: &str) -> Result<()> {
        let key = self.storage_key(path)?;
        self.store.lock().remove(&key);
        Ok(())
    }

    pub fn clear(&self) {
        self.store.lock().clear();
    }

    /// Sorted root-relative keys, optionally filtered by a raw string prefix.
    pub fn list_keys(&self, prefix: Option<&str>) -> Vec<String> {
        let store = self.store.lock();
        match prefix {
            Some(prefix) if !prefix.is_empty() => store
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
            _ => store.keys().cloned().collect(),
        }
    }
}

#[async_trait]
impl FileBackend for MemoryBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    fn root(&self) -> &str {
        &self.root
    }

    fn status(&self) -> ConnectionStatus {
        self.lifecycle.status()
    }

    fn subscribe(&self, listener: StatusListener) -> Subscription {
        self.lifecycle.subscribe(listener)
    }

    fn track_disposable(&self, resource: Arc<dyn Disposable>) {
        self.lifecycle.track(resource);
    }

    fn list_active_scopes(&self) -> Vec<String> {
        self.lifecycle.active_scopes()
    }

    fn on_child_destroyed(&self, scope_id: Uuid) {
        self.lifecycle.deregister_scope(scope_id);
    }

    async fn destroy(&self) -> Result<()> {
        if self.lifecycle.destroy().await {
            self.store.lock().clear();
            info!("Memory backend at {} destroyed", self.root);
        }
        Ok(())
    }

    async fn execute(&self, _command: &str, _options: ExecOptions) -> Result<Content> {
        Err(BackendError::NotImplemented {
            operation: "exec",
            backend: BackendType::Memory,
        })
    }

    async fn read(&self, path: &str, options: ReadOptions) -> Result<Content> {
        let key = self.storage_key(path)?;
        let store = self.store.lock();
        let entry = store.get(&key).ok_or_else(|| Self::not_found(&key, "read"))?;
        Ok(entry.content.clone().with_encoding(options.encoding))
    }

    async fn write(&self, path: &str, content: Content) -> Result<()> {
        let key = self.storage_key(path)?;
        if key.is_empty() {
            return Err(BackendError::WriteFailed {
                path: path.to_string(),
                message: "cannot write to the backend root".to_string(),
            });
        }
        debug!("memory write {key} ({} bytes)", content.len());
        self.store.lock().insert(key, Entry::new(content));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_key = self.storage_key(from)?;
        let to_key = self.storage_key(to)?;
        if to_key.is_empty() {
            return Err(BackendError::WriteFailed {
                path: to.to_string(),
                message: "cannot rename onto the backend root".to_string(),
            });
        }
        let mut store = self.store.lock();
        let entry = store
            .remove(&from_key)
            .ok_or_else(|| Self::not_found(&from_key, "rename"))?;
        store.insert(to_key, entry);
        Ok(())
    }

    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<()> {
        let key = self.storage_key(path)?;
        if key.is_empty() {
            return Err(BackendError::WriteFailed {
                path: path.to_string(),
                message: "refusing to remove the backend root".to_string(),
            });
        }
        let mut store = self.store.lock();

        let removed = if options.recursive {
            let prefix = format!("{key}/");
            let doomed: Vec<String> = store
                .keys()
                .filter(|k| **k == key || k.starts_with(&prefix))
                .cloned()
                .collect();
            for k in &doomed {
                store.remove(k);
            }
            !doomed.is_empty()
        } else {
            store.remove(&key).is_some()
        };

        if !removed && !options.force {
            return Err(Self::not_found(&key, "rm"));
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let key = self.storage_key(path)?;
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };

        let store = self.store.lock();
        let children: BTreeSet<&str> = store
            .keys()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split('/').next())
            .filter(|child| !child.is_empty())
            .collect();
        Ok(children.into_iter().map(str::to_string).collect())
    }

    async fn make_dir(&self, path: &str, _recursive: bool) -> Result<()> {
        // directories are implicit
        self.storage_key(path)?;
        Ok(())
    }

    async fn touch(&self, path: &str) -> Result<()> {
        let key = self.storage_key(path)?;
        if key.is_empty() {
            return Err(BackendError::WriteFailed {
                path: path.to_string(),
                message: "cannot touch the backend root".to_string(),
            });
        }
        let mut store = self.store.lock();
        match store.get_mut(&key) {
            Some(entry) => entry.modified = Utc::now(),
            None => {
                store.insert(key, Entry::new(Content::Text(String::new())));
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.storage_key(path)?;
        Ok(self.store.lock().contains_key(&key))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let key = self.storage_key(path)?;
        let store = self.store.lock();
        let entry = store.get(&key).ok_or_else(|| Self::not_found(&key, "stat"))?;
        Ok(FileStat {
            is_file: true,
            is_directory: false,
            size: entry.content.len() as u64,
            modified: entry.modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn seeded(pairs: &[(&str, &str)]) -> MemoryBackend {
        MemoryBackend::new(MemoryConfig {
            root: "/".to_string(),
            initial_data: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_returns_immediate_children_only() {
        let backend = seeded(&[("dir/a.txt", "x"), ("dir/b/c.txt", "y")]);
        assert_eq!(backend.list("dir").await.unwrap(), vec!["a.txt", "b"]);
        assert_eq!(backend.list("").await.unwrap(), vec!["dir"]);
        assert_eq!(backend.list("dir/b").await.unwrap(), vec!["c.txt"]);
        assert!(backend.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_write_roundtrip_with_encodings() {
        let backend = seeded(&[]);
        backend.write("notes/today.md", Content::from("hello")).await.unwrap();

        let text = backend.read("notes/today.md", ReadOptions::default()).await.unwrap();
        assert_eq!(text, Content::Text("hello".to_string()));

        let bytes = backend
            .read("/notes/today.md", ReadOptions { encoding: Encoding::Binary })
            .await
            .unwrap();
        assert_eq!(bytes, Content::Binary(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let backend = seeded(&[]);
        let err = backend.read("nope", ReadOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
        assert_eq!(err.operand(), Some("nope"));
    }

    #[tokio::test]
    async fn test_execute_not_implemented() {
        let backend = seeded(&[]);
        let err = backend.execute("ls", ExecOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_mutation() {
        let backend = MemoryBackend::new(MemoryConfig {
            root: "/workspace".to_string(),
            initial_data: Default::default(),
        })
        .unwrap();
        let err = backend.write("../escape.txt", Content::from("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathEscape);
        assert!(backend.list_keys(None).is_empty());
    }

    #[tokio::test]
    async fn test_absolute_paths_map_into_root() {
        let backend = MemoryBackend::new(MemoryConfig {
            root: "/workspace".to_string(),
            initial_data: Default::default(),
        })
        .unwrap();
        backend.write("/workspace/a.txt", Content::from("1")).await.unwrap();
        backend.write("/etc/passwd", Content::from("2")).await.unwrap();
        assert_eq!(backend.list_keys(None), vec!["a.txt", "etc/passwd"]);
    }

    #[tokio::test]
    async fn test_recursive_remove_respects_segment_boundaries() {
        let backend = seeded(&[("dir", "file"), ("dir/a", "1"), ("dir/b/c", "2"), ("dirx", "3")]);
        backend
            .remove("dir", RemoveOptions { recursive: true, force: false })
            .await
            .unwrap();
        assert_eq!(backend.list_keys(None), vec!["dirx"]);
    }

    #[tokio::test]
    async fn test_remove_refuses_root() {
        let backend = seeded(&[("a.txt", "1"), ("dir/b", "2")]);
        let everything = RemoveOptions { recursive: true, force: true };
        for root in [".", "", "/"] {
            let err = backend.remove(root, everything).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WriteFailed);
        }
        assert_eq!(backend.list_keys(None), vec!["a.txt", "dir/b"]);
    }

    #[tokio::test]
    async fn test_remove_force_on_missing_never_fails() {
        let backend = seeded(&[]);
        let force = RemoveOptions { recursive: false, force: true };
        for _ in 0..3 {
            backend.remove("ghost", force).await.unwrap();
        }
        let err = backend.remove("ghost", RemoveOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn test_rename_moves_value() {
        let backend = seeded(&[("a.txt", "x")]);
        backend.rename("a.txt", "b/a.txt").await.unwrap();
        assert!(!backend.exists("a.txt").await.unwrap());
        assert!(backend.exists("b/a.txt").await.unwrap());

        let err = backend.rename("a.txt", "c.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn test_touch_and_stat() {
        let backend = seeded(&[("data.bin", "12345")]);
        backend.touch("empty.txt").await.unwrap();
        assert_eq!(backend.stat("empty.txt").await.unwrap().size, 0);

        let stat = backend.stat("data.bin").await.unwrap();
        assert!(stat.is_file);
        assert_eq!(stat.size, 5);

        // touch does not clobber content
        backend.touch("data.bin").await.unwrap();
        assert_eq!(backend.stat("data.bin").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_helpers() {
        let backend = seeded(&[("a/1", "x"), ("a/2", "y"), ("b/1", "z")]);
        assert_eq!(backend.list_keys(Some("a/")), vec!["a/1", "a/2"]);
        backend.delete("a/1").unwrap();
        backend.delete("a/1").unwrap();
        assert_eq!(backend.list_keys(None), vec!["a/2", "b/1"]);
        backend.clear();
        assert!(backend.list_keys(None).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_seed_key_is_config_error() {
        let result = MemoryBackend::new(MemoryConfig {
            root: "/".to_string(),
            initial_data: [("/".to_string(), "x".to_string())].into_iter().collect(),
        });
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidConfiguration));
    }

    #[tokio::test]
    async fn test_destroy_clears_store() {
        let backend = seeded(&[("a", "1")]);
        backend.destroy().await.unwrap();
        assert_eq!(backend.status(), ConnectionStatus::Destroyed);
        assert!(backend.list_keys(None).is_empty());
    }
}
