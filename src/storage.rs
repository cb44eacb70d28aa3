//! File-backed snapshot stores and the directory layout they share.
//!
//! Every checkpoint is one pretty-printed JSON file, written to a `.tmp`
//! sibling and renamed into place so a crash never leaves a torn file.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;

use crate::aggregate::AggregateId;
use crate::error::StoreError;
use crate::ports::{ObserverSnapshotStore, SnapshotStore};
use crate::snapshot::{ObserverSnapshot, Snapshot};

/// Manages the on-disk directory layout for checkpoints.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     snapshots/
///         <aggregate_type>/
///             <state_id>.json
///     observers/
///         <observer_name>/
///             <state_id>.json
/// ```
///
/// `StorageLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_dir: PathBuf,
}

impl StorageLayout {
    /// The directory does not need to exist yet; it is created on the
    /// first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/snapshots/<aggregate_type>`
    pub fn snapshots_dir(&self, aggregate_type: &str) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(file_stem(aggregate_type))
    }

    /// `<base_dir>/observers/<observer_name>`
    pub fn observers_dir(&self, observer_name: &str) -> PathBuf {
        self.base_dir
            .join("observers")
            .join(file_stem(observer_name))
    }
}

/// File name for a key's checkpoint.
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-escaped, so distinct keys
/// never share a file.
fn file_stem(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn checkpoint_path(dir: &Path, key: &impl std::fmt::Display) -> PathBuf {
    dir.join(format!("{}.json", file_stem(&key.to_string())))
}

/// Atomically write `value` as JSON to `path`.
fn save_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a checkpoint from disk.
///
/// Returns `Ok(None)` if the file does not exist or is corrupt. A corrupt
/// checkpoint is not a hard error: the grain rebuilds by replay.
fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt checkpoint, will rebuild"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Latest aggregate snapshots, one JSON file per aggregate.
///
/// Partial updates read, modify and rewrite the file under a store-wide
/// lock; they are a no-op when no snapshot exists yet.
pub struct FileSnapshotStore<K, S> {
    dir: PathBuf,
    lock: Mutex<()>,
    _types: PhantomData<fn() -> (K, S)>,
}

impl<K: AggregateId, S> FileSnapshotStore<K, S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(layout: &StorageLayout, aggregate_type: &str) -> Self {
        Self {
            dir: layout.snapshots_dir(aggregate_type),
            lock: Mutex::new(()),
            _types: PhantomData,
        }
    }

    fn path(&self, state_id: &K) -> PathBuf {
        checkpoint_path(&self.dir, state_id)
    }

    async fn modify(
        &self,
        state_id: &K,
        f: impl FnOnce(&mut Snapshot<K, S>) + Send,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.path(state_id);
        if let Some(mut snapshot) = load_json::<Snapshot<K, S>>(&path)? {
            f(&mut snapshot);
            save_json(&path, &snapshot)?;
        }
        Ok(())
    }
}

impl<K, S> std::fmt::Debug for FileSnapshotStore<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSnapshotStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: AggregateId, S> SnapshotStore<K, S> for FileSnapshotStore<K, S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, state_id: &K) -> Result<Option<Snapshot<K, S>>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(load_json(&self.path(state_id))?)
    }

    async fn insert(&self, snapshot: &Snapshot<K, S>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        save_json(&self.path(&snapshot.base.state_id), snapshot)?;
        Ok(())
    }

    async fn update(&self, snapshot: &Snapshot<K, S>) -> Result<(), StoreError> {
        self.insert(snapshot).await
    }

    async fn delete(&self, state_id: &K) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        remove_file(&self.path(state_id))?;
        Ok(())
    }

    async fn over(&self, state_id: &K, is_over: bool) -> Result<(), StoreError> {
        self.modify(state_id, |s| s.base.is_over = is_over).await
    }

    async fn update_is_latest(&self, state_id: &K, is_latest: bool) -> Result<(), StoreError> {
        self.modify(state_id, |s| s.base.is_latest = is_latest)
            .await
    }

    async fn update_latest_min_event_timestamp(
        &self,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        self.modify(state_id, |s| s.base.latest_min_event_timestamp = timestamp)
            .await
    }

    async fn update_start_timestamp(
        &self,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        self.modify(state_id, |s| s.base.start_timestamp = timestamp)
            .await
    }
}

/// Observer checkpoints under `observers/<name>/<state_id>.json`.
pub struct FileObserverSnapshotStore<K> {
    layout: StorageLayout,
    lock: Mutex<()>,
    _key: PhantomData<fn() -> K>,
}

impl<K: AggregateId> FileObserverSnapshotStore<K> {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            lock: Mutex::new(()),
            _key: PhantomData,
        }
    }

    fn path(&self, name: &str, state_id: &K) -> PathBuf {
        checkpoint_path(&self.layout.observers_dir(name), state_id)
    }
}

impl<K> std::fmt::Debug for FileObserverSnapshotStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileObserverSnapshotStore")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: AggregateId> ObserverSnapshotStore<K> for FileObserverSnapshotStore<K> {
    async fn get(
        &self,
        name: &str,
        state_id: &K,
    ) -> Result<Option<ObserverSnapshot<K>>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(load_json(&self.path(name, state_id))?)
    }

    async fn insert(&self, name: &str, snapshot: &ObserverSnapshot<K>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        save_json(&self.path(name, &snapshot.state_id), snapshot)?;
        Ok(())
    }

    async fn update(&self, name: &str, snapshot: &ObserverSnapshot<K>) -> Result<(), StoreError> {
        self.insert(name, snapshot).await
    }

    async fn update_start_timestamp(
        &self,
        name: &str,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.path(name, state_id);
        if let Some(mut snapshot) = load_json::<ObserverSnapshot<K>>(&path)? {
            snapshot.start_timestamp = timestamp;
            save_json(&path, &snapshot)?;
        }
        Ok(())
    }

    async fn delete(&self, name: &str, state_id: &K) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        remove_file(&self.path(name, state_id))?;
        Ok(())
    }
}
