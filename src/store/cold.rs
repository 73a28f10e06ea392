//! Cold tier: durable object store of full-overwrite JSON collections
//!
//! Objects are addressed by slash-separated paths (`readings/2024-03-01/10.json`).
//! Reads of absent objects return `Ok(None)`; callers treat that as an empty
//! collection. Writes replace the whole object and may be conditional on the
//! etag observed by the preceding read, which closes the lost-update race
//! between two archival runs targeting the same path.

use super::StoreError;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// Object body plus the etag a conditional write must match
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    Unconditional,
    /// Fail if any object already exists at the path
    IfAbsent,
    /// Fail unless the current object carries this etag
    IfMatch(String),
}

#[async_trait]
pub trait ColdStore: Send + Sync {
    async fn get_object(&self, path: &str) -> Result<Option<StoredObject>, StoreError>;

    /// Replace the object at `path`; returns the new etag
    async fn put_object(
        &self,
        path: &str,
        body: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<String, StoreError>;

    /// Paths of all objects whose path starts with `prefix`, sorted
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn backend_type(&self) -> &'static str;
}

/// Content etag for an object body
pub fn compute_etag(body: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("{:016x}-{}", hasher.finish(), body.len())
}

fn check_condition(path: &str, current: Option<&str>, condition: &WriteCondition) -> Result<(), StoreError> {
    match (condition, current) {
        (WriteCondition::Unconditional, _) => Ok(()),
        (WriteCondition::IfAbsent, None) => Ok(()),
        (WriteCondition::IfAbsent, Some(_)) => Err(StoreError::PreconditionFailed(format!(
            "{} was created by another writer",
            path
        ))),
        (WriteCondition::IfMatch(expected), Some(actual)) if expected == actual => Ok(()),
        (WriteCondition::IfMatch(_), _) => Err(StoreError::PreconditionFailed(format!(
            "{} changed since it was read",
            path
        ))),
    }
}

/// Filesystem-backed object store rooted at a directory
///
/// Writes go to a sibling temp file and are renamed into place, so readers
/// never observe a half-written object.
pub struct FsColdStore {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FsColdStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        log::info!("✅ Cold store rooted at {}", root.display());
        Ok(Self {
            root,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if path.is_empty() || !safe {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid object path: {}", path),
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn read_current(&self, full: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(full).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[async_trait]
impl ColdStore for FsColdStore {
    async fn get_object(&self, path: &str) -> Result<Option<StoredObject>, StoreError> {
        let full = self.resolve(path)?;
        Ok(self.read_current(&full).await?.map(|body| StoredObject {
            etag: compute_etag(&body),
            body,
        }))
    }

    async fn put_object(
        &self,
        path: &str,
        body: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<String, StoreError> {
        let full = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read_current(&full).await?;
        let current_etag = current.as_deref().map(compute_etag);
        check_condition(path, current_etag.as_deref(), &condition)?;

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let etag = compute_etag(&body);
        let mut tmp = full.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &full).await?;

        log::debug!("💾 Wrote cold object {} ({} bytes)", path, body.len());
        Ok(etag)
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let start = match prefix.rfind('/') {
            Some(idx) => self.resolve(&prefix[..idx])?,
            None => self.root.clone(),
        };

        let mut found = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Io(e)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        found.push(key);
                    }
                }
            }
        }

        found.sort();
        Ok(found)
    }

    fn backend_type(&self) -> &'static str {
        "filesystem"
    }
}

/// In-process object store for tests
#[derive(Default)]
pub struct MemoryColdStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryColdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn poisoned() -> StoreError {
        StoreError::Database("memory cold store lock poisoned".to_string())
    }
}

#[async_trait]
impl ColdStore for MemoryColdStore {
    async fn get_object(&self, path: &str) -> Result<Option<StoredObject>, StoreError> {
        let objects = self.objects.lock().map_err(|_| Self::poisoned())?;
        Ok(objects.get(path).cloned())
    }

    async fn put_object(
        &self,
        path: &str,
        body: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<String, StoreError> {
        let mut objects = self.objects.lock().map_err(|_| Self::poisoned())?;
        let current = objects.get(path).map(|obj| obj.etag.as_str());
        check_condition(path, current, &condition)?;

        let etag = compute_etag(&body);
        objects.insert(
            path.to_string(),
            StoredObject {
                body,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.lock().map_err(|_| Self::poisoned())?;
        Ok(objects
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
