//! Display metadata (company name, contact channels) attached to summaries

use super::types::Contact;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub entity_id: String,
    pub company_name: String,
    pub category: Option<String>,
    pub contact: Contact,
}

/// Enrichment lookup used when building aggregate and delta records
///
/// Not required for correctness: a missing entry only leaves
/// `company_name` unset on the output record.
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    async fn lookup(&self, entity_id: &str) -> Option<DirectoryEntry>;

    /// Learn from an accepted reading; providers backed by an external
    /// system ignore this
    fn observe(&self, _entry: DirectoryEntry) {}
}

/// Directory that learns entries from the readings it observes
#[derive(Default)]
pub struct MemoryDirectory {
    entries: RwLock<HashMap<String, DirectoryEntry>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DirectoryProvider for MemoryDirectory {
    async fn lookup(&self, entity_id: &str) -> Option<DirectoryEntry> {
        self.entries.read().ok()?.get(entity_id).cloned()
    }

    fn observe(&self, entry: DirectoryEntry) {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(entry.entity_id.clone(), entry);
            }
            Err(_) => log::warn!("⚠️  Directory lock poisoned, entry for {} dropped", entry.entity_id),
        }
    }
}
