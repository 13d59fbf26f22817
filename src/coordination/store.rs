use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unreachable: {0}")]
    Unreachable(String),
    #[error("coordination store answered with status {0}")]
    Status(u16),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// A record together with the version it was read at.
///
/// Versions start at 1 for the first write and grow by one per successful write; an absent
/// record behaves like version 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: String,
    pub version: u64,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<VersionedValue>, StoreError>;

    /// Writes `value` if the record is still at `expected`. `Ok(false)` means somebody else
    /// wrote first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: u64,
        value: String,
    ) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct InMemoryStore {
    records: DashMap<String, VersionedValue>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn read(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        Ok(self.records.get(key).map(|record| record.value().clone()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: u64,
        value: String,
    ) -> Result<bool, StoreError> {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().version != expected {
                    return Ok(false);
                }
                entry.insert(VersionedValue {
                    value,
                    version: expected + 1,
                });
                Ok(true)
            }
            Entry::Vacant(entry) => {
                if expected != 0 {
                    return Ok(false);
                }
                entry.insert(VersionedValue { value, version: 1 });
                Ok(true)
            }
        }
    }
}
