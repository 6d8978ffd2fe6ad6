//! Deterministic in-memory key-value store.
//!
//! Backs unit and integration tests across the workspace, and serves as the
//! embedded store for single-process deployments. Behavior is predictable:
//! writes are applied under a single writer lock, revisions increase by one
//! per write request, scans iterate in key order.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::KeyValueStoreError;
use crate::kv::validate_write_command;
use crate::kv::DeleteRequest;
use crate::kv::DeleteResult;
use crate::kv::KeyValue;
use crate::kv::ReadRequest;
use crate::kv::ReadResult;
use crate::kv::ScanRequest;
use crate::kv::ScanResult;
use crate::kv::WriteCommand;
use crate::kv::WriteRequest;
use crate::kv::WriteResult;
use crate::traits::KeyValueStore;

#[derive(Clone)]
struct VersionedValue {
    value: String,
    revision: u64,
}

/// A deterministic in-memory [`KeyValueStore`].
pub struct MemoryKeyValueStore {
    data: RwLock<BTreeMap<String, VersionedValue>>,
    revision: RwLock<u64>,
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            revision: RwLock::new(0),
        }
    }
}

impl MemoryKeyValueStore {
    /// Create a new store wrapped in `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn next_revision(&self) -> u64 {
        let mut rev = self.revision.write().await;
        *rev += 1;
        *rev
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        validate_write_command(&request.command)?;
        let revision = self.next_revision().await;
        let mut data = self.data.write().await;

        match request.command {
            WriteCommand::Set { key, value } => {
                data.insert(key, VersionedValue { value, revision });
            }
            WriteCommand::SetMulti { pairs } => {
                for (key, value) in pairs {
                    data.insert(key, VersionedValue { value, revision });
                }
            }
            WriteCommand::Delete { key } => {
                data.remove(&key);
            }
            WriteCommand::DeleteMulti { keys } => {
                for key in &keys {
                    data.remove(key);
                }
            }
        }

        Ok(WriteResult { revision })
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        let data = self.data.read().await;
        Ok(ReadResult {
            kv: data.get(&request.key).map(|versioned| KeyValue {
                key: request.key.clone(),
                value: versioned.value.clone(),
                revision: versioned.revision,
            }),
        })
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        let mut data = self.data.write().await;
        let deleted = data.remove(&request.key).is_some();
        Ok(DeleteResult {
            key: request.key,
            deleted,
        })
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        let data = self.data.read().await;
        let limit = request.limit.map(|l| l as usize).unwrap_or(usize::MAX);

        let mut entries = Vec::new();
        let mut is_truncated = false;
        for (key, versioned) in data.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            if entries.len() == limit {
                is_truncated = true;
                break;
            }
            entries.push(KeyValue {
                key: key.clone(),
                value: versioned.value.clone(),
                revision: versioned.revision,
            });
        }

        Ok(ScanResult { entries, is_truncated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_returns_last_committed_write() {
        let store = MemoryKeyValueStore::new();
        store.write(WriteRequest::set("a", "1")).await.unwrap();
        store.write(WriteRequest::set("a", "2")).await.unwrap();

        let result = store.read(ReadRequest::new("a")).await.unwrap();
        assert_eq!(result.kv.unwrap().value, "2");
    }

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let store = MemoryKeyValueStore::new();
        let result = store.read(ReadRequest::new("missing")).await.unwrap();
        assert!(result.kv.is_none());
    }

    #[tokio::test]
    async fn multi_write_lands_all_pairs_with_one_revision() {
        let store = MemoryKeyValueStore::new();
        let pairs = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        let write = store.write(WriteRequest::set_multi(pairs)).await.unwrap();

        let a = store.read(ReadRequest::new("a")).await.unwrap().kv.unwrap();
        let b = store.read(ReadRequest::new("b")).await.unwrap().kv.unwrap();
        assert_eq!(a.revision, write.revision);
        assert_eq!(b.revision, write.revision);
    }

    #[tokio::test]
    async fn scan_is_prefix_bounded_and_ordered() {
        let store = MemoryKeyValueStore::new();
        store.write(WriteRequest::set("runs/a/1", "x")).await.unwrap();
        store.write(WriteRequest::set("runs/a/2", "y")).await.unwrap();
        store.write(WriteRequest::set("runs/b/1", "z")).await.unwrap();

        let result = store.scan(ScanRequest::prefix("runs/a/")).await.unwrap();
        let keys: Vec<_> = result.entries.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["runs/a/1", "runs/a/2"]);
        assert!(!result.is_truncated);
    }

    #[tokio::test]
    async fn scan_respects_limit() {
        let store = MemoryKeyValueStore::new();
        for i in 0..5 {
            store.write(WriteRequest::set(format!("k/{i}"), "v")).await.unwrap();
        }

        let result = store
            .scan(ScanRequest {
                prefix: "k/".to_string(),
                limit: Some(3),
            })
            .await
            .unwrap();
        assert_eq!(result.entries.len(), 3);
        assert!(result.is_truncated);
    }

    #[tokio::test]
    async fn delete_multi_removes_all_keys() {
        let store = MemoryKeyValueStore::new();
        store.write(WriteRequest::set("a", "1")).await.unwrap();
        store.write(WriteRequest::set("b", "2")).await.unwrap();

        store
            .write(WriteRequest::delete_multi(vec!["a".to_string(), "b".to_string()]))
            .await
            .unwrap();

        assert!(store.read(ReadRequest::new("a")).await.unwrap().kv.is_none());
        assert!(store.read(ReadRequest::new("b")).await.unwrap().kv.is_none());
    }
}
