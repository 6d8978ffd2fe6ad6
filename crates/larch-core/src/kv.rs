//! Request and result types for key-value store operations.

use serde::Deserialize;
use serde::Serialize;

use crate::error::KeyValueStoreError;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: u32 = 4096;
/// Maximum value size in bytes.
pub const MAX_VALUE_SIZE: u32 = 4 * 1024 * 1024;

/// A mutation applied by a write request.
///
/// Multi-key variants are applied atomically: either every pair lands or
/// none does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCommand {
    /// Set a single key-value pair.
    Set {
        /// Key to write.
        key: String,
        /// Value to store.
        value: String,
    },
    /// Set multiple key-value pairs atomically.
    SetMulti {
        /// Pairs to write.
        pairs: Vec<(String, String)>,
    },
    /// Delete a single key.
    Delete {
        /// Key to remove.
        key: String,
    },
    /// Delete multiple keys atomically.
    DeleteMulti {
        /// Keys to remove.
        keys: Vec<String>,
    },
}

/// Request to mutate the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRequest {
    /// The mutation to apply.
    pub command: WriteCommand,
}

impl WriteRequest {
    /// Store a single key-value pair.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::Set {
                key: key.into(),
                value: value.into(),
            },
        }
    }

    /// Store multiple pairs atomically.
    pub fn set_multi(pairs: Vec<(String, String)>) -> Self {
        Self {
            command: WriteCommand::SetMulti { pairs },
        }
    }

    /// Delete a single key.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::Delete { key: key.into() },
        }
    }

    /// Delete multiple keys atomically.
    pub fn delete_multi(keys: Vec<String>) -> Self {
        Self {
            command: WriteCommand::DeleteMulti { keys },
        }
    }
}

/// Result of a write operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteResult {
    /// Store revision after the write was applied.
    pub revision: u64,
}

/// A stored entry with its revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: String,
    /// The stored value.
    pub value: String,
    /// Revision of the write that produced this value.
    pub revision: u64,
}

/// Request to read a single key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRequest {
    /// Key to read.
    pub key: String,
}

impl ReadRequest {
    /// Read the given key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Result of a read operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadResult {
    /// The entry, if the key exists.
    pub kv: Option<KeyValue>,
}

/// Request to delete a single key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRequest {
    /// Key to delete.
    pub key: String,
}

impl DeleteRequest {
    /// Delete the given key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Result of a delete operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    /// The key that was targeted.
    pub key: String,
    /// Whether the key existed.
    pub deleted: bool,
}

/// Request to scan keys by prefix, in lexicographic order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRequest {
    /// Key prefix to match.
    pub prefix: String,
    /// Maximum number of entries to return.
    pub limit: Option<u32>,
}

impl ScanRequest {
    /// Scan all keys under the given prefix.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            limit: None,
        }
    }
}

/// Result of a scan operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResult {
    /// Matching entries, ordered by key.
    pub entries: Vec<KeyValue>,
    /// True when the limit cut the result short.
    pub is_truncated: bool,
}

/// Validate a write command against the fixed size limits.
pub fn validate_write_command(command: &WriteCommand) -> Result<(), KeyValueStoreError> {
    let check_key = |key: &str| {
        if key.is_empty() {
            return Err(KeyValueStoreError::EmptyKey);
        }
        if key.len() > MAX_KEY_SIZE as usize {
            return Err(KeyValueStoreError::KeyTooLarge {
                size: key.len() as u32,
                max: MAX_KEY_SIZE,
            });
        }
        Ok(())
    };
    let check_value = |value: &str| {
        if value.len() > MAX_VALUE_SIZE as usize {
            return Err(KeyValueStoreError::ValueTooLarge {
                size: value.len() as u32,
                max: MAX_VALUE_SIZE,
            });
        }
        Ok(())
    };

    match command {
        WriteCommand::Set { key, value } => {
            check_key(key)?;
            check_value(value)
        }
        WriteCommand::SetMulti { pairs } => {
            for (key, value) in pairs {
                check_key(key)?;
                check_value(value)?;
            }
            Ok(())
        }
        WriteCommand::Delete { key } => check_key(key),
        WriteCommand::DeleteMulti { keys } => {
            for key in keys {
                check_key(key)?;
            }
            Ok(())
        }
    }
}
