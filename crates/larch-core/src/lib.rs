//! Key-value storage primitives for the larch platform.
//!
//! This crate defines the [`KeyValueStore`] trait that every durable larch
//! component is written against, together with the request and result types
//! of its four operations (read, write, delete, scan) and a deterministic
//! in-memory implementation for tests and embedded use.
//!
//! Values are strings (typically JSON documents); interpretation is left to
//! the layers above. The store guarantees that a read of a key observes the
//! last committed write to that same key. It does not provide cross-key
//! atomicity beyond multi-key write commands; callers serialize conflicting
//! writers themselves.

#![warn(missing_docs)]

pub mod error;
pub mod kv;
pub mod memory;
pub mod traits;

pub use error::KeyValueStoreError;
pub use kv::DeleteRequest;
pub use kv::DeleteResult;
pub use kv::KeyValue;
pub use kv::ReadRequest;
pub use kv::ReadResult;
pub use kv::ScanRequest;
pub use kv::ScanResult;
pub use kv::WriteCommand;
pub use kv::WriteRequest;
pub use kv::WriteResult;
pub use memory::MemoryKeyValueStore;
pub use traits::KeyValueStore;
