//! Error types for key-value store operations.

use snafu::Snafu;

/// Errors returned by [`crate::KeyValueStore`] implementations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum KeyValueStoreError {
    /// A key was empty.
    #[snafu(display("key must not be empty"))]
    EmptyKey,

    /// A key exceeded the maximum size.
    #[snafu(display("key too large: {size} bytes (max: {max})"))]
    KeyTooLarge {
        /// Actual size.
        size: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// A value exceeded the maximum size.
    #[snafu(display("value too large: {size} bytes (max: {max})"))]
    ValueTooLarge {
        /// Actual size.
        size: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// The backing store rejected or failed the operation.
    #[snafu(display("storage backend error: {message}"))]
    Backend {
        /// Description from the backend.
        message: String,
    },
}
