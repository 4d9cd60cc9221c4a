//! Common types used across storage operations.

use bytes::Bytes;

/// Key-value pair returned from prefix scans.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use edgegate_storage::KeyValue;
///
/// let kv = KeyValue::new(Bytes::from("credentials/dev-1"), Bytes::from("{}"));
/// assert_eq!(kv.key, Bytes::from("credentials/dev-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}
