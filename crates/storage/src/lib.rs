//! Keyed byte storage for the edge gateway trust core.
//!
//! This crate provides the [`StorageBackend`] trait and the decorators the
//! credentials cache is composed from. Composition happens once, at startup:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Credentials Cache                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │              EncryptedBackend (optional)                    │
//! │        AES-256-GCM, key provisioned once at startup         │
//! ├──────────────┬──────────────────┬───────────────────────────┤
//! │ NullBackend  │  MemoryBackend   │   persistent engine       │
//! │ (disabled)   │ (fallback/tests) │   (external collaborator) │
//! └──────────────┴──────────────────┴───────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use edgegate_storage::{EncryptedBackend, EncryptionKey, MemoryBackend, StorageBackend};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = MemoryBackend::new();
//!     let store = EncryptedBackend::new(engine, &EncryptionKey::generate())?;
//!
//!     store.set(b"credentials/device-1".to_vec(), b"proof".to_vec()).await?;
//!     let value = store.get(b"credentials/device-1").await?;
//!     assert_eq!(value.as_deref(), Some(&b"proof"[..]));
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with a switchable failing backend.

#![deny(unsafe_code)]

pub mod backend;
pub mod encrypted;
pub mod error;
pub mod key_provider;
pub mod memory;
pub mod null;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use backend::StorageBackend;
pub use encrypted::EncryptedBackend;
pub use error::{ConfigError, StorageError, StorageResult};
pub use key_provider::{ENCRYPTION_KEY_LEN, EncryptionKey, EncryptionKeyProvider, StaticKeyProvider};
pub use memory::MemoryBackend;
pub use null::NullBackend;
pub use types::KeyValue;
