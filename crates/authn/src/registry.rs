//! Connection registry contract.

use std::fmt;

use async_trait::async_trait;

use crate::{error::Result, identity::Identity};

/// Opaque handle the transport uses to address one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection the transport currently holds open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnection {
    /// Identity the connection authenticated as.
    pub identity: Identity,
    /// Handle to close it with.
    pub handle: ConnectionHandle,
}

/// The transport's view of open connections.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Lists every connection currently open.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Registry`](crate::AuthError::Registry) if the
    /// listing is unavailable.
    async fn list_open_connections(&self) -> Result<Vec<OpenConnection>>;

    /// Closes a connection.
    ///
    /// Returns `Ok(false)` if the connection was already gone.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Registry`](crate::AuthError::Registry) if the
    /// close could not be issued.
    async fn close(&self, handle: ConnectionHandle) -> Result<bool>;
}
