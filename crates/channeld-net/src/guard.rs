//! At most one live connection per process role.
//!
//! [`ConnectionFactory`] hands out [`Connection`]s holding a [`RoleGuard`]; the
//! role slot is released when the connection is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::connection::{Connection, ConnectionConfig};
use crate::protocol::ConnectionType;

/// Errors raised when creating a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A connection for this role is already alive.
    #[error("a {0:?} connection already exists in this process")]
    AlreadyExists(ConnectionType),

    /// The role is not one a connection can play.
    #[error("invalid connection role {0:?}")]
    InvalidRole(ConnectionType),
}

fn slot_index(role: ConnectionType) -> Result<usize, SessionError> {
    match role {
        ConnectionType::Server => Ok(0),
        ConnectionType::Client => Ok(1),
        ConnectionType::NoConnection => Err(SessionError::InvalidRole(role)),
    }
}

/// Creates connections, refusing a second live one for the same role.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFactory {
    slots: Arc<[AtomicBool; 2]>,
}

impl ConnectionFactory {
    /// Create an independent factory (mainly for tests and embedding).
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide factory.
    pub fn global() -> &'static ConnectionFactory {
        static GLOBAL: OnceLock<ConnectionFactory> = OnceLock::new();
        GLOBAL.get_or_init(ConnectionFactory::new)
    }

    /// Reserve the slot for `role`.
    pub fn acquire(&self, role: ConnectionType) -> Result<RoleGuard, SessionError> {
        let index = slot_index(role)?;
        self.slots[index]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::AlreadyExists(role))?;
        Ok(RoleGuard {
            slots: Arc::clone(&self.slots),
            index,
            role,
        })
    }

    /// Whether a live connection holds the slot for `role`.
    pub fn is_taken(&self, role: ConnectionType) -> bool {
        slot_index(role).is_ok_and(|index| self.slots[index].load(Ordering::Acquire))
    }

    /// Create the connection for `role`.
    pub fn create(
        &self,
        role: ConnectionType,
        config: ConnectionConfig,
    ) -> Result<Connection, SessionError> {
        let guard = self.acquire(role)?;
        Ok(Connection::new(guard, config))
    }
}

/// Holds a role slot; releases it on drop.
#[derive(Debug)]
pub struct RoleGuard {
    slots: Arc<[AtomicBool; 2]>,
    index: usize,
    role: ConnectionType,
}

impl RoleGuard {
    /// The role this guard reserves.
    pub fn role(&self) -> ConnectionType {
        self.role
    }
}

impl Drop for RoleGuard {
    fn drop(&mut self) {
        self.slots[self.index].store(false, Ordering::Release);
    }
}
