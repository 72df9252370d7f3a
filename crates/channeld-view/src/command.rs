//! Entity-scoped remote commands routed to the entity's owning channel.

use channeld_net::connection::Connection;
use channeld_net::protocol::{self, BroadcastType, MessageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::entity_map::EntityChannelMap;

/// Why a command was not sent.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// No live link to the hub.
    #[error("command {0} sent without an active connection")]
    NotConnected(u32),

    /// The target requires authority the caller lacks.
    #[error("no authority over entity {entity_id} for command {msg_type}")]
    NoAuthority {
        /// Target entity.
        entity_id: u32,
        /// Command message type.
        msg_type: u32,
    },

    /// The connection has not authenticated yet.
    #[error("command {0} sent before the connection authenticated")]
    NotAuthenticated(u32),

    /// Commands must use an application message type.
    #[error("message type {0} is not in the user-space range")]
    NotUserSpace(u32),

    /// The payload failed to serialize.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// The entity a command acts on.
pub trait CommandTarget {
    /// Entity id used to find the owning channel.
    fn entity_id(&self) -> u32;

    /// Whether the local process may command this entity.
    fn has_authority(&self) -> bool;

    /// Whether this entity is the local player, which may always command it.
    fn is_local_player(&self) -> bool {
        false
    }
}

/// Wire body of an entity command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Entity the command acts on.
    pub entity_id: u32,
    /// Component of the entity that handles the command.
    pub component_index: u8,
    /// Hash identifying the remote function.
    pub function_hash: u32,
    /// Serialized arguments.
    pub payload: Vec<u8>,
}

/// Sends commands to whichever channel owns the target entity right now.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    entities: EntityChannelMap,
}

impl CommandDispatcher {
    /// Route through `entities`, read at send time.
    pub fn new(entities: EntityChannelMap) -> Self {
        Self { entities }
    }

    /// Send `command` for `target`. Returns the channel it was routed to.
    ///
    /// Failed preconditions are logged and returned; nothing is queued.
    pub fn send_command(
        &self,
        conn: &mut Connection,
        target: &dyn CommandTarget,
        msg_type: u32,
        command: &CommandMessage,
        requires_authority: bool,
    ) -> Result<u32, CommandError> {
        self.check(conn, target, msg_type, requires_authority)?;

        let body = protocol::encode_body(command).inspect_err(|e| {
            error!("Failed to encode command {}: {}", msg_type, e);
        })?;
        let channel_id = self.entities.owning_channel(target.entity_id());
        debug!(
            "Routing command {} for entity {} to channel {}",
            msg_type,
            target.entity_id(),
            channel_id
        );
        conn.send_raw(channel_id, msg_type, body, BroadcastType::default());
        Ok(channel_id)
    }

    fn check(
        &self,
        conn: &Connection,
        target: &dyn CommandTarget,
        msg_type: u32,
        requires_authority: bool,
    ) -> Result<(), CommandError> {
        if !conn.is_connected() {
            error!("Command {} called without an active connection", msg_type);
            return Err(CommandError::NotConnected(msg_type));
        }
        if requires_authority && !target.is_local_player() && !target.has_authority() {
            warn!(
                "Trying to send command {} for entity {} without authority",
                msg_type,
                target.entity_id()
            );
            return Err(CommandError::NoAuthority {
                entity_id: target.entity_id(),
                msg_type,
            });
        }
        if !conn.is_authenticated() {
            error!("Send command {} attempted before authentication", msg_type);
            return Err(CommandError::NotAuthenticated(msg_type));
        }
        if !protocol::is_user_space(msg_type) {
            error!("Command message type {} is below the user-space range", msg_type);
            return Err(CommandError::NotUserSpace(msg_type));
        }
        Ok(())
    }
}
