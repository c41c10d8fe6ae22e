//! Signal types shared by bridges and entities.
//!
//! Two shapes:
//! - **Signal**: an inbound record, decoded from the wire by a bridge.
//! - **Outgoing**: a record an entity hands to its bridge for transmission.

use serde::Serialize;

/// Reserved address of a bridge. Records sent to it are commands for the
/// bridge itself and never reach the wire.
pub const BRIDGE_ADDRESS: &str = "bridge";

/// Command names understood by every participant.
pub mod names {
    /// Terminate the receiver.
    pub const STOP: &str = "stop";
    /// Start a bridge relaying (only meaningful when addressed to a bridge).
    pub const START: &str = "start";
    /// Announced by an entity entering its idle state.
    pub const IDLE: &str = "idle";
    /// Answer to a command the receiver does not understand.
    pub const INVALID_SIGNAL: &str = "invalid signal";
    /// Answer to a record with the wrong shape.
    pub const MALFORMED_SIGNAL: &str = "malformed signal";
    /// Ask the supervisor for its registered operations.
    pub const LIST_OPERATIONS: &str = "lista_operazioni";
    /// Announced by the supervisor once all operations were told to start.
    pub const READY: &str = "ready";

    /// Notices that report status and must never be answered.
    pub fn is_advisory(name: &str) -> bool {
        matches!(name, IDLE | INVALID_SIGNAL | MALFORMED_SIGNAL | READY)
    }
}

/// A decoded signal as delivered to an entity.
///
/// The timestamp is the send time stamped by the transmitting bridge, not the
/// time the originating entity produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub name: String,
    pub sender: String,
    /// Empty means broadcast (or "whoever receives this").
    pub recipient: String,
    pub timestamp: f64,
}

impl Signal {
    pub fn new(
        name: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        timestamp: f64,
    ) -> Self {
        Self {
            name: name.into(),
            sender: sender.into(),
            recipient: recipient.into(),
            timestamp,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_empty()
    }

    pub fn is_stop(&self) -> bool {
        self.name == names::STOP
    }
}

/// A record an entity hands to its bridge.
///
/// `sender` is `None` for an entity speaking for itself: the bridge stamps the
/// owner's identity. A relaying bridge (forward mode) only accepts records
/// carrying an explicit sender, which is how the supervisor speaks on behalf
/// of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outgoing {
    pub name: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl Outgoing {
    /// A record sent in the owner's own name.
    pub fn to(name: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            recipient: recipient.into(),
            sender: None,
        }
    }

    /// A record relayed on behalf of `sender`.
    pub fn relay(
        name: impl Into<String>,
        recipient: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            recipient: recipient.into(),
            sender: Some(sender.into()),
        }
    }

    /// A command for the bridge itself.
    pub fn bridge(command: &str) -> Self {
        Self::to(command, BRIDGE_ADDRESS)
    }

    /// Nothing to send.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.recipient.is_empty()
    }

    pub fn is_for_bridge(&self) -> bool {
        self.recipient == BRIDGE_ADDRESS
    }
}
