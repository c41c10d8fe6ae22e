//! Bridge between an entity and the outside world.
//!
//! Every entity owns exactly one bridge. The bridge holds two channel pairs:
//!
//! - **external** (wire strings): inbound from and outbound to whoever the
//!   entity is connected to (the supervisor, or the process boundary)
//! - **internal** (structured records): inbound to and outbound from the
//!   owning entity
//!
//! The bridge relays in both directions: external wire signals are decoded,
//! optionally filtered by recipient, and handed to the entity; records from the
//! entity are encoded, stamped and pushed to the external outbound queue.
//! Malformed input is dropped. Full queues drop the newest item.
//!
//! # Modes
//!
//! - `filter_by_recipient`: only accept signals addressed to the owner or
//!   broadcast
//! - `forward`: outbound records carry an explicit sender (relaying on behalf
//!   of another entity)

pub mod codec;
pub mod protocol;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;

use crate::channel::{Offer, QueueError, queue};
use protocol::{BRIDGE_ADDRESS, Outgoing, Signal, names};

/// How a bridge treats traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeMode {
    pub filter_by_recipient: bool,
    pub forward: bool,
}

impl BridgeMode {
    /// Bridge of an operation: sees only its own and broadcast traffic.
    pub const fn operation() -> Self {
        Self {
            filter_by_recipient: true,
            forward: false,
        }
    }

    /// The supervisor's own bridge: sees everything so the supervisor can route.
    pub const fn supervisor() -> Self {
        Self {
            filter_by_recipient: false,
            forward: false,
        }
    }

    /// Per-operation relay owned by the supervisor.
    pub const fn relay() -> Self {
        Self {
            filter_by_recipient: false,
            forward: true,
        }
    }
}

/// Why a bridge loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The owning entity sent `stop` to its bridge.
    Stopped,
    /// A `stop` addressed to the bridge arrived on the external inbound queue.
    RemoteStop,
    /// The owning entity went away (internal outbound queue closed).
    Detached,
}

impl BridgeExit {
    pub fn code(&self) -> i32 {
        match self {
            Self::Stopped => -1,
            Self::RemoteStop => -2,
            Self::Detached => -3,
        }
    }
}

/// External channel pair as seen by one side of a link.
pub struct ExternalPair {
    pub inbound: Receiver<String>,
    pub outbound: Sender<String>,
}

/// Create a bidirectional wire link between two sides.
///
/// What one side pushes on its `outbound` arrives on the other side's
/// `inbound`.
pub fn link(capacity: usize) -> (ExternalPair, ExternalPair) {
    let (a_tx, a_rx) = queue(capacity);
    let (b_tx, b_rx) = queue(capacity);
    (
        ExternalPair {
            inbound: b_rx,
            outbound: a_tx,
        },
        ExternalPair {
            inbound: a_rx,
            outbound: b_tx,
        },
    )
}

/// Entity-facing ends of a bridge's internal channel pair.
pub struct InternalPair {
    /// Decoded signals for the entity.
    pub inbound: Receiver<Signal>,
    /// Records from the entity to transmit.
    pub outbound: Sender<Outgoing>,
}

pub struct Bridge {
    owner: String,
    mode: BridgeMode,
    external: ExternalPair,
    to_entity: Sender<Signal>,
    from_entity: Receiver<Outgoing>,
}

/// Result of relaying one item.
enum Relay {
    Continue,
    Exit(BridgeExit),
}

impl Bridge {
    /// Create a bridge for `owner` and the internal pair its entity talks to.
    pub fn new(
        owner: impl Into<String>,
        mode: BridgeMode,
        external: ExternalPair,
        capacity: usize,
    ) -> (Self, InternalPair) {
        let (to_entity, inbound) = queue(capacity);
        let (outbound, from_entity) = queue(capacity);
        let bridge = Self {
            owner: owner.into(),
            mode,
            external,
            to_entity,
            from_entity,
        };
        (bridge, InternalPair { inbound, outbound })
    }

    pub fn spawn(self) -> JoinHandle<BridgeExit> {
        tokio::spawn(self.run())
    }

    /// Wait for the start command, then relay until stopped.
    pub async fn run(mut self) -> BridgeExit {
        tracing::debug!(bridge = %self.owner, mode = ?self.mode, "Bridge idle");
        let exit = match self.idle().await {
            Some(exit) => exit,
            None => {
                tracing::debug!(bridge = %self.owner, "Bridge started");
                self.relay().await
            }
        };
        tracing::info!(bridge = %self.owner, ?exit, "Bridge exiting");
        exit
    }

    /// Returns `None` once started, or the exit reason if stopped before that.
    async fn idle(&mut self) -> Option<BridgeExit> {
        loop {
            let Some(record) = self.from_entity.recv().await else {
                return Some(BridgeExit::Detached);
            };
            if record.is_for_bridge() {
                match record.name.as_str() {
                    names::START => return None,
                    names::STOP => return Some(BridgeExit::Stopped),
                    _ => {}
                }
            }
            tracing::debug!(bridge = %self.owner, ?record, "Bridge not started, dropping record");
        }
    }

    async fn relay(&mut self) -> BridgeExit {
        let mut inbound_open = true;
        loop {
            let step = tokio::select! {
                wire = self.external.inbound.recv(), if inbound_open => match wire {
                    Some(wire) => self.handle_inbound(&wire),
                    None => {
                        tracing::debug!(bridge = %self.owner, "External inbound closed");
                        inbound_open = false;
                        Relay::Continue
                    }
                },
                record = self.from_entity.recv() => match record {
                    Some(record) => self.handle_outbound(record),
                    None => Relay::Exit(BridgeExit::Detached),
                },
            };
            if let Relay::Exit(exit) = step {
                return exit;
            }
        }
    }

    fn handle_inbound(&self, wire: &str) -> Relay {
        let signal = match codec::decode(wire) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(bridge = %self.owner, %wire, error = %e, "Dropping malformed signal");
                return Relay::Continue;
            }
        };

        if signal.recipient == BRIDGE_ADDRESS {
            if signal.is_stop() {
                return Relay::Exit(BridgeExit::RemoteStop);
            }
            tracing::debug!(bridge = %self.owner, signal = %signal.name, "Ignoring bridge command");
            return Relay::Continue;
        }

        if self.mode.filter_by_recipient
            && !signal.is_broadcast()
            && signal.recipient != self.owner
        {
            tracing::trace!(bridge = %self.owner, recipient = %signal.recipient, "Not ours, dropping");
            return Relay::Continue;
        }

        tracing::trace!(bridge = %self.owner, signal = %signal.name, sender = %signal.sender, "Inbound");
        match self.to_entity.offer(signal) {
            Ok(()) => Relay::Continue,
            Err(QueueError::Full) => {
                tracing::warn!(bridge = %self.owner, %wire, "Entity inbound queue full, dropping");
                Relay::Continue
            }
            Err(QueueError::Closed) => Relay::Exit(BridgeExit::Detached),
        }
    }

    fn handle_outbound(&self, record: Outgoing) -> Relay {
        if record.is_for_bridge() {
            if record.name == names::STOP {
                return Relay::Exit(BridgeExit::Stopped);
            }
            tracing::debug!(bridge = %self.owner, signal = %record.name, "Ignoring bridge command");
            return Relay::Continue;
        }

        // Nothing to send. A relay never forwards a nameless record.
        if record.is_empty() || (self.mode.forward && record.name.is_empty()) {
            return Relay::Continue;
        }

        let sender = match (self.mode.forward, record.sender.as_deref()) {
            (false, None) => self.owner.as_str(),
            (true, Some(sender)) => sender,
            (forward, _) => {
                tracing::warn!(bridge = %self.owner, forward, ?record, "Record shape does not match bridge mode, dropping");
                return Relay::Continue;
            }
        };

        if record.recipient == self.owner {
            tracing::trace!(bridge = %self.owner, signal = %record.name, "Self-addressed, dropping");
            return Relay::Continue;
        }

        let signal = Signal::new(record.name, sender, record.recipient, 0.0);
        let wire = codec::encode(&signal);
        tracing::trace!(bridge = %self.owner, %wire, "Outbound");
        match self.external.outbound.offer(wire) {
            Ok(()) => {}
            Err(QueueError::Full) => {
                tracing::warn!(bridge = %self.owner, signal = %signal.name, "External outbound queue full, dropping");
            }
            Err(QueueError::Closed) => {
                tracing::debug!(bridge = %self.owner, signal = %signal.name, "External outbound closed, dropping");
            }
        }
        Relay::Continue
    }
}
