//! Pipeline manager - the supervising entity.
//!
//! Star topology, every edge a wire link:
//!
//! ```text
//!   outside ⟷ own bridge ⟷ manager ⟷ relay bridge(i) ⟷ operation(i) bridge ⟷ operation(i)
//! ```
//!
//! The manager holds one relay bridge per operation, keyed by identity. All
//! cross-references go through that map; nothing points back at the manager.
//!
//! Routing (one record per source per tick):
//! - from outside: `stop` ends the pipeline, self-addressed commands are
//!   answered, unicast goes to the named operation, broadcast goes to all
//! - from an operation: self-addressed commands are answered, unicast goes to
//!   the named operation, broadcast goes to every other operation

use indexmap::IndexMap;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use async_trait::async_trait;

use crate::bridge::protocol::{BRIDGE_ADDRESS, Outgoing, Signal, names};
use crate::bridge::{Bridge, BridgeExit, BridgeMode, ExternalPair, link};
use crate::channel::{Offer, Poll, QueueError};
use crate::config::{Declaration, ManagerConfig};
use crate::entity::{
    self, BridgeClosed, Command, Context, Entity, EntityHandle, Joined, Prepared, SHUTDOWN,
    State, Transition,
};
use crate::registry::{OperationArgs, OperationRegistry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("operation declared twice: {0}")]
    Duplicate(String),
    #[error("reserved identity cannot be an operation: {0}")]
    Reserved(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One registered operation as the manager sees it.
struct OperationSlot {
    /// Signals the operation sent, decoded by its relay bridge.
    inbox: Receiver<Signal>,
    /// Records for the operation, encoded by its relay bridge.
    outbox: Sender<Outgoing>,
    relay: JoinHandle<BridgeExit>,
    handle: Option<EntityHandle>,
    /// Set once shutdown joined the operation.
    joined: Option<Joined>,
    /// Set once shutdown joined the relay bridge.
    relay_exit: Option<BridgeExit>,
    /// Relay bridge still delivering.
    live: bool,
    /// Run loop ended (logged once).
    finished: bool,
}

impl OperationSlot {
    fn deliver(&self, identity: &str, record: Outgoing) {
        match self.outbox.offer(record) {
            Ok(()) => {}
            Err(QueueError::Full) => {
                tracing::warn!(operation = %identity, "Relay queue full, dropping signal");
            }
            Err(QueueError::Closed) => {
                tracing::debug!(operation = %identity, "Relay gone, dropping signal");
            }
        }
    }
}

/// Outcome of routing one record from an operation.
enum Flow {
    Continue,
    /// Shutdown requested; stop draining this tick.
    Halt,
}

pub struct PipelineManager {
    config: ManagerConfig,
    operations: IndexMap<String, OperationSlot>,
    signals: Vec<String>,
    shutdown_requested: bool,
}

impl PipelineManager {
    /// Resolve, wire up and start every declared operation.
    ///
    /// Every identity is resolved before anything is spawned, so an unknown
    /// operation aborts construction with nothing running.
    pub fn build(
        config: ManagerConfig,
        declarations: &[Declaration],
        registry: &OperationRegistry,
    ) -> Result<Self, ManagerError> {
        let mut identities: Vec<&str> = Vec::new();
        let mut signals = Vec::new();
        for declaration in declarations {
            match declaration {
                Declaration::Operation(identity) => {
                    if identity == &config.identity || identity == BRIDGE_ADDRESS {
                        return Err(ManagerError::Reserved(identity.clone()));
                    }
                    if identities.contains(&identity.as_str()) {
                        return Err(ManagerError::Duplicate(identity.clone()));
                    }
                    identities.push(identity);
                }
                Declaration::Signal(name) => signals.push(name.clone()),
            }
        }

        // Resolve all before constructing any.
        for identity in &identities {
            registry.resolve(identity)?;
        }

        let tuning = config.tuning();
        let mut operations = IndexMap::with_capacity(identities.len());
        let mut pending = Vec::with_capacity(identities.len());

        for identity in identities {
            let args = OperationArgs {
                identity: identity.to_string(),
                config_path: config.operation_config_path(identity),
            };
            let operation = registry.construct(&args)?;

            let (operation_side, manager_side) = link(tuning.capacity);
            let (relay, internal) = Bridge::new(
                config.identity.clone(),
                BridgeMode::relay(),
                manager_side,
                tuning.capacity,
            );
            let relay = relay.spawn();
            let slot = OperationSlot {
                inbox: internal.inbound,
                outbox: internal.outbound,
                relay,
                handle: None,
                joined: None,
                relay_exit: None,
                live: true,
                finished: false,
            };
            slot.deliver(identity, Outgoing::bridge(names::START));

            pending.push(Prepared::new(
                identity,
                operation,
                operation_side,
                BridgeMode::operation(),
                tuning,
            ));
            operations.insert(identity.to_string(), slot);
            tracing::info!(operation = %identity, "Registered operation");
        }

        for prepared in pending {
            let handle = prepared.start();
            if let Some(slot) = operations.get_mut(handle.identity()) {
                slot.handle = Some(handle);
            }
        }

        tracing::info!(
            manager = %config.identity,
            operations = operations.len(),
            signals = signals.len(),
            "Pipeline built"
        );

        Ok(Self {
            config,
            operations,
            signals,
            shutdown_requested: false,
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Registered operation identities, in registration order.
    pub fn operations(&self) -> Vec<&str> {
        self.operations.keys().map(String::as_str).collect()
    }

    /// Signal names the manager was configured to emit.
    pub fn signals(&self) -> &[String] {
        &self.signals
    }

    /// Give the manager its own bridge over `external` and start it.
    pub fn spawn(self, external: ExternalPair) -> EntityHandle {
        let identity = self.config.identity.clone();
        let tuning = self.config.tuning();
        entity::spawn(
            identity,
            Box::new(self),
            external,
            BridgeMode::supervisor(),
            tuning,
        )
    }

    fn operation_list(&self) -> String {
        self.operations().join(",")
    }

    /// Route one signal that arrived from outside the pipeline.
    fn route_external(&mut self, ctx: &Context, signal: Signal) {
        if signal.is_stop() {
            tracing::info!(sender = %signal.sender, "Stop requested");
            self.shutdown_requested = true;
            return;
        }

        if signal.recipient == self.config.identity {
            match signal.name.as_str() {
                names::LIST_OPERATIONS => {
                    ctx.emit(self.operation_list(), signal.sender);
                }
                name if names::is_advisory(name) => {}
                _ => {
                    ctx.emit(names::INVALID_SIGNAL, signal.sender);
                }
            }
            return;
        }

        if signal.is_broadcast() {
            for (identity, slot) in &self.operations {
                slot.deliver(
                    identity,
                    Outgoing::relay(&signal.name, "", &signal.sender),
                );
            }
            return;
        }

        match self.operations.get(&signal.recipient) {
            Some(slot) => slot.deliver(
                &signal.recipient,
                Outgoing::relay(&signal.name, &signal.recipient, &signal.sender),
            ),
            None => {
                tracing::debug!(recipient = %signal.recipient, signal = %signal.name, "Unroutable signal dropped");
            }
        }
    }

    /// Drain at most one signal from every live operation. Returns whether
    /// anything was drained.
    fn route_operations(&mut self, ctx: &Context) -> bool {
        let mut busy = false;
        for index in 0..self.operations.len() {
            let Some((identity, slot)) = self.operations.get_index_mut(index) else {
                break;
            };

            if !slot.finished && slot.handle.as_ref().is_some_and(EntityHandle::is_finished) {
                slot.finished = true;
                tracing::info!(operation = %identity, "Operation finished");
            }
            if !slot.live {
                continue;
            }

            let signal = match slot.inbox.poll() {
                Ok(Some(signal)) => signal,
                Ok(None) => continue,
                Err(_) => {
                    slot.live = false;
                    tracing::warn!(operation = %identity, "Relay bridge ended, operation marked dead");
                    continue;
                }
            };
            busy = true;

            let origin = identity.clone();
            if let Flow::Halt = self.route_from(ctx, &origin, signal) {
                break;
            }
        }
        busy
    }

    /// Route one signal sent by operation `origin`.
    fn route_from(&mut self, ctx: &Context, origin: &str, signal: Signal) -> Flow {
        let manager = self.config.identity.as_str();

        if signal.name.is_empty() {
            tracing::warn!(operation = %origin, "Nameless signal from operation");
            ctx.emit(names::MALFORMED_SIGNAL, "");
            if let Some(slot) = self.operations.get(origin) {
                slot.deliver(origin, Outgoing::relay(names::MALFORMED_SIGNAL, origin, manager));
            }
            return Flow::Continue;
        }

        tracing::debug!(
            operation = %origin,
            signal = %signal.name,
            recipient = %signal.recipient,
            "Routing"
        );

        if signal.recipient == manager {
            let reply = match signal.name.as_str() {
                names::STOP => {
                    tracing::info!(operation = %origin, "Stop requested");
                    self.shutdown_requested = true;
                    return Flow::Halt;
                }
                names::LIST_OPERATIONS => Some(self.operation_list()),
                name if names::is_advisory(name) => None,
                _ => Some(names::INVALID_SIGNAL.to_string()),
            };
            if let (Some(reply), Some(slot)) = (reply, self.operations.get(origin)) {
                slot.deliver(origin, Outgoing::relay(reply, origin, manager));
            }
            return Flow::Continue;
        }

        if let Some(slot) = self.operations.get(&signal.recipient) {
            slot.deliver(
                &signal.recipient,
                Outgoing::relay(&signal.name, &signal.recipient, &signal.sender),
            );
            return Flow::Continue;
        }

        if signal.is_broadcast() {
            for (identity, slot) in &self.operations {
                if identity != origin {
                    slot.deliver(
                        identity,
                        Outgoing::relay(&signal.name, "", &signal.sender),
                    );
                }
            }
            if signal.is_stop() {
                tracing::info!(operation = %origin, "Broadcast stop, shutting down");
                self.shutdown_requested = true;
            }
            return Flow::Continue;
        }

        tracing::debug!(operation = %origin, recipient = %signal.recipient, "Unroutable signal dropped");
        Flow::Continue
    }

    /// Stop every operation and its relay, wait for them, then stop the own bridge.
    async fn shutdown(&mut self, ctx: &mut Context) {
        let manager = self.config.identity.clone();
        tracing::info!(manager = %manager, "Shutting down pipeline");

        for (identity, slot) in &self.operations {
            ctx.emit(format!("ending {identity}"), "");
            // Same queue, FIFO: the operation's stop is on the wire before the relay ends.
            slot.deliver(identity, Outgoing::relay(names::STOP, identity, &manager));
            slot.deliver(identity, Outgoing::relay(names::STOP, BRIDGE_ADDRESS, &manager));
            ctx.emit(format!("{identity} finished"), "");
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        for (identity, slot) in &mut self.operations {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(handle) = slot.handle.take() {
                let joined = handle.wait_or_abort(remaining).await;
                match joined.code {
                    Some(code) => tracing::info!(operation = %identity, code, bridge = ?joined.bridge, "Operation joined"),
                    None => tracing::warn!(operation = %identity, "Operation aborted"),
                }
                slot.joined = Some(joined);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut slot.relay).await {
                Ok(Ok(exit)) => slot.relay_exit = Some(exit),
                Ok(Err(e)) => tracing::warn!(operation = %identity, error = %e, "Relay bridge failed"),
                Err(_) => {
                    tracing::warn!(operation = %identity, "Relay bridge did not stop, aborting");
                    slot.relay.abort();
                }
            }
            slot.live = false;
        }

        ctx.stop_bridge();
    }
}

#[async_trait]
impl Entity for PipelineManager {
    fn recognizes(&self, state: State) -> bool {
        state == State::Started
    }

    async fn idle(&mut self, ctx: &mut Context) -> Transition {
        tracing::info!(entity = %ctx.identity(), "idle");
        ctx.emit(names::IDLE, "");

        match entity::next_command(ctx, &[State::Started]).await {
            Command::Enter(state) => Transition::Next(state),
            Command::Stop | Command::BridgeClosed => {
                self.shutdown(ctx).await;
                Transition::Exit(SHUTDOWN)
            }
        }
    }

    async fn started(&mut self, ctx: &mut Context) -> Transition {
        let manager = self.config.identity.clone();
        ctx.emit(State::Started.as_str(), "");
        for (identity, slot) in &self.operations {
            slot.deliver(
                identity,
                Outgoing::relay(State::Started.as_str(), identity, &manager),
            );
        }
        ctx.emit(names::READY, "");

        loop {
            if self.shutdown_requested {
                self.shutdown(ctx).await;
                return Transition::Exit(SHUTDOWN);
            }

            let mut busy = match ctx.try_recv() {
                Ok(Some(signal)) => {
                    self.route_external(ctx, signal);
                    true
                }
                Ok(None) => false,
                Err(BridgeClosed) => {
                    tracing::warn!(manager = %manager, "Own bridge ended, shutting down");
                    self.shutdown_requested = true;
                    continue;
                }
            };

            if !self.shutdown_requested {
                busy |= self.route_operations(ctx);
            }

            if !busy {
                tokio::time::sleep(ctx.tick()).await;
            }
        }
    }
}
