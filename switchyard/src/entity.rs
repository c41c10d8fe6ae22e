//! Entity contract - the state machine every participant runs.
//!
//! An entity owns one bridge and talks to it through a [`Context`]. Its run
//! loop dispatches on an explicit [`State`]: each handler either moves the
//! entity to another state or ends the run with a terminal code.
//!
//! Flow:
//! 1. Create the bridge, send it `start`
//! 2. Enter `idle`: announce `idle`, wait for a command naming a state
//! 3. Dispatch handlers until one returns [`Transition::Exit`]

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::{JoinError, JoinHandle};

use crate::bridge::protocol::{Outgoing, Signal, names};
use crate::bridge::{Bridge, BridgeExit, BridgeMode, ExternalPair};
use crate::channel::{DEFAULT_CAPACITY, Offer, Poll, QueueError};

/// Terminal code of an intentional shutdown. Not a failure.
pub const SHUTDOWN: i32 = -1;

/// Default polling interval.
pub const DEFAULT_TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Started,
    Stopped,
    Terminated,
    Suspended,
    Killed,
}

impl State {
    /// States an entity can be commanded into.
    pub const COMMANDABLE: [State; 5] = [
        State::Started,
        State::Stopped,
        State::Terminated,
        State::Suspended,
        State::Killed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Suspended => "suspended",
            Self::Killed => "killed",
        }
    }

    /// Transition table: the state a command name asks for.
    ///
    /// `idle` is not a command; it only ever appears as an announcement.
    pub fn from_command(name: &str) -> Option<State> {
        Self::COMMANDABLE
            .into_iter()
            .find(|state| state.as_str() == name)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a state handler asks the run loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next(State),
    /// End the run. `0` is not terminal: the loop re-enters the current state.
    Exit(i32),
}

/// The owning bridge went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bridge closed")]
pub struct BridgeClosed;

/// Polling interval and queue capacity shared by a group of entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub tick: Duration,
    pub capacity: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// An entity's view of its bridge.
pub struct Context {
    identity: String,
    inbound: Receiver<Signal>,
    outbound: Sender<Outgoing>,
    tick: Duration,
}

impl Context {
    pub fn new(
        identity: impl Into<String>,
        inbound: Receiver<Signal>,
        outbound: Sender<Outgoing>,
        tick: Duration,
    ) -> Self {
        Self {
            identity: identity.into(),
            inbound,
            outbound,
            tick,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Send a signal in this entity's name. Best effort: drops on a full queue.
    pub fn emit(&self, name: impl Into<String>, recipient: impl Into<String>) -> bool {
        self.send(Outgoing::to(name, recipient))
    }

    /// Hand any record to the bridge. Best effort: drops on a full queue.
    pub fn send(&self, record: Outgoing) -> bool {
        match self.outbound.offer(record) {
            Ok(()) => true,
            Err(QueueError::Full) => {
                tracing::warn!(entity = %self.identity, "Outbound queue full, dropping signal");
                false
            }
            Err(QueueError::Closed) => {
                tracing::debug!(entity = %self.identity, "Bridge gone, dropping signal");
                false
            }
        }
    }

    /// Tell the bridge to stop relaying.
    pub fn stop_bridge(&self) {
        self.send(Outgoing::bridge(names::STOP));
    }

    /// Take the next signal if one is waiting.
    pub fn try_recv(&mut self) -> Result<Option<Signal>, BridgeClosed> {
        self.inbound.poll().map_err(|_| BridgeClosed)
    }

    /// Wait up to one tick for the next signal.
    pub async fn recv(&mut self) -> Result<Option<Signal>, BridgeClosed> {
        self.recv_timeout(self.tick).await
    }

    /// Wait up to `timeout` for the next signal.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Signal>, BridgeClosed> {
        self.inbound
            .recv_within(timeout)
            .await
            .map_err(|_| BridgeClosed)
    }
}

/// A participant in the pipeline.
///
/// Only `idle` has a prescribed body. The other states are extension points:
/// by default they log and fall back to `idle`.
#[async_trait]
pub trait Entity: Send + 'static {
    /// Whether a command naming `state` moves this entity into it.
    fn recognizes(&self, state: State) -> bool {
        state != State::Idle
    }

    async fn idle(&mut self, ctx: &mut Context) -> Transition {
        let recognized: Vec<State> = State::COMMANDABLE
            .into_iter()
            .filter(|state| self.recognizes(*state))
            .collect();
        idle(ctx, &recognized).await
    }

    async fn started(&mut self, ctx: &mut Context) -> Transition {
        unhandled(ctx, State::Started)
    }

    async fn stopped(&mut self, ctx: &mut Context) -> Transition {
        unhandled(ctx, State::Stopped)
    }

    async fn terminated(&mut self, ctx: &mut Context) -> Transition {
        unhandled(ctx, State::Terminated)
    }

    async fn suspended(&mut self, ctx: &mut Context) -> Transition {
        unhandled(ctx, State::Suspended)
    }

    async fn killed(&mut self, ctx: &mut Context) -> Transition {
        unhandled(ctx, State::Killed)
    }
}

fn unhandled(ctx: &Context, state: State) -> Transition {
    tracing::warn!(entity = %ctx.identity(), %state, "State has no handler, returning to idle");
    Transition::Next(State::Idle)
}

/// Outcome of waiting in idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Enter(State),
    Stop,
    BridgeClosed,
}

/// The idle contract shared by every entity.
///
/// Announces `idle` once, then waits for a command:
/// - `stop`: stop the bridge and end the run
/// - a state in `recognized`: move to it
/// - an advisory notice: ignore
/// - anything else: answer `invalid signal`
pub async fn idle(ctx: &mut Context, recognized: &[State]) -> Transition {
    tracing::info!(entity = %ctx.identity(), "idle");
    ctx.emit(names::IDLE, "");

    match next_command(ctx, recognized).await {
        Command::Enter(state) => Transition::Next(state),
        Command::Stop => {
            ctx.stop_bridge();
            Transition::Exit(SHUTDOWN)
        }
        Command::BridgeClosed => {
            tracing::info!(entity = %ctx.identity(), "Bridge ended, terminating");
            Transition::Exit(SHUTDOWN)
        }
    }
}

/// Wait for `stop` or a command naming a state in `recognized`.
///
/// Unrecognized names are answered with `invalid signal`; advisory notices and
/// empty names are skipped.
pub async fn next_command(ctx: &mut Context, recognized: &[State]) -> Command {
    loop {
        let signal = match ctx.recv().await {
            Ok(Some(signal)) => signal,
            Ok(None) => continue,
            Err(BridgeClosed) => return Command::BridgeClosed,
        };
        if signal.name.is_empty() {
            continue;
        }
        tracing::debug!(entity = %ctx.identity(), signal = %signal.name, sender = %signal.sender, "Received");

        if signal.is_stop() {
            return Command::Stop;
        }

        if names::is_advisory(&signal.name) {
            continue;
        }

        match State::from_command(&signal.name) {
            Some(state) if recognized.contains(&state) => return Command::Enter(state),
            _ => {
                tracing::debug!(entity = %ctx.identity(), signal = %signal.name, "Invalid signal");
                ctx.emit(names::INVALID_SIGNAL, "");
            }
        }
    }
}

/// Drive `entity` through its states until a handler ends the run.
pub async fn run<E: Entity + ?Sized>(entity: &mut E, ctx: &mut Context) -> i32 {
    tracing::info!(entity = %ctx.identity(), "created");
    let mut state = State::Idle;
    loop {
        tracing::info!(entity = %ctx.identity(), %state, "Entering state");
        let transition = match state {
            State::Idle => entity.idle(ctx).await,
            State::Started => entity.started(ctx).await,
            State::Stopped => entity.stopped(ctx).await,
            State::Terminated => entity.terminated(ctx).await,
            State::Suspended => entity.suspended(ctx).await,
            State::Killed => entity.killed(ctx).await,
        };
        match transition {
            Transition::Next(next) => state = next,
            Transition::Exit(0) => {}
            Transition::Exit(code) => {
                tracing::info!(entity = %ctx.identity(), code, "Run ended");
                return code;
            }
        }
    }
}

/// A running entity together with its bridge.
pub struct EntityHandle {
    identity: String,
    task: JoinHandle<i32>,
    bridge: JoinHandle<BridgeExit>,
}

impl EntityHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run loop to end and return its terminal code.
    pub async fn wait(self) -> Result<i32, JoinError> {
        let code = self.task.await?;
        match self.bridge.await {
            Ok(exit) => tracing::debug!(entity = %self.identity, ?exit, "Bridge joined"),
            Err(e) => tracing::warn!(entity = %self.identity, error = %e, "Bridge task failed"),
        }
        Ok(code)
    }

    /// Wait at most `timeout` each for the run loop and the bridge, aborting
    /// whichever is still running when time runs out.
    pub async fn wait_or_abort(mut self, timeout: Duration) -> Joined {
        let code = match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(code)) => Some(code),
            Ok(Err(e)) => {
                tracing::warn!(entity = %self.identity, error = %e, "Entity task failed");
                None
            }
            Err(_) => {
                tracing::warn!(entity = %self.identity, ?timeout, "Entity did not finish, aborting");
                self.task.abort();
                None
            }
        };
        let bridge = match tokio::time::timeout(timeout, &mut self.bridge).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                tracing::warn!(entity = %self.identity, error = %e, "Bridge task failed");
                None
            }
            Err(_) => {
                self.bridge.abort();
                None
            }
        };
        Joined { code, bridge }
    }
}

/// How a joined entity and its bridge ended. `None` means aborted or panicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Joined {
    pub code: Option<i32>,
    pub bridge: Option<BridgeExit>,
}

/// Prepared entity: bridge created and started, run loop not yet scheduled.
pub struct Prepared {
    entity: Box<dyn Entity>,
    ctx: Context,
    bridge: JoinHandle<BridgeExit>,
}

impl Prepared {
    /// Give `entity` its bridge over `external` and start the bridge.
    pub fn new(
        identity: impl Into<String>,
        entity: Box<dyn Entity>,
        external: ExternalPair,
        mode: BridgeMode,
        tuning: Tuning,
    ) -> Self {
        let identity = identity.into();
        let (bridge, internal) = Bridge::new(identity.clone(), mode, external, tuning.capacity);
        let bridge = bridge.spawn();
        let ctx = Context::new(identity, internal.inbound, internal.outbound, tuning.tick);
        ctx.send(Outgoing::bridge(names::START));
        Self {
            entity,
            ctx,
            bridge,
        }
    }

    /// Schedule the run loop.
    pub fn start(self) -> EntityHandle {
        let Self {
            mut entity,
            mut ctx,
            bridge,
        } = self;
        let identity = ctx.identity().to_string();
        let task = tokio::spawn(async move { run(entity.as_mut(), &mut ctx).await });
        EntityHandle {
            identity,
            task,
            bridge,
        }
    }
}

/// Give `entity` a bridge over `external` and start both.
pub fn spawn(
    identity: impl Into<String>,
    entity: Box<dyn Entity>,
    external: ExternalPair,
    mode: BridgeMode,
    tuning: Tuning,
) -> EntityHandle {
    Prepared::new(identity, entity, external, mode, tuning).start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec;
    use crate::bridge::link;
    use crate::channel::queue;

    const WAIT: Duration = Duration::from_millis(200);

    fn context() -> (Context, Sender<Signal>, Receiver<Outgoing>) {
        let (in_tx, in_rx) = queue(16);
        let (out_tx, out_rx) = queue(16);
        (
            Context::new("A", in_rx, out_tx, Duration::from_millis(1)),
            in_tx,
            out_rx,
        )
    }

    fn signal(name: &str) -> Signal {
        Signal::new(name, "ext", "A", 1.0)
    }

    #[test]
    fn transition_table() {
        assert_eq!(State::from_command("started"), Some(State::Started));
        assert_eq!(State::from_command("killed"), Some(State::Killed));
        assert_eq!(State::from_command("idle"), None);
        assert_eq!(State::from_command("start"), None);
        assert_eq!(State::from_command("__init__"), None);
    }

    #[tokio::test]
    async fn idle_announces_exactly_once() {
        let (mut ctx, in_tx, mut out_rx) = context();
        in_tx.offer(signal("bogus")).unwrap();
        in_tx.offer(signal("started")).unwrap();
        let transition = idle(&mut ctx, &State::COMMANDABLE).await;
        assert_eq!(transition, Transition::Next(State::Started));

        assert_eq!(out_rx.poll().unwrap(), Some(Outgoing::to("idle", "")));
        assert_eq!(out_rx.poll().unwrap(), Some(Outgoing::to("invalid signal", "")));
        assert_eq!(out_rx.poll().unwrap(), None);
    }

    #[tokio::test]
    async fn idle_stop_stops_bridge() {
        let (mut ctx, in_tx, mut out_rx) = context();
        in_tx.offer(signal("stop")).unwrap();
        assert_eq!(idle(&mut ctx, &[]).await, Transition::Exit(SHUTDOWN));
        assert_eq!(out_rx.poll().unwrap().unwrap().name, "idle");
        assert_eq!(out_rx.poll().unwrap(), Some(Outgoing::bridge("stop")));
    }

    #[tokio::test]
    async fn idle_ignores_advisories_and_empty_names() {
        let (mut ctx, in_tx, mut out_rx) = context();
        for name in ["", "idle", "invalid signal", "malformed signal"] {
            in_tx.offer(signal(name)).unwrap();
        }
        in_tx.offer(signal("stop")).unwrap();
        idle(&mut ctx, &[]).await;
        assert_eq!(out_rx.poll().unwrap().unwrap().name, "idle");
        assert_eq!(out_rx.poll().unwrap(), Some(Outgoing::bridge("stop")));
    }

    #[tokio::test]
    async fn idle_rejects_unrecognized_state() {
        let (mut ctx, in_tx, mut out_rx) = context();
        in_tx.offer(signal("killed")).unwrap();
        in_tx.offer(signal("started")).unwrap();
        let transition = idle(&mut ctx, &[State::Started]).await;
        assert_eq!(transition, Transition::Next(State::Started));
        out_rx.poll().unwrap();
        assert_eq!(out_rx.poll().unwrap().unwrap().name, "invalid signal");
    }

    #[tokio::test]
    async fn idle_ends_when_bridge_closes() {
        let (mut ctx, in_tx, _out_rx) = context();
        drop(in_tx);
        assert_eq!(idle(&mut ctx, &[]).await, Transition::Exit(SHUTDOWN));
    }

    struct Counter {
        started: usize,
    }

    #[async_trait]
    impl Entity for Counter {
        async fn started(&mut self, _ctx: &mut Context) -> Transition {
            self.started += 1;
            if self.started < 3 {
                Transition::Exit(0)
            } else {
                Transition::Exit(7)
            }
        }
    }

    #[tokio::test]
    async fn exit_zero_reenters_current_state() {
        let (mut ctx, in_tx, _out_rx) = context();
        in_tx.offer(signal("started")).unwrap();
        let mut counter = Counter { started: 0 };
        assert_eq!(run(&mut counter, &mut ctx).await, 7);
        assert_eq!(counter.started, 3);
    }

    struct Plain;

    #[async_trait]
    impl Entity for Plain {}

    #[tokio::test]
    async fn unhandled_state_falls_back_to_idle() {
        let (mut ctx, in_tx, mut out_rx) = context();
        in_tx.offer(signal("suspended")).unwrap();
        in_tx.offer(signal("stop")).unwrap();
        assert_eq!(run(&mut Plain, &mut ctx).await, SHUTDOWN);
        let idles = std::iter::from_fn(|| out_rx.poll().ok().flatten())
            .filter(|r| r.name == "idle")
            .count();
        assert_eq!(idles, 2);
    }

    #[tokio::test]
    async fn spawned_entity_speaks_through_its_bridge() {
        let (near, mut peer) = link(16);
        let handle = spawn("A", Box::new(Plain), near, BridgeMode::operation(), Tuning::default());

        let wire = peer.inbound.recv_within(WAIT).await.unwrap().unwrap();
        let announced = codec::decode(&wire).unwrap();
        assert_eq!((announced.name.as_str(), announced.sender.as_str()), ("idle", "A"));

        peer.outbound.offer("stop:1.0:ext:A".into()).unwrap();
        let code = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
        assert_eq!(code, SHUTDOWN);
    }

    #[tokio::test]
    async fn remote_bridge_stop_ends_entity() {
        let (near, peer) = link(16);
        let handle = spawn("A", Box::new(Plain), near, BridgeMode::operation(), Tuning::default());
        peer.outbound.offer("stop:1.0:ext:bridge".into()).unwrap();
        let code = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
        assert_eq!(code, SHUTDOWN);
    }
}
