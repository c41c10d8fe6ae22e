//! switchyard: signal routing and lifecycle coordination for worker pipelines.
//!
//! A pipeline manager starts a configured set of operations, each running as
//! its own task behind its own bridge, and routes every signal between them
//! and the outside world over a colon-separated wire protocol.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod entity;
pub mod operations;
pub mod registry;
pub mod supervisor;

pub use bridge::protocol::{BRIDGE_ADDRESS, Outgoing, Signal};
pub use bridge::{Bridge, BridgeExit, BridgeMode, ExternalPair, link};
pub use config::{ConfigError, Declaration, ManagerConfig};
pub use entity::{Context, Entity, EntityHandle, Joined, SHUTDOWN, State, Transition};
pub use registry::{OperationArgs, OperationRegistry, RegistryError};
pub use supervisor::{ManagerError, PipelineManager};
