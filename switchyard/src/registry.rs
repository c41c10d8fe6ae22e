//! Operation registry - maps an operation identity to its constructor.
//!
//! Populated once at startup; the pipeline manager resolves every declared
//! identity here before any operation is started.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::entity::Entity;

/// What a constructor gets to build one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationArgs {
    pub identity: String,
    /// The operation's own configuration file (`<config_dir>/<identity>.conf`).
    pub config_path: PathBuf,
}

pub type Constructor =
    Arc<dyn Fn(&OperationArgs) -> anyhow::Result<Box<dyn Entity>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown operation: {0}")]
    Unknown(String),
    #[error("failed to construct operation {identity}: {source}")]
    Construct {
        identity: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Clone, Default)]
pub struct OperationRegistry {
    constructors: HashMap<String, Constructor>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `identity`.
    pub fn register<F>(&mut self, identity: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&OperationArgs) -> anyhow::Result<Box<dyn Entity>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(identity.into(), Arc::new(constructor));
        self
    }

    pub fn with<F>(mut self, identity: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&OperationArgs) -> anyhow::Result<Box<dyn Entity>> + Send + Sync + 'static,
    {
        self.register(identity, constructor);
        self
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.constructors.contains_key(identity)
    }

    pub fn resolve(&self, identity: &str) -> Result<Constructor, RegistryError> {
        self.constructors
            .get(identity)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(identity.to_string()))
    }

    pub fn construct(&self, args: &OperationArgs) -> Result<Box<dyn Entity>, RegistryError> {
        let constructor = self.resolve(&args.identity)?;
        constructor(args).map_err(|source| RegistryError::Construct {
            identity: args.identity.clone(),
            source,
        })
    }

    /// Registered identities, sorted.
    pub fn identities(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("identities", &self.identities())
            .finish()
    }
}
