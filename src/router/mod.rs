use crate::config::{BackendConfig, TopologyConfig};

/// Which kind of backend a command should land on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// A replica is acceptable
    ReadOnly,
    /// The primary is required
    #[default]
    ReadWrite,
}

/// Primary/replica topology with mode-based selection
#[derive(Debug, Clone)]
pub struct Topology {
    primary: BackendConfig,
    replicas: Vec<BackendConfig>,
    rw_split: bool,
}

impl Topology {
    pub fn new(config: &TopologyConfig) -> Self {
        Self {
            primary: config.primary.clone(),
            replicas: config.replicas.clone(),
            rw_split: config.rw_split,
        }
    }

    /// Determine the target mode for a command
    ///
    /// Reads may go to a replica when splitting is on and replicas exist;
    /// everything else needs the primary.
    pub fn mode_for(&self, read_only: bool, in_transaction: bool) -> ServerMode {
        if in_transaction || !self.rw_split || self.replicas.is_empty() {
            return ServerMode::ReadWrite;
        }

        if read_only {
            ServerMode::ReadOnly
        } else {
            ServerMode::ReadWrite
        }
    }

    /// Pick the backend for a mode. Replica choice rotates by the caller's
    /// session id so load spreads without shared state.
    pub fn select(&self, mode: ServerMode, session_id: u32) -> &BackendConfig {
        match mode {
            ServerMode::ReadWrite => &self.primary,
            ServerMode::ReadOnly => {
                if self.replicas.is_empty() {
                    &self.primary
                } else {
                    &self.replicas[session_id as usize % self.replicas.len()]
                }
            }
        }
    }
}
