// Cluster lifecycle and peer messaging
//
// This module drives a single host through the cluster lifecycle and keeps
// it talking to its peers:
//
// - `state`: persisted data model (node state, manifest, token, cluster id)
// - `message`: peer wire protocol (JSON envelopes over websocket frames)
// - `connection`: peer transport and the connection manager
// - `store`: typed atomic persistence of the control documents
// - `node`: the node state machine and the message router
// - `bootstrap`: one-shot cluster bring-up driver
// - `provision`: interface to the external provisioning helper

pub mod bootstrap;
pub mod connection;
pub mod message;
pub mod node;
pub mod provision;
pub mod state;
pub mod store;

pub use bootstrap::{BootstrapDriver, BootstrapStage};
pub use connection::{ConnectionManager, Peer, PeerChannel, PeerKind};
pub use message::{JoinPayload, Message, WelcomePayload};
pub use node::NodeManager;
pub use provision::{CommandProvisioner, Facts, NetworkInterface, Provisioner};
pub use state::{Manifest, NodeRole, NodeStage, NodeState};
pub use store::NodeStore;

use crate::config::NodeConfig;
use crate::error::Result;
use std::sync::Arc;

/// The assembled core: one value owning the node manager, the connection
/// manager, and the bootstrap driver. Constructed once at program start and
/// handed to the HTTP layer by value; there is no process-global state.
pub struct Core {
    config: NodeConfig,
    connections: Arc<ConnectionManager>,
    nodes: NodeManager,
    bootstrap: BootstrapDriver,
}

impl Core {
    pub async fn new(config: NodeConfig, provisioner: Arc<dyn Provisioner>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.confdir).await?;

        let connections = Arc::new(ConnectionManager::new());
        let nodes =
            NodeManager::new(&config, Arc::clone(&connections), Arc::clone(&provisioner)).await?;
        let bootstrap = BootstrapDriver::new(nodes.clone(), provisioner);

        Ok(Self {
            config,
            connections,
            nodes,
            bootstrap,
        })
    }

    /// Open for business: accept peer connections and, where the stage
    /// warrants it, start the message router.
    pub async fn start(&self) {
        self.connections.start();
        self.nodes.start().await;
    }

    pub async fn shutdown(&self) {
        self.nodes.shutdown();
        self.bootstrap.wait_finished().await;
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn nodes(&self) -> &NodeManager {
        &self.nodes
    }

    pub fn bootstrap(&self) -> &BootstrapDriver {
        &self.bootstrap
    }
}
