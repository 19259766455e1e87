// # Node manager
//
// Owns the node state machine and mediates every transition:
//
// ```text
//  None ──start_bootstrap──► Bootstrapping ──finish_bootstrap──► Bootstrapped
//   │                                                                  │
//   └──join(leader,token)──► Joining ──on WELCOME──► Ready ◄──mark_ready┘
// ```
//
// Mutating operations are serialized behind a single async lock and their
// guards run before the first suspension point, so concurrent callers always
// observe a consistent stage. The manager also runs the message router: the
// single consumer of the connection manager's inbound queue, dispatching
// peer messages to handlers. A handler failure is logged and the router
// moves on; one peer cannot take the router down.

use crate::cluster::connection::{ConnectionManager, Peer};
use crate::cluster::message::{JoinPayload, Message};
use crate::cluster::provision::{local_hostname, Provisioner};
use crate::cluster::state::{
    generate_token, ClusterUuidDocument, Manifest, NodeRole, NodeStage, NodeState, TokenDocument,
};
use crate::cluster::store::NodeStore;
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn leader_uri(endpoint: &str) -> String {
    format!("ws://{}/api/nodes/ws", endpoint)
}

// Documents derived from the store; present or absent by stage.
#[derive(Default)]
struct DerivedDocuments {
    manifest: Option<Manifest>,
    token: Option<String>,
    cluster_uuid: Option<Uuid>,
}

/// Cheaply clonable handle; clones share the same node state. The message
/// router task holds one clone for its lifetime.
#[derive(Clone)]
pub struct NodeManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: NodeStore,
    connections: Arc<ConnectionManager>,
    provisioner: Arc<dyn Provisioner>,
    authorized_keys: PathBuf,
    state: Mutex<NodeState>,
    documents: Mutex<DerivedDocuments>,
    shutting_down: AtomicBool,
    router: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl NodeManager {
    /// Initialize the manager from disk: read or create `node.json`, then
    /// load the companion documents under the cross-file invariants.
    pub async fn new(
        config: &NodeConfig,
        connections: Arc<ConnectionManager>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self> {
        let store = NodeStore::new(&config.confdir);
        let state = Self::init_node(&store).await?;
        debug!(uuid = %state.uuid, stage = ?state.stage, "node state loaded");

        let manager = Self {
            inner: Arc::new(ManagerInner {
                store,
                connections,
                provisioner,
                authorized_keys: config.authorized_keys.clone(),
                state: Mutex::new(state),
                documents: Mutex::new(DerivedDocuments::default()),
                shutting_down: AtomicBool::new(false),
                router: parking_lot::Mutex::new(None),
            }),
        };
        manager.reload_documents().await?;
        Ok(manager)
    }

    async fn init_node(store: &NodeStore) -> Result<NodeState> {
        if let Some(state) = store.read_node().await? {
            return Ok(state);
        }
        // a node without state must not have any companion documents
        if store.read_manifest().await?.is_some() || store.read_token().await?.is_some() {
            return Err(NodeError::InconsistentState(
                "control documents exist without node state".into(),
            ));
        }
        let state = NodeState::fresh();
        store.write_node(&state).await?;
        info!(uuid = %state.uuid, "initialized fresh node state");
        Ok(state)
    }

    async fn reload_documents(&self) -> Result<()> {
        let stored = self.inner.store.load().await?;
        let mut documents = self.inner.documents.lock().await;
        documents.manifest = stored.manifest;
        documents.token = stored.token.map(|t| t.token);
        documents.cluster_uuid = stored.cluster_uuid.map(|c| c.cluster_uuid);
        Ok(())
    }

    /// Start background processing. Nodes that can accept peers (the leader
    /// from Bootstrapped onward, followers once Ready) get the message
    /// router; everyone else starts it when they reach such a stage.
    pub async fn start(&self) {
        let stage = self.inner.state.lock().await.stage;
        if stage >= NodeStage::Bootstrapped {
            self.spawn_router();
        }
    }

    fn spawn_router(&self) {
        let mut router = self.inner.router.lock();
        if router.is_some() {
            return;
        }
        let manager = self.clone();
        *router = Some(tokio::spawn(async move {
            manager.run_router().await;
        }));
    }

    async fn run_router(&self) {
        debug!("message router started");
        while !self.inner.shutting_down.load(Ordering::SeqCst) {
            let (peer, msg) = match self.inner.connections.wait_incoming().await {
                Ok(incoming) => incoming,
                Err(_) => break,
            };
            debug!(peer = %peer.endpoint(), kind = msg.kind(), "inbound message");
            if let Err(err) = self.dispatch(&peer, msg).await {
                warn!(peer = %peer.endpoint(), error = %err, "message handler failed");
            }
        }
        debug!("message router stopped");
    }

    async fn dispatch(&self, peer: &Arc<Peer>, msg: Message) -> Result<()> {
        match msg {
            Message::Join(payload) => self.handle_join(peer, payload).await,
            Message::Welcome(_) => {
                // welcomes are consumed synchronously by the join initiator
                debug!(peer = %peer.endpoint(), "ignoring welcome outside a join handshake");
                Ok(())
            }
            Message::ReadyToAdd => {
                debug!(peer = %peer.endpoint(), "ready-to-add is reserved; dropping");
                Ok(())
            }
        }
    }

    /// Leader-side join handling: verify we can accept members and that the
    /// presented token matches, then welcome the node with the cluster
    /// identifier and our public key. Rejections close the peer without a
    /// reply.
    async fn handle_join(&self, peer: &Arc<Peer>, msg: JoinPayload) -> Result<()> {
        let stage = self.stage().await;
        if !matches!(stage, NodeStage::Bootstrapped | NodeStage::Ready) {
            warn!(node = %msg.uuid, stage = ?stage, "join request before this node accepts members");
            peer.close();
            return Ok(());
        }

        let (cluster_uuid, expected_token) = {
            let documents = self.inner.documents.lock().await;
            match (&documents.manifest, &documents.token) {
                (Some(manifest), Some(token)) => (manifest.cluster_uuid, token.clone()),
                _ => {
                    warn!(node = %msg.uuid, "join request but this node holds no cluster manifest");
                    peer.close();
                    return Ok(());
                }
            }
        };

        if msg.token != expected_token {
            warn!(node = %msg.uuid, host = %msg.hostname, "join rejected: token mismatch");
            peer.close();
            return Ok(());
        }

        let pubkey = self.inner.provisioner.get_public_key().await?;
        peer.send(&Message::welcome(cluster_uuid, pubkey)).await?;
        info!(node = %msg.uuid, host = %msg.hostname, address = %msg.address, "welcomed node into the cluster");
        Ok(())
    }

    /// Eligibility check for bootstrap. No state change.
    pub async fn prepare_bootstrap(&self) -> Result<()> {
        let state = self.inner.state.lock().await;
        if state.stage != NodeStage::None {
            return Err(NodeError::CantBootstrap);
        }
        Ok(())
    }

    /// Enter the Bootstrapping stage with the selected address and persist.
    pub async fn start_bootstrap(&self, address: &str, hostname: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.stage != NodeStage::None {
            return Err(NodeError::CantBootstrap);
        }
        state.stage = NodeStage::Bootstrapping;
        state.address = Some(address.to_string());
        state.hostname = Some(hostname.to_string());
        if let Err(err) = self.inner.store.write_node(&state).await {
            state.stage = NodeStage::None;
            state.address = None;
            state.hostname = None;
            return Err(err);
        }
        info!(address, hostname, "bootstrap started");
        Ok(())
    }

    /// Seal the bootstrap: generate the cluster identifier and the join
    /// token, write the manifest and token documents, promote this node to
    /// Bootstrapped leader, and persist.
    pub async fn finish_bootstrap(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.stage != NodeStage::Bootstrapping {
                return Err(NodeError::CantBootstrap);
            }

            let cluster_uuid = Uuid::new_v4();
            state.stage = NodeStage::Bootstrapped;
            state.role = NodeRole::Leader;

            let manifest = Manifest::initial(cluster_uuid, state.clone());
            self.inner.store.write_manifest(&manifest).await?;
            self.inner
                .store
                .write_token(&TokenDocument {
                    token: generate_token(),
                })
                .await?;
            self.inner.store.write_node(&state).await?;
            info!(cluster = %cluster_uuid, "bootstrap finished; this node now leads the cluster");
        }
        self.reload_documents().await?;
        // the leader accepts joins from here on
        self.spawn_router();
        Ok(())
    }

    /// Promote a bootstrapped leader to Ready. Idempotent on a node that is
    /// already Ready; false when the node has not been deployed.
    pub async fn mark_ready(&self) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        match state.stage {
            NodeStage::Ready => Ok(true),
            NodeStage::Bootstrapped => {
                state.stage = NodeStage::Ready;
                self.inner.store.write_node(&state).await?;
                info!("node marked ready");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Join an existing cluster through its leader. The stage guard maps to
    /// a distinct error per current stage; callers and the UI rely on the
    /// distinction. On any failure past the guard the node reverts to stage
    /// None with nothing persisted.
    pub async fn join(&self, leader_endpoint: &str, token: &str) -> Result<bool> {
        info!(leader = leader_endpoint, "joining cluster");
        {
            let mut state = self.inner.state.lock().await;
            match state.stage {
                NodeStage::Bootstrapping => return Err(NodeError::AlreadyBootstrapping),
                NodeStage::Bootstrapped => return Err(NodeError::AlreadyDeployed),
                NodeStage::Joining => return Err(NodeError::AlreadyJoining),
                NodeStage::Ready => return Err(NodeError::AlreadyJoined),
                NodeStage::None => {}
            }
            // in-memory only; nothing is persisted until the welcome arrives
            state.stage = NodeStage::Joining;
        }

        match self.try_join(leader_endpoint, token).await {
            Ok(()) => {
                self.spawn_router();
                Ok(true)
            }
            Err(err) => {
                // drop the dead dial so a retry starts with a fresh socket
                self.inner
                    .connections
                    .remove(&leader_uri(leader_endpoint))
                    .await;
                let mut state = self.inner.state.lock().await;
                state.stage = NodeStage::None;
                Err(err)
            }
        }
    }

    async fn try_join(&self, leader_endpoint: &str, token: &str) -> Result<()> {
        let peer = self
            .inner
            .connections
            .connect(&leader_uri(leader_endpoint))
            .await?;

        let (uuid, address) = {
            let state = self.inner.state.lock().await;
            (state.uuid, state.address.clone().unwrap_or_default())
        };
        let hostname = local_hostname();

        peer.send(&Message::join(
            uuid,
            hostname.clone(),
            address,
            token.to_string(),
        ))
        .await?;
        let welcome = match peer.receive().await? {
            Message::Welcome(payload) => payload,
            other => {
                return Err(NodeError::UnexpectedMessage(format!(
                    "expected welcome, got {}",
                    other.kind()
                )))
            }
        };
        debug!(cluster = %welcome.cluster_uuid, "welcome received");

        self.append_authorized_key(&welcome.pubkey).await?;
        self.inner
            .store
            .write_cluster_uuid(&ClusterUuidDocument {
                cluster_uuid: welcome.cluster_uuid,
            })
            .await?;

        {
            let mut state = self.inner.state.lock().await;
            state.stage = NodeStage::Ready;
            state.role = NodeRole::Follower;
            state.hostname = Some(hostname);
            self.inner.store.write_node(&state).await?;
        }
        self.inner.documents.lock().await.cluster_uuid = Some(welcome.cluster_uuid);
        info!(cluster = %welcome.cluster_uuid, "joined cluster");
        Ok(())
    }

    /// Append the leader's public key to the trusted-keys file, creating the
    /// parent directory with mode 0700 when missing.
    async fn append_authorized_key(&self, pubkey: &str) -> Result<()> {
        let path = &self.inner.authorized_keys;
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                        .await?;
                }
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(pubkey.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        debug!(path = %path.display(), "trusted key appended");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        if let Some(router) = self.inner.router.lock().take() {
            router.abort();
        }
    }

    // Observables

    pub async fn stage(&self) -> NodeStage {
        self.inner.state.lock().await.stage
    }

    pub async fn role(&self) -> NodeRole {
        self.inner.state.lock().await.role
    }

    pub async fn uuid(&self) -> Uuid {
        self.inner.state.lock().await.uuid
    }

    pub async fn state_snapshot(&self) -> NodeState {
        self.inner.state.lock().await.clone()
    }

    pub async fn bootstrapping(&self) -> bool {
        self.stage().await == NodeStage::Bootstrapping
    }

    pub async fn bootstrapped(&self) -> bool {
        self.stage().await == NodeStage::Bootstrapped
    }

    pub async fn joining(&self) -> bool {
        self.stage().await == NodeStage::Joining
    }

    pub async fn ready(&self) -> bool {
        self.stage().await == NodeStage::Ready
    }

    /// The join token, present on the leader once bootstrapped.
    pub async fn token(&self) -> Option<String> {
        self.inner.documents.lock().await.token.clone()
    }

    /// The cluster identifier: from the manifest on the leader, from the
    /// welcome document on a follower.
    pub async fn cluster_uuid(&self) -> Option<Uuid> {
        let documents = self.inner.documents.lock().await;
        documents
            .manifest
            .as_ref()
            .map(|m| m.cluster_uuid)
            .or(documents.cluster_uuid)
    }
}
