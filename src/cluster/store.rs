// # Node control-file store
//
// Typed persistence for the four small JSON documents a node keeps under its
// configuration directory:
//
// | key            | file               |
// |----------------|--------------------|
// | `node`         | node.json          |
// | `manifest`     | manifest.json      |
// | `token`        | token.json         |
// | `cluster_uuid` | cluster_uuid.json  |
//
// Every write goes through a sibling temp file, fsync, and rename, so a
// reader never observes a half-written document. A missing file is not an
// error; it encodes lifecycle stage. A file that fails schema validation is
// `CorruptState`, and a combination of files that violates the cross-file
// invariants is `InconsistentState`.

use crate::cluster::state::{ClusterUuidDocument, Manifest, NodeStage, NodeState, TokenDocument};
use crate::error::{NodeError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub struct NodeStore {
    confdir: PathBuf,
}

/// Everything the store holds, loaded in one invariant-checked pass.
#[derive(Debug, Clone, Default)]
pub struct StoredDocuments {
    pub node: Option<NodeState>,
    pub manifest: Option<Manifest>,
    pub token: Option<TokenDocument>,
    pub cluster_uuid: Option<ClusterUuidDocument>,
}

impl NodeStore {
    pub fn new(confdir: impl Into<PathBuf>) -> Self {
        Self {
            confdir: confdir.into(),
        }
    }

    pub fn confdir(&self) -> &Path {
        &self.confdir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.confdir.join(format!("{}.json", key))
    }

    async fn write_document<T: Serialize>(&self, key: &str, document: &T) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.confdir.join(format!("{}.json.tmp", key));
        let data = serde_json::to_vec_pretty(document)?;

        let write = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        };
        write
            .await
            .map_err(|e| NodeError::WriteFailed(format!("{}: {}", path.display(), e)))
    }

    async fn read_document<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| NodeError::CorruptState(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NodeError::Io(e)),
        }
    }

    pub async fn read_node(&self) -> Result<Option<NodeState>> {
        self.read_document("node").await
    }

    pub async fn write_node(&self, state: &NodeState) -> Result<()> {
        self.write_document("node", state).await
    }

    pub async fn read_manifest(&self) -> Result<Option<Manifest>> {
        self.read_document("manifest").await
    }

    pub async fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        self.write_document("manifest", manifest).await
    }

    pub async fn read_token(&self) -> Result<Option<TokenDocument>> {
        self.read_document("token").await
    }

    pub async fn write_token(&self, token: &TokenDocument) -> Result<()> {
        self.write_document("token", token).await
    }

    pub async fn read_cluster_uuid(&self) -> Result<Option<ClusterUuidDocument>> {
        self.read_document("cluster_uuid").await
    }

    pub async fn write_cluster_uuid(&self, doc: &ClusterUuidDocument) -> Result<()> {
        self.write_document("cluster_uuid", doc).await
    }

    /// Load all documents and enforce the cross-file invariants:
    /// a manifest requires node state at stage Bootstrapped or later, token
    /// and manifest exist together, and a cluster uuid implies a Ready node.
    pub async fn load(&self) -> Result<StoredDocuments> {
        let documents = StoredDocuments {
            node: self.read_node().await?,
            manifest: self.read_manifest().await?,
            token: self.read_token().await?,
            cluster_uuid: self.read_cluster_uuid().await?,
        };

        if let Some(manifest) = &documents.manifest {
            let node = documents.node.as_ref().ok_or_else(|| {
                NodeError::InconsistentState("manifest present without node state".into())
            })?;
            if node.stage < NodeStage::Bootstrapped {
                return Err(NodeError::InconsistentState(format!(
                    "manifest {} present but node stage is {:?}",
                    manifest.cluster_uuid, node.stage
                )));
            }
        }

        if documents.token.is_some() != documents.manifest.is_some() {
            return Err(NodeError::InconsistentState(
                "token and manifest must exist together".into(),
            ));
        }

        if documents.cluster_uuid.is_some() {
            let node = documents.node.as_ref().ok_or_else(|| {
                NodeError::InconsistentState("cluster uuid present without node state".into())
            })?;
            if node.stage != NodeStage::Ready {
                return Err(NodeError::InconsistentState(format!(
                    "cluster uuid present but node stage is {:?}",
                    node.stage
                )));
            }
        }

        Ok(documents)
    }
}
