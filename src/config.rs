// Node configuration.
//
// A single JSON document (`tidepool.json` next to the working directory by
// default) describing where this node keeps its control files, where it
// listens, and which helper binary performs the actual provisioning work.
// Missing file means defaults; relative paths are resolved by the caller.

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    // Directory holding node.json, manifest.json, token.json, cluster_uuid.json
    pub confdir: PathBuf,
    // Address the node API (including the peer websocket endpoint) binds to
    pub listen_addr: String,
    // Helper binary driving the actual cluster bring-up
    pub provisioner_program: PathBuf,
    // Where welcomed public keys get appended
    pub authorized_keys: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            confdir: PathBuf::from("conf"),
            listen_addr: "0.0.0.0:1337".to_string(),
            provisioner_program: PathBuf::from("tidepool-provision"),
            authorized_keys: default_authorized_keys(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| NodeError::CorruptState(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(NodeError::Io(e)),
        }
    }
}

fn default_authorized_keys() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"));
    home.join(".ssh").join("authorized_keys")
}
