/// Persisted cluster state model
///
/// This module defines the documents a node keeps on disk: its own state
/// (identity, role, lifecycle stage), the cluster manifest authored by the
/// leader, the shared join token, and the cluster identifier written on a
/// follower once it has been welcomed.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle stage of a node. Stages only move forward; the ordering is
/// meaningful (`stage >= Bootstrapped` means a manifest exists).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeStage {
    None,
    Bootstrapping,
    Bootstrapped,
    Joining,
    Ready,
}

/// Role of a node within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Not yet part of any cluster
    None,
    /// Bootstrapped the cluster; authors the manifest
    Leader,
    /// Joined an existing cluster
    Follower,
}

/// Per-host node state, persisted as `node.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub uuid: Uuid,
    pub role: NodeRole,
    pub stage: NodeStage,
    pub address: Option<String>,
    pub hostname: Option<String>,
}

impl NodeState {
    /// A brand-new node: fresh uuid, no role, no stage.
    pub fn fresh() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            role: NodeRole::None,
            stage: NodeStage::None,
            address: None,
            hostname: None,
        }
    }
}

/// Cluster manifest, authored by the leader and persisted as `manifest.json`.
/// The leader's own state snapshot is always the first entry in `nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub cluster_uuid: Uuid,
    pub version: u64,
    pub modified: DateTime<Utc>,
    pub nodes: Vec<NodeState>,
}

impl Manifest {
    /// First manifest of a fresh cluster: version 1, leader only.
    pub fn initial(cluster_uuid: Uuid, leader: NodeState) -> Self {
        Self {
            cluster_uuid,
            version: 1,
            modified: Utc::now(),
            nodes: vec![leader],
        }
    }
}

/// Shared secret gating joins, persisted as `token.json` on the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDocument {
    pub token: String,
}

/// Cluster identifier written on a follower when it is welcomed,
/// persisted as `cluster_uuid.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterUuidDocument {
    pub cluster_uuid: Uuid,
}

const TOKEN_CHARSET: &[u8] = b"0123456789abcdef";

/// Generate a join token: four groups of four hex digits, `-` separated.
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    let group = |rng: &mut rand::rngs::ThreadRng| -> String {
        (0..4)
            .map(|_| TOKEN_CHARSET[rng.random_range(0..TOKEN_CHARSET.len())] as char)
            .collect()
    };
    (0..4)
        .map(|_| group(&mut rng))
        .collect::<Vec<_>>()
        .join("-")
}

/// Check the `xxxx-xxxx-xxxx-xxxx` token shape.
pub fn is_valid_token(token: &str) -> bool {
    let groups: Vec<&str> = token.split('-').collect();
    groups.len() == 4
        && groups
            .iter()
            .all(|g| g.len() == 4 && g.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state() {
        let state = NodeState::fresh();
        assert_eq!(state.role, NodeRole::None);
        assert_eq!(state.stage, NodeStage::None);
        assert!(state.address.is_none());
        assert!(state.hostname.is_none());
    }

    #[test]
    fn test_stage_ordering() {
        assert!(NodeStage::None < NodeStage::Bootstrapping);
        assert!(NodeStage::Bootstrapping < NodeStage::Bootstrapped);
        assert!(NodeStage::Bootstrapped < NodeStage::Joining);
        assert!(NodeStage::Joining < NodeStage::Ready);
    }

    #[test]
    fn test_state_roundtrip() {
        let state = NodeState {
            uuid: Uuid::new_v4(),
            role: NodeRole::Leader,
            stage: NodeStage::Bootstrapped,
            address: Some("10.0.0.5".into()),
            hostname: Some("node-1".into()),
        };
        let raw = serde_json::to_string(&state).unwrap();
        let back: NodeState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_initial_manifest() {
        let leader = NodeState::fresh();
        let cluster_uuid = Uuid::new_v4();
        let manifest = Manifest::initial(cluster_uuid, leader.clone());
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.nodes, vec![leader]);
        assert_eq!(manifest.cluster_uuid, cluster_uuid);
    }

    #[test]
    fn test_token_shape() {
        for _ in 0..32 {
            let token = generate_token();
            assert!(is_valid_token(&token), "bad token: {}", token);
        }
        assert!(!is_valid_token("a1b2c3d4e5f60011"));
        assert!(!is_valid_token("a1b2-c3d4-e5f6"));
        assert!(!is_valid_token("A1B2-C3D4-E5F6-0011"));
        assert!(!is_valid_token("a1b2-c3d4-e5f6-001"));
    }
}
