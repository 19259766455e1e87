// Bootstrap Integration Tests
// A fresh host bringing up a brand-new cluster, driven end to end through
// the core with a scripted provisioner.

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::tempdir;
use tidepool::cluster::provision::ProcessOutput;
use tidepool::cluster::state::is_valid_token;
use tidepool::cluster::{BootstrapStage, Core, Facts, NodeRole, NodeStage, Provisioner};
use tidepool::error::Result;
use tidepool::NodeConfig;

struct ScriptedProvisioner {
    returncode: i32,
}

#[async_trait]
impl Provisioner for ScriptedProvisioner {
    async fn gather_facts(&self) -> Result<Facts> {
        Ok(serde_json::from_str(
            r#"{"interfaces": {
                "lo": {"iftype": "loopback", "ipv4_address": "127.0.0.1/8"},
                "eth0": {"iftype": "physical", "ipv4_address": "10.0.0.5/24"}
            }}"#,
        )
        .unwrap())
    }

    async fn bootstrap(&self, _address: &str) -> Result<ProcessOutput> {
        Ok(ProcessOutput {
            stdout: b"bring-up log".to_vec(),
            stderr: b"rc failure".to_vec(),
            returncode: self.returncode,
        })
    }

    async fn get_public_key(&self) -> Result<String> {
        Ok("ssh-ed25519 AAAATEST root@leader".into())
    }
}

async fn new_core(dir: &tempfile::TempDir, returncode: i32) -> (NodeConfig, Arc<Core>) {
    let config = NodeConfig {
        confdir: dir.path().join("conf"),
        authorized_keys: dir.path().join("ssh").join("authorized_keys"),
        ..NodeConfig::default()
    };
    let core = Core::new(
        config.clone(),
        Arc::new(ScriptedProvisioner { returncode }),
    )
    .await
    .unwrap();
    (config, Arc::new(core))
}

#[tokio::test]
async fn test_bootstrap_happy_path() {
    let dir = tempdir().unwrap();
    let (config, core) = new_core(&dir, 0).await;
    core.start().await;

    assert_eq!(core.bootstrap().stage(), BootstrapStage::None);
    assert!(core.bootstrap().bootstrap().await.unwrap());
    core.bootstrap().wait_finished().await;

    assert_eq!(core.bootstrap().stage(), BootstrapStage::Done);
    assert_eq!(core.nodes().stage().await, NodeStage::Bootstrapped);
    assert_eq!(core.nodes().role().await, NodeRole::Leader);

    // the first non-loopback interface won, mask stripped
    let state = core.nodes().state_snapshot().await;
    assert_eq!(state.address.as_deref(), Some("10.0.0.5"));

    assert!(config.confdir.join("node.json").exists());
    assert!(config.confdir.join("manifest.json").exists());
    assert!(config.confdir.join("token.json").exists());
    assert!(is_valid_token(&core.nodes().token().await.unwrap()));
}

#[tokio::test]
async fn test_bootstrap_is_one_shot() {
    let dir = tempdir().unwrap();
    let (_config, core) = new_core(&dir, 0).await;
    core.start().await;

    assert!(core.bootstrap().bootstrap().await.unwrap());
    core.bootstrap().wait_finished().await;

    // the node is no longer vanilla; a second attempt fails eligibility
    assert!(!core.bootstrap().bootstrap().await.unwrap());
    assert_eq!(core.bootstrap().stage(), BootstrapStage::Done);
}

#[tokio::test]
async fn test_bootstrap_provisioner_failure() {
    let dir = tempdir().unwrap();
    let (config, core) = new_core(&dir, 2).await;
    core.start().await;

    assert!(core.bootstrap().bootstrap().await.unwrap());
    core.bootstrap().wait_finished().await;

    assert_eq!(core.bootstrap().stage(), BootstrapStage::Error);
    // the driver does not roll back: the node stays in Bootstrapping and
    // never produced a manifest or token
    assert_eq!(core.nodes().stage().await, NodeStage::Bootstrapping);
    assert!(!config.confdir.join("manifest.json").exists());
    assert!(!config.confdir.join("token.json").exists());
}

#[tokio::test]
async fn test_bootstrapped_state_survives_restart() {
    let dir = tempdir().unwrap();
    let (_config, core) = new_core(&dir, 0).await;
    core.start().await;
    assert!(core.bootstrap().bootstrap().await.unwrap());
    core.bootstrap().wait_finished().await;

    let uuid = core.nodes().uuid().await;
    let token = core.nodes().token().await.unwrap();
    let cluster_uuid = core.nodes().cluster_uuid().await.unwrap();
    let state = core.nodes().state_snapshot().await;
    core.shutdown().await;
    drop(core);

    let (_config, revived) = new_core(&dir, 0).await;
    revived.start().await;
    assert_eq!(revived.nodes().uuid().await, uuid);
    assert_eq!(revived.nodes().token().await.unwrap(), token);
    assert_eq!(revived.nodes().cluster_uuid().await.unwrap(), cluster_uuid);
    assert_eq!(revived.nodes().state_snapshot().await, state);
}
