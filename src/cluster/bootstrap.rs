// # Bootstrap driver
//
// One-shot bring-up of a fresh cluster on this host. The driver checks
// eligibility, picks the node's network address from provisioner facts, and
// then runs the heavy lifting in a background task so the caller returns
// immediately. Progress is observable through the driver stage:
//
// ```text
//  None ──► Running ──► Done
//                 └──► Error
// ```
//
// The task handle is retained so shutdown and tests can await completion.
// Once the provision step starts it always runs to completion; there is no
// cancellation and no rollback of partial state (recovery is manual).

use crate::cluster::node::NodeManager;
use crate::cluster::provision::{local_hostname, Provisioner};
use crate::error::{NodeError, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
    None,
    Running,
    Done,
    Error,
}

/// Cheaply clonable handle; the background task holds one clone.
#[derive(Clone)]
pub struct BootstrapDriver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    manager: NodeManager,
    provisioner: Arc<dyn Provisioner>,
    stage: parking_lot::RwLock<BootstrapStage>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BootstrapDriver {
    pub fn new(manager: NodeManager, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                manager,
                provisioner,
                stage: parking_lot::RwLock::new(BootstrapStage::None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn stage(&self) -> BootstrapStage {
        *self.inner.stage.read()
    }

    /// Kick off the bootstrap. Returns false when this node is not eligible
    /// or no usable address could be selected; returns true once the
    /// background task has been launched.
    pub async fn bootstrap(&self) -> Result<bool> {
        if let Err(err) = self.inner.manager.prepare_bootstrap().await {
            warn!(error = %err, "node cannot bootstrap");
            return Ok(false);
        }

        let address = match self.select_address().await {
            Ok(address) => address,
            Err(err) => {
                error!(error = %err, "unable to select a network address");
                return Ok(false);
            }
        };
        info!(address = %address, "bootstrap address selected");

        let driver = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = driver.run(address).await {
                error!(error = %err, "bootstrap failed");
                *driver.inner.stage.write() = BootstrapStage::Error;
            }
        });
        *self.inner.task.lock().await = Some(handle);
        Ok(true)
    }

    /// Pick the node address from provisioner facts: skip loopback, take the
    /// first remaining interface in enumeration order, strip any `/mask`
    /// suffix.
    pub(crate) async fn select_address(&self) -> Result<String> {
        let facts = self
            .inner
            .provisioner
            .gather_facts()
            .await
            .map_err(|e| NodeError::NetworkAddressNotFound(e.to_string()))?;

        if facts.interfaces.0.is_empty() {
            return Err(NodeError::NetworkAddressNotFound(
                "interface facts not available".into(),
            ));
        }

        let selected = facts
            .interfaces
            .0
            .iter()
            .find(|nic| nic.iftype != "loopback")
            .ok_or_else(|| NodeError::NetworkAddressNotFound("no address available".into()))?;

        if selected.ipv4_address.is_empty() {
            return Err(NodeError::NetworkAddressNotFound(
                "no address available".into(),
            ));
        }

        let address = match selected.ipv4_address.find('/') {
            Some(idx) => &selected.ipv4_address[..idx],
            None => selected.ipv4_address.as_str(),
        };
        Ok(address.to_string())
    }

    async fn run(&self, address: String) -> Result<()> {
        self.inner
            .manager
            .start_bootstrap(&address, &local_hostname())
            .await?;
        *self.inner.stage.write() = BootstrapStage::Running;

        let output = self
            .inner
            .provisioner
            .bootstrap(&address)
            .await
            .map_err(|e| NodeError::BootstrapFailed(e.to_string()))?;
        if output.returncode != 0 {
            return Err(NodeError::BootstrapFailed(format!(
                "provisioner exited with rc={}: {}",
                output.returncode,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        self.inner.manager.finish_bootstrap().await?;
        *self.inner.stage.write() = BootstrapStage::Done;
        info!("bootstrap complete");
        Ok(())
    }

    /// Await the background task, if one was launched.
    pub async fn wait_finished(&self) {
        if let Some(handle) = self.inner.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::connection::ConnectionManager;
    use crate::cluster::provision::{Facts, ProcessOutput};
    use crate::config::NodeConfig;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct FactsProvisioner {
        facts_json: &'static str,
    }

    #[async_trait]
    impl Provisioner for FactsProvisioner {
        async fn gather_facts(&self) -> Result<Facts> {
            Ok(serde_json::from_str(self.facts_json).unwrap())
        }

        async fn bootstrap(&self, _address: &str) -> Result<ProcessOutput> {
            Ok(ProcessOutput {
                stdout: Vec::new(),
                stderr: Vec::new(),
                returncode: 0,
            })
        }

        async fn get_public_key(&self) -> Result<String> {
            Ok("ssh-ed25519 AAAATEST root@test".into())
        }
    }

    async fn driver(facts_json: &'static str) -> (tempfile::TempDir, BootstrapDriver) {
        let dir = tempdir().unwrap();
        let config = NodeConfig {
            confdir: dir.path().join("conf"),
            ..NodeConfig::default()
        };
        tokio::fs::create_dir_all(&config.confdir).await.unwrap();

        let provisioner = Arc::new(FactsProvisioner { facts_json });
        let connections = Arc::new(ConnectionManager::new());
        connections.start();
        let manager = NodeManager::new(&config, connections, provisioner.clone())
            .await
            .unwrap();
        (dir, BootstrapDriver::new(manager, provisioner))
    }

    #[tokio::test]
    async fn test_select_first_non_loopback_and_strip_mask() {
        let (_dir, driver) = driver(
            r#"{"interfaces": {
                "lo": {"iftype": "loopback", "ipv4_address": "127.0.0.1/8"},
                "eth0": {"iftype": "physical", "ipv4_address": "10.0.0.5/24"},
                "eth1": {"iftype": "physical", "ipv4_address": "192.168.1.9/24"}
            }}"#,
        )
        .await;
        assert_eq!(driver.select_address().await.unwrap(), "10.0.0.5");
    }

    #[tokio::test]
    async fn test_select_bare_address() {
        let (_dir, driver) = driver(
            r#"{"interfaces": {"eth0": {"iftype": "physical", "ipv4_address": "10.0.0.5"}}}"#,
        )
        .await;
        assert_eq!(driver.select_address().await.unwrap(), "10.0.0.5");
    }

    #[tokio::test]
    async fn test_loopback_only_fails() {
        let (_dir, driver) = driver(
            r#"{"interfaces": {"lo": {"iftype": "loopback", "ipv4_address": "127.0.0.1/8"}}}"#,
        )
        .await;
        assert!(matches!(
            driver.select_address().await,
            Err(NodeError::NetworkAddressNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_no_interfaces_fails() {
        let (_dir, driver) = driver(r#"{"interfaces": {}}"#).await;
        assert!(matches!(
            driver.select_address().await,
            Err(NodeError::NetworkAddressNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_ipv4_fails() {
        let (_dir, driver) = driver(r#"{"interfaces": {"eth0": {"iftype": "physical"}}}"#).await;
        assert!(matches!(
            driver.select_address().await,
            Err(NodeError::NetworkAddressNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_with_loopback_only_returns_false() {
        let (_dir, driver) = driver(
            r#"{"interfaces": {"lo": {"iftype": "loopback", "ipv4_address": "127.0.0.1/8"}}}"#,
        )
        .await;
        assert!(!driver.bootstrap().await.unwrap());
        assert_eq!(driver.stage(), BootstrapStage::None);
    }
}
