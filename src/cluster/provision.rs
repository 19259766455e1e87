// # Provisioner interface
//
// The actual cluster bring-up is performed by an external helper process.
// The core only needs three operations from it: host facts (network
// interfaces), the one-shot bootstrap run, and the host public key handed to
// welcomed members. The trait keeps the core testable; `CommandProvisioner`
// is the production implementation shelling out to the configured helper.

use crate::error::{NodeError, Result};
use async_trait::async_trait;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;

/// One network interface as reported by the provisioner. `ipv4_address` may
/// carry a `/mask` suffix.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInterface {
    pub name: String,
    pub iftype: String,
    pub ipv4_address: String,
}

/// Host facts. Interface enumeration order is preserved exactly as the
/// provisioner reported it; address selection depends on it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Facts {
    #[serde(default)]
    pub interfaces: InterfaceMap,
}

/// An ordered list of interfaces decoded from the provisioner's JSON map.
/// A plain map type would lose document order, so this decodes entry by
/// entry in encounter order.
#[derive(Debug, Clone, Default)]
pub struct InterfaceMap(pub Vec<NetworkInterface>);

#[derive(Deserialize)]
struct RawInterface {
    #[serde(default)]
    iftype: String,
    #[serde(default)]
    ipv4_address: String,
}

impl<'de> Deserialize<'de> for InterfaceMap {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct InterfaceMapVisitor;

        impl<'de> Visitor<'de> for InterfaceMapVisitor {
            type Value = InterfaceMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a map of interface name to interface facts")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut interfaces = Vec::new();
                while let Some((name, raw)) = map.next_entry::<String, RawInterface>()? {
                    interfaces.push(NetworkInterface {
                        name,
                        iftype: raw.iftype,
                        ipv4_address: raw.ipv4_address,
                    });
                }
                Ok(InterfaceMap(interfaces))
            }
        }

        deserializer.deserialize_map(InterfaceMapVisitor)
    }
}

/// Output of the provisioner's bootstrap run.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub returncode: i32,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Gather host facts (network interfaces).
    async fn gather_facts(&self) -> Result<Facts>;

    /// Run the cluster bring-up against the selected address.
    async fn bootstrap(&self, address: &str) -> Result<ProcessOutput>;

    /// The host public key in OpenSSH authorized-keys format, single line.
    async fn get_public_key(&self) -> Result<String>;
}

/// Production provisioner: invokes the configured helper binary with the
/// subcommands `facts`, `bootstrap <addr>`, and `public-key`.
pub struct CommandProvisioner {
    program: PathBuf,
}

impl CommandProvisioner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                NodeError::Provisioner(format!("{} {}: {}", self.program.display(), args.join(" "), e))
            })
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn gather_facts(&self) -> Result<Facts> {
        let output = self.run(&["facts"]).await?;
        if !output.status.success() {
            return Err(NodeError::Provisioner(format!(
                "facts failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| NodeError::Provisioner(format!("facts output: {}", e)))
    }

    async fn bootstrap(&self, address: &str) -> Result<ProcessOutput> {
        let output = self.run(&["bootstrap", address]).await?;
        Ok(ProcessOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            returncode: output.status.code().unwrap_or(-1),
        })
    }

    async fn get_public_key(&self) -> Result<String> {
        let output = self.run(&["public-key"]).await?;
        if !output.status.success() {
            return Err(NodeError::Provisioner(format!(
                "public-key failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Hostname of this host, empty when the OS will not tell us.
pub fn local_hostname() -> String {
    sys_info::hostname().unwrap_or_default()
}
