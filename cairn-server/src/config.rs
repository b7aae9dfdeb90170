use cairn_core::{CairnError, ClientConfig, NodeRole, Result, ServerDescriptor};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Present only on machines that run a node.
    #[serde(default)]
    pub node: Option<NodeConfig>,
    /// Shared secret, trackers and transfer knobs.
    #[serde(default)]
    pub client: ClientConfig,
    /// Static storage member list used by the client commands and seeded into a
    /// tracker's registry. When empty, the client commands sync members from the
    /// trackers instead.
    #[serde(default)]
    pub members: Vec<ServerDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node_id: Option<String>,
    pub bind_addr: String,
    #[serde(default)]
    pub advertise_addr: Option<String>,
    pub group: String,
    pub instance: String,
    #[serde(default)]
    pub role: NodeRole,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_expiry_interval_secs")]
    pub expiry_interval_secs: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_expiry_interval_secs() -> u64 {
    10
}

impl NodeConfig {
    /// Descriptor announced to trackers. The port is fixed up once the listener is bound.
    pub fn descriptor(&self) -> Result<ServerDescriptor> {
        let addr: SocketAddr = self.bind_addr.parse().map_err(|e| {
            CairnError::Config(format!("invalid bind_addr '{}': {}", self.bind_addr, e))
        })?;
        let node_id = self
            .node_id
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| ulid::Ulid::new().to_string());

        let mut descriptor = ServerDescriptor::new(node_id, addr.ip().to_string(), addr.port())
            .with_group(&self.group)
            .with_instance(&self.instance)
            .read_only(self.read_only);
        descriptor.advertise_addr = self.advertise_addr.clone();
        Ok(descriptor)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs.max(1))
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("CAIRN").separator("__"))
            .build()
            .map_err(|e| CairnError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| CairnError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(node) = &self.node {
            if node.group.trim().is_empty() || node.instance.trim().is_empty() {
                return Err(CairnError::Config(
                    "node.group and node.instance must not be empty".to_string(),
                ));
            }
            node.descriptor()?;
        }
        if self.client.max_conn_per_server == 0 {
            return Err(CairnError::Config(
                "client.max_conn_per_server must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
