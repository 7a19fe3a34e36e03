use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use volcom_protocol::{DEFAULT_DISCOVERY_PORT, DEFAULT_INVITE_PORT, DEFAULT_TASK_PORT};

use crate::engine::NODE_WRAPPER;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NodeConfig {
    /// Local address every endpoint binds to.
    pub bind_ip: IpAddr,
    /// Address put into presence messages. Detected when unset.
    pub advertise_ip: Option<IpAddr>,
    pub discovery_port: u16,
    pub invite_port: u16,
    pub task_port: u16,
    /// Where presence datagrams go. Defaults to the limited broadcast address.
    pub discovery_target: Option<SocketAddr>,
    pub advertise_interval_ms: u64,
    pub discovery_window_ms: u64,
    pub worker_deadline_ms: u64,
    pub invite_read_timeout_ms: u64,
    pub max_pending_invites: usize,
    pub settle_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub result_timeout_ms: u64,
    /// Capability string advertised to controllers. Defaults to "<n> cores".
    pub capability: Option<String>,
    pub engine: EngineConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock budget for one script run.
    pub budget_ms: u64,
    /// Engine identifier -> interpreter argv. The script path is appended.
    pub commands: BTreeMap<String, Vec<String>>,
    /// Engine identifier -> template the script is substituted into at
    /// `{script}` before it is written out.
    pub wrappers: BTreeMap<String, String>,
}

impl NodeConfig {
    /// Load from `path`, or from the default config path. A missing default
    /// file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (config_path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::config_path(), false),
        };
        if !explicit && !config_path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("invalid config {}", config_path.display()))
    }

    pub fn config_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    pub fn invite_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.invite_port)
    }

    pub fn task_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.task_port)
    }

    pub fn discovery_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.discovery_port)
    }

    pub fn discovery_target(&self) -> SocketAddr {
        self.discovery_target
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.discovery_port))
    }

    /// Invite endpoint as reachable by other nodes.
    pub fn advertised_invite_addr(&self) -> SocketAddr {
        let ip = self.advertise_ip.unwrap_or_else(detect_local_ip);
        SocketAddr::new(ip, self.invite_port)
    }

    pub fn capability(&self) -> String {
        self.capability.clone().unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            format!("{cores} cores")
        })
    }

    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.advertise_interval_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn worker_deadline(&self) -> Duration {
        Duration::from_millis(self.worker_deadline_ms)
    }

    pub fn invite_read_timeout(&self) -> Duration {
        Duration::from_millis(self.invite_read_timeout_ms)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ip: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            invite_port: DEFAULT_INVITE_PORT,
            task_port: DEFAULT_TASK_PORT,
            discovery_target: None,
            advertise_interval_ms: 5_000,
            discovery_window_ms: 10_000,
            worker_deadline_ms: 10_000,
            invite_read_timeout_ms: 5_000,
            max_pending_invites: 16,
            settle_interval_ms: 1_000,
            connect_timeout_ms: 3_000,
            result_timeout_ms: 10_000,
            capability: None,
            engine: EngineConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let commands = [("node", "node"), ("python", "python3"), ("sh", "sh")]
            .into_iter()
            .map(|(engine, program)| (engine.to_string(), vec![program.to_string()]))
            .collect();
        let wrappers = BTreeMap::from([("node".to_string(), NODE_WRAPPER.to_string())]);
        Self {
            budget_ms: 30_000,
            commands,
            wrappers,
        }
    }
}

fn config_dir() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("volcom")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("volcom")
    } else {
        PathBuf::from("/tmp/volcom")
    }
}

/// Address of the interface that routes outward. Connecting a UDP socket
/// sends nothing; it only selects the source address.
fn detect_local_ip() -> IpAddr {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
