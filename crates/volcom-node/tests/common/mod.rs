#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use volcom_node::{
    ControllerSettings, EngineError, Execution, NodeConfig, NodeHandle, NodeRole, RoleState,
    ScriptEngine, Target,
};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Engine stub: `sample` evaluates the one script it knows, `slow` sleeps
/// for the number of milliseconds in the script.
pub struct SampleEngine;

impl ScriptEngine for SampleEngine {
    async fn execute(&self, script: &str, engine: &str) -> Result<Execution, EngineError> {
        match engine {
            "sample" if script == "return 2+2" => Ok(Execution::success("4")),
            "sample" => Ok(Execution::failure(format!("Error: cannot evaluate {script}"))),
            "slow" => {
                let ms = script.trim().parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Execution::success("done"))
            }
            other => Err(EngineError::Unsupported(other.to_string())),
        }
    }
}

pub fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind((LOCALHOST, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

/// Loopback config with short timings. Nodes built from the same
/// `discovery_port` advertise to the same discoverer.
pub fn node_config(discovery_port: u16) -> NodeConfig {
    NodeConfig {
        bind_ip: LOCALHOST,
        advertise_ip: Some(LOCALHOST),
        discovery_port,
        invite_port: free_tcp_port(),
        task_port: free_tcp_port(),
        discovery_target: Some(SocketAddr::new(LOCALHOST, discovery_port)),
        advertise_interval_ms: 100,
        discovery_window_ms: 400,
        worker_deadline_ms: 500,
        invite_read_timeout_ms: 500,
        settle_interval_ms: 50,
        connect_timeout_ms: 500,
        result_timeout_ms: 2_000,
        capability: Some("4 cores".to_string()),
        ..NodeConfig::default()
    }
}

pub fn controller_settings() -> ControllerSettings {
    ControllerSettings {
        settle: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        result_timeout: Duration::from_secs(2),
        local_ip: None,
    }
}

pub fn target_of(node: &NodeHandle) -> Target {
    let presence = node.presence();
    Target {
        invite: presence.address,
        task: presence.task_endpoint(),
    }
}

pub async fn wait_for_role(role: &RoleState, want: NodeRole, within: Duration) {
    let mut rx = role.subscribe();
    tokio::time::timeout(within, rx.wait_for(|r| *r == want))
        .await
        .unwrap_or_else(|_| panic!("role did not become {want} within {within:?}"))
        .unwrap();
}
