//! Controller side: invite a discovered node, hand it a task, collect the result.

use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::Instant;
use tokio_util::codec::{Framed, FramedWrite};
use tracing::{info, warn};
use volcom_protocol::{CodecError, Message, MessageCodec, MessageKind, Task, TaskResult};

use crate::config::NodeConfig;
use crate::discovery::{CandidateSet, Discoverer, PresenceRecord};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("candidate set from discovery window {generation} is stale")]
    StaleCandidates { generation: u64 },

    #[error("{0} is not in the current candidate set")]
    UnknownCandidate(SocketAddr),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    #[error("failed to send {kind} to {addr}: {source}")]
    Send {
        kind: MessageKind,
        addr: SocketAddr,
        #[source]
        source: CodecError,
    },

    #[error("worker at {0} closed the connection without a result")]
    Closed(SocketAddr),

    #[error("transport error from {addr}: {source}")]
    Transport {
        addr: SocketAddr,
        #[source]
        source: CodecError,
    },

    #[error("no result from {addr} within {timeout_ms}ms")]
    Timeout { addr: SocketAddr, timeout_ms: u64 },
}

/// Endpoints of a node that is about to become a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub invite: SocketAddr,
    pub task: SocketAddr,
}

impl From<&PresenceRecord> for Target {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            invite: record.address,
            task: record.task_endpoint(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Pause between the invite and the task connection.
    pub settle: Duration,
    pub connect_timeout: Duration,
    pub result_timeout: Duration,
    /// Source address for outgoing connections. The worker only serves the
    /// task connection that comes from the IP it was invited by.
    pub local_ip: Option<IpAddr>,
}

impl From<&NodeConfig> for ControllerSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            settle: config.settle_interval(),
            connect_timeout: config.connect_timeout(),
            result_timeout: config.result_timeout(),
            local_ip: (!config.bind_ip.is_unspecified()).then_some(config.bind_ip),
        }
    }
}

/// Single-shot dispatch of one task to one target. Never retries.
#[derive(Debug, Clone)]
pub struct ControllerSession {
    settings: ControllerSettings,
}

impl ControllerSession {
    pub fn new(settings: ControllerSettings) -> Self {
        Self { settings }
    }

    /// Invite, settle, send the task and wait for its result.
    pub async fn dispatch(&self, target: Target, task: Task) -> Result<TaskResult, DispatchError> {
        self.invite(target.invite).await?;
        tokio::time::sleep(self.settings.settle).await;
        self.run_task(target.task, task).await
    }

    /// Send a bare Invite to an idle node's invite endpoint.
    pub async fn invite(&self, addr: SocketAddr) -> Result<(), DispatchError> {
        let stream = self.connect(addr).await?;
        let mut framed = FramedWrite::new(stream, MessageCodec::new());
        framed
            .send(Message::Invite)
            .await
            .map_err(|source| DispatchError::Send {
                kind: MessageKind::Invite,
                addr,
                source,
            })?;
        framed.close().await.map_err(|source| DispatchError::Send {
            kind: MessageKind::Invite,
            addr,
            source,
        })?;
        info!(%addr, "invite sent");
        Ok(())
    }

    /// Send `task` to a worker's task endpoint and wait for the matching result.
    pub async fn run_task(&self, addr: SocketAddr, task: Task) -> Result<TaskResult, DispatchError> {
        let stream = self.connect(addr).await?;
        let mut framed = Framed::new(stream, MessageCodec::new());

        let task_id = task.task_id.clone();
        framed
            .send(Message::Task(task))
            .await
            .map_err(|source| DispatchError::Send {
                kind: MessageKind::Task,
                addr,
                source,
            })?;
        info!(%addr, %task_id, "task sent");

        let timeout = self.settings.result_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, framed.next()).await {
                Err(_) => {
                    return Err(DispatchError::Timeout {
                        addr,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Ok(None) => return Err(DispatchError::Closed(addr)),
                Ok(Some(Err(source))) => return Err(DispatchError::Transport { addr, source }),
                Ok(Some(Ok(Message::Result(result)))) if result.task_id == task_id => {
                    info!(%addr, %task_id, success = result.success, "result received");
                    return Ok(result);
                }
                Ok(Some(Ok(Message::Result(result)))) => {
                    warn!(%addr, expected = %task_id, got = %result.task_id, "ignoring result for another task");
                }
                Ok(Some(Ok(other))) => {
                    warn!(%addr, kind = %other.kind(), "ignoring unexpected message while waiting for a result");
                }
            }
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, DispatchError> {
        let connecting = async {
            let Some(ip) = self.settings.local_ip else {
                return TcpStream::connect(addr).await;
            };
            let socket = if ip.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            socket.connect(addr).await
        };
        match tokio::time::timeout(self.settings.connect_timeout, connecting).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(DispatchError::Connect { addr, source }),
            Err(_) => Err(DispatchError::ConnectTimeout(addr)),
        }
    }
}

/// Discovery plus dispatch, refusing to act on candidates from an older window.
pub struct Controller {
    discoverer: Discoverer,
    session: ControllerSession,
}

impl Controller {
    pub fn new(discoverer: Discoverer, settings: ControllerSettings) -> Self {
        Self {
            discoverer,
            session: ControllerSession::new(settings),
        }
    }

    pub async fn bind(config: &NodeConfig) -> anyhow::Result<Self> {
        let discoverer =
            Discoverer::bind(config.discovery_bind_addr(), config.discovery_window()).await?;
        Ok(Self::new(discoverer, ControllerSettings::from(config)))
    }

    pub fn discoverer(&self) -> &Discoverer {
        &self.discoverer
    }

    pub async fn discover(&self) -> CandidateSet {
        self.discoverer.discover().await
    }

    /// Dispatch `task` to the candidate advertised at `address`.
    pub async fn dispatch(
        &self,
        candidates: &CandidateSet,
        address: SocketAddr,
        task: Task,
    ) -> Result<TaskResult, DispatchError> {
        if !self.discoverer.is_current(candidates) {
            return Err(DispatchError::StaleCandidates {
                generation: candidates.generation(),
            });
        }
        let record = candidates
            .get(&address)
            .ok_or(DispatchError::UnknownCandidate(address))?;
        self.session.dispatch(Target::from(record), task).await
    }
}
