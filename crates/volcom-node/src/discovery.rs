//! Controller-side presence collection.

use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use volcom_protocol::{MAX_DATAGRAM_BYTES, Message, Presence, decode_datagram};

/// An idle node seen during one discovery window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    /// Origin address: the node's advertised invite endpoint.
    pub address: SocketAddr,
    pub task_port: u16,
    pub capability: String,
    pub observed_at_epoch_ms: u64,
}

impl PresenceRecord {
    fn observed(presence: Presence) -> Self {
        let observed_at_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            address: presence.address,
            task_port: presence.task_port,
            capability: presence.capability,
            observed_at_epoch_ms,
        }
    }

    pub fn task_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.task_port)
    }
}

/// Result of one discovery window, one record per origin address.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    generation: u64,
    records: BTreeMap<SocketAddr, PresenceRecord>,
}

impl CandidateSet {
    /// Window counter this set was collected in.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&PresenceRecord> {
        self.records.get(address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.records.values()
    }

    fn upsert(&mut self, presence: Presence) {
        let record = PresenceRecord::observed(presence);
        self.records.insert(record.address, record);
    }
}

/// Listens on the discovery channel in fixed-length windows.
pub struct Discoverer {
    socket: UdpSocket,
    window: Duration,
    generation: AtomicU64,
}

impl Discoverer {
    pub async fn bind(addr: SocketAddr, window: Duration) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind discovery socket {addr}"))?;
        Ok(Self::from_socket(socket, window))
    }

    pub fn from_socket(socket: UdpSocket, window: Duration) -> Self {
        Self {
            socket,
            window,
            generation: AtomicU64::new(0),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// True while `candidates` came from the most recent window.
    pub fn is_current(&self, candidates: &CandidateSet) -> bool {
        candidates.generation == self.generation.load(Ordering::Acquire)
    }

    /// Collect presence messages for one window and return the candidates.
    ///
    /// Datagrams queued before the window opened are discarded, so no record
    /// carries over from a previous window.
    pub async fn discover(&self) -> CandidateSet {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut candidates = CandidateSet {
            generation,
            records: BTreeMap::new(),
        };
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];

        let stale = self.drain(&mut buf);
        if stale > 0 {
            debug!(stale, "dropped datagrams queued before the window");
        }

        let deadline = Instant::now() + self.window;
        info!(generation, window_ms = self.window.as_millis() as u64, "discovery window open");
        loop {
            let (len, from) =
                match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(Err(e)) => {
                        warn!(err = %e, "discovery receive failed");
                        continue;
                    }
                    Ok(Ok(received)) => received,
                };

            match decode_datagram(&buf[..len]) {
                Ok(Message::Presence(presence)) => {
                    debug!(%from, address = %presence.address, capability = %presence.capability, "presence");
                    candidates.upsert(presence);
                }
                Ok(other) => debug!(%from, kind = %other.kind(), "ignoring non-presence datagram"),
                Err(e) => debug!(%from, err = %e, "discarding malformed datagram"),
            }
        }

        info!(generation, candidates = candidates.len(), "discovery window closed");
        candidates
    }

    fn drain(&self, buf: &mut [u8]) -> usize {
        let mut dropped = 0;
        while self.socket.try_recv_from(buf).is_ok() {
            dropped += 1;
        }
        dropped
    }
}
