//! Idle-side invite endpoint.

use anyhow::{Context, anyhow, bail};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};
use volcom_protocol::{Message, MessageCodec};

use crate::role::{RoleError, RoleState, WorkerSlot};

/// An accepted invite: the node now owns the worker slot.
#[derive(Debug)]
pub struct Invitation {
    pub slot: WorkerSlot,
    /// Peer that sent the winning invite; the only source allowed to send the task.
    pub controller: SocketAddr,
}

/// Single-use listener: lives for one idle cycle and closes once an invite wins.
pub struct InviteListener {
    listener: TcpListener,
    read_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl InviteListener {
    pub async fn bind(
        addr: SocketAddr,
        read_timeout: Duration,
        max_pending: usize,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind invite endpoint {addr}"))?;
        Ok(Self {
            listener,
            read_timeout,
            permits: Arc::new(Semaphore::new(max_pending.max(1))),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait until an invite takes the worker slot.
    ///
    /// Each connection is read by a bounded pool of handlers. Invites that
    /// lose the slot are dropped without a reply and listening continues.
    /// The endpoint is closed when this returns.
    pub async fn accept_invite(self, role: &RoleState) -> Invitation {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(err = %e, "invite accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                        warn!(%peer, "too many pending invite connections, dropping");
                        continue;
                    };
                    let read_timeout = self.read_timeout;
                    handlers.spawn(async move {
                        let _permit = permit;
                        read_invite(stream, read_timeout).await.map(|()| peer).map_err(|e| (peer, e))
                    });
                }
                Some(joined) = handlers.join_next() => {
                    let peer = match joined {
                        Ok(Ok(peer)) => peer,
                        Ok(Err((peer, e))) => {
                            warn!(%peer, err = %e, "discarding invite connection");
                            continue;
                        }
                        Err(e) => {
                            warn!(err = %e, "invite handler failed");
                            continue;
                        }
                    };
                    match role.try_acquire() {
                        Ok(slot) => {
                            info!(%peer, "invite accepted");
                            return Invitation { slot, controller: peer };
                        }
                        Err(RoleError::AlreadyActive) => {
                            info!(%peer, "invite rejected, worker already active");
                        }
                    }
                }
            }
        }
    }
}

/// Read exactly one message and require it to be an Invite.
async fn read_invite(stream: TcpStream, read_timeout: Duration) -> anyhow::Result<()> {
    let mut framed = FramedRead::new(stream, MessageCodec::new());
    match tokio::time::timeout(read_timeout, framed.next()).await {
        Err(_) => bail!("no invite within {}ms", read_timeout.as_millis()),
        Ok(None) => bail!("connection closed before an invite arrived"),
        Ok(Some(Err(e))) => Err(anyhow!(e).context("malformed invite frame")),
        Ok(Some(Ok(Message::Invite))) => {
            debug!("invite frame received");
            Ok(())
        }
        Ok(Some(Ok(other))) => bail!("unexpected {} message on invite endpoint", other.kind()),
    }
}
