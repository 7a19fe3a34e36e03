use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use volcom_protocol::{Message, Presence, encode_datagram};

use crate::role::NodeRole;

/// Broadcasts this node's presence while it is idle.
#[derive(Debug, Clone)]
pub struct Advertiser {
    presence: Presence,
    target: SocketAddr,
    interval: Duration,
}

impl Advertiser {
    pub fn new(presence: Presence, target: SocketAddr, interval: Duration) -> Self {
        Self {
            presence,
            target,
            interval,
        }
    }

    /// Advertise until shutdown. Pauses while the node is a worker and sends
    /// immediately on returning to idle. Send failures are logged only.
    pub async fn run(
        self,
        socket: UdpSocket,
        mut role: watch::Receiver<NodeRole>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let datagram = encode_datagram(&Message::Presence(self.presence.clone()))?;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                idle = async { role.wait_for(NodeRole::is_idle).await.map(|_| ()) } => {
                    if idle.is_err() {
                        return Ok(());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
            }

            info!(target = %self.target, address = %self.presence.address, "advertising presence");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match socket.send_to(&datagram, self.target).await {
                            Ok(_) => debug!(target = %self.target, "presence sent"),
                            Err(e) => warn!(target = %self.target, err = %e, "presence send failed"),
                        }
                    }
                    changed = role.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        if !role.borrow_and_update().is_idle() {
                            info!("worker active, presence paused");
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
