//! Node runtime: advertiser plus the idle -> worker -> idle cycle.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use volcom_protocol::Presence;

use crate::advertiser::Advertiser;
use crate::config::NodeConfig;
use crate::engine::ScriptEngine;
use crate::invite::InviteListener;
use crate::role::RoleState;
use crate::worker::{self, WorkerSettings};

/// Handle to a running node. Dropping it aborts the node's tasks without
/// waiting for them; [`NodeHandle::shutdown`] stops them and waits.
pub struct NodeHandle {
    role: RoleState,
    presence: Presence,
    invite_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<Result<()>>,
}

impl NodeHandle {
    pub fn role(&self) -> &RoleState {
        &self.role
    }

    /// What this node puts on the discovery channel.
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Local address of the first invite endpoint.
    pub fn invite_addr(&self) -> SocketAddr {
        self.invite_addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            joined.context("node task panicked")??;
        }
        info!("node stopped");
        Ok(())
    }
}

/// Start advertising and serving invites.
///
/// The first invite endpoint is bound before this returns so that bind
/// errors reach the caller.
pub async fn start<E: ScriptEngine>(config: NodeConfig, engine: E) -> Result<NodeHandle> {
    let role = RoleState::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = InviteListener::bind(
        config.invite_addr(),
        config.invite_read_timeout(),
        config.max_pending_invites,
    )
    .await?;
    let invite_addr = listener.local_addr()?;

    let presence = Presence {
        address: config.advertised_invite_addr(),
        task_port: config.task_port,
        capability: config.capability(),
    };

    let socket = UdpSocket::bind(SocketAddr::new(config.bind_ip, 0))
        .await
        .context("failed to bind advertiser socket")?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast")?;

    info!(
        address = %presence.address,
        task_port = presence.task_port,
        capability = %presence.capability,
        "node starting"
    );

    let mut tasks = JoinSet::new();
    let advertiser = Advertiser::new(
        presence.clone(),
        config.discovery_target(),
        config.advertise_interval(),
    );
    tasks.spawn(advertiser.run(socket, role.subscribe(), shutdown_rx.clone()));
    tasks.spawn(idle_cycle(
        config,
        role.clone(),
        engine,
        listener,
        shutdown_rx,
    ));

    Ok(NodeHandle {
        role,
        presence,
        invite_addr,
        shutdown_tx,
        tasks,
    })
}

async fn idle_cycle<E: ScriptEngine>(
    config: NodeConfig,
    role: RoleState,
    engine: E,
    first: InviteListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let settings = WorkerSettings {
        task_addr: config.task_addr(),
        deadline: config.worker_deadline(),
    };
    let mut next = Some(first);

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let listener = match next.take() {
            Some(listener) => listener,
            None => match InviteListener::bind(
                config.invite_addr(),
                config.invite_read_timeout(),
                config.max_pending_invites,
            )
            .await
            {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(err = %e, "invite endpoint unavailable, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(config.advertise_interval()) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    continue;
                }
            },
        };

        let invitation = tokio::select! {
            invitation = listener.accept_invite(&role) => invitation,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                continue;
            }
        };

        // Shutdown mid-session drops the slot, which reverts the role.
        tokio::select! {
            cause = worker::run_session(invitation, &settings, &engine) => {
                info!(%cause, "worker session ended");
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}
