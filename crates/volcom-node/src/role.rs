//! Node role state machine.
//!
//! The role lives in a `watch` channel. Acquisition of the worker slot is a
//! compare-and-set performed under the channel's lock (`send_if_modified`),
//! so two near-simultaneous invites can never both observe `Idle`.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Idle,
    Worker,
}

impl NodeRole {
    pub fn is_idle(&self) -> bool {
        matches!(self, NodeRole::Idle)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Idle => write!(f, "idle"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoleError {
    #[error("worker slot already active")]
    AlreadyActive,
}

/// Why a worker instantiation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertCause {
    /// Task executed and its result written back.
    Completed,
    /// Task connection ended before a Task arrived.
    Closed,
    /// Deadline passed with no task connection or no Task.
    TimedOut,
    /// Local transport failure, or the session was dropped without finishing.
    Aborted,
}

impl fmt::Display for RevertCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertCause::Completed => write!(f, "completed"),
            RevertCause::Closed => write!(f, "closed"),
            RevertCause::TimedOut => write!(f, "timed_out"),
            RevertCause::Aborted => write!(f, "aborted"),
        }
    }
}

/// Shared handle to a node's role. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct RoleState {
    tx: Arc<watch::Sender<NodeRole>>,
}

impl RoleState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(NodeRole::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> NodeRole {
        *self.tx.borrow()
    }

    /// Watch role transitions.
    pub fn subscribe(&self) -> watch::Receiver<NodeRole> {
        self.tx.subscribe()
    }

    /// Take the worker slot: `Idle -> Worker`.
    ///
    /// Fails with [`RoleError::AlreadyActive`] when the node is already a
    /// worker. The returned guard puts the node back to `Idle` when released
    /// or dropped.
    pub fn try_acquire(&self) -> Result<WorkerSlot, RoleError> {
        let acquired = self.tx.send_if_modified(|role| match role {
            NodeRole::Idle => {
                *role = NodeRole::Worker;
                true
            }
            NodeRole::Worker => false,
        });

        if !acquired {
            return Err(RoleError::AlreadyActive);
        }
        info!("role transition idle -> worker");
        Ok(WorkerSlot {
            state: self.clone(),
            released: false,
        })
    }

    fn release(&self, cause: RevertCause) {
        let reverted = self.tx.send_if_modified(|role| match role {
            NodeRole::Worker => {
                *role = NodeRole::Idle;
                true
            }
            NodeRole::Idle => false,
        });
        if reverted {
            info!(%cause, "role transition worker -> idle");
        }
    }
}

impl Default for RoleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive ownership of the worker role.
#[must_use = "dropping the slot immediately reverts the node to idle"]
#[derive(Debug)]
pub struct WorkerSlot {
    state: RoleState,
    released: bool,
}

impl WorkerSlot {
    pub fn release(mut self, cause: RevertCause) {
        self.released = true;
        self.state.release(cause);
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if !self.released {
            warn!("worker slot dropped without release");
            self.state.release(RevertCause::Aborted);
        }
    }
}
