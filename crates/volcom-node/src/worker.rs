//! Worker session: one task connection, one task, then back to idle.

use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{info, warn};
use volcom_protocol::{Message, MessageCodec, Task, TaskResult};

use crate::engine::ScriptEngine;
use crate::invite::Invitation;
use crate::role::RevertCause;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub task_addr: SocketAddr,
    /// Bound on the whole session: accepting the task connection and
    /// receiving the Task on it.
    pub deadline: Duration,
}

/// Serve one worker instantiation and release the slot.
///
/// Every exit path releases the worker slot before returning, so the caller
/// can immediately start the next idle cycle.
pub async fn run_session<E: ScriptEngine>(
    invitation: Invitation,
    settings: &WorkerSettings,
    engine: &E,
) -> RevertCause {
    let Invitation { slot, controller } = invitation;
    let cause = serve(controller.ip(), settings, engine).await;
    slot.release(cause);
    cause
}

async fn serve<E: ScriptEngine>(
    controller: IpAddr,
    settings: &WorkerSettings,
    engine: &E,
) -> RevertCause {
    let listener = match TcpListener::bind(settings.task_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(addr = %settings.task_addr, err = %e, "failed to bind task endpoint");
            return RevertCause::Aborted;
        }
    };
    info!(addr = %settings.task_addr, %controller, deadline_ms = settings.deadline.as_millis() as u64, "worker waiting for task connection");

    let deadline = Instant::now() + settings.deadline;
    let stream = loop {
        match tokio::time::timeout_at(deadline, listener.accept()).await {
            Err(_) => {
                info!("no task connection before deadline");
                return RevertCause::TimedOut;
            }
            Ok(Err(e)) => {
                warn!(err = %e, "task accept failed");
                continue;
            }
            Ok(Ok((stream, peer))) if same_host(peer.ip(), controller) => {
                info!(%peer, "task connection accepted");
                break stream;
            }
            Ok(Ok((_, peer))) => {
                warn!(%peer, %controller, "rejecting task connection from a peer that did not invite");
            }
        }
    };
    // Only one connection per session.
    drop(listener);

    handle_connection(stream, deadline, engine).await
}

async fn handle_connection<E: ScriptEngine>(
    stream: TcpStream,
    deadline: Instant,
    engine: &E,
) -> RevertCause {
    let mut framed = Framed::new(stream, MessageCodec::new());

    loop {
        let task = match tokio::time::timeout_at(deadline, framed.next()).await {
            Err(_) => {
                info!("no task received before deadline");
                return RevertCause::TimedOut;
            }
            Ok(None) => {
                info!("controller closed the task connection");
                return RevertCause::Closed;
            }
            Ok(Some(Err(e))) => {
                warn!(err = %e, "task connection failed");
                return RevertCause::Closed;
            }
            Ok(Some(Ok(Message::Task(task)))) => task,
            Ok(Some(Ok(other))) => {
                warn!(kind = %other.kind(), "ignoring unexpected message while waiting for a task");
                continue;
            }
        };

        let result = execute(engine, task).await;
        let success = result.success;
        let task_id = result.task_id.clone();
        return match framed.send(Message::Result(result)).await {
            Ok(()) => {
                info!(%task_id, success, "result sent");
                RevertCause::Completed
            }
            Err(e) => {
                warn!(%task_id, err = %e, "failed to send result");
                RevertCause::Aborted
            }
        };
    }
}

/// Run a task, folding engine errors into a failed result.
pub async fn execute<E: ScriptEngine>(engine: &E, task: Task) -> TaskResult {
    info!(task_id = %task.task_id, engine = %task.engine, script_bytes = task.script.len(), "executing task");
    match engine.execute(&task.script, &task.engine).await {
        Ok(execution) => TaskResult {
            task_id: task.task_id,
            output: execution.output,
            success: execution.success,
        },
        Err(e) => {
            warn!(task_id = %task.task_id, err = %e, "engine failed");
            TaskResult {
                task_id: task.task_id,
                output: e.to_string(),
                success: false,
            }
        }
    }
}

fn same_host(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, Execution};

    struct Echo;

    impl ScriptEngine for Echo {
        async fn execute(&self, script: &str, engine: &str) -> Result<Execution, EngineError> {
            match engine {
                "echo" => Ok(Execution::success(script)),
                "fail" => Ok(Execution::failure("Error: exit 1")),
                other => Err(EngineError::Unsupported(other.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn execute_keeps_task_id() {
        let task = Task::new("hello", "echo");
        let id = task.task_id.clone();
        let result = execute(&Echo, task).await;
        assert_eq!(result.task_id, id);
        assert_eq!(result.output, "hello");
        assert!(result.success);
    }

    #[tokio::test]
    async fn engine_failure_is_a_failed_result() {
        let result = execute(&Echo, Task::new("x", "fail")).await;
        assert!(!result.success);
        assert_eq!(result.output, "Error: exit 1");
    }

    #[tokio::test]
    async fn engine_error_becomes_diagnostic_output() {
        let result = execute(&Echo, Task::new("x", "cobol")).await;
        assert!(!result.success);
        assert_eq!(result.output, "unsupported engine: cobol");
    }

    #[test]
    fn mapped_ipv4_matches_plain_ipv4() {
        let mapped: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        let plain: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(same_host(mapped, plain));
        assert!(!same_host(plain, "127.0.0.2".parse().unwrap()));
    }
}
