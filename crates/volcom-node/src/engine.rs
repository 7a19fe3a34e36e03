//! Script execution boundary.
//!
//! A worker hands `(script, engine)` to a [`ScriptEngine`] and turns whatever
//! comes back into a Result message. Engine failures never surface as
//! transport errors.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::EngineConfig;

/// Marker in a wrapper template replaced by the task's script.
pub const SCRIPT_PLACEHOLDER: &str = "{script}";

/// Runs the script as the body of an async function and prints its return
/// value, so `return 2+2` yields `4`. A thrown error goes to stderr and
/// fails the run.
pub const NODE_WRAPPER: &str = r#"(async () => {
{script}
})().then(
  (result) => { if (result !== undefined) console.log(result); },
  (err) => { console.error(err && err.message ? err.message : String(err)); process.exitCode = 1; },
);
"#;

/// Outcome of one script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub output: String,
    pub success: bool,
}

impl Execution {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported engine: {0}")]
    Unsupported(String),

    #[error("failed to start {engine}: {source}")]
    Spawn {
        engine: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{engine} exceeded its {budget_ms}ms budget")]
    BudgetExceeded { engine: String, budget_ms: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ScriptEngine: Send + Sync + 'static {
    fn execute(
        &self,
        script: &str,
        engine: &str,
    ) -> impl Future<Output = Result<Execution, EngineError>> + Send;
}

/// Runs scripts through an external interpreter process, one process per task.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    commands: BTreeMap<String, Vec<String>>,
    wrappers: BTreeMap<String, String>,
    budget: Duration,
}

impl ProcessEngine {
    pub fn new(commands: BTreeMap<String, Vec<String>>, budget: Duration) -> Self {
        Self {
            commands,
            wrappers: BTreeMap::new(),
            budget,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            wrappers: config.wrappers.clone(),
            ..Self::new(config.commands.clone(), config.budget())
        }
    }

    /// Wrap scripts for `engine` in `template` before running them.
    pub fn with_wrapper(mut self, engine: impl Into<String>, template: impl Into<String>) -> Self {
        self.wrappers.insert(engine.into(), template.into());
        self
    }

    fn source(&self, script: &str, engine: &str) -> String {
        match self.wrappers.get(engine) {
            Some(template) => template.replace(SCRIPT_PLACEHOLDER, script),
            None => script.to_string(),
        }
    }

    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

impl ScriptEngine for ProcessEngine {
    async fn execute(&self, script: &str, engine: &str) -> Result<Execution, EngineError> {
        let (program, args) = self
            .commands
            .get(engine)
            .and_then(|argv| argv.split_first())
            .ok_or_else(|| EngineError::Unsupported(engine.to_string()))?;

        let mut file = tempfile::Builder::new()
            .prefix("volcom-task-")
            .tempfile()?;
        file.write_all(self.source(script, engine).as_bytes())?;
        file.flush()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(file.path())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(engine, program = %program, "running script");
        let output = match tokio::time::timeout(self.budget, cmd.output()).await {
            Ok(output) => output.map_err(|source| EngineError::Spawn {
                engine: engine.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(EngineError::BudgetExceeded {
                    engine: engine.to_string(),
                    budget_ms: self.budget.as_millis() as u64,
                });
            }
        };

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(Execution::success(stdout.trim()))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(Execution::failure(format!("Error: {}", stderr.trim())))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_engine(budget: Duration) -> ProcessEngine {
        let mut commands = BTreeMap::new();
        commands.insert("sh".to_string(), vec!["sh".to_string()]);
        commands.insert("missing".to_string(), vec!["volcom-no-such-binary".to_string()]);
        commands.insert("empty".to_string(), vec![]);
        ProcessEngine::new(commands, budget)
    }

    #[tokio::test]
    async fn successful_script_returns_trimmed_stdout() {
        let engine = sh_engine(Duration::from_secs(5));
        let execution = engine.execute("echo $((2+2))", "sh").await.unwrap();
        assert_eq!(execution, Execution::success("4"));
    }

    #[tokio::test]
    async fn failing_script_reports_stderr() {
        let engine = sh_engine(Duration::from_secs(5));
        let execution = engine
            .execute("echo partial; echo boom >&2; exit 3", "sh")
            .await
            .unwrap();
        assert!(!execution.success);
        assert_eq!(execution.output, "Error: boom");
    }

    #[tokio::test]
    async fn unknown_engine_is_unsupported() {
        let engine = sh_engine(Duration::from_secs(5));
        let err = engine.execute("1", "cobol").await.unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(name) if name == "cobol"));

        let err = engine.execute("1", "empty").await.unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[tokio::test]
    async fn missing_interpreter_fails_to_spawn() {
        let engine = sh_engine(Duration::from_secs(5));
        let err = engine.execute("1", "missing").await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    #[tokio::test]
    async fn budget_is_enforced() {
        let engine = sh_engine(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = engine.execute("sleep 5", "sh").await.unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded { budget_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn wrapper_surrounds_the_script() {
        let engine = sh_engine(Duration::from_secs(5)).with_wrapper("sh", "echo before\n{script}\n");
        let execution = engine.execute("echo $((2+2))", "sh").await.unwrap();
        assert_eq!(execution, Execution::success("before\n4"));
    }

    #[tokio::test]
    async fn node_prints_the_return_value() {
        if std::process::Command::new("node")
            .arg("--version")
            .output()
            .is_err()
        {
            eprintln!("node not on PATH, skipping");
            return;
        }
        let engine = ProcessEngine::from_config(&EngineConfig::default());

        let execution = engine.execute("return 2+2", "node").await.unwrap();
        assert_eq!(execution, Execution::success("4"));

        let execution = engine
            .execute("await new Promise((r) => setTimeout(r, 10)); return 'late';", "node")
            .await
            .unwrap();
        assert_eq!(execution, Execution::success("late"));

        let execution = engine.execute("throw new Error('boom')", "node").await.unwrap();
        assert_eq!(execution, Execution::failure("Error: boom"));
    }

    #[test]
    fn default_engines_from_config() {
        let engine = ProcessEngine::from_config(&EngineConfig::default());
        let names: Vec<_> = engine.engines().collect();
        assert_eq!(names, vec!["node", "python", "sh"]);
    }
}
