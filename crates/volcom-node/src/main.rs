use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use volcom_node::{Controller, NodeConfig, ProcessEngine};
use volcom_protocol::Task;

#[derive(Parser, Debug)]
#[command(author, version, about = "volcom: share idle compute on the local network")]
struct Args {
    /// Path to the config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Advertise this node and run tasks sent by controllers.
    Idle,
    /// Listen for one discovery window and list idle nodes.
    Discover {
        /// Print candidates as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Send a script to an idle node and print its output.
    Dispatch {
        /// Invite endpoint of the target, as listed by `discover`.
        #[arg(long)]
        target: SocketAddr,
        /// Script file to run on the target.
        #[arg(long)]
        script: PathBuf,
        /// Engine identifier understood by the target.
        #[arg(long, default_value = "node")]
        engine: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "volcom=info,volcom_node=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = NodeConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Idle => run_idle(config).await,
        Command::Discover { json } => run_discover(config, json).await,
        Command::Dispatch {
            target,
            script,
            engine,
        } => run_dispatch(config, target, script, engine).await,
    }
}

async fn run_idle(config: NodeConfig) -> Result<()> {
    let engine = ProcessEngine::from_config(&config.engine);
    let node = volcom_node::start(config, engine).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("received SIGINT, shutting down");
    node.shutdown().await
}

async fn run_discover(config: NodeConfig, json: bool) -> Result<()> {
    let controller = Controller::bind(&config).await?;
    let candidates = controller.discover().await;

    if json {
        let records: Vec<_> = candidates.iter().collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if candidates.is_empty() {
        println!("No idle nodes found.");
        return Ok(());
    }
    for record in candidates.iter() {
        println!("{}  {}", record.address, record.capability);
    }
    Ok(())
}

async fn run_dispatch(
    config: NodeConfig,
    target: SocketAddr,
    script: PathBuf,
    engine: String,
) -> Result<()> {
    let source = std::fs::read_to_string(&script)
        .with_context(|| format!("failed to read {}", script.display()))?;

    let controller = Controller::bind(&config).await?;
    let candidates = controller.discover().await;
    let result = controller
        .dispatch(&candidates, target, Task::new(source, engine))
        .await
        .with_context(|| format!("dispatch to {target} failed"))?;

    println!("{}", result.output);
    if !result.success {
        bail!("task failed on {target}");
    }
    Ok(())
}
