use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use forge_fleet::{
    Config, EventBus, NetworkManager, PackExecutor, TaskConfig, TaskManager, TaskStatus,
};

/// Forge - distributed packaging fleet for multi-platform builds
#[derive(Parser)]
#[command(name = "forge", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Optional TOML configuration file
    #[arg(long, env = "FORGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run as the fleet coordinator
    Serve {
        /// Port to listen on
        #[arg(long, env = "FORGE_PORT")]
        port: Option<u16>,

        /// Also execute submitted tasks on this node
        #[arg(long, env = "FORGE_RUN_LOCAL")]
        run_local: bool,
    },
    /// Connect to a coordinator as a build worker
    Connect {
        /// Coordinator host
        host: String,

        /// Coordinator port
        #[arg(long, env = "FORGE_PORT")]
        port: Option<u16>,
    },
    /// Run one packaging task locally without joining a fleet
    Build {
        /// Repository to clone
        #[arg(long)]
        repo: String,

        /// Branch to check out (defaults to the configured branch)
        #[arg(long)]
        branch: Option<String>,

        /// Target platform; repeat for several (built sequentially)
        #[arg(long = "platform", required = true)]
        platforms: Vec<String>,

        /// Output directory for finished artifacts
        #[arg(long)]
        output: Option<PathBuf>,

        /// Build command (defaults to `npm run build`)
        #[arg(long)]
        build_script: Option<String>,

        /// Install command (defaults to `npm install`)
        #[arg(long)]
        install_script: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,forge_fleet=info",
        1 => "info,forge_fleet=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(path) = &cli.config {
        config = config.with_file(path)?;
    }

    match cli.command {
        Command::Serve { port, run_local } => {
            serve(config, port, run_local).await
        }
        Command::Connect { host, port } => connect(config, &host, port).await,
        Command::Build {
            repo,
            branch,
            platforms,
            output,
            build_script,
            install_script,
        } => {
            let task_config = TaskConfig {
                repo_url: repo,
                branch: branch.unwrap_or_else(|| config.git.default_branch.clone()),
                platforms,
                output_dir: output.unwrap_or_else(|| config.output_dir.clone()),
                build_script,
                install_script,
                env: None,
                upload: None,
                copy_local: Some(true),
            };
            build(config, task_config).await
        }
    }
}

/// Wire up the node: event bus, messaging layer and orchestrator
fn bootstrap(config: &Config, run_local: bool) -> (Arc<NetworkManager>, Arc<TaskManager>) {
    let events = EventBus::new();
    let (net, net_rx) = NetworkManager::new(&config.save_root, events.clone());
    let executor = Arc::new(PackExecutor::new(config));
    let manager = TaskManager::new(executor, Arc::clone(&net), events.clone(), run_local);
    tokio::spawn(Arc::clone(&manager).run(net_rx));

    // host sink: render lifecycle events into the log
    let mut observer = events.subscribe();
    tokio::spawn(async move {
        loop {
            match observer.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        tracing::info!(target: "forge::events", "{json}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "event observer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    (net, manager)
}

async fn serve(config: Config, port: Option<u16>, run_local: bool) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.port);
    let run_local = run_local || config.run_local;
    let (net, _manager) = bootstrap(&config, run_local);

    let bound = net.start_server(port).await?;
    tracing::info!(port = bound, node_id = %net.node_id(), "fleet coordinator up; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    net.stop_server().await?;
    Ok(())
}

async fn connect(config: Config, host: &str, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.port);
    let (net, _manager) = bootstrap(&config, false);

    net.connect_to_server(host, port).await?;
    tracing::info!(host, port, node_id = %net.node_id(), "worker joined the fleet; ctrl-c to leave");

    tokio::signal::ctrl_c().await?;
    if let Err(e) = net.disconnect().await {
        tracing::debug!(error = %e, "connection already closed");
    }
    Ok(())
}

async fn build(config: Config, task_config: TaskConfig) -> anyhow::Result<()> {
    let (_net, manager) = bootstrap(&config, false);

    let task_id = manager.create_pack_task(task_config.clone()).await;
    manager.execute_pack_task(task_id, task_config).await;

    let task = manager
        .task(task_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("task record vanished"))?;
    match task.status {
        TaskStatus::Completed => {
            for result in task.result.unwrap_or_default() {
                println!(
                    "{}\t{}\t{} bytes\t{} ms",
                    result.platform,
                    result.output_path.display(),
                    result.size,
                    result.build_time
                );
            }
            Ok(())
        }
        status => {
            let error = task.error.unwrap_or_else(|| format!("task {status:?}"));
            Err(anyhow::anyhow!("build failed: {error}"))
        }
    }
}
