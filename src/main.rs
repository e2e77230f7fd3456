use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use edgefleet::app;
use edgefleet::config::AppConfig;
use edgefleet::control::{ControlChannel, Identity, mirror_identity};
use edgefleet::lifecycle::{Lifecycle, NodeState};
use edgefleet::naming;
use edgefleet::pull::PullEvent;
use edgefleet::registry::{LogicalNode, NodeRegistry};
use edgefleet::settings::{Environment, SettingsStore};
use edgefleet::{Error, Result};

/// Manage a fleet of containerized edge nodes on a local or remote engine.
#[derive(Parser)]
#[command(name = "edgefleet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the node registry, settings and logs
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Command prefix for a remote engine, e.g. "ssh edge-01"
    #[arg(long, env = "EDGEFLEET_REMOTE", global = true)]
    remote: Option<String>,

    /// Container engine executable
    #[arg(long, default_value = "docker", global = true)]
    engine: String,

    /// Node image repository
    #[arg(long, global = true)]
    image: Option<String>,

    /// Image tag, overriding the one chosen by the environment
    #[arg(long, global = true)]
    tag: Option<String>,

    /// Mount point of the node volume inside the container
    #[arg(long, global = true)]
    data_path: Option<String>,

    /// Name prefix for new nodes
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Engine command timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Switch the active environment (mainnet, testnet, devnet) and remember it
    #[arg(long, global = true)]
    environment: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered nodes and their engine state
    List,
    /// Create and start a new node
    Add,
    /// (Re)create and start a node
    Start { node: String },
    /// Stop a running node
    Stop { node: String },
    /// Remove a node's container; the volume is always kept
    Remove {
        node: String,
        /// Keep the registry record so the node can be started again
        #[arg(long)]
        keep_record: bool,
    },
    /// Show a node's identity, live when it runs, cached otherwise
    Info { node: String },
    /// Pull the node image and report whether it changed
    CheckImage,
}

fn build_config(cli: &Cli) -> AppConfig {
    let mut config = AppConfig::default();
    if let Some(dir) = &cli.config_dir {
        config.config_dir = dir.clone();
    }
    if let Some(remote) = &cli.remote {
        config.command_prefix = AppConfig::parse_prefix(remote);
    }
    config.engine_program = cli.engine.clone();
    if let Some(image) = &cli.image {
        config.image_repository = image.clone();
    }
    config.image_tag = cli.tag.clone();
    if let Some(path) = &cli.data_path {
        config.data_path = path.clone();
    }
    if let Some(prefix) = &cli.prefix {
        config.session.node_prefix = prefix.clone();
    }
    config.engine_timeout = cli.timeout.map(Duration::from_secs);
    config
}

/// Logs go to a daily file so they never tear the terminal UI.
fn init_logging(config: &AppConfig, debug: bool) -> Option<WorkerGuard> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if std::fs::create_dir_all(config.log_dir()).is_err() {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
        return None;
    }
    let appender = tracing_appender::rolling::daily(config.log_dir(), "edgefleet.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
    Some(guard)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = build_config(&cli);
    let settings = SettingsStore::open(config.settings_path());

    let _guard = init_logging(&config, cli.debug || settings.force_debug());
    info!("edgefleet v{}", env!("CARGO_PKG_VERSION"));

    match run(cli, config, settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            if let Some(hint) = e.hint() {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: AppConfig, settings: SettingsStore) -> Result<()> {
    if let Some(raw) = &cli.environment {
        let env = Environment::parse(raw)
            .ok_or_else(|| Error::parse("environment", "expected mainnet, testnet or devnet", raw))?;
        settings.set_environment(env)?;
        info!("Active environment set to {}", env);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(config.engine().probe())?;

    let Some(command) = cli.command else {
        drop(rt);
        let should_quit = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&should_quit))?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&should_quit))?;

        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic| {
            app::restore_terminal();
            default_hook(panic);
        }));

        return app::run(&config, &settings, should_quit);
    };

    rt.block_on(run_command(command, &config, &settings))
}

async fn run_command(command: Commands, config: &AppConfig, settings: &SettingsStore) -> Result<()> {
    let engine = config.engine();
    let registry = NodeRegistry::open(config.registry_path());
    let lifecycle = Lifecycle::new(engine.clone(), config.image_ref(settings.environment()), config.data_path.clone())
        .with_pull_timeout(config.pull_timeout);
    let mut progress = |event: PullEvent| {
        if let PullEvent::Overall { percent, layers } = event {
            eprint!("\rPulling {:>5.1}% ({} layers)", percent, layers);
        }
    };

    match command {
        Commands::List => {
            let nodes = registry.list();
            if nodes.is_empty() {
                println!("No nodes registered.");
                return Ok(());
            }
            let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
            let states = lifecycle.states(&names).await?;
            println!("{:<16} {:<22} {:<9} {}", "NAME", "ALIAS", "STATE", "ADDRESS");
            for node in nodes {
                let state = states.get(&node.name).copied().unwrap_or(NodeState::Absent);
                println!(
                    "{:<16} {:<22} {:<9} {}",
                    node.name,
                    node.cached_alias.as_deref().unwrap_or("-"),
                    state,
                    node.cached_node_address.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Add => {
            let (name, volume) = naming::allocate(&engine, &registry, &config.session.node_prefix).await?;
            let node = LogicalNode::new(name, volume);
            registry.upsert(node.clone())?;
            lifecycle.create_and_start(&node, &mut progress).await?;
            registry.touch_last_used(&node.name)?;
            eprintln!();
            println!("Started {} with volume {}", node.name, node.volume_name);
        }
        Commands::Start { node } => {
            let record = registry.get(&node).ok_or_else(|| Error::NotFound {
                kind: "node",
                name: node.clone(),
            })?;
            lifecycle.create_and_start(&record, &mut progress).await?;
            registry.touch_last_used(&node)?;
            eprintln!();
            println!("Started {}", node);
        }
        Commands::Stop { node } => {
            lifecycle.stop(&node).await?;
            println!("{} is now {}", node, lifecycle.node_state(&node).await?);
        }
        Commands::Remove { node, keep_record } => {
            lifecycle.remove(&node, true).await?;
            if !keep_record {
                registry.remove(&node)?;
            }
            println!("Removed {}", node);
        }
        Commands::Info { node } => {
            let record = registry.get(&node).ok_or_else(|| Error::NotFound {
                kind: "node",
                name: node.clone(),
            })?;
            let identity = if lifecycle.is_running(&node).await? {
                let info = ControlChannel::new(engine.clone()).get_node_info(&node).await?;
                let identity = Identity::from(&info);
                mirror_identity(&registry, &node, &identity)?;
                identity
            } else {
                println!("(not running, showing cached identity)");
                Identity::from_cache(&record)
            };
            println!("Name:    {}", node);
            println!("Alias:   {}", identity.alias);
            println!("Address: {}", identity.node_address);
            println!("ETH:     {}", identity.eth_address);
            for peer in &identity.whitelist {
                println!("Allowed: {}", peer);
            }
        }
        Commands::CheckImage => {
            let check = lifecycle.check_for_image_update(&mut progress).await?;
            eprintln!();
            if check.updated {
                println!("{}: newer image downloaded", check.image);
            } else {
                println!("{}: up to date", check.image);
            }
        }
    }
    Ok(())
}
