use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use orbit::{
    aggregate::{AggregationMode, Coordinator},
    checkpoint::{Checkpoint, NodeSnapshot},
    config::NetworkConfig,
    engine::DirectiveEngine,
    identity::NodeIdentity,
    net::{endpoint::Endpoint, local::LocalNetwork, tls::TlsMaterial, PeerClient, Service, Transport},
    node::{NodeOptions, PeerNode, RegionalNode},
    ring::Topology,
    work::WorkUnit,
};
use rand::seq::SliceRandom;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orbit", version, about = "Ring based work distribution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hosts every configured node in this process.
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Use the in-process network instead of QUIC.
        #[arg(long)]
        local: bool,
        /// Seconds between demo unit injections; 0 disables them.
        #[arg(long, default_value_t = 10)]
        inject_every: u64,
    },
    /// Runs one round against a ring and prints the joined result.
    Aggregate {
        /// Any member of the ring.
        #[arg(long)]
        via: String,
        #[arg(long, default_value = "fan-out")]
        mode: AggregationMode,
        /// Unit names to run; all units if empty.
        #[arg(long = "select")]
        select: Vec<String>,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Prints a checkpoint file and checks its rings.
    Checkpoint { file: PathBuf },
}

enum Hosted {
    Plain(Arc<PeerNode>),
    Regional(Arc<RegionalNode>),
}

impl Hosted {
    fn node(&self) -> &Arc<PeerNode> {
        match self {
            Hosted::Plain(node) => node,
            Hosted::Regional(regional) => regional.node(),
        }
    }

    fn service(&self) -> Arc<dyn Service> {
        match self {
            Hosted::Plain(node) => node.clone(),
            Hosted::Regional(regional) => regional.clone(),
        }
    }

    async fn snapshot(&self) -> NodeSnapshot {
        match self {
            Hosted::Plain(node) => node.snapshot().await,
            Hosted::Regional(regional) => regional.snapshot().await,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = match Cli::parse().command {
        Command::Run {
            config,
            local,
            inject_every,
        } => run(config, local, inject_every).await,
        Command::Aggregate {
            via,
            mode,
            select,
            timeout_ms,
        } => aggregate(via, mode, select, timeout_ms).await,
        Command::Checkpoint { file } => show_checkpoint(file).await,
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config_path: PathBuf, local: bool, inject_every: u64) -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::from_file(&config_path)?;
    let options = config.node_options();
    let restored = match &config.checkpoint {
        Some(path) => Checkpoint::read(path).await?,
        None => None,
    };

    let local_net = LocalNetwork::new();
    let transport: Arc<dyn Transport> = if local {
        local_net.clone()
    } else {
        Arc::new(Endpoint::client()?)
    };
    let client = PeerClient::new(transport, options.rpc_timeout);

    let mut hosted = Vec::new();
    for plan in config.plan() {
        let snapshot = restored.as_ref().and_then(|c| c.node(&plan.address)).cloned();
        let (node, regional_next) = match snapshot {
            Some(snapshot) => {
                let regional_next = snapshot.regional_next.clone();
                (
                    PeerNode::restore(snapshot, client.clone(), Arc::new(DirectiveEngine), options.clone()),
                    regional_next,
                )
            }
            None => {
                let node = PeerNode::new(&plan.address, client.clone(), Arc::new(DirectiveEngine), options.clone());
                node.set_next(&plan.next);
                (node, plan.regional_next.clone())
            }
        };
        node.spawn_scheduler();
        let entry = match regional_next {
            Some(next) => {
                let regional = RegionalNode::new(node, Some(next));
                regional.spawn_scheduler();
                Hosted::Regional(regional)
            }
            None => Hosted::Plain(node),
        };
        hosted.push(entry);
    }

    let mut endpoints = Vec::new();
    for entry in &hosted {
        let address = entry.node().address();
        if local {
            local_net.register(address, entry.service());
        } else {
            let addr: SocketAddr = address.parse()?;
            let tls = TlsMaterial::self_signed(vec![addr.ip().to_string()])?;
            endpoints.push(Endpoint::bind(addr, &tls, entry.service())?);
        }
        info!(node = %entry.node().info(), next = %entry.node().neighbor(), "hosting");
    }

    if inject_every > 0 {
        let nodes: Vec<_> = hosted.iter().map(|h| h.node().clone()).collect();
        tokio::spawn(inject(nodes, Duration::from_secs(inject_every)));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(path) = &config.checkpoint {
        let mut snapshots = Vec::new();
        for entry in &hosted {
            snapshots.push(entry.snapshot().await);
        }
        if let Err(e) = Checkpoint::new(snapshots).write(path).await {
            warn!(error = %e, "could not write checkpoint");
        }
    }
    for endpoint in &endpoints {
        endpoint.close();
    }
    Ok(())
}

/// Drops a demo unit onto a random node every `every`.
async fn inject(nodes: Vec<Arc<PeerNode>>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    let mut n = 0u64;
    loop {
        interval.tick().await;
        let Some(node) = nodes.choose(&mut rand::thread_rng()).cloned() else {
            return;
        };
        n += 1;
        let unit = WorkUnit::new(
            format!("demo-{n}"),
            "emit {unit} ran on {address} in round {round}\nset last = {unit}",
        );
        let depth = node.prime([unit]).await;
        info!(node = %node.info(), depth, "injected demo-{}", n);
    }
}

async fn aggregate(
    via: String,
    mode: AggregationMode,
    select: Vec<String>,
    timeout_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = Arc::new(Endpoint::client()?);
    let client = PeerClient::new(endpoint.clone(), Duration::from_millis(timeout_ms));
    let coordinator = Coordinator::new(client, NodeOptions::default().traversal_cap);
    let origin = NodeIdentity::anonymous(endpoint.local_addr()?.to_string());

    let report = coordinator.round(mode, &via, origin, select).await?;
    println!("round {} ({}), {} members", report.round, report.mode, report.members.len());
    println!("{}", report.joined());
    if report.is_error() {
        println!("{} errors", report.error_count());
    }
    endpoint.close();
    Ok(())
}

async fn show_checkpoint(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let checkpoint = Checkpoint::read(&file)
        .await?
        .ok_or_else(|| format!("{} does not exist", file.display()))?;
    println!(
        "checkpoint v{} taken at {} µs, {} nodes, {} units",
        checkpoint.version,
        checkpoint.taken_at,
        checkpoint.nodes.len(),
        checkpoint.unit_count()
    );
    for node in &checkpoint.nodes {
        println!(
            "  {} -> {}{} ({} queued)",
            node.identity,
            node.next,
            node.regional_next
                .as_deref()
                .map(|r| format!(", regional -> {}", r))
                .unwrap_or_default(),
            node.queue.len()
        );
    }
    let rings = Topology::from_checkpoint(&checkpoint).rings()?;
    println!("{} local ring(s)", rings.len());
    let regional = Topology::regional_from_checkpoint(&checkpoint);
    if !regional.is_empty() {
        println!("regional ring closed: {}", regional.is_single_ring());
    }
    Ok(())
}
