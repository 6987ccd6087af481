use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use nimbus_bridge::{Bridge, Handler};
use nimbus_core::CoderRegistry;
use nimbus_kubehub::{ClusterChange, ClusterRegistry, KubeconfigBuilder, ResourceRegistry, RetryConfig};
use nimbus_store::{ObjectStore, StoreConfig};
use nimbus_tenancy::WorkspaceHandler;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nimbusd", version, about = "Nimbus control-plane daemon")]
struct Cli {
    /// SQLite database file
    #[arg(long = "db", env = "NIMBUS_DB_PATH", global = true, default_value = "nimbus.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconcilers until interrupted
    Run {
        /// Tenant database reconciled by the IAM and workspace handlers
        #[arg(long = "tenant", env = "NIMBUS_TENANT")]
        tenant: String,
        /// Database holding cluster descriptors and resource types
        #[arg(long = "system-db", env = "NIMBUS_SYSTEM_DB", default_value = "system")]
        system_db: String,
    },
    /// Drop old write-log entries, keeping the newest N
    Compact {
        #[arg(long = "keep", env = "NIMBUS_OPLOG_KEEP", default_value_t = 100_000)]
        keep: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("NIMBUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NIMBUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid NIMBUS_METRICS_ADDR; expected host:port");
        }
    }
}

fn coders() -> Arc<CoderRegistry> {
    let coders = Arc::new(CoderRegistry::new());
    nimbus_kubehub::register_kinds(&coders);
    nimbus_iam::register_kinds(&coders);
    coders
}

fn open_store(path: &str, config: StoreConfig) -> Result<ObjectStore> {
    ObjectStore::open(path, coders(), config).with_context(|| format!("opening store at {}", path))
}

/// Cache the resource kinds each cluster serves as it joins.
fn spawn_discovery(ctx: &CancellationToken, clusters: &ClusterRegistry, resources: Arc<ResourceRegistry>) {
    let ctx = ctx.clone();
    let mut changes = clusters.subscribe();
    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                _ = ctx.cancelled() => break,
                change = changes.recv() => change,
            };
            match change {
                Ok(ClusterChange::Added(client)) => {
                    let resources = resources.clone();
                    tokio::spawn(async move {
                        match client.discover().await {
                            Ok(found) => {
                                let added = resources.learn(&found);
                                info!(cluster = %client.name(), served = found.len(), added, "cluster resources learned");
                            }
                            Err(e) => warn!(cluster = %client.name(), error = %format!("{:#}", e), "discovery failed"),
                        }
                    });
                }
                Ok(ClusterChange::Removed(name)) => debug!(cluster = %name, "cluster left"),
                Err(RecvError::Lagged(n)) => warn!(missed = n, "cluster changes lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn run(db: &str, tenant: &str, system_db: &str) -> Result<()> {
    let config = StoreConfig::from_env();
    let health_interval = config.health_interval;
    let store = open_store(db, config)?;
    info!(db, tenant, system_db, kinds = store.coders().kinds().len(), "store opened");

    let resources = Arc::new(ResourceRegistry::with_store(store.clone(), system_db));
    nimbus_tenancy::register_resources(&resources);
    let clusters = Arc::new(ClusterRegistry::new(Arc::new(KubeconfigBuilder::default())));

    let mut bridge = Bridge::new(store.clone(), clusters.clone(), system_db);
    bridge.add(nimbus_iam::handlers(tenant));
    let workspaces = WorkspaceHandler::new(tenant, resources.clone()).with_retry(RetryConfig::from_env());
    bridge.add([Box::new(workspaces) as Box<dyn Handler>]);

    let ctx = CancellationToken::new();
    spawn_discovery(&ctx, &clusters, resources);
    let mut handle = bridge.run(&ctx).await?;
    let mut health = store.health_check(&ctx, health_interval);

    let outcome = loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                res.context("waiting for ctrl-c")?;
                info!("interrupt received; shutting down");
                break Ok(());
            }
            Some(e) = health.recv() => {
                error!(error = %e, "store health check failed");
                break Err(anyhow!(e).context("store unreachable"));
            }
            Some(e) = handle.errors.recv() => {
                warn!(handler = %e.handler, error = %format!("{:#}", e.error), "controller channel failed");
            }
        }
    };

    ctx.cancel();
    for s in handle.wait().await {
        debug!(north = s.north_loops, south = s.south_loops, stops = s.stop_signals, "controller summary");
    }
    info!("stopped");
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { tenant, system_db } => run(&cli.db, &tenant, &system_db).await,
        Commands::Compact { keep } => {
            let store = open_store(&cli.db, StoreConfig::from_env())?;
            let removed = store.compact_oplog(keep)?;
            info!(db = %cli.db, keep, removed, "write log compacted");
            println!("removed {} write-log entries", removed);
            Ok(())
        }
    }
}
