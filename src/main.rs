//! Warmpool - warm sandbox pool with HTTP API.
//!
//! Usage:
//!   warmpool serve [--port 8080] [--provisioner mock|local|remote]
//!   warmpool status [--url http://127.0.0.1:8080]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warmpool::fakes::MockProvisioner;
use warmpool::http_server::{self, AppState};
use warmpool::reaper::Reaper;
use warmpool::remote::HttpProvisioner;
use warmpool::replenish::Replenisher;
use warmpool::{DailyLedger, Money, PoolConfig, PoolManager, Provisioner};

#[derive(Parser, Debug)]
#[command(name = "warmpool")]
#[command(about = "Warm sandbox pool with HTTP API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the pool and its HTTP server
    Serve(ServeArgs),
    /// Print availability and cost status of a running server
    Status {
        #[arg(long, env = "WARMPOOL_URL", default_value = "http://127.0.0.1:8080")]
        url: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ProvisionerKind {
    /// In-memory fake sandboxes
    Mock,
    /// tmpfs sandboxes on this host (Linux, root)
    Local,
    /// Sandboxes from a remote sandbox server
    Remote,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "WARMPOOL_PORT", default_value = "8080")]
    port: u16,

    #[arg(long, value_enum, env = "WARMPOOL_PROVISIONER", default_value = "mock")]
    provisioner: ProvisionerKind,

    /// Base URL of the remote sandbox server
    #[arg(long, env = "WARMPOOL_REMOTE_URL", required_if_eq("provisioner", "remote"))]
    remote_url: Option<String>,

    /// Directory holding local sandbox roots
    #[arg(long, env = "WARMPOOL_SANDBOX_DIR", default_value = "/tmp")]
    sandbox_dir: String,

    /// Simulated create latency for the mock provisioner, in milliseconds
    #[arg(long, env = "WARMPOOL_MOCK_LATENCY_MS", default_value = "500")]
    mock_latency_ms: u64,

    #[arg(long, env = "WARMPOOL_FLAVOR", default_value = "default")]
    flavor: String,

    #[arg(long, env = "WARMPOOL_TARGET_WARM_COUNT", default_value = "2")]
    target_warm_count: usize,

    #[arg(long, env = "WARMPOOL_MAX_CONCURRENT_PROVISIONING", default_value = "2")]
    max_concurrent_provisioning: usize,

    /// Seconds an unclaimed sandbox may sit warm before it is recycled
    #[arg(long, env = "WARMPOOL_IDLE_AGE_SECS", default_value = "1800")]
    idle_age_secs: u64,

    /// Seconds a claimed session lasts
    #[arg(long, env = "WARMPOOL_SESSION_SECS", default_value = "600")]
    session_secs: u64,

    #[arg(long, env = "WARMPOOL_MAX_USAGE_PER_SESSION", default_value = "3")]
    max_usage_per_session: u32,

    #[arg(long, env = "WARMPOOL_REPLENISH_INTERVAL_SECS", default_value = "5")]
    replenish_interval_secs: u64,

    #[arg(long, env = "WARMPOOL_REAPER_INTERVAL_SECS", default_value = "10")]
    reaper_interval_secs: u64,

    /// Daily spend cap in cents
    #[arg(long, env = "WARMPOOL_DAILY_COST_CAP_CENTS", default_value = "5000")]
    daily_cost_cap_cents: u64,

    /// Spend recorded per provisioned sandbox, in cents
    #[arg(long, env = "WARMPOOL_PROVISION_COST_CENTS", default_value = "5")]
    provision_cost_cents: u64,

    /// Seconds the pool may sit empty before claims are advertised as unavailable
    #[arg(long, env = "WARMPOOL_EMPTY_GRACE_SECS", default_value = "60")]
    empty_grace_secs: u64,

    #[arg(long, env = "WARMPOOL_RETIRE_BATCH_SIZE", default_value = "2")]
    retire_batch_size: usize,

    /// Percentage of the daily cap that triggers a budget warning
    #[arg(long, env = "WARMPOOL_BUDGET_ALERT_PERCENT", default_value = "80")]
    budget_alert_percent: u8,
}

impl ServeArgs {
    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            target_warm_count: self.target_warm_count,
            max_concurrent_provisioning: self.max_concurrent_provisioning,
            idle_age_threshold: Duration::from_secs(self.idle_age_secs),
            max_session_duration: Duration::from_secs(self.session_secs),
            max_usage_per_session: self.max_usage_per_session,
            replenish_interval: Duration::from_secs(self.replenish_interval_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
            daily_cost_cap: Money::from_cents(self.daily_cost_cap_cents),
            flavor: self.flavor.clone(),
            provision_cost: Money::from_cents(self.provision_cost_cents),
            empty_grace_period: Duration::from_secs(self.empty_grace_secs),
            retire_batch_size: self.retire_batch_size,
            budget_alert_threshold: self.budget_alert_percent,
        }
    }

    fn provisioner(&self) -> Result<Arc<dyn Provisioner>> {
        match self.provisioner {
            ProvisionerKind::Mock => Ok(Arc::new(MockProvisioner::with_latency(
                Duration::from_millis(self.mock_latency_ms),
            ))),
            ProvisionerKind::Remote => {
                let url = self
                    .remote_url
                    .as_deref()
                    .context("--remote-url is required for the remote provisioner")?;
                Ok(Arc::new(HttpProvisioner::new(url)?))
            }
            #[cfg(target_os = "linux")]
            ProvisionerKind::Local => {
                if !nix::unistd::geteuid().is_root() {
                    bail!("local provisioner must run as root (needs CAP_SYS_ADMIN for mounts)");
                }
                Ok(Arc::new(warmpool::sandbox::LocalProvisioner::new(
                    &self.sandbox_dir,
                )))
            }
            #[cfg(not(target_os = "linux"))]
            ProvisionerKind::Local => bail!("local provisioner only works on Linux"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Status { url } => status(&url).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.pool_config();
    config.validate().context("invalid pool configuration")?;
    let provisioner = args.provisioner()?;
    let ledger = Arc::new(DailyLedger::new(
        config.daily_cost_cap,
        config.budget_alert_threshold,
    ));
    info!(
        provisioner = ?args.provisioner,
        target_warm = config.target_warm_count,
        daily_cap = %config.daily_cost_cap,
        "starting warm pool"
    );
    let pool = Arc::new(PoolManager::new(config, ledger));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let replenisher = tokio::spawn(
        Replenisher::new(pool.clone(), provisioner.clone()).run(shutdown_rx.clone()),
    );
    let reaper = tokio::spawn(Reaper::new(pool.clone(), provisioner.clone()).run(shutdown_rx));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let served = http_server::run_server(addr, AppState::new(pool.clone()), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown requested");
    })
    .await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = replenisher.await {
        warn!(error = %e, "replenishment loop panicked");
    }
    if let Err(e) = reaper.await {
        warn!(error = %e, "reaper loop panicked");
    }

    let leftovers = pool.drain_all().await;
    info!(count = leftovers.len(), "destroying remaining sandboxes");
    let results = join_all(leftovers.iter().map(|h| provisioner.destroy(&h.id))).await;
    for (handle, result) in leftovers.iter().zip(results) {
        if let Err(e) = result {
            warn!(sandbox_id = %handle.id, error = %e, "failed to destroy sandbox on shutdown");
        }
    }

    served.context("HTTP server failed")
}

async fn status(url: &str) -> Result<()> {
    let base = url.trim_end_matches('/');
    let client = reqwest::Client::new();
    for path in ["availability", "cost"] {
        let response = client
            .get(format!("{base}/{path}"))
            .send()
            .await
            .with_context(|| format!("failed to reach {base}"))?;
        if !response.status().is_success() {
            bail!("GET /{path} returned {}", response.status());
        }
        let body: serde_json::Value = response.json().await?;
        println!("{path}: {}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}
