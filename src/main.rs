use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meshguard::config::MeshguardConfig;
use meshguard::counting::CounterStore;
use meshguard::grpc::GrpcServer;
use meshguard::policy::Policy;
use meshguard::ratelimit::RequestAttributes;
use meshguard::RateLimitEngine;

#[derive(Parser)]
#[command(name = "meshguard", version, about = "Rate limit decision engine for service mesh proxies")]
struct Cli {
    /// Configuration file (YAML); `MESHGUARD__*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reference counting service
    Serve {
        /// Listen address, overriding `server.grpc_addr`
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Validate a policy file
    Validate { policy: PathBuf },
    /// Evaluate requests against a policy and print each decision
    Check {
        #[arg(long)]
        policy: Option<PathBuf>,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long, default_value = "/")]
        path: String,
        #[arg(long)]
        route: Option<String>,
        #[arg(long)]
        remote_address: Option<IpAddr>,
        /// Request header as `name=value`; may be repeated
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        /// Number of identical requests to evaluate
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got `{}`", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = MeshguardConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Serve { addr } => serve(config, addr).await,
        Command::Validate { policy } => validate(&policy),
        Command::Check {
            policy,
            method,
            path,
            route,
            remote_address,
            headers,
            repeat,
        } => {
            let mut config = config;
            if let Some(policy) = policy {
                config.policy_path = Some(policy.display().to_string());
            }
            let method = method.parse().context("parsing method")?;
            let mut attrs = RequestAttributes::new(method, path);
            attrs.route = route;
            attrs.remote_address = remote_address;
            attrs.headers = headers;
            check(config, attrs, repeat).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: MeshguardConfig, addr: Option<SocketAddr>) -> anyhow::Result<()> {
    info!("Starting Meshguard counting service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let addr = addr.unwrap_or(config.server.grpc_addr);
    let store = Arc::new(CounterStore::new());

    let purge_every = Duration::from_secs(config.server.purge_interval_secs.max(1));
    let purger = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(purge_every);
            loop {
                interval.tick().await;
                store.purge_expired();
            }
        })
    };

    let grpc_server = GrpcServer::new(addr, store);
    info!("Starting gRPC server on {}", addr);

    let result = grpc_server.serve_with_shutdown(shutdown_signal()).await;
    purger.abort();
    result?;

    info!("Meshguard counting service stopped");
    Ok(())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let policy = Policy::from_file(path)
        .with_context(|| format!("policy {} is invalid", path.display()))?;

    let local = usize::from(policy.vhost.local.is_some())
        + policy.routes.values().filter(|r| r.local.is_some()).count();
    let global = usize::from(policy.vhost.global.is_some())
        + policy.routes.values().filter(|r| r.global.is_some()).count();
    info!(
        domain = %policy.domain,
        routes = policy.routes.len(),
        local_rules = local,
        global_rules = global,
        "Policy is valid"
    );
    println!("{}: ok", path.display());
    Ok(())
}

async fn check(config: MeshguardConfig, attrs: RequestAttributes, repeat: u32) -> anyhow::Result<()> {
    if config.policy_path.is_none() {
        warn!("No policy given, every request is admitted");
    }
    let engine = RateLimitEngine::from_config(&config).context("building engine")?;

    for _ in 0..repeat.max(1) {
        let decision = engine.check(&attrs).await;
        let summary = serde_json::json!({
            "allowed": decision.allowed,
            "retry_after_ms": decision.retry_after.map(|d| d.as_millis() as u64),
            "denied_by": decision.denied_by.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            "shadow_denied": decision.shadow_denied.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            "status": decision.response.as_ref().map(|r| r.status.as_u16()),
            "policy_version": decision.policy_version,
            "records": decision.records,
        });
        println!("{}", summary);
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
