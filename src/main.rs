use anyhow::Context;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use portal_dns::policy::{AllowAll, Authorizer, DEFAULT_ARP_TABLE, DenyAll, MacAllowlist};
use portal_dns::proxy::{self, ProxyConfig};

#[derive(Parser)]
#[command(name = "portal-dns")]
#[command(about = "Captive-portal DNS interception proxy", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value = "53")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Upstream DNS server (host:port) for authorized clients
    #[arg(short, long, default_value = "1.1.1.1:53")]
    upstream: SocketAddr,

    /// Portal address every name resolves to for unauthorized clients
    #[arg(long, default_value = "192.168.254.254")]
    portal_ip: Ipv4Addr,

    /// File of authorized MAC addresses, one per line
    #[arg(long, value_name = "FILE", conflicts_with = "allow_all")]
    allow_macs: Option<PathBuf>,

    /// Neighbour table used to map client IPs to MAC addresses
    #[arg(long, value_name = "FILE", default_value = DEFAULT_ARP_TABLE)]
    arp_table: PathBuf,

    /// Treat every client as authorized
    #[arg(long)]
    allow_all: bool,

    /// Forget unanswered queries after this many seconds (default: never)
    #[arg(long, value_name = "SECS")]
    pending_ttl: Option<u64>,

    /// Seconds between traffic statistics log lines
    #[arg(long, value_name = "SECS", default_value = "60")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_authorizer(args: &Args) -> anyhow::Result<Arc<dyn Authorizer>> {
    if args.allow_all {
        info!("all clients authorized");
        return Ok(Arc::new(AllowAll));
    }

    match &args.allow_macs {
        Some(path) => {
            let allowlist = MacAllowlist::load(path, args.arp_table.clone())
                .with_context(|| format!("failed to load MAC allowlist {}", path.display()))?;
            info!(macs = allowlist.len(), "MAC allowlist loaded");
            Ok(Arc::new(allowlist))
        }
        None => {
            info!("no authorization source configured, redirecting every client");
            Ok(Arc::new(DenyAll))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let authorizer = build_authorizer(&args)?;
    let config = ProxyConfig {
        bind_addr: SocketAddr::new(args.bind, args.port),
        upstream: args.upstream,
        portal: args.portal_ip,
        pending_ttl: args
            .pending_ttl
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs),
        stats_interval: Duration::from_secs(args.stats_interval.max(1)),
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(proxy::run(config, authorizer))?;

    Ok(())
}
