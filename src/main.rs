use anyhow::{Context, Result};
use clap::Parser;
use nfq_host_gate::{GateConfig, NetworkManager};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nfq_host_gate", version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allowed domains, replacing the configured list
    #[arg(short, long, value_delimiter = ',')]
    allow: Option<Vec<String>>,

    /// NFQUEUE number
    #[arg(short, long)]
    queue_num: Option<u16>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: Option<&Path>) -> Result<GateConfig> {
    match path {
        Some(path) => GateConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(GateConfig::default()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(queue_num) = args.queue_num {
        config.queue_num = queue_num;
    }
    if let Some(allow) = &args.allow {
        config.allowed_domains = allow.clone();
    }
    config.validate().context("invalid configuration")?;

    // Registered before any rule goes in, so a signal never skips cleanup.
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    let domains = config.allowed_domains.clone();
    let mut net = NetworkManager::new(config).context("cannot manage the firewall")?;
    net.block_all_except_allowed(&domains)
        .context("failed to enable blocking")?;
    info!(allowed = ?net.get_allowed_domains(), "gate is up");

    for sig in signals.forever() {
        if sig != SIGHUP {
            info!(signal = sig, "shutting down");
            break;
        }
        if args.allow.is_some() {
            warn!("allow-list given on the command line, ignoring reload");
            continue;
        }
        match load_config(args.config.as_deref()) {
            Ok(reloaded) => {
                if let Err(e) = net.block_all_except_allowed(&reloaded.allowed_domains) {
                    error!(error = %e, "failed to re-apply allow-list");
                }
            }
            Err(e) => error!(error = %e, "reload failed, keeping current allow-list"),
        }
    }

    net.unblock_all();
    Ok(())
}
