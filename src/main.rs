//! Lantern relay - CLI entry point

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use lantern_relay::{Config, Gateway, VERSION};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(name = "lantern-relay")]
#[command(version = VERSION)]
#[command(about = "Local HTTP proxy that relays through remote fallback servers")]
struct Args {
    /// Path to configuration file [default: config.yaml, skipped if absent]
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(long = "listen")]
    listen: Option<String>,

    /// Remote configuration URL (overrides config and the URL file)
    #[arg(long = "config-url")]
    config_url: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("lantern-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn init_logging(args: &Args, config: Option<&Config>) -> anyhow::Result<()> {
    let level = match args.verbose {
        0 => config
            .and_then(|c| c.log_level.clone())
            .unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("lantern_relay={}", level).parse()?),
        )
        .init();
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    // An explicit path must exist; the default one is optional
    let config_path = args.config.as_deref().unwrap_or(Path::new(DEFAULT_CONFIG));
    let loaded = match args.config {
        Some(_) => Config::load(config_path),
        None => Config::load_or_default(config_path),
    };
    init_logging(&args, loaded.as_ref().ok())?;

    info!("Lantern relay v{}", VERSION);
    info!("Loading configuration from: {}", config_path.display());

    let mut config = match loaded {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(url) = args.config_url {
        config.config_url = Some(url);
    }

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to initialize relay: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        shutdown.cancel();
    });

    let running = match gateway.start().await {
        Ok(running) => running,
        Err(lantern_relay::Error::Cancelled) => return Ok(()),
        Err(e) => {
            error!("Failed to start relay: {}", e);
            std::process::exit(1);
        }
    };
    info!("Relay ready on {}", running.local_addr());

    if let Err(e) = running.wait().await {
        error!("Relay error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
