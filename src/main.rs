//! akam-proxy - CLI entry point

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use akam_proxy::{config::Config, Server, VERSION};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "akam-proxy")]
#[command(version = VERSION)]
#[command(about = "CDN-accelerating forward proxy")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Listen port (overrides config)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    // Proxy workloads are connection-heavy with small tasks; tune the
    // runtime the same way for cache locality and polling overhead.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        .event_interval(61)
        .global_queue_interval(31)
        .thread_name("akam-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(port) = args.port {
        config.port = port;
    }

    let log_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("akam_proxy={}", log_level).parse()?),
        )
        .init();

    info!("akam-proxy v{}", VERSION);
    info!("Loading configuration from: {}", args.config.display());

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let mut server = match Server::new(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
