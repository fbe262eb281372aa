//! Alpaca device host daemon
//!
//! Loads the host configuration, registers the configured devices, then
//! runs the tick scheduler, the UDP discovery responder and the HTTP server
//! until interrupted.

mod server;

use alpaca_host::{
    broadcast_target, discover_all_devices, load_config, DiscoveryConfig, DiscoveryResponder, Dispatcher, Scheduler,
    ServerInfo,
};
use anyhow::Result;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "alpaca-hostd")]
#[command(about = "Serves observatory devices over the ASCOM Alpaca protocol")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "alpaca-host.toml")]
    config: PathBuf,

    /// Bind address for the HTTP server
    #[arg(short, long)]
    bind: Option<String>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Broadcast a discovery query, list remote devices and exit
    #[arg(long)]
    discover: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Alpaca host v{}", env!("CARGO_PKG_VERSION"));

    if args.discover {
        let devices = discover_all_devices(broadcast_target(), &DiscoveryConfig::default()).await;
        println!("Discovered {} devices:", devices.len());
        for device in devices {
            println!("  - {} ({}) {}", device.display_name(), device.device_type, device.base_url);
        }
        return Ok(());
    }

    let mut config = load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let bind_ip: IpAddr = config.server.bind.parse()?;
    let http_addr = SocketAddr::new(bind_ip, config.server.port);

    let registry = Arc::new(config.build_registry()?);
    let server_info = ServerInfo {
        location: config.server.location.clone(),
        ..ServerInfo::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), server_info));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(
        registry.clone(),
        config.scheduler.to_config(),
        config.watchdog.to_config(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let discovery_task = if config.discovery.enabled {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.discovery.port));
        match DiscoveryResponder::bind(addr, registry.clone(), config.server.port).await {
            Ok(responder) => Some(tokio::spawn(responder.run(shutdown_rx.clone()))),
            Err(e) => {
                error!(port = config.discovery.port, error = %e, "Failed to bind discovery socket");
                None
            }
        }
    } else {
        info!("Discovery disabled");
        None
    };

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };

    let served = server::run(dispatcher, http_addr, ctrl_c).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task failed");
    }
    if let Some(task) = discovery_task {
        if let Err(e) = task.await {
            error!(error = %e, "Discovery task failed");
        }
    }

    served
}
