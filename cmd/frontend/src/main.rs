//! csafe-frontend: the encrypted-filesystem tier.
//!
//! Serves `/download?filename=...` for the caller identified by the
//! `Authorization` header (or `authorization` cookie), reading every block
//! through the configured block devices.
//!
//! Usage:
//!   csafe-frontend --config frontend.toml
//!   csafe-frontend --config frontend.toml --port 8080 --timeout 100

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use csafe_core::config::{EventMethod, FrontendConfig, ServerConfig};
use csafe_fs::Geometry;
use csafe_module::device_map::DeviceMap;
use csafe_server::services::{self, FsSettings};
use csafe_server::{signal, ConnectionFactory, Server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "csafe-frontend", version, about = "csafe frontend")]
struct Args {
    /// TOML configuration file (device table required)
    #[arg(short, long)]
    config: PathBuf,

    #[arg(long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    max_connections: Option<usize>,

    /// Reactor wait timeout in milliseconds (0 = block, no idle expiry)
    #[arg(long)]
    timeout: Option<u64>,

    /// poll | select
    #[arg(long)]
    event_method: Option<EventMethod>,

    /// Append logs here instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn apply(&self, server: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            server.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            server.bind_port = port;
        }
        if let Some(n) = self.max_connections {
            server.max_connections = n;
        }
        if let Some(ms) = self.timeout {
            server.poll_timeout_ms = ms;
        }
        if let Some(method) = self.event_method {
            server.event_method = method;
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("csafe=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.try_init(),
    };
    installed.map_err(|e| anyhow!(e))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_deref())?;

    let mut config = FrontendConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut config.server);
    config.validate().context("invalid configuration")?;
    if config.admin_password.is_none() {
        warn!("no admin password configured");
    }

    signal::install().context("installing signal handlers")?;

    let devices = DeviceMap::from_config(&config.devices).context("resolving block devices")?;
    for device in config.devices.iter() {
        info!(
            name = %device.name,
            address = %device.address,
            port = device.port,
            blocks = device.blocks,
            "block device"
        );
    }

    let block_size = config.server.block_size;
    let fs = Rc::new(FsSettings {
        geometry: Geometry::new(block_size),
        root_blocks: config.root_blocks,
    });
    let factory = ConnectionFactory::new(services::frontend_registry(fs), devices, block_size);

    let mut server = Server::new(&config.server);
    let addr = server
        .add_listener(&config.server.bind_address, config.server.bind_port, factory)
        .with_context(|| {
            format!(
                "binding {}:{}",
                config.server.bind_address, config.server.bind_port
            )
        })?;
    info!(
        %addr,
        root_blocks = config.root_blocks,
        block_size,
        "frontend ready"
    );

    server.run().context("reactor failed")?;
    Ok(())
}
