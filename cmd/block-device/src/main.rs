//! csafe-bd: the block-device tier.
//!
//! Serves `/read?block=n` and `/write?block=n` from one pre-sized backing
//! file. Stops cleanly on SIGINT / SIGTERM once in-flight requests drain.
//!
//! Usage:
//!   csafe-bd --config block_device.toml
//!   csafe-bd --port 9001 --max-connections 64 --event-method select
//!
//! Environment (overridden by flags):
//!   CSAFE_MAX_CONNECTIONS, CSAFE_POLL_TIMEOUT_MS, CSAFE_IDLE_TIMEOUT_SECS,
//!   CSAFE_EVENT_METHOD, RUST_LOG (default `csafe=info`)

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use csafe_core::config::{BlockDeviceConfig, Credential, EventMethod, ServerConfig};
use csafe_module::block_store::BlockStore;
use csafe_module::device_map::DeviceMap;
use csafe_server::services::{self, BlockDevice};
use csafe_server::{signal, ConnectionFactory, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "csafe-bd", version, about = "csafe block device")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backing file (overrides `file_name`)
    #[arg(short, long)]
    file: Option<PathBuf>,

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

    let mut config = match &args.config {
        Some(path) => BlockDeviceConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = BlockDeviceConfig::default();
            config.server.apply_env_overrides();
            config
        }
    };
    args.apply(&mut config.server);
    if let Some(file) = &args.file {
        config.file_name = file.clone();
    }
    config.validate().context("invalid configuration")?;

    signal::install().context("installing signal handlers")?;

    let block_size = config.server.block_size;
    let store = BlockStore::open(&config.file_name, config.blocks(), block_size)
        .with_context(|| format!("opening backing file {}", config.file_name.display()))?;
    let device = Rc::new(BlockDevice::new(
        store,
        config.credential.as_ref().map(Credential::header_value),
    ));
    let factory = ConnectionFactory::new(
        services::block_device_registry(device),
        DeviceMap::empty(),
        block_size,
    );

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
        file = %config.file_name.display(),
        blocks = config.blocks(),
        block_size,
        "block device ready"
    );

    server.run().context("reactor failed")?;
    Ok(())
}
