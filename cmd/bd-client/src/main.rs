//! csafe-client: blocking test client for both tiers.
//!
//! Block commands route global block numbers through the frontend's
//! device table, exactly as the frontend does:
//!
//!   csafe-client --config frontend.toml read --block 3 --out block3.bin
//!   csafe-client --config frontend.toml write --block 3 --file block3.bin
//!   csafe-client --config frontend.toml put --secret u:p --name a.txt --file a.txt
//!
//! `get` goes through the frontend's `/download`:
//!
//!   csafe-client get --frontend 127.0.0.1:8080 --secret u:p --name a.txt

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use csafe_core::config::FrontendConfig;
use csafe_core::constants::{AUTHORIZATION, DOWNLOAD_PATH, MAX_NUMBER_OF_HEADERS};
use csafe_core::http::{
    end_headers, parse_status_line, take_line, write_header, write_request_line, HeaderParser,
    Headers,
};
use csafe_core::service::BlockAction;
use csafe_fs::root_entry::find_entry;
use csafe_fs::{FileWriter, FsError, Geometry, SequentialAllocator, UserKey};
use csafe_module::device_map::DeviceMap;
use csafe_server::block_client::encode_request;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "csafe-client", version, about = "csafe test client")]
struct Args {
    /// Frontend TOML configuration (device table, block size, root region)
    #[arg(short, long, default_value = "frontend.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read one global block
    Read {
        #[arg(short, long)]
        block: u32,
        /// Output file (stdout when absent)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Write one global block from a file
    Write {
        #[arg(short, long)]
        block: u32,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Encrypt a local file, lay it out on the devices and register it
    Put {
        #[arg(short, long)]
        secret: String,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        file: PathBuf,
        /// First block the layout may use (default: right after the root region)
        #[arg(long)]
        first_block: Option<u32>,
    },
    /// Download a file through the frontend
    Get {
        #[arg(long, default_value = "127.0.0.1:8080")]
        frontend: String,
        #[arg(short, long)]
        secret: String,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

/// Send one request and read the whole `Connection: close` response.
fn roundtrip(addr: &SocketAddr, request: &[u8]) -> Result<(u16, Headers, Vec<u8>)> {
    let mut stream = TcpStream::connect_timeout(addr, IO_TIMEOUT)
        .with_context(|| format!("connecting to {}", addr))?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.write_all(request)?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    let status = take_line(&mut buf).ok_or_else(|| anyhow!("truncated status line"))?;
    let code = parse_status_line(&status)?;
    let mut parser = HeaderParser::new(MAX_NUMBER_OF_HEADERS);
    if !parser.feed(&mut buf)? {
        bail!("truncated response headers");
    }
    let headers = parser.into_headers();
    let len = headers.content_length()?;
    if buf.len() < len {
        bail!("truncated body: {} of {} bytes", buf.len(), len);
    }
    buf.truncate(len);
    Ok((code, headers, buf))
}

struct Blocks {
    devices: DeviceMap,
    block_size: usize,
}

impl Blocks {
    fn action(&self, block: u32, action: BlockAction) -> Result<Vec<u8>> {
        let (device, local) = self
            .devices
            .locate(block)
            .ok_or_else(|| anyhow!("block {} is outside every device", block))?;
        let request = encode_request(local, &action, device.authorization.as_deref());
        let (code, _, body) = roundtrip(&device.addr, &request)?;
        if code != 200 {
            bail!(
                "device {} answered {} for block {}: {}",
                device.name,
                code,
                block,
                String::from_utf8_lossy(&body)
            );
        }
        debug!(block, device = %device.name, local, "block done");
        Ok(body)
    }

    fn read(&self, block: u32) -> Result<Vec<u8>> {
        let data = self.action(block, BlockAction::Read)?;
        if data.len() != self.block_size {
            bail!("block {}: got {} bytes, expected {}", block, data.len(), self.block_size);
        }
        Ok(data)
    }

    fn write(&self, block: u32, data: Vec<u8>) -> Result<()> {
        if data.len() > self.block_size {
            bail!("{} bytes do not fit a {}-byte block", data.len(), self.block_size);
        }
        self.action(block, BlockAction::Write(data)).map(drop)
    }
}

fn emit(out: Option<&PathBuf>, data: &[u8]) -> Result<()> {
    match out {
        Some(path) => fs::write(path, data).with_context(|| format!("writing {}", path.display())),
        None => io::stdout().write_all(data).context("writing stdout"),
    }
}

/// Percent-encode a query value.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn put(
    blocks: &Blocks,
    root_blocks: u32,
    secret: &str,
    name: &str,
    data: &[u8],
    first_block: u32,
) -> Result<()> {
    let geometry = Geometry::new(blocks.block_size);
    let key = UserKey::derive(secret.as_bytes());
    let end = u32::try_from(blocks.devices.total_blocks()).unwrap_or(u32::MAX);
    if first_block < root_blocks {
        bail!("first block {} lies inside the root region", first_block);
    }

    let mut allocator = SequentialAllocator::new(first_block, end);
    let file = FileWriter::encode(&key, name, data, geometry, &mut allocator)?;
    let count = file.blocks.len();
    for (block, bytes) in file.blocks {
        blocks.write(block, bytes)?;
    }

    for root in 0..root_blocks {
        let mut block = blocks.read(root)?;
        if find_entry(&block, &key, name)?.is_some() {
            bail!("{} already exists", name);
        }
        match file.entry.insert_into(&mut block) {
            Ok(slot) => {
                blocks.write(root, block)?;
                info!(
                    name,
                    size = data.len(),
                    blocks = count,
                    root,
                    slot,
                    next_free = allocator.next_free(),
                    "file stored"
                );
                return Ok(());
            }
            Err(FsError::RootFull) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(FsError::RootFull.into())
}

fn get(frontend: &str, secret: &str, name: &str) -> Result<Vec<u8>> {
    let addr = frontend
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", frontend))?
        .next()
        .ok_or_else(|| anyhow!("{} has no address", frontend))?;
    let mut request = Vec::new();
    write_request_line(
        &mut request,
        "GET",
        DOWNLOAD_PATH,
        &format!("filename={}", encode_query_value(name)),
    );
    write_header(&mut request, AUTHORIZATION, secret);
    end_headers(&mut request);

    let (code, _, body) = roundtrip(&addr, &request)?;
    if code != 200 {
        bail!("frontend answered {}: {}", code, String::from_utf8_lossy(&body));
    }
    Ok(body)
}

fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("csafe=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|e| anyhow!(e))?;

    let args = Args::parse();

    if let Command::Get {
        frontend,
        secret,
        name,
        out,
    } = &args.command
    {
        let body = get(frontend, secret, name)?;
        return emit(out.as_ref(), &body);
    }

    let config = FrontendConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;
    let blocks = Blocks {
        devices: DeviceMap::from_config(&config.devices).context("resolving block devices")?,
        block_size: config.server.block_size,
    };

    match args.command {
        Command::Read { block, out } => emit(out.as_ref(), &blocks.read(block)?),
        Command::Write { block, file } => {
            let data = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            blocks.write(block, data)
        }
        Command::Put {
            secret,
            name,
            file,
            first_block,
        } => {
            let data = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            put(
                &blocks,
                config.root_blocks,
                &secret,
                &name,
                &data,
                first_block.unwrap_or(config.root_blocks),
            )
        }
        Command::Get { .. } => Ok(()),
    }
}
