//! `nbd-server`: a standalone async NBD server binary.
//!
//! Grounded on the teacher's `main.rs` clap CLI, generalized from a
//! single-export sync server to a registry-backed server that can expose
//! a file or an in-memory image, tuned via the knobs in
//! `nbd::server::Config`.
use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::eyre;
use log::info;

use nbd::backend::{Backend, FileBackend, MemBackend};
use nbd::export::{Export, Registry};
use nbd::server::Config;

/// Serve a block device over the Network Block Device (NBD) protocol.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TCP port to listen on.
    #[arg(short, long, default_value_t = nbd::DEFAULT_PORT)]
    port: u16,

    /// Backing file to serve. Required unless `--mem` is given.
    filename: Option<PathBuf>,

    /// Name clients select via EXPORT_NAME to reach this export.
    #[arg(long, default_value = "default")]
    export_name: String,

    /// Serve an in-memory image of this many bytes instead of a file.
    #[arg(long, value_name = "BYTES", conflicts_with = "filename")]
    mem: Option<usize>,

    /// Open the backing file read-only.
    #[arg(long)]
    read_only: bool,

    /// Requests a single client may have in dispatch at once.
    #[arg(long, default_value_t = 16)]
    in_flight_cap: usize,

    /// Largest payload accepted for a single READ/WRITE request, in bytes.
    #[arg(long, default_value_t = 32 * 1024 * 1024)]
    max_buffer_size: usize,

    /// Speak the legacy oldstyle handshake instead of fixed-newstyle
    /// option negotiation. Only a single export can be served this way.
    #[arg(long)]
    oldstyle: bool,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> color_eyre::Result<()> {
    let backend: Box<dyn Backend> = if let Some(mem) = args.mem {
        Box::new(MemBackend::new(mem as u64))
    } else {
        let filename = args
            .filename
            .as_ref()
            .ok_or_else(|| eyre!("either a backing filename or --mem BYTES is required"))?;
        Box::new(FileBackend::open(filename, args.read_only)?)
    };

    let size = backend.length().await?;
    let export = Export::new(args.export_name.clone(), backend, 0, size);
    let registry = Registry::new();
    registry.bind(export);

    info!(target: "nbd", "export {:?}: {} bytes", args.export_name, size);

    let config = Config {
        port: args.port,
        in_flight_cap: args.in_flight_cap,
        max_buffer_size: args.max_buffer_size,
        oldstyle_export: args.oldstyle.then(|| args.export_name.clone()),
    };
    nbd::server::start(registry, config).await
}
