//! Connection acceptor and per-connection task wiring (component G, §4.G).
//!
//! Grounded on the teacher's `Server::start` accept loop; generalized from
//! one blocking thread per connection to one spawned Tokio task per
//! connection, with handshake and dispatch as two phases of that task.
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::client::ClientState;
use crate::export::Registry;
use crate::handshake;

/// Runtime-tunable knobs exposed on the CLI (SPEC_FULL.md "Ambient
/// Configuration & CLI").
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Requests a single client may have in dispatch at once (§4.F, §6).
    pub in_flight_cap: usize,
    /// Largest payload a single READ/WRITE request may carry (§6).
    pub max_buffer_size: usize,
    /// When set, speak the legacy oldstyle handshake against this single
    /// export instead of fixed-newstyle negotiation.
    pub oldstyle_export: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: crate::proto::DEFAULT_PORT,
            in_flight_cap: 16,
            max_buffer_size: 32 * 1024 * 1024,
            oldstyle_export: None,
        }
    }
}

/// Bind the listening socket. Split out from `start` so callers (tests, in
/// particular) can bind an ephemeral port (`port: 0`) and learn the
/// resulting address before serving.
pub async fn bind(port: u16) -> color_eyre::Result<TcpListener> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(target: "nbd", "listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections forever, spawning one task per client.
pub async fn start(registry: Arc<Registry>, config: Config) -> color_eyre::Result<()> {
    let listener = bind(config.port).await?;
    serve(listener, registry, config).await
}

/// Accept connections forever on an already-bound listener.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>, config: Config) -> color_eyre::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = Arc::clone(&registry);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer.to_string(), registry, config).await {
                warn!(target: "nbd", "{peer}: connection ended with error: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: String,
    registry: Arc<Registry>,
    config: Config,
) -> color_eyre::Result<()> {
    stream.set_nodelay(true).ok();
    let (mut read_half, write_half) = stream.into_split();
    let client = ClientState::new(write_half, peer.clone(), config.in_flight_cap);
    info!(target: "nbd", "{peer}: connected");

    let export = if let Some(name) = &config.oldstyle_export {
        let Some(export) = registry.find(name) else {
            error!(target: "nbd", "{peer}: configured oldstyle export {name:?} not bound");
            client.close();
            return Ok(());
        };
        let mut guard = client.send_lock().await;
        let export = handshake::run_oldstyle(&mut *guard, export).await?;
        drop(guard);
        Some(export)
    } else {
        let mut guard = client.send_lock().await;
        let mut io = tokio::io::join(&mut read_half, &mut *guard);
        let negotiated = handshake::run_newstyle(&mut io, &registry).await?;
        drop(guard);
        negotiated.map(|n| n.export)
    };

    let Some(export) = export else {
        info!(target: "nbd", "{peer}: handshake ended without selecting an export");
        client.close();
        return Ok(());
    };

    client.attach(Arc::clone(&export));
    info!(target: "nbd", "{peer}: transmission phase starting on export {:?}", export.name());
    let result = crate::dispatch::run(Arc::clone(&client), read_half, export, config.max_buffer_size).await;
    client.close();
    info!(target: "nbd", "{peer}: disconnected");
    result
}
