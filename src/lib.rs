//! An async Network Block Device (NBD) server.
//!
//! See `SPEC_FULL.md` for the component breakdown this module layout
//! follows: wire codec (`proto`), pluggable backend (`backend`), export
//! registry (`export`), handshake negotiation (`handshake`), the request
//! pipeline (`dispatch`), per-connection client state (`client`), and the
//! accept loop tying it together (`server`).
pub mod backend;
mod client;
mod dispatch;
pub mod error;
pub mod export;
mod handshake;
pub mod kernel;
pub mod proto;
pub mod server;

pub use backend::{Backend, FileBackend, MemBackend};
pub use export::{Export, Registry};
pub use proto::DEFAULT_PORT;
pub use server::{start, Config};
