//! Handshake negotiation (component D, §4.D): oldstyle and fixed-newstyle.
//!
//! Grounded on the teacher's `Server::handshake`, split out of the
//! monolithic per-connection function into a stand-alone async routine so
//! it can run as the first stage of a spawned connection task before the
//! request dispatch loop (`crate::dispatch`) takes over the same socket.
use std::sync::Arc;

use byteorder::{WriteBytesExt, BE};
use color_eyre::eyre::bail;
use color_eyre::Result;
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::export::{Export, Registry};
use crate::proto::{
    ClientHandshakeFlags, ExportList, HandshakeFlags, Opt, OptReply, OptType, ProtocolError,
    ReplyType, CLIENT_MAGIC, IHAVEOPT, MAGIC,
};

/// Result of a successful (non-aborted) handshake: the export the client
/// selected via `EXPORT_NAME`, ready for `crate::dispatch` to take over.
pub struct Negotiated {
    pub export: Arc<Export>,
    /// `true` if the client asked for `C_NO_ZEROES`, suppressing the
    /// 124-byte zero-padding tail after the export info reply.
    pub no_zeroes: bool,
}

/// Legacy oldstyle handshake (single fixed export, no option haggling).
/// §4.D: magic(8) + oldstyle-magic(8) + size(8) + flags(4) + 124 zero pad.
pub async fn run_oldstyle<IO>(stream: &mut IO, export: Arc<Export>) -> Result<Arc<Export>>
where
    IO: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(152);
    buf.write_u64::<BE>(MAGIC)?;
    buf.write_u64::<BE>(CLIENT_MAGIC)?;
    buf.write_u64::<BE>(export.size())?;
    buf.write_u32::<BE>(export.transmit_flags().bits() as u32)?;
    buf.extend_from_slice(&[0u8; 124]);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    info!(target: "nbd", "oldstyle handshake complete, export {:?} size {}", export.name(), export.size());
    Ok(export)
}

/// Fixed-newstyle handshake: magic(8) + IHAVEOPT(8) + handshake_flags(2),
/// client_flags(4), then an option loop until `EXPORT_NAME` selects an
/// export, `ABORT` is requested, or an unsupported option closes the
/// connection (§4.D, and the `0xDEAD` seed scenario in SPEC_FULL.md §8).
pub async fn run_newstyle<IO>(stream: &mut IO, registry: &Registry) -> Result<Option<Negotiated>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u64(MAGIC).await?;
    stream.write_u64(IHAVEOPT).await?;
    stream
        .write_u16(HandshakeFlags::FIXED_NEWSTYLE.bits())
        .await?;
    stream.flush().await?;

    let client_flags = stream.read_u32().await?;
    let client_flags = ClientHandshakeFlags::from_bits_truncate(client_flags);
    if !client_flags.contains(ClientHandshakeFlags::C_FIXED_NEWSTYLE) {
        bail!(ProtocolError::new(
            "client does not support fixed newstyle negotiation"
        ));
    }
    let no_zeroes = client_flags.contains(ClientHandshakeFlags::C_NO_ZEROES);

    loop {
        let opt = Opt::get(stream).await?;
        match opt.typ {
            OptType::List => {
                if !opt.data.is_empty() {
                    debug!(target: "nbd", "LIST with non-empty payload, ERR_INVALID");
                    OptReply::new(OptType::List, ReplyType::ErrInvalid, vec![])
                        .put(stream)
                        .await?;
                    continue;
                }
                debug!(target: "nbd", "LIST requested");
                ExportList::new(registry.list_names()).put(stream).await?;
            }
            OptType::Abort => {
                debug!(target: "nbd", "ABORT requested");
                OptReply::ack(OptType::Abort).put(stream).await?;
                return Ok(None);
            }
            OptType::ExportName => {
                let name = String::from_utf8_lossy(&opt.data).into_owned();
                debug!(target: "nbd", "EXPORT_NAME requested: {name:?}");
                let Some(export) = registry.find(&name) else {
                    // No error reply exists for EXPORT_NAME in the fixed
                    // protocol; an unknown name is a hard disconnect.
                    bail!(ProtocolError::new(format!("unknown export {name:?}")));
                };
                send_export_info(stream, &export, no_zeroes).await?;
                return Ok(Some(Negotiated { export, no_zeroes }));
            }
            OptType::Other(id) => {
                debug!(target: "nbd", "unsupported option {id:#x}, closing");
                OptReply::new(opt.typ, ReplyType::ErrUnsup, vec![])
                    .put(stream)
                    .await?;
                return Ok(None);
            }
        }
    }
}

async fn send_export_info<IO: AsyncWrite + Unpin>(
    stream: &mut IO,
    export: &Arc<Export>,
    no_zeroes: bool,
) -> Result<()> {
    stream.write_u64(export.size()).await?;
    stream.write_u16(export.transmit_flags().bits()).await?;
    if !no_zeroes {
        stream.write_all(&[0u8; 124]).await?;
    }
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use crate::proto::OptType as WireOptType;

    fn registry_with(name: &str, size: u64) -> Arc<Registry> {
        let reg = Registry::new();
        reg.bind(Export::new(name, Box::new(MemBackend::new(size)), 0, size));
        reg
    }

    #[tokio::test]
    async fn oldstyle_handshake_writes_fixed_header() {
        let export = Export::new("x", Box::new(MemBackend::new(0x10_0000)), 0, 0x10_0000);
        let mut out = Vec::new();
        let returned = run_oldstyle(&mut out, Arc::clone(&export)).await.unwrap();
        assert!(Arc::ptr_eq(&returned, &export));
        assert_eq!(out.len(), 152);
        assert_eq!(&out[0..8], &MAGIC.to_be_bytes());
        assert_eq!(&out[8..16], &CLIENT_MAGIC.to_be_bytes());
        assert_eq!(u64::from_be_bytes(out[16..24].try_into().unwrap()), 0x10_0000);
    }

    #[tokio::test]
    async fn newstyle_export_name_selects_export() {
        let reg = registry_with("disk0", 0x10_0000);
        let mut client_to_server = Vec::new();
        client_to_server.write_u32::<BE>(
            ClientHandshakeFlags::C_FIXED_NEWSTYLE.bits(),
        ).unwrap();
        client_to_server.write_u64::<BE>(IHAVEOPT).unwrap();
        client_to_server.write_u32::<BE>(WireOptType::ExportName.into()).unwrap();
        client_to_server.write_u32::<BE>(5).unwrap();
        client_to_server.extend_from_slice(b"disk0");

        let mut io = tokio::io::join(
            std::io::Cursor::new(client_to_server),
            Vec::<u8>::new(),
        );
        let negotiated = run_newstyle(&mut io, &reg).await.unwrap().unwrap();
        assert_eq!(negotiated.export.name().as_deref(), Some("disk0"));
    }

    #[tokio::test]
    async fn newstyle_rejects_client_without_fixed_newstyle_support() {
        let reg = registry_with("disk0", 4096);
        let mut client_to_server = Vec::new();
        client_to_server.write_u32::<BE>(0).unwrap(); // no C_FIXED_NEWSTYLE
        let mut io = tokio::io::join(std::io::Cursor::new(client_to_server), Vec::<u8>::new());
        assert!(run_newstyle(&mut io, &reg).await.is_err());
    }
}
