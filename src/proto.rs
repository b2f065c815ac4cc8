//! NBD protocol constants and wire-frame encode/decode.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description. Only the subset needed for fixed-newstyle/oldstyle
//! negotiation and the simple-reply transmission phase is implemented; see
//! SPEC_FULL.md for the full list of excluded option types.
#![allow(clippy::upper_case_acronyms)]
use std::fmt;

use bitflags::bitflags;
use byteorder::{WriteBytesExt, BE};
use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default TCP port assigned to NBD.
pub const DEFAULT_PORT: u16 = 10809;

pub(crate) const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub(crate) const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"
pub(crate) const CLIENT_MAGIC: u64 = 0x00420281861253;
pub(crate) const REPLY_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
pub(crate) const REQUEST_MAGIC: u32 = 0x25609513;
pub(crate) const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

/// Sector size assumed by the export/backend layer (bytes).
pub const SECTOR_SIZE: u64 = 512;

/// Maximum permitted export name length, in bytes.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone)]
pub(crate) struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)
    }
}

impl std::error::Error for ProtocolError {}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct HandshakeFlags: u16 {
        const FIXED_NEWSTYLE = 0b01;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ClientHandshakeFlags: u32 {
        const C_FIXED_NEWSTYLE = 0b01;
        const C_NO_ZEROES = 0b10;
    }

    /// Export transmission flags, advertised during negotiation.
    ///
    /// Only the low 16 bits are meaningful on the wire; the export-defined
    /// subset is restricted to these bits (see `Export::transmit_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransmitFlags: u16 {
        const HAS_FLAGS = 1 << 0;
        const READ_ONLY = 1 << 1;
        const SEND_FLUSH = 1 << 2;
        const SEND_FUA = 1 << 3;
        const SEND_TRIM = 1 << 5;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CmdFlags: u16 {
        const FUA = 1 << 0;
    }
}

/// Newstyle option ids known to this server. Unknown ids still round-trip
/// through `Opt::get`/`OptReply` (see `OptType::Other`) so they can be
/// echoed back in an `ERR_UNSUP` reply rather than failing to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OptType {
    ExportName,
    Abort,
    List,
    Other(u32),
}

impl From<u32> for OptType {
    fn from(v: u32) -> Self {
        match v {
            1 => OptType::ExportName,
            2 => OptType::Abort,
            3 => OptType::List,
            other => OptType::Other(other),
        }
    }
}

impl From<OptType> for u32 {
    fn from(t: OptType) -> u32 {
        match t {
            OptType::ExportName => 1,
            OptType::Abort => 2,
            OptType::List => 3,
            OptType::Other(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyType {
    Ack,
    Server,
    ErrUnsup,
    ErrInvalid,
}

impl From<ReplyType> for u32 {
    fn from(t: ReplyType) -> u32 {
        match t {
            ReplyType::Ack => 1,
            ReplyType::Server => 2,
            ReplyType::ErrUnsup => (1 << 31) + 1,
            ReplyType::ErrInvalid => (1 << 31) + 3,
        }
    }
}

/// Maximum length accepted for an option payload before it is treated as
/// malformed and the connection is closed (not a protocol constant, just a
/// sanity bound against a hostile/confused client).
const MAX_OPTION_LEN: u32 = 10_000;

/// A decoded option frame (client -> server), as read during newstyle
/// haggling.
#[derive(Debug, Clone)]
pub(crate) struct Opt {
    pub typ: OptType,
    pub data: Vec<u8>,
}

impl Opt {
    pub async fn get<IO: AsyncRead + Unpin>(stream: &mut IO) -> Result<Self> {
        // C: 64 bits, IHAVEOPT (same magic as the newstyle prefix)
        // C: 32 bits, option
        // C: 32 bits, length of option data
        // C: `length` bytes of option data
        let magic = stream.read_u64().await?;
        if magic != IHAVEOPT {
            bail!(ProtocolError::new(format!("unexpected option magic {magic:#x}")));
        }
        let option = stream.read_u32().await?;
        let typ = OptType::from(option);
        let option_len = stream.read_u32().await?;
        ensure!(
            option_len < MAX_OPTION_LEN,
            ProtocolError::new(format!("option length {option_len} is too large"))
        );
        let mut data = vec![0u8; option_len as usize];
        stream.read_exact(&mut data).await?;
        Ok(Self { typ, data })
    }
}

/// Builder for a reply to an option.
#[must_use]
pub(crate) struct OptReply {
    opt: OptType,
    reply_type: ReplyType,
    data: Vec<u8>,
}

impl OptReply {
    pub fn ack(opt: OptType) -> Self {
        Self { opt, reply_type: ReplyType::Ack, data: vec![] }
    }

    pub fn new(opt: OptType, reply_type: ReplyType, data: Vec<u8>) -> Self {
        Self { opt, reply_type, data }
    }

    pub async fn put<IO: AsyncWrite + Unpin>(self, stream: &mut IO) -> Result<()> {
        // S: 64 bits, REPLY_MAGIC
        // S: 32 bits, the option this is a reply to
        // S: 32 bits, reply type
        // S: 32 bits, length of the reply
        // S: `length` bytes of reply data
        stream.write_u64(REPLY_MAGIC).await?;
        stream.write_u32(self.opt.into()).await?;
        stream.write_u32(self.reply_type.into()).await?;
        stream.write_u32(self.data.len() as u32).await?;
        stream.write_all(&self.data).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Builder for replying to an `OptType::List` request: one `SERVER` reply
/// per export followed by one `ACK`.
#[must_use]
pub(crate) struct ExportList {
    export_names: Vec<String>,
}

impl ExportList {
    pub fn new(export_names: Vec<String>) -> Self {
        Self { export_names }
    }

    pub async fn put<IO: AsyncWrite + Unpin>(self, stream: &mut IO) -> Result<()> {
        for name in &self.export_names {
            let mut data = vec![];
            data.write_u32::<BE>(name.len() as u32)?;
            data.write_all(name.as_bytes())?;
            OptReply::new(OptType::List, ReplyType::Server, data)
                .put(stream)
                .await?;
        }
        OptReply::ack(OptType::List).put(stream).await?;
        Ok(())
    }
}

// -------------------
// Transmission phase
// -------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cmd {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
    Unknown(u16),
}

impl From<u16> for Cmd {
    fn from(v: u16) -> Self {
        match v {
            0 => Cmd::Read,
            1 => Cmd::Write,
            2 => Cmd::Disconnect,
            3 => Cmd::Flush,
            4 => Cmd::Trim,
            other => Cmd::Unknown(other),
        }
    }
}

/// A decoded request header (the 28-byte fixed part of a request frame).
///
/// For `WRITE`, the caller is responsible for reading `length` bytes
/// immediately afterward; the payload is not owned by `Request` itself so
/// the dispatch layer can land it directly into an aligned backend buffer.
#[derive(Debug)]
pub(crate) struct Request {
    pub fua: bool,
    pub typ: Cmd,
    pub handle: u64,
    pub offset: u64,
    pub len: u32,
}

impl Request {
    /// Read and decode a request header. Returns `Ok(None)` on a clean EOF
    /// at the start of a frame (the client closed the connection between
    /// requests, which is not itself a protocol error).
    pub async fn get<IO: AsyncRead + Unpin>(stream: &mut IO) -> Result<Option<Self>> {
        let magic = match stream.read_u32().await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if magic != REQUEST_MAGIC {
            bail!(ProtocolError::new(format!("wrong request magic {magic:#x}")));
        }
        let flags = stream.read_u16().await?;
        let flags = CmdFlags::from_bits_truncate(flags);
        let typ = stream.read_u16().await?;
        let typ = Cmd::from(typ);
        let handle = stream.read_u64().await?;
        let offset = stream.read_u64().await?;
        let len = stream.read_u32().await?;
        Ok(Some(Self {
            fua: flags.contains(CmdFlags::FUA),
            typ,
            handle,
            offset,
            len,
        }))
    }
}

/// NBD error codes sent in reply frames (host errno -> NBD error, see
/// SPEC_FULL.md §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ErrorType {
    Ok = 0,
    EPerm = 1,
    EIo = 5,
    ENoMem = 12,
    EInval = 22,
    ENoSpc = 28,
}

impl From<ErrorType> for u32 {
    fn from(e: ErrorType) -> u32 {
        e as u32
    }
}

#[derive(Debug)]
#[must_use]
pub(crate) struct SimpleReply<'a> {
    err: ErrorType,
    handle: u64,
    data: &'a [u8],
}

impl<'a> SimpleReply<'a> {
    pub fn data(req: &Request, data: &'a [u8]) -> Self {
        SimpleReply { err: ErrorType::Ok, handle: req.handle, data }
    }

    pub fn ok(req: &Request) -> Self {
        Self { err: ErrorType::Ok, handle: req.handle, data: &[] }
    }

    pub fn err(err: ErrorType, req: &Request) -> Self {
        SimpleReply { err, handle: req.handle, data: &[] }
    }

    /// Write header and payload as a single buffered write so they land on
    /// the wire contiguously with respect to any other reply interleaved by
    /// the send mutex (see SPEC_FULL.md §4.E on the "cork" behavior).
    pub async fn put<IO: AsyncWrite + Unpin>(self, stream: &mut IO) -> Result<()> {
        let mut buf = Vec::with_capacity(16 + self.data.len());
        buf.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
        buf.write_u32::<BE>(self.err.into())?;
        buf.write_u64::<BE>(self.handle)?;
        buf.extend_from_slice(self.data);
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_header_round_trip() {
        let mut buf = Vec::new();
        buf.write_u32::<BE>(REQUEST_MAGIC).unwrap();
        buf.write_u16::<BE>(CmdFlags::FUA.bits()).unwrap();
        buf.write_u16::<BE>(1).unwrap(); // WRITE
        buf.write_u64::<BE>(0xdead_beef).unwrap();
        buf.write_u64::<BE>(4096).unwrap();
        buf.write_u32::<BE>(512).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let req = Request::get(&mut cursor).await.unwrap().unwrap();
        assert!(req.fua);
        assert_eq!(req.typ, Cmd::Write);
        assert_eq!(req.handle, 0xdead_beef);
        assert_eq!(req.offset, 4096);
        assert_eq!(req.len, 512);
    }

    #[tokio::test]
    async fn request_header_eof_before_frame_is_not_an_error() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let req = Request::get(&mut cursor).await.unwrap();
        assert!(req.is_none());
    }

    #[tokio::test]
    async fn request_header_bad_magic_is_fatal() {
        let mut buf = Vec::new();
        buf.write_u32::<BE>(0xffff_ffff).unwrap();
        buf.write_u16::<BE>(0).unwrap();
        buf.write_u16::<BE>(0).unwrap();
        buf.write_u64::<BE>(0).unwrap();
        buf.write_u64::<BE>(0).unwrap();
        buf.write_u32::<BE>(0).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(Request::get(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn simple_reply_round_trip() {
        let req = Request {
            fua: false,
            typ: Cmd::Read,
            handle: 42,
            offset: 0,
            len: 4,
        };
        let mut out = Vec::new();
        SimpleReply::data(&req, &[1, 2, 3, 4]).put(&mut out).await.unwrap();

        let mut cursor = std::io::Cursor::new(out);
        let magic = cursor.read_u32().await.unwrap();
        let err = cursor.read_u32().await.unwrap();
        let handle = cursor.read_u64().await.unwrap();
        let mut data = [0u8; 4];
        cursor.read_exact(&mut data).await.unwrap();

        assert_eq!(magic, SIMPLE_REPLY_MAGIC);
        assert_eq!(err, 0);
        assert_eq!(handle, 42);
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn opt_get_rejects_wrong_magic() {
        let mut buf = Vec::new();
        buf.write_u64::<BE>(0).unwrap();
        buf.write_u32::<BE>(1).unwrap();
        buf.write_u32::<BE>(0).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(Opt::get(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn opt_get_preserves_unknown_option_id() {
        let mut buf = Vec::new();
        buf.write_u64::<BE>(IHAVEOPT).unwrap();
        buf.write_u32::<BE>(0xDEAD).unwrap();
        buf.write_u32::<BE>(0).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let opt = Opt::get(&mut cursor).await.unwrap();
        assert_eq!(opt.typ, OptType::Other(0xDEAD));
    }
}
