//! The transmission-phase request pipeline (component E, §4.E).
//!
//! Grounded on the teacher's `Server::transmission` read-dispatch-reply
//! loop, split so that header/payload reception stays serialized on the
//! socket while the backend call and reply send for each request run in
//! their own spawned task, bounded by the client's in-flight semaphore
//! (§4.F, §6 backpressure).
use std::sync::Arc;

use color_eyre::eyre::bail;
use color_eyre::Result;
use log::{debug, warn};
use tokio::net::tcp::OwnedReadHalf;

use crate::backend::{try_aligned_alloc, AlignedBuf};
use crate::client::ClientState;
use crate::error::nbd_error_code;
use crate::export::Export;
use crate::proto::{Cmd, ErrorType, ProtocolError, Request, SimpleReply, SECTOR_SIZE};

/// Run the request pipeline for one client until disconnect or EOF.
///
/// `max_buffer_size` bounds any single request's payload (§6, the
/// `NBD_MAX_BUFFER_SIZE` analog); requests over the limit are fatal to the
/// connection rather than replied to, since a claimed length that large
/// cannot be safely skipped or buffered.
pub async fn run(
    client: Arc<ClientState>,
    mut read_half: OwnedReadHalf,
    export: Arc<Export>,
    max_buffer_size: usize,
) -> Result<()> {
    loop {
        let permit = match client.in_flight().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break, // semaphore closed, shutting down
        };

        let Some(req) = Request::get(&mut read_half).await? else {
            drop(permit);
            break;
        };

        // Protocol-fatal (§4.E step 2, §7 taxonomy 1, §8): an overflowing
        // offset+length is never replied to, the connection is closed.
        if req.offset.checked_add(u64::from(req.len)).is_none() {
            bail!(ProtocolError::new(format!(
                "offset {} + length {} overflows",
                req.offset, req.len
            )));
        }

        if matches!(req.typ, Cmd::Disconnect) {
            debug!(target: "nbd", "{}: DISCONNECT", client.peer());
            drop(permit);
            break;
        }

        let write_payload = if matches!(req.typ, Cmd::Write) {
            if req.len as usize > max_buffer_size {
                bail!(ProtocolError::new(format!(
                    "write length {} exceeds max buffer size {}",
                    req.len, max_buffer_size
                )));
            }
            match try_aligned_alloc(req.len as usize) {
                Some(mut buf) => {
                    tokio::io::AsyncReadExt::read_exact(&mut read_half, &mut buf).await?;
                    Some(Ok(buf))
                }
                None => {
                    // Still have to drain the payload off the wire to stay
                    // frame-aligned even though we can't hold onto it.
                    let mut sink = tokio::io::sink();
                    tokio::io::copy(
                        &mut tokio::io::AsyncReadExt::take(&mut read_half, req.len as u64),
                        &mut sink,
                    )
                    .await?;
                    Some(Err(()))
                }
            }
        } else {
            None
        };

        let client = Arc::clone(&client);
        let export = Arc::clone(&export);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_one(&client, &export, req, write_payload).await {
                warn!(target: "nbd", "{}: error replying to request: {e}", client.peer());
                client.close();
            }
        });
    }
    Ok(())
}

async fn handle_one(
    client: &Arc<ClientState>,
    export: &Arc<Export>,
    req: Request,
    write_payload: Option<Result<AlignedBuf, ()>>,
) -> Result<()> {
    if let Some(Err(())) = write_payload {
        return reply_err(client, &req, ErrorType::ENoMem).await;
    }

    match req.typ {
        Cmd::Read => dispatch_read(client, export, &req).await,
        Cmd::Write => {
            let buf = write_payload.unwrap().unwrap();
            dispatch_write(client, export, &req, buf).await
        }
        Cmd::Flush => dispatch_flush(client, export, &req).await,
        Cmd::Trim => dispatch_trim(client, export, &req).await,
        Cmd::Disconnect => unreachable!("handled in recv loop"),
        Cmd::Unknown(id) => {
            debug!(target: "nbd", "{}: unknown command {id}", client.peer());
            reply_err(client, &req, ErrorType::EInval).await
        }
    }
}

/// Validate offset/length are sector-aligned and in range (§4.E, §6
/// boundary behaviors). Returns `Ok(sectors)` or the NBD error code to
/// reply with. Callers must have already rejected `offset + length`
/// overflow as protocol-fatal (§4.E step 2) before reaching here.
fn validate_range(export: &Export, offset: u64, len: u32) -> std::result::Result<(u64, u64), ErrorType> {
    if offset % SECTOR_SIZE != 0 || u64::from(len) % SECTOR_SIZE != 0 {
        return Err(ErrorType::EInval);
    }
    let end = offset + u64::from(len);
    if end > export.size() {
        return Err(ErrorType::EInval);
    }
    Ok((offset / SECTOR_SIZE, u64::from(len) / SECTOR_SIZE))
}

async fn dispatch_read(client: &Arc<ClientState>, export: &Arc<Export>, req: &Request) -> Result<()> {
    let (offset_sectors, n_sectors) = match validate_range(export, req.offset, req.len) {
        Ok(v) => v,
        Err(code) => return reply_err(client, req, code).await,
    };
    if req.fua {
        if let Err(e) = export.backend().flush().await {
            return reply_err(client, req, nbd_error_code(&e)).await;
        }
    }
    let Some(mut buf) = try_aligned_alloc(req.len as usize) else {
        return reply_err(client, req, ErrorType::ENoMem).await;
    };
    if let Err(e) = export.backend().read(offset_sectors, &mut buf, n_sectors).await {
        return reply_err(client, req, nbd_error_code(&e)).await;
    }
    let mut guard = client.send_lock().await;
    SimpleReply::data(req, &buf).put(&mut *guard).await?;
    Ok(())
}

async fn dispatch_write(
    client: &Arc<ClientState>,
    export: &Arc<Export>,
    req: &Request,
    buf: AlignedBuf,
) -> Result<()> {
    let (offset_sectors, n_sectors) = match validate_range(export, req.offset, req.len) {
        Ok(v) => v,
        Err(code) => return reply_err(client, req, code).await,
    };
    if export.read_only() {
        return reply_err(client, req, ErrorType::EPerm).await;
    }
    if let Err(e) = export.backend().write(offset_sectors, &buf, n_sectors).await {
        return reply_err(client, req, nbd_error_code(&e)).await;
    }
    if req.fua {
        if let Err(e) = export.backend().flush().await {
            return reply_err(client, req, nbd_error_code(&e)).await;
        }
    }
    let mut guard = client.send_lock().await;
    SimpleReply::ok(req).put(&mut *guard).await?;
    Ok(())
}

async fn dispatch_flush(client: &Arc<ClientState>, export: &Arc<Export>, req: &Request) -> Result<()> {
    if let Err(e) = export.backend().flush().await {
        return reply_err(client, req, nbd_error_code(&e)).await;
    }
    let mut guard = client.send_lock().await;
    SimpleReply::ok(req).put(&mut *guard).await?;
    Ok(())
}

async fn dispatch_trim(client: &Arc<ClientState>, export: &Arc<Export>, req: &Request) -> Result<()> {
    let (offset_sectors, n_sectors) = match validate_range(export, req.offset, req.len) {
        Ok(v) => v,
        Err(code) => return reply_err(client, req, code).await,
    };
    if export.read_only() {
        return reply_err(client, req, ErrorType::EPerm).await;
    }
    if let Err(e) = export.backend().discard(offset_sectors, n_sectors).await {
        return reply_err(client, req, nbd_error_code(&e)).await;
    }
    let mut guard = client.send_lock().await;
    SimpleReply::ok(req).put(&mut *guard).await?;
    Ok(())
}

async fn reply_err(client: &Arc<ClientState>, req: &Request, code: ErrorType) -> Result<()> {
    let mut guard = client.send_lock().await;
    SimpleReply::err(code, req).put(&mut *guard).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    fn export(size: u64) -> Arc<Export> {
        Export::new("disk0", Box::new(MemBackend::new(size)), 0, size)
    }

    #[test]
    fn validate_range_rejects_misaligned_offset() {
        let exp_val = export(4096);
        assert_eq!(validate_range(&exp_val, 1, 512), Err(ErrorType::EInval));
    }

    #[test]
    fn validate_range_rejects_out_of_bounds() {
        let exp_val = export(4096);
        assert_eq!(validate_range(&exp_val, 3584, 1024), Err(ErrorType::EInval));
    }

    #[test]
    fn validate_range_accepts_in_bounds_aligned_request() {
        let exp_val = export(4096);
        assert_eq!(validate_range(&exp_val, 512, 1024), Ok((1, 2)));
    }

}
