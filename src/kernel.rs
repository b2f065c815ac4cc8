//! Minimal kernel-side NBD ioctl wrapper.
//!
//! The teacher's `kernel` module wraps the full NBD_* ioctl set used to
//! attach this server to a kernel `/dev/nbdX` client device. That
//! attach/detach workflow is out of scope here (SPEC_FULL.md's backend is
//! userspace-only: files and memory), so only the `disconnect` ioctl is
//! kept, for a management path that wants to kick a stuck kernel client
//! loose without requiring this crate's own server loop to understand
//! kernel attach.
use std::{fs::File, io, os::unix::prelude::AsRawFd};

mod ioctl {
    use nix::{ioctl_none_bad, request_code_none};
    const NBD_IOCTL: u8 = 0xAB;
    ioctl_none_bad!(disconnect, request_code_none!(NBD_IOCTL, 8));
}

/// Disconnect from the remote for NBD device `f`.
pub fn disconnect(f: &File) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe { ioctl::disconnect(fd)? };
    Ok(())
}
