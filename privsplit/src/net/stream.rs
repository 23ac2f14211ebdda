//! `UnixStream` extensions to support file descriptor passing.
//!
//! Descriptors travel as `SCM_RIGHTS` control messages on the same
//! `sendmsg` call as the frame bytes they belong to.

use crate::{
    error::{Error, FrameError},
    net::Fd,
};
use async_trait::async_trait;
use nix::{
    cmsg_space,
    sys::socket::{
        recvmsg, sendmsg, socketpair as nix_socketpair, AddressFamily, ControlMessage,
        ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
    },
};
use std::{
    io::{self, IoSlice, IoSliceMut},
    os::unix::{
        io::{AsRawFd, FromRawFd, RawFd},
        net as std_net,
    },
};
use tokio::io::Interest;

pub use tokio::net::UnixStream;

/// Create a raw stream socketpair whose ends can be handed to other
/// processes.
pub fn socketpair() -> io::Result<(Fd, Fd)> {
    let (a, b) = nix_socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(nix_to_io)?;
    Ok((Fd::from(a), Fd::from(b)))
}

#[async_trait]
pub trait UnixStreamExt {
    /// Receive bytes into `buf`; descriptors passed by the peer are
    /// appended to `fds` as owned handles. Truncated control data is a
    /// frame error: a well-formed peer never attaches more than one
    /// descriptor.
    async fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<Fd>) -> Result<usize, Error>;

    /// Send the vectored buffers, attaching `fd` as ancillary data on the
    /// same call.
    async fn send_with_fd(&self, bufs: &[IoSlice<'_>], fd: Option<&Fd>) -> io::Result<usize>;

    #[allow(clippy::missing_safety_doc)]
    unsafe fn from_raw_fd(fd: RawFd) -> io::Result<UnixStream>;
}

#[async_trait]
impl UnixStreamExt for UnixStream {
    async fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<Fd>) -> Result<usize, Error> {
        let (bytes, truncated) = self
            .async_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(buf)];
                let mut cmsg_buffer = cmsg_space!([RawFd; 2]);
                let msg = recvmsg::<UnixAddr>(
                    self.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::empty(),
                )
                .map_err(nix_to_io)?;

                let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC);
                let bytes = msg.bytes;
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received.into_iter().map(Fd::from));
                    }
                }
                Ok((bytes, truncated))
            })
            .await?;

        if truncated {
            return Err(FrameError::UnexpectedFd.into());
        }
        Ok(bytes)
    }

    async fn send_with_fd(&self, bufs: &[IoSlice<'_>], fd: Option<&Fd>) -> io::Result<usize> {
        self.async_io(Interest::WRITABLE, || {
            match fd {
                Some(fd) => {
                    let raw = [fd.as_raw_fd()];
                    sendmsg::<UnixAddr>(
                        self.as_raw_fd(),
                        bufs,
                        &[ControlMessage::ScmRights(&raw)],
                        MsgFlags::empty(),
                        None,
                    )
                }
                None => sendmsg::<UnixAddr>(self.as_raw_fd(), bufs, &[], MsgFlags::empty(), None),
            }
            .map_err(nix_to_io)
        })
        .await
    }

    unsafe fn from_raw_fd(fd: RawFd) -> io::Result<UnixStream> {
        let stream = std_net::UnixStream::from_raw_fd(fd);
        stream.set_nonblocking(true)?;
        UnixStream::from_std(stream)
    }
}

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}
