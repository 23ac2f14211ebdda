//! Socket plumbing: owned descriptors and `UnixStream` extensions for
//! file descriptor passing.

mod fd;
mod stream;

pub use fd::Fd;
pub use stream::{socketpair, UnixStream, UnixStreamExt};
