use derive_more::{Display, From};
use std::io;

/// Topology declaration errors, all detected before any fork.
#[derive(Debug, Display, PartialEq, Eq)]
pub enum TopologyError {
    #[display(fmt = "no parent process declared")]
    MissingParent,
    #[display(fmt = "duplicate process name '{}'", "_0")]
    DuplicateName(String),
    #[display(fmt = "'{}' declares unknown peer '{}'", "_0", "_1")]
    UnknownPeer(String, String),
    #[display(fmt = "'{}' declares itself as a peer", "_0")]
    SelfPeer(String),
    #[display(fmt = "'{}' has not declared '{}' as a peer", "_0", "_1")]
    AsymmetricPeers(String, String),
}

impl std::error::Error for TopologyError {}

/// Wire-level violations, fatal for the offending channel.
#[derive(Debug, Display)]
pub enum FrameError {
    #[display(fmt = "truncated frame")]
    Truncated,
    #[display(fmt = "frame too large ({} bytes, max {})", "_0", "_1")]
    TooLarge(usize, usize),
    #[display(fmt = "bad frame flags {:#x}", "_0")]
    BadFlags(u32),
    #[display(fmt = "unexpected ancillary data")]
    UnexpectedFd,
}

impl std::error::Error for FrameError {}

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "{}", "_0")]
    Topology(TopologyError),
    #[display(fmt = "{}", "_0")]
    Frame(FrameError),
    #[display(fmt = "protocol violation: {}", "_0")]
    #[from(ignore)]
    Protocol(&'static str),
    #[display(fmt = "peer closed")]
    PeerClosed,
    #[display(fmt = "query timed out")]
    Timeout,
    #[display(fmt = "query cancelled")]
    Cancelled,
    #[display(fmt = "message tag {} is reserved", "_0")]
    #[from(ignore)]
    ReservedTag(u32),
    #[display(fmt = "unknown process '{}'", "_0")]
    #[from(ignore)]
    UnknownProcess(String),
    #[display(fmt = "no channel to peer '{}'", "_0")]
    #[from(ignore)]
    NoChannel(String),
    #[display(fmt = "username '{}' for dropping privileges not found", "_0")]
    #[from(ignore)]
    UserNotFound(String),
    #[display(fmt = "failed to drop privileges ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    Privdrop(&'static str, nix::Error),
    #[display(fmt = "payload encoding failed: {}", "_0")]
    Encoding(bincode::Error),
}

impl std::error::Error for Error {}
