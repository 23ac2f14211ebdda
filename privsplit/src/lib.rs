//! Privilege separation runtime for Rust.
//!
//! Privilege separation[1] is a technique to split a program into
//! multiple isolated processes that only communicate via a strict and
//! well-defined internal messaging IPC with each other. Unlike
//! containers or micro services, they still belong to one closely
//! coupled program.
//!
//! `privsplit` embeds that split in a single binary: at startup the
//! binary becomes the supervising parent, forks and re-execs itself once
//! per declared child, wires a socketpair channel between every pair of
//! declared peers (handing the descriptors over the parent's control
//! channels), optionally chroots and drops the user per process, and
//! only then runs each process's entrypoint. Channels carry tagged
//! messages with at most one passed file descriptor each and support
//! both fire-and-forget sends and correlated query/reply round trips.
//!
//! # Example
//!
//! ```ignore
//! use privsplit::{Error, Topology};
//!
//! const PING: u32 = 100;
//! const PONG: u32 = 101;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut topology = Topology::new();
//!
//!     topology.parent("parent", |_| std::future::pending());
//!     topology
//!         .child("foo", |_| std::future::pending())
//!         .talks_to(["bar"])
//!         .username("nobody")
//!         .pre_start(|runtime| {
//!             runtime.peer("bar")?.register_handler(PING, |msg| async move {
//!                 msg.reply(PONG, msg.payload(), None).await
//!             });
//!             Ok(())
//!         });
//!     topology
//!         .child("bar", |runtime| async move {
//!             let reply = runtime.peer("foo")?.query(PING, b"test", None).await?;
//!             assert_eq!(reply.payload(), b"test");
//!             Ok(())
//!         })
//!         .talks_to(["foo"]);
//!
//!     topology.start().await
//! }
//! ```
//!
//! The most popular implementation of a privilege-separated network
//! service is OpenSSH; the channel layout here follows the same model
//! of a privileged supervisor brokering sockets for its unprivileged
//! workers.
//!
//! [1]: https://en.wikipedia.org/wiki/Privilege_separation

mod broker;
pub mod channel;
mod error;
pub mod frame;
pub mod net;
mod privdrop;
pub mod runtime;
pub mod topology;

pub use {
    broker::CONTROL_FD,
    channel::{Channel, ReceivedMessage, Reply},
    error::{Error, FrameError, TopologyError},
    frame::{MAX_PAYLOAD, RESERVED},
    net::Fd,
    runtime::{Peer, Runtime},
    topology::{ProcessDecl, ProcessInfo, Registry, Topology, REEXEC_ENV},
};
