//! Per-process runtime handles for entrypoints, hooks and handlers.

use crate::{
    channel::{Channel, ReceivedMessage, Reply},
    error::Error,
    net::Fd,
    topology::{ProcessInfo, Registry},
};
use nix::unistd::Pid;
use serde::Serialize;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::sync::Notify;

/// Runtime state of the current process, shared with its entrypoint and
/// hooks. The registry is frozen; only the channel maps fill in during
/// bootstrap.
pub struct Runtime {
    registry: Registry,
    current: String,
    pid: Pid,
    /// Control channels: one per child in the parent, a single entry for
    /// the parent in a child.
    pub(crate) control: RwLock<HashMap<String, Arc<Channel>>>,
    /// Peer channels installed by the broker, keyed by peer name.
    pub(crate) channels: RwLock<HashMap<String, Arc<Channel>>>,
    /// Forked child pids; parent only.
    pub(crate) children: Mutex<Vec<(String, Pid)>>,
    /// Released by the parent's READY frame.
    pub(crate) ready: Notify,
}

impl Runtime {
    pub(crate) fn new(registry: Registry, current: String, pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            registry,
            current,
            pid,
            control: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            children: Mutex::new(Vec::new()),
            ready: Notify::new(),
        })
    }

    /// Name of the process we are running in.
    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn current_pid(&self) -> Pid {
        self.pid
    }

    /// Name of the supervising parent process.
    pub fn parent_name(&self) -> &str {
        self.registry.parent_name()
    }

    pub fn is_parent(&self) -> bool {
        self.current == self.registry.parent_name()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Look up a process record by name.
    pub fn process(&self, name: &str) -> Option<&ProcessInfo> {
        self.registry.process(name)
    }

    /// Handle for the channel from the current process to a named peer.
    /// Available once bootstrap has wired the topology.
    pub fn peer(&self, name: &str) -> Result<Peer, Error> {
        let channel = self
            .channels
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoChannel(name.to_string()))?;
        Ok(Peer {
            name: name.to_string(),
            channel,
        })
    }

    pub(crate) fn install_channel(&self, peer: String, channel: Arc<Channel>) -> Result<(), Error> {
        let mut channels = self.channels.write().unwrap();
        if channels.contains_key(&peer) {
            return Err(Error::Protocol("duplicate channel registration"));
        }
        channels.insert(peer, channel);
        Ok(())
    }

    pub(crate) fn install_control(&self, name: String, channel: Arc<Channel>) {
        self.control.write().unwrap().insert(name, channel);
    }

    pub(crate) fn control_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.control.read().unwrap().get(name).cloned()
    }

    pub(crate) fn remember_child(&self, name: String, pid: Pid) {
        self.children.lock().unwrap().push((name, pid));
    }

    pub(crate) fn child_pid(&self, name: &str) -> Option<Pid> {
        self.children
            .lock()
            .unwrap()
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, pid)| *pid)
    }

    /// Launch the dispatchers of all wired peer channels. Runs after the
    /// pre-start hook so its handler registrations are in place for the
    /// first frame.
    pub(crate) fn start_peer_channels(&self) {
        for channel in self.channels.read().unwrap().values() {
            channel.start();
        }
    }
}

/// A declared peer of the current process, bound to its wired channel.
#[derive(Clone)]
pub struct Peer {
    name: String,
    channel: Arc<Channel>,
}

impl Peer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the handler run for inbound messages of the given tag.
    /// Handlers run serially on the channel's dispatcher; a blocking
    /// handler delays later frames on this channel only.
    pub fn register_handler<F, Fut>(&self, id: u32, handler: F)
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.channel.register_handler(id, handler);
    }

    /// Fire-and-forget message with an optional passed descriptor.
    pub async fn send(&self, id: u32, payload: &[u8], fd: Option<Fd>) -> Result<(), Error> {
        self.channel.send(id, payload, fd).await
    }

    /// Fire-and-forget message with a bincode-encoded payload.
    pub async fn send_data<T: Serialize>(
        &self,
        id: u32,
        data: &T,
        fd: Option<Fd>,
    ) -> Result<(), Error> {
        self.channel.send_data(id, data, fd).await
    }

    /// Request/reply round trip.
    pub async fn query(&self, id: u32, payload: &[u8], fd: Option<Fd>) -> Result<Reply, Error> {
        self.channel.query(id, payload, fd).await
    }

    /// [`Peer::query`] with a bincode-encoded payload.
    pub async fn query_data<T: Serialize>(
        &self,
        id: u32,
        data: &T,
        fd: Option<Fd>,
    ) -> Result<Reply, Error> {
        self.channel.query_data(id, data, fd).await
    }

    /// [`Peer::query`] with a deadline.
    pub async fn query_timeout(
        &self,
        id: u32,
        payload: &[u8],
        fd: Option<Fd>,
        deadline: Duration,
    ) -> Result<Reply, Error> {
        self.channel.query_timeout(id, payload, fd, deadline).await
    }

    /// Run `hook` once when the channel to this peer tears down.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        self.channel.on_close(hook);
    }
}
