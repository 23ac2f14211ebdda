//! Process topology: the declaration builder and the frozen registry.
//!
//! The embedder declares the parent, the children and their peer edges
//! before [`Topology::start`]. Validation happens before any fork; after
//! that the declaration freezes into an immutable [`Registry`] shared by
//! every process.

use crate::{
    error::{Error, TopologyError},
    runtime::Runtime,
};
use futures::future::BoxFuture;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    path::PathBuf,
    sync::Arc,
};

/// Environment variable naming the child to become after re-exec.
/// Reserved; embedders must not set it.
pub const REEXEC_ENV: &str = "REEXEC";

pub(crate) type Main =
    Box<dyn FnOnce(Arc<Runtime>) -> BoxFuture<'static, Result<(), Error>> + Send>;
pub(crate) type Hook = Box<dyn FnOnce(&Runtime) -> Result<(), Error> + Send>;

/// Declarative process topology, consumed by [`Topology::start`].
#[derive(Default)]
pub struct Topology {
    pub(crate) processes: BTreeMap<String, ProcessDecl>,
    pub(crate) parent: Option<String>,
    duplicate: Option<String>,
}

/// One declared process: entrypoint, hooks, privilege configuration and
/// the peers it talks to.
pub struct ProcessDecl {
    pub(crate) name: String,
    pub(crate) main: Option<Main>,
    pub(crate) username: Option<String>,
    pub(crate) chroot: Option<PathBuf>,
    pub(crate) pre_chroot: Option<Hook>,
    pub(crate) pre_start: Option<Hook>,
    pub(crate) peers: BTreeSet<String>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the supervising parent process. Exactly one is required;
    /// declaring another replaces the previous one, record and all.
    pub fn parent<F, Fut>(&mut self, name: &str, main: F) -> &mut ProcessDecl
    where
        F: FnOnce(Arc<Runtime>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        if let Some(previous) = self.parent.take() {
            self.processes.remove(&previous);
        }
        self.parent = Some(name.to_string());
        self.declare(name, main)
    }

    /// Declare a child process.
    pub fn child<F, Fut>(&mut self, name: &str, main: F) -> &mut ProcessDecl
    where
        F: FnOnce(Arc<Runtime>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.declare(name, main)
    }

    fn declare<F, Fut>(&mut self, name: &str, main: F) -> &mut ProcessDecl
    where
        F: FnOnce(Arc<Runtime>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        if self.processes.contains_key(name) && self.duplicate.is_none() {
            self.duplicate = Some(name.to_string());
        }
        let decl = ProcessDecl {
            name: name.to_string(),
            main: Some(Box::new(move |runtime| Box::pin(main(runtime)))),
            username: None,
            chroot: None,
            pre_chroot: None,
            pre_start: None,
            peers: BTreeSet::new(),
        };
        self.processes.insert(name.to_string(), decl);
        self.processes.get_mut(name).unwrap()
    }

    /// Check the declaration before any fork: one parent, known names,
    /// no self edges, symmetric peer sets.
    pub(crate) fn validate(&self) -> Result<(), TopologyError> {
        if let Some(name) = &self.duplicate {
            return Err(TopologyError::DuplicateName(name.clone()));
        }
        if self.parent.is_none() {
            return Err(TopologyError::MissingParent);
        }
        for (name, decl) in &self.processes {
            for peer in &decl.peers {
                if peer == name {
                    return Err(TopologyError::SelfPeer(name.clone()));
                }
                let peer_decl = self
                    .processes
                    .get(peer)
                    .ok_or_else(|| TopologyError::UnknownPeer(name.clone(), peer.clone()))?;
                if !peer_decl.peers.contains(name) {
                    return Err(TopologyError::AsymmetricPeers(peer.clone(), name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Validate and run the runtime in the current process. Never returns
    /// in children until their entrypoint does.
    pub async fn start(self) -> Result<(), Error> {
        crate::broker::start(self).await
    }
}

impl ProcessDecl {
    /// Declare peers this process exchanges messages with. Idempotent;
    /// each named peer must declare this process in return.
    pub fn talks_to<I, S>(&mut self, peers: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for peer in peers {
            self.peers.insert(peer.into());
        }
        self
    }

    /// Drop to this user (uid, gid, supplementary groups) before the
    /// entrypoint runs.
    pub fn username(&mut self, username: &str) -> &mut Self {
        self.username = Some(username.to_string());
        self
    }

    /// Chroot to this directory before dropping the user.
    pub fn chroot(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.chroot = Some(path.into());
        self
    }

    /// Hook run before the chroot step; the place to open files or bind
    /// sockets needed afterwards. Failure is fatal for the process.
    pub fn pre_chroot<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnOnce(&Runtime) -> Result<(), Error> + Send + 'static,
    {
        self.pre_chroot = Some(Box::new(hook));
        self
    }

    /// Hook run after the ready barrier and before the peer-channel
    /// dispatchers start; the place to register message handlers.
    pub fn pre_start<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnOnce(&Runtime) -> Result<(), Error> + Send + 'static,
    {
        self.pre_start = Some(Box::new(hook));
        self
    }
}

/// Immutable view of the topology, shared by every process after start.
#[derive(Debug, Clone)]
pub struct Registry {
    parent: String,
    processes: BTreeMap<String, ProcessInfo>,
}

/// Per-process facts every process knows about every other.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub name: String,
    pub username: Option<String>,
    pub chroot: Option<PathBuf>,
    pub peers: BTreeSet<String>,
}

impl Registry {
    pub(crate) fn from_topology(topology: &Topology) -> Self {
        let processes = topology
            .processes
            .values()
            .map(|decl| {
                (
                    decl.name.clone(),
                    ProcessInfo {
                        name: decl.name.clone(),
                        username: decl.username.clone(),
                        chroot: decl.chroot.clone(),
                        peers: decl.peers.clone(),
                    },
                )
            })
            .collect();
        Self {
            parent: topology.parent.clone().unwrap_or_default(),
            processes,
        }
    }

    pub fn parent_name(&self) -> &str {
        &self.parent
    }

    pub fn process(&self, name: &str) -> Option<&ProcessInfo> {
        self.processes.get(name)
    }

    /// All processes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProcessInfo)> {
        self.processes.iter()
    }

    /// Child names in deterministic (sorted) order.
    pub fn child_names(&self) -> Vec<String> {
        self.processes
            .keys()
            .filter(|name| **name != self.parent)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> impl FnOnce(Arc<Runtime>) -> futures::future::Ready<Result<(), Error>> {
        |_| futures::future::ready(Ok(()))
    }

    #[test]
    fn symmetric_topology_validates() {
        let mut topology = Topology::new();
        topology.parent("parent", noop());
        topology.child("foo", noop()).talks_to(["bar"]);
        topology.child("bar", noop()).talks_to(["foo"]);
        topology.validate().unwrap();
    }

    #[test]
    fn asymmetric_peers_rejected_naming_both() {
        let mut topology = Topology::new();
        topology.parent("parent", noop());
        topology.child("foo", noop()).talks_to(["bar"]);
        topology.child("bar", noop());
        let err = topology.validate().unwrap_err();
        assert_eq!(
            err,
            TopologyError::AsymmetricPeers("bar".to_string(), "foo".to_string())
        );
        let message = err.to_string();
        assert!(message.contains("foo") && message.contains("bar"));
    }

    #[test]
    fn missing_parent_rejected() {
        let mut topology = Topology::new();
        topology.child("foo", noop());
        assert_eq!(topology.validate().unwrap_err(), TopologyError::MissingParent);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut topology = Topology::new();
        topology.parent("parent", noop());
        topology.child("foo", noop());
        topology.child("foo", noop());
        assert_eq!(
            topology.validate().unwrap_err(),
            TopologyError::DuplicateName("foo".to_string())
        );
    }

    #[test]
    fn unknown_peer_rejected() {
        let mut topology = Topology::new();
        topology.parent("parent", noop());
        topology.child("foo", noop()).talks_to(["ghost"]);
        assert_eq!(
            topology.validate().unwrap_err(),
            TopologyError::UnknownPeer("foo".to_string(), "ghost".to_string())
        );
    }

    #[test]
    fn self_peer_rejected() {
        let mut topology = Topology::new();
        topology.parent("parent", noop());
        topology.child("foo", noop()).talks_to(["foo"]);
        assert_eq!(
            topology.validate().unwrap_err(),
            TopologyError::SelfPeer("foo".to_string())
        );
    }

    #[test]
    fn peer_declaration_is_idempotent() {
        let mut topology = Topology::new();
        topology.parent("parent", noop());
        topology
            .child("foo", noop())
            .talks_to(["bar"])
            .talks_to(["bar", "bar"]);
        topology.child("bar", noop()).talks_to(["foo"]);
        topology.validate().unwrap();
        assert_eq!(topology.processes["foo"].peers.len(), 1);
    }

    #[test]
    fn redeclared_parent_replaces_the_previous_record() {
        let mut topology = Topology::new();
        topology.parent("first", noop());
        topology.parent("second", noop());
        topology.child("foo", noop());
        topology.validate().unwrap();

        let registry = Registry::from_topology(&topology);
        assert_eq!(registry.parent_name(), "second");
        assert!(registry.process("first").is_none());
        assert_eq!(registry.child_names(), vec!["foo"]);
    }

    #[test]
    fn registry_lists_children_sorted() {
        let mut topology = Topology::new();
        topology.parent("parent", noop());
        topology.child("zeta", noop());
        topology.child("alpha", noop());
        let registry = Registry::from_topology(&topology);
        assert_eq!(registry.child_names(), vec!["alpha", "zeta"]);
        assert_eq!(registry.parent_name(), "parent");
    }
}
