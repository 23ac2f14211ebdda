//! Bootstrap broker: re-exec detection, the parent's fork loop, control
//! channels, peer-channel wiring and the ready barrier.
//!
//! The same binary runs every process. The first invocation is the
//! parent; it forks and re-execs itself once per declared child with
//! [`REEXEC_ENV`] naming the child to become and the control socketpair
//! end inherited as [`CONTROL_FD`]. Peer channels are created in the
//! parent and handed to the children over the control channels, one
//! CHANNEL frame per endpoint, followed by a READY frame that releases
//! each child's entrypoint.

use crate::{
    channel::Channel,
    error::Error,
    frame,
    net::{socketpair, Fd},
    privdrop,
    runtime::Runtime,
    topology::{Registry, Topology, REEXEC_ENV},
};
use close_fds::close_open_fds;
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag},
    },
    unistd::{dup2, execve, fork, getpid, getppid, ForkResult, Pid},
};
use std::{
    collections::BTreeSet,
    env,
    ffi::CString,
    mem,
    os::unix::{
        ffi::OsStrExt,
        io::{AsRawFd, RawFd},
    },
    path::Path,
    process,
    sync::Arc,
};
use tokio::signal::unix::{signal, SignalKind};

/// File descriptor every child inherits for its parent control channel.
pub const CONTROL_FD: RawFd = 3;

pub(crate) async fn start(mut topology: Topology) -> Result<(), Error> {
    topology.validate()?;
    let registry = Registry::from_topology(&topology);

    let current = match env::var(REEXEC_ENV) {
        Ok(name) if !name.is_empty() => name,
        _ => registry.parent_name().to_string(),
    };

    // Only the current process's entrypoint and hooks leave the
    // declaration; the rest of it freezes into the registry.
    let decl = topology
        .processes
        .get_mut(&current)
        .ok_or_else(|| Error::UnknownProcess(current.clone()))?;
    let main = decl
        .main
        .take()
        .ok_or(Error::Protocol("process has no entrypoint"))?;
    let pre_chroot = decl.pre_chroot.take();
    let pre_start = decl.pre_start.take();

    let runtime = Runtime::new(registry, current, getpid());

    if runtime.is_parent() {
        if let Err(err) = parent_bootstrap(&runtime, pre_chroot).await {
            terminate_children(&runtime);
            return Err(err);
        }
    } else {
        child_bootstrap(&runtime, pre_chroot).await?;
        // Suspend until the parent has wired every peer channel.
        runtime.ready.notified().await;
    }

    if let Some(hook) = pre_start {
        hook(&runtime)?;
    }

    // Handlers installed by pre-start are in place before the first
    // peer frame is read.
    runtime.start_peer_channels();

    log::debug!("{}: entering main", runtime.current());
    main(Arc::clone(&runtime)).await
}

/// Fork and wire everything, then drop the parent's own privileges.
async fn parent_bootstrap(
    runtime: &Arc<Runtime>,
    pre_chroot: Option<crate::topology::Hook>,
) -> Result<(), Error> {
    let program = env::current_exe()?;
    let children = runtime.registry().child_names();

    for name in &children {
        let (pid, fd) = fork_child(&program, name)?;
        log::debug!("forked {} (pid {})", name, pid);
        runtime.remember_child(name.clone(), pid);

        let label = format!("{}<->{}", runtime.parent_name(), name);
        let control = Channel::from_fd(label, Some(pid), fd, true)?;
        {
            let runtime = Arc::clone(runtime);
            let name = name.clone();
            control.on_close(move || {
                log::error!("lost control channel to {}, terminating", name);
                terminate_group(&runtime);
            });
        }
        runtime.install_control(name.clone(), Arc::clone(&control));
        control.start();
    }

    wire_peer_channels(runtime).await?;

    // Every CHANNEL frame is out; release the children. The stream
    // socket keeps READY behind them.
    for name in &children {
        let control = runtime
            .control_channel(name)
            .ok_or(Error::Protocol("missing control channel"))?;
        control.send_raw(frame::READY, 0, 0, &[], None).await?;
    }

    privdrop::descend(runtime, pre_chroot)
}

/// Wrap the inherited control fd, register the broker handlers and drop
/// privileges. The ready latch is awaited by the caller.
async fn child_bootstrap(
    runtime: &Arc<Runtime>,
    pre_chroot: Option<crate::topology::Hook>,
) -> Result<(), Error> {
    set_cloexec(CONTROL_FD, true)?;

    let label = format!("{}<->{}", runtime.current(), runtime.parent_name());
    let control = Channel::from_fd(label, Some(getppid()), Fd::from(CONTROL_FD), true)?;

    register_broker_handlers(runtime, &control);
    control.on_close(|| {
        log::error!("parent went away, exiting");
        process::exit(1);
    });
    runtime.install_control(runtime.parent_name().to_string(), Arc::clone(&control));
    control.start();

    // The parent terminating rips the socketpair out from under us.
    let mut sigpipe = signal(SignalKind::pipe())?;
    tokio::spawn(async move {
        sigpipe.recv().await;
        log::error!("received SIGPIPE, terminating");
        process::exit(1);
    });

    privdrop::descend(runtime, pre_chroot)
}

/// The CHANNEL and READY handlers. Trusted: they are registered only on
/// the parent control channel.
fn register_broker_handlers(runtime: &Arc<Runtime>, control: &Arc<Channel>) {
    let rt = Arc::clone(runtime);
    control.register_handler(frame::CHANNEL, move |mut msg| {
        let rt = Arc::clone(&rt);
        async move {
            let peer = String::from_utf8(msg.payload().to_vec())
                .map_err(|_| Error::Protocol("channel hand-off names no valid peer"))?;
            if rt.registry().process(&peer).is_none() {
                return Err(Error::Protocol("channel hand-off names unknown peer"));
            }
            let fd = msg
                .take_fd()
                .ok_or(Error::Protocol("channel hand-off carries no descriptor"))?;

            let label = format!("{}<->{}", rt.current(), peer);
            let channel = Channel::from_fd(label, None, fd, false)?;
            rt.install_channel(peer, channel)?;
            msg.reply(frame::CHANNEL, &[], None).await
        }
    });

    let rt = Arc::clone(runtime);
    control.register_handler(frame::READY, move |_msg| {
        let rt = Arc::clone(&rt);
        async move {
            // Control frames are ordered, so every hand-off must already
            // be installed when READY shows up.
            let info = rt
                .registry()
                .process(rt.current())
                .cloned()
                .ok_or(Error::Protocol("current process not in registry"))?;
            {
                let channels = rt.channels.read().unwrap();
                for peer in &info.peers {
                    if !channels.contains_key(peer) {
                        return Err(Error::Protocol("ready received before all channels wired"));
                    }
                }
            }
            rt.ready.notify_one();
            Ok(())
        }
    });
}

/// Create one socketpair per undirected peer edge and hand each end to
/// its endpoint, in deterministic order.
async fn wire_peer_channels(runtime: &Arc<Runtime>) -> Result<(), Error> {
    let mut wired: BTreeSet<(String, String)> = BTreeSet::new();

    let edges: Vec<(String, String)> = runtime
        .registry()
        .iter()
        .flat_map(|(name, info)| {
            info.peers
                .iter()
                .map(|peer| (name.clone(), peer.clone()))
                .collect::<Vec<_>>()
        })
        .collect();

    for (name, peer) in edges {
        let edge = if name < peer {
            (name.clone(), peer.clone())
        } else {
            (peer.clone(), name.clone())
        };
        if !wired.insert(edge) {
            continue;
        }

        let (fd_a, fd_b) = socketpair()?;
        deliver_endpoint(runtime, &name, &peer, fd_a).await?;
        deliver_endpoint(runtime, &peer, &name, fd_b).await?;
    }
    Ok(())
}

/// Hand `fd` to `endpoint` as its channel end towards `peer`. The parent
/// installs its own endpoints directly; a child gets a CHANNEL query on
/// its control channel and acks with an empty reply. Our copy of the
/// descriptor is closed once the query returns.
async fn deliver_endpoint(
    runtime: &Arc<Runtime>,
    endpoint: &str,
    peer: &str,
    fd: Fd,
) -> Result<(), Error> {
    if endpoint == runtime.parent_name() {
        let label = format!("{}<->{}", endpoint, peer);
        let channel = Channel::from_fd(label, runtime.child_pid(peer), fd, false)?;
        runtime.install_channel(peer.to_string(), channel)
    } else {
        let control = runtime
            .control_channel(endpoint)
            .ok_or(Error::Protocol("missing control channel"))?;
        control
            .query_raw(frame::CHANNEL, peer.as_bytes(), Some(fd))
            .await?;
        Ok(())
    }
}

/// Fork and exec the current binary as child `name`. Returns the child's
/// pid and the parent's end of the control socketpair.
fn fork_child(program: &Path, name: &str) -> Result<(Pid, Fd), Error> {
    let (local, remote) = socketpair()?;

    match unsafe { fork() }? {
        ForkResult::Parent { child, .. } => {
            drop(remote);
            Ok((child, local))
        }
        ForkResult::Child => {
            drop(local);

            if dup2(remote.as_raw_fd(), CONTROL_FD).is_err() {
                process::exit(127);
            }
            if remote.as_raw_fd() != CONTROL_FD {
                drop(remote);
            } else {
                mem::forget(remote);
            }
            if set_cloexec(CONTROL_FD, false).is_err() {
                process::exit(127);
            }

            // Rust marks most descriptors close-on-exec; close whatever
            // is left above the control fd before handing over.
            unsafe {
                close_open_fds(CONTROL_FD + 1, &[]);
            }

            let path = path_to_cstr(program);
            let arg0 = match CString::new(format!("{}: {}", program.display(), name)) {
                Ok(arg0) => arg0,
                Err(_) => process::exit(127),
            };
            let env = [
                CString::new(format!("{}={}", REEXEC_ENV, name)),
                CString::new(format!(
                    "RUST_LOG={}",
                    env::var("RUST_LOG").unwrap_or_default()
                )),
            ];
            let env: Vec<CString> = match env.into_iter().collect() {
                Ok(env) => env,
                Err(_) => process::exit(127),
            };
            let env: Vec<&CString> = env.iter().collect();

            let _ = execve(&path, &[&arg0], &env);
            // Exec failed; nothing sensible is left in the forked copy.
            process::exit(127);
        }
    }
}

/// Kill the children without exiting; bootstrap error path.
fn terminate_children(runtime: &Runtime) {
    for (name, pid) in runtime.children.lock().unwrap().iter() {
        log::debug!("terminating {} (pid {})", name, pid);
        let _ = kill(*pid, Signal::SIGTERM);
    }
}

/// Group policy for a lost child: the tree is inconsistent, take
/// everything down with a nonzero exit.
fn terminate_group(runtime: &Runtime) {
    terminate_children(runtime);
    while let Ok(status) = waitpid(None, Some(WaitPidFlag::WNOHANG)) {
        if status.pid().is_none() {
            break;
        }
    }
    process::exit(1);
}

fn set_cloexec(fd: RawFd, add: bool) -> Result<(), Error> {
    let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, add);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

fn path_to_cstr(path: &Path) -> CString {
    let ospath = path.as_os_str().as_bytes().to_vec();
    unsafe { CString::from_vec_unchecked(ospath) }
}
