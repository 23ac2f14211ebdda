//! Channel engine: framed messaging over one socketpair endpoint.
//!
//! Each channel owns its socket exclusively and runs two tasks once
//! started: a reader that decodes frames sequentially and dispatches
//! them, and a writer that drains the bounded outbound queue so that
//! header, payload and ancillary descriptor leave in one `sendmsg`.
//!
//! Handlers run inline on the reader. A blocking handler therefore
//! delays subsequent frames on its own channel, never on other channels.

use crate::{
    error::{Error, FrameError},
    frame::{self, Frame, Header, HEADER_SIZE},
    net::{Fd, UnixStream, UnixStreamExt},
};
use futures::future::BoxFuture;
use nix::{
    sys::socket::{shutdown, Shutdown},
    unistd::{getpid, Pid},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    io::IoSlice,
    os::unix::io::{AsRawFd, IntoRawFd},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, Notify};
use zerocopy::{AsBytes, FromBytes};

/// Depth of the outbound queue; senders wait once the peer falls this
/// far behind.
const OUTBOUND_QUEUE: usize = 64;

type Handler = Arc<dyn Fn(ReceivedMessage) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;
type ReplySlot = oneshot::Sender<Result<Reply, Error>>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// One endpoint of a socketpair carrying framed messages.
pub struct Channel {
    label: String,
    peer_pid: Option<Pid>,
    socket: UnixStream,
    /// Control channels may carry broker frames; everything else rejects
    /// reserved tags.
    control: bool,
    handlers: RwLock<HashMap<u32, Handler>>,
    pending: Mutex<HashMap<u32, ReplySlot>>,
    next_seq: AtomicU32,
    outbound: mpsc::Sender<Frame>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    on_close: Mutex<Option<CloseHook>>,
    shutdown: Notify,
    closed: AtomicBool,
    started: AtomicBool,
}

impl Channel {
    pub(crate) fn new(
        label: impl Into<String>,
        peer_pid: Option<Pid>,
        socket: UnixStream,
        control: bool,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        Arc::new(Self {
            label: label.into(),
            peer_pid,
            socket,
            control,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU32::new(1),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            on_close: Mutex::new(None),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    /// Wrap an inherited or passed descriptor.
    pub(crate) fn from_fd(
        label: impl Into<String>,
        peer_pid: Option<Pid>,
        fd: Fd,
        control: bool,
    ) -> Result<Arc<Self>, Error> {
        let socket = unsafe { <UnixStream as UnixStreamExt>::from_raw_fd(fd.into_raw_fd())? };
        Ok(Self::new(label, peer_pid, socket, control))
    }

    /// Create a connected pair of in-process channels.
    pub fn pair(
        label_a: impl Into<String>,
        label_b: impl Into<String>,
    ) -> Result<(Arc<Self>, Arc<Self>), Error> {
        let (a, b) = UnixStream::pair()?;
        let pid = Some(getpid());
        Ok((
            Self::new(label_a, pid, a, false),
            Self::new(label_b, pid, b, false),
        ))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Pid of the remote endpoint, when known to this process.
    pub fn peer_pid(&self) -> Option<Pid> {
        self.peer_pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register the handler for a message-type tag. The last registration
    /// for a tag wins.
    pub fn register_handler<F, Fut>(&self, id: u32, handler: F)
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |msg| Box::pin(handler(msg)));
        self.handlers.write().unwrap().insert(id, handler);
    }

    /// Run `hook` once when the channel tears down.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().unwrap() = Some(Box::new(hook));
    }

    /// Launch the reader and writer. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = match self.outbound_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };

        let reader = Arc::clone(self);
        tokio::spawn(async move { reader.read_loop().await });

        let writer = Arc::clone(self);
        tokio::spawn(async move { writer.write_loop(rx).await });
    }

    /// Fire-and-forget message.
    pub async fn send(&self, id: u32, payload: &[u8], fd: Option<Fd>) -> Result<(), Error> {
        if id <= frame::RESERVED {
            return Err(Error::ReservedTag(id));
        }
        self.send_raw(id, 0, 0, payload, fd).await
    }

    /// Fire-and-forget message with a bincode-encoded payload.
    pub async fn send_data<T: Serialize>(
        &self,
        id: u32,
        data: &T,
        fd: Option<Fd>,
    ) -> Result<(), Error> {
        let payload = bincode::serialize(data)?;
        self.send(id, &payload, fd).await
    }

    /// Request/reply round trip. Suspends until the reply arrives, the
    /// peer closes, or the caller drops the future.
    pub async fn query(&self, id: u32, payload: &[u8], fd: Option<Fd>) -> Result<Reply, Error> {
        if id <= frame::RESERVED {
            return Err(Error::ReservedTag(id));
        }
        self.query_raw(id, payload, fd).await
    }

    /// [`Channel::query`] with a bincode-encoded payload.
    pub async fn query_data<T: Serialize>(
        &self,
        id: u32,
        data: &T,
        fd: Option<Fd>,
    ) -> Result<Reply, Error> {
        let payload = bincode::serialize(data)?;
        self.query(id, &payload, fd).await
    }

    /// [`Channel::query`] with a deadline. A reply arriving after the
    /// deadline is logged and discarded.
    pub async fn query_timeout(
        &self,
        id: u32,
        payload: &[u8],
        fd: Option<Fd>,
        deadline: Duration,
    ) -> Result<Reply, Error> {
        if id <= frame::RESERVED {
            return Err(Error::ReservedTag(id));
        }
        match tokio::time::timeout(deadline, self.query_raw(id, payload, fd)).await {
            Ok(result) => result,
            // Dropping the inner future removed the pending slot.
            Err(_) => Err(Error::Timeout),
        }
    }

    pub(crate) async fn send_raw(
        &self,
        id: u32,
        flags: u32,
        seq: u32,
        payload: &[u8],
        fd: Option<Fd>,
    ) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::PeerClosed);
        }
        let frame = Frame::new(id, flags, seq, payload.to_vec(), fd)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::PeerClosed)
    }

    pub(crate) async fn query_raw(
        &self,
        id: u32,
        payload: &[u8],
        fd: Option<Fd>,
    ) -> Result<Reply, Error> {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(seq, tx);
        // Removes the slot again if the caller abandons the query.
        let _guard = PendingGuard {
            pending: &self.pending,
            seq,
        };

        self.send_raw(id, 0, seq, payload, fd).await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::PeerClosed),
        }
    }

    fn next_seq(&self) -> u32 {
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            match self.read_frame().await {
                Ok(Some(frame)) => {
                    if let Err(err) = Self::dispatch(&self, frame).await {
                        log::error!("{}: {}", self.label, err);
                        break;
                    }
                }
                Ok(None) => {
                    log::debug!("{}: closed by peer", self.label);
                    break;
                }
                Err(err) => {
                    if !self.is_closed() {
                        log::warn!("{}: receive failed: {}", self.label, err);
                    }
                    break;
                }
            }
        }
        self.teardown();
    }

    /// Read exactly one frame. `Ok(None)` is a clean close at a frame
    /// boundary; EOF anywhere else is a truncated frame.
    async fn read_frame(&self) -> Result<Option<Frame>, Error> {
        let mut fds = Vec::new();
        let mut header_buf = [0u8; HEADER_SIZE];
        let mut off = 0;
        while off < HEADER_SIZE {
            let n = self
                .socket
                .recv_with_fds(&mut header_buf[off..], &mut fds)
                .await?;
            if n == 0 {
                if off == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Truncated.into());
            }
            off += n;
        }

        let header = Header::read_from(&header_buf[..]).ok_or(FrameError::Truncated)?;
        header.validate()?;

        let mut payload = vec![0u8; header.length as usize];
        let mut off = 0;
        while off < payload.len() {
            let seen = fds.len();
            let n = self
                .socket
                .recv_with_fds(&mut payload[off..], &mut fds)
                .await?;
            if fds.len() > seen {
                // A descriptor belongs to the sendmsg carrying its
                // frame's header, never to payload continuation.
                return Err(FrameError::UnexpectedFd.into());
            }
            if n == 0 {
                return Err(FrameError::Truncated.into());
            }
            off += n;
        }

        if fds.len() > 1 {
            return Err(FrameError::UnexpectedFd.into());
        }

        Ok(Some(Frame {
            header,
            payload,
            fd: fds.pop(),
        }))
    }

    /// Route one inbound frame. An `Err` tears the channel down; handler
    /// failures other than protocol violations are logged and absorbed.
    async fn dispatch(this: &Arc<Self>, frame: Frame) -> Result<(), Error> {
        let header = frame.header;

        if header.is_reply() {
            let slot = this.pending.lock().unwrap().remove(&header.seq);
            match slot {
                Some(slot) => {
                    let reply = Reply {
                        id: header.id,
                        payload: frame.payload,
                        fd: frame.fd,
                    };
                    if slot.send(Ok(reply)).is_err() {
                        log::debug!(
                            "{}: reply {} arrived after the waiter left",
                            this.label,
                            header.seq
                        );
                    }
                }
                None => {
                    log::warn!(
                        "{}: dropping reply with unknown correlation id {}",
                        this.label,
                        header.seq
                    );
                }
            }
            return Ok(());
        }

        if header.id <= frame::RESERVED && !this.control {
            return Err(Error::Protocol("reserved tag on non-control channel"));
        }

        let handler = this.handlers.read().unwrap().get(&header.id).cloned();
        match handler {
            Some(handler) => {
                let msg = ReceivedMessage {
                    id: header.id,
                    seq: header.seq,
                    payload: frame.payload,
                    fd: frame.fd,
                    channel: Arc::clone(this),
                };
                if let Err(err) = handler(msg).await {
                    if matches!(err, Error::Protocol(_)) {
                        return Err(err);
                    }
                    log::warn!("{}: handler for tag {} failed: {}", this.label, header.id, err);
                }
            }
            None if header.seq != 0 => {
                log::warn!(
                    "{}: query with tag {} has no handler, peer is left waiting",
                    this.label,
                    header.id
                );
            }
            None => {
                log::warn!("{}: dropping message with unhandled tag {}", this.label, header.id);
            }
        }
        Ok(())
    }

    async fn write_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Frame>) {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = self.write_frame(frame).await {
                            if !self.is_closed() {
                                log::warn!("{}: send failed: {}", self.label, err);
                            }
                            break;
                        }
                    }
                    None => break,
                },
                _ = self.shutdown.notified() => break,
            }
        }
        self.teardown();
    }

    /// Emit one frame. Header, payload and descriptor go out on a single
    /// `sendmsg`; a short write continues with the remaining bytes only.
    async fn write_frame(&self, frame: Frame) -> Result<(), Error> {
        let header = frame.header;
        let total = HEADER_SIZE + frame.payload.len();

        let bufs = [
            IoSlice::new(header.as_bytes()),
            IoSlice::new(&frame.payload),
        ];
        let mut sent = self.socket.send_with_fd(&bufs, frame.fd.as_ref()).await?;

        while sent < total {
            let mut rest = Vec::with_capacity(total - sent);
            if sent < HEADER_SIZE {
                rest.extend_from_slice(&header.as_bytes()[sent..]);
                rest.extend_from_slice(&frame.payload);
            } else {
                rest.extend_from_slice(&frame.payload[sent - HEADER_SIZE..]);
            }
            sent += self
                .socket
                .send_with_fd(&[IoSlice::new(&rest)], None)
                .await?;
        }

        // Our copy of a passed descriptor closes here; the peer owns the
        // transferred one.
        Ok(())
    }

    /// Fail pending queries, run the close hook, shut the socket down.
    /// Safe to call from either worker; only the first call acts.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let waiters: Vec<ReplySlot> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in waiters {
            let _ = slot.send(Err(Error::PeerClosed));
        }

        self.shutdown.notify_one();
        let _ = shutdown(self.socket.as_raw_fd(), Shutdown::Both);

        if let Some(hook) = self.on_close.lock().unwrap().take() {
            hook();
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.label)
            .field("peer_pid", &self.peer_pid)
            .field("control", &self.control)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u32, ReplySlot>>,
    seq: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.seq);
        }
    }
}

/// The payload of an answered query.
#[derive(Debug)]
pub struct Reply {
    id: u32,
    payload: Vec<u8>,
    fd: Option<Fd>,
}

impl Reply {
    /// Message-type tag the responder chose.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload with bincode.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        bincode::deserialize(&self.payload).map_err(Error::from)
    }

    /// Take ownership of the passed descriptor, if any. Left in place,
    /// it closes when the reply is dropped.
    pub fn take_fd(&mut self) -> Option<Fd> {
        self.fd.take()
    }
}

/// An inbound message as seen by a handler.
pub struct ReceivedMessage {
    id: u32,
    seq: u32,
    payload: Vec<u8>,
    fd: Option<Fd>,
    channel: Arc<Channel>,
}

impl ReceivedMessage {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload with bincode.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        bincode::deserialize(&self.payload).map_err(Error::from)
    }

    /// Take ownership of the passed descriptor, if any. Left in place,
    /// it closes when the message is dropped.
    pub fn take_fd(&mut self) -> Option<Fd> {
        self.fd.take()
    }

    /// Answer this message. A query's reply echoes its correlation id;
    /// replying to a fire-and-forget message sends a new one.
    pub async fn reply(&self, id: u32, payload: &[u8], fd: Option<Fd>) -> Result<(), Error> {
        if id <= frame::RESERVED && !self.channel.control {
            return Err(Error::ReservedTag(id));
        }
        let (flags, seq) = if self.seq != 0 {
            (frame::FLAG_REPLY, self.seq)
        } else {
            (0, 0)
        };
        self.channel.send_raw(id, flags, seq, payload, fd).await
    }

    /// [`ReceivedMessage::reply`] with a bincode-encoded payload.
    pub async fn reply_data<T: Serialize>(
        &self,
        id: u32,
        data: &T,
        fd: Option<Fd>,
    ) -> Result<(), Error> {
        let payload = bincode::serialize(data)?;
        self.reply(id, &payload, fd).await
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("payload_len", &self.payload.len())
            .field("fd", &self.fd)
            .finish()
    }
}
