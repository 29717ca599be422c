//! Multiplexed connection implementation
//!
//! A [`Multiplexer`] owns one transport stream and carries any number of
//! [`Channel`]s over it. Two tasks drive the stream: a reader that runs the
//! demultiplex loop and a writer that drains the outbound buffer.
//!
//! All connection state, including every channel's control fields and byte
//! bank, lives behind one lock (the connection lock). Tasks that need it
//! together with a channel's consumer lock take both with try-lock and
//! reschedule themselves on a miss.

use crate::bank::ByteBank;
use crate::channel::{self, Channel, ChannelShared};
use crate::config::MuxConfig;
use crate::error::{MuxError, MuxResult};
use crate::pool::PoolShared;
use crate::retry::{acquire, schedule, try_acquire, TimerSlot};
use crate::state::{ConnectState, RemoteClose, Role};
use bytes::{Buf, Bytes, BytesMut};
use muxvc_proto::{ChannelId, FrameHeader, FrameParser, MessageType, Parsed, RESERVED_CHANNEL_ID};
use muxvc_transport::{BoxedStream, TransportConnector, TransportStream};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

static NEXT_MUX_ID: AtomicU64 = AtomicU64::new(1);

/// Per-channel fields owned by the connection lock
#[derive(Debug, Default)]
pub(crate) struct ChannelCtl {
    pub remote: RemoteClose,
    pub bank: ByteBank,
    /// We sent FLOW_CONTROL_START and owe a STOP
    pub read_flow_stopped: bool,
    /// Peer sent FLOW_CONTROL_START
    pub write_flow_stopped: bool,
    pub shutdown_sent: bool,
}

pub(crate) struct ChannelEntry {
    pub chan: Arc<ChannelShared>,
    pub ctl: ChannelCtl,
}

pub(crate) struct MuxInner {
    pub state: ConnectState,
    pub channels: BTreeMap<ChannelId, ChannelEntry>,
    next_channel_id: ChannelId,
    read_buf: BytesMut,
    parser: FrameParser,
    pub write_buf: BytesMut,
    pub writes_blocked: bool,
    bytes_written: u64,
    idle_timer: TimerSlot,
    reader: Option<AbortHandle>,
    writer: Option<AbortHandle>,
    pool: Option<Weak<PoolShared>>,
}

pub(crate) struct MuxShared {
    pub id: u64,
    pub role: Role,
    pub config: Arc<MuxConfig>,
    /// Address dialed (client) or accepted from (server)
    pub remote: SocketAddr,
    pub runtime: Handle,
    pub inner: Mutex<MuxInner>,
    write_wake: Notify,
    local_addr: OnceLock<SocketAddr>,
    peer_addr: OnceLock<SocketAddr>,
    acceptor: Option<mpsc::UnboundedSender<Channel>>,
}

/// Outcome of a non-blocking channel creation attempt
pub(crate) enum ChannelLookup {
    Created(Channel),
    /// Connection lock was held elsewhere
    Busy,
    Unusable(MuxError),
}

/// Queue one frame on the outbound buffer
pub(crate) fn enqueue_frame(
    write_buf: &mut BytesMut,
    msg_type: MessageType,
    channel_id: ChannelId,
    payload: &[u8],
) {
    match FrameHeader::new(msg_type, channel_id, payload.len()) {
        Ok(header) => {
            header.encode_into(write_buf);
            write_buf.extend_from_slice(payload);
        }
        Err(e) => error!("Dropping {} for channel {}: {}", msg_type, channel_id, e),
    }
}

fn add_touched(touched: &mut Vec<Arc<ChannelShared>>, chan: &Arc<ChannelShared>) {
    if !touched.iter().any(|c| Arc::ptr_eq(c, chan)) {
        touched.push(chan.clone());
    }
}

impl MuxShared {
    fn new(
        role: Role,
        remote: SocketAddr,
        config: Arc<MuxConfig>,
        runtime: Handle,
        acceptor: Option<mpsc::UnboundedSender<Channel>>,
    ) -> Arc<Self> {
        let read_capacity = config.read_chunk_size;
        Arc::new(Self {
            id: NEXT_MUX_ID.fetch_add(1, Ordering::Relaxed),
            role,
            config,
            remote,
            runtime,
            inner: Mutex::new(MuxInner {
                state: ConnectState::NotConnected,
                channels: BTreeMap::new(),
                next_channel_id: 1,
                read_buf: BytesMut::with_capacity(read_capacity),
                parser: FrameParser::new(),
                write_buf: BytesMut::new(),
                writes_blocked: false,
                bytes_written: 0,
                idle_timer: TimerSlot::default(),
                reader: None,
                writer: None,
                pool: None,
            }),
            write_wake: Notify::new(),
            local_addr: OnceLock::new(),
            peer_addr: OnceLock::new(),
            acceptor,
        })
    }

    pub(crate) fn wake_writer(&self) {
        self.write_wake.notify_one();
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr.get().copied().unwrap_or(self.remote)
    }

    /// Queue a header-only frame if the connection can still send
    fn send_control(&self, inner: &mut MuxInner, msg_type: MessageType, channel_id: ChannelId) {
        if !inner.state.can_send() {
            return;
        }
        enqueue_frame(&mut inner.write_buf, msg_type, channel_id, &[]);
        self.wake_writer();
    }

    // ---- connect / start -------------------------------------------------

    async fn connect(self: &Arc<Self>, connector: &dyn TransportConnector) -> MuxResult<()> {
        {
            let mut inner = acquire(&self.inner);
            if inner.state != ConnectState::NotConnected {
                return Err(MuxError::NotConnected(inner.state));
            }
            inner.state = ConnectState::ConnectIssued;
        }

        debug!("[{}] Connecting to {}", self.id, self.remote);

        let connect = tokio::time::timeout(self.config.connect_timeout, connector.connect(self.remote));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(e.to_string())),
            Err(_) => return Err(self.connect_failed("connect timed out".to_string())),
        };

        acquire(&self.inner).state = ConnectState::WaitForReady;

        // A zero-length write confirms the socket is usable
        let ready = tokio::time::timeout(self.config.ready_timeout, async {
            stream.write(&[]).await?;
            stream.flush().await
        });
        match ready.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.connect_failed(format!("not ready: {}", e))),
            Err(_) => return Err(self.connect_failed("not ready before timeout".to_string())),
        }

        self.start(stream);
        Ok(())
    }

    fn connect_failed(self: &Arc<Self>, reason: String) -> MuxError {
        {
            let mut inner = acquire(&self.inner);
            inner.state = ConnectState::ConnectFailed;
            warn!("[{}] Connect to {} failed: {}", self.id, self.remote, reason);
            self.terminate_locked(&mut inner);
        }
        MuxError::ConnectFailed {
            addr: self.remote,
            reason,
        }
    }

    /// Capture addresses and start the I/O tasks
    fn start(self: &Arc<Self>, stream: BoxedStream) {
        if let Ok(addr) = stream.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        if let Ok(addr) = stream.peer_addr() {
            let _ = self.peer_addr.set(addr);
        }

        let (rd, wr) = tokio::io::split(stream);

        let mut inner = acquire(&self.inner);
        inner.state = ConnectState::ConnectedActive;
        inner.reader = Some(self.runtime.spawn(read_loop(self.clone(), rd)).abort_handle());
        inner.writer = Some(self.runtime.spawn(write_loop(self.clone(), wr)).abort_handle());

        info!(
            "[{}] Connected ({:?}) {} <-> {}",
            self.id,
            self.role,
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".to_string()),
            self.peer_addr()
        );
    }

    // ---- channel set -----------------------------------------------------

    pub(crate) fn try_new_channel(self: &Arc<Self>) -> ChannelLookup {
        let Some(mut inner) = try_acquire(&self.inner) else {
            return ChannelLookup::Busy;
        };
        match self.new_channel_locked(&mut inner) {
            Ok(channel) => ChannelLookup::Created(channel),
            Err(e) => ChannelLookup::Unusable(e),
        }
    }

    fn new_channel_locked(self: &Arc<Self>, inner: &mut MuxInner) -> MuxResult<Channel> {
        if self.role == Role::Server {
            return Err(MuxError::ServerRole);
        }
        if !inner.state.is_reusable() {
            return Err(MuxError::NotConnected(inner.state));
        }
        if let Some(max) = self.config.max_channels_per_connection {
            if inner.channels.len() >= max {
                return Err(MuxError::ChannelLimit(max));
            }
        }

        let id = Self::allocate_id(inner)?;
        let channel = self.insert_channel(inner, id);
        self.send_control(inner, MessageType::OpenChannel, id);

        debug!("[{},{}] Opened channel", self.id, id);
        Ok(channel)
    }

    fn allocate_id(inner: &mut MuxInner) -> MuxResult<ChannelId> {
        // Among len + 1 consecutive ids at least one is free
        for _ in 0..=inner.channels.len() {
            let id = inner.next_channel_id;
            inner.next_channel_id = if id == ChannelId::MAX { 1 } else { id + 1 };
            if id != RESERVED_CHANNEL_ID && !inner.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(MuxError::ChannelIdsExhausted)
    }

    fn insert_channel(self: &Arc<Self>, inner: &mut MuxInner, id: ChannelId) -> Channel {
        let chan = Arc::new(ChannelShared::new(id));
        inner.channels.insert(
            id,
            ChannelEntry {
                chan: chan.clone(),
                ctl: ChannelCtl::default(),
            },
        );

        if inner.state == ConnectState::ConnectedIdle {
            inner.state = ConnectState::ConnectedActive;
            inner.idle_timer.cancel();
            debug!("[{}] Idle connection reused", self.id);
        }

        Channel::from_parts(chan, self.clone())
    }

    /// Drop a closed channel from the active set
    pub(crate) fn remove_channel(self: &Arc<Self>, inner: &mut MuxInner, id: ChannelId) {
        let Some(entry) = inner.channels.remove(&id) else {
            return;
        };

        if !entry.ctl.remote.has(RemoteClose::CHANNEL_EVENT) {
            self.send_control(inner, MessageType::CloseChannel, id);
        }

        debug!(
            "[{},{}] Channel removed, {} remaining",
            self.id,
            id,
            inner.channels.len()
        );

        if inner.channels.is_empty() {
            match inner.state {
                ConnectState::ConnectedActive => self.go_idle(inner),
                ConnectState::ConnectionDropped => self.terminate_locked(inner),
                _ => {}
            }
        }
    }

    // ---- lifecycle -------------------------------------------------------

    fn go_idle(self: &Arc<Self>, inner: &mut MuxInner) {
        inner.state = ConnectState::ConnectedIdle;
        let mux = self.clone();
        inner.idle_timer.arm(schedule(
            &self.runtime,
            self.config.idle_timeout,
            move || mux.on_idle_timeout(),
        ));
        debug!(
            "[{}] Connection idle, teardown in {:?}",
            self.id, self.config.idle_timeout
        );
    }

    /// Go idle if nothing was opened on a fresh connection
    pub(crate) fn settle_idle(self: &Arc<Self>) {
        let Some(mut inner) = try_acquire(&self.inner) else {
            let mux = self.clone();
            schedule(&self.runtime, self.config.lock_retry, move || {
                mux.settle_idle()
            });
            return;
        };
        if inner.state == ConnectState::ConnectedActive && inner.channels.is_empty() {
            self.go_idle(&mut inner);
        }
    }

    fn on_idle_timeout(self: &Arc<Self>) {
        let Some(mut inner) = try_acquire(&self.inner) else {
            let mux = self.clone();
            schedule(&self.runtime, self.config.lock_retry, move || {
                mux.on_idle_timeout()
            });
            return;
        };

        // A channel may have been opened while this was pending
        if inner.state != ConnectState::ConnectedIdle || !inner.channels.is_empty() {
            return;
        }

        debug!("[{}] Idle timeout, tearing down", self.id);
        inner.state = ConnectState::ConnectedTeardown;
        drop(inner);
        self.wake_writer();
    }

    fn finish_teardown(self: &Arc<Self>) {
        let mut inner = acquire(&self.inner);
        self.terminate_locked(&mut inner);
    }

    /// Transport failed: owe every channel its notifications
    fn connection_dropped(self: &Arc<Self>, reason: &str) {
        let mut touched = Vec::new();
        {
            let mut guard = acquire(&self.inner);
            let inner = &mut *guard;
            match inner.state {
                ConnectState::Terminated | ConnectState::ConnectionDropped => return,
                ConnectState::ConnectedTeardown => {
                    self.terminate_locked(inner);
                    return;
                }
                _ => {}
            }

            warn!(
                "[{}] Connection to {} dropped: {} ({} channels live)",
                self.id,
                self.peer_addr(),
                reason,
                inner.channels.len()
            );

            inner.state = ConnectState::ConnectionDropped;
            inner.idle_timer.cancel();
            inner.write_buf.clear();
            inner.writes_blocked = false;

            for entry in inner.channels.values_mut() {
                entry.ctl.remote.mark_closed();
                entry.ctl.write_flow_stopped = false;
                touched.push(entry.chan.clone());
            }

            if inner.channels.is_empty() {
                self.terminate_locked(inner);
            }
        }

        for chan in touched {
            channel::schedule_process(self, &chan, Duration::ZERO);
        }
    }

    fn terminate_locked(self: &Arc<Self>, inner: &mut MuxInner) {
        if inner.state == ConnectState::Terminated {
            return;
        }
        let previous = inner.state;
        inner.state = ConnectState::Terminated;
        inner.idle_timer.cancel();
        inner.write_buf.clear();
        inner.read_buf.clear();
        inner.parser.reset();

        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        if let Some(writer) = inner.writer.take() {
            writer.abort();
        }

        info!(
            "[{}] Connection to {} terminated (was {}, {} bytes written)",
            self.id,
            self.peer_addr(),
            previous,
            inner.bytes_written
        );

        if let Some(pool) = inner.pool.take().and_then(|p| p.upgrade()) {
            pool.forget(self.id, self.remote);
        }
    }

    fn set_pool(self: &Arc<Self>, pool: Weak<PoolShared>) {
        let mut inner = acquire(&self.inner);
        if inner.state.is_terminal() {
            drop(inner);
            if let Some(pool) = pool.upgrade() {
                pool.forget(self.id, self.remote);
            }
            return;
        }
        inner.pool = Some(pool);
    }

    // ---- read path -------------------------------------------------------

    fn handle_inbound(self: &Arc<Self>, data: &[u8]) -> MuxResult<()> {
        let mut touched = Vec::new();
        let result = {
            let mut guard = acquire(&self.inner);
            let inner = &mut *guard;
            if !inner.state.can_send() {
                return Ok(());
            }
            inner.read_buf.extend_from_slice(data);
            self.parse_loop(inner, &mut touched)
        };

        for chan in touched {
            channel::schedule_process(self, &chan, Duration::ZERO);
        }
        result
    }

    fn parse_loop(
        self: &Arc<Self>,
        inner: &mut MuxInner,
        touched: &mut Vec<Arc<ChannelShared>>,
    ) -> MuxResult<()> {
        loop {
            let Some(parsed) = inner.parser.poll(&mut inner.read_buf)? else {
                return Ok(());
            };
            match parsed {
                Parsed::Control(header) => self.process_control(inner, header, touched),
                Parsed::Data {
                    header,
                    chunk,
                    first,
                    ..
                } => self.process_data(inner, header, chunk, first, touched),
            }
        }
    }

    fn process_data(
        self: &Arc<Self>,
        inner: &mut MuxInner,
        header: FrameHeader,
        mut chunk: Bytes,
        first: bool,
        touched: &mut Vec<Arc<ChannelShared>>,
    ) {
        let id = header.channel_id;
        if header.msg_type == MessageType::OobData {
            trace!("[{},{}] Discarding {} OOB bytes", self.id, id, chunk.len());
            return;
        }

        let can_send = inner.state.can_send();
        let MuxInner {
            channels,
            write_buf,
            ..
        } = inner;

        let Some(entry) = channels.get_mut(&id) else {
            if first && can_send {
                warn!("[{}] Data for unknown channel {}, resetting", self.id, id);
                enqueue_frame(write_buf, MessageType::ChannelReset, id, &[]);
                self.wake_writer();
            }
            return;
        };

        let chan = &entry.chan;
        if chan.is_closed() || chan.read_shut_down() || entry.ctl.remote.inbound_closed() {
            trace!("[{},{}] Discarding {} bytes", self.id, id, chunk.len());
            return;
        }

        // Fresh bytes go straight to the reader only when nothing is banked
        if entry.ctl.bank.is_empty() {
            let slot = try_acquire(&chan.read).filter(|slot| slot.unread.is_empty());
            if let Some(mut slot) = slot {
                if let Some(op) = slot.op.as_mut() {
                    if op.vio.wants_transfer() {
                        let n = op.vio.ntodo().min(chunk.len());
                        op.vio.buffer.extend_from_slice(&chunk[..n]);
                        op.vio.record(n);
                        chunk.advance(n);
                    }
                }
            }
        }

        if !chunk.is_empty() {
            trace!("[{},{}] Banking {} bytes", self.id, id, chunk.len());
            entry.ctl.bank.push(chunk);

            if self.config.flow_control
                && can_send
                && !entry.ctl.read_flow_stopped
                && entry.ctl.bank.len() > self.config.max_byte_bank
            {
                entry.ctl.read_flow_stopped = true;
                debug!(
                    "[{},{}] Byte bank at {} bytes, pausing peer",
                    self.id,
                    id,
                    entry.ctl.bank.len()
                );
                enqueue_frame(write_buf, MessageType::FlowControlStart, id, &[]);
                self.wake_writer();
            }
        }

        add_touched(touched, chan);
    }

    fn process_control(
        self: &Arc<Self>,
        inner: &mut MuxInner,
        header: FrameHeader,
        touched: &mut Vec<Arc<ChannelShared>>,
    ) {
        let id = header.channel_id;

        if header.msg_type == MessageType::OpenChannel {
            self.accept_channel(inner, id);
            return;
        }

        let Some(entry) = inner.channels.get_mut(&id) else {
            trace!(
                "[{}] {} for unknown channel {}",
                self.id,
                header.msg_type,
                id
            );
            return;
        };

        match header.msg_type {
            MessageType::CloseChannel | MessageType::ChannelReset => {
                debug!("[{},{}] Peer sent {}", self.id, id, header.msg_type);
                entry.ctl.remote.mark_closed();
                entry.ctl.write_flow_stopped = false;
            }
            MessageType::ShutdownWrite => {
                debug!("[{},{}] Peer shut down its write side", self.id, id);
                entry.ctl.remote.mark_write_shutdown();
            }
            MessageType::FlowControlStart => {
                trace!("[{},{}] Peer paused our writes", self.id, id);
                entry.ctl.write_flow_stopped = true;
            }
            MessageType::FlowControlStop => {
                trace!("[{},{}] Peer resumed our writes", self.id, id);
                entry.ctl.write_flow_stopped = false;
            }
            MessageType::OpenChannel | MessageType::NormalData | MessageType::OobData => {}
        }

        add_touched(touched, &entry.chan);
    }

    fn accept_channel(self: &Arc<Self>, inner: &mut MuxInner, id: ChannelId) {
        let acceptor = match (&self.acceptor, self.role) {
            (Some(tx), Role::Server) if !tx.is_closed() => tx,
            _ => {
                debug!("[{}] Refusing OPEN_CHANNEL {}", self.id, id);
                self.send_control(inner, MessageType::CloseChannel, id);
                return;
            }
        };

        if id == RESERVED_CHANNEL_ID || inner.channels.contains_key(&id) {
            warn!("[{}] Peer opened invalid channel id {}", self.id, id);
            self.send_control(inner, MessageType::ChannelReset, id);
            return;
        }

        let over_limit = self
            .config
            .max_channels_per_connection
            .is_some_and(|max| inner.channels.len() >= max);
        if over_limit || !inner.state.is_reusable() {
            debug!("[{}] Refusing OPEN_CHANNEL {} in {}", self.id, id, inner.state);
            self.send_control(inner, MessageType::CloseChannel, id);
            return;
        }

        let channel = self.insert_channel(inner, id);
        debug!("[{},{}] Accepted channel", self.id, id);

        if let Err(mpsc::error::SendError(channel)) = acceptor.send(channel) {
            debug!("[{},{}] Acceptor went away", self.id, id);
            channel.mark_closed();
            self.remove_channel(inner, id);
        }
    }

    // ---- write path ------------------------------------------------------

    fn after_write(self: &Arc<Self>, written: usize) {
        let resumed: Vec<Arc<ChannelShared>> = {
            let mut inner = acquire(&self.inner);
            inner.bytes_written += written as u64;
            if inner.writes_blocked && inner.write_buf.len() < self.config.write_high_water {
                inner.writes_blocked = false;
                debug!("[{}] Write backlog drained, resuming channels", self.id);
                inner.channels.values().map(|e| e.chan.clone()).collect()
            } else {
                Vec::new()
            }
        };

        for chan in resumed {
            channel::schedule_process(self, &chan, Duration::ZERO);
        }
    }
}

async fn read_loop(mux: Arc<MuxShared>, mut rd: ReadHalf<BoxedStream>) {
    let mut buf = vec![0u8; mux.config.read_chunk_size];

    loop {
        let read = match mux.config.transport_inactivity_timeout {
            Some(limit) => match tokio::time::timeout(limit, rd.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    mux.connection_dropped("inactivity timeout");
                    return;
                }
            },
            None => rd.read(&mut buf).await,
        };

        match read {
            Ok(0) => {
                debug!("[{}] Peer closed the connection", mux.id);
                mux.connection_dropped("end of stream");
                return;
            }
            Ok(n) => {
                trace!("[{}] Read {} bytes", mux.id, n);
                if let Err(e) = mux.handle_inbound(&buf[..n]) {
                    error!("[{}] Protocol error: {}", mux.id, e);
                    mux.connection_dropped(&e.to_string());
                    return;
                }
            }
            Err(e) => {
                error!("[{}] Read error: {}", mux.id, e);
                mux.connection_dropped(&e.to_string());
                return;
            }
        }
    }
}

async fn write_loop(mux: Arc<MuxShared>, mut wr: WriteHalf<BoxedStream>) {
    loop {
        let (data, state) = {
            let mut inner = acquire(&mux.inner);
            (inner.write_buf.split().freeze(), inner.state)
        };

        match state {
            ConnectState::Terminated | ConnectState::ConnectionDropped => return,
            ConnectState::ConnectedTeardown if data.is_empty() => {
                if let Err(e) = wr.shutdown().await {
                    debug!("[{}] Shutdown failed: {}", mux.id, e);
                }
                mux.finish_teardown();
                return;
            }
            _ => {}
        }

        if data.is_empty() {
            mux.write_wake.notified().await;
            continue;
        }

        let result = async {
            wr.write_all(&data).await?;
            wr.flush().await
        }
        .await;

        if let Err(e) = result {
            error!("[{}] Write error: {}", mux.id, e);
            mux.connection_dropped(&e.to_string());
            return;
        }

        trace!("[{}] Wrote {} bytes", mux.id, data.len());
        mux.after_write(data.len());
    }
}

/// A multiplexed connection to one peer
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("remote", &self.shared.remote)
            .finish()
    }
}

impl Multiplexer {
    /// Create an unconnected client multiplexer for `remote`
    ///
    /// Must be called from within a tokio runtime.
    pub fn client(remote: SocketAddr, config: MuxConfig) -> Self {
        Self::client_with(remote, Arc::new(config), Handle::current())
    }

    pub(crate) fn client_with(remote: SocketAddr, config: Arc<MuxConfig>, runtime: Handle) -> Self {
        Self {
            shared: MuxShared::new(Role::Client, remote, config, runtime, None),
        }
    }

    /// Wrap an accepted stream as a server multiplexer
    ///
    /// Channels the peer opens are sent to `acceptor`. Must be called from
    /// within a tokio runtime.
    pub fn accept_stream(
        stream: BoxedStream,
        config: MuxConfig,
        acceptor: mpsc::UnboundedSender<Channel>,
    ) -> Self {
        Self::serve(stream, Arc::new(config), Handle::current(), acceptor)
    }

    pub(crate) fn serve(
        stream: BoxedStream,
        config: Arc<MuxConfig>,
        runtime: Handle,
        acceptor: mpsc::UnboundedSender<Channel>,
    ) -> Self {
        let remote = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let shared = MuxShared::new(Role::Server, remote, config, runtime, Some(acceptor));
        shared.start(stream);
        shared.settle_idle();
        Self { shared }
    }

    /// Connect the transport and wait until it is ready
    pub async fn connect(&self, connector: &dyn TransportConnector) -> MuxResult<()> {
        self.shared.connect(connector).await
    }

    /// Open a new outbound channel, waiting out lock contention
    pub async fn open_channel(&self) -> MuxResult<Channel> {
        loop {
            match self.shared.try_new_channel() {
                ChannelLookup::Created(channel) => return Ok(channel),
                ChannelLookup::Unusable(e) => return Err(e),
                ChannelLookup::Busy => tokio::time::sleep(self.shared.config.lock_retry).await,
            }
        }
    }

    pub(crate) fn try_new_channel(&self) -> ChannelLookup {
        self.shared.try_new_channel()
    }

    pub(crate) fn set_pool(&self, pool: Weak<PoolShared>) {
        self.shared.set_pool(pool);
    }

    pub(crate) fn settle_idle(&self) {
        self.shared.settle_idle();
    }

    pub(crate) fn from_shared(shared: Arc<MuxShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> ConnectState {
        acquire(&self.shared.inner).state
    }

    pub fn active_channels(&self) -> usize {
        acquire(&self.shared.inner).channels.len()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn bytes_written(&self) -> u64 {
        acquire(&self.shared.inner).bytes_written
    }
}
