//! Virtual connections carried by a multiplexer
//!
//! Public operations only record intent under the direction's consumer lock
//! and schedule a processing pass. The pass runs on the runtime, takes the
//! connection lock and the consumer locks with try-lock, moves bytes, and
//! then calls handlers with no lock held.

use crate::multiplexer::{enqueue_frame, ChannelCtl, MuxInner, MuxShared, Multiplexer};
use crate::retry::{acquire, schedule, try_acquire, TimerSlot};
use crate::state::RemoteClose;
use crate::vio::{IoEvent, IoHandler, IoOp, IoSlot, ShutdownHow, Vio, VioOp};
use bytes::{BytesMut, Bytes};
use muxvc_proto::{ChannelId, MessageType, MAX_PAYLOAD};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct ChannelTimers {
    active: TimerSlot,
    active_after: Option<Duration>,
    inactivity: TimerSlot,
    inactivity_after: Option<Duration>,
}

impl ChannelTimers {
    fn cancel_all(&mut self) {
        self.active.cancel();
        self.inactivity.cancel();
        self.active_after = None;
        self.inactivity_after = None;
    }
}

pub(crate) struct ChannelShared {
    pub id: ChannelId,
    closed: AtomicBool,
    close_deferred: AtomicBool,
    /// Handlers currently running for this channel
    depth: AtomicUsize,
    scheduled: AtomicBool,
    read_shutdown: AtomicBool,
    write_shutdown: AtomicBool,
    pub read: Mutex<IoSlot>,
    pub write: Mutex<IoSlot>,
    timers: Mutex<ChannelTimers>,
}

impl ChannelShared {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            close_deferred: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            scheduled: AtomicBool::new(false),
            read_shutdown: AtomicBool::new(false),
            write_shutdown: AtomicBool::new(false),
            read: Mutex::new(IoSlot::default()),
            write: Mutex::new(IoSlot::default()),
            timers: Mutex::new(ChannelTimers::default()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn read_shut_down(&self) -> bool {
        self.read_shutdown.load(Ordering::SeqCst)
    }

    fn slot(&self, op: VioOp) -> &Mutex<IoSlot> {
        match op {
            VioOp::Read => &self.read,
            VioOp::Write => &self.write,
        }
    }
}

/// Result of one direction's transfer step
#[derive(Default)]
struct Transfer {
    event: Option<IoEvent>,
    moved: bool,
}

/// Handle on one channel of a multiplexed connection
///
/// Cloning the handle does not create a new channel.
#[derive(Clone)]
pub struct Channel {
    chan: Arc<ChannelShared>,
    mux: Arc<MuxShared>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("mux", &self.mux.id)
            .field("id", &self.chan.id)
            .field("closed", &self.chan.is_closed())
            .finish()
    }
}

impl Channel {
    pub(crate) fn from_parts(chan: Arc<ChannelShared>, mux: Arc<MuxShared>) -> Self {
        Self { chan, mux }
    }

    pub fn id(&self) -> ChannelId {
        self.chan.id
    }

    pub fn multiplexer(&self) -> Multiplexer {
        Multiplexer::from_shared(self.mux.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.mux.peer_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    fn assert_open(&self, operation: &str) {
        assert!(
            !self.chan.is_closed(),
            "{} on closed channel {} of connection {}",
            operation,
            self.chan.id,
            self.mux.id
        );
    }

    /// Read up to `nbytes`, reporting progress to `handler`
    ///
    /// Replaces any outstanding read. Banked bytes are delivered first.
    pub fn read<H: IoHandler>(&self, nbytes: usize, handler: H) {
        self.assert_open("read");
        let op = IoOp {
            vio: Vio::new(VioOp::Read, nbytes, BytesMut::new()),
            handler: Box::new(handler),
        };
        // Bytes the old read received but never reported stay ahead of the bank
        let replaced = acquire(&self.chan.read).replace(op);
        drop(replaced);
        trace!("[{},{}] Read of {} bytes issued", self.mux.id, self.chan.id, nbytes);
        schedule_process(&self.mux, &self.chan, Duration::ZERO);
    }

    /// Write `nbytes` taken from `buffer`, reporting progress to `handler`
    ///
    /// `buffer` may hold fewer than `nbytes`; the handler adds the rest on
    /// [`IoEvent::WriteReady`].
    pub fn write<H: IoHandler>(&self, nbytes: usize, buffer: BytesMut, handler: H) {
        self.assert_open("write");
        let op = IoOp {
            vio: Vio::new(VioOp::Write, nbytes, buffer),
            handler: Box::new(handler),
        };
        acquire(&self.chan.write).install(op);
        trace!("[{},{}] Write of {} bytes issued", self.mux.id, self.chan.id, nbytes);
        schedule_process(&self.mux, &self.chan, Duration::ZERO);
    }

    /// Resume a direction whose descriptor was disabled
    pub fn reenable(&self, op: VioOp) {
        self.assert_open("reenable");
        {
            let mut slot = acquire(self.chan.slot(op));
            match slot.op.as_mut() {
                Some(io) => io.vio.reenable(),
                // Handler running; applied when it returns
                None => slot.reenable_pending = true,
            }
        }
        schedule_process(&self.mux, &self.chan, Duration::ZERO);
    }

    pub fn shutdown(&self, how: ShutdownHow) {
        self.assert_open("shutdown");

        if matches!(how, ShutdownHow::Read | ShutdownHow::Both) {
            self.chan.read_shutdown.store(true, Ordering::SeqCst);
            drop(acquire(&self.chan.read).clear());
        }
        if matches!(how, ShutdownHow::Write | ShutdownHow::Both) {
            self.chan.write_shutdown.store(true, Ordering::SeqCst);
            drop(acquire(&self.chan.write).clear());
        }

        debug!("[{},{}] Shutdown {:?}", self.mux.id, self.chan.id, how);
        schedule_process(&self.mux, &self.chan, Duration::ZERO);
    }

    /// Close the channel; no further events are delivered
    ///
    /// Inside one of this channel's handlers the removal waits until the
    /// handler returns.
    pub fn close(&self) {
        if self.chan.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.chan.close_deferred.store(true, Ordering::SeqCst);
        if self.chan.depth.load(Ordering::SeqCst) > 0 {
            trace!("[{},{}] Close deferred", self.mux.id, self.chan.id);
            return;
        }
        if self.chan.close_deferred.swap(false, Ordering::SeqCst) {
            finish_close(&self.mux, &self.chan);
        }
    }

    /// Mark closed without scheduling removal; the caller removes it
    pub(crate) fn mark_closed(&self) {
        self.chan.closed.store(true, Ordering::SeqCst);
    }

    pub fn set_active_timeout(&self, timeout: Duration) {
        self.assert_open("set_active_timeout");
        let mut timers = acquire(&self.chan.timers);
        timers.active_after = Some(timeout);
        let (mux, chan) = (self.mux.clone(), self.chan.clone());
        timers.active.arm(schedule(&self.mux.runtime, timeout, move || {
            fire_timeout(&mux, &chan, IoEvent::ActiveTimeout)
        }));
    }

    pub fn cancel_active_timeout(&self) {
        let mut timers = acquire(&self.chan.timers);
        timers.active_after = None;
        timers.active.cancel();
    }

    pub fn active_timeout(&self) -> Option<Duration> {
        acquire(&self.chan.timers).active_after
    }

    /// Fire `InactivityTimeout` after `timeout` without a transfer
    pub fn set_inactivity_timeout(&self, timeout: Duration) {
        self.assert_open("set_inactivity_timeout");
        acquire(&self.chan.timers).inactivity_after = Some(timeout);
        rearm_inactivity(&self.mux, &self.chan);
    }

    pub fn cancel_inactivity_timeout(&self) {
        let mut timers = acquire(&self.chan.timers);
        timers.inactivity_after = None;
        timers.inactivity.cancel();
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        acquire(&self.chan.timers).inactivity_after
    }
}

/// Schedule a processing pass unless one is already pending
pub(crate) fn schedule_process(mux: &Arc<MuxShared>, chan: &Arc<ChannelShared>, delay: Duration) {
    if chan.scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    let (m, c) = (mux.clone(), chan.clone());
    schedule(&mux.runtime, delay, move || process(&m, &c));
}

fn process(mux: &Arc<MuxShared>, chan: &Arc<ChannelShared>) {
    chan.scheduled.store(false, Ordering::SeqCst);
    if chan.is_closed() {
        return;
    }

    let mut events: Vec<(VioOp, IoEvent)> = Vec::new();
    let mut moved = false;
    let mut contended = false;

    {
        let Some(mut guard) = try_acquire(&mux.inner) else {
            schedule_process(mux, chan, mux.config.lock_retry);
            return;
        };
        let inner = &mut *guard;
        let can_send = inner.state.can_send();
        let MuxInner {
            channels,
            write_buf,
            writes_blocked,
            ..
        } = inner;

        let Some(entry) = channels.get_mut(&chan.id) else {
            return;
        };
        if !Arc::ptr_eq(&entry.chan, chan) {
            return;
        }
        let ctl = &mut entry.ctl;
        let queued_before = write_buf.len();

        if chan.read_shut_down() {
            ctl.bank.clear();
            ctl.remote.clear(RemoteClose::NEED_READ_NOTIFY);
        } else {
            match try_acquire(&chan.read) {
                Some(mut slot) => {
                    let step = transfer_read(mux, chan.id, ctl, &mut slot, write_buf, can_send);
                    moved |= step.moved;
                    if let Some(event) = step.event {
                        events.push((VioOp::Read, event));
                    }
                }
                None => contended = true,
            }
        }

        match try_acquire(&chan.write) {
            Some(mut slot) => {
                let step = transfer_write(mux, chan.id, ctl, &mut slot, write_buf, writes_blocked, can_send);
                moved |= step.moved;
                if let Some(event) = step.event {
                    events.push((VioOp::Write, event));
                }
            }
            None => contended = true,
        }

        if chan.write_shutdown.load(Ordering::SeqCst)
            && !ctl.shutdown_sent
            && can_send
            && !ctl.remote.outbound_closed()
        {
            ctl.shutdown_sent = true;
            enqueue_frame(write_buf, MessageType::ShutdownWrite, chan.id, &[]);
        }

        if write_buf.len() > queued_before {
            mux.wake_writer();
        }
    }

    if moved {
        rearm_inactivity(mux, chan);
    }

    let delivered = !events.is_empty();
    for (op, event) in events {
        if chan.is_closed() {
            break;
        }
        dispatch(mux, chan, op, event);
    }

    if contended {
        schedule_process(mux, chan, mux.config.lock_retry);
    } else if delivered && !chan.is_closed() {
        // Handlers may have re-enabled or left more work
        schedule_process(mux, chan, Duration::ZERO);
    }
}

/// Move banked bytes into the read descriptor and pick the event to report
fn transfer_read(
    mux: &MuxShared,
    id: ChannelId,
    ctl: &mut ChannelCtl,
    slot: &mut IoSlot,
    write_buf: &mut BytesMut,
    can_send: bool,
) -> Transfer {
    let mut step = Transfer::default();
    let IoSlot { op, unread, .. } = slot;
    let Some(io) = op.as_mut() else {
        return step;
    };
    let vio = &mut io.vio;

    if vio.is_enabled() {
        while vio.ntodo() > 0 {
            let want = vio.ntodo();
            let Some(chunk) = unread.take(want).or_else(|| ctl.bank.take(want)) else {
                break;
            };
            vio.buffer.extend_from_slice(&chunk);
            vio.record(chunk.len());
        }
    }

    if ctl.read_flow_stopped && ctl.bank.is_empty() && can_send {
        ctl.read_flow_stopped = false;
        debug!("[{},{}] Byte bank drained, resuming peer", mux.id, id);
        enqueue_frame(write_buf, MessageType::FlowControlStop, id, &[]);
    }

    if vio.take_unreported() > 0 {
        step.moved = true;
        step.event = Some(if vio.ntodo() == 0 {
            IoEvent::ReadComplete
        } else {
            IoEvent::ReadReady
        });
        return step;
    }

    if vio.is_enabled()
        && unread.is_empty()
        && ctl.bank.is_empty()
        && ctl.remote.has(RemoteClose::NEED_READ_NOTIFY) {
        ctl.remote.clear(RemoteClose::NEED_READ_NOTIFY);
        step.event = Some(IoEvent::Eos);
    }
    step
}

/// Frame bytes from the write descriptor onto the connection
fn transfer_write(
    mux: &MuxShared,
    id: ChannelId,
    ctl: &mut ChannelCtl,
    slot: &mut IoSlot,
    write_buf: &mut BytesMut,
    writes_blocked: &mut bool,
    can_send: bool,
) -> Transfer {
    let mut step = Transfer::default();
    let Some(io) = slot.op.as_mut() else {
        return step;
    };
    let vio = &mut io.vio;

    if ctl.remote.has(RemoteClose::NEED_WRITE_NOTIFY) {
        if vio.is_enabled() {
            ctl.remote.clear(RemoteClose::NEED_WRITE_NOTIFY);
            step.event = Some(IoEvent::Error);
        }
        return step;
    }

    if !vio.wants_transfer()
        || !can_send
        || ctl.remote.outbound_closed()
        || ctl.write_flow_stopped
        || *writes_blocked
    {
        return step;
    }

    let room = mux.config.write_high_water.saturating_sub(write_buf.len());
    let n = vio.ntodo().min(vio.buffer.len()).min(room);
    if n == 0 {
        if room == 0 {
            *writes_blocked = true;
        }
        return step;
    }

    let data: Bytes = vio.buffer.split_to(n).freeze();
    for piece in data.chunks(MAX_PAYLOAD) {
        enqueue_frame(write_buf, MessageType::NormalData, id, piece);
    }
    vio.record(n);
    vio.take_unreported();
    step.moved = true;

    if write_buf.len() >= mux.config.write_high_water {
        *writes_blocked = true;
        debug!(
            "[{}] Write backlog at {} bytes, pausing channel writes",
            mux.id,
            write_buf.len()
        );
    }

    if vio.ntodo() == 0 {
        step.event = Some(IoEvent::WriteComplete);
    } else if vio.buffer.is_empty() {
        step.event = Some(IoEvent::WriteReady);
    }
    step
}

/// Run the handler for `op` with no lock held
fn dispatch(mux: &Arc<MuxShared>, chan: &Arc<ChannelShared>, op: VioOp, event: IoEvent) {
    let slot_lock = chan.slot(op);
    let Some((mut io, generation)) = acquire(slot_lock).take() else {
        return;
    };

    let channel = Channel::from_parts(chan.clone(), mux.clone());
    trace!("[{},{}] {:?} -> {:?}", mux.id, chan.id, op, event);

    // A close racing with this dispatch either sees the depth and defers,
    // or is seen here
    chan.depth.fetch_add(1, Ordering::SeqCst);
    if !chan.is_closed() {
        io.handler.handle_event(event, &mut io.vio, &channel);
    }
    let remaining = chan.depth.fetch_sub(1, Ordering::SeqCst) - 1;

    if chan.is_closed() {
        drop(io);
    } else {
        let mut slot = acquire(slot_lock);
        if !slot.restore(io, generation) {
            trace!("[{},{}] {:?} replaced during callback", mux.id, chan.id, op);
        }
    }

    if remaining == 0 && chan.close_deferred.swap(false, Ordering::SeqCst) {
        finish_close(mux, chan);
    }
}

/// Remove a closed channel from its connection and release its state
pub(crate) fn finish_close(mux: &Arc<MuxShared>, chan: &Arc<ChannelShared>) {
    {
        let Some(mut guard) = try_acquire(&mux.inner) else {
            let (m, c) = (mux.clone(), chan.clone());
            schedule(&mux.runtime, mux.config.lock_retry, move || finish_close(&m, &c));
            return;
        };
        let current = guard
            .channels
            .get(&chan.id)
            .is_some_and(|e| Arc::ptr_eq(&e.chan, chan));
        if current {
            mux.remove_channel(&mut guard, chan.id);
        }
    }

    debug!("[{},{}] Channel closed", mux.id, chan.id);

    // Handlers may hold channel handles; drop them outside the locks
    let read = acquire(&chan.read).clear();
    let write = acquire(&chan.write).clear();
    drop(read);
    drop(write);
    acquire(&chan.timers).cancel_all();
}

fn rearm_inactivity(mux: &Arc<MuxShared>, chan: &Arc<ChannelShared>) {
    let mut timers = acquire(&chan.timers);
    if let Some(after) = timers.inactivity_after {
        let (m, c) = (mux.clone(), chan.clone());
        timers.inactivity.arm(schedule(&mux.runtime, after, move || {
            fire_timeout(&m, &c, IoEvent::InactivityTimeout)
        }));
    }
}

/// Report a timeout to the outstanding read, else the outstanding write
fn fire_timeout(mux: &Arc<MuxShared>, chan: &Arc<ChannelShared>, event: IoEvent) {
    if chan.is_closed() {
        return;
    }
    if event == IoEvent::ActiveTimeout {
        acquire(&chan.timers).active_after = None;
    }

    let enabled = |lock: &Mutex<IoSlot>| {
        acquire(lock)
            .op
            .as_ref()
            .is_some_and(|io| io.vio.is_enabled())
    };
    let op = if enabled(&chan.read) {
        VioOp::Read
    } else if enabled(&chan.write) {
        VioOp::Write
    } else {
        debug!("[{},{}] {:?} with no operation outstanding", mux.id, chan.id, event);
        return;
    };

    dispatch(mux, chan, op, event);
    schedule_process(mux, chan, Duration::ZERO);
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxvc_transport::{MemoryNetwork, TransportListener};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_no_handler_runs_once_closed() {
        let network = MemoryNetwork::new();
        let remote: SocketAddr = "10.3.0.1:9444".parse().unwrap();
        let listener = network.bind(remote).unwrap();
        let mux = Multiplexer::client(remote, crate::MuxConfig::default());
        mux.connect(&network.connector()).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();
        let channel = mux.open_channel().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        channel.read(10, move |_: IoEvent, _: &mut Vio, _: &Channel| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Closed by another task after the processing pass picked the event
        channel.chan.closed.store(true, Ordering::SeqCst);
        dispatch(&channel.mux, &channel.chan, VioOp::Read, IoEvent::ReadReady);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(acquire(&channel.chan.read).op.is_none());
    }
}
