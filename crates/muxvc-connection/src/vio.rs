//! I/O descriptors and the consumer callback interface
//!
//! A channel carries one [`Vio`] per direction. The consumer issues an
//! operation with [`crate::Channel::read`] or [`crate::Channel::write`] and
//! is told about progress through its [`IoHandler`]. While a handler runs it
//! owns the descriptor and may adjust it in place (take received bytes, add
//! bytes to send, `reenable`, `restart`).

use crate::bank::ByteBank;
use crate::channel::Channel;
use bytes::{Bytes, BytesMut};

/// Events reported to an [`IoHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// Bytes were added to the read buffer; more are expected
    ReadReady,
    /// The read reached its byte target
    ReadComplete,
    /// Bytes were sent and the write buffer is empty; add more to continue
    WriteReady,
    /// The write reached its byte target
    WriteComplete,
    /// The peer will send nothing more
    Eos,
    /// The channel can no longer carry data in this direction
    Error,
    ActiveTimeout,
    InactivityTimeout,
}

/// Direction of an I/O descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioOp {
    Read,
    Write,
}

/// Which half of a channel to shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// One outstanding read or write
#[derive(Debug)]
pub struct Vio {
    op: VioOp,
    nbytes: usize,
    ndone: usize,
    enabled: bool,
    /// Bytes moved since the handler last heard about it
    unreported: usize,
    /// Received bytes (reads) or bytes still to send (writes)
    pub buffer: BytesMut,
}

impl Vio {
    pub(crate) fn new(op: VioOp, nbytes: usize, buffer: BytesMut) -> Self {
        Self {
            op,
            nbytes,
            ndone: 0,
            enabled: nbytes > 0,
            unreported: 0,
            buffer,
        }
    }

    pub fn op(&self) -> VioOp {
        self.op
    }

    /// Target byte count
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn ndone(&self) -> usize {
        self.ndone
    }

    pub fn ntodo(&self) -> usize {
        self.nbytes.saturating_sub(self.ndone)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn reenable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn set_nbytes(&mut self, nbytes: usize) {
        self.nbytes = nbytes;
    }

    /// Start over with a new target, keeping the buffer
    pub fn restart(&mut self, nbytes: usize) {
        self.nbytes = nbytes;
        self.ndone = 0;
        self.unreported = 0;
        self.enabled = nbytes > 0;
    }

    pub(crate) fn record(&mut self, n: usize) {
        self.ndone += n;
        self.unreported += n;
    }

    pub(crate) fn take_unreported(&mut self) -> usize {
        std::mem::take(&mut self.unreported)
    }

    /// Split off the received bytes the handler has not been told about
    pub(crate) fn take_undelivered(&mut self) -> Bytes {
        let n = std::mem::take(&mut self.unreported).min(self.buffer.len());
        self.ndone -= n;
        self.buffer.split_off(self.buffer.len() - n).freeze()
    }

    /// Whether the transfer loop has anything to do here
    pub(crate) fn wants_transfer(&self) -> bool {
        self.enabled && self.ntodo() > 0
    }
}

/// Receives progress events for one channel direction
///
/// Handlers run on runtime worker threads with no multiplexer lock held, so
/// they may call any [`Channel`] operation, including `close`.
pub trait IoHandler: Send + 'static {
    fn handle_event(&mut self, event: IoEvent, vio: &mut Vio, channel: &Channel);
}

impl<F> IoHandler for F
where
    F: FnMut(IoEvent, &mut Vio, &Channel) + Send + 'static,
{
    fn handle_event(&mut self, event: IoEvent, vio: &mut Vio, channel: &Channel) {
        self(event, vio, channel)
    }
}

/// An issued operation and the handler that owns it
pub(crate) struct IoOp {
    pub vio: Vio,
    pub handler: Box<dyn IoHandler>,
}

/// Consumer-side state for one direction, guarded by that direction's lock
///
/// While a handler runs the op is taken out of the slot; data arriving in
/// the meantime is banked.
#[derive(Default)]
pub(crate) struct IoSlot {
    pub op: Option<IoOp>,
    /// Bumped each time a new op is installed
    pub generation: u64,
    pub reenable_pending: bool,
    /// Received by a replaced read but never reported; delivered before
    /// the byte bank
    pub unread: ByteBank,
}

impl IoSlot {
    pub fn install(&mut self, op: IoOp) {
        self.generation += 1;
        self.reenable_pending = false;
        self.op = Some(op);
    }

    /// Install `op` over the current one, keeping what the old read received
    pub fn replace(&mut self, op: IoOp) -> Option<IoOp> {
        let mut old = self.op.take();
        if let Some(io) = old.as_mut() {
            self.unread.push_front(io.vio.take_undelivered());
        }
        self.install(op);
        old
    }

    pub fn take(&mut self) -> Option<(IoOp, u64)> {
        self.op.take().map(|op| (op, self.generation))
    }

    /// Put an op back after its handler ran
    ///
    /// Returns false if a newer op was installed in the meantime.
    pub fn restore(&mut self, mut op: IoOp, generation: u64) -> bool {
        if self.generation != generation || self.op.is_some() {
            return false;
        }
        if std::mem::take(&mut self.reenable_pending) {
            op.vio.reenable();
        }
        self.op = Some(op);
        true
    }

    /// Drop the op for good; a handler running right now will not restore it
    pub fn clear(&mut self) -> Option<IoOp> {
        self.generation += 1;
        self.reenable_pending = false;
        self.unread.clear();
        self.op.take()
    }
}
