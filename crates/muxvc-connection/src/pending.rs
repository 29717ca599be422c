//! Pending-connect helper
//!
//! Each `get_connection` request gets a helper that looks for a usable
//! connection with non-blocking lock attempts, retries after `lock_retry`
//! on contention, and otherwise starts (or joins) the one outbound connect
//! for that address.

use crate::channel::Channel;
use crate::error::{MuxError, MuxResult};
use crate::multiplexer::Multiplexer;
use crate::pool::{Found, PoolShared};
use crate::retry::{schedule, try_acquire};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub(crate) type Waiter = oneshot::Sender<MuxResult<Channel>>;

/// A channel request that has not completed yet
///
/// Resolves to the channel, or to the connect failure. Dropping it or
/// calling [`PendingConnect::cancel`] abandons the request; a channel that
/// was created for it anyway is closed.
#[derive(Debug)]
pub struct PendingConnect {
    rx: oneshot::Receiver<MuxResult<Channel>>,
}

impl PendingConnect {
    pub(crate) fn new(rx: oneshot::Receiver<MuxResult<Channel>>) -> Self {
        Self { rx }
    }

    pub fn cancel(&mut self) {
        self.rx.close();
        if let Ok(Ok(channel)) = self.rx.try_recv() {
            channel.close();
        }
    }
}

impl Future for PendingConnect {
    type Output = MuxResult<Channel>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MuxError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Hand `channel` to `waiter`, closing it if nobody is listening
pub(crate) fn deliver(waiter: Waiter, channel: Channel) {
    if let Err(Ok(channel)) = waiter.send(Ok(channel)) {
        debug!("Requester went away, closing channel {}", channel.id());
        channel.close();
    }
}

pub(crate) struct ConnectHelper {
    pool: Arc<PoolShared>,
    addr: SocketAddr,
    waiter: Waiter,
}

impl ConnectHelper {
    pub fn new(pool: Arc<PoolShared>, addr: SocketAddr, waiter: Waiter) -> Self {
        Self { pool, addr, waiter }
    }

    pub fn start(self) {
        self.run_after(Duration::ZERO);
    }

    fn run_after(self, delay: Duration) {
        let runtime = self.pool.runtime.clone();
        schedule(&runtime, delay, move || self.attempt());
    }

    fn attempt(self) {
        if self.waiter.is_closed() {
            trace!("Request for {} cancelled", self.addr);
            return;
        }

        let pool = self.pool.clone();
        let Some(mut registry) = try_acquire(&pool.registry) else {
            let delay = pool.config.lock_retry;
            return self.run_after(delay);
        };

        match registry.find(self.addr) {
            Found::Channel(channel) => {
                drop(registry);
                deliver(self.waiter, channel);
            }
            Found::Busy => {
                drop(registry);
                let delay = pool.config.lock_retry;
                self.run_after(delay);
            }
            Found::Nothing => {
                if let Some(waiters) = registry.connecting.get_mut(&self.addr) {
                    trace!("Joining connect in flight to {}", self.addr);
                    waiters.push(self.waiter);
                    return;
                }

                registry.connecting.insert(self.addr, vec![self.waiter]);
                drop(registry);

                debug!("No usable connection to {}, connecting", self.addr);
                pool.runtime
                    .spawn(connect_and_serve(pool.clone(), self.addr));
            }
        }
    }
}

/// Drive the single outbound connect for `addr` and serve its waiters
async fn connect_and_serve(pool: Arc<PoolShared>, addr: SocketAddr) {
    let mux = Multiplexer::client_with(addr, pool.config.clone(), pool.runtime.clone());
    let result = mux.connect(pool.connector.as_ref()).await;

    let waiters = loop {
        if let Some(mut registry) = try_acquire(&pool.registry) {
            let waiters = registry.connecting.remove(&addr).unwrap_or_default();
            if result.is_ok() {
                registry.muxes.entry(addr).or_default().push(mux.clone());
            }
            break waiters;
        }
        tokio::time::sleep(pool.config.lock_retry).await;
    };

    match result {
        Err(e) => {
            let reason = match e {
                MuxError::ConnectFailed { reason, .. } => reason,
                other => other.to_string(),
            };
            for waiter in waiters {
                let _ = waiter.send(Err(MuxError::ConnectFailed {
                    addr,
                    reason: reason.clone(),
                }));
            }
        }
        Ok(()) => {
            mux.set_pool(Arc::downgrade(&pool));

            for waiter in waiters {
                if waiter.is_closed() {
                    continue;
                }
                match mux.open_channel().await {
                    Ok(channel) => deliver(waiter, channel),
                    Err(MuxError::ChannelLimit(_)) => {
                        ConnectHelper::new(pool.clone(), addr, waiter).start();
                    }
                    Err(e) => {
                        let _ = waiter.send(Err(e));
                    }
                }
            }

            // Every requester may have gone away
            mux.settle_idle();
        }
    }
}
