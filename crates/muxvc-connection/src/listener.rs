//! Listener for inbound multiplexed connections

use crate::channel::Channel;
use crate::config::MuxConfig;
use crate::error::MuxResult;
use crate::multiplexer::Multiplexer;
use muxvc_transport::{TransportError, TransportListener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Accepts transport connections and yields the channels peers open on them
#[derive(Debug)]
pub struct MuxListener {
    local_addr: SocketAddr,
    incoming: mpsc::UnboundedReceiver<Channel>,
    accept_task: AbortHandle,
}

impl MuxListener {
    /// Start accepting on `listener`; must be called from within a tokio runtime
    pub fn new<L>(listener: L, config: MuxConfig) -> MuxResult<Self>
    where
        L: TransportListener + 'static,
    {
        config.validate()?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Handle::current();
        let accept_task = runtime
            .spawn(accept_loop(listener, Arc::new(config), runtime.clone(), tx))
            .abort_handle();

        info!("Accepting multiplexed connections on {}", local_addr);

        Ok(Self {
            local_addr,
            incoming: rx,
            accept_task,
        })
    }

    /// Next channel opened by any peer
    ///
    /// Returns `None` once the underlying listener has closed.
    pub async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for MuxListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop<L: TransportListener>(
    listener: L,
    config: Arc<MuxConfig>,
    runtime: Handle,
    acceptor: mpsc::UnboundedSender<Channel>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let mux = Multiplexer::serve(stream, config.clone(), runtime.clone(), acceptor.clone());
                debug!("[{}] Accepted connection from {}", mux.id(), peer);
            }
            Err(TransportError::ListenerClosed) => {
                debug!("Listener closed");
                break;
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(config.lock_retry).await;
            }
        }

        if acceptor.is_closed() {
            break;
        }
    }
}
