//! Connection pool keyed by remote address

use crate::channel::Channel;
use crate::config::MuxConfig;
use crate::error::MuxResult;
use crate::multiplexer::{ChannelLookup, Multiplexer};
use crate::pending::{ConnectHelper, PendingConnect, Waiter};
use crate::retry::{acquire, schedule, try_acquire};
use muxvc_transport::TransportConnector;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub(crate) enum Found {
    Channel(Channel),
    /// A candidate connection was locked elsewhere
    Busy,
    Nothing,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub muxes: HashMap<SocketAddr, Vec<Multiplexer>>,
    /// Requests waiting on a connect in flight
    pub connecting: HashMap<SocketAddr, Vec<Waiter>>,
}

impl Registry {
    /// Create a channel on any reusable connection to `addr`
    pub fn find(&self, addr: SocketAddr) -> Found {
        let Some(muxes) = self.muxes.get(&addr) else {
            return Found::Nothing;
        };

        let mut busy = false;
        for mux in muxes {
            match mux.try_new_channel() {
                ChannelLookup::Created(channel) => return Found::Channel(channel),
                ChannelLookup::Busy => busy = true,
                ChannelLookup::Unusable(e) => {
                    trace!("[{}] Skipping connection: {}", mux.id(), e)
                }
            }
        }

        if busy {
            Found::Busy
        } else {
            Found::Nothing
        }
    }
}

pub(crate) struct PoolShared {
    pub config: Arc<MuxConfig>,
    pub connector: Arc<dyn TransportConnector>,
    pub runtime: Handle,
    pub registry: Mutex<Registry>,
}

impl PoolShared {
    /// Drop a terminated connection from the registry
    pub fn forget(self: &Arc<Self>, mux_id: u64, addr: SocketAddr) {
        let Some(mut registry) = try_acquire(&self.registry) else {
            let pool = self.clone();
            schedule(&self.runtime, self.config.lock_retry, move || {
                pool.forget(mux_id, addr)
            });
            return;
        };

        if let Some(muxes) = registry.muxes.get_mut(&addr) {
            muxes.retain(|m| m.id() != mux_id);
            if muxes.is_empty() {
                registry.muxes.remove(&addr);
            }
        }
        debug!("[{}] Removed from pool", mux_id);
    }
}

/// Finds or creates multiplexed connections and hands out channels
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connector", &self.shared.connector)
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool; must be called from within a tokio runtime
    pub fn new(connector: Arc<dyn TransportConnector>, config: MuxConfig) -> MuxResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config: Arc::new(config),
                connector,
                runtime: Handle::current(),
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    /// Request a channel to `addr`
    ///
    /// Port 0 is replaced by the configured default port.
    pub fn get_connection(&self, addr: SocketAddr) -> PendingConnect {
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), self.shared.config.default_port)
        } else {
            addr
        };

        let (tx, rx) = oneshot::channel();
        ConnectHelper::new(self.shared.clone(), addr, tx).start();
        PendingConnect::new(rx)
    }

    /// Registered connections to `addr`
    pub fn connections(&self, addr: SocketAddr) -> Vec<Multiplexer> {
        acquire(&self.shared.registry)
            .muxes
            .get(&addr)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        acquire(&self.shared.registry)
            .muxes
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }
}
