//! muxvc - multiplexed virtual connections over TCP
//!
//! Runs an echo service that accepts multiplexed channels, or sends
//! messages to one over a shared pooled connection.

use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use muxvc_connection::{Channel, ConnectionPool, IoEvent, MuxConfig, MuxListener, Vio};
use muxvc_transport::{TcpConnector, TcpTransportListener};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const READ_SIZE: usize = 16 * 1024;

/// muxvc - many byte streams over one connection
#[derive(Parser, Debug)]
#[command(name = "muxvc")]
#[command(about = "Multiplexed virtual connections over TCP")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Seconds an unused connection stays open
    #[arg(long, global = true, env = "MUXVC_IDLE_TIMEOUT", default_value = "60")]
    idle_timeout: u64,

    /// Milliseconds before a contended operation is retried
    #[arg(long, global = true, env = "MUXVC_LOCK_RETRY_MS", default_value = "10")]
    lock_retry_ms: u64,

    /// Channels per connection before another connection is opened
    #[arg(long, global = true, env = "MUXVC_MAX_CHANNELS")]
    max_channels: Option<usize>,

    /// Pause the peer when a channel buffers more than --max-byte-bank bytes
    #[arg(long, global = true, env = "MUXVC_FLOW_CONTROL")]
    flow_control: bool,

    /// Bytes buffered per channel before flow control applies
    #[arg(long, global = true, env = "MUXVC_MAX_BYTE_BANK", default_value = "32768")]
    max_byte_bank: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept multiplexed channels and echo back what they receive
    #[command(long_about = r#"
Accept multiplexed connections and echo every byte received on each
channel back to the peer.

EXAMPLES:
  muxvc listen --bind 0.0.0.0:9444

ENVIRONMENT VARIABLES:
  MUXVC_BIND             Address to listen on
  MUXVC_IDLE_TIMEOUT     Seconds an unused connection stays open
  MUXVC_LOCK_RETRY_MS    Retry delay for contended operations
  MUXVC_FLOW_CONTROL     Enable flow control
  MUXVC_MAX_BYTE_BANK    Per-channel buffer before flow control applies
    "#)]
    Listen {
        /// Address to listen on
        #[arg(long, env = "MUXVC_BIND", default_value = "127.0.0.1:9444")]
        bind: SocketAddr,
    },

    /// Send a message on one or more channels and print the replies
    #[command(long_about = r#"
Open channels to a muxvc peer over a single pooled connection, send the
message on each and print what comes back.

EXAMPLES:
  muxvc send --remote 127.0.0.1:9444 --message hello --channels 4

  # Port 0 uses the default port (9444)
  muxvc send --remote 10.0.0.1:0 --message hello

ENVIRONMENT VARIABLES:
  MUXVC_REMOTE           Peer address
  MUXVC_MAX_CHANNELS     Channels per connection
    "#)]
    Send {
        /// Peer address
        #[arg(long, env = "MUXVC_REMOTE")]
        remote: SocketAddr,

        /// Message to send on each channel
        #[arg(long, default_value = "hello")]
        message: String,

        /// Number of channels to open
        #[arg(long, default_value = "1")]
        channels: usize,
    },
}

impl Cli {
    fn mux_config(&self) -> Result<MuxConfig> {
        let mut config = MuxConfig::default()
            .with_idle_timeout(Duration::from_secs(self.idle_timeout))
            .with_lock_retry(Duration::from_millis(self.lock_retry_ms))
            .with_flow_control(self.flow_control)
            .with_max_byte_bank(self.max_byte_bank);
        if let Some(max) = self.max_channels {
            config = config.with_max_channels(max);
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Write all of `data`, resolving once the channel has taken it
async fn write_all(channel: &Channel, data: BytesMut) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);

    channel.write(data.len(), data, move |event: IoEvent, _vio: &mut Vio, _ch: &Channel| {
        let outcome = match event {
            IoEvent::WriteComplete => Ok(()),
            IoEvent::WriteReady => return,
            other => Err(other),
        };
        if let Some(tx) = tx.take() {
            let _ = tx.send(outcome);
        }
    });

    rx.await
        .context("Channel closed during write")?
        .map_err(|event| anyhow!("Write failed: {:?}", event))
}

/// Read exactly `len` bytes
async fn read_exact(channel: &Channel, len: usize) -> Result<BytesMut> {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);

    channel.read(len, move |event: IoEvent, vio: &mut Vio, _ch: &Channel| {
        let outcome = match event {
            IoEvent::ReadComplete => Ok(vio.buffer.split()),
            IoEvent::ReadReady => return,
            other => Err(other),
        };
        if let Some(tx) = tx.take() {
            let _ = tx.send(outcome);
        }
    });

    rx.await
        .context("Channel closed during read")?
        .map_err(|event| anyhow!("Read failed: {:?}", event))
}

/// Echo every byte received on `channel` until the peer is done
async fn echo(channel: Channel) {
    let (data_tx, mut data_rx) = mpsc::unbounded_channel();

    channel.read(READ_SIZE, move |event: IoEvent, vio: &mut Vio, _ch: &Channel| match event {
        IoEvent::ReadReady | IoEvent::ReadComplete => {
            let _ = data_tx.send(Some(vio.buffer.split()));
            if event == IoEvent::ReadComplete {
                vio.restart(READ_SIZE);
            }
        }
        _ => {
            let _ = data_tx.send(None);
        }
    });

    while let Some(Some(data)) = data_rx.recv().await {
        if let Err(e) = write_all(&channel, data).await {
            debug!("Channel {}: {:#}", channel.id(), e);
            break;
        }
    }

    debug!("Channel {} finished", channel.id());
    channel.close();
}

async fn listen(bind: SocketAddr, config: MuxConfig) -> Result<()> {
    let listener = TcpTransportListener::bind(bind)
        .with_context(|| format!("Failed to bind {}", bind))?;
    let mut listener = MuxListener::new(listener, config).context("Failed to start listener")?;

    info!("Echoing channels on {}", listener.local_addr());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                return Ok(());
            }
            channel = listener.accept() => {
                let Some(channel) = channel else {
                    anyhow::bail!("Listener closed");
                };
                info!("Channel {} opened from {}", channel.id(), channel.remote_addr());
                tokio::spawn(echo(channel));
            }
        }
    }
}

async fn send(remote: SocketAddr, message: String, channels: usize, config: MuxConfig) -> Result<()> {
    let pool = ConnectionPool::new(Arc::new(TcpConnector::new()), config)
        .context("Failed to create connection pool")?;

    let requests = (0..channels).map(|n| {
        let pool = pool.clone();
        let payload = BytesMut::from(message.as_bytes());
        async move {
            let channel = pool
                .get_connection(remote)
                .await
                .with_context(|| format!("Failed to open channel {}", n))?;

            let len = payload.len();
            write_all(&channel, payload).await?;
            let reply = read_exact(&channel, len).await?;

            info!(
                "Channel {} (connection {}): {}",
                channel.id(),
                channel.multiplexer().id(),
                String::from_utf8_lossy(&reply)
            );
            channel.close();
            Ok::<_, anyhow::Error>(())
        }
    });

    try_join_all(requests).await?;
    info!("{} connection(s) used", pool.connection_count());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = cli.mux_config()?;

    let result = match cli.command {
        Commands::Listen { bind } => listen(bind, config).await,
        Commands::Send {
            remote,
            message,
            channels,
        } => {
            if message.is_empty() {
                anyhow::bail!("Message must not be empty");
            }
            send(remote, message, channels, config).await
        }
    };

    if let Err(ref e) = result {
        error!("{:#}", e);
    }
    result
}
