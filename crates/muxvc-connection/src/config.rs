//! Multiplexer configuration

use crate::error::{MuxError, MuxResult};
use muxvc_proto::MAX_PAYLOAD;
use std::time::Duration;

/// Default port applied to requests that carry port 0
pub const DEFAULT_PORT: u16 = 9444;

/// Channel cap used by [`MuxConfig::with_default_channel_limit`]
pub const DEFAULT_CHANNEL_LIMIT: usize = 10;

/// Settings shared by every multiplexer created from one pool or listener
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Delay before a task that lost a try-lock runs again
    pub lock_retry: Duration,

    /// How long a connection with no channels lingers before teardown
    pub idle_timeout: Duration,

    /// Bound on the transport connect call
    pub connect_timeout: Duration,

    /// Bound on the post-connect readiness check
    pub ready_timeout: Duration,

    /// Drop the connection when nothing is read for this long
    pub transport_inactivity_timeout: Option<Duration>,

    /// Banked bytes per channel before flow control kicks in
    pub max_byte_bank: usize,

    /// Queued outbound bytes at which channel writes pause
    pub write_high_water: usize,

    /// Size of each transport read
    pub read_chunk_size: usize,

    /// Channels allowed on one connection before the pool opens another
    pub max_channels_per_connection: Option<usize>,

    pub default_port: u16,

    /// Send FLOW_CONTROL_START/STOP when a channel's bank overflows
    pub flow_control: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            lock_retry: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(30),
            transport_inactivity_timeout: None,
            max_byte_bank: 32 * 1024,
            write_high_water: 128 * 1024,
            read_chunk_size: 32 * 1024,
            max_channels_per_connection: None,
            default_port: DEFAULT_PORT,
            flow_control: false,
        }
    }
}

impl MuxConfig {
    pub fn with_lock_retry(mut self, retry: Duration) -> Self {
        self.lock_retry = retry;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_transport_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.transport_inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_max_byte_bank(mut self, bytes: usize) -> Self {
        self.max_byte_bank = bytes;
        self
    }

    pub fn with_write_high_water(mut self, bytes: usize) -> Self {
        self.write_high_water = bytes;
        self
    }

    pub fn with_read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes;
        self
    }

    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels_per_connection = Some(max);
        self
    }

    pub fn with_default_channel_limit(self) -> Self {
        self.with_max_channels(DEFAULT_CHANNEL_LIMIT)
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn with_flow_control(mut self, enabled: bool) -> Self {
        self.flow_control = enabled;
        self
    }

    pub fn validate(&self) -> MuxResult<()> {
        if self.lock_retry.is_zero() {
            return Err(MuxError::InvalidConfig(
                "lock_retry must be non-zero".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(MuxError::InvalidConfig(
                "idle_timeout must be non-zero".to_string(),
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(MuxError::InvalidConfig(
                "read_chunk_size must be non-zero".to_string(),
            ));
        }
        if self.write_high_water < MAX_PAYLOAD {
            return Err(MuxError::InvalidConfig(format!(
                "write_high_water must hold at least one full frame ({} bytes)",
                MAX_PAYLOAD
            )));
        }
        if self.max_channels_per_connection == Some(0) {
            return Err(MuxError::InvalidConfig(
                "max_channels_per_connection must be non-zero".to_string(),
            ));
        }
        if self.default_port == 0 {
            return Err(MuxError::InvalidConfig(
                "default_port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MuxConfig::default();
        assert_eq!(config.lock_retry, Duration::from_millis(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
        assert_eq!(config.max_byte_bank, 32768);
        assert_eq!(config.write_high_water, 128 * 1024);
        assert_eq!(config.default_port, 9444);
        assert!(config.max_channels_per_connection.is_none());
        assert!(!config.flow_control);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = MuxConfig::default()
            .with_idle_timeout(Duration::from_secs(5))
            .with_default_channel_limit()
            .with_flow_control(true);

        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.max_channels_per_connection, Some(10));
        assert!(config.flow_control);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(MuxConfig::default()
            .with_lock_retry(Duration::ZERO)
            .validate()
            .is_err());
        assert!(MuxConfig::default()
            .with_write_high_water(1024)
            .validate()
            .is_err());
        assert!(MuxConfig::default().with_max_channels(0).validate().is_err());
        assert!(MuxConfig::default().with_default_port(0).validate().is_err());
    }
}
