use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::operational_modes::OperationalModes;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Where the control channel listens; subscribers connect here.
    pub bind_addr: SocketAddr,

    /// When set, commands other than `DefineOperationalModes` and `Authenticate` are rejected
    ///  with a Failed response until the connection has authenticated.
    pub require_authentication: bool,

    /// When set, data-packet payloads are AES encrypted with the rotating per-connection keys.
    ///  Requires authentication since keys are only issued to authenticated connections.
    pub encrypt_payload: bool,

    /// A publisher may refuse remotely synchronized subscriptions, forcing subscribers into
    ///  the local-synchronization fallback.
    pub allow_synchronized_subscription: bool,

    /// Whether subscriptions may use base-time offsets for reduced-width compact timestamps.
    pub use_base_time_offsets: bool,

    pub cipher_key_rotation_period: Duration,

    /// Delay before the accept loop is resurrected after stopping unexpectedly.
    pub restart_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> PublisherConfig {
        PublisherConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::commands::DEFAULT_PORT)),
            require_authentication: false,
            encrypt_payload: false,
            allow_synchronized_subscription: true,
            use_base_time_offsets: true,
            cipher_key_rotation_period: Duration::from_millis(60_000),
            restart_delay: Duration::from_millis(2_000),
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cipher_key_rotation_period.is_zero() {
            bail!("cipher key rotation period must not be zero");
        }
        if self.restart_delay.is_zero() {
            bail!("restart delay must not be zero");
        }
        if self.encrypt_payload && !self.require_authentication {
            bail!("payload encryption requires authentication");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// The publisher's control-channel address.
    pub server_addr: SocketAddr,

    pub operational_modes: OperationalModes,

    /// Credentials for the `Authenticate` command; `None` skips authentication and goes
    ///  straight to subscribing after connect.
    pub credentials: Option<String>,

    /// The watchdog restarts the connect cycle when zero bytes arrive across this interval
    ///  while subscribed.
    pub data_loss_interval: Duration,

    /// Delay between the end of a broken connect cycle and the next attempt.
    pub reconnect_delay: Duration,

    /// Interval for repeating the missing-signal-index-cache warning while compact packets
    ///  must be skipped.
    pub missing_cache_warning_interval: Duration,
}

impl SubscriberConfig {
    pub fn new(server_addr: SocketAddr) -> SubscriberConfig {
        SubscriberConfig {
            server_addr,
            operational_modes: OperationalModes::default(),
            credentials: None,
            data_loss_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            missing_cache_warning_interval: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.operational_modes.validate()?;
        if self.data_loss_interval.is_zero() {
            bail!("data loss interval must not be zero");
        }
        if self.reconnect_delay.is_zero() {
            bail!("reconnect delay must not be zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_defaults_are_valid() {
        let config = PublisherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr.port(), 6165);
        assert_eq!(config.cipher_key_rotation_period, Duration::from_millis(60_000));
    }

    #[test]
    fn test_publisher_encryption_requires_authentication() {
        let config = PublisherConfig {
            encrypt_payload: true,
            require_authentication: false,
            ..PublisherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_subscriber_defaults_are_valid() {
        let config = SubscriberConfig::new("127.0.0.1:6165".parse().unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_subscriber_zero_data_loss_interval_rejected() {
        let mut config = SubscriberConfig::new("127.0.0.1:6165".parse().unwrap());
        config.data_loss_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
