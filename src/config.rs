use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::Semaphore;

use crate::comms::retry_options::RetryOptions;
use crate::session::discovery::DiscoveryOptions;

pub const DEFAULT_PORT: u16 = 56700;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub default_broadcast: SocketAddr,

    /// overall time for one exchange, including all retries
    pub message_timeout: Duration,
    pub connect_timeout: Duration,
    /// discovery time when a send refers to devices that are not known yet
    pub find_timeout: Duration,
    /// discovery time for explicit `find_devices` calls
    pub discovery_timeout: Duration,
    /// max number of exchanges awaiting replies at the same time, per send call
    pub default_limit: usize,

    pub retry_options: RetryOptions,
    /// pacing of the broadcasts during a discovery sweep
    pub discovery_retry_options: RetryOptions,

    pub discovery: DiscoveryOptions,
}

fn discovery_retry_options() -> RetryOptions {
    let mut result = RetryOptions::default();
    result.timeouts = vec![
        (Duration::from_millis(600), Duration::from_millis(1800)),
        (Duration::from_secs(1), Duration::from_secs(4)),
    ];
    result
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::new()
    }
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig {
            default_broadcast: SocketAddr::from(([255, 255, 255, 255], DEFAULT_PORT)),
            message_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            find_timeout: Duration::from_secs(20),
            discovery_timeout: Duration::from_secs(60),
            default_limit: 30,
            retry_options: Default::default(),
            discovery_retry_options: discovery_retry_options(),
            discovery: Default::default(),
        }
    }

    /// a fresh admission gate of `default_limit`
    pub fn limit(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.default_limit))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_limit == 0 {
            bail!("default limit must be positive");
        }
        if self.message_timeout.is_zero() {
            bail!("message timeout must be positive");
        }
        self.retry_options.validate()?;
        self.discovery_retry_options.validate()?;
        Ok(())
    }
}
