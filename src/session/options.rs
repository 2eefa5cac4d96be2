use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::comms::transport::Transport;
use crate::config::{SessionConfig, DEFAULT_PORT};
use crate::errors::TransportError;

/// Where per-target errors of a send go instead of failing the whole call
#[derive(Clone)]
pub enum ErrorCatcher {
    Callback(Arc<dyn Fn(TransportError) + Send + Sync>),
    Collect(Arc<Mutex<Vec<TransportError>>>),
}

impl ErrorCatcher {
    pub fn callback(f: impl Fn(TransportError) + Send + Sync + 'static) -> ErrorCatcher {
        ErrorCatcher::Callback(Arc::new(f))
    }

    /// returns the catcher and the list it collects into
    pub fn collect() -> (ErrorCatcher, Arc<Mutex<Vec<TransportError>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        (ErrorCatcher::Collect(errors.clone()), errors)
    }

    pub fn add_error(&self, error: TransportError) {
        match self {
            ErrorCatcher::Callback(f) => f(error),
            ErrorCatcher::Collect(errors) => match errors.lock() {
                Ok(mut errors) => errors.push(error),
                Err(poisoned) => poisoned.into_inner().push(error),
            },
        }
    }
}

impl Debug for ErrorCatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCatcher::Callback(_) => write!(f, "ErrorCatcher::Callback"),
            ErrorCatcher::Collect(_) => write!(f, "ErrorCatcher::Collect"),
        }
    }
}

/// Broadcast address to send to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcast {
    /// the session's configured broadcast address
    Default,
    Address(SocketAddr),
}

impl Broadcast {
    pub fn resolve(&self, config: &SessionConfig) -> SocketAddr {
        match self {
            Broadcast::Default => config.default_broadcast,
            Broadcast::Address(addr) => *addr,
        }
    }
}

impl FromStr for Broadcast {
    type Err = TransportError;

    /// `host` (with the default port) or `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(Broadcast::Address(addr));
        }
        match IpAddr::from_str(s) {
            Ok(ip) => Ok(Broadcast::Address(SocketAddr::new(ip, DEFAULT_PORT))),
            Err(_) => Err(TransportError::InvalidBroadcast(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub timeout: Duration,
    pub limit: Option<Arc<Semaphore>>,
    pub no_retry: bool,
    pub transport: Option<Arc<dyn Transport>>,
    pub broadcast: Option<Broadcast>,
    pub connect_timeout: Duration,
    pub error_catcher: Option<ErrorCatcher>,
    pub allow_zero: bool,
    /// discovery time for target devices that are not known yet, no discovery if `None`
    pub find_timeout: Option<Duration>,
}

impl SendOptions {
    pub fn new(config: &SessionConfig) -> SendOptions {
        SendOptions {
            timeout: config.message_timeout,
            limit: Some(config.limit()),
            no_retry: false,
            transport: None,
            broadcast: None,
            connect_timeout: config.connect_timeout,
            error_catcher: None,
            allow_zero: false,
            find_timeout: Some(config.find_timeout),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> SendOptions {
        self.timeout = timeout;
        self
    }

    pub fn with_limit(mut self, limit: Option<Arc<Semaphore>>) -> SendOptions {
        self.limit = limit;
        self
    }

    pub fn with_no_retry(mut self, no_retry: bool) -> SendOptions {
        self.no_retry = no_retry;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> SendOptions {
        self.transport = Some(transport);
        self
    }

    pub fn with_broadcast(mut self, broadcast: Broadcast) -> SendOptions {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> SendOptions {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_error_catcher(mut self, error_catcher: ErrorCatcher) -> SendOptions {
        self.error_catcher = Some(error_catcher);
        self
    }

    pub fn with_allow_zero(mut self, allow_zero: bool) -> SendOptions {
        self.allow_zero = allow_zero;
        self
    }

    pub fn with_find_timeout(mut self, find_timeout: Option<Duration>) -> SendOptions {
        self.find_timeout = find_timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub timeout: Duration,
    /// keep devices that did not show up in this sweep
    pub ignore_lost: bool,
    /// finding nothing at all is an error rather than an empty result
    pub raise_on_none: bool,
    pub broadcast: Broadcast,
}

impl FindOptions {
    pub fn new(config: &SessionConfig) -> FindOptions {
        FindOptions {
            timeout: config.discovery_timeout,
            ignore_lost: false,
            raise_on_none: false,
            broadcast: Broadcast::Default,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> FindOptions {
        self.timeout = timeout;
        self
    }

    pub fn with_ignore_lost(mut self, ignore_lost: bool) -> FindOptions {
        self.ignore_lost = ignore_lost;
        self
    }

    pub fn with_raise_on_none(mut self, raise_on_none: bool) -> FindOptions {
        self.raise_on_none = raise_on_none;
        self
    }

    pub fn with_broadcast(mut self, broadcast: Broadcast) -> FindOptions {
        self.broadcast = broadcast;
        self
    }
}
