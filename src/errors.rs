use std::fmt::{Debug, Formatter};

use thiserror::Error;

use crate::comms::codec::Reply;
use crate::comms::device_identity::DeviceIdentity;
use crate::comms::service::Service;

/// Everything that can go wrong with an exchange. Values are `Clone` because a single outcome is
///  observed by every waiter of a completion signal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to find device {serial}")]
    FailedToFindDevice { serial: DeviceIdentity },

    #[error("no devices were found")]
    NoDevicesFound,

    #[error("timed out waiting for a reply ({})", display_target(.serial))]
    TimedOut { serial: Option<DeviceIdentity> },

    #[error("cancelled ({})", display_target(.serial))]
    Cancelled { serial: Option<DeviceIdentity> },

    #[error("device {serial} is not in the found registry")]
    NotFound { serial: DeviceIdentity },

    #[error("invalid device identity {0:?}")]
    InvalidIdentity(String),

    #[error("device {serial} exposes none of the needed services {needed:?} (has {available:?})")]
    NoDesiredService {
        serial: DeviceIdentity,
        needed: Vec<Service>,
        available: Vec<Service>,
    },

    #[error("unknown service {0}")]
    UnknownService(u8),

    #[error("invalid broadcast address {0:?}")]
    InvalidBroadcast(String),

    #[error("failed to connect transport to {} ({reason})", display_target(.serial))]
    ConnectFailed { serial: Option<DeviceIdentity>, reason: String },

    #[error("failed to write packet to {} ({reason})", display_target(.serial))]
    WriteFailed { serial: Option<DeviceIdentity>, reason: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("{} error(s) while sending", .errors.len())]
    RunErrors { errors: Vec<TransportError> },
}

fn display_target(serial: &Option<DeviceIdentity>) -> String {
    match serial {
        Some(serial) => serial.to_string(),
        None => "broadcast".to_string(),
    }
}

impl TransportError {
    pub fn codec(e: anyhow::Error) -> TransportError {
        TransportError::Codec(format!("{:#}", e))
    }
}

/// A multi-target send that ran without an error catcher: every per-target error, together with
///  the replies that did arrive.
#[derive(Clone, Error)]
#[error("{} error(s) while sending, {} reply packet(s) received", .errors.len(), .results.len())]
pub struct RunFailure {
    pub results: Vec<Reply>,
    pub errors: Vec<TransportError>,
}

impl Debug for RunFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunFailure")
            .field("num_results", &self.results.len())
            .field("errors", &self.errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn serial() -> DeviceIdentity {
        "d073d5000001".parse().unwrap()
    }

    #[rstest]
    #[case::timeout_target(TransportError::TimedOut { serial: Some(serial()) }, "timed out waiting for a reply (d073d5000001)")]
    #[case::timeout_broadcast(TransportError::TimedOut { serial: None }, "timed out waiting for a reply (broadcast)")]
    #[case::not_found(TransportError::FailedToFindDevice { serial: serial() }, "failed to find device d073d5000001")]
    #[case::run_errors(TransportError::RunErrors { errors: vec![TransportError::NoDevicesFound, TransportError::UnknownService(9)] }, "2 error(s) while sending")]
    fn test_display(#[case] error: TransportError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }
}
