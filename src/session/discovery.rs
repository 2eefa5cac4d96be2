use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::comms::device_identity::DeviceIdentity;
use crate::comms::service::Service;
use crate::errors::TransportError;
use crate::session::options::{FindOptions, SendOptions};
use crate::session::Session;

pub const SERIAL_FILTER_ENV: &str = "SERIAL_FILTER";

/// Restricts and short-circuits discovery
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// only devices in this list are ever added
    pub serial_filter: Option<Vec<DeviceIdentity>>,
    /// services to install instead of sweeping the network
    pub hardcoded: Option<FxHashMap<DeviceIdentity, Vec<(Service, SocketAddr)>>>,
}

impl DiscoveryOptions {
    /// Reads a comma separated list of serials from `SERIAL_FILTER`. An empty value or `null`
    ///  means no filter.
    pub fn from_env() -> Result<DiscoveryOptions, TransportError> {
        let serial_filter = match std::env::var(SERIAL_FILTER_ENV) {
            Ok(value) => Self::parse_serial_filter(&value)?,
            Err(_) => None,
        };
        Ok(DiscoveryOptions {
            serial_filter,
            hardcoded: None,
        })
    }

    pub fn parse_serial_filter(value: &str) -> Result<Option<Vec<DeviceIdentity>>, TransportError> {
        let value = value.trim();
        if value.is_empty() || value == "null" {
            return Ok(None);
        }
        let serials = value.split(',')
            .map(DeviceIdentity::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(serials))
    }

    pub fn want(&self, serial: &DeviceIdentity) -> bool {
        match &self.serial_filter {
            Some(filter) => filter.contains(serial),
            None => true,
        }
    }
}

/// Finds devices and adds them to the session. Returns the identities that were seen by this
///  search.
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    async fn do_search(&self, session: &Session, wanted: Option<&[DeviceIdentity]>, options: &FindOptions) -> Result<Vec<DeviceIdentity>, TransportError>;
}

/// Broadcasts the protocol's discovery message in rounds paced by the session's discovery retry
///  options, registering every device that answers
pub struct NetworkDiscovery;

impl NetworkDiscovery {
    async fn add_hardcoded(&self, session: &Session, hardcoded: &FxHashMap<DeviceIdentity, Vec<(Service, SocketAddr)>>) -> Result<Vec<DeviceIdentity>, TransportError> {
        let discovery = &session.config().discovery;
        let mut result = Vec::new();
        for (serial, services) in hardcoded {
            if !discovery.want(serial) {
                continue;
            }
            for (service, addr) in services {
                session.add_service(*serial, *service, *addr).await?;
            }
            result.push(*serial);
        }
        result.sort();
        Ok(result)
    }

    fn is_done(seen: &FxHashSet<DeviceIdentity>, wanted: Option<&[DeviceIdentity]>) -> bool {
        match wanted {
            None => !seen.is_empty(),
            Some(wanted) => wanted.iter().all(|serial| seen.contains(serial)),
        }
    }
}

#[async_trait]
impl DiscoveryStrategy for NetworkDiscovery {
    async fn do_search(&self, session: &Session, wanted: Option<&[DeviceIdentity]>, options: &FindOptions) -> Result<Vec<DeviceIdentity>, TransportError> {
        let config = session.config().clone();
        if let Some(hardcoded) = &config.discovery.hardcoded {
            debug!("using hardcoded discovery");
            return self.add_hardcoded(session, hardcoded).await;
        }

        let protocol = session.protocol().clone();
        let mut seen = FxHashSet::default();
        let mut rounds = config.discovery_retry_options.iterator(options.timeout);

        while let Some((end_in, till_next)) = rounds.next().await {
            trace!(?end_in, ?till_next, "discovery round");

            let send_options = SendOptions::new(&config)
                .with_broadcast(options.broadcast)
                .with_no_retry(true)
                .with_timeout(till_next.min(end_in))
                .with_allow_zero(true)
                .with_limit(None);

            let (replies, error) = session.dispatch(protocol.discovery_message(), None, &send_options).await;
            match error {
                // rounds without any reply run into their timeout
                Some(TransportError::TimedOut { .. }) | None => {}
                Some(e) => debug!(error = ?e, "error during discovery round"),
            }

            for reply in replies {
                let Some(serial) = reply.serial() else {
                    trace!(?reply, "discovery reply without a serial");
                    continue;
                };
                if !config.discovery.want(&serial) {
                    trace!(%serial, "serial is filtered out");
                    continue;
                }
                let Some((service, port)) = protocol.service_info(reply.packet.as_ref()) else {
                    debug!(?reply, "not a service announcement");
                    continue;
                };

                let addr = SocketAddr::new(reply.remote_addr.ip(), port);
                match session.add_service(serial, service, addr).await {
                    Ok(()) => {
                        seen.insert(serial);
                    }
                    Err(e) => warn!(%serial, ?service, ?addr, error = ?e, "failed to add service"),
                }
            }

            if Self::is_done(&seen, wanted) {
                break;
            }
        }

        let mut result = seen.into_iter().collect::<Vec<_>>();
        result.sort();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn id(n: u8) -> DeviceIdentity {
        DeviceIdentity::new([0xd0, 0x73, 0xd5, 0, 0, n])
    }

    #[rstest]
    #[case::empty("", None)]
    #[case::null("null", None)]
    #[case::one("d073d5000001", Some(vec![id(1)]))]
    #[case::several("d073d5000001, d073d5000002", Some(vec![id(1), id(2)]))]
    fn test_parse_serial_filter(#[case] value: &str, #[case] expected: Option<Vec<DeviceIdentity>>) {
        assert_eq!(DiscoveryOptions::parse_serial_filter(value).unwrap(), expected);
    }

    #[test]
    fn test_parse_serial_filter_invalid() {
        assert!(DiscoveryOptions::parse_serial_filter("d073d5000001,xyz").is_err());
    }

    #[test]
    fn test_want() {
        assert!(DiscoveryOptions::default().want(&id(7)));

        let options = DiscoveryOptions {
            serial_filter: Some(vec![id(1)]),
            hardcoded: None,
        };
        assert!(options.want(&id(1)));
        assert!(!options.want(&id(2)));
    }

    #[rstest]
    #[case::nothing_unconstrained(vec![], None, false)]
    #[case::something_unconstrained(vec![1], None, true)]
    #[case::partial(vec![1], Some(vec![1, 2]), false)]
    #[case::complete(vec![1, 2, 3], Some(vec![1, 2]), true)]
    fn test_is_done(#[case] seen: Vec<u8>, #[case] wanted: Option<Vec<u8>>, #[case] expected: bool) {
        let seen = seen.into_iter().map(id).collect::<FxHashSet<_>>();
        let wanted = wanted.map(|w| w.into_iter().map(id).collect::<Vec<_>>());
        assert_eq!(NetworkDiscovery::is_done(&seen, wanted.as_deref()), expected);
    }
}
