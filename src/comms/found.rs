use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error};

use crate::comms::device_identity::DeviceIdentity;
use crate::comms::service::Service;
use crate::comms::transport::{same_endpoint, MessageHandler, Transport};
use crate::errors::TransportError;

pub type ServiceMap = FxHashMap<Service, Arc<dyn Transport>>;

/// Known devices and the transports for talking to them.
///
/// A device without any services is treated as if it was not there.
#[derive(Clone, Default)]
pub struct Found {
    found: FxHashMap<DeviceIdentity, ServiceMap>,
}

impl Found {
    pub fn new() -> Found {
        Default::default()
    }

    pub fn lookup(&self, serial: &DeviceIdentity) -> Result<&ServiceMap, TransportError> {
        match self.found.get(serial) {
            Some(services) if !services.is_empty() => Ok(services),
            _ => Err(TransportError::NotFound { serial: *serial }),
        }
    }

    pub fn contains(&self, serial: &DeviceIdentity) -> bool {
        self.lookup(serial).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.found.values().all(|services| services.is_empty())
    }

    pub fn len(&self) -> usize {
        self.found.values().filter(|services| !services.is_empty()).count()
    }

    /// sorted hex representations of all known devices
    pub fn serials(&self) -> Vec<String> {
        let mut result = self.identities().iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn identities(&self) -> Vec<DeviceIdentity> {
        let mut result = self.found.iter()
            .filter(|(_, services)| !services.is_empty())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// Installs `transport` for the service, closing a previous transport to a different endpoint.
    ///  A previous transport to the same endpoint is kept, along with its connection state.
    pub async fn set_service(&mut self, serial: DeviceIdentity, service: Service, transport: Arc<dyn Transport>) {
        let services = self.found.entry(serial).or_default();

        if let Some(existing) = services.get(&service) {
            if same_endpoint(existing.as_ref(), transport.as_ref()) {
                return;
            }
            debug!(%serial, ?service, old = ?existing, new = ?transport, "replacing transport");
            close_logging_errors(serial, existing.as_ref()).await;
        }
        services.insert(service, transport);
    }

    /// Removes a device, closing all its transports
    pub async fn remove(&mut self, serial: &DeviceIdentity) -> bool {
        match self.found.remove(serial) {
            Some(services) => {
                for transport in services.values() {
                    close_logging_errors(*serial, transport.as_ref()).await;
                }
                !services.is_empty()
            }
            None => false,
        }
    }

    /// Closes and removes every device that is not in `seen`
    pub async fn remove_lost(&mut self, seen: &FxHashSet<DeviceIdentity>) {
        let lost = self.found.keys()
            .filter(|id| !seen.contains(id))
            .cloned()
            .collect::<Vec<_>>();

        for serial in lost {
            debug!(%serial, "device was lost");
            self.remove(&serial).await;
        }
    }

    /// Adds every `(device, service)` known to `other` but not here, with a transport cloned to
    ///  deliver to `handler`
    pub fn borrow(&mut self, other: &Found, handler: &Arc<dyn MessageHandler>) {
        for (serial, other_services) in &other.found {
            let services = self.found.entry(*serial).or_default();
            for (service, transport) in other_services {
                services.entry(*service)
                    .or_insert_with(|| transport.clone_for(handler.clone()));
            }
        }
    }
}

async fn close_logging_errors(serial: DeviceIdentity, transport: &dyn Transport) {
    if let Err(e) = transport.close().await {
        error!(%serial, ?transport, error = ?e, "failed to close transport");
    }
}

impl Debug for Found {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for serial in self.identities() {
            if let Some(services) = self.found.get(&serial) {
                let mut services = services.keys().collect::<Vec<_>>();
                services.sort();
                map.entry(&serial.to_string(), &services);
            }
        }
        map.finish()
    }
}
