use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use crate::comms::codec::Message;
use crate::comms::device_identity::DeviceIdentity;
use crate::comms::found::ServiceMap;
use crate::comms::retry_options::RetryOptions;
use crate::comms::service::Service;
use crate::comms::transport::udp::UdpTransport;
use crate::comms::transport::{MessageHandler, Transport};
use crate::errors::TransportError;

/// Decides how to reach devices: which transports exist for which services, which one to use
///  for a given message, and how to pace retries over it.
pub trait TransportStrategy: Send + Sync {
    /// `None` for services that can not be used
    fn make_transport(&self, serial: DeviceIdentity, service: Service, addr: SocketAddr, handler: Arc<dyn MessageHandler>) -> Result<Option<Arc<dyn Transport>>, TransportError>;

    fn make_broadcast_transport(&self, addr: SocketAddr, handler: Arc<dyn MessageHandler>) -> Arc<dyn Transport>;

    /// services that can carry `message`, in order of preference
    fn determine_needed_transport(&self, _message: &dyn Message, _services: &ServiceMap) -> Vec<Service> {
        vec![Service::Udp]
    }

    fn choose_transport(&self, serial: DeviceIdentity, message: &dyn Message, services: &ServiceMap) -> Result<Arc<dyn Transport>, TransportError> {
        let needed = self.determine_needed_transport(message, services);
        for service in &needed {
            if let Some(transport) = services.get(service) {
                trace!(%serial, ?service, "chose transport");
                return Ok(transport.clone());
            }
        }

        let mut available = services.keys().cloned().collect::<Vec<_>>();
        available.sort();
        Err(TransportError::NoDesiredService { serial, needed, available })
    }

    fn retry_options_for(&self, _message: &dyn Message, _transport: &dyn Transport, defaults: &RetryOptions) -> RetryOptions {
        defaults.clone()
    }
}

/// Talks UDP to every device
pub struct NetworkStrategy;

impl TransportStrategy for NetworkStrategy {
    fn make_transport(&self, serial: DeviceIdentity, service: Service, addr: SocketAddr, handler: Arc<dyn MessageHandler>) -> Result<Option<Arc<dyn Transport>>, TransportError> {
        match service {
            Service::Udp => Ok(Some(Arc::new(UdpTransport::new(addr, handler)))),
            reserved => {
                trace!(%serial, ?reserved, "ignoring reserved service");
                Ok(None)
            }
        }
    }

    fn make_broadcast_transport(&self, addr: SocketAddr, handler: Arc<dyn MessageHandler>) -> Arc<dyn Transport> {
        Arc::new(UdpTransport::new(addr, handler))
    }
}
