use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;

use crate::comms::device_identity::DeviceIdentity;
use crate::errors::TransportError;
use crate::session::options::FindOptions;
use crate::session::Session;

/// Expands a dynamic reference into concrete devices, possibly by running discovery
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn resolve(&self, session: &Session, options: FindOptions) -> Result<Vec<DeviceIdentity>, TransportError>;
}

/// Which devices a send is addressed to
#[derive(Clone)]
pub enum Reference {
    /// no specific device: the packet goes out over broadcast with a blank target
    Broadcast,
    Identities(Vec<DeviceIdentity>),
    Resolver(Arc<dyn ReferenceResolver>),
}

impl Debug for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Broadcast => write!(f, "Broadcast"),
            Reference::Identities(ids) => write!(f, "Identities({:?})", ids),
            Reference::Resolver(_) => write!(f, "Resolver"),
        }
    }
}

impl From<DeviceIdentity> for Reference {
    fn from(value: DeviceIdentity) -> Self {
        Reference::Identities(vec![value])
    }
}

impl From<Vec<DeviceIdentity>> for Reference {
    fn from(value: Vec<DeviceIdentity>) -> Self {
        Reference::Identities(value)
    }
}

impl From<&[DeviceIdentity]> for Reference {
    fn from(value: &[DeviceIdentity]) -> Self {
        Reference::Identities(value.to_vec())
    }
}

impl From<Arc<dyn ReferenceResolver>> for Reference {
    fn from(value: Arc<dyn ReferenceResolver>) -> Self {
        Reference::Resolver(value)
    }
}

/// Every device discovery can find
pub struct AllDevices;

#[async_trait]
impl ReferenceResolver for AllDevices {
    async fn resolve(&self, session: &Session, options: FindOptions) -> Result<Vec<DeviceIdentity>, TransportError> {
        let found = session.find_devices(options).await?;
        Ok(found.identities())
    }
}
