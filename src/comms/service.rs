use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::errors::TransportError;

/// Transport medium a device announces in its service replies. The numbers are what devices put
///  on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Service {
    Udp = 1,
    Reserved1 = 2,
    Reserved2 = 3,
    Reserved3 = 4,
    Reserved4 = 5,
}

impl Service {
    /// reserved services are announced by some firmware but can not be talked to
    pub fn is_reserved(&self) -> bool {
        !matches!(self, Service::Udp)
    }

    pub fn from_wire(value: u8) -> Result<Service, TransportError> {
        Service::try_from(value)
            .map_err(|_| TransportError::UnknownService(value))
    }
}
