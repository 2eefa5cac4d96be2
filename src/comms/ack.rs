use std::any::Any;

use bytes::Buf;

use crate::comms::codec::Packet;
use crate::comms::device_identity::DeviceIdentity;

/// A bare acknowledgement, recognized from the frame header alone without going through the
///  codec. It carries just enough to be routed to the exchange waiting for it.
///
/// Header layout (little endian): size u16, protocol+flags u16, source u32, target [u8; 8],
///  reserved [u8; 6], flags u8, sequence u8, reserved [u8; 8], type u16, reserved u16
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub source: u32,
    pub sequence: u8,
    pub target: Option<DeviceIdentity>,
}

impl Acknowledgement {
    pub const HEADER_LEN: usize = 36;
    pub const PROTOCOL: u16 = 1024;
    pub const PKT_TYPE: u16 = 45;

    /// `None` unless `data` is a frame with the acknowledgement's protocol and type
    pub fn try_parse(data: &[u8]) -> Option<Acknowledgement> {
        if data.len() < Self::HEADER_LEN {
            return None;
        }

        let mut buf = data;
        let _size = buf.get_u16_le();
        let protocol = buf.get_u16_le() & 0x0fff;
        let source = buf.get_u32_le();
        let mut target = [0u8; 8];
        buf.copy_to_slice(&mut target);
        buf.advance(6);
        let _flags = buf.get_u8();
        let sequence = buf.get_u8();
        buf.advance(8);
        let pkt_type = buf.get_u16_le();

        if protocol != Self::PROTOCOL || pkt_type != Self::PKT_TYPE {
            return None;
        }

        Some(Acknowledgement {
            source,
            sequence,
            target: DeviceIdentity::from_target(&target),
        })
    }
}

impl Packet for Acknowledgement {
    fn source(&self) -> u32 {
        self.source
    }

    fn sequence(&self) -> u8 {
        self.sequence
    }

    fn target(&self) -> Option<DeviceIdentity> {
        self.target
    }

    fn pkt_type(&self) -> u16 {
        Self::PKT_TYPE
    }

    fn is_ack(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
