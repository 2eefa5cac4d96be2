//! The seam to the message codec. The engine never looks inside payloads: it gets bytes from
//!  an outbound [Message], and parsed [Packet]s from a [Protocol], and uses the few header level
//!  facts these traits expose to route and complete exchanges.

use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::comms::device_identity::DeviceIdentity;
use crate::comms::service::Service;

/// How many replies a message expects, i.e. when its exchange is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// the first expected reply completes the exchange
    Single,
    /// exactly this many replies
    FixedCount(usize),
    /// the first reply announces a total number of items, and every reply reports how many items
    ///  it carries
    DynamicCount,
    /// no way of knowing - the exchange completes after a quiet period
    Unbounded,
}

/// Item counts reported inside a reply packet, for [ReplyShape::DynamicCount]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemCount {
    pub total: usize,
    pub items: usize,
}

pub trait Message: Debug + Send + Sync + 'static {
    fn pkt_type(&self) -> u16;

    fn ack_required(&self) -> bool;

    fn res_required(&self) -> bool;

    fn reply_shape(&self) -> ReplyShape {
        ReplyShape::Single
    }

    /// Acknowledgements are matched structurally and never passed here
    fn is_expected_reply(&self, _packet: &dyn Packet) -> bool {
        true
    }

    /// serialize with the header fields stamped in
    fn pack(&self, source: u32, sequence: u8, target: Option<DeviceIdentity>) -> anyhow::Result<Bytes>;
}

pub trait Packet: Debug + Send + Sync + 'static {
    fn source(&self) -> u32;

    fn sequence(&self) -> u8;

    /// `None` for the blank target
    fn target(&self) -> Option<DeviceIdentity>;

    fn pkt_type(&self) -> u16;

    fn is_ack(&self) -> bool {
        false
    }

    fn item_count(&self) -> Option<ItemCount> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Parses inbound datagrams and knows the protocol's discovery conversation
pub trait Protocol: Send + Sync + 'static {
    fn unpack(&self, data: &[u8]) -> anyhow::Result<Arc<dyn Packet>>;

    /// the message broadcast to find devices
    fn discovery_message(&self) -> Arc<dyn Message>;

    /// `(service, port)` announced by a reply to the discovery message
    fn service_info(&self, packet: &dyn Packet) -> Option<(Service, u16)>;
}

/// A received packet, where it came from, and (once it was matched to an exchange) the message
///  it answers
#[derive(Clone)]
pub struct Reply {
    pub packet: Arc<dyn Packet>,
    pub remote_addr: SocketAddr,
    pub sender_message: Option<Arc<dyn Message>>,
}

impl Reply {
    pub fn new(packet: Arc<dyn Packet>, remote_addr: SocketAddr) -> Reply {
        Reply {
            packet,
            remote_addr,
            sender_message: None,
        }
    }

    pub fn serial(&self) -> Option<DeviceIdentity> {
        self.packet.target()
    }

    pub fn downcast<P: Packet>(&self) -> Option<&P> {
        self.packet.as_any().downcast_ref::<P>()
    }
}

impl Debug for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reply({:?} from {:?})", self.packet, self.remote_addr)
    }
}
