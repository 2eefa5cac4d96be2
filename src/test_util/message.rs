use std::any::Any;
use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::comms::codec::{ItemCount, Message, Packet, Protocol, ReplyShape};
use crate::comms::device_identity::DeviceIdentity;
use crate::comms::service::Service;
use crate::test_util::frame::Frame;

/// A message with no payload of its own, described entirely by its header flags, its reply
///  shape and the packet type it expects in return
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMessage {
    pub pkt_type: u16,
    pub ack_required: bool,
    pub res_required: bool,
    pub shape: ReplyShape,
    pub reply_type: u16,
}

impl TestMessage {
    pub const GET_SERVICE_TYPE: u16 = 2;
    pub const SERVICE_REPLY_TYPE: u16 = 3;
    pub const GET_TYPE: u16 = 100;
    pub const GET_REPLY_TYPE: u16 = 101;
    pub const SET_TYPE: u16 = 102;
    pub const FIRE_AND_FORGET_TYPE: u16 = 104;
    /// reply carrying `[total, items]` in its payload
    pub const MULTI_REPLY_TYPE: u16 = 105;

    /// asks for a response, no ack
    pub fn get() -> TestMessage {
        TestMessage {
            pkt_type: Self::GET_TYPE,
            ack_required: false,
            res_required: true,
            shape: ReplyShape::Single,
            reply_type: Self::GET_REPLY_TYPE,
        }
    }

    /// asks for an ack only
    pub fn set() -> TestMessage {
        TestMessage {
            pkt_type: Self::SET_TYPE,
            ack_required: true,
            res_required: false,
            shape: ReplyShape::Single,
            reply_type: Self::GET_REPLY_TYPE,
        }
    }

    pub fn fire_and_forget() -> TestMessage {
        TestMessage {
            pkt_type: Self::FIRE_AND_FORGET_TYPE,
            ack_required: false,
            res_required: false,
            shape: ReplyShape::Single,
            reply_type: Self::GET_REPLY_TYPE,
        }
    }

    pub fn get_service() -> TestMessage {
        TestMessage {
            pkt_type: Self::GET_SERVICE_TYPE,
            ack_required: false,
            res_required: true,
            shape: ReplyShape::Unbounded,
            reply_type: Self::SERVICE_REPLY_TYPE,
        }
    }

    pub fn with_ack(mut self) -> TestMessage {
        self.ack_required = true;
        self
    }

    pub fn with_shape(mut self, shape: ReplyShape) -> TestMessage {
        self.shape = shape;
        self
    }

    pub fn with_reply_type(mut self, reply_type: u16) -> TestMessage {
        self.reply_type = reply_type;
        self
    }
}

impl Message for TestMessage {
    fn pkt_type(&self) -> u16 {
        self.pkt_type
    }

    fn ack_required(&self) -> bool {
        self.ack_required
    }

    fn res_required(&self) -> bool {
        self.res_required
    }

    fn reply_shape(&self) -> ReplyShape {
        self.shape
    }

    fn is_expected_reply(&self, packet: &dyn Packet) -> bool {
        packet.pkt_type() == self.reply_type
    }

    fn pack(&self, source: u32, sequence: u8, target: Option<DeviceIdentity>) -> anyhow::Result<Bytes> {
        Ok(Frame {
            tagged: target.is_none(),
            source,
            target,
            ack_required: self.ack_required,
            res_required: self.res_required,
            sequence,
            pkt_type: self.pkt_type,
            ..Default::default()
        }.to_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPacket {
    pub source: u32,
    pub sequence: u8,
    pub target: Option<DeviceIdentity>,
    pub pkt_type: u16,
    pub payload: Bytes,
    pub item_count: Option<ItemCount>,
}

impl TestPacket {
    pub fn reply(source: u32, sequence: u8, target: Option<DeviceIdentity>, pkt_type: u16) -> TestPacket {
        TestPacket {
            source,
            sequence,
            target,
            pkt_type,
            payload: Bytes::new(),
            item_count: None,
        }
    }
}

impl Packet for TestPacket {
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
        self.pkt_type
    }

    fn item_count(&self) -> Option<ItemCount> {
        self.item_count
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Codec for [Frame]s carrying [TestMessage]s and their replies
#[derive(Debug, Default)]
pub struct TestProtocol;

impl TestProtocol {
    /// payload of a service reply: service u8, port u32
    pub fn service_payload(service: Service, port: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(service.into());
        buf.put_u32_le(port as u32);
        buf.freeze()
    }

    pub fn multi_payload(total: u8, items: u8) -> Bytes {
        Bytes::from(vec![total, items])
    }
}

impl Protocol for TestProtocol {
    fn unpack(&self, data: &[u8]) -> anyhow::Result<Arc<dyn Packet>> {
        let frame = Frame::try_deser(data)?;
        if frame.protocol != Frame::PROTOCOL {
            bail!("unsupported protocol {}", frame.protocol);
        }

        let item_count = if frame.pkt_type == TestMessage::MULTI_REPLY_TYPE && frame.payload.len() >= 2 {
            Some(ItemCount {
                total: frame.payload[0] as usize,
                items: frame.payload[1] as usize,
            })
        }
        else {
            None
        };

        Ok(Arc::new(TestPacket {
            source: frame.source,
            sequence: frame.sequence,
            target: frame.target,
            pkt_type: frame.pkt_type,
            payload: frame.payload,
            item_count,
        }))
    }

    fn discovery_message(&self) -> Arc<dyn Message> {
        Arc::new(TestMessage::get_service())
    }

    fn service_info(&self, packet: &dyn Packet) -> Option<(Service, u16)> {
        let packet = packet.as_any().downcast_ref::<TestPacket>()?;
        if packet.pkt_type != TestMessage::SERVICE_REPLY_TYPE || packet.payload.len() < 5 {
            return None;
        }

        let mut buf = packet.payload.clone();
        let service = Service::from_wire(buf.get_u8()).ok()?;
        let port = u16::try_from(buf.get_u32_le()).ok()?;
        Some((service, port))
    }
}
