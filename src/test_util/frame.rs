use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::comms::device_identity::DeviceIdentity;

/// A LIFX style frame: 36 byte little endian header followed by an opaque payload.
///
/// size u16 | protocol u16 (low 12 bits, plus addressable and tagged flags) | source u32 |
///  target [u8; 8] | reserved [u8; 6] | flags u8 (res_required, ack_required) | sequence u8 |
///  reserved [u8; 8] | type u16 | reserved u16
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u16,
    pub tagged: bool,
    pub source: u32,
    pub target: Option<DeviceIdentity>,
    pub ack_required: bool,
    pub res_required: bool,
    pub sequence: u8,
    pub pkt_type: u16,
    pub payload: Bytes,
}

impl Default for Frame {
    fn default() -> Self {
        Frame {
            protocol: Frame::PROTOCOL,
            tagged: false,
            source: 0,
            target: None,
            ack_required: false,
            res_required: false,
            sequence: 0,
            pkt_type: 0,
            payload: Bytes::new(),
        }
    }
}

impl Frame {
    pub const HEADER_LEN: usize = 36;
    pub const PROTOCOL: u16 = 1024;

    const ADDRESSABLE: u16 = 1 << 12;
    const TAGGED: u16 = 1 << 13;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le((Self::HEADER_LEN + self.payload.len()) as u16);

        let mut protocol = (self.protocol & 0x0fff) | Self::ADDRESSABLE;
        if self.tagged {
            protocol |= Self::TAGGED;
        }
        buf.put_u16_le(protocol);
        buf.put_u32_le(self.source);
        DeviceIdentity::ser_target(self.target, buf);
        buf.put_bytes(0, 6);

        let mut flags = 0u8;
        if self.res_required {
            flags |= 1;
        }
        if self.ack_required {
            flags |= 2;
        }
        buf.put_u8(flags);
        buf.put_u8(self.sequence);
        buf.put_bytes(0, 8);
        buf.put_u16_le(self.pkt_type);
        buf.put_u16_le(0);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.payload.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(data: &[u8]) -> anyhow::Result<Frame> {
        if data.len() < Self::HEADER_LEN {
            bail!("frame too short: {} bytes", data.len());
        }

        let mut buf = data;
        let size = buf.get_u16_le() as usize;
        if size != data.len() {
            bail!("frame size {} does not match datagram length {}", size, data.len());
        }
        let protocol_and_flags = buf.get_u16_le();
        let source = buf.get_u32_le();
        let target = DeviceIdentity::try_deser_target(&mut buf)?;
        buf.advance(6);
        let flags = buf.get_u8();
        let sequence = buf.get_u8();
        buf.advance(8);
        let pkt_type = buf.get_u16_le();
        buf.advance(2);

        Ok(Frame {
            protocol: protocol_and_flags & 0x0fff,
            tagged: protocol_and_flags & Self::TAGGED != 0,
            source,
            target,
            ack_required: flags & 2 != 0,
            res_required: flags & 1 != 0,
            sequence,
            pkt_type,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_ser_deser() {
        let frame = Frame {
            tagged: true,
            source: 0xaabbccdd,
            target: Some(DeviceIdentity::new([0xd0, 0x73, 0xd5, 1, 2, 3])),
            ack_required: true,
            sequence: 200,
            pkt_type: 101,
            payload: Bytes::from_static(b"abc"),
            ..Default::default()
        };

        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 39);
        assert_eq!(&bytes[0..2], &39u16.to_le_bytes());
        assert_eq!(bytes[22], 2);
        assert_eq!(Frame::try_deser(&bytes).unwrap(), frame);
    }

    #[rstest]
    #[case::short(vec![0u8; 35])]
    #[case::size_mismatch({ let mut v = Frame::default().to_bytes().to_vec(); v.push(0); v })]
    fn test_deser_invalid(#[case] data: Vec<u8>) {
        assert!(Frame::try_deser(&data).is_err());
    }
}
