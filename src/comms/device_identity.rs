use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use bytes::{Buf, BufMut};

use crate::errors::TransportError;

/// Identifies a device on the network: 6 bytes, usually the device's MAC address, written as 12
///  lower case hex characters.
///
/// On the wire the identity is embedded in an 8 byte target field, padded with two zero bytes.
///  An all-zero target field means 'no specific device', i.e. a broadcast.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeviceIdentity([u8; 6]);

impl DeviceIdentity {
    pub const LEN: usize = 6;
    pub const TARGET_LEN: usize = 8;

    pub const fn new(bytes: [u8; 6]) -> DeviceIdentity {
        DeviceIdentity(bytes)
    }

    /// Accepts anything at least 6 bytes long, extra bytes are cut off
    pub fn from_bytes(bytes: &[u8]) -> Result<DeviceIdentity, TransportError> {
        if bytes.len() < Self::LEN {
            return Err(TransportError::InvalidIdentity(hex::encode(bytes)));
        }
        let mut result = [0u8; 6];
        result.copy_from_slice(&bytes[..Self::LEN]);
        Ok(DeviceIdentity(result))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn to_target(&self) -> [u8; 8] {
        let mut result = [0u8; 8];
        result[..Self::LEN].copy_from_slice(&self.0);
        result
    }

    /// `None` stands for the blank (broadcast) target
    pub fn ser_target(target: Option<DeviceIdentity>, buf: &mut impl BufMut) {
        match target {
            Some(id) => buf.put_slice(&id.to_target()),
            None => buf.put_bytes(0, Self::TARGET_LEN),
        }
    }

    pub fn try_deser_target(buf: &mut impl Buf) -> anyhow::Result<Option<DeviceIdentity>> {
        if buf.remaining() < Self::TARGET_LEN {
            anyhow::bail!("target field needs {} bytes, {} remaining", Self::TARGET_LEN, buf.remaining());
        }
        let mut raw = [0u8; 8];
        buf.copy_to_slice(&mut raw);
        Ok(Self::from_target(&raw))
    }

    pub fn from_target(raw: &[u8; 8]) -> Option<DeviceIdentity> {
        if raw[..Self::LEN].iter().all(|&b| b == 0) {
            return None;
        }
        let mut result = [0u8; 6];
        result.copy_from_slice(&raw[..Self::LEN]);
        Some(DeviceIdentity(result))
    }
}

impl FromStr for DeviceIdentity {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s.trim())
            .map_err(|_| TransportError::InvalidIdentity(s.to_string()))?;
        if decoded.len() < Self::LEN {
            return Err(TransportError::InvalidIdentity(s.to_string()));
        }
        Self::from_bytes(&decoded)
    }
}

impl From<[u8; 6]> for DeviceIdentity {
    fn from(value: [u8; 6]) -> Self {
        DeviceIdentity(value)
    }
}

impl Display for DeviceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for DeviceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", hex::encode(self.0))
    }
}
