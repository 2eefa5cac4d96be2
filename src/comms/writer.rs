use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::trace;

use crate::comms::codec::Message;
use crate::comms::device_identity::DeviceIdentity;
use crate::comms::exchange::ReplyKey;
use crate::comms::transport::Transport;
use crate::errors::TransportError;

/// Knows how to (re-)send one packet. Deciding *when* to send is up to the waiter.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketWriter: Send + Sync {
    async fn write(&self) -> Result<(), TransportError>;

    /// if `false`, the first write completes the exchange
    fn expects_reply(&self) -> bool;
}

pub struct Writer {
    transport: Arc<dyn Transport>,
    serial: Option<DeviceIdentity>,
    /// stamped once, every retry sends the same bytes
    bytes: Bytes,
    connect_timeout: Duration,
    expects_reply: bool,
}

impl Writer {
    pub fn new(transport: Arc<dyn Transport>, message: &dyn Message, key: ReplyKey, connect_timeout: Duration) -> Result<Writer, TransportError> {
        let bytes = message.pack(key.source, key.sequence, key.target)
            .map_err(TransportError::codec)?;

        Ok(Writer {
            transport,
            serial: key.target,
            bytes,
            connect_timeout,
            expects_reply: message.ack_required() || message.res_required(),
        })
    }
}

#[async_trait]
impl PacketWriter for Writer {
    async fn write(&self) -> Result<(), TransportError> {
        self.transport.spawn(self.connect_timeout).await
            .map_err(|e| TransportError::ConnectFailed { serial: self.serial, reason: format!("{:#}", e) })?;

        trace!(serial = ?self.serial, transport = ?self.transport, len = self.bytes.len(), "writing packet");
        self.transport.write(&self.bytes).await
            .map_err(|e| TransportError::WriteFailed { serial: self.serial, reason: format!("{:#}", e) })
    }

    fn expects_reply(&self) -> bool {
        self.expects_reply
    }
}
