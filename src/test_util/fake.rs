//! An in-memory network of scripted devices, for exercising a whole session without sockets.

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;
use tracing::trace;

use crate::comms::device_identity::DeviceIdentity;
use crate::comms::service::Service;
use crate::comms::transport::{MessageHandler, Transport};
use crate::errors::TransportError;
use crate::session::network::TransportStrategy;
use crate::test_util::frame::Frame;
use crate::test_util::message::{TestMessage, TestProtocol};

/// Produces the frames a device sends back for a frame it received
pub type Responder = Arc<dyn Fn(&FakeDevice, &Frame) -> Vec<Frame> + Send + Sync>;

#[derive(Clone)]
pub struct FakeDevice {
    pub serial: DeviceIdentity,
    pub addr: SocketAddr,
    pub delay: Duration,
    responder: Responder,
}

impl Debug for FakeDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FakeDevice({} @ {:?})", self.serial, self.addr)
    }
}

impl FakeDevice {
    /// Answers discovery with a UDP service on its own port, acks when asked to, and answers
    ///  every request for a response with a [TestMessage::GET_REPLY_TYPE] packet
    pub fn new(serial: DeviceIdentity, addr: SocketAddr) -> FakeDevice {
        FakeDevice {
            serial,
            addr,
            delay: Duration::from_millis(10),
            responder: Arc::new(Self::default_replies),
        }
    }

    /// receives everything and never answers
    pub fn silent(mut self) -> FakeDevice {
        self.responder = Arc::new(|_: &FakeDevice, _: &Frame| Vec::new());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> FakeDevice {
        self.delay = delay;
        self
    }

    pub fn with_responder(mut self, responder: impl Fn(&FakeDevice, &Frame) -> Vec<Frame> + Send + Sync + 'static) -> FakeDevice {
        self.responder = Arc::new(responder);
        self
    }

    /// a frame answering `request` from this device
    pub fn reply_to(&self, request: &Frame, pkt_type: u16, payload: Bytes) -> Frame {
        Frame {
            source: request.source,
            sequence: request.sequence,
            target: Some(self.serial),
            pkt_type,
            payload,
            ..Default::default()
        }
    }

    pub fn default_replies(device: &FakeDevice, request: &Frame) -> Vec<Frame> {
        if request.pkt_type == TestMessage::GET_SERVICE_TYPE {
            let payload = TestProtocol::service_payload(Service::Udp, device.addr.port());
            return vec![device.reply_to(request, TestMessage::SERVICE_REPLY_TYPE, payload)];
        }

        let mut result = Vec::new();
        if request.ack_required {
            result.push(device.reply_to(request, crate::comms::ack::Acknowledgement::PKT_TYPE, Bytes::new()));
        }
        if request.res_required {
            result.push(device.reply_to(request, TestMessage::GET_REPLY_TYPE, Bytes::new()));
        }
        result
    }

    fn respond(&self, request: &Frame) -> Vec<Frame> {
        if let Some(target) = request.target {
            if target != self.serial {
                return Vec::new();
            }
        }
        (self.responder)(self, request)
    }
}

#[derive(Default)]
struct FakeNetworkState {
    devices: Vec<FakeDevice>,
    writes: Vec<(SocketAddr, Frame)>,
    closed: Vec<SocketAddr>,
}

/// Devices reachable through the network's transports. Also serves as the session's transport
///  strategy, so everything the session creates talks to this network.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    state: Arc<Mutex<FakeNetworkState>>,
}

impl FakeNetwork {
    pub fn new() -> FakeNetwork {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeNetworkState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_device(&self, device: FakeDevice) {
        self.lock().devices.push(device);
    }

    /// frames written to `addr` so far
    pub fn writes_to(&self, addr: SocketAddr) -> Vec<Frame> {
        self.lock().writes.iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn num_writes(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn num_closed(&self, addr: SocketAddr) -> usize {
        self.lock().closed.iter()
            .filter(|a| **a == addr)
            .count()
    }

    pub fn transport(&self, remote_addr: SocketAddr, is_broadcast: bool, handler: Arc<dyn MessageHandler>) -> Arc<FakeTransport> {
        Arc::new(FakeTransport {
            network: self.clone(),
            remote_addr,
            is_broadcast,
            handler,
        })
    }
}

impl TransportStrategy for FakeNetwork {
    fn make_transport(&self, _serial: DeviceIdentity, service: Service, addr: SocketAddr, handler: Arc<dyn MessageHandler>) -> Result<Option<Arc<dyn Transport>>, TransportError> {
        if service.is_reserved() {
            return Ok(None);
        }
        Ok(Some(self.transport(addr, false, handler)))
    }

    fn make_broadcast_transport(&self, addr: SocketAddr, handler: Arc<dyn MessageHandler>) -> Arc<dyn Transport> {
        self.transport(addr, true, handler)
    }
}

pub struct FakeTransport {
    network: FakeNetwork,
    remote_addr: SocketAddr,
    is_broadcast: bool,
    handler: Arc<dyn MessageHandler>,
}

impl Debug for FakeTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FakeTransport({:?}, broadcast: {})", self.remote_addr, self.is_broadcast)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn spawn(&self, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
        let request = Frame::try_deser(buf)?;

        let devices = {
            let mut state = self.network.lock();
            state.writes.push((self.remote_addr, request.clone()));
            state.devices.iter()
                .filter(|d| self.is_broadcast || d.addr == self.remote_addr)
                .cloned()
                .collect::<Vec<_>>()
        };

        for device in devices {
            let replies = device.respond(&request);
            trace!(?device, num_replies = replies.len(), "fake device received frame");
            for reply in replies {
                let handler = self.handler.clone();
                let delay = device.delay;
                let from = device.addr;
                tokio::spawn(async move {
                    sleep(delay).await;
                    handler.handle_message(&reply.to_bytes(), from).await;
                });
            }
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.network.lock().closed.push(self.remote_addr);
        Ok(())
    }

    fn clone_for(&self, handler: Arc<dyn MessageHandler>) -> Arc<dyn Transport> {
        self.network.transport(self.remote_addr, self.is_broadcast, handler)
    }
}

/// Takes the full connect timeout to connect, then accepts every write without answering
#[derive(Debug)]
pub struct SlowConnectTransport {
    pub remote_addr: SocketAddr,
}

#[async_trait]
impl Transport for SlowConnectTransport {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn spawn(&self, timeout: Duration) -> anyhow::Result<()> {
        sleep(timeout).await;
        Ok(())
    }

    async fn write(&self, _buf: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn clone_for(&self, _handler: Arc<dyn MessageHandler>) -> Arc<dyn Transport> {
        Arc::new(SlowConnectTransport { remote_addr: self.remote_addr })
    }
}
