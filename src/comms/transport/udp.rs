use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::comms::transport::{MessageHandler, Transport};

pub const MAX_DATAGRAM_SIZE: usize = 16384;

/// UDP transport to a single remote address (a device, or a broadcast address). The socket is
///  bound on first use, and a receive loop hands every datagram arriving on it to the handler.
pub struct UdpTransport {
    remote_addr: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    connection: Mutex<Option<UdpConnection>>,
}

struct UdpConnection {
    socket: Arc<UdpSocket>,
    recv_loop: JoinHandle<()>,
}

impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpTransport({:?})", self.remote_addr)
    }
}

impl UdpTransport {
    pub fn new(remote_addr: SocketAddr, handler: Arc<dyn MessageHandler>) -> UdpTransport {
        UdpTransport {
            remote_addr,
            handler,
            connection: Default::default(),
        }
    }

    async fn bind(&self) -> anyhow::Result<UdpConnection> {
        let local_addr: SocketAddr = if self.remote_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        }
        else {
            "[::]:0".parse()?
        };

        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        socket.set_broadcast(true)?;
        debug!(local_addr = ?socket.local_addr()?, remote_addr = ?self.remote_addr, "bound UDP socket");

        let recv_loop = tokio::spawn(recv_loop(socket.clone(), self.handler.clone()));
        Ok(UdpConnection {
            socket,
            recv_loop,
        })
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, handler: Arc<dyn MessageHandler>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    trace!("starting UDP receive loop");
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                trace!(?from, len, "received datagram");
                handler.handle_message(&buf[..len], from).await;
            }
            Err(e) => {
                error!(error = ?e, "error receiving from datagram socket");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn spawn(&self, connect_timeout: Duration) -> anyhow::Result<()> {
        let mut connection = self.connection.lock().await;
        if let Some(c) = connection.as_ref() {
            if !c.recv_loop.is_finished() {
                return Ok(());
            }
            warn!(remote_addr = ?self.remote_addr, "receive loop terminated, re-binding");
        }

        let c = timeout(connect_timeout, self.bind()).await
            .map_err(|_| anyhow!("timed out binding a socket for {:?}", self.remote_addr))??;
        *connection = Some(c);
        Ok(())
    }

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
        let socket = match self.connection.lock().await.as_ref() {
            Some(c) => c.socket.clone(),
            None => return Err(anyhow!("transport to {:?} is not connected", self.remote_addr)),
        };
        trace!(remote_addr = ?self.remote_addr, len = buf.len(), "sending datagram");
        socket.send_to(buf, self.remote_addr).await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(c) = self.connection.lock().await.take() {
            c.recv_loop.abort();
            if let Err(e) = c.recv_loop.await {
                if !e.is_cancelled() {
                    return Err(e.into());
                }
            }
            debug!(remote_addr = ?self.remote_addr, "closed UDP transport");
        }
        Ok(())
    }

    fn clone_for(&self, handler: Arc<dyn MessageHandler>) -> Arc<dyn Transport> {
        Arc::new(UdpTransport::new(self.remote_addr, handler))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use crate::comms::transport::{MessageHandler, Transport};
    use super::*;

    struct ChannelHandler {
        sender: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    }

    #[async_trait]
    impl MessageHandler for ChannelHandler {
        async fn handle_message(&self, buf: &[u8], sender: SocketAddr) {
            self.sender.send((buf.to_vec(), sender)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();

        let (sender, mut received) = mpsc::unbounded_channel();
        let transport = UdpTransport::new(device_addr, Arc::new(ChannelHandler { sender }));

        assert!(transport.write(b"too early").await.is_err());

        transport.spawn(Duration::from_secs(1)).await.unwrap();
        transport.spawn(Duration::from_secs(1)).await.unwrap();
        transport.write(b"hello").await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");

        device.send_to(b"reply", from).await.unwrap();
        let (data, reply_from) = received.recv().await.unwrap();
        assert_eq!(data, b"reply");
        assert_eq!(reply_from, device_addr);

        transport.close().await.unwrap();
        assert!(transport.write(b"after close").await.is_err());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_for_is_not_connected() {
        let (sender, _received) = mpsc::unbounded_channel();
        let handler: Arc<dyn MessageHandler> = Arc::new(ChannelHandler { sender });
        let transport = UdpTransport::new("127.0.0.1:56700".parse().unwrap(), handler.clone());
        transport.spawn(Duration::from_secs(1)).await.unwrap();

        let cloned = transport.clone_for(handler);
        assert_eq!(cloned.remote_addr(), transport.remote_addr());
        assert!(cloned.write(b"x").await.is_err());

        transport.close().await.unwrap();
    }
}
