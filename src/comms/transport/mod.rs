pub mod udp;

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// An endpoint for talking to one device over one service (or to a broadcast address).
///
/// Connecting is lazy and idempotent: [Transport::spawn] is called before every write and is
///  cheap once connected. Received datagrams go to the [MessageHandler] the transport was created
///  with.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Debug + Sync + Send {
    fn remote_addr(&self) -> SocketAddr;

    /// ensure the transport is connected, giving up after `timeout`
    async fn spawn(&self, timeout: Duration) -> anyhow::Result<()>;

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;

    /// A transport to the same endpoint that delivers to a different handler. It does not share
    ///  connection state with `self`.
    fn clone_for(&self, handler: Arc<dyn MessageHandler>) -> Arc<dyn Transport>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Sync + Send {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr);
}

/// transports are interchangeable if they talk to the same endpoint
pub fn same_endpoint(a: &dyn Transport, b: &dyn Transport) -> bool {
    a.remote_addr() == b.remote_addr()
}
