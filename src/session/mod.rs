//! The session is what applications talk to: it knows the devices found so far, stamps outbound
//!  packets with its source id and per-target sequence numbers, and drives every exchange to
//!  completion.
//!
//! Each session derives its own shutdown signal from an application wide one, so shutting down
//!  the application ends every pending exchange of every session.

pub mod discovery;
pub mod dispatch;
pub mod network;
pub mod options;
pub mod reference;
pub mod reply_stream;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::comms::ack::Acknowledgement;
use crate::comms::codec::{Message, Protocol, Reply};
use crate::comms::device_identity::DeviceIdentity;
use crate::comms::found::Found;
use crate::comms::receiver::{MessageCatcher, Receiver};
use crate::comms::service::Service;
use crate::comms::transport::{MessageHandler, Transport};
use crate::config::SessionConfig;
use crate::errors::TransportError;
use crate::session::discovery::{DiscoveryStrategy, NetworkDiscovery};
use crate::session::network::{NetworkStrategy, TransportStrategy};
use crate::session::options::{FindOptions, SendOptions};
use crate::session::reference::Reference;
use crate::session::reply_stream::ReplyStream;
use crate::signal::{ChildSignal, Completion};
use crate::util::random::{source_id, RngRandom};

/// One or more messages sent as a unit. Each of them becomes a separate exchange per target.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub messages: Vec<Arc<dyn Message>>,
}

impl From<Arc<dyn Message>> for Outbound {
    fn from(value: Arc<dyn Message>) -> Self {
        Outbound { messages: vec![value] }
    }
}

impl From<Vec<Arc<dyn Message>>> for Outbound {
    fn from(value: Vec<Arc<dyn Message>>) -> Self {
        Outbound { messages: value }
    }
}

/// Cheap to clone, clones share all state
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: Arc<SessionConfig>,
    protocol: Arc<dyn Protocol>,
    source: u32,
    found: tokio::sync::RwLock<Found>,
    sequences: RwLock<FxHashMap<Option<DeviceIdentity>, AtomicU8>>,
    receiver: Arc<Receiver>,
    stop: ChildSignal<()>,
    broadcast_transports: Mutex<FxHashMap<SocketAddr, Arc<dyn Transport>>>,
    transports: Arc<dyn TransportStrategy>,
    discovery: Arc<dyn DiscoveryStrategy>,
    handler: Arc<dyn MessageHandler>,
}

/// Hands inbound datagrams to the receiver. It does not hold on to the session, so transports
///  owned by the session do not keep it alive.
struct InboundHandler {
    receiver: Arc<Receiver>,
    protocol: Arc<dyn Protocol>,
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr) {
        // exchanges opt in to zero source replies individually
        route_datagram(&self.receiver, self.protocol.as_ref(), buf, sender, true);
    }
}

fn route_datagram(receiver: &Receiver, protocol: &dyn Protocol, data: &[u8], addr: SocketAddr, allow_zero: bool) {
    if let Some(ack) = Acknowledgement::try_parse(data) {
        trace!(?addr, ?ack, "received acknowledgement");
        receiver.recv(Reply::new(Arc::new(ack), addr), allow_zero);
        return;
    }

    match protocol.unpack(data) {
        Ok(packet) => receiver.recv(Reply::new(packet, addr), allow_zero),
        Err(e) => warn!(?addr, len = data.len(), error = ?e, "failed to parse inbound datagram - dropping"),
    }
}

impl Session {
    pub fn new(config: SessionConfig, protocol: Arc<dyn Protocol>, root_stop: Arc<dyn Completion<()>>) -> anyhow::Result<Session> {
        Session::with_strategies(config, protocol, root_stop, Arc::new(NetworkStrategy), Arc::new(NetworkDiscovery))
    }

    pub fn with_strategies(
        config: SessionConfig,
        protocol: Arc<dyn Protocol>,
        root_stop: Arc<dyn Completion<()>>,
        transports: Arc<dyn TransportStrategy>,
        discovery: Arc<dyn DiscoveryStrategy>,
    ) -> anyhow::Result<Session> {
        config.validate()?;

        let receiver = Arc::new(Receiver::new());
        let handler = Arc::new(InboundHandler {
            receiver: receiver.clone(),
            protocol: protocol.clone(),
        });
        let source = source_id::<RngRandom>();
        debug!(source, "creating session");

        Ok(Session {
            inner: Arc::new(SessionInner {
                config: Arc::new(config),
                protocol,
                source,
                found: Default::default(),
                sequences: Default::default(),
                receiver,
                stop: ChildSignal::new(root_stop),
                broadcast_transports: Default::default(),
                transports,
                discovery,
                handler,
            })
        })
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.inner.config
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.inner.protocol
    }

    /// stamped into every packet this session sends
    pub fn source(&self) -> u32 {
        self.inner.source
    }

    pub fn stop_signal(&self) -> &ChildSignal<()> {
        &self.inner.stop
    }

    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.inner.receiver
    }

    /// The next sequence number for `target`, starting at 1 and wrapping around after 255
    pub fn sequence(&self, target: Option<DeviceIdentity>) -> u8 {
        {
            let sequences = match self.inner.sequences.read() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(counter) = sequences.get(&target) {
                return counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            }
        }

        let mut sequences = match self.inner.sequences.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        sequences.entry(target)
            .or_insert_with(|| AtomicU8::new(0))
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    /// a snapshot of the known devices
    pub async fn found(&self) -> Found {
        self.inner.found.read().await.clone()
    }

    pub fn set_message_catcher(&self, catcher: Option<MessageCatcher>) {
        self.inner.receiver.set_message_catcher(catcher);
    }

    /// Feeds one inbound datagram to the pending exchanges. Bare acknowledgements are recognized
    ///  without the codec, and anything the codec can not parse is dropped.
    ///
    /// Must be called from within a tokio runtime: replies to broadcast and unbounded exchanges
    ///  start a settle timer task.
    pub fn received_data(&self, data: &[u8], addr: SocketAddr, allow_zero: bool) {
        route_datagram(&self.inner.receiver, self.inner.protocol.as_ref(), data, addr, allow_zero);
    }

    /// Installs a transport for a device's service. Services the transport strategy can not use
    ///  are ignored.
    pub async fn add_service(&self, serial: DeviceIdentity, service: Service, addr: SocketAddr) -> Result<(), TransportError> {
        let transport = match self.inner.transports.make_transport(serial, service, addr, self.inner.handler.clone())? {
            Some(transport) => transport,
            None => return Ok(()),
        };

        trace!(%serial, ?service, ?addr, "adding service");
        self.inner.found.write().await
            .set_service(serial, service, transport)
            .await;
        Ok(())
    }

    /// Closes and removes every transport of a device
    pub async fn forget(&self, serial: &DeviceIdentity) -> bool {
        let removed = self.inner.found.write().await
            .remove(serial)
            .await;
        if removed {
            debug!(%serial, "forgot device");
        }
        removed
    }

    /// Adds devices known to another session, with transports delivering to this one
    pub async fn borrow_found(&self, other: &Found) {
        self.inner.found.write().await
            .borrow(other, &self.inner.handler);
    }

    /// Shuts the session down: pending exchanges end as cancelled and all transports are closed
    pub async fn finish(&self) {
        info!(source = self.inner.source, "finishing session");
        self.inner.stop.cancel();

        self.inner.found.write().await
            .remove_lost(&FxHashSet::default())
            .await;

        let broadcast_transports = std::mem::take(&mut *self.inner.broadcast_transports.lock().await);
        for (addr, transport) in broadcast_transports {
            if let Err(e) = transport.close().await {
                error!(?addr, error = ?e, "failed to close broadcast transport");
            }
        }
    }

    async fn broadcast_transport(&self, addr: SocketAddr) -> Arc<dyn Transport> {
        self.inner.broadcast_transports.lock().await
            .entry(addr)
            .or_insert_with(|| self.inner.transports.make_broadcast_transport(addr, self.inner.handler.clone()))
            .clone()
    }

    /// Sends every message to every device of `reference`. Replies are yielded per exchange as
    ///  soon as the exchange is done, so slow devices do not hold back the others.
    pub fn send(&self, outbound: impl Into<Outbound>, reference: impl Into<Reference>, options: SendOptions) -> ReplyStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session = self.clone();
        let outbound = outbound.into();
        let reference = reference.into();
        tokio::spawn(async move {
            session.run(outbound, reference, options, sender).await;
        });
        ReplyStream::new(receiver)
    }

    async fn run(self, outbound: Outbound, reference: Reference, options: SendOptions, sender: mpsc::UnboundedSender<Result<Reply, TransportError>>) {
        let mut errors = Vec::new();
        let mut report = |error: TransportError| match &options.error_catcher {
            Some(catcher) => catcher.add_error(error),
            None => errors.push(error),
        };

        let targets = match self.resolve_reference(&reference, &options).await {
            Ok(targets) => targets,
            Err(e) => {
                report(e);
                Vec::new()
            }
        };

        let mut tasks = JoinSet::new();
        for target in targets {
            for message in &outbound.messages {
                let session = self.clone();
                let message = message.clone();
                let options = options.clone();
                tasks.spawn(async move {
                    session.dispatch(message, target, &options).await
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((replies, error)) => {
                    for reply in replies {
                        if sender.send(Ok(reply)).is_err() {
                            debug!("reply stream was dropped - abandoning send");
                            tasks.abort_all();
                            return;
                        }
                    }
                    if let Some(error) = error {
                        report(error);
                    }
                }
                Err(e) => error!(error = ?e, "dispatch task failed"),
            }
        }

        if !errors.is_empty() {
            let _ = sender.send(Err(TransportError::RunErrors { errors }));
        }
    }

    /// `None` stands for the blank target of a broadcast
    async fn resolve_reference(&self, reference: &Reference, options: &SendOptions) -> Result<Vec<Option<DeviceIdentity>>, TransportError> {
        let serials = match reference {
            Reference::Broadcast => return Ok(vec![None]),
            Reference::Identities(serials) => serials.clone(),
            Reference::Resolver(resolver) => {
                let timeout = options.find_timeout.unwrap_or(self.inner.config.find_timeout);
                let find_options = FindOptions::new(&self.inner.config)
                    .with_timeout(timeout);
                resolver.resolve(self, find_options).await?
            }
        };

        let needs_found = options.transport.is_none() && options.broadcast.is_none();
        if let (true, Some(find_timeout)) = (needs_found, options.find_timeout) {
            let missing = {
                let found = self.inner.found.read().await;
                serials.iter()
                    .filter(|serial| !found.contains(serial))
                    .cloned()
                    .collect::<Vec<_>>()
            };
            if !missing.is_empty() {
                debug!(?missing, "searching for unknown targets");
                let find_options = FindOptions::new(&self.inner.config)
                    .with_timeout(find_timeout)
                    .with_ignore_lost(true);
                self.find_specific_identities(&missing, find_options).await?;
            }
        }

        Ok(serials.into_iter().map(Some).collect())
    }

    pub async fn find_devices(&self, options: FindOptions) -> Result<Found, TransportError> {
        let (found, _) = self.search(None, options).await?;
        Ok(found)
    }

    /// Returns the known devices after the search, and those of `serials` that are still missing
    pub async fn find_specific_identities(&self, serials: &[DeviceIdentity], options: FindOptions) -> Result<(Found, Vec<DeviceIdentity>), TransportError> {
        self.search(Some(serials), options).await
    }

    #[tracing::instrument(skip(self, options), fields(source = self.inner.source))]
    async fn search(&self, wanted: Option<&[DeviceIdentity]>, options: FindOptions) -> Result<(Found, Vec<DeviceIdentity>), TransportError> {
        let seen = self.inner.discovery.do_search(self, wanted, &options).await?;
        debug!(?seen, "discovery sweep done");

        if !options.ignore_lost {
            let seen = seen.iter().cloned().collect::<FxHashSet<_>>();
            self.inner.found.write().await
                .remove_lost(&seen)
                .await;
        }

        let found = self.found().await;
        let missing = match wanted {
            Some(wanted) => wanted.iter()
                .filter(|serial| !found.contains(serial))
                .cloned()
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };

        if !missing.is_empty() {
            warn!(?missing, "failed to find devices");
        }
        if wanted.is_none() && seen.is_empty() {
            if options.raise_on_none {
                return Err(TransportError::NoDevicesFound);
            }
            info!("did not find any devices");
        }
        Ok((found, missing))
    }
}
