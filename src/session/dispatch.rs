use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::comms::codec::{Message, Reply};
use crate::comms::device_identity::DeviceIdentity;
use crate::comms::exchange::{Exchange, ReplyKey};
use crate::comms::transport::Transport;
use crate::comms::waiter::{WaitOutcome, Waiter};
use crate::comms::writer::Writer;
use crate::errors::TransportError;
use crate::session::options::{Broadcast, SendOptions};
use crate::session::Session;

impl Session {
    /// Sends one message to one device (or over broadcast if the options say so) and returns its
    ///  replies. Replies that arrived before a timeout or cancellation are discarded, see
    ///  [Session::dispatch] for keeping them.
    pub async fn send_single(&self, message: Arc<dyn Message>, serial: DeviceIdentity, options: &SendOptions) -> Result<Vec<Reply>, TransportError> {
        match self.dispatch(message, Some(serial), options).await {
            (replies, None) => Ok(replies),
            (_, Some(e)) => Err(e),
        }
    }

    /// Sends one message with a blank target to the broadcast address of `options`, the session's
    ///  default broadcast address if there is none
    pub async fn broadcast(&self, message: Arc<dyn Message>, options: &SendOptions) -> Result<Vec<Reply>, TransportError> {
        let mut options = options.clone();
        if options.broadcast.is_none() {
            options.broadcast = Some(Broadcast::Default);
        }
        match self.dispatch(message, None, &options).await {
            (replies, None) => Ok(replies),
            (_, Some(e)) => Err(e),
        }
    }

    /// Drives one exchange to its end, returning the replies that arrived along with the error
    ///  that ended it, if any
    #[tracing::instrument(skip(self, message, options), fields(source = self.inner.source, message = ?message))]
    pub async fn dispatch(&self, message: Arc<dyn Message>, target: Option<DeviceIdentity>, options: &SendOptions) -> (Vec<Reply>, Option<TransportError>) {
        match self.try_dispatch(message, target, options).await {
            Ok(WaitOutcome::Satisfied(replies)) => (replies, None),
            Ok(WaitOutcome::TimedOut(replies)) => (replies, Some(TransportError::TimedOut { serial: target })),
            Ok(WaitOutcome::Cancelled(replies)) => (replies, Some(TransportError::Cancelled { serial: target })),
            Err(e) => {
                debug!(error = ?e, "dispatch failed");
                (Vec::new(), Some(e))
            }
        }
    }

    async fn try_dispatch(&self, message: Arc<dyn Message>, target: Option<DeviceIdentity>, options: &SendOptions) -> Result<WaitOutcome, TransportError> {
        let did_broadcast = options.broadcast.is_some() || target.is_none();
        let transport = self.resolve_transport(message.as_ref(), target, did_broadcast, options).await?;

        let key = ReplyKey::new(self.inner.source, self.sequence(target), target);
        let retry_options = self.inner.transports.retry_options_for(message.as_ref(), transport.as_ref(), &self.inner.config.retry_options);
        let writer = Writer::new(transport, message.as_ref(), key, options.connect_timeout)?;
        let exchange = Exchange::new(key, message, retry_options, did_broadcast, options.allow_zero);
        let mut waiter = Waiter::new(Arc::new(self.inner.stop.clone()), writer, exchange, self.inner.receiver.clone(), options.no_retry);

        let _permit = match &options.limit {
            Some(limit) => Some(limit.acquire().await
                .map_err(|_| TransportError::Cancelled { serial: target })?),
            None => None,
        };

        trace!(?key, did_broadcast, "starting exchange");
        waiter.wait(Instant::now() + options.timeout).await
    }

    async fn resolve_transport(&self, message: &dyn Message, target: Option<DeviceIdentity>, did_broadcast: bool, options: &SendOptions) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(transport) = &options.transport {
            return Ok(transport.clone());
        }

        let serial = match target {
            Some(serial) if !did_broadcast => serial,
            _ => {
                let addr = options.broadcast
                    .unwrap_or(Broadcast::Default)
                    .resolve(&self.inner.config);
                return Ok(self.broadcast_transport(addr).await);
            }
        };

        let found = self.inner.found.read().await;
        let services = found.lookup(&serial)
            .map_err(|_| TransportError::FailedToFindDevice { serial })?;
        self.inner.transports.choose_transport(serial, message, services)
    }
}
