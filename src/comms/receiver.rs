use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::comms::codec::Reply;
use crate::comms::exchange::{Exchange, ReplyKey};

pub type MessageCatcher = Arc<dyn Fn(Reply) + Send + Sync>;

/// pending exchanges with the order they were registered in
type Registry = FxHashMap<ReplyKey, (u64, Arc<Exchange>)>;

/// Routes inbound packets to the exchange waiting for them.
///
/// Packets nobody waits for are normal on a shared network (late replies, duplicates, traffic of
///  other sessions), so they are dropped quietly - or handed to the message catcher if there is one.
#[derive(Default)]
pub struct Receiver {
    exchanges: Mutex<Registry>,
    next_order: AtomicU64,
    message_catcher: RwLock<Option<MessageCatcher>>,
}

impl Receiver {
    pub fn new() -> Receiver {
        Default::default()
    }

    fn lock_exchanges(&self) -> MutexGuard<'_, Registry> {
        match self.exchanges.lock() {
            Ok(exchanges) => exchanges,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_message_catcher(&self, catcher: Option<MessageCatcher>) {
        match self.message_catcher.write() {
            Ok(mut c) => *c = catcher,
            Err(poisoned) => *poisoned.into_inner() = catcher,
        }
    }

    pub fn register(&self, exchange: Arc<Exchange>) {
        let key = exchange.key();
        trace!(?key, "registering exchange");
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.lock_exchanges().insert(key, (order, exchange)) {
            debug!(?key, ?previous, "replaced pending exchange with the same key");
        }
    }

    /// Only removes the registration if it is still `exchange`'s
    pub fn unregister(&self, exchange: &Arc<Exchange>) -> bool {
        let mut exchanges = self.lock_exchanges();
        match exchanges.get(&exchange.key()) {
            Some((_, registered)) if Arc::ptr_eq(registered, exchange) => {
                exchanges.remove(&exchange.key());
                trace!(key = ?exchange.key(), "unregistered exchange");
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, key: &ReplyKey) -> bool {
        self.lock_exchanges().contains_key(key)
    }

    pub fn num_registered(&self) -> usize {
        self.lock_exchanges().len()
    }

    /// `allow_zero` lets packets with zero source and sequence through. They match a pending
    ///  exchange that opted in to zero replies: one for the same target if there is any, a
    ///  broadcast exchange otherwise, the earliest registered among several candidates.
    ///
    /// Needs a tokio runtime, see [Exchange::add_packet].
    pub fn recv(&self, reply: Reply, allow_zero: bool) {
        let packet = &reply.packet;
        let key = ReplyKey::new(packet.source(), packet.sequence(), packet.target());
        let is_zero = key.source == 0 && key.sequence == 0;

        if is_zero && !allow_zero {
            debug!(?reply, "dropping packet with zero source and sequence");
            return;
        }

        let exchange = {
            let exchanges = self.lock_exchanges();
            let direct = exchanges.get(&key)
                .or_else(|| exchanges.get(&key.broadcast()))
                .map(|(_, e)| e.clone());
            if direct.is_none() && is_zero {
                exchanges.values()
                    .filter(|(_, e)| e.allow_zero() && (e.key().target.is_none() || e.key().target == key.target))
                    .min_by_key(|(order, e)| (e.key().target.is_none(), *order))
                    .map(|(_, e)| e.clone())
            }
            else {
                direct
            }
        };

        match exchange {
            Some(exchange) => {
                trace!(?key, "routing packet to exchange");
                exchange.add_packet(reply);
            }
            None => {
                let catcher = match self.message_catcher.read() {
                    Ok(c) => c.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                match catcher {
                    Some(catcher) => catcher(reply),
                    None => debug!(?reply, "dropping packet that matches no pending exchange"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::comms::ack::Acknowledgement;
    use crate::comms::device_identity::DeviceIdentity;
    use crate::comms::retry_options::RetryOptions;
    use crate::signal::Completion;
    use crate::test_util::message::{TestMessage, TestPacket};
    use super::*;

    fn target(n: u8) -> Option<DeviceIdentity> {
        Some(DeviceIdentity::new([0xd0, 0x73, 0xd5, 0, 0, n]))
    }

    fn reply(source: u32, sequence: u8, target: Option<DeviceIdentity>) -> Reply {
        Reply::new(Arc::new(TestPacket::reply(source, sequence, target, TestMessage::GET_REPLY_TYPE)), SocketAddr::from(([10, 0, 0, 1], 56700)))
    }

    fn exchange(source: u32, sequence: u8, target: Option<DeviceIdentity>, allow_zero: bool) -> Arc<Exchange> {
        Exchange::new(ReplyKey::new(source, sequence, target), Arc::new(TestMessage::get()), RetryOptions::default(), target.is_none(), allow_zero)
    }

    fn run(f: impl std::future::Future<Output = ()>) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(f);
    }

    #[rstest]
    #[case::exact(reply(7, 3, target(1)), true)]
    #[case::other_sequence(reply(7, 4, target(1)), false)]
    #[case::other_source(reply(8, 3, target(1)), false)]
    #[case::other_target(reply(7, 3, target(2)), false)]
    #[case::zero(reply(0, 0, target(1)), false)]
    fn test_routing(#[case] reply: Reply, #[case] expected_match: bool) {
        run(async {
            let receiver = Receiver::new();
            let exchange = exchange(7, 3, target(1), false);
            receiver.register(exchange.clone());

            receiver.recv(reply, false);
            assert_eq!(exchange.done().is_done(), expected_match);
        });
    }

    #[test]
    fn test_ack_routing() {
        run(async {
            let receiver = Receiver::new();
            let exchange = Exchange::new(ReplyKey::new(7, 3, target(1)), Arc::new(TestMessage::set()), RetryOptions::default(), false, false);
            receiver.register(exchange.clone());

            let ack = Acknowledgement { source: 7, sequence: 3, target: target(1) };
            receiver.recv(Reply::new(Arc::new(ack), SocketAddr::from(([10, 0, 0, 1], 56700))), false);
            assert!(exchange.done().is_done());
        });
    }

    #[test]
    fn test_broadcast_exchange_matches_any_device() {
        run(async {
            let receiver = Receiver::new();
            let exchange = exchange(7, 3, None, false);
            receiver.register(exchange.clone());

            receiver.recv(reply(7, 3, target(1)), false);
            receiver.recv(reply(7, 3, target(2)), false);
            assert_eq!(exchange.replies().len(), 2);
        });
    }

    #[rstest]
    #[case::opted_in(true, true)]
    #[case::not_opted_in(false, false)]
    fn test_allow_zero(#[case] exchange_allows_zero: bool, #[case] expected_match: bool) {
        run(async {
            let receiver = Receiver::new();
            let exchange = exchange(7, 3, target(1), exchange_allows_zero);
            receiver.register(exchange.clone());

            receiver.recv(reply(0, 0, target(1)), true);
            assert_eq!(exchange.done().is_done(), expected_match);
        });
    }

    #[test]
    fn test_zero_reply_prefers_target_then_earliest() {
        run(async {
            let receiver = Receiver::new();
            let broadcast = exchange(7, 1, None, true);
            let first = exchange(7, 2, target(1), true);
            let second = exchange(7, 3, target(1), true);
            receiver.register(broadcast.clone());
            receiver.register(first.clone());
            receiver.register(second.clone());

            receiver.recv(reply(0, 0, target(1)), true);
            assert!(first.done().is_done());
            assert!(second.replies().is_empty());
            assert!(broadcast.replies().is_empty());

            receiver.recv(reply(0, 0, target(2)), true);
            assert_eq!(broadcast.replies().len(), 1);
            assert!(second.replies().is_empty());
        });
    }

    #[test]
    fn test_unmatched_goes_to_catcher() {
        run(async {
            let receiver = Receiver::new();
            // no catcher: silently dropped
            receiver.recv(reply(7, 3, target(1)), false);

            let caught = Arc::new(AtomicUsize::new(0));
            let c = caught.clone();
            receiver.set_message_catcher(Some(Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); })));
            receiver.recv(reply(7, 3, target(1)), false);
            receiver.recv(reply(0, 0, target(1)), false);
            assert_eq!(caught.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_unregister_only_own_registration() {
        run(async {
            let receiver = Receiver::new();
            let first = exchange(7, 3, target(1), false);
            let second = exchange(7, 3, target(1), false);

            receiver.register(first.clone());
            receiver.register(second.clone());
            assert!(!receiver.unregister(&first));
            assert!(receiver.is_registered(&first.key()));

            assert!(receiver.unregister(&second));
            assert_eq!(receiver.num_registered(), 0);
        });
    }
}
