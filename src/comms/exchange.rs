use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::comms::codec::{ItemCount, Message, Reply, ReplyShape};
use crate::comms::device_identity::DeviceIdentity;
use crate::comms::retry_options::RetryOptions;
use crate::signal::{Completion, Signal};

/// What replies are matched on: the session's source id, the sequence number stamped into the
///  outbound packet, and the target. Replies to a broadcast exchange match on the blank target.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ReplyKey {
    pub source: u32,
    pub sequence: u8,
    pub target: Option<DeviceIdentity>,
}

impl ReplyKey {
    pub fn new(source: u32, sequence: u8, target: Option<DeviceIdentity>) -> ReplyKey {
        ReplyKey { source, sequence, target }
    }

    pub fn broadcast(&self) -> ReplyKey {
        ReplyKey {
            target: None,
            ..*self
        }
    }
}

/// Tracks items for [ReplyShape::DynamicCount]: the first reply announces the total, and the
///  exchange is done once the items of all replies add up to it
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DynamicCount {
    total: Option<usize>,
    seen: usize,
}

impl DynamicCount {
    /// returns `true` when the announced total is reached
    pub fn add(&mut self, count: Option<ItemCount>) -> bool {
        match count {
            Some(count) => {
                if self.total.is_none() {
                    self.total = Some(count.total);
                }
                self.seen += count.items;
            }
            None => self.seen += 1,
        }

        match self.total {
            Some(total) => self.seen >= total,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Complete,
    /// complete unless another reply arrives within the given time
    SettleAfter(Duration),
}

/// Evaluates the completion predicate for one exchange as replies arrive
pub struct ReplyAccumulator {
    ack_required: bool,
    res_required: bool,
    shape: ReplyShape,
    did_broadcast: bool,

    replies: Vec<Reply>,
    num_results: usize,
    dynamic: DynamicCount,
    last_ack_received: Option<Instant>,
    last_res_received: Option<Instant>,
}

impl ReplyAccumulator {
    pub fn new(message: &dyn Message, did_broadcast: bool) -> ReplyAccumulator {
        ReplyAccumulator {
            ack_required: message.ack_required(),
            res_required: message.res_required(),
            shape: message.reply_shape(),
            did_broadcast,
            replies: Vec::new(),
            num_results: 0,
            dynamic: Default::default(),
            last_ack_received: None,
            last_res_received: None,
        }
    }

    pub fn replies(&self) -> &[Reply] {
        &self.replies
    }

    pub fn add(&mut self, reply: Reply, retry_options: &RetryOptions, now: Instant) -> Progress {
        if reply.packet.is_ack() {
            self.last_ack_received = Some(now);
            if self.res_required {
                return Progress::Pending;
            }
            self.replies.push(reply);
            return if self.did_broadcast {
                Progress::SettleAfter(retry_options.gap_between_results)
            }
            else {
                Progress::Complete
            };
        }

        if !self.res_required {
            trace!(?reply, "ignoring response to a message that did not ask for one");
            return Progress::Pending;
        }

        self.last_res_received = Some(now);
        self.num_results += 1;
        let count = reply.packet.item_count();
        self.replies.push(reply);

        if self.did_broadcast {
            return Progress::SettleAfter(retry_options.gap_between_results);
        }

        match self.shape {
            ReplyShape::Single => Progress::Complete,
            ReplyShape::FixedCount(n) if self.num_results >= n => Progress::Complete,
            ReplyShape::FixedCount(_) => Progress::Pending,
            ReplyShape::DynamicCount => {
                if self.dynamic.add(count) {
                    Progress::Complete
                }
                else {
                    Progress::Pending
                }
            }
            ReplyShape::Unbounded => Progress::SettleAfter(retry_options.finish_multi_gap),
        }
    }

    /// `true` if part of the answer arrived recently enough that re-sending would be premature
    pub fn should_wait_for_result(&self, retry_options: &RetryOptions, now: Instant) -> bool {
        let recent = |t: Option<Instant>, gap: Duration| match t {
            Some(t) => now.saturating_duration_since(t) < gap,
            None => false,
        };

        if self.ack_required && self.res_required {
            if self.last_ack_received.is_none() {
                return false;
            }
            if self.num_results > 0 {
                return recent(self.last_res_received, retry_options.gap_between_results);
            }
            return recent(self.last_ack_received, retry_options.gap_between_ack_and_res);
        }
        if self.ack_required {
            return self.last_ack_received.is_some();
        }
        if self.res_required {
            return recent(self.last_res_received, retry_options.gap_between_results);
        }
        false
    }
}

/// One outbound packet waiting for its replies. The receiver feeds packets in, and `done` is
///  resolved with the accumulated replies once the completion predicate is satisfied.
pub struct Exchange {
    key: ReplyKey,
    message: Arc<dyn Message>,
    retry_options: RetryOptions,
    allow_zero: bool,
    state: Mutex<ExchangeState>,
    done: Signal<Vec<Reply>>,
}

struct ExchangeState {
    accumulator: ReplyAccumulator,
    settle_timer: Option<JoinHandle<()>>,
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Exchange({:?}, {:?})", self.key, self.message)
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if let Some(timer) = self.lock_state().settle_timer.take() {
            timer.abort();
        }
    }
}

impl Exchange {
    pub fn new(key: ReplyKey, message: Arc<dyn Message>, retry_options: RetryOptions, did_broadcast: bool, allow_zero: bool) -> Arc<Exchange> {
        let accumulator = ReplyAccumulator::new(message.as_ref(), did_broadcast);
        Arc::new(Exchange {
            key,
            message,
            retry_options,
            allow_zero,
            state: Mutex::new(ExchangeState {
                accumulator,
                settle_timer: None,
            }),
            done: Signal::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ExchangeState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn key(&self) -> ReplyKey {
        self.key
    }

    pub fn message(&self) -> &Arc<dyn Message> {
        &self.message
    }

    pub fn retry_options(&self) -> &RetryOptions {
        &self.retry_options
    }

    pub fn allow_zero(&self) -> bool {
        self.allow_zero
    }

    pub fn done(&self) -> &Signal<Vec<Reply>> {
        &self.done
    }

    /// replies so far, whether or not the exchange is complete
    pub fn replies(&self) -> Vec<Reply> {
        self.lock_state().accumulator.replies().to_vec()
    }

    pub fn should_wait_for_result(&self) -> bool {
        self.lock_state().accumulator.should_wait_for_result(&self.retry_options, Instant::now())
    }

    /// for messages that expect no reply at all
    pub fn complete_without_reply(&self) {
        self.done.resolve(Vec::new());
    }

    /// Panics outside a tokio runtime if the reply starts a settle timer
    pub fn add_packet(self: &Arc<Self>, mut reply: Reply) {
        if self.done.is_done() {
            trace!(?reply, "exchange is complete, dropping late reply");
            return;
        }
        if !reply.packet.is_ack() && !self.message.is_expected_reply(reply.packet.as_ref()) {
            debug!(?reply, message = ?self.message, "dropping reply of unexpected type");
            return;
        }
        reply.sender_message = Some(self.message.clone());

        let mut state = self.lock_state();
        match state.accumulator.add(reply, &self.retry_options, Instant::now()) {
            Progress::Pending => {}
            Progress::Complete => {
                if let Some(timer) = state.settle_timer.take() {
                    timer.abort();
                }
                self.done.resolve(state.accumulator.replies().to_vec());
            }
            Progress::SettleAfter(gap) => {
                if let Some(timer) = state.settle_timer.take() {
                    timer.abort();
                }
                let exchange = Arc::downgrade(self);
                state.settle_timer = Some(tokio::spawn(async move {
                    sleep(gap).await;
                    if let Some(exchange) = exchange.upgrade() {
                        let replies = exchange.replies();
                        trace!(key = ?exchange.key, num_replies = replies.len(), "exchange settled");
                        exchange.done.resolve(replies);
                    }
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use rstest::rstest;
    use bytes::Bytes;
    use tokio::runtime::Builder;
    use crate::comms::ack::Acknowledgement;
    use crate::comms::codec::Packet;
    use crate::signal::Outcome;
    use crate::test_util::message::{TestMessage, TestPacket};
    use super::*;

    fn target() -> DeviceIdentity {
        DeviceIdentity::new([0xd0, 0x73, 0xd5, 0, 0, 1])
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 56700))
    }

    fn ack() -> Reply {
        Reply::new(Arc::new(Acknowledgement { source: 5, sequence: 1, target: Some(target()) }), addr())
    }

    fn res(pkt_type: u16, item_count: Option<ItemCount>) -> Reply {
        let packet = TestPacket {
            item_count,
            ..TestPacket::reply(5, 1, Some(target()), pkt_type)
        };
        Reply::new(Arc::new(packet), addr())
    }

    fn count(total: usize, items: usize) -> Option<ItemCount> {
        Some(ItemCount { total, items })
    }

    fn run(f: impl std::future::Future<Output = ()>) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(f);
    }

    #[rstest]
    #[case::announced(vec![count(5, 2), count(99, 2), count(0, 1)], vec![false, false, true])]
    #[case::first_is_everything(vec![count(3, 3)], vec![true])]
    #[case::overshoot(vec![count(2, 1), count(2, 4)], vec![false, true])]
    #[case::unannounced(vec![None, None], vec![false, false])]
    #[case::late_announcement(vec![None, count(3, 1), count(3, 1)], vec![false, false, true])]
    fn test_dynamic_count(#[case] counts: Vec<Option<ItemCount>>, #[case] expected: Vec<bool>) {
        let mut dynamic = DynamicCount::default();
        let actual = counts.into_iter()
            .map(|c| dynamic.add(c))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::ack_only(TestMessage::set(), false, vec![ack()], vec![Progress::Complete])]
    #[case::ack_only_ignores_res(TestMessage::set(), false, vec![res(101, None), ack()], vec![Progress::Pending, Progress::Complete])]
    #[case::ack_then_res(TestMessage::get().with_ack(), false, vec![ack(), res(101, None)], vec![Progress::Pending, Progress::Complete])]
    #[case::single(TestMessage::get(), false, vec![res(101, None)], vec![Progress::Complete])]
    #[case::fixed(TestMessage::get().with_shape(ReplyShape::FixedCount(3)), false, vec![res(101, None), res(101, None), res(101, None)],
        vec![Progress::Pending, Progress::Pending, Progress::Complete])]
    #[case::dynamic(TestMessage::get().with_shape(ReplyShape::DynamicCount), false, vec![res(101, count(4, 2)), res(101, count(4, 2))],
        vec![Progress::Pending, Progress::Complete])]
    #[case::unbounded(TestMessage::get().with_shape(ReplyShape::Unbounded), false, vec![res(101, None)],
        vec![Progress::SettleAfter(Duration::from_millis(400))])]
    #[case::broadcast(TestMessage::get(), true, vec![res(101, None), res(101, None)],
        vec![Progress::SettleAfter(Duration::from_millis(350)), Progress::SettleAfter(Duration::from_millis(350))])]
    #[case::broadcast_ack(TestMessage::set(), true, vec![ack()], vec![Progress::SettleAfter(Duration::from_millis(350))])]
    fn test_accumulator(#[case] message: TestMessage, #[case] did_broadcast: bool, #[case] replies: Vec<Reply>, #[case] expected: Vec<Progress>) {
        run(async {
            let mut accumulator = ReplyAccumulator::new(&message, did_broadcast);
            let retry_options = RetryOptions::default();
            let actual = replies.into_iter()
                .map(|r| accumulator.add(r, &retry_options, Instant::now()))
                .collect::<Vec<_>>();
            assert_eq!(actual, expected);
        });
    }

    #[rstest]
    #[case::nothing_yet(TestMessage::get().with_ack(), vec![], 0, false)]
    #[case::fresh_ack(TestMessage::get().with_ack(), vec![ack()], 100, true)]
    #[case::stale_ack(TestMessage::get().with_ack(), vec![ack()], 200, false)]
    #[case::ack_and_partial_res(TestMessage::get().with_ack().with_shape(ReplyShape::FixedCount(2)), vec![ack(), res(101, None)], 300, true)]
    #[case::ack_and_stale_res(TestMessage::get().with_ack().with_shape(ReplyShape::FixedCount(2)), vec![ack(), res(101, None)], 350, false)]
    #[case::partial_res(TestMessage::get().with_shape(ReplyShape::FixedCount(2)), vec![res(101, None)], 349, true)]
    #[case::stale_partial_res(TestMessage::get().with_shape(ReplyShape::FixedCount(2)), vec![res(101, None)], 351, false)]
    #[case::fire_and_forget(TestMessage::fire_and_forget(), vec![], 0, false)]
    fn test_should_wait_for_result(#[case] message: TestMessage, #[case] replies: Vec<Reply>, #[case] elapsed_millis: u64, #[case] expected: bool) {
        run(async {
            let start = Instant::now();
            let mut accumulator = ReplyAccumulator::new(&message, false);
            let retry_options = RetryOptions::default();
            for r in replies {
                accumulator.add(r, &retry_options, start);
            }
            let now = start + Duration::from_millis(elapsed_millis);
            assert_eq!(accumulator.should_wait_for_result(&retry_options, now), expected);
        });
    }

    #[test]
    fn test_exchange_completes() {
        run(async {
            let message = Arc::new(TestMessage::get().with_shape(ReplyShape::FixedCount(2)));
            let exchange = Exchange::new(ReplyKey::new(5, 1, Some(target())), message, RetryOptions::default(), false, false);

            exchange.add_packet(res(101, None));
            assert!(!exchange.done().is_done());
            assert_eq!(exchange.replies().len(), 1);

            exchange.add_packet(res(101, None));
            let replies = exchange.done().outcome().and_then(|o| o.value()).unwrap();
            assert_eq!(replies.len(), 2);
            assert!(replies.iter().all(|r| r.sender_message.is_some()));

            // late duplicates are dropped
            exchange.add_packet(res(101, None));
            assert_eq!(exchange.replies().len(), 2);
        });
    }

    #[test]
    fn test_exchange_keeps_arrival_order() {
        run(async {
            let message = Arc::new(TestMessage::get()
                .with_shape(ReplyShape::DynamicCount)
                .with_reply_type(TestMessage::MULTI_REPLY_TYPE));
            let exchange = Exchange::new(ReplyKey::new(5, 1, Some(target())), message, RetryOptions::default(), false, false);

            let chunk = |n: u8, items: usize| {
                let packet = TestPacket {
                    payload: Bytes::from(vec![n]),
                    item_count: count(5, items),
                    ..TestPacket::reply(5, 1, Some(target()), TestMessage::MULTI_REPLY_TYPE)
                };
                Reply::new(Arc::new(packet), addr())
            };
            exchange.add_packet(chunk(3, 2));
            exchange.add_packet(chunk(1, 1));
            exchange.add_packet(chunk(2, 2));

            let replies = exchange.done().outcome().and_then(|o| o.value()).unwrap();
            let order = replies.iter()
                .map(|r| r.downcast::<TestPacket>().unwrap().payload[0])
                .collect::<Vec<_>>();
            assert_eq!(order, vec![3, 1, 2]);
        });
    }

    #[test]
    fn test_exchange_drops_unexpected_type() {
        run(async {
            let message = Arc::new(TestMessage::get());
            let exchange = Exchange::new(ReplyKey::new(5, 1, Some(target())), message, RetryOptions::default(), false, false);

            exchange.add_packet(res(999, None));
            assert!(!exchange.done().is_done());
            assert!(exchange.replies().is_empty());
        });
    }

    #[test]
    fn test_exchange_settles_after_quiet_gap() {
        run(async {
            let message = Arc::new(TestMessage::get().with_shape(ReplyShape::Unbounded));
            let exchange = Exchange::new(ReplyKey::new(5, 1, Some(target())), message, RetryOptions::default(), false, false);

            exchange.add_packet(res(101, None));
            sleep(Duration::from_millis(300)).await;
            assert!(!exchange.done().is_done());

            // restarts the quiet gap
            exchange.add_packet(res(101, None));
            sleep(Duration::from_millis(300)).await;
            assert!(!exchange.done().is_done());

            match exchange.done().wait().await {
                Outcome::Value(replies) => assert_eq!(replies.len(), 2),
                other => panic!("unexpected outcome {:?}", other),
            }
        });
    }

    #[test]
    #[should_panic]
    fn test_settle_timer_needs_runtime() {
        let exchange = Exchange::new(ReplyKey::new(5, 1, None), Arc::new(TestMessage::get()), RetryOptions::default(), true, false);
        exchange.add_packet(res(101, None));
    }

    #[test]
    fn test_packet_fields() {
        let reply = res(101, None);
        assert_eq!(reply.packet.source(), 5);
        assert_eq!(reply.serial(), Some(target()));
        assert!(reply.downcast::<TestPacket>().is_some());
        assert!(reply.downcast::<Acknowledgement>().is_none());
    }
}
