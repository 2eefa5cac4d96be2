use std::future::pending;
use std::sync::Arc;

use tokio::select;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, trace};

use crate::comms::codec::Reply;
use crate::comms::exchange::Exchange;
use crate::comms::receiver::Receiver;
use crate::comms::retry_options::RetryOptions;
use crate::comms::writer::PacketWriter;
use crate::errors::TransportError;
use crate::signal::{ChildSignal, Completion, Outcome, ResettableSignal};

#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Satisfied(Vec<Reply>),
    /// with whatever arrived before the deadline
    TimedOut(Vec<Reply>),
    Cancelled(Vec<Reply>),
}

/// Unregisters the exchange however the waiter's future ends, including by being dropped
struct Registration<'a> {
    receiver: &'a Receiver,
    exchange: &'a Arc<Exchange>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.receiver.unregister(self.exchange);
    }
}

/// Drives one exchange: writes, waits for the first of 'complete', 'deadline', 'shutdown' or
///  'time to retry', and writes again on the latter.
pub struct Waiter<W: PacketWriter> {
    stop: ChildSignal<()>,
    writer: W,
    exchange: Arc<Exchange>,
    receiver: Arc<Receiver>,
    retry_options: RetryOptions,
    no_retry: bool,
    retry_tick: ResettableSignal<()>,
    num_writes: usize,
}

impl<W: PacketWriter> Waiter<W> {
    pub fn new(stop_parent: Arc<dyn Completion<()>>, writer: W, exchange: Arc<Exchange>, receiver: Arc<Receiver>, no_retry: bool) -> Waiter<W> {
        let retry_options = exchange.retry_options().clone();
        Waiter {
            stop: ChildSignal::new(stop_parent),
            writer,
            exchange,
            receiver,
            retry_options,
            no_retry,
            retry_tick: ResettableSignal::new(),
            num_writes: 0,
        }
    }

    pub fn num_writes(&self) -> usize {
        self.num_writes
    }

    pub async fn wait(&mut self, deadline: Instant) -> Result<WaitOutcome, TransportError> {
        let receiver = self.receiver.clone();
        let exchange = self.exchange.clone();
        receiver.register(exchange.clone());
        let _registration = Registration { receiver: &receiver, exchange: &exchange };

        let result = self.run(deadline).await;
        self.stop.cancel();
        result
    }

    async fn run(&mut self, deadline: Instant) -> Result<WaitOutcome, TransportError> {
        loop {
            if let Some(outcome) = self.exchange.done().outcome() {
                return self.map_outcome(outcome);
            }
            if self.stop.is_done() {
                return self.map_stop(self.stop.outcome().unwrap_or(Outcome::Cancelled));
            }

            let wrote = if self.num_writes == 0 || !self.exchange.should_wait_for_result() {
                // connecting can take up to the connect timeout
                select! {
                    result = self.writer.write() => result?,
                    outcome = self.stop.wait() => return self.map_stop(outcome),
                    _ = sleep_until(deadline) => return Ok(self.timed_out()),
                }
                self.num_writes += 1;
                trace!(key = ?self.exchange.key(), num_writes = self.num_writes, "wrote packet");

                if !self.writer.expects_reply() {
                    self.exchange.complete_without_reply();
                    continue;
                }
                true
            }
            else {
                false
            };

            let delay = if self.no_retry {
                None
            }
            else if wrote {
                Some(self.retry_options.next_time())
            }
            else {
                Some(self.retry_options.next_check_after_wait_for_result)
            };

            self.retry_tick.reset();
            let timer = delay.map(|delay| {
                let tick = self.retry_tick.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    tick.resolve(());
                })
            });

            let tick = &self.retry_tick;
            let next_tick = async move {
                match delay {
                    Some(_) => { tick.wait().await; }
                    None => pending::<()>().await,
                }
            };

            let finished = select! {
                outcome = self.exchange.done().wait() => Some(self.map_outcome(outcome)),
                outcome = self.stop.wait() => Some(self.map_stop(outcome)),
                _ = sleep_until(deadline) => Some(Ok(self.timed_out())),
                _ = next_tick => None,
            };

            if let Some(timer) = timer {
                timer.abort();
            }
            if let Some(result) = finished {
                return result;
            }
        }
    }

    fn timed_out(&self) -> WaitOutcome {
        debug!(key = ?self.exchange.key(), num_writes = self.num_writes, "deadline reached");
        WaitOutcome::TimedOut(self.exchange.replies())
    }

    fn map_outcome(&self, outcome: Outcome<Vec<Reply>>) -> Result<WaitOutcome, TransportError> {
        match outcome {
            Outcome::Value(replies) => Ok(WaitOutcome::Satisfied(replies)),
            Outcome::Cancelled => Ok(WaitOutcome::Cancelled(self.exchange.replies())),
            Outcome::Failed(e) => Err(e),
        }
    }

    fn map_stop(&self, outcome: Outcome<()>) -> Result<WaitOutcome, TransportError> {
        match outcome {
            Outcome::Failed(e) => Err(e),
            Outcome::Value(_) | Outcome::Cancelled => {
                debug!(key = ?self.exchange.key(), "exchange stopped");
                Ok(WaitOutcome::Cancelled(self.exchange.replies()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::comms::codec::ReplyShape;
    use crate::comms::device_identity::DeviceIdentity;
    use crate::comms::exchange::ReplyKey;
    use crate::comms::writer::{MockPacketWriter, Writer};
    use crate::signal::Signal;
    use crate::test_util::fake::SlowConnectTransport;
    use crate::test_util::message::{TestMessage, TestPacket};
    use super::*;

    fn target() -> Option<DeviceIdentity> {
        Some(DeviceIdentity::new([0xd0, 0x73, 0xd5, 0, 0, 1]))
    }

    fn key() -> ReplyKey {
        ReplyKey::new(7, 1, target())
    }

    fn reply() -> Reply {
        Reply::new(Arc::new(TestPacket::reply(7, 1, target(), TestMessage::GET_REPLY_TYPE)), SocketAddr::from(([10, 0, 0, 1], 56700)))
    }

    fn writer(expected_writes: usize, writes: Arc<AtomicUsize>) -> MockPacketWriter {
        let mut writer = MockPacketWriter::new();
        writer.expect_write()
            .times(expected_writes)
            .returning(move || {
                writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        writer.expect_expects_reply().return_const(true);
        writer
    }

    fn run(f: impl std::future::Future<Output = ()>) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(f);
    }

    #[test]
    fn test_fixed_count_resolves_and_unregisters() {
        run(async {
            let root = Signal::<()>::new();
            let receiver = Arc::new(Receiver::new());
            let message = Arc::new(TestMessage::get().with_shape(ReplyShape::FixedCount(3)));
            let exchange = Exchange::new(key(), message, RetryOptions::default(), false, false);

            let writes = Arc::new(AtomicUsize::new(0));
            let mut waiter = Waiter::new(Arc::new(root.clone()), writer(1, writes.clone()), exchange, receiver.clone(), false);

            let r = receiver.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                for _ in 0..3 {
                    r.recv(reply(), false);
                }
            });

            match waiter.wait(Instant::now() + Duration::from_secs(5)).await.unwrap() {
                WaitOutcome::Satisfied(replies) => assert_eq!(replies.len(), 3),
                other => panic!("unexpected outcome {:?}", other),
            }
            assert!(!receiver.is_registered(&key()));
            assert_eq!(writes.load(Ordering::SeqCst), 1);
            assert!(!root.is_done());
        });
    }

    #[rstest]
    #[case::single(ReplyShape::Single)]
    #[case::fixed(ReplyShape::FixedCount(2))]
    #[case::unbounded(ReplyShape::Unbounded)]
    fn test_no_retry_writes_once(#[case] shape: ReplyShape) {
        run(async {
            let root = Signal::<()>::new();
            let receiver = Arc::new(Receiver::new());
            let exchange = Exchange::new(key(), Arc::new(TestMessage::get().with_shape(shape)), RetryOptions::default(), false, false);

            let writes = Arc::new(AtomicUsize::new(0));
            let mut waiter = Waiter::new(Arc::new(root.clone()), writer(1, writes.clone()), exchange, receiver.clone(), true);

            let result = waiter.wait(Instant::now() + Duration::from_secs(3)).await.unwrap();
            assert!(matches!(result, WaitOutcome::TimedOut(ref r) if r.is_empty()));
            assert_eq!(waiter.num_writes(), 1);
            assert!(!receiver.is_registered(&key()));
        });
    }

    #[test]
    fn test_retries_follow_schedule() {
        run(async {
            let root = Signal::<()>::new();
            let receiver = Arc::new(Receiver::new());
            let exchange = Exchange::new(key(), Arc::new(TestMessage::get()), RetryOptions::default(), false, false);

            // writes at 0, 200, 500, 900, 1400 - the next one would be at 2100
            let writes = Arc::new(AtomicUsize::new(0));
            let start = Instant::now();
            let mut waiter = Waiter::new(Arc::new(root.clone()), writer(5, writes.clone()), exchange, receiver.clone(), false);

            let result = waiter.wait(start + Duration::from_secs(2)).await.unwrap();
            assert!(matches!(result, WaitOutcome::TimedOut(_)));
            assert_eq!(Instant::now() - start, Duration::from_secs(2));
            assert_eq!(writes.load(Ordering::SeqCst), 5);
        });
    }

    #[test]
    fn test_ack_suppresses_retry() {
        run(async {
            let root = Signal::<()>::new();
            let receiver = Arc::new(Receiver::new());
            let exchange = Exchange::new(key(), Arc::new(TestMessage::get().with_ack()), RetryOptions::default(), false, false);

            let writes = Arc::new(AtomicUsize::new(0));
            let mut waiter = Waiter::new(Arc::new(root.clone()), writer(1, writes.clone()), exchange, receiver.clone(), false);

            let r = receiver.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(150)).await;
                let ack = crate::comms::ack::Acknowledgement { source: 7, sequence: 1, target: target() };
                r.recv(Reply::new(Arc::new(ack), SocketAddr::from(([10, 0, 0, 1], 56700))), false);
                sleep(Duration::from_millis(150)).await;
                r.recv(reply(), false);
            });

            match waiter.wait(Instant::now() + Duration::from_secs(5)).await.unwrap() {
                WaitOutcome::Satisfied(replies) => assert_eq!(replies.len(), 1),
                other => panic!("unexpected outcome {:?}", other),
            }
        });
    }

    #[test]
    fn test_fire_and_forget() {
        run(async {
            let root = Signal::<()>::new();
            let receiver = Arc::new(Receiver::new());
            let exchange = Exchange::new(key(), Arc::new(TestMessage::fire_and_forget()), RetryOptions::default(), false, false);

            let mut writer = MockPacketWriter::new();
            writer.expect_write().once().returning(|| Ok(()));
            writer.expect_expects_reply().return_const(false);
            let mut waiter = Waiter::new(Arc::new(root.clone()), writer, exchange, receiver.clone(), false);

            let result = waiter.wait(Instant::now() + Duration::from_secs(5)).await.unwrap();
            assert!(matches!(result, WaitOutcome::Satisfied(ref r) if r.is_empty()));
        });
    }

    #[test]
    fn test_root_shutdown_cancels() {
        run(async {
            let root = Signal::<()>::new();
            let session = ChildSignal::new(Arc::new(root.clone()));
            let receiver = Arc::new(Receiver::new());
            let exchange = Exchange::new(key(), Arc::new(TestMessage::get()), RetryOptions::default(), false, false);

            let writes = Arc::new(AtomicUsize::new(0));
            let mut waiter = Waiter::new(Arc::new(session), writer(2, writes.clone()), exchange, receiver.clone(), false);

            let r = root.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(300)).await;
                r.resolve(());
            });

            let result = waiter.wait(Instant::now() + Duration::from_secs(5)).await.unwrap();
            assert!(matches!(result, WaitOutcome::Cancelled(_)));
            assert!(!receiver.is_registered(&key()));
        });
    }

    #[test]
    fn test_write_error_propagates() {
        run(async {
            let root = Signal::<()>::new();
            let receiver = Arc::new(Receiver::new());
            let exchange = Exchange::new(key(), Arc::new(TestMessage::get()), RetryOptions::default(), false, false);

            let mut writer = MockPacketWriter::new();
            writer.expect_write().once().returning(|| Err(TransportError::WriteFailed { serial: target(), reason: "x".to_string() }));
            let mut waiter = Waiter::new(Arc::new(root.clone()), writer, exchange, receiver.clone(), false);

            let result = waiter.wait(Instant::now() + Duration::from_secs(5)).await;
            assert!(matches!(result, Err(TransportError::WriteFailed { .. })));
            assert!(!receiver.is_registered(&key()));
        });
    }

    fn slow_connect_writer() -> Writer {
        let transport = Arc::new(SlowConnectTransport { remote_addr: SocketAddr::from(([10, 0, 0, 1], 56700)) });
        Writer::new(transport, &TestMessage::get(), key(), Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_deadline_interrupts_connect() {
        run(async {
            let root = Signal::<()>::new();
            let receiver = Arc::new(Receiver::new());
            let exchange = Exchange::new(key(), Arc::new(TestMessage::get()), RetryOptions::default(), false, false);
            let mut waiter = Waiter::new(Arc::new(root.clone()), slow_connect_writer(), exchange, receiver.clone(), false);

            let start = Instant::now();
            let result = waiter.wait(start + Duration::from_secs(2)).await.unwrap();
            assert!(matches!(result, WaitOutcome::TimedOut(ref r) if r.is_empty()));
            assert_eq!(Instant::now() - start, Duration::from_secs(2));
            assert_eq!(waiter.num_writes(), 0);
            assert!(!receiver.is_registered(&key()));
        });
    }

    #[test]
    fn test_shutdown_interrupts_connect() {
        run(async {
            let root = Signal::<()>::new();
            let receiver = Arc::new(Receiver::new());
            let exchange = Exchange::new(key(), Arc::new(TestMessage::get()), RetryOptions::default(), false, false);
            let mut waiter = Waiter::new(Arc::new(root.clone()), slow_connect_writer(), exchange, receiver.clone(), false);

            let r = root.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(100)).await;
                r.resolve(());
            });

            let start = Instant::now();
            let result = waiter.wait(start + Duration::from_secs(30)).await.unwrap();
            assert!(matches!(result, WaitOutcome::Cancelled(_)));
            assert_eq!(Instant::now() - start, Duration::from_millis(100));
            assert!(!receiver.is_registered(&key()));
        });
    }
}
