use std::cmp::max;
use std::time::Duration;

use anyhow::bail;
use tokio::time::{sleep_until, Instant};

/// Timing for re-sending a packet and for deciding that a multi-reply exchange is complete.
///
/// `timeouts` is a list of `(step, until)` pairs. [RetryOptions::next_time] grows a cumulative
///  value by the current pair's step until the value reaches that pair's `until`, then moves on to
///  the next pair. Once the last pair is exhausted, the value stays where it is.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    pub timeouts: Vec<(Duration, Duration)>,

    /// quiet period after the latest reply that completes an exchange with an unbounded number
    ///  of replies
    pub finish_multi_gap: Duration,
    /// quiet period after the latest reply that completes a broadcast exchange
    pub gap_between_results: Duration,
    /// after an ack, how long to hold off re-sending while waiting for the actual response
    pub gap_between_ack_and_res: Duration,
    /// how soon to look again after deciding not to re-send yet
    pub next_check_after_wait_for_result: Duration,

    timeout: Option<Duration>,
    timeout_item: usize,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            timeouts: vec![
                (Duration::from_millis(200), Duration::from_millis(200)),
                (Duration::from_millis(100), Duration::from_millis(500)),
                (Duration::from_millis(200), Duration::from_secs(1)),
                (Duration::from_secs(1), Duration::from_secs(5)),
            ],
            finish_multi_gap: Duration::from_millis(400),
            gap_between_results: Duration::from_millis(350),
            gap_between_ack_and_res: Duration::from_millis(200),
            next_check_after_wait_for_result: Duration::from_millis(100),
            timeout: None,
            timeout_item: 0,
        }
    }
}

impl RetryOptions {
    pub fn with_timeouts(timeouts: Vec<(Duration, Duration)>) -> anyhow::Result<RetryOptions> {
        let result = RetryOptions {
            timeouts,
            ..Default::default()
        };
        result.validate()?;
        Ok(result)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeouts.is_empty() {
            bail!("retry timeouts must not be empty");
        }
        if self.timeouts.iter().any(|(step, _)| step.is_zero()) {
            bail!("retry timeout steps must be positive: {:?}", self.timeouts);
        }
        Ok(())
    }

    /// The next value of the cumulative retry schedule. Each call advances the schedule.
    pub fn next_time(&mut self) -> Duration {
        let timeout = match self.timeout {
            None => {
                self.timeout_item = 0;
                self.timeouts[0].0
            }
            Some(timeout) => {
                if timeout >= self.timeouts[self.timeout_item].1 {
                    if self.timeout_item + 1 >= self.timeouts.len() {
                        return timeout;
                    }
                    self.timeout_item += 1;
                }
                timeout + self.timeouts[self.timeout_item].0
            }
        };
        self.timeout = Some(timeout);
        timeout
    }

    /// Iterates over a copy of these options, starting the schedule from scratch
    pub fn iterator(&self, end_after: Duration) -> RetryIterator {
        let mut options = self.clone();
        options.timeout = None;
        options.timeout_item = 0;
        RetryIterator::new(end_after, options)
    }
}

/// Paces repeated attempts until a deadline: each call to [RetryIterator::next] waits for the next
///  tick of the retry schedule and returns how much time is left overall and until the tick after.
///  Ticks that already passed while the caller was busy are skipped.
pub struct RetryIterator {
    end_at: Instant,
    next_at: Instant,
    options: RetryOptions,
    started: bool,
}

impl RetryIterator {
    fn new(end_after: Duration, options: RetryOptions) -> RetryIterator {
        let now = Instant::now();
        RetryIterator {
            end_at: now + end_after,
            next_at: now,
            options,
            started: false,
        }
    }

    /// `(end_in, time_till_next)`, or `None` once the end is reached
    pub async fn next(&mut self) -> Option<(Duration, Duration)> {
        if self.started {
            let now = Instant::now();
            if max(now, self.next_at) >= self.end_at {
                return None;
            }
            sleep_until(self.next_at).await;
        }
        self.started = true;

        let now = Instant::now();
        while self.next_at <= now {
            self.next_at += self.options.next_time();
        }
        Some((
            self.end_at.saturating_duration_since(now),
            self.next_at.saturating_duration_since(now),
        ))
    }
}
