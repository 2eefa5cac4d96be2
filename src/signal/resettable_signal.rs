use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::select;
use tokio::sync::watch;

use crate::signal::{Completion, DoneCallback, Outcome, Signal};

/// A signal that can be re-armed after it completed.
///
/// `reset()` swaps in a fresh pending signal. Tasks already waiting follow along to the new
///  signal, so they never observe the value from before the reset. Callbacks registered with
///  `on_done` belong to the signal that was current at the time.
pub struct ResettableSignal<T> {
    inner: Arc<ResettableInner<T>>,
}

struct ResettableInner<T> {
    current: Mutex<Signal<T>>,
    /// incremented after every swap
    generation: watch::Sender<u64>,
}

impl<T> Clone for ResettableSignal<T> {
    fn clone(&self) -> Self {
        ResettableSignal { inner: self.inner.clone() }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ResettableSignal<T> {
    fn default() -> Self {
        ResettableSignal::new()
    }
}

fn lock<X>(mutex: &Mutex<X>) -> MutexGuard<'_, X> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<T: Clone + Send + Sync + 'static> ResettableSignal<T> {
    pub fn new() -> ResettableSignal<T> {
        let (generation, _) = watch::channel(0);
        ResettableSignal {
            inner: Arc::new(ResettableInner {
                current: Mutex::new(Signal::new()),
                generation,
            }),
        }
    }

    fn current(&self) -> Signal<T> {
        lock(&self.inner.current).clone()
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    pub fn resolve(&self, value: T) -> bool {
        self.current().resolve(value)
    }

    pub fn fail(&self, error: crate::errors::TransportError) -> bool {
        self.current().fail(error)
    }

    /// Replaces the current signal with a fresh pending one
    pub fn reset(&self) {
        let mut current = lock(&self.inner.current);
        *current = Signal::new();
        self.inner.generation.send_modify(|g| *g += 1);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Completion<T> for ResettableSignal<T> {
    fn is_done(&self) -> bool {
        self.current().is_done()
    }

    fn is_cancelled(&self) -> bool {
        self.current().is_cancelled()
    }

    fn outcome(&self) -> Option<Outcome<T>> {
        self.current().outcome()
    }

    fn on_done(&self, callback: DoneCallback<T>) {
        self.current().on_done(callback)
    }

    fn cancel(&self) -> bool {
        self.current().cancel()
    }

    async fn wait(&self) -> Outcome<T> {
        loop {
            // subscribe before looking at the current signal so no reset can slip through
            let mut generation = self.inner.generation.subscribe();
            let current = self.current();

            select! {
                biased;
                _ = generation.changed() => continue,
                outcome = current.wait() => {
                    if generation.has_changed().unwrap_or(false) {
                        continue;
                    }
                    return outcome;
                }
            }
        }
    }
}
