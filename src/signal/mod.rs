//! Completion signals used to coordinate shutdown and retry pacing.
//!
//! A signal starts out pending and completes exactly once, with a value, an error or by being
//!  cancelled. Any number of tasks can wait for it or poll it, and callbacks can be registered
//!  to run when it completes.
//!
//! [ChildSignal] is derived from a parent signal and additionally completes when the parent does:
//!  a parent's *value* is interpreted as 'this scope is shutting down' and turns into
//!  cancellation of the child. [ResettableSignal] can be re-armed after completing.

pub mod child_signal;
pub mod resettable_signal;

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::errors::TransportError;

pub use child_signal::ChildSignal;
pub use resettable_signal::ResettableSignal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Value(T),
    Failed(TransportError),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }
}

pub type DoneCallback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

/// The observable surface shared by all signal flavours, so they can be combined generically.
#[async_trait]
pub trait Completion<T: Clone + Send + Sync + 'static>: Send + Sync {
    fn is_done(&self) -> bool;

    fn is_cancelled(&self) -> bool;

    /// `None` while pending
    fn outcome(&self) -> Option<Outcome<T>>;

    /// Runs `callback` when the signal completes, or right away if it is done already
    fn on_done(&self, callback: DoneCallback<T>);

    fn cancel(&self) -> bool;

    async fn wait(&self) -> Outcome<T>;
}

/// A plain single-fire completion signal. Clones share the same state.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

struct SignalInner<T> {
    state: watch::Sender<Option<Outcome<T>>>,
    callbacks: Mutex<Vec<DoneCallback<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal { inner: self.inner.clone() }
    }
}

impl<T: Debug> Debug for Signal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signal({:?})", *self.inner.state.borrow())
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Signal<T> {
    fn default() -> Self {
        Signal::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Signal<T> {
    pub fn new() -> Signal<T> {
        let (state, _) = watch::channel(None);
        Signal {
            inner: Arc::new(SignalInner {
                state,
                callbacks: Default::default(),
            })
        }
    }

    /// returns `false` if the signal was completed before
    pub fn resolve(&self, value: T) -> bool {
        self.complete(Outcome::Value(value))
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.complete(Outcome::Failed(error))
    }

    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        let newly_completed = self.inner.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(outcome.clone());
            true
        });

        if newly_completed {
            let callbacks = match self.inner.callbacks.lock() {
                Ok(mut callbacks) => std::mem::take(&mut *callbacks),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            for callback in callbacks {
                callback(outcome.clone());
            }
        }
        newly_completed
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Completion<T> for Signal<T> {
    fn is_done(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    fn is_cancelled(&self) -> bool {
        matches!(*self.inner.state.borrow(), Some(Outcome::Cancelled))
    }

    fn outcome(&self) -> Option<Outcome<T>> {
        self.inner.state.borrow().clone()
    }

    fn on_done(&self, callback: DoneCallback<T>) {
        let mut callbacks = match self.inner.callbacks.lock() {
            Ok(callbacks) => callbacks,
            Err(poisoned) => poisoned.into_inner(),
        };
        // checked while holding the lock: complete() sets the state before it takes the callbacks
        let outcome = self.inner.state.borrow().clone();
        match outcome {
            Some(outcome) => {
                drop(callbacks);
                callback(outcome);
            }
            None => callbacks.push(callback),
        }
    }

    fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    async fn wait(&self) -> Outcome<T> {
        let mut receiver = self.inner.state.subscribe();
        let result = match receiver.wait_for(|state| state.is_some()).await {
            Ok(state) => state.clone(),
            // the sender lives in `self`, so this can not happen
            Err(_) => None,
        };
        result.unwrap_or(Outcome::Cancelled)
    }
}
