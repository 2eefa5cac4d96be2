use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::select;

use crate::signal::{Completion, DoneCallback, Outcome, Signal};

/// A signal scoped below a parent signal.
///
/// * cancelling the child leaves the parent alone
/// * the parent being cancelled or failing shows through to the child
/// * the parent completing with a *value* cancels the child: for a parent, completing means
///    shutting down, and there is no value to hand down
///
/// This is how sessions and individual exchanges derive their shutdown signals from a single
///  application wide one.
pub struct ChildSignal<T> {
    parent: Arc<dyn Completion<T>>,
    own: Signal<T>,
}

impl<T> Clone for ChildSignal<T> {
    fn clone(&self) -> Self {
        ChildSignal {
            parent: self.parent.clone(),
            own: self.own.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ChildSignal<T> {
    pub fn new(parent: Arc<dyn Completion<T>>) -> ChildSignal<T> {
        ChildSignal {
            parent,
            own: Signal::new(),
        }
    }

    /// Completing the child is refused once the parent is done
    pub fn resolve(&self, value: T) -> bool {
        if self.parent.is_done() {
            return false;
        }
        self.own.resolve(value)
    }

    fn from_parent(outcome: Outcome<T>) -> Outcome<T> {
        match outcome {
            Outcome::Failed(e) => Outcome::Failed(e),
            Outcome::Value(_) | Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

fn fire_once<T>(slot: &Mutex<Option<DoneCallback<T>>>, outcome: Outcome<T>) {
    let callback = match slot.lock() {
        Ok(mut c) => c.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(callback) = callback {
        callback(outcome);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Completion<T> for ChildSignal<T> {
    fn is_done(&self) -> bool {
        self.own.is_done() || self.parent.is_done()
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.outcome(), Some(Outcome::Cancelled))
    }

    fn outcome(&self) -> Option<Outcome<T>> {
        if let Some(outcome) = self.own.outcome() {
            return Some(outcome);
        }
        self.parent.outcome().map(Self::from_parent)
    }

    /// The parent only gets a weak handle on `callback`: once the child completes or is dropped,
    ///  the callback is released even if the parent lives on. What stays registered with the
    ///  parent until it completes is a small stub.
    fn on_done(&self, callback: DoneCallback<T>) {
        let slot = Arc::new(Mutex::new(Some(callback)));
        let for_parent = Arc::downgrade(&slot);

        self.own.on_done(Box::new(move |outcome| fire_once(&slot, outcome)));
        self.parent.on_done(Box::new(move |outcome| {
            if let Some(slot) = for_parent.upgrade() {
                fire_once(&slot, Self::from_parent(outcome));
            }
        }));
    }

    fn cancel(&self) -> bool {
        self.own.cancel()
    }

    async fn wait(&self) -> Outcome<T> {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        select! {
            outcome = self.own.wait() => outcome,
            outcome = self.parent.wait() => Self::from_parent(outcome),
        }
    }
}
