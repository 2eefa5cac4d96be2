use tokio::sync::mpsc;

use crate::comms::codec::Reply;
use crate::errors::{RunFailure, TransportError};

/// Replies of a send call, in the order they arrive.
///
/// Per-target errors go to the call's error catcher. Without one, a single
///  [TransportError::RunErrors] carrying all of them is the last item, after every target was tried.
pub struct ReplyStream {
    receiver: mpsc::UnboundedReceiver<Result<Reply, TransportError>>,
}

impl ReplyStream {
    pub fn new(receiver: mpsc::UnboundedReceiver<Result<Reply, TransportError>>) -> ReplyStream {
        ReplyStream { receiver }
    }

    /// `None` once all targets are done
    pub async fn next(&mut self) -> Option<Result<Reply, TransportError>> {
        self.receiver.recv().await
    }

    pub async fn collect_all(mut self) -> Result<Vec<Reply>, RunFailure> {
        let mut results = Vec::new();
        let mut errors = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Ok(reply) => results.push(reply),
                Err(TransportError::RunErrors { errors: run_errors }) => errors.extend(run_errors),
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(results)
        }
        else {
            Err(RunFailure { results, errors })
        }
    }
}
