use conveyor_transport::Envelope;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

/// The table of callers blocked on an answer, keyed by the correlation
/// identifier their answer will carry.
///
/// Every waiter is a one-shot signal. The answer-topic consumers
/// [resolve](PendingAnswers::resolve) waiters as matching envelopes arrive;
/// a waiter that gives up (timeout, error on the request path) must
/// [forget](PendingAnswers::forget) itself, so that the table never leaks an
/// entry regardless of the exit path.
#[derive(Default)]
pub(crate) struct PendingAnswers {
    table: SyncMutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,
}

impl PendingAnswers {
    /// Registers a waiter under the given correlation identifier and returns
    /// the receiving end of its signal.
    pub(crate) fn register(&self, answer_id: Uuid) -> oneshot::Receiver<Envelope> {
        let (sender, receiver) = oneshot::channel();

        self.table.lock().insert(answer_id, sender);

        receiver
    }

    /// Signals the waiter registered under the given correlation identifier
    /// with the given envelope. Reports whether a waiter was found.
    pub(crate) fn resolve(&self, answer_id: Uuid, envelope: Envelope) -> bool {
        let sender = self.table.lock().remove(&answer_id);

        match sender {
            // A dropped receiver just means the waiter gave up concurrently
            Some(sender) => sender.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Removes the waiter registered under the given correlation identifier,
    /// if it is still there.
    pub(crate) fn forget(&self, answer_id: Uuid) {
        self.table.lock().remove(&answer_id);
    }

    /// Reports the number of waiters currently registered.
    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }
}
