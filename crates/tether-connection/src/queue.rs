//! Pending message queue
//!
//! Holds outbound messages from submission until the server acknowledges
//! them. Entries are ordered by `msgSerial`; each carries the completion
//! sender for the [`MessageCompletion`] handed back to the submitter.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tether_core::{ErrorInfo, ProtocolMessage};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Outcome of one pending message
pub type CompletionResult = Result<(), ErrorInfo>;

/// Server verdict for a serial range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Messages accepted
    Ack,
    /// Messages refused
    Nack(ErrorInfo),
}

/// Resolves once the server acknowledges or refuses a submitted message
#[derive(Debug)]
pub struct MessageCompletion {
    inner: CompletionInner,
}

#[derive(Debug)]
enum CompletionInner {
    Waiting(oneshot::Receiver<CompletionResult>),
    Ready(Option<CompletionResult>),
}

impl MessageCompletion {
    /// Completion bound to a pending entry
    pub fn channel() -> (oneshot::Sender<CompletionResult>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                inner: CompletionInner::Waiting(rx),
            },
        )
    }

    /// Completion that is already resolved
    pub fn ready(result: CompletionResult) -> Self {
        Self {
            inner: CompletionInner::Ready(Some(result)),
        }
    }
}

impl Future for MessageCompletion {
    type Output = CompletionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            CompletionInner::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(ErrorInfo::closed(
                    "connection engine stopped before the message completed",
                ))),
                Poll::Pending => Poll::Pending,
            },
            CompletionInner::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(ErrorInfo::closed("completion already consumed"))),
            ),
        }
    }
}

/// A sent-but-unacknowledged message
#[derive(Debug)]
pub struct PendingMessage {
    serial: u64,
    message: ProtocolMessage,
    completion: Option<oneshot::Sender<CompletionResult>>,
}

impl PendingMessage {
    /// Serial occupied by this message
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The message as it goes on the wire
    pub fn message(&self) -> &ProtocolMessage {
        &self.message
    }

    fn complete(mut self, result: CompletionResult) {
        if let Some(tx) = self.completion.take() {
            // The submitter may have stopped waiting
            let _ = tx.send(result);
        }
    }
}

/// FIFO of unacknowledged messages ordered by serial
#[derive(Debug, Default)]
pub struct PendingMessageQueue {
    entries: VecDeque<PendingMessage>,
    next_serial: u64,
}

impl PendingMessageQueue {
    /// Empty queue starting at serial zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next serial to `message` and hold it until resolved
    pub fn enqueue(&mut self, message: ProtocolMessage) -> (u64, MessageCompletion) {
        let (tx, completion) = MessageCompletion::channel();
        (self.enqueue_with(message, tx), completion)
    }

    /// Enqueue with an existing completion sender
    pub fn enqueue_with(
        &mut self,
        mut message: ProtocolMessage,
        completion: oneshot::Sender<CompletionResult>,
    ) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        message.msg_serial = Some(serial);
        trace!(serial, action = %message.action, "enqueued pending message");
        self.entries.push_back(PendingMessage {
            serial,
            message,
            completion: Some(completion),
        });
        serial
    }

    /// Resolve every entry with a serial in `[from, from + count)`
    ///
    /// Returns the number of entries resolved. Entries outside the range stay
    /// pending.
    pub fn resolve(&mut self, from: u64, count: u32, outcome: AckOutcome) -> usize {
        let end = from.saturating_add(u64::from(count));
        let mut resolved = 0;
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if (from..end).contains(&entry.serial) {
                let result = match &outcome {
                    AckOutcome::Ack => Ok(()),
                    AckOutcome::Nack(error) => Err(error.clone()),
                };
                entry.complete(result);
                resolved += 1;
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        if resolved > 0 {
            let nack = matches!(outcome, AckOutcome::Nack(_));
            debug!(from, count, resolved, nack, "resolved pending messages");
        }
        resolved
    }

    /// Clone every pending message in ascending serial order for replay
    pub fn drain_for_resend(&self) -> Vec<ProtocolMessage> {
        self.entries
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    /// Resolve every entry with `error` and empty the queue
    pub fn fail_all(&mut self, error: &ErrorInfo) -> usize {
        let failed = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.complete(Err(error.clone()));
        }
        if failed > 0 {
            debug!(failed, error = %error, "failed all pending messages");
        }
        failed
    }

    /// Renumber pending entries from zero for a brand-new connection
    pub fn renumber(&mut self) {
        self.restart_at(0);
    }

    /// Renumber pending entries starting at `first`
    pub fn restart_at(&mut self, first: u64) {
        let mut serial = first;
        for entry in &mut self.entries {
            entry.serial = serial;
            entry.message.msg_serial = Some(serial);
            serial += 1;
        }
        self.next_serial = serial;
    }

    /// Pending message occupying `serial`
    pub fn get(&self, serial: u64) -> Option<&ProtocolMessage> {
        self.entries
            .iter()
            .find(|entry| entry.serial == serial)
            .map(PendingMessage::message)
    }

    /// Serial the next enqueued message will take
    pub fn next_serial(&self) -> u64 {
        self.next_serial
    }

    /// Serials currently pending, in order
    pub fn serials(&self) -> Vec<u64> {
        self.entries.iter().map(PendingMessage::serial).collect()
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
