use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

/// Errors returned while waiting on a [`Receipt`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReceiptError {
    /// The message was discarded without being written, either because the queue was full or because the agent shut
    /// down first.
    #[error("message was discarded before it could be written")]
    Abandoned,

    /// The message was not written within the given timeout.
    #[error("timed out waiting for message to be written")]
    Timeout,
}

/// A single line of wire payload, plus an optional signal for a caller waiting on it.
#[derive(Debug)]
pub struct Message {
    payload: String,
    completion: Option<Sender<()>>,
}

impl Message {
    /// Creates a message that nobody waits on.
    pub fn new(payload: impl Into<String>) -> Self {
        Message { payload: payload.into(), completion: None }
    }

    /// Creates a message along with a [`Receipt`] that resolves once the message has been written to the collector
    /// connection.
    pub fn synchronous(payload: impl Into<String>) -> (Self, Receipt) {
        let (tx, rx) = bounded(1);
        (Message { payload: payload.into(), completion: Some(tx) }, Receipt { rx })
    }

    /// Returns the payload, without a line terminator.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Returns `true` if a caller is waiting for this message to be written.
    pub fn is_synchronous(&self) -> bool {
        self.completion.is_some()
    }

    /// Signals the waiting caller, if any, that the message has been written.
    pub(crate) fn complete(&self) {
        if let Some(completion) = &self.completion {
            // The caller may have stopped waiting, which is fine.
            let _ = completion.try_send(());
        }
    }
}

/// The waiting side of a synchronous [`Message`].
///
/// Dropping the receipt is allowed and simply means nobody waits for the write.
#[derive(Debug)]
pub struct Receipt {
    rx: Receiver<()>,
}

impl Receipt {
    /// Blocks until the message has been written.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Abandoned`] if the message was dropped instead of written.
    pub fn wait(self) -> Result<(), ReceiptError> {
        self.rx.recv().map_err(|_| ReceiptError::Abandoned)
    }

    /// Blocks until the message has been written, or until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Timeout`] if the timeout elapsed, or [`ReceiptError::Abandoned`] if the message was
    /// dropped instead of written.
    pub fn wait_timeout(self, timeout: Duration) -> Result<(), ReceiptError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ReceiptError::Timeout,
            RecvTimeoutError::Disconnected => ReceiptError::Abandoned,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::{Message, ReceiptError};

    #[test]
    fn asynchronous_message_has_no_completion() {
        let message = Message::new("gauge a.b 1 1");
        assert_eq!(message.payload(), "gauge a.b 1 1");
        assert!(!message.is_synchronous());
        message.complete();
    }

    #[test]
    fn receipt_resolves_on_completion() {
        let (message, receipt) = Message::synchronous("gauge a.b 1 1");
        assert!(message.is_synchronous());

        let writer = thread::spawn(move || message.complete());
        assert_eq!(receipt.wait(), Ok(()));
        writer.join().unwrap();
    }

    #[test]
    fn receipt_resolves_when_message_is_dropped() {
        let (message, receipt) = Message::synchronous("gauge a.b 1 1");
        drop(message);
        assert_eq!(receipt.wait(), Err(ReceiptError::Abandoned));
    }

    #[test]
    fn receipt_times_out_while_message_is_pending() {
        let (_message, receipt) = Message::synchronous("gauge a.b 1 1");
        assert_eq!(receipt.wait_timeout(Duration::from_millis(10)), Err(ReceiptError::Timeout));
    }

    #[test]
    fn completing_after_receipt_dropped_is_harmless() {
        let (message, receipt) = Message::synchronous("gauge a.b 1 1");
        drop(receipt);
        message.complete();
    }
}
