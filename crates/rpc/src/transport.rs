//! Transport abstraction for the BLE link
//!
//! The reader speaks a write/notify GATT profile: the host writes one request
//! frame to the command characteristic and receives exactly one notification
//! per request. The trait models that as a blocking write plus a bounded wait
//! for the next notification, leaving connection management to the caller.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::TransportError;

/// Smallest command-characteristic payload every device family supports.
pub const MIN_COMMAND_SIZE: usize = 266;
/// Smallest notification payload every device family supports.
pub const MIN_RESPONSE_SIZE: usize = 258;

/// A reliable, ordered, single-outstanding-request BLE-like channel.
pub trait RpcTransport: Send + fmt::Debug {
    /// Write one request frame to the device.
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next notification frame.
    ///
    /// `Ok(None)` means the window elapsed without a notification; the caller
    /// turns that into its own timeout error. Transport faults (link loss)
    /// are reported as `Err`.
    fn read_notification(&mut self, timeout: Duration) -> Result<Option<Bytes>, TransportError>;

    /// Negotiated maximum request frame size. Never below [`MIN_COMMAND_SIZE`].
    fn command_size(&self) -> usize {
        MIN_COMMAND_SIZE
    }

    /// Negotiated maximum notification frame size. Never below
    /// [`MIN_RESPONSE_SIZE`].
    fn response_size(&self) -> usize {
        MIN_RESPONSE_SIZE
    }

    /// Reset the transport to a just-connected state.
    fn reset(&mut self) -> Result<(), TransportError>;
}

/// Scriptable transport for tests.
///
/// Replies are served in FIFO order, one per written frame. The write counter
/// is the observable the local-failure tests assert on.
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: std::collections::VecDeque<Result<Bytes, TransportError>>,
    written: Vec<Bytes>,
    pending: Option<Result<Bytes, TransportError>>,
}

impl MockTransport {
    /// Create an empty mock; any write leaves the reply window empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock that answers every request with `response`.
    pub fn with_response(response: Bytes) -> Self {
        let mut mock = Self::new();
        mock.push_reply(response);
        mock
    }

    /// Queue a reply frame for the next unanswered write.
    pub fn push_reply(&mut self, response: Bytes) {
        self.replies.push_back(Ok(response));
    }

    /// Queue a transport fault for the next unanswered write.
    pub fn push_fault(&mut self, fault: TransportError) {
        self.replies.push_back(Err(fault));
    }

    /// Queue a silent window: the write succeeds but no notification arrives.
    pub fn push_silence(&mut self) {
        self.replies.push_back(Ok(Bytes::new()));
    }

    /// Number of frames written so far.
    pub const fn write_count(&self) -> usize {
        self.written.len()
    }

    /// All frames written so far, oldest first.
    pub fn written(&self) -> &[Bytes] {
        &self.written
    }

    /// The most recent frame written, if any.
    pub fn last_written(&self) -> Option<&Bytes> {
        self.written.last()
    }
}

impl RpcTransport for MockTransport {
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.written.push(Bytes::copy_from_slice(frame));
        self.pending = self.replies.pop_front();
        Ok(())
    }

    fn read_notification(&mut self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        match self.pending.take() {
            Some(Ok(bytes)) if !bytes.is_empty() => Ok(Some(bytes)),
            Some(Err(fault)) => Err(fault),
            // Empty script slot or no slot at all: sit out the window like a
            // silent device would.
            _ => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.pending = None;
        Ok(())
    }
}
