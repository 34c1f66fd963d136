//! Error types for driver operations

use thiserror::Error;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Card-level failures, device-reported or raised locally by the emulated
/// PC/SC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CardError {
    /// The card is held by another connection or an open transaction.
    #[error("sharing violation")]
    SharingViolation,
    /// The requested protocol is not supported by the card or the reader.
    #[error("protocol not supported")]
    NotSupportedProtocol,
    /// No card is present or powered for the requested operation.
    #[error("card absent")]
    CardAbsent,
    /// The context or card handle is stale or already in use.
    #[error("invalid handle")]
    InvalidHandle,
    /// The reader reported a card failure it could not classify.
    #[error("unresponsive card")]
    UnresponsiveCard,
}

impl CardError {
    /// Map the diagnostic byte of a failed SCard response.
    pub fn from_diagnostic(payload: &[u8]) -> Self {
        match payload.first() {
            Some(0x01) => Self::SharingViolation,
            Some(0x02) => Self::NotSupportedProtocol,
            Some(0x03) => Self::CardAbsent,
            Some(0x04) => Self::InvalidHandle,
            _ => Self::UnresponsiveCard,
        }
    }
}

/// Terminal outcomes of the session key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyExchangeError {
    /// The device has encryption disabled; no retry can help.
    #[error("encryption disabled on device")]
    EncryptionDisabled,
    /// All retryable attempts were used up.
    #[error("key exchange retries exhausted")]
    RetryExhausted,
    /// The device answered with material the profile cannot use.
    #[error("unusable key material: {0}")]
    UnusableMaterial(&'static str),
}

/// Failures surfaced while decoding device-reported records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The record is shorter than its fixed prefix requires.
    #[error("record truncated: need {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the layout requires.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },
    /// A settings record carries a type byte outside the enumeration.
    #[error("unknown setting type {0:#04x}")]
    UnknownSettingType(u8),
    /// A string field is not valid UTF-8.
    #[error("string field is not valid utf-8")]
    BadString,
    /// An ATR failed structural validation.
    #[error("malformed atr: {0}")]
    MalformedAtr(&'static str),
    /// A value field is outside its documented range.
    #[error("field out of range: {0}")]
    OutOfRange(&'static str),
}

/// Error type for driver operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Failure in the RPC layer underneath.
    #[error(transparent)]
    Rpc(#[from] blecard_rpc::Error),

    /// Card-level failure.
    #[error("card error: {0}")]
    Card(#[from] CardError),

    /// Key exchange failed terminally.
    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    /// A device record could not be decoded.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// The session is not connected.
    #[error("device not connected")]
    NotConnected,

    /// A mandatory initialization step failed.
    #[error("initialization failed at {0}")]
    InitFailed(&'static str),
}

impl From<blecard_rpc::TransportError> for Error {
    fn from(err: blecard_rpc::TransportError) -> Self {
        Self::Rpc(err.into())
    }
}

impl From<blecard_rpc::CryptoError> for Error {
    fn from(err: blecard_rpc::CryptoError) -> Self {
        Self::Rpc(err.into())
    }
}

impl Error {
    /// Whether this error should count towards dropping the session.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Rpc(inner) if inner.is_transport())
    }
}
