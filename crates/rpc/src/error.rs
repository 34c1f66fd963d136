//! Error types for RPC operations
//!
//! The taxonomy keeps transport, protocol and crypto failures apart so a
//! session can decide what is fatal to the link and what only fails the
//! single call.

use bytes::Bytes;
use thiserror::Error;

use crate::frame::ReturnCode;

/// Result type for RPC operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the mandatory leading byte.
    #[error("frame truncated")]
    Truncated,
    /// The leading response byte is outside the known return codes.
    #[error("unknown return code {0:#04x}")]
    UnknownReturnCode(u8),
    /// The leading request byte is not a known method opcode.
    #[error("unknown method opcode {0:#04x}")]
    UnknownMethod(u8),
}

/// Errors raised by the link itself. All of these drive the owning session
/// towards the `Absent` state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The BLE link dropped.
    #[error("link lost")]
    LinkLost,
    /// A write to the command characteristic failed.
    #[error("write failed: {0}")]
    WriteFailed(&'static str),
    /// The transport was used before a connection was established.
    #[error("not connected")]
    NotConnected,
    /// The frame exceeds the negotiated command size.
    #[error("frame of {actual} bytes exceeds negotiated maximum of {max}")]
    FrameTooLarge {
        /// Frame length submitted.
        actual: usize,
        /// Negotiated maximum.
        max: usize,
    },
}

/// Device-reported protocol failures. Non-fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The request frame carried no method byte.
    #[error("method not specified")]
    MethodNotSpecified,
    /// The device does not implement the method.
    #[error("unknown method")]
    UnknownMethod,
    /// The method ran and failed; diagnostic bytes attached.
    #[error("method failure ({} diagnostic bytes)", diagnostic.len())]
    MethodFailure {
        /// Opaque diagnostic payload from the device.
        diagnostic: Bytes,
    },
}

/// Encryption-related failures, device-reported or local.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The device could not decrypt the request.
    #[error("device failed to decrypt request")]
    DecryptFailure,
    /// The device could not encrypt the response.
    #[error("device failed to encrypt response")]
    EncryptFailure,
    /// No session key is established for an encryption operation.
    #[error("session key not set")]
    KeyNotSet,
    /// Key or profile mismatch between host and device.
    #[error("incorrect encryption")]
    IncorrectEncryption,
    /// The decrypted request carried no method byte.
    #[error("encrypted method not specified")]
    EncryptedMethodNotSpecified,
    /// Local AEAD seal/open failure (bad tag, nonce reuse guard).
    #[error("aead failure: {0}")]
    Aead(&'static str),
    /// Session key derivation rejected the device material.
    #[error("key derivation failed: {0}")]
    KeyDerivation(&'static str),
}

/// Error type for RPC operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Link-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed frame.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Device-reported protocol failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Encryption failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// No response arrived within the configured window. Locally generated;
    /// the transport itself reported nothing.
    #[error("call timed out")]
    Timeout,

    /// The call was cancelled while still queued.
    #[error("call cancelled")]
    Cancelled,

    /// The dispatcher was shut down before the call completed.
    #[error("dispatcher shut down")]
    Shutdown,

    /// Other error with a dynamic message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Map a non-success return code (plus its diagnostic payload) into the
    /// taxonomy. `Success` is a caller bug and maps to a message error rather
    /// than a panic.
    pub fn from_return_code(code: ReturnCode, diagnostic: Bytes) -> Self {
        match code {
            ReturnCode::Success => Self::Message("success is not an error".into()),
            ReturnCode::MethodNotSpecified => ProtocolError::MethodNotSpecified.into(),
            ReturnCode::UnknownMethod => ProtocolError::UnknownMethod.into(),
            ReturnCode::MethodFailure => ProtocolError::MethodFailure { diagnostic }.into(),
            ReturnCode::DecryptFailure => CryptoError::DecryptFailure.into(),
            ReturnCode::EncryptFailure => CryptoError::EncryptFailure.into(),
            ReturnCode::KeyNotSet => CryptoError::KeyNotSet.into(),
            ReturnCode::IncorrectEncryption => CryptoError::IncorrectEncryption.into(),
            ReturnCode::EncryptedMethodNotSpecified => {
                CryptoError::EncryptedMethodNotSpecified.into()
            }
        }
    }

    /// Whether this error should count towards a session disconnect.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
