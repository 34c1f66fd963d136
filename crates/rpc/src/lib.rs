//! RPC protocol core for BLE smartcard readers
//!
//! BLE card readers of this family expose a fixed-opcode remote procedure
//! call protocol over a write/notify GATT link: one request frame out, one
//! response frame back. This crate provides the protocol primitives:
//!
//! - Encoding and decoding RPC request/response frames
//! - A transport seam over the BLE link
//! - A serialized dispatcher enforcing the single-request-in-flight rule
//! - A cipher seam for the encrypted-payload profile
//! - The protocol error taxonomy
//!
//! The concrete session crypto, device model and PC/SC emulation live in the
//! driver crate on top of these primitives.
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

// Main modules
pub mod cipher;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod transport;

pub use cipher::{FrameCipher, NullCipher};
pub use dispatcher::{CallOptions, DispatcherConfig, PendingCall, RpcDispatcher, SharedCipher};
pub use error::{CryptoError, Error, FrameError, ProtocolError, Result, TransportError};
pub use frame::{KeyFailure, ResponseFrame, ReturnCode, RpcMethod};
pub use transport::{MIN_COMMAND_SIZE, MIN_RESPONSE_SIZE, MockTransport, RpcTransport};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{Bytes, BytesMut};

    pub use crate::cipher::FrameCipher;
    pub use crate::dispatcher::{CallOptions, DispatcherConfig, PendingCall, RpcDispatcher};
    pub use crate::error::{CryptoError, Error, ProtocolError, Result, TransportError};
    pub use crate::frame::{KeyFailure, ReturnCode, RpcMethod};
    pub use crate::transport::RpcTransport;
}
