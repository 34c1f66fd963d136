//! Frame-cipher seam
//!
//! The dispatcher encrypts and decrypts payloads through this trait; the
//! concrete AES-CCM session cipher lives in the driver crate next to the key
//! exchange. A dispatcher built without a cipher treats every encryption
//! operation as `KeyNotSet`.

use bytes::Bytes;

use crate::error::CryptoError;
use crate::frame::RpcMethod;

/// Payload encryption/decryption for RPC frames.
pub trait FrameCipher: Send {
    /// Whether a session key is currently installed.
    fn is_established(&self) -> bool;

    /// Seal a request payload for the given method.
    fn encrypt_payload(&mut self, method: RpcMethod, plaintext: &[u8])
    -> Result<Bytes, CryptoError>;

    /// Open a response payload for the given method.
    fn decrypt_payload(
        &mut self,
        method: RpcMethod,
        ciphertext: &[u8],
    ) -> Result<Bytes, CryptoError>;
}

/// Cipher that never establishes; every encryption operation fails fast with
/// `KeyNotSet`. Used for devices with encryption disabled and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCipher;

impl FrameCipher for NullCipher {
    fn is_established(&self) -> bool {
        false
    }

    fn encrypt_payload(
        &mut self,
        _method: RpcMethod,
        _plaintext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        Err(CryptoError::KeyNotSet)
    }

    fn decrypt_payload(
        &mut self,
        _method: RpcMethod,
        _ciphertext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        Err(CryptoError::KeyNotSet)
    }
}
