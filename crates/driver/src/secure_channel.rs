//! Session key exchange and credential storage
//!
//! The key manager drives the ExchangeKey handshake: fresh host randomness per
//! attempt, retry on the retryable failure reasons, terminal stop when the
//! device has encryption disabled. On success it derives the session key and
//! installs it into the shared frame cipher the dispatcher seals with.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::RngCore;
use tracing::{debug, warn};
use uuid::Uuid;

use blecard_rpc::error::ProtocolError;
use blecard_rpc::{CallOptions, Error as RpcError, KeyFailure, RpcDispatcher, RpcMethod};

use crate::crypto::{derive_session_key, SessionCipher, HOST_IV_LEN};
use crate::error::{Error, KeyExchangeError, Result};

/// Kinds of secrets the credential store holds per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Long-term pairing key.
    LongTermKey,
    /// Cached session key material.
    SessionKey,
}

/// Secure credential storage seam, keyed by device identifier and an
/// access-group scope.
pub trait CredentialStore: Send + Sync {
    /// Read a stored secret.
    fn get(&self, device: Uuid, scope: &str, kind: CredentialKind) -> Option<Vec<u8>>;

    /// Store or replace a secret.
    fn set(&self, device: Uuid, scope: &str, kind: CredentialKind, value: &[u8]);

    /// Remove a secret. Removing an absent secret is not an error.
    fn delete(&self, device: Uuid, scope: &str, kind: CredentialKind);
}

/// In-memory credential store for tests and hosts without a platform
/// keystore.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<(Uuid, String, CredentialKind), Vec<u8>>>,
}

impl MemoryCredentialStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, device: Uuid, scope: &str, kind: CredentialKind) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(device, scope.to_owned(), kind))
            .cloned()
    }

    fn set(&self, device: Uuid, scope: &str, kind: CredentialKind, value: &[u8]) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((device, scope.to_owned(), kind), value.to_vec());
    }

    fn delete(&self, device: Uuid, scope: &str, kind: CredentialKind) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(device, scope.to_owned(), kind));
    }
}

/// Key exchange progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyExchangeState {
    /// No session key; encryption operations fail fast.
    #[default]
    NoKey,
    /// An exchange is in flight.
    ExchangingKeys,
    /// A session key is installed in the cipher.
    KeyEstablished,
    /// The exchange failed terminally; no further attempts until reset.
    Failed(KeyExchangeError),
}

/// Drives the ExchangeKey handshake for one device session.
pub struct SessionKeyManager {
    cipher: Arc<Mutex<SessionCipher>>,
    state: KeyExchangeState,
    max_attempts: u8,
}

impl std::fmt::Debug for SessionKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeyManager")
            .field("state", &self.state)
            .finish()
    }
}

impl SessionKeyManager {
    /// Attempts per [`exchange`](Self::exchange) call, matching the firmware's
    /// tolerance for transient randomness shortages.
    pub const DEFAULT_MAX_ATTEMPTS: u8 = 3;

    /// Manager over the cipher shared with a dispatcher.
    pub fn new(cipher: Arc<Mutex<SessionCipher>>) -> Self {
        Self {
            cipher,
            state: KeyExchangeState::NoKey,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Current exchange state.
    pub const fn state(&self) -> KeyExchangeState {
        self.state
    }

    /// Whether a session key is installed.
    pub const fn is_established(&self) -> bool {
        matches!(self.state, KeyExchangeState::KeyEstablished)
    }

    /// Run the handshake over `dispatcher`. Retries with fresh randomness on
    /// retryable failure reasons; a terminal reason or exhausted attempts
    /// leaves the manager in `Failed` until [`reset`](Self::reset).
    pub fn exchange(&mut self, dispatcher: &RpcDispatcher) -> Result<()> {
        if let KeyExchangeState::Failed(reason) = self.state {
            return Err(Error::KeyExchange(reason));
        }
        self.state = KeyExchangeState::ExchangingKeys;

        for attempt in 1..=self.max_attempts {
            let mut host_iv = [0u8; HOST_IV_LEN];
            rand::rng().fill_bytes(&mut host_iv);

            let result = dispatcher.call_blocking(
                RpcMethod::ExchangeKey,
                Bytes::copy_from_slice(&host_iv),
                CallOptions::plain(),
            );

            match result {
                Ok(material) => {
                    let key = derive_session_key(&material, &host_iv).map_err(|err| {
                        warn!(%err, "device returned unusable key material");
                        self.state =
                            KeyExchangeState::Failed(KeyExchangeError::UnusableMaterial(
                                "bad material length",
                            ));
                        Error::KeyExchange(KeyExchangeError::UnusableMaterial(
                            "bad material length",
                        ))
                    })?;
                    self.cipher
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .install_key(key);
                    self.state = KeyExchangeState::KeyEstablished;
                    debug!(attempt, "session key established");
                    return Ok(());
                }
                Err(RpcError::Protocol(ProtocolError::MethodFailure { diagnostic })) => {
                    match KeyFailure::from_diagnostic(&diagnostic) {
                        Some(reason) if reason.is_retryable() => {
                            warn!(attempt, ?reason, "key exchange attempt failed, retrying");
                        }
                        Some(KeyFailure::EncryptionDisabled) => {
                            self.state =
                                KeyExchangeState::Failed(KeyExchangeError::EncryptionDisabled);
                            return Err(Error::KeyExchange(KeyExchangeError::EncryptionDisabled));
                        }
                        _ => {
                            self.state = KeyExchangeState::NoKey;
                            return Err(RpcError::Protocol(ProtocolError::MethodFailure {
                                diagnostic,
                            })
                            .into());
                        }
                    }
                }
                Err(err) => {
                    // Transport or framing trouble is not a handshake verdict.
                    self.state = KeyExchangeState::NoKey;
                    return Err(err.into());
                }
            }
        }

        self.state = KeyExchangeState::Failed(KeyExchangeError::RetryExhausted);
        Err(Error::KeyExchange(KeyExchangeError::RetryExhausted))
    }

    /// Drop the session key and clear any terminal failure, allowing a new
    /// exchange.
    pub fn reset(&mut self) {
        self.cipher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.state = KeyExchangeState::NoKey;
    }
}

/// Whether a long-term key is stored for `device` under `scope`.
pub fn has_ltk(store: &dyn CredentialStore, device: Uuid, scope: &str) -> bool {
    store.get(device, scope, CredentialKind::LongTermKey).is_some()
}

/// Remove the long-term key and any cached session material for `device`.
/// Called when the device is unpaired.
pub fn cleanup_ltk(store: &dyn CredentialStore, device: Uuid, scope: &str) {
    store.delete(device, scope, CredentialKind::LongTermKey);
    store.delete(device, scope, CredentialKind::SessionKey);
}
