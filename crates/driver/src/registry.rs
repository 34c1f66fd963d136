//! Device registry: multiple sessions plus an event channel
//!
//! The registry does not discover anything itself; the BLE discovery layer
//! hands it a connected transport plus the device identity and the registry
//! runs the session lifecycle, fanning state changes out to subscribers.

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info};
use uuid::Uuid;

use blecard_rpc::RpcTransport;

use crate::device::{DeviceConfig, DeviceIdentity, DeviceSession};
use crate::error::{Error, Result};
use crate::secure_channel::CredentialStore;

/// Registry lifecycle events delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The registry came up.
    PowerOn,
    /// The registry is shutting down; all sessions are gone.
    PowerOff,
    /// The set of tracked devices changed.
    DeviceListChanged,
    /// A device finished initialization.
    DeviceConnected {
        /// The device.
        id: Uuid,
    },
    /// A device was detached or its link dropped.
    DeviceDisconnected {
        /// The device.
        id: Uuid,
    },
    /// A device's handshake failed; the session is kept in its failed state
    /// so the caller can inspect the init report and retry.
    DeviceFailedToConnect {
        /// The device.
        id: Uuid,
        /// What failed.
        error: Error,
    },
}

/// Tracks every attached [`DeviceSession`] and broadcasts [`DeviceEvent`]s.
pub struct DeviceRegistry {
    sessions: Mutex<HashMap<Uuid, DeviceSession>>,
    /// Devices seen at least once: name kept across detach, so a saved
    /// device can be listed and re-attached without rediscovery.
    known: Mutex<HashMap<Uuid, String>>,
    subscribers: Mutex<Vec<Sender<DeviceEvent>>>,
    credentials: std::sync::Arc<dyn CredentialStore>,
    stopped: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &lock(&self.sessions).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeviceRegistry {
    /// Registry over the given credential store.
    pub fn new(credentials: std::sync::Arc<dyn CredentialStore>) -> Self {
        let registry = Self {
            sessions: Mutex::new(HashMap::new()),
            known: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            credentials,
            stopped: std::sync::atomic::AtomicBool::new(false),
        };
        registry.emit(DeviceEvent::PowerOn);
        registry
    }

    /// Subscribe to lifecycle events. Each subscriber gets its own queue.
    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        let (tx, rx) = unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    fn emit(&self, event: DeviceEvent) {
        debug!(?event, "registry event");
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Attach a connected transport as a new session and initialize it.
    ///
    /// The session is tracked either way; on handshake failure it stays in
    /// `FailedToConnect` and the error is both returned and broadcast.
    pub fn attach<T>(
        &self,
        identity: DeviceIdentity,
        transport: T,
        config: DeviceConfig,
    ) -> Result<Uuid>
    where
        T: RpcTransport + 'static,
    {
        let id = identity.id;
        info!(device = %id, name = %identity.name, "attaching device");
        lock(&self.known).insert(id, identity.name.clone());
        let mut session =
            DeviceSession::new(identity, transport, config, self.credentials.clone());
        let initialized = session.initialize().map(|_| ());
        lock(&self.sessions).insert(id, session);
        self.emit(DeviceEvent::DeviceListChanged);

        match initialized {
            Ok(()) => {
                self.emit(DeviceEvent::DeviceConnected { id });
                Ok(id)
            }
            Err(error) => {
                self.emit(DeviceEvent::DeviceFailedToConnect {
                    id,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Run `f` against the session for `id`, if tracked.
    pub fn with_session<R>(&self, id: Uuid, f: impl FnOnce(&mut DeviceSession) -> R) -> Option<R> {
        lock(&self.sessions).get_mut(&id).map(f)
    }

    /// Identifiers of every tracked session.
    pub fn device_ids(&self) -> Vec<Uuid> {
        lock(&self.sessions).keys().copied().collect()
    }

    /// Every device seen at least once, with its last known name. Detaching
    /// a device does not remove it from this list.
    pub fn known_devices(&self) -> HashMap<Uuid, String> {
        lock(&self.known).clone()
    }

    /// Forget a saved device: its name bookkeeping is dropped and its
    /// session, if any, is detached first.
    pub fn forget(&self, id: Uuid) {
        self.detach(id);
        if lock(&self.known).remove(&id).is_some() {
            self.emit(DeviceEvent::DeviceListChanged);
        }
    }

    /// Disconnect and drop the session for `id`. The device stays in the
    /// known list.
    pub fn detach(&self, id: Uuid) {
        let removed = lock(&self.sessions).remove(&id);
        if let Some(mut session) = removed {
            session.disconnect();
            self.emit(DeviceEvent::DeviceDisconnected { id });
            self.emit(DeviceEvent::DeviceListChanged);
        }
    }

    /// Disconnect every session and notify subscribers. Idempotent.
    pub fn shutdown(&self) {
        if self
            .stopped
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let sessions: Vec<_> = {
            let mut guard = lock(&self.sessions);
            guard.drain().collect()
        };
        for (id, mut session) in sessions {
            session.disconnect();
            self.emit(DeviceEvent::DeviceDisconnected { id });
        }
        self.emit(DeviceEvent::PowerOff);
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
