//! Serialized RPC dispatcher
//!
//! The BLE link carries no multiplexing: one request, one notification. The
//! dispatcher owns the transport on a worker thread and feeds it from a FIFO
//! submission queue, so at most one RPC is ever in flight per device and
//! completions arrive in submission order. Callers get a [`PendingCall`]
//! handle back immediately and block only when they choose to wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, trace, warn};

use crate::cipher::FrameCipher;
use crate::error::{CryptoError, Error};
use crate::frame::{self, RpcMethod};
use crate::transport::RpcTransport;

/// Shared handle to the frame cipher, also held by the key manager that
/// installs session keys into it.
pub type SharedCipher = Arc<Mutex<dyn FrameCipher>>;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// How long to wait for the response notification before the call fails
    /// with [`Error::Timeout`] and the slot is handed to the next queued call.
    pub response_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        // BLE link latency is tens of milliseconds; a few seconds covers
        // card-powering worst cases.
        Self {
            response_timeout: Duration::from_secs(3),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Treat the call as an encryption operation: the payload is sealed with
    /// the session key, and the call fails fast with `KeyNotSet` when no key
    /// is established. Plaintext-permitted methods leave this unset.
    pub encrypted: bool,
    /// Cache the decrypted result so idempotent reads can be re-queried
    /// without a round trip. Cleared on disconnect.
    pub keep_result: bool,
}

impl CallOptions {
    /// Plaintext call, result not cached.
    pub const fn plain() -> Self {
        Self {
            encrypted: false,
            keep_result: false,
        }
    }

    /// Encrypted call, result not cached.
    pub const fn encrypted() -> Self {
        Self {
            encrypted: true,
            keep_result: false,
        }
    }

    /// Cache the result of this call.
    pub const fn with_keep_result(mut self) -> Self {
        self.keep_result = true;
        self
    }
}

struct QueuedCall {
    method: RpcMethod,
    payload: Bytes,
    options: CallOptions,
    reply_tx: Sender<Result<Bytes, Error>>,
    cancelled: Arc<AtomicBool>,
}

/// Handle to a submitted call.
///
/// The completion is delivered exactly once: either the result payload or a
/// typed error, never both.
#[derive(Debug)]
pub struct PendingCall {
    reply_rx: Receiver<Result<Bytes, Error>>,
    cancelled: Arc<AtomicBool>,
}

impl PendingCall {
    /// Block until the call completes.
    pub fn wait(self) -> Result<Bytes, Error> {
        self.reply_rx.recv().unwrap_or(Err(Error::Shutdown))
    }

    /// Block up to `timeout` for the completion. `None` means the call is
    /// still queued or in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Bytes, Error>> {
        self.reply_rx.recv_timeout(timeout).ok()
    }

    /// Request cancellation. Only a call that is still queued can be
    /// cancelled; a call already on the wire can merely time out. The
    /// completion then reports [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Serialized per-device RPC dispatcher.
pub struct RpcDispatcher {
    submit_tx: Option<Sender<QueuedCall>>,
    stopping: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    cache: Arc<Mutex<HashMap<RpcMethod, Bytes>>>,
    cipher: SharedCipher,
}

impl std::fmt::Debug for RpcDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcDispatcher")
            .field("running", &self.worker.is_some())
            .finish()
    }
}

fn lock_ignoring_poison<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RpcDispatcher {
    /// Spawn the worker thread over `transport`, sealing and opening payloads
    /// through `cipher`.
    pub fn new<T>(transport: T, cipher: SharedCipher, config: DispatcherConfig) -> Self
    where
        T: RpcTransport + 'static,
    {
        let (submit_tx, submit_rx) = unbounded::<QueuedCall>();
        let stopping = Arc::new(AtomicBool::new(false));
        let cache = Arc::new(Mutex::new(HashMap::new()));

        let worker = {
            let stopping = Arc::clone(&stopping);
            let cache = Arc::clone(&cache);
            let cipher = Arc::clone(&cipher);
            std::thread::Builder::new()
                .name("blecard-rpc".into())
                .spawn(move || worker_loop(transport, cipher, config, submit_rx, stopping, cache))
                .expect("failed to spawn dispatcher worker")
        };

        Self {
            submit_tx: Some(submit_tx),
            stopping,
            worker: Some(worker),
            cache,
            cipher,
        }
    }

    /// Submit a call. Returns immediately; the call is queued FIFO behind any
    /// outstanding one.
    pub fn call(&self, method: RpcMethod, payload: Bytes, options: CallOptions) -> PendingCall {
        let (reply_tx, reply_rx) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let queued = QueuedCall {
            method,
            payload,
            options,
            reply_tx: reply_tx.clone(),
            cancelled: Arc::clone(&cancelled),
        };

        match &self.submit_tx {
            Some(tx) if tx.send(queued).is_ok() => {}
            _ => {
                let _ = reply_tx.send(Err(Error::Shutdown));
            }
        }

        PendingCall {
            reply_rx,
            cancelled,
        }
    }

    /// Convenience wrapper: submit and block for the completion.
    pub fn call_blocking(
        &self,
        method: RpcMethod,
        payload: Bytes,
        options: CallOptions,
    ) -> Result<Bytes, Error> {
        self.call(method, payload, options).wait()
    }

    /// Last successful result cached for `method` via
    /// [`CallOptions::keep_result`].
    pub fn cached(&self, method: RpcMethod) -> Option<Bytes> {
        lock_ignoring_poison(&self.cache).get(&method).cloned()
    }

    /// Drop all cached results. Called on disconnect.
    pub fn clear_cache(&self) {
        lock_ignoring_poison(&self.cache).clear();
    }

    /// Shared cipher handle, for the key manager that installs session keys.
    pub fn cipher(&self) -> SharedCipher {
        Arc::clone(&self.cipher)
    }

    /// Stop the worker. Queued calls complete with [`Error::Shutdown`].
    pub fn shutdown(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.submit_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RpcDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T: RpcTransport>(
    mut transport: T,
    cipher: SharedCipher,
    config: DispatcherConfig,
    submit_rx: Receiver<QueuedCall>,
    stopping: Arc<AtomicBool>,
    cache: Arc<Mutex<HashMap<RpcMethod, Bytes>>>,
) {
    for call in submit_rx.iter() {
        if stopping.load(Ordering::SeqCst) {
            let _ = call.reply_tx.send(Err(Error::Shutdown));
            continue;
        }
        if call.cancelled.load(Ordering::SeqCst) {
            trace!(method = ?call.method, "dropping cancelled call before send");
            let _ = call.reply_tx.send(Err(Error::Cancelled));
            continue;
        }

        let result = execute_call(&mut transport, &cipher, config, &call, &cache);
        let _ = call.reply_tx.send(result);
    }
}

fn execute_call<T: RpcTransport>(
    transport: &mut T,
    cipher: &SharedCipher,
    config: DispatcherConfig,
    call: &QueuedCall,
    cache: &Mutex<HashMap<RpcMethod, Bytes>>,
) -> Result<Bytes, Error> {
    // Fail fast before touching the transport: never leak an encryption
    // operation in plaintext.
    let wire_payload = if call.options.encrypted {
        let mut cipher = lock_ignoring_poison(cipher);
        if !cipher.is_established() {
            debug!(method = ?call.method, "encryption operation without session key");
            return Err(CryptoError::KeyNotSet.into());
        }
        cipher.encrypt_payload(call.method, &call.payload)?
    } else {
        call.payload.clone()
    };

    let frame = frame::encode_request(call.method, &wire_payload);
    let max = transport.command_size();
    if frame.len() > max {
        return Err(crate::error::TransportError::FrameTooLarge {
            actual: frame.len(),
            max,
        }
        .into());
    }

    trace!(method = ?call.method, frame = %hex::encode(&frame), "sending request");
    transport.write(&frame)?;

    let notification = match transport.read_notification(config.response_timeout)? {
        Some(bytes) => bytes,
        None => {
            warn!(method = ?call.method, "no response within window");
            // A reply landing after the window must never be attributed to
            // the next call; drop whatever the transport still delivers.
            transport.reset()?;
            return Err(Error::Timeout);
        }
    };
    trace!(method = ?call.method, frame = %hex::encode(&notification), "received response");

    let response = frame::decode_response(&notification)?;
    if !response.is_success() {
        debug!(method = ?call.method, code = ?response.return_code, "device reported failure");
        return Err(Error::from_return_code(response.return_code, response.payload));
    }

    let payload = if call.options.encrypted {
        lock_ignoring_poison(cipher).decrypt_payload(call.method, &response.payload)?
    } else {
        response.payload
    };

    if call.options.keep_result {
        lock_ignoring_poison(cache).insert(call.method, payload.clone());
    }

    Ok(payload)
}
