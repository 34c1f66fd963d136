//! PC/SC emulation over the SCard RPC method
//!
//! The reader exposes one card slot. `SCardConnect`-style calls are
//! translated into RPC method 0x02 frames whose first payload byte is the
//! sub-operation discriminator. Context and handle bookkeeping is local; the
//! reader only sees the sub-operation exchanges.
//!
//! A [`CardChannel`] holds a weak reference to its owning session, so an
//! outstanding handle never keeps a disconnected device alive and every call
//! after disconnect reports failure instead of silently succeeding.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use blecard_rpc::error::ProtocolError;
use blecard_rpc::{CallOptions, Error as RpcError, RpcDispatcher, RpcMethod};

use crate::card::{Atr, CardProtocol, CardStatus, Disposition, ShareMode};
use crate::error::{CardError, Error, Result};

/// SCard sub-operation discriminator, first payload byte of method 0x02.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScardOp {
    /// Power the card and return its ATR.
    Connect = 0x01,
    /// Exchange one APDU.
    Transmit = 0x02,
    /// Close the connection with a disposition.
    Disconnect = 0x03,
    /// Open a critical section on the card.
    BeginTransaction = 0x04,
    /// Close the critical section.
    EndTransaction = 0x05,
    /// Query reader-side card status.
    Status = 0x06,
    /// Switch the active protocol.
    SetProtocol = 0x07,
}

impl TryFrom<u8> for ScardOp {
    type Error = CardError;

    fn try_from(value: u8) -> std::result::Result<Self, CardError> {
        Ok(match value {
            0x01 => Self::Connect,
            0x02 => Self::Transmit,
            0x03 => Self::Disconnect,
            0x04 => Self::BeginTransaction,
            0x05 => Self::EndTransaction,
            0x06 => Self::Status,
            0x07 => Self::SetProtocol,
            _ => return Err(CardError::InvalidHandle),
        })
    }
}

/// Scope an application context is established under. Bookkeeping only; the
/// reader itself has no notion of host-side scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Per-user context.
    #[default]
    User,
    /// System-wide context.
    System,
}

/// Opaque context token from [`CardChannel::establish_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScardContext {
    id: u32,
    scope: Scope,
}

impl ScardContext {
    /// The scope this context was established under.
    pub const fn scope(&self) -> Scope {
        self.scope
    }
}

/// Opaque card handle from [`CardChannel::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardHandle(u32);

/// Local snapshot returned by [`CardChannel::status`]. No round trip.
#[derive(Debug, Clone)]
pub struct CardSnapshot {
    /// Current card status as last reported by the device.
    pub status: CardStatus,
    /// Protocols the ATR indicated.
    pub supported_protocols: CardProtocol,
    /// Protocol currently active on the connection.
    pub active_protocol: CardProtocol,
    /// The ATR captured at connect time.
    pub atr: Atr,
}

struct CardSlot {
    handle: CardHandle,
    atr: Atr,
    supported: CardProtocol,
    active: CardProtocol,
}

#[derive(Default)]
struct ScardState {
    context: Option<u32>,
    next_id: u32,
    slot: Option<CardSlot>,
    transaction_owner: Option<CardHandle>,
}

/// State shared between the device session and the card channels it hands
/// out.
pub(crate) struct SessionShared {
    pub(crate) dispatcher: RpcDispatcher,
    pub(crate) connected: AtomicBool,
    pub(crate) encrypted: AtomicBool,
    card_status: AtomicU8,
    scard: Mutex<ScardState>,
}

impl SessionShared {
    pub(crate) fn new(dispatcher: RpcDispatcher) -> Self {
        Self {
            dispatcher,
            connected: AtomicBool::new(true),
            encrypted: AtomicBool::new(false),
            card_status: AtomicU8::new(CardStatus::Unknown as u8),
            scard: Mutex::new(ScardState::default()),
        }
    }

    pub(crate) fn card_status(&self) -> CardStatus {
        CardStatus::try_from(self.card_status.load(Ordering::SeqCst))
            .unwrap_or(CardStatus::Unknown)
    }

    pub(crate) fn set_card_status(&self, status: CardStatus) {
        self.card_status.store(status as u8, Ordering::SeqCst);
    }

    /// Drop all card state. Called on device disconnect.
    pub(crate) fn invalidate(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.set_card_status(CardStatus::Unknown);
        let mut scard = lock(&self.scard);
        *scard = ScardState::default();
    }

    fn call_options(&self) -> CallOptions {
        if self.encrypted.load(Ordering::SeqCst) {
            CallOptions::encrypted()
        } else {
            CallOptions::plain()
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// PC/SC-style access to the reader's single card slot.
#[derive(Clone)]
pub struct CardChannel {
    shared: Weak<SessionShared>,
}

impl std::fmt::Debug for CardChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardChannel")
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl CardChannel {
    pub(crate) fn new(shared: &Arc<SessionShared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    fn session(&self) -> Result<Arc<SessionShared>> {
        let shared = self.shared.upgrade().ok_or(Error::NotConnected)?;
        if !shared.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        Ok(shared)
    }

    fn require_status(shared: &SessionShared, floor: CardStatus) -> Result<()> {
        if shared.card_status() < floor {
            return Err(CardError::CardAbsent.into());
        }
        Ok(())
    }

    fn scard_call(shared: &SessionShared, op: ScardOp, body: &[u8]) -> Result<Bytes> {
        let mut payload = BytesMut::with_capacity(1 + body.len());
        payload.put_u8(op as u8);
        payload.put_slice(body);

        trace!(?op, body = %hex::encode(body), "scard request");
        match shared
            .dispatcher
            .call_blocking(RpcMethod::SCard, payload.freeze(), shared.call_options())
        {
            Ok(reply) => Ok(reply),
            Err(RpcError::Protocol(ProtocolError::MethodFailure { diagnostic })) => {
                Err(CardError::from_diagnostic(&diagnostic).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Claim the single application context under `scope`. Fails with
    /// [`CardError::InvalidHandle`] while another context is outstanding.
    pub fn establish_context(&self, scope: Scope) -> Result<ScardContext> {
        let shared = self.session()?;
        let mut scard = lock(&shared.scard);
        if scard.context.is_some() {
            return Err(CardError::InvalidHandle.into());
        }
        scard.next_id += 1;
        let id = scard.next_id;
        scard.context = Some(id);
        Ok(ScardContext { id, scope })
    }

    /// Release the context. Any open card connection is dropped locally.
    pub fn release_context(&self, context: ScardContext) -> Result<()> {
        let shared = self.session()?;
        let mut scard = lock(&shared.scard);
        if scard.context != Some(context.id) {
            return Err(CardError::InvalidHandle.into());
        }
        scard.context = None;
        scard.slot = None;
        scard.transaction_owner = None;
        Ok(())
    }

    /// Power the card and negotiate a protocol.
    ///
    /// Requires a card at least `Present`. The active protocol follows the
    /// ATR's interface-byte chain, narrowed by `preferred`.
    pub fn connect(
        &self,
        context: ScardContext,
        share_mode: ShareMode,
        preferred: CardProtocol,
    ) -> Result<(CardHandle, CardProtocol)> {
        let shared = self.session()?;
        Self::require_status(&shared, CardStatus::Present)?;

        {
            let scard = lock(&shared.scard);
            if scard.context != Some(context.id) {
                return Err(CardError::InvalidHandle.into());
            }
            if scard.slot.is_some() || scard.transaction_owner.is_some() {
                return Err(CardError::SharingViolation.into());
            }
        }

        let reply = Self::scard_call(
            &shared,
            ScardOp::Connect,
            &[share_mode as u8, preferred.bits()],
        )?;
        let atr = Atr::parse(&reply)?;
        let supported = atr.supported_protocols();
        let active = negotiate_protocol(preferred, &atr)?;

        let mut scard = lock(&shared.scard);
        scard.next_id += 1;
        let handle = CardHandle(scard.next_id);
        scard.slot = Some(CardSlot {
            handle,
            atr,
            supported,
            active,
        });
        shared.set_card_status(CardStatus::Specific);
        debug!(%active, "card connected");
        Ok((handle, active))
    }

    /// Exchange one APDU. Requires the card to be at least `Powered`; below
    /// that the call fails locally without touching the transport.
    pub fn transmit(&self, handle: CardHandle, capdu: &[u8]) -> Result<Bytes> {
        let shared = self.session()?;
        Self::require_status(&shared, CardStatus::Powered)?;
        let active = {
            let scard = lock(&shared.scard);
            let slot = Self::slot_for(&scard, handle)?;
            if let Some(owner) = scard.transaction_owner {
                if owner != handle {
                    return Err(CardError::SharingViolation.into());
                }
            }
            slot.active
        };

        let mut body = BytesMut::with_capacity(1 + capdu.len());
        body.put_u8(active.bits());
        body.put_slice(capdu);
        Self::scard_call(&shared, ScardOp::Transmit, &body)
    }

    /// Local status snapshot; no round trip.
    pub fn status(&self, handle: CardHandle) -> Result<CardSnapshot> {
        let shared = self.session()?;
        let scard = lock(&shared.scard);
        let slot = Self::slot_for(&scard, handle)?;
        Ok(CardSnapshot {
            status: shared.card_status(),
            supported_protocols: slot.supported,
            active_protocol: slot.active,
            atr: slot.atr.clone(),
        })
    }

    /// Open a critical section. Re-entering from the owning handle is a
    /// no-op; any other handle gets [`CardError::SharingViolation`] until the
    /// section closes.
    pub fn begin_transaction(&self, handle: CardHandle) -> Result<()> {
        let shared = self.session()?;
        Self::require_status(&shared, CardStatus::Powered)?;
        {
            let scard = lock(&shared.scard);
            Self::slot_for(&scard, handle)?;
            match scard.transaction_owner {
                Some(owner) if owner == handle => return Ok(()),
                Some(_) => return Err(CardError::SharingViolation.into()),
                None => {}
            }
        }
        Self::scard_call(&shared, ScardOp::BeginTransaction, &[])?;
        lock(&shared.scard).transaction_owner = Some(handle);
        Ok(())
    }

    /// Close the critical section opened by `handle`.
    pub fn end_transaction(&self, handle: CardHandle, disposition: Disposition) -> Result<()> {
        let shared = self.session()?;
        {
            let scard = lock(&shared.scard);
            Self::slot_for(&scard, handle)?;
            if scard.transaction_owner != Some(handle) {
                return Err(CardError::InvalidHandle.into());
            }
        }
        let result = Self::scard_call(&shared, ScardOp::EndTransaction, &[disposition as u8]);
        // The section closes even when the reader call failed.
        lock(&shared.scard).transaction_owner = None;
        result.map(|_| ())
    }

    /// Close the connection. The slot is released even when the reader call
    /// fails, so a dead link can never wedge the channel.
    pub fn disconnect(&self, handle: CardHandle, disposition: Disposition) -> Result<()> {
        let shared = self.session()?;
        {
            let mut scard = lock(&shared.scard);
            Self::slot_for(&scard, handle)?;
            scard.slot = None;
            scard.transaction_owner = None;
        }
        if matches!(
            disposition,
            Disposition::UnpowerCard | Disposition::EjectCard
        ) {
            shared.set_card_status(CardStatus::Present);
        }
        Self::scard_call(&shared, ScardOp::Disconnect, &[disposition as u8]).map(|_| ())
    }

    /// Switch the active protocol. Only a single ISO protocol the ATR listed
    /// is accepted; anything else fails locally.
    pub fn set_protocol(&self, handle: CardHandle, protocol: CardProtocol) -> Result<()> {
        let shared = self.session()?;
        Self::require_status(&shared, CardStatus::Powered)?;
        {
            let scard = lock(&shared.scard);
            let slot = Self::slot_for(&scard, handle)?;
            if !protocol.is_single_iso() || !slot.supported.contains(protocol) {
                return Err(CardError::NotSupportedProtocol.into());
            }
        }
        Self::scard_call(&shared, ScardOp::SetProtocol, &[protocol.bits()])?;
        let mut scard = lock(&shared.scard);
        if let Some(slot) = scard.slot.as_mut() {
            slot.active = protocol;
        }
        shared.set_card_status(CardStatus::Specific);
        Ok(())
    }

    fn slot_for<'a>(scard: &'a ScardState, handle: CardHandle) -> Result<&'a CardSlot> {
        match scard.slot.as_ref() {
            Some(slot) if slot.handle == handle => Ok(slot),
            _ => Err(CardError::InvalidHandle.into()),
        }
    }
}

/// Pick the active protocol from the card's ATR and the caller's preference
/// mask.
fn negotiate_protocol(preferred: CardProtocol, atr: &Atr) -> Result<CardProtocol> {
    let supported = atr.supported_protocols();
    let wanted = if preferred.is_empty() {
        CardProtocol::TX
    } else {
        preferred
    };

    if wanted.contains(atr.preferred_protocol()) {
        return Ok(atr.preferred_protocol());
    }
    for candidate in [CardProtocol::T1, CardProtocol::T0] {
        if wanted.contains(candidate) && supported.contains(candidate) {
            return Ok(candidate);
        }
    }
    Err(CardError::NotSupportedProtocol.into())
}
