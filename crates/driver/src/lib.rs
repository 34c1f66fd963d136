//! BLE smartcard reader driver
//!
//! Driver layer on top of the `blecard-rpc` protocol core:
//!
//! - AES-256-CCM session crypto and the ExchangeKey handshake
//! - Packed wire records (descriptor, settings, paired hosts, schedules,
//!   firmware log events)
//! - PC/SC-style card access over the SCard RPC method
//! - Per-device sessions with the ordered initialization sequence
//! - A registry tracking multiple sessions with a lifecycle event channel
//!
//! The BLE discovery layer is a collaborator, not part of this crate: it
//! hands the registry a connected [`blecard_rpc::RpcTransport`] plus the
//! device identity and everything from the handshake on happens here.
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export the protocol core for downstream callers.
pub use blecard_rpc;
pub use bytes::{Bytes, BytesMut};

// Main modules
pub mod card;
pub mod crypto;
pub mod device;
pub mod error;
pub mod records;
pub mod registry;
pub mod scard;
pub mod secure_channel;

pub use card::{Atr, CardProtocol, CardStatus, Disposition, ShareMode};
pub use crypto::{derive_session_key, SessionCipher, SessionKey};
pub use device::{
    serial_number_to_family, DeviceConfig, DeviceFamily, DeviceIdentity, DeviceSession,
    DeviceStatus, InitOperations, InitReport, InitStep,
};
pub use error::{CardError, Error, KeyExchangeError, RecordError, Result};
pub use records::{
    BatteryState, ByteOrder, DeviceDescriptor, DeviceSetting, HardwareAddress, LogEventData,
    LogEventDetail, PairedDeviceInfo, PairedDevices, SettingType, TimePoint, WorkingTimeRange,
};
pub use registry::{DeviceEvent, DeviceRegistry};
pub use scard::{CardChannel, CardHandle, CardSnapshot, ScardContext, ScardOp, Scope};
pub use secure_channel::{
    CredentialKind, CredentialStore, KeyExchangeState, MemoryCredentialStore, SessionKeyManager,
};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use blecard_rpc::prelude::*;

    pub use crate::card::{CardProtocol, CardStatus, Disposition, ShareMode};
    pub use crate::device::{
        DeviceConfig, DeviceIdentity, DeviceSession, DeviceStatus, InitOperations,
    };
    pub use crate::error::{CardError, Error, KeyExchangeError, Result};
    pub use crate::registry::{DeviceEvent, DeviceRegistry};
    pub use crate::scard::{CardChannel, CardHandle, ScardContext, Scope};
    pub use crate::secure_channel::{CredentialStore, MemoryCredentialStore};
}
