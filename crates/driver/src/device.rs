//! Device session: status machine, initialization sequence and cached
//! properties
//!
//! One session owns one physical reader: its RPC dispatcher, its key manager
//! and the shared card state the [`CardChannel`] handles point at. Properties
//! like the descriptor or battery level are `None` until the corresponding
//! init step has succeeded.

use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};
use uuid::Uuid;

use blecard_rpc::error::CryptoError;
use blecard_rpc::{
    frame, CallOptions, DispatcherConfig, Error as RpcError, RpcDispatcher, RpcMethod,
    RpcTransport,
};

use crate::card::CardStatus;
use crate::crypto::SessionCipher;
use crate::error::{Error, RecordError, Result};
use crate::records::{
    decode_log_events, decode_settings, decode_working_times, encode_working_times, BatteryState,
    ByteOrder, DeviceDescriptor, DeviceSetting, HardwareAddress, LogEventData, PairedDevices,
    SettingType, WorkingTimeRange,
};
use crate::scard::{CardChannel, SessionShared};
use crate::secure_channel::{cleanup_ltk, has_ltk, CredentialStore, SessionKeyManager};

/// Hardware family encoded in the serial number prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceFamily {
    /// Unparsable serial number. Not an error.
    Invalid = 0,
    /// The original reader.
    Classic = 5,
    /// USB dongle variant.
    Dongle = 6,
    /// Mini variant.
    Mini = 7,
    /// Micro variant.
    Micro = 8,
    /// Second generation.
    Two = 9,
    /// Third generation.
    Three = 10,
    /// Single-key variant.
    OkidOne = 11,
    /// Second generation mini.
    TwoMini = 12,
    /// Third generation mini.
    ThreeMini = 13,
}

/// Classify a serial number into its device family.
///
/// The family code is the leading digits of the serial: a two-digit code in
/// 10..=13 wins over a one-digit code in 5..=9, so `"1005..."` is `Three`
/// while `"905..."` is `Two`. Anything unparsable is `Invalid`.
pub fn serial_number_to_family(serial: &str) -> DeviceFamily {
    if let Some(code) = serial.get(..2).and_then(|s| s.parse::<u8>().ok()) {
        match code {
            10 => return DeviceFamily::Three,
            11 => return DeviceFamily::OkidOne,
            12 => return DeviceFamily::TwoMini,
            13 => return DeviceFamily::ThreeMini,
            _ => {}
        }
    }
    match serial.get(..1).and_then(|s| s.parse::<u8>().ok()) {
        Some(5) => DeviceFamily::Classic,
        Some(6) => DeviceFamily::Dongle,
        Some(7) => DeviceFamily::Mini,
        Some(8) => DeviceFamily::Micro,
        Some(9) => DeviceFamily::Two,
        _ => DeviceFamily::Invalid,
    }
}

/// Session status progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// No link; also the terminal state after transport loss.
    Absent,
    /// The transport is up, initialization has not started.
    Connected,
    /// The init sequence is running.
    Initializing,
    /// The init sequence completed.
    Initialized,
    /// The handshake failed; terminal until the caller retries.
    FailedToConnect,
}

/// Bit set selecting the initialization steps to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOperations(u16);

impl InitOperations {
    /// Read the device descriptor.
    pub const READ_DEVICE_DESCRIPTOR: Self = Self(1 << 0);
    /// Read the battery level.
    pub const READ_BATTERY_LEVEL: Self = Self(1 << 1);
    /// Read card information and seed the card status.
    pub const READ_CARD_INFO: Self = Self(1 << 2);
    /// Read the settings records.
    pub const READ_SETTINGS: Self = Self(1 << 3);
    /// Push the host name to the device finder.
    pub const SET_FINDER_NAME: Self = Self(1 << 4);
    /// Push the current wall-clock time.
    pub const SET_TIME: Self = Self(1 << 5);
    /// Read the working-time schedule.
    pub const GET_WORKING_TIME: Self = Self(1 << 6);
    /// Run the 256-bit session key exchange.
    pub const AES256_KEY: Self = Self(1 << 7);
    /// Read the negotiated data buffer size.
    pub const GET_DATA_BUFFER_SIZE: Self = Self(1 << 8);

    /// Every step.
    pub const ALL: Self = Self(0x01FF);
    /// No steps.
    pub const NONE: Self = Self(0);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for InitOperations {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for InitOperations {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Execution order of the initialization steps.
const INIT_ORDER: [(InitOperations, &str); 9] = [
    (InitOperations::READ_DEVICE_DESCRIPTOR, "device descriptor"),
    (InitOperations::READ_BATTERY_LEVEL, "battery level"),
    (InitOperations::READ_CARD_INFO, "card information"),
    (InitOperations::READ_SETTINGS, "settings"),
    (InitOperations::SET_FINDER_NAME, "finder name"),
    (InitOperations::SET_TIME, "set time"),
    (InitOperations::GET_WORKING_TIME, "working time"),
    (InitOperations::AES256_KEY, "key exchange"),
    (InitOperations::GET_DATA_BUFFER_SIZE, "data buffer size"),
];

/// Outcome of one initialization step.
#[derive(Debug, Clone)]
pub struct InitStep {
    /// Which step ran.
    pub operation: InitOperations,
    /// Human-readable step name.
    pub name: &'static str,
    /// Step result. A failed optional step does not abort the sequence.
    pub outcome: std::result::Result<(), Error>,
}

/// Per-step outcomes of the last initialization run.
pub type InitReport = Vec<InitStep>;

/// Identity handed over by the discovery layer.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Stable device identifier.
    pub id: Uuid,
    /// Advertised device name.
    pub name: String,
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Seal every non-plaintext-permitted method with the session key.
    pub requires_encryption: bool,
    /// Initialization steps to run.
    pub init_operations: InitOperations,
    /// Host name pushed by the finder-name step, when set.
    pub finder_name: Option<String>,
    /// Integer byte order of the device family's packed records.
    pub byte_order: ByteOrder,
    /// Credential store scope for this host.
    pub access_group: String,
    /// Dispatcher tuning.
    pub dispatcher: DispatcherConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            requires_encryption: true,
            init_operations: InitOperations::ALL,
            finder_name: None,
            byte_order: ByteOrder::default(),
            access_group: "default".into(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// One connected reader.
pub struct DeviceSession {
    identity: DeviceIdentity,
    config: DeviceConfig,
    shared: Arc<SessionShared>,
    key_manager: SessionKeyManager,
    credentials: Arc<dyn CredentialStore>,
    status: DeviceStatus,
    descriptor: Option<DeviceDescriptor>,
    battery_level: Option<u8>,
    battery_state: Option<BatteryState>,
    settings: HashMap<SettingType, u8>,
    working_times: Option<Vec<WorkingTimeRange>>,
    data_buffer_size: Option<u32>,
    init_report: InitReport,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.identity.id)
            .field("name", &self.identity.name)
            .field("status", &self.status)
            .finish()
    }
}

impl DeviceSession {
    /// Wrap an already connected transport. The session starts in
    /// `Connected`; call [`initialize`](Self::initialize) to run the init
    /// sequence.
    pub fn new<T>(
        identity: DeviceIdentity,
        transport: T,
        config: DeviceConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self
    where
        T: RpcTransport + 'static,
    {
        let cipher = Arc::new(Mutex::new(SessionCipher::new()));
        let dispatcher = RpcDispatcher::new(transport, cipher.clone(), config.dispatcher);
        let shared = Arc::new(SessionShared::new(dispatcher));
        shared
            .encrypted
            .store(config.requires_encryption, Ordering::SeqCst);

        Self {
            identity,
            config,
            shared,
            key_manager: SessionKeyManager::new(cipher),
            credentials,
            status: DeviceStatus::Connected,
            descriptor: None,
            battery_level: None,
            battery_state: None,
            settings: HashMap::new(),
            working_times: None,
            data_buffer_size: None,
            init_report: Vec::new(),
        }
    }

    /// Stable device identifier.
    pub const fn id(&self) -> Uuid {
        self.identity.id
    }

    /// Advertised device name.
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Current session status.
    pub const fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Card status as last reported by the device.
    pub fn card_status(&self) -> CardStatus {
        self.shared.card_status()
    }

    /// Outcomes of the last initialization run.
    pub fn init_report(&self) -> &InitReport {
        &self.init_report
    }

    /// Run the configured initialization steps in their fixed order.
    ///
    /// A failed step is recorded and the sequence continues, except a failed
    /// key exchange while encryption is mandatory, which aborts the whole
    /// run and leaves the session in `FailedToConnect`.
    pub fn initialize(&mut self) -> Result<&InitReport> {
        self.status = DeviceStatus::Initializing;
        self.init_report = Vec::new();
        info!(device = %self.identity.id, "initializing");

        for (operation, name) in INIT_ORDER {
            if !self.config.init_operations.contains(operation) {
                continue;
            }
            let outcome = self.run_init_step(operation);
            if let Err(err) = &outcome {
                warn!(step = name, %err, "init step failed");
                if operation == InitOperations::AES256_KEY && self.config.requires_encryption {
                    let err = err.clone();
                    self.init_report.push(InitStep {
                        operation,
                        name,
                        outcome,
                    });
                    self.status = DeviceStatus::FailedToConnect;
                    return Err(err);
                }
            }
            self.init_report.push(InitStep {
                operation,
                name,
                outcome,
            });
        }

        self.status = DeviceStatus::Initialized;
        info!(device = %self.identity.id, "initialized");
        Ok(&self.init_report)
    }

    fn run_init_step(&mut self, operation: InitOperations) -> std::result::Result<(), Error> {
        match operation {
            InitOperations::READ_DEVICE_DESCRIPTOR => {
                let payload = self.call_cached(RpcMethod::DeviceDescriptor)?;
                self.descriptor = Some(DeviceDescriptor::from_bytes(&payload)?);
                Ok(())
            }
            InitOperations::READ_BATTERY_LEVEL => {
                let payload = self.call_method(RpcMethod::BatteryLevel, Bytes::new())?;
                self.battery_level = Some(*payload.first().ok_or(RecordError::Truncated {
                    expected: 1,
                    actual: 0,
                })?);
                Ok(())
            }
            InitOperations::READ_CARD_INFO => self.refresh_card_information().map(|_| ()),
            InitOperations::READ_SETTINGS => {
                let payload = self.call_method(RpcMethod::ReadSettings, Bytes::new())?;
                self.settings = decode_settings(&payload)?
                    .into_iter()
                    .map(|s| (s.setting_type, s.value))
                    .collect();
                Ok(())
            }
            InitOperations::SET_FINDER_NAME => {
                let Some(name) = self.config.finder_name.clone() else {
                    return Ok(());
                };
                self.call_method(RpcMethod::SetDeviceFinderName, Bytes::from(name))?;
                Ok(())
            }
            InitOperations::SET_TIME => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or_default();
                let mut payload = BytesMut::with_capacity(4);
                match self.config.byte_order {
                    ByteOrder::Little => payload.put_u32_le(now),
                    ByteOrder::Big => payload.put_u32(now),
                }
                self.call_method(RpcMethod::SetTime, payload.freeze())?;
                Ok(())
            }
            InitOperations::GET_WORKING_TIME => {
                let payload = self.call_method(RpcMethod::GetWorkingTimeRanges, Bytes::new())?;
                self.working_times = Some(decode_working_times(&payload)?);
                Ok(())
            }
            InitOperations::AES256_KEY => {
                if self.key_manager.is_established() {
                    return Ok(());
                }
                self.key_manager.exchange(&self.shared.dispatcher)
            }
            InitOperations::GET_DATA_BUFFER_SIZE => {
                let payload = self.call_method(RpcMethod::GetDataBufferSize, Bytes::new())?;
                if payload.len() < 4 {
                    return Err(RecordError::Truncated {
                        expected: 4,
                        actual: payload.len(),
                    }
                    .into());
                }
                let bytes = [payload[0], payload[1], payload[2], payload[3]];
                self.data_buffer_size = Some(match self.config.byte_order {
                    ByteOrder::Little => u32::from_le_bytes(bytes),
                    ByteOrder::Big => u32::from_be_bytes(bytes),
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Issue one RPC, sealing it when the link mandates encryption. A
    /// `KeyNotSet` failure triggers one automatic key exchange and retry.
    pub fn call_method(&mut self, method: RpcMethod, payload: Bytes) -> Result<Bytes> {
        self.call_with(method, payload, false)
    }

    fn call_cached(&mut self, method: RpcMethod) -> Result<Bytes> {
        self.call_with(method, Bytes::new(), true)
    }

    fn call_with(&mut self, method: RpcMethod, payload: Bytes, keep: bool) -> Result<Bytes> {
        let encrypted = self.config.requires_encryption && !method.plaintext_permitted();
        let mut options = if encrypted {
            CallOptions::encrypted()
        } else {
            CallOptions::plain()
        };
        if keep {
            options = options.with_keep_result();
        }

        let first = self
            .shared
            .dispatcher
            .call_blocking(method, payload.clone(), options);
        let result = match first {
            Err(RpcError::Crypto(CryptoError::KeyNotSet)) if encrypted => {
                debug!(?method, "no session key, exchanging before retry");
                self.key_manager.exchange(&self.shared.dispatcher)?;
                self.shared
                    .dispatcher
                    .call_blocking(method, payload, options)
                    .map_err(Error::from)
            }
            other => other.map_err(Error::from),
        };

        if let Err(err) = &result {
            if err.is_transport() {
                self.mark_link_lost();
            }
        }
        result
    }

    fn mark_link_lost(&mut self) {
        warn!(device = %self.identity.id, "transport lost, session absent");
        self.status = DeviceStatus::Absent;
        self.key_manager.reset();
        self.shared.dispatcher.clear_cache();
        self.shared.invalidate();
    }

    /// Read card information and update the card status. Returns the new
    /// status.
    pub fn refresh_card_information(&mut self) -> Result<CardStatus> {
        let payload = self.call_method(RpcMethod::CardInformation, Bytes::new())?;
        let status = CardStatus::try_from(*payload.first().ok_or(RecordError::Truncated {
            expected: 1,
            actual: 0,
        })?)?;
        self.shared.set_card_status(status);
        Ok(status)
    }

    /// A card channel over this session's slot. The channel holds a weak
    /// reference; it fails once the session is gone.
    pub fn card_channel(&self) -> CardChannel {
        CardChannel::new(&self.shared)
    }

    /// Device descriptor, once read.
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    /// Hardware address from the descriptor.
    pub fn hardware_address(&self) -> Option<HardwareAddress> {
        self.descriptor.as_ref().map(|d| d.hardware_address)
    }

    /// Serial number from the descriptor.
    pub fn serial_number(&self) -> Option<&str> {
        self.descriptor.as_ref().map(|d| d.serial_number.as_str())
    }

    /// Firmware version from the descriptor.
    pub fn firmware_version(&self) -> Option<&str> {
        self.descriptor
            .as_ref()
            .map(|d| d.firmware_version.as_str())
    }

    /// Device family classified from the serial number.
    pub fn family(&self) -> DeviceFamily {
        self.serial_number()
            .map(serial_number_to_family)
            .unwrap_or(DeviceFamily::Invalid)
    }

    /// Battery level percent, once read.
    pub const fn battery_level(&self) -> Option<u8> {
        self.battery_level
    }

    /// Battery state from the last [`read_battery_state`](Self::read_battery_state).
    pub const fn battery_state(&self) -> Option<BatteryState> {
        self.battery_state
    }

    /// Settings read during initialization or updated since.
    pub const fn settings(&self) -> &HashMap<SettingType, u8> {
        &self.settings
    }

    /// Working-time schedule, once read.
    pub fn working_times(&self) -> Option<&[WorkingTimeRange]> {
        self.working_times.as_deref()
    }

    /// Negotiated data buffer size, once read.
    pub const fn data_buffer_size(&self) -> Option<u32> {
        self.data_buffer_size
    }

    /// Ask the device whether it mandates encryption on this link. Always
    /// sent in plaintext.
    pub fn request_encryption(&mut self) -> Result<bool> {
        let payload = self.call_method(RpcMethod::RequestEncryption, Bytes::new())?;
        Ok(payload.first().copied().unwrap_or(0) != 0)
    }

    /// Read the device certificate. The payload is opaque to the driver.
    pub fn read_certificate(&mut self) -> Result<Bytes> {
        self.call_method(RpcMethod::ReadCertificate, Bytes::new())
    }

    /// Read the raw device state bytes.
    pub fn device_state(&mut self) -> Result<Bytes> {
        self.call_method(RpcMethod::GetDeviceState, Bytes::new())
    }

    /// Read the charging flag and battery level.
    pub fn read_battery_state(&mut self) -> Result<BatteryState> {
        let payload = self.call_method(RpcMethod::GetBatteryState, Bytes::new())?;
        let state = BatteryState::from_bytes(&payload)?;
        self.battery_state = Some(state);
        self.battery_level = Some(state.level);
        Ok(state)
    }

    /// Read the list of paired hosts.
    pub fn paired_devices(&mut self) -> Result<PairedDevices> {
        let payload = self.call_method(RpcMethod::GetPairedList, Bytes::new())?;
        Ok(PairedDevices::from_bytes(&payload)?)
    }

    /// Remove one paired host; the device answers with the refreshed list.
    pub fn remove_paired_device(&mut self, ident: u8) -> Result<PairedDevices> {
        let payload =
            self.call_method(RpcMethod::RemovePairedDevice, Bytes::copy_from_slice(&[ident]))?;
        Ok(PairedDevices::from_bytes(&payload)?)
    }

    /// Write one setting; the device answers with the full refreshed
    /// settings sequence.
    pub fn change_setting(&mut self, setting: DeviceSetting) -> Result<()> {
        let payload = self.call_method(
            RpcMethod::ReadSettings,
            Bytes::copy_from_slice(&setting.to_bytes()),
        )?;
        self.settings = decode_settings(&payload)?
            .into_iter()
            .map(|s| (s.setting_type, s.value))
            .collect();
        Ok(())
    }

    /// Write the working-time schedule.
    pub fn set_working_times(&mut self, ranges: &[WorkingTimeRange]) -> Result<()> {
        let payload = encode_working_times(ranges)?;
        self.call_method(RpcMethod::SetWorkingTimeRanges, payload)?;
        self.working_times = Some(ranges.to_vec());
        Ok(())
    }

    /// Read and decode the buffered firmware log events.
    pub fn logged_events(&mut self) -> Result<Vec<LogEventData>> {
        let payload = self.call_method(RpcMethod::GetLoggedEventData, Bytes::new())?;
        Ok(decode_log_events(&payload, self.config.byte_order)?)
    }

    /// Escape hatch: send a pre-framed `[method][payload...]` buffer through
    /// the same queue and encryption rules as any other call.
    pub fn send_raw(&mut self, raw: &[u8]) -> Result<Bytes> {
        let (method, payload) = frame::decode_request(raw).map_err(RpcError::from)?;
        self.call_method(method, payload)
    }

    /// Whether a long-term key is stored for this device.
    pub fn has_stored_ltk(&self) -> bool {
        has_ltk(
            self.credentials.as_ref(),
            self.identity.id,
            &self.config.access_group,
        )
    }

    /// Forget the stored pairing secrets for this device.
    pub fn forget_pairing(&self) {
        cleanup_ltk(
            self.credentials.as_ref(),
            self.identity.id,
            &self.config.access_group,
        );
    }

    /// Tear the session down: session key dropped, caches cleared, any
    /// outstanding card handle invalidated.
    pub fn disconnect(&mut self) {
        debug!(device = %self.identity.id, "disconnecting");
        self.status = DeviceStatus::Absent;
        self.key_manager.reset();
        self.shared.dispatcher.clear_cache();
        self.shared.invalidate();
    }
}
