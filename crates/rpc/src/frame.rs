//! RPC frame codec
//!
//! A request frame is `[method:1][payload...]`, a response frame is
//! `[returnCode:1][payload...]`. When a call is encrypted the payload bytes
//! are the ciphertext followed by the CCM authentication tag; the codec does
//! not care, it only moves the leading byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// One-byte RPC method opcodes understood by the reader firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcMethod {
    /// Read the device descriptor (hardware address, serial, versions).
    DeviceDescriptor = 0x01,
    /// Smartcard operation; the payload carries a sub-operation discriminator.
    SCard = 0x02,
    /// Session key exchange.
    ExchangeKey = 0x03,
    /// Set the name shown by the device finder.
    SetDeviceFinderName = 0x04,
    /// Read the battery level (percent).
    BatteryLevel = 0x05,
    /// Read card information (ATR bookkeeping).
    CardInformation = 0x06,
    /// Read the device settings records.
    ReadSettings = 0x08,
    /// Read the device certificate.
    ReadCertificate = 0x09,
    /// Set the device wall-clock time.
    SetTime = 0x0A,
    /// Read the configured working time ranges.
    GetWorkingTimeRanges = 0x0B,
    /// Write the working time ranges.
    SetWorkingTimeRanges = 0x0C,
    /// Read the device state.
    GetDeviceState = 0x0D,
    /// Read the list of paired hosts.
    GetPairedList = 0x0E,
    /// Remove one paired host by ident.
    RemovePairedDevice = 0x0F,
    /// Read the negotiated data buffer size.
    GetDataBufferSize = 0x10,
    /// Read the battery state (charging flag plus level).
    GetBatteryState = 0x11,
    /// Enable dynamic BLE connection interval tuning.
    SetConnIntervalDynamic = 0x40,
    /// Set explicit BLE connection interval parameters.
    SetConnIntervalParams = 0x41,
    /// Initialize BLE link security.
    SetInitBleSecurity = 0x42,
    /// Set the notification packet data size.
    SetResponsePacketDataSize = 0x43,
    /// Read battery gauge parameters.
    GetGaugeParameters = 0x44,
    /// Set advertising interval parameters.
    SetAdvIntervalParams = 0x45,
    /// Enable dynamic advertising interval tuning.
    SetAdvIntervalDynamic = 0x46,
    /// Read RSSI statistics.
    GetRssiStats = 0x47,
    /// Read buffered firmware log events.
    GetLoggedEventData = 0x48,
    /// Ask the device whether encryption is required for this link.
    RequestEncryption = 0xA0,
}

impl RpcMethod {
    /// Whether this method may be issued in plaintext even on a link that
    /// mandates encryption. Everything else requires an established session
    /// key first.
    pub const fn plaintext_permitted(self) -> bool {
        matches!(
            self,
            Self::DeviceDescriptor | Self::ExchangeKey | Self::RequestEncryption
        )
    }

    /// Opcode byte as sent on the wire.
    pub const fn opcode(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for RpcMethod {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x01 => Self::DeviceDescriptor,
            0x02 => Self::SCard,
            0x03 => Self::ExchangeKey,
            0x04 => Self::SetDeviceFinderName,
            0x05 => Self::BatteryLevel,
            0x06 => Self::CardInformation,
            0x08 => Self::ReadSettings,
            0x09 => Self::ReadCertificate,
            0x0A => Self::SetTime,
            0x0B => Self::GetWorkingTimeRanges,
            0x0C => Self::SetWorkingTimeRanges,
            0x0D => Self::GetDeviceState,
            0x0E => Self::GetPairedList,
            0x0F => Self::RemovePairedDevice,
            0x10 => Self::GetDataBufferSize,
            0x11 => Self::GetBatteryState,
            0x40 => Self::SetConnIntervalDynamic,
            0x41 => Self::SetConnIntervalParams,
            0x42 => Self::SetInitBleSecurity,
            0x43 => Self::SetResponsePacketDataSize,
            0x44 => Self::GetGaugeParameters,
            0x45 => Self::SetAdvIntervalParams,
            0x46 => Self::SetAdvIntervalDynamic,
            0x47 => Self::GetRssiStats,
            0x48 => Self::GetLoggedEventData,
            0xA0 => Self::RequestEncryption,
            other => return Err(FrameError::UnknownMethod(other)),
        })
    }
}

/// One-byte result code carried by every RPC response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    /// The call succeeded; the payload is the method result.
    Success = 0x00,
    /// The request frame carried no method byte.
    MethodNotSpecified = 0x01,
    /// The device does not know the requested method.
    UnknownMethod = 0x02,
    /// The method ran and failed; payload bytes are diagnostic.
    MethodFailure = 0x03,
    /// The device could not decrypt the request payload.
    DecryptFailure = 0x04,
    /// The device could not encrypt the response payload.
    EncryptFailure = 0x05,
    /// No session key has been exchanged yet.
    KeyNotSet = 0x06,
    /// The payload was encrypted with the wrong key or profile.
    IncorrectEncryption = 0x07,
    /// The decrypted payload carried no method byte.
    EncryptedMethodNotSpecified = 0x08,
}

impl TryFrom<u8> for ReturnCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x00 => Self::Success,
            0x01 => Self::MethodNotSpecified,
            0x02 => Self::UnknownMethod,
            0x03 => Self::MethodFailure,
            0x04 => Self::DecryptFailure,
            0x05 => Self::EncryptFailure,
            0x06 => Self::KeyNotSet,
            0x07 => Self::IncorrectEncryption,
            0x08 => Self::EncryptedMethodNotSpecified,
            other => return Err(FrameError::UnknownReturnCode(other)),
        })
    }
}

/// Sub-reason byte reported when an `ExchangeKey` call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyFailure {
    /// The host random had the wrong length. Retryable.
    InvalidLength = 0x01,
    /// Encryption is disabled on the device. Terminal.
    EncryptionDisabled = 0x02,
    /// The device could not gather randomness. Retryable.
    NoRandom = 0x03,
}

impl KeyFailure {
    /// Parse the sub-reason from the diagnostic payload of a failed
    /// ExchangeKey response. Unknown or missing bytes yield `None`.
    pub fn from_diagnostic(payload: &[u8]) -> Option<Self> {
        match payload.first()? {
            0x01 => Some(Self::InvalidLength),
            0x02 => Some(Self::EncryptionDisabled),
            0x03 => Some(Self::NoRandom),
            _ => None,
        }
    }

    /// Whether a fresh attempt with new randomness may succeed.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::InvalidLength | Self::NoRandom)
    }
}

/// A decoded RPC response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Result code from the leading byte.
    pub return_code: ReturnCode,
    /// Remaining bytes. Method result on `Success`, opaque diagnostic bytes
    /// otherwise (may be empty).
    pub payload: Bytes,
}

impl ResponseFrame {
    /// Whether the frame reports success.
    pub fn is_success(&self) -> bool {
        self.return_code == ReturnCode::Success
    }
}

/// Encode a request frame: method opcode followed by the payload bytes.
pub fn encode_request(method: RpcMethod, payload: &[u8]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(1 + payload.len());
    buffer.put_u8(method.opcode());
    buffer.put_slice(payload);
    buffer.freeze()
}

/// Decode a response frame.
///
/// Fails with [`FrameError::Truncated`] on an empty buffer and
/// [`FrameError::UnknownReturnCode`] for codes outside the enumeration, so a
/// newer firmware never crashes an older host.
pub fn decode_response(bytes: &[u8]) -> Result<ResponseFrame, FrameError> {
    let (&code, payload) = bytes.split_first().ok_or(FrameError::Truncated)?;
    Ok(ResponseFrame {
        return_code: ReturnCode::try_from(code)?,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Decode a request frame into its method and payload.
///
/// Used by simulated peripherals and diagnostics; the host side only encodes.
pub fn decode_request(bytes: &[u8]) -> Result<(RpcMethod, Bytes), FrameError> {
    let (&opcode, payload) = bytes.split_first().ok_or(FrameError::Truncated)?;
    Ok((RpcMethod::try_from(opcode)?, Bytes::copy_from_slice(payload)))
}
