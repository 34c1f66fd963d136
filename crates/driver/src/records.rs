//! Packed binary records carried as RPC payloads
//!
//! Field order and packing are part of the wire contract. Multi-byte integers
//! follow the per-family [`ByteOrder`]; everything shipping today is
//! little-endian, but the order is kept as a configuration point.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RecordError;

/// Integer byte order used by a device family's packed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Least significant byte first. Every current family.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    fn read_u16(self, bytes: &[u8; 2]) -> u16 {
        match self {
            Self::Little => u16::from_le_bytes(*bytes),
            Self::Big => u16::from_be_bytes(*bytes),
        }
    }

    fn read_u32(self, bytes: &[u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(*bytes),
            Self::Big => u32::from_be_bytes(*bytes),
        }
    }

    fn put_u16(self, buffer: &mut BytesMut, value: u16) {
        match self {
            Self::Little => buffer.put_u16_le(value),
            Self::Big => buffer.put_u16(value),
        }
    }

    fn put_u32(self, buffer: &mut BytesMut, value: u32) {
        match self {
            Self::Little => buffer.put_u32_le(value),
            Self::Big => buffer.put_u32(value),
        }
    }
}

fn need(bytes: &[u8], expected: usize) -> Result<(), RecordError> {
    if bytes.len() < expected {
        return Err(RecordError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn take_u16(order: ByteOrder, bytes: &[u8], at: usize) -> u16 {
    order.read_u16(&[bytes[at], bytes[at + 1]])
}

fn take_u32(order: ByteOrder, bytes: &[u8], at: usize) -> u32 {
    order.read_u32(&[bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// 6-byte BLE hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareAddress(pub [u8; 6]);

impl HardwareAddress {
    /// Parse from the leading 6 bytes of a record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        need(bytes, 6)?;
        let mut address = [0u8; 6];
        address.copy_from_slice(&bytes[..6]);
        Ok(Self(address))
    }
}

impl std::fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Known device setting identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SettingType {
    /// Transmit signal strength.
    SignalStrength = 0x01,
    /// Advertising mode.
    AdvertisingMode = 0x02,
    /// Display enable.
    Display = 0x03,
    /// Display backlight level.
    Backlight = 0x04,
    /// Display contrast.
    Contrast = 0x05,
    /// Buzzer enable.
    Buzzer = 0x06,
    /// Link encryption requirement.
    Encryption = 0x07,
    /// Radio coverage class.
    Coverage = 0x08,
}

impl TryFrom<u8> for SettingType {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, RecordError> {
        Ok(match value {
            0x01 => Self::SignalStrength,
            0x02 => Self::AdvertisingMode,
            0x03 => Self::Display,
            0x04 => Self::Backlight,
            0x05 => Self::Contrast,
            0x06 => Self::Buzzer,
            0x07 => Self::Encryption,
            0x08 => Self::Coverage,
            other => return Err(RecordError::UnknownSettingType(other)),
        })
    }
}

/// One 2-byte settings record: `[type:1][value:1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSetting {
    /// Which setting.
    pub setting_type: SettingType,
    /// Raw setting value; meaning depends on the type.
    pub value: u8,
}

impl DeviceSetting {
    /// Encode to the 2-byte wire record.
    pub fn to_bytes(self) -> [u8; 2] {
        [self.setting_type as u8, self.value]
    }
}

/// Decode a ReadSettings payload: a flat sequence of 2-byte records.
pub fn decode_settings(bytes: &[u8]) -> Result<Vec<DeviceSetting>, RecordError> {
    if bytes.len() % 2 != 0 {
        return Err(RecordError::Truncated {
            expected: bytes.len() + 1,
            actual: bytes.len(),
        });
    }
    bytes
        .chunks_exact(2)
        .map(|pair| {
            Ok(DeviceSetting {
                setting_type: SettingType::try_from(pair[0])?,
                value: pair[1],
            })
        })
        .collect()
}

/// Encode a sequence of settings records.
pub fn encode_settings(settings: &[DeviceSetting]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(settings.len() * 2);
    for setting in settings {
        buffer.put_slice(&setting.to_bytes());
    }
    buffer.freeze()
}

/// Identity block read once per connection: the hardware address followed by
/// five length-prefixed strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// BLE hardware address.
    pub hardware_address: HardwareAddress,
    /// Serial number; its leading digits encode the device family.
    pub serial_number: String,
    /// Firmware version string.
    pub firmware_version: String,
    /// Hardware revision string.
    pub hardware_version: String,
    /// Firmware build date string.
    pub build_date: String,
    /// Bootloader version string.
    pub bootloader_version: String,
}

fn take_string(bytes: &[u8], cursor: &mut usize) -> Result<String, RecordError> {
    need(bytes, *cursor + 1)?;
    let len = bytes[*cursor] as usize;
    let start = *cursor + 1;
    need(bytes, start + len)?;
    let text = std::str::from_utf8(&bytes[start..start + len])
        .map_err(|_| RecordError::BadString)?
        .to_owned();
    *cursor = start + len;
    Ok(text)
}

fn put_string(buffer: &mut BytesMut, text: &str) {
    debug_assert!(text.len() <= u8::MAX as usize);
    buffer.put_u8(text.len() as u8);
    buffer.put_slice(text.as_bytes());
}

impl DeviceDescriptor {
    /// Decode a DeviceDescriptor response payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        let hardware_address = HardwareAddress::from_bytes(bytes)?;
        let mut cursor = 6;
        Ok(Self {
            hardware_address,
            serial_number: take_string(bytes, &mut cursor)?,
            firmware_version: take_string(bytes, &mut cursor)?,
            hardware_version: take_string(bytes, &mut cursor)?,
            build_date: take_string(bytes, &mut cursor)?,
            bootloader_version: take_string(bytes, &mut cursor)?,
        })
    }

    /// Encode to the wire layout. Used by simulated peripherals.
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        buffer.put_slice(&self.hardware_address.0);
        put_string(&mut buffer, &self.serial_number);
        put_string(&mut buffer, &self.firmware_version);
        put_string(&mut buffer, &self.hardware_version);
        put_string(&mut buffer, &self.build_date);
        put_string(&mut buffer, &self.bootloader_version);
        buffer.freeze()
    }
}

/// One entry of the paired-host list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDeviceInfo {
    /// Pairing slot ident, also the argument to RemovePairedDevice.
    pub ident: u8,
    /// Host name recorded at pairing time.
    pub name: String,
}

/// The device's list of paired hosts.
///
/// Wire layout: `[preferred_id:1][count:1]` then per entry
/// `[ident:1][name_len:1][name...]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PairedDevices {
    /// Ident of the preferred host, 0 when none is set.
    pub preferred_id: u8,
    /// Paired hosts, device order preserved.
    pub devices: Vec<PairedDeviceInfo>,
}

impl PairedDevices {
    /// Decode a GetPairedList response payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        need(bytes, 2)?;
        let preferred_id = bytes[0];
        let count = bytes[1] as usize;
        let mut cursor = 2;
        let mut devices = Vec::with_capacity(count);
        for _ in 0..count {
            need(bytes, cursor + 1)?;
            let ident = bytes[cursor];
            cursor += 1;
            let name = take_string(bytes, &mut cursor)?;
            devices.push(PairedDeviceInfo { ident, name });
        }
        Ok(Self {
            preferred_id,
            devices,
        })
    }

    /// Encode to the wire layout.
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        buffer.put_u8(self.preferred_id);
        buffer.put_u8(self.devices.len() as u8);
        for device in &self.devices {
            buffer.put_u8(device.ident);
            put_string(&mut buffer, &device.name);
        }
        buffer.freeze()
    }

    /// Look up a paired host by ident.
    pub fn get(&self, ident: u8) -> Option<&PairedDeviceInfo> {
        self.devices.iter().find(|d| d.ident == ident)
    }
}

/// A point in the weekly schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePoint {
    /// Day of week, 0 = Monday.
    pub day: u8,
    /// Hour 0..24.
    pub hour: u8,
    /// Minute 0..60.
    pub minute: u8,
}

/// One working-time range, 6 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingTimeRange {
    /// Range start.
    pub start: TimePoint,
    /// Range end.
    pub end: TimePoint,
}

/// Number of working-time ranges in the schedule record.
pub const WORKING_TIME_RANGES: usize = 7;

/// Decode a GetWorkingTimeRanges payload: seven 6-byte ranges.
pub fn decode_working_times(bytes: &[u8]) -> Result<Vec<WorkingTimeRange>, RecordError> {
    need(bytes, WORKING_TIME_RANGES * 6)?;
    Ok(bytes[..WORKING_TIME_RANGES * 6]
        .chunks_exact(6)
        .map(|chunk| WorkingTimeRange {
            start: TimePoint {
                day: chunk[0],
                hour: chunk[1],
                minute: chunk[2],
            },
            end: TimePoint {
                day: chunk[3],
                hour: chunk[4],
                minute: chunk[5],
            },
        })
        .collect())
}

/// Encode a SetWorkingTimeRanges payload.
pub fn encode_working_times(ranges: &[WorkingTimeRange]) -> Result<Bytes, RecordError> {
    if ranges.len() != WORKING_TIME_RANGES {
        return Err(RecordError::OutOfRange("schedule must hold seven ranges"));
    }
    let mut buffer = BytesMut::with_capacity(WORKING_TIME_RANGES * 6);
    for range in ranges {
        buffer.put_slice(&[
            range.start.day,
            range.start.hour,
            range.start.minute,
            range.end.day,
            range.end.hour,
            range.end.minute,
        ]);
    }
    Ok(buffer.freeze())
}

/// Battery state: charging flag plus level percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryState {
    /// Whether the device reports it is charging.
    pub charging: bool,
    /// Battery level in percent.
    pub level: u8,
}

impl BatteryState {
    /// Decode a GetBatteryState payload: `[charging:1][level:1]`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        need(bytes, 2)?;
        Ok(Self {
            charging: bytes[0] != 0,
            level: bytes[1],
        })
    }
}

/// Event-class-dependent tail of a firmware log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEventDetail {
    /// Soft-timer event: the timer handle.
    TimerHandle(u8),
    /// External-signals event: the raised signal bits.
    ExternalSignals(u32),
    /// Connection event with the negotiated MTU.
    ConnectionMtu {
        /// Connection handle.
        connection: u8,
        /// Negotiated MTU.
        mtu: u16,
    },
    /// Connection event with a signal strength sample.
    ConnectionRssi {
        /// Connection handle.
        connection: u8,
        /// RSSI in dBm.
        rssi: i8,
    },
    /// Connection closed with a stack reason code.
    ConnectionReason {
        /// Connection handle.
        connection: u8,
        /// Stack reason code.
        reason: u16,
    },
    /// Connection operation completed with a stack result code.
    ConnectionResult {
        /// Connection handle.
        connection: u8,
        /// Stack result code.
        result: u16,
    },
}

/// One decoded firmware log record.
///
/// Fixed 10-byte head `[ticks:u32][event:u32][duration:u16]`, then a tail
/// selected by the event id class. A record of exactly 10 bytes carries no
/// tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEventData {
    /// Timestamp in 1/1024 second ticks.
    pub ticks: u32,
    /// Firmware event identifier.
    pub event: u32,
    /// Event duration in ticks.
    pub duration: u16,
    /// Class-dependent detail, absent for bare records.
    pub detail: Option<LogEventDetail>,
}

impl LogEventData {
    /// Decode one log record.
    pub fn from_bytes(bytes: &[u8], order: ByteOrder) -> Result<Self, RecordError> {
        need(bytes, 10)?;
        let ticks = take_u32(order, bytes, 0);
        let event = take_u32(order, bytes, 4);
        let duration = take_u16(order, bytes, 8);
        let tail = &bytes[10..];

        let detail = if tail.is_empty() {
            None
        } else if event < 0x100 {
            Some(LogEventDetail::TimerHandle(tail[0]))
        } else if event < 0x200 {
            need(tail, 4)?;
            Some(LogEventDetail::ExternalSignals(take_u32(order, tail, 0)))
        } else {
            need(tail, 1)?;
            let connection = tail[0];
            let rest = &tail[1..];
            Some(match event & 0xF00 {
                0x200 => {
                    need(rest, 2)?;
                    LogEventDetail::ConnectionMtu {
                        connection,
                        mtu: take_u16(order, rest, 0),
                    }
                }
                0x300 => {
                    need(rest, 1)?;
                    LogEventDetail::ConnectionRssi {
                        connection,
                        rssi: rest[0] as i8,
                    }
                }
                0x400 => {
                    need(rest, 2)?;
                    LogEventDetail::ConnectionReason {
                        connection,
                        reason: take_u16(order, rest, 0),
                    }
                }
                _ => {
                    need(rest, 2)?;
                    LogEventDetail::ConnectionResult {
                        connection,
                        result: take_u16(order, rest, 0),
                    }
                }
            })
        };

        Ok(Self {
            ticks,
            event,
            duration,
            detail,
        })
    }

    /// Encode one log record, length byte included. Simulator side.
    pub fn to_record(&self, order: ByteOrder) -> Bytes {
        let mut body = BytesMut::new();
        order.put_u32(&mut body, self.ticks);
        order.put_u32(&mut body, self.event);
        order.put_u16(&mut body, self.duration);
        match self.detail {
            None => {}
            Some(LogEventDetail::TimerHandle(handle)) => body.put_u8(handle),
            Some(LogEventDetail::ExternalSignals(signals)) => order.put_u32(&mut body, signals),
            Some(LogEventDetail::ConnectionMtu { connection, mtu }) => {
                body.put_u8(connection);
                order.put_u16(&mut body, mtu);
            }
            Some(LogEventDetail::ConnectionRssi { connection, rssi }) => {
                body.put_u8(connection);
                body.put_u8(rssi as u8);
            }
            Some(LogEventDetail::ConnectionReason { connection, reason }) => {
                body.put_u8(connection);
                order.put_u16(&mut body, reason);
            }
            Some(LogEventDetail::ConnectionResult { connection, result }) => {
                body.put_u8(connection);
                order.put_u16(&mut body, result);
            }
        }
        let mut record = BytesMut::with_capacity(1 + body.len());
        record.put_u8(body.len() as u8);
        record.put_slice(&body);
        record.freeze()
    }
}

/// Decode a GetLoggedEventData payload: length-prefixed records back to back.
pub fn decode_log_events(bytes: &[u8], order: ByteOrder) -> Result<Vec<LogEventData>, RecordError> {
    let mut events = Vec::new();
    let mut cursor = 0;
    while cursor < bytes.len() {
        let len = bytes[cursor] as usize;
        let start = cursor + 1;
        need(bytes, start + len)?;
        events.push(LogEventData::from_bytes(&bytes[start..start + len], order)?);
        cursor = start + len;
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_address_display() {
        let address = HardwareAddress([0x00, 0x1B, 0xDC, 0x0F, 0xA3, 0x5E]);
        assert_eq!(address.to_string(), "00:1B:DC:0F:A3:5E");
        assert!(matches!(
            HardwareAddress::from_bytes(&[0x00; 5]),
            Err(RecordError::Truncated {
                expected: 6,
                actual: 5
            })
        ));
    }

    #[test]
    fn test_settings_round_trip() {
        let settings = vec![
            DeviceSetting {
                setting_type: SettingType::SignalStrength,
                value: 0x03,
            },
            DeviceSetting {
                setting_type: SettingType::Encryption,
                value: 0x01,
            },
        ];
        let encoded = encode_settings(&settings);
        assert_eq!(encoded.as_ref(), &[0x01, 0x03, 0x07, 0x01]);
        assert_eq!(decode_settings(&encoded).unwrap(), settings);
    }

    #[test]
    fn test_settings_reject_unknown_type() {
        assert!(matches!(
            decode_settings(&[0x7F, 0x00]),
            Err(RecordError::UnknownSettingType(0x7F))
        ));
        assert!(decode_settings(&[0x01]).is_err());
    }

    #[test]
    fn test_descriptor_round_trip() {
        let descriptor = DeviceDescriptor {
            hardware_address: HardwareAddress([1, 2, 3, 4, 5, 6]),
            serial_number: "1017210123".into(),
            firmware_version: "3.2.1".into(),
            hardware_version: "C".into(),
            build_date: "2023-11-02".into(),
            bootloader_version: "1.4".into(),
        };
        let decoded = DeviceDescriptor::from_bytes(&descriptor.to_bytes()).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn test_descriptor_truncated_string() {
        let mut bytes = vec![0u8; 6];
        bytes.push(10);
        bytes.extend_from_slice(b"short");
        assert!(matches!(
            DeviceDescriptor::from_bytes(&bytes),
            Err(RecordError::Truncated { .. })
        ));
    }

    #[test]
    fn test_paired_devices_round_trip() {
        let list = PairedDevices {
            preferred_id: 2,
            devices: vec![
                PairedDeviceInfo {
                    ident: 1,
                    name: "workstation".into(),
                },
                PairedDeviceInfo {
                    ident: 2,
                    name: "laptop".into(),
                },
            ],
        };
        let decoded = PairedDevices::from_bytes(&list.to_bytes()).unwrap();
        assert_eq!(decoded, list);
        assert_eq!(decoded.get(2).unwrap().name, "laptop");
        assert!(decoded.get(9).is_none());
    }

    #[test]
    fn test_working_times_round_trip() {
        let ranges: Vec<_> = (0..7u8)
            .map(|day| WorkingTimeRange {
                start: TimePoint {
                    day,
                    hour: 8,
                    minute: 0,
                },
                end: TimePoint {
                    day,
                    hour: 17,
                    minute: 30,
                },
            })
            .collect();
        let encoded = encode_working_times(&ranges).unwrap();
        assert_eq!(encoded.len(), 42);
        assert_eq!(decode_working_times(&encoded).unwrap(), ranges);

        assert!(encode_working_times(&ranges[..3]).is_err());
    }

    #[test]
    fn test_battery_state() {
        let state = BatteryState::from_bytes(&[0x01, 87]).unwrap();
        assert!(state.charging);
        assert_eq!(state.level, 87);
    }

    #[test]
    fn test_log_event_classes() {
        let order = ByteOrder::Little;
        let events = [
            LogEventData {
                ticks: 1024,
                event: 0x0042,
                duration: 3,
                detail: Some(LogEventDetail::TimerHandle(7)),
            },
            LogEventData {
                ticks: 2048,
                event: 0x0101,
                duration: 0,
                detail: Some(LogEventDetail::ExternalSignals(0x8000_0001)),
            },
            LogEventData {
                ticks: 3072,
                event: 0x0210,
                duration: 1,
                detail: Some(LogEventDetail::ConnectionMtu {
                    connection: 1,
                    mtu: 247,
                }),
            },
            LogEventData {
                ticks: 4096,
                event: 0x0301,
                duration: 1,
                detail: Some(LogEventDetail::ConnectionRssi {
                    connection: 1,
                    rssi: -62,
                }),
            },
            LogEventData {
                ticks: 5120,
                event: 0x0408,
                duration: 0,
                detail: Some(LogEventDetail::ConnectionReason {
                    connection: 1,
                    reason: 0x0213,
                }),
            },
            LogEventData {
                ticks: 6144,
                event: 0x0500,
                duration: 2,
                detail: None,
            },
        ];

        let mut payload = BytesMut::new();
        for event in &events {
            payload.put_slice(&event.to_record(order));
        }
        let decoded = decode_log_events(&payload, order).unwrap();
        assert_eq!(decoded, events);
    }

    #[test]
    fn test_log_event_minimum_length() {
        assert!(matches!(
            LogEventData::from_bytes(&[0u8; 9], ByteOrder::Little),
            Err(RecordError::Truncated {
                expected: 10,
                actual: 9
            })
        ));
    }
}
