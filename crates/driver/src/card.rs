//! Card status, protocol flags and ATR parsing

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;

use crate::error::RecordError;

/// Ordered card status progression. Only `Specific` permits card I/O; a card
/// handle is valid only while the owning device reports at least `Powered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum CardStatus {
    /// Status has not been read yet.
    #[default]
    Unknown = 0,
    /// No card in the reader.
    Absent = 1,
    /// A card is present but not seated.
    Present = 2,
    /// The card is seated in the contact position.
    InPosition = 3,
    /// The card is powered.
    Powered = 4,
    /// The ATR allows protocol negotiation.
    Negotiable = 5,
    /// A specific protocol is active; I/O is possible.
    Specific = 6,
}

impl TryFrom<u8> for CardStatus {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, RecordError> {
        Ok(match value {
            0 => Self::Unknown,
            1 => Self::Absent,
            2 => Self::Present,
            3 => Self::InPosition,
            4 => Self::Powered,
            5 => Self::Negotiable,
            6 => Self::Specific,
            _ => return Err(RecordError::OutOfRange("card status")),
        })
    }
}

/// Transmission protocol flags. A value may carry several flags when it
/// describes support; the active protocol is always a single flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardProtocol(u8);

impl CardProtocol {
    /// No protocol determined.
    pub const UNDEFINED: Self = Self(0);
    /// Character protocol T=0.
    pub const T0: Self = Self(1 << 0);
    /// Block protocol T=1.
    pub const T1: Self = Self(1 << 1);
    /// Either ISO protocol.
    pub const TX: Self = Self(1 << 0 | 1 << 1);
    /// Raw exchanges, no protocol layer.
    pub const RAW: Self = Self(1 << 4);

    /// Flag bits as carried on the wire.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstruct from wire bits, masking unknown bits away.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::TX.0 | Self::RAW.0))
    }

    /// Whether every flag in `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether this names exactly one ISO protocol, as SetProtocol requires.
    pub const fn is_single_iso(self) -> bool {
        matches!(self, Self::T0 | Self::T1)
    }
}

impl BitOr for CardProtocol {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CardProtocol {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for CardProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("undefined");
        }
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                f.write_str("+")?;
            }
            first = false;
            f.write_str(name)
        };
        if self.contains(Self::T0) {
            put(f, "T=0")?;
        }
        if self.contains(Self::T1) {
            put(f, "T=1")?;
        }
        if self.contains(Self::RAW) {
            put(f, "raw")?;
        }
        Ok(())
    }
}

/// Parsed answer-to-reset.
///
/// Only the interface-byte chain is interpreted; historical bytes and TCK are
/// validated for length but otherwise kept opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    bytes: Bytes,
    supported: CardProtocol,
    preferred: CardProtocol,
}

impl Atr {
    /// Parse and validate raw ATR bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < 2 {
            return Err(RecordError::MalformedAtr("shorter than TS+T0"));
        }
        if bytes[0] != 0x3B && bytes[0] != 0x3F {
            return Err(RecordError::MalformedAtr("bad TS byte"));
        }

        let historical = (bytes[1] & 0x0F) as usize;
        let mut supported = CardProtocol::UNDEFINED;
        let mut preferred = CardProtocol::UNDEFINED;

        // Walk the TA/TB/TC/TD chain. The low nibble of each TD names a
        // protocol; the first one named is the card's preferred protocol.
        let mut presence = bytes[1] >> 4;
        let mut cursor = 2;
        while presence != 0 {
            for bit in [0x1, 0x2, 0x4] {
                if presence & bit != 0 {
                    if cursor >= bytes.len() {
                        return Err(RecordError::MalformedAtr("interface bytes truncated"));
                    }
                    cursor += 1;
                }
            }
            if presence & 0x8 != 0 {
                if cursor >= bytes.len() {
                    return Err(RecordError::MalformedAtr("interface bytes truncated"));
                }
                let td = bytes[cursor];
                cursor += 1;
                let protocol = match td & 0x0F {
                    0 => CardProtocol::T0,
                    1 => CardProtocol::T1,
                    _ => return Err(RecordError::MalformedAtr("unsupported protocol in TD")),
                };
                supported |= protocol;
                if preferred.is_empty() {
                    preferred = protocol;
                }
                presence = td >> 4;
            } else {
                presence = 0;
            }
        }

        // No TD chain means the card speaks T=0 only.
        if supported.is_empty() {
            supported = CardProtocol::T0;
            preferred = CardProtocol::T0;
        }

        // TCK closes the ATR whenever any protocol besides T=0 is indicated.
        let tck = usize::from(supported.contains(CardProtocol::T1));
        let expected = cursor + historical + tck;
        if bytes.len() < expected {
            return Err(RecordError::MalformedAtr("historical bytes truncated"));
        }

        Ok(Self {
            bytes: Bytes::copy_from_slice(bytes),
            supported,
            preferred,
        })
    }

    /// Raw ATR bytes as reported by the reader.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Protocols the ATR indicates the card supports.
    pub const fn supported_protocols(&self) -> CardProtocol {
        self.supported
    }

    /// The first protocol the interface-byte chain names, T=0 by default.
    pub const fn preferred_protocol(&self) -> CardProtocol {
        self.preferred
    }
}

/// What to do with the card when a connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Disposition {
    /// Leave the card powered as is.
    LeaveCard = 0x00,
    /// Warm-reset the card.
    ResetCard = 0x01,
    /// Power the card down.
    UnpowerCard = 0x02,
    /// Eject the card where the reader supports it.
    EjectCard = 0x03,
}

/// How a connection shares the card with others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShareMode {
    /// Sole access to the card.
    Exclusive = 0x01,
    /// Shared access; transactions provide critical sections.
    Shared = 0x02,
    /// Reader control without a card protocol.
    Direct = 0x03,
}
