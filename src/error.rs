//! Unified error types for both controller nodes.
//!
//! A single `Error` enum that every subsystem can convert into keeps
//! top-level handling uniform on both nodes. All variants are `Copy` so
//! they can be passed through supervisors and the link layer without
//! allocation. `ErrorCode` carries the stable on-wire values exchanged
//! between the nodes; everything else is internal.

use core::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Wire-visible error codes
// ---------------------------------------------------------------------------

/// Error codes carried by `Error` frames. The numeric values are part of
/// the wire protocol and must never change, so serialization goes
/// through the explicit `u8` value rather than a derived variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// A frame could not be written to the transport.
    CommSend = 1,
    /// A frame could not be read from the transport.
    CommRecv = 2,
    /// A frame failed to decode.
    ProtoErr = 3,
    /// Thermal runaway; latched until device reset.
    Runaway = 4,
    /// Ping watchdog expired; clears on the next ping.
    Timeout = 5,
}

impl ErrorCode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::CommSend),
            2 => Some(Self::CommRecv),
            3 => Some(Self::ProtoErr),
            4 => Some(Self::Runaway),
            5 => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommSend => write!(f, "comm send failure"),
            Self::CommRecv => write!(f, "comm receive failure"),
            Self::ProtoErr => write!(f, "protocol error"),
            Self::Runaway => write!(f, "thermal runaway"),
            Self::Timeout => write!(f, "ping timeout"),
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> core::result::Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        Self::from_u8(raw).ok_or_else(|| D::Error::custom("invalid error code"))
    }
}

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the controller funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Link transport or framing failed.
    Link(LinkError),
    /// A sensor could not be read or returned implausible data.
    Sensor(SensorError),
    /// A safety interlock fired.
    Safety(SafetyError),
    /// Configuration is invalid or could not be applied.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link(e) => write!(f, "link: {e}"),
            Self::Sensor(e) => write!(f, "sensor: {e}"),
            Self::Safety(e) => write!(f, "safety: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Link errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The transport rejected a write.
    SendFailed,
    /// No peer is connected.
    NotConnected,
    /// The outbound coalescing queue is full and the key was absent.
    QueueFull,
    /// A frame failed to encode or decode.
    Proto(ProtoError),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendFailed => write!(f, "send failed"),
            Self::NotConnected => write!(f, "not connected"),
            Self::QueueFull => write!(f, "outbound queue full"),
            Self::Proto(e) => write!(f, "protocol: {e}"),
        }
    }
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

/// Frame-level decode/encode failures. One `ProtoError` means one
/// discarded frame; the stream continues at the next header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoError {
    /// Declared payload length exceeds the frame budget or MTU.
    Oversize,
    /// `msg_type` is not a known message.
    UnknownType,
    /// The payload did not decode as the schema for its type.
    BadPayload,
    /// The payload did not fit the encode buffer.
    EncodeOverflow,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversize => write!(f, "oversized frame"),
            Self::UnknownType => write!(f, "unknown message type"),
            Self::BadPayload => write!(f, "payload decode failed"),
            Self::EncodeOverflow => write!(f, "payload too large to encode"),
        }
    }
}

impl From<ProtoError> for LinkError {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}

impl From<ProtoError> for Error {
    fn from(e: ProtoError) -> Self {
        Self::Link(LinkError::Proto(e))
    }
}

// ---------------------------------------------------------------------------
// Sensor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// The bus read failed or timed out.
    ReadFailed,
    /// Reading is outside the physically plausible range.
    OutOfRange,
    /// Too many invalid reads inside the rolling health window.
    Unhealthy,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed => write!(f, "read failed"),
            Self::OutOfRange => write!(f, "reading out of range"),
            Self::Unhealthy => write!(f, "sensor unhealthy"),
        }
    }
}

impl From<SensorError> for Error {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

// ---------------------------------------------------------------------------
// Safety errors
// ---------------------------------------------------------------------------

/// Safety errors force SafeShutdown: heater off, pump off, valve and alt
/// closed. `ThermalRunaway` is latched until device reset; `PingTimeout`
/// clears on the next ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyError {
    ThermalRunaway,
    PingTimeout,
}

impl SafetyError {
    /// The wire code reported to the peer for this fault.
    pub const fn code(self) -> ErrorCode {
        match self {
            Self::ThermalRunaway => ErrorCode::Runaway,
            Self::PingTimeout => ErrorCode::Timeout,
        }
    }
}

impl fmt::Display for SafetyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThermalRunaway => write!(f, "thermal runaway"),
            Self::PingTimeout => write!(f, "ping timeout"),
        }
    }
}

impl From<SafetyError> for Error {
    fn from(e: SafetyError) -> Self {
        Self::Safety(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::CommSend as u8, 1);
        assert_eq!(ErrorCode::CommRecv as u8, 2);
        assert_eq!(ErrorCode::ProtoErr as u8, 3);
        assert_eq!(ErrorCode::Runaway as u8, 4);
        assert_eq!(ErrorCode::Timeout as u8, 5);
    }

    #[test]
    fn error_code_roundtrip() {
        for raw in 1..=5u8 {
            let code = ErrorCode::from_u8(raw).unwrap();
            assert_eq!(code as u8, raw);
        }
        assert!(ErrorCode::from_u8(0).is_none());
        assert!(ErrorCode::from_u8(6).is_none());
    }
}
