//! Link message schema.
//!
//! Every frame on the wire carries one of these messages. The numeric
//! `MessageType` values are stable wire contract; payloads are postcard-
//! encoded serde structs. Decoding validates ranges so a misbehaving peer
//! cannot inject non-finite tunings or coefficients — invalid payloads are
//! rejected and the previous values stay in effect.

use serde::{Deserialize, Serialize};

use crate::config::Capabilities;
use crate::error::{ErrorCode, ProtoError};

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Wire message discriminants. Values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 1,
    OutputControl = 2,
    PidSettings = 3,
    PumpModel = 4,
    Autotune = 5,
    PressureScale = 6,
    Tare = 7,
    LedControl = 8,
    AltControl = 9,
    Error = 10,
    SensorData = 11,
    BrewButton = 12,
    SteamButton = 13,
    AutotuneResult = 14,
    Volumetric = 15,
    Tof = 16,
    SystemInfo = 17,
}

impl MessageType {
    /// Number of distinct message types; sizes the coalescing queue's
    /// reverse index.
    pub const COUNT: usize = 17;

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Ping),
            2 => Some(Self::OutputControl),
            3 => Some(Self::PidSettings),
            4 => Some(Self::PumpModel),
            5 => Some(Self::Autotune),
            6 => Some(Self::PressureScale),
            7 => Some(Self::Tare),
            8 => Some(Self::LedControl),
            9 => Some(Self::AltControl),
            10 => Some(Self::Error),
            11 => Some(Self::SensorData),
            12 => Some(Self::BrewButton),
            13 => Some(Self::SteamButton),
            14 => Some(Self::AutotuneResult),
            15 => Some(Self::Volumetric),
            16 => Some(Self::Tof),
            17 => Some(Self::SystemInfo),
            _ => None,
        }
    }

    /// Dense index for reverse-map lookups (`value - 1`).
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    /// Coalescing priority. Higher drains first. Control messages beat
    /// telemetry so a stale pump command never outlives a fresher one
    /// behind sensor chatter.
    pub const fn priority(self) -> u8 {
        match self {
            Self::OutputControl | Self::AltControl => 100,
            Self::PidSettings | Self::PumpModel | Self::PressureScale => 80,
            Self::Autotune | Self::AutotuneResult | Self::SystemInfo => 60,
            Self::SensorData | Self::Volumetric => 40,
            Self::LedControl | Self::Tof => 20,
            Self::Ping | Self::Tare | Self::Error => 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Basic mode drives the pump open-loop; Advanced adds a closed-loop
/// pressure or flow target for dimming-capable machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    Basic,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PumpTarget {
    Pressure,
    Flow,
}

/// Closed-loop pump request: the selected `target` is regulated, the other
/// field acts as the limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvancedPump {
    pub target: PumpTarget,
    pub pressure_bar: f32,
    pub flow_mlps: f32,
}

/// The display's periodic actuator command. Applied on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputControl {
    pub mode: OutputMode,
    pub valve_open: bool,
    pub boiler_setpoint_c: f32,
    pub pump_setpoint_pct: f32,
    pub advanced: Option<AdvancedPump>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidSettings {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

/// Pump flow model handed to the machine. Explicitly tagged: the two-point
/// form anchors the curve at 1 and 9 bar, the polynomial form carries
/// cubic coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PumpModel {
    TwoPoint { one_bar_flow: f32, nine_bar_flow: f32 },
    Polynomial { a: f32, b: f32, c: f32, d: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Autotune {
    pub test_time_s: u32,
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutotuneResult {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedControl {
    pub channel: u32,
    pub brightness: u32,
}

/// Machine → display telemetry, 4 Hz while connected.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorData {
    pub temperature_c: f32,
    pub pressure_bar: f32,
    pub pump_flow_mlps: f32,
    pub puck_flow_mlps: f32,
    pub puck_resistance: f32,
}

/// Hardware identity and capabilities, sent exactly once per connection
/// before the display may emit any control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hardware: heapless::String<32>,
    pub version: heapless::String<16>,
    pub capabilities: Capabilities,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping,
    OutputControl(OutputControl),
    PidSettings(PidSettings),
    PumpModel(PumpModel),
    Autotune(Autotune),
    PressureScale(f32),
    Tare,
    LedControl(LedControl),
    AltControl(bool),
    Error(ErrorCode),
    SensorData(SensorData),
    BrewButton(bool),
    SteamButton(bool),
    AutotuneResult(AutotuneResult),
    Volumetric(f32),
    Tof(u32),
    SystemInfo(SystemInfo),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::OutputControl(_) => MessageType::OutputControl,
            Self::PidSettings(_) => MessageType::PidSettings,
            Self::PumpModel(_) => MessageType::PumpModel,
            Self::Autotune(_) => MessageType::Autotune,
            Self::PressureScale(_) => MessageType::PressureScale,
            Self::Tare => MessageType::Tare,
            Self::LedControl(_) => MessageType::LedControl,
            Self::AltControl(_) => MessageType::AltControl,
            Self::Error(_) => MessageType::Error,
            Self::SensorData(_) => MessageType::SensorData,
            Self::BrewButton(_) => MessageType::BrewButton,
            Self::SteamButton(_) => MessageType::SteamButton,
            Self::AutotuneResult(_) => MessageType::AutotuneResult,
            Self::Volumetric(_) => MessageType::Volumetric,
            Self::Tof(_) => MessageType::Tof,
            Self::SystemInfo(_) => MessageType::SystemInfo,
        }
    }

    /// Serialise the payload (header excluded) into `buf`; returns the
    /// payload length.
    pub fn encode_payload(&self, buf: &mut [u8]) -> Result<usize, ProtoError> {
        fn write<T: Serialize>(value: &T, buf: &mut [u8]) -> Result<usize, ProtoError> {
            postcard::to_slice(value, buf)
                .map(|used| used.len())
                .map_err(|_| ProtoError::EncodeOverflow)
        }

        match self {
            Self::Ping | Self::Tare => Ok(0),
            Self::OutputControl(p) => write(p, buf),
            Self::PidSettings(p) => write(p, buf),
            Self::PumpModel(p) => write(p, buf),
            Self::Autotune(p) => write(p, buf),
            Self::PressureScale(p) => write(p, buf),
            Self::LedControl(p) => write(p, buf),
            Self::AltControl(p) => write(p, buf),
            Self::Error(p) => write(p, buf),
            Self::SensorData(p) => write(p, buf),
            Self::BrewButton(p) => write(p, buf),
            Self::SteamButton(p) => write(p, buf),
            Self::AutotuneResult(p) => write(p, buf),
            Self::Volumetric(p) => write(p, buf),
            Self::Tof(p) => write(p, buf),
            Self::SystemInfo(p) => write(p, buf),
        }
    }

    /// Decode and validate a payload of the given type. Strict: trailing
    /// bytes, non-finite tunings or coefficients all reject the frame.
    pub fn decode_payload(ty: MessageType, bytes: &[u8]) -> Result<Self, ProtoError> {
        fn read<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, ProtoError> {
            let (value, rest) =
                postcard::take_from_bytes::<T>(bytes).map_err(|_| ProtoError::BadPayload)?;
            if rest.is_empty() {
                Ok(value)
            } else {
                Err(ProtoError::BadPayload)
            }
        }

        let msg = match ty {
            MessageType::Ping => {
                if !bytes.is_empty() {
                    return Err(ProtoError::BadPayload);
                }
                Self::Ping
            }
            MessageType::Tare => {
                if !bytes.is_empty() {
                    return Err(ProtoError::BadPayload);
                }
                Self::Tare
            }
            MessageType::OutputControl => {
                let p: OutputControl = read(bytes)?;
                if !p.boiler_setpoint_c.is_finite() || !p.pump_setpoint_pct.is_finite() {
                    return Err(ProtoError::BadPayload);
                }
                if let Some(adv) = &p.advanced {
                    if !adv.pressure_bar.is_finite() || !adv.flow_mlps.is_finite() {
                        return Err(ProtoError::BadPayload);
                    }
                }
                Self::OutputControl(p)
            }
            MessageType::PidSettings => {
                let p: PidSettings = read(bytes)?;
                let valid = [p.kp, p.ki, p.kd].iter().all(|v| v.is_finite() && *v >= 0.0);
                if !valid {
                    return Err(ProtoError::BadPayload);
                }
                Self::PidSettings(p)
            }
            MessageType::PumpModel => {
                let p: PumpModel = read(bytes)?;
                let valid = match p {
                    PumpModel::TwoPoint {
                        one_bar_flow,
                        nine_bar_flow,
                    } => one_bar_flow.is_finite() && nine_bar_flow.is_finite(),
                    PumpModel::Polynomial { a, b, c, d } => {
                        [a, b, c, d].iter().all(|v| v.is_finite())
                    }
                };
                if !valid {
                    return Err(ProtoError::BadPayload);
                }
                Self::PumpModel(p)
            }
            MessageType::Autotune => Self::Autotune(read(bytes)?),
            MessageType::PressureScale => {
                let scale: f32 = read(bytes)?;
                if !scale.is_finite() || scale <= 0.0 {
                    return Err(ProtoError::BadPayload);
                }
                Self::PressureScale(scale)
            }
            MessageType::LedControl => Self::LedControl(read(bytes)?),
            MessageType::AltControl => Self::AltControl(read(bytes)?),
            MessageType::Error => Self::Error(read(bytes)?),
            MessageType::SensorData => Self::SensorData(read(bytes)?),
            MessageType::BrewButton => Self::BrewButton(read(bytes)?),
            MessageType::SteamButton => Self::SteamButton(read(bytes)?),
            MessageType::AutotuneResult => Self::AutotuneResult(read(bytes)?),
            MessageType::Volumetric => Self::Volumetric(read(bytes)?),
            MessageType::Tof => Self::Tof(read(bytes)?),
            MessageType::SystemInfo => Self::SystemInfo(read(bytes)?),
        };
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) {
        let mut buf = [0u8; 128];
        let n = msg.encode_payload(&mut buf).unwrap();
        let decoded = Message::decode_payload(msg.message_type(), &buf[..n]).unwrap();
        assert_eq!(&decoded, msg);
    }

    #[test]
    fn empty_payload_messages() {
        roundtrip(&Message::Ping);
        roundtrip(&Message::Tare);
    }

    #[test]
    fn output_control_roundtrip() {
        roundtrip(&Message::OutputControl(OutputControl {
            mode: OutputMode::Advanced,
            valve_open: true,
            boiler_setpoint_c: 93.0,
            pump_setpoint_pct: 100.0,
            advanced: Some(AdvancedPump {
                target: PumpTarget::Pressure,
                pressure_bar: 9.0,
                flow_mlps: 2.5,
            }),
        }));
    }

    #[test]
    fn system_info_roundtrip() {
        roundtrip(&Message::SystemInfo(SystemInfo {
            hardware: heapless::String::try_from("Crema Pro").unwrap(),
            version: heapless::String::try_from("0.3.0").unwrap(),
            capabilities: Capabilities {
                dimming: true,
                pressure: true,
                led_control: false,
                tof: false,
            },
        }));
    }

    #[test]
    fn pid_settings_reject_nan_and_negative() {
        let mut buf = [0u8; 64];
        let bad = PidSettings {
            kp: f32::NAN,
            ki: 0.1,
            kd: 0.0,
        };
        let n = postcard::to_slice(&bad, &mut buf).unwrap().len();
        assert_eq!(
            Message::decode_payload(MessageType::PidSettings, &buf[..n]),
            Err(ProtoError::BadPayload)
        );

        let negative = PidSettings {
            kp: -1.0,
            ki: 0.1,
            kd: 0.0,
        };
        let n = postcard::to_slice(&negative, &mut buf).unwrap().len();
        assert_eq!(
            Message::decode_payload(MessageType::PidSettings, &buf[..n]),
            Err(ProtoError::BadPayload)
        );
    }

    #[test]
    fn pump_model_tagged_forms() {
        roundtrip(&Message::PumpModel(PumpModel::TwoPoint {
            one_bar_flow: 8.2,
            nine_bar_flow: 4.6,
        }));
        roundtrip(&Message::PumpModel(PumpModel::Polynomial {
            a: 0.1,
            b: -0.5,
            c: 1.0,
            d: 8.0,
        }));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut buf = [0u8; 64];
        let n = postcard::to_slice(&1.5f32, &mut buf).unwrap().len();
        buf[n] = 0xAA;
        assert_eq!(
            Message::decode_payload(MessageType::Volumetric, &buf[..n + 1]),
            Err(ProtoError::BadPayload)
        );
    }

    #[test]
    fn nonempty_ping_rejected() {
        assert_eq!(
            Message::decode_payload(MessageType::Ping, &[0x01]),
            Err(ProtoError::BadPayload)
        );
    }

    #[test]
    fn type_values_are_stable() {
        assert_eq!(MessageType::Ping as u8, 1);
        assert_eq!(MessageType::OutputControl as u8, 2);
        assert_eq!(MessageType::Error as u8, 10);
        assert_eq!(MessageType::SystemInfo as u8, 17);
        for raw in 1..=17u8 {
            assert_eq!(MessageType::from_u8(raw).map(|t| t as u8), Some(raw));
        }
        assert!(MessageType::from_u8(0).is_none());
        assert!(MessageType::from_u8(18).is_none());
    }
}
