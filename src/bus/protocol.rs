//! Wire framing for the board protocol.
//!
//! Every transaction is request/response. The master writes a one-byte request
//! (a report poll or a command frame) and reads back either a tagged report or
//! a single ACK byte. Framing is symmetric: command frames can be decoded back
//! with [`decode_command`], which the board firmware and the tests both rely on.

use std::fmt;
use std::time::Instant;

use super::{CommandMessage, DeviceAddress, LedId, ReadingKind, SensorReading};

/// Request a full sensor report from a board.
pub const REQ_REPORT: u8 = 0x01;
/// Command acknowledged.
pub const ACK: u8 = 0x06;

const TAG_SENSOR_REPORT: u8 = 0xA1;
const TAG_DOOR_REPORT: u8 = 0xA2;
const TAG_SET_LED: u8 = 0xC1;
const TAG_SET_SERVO: u8 = 0xC2;

const SENSOR_REPORT_LEN: usize = 7;
const DOOR_REPORT_LEN: usize = 10;

pub const MAX_REPORT_LEN: usize = DOOR_REPORT_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    BadLength { expected: usize, got: usize },
    BadTag(u8),
    BadValue(&'static str),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::BadLength { expected, got } => {
                write!(f, "bad payload length: expected {expected}, got {got}")
            }
            PayloadError::BadTag(tag) => write!(f, "unexpected frame tag 0x{tag:02X}"),
            PayloadError::BadValue(what) => write!(f, "invalid field value: {what}"),
        }
    }
}

impl std::error::Error for PayloadError {}

pub fn report_len(address: DeviceAddress) -> usize {
    match address {
        DeviceAddress::SensorBoard => SENSOR_REPORT_LEN,
        DeviceAddress::DoorBoard => DOOR_REPORT_LEN,
    }
}

fn flag(byte: u8, what: &'static str) -> Result<bool, PayloadError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(PayloadError::BadValue(what)),
    }
}

/// Decode a raw board report into its sensor readings, all stamped `at`.
///
/// Sensor board: `[0xA1, motion, temp_i16_x10 (BE), hum_u16_x10 (BE), toggle]`.
/// Door board: `[0xA2, dist_mm_u16 (BE), open, close, card, uid[4]]`.
pub fn decode_report(
    source: DeviceAddress,
    bytes: &[u8],
    at: Instant,
) -> Result<Vec<SensorReading>, PayloadError> {
    let expected = report_len(source);
    if bytes.len() != expected {
        return Err(PayloadError::BadLength {
            expected,
            got: bytes.len(),
        });
    }

    let reading = |kind| SensorReading { source, kind, at };

    match source {
        DeviceAddress::SensorBoard => {
            if bytes[0] != TAG_SENSOR_REPORT {
                return Err(PayloadError::BadTag(bytes[0]));
            }
            let motion = flag(bytes[1], "motion")?;
            let temp = i16::from_be_bytes([bytes[2], bytes[3]]) as f32 / 10.0;
            let hum = u16::from_be_bytes([bytes[4], bytes[5]]) as f32 / 10.0;
            let toggle = flag(bytes[6], "toggle button")?;

            Ok(vec![
                reading(ReadingKind::Motion(motion)),
                reading(ReadingKind::Temperature(temp)),
                reading(ReadingKind::Humidity(hum)),
                reading(ReadingKind::ToggleButton(toggle)),
            ])
        }
        DeviceAddress::DoorBoard => {
            if bytes[0] != TAG_DOOR_REPORT {
                return Err(PayloadError::BadTag(bytes[0]));
            }
            let dist_mm = u16::from_be_bytes([bytes[1], bytes[2]]);
            let open = flag(bytes[3], "open button")?;
            let close = flag(bytes[4], "close button")?;
            let card_present = flag(bytes[5], "card flag")?;

            let mut readings = vec![
                reading(ReadingKind::Distance(dist_mm as f32 / 10.0)),
                reading(ReadingKind::DoorButtons { open, close }),
            ];
            if card_present {
                let uid = [bytes[6], bytes[7], bytes[8], bytes[9]];
                readings.push(reading(ReadingKind::Card(uid)));
            }
            Ok(readings)
        }
    }
}

/// Encode a command into its wire frame and the board it must go to.
pub fn encode_command(cmd: &CommandMessage) -> (DeviceAddress, Vec<u8>) {
    match cmd {
        CommandMessage::SetLed(id, on) => {
            let id = match id {
                LedId::Pir => 0,
                LedId::Button => 1,
            };
            (DeviceAddress::SensorBoard, vec![TAG_SET_LED, id, *on as u8])
        }
        CommandMessage::SetServoAngle(angle) => {
            (DeviceAddress::DoorBoard, vec![TAG_SET_SERVO, *angle])
        }
    }
}

/// Inverse of [`encode_command`]; what the board firmware runs on receipt.
pub fn decode_command(bytes: &[u8]) -> Result<CommandMessage, PayloadError> {
    match bytes {
        [TAG_SET_LED, id, on] => {
            let id = match id {
                0 => LedId::Pir,
                1 => LedId::Button,
                _ => return Err(PayloadError::BadValue("led id")),
            };
            Ok(CommandMessage::SetLed(id, flag(*on, "led state")?))
        }
        [TAG_SET_SERVO, angle] => {
            if *angle > 180 {
                return Err(PayloadError::BadValue("servo angle"));
            }
            Ok(CommandMessage::SetServoAngle(*angle))
        }
        [TAG_SET_LED, ..] => Err(PayloadError::BadLength {
            expected: 3,
            got: bytes.len(),
        }),
        [TAG_SET_SERVO, ..] => Err(PayloadError::BadLength {
            expected: 2,
            got: bytes.len(),
        }),
        [tag, ..] => Err(PayloadError::BadTag(*tag)),
        [] => Err(PayloadError::BadLength {
            expected: 2,
            got: 0,
        }),
    }
}
