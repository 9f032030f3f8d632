//! Fitness Band Protocol
//!
//! Service/characteristic identifiers, command payloads and response
//! opcodes spoken by the band, plus parsers for inbound notifications.

use crate::domain::models::{AccelerationAverage, AccelerationSample, AuthKey};
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

use super::error::SessionError;

/// Build a UUID on the Bluetooth SIG base `0000xxxx-0000-1000-8000-00805f9b34fb`
const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Build a UUID on the vendor base `0000xxxx-0000-3512-2118-0009af100700`
const fn vendor_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_3512_2118_0009_af10_0700)
}

/// GATT services exposed by the band
pub mod service {
    use super::*;

    pub const BASIC: Uuid = sig_uuid(0xfee0);
    pub const AUTH: Uuid = sig_uuid(0xfee1);
    pub const ALERT: Uuid = sig_uuid(0x1802);
    pub const ALERT_NOTIFICATION: Uuid = sig_uuid(0x1811);
    pub const HEART_RATE: Uuid = sig_uuid(0x180d);
    pub const DEVICE_INFO: Uuid = sig_uuid(0x180a);
}

/// GATT characteristics exposed by the band
pub mod characteristic {
    use super::*;

    pub const SENSOR_CONTROL: Uuid = vendor_uuid(0x0001);
    pub const SENSOR_DATA: Uuid = vendor_uuid(0x0002);
    pub const CONFIGURATION: Uuid = vendor_uuid(0x0003);
    pub const BATTERY: Uuid = vendor_uuid(0x0006);
    pub const STEPS: Uuid = vendor_uuid(0x0007);
    pub const USER_SETTINGS: Uuid = vendor_uuid(0x0008);
    pub const AUTH: Uuid = vendor_uuid(0x0009);
    pub const DEVICE_EVENT: Uuid = vendor_uuid(0x0010);

    pub const HEART_RATE_MEASURE: Uuid = sig_uuid(0x2a37);
    pub const HEART_RATE_CONTROL: Uuid = sig_uuid(0x2a39);
    pub const ALERT: Uuid = sig_uuid(0x2a06);
    pub const CURRENT_TIME: Uuid = sig_uuid(0x2a2b);
    pub const AGE: Uuid = sig_uuid(0x2a80);
    pub const LE_PARAMS: Uuid = sig_uuid(0xff09);
}

/// A characteristic addressed within its service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl Endpoint {
    pub const AUTH: Endpoint = Endpoint::new(service::AUTH, characteristic::AUTH);
    pub const HEART_RATE_MEASURE: Endpoint =
        Endpoint::new(service::HEART_RATE, characteristic::HEART_RATE_MEASURE);
    pub const HEART_RATE_CONTROL: Endpoint =
        Endpoint::new(service::HEART_RATE, characteristic::HEART_RATE_CONTROL);
    pub const SENSOR_CONTROL: Endpoint =
        Endpoint::new(service::BASIC, characteristic::SENSOR_CONTROL);
    pub const SENSOR_DATA: Endpoint = Endpoint::new(service::BASIC, characteristic::SENSOR_DATA);

    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// Length of the random challenge and of its encrypted answer
pub const CHALLENGE_LEN: usize = 16;

/// Length of an authentication response header
pub const AUTH_HEADER_LEN: usize = 3;

/// Raw sensor notifications start with a sequence prefix
pub const RAW_PREFIX_LEN: usize = 2;

/// One (x, y, z) record of little-endian i16
pub const RAW_RECORD_LEN: usize = 6;

/// The band drops continuous heart-rate monitoring without a ping this often
pub const HEART_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(10);

/// Raw streaming stops on its own after ~70 s; re-arm before that
pub const ACCELERATION_REARM_PERIOD: Duration = Duration::from_secs(65);

/// Budget for one handshake step, including user interaction on the band
pub const STEP_TIMEOUT: Duration = Duration::from_secs(20);

/// Budget for a single write or notification subscription
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands written to the band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Hand a new pairing key to the band
    SendKey(AuthKey),
    /// Ask the band for a random challenge
    RequestRandom,
    /// Answer the challenge with its AES encryption under the pairing key
    SendEncrypted([u8; CHALLENGE_LEN]),
    HeartStopContinuous,
    HeartStartContinuous,
    HeartStopManual,
    HeartStartManual,
    /// Keep continuous heart-rate monitoring alive
    HeartKeepAlive,
    AccelerationInit,
    AccelerationStart,
    AccelerationStop,
}

impl Command {
    /// Get the raw bytes for this command
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Self::SendKey(key) => [&[0x01, 0x00][..], &key.as_bytes()[..]].concat(),
            Self::RequestRandom => vec![0x02, 0x00],
            Self::SendEncrypted(block) => [&[0x03, 0x00][..], &block[..]].concat(),
            Self::HeartStopContinuous => vec![0x15, 0x01, 0x00],
            Self::HeartStartContinuous => vec![0x15, 0x01, 0x01],
            Self::HeartStopManual => vec![0x15, 0x02, 0x00],
            Self::HeartStartManual => vec![0x15, 0x02, 0x01],
            Self::HeartKeepAlive => vec![0x16],
            Self::AccelerationInit => vec![0x01, 0x01, 0x19],
            Self::AccelerationStart => vec![0x02],
            Self::AccelerationStop => vec![0x03],
        }
    }

    /// Characteristic the command is written to
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::SendKey(_) | Self::RequestRandom | Self::SendEncrypted(_) => Endpoint::AUTH,
            Self::HeartStopContinuous
            | Self::HeartStartContinuous
            | Self::HeartStopManual
            | Self::HeartStartManual
            | Self::HeartKeepAlive => Endpoint::HEART_RATE_CONTROL,
            Self::AccelerationInit | Self::AccelerationStart | Self::AccelerationStop => {
                Endpoint::SENSOR_CONTROL
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SendKey(_) => "send key",
            Self::RequestRandom => "request random",
            Self::SendEncrypted(_) => "send encrypted random",
            Self::HeartStopContinuous => "stop continuous heart rate",
            Self::HeartStartContinuous => "start continuous heart rate",
            Self::HeartStopManual => "stop manual heart rate",
            Self::HeartStartManual => "start manual heart rate",
            Self::HeartKeepAlive => "heart rate keep-alive",
            Self::AccelerationInit => "init acceleration",
            Self::AccelerationStart => "start acceleration",
            Self::AccelerationStop => "stop acceleration",
        }
    }
}

/// Two-command sequence that (re)arms raw accelerometer streaming
pub const ACCELERATION_ENABLE_SEQUENCE: [Command; 2] =
    [Command::AccelerationInit, Command::AccelerationStart];

/// Responses the band sends on the auth characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResponse {
    KeyAccepted,
    KeyRejected,
    RandomDelivered,
    RandomRejected,
    AuthAccepted,
    AuthRejected,
    Unknown(u32),
}

impl AuthResponse {
    pub const KNOWN: [AuthResponse; 6] = [
        Self::KeyAccepted,
        Self::KeyRejected,
        Self::RandomDelivered,
        Self::RandomRejected,
        Self::AuthAccepted,
        Self::AuthRejected,
    ];

    pub fn from_header(header: u32) -> Self {
        match header {
            0x10_01_01 => Self::KeyAccepted,
            0x10_01_04 => Self::KeyRejected,
            0x10_02_01 => Self::RandomDelivered,
            0x10_02_04 => Self::RandomRejected,
            0x10_03_01 => Self::AuthAccepted,
            0x10_03_04 => Self::AuthRejected,
            other => Self::Unknown(other),
        }
    }

    pub fn header(&self) -> u32 {
        match self {
            Self::KeyAccepted => 0x10_01_01,
            Self::KeyRejected => 0x10_01_04,
            Self::RandomDelivered => 0x10_02_01,
            Self::RandomRejected => 0x10_02_04,
            Self::AuthAccepted => 0x10_03_01,
            Self::AuthRejected => 0x10_03_04,
            Self::Unknown(header) => *header,
        }
    }

    /// Encode as it appears on the wire, followed by `body`
    pub fn to_packet(&self, body: &[u8]) -> Vec<u8> {
        let header = self.header().to_be_bytes();
        [&header[1..], body].concat()
    }
}

/// A decoded auth notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthNotification {
    pub response: AuthResponse,
    pub body: Vec<u8>,
}

/// Split an auth notification into its 24-bit header and body
pub fn parse_auth_notification(bytes: &[u8]) -> Result<AuthNotification, SessionError> {
    if bytes.len() < AUTH_HEADER_LEN {
        return Err(SessionError::Malformed(format!(
            "auth notification of {} bytes, need at least {}",
            bytes.len(),
            AUTH_HEADER_LEN
        )));
    }

    let header = (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32;
    Ok(AuthNotification {
        response: AuthResponse::from_header(header),
        body: bytes[AUTH_HEADER_LEN..].to_vec(),
    })
}

/// Extract the random challenge from a `RandomDelivered` body
pub fn parse_challenge(body: &[u8]) -> Result<[u8; CHALLENGE_LEN], SessionError> {
    body.try_into().map_err(|_| {
        SessionError::Malformed(format!(
            "challenge of {} bytes, expected {}",
            body.len(),
            CHALLENGE_LEN
        ))
    })
}

/// Parse a heart-rate measurement notification
///
/// # Packet Structure
///
/// ```text
/// [0-1] : Heart rate (u16 big-endian, beats per minute)
/// ```
pub fn parse_heart_rate(bytes: &[u8]) -> Result<u16, SessionError> {
    match bytes {
        [high, low, ..] => Ok(u16::from_be_bytes([*high, *low])),
        _ => Err(SessionError::Malformed(format!(
            "heart rate notification of {} bytes",
            bytes.len()
        ))),
    }
}

/// Parse a raw sensor notification into its accelerometer records
///
/// # Packet Structure
///
/// ```text
/// [0-1]     : Sequence prefix (ignored)
/// [2+6n..]  : X (i16 little-endian)
/// [4+6n..]  : Y
/// [6+6n..]  : Z
/// ```
pub fn parse_raw_sensor(bytes: &[u8]) -> Result<Vec<AccelerationSample>, SessionError> {
    if bytes.len() < RAW_PREFIX_LEN {
        return Err(SessionError::Malformed(format!(
            "raw sensor notification of {} bytes",
            bytes.len()
        )));
    }

    let records = &bytes[RAW_PREFIX_LEN..];
    if records.len() % RAW_RECORD_LEN != 0 {
        return Err(SessionError::Malformed(format!(
            "raw sensor body of {} bytes is not a multiple of {}",
            records.len(),
            RAW_RECORD_LEN
        )));
    }

    trace!("Raw sensor packet: {:02X?}", bytes);

    Ok(records
        .chunks_exact(RAW_RECORD_LEN)
        .map(|record| AccelerationSample {
            x: i16::from_le_bytes([record[0], record[1]]),
            y: i16::from_le_bytes([record[2], record[3]]),
            z: i16::from_le_bytes([record[4], record[5]]),
        })
        .collect())
}

/// Average a batch of records into one sample; `None` for an empty batch
pub fn average_triples(samples: &[AccelerationSample]) -> Option<AccelerationAverage> {
    if samples.is_empty() {
        return None;
    }

    let count = samples.len() as f32;
    let (sx, sy, sz) = samples.iter().fold((0i32, 0i32, 0i32), |(x, y, z), s| {
        (x + s.x as i32, y + s.y as i32, z + s.z as i32)
    });

    Some(AccelerationAverage {
        x: sx as f32 / count,
        y: sy as f32 / count,
        z: sz as f32 / count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_packet(records: &[(i16, i16, i16)]) -> Vec<u8> {
        let mut bytes = vec![0x01, 0x00];
        for (x, y, z) in records {
            bytes.extend_from_slice(&x.to_le_bytes());
            bytes.extend_from_slice(&y.to_le_bytes());
            bytes.extend_from_slice(&z.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            service::AUTH.to_string(),
            "0000fee1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            characteristic::AUTH.to_string(),
            "00000009-0000-3512-2118-0009af100700"
        );
        assert_eq!(
            characteristic::HEART_RATE_MEASURE.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_command_bytes() {
        let key = AuthKey::from_bytes([0xaa; 16]);
        let send_key = Command::SendKey(key).payload();
        assert_eq!(&send_key[..2], &[0x01, 0x00]);
        assert_eq!(&send_key[2..], &[0xaa; 16]);

        assert_eq!(Command::RequestRandom.payload(), vec![0x02, 0x00]);
        assert_eq!(&Command::SendEncrypted([0x55; 16]).payload()[..2], &[0x03, 0x00]);
        assert_eq!(Command::HeartStartContinuous.payload(), vec![0x15, 0x01, 0x01]);
        assert_eq!(Command::HeartStopManual.payload(), vec![0x15, 0x02, 0x00]);
        assert_eq!(Command::HeartKeepAlive.payload(), vec![0x16]);
        assert_eq!(Command::AccelerationInit.payload(), vec![0x01, 0x01, 0x19]);
        assert_eq!(Command::AccelerationStop.payload(), vec![0x03]);
    }

    #[test]
    fn test_command_endpoints() {
        assert_eq!(Command::RequestRandom.endpoint(), Endpoint::AUTH);
        assert_eq!(
            Command::HeartKeepAlive.endpoint(),
            Endpoint::HEART_RATE_CONTROL
        );
        assert_eq!(
            Command::AccelerationStart.endpoint(),
            Endpoint::SENSOR_CONTROL
        );
    }

    #[test]
    fn test_auth_headers() {
        for response in AuthResponse::KNOWN {
            assert_eq!(AuthResponse::from_header(response.header()), response);
        }
        assert_eq!(
            AuthResponse::from_header(0x10_04_01),
            AuthResponse::Unknown(0x10_04_01)
        );
    }

    #[test]
    fn test_parse_auth_notification() {
        let packet = [0x10, 0x02, 0x01, 0xde, 0xad];
        let notice = parse_auth_notification(&packet).unwrap();
        assert_eq!(notice.response, AuthResponse::RandomDelivered);
        assert_eq!(notice.body, vec![0xde, 0xad]);

        assert_eq!(
            AuthResponse::AuthAccepted.to_packet(&[]),
            vec![0x10, 0x03, 0x01]
        );
        assert!(parse_auth_notification(&[0x10, 0x01]).is_err());
    }

    #[test]
    fn test_parse_challenge_length() {
        assert!(parse_challenge(&[0u8; 16]).is_ok());
        assert!(parse_challenge(&[0u8; 15]).is_err());
        assert!(parse_challenge(&[0u8; 17]).is_err());
    }

    #[test]
    fn test_parse_heart_rate() {
        assert_eq!(parse_heart_rate(&[0x00, 0x48]).unwrap(), 72);
        assert_eq!(parse_heart_rate(&[0x01, 0x02]).unwrap(), 258);
        assert!(parse_heart_rate(&[0x48]).is_err());
    }

    #[test]
    fn test_parse_raw_sensor() {
        let packet = raw_packet(&[(1, -2, 3), (-300, 400, -500)]);
        let samples = parse_raw_sensor(&packet).unwrap();
        assert_eq!(
            samples,
            vec![
                AccelerationSample { x: 1, y: -2, z: 3 },
                AccelerationSample {
                    x: -300,
                    y: 400,
                    z: -500
                },
            ]
        );

        assert!(parse_raw_sensor(&[0x01]).is_err());
        let mut truncated = packet.clone();
        truncated.pop();
        assert!(parse_raw_sensor(&truncated).is_err());
        assert!(parse_raw_sensor(&[0x01, 0x00]).unwrap().is_empty());
    }

    #[test]
    fn test_average_triples() {
        let samples = parse_raw_sensor(&raw_packet(&[(10, 20, 30), (30, 40, 50)])).unwrap();
        assert_eq!(
            average_triples(&samples),
            Some(AccelerationAverage {
                x: 20.0,
                y: 30.0,
                z: 40.0
            })
        );
        assert_eq!(average_triples(&[]), None);
    }

    #[test]
    fn test_average_keeps_fractions() {
        let samples = parse_raw_sensor(&raw_packet(&[(1, -1, 0), (2, -2, 1)])).unwrap();
        assert_eq!(
            average_triples(&samples),
            Some(AccelerationAverage {
                x: 1.5,
                y: -1.5,
                z: 0.5
            })
        );
    }

    #[test]
    fn test_average_does_not_overflow() {
        let samples = vec![
            AccelerationSample {
                x: i16::MAX,
                y: i16::MIN,
                z: i16::MAX,
            };
            8
        ];
        assert_eq!(
            average_triples(&samples),
            Some(AccelerationAverage {
                x: i16::MAX as f32,
                y: i16::MIN as f32,
                z: i16::MAX as f32
            })
        );
    }
}
