use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of the shared pairing key in bytes
pub const AUTH_KEY_LEN: usize = 16;

/// Transport-level identifier of a band (a MAC address on most adapters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 128-bit symmetric key shared with the band during pairing
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthKey([u8; AUTH_KEY_LEN]);

#[derive(Debug, Error, PartialEq)]
pub enum AuthKeyParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 16 bytes, got {0}")]
    Length(usize),
}

impl AuthKey {
    pub const fn from_bytes(bytes: [u8; AUTH_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for AuthKey {
    type Err = AuthKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        let bytes: [u8; AUTH_KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AuthKeyParseError::Length(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Debug output only carries a key prefix.
impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthKey({}…)", hex::encode(&self.0[..2]))
    }
}

impl Serialize for AuthKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AuthKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One accelerometer record as sent by the band, raw sensor units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccelerationSample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

/// Mean of the records in one notification, raw sensor units
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccelerationAverage {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Where the pairing handshake currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Idle,
    TransportConnecting,
    AuthNotifying,
    KeyExchange,
    /// Key accepted by the band; not yet authenticated for this link
    Paired,
    RandomExchange,
    Authenticated,
}
