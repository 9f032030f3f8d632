//! Fitness band session engine
//!
//! Pairs with a BLE fitness band over an abstract GATT transport, tracks the
//! link as a set of state flags, and streams heart rate and accelerometer
//! data once authenticated.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{
    AccelerationAverage, AccelerationSample, AuthKey, DeviceAddress, HandshakePhase,
};
pub use domain::state::{ConnectionState, StateFlag};
pub use infrastructure::bluetooth::{
    DeviceSession, GattTransport, SessionConfig, SessionError, SimulatedBand, TransportError,
};
