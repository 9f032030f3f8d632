//! Bluetooth Module
//!
//! Session protocol for the fitness band, independent of any BLE stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceSession                        │
//! │   (pairing handshake, streaming, public API)             │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┬──────────────┐
//!         │             │             │              │
//!         ▼             ▼             ▼              ▼
//! ┌────────────┐  ┌──────────┐  ┌──────────┐  ┌─────────────┐
//! │ Transport  │  │ Protocol │  │  Crypto  │  │ Waiter/Lease│
//! │            │  │          │  │          │  │             │
//! │ - GATT ops │  │ - UUIDs  │  │ - AES    │  │ - one-shot  │
//! │ - callbacks│  │ - opcodes│  │ - keys   │  │ - periodic  │
//! └────────────┘  └──────────┘  └──────────┘  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] - Device session: handshake, heart rate, acceleration
//! - [`protocol`] - Band identifiers, commands, and notification parsing
//! - [`transport`] - The GATT capability the session drives
//! - [`simulated`] - In-process band implementing the transport
//! - [`crypto`] - Challenge cipher and key generation
//! - [`waiter`] - One-shot completion bridge
//! - [`lease`] - Periodic renewal tasks
//! - [`error`] - Transport and session errors

pub mod crypto;
pub mod error;
pub mod lease;
pub mod protocol;
pub mod session;
pub mod simulated;
pub mod transport;
pub mod waiter;

pub use error::{SessionError, TransportError};
pub use session::{DeviceSession, SessionConfig};
pub use simulated::SimulatedBand;
pub use transport::GattTransport;
