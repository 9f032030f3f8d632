//! GATT Transport Capability
//!
//! The session does not own a BLE stack. It drives whatever adapter
//! implements [`GattTransport`]: the adapter performs the operation and
//! reports back through callbacks on a thread of its own choosing, possibly
//! long after the requesting step has given up.

use crate::domain::models::DeviceAddress;
use std::sync::Arc;

use super::error::TransportError;
use super::protocol::Endpoint;

/// One-time outcome of a connect, subscribe or write request
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Receives every notification payload of a subscribed characteristic
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Invoked whenever an established link drops, requested or not
pub type LinkDropHandler = Arc<dyn Fn() + Send + Sync + 'static>;

pub trait GattTransport: Send + Sync {
    /// Establish the link to `address`
    fn connect(&self, address: &DeviceAddress, on_result: Completion, on_drop: LinkDropHandler);

    /// Subscribe to notifications of `endpoint`
    fn enable_notify(
        &self,
        endpoint: Endpoint,
        on_enabled: Completion,
        on_data: NotificationHandler,
    );

    /// Unsubscribe from `endpoint`; `false` if the adapter refused
    fn disable_notify(&self, endpoint: Endpoint) -> bool;

    /// Write `payload` to `endpoint`
    fn write(&self, endpoint: Endpoint, payload: Vec<u8>, on_complete: Completion);

    /// Tear down the link
    fn disconnect(&self);
}
