//! In-process band
//!
//! [`SimulatedBand`] implements [`GattTransport`] without radio hardware. It
//! plays the band's half of the auth exchange, records every write, and lets
//! callers push notifications or cut the link. Completions are delivered
//! from spawned tasks, like a real adapter calling back from its own thread.

use crate::domain::models::{AccelerationSample, AuthKey, DeviceAddress, AUTH_KEY_LEN};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::crypto::decrypt_challenge;
use super::error::TransportError;
use super::protocol::{AuthResponse, Command, Endpoint, CHALLENGE_LEN};
use super::transport::{Completion, GattTransport, LinkDropHandler, NotificationHandler};

/// Faults the band can be told to exhibit
#[derive(Debug, Clone, Default)]
pub struct BandBehaviour {
    pub refuse_connect: bool,
    /// Subscriptions to these endpoints complete with an error
    pub refuse_notify: HashSet<Endpoint>,
    pub refuse_unsubscribe: bool,
    /// Writes to these endpoints complete with an error
    pub failing_writes: HashSet<Endpoint>,
    /// Accept the key write but never answer it
    pub ignore_key: bool,
    pub reject_key: bool,
    /// Accept the random request but never answer it
    pub ignore_random: bool,
    pub reject_random: bool,
}

#[derive(Clone)]
pub struct SimulatedBand {
    shared: Arc<Mutex<BandInner>>,
}

struct BandInner {
    behaviour: BandBehaviour,
    key: Option<AuthKey>,
    challenge: [u8; CHALLENGE_LEN],
    connected: bool,
    on_drop: Option<LinkDropHandler>,
    subscriptions: HashMap<Endpoint, NotificationHandler>,
    writes: Vec<(Endpoint, Vec<u8>)>,
}

impl Default for SimulatedBand {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBand {
    /// Unpaired band that hands out challenge `01 02 .. 10`
    pub fn new() -> Self {
        let mut challenge = [0u8; CHALLENGE_LEN];
        for (i, byte) in challenge.iter_mut().enumerate() {
            *byte = i as u8 + 1;
        }

        Self {
            shared: Arc::new(Mutex::new(BandInner {
                behaviour: BandBehaviour::default(),
                key: None,
                challenge,
                connected: false,
                on_drop: None,
                subscriptions: HashMap::new(),
                writes: Vec::new(),
            })),
        }
    }

    /// Band that already shares `key` with its owner
    pub fn with_key(self, key: AuthKey) -> Self {
        self.shared.lock().key = Some(key);
        self
    }

    pub fn with_challenge(self, challenge: [u8; CHALLENGE_LEN]) -> Self {
        self.shared.lock().challenge = challenge;
        self
    }

    /// Change the fault set of a running band
    pub fn configure<F>(&self, change: F)
    where
        F: FnOnce(&mut BandBehaviour),
    {
        change(&mut self.shared.lock().behaviour);
    }

    pub fn stored_key(&self) -> Option<AuthKey> {
        self.shared.lock().key
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    pub fn is_subscribed(&self, endpoint: Endpoint) -> bool {
        self.shared.lock().subscriptions.contains_key(&endpoint)
    }

    /// Every write seen so far, failed ones included
    pub fn writes(&self) -> Vec<(Endpoint, Vec<u8>)> {
        self.shared.lock().writes.clone()
    }

    pub fn count_writes(&self, command: Command) -> usize {
        let endpoint = command.endpoint();
        let payload = command.payload();
        self.shared
            .lock()
            .writes
            .iter()
            .filter(|(e, p)| *e == endpoint && *p == payload)
            .count()
    }

    /// Deliver `bytes` to the subscriber of `endpoint`, synchronously.
    /// Returns `false` when nobody is subscribed.
    pub fn push_notification(&self, endpoint: Endpoint, bytes: &[u8]) -> bool {
        let handler = self.shared.lock().subscriptions.get(&endpoint).cloned();
        match handler {
            Some(handler) => {
                handler(bytes);
                true
            }
            None => {
                trace!("No subscriber for {}", endpoint.characteristic);
                false
            }
        }
    }

    /// Lose the link as if the band walked out of range
    pub fn drop_link(&self) {
        let on_drop = {
            let mut inner = self.shared.lock();
            if !inner.connected {
                return;
            }
            inner.connected = false;
            inner.subscriptions.clear();
            inner.on_drop.take()
        };

        info!("Simulated band dropped the link");
        if let Some(on_drop) = on_drop {
            on_drop();
        }
    }

    fn auth_reply(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.shared.lock();
        match payload {
            [0x01, 0x00, key @ ..] => {
                if inner.behaviour.ignore_key {
                    return None;
                }
                let key: Option<[u8; AUTH_KEY_LEN]> = key.try_into().ok();
                match key {
                    Some(key) if !inner.behaviour.reject_key => {
                        inner.key = Some(AuthKey::from_bytes(key));
                        Some(AuthResponse::KeyAccepted.to_packet(&[]))
                    }
                    _ => Some(AuthResponse::KeyRejected.to_packet(&[])),
                }
            }
            [0x02, 0x00] => {
                if inner.behaviour.ignore_random {
                    None
                } else if inner.behaviour.reject_random {
                    Some(AuthResponse::RandomRejected.to_packet(&[]))
                } else {
                    Some(AuthResponse::RandomDelivered.to_packet(&inner.challenge))
                }
            }
            [0x03, 0x00, answer @ ..] => {
                let answer: Option<[u8; CHALLENGE_LEN]> = answer.try_into().ok();
                let matched = match (inner.key, answer) {
                    (Some(key), Some(answer)) => decrypt_challenge(&key, &answer) == inner.challenge,
                    _ => false,
                };
                Some(if matched {
                    AuthResponse::AuthAccepted.to_packet(&[])
                } else {
                    AuthResponse::AuthRejected.to_packet(&[])
                })
            }
            other => {
                debug!("Simulated band ignores auth write {}", hex::encode(other));
                None
            }
        }
    }
}

impl GattTransport for SimulatedBand {
    fn connect(&self, address: &DeviceAddress, on_result: Completion, on_drop: LinkDropHandler) {
        let result = {
            let mut inner = self.shared.lock();
            if inner.behaviour.refuse_connect {
                Err(TransportError::ConnectFailed(format!("{} unreachable", address)))
            } else {
                inner.connected = true;
                inner.on_drop = Some(on_drop);
                Ok(())
            }
        };

        debug!("Simulated connect to {}: {:?}", address, result);
        tokio::spawn(async move { on_result(result) });
    }

    fn enable_notify(&self, endpoint: Endpoint, on_enabled: Completion, on_data: NotificationHandler) {
        let result = {
            let mut inner = self.shared.lock();
            if !inner.connected {
                Err(TransportError::NotConnected)
            } else if inner.behaviour.refuse_notify.contains(&endpoint) {
                Err(TransportError::NotifyFailed(endpoint.characteristic.to_string()))
            } else {
                inner.subscriptions.insert(endpoint, on_data);
                Ok(())
            }
        };

        tokio::spawn(async move { on_enabled(result) });
    }

    fn disable_notify(&self, endpoint: Endpoint) -> bool {
        let mut inner = self.shared.lock();
        if inner.behaviour.refuse_unsubscribe {
            return false;
        }
        inner.subscriptions.remove(&endpoint);
        true
    }

    fn write(&self, endpoint: Endpoint, payload: Vec<u8>, on_complete: Completion) {
        let result = {
            let mut inner = self.shared.lock();
            inner.writes.push((endpoint, payload.clone()));
            if !inner.connected {
                Err(TransportError::NotConnected)
            } else if inner.behaviour.failing_writes.contains(&endpoint) {
                Err(TransportError::WriteFailed(endpoint.characteristic.to_string()))
            } else {
                Ok(())
            }
        };

        let reply = match (&result, endpoint == Endpoint::AUTH) {
            (Ok(()), true) => self.auth_reply(&payload),
            _ => None,
        };
        let band = self.clone();
        tokio::spawn(async move {
            on_complete(result);
            if let Some(reply) = reply {
                band.push_notification(Endpoint::AUTH, &reply);
            }
        });
    }

    fn disconnect(&self) {
        let on_drop = {
            let mut inner = self.shared.lock();
            inner.connected = false;
            inner.subscriptions.clear();
            inner.on_drop.take()
        };

        if let Some(on_drop) = on_drop {
            tokio::spawn(async move { on_drop() });
        }
    }
}

/// Heart-rate measurement notification as the band sends it
pub fn heart_rate_packet(bpm: u16) -> Vec<u8> {
    bpm.to_be_bytes().to_vec()
}

/// Raw sensor notification carrying `samples` behind sequence number `sequence`
pub fn raw_sensor_packet(sequence: u16, samples: &[AccelerationSample]) -> Vec<u8> {
    let mut packet = sequence.to_le_bytes().to_vec();
    for sample in samples {
        packet.extend_from_slice(&sample.x.to_le_bytes());
        packet.extend_from_slice(&sample.y.to_le_bytes());
        packet.extend_from_slice(&sample.z.to_le_bytes());
    }
    packet
}
