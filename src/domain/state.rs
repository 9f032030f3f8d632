//! Band Connection State
//!
//! A packed bitmask of session milestones plus a monotonic stamp. Every
//! predicate checks its whole prerequisite chain, so a stray notification
//! that sets a downstream bit cannot make a later stage look reachable
//! while an earlier one is down.
//!
//! ```text
//! TransportConnected ─┬─ AuthNotifying ─┬─ KeyAccepted
//!                     │                 └─ RandomRequested
//!                     └─ Encrypted ─┬─ HeartNotifying ── HeartMeasuring
//!                                   └─ RawNotifying ──── AccelerationMeasuring
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Individual milestones tracked by [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateFlag {
    TransportConnected,
    AuthNotifying,
    KeyAccepted,
    RandomRequested,
    Encrypted,
    HeartNotifying,
    HeartMeasuring,
    RawNotifying,
    AccelerationMeasuring,
}

impl StateFlag {
    pub const ALL: [StateFlag; 9] = [
        Self::TransportConnected,
        Self::AuthNotifying,
        Self::KeyAccepted,
        Self::RandomRequested,
        Self::Encrypted,
        Self::HeartNotifying,
        Self::HeartMeasuring,
        Self::RawNotifying,
        Self::AccelerationMeasuring,
    ];

    /// Bit occupied by this flag in the packed value
    pub const fn bit(self) -> u16 {
        match self {
            Self::TransportConnected => 0b0_0000_0001,
            Self::AuthNotifying => 0b0_0000_0010,
            Self::KeyAccepted => 0b0_0000_0100,
            Self::RandomRequested => 0b0_0000_1000,
            Self::Encrypted => 0b0_0001_0000,
            Self::HeartNotifying => 0b0_0010_0000,
            Self::HeartMeasuring => 0b0_0100_0000,
            Self::RawNotifying => 0b0_1000_0000,
            Self::AccelerationMeasuring => 0b1_0000_0000,
        }
    }
}

const CONNECTED: u16 = StateFlag::TransportConnected.bit();
const AUTH_NOTIFY: u16 = StateFlag::AuthNotifying.bit();
const KEY_ACCEPTED: u16 = StateFlag::KeyAccepted.bit();
const RANDOM_REQUESTED: u16 = StateFlag::RandomRequested.bit();
const ENCRYPTED: u16 = StateFlag::Encrypted.bit();
const HEART_NOTIFY: u16 = StateFlag::HeartNotifying.bit();
const HEART_MEASURING: u16 = StateFlag::HeartMeasuring.bit();
const RAW_NOTIFY: u16 = StateFlag::RawNotifying.bit();
const ACCELERATION_MEASURING: u16 = StateFlag::AccelerationMeasuring.bit();

/// Mutation stamp, nanoseconds since the first stamp issued in this process.
///
/// Stamps are strictly increasing process-wide: two mutations never share
/// a stamp, even when the clock has not visibly advanced between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(u64);

impl Stamp {
    fn next() -> Self {
        static ANCHOR: OnceLock<Instant> = OnceLock::new();
        static LAST: AtomicU64 = AtomicU64::new(0);

        let now = ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64;
        let mut prev = LAST.load(Ordering::Acquire);
        loop {
            let next = now.max(prev + 1);
            match LAST.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Stamp(next),
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

/// Snapshot of how far a session has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    flags: u16,
    updated: Stamp,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            flags: 0,
            updated: Stamp::next(),
        }
    }

    /// Clear every milestone
    pub fn reset(&mut self) {
        self.flags = 0;
        self.updated = Stamp::next();
    }

    /// Assign a single milestone. Always restamps, even when the bit is unchanged.
    pub fn set(&mut self, flag: StateFlag, on: bool) {
        self.flags = (self.flags & !flag.bit()) | if on { flag.bit() } else { 0 };
        self.updated = Stamp::next();
    }

    pub fn is_newer_than(&self, other: &ConnectionState) -> bool {
        self.updated > other.updated
    }

    pub fn updated(&self) -> Stamp {
        self.updated
    }

    /// Raw bits, for diagnostics only. Use the predicates for decisions.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn is_transport_connected(&self) -> bool {
        self.has_all(CONNECTED)
    }

    pub fn is_auth_notify_on(&self) -> bool {
        self.has_all(CONNECTED | AUTH_NOTIFY)
    }

    pub fn is_key_got(&self) -> bool {
        self.has_all(CONNECTED | AUTH_NOTIFY | KEY_ACCEPTED)
    }

    pub fn is_random_requested(&self) -> bool {
        self.has_all(CONNECTED | AUTH_NOTIFY | RANDOM_REQUESTED)
    }

    pub fn is_encrypted(&self) -> bool {
        self.has_all(CONNECTED | ENCRYPTED)
    }

    pub fn is_heart_rate_notify_on(&self) -> bool {
        self.has_all(CONNECTED | ENCRYPTED | HEART_NOTIFY)
    }

    pub fn is_measuring_heart_rate(&self) -> bool {
        self.has_all(CONNECTED | ENCRYPTED | HEART_NOTIFY | HEART_MEASURING)
    }

    pub fn is_raw_notify_on(&self) -> bool {
        self.has_all(CONNECTED | ENCRYPTED | RAW_NOTIFY)
    }

    pub fn is_measuring_acceleration(&self) -> bool {
        self.has_all(CONNECTED | ENCRYPTED | RAW_NOTIFY | ACCELERATION_MEASURING)
    }

    fn has_all(&self, conditions: u16) -> bool {
        self.flags & conditions == conditions
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:09b}", self.flags)
    }
}

/// Session-wide holder of the current [`ConnectionState`].
///
/// Transport callbacks write through [`SharedState::update`]; readers only
/// ever see whole snapshots, and can await the next mutation.
#[derive(Clone)]
pub struct SharedState {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Single mutation entry point. Returns the published snapshot.
    pub fn update<F>(&self, mutate: F) -> ConnectionState
    where
        F: FnOnce(&mut ConnectionState),
    {
        let mut published = None;
        self.tx.send_modify(|state| {
            mutate(state);
            published = Some(*state);
        });
        published.unwrap_or_else(|| self.snapshot())
    }

    pub fn set(&self, flag: StateFlag, on: bool) -> ConnectionState {
        self.update(|state| state.set(flag, on))
    }

    /// Like [`SharedState::set`], but leaves the stamp alone when the bit
    /// already has the requested value. Streaming callbacks fire many times
    /// a second and must not look like handshake progress.
    pub fn set_if_changed(&self, flag: StateFlag, on: bool) -> ConnectionState {
        self.update(|state| {
            if (state.flags() & flag.bit() != 0) != on {
                state.set(flag, on);
            }
        })
    }

    pub fn reset(&self) -> ConnectionState {
        self.update(ConnectionState::reset)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait for the first snapshot newer than `baseline`.
    ///
    /// Returns `None` if nothing changed within `timeout`.
    pub async fn wait_for_update(
        &self,
        baseline: &ConnectionState,
        timeout: Duration,
    ) -> Option<ConnectionState> {
        let mut rx = self.tx.subscribe();
        let changed = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| state.is_newer_than(baseline))
                .await
                .map(|state| *state)
                .ok()
        })
        .await;

        changed.ok().flatten()
    }
}
