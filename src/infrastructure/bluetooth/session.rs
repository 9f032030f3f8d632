//! Device Session
//!
//! Owns one band's identity and [`ConnectionState`], drives the pairing
//! handshake and the two streaming modes over a [`GattTransport`].
//!
//! ## Handshake
//!
//! ```text
//! connect ─► auth notify on ─► [send key] ─► request random ─► send encrypted ─► auth notify off
//!    │              │              │               │                  │
//!    └──────────────┴──── any failure or timeout: abort, phase back to Idle
//! ```
//!
//! Each step issues its transport action and then waits for the first state
//! change after it, bounded by the step timeout. Streaming setup uses
//! one-shot [`Waiter`]s instead, one per write or subscription.

use crate::domain::models::{AccelerationAverage, AuthKey, DeviceAddress, HandshakePhase};
use crate::domain::settings::SessionSettings;
use crate::domain::state::{ConnectionState, SharedState, StateFlag};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::crypto::{encrypt_challenge, generate_auth_key};
use super::error::{SessionError, TransportError};
use super::lease::Lease;
use super::protocol::{
    self, AuthResponse, Command, Endpoint, ACCELERATION_ENABLE_SEQUENCE, CHALLENGE_LEN,
};
use super::transport::{Completion, GattTransport, LinkDropHandler, NotificationHandler};
use super::waiter::{WaitOutcome, Waiter};

pub type HeartRateHandler = Arc<dyn Fn(u16) + Send + Sync + 'static>;
pub type AccelerationHandler = Arc<dyn Fn(AccelerationAverage) + Send + Sync + 'static>;
pub type DisconnectHandler = Arc<dyn Fn(ConnectionState) + Send + Sync + 'static>;

/// Timing of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Budget for one handshake step
    pub step_timeout: Duration,
    /// Budget for one write or subscription while setting up streams
    pub command_timeout: Duration,
    pub heart_keep_alive_period: Duration,
    pub acceleration_rearm_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            step_timeout: protocol::STEP_TIMEOUT,
            command_timeout: protocol::COMMAND_TIMEOUT,
            heart_keep_alive_period: protocol::HEART_KEEP_ALIVE_PERIOD,
            acceleration_rearm_period: protocol::ACCELERATION_REARM_PERIOD,
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(s: &SessionSettings) -> Self {
        Self {
            step_timeout: Duration::from_millis(s.step_timeout_ms),
            command_timeout: Duration::from_millis(s.command_timeout_ms),
            heart_keep_alive_period: Duration::from_millis(s.heart_keep_alive_period_ms),
            acceleration_rearm_period: Duration::from_millis(s.acceleration_rearm_period_ms),
        }
    }
}

/// Session with a single band. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    address: DeviceAddress,
    transport: Arc<dyn GattTransport>,
    config: SessionConfig,
    state: SharedState,
    phase: Mutex<HandshakePhase>,
    auth_key: Mutex<Option<AuthKey>>,
    challenge: Mutex<Option<[u8; CHALLENGE_LEN]>>,
    /// Number of the most recently opened link, 0 before the first connect
    link: AtomicU64,
    /// Link that `disconnect` tore down; its drop is not reported
    closed_link: AtomicU64,
    heart_rate_handler: Mutex<Option<HeartRateHandler>>,
    acceleration_handler: Mutex<Option<AccelerationHandler>>,
    disconnect_handler: Mutex<Option<DisconnectHandler>>,
    heart_lease: Mutex<Option<Lease>>,
    acceleration_lease: Mutex<Option<Lease>>,
}

impl DeviceSession {
    pub fn new(
        address: DeviceAddress,
        auth_key: Option<AuthKey>,
        transport: Arc<dyn GattTransport>,
        config: SessionConfig,
    ) -> Self {
        info!(
            "Creating session for {} ({})",
            address,
            if auth_key.is_some() {
                "previously paired"
            } else {
                "never paired"
            }
        );

        Self {
            inner: Arc::new(SessionInner {
                address,
                transport,
                config,
                state: SharedState::new(),
                phase: Mutex::new(HandshakePhase::Idle),
                auth_key: Mutex::new(auth_key),
                challenge: Mutex::new(None),
                link: AtomicU64::new(0),
                closed_link: AtomicU64::new(0),
                heart_rate_handler: Mutex::new(None),
                acceleration_handler: Mutex::new(None),
                disconnect_handler: Mutex::new(None),
                heart_lease: Mutex::new(None),
                acceleration_lease: Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.inner.address
    }

    /// Key held by the session; a fresh key shows up here once the band accepted it
    pub fn auth_key(&self) -> Option<AuthKey> {
        *self.inner.auth_key.lock()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.snapshot()
    }

    /// Observe every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn phase(&self) -> HandshakePhase {
        *self.inner.phase.lock()
    }

    /// Called with the state snapshot whenever the link drops without
    /// [`DeviceSession::disconnect`] being asked for
    pub fn set_disconnect_handler<F>(&self, handler: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        *self.inner.disconnect_handler.lock() = Some(Arc::new(handler));
    }

    /// Connect and authenticate. Generates and hands over a new key when
    /// none is held or `force_new_key` is set.
    pub async fn connect(&self, force_new_key: bool) -> bool {
        info!("Connecting to band {}", self.inner.address);
        match self.inner.pair(force_new_key).await {
            Ok(()) => {
                info!("Band {} authenticated", self.inner.address);
                true
            }
            Err(e) => {
                error!("Pairing with {} failed: {}", self.inner.address, e);
                self.inner.set_phase(HandshakePhase::Idle);
                false
            }
        }
    }

    /// Run a fresh challenge exchange on an authenticated link.
    ///
    /// On failure the session falls back to [`HandshakePhase::Paired`]: the
    /// link and the key stay, only the authentication is lost.
    pub async fn reauthenticate(&self) -> bool {
        match self.inner.refresh_challenge().await {
            Ok(()) => {
                info!("Band {} re-authenticated", self.inner.address);
                true
            }
            Err(SessionError::NotAuthenticated) => {
                warn!("Re-authentication requested on an unauthenticated session");
                false
            }
            Err(e) => {
                error!("Re-authentication with {} failed: {}", self.inner.address, e);
                self.inner.state.update(|state| {
                    state.set(StateFlag::RandomRequested, false);
                    state.set(StateFlag::Encrypted, false);
                });
                if self.inner.state.snapshot().is_auth_notify_on() {
                    if let Err(e) = self.inner.unsubscribe(Endpoint::AUTH, StateFlag::AuthNotifying) {
                        warn!("Auth notifications left on: {}", e);
                    }
                }
                self.inner.set_phase(HandshakePhase::Paired);
                false
            }
        }
    }

    /// Stop active streams, then tear down the link. No-op when not connected.
    pub async fn disconnect(&self) {
        let state = self.inner.state.snapshot();
        if !state.is_transport_connected() {
            debug!("disconnect: {} is not connected", self.inner.address);
            return;
        }

        let heart_active = self.inner.heart_lease.lock().is_some();
        let acceleration_active = self.inner.acceleration_lease.lock().is_some();

        if heart_active || state.is_heart_rate_notify_on() {
            if let Err(e) = self.inner.stop_heart_rate().await {
                warn!("Stopping heart rate before disconnect failed: {}", e);
            }
        }
        if acceleration_active || state.is_raw_notify_on() {
            if let Err(e) = self.inner.stop_acceleration().await {
                warn!("Stopping acceleration before disconnect failed: {}", e);
            }
        }

        self.inner.release_leases();
        let link = self.inner.link.load(Ordering::SeqCst);
        self.inner.closed_link.store(link, Ordering::SeqCst);
        self.inner.transport.disconnect();
        self.inner.state.set(StateFlag::TransportConnected, false);
        self.inner.set_phase(HandshakePhase::Idle);
        info!("Disconnected from band {}", self.inner.address);
    }

    /// Enable continuous heart-rate monitoring; `on_sample` gets beats per minute
    pub async fn start_measure_heart_rate<F>(&self, on_sample: F) -> bool
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        match self.inner.start_heart_rate(Arc::new(on_sample)).await {
            Ok(()) => {
                info!("Heart rate measurement started");
                true
            }
            Err(e) => {
                error!("Failed to start heart rate measurement: {}", e);
                self.inner.release_heart_lease();
                false
            }
        }
    }

    pub async fn stop_measure_heart_rate(&self) -> bool {
        match self.inner.stop_heart_rate().await {
            Ok(()) => {
                info!("Heart rate measurement stopped");
                true
            }
            Err(e) => {
                error!("Failed to stop heart rate measurement: {}", e);
                false
            }
        }
    }

    /// Enable raw accelerometer streaming; `on_sample` gets one averaged
    /// sample per notification
    pub async fn start_measure_acceleration<F>(&self, on_sample: F) -> bool
    where
        F: Fn(AccelerationAverage) + Send + Sync + 'static,
    {
        match self.inner.start_acceleration(Arc::new(on_sample)).await {
            Ok(()) => {
                info!("Acceleration measurement started");
                true
            }
            Err(e) => {
                error!("Failed to start acceleration measurement: {}", e);
                self.inner.release_acceleration_lease();
                false
            }
        }
    }

    pub async fn stop_measure_acceleration(&self) -> bool {
        match self.inner.stop_acceleration().await {
            Ok(()) => {
                info!("Acceleration measurement stopped");
                true
            }
            Err(e) => {
                error!("Failed to stop acceleration measurement: {}", e);
                false
            }
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.inner.address)
            .field("state", &self.inner.state.snapshot().to_string())
            .field("phase", &self.phase())
            .finish()
    }
}

impl SessionInner {
    fn set_phase(&self, phase: HandshakePhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            debug!("Handshake phase: {:?} -> {:?}", *current, phase);
            *current = phase;
        }
    }

    // ---- handshake ----

    async fn pair(self: &Arc<Self>, force_new_key: bool) -> Result<(), SessionError> {
        self.release_leases();
        self.state.reset();

        self.set_phase(HandshakePhase::TransportConnecting);
        self.progress("connect", || self.open_link(), ConnectionState::is_transport_connected)
            .await?;

        self.set_phase(HandshakePhase::AuthNotifying);
        self.progress(
            "enable auth notifications",
            || self.subscribe_auth(),
            ConnectionState::is_auth_notify_on,
        )
        .await?;

        let held = *self.auth_key.lock();
        let key = match held {
            Some(key) if !force_new_key => key,
            _ => {
                self.set_phase(HandshakePhase::KeyExchange);
                let candidate = generate_auth_key();
                self.progress(
                    "send key",
                    || self.send(Command::SendKey(candidate), StateFlag::KeyAccepted),
                    ConnectionState::is_key_got,
                )
                .await?;
                *self.auth_key.lock() = Some(candidate);
                info!("Band {} accepted a new key", self.address);
                candidate
            }
        };

        self.set_phase(HandshakePhase::Paired);
        self.authenticate(&key).await
    }

    async fn refresh_challenge(self: &Arc<Self>) -> Result<(), SessionError> {
        if !self.state.snapshot().is_encrypted() {
            return Err(SessionError::NotAuthenticated);
        }
        let key = (*self.auth_key.lock()).ok_or(SessionError::NotAuthenticated)?;

        self.state.update(|state| {
            state.set(StateFlag::RandomRequested, false);
            state.set(StateFlag::Encrypted, false);
        });

        self.progress(
            "enable auth notifications",
            || self.subscribe_auth(),
            ConnectionState::is_auth_notify_on,
        )
        .await?;
        self.authenticate(&key).await
    }

    /// Challenge exchange: request random, answer it, close the auth channel
    async fn authenticate(self: &Arc<Self>, key: &AuthKey) -> Result<(), SessionError> {
        self.set_phase(HandshakePhase::RandomExchange);
        *self.challenge.lock() = None;

        self.progress(
            "request random",
            || self.send(Command::RequestRandom, StateFlag::RandomRequested),
            ConnectionState::is_random_requested,
        )
        .await?;

        let challenge = self
            .challenge
            .lock()
            .take()
            .ok_or_else(|| SessionError::Malformed("random challenge missing".to_string()))?;
        let answer = encrypt_challenge(key, &challenge);

        self.progress(
            "send encrypted random",
            || self.send(Command::SendEncrypted(answer), StateFlag::Encrypted),
            ConnectionState::is_encrypted,
        )
        .await?;

        self.set_phase(HandshakePhase::Authenticated);
        if let Err(e) = self.unsubscribe(Endpoint::AUTH, StateFlag::AuthNotifying) {
            warn!("Auth notifications left on: {}", e);
        }
        Ok(())
    }

    /// Issue `action`, then judge the first state change after it
    async fn progress<A>(
        &self,
        step: &'static str,
        action: A,
        reached: fn(&ConnectionState) -> bool,
    ) -> Result<(), SessionError>
    where
        A: FnOnce(),
    {
        let baseline = self.state.snapshot();
        debug!("Handshake step: {}", step);
        action();

        match self
            .state
            .wait_for_update(&baseline, self.config.step_timeout)
            .await
        {
            None => Err(SessionError::Timeout { step }),
            Some(state) if reached(&state) => Ok(()),
            Some(state) => {
                debug!("{}: state {} does not qualify", step, state);
                Err(SessionError::Rejected { step })
            }
        }
    }

    fn open_link(self: &Arc<Self>) {
        let link = self.link.fetch_add(1, Ordering::SeqCst) + 1;

        let weak = Arc::downgrade(self);
        let on_result: Completion = Box::new(move |result| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.is_current_link(link) {
                debug!("Ignoring connect result of stale link #{}", link);
                return;
            }
            match result {
                Ok(()) => {
                    info!("Link #{} to {} established", link, inner.address);
                    inner.state.set(StateFlag::TransportConnected, true);
                }
                Err(e) => {
                    warn!("Link #{} to {} failed: {}", link, inner.address, e);
                    inner.state.set(StateFlag::TransportConnected, false);
                }
            }
        });

        let weak = Arc::downgrade(self);
        let on_drop: LinkDropHandler = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_link_drop(link);
            }
        });

        self.transport.connect(&self.address, on_result, on_drop);
    }

    fn subscribe_auth(self: &Arc<Self>) {
        let state = self.state.clone();
        let on_enabled: Completion = Box::new(move |result| {
            if let Err(e) = &result {
                warn!("Auth notifications refused: {}", e);
            }
            state.set(StateFlag::AuthNotifying, result.is_ok());
        });

        let on_data = self.notification_handler(SessionInner::handle_auth_notification);
        self.transport
            .enable_notify(Endpoint::AUTH, on_enabled, on_data);
    }

    /// Fire-and-forget write whose failure clears `flag`
    fn send(&self, command: Command, flag: StateFlag) {
        let state = self.state.clone();
        let name = command.name();
        let on_complete: Completion = Box::new(move |result| match result {
            Ok(()) => trace!("{}: written", name),
            Err(e) => {
                warn!("{}: {}", name, e);
                state.set(flag, false);
            }
        });
        self.transport
            .write(command.endpoint(), command.payload(), on_complete);
    }

    fn handle_auth_notification(&self, bytes: &[u8]) {
        debug!("Auth notification: {}", hex::encode(bytes));

        let notice = match protocol::parse_auth_notification(bytes) {
            Ok(notice) => notice,
            Err(e) => {
                warn!("Dropping auth notification: {}", e);
                return;
            }
        };

        match notice.response {
            AuthResponse::KeyAccepted => {
                info!("Auth: key received by the band");
                self.state.set(StateFlag::KeyAccepted, true);
            }
            AuthResponse::KeyRejected => {
                info!("Auth: the band failed to receive the key");
                self.state.set(StateFlag::KeyAccepted, false);
            }
            AuthResponse::RandomDelivered => match protocol::parse_challenge(&notice.body) {
                Ok(challenge) => {
                    info!("Auth: random challenge received");
                    *self.challenge.lock() = Some(challenge);
                    self.state.set(StateFlag::RandomRequested, true);
                }
                Err(e) => warn!("Dropping random challenge: {}", e),
            },
            AuthResponse::RandomRejected => {
                info!("Auth: random challenge refused");
                self.state.set(StateFlag::RandomRequested, false);
            }
            AuthResponse::AuthAccepted => {
                info!("Auth: encrypted challenge matched");
                self.state.set(StateFlag::Encrypted, true);
            }
            AuthResponse::AuthRejected => {
                info!("Auth: encrypted challenge did not match");
                self.state.set(StateFlag::Encrypted, false);
            }
            AuthResponse::Unknown(header) => {
                info!("Ignoring auth notification: {}", SessionError::UnknownOpcode(header));
            }
        }
    }

    fn is_current_link(&self, link: u64) -> bool {
        self.link.load(Ordering::SeqCst) == link
    }

    fn handle_link_drop(&self, link: u64) {
        if !self.is_current_link(link) {
            debug!("Ignoring drop of stale link #{} to {}", link, self.address);
            return;
        }
        if self.closed_link.load(Ordering::SeqCst) == link {
            debug!("Link #{} to {} closed", link, self.address);
            return;
        }

        let state = self.state.set(StateFlag::TransportConnected, false);
        self.release_leases();
        self.set_phase(HandshakePhase::Idle);

        warn!("Link #{} to {} dropped, state={}", link, self.address, state);
        let handler = self.disconnect_handler.lock().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    // ---- single operations with a waiter ----

    /// Write `command` and wait for the transport to confirm it
    async fn command(&self, command: Command) -> Result<(), SessionError> {
        let (waiter, resolver) = Waiter::new();
        let name = command.name();
        let on_complete: Completion = Box::new(move |result| {
            if let Err(e) = &result {
                warn!("{}: {}", name, e);
            }
            resolver.complete(&result);
        });

        self.transport
            .write(command.endpoint(), command.payload(), on_complete);

        match waiter.outcome(self.config.command_timeout).await {
            WaitOutcome::Succeeded => {
                debug!("{}: confirmed", name);
                Ok(())
            }
            WaitOutcome::Failed => Err(TransportError::WriteFailed(name.to_string()).into()),
            WaitOutcome::TimedOut => Err(SessionError::Timeout { step: name }),
        }
    }

    /// Subscribe to `endpoint`, tracking the subscription in `flag`
    async fn subscribe(
        &self,
        endpoint: Endpoint,
        flag: StateFlag,
        on_data: NotificationHandler,
    ) -> Result<(), SessionError> {
        let (waiter, resolver) = Waiter::new();
        let state = self.state.clone();
        let on_enabled: Completion = Box::new(move |result| {
            state.set(flag, result.is_ok());
            resolver.complete(&result);
        });

        self.transport.enable_notify(endpoint, on_enabled, on_data);

        match waiter.outcome(self.config.command_timeout).await {
            WaitOutcome::Succeeded => Ok(()),
            WaitOutcome::Failed => {
                Err(TransportError::NotifyFailed(endpoint.characteristic.to_string()).into())
            }
            WaitOutcome::TimedOut => {
                self.state.set(flag, false);
                Err(SessionError::Timeout {
                    step: "enable notifications",
                })
            }
        }
    }

    fn unsubscribe(&self, endpoint: Endpoint, flag: StateFlag) -> Result<(), SessionError> {
        if self.transport.disable_notify(endpoint) {
            self.state.set(flag, false);
            Ok(())
        } else {
            Err(TransportError::NotifyFailed(endpoint.characteristic.to_string()).into())
        }
    }

    fn notification_handler(self: &Arc<Self>, handle: fn(&SessionInner, &[u8])) -> NotificationHandler {
        let weak: Weak<SessionInner> = Arc::downgrade(self);
        Arc::new(move |bytes: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                handle(&inner, bytes);
            }
        })
    }

    fn ensure_authenticated(&self) -> Result<(), SessionError> {
        if self.state.snapshot().is_encrypted() {
            Ok(())
        } else {
            Err(SessionError::NotAuthenticated)
        }
    }

    // ---- heart rate ----

    async fn start_heart_rate(self: &Arc<Self>, handler: HeartRateHandler) -> Result<(), SessionError> {
        self.ensure_authenticated()?;
        *self.heart_rate_handler.lock() = Some(handler);

        self.command(Command::HeartStopManual).await?;

        let on_data = self.notification_handler(SessionInner::handle_heart_rate);
        self.subscribe(Endpoint::HEART_RATE_MEASURE, StateFlag::HeartNotifying, on_data)
            .await?;

        self.command(Command::HeartStartContinuous).await?;

        let weak = Arc::downgrade(self);
        let lease = Lease::every(
            "heart rate keep-alive",
            self.config.heart_keep_alive_period,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.ping_heart_rate();
                    }
                }
            },
        );
        *self.heart_lease.lock() = Some(lease);
        Ok(())
    }

    fn ping_heart_rate(&self) {
        debug!("Pinging heart rate monitor");
        let state = self.state.clone();
        let on_complete: Completion = Box::new(move |result| match result {
            Ok(()) => {
                state.set_if_changed(StateFlag::HeartMeasuring, true);
            }
            Err(e) => {
                warn!("Heart rate keep-alive failed: {}", e);
                state.set_if_changed(StateFlag::HeartMeasuring, false);
            }
        });
        let command = Command::HeartKeepAlive;
        self.transport
            .write(command.endpoint(), command.payload(), on_complete);
    }

    fn handle_heart_rate(&self, bytes: &[u8]) {
        let heart_rate = match protocol::parse_heart_rate(bytes) {
            Ok(heart_rate) => heart_rate,
            Err(e) => {
                warn!("Dropping heart rate notification: {}", e);
                return;
            }
        };

        trace!("Heart rate: {}", heart_rate);
        self.state.set_if_changed(StateFlag::HeartMeasuring, true);
        let handler = self.heart_rate_handler.lock().clone();
        if let Some(handler) = handler {
            handler(heart_rate);
        }
    }

    async fn stop_heart_rate(&self) -> Result<(), SessionError> {
        self.release_heart_lease();

        if !self.state.snapshot().is_transport_connected() {
            debug!("Heart rate stop: link already down");
            *self.heart_rate_handler.lock() = None;
            return Ok(());
        }

        let stopped = self.command(Command::HeartStopContinuous).await;
        let unsubscribed = self.unsubscribe(Endpoint::HEART_RATE_MEASURE, StateFlag::HeartNotifying);
        *self.heart_rate_handler.lock() = None;

        stopped.and(unsubscribed)
    }

    fn release_heart_lease(&self) {
        let lease = self.heart_lease.lock().take();
        if let Some(lease) = lease {
            debug!("Releasing {}", lease.name());
            lease.cancel();
        }
        self.state.set_if_changed(StateFlag::HeartMeasuring, false);
    }

    // ---- acceleration ----

    async fn start_acceleration(
        self: &Arc<Self>,
        handler: AccelerationHandler,
    ) -> Result<(), SessionError> {
        self.ensure_authenticated()?;
        *self.acceleration_handler.lock() = Some(handler);

        let on_data = self.notification_handler(SessionInner::handle_raw_sensor);
        self.subscribe(Endpoint::SENSOR_DATA, StateFlag::RawNotifying, on_data)
            .await?;

        self.arm_acceleration().await?;

        let weak = Arc::downgrade(self);
        let lease = Lease::every(
            "acceleration re-arm",
            self.config.acceleration_rearm_period,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = inner.arm_acceleration().await {
                        warn!("Acceleration re-arm failed: {}", e);
                    }
                }
            },
        );
        *self.acceleration_lease.lock() = Some(lease);
        Ok(())
    }

    /// Send the init + start pair; the band stops raw streaming on its own otherwise
    async fn arm_acceleration(&self) -> Result<(), SessionError> {
        for command in ACCELERATION_ENABLE_SEQUENCE {
            if let Err(e) = self.command(command).await {
                self.state
                    .set_if_changed(StateFlag::AccelerationMeasuring, false);
                return Err(e);
            }
        }
        self.state
            .set_if_changed(StateFlag::AccelerationMeasuring, true);
        Ok(())
    }

    fn handle_raw_sensor(&self, bytes: &[u8]) {
        let records = match protocol::parse_raw_sensor(bytes) {
            Ok(records) => records,
            Err(e) => {
                warn!("Dropping raw sensor notification: {}", e);
                return;
            }
        };

        let Some(sample) = protocol::average_triples(&records) else {
            trace!("Raw sensor notification without records");
            return;
        };

        trace!("Acceleration: {:?} from {} records", sample, records.len());
        let handler = self.acceleration_handler.lock().clone();
        if let Some(handler) = handler {
            handler(sample);
        }
    }

    async fn stop_acceleration(&self) -> Result<(), SessionError> {
        self.release_acceleration_lease();

        let result = if self.state.snapshot().is_transport_connected() {
            self.command(Command::AccelerationStop).await
        } else {
            debug!("Acceleration stop: link already down");
            Ok(())
        };
        *self.acceleration_handler.lock() = None;
        result
    }

    fn release_acceleration_lease(&self) {
        let lease = self.acceleration_lease.lock().take();
        if let Some(lease) = lease {
            debug!("Releasing {}", lease.name());
            lease.cancel();
        }
        self.state
            .set_if_changed(StateFlag::AccelerationMeasuring, false);
    }

    fn release_leases(&self) {
        self.release_heart_lease();
        self.release_acceleration_lease();
    }
}
