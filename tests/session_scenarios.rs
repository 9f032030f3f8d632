use fitness_band::domain::models::{
    AccelerationAverage, AccelerationSample, AuthKey, DeviceAddress, HandshakePhase,
};
use fitness_band::infrastructure::bluetooth::protocol::{AuthResponse, Command, Endpoint};
use fitness_band::infrastructure::bluetooth::simulated::{heart_rate_packet, raw_sensor_packet};
use fitness_band::infrastructure::bluetooth::{DeviceSession, SessionConfig, SimulatedBand};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const OLD_KEY: AuthKey = AuthKey::from_bytes([0x42; 16]);

fn session_for(band: &SimulatedBand, key: Option<AuthKey>) -> DeviceSession {
    DeviceSession::new(
        DeviceAddress::new("C8:0F:10:AA:BB:CC"),
        key,
        Arc::new(band.clone()),
        SessionConfig::default(),
    )
}

async fn paired() -> (SimulatedBand, DeviceSession) {
    let band = SimulatedBand::new();
    let session = session_for(&band, None);
    assert!(session.connect(true).await);
    (band, session)
}

fn auth_writes(band: &SimulatedBand, opcode: u8) -> usize {
    band.writes()
        .iter()
        .filter(|(endpoint, payload)| *endpoint == Endpoint::AUTH && payload.first() == Some(&opcode))
        .count()
}

#[tokio::test]
async fn test_first_pairing_authenticates() {
    let band = SimulatedBand::new();
    let session = session_for(&band, None);

    assert!(session.connect(true).await);

    let state = session.state();
    assert!(state.is_transport_connected());
    assert!(state.is_encrypted());
    assert!(!state.is_auth_notify_on());
    assert_eq!(session.phase(), HandshakePhase::Authenticated);
    assert!(session.auth_key().is_some());
    assert_eq!(band.stored_key(), session.auth_key());
    assert!(!band.is_subscribed(Endpoint::AUTH));
}

#[tokio::test]
async fn test_known_key_skips_key_exchange() {
    let band = SimulatedBand::new().with_key(OLD_KEY);
    let session = session_for(&band, Some(OLD_KEY));

    assert!(session.connect(false).await);
    assert!(session.state().is_encrypted());
    assert_eq!(auth_writes(&band, 0x01), 0);
    assert_eq!(auth_writes(&band, 0x02), 1);
    assert_eq!(session.auth_key(), Some(OLD_KEY));
}

#[tokio::test]
async fn test_stale_key_is_refused() {
    let band = SimulatedBand::new().with_key(AuthKey::from_bytes([0x01; 16]));
    let session = session_for(&band, Some(OLD_KEY));

    assert!(!session.connect(false).await);
    assert!(!session.state().is_encrypted());
    assert_eq!(session.phase(), HandshakePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_key_times_out() {
    let band = SimulatedBand::new();
    band.configure(|b| b.ignore_key = true);
    let session = session_for(&band, None);

    let started = Instant::now();
    assert!(!session.connect(true).await);
    assert!(started.elapsed() <= SessionConfig::default().step_timeout + Duration::from_millis(100));

    let state = session.state();
    assert!(state.is_auth_notify_on());
    assert!(!state.is_key_got());
    assert!(!state.is_encrypted());
    assert_eq!(session.auth_key(), None);
    assert_eq!(session.phase(), HandshakePhase::Idle);
}

#[tokio::test]
async fn test_refused_auth_notifications_abort_pairing() {
    let band = SimulatedBand::new();
    band.configure(|b| {
        b.refuse_notify.insert(Endpoint::AUTH);
    });
    let session = session_for(&band, None);

    assert!(!session.connect(true).await);

    let state = session.state();
    assert!(state.is_transport_connected());
    assert!(!state.is_auth_notify_on());
    assert_eq!(auth_writes(&band, 0x01), 0);
    assert_eq!(session.phase(), HandshakePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_random_request_times_out() {
    let band = SimulatedBand::new();
    band.configure(|b| b.ignore_random = true);
    let session = session_for(&band, None);

    let started = Instant::now();
    assert!(!session.connect(true).await);
    assert!(started.elapsed() <= SessionConfig::default().step_timeout + Duration::from_millis(100));

    let state = session.state();
    assert!(state.is_key_got());
    assert!(!state.is_random_requested());
    assert!(!state.is_encrypted());
    assert_eq!(auth_writes(&band, 0x03), 0);
    assert_eq!(session.auth_key(), band.stored_key());
}

#[tokio::test]
async fn test_refused_link_fails_fast() {
    let band = SimulatedBand::new();
    band.configure(|b| b.refuse_connect = true);
    let session = session_for(&band, None);

    assert!(!session.connect(true).await);
    assert!(!session.state().is_transport_connected());
    assert!(band.writes().is_empty());
}

#[tokio::test]
async fn test_failed_repair_keeps_old_key() {
    let band = SimulatedBand::new().with_key(OLD_KEY);
    band.configure(|b| b.reject_key = true);
    let session = session_for(&band, Some(OLD_KEY));

    assert!(!session.connect(true).await);
    assert_eq!(session.auth_key(), Some(OLD_KEY));
    assert_eq!(band.stored_key(), Some(OLD_KEY));
    assert!(!session.state().is_key_got());
}

#[tokio::test]
async fn test_reauthenticate() {
    let (band, session) = paired().await;

    assert!(session.reauthenticate().await);
    assert!(session.state().is_encrypted());
    assert_eq!(auth_writes(&band, 0x02), 2);
    assert_eq!(auth_writes(&band, 0x03), 2);
    assert_eq!(session.phase(), HandshakePhase::Authenticated);
}

#[tokio::test]
async fn test_failed_reauthenticate_falls_back_to_paired() {
    let (band, session) = paired().await;
    band.configure(|b| b.reject_random = true);

    assert!(!session.reauthenticate().await);

    let state = session.state();
    assert!(state.is_transport_connected());
    assert!(!state.is_encrypted());
    assert!(!state.is_random_requested());
    assert!(!state.is_auth_notify_on());
    assert!(!band.is_subscribed(Endpoint::AUTH));
    assert_eq!(session.phase(), HandshakePhase::Paired);
    assert!(session.auth_key().is_some());
}

#[tokio::test]
async fn test_reauthenticate_requires_authenticated_link() {
    let band = SimulatedBand::new();
    let session = session_for(&band, Some(OLD_KEY));

    assert!(!session.reauthenticate().await);
    assert!(band.writes().is_empty());
}

#[tokio::test]
async fn test_malformed_auth_notification_is_ignored() {
    let band = SimulatedBand::new();
    band.configure(|b| b.refuse_unsubscribe = true);
    let session = session_for(&band, None);
    assert!(session.connect(true).await);
    assert!(band.is_subscribed(Endpoint::AUTH));

    let before = session.state();
    assert!(band.push_notification(Endpoint::AUTH, &[0x10, 0x03]));
    assert!(band.push_notification(Endpoint::AUTH, &[0x10, 0x09, 0x01]));
    assert!(band.push_notification(
        Endpoint::AUTH,
        &AuthResponse::RandomDelivered.to_packet(&[0xAA; 4])
    ));
    assert_eq!(session.state(), before);
}

#[tokio::test]
async fn test_streaming_needs_authentication() {
    let band = SimulatedBand::new();
    let session = session_for(&band, None);

    assert!(!session.start_measure_heart_rate(|_| {}).await);
    assert!(!session.start_measure_acceleration(|_| {}).await);
    assert!(band.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_heart_rate_keep_alive() {
    let (band, session) = paired().await;
    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();

    assert!(
        session
            .start_measure_heart_rate(move |bpm| sink.lock().unwrap().push(bpm))
            .await
    );
    assert_eq!(band.count_writes(Command::HeartStopManual), 1);
    assert_eq!(band.count_writes(Command::HeartStartContinuous), 1);
    assert!(session.state().is_heart_rate_notify_on());

    assert!(band.push_notification(Endpoint::HEART_RATE_MEASURE, &heart_rate_packet(72)));
    assert!(band.push_notification(Endpoint::HEART_RATE_MEASURE, &heart_rate_packet(75)));
    assert_eq!(*samples.lock().unwrap(), vec![72, 75]);
    assert!(session.state().is_measuring_heart_rate());

    sleep(Duration::from_secs(35)).await;
    assert_eq!(band.count_writes(Command::HeartKeepAlive), 3);

    assert!(session.stop_measure_heart_rate().await);
    assert_eq!(band.count_writes(Command::HeartStopContinuous), 1);
    assert!(!session.state().is_measuring_heart_rate());
    assert!(!session.state().is_heart_rate_notify_on());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(band.count_writes(Command::HeartKeepAlive), 3);
}

#[tokio::test]
async fn test_heart_rate_start_fails_on_control_write() {
    let (band, session) = paired().await;
    band.configure(|b| {
        b.failing_writes.insert(Endpoint::HEART_RATE_CONTROL);
    });

    assert!(!session.start_measure_heart_rate(|_| {}).await);
    assert!(!session.state().is_measuring_heart_rate());
}

#[tokio::test(start_paused = true)]
async fn test_refused_heart_rate_notifications() {
    let (band, session) = paired().await;
    band.configure(|b| {
        b.refuse_notify.insert(Endpoint::HEART_RATE_MEASURE);
    });

    assert!(!session.start_measure_heart_rate(|_| {}).await);
    assert!(!session.state().is_heart_rate_notify_on());
    assert!(!session.state().is_measuring_heart_rate());
    assert_eq!(band.count_writes(Command::HeartStartContinuous), 0);

    sleep(Duration::from_secs(35)).await;
    assert_eq!(band.count_writes(Command::HeartKeepAlive), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refused_raw_notifications() {
    let (band, session) = paired().await;
    band.configure(|b| {
        b.refuse_notify.insert(Endpoint::SENSOR_DATA);
    });

    assert!(!session.start_measure_acceleration(|_| {}).await);
    assert!(!session.state().is_raw_notify_on());
    assert!(!session.state().is_measuring_acceleration());

    sleep(Duration::from_secs(70)).await;
    assert_eq!(band.count_writes(Command::AccelerationInit), 0);
    assert_eq!(band.count_writes(Command::AccelerationStart), 0);
}

#[tokio::test(start_paused = true)]
async fn test_acceleration_averages_and_rearms() {
    let (band, session) = paired().await;
    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();

    assert!(
        session
            .start_measure_acceleration(move |sample| sink.lock().unwrap().push(sample))
            .await
    );
    assert!(session.state().is_measuring_acceleration());
    assert_eq!(band.count_writes(Command::AccelerationInit), 1);
    assert_eq!(band.count_writes(Command::AccelerationStart), 1);

    let batch = [
        AccelerationSample { x: 1, y: 2, z: 3 },
        AccelerationSample { x: 2, y: 3, z: 4 },
        AccelerationSample { x: 3, y: 7, z: -1 },
        AccelerationSample { x: 4, y: 4, z: 4 },
    ];
    assert!(band.push_notification(Endpoint::SENSOR_DATA, &raw_sensor_packet(1, &batch)));

    let negative = [
        AccelerationSample { x: -1, y: 0, z: 0 },
        AccelerationSample { x: -2, y: 0, z: 0 },
    ];
    assert!(band.push_notification(Endpoint::SENSOR_DATA, &raw_sensor_packet(2, &negative)));

    assert_eq!(
        *samples.lock().unwrap(),
        vec![
            AccelerationAverage { x: 2.5, y: 4.0, z: 2.5 },
            AccelerationAverage { x: -1.5, y: 0.0, z: 0.0 },
        ]
    );

    sleep(Duration::from_secs(70)).await;
    assert_eq!(band.count_writes(Command::AccelerationInit), 2);
    assert_eq!(band.count_writes(Command::AccelerationStart), 2);

    assert!(session.stop_measure_acceleration().await);
    assert_eq!(band.count_writes(Command::AccelerationStop), 1);
    assert!(!session.state().is_measuring_acceleration());

    sleep(Duration::from_secs(130)).await;
    assert_eq!(band.count_writes(Command::AccelerationInit), 2);
}

#[tokio::test]
async fn test_malformed_raw_notification_is_dropped() {
    let (band, session) = paired().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    assert!(
        session
            .start_measure_acceleration(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
    );

    assert!(band.push_notification(Endpoint::SENSOR_DATA, &[0x01]));
    assert!(band.push_notification(Endpoint::SENSOR_DATA, &[0x01, 0x00, 0x05, 0x00, 0x06]));
    assert!(band.push_notification(Endpoint::SENSOR_DATA, &[0x01, 0x00]));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let sample = [AccelerationSample { x: 5, y: 5, z: 5 }];
    assert!(band.push_notification(Endpoint::SENSOR_DATA, &raw_sensor_packet(3, &sample)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_releases_leases_quietly() {
    let (band, session) = paired().await;
    let drops = Arc::new(AtomicUsize::new(0));
    let counter = drops.clone();
    session.set_disconnect_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(session.start_measure_heart_rate(|_| {}).await);
    assert!(session.start_measure_acceleration(|_| {}).await);

    session.disconnect().await;
    assert!(!band.is_connected());
    assert!(!session.state().is_transport_connected());
    assert_eq!(session.phase(), HandshakePhase::Idle);
    assert_eq!(band.count_writes(Command::AccelerationStop), 1);

    sleep(Duration::from_secs(120)).await;
    assert_eq!(band.count_writes(Command::HeartKeepAlive), 0);
    assert_eq!(band.count_writes(Command::AccelerationInit), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_notifies_owner() {
    let (band, session) = paired().await;
    let last_state = Arc::new(Mutex::new(None));
    let slot = last_state.clone();
    session.set_disconnect_handler(move |state| {
        *slot.lock().unwrap() = Some(state);
    });
    assert!(session.start_measure_heart_rate(|_| {}).await);

    band.drop_link();

    let state = last_state
        .lock()
        .unwrap()
        .expect("disconnect handler was not called");
    assert!(!state.is_transport_connected());
    assert!(!session.state().is_measuring_heart_rate());
    assert_eq!(session.phase(), HandshakePhase::Idle);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(band.count_writes(Command::HeartKeepAlive), 0);
}

#[tokio::test(start_paused = true)]
async fn test_streams_stop_cleanly_after_link_loss() {
    let (band, session) = paired().await;
    assert!(session.start_measure_heart_rate(|_| {}).await);
    assert!(session.start_measure_acceleration(|_| {}).await);

    band.drop_link();

    assert!(session.stop_measure_heart_rate().await);
    assert!(session.stop_measure_acceleration().await);
    assert_eq!(band.count_writes(Command::HeartStopContinuous), 0);
    assert_eq!(band.count_writes(Command::AccelerationStop), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_disconnect_reports_no_drop() {
    let (band, session) = paired().await;
    let drops = Arc::new(AtomicUsize::new(0));
    let counter = drops.clone();
    session.set_disconnect_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.disconnect().await;
    assert!(session.connect(false).await);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(band.is_connected());
    assert!(session.state().is_encrypted());
    assert_eq!(session.phase(), HandshakePhase::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn test_drop_after_reconnect_is_still_reported() {
    let (band, session) = paired().await;
    let drops = Arc::new(AtomicUsize::new(0));
    let counter = drops.clone();
    session.set_disconnect_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.disconnect().await;
    assert!(session.connect(false).await);
    band.drop_link();

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(!session.state().is_transport_connected());
}

#[tokio::test]
async fn test_disconnect_when_idle_is_noop() {
    let band = SimulatedBand::new();
    let session = session_for(&band, None);

    session.disconnect().await;
    assert!(!session.state().is_transport_connected());
    assert!(band.writes().is_empty());
}
