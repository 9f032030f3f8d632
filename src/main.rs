use anyhow::{bail, Context};
use fitness_band::domain::models::{AccelerationSample, DeviceAddress};
use fitness_band::domain::settings::SettingsService;
use fitness_band::infrastructure::bluetooth::protocol::Endpoint;
use fitness_band::infrastructure::bluetooth::simulated::{heart_rate_packet, raw_sensor_packet};
use fitness_band::infrastructure::bluetooth::{DeviceSession, SessionConfig, SimulatedBand};
use fitness_band::infrastructure::logging::init_logger;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEMO_ADDRESS: &str = "C8:0F:10:00:00:01";
const STREAM_WINDOW: Duration = Duration::from_secs(3);
const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = SettingsService::new()?;
    let _guard = init_logger(&settings.get().log_settings)?;
    info!("Starting fitness band session (settings: {})", settings.path().display());

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--forget") {
        settings.forget_pairing().context("clearing the stored pairing")?;
        info!("Stored pairing cleared");
        return Ok(());
    }
    let force_new_key = args.iter().any(|arg| arg == "--pair");
    let address = DeviceAddress::new(DEMO_ADDRESS);

    let stored_key = settings
        .get()
        .paired_device
        .as_ref()
        .filter(|paired| paired.address == address)
        .map(|paired| paired.auth_key);

    let band = match stored_key {
        Some(key) => SimulatedBand::new().with_key(key),
        None => SimulatedBand::new(),
    };

    let config = SessionConfig::from(&settings.get().session);
    let session = DeviceSession::new(address.clone(), stored_key, Arc::new(band.clone()), config);
    session.set_disconnect_handler(|state| warn!("Band went away, last state {}", state));

    let mut changes = session.subscribe_state();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let state = *changes.borrow_and_update();
            debug!("Connection state {}", state);
        }
    });

    if !session.connect(force_new_key).await {
        bail!("could not authenticate with {}", session.address());
    }

    if let Some(key) = session.auth_key() {
        if stored_key != Some(key) {
            settings
                .remember_pairing(address.clone(), key)
                .context("saving the pairing key")?;
            info!("Pairing key saved");
        }
    }

    if !session
        .start_measure_heart_rate(|bpm| info!("Heart rate: {} bpm", bpm))
        .await
    {
        warn!("Heart rate measurement unavailable");
    }
    if !session
        .start_measure_acceleration(|sample| info!("Acceleration: {:?}", sample))
        .await
    {
        warn!("Acceleration measurement unavailable");
    }

    stream_samples(&band).await;

    session.stop_measure_heart_rate().await;
    session.stop_measure_acceleration().await;
    session.disconnect().await;

    info!("Session finished, state {}", session.state());
    Ok(())
}

/// Play the band's side of both streams for a short window
async fn stream_samples(band: &SimulatedBand) {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    let deadline = tokio::time::Instant::now() + STREAM_WINDOW;
    let mut sequence: u16 = 0;

    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        sequence = sequence.wrapping_add(1);

        let bpm = 68 + (sequence % 8);
        band.push_notification(Endpoint::HEART_RATE_MEASURE, &heart_rate_packet(bpm));

        let drift = (sequence % 16) as i16;
        let samples = [
            AccelerationSample { x: 12 + drift, y: -4, z: 1020 },
            AccelerationSample { x: 10 + drift, y: -6, z: 1024 },
            AccelerationSample { x: 14 + drift, y: -2, z: 1016 },
        ];
        band.push_notification(Endpoint::SENSOR_DATA, &raw_sensor_packet(sequence, &samples));
    }
}
