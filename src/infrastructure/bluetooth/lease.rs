//! Periodic lease renewal
//!
//! Some band modes expire on their own unless renewed: continuous heart-rate
//! monitoring wants a ping every few seconds, raw accelerometer streaming
//! stops after ~70 s. A [`Lease`] runs the renewal on a background task
//! until cancelled. Cancelling never interrupts a renewal that is already
//! running, but no tick starts after it.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub struct Lease {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Lease {
    /// Run `action` every `period`, first one period from now
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                trace!("Renewing lease: {}", name);
                action().await;
            }

            debug!("Lease {} released", name);
        });

        debug!("Lease {} started, period {:?}", name, period);
        Self {
            name,
            token,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop future renewals
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.handle.is_finished()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
