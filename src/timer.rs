//! Periodic tick service.
//!
//! One interval task fans 1-second and 1-minute ticks out to every component
//! over broadcast channels. Tick payloads carry the current wall-clock time in
//! milliseconds; handlers must post real work to their owning manager and
//! return quickly.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::utils::now_ms;

/// Broadcast source for periodic ticks
#[derive(Clone)]
pub struct TimerService {
    second: broadcast::Sender<u64>,
    minute: broadcast::Sender<u64>,
    cancel: CancellationToken,
}

impl TimerService {
    /// Create the service; no ticks fire until [`TimerService::spawn`]
    pub fn new() -> Self {
        let (second, _) = broadcast::channel(16);
        let (minute, _) = broadcast::channel(16);
        Self {
            second,
            minute,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to 1-second ticks
    pub fn subscribe_second(&self) -> broadcast::Receiver<u64> {
        self.second.subscribe()
    }

    /// Subscribe to 1-minute ticks
    pub fn subscribe_minute(&self) -> broadcast::Receiver<u64> {
        self.minute.subscribe()
    }

    /// Start the tick task
    pub fn spawn(&self) {
        let second = self.second.clone();
        let minute = self.minute.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut count = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("timer service stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        let now = now_ms();
                        // Nobody listening is fine; ignore send errors.
                        let _ = second.send(now);
                        count += 1;
                        if count.is_multiple_of(60) {
                            let _ = minute.send(now);
                        }
                    }
                }
            }
        });
    }

    /// Stop the tick task
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}
