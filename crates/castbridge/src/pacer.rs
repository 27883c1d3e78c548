//! Real-time release of decoded frames.
//!
//! Upstream segments arrive seconds of audio at a time. The pacer maps
//! presentation timestamps onto the wall clock so listeners receive a steady
//! frame rate. The first `lead` of audio after (re)starting the clock is
//! released at once to fill player buffers.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct Pacer {
    /// Wall clock instant and timestamp the schedule is anchored at
    origin: Option<(Instant, Duration)>,
    lead: Duration,
    max_lag: Duration,
}

impl Pacer {
    pub fn new(lead: Duration, max_lag: Duration) -> Self {
        Self {
            origin: None,
            lead,
            max_lag,
        }
    }

    /// When the frame at `pts` is due, `None` if it is due already
    pub fn deadline(&mut self, pts: Duration) -> Option<Instant> {
        let now = Instant::now();
        let (origin_at, origin_pts) = *self.origin.get_or_insert((now, pts));

        let Some(offset) = pts.checked_sub(origin_pts) else {
            // Timestamps went backwards, start a new schedule
            self.origin = Some((now, pts));
            return None;
        };
        let due = (origin_at + offset)
            .checked_sub(self.lead)
            .unwrap_or(origin_at);

        if due > now {
            return Some(due);
        }
        let lag = now - due;
        if lag > self.max_lag {
            debug!(lag_ms = lag.as_millis() as u64, "Pacer fell behind, rebasing");
            self.origin = Some((now, pts));
        }
        None
    }

    /// Sleep until the frame at `pts` is due
    pub async fn wait(&mut self, pts: Duration) {
        if let Some(deadline) = self.deadline(pts) {
            tokio::time::sleep_until(deadline).await;
        }
    }
}
