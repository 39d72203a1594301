//! Edit-rate budget tracking.

use std::time::Duration;
use tokio::time::Instant;
use voxrelay_config::DeliveryConfig;

/// Paces message edits under the host's rate ceiling.
///
/// Up to `burst_limit` edits per rolling `burst_window_ms` go out at the
/// short burst interval; once the budget is spent the cadence drops to
/// `sustained_interval_ms` until the window rolls over. A rejected edit
/// exhausts the budget immediately for the rest of the response.
///
/// All methods take an explicit `now` so the throttle stays pure state.
#[derive(Debug)]
pub struct EditThrottle {
    config: DeliveryConfig,
    edits_used: u32,
    window_start: Option<Instant>,
    last_edit: Option<Instant>,
}

impl EditThrottle {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            edits_used: 0,
            window_start: None,
            last_edit: None,
        }
    }

    /// How long to wait, from `now`, before the next edit may go out.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        self.roll_window(now);

        let interval = if self.edits_used < self.config.burst_limit {
            Duration::from_millis(self.config.burst_interval_ms)
        } else {
            Duration::from_millis(self.config.sustained_interval_ms)
        };

        match self.last_edit {
            Some(last) => (last + interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Record a successful edit.
    pub fn note_edit(&mut self, now: Instant) {
        self.roll_window(now);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.edits_used += 1;
        self.last_edit = Some(now);
    }

    /// Record a rejected edit. The host said slow down; treat the burst
    /// budget as spent so everything after falls to the sustained cadence.
    pub fn note_failure(&mut self, now: Instant) {
        self.edits_used = self.config.burst_limit;
        self.window_start = Some(now);
        self.last_edit = Some(now);
    }

    fn roll_window(&mut self, now: Instant) {
        if let Some(start) = self.window_start {
            if now.saturating_duration_since(start)
                >= Duration::from_millis(self.config.burst_window_ms)
            {
                self.edits_used = 0;
                self.window_start = Some(now);
            }
        }
    }
}
