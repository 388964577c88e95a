//! Decides whether the target context is blocked.
//!
//! The detector owns no thread. [`HeartbeatProbe`](crate::probe::HeartbeatProbe) calls
//! [`BlockageDetector::on_monitor_tick`] on every tick and
//! [`BlockageDetector::on_target_response`] whenever a probe made it through the target's
//! queue. Both run on the monitor thread, which makes the monitor thread the only source of
//! [`BlockageEvent`]s.
//!
//! Two guards keep the timestamp handshake honest:
//!
//! - cold start: until the target has acknowledged a probe there is no baseline, so nothing is
//!   ever reported as blocked;
//! - frozen process: if the monitor itself did not run for `monitor_timeout_ms`, the whole
//!   process was most likely suspended by the OS. Both timestamps are moved to `now` instead of
//!   reporting a stall the size of the suspension.

use std::sync::Arc;

use crate::clock::Clock;
use crate::event::{BlockageEvent, BlockageListener};
use crate::settings::WatchdogConfig;
use crate::state::ResponsivenessState;

pub struct BlockageDetector {
    state: Arc<ResponsivenessState>,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn BlockageListener>,
    blocked_duration_threshold_ms: u64,
    monitor_timeout_ms: u64,
    sample_backoff_ms: f64,
}

impl BlockageDetector {
    pub fn new(
        config: &WatchdogConfig,
        state: Arc<ResponsivenessState>,
        clock: Arc<dyn Clock>,
        listener: Arc<dyn BlockageListener>,
    ) -> Self {
        Self {
            state,
            clock,
            listener,
            blocked_duration_threshold_ms: config.blocked_duration_threshold_ms,
            monitor_timeout_ms: config.monitor_timeout_ms,
            sample_backoff_ms: config.sample_backoff_ms(),
        }
    }

    pub fn state(&self) -> &Arc<ResponsivenessState> {
        &self.state
    }

    /// The target processed a probe at `timestamp`.
    pub fn on_target_response(&self, timestamp: u64) {
        if self.state.is_stale_response(timestamp) {
            tracing::trace!(timestamp, "ignoring acknowledgement from before re-priming");
            return;
        }
        self.state.record_target_response(timestamp);

        if self.state.is_blockage_in_progress() {
            self.state.set_blockage_in_progress(false);
            tracing::debug!(end_time = timestamp, "target context unblocked");
            self.listener
                .on_blockage_event(BlockageEvent::Unblocked { end_time: timestamp });
        }
    }

    /// One monitor tick at `now`.
    pub fn on_monitor_tick(&self, now: u64) {
        if !self.state.is_blockage_in_progress() && self.is_threshold_exceeded(now) {
            self.state.set_blockage_in_progress(true);
            let start_time = self.state.last_target_response_ms();
            tracing::warn!(
                start_time,
                blocked_for_ms = now.saturating_sub(start_time),
                "target context blocked"
            );
            metrics::counter!("watchdog_blockages_total").increment(1);
            self.listener
                .on_blockage_event(BlockageEvent::Blocked { start_time });
        }

        if self.state.is_blockage_in_progress() && self.should_sample(now) {
            self.listener
                .on_blockage_event(BlockageEvent::BlockedInterval { timestamp: now });
        }

        self.state.set_last_monitor_response_ms(self.clock.now_ms());
    }

    /// Ticks that bunch up after the monitor was starved would only produce near-identical
    /// samples, so at least `sample_backoff_ms` must separate two samples.
    fn should_sample(&self, now: u64) -> bool {
        let delta = now.saturating_sub(self.state.last_monitor_response_ms());
        delta as f64 > self.sample_backoff_ms
    }

    fn is_threshold_exceeded(&self, now: u64) -> bool {
        if !self.state.has_target_responded() {
            return false;
        }

        let monitor_lag = now.saturating_sub(self.state.last_monitor_response_ms());
        if monitor_lag > self.monitor_timeout_ms {
            tracing::warn!(
                monitor_lag_ms = monitor_lag,
                "monitor thread was suspended, resynchronizing heartbeat"
            );
            metrics::counter!("watchdog_process_resync_total").increment(1);
            self.state.resync(now);
            return false;
        }

        let target_lag = now.saturating_sub(self.state.last_target_response_ms());
        target_lag > self.blocked_duration_threshold_ms
    }
}

impl std::fmt::Debug for BlockageDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockageDetector")
            .field("state", &self.state)
            .field("blocked_duration_threshold_ms", &self.blocked_duration_threshold_ms)
            .field("monitor_timeout_ms", &self.monitor_timeout_ms)
            .finish()
    }
}
