use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// `last_target_response_ms` value before the target has acknowledged any probe.
pub const NEVER_RESPONDED: u64 = u64::MAX;

/// Timestamps shared by the monitor thread and the target context.
///
/// There is no lock spanning a monitor tick and the target's acknowledgement; the two sides
/// hand off purely through these cells. The target context writes `last_target_response_ms`
/// and clears `probe_outstanding`, everything else is written by the monitor thread.
#[derive(Debug)]
pub struct ResponsivenessState {
    last_target_response_ms: AtomicU64,
    last_monitor_response_ms: AtomicU64,
    blockage_in_progress: AtomicBool,
    probe_outstanding: AtomicBool,
    /// Acknowledgements stamped before this instant belong to an earlier monitoring run.
    primed_at_ms: AtomicU64,
}

impl ResponsivenessState {
    pub fn new(now_ms: u64) -> Self {
        Self {
            last_target_response_ms: AtomicU64::new(NEVER_RESPONDED),
            last_monitor_response_ms: AtomicU64::new(now_ms),
            blockage_in_progress: AtomicBool::new(false),
            probe_outstanding: AtomicBool::new(false),
            primed_at_ms: AtomicU64::new(0),
        }
    }

    pub fn last_target_response_ms(&self) -> u64 {
        self.last_target_response_ms.load(Ordering::Acquire)
    }

    pub fn set_last_target_response_ms(&self, ts: u64) {
        self.last_target_response_ms.store(ts, Ordering::Release);
    }

    /// Records an acknowledgement at `ts` unless a later one is already stored or it predates
    /// the last [`reset`](Self::reset). Returns whether the value changed.
    pub fn record_target_response(&self, ts: u64) -> bool {
        if self.is_stale_response(ts) {
            return false;
        }
        self.last_target_response_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur == NEVER_RESPONDED || ts > cur).then_some(ts)
            })
            .is_ok()
    }

    pub fn is_stale_response(&self, ts: u64) -> bool {
        ts < self.primed_at_ms.load(Ordering::Acquire)
    }

    pub fn has_target_responded(&self) -> bool {
        self.last_target_response_ms() != NEVER_RESPONDED
    }

    pub fn last_monitor_response_ms(&self) -> u64 {
        self.last_monitor_response_ms.load(Ordering::Acquire)
    }

    pub fn set_last_monitor_response_ms(&self, ts: u64) {
        self.last_monitor_response_ms.store(ts, Ordering::Release);
    }

    pub fn is_blockage_in_progress(&self) -> bool {
        self.blockage_in_progress.load(Ordering::Acquire)
    }

    pub fn set_blockage_in_progress(&self, blocked: bool) {
        self.blockage_in_progress.store(blocked, Ordering::Release);
    }

    /// Marks a probe as in flight. Returns `false` if one already was.
    pub fn try_mark_probe_outstanding(&self) -> bool {
        self.probe_outstanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_probe_outstanding(&self) {
        self.probe_outstanding.store(false, Ordering::Release);
    }

    pub fn is_probe_outstanding(&self) -> bool {
        self.probe_outstanding.load(Ordering::Acquire)
    }

    /// Moves both timestamps to `now_ms`. Used after the process was frozen.
    pub fn resync(&self, now_ms: u64) {
        self.set_last_target_response_ms(now_ms);
        self.set_last_monitor_response_ms(now_ms);
    }

    /// Back to the cold-start condition: nothing acknowledged yet, nothing blocked.
    pub fn reset(&self, now_ms: u64) {
        self.primed_at_ms.store(now_ms, Ordering::Release);
        self.set_last_target_response_ms(NEVER_RESPONDED);
        self.set_last_monitor_response_ms(now_ms);
        self.set_blockage_in_progress(false);
        self.clear_probe_outstanding();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_cold() {
        let state = ResponsivenessState::new(500);
        assert!(!state.has_target_responded());
        assert_eq!(state.last_monitor_response_ms(), 500);
        assert!(!state.is_blockage_in_progress());
    }

    #[test]
    fn single_outstanding_probe() {
        let state = ResponsivenessState::new(0);
        assert!(state.try_mark_probe_outstanding());
        assert!(!state.try_mark_probe_outstanding());
        state.clear_probe_outstanding();
        assert!(state.try_mark_probe_outstanding());
    }

    #[test]
    fn reset_reprimes_cold_start() {
        let state = ResponsivenessState::new(0);
        state.set_last_target_response_ms(1_000);
        state.set_blockage_in_progress(true);
        state.try_mark_probe_outstanding();

        state.reset(2_000);
        assert!(!state.has_target_responded());
        assert_eq!(state.last_monitor_response_ms(), 2_000);
        assert!(!state.is_blockage_in_progress());
        assert!(!state.is_probe_outstanding());
    }

    #[test]
    fn target_response_never_moves_backwards() {
        let state = ResponsivenessState::new(0);
        assert!(state.record_target_response(200));
        assert!(!state.record_target_response(100));
        assert_eq!(state.last_target_response_ms(), 200);
        assert!(state.record_target_response(300));
    }

    #[test]
    fn resync_moves_both_timestamps() {
        let state = ResponsivenessState::new(0);
        state.set_last_target_response_ms(10);
        state.resync(70_000);
        assert_eq!(state.last_target_response_ms(), 70_000);
        assert_eq!(state.last_monitor_response_ms(), 70_000);
    }

    #[test]
    fn acknowledgement_from_before_reset_is_rejected() {
        let state = ResponsivenessState::new(0);
        assert!(state.record_target_response(0));
        state.reset(30_000);

        assert!(state.is_stale_response(0));
        assert!(!state.record_target_response(0));
        assert!(!state.has_target_responded());

        assert!(state.record_target_response(30_000));
        assert_eq!(state.last_target_response_ms(), 30_000);
    }
}
