//! Bounded archive of stalls and the stack samples taken during them.
//!
//! All intervals of a session live in one arena owned by [`StacktraceSampler`]. The monitor
//! thread is the only writer (through [`BlockageListener`]); readers on any thread get deep
//! copies from [`StacktraceSampler::captured_intervals`].
//!
//! Memory stays flat no matter how many stalls happen:
//!
//! - at most `max_stacktraces_per_interval` samples of an interval carry a stack, later ones
//!   are timing-only markers;
//! - at most `max_intervals_per_session` intervals keep their samples. When a stall closes and
//!   that limit is exceeded, the interval with the shortest duration loses its samples;
//! - at most `max_intervals_hard_cap` intervals are tracked at all. Stalls past that are
//!   dropped entirely.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::event::{BlockageEvent, BlockageListener};
use crate::interval::{Interval, Sample, SampleCode, ThreadSnapshot};
use crate::settings::WatchdogConfig;
use crate::stack::{self, StackSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerLimits {
    pub max_intervals_per_session: usize,
    pub max_stacktraces_per_interval: usize,
    pub stacktrace_frame_limit: usize,
    pub max_intervals_hard_cap: usize,
    pub dedupe_consecutive_stacks: bool,
}

impl From<&WatchdogConfig> for SamplerLimits {
    fn from(cfg: &WatchdogConfig) -> Self {
        Self {
            max_intervals_per_session: cfg.max_intervals_per_session,
            max_stacktraces_per_interval: cfg.max_stacktraces_per_interval,
            stacktrace_frame_limit: cfg.stacktrace_frame_limit,
            max_intervals_hard_cap: cfg.max_intervals_hard_cap,
            dedupe_consecutive_stacks: cfg.dedupe_consecutive_stacks,
        }
    }
}

#[derive(Debug)]
struct Entry {
    id: u64,
    interval: Interval,
}

#[derive(Debug)]
struct OpenBlockage {
    id: u64,
    prev_snapshot: Option<ThreadSnapshot>,
}

#[derive(Debug, Default)]
struct IntervalArena {
    entries: Vec<Entry>,
    open: Option<OpenBlockage>,
    next_id: u64,
}

impl IntervalArena {
    fn open_entry_mut(&mut self) -> Option<&mut Entry> {
        let id = self.open.as_ref()?.id;
        self.entries.iter_mut().find(|e| e.id == id)
    }

    fn retained_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.interval.has_samples())
            .count()
    }

    /// Shortest interval still holding samples. On equal durations the earlier one wins.
    fn least_valuable(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.interval.has_samples())
            .min_by_key(|(_, e)| e.interval.duration())
            .map(|(idx, _)| idx)
    }
}

/// Outcome of checking the open interval before taking a sample.
enum SamplePlan {
    Capture { id: u64, taken: usize },
    LimitReached,
    NoInterval,
}

pub struct StacktraceSampler {
    clock: Arc<dyn Clock>,
    stack_source: Arc<dyn StackSource>,
    limits: SamplerLimits,
    arena: Mutex<IntervalArena>,
    frozen: AtomicBool,
}

impl StacktraceSampler {
    pub fn new(
        limits: SamplerLimits,
        clock: Arc<dyn Clock>,
        stack_source: Arc<dyn StackSource>,
    ) -> Self {
        Self {
            clock,
            stack_source,
            limits,
            arena: Mutex::new(IntervalArena::default()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn limits(&self) -> &SamplerLimits {
        &self.limits
    }

    /// Stops accepting events. Everything captured so far, including an open interval, stays
    /// readable.
    pub fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::AcqRel) {
            tracing::info!("stacktrace sampler frozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn is_blocked(&self) -> bool {
        self.arena.lock().open.is_some()
    }

    /// Deep copies of every tracked interval, in the order the stalls began. An open interval
    /// is reported with `last_known_time = now`.
    pub fn captured_intervals(&self) -> Vec<Interval> {
        let now = self.clock.now_ms();
        let arena = self.arena.lock();
        arena
            .entries
            .iter()
            .map(|e| e.interval.snapshot_at(now))
            .collect()
    }

    /// Drops completed intervals at a session boundary. A stall still in progress carries over.
    pub fn clean_collections(&self) {
        let mut arena = self.arena.lock();
        let before = arena.entries.len();
        arena.entries.retain(|e| e.interval.is_open());
        tracing::debug!(
            removed = before - arena.entries.len(),
            "cleared completed intervals"
        );
    }

    /// Closes a stall the detector forgot about, e.g. because monitoring was re-primed while it
    /// was in progress. It ends at its last sample, or at its start when nothing was sampled.
    pub fn finalize_open_interval(&self) {
        if self.is_frozen() {
            return;
        }
        let mut arena = self.arena.lock();
        self.close_open(&mut arena, None);
    }

    fn on_blocked(&self, start_time: u64) {
        let mut arena = self.arena.lock();

        if arena.open.is_some() {
            tracing::debug!(start_time, "superseding open interval");
            self.close_open(&mut arena, None);
        }

        if arena.entries.len() >= self.limits.max_intervals_hard_cap {
            tracing::debug!(
                cap = self.limits.max_intervals_hard_cap,
                "interval cap reached, dropping stall"
            );
            metrics::counter!("watchdog_intervals_dropped_total").increment(1);
            return;
        }

        let id = arena.next_id;
        arena.next_id += 1;
        arena.entries.push(Entry {
            id,
            interval: Interval::open(start_time),
        });
        arena.open = Some(OpenBlockage {
            id,
            prev_snapshot: None,
        });
    }

    fn plan_sample(&self) -> SamplePlan {
        let mut arena = self.arena.lock();
        let Some(entry) = arena.open_entry_mut() else {
            return SamplePlan::NoInterval;
        };
        let taken = entry.interval.sample_count();
        if taken >= self.limits.max_stacktraces_per_interval {
            SamplePlan::LimitReached
        } else {
            SamplePlan::Capture { id: entry.id, taken }
        }
    }

    fn on_blocked_interval(&self, timestamp: u64) {
        let (id, taken) = match self.plan_sample() {
            SamplePlan::NoInterval => return,
            SamplePlan::LimitReached => {
                self.push_sample(None, Sample::limit_reached(timestamp));
                return;
            }
            SamplePlan::Capture { id, taken } => (id, taken),
        };

        // the costly part runs without the arena lock so readers are never held up by it
        let started = self.clock.now_ms();
        let captured = self.stack_source.capture();
        let overhead = self.clock.now_ms().saturating_sub(started);
        metrics::histogram!("watchdog_sample_overhead_ms").record(overhead as f64);

        let sample = match captured {
            Ok(snapshot) => Sample::captured(
                timestamp,
                overhead,
                stack::truncate(snapshot, self.limits.stacktrace_frame_limit),
            ),
            Err(err) => {
                tracing::debug!(%err, "failed to capture target stack");
                Sample::capture_failed(timestamp, overhead)
            }
        };
        tracing::trace!(id, taken, "sampled blocked target");
        self.push_sample(Some(id), sample);
    }

    /// Appends to the open interval. `expected` guards against the interval having changed
    /// while the stack was being captured; the cap is re-checked under the lock.
    fn push_sample(&self, expected: Option<u64>, mut sample: Sample) {
        let limits = self.limits;
        let mut arena = self.arena.lock();
        let IntervalArena { entries, open, .. } = &mut *arena;
        let Some(open) = open.as_mut() else {
            return;
        };
        if expected.is_some_and(|id| id != open.id) {
            return;
        }
        let Some(samples) = entries
            .iter_mut()
            .find(|e| e.id == open.id)
            .and_then(|e| e.interval.samples.as_mut())
        else {
            return;
        };

        if samples.len() >= limits.max_stacktraces_per_interval {
            sample = Sample::limit_reached(sample.timestamp);
        } else if limits.dedupe_consecutive_stacks && sample.snapshot.is_some() {
            if sample.snapshot == open.prev_snapshot {
                sample.snapshot = None;
            } else {
                open.prev_snapshot = sample.snapshot.clone();
            }
        }

        metrics::counter!("watchdog_samples_total", "status" => sample_status(&sample))
            .increment(1);
        samples.push(sample);
    }

    fn on_unblocked(&self, end_time: u64) {
        let mut arena = self.arena.lock();
        self.close_open(&mut arena, Some(end_time));
    }

    /// Closes the open interval at `end_time`, or at its last observed instant when `None`,
    /// then enforces the per-session cap.
    fn close_open(&self, arena: &mut IntervalArena, end_time: Option<u64>) {
        let Some(entry) = arena.open_entry_mut() else {
            arena.open = None;
            return;
        };
        let end_time = end_time.unwrap_or_else(|| {
            entry
                .interval
                .samples
                .as_ref()
                .and_then(|s| s.last())
                .map_or(entry.interval.start_time, |s| s.timestamp)
        });
        entry.interval.close(end_time);
        let duration = entry.interval.duration().unwrap_or_default();
        arena.open = None;

        metrics::histogram!("watchdog_blockage_duration_ms").record(duration as f64);
        tracing::debug!(duration_ms = duration, "closed blockage interval");

        while arena.retained_count() > self.limits.max_intervals_per_session {
            let Some(idx) = arena.least_valuable() else {
                break;
            };
            let interval = &mut arena.entries[idx].interval;
            tracing::debug!(
                start_time = interval.start_time,
                duration_ms = interval.duration(),
                "evicting samples of least valuable interval"
            );
            interval.clear_samples();
            metrics::counter!("watchdog_evictions_total").increment(1);
        }
    }
}

fn sample_status(sample: &Sample) -> &'static str {
    match sample.code {
        SampleCode::Default => "default",
        SampleCode::SampleLimitReached => "limit_reached",
        SampleCode::CaptureFailed => "capture_failed",
    }
}

impl BlockageListener for StacktraceSampler {
    fn on_blockage_event(&self, event: BlockageEvent) {
        if self.is_frozen() {
            return;
        }
        match event {
            BlockageEvent::Blocked { start_time } => self.on_blocked(start_time),
            BlockageEvent::BlockedInterval { timestamp } => self.on_blocked_interval(timestamp),
            BlockageEvent::Unblocked { end_time } => self.on_unblocked(end_time),
        }
    }
}

impl std::fmt::Debug for StacktraceSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StacktraceSampler")
            .field("limits", &self.limits)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
