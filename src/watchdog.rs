use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::clock::{Clock, SystemClock};
use crate::detector::BlockageDetector;
use crate::error::WatchdogError;
use crate::event::{BlockageListener, Listeners};
use crate::interval::Interval;
use crate::probe::{HeartbeatProbe, Monitor, TargetQueue};
use crate::sampler::{SamplerLimits, StacktraceSampler};
use crate::settings::WatchdogConfig;
use crate::stack::StackSource;
use crate::state::ResponsivenessState;

pub struct WatchdogBuilder {
    config: WatchdogConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<dyn TargetQueue>,
    stack_source: Arc<dyn StackSource>,
    listeners: Vec<Arc<dyn BlockageListener>>,
}

impl WatchdogBuilder {
    pub fn new(queue: Arc<dyn TargetQueue>, stack_source: Arc<dyn StackSource>) -> Self {
        Self {
            config: WatchdogConfig::default(),
            clock: Arc::new(SystemClock),
            queue,
            stack_source,
            listeners: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: WatchdogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn BlockageListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<Watchdog, WatchdogError> {
        self.config.validate()?;

        let sampler = Arc::new(StacktraceSampler::new(
            SamplerLimits::from(&self.config),
            self.clock.clone(),
            self.stack_source,
        ));

        // the sampler always sees an event before any other listener
        let listeners = Listeners::new();
        listeners.add(sampler.clone());
        for listener in self.listeners {
            listeners.add(listener);
        }

        let state = Arc::new(ResponsivenessState::new(self.clock.now_ms()));
        let detector = Arc::new(BlockageDetector::new(
            &self.config,
            state.clone(),
            self.clock.clone(),
            Arc::new(listeners.clone()),
        ));
        let probe = HeartbeatProbe::new(
            detector,
            self.queue,
            self.clock.clone(),
            self.config.probe_interval(),
        );

        Ok(Watchdog {
            config: self.config,
            clock: self.clock,
            state,
            sampler,
            listeners,
            probe,
            crashed: AtomicBool::new(false),
        })
    }
}

/// Responsiveness watchdog for one target context.
///
/// Wires the heartbeat, the detector and the sampler together and exposes the lifecycle hooks
/// a host calls on foreground, background, crash and session transitions.
pub struct Watchdog {
    config: WatchdogConfig,
    clock: Arc<dyn Clock>,
    state: Arc<ResponsivenessState>,
    sampler: Arc<StacktraceSampler>,
    listeners: Listeners,
    probe: HeartbeatProbe,
    crashed: AtomicBool,
}

impl Watchdog {
    pub fn builder(
        queue: Arc<dyn TargetQueue>,
        stack_source: Arc<dyn StackSource>,
    ) -> WatchdogBuilder {
        WatchdogBuilder::new(queue, stack_source)
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<ResponsivenessState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.probe.is_running()
    }

    pub fn is_blocked(&self) -> bool {
        self.state.is_blockage_in_progress()
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// Starts the monitor thread.
    pub fn start(&self) -> Result<(), WatchdogError> {
        if self.is_crashed() {
            return Err(WatchdogError::Crashed);
        }
        self.probe.start()?;
        tracing::info!(
            probe_interval_ms = self.config.probe_interval_ms,
            threshold_ms = self.config.blocked_duration_threshold_ms,
            "watchdog started"
        );
        Ok(())
    }

    /// Restarts monitoring from the cold-start condition. A stale acknowledgement from before
    /// the app went to background is never compared against the current time, and a stall that
    /// was in progress ends at its last sample.
    pub fn on_foreground(&self) -> Result<(), WatchdogError> {
        if self.is_crashed() {
            return Err(WatchdogError::Crashed);
        }
        self.probe.stop();
        // a stall still open here will never see its Unblocked once the state is reset
        self.sampler.finalize_open_interval();
        self.state.reset(self.clock.now_ms());
        self.start()
    }

    pub fn on_background(&self) {
        if self.probe.is_running() {
            tracing::info!("watchdog paused");
        }
        self.probe.stop();
    }

    /// Freezes sampling for a crash report. Everything captured so far, including a stall in
    /// progress, stays available through [`Watchdog::captured_intervals`].
    pub fn on_crash(&self) {
        if self.crashed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sampler.freeze();
        self.probe.stop();
        tracing::info!(
            blocked = self.is_blocked(),
            "watchdog frozen after crash"
        );
    }

    /// Starts a new session. Completed intervals are dropped; a stall in progress carries over.
    pub fn on_session_change(&self) {
        self.sampler.clean_collections();
    }

    /// Deep copy of every interval of the session, safe to serialize from any thread.
    pub fn captured_intervals(&self) -> Vec<Interval> {
        self.sampler.captured_intervals()
    }

    /// Registers a listener for blockage events. Listeners run on the monitor thread, after the
    /// sampler, in registration order.
    pub fn add_listener(&self, listener: Arc<dyn BlockageListener>) {
        self.listeners.add(listener);
    }

    /// A monitor for driving ticks by hand instead of [`Watchdog::start`].
    pub fn manual_monitor(&self) -> Monitor {
        self.probe.monitor()
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("probe", &self.probe)
            .field("sampler", &self.sampler)
            .field("crashed", &self.is_crashed())
            .finish()
    }
}
