#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use pulsebeam_watchdog::probe::Monitor;
use pulsebeam_watchdog::stack::StaticStackSource;
use pulsebeam_watchdog::{BlockageEvent, Clock, Job, ManualClock, Watchdog, WatchdogConfig};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

/// A watchdog whose target context and monitor are both stepped by hand against a
/// [`ManualClock`]. Each step is one probe interval.
pub struct SimulatedSession {
    pub clock: Arc<ManualClock>,
    pub watchdog: Watchdog,
    pub events: Arc<Mutex<Vec<BlockageEvent>>>,
    monitor: Monitor,
    target: UnboundedReceiver<Job>,
}

impl SimulatedSession {
    pub fn new(start_ms: u64, config: WatchdogConfig) -> Self {
        let clock = ManualClock::new(start_ms);
        let (tx, target) = unbounded_channel::<Job>();
        let watchdog = Watchdog::builder(
            Arc::new(tx),
            Arc::new(StaticStackSource::new(
                "main",
                &["app::decode_image", "app::render_frame", "app::main"],
            )),
        )
        .with_config(config)
        .with_clock(clock.clone())
        .build()
        .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        watchdog.add_listener(Arc::new(move |event: BlockageEvent| sink.lock().push(event)));

        let monitor = watchdog.manual_monitor();
        Self {
            clock,
            watchdog,
            events,
            monitor,
            target,
        }
    }

    pub fn probe_interval_ms(&self) -> u64 {
        self.watchdog.config().probe_interval_ms
    }

    /// Runs every job queued on the target at the current time.
    pub fn target_runs(&mut self) {
        while let Ok(job) = self.target.try_recv() {
            job();
        }
    }

    /// Monitor tick at the current time, with the target responsive right after it.
    pub fn responsive_tick(&mut self) {
        self.monitor.step();
        self.target_runs();
    }

    pub fn advance(&mut self, responsive: bool) {
        self.clock.tick(self.probe_interval_ms());
        self.monitor.step();
        if responsive {
            self.target_runs();
        }
    }

    /// Keeps ticking until `until_ms`, with the target not processing anything.
    pub fn stall_until(&mut self, until_ms: u64) {
        while self.clock.now_ms() < until_ms {
            self.advance(false);
        }
    }

    pub fn run_responsive(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.advance(true);
        }
    }

    pub fn events(&self) -> Vec<BlockageEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}
