//! Heartbeat between the monitor thread and the target context.
//!
//! Every tick the monitor posts a small job onto the target's own queue (unless one is still
//! in flight) and asks the [`BlockageDetector`] whether the last acknowledgement is too old.
//! The job stamps `last_target_response_ms` inside the target context and reports back over a
//! channel, so the detector only ever runs on the monitor thread.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::detector::BlockageDetector;
use crate::error::{PostError, WatchdogError};

/// Unit of work executed by the target context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The target context's cooperative work queue.
pub trait TargetQueue: Send + Sync {
    /// Enqueues `job` without waiting for it to run.
    fn post(&self, job: Job) -> Result<(), PostError>;
}

/// Runs probes as tasks on a tokio runtime. Meant for a current-thread runtime, whose single
/// thread is then the target context.
impl TargetQueue for tokio::runtime::Handle {
    fn post(&self, job: Job) -> Result<(), PostError> {
        self.spawn(async move { job() });
        Ok(())
    }
}

/// A plain job queue drained by the target's own loop.
impl TargetQueue for tokio::sync::mpsc::UnboundedSender<Job> {
    fn post(&self, job: Job) -> Result<(), PostError> {
        self.send(job).map_err(|_| PostError::Closed)
    }
}

#[derive(Debug)]
enum MonitorMsg {
    TargetResponded(u64),
    Stop,
}

/// One monitor loop. [`HeartbeatProbe`] runs it on a dedicated thread; simulations can also
/// call [`Monitor::step`] by hand against a manual clock.
pub struct Monitor {
    detector: Arc<BlockageDetector>,
    queue: Arc<dyn TargetQueue>,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<MonitorMsg>,
    rx: mpsc::Receiver<MonitorMsg>,
}

impl Monitor {
    pub fn new(
        detector: Arc<BlockageDetector>,
        queue: Arc<dyn TargetQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            detector,
            queue,
            clock,
            tx,
            rx,
        }
    }

    /// Handles acknowledgements that arrived since the last call, then ticks once. Returns
    /// `false` if the monitor was told to stop.
    pub fn step(&self) -> bool {
        if !self.poll_responses() {
            return false;
        }
        self.tick();
        true
    }

    fn poll_responses(&self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(MonitorMsg::TargetResponded(ts)) => self.detector.on_target_response(ts),
                Ok(MonitorMsg::Stop) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn tick(&self) {
        self.post_probe();
        let now = self.clock.now_ms();
        tracing::trace!(now, "monitor tick");
        self.detector.on_monitor_tick(now);
    }

    fn post_probe(&self) {
        let state = self.detector.state().clone();
        if !state.try_mark_probe_outstanding() {
            return;
        }

        let clock = self.clock.clone();
        let tx = self.tx.clone();
        let probe_state = state.clone();
        let job: Job = Box::new(move || {
            let now = clock.now_ms();
            probe_state.record_target_response(now);
            probe_state.clear_probe_outstanding();
            // the monitor may be gone already; the timestamp above is all that matters then
            let _ = tx.send(MonitorMsg::TargetResponded(now));
        });

        if let Err(err) = self.queue.post(job) {
            state.clear_probe_outstanding();
            tracing::warn!(%err, "failed to post heartbeat probe");
            metrics::counter!("watchdog_probe_post_failures_total").increment(1);
        }
    }

    fn stopper(&self) -> mpsc::Sender<MonitorMsg> {
        self.tx.clone()
    }

    fn run(self, interval: Duration) {
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            "watchdog monitor started"
        );
        // first tick right away, then at fixed rate
        let mut next_tick = Instant::now();
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(wait) {
                Ok(MonitorMsg::TargetResponded(ts)) => self.detector.on_target_response(ts),
                Ok(MonitorMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    self.tick();
                    next_tick += interval;
                    // never burst to catch up after the monitor itself was starved
                    let now = Instant::now();
                    if next_tick <= now {
                        next_tick = now + interval;
                    }
                }
            }
        }
        tracing::info!("watchdog monitor stopped");
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("detector", &self.detector)
            .finish()
    }
}

struct RunningMonitor {
    stop: mpsc::Sender<MonitorMsg>,
    thread: JoinHandle<()>,
}

/// Owns the monitor thread. Stopping simply stops scheduling ticks; shared state is left as is.
pub struct HeartbeatProbe {
    detector: Arc<BlockageDetector>,
    queue: Arc<dyn TargetQueue>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    running: Mutex<Option<RunningMonitor>>,
}

impl HeartbeatProbe {
    pub fn new(
        detector: Arc<BlockageDetector>,
        queue: Arc<dyn TargetQueue>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            detector,
            queue,
            clock,
            interval,
            running: Mutex::new(None),
        }
    }

    /// A monitor bound to the same detector and queue, for driving ticks by hand.
    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.detector.clone(),
            self.queue.clone(),
            self.clock.clone(),
        )
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.thread.is_finished())
    }

    pub fn start(&self) -> Result<(), WatchdogError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.thread.is_finished()) {
            return Err(WatchdogError::AlreadyRunning);
        }

        let monitor = self.monitor();
        let stop = monitor.stopper();
        let interval = self.interval;
        let thread = thread::Builder::new()
            .name("watchdog-monitor".to_string())
            .spawn(move || monitor.run(interval))
            .map_err(WatchdogError::SpawnMonitor)?;

        *running = Some(RunningMonitor { stop, thread });
        Ok(())
    }

    /// Does nothing if the monitor is not running.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.stop.send(MonitorMsg::Stop);

        // a listener may stop the watchdog from the monitor thread itself
        if running.thread.thread().id() == thread::current().id() {
            return;
        }
        if running.thread.join().is_err() {
            tracing::error!("watchdog monitor thread panicked");
        }
    }
}

impl Drop for HeartbeatProbe {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HeartbeatProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatProbe")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}
