//! Reading the target context's call stack.
//!
//! The sampler only sees the [`StackSource`] trait. On Unix, [`unix::SignalStackSource`]
//! interrupts the registered target thread with `SIGUSR1`, walks its stack inside the signal
//! handler into a pre-allocated buffer and resolves symbols back on the monitor thread. Tests
//! and simulations plug in [`StaticStackSource`] or a closure.

use crate::error::CaptureError;
use crate::interval::{Frame, ThreadSnapshot, ThreadState};

pub trait StackSource: Send + Sync {
    /// Full, untruncated stack of the target. `frame_count` must equal `frames.len()` unless
    /// the source itself had to cut frames off.
    fn capture(&self) -> Result<ThreadSnapshot, CaptureError>;
}

impl<F> StackSource for F
where
    F: Fn() -> Result<ThreadSnapshot, CaptureError> + Send + Sync,
{
    fn capture(&self) -> Result<ThreadSnapshot, CaptureError> {
        self()
    }
}

/// Keeps the innermost `limit` frames. `frame_count` keeps the real depth.
pub fn truncate(mut snapshot: ThreadSnapshot, limit: usize) -> ThreadSnapshot {
    snapshot.frame_count = snapshot.frame_count.max(snapshot.frames.len());
    snapshot.frames.truncate(limit);
    snapshot
}

/// Always returns the same stack.
#[derive(Debug, Clone)]
pub struct StaticStackSource {
    snapshot: ThreadSnapshot,
}

impl StaticStackSource {
    pub fn new(name: impl Into<String>, symbols: &[&str]) -> Self {
        let frames: Vec<Frame> = symbols.iter().map(|s| Frame::named(*s)).collect();
        Self {
            snapshot: ThreadSnapshot {
                thread_id: 1,
                name: name.into(),
                priority: 0,
                state: ThreadState::Running,
                frame_count: frames.len(),
                frames,
            },
        }
    }
}

impl StackSource for StaticStackSource {
    fn capture(&self) -> Result<ThreadSnapshot, CaptureError> {
        Ok(self.snapshot.clone())
    }
}

#[cfg(unix)]
pub mod unix {
    use std::cell::UnsafeCell;
    use std::ffi::c_void;
    use std::ptr;
    use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, Once, PoisonError};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::StackSource;
    use crate::error::CaptureError;
    use crate::interval::{Frame, ThreadSnapshot, ThreadState};

    /// Raw instruction pointers stored per capture.
    const MAX_FRAMES: usize = 256;
    /// How long the monitor waits for the target's signal handler.
    const SIGNAL_WAIT_MS: u64 = 200;

    /// Symbols belonging to signal delivery rather than to the interrupted code.
    const SIGNAL_MACHINERY: &[&str] = &[
        "__restore_rt",
        "_sigtramp",
        "__sigtramp",
        "signal_handler",
        "backtrace::",
    ];

    // The handler runs on the target thread and must not allocate or lock. The monitor
    // allocates a `CaptureSlot`, publishes it through `CURRENT_CAPTURE` (Release) and signals
    // the target. The handler fills `ips`, stores `len` (Release) and raises `done`. The
    // monitor only reads `ips` after observing `done` (Acquire).

    struct CaptureSlot {
        ips: UnsafeCell<[usize; MAX_FRAMES]>,
        len: AtomicUsize,
        total: AtomicUsize,
        done: AtomicBool,
    }

    // SAFETY: `ips` is written by the signal handler only, and read by the monitor only after
    // the Release/Acquire pair on `done`.
    unsafe impl Sync for CaptureSlot {}

    static CURRENT_CAPTURE: AtomicPtr<CaptureSlot> = AtomicPtr::new(ptr::null_mut());
    /// One capture at a time, so `trace_unsynchronized` never runs concurrently.
    static CAPTURE_MUTEX: Mutex<()> = Mutex::new(());
    static INSTALL: Once = Once::new();

    extern "C" fn signal_handler(_: libc::c_int) {
        let ptr = CURRENT_CAPTURE.load(Ordering::Acquire);
        if ptr.is_null() {
            return;
        }
        // SAFETY: the monitor keeps the slot alive until it observed `done` or gave up, and
        // leaks it when it gave up.
        let slot: &CaptureSlot = unsafe { &*ptr };
        let buf: &mut [usize; MAX_FRAMES] = unsafe { &mut *slot.ips.get() };
        let mut count = 0usize;
        let mut total = 0usize;
        // SAFETY: serialized by CAPTURE_MUTEX held on the monitor side.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if count < MAX_FRAMES {
                    buf[count] = frame.ip() as usize;
                    count += 1;
                }
                total += 1;
                true
            });
        }
        slot.total.store(total, Ordering::Relaxed);
        slot.len.store(count, Ordering::Release);
        slot.done.store(true, Ordering::Release);
    }

    fn install_handler() {
        INSTALL.call_once(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = signal_handler as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGUSR1, &action, ptr::null_mut()) != 0 {
                tracing::error!("failed to install stack capture signal handler");
            }
        });
    }

    #[cfg(target_os = "linux")]
    fn current_tid() -> u64 {
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }

    #[cfg(not(target_os = "linux"))]
    fn current_tid() -> u64 {
        unsafe { libc::pthread_self() as u64 }
    }

    #[cfg(target_os = "linux")]
    fn thread_priority(tid: u64) -> i32 {
        unsafe { libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t) }
    }

    #[cfg(not(target_os = "linux"))]
    fn thread_priority(_tid: u64) -> i32 {
        0
    }

    #[cfg(target_os = "linux")]
    fn thread_state(tid: u64) -> ThreadState {
        // the comm field may contain spaces and parens, the state follows the last ')'
        std::fs::read_to_string(format!("/proc/self/task/{tid}/stat"))
            .ok()
            .and_then(|stat| {
                let rest = &stat[stat.rfind(')')? + 1..];
                rest.trim_start().chars().next()
            })
            .map(ThreadState::from_proc_code)
            .unwrap_or_default()
    }

    #[cfg(not(target_os = "linux"))]
    fn thread_state(_tid: u64) -> ThreadState {
        ThreadState::Unknown
    }

    /// Captures the stack of one registered thread.
    #[derive(Debug)]
    pub struct SignalStackSource {
        pthread: libc::pthread_t,
        tid: u64,
        name: String,
    }

    // SAFETY: `pthread_t` is only used as an opaque id for `pthread_kill`.
    unsafe impl Send for SignalStackSource {}
    unsafe impl Sync for SignalStackSource {}

    impl SignalStackSource {
        /// Must be called on the target thread.
        pub fn register_current_thread() -> Arc<Self> {
            install_handler();
            let tid = current_tid();
            let name = thread::current()
                .name()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("thread-{tid}"));
            Arc::new(Self {
                pthread: unsafe { libc::pthread_self() },
                tid,
                name,
            })
        }

        fn collect_ips(&self) -> Result<(Vec<usize>, usize), CaptureError> {
            let _lock = CAPTURE_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);

            let slot = Box::into_raw(Box::new(CaptureSlot {
                ips: UnsafeCell::new([0; MAX_FRAMES]),
                len: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
                done: AtomicBool::new(false),
            }));
            CURRENT_CAPTURE.store(slot, Ordering::Release);

            let rc = unsafe { libc::pthread_kill(self.pthread, libc::SIGUSR1) };
            if rc != 0 {
                CURRENT_CAPTURE.store(ptr::null_mut(), Ordering::Release);
                // SAFETY: the signal was never delivered, nobody else holds the slot.
                drop(unsafe { Box::from_raw(slot) });
                return Err(CaptureError::Signal(rc));
            }

            let deadline = Instant::now() + Duration::from_millis(SIGNAL_WAIT_MS);
            let answered = loop {
                // SAFETY: the slot stays allocated for the whole wait.
                if unsafe { &*slot }.done.load(Ordering::Acquire) {
                    break true;
                }
                if Instant::now() >= deadline {
                    break false;
                }
                thread::sleep(Duration::from_micros(50));
            };

            CURRENT_CAPTURE.store(ptr::null_mut(), Ordering::Release);

            if !answered {
                // A late handler may still be writing into the slot; leak it rather than free
                // memory it can touch.
                tracing::warn!(tid = self.tid, "stack capture signal timed out");
                return Err(CaptureError::Timeout(SIGNAL_WAIT_MS));
            }

            // SAFETY: `done` was observed, the handler no longer touches the slot.
            let slot = unsafe { Box::from_raw(slot) };
            let len = slot.len.load(Ordering::Acquire);
            let total = slot.total.load(Ordering::Relaxed);
            let ips = unsafe { &*slot.ips.get() }[..len].to_vec();
            Ok((ips, total))
        }
    }

    impl StackSource for SignalStackSource {
        fn capture(&self) -> Result<ThreadSnapshot, CaptureError> {
            let (ips, total) = self.collect_ips()?;
            let resolved = resolve(&ips);
            let frames = strip_signal_frames(resolved);
            let frame_count = frames.len() + total.saturating_sub(ips.len());
            Ok(ThreadSnapshot {
                thread_id: self.tid,
                name: self.name.clone(),
                priority: thread_priority(self.tid),
                state: thread_state(self.tid),
                frames,
                frame_count,
            })
        }
    }

    /// One frame per symbol; inlined functions share an instruction pointer.
    fn resolve(ips: &[usize]) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(ips.len());
        for &ip in ips {
            let before = frames.len();
            backtrace::resolve(ip as *mut c_void, |sym| {
                frames.push(Frame {
                    symbol: sym.name().map(|n| n.to_string()),
                    file: sym
                        .filename()
                        .and_then(|p| p.to_str())
                        .map(str::to_owned),
                    line: sym.lineno(),
                });
            });
            if frames.len() == before {
                frames.push(Frame::default());
            }
        }
        frames
    }

    fn is_signal_machinery(frame: &Frame) -> bool {
        frame
            .symbol
            .as_deref()
            .is_some_and(|name| SIGNAL_MACHINERY.iter().any(|p| name.contains(p)))
    }

    /// Drops everything up to and including the signal trampoline.
    pub(super) fn strip_signal_frames(frames: Vec<Frame>) -> Vec<Frame> {
        match frames.iter().rposition(is_signal_machinery) {
            Some(last) => frames.into_iter().skip(last + 1).collect(),
            None => frames,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::mpsc;

        #[test]
        fn strips_handler_frames() {
            let frames = vec![
                Frame::named("backtrace::backtrace::trace_unsynchronized"),
                Frame::named("pulsebeam_watchdog::stack::unix::signal_handler"),
                Frame::named("__restore_rt"),
                Frame::named("std::thread::sleep"),
                Frame::named("app::busy_loop"),
            ];
            let stripped = strip_signal_frames(frames);
            let names: Vec<_> = stripped.iter().filter_map(|f| f.symbol.as_deref()).collect();
            assert_eq!(names, vec!["std::thread::sleep", "app::busy_loop"]);
        }

        #[test]
        fn captures_a_sleeping_thread() {
            let (tx, rx) = mpsc::channel();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let handle = thread::Builder::new()
                .name("capture-target".to_string())
                .spawn(move || {
                    tx.send(SignalStackSource::register_current_thread()).unwrap();
                    while stop_rx.try_recv().is_err() {
                        thread::sleep(Duration::from_millis(5));
                    }
                })
                .unwrap();

            let source = rx.recv().unwrap();
            let snapshot = source.capture().unwrap();
            assert_eq!(snapshot.name, "capture-target");
            assert!(!snapshot.frames.is_empty());
            assert!(snapshot.frame_count >= snapshot.frames.len());

            stop_tx.send(()).unwrap();
            handle.join().unwrap();
        }
    }
}
