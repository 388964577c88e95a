use std::sync::Arc;

use parking_lot::RwLock;

/// Lifecycle of one stall, as seen by the monitor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockageEvent {
    /// The target crossed the blockage threshold. `start_time` is the last instant it was
    /// known to be responsive.
    Blocked { start_time: u64 },
    /// Still blocked at `timestamp`; fired at probe cadence while the stall lasts.
    BlockedInterval { timestamp: u64 },
    /// The target processed a probe again at `end_time`.
    Unblocked { end_time: u64 },
}

impl BlockageEvent {
    pub fn timestamp(&self) -> u64 {
        match *self {
            BlockageEvent::Blocked { start_time } => start_time,
            BlockageEvent::BlockedInterval { timestamp } => timestamp,
            BlockageEvent::Unblocked { end_time } => end_time,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlockageEvent::Blocked { .. } => "blocked",
            BlockageEvent::BlockedInterval { .. } => "blocked_interval",
            BlockageEvent::Unblocked { .. } => "unblocked",
        }
    }
}

/// Receives blockage events. Called on the monitor thread, so implementations must return
/// quickly.
pub trait BlockageListener: Send + Sync {
    fn on_blockage_event(&self, event: BlockageEvent);
}

impl<F> BlockageListener for F
where
    F: Fn(BlockageEvent) + Send + Sync,
{
    fn on_blockage_event(&self, event: BlockageEvent) {
        self(event);
    }
}

/// Fan-out to every registered listener, in registration order.
#[derive(Default, Clone)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Arc<dyn BlockageListener>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn BlockageListener>) {
        self.inner.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl BlockageListener for Listeners {
    fn on_blockage_event(&self, event: BlockageEvent) {
        // clone out so a listener registering another listener cannot deadlock
        let listeners = self.inner.read().clone();
        for listener in listeners {
            listener.on_blockage_event(event);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}
