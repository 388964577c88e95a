use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalCode {
    #[default]
    Default,
    /// Samples were evicted to respect the per-session cap; timing is still accurate.
    SamplesCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleCode {
    #[default]
    Default,
    /// Taken after the per-interval cap; kept for timing only.
    SampleLimitReached,
    /// The target's stack could not be read for this tick.
    CaptureFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    Zombie,
    #[default]
    Unknown,
}

impl ThreadState {
    /// Maps the state letter of `/proc/<pid>/task/<tid>/stat`.
    pub fn from_proc_code(code: char) -> Self {
        match code {
            'R' => ThreadState::Running,
            'S' | 'I' => ThreadState::Sleeping,
            'D' => ThreadState::DiskSleep,
            'T' | 't' => ThreadState::Stopped,
            'Z' | 'X' => ThreadState::Zombie,
            _ => ThreadState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Frame {
    pub symbol: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Frame {
    pub fn named(symbol: impl Into<String>) -> Self {
        Self {
            symbol: Some(symbol.into()),
            file: None,
            line: None,
        }
    }
}

/// The target thread as observed at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub thread_id: u64,
    pub name: String,
    pub priority: i32,
    pub state: ThreadState,
    /// Innermost first, truncated to the configured frame limit.
    pub frames: Vec<Frame>,
    /// Depth of the stack before truncation.
    pub frame_count: usize,
}

impl ThreadSnapshot {
    pub fn is_truncated(&self) -> bool {
        self.frame_count > self.frames.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: u64,
    pub capture_overhead_ms: u64,
    pub snapshot: Option<ThreadSnapshot>,
    pub code: SampleCode,
}

impl Sample {
    pub fn captured(timestamp: u64, capture_overhead_ms: u64, snapshot: ThreadSnapshot) -> Self {
        Self {
            timestamp,
            capture_overhead_ms,
            snapshot: Some(snapshot),
            code: SampleCode::Default,
        }
    }

    pub fn limit_reached(timestamp: u64) -> Self {
        Self {
            timestamp,
            capture_overhead_ms: 0,
            snapshot: None,
            code: SampleCode::SampleLimitReached,
        }
    }

    pub fn capture_failed(timestamp: u64, capture_overhead_ms: u64) -> Self {
        Self {
            timestamp,
            capture_overhead_ms,
            snapshot: None,
            code: SampleCode::CaptureFailed,
        }
    }
}

/// One contiguous stall of the target context.
///
/// `end_time` is set once the stall resolved; `last_known_time` is set instead while it is
/// still open, or when the process went down mid-stall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub last_known_time: Option<u64>,
    pub samples: Option<Vec<Sample>>,
    pub code: IntervalCode,
}

impl Interval {
    pub fn open(start_time: u64) -> Self {
        Self {
            start_time,
            end_time: None,
            last_known_time: None,
            samples: Some(Vec::new()),
            code: IntervalCode::Default,
        }
    }

    /// `end_time - start_time`, falling back to `last_known_time`. `None` means unknown.
    pub fn duration(&self) -> Option<u64> {
        self.end_time
            .or(self.last_known_time)
            .map(|end| end.saturating_sub(self.start_time))
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn has_samples(&self) -> bool {
        self.samples.is_some() && self.code != IntervalCode::SamplesCleared
    }

    pub fn sample_count(&self) -> usize {
        self.samples.as_ref().map_or(0, Vec::len)
    }

    /// Drops the samples but keeps start/end/last-known so occurrence and duration survive.
    pub fn clear_samples(&mut self) {
        self.samples = None;
        self.code = IntervalCode::SamplesCleared;
    }

    /// A copy of this interval as seen at `now_ms`. Open intervals get `last_known_time`.
    pub fn snapshot_at(&self, now_ms: u64) -> Interval {
        let mut copy = self.clone();
        if copy.end_time.is_none() {
            copy.last_known_time = Some(now_ms);
        }
        copy
    }

    /// Closes the interval, discarding samples stamped outside `[start_time, end_time]`.
    pub(crate) fn close(&mut self, end_time: u64) {
        self.end_time = Some(end_time);
        self.last_known_time = None;
        let start = self.start_time;
        if let Some(samples) = self.samples.as_mut() {
            samples.retain(|s| (start..=end_time).contains(&s.timestamp));
        }
    }
}
