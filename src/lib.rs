pub mod clock;
pub mod detector;
pub mod error;
pub mod event;
pub mod interval;
pub mod probe;
pub mod sampler;
pub mod settings;
pub mod stack;
pub mod state;
pub mod watchdog;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CaptureError, ConfigError, PostError, WatchdogError};
pub use event::{BlockageEvent, BlockageListener};
pub use interval::{Frame, Interval, IntervalCode, Sample, SampleCode, ThreadSnapshot, ThreadState};
pub use probe::{Job, TargetQueue};
pub use settings::WatchdogConfig;
pub use stack::StackSource;
pub use watchdog::{Watchdog, WatchdogBuilder};
