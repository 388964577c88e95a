#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to load watchdog config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("target thread is not registered for stack capture")]
    TargetNotRegistered,

    #[error("failed to signal target thread: errno={0}")]
    Signal(i32),

    #[error("target thread did not answer the capture signal within {0}ms")]
    Timeout(u64),

    #[error("stack capture is not supported on this platform")]
    Unsupported,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PostError {
    #[error("target queue is closed")]
    Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum WatchdogError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("watchdog is already running")]
    AlreadyRunning,

    #[error("failed to spawn monitor thread: {0}")]
    SpawnMonitor(#[source] std::io::Error),

    #[error("watchdog was frozen by a crash")]
    Crashed,
}
