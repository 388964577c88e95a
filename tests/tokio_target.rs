use std::sync::Arc;
use std::time::Duration;

use pulsebeam_watchdog::stack::StaticStackSource;
use pulsebeam_watchdog::{IntervalCode, Watchdog, WatchdogConfig};

fn fast_config() -> WatchdogConfig {
    WatchdogConfig {
        probe_interval_ms: 20,
        blocked_duration_threshold_ms: 200,
        monitor_timeout_ms: 10_000,
        ..WatchdogConfig::default()
    }
}

#[inline(never)]
fn blocking_work(duration: Duration) {
    std::thread::sleep(duration);
}

#[tokio::test(flavor = "current_thread")]
async fn detects_a_blocked_runtime() {
    let watchdog = Watchdog::builder(
        Arc::new(tokio::runtime::Handle::current()),
        Arc::new(StaticStackSource::new("tokio-runtime", &["blocking_work"])),
    )
    .with_config(fast_config())
    .build()
    .unwrap();
    watchdog.start().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(watchdog.state().has_target_responded());
    assert!(watchdog.captured_intervals().is_empty());

    // the test body runs on the only runtime thread, so this blocks the target
    blocking_work(Duration::from_millis(800));
    tokio::time::sleep(Duration::from_millis(300)).await;

    watchdog.on_background();
    let intervals = watchdog.captured_intervals();
    assert_eq!(intervals.len(), 1);
    let interval = &intervals[0];
    assert!(interval.end_time.is_some());
    assert!(interval.duration().unwrap() >= 600);
    assert_eq!(interval.code, IntervalCode::Default);
    assert!(interval.sample_count() > 0);
}

#[tokio::test(flavor = "current_thread")]
async fn background_stops_detection() {
    let watchdog = Watchdog::builder(
        Arc::new(tokio::runtime::Handle::current()),
        Arc::new(StaticStackSource::new("tokio-runtime", &[])),
    )
    .with_config(fast_config())
    .build()
    .unwrap();
    watchdog.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    watchdog.on_background();
    assert!(!watchdog.is_running());
    blocking_work(Duration::from_millis(500));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(watchdog.captured_intervals().is_empty());

    watchdog.on_foreground().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(watchdog.is_running());
    assert!(watchdog.captured_intervals().is_empty());
    watchdog.on_background();
}
