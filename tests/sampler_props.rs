use std::sync::Arc;

use proptest::prelude::*;
use pulsebeam_watchdog::sampler::{SamplerLimits, StacktraceSampler};
use pulsebeam_watchdog::stack::StaticStackSource;
use pulsebeam_watchdog::{
    BlockageEvent, BlockageListener, Clock, IntervalCode, ManualClock, SampleCode,
    WatchdogConfig,
};

fn sampler(limits: SamplerLimits) -> (Arc<ManualClock>, StacktraceSampler) {
    let clock = ManualClock::new(0);
    let source = Arc::new(StaticStackSource::new("main", &["a", "b", "c"]));
    (clock.clone(), StacktraceSampler::new(limits, clock, source))
}

fn limits(per_session: usize, per_interval: usize) -> SamplerLimits {
    SamplerLimits {
        max_intervals_per_session: per_session,
        max_stacktraces_per_interval: per_interval,
        ..SamplerLimits::from(&WatchdogConfig::default())
    }
}

proptest! {
    #[test]
    fn retains_exactly_the_longest(
        durations in prop::collection::vec(1u64..50_000, 1..40),
        cap in 1usize..10,
    ) {
        let (clock, sampler) = sampler(limits(cap, 80));
        for &duration in &durations {
            let start = clock.now_ms();
            sampler.on_blockage_event(BlockageEvent::Blocked { start_time: start });
            sampler.on_blockage_event(BlockageEvent::BlockedInterval { timestamp: start });
            clock.tick(duration);
            sampler.on_blockage_event(BlockageEvent::Unblocked { end_time: clock.now_ms() });
            clock.tick(10);
        }

        let intervals = sampler.captured_intervals();
        prop_assert_eq!(intervals.len(), durations.len());

        let retained: Vec<u64> = intervals
            .iter()
            .filter(|i| i.samples.is_some())
            .map(|i| i.duration().unwrap())
            .collect();
        prop_assert_eq!(retained.len(), cap.min(durations.len()));

        let mut sorted = durations.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        let mut expected: Vec<u64> = sorted.into_iter().take(cap).collect();
        let mut got = retained.clone();
        expected.sort_unstable();
        got.sort_unstable();
        prop_assert_eq!(got, expected);

        for interval in intervals.iter().filter(|i| i.samples.is_none()) {
            prop_assert_eq!(interval.code, IntervalCode::SamplesCleared);
            prop_assert!(interval.end_time.is_some());
        }
    }

    #[test]
    fn samples_past_the_cap_carry_no_stack(n in 0usize..200, cap in 1usize..100) {
        let (clock, sampler) = sampler(limits(5, cap));
        sampler.on_blockage_event(BlockageEvent::Blocked { start_time: 0 });
        for _ in 0..n {
            let ts = clock.tick(100);
            sampler.on_blockage_event(BlockageEvent::BlockedInterval { timestamp: ts });
        }
        sampler.on_blockage_event(BlockageEvent::Unblocked { end_time: clock.tick(100) });

        let samples = sampler.captured_intervals()[0].samples.clone().unwrap();
        prop_assert_eq!(samples.len(), n);
        let limited = samples
            .iter()
            .filter(|s| s.code == SampleCode::SampleLimitReached && s.snapshot.is_none())
            .count();
        prop_assert_eq!(limited, n.saturating_sub(cap));
    }

    #[test]
    fn never_tracks_more_than_the_hard_cap(stalls in 0usize..250) {
        let (clock, sampler) = sampler(limits(5, 80));
        for _ in 0..stalls {
            sampler.on_blockage_event(BlockageEvent::Blocked { start_time: clock.now_ms() });
            sampler.on_blockage_event(BlockageEvent::Unblocked { end_time: clock.tick(1_500) });
        }
        prop_assert_eq!(sampler.captured_intervals().len(), stalls.min(100));
    }
}
