//! Throughput tracker tests driven by explicit timestamps, plus a few
//! checks against the live sampler thread.

#[cfg(test)]
mod throughput_tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::Duration;

    use crate::metrics::{MetricsError, ThroughputTracker};

    const START: u64 = 1_000_000;

    fn tracker(window: usize, counter: &Arc<AtomicU64>) -> ThroughputTracker {
        let counter = Arc::clone(counter);
        ThroughputTracker::new(
            window,
            Duration::from_millis(5),
            move || counter.load(Ordering::SeqCst),
            START,
        )
        .unwrap()
    }

    #[test]
    fn constructor_validates_inputs() {
        assert!(matches!(
            ThroughputTracker::new(1, Duration::from_secs(1), || 0, START),
            Err(MetricsError::InvalidWindow(1))
        ));
        assert!(matches!(
            ThroughputTracker::new(5, Duration::ZERO, || 0, START),
            Err(MetricsError::InvalidInterval)
        ));
    }

    #[test]
    fn zero_throughput_before_any_sample() {
        let counter = Arc::new(AtomicU64::new(0));
        let t = tracker(3, &counter);
        assert_eq!(t.current_throughput(), 0.0);
        assert_eq!(t.window_size_ms(), 0);
    }

    #[test]
    fn throughput_before_wrapping() {
        let counter = Arc::new(AtomicU64::new(0));
        let t = tracker(3, &counter);

        counter.store(100, Ordering::SeqCst);
        t.sample_at(START + 1000);
        assert_eq!(t.sample_slot(1).unwrap().value, 100);
        assert_eq!(t.current_throughput(), 100.0);

        // Window now spans 2000ms from the seed sample.
        counter.store(300, Ordering::SeqCst);
        t.sample_at(START + 2000);
        assert_eq!(t.current_throughput(), 150.0);
    }

    #[test]
    fn steady_rate_after_many_wraps() {
        let counter = Arc::new(AtomicU64::new(0));
        let t = tracker(3, &counter);

        let mut now = START;
        for i in 0..=1000u64 {
            now += 1000;
            counter.store(i, Ordering::SeqCst);
            t.sample_at(now);
        }
        // Retained: 998, 999, 1000 one second apart.
        assert_eq!(t.current_throughput(), 1.0);
        assert_eq!(t.window_size_ms(), 2000);
    }

    #[test]
    fn non_increasing_timestamps_are_insufficient_data() {
        let counter = Arc::new(AtomicU64::new(50));
        let t = tracker(4, &counter);
        t.sample_at(START);
        assert_eq!(t.current_throughput(), 0.0);
    }

    #[test]
    fn reset_clears_state() {
        let counter = Arc::new(AtomicU64::new(0));
        let t = tracker(3, &counter);
        counter.store(100, Ordering::SeqCst);
        t.sample_at(START + 1000);
        t.sample_at(START + 2000);
        assert!(t.current_throughput() > 0.0);

        let reset_time = 5_000_000;
        t.reset(reset_time).unwrap();
        assert_eq!(t.current_throughput(), 0.0);
        assert_eq!(t.window_size_ms(), 0);

        // The seed carries the cumulative count at the reset.
        let seed = t.sample_slot(0).unwrap();
        assert_eq!(seed.time, reset_time);
        assert_eq!(seed.value, 100);

        counter.store(300, Ordering::SeqCst);
        t.sample_at(reset_time + 1000);
        assert_eq!(t.current_throughput(), 200.0);
    }

    #[test]
    fn reset_does_not_replay_earlier_operations() {
        let counter = Arc::new(AtomicU64::new(0));
        let t = tracker(4, &counter);
        counter.store(1000, Ordering::SeqCst);
        t.sample_at(START + 1000);
        assert_eq!(t.current_throughput(), 1000.0);

        let reset_time = START + 2000;
        t.reset(reset_time).unwrap();
        t.sample_at(reset_time + 1000);
        assert_eq!(t.current_throughput(), 0.0);

        counter.store(1050, Ordering::SeqCst);
        t.sample_at(reset_time + 2000);
        assert_eq!(t.current_throughput(), 25.0);
    }

    #[test]
    fn start_is_idempotent() {
        let counter = Arc::new(AtomicU64::new(0));
        let t = tracker(3, &counter);
        t.start().unwrap();
        t.start().unwrap();
        t.stop();
    }

    #[test]
    fn start_after_stop_fails_until_reset() {
        let counter = Arc::new(AtomicU64::new(0));
        let t = tracker(3, &counter);
        t.start().unwrap();
        t.stop();
        assert!(matches!(t.start(), Err(MetricsError::TrackerStopped)));

        t.reset(START).unwrap();
        t.start().unwrap();
        t.stop();
    }

    #[test]
    fn live_sampler_fills_window() {
        let counter = Arc::new(AtomicU64::new(0));
        let t = ThroughputTracker::new(
            5,
            Duration::from_millis(5),
            {
                let counter = Arc::clone(&counter);
                move || counter.load(Ordering::SeqCst)
            },
            crate::metrics::now_millis(),
        )
        .unwrap();
        t.start().unwrap();

        for step in 1..=10 {
            counter.store(step * 100, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(50));

        assert!(t.window_size_ms() > 0);
        assert!(t.current_throughput() > 0.0);
        t.stop();
    }
}
