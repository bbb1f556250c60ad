use std::time::{Duration, Instant};

/// Read-lock share accounting for the coordinator's throttle.
///
/// Two stopwatches: wall time since the last reset, and accumulated time the
/// read lock was held since the last reset. When the locked share exceeds
/// the configured ratio, [`lock_share_excess`](Self::lock_share_excess)
/// reports how long the coordinator must sleep to get back under it. Both
/// stopwatches reset after every throttle cycle.
#[derive(Debug)]
pub struct ThrottleGate {
    ratio: f64,
    cores: usize,
    wall_start: Instant,
    locked: Duration,
}

impl ThrottleGate {
    pub fn new(ratio: f64) -> Self {
        Self::with_cores(ratio, num_cpus::get().max(1))
    }

    pub fn with_cores(ratio: f64, cores: usize) -> Self {
        Self {
            ratio,
            cores,
            wall_start: Instant::now(),
            locked: Duration::ZERO,
        }
    }

    /// Core count used by the saturation and backlog axes.
    pub fn cores(&self) -> usize {
        self.cores
    }

    /// Record one read-guard hold.
    pub fn observe_lock(&mut self, held: Duration) {
        self.locked += held;
    }

    /// How much longer the coordinator must stay off the lock so that
    /// `locked / wall <= ratio`. Zero when unthrottled (`ratio >= 1`).
    pub fn lock_share_excess(&self) -> Duration {
        if self.ratio >= 1.0 {
            return Duration::ZERO;
        }
        let expected_wall = self.locked.as_secs_f64() / self.ratio;
        let actual_wall = self.wall_start.elapsed().as_secs_f64();
        if expected_wall > actual_wall {
            Duration::from_secs_f64(expected_wall - actual_wall)
        } else {
            Duration::ZERO
        }
    }

    /// Start a fresh accounting window.
    pub fn reset(&mut self) {
        self.wall_start = Instant::now();
        self.locked = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unthrottled_ratio_never_sleeps() {
        let mut gate = ThrottleGate::with_cores(1.0, 4);
        gate.observe_lock(Duration::from_secs(10));
        assert_eq!(gate.lock_share_excess(), Duration::ZERO);
    }

    #[test]
    fn excess_scales_with_locked_time() {
        let mut gate = ThrottleGate::with_cores(0.5, 4);
        gate.observe_lock(Duration::from_millis(100));
        // Expected wall for 100ms locked at ratio 0.5 is 200ms; almost no
        // wall time has passed yet.
        let excess = gate.lock_share_excess();
        assert!(excess > Duration::from_millis(150), "excess {excess:?}");
        assert!(excess <= Duration::from_millis(200), "excess {excess:?}");
    }

    #[test]
    fn reset_clears_both_stopwatches() {
        let mut gate = ThrottleGate::with_cores(0.1, 4);
        gate.observe_lock(Duration::from_secs(1));
        assert!(gate.lock_share_excess() > Duration::ZERO);
        gate.reset();
        assert_eq!(gate.lock_share_excess(), Duration::ZERO);
    }
}
