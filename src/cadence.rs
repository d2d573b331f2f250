use std::thread;
use std::time;

/// Fixed-interval schedule for control cycle starts.
///
/// The next deadline is always derived from the previous deadline, never from the time a cycle
/// happened to finish, so processing time does not accumulate as drift. A cycle which overruns its
/// deadline is followed immediately by the next one, and the schedule is re-anchored on that
/// cycle's start; missed deadlines are not replayed.
pub struct Cadence {
    interval: time::Duration,
    next_deadline: time::Instant,
}

impl Cadence {
    /// Creates a schedule whose first cycle starts at `start`.
    pub fn new(start: time::Instant, interval: time::Duration) -> Self {
        Self {
            interval,
            next_deadline: start + interval,
        }
    }

    pub fn interval(&self) -> time::Duration {
        self.interval
    }

    /// Start time of the next cycle, assuming the current one does not overrun.
    pub fn next_deadline(&self) -> time::Instant {
        self.next_deadline
    }

    /// Advances the schedule by one cycle and returns how long to sleep, measured from `now`,
    /// before the next cycle may start.
    pub fn advance(&mut self, now: time::Instant) -> time::Duration {
        if now < self.next_deadline {
            let remaining = self.next_deadline - now;
            self.next_deadline += self.interval;
            remaining
        } else {
            self.next_deadline = now + self.interval;
            time::Duration::ZERO
        }
    }

    /// Sleeps until the next cycle boundary.
    pub fn wait(&mut self) {
        let delay = self.advance(time::Instant::now());

        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: time::Duration = time::Duration::from_millis(20);

    // Runs cycles with the given processing times and returns the start time of each cycle,
    // assuming sleeps are exact.
    fn simulate(start: time::Instant, processing_ms: &[u64]) -> Vec<time::Instant> {
        let mut cadence = Cadence::new(start, INTERVAL);
        let mut cycle_start = start;
        let mut starts = vec![cycle_start];

        for &ms in processing_ms {
            let now = cycle_start + time::Duration::from_millis(ms);
            let sleep = cadence.advance(now);
            cycle_start = now + sleep;
            starts.push(cycle_start);
        }

        starts
    }

    #[test]
    fn no_drift() {
        let t0 = time::Instant::now();

        let starts = simulate(t0, &[1, 7, 19, 0, 13, 5, 18, 2]);

        for (k, &start) in starts.iter().enumerate() {
            assert_eq!(start, t0 + INTERVAL * k as u32);
        }
    }

    #[test]
    fn overrun_fires_immediately_without_burst() {
        let t0 = time::Instant::now();

        // The second cycle takes three and a half intervals
        let starts = simulate(t0, &[5, 70, 5, 5, 5]);

        assert_eq!(starts[1], t0 + INTERVAL);
        // Next cycle begins as soon as the slow one completes
        assert_eq!(starts[2], starts[1] + time::Duration::from_millis(70));
        // Regular spacing resumes from there, with no back-to-back catch-up cycles
        for k in 3..starts.len() {
            assert_eq!(starts[k] - starts[k - 1], INTERVAL);
        }
    }

    #[test]
    fn deadline_advances_by_interval() {
        let t0 = time::Instant::now();
        let mut cadence = Cadence::new(t0, INTERVAL);

        assert_eq!(cadence.interval(), INTERVAL);
        assert_eq!(cadence.next_deadline(), t0 + INTERVAL);

        let sleep = cadence.advance(t0 + time::Duration::from_millis(4));
        assert_eq!(sleep, time::Duration::from_millis(16));
        assert_eq!(cadence.next_deadline(), t0 + INTERVAL * 2);
    }

    #[test]
    fn wait_sleeps_until_deadline() {
        let t0 = time::Instant::now();
        let mut cadence = Cadence::new(t0, INTERVAL);

        cadence.wait();

        assert!(time::Instant::now() >= t0 + INTERVAL);
    }
}
