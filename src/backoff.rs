use rand::random;
use std::{cmp::min, thread::sleep, time::Duration};

/// Randomized exponential backoff between detection retries.
pub(crate) struct Backoff {
    limit: Duration,
    max_limit: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Backoff { limit: min, max_limit: max }
    }

    /// Defaults tuned for retrying a graph walk, not for lock contention.
    pub fn for_retries() -> Self {
        Backoff::new(Duration::from_micros(50), Duration::from_millis(2))
    }

    pub fn backoff(&mut self) {
        let delay = random_duration(self.limit);
        self.limit = min(2 * self.limit, self.max_limit);
        sleep(delay);
    }
}

fn random_duration(limit: Duration) -> Duration {
    let nanos = random::<u64>() % limit.as_nanos() as u64;
    Duration::from_nanos(nanos)
}
