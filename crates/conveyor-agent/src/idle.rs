use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Tracks how many workers in the pool are idle, and for how long all of
/// them have been idle at once. Drives disconnect-after-idle-timeout.
#[derive(Debug)]
pub struct IdleMonitor {
    total: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    idle: HashSet<usize>,
    all_idle_since: Option<Instant>,
}

impl IdleMonitor {
    pub fn new(total: usize) -> Self {
        Self {
            total: total.max(1),
            inner: Mutex::new(Inner {
                idle: HashSet::new(),
                all_idle_since: None,
            }),
        }
    }

    pub fn set_idle(&self, worker: usize) {
        let mut inner = self.lock();
        inner.idle.insert(worker);
        if inner.idle.len() == self.total && inner.all_idle_since.is_none() {
            inner.all_idle_since = Some(Instant::now());
        }
    }

    pub fn set_busy(&self, worker: usize) {
        let mut inner = self.lock();
        inner.idle.remove(&worker);
        inner.all_idle_since = None;
    }

    /// How long the whole pool has been idle, if it is.
    pub fn all_idle_for(&self) -> Option<Duration> {
        self.lock().all_idle_since.map(|since| since.elapsed())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn all_idle_clock_starts_when_the_last_worker_goes_idle() {
        let monitor = IdleMonitor::new(2);
        monitor.set_idle(0);
        assert!(monitor.all_idle_for().is_none());

        monitor.set_idle(1);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(monitor.all_idle_for().unwrap() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn any_busy_worker_resets_the_clock() {
        let monitor = IdleMonitor::new(2);
        monitor.set_idle(0);
        monitor.set_idle(1);
        tokio::time::advance(Duration::from_secs(10)).await;

        monitor.set_busy(1);
        assert!(monitor.all_idle_for().is_none());

        monitor.set_idle(1);
        tokio::time::advance(Duration::from_secs(1)).await;
        let idle_for = monitor.all_idle_for().unwrap();
        assert!(idle_for >= Duration::from_secs(1) && idle_for < Duration::from_secs(5));
    }

    #[test]
    fn idle_marks_are_idempotent() {
        let monitor = IdleMonitor::new(1);
        monitor.set_idle(0);
        monitor.set_idle(0);
        assert!(monitor.all_idle_for().is_some());
    }
}
