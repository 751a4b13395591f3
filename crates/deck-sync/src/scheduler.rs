use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(2000);
pub const FAST_POLL_DELAY: Duration = Duration::from_millis(500);
const MIN_POLL_DELAY: Duration = Duration::from_millis(50);
const MAX_POLL_DELAY: Duration = Duration::from_secs(60);

/// Result of one fetch-and-reconcile cycle as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Reconciled { any_transitional: bool },
    /// The cycle was skipped; nothing about the snapshot is known.
    Skipped,
    /// The owner of the view is gone: the loop ends.
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    default_delay: Duration,
    fast_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            default_delay: DEFAULT_POLL_DELAY,
            fast_delay: FAST_POLL_DELAY,
        }
    }
}

impl PollPolicy {
    /// Delays are clamped so they are never zero and never unbounded.
    pub fn new(default_delay: Duration, fast_delay: Duration) -> Self {
        let default_delay = default_delay.clamp(MIN_POLL_DELAY, MAX_POLL_DELAY);
        Self {
            default_delay,
            fast_delay: fast_delay.clamp(MIN_POLL_DELAY, default_delay),
        }
    }

    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    pub fn fast_delay(&self) -> Duration {
        self.fast_delay
    }

    /// Delay before the next cycle, recomputed after every cycle. Failed
    /// cycles fall back to the default delay.
    pub fn next_delay<E>(&self, outcome: &Result<CycleOutcome, E>) -> Duration {
        match outcome {
            Ok(CycleOutcome::Reconciled {
                any_transitional: true,
            }) => self.fast_delay,
            _ => self.default_delay,
        }
    }
}

/// Owns the single polling task of a view. Starting again aborts the
/// previous task first; dropping the scheduler stops it.
#[derive(Debug)]
pub struct PollScheduler {
    policy: PollPolicy,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl PollScheduler {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            task: None,
            generation: 0,
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Number of times the loop has been (re)started.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Runs `cycle` at once, then again after each computed delay. The next
    /// cycle is scheduled only after the previous one resolved.
    pub fn start<F, Fut, E>(&mut self, mut cycle: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CycleOutcome, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.stop();
        self.generation += 1;
        let policy = self.policy;
        let generation = self.generation;
        self.task = Some(tokio::spawn(async move {
            loop {
                let outcome = cycle().await;
                match &outcome {
                    Ok(CycleOutcome::Detached) => {
                        debug!(event = "poll_loop_detached", generation);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(event = "poll_cycle_failed", generation, error = %err),
                }
                let delay = policy.next_delay(&outcome);
                debug!(
                    event = "poll_cycle_scheduled",
                    generation,
                    delay_ms = delay.as_millis() as u64
                );
                tokio::time::sleep(delay).await;
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[test]
    fn fast_delay_only_while_transitional() {
        let policy = PollPolicy::default();
        let fast: Result<_, String> = Ok(CycleOutcome::Reconciled {
            any_transitional: true,
        });
        let settled: Result<_, String> = Ok(CycleOutcome::Reconciled {
            any_transitional: false,
        });
        let failed: Result<CycleOutcome, String> = Err("timeout".to_string());
        assert_eq!(policy.next_delay(&fast), Duration::from_millis(500));
        assert_eq!(policy.next_delay(&settled), Duration::from_millis(2000));
        assert_eq!(policy.next_delay(&failed), Duration::from_millis(2000));
        let skipped: Result<_, String> = Ok(CycleOutcome::Skipped);
        assert_eq!(policy.next_delay(&skipped), Duration::from_millis(2000));
    }

    #[test]
    fn policy_never_zero_and_fast_never_slower() {
        let policy = PollPolicy::new(Duration::ZERO, Duration::from_secs(10));
        assert!(policy.default_delay() > Duration::ZERO);
        assert!(policy.fast_delay() <= policy.default_delay());
        let policy = PollPolicy::new(Duration::from_secs(3600), Duration::from_millis(1));
        assert_eq!(policy.default_delay(), Duration::from_secs(60));
        assert!(policy.fast_delay() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cycles_follow_the_latest_snapshot() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scheduler = PollScheduler::new(PollPolicy::default());

        let counter = calls.clone();
        scheduler.start(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            async move {
                let _ = tx.send(Instant::now());
                match n {
                    0 | 1 => Ok(CycleOutcome::Reconciled {
                        any_transitional: true,
                    }),
                    2 => Err("connection refused"),
                    _ => Ok(CycleOutcome::Reconciled {
                        any_transitional: false,
                    }),
                }
            }
        });

        let mut stamps = Vec::new();
        for _ in 0..5 {
            stamps.push(rx.recv().await.expect("cycle ran"));
        }
        let gaps: Vec<u128> = stamps
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect();
        assert_eq!(gaps, vec![500, 500, 2000, 2000]);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_previous_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = PollScheduler::new(PollPolicy::default());

        let first = tx.clone();
        scheduler.start(move || {
            let tx = first.clone();
            async move {
                let _ = tx.send("first");
                Ok::<_, String>(CycleOutcome::Skipped)
            }
        });
        assert_eq!(rx.recv().await, Some("first"));

        let second = tx.clone();
        scheduler.start(move || {
            let tx = second.clone();
            async move {
                let _ = tx.send("second");
                Ok::<_, String>(CycleOutcome::Skipped)
            }
        });
        assert_eq!(scheduler.generation(), 2);

        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some("second"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn detached_cycle_ends_the_loop() {
        let mut scheduler = PollScheduler::new(PollPolicy::default());
        scheduler.start(|| async { Ok::<_, String>(CycleOutcome::Detached) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!scheduler.is_running());

        scheduler.start(|| async { Ok::<_, String>(CycleOutcome::Skipped) });
        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
