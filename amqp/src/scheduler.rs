//! Timer scheduling for token renewal.
//!
//! Components never own a thread per timer. They schedule work through the
//! [`Scheduler`] trait and keep the returned [`ScheduledTask`] to cancel it.
//! Cancellation is cooperative: a cancelled task stops at its next await
//! point and never fires again.

use crate::config::ConnectionOptions;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Work run on every tick of a periodic schedule.
pub type PeriodicTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to scheduled work. Dropping it does not cancel; call
/// [`ScheduledTask::cancel`].
#[derive(Clone, Debug)]
pub struct ScheduledTask {
    cancel_token: CancellationToken,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Periodic timer source used for token renewal.
pub trait Scheduler: Send + Sync {
    /// Runs `task` every `period`, first after one full period. Ticks never
    /// overlap: a slow run delays the next tick.
    fn schedule_periodic(&self, period: Duration, task: PeriodicTask) -> ScheduledTask;
}

/// Tokio-backed [`Scheduler`] with a bound on concurrently running callbacks.
///
/// Dropping the scheduler cancels everything it scheduled.
pub struct TokioScheduler {
    semaphore: Arc<Semaphore>,
    cancel_token: CancellationToken,
}

impl TokioScheduler {
    pub fn new(max_concurrent: usize) -> TokioScheduler {
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let cancel_token = CancellationToken::new();

        TokioScheduler {
            semaphore,
            cancel_token,
        }
    }

    /// Scheduler bounded by `max_concurrent_timers`.
    pub fn from_options(options: &ConnectionOptions) -> TokioScheduler {
        Self::new(options.max_concurrent_timers)
    }

    /// Permits not currently held by a running callback.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn shutdown(&self) {
        self.semaphore.close();
        self.cancel_token.cancel();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_periodic(&self, period: Duration, task: PeriodicTask) -> ScheduledTask {
        let cancel_token = self.cancel_token.child_token();
        let token = cancel_token.clone();
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let run = async {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return false;
                    };
                    task().await;
                    true
                };

                let keep_going = tokio::select! {
                    biased;
                    () = token.cancelled() => false,
                    ran = run => ran,
                };
                if !keep_going {
                    break;
                }
            }
            log::debug!("Periodic task stopped");
        });

        ScheduledTask { cancel_token }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
