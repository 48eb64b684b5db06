//! Cancellable one-shot timers.
//!
//! A [`ScheduledTask`] is owned by exactly one component, and only that component cancels or
//! re-arms it. Scheduling again replaces the pending timer, which gives trailing-debounce
//! semantics for free.
//!
//! Once the delay elapses the action is spawned on its own task. From then on
//! [`ScheduledTask::cancel`] returns `false` and cannot stop it, even if the action has not
//! started running yet, so actions must tolerate running after a late cancel. Owners that
//! must not be touched after teardown check their own closed flag inside the action.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

/// A one-shot timer that runs an action after a delay unless cancelled first.
///
/// Once the delay has elapsed the action is detached from the timer: cancelling only ever
/// prevents actions that have not fired yet.
#[derive(Debug)]
pub struct ScheduledTask {
    label: &'static str,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    /// Creates an idle timer. `label` is used in log output.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            pending: Mutex::new(None),
        }
    }

    /// Runs `action` after `delay`, replacing any timer that has not fired yet.
    pub fn schedule<F, Fut>(&self, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = self.label;
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            log::debug!("Timer '{}' fired after {:?}", label, delay);
            tokio::spawn(action());
        });
        if let Some(previous) = self.slot().replace(timer) {
            previous.abort();
        }
    }

    /// Cancels the pending timer. Returns `true` if a timer was pending.
    pub fn cancel(&self) -> bool {
        match self.slot().take() {
            Some(timer) => {
                let was_pending = !timer.is_finished();
                timer.abort();
                if was_pending {
                    log::debug!("Timer '{}' cancelled", self.label);
                }
                was_pending
            }
            None => false,
        }
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.slot().as_ref().is_some_and(|timer| !timer.is_finished())
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(timer) = self.slot().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_action(counter: &Arc<AtomicU32>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = ScheduledTask::new("test");

        timer.schedule(Duration::from_millis(100), counting_action(&fired));
        assert!(timer.is_pending());

        sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_restarts_the_window() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = ScheduledTask::new("test");

        for _ in 0..5 {
            timer.schedule(Duration::from_millis(100), counting_action(&fired));
            sleep(Duration::from_millis(60)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = ScheduledTask::new("test");

        timer.schedule(Duration::from_millis(100), counting_action(&fired));
        assert!(timer.cancel());
        assert!(!timer.cancel());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_firing_has_no_effect() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = ScheduledTask::new("test");

        timer.schedule(Duration::from_millis(100), counting_action(&fired));
        sleep(Duration::from_millis(150)).await;

        assert!(!timer.cancel());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_owner_cancels_the_timer() {
        let fired = Arc::new(AtomicU32::new(0));
        {
            let timer = ScheduledTask::new("test");
            timer.schedule(Duration::from_millis(100), counting_action(&fired));
        }
        sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
