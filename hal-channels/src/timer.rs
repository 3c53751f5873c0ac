//! Restartable inactivity countdown.
//!
//! Each timer runs as its own tokio task. Expiry is delivered as a message on
//! an mpsc channel instead of a callback, so the code that reacts to expiry
//! always runs on the receiver's task and can take whatever locks it needs.
//!
//! While a [`TimerHold`] is alive the countdown cannot fire; releasing the
//! last hold restarts the full window.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

struct TimerShared {
    reset: Notify,
    cancel: CancellationToken,
    expired: AtomicBool,
    holds: AtomicUsize,
}

impl TimerShared {
    fn reset(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.reset.notify_one();
        true
    }
}

/// Countdown that fires once if not reset within `window`.
///
/// - `reset()` restarts the countdown; concurrent resets coalesce.
/// - `stop()` cancels permanently; nothing is delivered afterwards.
/// - After firing, the timer is inert: `reset()` has no effect.
///
/// Dropping the timer stops it.
pub struct InactivityTimer {
    window: Duration,
    shared: Arc<TimerShared>,
    started: bool,
}

impl InactivityTimer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            shared: Arc::new(TimerShared {
                reset: Notify::new(),
                cancel: CancellationToken::new(),
                expired: AtomicBool::new(false),
                holds: AtomicUsize::new(0),
            }),
            started: false,
        }
    }

    /// Begin the countdown. When it elapses, `payload` is sent on `expired_tx`.
    /// Starting an already started or stopped timer does nothing.
    pub fn start<T>(&mut self, expired_tx: mpsc::UnboundedSender<T>, payload: T)
    where
        T: Send + 'static,
    {
        if self.started || self.shared.cancel.is_cancelled() {
            return;
        }
        self.started = true;

        let shared = Arc::clone(&self.shared);
        let window = self.window;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shared.cancel.cancelled() => return,
                    () = shared.reset.notified() => continue,
                    () = tokio::time::sleep(window) => {
                        if shared.holds.load(Ordering::SeqCst) == 0 {
                            break;
                        }
                    }
                }
            }

            if shared.cancel.is_cancelled() {
                return;
            }
            shared.expired.store(true, Ordering::SeqCst);
            shared.cancel.cancel();
            let _ = expired_tx.send(payload);
        });
    }

    /// Restart the countdown from the full window.
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// A handle that can reset this timer without access to its owner.
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Keep the timer from firing until the returned hold is dropped.
    pub fn hold(&self) -> TimerHold {
        self.shared.holds.fetch_add(1, Ordering::SeqCst);
        TimerHold {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Cancel the countdown permanently.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// Started and neither stopped nor expired.
    pub fn is_active(&self) -> bool {
        self.started && !self.shared.cancel.is_cancelled()
    }

    pub fn has_expired(&self) -> bool {
        self.shared.expired.load(Ordering::SeqCst)
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Shared reset access to an [`InactivityTimer`].
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Restart the countdown. Returns `false` once the timer stopped or fired.
    pub fn reset(&self) -> bool {
        self.shared.reset()
    }
}

/// Defers expiry while alive. Dropping it restarts the window.
pub struct TimerHold {
    shared: Arc<TimerShared>,
}

impl Drop for TimerHold {
    fn drop(&mut self) {
        // Notify before releasing so a countdown that elapses in between
        // still sees either the hold or the pending reset.
        self.shared.reset();
        self.shared.holds.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for InactivityTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InactivityTimer")
            .field("window", &self.window)
            .field("active", &self.is_active())
            .field("expired", &self.has_expired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::sleep;

    const WINDOW: Duration = Duration::from_secs(10);

    fn started_timer() -> (InactivityTimer, mpsc::UnboundedReceiver<&'static str>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut timer = InactivityTimer::new(WINDOW);
        timer.start(tx, "expired");
        (timer, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_window() {
        let (timer, mut rx) = started_timer();
        assert!(timer.is_active());

        sleep(Duration::from_secs(9)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv(), Ok("expired"));
        assert!(timer.has_expired());
        assert!(!timer.is_active());

        sleep(WINDOW * 3).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_postpones_expiry_by_full_window() {
        let (timer, mut rx) = started_timer();

        sleep(Duration::from_secs(6)).await;
        timer.reset();

        sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv(), Ok("expired"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_resets_keep_timer_alive() {
        let (timer, mut rx) = started_timer();

        for _ in 0..6 {
            sleep(WINDOW / 2).await;
            timer.reset();
        }
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(timer.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_resets_count_once() {
        let (timer, mut rx) = started_timer();

        sleep(Duration::from_secs(5)).await;
        timer.reset();
        timer.reset();
        timer.reset();

        sleep(Duration::from_secs(11)).await;
        assert_eq!(rx.try_recv(), Ok("expired"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_expiry() {
        let (timer, mut rx) = started_timer();

        sleep(Duration::from_secs(9)).await;
        timer.stop();
        assert!(!timer.is_active());

        sleep(WINDOW * 2).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
        assert!(!timer.has_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_after_expiry_is_inert() {
        let (timer, mut rx) = started_timer();

        sleep(WINDOW + Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv(), Ok("expired"));

        timer.reset();
        assert!(!timer.is_active());
        sleep(WINDOW * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_timer() {
        let (timer, mut rx) = started_timer();
        drop(timer);

        sleep(WINDOW * 2).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_defers_expiry_until_released() {
        let (timer, mut rx) = started_timer();
        let hold = timer.hold();

        sleep(WINDOW * 3).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(timer.is_active());

        drop(hold);
        sleep(WINDOW - Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv(), Ok("expired"));
    }

    #[tokio::test(start_paused = true)]
    async fn handle_resets_and_reports_liveness() {
        let (timer, mut rx) = started_timer();
        let handle = timer.handle();

        sleep(Duration::from_secs(8)).await;
        assert!(handle.reset());
        sleep(Duration::from_secs(8)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        timer.stop();
        assert!(!handle.reset());
    }

    #[tokio::test]
    async fn stopped_timer_cannot_start() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = InactivityTimer::new(Duration::from_millis(1));
        timer.stop();
        timer.start(tx, ());
        assert!(!timer.is_active());
        assert!(rx.recv().await.is_none());
    }
}
