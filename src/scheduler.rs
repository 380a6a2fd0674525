//! Push coalescing.
//!
//! A burst of rapid edits must become one commit+push cycle, not one per
//! event. [`PushTimer`] is a restartable countdown over a monotonic clock:
//! arming while idle starts it, arming while armed rewinds the deadline to
//! the full duration (so a continuously modified file is never pushed
//! mid-edit, at the cost of unbounded delay under continuous activity), and
//! expiry wakes the flush consumer exactly once.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep};

use crate::{debug_event, log_event};

/// Restartable push deadline. Idle -> Armed on the first change, Armed ->
/// Armed on every further change (full rewind), Armed -> Idle on expiry or
/// shutdown.
pub struct PushTimer {
    duration: Duration,
    tick: Duration,
    expire_tx: mpsc::Sender<()>,
    state: Arc<Mutex<TimerState>>,
}

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    armed: bool,
    shutdown: bool,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl PushTimer {
    /// `expire_tx` receives one message per completed countdown.
    pub fn new(duration: Duration, tick: Duration, expire_tx: mpsc::Sender<()>) -> Self {
        Self {
            duration,
            tick,
            expire_tx,
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    /// Start the countdown, or rewind it to the full duration when already
    /// running. Never creates a second concurrent countdown.
    pub fn arm(&self) {
        let mut st = self.state.lock();
        if st.shutdown {
            return;
        }
        st.deadline = Some(Instant::now() + self.duration);
        if st.armed {
            debug_event!(
                "timer",
                "reset",
                "{}s until push",
                self.duration.as_secs()
            );
            return;
        }
        st.armed = true;
        log_event!(
            "timer",
            "armed",
            "{}s until push (if nothing else changes)",
            self.duration.as_secs()
        );
        st.task = Some(tokio::spawn(countdown(
            Arc::clone(&self.state),
            self.tick,
            self.expire_tx.clone(),
        )));
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Time left until expiry, when armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.state
            .lock()
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Stop the countdown without firing. Idempotent.
    pub fn shutdown(&self) {
        let mut st = self.state.lock();
        st.shutdown = true;
        st.armed = false;
        st.deadline = None;
        if let Some(task) = st.task.take() {
            task.abort();
        }
    }
}

async fn countdown(state: Arc<Mutex<TimerState>>, tick: Duration, expire_tx: mpsc::Sender<()>) {
    loop {
        sleep(tick).await;
        let fire = {
            let mut st = state.lock();
            if st.shutdown {
                return;
            }
            let Some(deadline) = st.deadline else {
                st.armed = false;
                return;
            };
            let now = Instant::now();
            if now >= deadline {
                st.deadline = None;
                st.armed = false;
                st.task = None;
                true
            } else {
                debug_event!(
                    "timer",
                    "tick",
                    "{}s until push",
                    deadline.duration_since(now).as_secs()
                );
                false
            }
        };
        if fire {
            // shutdown may have raced the decision above
            if state.lock().shutdown {
                return;
            }
            let _ = expire_tx.send(()).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(duration_secs: u64) -> (PushTimer, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(4);
        let timer = PushTimer::new(
            Duration::from_secs(duration_secs),
            Duration::from_secs(1),
            tx,
        );
        (timer, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn expires_once_after_the_full_duration() {
        let (timer, mut rx) = timer(5);
        let start = Instant::now();

        timer.arm();
        assert!(timer.is_armed());

        rx.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5), "fired at {elapsed:?}");
        assert!(elapsed < Duration::from_secs(7), "fired at {elapsed:?}");
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_rewinds_the_deadline() {
        let (timer, mut rx) = timer(5);
        let start = Instant::now();

        timer.arm();
        tokio::time::advance(Duration::from_secs(3)).await;
        timer.arm(); // at t=3, deadline moves to t=8

        rx.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(8), "fired at {elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "fired at {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn double_arm_fires_a_single_expiry() {
        let (timer, mut rx) = timer(2);

        timer.arm();
        timer.arm();
        timer.arm();

        rx.recv().await.unwrap();
        // drain any extra countdown; there must be none
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_after_expiry_starts_a_fresh_countdown() {
        let (timer, mut rx) = timer(2);

        timer.arm();
        rx.recv().await.unwrap();
        assert!(!timer.is_armed());

        timer.arm();
        assert!(timer.is_armed());
        rx.recv().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_never_fires() {
        let (timer, mut rx) = timer(2);

        timer.arm();
        timer.shutdown();
        assert!(!timer.is_armed());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        // arming after shutdown stays inert
        timer.arm();
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_tracks_the_deadline() {
        let (timer, _rx) = timer(5);
        assert!(timer.remaining().is_none());

        timer.arm();
        let remaining = timer.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(2)).await;
        let remaining = timer.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(3));
    }
}
