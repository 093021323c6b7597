//! Reconnection grace-period timers.
//!
//! When a session loses its attached connection it enters the detached
//! state and a grace timer starts. If no connection reattaches before the
//! timer fires, the session id is reported on the expiry channel and the
//! registry closes it. Reattaching cancels the timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::SessionId;

/// A running grace timer for one detached session.
///
/// Dropping the timer cancels it, so replacing the slot's timer on
/// reattach is sufficient to stop the countdown.
#[derive(Debug)]
pub struct GraceTimer {
    token: CancellationToken,
}

impl GraceTimer {
    /// Starts a grace timer. When `period` elapses without cancellation,
    /// the session id is sent on `expired_tx`.
    ///
    /// A zero period reports expiry immediately.
    pub fn start(
        session_id: SessionId,
        period: Duration,
        expired_tx: mpsc::UnboundedSender<SessionId>,
    ) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    tracing::info!(session_id = %session_id, "Grace period expired");
                    let _ = expired_tx.send(session_id);
                }
                _ = child.cancelled() => {
                    tracing::debug!(session_id = %session_id, "Grace timer cancelled");
                }
            }
        });

        Self { token }
    }

    /// Cancels the timer.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for GraceTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = GraceTimer::start("sess-a".to_string(), Duration::from_secs(60), tx);

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(rx.recv().await, Some("sess-a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = GraceTimer::start("sess-b".to_string(), Duration::from_secs(60), tx);

        tokio::time::sleep(Duration::from_secs(30)).await;
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(120)).await;

        // Sender was dropped without sending
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let _timer = GraceTimer::start("sess-c".to_string(), Duration::from_secs(60), tx);
        }

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_fires_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = GraceTimer::start("sess-d".to_string(), Duration::ZERO, tx);

        assert_eq!(rx.recv().await, Some("sess-d".to_string()));
    }
}
