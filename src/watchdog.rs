//! Update-pending watchdog. See spec.md §4.4 "A watchdog in A arms a
//! `T_UPDATE_PENDING` (5 s) timer...".

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const T_UPDATE_PENDING: Duration = Duration::from_secs(5);

/// Arms on a back-end's `update_pending` false→true transition, disarms on
/// the reverse transition, and logs a warning (then latches the external
/// property false) if it fires while still pending.
pub struct Watchdog {
    backend_name: &'static str,
    handle: Option<JoinHandle<()>>,
    fired: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Watchdog {
    pub fn new(backend_name: &'static str) -> Self {
        Self {
            backend_name,
            handle: None,
            fired: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Call on every cycle with the back-end's current `update_pending()`.
    /// `was_pending` is this watchdog's previous observation, used to
    /// detect the edge.
    pub fn observe(&mut self, was_pending: bool, is_pending: bool) {
        if !was_pending && is_pending {
            self.arm();
        } else if was_pending && !is_pending {
            self.disarm();
        }
    }

    fn arm(&mut self) {
        self.disarm();
        self.fired.store(false, std::sync::atomic::Ordering::SeqCst);
        let fired = self.fired.clone();
        let name = self.backend_name;
        let deadline = Instant::now() + T_UPDATE_PENDING;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fired.store(true, std::sync::atomic::Ordering::SeqCst);
            tracing::warn!(backend = name, "update-pending watchdog expired; back-end deemed misbehaving");
        }));
    }

    fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether the timer has expired while the back-end was still pending.
    /// Callers latch the external `update-pending` property false once
    /// this is true, regardless of what the back-end itself still reports.
    pub fn expired(&self) -> bool {
        self.fired.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_after_t_update_pending() {
        let mut wd = Watchdog::new("test-backend");
        wd.observe(false, true);
        assert!(!wd.expired());
        tokio::time::advance(T_UPDATE_PENDING + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert!(wd.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn disarming_before_expiry_prevents_warning() {
        let mut wd = Watchdog::new("test-backend");
        wd.observe(false, true);
        tokio::time::advance(Duration::from_secs(1)).await;
        wd.observe(true, false);
        tokio::time::advance(T_UPDATE_PENDING).await;
        tokio::task::yield_now().await;
        assert!(!wd.expired());
    }
}
