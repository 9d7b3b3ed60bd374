use std::fmt;
use std::time::{Duration, Instant};

use tokio::time::{interval, Interval};

use super::SessionError;

/// Tracks hold time for a session and decides when keepalives are due.
/// Keepalives go out at 1/3 of the negotiated hold time.
#[derive(Debug)]
pub(crate) struct HoldTimer {
    pub(crate) hold_time: u16,
    interval: u16,
    timer: Interval,
    last_sent: Instant,
    last_received: Instant,
}

impl HoldTimer {
    pub fn new(hold_time: u16) -> HoldTimer {
        HoldTimer {
            hold_time,
            interval: hold_time / 3,
            timer: interval(Duration::from_millis(100)),
            last_sent: Instant::now(),
            last_received: Instant::now(),
        }
    }

    /// Waits one poll tick, errors if the peer's hold time has lapsed,
    /// otherwise reports whether a keepalive is due. A keepalive is due
    /// once less than 2 keepalive intervals of hold time remain.
    pub async fn should_send_keepalive(&mut self) -> Result<bool, SessionError> {
        self.timer.tick().await;
        if self.is_expired() {
            return Err(SessionError::HoldTimeExpired(self.hold_time));
        }
        Ok(self.remaining() < Duration::from_secs(u64::from(self.interval) * 2))
    }

    pub fn received(&mut self) {
        self.last_received = Instant::now();
    }

    pub fn sent(&mut self) {
        self.last_sent = Instant::now();
    }

    // Hold time left before we owe the peer a keepalive; saturates at 0
    fn remaining(&self) -> Duration {
        Duration::from_secs(u64::from(self.hold_time)).saturating_sub(self.last_sent.elapsed())
    }

    fn is_expired(&self) -> bool {
        self.last_received.elapsed() >= Duration::from_secs(u64::from(self.hold_time))
    }
}

impl fmt::Display for HoldTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}s", self.remaining().as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keepalive_due() {
        let mut ht = HoldTimer::new(30);
        assert_eq!(ht.interval, 10);
        assert!(!ht.is_expired());

        // 5s since last send: plenty of hold time left
        ht.last_sent = Instant::now() - Duration::from_secs(5);
        ht.timer = interval(Duration::from_millis(1));
        assert!(!ht.should_send_keepalive().await.unwrap());

        // 11s since last send: under 2 intervals remain
        ht.last_sent = Instant::now() - Duration::from_secs(11);
        ht.timer = interval(Duration::from_millis(1));
        assert!(ht.should_send_keepalive().await.unwrap());

        ht.sent();
        ht.timer = interval(Duration::from_millis(1));
        assert!(!ht.should_send_keepalive().await.unwrap());
    }

    #[tokio::test]
    async fn test_hold_time_expiry() {
        let mut ht = HoldTimer::new(30);
        ht.last_received = Instant::now() - Duration::from_secs(30);
        ht.timer = interval(Duration::from_millis(1));
        assert!(matches!(
            ht.should_send_keepalive().await,
            Err(SessionError::HoldTimeExpired(30))
        ));
    }
}
