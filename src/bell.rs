//! Ship's bell - the periodic timer
//!
//! Knows nothing about sampling; it only says when a tick is due and when
//! to stop. Missed ticks are skipped rather than bunched up.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// Periodic ticker that can be silenced from another task
pub struct Bell {
    interval: Interval,
    stop: watch::Receiver<bool>,
}

/// Stops a [`Bell`]; cheap to clone
#[derive(Clone)]
pub struct BellRope {
    stop: watch::Sender<bool>,
}

impl BellRope {
    pub fn silence(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_silenced(&self) -> bool {
        *self.stop.borrow()
    }
}

impl Bell {
    pub fn new(period: Duration) -> (Self, BellRope) {
        let (tx, rx) = watch::channel(false);
        let mut interval = interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        (Self { interval, stop: rx }, BellRope { stop: tx })
    }

    /// Wait for the next tick; `false` once silenced
    ///
    /// The first tick fires immediately.
    pub async fn tick(&mut self) -> bool {
        if *self.stop.borrow() {
            return false;
        }
        tokio::select! {
            _ = self.interval.tick() => !*self.stop.borrow(),
            changed = self.stop.changed() => {
                // A dropped rope means nobody can stop us; keep ringing
                match changed {
                    Ok(()) => !*self.stop.borrow(),
                    Err(_) => {
                        self.interval.tick().await;
                        true
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_period() {
        let (mut bell, _rope) = Bell::new(Duration::from_secs(10));
        let start = Instant::now();
        assert!(bell.tick().await);
        assert!(bell.tick().await);
        assert!(bell.tick().await);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_stops_pending_tick() {
        let (mut bell, rope) = Bell::new(Duration::from_secs(3600));
        assert!(bell.tick().await);

        let stopper = rope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.silence();
        });

        let start = Instant::now();
        assert!(!bell.tick().await);
        assert!(start.elapsed() < Duration::from_secs(3600));
        assert!(rope.is_silenced());
        assert!(!bell.tick().await);
    }
}
