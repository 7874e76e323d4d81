//! Hashed timing wheel for handshake retries
//!
//! Low resolution on purpose: an item added with duration `d` fires no
//! earlier than `d` and no later than `d + tick`. The wheel stores overlay
//! addresses rather than host handles, so a deleted HostInfo leaves nothing
//! dangling; a stale fire is absorbed by the pending-map lookup.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::host::VpnIp;

pub struct TimerWheel {
    /// Slot the cursor points at
    current: usize,
    wheel: Vec<VecDeque<VpnIp>>,
    /// Items drained from expired slots, handed out one per purge call
    expired: VecDeque<VpnIp>,
    tick: Duration,
    last_tick: Option<Instant>,
}

impl TimerWheel {
    /// A wheel spanning at least `max` with `tick` resolution.
    pub fn new(tick: Duration, max: Duration) -> Self {
        // One slot per tick in the span, one for the cursor position and one
        // of headroom so a `max` item never wraps onto the cursor.
        let span_ticks = max.as_nanos().div_ceil(tick.as_nanos().max(1)) as usize;
        let slots = span_ticks + 2;

        Self {
            current: 0,
            wheel: (0..slots).map(|_| VecDeque::new()).collect(),
            expired: VecDeque::new(),
            tick,
            last_tick: None,
        }
    }

    /// Schedule `vpn_ip` to fire after `duration`, rounded to wheel
    /// resolution.
    pub fn add(&mut self, vpn_ip: VpnIp, duration: Duration) {
        let slot = self.find_slot(duration);
        self.wheel[slot].push_back(vpn_ip);
    }

    fn find_slot(&self, duration: Duration) -> usize {
        let duration = duration.max(self.tick);
        let ticks = (duration.as_nanos() / self.tick.as_nanos().max(1)) as usize;
        // +1 skips the slot the cursor is on; clamp keeps oversized
        // durations from wrapping around
        let ticks = ticks.min(self.wheel.len() - 2);
        (self.current + ticks + 1) % self.wheel.len()
    }

    /// Walk the cursor forward to `now`, draining every slot it passes.
    pub fn advance(&mut self, now: Instant) {
        let Some(mut last) = self.last_tick else {
            self.last_tick = Some(now);
            return;
        };

        while now.saturating_duration_since(last) >= self.tick {
            last += self.tick;
            self.current = (self.current + 1) % self.wheel.len();
            let drained = std::mem::take(&mut self.wheel[self.current]);
            self.expired.extend(drained);
        }
        self.last_tick = Some(last);
    }

    /// One expired item per call; None when the current batch is drained.
    pub fn purge(&mut self) -> Option<VpnIp> {
        self.expired.pop_front()
    }

    /// Scheduled plus expired-but-unpurged items.
    pub fn len(&self) -> usize {
        self.wheel.iter().map(VecDeque::len).sum::<usize>() + self.expired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(100);

    fn vpn(n: u32) -> VpnIp {
        VpnIp::from(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_within_one_tick() {
        let mut wheel = TimerWheel::new(TICK, Duration::from_secs(2));
        let start = Instant::now();
        wheel.advance(start);

        wheel.add(vpn(1), Duration::from_millis(250));

        // not yet at 200ms
        wheel.advance(start + Duration::from_millis(200));
        assert_eq!(wheel.purge(), None);

        // no later than duration + tick
        wheel.advance(start + Duration::from_millis(400));
        assert_eq!(wheel.purge(), Some(vpn(1)));
        assert_eq!(wheel.purge(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_waits_one_tick() {
        let mut wheel = TimerWheel::new(TICK, Duration::from_secs(1));
        let start = Instant::now();
        wheel.advance(start);

        wheel.add(vpn(1), Duration::ZERO);
        assert_eq!(wheel.purge(), None);

        wheel.advance(start + 2 * TICK);
        assert_eq!(wheel.purge(), Some(vpn(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_items_one_slot() {
        let mut wheel = TimerWheel::new(TICK, Duration::from_secs(1));
        let start = Instant::now();
        wheel.advance(start);

        wheel.add(vpn(1), TICK);
        wheel.add(vpn(2), TICK);
        assert_eq!(wheel.len(), 2);

        wheel.advance(start + 3 * TICK);
        let mut fired = vec![wheel.purge().unwrap(), wheel.purge().unwrap()];
        fired.sort();
        assert_eq!(fired, vec![vpn(1), vpn(2)]);
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_duration_clamps() {
        let mut wheel = TimerWheel::new(TICK, Duration::from_millis(300));
        let start = Instant::now();
        wheel.advance(start);

        // way past the span; must still land inside the wheel
        wheel.add(vpn(1), Duration::from_secs(60));

        wheel.advance(start + Duration::from_millis(600));
        assert_eq!(wheel.purge(), Some(vpn(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_wraps() {
        let mut wheel = TimerWheel::new(TICK, Duration::from_millis(300));
        let start = Instant::now();
        wheel.advance(start);

        // several laps around a small wheel
        for lap in 0u32..4 {
            wheel.add(vpn(lap), TICK);
            wheel.advance(start + Duration::from_millis(300 * (lap as u64 + 1)));
            assert_eq!(wheel.purge(), Some(vpn(lap)));
            assert_eq!(wheel.purge(), None);
        }
    }
}
