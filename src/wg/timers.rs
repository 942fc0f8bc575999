//! Per-peer timer wheel
//!
//! One ordered wheel of named deadlines per peer, driven by a single task.
//! Arming a timer that is already armed replaces its deadline.

use std::time::{Duration, Instant};

use rand::Rng;

/// REKEY_TIMEOUT: handshake retransmission interval.
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
/// Jitter added to each retransmission deadline.
pub const REKEY_TIMEOUT_JITTER_MAX: Duration = Duration::from_millis(333);
/// REKEY_ATTEMPT_TIME: give up on a handshake cycle after this long.
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
/// KEEPALIVE_TIMEOUT: passive keepalive after receive-without-send.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Retransmit the in-flight handshake initiation.
    HandshakeRetry,
    /// Send a keepalive (persistent or passive).
    Keepalive,
    /// Session is due for rekey.
    Rekey,
    /// Session must be discarded.
    Reject,
}

const TIMER_COUNT: usize = 4;

fn slot(timer: Timer) -> usize {
    match timer {
        Timer::HandshakeRetry => 0,
        Timer::Keepalive => 1,
        Timer::Rekey => 2,
        Timer::Reject => 3,
    }
}

const TIMERS: [Timer; TIMER_COUNT] = [
    Timer::HandshakeRetry,
    Timer::Keepalive,
    Timer::Rekey,
    Timer::Reject,
];

/// The wheel itself: a fixed array of optional deadlines.
#[derive(Debug, Default)]
pub struct TimerWheel {
    deadlines: [Option<Instant>; TIMER_COUNT],
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer at an absolute deadline.
    pub fn arm(&mut self, timer: Timer, at: Instant) {
        self.deadlines[slot(timer)] = Some(at);
    }

    /// Arm relative to now.
    pub fn arm_in(&mut self, timer: Timer, after: Duration) {
        self.arm(timer, Instant::now() + after);
    }

    pub fn disarm(&mut self, timer: Timer) {
        self.deadlines[slot(timer)] = None;
    }

    pub fn disarm_all(&mut self) {
        self.deadlines = [None; TIMER_COUNT];
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        self.deadlines[slot(timer)].is_some()
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Pop every timer whose deadline has passed, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<Timer> {
        let mut due: Vec<(Instant, Timer)> = Vec::new();
        for timer in TIMERS {
            if let Some(at) = self.deadlines[slot(timer)] {
                if at <= now {
                    self.deadlines[slot(timer)] = None;
                    due.push((at, timer));
                }
            }
        }
        due.sort_by_key(|&(at, _)| at);
        due.into_iter().map(|(_, t)| t).collect()
    }
}

/// REKEY_TIMEOUT plus up to 333 ms of jitter.
pub fn rekey_timeout_jittered() -> Duration {
    REKEY_TIMEOUT + Duration::from_millis(rand::thread_rng().gen_range(0..=333))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearm_replaces_deadline() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.arm(Timer::Keepalive, now + Duration::from_secs(10));
        wheel.arm(Timer::Keepalive, now + Duration::from_secs(3));
        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_secs(3)));
    }

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.arm(Timer::Rekey, now - Duration::from_secs(1));
        wheel.arm(Timer::HandshakeRetry, now - Duration::from_secs(3));
        wheel.arm(Timer::Keepalive, now + Duration::from_secs(60));

        let due = wheel.take_due(now);
        assert_eq!(due, vec![Timer::HandshakeRetry, Timer::Rekey]);
        // future timer still armed
        assert!(wheel.is_armed(Timer::Keepalive));
        assert!(!wheel.is_armed(Timer::Rekey));
    }

    #[test]
    fn disarm_all_clears_the_wheel() {
        let mut wheel = TimerWheel::new();
        wheel.arm_in(Timer::Reject, Duration::from_secs(180));
        wheel.disarm_all();
        assert_eq!(wheel.next_deadline(), None);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..32 {
            let d = rekey_timeout_jittered();
            assert!(d >= REKEY_TIMEOUT);
            assert!(d <= REKEY_TIMEOUT + REKEY_TIMEOUT_JITTER_MAX);
        }
    }
}
