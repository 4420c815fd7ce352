//! Engine timers
//!
//! Deadlines owned by the engine. Nothing here sleeps; the event loop waits on
//! the earliest deadline and collects whatever has expired.

use tokio::time::Instant;

/// Named engine timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Next retry from `disconnected` or `suspended`
    Retry,
    /// Escalation from `disconnected` to `suspended`
    StateTtl,
    /// Upper bound on the close handshake
    CloseTimeout,
}

impl TimerKind {
    const ALL: [TimerKind; 3] = [TimerKind::Retry, TimerKind::StateTtl, TimerKind::CloseTimeout];

    fn index(self) -> usize {
        match self {
            TimerKind::Retry => 0,
            TimerKind::StateTtl => 1,
            TimerKind::CloseTimeout => 2,
        }
    }
}

/// Armed deadlines, at most one per kind
#[derive(Debug, Clone, Default)]
pub struct Timers {
    deadlines: [Option<Instant>; 3],
}

impl Timers {
    /// No timers armed
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` at `at`, replacing an earlier deadline
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines[kind.index()] = Some(at);
    }

    /// Disarm `kind`; true if it was armed
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].take().is_some()
    }

    /// Disarm everything and return how many were armed
    pub fn cancel_all(&mut self) -> usize {
        TimerKind::ALL
            .iter()
            .filter(|kind| self.cancel(**kind))
            .count()
    }

    /// Deadline of `kind`, if armed
    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind.index()]
    }

    /// Whether `kind` is armed
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadline(kind).is_some()
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Disarm and return every timer due at `now`, earliest first
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut expired: Vec<(Instant, TimerKind)> = TimerKind::ALL
            .iter()
            .filter_map(|kind| {
                self.deadline(*kind)
                    .filter(|at| *at <= now)
                    .map(|at| (at, *kind))
            })
            .collect();
        expired.sort_by_key(|(at, _)| *at);
        for (_, kind) in &expired {
            self.cancel(*kind);
        }
        expired.into_iter().map(|(_, kind)| kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expiry_order_and_cancel() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm(TimerKind::StateTtl, now + Duration::from_secs(30));
        timers.arm(TimerKind::Retry, now + Duration::from_secs(5));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(5)));

        assert!(timers.take_expired(now).is_empty());
        assert_eq!(
            timers.take_expired(now + Duration::from_secs(30)),
            vec![TimerKind::Retry, TimerKind::StateTtl]
        );
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_cancel_all_counts_once() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm(TimerKind::Retry, now);
        timers.arm(TimerKind::CloseTimeout, now);
        assert_eq!(timers.cancel_all(), 2);
        assert_eq!(timers.cancel_all(), 0);
        assert!(!timers.is_armed(TimerKind::Retry));
    }
}
