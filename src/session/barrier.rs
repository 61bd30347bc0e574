//! Countdown-gated start barrier
//!
//! Idle -> CountingDown when the participant count reaches the threshold,
//! CountingDown -> Idle when it drops below before expiry, and
//! CountingDown -> Started when the countdown runs out. Started is terminal.

use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, info};

/// Countdown value reported while no countdown is running
pub const NOT_COUNTING: f32 = -1.0;

/// Barrier state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    /// Waiting for enough participants
    Idle,
    /// Threshold reached, countdown running
    CountingDown,
    /// Everyone activated; never left
    Started,
}

/// Transition produced by a barrier step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierTransition {
    CountdownStarted { seconds: u32 },
    CountdownTick { remaining_secs: u32 },
    CountdownCancelled,
    Started,
}

pub type Transitions = SmallVec<[BarrierTransition; 2]>;

/// Server-authoritative start barrier
#[derive(Debug, Clone)]
pub struct StartBarrier {
    state: BarrierState,
    threshold: usize,
    countdown: Duration,
    remaining: Option<Duration>,
    participant_count: usize,
    /// Last whole-second value announced, to emit ticks only on change
    last_announced: Option<u32>,
}

impl StartBarrier {
    pub fn new(threshold: usize, countdown: Duration) -> Self {
        Self {
            state: BarrierState::Idle,
            threshold: threshold.max(1),
            countdown,
            remaining: None,
            participant_count: 0,
            last_announced: None,
        }
    }

    pub fn state(&self) -> BarrierState {
        self.state
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn participant_count(&self) -> usize {
        self.participant_count
    }

    pub fn is_started(&self) -> bool {
        self.state == BarrierState::Started
    }

    /// Remaining countdown, `None` when not counting
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    /// Remaining countdown rounded up to whole seconds
    pub fn remaining_whole_secs(&self) -> Option<u32> {
        self.remaining.map(ceil_secs)
    }

    /// Remaining countdown in seconds, or [`NOT_COUNTING`]
    pub fn countdown_remaining_secs(&self) -> f32 {
        self.remaining
            .map(|d| d.as_secs_f32())
            .unwrap_or(NOT_COUNTING)
    }

    /// Record a new participant count and evaluate start conditions
    pub fn update_count(&mut self, count: usize) -> Transitions {
        self.participant_count = count;
        let mut transitions = Transitions::new();

        match self.state {
            BarrierState::Started => {}
            BarrierState::Idle if count >= self.threshold => {
                self.state = BarrierState::CountingDown;
                self.remaining = Some(self.countdown);
                let seconds = ceil_secs(self.countdown);
                self.last_announced = Some(seconds);
                info!(
                    "Start countdown begins: {}s with {} participants",
                    seconds, count
                );
                transitions.push(BarrierTransition::CountdownStarted { seconds });
            }
            BarrierState::CountingDown if count < self.threshold => {
                self.state = BarrierState::Idle;
                self.remaining = None;
                self.last_announced = None;
                info!(
                    "Start countdown cancelled: {}/{} participants",
                    count, self.threshold
                );
                transitions.push(BarrierTransition::CountdownCancelled);
            }
            _ => {}
        }

        transitions
    }

    /// Advance the countdown by `elapsed`
    pub fn tick(&mut self, elapsed: Duration) -> Transitions {
        let mut transitions = Transitions::new();

        if self.state != BarrierState::CountingDown {
            return transitions;
        }

        let remaining = self.remaining.unwrap_or(self.countdown).saturating_sub(elapsed);

        if remaining.is_zero() {
            if self.participant_count >= self.threshold {
                self.state = BarrierState::Started;
                self.remaining = None;
                self.last_announced = None;
                info!("Start barrier fired with {} participants", self.participant_count);
                transitions.push(BarrierTransition::Started);
            } else {
                // Count changes always pass through update_count, so this is
                // only reachable if the barrier is driven inconsistently.
                self.state = BarrierState::Idle;
                self.remaining = None;
                self.last_announced = None;
                transitions.push(BarrierTransition::CountdownCancelled);
            }
            return transitions;
        }

        self.remaining = Some(remaining);
        let secs = ceil_secs(remaining);
        if self.last_announced != Some(secs) {
            self.last_announced = Some(secs);
            debug!("Countdown: {}s", secs);
            transitions.push(BarrierTransition::CountdownTick { remaining_secs: secs });
        }

        transitions
    }
}

fn ceil_secs(duration: Duration) -> u32 {
    let whole = duration.as_secs();
    let ceil = if duration.subsec_nanos() > 0 { whole + 1 } else { whole };
    u32::try_from(ceil).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn barrier() -> StartBarrier {
        StartBarrier::new(2, Duration::from_secs(3))
    }

    #[test]
    fn test_starts_idle() {
        let b = barrier();
        assert_eq!(b.state(), BarrierState::Idle);
        assert_eq!(b.countdown_remaining_secs(), NOT_COUNTING);
    }

    #[test]
    fn test_threshold_starts_countdown() {
        let mut b = barrier();
        assert!(b.update_count(1).is_empty());

        let t = b.update_count(2);
        assert_eq!(t.as_slice(), &[BarrierTransition::CountdownStarted { seconds: 3 }]);
        assert_eq!(b.state(), BarrierState::CountingDown);
        assert_eq!(b.remaining(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_extra_participants_do_not_restart_countdown() {
        let mut b = barrier();
        b.update_count(2);
        b.tick(Duration::from_secs(1));

        assert!(b.update_count(3).is_empty());
        assert_eq!(b.remaining(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_drop_below_threshold_cancels() {
        let mut b = barrier();
        b.update_count(2);
        b.tick(Duration::from_millis(1500));

        let t = b.update_count(1);
        assert_eq!(t.as_slice(), &[BarrierTransition::CountdownCancelled]);
        assert_eq!(b.state(), BarrierState::Idle);
        assert_eq!(b.remaining(), None);
        assert_eq!(b.countdown_remaining_secs(), NOT_COUNTING);
    }

    #[test]
    fn test_ticks_announce_whole_seconds_once() {
        let mut b = barrier();
        b.update_count(2);

        let mut announced = Vec::new();
        for _ in 0..29 {
            for t in b.tick(Duration::from_millis(100)) {
                if let BarrierTransition::CountdownTick { remaining_secs } = t {
                    announced.push(remaining_secs);
                }
            }
        }
        assert_eq!(announced, vec![2, 1]);
        assert_eq!(b.state(), BarrierState::CountingDown);
    }

    #[test]
    fn test_expiry_fires_start() {
        let mut b = barrier();
        b.update_count(2);

        let t = b.tick(Duration::from_secs(3));
        assert_eq!(t.as_slice(), &[BarrierTransition::Started]);
        assert!(b.is_started());
    }

    #[test]
    fn test_started_is_terminal() {
        let mut b = barrier();
        b.update_count(2);
        b.tick(Duration::from_secs(5));
        assert!(b.is_started());

        assert!(b.update_count(0).is_empty());
        assert!(b.tick(Duration::from_secs(1)).is_empty());
        assert!(b.update_count(4).is_empty());
        assert_eq!(b.state(), BarrierState::Started);
    }

    #[test]
    fn test_reentry_restarts_full_countdown() {
        let mut b = barrier();
        b.update_count(2);
        b.tick(Duration::from_millis(2500));
        b.update_count(1);

        b.update_count(2);
        assert_eq!(b.remaining(), Some(Duration::from_secs(3)));

        // The earlier 2.5s must not carry over
        assert!(b.tick(Duration::from_millis(600)).iter().all(|t| *t != BarrierTransition::Started));
        assert_eq!(b.state(), BarrierState::CountingDown);
    }

    #[test]
    fn test_never_starts_below_threshold() {
        let mut b = StartBarrier::new(3, Duration::from_secs(1));
        for count in [0, 1, 2, 1, 2, 0] {
            b.update_count(count);
            b.tick(Duration::from_secs(10));
            assert_ne!(b.state(), BarrierState::Started);
        }
    }

    #[test]
    fn test_zero_threshold_clamped() {
        let b = StartBarrier::new(0, Duration::from_secs(1));
        assert_eq!(b.threshold(), 1);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(2001)), 3);
        assert_eq!(ceil_secs(Duration::from_secs(2)), 2);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
    }
}
