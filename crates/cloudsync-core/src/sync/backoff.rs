//! Retry delays

use std::time::Duration;

/// Fixed retry ladder indexed by the consecutive failure count
///
/// The first failure waits `steps[0]`; counts past the end reuse the last
/// step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffLadder {
    steps: Vec<Duration>,
}

impl BackoffLadder {
    const FALLBACK: Duration = Duration::from_secs(5);

    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps }
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        if self.steps.is_empty() {
            return Self::FALLBACK;
        }
        let index = (failures.max(1) as usize - 1).min(self.steps.len() - 1);
        self.steps[index]
    }
}

impl Default for BackoffLadder {
    fn default() -> Self {
        Self::new(
            [5, 30, 120, 300, 600]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_steps_and_cap() {
        let ladder = BackoffLadder::default();
        assert_eq!(ladder.delay_for(1), Duration::from_secs(5));
        assert_eq!(ladder.delay_for(2), Duration::from_secs(30));
        assert_eq!(ladder.delay_for(3), Duration::from_secs(120));
        assert_eq!(ladder.delay_for(5), Duration::from_secs(600));
        assert_eq!(ladder.delay_for(40), Duration::from_secs(600));
    }

    #[test]
    fn test_zero_failures_uses_first_step() {
        assert_eq!(BackoffLadder::default().delay_for(0), Duration::from_secs(5));
        assert_eq!(BackoffLadder::new(Vec::new()).delay_for(3), Duration::from_secs(5));
    }
}
