use tracing::warn;

/// Decision returned by the restart policy after an unexpected exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart the core (includes 1-based attempt number).
    Restart { attempt: u32 },
    /// Retry budget exhausted; give up and surface a fatal notification.
    Exhausted,
}

/// Crash counter plus retry budget.
///
/// Counts consecutive unexpected exits since the last reset. Reset on a user
/// stop, a clean exit, an exhausted budget, or when a restarted core stays up
/// for the stability window.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_attempts: u32,
    crash_count: u32,
}

impl RestartPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            crash_count: 0,
        }
    }

    /// Record an unexpected exit and decide whether to restart.
    ///
    /// On `Exhausted` the counter is reset so a later manual start begins
    /// with a full budget.
    pub fn record_crash(&mut self) -> RestartDecision {
        self.crash_count += 1;

        if self.crash_count <= self.max_attempts {
            RestartDecision::Restart {
                attempt: self.crash_count,
            }
        } else {
            warn!(
                max_attempts = self.max_attempts,
                "crash restart budget exhausted"
            );
            self.crash_count = 0;
            RestartDecision::Exhausted
        }
    }

    pub fn reset(&mut self) {
        self.crash_count = 0;
    }

    /// Consecutive crashes since the last reset.
    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_crash_restarts() {
        let mut policy = RestartPolicy::new(3);
        assert_eq!(policy.record_crash(), RestartDecision::Restart { attempt: 1 });
        assert_eq!(policy.crash_count(), 1);
    }

    #[test]
    fn test_exhausted_after_budget() {
        let mut policy = RestartPolicy::new(3);
        assert_eq!(policy.record_crash(), RestartDecision::Restart { attempt: 1 });
        assert_eq!(policy.record_crash(), RestartDecision::Restart { attempt: 2 });
        assert_eq!(policy.record_crash(), RestartDecision::Restart { attempt: 3 });
        assert_eq!(policy.record_crash(), RestartDecision::Exhausted);
        // Exhaustion resets the counter.
        assert_eq!(policy.crash_count(), 0);
    }

    #[test]
    fn test_reset_restores_full_budget() {
        let mut policy = RestartPolicy::new(2);
        policy.record_crash();
        policy.record_crash();
        assert_eq!(policy.crash_count(), 2);

        policy.reset();
        assert_eq!(policy.crash_count(), 0);
        assert_eq!(policy.record_crash(), RestartDecision::Restart { attempt: 1 });
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let mut policy = RestartPolicy::new(0);
        assert_eq!(policy.record_crash(), RestartDecision::Exhausted);
        assert_eq!(policy.crash_count(), 0);
    }
}
