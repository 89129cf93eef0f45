//! Per-run token budget with a hard cap.

use autoeval_types::{AutoevalError, Result};

/// Fixed overhead of one summarizer call, added to the document's token count.
pub const SUMMARIZER_OVERHEAD_TOKENS: u64 = 600;
/// Fixed overhead of one judge call, added to the document's token count.
pub const JUDGE_OVERHEAD_TOKENS: u64 = 400;
/// Flat estimate for one suite-authoring call.
pub const AUTHOR_TOKENS: u64 = 6_000;
/// Flat estimate for one curriculum call.
pub const CURRICULUM_TOKENS: u64 = 12_000;

/// Monotonic token counter. `used` never exceeds `cap`.
///
/// Only the task driving a run mutates the budget; concurrent jobs report
/// their estimates back to it instead of touching it directly.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    cap: u64,
    used: u64,
}

impl TokenBudget {
    pub fn new(cap: u64) -> Self {
        Self { cap, used: 0 }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn remaining(&self) -> u64 {
        self.cap - self.used
    }

    /// Commit `tokens` if the total stays within the cap.
    ///
    /// On failure `used` is left untouched.
    pub fn add(&mut self, tokens: u64) -> Result<()> {
        match self.used.checked_add(tokens) {
            Some(total) if total <= self.cap => {
                self.used = total;
                Ok(())
            }
            _ => Err(AutoevalError::TokenBudgetExceeded {
                attempted: self.used.saturating_add(tokens),
                cap: self.cap,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_within_cap_commits() {
        let mut budget = TokenBudget::new(1_000);
        budget.add(400).unwrap();
        budget.add(600).unwrap();
        assert_eq!(budget.used(), 1_000);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn add_over_cap_leaves_used_unchanged() {
        let mut budget = TokenBudget::new(1_000);
        budget.add(700).unwrap();
        let err = budget.add(301).unwrap_err();
        assert!(err.is_budget_exceeded());
        assert_eq!(err.to_string(), "Token budget exceeded: 1001 > 1000");
        assert_eq!(budget.used(), 700);

        // A smaller addition still fits afterwards.
        budget.add(300).unwrap();
        assert_eq!(budget.used(), 1_000);
    }

    #[test]
    fn zero_addition_always_fits() {
        let mut budget = TokenBudget::new(0);
        budget.add(0).unwrap();
        assert!(budget.add(1).is_err());
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn overflowing_addition_is_rejected() {
        let mut budget = TokenBudget::new(u64::MAX);
        budget.add(u64::MAX - 1).unwrap();
        assert!(budget.add(u64::MAX).is_err());
        assert_eq!(budget.used(), u64::MAX - 1);
    }
}
