//! A shared backpressure budget that throttles retries during server overload.

use std::sync::Mutex;

/// The number of tokens a single overload retry costs.
pub(crate) const RETRY_COST: u32 = 5;

/// The number of tokens deposited back on every successful attempt.
pub(crate) const BUDGET_REFRESH: u32 = 1;

/// The default budget capacity.
pub(crate) const DEFAULT_CAPACITY: u32 = 100;

/// A bounded token counter shared by all operations on one topology.
///
/// When a server sheds load with a retryable overload error, each retry must first debit
/// [`RETRY_COST`] tokens from this budget; successful attempts deposit tokens back. Under
/// sustained overload the budget drains and retries are abandoned, so a struggling deployment is
/// not met with a synchronized wall of retry traffic.
#[derive(Debug)]
pub struct RetryBudget {
    capacity: u32,
    budget: Mutex<u32>,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RetryBudget {
    /// Creates a budget with the given capacity, initially full.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            budget: Mutex::new(capacity),
        }
    }

    /// Deposits `tokens`, clamping at capacity.
    pub fn deposit(&self, tokens: u32) {
        let mut budget = self.budget.lock().unwrap();
        *budget = (*budget + tokens).min(self.capacity);
    }

    /// Attempts to debit `tokens`. All-or-nothing: on insufficient budget nothing is debited and
    /// `false` is returned.
    pub fn consume(&self, tokens: u32) -> bool {
        let mut budget = self.budget.lock().unwrap();
        if tokens > *budget {
            return false;
        }
        *budget -= tokens;
        true
    }

    /// The current number of tokens available.
    pub fn available(&self) -> u32 {
        *self.budget.lock().unwrap()
    }
}
