//! Cost and context accounting.
//!
//! Converts token counts to USD via the per-model pricing table and checks
//! configured budgets. Rounding is banker's (half-to-even) to four decimals
//! so stored costs round-trip byte-stably.

use crate::config::{CostLimits, ModelPricing};
use crate::error::{RalphError, Result};

/// Round half-to-even at the given number of decimal places.
pub fn round_half_even(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    let floor = scaled.floor();
    let diff = scaled - floor;
    let rounded = if (diff - 0.5).abs() < 1e-9 {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        scaled.round()
    };
    rounded / factor
}

/// Token-to-USD accountant with budget checks.
#[derive(Debug, Clone)]
pub struct Accountant {
    pricing: ModelPricing,
    limits: CostLimits,
}

impl Accountant {
    pub fn new(pricing: ModelPricing, limits: CostLimits) -> Self {
        Self { pricing, limits }
    }

    pub fn limits(&self) -> &CostLimits {
        &self.limits
    }

    /// USD for one model call, rounded to four decimals.
    pub fn cost_for(&self, input_tokens: u64, output_tokens: u64, model: &str) -> f64 {
        let rate = self.pricing.rate_for(model);
        let input_cost = input_tokens as f64 / 1_000_000.0 * rate.input_per_million;
        let output_cost = output_tokens as f64 / 1_000_000.0 * rate.output_per_million;
        round_half_even(input_cost + output_cost, 4)
    }

    pub fn context_window(&self, model: &str) -> u64 {
        self.pricing.context_window(model)
    }

    /// Budget gate applied before each iteration. A value exactly at a
    /// limit denies the next iteration.
    pub fn check_budgets(
        &self,
        iteration_cost: f64,
        session_cost: f64,
        total_cost: f64,
    ) -> Result<()> {
        if iteration_cost >= self.limits.per_iteration {
            return Err(RalphError::IterationBudgetExceeded {
                spent: iteration_cost,
                limit: self.limits.per_iteration,
            });
        }
        if session_cost >= self.limits.per_session {
            return Err(RalphError::SessionBudgetExceeded {
                spent: session_cost,
                limit: self.limits.per_session,
            });
        }
        if total_cost >= self.limits.total {
            return Err(RalphError::TotalBudgetExceeded {
                spent: total_cost,
                limit: self.limits.total,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MODEL;

    fn accountant() -> Accountant {
        Accountant::new(ModelPricing::default(), CostLimits::default())
    }

    #[test]
    fn test_cost_for_known_model() {
        let acc = accountant();
        // 1M input at $3 + 1M output at $15
        assert_eq!(acc.cost_for(1_000_000, 1_000_000, DEFAULT_MODEL), 18.0);
    }

    #[test]
    fn test_cost_rounds_to_four_decimals() {
        let acc = accountant();
        // 111 input tokens at $3/M = 0.000333
        assert_eq!(acc.cost_for(111, 0, DEFAULT_MODEL), 0.0003);
    }

    #[test]
    fn test_bankers_rounding_half_to_even() {
        assert_eq!(round_half_even(0.00015, 4), 0.0002);
        assert_eq!(round_half_even(0.00025, 4), 0.0002);
        assert_eq!(round_half_even(0.00035, 4), 0.0004);
        assert_eq!(round_half_even(2.5, 0), 2.0);
        assert_eq!(round_half_even(3.5, 0), 4.0);
    }

    #[test]
    fn test_unknown_model_uses_default_rate() {
        let acc = accountant();
        assert_eq!(acc.cost_for(1_000_000, 0, "mystery-model"), 3.0);
    }

    #[test]
    fn test_budget_denied_at_exact_limit() {
        let acc = accountant();
        assert!(acc.check_budgets(1.99, 0.0, 0.0).is_ok());
        assert!(matches!(
            acc.check_budgets(2.0, 0.0, 0.0),
            Err(RalphError::IterationBudgetExceeded { .. })
        ));
        assert!(matches!(
            acc.check_budgets(0.0, 50.0, 0.0),
            Err(RalphError::SessionBudgetExceeded { .. })
        ));
        assert!(matches!(
            acc.check_budgets(0.0, 0.0, 200.0),
            Err(RalphError::TotalBudgetExceeded { .. })
        ));
    }
}
