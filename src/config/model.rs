use std::collections::BTreeMap;

/// Default model for building/validation iterations.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default model for the planning phase.
pub const PLANNING_MODEL: &str = "claude-opus-4-20250514";

/// Context window assumed when a model is not in the pricing table.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Per-model pricing in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub context_window: u64,
}

/// Pricing table with a `default` row for unknown models.
#[derive(Debug, Clone)]
pub struct ModelPricing {
    rates: BTreeMap<String, ModelRate>,
    default: ModelRate,
}

impl Default for ModelPricing {
    fn default() -> Self {
        let mut rates = BTreeMap::new();
        rates.insert(
            DEFAULT_MODEL.to_string(),
            ModelRate {
                input_per_million: 3.0,
                output_per_million: 15.0,
                context_window: 200_000,
            },
        );
        rates.insert(
            PLANNING_MODEL.to_string(),
            ModelRate {
                input_per_million: 15.0,
                output_per_million: 75.0,
                context_window: 200_000,
            },
        );
        Self {
            rates,
            default: ModelRate {
                input_per_million: 3.0,
                output_per_million: 15.0,
                context_window: DEFAULT_CONTEXT_WINDOW,
            },
        }
    }
}

impl ModelPricing {
    pub fn rate_for(&self, model: &str) -> ModelRate {
        self.rates.get(model).copied().unwrap_or(self.default)
    }

    pub fn context_window(&self, model: &str) -> u64 {
        self.rate_for(model).context_window
    }

    pub fn insert(&mut self, model: impl Into<String>, rate: ModelRate) {
        self.rates.insert(model.into(), rate);
    }
}
