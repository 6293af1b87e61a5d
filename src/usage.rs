use std::iter::Sum;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Token and cost accounting for a single model invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// USD.
    pub cost: f64,
}

impl Usage {
    pub const ZERO: Usage = Usage {
        input_tokens: 0,
        output_tokens: 0,
        cost: 0.0,
    };

    pub fn new(input_tokens: u64, output_tokens: u64, cost: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost == 0.0
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cost += rhs.cost;
    }
}

impl Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Self {
        let mut total = Usage::ZERO;
        for usage in iter {
            total += usage;
        }
        total
    }
}

impl<'a> Sum<&'a Usage> for Usage {
    fn sum<I: Iterator<Item = &'a Usage>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Running totals across a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub model_calls: u32,
}

impl UsageTotals {
    pub fn add(&mut self, usage: &Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cost += usage.cost;
    }

    pub fn record_model_call(&mut self, usage: &Usage) {
        self.add(usage);
        self.model_calls += 1;
    }

    pub fn merge(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
        self.model_calls += other.model_calls;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_exact_sum_including_zero_contributions() {
        let calls = [
            Usage::new(1200, 300, 0.0021),
            Usage::ZERO,
            Usage::new(800, 100, 0.0009),
            Usage::ZERO,
        ];

        let mut totals = UsageTotals::default();
        for usage in &calls {
            if usage.is_zero() {
                totals.add(usage);
            } else {
                totals.record_model_call(usage);
            }
        }

        assert_eq!(totals.input_tokens, 2000);
        assert_eq!(totals.output_tokens, 400);
        assert!((totals.cost - 0.003).abs() < 1e-12);
        assert_eq!(totals.model_calls, 2);

        let summed: Usage = calls.iter().sum();
        assert_eq!(summed.input_tokens, totals.input_tokens);
        assert_eq!(summed.output_tokens, totals.output_tokens);
    }

    #[test]
    fn merge_combines_extraction_and_pagination_totals() {
        let mut extraction = UsageTotals::default();
        extraction.record_model_call(&Usage::new(10, 5, 0.5));
        let mut pagination = UsageTotals::default();
        pagination.record_model_call(&Usage::new(3, 2, 0.25));

        extraction.merge(&pagination);
        assert_eq!(extraction.input_tokens, 13);
        assert_eq!(extraction.output_tokens, 7);
        assert_eq!(extraction.cost, 0.75);
        assert_eq!(extraction.model_calls, 2);
    }
}
