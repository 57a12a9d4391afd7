//! Token accounting and cost estimation for a single agent run.
//!
//! Costs are estimates derived from token counts and a configurable pricing
//! table. They are reproducible from stored counts and never billing-grade.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PricingNotFoundError;
use crate::model::{ModelUsage, ResearchCost};

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// USD price per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn estimate(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / TOKENS_PER_MILLION) * self.input_per_million
            + (output_tokens as f64 / TOKENS_PER_MILLION) * self.output_per_million
    }
}

/// Pricing keyed by model name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    pub models: BTreeMap<String, ModelPrice>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            models: BTreeMap::new(),
        }
    }

    /// Published list prices for the models the default agent uses.
    pub fn builtin() -> Self {
        let models = [
            ("gpt-4-turbo-preview", ModelPrice::new(10.0, 30.0)),
            ("gpt-4-turbo", ModelPrice::new(10.0, 30.0)),
            ("gpt-4", ModelPrice::new(30.0, 60.0)),
            ("gpt-4o", ModelPrice::new(5.0, 15.0)),
            ("gpt-4o-mini", ModelPrice::new(0.15, 0.60)),
            ("gpt-3.5-turbo", ModelPrice::new(0.50, 1.50)),
        ]
        .into_iter()
        .map(|(name, price)| (name.to_string(), price))
        .collect();
        Self { models }
    }

    pub fn with_model(mut self, model_name: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(model_name.into(), price);
        self
    }

    /// Overlay `overrides` on top of this table, replacing entries by name.
    pub fn merged(mut self, overrides: &PricingTable) -> Self {
        for (name, price) in &overrides.models {
            self.models.insert(name.clone(), *price);
        }
        self
    }

    pub fn price(&self, model_name: &str) -> Result<&ModelPrice, PricingNotFoundError> {
        self.models
            .get(model_name)
            .ok_or_else(|| PricingNotFoundError::new(model_name))
    }

    pub fn estimate(
        &self,
        model_name: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<f64, PricingNotFoundError> {
        Ok(self.price(model_name)?.estimate(input_tokens, output_tokens))
    }

    /// Recompute a stored cost record from its token counts alone.
    pub fn recompute(&self, cost: &ResearchCost) -> Result<f64, PricingNotFoundError> {
        if cost.breakdown.is_empty() {
            return self.estimate(&cost.model_name, cost.input_tokens, cost.output_tokens);
        }
        estimate_breakdown(self, &cost.breakdown)
    }
}

fn estimate_breakdown(
    table: &PricingTable,
    usage: &[ModelUsage],
) -> Result<f64, PricingNotFoundError> {
    usage.iter().try_fold(0.0, |total, entry| {
        Ok(total + table.estimate(&entry.model_name, entry.input_tokens, entry.output_tokens)?)
    })
}

/// Finalized usage of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
    pub breakdown: Vec<ModelUsage>,
}

impl CostReport {
    pub fn into_record(self, session_id: uuid::Uuid) -> ResearchCost {
        ResearchCost::new(session_id, self)
    }
}

/// Running token totals for the current run.
///
/// One accountant is created per attempt so a retried run never double
/// counts usage from an abandoned attempt.
#[derive(Debug, Clone)]
pub struct CostAccountant {
    pricing: Arc<PricingTable>,
    default_model: String,
    usage: BTreeMap<String, (u64, u64)>,
}

impl CostAccountant {
    pub fn new(pricing: Arc<PricingTable>, default_model: impl Into<String>) -> Self {
        Self {
            pricing,
            default_model: default_model.into(),
            usage: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, model_name: &str, input_tokens: u64, output_tokens: u64) {
        let entry = self.usage.entry(model_name.to_string()).or_insert((0, 0));
        entry.0 = entry.0.saturating_add(input_tokens);
        entry.1 = entry.1.saturating_add(output_tokens);
    }

    pub fn input_tokens(&self) -> u64 {
        self.usage.values().map(|(input, _)| input).sum()
    }

    pub fn output_tokens(&self) -> u64 {
        self.usage.values().map(|(_, output)| output).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens() + self.output_tokens()
    }

    /// Close the run and price it. Fails on any model without a price,
    /// including the default model of a run that reported no usage.
    pub fn finalize(&self) -> Result<CostReport, PricingNotFoundError> {
        let breakdown: Vec<ModelUsage> = if self.usage.is_empty() {
            vec![ModelUsage {
                model_name: self.default_model.clone(),
                input_tokens: 0,
                output_tokens: 0,
            }]
        } else {
            self.usage
                .iter()
                .map(|(model_name, (input_tokens, output_tokens))| ModelUsage {
                    model_name: model_name.clone(),
                    input_tokens: *input_tokens,
                    output_tokens: *output_tokens,
                })
                .collect()
        };

        let estimated_cost_usd = estimate_breakdown(&self.pricing, &breakdown)?;
        let model_name = breakdown
            .iter()
            .map(|usage| usage.model_name.as_str())
            .collect::<Vec<_>>()
            .join("+");
        let input_tokens = self.input_tokens();
        let output_tokens = self.output_tokens();

        Ok(CostReport {
            model_name,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost_usd,
            breakdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant() -> CostAccountant {
        CostAccountant::new(Arc::new(PricingTable::builtin()), "gpt-4-turbo-preview")
    }

    #[test]
    fn gpt4_turbo_preview_estimate() {
        let mut accountant = accountant();
        accountant.record("gpt-4-turbo-preview", 5000, 2000);
        let report = accountant.finalize().unwrap();

        assert_eq!(report.model_name, "gpt-4-turbo-preview");
        assert_eq!(report.total_tokens, 7000);
        assert!((report.estimated_cost_usd - 0.11).abs() < 1e-9);
    }

    #[test]
    fn usage_accumulates_across_events() {
        let mut accountant = accountant();
        accountant.record("gpt-4-turbo-preview", 1000, 100);
        accountant.record("gpt-4-turbo-preview", 4000, 1900);
        let report = accountant.finalize().unwrap();

        assert_eq!(report.input_tokens, 5000);
        assert_eq!(report.output_tokens, 2000);
        assert_eq!(report.breakdown.len(), 1);
    }

    #[test]
    fn unknown_model_never_prices_at_zero() {
        let mut accountant = accountant();
        accountant.record("mystery-model", 10, 10);
        let err = accountant.finalize().unwrap_err();
        assert_eq!(err.model_name, "mystery-model");
    }

    #[test]
    fn run_without_usage_prices_default_model() {
        let report = accountant().finalize().unwrap();
        assert_eq!(report.total_tokens, 0);
        assert_eq!(report.estimated_cost_usd, 0.0);
        assert_eq!(report.model_name, "gpt-4-turbo-preview");

        let unpriced = CostAccountant::new(Arc::new(PricingTable::empty()), "gpt-4o");
        assert!(unpriced.finalize().is_err());
    }

    #[test]
    fn mixed_models_sum_breakdown_and_recompute() {
        let pricing = PricingTable::builtin();
        let mut accountant = CostAccountant::new(Arc::new(pricing.clone()), "gpt-4o");
        accountant.record("gpt-4o-mini", 20_000, 4_000);
        accountant.record("gpt-4o", 3_000, 1_000);
        let report = accountant.finalize().unwrap();

        assert_eq!(report.model_name, "gpt-4o+gpt-4o-mini");
        let expected = pricing.estimate("gpt-4o", 3_000, 1_000).unwrap()
            + pricing.estimate("gpt-4o-mini", 20_000, 4_000).unwrap();
        assert!((report.estimated_cost_usd - expected).abs() < 1e-12);

        let record = report.clone().into_record(uuid::Uuid::new_v4());
        let recomputed = pricing.recompute(&record).unwrap();
        assert_eq!(recomputed, report.estimated_cost_usd);
    }

    #[test]
    fn overrides_replace_by_name() {
        let overrides = PricingTable::empty().with_model("gpt-4", ModelPrice::new(1.0, 2.0));
        let merged = PricingTable::builtin().merged(&overrides);
        assert_eq!(merged.price("gpt-4").unwrap().input_per_million, 1.0);
        assert_eq!(merged.price("gpt-4o").unwrap().input_per_million, 5.0);
    }
}
