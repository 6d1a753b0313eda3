//! Eligibility policy
//!
//! A policy table keyed by reputation tier decides who may stake a
//! performance bond and on what terms. Tiers without a policy are
//! ineligible. The maximum bond scales with the agent's settled volume so
//! that a fresh agent cannot stake (and later forfeit) more than its
//! track record supports.

use std::collections::HashMap;

use pact_common::Amount;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierPolicy {
    pub min_reputation_score: f64,
    pub min_days_on_network: u32,
    pub min_transactions: u64,
    pub min_success_rate: f64,
    pub min_bond_amount: Amount,
    pub max_bond_amount: Amount,
    pub guaranteed_success_rate: f64,
    pub sla_window_size: u32,
    pub guarantee_premium_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationInput {
    pub score: f64,
    pub tier: String,
    pub total_transactions: u64,
    pub success_rate: f64,
    pub days_on_network: u32,
    pub total_volume_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub min_bond_amount: Amount,
    pub max_bond_amount: Amount,
    pub guaranteed_success_rate: f64,
    pub sla_window_size: u32,
    pub guarantee_premium_rate: f64,
}

impl EvaluationResult {
    fn ineligible(reason: String) -> Self {
        Self {
            eligible: false,
            reason: Some(reason),
            min_bond_amount: Amount::ZERO,
            max_bond_amount: Amount::ZERO,
            guaranteed_success_rate: 0.0,
            sla_window_size: 0,
            guarantee_premium_rate: 0.0,
        }
    }
}

pub struct Scorer {
    policies: HashMap<String, TierPolicy>,
}

impl Default for Scorer {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            "standard".to_string(),
            TierPolicy {
                min_reputation_score: 50.0,
                min_days_on_network: 30,
                min_transactions: 100,
                min_success_rate: 90.0,
                min_bond_amount: Amount::from_micros(10_000_000),
                max_bond_amount: Amount::from_micros(100_000_000),
                guaranteed_success_rate: 90.0,
                sla_window_size: 20,
                guarantee_premium_rate: 0.05,
            },
        );
        policies.insert(
            "premium".to_string(),
            TierPolicy {
                min_reputation_score: 70.0,
                min_days_on_network: 60,
                min_transactions: 500,
                min_success_rate: 95.0,
                min_bond_amount: Amount::from_micros(50_000_000),
                max_bond_amount: Amount::from_micros(500_000_000),
                guaranteed_success_rate: 95.0,
                sla_window_size: 20,
                guarantee_premium_rate: 0.03,
            },
        );
        policies.insert(
            "elite".to_string(),
            TierPolicy {
                min_reputation_score: 85.0,
                min_days_on_network: 90,
                min_transactions: 2_000,
                min_success_rate: 98.0,
                min_bond_amount: Amount::from_micros(100_000_000),
                max_bond_amount: Amount::from_micros(1_000_000_000),
                guaranteed_success_rate: 97.0,
                sla_window_size: 20,
                guarantee_premium_rate: 0.02,
            },
        );
        Self { policies }
    }
}

impl Scorer {
    pub fn new(policies: HashMap<String, TierPolicy>) -> Self {
        Self { policies }
    }

    pub fn policy(&self, tier: &str) -> Option<&TierPolicy> {
        self.policies.get(tier)
    }

    pub fn evaluate(&self, input: &EvaluationInput) -> EvaluationResult {
        let Some(policy) = self.policies.get(&input.tier) else {
            return EvaluationResult::ineligible(format!(
                "tier '{}' is not eligible for verification",
                input.tier
            ));
        };
        if input.score < policy.min_reputation_score {
            return EvaluationResult::ineligible(format!(
                "reputation score {:.1} below required {:.1}",
                input.score, policy.min_reputation_score
            ));
        }
        if input.days_on_network < policy.min_days_on_network {
            return EvaluationResult::ineligible(format!(
                "{} days on network, {} required",
                input.days_on_network, policy.min_days_on_network
            ));
        }
        if input.total_transactions < policy.min_transactions {
            return EvaluationResult::ineligible(format!(
                "{} transactions, {} required",
                input.total_transactions, policy.min_transactions
            ));
        }
        if input.success_rate < policy.min_success_rate {
            return EvaluationResult::ineligible(format!(
                "success rate {:.1}% below required {:.1}%",
                input.success_rate, policy.min_success_rate
            ));
        }

        EvaluationResult {
            eligible: true,
            reason: None,
            min_bond_amount: policy.min_bond_amount,
            max_bond_amount: scaled_max_bond(policy, input.total_volume_usd),
            guaranteed_success_rate: policy.guaranteed_success_rate,
            sla_window_size: policy.sla_window_size,
            guarantee_premium_rate: policy.guarantee_premium_rate,
        }
    }
}

/// `maxBond = policy.max · clamp(0.3 + 0.7·(log10(volume+1)/4), 0, 1)`,
/// rounded to two decimals and floored at the tier minimum.
fn scaled_max_bond(policy: &TierPolicy, volume_usd: f64) -> Amount {
    let factor = (0.3 + 0.7 * ((volume_usd + 1.0).log10() / 4.0)).clamp(0.0, 1.0);
    let scaled = policy.max_bond_amount.micros() as f64 * factor;
    // Two-decimal rounding on the monetary value = nearest 10^4 micros
    let rounded = (scaled / 10_000.0).round() * 10_000.0;
    Amount::from_micros(rounded as u64).max(policy.min_bond_amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elite_input() -> EvaluationInput {
        EvaluationInput {
            score: 92.0,
            tier: "elite".to_string(),
            total_transactions: 5_000,
            success_rate: 99.1,
            days_on_network: 200,
            total_volume_usd: 100_000.0,
        }
    }

    #[test]
    fn test_unknown_tier_is_ineligible() {
        let scorer = Scorer::default();
        let mut input = elite_input();
        input.tier = "bronze".to_string();
        let result = scorer.evaluate(&input);
        assert!(!result.eligible);
        assert!(result.reason.unwrap().contains("not eligible"));
    }

    #[test]
    fn test_threshold_failures_name_the_reason() {
        let scorer = Scorer::default();

        let mut input = elite_input();
        input.score = 60.0;
        assert!(scorer.evaluate(&input).reason.unwrap().contains("score"));

        let mut input = elite_input();
        input.days_on_network = 10;
        assert!(scorer.evaluate(&input).reason.unwrap().contains("days"));

        let mut input = elite_input();
        input.total_transactions = 5;
        assert!(scorer
            .evaluate(&input)
            .reason
            .unwrap()
            .contains("transactions"));

        let mut input = elite_input();
        input.success_rate = 90.0;
        assert!(scorer
            .evaluate(&input)
            .reason
            .unwrap()
            .contains("success rate"));
    }

    #[test]
    fn test_eligible_elite_terms() {
        let scorer = Scorer::default();
        let result = scorer.evaluate(&elite_input());
        assert!(result.eligible);
        assert_eq!(result.guaranteed_success_rate, 97.0);
        assert_eq!(result.sla_window_size, 20);
        assert_eq!(result.min_bond_amount, Amount::parse("100").unwrap());
    }

    #[test]
    fn test_max_bond_scales_with_volume() {
        let scorer = Scorer::default();

        // High volume: factor clamps at 1.0
        let result = scorer.evaluate(&elite_input());
        assert_eq!(result.max_bond_amount, Amount::parse("1000").unwrap());

        // Zero volume: factor 0.3
        let mut input = elite_input();
        input.total_volume_usd = 0.0;
        let result = scorer.evaluate(&input);
        assert_eq!(result.max_bond_amount, Amount::parse("300").unwrap());
    }

    #[test]
    fn test_max_bond_floored_at_minimum() {
        let mut policies = HashMap::new();
        policies.insert(
            "tiny".to_string(),
            TierPolicy {
                min_reputation_score: 0.0,
                min_days_on_network: 0,
                min_transactions: 0,
                min_success_rate: 0.0,
                min_bond_amount: Amount::parse("50").unwrap(),
                max_bond_amount: Amount::parse("60").unwrap(),
                guaranteed_success_rate: 90.0,
                sla_window_size: 10,
                guarantee_premium_rate: 0.1,
            },
        );
        let scorer = Scorer::new(policies);
        let mut input = elite_input();
        input.tier = "tiny".to_string();
        input.total_volume_usd = 0.0;
        // 60 * 0.3 = 18, floored at the 50 minimum
        let result = scorer.evaluate(&input);
        assert_eq!(result.max_bond_amount, Amount::parse("50").unwrap());
    }
}
