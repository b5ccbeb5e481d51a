//! Model catalogue: the default model per agent kind and per-model token
//! prices. Costs are tracked in millionths of a currency unit so the six
//! decimal places of the monetary ceiling survive integer arithmetic.

use std::collections::HashMap;

use crate::state::AgentKind;

use super::client::TokenUsage;

/// Price per 1 000 tokens, in micro-units.
#[derive(Debug, Clone, Copy)]
pub struct TokenPrice {
    pub input_micros_per_1k: u64,
    pub output_micros_per_1k: u64,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    defaults: HashMap<AgentKind, String>,
    prices: HashMap<String, TokenPrice>,
    fallback_price: TokenPrice,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert(AgentKind::Analyser, "sonho-4-analitico".to_string());
        defaults.insert(AgentKind::Researcher, "farol-mini".to_string());
        defaults.insert(AgentKind::Drafter, "redator-4o".to_string());
        defaults.insert(AgentKind::Critic, "sonho-4-analitico".to_string());
        defaults.insert(AgentKind::Formatter, "farol-mini".to_string());

        let mut prices = HashMap::new();
        prices.insert(
            "sonho-4-analitico".to_string(),
            TokenPrice {
                input_micros_per_1k: 3_000,
                output_micros_per_1k: 15_000,
            },
        );
        prices.insert(
            "redator-4o".to_string(),
            TokenPrice {
                input_micros_per_1k: 5_000,
                output_micros_per_1k: 15_000,
            },
        );
        prices.insert(
            "farol-mini".to_string(),
            TokenPrice {
                input_micros_per_1k: 150,
                output_micros_per_1k: 600,
            },
        );

        Self {
            defaults,
            prices,
            fallback_price: TokenPrice {
                input_micros_per_1k: 2_000,
                output_micros_per_1k: 8_000,
            },
        }
    }
}

impl ModelCatalog {
    /// Default model for an agent kind when the tenant expresses no
    /// preference.
    pub fn default_model(&self, kind: AgentKind) -> &str {
        self.defaults
            .get(&kind)
            .map(|s| s.as_str())
            .unwrap_or("farol-mini")
    }

    /// Itemised cost of one call, in micro-units. Unknown models charge the
    /// fallback price so costs never silently read as zero.
    pub fn cost_micros(&self, model: &str, usage: TokenUsage) -> u64 {
        let price = self.prices.get(model).unwrap_or(&self.fallback_price);
        let input = u64::from(usage.input) * price.input_micros_per_1k / 1_000;
        let output = u64::from(usage.output) * price.output_micros_per_1k / 1_000;
        input + output
    }

    pub fn with_default(mut self, kind: AgentKind, model: &str) -> Self {
        self.defaults.insert(kind, model.to_string());
        self
    }

    pub fn with_price(mut self, model: &str, price: TokenPrice) -> Self {
        self.prices.insert(model.to_string(), price);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_agent_kind_has_a_default() {
        let catalog = ModelCatalog::default();
        for kind in [
            AgentKind::Analyser,
            AgentKind::Researcher,
            AgentKind::Drafter,
            AgentKind::Critic,
            AgentKind::Formatter,
        ] {
            assert!(!catalog.default_model(kind).is_empty());
        }
    }

    #[test]
    fn cost_is_itemised_per_direction() {
        let catalog = ModelCatalog::default();
        let usage = TokenUsage {
            input: 1_000,
            output: 1_000,
        };
        assert_eq!(catalog.cost_micros("sonho-4-analitico", usage), 18_000);
        // Unknown model falls back instead of costing nothing.
        assert_eq!(catalog.cost_micros("desconhecido", usage), 10_000);
    }
}
