//! Token and cost estimation for agent replies.
//!
//! Agents report plain text, not provider usage blocks, so the orchestrator estimates
//! token counts from character length and prices them per million tokens. Prices are
//! looked up by model-name prefix; unknown models cost nothing.

use crate::roundtable::message::{Message, MessageMetrics};
use std::time::Duration;

/// Rough characters-per-token ratio for English text.
pub const CHARS_PER_TOKEN: usize = 4;

/// USD price per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const FREE: ModelPricing = ModelPricing {
        input_per_million: 0.0,
        output_per_million: 0.0,
    };

    pub fn cost(&self, input_tokens: usize, output_tokens: usize) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

const SONNET: ModelPricing = ModelPricing {
    input_per_million: 3.0,
    output_per_million: 15.0,
};

const OPUS: ModelPricing = ModelPricing {
    input_per_million: 15.0,
    output_per_million: 75.0,
};

const HAIKU: ModelPricing = ModelPricing {
    input_per_million: 1.0,
    output_per_million: 5.0,
};

const GEMINI_PRO: ModelPricing = ModelPricing {
    input_per_million: 1.25,
    output_per_million: 10.0,
};

const GEMINI_FLASH: ModelPricing = ModelPricing {
    input_per_million: 0.30,
    output_per_million: 2.50,
};

const GPT_4O: ModelPricing = ModelPricing {
    input_per_million: 2.50,
    output_per_million: 10.0,
};

const GPT_4O_MINI: ModelPricing = ModelPricing {
    input_per_million: 0.15,
    output_per_million: 0.60,
};

/// Most specific prefixes first.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    ("claude-opus", OPUS),
    ("claude-sonnet", SONNET),
    ("claude-haiku", HAIKU),
    ("claude-3-5-sonnet", SONNET),
    ("claude-3-5-haiku", HAIKU),
    ("gemini-2.5-pro", GEMINI_PRO),
    ("gemini-2.5-flash", GEMINI_FLASH),
    ("gpt-4o-mini", GPT_4O_MINI),
    ("gpt-4o", GPT_4O),
];

/// Estimates usage and cost for a finished agent call.
#[derive(Debug, Clone, Default)]
pub struct UsageEstimator {
    overrides: Vec<(String, ModelPricing)>,
}

impl UsageEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Price `model_prefix` explicitly; overrides take precedence over the built-in table.
    pub fn with_pricing(mut self, model_prefix: impl Into<String>, pricing: ModelPricing) -> Self {
        self.overrides.push((model_prefix.into(), pricing));
        self
    }

    /// Pricing for `model`, matched by prefix.
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        let model = model.to_lowercase();
        self.overrides
            .iter()
            .map(|(prefix, pricing)| (prefix.as_str(), *pricing))
            .chain(PRICING_TABLE.iter().copied())
            .find(|(prefix, _)| model.starts_with(&prefix.to_lowercase()))
            .map(|(_, pricing)| pricing)
            .unwrap_or(ModelPricing::FREE)
    }

    pub fn estimate_tokens(text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            0
        } else {
            chars.div_ceil(CHARS_PER_TOKEN)
        }
    }

    /// Build metrics for a reply produced from `history`.
    ///
    /// ```
    /// use roundtable::message::{Message, Role};
    /// use roundtable::usage::UsageEstimator;
    /// use std::time::Duration;
    ///
    /// let history = vec![Message::new("host", "Host", "host", Role::User, "12345678")];
    /// let metrics = UsageEstimator::new().estimate(&history, "abcd", "mock-1", Duration::ZERO);
    /// assert_eq!(metrics.input_tokens, 2);
    /// assert_eq!(metrics.output_tokens, 1);
    /// assert_eq!(metrics.total_tokens, 3);
    /// assert_eq!(metrics.cost, 0.0);
    /// ```
    pub fn estimate(
        &self,
        history: &[Message],
        reply: &str,
        model: &str,
        duration: Duration,
    ) -> MessageMetrics {
        let input_tokens = history
            .iter()
            .map(|m| Self::estimate_tokens(&m.content))
            .sum::<usize>();
        let output_tokens = Self::estimate_tokens(reply);
        MessageMetrics {
            duration,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost: self.pricing_for(model).cost(input_tokens, output_tokens),
            model: model.to_string(),
        }
    }
}
