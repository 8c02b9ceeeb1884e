//! Per-model context budgets and the token estimator that drives
//! history compaction.
//!
//! The estimator is a character heuristic (~4 chars per token), not a real
//! tokenizer; budgets are approximate by design and the compactor treats
//! the trigger as a soft ceiling.

use goagent_protocol::ChatMessage;

/// Context-window size and compaction threshold for one model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelBudget {
    pub max_tokens: i64,
    pub compact_when_percent: f64,
}

const FALLBACK_BUDGET: ModelBudget = ModelBudget {
    max_tokens: 128_000,
    compact_when_percent: 0.85,
};

const MODEL_BUDGETS: &[(&str, ModelBudget)] = &[
    (
        "gpt-4o",
        ModelBudget {
            max_tokens: 128_000,
            compact_when_percent: 0.85,
        },
    ),
    (
        "gpt-4o-mini",
        ModelBudget {
            max_tokens: 128_000,
            compact_when_percent: 0.85,
        },
    ),
    (
        "gpt-4.1",
        ModelBudget {
            max_tokens: 1_047_576,
            compact_when_percent: 0.9,
        },
    ),
    (
        "gpt-4.1-mini",
        ModelBudget {
            max_tokens: 1_047_576,
            compact_when_percent: 0.9,
        },
    ),
    (
        "gpt-5",
        ModelBudget {
            max_tokens: 272_000,
            compact_when_percent: 0.85,
        },
    ),
    (
        "o3",
        ModelBudget {
            max_tokens: 200_000,
            compact_when_percent: 0.8,
        },
    ),
    (
        "o4-mini",
        ModelBudget {
            max_tokens: 200_000,
            compact_when_percent: 0.8,
        },
    ),
];

/// Look up the budget for a model id, case-insensitively. Unknown models
/// get the 128k fallback.
pub fn budget_for_model(model: &str) -> ModelBudget {
    let needle = model.trim().to_ascii_lowercase();
    MODEL_BUDGETS
        .iter()
        .find(|(id, _)| *id == needle)
        .map(|(_, b)| *b)
        .unwrap_or(FALLBACK_BUDGET)
}

/// Resolved compaction trigger for a session.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    trigger_tokens: i64,
}

impl ContextBudget {
    pub fn new(budget: ModelBudget) -> Self {
        let mut percent = budget.compact_when_percent;
        if percent > 1.0 {
            // Tolerate "85" meaning 85%.
            percent /= 100.0;
        }
        let percent = percent.clamp(0.0, 1.0);
        let trigger_tokens = if budget.max_tokens <= 0 {
            0
        } else {
            (budget.max_tokens as f64 * percent).ceil() as i64
        };
        Self { trigger_tokens }
    }

    pub fn for_model(model: &str) -> Self {
        Self::new(budget_for_model(model))
    }

    /// Compaction is disabled when the trigger degenerates to nothing.
    pub fn enabled(&self) -> bool {
        self.trigger_tokens >= 1
    }

    pub fn trigger_tokens(&self) -> i64 {
        self.trigger_tokens
    }
}

fn field_tokens(s: &str) -> i64 {
    if s.is_empty() {
        0
    } else {
        (s.len() as i64 + 3) / 4
    }
}

/// Estimated token footprint of one message: a small structural overhead
/// plus ~len/4 per populated field, and the same again per tool call.
pub fn estimate_message_tokens(msg: &ChatMessage) -> i64 {
    let mut total = 4;
    total += field_tokens(msg.role.as_str());
    total += field_tokens(&msg.content);
    total += field_tokens(msg.tool_call_id.as_deref().unwrap_or_default());
    total += field_tokens(msg.name.as_deref().unwrap_or_default());
    for call in &msg.tool_calls {
        total += 4;
        total += field_tokens(&call.id);
        total += field_tokens(&call.name);
        total += field_tokens(&call.arguments);
    }
    total
}

pub fn estimate_history_tokens<'a>(messages: impl IntoIterator<Item = &'a ChatMessage>) -> i64 {
    messages.into_iter().map(estimate_message_tokens).sum()
}
