//! Token budget enforcement over a ranked result slate.

use crate::models::ScoredMemory;
use crate::retrieval::TokenCounter;

/// Result of a budget pass.
#[derive(Debug)]
pub struct BudgetResult {
    /// Items that fit, in their original rank order
    pub kept: Vec<ScoredMemory>,
    /// Tokens consumed by the kept items
    pub token_count: usize,
    /// True iff an item was excluded solely by the budget
    pub truncated: bool,
}

/// Greedily keep ranked items while the running token count stays within
/// budget. The scan stops at the first overflow: rank order is relevance
/// order, so skipping ahead to a smaller item would reorder the slate.
/// Deterministic given identical inputs.
pub fn enforce(
    ordered: Vec<ScoredMemory>,
    budget: usize,
    counter: &dyn TokenCounter,
) -> BudgetResult {
    let mut kept = Vec::with_capacity(ordered.len());
    let mut token_count = 0usize;
    let mut truncated = false;

    for scored in ordered {
        let tokens = counter.count(&scored.item.content);
        if token_count + tokens > budget {
            truncated = true;
            break;
        }
        token_count += tokens;
        kept.push(scored);
    }

    BudgetResult {
        kept,
        token_count,
        truncated,
    }
}
