//! Token counting seam for the consuming model's tokenizer.

/// Counts tokens the way the consuming LLM's tokenizer would.
///
/// The budget enforcer only needs counts, so the trait is a single method;
/// deployments plug in the real tokenizer for their model.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Heuristic counter: 1 token ≈ 4 characters.
///
/// Good enough for budget enforcement when the exact tokenizer is not
/// wired in; counts are rounded up so the budget errs on the safe side.
#[derive(Debug, Clone, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}
