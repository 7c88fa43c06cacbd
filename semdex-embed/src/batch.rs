//! Grouping texts into provider-sized batches.

use crate::config::ProviderLimits;
use chrono::{DateTime, Utc};
use semdex_context::estimate_tokens;
use serde::Serialize;
use std::time::Duration;

/// A text ready to be sent, with its token estimate after any truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedText {
    pub text: String,
    pub tokens: usize,
    pub truncated: bool,
}

impl PreparedText {
    /// Truncate `text` to `limits.max_input_tokens` if it is longer.
    pub fn new(text: String, limits: &ProviderLimits) -> Self {
        let tokens = estimate_tokens(&text);
        if tokens <= limits.max_input_tokens {
            return Self {
                text,
                tokens,
                truncated: false,
            };
        }

        let keep = limits.max_input_tokens.saturating_mul(4);
        let text: String = text.chars().take(keep).collect();
        Self {
            tokens: estimate_tokens(&text),
            text,
            truncated: true,
        }
    }
}

/// One provider call worth of texts, plus what happened to it.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: usize,
    /// Indices into the pipeline input
    pub members: Vec<usize>,
    pub token_count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: Vec<RetryAttempt>,
}

impl Batch {
    fn new(id: usize) -> Self {
        Self {
            id,
            members: Vec::new(),
            token_count: 0,
            started_at: None,
            duration: None,
            success: false,
            error: None,
            attempts: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Log entry for one provider call of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    /// 1-based
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    /// Delay slept after this attempt before the next one
    pub delay: Duration,
    pub error: Option<String>,
    pub success: bool,
}

/// Greedily group `texts` in input order.
///
/// A batch closes when adding the next text would exceed
/// `max_batch_tokens` or `max_batch_items`. A text larger than
/// `max_batch_tokens` on its own gets a batch of its own.
pub fn plan_batches(texts: &[PreparedText], limits: &ProviderLimits) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = Batch::new(0);

    for (index, text) in texts.iter().enumerate() {
        let oversized = text.tokens > limits.max_batch_tokens;
        let full = current.token_count + text.tokens > limits.max_batch_tokens
            || current.len() >= limits.max_batch_items;

        if !current.is_empty() && (oversized || full) {
            let next = Batch::new(batches.len() + 1);
            batches.push(std::mem::replace(&mut current, next));
        }

        current.members.push(index);
        current.token_count += text.tokens;

        if oversized {
            let next = Batch::new(batches.len() + 1);
            batches.push(std::mem::replace(&mut current, next));
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(token_counts: &[usize]) -> Vec<PreparedText> {
        token_counts
            .iter()
            .map(|&tokens| PreparedText {
                text: "x".repeat(tokens * 4),
                tokens,
                truncated: false,
            })
            .collect()
    }

    fn shape(batches: &[Batch]) -> Vec<Vec<usize>> {
        batches.iter().map(|b| b.members.clone()).collect()
    }

    #[test]
    fn test_token_limit() {
        let limits = ProviderLimits::new(8).with_max_batch_tokens(100);
        let batches = plan_batches(&texts(&[40, 40, 30, 60, 10]), &limits);

        assert_eq!(shape(&batches), vec![vec![0, 1], vec![2, 3, 4]]);
        assert_eq!(batches[0].token_count, 80);
        assert_eq!(batches[1].token_count, 100);
        assert_eq!(batches.iter().map(|b| b.id).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_item_limit() {
        let limits = ProviderLimits::new(8).with_max_batch_items(2);
        let batches = plan_batches(&texts(&[1, 1, 1, 1, 1]), &limits);
        assert_eq!(shape(&batches), vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_oversized_text_gets_its_own_batch() {
        let limits = ProviderLimits::new(8).with_max_batch_tokens(50);
        let batches = plan_batches(&texts(&[10, 200, 10]), &limits);
        assert_eq!(shape(&batches), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_truncation_to_input_ceiling() {
        let limits = ProviderLimits::new(8).with_max_input_tokens(10);
        let long = PreparedText::new("y".repeat(100), &limits);
        assert!(long.truncated);
        assert_eq!(long.text.len(), 40);
        assert_eq!(long.tokens, 10);

        let short = PreparedText::new("short".to_string(), &limits);
        assert!(!short.truncated);
        assert_eq!(short.tokens, 2);
    }

    #[test]
    fn test_empty_input() {
        assert!(plan_batches(&[], &ProviderLimits::default()).is_empty());
    }
}
