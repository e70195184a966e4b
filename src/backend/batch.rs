//! Token batches submitted to [`InferenceBackend::decode`](super::InferenceBackend::decode).

use super::TokenId;

/// One entry of a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchToken {
    pub token: TokenId,
    /// Absolute position in the sequence.
    pub position: usize,
    /// Sequence slots this token belongs to.
    pub seq_ids: Vec<i32>,
    /// Whether the engine should produce output logits for this token.
    pub logits: bool,
}

/// A set of tokens decoded together in one engine call.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    tokens: Vec<BatchToken>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { tokens: Vec::with_capacity(capacity) }
    }

    /// Build a prompt batch: positions `0..N`, sequence slot 0, logits only
    /// for the final token.
    pub fn for_prompt(tokens: &[TokenId]) -> Self {
        let mut batch = Self::with_capacity(tokens.len());
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            batch.add(token, i, &[0], i == last);
        }
        batch
    }

    pub fn add(&mut self, token: TokenId, position: usize, seq_ids: &[i32], logits: bool) {
        self.tokens.push(BatchToken {
            token,
            position,
            seq_ids: seq_ids.to_vec(),
            logits,
        });
    }

    /// Empty the batch, keeping its allocation.
    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[BatchToken] {
        &self.tokens
    }

    /// Index of the last token requesting logits, if any.
    pub fn logits_index(&self) -> Option<usize> {
        self.tokens.iter().rposition(|t| t.logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_batch_positions_and_logits() {
        let batch = Batch::for_prompt(&[0, 11, 12, 13]);
        assert_eq!(batch.len(), 4);
        for (i, t) in batch.tokens().iter().enumerate() {
            assert_eq!(t.position, i);
            assert_eq!(t.seq_ids, vec![0]);
            assert_eq!(t.logits, i == 3, "only the last token requests logits");
        }
        assert_eq!(batch.logits_index(), Some(3));
    }

    #[test]
    fn test_prompt_batch_empty() {
        let batch = Batch::for_prompt(&[]);
        assert!(batch.is_empty());
        assert_eq!(batch.logits_index(), None);
    }

    #[test]
    fn test_clear_and_reuse() {
        let mut batch = Batch::for_prompt(&[1, 2, 3]);
        batch.clear();
        assert!(batch.is_empty());
        batch.add(42, 3, &[0], true);
        assert_eq!(batch.tokens()[0].token, 42);
        assert_eq!(batch.tokens()[0].position, 3);
    }
}
