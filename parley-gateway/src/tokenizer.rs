//! Approximate token counting for conversation bookkeeping.
//!
//! Counting never fails past this boundary: an unknown model or a tokenizer
//! error is logged and counted as zero tokens.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use tiktoken_rs::CoreBPE;

/// Counts tokens for a given model.
pub trait TokenCounter: Send + Sync {
    /// Approximate token count of `text` under `model`'s encoding.
    fn count_tokens(&self, model: &str, text: &str) -> usize;
}

/// How many distinct model encodings to keep loaded.
const ENCODER_CACHE_SIZE: usize = 8;

/// Token counter backed by tiktoken-rs.
///
/// Encoders are expensive to build, so resolved encoders (and failed
/// lookups) are cached per model name.
pub struct TiktokenCounter {
    encoders: Mutex<LruCache<String, Option<Arc<CoreBPE>>>>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(ENCODER_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            encoders: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn encoder_for(&self, model: &str) -> Option<Arc<CoreBPE>> {
        let mut encoders = self.encoders.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = encoders.get(model) {
            return cached.clone();
        }

        let resolved = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => Some(Arc::new(bpe)),
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "Error counting tokens, no encoding for model");
                None
            }
        };
        encoders.put(model.to_string(), resolved.clone());
        resolved
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, model: &str, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encoder_for(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => 0,
        }
    }
}

/// Character-based estimate (~4 characters per token). Needs no encoder data.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproximateCounter;

impl TokenCounter for ApproximateCounter {
    fn count_tokens(&self, _model: &str, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}
