//! In-memory conversation store.
//!
//! Every operation takes the single store lock for its whole duration, so
//! callers never observe a half-applied mutation and mutations of one
//! conversation are totally ordered.

use chrono::{DateTime, Duration, Utc};
use parley_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{ApiResponseSummary, Conversation, Message, Role, TruncateSide};
use crate::tokenizer::TokenCounter;

/// Result of one reaper pass over the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Names of conversations removed for dormancy
    pub evicted: Vec<String>,
    /// Messages discarded to respect the length cap
    pub trimmed_messages: usize,
}

/// Owner of all conversation state.
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    tokenizer: Arc<dyn TokenCounter>,
    max_truncate: usize,
}

impl ConversationStore {
    /// Create an empty store.
    ///
    /// `max_truncate` bounds how many messages one truncate call may remove.
    pub fn new(tokenizer: Arc<dyn TokenCounter>, max_truncate: usize) -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            tokenizer,
            max_truncate,
        }
    }

    /// Append a message, creating the conversation if needed.
    ///
    /// Empty content creates/touches the conversation but appends nothing.
    /// Returns the token count of the appended message.
    pub async fn append(&self, name: &str, message: Message, model: &str) -> usize {
        let tokens = if message.content.is_empty() {
            0
        } else {
            self.tokenizer.count_tokens(model, &message.content)
        };

        let now = Utc::now();
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations
            .entry(name.to_string())
            .or_insert_with(|| Conversation::new(model, now));

        if !message.content.is_empty() {
            conversation.messages.push_back(message);
            conversation.token_count += tokens;
            conversation.last_token_count = tokens;
        }
        conversation.last_model = model.to_string();
        conversation.last_updated = now;

        tokens
    }

    /// Remove up to `count` messages from one end.
    ///
    /// Absent conversations and empty histories are a no-op. Token fields are
    /// recounted from the remaining content. Returns how many were removed.
    pub async fn truncate(&self, name: &str, side: TruncateSide, count: usize) -> usize {
        let count = count.min(self.max_truncate);

        let mut conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get_mut(name) else {
            return 0;
        };

        let mut removed = 0;
        while removed < count {
            let popped = match side {
                TruncateSide::Top => conversation.messages.pop_back(),
                TruncateSide::Bottom => conversation.messages.pop_front(),
            };
            if popped.is_none() {
                break;
            }
            removed += 1;
        }

        if conversation.messages.is_empty() {
            conversation.token_count = 0;
            conversation.last_token_count = 0;
        } else {
            // CPU-bound and held under the store lock. Bounded by the message
            // cap times the content limit.
            let remaining: String = conversation
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect();
            let tokens = self
                .tokenizer
                .count_tokens(&conversation.last_model, &remaining);
            conversation.token_count = tokens;
            conversation.last_token_count = tokens;
        }
        if removed > 0 {
            conversation.last_updated = Utc::now();
        }

        removed
    }

    /// Remove a conversation entirely. Returns whether it existed.
    pub async fn clear(&self, name: &str) -> bool {
        self.conversations.lock().await.remove(name).is_some()
    }

    /// Copy of a conversation's current state.
    pub async fn snapshot(&self, name: &str) -> Result<Conversation> {
        self.conversations
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Record that an upstream attempt is about to be made.
    pub async fn record_attempt(
        &self,
        name: &str,
        attempt: u32,
        request_payload: serde_json::Value,
    ) -> Result<()> {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        conversation.last_api_request_attempts = attempt;
        conversation.last_api_request = Some(request_payload);
        Ok(())
    }

    /// Record what the upstream answered on the latest attempt.
    pub async fn record_response(&self, name: &str, summary: ApiResponseSummary) -> Result<()> {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        conversation.last_api_response = Some(summary);
        Ok(())
    }

    /// Append a synthetic `error` message. Error messages carry no tokens.
    pub async fn record_failure(&self, name: &str, content: impl Into<String>) -> Result<()> {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        conversation.messages.push_back(Message::new(Role::Error, content));
        conversation.last_updated = Utc::now();
        Ok(())
    }

    /// Evict dormant conversations, then cap the history of the rest.
    ///
    /// Trimming here does not recount tokens, so `token_count` may overstate
    /// what is retained until the next truncate.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        dormant_after: Duration,
        max_messages: usize,
    ) -> SweepOutcome {
        let mut conversations = self.conversations.lock().await;
        let mut outcome = SweepOutcome::default();

        conversations.retain(|name, conversation| {
            let dormant = now.signed_duration_since(conversation.last_updated) > dormant_after;
            if dormant {
                outcome.evicted.push(name.clone());
            }
            !dormant
        });

        for conversation in conversations.values_mut() {
            while conversation.messages.len() > max_messages {
                conversation.messages.pop_front();
                outcome.trimmed_messages += 1;
            }
        }

        outcome
    }

    /// Number of live conversations.
    pub async fn len(&self) -> usize {
        self.conversations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.lock().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn set_last_updated(&self, name: &str, at: DateTime<Utc>) {
        if let Some(conversation) = self.conversations.lock().await.get_mut(name) {
            conversation.last_updated = at;
        }
    }
}
