//! Retried upstream replies for a conversation.
//!
//! One call to [`ReplyOrchestrator::request_reply`] walks this state machine:
//!
//! ```text
//! Attempting ──429──▶ Throttled ──backoff──▶ Attempting   (≤ max_attempts)
//!     │
//!     ├── transport error ─────────▶ Failed(Transport)
//!     ├── any other status ──parse─▶ Succeeded | Failed(Malformed)
//!     └── still 429 at the ceiling ▶ Failed(Exhausted)
//! ```
//!
//! Failures never propagate to the HTTP layer; each one is written into the
//! conversation as a single synthetic `error` message.

use parley_common::{Result, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

use crate::conversation::{ApiResponseSummary, ConversationStore};
use crate::upstream::{parse_reply, CompletionRequest, UpstreamClient, UpstreamResponse};

/// Retry behaviour for throttled attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay after a throttled attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: Duration::from_secs(3),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
        }
    }
}

/// Why a reply could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No response at all (connection error, timeout)
    Transport,
    /// Still throttled after the last permitted attempt
    Exhausted,
    /// A final response without an extractable reply
    Malformed,
}

/// Terminal state of one reply request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Succeeded { attempts: u32, token_delta: usize },
    Failed { attempts: u32, reason: FailureReason },
}

impl ReplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Drives upstream calls on behalf of conversations.
pub struct ReplyOrchestrator {
    store: Arc<ConversationStore>,
    client: Arc<dyn UpstreamClient>,
    policy: RetryPolicy,
}

impl ReplyOrchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        client: Arc<dyn UpstreamClient>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            client,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Ask the upstream to continue conversation `name` and record the result.
    ///
    /// Only a missing conversation is an error; upstream failures are
    /// reported through the returned outcome and the conversation itself.
    pub async fn request_reply(
        &self,
        name: &str,
        model: &str,
        temperature: f64,
    ) -> Result<ReplyOutcome> {
        let snapshot = self.store.snapshot(name).await?;
        let request = CompletionRequest {
            model: model.to_string(),
            temperature,
            messages: snapshot.outbound_messages(),
        };
        let payload = request.to_payload();
        let max_attempts = self.policy.max_attempts;

        let mut last_throttled: Option<UpstreamResponse> = None;
        for attempt in 1..=max_attempts {
            self.note(
                name,
                self.store
                    .record_attempt(name, attempt, payload.clone())
                    .await,
            );
            tracing::info!(
                conversation = %name,
                attempt,
                max_attempts,
                "Making API request"
            );

            let response = match self.client.complete(&request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(conversation = %name, attempt, error = %e, "API request error");
                    let summary = ApiResponseSummary {
                        status: None,
                        body: e.to_string(),
                    };
                    self.note(name, self.store.record_response(name, summary).await);
                    self.fail(name, format!("Uh oh! A request error occurred: {e}."))
                        .await;
                    return Ok(ReplyOutcome::Failed {
                        attempts: attempt,
                        reason: FailureReason::Transport,
                    });
                }
            };

            self.note(name, self.store.record_response(name, response.summary()).await);

            if !response.is_throttled() {
                return Ok(self.finish(name, model, attempt, &response).await);
            }

            if attempt < max_attempts {
                tracing::warn!(
                    conversation = %name,
                    attempt,
                    max_attempts,
                    delay_ms = self.policy.backoff.as_millis() as u64,
                    "API throttled this conversation, retrying"
                );
                tokio::time::sleep(self.policy.backoff).await;
            }
            last_throttled = Some(response);
        }

        let body = last_throttled.map(|r| r.body).unwrap_or_default();
        tracing::warn!(conversation = %name, max_attempts, "API still throttling, giving up");
        self.fail(
            name,
            format!(
                "Uh oh! The API is still rate limiting after {max_attempts} attempts. Status: 429, Text: {body}."
            ),
        )
        .await;

        Ok(ReplyOutcome::Failed {
            attempts: max_attempts,
            reason: FailureReason::Exhausted,
        })
    }

    /// Turn a final (non-throttled) response into a stored reply.
    async fn finish(
        &self,
        name: &str,
        model: &str,
        attempt: u32,
        response: &UpstreamResponse,
    ) -> ReplyOutcome {
        match parse_reply(response) {
            Ok(reply) => {
                let token_delta = self.store.append(name, reply, model).await;
                tracing::info!(conversation = %name, attempt, token_delta, "Replied to conversation");
                ReplyOutcome::Succeeded {
                    attempts: attempt,
                    token_delta,
                }
            }
            Err(e) => {
                tracing::warn!(
                    conversation = %name,
                    status = response.status,
                    error = %e,
                    "API response had no usable reply"
                );
                self.fail(
                    name,
                    format!(
                        "Uh oh! A JSON error occurred: {e}. Status: {}, Text: {}.",
                        response.status, response.body
                    ),
                )
                .await;
                ReplyOutcome::Failed {
                    attempts: attempt,
                    reason: FailureReason::Malformed,
                }
            }
        }
    }

    async fn fail(&self, name: &str, content: String) {
        self.note(name, self.store.record_failure(name, content).await);
    }

    /// The conversation may be cleared while a request is in flight.
    fn note(&self, name: &str, result: Result<()>) {
        if let Err(e) = result {
            tracing::debug!(conversation = %name, error = %e, "Conversation gone during API request");
        }
    }
}
