//! Chat-completion upstream.
//!
//! The gateway talks to exactly one completion endpoint. This module defines
//! the request/response shapes of that contract, the [`UpstreamClient`] seam
//! the retry orchestrator drives, and the reply extraction rules.

mod client;

pub use client::HttpUpstream;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::conversation::{ApiResponseSummary, Message};

/// HTTP status the upstream uses to ask callers to back off.
pub const THROTTLED_STATUS: u16 = 429;

// ============================================================================
// Client Trait
// ============================================================================

/// Something that can deliver a completion request to the upstream.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send one request. A returned response may carry any status; only
    /// failing to obtain a response at all is an error.
    async fn complete(&self, request: &CompletionRequest) -> Result<UpstreamResponse, TransportError>;
}

/// The attempt never produced a response.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Request(String),
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of the completion POST.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f64,
    /// Conversation order, `error` messages already removed
    pub messages: Vec<Message>,
}

impl CompletionRequest {
    /// JSON form recorded in conversation diagnostics.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Raw upstream answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: String,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.status == THROTTLED_STATUS
    }

    pub fn summary(&self) -> ApiResponseSummary {
        ApiResponseSummary {
            status: Some(self.status),
            body: self.body.clone(),
        }
    }
}

// ============================================================================
// Reply Extraction
// ============================================================================

/// A completed response that does not contain a usable reply.
#[derive(Debug, Error)]
pub enum MalformedReply {
    #[error("body is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no reply message at choices[0].message")]
    MissingMessage,

    #[error("reply message has an unexpected shape: {0}")]
    Shape(String),
}

/// Extract `choices[0].message` from a response body.
///
/// The `error` role is reserved for failures the gateway records itself.
pub fn parse_reply(response: &UpstreamResponse) -> Result<Message, MalformedReply> {
    let body: serde_json::Value = serde_json::from_str(&response.body)?;

    let message = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or(MalformedReply::MissingMessage)?;

    let reply: Message =
        serde_json::from_value(message.clone()).map_err(|e| MalformedReply::Shape(e.to_string()))?;
    if !reply.role.is_client_authored() {
        return Err(MalformedReply::Shape(format!("reserved role '{}'", reply.role)));
    }
    Ok(reply)
}
