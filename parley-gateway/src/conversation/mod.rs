//! Conversation data model.
//!
//! A conversation is a named, ordered sequence of role-tagged messages plus
//! bookkeeping about tokens and the most recent upstream call. All live
//! conversations are owned by the [`ConversationStore`]; everything handed
//! out of it is a copy.

mod store;

pub use store::{ConversationStore, SweepOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Messages
// ============================================================================

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Assistant,
    /// Synthetic failure record. Never sent upstream.
    Error,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::Error => "error",
        }
    }

    /// Roles a client may author directly.
    pub fn is_client_authored(self) -> bool {
        !matches!(self, Self::Error)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            "assistant" => Ok(Self::Assistant),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A single message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }
}

// ============================================================================
// Truncation
// ============================================================================

/// Which end of the history a truncate removes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncateSide {
    /// Most recent messages
    Top,
    /// Oldest messages
    Bottom,
}

impl FromStr for TruncateSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top" => Ok(Self::Top),
            "bottom" => Ok(Self::Bottom),
            other => Err(format!("unknown side '{other}'")),
        }
    }
}

// ============================================================================
// Conversation
// ============================================================================

/// What the upstream said on the most recent attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponseSummary {
    /// HTTP status, absent when the attempt never got a response
    pub status: Option<u16>,
    /// Raw body, or the transport error text
    pub body: String,
}

/// Conversation state. Snapshots of this are what the store hands out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Oldest first
    pub messages: VecDeque<Message>,
    pub last_model: String,
    /// Running approximation; drifts after forced trims
    pub token_count: usize,
    pub last_token_count: usize,
    pub last_updated: DateTime<Utc>,
    pub last_api_request_attempts: u32,
    pub last_api_request: Option<serde_json::Value>,
    pub last_api_response: Option<ApiResponseSummary>,
}

impl Conversation {
    /// Fresh conversation with zeroed diagnostics.
    pub fn new(model: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            messages: VecDeque::new(),
            last_model: model.into(),
            token_count: 0,
            last_token_count: 0,
            last_updated: now,
            last_api_request_attempts: 0,
            last_api_request: None,
            last_api_response: None,
        }
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }

    /// Messages eligible to be sent upstream, in conversation order.
    pub fn outbound_messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::Error)
            .cloned()
            .collect()
    }

    /// Serialized size in bytes, a rough stand-in for memory usage.
    pub fn approximate_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}
