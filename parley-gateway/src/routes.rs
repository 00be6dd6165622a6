//! Route definitions for Parley Gateway.
//!
//! Every conversation route sits behind the shared password segment. A wrong
//! password gets the same neutral landing response as `/`, and every mutating
//! route answers with a redirect back to the conversation view.

use axum::{
    extract::{Form, Path, State},
    middleware,
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use parley_common::Config;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::conversation::{
    ApiResponseSummary, Conversation, ConversationStore, Message, Role, TruncateSide,
};
use crate::orchestrator::{ReplyOrchestrator, RetryPolicy};
use crate::rate_limit::{rate_limit_middleware, RateLimitIntervals, RateLimiter};
use crate::tokenizer::TokenCounter;
use crate::upstream::UpstreamClient;

/// Upper bound on a form body; generous for percent-encoded multibyte content.
const MAX_FORM_BYTES: usize = 256 * 1024;

const SERVICE_NAME: &str = "parley-gateway";

/// Characters escaped when a decoded path segment is put back into a URL.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

// ============================================================================
// State
// ============================================================================

/// Request-independent settings the handlers need.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub password: Option<String>,
    pub default_model: String,
    pub max_content_chars: usize,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            password: config.auth.password.clone(),
            default_model: config.sessions.default_model.clone(),
            max_content_chars: config.sessions.max_content_chars,
        }
    }

    fn admits(&self, password: &str) -> bool {
        self.password.as_deref() == Some(password)
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConversationStore>,
    pub orchestrator: Arc<ReplyOrchestrator>,
    pub limiter: Arc<RateLimiter>,
    pub settings: Arc<GatewaySettings>,
}

impl AppState {
    /// Wire the store, limiter, and orchestrator from configuration.
    pub fn new(
        config: &Config,
        client: Arc<dyn UpstreamClient>,
        tokenizer: Arc<dyn TokenCounter>,
    ) -> Self {
        let store = Arc::new(ConversationStore::new(
            tokenizer,
            config.sessions.max_truncate,
        ));
        let orchestrator = Arc::new(ReplyOrchestrator::new(
            Arc::clone(&store),
            client,
            RetryPolicy::from(&config.retry),
        ));
        let limiter = Arc::new(RateLimiter::new(RateLimitIntervals::from(
            &config.rate_limit,
        )));

        Self {
            store,
            orchestrator,
            limiter,
            settings: Arc::new(GatewaySettings::from_config(config)),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

/// Answer for `/` and for any request with the wrong password.
#[derive(Debug, Serialize, Deserialize)]
pub struct LandingResponse {
    pub status: String,
    pub service: String,
}

/// A conversation, newest message first.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationView {
    pub conversation: String,
    pub found: bool,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_model: Option<String>,
    pub token_count: usize,
}

impl ConversationView {
    fn render(name: &str, conversation: Option<Conversation>) -> Self {
        match conversation {
            Some(conversation) => Self {
                conversation: name.to_string(),
                found: true,
                messages: conversation.messages.iter().rev().cloned().collect(),
                last_model: Some(conversation.last_model),
                token_count: conversation.token_count,
            },
            None => Self {
                conversation: name.to_string(),
                found: false,
                messages: Vec::new(),
                last_model: None,
                token_count: 0,
            },
        }
    }
}

/// Diagnostics for one conversation.
#[derive(Debug, Serialize)]
pub struct DebugView {
    pub conversation: String,
    pub found: bool,
    #[serde(flatten)]
    pub details: Option<DebugDetails>,
}

#[derive(Debug, Serialize)]
pub struct DebugDetails {
    pub total_messages: usize,
    pub user_messages: usize,
    pub system_messages: usize,
    pub assistant_messages: usize,
    pub error_messages: usize,
    pub last_model: String,
    pub token_count: usize,
    pub last_token_count: usize,
    pub last_updated: DateTime<Utc>,
    /// Serialized size in bytes
    pub approximate_size: usize,
    pub last_api_request_attempts: u32,
    pub last_api_request: Option<serde_json::Value>,
    pub last_api_response: Option<ApiResponseSummary>,
}

impl From<&Conversation> for DebugDetails {
    fn from(conversation: &Conversation) -> Self {
        Self {
            total_messages: conversation.messages.len(),
            user_messages: conversation.count_role(Role::User),
            system_messages: conversation.count_role(Role::System),
            assistant_messages: conversation.count_role(Role::Assistant),
            error_messages: conversation.count_role(Role::Error),
            last_model: conversation.last_model.clone(),
            token_count: conversation.token_count,
            last_token_count: conversation.last_token_count,
            last_updated: conversation.last_updated,
            approximate_size: conversation.approximate_size(),
            last_api_request_attempts: conversation.last_api_request_attempts,
            last_api_request: conversation.last_api_request.clone(),
            last_api_response: conversation.last_api_response.clone(),
        }
    }
}

fn landing() -> Response {
    Json(LandingResponse {
        status: "ok".into(),
        service: SERVICE_NAME.into(),
    })
    .into_response()
}

/// Path of a conversation view, with both segments re-encoded.
fn view_path(password: &str, conversation: &str) -> String {
    format!(
        "/{}/{}",
        utf8_percent_encode(password, PATH_SEGMENT),
        utf8_percent_encode(conversation, PATH_SEGMENT)
    )
}

fn back_to(password: &str, conversation: &str) -> Response {
    Redirect::to(&view_path(password, conversation)).into_response()
}

// ============================================================================
// Message Form
// ============================================================================

/// Fields of the message form. Everything is optional so that a bad
/// submission becomes a redirect rather than an extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct MessageForm {
    pub content: Option<String>,
    pub role: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<String>,
    #[serde(rename = "expect-response")]
    pub expect_response: Option<String>,
}

/// A submission that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidMessage {
    pub message: Message,
    pub model: String,
    pub temperature: f64,
    pub expect_response: bool,
}

impl MessageForm {
    /// Check the form, returning why it was rejected on failure.
    pub fn validate(self, settings: &GatewaySettings) -> Result<ValidMessage, String> {
        let temperature = match self.temperature.as_deref().map(str::trim) {
            None | Some("") => 1.0,
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| format!("temperature '{raw}' is not a number"))?,
        };
        if !(0.0..=2.0).contains(&temperature) {
            return Err(format!("temperature {temperature} is outside 0..=2"));
        }

        let role = match self.role.as_deref().map(str::trim) {
            None | Some("") => Role::User,
            Some(raw) => raw.parse::<Role>()?,
        };
        if !role.is_client_authored() {
            return Err(format!("role '{role}' cannot be submitted"));
        }

        let content = self.content.as_deref().map(str::trim).unwrap_or_default();
        let chars = content.chars().count();
        if chars == 0 || chars > settings.max_content_chars {
            return Err(format!(
                "content length {chars} is outside 1..={}",
                settings.max_content_chars
            ));
        }

        let model = match self.model.as_deref().map(str::trim) {
            None | Some("") => settings.default_model.clone(),
            Some(model) => model.to_string(),
        };

        Ok(ValidMessage {
            message: Message::new(role, content),
            model,
            temperature,
            expect_response: self.expect_response.is_some_and(|v| !v.is_empty()),
        })
    }
}

// ============================================================================
// Router
// ============================================================================

/// Build the complete router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing_handler))
        .route("/health", get(health_handler))
        .route("/:password/:conversation", get(view_handler))
        .route("/:password/:conversation/message", post(message_handler))
        .route(
            "/:password/:conversation/pop/:side/:count",
            get(pop_handler),
        )
        .route("/:password/:conversation/clear", get(clear_handler))
        .route("/:password/:conversation/debug", get(debug_handler))
        .layer(RequestBodyLimitLayer::new(MAX_FORM_BYTES))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            rate_limit_middleware,
        ))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn landing_handler() -> Response {
    landing()
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: SERVICE_NAME.into(),
    })
}

async fn view_handler(
    State(state): State<AppState>,
    Path((password, conversation)): Path<(String, String)>,
) -> Response {
    if !state.settings.admits(&password) {
        return landing();
    }

    let snapshot = state.store.snapshot(&conversation).await.ok();
    Json(ConversationView::render(&conversation, snapshot)).into_response()
}

async fn message_handler(
    State(state): State<AppState>,
    Path((password, conversation)): Path<(String, String)>,
    Form(form): Form<MessageForm>,
) -> Response {
    if !state.settings.admits(&password) {
        return landing();
    }

    let submission = match form.validate(&state.settings) {
        Ok(submission) => submission,
        Err(reason) => {
            tracing::debug!(conversation = %conversation, reason = %reason, "Rejected message");
            return back_to(&password, &conversation);
        }
    };

    let role = submission.message.role;
    let tokens = state
        .store
        .append(&conversation, submission.message, &submission.model)
        .await;
    tracing::info!(conversation = %conversation, role = %role, tokens, "Message added");

    if submission.expect_response {
        if let Err(e) = state
            .orchestrator
            .request_reply(&conversation, &submission.model, submission.temperature)
            .await
        {
            tracing::debug!(conversation = %conversation, error = %e, "Conversation cleared before reply");
        }
    }

    back_to(&password, &conversation)
}

async fn pop_handler(
    State(state): State<AppState>,
    Path((password, conversation, side, count)): Path<(String, String, String, String)>,
) -> Response {
    if !state.settings.admits(&password) {
        return landing();
    }

    let (Ok(side), Ok(count)) = (side.parse::<TruncateSide>(), count.parse::<usize>()) else {
        return back_to(&password, &conversation);
    };

    let removed = state.store.truncate(&conversation, side, count).await;
    tracing::info!(conversation = %conversation, ?side, removed, "Messages popped");

    back_to(&password, &conversation)
}

async fn clear_handler(
    State(state): State<AppState>,
    Path((password, conversation)): Path<(String, String)>,
) -> Response {
    if !state.settings.admits(&password) {
        return landing();
    }

    if state.store.clear(&conversation).await {
        tracing::info!(conversation = %conversation, "Conversation cleared");
    }

    back_to(&password, &conversation)
}

async fn debug_handler(
    State(state): State<AppState>,
    Path((password, conversation)): Path<(String, String)>,
) -> Response {
    if !state.settings.admits(&password) {
        return landing();
    }

    let details = state
        .store
        .snapshot(&conversation)
        .await
        .ok()
        .map(|snapshot| DebugDetails::from(&snapshot));

    Json(DebugView {
        conversation,
        found: details.is_some(),
        details,
    })
    .into_response()
}
