//! Parley Gateway - Password-gated conversation sessions over a chat-completion API.
//!
//! This crate provides the gateway service:
//! - In-memory conversation store with token bookkeeping
//! - Retried upstream replies with throttling backoff
//! - Per-client rate limiting
//! - Background reaping of dormant conversations
//!
//! ## Architecture
//!
//! ```text
//! Client → Gateway (rate limit → password) → Store
//!                                     ↓
//!                    Orchestrator → Upstream API
//!                                     ↓
//!                       Reaper (periodic sweep)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod conversation;
pub mod orchestrator;
pub mod rate_limit;
pub mod reaper;
pub mod routes;
pub mod tokenizer;
pub mod upstream;

pub use conversation::{Conversation, ConversationStore, Message, Role, TruncateSide};
pub use orchestrator::{FailureReason, ReplyOrchestrator, ReplyOutcome, RetryPolicy};
pub use rate_limit::{EndpointClass, RateLimitIntervals, RateLimiter};
pub use reaper::{Reaper, ReaperConfig, SweepReport};
pub use routes::{build_router, AppState};
pub use tokenizer::{ApproximateCounter, TiktokenCounter, TokenCounter};
pub use upstream::{HttpUpstream, UpstreamClient};

use parley_common::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Start the gateway server and run until Ctrl-C.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.network.host.parse::<std::net::IpAddr>()?,
        config.network.port,
    ));

    let client = Arc::new(HttpUpstream::from_config(&config.upstream)?);
    let state = AppState::new(config, client, Arc::new(TiktokenCounter::new()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = Reaper::new(
        Arc::clone(&state.store),
        ReaperConfig::from_config(&config.sessions, &config.rate_limit),
    )
    .with_limiter(Arc::clone(&state.limiter))
    .spawn(shutdown_rx);

    let router = build_router(state);

    tracing::info!("Starting Parley Gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
    })
    .await?;

    shutdown_tx.send(true).ok();
    reaper.await?;

    Ok(())
}
