//! Background sweep of idle conversations and stale rate-limit entries.

use chrono::{DateTime, Utc};
use parley_common::{RateLimitConfig, SessionsConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::conversation::ConversationStore;
use crate::rate_limit::RateLimiter;

/// Sweep schedule and thresholds.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub dormant_after: Duration,
    pub max_messages: usize,
    /// Rate-limit fingerprints idle longer than this are forgotten
    pub stale_after: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self::from_config(&SessionsConfig::default(), &RateLimitConfig::default())
    }
}

impl ReaperConfig {
    pub fn from_config(sessions: &SessionsConfig, rate_limit: &RateLimitConfig) -> Self {
        Self {
            interval: Duration::from_secs(sessions.sweep_interval_secs.max(1)),
            dormant_after: Duration::from_secs(sessions.dormant_after_secs),
            max_messages: sessions.max_messages,
            stale_after: Duration::from_secs(rate_limit.stale_after_secs),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    pub trimmed_messages: usize,
    pub pruned_fingerprints: usize,
}

pub struct Reaper {
    store: Arc<ConversationStore>,
    limiter: Option<Arc<RateLimiter>>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(store: Arc<ConversationStore>, config: ReaperConfig) -> Self {
        Self {
            store,
            limiter: None,
            config,
        }
    }

    /// Also prune the rate limiter's fingerprints on every sweep.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let dormant_after = chrono::Duration::from_std(self.config.dormant_after)
            .unwrap_or_else(|_| chrono::Duration::weeks(52_000));
        let outcome = self
            .store
            .sweep(now, dormant_after, self.config.max_messages)
            .await;

        for name in &outcome.evicted {
            tracing::info!(conversation = %name, "Deleted dormant conversation");
        }

        let pruned_fingerprints = match &self.limiter {
            Some(limiter) => limiter.prune(self.config.stale_after).await,
            None => 0,
        };

        if outcome.trimmed_messages > 0 || pruned_fingerprints > 0 {
            tracing::debug!(
                trimmed_messages = outcome.trimmed_messages,
                pruned_fingerprints,
                "Sweep trimmed state"
            );
        }

        SweepReport {
            evicted: outcome.evicted,
            trimmed_messages: outcome.trimmed_messages,
            pruned_fingerprints,
        }
    }

    /// Run sweeps until `shutdown` turns true or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("Reaper stopped");
        })
    }
}
