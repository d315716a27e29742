use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};

/// Generations a single caller may start inside one window.
pub const RATE_LIMIT_MAX_COUNT: usize = 10;

/// Sliding-window length.
pub fn rate_limit_window() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { message: String },
}

/// Quota tracking behind a trait so deployments with more than one server
/// instance can substitute an implementation backed by a shared store.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, fingerprint: &str) -> RateLimitDecision;
    async fn record_usage(&self, fingerprint: &str);
}

/// In-process sliding window keyed by caller fingerprint.
///
/// The outer map lock is only held to locate or insert a slot; the
/// per-fingerprint mutex serializes check/record for one caller without
/// blocking the others. State lives for the process lifetime.
pub struct SlidingWindowRateLimiter {
    max_count: usize,
    window: Duration,
    records: RwLock<HashMap<String, Arc<Mutex<Vec<DateTime<Utc>>>>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(max_count: usize, window: Duration) -> Self {
        Self {
            max_count,
            window,
            records: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, fingerprint: &str) -> Arc<Mutex<Vec<DateTime<Utc>>>> {
        {
            let records = self.records.read().await;
            if let Some(slot) = records.get(fingerprint) {
                return Arc::clone(slot);
            }
        }

        let mut records = self.records.write().await;
        Arc::clone(records.entry(fingerprint.to_string()).or_default())
    }

    /// Prunes expired timestamps, then decides. Timestamps are appended in
    /// order, so after pruning the first element is the oldest retained one.
    pub async fn check_at(&self, fingerprint: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let slot = self.slot(fingerprint).await;
        let mut timestamps = slot.lock().await;

        timestamps.retain(|recorded| now - *recorded < self.window);

        if timestamps.len() >= self.max_count {
            if let Some(oldest) = timestamps.first() {
                let remaining = self.window - (now - *oldest);
                return RateLimitDecision::Limited {
                    message: remaining_quota_message(remaining),
                };
            }
        }

        RateLimitDecision::Allowed
    }

    pub async fn record_usage_at(&self, fingerprint: &str, now: DateTime<Utc>) {
        let slot = self.slot(fingerprint).await;
        slot.lock().await.push(now);
    }
}

impl Default for SlidingWindowRateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_MAX_COUNT, rate_limit_window())
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn check(&self, fingerprint: &str) -> RateLimitDecision {
        self.check_at(fingerprint, Utc::now()).await
    }

    async fn record_usage(&self, fingerprint: &str) {
        self.record_usage_at(fingerprint, Utc::now()).await;
    }
}

/// Renders the Polish limit warning. Hours and minutes are floored, seconds
/// ceiled; a zero component is omitted. Each unit is declined by the last
/// digit of its value: 1 takes the "-ę" form, 2 through 4 the "-y" form,
/// anything else the bare base.
fn remaining_quota_message(remaining: Duration) -> String {
    let total_ms = remaining.num_milliseconds().max(0);
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000 + 999) / 1000;

    let mut message =
        String::from("Przekroczyłeś limit zapytań, kolejne pytanie będziesz mógł zadać za");
    for label in [
        time_label(hours, "godzin"),
        time_label(minutes, "minut"),
        time_label(seconds, "sekund"),
    ]
    .into_iter()
    .flatten()
    {
        message.push(' ');
        message.push_str(&label);
    }
    message.push('.');

    message
}

fn time_label(value: i64, word_base: &str) -> Option<String> {
    if value == 0 {
        return None;
    }

    let suffix = match value % 10 {
        1 => "ę",
        2..=4 => "y",
        _ => "",
    };

    Some(format!("{value} {word_base}{suffix}"))
}
