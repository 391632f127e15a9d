use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::ScanConfig;
use crate::db::Message;
use crate::web::metrics::Metrics;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient platform failure: {0}")]
    Transient(String),
    #[error("platform failure: {0}")]
    Fatal(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionSummary {
    pub symbol: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformMessage {
    pub id: i64,
    pub channel_id: i64,
    pub author_id: i64,
    pub author_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub reactions: Vec<ReactionSummary>,
}

impl PlatformMessage {
    pub fn to_message(&self, community_id: i64) -> Message {
        Message {
            id: self.id,
            channel_id: self.channel_id,
            community_id,
            author_id: self.author_id,
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChannel {
    pub id: i64,
    pub community_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccurrenceKind {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionOccurrence {
    pub community_id: i64,
    pub channel_id: i64,
    pub message_id: i64,
    pub voter_id: i64,
    pub voter_name: Option<String>,
    pub symbol: String,
    pub kind: OccurrenceKind,
    pub observed_at: DateTime<Utc>,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn fetch_message(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<PlatformMessage, PlatformError>;

    /// Messages strictly after `after` (or from the start of the channel) and
    /// created before `before`, oldest first, at most `limit` of them.
    async fn fetch_history_page(
        &self,
        channel_id: i64,
        after: Option<i64>,
        before: DateTime<Utc>,
        limit: u8,
    ) -> Result<Vec<PlatformMessage>, PlatformError>;

    async fn list_reactors(
        &self,
        channel_id: i64,
        message_id: i64,
        symbol: &str,
    ) -> Result<Vec<i64>, PlatformError>;

    async fn fetch_user_name(&self, user_id: i64) -> Result<String, PlatformError>;

    async fn list_text_channels(&self, community_id: i64)
    -> Result<Vec<TextChannel>, PlatformError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ScanConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            initial_delay: Duration::from_millis(config.retry_initial_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "platform call failed, retrying what={} attempt={} delay_ms={} error={}",
                        what,
                        attempt,
                        delay.as_millis(),
                        err
                    );
                    Metrics::platform_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{BTreeMap, HashMap};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use parking_lot::Mutex;

    use super::{Platform, PlatformError, PlatformMessage, ReactionSummary, TextChannel};

    type PageHook = Box<dyn FnMut(usize) + Send>;

    #[derive(Default)]
    pub(crate) struct FakePlatform {
        channels: Mutex<BTreeMap<i64, BTreeMap<i64, PlatformMessage>>>,
        reactors: Mutex<HashMap<(i64, String), Vec<i64>>>,
        names: Mutex<HashMap<i64, String>>,
        communities: Mutex<HashMap<i64, Vec<TextChannel>>>,
        transient_history_failures: Mutex<usize>,
        failing_channels: Mutex<Vec<i64>>,
        history_calls: Mutex<usize>,
        message_fetches: Mutex<usize>,
        page_hook: Mutex<Option<PageHook>>,
    }

    pub(crate) fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    impl FakePlatform {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn add_channel(&self, community_id: i64, channel_id: i64) {
            self.communities
                .lock()
                .entry(community_id)
                .or_default()
                .push(TextChannel {
                    id: channel_id,
                    community_id,
                    name: format!("channel-{channel_id}"),
                });
            self.channels.lock().entry(channel_id).or_default();
        }

        /// Posts a message whose timestamp is `id` minutes past the epoch used by [`at`].
        pub(crate) fn post(&self, channel_id: i64, id: i64, author_id: i64) {
            let message = PlatformMessage {
                id,
                channel_id,
                author_id,
                author_name: format!("user-{author_id}"),
                content: format!("content {id}"),
                created_at: at(id),
                reactions: Vec::new(),
            };
            self.channels
                .lock()
                .entry(channel_id)
                .or_default()
                .insert(id, message);
        }

        pub(crate) fn react(&self, channel_id: i64, message_id: i64, symbol: &str, user_id: i64) {
            let mut reactors = self.reactors.lock();
            let users = reactors
                .entry((message_id, symbol.to_string()))
                .or_default();
            if !users.contains(&user_id) {
                users.push(user_id);
            }
            let count = users.len() as u64;
            drop(reactors);
            self.set_reaction_count(channel_id, message_id, symbol, count);
        }

        pub(crate) fn unreact(&self, channel_id: i64, message_id: i64, symbol: &str, user_id: i64) {
            let mut reactors = self.reactors.lock();
            let users = reactors
                .entry((message_id, symbol.to_string()))
                .or_default();
            users.retain(|u| *u != user_id);
            let count = users.len() as u64;
            drop(reactors);
            self.set_reaction_count(channel_id, message_id, symbol, count);
        }

        pub(crate) fn delete_message(&self, channel_id: i64, message_id: i64) {
            if let Some(messages) = self.channels.lock().get_mut(&channel_id) {
                messages.remove(&message_id);
            }
        }

        pub(crate) fn set_name(&self, user_id: i64, name: &str) {
            self.names.lock().insert(user_id, name.to_string());
        }

        pub(crate) fn fail_history_transiently(&self, times: usize) {
            *self.transient_history_failures.lock() = times;
        }

        pub(crate) fn fail_channel(&self, channel_id: i64) {
            self.failing_channels.lock().push(channel_id);
        }

        pub(crate) fn on_page(&self, hook: impl FnMut(usize) + Send + 'static) {
            *self.page_hook.lock() = Some(Box::new(hook));
        }

        pub(crate) fn history_calls(&self) -> usize {
            *self.history_calls.lock()
        }

        pub(crate) fn message_fetches(&self) -> usize {
            *self.message_fetches.lock()
        }

        fn set_reaction_count(&self, channel_id: i64, message_id: i64, symbol: &str, count: u64) {
            let mut channels = self.channels.lock();
            let Some(message) = channels
                .get_mut(&channel_id)
                .and_then(|messages| messages.get_mut(&message_id))
            else {
                return;
            };
            message.reactions.retain(|r| r.symbol != symbol);
            if count > 0 {
                message.reactions.push(ReactionSummary {
                    symbol: symbol.to_string(),
                    count,
                });
            }
        }
    }

    #[async_trait]
    impl Platform for FakePlatform {
        async fn fetch_message(
            &self,
            channel_id: i64,
            message_id: i64,
        ) -> Result<PlatformMessage, PlatformError> {
            *self.message_fetches.lock() += 1;
            self.channels
                .lock()
                .get(&channel_id)
                .and_then(|messages| messages.get(&message_id))
                .cloned()
                .ok_or_else(|| PlatformError::NotFound(format!("message {message_id}")))
        }

        async fn fetch_history_page(
            &self,
            channel_id: i64,
            after: Option<i64>,
            before: DateTime<Utc>,
            limit: u8,
        ) -> Result<Vec<PlatformMessage>, PlatformError> {
            let call = {
                let mut calls = self.history_calls.lock();
                *calls += 1;
                *calls
            };
            if let Some(hook) = self.page_hook.lock().as_mut() {
                hook(call);
            }

            {
                let mut failures = self.transient_history_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(PlatformError::Transient("rate limited".to_string()));
                }
            }
            if self.failing_channels.lock().contains(&channel_id) {
                return Err(PlatformError::Fatal(format!("channel {channel_id} unreadable")));
            }

            let channels = self.channels.lock();
            let Some(messages) = channels.get(&channel_id) else {
                return Err(PlatformError::NotFound(format!("channel {channel_id}")));
            };
            Ok(messages
                .values()
                .filter(|m| after.is_none_or(|after| m.id > after))
                .filter(|m| m.created_at < before)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn list_reactors(
            &self,
            _channel_id: i64,
            message_id: i64,
            symbol: &str,
        ) -> Result<Vec<i64>, PlatformError> {
            Ok(self
                .reactors
                .lock()
                .get(&(message_id, symbol.to_string()))
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_user_name(&self, user_id: i64) -> Result<String, PlatformError> {
            self.names
                .lock()
                .get(&user_id)
                .cloned()
                .ok_or_else(|| PlatformError::NotFound(format!("user {user_id}")))
        }

        async fn list_text_channels(
            &self,
            community_id: i64,
        ) -> Result<Vec<TextChannel>, PlatformError> {
            Ok(self
                .communities
                .lock()
                .get(&community_id)
                .cloned()
                .unwrap_or_default())
        }
    }
}
