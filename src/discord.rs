use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    ChannelId, ChannelType, Client as SerenityClient, Context as SerenityContext,
    EventHandler as SerenityEventHandler, GatewayIntents, GetMessages, GuildId, Http,
    Message as SerenityMessage, MessageId, Reaction, ReactionType, Ready, User as SerenityUser,
    UserId,
};
use serenity::http::HttpError;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, error, info};

use crate::ledger::EventIngest;
use crate::platform::{
    OccurrenceKind, Platform, PlatformError, PlatformMessage, ReactionOccurrence,
    ReactionSummary, TextChannel,
};

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const READY_TIMEOUT_SECONDS: u64 = 30;
const REACTORS_PAGE_SIZE: u8 = 100;

/// Milliseconds between the Unix epoch and the first Discord snowflake.
pub const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

pub fn snowflake_to_datetime(id: i64) -> Option<DateTime<Utc>> {
    let id = u64::try_from(id).ok()?;
    let ms = i64::try_from(id >> 22).ok()? + DISCORD_EPOCH_MS;
    DateTime::from_timestamp_millis(ms)
}

/// Smallest snowflake that could have been created at `at`.
pub fn datetime_to_snowflake(at: DateTime<Utc>) -> i64 {
    let ms = (at.timestamp_millis() - DISCORD_EPOCH_MS).max(0);
    ms << 22
}

fn to_snowflake(id: i64, what: &str) -> Result<u64, PlatformError> {
    u64::try_from(id)
        .ok()
        .filter(|v| *v != 0)
        .ok_or_else(|| PlatformError::NotFound(format!("invalid {} id {}", what, id)))
}

fn to_i64(id: u64) -> i64 {
    id as i64
}

fn classify(err: serenity::Error, what: String) -> PlatformError {
    match &err {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => {
            let status = response.status_code.as_u16();
            match status {
                404 => PlatformError::NotFound(what),
                429 | 500..=599 => PlatformError::Transient(format!("{what}: http {status}")),
                _ => PlatformError::Fatal(format!("{what}: {err}")),
            }
        }
        serenity::Error::Http(HttpError::Request(_)) => {
            PlatformError::Transient(format!("{what}: {err}"))
        }
        _ => PlatformError::Fatal(format!("{what}: {err}")),
    }
}

fn user_display_name(user: &SerenityUser) -> String {
    user.global_name.clone().unwrap_or_else(|| user.name.clone())
}

fn convert_message(message: &SerenityMessage) -> Result<PlatformMessage, PlatformError> {
    let id = to_i64(message.id.get());
    let created_at = snowflake_to_datetime(id)
        .ok_or_else(|| PlatformError::Fatal(format!("message {} has no valid timestamp", id)))?;

    Ok(PlatformMessage {
        id,
        channel_id: to_i64(message.channel_id.get()),
        author_id: to_i64(message.author.id.get()),
        author_name: user_display_name(&message.author),
        content: message.content.clone(),
        created_at,
        reactions: message
            .reactions
            .iter()
            .map(|reaction| ReactionSummary {
                symbol: reaction.reaction_type.to_string(),
                count: reaction.count,
            })
            .collect(),
    })
}

pub struct DiscordPlatform {
    http: Arc<Http>,
}

impl DiscordPlatform {
    pub fn new(token: &str) -> Self {
        Self {
            http: Arc::new(Http::new(token)),
        }
    }
}

#[async_trait]
impl Platform for DiscordPlatform {
    async fn fetch_message(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<PlatformMessage, PlatformError> {
        let channel = ChannelId::new(to_snowflake(channel_id, "channel")?);
        let message_snowflake = MessageId::new(to_snowflake(message_id, "message")?);

        let message = channel
            .message(&*self.http, message_snowflake)
            .await
            .map_err(|err| classify(err, format!("message {message_id}")))?;
        convert_message(&message)
    }

    async fn fetch_history_page(
        &self,
        channel_id: i64,
        after: Option<i64>,
        before: DateTime<Utc>,
        limit: u8,
    ) -> Result<Vec<PlatformMessage>, PlatformError> {
        let channel = ChannelId::new(to_snowflake(channel_id, "channel")?);
        let after = MessageId::new(after.unwrap_or(0).max(1) as u64);
        let cutoff = datetime_to_snowflake(before);

        let messages = channel
            .messages(
                &*self.http,
                GetMessages::new().after(after).limit(limit.clamp(1, 100)),
            )
            .await
            .map_err(|err| classify(err, format!("channel {channel_id}")))?;

        let mut page = messages
            .iter()
            .filter(|message| to_i64(message.id.get()) < cutoff)
            .map(convert_message)
            .collect::<Result<Vec<_>, _>>()?;
        page.sort_by_key(|message| message.id);
        Ok(page)
    }

    async fn list_reactors(
        &self,
        channel_id: i64,
        message_id: i64,
        symbol: &str,
    ) -> Result<Vec<i64>, PlatformError> {
        let channel = ChannelId::new(to_snowflake(channel_id, "channel")?);
        let message = MessageId::new(to_snowflake(message_id, "message")?);
        let reaction = ReactionType::try_from(symbol)
            .map_err(|err| PlatformError::Fatal(format!("unusable symbol {symbol}: {err}")))?;

        let mut reactors = Vec::new();
        let mut after: Option<UserId> = None;
        loop {
            let users = channel
                .reaction_users(
                    &*self.http,
                    message,
                    reaction.clone(),
                    Some(REACTORS_PAGE_SIZE),
                    after,
                )
                .await
                .map_err(|err| classify(err, format!("reactions on message {message_id}")))?;

            let fetched = users.len();
            after = users.last().map(|user| user.id);
            reactors.extend(users.iter().map(|user| to_i64(user.id.get())));

            if fetched < REACTORS_PAGE_SIZE as usize {
                break;
            }
        }

        Ok(reactors)
    }

    async fn fetch_user_name(&self, user_id: i64) -> Result<String, PlatformError> {
        let user = UserId::new(to_snowflake(user_id, "user")?)
            .to_user(&*self.http)
            .await
            .map_err(|err| classify(err, format!("user {user_id}")))?;
        Ok(user_display_name(&user))
    }

    async fn list_text_channels(
        &self,
        community_id: i64,
    ) -> Result<Vec<TextChannel>, PlatformError> {
        let guild = GuildId::new(to_snowflake(community_id, "guild")?);
        let channels = guild
            .channels(&*self.http)
            .await
            .map_err(|err| classify(err, format!("guild {community_id}")))?;

        let mut text: Vec<_> = channels
            .into_values()
            .filter(|channel| matches!(channel.kind, ChannelType::Text | ChannelType::News))
            .collect();
        text.sort_by_key(|channel| (channel.position, channel.id));

        Ok(text
            .into_iter()
            .map(|channel| TextChannel {
                id: to_i64(channel.id.get()),
                community_id,
                name: channel.name,
            })
            .collect())
    }
}

fn reaction_occurrence(reaction: &Reaction, kind: OccurrenceKind) -> Option<ReactionOccurrence> {
    let community_id = reaction.guild_id?;
    let voter_id = reaction.user_id?;

    Some(ReactionOccurrence {
        community_id: to_i64(community_id.get()),
        channel_id: to_i64(reaction.channel_id.get()),
        message_id: to_i64(reaction.message_id.get()),
        voter_id: to_i64(voter_id.get()),
        voter_name: reaction
            .member
            .as_ref()
            .map(|member| member.display_name().to_string()),
        symbol: reaction.emoji.to_string(),
        kind,
        observed_at: Utc::now(),
    })
}

struct ReactionHandler {
    ready_sender: Arc<AsyncMutex<Option<oneshot::Sender<()>>>>,
    ingest: Arc<EventIngest>,
}

impl ReactionHandler {
    async fn forward(&self, reaction: Reaction, kind: OccurrenceKind) {
        match reaction_occurrence(&reaction, kind) {
            Some(occurrence) => self.ingest.process(occurrence).await,
            None => debug!(
                "ignoring reaction outside a guild message_id={}",
                reaction.message_id
            ),
        }
    }
}

#[serenity::async_trait]
impl SerenityEventHandler for ReactionHandler {
    async fn ready(&self, _ctx: SerenityContext, ready: Ready) {
        info!(
            "discord gateway ready as {} ({}) guilds={}",
            ready.user.name,
            ready.user.id,
            ready.guilds.len()
        );
        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }
    }

    async fn reaction_add(&self, _ctx: SerenityContext, reaction: Reaction) {
        self.forward(reaction, OccurrenceKind::Added).await;
    }

    async fn reaction_remove(&self, _ctx: SerenityContext, reaction: Reaction) {
        self.forward(reaction, OccurrenceKind::Removed).await;
    }
}

#[derive(Default)]
struct GatewayState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Clone)]
pub struct DiscordGateway {
    token: String,
    use_privileged_intents: bool,
    ingest: Arc<EventIngest>,
    state: Arc<AsyncMutex<GatewayState>>,
}

impl DiscordGateway {
    pub fn new(token: &str, use_privileged_intents: bool, ingest: Arc<EventIngest>) -> Self {
        Self {
            token: token.to_string(),
            use_privileged_intents,
            ingest,
            state: Arc::new(AsyncMutex::new(GatewayState::default())),
        }
    }

    fn intents(&self) -> GatewayIntents {
        if self.use_privileged_intents {
            GatewayIntents::all()
        } else {
            GatewayIntents::GUILDS | GatewayIntents::GUILD_MESSAGE_REACTIONS
        }
    }

    pub async fn login(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = ReactionHandler {
            ready_sender: Arc::new(AsyncMutex::new(Some(ready_tx))),
            ingest: self.ingest.clone(),
        };

        let mut client = SerenityClient::builder(&self.token, self.intents())
            .event_handler(handler)
            .await
            .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        let gateway_task = tokio::spawn(async move {
            if let Err(err) = client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
        });

        match tokio::time::timeout(Duration::from_secs(READY_TIMEOUT_SECONDS), ready_rx).await {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                info!("discord gateway connected, listening for reactions");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before receiving Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;

        loop {
            match self.login().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!(
                        "failed to start discord gateway: {err}. retrying in {} seconds",
                        retry_seconds
                    );
                    tokio::time::sleep(Duration::from_secs(retry_seconds)).await;
                    retry_seconds = (retry_seconds * 2).min(MAX_LOGIN_RETRY_SECONDS);
                }
            }
        }
    }

    /// Resolves when the gateway task ends. Returns immediately if never started.
    pub async fn wait(&self) {
        let task = self.state.lock().await.gateway_task.take();
        if let Some(task) = task {
            if let Err(join_err) = task.await {
                if !join_err.is_cancelled() {
                    error!("discord gateway task join error: {join_err}");
                }
            }
            self.state.lock().await.is_logged_in = false;
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.is_logged_in {
            return Ok(());
        }

        if let Some(gateway_task) = state.gateway_task.take() {
            gateway_task.abort();
            match gateway_task.await {
                Ok(()) => info!("discord gateway task exited"),
                Err(join_err) if join_err.is_cancelled() => {
                    info!("discord gateway task aborted")
                }
                Err(join_err) => {
                    error!("discord gateway task join error: {join_err}");
                }
            }
        }

        state.is_logged_in = false;
        info!("discord gateway stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use test_case::test_case;

    use super::{DISCORD_EPOCH_MS, datetime_to_snowflake, snowflake_to_datetime, to_snowflake};

    #[test]
    fn snowflake_timestamp_matches_known_message() {
        // Example id from the Discord developer docs.
        let at = snowflake_to_datetime(175_928_847_299_117_063).unwrap();
        assert_eq!(at, Utc.timestamp_millis_opt(1_462_015_105_796).unwrap());
    }

    #[test]
    fn datetime_round_trips_to_lowest_snowflake() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let id = datetime_to_snowflake(at);
        assert_eq!(id & ((1 << 22) - 1), 0);
        assert_eq!(snowflake_to_datetime(id), Some(at));
        assert!(datetime_to_snowflake(at) < datetime_to_snowflake(at + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn times_before_epoch_clamp_to_zero() {
        let early = Utc.timestamp_millis_opt(DISCORD_EPOCH_MS - 1_000).unwrap();
        assert_eq!(datetime_to_snowflake(early), 0);
    }

    #[test_case(0, false ; "zero")]
    #[test_case(-5, false ; "negative")]
    #[test_case(42, true ; "positive")]
    fn only_positive_ids_are_snowflakes(id: i64, ok: bool) {
        assert_eq!(to_snowflake(id, "test").is_ok(), ok);
    }
}
