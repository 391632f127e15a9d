use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::DatabaseError;
use super::models::{
    FanHaterEntry, LeaderboardEntry, LedgerTransaction, MemberScore, Message, MessageScore,
    ReasonTotals, RecomputeReport, ScanWatermark, User, VoteChange, VoteDirection, VoteSymbols,
};

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_or_create_user(&self, id: i64) -> Result<User, DatabaseError>;
    async fn get_user(&self, id: i64) -> Result<Option<User>, DatabaseError>;
    async fn update_display_name(&self, id: i64, display_name: &str) -> Result<(), DatabaseError>;
    async fn list_users(&self) -> Result<Vec<User>, DatabaseError>;
    async fn adjust_offset(&self, id: i64, delta: i64, reason: &str) -> Result<i64, DatabaseError>;
    async fn list_transactions(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, DatabaseError>;
    async fn transaction_totals(&self, user_id: i64) -> Result<Vec<ReasonTotals>, DatabaseError>;
    async fn restore_offsets(&self) -> Result<usize, DatabaseError>;
    /// Puts every offset back to the default and clears the transaction log.
    async fn reset_offsets(&self) -> Result<usize, DatabaseError>;
}

#[async_trait]
pub trait VoteStore: Send + Sync {
    async fn apply_vote(
        &self,
        voter_id: i64,
        message_id: i64,
        direction: VoteDirection,
        author_id: i64,
        at: DateTime<Utc>,
    ) -> Result<VoteChange, DatabaseError>;
    async fn retract_vote(
        &self,
        voter_id: i64,
        message_id: i64,
        direction: VoteDirection,
        author_id: i64,
    ) -> Result<VoteChange, DatabaseError>;
    async fn count_votes(&self) -> Result<i64, DatabaseError>;
    async fn recompute_aggregates(&self) -> Result<RecomputeReport, DatabaseError>;
    /// Drops users, votes and fan/hater counters. Messages, settings, scan
    /// watermarks and the transaction log survive.
    async fn reset_ledger(&self) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// First write wins. Returns true when a new row was inserted.
    async fn record_message(&self, message: &Message) -> Result<bool, DatabaseError>;
    async fn get_message(&self, id: i64) -> Result<Option<Message>, DatabaseError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn vote_symbols(&self, community_id: i64) -> Result<VoteSymbols, DatabaseError>;
    async fn set_vote_symbols(
        &self,
        community_id: i64,
        upvote: &str,
        downvote: &str,
    ) -> Result<VoteSymbols, DatabaseError>;
    async fn list_communities(&self) -> Result<Vec<i64>, DatabaseError>;
    async fn watermark(&self, channel_id: i64) -> Result<Option<ScanWatermark>, DatabaseError>;
    /// Moves the channel watermark forward; an older message id is ignored.
    async fn advance_watermark(
        &self,
        channel_id: i64,
        community_id: i64,
        message_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
    async fn clear_watermarks(&self) -> Result<usize, DatabaseError>;
}

#[async_trait]
pub trait QueryStore: Send + Sync {
    /// With a community, only users who authored or voted on its messages.
    async fn leaderboard(
        &self,
        community_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<LeaderboardEntry>, DatabaseError>;
    async fn fans_of(&self, user_id: i64, limit: i64) -> Result<Vec<FanHaterEntry>, DatabaseError>;
    async fn haters_of(&self, user_id: i64, limit: i64)
    -> Result<Vec<FanHaterEntry>, DatabaseError>;
    async fn best_messages_of(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError>;
    async fn worst_messages_of(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError>;
    async fn top_messages(
        &self,
        community_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError>;
    async fn members_in_window(
        &self,
        community_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MemberScore>, DatabaseError>;
    async fn messages_in_window(
        &self,
        community_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError>;
}
