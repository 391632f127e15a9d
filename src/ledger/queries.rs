use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::{
    DatabaseError, DatabaseManager, FanHaterEntry, LeaderboardEntry, MemberScore, MessageScore,
    ReasonTotals, User,
};

pub const WEEK_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowWinners {
    pub since: DateTime<Utc>,
    pub member: Option<MemberScore>,
    pub message: Option<MessageScore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub user: User,
    pub score: i64,
    pub biggest_fan: Option<FanHaterEntry>,
    pub biggest_hater: Option<FanHaterEntry>,
    pub transactions: Vec<ReasonTotals>,
}

#[derive(Clone)]
pub struct QueryEngine {
    db: Arc<DatabaseManager>,
}

impl QueryEngine {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub async fn leaderboard(
        &self,
        community_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<LeaderboardEntry>, DatabaseError> {
        self.db.query_store().leaderboard(community_id, limit).await
    }

    pub async fn fans_of(&self, user_id: i64, limit: i64) -> Result<Vec<FanHaterEntry>, DatabaseError> {
        self.db.query_store().fans_of(user_id, limit).await
    }

    pub async fn haters_of(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<FanHaterEntry>, DatabaseError> {
        self.db.query_store().haters_of(user_id, limit).await
    }

    pub async fn best_messages_of(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError> {
        self.db.query_store().best_messages_of(user_id, limit).await
    }

    pub async fn worst_messages_of(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError> {
        self.db.query_store().worst_messages_of(user_id, limit).await
    }

    pub async fn top_messages(
        &self,
        community_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError> {
        self.db.query_store().top_messages(community_id, limit).await
    }

    /// Author with the highest net votes cast at or after `since`. A shared
    /// first place has no winner.
    pub async fn top_member_in_window(
        &self,
        community_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Option<MemberScore>, DatabaseError> {
        let ranked = self
            .db
            .query_store()
            .members_in_window(community_id, since, 2)
            .await?;
        Ok(sole_leader(ranked, |m| m.net_votes))
    }

    pub async fn top_message_in_window(
        &self,
        community_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Option<MessageScore>, DatabaseError> {
        let ranked = self
            .db
            .query_store()
            .messages_in_window(community_id, since, 2)
            .await?;
        Ok(sole_leader(ranked, |m| m.net_votes))
    }

    pub async fn top_in_window(
        &self,
        community_id: i64,
        since: DateTime<Utc>,
    ) -> Result<WindowWinners, DatabaseError> {
        Ok(WindowWinners {
            since,
            member: self.top_member_in_window(community_id, since).await?,
            message: self.top_message_in_window(community_id, since).await?,
        })
    }

    pub async fn of_the_week(
        &self,
        community_id: i64,
        now: DateTime<Utc>,
    ) -> Result<WindowWinners, DatabaseError> {
        self.top_in_window(community_id, now - Duration::days(WEEK_DAYS))
            .await
    }

    /// Unknown users get a default row, so every member has a profile.
    pub async fn user_summary(&self, user_id: i64) -> Result<UserSummary, DatabaseError> {
        let user = self.db.user_store().get_or_create_user(user_id).await?;

        let queries = self.db.query_store();
        let biggest_fan = queries.fans_of(user_id, 1).await?.into_iter().next();
        let biggest_hater = queries.haters_of(user_id, 1).await?.into_iter().next();
        let transactions = self.db.user_store().transaction_totals(user_id).await?;

        Ok(UserSummary {
            score: user.score(),
            user,
            biggest_fan,
            biggest_hater,
            transactions,
        })
    }
}

fn sole_leader<T>(ranked: Vec<T>, net: impl Fn(&T) -> i64) -> Option<T> {
    let mut ranked = ranked.into_iter();
    let first = ranked.next()?;
    match ranked.next() {
        Some(second) if net(&second) == net(&first) => None,
        _ => Some(first),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use test_case::test_case;

    use super::{QueryEngine, sole_leader};
    use crate::db::manager::test_support::temp_manager;
    use crate::db::{Message, VoteDirection};

    #[test_case(vec![], None ; "empty")]
    #[test_case(vec![5], Some(5) ; "single")]
    #[test_case(vec![5, 3], Some(5) ; "clear winner")]
    #[test_case(vec![4, 4], None ; "tie")]
    fn sole_leader_cases(values: Vec<i64>, expected: Option<i64>) {
        assert_eq!(sole_leader(values, |v| *v), expected);
    }

    #[tokio::test]
    async fn week_winners_only_count_recent_activity() {
        let (_file, db) = temp_manager().await;
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let old = now - Duration::days(30);
        let recent = now - Duration::days(1);

        for (id, author, created_at) in [(1, 10, old), (2, 20, recent), (3, 30, recent)] {
            db.message_store()
                .record_message(&Message {
                    id,
                    channel_id: 5,
                    community_id: 7,
                    author_id: author,
                    content: String::new(),
                    created_at,
                })
                .await
                .unwrap();
        }

        let votes = db.vote_store();
        for voter in [100, 101, 102] {
            votes.apply_vote(voter, 1, VoteDirection::Up, 10, old).await.unwrap();
        }
        votes.apply_vote(100, 2, VoteDirection::Up, 20, recent).await.unwrap();
        votes.apply_vote(101, 2, VoteDirection::Up, 20, recent).await.unwrap();
        votes.apply_vote(100, 3, VoteDirection::Up, 30, recent).await.unwrap();
        // A recent vote on an old message counts for the member, not the message.
        votes.apply_vote(103, 1, VoteDirection::Down, 10, recent).await.unwrap();

        let engine = QueryEngine::new(db.clone());
        let winners = engine.of_the_week(7, now).await.unwrap();
        assert_eq!(winners.member.map(|m| m.user_id), Some(20));
        assert_eq!(winners.message.map(|m| m.message_id), Some(2));

        let other = engine.of_the_week(8, now).await.unwrap();
        assert!(other.member.is_none());
        assert!(other.message.is_none());
    }

    #[tokio::test]
    async fn tied_week_has_no_winner() {
        let (_file, db) = temp_manager().await;
        let now = Utc::now();
        for (id, author) in [(1, 10), (2, 20)] {
            db.message_store()
                .record_message(&Message {
                    id,
                    channel_id: 5,
                    community_id: 7,
                    author_id: author,
                    content: String::new(),
                    created_at: now,
                })
                .await
                .unwrap();
            db.vote_store()
                .apply_vote(99, id, VoteDirection::Up, author, now)
                .await
                .unwrap();
        }

        let winners = QueryEngine::new(db).of_the_week(7, now).await.unwrap();
        assert!(winners.member.is_none());
        assert!(winners.message.is_none());
    }

    #[tokio::test]
    async fn summary_lists_fan_hater_and_transactions() {
        let (_file, db) = temp_manager().await;
        let votes = db.vote_store();
        votes.apply_vote(2, 100, VoteDirection::Up, 1, Utc::now()).await.unwrap();
        votes.apply_vote(2, 101, VoteDirection::Up, 1, Utc::now()).await.unwrap();
        votes.apply_vote(3, 100, VoteDirection::Down, 1, Utc::now()).await.unwrap();
        db.user_store().adjust_offset(1, -20, "gacha").await.unwrap();

        let engine = QueryEngine::new(db);
        let summary = engine.user_summary(1).await.unwrap();
        assert_eq!(summary.score, 81);
        assert_eq!(summary.biggest_fan.map(|f| f.user_id), Some(2));
        assert_eq!(summary.biggest_hater.map(|h| h.user_id), Some(3));
        assert_eq!(summary.transactions[0].lost, 20);

        let unknown = engine.user_summary(404).await.unwrap();
        assert_eq!(unknown.score, 100);
        assert!(unknown.biggest_fan.is_none());
        assert!(unknown.transactions.is_empty());
    }

    #[tokio::test]
    async fn community_leaderboard_only_lists_participants() {
        let (_file, db) = temp_manager().await;
        let now = Utc::now();
        for (id, author, community_id) in [(1, 10, 7), (2, 20, 8)] {
            db.message_store()
                .record_message(&Message {
                    id,
                    channel_id: 5,
                    community_id,
                    author_id: author,
                    content: String::new(),
                    created_at: now,
                })
                .await
                .unwrap();
        }
        let votes = db.vote_store();
        votes.apply_vote(30, 1, VoteDirection::Down, 10, now).await.unwrap();
        votes.apply_vote(40, 2, VoteDirection::Up, 20, now).await.unwrap();
        votes.apply_vote(40, 2, VoteDirection::Down, 20, now).await.unwrap();

        let engine = QueryEngine::new(db);
        let scoped = engine.leaderboard(Some(7), 10).await.unwrap();
        assert_eq!(
            scoped.iter().map(|e| (e.user_id, e.score)).collect::<Vec<_>>(),
            vec![(30, 100), (10, 99)]
        );

        let global = engine.leaderboard(None, 10).await.unwrap();
        assert_eq!(
            global.iter().map(|e| e.user_id).collect::<Vec<_>>(),
            vec![20, 30, 40, 10]
        );
    }
}
