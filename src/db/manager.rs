use std::sync::Arc;
use std::time::Duration;

use diesel::RunQueryDsl;
use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::sqlite::SqliteConnection;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::db::sqlite::{
    SqliteMessageStore, SqliteQueryStore, SqliteSettingsStore, SqliteUserStore, SqliteVoteStore,
};
use crate::db::{
    DatabaseError, LedgerDefaults, MessageStore, QueryStore, SettingsStore, UserStore, VoteStore,
};

pub type Pool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

#[derive(Debug, Clone, Copy)]
struct SqlitePragmas {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))
        .map_err(r2d2::Error::QueryError)
    }
}

#[derive(Clone)]
pub struct DatabaseManager {
    pool: Pool,
    user_store: Arc<dyn UserStore>,
    vote_store: Arc<dyn VoteStore>,
    message_store: Arc<dyn MessageStore>,
    settings_store: Arc<dyn SettingsStore>,
    query_store: Arc<dyn QueryStore>,
}

impl DatabaseManager {
    pub async fn new(
        config: &DatabaseConfig,
        defaults: LedgerDefaults,
    ) -> Result<Self, DatabaseError> {
        let path = config.sqlite_path();
        let max_connections = config.max_connections;
        let busy_timeout_ms = config.busy_timeout_ms;

        // Building the pool opens connections eagerly, keep it off the runtime.
        let pool = tokio::task::spawn_blocking(move || {
            let manager = ConnectionManager::<SqliteConnection>::new(path);
            r2d2::Pool::builder()
                .max_size(max_connections)
                .connection_timeout(Duration::from_millis(busy_timeout_ms.max(1_000)))
                .connection_customizer(Box::new(SqlitePragmas { busy_timeout_ms }))
                .build(manager)
                .map_err(|e| DatabaseError::Connection(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Task(e.to_string()))??;

        Ok(Self::from_pool(pool, defaults))
    }

    pub fn from_pool(pool: Pool, defaults: LedgerDefaults) -> Self {
        let defaults = Arc::new(defaults);
        Self {
            user_store: Arc::new(SqliteUserStore::new(pool.clone(), defaults.clone())),
            vote_store: Arc::new(SqliteVoteStore::new(pool.clone(), defaults.clone())),
            message_store: Arc::new(SqliteMessageStore::new(pool.clone())),
            settings_store: Arc::new(SqliteSettingsStore::new(pool.clone(), defaults.clone())),
            query_store: Arc::new(SqliteQueryStore::new(pool.clone())),
            pool,
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id BIGINT PRIMARY KEY NOT NULL,
                    display_name TEXT NOT NULL DEFAULT 'Unknown',
                    upvotes_received BIGINT NOT NULL DEFAULT 0,
                    downvotes_received BIGINT NOT NULL DEFAULT 0,
                    score_offset BIGINT NOT NULL DEFAULT 100,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id BIGINT PRIMARY KEY NOT NULL,
                    channel_id BIGINT NOT NULL,
                    community_id BIGINT NOT NULL,
                    author_id BIGINT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS votes (
                    voter_id BIGINT NOT NULL,
                    message_id BIGINT NOT NULL,
                    direction INTEGER NOT NULL CHECK (direction IN (1, -1)),
                    author_id BIGINT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (voter_id, message_id, direction)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS fan_haters (
                    subject_id BIGINT NOT NULL,
                    other_id BIGINT NOT NULL,
                    upvotes_given BIGINT NOT NULL DEFAULT 0,
                    downvotes_given BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (subject_id, other_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS community_settings (
                    community_id BIGINT PRIMARY KEY NOT NULL,
                    upvote_symbol TEXT NOT NULL,
                    downvote_symbol TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS scan_watermarks (
                    channel_id BIGINT PRIMARY KEY NOT NULL,
                    community_id BIGINT NOT NULL,
                    last_message_id BIGINT NOT NULL,
                    last_message_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS transactions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id BIGINT NOT NULL,
                    delta BIGINT NOT NULL,
                    reason TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_votes_author ON votes(author_id)",
                "CREATE INDEX IF NOT EXISTS idx_votes_message ON votes(message_id)",
                "CREATE INDEX IF NOT EXISTS idx_votes_created_at ON votes(created_at)",
                "CREATE INDEX IF NOT EXISTS idx_messages_community_created ON messages(community_id, created_at)",
                "CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok::<(), DatabaseError>(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))??;

        info!("database migrations applied");
        Ok(())
    }

    pub fn user_store(&self) -> Arc<dyn UserStore> {
        self.user_store.clone()
    }

    pub fn vote_store(&self) -> Arc<dyn VoteStore> {
        self.vote_store.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.message_store.clone()
    }

    pub fn settings_store(&self) -> Arc<dyn SettingsStore> {
        self.settings_store.clone()
    }

    pub fn query_store(&self) -> Arc<dyn QueryStore> {
        self.query_store.clone()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tempfile::NamedTempFile;

    use super::DatabaseManager;
    use crate::config::DatabaseConfig;
    use crate::db::LedgerDefaults;

    pub(crate) fn sqlite_config(file: &NamedTempFile) -> DatabaseConfig {
        DatabaseConfig {
            url: None,
            filename: Some(file.path().to_string_lossy().to_string()),
            max_connections: 4,
            busy_timeout_ms: 5_000,
        }
    }

    pub(crate) async fn temp_manager() -> (NamedTempFile, Arc<DatabaseManager>) {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = DatabaseManager::new(&sqlite_config(&file), LedgerDefaults::default())
            .await
            .expect("db manager");
        manager.migrate().await.expect("migrate");
        (file, Arc::new(manager))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::DatabaseManager;
    use super::test_support::{sqlite_config, temp_manager};
    use crate::db::{LedgerDefaults, Message, VoteDirection};

    fn message(id: i64, author_id: i64, community_id: i64) -> Message {
        Message {
            id,
            channel_id: 10,
            community_id,
            author_id,
            content: format!("message {id}"),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(id),
        }
    }

    async fn board_scores(db: &DatabaseManager) -> Vec<(i64, i64)> {
        db.query_store()
            .leaderboard(None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.user_id, e.score))
            .collect()
    }

    #[tokio::test]
    async fn upvote_then_retract_restores_score_and_fans() {
        let (_file, db) = temp_manager().await;
        let votes = db.vote_store();
        let queries = db.query_store();
        let (author, voter, msg) = (1, 2, 100);

        let applied = votes
            .apply_vote(voter, msg, VoteDirection::Up, author, Utc::now())
            .await
            .unwrap();
        assert!(applied.changed);
        assert_eq!(applied.new_score, 101);

        let fans = queries.fans_of(author, 10).await.unwrap();
        assert_eq!(fans.len(), 1);
        assert_eq!(fans[0].user_id, voter);
        assert_eq!((fans[0].upvotes_given, fans[0].downvotes_given), (1, 0));

        let retracted = votes
            .retract_vote(voter, msg, VoteDirection::Up, author)
            .await
            .unwrap();
        assert!(retracted.changed);
        assert_eq!(retracted.new_score, 100);
        assert!(queries.fans_of(author, 10).await.unwrap().is_empty());
        assert_eq!(votes.count_votes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_apply_is_idempotent() {
        let (_file, db) = temp_manager().await;
        let votes = db.vote_store();

        let first = votes
            .apply_vote(2, 100, VoteDirection::Down, 1, Utc::now())
            .await
            .unwrap();
        let second = votes
            .apply_vote(2, 100, VoteDirection::Down, 1, Utc::now())
            .await
            .unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(second.new_score, 99);
        assert_eq!(votes.count_votes().await.unwrap(), 1);

        let absent = votes
            .retract_vote(2, 100, VoteDirection::Up, 1)
            .await
            .unwrap();
        assert!(!absent.changed);
        assert_eq!(absent.new_score, 99);
    }

    #[tokio::test]
    async fn both_directions_from_one_voter_are_independent() {
        let (_file, db) = temp_manager().await;
        let votes = db.vote_store();
        let queries = db.query_store();

        votes
            .apply_vote(2, 100, VoteDirection::Up, 1, Utc::now())
            .await
            .unwrap();
        let change = votes
            .apply_vote(2, 100, VoteDirection::Down, 1, Utc::now())
            .await
            .unwrap();
        assert!(change.changed);
        assert_eq!(change.new_score, 100);

        let user = db.user_store().get_user(1).await.unwrap().unwrap();
        assert_eq!((user.upvotes_received, user.downvotes_received), (1, 1));

        let haters = queries.haters_of(1, 10).await.unwrap();
        assert_eq!(haters.len(), 1);
        assert_eq!((haters[0].upvotes_given, haters[0].downvotes_given), (1, 1));
    }

    #[tokio::test]
    async fn operation_order_does_not_change_final_state() {
        let (_file_a, first) = temp_manager().await;
        let (_file_b, second) = temp_manager().await;

        // (voter, message, direction, author)
        let ops = [
            (2, 100, VoteDirection::Up, 1),
            (3, 100, VoteDirection::Down, 1),
            (4, 101, VoteDirection::Up, 1),
            (3, 200, VoteDirection::Down, 5),
            (2, 200, VoteDirection::Down, 5),
            (1, 201, VoteDirection::Up, 5),
        ];

        for (voter, msg, dir, author) in ops {
            first
                .vote_store()
                .apply_vote(voter, msg, dir, author, Utc::now())
                .await
                .unwrap();
        }
        for (voter, msg, dir, author) in ops.iter().rev().copied() {
            second
                .vote_store()
                .apply_vote(voter, msg, dir, author, Utc::now())
                .await
                .unwrap();
        }

        for author in [1, 5] {
            let a = first.user_store().get_user(author).await.unwrap().unwrap();
            let b = second.user_store().get_user(author).await.unwrap().unwrap();
            assert_eq!(a.score(), b.score());
            assert_eq!(
                first.query_store().fans_of(author, 10).await.unwrap(),
                second.query_store().fans_of(author, 10).await.unwrap()
            );
            assert_eq!(
                first.query_store().haters_of(author, 10).await.unwrap(),
                second.query_store().haters_of(author, 10).await.unwrap()
            );
        }
        assert_eq!(board_scores(&first).await, board_scores(&second).await);
        assert_eq!(first.user_store().get_user(1).await.unwrap().unwrap().score(), 101);
        assert_eq!(first.user_store().get_user(5).await.unwrap().unwrap().score(), 99);
        assert_eq!(first.query_store().haters_of(5, 10).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_applies_of_one_identity_count_once() {
        let (_file, db) = temp_manager().await;

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let db = db.clone();
                tokio::spawn(async move {
                    db.vote_store()
                        .apply_vote(2, 100, VoteDirection::Up, 1, Utc::now())
                        .await
                })
            })
            .collect();

        let mut changed = 0;
        for task in tasks {
            let change = task.await.unwrap().unwrap();
            if change.changed {
                changed += 1;
            }
            assert_eq!(change.new_score, 101);
        }

        assert_eq!(changed, 1);
        assert_eq!(db.vote_store().count_votes().await.unwrap(), 1);
        let fans = db.query_store().fans_of(1, 10).await.unwrap();
        assert_eq!(
            fans.iter().map(|f| (f.user_id, f.upvotes_given)).collect::<Vec<_>>(),
            vec![(2, 1)]
        );
    }

    #[tokio::test]
    async fn adjust_offset_keeps_audit_trail() {
        let (_file, db) = temp_manager().await;
        let users = db.user_store();

        assert_eq!(users.adjust_offset(1, -50, "blackjack").await.unwrap(), 50);
        assert_eq!(users.adjust_offset(1, 100, "blackjack").await.unwrap(), 150);

        let user = users.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.score_offset, 150);

        let log = users.list_transactions(1, 10).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().map(|t| t.delta).sum::<i64>(), 50);

        let totals = users.transaction_totals(1).await.unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].reason, "blackjack");
        assert_eq!((totals[0].won, totals[0].lost, totals[0].net), (100, 50, 50));
    }

    #[tokio::test]
    async fn restore_offsets_replays_transaction_log() {
        let (_file, db) = temp_manager().await;
        let users = db.user_store();

        users.adjust_offset(1, 25, "lottery").await.unwrap();
        users.adjust_offset(1, -5, "gacha").await.unwrap();
        db.vote_store().reset_ledger().await.unwrap();
        assert!(users.get_user(1).await.unwrap().is_none());

        users.restore_offsets().await.unwrap();
        let user = users.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.score_offset, 120);

        users.reset_offsets().await.unwrap();
        let user = users.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.score_offset, 100);
        assert!(users.list_transactions(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leaderboard_breaks_ties_by_ascending_id() {
        let (_file, db) = temp_manager().await;
        let users = db.user_store();
        for id in [30, 10, 20] {
            users.get_or_create_user(id).await.unwrap();
        }
        db.vote_store()
            .apply_vote(99, 500, VoteDirection::Up, 30, Utc::now())
            .await
            .unwrap();

        let board = db.query_store().leaderboard(None, 10).await.unwrap();
        let ids: Vec<i64> = board.iter().map(|e| e.user_id).collect();
        assert_eq!(ids, vec![30, 10, 20, 99]);
        assert_eq!(board[0].score, 101);
    }

    #[tokio::test]
    async fn first_message_write_wins() {
        let (_file, db) = temp_manager().await;
        let messages = db.message_store();

        let original = message(100, 1, 7);
        assert!(messages.record_message(&original).await.unwrap());

        let mut edited = original.clone();
        edited.content = "edited".to_string();
        assert!(!messages.record_message(&edited).await.unwrap());

        let stored = messages.get_message(100).await.unwrap().unwrap();
        assert_eq!(stored.content, original.content);
        assert_eq!(stored.created_at, original.created_at);
    }

    #[tokio::test]
    async fn best_and_worst_messages_rank_by_net_votes() {
        let (_file, db) = temp_manager().await;
        let votes = db.vote_store();
        for id in [100, 101, 102] {
            db.message_store().record_message(&message(id, 1, 7)).await.unwrap();
        }

        for voter in [2, 3] {
            votes.apply_vote(voter, 101, VoteDirection::Up, 1, Utc::now()).await.unwrap();
        }
        votes.apply_vote(2, 100, VoteDirection::Up, 1, Utc::now()).await.unwrap();
        votes.apply_vote(2, 102, VoteDirection::Down, 1, Utc::now()).await.unwrap();

        let best = db.query_store().best_messages_of(1, 3).await.unwrap();
        assert_eq!(best.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![101, 100, 102]);
        assert_eq!(best[0].net_votes, 2);
        assert_eq!(best[0].community_id, Some(7));

        let worst = db.query_store().worst_messages_of(1, 1).await.unwrap();
        assert_eq!(worst[0].message_id, 102);
        assert_eq!(worst[0].net_votes, -1);

        let top = db.query_store().top_messages(Some(8), 10).await.unwrap();
        assert!(top.is_empty());
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let (_file, db) = temp_manager().await;
        let settings = db.settings_store();
        let at = Utc::now();

        settings.advance_watermark(10, 7, 500, at).await.unwrap();
        settings.advance_watermark(10, 7, 400, at).await.unwrap();
        assert_eq!(settings.watermark(10).await.unwrap().unwrap().last_message_id, 500);

        settings.advance_watermark(10, 7, 600, at).await.unwrap();
        assert_eq!(settings.watermark(10).await.unwrap().unwrap().last_message_id, 600);

        assert_eq!(settings.clear_watermarks().await.unwrap(), 1);
        assert!(settings.watermark(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vote_symbols_default_then_update() {
        let (_file, db) = temp_manager().await;
        let settings = db.settings_store();

        let symbols = settings.vote_symbols(7).await.unwrap();
        assert_eq!(symbols.upvote, "👍");
        assert_eq!(symbols.downvote, "👎");

        let updated = settings.set_vote_symbols(7, "⬆️", "⬇️").await.unwrap();
        assert_eq!(updated.direction_of("⬆️"), Some(VoteDirection::Up));
        assert_eq!(settings.list_communities().await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn recompute_repairs_drifted_counters() {
        let (file, db) = temp_manager().await;
        let votes = db.vote_store();
        votes.apply_vote(2, 100, VoteDirection::Up, 1, Utc::now()).await.unwrap();
        votes.apply_vote(3, 100, VoteDirection::Up, 1, Utc::now()).await.unwrap();

        {
            use diesel::prelude::*;
            let path = file.path().to_string_lossy().to_string();
            let mut conn = SqliteConnection::establish(&path).unwrap();
            diesel::sql_query("UPDATE users SET upvotes_received = 40 WHERE id = 1")
                .execute(&mut conn)
                .unwrap();
            diesel::sql_query("DELETE FROM fan_haters").execute(&mut conn).unwrap();
        }

        let report = votes.recompute_aggregates().await.unwrap();
        assert_eq!(report.drifted_users, 1);
        assert_eq!(report.pairs_rebuilt, 2);

        let user = db.user_store().get_user(1).await.unwrap().unwrap();
        assert_eq!(user.score(), 102);
        assert_eq!(db.query_store().fans_of(1, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let (file, db) = temp_manager().await;
        db.vote_store()
            .apply_vote(2, 100, VoteDirection::Up, 1, Utc::now())
            .await
            .unwrap();
        db.user_store().update_display_name(1, "alice").await.unwrap();
        drop(db);

        let reopened = DatabaseManager::new(&sqlite_config(&file), LedgerDefaults::default())
            .await
            .expect("db manager reopened");
        reopened.migrate().await.expect("migrate reopened");

        let user = reopened.user_store().get_user(1).await.unwrap().unwrap();
        assert_eq!(user.display_name, "alice");
        assert_eq!(user.score(), 101);
    }
}
