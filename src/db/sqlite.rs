use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel::sqlite::SqliteConnection;
use tracing::warn;

use crate::db::manager::Pool;
use crate::db::schema::{community_settings, messages, scan_watermarks, transactions, users, votes};

use super::{
    DatabaseError,
    models::{
        DEFAULT_DISPLAY_NAME, FanHaterEntry, LeaderboardEntry, LedgerDefaults, LedgerTransaction,
        MemberScore, Message, MessageScore, ReasonTotals, RecomputeReport, ScanWatermark, User,
        VoteChange, VoteDirection, VoteSymbols,
    },
};

// Fixed-width UTC timestamps so text comparison in SQL is chronological.
pub(crate) fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

async fn with_connection<T, F>(pool: &Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Task(e.to_string()))?
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = users)]
struct DbUser {
    id: i64,
    display_name: String,
    upvotes_received: i64,
    downvotes_received: i64,
    score_offset: i64,
    created_at: String,
    updated_at: String,
}

impl DbUser {
    fn to_user(&self) -> Result<User, DatabaseError> {
        Ok(User {
            id: self.id,
            display_name: self.display_name.clone(),
            upvotes_received: self.upvotes_received,
            downvotes_received: self.downvotes_received,
            score_offset: self.score_offset,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
struct NewUser<'a> {
    id: i64,
    display_name: &'a str,
    upvotes_received: i64,
    downvotes_received: i64,
    score_offset: i64,
    created_at: &'a str,
    updated_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = messages)]
struct DbMessage {
    id: i64,
    channel_id: i64,
    community_id: i64,
    author_id: i64,
    content: String,
    created_at: String,
}

impl DbMessage {
    fn to_message(&self) -> Result<Message, DatabaseError> {
        Ok(Message {
            id: self.id,
            channel_id: self.channel_id,
            community_id: self.community_id,
            author_id: self.author_id,
            content: self.content.clone(),
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
struct NewMessage<'a> {
    id: i64,
    channel_id: i64,
    community_id: i64,
    author_id: i64,
    content: &'a str,
    created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = votes)]
struct NewVote {
    voter_id: i64,
    message_id: i64,
    direction: i32,
    author_id: i64,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = community_settings)]
struct DbCommunitySettings {
    community_id: i64,
    upvote_symbol: String,
    downvote_symbol: String,
}

impl From<DbCommunitySettings> for VoteSymbols {
    fn from(value: DbCommunitySettings) -> Self {
        Self {
            community_id: value.community_id,
            upvote: value.upvote_symbol,
            downvote: value.downvote_symbol,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = community_settings)]
struct NewCommunitySettings<'a> {
    community_id: i64,
    upvote_symbol: &'a str,
    downvote_symbol: &'a str,
    created_at: &'a str,
    updated_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = scan_watermarks)]
struct DbScanWatermark {
    channel_id: i64,
    community_id: i64,
    last_message_id: i64,
    last_message_at: String,
    updated_at: String,
}

impl DbScanWatermark {
    fn to_watermark(&self) -> Result<ScanWatermark, DatabaseError> {
        Ok(ScanWatermark {
            channel_id: self.channel_id,
            community_id: self.community_id,
            last_message_id: self.last_message_id,
            last_message_at: string_to_datetime(&self.last_message_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = transactions)]
struct DbTransaction {
    id: i64,
    user_id: i64,
    delta: i64,
    reason: String,
    created_at: String,
}

impl DbTransaction {
    fn to_transaction(&self) -> Result<LedgerTransaction, DatabaseError> {
        Ok(LedgerTransaction {
            id: self.id,
            user_id: self.user_id,
            delta: self.delta,
            reason: self.reason.clone(),
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = transactions)]
struct NewTransaction<'a> {
    user_id: i64,
    delta: i64,
    reason: &'a str,
    created_at: String,
}

#[derive(QueryableByName)]
struct LeaderboardRow {
    #[diesel(sql_type = BigInt)]
    user_id: i64,
    #[diesel(sql_type = Text)]
    display_name: String,
    #[diesel(sql_type = BigInt)]
    score: i64,
}

#[derive(QueryableByName)]
struct FanHaterRow {
    #[diesel(sql_type = BigInt)]
    user_id: i64,
    #[diesel(sql_type = Text)]
    display_name: String,
    #[diesel(sql_type = BigInt)]
    upvotes_given: i64,
    #[diesel(sql_type = BigInt)]
    downvotes_given: i64,
}

#[derive(QueryableByName)]
struct MessageScoreRow {
    #[diesel(sql_type = BigInt)]
    message_id: i64,
    #[diesel(sql_type = Nullable<BigInt>)]
    channel_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    community_id: Option<i64>,
    #[diesel(sql_type = BigInt)]
    author_id: i64,
    #[diesel(sql_type = Text)]
    content: String,
    #[diesel(sql_type = BigInt)]
    net_votes: i64,
}

impl From<MessageScoreRow> for MessageScore {
    fn from(value: MessageScoreRow) -> Self {
        Self {
            message_id: value.message_id,
            channel_id: value.channel_id,
            community_id: value.community_id,
            author_id: value.author_id,
            content: value.content,
            net_votes: value.net_votes,
        }
    }
}

#[derive(QueryableByName)]
struct MemberScoreRow {
    #[diesel(sql_type = BigInt)]
    user_id: i64,
    #[diesel(sql_type = Text)]
    display_name: String,
    #[diesel(sql_type = BigInt)]
    net_votes: i64,
}

#[derive(QueryableByName)]
struct ReasonTotalsRow {
    #[diesel(sql_type = Text)]
    reason: String,
    #[diesel(sql_type = BigInt)]
    won: i64,
    #[diesel(sql_type = BigInt)]
    lost: i64,
    #[diesel(sql_type = BigInt)]
    net: i64,
    #[diesel(sql_type = BigInt)]
    entries: i64,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct CommunityRow {
    #[diesel(sql_type = BigInt)]
    community_id: i64,
}

const ADD_UPVOTE_GIVEN: &str = "INSERT INTO fan_haters (subject_id, other_id, upvotes_given, downvotes_given) \
     VALUES (?, ?, 1, 0) \
     ON CONFLICT (subject_id, other_id) DO UPDATE SET upvotes_given = upvotes_given + 1";
const ADD_DOWNVOTE_GIVEN: &str = "INSERT INTO fan_haters (subject_id, other_id, upvotes_given, downvotes_given) \
     VALUES (?, ?, 0, 1) \
     ON CONFLICT (subject_id, other_id) DO UPDATE SET downvotes_given = downvotes_given + 1";
const REMOVE_UPVOTE_GIVEN: &str = "UPDATE fan_haters SET upvotes_given = upvotes_given - 1 \
     WHERE subject_id = ? AND other_id = ? AND upvotes_given > 0";
const REMOVE_DOWNVOTE_GIVEN: &str = "UPDATE fan_haters SET downvotes_given = downvotes_given - 1 \
     WHERE subject_id = ? AND other_id = ? AND downvotes_given > 0";
const DELETE_EMPTY_PAIR: &str = "DELETE FROM fan_haters \
     WHERE subject_id = ? AND other_id = ? AND upvotes_given <= 0 AND downvotes_given <= 0";

const MESSAGE_SCORE_COLUMNS: &str = "SELECT v.message_id AS message_id, m.channel_id AS channel_id, \
     m.community_id AS community_id, v.author_id AS author_id, \
     COALESCE(m.content, '') AS content, SUM(v.direction) AS net_votes \
     FROM votes v LEFT JOIN messages m ON m.id = v.message_id";

fn ensure_user(
    conn: &mut SqliteConnection,
    user_id: i64,
    score_offset: i64,
) -> Result<(), DatabaseError> {
    let now = datetime_to_string(&Utc::now());
    diesel::insert_or_ignore_into(users::table)
        .values(NewUser {
            id: user_id,
            display_name: DEFAULT_DISPLAY_NAME,
            upvotes_received: 0,
            downvotes_received: 0,
            score_offset,
            created_at: &now,
            updated_at: &now,
        })
        .execute(conn)?;
    Ok(())
}

fn load_user(conn: &mut SqliteConnection, user_id: i64) -> Result<Option<User>, DatabaseError> {
    users::table
        .find(user_id)
        .select(DbUser::as_select())
        .first::<DbUser>(conn)
        .optional()?
        .map(|u| u.to_user())
        .transpose()
}

fn user_score(conn: &mut SqliteConnection, user_id: i64) -> Result<i64, DatabaseError> {
    let (upvotes, downvotes, offset) = users::table
        .find(user_id)
        .select((
            users::upvotes_received,
            users::downvotes_received,
            users::score_offset,
        ))
        .first::<(i64, i64, i64)>(conn)?;
    Ok(upvotes - downvotes + offset)
}

fn bump_received(
    conn: &mut SqliteConnection,
    author_id: i64,
    direction: VoteDirection,
    step: i64,
) -> Result<(), DatabaseError> {
    let now = datetime_to_string(&Utc::now());
    let target = users::table.find(author_id);
    match direction {
        VoteDirection::Up => diesel::update(target)
            .set((
                users::upvotes_received.eq(users::upvotes_received + step),
                users::updated_at.eq(now),
            ))
            .execute(conn)?,
        VoteDirection::Down => diesel::update(target)
            .set((
                users::downvotes_received.eq(users::downvotes_received + step),
                users::updated_at.eq(now),
            ))
            .execute(conn)?,
    };
    Ok(())
}

fn add_pair(
    conn: &mut SqliteConnection,
    subject_id: i64,
    other_id: i64,
    direction: VoteDirection,
) -> Result<(), DatabaseError> {
    let statement = match direction {
        VoteDirection::Up => ADD_UPVOTE_GIVEN,
        VoteDirection::Down => ADD_DOWNVOTE_GIVEN,
    };
    diesel::sql_query(statement)
        .bind::<BigInt, _>(subject_id)
        .bind::<BigInt, _>(other_id)
        .execute(conn)?;
    Ok(())
}

fn remove_pair(
    conn: &mut SqliteConnection,
    subject_id: i64,
    other_id: i64,
    direction: VoteDirection,
) -> Result<(), DatabaseError> {
    let statement = match direction {
        VoteDirection::Up => REMOVE_UPVOTE_GIVEN,
        VoteDirection::Down => REMOVE_DOWNVOTE_GIVEN,
    };
    diesel::sql_query(statement)
        .bind::<BigInt, _>(subject_id)
        .bind::<BigInt, _>(other_id)
        .execute(conn)?;
    diesel::sql_query(DELETE_EMPTY_PAIR)
        .bind::<BigInt, _>(subject_id)
        .bind::<BigInt, _>(other_id)
        .execute(conn)?;
    Ok(())
}

fn ensure_settings(
    conn: &mut SqliteConnection,
    community_id: i64,
    defaults: &LedgerDefaults,
) -> Result<(), DatabaseError> {
    let now = datetime_to_string(&Utc::now());
    diesel::insert_or_ignore_into(community_settings::table)
        .values(NewCommunitySettings {
            community_id,
            upvote_symbol: &defaults.upvote_symbol,
            downvote_symbol: &defaults.downvote_symbol,
            created_at: &now,
            updated_at: &now,
        })
        .execute(conn)?;
    Ok(())
}

fn load_settings(
    conn: &mut SqliteConnection,
    community_id: i64,
) -> Result<VoteSymbols, DatabaseError> {
    community_settings::table
        .find(community_id)
        .select(DbCommunitySettings::as_select())
        .first::<DbCommunitySettings>(conn)
        .map(VoteSymbols::from)
        .map_err(DatabaseError::from)
}

pub struct SqliteUserStore {
    pool: Pool,
    defaults: Arc<LedgerDefaults>,
}

impl SqliteUserStore {
    pub fn new(pool: Pool, defaults: Arc<LedgerDefaults>) -> Self {
        Self { pool, defaults }
    }
}

#[async_trait]
impl super::UserStore for SqliteUserStore {
    async fn get_or_create_user(&self, id: i64) -> Result<User, DatabaseError> {
        let score_offset = self.defaults.score_offset;
        with_connection(&self.pool, move |conn| {
            ensure_user(conn, id, score_offset)?;
            load_user(conn, id)?
                .ok_or_else(|| DatabaseError::Query(format!("user {id} missing after insert")))
        })
        .await
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, DatabaseError> {
        with_connection(&self.pool, move |conn| load_user(conn, id)).await
    }

    async fn update_display_name(&self, id: i64, display_name: &str) -> Result<(), DatabaseError> {
        let display_name = display_name.to_string();
        let score_offset = self.defaults.score_offset;
        with_connection(&self.pool, move |conn| {
            ensure_user(conn, id, score_offset)?;
            diesel::update(users::table.find(id))
                .set((
                    users::display_name.eq(display_name),
                    users::updated_at.eq(datetime_to_string(&Utc::now())),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(DatabaseError::from)
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<User>, DatabaseError> {
        with_connection(&self.pool, |conn| {
            let rows = users::table
                .order(users::id.asc())
                .select(DbUser::as_select())
                .load::<DbUser>(conn)?;
            rows.iter().map(DbUser::to_user).collect()
        })
        .await
    }

    async fn adjust_offset(&self, id: i64, delta: i64, reason: &str) -> Result<i64, DatabaseError> {
        let reason = reason.to_string();
        let score_offset = self.defaults.score_offset;
        with_connection(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                ensure_user(conn, id, score_offset)?;
                let now = Utc::now();
                diesel::update(users::table.find(id))
                    .set((
                        users::score_offset.eq(users::score_offset + delta),
                        users::updated_at.eq(datetime_to_string(&now)),
                    ))
                    .execute(conn)?;
                diesel::insert_into(transactions::table)
                    .values(NewTransaction {
                        user_id: id,
                        delta,
                        reason: &reason,
                        created_at: datetime_to_string(&now),
                    })
                    .execute(conn)?;
                user_score(conn, id)
            })
        })
        .await
    }

    async fn list_transactions(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, DatabaseError> {
        with_connection(&self.pool, move |conn| {
            let rows = transactions::table
                .filter(transactions::user_id.eq(user_id))
                .order(transactions::id.desc())
                .limit(limit)
                .select(DbTransaction::as_select())
                .load::<DbTransaction>(conn)?;
            rows.iter().map(DbTransaction::to_transaction).collect()
        })
        .await
    }

    async fn transaction_totals(&self, user_id: i64) -> Result<Vec<ReasonTotals>, DatabaseError> {
        with_connection(&self.pool, move |conn| {
            let rows = diesel::sql_query(
                "SELECT reason, \
                 COALESCE(SUM(CASE WHEN delta > 0 THEN delta ELSE 0 END), 0) AS won, \
                 COALESCE(SUM(CASE WHEN delta < 0 THEN -delta ELSE 0 END), 0) AS lost, \
                 COALESCE(SUM(delta), 0) AS net, \
                 COUNT(*) AS entries \
                 FROM transactions WHERE user_id = ? GROUP BY reason ORDER BY reason",
            )
            .bind::<BigInt, _>(user_id)
            .load::<ReasonTotalsRow>(conn)?;

            Ok(rows
                .into_iter()
                .map(|row| ReasonTotals {
                    reason: row.reason,
                    won: row.won,
                    lost: row.lost,
                    net: row.net,
                    entries: row.entries,
                })
                .collect())
        })
        .await
    }

    async fn restore_offsets(&self) -> Result<usize, DatabaseError> {
        let score_offset = self.defaults.score_offset;
        with_connection(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let now = datetime_to_string(&Utc::now());
                diesel::sql_query(
                    "INSERT OR IGNORE INTO users \
                     (id, display_name, upvotes_received, downvotes_received, score_offset, created_at, updated_at) \
                     SELECT DISTINCT user_id, ?, 0, 0, ?, ?, ? FROM transactions",
                )
                .bind::<Text, _>(DEFAULT_DISPLAY_NAME)
                .bind::<BigInt, _>(score_offset)
                .bind::<Text, _>(&now)
                .bind::<Text, _>(&now)
                .execute(conn)?;

                diesel::sql_query(
                    "UPDATE users SET score_offset = ? + COALESCE(\
                     (SELECT SUM(t.delta) FROM transactions t WHERE t.user_id = users.id), 0), \
                     updated_at = ?",
                )
                .bind::<BigInt, _>(score_offset)
                .bind::<Text, _>(&now)
                .execute(conn)
                .map_err(DatabaseError::from)
            })
        })
        .await
    }

    async fn reset_offsets(&self) -> Result<usize, DatabaseError> {
        let score_offset = self.defaults.score_offset;
        with_connection(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let updated = diesel::update(users::table)
                    .set((
                        users::score_offset.eq(score_offset),
                        users::updated_at.eq(datetime_to_string(&Utc::now())),
                    ))
                    .execute(conn)?;
                diesel::delete(transactions::table).execute(conn)?;
                Ok(updated)
            })
        })
        .await
    }
}

pub struct SqliteVoteStore {
    pool: Pool,
    defaults: Arc<LedgerDefaults>,
}

impl SqliteVoteStore {
    pub fn new(pool: Pool, defaults: Arc<LedgerDefaults>) -> Self {
        Self { pool, defaults }
    }
}

#[async_trait]
impl super::VoteStore for SqliteVoteStore {
    async fn apply_vote(
        &self,
        voter_id: i64,
        message_id: i64,
        direction: VoteDirection,
        author_id: i64,
        at: DateTime<Utc>,
    ) -> Result<VoteChange, DatabaseError> {
        let score_offset = self.defaults.score_offset;
        with_connection(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                ensure_user(conn, author_id, score_offset)?;
                ensure_user(conn, voter_id, score_offset)?;

                let inserted = diesel::insert_or_ignore_into(votes::table)
                    .values(NewVote {
                        voter_id,
                        message_id,
                        direction: direction.value(),
                        author_id,
                        created_at: datetime_to_string(&at),
                    })
                    .execute(conn)?;

                let changed = inserted > 0;
                if changed {
                    bump_received(conn, author_id, direction, 1)?;
                    add_pair(conn, author_id, voter_id, direction)?;
                }

                Ok(VoteChange {
                    changed,
                    new_score: user_score(conn, author_id)?,
                })
            })
        })
        .await
    }

    async fn retract_vote(
        &self,
        voter_id: i64,
        message_id: i64,
        direction: VoteDirection,
        author_id: i64,
    ) -> Result<VoteChange, DatabaseError> {
        let score_offset = self.defaults.score_offset;
        with_connection(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let key = (voter_id, message_id, direction.value());
                let stored_author = votes::table
                    .find(key)
                    .select(votes::author_id)
                    .first::<i64>(conn)
                    .optional()?;

                let Some(stored_author) = stored_author else {
                    ensure_user(conn, author_id, score_offset)?;
                    return Ok(VoteChange {
                        changed: false,
                        new_score: user_score(conn, author_id)?,
                    });
                };

                if stored_author != author_id {
                    warn!(
                        "vote author mismatch on retract message_id={} stored={} given={}",
                        message_id, stored_author, author_id
                    );
                }

                diesel::delete(votes::table.find(key)).execute(conn)?;
                ensure_user(conn, stored_author, score_offset)?;
                bump_received(conn, stored_author, direction, -1)?;
                remove_pair(conn, stored_author, voter_id, direction)?;

                Ok(VoteChange {
                    changed: true,
                    new_score: user_score(conn, stored_author)?,
                })
            })
        })
        .await
    }

    async fn count_votes(&self) -> Result<i64, DatabaseError> {
        with_connection(&self.pool, |conn| {
            votes::table
                .count()
                .get_result(conn)
                .map_err(DatabaseError::from)
        })
        .await
    }

    async fn recompute_aggregates(&self) -> Result<RecomputeReport, DatabaseError> {
        let score_offset = self.defaults.score_offset;
        with_connection(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let drifted = diesel::sql_query(
                    "SELECT COUNT(*) AS count FROM users u WHERE \
                     u.upvotes_received != (SELECT COUNT(*) FROM votes v WHERE v.author_id = u.id AND v.direction = 1) \
                     OR u.downvotes_received != (SELECT COUNT(*) FROM votes v WHERE v.author_id = u.id AND v.direction = -1)",
                )
                .get_result::<CountRow>(conn)?
                .count;

                let now = datetime_to_string(&Utc::now());
                diesel::sql_query(
                    "INSERT OR IGNORE INTO users \
                     (id, display_name, upvotes_received, downvotes_received, score_offset, created_at, updated_at) \
                     SELECT DISTINCT author_id, ?, 0, 0, ?, ?, ? FROM votes",
                )
                .bind::<Text, _>(DEFAULT_DISPLAY_NAME)
                .bind::<BigInt, _>(score_offset)
                .bind::<Text, _>(&now)
                .bind::<Text, _>(&now)
                .execute(conn)?;

                let users_updated = diesel::sql_query(
                    "UPDATE users SET \
                     upvotes_received = (SELECT COUNT(*) FROM votes v WHERE v.author_id = users.id AND v.direction = 1), \
                     downvotes_received = (SELECT COUNT(*) FROM votes v WHERE v.author_id = users.id AND v.direction = -1)",
                )
                .execute(conn)?;

                diesel::sql_query("DELETE FROM fan_haters").execute(conn)?;
                let pairs_rebuilt = diesel::sql_query(
                    "INSERT INTO fan_haters (subject_id, other_id, upvotes_given, downvotes_given) \
                     SELECT author_id, voter_id, \
                     SUM(CASE WHEN direction = 1 THEN 1 ELSE 0 END), \
                     SUM(CASE WHEN direction = -1 THEN 1 ELSE 0 END) \
                     FROM votes GROUP BY author_id, voter_id",
                )
                .execute(conn)?;

                Ok(RecomputeReport {
                    drifted_users: drifted,
                    users_updated,
                    pairs_rebuilt,
                })
            })
        })
        .await
    }

    async fn reset_ledger(&self) -> Result<(), DatabaseError> {
        with_connection(&self.pool, |conn| {
            conn.immediate_transaction(|conn| {
                diesel::delete(votes::table).execute(conn)?;
                diesel::sql_query("DELETE FROM fan_haters").execute(conn)?;
                diesel::delete(users::table).execute(conn)?;
                Ok(())
            })
        })
        .await
    }
}

pub struct SqliteMessageStore {
    pool: Pool,
}

impl SqliteMessageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::MessageStore for SqliteMessageStore {
    async fn record_message(&self, message: &Message) -> Result<bool, DatabaseError> {
        let message = message.clone();
        with_connection(&self.pool, move |conn| {
            diesel::insert_or_ignore_into(messages::table)
                .values(NewMessage {
                    id: message.id,
                    channel_id: message.channel_id,
                    community_id: message.community_id,
                    author_id: message.author_id,
                    content: &message.content,
                    created_at: datetime_to_string(&message.created_at),
                })
                .execute(conn)
                .map(|inserted| inserted > 0)
                .map_err(DatabaseError::from)
        })
        .await
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>, DatabaseError> {
        with_connection(&self.pool, move |conn| {
            messages::table
                .find(id)
                .select(DbMessage::as_select())
                .first::<DbMessage>(conn)
                .optional()?
                .map(|m| m.to_message())
                .transpose()
        })
        .await
    }
}

pub struct SqliteSettingsStore {
    pool: Pool,
    defaults: Arc<LedgerDefaults>,
}

impl SqliteSettingsStore {
    pub fn new(pool: Pool, defaults: Arc<LedgerDefaults>) -> Self {
        Self { pool, defaults }
    }
}

#[async_trait]
impl super::SettingsStore for SqliteSettingsStore {
    async fn vote_symbols(&self, community_id: i64) -> Result<VoteSymbols, DatabaseError> {
        let defaults = self.defaults.clone();
        with_connection(&self.pool, move |conn| {
            ensure_settings(conn, community_id, &defaults)?;
            load_settings(conn, community_id)
        })
        .await
    }

    async fn set_vote_symbols(
        &self,
        community_id: i64,
        upvote: &str,
        downvote: &str,
    ) -> Result<VoteSymbols, DatabaseError> {
        let upvote = upvote.to_string();
        let downvote = downvote.to_string();
        let defaults = self.defaults.clone();
        with_connection(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                ensure_settings(conn, community_id, &defaults)?;
                diesel::update(community_settings::table.find(community_id))
                    .set((
                        community_settings::upvote_symbol.eq(&upvote),
                        community_settings::downvote_symbol.eq(&downvote),
                        community_settings::updated_at.eq(datetime_to_string(&Utc::now())),
                    ))
                    .execute(conn)?;
                load_settings(conn, community_id)
            })
        })
        .await
    }

    async fn list_communities(&self) -> Result<Vec<i64>, DatabaseError> {
        with_connection(&self.pool, |conn| {
            let rows = diesel::sql_query(
                "SELECT community_id FROM community_settings \
                 UNION SELECT community_id FROM messages \
                 ORDER BY community_id",
            )
            .load::<CommunityRow>(conn)?;
            Ok(rows.into_iter().map(|row| row.community_id).collect())
        })
        .await
    }

    async fn watermark(&self, channel_id: i64) -> Result<Option<ScanWatermark>, DatabaseError> {
        with_connection(&self.pool, move |conn| {
            scan_watermarks::table
                .find(channel_id)
                .select(DbScanWatermark::as_select())
                .first::<DbScanWatermark>(conn)
                .optional()?
                .map(|w| w.to_watermark())
                .transpose()
        })
        .await
    }

    async fn advance_watermark(
        &self,
        channel_id: i64,
        community_id: i64,
        message_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        with_connection(&self.pool, move |conn| {
            diesel::sql_query(
                "INSERT INTO scan_watermarks \
                 (channel_id, community_id, last_message_id, last_message_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT (channel_id) DO UPDATE SET \
                 last_message_id = excluded.last_message_id, \
                 last_message_at = excluded.last_message_at, \
                 updated_at = excluded.updated_at \
                 WHERE excluded.last_message_id > scan_watermarks.last_message_id",
            )
            .bind::<BigInt, _>(channel_id)
            .bind::<BigInt, _>(community_id)
            .bind::<BigInt, _>(message_id)
            .bind::<Text, _>(datetime_to_string(&at))
            .bind::<Text, _>(datetime_to_string(&Utc::now()))
            .execute(conn)
            .map(|_| ())
            .map_err(DatabaseError::from)
        })
        .await
    }

    async fn clear_watermarks(&self) -> Result<usize, DatabaseError> {
        with_connection(&self.pool, |conn| {
            diesel::delete(scan_watermarks::table)
                .execute(conn)
                .map_err(DatabaseError::from)
        })
        .await
    }
}

pub struct SqliteQueryStore {
    pool: Pool,
}

impl SqliteQueryStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn message_scores(
        &self,
        filter: Option<(&'static str, i64)>,
        order: &'static str,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError> {
        with_connection(&self.pool, move |conn| {
            let rows = match filter {
                Some((clause, value)) => diesel::sql_query(format!(
                    "{MESSAGE_SCORE_COLUMNS} WHERE {clause} GROUP BY v.message_id ORDER BY {order} LIMIT ?"
                ))
                .bind::<BigInt, _>(value)
                .bind::<BigInt, _>(limit)
                .load::<MessageScoreRow>(conn)?,
                None => diesel::sql_query(format!(
                    "{MESSAGE_SCORE_COLUMNS} GROUP BY v.message_id ORDER BY {order} LIMIT ?"
                ))
                .bind::<BigInt, _>(limit)
                .load::<MessageScoreRow>(conn)?,
            };
            Ok(rows.into_iter().map(MessageScore::from).collect())
        })
        .await
    }

    async fn fan_hater_rows(
        &self,
        sql: &'static str,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<FanHaterEntry>, DatabaseError> {
        with_connection(&self.pool, move |conn| {
            let rows = diesel::sql_query(sql)
                .bind::<BigInt, _>(user_id)
                .bind::<BigInt, _>(limit)
                .load::<FanHaterRow>(conn)?;
            Ok(rows
                .into_iter()
                .map(|row| FanHaterEntry {
                    user_id: row.user_id,
                    display_name: row.display_name,
                    upvotes_given: row.upvotes_given,
                    downvotes_given: row.downvotes_given,
                })
                .collect())
        })
        .await
    }
}

#[async_trait]
impl super::QueryStore for SqliteQueryStore {
    async fn leaderboard(
        &self,
        community_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<LeaderboardEntry>, DatabaseError> {
        with_connection(&self.pool, move |conn| {
            let rows = diesel::sql_query(
                "SELECT id AS user_id, display_name, \
                 upvotes_received - downvotes_received + score_offset AS score \
                 FROM users \
                 WHERE ?1 IS NULL \
                    OR id IN (SELECT author_id FROM messages WHERE community_id = ?1) \
                    OR id IN (SELECT v.voter_id FROM votes v \
                              JOIN messages m ON m.id = v.message_id \
                              WHERE m.community_id = ?1) \
                 ORDER BY score DESC, id ASC LIMIT ?2",
            )
            .bind::<Nullable<BigInt>, _>(community_id)
            .bind::<BigInt, _>(limit)
            .load::<LeaderboardRow>(conn)?;
            Ok(rows
                .into_iter()
                .map(|row| LeaderboardEntry {
                    user_id: row.user_id,
                    display_name: row.display_name,
                    score: row.score,
                })
                .collect())
        })
        .await
    }

    async fn fans_of(&self, user_id: i64, limit: i64) -> Result<Vec<FanHaterEntry>, DatabaseError> {
        self.fan_hater_rows(
            "SELECT f.other_id AS user_id, COALESCE(u.display_name, 'Unknown') AS display_name, \
             f.upvotes_given AS upvotes_given, f.downvotes_given AS downvotes_given \
             FROM fan_haters f LEFT JOIN users u ON u.id = f.other_id \
             WHERE f.subject_id = ? AND f.upvotes_given > 0 \
             ORDER BY f.upvotes_given DESC, f.other_id ASC LIMIT ?",
            user_id,
            limit,
        )
        .await
    }

    async fn haters_of(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<FanHaterEntry>, DatabaseError> {
        self.fan_hater_rows(
            "SELECT f.other_id AS user_id, COALESCE(u.display_name, 'Unknown') AS display_name, \
             f.upvotes_given AS upvotes_given, f.downvotes_given AS downvotes_given \
             FROM fan_haters f LEFT JOIN users u ON u.id = f.other_id \
             WHERE f.subject_id = ? AND f.downvotes_given > 0 \
             ORDER BY f.downvotes_given DESC, f.other_id ASC LIMIT ?",
            user_id,
            limit,
        )
        .await
    }

    async fn best_messages_of(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError> {
        self.message_scores(
            Some(("v.author_id = ?", user_id)),
            "net_votes DESC, v.message_id ASC",
            limit,
        )
        .await
    }

    async fn worst_messages_of(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError> {
        self.message_scores(
            Some(("v.author_id = ?", user_id)),
            "net_votes ASC, v.message_id ASC",
            limit,
        )
        .await
    }

    async fn top_messages(
        &self,
        community_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError> {
        self.message_scores(
            community_id.map(|id| ("m.community_id = ?", id)),
            "net_votes DESC, v.message_id ASC",
            limit,
        )
        .await
    }

    async fn members_in_window(
        &self,
        community_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MemberScore>, DatabaseError> {
        with_connection(&self.pool, move |conn| {
            let rows = diesel::sql_query(
                "SELECT v.author_id AS user_id, COALESCE(u.display_name, 'Unknown') AS display_name, \
                 SUM(v.direction) AS net_votes \
                 FROM votes v \
                 JOIN messages m ON m.id = v.message_id \
                 LEFT JOIN users u ON u.id = v.author_id \
                 WHERE m.community_id = ? AND v.created_at >= ? \
                 GROUP BY v.author_id \
                 ORDER BY net_votes DESC, v.author_id ASC LIMIT ?",
            )
            .bind::<BigInt, _>(community_id)
            .bind::<Text, _>(datetime_to_string(&since))
            .bind::<BigInt, _>(limit)
            .load::<MemberScoreRow>(conn)?;
            Ok(rows
                .into_iter()
                .map(|row| MemberScore {
                    user_id: row.user_id,
                    display_name: row.display_name,
                    net_votes: row.net_votes,
                })
                .collect())
        })
        .await
    }

    async fn messages_in_window(
        &self,
        community_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageScore>, DatabaseError> {
        with_connection(&self.pool, move |conn| {
            let rows = diesel::sql_query(format!(
                "{MESSAGE_SCORE_COLUMNS} WHERE m.community_id = ? AND m.created_at >= ? \
                 GROUP BY v.message_id ORDER BY net_votes DESC, v.message_id ASC LIMIT ?"
            ))
            .bind::<BigInt, _>(community_id)
            .bind::<Text, _>(datetime_to_string(&since))
            .bind::<BigInt, _>(limit)
            .load::<MessageScoreRow>(conn)?;
            Ok(rows.into_iter().map(MessageScore::from).collect())
        })
        .await
    }
}
