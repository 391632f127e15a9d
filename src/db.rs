pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    FanHaterEntry, LeaderboardEntry, LedgerDefaults, MemberScore, Message, MessageScore,
    ReasonTotals, RecomputeReport, User, VoteDirection, VoteSymbols,
};
pub use self::stores::{MessageStore, QueryStore, SettingsStore, UserStore, VoteStore};

pub mod error;
pub mod manager;
pub mod models;
pub mod schema;
pub mod sqlite;
pub mod stores;
