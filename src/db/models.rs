use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DISPLAY_NAME: &str = "Unknown";
pub const DEFAULT_SCORE_OFFSET: i64 = 100;
pub const DEFAULT_UPVOTE_SYMBOL: &str = "👍";
pub const DEFAULT_DOWNVOTE_SYMBOL: &str = "👎";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerDefaults {
    pub score_offset: i64,
    pub upvote_symbol: String,
    pub downvote_symbol: String,
}

impl Default for LedgerDefaults {
    fn default() -> Self {
        Self {
            score_offset: DEFAULT_SCORE_OFFSET,
            upvote_symbol: DEFAULT_UPVOTE_SYMBOL.to_string(),
            downvote_symbol: DEFAULT_DOWNVOTE_SYMBOL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub display_name: String,
    pub upvotes_received: i64,
    pub downvotes_received: i64,
    pub score_offset: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn score(&self) -> i64 {
        self.upvotes_received - self.downvotes_received + self.score_offset
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub channel_id: i64,
    pub community_id: i64,
    pub author_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    pub fn value(self) -> i32 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VoteDirection::Up => "upvote",
            VoteDirection::Down => "downvote",
        }
    }
}

/// Result of a vote mutation. `changed` is false when the identity was
/// already present (apply) or already absent (retract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteChange {
    pub changed: bool,
    pub new_score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSymbols {
    pub community_id: i64,
    pub upvote: String,
    pub downvote: String,
}

impl VoteSymbols {
    pub fn direction_of(&self, symbol: &str) -> Option<VoteDirection> {
        if symbol == self.upvote {
            Some(VoteDirection::Up)
        } else if symbol == self.downvote {
            Some(VoteDirection::Down)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWatermark {
    pub channel_id: i64,
    pub community_id: i64,
    pub last_message_id: i64,
    pub last_message_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: i64,
    pub user_id: i64,
    pub delta: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReasonTotals {
    pub reason: String,
    pub won: i64,
    pub lost: i64,
    pub net: i64,
    pub entries: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub display_name: String,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanHaterEntry {
    pub user_id: i64,
    pub display_name: String,
    pub upvotes_given: i64,
    pub downvotes_given: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageScore {
    pub message_id: i64,
    pub channel_id: Option<i64>,
    pub community_id: Option<i64>,
    pub author_id: i64,
    pub content: String,
    pub net_votes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberScore {
    pub user_id: i64,
    pub display_name: String,
    pub net_votes: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeReport {
    pub drifted_users: i64,
    pub users_updated: usize,
    pub pairs_rebuilt: usize,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use test_case::test_case;

    use super::*;

    #[test_case(VoteDirection::Up, 1, "upvote")]
    #[test_case(VoteDirection::Down, -1, "downvote")]
    fn vote_direction_encoding(direction: VoteDirection, value: i32, label: &str) {
        assert_eq!(direction.value(), value);
        assert_eq!(direction.as_str(), label);
    }

    #[test]
    fn score_includes_offset() {
        let now = Utc::now();
        let user = User {
            id: 1,
            display_name: "alice".to_string(),
            upvotes_received: 7,
            downvotes_received: 3,
            score_offset: 100,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(user.score(), 104);
    }

    #[test]
    fn unknown_symbol_has_no_direction() {
        let symbols = VoteSymbols {
            community_id: 9,
            upvote: "👍".to_string(),
            downvote: "<:bad:123>".to_string(),
        };
        assert_eq!(symbols.direction_of("👍"), Some(VoteDirection::Up));
        assert_eq!(symbols.direction_of("<:bad:123>"), Some(VoteDirection::Down));
        assert_eq!(symbols.direction_of("⭐"), None);
    }
}
