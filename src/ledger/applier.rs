use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::db::{DatabaseError, DatabaseManager, Message, VoteDirection, VoteSymbols};
use crate::platform::OccurrenceKind;
use crate::web::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VoteOutcome {
    Ignored,
    SelfVote,
    Applied {
        direction: VoteDirection,
        changed: bool,
        new_score: i64,
    },
    Retracted {
        direction: VoteDirection,
        changed: bool,
        new_score: i64,
    },
}

impl VoteOutcome {
    pub fn changed(&self) -> bool {
        match self {
            VoteOutcome::Applied { changed, .. } | VoteOutcome::Retracted { changed, .. } => {
                *changed
            }
            VoteOutcome::Ignored | VoteOutcome::SelfVote => false,
        }
    }
}

#[derive(Clone)]
pub struct VoteApplier {
    db: Arc<DatabaseManager>,
}

impl VoteApplier {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub async fn symbols_for(&self, community_id: i64) -> Result<VoteSymbols, DatabaseError> {
        self.db.settings_store().vote_symbols(community_id).await
    }

    pub async fn apply(
        &self,
        symbols: &VoteSymbols,
        message: &Message,
        voter_id: i64,
        symbol: &str,
        kind: OccurrenceKind,
        at: DateTime<Utc>,
    ) -> Result<VoteOutcome, DatabaseError> {
        let Some(direction) = symbols.direction_of(symbol) else {
            Metrics::vote_ignored();
            return Ok(VoteOutcome::Ignored);
        };

        if voter_id == message.author_id {
            debug!(
                "self vote ignored user_id={} message_id={}",
                voter_id, message.id
            );
            Metrics::vote_ignored();
            return Ok(VoteOutcome::SelfVote);
        }

        self.db.message_store().record_message(message).await?;

        let votes = self.db.vote_store();
        let outcome = match kind {
            OccurrenceKind::Added => {
                let change = votes
                    .apply_vote(voter_id, message.id, direction, message.author_id, at)
                    .await?;
                if change.changed {
                    Metrics::vote_applied();
                }
                VoteOutcome::Applied {
                    direction,
                    changed: change.changed,
                    new_score: change.new_score,
                }
            }
            OccurrenceKind::Removed => {
                let change = votes
                    .retract_vote(voter_id, message.id, direction, message.author_id)
                    .await?;
                if change.changed {
                    Metrics::vote_retracted();
                }
                VoteOutcome::Retracted {
                    direction,
                    changed: change.changed,
                    new_score: change.new_score,
                }
            }
        };

        debug!(
            "vote processed message_id={} voter_id={} author_id={} {} changed={}",
            message.id,
            voter_id,
            message.author_id,
            direction.as_str(),
            outcome.changed()
        );
        Ok(outcome)
    }
}
