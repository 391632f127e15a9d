use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::applier::{VoteApplier, VoteOutcome};
use super::LedgerError;
use crate::db::DatabaseManager;
use crate::platform::{Platform, ReactionOccurrence, RetryPolicy};
use crate::web::metrics::Metrics;

pub struct EventIngest {
    db: Arc<DatabaseManager>,
    platform: Arc<dyn Platform>,
    applier: VoteApplier,
    retry: RetryPolicy,
}

impl EventIngest {
    pub fn new(db: Arc<DatabaseManager>, platform: Arc<dyn Platform>, retry: RetryPolicy) -> Self {
        Self {
            applier: VoteApplier::new(db.clone()),
            db,
            platform,
            retry,
        }
    }

    /// Returns `None` when the occurrence was dropped because its message is gone.
    pub async fn handle(
        &self,
        occurrence: &ReactionOccurrence,
    ) -> Result<Option<VoteOutcome>, LedgerError> {
        let symbols = self.applier.symbols_for(occurrence.community_id).await?;
        if symbols.direction_of(&occurrence.symbol).is_none() {
            Metrics::vote_ignored();
            return Ok(Some(VoteOutcome::Ignored));
        }

        let fetched = self
            .retry
            .run("fetch_message", || {
                self.platform
                    .fetch_message(occurrence.channel_id, occurrence.message_id)
            })
            .await;

        let platform_message = match fetched {
            Ok(message) => message,
            Err(err) if err.is_not_found() => {
                warn!(
                    "dropping reaction on missing message channel_id={} message_id={} voter_id={}",
                    occurrence.channel_id, occurrence.message_id, occurrence.voter_id
                );
                Metrics::occurrence_dropped();
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let message = platform_message.to_message(occurrence.community_id);
        let outcome = self
            .applier
            .apply(
                &symbols,
                &message,
                occurrence.voter_id,
                &occurrence.symbol,
                occurrence.kind,
                occurrence.observed_at,
            )
            .await?;

        if outcome.changed() {
            let users = self.db.user_store();
            users
                .update_display_name(message.author_id, &platform_message.author_name)
                .await?;
            if let Some(voter_name) = occurrence.voter_name.as_deref() {
                users
                    .update_display_name(occurrence.voter_id, voter_name)
                    .await?;
            }
        }

        match outcome {
            VoteOutcome::Applied { direction, new_score, changed: true }
            | VoteOutcome::Retracted { direction, new_score, changed: true } => {
                info!(
                    "{:?} {} on message_id={} author_id={} voter_id={} score={}",
                    occurrence.kind,
                    direction.as_str(),
                    message.id,
                    message.author_id,
                    occurrence.voter_id,
                    new_score
                );
            }
            other => debug!(
                "reaction left ledger unchanged message_id={} outcome={:?}",
                message.id, other
            ),
        }

        Ok(Some(outcome))
    }

    pub async fn process(&self, occurrence: ReactionOccurrence) {
        if let Err(err) = self.handle(&occurrence).await {
            Metrics::occurrence_dropped();
            error!(
                "failed to ingest reaction message_id={} voter_id={}: {}",
                occurrence.message_id, occurrence.voter_id, err
            );
        }
    }
}
