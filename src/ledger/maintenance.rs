use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use super::LedgerError;
use super::scanner::{CommunityScanReport, ReconciliationScanner, ScanControl, ScanMode};
use crate::db::{DatabaseError, DatabaseManager, RecomputeReport};

pub const DELETED_USER_NAME: &str = "[Deleted User]";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefillReport {
    pub users: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub cutoff: DateTime<Utc>,
    pub watermarks_cleared: usize,
    pub communities: Vec<CommunityScanReport>,
    pub offsets_restored: usize,
    pub names: RefillReport,
    pub cancelled: bool,
}

pub struct Maintenance {
    db: Arc<DatabaseManager>,
    scanner: Arc<ReconciliationScanner>,
    refill_concurrency: usize,
}

impl Maintenance {
    pub fn new(
        db: Arc<DatabaseManager>,
        scanner: Arc<ReconciliationScanner>,
        refill_concurrency: usize,
    ) -> Self {
        Self {
            db,
            scanner,
            refill_concurrency: refill_concurrency.max(1),
        }
    }

    /// Destroys all derived vote state and replays history for `communities`.
    /// Offsets come back from the transaction log; messages and settings are kept.
    pub async fn rebuild(
        &self,
        communities: &[i64],
        control: &ScanControl,
    ) -> Result<RebuildReport, LedgerError> {
        let cutoff = Utc::now();
        warn!(
            "destructive rebuild started communities={:?} cutoff={}",
            communities, cutoff
        );

        self.db.vote_store().reset_ledger().await?;
        let watermarks_cleared = self.db.settings_store().clear_watermarks().await?;

        let mut reports = Vec::with_capacity(communities.len());
        let mut cancelled = false;
        for community_id in communities {
            let report = self
                .scanner
                .scan_community_until(*community_id, ScanMode::Full, cutoff, control)
                .await?;
            cancelled = report.cancelled;
            reports.push(report);
            if cancelled {
                break;
            }
        }

        let offsets_restored = self.db.user_store().restore_offsets().await?;
        let names = self.refill_names().await?;

        info!(
            "rebuild finished communities={} offsets_restored={} names_updated={} cancelled={}",
            reports.len(),
            offsets_restored,
            names.updated,
            cancelled
        );

        Ok(RebuildReport {
            cutoff,
            watermarks_cleared,
            communities: reports,
            offsets_restored,
            names,
            cancelled,
        })
    }

    pub async fn recompute(&self) -> Result<RecomputeReport, DatabaseError> {
        recompute(&self.db).await
    }

    pub async fn refill_names(&self) -> Result<RefillReport, DatabaseError> {
        let users = self.db.user_store().list_users().await?;
        let platform = self.scanner.platform();
        let retry = *self.scanner.retry_policy();

        let lookups: Vec<(i64, String, Result<String, crate::platform::PlatformError>)> =
            stream::iter(users)
                .map(|user| {
                    let platform = platform.clone();
                    async move {
                        let name = retry
                            .run("fetch_user_name", || platform.fetch_user_name(user.id))
                            .await;
                        (user.id, user.display_name, name)
                    }
                })
                .buffer_unordered(self.refill_concurrency)
                .collect()
                .await;

        let store = self.db.user_store();
        let mut report = RefillReport {
            users: lookups.len(),
            ..RefillReport::default()
        };
        for (user_id, current, lookup) in lookups {
            let name = match lookup {
                Ok(name) => name,
                Err(err) if err.is_not_found() => {
                    report.deleted += 1;
                    DELETED_USER_NAME.to_string()
                }
                Err(err) => {
                    warn!("name lookup failed user_id={}: {}", user_id, err);
                    report.failed += 1;
                    continue;
                }
            };
            if name != current {
                store.update_display_name(user_id, &name).await?;
                report.updated += 1;
            }
        }

        info!(
            "name refill finished users={} updated={} deleted={} failed={}",
            report.users, report.updated, report.deleted, report.failed
        );
        Ok(report)
    }
}

/// Rebuilds the cached counters from vote rows. Needs no platform access.
pub async fn recompute(db: &DatabaseManager) -> Result<RecomputeReport, DatabaseError> {
    let report = db.vote_store().recompute_aggregates().await?;
    if report.drifted_users > 0 {
        warn!(
            "aggregate drift repaired drifted_users={} pairs_rebuilt={}",
            report.drifted_users, report.pairs_rebuilt
        );
    } else {
        info!("aggregates consistent pairs_rebuilt={}", report.pairs_rebuilt);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::{DELETED_USER_NAME, Maintenance};
    use crate::db::VoteDirection;
    use crate::db::manager::test_support::temp_manager;
    use crate::ledger::scanner::{ReconciliationScanner, ScanControl, ScanSettings};
    use crate::platform::RetryPolicy;
    use crate::platform::fake::{FakePlatform, at};

    fn maintenance(
        db: &Arc<crate::db::DatabaseManager>,
        platform: &Arc<FakePlatform>,
    ) -> Maintenance {
        let scanner = ReconciliationScanner::new(
            db.clone(),
            platform.clone(),
            ScanSettings {
                page_size: 2,
                page_delay: Duration::ZERO,
                excluded_channels: Vec::new(),
                retry: RetryPolicy {
                    attempts: 2,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
            },
        );
        Maintenance::new(db.clone(), Arc::new(scanner), 2)
    }

    #[tokio::test]
    async fn rebuild_converges_to_present_reactions_and_keeps_offsets() {
        let (_file, db) = temp_manager().await;
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel(7, 20);
        platform.post(20, 1, 1);
        platform.post(20, 2, 1);
        platform.post(20, 3, 2);
        platform.react(20, 1, "👍", 2);
        platform.react(20, 2, "👎", 3);
        platform.react(20, 3, "👍", 1);
        platform.set_name(1, "alice");
        platform.set_name(2, "bob");

        let votes = db.vote_store();
        votes.apply_vote(2, 1, VoteDirection::Up, 1, at(1)).await.unwrap();
        votes.apply_vote(3, 2, VoteDirection::Down, 1, at(2)).await.unwrap();
        votes.apply_vote(1, 3, VoteDirection::Up, 2, at(3)).await.unwrap();
        // Drift the counters so the rebuild has something to fix.
        votes.apply_vote(9, 3, VoteDirection::Down, 2, at(3)).await.unwrap();
        db.user_store().adjust_offset(1, 40, "lottery").await.unwrap();
        db.settings_store()
            .advance_watermark(99, 7, 500, at(5))
            .await
            .unwrap();

        let report = maintenance(&db, &platform)
            .rebuild(&[7], &ScanControl::new())
            .await
            .unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.watermarks_cleared, 1);
        assert!(db.settings_store().watermark(99).await.unwrap().is_none());
        assert_eq!(report.communities[0].votes_added(), 3);
        assert_eq!(db.vote_store().count_votes().await.unwrap(), 3);

        let alice = db.user_store().get_user(1).await.unwrap().unwrap();
        assert_eq!(alice.score(), 140);
        assert_eq!(alice.display_name, "alice");
        let bob = db.user_store().get_user(2).await.unwrap().unwrap();
        assert_eq!(bob.score(), 101);
        assert_eq!(report.names.deleted, 1);
        assert_eq!(
            db.user_store().get_user(3).await.unwrap().unwrap().display_name,
            DELETED_USER_NAME
        );
    }

    #[tokio::test]
    async fn recompute_reports_consistent_state() {
        let (_file, db) = temp_manager().await;
        let platform = Arc::new(FakePlatform::new());
        db.vote_store()
            .apply_vote(2, 1, VoteDirection::Up, 1, Utc::now())
            .await
            .unwrap();

        let report = maintenance(&db, &platform).recompute().await.unwrap();
        assert_eq!(report.drifted_users, 0);
        assert_eq!(report.pairs_rebuilt, 1);
    }

    #[tokio::test]
    async fn standalone_recompute_repairs_missing_pairs() {
        let (file, db) = temp_manager().await;
        db.vote_store()
            .apply_vote(2, 1, VoteDirection::Up, 1, Utc::now())
            .await
            .unwrap();
        {
            use diesel::prelude::*;
            let path = file.path().to_string_lossy().to_string();
            let mut conn = SqliteConnection::establish(&path).unwrap();
            diesel::sql_query("UPDATE users SET upvotes_received = 9 WHERE id = 1")
                .execute(&mut conn)
                .unwrap();
        }

        let report = super::recompute(&db).await.unwrap();
        assert_eq!(report.drifted_users, 1);
        assert_eq!(db.user_store().get_user(1).await.unwrap().unwrap().score(), 101);
    }
}
