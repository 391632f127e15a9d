use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::LedgerError;
use super::applier::{VoteApplier, VoteOutcome};
use crate::config::ScanConfig;
use crate::db::{DatabaseManager, VoteSymbols};
use crate::platform::{OccurrenceKind, Platform, PlatformMessage, RetryPolicy};
use crate::web::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Resume,
    Full,
}

#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    cancelled: Arc<AtomicBool>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelScanReport {
    pub channel_id: i64,
    pub pages: u64,
    pub messages: u64,
    pub votes_added: u64,
    pub votes_present: u64,
    pub self_votes: u64,
    pub missing_reactions: u64,
    pub last_message_id: Option<i64>,
    pub cancelled: bool,
}

impl ChannelScanReport {
    fn record(&mut self, outcome: VoteOutcome) {
        match outcome {
            VoteOutcome::Applied { changed: true, .. } => self.votes_added += 1,
            VoteOutcome::Applied { changed: false, .. } => self.votes_present += 1,
            VoteOutcome::SelfVote => self.self_votes += 1,
            VoteOutcome::Ignored | VoteOutcome::Retracted { .. } => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChannel {
    pub channel_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommunityScanReport {
    pub community_id: i64,
    pub mode: ScanMode,
    pub cutoff: DateTime<Utc>,
    pub channels: Vec<ChannelScanReport>,
    pub failed: Vec<FailedChannel>,
    pub cancelled: bool,
}

impl CommunityScanReport {
    pub fn votes_added(&self) -> u64 {
        self.channels.iter().map(|c| c.votes_added).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub page_size: u8,
    pub page_delay: Duration,
    pub excluded_channels: Vec<i64>,
    pub retry: RetryPolicy,
}

impl ScanSettings {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            page_size: config.page_size.clamp(1, 100),
            page_delay: Duration::from_millis(config.page_delay_ms),
            excluded_channels: config.excluded_channels.clone(),
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// Replays reactions that still exist in channel history. Reactions removed
/// before the walk cannot be seen, so the scanner only ever adds votes.
pub struct ReconciliationScanner {
    db: Arc<DatabaseManager>,
    platform: Arc<dyn Platform>,
    applier: VoteApplier,
    settings: ScanSettings,
}

impl ReconciliationScanner {
    pub fn new(db: Arc<DatabaseManager>, platform: Arc<dyn Platform>, settings: ScanSettings) -> Self {
        Self {
            applier: VoteApplier::new(db.clone()),
            db,
            platform,
            settings,
        }
    }

    pub fn platform(&self) -> Arc<dyn Platform> {
        self.platform.clone()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    pub async fn scan_community(
        &self,
        community_id: i64,
        mode: ScanMode,
        control: &ScanControl,
    ) -> Result<CommunityScanReport, LedgerError> {
        self.scan_community_until(community_id, mode, Utc::now(), control)
            .await
    }

    /// Scans every text channel of the community in sequence. A channel that
    /// fails is reported and skipped; the others still run.
    pub async fn scan_community_until(
        &self,
        community_id: i64,
        mode: ScanMode,
        cutoff: DateTime<Utc>,
        control: &ScanControl,
    ) -> Result<CommunityScanReport, LedgerError> {
        let channels = self
            .settings
            .retry
            .run("list_text_channels", || {
                self.platform.list_text_channels(community_id)
            })
            .await?;

        info!(
            "community scan started community_id={} channels={} mode={:?}",
            community_id,
            channels.len(),
            mode
        );

        let mut report = CommunityScanReport {
            community_id,
            mode,
            cutoff,
            channels: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
        };

        for channel in channels {
            if self.settings.excluded_channels.contains(&channel.id) {
                debug!("skipping excluded channel channel_id={}", channel.id);
                continue;
            }
            if control.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self
                .scan_channel(community_id, channel.id, mode, cutoff, control)
                .await
            {
                Ok(channel_report) => {
                    let cancelled = channel_report.cancelled;
                    report.channels.push(channel_report);
                    if cancelled {
                        report.cancelled = true;
                        break;
                    }
                }
                Err(LedgerError::Database(err)) => return Err(err.into()),
                Err(err) => {
                    error!(
                        "channel scan failed community_id={} channel_id={}: {}",
                        community_id, channel.id, err
                    );
                    report.failed.push(FailedChannel {
                        channel_id: channel.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            "community scan finished community_id={} channels={} failed={} votes_added={} cancelled={}",
            community_id,
            report.channels.len(),
            report.failed.len(),
            report.votes_added(),
            report.cancelled
        );
        Ok(report)
    }

    pub async fn scan_channel(
        &self,
        community_id: i64,
        channel_id: i64,
        mode: ScanMode,
        cutoff: DateTime<Utc>,
        control: &ScanControl,
    ) -> Result<ChannelScanReport, LedgerError> {
        let symbols = self.applier.symbols_for(community_id).await?;
        let settings = self.db.settings_store();

        let mut after = match mode {
            ScanMode::Resume => settings
                .watermark(channel_id)
                .await?
                .map(|w| w.last_message_id),
            ScanMode::Full => None,
        };

        let mut report = ChannelScanReport {
            channel_id,
            ..ChannelScanReport::default()
        };

        loop {
            if control.is_cancelled() {
                info!(
                    "channel scan cancelled channel_id={} pages={}",
                    channel_id, report.pages
                );
                report.cancelled = true;
                break;
            }

            let page = self
                .settings
                .retry
                .run("fetch_history_page", || {
                    self.platform.fetch_history_page(
                        channel_id,
                        after,
                        cutoff,
                        self.settings.page_size,
                    )
                })
                .await?;

            let Some(last) = page.last() else {
                break;
            };
            let (last_id, last_at) = (last.id, last.created_at);

            for message in &page {
                self.scan_message(community_id, &symbols, message, &mut report)
                    .await?;
            }

            settings
                .advance_watermark(channel_id, community_id, last_id, last_at)
                .await?;
            after = Some(last_id);
            report.pages += 1;
            report.last_message_id = Some(last_id);
            Metrics::page_scanned();

            debug!(
                "history page processed channel_id={} page={} messages={} last_message_id={}",
                channel_id,
                report.pages,
                page.len(),
                last_id
            );

            if page.len() < self.settings.page_size as usize {
                break;
            }
            if !self.settings.page_delay.is_zero() {
                tokio::time::sleep(self.settings.page_delay).await;
            }
        }

        info!(
            "channel scan finished channel_id={} pages={} messages={} votes_added={}",
            channel_id, report.pages, report.messages, report.votes_added
        );
        Ok(report)
    }

    async fn scan_message(
        &self,
        community_id: i64,
        symbols: &VoteSymbols,
        platform_message: &PlatformMessage,
        report: &mut ChannelScanReport,
    ) -> Result<(), LedgerError> {
        let message = platform_message.to_message(community_id);
        self.db.message_store().record_message(&message).await?;
        report.messages += 1;

        for reaction in &platform_message.reactions {
            if symbols.direction_of(&reaction.symbol).is_none() {
                continue;
            }

            let reactors = self
                .settings
                .retry
                .run("list_reactors", || {
                    self.platform
                        .list_reactors(message.channel_id, message.id, &reaction.symbol)
                })
                .await;
            let reactors = match reactors {
                Ok(reactors) => reactors,
                Err(err) if err.is_not_found() => {
                    warn!(
                        "reaction vanished during scan message_id={} symbol={}",
                        message.id, reaction.symbol
                    );
                    report.missing_reactions += 1;
                    Metrics::occurrence_dropped();
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            for voter_id in reactors {
                let outcome = self
                    .applier
                    .apply(
                        symbols,
                        &message,
                        voter_id,
                        &reaction.symbol,
                        OccurrenceKind::Added,
                        message.created_at,
                    )
                    .await?;
                report.record(outcome);
            }
        }

        Ok(())
    }
}
