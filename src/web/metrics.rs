use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;
use salvo::http::header::{CONTENT_TYPE, HeaderValue};
use salvo::prelude::*;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);
static VOTES_APPLIED: AtomicU64 = AtomicU64::new(0);
static VOTES_RETRACTED: AtomicU64 = AtomicU64::new(0);
static VOTES_IGNORED: AtomicU64 = AtomicU64::new(0);
static OCCURRENCES_DROPPED: AtomicU64 = AtomicU64::new(0);
static PAGES_SCANNED: AtomicU64 = AtomicU64::new(0);
static PLATFORM_RETRIES: AtomicU64 = AtomicU64::new(0);

pub struct Metrics;

impl Metrics {
    pub fn start() {
        Lazy::force(&STARTED_AT);
    }

    pub fn vote_applied() {
        VOTES_APPLIED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_retracted() {
        VOTES_RETRACTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_ignored() {
        VOTES_IGNORED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn occurrence_dropped() {
        OCCURRENCES_DROPPED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_scanned() {
        PAGES_SCANNED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn platform_retry() {
        PLATFORM_RETRIES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds() -> u64 {
        STARTED_AT.elapsed().as_secs()
    }
}

pub fn format_prometheus() -> String {
    format!(
        r#"# HELP ledger_uptime_seconds Number of seconds the ledger has been running
# TYPE ledger_uptime_seconds gauge
ledger_uptime_seconds {}

# HELP ledger_votes_applied_total Votes that changed the ledger when added
# TYPE ledger_votes_applied_total counter
ledger_votes_applied_total {}

# HELP ledger_votes_retracted_total Votes that changed the ledger when removed
# TYPE ledger_votes_retracted_total counter
ledger_votes_retracted_total {}

# HELP ledger_votes_ignored_total Reactions that were not vote symbols or were self-votes
# TYPE ledger_votes_ignored_total counter
ledger_votes_ignored_total {}

# HELP ledger_occurrences_dropped_total Reaction occurrences dropped because their target was gone or failed
# TYPE ledger_occurrences_dropped_total counter
ledger_occurrences_dropped_total {}

# HELP ledger_scan_pages_total History pages processed by reconciliation scans
# TYPE ledger_scan_pages_total counter
ledger_scan_pages_total {}

# HELP ledger_platform_retries_total Platform calls retried after a transient failure
# TYPE ledger_platform_retries_total counter
ledger_platform_retries_total {}
"#,
        Metrics::uptime_seconds(),
        VOTES_APPLIED.load(Ordering::Relaxed),
        VOTES_RETRACTED.load(Ordering::Relaxed),
        VOTES_IGNORED.load(Ordering::Relaxed),
        OCCURRENCES_DROPPED.load(Ordering::Relaxed),
        PAGES_SCANNED.load(Ordering::Relaxed),
        PLATFORM_RETRIES.load(Ordering::Relaxed),
    )
}

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    res.body(format_prometheus());
}
