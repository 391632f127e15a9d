use thiserror::Error;

use crate::db::DatabaseError;
use crate::platform::PlatformError;

pub mod applier;
pub mod ingest;
pub mod jobs;
pub mod maintenance;
pub mod queries;
pub mod scanner;

pub use self::ingest::EventIngest;
pub use self::jobs::{ScanRegistry, ScanTarget};
pub use self::maintenance::Maintenance;
pub use self::queries::QueryEngine;
pub use self::scanner::{ReconciliationScanner, ScanControl, ScanMode};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}
