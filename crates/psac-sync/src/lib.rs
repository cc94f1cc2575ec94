//! Ingestion pipeline: change detection, reconciliation into the catalog and
//! the periodic scheduler that drives both.

pub mod config;
pub mod detector;
pub mod reconcile;
pub mod scheduler;
pub mod state;

pub use config::{Settings, SyncConfig};
pub use detector::{
    detect_change_type, detect_changes, diff_fields, render_diff, ChangeDetector, ChangeKind, ChangeSet, ContentCheck,
    FieldChange, FieldValue, TextChangeType,
};
pub use reconcile::{AvailabilityTransition, EntryEdits, PendingRun, ReconcileOutcome, ReconciliationEngine};
pub use scheduler::{select_strategy, IngestionScheduler};
pub use state::{ChannelOutcome, CycleReport, WorkerPhase, WorkerState, WorkerStatus};

pub const CRATE_NAME: &str = "psac-sync";
