use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use psac_core::{ChannelId, FetchStrategy};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Initializing,
    Authenticating,
    Idle,
    Scraping,
    WaitingForNextCycle,
    Stopped,
    Error,
}

/// Per-channel result of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelOutcome {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub strategy: FetchStrategy,
    pub attempts: u32,
    pub fetched: usize,
    pub new_messages: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub reconciled: usize,
    /// Messages that could not be reconciled and were marked `Failed`.
    pub failed: usize,
    /// `None` when no sweep ran.
    pub removed: Option<usize>,
    pub error: Option<String>,
}

impl ChannelOutcome {
    pub fn new(channel_id: ChannelId, channel_name: impl Into<String>, strategy: FetchStrategy) -> Self {
        Self {
            channel_id,
            channel_name: channel_name.into(),
            strategy,
            attempts: 0,
            fetched: 0,
            new_messages: 0,
            changed: 0,
            unchanged: 0,
            reconciled: 0,
            failed: 0,
            removed: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channels: Vec<ChannelOutcome>,
    pub error: Option<String>,
}

impl CycleReport {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Messages stored this cycle, new and changed versions alike.
    pub fn messages_stored(&self) -> usize {
        self.channels.iter().map(|c| c.new_messages + c.changed).sum()
    }

    pub fn failed_channels(&self) -> usize {
        self.channels.iter().filter(|c| !c.succeeded()).count()
    }
}

/// Immutable copy of the worker state handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    pub enabled: bool,
    pub cycles_completed: u64,
    pub last_cycle: Option<CycleReport>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Worker status shared between the scheduler loop and admin readers.
#[derive(Debug)]
pub struct WorkerState {
    inner: Mutex<WorkerStatus>,
}

impl WorkerState {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Mutex::new(WorkerStatus {
                phase: WorkerPhase::Initializing,
                enabled,
                cycles_completed: 0,
                last_cycle: None,
                last_error: None,
                updated_at: Utc::now(),
            }),
        }
    }

    pub fn snapshot(&self) -> WorkerStatus {
        self.inner.lock().clone()
    }

    pub fn phase(&self) -> WorkerPhase {
        self.inner.lock().phase
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Returns the previous value.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let mut inner = self.inner.lock();
        let previous = inner.enabled;
        inner.enabled = enabled;
        inner.updated_at = Utc::now();
        previous
    }

    pub fn set_phase(&self, phase: WorkerPhase) {
        let mut inner = self.inner.lock();
        inner.phase = phase;
        inner.updated_at = Utc::now();
    }

    pub fn fail(&self, error: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.phase = WorkerPhase::Error;
        inner.last_error = Some(error.into());
        inner.updated_at = Utc::now();
    }

    pub fn record_cycle(&self, report: CycleReport) {
        let mut inner = self.inner.lock();
        inner.cycles_completed += 1;
        if let Some(err) = &report.error {
            inner.last_error = Some(err.clone());
        }
        inner.last_cycle = Some(report);
        inner.updated_at = Utc::now();
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new(true)
    }
}
