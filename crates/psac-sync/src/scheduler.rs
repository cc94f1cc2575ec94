//! The periodic ingestion worker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use psac_core::{
    fingerprint, Actor, CatalogEntry, FetchStrategy, FetchedMessage, MessageStatus, NewChangeRecord, NewRawMessage,
    NotificationEvent, NotificationKind, RawMessage, SourceChannel,
};
use psac_storage::{
    CatalogUnit, ChannelWatermark, EntryWrite, MessageSource, NotificationSink, PipelineStore, SourceError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Settings;
use crate::detector::{detect_change_type, detect_changes, render_diff, ChangeDetector, ContentCheck};
use crate::reconcile::{ReconcileOutcome, ReconciliationEngine};
use crate::state::{ChannelOutcome, CycleReport, WorkerPhase, WorkerState};

const DISABLED_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pick how to fetch a channel: bulk on first sight, incremental when it was
/// scraped recently and the last id is known, otherwise a time window.
pub fn select_strategy(channel: &SourceChannel, settings: &Settings, now: DateTime<Utc>) -> FetchStrategy {
    match (channel.last_scraped_at, channel.last_scraped_external_id) {
        (None, _) => FetchStrategy::LastMessages(channel.bulk_limit.unwrap_or(settings.bulk_limit)),
        (Some(at), Some(last_id)) if now - at <= settings.incremental_window() => FetchStrategy::SinceMessage(last_id),
        (Some(_), _) => FetchStrategy::SinceHours(channel.window_hours.unwrap_or(settings.window_hours)),
    }
}

/// Keep the last occurrence of each external id, ordered by id.
fn collapse_duplicates(messages: Vec<FetchedMessage>) -> Vec<FetchedMessage> {
    messages
        .into_iter()
        .map(|m| (m.external_id, m))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect()
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

pub struct IngestionScheduler {
    store: Arc<dyn PipelineStore>,
    source: Arc<dyn MessageSource>,
    notifier: Arc<dyn NotificationSink>,
    engine: Arc<ReconciliationEngine>,
    detector: ChangeDetector,
    state: Arc<WorkerState>,
    backoff_unit: Duration,
    poll_interval: Duration,
}

impl IngestionScheduler {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        source: Arc<dyn MessageSource>,
        notifier: Arc<dyn NotificationSink>,
        engine: Arc<ReconciliationEngine>,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            detector: ChangeDetector::new(store.clone()),
            store,
            source,
            notifier,
            engine,
            state,
            backoff_unit: Duration::from_secs(1),
            poll_interval: DISABLED_POLL_INTERVAL,
        }
    }

    /// Scale applied to `scraper.retry_backoff_secs` and channel delays.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> Arc<WorkerState> {
        self.state.clone()
    }

    async fn authenticate(&self) -> Result<()> {
        self.state.set_phase(WorkerPhase::Authenticating);
        if let Err(err) = self.source.authenticate().await {
            error!(error = %err, "message source authentication failed; worker halted");
            self.state.fail(format!("authentication failed: {err}"));
            self.notifier
                .notify(NotificationEvent::new(
                    NotificationKind::AuthFailure,
                    None,
                    format!("message source authentication failed: {err}"),
                ))
                .await;
            return Err(anyhow!(err).context("authenticating with message source"));
        }
        info!("message source authenticated");
        Ok(())
    }

    /// Authenticate, then cycle until cancelled. Authentication failure is
    /// final: the worker stays in `Error` and this returns the error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.state.set_phase(WorkerPhase::Initializing);
        self.authenticate().await?;
        self.state.set_phase(WorkerPhase::Idle);

        while !cancel.is_cancelled() {
            let settings = Settings::load(self.store.as_ref()).await;
            if !(self.state.is_enabled() && settings.scraper_enabled) {
                self.state.set_phase(WorkerPhase::Stopped);
                if !sleep_or_cancel(self.poll_interval, &cancel).await {
                    break;
                }
                continue;
            }

            self.state.set_phase(WorkerPhase::Scraping);
            let report = self.run_cycle(&settings, &cancel).await;
            info!(
                run_id = %report.run_id,
                duration_ms = report.duration_ms(),
                messages = report.messages_stored(),
                failed_channels = report.failed_channels(),
                "ingestion cycle finished"
            );
            self.state.record_cycle(report);

            self.state.set_phase(WorkerPhase::WaitingForNextCycle);
            if !sleep_or_cancel(settings.interval(), &cancel).await {
                break;
            }
            self.state.set_phase(WorkerPhase::Idle);
        }

        self.state.set_phase(WorkerPhase::Stopped);
        info!("ingestion worker stopped");
        Ok(())
    }

    /// Authenticate and run exactly one cycle.
    pub async fn run_once(&self) -> Result<CycleReport> {
        self.authenticate().await?;
        let settings = Settings::load(self.store.as_ref()).await;
        self.state.set_phase(WorkerPhase::Scraping);
        let report = self.run_cycle(&settings, &CancellationToken::new()).await;
        self.state.record_cycle(report.clone());
        self.state.set_phase(WorkerPhase::Idle);
        Ok(report)
    }

    /// One pass over every active channel, strictly in sequence.
    pub async fn run_cycle(&self, settings: &Settings, cancel: &CancellationToken) -> CycleReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingestion_cycle", %run_id);

        async {
            let mut report = CycleReport {
                run_id,
                started_at,
                finished_at: started_at,
                channels: Vec::new(),
                error: None,
            };
            let channels = match self.store.list_active_channels().await {
                Ok(channels) => channels,
                Err(err) => {
                    error!(error = %err, "could not list active channels");
                    report.error = Some(format!("listing channels: {err}"));
                    report.finished_at = Utc::now();
                    return report;
                }
            };
            info!(channels = channels.len(), "ingestion cycle started");

            for (index, channel) in channels.iter().enumerate() {
                if cancel.is_cancelled() {
                    info!("cancellation requested; ending cycle early");
                    break;
                }
                if index > 0 && channel.delay_secs > 0 {
                    let delay = self.backoff_unit.saturating_mul(channel.delay_secs as u32);
                    if !sleep_or_cancel(delay, cancel).await {
                        break;
                    }
                }
                let outcome = self
                    .scrape_channel(channel, settings, cancel)
                    .instrument(info_span!("channel_scrape", channel_id = channel.id, channel = %channel.name))
                    .await;
                report.channels.push(outcome);
            }

            report.finished_at = Utc::now();
            report
        }
        .instrument(span)
        .await
    }

    /// Fetch with retries, then ingest. Never fails: errors end up on the
    /// returned outcome.
    pub async fn scrape_channel(
        &self,
        channel: &SourceChannel,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> ChannelOutcome {
        let now = Utc::now();
        let strategy = select_strategy(channel, settings, now);
        let mut outcome = ChannelOutcome::new(channel.id, channel.name.clone(), strategy);
        debug!(?strategy, "fetching channel");

        let fetched = match self.fetch_with_retry(channel, strategy, settings, &mut outcome, cancel).await {
            Ok(fetched) => fetched,
            Err(err) if cancel.is_cancelled() => {
                info!(attempts = outcome.attempts, error = %err, "channel fetch abandoned on shutdown");
                outcome.error = Some(format!("cancelled: {err}"));
                return outcome;
            }
            Err(err) => {
                warn!(attempts = outcome.attempts, error = %err, "channel fetch failed; moving on");
                outcome.error = Some(err.to_string());
                self.notifier
                    .notify(NotificationEvent::new(
                        NotificationKind::ChannelFailed,
                        Some(channel.id),
                        format!("channel {} failed after {} attempts: {err}", channel.name, outcome.attempts),
                    ))
                    .await;
                return outcome;
            }
        };

        if let Err(err) = self.ingest(channel, strategy, fetched, settings, &mut outcome).await {
            error!(error = %err, "channel ingestion failed");
            outcome.error = Some(format!("{err:#}"));
        }
        outcome
    }

    async fn fetch_with_retry(
        &self,
        channel: &SourceChannel,
        strategy: FetchStrategy,
        settings: &Settings,
        outcome: &mut ChannelOutcome,
        cancel: &CancellationToken,
    ) -> Result<Vec<FetchedMessage>, SourceError> {
        let attempts = settings.retry_attempts.max(1);
        let mut last_error = SourceError::Transient("no fetch attempted".to_string());
        for attempt in 1..=attempts {
            outcome.attempts = attempt;
            match self.source.fetch_messages(&channel.external_id, strategy).await {
                Ok(messages) => return Ok(messages),
                Err(err) => {
                    warn!(attempt, max = attempts, error = %err, "fetch attempt failed");
                    last_error = err;
                    if attempt < attempts {
                        let backoff = self
                            .backoff_unit
                            .saturating_mul((settings.retry_backoff_secs as u32).saturating_mul(attempt));
                        if !sleep_or_cancel(backoff, cancel).await {
                            break;
                        }
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn ingest(
        &self,
        channel: &SourceChannel,
        strategy: FetchStrategy,
        fetched: Vec<FetchedMessage>,
        settings: &Settings,
        outcome: &mut ChannelOutcome,
    ) -> Result<()> {
        let now = Utc::now();
        let messages = collapse_duplicates(fetched);
        outcome.fetched = messages.len();
        let fetched_ids = messages.iter().map(|m| m.external_id).collect::<BTreeSet<_>>();

        let mut batch = Vec::new();
        for message in messages {
            let hash = fingerprint(&message.text);
            let check = self.detector.check_content(channel.id, message.external_id, &hash).await;
            let (previous_version_id, diff) = match check {
                ContentCheck::Unchanged => {
                    outcome.unchanged += 1;
                    continue;
                }
                ContentCheck::New | ContentCheck::Unknown => {
                    outcome.new_messages += 1;
                    (None, None)
                }
                ContentCheck::Changed(previous) => {
                    outcome.changed += 1;
                    let diff = self.describe_change(channel, &previous.text, &message.text, message.external_id);
                    (Some(previous.id), Some(diff))
                }
            };
            batch.push(NewRawMessage {
                channel_id: channel.id,
                external_id: message.external_id,
                text: message.text,
                received_at: message.received_at,
                content_hash: Some(hash),
                status: MessageStatus::Pending,
                diff,
                previous_version_id,
            });
        }

        let inserted = if batch.is_empty() {
            Vec::new()
        } else {
            self.store
                .insert_messages(batch)
                .await
                .context("saving new messages")?
        };

        for message in inserted {
            let (id, external_id) = (message.id, message.external_id);
            if let Err(err) = self.settle_message(channel, message, outcome).await {
                warn!(message_id = id, external_id, error = %format!("{err:#}"), "message not reconciled; marking failed");
                outcome.failed += 1;
                if let Err(err) = self.detector.mark_failed(id, Actor::Scraper).await {
                    warn!(message_id = id, error = %err, "could not mark message failed");
                }
            }
        }

        // Entries seen in this fetch are live regardless of content changes.
        let seen = fetched_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>();
        if !seen.is_empty() {
            self.store
                .touch_entries(channel.id, &seen, now)
                .await
                .context("refreshing entry scrape times")?;
        }

        let swept_at = match self.sweep(channel, strategy, &fetched_ids, settings, now).await? {
            Some(removed) => {
                outcome.removed = Some(removed);
                Some(now)
            }
            None => None,
        };

        let watermark = ChannelWatermark {
            last_scraped_at: now,
            last_scraped_external_id: fetched_ids.last().copied().or(channel.last_scraped_external_id),
            last_swept_at: swept_at,
        };
        self.store
            .save_watermark(channel.id, watermark)
            .await
            .context("saving channel watermark")?;
        debug!(
            new = outcome.new_messages,
            changed = outcome.changed,
            unchanged = outcome.unchanged,
            "channel ingested"
        );
        Ok(())
    }

    /// Parse one freshly stored message and reconcile it, or settle it as
    /// `Ignored`/`Deleted` when there is nothing to reconcile.
    async fn settle_message(
        &self,
        channel: &SourceChannel,
        mut message: RawMessage,
        outcome: &mut ChannelOutcome,
    ) -> Result<()> {
        let key = message.external_id.to_string();
        let handled = match self.engine.parse(&channel.profile, &message.text, &key) {
            Some(parsed) => {
                let result = self
                    .engine
                    .reconcile_message(channel.id, Some(&parsed), Some(message.id))
                    .await
                    .with_context(|| format!("reconciling message {}", message.external_id))?;
                if result.entry_id().is_some() {
                    outcome.reconciled += 1;
                }
                !matches!(result, ReconcileOutcome::Skipped | ReconcileOutcome::SkippedSold)
            }
            None => false,
        };
        if !handled {
            message.status = if message.text.trim().is_empty() {
                MessageStatus::Deleted
            } else {
                MessageStatus::Ignored
            };
            message.updated_at = Some(Utc::now());
            message.updated_by = Some(Actor::Scraper);
            self.store
                .update_message(&message)
                .await
                .with_context(|| format!("updating message {}", message.external_id))?;
        }
        Ok(())
    }

    /// Structured diff of the re-parsed texts, or the raw-text heuristic when
    /// either side does not parse.
    fn describe_change(&self, channel: &SourceChannel, old_text: &str, new_text: &str, external_id: i64) -> String {
        let key = external_id.to_string();
        let old = self.engine.parse(&channel.profile, old_text, &key);
        let new = self.engine.parse(&channel.profile, new_text, &key);
        match (&old, &new) {
            (Some(_), Some(_)) => render_diff(&detect_changes(old.as_ref(), new.as_ref())),
            _ => format!("change: {}", detect_change_type(old_text, new_text)),
        }
    }

    /// Soft-delete entries missing from a full or windowed fetch, plus entries
    /// unseen for longer than the max age. Returns `None` when skipped.
    async fn sweep(
        &self,
        channel: &SourceChannel,
        strategy: FetchStrategy,
        fetched_ids: &BTreeSet<i64>,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>> {
        if !settings.sweep_enabled || strategy.is_incremental() {
            return Ok(None);
        }
        if let Some(last) = channel.last_swept_at {
            if now - last < settings.sweep_interval() {
                return Ok(None);
            }
        }

        let mut doomed = BTreeMap::<i64, CatalogEntry>::new();
        if let Some(min_id) = fetched_ids.first() {
            let live = self
                .store
                .list_live_entries(channel.id)
                .await
                .context("listing live entries")?;
            for entry in live {
                let Ok(id) = entry.external_id.parse::<i64>() else {
                    continue;
                };
                if id >= *min_id && !fetched_ids.contains(&id) {
                    doomed.insert(entry.id, entry);
                }
            }
        }
        let cutoff = now
            .checked_sub_signed(settings.sweep_max_age())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = self
            .store
            .find_stale_entries(channel.id, cutoff)
            .await
            .context("listing stale entries")?;
        for entry in stale {
            let seen = entry
                .external_id
                .parse::<i64>()
                .is_ok_and(|id| fetched_ids.contains(&id));
            if !seen {
                doomed.insert(entry.id, entry);
            }
        }

        let removed = doomed.len();
        for (_, entry) in doomed {
            let mut unit = CatalogUnit::new(EntryWrite::Update(CatalogEntry {
                is_deleted: true,
                ..entry.clone()
            }));
            unit.history.push(NewChangeRecord {
                field: "is_deleted".to_string(),
                old_value: Some("false".to_string()),
                new_value: Some("true".to_string()),
                changed_at: now,
                actor: Actor::Scraper,
            });
            self.store
                .commit(unit)
                .await
                .with_context(|| format!("soft-deleting entry {}", entry.id))?;
            debug!(entry_id = entry.id, external_id = %entry.external_id, "entry swept");
        }

        if removed > 0 {
            info!(removed, "stale sweep removed entries");
        }
        if removed > settings.sweep_notify_threshold {
            self.notifier
                .notify(NotificationEvent::new(
                    NotificationKind::BulkRemoval,
                    Some(channel.id),
                    format!("sweep removed {removed} entries from channel {}", channel.name),
                ))
                .await;
        }
        Ok(Some(removed))
    }
}
