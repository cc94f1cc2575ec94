//! Merging parsed listings into the catalog.
//!
//! Two paths share the same storage unit of work:
//! the scraper path ([`ReconciliationEngine::reconcile`]) overwrites the core
//! fields and tracks only sold-status transitions, while the admin path
//! ([`ReconciliationEngine::process_and_save`]) re-parses the message, applies
//! operator edits, diffs every field and syncs game associations.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use psac_core::{
    Actor, CapacityTier, CatalogEntry, ChannelId, EntryId, Game, Include, MessageId, MessageStatus, NewCatalogEntry,
    NewChangeRecord, ParsedResult, StockStatus,
};
use psac_parser::{MessageParser, ProfileRegistry};
use psac_storage::{
    CatalogUnit, CommitOutcome, EntryWrite, GameSync, MessageUpdate, PipelineStore, StoreError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detector::{diff_fields, ChangeDetector, ENTRY_FIELDS};

/// What the scraper path did with one parse result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// No result or no external id.
    Skipped,
    /// First sighting was already sold; nothing is created.
    SkippedSold,
    Created { entry_id: EntryId },
    Updated {
        entry_id: EntryId,
        transition: Option<AvailabilityTransition>,
    },
}

impl ReconcileOutcome {
    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            ReconcileOutcome::Created { entry_id } | ReconcileOutcome::Updated { entry_id, .. } => Some(*entry_id),
            ReconcileOutcome::Skipped | ReconcileOutcome::SkippedSold => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityTransition {
    MarkedSold,
    Relisted,
}

/// Operator-supplied overrides for the admin path. Unset fields come from the
/// re-parsed message text.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EntryEdits {
    pub title: Option<String>,
    pub price_ps4: Option<f64>,
    pub price_ps5: Option<f64>,
    pub region: Option<String>,
    pub capacity: Option<CapacityTier>,
    pub has_original_mail: Option<bool>,
    pub guarantee: Option<String>,
    pub seller_info: Option<String>,
    pub additional_info: Option<String>,
    pub stock_status: Option<StockStatus>,
    pub games: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingRun {
    pub processed: usize,
    pub failed: usize,
}

pub struct ReconciliationEngine {
    store: Arc<dyn PipelineStore>,
    parser: MessageParser,
    profiles: Arc<ProfileRegistry>,
}

fn availability_record(old: &CatalogEntry, new: &CatalogEntry, at: DateTime<Utc>) -> NewChangeRecord {
    let (field, old_value, new_value) = if old.stock_status != new.stock_status {
        ("stock_status", old.stock_status.to_string(), new.stock_status.to_string())
    } else {
        ("is_deleted", old.is_deleted.to_string(), new.is_deleted.to_string())
    };
    NewChangeRecord {
        field: field.to_string(),
        old_value: Some(old_value),
        new_value: Some(new_value),
        changed_at: at,
        actor: Actor::Scraper,
    }
}

/// Trim, drop blanks and de-duplicate case-insensitively, keeping first-seen
/// order.
fn clean_titles(titles: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    titles
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .map(ToString::to_string)
        .collect()
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn PipelineStore>, profiles: Arc<ProfileRegistry>) -> Self {
        Self {
            store,
            parser: MessageParser::new(),
            profiles,
        }
    }

    pub fn with_parser(mut self, parser: MessageParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    /// Parse `text` with the named profile.
    pub fn parse(&self, profile: &str, text: &str, message_key: &str) -> Option<ParsedResult> {
        self.parser.parse(text, message_key, self.profiles.rules_for(profile))
    }

    /// Scraper path without a source message to update.
    pub async fn reconcile(&self, channel_id: ChannelId, parsed: Option<&ParsedResult>) -> Result<ReconcileOutcome> {
        self.reconcile_message(channel_id, parsed, None).await
    }

    /// Scraper path. When an entry is written and `message_id` is given, the
    /// message moves to `Processed` in the same unit of work.
    pub async fn reconcile_message(
        &self,
        channel_id: ChannelId,
        parsed: Option<&ParsedResult>,
        message_id: Option<MessageId>,
    ) -> Result<ReconcileOutcome> {
        let Some(parsed) = parsed else {
            debug!(channel_id, "nothing parsed; skipping reconcile");
            return Ok(ReconcileOutcome::Skipped);
        };
        let Some(external_id) = parsed.external_id.as_deref().filter(|id| !id.trim().is_empty()) else {
            debug!(channel_id, "parse result has no external id; skipping reconcile");
            return Ok(ReconcileOutcome::Skipped);
        };

        let now = Utc::now();
        let existing = self
            .store
            .find_entry(channel_id, external_id, Include::Nothing)
            .await
            .with_context(|| format!("looking up catalog entry {channel_id}/{external_id}"))?;
        let message = message_id.map(|id| MessageUpdate {
            id,
            status: MessageStatus::Processed,
            actor: Actor::Scraper,
        });

        let Some(existing) = existing else {
            if parsed.is_sold {
                debug!(channel_id, external_id, "first sighting already sold; not creating entry");
                return Ok(ReconcileOutcome::SkippedSold);
            }
            let capacity = match parsed.capacity {
                CapacityTier::Unknown => CapacityTier::OfflineOnly,
                known => known,
            };
            let mut unit = CatalogUnit::new(EntryWrite::Insert(NewCatalogEntry {
                channel_id,
                external_id: external_id.to_string(),
                title: parsed.title.clone().unwrap_or_else(|| format!("listing {external_id}")),
                price_ps4: parsed.price_ps4,
                price_ps5: parsed.price_ps5,
                region: parsed.region.clone(),
                capacity,
                has_original_mail: parsed.has_original_mail,
                guarantee: None,
                seller_info: None,
                additional_info: None,
                stock_status: StockStatus::InStock,
                is_deleted: false,
                last_scraped_at: now,
            }));
            unit.message = message;
            let outcome = self.store.commit(unit).await.context("inserting catalog entry")?;
            info!(channel_id, external_id, entry_id = outcome.entry_id, "catalog entry created");
            return Ok(ReconcileOutcome::Created {
                entry_id: outcome.entry_id,
            });
        };

        let mut updated = existing.clone();
        if let Some(title) = parsed.title.as_ref().filter(|t| !t.trim().is_empty()) {
            updated.title = title.clone();
        }
        updated.price_ps4 = parsed.price_ps4;
        updated.price_ps5 = parsed.price_ps5;
        updated.region = parsed.region.clone();
        updated.last_scraped_at = now;

        let transition = if parsed.is_sold {
            updated.is_deleted = true;
            updated.stock_status = StockStatus::OutOfStock;
            (!existing.is_deleted).then_some(AvailabilityTransition::MarkedSold)
        } else {
            updated.is_deleted = false;
            updated.stock_status = StockStatus::InStock;
            existing.is_deleted.then_some(AvailabilityTransition::Relisted)
        };

        let mut unit = CatalogUnit::new(EntryWrite::Update(updated.clone()));
        if transition.is_some() {
            unit.history.push(availability_record(&existing, &updated, now));
        }
        unit.message = message;
        self.store.commit(unit).await.context("updating catalog entry")?;

        match transition {
            Some(AvailabilityTransition::MarkedSold) => {
                info!(channel_id, external_id, entry_id = existing.id, "listing sold; entry removed")
            }
            Some(AvailabilityTransition::Relisted) => {
                info!(channel_id, external_id, entry_id = existing.id, "listing re-listed")
            }
            None => debug!(channel_id, external_id, entry_id = existing.id, "catalog entry refreshed"),
        }
        Ok(ReconcileOutcome::Updated {
            entry_id: existing.id,
            transition,
        })
    }

    /// Admin path: rebuild the entry for `message_id` from the latest text in
    /// its chain plus `edits`, record one history row per changed field, sync
    /// game associations by set difference and mark the message processed.
    pub async fn process_and_save(
        &self,
        message_id: MessageId,
        edits: Option<EntryEdits>,
        actor: Actor,
    ) -> Result<CommitOutcome> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "raw message",
                id: message_id,
            })?;
        let channel = self
            .store
            .get_channel(message.channel_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "channel",
                id: message.channel_id,
            })?;
        let latest = self
            .store
            .find_latest_message(message.channel_id, message.external_id)
            .await?
            .unwrap_or_else(|| message.clone());

        let external_id = message.external_id.to_string();
        let parsed = self
            .parse(&channel.profile, &latest.text, &external_id)
            .unwrap_or_default();
        let edits = edits.unwrap_or_default();

        let existing = self
            .store
            .find_entry(channel.id, &external_id, Include::Games)
            .await
            .context("looking up catalog entry")?;

        let now = Utc::now();
        let capacity = edits.capacity.unwrap_or(match (parsed.capacity, &existing) {
            (CapacityTier::Unknown, Some(entry)) => entry.capacity,
            (tier, _) => tier,
        });
        let stock_status = edits.stock_status.unwrap_or(if parsed.is_sold {
            StockStatus::OutOfStock
        } else {
            StockStatus::InStock
        });
        let title = edits
            .title
            .clone()
            .or_else(|| parsed.title.clone())
            .or_else(|| existing.as_ref().map(|e| e.title.clone()))
            .unwrap_or_else(|| format!("listing {external_id}"));

        let titles = clean_titles(edits.games.as_deref().unwrap_or(&parsed.games));
        let known = self
            .store
            .find_games_by_titles(&titles)
            .await
            .context("resolving games")?;
        let (desired, missing) = partition_titles(&titles, &known);
        let current = existing
            .as_ref()
            .and_then(|e| e.games.loaded())
            .map(|games| games.iter().map(|g| g.id).collect::<BTreeSet<_>>())
            .unwrap_or_default();

        let games = GameSync {
            link: desired.difference(&current).copied().collect(),
            create_and_link: missing,
            unlink: current.difference(&desired).copied().collect(),
        };

        let mut unit = match &existing {
            Some(old) => {
                let mut new = old.clone();
                new.title = title;
                new.price_ps4 = edits.price_ps4.or(parsed.price_ps4);
                new.price_ps5 = edits.price_ps5.or(parsed.price_ps5);
                new.region = edits.region.clone().or(parsed.region.clone());
                new.capacity = capacity;
                new.has_original_mail = edits.has_original_mail.unwrap_or(parsed.has_original_mail);
                new.guarantee = edits.guarantee.clone().or(parsed.guarantee.clone());
                new.seller_info = edits.seller_info.clone().or(parsed.seller_info.clone());
                new.additional_info = edits.additional_info.clone().or(parsed.additional_info.clone());
                new.stock_status = stock_status;
                new.is_deleted = stock_status == StockStatus::OutOfStock;
                new.last_scraped_at = now;

                let mut history = diff_fields(&ENTRY_FIELDS, old, &new)
                    .into_iter()
                    .map(|change| NewChangeRecord {
                        field: change.field.to_string(),
                        old_value: change.old,
                        new_value: change.new,
                        changed_at: now,
                        actor: actor.clone(),
                    })
                    .collect::<Vec<_>>();
                if !games.is_empty() {
                    let before = old.games.loaded().map(|g| join_titles(g)).unwrap_or_default();
                    history.push(NewChangeRecord {
                        field: "games".to_string(),
                        old_value: Some(before).filter(|s| !s.is_empty()),
                        new_value: Some(titles.join(", ")).filter(|s| !s.is_empty()),
                        changed_at: now,
                        actor: actor.clone(),
                    });
                }

                let mut unit = CatalogUnit::new(EntryWrite::Update(new));
                unit.history = history;
                unit
            }
            None => CatalogUnit::new(EntryWrite::Insert(NewCatalogEntry {
                channel_id: channel.id,
                external_id: external_id.clone(),
                title,
                price_ps4: edits.price_ps4.or(parsed.price_ps4),
                price_ps5: edits.price_ps5.or(parsed.price_ps5),
                region: edits.region.clone().or(parsed.region.clone()),
                capacity,
                has_original_mail: edits.has_original_mail.unwrap_or(parsed.has_original_mail),
                guarantee: edits.guarantee.clone().or(parsed.guarantee.clone()),
                seller_info: edits.seller_info.clone().or(parsed.seller_info.clone()),
                additional_info: edits.additional_info.clone().or(parsed.additional_info.clone()),
                stock_status,
                is_deleted: stock_status == StockStatus::OutOfStock,
                last_scraped_at: now,
            })),
        };
        unit.games = games;
        unit.message = Some(MessageUpdate {
            id: message_id,
            status: MessageStatus::Processed,
            actor: actor.clone(),
        });

        let outcome = self
            .store
            .commit(unit)
            .await
            .with_context(|| format!("saving message {message_id}"))?;
        info!(
            message_id,
            entry_id = outcome.entry_id,
            created = outcome.created,
            changes = outcome.history.len(),
            new_games = outcome.created_games.len(),
            %actor,
            "message processed"
        );
        Ok(outcome)
    }

    /// Run the admin path over a channel's `Pending` messages. Messages that
    /// fail are moved to `Failed` and the run continues.
    pub async fn process_pending(
        &self,
        channel_id: Option<ChannelId>,
        limit: usize,
        actor: Actor,
    ) -> Result<PendingRun> {
        let pending = self
            .store
            .list_messages_by_status(channel_id, MessageStatus::Pending, limit)
            .await
            .context("listing pending messages")?;
        let detector = ChangeDetector::new(self.store.clone());
        let mut run = PendingRun::default();
        for message in pending {
            match self.process_and_save(message.id, None, actor.clone()).await {
                Ok(_) => run.processed += 1,
                Err(err) => {
                    warn!(message_id = message.id, error = %err, "processing pending message failed");
                    run.failed += 1;
                    if let Err(err) = detector.mark_failed(message.id, actor.clone()).await {
                        warn!(message_id = message.id, error = %err, "could not mark message failed");
                    }
                }
            }
        }
        Ok(run)
    }
}

fn partition_titles(titles: &[String], known: &[Game]) -> (BTreeSet<i64>, Vec<String>) {
    let mut desired = BTreeSet::new();
    let mut missing = Vec::new();
    for title in titles {
        let wanted = title.to_lowercase();
        match known.iter().find(|g| g.title.trim().to_lowercase() == wanted) {
            Some(game) => {
                desired.insert(game.id);
            }
            None => missing.push(title.clone()),
        }
    }
    (desired, missing)
}

fn join_titles(games: &[Game]) -> String {
    games.iter().map(|g| g.title.as_str()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use psac_core::{NewRawMessage, RawMessage, SourceChannel};
    use psac_storage::{CatalogStore, ChannelStore, HistoryStore, InMemoryStore, RawMessageStore};

    async fn setup() -> (Arc<InMemoryStore>, ReconciliationEngine, SourceChannel) {
        let store = Arc::new(InMemoryStore::new());
        let channel = store
            .register_channel(SourceChannel {
                id: 0,
                external_id: "ps_market".into(),
                name: "PS Market".into(),
                is_active: true,
                profile: "default".into(),
                delay_secs: 0,
                bulk_limit: None,
                window_hours: None,
                last_scraped_at: None,
                last_scraped_external_id: None,
                last_swept_at: None,
            })
            .await
            .unwrap();
        let engine = ReconciliationEngine::new(store.clone(), Arc::new(ProfileRegistry::default()));
        (store, engine, channel)
    }

    fn parsed(external_id: &str, sold: bool) -> ParsedResult {
        ParsedResult {
            external_id: Some(external_id.into()),
            title: Some("Elden Ring".into()),
            price_ps4: Some(1500.0),
            is_sold: sold,
            ..ParsedResult::default()
        }
    }

    async fn store_message(store: &InMemoryStore, channel_id: ChannelId, external_id: i64, text: &str) -> RawMessage {
        store
            .insert_messages(vec![NewRawMessage {
                channel_id,
                external_id,
                text: text.into(),
                received_at: Utc::now(),
                content_hash: Some(psac_core::fingerprint(text)),
                status: MessageStatus::Pending,
                diff: None,
                previous_version_id: None,
            }])
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn unsold_first_sighting_creates_in_stock_entry() {
        let (store, engine, channel) = setup().await;
        let outcome = engine.reconcile(channel.id, Some(&parsed("10", false))).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Created { .. }));

        let entry = store.find_entry(channel.id, "10", Include::Nothing).await.unwrap().unwrap();
        assert_eq!(entry.stock_status, StockStatus::InStock);
        assert!(!entry.is_deleted);
        assert_eq!(entry.capacity, CapacityTier::OfflineOnly);
        assert_eq!(entry.price_ps4, Some(1500.0));
    }

    #[tokio::test]
    async fn sold_first_sighting_creates_nothing() {
        let (store, engine, channel) = setup().await;
        let outcome = engine.reconcile(channel.id, Some(&parsed("10", true))).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::SkippedSold);
        assert!(store.entries().await.is_empty());
    }

    #[tokio::test]
    async fn missing_result_or_key_is_a_no_op() {
        let (store, engine, channel) = setup().await;
        assert_eq!(engine.reconcile(channel.id, None).await.unwrap(), ReconcileOutcome::Skipped);
        let mut keyless = parsed("10", false);
        keyless.external_id = None;
        assert_eq!(
            engine.reconcile(channel.id, Some(&keyless)).await.unwrap(),
            ReconcileOutcome::Skipped
        );
        assert!(store.entries().await.is_empty());
    }

    #[tokio::test]
    async fn sold_transition_is_recorded_once() {
        let (store, engine, channel) = setup().await;
        engine.reconcile(channel.id, Some(&parsed("10", false))).await.unwrap();

        let first = engine.reconcile(channel.id, Some(&parsed("10", true))).await.unwrap();
        let ReconcileOutcome::Updated { entry_id, transition } = first else {
            panic!("expected update, got {first:?}");
        };
        assert_eq!(transition, Some(AvailabilityTransition::MarkedSold));
        let entry = store.find_entry(channel.id, "10", Include::Nothing).await.unwrap().unwrap();
        assert!(entry.is_deleted);
        assert_eq!(entry.stock_status, StockStatus::OutOfStock);

        let again = engine.reconcile(channel.id, Some(&parsed("10", true))).await.unwrap();
        assert_eq!(
            again,
            ReconcileOutcome::Updated {
                entry_id,
                transition: None
            }
        );
        let history = store.history_for(entry_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].field, "stock_status");
        assert_eq!(history[0].new_value.as_deref(), Some("out_of_stock"));
        assert_eq!(history[0].actor, Actor::Scraper);
    }

    #[tokio::test]
    async fn relisting_clears_the_soft_delete() {
        let (store, engine, channel) = setup().await;
        engine.reconcile(channel.id, Some(&parsed("10", false))).await.unwrap();
        engine.reconcile(channel.id, Some(&parsed("10", true))).await.unwrap();
        let outcome = engine.reconcile(channel.id, Some(&parsed("10", false))).await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Updated {
                transition: Some(AvailabilityTransition::Relisted),
                ..
            }
        ));
        let entry = store.find_entry(channel.id, "10", Include::Nothing).await.unwrap().unwrap();
        assert!(!entry.is_deleted);
        assert_eq!(entry.stock_status, StockStatus::InStock);
    }

    #[tokio::test]
    async fn reconcile_links_and_processes_the_message_together() {
        let (store, engine, channel) = setup().await;
        let message = store_message(&store, channel.id, 10, "Elden Ring").await;
        let outcome = engine
            .reconcile_message(channel.id, Some(&parsed("10", false)), Some(message.id))
            .await
            .unwrap();
        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Processed);
        assert_eq!(stored.catalog_entry_id, outcome.entry_id());
    }

    const LISTING: &str = "Игры:\n- God of War\n- Spider-Man 2\nЦена PS4: 1500\nРегион: Турция";

    #[tokio::test]
    async fn admin_path_creates_entry_with_games() {
        let (store, engine, channel) = setup().await;
        let message = store_message(&store, channel.id, 77, LISTING).await;

        let outcome = engine
            .process_and_save(message.id, None, Actor::from("alice"))
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.created_games.len(), 2);

        let entry = store.find_entry(channel.id, "77", Include::Games).await.unwrap().unwrap();
        assert_eq!(entry.title, "God of War");
        assert_eq!(entry.region.as_deref(), Some("Турция"));
        let titles = entry.games.loaded().unwrap().iter().map(|g| g.title.clone()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["God of War".to_string(), "Spider-Man 2".to_string()]);
        let message = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Processed);
        assert_eq!(message.updated_by, Some(Actor::Admin("alice".into())));
    }

    #[tokio::test]
    async fn admin_path_inserts_out_of_stock_listings_soft_deleted() {
        let (store, engine, channel) = setup().await;
        let message = store_message(&store, channel.id, 78, LISTING).await;
        let edits = EntryEdits {
            stock_status: Some(StockStatus::OutOfStock),
            ..EntryEdits::default()
        };

        let outcome = engine
            .process_and_save(message.id, Some(edits), Actor::from("alice"))
            .await
            .unwrap();
        assert!(outcome.created);

        let entry = store.find_entry(channel.id, "78", Include::Nothing).await.unwrap().unwrap();
        assert_eq!(entry.stock_status, StockStatus::OutOfStock);
        assert!(entry.is_deleted);
        assert!(store.list_live_entries(channel.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_edits_produce_one_history_row_per_field_and_set_diff_games() {
        let (store, engine, channel) = setup().await;
        let message = store_message(&store, channel.id, 77, LISTING).await;
        engine
            .process_and_save(message.id, None, Actor::from("alice"))
            .await
            .unwrap();
        let before = store.find_entry(channel.id, "77", Include::Games).await.unwrap().unwrap();
        let kept = before
            .games
            .loaded()
            .unwrap()
            .iter()
            .find(|g| g.title == "God of War")
            .cloned()
            .unwrap();

        let edits = EntryEdits {
            price_ps4: Some(1700.0),
            region: Some("India".into()),
            games: Some(vec![" god of war ".into(), "Bloodborne".into(), "BLOODBORNE".into()]),
            ..EntryEdits::default()
        };
        let outcome = engine
            .process_and_save(message.id, Some(edits), Actor::from("bob"))
            .await
            .unwrap();
        assert!(!outcome.created);
        let fields = outcome.history.iter().map(|h| h.field.as_str()).collect::<BTreeSet<_>>();
        assert_eq!(fields, BTreeSet::from(["price_ps4", "region", "games"]));
        assert!(outcome.history.iter().all(|h| h.actor == Actor::Admin("bob".into())));
        assert_eq!(outcome.created_games.len(), 1);

        let after = store.find_entry(channel.id, "77", Include::Games).await.unwrap().unwrap();
        let games = after.games.loaded().unwrap();
        assert_eq!(games.len(), 2);
        assert!(games.contains(&kept));
        assert!(games.iter().any(|g| g.title == "Bloodborne"));
    }

    #[tokio::test]
    async fn admin_path_refuses_messages_awaiting_review() {
        let (store, engine, channel) = setup().await;
        let mut message = store_message(&store, channel.id, 77, LISTING).await;
        message.status = MessageStatus::PendingChange;
        store.update_message(&message).await.unwrap();

        let err = engine
            .process_and_save(message.id, None, Actor::from("alice"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::IllegalTransition { .. })
        ));
        assert!(store.entries().await.is_empty());
    }

    #[tokio::test]
    async fn pending_messages_are_processed_in_bulk() {
        let (store, engine, channel) = setup().await;
        store_message(&store, channel.id, 1, LISTING).await;
        store_message(&store, channel.id, 2, "Игры:\n- Bloodborne\nЦена PS4: 900").await;

        let run = engine
            .process_pending(Some(channel.id), 10, Actor::from("alice"))
            .await
            .unwrap();
        assert_eq!(run, PendingRun { processed: 2, failed: 0 });
        assert_eq!(store.entries().await.len(), 2);
        assert!(store
            .list_messages_by_status(Some(channel.id), MessageStatus::Pending, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
