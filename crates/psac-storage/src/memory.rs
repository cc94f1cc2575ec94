//! In-memory implementation of every store trait.
//!
//! One mutex guards all tables, so a [`CatalogUnit`] is validated and applied
//! under a single lock: either every write lands or none does.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psac_core::{
    Associations, CatalogEntry, ChangeRecord, ChannelId, EntryId, Game, GameId, Include, MessageId, MessageStatus,
    NewChangeRecord, NewRawMessage, RawMessage, SourceChannel,
};
use tokio::sync::Mutex;

use crate::{
    check_transition, CatalogStore, CatalogUnit, ChannelStore, ChannelWatermark, CommitOutcome, EntryWrite,
    HistoryStore, RawMessageStore, SettingsStore, StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    channels: BTreeMap<ChannelId, SourceChannel>,
    messages: BTreeMap<MessageId, RawMessage>,
    entries: BTreeMap<EntryId, CatalogEntry>,
    entry_games: BTreeMap<EntryId, BTreeSet<GameId>>,
    games: BTreeMap<GameId, Game>,
    history: Vec<ChangeRecord>,
    settings: HashMap<String, String>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn entry_key_exists(&self, channel_id: ChannelId, external_id: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.channel_id == channel_id && e.external_id == external_id)
    }

    fn with_games(&self, mut entry: CatalogEntry, include: Include) -> CatalogEntry {
        entry.games = match include {
            Include::Nothing => Associations::NotRequested,
            Include::Games => {
                let ids = self.entry_games.get(&entry.id).cloned().unwrap_or_default();
                Associations::Loaded(ids.iter().filter_map(|id| self.games.get(id).cloned()).collect())
            }
        };
        entry
    }

    fn game_by_title(&self, title: &str) -> Option<&Game> {
        let wanted = title.trim().to_lowercase();
        self.games.values().find(|g| g.title.to_lowercase() == wanted)
    }

    fn validate(&self, unit: &CatalogUnit) -> StoreResult<()> {
        match &unit.entry {
            EntryWrite::Insert(new) => {
                if self.entry_key_exists(new.channel_id, &new.external_id) {
                    return Err(StoreError::DuplicateKey {
                        channel_id: new.channel_id,
                        external_id: new.external_id.clone(),
                    });
                }
            }
            EntryWrite::Update(entry) => {
                if !self.entries.contains_key(&entry.id) {
                    return Err(StoreError::NotFound {
                        entity: "catalog entry",
                        id: entry.id,
                    });
                }
            }
        }
        if let Some(id) = unit.games.link.iter().find(|id| !self.games.contains_key(id)) {
            return Err(StoreError::NotFound { entity: "game", id: *id });
        }
        if let Some(update) = &unit.message {
            let message = self.messages.get(&update.id).ok_or(StoreError::NotFound {
                entity: "raw message",
                id: update.id,
            })?;
            check_transition(update.id, message.status, update.status)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
    failing_commits: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `count` catalog commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    pub async fn entries(&self) -> Vec<CatalogEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .cloned()
            .map(|e| state.with_games(e, Include::Games))
            .collect()
    }

    pub async fn messages(&self) -> Vec<RawMessage> {
        self.state.lock().await.messages.values().cloned().collect()
    }

    pub async fn all_history(&self) -> Vec<ChangeRecord> {
        self.state.lock().await.history.clone()
    }

    pub async fn games(&self) -> Vec<Game> {
        self.state.lock().await.games.values().cloned().collect()
    }
}

#[async_trait]
impl ChannelStore for InMemoryStore {
    async fn list_active_channels(&self) -> StoreResult<Vec<SourceChannel>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state.channels.values().filter(|c| c.is_active).cloned().collect())
    }

    async fn get_channel(&self, id: ChannelId) -> StoreResult<Option<SourceChannel>> {
        self.ensure_online()?;
        Ok(self.state.lock().await.channels.get(&id).cloned())
    }

    async fn register_channel(&self, mut channel: SourceChannel) -> StoreResult<SourceChannel> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let existing = state
            .channels
            .values()
            .find(|c| c.external_id == channel.external_id)
            .map(|c| c.id);
        channel.id = match existing {
            Some(id) => id,
            None => state.allocate_id(),
        };
        state.channels.insert(channel.id, channel.clone());
        Ok(channel)
    }

    async fn save_watermark(&self, id: ChannelId, watermark: ChannelWatermark) -> StoreResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let channel = state
            .channels
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "channel", id })?;
        channel.last_scraped_at = Some(watermark.last_scraped_at);
        if watermark.last_scraped_external_id.is_some() {
            channel.last_scraped_external_id = watermark.last_scraped_external_id;
        }
        if watermark.last_swept_at.is_some() {
            channel.last_swept_at = watermark.last_swept_at;
        }
        Ok(())
    }
}

#[async_trait]
impl RawMessageStore for InMemoryStore {
    async fn find_latest_message(&self, channel_id: ChannelId, external_id: i64) -> StoreResult<Option<RawMessage>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .rev()
            .find(|m| m.channel_id == channel_id && m.external_id == external_id)
            .cloned())
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<RawMessage>> {
        self.ensure_online()?;
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn list_messages_by_status(
        &self,
        channel_id: Option<ChannelId>,
        status: MessageStatus,
        limit: usize,
    ) -> StoreResult<Vec<RawMessage>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .filter(|m| m.status == status && channel_id.map_or(true, |c| m.channel_id == c))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_messages(&self, messages: Vec<NewRawMessage>) -> StoreResult<Vec<RawMessage>> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if let Some(missing) = messages.iter().find(|m| !state.channels.contains_key(&m.channel_id)) {
            return Err(StoreError::NotFound {
                entity: "channel",
                id: missing.channel_id,
            });
        }
        let now = Utc::now();
        let mut inserted = Vec::with_capacity(messages.len());
        for new in messages {
            let id = state.allocate_id();
            let message = RawMessage {
                id,
                channel_id: new.channel_id,
                external_id: new.external_id,
                text: new.text,
                received_at: new.received_at,
                content_hash: new.content_hash,
                status: new.status,
                catalog_entry_id: None,
                diff: new.diff,
                previous_version_id: new.previous_version_id,
                created_at: now,
                updated_at: None,
                updated_by: None,
            };
            state.messages.insert(id, message.clone());
            inserted.push(message);
        }
        Ok(inserted)
    }

    async fn update_message(&self, message: &RawMessage) -> StoreResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let slot = state.messages.get_mut(&message.id).ok_or(StoreError::NotFound {
            entity: "raw message",
            id: message.id,
        })?;
        *slot = message.clone();
        Ok(())
    }

    async fn count_messages_by_status(&self, channel_id: ChannelId) -> StoreResult<Vec<(MessageStatus, u64)>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(MessageStatus::ALL
            .into_iter()
            .map(|status| {
                let count = state
                    .messages
                    .values()
                    .filter(|m| m.channel_id == channel_id && m.status == status)
                    .count() as u64;
                (status, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect())
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn find_entry(
        &self,
        channel_id: ChannelId,
        external_id: &str,
        include: Include,
    ) -> StoreResult<Option<CatalogEntry>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state
            .entries
            .values()
            .find(|e| e.channel_id == channel_id && e.external_id == external_id)
            .cloned()
            .map(|e| state.with_games(e, include)))
    }

    async fn list_live_entries(&self, channel_id: ChannelId) -> StoreResult<Vec<CatalogEntry>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.channel_id == channel_id && !e.is_deleted)
            .cloned()
            .collect())
    }

    async fn find_stale_entries(&self, channel_id: ChannelId, cutoff: DateTime<Utc>) -> StoreResult<Vec<CatalogEntry>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.channel_id == channel_id && !e.is_deleted && e.last_scraped_at < cutoff)
            .cloned()
            .collect())
    }

    async fn touch_entries(
        &self,
        channel_id: ChannelId,
        external_ids: &[String],
        at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let mut touched = 0;
        for entry in state.entries.values_mut() {
            if entry.channel_id == channel_id && !entry.is_deleted && external_ids.contains(&entry.external_id) {
                entry.last_scraped_at = at;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn find_games_by_titles(&self, titles: &[String]) -> StoreResult<Vec<Game>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(titles
            .iter()
            .filter_map(|t| state.game_by_title(t).cloned())
            .collect())
    }

    async fn commit(&self, unit: CatalogUnit) -> StoreResult<CommitOutcome> {
        self.ensure_online()?;
        if self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        let mut state = self.state.lock().await;
        state.validate(&unit)?;

        let now = Utc::now();
        let (entry_id, created) = match unit.entry {
            EntryWrite::Insert(new) => {
                let id = state.allocate_id();
                state.entries.insert(
                    id,
                    CatalogEntry {
                        id,
                        channel_id: new.channel_id,
                        external_id: new.external_id,
                        title: new.title,
                        price_ps4: new.price_ps4,
                        price_ps5: new.price_ps5,
                        region: new.region,
                        capacity: new.capacity,
                        has_original_mail: new.has_original_mail,
                        guarantee: new.guarantee,
                        seller_info: new.seller_info,
                        additional_info: new.additional_info,
                        stock_status: new.stock_status,
                        is_deleted: new.is_deleted,
                        last_scraped_at: new.last_scraped_at,
                        created_at: now,
                        updated_at: now,
                        games: Associations::NotRequested,
                    },
                );
                (id, true)
            }
            EntryWrite::Update(mut entry) => {
                entry.updated_at = now;
                entry.games = Associations::NotRequested;
                let id = entry.id;
                state.entries.insert(id, entry);
                (id, false)
            }
        };

        let mut created_games = Vec::new();
        let mut link = unit.games.link.clone();
        for title in &unit.games.create_and_link {
            let existing = state.game_by_title(title).map(|g| g.id);
            let game_id = match existing {
                Some(id) => id,
                None => {
                    let id = state.allocate_id();
                    let game = Game {
                        id,
                        title: title.trim().to_string(),
                    };
                    state.games.insert(id, game.clone());
                    created_games.push(game);
                    id
                }
            };
            link.push(game_id);
        }
        let associations = state.entry_games.entry(entry_id).or_default();
        for id in &unit.games.unlink {
            associations.remove(id);
        }
        associations.extend(link);

        let mut history = Vec::with_capacity(unit.history.len());
        for record in unit.history {
            let id = state.allocate_id();
            let row = ChangeRecord {
                id,
                entry_id,
                field: record.field,
                old_value: record.old_value,
                new_value: record.new_value,
                changed_at: record.changed_at,
                actor: record.actor,
            };
            state.history.push(row.clone());
            history.push(row);
        }

        if let Some(update) = unit.message {
            if let Some(message) = state.messages.get_mut(&update.id) {
                message.status = update.status;
                message.catalog_entry_id = Some(entry_id);
                message.updated_at = Some(now);
                message.updated_by = Some(update.actor);
            }
        }

        Ok(CommitOutcome {
            entry_id,
            created,
            history,
            created_games,
        })
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn append_history(&self, entry_id: EntryId, records: Vec<NewChangeRecord>) -> StoreResult<Vec<ChangeRecord>> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if !state.entries.contains_key(&entry_id) {
            return Err(StoreError::NotFound {
                entity: "catalog entry",
                id: entry_id,
            });
        }
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let id = state.allocate_id();
            let row = ChangeRecord {
                id,
                entry_id,
                field: record.field,
                old_value: record.old_value,
                new_value: record.new_value,
                changed_at: record.changed_at,
                actor: record.actor,
            };
            state.history.push(row.clone());
            rows.push(row);
        }
        Ok(rows)
    }

    async fn history_for(&self, entry_id: EntryId) -> StoreResult<Vec<ChangeRecord>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state.history.iter().filter(|r| r.entry_id == entry_id).cloned().collect())
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        Ok(self.state.lock().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        self.ensure_online()?;
        self.state
            .lock()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GameSync, MessageUpdate};
    use psac_core::{Actor, CapacityTier, NewCatalogEntry, StockStatus};

    fn channel() -> SourceChannel {
        SourceChannel {
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
        }
    }

    fn new_entry(channel_id: ChannelId, external_id: &str) -> NewCatalogEntry {
        NewCatalogEntry {
            channel_id,
            external_id: external_id.into(),
            title: "God of War".into(),
            price_ps4: Some(1500.0),
            price_ps5: None,
            region: None,
            capacity: CapacityTier::OfflineOnly,
            has_original_mail: false,
            guarantee: None,
            seller_info: None,
            additional_info: None,
            stock_status: StockStatus::InStock,
            is_deleted: false,
            last_scraped_at: Utc::now(),
        }
    }

    fn new_message(channel_id: ChannelId, external_id: i64) -> NewRawMessage {
        NewRawMessage {
            channel_id,
            external_id,
            text: "listing".into(),
            received_at: Utc::now(),
            content_hash: Some("h".into()),
            status: MessageStatus::Pending,
            diff: None,
            previous_version_id: None,
        }
    }

    #[tokio::test]
    async fn commit_applies_entry_games_history_and_message_together() {
        let store = InMemoryStore::new();
        let ch = store.register_channel(channel()).await.unwrap();
        let msg = store.insert_messages(vec![new_message(ch.id, 10)]).await.unwrap().remove(0);

        let mut unit = CatalogUnit::new(EntryWrite::Insert(new_entry(ch.id, "10")));
        unit.games = GameSync {
            create_and_link: vec!["God of War".into(), "Spider-Man".into()],
            ..GameSync::default()
        };
        unit.message = Some(MessageUpdate {
            id: msg.id,
            status: MessageStatus::Processed,
            actor: Actor::Scraper,
        });
        let outcome = store.commit(unit).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.created_games.len(), 2);

        let entry = store.find_entry(ch.id, "10", Include::Games).await.unwrap().unwrap();
        assert_eq!(entry.games.loaded().map(Vec::len), Some(2));
        let msg = store.get_message(msg.id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Processed);
        assert_eq!(msg.catalog_entry_id, Some(outcome.entry_id));
    }

    #[tokio::test]
    async fn failed_validation_leaves_no_partial_writes() {
        let store = InMemoryStore::new();
        let ch = store.register_channel(channel()).await.unwrap();
        let msg = store.insert_messages(vec![new_message(ch.id, 10)]).await.unwrap().remove(0);
        let mut ignored = msg.clone();
        ignored.status = MessageStatus::Ignored;
        store.update_message(&ignored).await.unwrap();

        let mut unit = CatalogUnit::new(EntryWrite::Insert(new_entry(ch.id, "10")));
        unit.games.create_and_link = vec!["Elden Ring".into()];
        unit.message = Some(MessageUpdate {
            id: msg.id,
            status: MessageStatus::Processed,
            actor: Actor::Scraper,
        });
        let err = store.commit(unit).await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        assert!(store.entries().await.is_empty());
        assert!(store.games().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_natural_key_is_rejected() {
        let store = InMemoryStore::new();
        let ch = store.register_channel(channel()).await.unwrap();
        store
            .commit(CatalogUnit::new(EntryWrite::Insert(new_entry(ch.id, "10"))))
            .await
            .unwrap();
        let err = store
            .commit(CatalogUnit::new(EntryWrite::Insert(new_entry(ch.id, "10"))))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn latest_message_wins_and_games_match_case_insensitively() {
        let store = InMemoryStore::new();
        let ch = store.register_channel(channel()).await.unwrap();
        let rows = store
            .insert_messages(vec![new_message(ch.id, 5), new_message(ch.id, 5)])
            .await
            .unwrap();
        let latest = store.find_latest_message(ch.id, 5).await.unwrap().unwrap();
        assert_eq!(latest.id, rows[1].id);

        let mut unit = CatalogUnit::new(EntryWrite::Insert(new_entry(ch.id, "5")));
        unit.games.create_and_link = vec!["Elden Ring".into()];
        store.commit(unit).await.unwrap();
        let found = store.find_games_by_titles(&["ELDEN RING".into()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Elden Ring");
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.find_latest_message(1, 1).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(store.find_latest_message(1, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touched_entries_are_no_longer_stale() {
        let store = InMemoryStore::new();
        let ch = store.register_channel(channel()).await.unwrap();
        let old = Utc::now() - chrono::Duration::days(30);
        for id in ["10", "11"] {
            let mut entry = new_entry(ch.id, id);
            entry.last_scraped_at = old;
            store.commit(CatalogUnit::new(EntryWrite::Insert(entry))).await.unwrap();
        }

        let touched = store
            .touch_entries(ch.id, &["10".to_string(), "99".to_string()], Utc::now())
            .await
            .unwrap();
        assert_eq!(touched, 1);

        let stale = store
            .find_stale_entries(ch.id, Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].external_id, "11");
    }

    #[tokio::test]
    async fn injected_commit_failures_are_consumed_in_order() {
        let store = InMemoryStore::new();
        let ch = store.register_channel(channel()).await.unwrap();
        store.fail_next_commits(1);
        let err = store
            .commit(CatalogUnit::new(EntryWrite::Insert(new_entry(ch.id, "1"))))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.entries().await.is_empty());
        store
            .commit(CatalogUnit::new(EntryWrite::Insert(new_entry(ch.id, "1"))))
            .await
            .unwrap();
        assert_eq!(store.entries().await.len(), 1);
    }
}
