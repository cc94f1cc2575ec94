//! Content-change detection for raw messages and field-level diffing of
//! parsed listings and catalog entries.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use psac_core::{Actor, CatalogEntry, ChannelId, MessageId, MessageStatus, ParsedResult, RawMessage};
use psac_storage::{PipelineStore, StoreError, StoreResult};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

const MONEY_EPSILON: f64 = 0.01;

/// Structured classification of the difference between two parsed listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Deleted,
    NoChange,
    SoldStatusChanged,
    Modified,
    PriceChanged,
    RegionChanged,
    GamesChanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Deleted => "deleted",
            ChangeKind::NoChange => "no_change",
            ChangeKind::SoldStatusChanged => "sold_status_changed",
            ChangeKind::Modified => "modified",
            ChangeKind::PriceChanged => "price_changed",
            ChangeKind::RegionChanged => "region_changed",
            ChangeKind::GamesChanged => "games_changed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub old: Option<String>,
    pub new: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub kind: ChangeKind,
    pub changes: Vec<FieldChange>,
}

impl ChangeSet {
    fn of(kind: ChangeKind) -> Self {
        Self {
            kind,
            changes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn touches(&self, field: &str) -> bool {
        self.changes.iter().any(|c| c.field == field)
    }
}

/// Comparable projection of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Compared trimmed and case-insensitively; blank counts as absent.
    Text(Option<String>),
    /// Compared with an absolute tolerance of 0.01.
    Money(Option<f64>),
    /// Booleans and enums, compared exactly by label.
    Exact(String),
    /// Order-insensitive, case-insensitive set of titles.
    Titles(Vec<String>),
}

impl FieldValue {
    pub fn same_as(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => normalized_text(a) == normalized_text(b),
            (FieldValue::Money(a), FieldValue::Money(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => (a - b).abs() <= MONEY_EPSILON + 1e-9,
                _ => false,
            },
            (FieldValue::Exact(a), FieldValue::Exact(b)) => a == b,
            (FieldValue::Titles(a), FieldValue::Titles(b)) => title_set(a) == title_set(b),
            _ => false,
        }
    }

    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Text(v) => v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(ToString::to_string),
            FieldValue::Money(v) => v.map(|v| format!("{v:.2}")),
            FieldValue::Exact(v) => Some(v.clone()),
            FieldValue::Titles(v) if v.is_empty() => None,
            FieldValue::Titles(v) => Some(v.join(", ")),
        }
    }
}

fn normalized_text(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
}

fn title_set(titles: &[String]) -> BTreeSet<String> {
    titles
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

pub type FieldExtractor<T> = fn(&T) -> FieldValue;

/// Fields compared between two parsed listings.
pub static PARSED_FIELDS: [(&str, FieldExtractor<ParsedResult>); 11] = [
    ("title", |p| FieldValue::Text(p.title.clone())),
    ("price_ps4", |p| FieldValue::Money(p.price_ps4)),
    ("price_ps5", |p| FieldValue::Money(p.price_ps5)),
    ("region", |p| FieldValue::Text(p.region.clone())),
    ("capacity", |p| FieldValue::Exact(p.capacity.to_string())),
    ("has_original_mail", |p| FieldValue::Exact(p.has_original_mail.to_string())),
    ("guarantee", |p| FieldValue::Text(p.guarantee.clone())),
    ("seller_info", |p| FieldValue::Text(p.seller_info.clone())),
    ("additional_info", |p| FieldValue::Text(p.additional_info.clone())),
    ("games", |p| FieldValue::Titles(p.games.clone())),
    ("is_sold", |p| FieldValue::Exact(p.is_sold.to_string())),
];

/// Fields compared between the stored and the proposed catalog entry.
pub static ENTRY_FIELDS: [(&str, FieldExtractor<CatalogEntry>); 11] = [
    ("title", |e| FieldValue::Text(Some(e.title.clone()))),
    ("price_ps4", |e| FieldValue::Money(e.price_ps4)),
    ("price_ps5", |e| FieldValue::Money(e.price_ps5)),
    ("region", |e| FieldValue::Text(e.region.clone())),
    ("capacity", |e| FieldValue::Exact(e.capacity.to_string())),
    ("has_original_mail", |e| FieldValue::Exact(e.has_original_mail.to_string())),
    ("guarantee", |e| FieldValue::Text(e.guarantee.clone())),
    ("seller_info", |e| FieldValue::Text(e.seller_info.clone())),
    ("additional_info", |e| FieldValue::Text(e.additional_info.clone())),
    ("stock_status", |e| FieldValue::Exact(e.stock_status.to_string())),
    ("is_deleted", |e| FieldValue::Exact(e.is_deleted.to_string())),
];

pub fn diff_fields<T>(fields: &[(&'static str, FieldExtractor<T>)], old: &T, new: &T) -> Vec<FieldChange> {
    fields
        .iter()
        .filter_map(|&(name, extract)| {
            let (before, after) = (extract(old), extract(new));
            (!before.same_as(&after)).then(|| FieldChange {
                field: name,
                old: before.render(),
                new: after.render(),
            })
        })
        .collect()
}

/// Structured comparison of two parse results.
pub fn detect_changes(old: Option<&ParsedResult>, new: Option<&ParsedResult>) -> ChangeSet {
    let (old, new) = match (old, new) {
        (None, None) => return ChangeSet::of(ChangeKind::NoChange),
        (None, Some(_)) => return ChangeSet::of(ChangeKind::New),
        (Some(_), None) => return ChangeSet::of(ChangeKind::Deleted),
        (Some(old), Some(new)) => (old, new),
    };

    let changes = diff_fields(&PARSED_FIELDS, old, new);
    let kind = classify(&changes);
    ChangeSet { kind, changes }
}

fn classify(changes: &[FieldChange]) -> ChangeKind {
    if changes.is_empty() {
        return ChangeKind::NoChange;
    }
    if changes.iter().any(|c| c.field == "is_sold") {
        return ChangeKind::SoldStatusChanged;
    }
    if changes.iter().all(|c| c.field.starts_with("price_")) {
        return ChangeKind::PriceChanged;
    }
    match changes {
        [only] if only.field == "region" => ChangeKind::RegionChanged,
        [only] if only.field == "games" => ChangeKind::GamesChanged,
        _ => ChangeKind::Modified,
    }
}

/// Human-readable diff stored on a new message version.
pub fn render_diff(changes: &ChangeSet) -> String {
    let mut out = format!("change: {}", changes.kind);
    for change in &changes.changes {
        out.push_str(&format!(
            "\n{}: {} -> {}",
            change.field,
            change.old.as_deref().unwrap_or("(none)"),
            change.new.as_deref().unwrap_or("(none)")
        ));
    }
    out
}

/// Raw-text classification used when structured parsing is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextChangeType {
    Created,
    Deleted,
    PriceChanged,
    StatusChanged,
    ContentModified,
}

impl fmt::Display for TextChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TextChangeType::Created => "created",
            TextChangeType::Deleted => "deleted",
            TextChangeType::PriceChanged => "price_changed",
            TextChangeType::StatusChanged => "status_changed",
            TextChangeType::ContentModified => "content_modified",
        })
    }
}

static PRICE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:цена|стоимость|price)[^\d\n]{0,20}(\d[\d \u{a0}.,]*)|(\d[\d \u{a0}.,]*)[ \t]*(?:₽|руб|rub|\$|€|₺|tl\b|usd|eur)")
        .expect("static regex")
});

static STATUS_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)продан\w*|sold(?:[ \t]+out)?|нет в наличии|в наличии|available|брон\w*|reserved")
        .expect("static regex")
});

fn price_hint(text: &str) -> Option<String> {
    PRICE_HINT.captures(text).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().chars().filter(char::is_ascii_digit).collect())
    })
}

fn status_hint(text: &str) -> Option<String> {
    STATUS_HINT.find(text).map(|m| m.as_str().to_lowercase())
}

/// Crude four-way classification of a raw-text edit: deletion, creation, then
/// the first of price or status substring mismatch, else generic modification.
pub fn detect_change_type(old_text: &str, new_text: &str) -> TextChangeType {
    if new_text.trim().is_empty() {
        return TextChangeType::Deleted;
    }
    if old_text.trim().is_empty() {
        return TextChangeType::Created;
    }
    if price_hint(old_text) != price_hint(new_text) {
        return TextChangeType::PriceChanged;
    }
    if status_hint(old_text) != status_hint(new_text) {
        return TextChangeType::StatusChanged;
    }
    TextChangeType::ContentModified
}

/// Result of comparing a freshly fetched fingerprint with the stored chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentCheck {
    /// No stored message for this key.
    New,
    /// Stored fingerprint differs; the stored message has been flagged.
    Changed(RawMessage),
    Unchanged,
    /// Lookup failed; treated as changed.
    Unknown,
}

impl ContentCheck {
    pub fn is_changed(&self) -> bool {
        !matches!(self, ContentCheck::Unchanged)
    }
}

/// Store-backed change detection and message lifecycle transitions.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn PipelineStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    pub async fn has_content_changed(&self, channel_id: ChannelId, external_id: i64, new_hash: &str) -> bool {
        self.check_content(channel_id, external_id, new_hash).await.is_changed()
    }

    /// Compare `new_hash` with the latest stored version. First sight mutates
    /// nothing; a mismatch moves the stored version to `PendingChange`.
    /// Storage failures fail open.
    pub async fn check_content(&self, channel_id: ChannelId, external_id: i64, new_hash: &str) -> ContentCheck {
        let latest = match self.store.find_latest_message(channel_id, external_id).await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(channel_id, external_id, error = %err, "change lookup failed; assuming changed");
                return ContentCheck::Unknown;
            }
        };
        let Some(mut stored) = latest else {
            return ContentCheck::New;
        };
        if stored.content_hash.as_deref() == Some(new_hash) {
            return ContentCheck::Unchanged;
        }

        if stored.status != MessageStatus::PendingChange {
            if stored.status.can_transition_to(MessageStatus::PendingChange) {
                stored.status = MessageStatus::PendingChange;
                stored.updated_at = Some(Utc::now());
                stored.updated_by = Some(Actor::Scraper);
                if let Err(err) = self.store.update_message(&stored).await {
                    warn!(message_id = stored.id, error = %err, "failed to flag changed message");
                }
            } else {
                debug!(message_id = stored.id, status = %stored.status, "changed message kept in its status");
            }
        }
        ContentCheck::Changed(stored)
    }

    async fn transition(
        &self,
        id: MessageId,
        allowed_from: &[MessageStatus],
        to: MessageStatus,
        actor: Actor,
    ) -> StoreResult<RawMessage> {
        let mut message = self
            .store
            .get_message(id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "raw message",
                id,
            })?;
        if !allowed_from.contains(&message.status) || !message.status.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                id,
                from: message.status,
                to,
            });
        }
        message.status = to;
        message.updated_at = Some(Utc::now());
        message.updated_by = Some(actor);
        self.store.update_message(&message).await?;
        debug!(message_id = id, status = %to, "message transitioned");
        Ok(message)
    }

    /// `PendingChange -> Pending`: the change will be processed.
    pub async fn approve_change(&self, id: MessageId, actor: Actor) -> StoreResult<RawMessage> {
        self.transition(id, &[MessageStatus::PendingChange], MessageStatus::Pending, actor)
            .await
    }

    /// `PendingChange -> Ignored`.
    pub async fn reject_change(&self, id: MessageId, actor: Actor) -> StoreResult<RawMessage> {
        self.transition(id, &[MessageStatus::PendingChange], MessageStatus::Ignored, actor)
            .await
    }

    pub async fn mark_ignored(&self, id: MessageId, actor: Actor) -> StoreResult<RawMessage> {
        self.transition(id, &[MessageStatus::Pending], MessageStatus::Ignored, actor)
            .await
    }

    pub async fn mark_failed(&self, id: MessageId, actor: Actor) -> StoreResult<RawMessage> {
        self.transition(id, &[MessageStatus::Pending], MessageStatus::Failed, actor)
            .await
    }

    pub async fn mark_deleted(&self, id: MessageId, actor: Actor) -> StoreResult<RawMessage> {
        self.transition(id, &[MessageStatus::Pending], MessageStatus::Deleted, actor)
            .await
    }

    /// `Failed -> Pending` for another processing attempt.
    pub async fn retry_failed(&self, id: MessageId, actor: Actor) -> StoreResult<RawMessage> {
        self.transition(id, &[MessageStatus::Failed], MessageStatus::Pending, actor)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psac_core::{fingerprint, NewRawMessage, SourceChannel};
    use psac_storage::{ChannelStore, InMemoryStore, RawMessageStore};

    fn listing(price: f64) -> ParsedResult {
        ParsedResult {
            external_id: Some("1".into()),
            title: Some("Elden Ring".into()),
            price_ps4: Some(price),
            region: Some("Турция".into()),
            games: vec!["Elden Ring".into(), "Bloodborne".into()],
            ..ParsedResult::default()
        }
    }

    #[test]
    fn null_sides_classify_without_field_diffs() {
        let x = listing(10.0);
        assert_eq!(detect_changes(None, Some(&x)).kind, ChangeKind::New);
        assert_eq!(detect_changes(Some(&x), None).kind, ChangeKind::Deleted);
        assert_eq!(detect_changes(None, None).kind, ChangeKind::NoChange);
        let same = detect_changes(Some(&x), Some(&x));
        assert_eq!(same.kind, ChangeKind::NoChange);
        assert!(same.is_empty());
    }

    #[test]
    fn money_comparison_uses_a_cent_tolerance() {
        let base = listing(10.00);
        let within = detect_changes(Some(&base), Some(&listing(10.005)));
        assert!(!within.touches("price_ps4"));
        assert_eq!(within.kind, ChangeKind::NoChange);

        let beyond = detect_changes(Some(&base), Some(&listing(10.02)));
        assert!(beyond.touches("price_ps4"));
        assert_eq!(beyond.kind, ChangeKind::PriceChanged);
    }

    #[test]
    fn sold_status_dominates_other_changes() {
        let old = listing(10.0);
        let mut new = listing(20.0);
        new.is_sold = true;
        new.region = Some("India".into());
        let changes = detect_changes(Some(&old), Some(&new));
        assert_eq!(changes.kind, ChangeKind::SoldStatusChanged);
        assert_eq!(changes.changes.len(), 3);
    }

    #[test]
    fn text_and_games_comparisons_ignore_case_and_order() {
        let old = listing(10.0);
        let mut new = listing(10.0);
        new.region = Some("  турция ".into());
        new.games = vec!["bloodborne".into(), "ELDEN RING".into()];
        assert_eq!(detect_changes(Some(&old), Some(&new)).kind, ChangeKind::NoChange);

        new.games.push("Sekiro".into());
        assert_eq!(detect_changes(Some(&old), Some(&new)).kind, ChangeKind::GamesChanged);
    }

    #[test]
    fn diff_renders_one_line_per_field() {
        let changes = detect_changes(Some(&listing(10.0)), Some(&listing(12.5)));
        assert_eq!(render_diff(&changes), "change: price_changed\nprice_ps4: 10.00 -> 12.50");
    }

    #[test]
    fn text_heuristic_checks_price_before_status() {
        assert_eq!(detect_change_type("Цена: 1500₽", "  "), TextChangeType::Deleted);
        assert_eq!(detect_change_type("", "Цена: 1500₽"), TextChangeType::Created);
        assert_eq!(
            detect_change_type("Цена: 1500₽ в наличии", "Цена: 1700₽ ПРОДАНО"),
            TextChangeType::PriceChanged
        );
        assert_eq!(
            detect_change_type("Цена: 1500₽ в наличии", "Цена: 1500₽ продано"),
            TextChangeType::StatusChanged
        );
        assert_eq!(
            detect_change_type("Цена: 1500₽\nGod of War", "Цена: 1500₽\nGod of War Ragnarök"),
            TextChangeType::ContentModified
        );
    }

    async fn seeded() -> (Arc<InMemoryStore>, RawMessage) {
        let store = Arc::new(InMemoryStore::new());
        let channel = store
            .register_channel(SourceChannel {
                id: 0,
                external_id: "chan".into(),
                name: "Chan".into(),
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
        let message = store
            .insert_messages(vec![NewRawMessage {
                channel_id: channel.id,
                external_id: 42,
                text: "Elden Ring 1500".into(),
                received_at: Utc::now(),
                content_hash: Some(fingerprint("Elden Ring 1500")),
                status: MessageStatus::Processed,
                diff: None,
                previous_version_id: None,
            }])
            .await
            .unwrap()
            .remove(0);
        (store, message)
    }

    #[tokio::test]
    async fn first_sight_is_changed_without_mutation() {
        let (store, message) = seeded().await;
        let detector = ChangeDetector::new(store.clone());
        assert!(detector.has_content_changed(message.channel_id, 7, "abc").await);
        assert_eq!(store.messages().await, vec![message]);
    }

    #[tokio::test]
    async fn matching_hash_is_unchanged() {
        let (store, message) = seeded().await;
        let detector = ChangeDetector::new(store.clone());
        let hash = fingerprint("  ELDEN ring   1500 ");
        assert!(!detector.has_content_changed(message.channel_id, 42, &hash).await);
        assert_eq!(store.messages().await, vec![message]);
    }

    #[tokio::test]
    async fn differing_hash_flags_stored_message() {
        let (store, message) = seeded().await;
        let detector = ChangeDetector::new(store.clone());
        let hash = fingerprint("Elden Ring 1700");
        assert!(detector.has_content_changed(message.channel_id, 42, &hash).await);

        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::PendingChange);
        assert_eq!(stored.updated_by, Some(Actor::Scraper));
        assert!(stored.updated_at.is_some());
    }

    #[tokio::test]
    async fn storage_failure_fails_open() {
        let (store, message) = seeded().await;
        let detector = ChangeDetector::new(store.clone());
        store.set_offline(true);
        let hash = message.content_hash.clone().unwrap();
        assert!(detector.has_content_changed(message.channel_id, 42, &hash).await);
        assert_eq!(
            detector.check_content(message.channel_id, 42, &hash).await,
            ContentCheck::Unknown
        );
    }

    #[tokio::test]
    async fn approval_and_rejection_only_leave_pending_change() {
        let (store, message) = seeded().await;
        let detector = ChangeDetector::new(store.clone());
        let err = detector
            .approve_change(message.id, Actor::from("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        detector.has_content_changed(message.channel_id, 42, "other").await;
        let approved = detector.approve_change(message.id, Actor::from("alice")).await.unwrap();
        assert_eq!(approved.status, MessageStatus::Pending);
        assert_eq!(approved.updated_by, Some(Actor::Admin("alice".into())));

        let ignored = detector.mark_ignored(message.id, Actor::from("alice")).await.unwrap();
        assert_eq!(ignored.status, MessageStatus::Ignored);
        assert!(matches!(
            detector.reject_change(message.id, Actor::from("bob")).await,
            Err(StoreError::IllegalTransition { .. })
        ));
    }
}
