//! Core domain model for the PlayStation account catalog pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fingerprint;

pub use fingerprint::{fingerprint, normalize, EMPTY_FINGERPRINT};

pub const CRATE_NAME: &str = "psac-core";

pub type ChannelId = i64;
pub type MessageId = i64;
pub type EntryId = i64;
pub type GameId = i64;

/// Lifecycle of an ingested raw message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processed,
    Ignored,
    PendingChange,
    Deleted,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 6] = [
        MessageStatus::Pending,
        MessageStatus::Processed,
        MessageStatus::Ignored,
        MessageStatus::PendingChange,
        MessageStatus::Deleted,
        MessageStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processed => "processed",
            MessageStatus::Ignored => "ignored",
            MessageStatus::PendingChange => "pending_change",
            MessageStatus::Deleted => "deleted",
            MessageStatus::Failed => "failed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (Pending, Processed | Ignored | PendingChange | Deleted | Failed) => true,
            (Processed | Ignored | Failed | Deleted, PendingChange) => true,
            (PendingChange, Pending | Ignored) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Coarse account access level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityTier {
    #[default]
    Unknown,
    OfflineOnly,
    Hybrid,
    OnlineOnly,
}

impl CapacityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityTier::Unknown => "unknown",
            CapacityTier::OfflineOnly => "offline_only",
            CapacityTier::Hybrid => "hybrid",
            CapacityTier::OnlineOnly => "online_only",
        }
    }
}

impl fmt::Display for CapacityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapacityTier {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(CapacityTier::Unknown),
            "offline_only" => Ok(CapacityTier::OfflineOnly),
            "hybrid" => Ok(CapacityTier::Hybrid),
            "online_only" => Ok(CapacityTier::OnlineOnly),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    #[default]
    InStock,
    OutOfStock,
    Reserved,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::InStock => "in_stock",
            StockStatus::OutOfStock => "out_of_stock",
            StockStatus::Reserved => "reserved",
        }
    }
}

impl fmt::Display for StockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StockStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_stock" => Ok(StockStatus::InStock),
            "out_of_stock" => Ok(StockStatus::OutOfStock),
            "reserved" => Ok(StockStatus::Reserved),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

/// Who performed a mutation: the scraper pipeline or a named admin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Actor {
    Scraper,
    Admin(String),
}

impl Actor {
    pub fn label(&self) -> &str {
        match self {
            Actor::Scraper => "scraper",
            Actor::Admin(name) => name,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<String> for Actor {
    fn from(value: String) -> Self {
        if value == "scraper" {
            Actor::Scraper
        } else {
            Actor::Admin(value)
        }
    }
}

impl From<&str> for Actor {
    fn from(value: &str) -> Self {
        Actor::from(value.to_string())
    }
}

impl From<Actor> for String {
    fn from(value: Actor) -> Self {
        value.label().to_string()
    }
}

/// One ingested unit of text from a source channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub external_id: i64,
    pub text: String,
    pub received_at: DateTime<Utc>,
    /// `None` until computed; `Some("")` is the empty-text sentinel.
    pub content_hash: Option<String>,
    pub status: MessageStatus,
    pub catalog_entry_id: Option<EntryId>,
    pub diff: Option<String>,
    pub previous_version_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<Actor>,
}

/// Insert form of [`RawMessage`]; ids and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRawMessage {
    pub channel_id: ChannelId,
    pub external_id: i64,
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub status: MessageStatus,
    pub diff: Option<String>,
    pub previous_version_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub title: String,
}

/// Association data that may or may not have been loaded by the query path.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Associations<T> {
    #[default]
    NotRequested,
    Loaded(T),
}

impl<T> Associations<T> {
    pub fn loaded(&self) -> Option<&T> {
        match self {
            Associations::Loaded(value) => Some(value),
            Associations::NotRequested => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Associations::Loaded(_))
    }
}

/// Which associations a catalog lookup should populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Include {
    Nothing,
    Games,
}

/// Normalized, de-duplicated listing keyed by `(channel_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: EntryId,
    pub channel_id: ChannelId,
    pub external_id: String,
    pub title: String,
    pub price_ps4: Option<f64>,
    pub price_ps5: Option<f64>,
    pub region: Option<String>,
    pub capacity: CapacityTier,
    pub has_original_mail: bool,
    pub guarantee: Option<String>,
    pub seller_info: Option<String>,
    pub additional_info: Option<String>,
    pub stock_status: StockStatus,
    pub is_deleted: bool,
    pub last_scraped_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub games: Associations<Vec<Game>>,
}

/// Insert form of [`CatalogEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCatalogEntry {
    pub channel_id: ChannelId,
    pub external_id: String,
    pub title: String,
    pub price_ps4: Option<f64>,
    pub price_ps5: Option<f64>,
    pub region: Option<String>,
    pub capacity: CapacityTier,
    pub has_original_mail: bool,
    pub guarantee: Option<String>,
    pub seller_info: Option<String>,
    pub additional_info: Option<String>,
    pub stock_status: StockStatus,
    pub is_deleted: bool,
    pub last_scraped_at: DateTime<Utc>,
}

/// Immutable, append-only history row for a catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub entry_id: EntryId,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub actor: Actor,
}

/// History row before it is attached to an entry id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChangeRecord {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub actor: Actor,
}

/// Transient parser output; the contract between parsing and reconciliation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedResult {
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub price_ps4: Option<f64>,
    pub price_ps5: Option<f64>,
    pub region: Option<String>,
    pub capacity_info: Option<String>,
    pub capacity: CapacityTier,
    pub has_original_mail: bool,
    pub guarantee: Option<String>,
    pub seller_info: Option<String>,
    pub additional_info: Option<String>,
    pub games: Vec<String>,
    pub is_sold: bool,
}

/// Per-channel scraping configuration and watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChannel {
    pub id: ChannelId,
    /// Upstream handle used by the message source client.
    pub external_id: String,
    pub name: String,
    pub is_active: bool,
    /// Name of the parsing profile applied to this channel's messages.
    pub profile: String,
    pub delay_secs: u64,
    pub bulk_limit: Option<u32>,
    pub window_hours: Option<u32>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub last_scraped_external_id: Option<i64>,
    pub last_swept_at: Option<DateTime<Utc>>,
}

/// How a channel's messages are fetched from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum FetchStrategy {
    /// Bulk catch-up: the most recent N messages.
    LastMessages(u32),
    /// Incremental: everything after the given external id.
    SinceMessage(i64),
    /// Time window: everything from the last N hours.
    SinceHours(u32),
}

impl FetchStrategy {
    pub fn is_incremental(&self) -> bool {
        matches!(self, FetchStrategy::SinceMessage(_))
    }
}

/// One message as returned by the upstream source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub external_id: i64,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BulkRemoval,
    AuthFailure,
    ChannelFailed,
}

/// Operator alert emitted through the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub channel_id: Option<ChannelId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(kind: NotificationKind, channel_id: Option<ChannelId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            channel_id,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
