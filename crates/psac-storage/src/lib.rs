//! Collaborator interfaces for the pipeline plus in-memory, Postgres and HTTP
//! implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psac_core::{
    Actor, CatalogEntry, ChangeRecord, ChannelId, EntryId, FetchStrategy, FetchedMessage, Game, GameId, Include,
    MessageId, MessageStatus, NewCatalogEntry, NewChangeRecord, NewRawMessage, NotificationEvent, RawMessage,
    SourceChannel,
};
use thiserror::Error;

pub mod memory;
pub mod notify;
pub mod postgres;
pub mod source;

pub use memory::InMemoryStore;
pub use notify::{LogNotificationSink, MemoryNotificationSink};
pub use postgres::PgStore;
pub use source::{HttpMessageSource, HttpSourceConfig, MemoryMessageSource, RateLimiter};

pub const CRATE_NAME: &str = "psac-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("illegal status transition for message {id}: {from} -> {to}")]
    IllegalTransition {
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("catalog key ({channel_id}, {external_id}) already exists")]
    DuplicateKey { channel_id: ChannelId, external_id: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("transient upstream error: {0}")]
    Transient(String),
    #[error("upstream rejected request with status {status} for {url}")]
    Rejected { status: u16, url: String },
    #[error("undecodable upstream payload: {0}")]
    Decode(String),
}

/// Watermark fields written by the scheduler after a channel cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWatermark {
    pub last_scraped_at: DateTime<Utc>,
    pub last_scraped_external_id: Option<i64>,
    pub last_swept_at: Option<DateTime<Utc>>,
}

/// How a unit of work writes the catalog entry itself.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryWrite {
    Insert(NewCatalogEntry),
    /// Full overwrite of the mutable columns; `games` on the entry is ignored.
    Update(CatalogEntry),
}

/// Association changes for one entry. Titles in `create_and_link` are created
/// as games unless a case-insensitive match already exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameSync {
    pub link: Vec<GameId>,
    pub create_and_link: Vec<String>,
    pub unlink: Vec<GameId>,
}

impl GameSync {
    pub fn is_empty(&self) -> bool {
        self.link.is_empty() && self.create_and_link.is_empty() && self.unlink.is_empty()
    }
}

/// Status change for the source message, linked to the committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUpdate {
    pub id: MessageId,
    pub status: MessageStatus,
    pub actor: Actor,
}

/// Everything one reconciliation writes. Stores apply it all or nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogUnit {
    pub entry: EntryWrite,
    pub games: GameSync,
    pub history: Vec<NewChangeRecord>,
    pub message: Option<MessageUpdate>,
}

impl CatalogUnit {
    pub fn new(entry: EntryWrite) -> Self {
        Self {
            entry,
            games: GameSync::default(),
            history: Vec::new(),
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    pub entry_id: EntryId,
    pub created: bool,
    pub history: Vec<ChangeRecord>,
    pub created_games: Vec<Game>,
}

/// Legal when the status is unchanged or the lifecycle allows the move.
pub fn check_transition(id: MessageId, from: MessageStatus, to: MessageStatus) -> StoreResult<()> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition { id, from, to })
    }
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn list_active_channels(&self) -> StoreResult<Vec<SourceChannel>>;
    async fn get_channel(&self, id: ChannelId) -> StoreResult<Option<SourceChannel>>;
    /// Insert or update a channel keyed by its upstream handle.
    async fn register_channel(&self, channel: SourceChannel) -> StoreResult<SourceChannel>;
    async fn save_watermark(&self, id: ChannelId, watermark: ChannelWatermark) -> StoreResult<()>;
}

#[async_trait]
pub trait RawMessageStore: Send + Sync {
    /// Most recent version for `(channel_id, external_id)`.
    async fn find_latest_message(&self, channel_id: ChannelId, external_id: i64) -> StoreResult<Option<RawMessage>>;
    async fn get_message(&self, id: MessageId) -> StoreResult<Option<RawMessage>>;
    async fn list_messages_by_status(
        &self,
        channel_id: Option<ChannelId>,
        status: MessageStatus,
        limit: usize,
    ) -> StoreResult<Vec<RawMessage>>;
    /// Insert all messages together; returned rows keep input order.
    async fn insert_messages(&self, messages: Vec<NewRawMessage>) -> StoreResult<Vec<RawMessage>>;
    async fn update_message(&self, message: &RawMessage) -> StoreResult<()>;
    async fn count_messages_by_status(&self, channel_id: ChannelId) -> StoreResult<Vec<(MessageStatus, u64)>>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_entry(
        &self,
        channel_id: ChannelId,
        external_id: &str,
        include: Include,
    ) -> StoreResult<Option<CatalogEntry>>;
    async fn list_live_entries(&self, channel_id: ChannelId) -> StoreResult<Vec<CatalogEntry>>;
    /// Live entries whose `last_scraped_at` is older than `cutoff`.
    async fn find_stale_entries(&self, channel_id: ChannelId, cutoff: DateTime<Utc>) -> StoreResult<Vec<CatalogEntry>>;
    /// Set `last_scraped_at` on the live entries with these external ids.
    /// Returns how many entries were touched.
    async fn touch_entries(&self, channel_id: ChannelId, external_ids: &[String], at: DateTime<Utc>)
        -> StoreResult<usize>;
    /// Case-insensitive exact title lookup.
    async fn find_games_by_titles(&self, titles: &[String]) -> StoreResult<Vec<Game>>;
    async fn commit(&self, unit: CatalogUnit) -> StoreResult<CommitOutcome>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_history(&self, entry_id: EntryId, records: Vec<NewChangeRecord>) -> StoreResult<Vec<ChangeRecord>>;
    async fn history_for(&self, entry_id: EntryId) -> StoreResult<Vec<ChangeRecord>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()>;
}

/// Every store the pipeline touches, behind one handle.
pub trait PipelineStore: ChannelStore + RawMessageStore + CatalogStore + HistoryStore + SettingsStore {}

impl<T> PipelineStore for T where T: ChannelStore + RawMessageStore + CatalogStore + HistoryStore + SettingsStore {}

/// Fire-and-forget operator alerts.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}

/// Upstream message source (a messaging platform channel reader).
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn authenticate(&self) -> Result<(), SourceError>;
    /// Messages for one channel, ordered by ascending external id.
    async fn fetch_messages(&self, channel_handle: &str, strategy: FetchStrategy)
        -> Result<Vec<FetchedMessage>, SourceError>;
}
