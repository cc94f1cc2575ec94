//! Postgres-backed store. Queries are checked at runtime; the schema ships as
//! a sqlx migration under `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psac_core::{
    Associations, CatalogEntry, ChangeRecord, ChannelId, EntryId, Game, Include, MessageId, MessageStatus,
    NewChangeRecord, NewRawMessage, RawMessage, SourceChannel, UnknownVariant,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::{
    check_transition, CatalogStore, CatalogUnit, ChannelStore, ChannelWatermark, CommitOutcome, EntryWrite,
    HistoryStore, RawMessageStore, SettingsStore, StoreError, StoreResult,
};

const MESSAGE_COLUMNS: &str = "id, channel_id, external_id, text, received_at, content_hash, status, \
     catalog_entry_id, diff, previous_version_id, created_at, updated_at, updated_by";

const ENTRY_COLUMNS: &str = "id, channel_id, external_id, title, price_ps4, price_ps5, region, capacity, \
     has_original_mail, guarantee, seller_info, additional_info, stock_status, is_deleted, last_scraped_at, \
     created_at, updated_at";

const CHANNEL_COLUMNS: &str = "id, external_id, name, is_active, profile, delay_secs, bulk_limit, window_hours, \
     last_scraped_at, last_scraped_external_id, last_swept_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn corrupt(err: UnknownVariant) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn message_from_row(row: &PgRow) -> StoreResult<RawMessage> {
    let status: String = row.try_get("status")?;
    let updated_by: Option<String> = row.try_get("updated_by")?;
    Ok(RawMessage {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        external_id: row.try_get("external_id")?,
        text: row.try_get("text")?,
        received_at: row.try_get("received_at")?,
        content_hash: row.try_get("content_hash")?,
        status: status.parse().map_err(corrupt)?,
        catalog_entry_id: row.try_get("catalog_entry_id")?,
        diff: row.try_get("diff")?,
        previous_version_id: row.try_get("previous_version_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        updated_by: updated_by.map(Into::into),
    })
}

fn entry_from_row(row: &PgRow) -> StoreResult<CatalogEntry> {
    let capacity: String = row.try_get("capacity")?;
    let stock_status: String = row.try_get("stock_status")?;
    Ok(CatalogEntry {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        price_ps4: row.try_get("price_ps4")?,
        price_ps5: row.try_get("price_ps5")?,
        region: row.try_get("region")?,
        capacity: capacity.parse().map_err(corrupt)?,
        has_original_mail: row.try_get("has_original_mail")?,
        guarantee: row.try_get("guarantee")?,
        seller_info: row.try_get("seller_info")?,
        additional_info: row.try_get("additional_info")?,
        stock_status: stock_status.parse().map_err(corrupt)?,
        is_deleted: row.try_get("is_deleted")?,
        last_scraped_at: row.try_get("last_scraped_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        games: Associations::NotRequested,
    })
}

fn channel_from_row(row: &PgRow) -> StoreResult<SourceChannel> {
    let delay_secs: i64 = row.try_get("delay_secs")?;
    let bulk_limit: Option<i32> = row.try_get("bulk_limit")?;
    let window_hours: Option<i32> = row.try_get("window_hours")?;
    Ok(SourceChannel {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
        profile: row.try_get("profile")?,
        delay_secs: delay_secs.max(0) as u64,
        bulk_limit: bulk_limit.map(|v| v.max(0) as u32),
        window_hours: window_hours.map(|v| v.max(0) as u32),
        last_scraped_at: row.try_get("last_scraped_at")?,
        last_scraped_external_id: row.try_get("last_scraped_external_id")?,
        last_swept_at: row.try_get("last_swept_at")?,
    })
}

fn change_from_row(row: &PgRow) -> StoreResult<ChangeRecord> {
    let actor: String = row.try_get("actor")?;
    Ok(ChangeRecord {
        id: row.try_get("id")?,
        entry_id: row.try_get("entry_id")?,
        field: row.try_get("field")?,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        changed_at: row.try_get("changed_at")?,
        actor: actor.into(),
    })
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    entry_id: EntryId,
    records: Vec<NewChangeRecord>,
) -> StoreResult<Vec<ChangeRecord>> {
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let row = sqlx::query(
            r#"
            INSERT INTO change_records (entry_id, field, old_value, new_value, changed_at, actor)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, entry_id, field, old_value, new_value, changed_at, actor
            "#,
        )
        .bind(entry_id)
        .bind(&record.field)
        .bind(&record.old_value)
        .bind(&record.new_value)
        .bind(record.changed_at)
        .bind(record.actor.label())
        .fetch_one(&mut **tx)
        .await?;
        rows.push(change_from_row(&row)?);
    }
    Ok(rows)
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn load_games(&self, entry_id: EntryId) -> StoreResult<Vec<Game>> {
        let rows = sqlx::query(
            r#"
            SELECT g.id, g.title
              FROM games g
              JOIN catalog_entry_games eg ON eg.game_id = g.id
             WHERE eg.entry_id = $1
             ORDER BY g.id
            "#,
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<Game> {
                Ok(Game {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ChannelStore for PgStore {
    async fn list_active_channels(&self) -> StoreResult<Vec<SourceChannel>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM source_channels WHERE is_active ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(channel_from_row).collect()
    }

    async fn get_channel(&self, id: ChannelId) -> StoreResult<Option<SourceChannel>> {
        let row = sqlx::query(&format!("SELECT {CHANNEL_COLUMNS} FROM source_channels WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(channel_from_row).transpose()
    }

    async fn register_channel(&self, channel: SourceChannel) -> StoreResult<SourceChannel> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO source_channels (external_id, name, is_active, profile, delay_secs, bulk_limit, window_hours)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_id) DO UPDATE
               SET name = EXCLUDED.name,
                   is_active = EXCLUDED.is_active,
                   profile = EXCLUDED.profile,
                   delay_secs = EXCLUDED.delay_secs,
                   bulk_limit = EXCLUDED.bulk_limit,
                   window_hours = EXCLUDED.window_hours
            RETURNING {CHANNEL_COLUMNS}
            "#
        ))
        .bind(&channel.external_id)
        .bind(&channel.name)
        .bind(channel.is_active)
        .bind(&channel.profile)
        .bind(channel.delay_secs as i64)
        .bind(channel.bulk_limit.map(|v| v as i32))
        .bind(channel.window_hours.map(|v| v as i32))
        .fetch_one(&self.pool)
        .await?;
        channel_from_row(&row)
    }

    async fn save_watermark(&self, id: ChannelId, watermark: ChannelWatermark) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE source_channels
               SET last_scraped_at = $2,
                   last_scraped_external_id = COALESCE($3, last_scraped_external_id),
                   last_swept_at = COALESCE($4, last_swept_at)
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(watermark.last_scraped_at)
        .bind(watermark.last_scraped_external_id)
        .bind(watermark.last_swept_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "channel", id });
        }
        Ok(())
    }
}

#[async_trait]
impl RawMessageStore for PgStore {
    async fn find_latest_message(&self, channel_id: ChannelId, external_id: i64) -> StoreResult<Option<RawMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM raw_messages \
             WHERE channel_id = $1 AND external_id = $2 ORDER BY id DESC LIMIT 1"
        ))
        .bind(channel_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<RawMessage>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM raw_messages WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_messages_by_status(
        &self,
        channel_id: Option<ChannelId>,
        status: MessageStatus,
        limit: usize,
    ) -> StoreResult<Vec<RawMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM raw_messages \
             WHERE status = $1 AND ($2::BIGINT IS NULL OR channel_id = $2) ORDER BY id LIMIT $3"
        ))
        .bind(status.as_str())
        .bind(channel_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn insert_messages(&self, messages: Vec<NewRawMessage>) -> StoreResult<Vec<RawMessage>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(messages.len());
        for message in messages {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO raw_messages
                    (channel_id, external_id, text, received_at, content_hash, status, diff, previous_version_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(message.channel_id)
            .bind(message.external_id)
            .bind(&message.text)
            .bind(message.received_at)
            .bind(&message.content_hash)
            .bind(message.status.as_str())
            .bind(&message.diff)
            .bind(message.previous_version_id)
            .fetch_one(&mut *tx)
            .await?;
            inserted.push(message_from_row(&row)?);
        }
        tx.commit().await?;
        debug!(count = inserted.len(), "inserted raw messages");
        Ok(inserted)
    }

    async fn update_message(&self, message: &RawMessage) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE raw_messages
               SET status = $2,
                   content_hash = $3,
                   catalog_entry_id = $4,
                   diff = $5,
                   updated_at = $6,
                   updated_by = $7
             WHERE id = $1
            "#,
        )
        .bind(message.id)
        .bind(message.status.as_str())
        .bind(&message.content_hash)
        .bind(message.catalog_entry_id)
        .bind(&message.diff)
        .bind(message.updated_at)
        .bind(message.updated_by.as_ref().map(|a| a.label().to_string()))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "raw message",
                id: message.id,
            });
        }
        Ok(())
    }

    async fn count_messages_by_status(&self, channel_id: ChannelId) -> StoreResult<Vec<(MessageStatus, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
              FROM raw_messages
             WHERE channel_id = $1
             GROUP BY status
             ORDER BY status
            "#,
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<(MessageStatus, u64)> {
                let status: String = row.try_get("status")?;
                let n: i64 = row.try_get("n")?;
                Ok((status.parse().map_err(corrupt)?, n.max(0) as u64))
            })
            .collect()
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn find_entry(
        &self,
        channel_id: ChannelId,
        external_id: &str,
        include: Include,
    ) -> StoreResult<Option<CatalogEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries WHERE channel_id = $1 AND external_id = $2"
        ))
        .bind(channel_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut entry = entry_from_row(&row)?;
        if include == Include::Games {
            entry.games = Associations::Loaded(self.load_games(entry.id).await?);
        }
        Ok(Some(entry))
    }

    async fn list_live_entries(&self, channel_id: ChannelId) -> StoreResult<Vec<CatalogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries WHERE channel_id = $1 AND NOT is_deleted ORDER BY id"
        ))
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn find_stale_entries(&self, channel_id: ChannelId, cutoff: DateTime<Utc>) -> StoreResult<Vec<CatalogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries \
             WHERE channel_id = $1 AND NOT is_deleted AND last_scraped_at < $2 ORDER BY id"
        ))
        .bind(channel_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn touch_entries(
        &self,
        channel_id: ChannelId,
        external_ids: &[String],
        at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        if external_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE catalog_entries SET last_scraped_at = $3 \
             WHERE channel_id = $1 AND NOT is_deleted AND external_id = ANY($2)",
        )
        .bind(channel_id)
        .bind(external_ids)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn find_games_by_titles(&self, titles: &[String]) -> StoreResult<Vec<Game>> {
        let lowered = titles.iter().map(|t| t.trim().to_lowercase()).collect::<Vec<_>>();
        let rows = sqlx::query("SELECT id, title FROM games WHERE LOWER(title) = ANY($1) ORDER BY id")
            .bind(&lowered)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<Game> {
                Ok(Game {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                })
            })
            .collect()
    }

    async fn commit(&self, unit: CatalogUnit) -> StoreResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(update) = &unit.message {
            let row = sqlx::query("SELECT status FROM raw_messages WHERE id = $1 FOR UPDATE")
                .bind(update.id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(StoreError::NotFound {
                    entity: "raw message",
                    id: update.id,
                })?;
            let current: String = row.try_get("status")?;
            check_transition(update.id, current.parse().map_err(corrupt)?, update.status)?;
        }

        let (entry_id, created) = match &unit.entry {
            EntryWrite::Insert(new) => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO catalog_entries
                        (channel_id, external_id, title, price_ps4, price_ps5, region, capacity,
                         has_original_mail, guarantee, seller_info, additional_info, stock_status,
                         is_deleted, last_scraped_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    ON CONFLICT (channel_id, external_id) DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(new.channel_id)
                .bind(&new.external_id)
                .bind(&new.title)
                .bind(new.price_ps4)
                .bind(new.price_ps5)
                .bind(&new.region)
                .bind(new.capacity.as_str())
                .bind(new.has_original_mail)
                .bind(&new.guarantee)
                .bind(&new.seller_info)
                .bind(&new.additional_info)
                .bind(new.stock_status.as_str())
                .bind(new.is_deleted)
                .bind(new.last_scraped_at)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::DuplicateKey {
                    channel_id: new.channel_id,
                    external_id: new.external_id.clone(),
                })?;
                (row.try_get::<i64, _>("id")?, true)
            }
            EntryWrite::Update(entry) => {
                let result = sqlx::query(
                    r#"
                    UPDATE catalog_entries
                       SET title = $2,
                           price_ps4 = $3,
                           price_ps5 = $4,
                           region = $5,
                           capacity = $6,
                           has_original_mail = $7,
                           guarantee = $8,
                           seller_info = $9,
                           additional_info = $10,
                           stock_status = $11,
                           is_deleted = $12,
                           last_scraped_at = $13,
                           updated_at = NOW()
                     WHERE id = $1
                    "#,
                )
                .bind(entry.id)
                .bind(&entry.title)
                .bind(entry.price_ps4)
                .bind(entry.price_ps5)
                .bind(&entry.region)
                .bind(entry.capacity.as_str())
                .bind(entry.has_original_mail)
                .bind(&entry.guarantee)
                .bind(&entry.seller_info)
                .bind(&entry.additional_info)
                .bind(entry.stock_status.as_str())
                .bind(entry.is_deleted)
                .bind(entry.last_scraped_at)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound {
                        entity: "catalog entry",
                        id: entry.id,
                    });
                }
                (entry.id, false)
            }
        };

        let mut created_games = Vec::new();
        let mut link = unit.games.link.clone();
        for title in &unit.games.create_and_link {
            let row = sqlx::query(
                r#"
                INSERT INTO games (title) VALUES ($1)
                ON CONFLICT ((LOWER(title))) DO UPDATE SET title = games.title
                RETURNING id, title, (xmax = 0) AS inserted
                "#,
            )
            .bind(title.trim())
            .fetch_one(&mut *tx)
            .await?;
            let game = Game {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
            };
            if row.try_get::<bool, _>("inserted")? {
                created_games.push(game.clone());
            }
            link.push(game.id);
        }

        if !unit.games.unlink.is_empty() {
            sqlx::query("DELETE FROM catalog_entry_games WHERE entry_id = $1 AND game_id = ANY($2)")
                .bind(entry_id)
                .bind(&unit.games.unlink)
                .execute(&mut *tx)
                .await?;
        }
        if !link.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO catalog_entry_games (entry_id, game_id)
                SELECT $1, UNNEST($2::BIGINT[])
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(entry_id)
            .bind(&link)
            .execute(&mut *tx)
            .await?;
        }

        let history = insert_history(&mut tx, entry_id, unit.history).await?;

        if let Some(update) = &unit.message {
            sqlx::query(
                r#"
                UPDATE raw_messages
                   SET status = $2,
                       catalog_entry_id = $3,
                       updated_at = NOW(),
                       updated_by = $4
                 WHERE id = $1
                "#,
            )
            .bind(update.id)
            .bind(update.status.as_str())
            .bind(entry_id)
            .bind(update.actor.label())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome {
            entry_id,
            created,
            history,
            created_games,
        })
    }
}

#[async_trait]
impl HistoryStore for PgStore {
    async fn append_history(&self, entry_id: EntryId, records: Vec<NewChangeRecord>) -> StoreResult<Vec<ChangeRecord>> {
        let mut tx = self.pool.begin().await?;
        let rows = insert_history(&mut tx, entry_id, records).await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn history_for(&self, entry_id: EntryId) -> StoreResult<Vec<ChangeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entry_id, field, old_value, new_value, changed_at, actor
              FROM change_records
             WHERE entry_id = $1
             ORDER BY changed_at, id
            "#,
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(change_from_row).collect()
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
