use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::error::{
    ApplyPragmaSnafu, BrokenInvariantSnafu, CreateDatabaseDirSnafu, DatabaseUrlSnafu,
    DecodePayloadSnafu, EncodePayloadSnafu, MigrateSnafu, NotFoundSnafu, OpenDatabaseSnafu,
    QuerySnafu, StorageResult,
};
use super::ids::{BlockId, MessageId, RobotId, TopicId};
use super::types::{
    BlockRecord, BlockRecordKind, BlockRecordStatus, DEFAULT_TOPIC_NAME, MessageRecord, NewTopic,
    StorageBatch, TopicRecord, TopicSummary,
};
use super::{BatchStore, BlockStore, BoxFuture, TopicStore};

// SQLite caps bound parameters per statement; keep IN-lists well below it.
const MAX_IN_LIST_BINDS: usize = 500;

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

#[derive(Debug, FromRow)]
struct TopicRow {
    id: String,
    robot_id: String,
    name: String,
    messages_json: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct BlockRow {
    id: String,
    message_id: String,
    status: String,
    payload_json: String,
    created_at: i64,
    updated_at: i64,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(DatabaseUrlSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps `:memory:` databases alive for the pool lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(OpenDatabaseSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(ApplyPragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(ApplyPragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(MigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite storage opened");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn create_topic_impl(&self, input: NewTopic) -> StorageResult<TopicRecord> {
        let topic_id = TopicId::new_v7();
        let now = unix_timestamp_millis();
        let name = if input.name.trim().is_empty() {
            DEFAULT_TOPIC_NAME.to_string()
        } else {
            input.name.trim().to_string()
        };

        sqlx::query(
            "INSERT INTO topics (id, robot_id, name, messages_json, created_at, updated_at) VALUES (?, ?, ?, '[]', ?, ?)",
        )
        .bind(topic_id.to_string())
        .bind(input.robot_id.to_string())
        .bind(name.clone())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "topic-create-insert",
        })?;

        Ok(TopicRecord {
            id: topic_id,
            robot_id: input.robot_id,
            name,
            messages: Vec::new(),
            created_at_unix_millis: now,
            updated_at_unix_millis: now,
        })
    }

    async fn list_topics_impl(&self, robot_id: RobotId) -> StorageResult<Vec<TopicSummary>> {
        let rows = sqlx::query_as::<_, TopicRow>(
            "SELECT id, robot_id, name, messages_json, created_at, updated_at FROM topics WHERE robot_id = ? ORDER BY updated_at DESC, id DESC",
        )
        .bind(robot_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "topic-list-query",
        })?;

        rows.into_iter()
            .map(|row| -> StorageResult<TopicSummary> {
                let record = topic_row_to_record(row)?;
                Ok(TopicSummary {
                    id: record.id,
                    robot_id: record.robot_id,
                    name: record.name,
                    message_count: record.messages.len(),
                    updated_at_unix_millis: record.updated_at_unix_millis,
                })
            })
            .collect()
    }

    async fn load_topic_impl(&self, topic_id: TopicId) -> StorageResult<Option<TopicRecord>> {
        let mut connection = self.pool.acquire().await.context(QuerySnafu {
            stage: "topic-load-acquire",
        })?;
        let row = load_topic_row(&mut connection, topic_id, "topic-load-query").await?;
        row.map(topic_row_to_record).transpose()
    }

    async fn rename_topic_impl(&self, topic_id: TopicId, name: String) -> StorageResult<()> {
        let name = if name.trim().is_empty() {
            DEFAULT_TOPIC_NAME.to_string()
        } else {
            name.trim().to_string()
        };

        let result = sqlx::query("UPDATE topics SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(unix_timestamp_millis())
            .bind(topic_id.to_string())
            .execute(&self.pool)
            .await
            .context(QuerySnafu {
                stage: "topic-rename-apply",
            })?;

        if result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "topic-rename-missing",
                entity: "topic",
                id: topic_id.to_string(),
            }
            .fail();
        }

        Ok(())
    }

    async fn delete_topic_impl(&self, topic_id: TopicId) -> StorageResult<()> {
        let mut connection = self.pool.acquire().await.context(QuerySnafu {
            stage: "topic-delete-acquire",
        })?;
        let mut tx = connection.begin().await.context(QuerySnafu {
            stage: "topic-delete-begin",
        })?;

        let row = load_topic_row(&mut tx, topic_id, "topic-delete-load")
            .await?
            .context(NotFoundSnafu {
                stage: "topic-delete-missing",
                entity: "topic",
                id: topic_id.to_string(),
            })?;
        let record = topic_row_to_record(row)?;
        let message_ids = record
            .messages
            .iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();

        // Blocks are only reachable through the topic's message list, so they go first.
        for chunk in message_ids.chunks(MAX_IN_LIST_BINDS) {
            let mut builder =
                QueryBuilder::<Sqlite>::new("DELETE FROM message_blocks WHERE message_id IN (");
            let mut separated = builder.separated(", ");
            for message_id in chunk {
                separated.push_bind(message_id.to_string());
            }
            separated.push_unseparated(")");
            builder
                .build()
                .execute(&mut *tx)
                .await
                .context(QuerySnafu {
                    stage: "topic-delete-blocks",
                })?;
        }

        sqlx::query("DELETE FROM topics WHERE id = ?")
            .bind(topic_id.to_string())
            .execute(&mut *tx)
            .await
            .context(QuerySnafu {
                stage: "topic-delete-row",
            })?;

        tx.commit().await.context(QuerySnafu {
            stage: "topic-delete-commit",
        })?;

        Ok(())
    }

    async fn load_blocks_impl(&self, message_ids: Vec<MessageId>) -> StorageResult<Vec<BlockRecord>> {
        let mut blocks = Vec::new();

        for chunk in message_ids.chunks(MAX_IN_LIST_BINDS) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT id, message_id, status, payload_json, created_at, updated_at FROM message_blocks WHERE message_id IN (",
            );
            let mut separated = builder.separated(", ");
            for message_id in chunk {
                separated.push_bind(message_id.to_string());
            }
            separated.push_unseparated(") ORDER BY created_at ASC, id ASC");

            let rows = builder
                .build_query_as::<BlockRow>()
                .fetch_all(&self.pool)
                .await
                .context(QuerySnafu {
                    stage: "block-load-query",
                })?;

            for row in rows {
                blocks.push(block_row_to_record(row)?);
            }
        }

        Ok(blocks)
    }

    async fn commit_impl(&self, batch: StorageBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut connection = self.pool.acquire().await.context(QuerySnafu {
            stage: "batch-commit-acquire",
        })?;
        let mut tx = connection.begin().await.context(QuerySnafu {
            stage: "batch-commit-begin",
        })?;

        for block_id in &batch.delete_block_ids {
            sqlx::query("DELETE FROM message_blocks WHERE id = ?")
                .bind(block_id.to_string())
                .execute(&mut *tx)
                .await
                .context(QuerySnafu {
                    stage: "batch-commit-delete-block",
                })?;
        }

        for block in &batch.upsert_blocks {
            upsert_block(&mut tx, block).await?;
        }

        if let Some((topic_id, messages)) = &batch.topic_messages {
            write_topic_messages(&mut tx, *topic_id, messages).await?;
        }

        // Dropping `tx` on any early return above rolls every statement back.
        tx.commit().await.context(QuerySnafu {
            stage: "batch-commit",
        })?;

        Ok(())
    }
}

impl TopicStore for SqliteStorage {
    fn create_topic(&self, input: NewTopic) -> BoxFuture<'_, StorageResult<TopicRecord>> {
        Box::pin(self.create_topic_impl(input))
    }

    fn list_topics(&self, robot_id: RobotId) -> BoxFuture<'_, StorageResult<Vec<TopicSummary>>> {
        Box::pin(self.list_topics_impl(robot_id))
    }

    fn load_topic(&self, topic_id: TopicId) -> BoxFuture<'_, StorageResult<Option<TopicRecord>>> {
        Box::pin(self.load_topic_impl(topic_id))
    }

    fn rename_topic(&self, topic_id: TopicId, name: String) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.rename_topic_impl(topic_id, name))
    }

    fn delete_topic(&self, topic_id: TopicId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.delete_topic_impl(topic_id))
    }

    fn put_topic_messages(
        &self,
        topic_id: TopicId,
        messages: Vec<MessageRecord>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.commit_impl(StorageBatch::new().with_topic_messages(topic_id, messages)))
    }
}

impl BlockStore for SqliteStorage {
    fn load_blocks(
        &self,
        message_ids: Vec<MessageId>,
    ) -> BoxFuture<'_, StorageResult<Vec<BlockRecord>>> {
        Box::pin(self.load_blocks_impl(message_ids))
    }

    fn put_block(&self, block: BlockRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.commit_impl(StorageBatch::new().with_block(block)))
    }

    fn put_blocks(&self, blocks: Vec<BlockRecord>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.commit_impl(StorageBatch::new().with_blocks(blocks)))
    }

    fn delete_blocks(&self, block_ids: Vec<BlockId>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.commit_impl(StorageBatch::new().with_deleted_blocks(block_ids)))
    }
}

impl BatchStore for SqliteStorage {
    fn commit(&self, batch: StorageBatch) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.commit_impl(batch))
    }
}

async fn load_topic_row(
    connection: &mut SqliteConnection,
    topic_id: TopicId,
    stage: &'static str,
) -> StorageResult<Option<TopicRow>> {
    sqlx::query_as::<_, TopicRow>(
        "SELECT id, robot_id, name, messages_json, created_at, updated_at FROM topics WHERE id = ?",
    )
    .bind(topic_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(QuerySnafu { stage })
}

async fn write_topic_messages(
    connection: &mut SqliteConnection,
    topic_id: TopicId,
    messages: &[MessageRecord],
) -> StorageResult<()> {
    let messages_json = serde_json::to_string(messages).context(EncodePayloadSnafu {
        stage: "topic-messages-encode",
        entity: "topic messages",
    })?;

    let result = sqlx::query("UPDATE topics SET messages_json = ?, updated_at = ? WHERE id = ?")
        .bind(messages_json)
        .bind(unix_timestamp_millis())
        .bind(topic_id.to_string())
        .execute(&mut *connection)
        .await
        .context(QuerySnafu {
            stage: "topic-messages-update",
        })?;

    if result.rows_affected() == 0 {
        return NotFoundSnafu {
            stage: "topic-messages-missing",
            entity: "topic",
            id: topic_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

async fn upsert_block(connection: &mut SqliteConnection, block: &BlockRecord) -> StorageResult<()> {
    let payload_json = serde_json::to_string(&block.kind).context(EncodePayloadSnafu {
        stage: "block-upsert-encode",
        entity: "message block",
    })?;

    sqlx::query(
        "INSERT INTO message_blocks (id, message_id, block_type, status, payload_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET message_id = excluded.message_id, block_type = excluded.block_type, status = excluded.status, payload_json = excluded.payload_json, updated_at = excluded.updated_at",
    )
    .bind(block.id.to_string())
    .bind(block.message_id.to_string())
    .bind(block.kind.type_name())
    .bind(block.status.as_sql())
    .bind(payload_json)
    .bind(block.created_at_unix_millis)
    .bind(block.updated_at_unix_millis)
    .execute(&mut *connection)
    .await
    .context(QuerySnafu {
        stage: "block-upsert-apply",
    })?;

    Ok(())
}

fn topic_row_to_record(row: TopicRow) -> StorageResult<TopicRecord> {
    let messages = serde_json::from_str::<Vec<MessageRecord>>(&row.messages_json).context(
        DecodePayloadSnafu {
            stage: "topic-row-decode-messages",
            entity: "topic messages",
            id: row.id.clone(),
        },
    )?;

    Ok(TopicRecord {
        id: TopicId::parse(&row.id)?,
        robot_id: RobotId::parse(&row.robot_id)?,
        name: row.name,
        messages,
        created_at_unix_millis: row.created_at,
        updated_at_unix_millis: row.updated_at,
    })
}

fn block_row_to_record(row: BlockRow) -> StorageResult<BlockRecord> {
    let kind = serde_json::from_str::<BlockRecordKind>(&row.payload_json).context(
        DecodePayloadSnafu {
            stage: "block-row-decode-payload",
            entity: "message block",
            id: row.id.clone(),
        },
    )?;

    Ok(BlockRecord {
        id: BlockId::parse(&row.id)?,
        message_id: MessageId::parse(&row.message_id)?,
        status: block_status_from_sql(&row.status)?,
        kind,
        created_at_unix_millis: row.created_at,
        updated_at_unix_millis: row.updated_at,
    })
}

fn block_status_from_sql(raw: &str) -> StorageResult<BlockRecordStatus> {
    match raw {
        "processing" => Ok(BlockRecordStatus::Processing),
        "streaming" => Ok(BlockRecordStatus::Streaming),
        "success" => Ok(BlockRecordStatus::Success),
        "error" => Ok(BlockRecordStatus::Error),
        "paused" => Ok(BlockRecordStatus::Paused),
        _ => BrokenInvariantSnafu {
            stage: "block-status-from-sql",
            details: format!("unknown block status '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDatabaseDirSnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
