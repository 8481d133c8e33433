use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

use crate::models::media::{FilePurpose, MediaResource, RemoteFile};
use crate::models::task::{ImportItem, ImportStatus, ImportTask, ResourceType};
use crate::services::store::{StatusStore, StoreError};

/// Index enforcing one non-terminal task per game.
const ACTIVE_TASK_INDEX: &str = "import_tasks_one_active_per_game";

/// Postgres-backed status store.
#[derive(Clone)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_text<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unexpected {column} value '{raw}'")))
}

fn path_text(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

/// Map a unique violation on the active-task index to a conflict.
fn conflict_or(err: sqlx::Error, game_id: Option<Uuid>) -> StoreError {
    if let (sqlx::Error::Database(db), Some(game_id)) = (&err, game_id) {
        if db.is_unique_violation() && db.constraint() == Some(ACTIVE_TASK_INDEX) {
            return StoreError::Conflict(game_id);
        }
    }
    StoreError::Database(err)
}

fn item_from_row(row: &PgRow) -> Result<ImportItem, StoreError> {
    let photo: Option<String> = row.try_get("source_photo_path")?;
    let video: Option<String> = row.try_get("source_video_path")?;
    Ok(ImportItem {
        id: row.try_get("id")?,
        position: row.try_get("position")?,
        base_name: row.try_get("base_name")?,
        resource_type: parse_text(row, "resource_type")?,
        source_photo_path: photo.map(PathBuf::from),
        source_photo_name: row.try_get("source_photo_name")?,
        source_video_path: video.map(PathBuf::from),
        source_video_name: row.try_get("source_video_name")?,
        alternate_format_override: row.try_get("alternate_format_override")?,
        status: parse_text(row, "status")?,
        message: row.try_get("message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Load a task and its items. With `for_update` the task row stays locked
/// until the surrounding transaction ends.
async fn load_task(
    conn: &mut PgConnection,
    task_id: Uuid,
    for_update: bool,
) -> Result<Option<ImportTask>, StoreError> {
    let sql = if for_update {
        r#"
        SELECT id, game_id, status, message, created_at, started_at, completed_at
        FROM import_tasks
        WHERE id = $1
        FOR UPDATE
        "#
    } else {
        r#"
        SELECT id, game_id, status, message, created_at, started_at, completed_at
        FROM import_tasks
        WHERE id = $1
        "#
    };

    let row = match sqlx::query(sql).bind(task_id).fetch_optional(&mut *conn).await? {
        Some(r) => r,
        None => return Ok(None),
    };

    let item_rows = sqlx::query(
        r#"
        SELECT id, position, base_name, resource_type, source_photo_path, source_photo_name,
               source_video_path, source_video_name, alternate_format_override, status,
               message, started_at, completed_at
        FROM import_items
        WHERE task_id = $1
        ORDER BY position ASC
        "#,
    )
    .bind(task_id)
    .fetch_all(&mut *conn)
    .await?;

    let items = item_rows
        .iter()
        .map(item_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(ImportTask {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        status: parse_text(&row, "status")?,
        message: row.try_get("message")?,
        items,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    }))
}

async fn write_task_state(conn: &mut PgConnection, task: &ImportTask) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE import_tasks
        SET status = $2, message = $3, started_at = $4, completed_at = $5
        WHERE id = $1
        "#,
    )
    .bind(task.id)
    .bind(task.status.to_string())
    .bind(task.message.as_deref())
    .bind(task.started_at)
    .bind(task.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_item_state(conn: &mut PgConnection, item: &ImportItem) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE import_items
        SET status = $2, message = $3, started_at = $4, completed_at = $5
        WHERE id = $1
        "#,
    )
    .bind(item.id)
    .bind(item.status.to_string())
    .bind(item.message.as_deref())
    .bind(item.started_at)
    .bind(item.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert a task and its items in one transaction.
pub async fn create_task(pool: &PgPool, task: &ImportTask) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO import_tasks (id, game_id, status, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(task.id)
    .bind(task.game_id)
    .bind(task.status.to_string())
    .bind(task.created_at)
    .execute(&mut *tx)
    .await
    .map_err(|e| conflict_or(e, task.game_id))?;

    for item in &task.items {
        sqlx::query(
            r#"
            INSERT INTO import_items (id, task_id, position, base_name, resource_type,
                                      source_photo_path, source_photo_name,
                                      source_video_path, source_video_name,
                                      alternate_format_override, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(item.id)
        .bind(task.id)
        .bind(item.position)
        .bind(&item.base_name)
        .bind(item.resource_type.to_string())
        .bind(path_text(&item.source_photo_path))
        .bind(item.source_photo_name.as_deref())
        .bind(path_text(&item.source_video_path))
        .bind(item.source_video_name.as_deref())
        .bind(item.alternate_format_override)
        .bind(item.status.to_string())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn get_task(pool: &PgPool, task_id: Uuid) -> Result<Option<ImportTask>, StoreError> {
    let mut conn = pool.acquire().await?;
    load_task(&mut conn, task_id, false).await
}

pub async fn active_task_for_game(
    pool: &PgPool,
    game_id: Uuid,
) -> Result<Option<ImportTask>, StoreError> {
    let id: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM import_tasks
        WHERE game_id = $1 AND status IN ('Queued', 'Started')
        "#,
    )
    .bind(game_id)
    .fetch_optional(pool)
    .await?;

    match id {
        Some(id) => get_task(pool, id).await,
        None => Ok(None),
    }
}

/// Non-terminal tasks, oldest first (recovery order).
pub async fn incomplete_tasks(pool: &PgPool) -> Result<Vec<ImportTask>, StoreError> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM import_tasks
        WHERE status IN ('Queued', 'Started')
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut conn = pool.acquire().await?;
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(task) = load_task(&mut conn, id, false).await? {
            tasks.push(task);
        }
    }
    Ok(tasks)
}

pub async fn mark_task_started(
    pool: &PgPool,
    task_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ImportTask, StoreError> {
    sqlx::query(
        r#"
        UPDATE import_tasks
        SET status = 'Started',
            started_at = COALESCE(started_at, $2)
        WHERE id = $1 AND status = 'Queued'
        "#,
    )
    .bind(task_id)
    .bind(now)
    .execute(pool)
    .await?;

    get_task(pool, task_id)
        .await?
        .ok_or(StoreError::NotFound(task_id))
}

pub async fn transition_item(
    pool: &PgPool,
    task_id: Uuid,
    item_id: Uuid,
    from: &[ImportStatus],
    to: ImportStatus,
    message: Option<String>,
    now: DateTime<Utc>,
) -> Result<Option<ImportTask>, StoreError> {
    let mut tx = pool.begin().await?;
    let mut task = load_task(&mut tx, task_id, true)
        .await?
        .ok_or(StoreError::NotFound(task_id))?;

    let item = task
        .item_mut(item_id)
        .ok_or_else(|| StoreError::Corrupt(format!("item {item_id} not in task {task_id}")))?;
    if !from.contains(&item.status) {
        tx.rollback().await?;
        return Ok(None);
    }
    item.apply_transition(to, message, now);
    write_item_state(&mut tx, item).await?;

    task.refresh_aggregate(now);
    write_task_state(&mut tx, &task).await?;

    tx.commit().await?;
    Ok(Some(task))
}

pub async fn restart_task(
    pool: &PgPool,
    task_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ImportTask, StoreError> {
    let mut tx = pool.begin().await?;
    let mut task = load_task(&mut tx, task_id, true)
        .await?
        .ok_or(StoreError::NotFound(task_id))?;

    if task.status != ImportStatus::Failed {
        return Err(StoreError::InvalidState {
            task_id,
            status: task.status,
            expected: ImportStatus::Failed,
        });
    }

    task.reset_for_restart(now);
    for item in task.items.iter().filter(|i| i.status == ImportStatus::Queued) {
        write_item_state(&mut tx, item).await?;
    }
    write_task_state(&mut tx, &task)
        .await
        .map_err(|e| conflict_or(e, task.game_id))?;

    tx.commit().await?;
    Ok(task)
}

/// Upsert a media resource and its files. `favorite` is user-owned and only
/// set on first insert.
pub async fn save_media_resource(pool: &PgPool, resource: &MediaResource) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO media_resources (asset_identifier, game_id, resource_type, favorite,
                                     alternate_format_override)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (asset_identifier) DO UPDATE
        SET game_id = EXCLUDED.game_id,
            resource_type = EXCLUDED.resource_type,
            alternate_format_override = EXCLUDED.alternate_format_override,
            updated_at = NOW()
        "#,
    )
    .bind(resource.asset_identifier)
    .bind(resource.game_id)
    .bind(resource.resource_type.to_string())
    .bind(resource.favorite)
    .bind(resource.alternate_format_override)
    .execute(&mut *tx)
    .await?;

    for file in &resource.files {
        sqlx::query(
            r#"
            INSERT INTO remote_files (resource_id, purpose, name_modifier, extension,
                                      content_type, storage_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (resource_id, (COALESCE(name_modifier, '')), extension) DO UPDATE
            SET purpose = EXCLUDED.purpose,
                content_type = EXCLUDED.content_type,
                storage_key = EXCLUDED.storage_key
            "#,
        )
        .bind(resource.asset_identifier)
        .bind(file.purpose.to_string())
        .bind(file.name_modifier.as_deref())
        .bind(&file.extension)
        .bind(&file.content_type)
        .bind(&file.storage_key)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn get_media_resource(
    pool: &PgPool,
    asset_identifier: Uuid,
) -> Result<Option<MediaResource>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT asset_identifier, game_id, resource_type, favorite, alternate_format_override
        FROM media_resources
        WHERE asset_identifier = $1
        "#,
    )
    .bind(asset_identifier)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let file_rows = sqlx::query(
        r#"
        SELECT purpose, name_modifier, extension, content_type, storage_key
        FROM remote_files
        WHERE resource_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(asset_identifier)
    .fetch_all(pool)
    .await?;

    let files = file_rows
        .iter()
        .map(|r| -> Result<RemoteFile, StoreError> {
            Ok(RemoteFile {
                purpose: parse_text::<FilePurpose>(r, "purpose")?,
                name_modifier: r.try_get("name_modifier")?,
                extension: r.try_get("extension")?,
                content_type: r.try_get("content_type")?,
                storage_key: r.try_get("storage_key")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(MediaResource {
        asset_identifier: row.try_get("asset_identifier")?,
        game_id: row.try_get("game_id")?,
        resource_type: parse_text::<ResourceType>(&row, "resource_type")?,
        favorite: row.try_get("favorite")?,
        alternate_format_override: row.try_get("alternate_format_override")?,
        files,
    }))
}

pub async fn referenced_temp_paths(pool: &PgPool) -> Result<HashSet<PathBuf>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT i.source_photo_path, i.source_video_path
        FROM import_items i
        JOIN import_tasks t ON t.id = i.task_id
        WHERE t.status IN ('Queued', 'Started')
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut paths = HashSet::new();
    for row in rows {
        for column in ["source_photo_path", "source_video_path"] {
            let path: Option<String> = row.try_get(column)?;
            if let Some(p) = path {
                paths.insert(PathBuf::from(p));
            }
        }
    }
    Ok(paths)
}

#[async_trait::async_trait]
impl StatusStore for PgStatusStore {
    async fn create_task(&self, task: &ImportTask) -> Result<(), StoreError> {
        create_task(&self.pool, task).await
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<ImportTask>, StoreError> {
        get_task(&self.pool, task_id).await
    }

    async fn active_task_for_game(&self, game_id: Uuid) -> Result<Option<ImportTask>, StoreError> {
        active_task_for_game(&self.pool, game_id).await
    }

    async fn incomplete_tasks(&self) -> Result<Vec<ImportTask>, StoreError> {
        incomplete_tasks(&self.pool).await
    }

    async fn mark_task_started(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ImportTask, StoreError> {
        mark_task_started(&self.pool, task_id, now).await
    }

    async fn transition_item(
        &self,
        task_id: Uuid,
        item_id: Uuid,
        from: &[ImportStatus],
        to: ImportStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<ImportTask>, StoreError> {
        transition_item(&self.pool, task_id, item_id, from, to, message, now).await
    }

    async fn restart_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<ImportTask, StoreError> {
        restart_task(&self.pool, task_id, now).await
    }

    async fn save_media_resource(&self, resource: &MediaResource) -> Result<(), StoreError> {
        save_media_resource(&self.pool, resource).await
    }

    async fn get_media_resource(
        &self,
        asset_identifier: Uuid,
    ) -> Result<Option<MediaResource>, StoreError> {
        get_media_resource(&self.pool, asset_identifier).await
    }

    async fn referenced_temp_paths(&self) -> Result<HashSet<PathBuf>, StoreError> {
        referenced_temp_paths(&self.pool).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
