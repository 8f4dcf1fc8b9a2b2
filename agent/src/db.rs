use anyhow::{Context, Result, bail};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use orcein_common::now_ms;
use orcein_common::types::{JobStatus, JobType, SlideFormat};

use crate::models::{Job, OutboxEvent, ScannerFile, Slide, SlideUpdate};

const SLIDE_COLUMNS: &str = "id, original_filename, raw_path, format, status, width, height, \
     max_level, level_ready_max, tile_size, tilegen_status, app_mag, mpp, \
     external_case_id, external_case_base, external_slide_label, ocr_status, \
     dsmeta_path, barcode, file_size, created_at";

const JOB_COLUMNS: &str = "id, slide_id, job_type, status, error, created_at, updated_at";

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS slides (
                id TEXT PRIMARY KEY,
                original_filename TEXT NOT NULL,
                raw_path TEXT NOT NULL,
                format TEXT NOT NULL,
                status TEXT NOT NULL,
                width INT NOT NULL DEFAULT 0,
                height INT NOT NULL DEFAULT 0,
                max_level INT NOT NULL DEFAULT 0,
                level_ready_max INT NOT NULL DEFAULT 0,
                tile_size INT NOT NULL DEFAULT 256,
                tilegen_status TEXT NOT NULL DEFAULT 'absent',
                app_mag DOUBLE PRECISION,
                mpp DOUBLE PRECISION,
                external_case_id TEXT,
                external_case_base TEXT,
                external_slide_label TEXT,
                ocr_status TEXT NOT NULL DEFAULT 'absent',
                dsmeta_path TEXT,
                barcode TEXT,
                file_size BIGINT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create slides table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                slide_id TEXT NOT NULL REFERENCES slides(id) ON DELETE CASCADE,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create jobs table")?;

    // Backs the at-most-one-active-job invariant per (slide, type)
    client
        .execute(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active
            ON jobs (slide_id, job_type)
            WHERE status IN ('queued', 'running')
            "#,
            &[],
        )
        .await
        .context("failed to create active-job index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS scanner_files (
                path TEXT PRIMARY KEY,
                slide_id TEXT NOT NULL,
                barcode TEXT,
                guid TEXT,
                scanned_at TEXT,
                created_at BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create scanner_files table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id BIGSERIAL PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                op TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at BIGINT NOT NULL,
                synced_at BIGINT
            )
            "#,
            &[],
        )
        .await
        .context("failed to create outbox_events table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_unsynced
            ON outbox_events (id)
            WHERE synced_at IS NULL
            "#,
            &[],
        )
        .await
        .context("failed to create outbox index")?;

    tracing::info!("database schema initialized");
    Ok(())
}

fn slide_from_row(row: &Row) -> Result<Slide> {
    let format: String = row.get("format");
    let status: String = row.get("status");
    let tilegen_status: String = row.get("tilegen_status");
    let ocr_status: String = row.get("ocr_status");

    Ok(Slide {
        id: row.get("id"),
        original_filename: row.get("original_filename"),
        raw_path: row.get("raw_path"),
        format: format.parse()?,
        status: status.parse()?,
        width: row.get("width"),
        height: row.get("height"),
        max_level: row.get("max_level"),
        level_ready_max: row.get("level_ready_max"),
        tile_size: row.get("tile_size"),
        tilegen_status: tilegen_status.parse()?,
        app_mag: row.get("app_mag"),
        mpp: row.get("mpp"),
        external_case_id: row.get("external_case_id"),
        external_case_base: row.get("external_case_base"),
        external_slide_label: row.get("external_slide_label"),
        ocr_status: ocr_status.parse()?,
        dsmeta_path: row.get("dsmeta_path"),
        barcode: row.get("barcode"),
        file_size: row.get("file_size"),
        created_at: row.get("created_at"),
    })
}

fn job_from_row(row: &Row) -> Result<Job> {
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");

    Ok(Job {
        id: row.get("id"),
        slide_id: row.get("slide_id"),
        job_type: job_type.parse()?,
        status: status.parse()?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Insert a slide or, when the same content was seen before, update the
/// named fields and reset the slide to `queued` for re-ingest.
pub async fn upsert_slide(
    pool: &Pool,
    id: &str,
    original_filename: &str,
    raw_path: &str,
    format: SlideFormat,
    file_size: i64,
) -> Result<Slide> {
    let client = pool.get().await.context("failed to get db connection")?;
    let now = now_ms();

    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO slides
                    (id, original_filename, raw_path, format, status, file_size, created_at)
                VALUES ($1, $2, $3, $4, 'queued', $5, $6)
                ON CONFLICT (id) DO UPDATE
                SET original_filename = EXCLUDED.original_filename,
                    raw_path = EXCLUDED.raw_path,
                    format = EXCLUDED.format,
                    file_size = EXCLUDED.file_size,
                    status = 'queued'
                RETURNING {SLIDE_COLUMNS}
                "#
            ),
            &[
                &id,
                &original_filename,
                &raw_path,
                &format.as_str(),
                &file_size,
                &now,
            ],
        )
        .await
        .context("failed to upsert slide")?;

    slide_from_row(&row)
}

/// Refresh the identity fields of an already-processed slide without
/// touching its lifecycle state (re-sighting of known content).
pub async fn update_slide_identity(
    pool: &Pool,
    id: &str,
    original_filename: &str,
    raw_path: &str,
    file_size: i64,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            UPDATE slides
            SET original_filename = $2, raw_path = $3, file_size = $4
            WHERE id = $1
            "#,
            &[&id, &original_filename, &raw_path, &file_size],
        )
        .await
        .context("failed to update slide identity")?;

    Ok(())
}

pub async fn get_slide(pool: &Pool, id: &str) -> Result<Option<Slide>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {SLIDE_COLUMNS} FROM slides WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query slide")?;

    row.as_ref().map(slide_from_row).transpose()
}

/// List slides in reverse creation order.
pub async fn list_slides(pool: &Pool, offset: i64, limit: i64) -> Result<Vec<Slide>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {SLIDE_COLUMNS} FROM slides \
                 ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
            ),
            &[&limit, &offset],
        )
        .await
        .context("failed to list slides")?;

    rows.iter().map(slide_from_row).collect()
}

pub async fn find_slides_by_filename(pool: &Pool, filename: &str) -> Result<Vec<Slide>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {SLIDE_COLUMNS} FROM slides \
                 WHERE original_filename = $1 ORDER BY created_at DESC"
            ),
            &[&filename],
        )
        .await
        .context("failed to query slides by filename")?;

    rows.iter().map(slide_from_row).collect()
}

pub async fn list_pending_ocr(pool: &Pool) -> Result<Vec<Slide>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {SLIDE_COLUMNS} FROM slides \
                 WHERE ocr_status = 'pending' ORDER BY created_at ASC"
            ),
            &[],
        )
        .await
        .context("failed to list pending-ocr slides")?;

    rows.iter().map(slide_from_row).collect()
}

/// Apply a partial update to a slide, enforcing the registry invariants on
/// the merged row before committing.
pub async fn update_slide(pool: &Pool, id: &str, update: &SlideUpdate) -> Result<Option<Slide>> {
    if update.is_empty() {
        return get_slide(pool, id).await;
    }

    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let Some(row) = tx
        .query_opt(
            &format!("SELECT {SLIDE_COLUMNS} FROM slides WHERE id = $1 FOR UPDATE"),
            &[&id],
        )
        .await
        .context("failed to lock slide row")?
    else {
        return Ok(None);
    };
    let current = slide_from_row(&row)?;

    // Merged view of the row after the update, for invariant checks
    let width = update.width.unwrap_or(current.width);
    let height = update.height.unwrap_or(current.height);
    let max_level = update.max_level.unwrap_or(current.max_level);
    let level_ready_max = update.level_ready_max.unwrap_or(current.level_ready_max);
    let status = update.status.unwrap_or(current.status);

    if level_ready_max > max_level {
        bail!(
            "invariant violation on slide {}: level_ready_max {} > max_level {}",
            id,
            level_ready_max,
            max_level
        );
    }
    if status == orcein_common::types::SlideStatus::Ready && (width <= 0 || height <= 0) {
        bail!(
            "invariant violation on slide {}: ready without dimensions ({}x{})",
            id,
            width,
            height
        );
    }

    let status_text = update.status.map(|v| v.as_str());
    let tilegen_text = update.tilegen_status.map(|v| v.as_str());
    let ocr_text = update.ocr_status.map(|v| v.as_str());

    let mut set_clauses = Vec::new();
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = Vec::new();
    let mut param_idx = 1;

    macro_rules! set {
        ($field:expr, $column:literal) => {
            if let Some(ref v) = $field {
                set_clauses.push(format!(concat!($column, " = ${}"), param_idx));
                params.push(v);
                param_idx += 1;
            }
        };
    }

    set!(status_text, "status");
    set!(update.width, "width");
    set!(update.height, "height");
    set!(update.max_level, "max_level");
    set!(update.level_ready_max, "level_ready_max");
    set!(tilegen_text, "tilegen_status");
    set!(update.app_mag, "app_mag");
    set!(update.mpp, "mpp");
    set!(update.external_case_id, "external_case_id");
    set!(update.external_case_base, "external_case_base");
    set!(update.external_slide_label, "external_slide_label");
    set!(ocr_text, "ocr_status");
    set!(update.dsmeta_path, "dsmeta_path");
    set!(update.barcode, "barcode");
    set!(update.file_size, "file_size");

    let query = format!(
        "UPDATE slides SET {} WHERE id = ${} RETURNING {}",
        set_clauses.join(", "),
        param_idx,
        SLIDE_COLUMNS
    );
    params.push(&id);

    let row = tx
        .query_one(&query, &params)
        .await
        .context("failed to update slide")?;
    let slide = slide_from_row(&row)?;

    tx.commit().await.context("failed to commit slide update")?;
    Ok(Some(slide))
}

/// Delete a slide. Its jobs go with it via the FK cascade.
pub async fn delete_slide(pool: &Pool, id: &str) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows_affected = client
        .execute("DELETE FROM slides WHERE id = $1", &[&id])
        .await
        .context("failed to delete slide")?;

    Ok(rows_affected > 0)
}

/// Result of trying to create and enqueue a job.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// A new job row was created and pushed to the queue
    Enqueued(Uuid),
    /// A queued or running job already exists for this (slide, type)
    Skipped,
    /// The row was created but pushing to the queue failed; rolled back
    PublishFailed,
}

/// Atomically create a job row for `(slide_id, job_type)` and push it to the
/// queue via the callback, holding the transaction open across the publish.
/// If a queued or running job already exists the call is a no-op.
pub async fn create_and_enqueue<F, Fut>(
    pool: &Pool,
    slide_id: &str,
    job_type: JobType,
    publish_fn: F,
) -> Result<EnqueueOutcome>
where
    F: FnOnce(Uuid) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    if job_type == JobType::Tilegen {
        let row = tx
            .query_opt("SELECT format FROM slides WHERE id = $1", &[&slide_id])
            .await
            .context("failed to query slide format")?;
        let format: SlideFormat = match row {
            Some(r) => r.get::<_, String>("format").parse()?,
            None => bail!("slide {} not found for tilegen job", slide_id),
        };
        if !format.is_wsi() {
            bail!(
                "invariant violation: tilegen job for non-WSI slide {} ({})",
                slide_id,
                format
            );
        }
    }

    let job_id = Uuid::new_v4();
    let now = now_ms();
    let inserted = tx
        .execute(
            r#"
            INSERT INTO jobs (id, slide_id, job_type, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'queued', $4, $4)
            ON CONFLICT (slide_id, job_type) WHERE status IN ('queued', 'running')
            DO NOTHING
            "#,
            &[&job_id, &slide_id, &job_type.as_str(), &now],
        )
        .await
        .context("failed to insert job row")?;

    if inserted == 0 {
        tx.rollback()
            .await
            .context("failed to rollback transaction")?;
        return Ok(EnqueueOutcome::Skipped);
    }

    if let Err(e) = publish_fn(job_id).await {
        tracing::error!(slide_id = %slide_id, job_type = %job_type, error = ?e, "queue push failed, rolling back");
        tx.rollback()
            .await
            .context("failed to rollback transaction")?;
        return Ok(EnqueueOutcome::PublishFailed);
    }

    tx.commit().await.context("failed to commit transaction")?;
    Ok(EnqueueOutcome::Enqueued(job_id))
}

/// Move a job along queued→running→(done|failed). Returns false when the
/// job is not in a state the transition is allowed from (running→queued is
/// never allowed).
pub async fn transition_job(
    pool: &Pool,
    job_id: Uuid,
    status: JobStatus,
    error: Option<&str>,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let now = now_ms();

    let rows_affected = client
        .execute(
            r#"
            UPDATE jobs SET status = $2, error = $3, updated_at = $4
            WHERE id = $1 AND (
                (status = 'queued' AND $2 = 'running')
                OR (status = 'queued' AND $2 = 'failed')
                OR (status = 'running' AND $2 IN ('done', 'failed'))
            )
            "#,
            &[&job_id, &status.as_str(), &error, &now],
        )
        .await
        .context("failed to transition job")?;

    Ok(rows_affected > 0)
}

pub async fn get_job(pool: &Pool, job_id: Uuid) -> Result<Option<Job>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"),
            &[&job_id],
        )
        .await
        .context("failed to query job")?;

    row.as_ref().map(job_from_row).transpose()
}

pub async fn list_jobs_for_slide(pool: &Pool, slide_id: &str) -> Result<Vec<Job>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE slide_id = $1 ORDER BY created_at ASC"),
            &[&slide_id],
        )
        .await
        .context("failed to list jobs")?;

    rows.iter().map(job_from_row).collect()
}

/// On restart no worker owns any job, so every `running` row is an orphan:
/// reconcile them to `failed` and let the operator retry.
pub async fn reconcile_running_jobs(pool: &Pool) -> Result<u64> {
    let client = pool.get().await.context("failed to get db connection")?;
    let now = now_ms();

    let reconciled = client
        .execute(
            r#"
            UPDATE jobs SET status = 'failed', error = 'agent restarted', updated_at = $1
            WHERE status = 'running'
            "#,
            &[&now],
        )
        .await
        .context("failed to reconcile running jobs")?;

    if reconciled > 0 {
        tracing::warn!(count = reconciled, "reconciled orphaned running jobs to failed");
    }
    Ok(reconciled)
}

pub async fn scanner_file_seen(pool: &Pool, path: &str) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt("SELECT 1 FROM scanner_files WHERE path = $1", &[&path])
        .await
        .context("failed to query scanner file")?;

    Ok(row.is_some())
}

pub async fn insert_scanner_file(pool: &Pool, record: &ScannerFile) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            INSERT INTO scanner_files (path, slide_id, barcode, guid, scanned_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (path) DO NOTHING
            "#,
            &[
                &record.path,
                &record.slide_id,
                &record.barcode,
                &record.guid,
                &record.scanned_at,
                &record.created_at,
            ],
        )
        .await
        .context("failed to insert scanner file")?;

    Ok(())
}

/// Append a domain event to the outbox. Returns the event id.
pub async fn append_outbox(
    pool: &Pool,
    entity_type: &str,
    entity_id: &str,
    op: &str,
    payload: &serde_json::Value,
) -> Result<i64> {
    let client = pool.get().await.context("failed to get db connection")?;
    let now = now_ms();

    let row = client
        .query_one(
            r#"
            INSERT INTO outbox_events (entity_type, entity_id, op, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
            &[&entity_type, &entity_id, &op, &payload, &now],
        )
        .await
        .context("failed to append outbox event")?;

    Ok(row.get("id"))
}

pub async fn list_unsynced_outbox(pool: &Pool, limit: i64) -> Result<Vec<OutboxEvent>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            r#"
            SELECT id, entity_type, entity_id, op, payload, created_at, synced_at
            FROM outbox_events
            WHERE synced_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#,
            &[&limit],
        )
        .await
        .context("failed to list outbox events")?;

    Ok(rows
        .iter()
        .map(|r| OutboxEvent {
            id: r.get("id"),
            entity_type: r.get("entity_type"),
            entity_id: r.get("entity_id"),
            op: r.get("op"),
            payload: r.get("payload"),
            created_at: r.get("created_at"),
            synced_at: r.get("synced_at"),
        })
        .collect())
}

pub async fn mark_outbox_synced(pool: &Pool, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let client = pool.get().await.context("failed to get db connection")?;
    let now = now_ms();

    let updated = client
        .execute(
            "UPDATE outbox_events SET synced_at = $1 WHERE id = ANY($2) AND synced_at IS NULL",
            &[&now, &ids],
        )
        .await
        .context("failed to mark outbox events synced")?;

    Ok(updated)
}
