use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use deadpool_postgres::Pool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orcein_common::events::{EventBus, kinds};
use orcein_common::types::{
    JobPayload, JobStatus, JobType, SlideStatus, TilegenStatus, max_level_for,
};

use crate::db::{self, EnqueueOutcome};
use crate::models::{LocalManifest, Slide, SlideUpdate};
use crate::preview::{self, PreviewConfig};
use crate::queue::JobQueue;
use crate::raster;
use crate::store::ObjectStore;
use crate::tilegen;
use crate::vips::Toolchain;

/// Blocking-pop timeout; the loop wakes this often to observe shutdown.
const POP_TIMEOUT: Duration = Duration::from_secs(5);

/// Raster slides pre-generate levels 0 through this one during P0; deeper
/// levels are deferred to a P1 job.
const PREGEN_MAX_LEVEL: u32 = 4;

#[derive(Clone)]
pub struct WorkerDeps {
    pub pool: Pool,
    pub queue: JobQueue,
    pub bus: EventBus,
    pub toolchain: Arc<dyn Toolchain>,
    pub store: Option<Arc<dyn ObjectStore>>,
    pub derived_dir: PathBuf,
    pub preview: Option<PreviewConfig>,
}

impl WorkerDeps {
    fn slide_dir(&self, slide_id: &str) -> PathBuf {
        self.derived_dir.join(slide_id)
    }
}

/// Single consumer loop over the job queue. Individual job failures are
/// recorded on the job and the slide; the loop itself never exits except
/// on shutdown.
pub async fn run_worker(deps: WorkerDeps, cancel: CancellationToken) -> Result<()> {
    tracing::info!("worker dispatcher started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("worker dispatcher stopping");
                return Ok(());
            }
            popped = deps.queue.pop(POP_TIMEOUT) => {
                let payload = match popped {
                    Ok(Some(payload)) => payload,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!(error = ?e, "queue pop failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                handle_payload(&deps, payload).await;
            }
        }
    }
}

async fn handle_payload(deps: &WorkerDeps, payload: JobPayload) {
    let job_id = payload.job_id;
    let slide_id = payload.slide_id.clone();
    let job_type = payload.job_type;

    tracing::info!(job_id = %job_id, slide_id = %slide_id, job_type = %job_type, "job started");

    // Preflight: jobs that read the raw file fail fast when it is gone.
    // No events go out for this case; there is nothing downstream to react to.
    if job_type.needs_raw_file()
        && !tokio::fs::try_exists(&payload.raw_path).await.unwrap_or(false)
    {
        let msg = format!("raw file missing: {}", payload.raw_path);
        tracing::error!(job_id = %job_id, slide_id = %slide_id, "{}", msg);
        record_failure(deps, job_id, &slide_id, job_type, &msg, false).await;
        return;
    }

    if let Err(e) = start_job(deps, job_id, &slide_id, job_type).await {
        tracing::error!(job_id = %job_id, error = ?e, "failed to mark job running");
        return;
    }

    let result = match job_type {
        JobType::P0 => run_p0(deps, &payload).await,
        JobType::P1 => run_p1(deps, &payload).await,
        JobType::Tilegen => run_tilegen(deps, &payload).await,
        JobType::Preview => run_preview(deps, &payload).await,
        JobType::Cleanup => run_cleanup(deps, &payload).await,
    };

    match result {
        Ok(()) => {
            if let Err(e) = db::transition_job(&deps.pool, job_id, JobStatus::Done, None).await {
                tracing::error!(job_id = %job_id, error = ?e, "failed to mark job done");
            }
            tracing::info!(job_id = %job_id, slide_id = %slide_id, job_type = %job_type, "job done");
        }
        Err(e) => {
            let msg = format!("{e:#}");
            tracing::error!(job_id = %job_id, slide_id = %slide_id, job_type = %job_type, error = %msg, "job failed");
            record_failure(deps, job_id, &slide_id, job_type, &msg, true).await;
        }
    }
}

/// Job running + slide phase status. Preview and cleanup run after the
/// slide is ready and leave its status alone.
async fn start_job(
    deps: &WorkerDeps,
    job_id: Uuid,
    slide_id: &str,
    job_type: JobType,
) -> Result<()> {
    db::transition_job(&deps.pool, job_id, JobStatus::Running, None).await?;

    let phase = match job_type {
        JobType::P0 | JobType::P1 => Some(SlideStatus::Processing),
        JobType::Tilegen => Some(SlideStatus::Tilegen),
        JobType::Preview | JobType::Cleanup => None,
    };
    if let Some(status) = phase {
        db::update_slide(
            &deps.pool,
            slide_id,
            &SlideUpdate {
                status: Some(status),
                ..Default::default()
            },
        )
        .await?;
    }
    Ok(())
}

async fn record_failure(
    deps: &WorkerDeps,
    job_id: Uuid,
    slide_id: &str,
    job_type: JobType,
    msg: &str,
    emit: bool,
) {
    if let Err(e) = db::transition_job(&deps.pool, job_id, JobStatus::Failed, Some(msg)).await {
        tracing::error!(job_id = %job_id, error = ?e, "failed to mark job failed");
    }
    let mut update = SlideUpdate {
        status: Some(SlideStatus::Failed),
        ..Default::default()
    };
    if job_type == JobType::Tilegen {
        update.tilegen_status = Some(TilegenStatus::Failed);
    }
    if let Err(e) = db::update_slide(&deps.pool, slide_id, &update).await {
        tracing::error!(slide_id = %slide_id, error = ?e, "failed to mark slide failed");
    }
    if emit {
        deps.bus.emit(
            kinds::JOB_FAILED,
            serde_json::json!({
                "slide_id": slide_id,
                "job_type": job_type,
                "error": msg,
            }),
        );
    }
}

async fn require_slide(pool: &Pool, slide_id: &str) -> Result<Slide> {
    db::get_slide(pool, slide_id)
        .await?
        .with_context(|| format!("slide {slide_id} not found"))
}

/// Chain a follow-up job, pushing its payload onto the queue. Also used by
/// the HTTP surface for manual retry, preview and cleanup triggers.
pub(crate) async fn chain_job(
    deps: &WorkerDeps,
    slide: &Slide,
    job_type: JobType,
    start_level: Option<u32>,
) -> Result<bool> {
    let queue = deps.queue.clone();
    let template = JobPayload {
        job_id: Uuid::nil(),
        slide_id: slide.id.clone(),
        job_type,
        raw_path: slide.raw_path.clone(),
        format: slide.format,
        start_level,
    };
    let outcome = db::create_and_enqueue(&deps.pool, &slide.id, job_type, |job_id| {
        let mut payload = template.clone();
        payload.job_id = job_id;
        let queue = queue.clone();
        async move { queue.push(&payload).await }
    })
    .await?;

    match outcome {
        EnqueueOutcome::Enqueued(job_id) => {
            tracing::info!(slide_id = %slide.id, job_type = %job_type, job_id = %job_id, "chained job");
            Ok(true)
        }
        EnqueueOutcome::Skipped => {
            tracing::debug!(slide_id = %slide.id, job_type = %job_type, "follow-up already active");
            Ok(false)
        }
        EnqueueOutcome::PublishFailed => bail!("failed to enqueue {job_type} job"),
    }
}

async fn write_manifest(slide_dir: &Path, manifest: &LocalManifest) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest).context("failed to serialize manifest")?;
    tokio::fs::write(slide_dir.join("manifest.json"), json)
        .await
        .context("failed to write manifest")?;
    Ok(())
}

/// P0: extract metadata, write thumbnail and manifest; raster slides also
/// pre-generate the first levels, WSI slides defer tiles to TILEGEN.
async fn run_p0(deps: &WorkerDeps, payload: &JobPayload) -> Result<()> {
    let slide = require_slide(&deps.pool, &payload.slide_id).await?;
    let slide_dir = deps.slide_dir(&slide.id);
    tokio::fs::create_dir_all(&slide_dir)
        .await
        .context("failed to create slide dir")?;
    let raw_path = Path::new(&payload.raw_path);

    if payload.format.is_wsi() {
        let props = deps
            .toolchain
            .read_properties(raw_path)
            .await
            .context("failed to read slide properties")?;
        deps.toolchain
            .write_thumbnail(raw_path, &slide_dir.join("thumb.jpg"), 640, 400)
            .await
            .context("failed to write thumbnail")?;

        let max_level = max_level_for(props.width, props.height);
        let manifest = LocalManifest::new(
            &slide.id,
            props.width,
            props.height,
            true,
            props.app_mag,
            props.mpp,
        );
        write_manifest(&slide_dir, &manifest).await?;

        db::update_slide(
            &deps.pool,
            &slide.id,
            &SlideUpdate {
                status: Some(SlideStatus::Ready),
                width: Some(props.width as i32),
                height: Some(props.height as i32),
                max_level: Some(max_level as i32),
                app_mag: Some(props.app_mag),
                mpp: Some(props.mpp),
                ..Default::default()
            },
        )
        .await?;

        let slide = require_slide(&deps.pool, &slide.id).await?;
        if chain_job(deps, &slide, JobType::Tilegen, None).await? {
            db::update_slide(
                &deps.pool,
                &slide.id,
                &SlideUpdate {
                    tilegen_status: Some(TilegenStatus::Queued),
                    ..Default::default()
                },
            )
            .await?;
        }

        deps.bus.emit(
            kinds::SLIDE_READY,
            serde_json::json!({
                "slide_id": slide.id,
                "width": props.width,
                "height": props.height,
                "max_level": max_level,
                "format": payload.format,
            }),
        );
    } else {
        let img = {
            let raw_path = raw_path.to_path_buf();
            Arc::new(
                tokio::task::spawn_blocking(move || raster::load_image(&raw_path))
                    .await
                    .context("image decode task panicked")??,
            )
        };
        let (width, height) = (img.width(), img.height());
        let max_level = max_level_for(width, height);
        let pregen_max = PREGEN_MAX_LEVEL.min(max_level);

        {
            let img = img.clone();
            let dest = slide_dir.join("thumb.jpg");
            tokio::task::spawn_blocking(move || raster::write_thumbnail(&img, &dest, 640, 400))
                .await
                .context("thumbnail task panicked")??;
        }

        let manifest = LocalManifest::new(&slide.id, width, height, false, None, None);
        write_manifest(&slide_dir, &manifest).await?;

        let tiles_dir = slide_dir.join("tiles");
        for level in 0..=pregen_max {
            let img = img.clone();
            let tiles_dir = tiles_dir.clone();
            tokio::task::spawn_blocking(move || {
                raster::generate_level_tiles(&img, max_level, level, &tiles_dir)
            })
            .await
            .context("tile generation task panicked")??;
        }

        db::update_slide(
            &deps.pool,
            &slide.id,
            &SlideUpdate {
                status: Some(SlideStatus::Ready),
                width: Some(width as i32),
                height: Some(height as i32),
                max_level: Some(max_level as i32),
                level_ready_max: Some(pregen_max as i32),
                ..Default::default()
            },
        )
        .await?;

        let slide = require_slide(&deps.pool, &slide.id).await?;
        if max_level > PREGEN_MAX_LEVEL {
            chain_job(deps, &slide, JobType::P1, Some(PREGEN_MAX_LEVEL + 1)).await?;
        }

        deps.bus.emit(
            kinds::SLIDE_READY,
            serde_json::json!({
                "slide_id": slide.id,
                "width": width,
                "height": height,
                "max_level": max_level,
                "format": payload.format,
            }),
        );
    }

    // Preview publish is chained, never awaited: P0 success does not
    // depend on the remote side
    if deps.preview.is_some() && !payload.format.is_wsi() {
        let slide = require_slide(&deps.pool, &payload.slide_id).await?;
        chain_job(deps, &slide, JobType::Preview, None).await?;
    }

    Ok(())
}

/// P1: continue pre-generating raster tiles for the deferred levels.
async fn run_p1(deps: &WorkerDeps, payload: &JobPayload) -> Result<()> {
    let slide = require_slide(&deps.pool, &payload.slide_id).await?;
    let start_level = payload.start_level.unwrap_or(PREGEN_MAX_LEVEL + 1);
    let max_level = slide.max_level.max(0) as u32;
    if start_level > max_level {
        return Ok(());
    }

    let raw_path = PathBuf::from(&payload.raw_path);
    let img = Arc::new(
        tokio::task::spawn_blocking(move || raster::load_image(&raw_path))
            .await
            .context("image decode task panicked")??,
    );

    let tiles_dir = deps.slide_dir(&slide.id).join("tiles");
    for level in start_level..=max_level {
        let img = img.clone();
        let tiles_dir = tiles_dir.clone();
        tokio::task::spawn_blocking(move || {
            raster::generate_level_tiles(&img, max_level, level, &tiles_dir)
        })
        .await
        .context("tile generation task panicked")??;

        db::update_slide(
            &deps.pool,
            &slide.id,
            &SlideUpdate {
                level_ready_max: Some(level as i32),
                ..Default::default()
            },
        )
        .await?;
    }

    db::update_slide(
        &deps.pool,
        &slide.id,
        &SlideUpdate {
            status: Some(SlideStatus::Ready),
            ..Default::default()
        },
    )
    .await?;

    Ok(())
}

/// TILEGEN: build the full pyramid and swap it in, then let the outside
/// world know the slide is navigable.
async fn run_tilegen(deps: &WorkerDeps, payload: &JobPayload) -> Result<()> {
    let slide = require_slide(&deps.pool, &payload.slide_id).await?;
    let slide_dir = deps.slide_dir(&slide.id);

    db::update_slide(
        &deps.pool,
        &slide.id,
        &SlideUpdate {
            tilegen_status: Some(TilegenStatus::Running),
            ..Default::default()
        },
    )
    .await?;

    tilegen::build_full_pyramid(deps.toolchain.as_ref(), Path::new(&payload.raw_path), &slide_dir)
        .await?;

    db::update_slide(
        &deps.pool,
        &slide.id,
        &SlideUpdate {
            status: Some(SlideStatus::Ready),
            tilegen_status: Some(TilegenStatus::Done),
            level_ready_max: Some(slide.max_level),
            ..Default::default()
        },
    )
    .await?;

    deps.bus.emit(
        kinds::TILES_READY,
        serde_json::json!({ "slide_id": slide.id }),
    );

    // External consumers only hear about a slide once it is navigable
    let registered = serde_json::json!({
        "slide_id": slide.id,
        "svs_filename": slide.original_filename,
        "width": slide.width,
        "height": slide.height,
        "mpp": slide.mpp,
        "external_case_id": slide.external_case_id,
        "external_case_base": slide.external_case_base,
        "external_slide_label": slide.external_slide_label,
    });
    db::append_outbox(&deps.pool, "slide", &slide.id, "slide.registered", &registered)
        .await
        .context("failed to append slide.registered outbox event")?;

    if deps.preview.is_some() {
        chain_job(deps, &slide, JobType::Preview, None).await?;
    }

    Ok(())
}

async fn run_preview(deps: &WorkerDeps, payload: &JobPayload) -> Result<()> {
    let Some(cfg) = deps.preview.as_ref() else {
        bail!("preview publish requested but remote preview is not configured");
    };
    let Some(store) = deps.store.as_ref() else {
        bail!("preview publish requested but object store is not configured");
    };

    let slide = require_slide(&deps.pool, &payload.slide_id).await?;
    let outcome = preview::publish_preview(
        Some(&deps.pool),
        store.as_ref(),
        deps.toolchain.as_ref(),
        &deps.bus,
        cfg,
        &slide,
        &deps.derived_dir,
    )
    .await?;

    if outcome.skipped {
        tracing::info!(
            slide_id = %slide.id,
            reason = outcome.reason.as_deref().unwrap_or(""),
            "preview publish skipped"
        );
    }
    Ok(())
}

/// CLEANUP: delete the remote preview artefacts of a removed slide.
async fn run_cleanup(deps: &WorkerDeps, payload: &JobPayload) -> Result<()> {
    let Some(store) = deps.store.as_ref() else {
        tracing::info!(slide_id = %payload.slide_id, "no object store configured, nothing to clean");
        return Ok(());
    };
    let Some(cfg) = deps.preview.as_ref() else {
        return Ok(());
    };

    let prefix = format!("{}/{}/", cfg.prefix, payload.slide_id);
    let deleted = store
        .delete_prefix(&prefix)
        .await
        .map_err(|e| anyhow::anyhow!("failed to delete remote prefix {prefix}: {e}"))?;

    tracing::info!(slide_id = %payload.slide_id, deleted = deleted, "remote cleanup complete");
    deps.bus.emit(
        kinds::CLEANUP_COMPLETE,
        serde_json::json!({ "slide_id": payload.slide_id, "deleted": deleted }),
    );
    Ok(())
}
