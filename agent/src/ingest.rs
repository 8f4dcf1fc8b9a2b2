use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use deadpool_postgres::Pool;
use notify::event::{CreateKind, ModifyKind};
use notify::{EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orcein_common::events::{EventBus, kinds};
use orcein_common::types::{JobPayload, JobType, SlideFormat};

use crate::db::{self, EnqueueOutcome};
use crate::filename::parse_case_filename;
use crate::hash::sha256_file;
use crate::health::{ComponentState, HealthState};
use crate::models::SlideUpdate;
use crate::queue::JobQueue;

/// Files at or above this size get the full stable window re-stat.
const LARGE_WSI_BYTES: u64 = 100 * 1024 * 1024;

/// Shared dependencies for both ingest producers.
#[derive(Clone)]
pub struct IngestDeps {
    pub pool: Pool,
    pub queue: JobQueue,
    pub bus: EventBus,
    pub raw_dir: PathBuf,
    pub ingest_dir: PathBuf,
    pub stable: Duration,
    pub health: Arc<HealthState>,
}

/// Everything the registry needs to know about a newly sighted slide.
pub struct SlideRegistration {
    pub slide_id: String,
    pub original_filename: String,
    pub raw_path: String,
    pub format: SlideFormat,
    pub file_size: i64,
    pub barcode: Option<String>,
    pub dsmeta_path: Option<String>,
    pub ocr_pending: bool,
}

/// How long to wait before the first stat of a candidate. WSI scans take
/// minutes to write; plain images settle fast.
pub fn initial_wait(stable: Duration, format: SlideFormat) -> Duration {
    if format.is_wsi() { stable / 2 } else { stable / 4 }
}

/// Delete orphaned `.ingest-*.tmp` files left by a crashed commit.
pub async fn cleanup_stale_tmp(raw_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(raw_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).context("failed to read raw dir"),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(".ingest-") && name.ends_with(".tmp") {
            tokio::fs::remove_file(entry.path())
                .await
                .with_context(|| format!("failed to remove {}", entry.path().display()))?;
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(count = removed, "removed stale ingest temp files");
    }
    Ok(removed)
}

/// Copy a source file into content-addressed raw storage.
///
/// The destination is `raw/{slide_id}_{original_filename}`. A matching
/// destination of identical size short-circuits (re-scan of known
/// content). Otherwise the file is copied to a unique temp name, its size
/// verified against the source and the temp renamed into place, which
/// together make the commit safe across devices and crashes. Returns the
/// destination and whether a copy actually happened.
pub async fn commit_to_raw(
    raw_dir: &Path,
    src: &Path,
    slide_id: &str,
    original_filename: &str,
) -> Result<(PathBuf, bool)> {
    tokio::fs::create_dir_all(raw_dir)
        .await
        .context("failed to create raw dir")?;

    let dest = raw_dir.join(format!("{slide_id}_{original_filename}"));
    let src_size = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("failed to stat source {}", src.display()))?
        .len();

    if let Ok(existing) = tokio::fs::metadata(&dest).await
        && existing.len() == src_size
    {
        tracing::debug!(dest = %dest.display(), "raw copy already present, skipping commit");
        return Ok((dest, false));
    }

    let tmp = raw_dir.join(format!(".ingest-{}.tmp", Uuid::new_v4()));
    tokio::fs::copy(src, &tmp)
        .await
        .with_context(|| format!("failed to copy {} into raw", src.display()))?;

    let copied_size = tokio::fs::metadata(&tmp)
        .await
        .context("failed to stat copied temp file")?
        .len();
    if copied_size != src_size {
        let _ = tokio::fs::remove_file(&tmp).await;
        bail!(
            "size mismatch committing {}: source {} bytes, copy {} bytes",
            src.display(),
            src_size,
            copied_size
        );
    }

    tokio::fs::rename(&tmp, &dest)
        .await
        .context("failed to rename temp into raw")?;

    Ok((dest, true))
}

/// Upsert the slide, attach whatever identity we can parse, enqueue P0 and
/// announce the import. Shared by the inbox watcher and the scanner.
///
/// Content already processed to `ready` is deduplicated: the row keeps its
/// state (latest filename and path win) and no new P0 goes out.
pub async fn register_and_enqueue(deps: &IngestDeps, reg: SlideRegistration) -> Result<()> {
    let prior = db::get_slide(&deps.pool, &reg.slide_id).await?;
    if let Some(prior) = prior
        && prior.status == orcein_common::types::SlideStatus::Ready
    {
        tracing::info!(
            slide_id = %reg.slide_id,
            filename = %reg.original_filename,
            "content already processed, updating identity only"
        );
        db::update_slide_identity(
            &deps.pool,
            &reg.slide_id,
            &reg.original_filename,
            &reg.raw_path,
            reg.file_size,
        )
        .await?;
        deps.bus.emit(
            kinds::SLIDE_IMPORT,
            serde_json::json!({
                "slide_id": reg.slide_id,
                "original_filename": reg.original_filename,
                "format": reg.format,
                "deduplicated": true,
            }),
        );
        return Ok(());
    }

    let slide = db::upsert_slide(
        &deps.pool,
        &reg.slide_id,
        &reg.original_filename,
        &reg.raw_path,
        reg.format,
        reg.file_size,
    )
    .await?;

    let case = parse_case_filename(&reg.original_filename);
    let mut update = SlideUpdate::default();
    if let Some(case) = case {
        update.external_case_id = Some(Some(case.external_case_id));
        update.external_case_base = Some(Some(case.case_base));
        update.external_slide_label = Some(Some(case.label));
    }
    if let Some(barcode) = reg.barcode {
        update.barcode = Some(Some(barcode));
    }
    if let Some(dsmeta) = reg.dsmeta_path {
        update.dsmeta_path = Some(Some(dsmeta));
    }
    if reg.ocr_pending {
        update.ocr_status = Some(orcein_common::types::OcrStatus::Pending);
    }
    if !update.is_empty() {
        db::update_slide(&deps.pool, &reg.slide_id, &update).await?;
    }

    let payload = JobPayload {
        job_id: Uuid::nil(), // patched below with the real id
        slide_id: reg.slide_id.clone(),
        job_type: JobType::P0,
        raw_path: reg.raw_path.clone(),
        format: reg.format,
        start_level: None,
    };
    let queue = deps.queue.clone();
    let outcome = db::create_and_enqueue(&deps.pool, &reg.slide_id, JobType::P0, |job_id| {
        let mut payload = payload.clone();
        payload.job_id = job_id;
        let queue = queue.clone();
        async move { queue.push(&payload).await }
    })
    .await?;

    match outcome {
        EnqueueOutcome::Enqueued(job_id) => {
            tracing::info!(slide_id = %reg.slide_id, job_id = %job_id, "enqueued P0");
        }
        EnqueueOutcome::Skipped => {
            tracing::info!(slide_id = %reg.slide_id, "P0 already active, not re-enqueuing");
        }
        EnqueueOutcome::PublishFailed => {
            bail!("failed to enqueue P0 for slide {}", reg.slide_id);
        }
    }

    deps.bus.emit(
        kinds::SLIDE_IMPORT,
        serde_json::json!({
            "slide_id": slide.id,
            "original_filename": slide.original_filename,
            "format": slide.format,
        }),
    );

    Ok(())
}

/// Watch the inbox for new slide files and drive each through the
/// stable-size check, the raw commit and registration.
pub async fn run_inbox_watcher(deps: IngestDeps, cancel: CancellationToken) -> Result<()> {
    let health = deps.health.clone();
    match watch_loop(deps, cancel).await {
        Ok(()) => Ok(()),
        Err(e) => {
            health.set_watcher(ComponentState::Error(format!("{e:#}")));
            Err(e)
        }
    }
}

async fn watch_loop(deps: IngestDeps, cancel: CancellationToken) -> Result<()> {
    cleanup_stale_tmp(&deps.raw_dir).await?;
    tokio::fs::create_dir_all(&deps.ingest_dir)
        .await
        .context("failed to create ingest dir")?;

    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

    // Bridge notify's sync callback into the async loop
    let watcher_tx = tx.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(CreateKind::File)
                        | EventKind::Create(CreateKind::Any)
                        | EventKind::Modify(ModifyKind::Name(_))
                );
                if relevant {
                    for path in event.paths {
                        watcher_tx.send(path).ok();
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "inbox watch error"),
        }
    })
    .context("failed to create inbox watcher")?;
    watcher
        .watch(&deps.ingest_dir, RecursiveMode::NonRecursive)
        .context("failed to watch ingest dir")?;

    deps.health.set_watcher(ComponentState::Running);
    tracing::info!(dir = %deps.ingest_dir.display(), "inbox watcher started");

    // Pick up anything already sitting in the inbox
    let mut entries = tokio::fs::read_dir(&deps.ingest_dir)
        .await
        .context("failed to read ingest dir")?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            tx.send(entry.path()).ok();
        }
    }

    let in_flight: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("inbox watcher stopping");
                break;
            }
            path = rx.recv() => {
                let Some(path) = path else { break };
                if SlideFormat::from_path(&path) == SlideFormat::Unknown {
                    continue; // unsupported extensions are ignored silently
                }
                if !in_flight.lock().insert(path.clone()) {
                    continue; // duplicate create/rename events for one file
                }

                let deps = deps.clone();
                let tx = tx.clone();
                let in_flight = in_flight.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        () = cancel.cancelled() => Ok(()),
                        r = process_candidate(&deps, &path, &tx) => r,
                    };
                    in_flight.lock().remove(&path);
                    if let Err(e) = result {
                        // Leave the source in place so the file can be retried
                        tracing::error!(path = %path.display(), error = ?e, "ingest failed");
                    }
                });
            }
        }
    }

    drop(watcher);
    Ok(())
}

/// Stable-size check, then commit and register. Re-schedules itself via
/// `tx` when the file is still growing.
async fn process_candidate(
    deps: &IngestDeps,
    path: &Path,
    tx: &mpsc::UnboundedSender<PathBuf>,
) -> Result<()> {
    let format = SlideFormat::from_path(path);

    tokio::time::sleep(initial_wait(deps.stable, format)).await;

    let Ok(meta) = tokio::fs::metadata(path).await else {
        tracing::debug!(path = %path.display(), "candidate vanished before ingest");
        return Ok(());
    };
    let size = meta.len();
    if size == 0 {
        tracing::debug!(path = %path.display(), "skipping empty file");
        return Ok(());
    }

    if format.is_wsi() && size >= LARGE_WSI_BYTES {
        tokio::time::sleep(deps.stable).await;
        let second = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to re-stat {}", path.display()))?
            .len();
        if second != size {
            tracing::info!(
                path = %path.display(),
                first = size,
                second = second,
                "file still growing, rescheduling"
            );
            let tx = tx.clone();
            let path = path.to_path_buf();
            let stable = deps.stable;
            tokio::spawn(async move {
                tokio::time::sleep(stable).await;
                tx.send(path).ok();
            });
            return Ok(());
        }
    }

    let original_filename = path
        .file_name()
        .and_then(|s| s.to_str())
        .map(String::from)
        .unwrap_or_else(|| "upload".to_string());

    let slide_id = sha256_file(path).await?;
    tracing::info!(slide_id = %slide_id, path = %path.display(), "ingesting slide");

    let (dest, committed) = commit_to_raw(&deps.raw_dir, path, &slide_id, &original_filename).await?;
    let file_size = tokio::fs::metadata(&dest)
        .await
        .context("failed to stat committed file")?
        .len() as i64;

    register_and_enqueue(
        deps,
        SlideRegistration {
            slide_id: slide_id.clone(),
            original_filename,
            raw_path: dest.display().to_string(),
            format,
            file_size,
            barcode: None,
            dsmeta_path: None,
            ocr_pending: false,
        },
    )
    .await?;

    // Only after a successful commit does the inbox copy go away
    tokio::fs::remove_file(path)
        .await
        .with_context(|| format!("failed to remove inbox file {}", path.display()))?;

    tracing::info!(slide_id = %slide_id, committed = committed, "slide ingested");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_copies_verifies_and_renames() {
        let inbox = tempfile::tempdir().unwrap();
        let raw = tempfile::tempdir().unwrap();
        let src = inbox.path().join("sample.jpg");
        tokio::fs::write(&src, vec![7u8; 4096]).await.unwrap();

        let (dest, committed) = commit_to_raw(raw.path(), &src, &"ab".repeat(32), "sample.jpg")
            .await
            .unwrap();

        assert!(committed);
        assert_eq!(
            dest.file_name().unwrap().to_str().unwrap(),
            format!("{}_sample.jpg", "ab".repeat(32))
        );
        assert_eq!(tokio::fs::metadata(&dest).await.unwrap().len(), 4096);
        // Source is untouched; deleting it is the caller's last step
        assert!(src.exists());
        // No temp file remains
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(raw.path()).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn commit_skips_when_destination_matches() {
        let inbox = tempfile::tempdir().unwrap();
        let raw = tempfile::tempdir().unwrap();
        let src = inbox.path().join("sample.jpg");
        tokio::fs::write(&src, b"same-bytes").await.unwrap();

        let id = "cd".repeat(32);
        let dest = raw.path().join(format!("{id}_sample.jpg"));
        tokio::fs::write(&dest, b"same-bytes").await.unwrap();

        let (got, committed) = commit_to_raw(raw.path(), &src, &id, "sample.jpg")
            .await
            .unwrap();
        assert_eq!(got, dest);
        assert!(!committed);
    }

    #[tokio::test]
    async fn commit_replaces_size_mismatched_destination() {
        let inbox = tempfile::tempdir().unwrap();
        let raw = tempfile::tempdir().unwrap();
        let src = inbox.path().join("sample.jpg");
        tokio::fs::write(&src, b"newer longer contents").await.unwrap();

        let id = "ee".repeat(32);
        let dest = raw.path().join(format!("{id}_sample.jpg"));
        tokio::fs::write(&dest, b"short").await.unwrap();

        let (_, committed) = commit_to_raw(raw.path(), &src, &id, "sample.jpg")
            .await
            .unwrap();
        assert!(committed);
        assert_eq!(
            tokio::fs::read(&dest).await.unwrap(),
            b"newer longer contents"
        );
    }

    #[tokio::test]
    async fn cleanup_removes_only_ingest_temps() {
        let raw = tempfile::tempdir().unwrap();
        tokio::fs::write(raw.path().join(".ingest-abc.tmp"), b"x")
            .await
            .unwrap();
        tokio::fs::write(raw.path().join(".ingest-def.tmp"), b"y")
            .await
            .unwrap();
        tokio::fs::write(raw.path().join("keep_me.svs"), b"z")
            .await
            .unwrap();

        let removed = cleanup_stale_tmp(raw.path()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(raw.path().join("keep_me.svs").exists());
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_dir() {
        let removed = cleanup_stale_tmp(Path::new("/nonexistent/raw")).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn initial_wait_is_shorter_for_images() {
        let stable = Duration::from_secs(10);
        assert!(initial_wait(stable, SlideFormat::Jpg) < initial_wait(stable, SlideFormat::Svs));
        assert_eq!(initial_wait(stable, SlideFormat::Svs), Duration::from_secs(5));
    }
}
