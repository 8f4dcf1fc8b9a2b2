use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use deadpool_postgres::Pool;
use sha2::{Digest, Sha256};

use orcein_common::events::{EventBus, kinds};
use orcein_common::now_ms;
use orcein_common::types::{TILE_SIZE, max_level_for};

use crate::db;
use crate::models::{MarkerStatus, PreviewMarker, RemoteManifest, Slide, StorageInfo};
use crate::store::{ObjectStore, PutRequest, put_many, put_with_retry};
use crate::vips::Toolchain;

const MARKER_FILE: &str = "preview_published.json";

#[derive(Debug, Clone)]
pub struct PreviewConfig {
    pub target_max_dim: u32,
    pub requested_max_level: u32,
    pub upload_concurrency: usize,
    pub prefix: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub published: bool,
    pub skipped: bool,
    pub reason: Option<String>,
    pub tiles_uploaded: usize,
}

impl PublishOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            published: false,
            skipped: true,
            reason: Some(reason.to_string()),
            tiles_uploaded: 0,
        }
    }
}

/// Scale the original dimensions so the longest side is `target_max_dim`.
/// Never upscales: images already small enough keep their size.
pub fn rebased_dims(width: u32, height: u32, target_max_dim: u32) -> (u32, u32) {
    let scale = f64::from(width.max(height)) / f64::from(target_max_dim.max(1));
    if scale <= 1.0 {
        return (width, height);
    }
    (
        (f64::from(width) / scale).round().max(1.0) as u32,
        (f64::from(height) / scale).round().max(1.0) as u32,
    )
}

/// The preview pyramid never goes deeper than the rebased image supports.
pub fn rebased_max_level(requested: u32, rebased_w: u32, rebased_h: u32) -> u32 {
    requested.min(max_level_for(rebased_w, rebased_h))
}

/// The deep-zoom saver numbers levels 0 (1x1) up to `native_max` (base
/// size); viewer level `z` of a pyramid capped at `max_level` maps to the
/// saver level `native_max - max_level + z`.
pub fn saver_level_for(native_max: u32, max_level: u32, z: u32) -> u32 {
    native_max - max_level + z
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Sorted `{z}/{filename}` listing of the staged preview tiles. Stable
/// across runs, so its hash detects any change to the tile set.
pub fn tiles_index(preview_tiles_dir: &Path) -> Result<String> {
    let mut entries: Vec<String> = Vec::new();
    for level_entry in std::fs::read_dir(preview_tiles_dir)
        .with_context(|| format!("failed to read {}", preview_tiles_dir.display()))?
    {
        let level_entry = level_entry?;
        if !level_entry.path().is_dir() {
            continue;
        }
        let level_name = level_entry.file_name().to_string_lossy().into_owned();
        for tile_entry in std::fs::read_dir(level_entry.path())? {
            let name = tile_entry?.file_name().to_string_lossy().into_owned();
            entries.push(format!("{level_name}/{name}"));
        }
    }
    entries.sort();
    Ok(entries.join("\n"))
}

pub async fn load_marker(slide_dir: &Path) -> Option<PreviewMarker> {
    let raw = tokio::fs::read(slide_dir.join(MARKER_FILE)).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(marker) => Some(marker),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable preview marker, treating as absent");
            None
        }
    }
}

pub async fn write_marker(slide_dir: &Path, marker: &PreviewMarker) -> Result<()> {
    let json = serde_json::to_vec_pretty(marker).context("failed to serialize marker")?;
    tokio::fs::write(slide_dir.join(MARKER_FILE), json)
        .await
        .context("failed to write preview marker")?;
    Ok(())
}

/// A completed marker with matching shape and content hashes means the
/// remote copy is current and the publish can be skipped.
pub fn marker_is_current(
    marker: &PreviewMarker,
    max_level: u32,
    target_max_dim: u32,
    thumb_hash: &str,
    manifest_hash: &str,
    tiles_hash: &str,
) -> bool {
    marker.status == MarkerStatus::Complete
        && marker.max_level == max_level
        && marker.target_max_dim == target_max_dim
        && marker.thumb_hash.as_deref() == Some(thumb_hash)
        && marker.manifest_hash.as_deref() == Some(manifest_hash)
        && marker.tiles_hash.as_deref() == Some(tiles_hash)
}

/// Result of staging the local rebased pyramid.
#[derive(Debug)]
pub struct StagedPreview {
    pub rebased_w: u32,
    pub rebased_h: u32,
    pub max_level: u32,
    pub tiles_dir: PathBuf,
}

/// Downscale the slide to the rebased base image, run the deep-zoom saver
/// over it and renumber the kept levels into `preview_tiles/{z}/`.
pub async fn stage_local_preview(
    toolchain: &dyn Toolchain,
    raw_path: &Path,
    slide_dir: &Path,
    width: u32,
    height: u32,
    cfg: &PreviewConfig,
) -> Result<StagedPreview> {
    let (rebased_w, rebased_h) = rebased_dims(width, height, cfg.target_max_dim);
    let max_level = rebased_max_level(cfg.requested_max_level, rebased_w, rebased_h);

    tokio::fs::create_dir_all(slide_dir)
        .await
        .context("failed to create slide dir")?;

    let base = slide_dir.join("preview_base.jpg");
    toolchain
        .downscale(raw_path, &base, rebased_w, rebased_h)
        .await
        .context("failed to build rebased base image")?;

    let dz_tmp = slide_dir.join("preview_dz_tmp");
    let result = stage_tiles(toolchain, &base, &dz_tmp, slide_dir, rebased_w, rebased_h, max_level).await;

    // Temp artefacts go regardless of success
    let _ = tokio::fs::remove_file(&base).await;
    let _ = tokio::fs::remove_dir_all(&dz_tmp).await;

    let tiles_dir = result?;
    Ok(StagedPreview {
        rebased_w,
        rebased_h,
        max_level,
        tiles_dir,
    })
}

async fn stage_tiles(
    toolchain: &dyn Toolchain,
    base: &Path,
    dz_tmp: &Path,
    slide_dir: &Path,
    rebased_w: u32,
    rebased_h: u32,
    max_level: u32,
) -> Result<PathBuf> {
    toolchain
        .build_pyramid(base, dz_tmp)
        .await
        .context("deep-zoom build of preview base failed")?;

    let native_max = max_level_for(rebased_w, rebased_h);

    let tiles_dir = slide_dir.join("preview_tiles");
    if tokio::fs::try_exists(&tiles_dir).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&tiles_dir)
            .await
            .context("failed to clear stale preview_tiles")?;
    }
    tokio::fs::create_dir_all(&tiles_dir)
        .await
        .context("failed to create preview_tiles")?;

    for z in 0..=max_level {
        let saver_level = saver_level_for(native_max, max_level, z);
        let src = dz_tmp.join(saver_level.to_string());
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            bail!(
                "deep-zoom output missing level {} (mapped from viewer level {})",
                saver_level,
                z
            );
        }
        tokio::fs::rename(&src, tiles_dir.join(z.to_string()))
            .await
            .with_context(|| format!("failed to move preview level {z}"))?;
    }

    Ok(tiles_dir)
}

fn build_remote_manifest(slide: &Slide, staged: &StagedPreview, cfg: &PreviewConfig) -> RemoteManifest {
    RemoteManifest {
        protocol: "dzi".to_string(),
        tile_size: TILE_SIZE,
        overlap: 0,
        format: "jpg".to_string(),
        width: staged.rebased_w,
        height: staged.rebased_h,
        level_min: 0,
        level_max: staged.max_level,
        original_width: slide.width.max(0) as u32,
        original_height: slide.height.max(0) as u32,
        original_level_max: slide.max_level.max(0) as u32,
        storage: StorageInfo {
            provider: "s3".to_string(),
            bucket: cfg.bucket.clone(),
            region: cfg.region.clone(),
            endpoint: cfg.endpoint.clone(),
            prefix: cfg.prefix.clone(),
        },
        tiles_prefix: format!("{}/{}/tiles", cfg.prefix, slide.id),
        tile_path_pattern: "tiles/{z}/{x}_{y}.jpg".to_string(),
        on_demand: false,
        app_mag: slide.app_mag,
        mpp: slide.mpp,
    }
}

/// Publish the rebased preview pyramid for a slide to object storage.
///
/// Idempotent: when the publication marker shows a completed publish of the
/// same content, nothing is uploaded and the outcome says `skipped`. Any
/// failure rewrites the marker as `incomplete` so the next run retries.
pub async fn publish_preview(
    pool: Option<&Pool>,
    store: &dyn ObjectStore,
    toolchain: &dyn Toolchain,
    bus: &EventBus,
    cfg: &PreviewConfig,
    slide: &Slide,
    derived_dir: &Path,
) -> Result<PublishOutcome> {
    let slide_dir = derived_dir.join(&slide.id);

    if slide.width <= 0 || slide.height <= 0 {
        bail!("slide {} has no dimensions yet", slide.id);
    }

    let staged = stage_local_preview(
        toolchain,
        Path::new(&slide.raw_path),
        &slide_dir,
        slide.width as u32,
        slide.height as u32,
        cfg,
    )
    .await?;

    // The P0 thumbnail doubles as the remote preview thumbnail
    let thumb_path = slide_dir.join("thumb.jpg");
    if !tokio::fs::try_exists(&thumb_path).await.unwrap_or(false) {
        toolchain
            .write_thumbnail(Path::new(&slide.raw_path), &thumb_path, 640, 400)
            .await
            .context("failed to build thumbnail for preview")?;
    }
    let thumb_bytes = tokio::fs::read(&thumb_path)
        .await
        .context("failed to read thumbnail")?;

    let manifest = build_remote_manifest(slide, &staged, cfg);
    let manifest_bytes = serde_json::to_vec(&manifest).context("failed to serialize manifest")?;

    let index = {
        let tiles_dir = staged.tiles_dir.clone();
        tokio::task::spawn_blocking(move || tiles_index(&tiles_dir))
            .await
            .context("tiles index task panicked")??
    };

    let thumb_hash = sha256_hex(&thumb_bytes);
    let manifest_hash = sha256_hex(&manifest_bytes);
    let tiles_hash = sha256_hex(index.as_bytes());

    if let Some(marker) = load_marker(&slide_dir).await
        && marker_is_current(
            &marker,
            staged.max_level,
            cfg.target_max_dim,
            &thumb_hash,
            &manifest_hash,
            &tiles_hash,
        )
    {
        tracing::info!(slide_id = %slide.id, "preview already published, skipping");
        return Ok(PublishOutcome::skipped("already_published"));
    }

    let started_at = now_ms();
    write_marker(
        &slide_dir,
        &PreviewMarker {
            status: MarkerStatus::Incomplete,
            started_at,
            published_at: None,
            failed_at: None,
            error: None,
            max_level: staged.max_level,
            target_max_dim: cfg.target_max_dim,
            thumb_hash: None,
            manifest_hash: None,
            tiles_hash: None,
            outbox_event_id: None,
        },
    )
    .await?;

    let upload = do_publish(
        pool,
        store,
        bus,
        cfg,
        slide,
        &staged,
        &index,
        thumb_bytes,
        manifest_bytes,
    )
    .await;

    match upload {
        Ok((tiles_uploaded, outbox_event_id)) => {
            write_marker(
                &slide_dir,
                &PreviewMarker {
                    status: MarkerStatus::Complete,
                    started_at,
                    published_at: Some(now_ms()),
                    failed_at: None,
                    error: None,
                    max_level: staged.max_level,
                    target_max_dim: cfg.target_max_dim,
                    thumb_hash: Some(thumb_hash),
                    manifest_hash: Some(manifest_hash),
                    tiles_hash: Some(tiles_hash),
                    outbox_event_id,
                },
            )
            .await?;

            tracing::info!(
                slide_id = %slide.id,
                tiles = tiles_uploaded,
                max_level = staged.max_level,
                "preview published"
            );
            Ok(PublishOutcome {
                published: true,
                skipped: false,
                reason: None,
                tiles_uploaded,
            })
        }
        Err(e) => {
            write_marker(
                &slide_dir,
                &PreviewMarker {
                    status: MarkerStatus::Incomplete,
                    started_at,
                    published_at: None,
                    failed_at: Some(now_ms()),
                    error: Some(format!("{e:#}")),
                    max_level: staged.max_level,
                    target_max_dim: cfg.target_max_dim,
                    thumb_hash: None,
                    manifest_hash: None,
                    tiles_hash: None,
                    outbox_event_id: None,
                },
            )
            .await?;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn do_publish(
    pool: Option<&Pool>,
    store: &dyn ObjectStore,
    bus: &EventBus,
    cfg: &PreviewConfig,
    slide: &Slide,
    staged: &StagedPreview,
    index: &str,
    thumb_bytes: Vec<u8>,
    manifest_bytes: Vec<u8>,
) -> Result<(usize, Option<i64>)> {
    let remote_base = format!("{}/{}", cfg.prefix, slide.id);

    put_with_retry(
        store,
        &PutRequest {
            key: format!("{remote_base}/thumb.jpg"),
            body: Bytes::from(thumb_bytes),
            content_type: "image/jpeg",
            cache_control: "public, max-age=31536000",
        },
    )
    .await
    .context("failed to upload thumbnail")?;

    put_with_retry(
        store,
        &PutRequest {
            key: format!("{remote_base}/manifest.json"),
            body: Bytes::from(manifest_bytes),
            content_type: "application/json",
            cache_control: "no-cache",
        },
    )
    .await
    .context("failed to upload manifest")?;

    // The viewer expects the standard deep-zoom layout under tiles/
    let mut level_counts: BTreeMap<u32, usize> = BTreeMap::new();
    let mut requests = Vec::new();
    for rel in index.lines().filter(|l| !l.is_empty()) {
        let body = tokio::fs::read(staged.tiles_dir.join(rel))
            .await
            .with_context(|| format!("failed to read staged tile {rel}"))?;
        if let Some((level, _)) = rel.split_once('/')
            && let Ok(level) = level.parse::<u32>()
        {
            *level_counts.entry(level).or_default() += 1;
        }
        requests.push(PutRequest {
            key: format!("{remote_base}/tiles/{rel}"),
            body: Bytes::from(body),
            content_type: "image/jpeg",
            cache_control: "public, max-age=31536000",
        });
    }

    let tiles_uploaded = put_many(store, requests, cfg.upload_concurrency)
        .await
        .context("failed to upload preview tiles")?;

    let payload = serde_json::json!({
        "slide_id": slide.id,
        "bucket": cfg.bucket,
        "region": cfg.region,
        "endpoint": cfg.endpoint,
        "prefix": remote_base,
        "width": staged.rebased_w,
        "height": staged.rebased_h,
        "max_level": staged.max_level,
        "target_max_dim": cfg.target_max_dim,
        "tiles_uploaded": tiles_uploaded,
        "level_counts": level_counts,
    });

    let outbox_event_id = match pool {
        Some(pool) => Some(
            db::append_outbox(pool, "slide", &slide.id, "preview.published", &payload)
                .await
                .context("failed to append preview.published outbox event")?,
        ),
        None => None,
    };

    bus.emit(kinds::PREVIEW_PUBLISHED, payload);

    Ok((tiles_uploaded, outbox_event_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::vips::{SlideProperties, ToolchainError};
    use async_trait::async_trait;
    use orcein_common::types::{OcrStatus, SlideFormat, SlideStatus, TilegenStatus};
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rebased_dims_scales_down() {
        assert_eq!(rebased_dims(40_000, 30_000, 2048), (2048, 1536));
        assert_eq!(rebased_dims(30_000, 40_000, 2048), (1536, 2048));
    }

    #[test]
    fn rebased_dims_never_upscales() {
        assert_eq!(rebased_dims(1000, 800, 2048), (1000, 800));
        assert_eq!(rebased_dims(2048, 100, 2048), (2048, 100));
    }

    #[test]
    fn rebased_level_capped_by_image() {
        assert_eq!(rebased_max_level(6, 2048, 1536), 6);
        assert_eq!(rebased_max_level(6, 30, 20), 5);
        assert_eq!(rebased_max_level(3, 2048, 2048), 3);
    }

    #[test]
    fn saver_level_mapping() {
        // 2048px base: saver numbers 0..=11, viewer keeps 0..=6 -> 5..=11
        assert_eq!(saver_level_for(11, 6, 0), 5);
        assert_eq!(saver_level_for(11, 6, 6), 11);
    }

    #[test]
    fn marker_current_requires_everything_to_match() {
        let marker = PreviewMarker {
            status: MarkerStatus::Complete,
            started_at: 1,
            published_at: Some(2),
            failed_at: None,
            error: None,
            max_level: 6,
            target_max_dim: 2048,
            thumb_hash: Some("t".into()),
            manifest_hash: Some("m".into()),
            tiles_hash: Some("x".into()),
            outbox_event_id: None,
        };
        assert!(marker_is_current(&marker, 6, 2048, "t", "m", "x"));
        assert!(!marker_is_current(&marker, 5, 2048, "t", "m", "x"));
        assert!(!marker_is_current(&marker, 6, 1024, "t", "m", "x"));
        assert!(!marker_is_current(&marker, 6, 2048, "other", "m", "x"));

        let incomplete = PreviewMarker {
            status: MarkerStatus::Incomplete,
            ..marker
        };
        assert!(!marker_is_current(&incomplete, 6, 2048, "t", "m", "x"));
    }

    /// Toolchain that fabricates a deterministic preview pyramid on disk.
    struct FakeToolchain;

    #[async_trait]
    impl Toolchain for FakeToolchain {
        async fn read_properties(
            &self,
            _src: &std::path::Path,
        ) -> Result<SlideProperties, ToolchainError> {
            Ok(SlideProperties::flat(128, 96))
        }

        async fn write_thumbnail(
            &self,
            _src: &std::path::Path,
            dest: &std::path::Path,
            _width: u32,
            _height: u32,
        ) -> Result<(), ToolchainError> {
            tokio::fs::write(dest, b"thumb-bytes").await.unwrap();
            Ok(())
        }

        async fn extract_tile(
            &self,
            _src: &std::path::Path,
            _props: &SlideProperties,
            _max_level: u32,
            _level: u32,
            _x: u32,
            _y: u32,
            _dest: &std::path::Path,
        ) -> Result<(), ToolchainError> {
            unreachable!("preview publish never extracts single tiles")
        }

        async fn build_pyramid(
            &self,
            _src: &std::path::Path,
            out_dir: &std::path::Path,
        ) -> Result<(), ToolchainError> {
            // 128x96 base -> saver levels 0..=7
            for level in 0..=7u32 {
                let dir = out_dir.join(level.to_string());
                tokio::fs::create_dir_all(&dir).await.unwrap();
                tokio::fs::write(dir.join("0_0.jpg"), format!("tile-{level}"))
                    .await
                    .unwrap();
            }
            Ok(())
        }

        async fn downscale(
            &self,
            _src: &std::path::Path,
            dest: &std::path::Path,
            width: u32,
            height: u32,
        ) -> Result<(), ToolchainError> {
            tokio::fs::write(dest, format!("base-{width}x{height}"))
                .await
                .unwrap();
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        puts: AtomicUsize,
        keys: PlMutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn put(&self, req: &PutRequest) -> Result<(), StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.keys.lock().push(req.key.clone());
            Ok(())
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Ok(vec![])
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    fn test_slide(id: &str) -> Slide {
        Slide {
            id: id.to_string(),
            original_filename: "sample.svs".into(),
            raw_path: "/raw/sample.svs".into(),
            format: SlideFormat::Svs,
            status: SlideStatus::Ready,
            width: 128,
            height: 96,
            max_level: 7,
            level_ready_max: 7,
            tile_size: 256,
            tilegen_status: TilegenStatus::Done,
            app_mag: Some(20.0),
            mpp: Some(0.5),
            external_case_id: None,
            external_case_base: None,
            external_slide_label: None,
            ocr_status: OcrStatus::Absent,
            dsmeta_path: None,
            barcode: None,
            file_size: 1,
            created_at: 0,
        }
    }

    fn test_cfg() -> PreviewConfig {
        PreviewConfig {
            target_max_dim: 2048,
            requested_max_level: 6,
            upload_concurrency: 8,
            prefix: "previews".into(),
            bucket: "bucket".into(),
            region: "us-east-1".into(),
            endpoint: None,
        }
    }

    #[tokio::test]
    async fn publish_then_republish_is_a_no_op() {
        let derived = tempfile::tempdir().unwrap();
        let store = RecordingStore::default();
        let bus = EventBus::new();
        let slide = test_slide(&"cd".repeat(32));
        let cfg = test_cfg();

        let outcome = publish_preview(
            None,
            &store,
            &FakeToolchain,
            &bus,
            &cfg,
            &slide,
            derived.path(),
        )
        .await
        .unwrap();

        assert!(outcome.published);
        // 128x96 -> rebased max level 6, saver levels 1..=7 kept as 0..=6
        assert_eq!(outcome.tiles_uploaded, 7);
        // thumb + manifest + tiles
        assert_eq!(store.puts.load(Ordering::SeqCst), 9);

        let keys = store.keys.lock().clone();
        assert!(keys.iter().any(|k| k.ends_with("/thumb.jpg")));
        assert!(keys.iter().any(|k| k.ends_with("/manifest.json")));
        // Remote layout uses tiles/, not preview_tiles/
        assert!(
            keys.iter()
                .any(|k| k.contains(&format!("previews/{}/tiles/6/0_0.jpg", slide.id)))
        );
        assert!(keys.iter().all(|k| !k.contains("preview_tiles")));

        let marker = load_marker(&derived.path().join(&slide.id)).await.unwrap();
        assert_eq!(marker.status, MarkerStatus::Complete);
        let first_published_at = marker.published_at;

        // Second run with unchanged inputs: zero PUTs, marker untouched
        let outcome = publish_preview(
            None,
            &store,
            &FakeToolchain,
            &bus,
            &cfg,
            &slide,
            derived.path(),
        )
        .await
        .unwrap();

        assert!(!outcome.published);
        assert!(outcome.skipped);
        assert_eq!(outcome.reason.as_deref(), Some("already_published"));
        assert_eq!(store.puts.load(Ordering::SeqCst), 9);

        let marker = load_marker(&derived.path().join(&slide.id)).await.unwrap();
        assert_eq!(marker.published_at, first_published_at);
    }

    #[tokio::test]
    async fn failed_publish_leaves_incomplete_marker() {
        struct FailingStore;

        #[async_trait]
        impl ObjectStore for FailingStore {
            async fn put(&self, _req: &PutRequest) -> Result<(), StoreError> {
                Err(StoreError::Permanent("access denied".into()))
            }
            async fn list(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
                Ok(vec![])
            }
            async fn delete_prefix(&self, _prefix: &str) -> Result<usize, StoreError> {
                Ok(0)
            }
        }

        let derived = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let slide = test_slide(&"ef".repeat(32));
        let cfg = test_cfg();

        let err = publish_preview(
            None,
            &FailingStore,
            &FakeToolchain,
            &bus,
            &cfg,
            &slide,
            derived.path(),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("thumbnail"));

        let marker = load_marker(&derived.path().join(&slide.id)).await.unwrap();
        assert_eq!(marker.status, MarkerStatus::Incomplete);
        assert!(marker.failed_at.is_some());
        assert!(marker.error.is_some());
    }

    #[tokio::test]
    async fn staging_removes_temp_artefacts() {
        let derived = tempfile::tempdir().unwrap();
        let slide_dir = derived.path().join("slide");
        let cfg = test_cfg();

        let staged = stage_local_preview(
            &FakeToolchain,
            Path::new("/raw/sample.svs"),
            &slide_dir,
            128,
            96,
            &cfg,
        )
        .await
        .unwrap();

        assert_eq!((staged.rebased_w, staged.rebased_h), (128, 96));
        assert_eq!(staged.max_level, 6);
        assert!(!slide_dir.join("preview_base.jpg").exists());
        assert!(!slide_dir.join("preview_dz_tmp").exists());
        // Dropped below the mapped floor: saver level 0 is gone
        for z in 0..=6u32 {
            assert!(staged.tiles_dir.join(z.to_string()).exists());
        }
        assert!(!staged.tiles_dir.join("7").exists());

        let index = tiles_index(&staged.tiles_dir).unwrap();
        assert_eq!(index.lines().count(), 7);
        assert!(index.starts_with("0/0_0.jpg"));
    }
}
