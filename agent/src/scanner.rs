use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use orcein_common::now_ms;
use orcein_common::types::SlideFormat;

use crate::db;
use crate::hash::sha256_file;
use crate::health::ComponentState;
use crate::ingest::{IngestDeps, SlideRegistration, register_and_enqueue};
use crate::models::ScannerFile;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub discovered: usize,
    pub registered: usize,
    pub skipped: usize,
}

/// Metadata parsed from a slide's `.dsmeta` sidecar directory.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DsMeta {
    pub barcode: Option<String>,
    pub guid: Option<String>,
    pub scanned_at: Option<String>,
    /// Path to the label image, when the scanner exported one.
    pub label_path: Option<PathBuf>,
}

/// Sidecar directory for `{barcode}_{ts}.svs` is `{barcode}_{ts}.dsmeta`.
pub fn dsmeta_dir_for(slide_path: &Path) -> Option<PathBuf> {
    let stem = slide_path.file_stem()?.to_str()?;
    Some(slide_path.with_file_name(format!("{stem}.dsmeta")))
}

fn string_field(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(k))
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Parse a `.dsmeta` sidecar. Missing directory, missing `slide.json` or
/// missing keys all degrade to empty metadata.
pub fn parse_dsmeta(dir: &Path) -> DsMeta {
    let mut meta = DsMeta::default();
    if !dir.is_dir() {
        return meta;
    }

    if let Ok(raw) = std::fs::read(dir.join("slide.json")) {
        match serde_json::from_slice::<serde_json::Value>(&raw) {
            Ok(value) => {
                meta.barcode = string_field(&value, &["barcode", "Barcode"]);
                meta.guid = string_field(&value, &["guid", "GUID"]);
                meta.scanned_at = string_field(&value, &["scanDatetime", "scan_datetime"]);
            }
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "unparseable slide.json");
            }
        }
    }

    let label = dir.join("label.jpg");
    if label.is_file() {
        meta.label_path = Some(label);
    }

    meta
}

/// Recursively collect `.svs` files under a scanner mount. Blocking.
pub fn collect_svs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(dir = %current.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                // Sidecar directories hold metadata, not slides
                if path.extension().and_then(|e| e.to_str()) != Some("dsmeta") {
                    stack.push(path);
                }
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("svs"))
                .unwrap_or(false)
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// One scraper pass: walk the mount, register anything not seen before.
/// Files stay on the scanner mount; `raw_path` points into it.
pub async fn scan_once(deps: &IngestDeps, scanner_dir: &Path) -> Result<ScanStats> {
    let mut stats = ScanStats::default();

    let dir = scanner_dir.to_path_buf();
    let files = match tokio::task::spawn_blocking(move || collect_svs(&dir))
        .await
        .context("scanner walk task panicked")?
    {
        Ok(files) => {
            deps.health.set_scanner(ComponentState::Running);
            files
        }
        Err(e) => {
            tracing::warn!(dir = %scanner_dir.display(), error = %e, "scanner mount inaccessible");
            deps.health.set_scanner(ComponentState::DirMissing);
            return Ok(stats);
        }
    };

    stats.discovered = files.len();

    for path in files {
        let path_str = path.display().to_string();
        if db::scanner_file_seen(&deps.pool, &path_str).await? {
            stats.skipped += 1;
            continue;
        }

        let Ok(meta) = tokio::fs::metadata(&path).await else {
            tracing::warn!(path = %path_str, "scanner file vanished mid-pass");
            continue;
        };
        if meta.len() == 0 {
            stats.skipped += 1;
            continue;
        }

        let slide_id = sha256_file(&path).await?;
        let sidecar = {
            let dsmeta_dir = dsmeta_dir_for(&path);
            tokio::task::spawn_blocking(move || {
                dsmeta_dir.map(|d| parse_dsmeta(&d)).unwrap_or_default()
            })
            .await
            .context("dsmeta parse task panicked")?
        };

        let original_filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(String::from)
            .unwrap_or_else(|| slide_id.clone());

        register_and_enqueue(
            deps,
            SlideRegistration {
                slide_id: slide_id.clone(),
                original_filename,
                raw_path: path_str.clone(),
                format: SlideFormat::Svs,
                file_size: meta.len() as i64,
                barcode: sidecar.barcode.clone(),
                dsmeta_path: sidecar
                    .label_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                ocr_pending: sidecar.label_path.is_some(),
            },
        )
        .await?;

        db::insert_scanner_file(
            &deps.pool,
            &ScannerFile {
                path: path_str,
                slide_id,
                barcode: sidecar.barcode,
                guid: sidecar.guid,
                scanned_at: sidecar.scanned_at,
                created_at: now_ms(),
            },
        )
        .await?;

        stats.registered += 1;
    }

    Ok(stats)
}

/// Handle shared between the interval loop and manual HTTP triggers, so
/// only one pass runs at a time from any entry point.
#[derive(Clone)]
pub struct Scanner {
    deps: IngestDeps,
    scanner_dir: PathBuf,
    pass_guard: Arc<tokio::sync::Mutex<()>>,
}

impl Scanner {
    pub fn new(deps: IngestDeps, scanner_dir: PathBuf) -> Self {
        Self {
            deps,
            scanner_dir,
            pass_guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Run one pass unless another is in flight; `None` means skipped.
    pub async fn try_scan(&self) -> Result<Option<ScanStats>> {
        let Ok(_pass) = self.pass_guard.try_lock() else {
            tracing::debug!("scanner pass already running, skipping");
            return Ok(None);
        };
        let stats = scan_once(&self.deps, &self.scanner_dir).await?;
        Ok(Some(stats))
    }
}

/// Scrape the scanner mount on a fixed interval. Passes never overlap: a
/// pass still running when the next tick fires makes the tick a no-op.
pub async fn run_scanner(
    scanner: Scanner,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(
        dir = %scanner.scanner_dir.display(),
        interval_ms = interval.as_millis() as u64,
        "scanner scraper started"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("scanner scraper stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                match scanner.try_scan().await {
                    Ok(Some(stats)) => {
                        if stats.registered > 0 {
                            tracing::info!(
                                discovered = stats.discovered,
                                registered = stats.registered,
                                skipped = stats.skipped,
                                "scanner pass complete"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(error = ?e, "scanner pass failed");
                        scanner
                            .deps
                            .health
                            .set_scanner(ComponentState::Error(format!("{e:#}")));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_svs_recursively_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2024/0711/GUID-1/BC123_20240711");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("BC123_20240711.svs"), b"b").unwrap();
        std::fs::write(dir.path().join("a.svs"), b"a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        // Slide files inside .dsmeta sidecars must not be picked up
        let sidecar = nested.join("BC123_20240711.dsmeta");
        std::fs::create_dir_all(&sidecar).unwrap();
        std::fs::write(sidecar.join("label.svs"), b"label").unwrap();

        let found = collect_svs(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("a.svs"));
        assert!(found[1].ends_with("BC123_20240711.svs"));
    }

    #[test]
    fn missing_scanner_dir_is_an_error() {
        assert!(collect_svs(Path::new("/nonexistent/scanner")).is_err());
    }

    #[test]
    fn dsmeta_dir_is_sibling_with_same_stem() {
        let dir = dsmeta_dir_for(Path::new("/scanner/2024/BC1_20240711/BC1_20240711.svs")).unwrap();
        assert_eq!(
            dir,
            PathBuf::from("/scanner/2024/BC1_20240711/BC1_20240711.dsmeta")
        );
    }

    #[test]
    fn parses_sidecar_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = dir.path().join("BC1.dsmeta");
        std::fs::create_dir_all(&sidecar).unwrap();
        std::fs::write(
            sidecar.join("slide.json"),
            br#"{"barcode": "BC1", "guid": "G-22", "scanDatetime": "20240711093000"}"#,
        )
        .unwrap();
        std::fs::write(sidecar.join("label.jpg"), b"jpeg").unwrap();

        let meta = parse_dsmeta(&sidecar);
        assert_eq!(meta.barcode.as_deref(), Some("BC1"));
        assert_eq!(meta.guid.as_deref(), Some("G-22"));
        assert_eq!(meta.scanned_at.as_deref(), Some("20240711093000"));
        assert!(meta.label_path.is_some());
    }

    #[test]
    fn sidecar_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();

        // Missing sidecar entirely
        let meta = parse_dsmeta(&dir.path().join("absent.dsmeta"));
        assert_eq!(meta, DsMeta::default());

        // Sidecar with unparseable json and no label
        let sidecar = dir.path().join("bad.dsmeta");
        std::fs::create_dir_all(&sidecar).unwrap();
        std::fs::write(sidecar.join("slide.json"), b"not-json").unwrap();
        let meta = parse_dsmeta(&sidecar);
        assert_eq!(meta.barcode, None);
        assert_eq!(meta.label_path, None);
    }
}
