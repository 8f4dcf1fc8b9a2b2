use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use uuid::Uuid;

use orcein_common::events::{EventBus, kinds};
use crate::vips::{SlideProperties, Toolchain, ToolchainError, tile_geometry};

/// Cloneable error so one generation outcome can fan out to every waiter.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    #[error("tile ({x}, {y}) out of bounds at level {level}")]
    Bounds { level: u32, x: u32, y: u32 },
    #[error("tile generation timed out: {0}")]
    Timeout(String),
    #[error("toolchain failure: {0}")]
    Toolchain(String),
    #[error("io failure: {0}")]
    Io(String),
    /// Another request is generating this tile and the wait budget ran out
    #[error("tile generation pending")]
    Pending,
}

impl From<ToolchainError> for TileError {
    fn from(e: ToolchainError) -> Self {
        match e {
            ToolchainError::Bounds { level, x, y } => TileError::Bounds { level, x, y },
            ToolchainError::Timeout { .. } => TileError::Timeout(e.to_string()),
            ToolchainError::Io { .. } => TileError::Io(e.to_string()),
            ToolchainError::Toolchain { .. } => TileError::Toolchain(e.to_string()),
        }
    }
}

/// What the tile service needs to know about a slide; the HTTP layer reads
/// it off the registry row.
#[derive(Debug, Clone)]
pub struct SlideRef {
    pub id: String,
    pub raw_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub max_level: u32,
}

pub type TileKey = (String, u32, u32, u32);

type Outcome = Result<PathBuf, TileError>;

/// On-demand tile generator with per-tile request coalescing and a global
/// concurrency bound.
///
/// The first request for an uncached tile becomes the winner: it acquires a
/// semaphore permit, runs the toolchain once and broadcasts the outcome.
/// Concurrent requests for the same tuple find the in-flight entry and wait
/// on its outcome instead of contending for a permit. Failures are not
/// cached; the next request starts over.
pub struct TileService {
    derived_dir: PathBuf,
    toolchain: Arc<dyn Toolchain>,
    bus: EventBus,
    pending: Mutex<HashMap<TileKey, watch::Receiver<Option<Outcome>>>>,
    props_cache: Mutex<HashMap<String, Arc<SlideProperties>>>,
    semaphore: Arc<Semaphore>,
    /// How long a coalesced waiter blocks before reporting `Pending`.
    wait_budget: Duration,
}

impl TileService {
    pub fn new(
        derived_dir: PathBuf,
        toolchain: Arc<dyn Toolchain>,
        bus: EventBus,
        concurrency: usize,
        wait_budget: Duration,
    ) -> Self {
        Self {
            derived_dir,
            toolchain,
            bus,
            pending: Mutex::new(HashMap::new()),
            props_cache: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            wait_budget,
        }
    }

    pub fn tile_path(&self, slide_id: &str, z: u32, x: u32, y: u32) -> PathBuf {
        self.derived_dir
            .join(slide_id)
            .join("tiles")
            .join(z.to_string())
            .join(format!("{x}_{y}.jpg"))
    }

    #[allow(dead_code)]
    pub fn is_pending(&self, slide_id: &str, z: u32, x: u32, y: u32) -> bool {
        self.pending
            .lock()
            .contains_key(&(slide_id.to_string(), z, x, y))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop cached header properties for a slide (after delete/re-ingest).
    pub fn evict(&self, slide_id: &str) {
        self.props_cache.lock().remove(slide_id);
    }

    /// Materialise one tile, returning its canonical path.
    pub async fn get_tile(&self, slide: &SlideRef, z: u32, x: u32, y: u32) -> Outcome {
        counter!("orcein_tile_requests_total").increment(1);
        let start = std::time::Instant::now();
        let result = self.get_tile_inner(slide, z, x, y).await;
        histogram!("orcein_tile_duration_seconds").record(start.elapsed());
        if result.is_err() {
            counter!("orcein_tile_errors_total").increment(1);
        }
        result
    }

    async fn get_tile_inner(&self, slide: &SlideRef, z: u32, x: u32, y: u32) -> Outcome {
        let path = self.tile_path(&slide.id, z, x, y);

        // Disk hit: the pyramid builder or an earlier request already wrote it
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        // Cheap rejection before any coalescing bookkeeping
        if tile_geometry(slide.width, slide.height, slide.max_level, z, x, y).is_none() {
            return Err(TileError::Bounds { level: z, x, y });
        }

        let key: TileKey = (slide.id.clone(), z, x, y);

        // Coalesce: either join an in-flight generation or become the winner
        let guard = match self.coalesce(key) {
            Coalesce::Join(mut rx) => return self.await_outcome(&mut rx).await,
            Coalesce::Winner(guard) => guard,
        };

        let outcome = self.generate(slide, z, x, y, &path).await;
        guard.complete(outcome.clone());

        if outcome.is_ok() {
            counter!("orcein_tiles_generated_total").increment(1);
            self.bus.emit(
                kinds::TILE_GENERATED,
                serde_json::json!({ "slide_id": slide.id, "z": z, "x": x, "y": y }),
            );
        }
        outcome
    }

    /// Synchronous lock/insert step, kept out of the async fn so the
    /// `MutexGuard` never spans an `.await` point (parking_lot guards
    /// aren't `Send`).
    fn coalesce(&self, key: TileKey) -> Coalesce<'_> {
        let mut pending = self.pending.lock();
        if let Some(rx) = pending.get(&key) {
            return Coalesce::Join(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        pending.insert(key.clone(), rx);
        Coalesce::Winner(PendingGuard {
            service: self,
            key,
            tx,
            done: false,
        })
    }

    async fn await_outcome(&self, rx: &mut watch::Receiver<Option<Outcome>>) -> Outcome {
        let waited = tokio::time::timeout(self.wait_budget, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(value)) => value.clone().unwrap_or(Err(TileError::Pending)),
            // Winner vanished without an outcome
            Ok(Err(_)) => Err(TileError::Pending),
            Err(_) => Err(TileError::Pending),
        }
    }

    async fn generate(&self, slide: &SlideRef, z: u32, x: u32, y: u32, path: &PathBuf) -> Outcome {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TileError::Pending)?;

        // Another winner may have landed the tile while we waited for a permit
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(path.clone());
        }

        let props = self.properties_for(slide).await?;

        let level_dir = path.parent().expect("tile path has a parent");
        tokio::fs::create_dir_all(level_dir)
            .await
            .map_err(|e| TileError::Io(e.to_string()))?;

        // Write to a unique temp name, then rename into the canonical path
        let staging = level_dir.join(format!(".tmp-{}.jpg", Uuid::new_v4()));
        let result = self
            .toolchain
            .extract_tile(&slide.raw_path, &props, slide.max_level, z, x, y, &staging)
            .await;

        match result {
            Ok(()) => {
                tokio::fs::rename(&staging, path)
                    .await
                    .map_err(|e| TileError::Io(e.to_string()))?;
                Ok(path.clone())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(e.into())
            }
        }
    }

    async fn properties_for(&self, slide: &SlideRef) -> Result<Arc<SlideProperties>, TileError> {
        if let Some(props) = self.props_cache.lock().get(&slide.id) {
            return Ok(props.clone());
        }
        let props = Arc::new(self.toolchain.read_properties(&slide.raw_path).await?);
        self.props_cache
            .lock()
            .insert(slide.id.clone(), props.clone());
        Ok(props)
    }
}

enum Coalesce<'a> {
    Join(watch::Receiver<Option<Outcome>>),
    Winner(PendingGuard<'a>),
}

/// Removes the coalescing entry and broadcasts the outcome exactly once,
/// even if the winning request is cancelled mid-generation.
struct PendingGuard<'a> {
    service: &'a TileService,
    key: TileKey,
    tx: watch::Sender<Option<Outcome>>,
    done: bool,
}

impl PendingGuard<'_> {
    fn complete(mut self, outcome: Outcome) {
        self.service.pending.lock().remove(&self.key);
        let _ = self.tx.send(Some(outcome));
        self.done = true;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.service.pending.lock().remove(&self.key);
            let _ = self.tx.send(Some(Err(TileError::Toolchain(
                "generation cancelled".to_string(),
            ))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts invocations and writes a marker byte per tile after a delay.
    struct CountingToolchain {
        tiles: AtomicUsize,
        props: AtomicUsize,
        fail_first: AtomicUsize,
        delay: Duration,
    }

    impl CountingToolchain {
        fn new(delay: Duration) -> Self {
            Self {
                tiles: AtomicUsize::new(0),
                props: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Toolchain for CountingToolchain {
        async fn read_properties(&self, _src: &Path) -> Result<SlideProperties, ToolchainError> {
            self.props.fetch_add(1, Ordering::SeqCst);
            Ok(SlideProperties::flat(1000, 800))
        }

        async fn write_thumbnail(
            &self,
            _src: &Path,
            _dest: &Path,
            _width: u32,
            _height: u32,
        ) -> Result<(), ToolchainError> {
            Ok(())
        }

        async fn extract_tile(
            &self,
            _src: &Path,
            _props: &SlideProperties,
            _max_level: u32,
            level: u32,
            x: u32,
            y: u32,
            dest: &Path,
        ) -> Result<(), ToolchainError> {
            self.tiles.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(ToolchainError::Toolchain {
                    op: "extract_tile",
                    detail: format!("injected failure at ({level}, {x}, {y})"),
                });
            }
            tokio::fs::write(dest, b"jpeg-bytes").await.unwrap();
            Ok(())
        }

        async fn build_pyramid(&self, _src: &Path, _out: &Path) -> Result<(), ToolchainError> {
            Ok(())
        }

        async fn downscale(
            &self,
            _src: &Path,
            _dest: &Path,
            _width: u32,
            _height: u32,
        ) -> Result<(), ToolchainError> {
            Ok(())
        }
    }

    fn service(dir: &Path, toolchain: Arc<CountingToolchain>) -> TileService {
        TileService::new(
            dir.to_path_buf(),
            toolchain,
            EventBus::new(),
            4,
            Duration::from_secs(5),
        )
    }

    fn slide() -> SlideRef {
        SlideRef {
            id: "ab".repeat(32),
            raw_path: PathBuf::from("/raw/slide.svs"),
            width: 1000,
            height: 800,
            max_level: 10,
        }
    }

    #[tokio::test]
    async fn eight_parallel_requests_invoke_toolchain_once() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(CountingToolchain::new(Duration::from_millis(50)));
        let service = Arc::new(service(dir.path(), toolchain.clone()));
        let slide = slide();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                let slide = slide.clone();
                tokio::spawn(async move { service.get_tile(&slide, 10, 0, 0).await })
            })
            .collect();

        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(toolchain.tiles.load(Ordering::SeqCst), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        let bytes = tokio::fs::read(&paths[0]).await.unwrap();
        assert_eq!(bytes, b"jpeg-bytes");
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn disk_hit_skips_toolchain() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(CountingToolchain::new(Duration::ZERO));
        let service = service(dir.path(), toolchain.clone());
        let slide = slide();

        let path = service.tile_path(&slide.id, 10, 1, 1);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"cached").await.unwrap();

        let got = service.get_tile(&slide, 10, 1, 1).await.unwrap();
        assert_eq!(got, path);
        assert_eq!(toolchain.tiles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn out_of_bounds_is_rejected_without_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(CountingToolchain::new(Duration::ZERO));
        let service = service(dir.path(), toolchain.clone());
        let slide = slide();

        let err = service.get_tile(&slide, 10, 40, 0).await.unwrap_err();
        assert!(matches!(err, TileError::Bounds { .. }));
        assert_eq!(toolchain.tiles.load(Ordering::SeqCst), 0);
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(CountingToolchain::new(Duration::ZERO));
        toolchain.fail_first.store(1, Ordering::SeqCst);
        let service = service(dir.path(), toolchain.clone());
        let slide = slide();

        let err = service.get_tile(&slide, 10, 0, 1).await.unwrap_err();
        assert!(matches!(err, TileError::Toolchain(_)));

        // Next identical request re-enters and succeeds
        service.get_tile(&slide, 10, 0, 1).await.unwrap();
        assert_eq!(toolchain.tiles.load(Ordering::SeqCst), 2);
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn waiter_reports_pending_when_budget_runs_out() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(CountingToolchain::new(Duration::from_millis(200)));
        let service = Arc::new(TileService::new(
            dir.path().to_path_buf(),
            toolchain.clone(),
            EventBus::new(),
            4,
            Duration::from_millis(20), // far shorter than the generation
        ));
        let slide = slide();

        let winner = {
            let service = service.clone();
            let slide = slide.clone();
            tokio::spawn(async move { service.get_tile(&slide, 10, 1, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // A coalesced caller gives up after the wait budget -> 503 upstream
        let err = service.get_tile(&slide, 10, 1, 0).await.unwrap_err();
        assert!(matches!(err, TileError::Pending));

        // The winner still finishes normally
        winner.await.unwrap().unwrap();
        assert_eq!(toolchain.tiles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn is_pending_tracks_in_flight_generation() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(CountingToolchain::new(Duration::from_millis(100)));
        let service = Arc::new(service(dir.path(), toolchain));
        let slide = slide();

        let task = {
            let service = service.clone();
            let slide = slide.clone();
            tokio::spawn(async move { service.get_tile(&slide, 10, 2, 2).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(service.is_pending(&slide.id, 10, 2, 2));
        assert_eq!(service.pending_count(), 1);

        task.await.unwrap().unwrap();
        assert!(!service.is_pending(&slide.id, 10, 2, 2));
        assert_eq!(service.pending_count(), 0);
    }
}
