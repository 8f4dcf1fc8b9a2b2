use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use orcein_common::events::EventBus;
use orcein_common::shutdown::shutdown_signal;

mod args;
mod db;
mod filename;
mod hash;
mod health;
mod ingest;
mod models;
mod preview;
mod queue;
mod raster;
mod scanner;
mod server;
mod store;
mod tilegen;
mod tiles;
mod tunnel;
mod vips;
mod worker;

use args::{Cli, Commands, RunArgs};
use health::{ComponentState, HealthState};
use ingest::IngestDeps;
use preview::PreviewConfig;
use queue::JobQueue;
use scanner::Scanner;
use server::AppState;
use store::{ObjectStore, S3Store, StoreError};
use tiles::TileService;
use vips::{Toolchain, VipsToolchain};
use worker::WorkerDeps;

#[tokio::main]
async fn main() -> Result<()> {
    orcein_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => run(run_args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    tracing::info!(
        ingest_dir = %args.dirs.ingest_dir,
        raw_dir = %args.dirs.raw_dir,
        derived_dir = %args.dirs.derived_dir,
        http_port = args.http_port,
        "starting slide agent"
    );

    let raw_dir = PathBuf::from(&args.dirs.raw_dir);
    let ingest_dir = PathBuf::from(&args.dirs.ingest_dir);
    let derived_dir = PathBuf::from(&args.dirs.derived_dir);
    for dir in [&raw_dir, &ingest_dir, &derived_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    // Postgres: the transactional registry of slides, jobs and the outbox
    let pool = orcein_common::postgres::create_pool(args.postgres.clone()).await;
    db::init_schema(&pool).await?;
    tracing::info!("connected to postgres");

    // Any job that was running when the previous process died is an orphan
    db::reconcile_running_jobs(&pool).await?;

    // Redis: the job queue and the cross-process event relay
    let redis_pool = orcein_common::redis::init_redis(&args.redis).await;
    let job_queue = JobQueue::new(redis_pool.clone());
    let bus = EventBus::with_relay(redis_pool);
    tracing::info!("connected to redis");

    let health = Arc::new(HealthState::new());

    let toolchain: Arc<dyn Toolchain> = Arc::new(VipsToolchain::new(
        args.vips_bin.clone(),
        args.vipsheader_bin.clone(),
        Duration::from_millis(args.tile_generation_timeout_ms),
        Duration::from_millis(args.pyramid_timeout_ms),
    ));

    // Object store is optional; previews stay disabled without it
    let store: Option<Arc<dyn ObjectStore>> = match S3Store::from_args(&args.s3).await {
        Ok(store) => {
            tracing::info!(bucket = %store.bucket(), "object store ready");
            Some(Arc::new(store))
        }
        Err(StoreError::ConfigMissing) => {
            tracing::info!("no object store configured");
            None
        }
        Err(e) => return Err(e).context("failed to initialize object store"),
    };

    let preview_cfg = if args.preview.preview_remote_enabled {
        match (&store, &args.s3.bucket) {
            (Some(_), Some(bucket)) => {
                health.set_preview_remote(ComponentState::Running);
                Some(PreviewConfig {
                    target_max_dim: args.preview.preview_target_max_dim,
                    requested_max_level: args.preview.preview_max_level,
                    upload_concurrency: args.preview.preview_upload_concurrency,
                    prefix: args.s3.prefix.clone(),
                    bucket: bucket.clone(),
                    region: args.s3.region.clone(),
                    endpoint: args.s3.endpoint.clone(),
                })
            }
            _ => {
                tracing::warn!("remote preview enabled but object store is not configured");
                health.set_preview_remote(ComponentState::Error(
                    "object store configuration missing".to_string(),
                ));
                None
            }
        }
    } else {
        None
    };

    let tile_service = Arc::new(TileService::new(
        derived_dir.clone(),
        toolchain.clone(),
        bus.clone(),
        args.tile_concurrency,
        Duration::from_millis(args.tile_generation_timeout_ms) + Duration::from_secs(5),
    ));

    let cancel = CancellationToken::new();
    let mut tasks: Vec<(&'static str, tokio::task::JoinHandle<Result<()>>)> = Vec::new();

    let worker_deps = WorkerDeps {
        pool: pool.clone(),
        queue: job_queue.clone(),
        bus: bus.clone(),
        toolchain: toolchain.clone(),
        store: store.clone(),
        derived_dir: derived_dir.clone(),
        preview: preview_cfg.clone(),
    };
    tasks.push((
        "worker",
        tokio::spawn(worker::run_worker(worker_deps.clone(), cancel.clone())),
    ));

    let ingest_deps = IngestDeps {
        pool: pool.clone(),
        queue: job_queue.clone(),
        bus: bus.clone(),
        raw_dir: raw_dir.clone(),
        ingest_dir: ingest_dir.clone(),
        stable: Duration::from_secs(args.stable_seconds),
        health: health.clone(),
    };
    tasks.push((
        "inbox-watcher",
        tokio::spawn(ingest::run_inbox_watcher(
            ingest_deps.clone(),
            cancel.clone(),
        )),
    ));

    let scanner_handle = if args.scanner.scanner_enabled {
        health.set_scanner(ComponentState::Starting);
        let scanner = Scanner::new(
            ingest_deps.clone(),
            PathBuf::from(&args.scanner.scanner_dir),
        );
        tasks.push((
            "scanner",
            tokio::spawn(scanner::run_scanner(
                scanner.clone(),
                Duration::from_millis(args.scanner.scanner_interval_ms),
                cancel.clone(),
            )),
        ));
        Some(scanner)
    } else {
        None
    };

    // SSE clients read the cross-process channel, so relayed events from
    // any process on this Redis show up on the local surface
    let (events_tx, _) = tokio::sync::broadcast::channel(256);
    tasks.push((
        "event-relay",
        tokio::spawn(orcein_common::redis::listen_for_events(
            cancel.clone(),
            args.redis.clone(),
            events_tx.clone(),
            orcein_common::events::EVENTS_TOPIC,
        )),
    ));

    let state = AppState {
        pool: pool.clone(),
        tiles: tile_service,
        health: health.clone(),
        derived_dir: derived_dir.clone(),
        scanner: scanner_handle,
        worker: worker_deps,
        events: events_tx,
    };
    let router = server::build_router(state);

    // The tunnel re-enters the HTTP surface through the router, in-process
    tasks.push((
        "tunnel",
        tokio::spawn(tunnel::run_tunnel(
            args.tunnel.clone(),
            router.clone(),
            health.clone(),
            cancel.clone(),
        )),
    ));

    tasks.push((
        "http",
        tokio::spawn(server::run_server(router, args.http_port, cancel.clone())),
    ));

    shutdown_signal().await;
    tracing::info!("shutting down");
    cancel.cancel();

    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => tracing::info!(task = name, "stopped"),
            Ok(Err(e)) => tracing::warn!(task = name, error = ?e, "stopped with error"),
            Err(e) => tracing::warn!(task = name, error = ?e, "task panicked"),
        }
    }

    tracing::info!("agent stopped");
    Ok(())
}
