use clap::{Parser, Subcommand};
use orcein_common::args::{PostgresArgs, RedisArgs};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the slide agent: ingest, worker, HTTP surface and tunnel
    Run(RunArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct S3Args {
    /// Bucket for published previews; previews stay disabled when unset
    #[arg(long, env = "S3_BUCKET")]
    pub bucket: Option<String>,

    /// Key prefix previews are published under
    #[arg(long, env = "S3_PREFIX", default_value = "previews")]
    pub prefix: String,

    /// S3 endpoint URL (for S3-compatible storage)
    #[arg(long, env = "S3_ENDPOINT")]
    pub endpoint: Option<String>,

    /// S3 region
    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    pub region: String,
}

#[derive(Parser, Debug, Clone)]
pub struct DirArgs {
    /// Watched directory external producers drop slide files into
    #[arg(long, env = "INGEST_DIR", default_value = "./data/inbox")]
    pub ingest_dir: String,

    /// Content-addressed raw slide storage
    #[arg(long, env = "RAW_DIR", default_value = "./data/raw")]
    pub raw_dir: String,

    /// Per-slide derived artefacts (thumbnails, manifests, tiles)
    #[arg(long, env = "DERIVED_DIR", default_value = "./data/derived")]
    pub derived_dir: String,
}

#[derive(Parser, Debug, Clone)]
pub struct ScannerArgs {
    #[arg(long, env = "SCANNER_ENABLED", default_value_t = false)]
    pub scanner_enabled: bool,

    /// Read-only scanner mount to scrape
    #[arg(long, env = "SCANNER_DIR", default_value = "/scanner")]
    pub scanner_dir: String,

    /// Interval between scraper passes in milliseconds
    #[arg(long, env = "SCANNER_INTERVAL_MS", default_value_t = 60_000)]
    pub scanner_interval_ms: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct PreviewArgs {
    #[arg(long, env = "PREVIEW_REMOTE_ENABLED", default_value_t = false)]
    pub preview_remote_enabled: bool,

    /// Level cap requested for the rebased preview pyramid
    #[arg(long, env = "PREVIEW_MAX_LEVEL", default_value_t = 6)]
    pub preview_max_level: u32,

    /// Longest rebased dimension in pixels
    #[arg(long, env = "PREVIEW_TARGET_MAX_DIM", default_value_t = 2048)]
    pub preview_target_max_dim: u32,

    /// In-flight uploads during a preview publish
    #[arg(long, env = "PREVIEW_UPLOAD_CONCURRENCY", default_value_t = 8)]
    pub preview_upload_concurrency: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct TunnelArgs {
    /// Control-plane WebSocket endpoint; tunnel stays disabled when unset
    #[arg(long, env = "TUNNEL_URL")]
    pub tunnel_url: Option<String>,

    #[arg(long, env = "TUNNEL_TOKEN")]
    pub tunnel_token: Option<String>,

    /// Agent identifier presented to the control plane
    #[arg(long, env = "TUNNEL_AGENT_ID", default_value = "orcein-agent")]
    pub tunnel_agent_id: String,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[command(flatten)]
    pub redis: RedisArgs,

    #[command(flatten)]
    pub s3: S3Args,

    #[command(flatten)]
    pub dirs: DirArgs,

    #[command(flatten)]
    pub scanner: ScannerArgs,

    #[command(flatten)]
    pub preview: PreviewArgs,

    #[command(flatten)]
    pub tunnel: TunnelArgs,

    /// Local HTTP surface port
    #[arg(long, env = "HTTP_PORT", default_value_t = 4000)]
    pub http_port: u16,

    /// Window a candidate file's size must hold steady before ingest
    #[arg(long, env = "STABLE_SECONDS", default_value_t = 10)]
    pub stable_seconds: u64,

    /// Concurrent on-demand tile generations
    #[arg(long, env = "TILE_CONCURRENCY", default_value_t = 4)]
    pub tile_concurrency: usize,

    /// Timeout for a single toolchain tile/thumbnail invocation
    #[arg(long, env = "TILE_GENERATION_TIMEOUT_MS", default_value_t = 60_000)]
    pub tile_generation_timeout_ms: u64,

    /// Timeout for a full deep-zoom pyramid build
    #[arg(long, env = "PYRAMID_TIMEOUT_MS", default_value_t = 1_800_000)]
    pub pyramid_timeout_ms: u64,

    /// vips binary
    #[arg(long, env = "VIPS_BIN", default_value = "vips")]
    pub vips_bin: String,

    /// vipsheader binary
    #[arg(long, env = "VIPSHEADER_BIN", default_value = "vipsheader")]
    pub vipsheader_bin: String,
}
