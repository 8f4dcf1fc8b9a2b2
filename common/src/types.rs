use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Edge length of every tile the agent produces, in pixels.
pub const TILE_SIZE: u32 = 256;

/// Deep-zoom level count convention: level 0 is the smallest level and
/// `max_level_for(w, h)` is full resolution, halving at each step down.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn max_level_for(width: u32, height: u32) -> u32 {
    let max_dim = width.max(height);
    if max_dim <= 1 {
        return 0;
    }
    (f64::from(max_dim)).log2().ceil() as u32
}

/// Pixel dimensions of a deep-zoom level.
pub fn level_dimensions(width: u32, height: u32, max_level: u32, level: u32) -> (u32, u32) {
    let shift = max_level.saturating_sub(level);
    let scale = 1u64 << shift.min(63);
    let w = (u64::from(width)).div_ceil(scale) as u32;
    let h = (u64::from(height)).div_ceil(scale) as u32;
    (w.max(1), h.max(1))
}

/// Slide file format as recognised from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlideFormat {
    Svs,
    Tiff,
    Ndpi,
    Mrxs,
    Jpg,
    Png,
    Unknown,
}

impl SlideFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        match ext.as_deref() {
            Some("svs") => SlideFormat::Svs,
            Some("tif") | Some("tiff") => SlideFormat::Tiff,
            Some("ndpi") => SlideFormat::Ndpi,
            Some("mrxs") => SlideFormat::Mrxs,
            Some("jpg") | Some("jpeg") => SlideFormat::Jpg,
            Some("png") => SlideFormat::Png,
            _ => SlideFormat::Unknown,
        }
    }

    /// Whole-slide formats carry native pyramid levels and go through the
    /// external toolchain; plain raster formats are handled in-process.
    pub fn is_wsi(self) -> bool {
        matches!(
            self,
            SlideFormat::Svs | SlideFormat::Tiff | SlideFormat::Ndpi | SlideFormat::Mrxs
        )
    }

    pub fn is_supported(self) -> bool {
        self != SlideFormat::Unknown
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlideFormat::Svs => "svs",
            SlideFormat::Tiff => "tiff",
            SlideFormat::Ndpi => "ndpi",
            SlideFormat::Mrxs => "mrxs",
            SlideFormat::Jpg => "jpg",
            SlideFormat::Png => "png",
            SlideFormat::Unknown => "unknown",
        }
    }
}

impl FromStr for SlideFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "svs" => Ok(SlideFormat::Svs),
            "tiff" => Ok(SlideFormat::Tiff),
            "ndpi" => Ok(SlideFormat::Ndpi),
            "mrxs" => Ok(SlideFormat::Mrxs),
            "jpg" => Ok(SlideFormat::Jpg),
            "png" => Ok(SlideFormat::Png),
            "unknown" => Ok(SlideFormat::Unknown),
            _ => Err(anyhow::anyhow!("unknown slide format: {}", s)),
        }
    }
}

impl fmt::Display for SlideFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(anyhow::anyhow!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        s
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum! {
    /// Slide lifecycle state. Forward progress only; `failed` is terminal
    /// until an operator retries.
    SlideStatus {
        Queued => "queued",
        Processing => "processing",
        Ingesting => "ingesting",
        Tilegen => "tilegen",
        Ready => "ready",
        Failed => "failed",
    }
}

str_enum! {
    /// Pyramid build sub-state; `absent` means not applicable (raster slide).
    TilegenStatus {
        Absent => "absent",
        Queued => "queued",
        Running => "running",
        Done => "done",
        Failed => "failed",
    }
}

str_enum! {
    OcrStatus {
        Absent => "absent",
        Pending => "pending",
        Done => "done",
    }
}

str_enum! {
    JobStatus {
        Queued => "queued",
        Running => "running",
        Done => "done",
        Failed => "failed",
    }
}

str_enum! {
    /// Work phases a slide moves through.
    JobType {
        P0 => "p0",
        P1 => "p1",
        Tilegen => "tilegen",
        Preview => "preview",
        Cleanup => "cleanup",
    }
}

impl JobType {
    /// Whether the worker must stat the raw file before running this job.
    pub fn needs_raw_file(self) -> bool {
        matches!(self, JobType::P0 | JobType::P1 | JobType::Tilegen)
    }
}

/// Payload carried on the job queue between the enqueuing side and the
/// worker dispatcher. The job row in Postgres is authoritative; this is
/// just enough for the worker to route without an extra lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: Uuid,
    pub slide_id: String,
    pub job_type: JobType,
    pub raw_path: String,
    pub format: SlideFormat,
    /// First level to pre-generate (P1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_level: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_level_for() {
        assert_eq!(max_level_for(1, 1), 0);
        assert_eq!(max_level_for(256, 256), 8);
        assert_eq!(max_level_for(257, 100), 9);
        assert_eq!(max_level_for(1024, 768), 10);
        assert_eq!(max_level_for(100_000, 80_000), 17);
    }

    #[test]
    fn test_level_dimensions() {
        // 1000x800 -> max_level 10
        let max_level = max_level_for(1000, 800);
        assert_eq!(level_dimensions(1000, 800, max_level, max_level), (1000, 800));
        assert_eq!(level_dimensions(1000, 800, max_level, max_level - 1), (500, 400));
        assert_eq!(level_dimensions(1000, 800, max_level, 0), (1, 1));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            SlideFormat::from_path(Path::new("/inbox/a.SVS")),
            SlideFormat::Svs
        );
        assert_eq!(
            SlideFormat::from_path(Path::new("x.jpeg")),
            SlideFormat::Jpg
        );
        assert_eq!(
            SlideFormat::from_path(Path::new("x.tif")),
            SlideFormat::Tiff
        );
        assert_eq!(
            SlideFormat::from_path(Path::new("readme.txt")),
            SlideFormat::Unknown
        );
        assert!(SlideFormat::Ndpi.is_wsi());
        assert!(!SlideFormat::Png.is_wsi());
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            SlideStatus::Queued,
            SlideStatus::Processing,
            SlideStatus::Ingesting,
            SlideStatus::Tilegen,
            SlideStatus::Ready,
            SlideStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<SlideStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<SlideStatus>().is_err());
    }

    #[test]
    fn test_job_payload_round_trip() {
        let payload = JobPayload {
            job_id: Uuid::new_v4(),
            slide_id: "ab".repeat(32),
            job_type: JobType::P1,
            raw_path: "/data/raw/x.jpg".into(),
            format: SlideFormat::Jpg,
            start_level: Some(5),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, payload.job_id);
        assert_eq!(back.job_type, JobType::P1);
        assert_eq!(back.start_level, Some(5));
    }
}
