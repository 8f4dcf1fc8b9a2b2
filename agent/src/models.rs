use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orcein_common::types::{
    JobStatus, JobType, OcrStatus, SlideFormat, SlideStatus, TilegenStatus,
};

/// A registered slide, keyed by the SHA-256 of its raw file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slide {
    /// 64 lowercase hex chars; immutable once created.
    pub id: String,
    pub original_filename: String,
    pub raw_path: String,
    pub format: SlideFormat,
    pub status: SlideStatus,
    pub width: i32,
    pub height: i32,
    pub max_level: i32,
    pub level_ready_max: i32,
    pub tile_size: i32,
    pub tilegen_status: TilegenStatus,
    /// Native objective magnification, when the scanner recorded it.
    pub app_mag: Option<f64>,
    /// Microns per pixel.
    pub mpp: Option<f64>,
    pub external_case_id: Option<String>,
    pub external_case_base: Option<String>,
    pub external_slide_label: Option<String>,
    pub ocr_status: OcrStatus,
    pub dsmeta_path: Option<String>,
    pub barcode: Option<String>,
    /// Size of the raw file in bytes.
    pub file_size: i64,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
}

/// Typed partial update for a slide row. Only populated fields are written;
/// the registry turns the populated set into the SQL set-list.
#[derive(Debug, Clone, Default)]
pub struct SlideUpdate {
    pub status: Option<SlideStatus>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub max_level: Option<i32>,
    pub level_ready_max: Option<i32>,
    pub tilegen_status: Option<TilegenStatus>,
    pub app_mag: Option<Option<f64>>,
    pub mpp: Option<Option<f64>>,
    pub external_case_id: Option<Option<String>>,
    pub external_case_base: Option<Option<String>>,
    pub external_slide_label: Option<Option<String>>,
    pub ocr_status: Option<OcrStatus>,
    pub dsmeta_path: Option<Option<String>>,
    pub barcode: Option<Option<String>>,
    pub file_size: Option<i64>,
}

impl SlideUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.max_level.is_none()
            && self.level_ready_max.is_none()
            && self.tilegen_status.is_none()
            && self.app_mag.is_none()
            && self.mpp.is_none()
            && self.external_case_id.is_none()
            && self.external_case_base.is_none()
            && self.external_slide_label.is_none()
            && self.ocr_status.is_none()
            && self.dsmeta_path.is_none()
            && self.barcode.is_none()
            && self.file_size.is_none()
    }
}

/// A unit of work against a slide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub slide_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Unix epoch timestamp in milliseconds.
    pub updated_at: i64,
}

/// A scanner-mount path the scraper has already processed. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerFile {
    pub path: String,
    pub slide_id: String,
    pub barcode: Option<String>,
    pub guid: Option<String>,
    pub scanned_at: Option<String>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
}

/// Append-only domain event consumed by the external sync process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub op: String,
    pub payload: serde_json::Value,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Set once the external sync has delivered the event.
    pub synced_at: Option<i64>,
}

/// Deep-zoom manifest served next to the local tile tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalManifest {
    pub protocol: String,
    pub tile_size: u32,
    pub overlap: u32,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub level_min: u32,
    pub level_max: u32,
    pub tile_path_pattern: String,
    pub tile_url_template: String,
    pub on_demand: bool,
    pub app_mag: Option<f64>,
    pub mpp: Option<f64>,
}

impl LocalManifest {
    pub fn new(
        slide_id: &str,
        width: u32,
        height: u32,
        on_demand: bool,
        app_mag: Option<f64>,
        mpp: Option<f64>,
    ) -> Self {
        Self {
            protocol: "dzi".to_string(),
            tile_size: orcein_common::types::TILE_SIZE,
            overlap: 0,
            format: "jpg".to_string(),
            width,
            height,
            level_min: 0,
            level_max: orcein_common::types::max_level_for(width, height),
            tile_path_pattern: "tiles/{z}/{x}_{y}.jpg".to_string(),
            tile_url_template: format!("/v1/slides/{}/tiles/{{z}}/{{x}}/{{y}}.jpg", slide_id),
            on_demand,
            app_mag,
            mpp,
        }
    }
}

/// Where the remote preview lives in object storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub provider: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: String,
}

/// Manifest uploaded with the rebased preview pyramid. Width/height and
/// `levelMax` describe the rebased pyramid; the original dimensions ride
/// along for reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteManifest {
    pub protocol: String,
    pub tile_size: u32,
    pub overlap: u32,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub level_min: u32,
    pub level_max: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub original_level_max: u32,
    pub storage: StorageInfo,
    pub tiles_prefix: String,
    pub tile_path_pattern: String,
    pub on_demand: bool,
    pub app_mag: Option<f64>,
    pub mpp: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    Complete,
    Incomplete,
}

/// Idempotency record for the remote preview publisher, persisted as
/// `derived/{id}/preview_published.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewMarker {
    pub status: MarkerStatus,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub max_level: u32,
    pub target_max_dim: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiles_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_event_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_manifest_shape() {
        let m = LocalManifest::new("ab12", 40_000, 30_000, true, Some(40.0), Some(0.25));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["protocol"], "dzi");
        assert_eq!(json["tileSize"], 256);
        assert_eq!(json["levelMin"], 0);
        assert_eq!(json["levelMax"], 16);
        assert_eq!(json["tilePathPattern"], "tiles/{z}/{x}_{y}.jpg");
        assert_eq!(
            json["tileUrlTemplate"],
            "/v1/slides/ab12/tiles/{z}/{x}/{y}.jpg"
        );
        assert_eq!(json["onDemand"], true);
        assert_eq!(json["appMag"], 40.0);
    }

    #[test]
    fn marker_round_trip() {
        let marker = PreviewMarker {
            status: MarkerStatus::Complete,
            started_at: 1,
            published_at: Some(2),
            failed_at: None,
            error: None,
            max_level: 6,
            target_max_dim: 2048,
            thumb_hash: Some("aa".into()),
            manifest_hash: Some("bb".into()),
            tiles_hash: Some("cc".into()),
            outbox_event_id: Some(7),
        };
        let json = serde_json::to_string(&marker).unwrap();
        let back: PreviewMarker = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, MarkerStatus::Complete);
        assert_eq!(back.tiles_hash.as_deref(), Some("cc"));
        assert!(!json.contains("failedAt"));
    }

    #[test]
    fn empty_update_is_empty() {
        assert!(SlideUpdate::default().is_empty());
        let update = SlideUpdate {
            status: Some(SlideStatus::Ready),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
