use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

use orcein_common::types::{TILE_SIZE, level_dimensions};

/// Largest native level (per side, pixels) we are willing to load whole
/// before cropping. Levels above this are cheaper to crop at level 0.
const MAX_NATIVE_LEVEL_DIM: u32 = 4000;

const JPEG_SUFFIX: &str = ".jpg[Q=90]";

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("io error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} timed out after {seconds}s")]
    Timeout { op: &'static str, seconds: u64 },
    #[error("{op} failed: {detail}")]
    Toolchain { op: &'static str, detail: String },
    #[error("tile ({x}, {y}) out of bounds at level {level}")]
    Bounds { level: u32, x: u32, y: u32 },
}

impl ToolchainError {
    fn io(op: &'static str, source: std::io::Error) -> Self {
        ToolchainError::Io { op, source }
    }
}

/// Structured result of reading a slide's header.
#[derive(Debug, Clone)]
pub struct SlideProperties {
    pub width: u32,
    pub height: u32,
    pub level_count: u32,
    pub level_dimensions: Vec<(u32, u32)>,
    pub level_downsamples: Vec<f64>,
    pub app_mag: Option<f64>,
    pub mpp: Option<f64>,
}

impl SlideProperties {
    /// Properties of a flat image with no native pyramid.
    pub fn flat(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            level_count: 1,
            level_dimensions: vec![(width, height)],
            level_downsamples: vec![1.0],
            app_mag: None,
            mpp: None,
        }
    }
}

/// External imaging operations, each executed as a child process. The rest
/// of the system only sees this trait and the typed results; all textual
/// parsing of toolchain output stays in this module.
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn read_properties(&self, src: &Path) -> Result<SlideProperties, ToolchainError>;

    /// Centre-cropped thumbnail of exactly `width`x`height`.
    async fn write_thumbnail(
        &self,
        src: &Path,
        dest: &Path,
        width: u32,
        height: u32,
    ) -> Result<(), ToolchainError>;

    /// One 256px JPEG tile at deep-zoom coordinates.
    async fn extract_tile(
        &self,
        src: &Path,
        props: &SlideProperties,
        max_level: u32,
        level: u32,
        x: u32,
        y: u32,
        dest: &Path,
    ) -> Result<(), ToolchainError>;

    /// Full deep-zoom tile tree for `src`, materialised at `out_dir` with
    /// levels numbered 0 (1x1) up to ceil(log2(max dim)) (full size).
    async fn build_pyramid(&self, src: &Path, out_dir: &Path) -> Result<(), ToolchainError>;

    /// Downscale `src` to exactly `width`x`height` (no crop).
    async fn downscale(
        &self,
        src: &Path,
        dest: &Path,
        width: u32,
        height: u32,
    ) -> Result<(), ToolchainError>;
}

/// Region of a source slide backing one output tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileGeometry {
    /// Origin in full-resolution pixel coordinates.
    pub x0: u64,
    pub y0: u64,
    /// Output tile size (short at the right/bottom edges).
    pub out_w: u32,
    pub out_h: u32,
    /// Full-resolution pixels per output pixel.
    pub downsample: f64,
}

/// Resolve deep-zoom tile coordinates into a full-resolution region, or
/// `None` when the tile lies outside the level grid.
pub fn tile_geometry(
    width: u32,
    height: u32,
    max_level: u32,
    level: u32,
    x: u32,
    y: u32,
) -> Option<TileGeometry> {
    if level > max_level {
        return None;
    }
    let (lw, lh) = level_dimensions(width, height, max_level, level);
    let tx0 = x.checked_mul(TILE_SIZE)?;
    let ty0 = y.checked_mul(TILE_SIZE)?;
    if tx0 >= lw || ty0 >= lh {
        return None;
    }
    let downsample = f64::from(1u32 << (max_level - level).min(31));
    Some(TileGeometry {
        x0: u64::from(tx0) * downsample as u64,
        y0: u64::from(ty0) * downsample as u64,
        out_w: TILE_SIZE.min(lw - tx0),
        out_h: TILE_SIZE.min(lh - ty0),
        downsample,
    })
}

/// Pick the deepest native level whose downsample does not exceed the
/// target and whose dimensions are small enough to load whole.
pub fn pick_native_level(props: &SlideProperties, target_downsample: f64) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &downsample) in props.level_downsamples.iter().enumerate() {
        let Some(&(lw, lh)) = props.level_dimensions.get(idx) else {
            continue;
        };
        if downsample > target_downsample + f64::EPSILON {
            continue;
        }
        if lw > MAX_NATIVE_LEVEL_DIM || lh > MAX_NATIVE_LEVEL_DIM {
            continue;
        }
        match best {
            Some((_, best_ds)) if downsample <= best_ds => {}
            _ => best = Some((idx, downsample)),
        }
    }
    best
}

/// libvips CLI adapter. Requires `vips` and `vipsheader` on PATH (or the
/// configured binaries) built with openslide support.
pub struct VipsToolchain {
    vips_bin: String,
    vipsheader_bin: String,
    tile_timeout: Duration,
    pyramid_timeout: Duration,
}

impl VipsToolchain {
    pub fn new(
        vips_bin: String,
        vipsheader_bin: String,
        tile_timeout: Duration,
        pyramid_timeout: Duration,
    ) -> Self {
        Self {
            vips_bin,
            vipsheader_bin,
            tile_timeout,
            pyramid_timeout,
        }
    }

    async fn run(
        &self,
        op: &'static str,
        timeout: Duration,
        cmd: &mut Command,
    ) -> Result<String, ToolchainError> {
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ToolchainError::io(op, e))?;

        // Dropping the future on timeout kills the child (kill_on_drop)
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ToolchainError::io(op, e))?,
            Err(_) => {
                return Err(ToolchainError::Timeout {
                    op,
                    seconds: timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if detail.is_empty() {
                detail = format!("exit status {}", output.status);
            }
            detail.truncate(500);
            return Err(ToolchainError::Toolchain { op, detail });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn vips(&self) -> Command {
        Command::new(&self.vips_bin)
    }
}

#[async_trait]
impl Toolchain for VipsToolchain {
    async fn read_properties(&self, src: &Path) -> Result<SlideProperties, ToolchainError> {
        // Primary: full header dump with the openslide fields
        let mut cmd = Command::new(&self.vipsheader_bin);
        cmd.arg("-a").arg(src);
        match self.run("read_properties", self.tile_timeout, &mut cmd).await {
            Ok(output) => parse_header_fields(&output),
            Err(primary_err) => {
                tracing::warn!(
                    src = %src.display(),
                    error = %primary_err,
                    "full header read failed, falling back to summary header"
                );
                let mut cmd = Command::new(&self.vipsheader_bin);
                cmd.arg(src);
                let output = self
                    .run("read_properties_fallback", self.tile_timeout, &mut cmd)
                    .await?;
                parse_header_summary(&output)
            }
        }
    }

    async fn write_thumbnail(
        &self,
        src: &Path,
        dest: &Path,
        width: u32,
        height: u32,
    ) -> Result<(), ToolchainError> {
        let mut cmd = self.vips();
        cmd.arg("thumbnail")
            .arg(src)
            .arg(format!("{}{}", dest.display(), JPEG_SUFFIX))
            .arg(width.to_string())
            .arg("--height")
            .arg(height.to_string())
            .arg("--crop")
            .arg("centre");
        self.run("thumbnail", self.tile_timeout, &mut cmd).await?;
        Ok(())
    }

    async fn extract_tile(
        &self,
        src: &Path,
        props: &SlideProperties,
        max_level: u32,
        level: u32,
        x: u32,
        y: u32,
        dest: &Path,
    ) -> Result<(), ToolchainError> {
        let geometry = tile_geometry(props.width, props.height, max_level, level, x, y)
            .ok_or(ToolchainError::Bounds { level, x, y })?;

        // Pyramid path: read from a native level close to the target scale.
        // Direct path: crop level 0 and shrink the whole way down.
        let (native_idx, native_ds) = if props.level_count > 1 {
            pick_native_level(props, geometry.downsample).unwrap_or((0, 1.0))
        } else {
            (0, 1.0)
        };

        let shrink = geometry.downsample / native_ds;
        let crop_left = (geometry.x0 as f64 / native_ds).floor() as u64;
        let crop_top = (geometry.y0 as f64 / native_ds).floor() as u64;
        let crop_w = (f64::from(geometry.out_w) * shrink).ceil() as u64;
        let crop_h = (f64::from(geometry.out_h) * shrink).ceil() as u64;

        // Clamp to the native level so edge tiles stay inside the image
        let (nw, nh) = props
            .level_dimensions
            .get(native_idx)
            .copied()
            .unwrap_or((props.width, props.height));
        let crop_w = crop_w.min(u64::from(nw).saturating_sub(crop_left)).max(1);
        let crop_h = crop_h.min(u64::from(nh).saturating_sub(crop_top)).max(1);

        let src_spec = if native_idx > 0 {
            format!("{}[level={}]", src.display(), native_idx)
        } else {
            src.display().to_string()
        };

        if shrink <= 1.0 + f64::EPSILON {
            let mut cmd = self.vips();
            cmd.arg("crop")
                .arg(&src_spec)
                .arg(format!("{}{}", dest.display(), JPEG_SUFFIX))
                .arg(crop_left.to_string())
                .arg(crop_top.to_string())
                .arg(crop_w.to_string())
                .arg(crop_h.to_string());
            self.run("extract_tile", self.tile_timeout, &mut cmd).await?;
            return Ok(());
        }

        // Crop into an intermediate vips image, then resize down to the tile
        let staging = dest.with_file_name(format!(".tile-{}.v", Uuid::new_v4()));
        let mut cmd = self.vips();
        cmd.arg("crop")
            .arg(&src_spec)
            .arg(&staging)
            .arg(crop_left.to_string())
            .arg(crop_top.to_string())
            .arg(crop_w.to_string())
            .arg(crop_h.to_string());
        let crop_result = self.run("extract_tile", self.tile_timeout, &mut cmd).await;

        let resize_result = match crop_result {
            Ok(_) => {
                let mut cmd = self.vips();
                cmd.arg("resize")
                    .arg(&staging)
                    .arg(format!("{}{}", dest.display(), JPEG_SUFFIX))
                    .arg(format!("{}", 1.0 / shrink));
                self.run("extract_tile", self.tile_timeout, &mut cmd)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_file(&staging).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %staging.display(), error = %e, "failed to remove staging image");
        }

        resize_result
    }

    async fn build_pyramid(&self, src: &Path, out_dir: &Path) -> Result<(), ToolchainError> {
        let parent = out_dir.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolchainError::io("build_pyramid", e))?;
        let base = parent.join(format!(".dz-{}", Uuid::new_v4()));

        let mut cmd = self.vips();
        cmd.arg("dzsave")
            .arg(src)
            .arg(&base)
            .arg("--tile-size")
            .arg(TILE_SIZE.to_string())
            .arg("--overlap")
            .arg("0")
            .arg("--suffix")
            .arg(JPEG_SUFFIX)
            .arg("--depth")
            .arg("onetile");
        let result = self.run("build_pyramid", self.pyramid_timeout, &mut cmd).await;

        let tiles_dir = PathBuf::from(format!("{}_files", base.display()));
        let dzi_file = base.with_extension("dzi");

        if let Err(e) = result {
            let _ = tokio::fs::remove_dir_all(&tiles_dir).await;
            let _ = tokio::fs::remove_file(&dzi_file).await;
            return Err(e);
        }

        if tokio::fs::try_exists(out_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(out_dir)
                .await
                .map_err(|e| ToolchainError::io("build_pyramid", e))?;
        }
        tokio::fs::rename(&tiles_dir, out_dir)
            .await
            .map_err(|e| ToolchainError::io("build_pyramid", e))?;
        let _ = tokio::fs::remove_file(&dzi_file).await;

        Ok(())
    }

    async fn downscale(
        &self,
        src: &Path,
        dest: &Path,
        width: u32,
        height: u32,
    ) -> Result<(), ToolchainError> {
        let mut cmd = self.vips();
        cmd.arg("thumbnail")
            .arg(src)
            .arg(format!("{}{}", dest.display(), JPEG_SUFFIX))
            .arg(width.to_string())
            .arg("--height")
            .arg(height.to_string())
            .arg("--size")
            .arg("force");
        self.run("downscale", self.tile_timeout, &mut cmd).await?;
        Ok(())
    }
}

/// Strip surrounding quotes and whitespace from a header value.
fn clean_value(raw: &str) -> &str {
    raw.trim().trim_matches('"').trim_matches('\'').trim()
}

fn parse_num<T: std::str::FromStr>(fields: &[(String, String)], key: &str) -> Option<T> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
}

/// Parse `vipsheader -a` output: one `key: value` pair per line, with the
/// openslide properties interleaved. Missing optional keys yield `None`.
fn parse_header_fields(output: &str) -> Result<SlideProperties, ToolchainError> {
    let fields: Vec<(String, String)> = output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), clean_value(value).to_string()))
        })
        .collect();

    let width: u32 = parse_num(&fields, "width").ok_or_else(|| ToolchainError::Toolchain {
        op: "read_properties",
        detail: "header output missing width".to_string(),
    })?;
    let height: u32 = parse_num(&fields, "height").ok_or_else(|| ToolchainError::Toolchain {
        op: "read_properties",
        detail: "header output missing height".to_string(),
    })?;

    let level_count: u32 = parse_num(&fields, "openslide.level-count").unwrap_or(1);

    let mut level_dimensions = Vec::with_capacity(level_count as usize);
    let mut level_downsamples = Vec::with_capacity(level_count as usize);
    for level in 0..level_count {
        let lw: Option<u32> = parse_num(&fields, &format!("openslide.level[{level}].width"));
        let lh: Option<u32> = parse_num(&fields, &format!("openslide.level[{level}].height"));
        let ds: Option<f64> = parse_num(&fields, &format!("openslide.level[{level}].downsample"));
        match (lw, lh) {
            (Some(lw), Some(lh)) => {
                level_dimensions.push((lw, lh));
                level_downsamples.push(ds.unwrap_or_else(|| f64::from(width) / f64::from(lw.max(1))));
            }
            _ if level == 0 => {
                level_dimensions.push((width, height));
                level_downsamples.push(1.0);
            }
            // A declared level without dimensions ends the usable pyramid
            _ => break,
        }
    }
    if level_dimensions.is_empty() {
        level_dimensions.push((width, height));
        level_downsamples.push(1.0);
    }

    let app_mag = parse_num(&fields, "openslide.objective-power")
        .or_else(|| parse_num(&fields, "aperio.AppMag"));
    let mpp = parse_num(&fields, "openslide.mpp-x");

    Ok(SlideProperties {
        width,
        height,
        level_count: level_dimensions.len() as u32,
        level_dimensions,
        level_downsamples,
        app_mag,
        mpp,
    })
}

/// Parse the one-line `vipsheader` summary, e.g.
/// `sample.jpg: 640x480 uchar, 3 bands, srgb, jpegload`.
fn parse_header_summary(output: &str) -> Result<SlideProperties, ToolchainError> {
    for token in output.split_whitespace() {
        if let Some((w, h)) = token.split_once('x')
            && let (Ok(w), Ok(h)) = (w.parse::<u32>(), h.parse::<u32>())
        {
            return Ok(SlideProperties::flat(w, h));
        }
    }
    Err(ToolchainError::Toolchain {
        op: "read_properties_fallback",
        detail: format!("unparseable header summary: {}", output.trim()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SVS_HEADER: &str = r#"width: 46000
height: 32914
bands: 4
format: uchar
coding: none
openslide.level-count: 3
openslide.level[0].downsample: 1
openslide.level[0].width: 46000
openslide.level[0].height: 32914
openslide.level[1].downsample: "4.0001"
openslide.level[1].width: 11500
openslide.level[1].height: 8228
openslide.level[2].downsample: 16.000972
openslide.level[2].width: 2875
openslide.level[2].height: 2057
openslide.objective-power: "20"
openslide.mpp-x: 0.4990
openslide.mpp-y: 0.4990
aperio.AppMag: 20
"#;

    #[test]
    fn parses_openslide_header() {
        let props = parse_header_fields(SVS_HEADER).unwrap();
        assert_eq!(props.width, 46000);
        assert_eq!(props.height, 32914);
        assert_eq!(props.level_count, 3);
        assert_eq!(props.level_dimensions[2], (2875, 2057));
        // Quoted values are stripped before parsing
        assert!((props.level_downsamples[1] - 4.0001).abs() < 1e-9);
        assert_eq!(props.app_mag, Some(20.0));
        assert_eq!(props.mpp, Some(0.499));
    }

    #[test]
    fn missing_optional_keys_yield_none() {
        let props = parse_header_fields("width: 640\nheight: 480\nbands: 3\n").unwrap();
        assert_eq!(props.level_count, 1);
        assert_eq!(props.level_dimensions, vec![(640, 480)]);
        assert_eq!(props.app_mag, None);
        assert_eq!(props.mpp, None);
    }

    #[test]
    fn missing_width_is_toolchain_error() {
        let err = parse_header_fields("height: 480\n").unwrap_err();
        assert!(matches!(err, ToolchainError::Toolchain { .. }));
    }

    #[test]
    fn parses_summary_fallback() {
        let props =
            parse_header_summary("sample.jpg: 640x480 uchar, 3 bands, srgb, jpegload").unwrap();
        assert_eq!((props.width, props.height), (640, 480));
        assert_eq!(props.level_count, 1);

        assert!(parse_header_summary("garbage output").is_err());
    }

    #[test]
    fn tile_geometry_bounds() {
        // 1000x800 -> max_level 10; level 10 grid is 4x4 tiles
        assert!(tile_geometry(1000, 800, 10, 10, 3, 3).is_some());
        assert!(tile_geometry(1000, 800, 10, 10, 4, 0).is_none());
        assert!(tile_geometry(1000, 800, 10, 10, 0, 4).is_none());
        assert!(tile_geometry(1000, 800, 10, 11, 0, 0).is_none());

        let g = tile_geometry(1000, 800, 10, 10, 3, 0).unwrap();
        assert_eq!(g.downsample, 1.0);
        assert_eq!(g.x0, 768);
        assert_eq!(g.out_w, 1000 - 768); // edge tile is short
        assert_eq!(g.out_h, 256);

        let g = tile_geometry(1000, 800, 10, 9, 0, 0).unwrap();
        assert_eq!(g.downsample, 2.0);
        assert_eq!(g.out_w, 256);
    }

    #[test]
    fn native_level_selection() {
        let props = parse_header_fields(SVS_HEADER).unwrap();

        // Target downsample 32: level 2 (ds 16, 2875x2057) fits under the cap
        let (idx, ds) = pick_native_level(&props, 32.0).unwrap();
        assert_eq!(idx, 2);
        assert!((ds - 16.000972).abs() < 1e-6);

        // Target downsample 8: level 1 has ds 4 but is 11500px wide, too
        // large to load whole; level 0 is too large as well -> direct path
        assert!(pick_native_level(&props, 8.0).is_none());

        // Target downsample 1: no native level at or below ds 1 fits
        assert!(pick_native_level(&props, 1.0).is_none());
    }
}
