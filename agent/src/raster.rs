use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder, RgbImage, imageops};

use orcein_common::types::{TILE_SIZE, level_dimensions};

/// JPEG quality for pre-generated raster tiles. On-demand WSI tiles are
/// encoded at 90 by the toolchain; raster pyramids trade a little quality
/// for ingest speed.
pub const RASTER_JPEG_QUALITY: u8 = 85;

/// Decode a raster slide (jpg/png). Blocking; call from a blocking task.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("failed to decode image {}", path.display()))
}

pub fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buffer), quality);
    encoder
        .write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .context("jpeg encoding failed")?;
    Ok(buffer)
}

/// Cover-resize then centre-crop to exactly `width`x`height` and write as
/// JPEG. Blocking.
pub fn write_thumbnail(img: &DynamicImage, dest: &Path, width: u32, height: u32) -> Result<()> {
    let scale = (f64::from(width) / f64::from(img.width()))
        .max(f64::from(height) / f64::from(img.height()));
    let (rw, rh) = (
        (f64::from(img.width()) * scale).ceil().max(1.0) as u32,
        (f64::from(img.height()) * scale).ceil().max(1.0) as u32,
    );
    let resized = img.resize_exact(rw, rh, FilterType::Lanczos3).to_rgb8();

    let crop_w = width.min(resized.width());
    let crop_h = height.min(resized.height());
    let x0 = (resized.width() - crop_w) / 2;
    let y0 = (resized.height() - crop_h) / 2;
    let cropped = imageops::crop_imm(&resized, x0, y0, crop_w, crop_h).to_image();

    let bytes = encode_jpeg(&cropped, RASTER_JPEG_QUALITY)?;
    std::fs::write(dest, bytes)
        .with_context(|| format!("failed to write thumbnail {}", dest.display()))?;
    Ok(())
}

/// Generate every tile of one deep-zoom level under `tiles_dir/{level}/`,
/// one tile at a time. Returns the number of tiles written. Blocking.
pub fn generate_level_tiles(
    img: &DynamicImage,
    max_level: u32,
    level: u32,
    tiles_dir: &Path,
) -> Result<usize> {
    let (lw, lh) = level_dimensions(img.width(), img.height(), max_level, level);

    let level_dir = tiles_dir.join(level.to_string());
    std::fs::create_dir_all(&level_dir)
        .with_context(|| format!("failed to create {}", level_dir.display()))?;

    let resized = if (lw, lh) == (img.width(), img.height()) {
        img.to_rgb8()
    } else {
        img.resize_exact(lw, lh, FilterType::Lanczos3).to_rgb8()
    };

    let tiles_x = lw.div_ceil(TILE_SIZE);
    let tiles_y = lh.div_ceil(TILE_SIZE);
    let mut written = 0usize;

    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * TILE_SIZE;
            let y0 = ty * TILE_SIZE;
            let w = TILE_SIZE.min(lw - x0);
            let h = TILE_SIZE.min(lh - y0);

            let tile = imageops::crop_imm(&resized, x0, y0, w, h).to_image();
            let bytes = encode_jpeg(&tile, RASTER_JPEG_QUALITY)?;

            let path = level_dir.join(format!("{tx}_{ty}.jpg"));
            std::fs::write(&path, bytes)
                .with_context(|| format!("failed to write tile {}", path.display()))?;
            written += 1;
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orcein_common::types::max_level_for;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn writes_full_level_grid() {
        let dir = tempfile::tempdir().unwrap();
        let img = gradient(600, 400);
        let max_level = max_level_for(600, 400); // 10

        // Full-resolution level: 3x2 tiles
        let written = generate_level_tiles(&img, max_level, max_level, dir.path()).unwrap();
        assert_eq!(written, 6);

        // Every written tile decodes as a JPEG no larger than 256px
        for entry in std::fs::read_dir(dir.path().join(max_level.to_string())).unwrap() {
            let tile = image::open(entry.unwrap().path()).unwrap();
            assert!(tile.width() <= TILE_SIZE);
            assert!(tile.height() <= TILE_SIZE);
        }

        // Edge tile is short: 600 - 512 = 88 wide
        let edge = image::open(dir.path().join(format!("{max_level}/2_1.jpg"))).unwrap();
        assert_eq!(edge.width(), 88);
        assert_eq!(edge.height(), 144);
    }

    #[test]
    fn thumbnail_is_exact_centre_crop() {
        let dir = tempfile::tempdir().unwrap();
        let img = gradient(1000, 400);
        let dest = dir.path().join("thumb.jpg");

        write_thumbnail(&img, &dest, 640, 400).unwrap();

        let thumb = image::open(&dest).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (640, 400));
    }

    #[test]
    fn thumbnail_upscales_small_sources() {
        let dir = tempfile::tempdir().unwrap();
        let img = gradient(320, 200);
        let dest = dir.path().join("thumb.jpg");

        write_thumbnail(&img, &dest, 640, 400).unwrap();

        let thumb = image::open(&dest).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (640, 400));
    }

    #[test]
    fn coarse_level_is_single_tile() {
        let dir = tempfile::tempdir().unwrap();
        let img = gradient(600, 400);
        let max_level = max_level_for(600, 400);

        let written = generate_level_tiles(&img, max_level, 0, dir.path()).unwrap();
        assert_eq!(written, 1);

        let tile = image::open(dir.path().join("0/0_0.jpg")).unwrap();
        assert_eq!((tile.width(), tile.height()), (1, 1));
    }

    #[test]
    fn level_four_fits_one_tile_grid() {
        let dir = tempfile::tempdir().unwrap();
        let img = gradient(600, 400);
        let max_level = max_level_for(600, 400);

        // Level 4 of a 600x400 image is 10x7 -> one tile
        let written = generate_level_tiles(&img, max_level, 4, dir.path()).unwrap();
        assert_eq!(written, 1);
        let tile = image::open(dir.path().join("4/0_0.jpg")).unwrap();
        assert_eq!((tile.width(), tile.height()), (10, 7));
    }
}
