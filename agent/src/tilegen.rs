use std::path::Path;

use anyhow::{Context, Result};

use crate::vips::Toolchain;

/// Build the full deep-zoom tile tree for a slide under
/// `derived/{id}/tiles`, staging into `tiles_tmp` and swapping atomically.
///
/// The previous tree (if any) keeps serving reads until the swap; a crash
/// at any point is repaired by the next run.
pub async fn build_full_pyramid(
    toolchain: &dyn Toolchain,
    raw_path: &Path,
    slide_dir: &Path,
) -> Result<()> {
    let tiles_tmp = slide_dir.join("tiles_tmp");

    // A stale tiles_tmp from a crashed build is garbage; the saver wants a
    // fresh target
    if tokio::fs::try_exists(&tiles_tmp).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&tiles_tmp)
            .await
            .context("failed to remove stale tiles_tmp")?;
    }

    toolchain
        .build_pyramid(raw_path, &tiles_tmp)
        .await
        .context("deep-zoom build failed")?;

    swap_tiles_dir(slide_dir).await
}

/// Swap `tiles_tmp` into `tiles`, going through `tiles_old` so an existing
/// tree is never deleted before its replacement is in place. Idempotent:
/// re-running after a crash between any two steps converges to `tiles`
/// present and both transients gone.
pub async fn swap_tiles_dir(slide_dir: &Path) -> Result<()> {
    let tiles = slide_dir.join("tiles");
    let tiles_tmp = slide_dir.join("tiles_tmp");
    let tiles_old = slide_dir.join("tiles_old");

    // Leftover from a prior crash after the old tree was parked
    if tokio::fs::try_exists(&tiles_old).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&tiles_old)
            .await
            .context("failed to remove stale tiles_old")?;
    }

    let have_tmp = tokio::fs::try_exists(&tiles_tmp).await.unwrap_or(false);
    let have_tiles = tokio::fs::try_exists(&tiles).await.unwrap_or(false);

    if !have_tmp {
        // Crash after the final rename already landed the new tree
        if have_tiles {
            return Ok(());
        }
        anyhow::bail!(
            "no tile tree to swap in {} (tiles_tmp and tiles both absent)",
            slide_dir.display()
        );
    }

    if have_tiles {
        tokio::fs::rename(&tiles, &tiles_old)
            .await
            .context("failed to park existing tiles")?;
    }

    tokio::fs::rename(&tiles_tmp, &tiles)
        .await
        .context("failed to promote tiles_tmp")?;

    if tokio::fs::try_exists(&tiles_old).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&tiles_old)
            .await
            .context("failed to remove parked tiles")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn mkdir_with_marker(dir: &Path, marker: &str) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        tokio::fs::write(dir.join("marker"), marker).await.unwrap();
    }

    async fn marker(dir: &Path) -> String {
        String::from_utf8(tokio::fs::read(dir.join("marker")).await.unwrap()).unwrap()
    }

    async fn exists(path: &PathBuf) -> bool {
        tokio::fs::try_exists(path).await.unwrap()
    }

    #[tokio::test]
    async fn swap_replaces_existing_tree() {
        let dir = tempfile::tempdir().unwrap();
        mkdir_with_marker(&dir.path().join("tiles"), "old").await;
        mkdir_with_marker(&dir.path().join("tiles_tmp"), "new").await;

        swap_tiles_dir(dir.path()).await.unwrap();

        assert_eq!(marker(&dir.path().join("tiles")).await, "new");
        assert!(!exists(&dir.path().join("tiles_tmp")).await);
        assert!(!exists(&dir.path().join("tiles_old")).await);
    }

    #[tokio::test]
    async fn swap_with_no_prior_tree() {
        let dir = tempfile::tempdir().unwrap();
        mkdir_with_marker(&dir.path().join("tiles_tmp"), "new").await;

        swap_tiles_dir(dir.path()).await.unwrap();

        assert_eq!(marker(&dir.path().join("tiles")).await, "new");
        assert!(!exists(&dir.path().join("tiles_old")).await);
    }

    #[tokio::test]
    async fn recovers_from_crash_between_park_and_promote() {
        // Crash point: tiles was renamed to tiles_old, tiles_tmp not yet
        // promoted. State on restart: tiles_old + tiles_tmp, no tiles.
        let dir = tempfile::tempdir().unwrap();
        mkdir_with_marker(&dir.path().join("tiles_old"), "old").await;
        mkdir_with_marker(&dir.path().join("tiles_tmp"), "new").await;

        swap_tiles_dir(dir.path()).await.unwrap();

        assert_eq!(marker(&dir.path().join("tiles")).await, "new");
        assert!(!exists(&dir.path().join("tiles_tmp")).await);
        assert!(!exists(&dir.path().join("tiles_old")).await);
    }

    #[tokio::test]
    async fn recovers_from_crash_after_promote() {
        // Crash point: tiles_tmp promoted, tiles_old not yet deleted
        let dir = tempfile::tempdir().unwrap();
        mkdir_with_marker(&dir.path().join("tiles"), "new").await;
        mkdir_with_marker(&dir.path().join("tiles_old"), "old").await;

        swap_tiles_dir(dir.path()).await.unwrap();

        assert_eq!(marker(&dir.path().join("tiles")).await, "new");
        assert!(!exists(&dir.path().join("tiles_old")).await);
    }

    #[tokio::test]
    async fn swap_without_any_tree_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(swap_tiles_dir(dir.path()).await.is_err());
    }
}
