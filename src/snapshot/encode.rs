use chrono::Local;
use image::{ImageFormat, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{CaptureError, Result};
use crate::snapshot::image::SnapshotImage;

/// Map a file extension to a still-image encoder.
fn format_for_extension(ext: &str) -> Option<ImageFormat> {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        "png" => Some(ImageFormat::Png),
        "bmp" => Some(ImageFormat::Bmp),
        _ => None,
    }
}

/// Write a snapshot to `path`, encoder chosen by the file extension.
///
/// Missing parent directories are created first (`Path` error when that is
/// impossible). Unsupported or missing extensions fail with `Encode`; write
/// failures surface as `Io`.
pub fn encode_to_file(image: &SnapshotImage, path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| CaptureError::Encode(format!("missing file extension: {}", path.display())))?;
    let format = format_for_extension(ext)
        .ok_or_else(|| CaptureError::Encode(format!("unsupported image format: {ext}")))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                CaptureError::Path(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
    }

    let rgb = RgbImage::from_raw(image.width(), image.height(), image.pixels().to_vec())
        .ok_or_else(|| {
            CaptureError::Encode("pixel buffer does not match image dimensions".into())
        })?;

    rgb.save_with_format(path, format).map_err(|e| match e {
        image::ImageError::IoError(io) => CaptureError::Io(io),
        other => CaptureError::Encode(other.to_string()),
    })?;

    debug!("snapshot written to {}", path.display());
    Ok(())
}

/// Filename for a snapshot taken now: `capture_<yyyyMMdd_HHmmss>.<ext>`.
pub fn snapshot_filename(ext: &str) -> String {
    format!("capture_{}.{ext}", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Write a snapshot into `dir` under the standard filename convention,
/// creating the directory if absent. Returns the full path written.
pub fn save_to_dir(image: &SnapshotImage, dir: &Path, ext: &str) -> Result<PathBuf> {
    let path = dir.join(snapshot_filename(ext));
    encode_to_file(image, &path)?;
    info!("snapshot saved: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sink::{FrameFormat, PixelFormat};

    fn small_image() -> SnapshotImage {
        let format = FrameFormat {
            width: 16,
            height: 12,
            pixel: PixelFormat::Rgb24,
        };
        SnapshotImage::render_pattern(format, "")
    }

    #[test]
    fn writes_jpeg_with_magic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.jpg");
        encode_to_file(&small_image(), &path).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn writes_png_with_magic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        encode_to_file(&small_image(), &path).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn writes_bmp_with_magic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.bmp");
        encode_to_file(&small_image(), &path).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], b"BM");
    }

    #[test]
    fn jpeg_extension_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.JPG");
        encode_to_file(&small_image(), &path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("shot.png");
        encode_to_file(&small_image(), &path).unwrap();
        assert!(path.exists());
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn unsupported_extension_is_an_encode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.tiff");
        assert!(matches!(
            encode_to_file(&small_image(), &path),
            Err(CaptureError::Encode(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn missing_extension_is_an_encode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot");
        assert!(matches!(
            encode_to_file(&small_image(), &path),
            Err(CaptureError::Encode(_))
        ));
    }

    /// Create a directory with write permission removed. Returns `None` when
    /// the permission bits are not enforced (e.g. tests running as root).
    #[cfg(unix)]
    fn locked_dir(parent: &Path) -> Option<std::path::PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let target = parent.join("locked");
        fs::create_dir(&target).unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o555)).unwrap();

        if fs::write(target.join(".probe"), b"").is_ok() {
            return None;
        }
        Some(target)
    }

    #[cfg(unix)]
    fn unlock_dir(target: &Path) {
        use std::os::unix::fs::PermissionsExt;
        // restore so the tempdir can clean up
        fs::set_permissions(target, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn read_only_directory_fails_with_io_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let Some(target) = locked_dir(dir.path()) else {
            return;
        };

        let result = encode_to_file(&small_image(), &target.join("shot.jpg"));
        assert!(matches!(result, Err(CaptureError::Io(_))), "got {result:?}");

        unlock_dir(&target);
    }

    #[cfg(unix)]
    #[test]
    fn uncreatable_parent_fails_with_path_error() {
        let dir = tempfile::tempdir().unwrap();
        let Some(target) = locked_dir(dir.path()) else {
            return;
        };

        let result = encode_to_file(&small_image(), &target.join("sub").join("shot.jpg"));
        assert!(matches!(result, Err(CaptureError::Path(_))), "got {result:?}");

        unlock_dir(&target);
    }

    #[test]
    fn filename_follows_capture_convention() {
        let name = snapshot_filename("jpg");
        assert!(name.starts_with("capture_"), "got: {name}");
        assert!(name.ends_with(".jpg"), "got: {name}");
        // capture_ + yyyyMMdd + _ + HHmmss + .jpg
        assert_eq!(name.len(), "capture_".len() + 8 + 1 + 6 + ".jpg".len());
    }

    #[test]
    fn save_to_dir_creates_dir_and_returns_path() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let path = save_to_dir(&small_image(), &out, "jpg").unwrap();

        assert!(path.starts_with(&out));
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }
}
