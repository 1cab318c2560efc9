//! Utility functions for arcsavvy
//!
//! Filesystem helpers shared by the scanner, object store, snapshot manager
//! and archiver:
//!
//! - Atomic file writing (temp file in the same directory, then rename)
//! - Permission handling (cross-platform)
//! - Archive path normalisation
//! - Human-readable byte formatting
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use crate::utils::{archive_path, atomic_write};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let rel = archive_path(Path::new("/src/docs/a.txt"), Path::new("/src"))?;
//! assert_eq!(rel, "docs/a.txt");
//!
//! atomic_write(Path::new("index.json"), b"{}")?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ArcsavvyError, Result};
use std::fs;
use std::io::Write;
use std::path::{Component, Path};
use tempfile::NamedTempFile;
use tracing::trace;

/// Atomic file write (write to temp file then rename)
///
/// The temporary file is created next to `path` so the final rename never
/// crosses a filesystem boundary. Readers see either the old content or the
/// new content, never a partial write.
///
/// # Errors
///
/// - [`ArcsavvyError::Io`] if the temp file cannot be written or persisted
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| ArcsavvyError::Io(e.error))?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Convert `path` under `base` into a slash-separated archive path
///
/// # Errors
///
/// - [`ArcsavvyError::Internal`] if `path` is not under `base` or contains
///   components that cannot appear in an archive path
pub fn archive_path(path: &Path, base: &Path) -> Result<String> {
    let relative = path.strip_prefix(base).map_err(|_| {
        ArcsavvyError::internal(format!("Path {:?} is not relative to {:?}", path, base))
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            other => {
                return Err(ArcsavvyError::internal(format!(
                    "Unexpected component {:?} in {:?}",
                    other, relative
                )))
            }
        }
    }

    Ok(parts.join("/"))
}

/// Whether an archive path is safe to join onto a restore target
///
/// Rejects absolute paths, `..` components and empty segments.
pub fn is_safe_archive_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Get Unix permissions from metadata
#[cfg(unix)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Get permissions from metadata (Windows implementation)
#[cfg(windows)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    let mut mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
    if metadata.is_dir() {
        mode |= 0o111;
    }
    mode
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set permissions (Windows implementation)
///
/// Only the read-only attribute can be expressed; it follows the owner
/// write bit.
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based).
///
/// ```rust,ignore
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
