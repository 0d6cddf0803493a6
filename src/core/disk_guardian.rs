/*!
 * Disk Guardian: free-space checks before writing output
 *
 * The platform query sits behind [`AvailableSpace`]; the implementation is
 * picked at compile time (statvfs on Unix, sysinfo's disk list elsewhere).
 * Tests substitute their own implementation to simulate a nearly full disk.
 */

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ParsecError, Result};

/// Free-space query for the volume holding a path
pub trait AvailableSpace: Send + Sync {
    /// Bytes available to an unprivileged writer at `path`
    fn available_space(&self, path: &Path) -> Result<u64>;
}

/// Free-space query of the host operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformSpace;

#[cfg(unix)]
impl AvailableSpace for PlatformSpace {
    fn available_space(&self, path: &Path) -> Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let probe = existing_ancestor(path)?;
        let c_path = CString::new(probe.as_os_str().as_bytes()).map_err(|_| {
            ParsecError::PathInvalid {
                path: probe.clone(),
                reason: "path contains an interior NUL byte".into(),
            }
        })?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is NUL-terminated and stat is a valid out pointer
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
impl AvailableSpace for PlatformSpace {
    fn available_space(&self, path: &Path) -> Result<u64> {
        use sysinfo::Disks;

        let probe = existing_ancestor(path)?;
        let probe = probe.canonicalize().unwrap_or(probe);
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point containing the path wins
        disks
            .iter()
            .filter(|disk| probe.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| ParsecError::PathInvalid {
                path: probe.clone(),
                reason: "no mounted volume contains this path".into(),
            })
    }
}

/// Closest ancestor of `path` that exists (the output file usually doesn't yet)
fn existing_ancestor(path: &Path) -> Result<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    if path.is_relative() {
        return Ok(PathBuf::from("."));
    }
    Err(ParsecError::PathInvalid {
        path: path.to_path_buf(),
        reason: "no existing ancestor directory".into(),
    })
}

/// Bytes needed for `required` plus the safety margin
pub fn required_with_margin(required: u64, margin: f64) -> u64 {
    let extra = (required as f64 * margin).ceil() as u64;
    required.saturating_add(extra)
}

/// Fail with `InsufficientDiskSpace` unless `path` has room for `required`
/// bytes plus `margin` (a fraction, e.g. 0.10)
pub fn ensure_sufficient_space(
    space: &dyn AvailableSpace,
    path: &Path,
    required: u64,
    margin: f64,
) -> Result<()> {
    let total_required = required_with_margin(required, margin);
    let available = space.available_space(path)?;

    debug!(
        path = %path.display(),
        required = total_required,
        available,
        "disk space check"
    );

    if available < total_required {
        warn!(
            path = %path.display(),
            required = total_required,
            available,
            "insufficient disk space"
        );
        return Err(ParsecError::InsufficientDiskSpace {
            path: path.to_path_buf(),
            required: total_required,
            available,
        });
    }

    Ok(())
}
