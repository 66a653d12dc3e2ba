//! Mount-status probe.
//!
//! Every destructive command refuses to touch a device that is currently
//! mounted. The probe matches the canonicalized target path against the
//! source column of the kernel mount table.

use btr_error::{BtrError, Result};
use std::path::Path;

/// True when `target` appears as a mount source in `table` (the format of
/// `/proc/self/mounts`: source, mountpoint, fstype, options, ...).
fn is_mounted_in(table: &str, target: &Path) -> bool {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|source| Path::new(source) == target)
}

/// Refuse to proceed when the target device is mounted.
///
/// A missing or unreadable mount table (non-Linux hosts, constrained
/// environments) is treated as not mounted; the probe is advisory, the
/// kernel still arbitrates exclusive access.
pub fn ensure_not_mounted(path: &Path) -> Result<()> {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let Ok(table) = std::fs::read_to_string("/proc/self/mounts") else {
        return Ok(());
    };
    if is_mounted_in(&table, &canonical) {
        return Err(BtrError::Busy(format!(
            "{} is mounted; unmount it first",
            canonical.display()
        )));
    }
    Ok(())
}
