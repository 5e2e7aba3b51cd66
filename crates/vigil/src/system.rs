//! Host probes: disk space, process memory, tmp storage

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Host measurements a session relies on
#[derive(Clone)]
pub struct HostProbes {
    pub free_space_ok: Arc<dyn Fn(&Path, u64) -> bool + Send + Sync>,
    pub rss_bytes: Arc<dyn Fn() -> Option<u64> + Send + Sync>,
}

impl Default for HostProbes {
    fn default() -> Self {
        Self {
            free_space_ok: Arc::new(free_space_ok),
            rss_bytes: Arc::new(process_rss_bytes),
        }
    }
}

/// Bytes available to unprivileged users on the volume holding `path`.
///
/// `path` may not exist yet; the nearest existing ancestor is probed.
#[cfg(unix)]
pub fn available_bytes(path: &Path) -> Result<u64> {
    use std::ffi::CString;

    let probe = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    let c_path = CString::new(probe.to_str().unwrap_or("/")).context("Invalid path")?;
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            anyhow::bail!("statvfs failed: {}", std::io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        Ok(available)
    }
}

#[cfg(not(unix))]
pub fn available_bytes(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}

/// Whether the volume holding `path` has at least `min_mb` megabytes free.
///
/// A failed probe counts as sufficient space; capture is not stopped on a
/// measurement error.
pub fn free_space_ok(path: &Path, min_mb: u64) -> bool {
    match available_bytes(path) {
        Ok(available) => {
            let ok = available / (1024 * 1024) >= min_mb;
            if !ok {
                warn!(
                    path = %path.display(),
                    available_mb = available / (1024 * 1024),
                    min_mb,
                    "Insufficient free space"
                );
            }
            ok
        }
        Err(e) => {
            warn!(path = %path.display(), "Free space check failed: {}", e);
            true
        }
    }
}

/// Resident set size of this process, from /proc/self/status
pub fn process_rss_bytes() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Delete every file under `dir` except those named in `keep`.
///
/// Recurses into subdirectories. Failures are logged and skipped. Returns
/// the number of files removed.
pub fn cleanup_tmp_storage(dir: &Path, keep: &[String]) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            removed += cleanup_tmp_storage(&path, keep);
            continue;
        }
        let name = entry.file_name();
        if keep.iter().any(|k| name.to_str() == Some(k.as_str())) {
            continue;
        }
        info!(file = %path.display(), "Removing tmp file");
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(file = %path.display(), "Couldn't remove tmp file: {}", e),
        }
    }
    removed
}
