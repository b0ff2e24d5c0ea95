//! Filesystem fixtures for tests: throwaway directories for whole-store
//! runs and single named files for format-level checks.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const BASE: &str = "/tmp/siltdb_tests";

/// Returns a path under the shared test base that no other test in this
/// process will pick.
fn unique_path(prefix: &str) -> std::io::Result<PathBuf> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let base = PathBuf::from(BASE);
    fs::create_dir_all(&base)?;
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(base.join(format!(
        "{prefix}_{}_{}_{n}",
        std::process::id(),
        nanos()
    )))
}

fn nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}

/// A directory removed on drop. Used as the data directory for store,
/// table, and manifest tests.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let path = unique_path("dir")?;
        fs::create_dir(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// A single named file removed on drop. The path exists from `new`; the
/// file itself is created on first `reopen`. Reopening hands out a fresh
/// read-write handle, which is what corruption and truncation tests need.
pub struct NamedTempFile {
    path: PathBuf,
}

impl NamedTempFile {
    pub fn new() -> std::io::Result<Self> {
        let path = unique_path("file")?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reopen(&self) -> std::io::Result<fs::File> {
        fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
    }
}

impl Drop for NamedTempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
