//! Filesystem capacity sampling for the data mounts below the base path.

use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to list mounts below `{path}`: {source}")]
    ListMounts {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to stat filesystem at `{path}`: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("filesystem call on `{path}` timed out after {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("filesystem call on `{path}` did not complete: {source}")]
    Task {
        path: PathBuf,
        #[source]
        source: tokio::task::JoinError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A path whose filesystem capacity is exported.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mount {
    pub name: String,
    pub path: PathBuf,
}

/// Raw block and inode counts of a filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsCapacity {
    pub block_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub inodes: u64,
    pub inodes_free: u64,
}

impl FsCapacity {
    pub fn free_bytes(&self) -> f64 {
        self.blocks_free.saturating_mul(self.block_size) as f64
    }

    /// Bytes available to unprivileged users.
    pub fn available_bytes(&self) -> f64 {
        self.blocks_available.saturating_mul(self.block_size) as f64
    }

    pub fn size_bytes(&self) -> f64 {
        self.blocks.saturating_mul(self.block_size) as f64
    }
}

/// Source of filesystem statistics.
///
/// Implementations may block, so callers run them on the blocking pool via [`stat_within`].
pub trait CapacitySource: Clone + Send + Sync + 'static {
    fn stat(&self, path: &Path) -> Result<FsCapacity>;
}

/// Reads capacity via `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statvfs;

impl CapacitySource for Statvfs {
    fn stat(&self, path: &Path) -> Result<FsCapacity> {
        let to_error = |source| Error::Stat {
            path: path.to_path_buf(),
            source,
        };
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|err| to_error(io::Error::new(io::ErrorKind::InvalidInput, err)))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();

        // SAFETY: `c_path` is a valid NUL-terminated string and `stat` points to writable
        // memory large enough for a `statvfs` struct.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(to_error(io::Error::last_os_error()));
        }
        // SAFETY: `statvfs` returned 0, so it fully initialized `stat`.
        let stat = unsafe { stat.assume_init() };

        #[allow(clippy::unnecessary_cast)]
        let capacity = FsCapacity {
            block_size: stat.f_frsize as u64,
            blocks: stat.f_blocks as u64,
            blocks_free: stat.f_bfree as u64,
            blocks_available: stat.f_bavail as u64,
            inodes: stat.f_files as u64,
            inodes_free: stat.f_ffree as u64,
        };

        Ok(capacity)
    }
}

/// Enumerates the mounts of interest below `base`.
///
/// The root path is its own single mount. Any other base contributes each of its immediate
/// subdirectories, sorted by name.
///
/// # Errors
///
/// Returns [`Error::ListMounts`] if `base` cannot be read.
pub fn mounts_of_interest(base: &Path) -> Result<Vec<Mount>> {
    if base == Path::new("/") {
        return Ok(vec![Mount {
            name: "/".to_owned(),
            path: base.to_path_buf(),
        }]);
    }

    let to_error = |source| Error::ListMounts {
        path: base.to_path_buf(),
        source,
    };
    let mut mounts = Vec::new();
    for entry in std::fs::read_dir(base).map_err(to_error)? {
        let entry = entry.map_err(to_error)?;
        match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => mounts.push(Mount {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
            }),
            Ok(_) => {}
            Err(err) => log::warn!(
                "failed to read file type of `{}`: {}",
                entry.path().display(),
                err
            ),
        }
    }
    mounts.sort();

    Ok(mounts)
}

/// Runs a blocking filesystem call on the blocking pool, bounded by `timeout`.
///
/// A call that times out keeps running on its blocking thread, but the caller moves on.
async fn run_blocking<T, F>(path: &Path, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(source)) => Err(Error::Task {
            path: path.to_path_buf(),
            source,
        }),
        Err(_) => Err(Error::Timeout {
            path: path.to_path_buf(),
            timeout,
        }),
    }
}

/// [`mounts_of_interest`] off the async runtime, bounded by `timeout`.
///
/// # Errors
///
/// Returns [`Error::ListMounts`], [`Error::Timeout`] or [`Error::Task`].
pub async fn list_mounts_within(base: &Path, timeout: Duration) -> Result<Vec<Mount>> {
    let owned = base.to_path_buf();
    run_blocking(base, timeout, move || mounts_of_interest(&owned)).await
}

/// [`CapacitySource::stat`] off the async runtime, bounded by `timeout`.
///
/// # Errors
///
/// Returns [`Error::Stat`], [`Error::Timeout`] or [`Error::Task`].
pub async fn stat_within<C: CapacitySource>(
    source: &C,
    path: &Path,
    timeout: Duration,
) -> Result<FsCapacity> {
    let source = source.clone();
    let owned = path.to_path_buf();
    run_blocking(path, timeout, move || source.stat(&owned)).await
}
