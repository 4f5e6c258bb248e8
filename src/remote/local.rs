use super::{
    datetime_from_unix_nanos, RemoteError, RemoteErrorCode, RemoteFs, RemoteHandle, RemoteResult,
    RemoteStat, SeekWhence,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Serves a local directory as if it were a device filesystem. Remote paths
/// such as `/DCIM/100APPLE/IMG_0001.JPG` resolve below `root`.
#[derive(Debug)]
pub struct LocalFs {
    root: PathBuf,
    next_handle: AtomicU64,
    open_files: Mutex<HashMap<RemoteHandle, File>>,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_handle: AtomicU64::new(1),
            open_files: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote: &str) -> RemoteResult<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(remote.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(RemoteError::new(
                        RemoteErrorCode::PermissionDenied,
                        format!("Refusing path outside device root: {remote}"),
                    ))
                }
            }
        }
        Ok(resolved)
    }

    fn with_file<T>(
        &self,
        handle: RemoteHandle,
        f: impl FnOnce(&mut File) -> std::io::Result<T>,
    ) -> RemoteResult<T> {
        let mut files = match self.open_files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let file = files.get_mut(&handle).ok_or_else(|| {
            RemoteError::new(RemoteErrorCode::Io, format!("Unknown file handle {handle}"))
        })?;
        f(file).map_err(|e| RemoteError::from_io_error("Local file operation failed", e))
    }
}

/// Epoch-zero times are treated as missing, the same as on a device.
fn file_time(time: SystemTime) -> Option<DateTime<Utc>> {
    let nanos = time.duration_since(UNIX_EPOCH).ok()?.as_nanos();
    datetime_from_unix_nanos(u64::try_from(nanos).ok()?)
}

impl RemoteFs for LocalFs {
    fn open(&self, path: &str) -> RemoteResult<RemoteHandle> {
        let local = self.resolve(path)?;
        let file = File::open(&local)
            .map_err(|e| RemoteError::from_io_error(&format!("Open failed for {path}"), e))?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut files = match self.open_files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        files.insert(handle, file);
        Ok(handle)
    }

    fn read(&self, handle: RemoteHandle, buf: &mut [u8]) -> RemoteResult<usize> {
        self.with_file(handle, |file| file.read(buf))
    }

    fn seek(&self, handle: RemoteHandle, offset: i64, whence: SeekWhence) -> RemoteResult<u64> {
        let pos = match whence {
            SeekWhence::Start => SeekFrom::Start(u64::try_from(offset).map_err(|_| {
                RemoteError::new(RemoteErrorCode::InvalidSeek, "Negative absolute seek")
            })?),
            SeekWhence::Current => SeekFrom::Current(offset),
            SeekWhence::End => SeekFrom::End(offset),
        };
        self.with_file(handle, |file| file.seek(pos))
    }

    fn close(&self, handle: RemoteHandle) -> RemoteResult<()> {
        let mut files = match self.open_files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        files.remove(&handle).map(|_| ()).ok_or_else(|| {
            RemoteError::new(RemoteErrorCode::Io, format!("Unknown file handle {handle}"))
        })
    }

    fn stat(&self, path: &str) -> RemoteResult<RemoteStat> {
        let local = self.resolve(path)?;
        let meta = fs::metadata(&local)
            .map_err(|e| RemoteError::from_io_error(&format!("Stat failed for {path}"), e))?;
        Ok(RemoteStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
            birth_time: meta.created().ok().and_then(file_time),
            modified: meta.modified().ok().and_then(file_time),
        })
    }

    fn list_dir(&self, path: &str) -> RemoteResult<Vec<String>> {
        let local = self.resolve(path)?;
        let entries = fs::read_dir(&local)
            .map_err(|e| RemoteError::from_io_error(&format!("Failed to read dir {path}"), e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                RemoteError::from_io_error(&format!("Failed to read dir entry in {path}"), e)
            })?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}
