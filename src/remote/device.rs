use super::{RemoteFs, RemoteHandle, RemoteResult, RemoteStat, SeekWhence};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Shared access to one device's filesystem service.
///
/// The service accepts a single outstanding request, so every call takes the
/// connection lock for that call only. Decode tasks for different files
/// interleave between calls instead of queueing behind a whole decode.
pub struct DeviceConnection {
    label: String,
    fs: Arc<dyn RemoteFs>,
    op_lock: Mutex<()>,
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl DeviceConnection {
    pub fn new(label: impl Into<String>, fs: Arc<dyn RemoteFs>) -> Self {
        Self {
            label: label.into(),
            fs,
            op_lock: Mutex::new(()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn exclusive(&self) -> MutexGuard<'_, ()> {
        match self.op_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_exclusive<T>(&self, f: impl FnOnce(&dyn RemoteFs) -> RemoteResult<T>) -> RemoteResult<T> {
        let _guard = self.exclusive();
        f(self.fs.as_ref())
    }

    pub fn open(&self, path: &str) -> RemoteResult<RemoteHandle> {
        self.with_exclusive(|fs| fs.open(path))
    }

    pub fn read(&self, handle: RemoteHandle, buf: &mut [u8]) -> RemoteResult<usize> {
        self.with_exclusive(|fs| fs.read(handle, buf))
    }

    pub fn seek(&self, handle: RemoteHandle, offset: i64, whence: SeekWhence) -> RemoteResult<u64> {
        self.with_exclusive(|fs| fs.seek(handle, offset, whence))
    }

    pub fn close(&self, handle: RemoteHandle) -> RemoteResult<()> {
        self.with_exclusive(|fs| fs.close(handle))
    }

    pub fn stat(&self, path: &str) -> RemoteResult<RemoteStat> {
        self.with_exclusive(|fs| fs.stat(path))
    }

    pub fn list_dir(&self, path: &str) -> RemoteResult<Vec<String>> {
        self.with_exclusive(|fs| fs.list_dir(path))
    }

    /// Lists `path`, re-creating the service client once if the first
    /// attempt hit a transient failure.
    pub fn list_dir_with_retry(&self, path: &str) -> RemoteResult<Vec<String>> {
        self.retry_once("list_dir", path, |fs| fs.list_dir(path))
    }

    /// Opens `path`, re-creating the service client once if the first
    /// attempt hit a transient failure.
    pub fn open_with_retry(&self, path: &str) -> RemoteResult<RemoteHandle> {
        self.retry_once("open", path, |fs| fs.open(path))
    }

    fn retry_once<T>(
        &self,
        op: &'static str,
        path: &str,
        f: impl Fn(&dyn RemoteFs) -> RemoteResult<T>,
    ) -> RemoteResult<T> {
        let _guard = self.exclusive();
        let first = match f(self.fs.as_ref()) {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !first.is_transient() {
            return Err(first);
        }
        debug!(
            device = %self.label,
            op,
            path,
            error = %first,
            "remote call failed, reconnecting once"
        );
        if let Err(error) = self.fs.reconnect() {
            warn!(device = %self.label, op, error = %error, "reconnect failed");
            return Err(first);
        }
        f(self.fs.as_ref()).map_err(|error| {
            warn!(device = %self.label, op, path, error = %error, "retry after reconnect failed");
            error
        })
    }
}
