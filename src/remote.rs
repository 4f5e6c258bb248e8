//! Seam to the device filesystem: the `RemoteFs` primitive, the connection
//! wrapper that serializes calls on it, and the seekable stream built on top.

use chrono::{DateTime, TimeZone, Utc};

mod device;
mod error;
mod local;
pub mod stream;

pub use device::DeviceConnection;
pub use error::{RemoteError, RemoteErrorCode, RemoteResult};
pub use local::LocalFs;
pub use stream::RemoteStream;

/// Opaque handle id issued by a [`RemoteFs`] for an open file.
pub type RemoteHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Start,
    Current,
    End,
}

/// Leaf metadata for a remote path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub is_dir: bool,
    pub birth_time: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// File transfer primitive exposed by an attached device.
///
/// Implementations do not need to be internally serialized; callers go
/// through [`DeviceConnection`], which allows one outstanding call at a time.
pub trait RemoteFs: Send + Sync {
    fn open(&self, path: &str) -> RemoteResult<RemoteHandle>;

    /// Reads up to `buf.len()` bytes at the handle's position.
    fn read(&self, handle: RemoteHandle, buf: &mut [u8]) -> RemoteResult<usize>;

    fn seek(&self, handle: RemoteHandle, offset: i64, whence: SeekWhence) -> RemoteResult<u64>;

    fn close(&self, handle: RemoteHandle) -> RemoteResult<()>;

    fn stat(&self, path: &str) -> RemoteResult<RemoteStat>;

    /// Names (not paths) of the children of `path`.
    fn list_dir(&self, path: &str) -> RemoteResult<Vec<String>>;

    /// Re-creates the underlying service client after it went stale.
    fn reconnect(&self) -> RemoteResult<()> {
        Ok(())
    }
}

/// Converts a device timestamp in nanoseconds since the Unix epoch.
pub fn datetime_from_unix_nanos(nanos: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(nanos / 1_000_000_000).ok()?;
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

/// Joins an album directory and a child name with exactly one separator.
pub fn join_remote_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{dir}/{name}")
}

/// Last path component of a remote path.
pub fn remote_file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
