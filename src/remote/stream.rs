//! Seekable byte source over a file that stays on the device.
//!
//! Decoders that expect random access (container demuxers, `image`'s
//! readers) pull from a [`RemoteStream`]; each pull becomes one remote read
//! for at most the bytes that are left, so nothing beyond what the decoder
//! asks for is transferred. The stream keeps no read-ahead of its own.

use super::{
    DeviceConnection, RemoteError, RemoteErrorCode, RemoteHandle, RemoteResult, SeekWhence,
};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, warn};

/// Read-ahead block the demuxer allocates for its I/O context.
pub const STREAM_BLOCK_SIZE: usize = 32 * 1024;

pub struct RemoteStream {
    device: Arc<DeviceConnection>,
    path: String,
    handle: RemoteHandle,
    size: u64,
    cursor: u64,
    closed: bool,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("path", &self.path)
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl RemoteStream {
    /// Opens `path` read-only and caches its size. Failures are returned as
    /// is; reconnecting is the caller's decision.
    pub fn open(device: Arc<DeviceConnection>, path: &str) -> RemoteResult<Self> {
        let handle = device.open(path)?;
        Self::from_handle(device, path, handle)
    }

    /// Wraps a handle that was already opened on `device`, taking ownership
    /// of it. The handle is closed if the size lookup fails.
    pub fn from_handle(
        device: Arc<DeviceConnection>,
        path: &str,
        handle: RemoteHandle,
    ) -> RemoteResult<Self> {
        let size = match device.stat(path) {
            Ok(stat) => stat.size,
            Err(error) => {
                if let Err(close_err) = device.close(handle) {
                    warn!(path, error = %close_err, "close after failed stat");
                }
                return Err(error);
            }
        };
        debug!(path, handle, size, "remote stream opened");
        Ok(Self {
            device,
            path: path.to_string(),
            handle,
            size,
            cursor: 0,
            closed: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Total file size, answered without a remote round trip.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.cursor)
    }

    /// Reads into `buf`, returning `0` only at end of file.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> RemoteResult<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let got = self.device.read(self.handle, &mut buf[..want])?;
        if got == 0 {
            return Err(RemoteError::new(
                RemoteErrorCode::Io,
                format!(
                    "{}: device returned no data at offset {} of {}",
                    self.path, self.cursor, self.size
                ),
            ));
        }
        let got = got.min(want);
        self.cursor += got as u64;
        Ok(got)
    }

    /// Moves the cursor. Targets before the start or past the end fail
    /// without contacting the device.
    pub fn seek_to(&mut self, offset: i64, whence: SeekWhence) -> RemoteResult<u64> {
        let base = match whence {
            SeekWhence::Start => 0i128,
            SeekWhence::Current => i128::from(self.cursor),
            SeekWhence::End => i128::from(self.size),
        };
        let target = base + i128::from(offset);
        if target < 0 || target > i128::from(self.size) {
            return Err(RemoteError::new(
                RemoteErrorCode::InvalidSeek,
                format!("{}: seek to {target} outside 0..={}", self.path, self.size),
            ));
        }
        let target = target as u64;
        if target == self.cursor {
            return Ok(target);
        }
        let offset = i64::try_from(target).map_err(|_| {
            RemoteError::new(RemoteErrorCode::InvalidSeek, format!("{}: offset overflow", self.path))
        })?;
        self.device.seek(self.handle, offset, SeekWhence::Start)?;
        self.cursor = target;
        Ok(target)
    }

    /// Pulls the rest of the file into memory, one remote read per `chunk`
    /// bytes. The buffer is reserved up front so an oversized file fails
    /// before any transfer.
    pub fn read_all(mut self, chunk: usize) -> io::Result<Vec<u8>> {
        let chunk = chunk.max(1);
        let remaining = usize::try_from(self.remaining())
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "file does not fit in memory"))?;
        let mut data = Vec::new();
        data.try_reserve_exact(remaining)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        data.resize(remaining, 0);
        let mut filled = 0;
        while filled < remaining {
            let end = (filled + chunk).min(remaining);
            let n = self
                .read_chunk(&mut data[filled..end])
                .map_err(RemoteError::into_io_error)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        self.close().map_err(RemoteError::into_io_error)?;
        Ok(data)
    }

    /// Closes the remote handle. Dropping the stream does the same.
    pub fn close(mut self) -> RemoteResult<()> {
        self.release()
    }

    fn release(&mut self) -> RemoteResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!(path = %self.path, handle = self.handle, "remote stream closed");
        self.device.close(self.handle)
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            warn!(path = %self.path, error = %error, "failed to close remote stream");
        }
    }
}

impl Read for RemoteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf).map_err(RemoteError::into_io_error)
    }
}

impl Seek for RemoteStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(offset) => (
                i64::try_from(offset)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?,
                SeekWhence::Start,
            ),
            SeekFrom::Current(offset) => (offset, SeekWhence::Current),
            SeekFrom::End(offset) => (offset, SeekWhence::End),
        };
        self.seek_to(offset, whence).map_err(RemoteError::into_io_error)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.cursor)
    }
}
