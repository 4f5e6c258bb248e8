//! In-memory device and scripted renderers for unit tests.

use crate::remote::{
    RemoteError, RemoteErrorCode, RemoteFs, RemoteHandle, RemoteResult, RemoteStat, SeekWhence,
};
use crate::thumbnails::{RenderJob, Thumbnail, ThumbnailError, ThumbnailRenderer};
use chrono::{DateTime, Utc};
use image::{Rgba, RgbaImage};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

struct MemoryFile {
    data: Vec<u8>,
    birth_time: Option<DateTime<Utc>>,
    modified: Option<DateTime<Utc>>,
    readable_len: Option<usize>,
}

struct OpenFile {
    path: String,
    pos: u64,
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    open: HashMap<RemoteHandle, OpenFile>,
    next_handle: RemoteHandle,
    read_requests: Vec<usize>,
    closes: usize,
    reconnects: usize,
    failing_list_dirs: usize,
    failing_opens: usize,
    failing_stats: HashSet<String>,
}

/// A device filesystem held in memory. Directories are implied by file paths.
#[derive(Default)]
pub(crate) struct MemoryFs {
    state: Mutex<MemoryState>,
    call_delay: Duration,
    active_calls: AtomicUsize,
    max_active_calls: AtomicUsize,
}

struct CallGuard<'a> {
    fs: &'a MemoryFs,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.fs.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryFs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every primitive call sleeps this long, widening overlap windows.
    pub(crate) fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub(crate) fn insert_file(&self, path: &str, data: Vec<u8>) {
        self.insert_file_with_times(path, data, None, None);
    }

    pub(crate) fn insert_file_with_times(
        &self,
        path: &str,
        data: Vec<u8>,
        birth_time: Option<DateTime<Utc>>,
        modified: Option<DateTime<Utc>>,
    ) {
        self.lock().files.insert(
            path.to_string(),
            MemoryFile {
                data,
                birth_time,
                modified,
                readable_len: None,
            },
        );
    }

    pub(crate) fn remove_file(&self, path: &str) {
        self.lock().files.remove(path);
    }

    /// Reads past `len` bytes come back empty, as from a device that dropped
    /// the transfer.
    pub(crate) fn truncate_reads_after(&self, path: &str, len: usize) {
        if let Some(file) = self.lock().files.get_mut(path) {
            file.readable_len = Some(len);
        }
    }

    pub(crate) fn fail_next_list_dirs(&self, count: usize) {
        self.lock().failing_list_dirs = count;
    }

    /// The next `count` opens fail with a transient I/O error.
    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.lock().failing_opens = count;
    }

    pub(crate) fn fail_stat(&self, path: &str) {
        self.lock().failing_stats.insert(path.to_string());
    }

    pub(crate) fn read_requests(&self) -> Vec<usize> {
        self.lock().read_requests.clone()
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    pub(crate) fn closes(&self) -> usize {
        self.lock().closes
    }

    pub(crate) fn reconnects(&self) -> usize {
        self.lock().reconnects
    }

    pub(crate) fn max_concurrent_calls(&self) -> usize {
        self.max_active_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enter(&self) -> CallGuard<'_> {
        let current = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_calls.fetch_max(current, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            thread::sleep(self.call_delay);
        }
        CallGuard { fs: self }
    }
}

fn normalize_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    format!("{trimmed}/")
}

fn not_found(path: &str) -> RemoteError {
    RemoteError::new(RemoteErrorCode::NotFound, format!("No such file: {path}"))
}

fn bad_handle(handle: RemoteHandle) -> RemoteError {
    RemoteError::new(RemoteErrorCode::Io, format!("Unknown file handle {handle}"))
}

impl RemoteFs for MemoryFs {
    fn open(&self, path: &str) -> RemoteResult<RemoteHandle> {
        let _call = self.enter();
        let mut state = self.lock();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(RemoteError::new(RemoteErrorCode::Io, "Device went away during open"));
        }
        if !state.files.contains_key(path) {
            return Err(not_found(path));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.open.insert(
            handle,
            OpenFile {
                path: path.to_string(),
                pos: 0,
            },
        );
        Ok(handle)
    }

    fn read(&self, handle: RemoteHandle, buf: &mut [u8]) -> RemoteResult<usize> {
        let _call = self.enter();
        let mut state = self.lock();
        state.read_requests.push(buf.len());
        let (path, pos) = {
            let open = state.open.get(&handle).ok_or_else(|| bad_handle(handle))?;
            (open.path.clone(), open.pos as usize)
        };
        let file = state.files.get(&path).ok_or_else(|| not_found(&path))?;
        let end = file.readable_len.unwrap_or(file.data.len()).min(file.data.len());
        let n = end.saturating_sub(pos).min(buf.len());
        buf[..n].copy_from_slice(&file.data[pos..pos + n]);
        if let Some(open) = state.open.get_mut(&handle) {
            open.pos += n as u64;
        }
        Ok(n)
    }

    fn seek(&self, handle: RemoteHandle, offset: i64, whence: SeekWhence) -> RemoteResult<u64> {
        let _call = self.enter();
        let mut state = self.lock();
        let (path, pos) = {
            let open = state.open.get(&handle).ok_or_else(|| bad_handle(handle))?;
            (open.path.clone(), open.pos as i64)
        };
        let len = state
            .files
            .get(&path)
            .map(|f| f.data.len() as i64)
            .ok_or_else(|| not_found(&path))?;
        let base = match whence {
            SeekWhence::Start => 0,
            SeekWhence::Current => pos,
            SeekWhence::End => len,
        };
        let target = base + offset;
        if target < 0 {
            return Err(RemoteError::new(RemoteErrorCode::InvalidSeek, "Negative seek"));
        }
        if let Some(open) = state.open.get_mut(&handle) {
            open.pos = target as u64;
        }
        Ok(target as u64)
    }

    fn close(&self, handle: RemoteHandle) -> RemoteResult<()> {
        let _call = self.enter();
        let mut state = self.lock();
        state.open.remove(&handle).ok_or_else(|| bad_handle(handle))?;
        state.closes += 1;
        Ok(())
    }

    fn stat(&self, path: &str) -> RemoteResult<RemoteStat> {
        let _call = self.enter();
        let state = self.lock();
        if state.failing_stats.contains(path) {
            return Err(RemoteError::new(RemoteErrorCode::Io, format!("Stat failed for {path}")));
        }
        if let Some(file) = state.files.get(path) {
            return Ok(RemoteStat {
                size: file.data.len() as u64,
                is_dir: false,
                birth_time: file.birth_time,
                modified: file.modified,
            });
        }
        let prefix = normalize_dir(path);
        if state.files.keys().any(|key| key.starts_with(&prefix)) {
            return Ok(RemoteStat {
                is_dir: true,
                ..RemoteStat::default()
            });
        }
        Err(not_found(path))
    }

    fn list_dir(&self, path: &str) -> RemoteResult<Vec<String>> {
        let _call = self.enter();
        let mut state = self.lock();
        if state.failing_list_dirs > 0 {
            state.failing_list_dirs -= 1;
            return Err(RemoteError::new(RemoteErrorCode::Io, "Listing interrupted"));
        }
        let prefix = normalize_dir(path);
        let mut names: Vec<String> = Vec::new();
        for key in state.files.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let child = rest.split('/').next().unwrap_or(rest);
                if !child.is_empty() && !names.iter().any(|n| n == child) {
                    names.push(child.to_string());
                }
            }
        }
        if names.is_empty() {
            return Err(not_found(path));
        }
        Ok(names)
    }

    fn reconnect(&self) -> RemoteResult<()> {
        let _call = self.enter();
        self.lock().reconnects += 1;
        Ok(())
    }
}

/// Renderer that never touches a device: produces a solid box-sized
/// thumbnail and records how it was driven.
#[derive(Default)]
pub(crate) struct ScriptedRenderer {
    delay: Duration,
    panics: bool,
    fail_first: AtomicUsize,
    failing_paths: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedRenderer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failing_first(self, count: usize) -> Self {
        self.fail_first.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub(crate) fn fail_path(&self, path: &str) {
        let mut paths = match self.failing_paths.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        paths.insert(path.to_string());
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn path_fails(&self, path: &str) -> bool {
        match self.failing_paths.lock() {
            Ok(guard) => guard.contains(path),
            Err(poisoned) => poisoned.into_inner().contains(path),
        }
    }
}

impl ThumbnailRenderer for ScriptedRenderer {
    fn render(&self, job: &RenderJob) -> Result<Thumbnail, ThumbnailError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.panics {
            panic!("scripted decoder panic for {}", job.path);
        }
        let scripted_failure = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || self.path_fails(&job.path) {
            return Err(ThumbnailError::corrupt(format!("Scripted failure for {}", job.path)));
        }
        Ok(Thumbnail::from_image(RgbaImage::from_pixel(
            job.size.width,
            job.size.height,
            Rgba([40, 80, 160, 255]),
        )))
    }
}
