use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::remote::stream::STREAM_BLOCK_SIZE;
use crate::thumbnails::ThumbnailSize;

const THUMB_DIM_DEFAULT: u32 = 120;
const THUMB_DIM_MIN: u32 = 16;
const THUMB_DIM_MAX: u32 = 1024;
const CACHE_DEFAULT_MB: u64 = 350;
const CACHE_MIN_MB: u64 = 16;
const CACHE_MAX_MB: u64 = 4096;
const VIDEO_GATE_DEFAULT: usize = 4;
const VIDEO_GATE_MAX: usize = 16;
const POOL_MIN_THREADS: usize = 2;
const POOL_MAX_THREADS: usize = 8;
const MAX_IMAGE_BYTES_DEFAULT: u64 = 64 * 1024 * 1024;
const MAX_SOURCE_DIM_DEFAULT: u32 = 20_000;

pub const ENV_CACHE_MB: &str = "ALBUM_THUMBS_CACHE_MB";
pub const ENV_VIDEO_GATE: &str = "ALBUM_THUMBS_VIDEO_GATE";
pub const ENV_WORKERS: &str = "ALBUM_THUMBS_WORKERS";
pub const ENV_SIZE: &str = "ALBUM_THUMBS_SIZE";

/// Tunables for the thumbnail pipeline. Every field has a default, so a
/// partial JSON document is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThumbnailConfig {
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub cache_capacity_mb: u64,
    pub video_gate: usize,
    pub worker_threads: Option<usize>,
    pub stream_block_size: usize,
    pub max_image_bytes: u64,
    pub max_source_dim: u32,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            thumbnail_width: THUMB_DIM_DEFAULT,
            thumbnail_height: THUMB_DIM_DEFAULT,
            cache_capacity_mb: CACHE_DEFAULT_MB,
            video_gate: VIDEO_GATE_DEFAULT,
            worker_threads: None,
            stream_block_size: STREAM_BLOCK_SIZE,
            max_image_bytes: MAX_IMAGE_BYTES_DEFAULT,
            max_source_dim: MAX_SOURCE_DIM_DEFAULT,
        }
    }
}

impl ThumbnailConfig {
    /// Reads a JSON config file and clamps it.
    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {e}", path.display()))?;
        let parsed: Self = serde_json::from_str(&raw)
            .map_err(|e| format!("Invalid config {}: {e}", path.display()))?;
        Ok(parsed.sanitized())
    }

    /// Applies `ALBUM_THUMBS_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(mb) = parse_override::<u64>(&lookup, ENV_CACHE_MB) {
            self.cache_capacity_mb = mb;
        }
        if let Some(gate) = parse_override::<usize>(&lookup, ENV_VIDEO_GATE) {
            self.video_gate = gate;
        }
        if let Some(workers) = parse_override::<usize>(&lookup, ENV_WORKERS) {
            self.worker_threads = Some(workers);
        }
        if let Some(dim) = parse_override::<u32>(&lookup, ENV_SIZE) {
            self.thumbnail_width = dim;
            self.thumbnail_height = dim;
        }
        self.sanitized()
    }

    /// Pulls every value back into its supported range.
    pub fn sanitized(mut self) -> Self {
        self.thumbnail_width = self.thumbnail_width.clamp(THUMB_DIM_MIN, THUMB_DIM_MAX);
        self.thumbnail_height = self.thumbnail_height.clamp(THUMB_DIM_MIN, THUMB_DIM_MAX);
        if !(CACHE_MIN_MB..=CACHE_MAX_MB).contains(&self.cache_capacity_mb) {
            warn!(
                requested = self.cache_capacity_mb,
                fallback = CACHE_DEFAULT_MB,
                "thumbnail cache size out of range"
            );
            self.cache_capacity_mb = CACHE_DEFAULT_MB;
        }
        self.video_gate = self.video_gate.clamp(1, VIDEO_GATE_MAX);
        self.worker_threads = self
            .worker_threads
            .map(|n| n.clamp(1, POOL_MAX_THREADS * 2));
        if self.stream_block_size < 4096 {
            self.stream_block_size = STREAM_BLOCK_SIZE;
        }
        if self.max_image_bytes == 0 {
            self.max_image_bytes = MAX_IMAGE_BYTES_DEFAULT;
        }
        if self.max_source_dim == 0 {
            self.max_source_dim = MAX_SOURCE_DIM_DEFAULT;
        }
        self
    }

    pub fn thumbnail_size(&self) -> ThumbnailSize {
        ThumbnailSize::new(self.thumbnail_width, self.thumbnail_height)
    }

    /// Cache budget in bytes, never smaller than one full-box thumbnail.
    pub fn cache_capacity_bytes(&self) -> u64 {
        let largest = u64::from(self.thumbnail_width) * u64::from(self.thumbnail_height) * 4;
        self.cache_capacity_mb.saturating_mul(1024 * 1024).max(largest)
    }

    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads
            .unwrap_or_else(|| num_cpus::get().clamp(POOL_MIN_THREADS, POOL_MAX_THREADS))
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            debug!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}
