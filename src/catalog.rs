//! The album view: every recognized media file of one remote directory, a
//! filtered and sorted projection over it, and lazy thumbnails per row.

mod entry;
mod error;
mod sorting;
mod timestamp;

pub use entry::MediaEntry;
pub use error::{CatalogError, CatalogErrorCode, CatalogResult};
pub use sorting::{visible_indices, FilterType, SortOrder};
pub use timestamp::{resolve_capture_time, timestamp_from_file_name, CaptureTimeSource};

use crate::config::ThumbnailConfig;
use crate::media::MediaType;
use crate::remote::{join_remote_path, DeviceConnection};
use crate::thumbnails::{
    DecodeLimits, DeviceRenderer, PipelineEvent, Thumbnail, ThumbnailPipeline, ThumbnailRenderer,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailState {
    NotRequested,
    Pending,
    Ready,
    /// The last decode failed; the next access tries again.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderIcon {
    Image,
    Video,
}

impl PlaceholderIcon {
    pub fn for_media(media_type: MediaType) -> Self {
        match media_type {
            MediaType::Image => Self::Image,
            MediaType::Video => Self::Video,
        }
    }
}

/// What a row shows right now.
#[derive(Debug, Clone)]
pub enum Decoration {
    Thumbnail(Arc<Thumbnail>),
    Placeholder(PlaceholderIcon),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    /// A visible row's thumbnail became available.
    ThumbnailChanged { index: usize, path: String },
}

pub struct CatalogModel {
    device: Arc<DeviceConnection>,
    pipeline: ThumbnailPipeline,
    album_path: Option<String>,
    entries: Vec<MediaEntry>,
    by_path: HashMap<String, usize>,
    visible: Vec<usize>,
    filter: FilterType,
    sort: SortOrder,
    failed: HashSet<String>,
}

impl CatalogModel {
    pub fn new(device: Arc<DeviceConnection>, config: &ThumbnailConfig) -> CatalogResult<Self> {
        let renderer = Arc::new(DeviceRenderer::new(
            Arc::clone(&device),
            DecodeLimits::from_config(config),
        ));
        Self::with_renderer(device, renderer, config)
    }

    pub fn with_renderer(
        device: Arc<DeviceConnection>,
        renderer: Arc<dyn ThumbnailRenderer>,
        config: &ThumbnailConfig,
    ) -> CatalogResult<Self> {
        let pipeline = ThumbnailPipeline::new(renderer, config)
            .map_err(|e| CatalogError::new(CatalogErrorCode::WorkerPool, e))?;
        Ok(Self {
            device,
            pipeline,
            album_path: None,
            entries: Vec::new(),
            by_path: HashMap::new(),
            visible: Vec::new(),
            filter: FilterType::default(),
            sort: SortOrder::default(),
            failed: HashSet::new(),
        })
    }

    /// See [`ThumbnailPipeline::set_waker`].
    pub fn set_waker(&mut self, waker: impl Fn() + Send + Sync + 'static) {
        self.pipeline.set_waker(waker);
    }

    pub fn pipeline(&self) -> &ThumbnailPipeline {
        &self.pipeline
    }

    pub fn album_path(&self) -> Option<&str> {
        self.album_path.as_deref()
    }

    /// Switches to another album. Work queued for the previous album is
    /// invalidated and the cache emptied before the new listing starts; on
    /// error the catalog is left empty.
    pub fn set_album_path(&mut self, path: &str) -> CatalogResult<()> {
        if self.album_path.as_deref() == Some(path) {
            return Ok(());
        }
        self.pipeline.reset();
        self.failed.clear();
        self.album_path = None;
        self.replace_entries(Vec::new());

        let entries = self.enumerate(path)?;
        self.album_path = Some(path.to_string());
        self.replace_entries(entries);
        Ok(())
    }

    /// Re-lists the current album. Cached and in-flight thumbnails stay valid;
    /// on error the current entries are kept.
    pub fn refresh(&mut self) -> CatalogResult<()> {
        let Some(path) = self.album_path.clone() else {
            return Ok(());
        };
        let mut entries = self.enumerate(&path)?;
        for entry in &mut entries {
            let was_requested = self
                .by_path
                .get(entry.path())
                .map(|&i| self.entries[i].thumbnail_requested())
                .unwrap_or(false);
            if was_requested {
                entry.mark_thumbnail_requested();
            }
        }
        let present: HashSet<&str> = entries.iter().map(MediaEntry::path).collect();
        self.failed.retain(|p| present.contains(p.as_str()));
        self.replace_entries(entries);
        Ok(())
    }

    /// Drops the album and everything derived from it.
    pub fn clear(&mut self) {
        self.pipeline.reset();
        self.failed.clear();
        self.album_path = None;
        self.replace_entries(Vec::new());
    }

    fn enumerate(&self, album: &str) -> CatalogResult<Vec<MediaEntry>> {
        let stat = self
            .device
            .stat(album)
            .map_err(|e| CatalogError::from_album_stat(album, e))?;
        if !stat.is_dir {
            return Err(CatalogError::new(
                CatalogErrorCode::AlbumNotFound,
                format!("Not an album directory: {album}"),
            ));
        }
        let names = self
            .device
            .list_dir_with_retry(album)
            .map_err(|e| CatalogError::listing_failed(album, e))?;

        let now = Utc::now();
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        for name in names {
            let Some(media_type) = MediaType::from_file_name(&name) else {
                skipped += 1;
                continue;
            };
            let path = join_remote_path(album, &name);
            let stat = match self.device.stat(&path) {
                Ok(stat) if !stat.is_dir => stat,
                Ok(_) => {
                    skipped += 1;
                    continue;
                }
                Err(error) => {
                    warn!(path = %path, error = %error, "excluding entry after stat failure");
                    skipped += 1;
                    continue;
                }
            };
            let captured_at = resolve_capture_time(&stat, &name, now);
            entries.push(MediaEntry::new(path, name, media_type, captured_at, stat.size));
        }
        let undated = entries
            .iter()
            .filter(|e| e.captured_at_source() == CaptureTimeSource::Fallback)
            .count();
        info!(
            album,
            device = self.device.label(),
            entries = entries.len(),
            skipped,
            undated,
            "album enumerated"
        );
        Ok(entries)
    }

    fn replace_entries(&mut self, entries: Vec<MediaEntry>) {
        self.by_path = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.path().to_string(), i))
            .collect();
        self.entries = entries;
        self.rebuild_projection();
    }

    fn rebuild_projection(&mut self) {
        self.visible = visible_indices(&self.entries, self.filter, self.sort);
    }

    pub fn filter_type(&self) -> FilterType {
        self.filter
    }

    pub fn set_filter_type(&mut self, filter: FilterType) {
        if self.filter != filter {
            self.filter = filter;
            self.rebuild_projection();
        }
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort
    }

    pub fn set_sort_order(&mut self, sort: SortOrder) {
        if self.sort != sort {
            self.sort = sort;
            self.rebuild_projection();
        }
    }

    pub fn entry_count(&self) -> usize {
        self.visible.len()
    }

    pub fn entry_at(&self, index: usize) -> Option<&MediaEntry> {
        self.visible.get(index).map(|&i| &self.entries[i])
    }

    /// Starts a decode for the row unless it is cached or already in flight.
    pub fn request_thumbnail_for(&mut self, index: usize) -> Option<ThumbnailState> {
        let full = *self.visible.get(index)?;
        if self.pipeline.cached(self.entries[full].path()).is_some() {
            return Some(ThumbnailState::Ready);
        }
        if !self.pipeline.is_in_flight(self.entries[full].path()) {
            let entry = &mut self.entries[full];
            entry.mark_thumbnail_requested();
            self.failed.remove(entry.path());
            self.pipeline.request(entry.path(), entry.media_type());
        }
        Some(ThumbnailState::Pending)
    }

    pub fn display_name(&self, index: usize) -> Option<&str> {
        self.entry_at(index).map(MediaEntry::file_name)
    }

    pub fn type_tag(&self, index: usize) -> Option<&'static str> {
        self.entry_at(index).map(MediaEntry::type_tag)
    }

    pub fn tooltip(&self, index: usize) -> Option<String> {
        self.entry_at(index).map(MediaEntry::tooltip)
    }

    /// Display-time hook: the cached thumbnail, or the type's placeholder
    /// while a decode is pending (or after one failed, which also retries).
    pub fn decoration(&mut self, index: usize) -> Option<Decoration> {
        let full = *self.visible.get(index)?;
        if let Some(thumb) = self.pipeline.cached(self.entries[full].path()) {
            return Some(Decoration::Thumbnail(thumb));
        }
        self.request_thumbnail_for(index);
        Some(Decoration::Placeholder(PlaceholderIcon::for_media(
            self.entries[full].media_type(),
        )))
    }

    /// Cached thumbnail for the row. Neither starts a decode nor counts as a
    /// display use for eviction.
    pub fn cached_thumbnail(&self, index: usize) -> Option<Arc<Thumbnail>> {
        let entry = self.entry_at(index)?;
        self.pipeline.cache().peek(entry.path())
    }

    pub fn thumbnail_state(&self, index: usize) -> Option<ThumbnailState> {
        let entry = self.entry_at(index)?;
        let state = if self.pipeline.cache().contains(entry.path()) {
            ThumbnailState::Ready
        } else if self.pipeline.is_in_flight(entry.path()) {
            ThumbnailState::Pending
        } else if self.failed.contains(entry.path()) {
            ThumbnailState::Failed
        } else {
            ThumbnailState::NotRequested
        };
        Some(state)
    }

    pub fn file_path(&self, index: usize) -> Option<&str> {
        self.entry_at(index).map(MediaEntry::path)
    }

    pub fn file_type(&self, index: usize) -> Option<MediaType> {
        self.entry_at(index).map(MediaEntry::media_type)
    }

    /// Paths of the given visible rows; out-of-range indices are skipped.
    pub fn selected_file_paths(&self, indexes: &[usize]) -> Vec<String> {
        indexes
            .iter()
            .filter_map(|&i| self.file_path(i))
            .map(str::to_string)
            .collect()
    }

    /// Every entry of the album in enumeration order, ignoring the filter.
    pub fn all_file_paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path().to_string()).collect()
    }

    /// Visible entries in display order.
    pub fn filtered_file_paths(&self) -> Vec<String> {
        self.visible
            .iter()
            .map(|&i| self.entries[i].path().to_string())
            .collect()
    }

    pub fn process_completions(&mut self) -> Vec<CatalogEvent> {
        let events = self.pipeline.process_completions();
        self.apply_events(events)
    }

    pub fn wait_for_completions(&mut self, timeout: Duration) -> Vec<CatalogEvent> {
        let events = self.pipeline.wait_for_completions(timeout);
        self.apply_events(events)
    }

    fn apply_events(&mut self, events: Vec<PipelineEvent>) -> Vec<CatalogEvent> {
        let mut changed = Vec::new();
        for event in events {
            match event {
                PipelineEvent::Ready { key } => {
                    self.failed.remove(&key);
                    let Some(index) = self.visible_index_of(&key) else {
                        debug!(path = %key, "thumbnail ready for hidden entry");
                        continue;
                    };
                    changed.push(CatalogEvent::ThumbnailChanged { index, path: key });
                }
                PipelineEvent::Failed { key, error } => {
                    debug!(path = %key, error = %error, "keeping placeholder after failed decode");
                    self.failed.insert(key);
                }
            }
        }
        changed
    }

    fn visible_index_of(&self, path: &str) -> Option<usize> {
        let full = *self.by_path.get(path)?;
        self.visible.iter().position(|&i| i == full)
    }
}

impl std::fmt::Debug for CatalogModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogModel")
            .field("album_path", &self.album_path)
            .field("entries", &self.entries.len())
            .field("visible", &self.visible.len())
            .field("filter", &self.filter)
            .field("sort", &self.sort)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
