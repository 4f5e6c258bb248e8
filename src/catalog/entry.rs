use super::timestamp::CaptureTimeSource;
use crate::media::MediaType;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One recognized media file of an album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEntry {
    path: String,
    file_name: String,
    media_type: MediaType,
    captured_at: DateTime<Utc>,
    captured_at_source: CaptureTimeSource,
    size: u64,
    #[serde(skip)]
    thumbnail_requested: bool,
}

impl MediaEntry {
    pub(crate) fn new(
        path: String,
        file_name: String,
        media_type: MediaType,
        captured_at: (DateTime<Utc>, CaptureTimeSource),
        size: u64,
    ) -> Self {
        Self {
            path,
            file_name,
            media_type,
            captured_at: captured_at.0,
            captured_at_source: captured_at.1,
            size,
            thumbnail_requested: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn captured_at_source(&self) -> CaptureTimeSource {
        self.captured_at_source
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn thumbnail_requested(&self) -> bool {
        self.thumbnail_requested
    }

    pub(crate) fn mark_thumbnail_requested(&mut self) {
        self.thumbnail_requested = true;
    }

    /// `"Photo"` or `"Video"`.
    pub fn type_tag(&self) -> &'static str {
        match self.media_type {
            MediaType::Image => "Photo",
            MediaType::Video => "Video",
        }
    }

    pub fn tooltip(&self) -> String {
        format!("{}: {}", self.type_tag(), self.file_name)
    }
}
