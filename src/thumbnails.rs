//! Thumbnail production: per-media decode paths, the cost-bounded cache,
//! the video decode gate and the request pipeline that ties them together.

use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbaImage};
use std::sync::Arc;

mod cache;
mod error;
mod gate;
mod pipeline;
mod thumbnails_heif;
mod thumbnails_image;
mod thumbnails_video;

pub use cache::ThumbnailCache;
pub use error::{ThumbnailError, ThumbnailErrorCode};
pub use gate::{DecodeGate, GatePermit};
pub use pipeline::{
    PipelineEvent, RequestStatus, Subscription, ThumbnailOutcome, ThumbnailPipeline,
};
pub use thumbnails_image::decode_image_thumbnail;
pub use thumbnails_video::{frame_to_thumbnail, RgbFrame};

use crate::config::ThumbnailConfig;
use crate::media::MediaType;
use crate::remote::{DeviceConnection, RemoteStream};

// Smooth downscale; nearest-neighbour aliases badly at thumbnail sizes.
const SCALE_FILTER: FilterType = FilterType::CatmullRom;

/// Box a thumbnail must fit in, aspect ratio preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

/// Finished RGBA8 thumbnail.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    image: RgbaImage,
}

impl Thumbnail {
    pub fn from_image(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Cache cost in bytes: four per pixel.
    pub fn cost(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height()) * 4
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

/// Fits `img` into `size` keeping its aspect ratio.
pub fn scale_to_box(img: &DynamicImage, size: ThumbnailSize) -> Result<Thumbnail, ThumbnailError> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(ThumbnailError::corrupt("Decoded image has no pixels"));
    }
    let scaled = img.resize(size.width, size.height, SCALE_FILTER);
    Ok(Thumbnail::from_image(scaled.to_rgba8()))
}

/// Byte and dimension ceilings applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_image_bytes: u64,
    pub max_source_dim: u32,
    pub stream_block_size: usize,
}

impl DecodeLimits {
    pub fn from_config(config: &ThumbnailConfig) -> Self {
        Self {
            max_image_bytes: config.max_image_bytes,
            max_source_dim: config.max_source_dim,
            stream_block_size: config.stream_block_size,
        }
    }

    /// Allocation ceiling for a decoded RGBA surface at the maximum size.
    pub fn max_decode_bytes(&self) -> u64 {
        u64::from(self.max_source_dim) * u64::from(self.max_source_dim) * 4
    }
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self::from_config(&ThumbnailConfig::default())
    }
}

/// One unit of decode work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub path: String,
    pub media_type: MediaType,
    pub size: ThumbnailSize,
}

/// Produces a thumbnail for a job. Runs on pool threads.
pub trait ThumbnailRenderer: Send + Sync {
    fn render(&self, job: &RenderJob) -> Result<Thumbnail, ThumbnailError>;
}

/// Renders straight from the device: streamed demux for videos, whole-file
/// decode for stills.
#[derive(Debug)]
pub struct DeviceRenderer {
    device: Arc<DeviceConnection>,
    limits: DecodeLimits,
}

impl DeviceRenderer {
    pub fn new(device: Arc<DeviceConnection>, limits: DecodeLimits) -> Self {
        Self { device, limits }
    }
}

impl ThumbnailRenderer for DeviceRenderer {
    fn render(&self, job: &RenderJob) -> Result<Thumbnail, ThumbnailError> {
        match job.media_type {
            MediaType::Video => thumbnails_video::render_video_thumbnail(
                &self.device,
                &job.path,
                job.size,
                &self.limits,
            ),
            MediaType::Image => thumbnails_image::render_image_thumbnail(
                &self.device,
                &job.path,
                job.size,
                &self.limits,
            ),
        }
    }
}

/// Opens a stream for a decode task. The connection gets one reconnect if
/// the open fails transiently; the stream adapter itself never retries.
fn open_stream(device: &Arc<DeviceConnection>, path: &str) -> Result<RemoteStream, ThumbnailError> {
    let handle = device.open_with_retry(path)?;
    Ok(RemoteStream::from_handle(Arc::clone(device), path, handle)?)
}
