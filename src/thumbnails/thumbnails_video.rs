use super::{open_stream, scale_to_box, DecodeLimits, Thumbnail, ThumbnailError, ThumbnailSize};
use crate::remote::{DeviceConnection, RemoteStream};
use image::{DynamicImage, RgbImage};
use std::sync::Arc;
use tracing::debug;

#[cfg(feature = "ffmpeg")]
mod ffmpeg;

/// First decoded video frame as packed RGB24 at native resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Demuxes the file straight off the device and thumbnails its first frame.
/// Only the bytes the demuxer asks for cross the connection.
pub(super) fn render_video_thumbnail(
    device: &Arc<DeviceConnection>,
    path: &str,
    size: ThumbnailSize,
    limits: &DecodeLimits,
) -> Result<Thumbnail, ThumbnailError> {
    let stream = open_stream(device, path)?;
    let frame = decode_first_frame(stream, limits)?;
    debug!(path, width = frame.width, height = frame.height, "video frame decoded");
    frame_to_thumbnail(frame, size)
}

pub fn frame_to_thumbnail(frame: RgbFrame, size: ThumbnailSize) -> Result<Thumbnail, ThumbnailError> {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.data)
        .ok_or_else(|| ThumbnailError::corrupt("Video frame buffer size mismatch"))?;
    scale_to_box(&DynamicImage::ImageRgb8(img), size)
}

#[cfg(feature = "ffmpeg")]
fn decode_first_frame(stream: RemoteStream, limits: &DecodeLimits) -> Result<RgbFrame, ThumbnailError> {
    ffmpeg::decode_first_frame(stream, limits)
}

#[cfg(not(feature = "ffmpeg"))]
fn decode_first_frame(stream: RemoteStream, _limits: &DecodeLimits) -> Result<RgbFrame, ThumbnailError> {
    drop(stream);
    Err(ThumbnailError::unsupported(
        "Video decoding is not enabled in this build",
    ))
}
