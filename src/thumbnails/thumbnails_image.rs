use super::{
    open_stream, scale_to_box, thumbnails_heif, DecodeLimits, Thumbnail, ThumbnailError,
    ThumbnailSize,
};
use crate::media::is_heif_file_name;
use crate::remote::{remote_file_name, DeviceConnection};
use image::{
    metadata::Orientation, DynamicImage, GenericImageView, GrayImage, ImageDecoder, ImageFormat,
    ImageReader, Limits, RgbImage,
};
use jpeg_decoder::{
    Decoder as JpegScaleDecoder, ImageInfo as JpegImageInfo, PixelFormat as JpegPixelFormat,
};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

// Decode JPEGs at twice the box so the final resize still has detail to work with.
const JPEG_SCALED_DECODE_TARGET_MULTIPLIER: u32 = 2;

pub(super) fn render_image_thumbnail(
    device: &Arc<DeviceConnection>,
    path: &str,
    size: ThumbnailSize,
    limits: &DecodeLimits,
) -> Result<Thumbnail, ThumbnailError> {
    let stream = open_stream(device, path)?;
    if stream.size() > limits.max_image_bytes {
        return Err(ThumbnailError::exhausted(format!(
            "Image too large to buffer: {} bytes",
            stream.size()
        )));
    }
    let data = stream
        .read_all(limits.stream_block_size)
        .map_err(|e| ThumbnailError::from_io_error("Read failed", e))?;
    decode_image_thumbnail(&data, remote_file_name(path), size, limits)
}

/// Decodes a fully buffered still and fits it into `size`. HEIC/HEIF is
/// picked by file name; everything else by content sniffing.
pub fn decode_image_thumbnail(
    data: &[u8],
    file_name: &str,
    size: ThumbnailSize,
    limits: &DecodeLimits,
) -> Result<Thumbnail, ThumbnailError> {
    if data.is_empty() {
        return Err(ThumbnailError::corrupt("Empty image file"));
    }

    if is_heif_file_name(file_name) {
        let img = thumbnails_heif::decode_heif(data, limits)?;
        return scale_to_box(&img, size);
    }

    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ThumbnailError::from_io_error("Failed to guess format", e))?;
    let format = reader
        .format()
        .ok_or_else(|| ThumbnailError::unsupported("Unsupported image format"))?;

    let (mut img, orientation) = if format == ImageFormat::Jpeg {
        match decode_jpeg_scaled(data, size, limits) {
            Ok(decoded) => {
                debug!(file = file_name, "jpeg scaled decode used");
                decoded
            }
            Err(err) => {
                debug!(file = file_name, reason = %err, "jpeg scaled decode fallback");
                decode_full(data, format, limits)?
            }
        }
    } else {
        decode_full(data, format, limits)?
    };

    let (src_w, src_h) = img.dimensions();
    if src_w > limits.max_source_dim || src_h > limits.max_source_dim {
        return Err(ThumbnailError::exhausted(
            "Image dimensions too large for thumbnail",
        ));
    }
    if let Some(orientation) = orientation {
        img.apply_orientation(orientation);
    }
    scale_to_box(&img, size)
}

fn decode_full(
    data: &[u8],
    format: ImageFormat,
    limits: &DecodeLimits,
) -> Result<(DynamicImage, Option<Orientation>), ThumbnailError> {
    let mut image_limits = Limits::default();
    image_limits.max_image_width = Some(limits.max_source_dim);
    image_limits.max_image_height = Some(limits.max_source_dim);
    image_limits.max_alloc = Some(limits.max_decode_bytes());

    let mut reader = ImageReader::with_format(Cursor::new(data), format);
    reader.limits(image_limits);

    let mut decoder = reader
        .into_decoder()
        .map_err(ThumbnailError::from_image_error)?;
    let orientation = decoder.orientation().ok();
    let img = DynamicImage::from_decoder(decoder).map_err(ThumbnailError::from_image_error)?;
    Ok((img, orientation))
}

fn decode_jpeg_scaled(
    data: &[u8],
    size: ThumbnailSize,
    limits: &DecodeLimits,
) -> Result<(DynamicImage, Option<Orientation>), ThumbnailError> {
    let mut decoder = JpegScaleDecoder::new(Cursor::new(data));
    decoder.set_max_decoding_buffer_size(
        limits.max_decode_bytes().min(usize::MAX as u64) as usize,
    );

    decoder
        .read_info()
        .map_err(|e| ThumbnailError::corrupt(format!("JPEG scaled decode failed: {e}")))?;
    let src_info = decoder
        .info()
        .ok_or_else(|| ThumbnailError::corrupt("JPEG scaled decode missing metadata"))?;
    if u32::from(src_info.width) > limits.max_source_dim
        || u32::from(src_info.height) > limits.max_source_dim
    {
        return Err(ThumbnailError::exhausted(
            "Image dimensions too large for thumbnail",
        ));
    }

    let req_w = scaled_request(size.width);
    let req_h = scaled_request(size.height);
    decoder
        .scale(req_w, req_h)
        .map_err(|e| ThumbnailError::corrupt(format!("JPEG scaled decode setup failed: {e}")))?;

    let pixels = decoder
        .decode()
        .map_err(|e| ThumbnailError::corrupt(format!("JPEG scaled decode failed: {e}")))?;
    let orientation = decoder.exif_data().and_then(Orientation::from_exif_chunk);
    let info = decoder
        .info()
        .ok_or_else(|| ThumbnailError::corrupt("JPEG scaled decode missing output metadata"))?;
    let img = jpeg_pixels_to_dynamic_image(pixels, info)?;
    Ok((img, orientation))
}

fn scaled_request(dim: u32) -> u16 {
    dim.saturating_mul(JPEG_SCALED_DECODE_TARGET_MULTIPLIER)
        .clamp(1, u32::from(u16::MAX)) as u16
}

fn jpeg_pixels_to_dynamic_image(
    pixels: Vec<u8>,
    info: JpegImageInfo,
) -> Result<DynamicImage, ThumbnailError> {
    let w = u32::from(info.width);
    let h = u32::from(info.height);
    match info.pixel_format {
        JpegPixelFormat::RGB24 => {
            let img = RgbImage::from_raw(w, h, pixels)
                .ok_or_else(|| ThumbnailError::corrupt("JPEG RGB buffer size mismatch"))?;
            Ok(DynamicImage::ImageRgb8(img))
        }
        JpegPixelFormat::L8 => {
            let img = GrayImage::from_raw(w, h, pixels)
                .ok_or_else(|| ThumbnailError::corrupt("JPEG L8 buffer size mismatch"))?;
            Ok(DynamicImage::ImageLuma8(img))
        }
        // CMYK and 16-bit gray go through the image crate instead.
        JpegPixelFormat::L16 | JpegPixelFormat::CMYK32 => Err(ThumbnailError::unsupported(
            format!("JPEG scaled decode unsupported pixel format: {:?}", info.pixel_format),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::decode_image_thumbnail;
    use crate::media::MediaType;
    use crate::remote::{DeviceConnection, RemoteFs};
    use crate::testing::MemoryFs;
    use crate::thumbnails::{
        DecodeLimits, DeviceRenderer, RenderJob, ThumbnailErrorCode, ThumbnailRenderer,
        ThumbnailSize,
    };
    use image::{codecs::jpeg::JpegEncoder, DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::Arc;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb([200, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb([10, 120, 220]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 85)
            .encode_image(&img)
            .expect("encode jpeg");
        out
    }

    #[test]
    fn png_is_fit_into_box() {
        let data = png_bytes(300, 150);
        let thumb = decode_image_thumbnail(
            &data,
            "IMG_0001.PNG",
            ThumbnailSize::new(120, 120),
            &DecodeLimits::default(),
        )
        .expect("decode");
        assert_eq!((thumb.width(), thumb.height()), (120, 60));
        assert_eq!(&thumb.pixels()[..4], &[200, 40, 40, 255]);
    }

    #[test]
    fn jpeg_takes_scaled_path_and_keeps_aspect() {
        let data = jpeg_bytes(800, 600);
        let thumb = decode_image_thumbnail(
            &data,
            "IMG_0002.JPG",
            ThumbnailSize::new(120, 120),
            &DecodeLimits::default(),
        )
        .expect("decode");
        assert_eq!((thumb.width(), thumb.height()), (120, 90));
    }

    #[test]
    fn garbage_and_empty_inputs_fail_cleanly() {
        let limits = DecodeLimits::default();
        let size = ThumbnailSize::new(120, 120);

        let err = decode_image_thumbnail(&[], "a.jpg", size, &limits).expect_err("empty");
        assert_eq!(err.code(), ThumbnailErrorCode::CorruptData);

        let err = decode_image_thumbnail(b"definitely not an image", "a.png", size, &limits)
            .expect_err("garbage");
        assert_eq!(err.code(), ThumbnailErrorCode::UnsupportedFormat);

        let mut truncated = jpeg_bytes(64, 64);
        truncated.truncate(100);
        assert!(decode_image_thumbnail(&truncated, "a.jpg", size, &limits).is_err());
    }

    #[test]
    fn oversized_source_is_resource_exhaustion() {
        let data = png_bytes(200, 20);
        let limits = DecodeLimits {
            max_source_dim: 100,
            ..DecodeLimits::default()
        };
        let err = decode_image_thumbnail(&data, "wide.png", ThumbnailSize::new(120, 120), &limits)
            .expect_err("too wide");
        assert_eq!(err.code(), ThumbnailErrorCode::ResourceExhaustion);
    }

    fn device_renderer(limits: DecodeLimits) -> (Arc<MemoryFs>, DeviceRenderer) {
        let fs = Arc::new(MemoryFs::new());
        let device = Arc::new(DeviceConnection::new("phone", Arc::clone(&fs) as Arc<dyn RemoteFs>));
        (fs, DeviceRenderer::new(device, limits))
    }

    fn image_job(path: &str) -> RenderJob {
        RenderJob {
            path: path.to_string(),
            media_type: MediaType::Image,
            size: ThumbnailSize::new(120, 120),
        }
    }

    #[test]
    fn device_image_is_read_decoded_and_closed() {
        let limits = DecodeLimits {
            stream_block_size: 4096,
            ..DecodeLimits::default()
        };
        let (fs, renderer) = device_renderer(limits);
        let data = jpeg_bytes(640, 480);
        let len = data.len();
        fs.insert_file("/DCIM/A/IMG_0001.JPG", data);

        let thumb = renderer.render(&image_job("/DCIM/A/IMG_0001.JPG")).expect("render");
        assert_eq!((thumb.width(), thumb.height()), (120, 90));
        assert_eq!(fs.open_handles(), 0);
        assert_eq!(fs.closes(), 1);
        let requests = fs.read_requests();
        assert_eq!(requests.iter().sum::<usize>(), len);
        assert!(requests.iter().all(|&n| n <= 4096));
    }

    #[test]
    fn transient_open_failure_reconnects_once() {
        let (fs, renderer) = device_renderer(DecodeLimits::default());
        fs.insert_file("/DCIM/A/IMG_0002.PNG", png_bytes(300, 150));
        fs.fail_next_opens(1);

        let thumb = renderer.render(&image_job("/DCIM/A/IMG_0002.PNG")).expect("render");
        assert_eq!((thumb.width(), thumb.height()), (120, 60));
        assert_eq!(fs.reconnects(), 1);
        assert_eq!(fs.open_handles(), 0);

        fs.fail_next_opens(2);
        let err = renderer
            .render(&image_job("/DCIM/A/IMG_0002.PNG"))
            .expect_err("both attempts fail");
        assert_eq!(err.code(), ThumbnailErrorCode::Transport);
        assert_eq!(fs.reconnects(), 2);
    }

    #[test]
    fn device_image_error_paths_release_the_handle() {
        let limits = DecodeLimits {
            max_image_bytes: 1024,
            ..DecodeLimits::default()
        };
        let (fs, renderer) = device_renderer(limits);
        fs.insert_file("/DCIM/A/big.png", vec![0; 2048]);
        fs.insert_file("/DCIM/A/junk.jpg", vec![0x42; 512]);
        fs.insert_file("/DCIM/A/cut.png", png_bytes(16, 16));
        fs.truncate_reads_after("/DCIM/A/cut.png", 10);

        let err = renderer.render(&image_job("/DCIM/A/big.png")).expect_err("over cap");
        assert_eq!(err.code(), ThumbnailErrorCode::ResourceExhaustion);
        assert!(fs.read_requests().is_empty());
        assert_eq!(fs.open_handles(), 0);

        let err = renderer.render(&image_job("/DCIM/A/junk.jpg")).expect_err("junk");
        assert_eq!(err.code(), ThumbnailErrorCode::UnsupportedFormat);
        assert_eq!(fs.open_handles(), 0);

        let err = renderer.render(&image_job("/DCIM/A/cut.png")).expect_err("short read");
        assert_eq!(err.code(), ThumbnailErrorCode::Transport);
        assert_eq!(fs.open_handles(), 0);
        assert_eq!(fs.closes(), 3);

        let err = renderer.render(&image_job("/DCIM/A/gone.png")).expect_err("missing");
        assert_eq!(err.code(), ThumbnailErrorCode::Transport);
        assert_eq!(fs.reconnects(), 0);
    }

    #[cfg(not(feature = "heif"))]
    #[test]
    fn heic_without_decoder_is_unsupported() {
        let err = decode_image_thumbnail(
            b"\0\0\0\x18ftypheic",
            "IMG_0003.HEIC",
            ThumbnailSize::new(120, 120),
            &DecodeLimits::default(),
        )
        .expect_err("no heif");
        assert_eq!(err.code(), ThumbnailErrorCode::UnsupportedFormat);
    }
}
