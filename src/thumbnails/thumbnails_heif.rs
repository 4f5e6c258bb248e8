use super::{DecodeLimits, ThumbnailError};
use image::DynamicImage;

#[cfg(feature = "heif")]
pub(super) fn decode_heif(data: &[u8], limits: &DecodeLimits) -> Result<DynamicImage, ThumbnailError> {
    use image::RgbImage;
    use libheif_rs::{ColorSpace, HeifContext, LibHeif, RgbChroma};

    let heif_err = |e: libheif_rs::HeifError| ThumbnailError::corrupt(format!("HEIF decode failed: {e}"));

    let ctx = HeifContext::read_from_bytes(data).map_err(heif_err)?;
    let handle = ctx.primary_image_handle().map_err(heif_err)?;
    if handle.width() > limits.max_source_dim || handle.height() > limits.max_source_dim {
        return Err(ThumbnailError::exhausted(
            "Image dimensions too large for thumbnail",
        ));
    }

    let heif = LibHeif::new();
    let decoded = heif
        .decode(&handle, ColorSpace::Rgb(RgbChroma::Rgb), None)
        .map_err(heif_err)?;
    let planes = decoded.planes();
    let plane = planes
        .interleaved
        .ok_or_else(|| ThumbnailError::unsupported("HEIF image has no interleaved plane"))?;

    // Rows are stride-padded; copy out the visible RGB bytes only.
    let row_bytes = plane.width as usize * 3;
    let mut packed = Vec::new();
    packed
        .try_reserve_exact(row_bytes * plane.height as usize)
        .map_err(|_| ThumbnailError::exhausted("Out of memory unpacking HEIF image"))?;
    for y in 0..plane.height as usize {
        let start = y * plane.stride;
        let row = plane
            .data
            .get(start..start + row_bytes)
            .ok_or_else(|| ThumbnailError::corrupt("HEIF plane shorter than its stride"))?;
        packed.extend_from_slice(row);
    }

    let img = RgbImage::from_raw(plane.width, plane.height, packed)
        .ok_or_else(|| ThumbnailError::corrupt("HEIF buffer size mismatch"))?;
    Ok(DynamicImage::ImageRgb8(img))
}

#[cfg(not(feature = "heif"))]
pub(super) fn decode_heif(_data: &[u8], _limits: &DecodeLimits) -> Result<DynamicImage, ThumbnailError> {
    Err(ThumbnailError::unsupported(
        "HEIC/HEIF decoding is not enabled in this build",
    ))
}
