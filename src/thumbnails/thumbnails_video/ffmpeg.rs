//! First-frame extraction through libavformat with a custom I/O context whose
//! read and seek callbacks forward to a [`RemoteStream`].

use super::RgbFrame;
use crate::remote::{RemoteStream, SeekWhence};
use crate::thumbnails::{DecodeLimits, ThumbnailError, ThumbnailErrorCode};
use ffmpeg_sys_next::{
    av_frame_alloc, av_frame_free, av_free, av_freep, av_malloc, av_packet_alloc, av_packet_free,
    av_packet_unref, av_read_frame, avcodec_alloc_context3, avcodec_find_decoder,
    avcodec_free_context, avcodec_open2, avcodec_parameters_to_context, avcodec_receive_frame,
    avcodec_send_packet, avformat_alloc_context, avformat_close_input, avformat_find_stream_info,
    avformat_free_context, avformat_open_input, avio_alloc_context, avio_context_free,
    sws_freeContext, sws_getContext, sws_scale, AVCodecContext, AVFormatContext, AVFrame,
    AVIOContext, AVMediaType, AVPacket, AVPixelFormat, SwsContext, AVERROR, AVERROR_EOF,
    AVFMT_FLAG_CUSTOM_IO, AVSEEK_FORCE, AVSEEK_SIZE, SWS_BILINEAR,
};
use libc::{c_int, c_void, EIO, SEEK_CUR, SEEK_END, SEEK_SET};
use std::ptr;
use tracing::debug;

// sws_scale may write a little past the last row with SIMD stores.
const SWS_OUTPUT_PADDING: usize = 64;

pub(super) fn decode_first_frame(
    stream: RemoteStream,
    limits: &DecodeLimits,
) -> Result<RgbFrame, ThumbnailError> {
    let path = stream.path().to_string();
    let result = unsafe { decode_first_frame_unchecked(stream, limits) };
    if let Err(err) = &result {
        debug!(path = %path, error = %err, "video decode failed");
    }
    result
}

unsafe fn decode_first_frame_unchecked(
    stream: RemoteStream,
    limits: &DecodeLimits,
) -> Result<RgbFrame, ThumbnailError> {
    // Everything that reads through `avio` lives inside `demux_first_frame`
    // and is freed before it.
    let avio = AvioGuard::new(stream, limits.stream_block_size)?;
    match demux_first_frame(&avio, limits) {
        Err(err) if err.code() != ThumbnailErrorCode::Transport => {
            Err(avio.transport_error().unwrap_or(err))
        }
        result => result,
    }
}

unsafe fn demux_first_frame(
    avio: &AvioGuard,
    limits: &DecodeLimits,
) -> Result<RgbFrame, ThumbnailError> {
    let mut format = FormatGuard {
        ptr: avformat_alloc_context(),
        opened: false,
    };
    if format.ptr.is_null() {
        return Err(ThumbnailError::exhausted("Failed to allocate format context"));
    }
    (*format.ptr).pb = avio.ctx;
    (*format.ptr).flags |= AVFMT_FLAG_CUSTOM_IO as c_int;

    // On failure libavformat frees the context and nulls the pointer.
    if avformat_open_input(&mut format.ptr, ptr::null(), ptr::null(), ptr::null_mut()) < 0 {
        return Err(ThumbnailError::unsupported("Unrecognized container"));
    }
    format.opened = true;

    if avformat_find_stream_info(format.ptr, ptr::null_mut()) < 0 {
        return Err(ThumbnailError::corrupt("Failed to read stream info"));
    }

    let mut video = None;
    for i in 0..(*format.ptr).nb_streams as usize {
        let av_stream = *(*format.ptr).streams.add(i);
        if av_stream.is_null() {
            continue;
        }
        let params = (*av_stream).codecpar;
        if !params.is_null() && (*params).codec_type == AVMediaType::AVMEDIA_TYPE_VIDEO {
            video = Some((i as c_int, params));
            break;
        }
    }
    let (stream_index, params) =
        video.ok_or_else(|| ThumbnailError::unsupported("No video stream in container"))?;

    let codec = avcodec_find_decoder((*params).codec_id);
    if codec.is_null() {
        return Err(ThumbnailError::unsupported("No decoder for video codec"));
    }
    let codec_ctx = CodecGuard(avcodec_alloc_context3(codec));
    if codec_ctx.0.is_null() {
        return Err(ThumbnailError::exhausted("Failed to allocate codec context"));
    }
    if avcodec_parameters_to_context(codec_ctx.0, params) < 0 {
        return Err(ThumbnailError::corrupt("Invalid codec parameters"));
    }
    if avcodec_open2(codec_ctx.0, codec, ptr::null_mut()) < 0 {
        return Err(ThumbnailError::unsupported("Failed to open video decoder"));
    }

    let frame = FrameGuard(av_frame_alloc());
    let packet = PacketGuard(av_packet_alloc());
    if frame.0.is_null() || packet.0.is_null() {
        return Err(ThumbnailError::exhausted("Failed to allocate frame"));
    }

    let mut decoded = false;
    while av_read_frame(format.ptr, packet.0) >= 0 {
        if (*packet.0).stream_index == stream_index
            && avcodec_send_packet(codec_ctx.0, packet.0) >= 0
            && avcodec_receive_frame(codec_ctx.0, frame.0) >= 0
        {
            decoded = true;
        }
        av_packet_unref(packet.0);
        if decoded {
            break;
        }
    }
    // Decoders with frame delay only give up their first frame on flush.
    if !decoded
        && avcodec_send_packet(codec_ctx.0, ptr::null()) >= 0
        && avcodec_receive_frame(codec_ctx.0, frame.0) >= 0
    {
        decoded = true;
    }
    if !decoded {
        return Err(ThumbnailError::corrupt("No decodable video frame"));
    }

    frame_to_rgb(frame.0, limits)
}

/// The decoder's output format, which may differ from what the stream
/// parameters announced.
unsafe fn frame_pixel_format(frame: *const AVFrame) -> Option<AVPixelFormat> {
    let raw = (*frame).format;
    if raw < 0 || raw >= AVPixelFormat::AV_PIX_FMT_NB as c_int {
        return None;
    }
    // AVPixelFormat is a dense C enum; `raw` is inside its range.
    Some(std::mem::transmute::<c_int, AVPixelFormat>(raw))
}

unsafe fn frame_to_rgb(frame: *mut AVFrame, limits: &DecodeLimits) -> Result<RgbFrame, ThumbnailError> {
    let src_format = frame_pixel_format(frame)
        .ok_or_else(|| ThumbnailError::unsupported("Video frame has no pixel format"))?;
    let width = (*frame).width;
    let height = (*frame).height;
    if width <= 0 || height <= 0 {
        return Err(ThumbnailError::corrupt("Video frame has no pixels"));
    }
    if width as u32 > limits.max_source_dim || height as u32 > limits.max_source_dim {
        return Err(ThumbnailError::exhausted("Video frame too large for thumbnail"));
    }

    let sws = SwsGuard(sws_getContext(
        width,
        height,
        src_format,
        width,
        height,
        AVPixelFormat::AV_PIX_FMT_RGB24,
        SWS_BILINEAR as c_int,
        ptr::null_mut(),
        ptr::null_mut(),
        ptr::null(),
    ));
    if sws.0.is_null() {
        return Err(ThumbnailError::unsupported("Unsupported video pixel format"));
    }

    let row_bytes = width as usize * 3;
    let len = row_bytes * height as usize;
    let mut data = Vec::new();
    data.try_reserve_exact(len + SWS_OUTPUT_PADDING)
        .map_err(|_| ThumbnailError::exhausted("Out of memory converting video frame"))?;
    data.resize(len + SWS_OUTPUT_PADDING, 0u8);

    let dst_planes: [*mut u8; 4] = [data.as_mut_ptr(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut()];
    let dst_strides: [c_int; 4] = [row_bytes as c_int, 0, 0, 0];
    let rows = sws_scale(
        sws.0,
        (*frame).data.as_ptr() as *const *const u8,
        (*frame).linesize.as_ptr(),
        0,
        height,
        dst_planes.as_ptr(),
        dst_strides.as_ptr(),
    );
    if rows != height {
        return Err(ThumbnailError::corrupt("Video frame conversion failed"));
    }
    data.truncate(len);

    Ok(RgbFrame {
        width: width as u32,
        height: height as u32,
        data,
    })
}

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || buf_size <= 0 {
        return AVERROR(EIO);
    }
    let source = &mut *(opaque as *mut AvioSource);
    let out = std::slice::from_raw_parts_mut(buf, buf_size as usize);
    match source.stream.read_chunk(out) {
        Ok(0) => AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(err) => {
            debug!(path = source.stream.path(), error = %err, "remote read failed during demux");
            source.failure = Some(err.to_string());
            AVERROR(EIO)
        }
    }
}

unsafe extern "C" fn seek_packet(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    if opaque.is_null() {
        return i64::from(AVERROR(EIO));
    }
    let source = &mut *(opaque as *mut AvioSource);
    if whence & AVSEEK_SIZE as c_int != 0 {
        return source.stream.size() as i64;
    }
    let whence = match whence & !(AVSEEK_FORCE as c_int) {
        SEEK_SET => SeekWhence::Start,
        SEEK_CUR => SeekWhence::Current,
        SEEK_END => SeekWhence::End,
        _ => return i64::from(AVERROR(EIO)),
    };
    match source.stream.seek_to(offset, whence) {
        Ok(pos) => pos as i64,
        Err(_) => i64::from(AVERROR(EIO)),
    }
}

/// What the I/O callbacks see behind `opaque`. A failed device read is
/// remembered so it can be reported as a transport error rather than as
/// whatever libavformat makes of the short input.
struct AvioSource {
    stream: RemoteStream,
    failure: Option<String>,
}

/// Owns the AVIO context, its buffer and the boxed source behind `opaque`.
struct AvioGuard {
    ctx: *mut AVIOContext,
    buffer: *mut u8,
    opaque: *mut AvioSource,
}

impl AvioGuard {
    unsafe fn new(stream: RemoteStream, block_size: usize) -> Result<Self, ThumbnailError> {
        let mut guard = Self {
            ctx: ptr::null_mut(),
            buffer: ptr::null_mut(),
            opaque: Box::into_raw(Box::new(AvioSource {
                stream,
                failure: None,
            })),
        };
        guard.buffer = av_malloc(block_size) as *mut u8;
        if guard.buffer.is_null() {
            return Err(ThumbnailError::exhausted("Failed to allocate I/O buffer"));
        }
        guard.ctx = avio_alloc_context(
            guard.buffer,
            block_size as c_int,
            0,
            guard.opaque as *mut c_void,
            Some(read_packet),
            None,
            Some(seek_packet),
        );
        if guard.ctx.is_null() {
            return Err(ThumbnailError::exhausted("Failed to allocate I/O context"));
        }
        // The context owns the buffer from here on and may reallocate it.
        guard.buffer = ptr::null_mut();
        Ok(guard)
    }

    fn transport_error(&self) -> Option<ThumbnailError> {
        // Callbacks only run inside libav calls made on this thread.
        let source = unsafe { &*self.opaque };
        source
            .failure
            .as_ref()
            .map(|msg| ThumbnailError::transport(format!("Device read failed during demux: {msg}")))
    }
}

impl Drop for AvioGuard {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                av_freep(ptr::addr_of_mut!((*self.ctx).buffer) as *mut c_void);
                avio_context_free(&mut self.ctx);
            }
            if !self.buffer.is_null() {
                av_free(self.buffer as *mut c_void);
                self.buffer = ptr::null_mut();
            }
            if !self.opaque.is_null() {
                // Dropping the stream closes the device handle.
                drop(Box::from_raw(self.opaque));
                self.opaque = ptr::null_mut();
            }
        }
    }
}

struct FormatGuard {
    ptr: *mut AVFormatContext,
    opened: bool,
}

impl Drop for FormatGuard {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        unsafe {
            if self.opened {
                avformat_close_input(&mut self.ptr);
            } else {
                avformat_free_context(self.ptr);
            }
        }
        self.ptr = ptr::null_mut();
    }
}

struct CodecGuard(*mut AVCodecContext);

impl Drop for CodecGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { avcodec_free_context(&mut self.0) };
        }
    }
}

struct FrameGuard(*mut AVFrame);

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { av_frame_free(&mut self.0) };
        }
    }
}

struct PacketGuard(*mut AVPacket);

impl Drop for PacketGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { av_packet_free(&mut self.0) };
        }
    }
}

struct SwsGuard(*mut SwsContext);

impl Drop for SwsGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { sws_freeContext(self.0) };
        }
    }
}
