//! Thumbnail generation using the image crate.
//!
//! Decodes a source file (every frame for animated GIF/WebP) and scales it to
//! fit a square size-class box while preserving aspect ratio. Scaling always
//! uses the same filter so repeated calls on the same input are bit-identical,
//! which is what makes the disk store a valid cache.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::codecs::gif::GifDecoder;
use image::codecs::webp::WebPDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, ImageFormat, ImageReader, RgbaImage};
use tracing::{debug, trace};

use super::error::CodecError;
use super::key::SizeClass;

/// Resampling filter used for every scale operation.
const SCALE_FILTER: FilterType = FilterType::CatmullRom;

/// Display time for frames that declare no delay.
pub const DEFAULT_FRAME_DELAY: Duration = Duration::from_millis(100);

/// Grey level of the placeholder shown for pending/failed cells.
const PLACEHOLDER_GREY: u8 = 0x60;

/// Bytes per RGBA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// Immutable RGBA8 pixel buffer. Clones share the same allocation.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl Bitmap {
    /// Wrap raw RGBA8 pixels. Returns `None` when the buffer length does not
    /// match the dimensions.
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize) * (height as usize) * BYTES_PER_PIXEL;
        (pixels.len() == expected).then(|| Self {
            width,
            height,
            pixels: pixels.into(),
        })
    }

    pub fn from_rgba(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            pixels: img.into_raw().into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn memory_bytes(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// One displayable frame and how long it stays on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bitmap: Bitmap,
    pub duration: Duration,
}

/// Scaled output of the codec: one frame for stills, several for animations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    frames: Arc<[Frame]>,
}

impl Thumbnail {
    /// Returns `None` for an empty frame list.
    pub fn from_frames(frames: Vec<Frame>) -> Option<Self> {
        (!frames.is_empty()).then(|| Self {
            frames: frames.into(),
        })
    }

    pub fn still(bitmap: Bitmap) -> Self {
        Self {
            frames: Arc::new([Frame {
                bitmap,
                duration: Duration::ZERO,
            }]),
        }
    }

    /// The first frame; what stills and paused grids render.
    pub fn bitmap(&self) -> &Bitmap {
        &self.frames[0].bitmap
    }

    pub fn frames(&self) -> &Arc<[Frame]> {
        &self.frames
    }

    pub fn is_animated(&self) -> bool {
        self.frames.len() > 1
    }

    pub fn memory_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.bitmap.memory_bytes()).sum()
    }
}

/// Decode + scale contract used by the worker pool.
pub trait ThumbnailCodec: Send + Sync {
    fn decode_and_scale(&self, path: &Path, size_class: SizeClass)
        -> Result<Thumbnail, CodecError>;
}

/// Codec backed by the `image` crate.
#[derive(Debug, Clone, Default)]
pub struct ThumbnailGenerator {
    /// Hard ceiling on source canvas pixels (width * height). `None` = unlimited.
    max_decode_pixels: Option<u64>,
}

impl ThumbnailGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decode_limit(max_decode_pixels: Option<u64>) -> Self {
        Self { max_decode_pixels }
    }

    /// Check if a source file can be processed as an image.
    pub fn can_generate(path: &Path) -> bool {
        Self::format_from_extension(path).is_some()
    }

    /// Determine image format from file extension.
    fn format_from_extension(path: &Path) -> Option<ImageFormat> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::WebP),
            "gif" => Some(ImageFormat::Gif),
            "bmp" => Some(ImageFormat::Bmp),
            "tiff" | "tif" => Some(ImageFormat::Tiff),
            _ => None,
        }
    }

    /// Fit `src` into a `target` square without upscaling.
    pub fn calculate_dimensions(src_width: u32, src_height: u32, target: u32) -> (u32, u32) {
        if src_width == 0 || src_height == 0 {
            return (target.max(1), target.max(1));
        }
        if src_width <= target && src_height <= target {
            return (src_width, src_height);
        }

        let scale = f64::min(
            target as f64 / src_width as f64,
            target as f64 / src_height as f64,
        );
        let width = ((src_width as f64 * scale).round() as u32).clamp(1, target);
        let height = ((src_height as f64 * scale).round() as u32).clamp(1, target);
        (width, height)
    }

    fn check_limits(&self, bytes: &[u8], format: ImageFormat) -> Result<(), CodecError> {
        let Some(limit) = self.max_decode_pixels else {
            return Ok(());
        };
        let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
            .into_dimensions()
            .map_err(CodecError::from)?;
        let pixels = width as u64 * height as u64;
        if pixels > limit {
            return Err(CodecError::TooLarge(format!(
                "{width}x{height} exceeds {limit} pixels"
            )));
        }
        Ok(())
    }

    /// Decode every frame at full resolution.
    fn decode_frames(
        bytes: Vec<u8>,
        format: ImageFormat,
    ) -> Result<Vec<(RgbaImage, Duration)>, CodecError> {
        match format {
            ImageFormat::Gif => {
                let decoder = GifDecoder::new(Cursor::new(bytes))?;
                Self::collect_animation(decoder)
            }
            ImageFormat::WebP => {
                let decoder = WebPDecoder::new(Cursor::new(bytes))?;
                if decoder.has_animation() {
                    Self::collect_animation(decoder)
                } else {
                    let img = DynamicImage::from_decoder(decoder)?;
                    Ok(vec![(img.into_rgba8(), Duration::ZERO)])
                }
            }
            _ => {
                let img = image::load_from_memory_with_format(&bytes, format)?;
                Ok(vec![(img.into_rgba8(), Duration::ZERO)])
            }
        }
    }

    fn collect_animation<'a>(
        decoder: impl AnimationDecoder<'a>,
    ) -> Result<Vec<(RgbaImage, Duration)>, CodecError> {
        let frames = decoder.into_frames().collect_frames()?;
        let single = frames.len() == 1;
        Ok(frames
            .into_iter()
            .map(|frame| {
                let (numer, denom) = frame.delay().numer_denom_ms();
                let millis = if denom == 0 { 0 } else { numer / denom };
                let duration = match (single, millis) {
                    (true, _) => Duration::ZERO,
                    (false, 0) => DEFAULT_FRAME_DELAY,
                    (false, ms) => Duration::from_millis(ms as u64),
                };
                (frame.into_buffer(), duration)
            })
            .collect())
    }

    fn scale(img: RgbaImage, size_class: SizeClass) -> RgbaImage {
        let (src_width, src_height) = img.dimensions();
        let (width, height) = Self::calculate_dimensions(src_width, src_height, size_class.pixels());
        if (width, height) == (src_width, src_height) {
            return img;
        }
        image::imageops::resize(&img, width, height, SCALE_FILTER)
    }
}

impl ThumbnailCodec for ThumbnailGenerator {
    fn decode_and_scale(
        &self,
        path: &Path,
        size_class: SizeClass,
    ) -> Result<Thumbnail, CodecError> {
        trace!(?path, %size_class, "Decoding thumbnail source");

        let bytes = std::fs::read(path).map_err(|e| CodecError::from_io(&e))?;
        let format = image::guess_format(&bytes)
            .map_err(|_| CodecError::Unsupported(path.display().to_string()))?;
        self.check_limits(&bytes, format)?;

        let frames: Vec<Frame> = Self::decode_frames(bytes, format)?
            .into_iter()
            .map(|(img, duration)| Frame {
                bitmap: Bitmap::from_rgba(Self::scale(img, size_class)),
                duration,
            })
            .collect();

        let thumbnail = Thumbnail::from_frames(frames)
            .ok_or_else(|| CodecError::Corrupt(format!("{} has no frames", path.display())))?;

        debug!(
            ?path,
            %size_class,
            width = thumbnail.bitmap().width(),
            height = thumbnail.bitmap().height(),
            frames = thumbnail.frames().len(),
            "Generated thumbnail"
        );
        Ok(thumbnail)
    }
}

/// Neutral square shown while a cell is pending or after it failed.
pub fn placeholder(size_class: SizeClass) -> Bitmap {
    let side = size_class.pixels();
    let mut img = RgbaImage::new(side, side);
    for pixel in img.pixels_mut() {
        *pixel = image::Rgba([PLACEHOLDER_GREY, PLACEHOLDER_GREY, PLACEHOLDER_GREY, 0xff]);
    }
    Bitmap::from_rgba(img)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::codecs::gif::{GifEncoder, Repeat};
    use image::{Delay, Rgba};
    use std::fs::File;
    use tempfile::tempdir;

    pub(crate) fn write_png(path: &Path, width: u32, height: u32) {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 0xff])
        });
        img.save_with_format(path, ImageFormat::Png).unwrap();
    }

    pub(crate) fn write_gif(path: &Path, delays_ms: &[u32]) {
        let file = File::create(path).unwrap();
        let mut encoder = GifEncoder::new(file);
        encoder.set_repeat(Repeat::Infinite).unwrap();
        for (i, ms) in delays_ms.iter().enumerate() {
            let shade = (i as u8).wrapping_mul(80);
            let buffer = RgbaImage::from_pixel(40, 20, Rgba([shade, 0, 0, 0xff]));
            let frame = image::Frame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(*ms, 1));
            encoder.encode_frame(frame).unwrap();
        }
    }

    #[test]
    fn test_calculate_dimensions_landscape() {
        let (w, h) = ThumbnailGenerator::calculate_dimensions(200, 150, 128);
        assert_eq!((w, h), (128, 96));
    }

    #[test]
    fn test_calculate_dimensions_portrait() {
        let (w, h) = ThumbnailGenerator::calculate_dimensions(150, 200, 128);
        assert_eq!((w, h), (96, 128));
    }

    #[test]
    fn test_calculate_dimensions_small_source() {
        // Source smaller than target - don't upscale
        let (w, h) = ThumbnailGenerator::calculate_dimensions(60, 30, 256);
        assert_eq!((w, h), (60, 30));
    }

    #[test]
    fn test_calculate_dimensions_extreme_panorama() {
        let (w, h) = ThumbnailGenerator::calculate_dimensions(10000, 10, 64);
        assert_eq!(w, 64);
        assert_eq!(h, 1);
    }

    #[test]
    fn test_can_generate() {
        assert!(ThumbnailGenerator::can_generate(Path::new("test.jpg")));
        assert!(ThumbnailGenerator::can_generate(Path::new("test.PNG")));
        assert!(!ThumbnailGenerator::can_generate(Path::new("test.txt")));
    }

    #[test]
    fn test_decode_and_scale_photo() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("photo.png");
        write_png(&path, 200, 150);

        let thumb = ThumbnailGenerator::new()
            .decode_and_scale(&path, SizeClass::NORMAL)
            .unwrap();
        assert!(!thumb.is_animated());
        assert_eq!(thumb.bitmap().width(), 128);
        assert_eq!(thumb.bitmap().height(), 96);
        assert_eq!(thumb.memory_bytes(), 128 * 96 * BYTES_PER_PIXEL);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("photo.png");
        write_png(&path, 333, 211);

        let codec = ThumbnailGenerator::new();
        let first = codec.decode_and_scale(&path, SizeClass::SMALL).unwrap();
        let second = codec.decode_and_scale(&path, SizeClass::SMALL).unwrap();
        assert_eq!(first.bitmap().pixels(), second.bitmap().pixels());
    }

    #[test]
    fn test_decode_animated_gif() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("anim.gif");
        write_gif(&path, &[100, 150, 200]);

        let thumb = ThumbnailGenerator::new()
            .decode_and_scale(&path, SizeClass::NORMAL)
            .unwrap();
        assert!(thumb.is_animated());
        let durations: Vec<_> = thumb.frames().iter().map(|f| f.duration).collect();
        assert_eq!(
            durations,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(150),
                Duration::from_millis(200)
            ]
        );
    }

    #[test]
    fn test_unsupported_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.png");
        std::fs::write(&path, b"plain text, not an image").unwrap();

        let err = ThumbnailGenerator::new()
            .decode_and_scale(&path, SizeClass::NORMAL)
            .unwrap_err();
        assert!(matches!(err, CodecError::Unsupported(_)));
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("photo.png");
        write_png(&path, 64, 64);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = ThumbnailGenerator::new()
            .decode_and_scale(&path, SizeClass::NORMAL)
            .unwrap_err();
        assert!(matches!(err, CodecError::Corrupt(_)), "got {err:?}");
    }

    #[test]
    fn test_missing_file_is_io() {
        let err = ThumbnailGenerator::new()
            .decode_and_scale(Path::new("/nonexistent/photo.png"), SizeClass::NORMAL)
            .unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }

    #[test]
    fn test_decode_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.png");
        write_png(&path, 100, 100);

        let err = ThumbnailGenerator::with_decode_limit(Some(5_000))
            .decode_and_scale(&path, SizeClass::NORMAL)
            .unwrap_err();
        assert!(matches!(err, CodecError::TooLarge(_)));

        assert!(ThumbnailGenerator::with_decode_limit(Some(10_000))
            .decode_and_scale(&path, SizeClass::NORMAL)
            .is_ok());
    }

    #[test]
    fn test_placeholder_fills_box() {
        let bitmap = placeholder(SizeClass::SMALL);
        assert_eq!((bitmap.width(), bitmap.height()), (64, 64));
        assert!(bitmap.pixels().chunks(4).all(|p| p == [0x60, 0x60, 0x60, 0xff]));
    }
}
