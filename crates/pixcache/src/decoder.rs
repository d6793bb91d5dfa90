//! Bitmap decoding with down-sampling to a requested size
//!
//! Decoding is two-phase: a bounds-only pass reads the native dimensions,
//! the [`ResizingStrategy`] turns them into a power-of-two sample factor,
//! and the full pass produces pixels at the reduced size. Native-size
//! decodes whose color type matches the requested format write straight
//! into a pooled buffer.

use std::io::{Cursor, Read};

use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageDecoder as _, ImageReader};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bitmap::{Bitmap, PixelFormat};
use crate::error::Result;
use crate::pool::BufferPool;

/// How decoded images are sized relative to the requested dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizingStrategy {
    /// Decode at native size
    KeepOriginal,
    /// Down-sample by the largest power of two keeping both sides at least the requested size
    InputDownSampling {
        /// Keep halving until total pixels fall under `requested * aggressive_factor`
        aggressive: bool,
        /// Pixel budget multiplier for the aggressive pass
        aggressive_factor: u32,
    },
}

impl Default for ResizingStrategy {
    fn default() -> Self {
        ResizingStrategy::InputDownSampling {
            aggressive: false,
            aggressive_factor: 2,
        }
    }
}

impl ResizingStrategy {
    /// Integer down-sampling factor for an image of `width` x `height`
    ///
    /// A requested dimension of zero means "no limit".
    pub fn sample_size(&self, width: u32, height: u32, req_width: u32, req_height: u32) -> u32 {
        let (aggressive, factor) = match *self {
            ResizingStrategy::KeepOriginal => return 1,
            ResizingStrategy::InputDownSampling {
                aggressive,
                aggressive_factor,
            } => (aggressive, aggressive_factor),
        };
        if req_width == 0 || req_height == 0 {
            return 1;
        }

        let (w, h) = (width as u64, height as u64);
        let (rw, rh) = (req_width as u64, req_height as u64);
        let mut sample: u64 = 1;

        if w > rw || h > rh {
            while w / (sample * 2) >= rw && h / (sample * 2) >= rh {
                sample *= 2;
            }

            if aggressive {
                // Panoramas can satisfy both sides yet still hold far too many pixels
                let cap = rw * rh * factor.max(1) as u64;
                while (w * h) / (sample * sample) > cap {
                    sample *= 2;
                }
            }
        }
        sample.min(u32::MAX as u64) as u32
    }
}

/// Per-request decode parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Requested width; 0 for native
    pub target_width: u32,
    /// Requested height; 0 for native
    pub target_height: u32,
    /// Output pixel layout
    pub format: PixelFormat,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            target_width: 0,
            target_height: 0,
            format: PixelFormat::Rgba8,
        }
    }
}

/// Turns encoded image bytes into a [`Bitmap`]
///
/// Failure is reported as `None`: corrupt or unreadable input means "no
/// image available", never an error for the caller to propagate.
pub trait BitmapDecoder: Send + Sync {
    /// Decode an in-memory encoded image
    fn decode_bytes(
        &self,
        data: &[u8],
        options: &DecodeOptions,
        pool: Option<&BufferPool>,
    ) -> Option<Bitmap>;

    /// Decode from a stream
    fn decode(
        &self,
        source: &mut dyn Read,
        options: &DecodeOptions,
        pool: Option<&BufferPool>,
    ) -> Option<Bitmap> {
        let mut data = Vec::new();
        if let Err(e) = source.read_to_end(&mut data) {
            debug!(error = %e, "reading image source failed");
            return None;
        }
        self.decode_bytes(&data, options, pool)
    }
}

/// [`BitmapDecoder`] for the formats enabled in the `image` crate
#[derive(Debug, Clone, Default)]
pub struct ImageDecoder {
    strategy: ResizingStrategy,
}

impl ImageDecoder {
    /// Create a decoder using `strategy`
    pub fn new(strategy: ResizingStrategy) -> Self {
        Self { strategy }
    }

    /// Resizing strategy in use
    pub fn strategy(&self) -> ResizingStrategy {
        self.strategy
    }

    fn try_decode(
        &self,
        data: &[u8],
        options: &DecodeOptions,
        pool: Option<&BufferPool>,
    ) -> Result<Bitmap> {
        // Bounds-only pass
        let (width, height) = ImageReader::new(Cursor::new(data))
            .with_guessed_format()?
            .into_dimensions()?;
        let sample = self.strategy.sample_size(
            width,
            height,
            options.target_width,
            options.target_height,
        );

        if sample == 1 {
            if let Some(pool) = pool {
                if let Some(bitmap) = Self::decode_into_pool(data, options.format, pool)? {
                    return Ok(bitmap);
                }
            }
        }

        let mut image: DynamicImage = ImageReader::new(Cursor::new(data))
            .with_guessed_format()?
            .decode()?;
        if sample > 1 {
            let out_w = (width / sample).max(1);
            let out_h = (height / sample).max(1);
            trace!(width, height, sample, out_w, out_h, "down-sampling");
            image = image.resize_exact(out_w, out_h, FilterType::Triangle);
        }
        Ok(Bitmap::from_image(image, options.format))
    }

    /// Decode at native size into a buffer taken from `pool`
    ///
    /// # Returns
    /// * `Ok(None)` if the stored color type needs conversion or no pooled
    ///   buffer fits; the caller decodes normally
    fn decode_into_pool(
        data: &[u8],
        format: PixelFormat,
        pool: &BufferPool,
    ) -> Result<Option<Bitmap>> {
        let decoder = ImageReader::new(Cursor::new(data))
            .with_guessed_format()?
            .into_decoder()?;
        let native = match decoder.color_type() {
            ColorType::Rgba8 => PixelFormat::Rgba8,
            ColorType::Rgb8 => PixelFormat::Rgb8,
            _ => return Ok(None),
        };
        if native != format {
            return Ok(None);
        }

        let (width, height) = decoder.dimensions();
        let Some(mut bitmap) = pool.acquire_compatible(width, height, format) else {
            return Ok(None);
        };
        match decoder.read_image(bitmap.reshape(width, height, format)) {
            Ok(()) => {
                trace!(width, height, "decoded into pooled buffer");
                Ok(Some(bitmap))
            }
            Err(e) => {
                pool.offer(bitmap);
                Err(e.into())
            }
        }
    }
}

impl BitmapDecoder for ImageDecoder {
    fn decode_bytes(
        &self,
        data: &[u8],
        options: &DecodeOptions,
        pool: Option<&BufferPool>,
    ) -> Option<Bitmap> {
        match self.try_decode(data, options, pool) {
            Ok(bitmap) => Some(bitmap),
            Err(e) => {
                debug!(error = %e, "decode failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::CompressFormat;
    use crate::pool::ReuseMatch;
    use image::{Rgba, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]));
        Bitmap::from_image(DynamicImage::ImageRgba8(img), PixelFormat::Rgba8)
            .encode(CompressFormat::Png, 100)
            .unwrap()
    }

    fn down_sampling(aggressive: bool) -> ResizingStrategy {
        ResizingStrategy::InputDownSampling {
            aggressive,
            aggressive_factor: 2,
        }
    }

    #[test]
    fn test_sample_size_keep_original() {
        assert_eq!(ResizingStrategy::KeepOriginal.sample_size(4000, 3000, 10, 10), 1);
    }

    #[test]
    fn test_sample_size_power_of_two() {
        let strategy = down_sampling(false);
        assert_eq!(strategy.sample_size(1024, 768, 100, 100), 4);
        assert_eq!(strategy.sample_size(100, 100, 100, 100), 1);
        assert_eq!(strategy.sample_size(50, 50, 100, 100), 1);
        assert_eq!(strategy.sample_size(1024, 768, 0, 0), 1);
    }

    #[test]
    fn test_sample_size_aggressive() {
        assert_eq!(down_sampling(true).sample_size(1024, 768, 100, 100), 8);
        // Very wide image: sides alone would allow no reduction
        assert_eq!(down_sampling(false).sample_size(8000, 100, 100, 100), 1);
        assert_eq!(down_sampling(true).sample_size(8000, 100, 100, 100), 8);
    }

    #[test]
    fn test_decode_native_size() {
        let decoder = ImageDecoder::new(ResizingStrategy::KeepOriginal);
        let bitmap = decoder
            .decode_bytes(&png(64, 32), &DecodeOptions::default(), None)
            .unwrap();

        assert_eq!((bitmap.width(), bitmap.height()), (64, 32));
        assert_eq!(&bitmap.pixels()[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_decode_down_sampled() {
        let decoder = ImageDecoder::new(down_sampling(false));
        let options = DecodeOptions {
            target_width: 16,
            target_height: 16,
            format: PixelFormat::Rgb8,
        };
        let bitmap = decoder.decode_bytes(&png(64, 64), &options, None).unwrap();

        assert_eq!((bitmap.width(), bitmap.height()), (16, 16));
        assert_eq!(bitmap.format(), PixelFormat::Rgb8);
    }

    #[test]
    fn test_decode_garbage_is_none() {
        let decoder = ImageDecoder::default();
        assert!(decoder
            .decode_bytes(b"not an image", &DecodeOptions::default(), None)
            .is_none());
        assert!(decoder
            .decode_bytes(&png(8, 8)[..20], &DecodeOptions::default(), None)
            .is_none());
    }

    #[test]
    fn test_decode_reuses_pooled_buffer() {
        let pool = BufferPool::new(1 << 20, ReuseMatch::Capacity);
        pool.offer(Bitmap::new(32, 32, PixelFormat::Rgba8, vec![0; 32 * 32 * 4]).unwrap());

        let decoder = ImageDecoder::new(ResizingStrategy::KeepOriginal);
        let bitmap = decoder
            .decode_bytes(&png(8, 8), &DecodeOptions::default(), Some(&pool))
            .unwrap();

        assert!(pool.is_empty());
        assert_eq!(bitmap.byte_size(), 8 * 8 * 4);
        assert_eq!(bitmap.allocation_size(), 32 * 32 * 4);
        assert_eq!(&bitmap.pixels()[..4], &[10, 20, 30, 255]);
        assert_eq!(&bitmap.pixels()[bitmap.byte_size() - 4..], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_pool_skipped_when_conversion_needed() {
        let pool = BufferPool::new(1 << 20, ReuseMatch::Capacity);
        pool.offer(Bitmap::new(32, 32, PixelFormat::Rgba8, vec![0; 32 * 32 * 4]).unwrap());
        let options = DecodeOptions {
            format: PixelFormat::Rgb8,
            ..DecodeOptions::default()
        };

        let native = ImageDecoder::new(ResizingStrategy::KeepOriginal);
        let converted = native.decode_bytes(&png(8, 8), &options, Some(&pool)).unwrap();
        assert_eq!(converted.format(), PixelFormat::Rgb8);
        assert_eq!(pool.len(), 1);

        let reduced = ImageDecoder::new(down_sampling(false)).decode_bytes(
            &png(64, 64),
            &DecodeOptions {
                target_width: 16,
                target_height: 16,
                ..DecodeOptions::default()
            },
            Some(&pool),
        );
        assert_eq!(reduced.unwrap().width(), 16);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_decode_from_stream() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("boom"))
            }
        }

        let decoder = ImageDecoder::default();
        let data = png(4, 4);
        assert!(decoder
            .decode(&mut Cursor::new(data), &DecodeOptions::default(), None)
            .is_some());
        assert!(decoder
            .decode(&mut Failing, &DecodeOptions::default(), None)
            .is_none());
    }
}
