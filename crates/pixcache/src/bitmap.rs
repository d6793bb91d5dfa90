//! Decoded pixel buffers and their compressed encodings

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// In-memory pixel layout of a [`Bitmap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit red, green, blue, alpha
    Rgba8,
    /// 8-bit red, green, blue
    Rgb8,
}

impl PixelFormat {
    /// Bytes used by one pixel
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }

    fn color_type(self) -> ExtendedColorType {
        match self {
            PixelFormat::Rgba8 => ExtendedColorType::Rgba8,
            PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
        }
    }
}

/// Encoding used for disk cache entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressFormat {
    /// Lossless; quality is ignored
    Png,
    /// Lossy; alpha is dropped
    Jpeg,
}

/// A decoded image
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Vec<u8>,
    mutable: bool,
}

impl Bitmap {
    /// Wrap raw pixels, checking the buffer length against the dimensions
    pub fn new(width: u32, height: u32, format: PixelFormat, pixels: Vec<u8>) -> Result<Self> {
        let expected = required_bytes(width, height, format);
        if pixels.len() != expected {
            return Err(Error::Decode(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            pixels,
            mutable: true,
        })
    }

    /// Convert a decoded image into the requested pixel format
    pub fn from_image(image: DynamicImage, format: PixelFormat) -> Self {
        let (width, height) = (image.width(), image.height());
        let pixels = match format {
            PixelFormat::Rgba8 => image.into_rgba8().into_raw(),
            PixelFormat::Rgb8 => image.into_rgb8().into_raw(),
        };
        Self {
            width,
            height,
            format,
            pixels,
            mutable: true,
        }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Raw pixel bytes, row-major
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Whether the buffer may be overwritten when reused for another decode
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Forbid reuse of this buffer's allocation
    pub fn set_immutable(&mut self) {
        self.mutable = false;
    }

    /// Bytes of pixel content
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    /// Bytes allocated for pixels, at least [`Bitmap::byte_size`]
    pub fn allocation_size(&self) -> usize {
        self.pixels.capacity()
    }

    /// Resize to `width` x `height` of `format` for decoding in place
    ///
    /// Keeps the allocation when it is large enough. Pixel content is
    /// unspecified until the caller overwrites the returned slice.
    pub(crate) fn reshape(&mut self, width: u32, height: u32, format: PixelFormat) -> &mut [u8] {
        self.pixels.resize(required_bytes(width, height, format), 0);
        self.width = width;
        self.height = height;
        self.format = format;
        &mut self.pixels
    }

    /// Encode for storage
    ///
    /// # Arguments
    /// * `format` - Target encoding
    /// * `quality` - 0-100, used by lossy encodings only
    pub fn encode(&self, format: CompressFormat, quality: u8) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::with_capacity(self.byte_size() / 4));
        match format {
            CompressFormat::Png => {
                PngEncoder::new(&mut out).write_image(
                    &self.pixels,
                    self.width,
                    self.height,
                    self.format.color_type(),
                )?;
            }
            CompressFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
                match self.format {
                    PixelFormat::Rgb8 => encoder.write_image(
                        &self.pixels,
                        self.width,
                        self.height,
                        ExtendedColorType::Rgb8,
                    )?,
                    PixelFormat::Rgba8 => {
                        let rgb: Vec<u8> = self
                            .pixels
                            .chunks_exact(4)
                            .flat_map(|px| [px[0], px[1], px[2]])
                            .collect();
                        encoder.write_image(&rgb, self.width, self.height, ExtendedColorType::Rgb8)?
                    }
                }
            }
        }
        Ok(out.into_inner())
    }
}

/// Bytes needed to hold `width` x `height` pixels of `format`
pub fn required_bytes(width: u32, height: u32, format: PixelFormat) -> usize {
    width as usize * height as usize * format.bytes_per_pixel()
}
