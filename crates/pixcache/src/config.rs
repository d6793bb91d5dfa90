//! Cache and loader configuration

use std::path::PathBuf;

use serde::Deserialize;

use crate::bitmap::{CompressFormat, PixelFormat};
use crate::decoder::{DecodeOptions, ResizingStrategy};
use crate::error::{Error, Result};
use crate::pool::ReuseMatch;

/// Smallest accepted memory cache share
pub const MIN_MEM_CACHE_PERCENT: f32 = 0.01;
/// Largest accepted memory cache share
pub const MAX_MEM_CACHE_PERCENT: f32 = 0.8;

const MIB: u64 = 1024 * 1024;

/// Configuration of both cache tiers, the buffer pool and decoding
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Keep decoded bitmaps in memory
    pub memory_cache_enabled: bool,
    /// Keep encoded images on disk
    pub disk_cache_enabled: bool,
    /// Share of `max_memory_bytes` given to the memory cache, 0.01 to 0.8
    pub mem_cache_size_percent: f32,
    /// Memory available to the process, the base for `mem_cache_size_percent`
    pub max_memory_bytes: u64,
    /// Directory of the disk cache
    pub disk_cache_dir: PathBuf,
    /// Size bound of the disk cache
    pub disk_cache_size_bytes: u64,
    /// Open the disk cache while building the cache instead of on first use
    pub init_disk_cache_on_create: bool,
    /// Encoding of disk cache entries
    pub compress_format: CompressFormat,
    /// Encoder quality, 0 to 100
    pub compress_quality: u8,
    /// Down-sample to the requested size; off decodes at native size
    pub downsampling: bool,
    /// Keep halving past the requested size to bound total pixels
    pub aggressive_downsampling: bool,
    /// Pixel budget multiplier of the aggressive pass
    pub aggressive_downsampling_factor: u32,
    /// Park released bitmaps for reuse by later decodes
    pub reuse_buffers: bool,
    /// Compatibility rule for reused buffers
    pub reuse_match: ReuseMatch,
    /// Bytes of released bitmaps kept for reuse
    pub reuse_pool_bytes: u64,
    /// Requested decode width, 0 for native
    pub decode_width: u32,
    /// Requested decode height, 0 for native
    pub decode_height: u32,
    /// Pixel layout of decoded bitmaps
    pub pixel_format: PixelFormat,
    /// Disk entries written by another version are discarded
    pub app_version: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_enabled: true,
            disk_cache_enabled: true,
            mem_cache_size_percent: 0.25,
            max_memory_bytes: 256 * MIB,
            disk_cache_dir: PathBuf::from("pixcache"),
            disk_cache_size_bytes: 10 * MIB,
            init_disk_cache_on_create: false,
            compress_format: CompressFormat::Jpeg,
            compress_quality: 70,
            downsampling: true,
            aggressive_downsampling: false,
            aggressive_downsampling_factor: 2,
            reuse_buffers: true,
            reuse_match: ReuseMatch::Capacity,
            reuse_pool_bytes: 16 * MIB,
            decode_width: 0,
            decode_height: 0,
            pixel_format: PixelFormat::Rgba8,
            app_version: 1,
        }
    }
}

impl CacheConfig {
    /// Default configuration with the disk cache in `dir`
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            disk_cache_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Set the memory cache share
    ///
    /// # Returns
    /// * `Err(Error::Configuration)` if `percent` is outside 0.01 to 0.8
    pub fn set_mem_cache_size_percent(&mut self, percent: f32) -> Result<()> {
        check_percent(percent)?;
        self.mem_cache_size_percent = percent;
        Ok(())
    }

    /// Check every option, as done when a cache is built
    pub fn validate(&self) -> Result<()> {
        check_percent(self.mem_cache_size_percent)?;
        if self.compress_quality > 100 {
            return Err(Error::Configuration(format!(
                "compress_quality must be between 0 and 100, got {}",
                self.compress_quality
            )));
        }
        if self.aggressive_downsampling_factor == 0 {
            return Err(Error::Configuration(
                "aggressive_downsampling_factor must be at least 1".to_string(),
            ));
        }
        if self.memory_cache_enabled && self.memory_cache_bytes() == 0 {
            return Err(Error::Configuration(
                "memory cache enabled with max_memory_bytes of 0".to_string(),
            ));
        }
        if self.disk_cache_enabled {
            if self.disk_cache_size_bytes == 0 {
                return Err(Error::Configuration(
                    "disk cache enabled with disk_cache_size_bytes of 0".to_string(),
                ));
            }
            if self.disk_cache_dir.as_os_str().is_empty() {
                return Err(Error::Configuration(
                    "disk cache enabled without disk_cache_dir".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Byte bound of the memory cache
    pub fn memory_cache_bytes(&self) -> usize {
        (self.max_memory_bytes as f64 * self.mem_cache_size_percent as f64).round() as usize
    }

    /// Resizing strategy for the decoder
    pub fn resizing_strategy(&self) -> ResizingStrategy {
        if self.downsampling {
            ResizingStrategy::InputDownSampling {
                aggressive: self.aggressive_downsampling,
                aggressive_factor: self.aggressive_downsampling_factor,
            }
        } else {
            ResizingStrategy::KeepOriginal
        }
    }

    /// Per-request decode options
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            target_width: self.decode_width,
            target_height: self.decode_height,
            format: self.pixel_format,
        }
    }
}

fn check_percent(percent: f32) -> Result<()> {
    if !(MIN_MEM_CACHE_PERCENT..=MAX_MEM_CACHE_PERCENT).contains(&percent) {
        return Err(Error::Configuration(format!(
            "mem_cache_size_percent must be between {} and {}, got {}",
            MIN_MEM_CACHE_PERCENT, MAX_MEM_CACHE_PERCENT, percent
        )));
    }
    Ok(())
}

/// Where results reach their targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// On the worker thread that produced the result
    #[default]
    WorkerThread,
    /// On the caller's thread, inside `ImageLoader::run_pending`
    CallerThread,
}

/// Configuration of the loader on top of the cache
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Fade decoded images in over the loading image
    pub fade_in: bool,
    /// Task strategy
    pub delivery: DeliveryMode,
}
