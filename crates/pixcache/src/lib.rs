//! # pixcache
//!
//! Two-tier image cache and asynchronous image loader.
//!
//! ## Architecture
//! - **Handles**: reference-counted bitmaps, released exactly once
//! - **Memory tier**: byte-bounded LRU of decoded bitmaps
//! - **Disk tier**: encoded images in a `pixstore` journaled LRU
//! - **Buffer pool**: released bitmaps reused by later decodes
//! - **Loader**: at most one in-flight load per display target, with
//!   pause/resume, cancellation and early exit
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use pixcache::{CacheConfig, DisplayTarget, FileSource, Handle, ImageLoader, LoaderConfig};
//!
//! struct Logger;
//!
//! impl DisplayTarget for Logger {
//!     fn set_image(&self, image: Option<Handle>) {
//!         if let Some(image) = image {
//!             let bitmap = image.get().unwrap();
//!             println!("{}x{}", bitmap.width(), bitmap.height());
//!         }
//!     }
//!
//!     fn on_image_loading_failed(&self) {
//!         println!("failed");
//!     }
//! }
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let loader = ImageLoader::new(
//!     CacheConfig::new("/tmp/pixcache"),
//!     LoaderConfig::default(),
//!     Arc::new(FileSource::new()),
//!     runtime.handle().clone(),
//! )
//! .unwrap();
//!
//! let target: Arc<dyn DisplayTarget> = Arc::new(Logger);
//! loader.load("file:///tmp/cat.jpg", &target);
//! ```

#![warn(missing_docs)]

mod bitmap;
mod cache;
mod config;
mod decoder;
mod disk;
mod dispatch;
mod error;
mod handle;
mod key;
mod loader;
mod lru;
mod memory;
mod pool;
mod source;
mod stats;
mod strategy;
mod target;
mod worker;

pub use bitmap::{required_bytes, Bitmap, CompressFormat, PixelFormat};
pub use cache::ImageCache;
pub use config::{
    CacheConfig, DeliveryMode, LoaderConfig, MAX_MEM_CACHE_PERCENT, MIN_MEM_CACHE_PERCENT,
};
pub use decoder::{BitmapDecoder, DecodeOptions, ImageDecoder, ResizingStrategy};
pub use disk::DiskCache;
pub use dispatch::{SuppressReason, TaskDispatcher};
pub use error::{Error, Result};
pub use handle::{BitmapRef, Handle, ReleaseFn};
pub use key::{CacheKey, ImageRequest};
pub use loader::{ImageLoader, LoadStatus};
pub use memory::MemoryCache;
pub use pool::{BufferPool, ReuseMatch};
pub use source::{FileSource, Source};
pub use stats::CacheStats;
pub use strategy::{CallerThreadStrategy, TaskStrategy, ThreadPoolStrategy};
pub use target::DisplayTarget;
pub use worker::{Completion, LoadWorker, Outcome};
