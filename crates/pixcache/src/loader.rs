//! ImageLoader: the `load(request, target)` entry point
//!
//! Memory hits are delivered synchronously on the calling thread. Misses
//! bind a worker to the target through the [`TaskDispatcher`] and hand it
//! to the configured [`TaskStrategy`].

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::cache::ImageCache;
use crate::config::{CacheConfig, DeliveryMode, LoaderConfig};
use crate::decoder::{BitmapDecoder, ImageDecoder};
use crate::dispatch::{Bind, TaskDispatcher};
use crate::error::Result;
use crate::handle::Handle;
use crate::key::ImageRequest;
use crate::source::Source;
use crate::stats::CacheStats;
use crate::strategy::{CallerThreadStrategy, TaskStrategy, ThreadPoolStrategy};
use crate::target::DisplayTarget;
use crate::worker::{LoadWorker, WorkerContext};

/// How a call to [`ImageLoader::load`] was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Delivered from memory before returning
    MemoryHit,
    /// A worker was started
    Dispatched,
    /// The target is already loading the same key; nothing started
    AlreadyInFlight,
}

/// Asynchronous image loader over a two-tier [`ImageCache`]
pub struct ImageLoader {
    context: Arc<WorkerContext>,
    strategy: Arc<dyn TaskStrategy>,
}

impl ImageLoader {
    /// Build a loader with a fresh cache and the default decoder
    ///
    /// Workers run on `runtime`'s blocking pool. The disk cache is opened
    /// in the background; lookups wait for it.
    ///
    /// # Arguments
    /// * `cache_config` - Cache tiers, pool and decoding
    /// * `config` - Fade and delivery mode
    /// * `source` - Where image bytes come from
    /// * `runtime` - Tokio runtime for workers
    ///
    /// # Returns
    /// * `Err(Error::Configuration)` if `cache_config` does not validate
    pub fn new(
        cache_config: CacheConfig,
        config: LoaderConfig,
        source: Arc<dyn Source>,
        runtime: RuntimeHandle,
    ) -> Result<Self> {
        let decoder = Arc::new(ImageDecoder::new(cache_config.resizing_strategy()));
        let cache = Arc::new(ImageCache::new(cache_config)?);
        let strategy: Arc<dyn TaskStrategy> = match config.delivery {
            DeliveryMode::WorkerThread => Arc::new(ThreadPoolStrategy::new(runtime)),
            DeliveryMode::CallerThread => Arc::new(CallerThreadStrategy::new(runtime)),
        };

        let loader = Self::with_parts(cache, &config, source, decoder, strategy);
        if !loader.context.cache.disk_cache().is_initialized() {
            drop(loader.init_disk_cache_async());
        }
        Ok(loader)
    }

    /// Build a loader from existing parts
    ///
    /// The disk cache of `cache` must be initialized by the caller.
    pub fn with_parts(
        cache: Arc<ImageCache>,
        config: &LoaderConfig,
        source: Arc<dyn Source>,
        decoder: Arc<dyn BitmapDecoder>,
        strategy: Arc<dyn TaskStrategy>,
    ) -> Self {
        let options = cache.config().decode_options();
        info!(fade_in = config.fade_in, delivery = ?config.delivery, "image loader created");
        Self {
            context: Arc::new(WorkerContext {
                cache,
                dispatcher: TaskDispatcher::new(),
                decoder,
                source,
                options,
                fade_in: config.fade_in,
                loading_image: RwLock::new(None),
            }),
            strategy,
        }
    }

    /// Load `request` into `target`
    ///
    /// A memory hit is delivered before returning and supersedes any load
    /// still in flight for `target`. On a miss, a load of the same key
    /// already in flight for `target` is left alone; a load of another key
    /// is superseded and never delivers.
    ///
    /// Waits while a worker is delivering to `target`, so the target always
    /// ends up showing the most recent request.
    ///
    /// # Arguments
    /// * `request` - URI and cache key
    /// * `target` - Receiver, identified by its allocation
    pub fn load(
        &self,
        request: impl Into<ImageRequest>,
        target: &Arc<dyn DisplayTarget>,
    ) -> LoadStatus {
        let request = request.into();
        let key = request.key();
        let delivery = self.context.dispatcher.delivery_lock(target);
        let _delivering = delivery.lock();

        if let Some(image) = self.context.cache.get_from_memory(key) {
            debug!(key = %key, "memory cache hit");
            self.context.dispatcher.supersede(target);
            target.set_image(Some(image));
            self.context.cache.stats().record_delivered();
            return LoadStatus::MemoryHit;
        }

        match self.context.dispatcher.bind(key, target) {
            Bind::AlreadyInFlight => LoadStatus::AlreadyInFlight,
            Bind::Started(task) => {
                if let Some(placeholder) = self.context.loading_image() {
                    target.set_image(Some(placeholder));
                }
                let worker =
                    LoadWorker::new(request, task, target, Arc::clone(&self.context));
                self.strategy.submit(worker);
                LoadStatus::Dispatched
            }
        }
    }

    /// Image shown while loading and faded from when fade-in is on
    pub fn set_loading_image(&self, bitmap: Option<Bitmap>) {
        let handle = bitmap.map(|mut bitmap| {
            bitmap.set_immutable();
            Handle::unshared(bitmap)
        });
        *self.context.loading_image.write() = handle;
    }

    /// Pause or resume workers at their pause checkpoint
    pub fn set_pause_work(&self, pause: bool) {
        self.context.dispatcher.set_pause_work(pause);
    }

    /// Make in-flight loads skip remaining work, cache writes and delivery
    pub fn set_exit_tasks_early(&self, exit: bool) {
        self.context.dispatcher.set_exit_tasks_early(exit);
    }

    /// Cancel the load in flight for `target`
    ///
    /// # Returns
    /// * true if a load was cancelled
    pub fn cancel_work(&self, target: &Arc<dyn DisplayTarget>) -> bool {
        self.context.dispatcher.cancel_work(target)
    }

    /// Cancel every load in flight
    pub fn shutdown(&self) -> usize {
        let cancelled = self.context.dispatcher.cancel_all();
        info!(cancelled, "image loader shut down");
        cancelled
    }

    /// Deliver results queued for the caller's thread
    ///
    /// Only does something in [`DeliveryMode::CallerThread`].
    pub fn run_pending(&self) -> usize {
        self.strategy.run_pending()
    }

    /// Check if work is paused
    pub fn is_paused(&self) -> bool {
        self.context.dispatcher.is_paused()
    }

    /// Workers currently blocked at the pause checkpoint
    pub fn paused_workers(&self) -> usize {
        self.context.dispatcher.paused_workers()
    }

    /// Number of targets with a load in flight
    pub fn in_flight(&self) -> usize {
        self.context.dispatcher.in_flight()
    }

    /// The cache behind this loader
    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.context.cache
    }

    /// Shared statistics
    pub fn stats(&self) -> &Arc<CacheStats> {
        self.context.cache.stats()
    }

    /// Close every memory entry
    pub fn clear_memory(&self) {
        self.context.cache.clear_memory();
    }

    /// Open the disk cache on the worker pool
    pub fn init_disk_cache_async(&self) -> JoinHandle<Result<()>> {
        self.background(|cache| {
            cache.init_disk_cache();
            Ok(())
        })
    }

    /// Empty both cache tiers on the worker pool
    pub fn clear_cache_async(&self) -> JoinHandle<Result<()>> {
        self.background(|cache| cache.clear_cache())
    }

    /// Flush the disk journal on the worker pool
    pub fn flush_async(&self) -> JoinHandle<Result<()>> {
        self.background(|cache| cache.flush())
    }

    /// Close the disk cache on the worker pool
    pub fn close_async(&self) -> JoinHandle<Result<()>> {
        self.background(|cache| cache.close())
    }

    fn background<F>(&self, job: F) -> JoinHandle<Result<()>>
    where
        F: FnOnce(&ImageCache) -> Result<()> + Send + 'static,
    {
        let cache = Arc::clone(&self.context.cache);
        self.strategy.runtime().spawn_blocking(move || {
            let result = job(&cache);
            if let Err(e) = &result {
                warn!(error = %e, "background cache job failed");
            }
            result
        })
    }
}
