//! Background load of one image into one target
//!
//! A [`LoadWorker`] runs off the calling thread: pause checkpoint, disk
//! lookup, decode from the source, cache store. It yields a [`Completion`]
//! whose [`Completion::finish`] decides, at delivery time, whether the
//! result still belongs to the target.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::bitmap::Bitmap;
use crate::cache::ImageCache;
use crate::decoder::{BitmapDecoder, DecodeOptions};
use crate::dispatch::{SuppressReason, TargetId, TaskDispatcher, TaskState};
use crate::handle::Handle;
use crate::key::ImageRequest;
use crate::source::Source;
use crate::target::DisplayTarget;

/// What became of a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The image reached the target
    Delivered,
    /// No image could be produced; the target was told
    Failed,
    /// The result was withheld from the target
    Suppressed(SuppressReason),
}

/// State shared by the loader and its workers
pub(crate) struct WorkerContext {
    pub(crate) cache: Arc<ImageCache>,
    pub(crate) dispatcher: TaskDispatcher,
    pub(crate) decoder: Arc<dyn BitmapDecoder>,
    pub(crate) source: Arc<dyn Source>,
    pub(crate) options: DecodeOptions,
    pub(crate) fade_in: bool,
    pub(crate) loading_image: RwLock<Option<Handle>>,
}

impl WorkerContext {
    /// A new handle to the loading image, if one is set
    pub(crate) fn loading_image(&self) -> Option<Handle> {
        let slot = self.loading_image.read();
        match slot.as_ref().map(Handle::try_clone) {
            Some(Ok(handle)) => Some(handle),
            Some(Err(e)) => {
                error!(error = %e, "loading image handle unusable");
                None
            }
            None => None,
        }
    }

    /// Hand `image` to `target`, fading over the loading image if configured
    pub(crate) fn show(&self, target: &dyn DisplayTarget, image: Handle) {
        if self.fade_in {
            target.set_background(self.loading_image());
        }
        target.set_image(Some(image));
        self.cache.stats().record_delivered();
    }
}

/// One dispatched load
pub struct LoadWorker {
    request: ImageRequest,
    task: Arc<TaskState>,
    target_id: TargetId,
    target: Weak<dyn DisplayTarget>,
    context: Arc<WorkerContext>,
}

impl LoadWorker {
    pub(crate) fn new(
        request: ImageRequest,
        task: Arc<TaskState>,
        target: &Arc<dyn DisplayTarget>,
        context: Arc<WorkerContext>,
    ) -> Self {
        Self {
            request,
            task,
            target_id: crate::dispatch::target_id(target),
            target: Arc::downgrade(target),
            context,
        }
    }

    /// The request being loaded
    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    /// Why this worker should stop, if it should
    fn stop_reason(&self) -> Option<SuppressReason> {
        if let Some(reason) = self.task.cancel_reason() {
            return Some(reason);
        }
        if self.context.dispatcher.exit_early() {
            return Some(SuppressReason::ExitEarly);
        }
        if self.target.strong_count() == 0 {
            return Some(SuppressReason::Cancelled);
        }
        if !self.context.dispatcher.is_bound(self.target_id, &self.task) {
            return Some(SuppressReason::Superseded);
        }
        None
    }

    /// Run the load up to, but not including, delivery
    ///
    /// Blocks while work is paused. The result is stored in both cache
    /// tiers even if the task was cancelled meanwhile, unless early exit
    /// was requested.
    pub fn run(self) -> Completion {
        let key = self.request.key().clone();
        let cache = &self.context.cache;
        let task = self.task.id();
        debug!(key = %key, task, "load started");

        self.context.dispatcher.wait_if_paused(&self.task);
        trace!(key = %key, task, "passed pause checkpoint");

        let mut skipped = None;
        let mut bitmap = None;
        let mut from_disk = false;

        match self.stop_reason() {
            Some(reason) => skipped = Some(reason),
            None => {
                if let Some(snapshot) = cache.get_from_disk(&key) {
                    bitmap = self.context.decoder.decode_bytes(
                        snapshot.as_bytes(),
                        &self.context.options,
                        cache.pool(),
                    );
                    match bitmap {
                        Some(_) => from_disk = true,
                        None => {
                            warn!(key = %key, "disk cache entry does not decode");
                            drop(snapshot);
                            cache.discard_disk_entry(&key);
                        }
                    }
                }
            }
        }

        if bitmap.is_none() && skipped.is_none() {
            match self.stop_reason() {
                Some(reason) => skipped = Some(reason),
                None => bitmap = self.decode_from_source(),
            }
        }

        let image = bitmap.map(|bitmap| cache.new_handle(bitmap));
        if let Some(handle) = &image {
            if self.context.dispatcher.exit_early() {
                trace!(key = %key, task, "exiting early, result not cached");
            } else {
                // A disk hit is already on disk
                if !from_disk {
                    if let Err(e) = cache.add_to_disk(&key, handle) {
                        error!(key = %key, error = %e, "storing on disk failed");
                    }
                }
                if let Err(e) = cache.add_to_memory(&key, handle) {
                    error!(key = %key, error = %e, "storing in memory failed");
                }
            }
        }

        Completion {
            worker: self,
            image,
            skipped,
        }
    }

    fn suppress(&self, reason: SuppressReason, image: Option<Handle>) -> Outcome {
        self.context.dispatcher.release(self.target_id, &self.task);
        debug!(key = %self.request.key(), task = self.task.id(), ?reason, "result suppressed");
        drop(image);
        self.context.cache.stats().record_suppressed();
        Outcome::Suppressed(reason)
    }

    fn decode_from_source(&self) -> Option<Bitmap> {
        let stats = self.context.cache.stats();
        stats.record_decode();
        let decoded = match self.context.source.open(self.request.uri()) {
            Ok(mut reader) => self.context.decoder.decode(
                &mut reader,
                &self.context.options,
                self.context.cache.pool(),
            ),
            Err(e) => {
                debug!(uri = self.request.uri(), error = %e, "source unavailable");
                None
            }
        };
        if decoded.is_none() {
            stats.record_decode_failure();
        }
        decoded
    }
}

/// A finished load waiting to be delivered
pub struct Completion {
    worker: LoadWorker,
    image: Option<Handle>,
    skipped: Option<SuppressReason>,
}

impl Completion {
    /// The request that was loaded
    pub fn request(&self) -> &ImageRequest {
        &self.worker.request
    }

    /// Deliver to the target if the load still belongs to it
    ///
    /// The binding is checked and released under the target's delivery
    /// lock, which is held until the target callbacks return. A newer load
    /// for the same target either supersedes this one before the check or
    /// waits for this delivery to finish.
    pub fn finish(self) -> Outcome {
        let Completion {
            worker,
            image,
            skipped,
        } = self;

        let target = match skipped.or_else(|| worker.stop_reason()) {
            Some(reason) => return worker.suppress(reason, image),
            None => match worker.target.upgrade() {
                Some(target) => target,
                None => return worker.suppress(SuppressReason::Cancelled, image),
            },
        };

        let context = &worker.context;
        let delivery = context.dispatcher.delivery_lock(&target);
        let _delivering = delivery.lock();
        if !context.dispatcher.release(worker.target_id, &worker.task) {
            let reason = worker
                .task
                .cancel_reason()
                .unwrap_or(SuppressReason::Superseded);
            return worker.suppress(reason, image);
        }

        let key = worker.request.key();
        match image {
            Some(image) => {
                debug!(key = %key, task = worker.task.id(), "delivering image");
                context.show(target.as_ref(), image);
                Outcome::Delivered
            }
            None => {
                debug!(key = %key, task = worker.task.id(), "load failed");
                target.on_image_loading_failed();
                context.cache.stats().record_failed();
                Outcome::Failed
            }
        }
    }
}
