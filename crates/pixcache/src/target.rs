//! Display targets that receive load results

use crate::handle::Handle;

/// Receiver of loaded images
///
/// Targets are shared as `Arc<dyn DisplayTarget>` and identified by that
/// allocation: loading into the same `Arc` again supersedes the previous
/// load. Methods run on a worker thread or inside
/// [`ImageLoader::run_pending`](crate::ImageLoader::run_pending), depending
/// on the delivery mode, and never under a cache lock.
///
/// Every handle passed in is owned by the target, which closes it (or
/// drops it) once the image is no longer shown.
pub trait DisplayTarget: Send + Sync {
    /// Show `image`, or clear the target with `None`
    fn set_image(&self, image: Option<Handle>);

    /// Show `image` behind the foreground, used as the start of a fade
    fn set_background(&self, image: Option<Handle>) {
        drop(image);
    }

    /// The requested image could not be produced
    fn on_image_loading_failed(&self);
}
