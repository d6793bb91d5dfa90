//! Reference-counted handles to decoded bitmaps
//!
//! One decoded buffer can sit in the memory cache, be on its way to a
//! display target and be queued for the disk cache at the same time. Each
//! of those holders owns a [`Handle`]; the buffer is released exactly once,
//! when the last handle closes.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};

/// Called with the bitmap once its last handle closes
pub type ReleaseFn = Arc<dyn Fn(Bitmap) + Send + Sync>;

struct Shared {
    bitmap: RwLock<Option<Bitmap>>,
    refs: AtomicUsize,
    release: Option<ReleaseFn>,
}

enum Inner {
    Counted(Arc<Shared>),
    /// Not pool-managed: no release callback, freed when the last clone drops
    Unshared(Arc<Bitmap>),
}

/// A closable, cloneable reference to a decoded bitmap
///
/// Dropping an open handle closes it.
pub struct Handle {
    inner: Inner,
    closed: AtomicBool,
}

impl Handle {
    /// Create the first handle to `bitmap`
    pub fn new(bitmap: Bitmap) -> Self {
        Self::counted(bitmap, None)
    }

    /// Create the first handle to `bitmap`, running `release` when the last handle closes
    pub fn with_release(bitmap: Bitmap, release: ReleaseFn) -> Self {
        Self::counted(bitmap, Some(release))
    }

    /// Create a handle without release tracking
    pub fn unshared(bitmap: Bitmap) -> Self {
        Self {
            inner: Inner::Unshared(Arc::new(bitmap)),
            closed: AtomicBool::new(false),
        }
    }

    fn counted(bitmap: Bitmap, release: Option<ReleaseFn>) -> Self {
        Self {
            inner: Inner::Counted(Arc::new(Shared {
                bitmap: RwLock::new(Some(bitmap)),
                refs: AtomicUsize::new(1),
                release,
            })),
            closed: AtomicBool::new(false),
        }
    }

    /// Create another handle to the same bitmap
    ///
    /// # Returns
    /// * `Err(Error::UseAfterClose)` if this handle has been closed
    pub fn try_clone(&self) -> Result<Handle> {
        if self.is_closed() {
            return Err(Error::UseAfterClose);
        }
        let inner = match &self.inner {
            Inner::Counted(shared) => {
                // Never resurrect a released buffer
                let mut current = shared.refs.load(Ordering::Acquire);
                loop {
                    if current == 0 {
                        return Err(Error::UseAfterClose);
                    }
                    match shared.refs.compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => current = actual,
                    }
                }
                Inner::Counted(Arc::clone(shared))
            }
            Inner::Unshared(bitmap) => Inner::Unshared(Arc::clone(bitmap)),
        };
        Ok(Handle {
            inner,
            closed: AtomicBool::new(false),
        })
    }

    /// Borrow the bitmap
    ///
    /// Closing the last handle blocks while a borrow is alive, so drop the
    /// returned reference before closing.
    ///
    /// # Returns
    /// * `Err(Error::UseAfterClose)` if this handle has been closed
    pub fn get(&self) -> Result<BitmapRef<'_>> {
        if self.is_closed() {
            return Err(Error::UseAfterClose);
        }
        match &self.inner {
            Inner::Counted(shared) => {
                RwLockReadGuard::try_map(shared.bitmap.read(), |slot| slot.as_ref())
                    .map(BitmapRef::Locked)
                    .map_err(|_| Error::UseAfterClose)
            }
            Inner::Unshared(bitmap) => Ok(BitmapRef::Plain(bitmap)),
        }
    }

    /// Give up this handle's reference
    ///
    /// The bitmap is released when the last reference goes away. Closing
    /// the same handle twice is a bug and reports [`Error::UseAfterClose`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::UseAfterClose);
        }
        if let Inner::Counted(shared) = &self.inner {
            if shared.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                let bitmap = shared.bitmap.write().take();
                if let (Some(bitmap), Some(release)) = (bitmap, shared.release.as_ref()) {
                    release(bitmap);
                }
            }
        }
        Ok(())
    }

    /// Check if this handle has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of open handles to the bitmap
    pub fn ref_count(&self) -> usize {
        match &self.inner {
            Inner::Counted(shared) => shared.refs.load(Ordering::Acquire),
            Inner::Unshared(bitmap) => Arc::strong_count(bitmap),
        }
    }

    /// Returns true if both handles refer to the same bitmap
    pub fn same_bitmap(&self, other: &Handle) -> bool {
        match (&self.inner, &other.inner) {
            (Inner::Counted(a), Inner::Counted(b)) => Arc::ptr_eq(a, b),
            (Inner::Unshared(a), Inner::Unshared(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("refs", &self.ref_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Borrowed bitmap returned by [`Handle::get`]
pub enum BitmapRef<'a> {
    /// Counted bitmap; holds a read lock for the borrow's lifetime
    Locked(MappedRwLockReadGuard<'a, Bitmap>),
    /// Unshared bitmap
    Plain(&'a Bitmap),
}

impl Deref for BitmapRef<'_> {
    type Target = Bitmap;

    fn deref(&self) -> &Bitmap {
        match self {
            BitmapRef::Locked(guard) => guard,
            BitmapRef::Plain(bitmap) => bitmap,
        }
    }
}
