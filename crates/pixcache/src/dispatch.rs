//! Per-target task bookkeeping, pause gate and early exit
//!
//! Every display target is bound to at most one in-flight load. Binding a
//! target again cancels the previous task unless it loads the same key.
//! Workers compare their own task against the target's current binding
//! before delivering, so a superseded task never reaches the target.
//!
//! Each target also owns a delivery lock. Loads and deliveries for one
//! target take it around the binding check and the target callbacks, so a
//! result checked as current is also the last one the target sees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use tracing::{debug, trace};

use crate::key::CacheKey;
use crate::target::DisplayTarget;

/// Identity of a display target: the address of its shared allocation
///
/// The registry holds a `Weak` to every known target, which keeps the
/// allocation (and so the address) reserved while its slot exists.
pub(crate) type TargetId = usize;

pub(crate) fn target_id(target: &Arc<dyn DisplayTarget>) -> TargetId {
    Arc::as_ptr(target) as *const () as usize
}

/// Why a finished task did not reach its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuppressReason {
    /// The target was bound to a newer load
    Superseded,
    /// The task or its target went away
    Cancelled,
    /// Early exit was requested
    ExitEarly,
}

const ACTIVE: u8 = 0;
const SUPERSEDED: u8 = 1;
const CANCELLED: u8 = 2;

/// Cancellation state of one dispatched load
#[derive(Debug)]
pub(crate) struct TaskState {
    id: u64,
    key: CacheKey,
    state: AtomicU8,
}

impl TaskState {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Mark the task stopped; the first reason wins
    fn cancel(&self, reason: SuppressReason) {
        let code = match reason {
            SuppressReason::Superseded => SUPERSEDED,
            _ => CANCELLED,
        };
        let _ = self
            .state
            .compare_exchange(ACTIVE, code, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) != ACTIVE
    }

    pub(crate) fn cancel_reason(&self) -> Option<SuppressReason> {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => None,
            SUPERSEDED => Some(SuppressReason::Superseded),
            _ => Some(SuppressReason::Cancelled),
        }
    }
}

/// Serializes loads and deliveries for one target
///
/// Reentrant so a target may call back into the loader from its callbacks.
pub(crate) type DeliveryLock = Arc<ReentrantMutex<()>>;

/// Registry entry of one target; outlives its tasks until the target drops
struct Slot {
    task: Option<Arc<TaskState>>,
    target: Weak<dyn DisplayTarget>,
    delivery: DeliveryLock,
}

impl Slot {
    fn new(target: &Arc<dyn DisplayTarget>) -> Self {
        Self {
            task: None,
            target: Arc::downgrade(target),
            delivery: Arc::new(ReentrantMutex::new(())),
        }
    }
}

/// Result of binding a load to a target
pub(crate) enum Bind {
    /// A new task owns the target and must be submitted
    Started(Arc<TaskState>),
    /// The target is already loading the same key
    AlreadyInFlight,
}

/// Registry of in-flight loads plus the global pause and exit flags
pub struct TaskDispatcher {
    registry: Mutex<HashMap<TargetId, Slot, RandomState>>,
    paused: Mutex<bool>,
    resume: Condvar,
    paused_workers: AtomicUsize,
    exit_early: AtomicBool,
    next_id: AtomicU64,
}

impl Default for TaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskDispatcher {
    /// Create a dispatcher with no bindings, not paused
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::with_hasher(RandomState::new())),
            paused: Mutex::new(false),
            resume: Condvar::new(),
            paused_workers: AtomicUsize::new(0),
            exit_early: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Bind a load of `key` to `target`
    ///
    /// An existing task for the same key keeps running. A task for another
    /// key is superseded and replaced. Callers hold the target's delivery
    /// lock.
    pub(crate) fn bind(&self, key: &CacheKey, target: &Arc<dyn DisplayTarget>) -> Bind {
        let (task, previous, pruned) = {
            let mut registry = self.registry.lock();
            let pruned = Self::prune(&mut registry);
            let slot = registry
                .entry(target_id(target))
                .or_insert_with(|| Slot::new(target));

            if let Some(existing) = &slot.task {
                if existing.key() == key && !existing.is_cancelled() {
                    trace!(key = %key, task = existing.id(), "same key already loading");
                    return Bind::AlreadyInFlight;
                }
            }

            let task = Arc::new(TaskState {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                key: key.clone(),
                state: AtomicU8::new(ACTIVE),
            });
            let previous = slot.task.replace(Arc::clone(&task));
            debug!(key = %key, task = task.id(), "task bound");
            (task, previous, pruned)
        };

        if let Some(previous) = previous {
            debug!(key = %previous.key(), task = previous.id(), "task superseded");
            self.stop(&previous, SuppressReason::Superseded);
        } else if pruned {
            self.wake_all();
        }
        Bind::Started(task)
    }

    /// Drop slots of targets that are gone, cancelling their tasks
    fn prune(registry: &mut HashMap<TargetId, Slot, RandomState>) -> bool {
        let mut pruned = false;
        registry.retain(|_, slot| {
            let live = slot.target.strong_count() > 0;
            if !live {
                if let Some(task) = &slot.task {
                    task.cancel(SuppressReason::Cancelled);
                    pruned = true;
                }
            }
            live
        });
        pruned
    }

    /// The delivery lock of `target`, created on first use
    pub(crate) fn delivery_lock(&self, target: &Arc<dyn DisplayTarget>) -> DeliveryLock {
        let mut registry = self.registry.lock();
        let slot = registry
            .entry(target_id(target))
            .or_insert_with(|| Slot::new(target));
        Arc::clone(&slot.delivery)
    }

    /// Supersede whatever load `target` has in flight
    ///
    /// # Returns
    /// * true if a task was bound to the target
    pub(crate) fn supersede(&self, target: &Arc<dyn DisplayTarget>) -> bool {
        self.unbind_target(target, SuppressReason::Superseded)
    }

    /// Cancel whatever load `target` has in flight
    ///
    /// # Returns
    /// * true if a task was bound to the target
    pub fn cancel_work(&self, target: &Arc<dyn DisplayTarget>) -> bool {
        self.unbind_target(target, SuppressReason::Cancelled)
    }

    fn unbind_target(&self, target: &Arc<dyn DisplayTarget>, reason: SuppressReason) -> bool {
        let removed = self
            .registry
            .lock()
            .get_mut(&target_id(target))
            .and_then(|slot| slot.task.take());
        match removed {
            Some(task) => {
                debug!(key = %task.key(), task = task.id(), ?reason, "task unbound");
                self.stop(&task, reason);
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight load
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Arc<TaskState>> = self
            .registry
            .lock()
            .values_mut()
            .filter_map(|slot| slot.task.take())
            .collect();
        for task in &drained {
            task.cancel(SuppressReason::Cancelled);
        }
        self.wake_all();
        if !drained.is_empty() {
            debug!(tasks = drained.len(), "all tasks cancelled");
        }
        drained.len()
    }

    fn stop(&self, task: &TaskState, reason: SuppressReason) {
        task.cancel(reason);
        self.wake_all();
    }

    fn wake_all(&self) {
        // Waiters test their flag under this lock, so the wakeup is not lost
        let _gate = self.paused.lock();
        self.resume.notify_all();
    }

    /// Check that `task` is still the one bound to `target`
    pub(crate) fn is_bound(&self, target: TargetId, task: &Arc<TaskState>) -> bool {
        self.registry
            .lock()
            .get(&target)
            .and_then(|slot| slot.task.as_ref())
            .is_some_and(|bound| Arc::ptr_eq(bound, task))
    }

    /// Remove the binding of `target` if it still belongs to `task`
    ///
    /// # Returns
    /// * true if the binding was removed
    pub(crate) fn release(&self, target: TargetId, task: &Arc<TaskState>) -> bool {
        let mut registry = self.registry.lock();
        match registry.get_mut(&target) {
            Some(slot) if slot.task.as_ref().is_some_and(|bound| Arc::ptr_eq(bound, task)) => {
                slot.task = None;
                true
            }
            _ => false,
        }
    }

    /// Block while work is paused, unless `task` gets cancelled
    pub(crate) fn wait_if_paused(&self, task: &TaskState) {
        let mut paused = self.paused.lock();
        if !*paused || task.is_cancelled() {
            return;
        }
        self.paused_workers.fetch_add(1, Ordering::AcqRel);
        trace!(task = task.id(), "worker paused");
        while *paused && !task.is_cancelled() {
            self.resume.wait(&mut paused);
        }
        self.paused_workers.fetch_sub(1, Ordering::AcqRel);
        trace!(task = task.id(), "worker resumed");
    }

    /// Pause or resume workers at their pause checkpoint
    pub fn set_pause_work(&self, pause: bool) {
        let mut paused = self.paused.lock();
        *paused = pause;
        if !pause {
            self.resume.notify_all();
        }
        debug!(pause, "pause work");
    }

    /// Check if work is paused
    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Workers currently blocked at the pause checkpoint
    pub fn paused_workers(&self) -> usize {
        self.paused_workers.load(Ordering::Acquire)
    }

    /// Make in-flight tasks skip remaining work, cache writes and delivery
    ///
    /// Setting the flag also resumes paused work so blocked workers can exit.
    pub fn set_exit_tasks_early(&self, exit: bool) {
        self.exit_early.store(exit, Ordering::Release);
        self.set_pause_work(false);
    }

    /// Check the early exit flag
    pub fn exit_early(&self) -> bool {
        self.exit_early.load(Ordering::Acquire)
    }

    /// Number of targets with a load in flight
    pub fn in_flight(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|slot| slot.task.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use std::time::Duration;

    struct NullTarget;

    impl DisplayTarget for NullTarget {
        fn set_image(&self, _image: Option<Handle>) {}
        fn on_image_loading_failed(&self) {}
    }

    fn target() -> Arc<dyn DisplayTarget> {
        Arc::new(NullTarget)
    }

    fn started(bind: Bind) -> Arc<TaskState> {
        match bind {
            Bind::Started(task) => task,
            Bind::AlreadyInFlight => panic!("expected a new task"),
        }
    }

    #[test]
    fn test_same_key_is_deduplicated() {
        let dispatcher = TaskDispatcher::new();
        let target = target();
        let key = CacheKey::new("/a.png");

        let task = started(dispatcher.bind(&key, &target));
        assert!(matches!(dispatcher.bind(&key, &target), Bind::AlreadyInFlight));
        assert!(dispatcher.is_bound(target_id(&target), &task));
        assert_eq!(dispatcher.in_flight(), 1);
    }

    #[test]
    fn test_other_key_supersedes() {
        let dispatcher = TaskDispatcher::new();
        let target = target();

        let first = started(dispatcher.bind(&CacheKey::new("/a.png"), &target));
        let second = started(dispatcher.bind(&CacheKey::new("/b.png"), &target));

        assert_eq!(first.cancel_reason(), Some(SuppressReason::Superseded));
        assert!(!dispatcher.is_bound(target_id(&target), &first));
        assert!(dispatcher.is_bound(target_id(&target), &second));
        assert!(!dispatcher.release(target_id(&target), &first));
        assert!(dispatcher.release(target_id(&target), &second));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn test_targets_are_independent() {
        let dispatcher = TaskDispatcher::new();
        let key = CacheKey::new("/a.png");
        let (a, b) = (target(), target());

        let task_a = started(dispatcher.bind(&key, &a));
        let task_b = started(dispatcher.bind(&key, &b));

        assert!(!task_a.is_cancelled());
        assert!(!task_b.is_cancelled());
        assert_eq!(dispatcher.in_flight(), 2);
    }

    #[test]
    fn test_cancel_work() {
        let dispatcher = TaskDispatcher::new();
        let target = target();
        let key = CacheKey::new("/a.png");

        let task = started(dispatcher.bind(&key, &target));
        assert!(dispatcher.cancel_work(&target));
        assert!(!dispatcher.cancel_work(&target));
        assert_eq!(task.cancel_reason(), Some(SuppressReason::Cancelled));

        // A cancelled task no longer deduplicates
        started(dispatcher.bind(&key, &target));
    }

    #[test]
    fn test_delivery_lock_is_per_target() {
        let dispatcher = TaskDispatcher::new();
        let key = CacheKey::new("/a.png");
        let (a, b) = (target(), target());

        let lock = dispatcher.delivery_lock(&a);
        let task = started(dispatcher.bind(&key, &a));
        assert!(dispatcher.release(target_id(&a), &task));

        // Releasing the task keeps the lock
        assert!(Arc::ptr_eq(&lock, &dispatcher.delivery_lock(&a)));
        assert!(!Arc::ptr_eq(&lock, &dispatcher.delivery_lock(&b)));
        assert_eq!(dispatcher.in_flight(), 0);

        // Reentrant on the holding thread, exclusive for others
        let _held = lock.lock();
        let _again = lock.lock();
        let same = Arc::clone(&lock);
        let other = dispatcher.delivery_lock(&b);
        let attempts =
            std::thread::spawn(move || (same.try_lock().is_some(), other.try_lock().is_some()));
        assert_eq!(attempts.join().unwrap(), (false, true));
    }

    #[test]
    fn test_dropped_targets_pruned() {
        let dispatcher = TaskDispatcher::new();
        let key = CacheKey::new("/a.png");

        let gone = target();
        started(dispatcher.bind(&key, &gone));
        drop(gone);

        let live = target();
        started(dispatcher.bind(&key, &live));
        assert_eq!(dispatcher.in_flight(), 1);
    }

    #[test]
    fn test_pause_blocks_until_resumed() {
        let dispatcher = Arc::new(TaskDispatcher::new());
        let target = target();
        let task = started(dispatcher.bind(&CacheKey::new("/a.png"), &target));
        dispatcher.set_pause_work(true);

        let worker = {
            let dispatcher = Arc::clone(&dispatcher);
            let task = Arc::clone(&task);
            std::thread::spawn(move || dispatcher.wait_if_paused(&task))
        };
        while dispatcher.paused_workers() == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_finished());

        dispatcher.set_pause_work(false);
        worker.join().unwrap();
        assert_eq!(dispatcher.paused_workers(), 0);
    }

    #[test]
    fn test_cancel_wakes_paused_worker() {
        let dispatcher = Arc::new(TaskDispatcher::new());
        let target = target();
        let task = started(dispatcher.bind(&CacheKey::new("/a.png"), &target));
        dispatcher.set_pause_work(true);

        let worker = {
            let dispatcher = Arc::clone(&dispatcher);
            let task = Arc::clone(&task);
            std::thread::spawn(move || dispatcher.wait_if_paused(&task))
        };
        while dispatcher.paused_workers() == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }

        dispatcher.cancel_work(&target);
        worker.join().unwrap();
        assert!(dispatcher.is_paused());
    }

    #[test]
    fn test_exit_early_resumes() {
        let dispatcher = TaskDispatcher::new();
        dispatcher.set_pause_work(true);
        dispatcher.set_exit_tasks_early(true);

        assert!(dispatcher.exit_early());
        assert!(!dispatcher.is_paused());
    }
}
