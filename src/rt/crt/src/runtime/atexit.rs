//! Deferred-exit callbacks: functions registered to run once, most recent first, while the
//! process is being torn down.
//!
//! Callbacks are stored in fixed-capacity blocks linked newest-first, so registration only ever
//! needs one fixed-size allocation per `N` callbacks and never an arbitrary-size one.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
};
use std::alloc::System;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{AllocError, RegistryError};

pub const CALLBACKS_PER_BLOCK: usize = 64;

/// A deferred-exit function. It receives the context value it was registered with.
pub type ExitFn = fn(usize);

#[derive(Clone, Copy)]
struct ExitCallback {
    func: ExitFn,
    context: usize,
}

fn noop(_: usize) {}

impl ExitCallback {
    const EMPTY: Self = Self {
        func: noop,
        context: 0,
    };
}

struct CallbackBlock<const N: usize> {
    prev: Option<NonNull<CallbackBlock<N>>>,
    len: usize,
    callbacks: [ExitCallback; N],
}

impl<const N: usize> CallbackBlock<N> {
    fn is_full(&self) -> bool {
        self.len >= N
    }

    fn push(&mut self, cb: ExitCallback) {
        debug_assert!(!self.is_full());
        self.callbacks[self.len] = cb;
        self.len += 1;
    }

    fn run(&self) {
        for cb in self.callbacks[..self.len].iter().rev() {
            (cb.func)(cb.context);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Draining,
    Drained,
}

struct RegistryInner<const N: usize> {
    newest: Option<NonNull<CallbackBlock<N>>>,
    phase: Phase,
}

impl<const N: usize> RegistryInner<N> {
    fn check_open(&self) -> Result<(), RegistryError> {
        if self.phase == Phase::Open {
            Ok(())
        } else {
            Err(RegistryError::Closed)
        }
    }

    fn newest_with_room(&mut self) -> Option<&mut CallbackBlock<N>> {
        // Safety: blocks reachable from the registry are only touched with the lock held.
        let block = unsafe { self.newest?.as_mut() };
        (!block.is_full()).then_some(block)
    }
}

/// Process-wide stack of deferred-exit callbacks, `N` per storage block.
pub struct DeferredExitRegistry<const N: usize = CALLBACKS_PER_BLOCK> {
    inner: Mutex<RegistryInner<N>>,
    backing: &'static (dyn GlobalAlloc + Sync),
}

// Safety: the block chain is owned by the registry and only reached through the mutex, or after
// being detached from it.
unsafe impl<const N: usize> Send for DeferredExitRegistry<N> {}
unsafe impl<const N: usize> Sync for DeferredExitRegistry<N> {}

impl<const N: usize> Default for DeferredExitRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DeferredExitRegistry<N> {
    pub fn new() -> Self {
        Self::with_backing(&System)
    }

    pub fn with_backing(backing: &'static (dyn GlobalAlloc + Sync)) -> Self {
        assert!(N > 0, "callback blocks must hold at least one callback");
        Self {
            inner: Mutex::new(RegistryInner {
                newest: None,
                phase: Phase::Open,
            }),
            backing,
        }
    }

    fn alloc_block(&self) -> Result<NonNull<CallbackBlock<N>>, AllocError> {
        let layout = Layout::new::<CallbackBlock<N>>();
        let ptr = NonNull::new(unsafe { self.backing.alloc(layout) } as *mut CallbackBlock<N>)
            .ok_or(AllocError::OutOfMemory {
                size: layout.size(),
            })?;
        unsafe {
            ptr.as_ptr().write(CallbackBlock {
                prev: None,
                len: 0,
                callbacks: [ExitCallback::EMPTY; N],
            })
        };
        Ok(ptr)
    }

    fn free_block(&self, block: NonNull<CallbackBlock<N>>) {
        unsafe {
            self.backing
                .dealloc(block.as_ptr() as *mut u8, Layout::new::<CallbackBlock<N>>())
        };
    }

    /// Register `func` to be called with `context` at teardown. Fails only if a new callback block
    /// was needed and could not be allocated, or if the registry has started draining.
    pub fn register(&self, func: ExitFn, context: usize) -> Result<(), RegistryError> {
        let cb = ExitCallback { func, context };
        {
            let mut inner = self.inner.lock();
            inner.check_open()?;
            if let Some(block) = inner.newest_with_room() {
                block.push(cb);
                return Ok(());
            }
        }

        // The backing allocator is called without the lock held.
        let fresh = self.alloc_block()?;

        let mut inner = self.inner.lock();
        if let Err(e) = inner.check_open() {
            drop(inner);
            self.free_block(fresh);
            return Err(e);
        }
        // Someone else may have linked a block meanwhile. Keep older blocks full.
        if let Some(block) = inner.newest_with_room() {
            block.push(cb);
            drop(inner);
            self.free_block(fresh);
            return Ok(());
        }
        unsafe {
            let block = &mut *fresh.as_ptr();
            block.prev = inner.newest;
            block.push(cb);
        }
        inner.newest = Some(fresh);
        trace!("deferred-exit registry: linked new callback block");
        Ok(())
    }

    /// Run every registered callback exactly once, newest first, then release all storage.
    ///
    /// Further registrations, including ones made by the callbacks themselves, are refused with
    /// [RegistryError::Closed]. If a callback panics, the callbacks not yet run are dropped with
    /// their storage and the registry still ends up drained.
    pub fn run_all(&self) {
        let newest = {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::Open {
                warn!("deferred-exit registry drained more than once");
                return;
            }
            inner.phase = Phase::Draining;
            inner.newest.take()
        };

        let mut drain = Drain {
            registry: self,
            block: newest,
        };
        let mut ran = 0;
        while let Some(ptr) = drain.block {
            // Safety: the chain was detached above and is now exclusively ours.
            let cur = unsafe { ptr.as_ref() };
            cur.run();
            ran += cur.len;
            drain.block = cur.prev;
            self.free_block(ptr);
        }
        debug!("deferred-exit registry: ran {} callbacks", ran);
    }

    /// Number of registered, not yet run, callbacks.
    pub fn len(&self) -> usize {
        self.fold_blocks(0, |acc, b| acc + b.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of callback blocks currently allocated.
    pub fn block_count(&self) -> usize {
        self.fold_blocks(0, |acc, _| acc + 1)
    }

    fn fold_blocks<T>(&self, init: T, f: impl Fn(T, &CallbackBlock<N>) -> T) -> T {
        let inner = self.inner.lock();
        let mut acc = init;
        let mut block = inner.newest;
        while let Some(ptr) = block {
            let cur = unsafe { ptr.as_ref() };
            acc = f(acc, cur);
            block = cur.prev;
        }
        acc
    }
}

/// The part of a detached chain not yet run. Dropping it frees what is left and closes the
/// registry for good, whether the drain finished or a callback unwound out of it.
struct Drain<'a, const N: usize> {
    registry: &'a DeferredExitRegistry<N>,
    block: Option<NonNull<CallbackBlock<N>>>,
}

impl<const N: usize> Drop for Drain<'_, N> {
    fn drop(&mut self) {
        let mut skipped = 0;
        while let Some(ptr) = self.block.take() {
            let cur = unsafe { ptr.as_ref() };
            skipped += cur.len;
            self.block = cur.prev;
            self.registry.free_block(ptr);
        }
        if skipped > 0 {
            warn!(
                "deferred-exit registry: {} callbacks skipped after a callback panicked",
                skipped
            );
        }
        self.registry.inner.lock().phase = Phase::Drained;
    }
}

impl<const N: usize> Drop for DeferredExitRegistry<N> {
    fn drop(&mut self) {
        let mut block = self.inner.get_mut().newest.take();
        if block.is_some() {
            warn!("deferred-exit registry dropped with callbacks that never ran");
        }
        while let Some(ptr) = block {
            block = unsafe { ptr.as_ref() }.prev;
            self.free_block(ptr);
        }
    }
}

impl<const N: usize> core::fmt::Debug for DeferredExitRegistry<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeferredExitRegistry")
            .field("per_block", &N)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    use super::*;

    struct FailAlloc;

    unsafe impl GlobalAlloc for FailAlloc {
        unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
            core::ptr::null_mut()
        }

        unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
            panic!("cannot deallocate from FailAlloc. This is a bug.")
        }
    }

    static FAIL_ALLOC: FailAlloc = FailAlloc;

    #[test]
    fn lifo_order() {
        static LOG: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());
        fn cb(ctx: usize) {
            LOG.lock().unwrap().push(ctx);
        }

        let reg = DeferredExitRegistry::<CALLBACKS_PER_BLOCK>::new();
        reg.register(cb, 1).unwrap();
        reg.register(cb, 2).unwrap();
        reg.register(cb, 3).unwrap();
        assert_eq!(reg.len(), 3);
        reg.run_all();
        assert_eq!(*LOG.lock().unwrap(), vec![3, 2, 1]);
        assert!(reg.is_empty());
        assert_eq!(reg.block_count(), 0);
    }

    #[test]
    fn capacity_boundary() {
        static LOG: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());
        fn cb(ctx: usize) {
            LOG.lock().unwrap().push(ctx);
        }

        let reg = DeferredExitRegistry::<CALLBACKS_PER_BLOCK>::new();
        for i in 0..CALLBACKS_PER_BLOCK {
            reg.register(cb, i).unwrap();
        }
        assert_eq!(reg.block_count(), 1);
        reg.register(cb, CALLBACKS_PER_BLOCK).unwrap();
        assert_eq!(reg.block_count(), 2);
        assert_eq!(reg.len(), CALLBACKS_PER_BLOCK + 1);

        reg.run_all();
        let expected: Vec<usize> = (0..=CALLBACKS_PER_BLOCK).rev().collect();
        assert_eq!(*LOG.lock().unwrap(), expected);
    }

    #[test]
    fn exactly_once() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn cb(_: usize) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }

        let reg = DeferredExitRegistry::<4>::new();
        for i in 0..10 {
            reg.register(cb, i).unwrap();
        }
        assert_eq!(reg.block_count(), 3);
        reg.run_all();
        reg.run_all();
        assert_eq!(HITS.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn allocation_failure() {
        fn cb(_: usize) {}
        let reg = DeferredExitRegistry::<4>::with_backing(&FAIL_ALLOC);
        let err = reg.register(cb, 0).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Alloc(AllocError::OutOfMemory { .. })
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn register_during_drain_is_refused() {
        static REG: std::sync::OnceLock<DeferredExitRegistry<2>> = std::sync::OnceLock::new();
        static REFUSED: AtomicUsize = AtomicUsize::new(0);
        static RAN: AtomicUsize = AtomicUsize::new(0);
        fn late(_: usize) {
            RAN.fetch_add(100, Ordering::SeqCst);
        }
        fn reentrant(_: usize) {
            RAN.fetch_add(1, Ordering::SeqCst);
            let reg = REG.get().unwrap();
            if reg.register(late, 0) == Err(RegistryError::Closed) {
                REFUSED.fetch_add(1, Ordering::SeqCst);
            }
        }

        let reg = REG.get_or_init(DeferredExitRegistry::new);
        reg.register(reentrant, 0).unwrap();
        reg.register(reentrant, 1).unwrap();
        reg.register(reentrant, 2).unwrap();
        reg.run_all();

        assert_eq!(RAN.load(Ordering::SeqCst), 3);
        assert_eq!(REFUSED.load(Ordering::SeqCst), 3);
        assert_eq!(reg.register(late, 0), Err(RegistryError::Closed));
    }

    #[test]
    fn concurrent_registration() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn cb(_: usize) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }

        let reg = DeferredExitRegistry::<8>::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 0..250 {
                        reg.register(cb, i).unwrap();
                    }
                });
            }
        });
        assert_eq!(reg.len(), 1000);
        assert_eq!(reg.block_count(), 1000 / 8);
        reg.run_all();
        assert_eq!(HITS.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn panicking_callback_still_drains() {
        static OUTSTANDING: AtomicUsize = AtomicUsize::new(0);
        static LOG: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

        struct Counting;

        unsafe impl GlobalAlloc for Counting {
            unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
                OUTSTANDING.fetch_add(1, Ordering::SeqCst);
                System.alloc(layout)
            }

            unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
                OUTSTANDING.fetch_sub(1, Ordering::SeqCst);
                System.dealloc(ptr, layout)
            }
        }

        static COUNTING: Counting = Counting;

        fn cb(ctx: usize) {
            LOG.lock().unwrap().push(ctx);
            if ctx == 3 {
                panic!("callback {} failed", ctx);
            }
        }

        let reg = DeferredExitRegistry::<2>::with_backing(&COUNTING);
        for i in 0..5 {
            reg.register(cb, i).unwrap();
        }
        assert_eq!(OUTSTANDING.load(Ordering::SeqCst), 3);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| reg.run_all()));
        assert!(result.is_err());
        assert_eq!(*LOG.lock().unwrap(), vec![4, 3]);
        assert_eq!(OUTSTANDING.load(Ordering::SeqCst), 0);
        assert_eq!(reg.register(cb, 9), Err(RegistryError::Closed));

        reg.run_all();
        assert_eq!(*LOG.lock().unwrap(), vec![4, 3]);
    }
}
