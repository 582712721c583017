//! Lock-free pool of equal-size blocks. This is the allocation pattern the runtime uses wherever an
//! allocation must not recurse into the general heap once the pool is warm.
//!
//! Blocks live in a fixed-capacity [BlockArena]. A free list is a stack of arena slot indices,
//! threaded through each slot's `next` field, and described by a `(head, tail)` control record that
//! is always loaded and stored as one 64-bit value. The list is never edited in place: every
//! operation swaps the whole record out for an empty one (detach), works on that private snapshot,
//! and then prepends whatever is left back onto the shared list with a CAS loop (attach). A slot is
//! therefore only ever touched by the one thread that detached the list containing it, which rules
//! out the usual lock-free stack reuse hazard without tagging.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
    hint::spin_loop,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};
use std::alloc::System;

use atomic::Atomic;
use bytemuck::NoUninit;
use static_assertions::{assert_impl_all, const_assert_eq};
use tracing::{trace, warn};

use crate::AllocError;

const NIL: u32 = u32::MAX;

// Blocks are aligned for any fundamental type.
const BLOCK_ALIGN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, NoUninit)]
#[repr(C, align(8))]
struct Control {
    head: u32,
    tail: u32,
}

const_assert_eq!(core::mem::size_of::<Control>(), 8);

impl Control {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
    };

    const fn single(idx: u32) -> Self {
        Self {
            head: idx,
            tail: idx,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == NIL
    }
}

struct Slot {
    next: AtomicU32,
    storage: AtomicPtr<u8>,
}

impl Slot {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            storage: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

struct FreeList {
    control: Atomic<Control>,
    // Count detaches begun and finished. While they differ, some of the list may be held in a
    // private snapshot and an empty control record proves nothing.
    started: AtomicUsize,
    finished: AtomicUsize,
}

/// A list taken out of a [FreeList]. The list counts as busy until this is dropped, which must
/// happen only after whatever is left of the chain has been attached somewhere.
struct Detached<'a> {
    list: &'a FreeList,
    chain: Control,
}

impl Drop for Detached<'_> {
    fn drop(&mut self) {
        self.list.finished.fetch_add(1, Ordering::SeqCst);
    }
}

impl FreeList {
    fn new() -> Self {
        Self {
            control: Atomic::new(Control::EMPTY),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    fn detach(&self) -> Detached<'_> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Detached {
            list: self,
            chain: self.control.swap(Control::EMPTY, Ordering::SeqCst),
        }
    }

    fn attach(&self, slots: &[Slot], chain: Control) {
        debug_assert!(!chain.is_empty());
        let mut current = self.control.load(Ordering::SeqCst);
        loop {
            // The chain is ours until the CAS succeeds, so its tail link may be rewritten freely.
            slots[chain.tail as usize]
                .next
                .store(current.head, Ordering::Relaxed);
            let new = Control {
                head: chain.head,
                tail: if current.is_empty() {
                    chain.tail
                } else {
                    current.tail
                },
            };
            match self.control.compare_exchange_weak(
                current,
                new,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pop the head of a detached snapshot, putting the remainder back. Returns the popped index.
    fn pop(&self, slots: &[Slot]) -> Option<u32> {
        let snap = self.detach();
        if snap.chain.is_empty() {
            return None;
        }
        let next = slots[snap.chain.head as usize]
            .next
            .load(Ordering::Relaxed);
        if next != NIL {
            self.attach(
                slots,
                Control {
                    head: next,
                    tail: snap.chain.tail,
                },
            );
        }
        Some(snap.chain.head)
    }

    /// True if, at one instant, the list was empty and no snapshot of it was held anywhere.
    /// False means the list may hold blocks and is worth another try.
    fn is_settled_empty(&self) -> bool {
        let finished = self.finished.load(Ordering::SeqCst);
        let started = self.started.load(Ordering::SeqCst);
        if started != finished {
            return false;
        }
        let empty = self.control.load(Ordering::SeqCst).is_empty();
        empty && self.started.load(Ordering::SeqCst) == started
    }
}

/// Walks a detached chain from head to tail.
fn chain_iter(slots: &[Slot], chain: Control) -> impl Iterator<Item = u32> + '_ {
    let mut cur = chain.head;
    core::iter::from_fn(move || {
        if cur == NIL {
            return None;
        }
        let idx = cur;
        cur = if idx == chain.tail {
            NIL
        } else {
            slots[idx as usize].next.load(Ordering::Relaxed)
        };
        Some(idx)
    })
}

/// Fixed-capacity backing store for blocks of `SIZE` bytes. Pools sharing an arena may splice
/// their free lists into one another.
pub struct BlockArena<const SIZE: usize> {
    slots: Box<[Slot]>,
    bump: AtomicU32,
    // Slots whose storage was given back to the backing allocator.
    vacant: FreeList,
    backing: &'static (dyn GlobalAlloc + Sync),
}

assert_impl_all!(BlockArena<64>: Send, Sync);

impl<const SIZE: usize> BlockArena<SIZE> {
    pub const BLOCK_SIZE: usize = SIZE;

    /// Create an arena with room for `capacity` blocks, backed by the system allocator.
    pub fn new(capacity: u32) -> Self {
        Self::with_backing(capacity, &System)
    }

    /// Create an arena whose block storage comes from `backing`.
    ///
    /// # Panics
    /// Panics if `SIZE` is zero, or if `capacity` is `u32::MAX`.
    pub fn with_backing(capacity: u32, backing: &'static (dyn GlobalAlloc + Sync)) -> Self {
        assert!(SIZE > 0, "zero-sized blocks are not supported");
        assert!(capacity < NIL, "arena capacity too large");
        if !Atomic::<Control>::is_lock_free() {
            warn!("block pool control record is not lock-free on this target");
        }
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            bump: AtomicU32::new(0),
            vacant: FreeList::new(),
            backing,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of slots that have ever been handed a block. Slots are only reserved when no free or
    /// vacant slot was available.
    pub fn reserved_slots(&self) -> u32 {
        self.bump.load(Ordering::Relaxed)
    }

    /// Create a new, empty pool on this arena.
    pub fn pool(&self) -> FixedBlockPool<'_, SIZE> {
        FixedBlockPool::new(self)
    }

    fn layout() -> Result<Layout, AllocError> {
        Layout::from_size_align(SIZE, BLOCK_ALIGN).map_err(|_| AllocError::OutOfMemory { size: SIZE })
    }

    fn take_slot(&self) -> Result<u32, AllocError> {
        let capacity = self.capacity();
        loop {
            if let Some(idx) = self.vacant.pop(&self.slots) {
                return Ok(idx);
            }
            let reserved = self
                .bump
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    (n < capacity).then_some(n + 1)
                });
            match reserved {
                Ok(idx) => return Ok(idx),
                Err(_) if !self.vacant.is_settled_empty() => spin_loop(),
                Err(_) => return Err(AllocError::ArenaExhausted { capacity }),
            }
        }
    }

    fn fresh_block(&self) -> Result<Block<'_, SIZE>, AllocError> {
        let layout = Self::layout()?;
        let idx = self.take_slot()?;
        let storage = unsafe { self.backing.alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(storage) else {
            self.vacant.attach(&self.slots, Control::single(idx));
            return Err(AllocError::OutOfMemory { size: SIZE });
        };
        self.slots[idx as usize]
            .storage
            .store(storage, Ordering::Release);
        trace!("block arena: new block in slot {}", idx);
        Ok(Block {
            arena: self,
            slot: idx,
            ptr,
        })
    }

    fn block(&self, idx: u32) -> Block<'_, SIZE> {
        let storage = self.slots[idx as usize].storage.load(Ordering::Acquire);
        debug_assert!(!storage.is_null());
        Block {
            arena: self,
            slot: idx,
            // Safety: slots on a free list always own storage.
            ptr: unsafe { NonNull::new_unchecked(storage) },
        }
    }

    /// Give the storage of every slot in a detached chain back to the backing allocator, and move
    /// the slots to the vacant list.
    fn release_chain(&self, chain: Control) -> usize {
        let Ok(layout) = Self::layout() else {
            return 0;
        };
        let mut count = 0;
        for idx in chain_iter(&self.slots, chain) {
            let storage = self.slots[idx as usize]
                .storage
                .swap(core::ptr::null_mut(), Ordering::AcqRel);
            if !storage.is_null() {
                unsafe { self.backing.dealloc(storage, layout) };
            }
            count += 1;
        }
        self.vacant.attach(&self.slots, chain);
        count
    }
}

impl<const SIZE: usize> Drop for BlockArena<SIZE> {
    fn drop(&mut self) {
        let Ok(layout) = Self::layout() else {
            return;
        };
        for slot in self.slots.iter() {
            let storage = slot.storage.swap(core::ptr::null_mut(), Ordering::AcqRel);
            if !storage.is_null() {
                unsafe { self.backing.dealloc(storage, layout) };
            }
        }
    }
}

impl<const SIZE: usize> core::fmt::Debug for BlockArena<SIZE> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockArena")
            .field("block_size", &SIZE)
            .field("capacity", &self.capacity())
            .field("reserved", &self.reserved_slots())
            .finish()
    }
}

/// A live block, owned by the caller until it is handed back with
/// [FixedBlockPool::deallocate]. Dropping a block without returning it leaks its slot until the
/// arena itself is dropped.
#[must_use]
pub struct Block<'a, const SIZE: usize> {
    arena: &'a BlockArena<SIZE>,
    slot: u32,
    ptr: NonNull<u8>,
}

// Safety: a live block's storage is reachable from nowhere else.
unsafe impl<const SIZE: usize> Send for Block<'_, SIZE> {}
unsafe impl<const SIZE: usize> Sync for Block<'_, SIZE> {}

impl<const SIZE: usize> Block<'_, SIZE> {
    /// The arena slot this block occupies. Unique among live blocks of one arena.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: storage is zero-initialized when first allocated and only ever written through
        // this handle while live.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), SIZE) }
    }
}

impl<const SIZE: usize> core::fmt::Debug for Block<'_, SIZE> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Block({}@{:p})", self.slot, self.ptr)
    }
}

/// A pool of free blocks on a [BlockArena].
pub struct FixedBlockPool<'a, const SIZE: usize> {
    arena: &'a BlockArena<SIZE>,
    free: FreeList,
}

assert_impl_all!(FixedBlockPool<'static, 64>: Send, Sync);

impl<'a, const SIZE: usize> FixedBlockPool<'a, SIZE> {
    pub fn new(arena: &'a BlockArena<SIZE>) -> Self {
        Self {
            arena,
            free: FreeList::new(),
        }
    }

    pub fn arena(&self) -> &'a BlockArena<SIZE> {
        self.arena
    }

    /// Take a block from the free list, or a fresh one from the backing allocator if the free list
    /// is empty (or momentarily detached by another thread). Never blocks.
    ///
    /// [AllocError::ArenaExhausted] is only reported when every slot of the arena is taken and
    /// this pool really has no free block; a free list that is merely detached by another thread
    /// is retried.
    pub fn allocate(&self) -> Result<Block<'a, SIZE>, AllocError> {
        loop {
            if let Some(idx) = self.free.pop(&self.arena.slots) {
                return Ok(self.arena.block(idx));
            }
            match self.arena.fresh_block() {
                Err(AllocError::ArenaExhausted { .. }) if !self.free.is_settled_empty() => {
                    spin_loop()
                }
                other => return other,
            }
        }
    }

    /// Return a block to this pool. Passing `None` is a no-op.
    ///
    /// # Panics
    /// Panics if the block came from a different arena.
    pub fn deallocate(&self, block: impl Into<Option<Block<'a, SIZE>>>) {
        let Some(block) = block.into() else {
            return;
        };
        assert!(
            core::ptr::eq(block.arena, self.arena),
            "block returned to a pool on a different arena"
        );
        self.free
            .attach(&self.arena.slots, Control::single(block.slot));
    }

    /// Release every currently-free block to the backing allocator, returning how many were
    /// released. Live blocks are unaffected and may still be deallocated here afterwards; they go
    /// onto the (again empty) free list as usual.
    pub fn clear(&self) -> usize {
        let snap = self.free.detach();
        if snap.chain.is_empty() {
            return 0;
        }
        let count = self.arena.release_chain(snap.chain);
        trace!("block pool: released {} blocks", count);
        count
    }

    /// Move the whole free list of `other` onto this pool in O(1), leaving `other` empty.
    ///
    /// # Panics
    /// Panics if the two pools are on different arenas.
    pub fn splice(&self, other: &Self) {
        assert!(
            core::ptr::eq(self.arena, other.arena),
            "cannot splice pools on different arenas"
        );
        if core::ptr::eq(self, other) {
            return;
        }
        let snap = other.free.detach();
        if snap.chain.is_empty() {
            return;
        }
        self.free.attach(&self.arena.slots, snap.chain);
    }

    /// Count the free blocks. The list is detached while counting, so concurrent allocations may
    /// fall through to fresh blocks; use for diagnostics and tests.
    pub fn free_len(&self) -> usize {
        let snap = self.free.detach();
        if snap.chain.is_empty() {
            return 0;
        }
        let count = chain_iter(&self.arena.slots, snap.chain).count();
        self.free.attach(&self.arena.slots, snap.chain);
        count
    }
}

impl<const SIZE: usize> Drop for FixedBlockPool<'_, SIZE> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

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
    fn round_trip() {
        let arena = BlockArena::<32>::new(16);
        let pool = arena.pool();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        let slots: HashSet<u32> = [a.slot(), b.slot(), c.slot()].into_iter().collect();
        assert_eq!(slots.len(), 3);
        assert_eq!(arena.reserved_slots(), 3);

        pool.deallocate(a);
        pool.deallocate(b);
        pool.deallocate(c);
        assert_eq!(pool.free_len(), 3);

        let again: Vec<_> = (0..3).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(arena.reserved_slots(), 3);
        let reused: HashSet<u32> = again.iter().map(|b| b.slot()).collect();
        assert_eq!(reused, slots);
        assert_eq!(pool.free_len(), 0);
        for b in again {
            pool.deallocate(b);
        }
    }

    #[test]
    fn most_recently_freed_first() {
        let arena = BlockArena::<8>::new(4);
        let pool = arena.pool();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let (sa, sb) = (a.slot(), b.slot());
        pool.deallocate(a);
        pool.deallocate(b);
        assert_eq!(pool.allocate().unwrap().slot(), sb);
        assert_eq!(pool.allocate().unwrap().slot(), sa);
    }

    #[test]
    fn blocks_are_writable_and_zeroed() {
        let arena = BlockArena::<64>::new(2);
        let pool = arena.pool();
        let mut block = pool.allocate().unwrap();
        assert_eq!(block.as_slice().len(), 64);
        assert!(block.as_slice().iter().all(|b| *b == 0));
        block.as_mut_slice().fill(0xab);
        assert_eq!(block.as_ptr() as usize % BLOCK_ALIGN, 0);
        let slot = block.slot();
        pool.deallocate(block);
        let block = pool.allocate().unwrap();
        assert_eq!(block.slot(), slot);
        assert!(block.as_slice().iter().all(|b| *b == 0xab));
        pool.deallocate(block);
    }

    #[test]
    fn deallocate_none_is_noop() {
        let arena = BlockArena::<8>::new(1);
        let pool = arena.pool();
        pool.deallocate(None);
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn splice_conserves_blocks() {
        let arena = BlockArena::<16>::new(8);
        let a = arena.pool();
        let b = arena.pool();

        let from_a: Vec<_> = (0..3).map(|_| a.allocate().unwrap()).collect();
        let from_b: Vec<_> = (0..2).map(|_| b.allocate().unwrap()).collect();
        let b_slots: HashSet<u32> = from_b.iter().map(|x| x.slot()).collect();
        for x in from_a {
            a.deallocate(x);
        }
        for x in from_b {
            b.deallocate(x);
        }
        assert_eq!(a.free_len() + b.free_len(), 5);

        a.splice(&b);
        assert_eq!(b.free_len(), 0);
        assert_eq!(a.free_len(), 5);

        let drained: HashSet<u32> = (0..5).map(|_| a.allocate().unwrap().slot()).collect();
        assert!(b_slots.is_subset(&drained));
        assert_eq!(drained.len(), 5);
        assert_eq!(arena.reserved_slots(), 5);
    }

    #[test]
    fn splice_empty_and_self() {
        let arena = BlockArena::<16>::new(4);
        let a = arena.pool();
        let b = arena.pool();
        a.deallocate(a.allocate().unwrap());
        a.splice(&b);
        a.splice(&a);
        assert_eq!(a.free_len(), 1);
        assert_eq!(b.free_len(), 0);
    }

    #[test]
    #[should_panic]
    fn splice_across_arenas_panics() {
        let one = BlockArena::<16>::new(4);
        let two = BlockArena::<16>::new(4);
        one.pool().splice(&two.pool());
    }

    #[test]
    fn clear_releases_free_blocks_only() {
        let arena = BlockArena::<32>::new(4);
        let pool = arena.pool();
        let held = pool.allocate().unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.deallocate(a);
        pool.deallocate(b);

        assert_eq!(pool.clear(), 2);
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.clear(), 0);

        // Returning a block that was live across the clear is fine.
        let held_slot = held.slot();
        pool.deallocate(held);
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.allocate().unwrap().slot(), held_slot);

        // Vacated slots are reused before new ones are reserved.
        let fresh = pool.allocate().unwrap();
        assert!(fresh.as_slice().iter().all(|b| *b == 0));
        assert_eq!(arena.reserved_slots(), 3);
    }

    #[test]
    fn arena_exhaustion() {
        let arena = BlockArena::<8>::new(2);
        let pool = arena.pool();
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert_eq!(
            pool.allocate().unwrap_err(),
            AllocError::ArenaExhausted { capacity: 2 }
        );
    }

    #[test]
    fn backing_failure_is_reported() {
        let arena = BlockArena::<24>::with_backing(4, &FAIL_ALLOC);
        let pool = arena.pool();
        assert_eq!(
            pool.allocate().unwrap_err(),
            AllocError::OutOfMemory { size: 24 }
        );
        // The slot was not lost.
        assert_eq!(
            pool.allocate().unwrap_err(),
            AllocError::OutOfMemory { size: 24 }
        );
        assert_eq!(arena.reserved_slots(), 1);
    }

    #[test]
    fn concurrent_no_double_issue_no_loss() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2000;
        const HELD: usize = 4;

        // Exactly enough slots for every thread to hold its blocks at once.
        let arena = BlockArena::<64>::new((THREADS * HELD) as u32);
        let pool = arena.pool();

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let pool = &pool;
                s.spawn(move || {
                    let tag = t as u8 + 1;
                    for _ in 0..ROUNDS {
                        let mut held: Vec<_> = (0..HELD).map(|_| pool.allocate().unwrap()).collect();
                        for b in held.iter_mut() {
                            b.as_mut_slice().fill(tag);
                        }
                        std::thread::yield_now();
                        for b in held.iter() {
                            assert!(b.as_slice().iter().all(|x| *x == tag));
                        }
                        for b in held {
                            pool.deallocate(b);
                        }
                    }
                });
            }
        });

        assert_eq!(pool.free_len(), arena.reserved_slots() as usize);
        let all: HashSet<u32> = (0..arena.reserved_slots())
            .map(|_| pool.allocate().unwrap().slot())
            .collect();
        assert_eq!(all.len(), arena.reserved_slots() as usize);
    }

    #[test]
    fn contention_never_reports_spurious_exhaustion() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 20_000;

        // One slot per thread: a free block always exists when a thread asks for one, even if the
        // free list is detached by a neighbour at that moment.
        let arena = BlockArena::<16>::new(THREADS as u32);
        let pool = arena.pool();
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                let pool = &pool;
                s.spawn(move || {
                    for _ in 0..ROUNDS {
                        let block = pool.allocate().unwrap();
                        pool.deallocate(block);
                    }
                });
            }
        });
        assert!(arena.reserved_slots() <= THREADS as u32);
        assert_eq!(pool.free_len(), arena.reserved_slots() as usize);
    }

    #[test]
    fn exhaustion_still_reported_when_all_live() {
        let arena = BlockArena::<16>::new(2);
        let pool = arena.pool();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(
                    pool.allocate().unwrap_err(),
                    AllocError::ArenaExhausted { capacity: 2 }
                );
            });
        });
        pool.deallocate(a);
        let again = pool.allocate().unwrap();
        pool.deallocate(again);
        pool.deallocate(b);
    }
}
