//! A thread-safe facade that partitions one pool into independently
//! locked arenas.
use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    init::Init,
    tlsf::{Statistics, Tlsf, ALIGN, BLOCK_SIZE_SMALL, FLLEN_DEFAULT},
    utils::nonnull_slice_from_raw_parts,
};

/// A mutual-exclusion primitive pluggable into [`TlsfArenas`].
///
/// A blocking acquire must eventually complete; neither operation may
/// suspend the caller outside of waiting for the lock itself. Timeouts and
/// cancellation are not part of this contract — a host that needs them
/// supplies a richer primitive and still exposes only these operations.
///
/// # Safety
///
/// A successful [`lock`](Self::lock) or [`try_lock`](Self::try_lock) must
/// grant exclusive access until the matching [`unlock`](Self::unlock).
pub unsafe trait ArenaLock: Init {
    /// Acquire the lock, waiting until it becomes available.
    fn lock(&self);

    /// Attempt to acquire the lock without waiting. Returns `true` on
    /// success.
    fn try_lock(&self) -> bool;

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock.
    unsafe fn unlock(&self);
}

/// The default [`ArenaLock`]: a test-and-test-and-set spin lock.
///
/// Usable on bare metal; hosted applications holding the lock across
/// long-running work may prefer plugging in an OS primitive.
#[derive(Debug)]
pub struct SpinLock(AtomicBool);

impl Init for SpinLock {
    const INIT: Self = Self(AtomicBool::new(false));
}

unsafe impl ArenaLock for SpinLock {
    #[inline]
    fn lock(&self) {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on the cheap load; retry the exchange only once the
            // lock looks free
            while self.0.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Arena records are padded out to this many bytes so neighboring arenas
/// do not share a cache line.
const CACHELINE_SIZE: usize = 64;

/// The smallest per-arena share worth running an allocator on. Shares
/// below this halve the arena count instead.
const ARENA_MIN_BYTES: usize = 4 * BLOCK_SIZE_SMALL;

/// One sub-pool together with its lock and address range.
#[repr(align(64))]
struct Arena<'pool, L, const FLLEN: usize> {
    lock: L,
    tlsf: UnsafeCell<Tlsf<'pool, FLLEN>>,
    base: usize,
    len: usize,
}

/// A thread-safe allocator facade.
///
/// The caller-supplied region is sliced into `ARENAS` (a power of two)
/// equal, cache-line-aligned sub-pools, each an independent [`Tlsf`]
/// guarded by its own lock. A thread's allocations are steered to a
/// *preferred arena* derived from its hint, so threads with distinct hints
/// contend only when their preferred arena runs dry and they spill into a
/// neighbor.
///
/// Every live pointer is owned by exactly one arena, determined by its
/// address; allocations never migrate between arenas except through
/// [`Self::resize`]'s explicit relocation. Construction and
/// [`Self::reset`] are not safe against concurrent operations on the same
/// instance; callers must quiesce first.
pub struct TlsfArenas<'pool, L, const FLLEN: usize, const ARENAS: usize> {
    arenas: [Arena<'pool, L, FLLEN>; ARENAS],
    /// `ARENAS`, halved until every share was viable at construction.
    count: usize,
}

/// [`TlsfArenas`] with the default lock, first-level depth, and arena
/// count.
pub type ArenaTlsf<'pool> = TlsfArenas<'pool, SpinLock, FLLEN_DEFAULT, 4>;

// Safety: each arena's `Tlsf` is only reached while that arena's lock is
//         held; the remaining fields are plain integers and the lock
//         itself.
unsafe impl<L: Send + Sync, const FLLEN: usize, const ARENAS: usize> Send
    for TlsfArenas<'_, L, FLLEN, ARENAS>
{
}

unsafe impl<L: Send + Sync, const FLLEN: usize, const ARENAS: usize> Sync
    for TlsfArenas<'_, L, FLLEN, ARENAS>
{
}

/// Grants access to one arena's `Tlsf` while holding its lock.
struct ArenaGuard<'a, 'pool, L: ArenaLock, const FLLEN: usize>(&'a Arena<'pool, L, FLLEN>);

impl<'pool, L: ArenaLock, const FLLEN: usize> ops::Deref for ArenaGuard<'_, 'pool, L, FLLEN> {
    type Target = Tlsf<'pool, FLLEN>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: Protected by `lock`
        unsafe { &*self.0.tlsf.get() }
    }
}

impl<'pool, L: ArenaLock, const FLLEN: usize> ops::DerefMut for ArenaGuard<'_, 'pool, L, FLLEN> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: Protected by `lock`
        unsafe { &mut *self.0.tlsf.get() }
    }
}

impl<L: ArenaLock, const FLLEN: usize> Drop for ArenaGuard<'_, '_, L, FLLEN> {
    #[inline]
    fn drop(&mut self) {
        // Safety: the guard was created by a successful acquisition
        unsafe { self.0.lock.unlock() };
    }
}

impl<'pool, L: ArenaLock, const FLLEN: usize, const ARENAS: usize>
    TlsfArenas<'pool, L, FLLEN, ARENAS>
{
    /// Evaluates successfully if the parameters are valid.
    const VALID: () = {
        if ARENAS == 0 || !ARENAS.is_power_of_two() {
            panic!("`ARENAS` must be a non-zero power of two");
        }
    };

    /// Partition `region` into arenas and initialize each sub-pool.
    ///
    /// The arena count starts at `ARENAS` and halves while a per-arena
    /// share would fall below a viable minimum, so small regions degrade
    /// to fewer, larger arenas rather than failing.
    pub fn new(region: &'pool mut [MaybeUninit<u8>]) -> Self {
        let () = Self::VALID;

        let range_start = region.as_mut_ptr() as usize;
        let len = region.len();

        let aligned = range_start.wrapping_add(CACHELINE_SIZE - 1) & !(CACHELINE_SIZE - 1);
        let avail = len.saturating_sub(aligned.wrapping_sub(range_start));

        let mut count = ARENAS;
        while count > 1 && avail / count < ARENA_MIN_BYTES {
            count >>= 1;
        }
        let share = (avail / count) & !(CACHELINE_SIZE - 1);

        let mut index = 0;
        let arenas = [(); ARENAS].map(|()| {
            let i = index;
            index += 1;

            let mut tlsf = Tlsf::INIT;
            let (base, len) = if i < count && share != 0 {
                (aligned + i * share, share)
            } else {
                (0, 0)
            };
            if len != 0 {
                // Safety: the shares are disjoint sub-slices of `region`,
                //         which the borrow keeps alive for `'pool`
                unsafe {
                    tlsf.init_ptr(nonnull_slice_from_raw_parts(
                        NonNull::new_unchecked(base as *mut u8),
                        len,
                    ));
                }
            }
            Arena {
                lock: L::INIT,
                tlsf: UnsafeCell::new(tlsf),
                base,
                len,
            }
        });

        Self { arenas, count }
    }

    /// The number of live arenas.
    #[inline]
    pub fn arena_count(&self) -> usize {
        self.count
    }

    /// Mix a thread hint into the preferred arena index.
    ///
    /// The hint only has to be stable per thread; it does not have to be
    /// unique. Typical choices are a task number, a core index, or a
    /// value derived from the native thread identifier.
    #[inline]
    pub fn preferred_arena(&self, hint: usize) -> usize {
        let mut h = (hint as u64 ^ ((hint as u64) >> 32)) as u32;
        h ^= h >> 16;
        h = h.wrapping_mul(0x45d9f3b);
        h ^= h >> 16;
        h as usize & (self.count - 1)
    }

    #[inline]
    fn lock_arena(&self, index: usize) -> ArenaGuard<'_, 'pool, L, FLLEN> {
        let arena = &self.arenas[index];
        arena.lock.lock();
        ArenaGuard(arena)
    }

    #[inline]
    fn try_lock_arena(&self, index: usize) -> Option<ArenaGuard<'_, 'pool, L, FLLEN>> {
        let arena = &self.arenas[index];
        if arena.lock.try_lock() {
            Some(ArenaGuard(arena))
        } else {
            None
        }
    }

    /// Attempt to allocate a block of memory.
    ///
    /// The preferred arena is tried under its lock first. If it cannot
    /// satisfy the request, the remaining arenas are visited in
    /// `preferred + 1, preferred + 2, …` order — first with non-blocking
    /// acquisition only, then, if every polite attempt failed, blocking on
    /// each in turn. Returns `None` only once every arena has refused.
    pub fn allocate(&self, hint: usize, size: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned(hint, ALIGN, size)
    }

    /// [`Self::allocate`] with an explicit alignment, which must be a
    /// non-zero power of two.
    pub fn allocate_aligned(&self, hint: usize, align: usize, size: usize) -> Option<NonNull<u8>> {
        let preferred = self.preferred_arena(hint);

        {
            let mut guard = self.lock_arena(preferred);
            if let Some(ptr) = guard.allocate_aligned(align, size) {
                return Some(ptr);
            }
        }

        // Spill over to the other arenas, politely at first
        for step in 1..self.count {
            let index = (preferred + step) & (self.count - 1);
            if let Some(mut guard) = self.try_lock_arena(index) {
                if let Some(ptr) = guard.allocate_aligned(align, size) {
                    return Some(ptr);
                }
            }
        }

        for step in 1..self.count {
            let index = (preferred + step) & (self.count - 1);
            let mut guard = self.lock_arena(index);
            if let Some(ptr) = guard.allocate_aligned(align, size) {
                return Some(ptr);
            }
        }

        None
    }

    /// The index of the arena whose address range contains `ptr`, or
    /// `None` for a pointer no arena owns.
    #[inline]
    pub fn owner_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        // A linear scan, but the range tuples of all arenas share a
        // handful of cache lines
        (0..self.count).find(|&i| {
            let arena = &self.arenas[i];
            addr.wrapping_sub(arena.base) < arena.len
        })
    }

    /// Release a previously allocated memory block into its owning arena.
    /// Pointers no arena owns are ignored.
    ///
    /// # Safety
    ///
    /// If any arena's range contains `ptr`, it must denote a live memory
    /// block previously allocated via `self`, and no other thread may
    /// operate on the same block concurrently.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        if let Some(index) = self.owner_of(ptr) {
            let mut guard = self.lock_arena(index);
            // Safety: Upheld by the caller
            guard.deallocate(ptr);
        }
    }

    /// Shrink or grow a previously allocated memory block.
    ///
    /// Resizing within the owning arena is attempted first. If that arena
    /// lacks space, the block is relocated: a new block is allocated from
    /// any arena (per [`Self::allocate`]'s policy), the payload is copied,
    /// and the original is released back to its owner. Between those two
    /// critical sections the original block is still live and the owner's
    /// lock is not held; this is sound because a live pointer is operated
    /// on by one thread at a time.
    ///
    /// Returns the new starting address on success; `None` otherwise, in
    /// which case the original allocation is preserved. A `new_size` of
    /// zero releases the allocation and returns `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via
    /// `self`, and no other thread may operate on the same block
    /// concurrently.
    pub unsafe fn resize(
        &self,
        hint: usize,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if new_size == 0 {
            self.release(ptr);
            return None;
        }

        let owner = self.owner_of(ptr)?;
        {
            let mut guard = self.lock_arena(owner);
            // Safety: Upheld by the caller
            if let Some(x) = guard.reallocate(ptr, new_size) {
                return Some(x);
            }
        }

        // Cross-arena relocation. The header read needs no lock: the block
        // belongs to the calling thread and release paths cannot touch it.
        let old_size = Tlsf::<'pool, FLLEN>::size_of_allocation(ptr);
        let new_ptr = self.allocate(hint, new_size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));

        let mut guard = self.lock_arena(owner);
        guard.deallocate(ptr);
        Some(new_ptr)
    }

    /// The payload capacity of the block owning a previously allocated
    /// pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via
    /// `self`.
    #[inline]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        Tlsf::<'pool, FLLEN>::size_of_allocation(ptr)
    }

    /// Aggregate [`Statistics`] over every arena. Arena locks are taken
    /// one at a time, so concurrent callers see a consistent per-arena,
    /// not global, snapshot.
    pub fn statistics(&self) -> Statistics {
        let mut total = Statistics::default();
        for index in 0..self.count {
            let guard = self.lock_arena(index);
            let stats = guard.statistics();
            total.total_free += stats.total_free;
            total.total_used += stats.total_used;
            total.block_count += stats.block_count;
            total.free_count += stats.free_count;
            total.overhead += stats.overhead;
            if stats.largest_free > total.largest_free {
                total.largest_free = stats.largest_free;
            }
        }
        total
    }

    /// Bytes currently allocated across all arenas.
    #[inline]
    pub fn total_used(&self) -> usize {
        self.statistics().total_used
    }

    /// Verify every arena's structural invariants. See [`Tlsf::check`].
    pub fn check(&self) {
        for index in 0..self.count {
            self.lock_arena(index).check();
        }
    }

    /// Restore every arena to its freshly-initialized state, invalidating
    /// all outstanding allocations. Callers must quiesce first.
    pub fn reset(&self) {
        for index in 0..self.count {
            self.lock_arena(index).reset();
        }
    }
}

/// A stable per-thread hint for [`TlsfArenas`] dispatch on hosted
/// systems, derived from the native thread identifier.
#[cfg(any(test, feature = "std"))]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
pub fn thread_hint() -> usize {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as usize
}
