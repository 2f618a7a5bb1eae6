//! Growable memory pools with pluggable backing stores
use core::{debug_assert, ptr::NonNull, unimplemented};

use crate::{
    init::Init,
    tlsf::{Tlsf, ALIGN},
    utils::{nonnull_slice_end, nonnull_slice_from_raw_parts, nonnull_slice_len, nonnull_slice_start},
};

/// The trait for backing stores that can provision storage for a
/// [`FlexTlsf`] pool on demand.
///
/// Every method is optional; an implementation that provides none of them
/// behaves as an absent callback, and a pool backed by it simply never
/// grows. A live pool is only ever grown in place
/// ([`Self::realloc_inplace_grow`]) — a moved base would invalidate every
/// outstanding allocation, so a fresh region ([`Self::alloc`]) is
/// requested only while the pool is empty.
///
/// # Safety
///
/// The returned regions must be valid for reads and writes, disjoint from
/// all other allocations, and remain valid until passed to
/// [`Self::dealloc`].
pub unsafe trait PoolSource {
    /// Allocate a backing region of the requested minimum size.
    ///
    /// # Safety
    ///
    /// `min_size` must be a non-zero multiple of [`ALIGN`].
    #[inline]
    unsafe fn alloc(&mut self, min_size: usize) -> Option<NonNull<[u8]>> {
        let _ = min_size;
        None
    }

    /// Attempt to grow the specified region without moving it. Returns the
    /// region's new length (at least `min_new_len`) on success.
    ///
    /// A request that does not actually grow the region (`min_new_len`
    /// equal to the current length) must succeed without side effects.
    ///
    /// # Safety
    ///
    /// `ptr` must be an existing allocation made by this source.
    /// `min_new_len` must be greater than or equal to `ptr`'s length.
    #[inline]
    unsafe fn realloc_inplace_grow(
        &mut self,
        ptr: NonNull<[u8]>,
        min_new_len: usize,
    ) -> Option<usize> {
        let _ = (ptr, min_new_len);
        None
    }

    /// Deallocate a previously allocated region.
    ///
    /// # Safety
    ///
    /// `ptr` must denote an existing allocation made by this source, with
    /// the length it last had.
    #[inline]
    unsafe fn dealloc(&mut self, ptr: NonNull<[u8]>) {
        let _ = ptr;
        unimplemented!("`supports_dealloc` returned `true`, but `dealloc` is not implemented");
    }

    /// Check if this source implements [`Self::realloc_inplace_grow`].
    ///
    /// The returned value must be constant for a particular instance of
    /// `Self`.
    #[inline]
    fn supports_realloc_inplace_grow(&self) -> bool {
        false
    }

    /// Check if this source implements [`Self::dealloc`].
    ///
    /// If this method returns `false`, [`FlexTlsf`] will never release the
    /// backing storage — neither when the pool drains nor on drop.
    ///
    /// The returned value must be constant for a particular instance of
    /// `Self`.
    #[inline]
    fn supports_dealloc(&self) -> bool {
        false
    }

    /// Get the minimum alignment of regions produced by this source.
    /// [`FlexTlsf`] requests extra bytes when this is less than [`ALIGN`].
    #[inline]
    fn min_align(&self) -> usize {
        1
    }
}

/// Wraps [`core::alloc::GlobalAlloc`] to implement the [`PoolSource`]
/// trait.
///
/// This source cannot grow a region in place, so a pool backed by it is
/// sized by its first demand and released when it drains. Use a source
/// with in-place growth (such as [`MmapSource`]) for pools that keep
/// growing while allocations are live.
#[cfg(any(test, feature = "std"))]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
#[derive(Default, Debug, Copy, Clone)]
pub struct GlobalAllocSource<T, const MIN_ALIGN: usize>(pub T);

#[cfg(any(test, feature = "std"))]
impl<T: core::alloc::GlobalAlloc, const MIN_ALIGN: usize> GlobalAllocSource<T, MIN_ALIGN> {
    const ALIGN: usize = if MIN_ALIGN.is_power_of_two() {
        if MIN_ALIGN < ALIGN {
            ALIGN
        } else {
            MIN_ALIGN
        }
    } else {
        panic!("`MIN_ALIGN` is not power of two")
    };
}

#[cfg(any(test, feature = "std"))]
impl<T: Init, const MIN_ALIGN: usize> Init for GlobalAllocSource<T, MIN_ALIGN> {
    const INIT: Self = Self(Init::INIT);
}

#[cfg(any(test, feature = "std"))]
unsafe impl<T: core::alloc::GlobalAlloc, const MIN_ALIGN: usize> PoolSource
    for GlobalAllocSource<T, MIN_ALIGN>
{
    #[inline]
    unsafe fn alloc(&mut self, min_size: usize) -> Option<NonNull<[u8]>> {
        let layout = core::alloc::Layout::from_size_align(min_size, Self::ALIGN)
            .ok()?
            .pad_to_align();
        // Safety: The caller upholds that `min_size` is not zero
        let start = NonNull::new(self.0.alloc(layout))?;
        Some(nonnull_slice_from_raw_parts(start, layout.size()))
    }

    #[inline]
    unsafe fn dealloc(&mut self, ptr: NonNull<[u8]>) {
        // Safety: This layout was previously used for allocation, during
        //         which the layout was checked for validity
        let layout = core::alloc::Layout::from_size_align_unchecked(
            nonnull_slice_len(ptr),
            Self::ALIGN,
        );

        // Safety: `ptr` denotes an existing allocation with layout `layout`
        self.0.dealloc(ptr.as_ptr() as *mut u8, layout);
    }

    fn supports_dealloc(&self) -> bool {
        true
    }

    #[inline]
    fn min_align(&self) -> usize {
        Self::ALIGN
    }
}

/// A [`PoolSource`] backed by anonymous memory mappings.
///
/// On Linux the mapping is extended in place with `MAP_FIXED_NOREPLACE`,
/// so a live pool can keep growing without moving.
#[cfg(unix)]
#[cfg_attr(feature = "doc_cfg", doc(cfg(unix)))]
#[derive(Debug, Copy, Clone)]
pub struct MmapSource {
    /// The memory page size minus 1. Zero until first use.
    page_size_m1: usize,
}

#[cfg(unix)]
impl Init for MmapSource {
    const INIT: Self = Self { page_size_m1: 0 };
}

#[cfg(unix)]
impl Default for MmapSource {
    #[inline]
    fn default() -> Self {
        Self::INIT
    }
}

#[cfg(unix)]
impl MmapSource {
    #[inline]
    fn page_size_m1(&mut self) -> usize {
        if self.page_size_m1 == 0 {
            self.init_page_size();
        }
        self.page_size_m1
    }

    #[cold]
    fn init_page_size(&mut self) {
        // Safety: `sysconf` is safe to call with any argument
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if !page_size.is_power_of_two() || page_size < ALIGN {
            // Such a page size is quite unusual.
            unsafe { libc::abort() };
        }
        self.page_size_m1 = page_size - 1;
    }
}

#[cfg(unix)]
unsafe impl PoolSource for MmapSource {
    #[inline]
    unsafe fn alloc(&mut self, min_size: usize) -> Option<NonNull<[u8]>> {
        let m1 = self.page_size_m1();
        let len = min_size.checked_add(m1)? & !m1;

        let ptr = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_WRITE | libc::PROT_READ,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return None;
        }

        NonNull::new(core::ptr::slice_from_raw_parts_mut(ptr as *mut u8, len))
    }

    // `MAP_FIXED_NOREPLACE` is only supported by Linux 4.17 and later.
    #[cfg(target_os = "linux")]
    #[inline]
    unsafe fn realloc_inplace_grow(
        &mut self,
        ptr: NonNull<[u8]>,
        min_new_len: usize,
    ) -> Option<usize> {
        let m1 = self.page_size_m1();
        let new_len = min_new_len.checked_add(m1)? & !m1;
        let old_len = nonnull_slice_len(ptr);
        if new_len <= old_len {
            return Some(old_len);
        }
        let grow_len = new_len - old_len;

        let old_end = (ptr.as_ptr() as *mut u8).wrapping_add(old_len);

        let growth_start = libc::mmap(
            old_end as _,
            grow_len,
            libc::PROT_WRITE | libc::PROT_READ,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        );

        if growth_start == libc::MAP_FAILED {
            None
        } else if growth_start != old_end as _ {
            // We are on an old Linux kernel, and `MAP_FIXED_NOREPLACE` was
            // not respected.
            libc::munmap(growth_start, grow_len);
            None
        } else {
            Some(new_len)
        }
    }

    #[cfg(target_os = "linux")]
    #[inline]
    fn supports_realloc_inplace_grow(&self) -> bool {
        true
    }

    #[inline]
    unsafe fn dealloc(&mut self, ptr: NonNull<[u8]>) {
        libc::munmap(ptr.as_ptr() as *mut u8 as *mut _, nonnull_slice_len(ptr));
    }

    #[inline]
    fn supports_dealloc(&self) -> bool {
        true
    }

    #[inline]
    fn min_align(&self) -> usize {
        // Return a conservative yet enough-for-optimization constant number
        ALIGN
    }
}

/// The backing allocation currently underlying the pool.
#[derive(Debug, Copy, Clone)]
struct Region(NonNull<[u8]>);

// Safety: `Region` is just an address range
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// A wrapper of [`Tlsf`] that grows its memory pool through a
/// [`PoolSource`] on demand.
///
/// The pool starts empty and is provisioned by the first allocation.
/// While allocations are live the pool only grows in place; when the last
/// allocation is released and the source supports deallocation, the
/// backing storage is returned and the pool reverts to the empty state.
#[derive(Debug)]
pub struct FlexTlsf<Source: PoolSource, const FLLEN: usize> {
    source: Source,
    tlsf: Tlsf<'static, FLLEN>,
    region: Option<Region>,
}

/// Initialization with a [`PoolSource`] provided by [`Default::default`]
impl<Source: PoolSource + Default, const FLLEN: usize> Default for FlexTlsf<Source, FLLEN> {
    #[inline]
    fn default() -> Self {
        Self {
            source: Source::default(),
            tlsf: Tlsf::INIT,
            region: None,
        }
    }
}

/// Initialization with a [`PoolSource`] provided by [`Init::INIT`]
impl<Source: PoolSource + Init, const FLLEN: usize> Init for FlexTlsf<Source, FLLEN> {
    /// An empty pool.
    const INIT: Self = Self {
        source: Source::INIT,
        tlsf: Tlsf::INIT,
        region: None,
    };
}

impl<Source: PoolSource, const FLLEN: usize> FlexTlsf<Source, FLLEN> {
    /// Construct a new `FlexTlsf` object.
    #[inline]
    pub fn new(source: Source) -> Self {
        Self {
            source,
            tlsf: Tlsf::INIT,
            region: None,
        }
    }

    /// Borrow the contained `Source`.
    #[inline]
    pub fn source_ref(&self) -> &Source {
        &self.source
    }

    /// Mutably borrow the contained `Source`.
    ///
    /// # Safety
    ///
    /// The caller must not replace the `Source` with another one or modify
    /// any existing allocations in the `Source`.
    #[inline]
    pub unsafe fn source_mut_unchecked(&mut self) -> &mut Source {
        &mut self.source
    }

    /// Attempt to allocate a block of memory, provisioning or growing the
    /// pool through the source when needed.
    ///
    /// Returns the starting address of the allocated memory block on
    /// success; `None` otherwise.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned(ALIGN, size)
    }

    /// [`Self::allocate`] with an explicit alignment, which must be a
    /// non-zero power of two.
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        if let Some(x) = self.tlsf.allocate_aligned(align, size) {
            return Some(x);
        }

        self.increase_pool_to_contain_allocation(align, size)?;

        self.tlsf.allocate_aligned(align, size).or_else(|| {
            // Not a hard error, but it's still unexpected because
            // `increase_pool_to_contain_allocation` was supposed to make
            // this allocation possible
            debug_assert!(
                false,
                "the allocation failed despite the effort by \
                `increase_pool_to_contain_allocation`"
            );
            None
        })
    }

    /// Increase the amount of pool storage to guarantee the success of the
    /// given allocation. Returns `Some(())` on success.
    #[inline]
    fn increase_pool_to_contain_allocation(&mut self, align: usize, size: usize) -> Option<()> {
        let extra_bytes_well_aligned =
            Tlsf::<'static, FLLEN>::pool_size_to_contain_allocation(align, size)?;

        if self.tlsf.pool_size() != 0 {
            // A live pool may only be extended in place.
            if !self.source.supports_realloc_inplace_grow() {
                return None;
            }
            if self
                .tlsf
                .pool_size()
                .checked_add(extra_bytes_well_aligned)
                .map_or(true, |total| total > Tlsf::<'static, FLLEN>::MAX_POOL_SIZE)
            {
                return None;
            }
            let region = self.region?.0;
            let region_len = nonnull_slice_len(region);
            let min_new_len = region_len.checked_add(extra_bytes_well_aligned)?;

            // Safety: `region` is an allocation we previously obtained
            //         from `self.source`
            let new_len = unsafe { self.source.realloc_inplace_grow(region, min_new_len)? };
            debug_assert!(new_len >= min_new_len);
            let new_region = nonnull_slice_from_raw_parts(nonnull_slice_start(region), new_len);
            self.region = Some(Region(new_region));

            // Hand the grown part to the pool. It begins exactly at the
            // pool's interior end, so adjacency holds by construction.
            // Safety: `pool_size != 0` implies an attached pool
            let pool_end = self.tlsf.pool_base().map(|base| {
                (base.as_ptr() as usize + self.tlsf.pool_size()) as *mut u8
            })?;
            let grown_len = nonnull_slice_end(new_region) as usize - pool_end as usize;
            // Safety: the grown part is owned by us and adjacent to the
            //         pool
            let accepted = unsafe {
                self.tlsf.append_ptr(nonnull_slice_from_raw_parts(
                    NonNull::new_unchecked(pool_end),
                    grown_len,
                ))
            };
            if accepted == 0 {
                // The source granted past the pool cap; the excess stays
                // with the region for later attempts.
                return None;
            }
            debug_assert!(accepted >= extra_bytes_well_aligned);

            return Some(());
        }

        // Provision a fresh region. `source.min_align` indicates the
        // minimum alignment that the created region will satisfy.
        // `extra_bytes_well_aligned` is the pool size that can contain the
        // allocation *if* the pool was well-aligned. If `source.min_align`
        // is not well-aligned enough, we need to allocate extra bytes.
        let extra_bytes = if self.source.min_align() < ALIGN {
            extra_bytes_well_aligned.checked_add(ALIGN)?
        } else {
            extra_bytes_well_aligned
        };

        // Safety: `extra_bytes` is non-zero and a multiple of `ALIGN`
        let region = unsafe { self.source.alloc(extra_bytes)? };

        // Safety: The passed memory block is what we acquired from
        //         `self.source`, so we have the ownership
        let usable = unsafe { self.tlsf.init_ptr(region) };
        if usable == 0 {
            debug_assert!(false, "`pool_size_to_contain_allocation` is an impostor");
            if self.source.supports_dealloc() {
                // Safety: an allocation we just made
                unsafe { self.source.dealloc(region) };
            }
            return None;
        }

        self.region = Some(Region(region));
        Some(())
    }

    /// Deallocate a previously allocated memory block. When the pool
    /// drains completely and the source supports it, the backing storage
    /// is returned to the source.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via
    /// `self`.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // Safety: Upheld by the caller
        self.tlsf.deallocate(ptr);

        if self.source.supports_dealloc() && self.tlsf.is_single_free_block() {
            let _ = self.tlsf.take_pool();
            if let Some(region) = self.region.take() {
                // Safety: an allocation we previously made from the source
                self.source.dealloc(region.0);
            }
        }
    }

    /// Shrink or grow a previously allocated memory block, growing the
    /// pool when relocation needs it.
    ///
    /// Returns the new starting address of the memory block on success;
    /// `None` otherwise, in which case the original allocation is
    /// preserved. A `new_size` of zero releases the allocation and returns
    /// `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via
    /// `self`.
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        // Do this early so that the compiler can de-duplicate the
        // evaluation of `size_of_allocation`, which is done here as well
        // as in `Tlsf::reallocate`.
        let old_size = Tlsf::<'static, FLLEN>::size_of_allocation(ptr);

        // Safety: Upheld by the caller
        if let Some(x) = self.tlsf.reallocate(ptr, new_size) {
            return Some(x);
        }

        // Allocate a whole new memory block. Unlike `Tlsf::reallocate`'s
        // final strategy, this one inserts new pool storage as necessary.
        let new_ptr = self.allocate(new_size)?;

        // Move the existing data into the new location
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));

        // Deallocate the old memory block.
        self.deallocate(ptr);

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
    pub unsafe fn size_of_allocation(ptr: NonNull<u8>) -> usize {
        Tlsf::<'static, FLLEN>::size_of_allocation(ptr)
    }

    /// Aggregate figures over the pool. See [`Tlsf::statistics`].
    #[inline]
    pub fn statistics(&self) -> crate::tlsf::Statistics {
        self.tlsf.statistics()
    }

    /// Verify the pool's structural invariants. See [`Tlsf::check`].
    #[inline]
    pub fn check(&self) {
        self.tlsf.check()
    }
}

impl<Source: PoolSource, const FLLEN: usize> Drop for FlexTlsf<Source, FLLEN> {
    fn drop(&mut self) {
        if self.source.supports_dealloc() {
            if let Some(region) = self.region.take() {
                // Safety: It's an allocation we made from `self.source`
                unsafe { self.source.dealloc(region.0) };
            }
        }
    }
}
