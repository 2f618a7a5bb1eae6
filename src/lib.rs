//! This crate implements a dynamic memory allocator based on the TLSF
//! (Two-Level Segregated Fit) algorithm¹ with boundary-tag block metadata.
//!
//!  - **Every allocation and deallocation completes in a bounded, constant
//!    number of steps**, independent of heap state or pool occupancy. The
//!    allocator is suitable for hard-real-time applications.
//!
//!  - **The memory pool is provided by an application.** Examples of
//!    potential memory pool sources include: a `static` array for global
//!    memory allocation, a memory block allocated by another memory
//!    allocator for arena allocation, or a [`PoolSource`] that maps storage
//!    on demand for a growable pool.
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal
//!    and RTOS-based applications. The `std` feature adds conveniences for
//!    hosted systems.
//!
//!  - **A thread-safe facade** ([`TlsfArenas`]) partitions one pool into
//!    independent per-arena sub-pools with fine-grained locking and a
//!    thread-affinity hash, so threads rarely contend on the hot path.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new
//! dynamic memory allocator for real-time systems," *Proceedings. 16th
//! Euromicro Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania,
//! Italy, 2004, pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Examples
//!
//! ## `Tlsf`: Core API
//!
//! ```rust
//! use tlsf_rt::FixedTlsf;
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//!
//! // `'pool` represents the memory pool's lifetime (`pool` in this case).
//! let mut tlsf: FixedTlsf<'_> = FixedTlsf::INIT;
//! let usable = tlsf.init(&mut pool);
//! assert!(usable > 0);
//!
//! unsafe {
//!     let mut ptr1 = tlsf.allocate(8).unwrap().cast::<u64>();
//!     let mut ptr2 = tlsf.allocate(8).unwrap().cast::<u64>();
//!     *ptr1.as_mut() = 42;
//!     *ptr2.as_mut() = 56;
//!     assert_eq!(*ptr1.as_ref(), 42);
//!     assert_eq!(*ptr2.as_ref(), 56);
//!     tlsf.deallocate(ptr1.cast());
//!     tlsf.deallocate(ptr2.cast());
//! }
//! ```
//!
//! ## `TlsfArenas`: Thread-Safe Facade
//!
//! ```rust
//! use tlsf_rt::ArenaTlsf;
//! use std::mem::MaybeUninit;
//!
//! let mut pool = vec![MaybeUninit::uninit(); 1 << 20];
//! let arenas: ArenaTlsf<'_> = ArenaTlsf::new(&mut pool);
//!
//! let hint = 0; // a stable per-thread integer on real callers
//! let ptr = arenas.allocate(hint, 100).unwrap();
//! unsafe { arenas.release(ptr) };
//! assert_eq!(arenas.total_used(), 0);
//! ```
//!
//! # Details
//!
//! ## Changes from the Original Algorithm
//!
//!  - The end of each memory pool is capped by a sentinel block (a
//!    permanently occupied zero-size header) instead of a normal block
//!    with a last-block-in-pool flag. This simplifies the code a bit and
//!    improves its worst-case performance and code size.
//!
//!  - The per-block overhead is a single machine word. The physical
//!    predecessor is located through a boundary tag that overlaps the tail
//!    of the predecessor's payload and is only valid while the predecessor
//!    is free.
//!
//!  - The size used for splitting and for marking a returned block is the
//!    chosen bin's minimum size rather than the caller's request, so a
//!    block always returns to the bin it was drawn from.
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod arena;
mod flex;
mod init;
mod int;
mod tlsf;
mod utils;
pub use self::{
    arena::{ArenaLock, ArenaTlsf, SpinLock, TlsfArenas},
    flex::*,
    init::*,
    tlsf::{
        FixedTlsf, Statistics, Tlsf, ALIGN, BLOCK_OVERHEAD, BLOCK_SIZE_MIN, FLLEN_DEFAULT, SLLEN,
    },
};

#[cfg(any(test, feature = "std"))]
pub use self::arena::thread_hint;

#[cfg(any(test, feature = "std"))]
extern crate std;
