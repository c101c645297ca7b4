//! percpu_slab: a per-CPU lock-free object cache.
//!
//! The hottest front-end tier of a memory allocator: each logical CPU owns a
//! small LIFO stack of free object pointers per size class, so allocation and
//! deallocation complete with no atomic read-modify-write and no cross-CPU
//! traffic in the common case. The mechanism rests on restartable critical
//! sections — short sequences the kernel aborts and restarts if the thread
//! is preempted or migrated mid-flight — which make a read-modify-write on a
//! per-CPU cell appear atomic with respect to that CPU, without locks. See
//! the kernel's `rseq(2)` interface and the per-CPU cache design described in
//! <https://google.github.io/tcmalloc/design.html>.
//!
//! Layers:
//! - [`percpu`]: the runtime binding (CPU ids, per-CPU compare-and-swap, and
//!   the per-CPU fence), with an rseq backend for Linux x86_64 behind the
//!   `rseq` feature and a portable spinlock-based backend otherwise.
//! - [`slab`]: the cache itself — packed 64-bit headers, the mutator fast
//!   paths, capacity transfer, and the cross-CPU administrative protocol
//!   (drain, shrink-other, whole-region resize).

mod loom_testing;
#[cfg(not(loom))]
mod residency;
#[cfg(not(loom))]
mod util;

pub mod percpu;
#[cfg(not(loom))]
pub mod slab;

pub use percpu::{CpuMode, OverflowHandler, UnderflowHandler};
#[cfg(not(loom))]
pub use slab::{slabs_alloc_size, PerCpuMetadata, PerCpuSlab, Shift, FIXED_SLAB_SHIFT};
