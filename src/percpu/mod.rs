//! Restartable-critical-section runtime binding.
//!
//! The slab's concurrency protocol needs three primitives from the host:
//! the current logical CPU id, a compare-and-swap that only commits while the
//! calling thread stays on a given CPU, and a fence that waits until every
//! critical section in flight on a given CPU has committed or aborted.
//!
//! Two backends provide them:
//!
//! * [`rseq`] (feature `rseq`, Linux x86_64): the kernel's restartable
//!   sequences, with `membarrier(2)` supplying the fence. Mutator critical
//!   sections are inline asm that the kernel aborts on preemption/migration.
//! * [`emulated`] (default): per-CPU spinlocks plus process-assigned virtual
//!   CPU ids. A critical section holds its CPU's lock, which preserves the
//!   single-writer-per-CPU contract; the fence acquires and releases the
//!   lock, so it returns only once in-flight sections have finished and its
//!   release edge publishes the caller's prior writes to later sections.

pub mod emulated;
#[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
pub mod rseq;

#[cfg(not(loom))]
use crate::loom_testing::AtomicU64;

/// Thread-local CPU id sentinel: not yet registered with the runtime.
pub const CPU_ID_UNINITIALIZED: i32 = -1;

/// Which per-thread id field the runtime reads.
///
/// Fixed process-wide when the slab is initialized; immutable afterwards.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CpuMode {
    /// The kernel's physical CPU id.
    Physical,
    /// A per-process virtual CPU id (the kernel's mm concurrency id under
    /// the rseq backend, the process-assigned id under the emulated one).
    Virtual,
}

/// The CPU-id mode the runtime selects for this build.
pub fn default_cpu_mode() -> CpuMode {
    if cfg!(feature = "virtual-cpus") {
        CpuMode::Virtual
    } else {
        CpuMode::Physical
    }
}

/// Number of logical CPUs the slab provisions for. Cached once so region
/// indexing stays stable for the lifetime of the process.
pub fn num_cpus() -> usize {
    use std::sync::OnceLock;
    static NUM_CPUS: OnceLock<usize> = OnceLock::new();
    *NUM_CPUS.get_or_init(|| {
        #[cfg(target_os = "linux")]
        {
            // Configured, not online: physical ids can name any configured CPU.
            let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
            if n > 0 {
                return n as usize;
            }
        }
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    })
}

/// Current logical CPU id, registering the thread with the runtime on first
/// use (the uninitialized sentinel triggers registration).
#[cfg(not(loom))]
#[inline]
pub fn current_cpu(mode: CpuMode) -> usize {
    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    {
        rseq::current_cpu(mode)
    }
    #[cfg(not(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom))))]
    {
        let _ = mode;
        emulated::current_cpu()
    }
}

/// Compare-and-swap the 64-bit cell at `cell`, observable only if the calling
/// thread stayed on `target_cpu` throughout.
///
/// Returns the CPU the operation executed on: `target_cpu` means the swap
/// committed; any other non-negative value means the thread was elsewhere and
/// nothing was stored; a negative value means the value compare failed or the
/// sequence was aborted, and the caller should reload and retry.
#[cfg(not(loom))]
#[inline]
pub fn percpu_cmpxchg(
    mode: CpuMode,
    target_cpu: usize,
    cell: &AtomicU64,
    old: u64,
    new: u64,
) -> isize {
    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    {
        rseq::percpu_cmpxchg(mode, target_cpu, cell, old, new)
    }
    #[cfg(not(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom))))]
    {
        let _ = mode;
        emulated::percpu_cmpxchg(target_cpu, cell, old, new)
    }
}

/// Block until every critical section on `cpu` that started before this call
/// has committed or been aborted.
#[cfg(not(loom))]
pub fn fence_cpu(mode: CpuMode, cpu: usize) {
    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    {
        rseq::fence_cpu(mode, cpu)
    }
    #[cfg(not(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom))))]
    {
        let _ = mode;
        emulated::fence_cpu(cpu)
    }
}

/// [`fence_cpu`] for every provisioned CPU.
#[cfg(not(loom))]
pub fn fence_all_cpus(mode: CpuMode) {
    for cpu in 0..num_cpus() {
        fence_cpu(mode, cpu);
    }
}

/// Whether the asm fast paths are compiled in and usable on this thread.
#[cfg(not(loom))]
#[inline]
pub fn is_fast() -> bool {
    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    {
        rseq::registered()
    }
    #[cfg(not(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom))))]
    {
        false
    }
}

/// Called when a push finds no room: `>= 0` means the handler absorbed the
/// item and the push counts as succeeded, `< 0` means the push failed.
pub type OverflowHandler = fn(cpu: usize, size_class: usize, item: *mut u8, arg: *mut ()) -> isize;

/// Called when a pop finds no item; its return value (possibly null) is the
/// pop's result.
pub type UnderflowHandler = fn(cpu: usize, size_class: usize, arg: *mut ()) -> *mut u8;

/// Overflow handler that absorbs nothing; the batch loops use it so each
/// failed step reports failure without side effects.
pub fn noop_overflow(_cpu: usize, _size_class: usize, _item: *mut u8, _arg: *mut ()) -> isize {
    -1
}

/// Underflow handler that produces nothing.
pub fn noop_underflow(_cpu: usize, _size_class: usize, _arg: *mut ()) -> *mut u8 {
    std::ptr::null_mut()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn num_cpus_is_stable_and_positive() {
        let n = num_cpus();
        assert!(n >= 1);
        assert_eq!(n, num_cpus());
    }

    #[test]
    fn current_cpu_is_stable_and_in_range() {
        let mode = default_cpu_mode();
        let cpu = current_cpu(mode);
        assert!(cpu < num_cpus());
        assert_eq!(cpu, current_cpu(mode));
    }

    #[test]
    fn other_threads_get_in_range_ids() {
        let mode = default_cpu_mode();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(move || {
                    let cpu = current_cpu(mode);
                    assert!(cpu < num_cpus());
                    assert_eq!(cpu, current_cpu(mode));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn fence_returns() {
        let mode = default_cpu_mode();
        // Make sure this thread is registered first.
        let _ = current_cpu(mode);
        fence_all_cpus(mode);
    }
}
