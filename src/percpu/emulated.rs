//! Portable backend: per-CPU spinlocks and process-assigned virtual CPU ids.
//!
//! Without kernel restartable sequences, a mutator critical section runs
//! under a spinlock owned by the thread's CPU. Threads never migrate between
//! the virtual ids assigned here, so a critical section can never abort; the
//! lock alone preserves the single-writer-per-CPU contract. A fence is an
//! acquire/release pass over the CPU's lock: it cannot return while a
//! critical section is in flight, and its release edge makes the fencing
//! thread's earlier header writes visible to every later critical section.

use std::cell::Cell;

use crate::loom_testing::*;

use super::CPU_ID_UNINITIALIZED;

/// One CPU's critical-section lock.
struct CpuLock {
    locked: AtomicBool,
}

impl CpuLock {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn lock(&self) {
        use std::sync::atomic::Ordering;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                spin_hint();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        use std::sync::atomic::Ordering;
        self.locked.store(false, Ordering::Release);
    }
}

/// Critical-section locks for every provisioned CPU.
pub struct LockTable {
    locks: Box<[CpuLock]>,
}

impl LockTable {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            locks: (0..num_cpus).map(|_| CpuLock::new()).collect(),
        }
    }

    /// Run `f` as a critical section on `cpu`.
    #[inline]
    pub fn critical<R>(&self, cpu: usize, f: impl FnOnce() -> R) -> R {
        self.locks[cpu].lock();
        let r = f();
        self.locks[cpu].unlock();
        r
    }

    /// Wait for any in-flight critical section on `cpu`, publishing the
    /// caller's prior writes to later sections on that CPU.
    pub fn fence(&self, cpu: usize) {
        self.locks[cpu].lock();
        self.locks[cpu].unlock();
    }
}

#[cfg(not(loom))]
fn table() -> &'static LockTable {
    use std::sync::OnceLock;
    static TABLE: OnceLock<LockTable> = OnceLock::new();
    TABLE.get_or_init(|| LockTable::new(super::num_cpus()))
}

// The assignment counter is deliberately a plain std atomic: it only hands
// out ids and is not part of the modeled protocol.
static NEXT_VCPU: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

thread_local! {
    static VCPU: Cell<i32> = const { Cell::new(CPU_ID_UNINITIALIZED) };
}

/// This thread's virtual CPU id, assigned round-robin on first use.
#[inline]
pub fn current_cpu() -> usize {
    VCPU.with(|cell| {
        let id = cell.get();
        if id >= 0 {
            id as usize
        } else {
            register_current_thread(cell)
        }
    })
}

#[cold]
fn register_current_thread(cell: &Cell<i32>) -> usize {
    use std::sync::atomic::Ordering;
    let id = NEXT_VCPU.fetch_add(1, Ordering::Relaxed) % super::num_cpus();
    cell.set(id as i32);
    id
}

#[cfg(not(loom))]
#[inline]
pub fn critical<R>(f: impl FnOnce(usize) -> R) -> R {
    let cpu = current_cpu();
    table().critical(cpu, || f(cpu))
}

#[cfg(not(loom))]
#[inline]
pub fn percpu_cmpxchg(target_cpu: usize, cell: &AtomicU64, old: u64, new: u64) -> isize {
    use std::sync::atomic::Ordering;
    let cpu = current_cpu();
    if cpu != target_cpu {
        return cpu as isize;
    }
    table().critical(cpu, || {
        // The lock serializes this against the other critical sections on
        // `cpu`, but an administrator's lock write is a plain store that
        // bypasses the lock; a real compare-exchange is required so that
        // store cannot land between a separate load and store here.
        match cell.compare_exchange(old, new, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => cpu as isize,
            Err(_) => -1,
        }
    })
}

#[cfg(not(loom))]
pub fn fence_cpu(cpu: usize) {
    table().fence(cpu);
}
