//! Linux x86_64 backend: kernel restartable sequences.
//!
//! Each thread registers a private `struct rseq` area with the kernel. While
//! a critical section is in flight the thread publishes a descriptor through
//! `rseq_cs`; if the thread is preempted or migrated before the commit
//! instruction, the kernel redirects it to the abort address instead of
//! resuming mid-sequence. The fence is `membarrier(2)`'s rseq command, which
//! interrupts the target CPU and thereby aborts any sequence in flight there.
//!
//! See the `rseq(2)` / `membarrier(2)` man pages for the ABI contract.

use std::arch::asm;
use std::cell::Cell;
use std::ptr::NonNull;

use crate::loom_testing::AtomicU64;

use super::CpuMode;

/// Abort-handler signature the kernel checks before honoring `abort_ip`.
pub const RSEQ_SIGNATURE: u32 = 0x53053053;

const RSEQ_FLAG_UNREGISTER: libc::c_int = 1;

/// Byte offset of `cpu_id` within [`Rseq`].
pub const RSEQ_CPU_ID_OFFSET: u32 = 4;
/// Byte offset of `rseq_cs` within [`Rseq`].
pub const RSEQ_CS_OFFSET: u32 = 8;
/// Byte offset of `mm_cid` within [`Rseq`].
pub const RSEQ_MM_CID_OFFSET: u32 = 24;

const MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ: libc::c_int = 1 << 7;
const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ: libc::c_int = 1 << 8;
const MEMBARRIER_CMD_FLAG_CPU: libc::c_uint = 1;

/// The kernel's `struct rseq` (uapi layout, 32 bytes).
#[repr(C, align(32))]
pub struct Rseq {
    pub cpu_id_start: u32,
    pub cpu_id: u32,
    pub rseq_cs: u64,
    pub flags: u32,
    pub node_id: u32,
    pub mm_cid: u32,
    _pad: u32,
}

const _: () = assert!(std::mem::size_of::<Rseq>() == 32);

/// Per-thread registration handle.
///
/// The C library usually registers an rseq area for every thread it creates;
/// when it has (advertised through the `__rseq_offset`/`__rseq_size` dynamic
/// symbols), that area is adopted rather than fighting the kernel's
/// one-registration-per-thread rule. Otherwise a private area is registered:
/// boxed so its address stays stable for the thread's lifetime, and
/// unregistered in Drop so the kernel stops writing into it before the box
/// is freed.
enum RseqLocal {
    Adopted(NonNull<Rseq>),
    Owned(Box<Rseq>, Cell<bool>),
    Unavailable,
}

/// `__rseq_offset` (relative to the thread pointer) when the C library
/// registered an rseq area, looked up once. An advertised `__rseq_size` of 0
/// means rseq was disabled.
fn libc_rseq_area() -> Option<isize> {
    use std::sync::OnceLock;
    static AREA: OnceLock<Option<isize>> = OnceLock::new();
    *AREA.get_or_init(|| unsafe {
        let off = libc::dlsym(libc::RTLD_DEFAULT, c"__rseq_offset".as_ptr());
        let size = libc::dlsym(libc::RTLD_DEFAULT, c"__rseq_size".as_ptr());
        if off.is_null() || size.is_null() {
            return None;
        }
        let size = *(size as *const u32);
        if size == 0 {
            return None;
        }
        Some(*(off as *const isize))
    })
}

/// The architectural thread pointer (the base `__rseq_offset` is relative
/// to).
#[inline]
fn thread_pointer() -> *mut u8 {
    let tp: *mut u8;
    unsafe {
        // The TCB head at fs:0 holds the thread pointer itself.
        std::arch::asm!("mov {tp}, qword ptr fs:[0]", tp = out(reg) tp, options(nostack, readonly));
    }
    tp
}

impl RseqLocal {
    fn new() -> Self {
        if let Some(offset) = libc_rseq_area() {
            let area = unsafe { thread_pointer().offset(offset) } as *mut Rseq;
            return Self::Adopted(NonNull::new(area).unwrap());
        }

        let mut area = Box::new(Rseq {
            cpu_id_start: 0,
            cpu_id: u32::MAX,
            rseq_cs: 0,
            flags: 0,
            node_id: 0,
            mm_cid: 0,
            _pad: 0,
        });
        let rc = unsafe {
            libc::syscall(
                libc::SYS_rseq,
                &mut *area as *mut Rseq,
                std::mem::size_of::<Rseq>() as u32,
                0i32,
                RSEQ_SIGNATURE,
            )
        };
        if rc == 0 {
            Self::Owned(area, Cell::new(true))
        } else {
            Self::Unavailable
        }
    }

    fn ptr(&self) -> Option<NonNull<Rseq>> {
        match self {
            Self::Adopted(p) => Some(*p),
            Self::Owned(area, registered) if registered.get() => {
                NonNull::new(&**area as *const Rseq as *mut Rseq)
            }
            _ => None,
        }
    }
}

impl Drop for RseqLocal {
    fn drop(&mut self) {
        if let Self::Owned(area, registered) = self {
            if registered.get() {
                unsafe {
                    libc::syscall(
                        libc::SYS_rseq,
                        &mut **area as *mut Rseq,
                        std::mem::size_of::<Rseq>() as u32,
                        RSEQ_FLAG_UNREGISTER,
                        RSEQ_SIGNATURE,
                    );
                }
                registered.set(false);
            }
        }
    }
}

thread_local! {
    static RSEQ: RseqLocal = RseqLocal::new();
}

/// The calling thread's registered rseq area, or `None` when neither the C
/// library nor a private registration could provide one (pre-4.18 kernel,
/// or rseq disabled).
#[inline]
pub fn rseq_ptr() -> Option<NonNull<Rseq>> {
    RSEQ.with(|r| r.ptr())
}

/// Whether the fast paths may run on this thread.
#[inline]
pub fn registered() -> bool {
    rseq_ptr().is_some()
}

fn require_rseq() -> *mut Rseq {
    match rseq_ptr() {
        Some(p) => p.as_ptr(),
        None => panic!("restartable sequences unavailable on this thread"),
    }
}

/// Byte offset of the CPU-id field selected by `mode`.
#[inline]
pub fn cpu_id_offset(mode: CpuMode) -> u32 {
    match mode {
        CpuMode::Physical => RSEQ_CPU_ID_OFFSET,
        CpuMode::Virtual => RSEQ_MM_CID_OFFSET,
    }
}

#[inline]
pub fn current_cpu(mode: CpuMode) -> usize {
    if let Some(area) = rseq_ptr() {
        let area = area.as_ptr();
        let cpu = match mode {
            CpuMode::Physical => unsafe { std::ptr::read_volatile(&(*area).cpu_id as *const u32) },
            CpuMode::Virtual => unsafe { std::ptr::read_volatile(&(*area).mm_cid as *const u32) },
        };
        if (cpu as i32) >= 0 {
            return cpu as usize;
        }
    }
    // Registration failed or the field is not populated yet.
    match mode {
        CpuMode::Physical => {
            let cpu = unsafe { libc::sched_getcpu() };
            assert!(cpu >= 0, "sched_getcpu failed");
            cpu as usize
        }
        CpuMode::Virtual => panic!("virtual CPU ids unavailable on this thread"),
    }
}

/// Compare-and-swap `cell` as a restartable sequence pinned to `target_cpu`.
///
/// Returns the CPU the sequence observed: `target_cpu` on committed success,
/// another id when the thread was elsewhere (no store), `-1` on value
/// mismatch, `-2` on abort.
pub fn percpu_cmpxchg(
    mode: CpuMode,
    target_cpu: usize,
    cell: &AtomicU64,
    old: u64,
    new: u64,
) -> isize {
    let rseq = require_rseq();
    let cpu_off = cpu_id_offset(mode) as u64;
    let p = cell.as_ptr();
    let ret: i64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",                 // version
            ".long 0",                 // flags
            ".quad 3f",                // start_ip
            ".quad (4f - 3f)",         // post_commit_offset
            ".quad 6f",                // abort_ip
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            "3:",
            "movsxd {ret}, dword ptr [{rseq} + {cpu_off}]",
            "cmp {ret:e}, {target:e}",
            "jne 5f",
            "mov {tmp}, qword ptr [{p}]",
            "cmp {tmp}, {old}",
            "jne 7f",
            "mov qword ptr [{p}], {new}",   // commit
            "4:",
            "jmp 5f",

            // value mismatch
            "7:",
            "mov {ret:e}, -1",
            "movsxd {ret}, {ret:e}",
            "jmp 5f",

            // abort handler (signature word precedes the landing pad)
            ".long 0x53053053",
            "6:",
            "mov {ret:e}, -2",
            "movsxd {ret}, {ret:e}",

            "5:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",

            rseq = in(reg) rseq,
            cpu_off = in(reg) cpu_off,
            target = in(reg) target_cpu as u64,
            p = in(reg) p,
            old = in(reg) old,
            new = in(reg) new,
            tmp = out(reg) _,
            ret = out(reg) ret,
            rseq_cs_off = const RSEQ_CS_OFFSET,
            options(nostack),
        );
    }

    ret as isize
}

fn membarrier_registered() -> bool {
    use std::sync::OnceLock;
    static REGISTERED: OnceLock<bool> = OnceLock::new();
    *REGISTERED.get_or_init(|| {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_membarrier,
                MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ,
                0u32,
                0i32,
            )
        };
        rc == 0
    })
}

/// Interrupt `cpu` so any sequence in flight there aborts before this call
/// returns.
pub fn fence_cpu(mode: CpuMode, cpu: usize) {
    assert!(
        membarrier_registered(),
        "membarrier rseq command unavailable (kernel < 5.10?)"
    );
    let rc = match mode {
        CpuMode::Physical => unsafe {
            libc::syscall(
                libc::SYS_membarrier,
                MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ,
                MEMBARRIER_CMD_FLAG_CPU,
                cpu as libc::c_int,
            )
        },
        // A virtual id does not name a physical CPU the kernel could target;
        // interrupt every CPU running this process instead.
        CpuMode::Virtual => unsafe {
            libc::syscall(
                libc::SYS_membarrier,
                MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ,
                0u32,
                0i32,
            )
        },
    };
    assert_eq!(rc, 0, "membarrier fence failed for cpu {cpu}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_populates_cpu_id() {
        if !registered() {
            // Kernel without rseq, or libc owns the registration.
            return;
        }
        let cpu = current_cpu(CpuMode::Physical);
        assert!(cpu < crate::percpu::num_cpus());
    }

    #[test]
    fn cmpxchg_on_current_cpu() {
        if !registered() {
            return;
        }
        let cell = AtomicU64::new(41);
        loop {
            let cpu = current_cpu(CpuMode::Physical);
            let ret = percpu_cmpxchg(CpuMode::Physical, cpu, &cell, 41, 42);
            if ret == cpu as isize {
                break;
            }
            // Migrated between the id read and the sequence, or aborted.
            assert!(ret >= -2);
        }
        assert_eq!(cell.load(std::sync::atomic::Ordering::Relaxed), 42);
    }
}
