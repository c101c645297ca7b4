//! Per-CPU object cache: LIFO pointer stacks with restartable-sequence
//! mutators and a lock/fence protocol for cross-CPU administration.
//!
//! One contiguous region is split into per-CPU sub-regions of `2^shift`
//! bytes. Each sub-region starts with one packed 64-bit header per size
//! class; the rest holds the slot arrays:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ header[0]   current u16 | end_copy u16 | begin u16 | end u16
//! │ header[1]                                                │
//! │ ...                                                      │
//! │ header[NUM_CLASSES-1]                                    │
//! │ guard slot, slot array for class 0                       │
//! │ guard slot, slot array for class 1                       │
//! │ ...                                                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Push and pop run as restartable critical sections: read the CPU id,
//! locate the header, test a bound, write one slot, and commit with a single
//! 16-bit store to `current`. Administrators (drain, shrink-other, resize,
//! CPU init) cannot join those sequences, so they stop them instead: a
//! 32-bit store sets `begin = 0xffff, end = 0`, which makes both bounds
//! checks fail, and a per-CPU fence waits until every sequence that started
//! before the store has committed or aborted. `current` and `end_copy` keep
//! their real values through the lock so the administrator can account for
//! the stack it just froze.
//!
//! Capacity moves between a CPU and the surrounding allocator tiers through
//! `grow`/`shrink` (on-CPU compare-and-swap) and `shrink_other`/`drain`
//! (cross-CPU, under the lock protocol). The region base and shift live in
//! one packed atomic word so every reader sees a consistent pair across a
//! whole-region resize.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use tracing::Level;

use crate::loom_testing::{AtomicU16, AtomicU32, AtomicU64, AtomicUsize};
use crate::percpu::{self, CpuMode, OverflowHandler, UnderflowHandler};
use crate::residency;


/// Shift value for which the batch operations have an asm fast path.
pub const FIXED_SLAB_SHIFT: u8 = 18;

/// `begin` sentinel of a locked header. Paired with `end = 0` so both the
/// push and the pop bounds check fail.
const LOCKED_BEGIN: u16 = 0xffff;

/// The 32-bit `begin|end` lane written to lock a header:
/// `begin = 0xffff` in the low half, `end = 0` in the high half.
const LOCK_UPDATE: u32 = LOCKED_BEGIN as u32;

const SHIFT_MASK: usize = 0xff;
const SLABS_MASK: usize = !SHIFT_MASK;

// The header lanes and the asm offsets assume little-endian 16-bit fields.
const _: () = assert!(cfg!(target_endian = "little"));

/// Log2 of a sub-region's size in bytes. Kept under 256 so it packs into the
/// low byte of the slabs pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Shift(pub u8);

/// Bytes needed for the whole region.
pub fn slabs_alloc_size(shift: Shift, num_cpus: usize) -> usize {
    num_cpus << shift.0
}

/// Virtual and resident footprint of the slab region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PerCpuMetadata {
    pub virtual_size: usize,
    pub resident_size: usize,
}

/// One (cpu, size class) slab header. All fields are offsets from the
/// sub-region start in 8-byte units; the slot array is `[begin, end)` and
/// the occupied slots are `[begin, current)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Header {
    /// One past the top of the occupied region.
    current: u16,
    /// Shadow of `end`. Updated by grow/shrink, preserved by the lock and
    /// not reset until the final unlock store, so a locked header still
    /// carries its real capacity.
    end_copy: u16,
    /// First valid slot.
    begin: u16,
    /// One past the last allowed slot.
    end: u16,
}

impl Header {
    #[inline]
    fn from_raw(raw: u64) -> Self {
        Self {
            current: raw as u16,
            end_copy: (raw >> 16) as u16,
            begin: (raw >> 32) as u16,
            end: (raw >> 48) as u16,
        }
    }

    #[inline]
    fn to_raw(self) -> u64 {
        (self.current as u64)
            | (self.end_copy as u64) << 16
            | (self.begin as u64) << 32
            | (self.end as u64) << 48
    }

    #[inline]
    fn is_locked(self) -> bool {
        if self.begin == LOCKED_BEGIN {
            debug_assert!(self.end == 0, "begin == 0xffff -> end == 0");
        }
        self.begin == LOCKED_BEGIN
    }
}

/// Per-CPU cache for `NUM_CLASSES` size classes.
///
/// All methods other than [`new`](Self::new) require [`init`](Self::init) to
/// have completed. `init`, `resize_slabs` and `destroy` are serialized by the
/// caller; `init_cpu`, `drain` and `shrink_other` must not overlap on the
/// same CPU (overlap on different CPUs is fine). Push/pop/grow/shrink may
/// run concurrently with everything.
pub struct PerCpuSlab<const NUM_CLASSES: usize> {
    /// Region base in the high bits, shift in the low byte. One atomic word
    /// so readers always extract a consistent pair. Exclusively owns the
    /// region until `resize_slabs`/`destroy` transfers it out.
    slabs_and_shift: AtomicUsize,
    /// 0 = physical CPU ids, 1 = virtual. Fixed at `init`.
    cpu_mode: AtomicU32,
}

// safety: the region is only mutated through per-CPU critical sections and
// the lock/fence protocol above; the packed cell and mode are atomics.
unsafe impl<const N: usize> Sync for PerCpuSlab<N> {}
unsafe impl<const N: usize> Send for PerCpuSlab<N> {}

impl<const NUM_CLASSES: usize> Default for PerCpuSlab<NUM_CLASSES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const NUM_CLASSES: usize> PerCpuSlab<NUM_CLASSES> {
    pub const fn new() -> Self {
        Self {
            slabs_and_shift: AtomicUsize::new(0),
            cpu_mode: AtomicU32::new(0),
        }
    }

    #[inline]
    fn cpu_mode(&self) -> CpuMode {
        if self.cpu_mode.load(Ordering::Relaxed) == 0 {
            CpuMode::Physical
        } else {
            CpuMode::Virtual
        }
    }

    /// Current shift of the slabs. Intended for the thread driving
    /// `resize_slabs`.
    pub fn shift(&self) -> u8 {
        (self.slabs_and_shift.load(Ordering::Relaxed) & SHIFT_MASK) as u8
    }

    /// The CPU id mutators on this thread would commit against.
    #[inline]
    pub fn current_cpu(&self) -> usize {
        percpu::current_cpu(self.cpu_mode())
    }

    #[inline]
    fn slabs_and_shift(&self) -> (*mut u8, Shift) {
        let raw = self.slabs_and_shift.load(Ordering::Relaxed);
        ((raw & SLABS_MASK) as *mut u8, Shift((raw & SHIFT_MASK) as u8))
    }

    #[inline]
    fn cpu_base(slabs: *mut u8, shift: Shift, cpu: usize) -> *mut u8 {
        debug_assert!(!slabs.is_null());
        unsafe { slabs.add(cpu << shift.0) }
    }

    #[inline]
    fn header_cell<'a>(slabs: *mut u8, shift: Shift, cpu: usize, size_class: usize) -> &'a AtomicU64 {
        debug_assert!(size_class < NUM_CLASSES);
        unsafe { &*(Self::cpu_base(slabs, shift, cpu).add(size_class * 8) as *const AtomicU64) }
    }

    #[inline]
    fn slot_ptr(slabs: *mut u8, shift: Shift, cpu: usize, offset: u16) -> *mut *mut u8 {
        unsafe { Self::cpu_base(slabs, shift, cpu).add(offset as usize * 8) as *mut *mut u8 }
    }

    #[inline]
    fn load_header(cell: &AtomicU64) -> Header {
        Header::from_raw(cell.load(Ordering::Relaxed))
    }

    #[inline]
    fn store_header(cell: &AtomicU64, hdr: Header) {
        cell.store(hdr.to_raw(), Ordering::Relaxed);
    }

    /// The only writer of the lock sentinel: a 32-bit store into the
    /// `begin|end` half, leaving `current` and `end_copy` intact.
    #[inline]
    fn lock_header(cell: &AtomicU64) {
        // safety: bytes 4..8 of the 64-bit cell, accessed as a narrower
        // atomic. Mixed-width atomic access to the same cell is exactly what
        // the protocol requires; the mutators' commit semantics make the new
        // bounds visible to any later critical section on the CPU.
        let half = unsafe { &*((cell.as_ptr() as *mut u8).add(4) as *const AtomicU32) };
        half.store(LOCK_UPDATE, Ordering::Relaxed);
    }

    /// Mutator commit store: the low 16-bit `current` lane only.
    #[inline]
    fn store_current(cell: &AtomicU64, current: u16) {
        // safety: low two bytes of the 64-bit cell.
        let lane = unsafe { &*(cell.as_ptr() as *const AtomicU16) };
        lane.store(current, Ordering::Relaxed);
    }

    // ── Mutator fast paths ──────────────────────────────────────────────

    /// Add `item` to the current CPU's slab for `size_class`.
    ///
    /// On overflow (or an aborted critical section) invokes
    /// `overflow_handler` and reports success iff the handler returned a
    /// non-negative value (it absorbed the item).
    ///
    /// # Safety
    ///
    /// The slab must be initialized and `size_class < NUM_CLASSES`. `item`
    /// is stored as an opaque non-null pointer and handed back verbatim by a
    /// later pop/drain/shrink.
    #[inline]
    pub unsafe fn push(
        &self,
        size_class: usize,
        item: NonNull<u8>,
        overflow_handler: OverflowHandler,
        arg: *mut (),
    ) -> bool {
        debug_assert!(size_class < NUM_CLASSES);
        match unsafe { self.push_impl(size_class, item.as_ptr()) } {
            Ok(()) => true,
            Err(cpu) => overflow_handler(cpu, size_class, item.as_ptr(), arg) >= 0,
        }
    }

    /// Remove the most recently pushed item for `size_class` on the current
    /// CPU. On underflow (or abort) returns `underflow_handler`'s result.
    ///
    /// # Safety
    ///
    /// The slab must be initialized and `size_class < NUM_CLASSES`.
    #[inline]
    pub unsafe fn pop(
        &self,
        size_class: usize,
        underflow_handler: UnderflowHandler,
        arg: *mut (),
    ) -> *mut u8 {
        debug_assert!(size_class < NUM_CLASSES);
        match unsafe { self.pop_impl(size_class) } {
            Ok(item) => item,
            Err(cpu) => underflow_handler(cpu, size_class, arg),
        }
    }

    #[cfg(not(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom))))]
    #[inline]
    unsafe fn push_impl(&self, size_class: usize, item: *mut u8) -> Result<(), usize> {
        percpu::emulated::critical(|cpu| {
            // The (slabs, shift) pair is read inside the critical section so
            // it is coherent with the commit check across a resize.
            let (slabs, shift) = self.slabs_and_shift();
            let cell = Self::header_cell(slabs, shift, cpu, size_class);
            let hdr = Self::load_header(cell);
            if hdr.current >= hdr.end {
                return Err(cpu);
            }
            unsafe { Self::slot_ptr(slabs, shift, cpu, hdr.current).write(item) };
            Self::store_current(cell, hdr.current + 1);
            Ok(())
        })
    }

    #[cfg(not(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom))))]
    #[inline]
    unsafe fn pop_impl(&self, size_class: usize) -> Result<*mut u8, usize> {
        percpu::emulated::critical(|cpu| {
            let (slabs, shift) = self.slabs_and_shift();
            let cell = Self::header_cell(slabs, shift, cpu, size_class);
            let hdr = Self::load_header(cell);
            if hdr.current <= hdr.begin {
                return Err(cpu);
            }
            // Speculatively prefetch the item a subsequent pop would return.
            // The self-referential guard slot at begin-1 keeps this valid
            // when we are popping the last item.
            let next = unsafe { Self::slot_ptr(slabs, shift, cpu, hdr.current - 2).read() };
            prefetch(next);
            let item = unsafe { Self::slot_ptr(slabs, shift, cpu, hdr.current - 1).read() };
            Self::store_current(cell, hdr.current - 1);
            Ok(item)
        })
    }

    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    #[inline]
    unsafe fn push_impl(&self, size_class: usize, item: *mut u8) -> Result<(), usize> {
        if unsafe { self.push_rseq(size_class, item) } {
            Ok(())
        } else {
            Err(self.current_cpu())
        }
    }

    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    #[inline]
    unsafe fn pop_impl(&self, size_class: usize) -> Result<*mut u8, usize> {
        match unsafe { self.pop_rseq(size_class) } {
            Some(item) => Ok(item),
            None => Err(self.current_cpu()),
        }
    }

    /// Restartable push: bounds test, slot store, 16-bit commit of
    /// `current`. Returns false on overflow or abort.
    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    #[inline(never)]
    unsafe fn push_rseq(&self, size_class: usize, item: *mut u8) -> bool {
        use crate::percpu::rseq::{cpu_id_offset, RSEQ_CS_OFFSET};
        use std::arch::asm;

        let rseq = crate::percpu::rseq::rseq_ptr()
            .expect("restartable sequences unavailable on this thread")
            .as_ptr();
        let cpu_off = cpu_id_offset(self.cpu_mode()) as u64;
        let overflow: u64;

        unsafe {
            asm!(
                ".pushsection __rseq_cs, \"aw\"",
                ".balign 32",
                "77:",
                ".long 0",
                ".long 0",
                ".quad 3f",
                ".quad (4f - 3f)",
                ".quad 6f",
                ".popsection",

                "lea {tmp}, [rip + 77b]",
                "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

                "3:",
                // Load the packed (slabs, shift) cell; shl takes cl, and the
                // low byte of the packed word is the shift.
                "mov rcx, qword ptr [{sas}]",
                "movzx {base:e}, word ptr [{rseq} + {cpu_off}]",
                "shl {base}, cl",
                "and rcx, -256",
                "add {base}, rcx",
                "movzx {cur:e}, word ptr [{base} + {sc8}]",
                "cmp {cur:x}, word ptr [{base} + {sc8} + 6]",
                "jae 7f",
                "mov qword ptr [{base} + {cur} * 8], {item}",
                "inc {cur:e}",
                "mov word ptr [{base} + {sc8}], {cur:x}",
                "4:",
                "xor {ovfl:e}, {ovfl:e}",
                "jmp 5f",

                "7:",
                "mov {ovfl:e}, 1",
                "jmp 5f",

                ".long 0x53053053",
                "6:",
                "mov {ovfl:e}, 1",

                "5:",
                "mov qword ptr [{rseq} + {rseq_cs_off}], 0",

                rseq = in(reg) rseq,
                sas = in(reg) self.slabs_and_shift.as_ptr(),
                cpu_off = in(reg) cpu_off,
                sc8 = in(reg) (size_class * 8) as u64,
                item = in(reg) item,
                base = out(reg) _,
                cur = out(reg) _,
                tmp = out(reg) _,
                ovfl = out(reg) overflow,
                out("rcx") _,
                rseq_cs_off = const RSEQ_CS_OFFSET,
                options(nostack),
            );
        }

        overflow == 0
    }

    /// Restartable pop with the speculative next-item prefetch. Returns
    /// `None` on underflow or abort.
    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    #[inline(never)]
    unsafe fn pop_rseq(&self, size_class: usize) -> Option<*mut u8> {
        use crate::percpu::rseq::{cpu_id_offset, RSEQ_CS_OFFSET};
        use std::arch::asm;

        let rseq = crate::percpu::rseq::rseq_ptr()
            .expect("restartable sequences unavailable on this thread")
            .as_ptr();
        let cpu_off = cpu_id_offset(self.cpu_mode()) as u64;
        let underflow: u64;
        let result: u64;

        unsafe {
            asm!(
                ".pushsection __rseq_cs, \"aw\"",
                ".balign 32",
                "77:",
                ".long 0",
                ".long 0",
                ".quad 3f",
                ".quad (4f - 3f)",
                ".quad 6f",
                ".popsection",

                "lea {tmp}, [rip + 77b]",
                "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

                "3:",
                "mov rcx, qword ptr [{sas}]",
                "movzx {base:e}, word ptr [{rseq} + {cpu_off}]",
                "shl {base}, cl",
                "and rcx, -256",
                "add {base}, rcx",
                "movzx {cur:e}, word ptr [{base} + {sc8}]",
                "cmp {cur:x}, word ptr [{base} + {sc8} + 4]",
                "jbe 7f",
                // Prefetch what the next pop would return; the guard slot
                // makes this safe for the last item.
                "mov {res}, qword ptr [{base} + {cur} * 8 - 16]",
                "prefetcht0 [{res}]",
                "mov {res}, qword ptr [{base} + {cur} * 8 - 8]",
                "lea {cur:e}, [{cur} - 1]",
                "mov word ptr [{base} + {sc8}], {cur:x}",
                "4:",
                "xor {undf:e}, {undf:e}",
                "jmp 5f",

                "7:",
                "mov {undf:e}, 1",
                "jmp 5f",

                ".long 0x53053053",
                "6:",
                "mov {undf:e}, 1",

                "5:",
                "mov qword ptr [{rseq} + {rseq_cs_off}], 0",

                rseq = in(reg) rseq,
                sas = in(reg) self.slabs_and_shift.as_ptr(),
                cpu_off = in(reg) cpu_off,
                sc8 = in(reg) (size_class * 8) as u64,
                base = out(reg) _,
                cur = out(reg) _,
                tmp = out(reg) _,
                res = out(reg) result,
                undf = out(reg) underflow,
                out("rcx") _,
                rseq_cs_off = const RSEQ_CS_OFFSET,
                options(nostack),
            );
        }

        if underflow == 0 {
            Some(result as *mut u8)
        } else {
            None
        }
    }

    /// Add up to `batch.len()` items from `batch` to the current CPU's slab.
    /// Returns the number added; unconsumed items remain at the start of
    /// `batch`. Items are only rejected when the slab has no room.
    ///
    /// # Safety
    ///
    /// As for [`push`](Self::push); every entry of `batch` must be non-null.
    pub unsafe fn push_batch(&self, size_class: usize, batch: &[*mut u8]) -> usize {
        assert!(!batch.is_empty());

        #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
        {
            let (slabs, shift) = self.slabs_and_shift();
            if shift.0 == FIXED_SLAB_SHIFT {
                return unsafe { self.push_batch_fixed(slabs, size_class, batch) };
            }
        }

        // Portable path: single-item pushes, stopping at the first failure.
        // The no-op handler makes a full slab report failure with no side
        // effects.
        let mut n = 0;
        while n < batch.len() {
            let item = batch[batch.len() - 1 - n];
            debug_assert!(!item.is_null());
            let pushed = unsafe {
                self.push(
                    size_class,
                    NonNull::new_unchecked(item),
                    percpu::noop_overflow,
                    std::ptr::null_mut(),
                )
            };
            if !pushed {
                break;
            }
            n += 1;
        }
        n
    }

    /// Pop up to `batch.len()` items from the current CPU's slab into
    /// `batch`. Returns the number popped.
    ///
    /// # Safety
    ///
    /// As for [`pop`](Self::pop).
    pub unsafe fn pop_batch(&self, size_class: usize, batch: &mut [*mut u8]) -> usize {
        assert!(!batch.is_empty());

        #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
        {
            let (slabs, shift) = self.slabs_and_shift();
            if shift.0 == FIXED_SLAB_SHIFT {
                return unsafe { self.pop_batch_fixed(slabs, size_class, batch) };
            }
        }

        let mut n = 0;
        while n < batch.len() {
            let item =
                unsafe { self.pop(size_class, percpu::noop_underflow, std::ptr::null_mut()) };
            if item.is_null() {
                break;
            }
            batch[n] = item;
            n += 1;
        }
        n
    }

    /// Batch push walking up to `len` slots in one critical section. The
    /// commit is still a single 16-bit store of `current`; slot writes past
    /// the committed `current` are reserved-but-unpopulated and harmless if
    /// the sequence aborts. Retries internally on abort.
    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    #[inline(never)]
    unsafe fn push_batch_fixed(&self, slabs: *mut u8, size_class: usize, batch: &[*mut u8]) -> usize {
        use crate::percpu::rseq::{cpu_id_offset, RSEQ_CS_OFFSET};
        use std::arch::asm;

        let rseq = crate::percpu::rseq::rseq_ptr()
            .expect("restartable sequences unavailable on this thread")
            .as_ptr();
        let cpu_off = cpu_id_offset(self.cpu_mode()) as u64;
        let len = batch.len() as u64;

        loop {
            let remaining: u64;
            let aborted: u64;
            unsafe {
                asm!(
                    ".pushsection __rseq_cs, \"aw\"",
                    ".balign 32",
                    "77:",
                    ".long 0",
                    ".long 0",
                    ".quad 3f",
                    ".quad (4f - 3f)",
                    ".quad 6f",
                    ".popsection",

                    "lea {tmp}, [rip + 77b]",
                    "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

                    "3:",
                    "movzx {base:e}, word ptr [{rseq} + {cpu_off}]",
                    "shl {base}, {fixed_shift}",
                    "add {base}, {slabs}",
                    "movzx {cur:e}, word ptr [{base} + {sc8}]",
                    "movzx {endv:e}, word ptr [{base} + {sc8} + 6]",
                    "mov {i}, {len}",
                    "cmp {cur:e}, {endv:e}",
                    "jae 9f",
                    // Consume from the end of the batch toward the front.
                    "8:",
                    "mov {tmp}, qword ptr [{batch} + {i} * 8 - 8]",
                    "mov qword ptr [{base} + {cur} * 8], {tmp}",
                    "inc {cur:e}",
                    "dec {i}",
                    "jz 9f",
                    "cmp {cur:e}, {endv:e}",
                    "jb 8b",
                    "9:",
                    "mov word ptr [{base} + {sc8}], {cur:x}",
                    "4:",
                    "xor {abrt:e}, {abrt:e}",
                    "jmp 5f",

                    ".long 0x53053053",
                    "6:",
                    "mov {abrt:e}, 1",

                    "5:",
                    "mov qword ptr [{rseq} + {rseq_cs_off}], 0",

                    rseq = in(reg) rseq,
                    cpu_off = in(reg) cpu_off,
                    slabs = in(reg) slabs,
                    sc8 = in(reg) (size_class * 8) as u64,
                    batch = in(reg) batch.as_ptr(),
                    len = in(reg) len,
                    base = out(reg) _,
                    cur = out(reg) _,
                    endv = out(reg) _,
                    tmp = out(reg) _,
                    i = out(reg) remaining,
                    abrt = out(reg) aborted,
                    rseq_cs_off = const RSEQ_CS_OFFSET,
                    fixed_shift = const FIXED_SLAB_SHIFT,
                    options(nostack),
                );
            }
            if aborted == 0 {
                return (len - remaining) as usize;
            }
        }
    }

    /// Batch pop walking up to `len` slots in one critical section.
    #[cfg(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom)))]
    #[inline(never)]
    unsafe fn pop_batch_fixed(
        &self,
        slabs: *mut u8,
        size_class: usize,
        batch: &mut [*mut u8],
    ) -> usize {
        use crate::percpu::rseq::{cpu_id_offset, RSEQ_CS_OFFSET};
        use std::arch::asm;

        let rseq = crate::percpu::rseq::rseq_ptr()
            .expect("restartable sequences unavailable on this thread")
            .as_ptr();
        let cpu_off = cpu_id_offset(self.cpu_mode()) as u64;
        let len = batch.len() as u64;

        loop {
            let popped: u64;
            let aborted: u64;
            unsafe {
                asm!(
                    ".pushsection __rseq_cs, \"aw\"",
                    ".balign 32",
                    "77:",
                    ".long 0",
                    ".long 0",
                    ".quad 3f",
                    ".quad (4f - 3f)",
                    ".quad 6f",
                    ".popsection",

                    "lea {tmp}, [rip + 77b]",
                    "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

                    "3:",
                    "movzx {base:e}, word ptr [{rseq} + {cpu_off}]",
                    "shl {base}, {fixed_shift}",
                    "add {base}, {slabs}",
                    "movzx {cur:e}, word ptr [{base} + {sc8}]",
                    "movzx {begv:e}, word ptr [{base} + {sc8} + 4]",
                    "xor {i:e}, {i:e}",
                    "cmp {cur:e}, {begv:e}",
                    "jbe 9f",
                    "8:",
                    "mov {tmp}, qword ptr [{base} + {cur} * 8 - 8]",
                    "mov qword ptr [{batch} + {i} * 8], {tmp}",
                    "dec {cur:e}",
                    "inc {i}",
                    "cmp {i}, {len}",
                    "jae 9f",
                    "cmp {cur:e}, {begv:e}",
                    "ja 8b",
                    "9:",
                    "mov word ptr [{base} + {sc8}], {cur:x}",
                    "4:",
                    "xor {abrt:e}, {abrt:e}",
                    "jmp 5f",

                    ".long 0x53053053",
                    "6:",
                    "mov {abrt:e}, 1",

                    "5:",
                    "mov qword ptr [{rseq} + {rseq_cs_off}], 0",

                    rseq = in(reg) rseq,
                    cpu_off = in(reg) cpu_off,
                    slabs = in(reg) slabs,
                    sc8 = in(reg) (size_class * 8) as u64,
                    batch = in(reg) batch.as_mut_ptr(),
                    len = in(reg) len,
                    base = out(reg) _,
                    cur = out(reg) _,
                    begv = out(reg) _,
                    tmp = out(reg) _,
                    i = out(reg) popped,
                    abrt = out(reg) aborted,
                    rseq_cs_off = const RSEQ_CS_OFFSET,
                    fixed_shift = const FIXED_SLAB_SHIFT,
                    options(nostack),
                );
            }
            if aborted == 0 {
                return popped as usize;
            }
        }
    }

    // ── Capacity management ─────────────────────────────────────────────

    /// If running on `cpu`, raise the (cpu, size_class) capacity by up to
    /// `len`, bounded by `max_capacity(shift)`. Returns the increment
    /// applied, or 0 when not on `cpu`, when the header is locked, or when
    /// `begin == 0` — the latter means the sub-region was advised away after
    /// a resize and the caller must re-run [`init_cpu`](Self::init_cpu)
    /// before this CPU can hold capacity again.
    ///
    /// `max_capacity` must agree with the capacity callback passed to
    /// [`init`](Self::init).
    pub fn grow(
        &self,
        cpu: usize,
        size_class: usize,
        len: u16,
        max_capacity: impl Fn(u8) -> u16,
    ) -> u16 {
        debug_assert!(len > 0);
        let (slabs, shift) = self.slabs_and_shift();
        let max_cap = max_capacity(shift.0);
        let mode = self.cpu_mode();
        let cell = Self::header_cell(slabs, shift, cpu, size_class);
        loop {
            let old = Self::load_header(cell);
            if old.is_locked() || old.end - old.begin == max_cap || old.begin == 0 {
                return 0;
            }
            let n = len.min(max_cap - (old.end - old.begin));
            let mut hdr = old;
            hdr.end += n;
            hdr.end_copy += n;
            let ret = percpu::percpu_cmpxchg(mode, cpu, cell, old.to_raw(), hdr.to_raw());
            if ret == cpu as isize {
                return n;
            } else if ret >= 0 {
                return 0;
            }
            // Negative: the header changed under us or the sequence was
            // aborted; reload and retry.
        }
    }

    /// If running on `cpu`, lower the (cpu, size_class) capacity by up to
    /// `len`, never below the occupied region. Returns the decrement
    /// applied, or 0 when not on `cpu`.
    pub fn shrink(&self, cpu: usize, size_class: usize, len: u16) -> u16 {
        debug_assert!(len > 0);
        let (slabs, shift) = self.slabs_and_shift();
        let mode = self.cpu_mode();
        let cell = Self::header_cell(slabs, shift, cpu, size_class);
        loop {
            let old = Self::load_header(cell);
            if old.is_locked() || old.current == old.end || old.begin == 0 {
                return 0;
            }
            let n = len.min(old.end - old.current);
            let mut hdr = old;
            hdr.end -= n;
            hdr.end_copy -= n;
            let ret = percpu::percpu_cmpxchg(mode, cpu, cell, old.to_raw(), hdr.to_raw());
            if ret == cpu as isize {
                return n;
            } else if ret >= 0 {
                return 0;
            }
        }
    }

    /// Lower `cpu`'s capacity for `size_class` by up to `len` from any
    /// thread. Unused capacity is reclaimed first; if that is not enough,
    /// up to the difference is popped off the stack and handed to
    /// `shrink_handler` before the capacity is released. Returns the
    /// decrement applied.
    pub fn shrink_other(
        &self,
        cpu: usize,
        size_class: usize,
        len: u16,
        mut shrink_handler: impl FnMut(usize, &[*mut u8]),
    ) -> u16 {
        debug_assert!(len > 0);
        debug_assert!(cpu < percpu::num_cpus());
        let trace_span = tracing::span!(Level::TRACE, "slab::shrink_other", cpu, size_class);
        let _span_enter = trace_span.enter();

        let (slabs, shift) = self.slabs_and_shift();
        let mode = self.cpu_mode();
        let cell = Self::header_cell(slabs, shift, cpu, size_class);

        // Phase 1: collect begin before the lock overwrites it.
        let hdr = Self::load_header(cell);
        assert!(!hdr.is_locked());
        let begin = hdr.begin;

        // Phase 2: stop concurrent mutations for this one header. A racing
        // grow/shrink can overwrite the lock with its 64-bit store, so loop
        // until the locked state sticks across a fence.
        let mut hdr = loop {
            Self::lock_header(cell);
            percpu::fence_cpu(mode, cpu);
            let hdr = Self::load_header(cell);
            if hdr.is_locked() {
                break hdr;
            }
        };

        // Phase 3: pop items if unused capacity alone cannot cover the
        // request.
        //
        // The four fields cannot be restored with one store while pops may
        // still be using the old `current`: a pop reads `current` and
        // `begin` separately, and a single combined store could let it
        // decrement `current` below the new `begin`. So update `current`
        // first under the lock, fence, and only then touch begin/end.
        let unused = hdr.end_copy - hdr.current;
        if unused < len {
            let expected_pop = len - unused;
            let actual_pop = expected_pop.min(hdr.current - begin);
            if actual_pop > 0 {
                let batch = unsafe {
                    std::slice::from_raw_parts(
                        Self::slot_ptr(slabs, shift, cpu, hdr.current - actual_pop)
                            as *const *mut u8,
                        actual_pop as usize,
                    )
                };
                shrink_handler(size_class, batch);
                hdr.current -= actual_pop;
                Self::store_header(cell, hdr);
                percpu::fence_cpu(mode, cpu);
            }
        }

        // Phase 4: release the capacity and unlock.
        hdr.begin = begin;
        let to_shrink = len.min(hdr.end_copy - hdr.current);
        hdr.end_copy -= to_shrink;
        hdr.end = hdr.end_copy;
        Self::store_header(cell, hdr);
        to_shrink
    }

    // ── Administrative operations ───────────────────────────────────────

    /// Reserve the region and publish the packed (base, shift) cell.
    ///
    /// `alloc` must return zero-filled memory aligned to at least the host
    /// physical page size (the region is expected to be reserved lazily and
    /// advised non-resident). `capacity` declares the eventual maximum
    /// capacity per size class; it is only used here to verify that every
    /// sub-region can hold its headers and full slot arrays — a failure is a
    /// configuration bug and panics. All slabs start with capacity 0.
    pub fn init(
        &self,
        alloc: impl Fn(usize, usize) -> *mut u8,
        capacity: impl Fn(usize) -> u16,
        shift: Shift,
    ) {
        let mode = percpu::default_cpu_mode();
        self.cpu_mode.store(
            match mode {
                CpuMode::Physical => 0,
                CpuMode::Virtual => 1,
            },
            Ordering::Relaxed,
        );

        let num_cpus = percpu::num_cpus();
        let slabs = Self::alloc_slabs(&alloc, shift, num_cpus);
        self.slabs_and_shift
            .store(slabs as usize | shift.0 as usize, Ordering::Relaxed);

        // Layout-only walk: verify each sub-region holds the headers plus
        // every slot array at full declared capacity (with the guard slot).
        let mut bytes_used = 0usize;
        for _cpu in 0..num_cpus {
            bytes_used += 8 * NUM_CLASSES;
            let mut offset = NUM_CLASSES; // in 8-byte units from sub-region start
            for size_class in 0..NUM_CLASSES {
                let cap = capacity(size_class) as usize;
                if cap == 0 {
                    continue;
                }
                let num_pointers = cap + 1;
                bytes_used += num_pointers * 8;
                offset += num_pointers;
                let bytes_on_slab = offset * 8;
                assert!(
                    bytes_on_slab <= 1 << shift.0,
                    "per-CPU memory exceeded: have {} need {}",
                    1usize << shift.0,
                    bytes_on_slab,
                );
            }
        }

        let mem_size = slabs_alloc_size(shift, num_cpus);
        if bytes_used * 10 < 9 * mem_size {
            tracing::warn!(
                bytes_used,
                reserved = mem_size,
                "slabs use less than 90% of the reserved bytes"
            );
        }
    }

    fn alloc_slabs(alloc: &impl Fn(usize, usize) -> *mut u8, shift: Shift, num_cpus: usize) -> *mut u8 {
        let size = slabs_alloc_size(shift, num_cpus);
        let slabs = alloc(size, residency::page_size());
        assert!(!slabs.is_null(), "slab region allocation failed");
        assert_eq!(
            slabs as usize & SHIFT_MASK,
            0,
            "slab region under-aligned for pointer packing"
        );
        slabs
    }

    /// Lazily initialize `cpu`'s sub-region. Until this runs for a CPU, only
    /// push/pop (which fail over to their handlers) are valid against it.
    pub fn init_cpu(&self, cpu: usize, capacity: impl Fn(usize) -> u16) {
        assert!(cpu < percpu::num_cpus());
        let (slabs, shift) = self.slabs_and_shift();
        Self::init_cpu_impl(slabs, shift, cpu, self.cpu_mode(), &capacity);
    }

    fn init_cpu_impl(
        slabs: *mut u8,
        shift: Shift,
        cpu: usize,
        mode: CpuMode,
        capacity: &impl Fn(usize) -> u16,
    ) {
        let trace_span = tracing::span!(Level::TRACE, "slab::init_cpu", cpu);
        let _span_enter = trace_span.enter();

        // Phase 1: verify no header is locked. A locked header here means an
        // overlapping drain/resize, which the caller must not allow.
        for size_class in 0..NUM_CLASSES {
            let hdr = Self::load_header(Self::header_cell(slabs, shift, cpu, size_class));
            assert!(!hdr.is_locked());
        }

        // Phase 2: stop concurrent mutations. After this, no value of
        // current satisfies begin < current.
        Self::stop_concurrent_mutations(slabs, shift, cpu, mode);

        // Phase 3: install the prefetch guards and compute each class's
        // begin offset.
        let mut begin = [0u16; NUM_CLASSES];
        let mut elems = unsafe { (Self::cpu_base(slabs, shift, cpu) as *mut *mut u8).add(NUM_CLASSES) };
        for (size_class, begin_slot) in begin.iter_mut().enumerate() {
            let cap = capacity(size_class) as usize;
            if cap > 0 {
                // The pop fast path prefetches the item a subsequent pop
                // would return, which reads the slot below the last valid
                // one. One guard slot pointing to itself keeps that read
                // harmless for a one-item stack.
                unsafe { elems.write(elems as *mut u8) };
                elems = unsafe { elems.add(1) };
            }

            let offset =
                unsafe { elems.offset_from(Self::cpu_base(slabs, shift, cpu) as *mut *mut u8) }
                    as usize;
            assert!(offset <= u16::MAX as usize, "slot offset exceeds 16 bits");
            *begin_slot = offset as u16;

            elems = unsafe { elems.add(cap) };
            let bytes_on_slab =
                unsafe { (elems as *mut u8).offset_from(Self::cpu_base(slabs, shift, cpu)) } as usize;
            assert!(
                bytes_on_slab <= 1 << shift.0,
                "per-CPU memory exceeded: have {} need {}",
                1usize << shift.0,
                bytes_on_slab,
            );
        }

        // Phase 4: store current. No critical section commits while
        // !(begin < current) holds for every class, and the fence makes the
        // new currents visible before the bounds open up.
        for size_class in 0..NUM_CLASSES {
            let cell = Self::header_cell(slabs, shift, cpu, size_class);
            let mut hdr = Self::load_header(cell);
            hdr.current = begin[size_class];
            Self::store_header(cell, hdr);
        }
        percpu::fence_cpu(mode, cpu);

        // Phase 5: unlock with capacity 0 everywhere.
        for size_class in 0..NUM_CLASSES {
            let b = begin[size_class];
            let hdr = Header {
                current: b,
                end_copy: b,
                begin: b,
                end: b,
            };
            Self::store_header(Self::header_cell(slabs, shift, cpu, size_class), hdr);
        }
    }

    /// Lock every header of `cpu` and fence until the locked state sticks.
    /// Grow/shrink race with the lock store using 64-bit CAS writes, so the
    /// store is repeated until a post-fence reload still shows every header
    /// locked.
    fn stop_concurrent_mutations(slabs: *mut u8, shift: Shift, cpu: usize, mode: CpuMode) {
        loop {
            for size_class in 0..NUM_CLASSES {
                Self::lock_header(Self::header_cell(slabs, shift, cpu, size_class));
            }
            percpu::fence_cpu(mode, cpu);
            let done = (0..NUM_CLASSES).all(|size_class| {
                Self::load_header(Self::header_cell(slabs, shift, cpu, size_class)).is_locked()
            });
            if done {
                return;
            }
        }
    }

    /// Invoke `drain_handler` for each size class with the frozen stack
    /// contents. Headers must be locked; `begins` are the pre-lock begin
    /// offsets.
    fn drain_cpu(
        slabs: *mut u8,
        shift: Shift,
        cpu: usize,
        begins: &[u16; NUM_CLASSES],
        drain_handler: &mut impl FnMut(usize, usize, &[*mut u8], usize),
    ) {
        for size_class in 0..NUM_CLASSES {
            let hdr = Self::load_header(Self::header_cell(slabs, shift, cpu, size_class));
            let size = (hdr.current - begins[size_class]) as usize;
            let cap = (hdr.end_copy - begins[size_class]) as usize;
            let batch = unsafe {
                std::slice::from_raw_parts(
                    Self::slot_ptr(slabs, shift, cpu, begins[size_class]) as *const *mut u8,
                    size,
                )
            };
            drain_handler(cpu, size_class, batch, cap);
        }
    }

    /// Remove all items of all classes from `cpu`'s slab, reset every
    /// capacity to zero, and hand each class's batch to `drain_handler` as
    /// `(cpu, size_class, items, previous_capacity)`.
    ///
    /// Concurrent push/pop/grow/shrink on the same CPU are safe; a
    /// concurrent drain/init_cpu/resize for the same CPU is a caller bug.
    pub fn drain(&self, cpu: usize, mut drain_handler: impl FnMut(usize, usize, &[*mut u8], usize)) {
        assert!(cpu < percpu::num_cpus());
        let trace_span = tracing::span!(Level::TRACE, "slab::drain", cpu);
        let _span_enter = trace_span.enter();

        let (slabs, shift) = self.slabs_and_shift();
        let mode = self.cpu_mode();

        // Phase 1: collect the begins; nothing else mutates them.
        let mut begins = [0u16; NUM_CLASSES];
        for size_class in 0..NUM_CLASSES {
            let hdr = Self::load_header(Self::header_cell(slabs, shift, cpu, size_class));
            assert!(!hdr.is_locked());
            begins[size_class] = hdr.begin;
        }

        // Phase 2: stop concurrent mutations.
        Self::stop_concurrent_mutations(slabs, shift, cpu, mode);

        // Phase 3: hand the frozen stacks to the handler.
        Self::drain_cpu(slabs, shift, cpu, &begins, &mut drain_handler);

        // Phase 4: reset current only. Same two-phase dance as shrink_other:
        // a pop still running against the old current must not observe the
        // restored begin first.
        for size_class in 0..NUM_CLASSES {
            let cell = Self::header_cell(slabs, shift, cpu, size_class);
            let mut hdr = Self::load_header(cell);
            hdr.current = begins[size_class];
            Self::store_header(cell, hdr);
        }

        // Phase 5: fence, then unlock with capacity 0.
        percpu::fence_cpu(mode, cpu);
        for size_class in 0..NUM_CLASSES {
            let b = begins[size_class];
            let hdr = Header {
                current: b,
                end_copy: b,
                begin: b,
                end: b,
            };
            Self::store_header(Self::header_cell(slabs, shift, cpu, size_class), hdr);
        }
    }

    /// Move the cache to a region with a new shift. Populated CPUs are
    /// initialized on the new region, locked and fenced on the old one, the
    /// packed cell is swapped, and the old stacks are handed to
    /// `drain_handler` for redistribution.
    ///
    /// Returns the old region and its size; ownership transfers to the
    /// caller, which should advise it away and eventually free it.
    ///
    /// # Safety
    ///
    /// No concurrent `init_cpu`, `shrink_other`, `drain`, or second
    /// `resize_slabs` may run during the call, and the old region must not
    /// be freed before every thread has observed the new cell (the per-CPU
    /// lock+fence phases below are what delays pre-swap mutators).
    pub unsafe fn resize_slabs(
        &self,
        new_shift: Shift,
        alloc: impl Fn(usize, usize) -> *mut u8,
        capacity: impl Fn(usize) -> u16,
        populated: impl Fn(usize) -> bool,
        mut drain_handler: impl FnMut(usize, usize, &[*mut u8], usize),
    ) -> (*mut u8, usize) {

        let trace_span = tracing::span!(Level::TRACE, "slab::resize_slabs", new_shift = new_shift.0);
        let _span_enter = trace_span.enter();

        let num_cpus = percpu::num_cpus();
        let mode = self.cpu_mode();
        let (old_slabs, old_shift) = self.slabs_and_shift();
        assert_ne!(new_shift, old_shift);

        // Phase 1: allocate the new region and lay out every CPU already
        // populated on the old one.
        let new_slabs = Self::alloc_slabs(&alloc, new_shift, num_cpus);
        for cpu in 0..num_cpus {
            if populated(cpu) {
                Self::init_cpu_impl(new_slabs, new_shift, cpu, mode, &capacity);
            }
        }

        // Phase 2: collect begins (stable under the cpu locks) and stop
        // mutations on every populated CPU.
        let mut begins = vec![[0u16; NUM_CLASSES]; num_cpus];
        for cpu in 0..num_cpus {
            if !populated(cpu) {
                continue;
            }
            for size_class in 0..NUM_CLASSES {
                let hdr =
                    Self::load_header(Self::header_cell(old_slabs, old_shift, cpu, size_class));
                assert!(!hdr.is_locked());
                begins[cpu][size_class] = hdr.begin;
            }
            Self::stop_concurrent_mutations(old_slabs, old_shift, cpu, mode);
        }

        // Phase 3: swap the packed cell; from here every new critical
        // section runs against the new region.
        self.slabs_and_shift
            .store(new_slabs as usize | new_shift.0 as usize, Ordering::Relaxed);

        // Phase 4: hand the old stacks back for redistribution.
        for cpu in 0..num_cpus {
            if populated(cpu) {
                Self::drain_cpu(old_slabs, old_shift, cpu, &begins[cpu], &mut drain_handler);
            }
        }

        (old_slabs, slabs_alloc_size(old_shift, num_cpus))
    }

    /// Release the region. Clears the pointer half of the packed cell but
    /// preserves the shift for stale readers.
    ///
    /// # Safety
    ///
    /// No other operation may run concurrently or afterwards (tests only).
    pub unsafe fn destroy(&self, free: impl Fn(*mut u8, usize, usize)) {
        let (slabs, shift) = self.slabs_and_shift();
        free(
            slabs,
            slabs_alloc_size(shift, percpu::num_cpus()),
            residency::page_size(),
        );
        self.slabs_and_shift
            .store(shift.0 as usize, Ordering::Relaxed);
    }

    // ── Accounting ──────────────────────────────────────────────────────

    /// Number of items in the (cpu, size_class) slab; 0 while locked.
    pub fn length(&self, cpu: usize, size_class: usize) -> u16 {
        let (slabs, shift) = self.slabs_and_shift();
        let hdr = Self::load_header(Self::header_cell(slabs, shift, cpu, size_class));
        if hdr.is_locked() {
            0
        } else {
            hdr.current - hdr.begin
        }
    }

    /// Number of items the (cpu, size_class) slab may hold; 0 while locked.
    pub fn capacity(&self, cpu: usize, size_class: usize) -> u16 {
        let (slabs, shift) = self.slabs_and_shift();
        let hdr = Self::load_header(Self::header_cell(slabs, shift, cpu, size_class));
        if hdr.is_locked() {
            0
        } else {
            hdr.end - hdr.begin
        }
    }

    /// Virtual and resident size of the region.
    pub fn metadata_memory_usage(&self) -> PerCpuMetadata {
        let (slabs, shift) = self.slabs_and_shift();
        if slabs.is_null() {
            return PerCpuMetadata {
                virtual_size: 0,
                resident_size: 0,
            };
        }
        let virtual_size = slabs_alloc_size(shift, percpu::num_cpus());
        PerCpuMetadata {
            virtual_size,
            resident_size: residency::resident_bytes(slabs, virtual_size),
        }
    }
}

#[cfg(not(all(feature = "rseq", target_os = "linux", target_arch = "x86_64", not(loom))))]
#[inline]
fn prefetch(ptr: *mut u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_prefetch::<{ std::arch::x86_64::_MM_HINT_T0 }>(ptr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ptr;
    }
}
