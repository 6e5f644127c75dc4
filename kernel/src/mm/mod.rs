//! Physical and virtual page management.
//!
//! Boot-time RAM (minus the low megabyte and the kernel's page tables)
//! is split evenly into a kernel and a user physical pool, each tracked
//! by a bitmap at a fixed virtual base. A separate bitmap pool hands out
//! kernel-heap virtual pages; user tasks carry their own virtual pool in
//! the TCB. `malloc_page` ties the three together: reserve virtual
//! pages, grab physical frames one at a time, wire them up in the page
//! tables, and unwind everything if any step runs dry.

pub mod heap;
pub mod page_table;

use core::cell::UnsafeCell;

use crate::bitmap::Bitmap;
use crate::error::{KernelError, KernelResult, PoolKind};
use crate::sync::Lock;

/// Size of a page frame.
pub const PAGE_SIZE: usize = 4096;

/// Kernel virtual base: physical memory is mapped at +3 GiB.
pub const KERNEL_BASE: usize = 0xc000_0000;

/// Fixed home of the pool bitmaps (kernel, then user, then kernel-vm).
/// One page of bitmap covers 128 MiB, and four pages are reserved, so
/// the compile-time ceiling is 512 MiB of managed RAM.
pub const MEM_BITMAP_BASE: usize = 0xc009_a000;

/// First virtual page of the kernel heap.
pub const K_HEAP_START: usize = 0xc010_0000;

/// The page the loader reserved for the boot thread's TCB.
pub const MAIN_TCB_PAGE: usize = 0xc009_e000;
/// Initial stack pointer the loader leaves us with.
pub const BOOT_ESP: usize = 0xc009_f000;

/// Where the loader records total RAM in bytes (physical 0x0B00).
pub const TOTAL_MEM_BYTES_VADDR: usize = KERNEL_BASE + 0x0b00;
/// BIOS drive-count byte (physical 0x0475).
pub const DRIVE_COUNT_VADDR: usize = KERNEL_BASE + 0x0475;

/// Physical address of the kernel page directory set up by the loader.
pub const KERNEL_PGDIR_PHYS: usize = 0x0010_0000;

/// Low memory the kernel owns outright: the first megabyte plus the 256
/// page-table frames behind the directory.
const RESERVED_LOW_BYTES: usize = 0x10_0000 + 256 * PAGE_SIZE;

/// First virtual address handed to user programs.
pub const USER_VADDR_START: usize = 0x0804_8000;

/// Top of a user task's level-3 stack: the page just below kernel space.
pub const USER_STACK_TOP: usize = KERNEL_BASE - PAGE_SIZE;

/// Which pool an allocation draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFlag {
    Kernel,
    User,
}

impl PoolFlag {
    fn kind(self) -> PoolKind {
        match self {
            PoolFlag::Kernel => PoolKind::Kernel,
            PoolFlag::User => PoolKind::User,
        }
    }
}

// ---------------------------------------------------------------------------
// Virtual address pool
// ---------------------------------------------------------------------------

/// A run of virtual pages tracked by a bitmap. The kernel instance is
/// global (wrapped in [`LockedVirtPool`]); each user task embeds its own
/// in the TCB, where the owning task is the only toucher.
pub struct VirtPool {
    bm: Bitmap,
    vaddr_start: usize,
}

impl VirtPool {
    pub const fn empty() -> Self {
        Self {
            bm: Bitmap::empty(),
            vaddr_start: 0,
        }
    }

    /// Point the pool at its bitmap storage.
    ///
    /// # Safety
    ///
    /// Same storage contract as [`Bitmap::from_raw`].
    pub unsafe fn init(&mut self, bits: *mut u8, len: usize, vaddr_start: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.bm.reset(bits, len) };
        self.vaddr_start = vaddr_start;
    }

    pub fn start(&self) -> usize {
        self.vaddr_start
    }

    /// Reserve `pg_cnt` consecutive virtual pages.
    pub fn reserve(&mut self, pg_cnt: usize) -> Option<usize> {
        let bit = self.bm.alloc(pg_cnt)?;
        for k in 0..pg_cnt {
            self.bm.set(bit + k, true);
        }
        Some(self.vaddr_start + bit * PAGE_SIZE)
    }

    /// Return `pg_cnt` pages starting at `vaddr` to the pool.
    pub fn release(&mut self, vaddr: usize, pg_cnt: usize) {
        let bit = self.bit_index(vaddr);
        for k in 0..pg_cnt {
            debug_assert!(self.bm.get(bit + k), "double free of virtual page");
            self.bm.set(bit + k, false);
        }
    }

    /// Claim (or clear) the single page at `vaddr`.
    pub fn mark(&mut self, vaddr: usize, used: bool) {
        let bit = self.bit_index(vaddr);
        if used {
            debug_assert!(!self.bm.get(bit), "virtual page already reserved");
        }
        self.bm.set(bit, used);
    }

    /// Whether the page at `vaddr` is currently reserved.
    pub fn is_reserved(&self, vaddr: usize) -> bool {
        self.bm.get(self.bit_index(vaddr))
    }

    fn bit_index(&self, vaddr: usize) -> usize {
        debug_assert!(vaddr >= self.vaddr_start);
        debug_assert_eq!(vaddr % PAGE_SIZE, 0);
        (vaddr - self.vaddr_start) / PAGE_SIZE
    }
}

/// The kernel's virtual pool behind its mutex.
pub struct LockedVirtPool {
    lock: Lock,
    inner: UnsafeCell<VirtPool>,
}

// SAFETY: all access goes through `with`, which holds the lock.
unsafe impl Send for LockedVirtPool {}
// SAFETY: see the Send rationale.
unsafe impl Sync for LockedVirtPool {}

impl LockedVirtPool {
    pub const fn new() -> Self {
        Self {
            lock: Lock::new(),
            inner: UnsafeCell::new(VirtPool::empty()),
        }
    }

    /// Run `f` with exclusive access to the pool.
    pub fn with<R>(&self, f: impl FnOnce(&mut VirtPool) -> R) -> R {
        self.lock.acquire();
        // SAFETY: the reentrant lock serializes pool access.
        let ret = f(unsafe { &mut *self.inner.get() });
        self.lock.release();
        ret
    }
}

// ---------------------------------------------------------------------------
// Physical memory pool
// ---------------------------------------------------------------------------

struct PhysInner {
    bm: Bitmap,
    phy_start: usize,
    size: usize,
}

/// A bitmap-tracked range of physical frames behind a mutex.
pub struct PhysPool {
    kind: PoolKind,
    lock: Lock,
    inner: UnsafeCell<PhysInner>,
}

// SAFETY: all access goes through the pool lock.
unsafe impl Send for PhysPool {}
// SAFETY: see the Send rationale.
unsafe impl Sync for PhysPool {}

impl PhysPool {
    pub const fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            lock: Lock::new(),
            inner: UnsafeCell::new(PhysInner {
                bm: Bitmap::empty(),
                phy_start: 0,
                size: 0,
            }),
        }
    }

    /// Point the pool at its bitmap storage and physical range.
    ///
    /// # Safety
    ///
    /// Same storage contract as [`Bitmap::from_raw`]; `phy_start`/`size`
    /// must describe frames this pool exclusively owns.
    pub unsafe fn init(&self, bits: *mut u8, len: usize, phy_start: usize, size: usize) {
        self.lock.acquire();
        // SAFETY: lock held; storage contract forwarded.
        unsafe {
            let inner = &mut *self.inner.get();
            inner.bm.reset(bits, len);
            inner.phy_start = phy_start;
            inner.size = size;
        }
        self.lock.release();
    }

    fn with<R>(&self, f: impl FnOnce(&mut PhysInner) -> R) -> R {
        self.lock.acquire();
        // SAFETY: the pool lock serializes access.
        let ret = f(unsafe { &mut *self.inner.get() });
        self.lock.release();
        ret
    }

    /// Allocate one frame, returning its physical address.
    pub fn palloc(&self) -> KernelResult<usize> {
        let kind = self.kind;
        self.with(|inner| {
            let bit = inner.bm.alloc(1).ok_or(KernelError::OutOfMemory {
                pool: kind,
                requested_pages: 1,
            })?;
            inner.bm.set(bit, true);
            Ok(inner.phy_start + bit * PAGE_SIZE)
        })
    }

    /// Return the frame at `phys` to the pool.
    pub fn pfree(&self, phys: usize) {
        self.with(|inner| {
            debug_assert!(phys >= inner.phy_start);
            let bit = (phys - inner.phy_start) / PAGE_SIZE;
            debug_assert!(inner.bm.get(bit), "double free of physical frame");
            inner.bm.set(bit, false);
        });
    }

    /// Whether `phys` falls inside this pool's range.
    pub fn contains_phys(&self, phys: usize) -> bool {
        self.with(|inner| phys >= inner.phy_start && phys < inner.phy_start + inner.size)
    }

    /// Whether the frame at `phys` is currently allocated.
    pub fn frame_in_use(&self, phys: usize) -> bool {
        self.with(|inner| {
            debug_assert!(phys >= inner.phy_start);
            inner.bm.get((phys - inner.phy_start) / PAGE_SIZE)
        })
    }

    /// Run `f` with this pool's mutex held.
    ///
    /// The lock is reentrant, so `f` may call back into `palloc`/`pfree`;
    /// the heap uses this to keep a whole malloc/free atomic against
    /// other tasks on the same pool.
    pub fn with_held<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock.acquire();
        let ret = f();
        self.lock.release();
        ret
    }

    /// Number of allocated frames (diagnostics and tests).
    pub fn used_frames(&self) -> usize {
        self.with(|inner| {
            let mut used = 0;
            for bit in 0..inner.bm.bit_len() {
                if inner.bm.get(bit) {
                    used += 1;
                }
            }
            used
        })
    }
}

/// Kernel physical pool.
pub static KERNEL_POOL: PhysPool = PhysPool::new(PoolKind::Kernel);
/// User physical pool.
pub static USER_POOL: PhysPool = PhysPool::new(PoolKind::User);
/// Kernel-heap virtual pool.
pub static KVM_POOL: LockedVirtPool = LockedVirtPool::new();

// ---------------------------------------------------------------------------
// Boot-time pool layout
// ---------------------------------------------------------------------------

/// Where the boot RAM split puts everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub kernel_frames: usize,
    pub user_frames: usize,
    /// Bitmap lengths in bytes.
    pub kernel_bm_len: usize,
    pub user_bm_len: usize,
    pub kernel_phys_start: usize,
    pub user_phys_start: usize,
}

/// Split total RAM into the kernel and user pools.
///
/// Remainder frames that do not fill a bitmap byte are deliberately
/// dropped; a bitmap that undercovers RAM never needs bounds checks.
pub fn compute_pool_layout(total_mem_bytes: usize) -> PoolLayout {
    debug_assert!(total_mem_bytes > RESERVED_LOW_BYTES);
    let free_bytes = total_mem_bytes - RESERVED_LOW_BYTES;
    let free_frames = free_bytes / PAGE_SIZE;
    let kernel_frames = free_frames / 2;
    let user_frames = free_frames - kernel_frames;
    PoolLayout {
        kernel_frames,
        user_frames,
        kernel_bm_len: kernel_frames / 8,
        user_bm_len: user_frames / 8,
        kernel_phys_start: RESERVED_LOW_BYTES,
        user_phys_start: RESERVED_LOW_BYTES + kernel_frames * PAGE_SIZE,
    }
}

// ---------------------------------------------------------------------------
// Page-granular allocation API (needs real page tables)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod paged {
    use super::*;
    use crate::sched::task::running_thread;

    fn pool(flag: PoolFlag) -> &'static PhysPool {
        match flag {
            PoolFlag::Kernel => &KERNEL_POOL,
            PoolFlag::User => &USER_POOL,
        }
    }

    fn vaddr_reserve(flag: PoolFlag, pg_cnt: usize) -> KernelResult<usize> {
        let vaddr = match flag {
            PoolFlag::Kernel => KVM_POOL.with(|p| p.reserve(pg_cnt)),
            PoolFlag::User => running_thread().userprog_vaddr.reserve(pg_cnt),
        };
        vaddr.ok_or(KernelError::OutOfMemory {
            pool: flag.kind(),
            requested_pages: pg_cnt,
        })
    }

    fn vaddr_release(flag: PoolFlag, vaddr: usize, pg_cnt: usize) {
        match flag {
            PoolFlag::Kernel => KVM_POOL.with(|p| p.release(vaddr, pg_cnt)),
            PoolFlag::User => running_thread().userprog_vaddr.release(vaddr, pg_cnt),
        }
    }

    /// Allocate and map `pg_cnt` virtually-contiguous pages.
    ///
    /// Physical frames are grabbed one at a time and need not be
    /// contiguous. Any failure unwinds the partial work (virtual
    /// reservation, frames, and mappings) before reporting.
    pub fn malloc_page(flag: PoolFlag, pg_cnt: usize) -> KernelResult<usize> {
        debug_assert!(pg_cnt > 0);
        let vaddr = vaddr_reserve(flag, pg_cnt)?;

        let mut mapped = 0;
        while mapped < pg_cnt {
            let page_vaddr = vaddr + mapped * PAGE_SIZE;
            match pool(flag).palloc() {
                Ok(frame) => {
                    page_table::map_page(page_vaddr, frame, flag);
                    mapped += 1;
                }
                Err(err) => {
                    rollback(flag, vaddr, mapped, pg_cnt);
                    return Err(err);
                }
            }
        }
        Ok(vaddr)
    }

    fn rollback(flag: PoolFlag, vaddr: usize, mapped: usize, pg_cnt: usize) {
        for k in 0..mapped {
            let page_vaddr = vaddr + k * PAGE_SIZE;
            let phys = page_table::addr_v2p(page_vaddr);
            pfree(phys);
            page_table::unmap_page(page_vaddr);
        }
        vaddr_release(flag, vaddr, pg_cnt);
    }

    /// Allocate, map, and zero kernel pages.
    pub fn get_kernel_pages(pg_cnt: usize) -> KernelResult<usize> {
        let vaddr = malloc_page(PoolFlag::Kernel, pg_cnt)?;
        // SAFETY: the range was just mapped writable for the kernel.
        unsafe { core::ptr::write_bytes(vaddr as *mut u8, 0, pg_cnt * PAGE_SIZE) };
        Ok(vaddr)
    }

    /// Allocate, map, and zero user pages in the current task's space.
    pub fn get_user_pages(pg_cnt: usize) -> KernelResult<usize> {
        let vaddr = malloc_page(PoolFlag::User, pg_cnt)?;
        // SAFETY: the range was just mapped writable.
        unsafe { core::ptr::write_bytes(vaddr as *mut u8, 0, pg_cnt * PAGE_SIZE) };
        Ok(vaddr)
    }

    /// Map one frame at a caller-chosen virtual address, claiming the
    /// matching virtual-pool bit.
    pub fn get_a_page(flag: PoolFlag, vaddr: usize) -> KernelResult<usize> {
        match flag {
            PoolFlag::Kernel => KVM_POOL.with(|p| p.mark(vaddr, true)),
            PoolFlag::User => running_thread().userprog_vaddr.mark(vaddr, true),
        }
        let frame = pool(flag).palloc().inspect_err(|_| {
            match flag {
                PoolFlag::Kernel => KVM_POOL.with(|p| p.mark(vaddr, false)),
                PoolFlag::User => running_thread().userprog_vaddr.mark(vaddr, false),
            };
        })?;
        page_table::map_page(vaddr, frame, flag);
        Ok(vaddr)
    }

    /// `get_a_page` for the fork path, which has already duplicated the
    /// parent's virtual bitmap and only needs the frame and mapping.
    pub fn get_a_page_without_vbitmap(flag: PoolFlag, vaddr: usize) -> KernelResult<usize> {
        let frame = pool(flag).palloc()?;
        page_table::map_page(vaddr, frame, flag);
        Ok(vaddr)
    }

    /// Translate a mapped virtual address to its physical counterpart.
    pub fn addr_v2p(vaddr: usize) -> usize {
        page_table::addr_v2p(vaddr)
    }

    /// Return the frame at `phys` to whichever pool owns it.
    pub fn pfree(phys: usize) {
        if USER_POOL.contains_phys(phys) {
            USER_POOL.pfree(phys);
        } else {
            KERNEL_POOL.pfree(phys);
        }
    }

    /// Unmap and free `pg_cnt` pages starting at `vaddr`.
    pub fn mfree_page(flag: PoolFlag, vaddr: usize, pg_cnt: usize) {
        debug_assert_eq!(vaddr % PAGE_SIZE, 0);
        for k in 0..pg_cnt {
            let page_vaddr = vaddr + k * PAGE_SIZE;
            let phys = page_table::addr_v2p(page_vaddr);
            debug_assert!(phys >= RESERVED_LOW_BYTES);
            pfree(phys);
            page_table::unmap_page(page_vaddr);
        }
        vaddr_release(flag, vaddr, pg_cnt);
    }

    /// Carve up boot RAM and bring the pools online.
    pub fn init() {
        // SAFETY: the loader stores the probed RAM size at this address.
        let total_mem = unsafe { core::ptr::read_volatile(TOTAL_MEM_BYTES_VADDR as *const u32) }
            as usize;
        let layout = compute_pool_layout(total_mem);

        let kernel_bits = MEM_BITMAP_BASE as *mut u8;
        let user_bits = (MEM_BITMAP_BASE + layout.kernel_bm_len) as *mut u8;
        let kvm_bits =
            (MEM_BITMAP_BASE + layout.kernel_bm_len + layout.user_bm_len) as *mut u8;

        // SAFETY: the bitmap window below 0xc009e000 is reserved by the
        // memory map and the three ranges do not overlap.
        unsafe {
            KERNEL_POOL.init(
                kernel_bits,
                layout.kernel_bm_len,
                layout.kernel_phys_start,
                layout.kernel_frames * PAGE_SIZE,
            );
            USER_POOL.init(
                user_bits,
                layout.user_bm_len,
                layout.user_phys_start,
                layout.user_frames * PAGE_SIZE,
            );
        }
        KVM_POOL.with(|p| {
            // SAFETY: the kvm bitmap range follows the two pool bitmaps
            // and is exclusively this pool's.
            unsafe { p.init(kvm_bits, layout.kernel_bm_len, K_HEAP_START) };
        });

        heap::init();

        log::info!(
            "mm: {} MiB managed, kernel pool {:#x}+{} frames, user pool {:#x}+{} frames",
            total_mem >> 20,
            layout.kernel_phys_start,
            layout.kernel_frames,
            layout.user_phys_start,
            layout.user_frames
        );
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use paged::{
    addr_v2p, get_a_page, get_a_page_without_vbitmap, get_kernel_pages, get_user_pages, init,
    malloc_page, mfree_page, pfree,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn test_phys_pool(kind: PoolKind, frames: usize, phy_start: usize) -> PhysPool {
        let pool = PhysPool::new(kind);
        let storage = std::vec![0u8; frames / 8].leak();
        // SAFETY: leaked storage, exclusively this pool's.
        unsafe {
            pool.init(
                storage.as_mut_ptr(),
                storage.len(),
                phy_start,
                frames * PAGE_SIZE,
            )
        };
        pool
    }

    fn test_virt_pool(frames: usize, start: usize) -> VirtPool {
        let mut pool = VirtPool::empty();
        let storage = std::vec![0u8; frames / 8].leak();
        // SAFETY: leaked storage, exclusively this pool's.
        unsafe { pool.init(storage.as_mut_ptr(), storage.len(), start) };
        pool
    }

    #[test]
    fn layout_halves_free_frames() {
        let layout = compute_pool_layout(32 * 1024 * 1024);
        assert_eq!(
            layout.kernel_frames + layout.user_frames,
            (32 * 1024 * 1024 - RESERVED_LOW_BYTES) / PAGE_SIZE
        );
        assert!(layout.user_frames - layout.kernel_frames <= 1);
        assert_eq!(layout.kernel_phys_start, RESERVED_LOW_BYTES);
        assert_eq!(
            layout.user_phys_start,
            layout.kernel_phys_start + layout.kernel_frames * PAGE_SIZE
        );
        // All three bitmaps must fit the reserved window below the TCB
        // page for any supported RAM size.
        let max = compute_pool_layout(256 * 1024 * 1024);
        assert!(max.kernel_bm_len + max.user_bm_len + max.kernel_bm_len <= 4 * PAGE_SIZE);
    }

    #[test]
    fn palloc_sets_exactly_one_bit() {
        let pool = test_phys_pool(PoolKind::Kernel, 64, 0x20_0000);
        let frame = pool.palloc().unwrap();
        assert_eq!(frame, 0x20_0000);
        assert!(pool.frame_in_use(frame));
        assert_eq!(pool.used_frames(), 1);
    }

    #[test]
    fn palloc_pfree_roundtrip_restores_bitmap() {
        let pool = test_phys_pool(PoolKind::User, 64, 0x40_0000);
        assert_eq!(pool.used_frames(), 0);
        let a = pool.palloc().unwrap();
        let b = pool.palloc().unwrap();
        let c = pool.palloc().unwrap();
        assert_eq!(pool.used_frames(), 3);
        pool.pfree(b);
        pool.pfree(a);
        pool.pfree(c);
        assert_eq!(pool.used_frames(), 0);
        // Bit-for-bit back to the start: the next run begins at frame 0.
        assert_eq!(pool.palloc().unwrap(), 0x40_0000);
    }

    #[test]
    fn palloc_reports_oom_with_pool_kind() {
        let pool = test_phys_pool(PoolKind::Kernel, 8, 0x20_0000);
        for _ in 0..8 {
            pool.palloc().unwrap();
        }
        assert_eq!(
            pool.palloc(),
            Err(KernelError::OutOfMemory {
                pool: PoolKind::Kernel,
                requested_pages: 1
            })
        );
    }

    #[test]
    fn freed_frame_goes_back_to_its_own_pool() {
        let kernel = test_phys_pool(PoolKind::Kernel, 16, 0x20_0000);
        let user = test_phys_pool(PoolKind::User, 16, 0x80_0000);
        let frame = user.palloc().unwrap();
        assert!(user.contains_phys(frame));
        assert!(!kernel.contains_phys(frame));
    }

    #[test]
    fn virt_pool_reserve_release() {
        let mut pool = test_virt_pool(64, K_HEAP_START);
        let a = pool.reserve(3).unwrap();
        assert_eq!(a, K_HEAP_START);
        assert!(pool.is_reserved(a + 2 * PAGE_SIZE));
        let b = pool.reserve(1).unwrap();
        assert_eq!(b, K_HEAP_START + 3 * PAGE_SIZE);
        pool.release(a, 3);
        assert!(!pool.is_reserved(a));
        // The freed run is reusable, b stays reserved.
        assert_eq!(pool.reserve(2).unwrap(), a);
        assert!(pool.is_reserved(b));
    }

    #[test]
    fn virt_pool_mark_single_pages() {
        let mut pool = test_virt_pool(32, USER_VADDR_START);
        let page = USER_VADDR_START + 5 * PAGE_SIZE;
        pool.mark(page, true);
        assert!(pool.is_reserved(page));
        // A later contiguous reservation must route around it.
        let run = pool.reserve(6).unwrap();
        assert_eq!(run, USER_VADDR_START + 6 * PAGE_SIZE);
        pool.mark(page, false);
        assert!(!pool.is_reserved(page));
    }
}
