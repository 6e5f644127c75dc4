//! Byte-granular heap on top of the page allocator.
//!
//! Small requests come out of *arenas*: a page whose head is an [`Arena`]
//! record and whose remainder is carved into equal blocks, all threaded
//! onto the free list of the size class that owns the page. Seven size
//! classes cover 16..=1024 bytes; anything bigger becomes a `large`
//! arena spanning whole pages. Freeing reverses both paths, and a small
//! arena whose blocks all come home is unthreaded and returned to the
//! page pool.
//!
//! Kernel threads share one static descriptor array; user tasks bring
//! their own in the TCB so their free lists never mix with the kernel's.

use core::cell::UnsafeCell;
use core::mem::size_of;

use crate::list::{List, ListNode};
use crate::mm::PAGE_SIZE;

/// Number of size classes.
pub const DESC_CNT: usize = 7;
/// Smallest block handed out.
pub const MIN_BLOCK_SIZE: usize = 16;
/// Largest block served from an arena; beyond this goes page-granular.
pub const MAX_BLOCK_SIZE: usize = 1024;

/// Arena header at the base of each heap page (or page run).
///
/// Padded to 16 bytes so the first block after it keeps every size
/// class 16-aligned.
#[repr(C, align(16))]
struct Arena {
    /// Owning size class, null for large arenas.
    desc: *mut BlockDesc,
    /// Large: page count. Small: blocks still free in this arena.
    cnt: usize,
    large: bool,
}

/// One heap size class.
pub struct BlockDesc {
    block_size: usize,
    /// Blocks a fresh arena of this class yields.
    blocks_per_arena: usize,
    /// Free blocks across all arenas of this class.
    free_list: List,
}

impl BlockDesc {
    /// Placeholder for static storage; `block_desc_init` fills it in.
    pub const fn placeholder() -> Self {
        Self {
            block_size: 0,
            blocks_per_arena: 0,
            free_list: List::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks_per_arena(&self) -> usize {
        self.blocks_per_arena
    }

    pub fn free_blocks(&self) -> usize {
        self.free_list.len()
    }
}

/// Blocks a one-page arena of `block_size` yields.
pub const fn blocks_per_arena(block_size: usize) -> usize {
    (PAGE_SIZE - size_of::<Arena>()) / block_size
}

/// Smallest size class covering `size`, or `None` when only a large
/// arena will do.
pub fn desc_index_for(size: usize) -> Option<usize> {
    if size > MAX_BLOCK_SIZE {
        return None;
    }
    (0..DESC_CNT).find(|&i| size <= MIN_BLOCK_SIZE << i)
}

/// Initialize a descriptor array in place (the lists link their
/// sentinels at their final address).
pub fn block_desc_init(descs: &mut [BlockDesc; DESC_CNT]) {
    for (i, desc) in descs.iter_mut().enumerate() {
        desc.block_size = MIN_BLOCK_SIZE << i;
        desc.blocks_per_arena = blocks_per_arena(desc.block_size);
        desc.free_list.init();
    }
}

/// `idx`-th block of a small arena.
unsafe fn arena_block(arena: *mut Arena, block_size: usize, idx: usize) -> *mut ListNode {
    (arena as usize + size_of::<Arena>() + idx * block_size) as *mut ListNode
}

/// The arena owning `block` (arenas are page-aligned).
fn block_arena(block: *mut u8) -> *mut Arena {
    (block as usize & !(PAGE_SIZE - 1)) as *mut Arena
}

/// Stamp `page` as a small arena of `desc`'s class and thread every
/// block onto the class free list.
///
/// # Safety
///
/// `page` must be a zeroed, page-aligned, exclusively-owned page, and
/// `desc` must outlive it.
unsafe fn carve_arena(page: *mut u8, desc: &mut BlockDesc) {
    let arena = page as *mut Arena;
    // SAFETY: caller hands us the whole page.
    unsafe {
        (*arena).desc = desc;
        (*arena).cnt = desc.blocks_per_arena;
        (*arena).large = false;
        for idx in 0..desc.blocks_per_arena {
            let block = arena_block(arena, desc.block_size, idx);
            block.write(ListNode::new());
            desc.free_list.push_back(block);
        }
    }
}

/// Stamp a page run as a large arena.
///
/// # Safety
///
/// `base` must point at `pg_cnt` exclusively-owned pages.
unsafe fn init_large_arena(base: *mut u8, pg_cnt: usize) {
    let arena = base as *mut Arena;
    // SAFETY: caller hands us the run.
    unsafe {
        (*arena).desc = core::ptr::null_mut();
        (*arena).cnt = pg_cnt;
        (*arena).large = true;
    }
}

/// Pop one block of `desc`'s class, if any arena has one free.
fn alloc_block(desc: &mut BlockDesc) -> Option<*mut u8> {
    if desc.free_list.is_empty() {
        return None;
    }
    let node = desc.free_list.pop_front();
    let arena = block_arena(node as *mut u8);
    // SAFETY: every node on a free list lives inside a live small arena.
    unsafe {
        debug_assert!(!(*arena).large);
        (*arena).cnt -= 1;
    }
    Some(node as *mut u8)
}

/// Return `block` to its arena. When the arena's last block comes home,
/// every one of its blocks is unthreaded from the class free list and
/// the backing page is handed back for release.
///
/// # Safety
///
/// `block` must have come from [`alloc_block`] on a still-live arena.
unsafe fn free_block(block: *mut u8) -> Option<*mut u8> {
    let node = block as *mut ListNode;
    let arena = block_arena(block);
    // SAFETY: caller guarantees a live small arena around the block.
    unsafe {
        let desc = &mut *(*arena).desc;
        node.write(ListNode::new());
        desc.free_list.push_back(node);
        (*arena).cnt += 1;

        if (*arena).cnt == desc.blocks_per_arena {
            for idx in 0..desc.blocks_per_arena {
                let b = arena_block(arena, desc.block_size, idx);
                List::remove(b);
            }
            return Some(arena as *mut u8);
        }
    }
    None
}

struct DescArray(UnsafeCell<[BlockDesc; DESC_CNT]>);

// SAFETY: the kernel descriptor array is only touched under the kernel
// pool's mutex (sys_malloc/sys_free hold it for their whole run).
unsafe impl Sync for DescArray {}

/// Size classes shared by all kernel threads.
static KERNEL_DESCS: DescArray = DescArray(UnsafeCell::new(
    [const { BlockDesc::placeholder() }; DESC_CNT],
));

/// Initialize the kernel size classes. Called from `mm::init`.
pub fn init() {
    // SAFETY: single-threaded boot; nothing allocates yet.
    block_desc_init(unsafe { &mut *KERNEL_DESCS.0.get() });
    log::info!(
        "heap: {DESC_CNT} size classes, {}..{} bytes",
        MIN_BLOCK_SIZE,
        MAX_BLOCK_SIZE
    );
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod alloc_api {
    use core::alloc::{GlobalAlloc, Layout};

    use super::*;
    use crate::error::{KernelError, KernelResult};
    use crate::mm::{malloc_page, mfree_page, PhysPool, PoolFlag, KERNEL_POOL, USER_POOL};
    use crate::sched::task::running_thread;

    /// The current task's pool, flag, and descriptor array. Kernel
    /// threads (no private page directory) share the statics.
    fn heap_home() -> (PoolFlag, &'static PhysPool, &'static mut [BlockDesc; DESC_CNT]) {
        let cur = running_thread();
        if cur.pgdir.is_some() {
            (PoolFlag::User, &USER_POOL, &mut cur.u_block_descs)
        } else {
            // SAFETY: serialized by the kernel pool mutex held by our
            // callers (see DescArray).
            (PoolFlag::Kernel, &KERNEL_POOL, unsafe {
                &mut *KERNEL_DESCS.0.get()
            })
        }
    }

    /// Allocate `size` bytes from the current task's heap.
    pub fn sys_malloc(size: usize) -> KernelResult<*mut u8> {
        debug_assert!(size > 0);
        let (flag, pool, descs) = heap_home();
        pool.with_held(|| {
            if size > MAX_BLOCK_SIZE {
                let pg_cnt = (size + size_of::<Arena>()).div_ceil(PAGE_SIZE);
                let base = malloc_page(flag, pg_cnt)?;
                // SAFETY: freshly mapped, exclusively ours.
                unsafe {
                    core::ptr::write_bytes(base as *mut u8, 0, pg_cnt * PAGE_SIZE);
                    init_large_arena(base as *mut u8, pg_cnt);
                }
                return Ok((base + size_of::<Arena>()) as *mut u8);
            }

            let idx = desc_index_for(size).expect("size class exists below MAX_BLOCK_SIZE");
            if descs[idx].free_blocks() == 0 {
                let page = malloc_page(flag, 1)?;
                // SAFETY: freshly mapped page, exclusively ours.
                unsafe {
                    core::ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE);
                    carve_arena(page as *mut u8, &mut descs[idx]);
                }
            }
            alloc_block(&mut descs[idx]).ok_or(KernelError::HeapExhausted { requested: size })
        })
    }

    /// Free a pointer from [`sys_malloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `sys_malloc` in the same address space and
    /// not be freed twice.
    pub unsafe fn sys_free(ptr: *mut u8) {
        debug_assert!(!ptr.is_null());
        let (flag, pool, _descs) = heap_home();
        pool.with_held(|| {
            let arena = block_arena(ptr);
            // SAFETY: sys_malloc pointers sit inside a live arena.
            unsafe {
                if (*arena).large {
                    debug_assert!((*arena).desc.is_null());
                    mfree_page(flag, arena as usize, (*arena).cnt);
                } else if let Some(page) = free_block(ptr) {
                    mfree_page(flag, page as usize, 1);
                }
            }
        });
    }

    /// `core::alloc` front end over the arena heap, so `alloc`
    /// collections work inside the kernel.
    pub struct KernelHeap;

    // SAFETY: sys_malloc hands out exclusive, correctly-sized blocks
    // aligned to 16; layouts needing more are refused with null.
    unsafe impl GlobalAlloc for KernelHeap {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if layout.align() > 16 {
                return core::ptr::null_mut();
            }
            sys_malloc(layout.size().max(1)).unwrap_or(core::ptr::null_mut())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            // SAFETY: `ptr` came from `alloc` above.
            unsafe { sys_free(ptr) };
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use alloc_api::{sys_free, sys_malloc, KernelHeap};

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct HeapPage([u8; PAGE_SIZE]);

    fn fresh_page() -> *mut u8 {
        let page = std::boxed::Box::leak(std::boxed::Box::new(HeapPage([0; PAGE_SIZE])));
        page as *mut HeapPage as *mut u8
    }

    fn fresh_descs() -> &'static mut [BlockDesc; DESC_CNT] {
        let descs = std::boxed::Box::leak(std::boxed::Box::new(
            [const { BlockDesc::placeholder() }; DESC_CNT],
        ));
        block_desc_init(descs);
        descs
    }

    #[test]
    fn size_classes_double_from_16() {
        let descs = fresh_descs();
        let sizes: std::vec::Vec<usize> = descs.iter().map(|d| d.block_size()).collect();
        assert_eq!(sizes, [16, 32, 64, 128, 256, 512, 1024]);
    }

    #[test]
    fn desc_index_picks_smallest_fit() {
        assert_eq!(desc_index_for(1), Some(0));
        assert_eq!(desc_index_for(16), Some(0));
        assert_eq!(desc_index_for(17), Some(1));
        assert_eq!(desc_index_for(1024), Some(6));
        assert_eq!(desc_index_for(1025), None);
    }

    #[test]
    fn arena_geometry_accounts_for_header() {
        for class in 0..DESC_CNT {
            let size = MIN_BLOCK_SIZE << class;
            assert_eq!(
                blocks_per_arena(size),
                (PAGE_SIZE - size_of::<Arena>()) / size
            );
        }
    }

    #[test]
    fn carve_threads_every_block() {
        let descs = fresh_descs();
        let desc = &mut descs[2]; // 64-byte class
        // SAFETY: fresh zeroed page owned by this test.
        unsafe { carve_arena(fresh_page(), desc) };
        assert_eq!(desc.free_blocks(), desc.blocks_per_arena());
    }

    #[test]
    fn alloc_free_keeps_arena_count_consistent() {
        let descs = fresh_descs();
        let desc = &mut descs[3]; // 128-byte class
        let page = fresh_page();
        // SAFETY: fresh zeroed page owned by this test.
        unsafe { carve_arena(page, desc) };
        let total = desc.blocks_per_arena();

        let a = alloc_block(desc).unwrap();
        let b = alloc_block(desc).unwrap();
        assert_ne!(a, b);
        // Blocks live past the header, inside the page.
        assert_eq!(block_arena(a) as *mut u8, page);
        assert!(a as usize >= page as usize + size_of::<Arena>());

        // Arena live-count + free-list population covers every block.
        let arena = block_arena(a);
        // SAFETY: arena was carved above and is still live.
        let live = unsafe { (*arena).cnt };
        assert_eq!(live + 2, total);
        assert_eq!(desc.free_blocks(), total - 2);

        // SAFETY: both blocks came from alloc_block just now.
        unsafe {
            assert_eq!(free_block(b), None);
            // Last block home: the arena reports itself fully free.
            assert_eq!(free_block(a), Some(page));
        }
        // Every block of the released arena left the free list.
        assert_eq!(desc.free_blocks(), 0);
    }

    #[test]
    fn full_free_detaches_only_that_arena() {
        let descs = fresh_descs();
        let desc = &mut descs[4]; // 256-byte class
        let first = fresh_page();
        let second = fresh_page();
        // SAFETY: fresh zeroed pages owned by this test.
        unsafe {
            carve_arena(first, desc);
            carve_arena(second, desc);
        }
        let per = desc.blocks_per_arena();
        assert_eq!(desc.free_blocks(), per * 2);

        // Drain the first arena completely (FIFO order hands out the
        // first page's blocks first).
        let mut taken = std::vec::Vec::new();
        for _ in 0..per {
            taken.push(alloc_block(desc).unwrap());
        }
        assert!(taken.iter().all(|&b| block_arena(b) as *mut u8 == first));

        // Refill it: the final free releases the page, and the second
        // arena's blocks stay threaded.
        let last = taken.pop().unwrap();
        for b in taken {
            // SAFETY: allocated above.
            assert_eq!(unsafe { free_block(b) }, None);
        }
        // SAFETY: allocated above.
        assert_eq!(unsafe { free_block(last) }, Some(first));
        assert_eq!(desc.free_blocks(), per);
    }
}
