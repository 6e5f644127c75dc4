//! Two-level x86 paging with a recursive directory slot.
//!
//! The last PDE of every directory points back at the directory itself,
//! which pins two fixed windows into the virtual space: the PTE for any
//! address is editable at `0xFFC0_0000 + (pde << 12) + (pte << 2)`, and
//! the PDEs themselves live in the top page at `0xFFFF_F000`. All table
//! editing goes through those windows; no directory is ever mapped
//! elsewhere.

use bitflags::bitflags;

use super::{PoolFlag, PAGE_SIZE};

bitflags! {
    /// Page directory / table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const PAGE_SIZE_4M  = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

/// Base of the per-table PTE editing window (last PDE, recursive).
pub const RECURSIVE_PTE_BASE: usize = 0xffc0_0000;
/// The page holding every PDE of the current directory.
pub const RECURSIVE_PDE_BASE: usize = 0xffff_f000;

/// Flags-free physical address bits of an entry.
const ENTRY_ADDR_MASK: u32 = 0xffff_f000;

/// Index into the page directory for `vaddr`.
pub const fn pde_index(vaddr: usize) -> usize {
    vaddr >> 22
}

/// Index into the page table for `vaddr`.
pub const fn pte_index(vaddr: usize) -> usize {
    (vaddr >> 12) & 0x3ff
}

/// Virtual address at which `vaddr`'s PTE is editable.
pub const fn pte_vaddr(vaddr: usize) -> usize {
    RECURSIVE_PTE_BASE + (pde_index(vaddr) << 12) + (pte_index(vaddr) << 2)
}

/// Virtual address at which `vaddr`'s PDE is editable.
pub const fn pde_vaddr(vaddr: usize) -> usize {
    RECURSIVE_PDE_BASE + (pde_index(vaddr) << 2)
}

/// Physical frame base recorded in an entry.
pub const fn entry_frame(entry: u32) -> usize {
    (entry & ENTRY_ADDR_MASK) as usize
}

/// Whether an entry maps something.
pub const fn entry_present(entry: u32) -> bool {
    entry & EntryFlags::PRESENT.bits() != 0
}

/// Compose an entry from a frame base and flags.
pub const fn make_entry(frame: usize, flags: EntryFlags) -> u32 {
    debug_assert!(frame % PAGE_SIZE == 0);
    frame as u32 | flags.bits()
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod editing {
    use super::*;
    use crate::mm::KERNEL_POOL;

    fn pte_ptr(vaddr: usize) -> *mut u32 {
        pte_vaddr(vaddr) as *mut u32
    }

    fn pde_ptr(vaddr: usize) -> *mut u32 {
        pde_vaddr(vaddr) as *mut u32
    }

    /// Map the frame at `phys` to `vaddr`, creating the covering page
    /// table on demand. Panics on a double map: a PTE that is already
    /// present means allocator state has been corrupted, and continuing
    /// would silently leak or alias a frame.
    pub fn map_page(vaddr: usize, phys: usize, flag: PoolFlag) {
        let mut flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        if flag == PoolFlag::User {
            flags |= EntryFlags::USER;
        }

        // SAFETY: the recursive windows are valid for the live directory;
        // missing tables are created before the PTE write below.
        unsafe {
            let pde = pde_ptr(vaddr);
            if !entry_present(*pde) {
                // New page table; its frame always comes from the kernel
                // pool, whatever the mapping is for.
                let table_phys = KERNEL_POOL
                    .palloc()
                    .expect("out of kernel frames for a page table");
                // User bit on the PDE so user mappings under it work; the
                // PTE stays the real permission gate.
                *pde = make_entry(
                    table_phys,
                    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
                );
                // The fresh table is reachable through the PTE window;
                // zero it before first use.
                let table_window = (pte_vaddr(vaddr) & !(PAGE_SIZE - 1)) as *mut u8;
                core::ptr::write_bytes(table_window, 0, PAGE_SIZE);
            }

            let pte = pte_ptr(vaddr);
            assert!(
                !entry_present(*pte),
                "page already mapped at {vaddr:#010x}"
            );
            *pte = make_entry(phys, flags);
        }
    }

    /// Drop the mapping at `vaddr` and invalidate its TLB entry. The
    /// frame itself is the caller's to free.
    pub fn unmap_page(vaddr: usize) {
        // SAFETY: clearing the present bit of a mapped PTE through the
        // recursive window, then flushing that one TLB entry.
        unsafe {
            let pte = pte_ptr(vaddr);
            debug_assert!(entry_present(*pte));
            *pte &= !EntryFlags::PRESENT.bits();
        }
        crate::arch::x86::invlpg(vaddr);
    }

    /// Physical address behind a mapped virtual address.
    pub fn addr_v2p(vaddr: usize) -> usize {
        // SAFETY: reading the PTE through the recursive window.
        let entry = unsafe { *pte_ptr(vaddr) };
        debug_assert!(entry_present(entry), "v2p of unmapped {vaddr:#010x}");
        entry_frame(entry) + (vaddr & (PAGE_SIZE - 1))
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use editing::{addr_v2p, map_page, unmap_page};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_split() {
        let vaddr = 0xc010_3456;
        assert_eq!(pde_index(vaddr), 0xc010_3456 >> 22);
        assert_eq!(pde_index(vaddr), 768); // kernel base lands in PDE 768
        assert_eq!(pte_index(vaddr), 0x103);
    }

    #[test]
    fn recursive_windows() {
        // PTE of the first kernel-heap page: PDE 768, PTE 0x100.
        let vaddr = crate::mm::K_HEAP_START;
        assert_eq!(pte_vaddr(vaddr), RECURSIVE_PTE_BASE + (768 << 12) + (0x100 << 2));
        assert_eq!(pde_vaddr(vaddr), RECURSIVE_PDE_BASE + (768 << 2));
        // The windows themselves live in the recursive 4 MiB.
        assert!(pte_vaddr(vaddr) >= RECURSIVE_PTE_BASE);
        assert!(pde_vaddr(vaddr) >= RECURSIVE_PDE_BASE);
    }

    #[test]
    fn entries_roundtrip() {
        let entry = make_entry(0x0066_5000, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        assert!(entry_present(entry));
        assert_eq!(entry_frame(entry), 0x0066_5000);

        let cleared = entry & !EntryFlags::PRESENT.bits();
        assert!(!entry_present(cleared));
    }

    #[test]
    fn v2p_composition() {
        // entry_frame + low 12 bits is the whole translation.
        let entry = make_entry(0x0123_4000, EntryFlags::PRESENT);
        let vaddr = 0xc055_6789usize;
        assert_eq!(entry_frame(entry) + (vaddr & 0xfff), 0x0123_4789);
    }
}
