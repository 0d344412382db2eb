//! Virtual Memory Manager.
//!
//! Builds one kernel PML4 out of statically allocated, page-aligned tables
//! in the kernel image and loads it into CR3. Three mappings are installed:
//!
//! - identity map of the first 32 GiB with 2 MiB huge pages, so early
//!   physical pointers (the PMM bitmap, bootloader structures) stay usable;
//! - the same 32 GiB again at the HHDM base, giving kernel code a linear
//!   window onto physical memory by adding one offset;
//! - 1 GiB of 4 KiB pages for the kernel image at its reported virtual
//!   base. Huge pages would require the kernel's physical base to be 2 MiB
//!   aligned, which the bootloader does not guarantee.

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU64, Ordering};

pub const PAGE_SIZE: u64 = 4096;
const ENTRIES_PER_TABLE: usize = 512;

/// All of physical memory is mapped again starting here.
pub const HHDM_BASE: u64 = 0xFFFF_8000_0000_0000;

/// The kernel image is linked at this virtual base.
pub const KERNEL_VIRTUAL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// How many GiB the identity and HHDM maps cover.
const IDENTITY_GIB: usize = 32;

// Page table entry flags (Intel SDM vol. 3)
pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_WRITE: u64 = 1 << 1;
pub const PTE_USER: u64 = 1 << 2;
pub const PTE_HUGE_PAGE: u64 = 1 << 7;

/// Mask for the physical-address field of an entry.
pub const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// A full 4 KiB page table: 512 eight-byte entries.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [u64; ENTRIES_PER_TABLE],
}

impl PageTable {
    const EMPTY: PageTable = PageTable {
        entries: [0; ENTRIES_PER_TABLE],
    };
}

// The whole hierarchy lives in the kernel image. 32 PDs cover the identity
// and HHDM windows; one PD plus 512 PTs cover the kernel's 1 GiB in 4 KiB
// pages.
static mut PML4: PageTable = PageTable::EMPTY;
static mut PDPT_LOW: PageTable = PageTable::EMPTY;
static mut PDPT_HIGH: PageTable = PageTable::EMPTY;
static mut PDPT_HHDM: PageTable = PageTable::EMPTY;
static mut PD_LOW: [PageTable; IDENTITY_GIB] = [PageTable::EMPTY; IDENTITY_GIB];
static mut PD_KERNEL: PageTable = PageTable::EMPTY;
static mut PT_KERNEL: [PageTable; ENTRIES_PER_TABLE] = [PageTable::EMPTY; ENTRIES_PER_TABLE];

/// Physical address of the kernel PML4, valid after `init`.
static KERNEL_PML4_PHYS: AtomicU64 = AtomicU64::new(0);

pub fn pml4_index(virt: u64) -> usize {
    ((virt >> 39) & 0x1FF) as usize
}

pub fn pdpt_index(virt: u64) -> usize {
    ((virt >> 30) & 0x1FF) as usize
}

pub fn pd_index(virt: u64) -> usize {
    ((virt >> 21) & 0x1FF) as usize
}

pub fn pt_index(virt: u64) -> usize {
    ((virt >> 12) & 0x1FF) as usize
}

/// View a physical address through the HHDM window.
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (HHDM_BASE.wrapping_add(phys)) as *mut u8
}

/// Physical address of the kernel PML4.
pub fn kernel_pml4() -> u64 {
    KERNEL_PML4_PHYS.load(Ordering::Relaxed)
}

/// Fill in the static tables. Separated from `init` so the construction can
/// run against host memory.
///
/// # Safety
/// Must not race with itself or with the hardware walking the tables.
unsafe fn build_tables(kernel_phys_base: u64, kernel_virt_base: u64) -> u64 {
    // The tables are linked into the kernel image, so their physical
    // location follows from the bootloader-reported kernel base pair.
    let virt_to_phys = |virt: u64| virt.wrapping_sub(kernel_virt_base).wrapping_add(kernel_phys_base);

    let pml4 = &mut *addr_of_mut!(PML4);
    let pdpt_low = &mut *addr_of_mut!(PDPT_LOW);
    let pdpt_high = &mut *addr_of_mut!(PDPT_HIGH);
    let pdpt_hhdm = &mut *addr_of_mut!(PDPT_HHDM);
    let pd_low = &mut *addr_of_mut!(PD_LOW);
    let pd_kernel = &mut *addr_of_mut!(PD_KERNEL);
    let pt_kernel = &mut *addr_of_mut!(PT_KERNEL);

    let pml4_phys = virt_to_phys(pml4 as *const _ as u64);
    let pdpt_low_phys = virt_to_phys(pdpt_low as *const _ as u64);
    let pdpt_high_phys = virt_to_phys(pdpt_high as *const _ as u64);
    let pdpt_hhdm_phys = virt_to_phys(pdpt_hhdm as *const _ as u64);
    let pd_low_phys = virt_to_phys(pd_low.as_ptr() as u64);
    let pd_kernel_phys = virt_to_phys(pd_kernel as *const _ as u64);
    let pt_kernel_phys = virt_to_phys(pt_kernel.as_ptr() as u64);

    let flags = PTE_PRESENT | PTE_WRITE | PTE_USER;

    // Identity map: PML4[0] -> PDPT_LOW -> 32 PDs of 2 MiB huge pages.
    pml4.entries[0] = pdpt_low_phys | flags;
    let mut phys = 0u64;
    for gib in 0..IDENTITY_GIB {
        pdpt_low.entries[gib] = (pd_low_phys + (gib as u64) * PAGE_SIZE) | flags;
        for entry in 0..ENTRIES_PER_TABLE {
            pd_low[gib].entries[entry] = phys | flags | PTE_HUGE_PAGE;
            phys += 0x20_0000;
        }
    }

    // Kernel image: 1 GiB of 4 KiB pages from the reported physical base.
    let kernel_pml4_index = pml4_index(kernel_virt_base);
    let kernel_pdpt_index = pdpt_index(kernel_virt_base);
    pml4.entries[kernel_pml4_index] = pdpt_high_phys | flags;
    pdpt_high.entries[kernel_pdpt_index] = pd_kernel_phys | flags;

    let mut kern_phys = kernel_phys_base;
    for pt in 0..ENTRIES_PER_TABLE {
        pd_kernel.entries[pt] = (pt_kernel_phys + (pt as u64) * PAGE_SIZE) | flags;
        for entry in 0..ENTRIES_PER_TABLE {
            pt_kernel[pt].entries[entry] = kern_phys | flags;
            kern_phys += PAGE_SIZE;
        }
    }

    // HHDM: PML4[256] -> PDPT_HHDM, reusing the identity map's PDs.
    let hhdm_pml4_index = pml4_index(HHDM_BASE);
    pml4.entries[hhdm_pml4_index] = pdpt_hhdm_phys | flags;
    for gib in 0..IDENTITY_GIB {
        pdpt_hhdm.entries[gib] = (pd_low_phys + (gib as u64) * PAGE_SIZE) | flags;
    }

    pml4_phys
}

/// Build the kernel page tables and switch CR3 to them.
///
/// # Safety
/// Must be called exactly once, before the PMM starts handing out pages and
/// while the bootloader's mappings still cover the kernel image.
pub unsafe fn init(kernel_phys_base: u64, kernel_virt_base: u64) {
    let pml4_phys = build_tables(kernel_phys_base, kernel_virt_base);
    KERNEL_PML4_PHYS.store(pml4_phys, Ordering::Relaxed);

    #[cfg(not(test))]
    {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;

        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(pml4_phys)),
            Cr3Flags::empty(),
        );
    }

    crate::log!("VMM: kernel page tables active (PML4 at {:#x})", pml4_phys);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::addr_of;

    #[test]
    fn index_extraction() {
        assert_eq!(pml4_index(KERNEL_VIRTUAL_BASE), 511);
        assert_eq!(pdpt_index(KERNEL_VIRTUAL_BASE), 510);
        assert_eq!(pml4_index(HHDM_BASE), 256);
        assert_eq!(pml4_index(0), 0);

        let virt = 0xFFFF_FFFF_8020_3000u64;
        assert_eq!(pd_index(virt), 1);
        assert_eq!(pt_index(virt), 3);
    }

    #[test]
    fn address_mask_strips_flags() {
        let entry = 0x0000_0001_2345_6000u64 | PTE_PRESENT | PTE_WRITE | PTE_USER;
        assert_eq!(entry & PTE_ADDR_MASK, 0x0000_0001_2345_6000);
    }

    #[test]
    fn table_construction() {
        let phys_base = 0x0020_0000u64;
        unsafe {
            build_tables(phys_base, KERNEL_VIRTUAL_BASE);

            let pml4 = &*addr_of!(PML4);
            let pd_low = &*addr_of!(PD_LOW);
            let pt_kernel = &*addr_of!(PT_KERNEL);

            let flags = PTE_PRESENT | PTE_WRITE | PTE_USER;

            // Identity, HHDM and kernel slots are populated and present.
            assert_eq!(pml4.entries[0] & flags, flags);
            assert_eq!(pml4.entries[256] & flags, flags);
            assert_eq!(pml4.entries[511] & flags, flags);

            // Second GiB, first entry: 2 MiB huge page at 1 GiB.
            assert_eq!(
                pd_low[1].entries[0],
                0x4000_0000 | flags | PTE_HUGE_PAGE
            );

            // Kernel PTs walk the physical base in 4 KiB steps.
            assert_eq!(pt_kernel[0].entries[0], phys_base | flags);
            assert_eq!(pt_kernel[0].entries[1], (phys_base + 0x1000) | flags);
            assert_eq!(pt_kernel[1].entries[0], (phys_base + 0x20_0000) | flags);

            // The HHDM PDPT reuses the identity map's PDs.
            let pdpt_low = &*addr_of!(PDPT_LOW);
            let pdpt_hhdm = &*addr_of!(PDPT_HHDM);
            assert_eq!(pdpt_low.entries[..32], pdpt_hhdm.entries[..32]);
        }
    }
}
