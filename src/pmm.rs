//! Physical Memory Manager: one bit per 4 KiB page frame.
//!
//! The bitmap covers physical memory up to the highest usable byte reported
//! by the bootloader and lives inside the first usable region large enough
//! to hold it. Bit value 1 = used, 0 = free.

use limine::memory_map::{Entry, EntryType};
use spin::Mutex;

pub const PAGE_SIZE: u64 = 4096;

/// The bit-level core of the allocator. Kept separate from the memory-map
/// scan so it can run against plain buffers too.
pub struct Bitmap {
    bits: *mut u8,
    total_pages: u64,
    /// Next page index to try; freeing rewinds this for locality.
    hint: u64,
}

// The bitmap is only ever touched under the PMM lock.
unsafe impl Send for Bitmap {}

impl Bitmap {
    pub const fn empty() -> Self {
        Bitmap {
            bits: core::ptr::null_mut(),
            total_pages: 0,
            hint: 0,
        }
    }

    /// # Safety
    /// `bits` must point at `(total_pages / 8) + 1` writable bytes that stay
    /// valid for the bitmap's lifetime.
    pub unsafe fn new(bits: *mut u8, total_pages: u64) -> Self {
        Bitmap {
            bits,
            total_pages,
            hint: 0,
        }
    }

    fn set(&mut self, page: u64) {
        unsafe {
            let byte = self.bits.add((page / 8) as usize);
            *byte |= 1 << (page % 8);
        }
    }

    fn clear(&mut self, page: u64) {
        unsafe {
            let byte = self.bits.add((page / 8) as usize);
            *byte &= !(1 << (page % 8));
        }
    }

    fn test(&self, page: u64) -> bool {
        unsafe { *self.bits.add((page / 8) as usize) & (1 << (page % 8)) != 0 }
    }

    /// Allocate one page, scanning from the hint and wrapping once.
    /// Returns the physical address of the page.
    pub fn alloc_page(&mut self) -> Option<u64> {
        for page in self.hint..self.total_pages {
            if !self.test(page) {
                self.set(page);
                self.hint = page + 1;
                return Some(page * PAGE_SIZE);
            }
        }
        for page in 0..self.hint {
            if !self.test(page) {
                self.set(page);
                self.hint = page + 1;
                return Some(page * PAGE_SIZE);
            }
        }
        None
    }

    /// Free a previously allocated page and rewind the hint to it.
    /// Returns false when the page was already free.
    pub fn free_page(&mut self, addr: u64) -> bool {
        let page = addr / PAGE_SIZE;
        let was_used = self.test(page);
        self.clear(page);
        self.hint = page;
        was_used
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    pub fn is_used(&self, addr: u64) -> bool {
        self.test(addr / PAGE_SIZE)
    }
}

static PMM: Mutex<Bitmap> = Mutex::new(Bitmap::empty());

/// Build the bitmap from the bootloader memory map.
///
/// # Safety
/// The memory map entries must describe real physical memory, the identity
/// map must be active (the bitmap is written through physical addresses),
/// and this must be called exactly once before any allocation.
pub unsafe fn init(entries: &[&Entry]) {
    // Pass 1: highest usable byte determines how many pages the bitmap covers.
    let mut highest_address: u64 = 0;
    for entry in entries {
        if entry.entry_type == EntryType::USABLE {
            let top = entry.base + entry.length;
            if top > highest_address {
                highest_address = top;
            }
        }
    }

    let total_pages = highest_address / PAGE_SIZE;
    let bitmap_bytes = (total_pages / 8) + 1;

    // Pass 2: carve the bitmap out of the first usable region that fits it.
    let mut bits: *mut u8 = core::ptr::null_mut();
    for entry in entries {
        if entry.entry_type == EntryType::USABLE && entry.length >= bitmap_bytes {
            bits = entry.base as *mut u8;
            break;
        }
    }
    if bits.is_null() {
        crate::log_error!("PMM: no usable region large enough for the bitmap");
        return;
    }

    // Everything starts out used.
    core::ptr::write_bytes(bits, 0xFF, bitmap_bytes as usize);

    let mut bitmap = Bitmap::new(bits, total_pages);

    // Pass 3: free the page-aligned interior of every usable region.
    for entry in entries {
        if entry.entry_type == EntryType::USABLE {
            let base_page = (entry.base + PAGE_SIZE - 1) / PAGE_SIZE;
            let top_page = (entry.base + entry.length) / PAGE_SIZE;
            for page in base_page..top_page {
                bitmap.clear(page);
            }
        }
    }

    // Pass 4: the bitmap's own pages are in use.
    let bitmap_pages = (bitmap_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    let bitmap_base_page = bits as u64 / PAGE_SIZE;
    for page in bitmap_base_page..bitmap_base_page + bitmap_pages {
        bitmap.set(page);
    }

    crate::log!(
        "PMM initialised: {} pages tracked, bitmap {} bytes at {:#x}",
        total_pages,
        bitmap_bytes,
        bits as u64
    );

    *PMM.lock() = bitmap;
}

/// Allocate a single 4 KiB physical page.
pub fn alloc_page() -> Option<u64> {
    let page = PMM.lock().alloc_page();
    if page.is_none() {
        crate::log_error!("PMM: out of physical memory");
    }
    page
}

/// Free a previously allocated 4 KiB physical page.
pub fn free_page(addr: u64) {
    let mut pmm = PMM.lock();
    if addr / PAGE_SIZE >= pmm.total_pages() {
        crate::log_error!("PMM: free of out-of-range address {:#x}", addr);
        return;
    }
    if !pmm.free_page(addr) {
        crate::log_warn!("PMM: page {:#x} was already free", addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A bitmap over `pages` host-backed pages, all initially used, with the
    /// given ranges freed.
    fn bitmap_with_free(buf: &mut Vec<u8>, pages: u64, free: &[core::ops::Range<u64>]) -> Bitmap {
        buf.clear();
        buf.resize((pages / 8 + 1) as usize, 0xFF);
        let mut bm = unsafe { Bitmap::new(buf.as_mut_ptr(), pages) };
        for range in free {
            for page in range.clone() {
                bm.clear(page);
            }
        }
        bm
    }

    #[test]
    fn alloc_marks_and_advances() {
        let mut buf = Vec::new();
        let mut bm = bitmap_with_free(&mut buf, 64, &[8..16]);

        let p1 = bm.alloc_page().unwrap();
        assert_eq!(p1, 8 * PAGE_SIZE);
        assert!(bm.is_used(p1));

        let p2 = bm.alloc_page().unwrap();
        assert_eq!(p2, 9 * PAGE_SIZE);
    }

    #[test]
    fn free_rewinds_the_hint() {
        let mut buf = Vec::new();
        let mut bm = bitmap_with_free(&mut buf, 64, &[8..16]);

        let p1 = bm.alloc_page().unwrap();
        let _p2 = bm.alloc_page().unwrap();
        assert!(bm.free_page(p1));
        // The very next allocation reuses the page just freed.
        assert_eq!(bm.alloc_page().unwrap(), p1);
    }

    #[test]
    fn scan_wraps_once_and_exhausts() {
        let mut buf = Vec::new();
        let mut bm = bitmap_with_free(&mut buf, 16, &[2..4]);

        assert_eq!(bm.alloc_page().unwrap(), 2 * PAGE_SIZE);
        assert_eq!(bm.alloc_page().unwrap(), 3 * PAGE_SIZE);
        // Hint now sits past the last free page; the wrap finds nothing.
        assert_eq!(bm.alloc_page(), None);

        // Freeing behind the hint is still found thanks to the rewind.
        assert!(bm.free_page(2 * PAGE_SIZE));
        assert_eq!(bm.alloc_page().unwrap(), 2 * PAGE_SIZE);
    }

    #[test]
    fn double_free_reports() {
        let mut buf = Vec::new();
        let mut bm = bitmap_with_free(&mut buf, 16, &[0..4]);

        let p = bm.alloc_page().unwrap();
        assert!(bm.free_page(p));
        assert!(!bm.free_page(p));
    }
}
