// Global Descriptor Table for x86_64 long mode.
//
// Long mode still demands a valid GDT to establish a 64-bit code segment and
// legal data selectors; this one carries the minimum three descriptors.

use core::mem::size_of;

/// GDT Entry - 8 bytes each
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    pub const fn null() -> Self {
        GdtEntry {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    pub const fn new(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_middle: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: ((limit >> 16) & 0x0F) as u8 | (granularity & 0xF0),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

/// GDT pointer structure for the lgdt instruction (limit u16, base u64)
#[repr(C, packed)]
pub struct GdtPointer {
    limit: u16,
    base: u64,
}

// Access byte flags
const PRESENT: u8 = 1 << 7;
const DPL_RING0: u8 = 0 << 5;
const DESCRIPTOR: u8 = 1 << 4;
const EXECUTABLE: u8 = 1 << 3;
const READ_WRITE: u8 = 1 << 1;

// Granularity byte flags
const LONG_MODE: u8 = 1 << 5;
const GRANULARITY_4K: u8 = 1 << 7;

// Kernel code segment: Present, Ring 0, Executable, Readable, Long mode
const KERNEL_CODE_ACCESS: u8 = PRESENT | DPL_RING0 | DESCRIPTOR | EXECUTABLE | READ_WRITE;
const KERNEL_CODE_FLAGS: u8 = LONG_MODE | GRANULARITY_4K;

// Kernel data segment: Present, Ring 0, Writable
const KERNEL_DATA_ACCESS: u8 = PRESENT | DPL_RING0 | DESCRIPTOR | READ_WRITE;
const KERNEL_DATA_FLAGS: u8 = GRANULARITY_4K;

/// The GDT with entries:
/// 0: Null descriptor (required)
/// 1: Kernel code segment (0x08)
/// 2: Kernel data segment (0x10)
#[repr(C, align(8))]
struct Gdt {
    null: GdtEntry,
    kernel_code: GdtEntry,
    kernel_data: GdtEntry,
}

static mut GDT: Gdt = Gdt {
    null: GdtEntry::null(),
    kernel_code: GdtEntry::new(0, 0xFFFFF, KERNEL_CODE_ACCESS, KERNEL_CODE_FLAGS),
    kernel_data: GdtEntry::new(0, 0xFFFFF, KERNEL_DATA_ACCESS, KERNEL_DATA_FLAGS),
};

static mut GDT_PTR: GdtPointer = GdtPointer { limit: 0, base: 0 };

/// Initialize and load the GDT, then reload every segment register.
///
/// # Safety
/// Must only be called once during kernel initialization; it executes
/// privileged CPU instructions and rewrites the segment registers.
pub unsafe fn init() {
    GDT_PTR.limit = (size_of::<Gdt>() - 1) as u16;
    GDT_PTR.base = &raw const GDT as u64;

    core::arch::asm!(
        "lgdt [{}]",
        in(reg) &raw const GDT_PTR,
        options(nostack, preserves_flags)
    );

    // CS can only be reloaded with a far return; the data selectors follow
    // with plain moves.
    core::arch::asm!(
        "push 0x08",
        "lea rax, [rip + 2f]",
        "push rax",
        "retfq",
        "2:",
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "mov ss, ax",
        out("rax") _,
    );

    crate::log!("GDT loaded");
}

/// Segment selectors for use elsewhere in the kernel
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
#[allow(dead_code)]
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_packing() {
        // Flat 4 GiB code descriptor: limit 0xFFFFF with 4K granularity.
        let code = GdtEntry::new(0, 0xFFFFF, KERNEL_CODE_ACCESS, KERNEL_CODE_FLAGS);
        let (limit_low, granularity, access) = (code.limit_low, code.granularity, code.access);
        assert_eq!(limit_low, 0xFFFF);
        assert_eq!(granularity & 0x0F, 0x0F);
        // Long-mode flag set, 32-bit size flag clear.
        assert_eq!(granularity & 0xF0, LONG_MODE | GRANULARITY_4K);
        assert_eq!(access, 0x9A);

        let data = GdtEntry::new(0, 0xFFFFF, KERNEL_DATA_ACCESS, KERNEL_DATA_FLAGS);
        let data_access = data.access;
        assert_eq!(data_access, 0x92);
    }

    #[test]
    fn table_layout() {
        assert_eq!(size_of::<GdtEntry>(), 8);
        assert_eq!(size_of::<Gdt>(), 24);
        assert_eq!(size_of::<GdtPointer>(), 10);
    }
}
