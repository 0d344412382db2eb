//! Interrupt Descriptor Table, entry stubs and the high-level dispatcher.
//!
//! Every vector gets a gate. Exception vectors 0..=31 point at per-vector
//! stubs (the reserved holes 22..=27 share the default), 32..=47 carry the
//! remapped PIC lines, 0x80 is the syscall gate (DPL 3 so user mode may
//! raise it) and everything else falls through to the default stub.
//!
//! The stubs push a synthesised zero error code where the CPU does not push
//! one, push the vector number, save the general-purpose registers, switch
//! to the kernel data selectors and call `isr_dispatch` with a pointer to
//! the frame. The dispatcher returns the stack pointer to resume on, which
//! is how the scheduler swaps tasks: hand back a different task's saved
//! frame and the `iretq` completes the switch.

use core::arch::global_asm;
use core::mem::size_of;
use core::ptr::addr_of;

/// The register frame the stubs build on the kernel stack. The layout is
/// ABI between the assembly below and everything that consumes frames; the
/// const assertion pins it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Pushed by the per-vector stub.
    pub int_no: u64,
    /// Pushed by the CPU for the faults that carry one, synthesised as zero
    /// otherwise.
    pub err_code: u64,
    // Pushed by the CPU on interrupt entry.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(size_of::<Registers>() == 22 * 8);

impl Registers {
    pub const ZERO: Registers = Registers {
        r15: 0,
        r14: 0,
        r13: 0,
        r12: 0,
        r11: 0,
        r10: 0,
        r9: 0,
        r8: 0,
        rbp: 0,
        rdi: 0,
        rsi: 0,
        rdx: 0,
        rcx: 0,
        rbx: 0,
        rax: 0,
        int_no: 0,
        err_code: 0,
        rip: 0,
        cs: 0,
        rflags: 0,
        rsp: 0,
        ss: 0,
    };
}

/// 64-bit IDT gate descriptor (16 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attributes: u8,
    offset_mid: u16,
    offset_high: u32,
    zero: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attributes: 0,
            offset_mid: 0,
            offset_high: 0,
            zero: 0,
        }
    }

    fn new(handler: u64, attr: u8) -> Self {
        IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector: crate::gdt::KERNEL_CODE_SELECTOR,
            ist: 0,
            type_attributes: attr,
            offset_mid: ((handler >> 16) & 0xFFFF) as u16,
            offset_high: ((handler >> 32) & 0xFFFF_FFFF) as u32,
            zero: 0,
        }
    }
}

/// IDT pointer for the lidt instruction (limit u16, base u64)
#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

// P=1, DPL=0, 64-bit interrupt gate
const GATE_INTERRUPT: u8 = 0x8E;
// P=1, DPL=3, 64-bit interrupt gate: lets user mode issue `int 0x80`
const GATE_SYSCALL: u8 = 0xEE;

static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];
static mut IDT_PTR: IdtPointer = IdtPointer { limit: 0, base: 0 };

// ---------------------------------------------------------------------------
// Entry stubs
// ---------------------------------------------------------------------------

/// Exception stub for a vector where the CPU pushes no error code.
macro_rules! isr_stub {
    ($name:ident, $vec:literal) => {
        global_asm!(concat!(
            ".global ",
            stringify!($name),
            "\n",
            stringify!($name),
            ":\n",
            "    push 0\n",
            "    push ",
            stringify!($vec),
            "\n",
            "    jmp isr_common\n",
        ));
        extern "C" {
            fn $name();
        }
    };
}

/// Exception stub for a vector where the CPU already pushed an error code.
macro_rules! isr_stub_err {
    ($name:ident, $vec:literal) => {
        global_asm!(concat!(
            ".global ",
            stringify!($name),
            "\n",
            stringify!($name),
            ":\n",
            "    push ",
            stringify!($vec),
            "\n",
            "    jmp isr_common\n",
        ));
        extern "C" {
            fn $name();
        }
    };
}

isr_stub!(isr_stub_0, 0);
isr_stub!(isr_stub_1, 1);
isr_stub!(isr_stub_2, 2);
isr_stub!(isr_stub_3, 3);
isr_stub!(isr_stub_4, 4);
isr_stub!(isr_stub_5, 5);
isr_stub!(isr_stub_6, 6);
isr_stub!(isr_stub_7, 7);
isr_stub_err!(isr_stub_8, 8);
isr_stub!(isr_stub_9, 9);
isr_stub_err!(isr_stub_10, 10);
isr_stub_err!(isr_stub_11, 11);
isr_stub_err!(isr_stub_12, 12);
isr_stub_err!(isr_stub_13, 13);
isr_stub_err!(isr_stub_14, 14);
isr_stub!(isr_stub_15, 15);
isr_stub!(isr_stub_16, 16);
isr_stub_err!(isr_stub_17, 17);
isr_stub!(isr_stub_18, 18);
isr_stub!(isr_stub_19, 19);
isr_stub!(isr_stub_20, 20);
isr_stub!(isr_stub_21, 21);
// 22..=27 are reserved; they share the default stub.
isr_stub!(isr_stub_28, 28);
isr_stub!(isr_stub_29, 29);
isr_stub_err!(isr_stub_30, 30);
isr_stub!(isr_stub_31, 31);

isr_stub!(irq_stub_32, 32);
isr_stub!(irq_stub_33, 33);
isr_stub!(irq_stub_34, 34);
isr_stub!(irq_stub_35, 35);
isr_stub!(irq_stub_36, 36);
isr_stub!(irq_stub_37, 37);
isr_stub!(irq_stub_38, 38);
isr_stub!(irq_stub_39, 39);
isr_stub!(irq_stub_40, 40);
isr_stub!(irq_stub_41, 41);
isr_stub!(irq_stub_42, 42);
isr_stub!(irq_stub_43, 43);
isr_stub!(irq_stub_44, 44);
isr_stub!(irq_stub_45, 45);
isr_stub!(irq_stub_46, 46);
isr_stub!(irq_stub_47, 47);

isr_stub!(isr_stub_128, 128);
isr_stub!(isr_stub_default, 255);

// The shared tail: save GP registers in the frame order, load kernel data
// selectors, call the dispatcher, resume on whatever stack it returns.
global_asm!(
    r#"
.global isr_common
isr_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    cld
    mov rdi, rsp
    call isr_dispatch
    mov rsp, rax
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    iretq
"#
);

// Per-vector exception stubs; the reserved holes fall back to the default.
static ISR_STUBS: [Option<unsafe extern "C" fn()>; 32] = [
    Some(isr_stub_0),
    Some(isr_stub_1),
    Some(isr_stub_2),
    Some(isr_stub_3),
    Some(isr_stub_4),
    Some(isr_stub_5),
    Some(isr_stub_6),
    Some(isr_stub_7),
    Some(isr_stub_8),
    Some(isr_stub_9),
    Some(isr_stub_10),
    Some(isr_stub_11),
    Some(isr_stub_12),
    Some(isr_stub_13),
    Some(isr_stub_14),
    Some(isr_stub_15),
    Some(isr_stub_16),
    Some(isr_stub_17),
    Some(isr_stub_18),
    Some(isr_stub_19),
    Some(isr_stub_20),
    Some(isr_stub_21),
    None,
    None,
    None,
    None,
    None,
    None,
    Some(isr_stub_28),
    Some(isr_stub_29),
    Some(isr_stub_30),
    Some(isr_stub_31),
];

static IRQ_STUBS: [unsafe extern "C" fn(); 16] = [
    irq_stub_32,
    irq_stub_33,
    irq_stub_34,
    irq_stub_35,
    irq_stub_36,
    irq_stub_37,
    irq_stub_38,
    irq_stub_39,
    irq_stub_40,
    irq_stub_41,
    irq_stub_42,
    irq_stub_43,
    irq_stub_44,
    irq_stub_45,
    irq_stub_46,
    irq_stub_47,
];

/// Point `vector` at `handler` with the given type/attribute byte.
///
/// # Safety
/// Rewrites live interrupt plumbing; the handler must follow the stub ABI.
pub unsafe fn set_gate(vector: u8, handler: u64, attr: u8) {
    let idt = &mut *core::ptr::addr_of_mut!(IDT);
    idt[vector as usize] = IdtEntry::new(handler, attr);
}

/// Populate all 256 gates and load the IDT. Interrupts stay disabled.
///
/// # Safety
/// Must only be called once during kernel initialization.
pub unsafe fn init() {
    for vector in 0..32u8 {
        match ISR_STUBS[vector as usize] {
            Some(stub) => set_gate(vector, stub as usize as u64, GATE_INTERRUPT),
            None => set_gate(vector, isr_stub_default as usize as u64, GATE_INTERRUPT),
        }
    }

    for irq in 0..16u8 {
        set_gate(32 + irq, IRQ_STUBS[irq as usize] as usize as u64, GATE_INTERRUPT);
    }

    for vector in 48..=255u8 {
        set_gate(vector, isr_stub_default as usize as u64, GATE_INTERRUPT);
    }

    // DPL=3 so `int 0x80` is legal from ring 3 once user mode exists.
    set_gate(0x80, isr_stub_128 as usize as u64, GATE_SYSCALL);

    let ptr = &mut *core::ptr::addr_of_mut!(IDT_PTR);
    ptr.limit = (size_of::<[IdtEntry; 256]>() - 1) as u16;
    ptr.base = addr_of!(IDT) as u64;

    core::arch::asm!(
        "lidt [{}]",
        in(reg) core::ptr::addr_of!(IDT_PTR),
        options(nostack, preserves_flags)
    );

    crate::log!("IDT loaded");
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

static EXCEPTION_NAMES: [&str; 32] = [
    "Divide Error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point",
    "Virtualization",
    "Control Protection",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection",
    "VMM Communication",
    "Security Exception",
    "Reserved",
];

/// CPU exceptions are fatal: report on serial and halt for good.
fn exception(regs: &Registers) -> ! {
    let name = EXCEPTION_NAMES
        .get(regs.int_no as usize)
        .copied()
        .unwrap_or("Unknown");
    crate::log_error!(
        "Exception triggered: {} (vector {}) error code {:#x} rip {:#x}",
        name,
        regs.int_no,
        regs.err_code,
        regs.rip
    );
    if regs.int_no == 14 {
        crate::log_error!("Page fault address: {:#x}", x86_64::registers::control::Cr2::read_raw());
    }
    crate::log_error!("System halted");
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

/// High-level interrupt dispatcher, called by `isr_common` with a pointer
/// to the frame it pushed. The returned value is loaded into RSP before the
/// registers are restored, so returning a different frame switches tasks.
#[no_mangle]
extern "C" fn isr_dispatch(frame: *mut Registers) -> u64 {
    let regs = unsafe { &mut *frame };

    match regs.int_no {
        0..=31 => exception(regs),
        32 => {
            let new_rsp = crate::task::schedule(frame);
            crate::pic::send_eoi(0);
            return new_rsp;
        }
        33 => {
            crate::keyboard::handle_irq();
            crate::pic::send_eoi(1);
        }
        34..=47 => {
            let irq = (regs.int_no - 32) as u8;
            crate::log_warn!("Unhandled IRQ {}", irq);
            crate::pic::send_eoi(irq);
        }
        0x80 => crate::syscall::handle(regs),
        other => crate::log_warn!("Unexpected interrupt vector {}", other),
    }

    frame as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_frame_is_abi_sized() {
        assert_eq!(size_of::<Registers>(), 176);
        // The CPU-pushed tail starts right after err_code.
        assert_eq!(core::mem::offset_of!(Registers, int_no), 15 * 8);
        assert_eq!(core::mem::offset_of!(Registers, rip), 17 * 8);
        assert_eq!(core::mem::offset_of!(Registers, ss), 21 * 8);
    }

    #[test]
    fn gate_packs_the_offset() {
        let entry = IdtEntry::new(0xFFFF_8000_DEAD_BEEF, GATE_INTERRUPT);
        let (low, mid, high) = (entry.offset_low, entry.offset_mid, entry.offset_high);
        assert_eq!(low, 0xBEEF);
        assert_eq!(mid, 0xDEAD);
        assert_eq!(high, 0xFFFF_8000);
        let (selector, attr, ist) = (entry.selector, entry.type_attributes, entry.ist);
        assert_eq!(selector, 0x08);
        assert_eq!(attr, 0x8E);
        assert_eq!(ist, 0);
        assert_eq!(size_of::<IdtEntry>(), 16);
    }

    #[test]
    fn syscall_gate_is_user_reachable() {
        assert_eq!(GATE_SYSCALL & 0x60, 0x60); // DPL 3
        assert_eq!(GATE_SYSCALL & 0x0F, 0x0E); // 64-bit interrupt gate
        assert_eq!(GATE_INTERRUPT & 0x60, 0x00);
    }

    #[test]
    fn reserved_vectors_share_the_default_stub() {
        for vector in 22..=27 {
            assert!(ISR_STUBS[vector].is_none());
        }
        assert_eq!(ISR_STUBS.iter().filter(|s| s.is_some()).count(), 26);
    }
}
