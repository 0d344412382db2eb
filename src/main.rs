//! ferrum: a small x86_64 long-mode kernel booted via the Limine protocol.
//!
//! Boot order is leaves first: serial, GDT, IDT, PIC, then the bootloader
//! responses are validated before virtual memory, the physical allocator,
//! the heap, the console, tasking, the timer and the shell come up. The
//! boot CPU then idles; the first timer tick hands control to the
//! scheduler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

extern crate alloc;

mod framebuffer;
mod font;
mod gdt;
mod heap;
mod idt;
mod keyboard;
mod logger;
mod pic;
mod pit;
mod pmm;
mod serial;
mod shell;
mod syscall;
mod tar;
mod task;
mod vmm;

use limine::request::{
    FramebufferRequest, KernelAddressRequest, MemoryMapRequest, ModuleRequest,
    RequestsEndMarker, RequestsStartMarker,
};
use limine::BaseRevision;

// ---------------------------------------------------------------------------
// Limine protocol requests
// ---------------------------------------------------------------------------

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

/// The first module is the initrd tar archive.
#[used]
#[link_section = ".requests"]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Disable interrupts and halt forever.
pub fn hcf() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Kernel entry point, called by Limine in long mode with interrupts
/// disabled.
#[no_mangle]
pub unsafe extern "C" fn kmain() -> ! {
    serial::init();
    serial_println!("ferrum kernel v0.1.0");

    if !BASE_REVISION.is_supported() {
        hcf();
    }

    // CPU control tables first; interrupts stay off until the very end.
    gdt::init();
    idt::init();
    pic::init();

    // Everything after this point depends on the bootloader having answered.
    let Some(fb_response) = FRAMEBUFFER_REQUEST.get_response() else {
        log_error!("Boot: no framebuffer response");
        hcf();
    };
    let Some(fb) = fb_response.framebuffers().next() else {
        log_error!("Boot: framebuffer list is empty");
        hcf();
    };
    let Some(kaddr) = KERNEL_ADDRESS_REQUEST.get_response() else {
        log_error!("Boot: no kernel address response");
        hcf();
    };
    let Some(memmap) = MEMORY_MAP_REQUEST.get_response() else {
        log_error!("Boot: no memory map response");
        hcf();
    };
    let Some(initrd) = MODULE_REQUEST
        .get_response()
        .and_then(|response| response.modules().first().copied())
    else {
        log_error!("Boot: no initrd module");
        hcf();
    };

    // Memory: page tables, then the physical allocator over them, then the
    // heap on top of that.
    vmm::init(kaddr.physical_base(), kaddr.virtual_base());
    pmm::init(memmap.entries());
    heap::init();

    framebuffer::init(framebuffer::FramebufferInfo {
        addr: fb.addr() as *mut u32,
        width: fb.width() as usize,
        height: fb.height() as usize,
        pitch: fb.pitch() as usize,
    });

    task::init();
    pit::init(pit::TIMER_HZ);
    tar::init(initrd.addr() as *const u8);

    shell::init();
    log!("Boot complete, enabling interrupts");
    x86_64::instructions::interrupts::enable();

    // The first timer tick takes it from here.
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log_error!("KERNEL PANIC: {}", info);
    hcf()
}

// Host builds (cargo test and friends) get a throwaway entry point.
#[cfg(not(target_os = "none"))]
fn main() {}
