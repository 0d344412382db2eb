// Legacy 8259 PIC pair, remapped so the IRQs land clear of the CPU
// exception vectors.

use spin::Mutex;
use x86_64::instructions::port::Port;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// End-of-interrupt command
const PIC_EOI: u8 = 0x20;

/// IRQs 0..15 are delivered on vectors 32..47.
pub const PIC_VECTOR_OFFSET: u8 = 32;

pub struct Pic {
    pic1_command: Port<u8>,
    pic1_data: Port<u8>,
    pic2_command: Port<u8>,
    pic2_data: Port<u8>,
    wait_port: Port<u8>,
}

impl Pic {
    pub const fn new() -> Self {
        Pic {
            pic1_command: Port::new(PIC1_COMMAND),
            pic1_data: Port::new(PIC1_DATA),
            pic2_command: Port::new(PIC2_COMMAND),
            pic2_data: Port::new(PIC2_DATA),
            wait_port: Port::new(0x80),
        }
    }

    /// The PICs need a moment between initialization words on old hardware.
    fn io_wait(&mut self) {
        unsafe { self.wait_port.write(0) };
    }

    /// Remap the PICs to vectors 32..47 and mask every line except the
    /// timer (IRQ 0) and keyboard (IRQ 1).
    pub fn remap_and_init(&mut self) {
        unsafe {
            // ICW1: start initialization, expect ICW4
            self.pic1_command.write(0x11);
            self.io_wait();
            self.pic2_command.write(0x11);
            self.io_wait();

            // ICW2: vector offsets
            self.pic1_data.write(PIC_VECTOR_OFFSET);
            self.io_wait();
            self.pic2_data.write(PIC_VECTOR_OFFSET + 8);
            self.io_wait();

            // ICW3: master has a slave on IRQ 2; slave's cascade identity is 2
            self.pic1_data.write(4);
            self.io_wait();
            self.pic2_data.write(2);
            self.io_wait();

            // ICW4: 8086 mode
            self.pic1_data.write(0x01);
            self.io_wait();
            self.pic2_data.write(0x01);
            self.io_wait();

            // Mask everything, then unmask timer and keyboard only.
            self.pic1_data.write(0xFF);
            self.pic2_data.write(0xFF);
            self.pic1_data.write(0xFC);
        }
    }

    /// Acknowledge a serviced IRQ. The slave needs its own EOI for lines
    /// 8..15; the master always gets one.
    pub fn send_eoi(&mut self, irq: u8) {
        unsafe {
            if irq >= 8 {
                self.pic2_command.write(PIC_EOI);
            }
            self.pic1_command.write(PIC_EOI);
        }
    }
}

pub static PIC: Mutex<Pic> = Mutex::new(Pic::new());

/// Remap and mask the PIC pair. Interrupts must still be disabled.
pub fn init() {
    PIC.lock().remap_and_init();
    crate::log!("PIC remapped to vectors 32..47");
}

pub fn send_eoi(irq: u8) {
    PIC.lock().send_eoi(irq);
}
