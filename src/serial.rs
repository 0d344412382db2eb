// Serial port driver for COM1 (diagnostic sink)

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(COM1) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Initialize the serial port. It is lazily set up on first use; this just
/// forces that to happen before anything wants to log.
pub fn init() {
    #[cfg(not(test))]
    {
        let _ = SERIAL1.lock();
    }
}

#[doc(hidden)]
#[cfg(not(test))]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    // Interrupt handlers also log; masking here prevents a self-deadlock on
    // the port lock.
    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("serial write failed");
    });
}

// On the host the UART does not exist; tests route serial output to stdout.
#[doc(hidden)]
#[cfg(test)]
pub fn _serial_print(args: fmt::Arguments) {
    std::print!("{}", args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)))
}
