// PS/2 keyboard: scancode set 1, US layout, make codes only.

use spin::Mutex;
use x86_64::instructions::port::Port;

const DATA_PORT: u16 = 0x60;

/// Scancode set 1 make-code to ASCII translation.
/// Index is the scancode, value is the ASCII character (0 means no mapping).
static SCANCODE_TO_ASCII: [u8; 128] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, // 0x00-0x0E
    b'\t', b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', // 0x0F-0x1C
    0, b'a', b's', b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', // 0x1D-0x29
    0, b'\\', b'z', b'x', b'c', b'v', b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', // 0x2A-0x37
    0, b' ', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x38-0x46
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x47-0x56
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x57-0x66
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x67-0x76
    0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x77-0x7F
];

pub struct Keyboard {
    data_port: Port<u8>,
}

impl Keyboard {
    pub const fn new() -> Self {
        Keyboard {
            data_port: Port::new(DATA_PORT),
        }
    }

    fn read_scancode(&mut self) -> u8 {
        unsafe { self.data_port.read() }
    }
}

pub static KEYBOARD: Mutex<Keyboard> = Mutex::new(Keyboard::new());

/// Map a set-1 scancode to ASCII. Break codes (bit 7) and unmapped make
/// codes yield None. Modifier tracking is out of scope; the shell only
/// speaks lowercase.
fn scancode_to_char(scancode: u8) -> Option<u8> {
    if scancode & 0x80 != 0 {
        return None;
    }
    match SCANCODE_TO_ASCII[scancode as usize] {
        0 => None,
        c => Some(c),
    }
}

/// IRQ 1 path: read the scancode and drive the shell line discipline with
/// whatever it maps to. Runs with interrupts disabled.
pub fn handle_irq() {
    let scancode = KEYBOARD.lock().read_scancode();
    if let Some(c) = scancode_to_char(scancode) {
        crate::shell::on_char(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_codes_map_to_ascii() {
        assert_eq!(scancode_to_char(0x1E), Some(b'a'));
        assert_eq!(scancode_to_char(0x02), Some(b'1'));
        assert_eq!(scancode_to_char(0x39), Some(b' '));
        assert_eq!(scancode_to_char(0x1C), Some(b'\n'));
        assert_eq!(scancode_to_char(0x0E), Some(8));
    }

    #[test]
    fn break_codes_are_discarded() {
        // 'a' release
        assert_eq!(scancode_to_char(0x9E), None);
        assert_eq!(scancode_to_char(0xFF), None);
    }

    #[test]
    fn unmapped_codes_yield_nothing() {
        // Left shift make code has no ASCII value in this layout.
        assert_eq!(scancode_to_char(0x2A), None);
        assert_eq!(scancode_to_char(0x3B), None); // F1
    }
}
