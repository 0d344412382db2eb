//! System call gate: `int 0x80`.
//!
//! Convention: number in RAX, arguments in RDI/RSI/RDX, result back in RAX.
//! Unknown numbers return -1.

use crate::idt::Registers;

pub const SYS_WRITE: u64 = 0;

const STDOUT: u64 = 1;
const ERR: u64 = u64::MAX;

/// Dispatch a syscall frame. The stub restores every register from the
/// frame, so writing `rax` here is how the return value reaches the caller.
pub fn handle(regs: &mut Registers) {
    let ret = match regs.rax {
        SYS_WRITE => sys_write(regs.rdi, regs.rsi, regs.rdx),
        other => {
            crate::log_warn!("Unknown syscall number {}", other);
            ERR
        }
    };
    regs.rax = ret;
}

/// write(fd, buf, len): fd 1 goes to the framebuffer console, mirrored to
/// serial. Returns the number of bytes written.
fn sys_write(fd: u64, buf: u64, len: u64) -> u64 {
    if fd != STDOUT || buf == 0 {
        return ERR;
    }

    let bytes = unsafe { core::slice::from_raw_parts(buf as *const u8, len as usize) };
    crate::framebuffer::write_bytes(bytes);

    crate::serial_print!(
        "[syscall] write(1, {:?}, {})\n",
        core::str::from_utf8(bytes).unwrap_or("<non-utf8>"),
        len
    );

    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(rax: u64, rdi: u64, rsi: u64, rdx: u64) -> Registers {
        let mut regs = Registers::ZERO;
        regs.rax = rax;
        regs.rdi = rdi;
        regs.rsi = rsi;
        regs.rdx = rdx;
        regs
    }

    #[test]
    fn write_returns_the_byte_count() {
        let msg = b"hi";
        let mut regs = frame(SYS_WRITE, 1, msg.as_ptr() as u64, msg.len() as u64);
        handle(&mut regs);
        assert_eq!(regs.rax, 2);
    }

    #[test]
    fn unknown_numbers_return_minus_one() {
        let mut regs = frame(99, 0, 0, 0);
        handle(&mut regs);
        assert_eq!(regs.rax, u64::MAX);
    }

    #[test]
    fn bad_fd_and_null_buffer_are_rejected() {
        let msg = b"hi";
        let mut regs = frame(SYS_WRITE, 2, msg.as_ptr() as u64, msg.len() as u64);
        handle(&mut regs);
        assert_eq!(regs.rax, u64::MAX);

        let mut regs = frame(SYS_WRITE, 1, 0, 4);
        handle(&mut regs);
        assert_eq!(regs.rax, u64::MAX);
    }

    #[test]
    fn zero_length_write_is_fine() {
        let msg = b"x";
        let mut regs = frame(SYS_WRITE, 1, msg.as_ptr() as u64, 0);
        handle(&mut regs);
        assert_eq!(regs.rax, 0);
    }
}
