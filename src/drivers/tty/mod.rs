//! Console line discipline. Output and input are each guarded by a kernel
//! mutex; readline holds the input mutex across all of its readchar calls so
//! a line is atomic against other readers.

use alloc::vec::Vec;

use crate::drivers::keyboard;
use crate::sync::Mutex;
use crate::vga::{self, ColorCode};

static CONSOLE_OUT: Mutex = Mutex::new();
static CONSOLE_IN: Mutex = Mutex::new();

pub fn init() {
    crate::log_info!("Console tty initialized.");
}

/// The `print` syscall body: bytes to the screen, atomically.
pub fn print(bytes: &[u8]) {
    CONSOLE_OUT.lock();
    vga::WRITER.lock().put_bytes(bytes);
    CONSOLE_OUT.unlock();
}

pub fn set_term_color(color: u8) {
    CONSOLE_OUT.lock();
    vga::WRITER.lock().set_color(ColorCode::from_byte(color));
    CONSOLE_OUT.unlock();
}

/// One raw byte, no echo.
pub fn getchar() -> u8 {
    CONSOLE_IN.lock();
    let byte = keyboard::readchar();
    CONSOLE_IN.unlock();
    byte
}

/// What a line-editor keystroke does to the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Echo {
    None,
    Byte(u8),
    Rubout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    Pending,
    Done,
}

/// Pure line-editing state: bytes accumulate until newline or the size
/// limit. Backspace erases the youngest byte; against an empty buffer it is
/// swallowed with no echo at all, so the cursor never moves.
struct LineBuffer {
    bytes: Vec<u8>,
    limit: usize,
}

impl LineBuffer {
    fn new(limit: usize) -> LineBuffer {
        LineBuffer {
            bytes: Vec::new(),
            limit,
        }
    }

    fn feed(&mut self, byte: u8) -> (Echo, LineStatus) {
        match byte {
            0x08 => {
                if self.bytes.pop().is_some() {
                    (Echo::Rubout, LineStatus::Pending)
                } else {
                    (Echo::None, LineStatus::Pending)
                }
            }
            b'\n' => {
                self.bytes.push(b'\n');
                let status = LineStatus::Done;
                (Echo::Byte(b'\n'), status)
            }
            byte => {
                self.bytes.push(byte);
                let status = if self.bytes.len() >= self.limit {
                    LineStatus::Done
                } else {
                    LineStatus::Pending
                };
                (Echo::Byte(byte), status)
            }
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// The `readline` syscall body: echoing line input, at most `size` bytes,
/// terminated by newline (stored) or a full buffer.
pub fn readline(size: usize) -> Vec<u8> {
    CONSOLE_IN.lock();
    let mut line = LineBuffer::new(size);
    loop {
        let byte = keyboard::readchar();
        let (echo, status) = line.feed(byte);
        match echo {
            Echo::None => {}
            Echo::Byte(b) => {
                CONSOLE_OUT.lock();
                vga::WRITER.lock().put_bytes(&[b]);
                CONSOLE_OUT.unlock();
            }
            Echo::Rubout => {
                CONSOLE_OUT.lock();
                vga::WRITER.lock().backspace();
                CONSOLE_OUT.unlock();
            }
        }
        if status == LineStatus::Done {
            break;
        }
    }
    CONSOLE_IN.unlock();
    line.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(limit: usize, input: &[u8]) -> (Vec<u8>, Vec<Echo>) {
        let mut line = LineBuffer::new(limit);
        let mut echoes = Vec::new();
        for &b in input {
            let (echo, status) = line.feed(b);
            echoes.push(echo);
            if status == LineStatus::Done {
                break;
            }
        }
        (line.into_bytes(), echoes)
    }

    #[test]
    fn simple_line_keeps_newline() {
        let (bytes, _) = run(80, b"hi\n");
        assert_eq!(bytes, b"hi\n");
    }

    #[test]
    fn backspace_erases_one_byte() {
        let (bytes, echoes) = run(80, b"hix\x08\n");
        assert_eq!(bytes, b"hi\n");
        assert_eq!(echoes[3], Echo::Rubout);
    }

    #[test]
    fn backspace_on_empty_buffer_is_silent() {
        let (bytes, echoes) = run(80, b"\x08\x08a\n");
        assert_eq!(bytes, b"a\n");
        assert_eq!(echoes[0], Echo::None);
        assert_eq!(echoes[1], Echo::None);
    }

    #[test]
    fn buffer_fills_at_limit_without_newline() {
        let (bytes, _) = run(3, b"abcdef\n");
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn newline_counts_toward_the_limit() {
        let (bytes, _) = run(3, b"ab\n");
        assert_eq!(bytes, b"ab\n");
    }
}
