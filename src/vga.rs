//! VGA text-mode console: 80x25 character cells at 0xb8000, hardware cursor
//! via the CRT controller ports. Backs the print/readline/cursor syscalls.

use crate::arch::Port;
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use volatile::Volatile;

pub const BUFFER_HEIGHT: usize = 25;
pub const BUFFER_WIDTH: usize = 80;

const VGA_BUFFER_ADDR: usize = 0xb8000;
const CRTC_INDEX: u16 = 0x3D4;
const CRTC_DATA: u16 = 0x3D5;
const CRTC_CURSOR_HIGH: u8 = 0x0E;
const CRTC_CURSOR_LOW: u8 = 0x0F;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// Foreground/background attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    pub const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode((background as u8) << 4 | (foreground as u8))
    }

    pub const fn from_byte(byte: u8) -> ColorCode {
        ColorCode(byte)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

#[repr(transparent)]
struct Buffer {
    chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    row: usize,
    column: usize,
    color_code: ColorCode,
    buffer: &'static mut Buffer,
    cursor_index: Port,
    cursor_data: Port,
}

impl Writer {
    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            b'\r' => self.column = 0,
            byte => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }
                let color_code = self.color_code;
                self.buffer.chars[self.row][self.column].write(ScreenChar {
                    ascii_character: byte,
                    color_code,
                });
                self.column += 1;
            }
        }
        self.update_hw_cursor();
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' | b'\r' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    /// Raw byte output for the `print` syscall; non-printables other than
    /// newline/carriage-return render as the box glyph.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match byte {
                0x20..=0x7e | b'\n' | b'\r' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    /// Erase the character before the cursor and step back over it.
    pub fn backspace(&mut self) {
        if self.column > 0 {
            self.column -= 1;
        } else if self.row > 0 {
            self.row -= 1;
            self.column = BUFFER_WIDTH - 1;
        } else {
            return;
        }
        let color_code = self.color_code;
        self.buffer.chars[self.row][self.column].write(ScreenChar {
            ascii_character: b' ',
            color_code,
        });
        self.update_hw_cursor();
    }

    fn new_line(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
            return;
        }
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let character = self.buffer.chars[row][col].read();
                self.buffer.chars[row - 1][col].write(character);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            self.buffer.chars[row][col].write(blank);
        }
    }

    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.row = 0;
        self.column = 0;
        self.update_hw_cursor();
    }

    pub fn set_color(&mut self, color: ColorCode) {
        self.color_code = color;
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.column)
    }

    pub fn set_cursor(&mut self, row: usize, column: usize) -> bool {
        if row >= BUFFER_HEIGHT || column >= BUFFER_WIDTH {
            return false;
        }
        self.row = row;
        self.column = column;
        self.update_hw_cursor();
        true
    }

    fn update_hw_cursor(&mut self) {
        let position = (self.row * BUFFER_WIDTH + self.column) as u16;
        self.cursor_index.write(CRTC_CURSOR_HIGH);
        self.cursor_data.write((position >> 8) as u8);
        self.cursor_index.write(CRTC_CURSOR_LOW);
        self.cursor_data.write((position & 0xFF) as u8);
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        row: 0,
        column: 0,
        color_code: ColorCode::new(Color::LightGray, Color::Black),
        buffer: unsafe { &mut *(VGA_BUFFER_ADDR as *mut Buffer) },
        cursor_index: Port::new(CRTC_INDEX),
        cursor_data: Port::new(CRTC_DATA),
    });
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::vga::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    crate::arch::without_interrupts(|| {
        let _ = WRITER.lock().write_fmt(args);
    });
}

pub fn init() {
    WRITER.lock().clear();
}
