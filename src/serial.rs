use crate::arch::Port;
use lazy_static::lazy_static;
use spin::Mutex;

pub struct SerialPort {
    data: Port,
    int_en: Port,
    fifo_ctrl: Port,
    line_ctrl: Port,
    modem_ctrl: Port,
    line_sts: Port,
}

impl SerialPort {
    pub const fn new(base: u16) -> SerialPort {
        SerialPort {
            data: Port::new(base),
            int_en: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_sts: Port::new(base + 5),
        }
    }

    pub fn init(&mut self) {
        self.int_en.write(0x00);
        self.line_ctrl.write(0x80);
        self.data.write(0x03);
        self.int_en.write(0x00);
        self.line_ctrl.write(0x03);
        self.fifo_ctrl.write(0xC7);
        self.modem_ctrl.write(0x0B);
    }

    fn wait_for_tx_empty(&mut self) {
        while (self.line_sts.read() & 0x20) == 0 {}
    }

    pub fn send(&mut self, data: u8) {
        self.wait_for_tx_empty();
        self.data.write(data);
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = SerialPort::new(0x3F8);
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = SERIAL1.lock().write_fmt(args);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        {
            $crate::serial::_print(format_args!("[INFO] "));
            $crate::serial::_print(format_args!($($arg)*));
            $crate::serial::_print(format_args!("\n"));
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        {
            $crate::serial::_print(format_args!("[WARN] "));
            $crate::serial::_print(format_args!($($arg)*));
            $crate::serial::_print(format_args!("\n"));
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        {
            $crate::serial::_print(format_args!("[ERROR] "));
            $crate::serial::_print(format_args!($($arg)*));
            $crate::serial::_print(format_args!("\n"));
        }
    };
}

pub fn init() {
    let _ = SERIAL1.lock();
}
