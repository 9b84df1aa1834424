//! The idle loop. The scheduler runs this thread when nothing else is
//! runnable; it gives the CPU back on every slice.

#![no_std]
#![no_main]

ulib::entry!(main);

fn main(_argc: i32, _argv: *const *const u8) -> i32 {
    loop {
        ulib::yield_to(-1);
    }
}
