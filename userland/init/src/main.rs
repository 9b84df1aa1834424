//! init: the orphan reaper. Every process whose parent vanished first gets
//! reparented here, so this loop's wait() eventually buries it.

#![no_std]
#![no_main]

ulib::entry!(main);

fn main(_argc: i32, _argv: *const *const u8) -> i32 {
    loop {
        let mut status = 0;
        if ulib::wait(&mut status) < 0 {
            // Nothing to reap right now.
            ulib::sleep(50);
        }
    }
}
