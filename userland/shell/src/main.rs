//! A line-at-a-time shell: read a program name, fork, exec it in the child,
//! wait for it, report the status.

#![no_std]
#![no_main]

ulib::entry!(main);

const PROMPT: &str = "quartz$ ";

fn main(_argc: i32, _argv: *const *const u8) -> i32 {
    let mut line = [0u8; 80];
    loop {
        ulib::puts(PROMPT);
        let len = ulib::readline(&mut line);
        if len <= 1 {
            continue;
        }
        // Strip the stored newline and terminate.
        let end = len as usize - 1;
        line[end] = 0;

        let pid = ulib::fork();
        if pid < 0 {
            ulib::puts("shell: fork failed\n");
            continue;
        }
        if pid == 0 {
            let argv: [*const u8; 2] = [line.as_ptr(), core::ptr::null()];
            ulib::exec(line.as_ptr(), argv.as_ptr());
            ulib::puts("shell: exec failed\n");
            ulib::set_status(-1);
            ulib::vanish();
        }

        let mut status = 0;
        if ulib::wait(&mut status) >= 0 && status != 0 {
            ulib::puts("shell: child exited nonzero\n");
        }
    }
}
