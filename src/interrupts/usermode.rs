//! Ring 3 entry. Builds an `iret` frame with user segment selectors and
//! jumps; used to start every exec'd image and to deliver swexn handlers.

#[cfg(target_arch = "x86")]
pub fn enter_user_mode(entry: u32, user_stack: u32) -> ! {
    use super::gdt::{USER_CS, USER_DS};
    use crate::arch::USER_EFLAGS;
    use core::arch::asm;

    unsafe {
        asm!(
            "cli",
            "mov ds, {seg:x}",
            "mov es, {seg:x}",
            "mov fs, {seg:x}",
            "mov gs, {seg:x}",
            "push {uds}",    // ss
            "push {esp3}",   // esp
            "push {eflags}", // IF set: interrupts come back on in user mode
            "push {ucs}",    // cs
            "push {eip}",    // eip
            "iretd",
            seg = in(reg) USER_DS as u32,
            uds = const USER_DS as u32,
            ucs = const USER_CS as u32,
            eflags = const USER_EFLAGS,
            esp3 = in(reg) user_stack,
            eip = in(reg) entry,
            options(noreturn),
        );
    }
}

#[cfg(not(target_arch = "x86"))]
pub fn enter_user_mode(_entry: u32, _user_stack: u32) -> ! {
    unreachable!("IA-32 only");
}
