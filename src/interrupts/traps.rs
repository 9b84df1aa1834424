//! Trap entry and exit. Every interrupt, exception and system call funnels
//! through a per-vector stub that normalizes the kernel stack into one
//! `TrapFrame` layout and calls the typed dispatcher. The frame sits at a
//! known spot (the top of the thread's kernel stack for ring-3 entries), so
//! fork can copy it and swexn can rewrite it.

use super::idt::{KEYBOARD_VECTOR, TIMER_VECTOR};

/// The register frame the stubs build. Field order mirrors the push
/// sequence: CPU frame at the high end, `pushad` block and segment registers
/// below. `user_esp`/`user_ss` exist only when the trap came from ring 3.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

/// Size of a ring-3 trap frame, everything included.
pub const TRAP_FRAME_SIZE: usize = core::mem::size_of::<TrapFrame>();

impl TrapFrame {
    pub fn from_user_mode(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// Typed dispatch, called from the common stub with a pointer to the frame
/// it just built.
pub extern "C" fn trap_dispatch(frame: *mut TrapFrame) {
    let frame = unsafe { &mut *frame };
    match frame.vector as u8 {
        TIMER_VECTOR => crate::scheduler::timer_tick(frame),
        KEYBOARD_VECTOR => crate::drivers::keyboard::handle_irq(),
        0..=19 => crate::exceptions::handle(frame),
        vector if crate::syscalls::is_syscall_vector(vector) => {
            crate::syscalls::dispatch(frame)
        }
        vector => {
            crate::log_warn!("spurious trap, vector {}", vector);
        }
    }
}

#[cfg(target_arch = "x86")]
mod stubs {
    use super::super::gdt::KERNEL_DS;
    use super::trap_dispatch;
    use core::arch::naked_asm;

    /// Finish building the frame, run the dispatcher, unwind, `iret`.
    #[unsafe(naked)]
    pub extern "C" fn trap_common() {
        naked_asm!(
            "pushad",
            "push ds",
            "push es",
            "push fs",
            "push gs",
            "mov eax, {kds}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "push esp",
            "call {dispatch}",
            "add esp, 4",
            "pop gs",
            "pop fs",
            "pop es",
            "pop ds",
            "popad",
            "add esp, 8",
            "iretd",
            kds = const KERNEL_DS as u32,
            dispatch = sym trap_dispatch,
        );
    }

    /// First switch into a forked thread lands here: unwind the copied trap
    /// frame but hand the child 0 in eax. Lives beside the normal exit path
    /// so the two unwind sequences cannot drift apart.
    #[unsafe(naked)]
    pub extern "C" fn fork_child_return() {
        naked_asm!(
            "pop gs",
            "pop fs",
            "pop es",
            "pop ds",
            "popad",
            "xor eax, eax",
            "add esp, 8",
            "iretd",
        );
    }

    macro_rules! trap_stub {
        ($name:ident, $vector:expr) => {
            #[unsafe(naked)]
            pub extern "C" fn $name() {
                naked_asm!(
                    "push 0",
                    "push {vector}",
                    "jmp {common}",
                    vector = const $vector as u32,
                    common = sym trap_common,
                );
            }
        };
    }

    /// For the exceptions where the CPU already pushed an error code.
    macro_rules! trap_stub_errcode {
        ($name:ident, $vector:expr) => {
            #[unsafe(naked)]
            pub extern "C" fn $name() {
                naked_asm!(
                    "push {vector}",
                    "jmp {common}",
                    vector = const $vector as u32,
                    common = sym trap_common,
                );
            }
        };
    }

    trap_stub!(exc_divide_error, 0);
    trap_stub!(exc_debug, 1);
    trap_stub!(exc_nmi, 2);
    trap_stub!(exc_breakpoint, 3);
    trap_stub!(exc_overflow, 4);
    trap_stub!(exc_bound_range, 5);
    trap_stub!(exc_invalid_opcode, 6);
    trap_stub!(exc_device_not_available, 7);
    trap_stub_errcode!(exc_double_fault, 8);
    trap_stub_errcode!(exc_invalid_tss, 10);
    trap_stub_errcode!(exc_segment_not_present, 11);
    trap_stub_errcode!(exc_stack_fault, 12);
    trap_stub_errcode!(exc_general_protection, 13);
    trap_stub_errcode!(exc_page_fault, 14);
    trap_stub!(exc_fpu_error, 16);
    trap_stub_errcode!(exc_alignment_check, 17);
    trap_stub!(exc_machine_check, 18);
    trap_stub!(exc_simd_error, 19);

    trap_stub!(irq_timer, 32);
    trap_stub!(irq_keyboard, 33);

    use crate::syscalls::numbers::*;

    trap_stub!(sys_fork, FORK);
    trap_stub!(sys_exec, EXEC);
    trap_stub!(sys_wait, WAIT);
    trap_stub!(sys_yield, YIELD);
    trap_stub!(sys_deschedule, DESCHEDULE);
    trap_stub!(sys_make_runnable, MAKE_RUNNABLE);
    trap_stub!(sys_gettid, GETTID);
    trap_stub!(sys_new_pages, NEW_PAGES);
    trap_stub!(sys_remove_pages, REMOVE_PAGES);
    trap_stub!(sys_sleep, SLEEP);
    trap_stub!(sys_getchar, GETCHAR);
    trap_stub!(sys_readline, READLINE);
    trap_stub!(sys_print, PRINT);
    trap_stub!(sys_set_term_color, SET_TERM_COLOR);
    trap_stub!(sys_set_cursor_pos, SET_CURSOR_POS);
    trap_stub!(sys_get_cursor_pos, GET_CURSOR_POS);
    trap_stub!(sys_thread_fork, THREAD_FORK);
    trap_stub!(sys_get_ticks, GET_TICKS);
    trap_stub!(sys_halt, HALT);
    trap_stub!(sys_set_status, SET_STATUS);
    trap_stub!(sys_vanish, VANISH);
    trap_stub!(sys_readfile, READFILE);
    trap_stub!(sys_swexn, SWEXN);

    pub fn exception_stubs() -> [(u8, usize); 18] {
        [
            (0, exc_divide_error as usize),
            (1, exc_debug as usize),
            (2, exc_nmi as usize),
            (3, exc_breakpoint as usize),
            (4, exc_overflow as usize),
            (5, exc_bound_range as usize),
            (6, exc_invalid_opcode as usize),
            (7, exc_device_not_available as usize),
            (8, exc_double_fault as usize),
            (10, exc_invalid_tss as usize),
            (11, exc_segment_not_present as usize),
            (12, exc_stack_fault as usize),
            (13, exc_general_protection as usize),
            (14, exc_page_fault as usize),
            (16, exc_fpu_error as usize),
            (17, exc_alignment_check as usize),
            (18, exc_machine_check as usize),
            (19, exc_simd_error as usize),
        ]
    }

    pub fn syscall_stubs() -> [(u8, usize); 23] {
        [
            (FORK, sys_fork as usize),
            (EXEC, sys_exec as usize),
            (WAIT, sys_wait as usize),
            (YIELD, sys_yield as usize),
            (DESCHEDULE, sys_deschedule as usize),
            (MAKE_RUNNABLE, sys_make_runnable as usize),
            (GETTID, sys_gettid as usize),
            (NEW_PAGES, sys_new_pages as usize),
            (REMOVE_PAGES, sys_remove_pages as usize),
            (SLEEP, sys_sleep as usize),
            (GETCHAR, sys_getchar as usize),
            (READLINE, sys_readline as usize),
            (PRINT, sys_print as usize),
            (SET_TERM_COLOR, sys_set_term_color as usize),
            (SET_CURSOR_POS, sys_set_cursor_pos as usize),
            (GET_CURSOR_POS, sys_get_cursor_pos as usize),
            (THREAD_FORK, sys_thread_fork as usize),
            (GET_TICKS, sys_get_ticks as usize),
            (HALT, sys_halt as usize),
            (SET_STATUS, sys_set_status as usize),
            (VANISH, sys_vanish as usize),
            (READFILE, sys_readfile as usize),
            (SWEXN, sys_swexn as usize),
        ]
    }

    pub fn timer_stub() -> usize {
        irq_timer as usize
    }

    pub fn keyboard_stub() -> usize {
        irq_keyboard as usize
    }

    pub fn fork_child_return_addr() -> usize {
        fork_child_return as usize
    }
}

#[cfg(not(target_arch = "x86"))]
mod stubs {
    pub fn exception_stubs() -> [(u8, usize); 0] {
        []
    }
    pub fn syscall_stubs() -> [(u8, usize); 0] {
        []
    }
    pub fn timer_stub() -> usize {
        0
    }
    pub fn keyboard_stub() -> usize {
        0
    }
    pub fn fork_child_return_addr() -> usize {
        0
    }
}

pub use stubs::{
    exception_stubs, fork_child_return_addr, keyboard_stub, syscall_stubs, timer_stub,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_push_order() {
        assert_eq!(TRAP_FRAME_SIZE, 19 * 4);
        assert_eq!(core::mem::offset_of!(TrapFrame, gs), 0);
        assert_eq!(core::mem::offset_of!(TrapFrame, edi), 16);
        assert_eq!(core::mem::offset_of!(TrapFrame, eax), 44);
        assert_eq!(core::mem::offset_of!(TrapFrame, vector), 48);
        assert_eq!(core::mem::offset_of!(TrapFrame, eip), 56);
        assert_eq!(core::mem::offset_of!(TrapFrame, user_ss), 72);
    }

    #[test]
    fn ring_detection() {
        let mut frame = unsafe { core::mem::zeroed::<TrapFrame>() };
        frame.cs = 0x1B;
        assert!(frame.from_user_mode());
        frame.cs = 0x08;
        assert!(!frame.from_user_mode());
    }
}
