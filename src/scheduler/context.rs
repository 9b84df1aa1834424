//! Kernel-stack switching. A suspended thread's stack top holds a small
//! fixed frame (resume address, callee-saved registers, eflags); its TCB
//! holds the stack pointer. Resuming is `mov esp` + `ret`.
//!
//! Fork children and boot-spawned kernel threads never suspended, so their
//! frames are forged by hand to make the first switch look like a resume.

use super::task::Thread;
use crate::interrupts::traps::{self, TrapFrame, TRAP_FRAME_SIZE};

#[cfg(target_arch = "x86")]
mod imp {
    use core::arch::naked_asm;

    /// Save the caller's frame, park its stack pointer in `*save_slot`, and
    /// resume the thread whose stack pointer is `new_esp`.
    ///
    /// The save and resume sides live in one assembly body: the resume label
    /// is part of the saved frame, so nothing may move between them.
    ///
    /// # Safety
    /// Interrupts must be off. `new_esp` must point at a frame built by this
    /// function or forged to match it.
    #[unsafe(naked)]
    pub unsafe extern "cdecl" fn switch_stacks(save_slot: *mut u32, new_esp: u32) {
        naked_asm!(
            "mov eax, [esp + 4]",
            "mov edx, [esp + 8]",
            "pushfd",
            "push ebp",
            "push ebx",
            "push esi",
            "push edi",
            "lea ecx, [2f]",
            "push ecx",
            "mov [eax], esp",
            "mov esp, edx",
            "ret",
            "2:",
            "pop edi",
            "pop esi",
            "pop ebx",
            "pop ebp",
            "popfd",
            "ret",
        );
    }

    /// Resume `new_esp` without saving anything; the current stack is dead
    /// (vanish, and the one-way hop off the boot stack).
    ///
    /// # Safety
    /// As `switch_stacks`; the caller must never be resumed.
    #[unsafe(naked)]
    pub unsafe extern "cdecl" fn switch_discard(new_esp: u32) -> ! {
        naked_asm!("mov esp, [esp + 4]", "ret");
    }
}

#[cfg(not(target_arch = "x86"))]
mod imp {
    pub unsafe extern "C" fn switch_stacks(_save_slot: *mut u32, _new_esp: u32) {
        unreachable!("IA-32 only");
    }
    pub unsafe extern "C" fn switch_discard(_new_esp: u32) -> ! {
        unreachable!("IA-32 only");
    }
}

pub use imp::{switch_discard, switch_stacks};

/// Build a forked thread's kernel stack: the parent's trap frame at the top,
/// and below it a resume address pointing at the child-return stub, which
/// unwinds the copied frame with eax forced to 0.
pub fn forge_fork_stack(child: &Thread, parent_frame: &TrapFrame) {
    unsafe {
        let frame_addr = child.esp0 as usize - TRAP_FRAME_SIZE;
        core::ptr::write(frame_addr as *mut TrapFrame, *parent_frame);

        let resume_slot = frame_addr - core::mem::size_of::<u32>();
        core::ptr::write(resume_slot as *mut u32, traps::fork_child_return_addr() as u32);
        child.set_esp(resume_slot as u32);
    }
}

/// Build a kernel-thread stack whose first dispatch "returns" straight into
/// `entry`. Used for the boot (god) process and boot-spawned children before
/// their first exec.
pub fn forge_kernel_stack(thread: &Thread, entry: extern "C" fn() -> !) {
    unsafe {
        let resume_slot = thread.esp0 as usize - core::mem::size_of::<u32>();
        core::ptr::write(resume_slot as *mut u32, entry as usize as u32);
        thread.set_esp(resume_slot as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::PageDirectory;
    use crate::scheduler::task::Process;
    use alloc::sync::Weak;

    fn test_thread() -> alloc::sync::Arc<Thread> {
        let dir = PageDirectory::new().unwrap();
        let process = Process::new(Weak::new(), dir);
        Thread::new(process)
    }

    #[test]
    fn forged_fork_stack_layout() {
        let thread = test_thread();
        let mut frame = unsafe { core::mem::zeroed::<TrapFrame>() };
        frame.eax = 0xdead_beef;
        frame.eip = 0x0100_0040;
        frame.user_esp = 0xFFFF_DF00;
        forge_fork_stack(&thread, &frame);

        let esp = thread.esp() as usize;
        assert_eq!(esp, thread.esp0 as usize - TRAP_FRAME_SIZE - 4);
        let copied = unsafe { &*((esp + 4) as *const TrapFrame) };
        assert_eq!(copied.eip, 0x0100_0040);
        assert_eq!(copied.user_esp, 0xFFFF_DF00);
    }

    #[test]
    fn forged_kernel_stack_points_at_entry() {
        extern "C" fn never() -> ! {
            unreachable!()
        }
        let thread = test_thread();
        forge_kernel_stack(&thread, never);
        let esp = thread.esp() as usize;
        let resume = unsafe { *(esp as *const u32) };
        assert_eq!(resume, never as usize as u32);
        assert_eq!(esp, thread.esp0 as usize - 4);
    }
}
