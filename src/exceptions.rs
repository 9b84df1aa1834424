//! Exception policy. Page faults get a repair attempt (ZFOD upgrade, COW
//! duplication) first. Everything else, including any unrepairable page
//! fault, goes down one delivery path: a registered swexn handler if the
//! fault came from user code, otherwise death (thread kill for user faults,
//! kernel panic for kernel ones).

use crate::arch;
use crate::interrupts::gdt::{USER_CS, USER_DS};
use crate::interrupts::traps::TrapFrame;
use crate::memory::paging::{self, FaultOutcome};
use crate::scheduler::{self, lifecycle, task::SwexnHandler};
use crate::syscalls::error::{KernelError, KernelResult};
use crate::syscalls::validate;

const VEC_PAGE_FAULT: u32 = 14;

/// The register snapshot handed to a swexn handler, youngest field first on
/// its stack. Layout is ABI shared with the user library.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UserRegs {
    pub cause: u32,
    pub cr2: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub zero: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

pub const UREG_SIZE: usize = core::mem::size_of::<UserRegs>();

fn snapshot(frame: &TrapFrame, cause: u32, cr2: u32) -> UserRegs {
    UserRegs {
        cause,
        cr2,
        ds: frame.ds,
        es: frame.es,
        fs: frame.fs,
        gs: frame.gs,
        edi: frame.edi,
        esi: frame.esi,
        ebp: frame.ebp,
        zero: 0,
        ebx: frame.ebx,
        edx: frame.edx,
        ecx: frame.ecx,
        eax: frame.eax,
        error_code: frame.error_code,
        eip: frame.eip,
        cs: frame.cs,
        eflags: frame.eflags,
        esp: frame.user_esp,
        ss: frame.user_ss,
    }
}

/// Entry point for vectors 0..=19.
pub fn handle(frame: &mut TrapFrame) {
    if frame.vector == VEC_PAGE_FAULT {
        let fault_va = arch::read_cr2() as usize;
        if paging::repair_fault(fault_va) == FaultOutcome::Repaired {
            return;
        }
        if !frame.from_user_mode() {
            kernel_fault(frame, Some(fault_va));
        }
        deliver_or_die(frame, VEC_PAGE_FAULT, fault_va as u32);
        return;
    }

    if !frame.from_user_mode() {
        kernel_fault(frame, None);
    }
    deliver_or_die(frame, frame.vector, 0);
}

/// A fault in kernel mode means a kernel bug: every kernel access to user
/// memory is pre-validated.
fn kernel_fault(frame: &TrapFrame, fault_va: Option<usize>) -> ! {
    match fault_va {
        Some(va) => panic!(
            "kernel page fault at {:#010x} (eip {:#010x}, error {:#x})",
            va, frame.eip, frame.error_code
        ),
        None => panic!(
            "kernel exception {} (eip {:#010x}, error {:#x})",
            frame.vector, frame.eip, frame.error_code
        ),
    }
}

/// Hand the exception to the thread's swexn handler; with none registered
/// (or an unusable handler stack), the thread dies with status -2.
fn deliver_or_die(frame: &mut TrapFrame, cause: u32, cr2: u32) {
    if deliver_to_handler(frame, cause, cr2) {
        return;
    }
    crate::log_warn!(
        "unhandled user exception {} at eip {:#010x} (tid {})",
        cause,
        frame.eip,
        scheduler::current_thread().tid
    );
    lifecycle::thread_panic(KernelError::Fault.code());
}

/// One-shot delivery: deregister, build the ureg snapshot and the argument
/// triple on the handler stack, and retarget the interrupted frame at the
/// handler. Returns false if no handler is registered or its stack is bad.
fn deliver_to_handler(frame: &mut TrapFrame, cause: u32, cr2: u32) -> bool {
    let thread = scheduler::current_thread();
    let Some(handler) = thread.swexn.take() else {
        return false;
    };

    let ureg_addr = match (handler.esp3 as usize).checked_sub(UREG_SIZE) {
        Some(addr) => addr,
        None => return false,
    };
    // Argument triple below the snapshot: fake return address, the
    // registered argument, a pointer to the snapshot.
    let args_addr = match ureg_addr.checked_sub(12) {
        Some(addr) => addr,
        None => return false,
    };
    if validate::check_buffer(args_addr, UREG_SIZE + 12, true).is_err() {
        return false;
    }

    let ureg = snapshot(frame, cause, cr2);
    unsafe {
        core::ptr::write(ureg_addr as *mut UserRegs, ureg);
        core::ptr::write(args_addr as *mut u32, 0);
        core::ptr::write((args_addr + 4) as *mut u32, handler.arg);
        core::ptr::write((args_addr + 8) as *mut u32, ureg_addr as u32);
    }

    frame.eip = handler.eip;
    frame.user_esp = args_addr as u32;
    frame.eflags = arch::USER_EFLAGS;
    true
}

/// The swexn system call. Packet: `{ esp3, eip, arg, newureg* }`. Null esp3
/// or eip deregisters; a non-null newureg replaces the interrupted register
/// state, under segment and eflags sanity rules.
pub fn swexn(frame: &mut TrapFrame, arg: usize) -> KernelResult<i32> {
    let [esp3, eip, handler_arg, newureg] = validate::read_user_packet::<4>(arg)?;
    let thread = scheduler::current_thread();

    // Validate the replacement registers fully before committing anything.
    let replacement = if newureg != 0 {
        let ureg = read_newureg(newureg as usize, frame)?;
        Some(ureg)
    } else {
        None
    };

    if esp3 == 0 || eip == 0 {
        thread.swexn.set(None);
    } else {
        validate::check_buffer(eip as usize, 1, false)?;
        if (esp3 as usize) < UREG_SIZE + 12 {
            return Err(KernelError::InvalidArg);
        }
        thread.swexn.set(Some(SwexnHandler {
            esp3,
            eip,
            arg: handler_arg,
        }));
    }

    if let Some(ureg) = replacement {
        apply_newureg(frame, &ureg);
        // The adopted eax is what the interrupted context will see.
        return Ok(ureg.eax as i32);
    }
    Ok(0)
}

/// Copy and vet a user-supplied register set: user segments only, and an
/// eflags delta confined to the arithmetic/direction bits.
fn read_newureg(addr: usize, frame: &TrapFrame) -> KernelResult<UserRegs> {
    validate::check_buffer(addr, UREG_SIZE, false)?;
    let ureg = unsafe { core::ptr::read(addr as *const UserRegs) };

    if ureg.cs != USER_CS as u32 || ureg.ss != USER_DS as u32 {
        return Err(KernelError::InvalidArg);
    }
    for seg in [ureg.ds, ureg.es, ureg.fs, ureg.gs] {
        if seg != USER_DS as u32 {
            return Err(KernelError::InvalidArg);
        }
    }
    let changed = ureg.eflags ^ frame.eflags;
    if changed & !arch::USER_EFLAGS_MODIFIABLE != 0 {
        return Err(KernelError::InvalidArg);
    }
    Ok(ureg)
}

fn apply_newureg(frame: &mut TrapFrame, ureg: &UserRegs) {
    frame.ds = ureg.ds;
    frame.es = ureg.es;
    frame.fs = ureg.fs;
    frame.gs = ureg.gs;
    frame.edi = ureg.edi;
    frame.esi = ureg.esi;
    frame.ebp = ureg.ebp;
    frame.ebx = ureg.ebx;
    frame.edx = ureg.edx;
    frame.ecx = ureg.ecx;
    frame.eax = ureg.eax;
    frame.eip = ureg.eip;
    frame.eflags = ureg.eflags;
    frame.user_esp = ureg.esp;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ureg_layout_is_twenty_words() {
        assert_eq!(UREG_SIZE, 20 * 4);
        assert_eq!(core::mem::offset_of!(UserRegs, cause), 0);
        assert_eq!(core::mem::offset_of!(UserRegs, eip), 60);
        assert_eq!(core::mem::offset_of!(UserRegs, ss), 76);
    }

    #[test]
    fn snapshot_carries_frame_state() {
        let mut frame = unsafe { core::mem::zeroed::<TrapFrame>() };
        frame.eax = 7;
        frame.eip = 0x0100_0000;
        frame.user_esp = 0xFFBF_F000;
        frame.eflags = 0x202;
        let ureg = snapshot(&frame, 14, 0xdead_0000);
        assert_eq!(ureg.cause, 14);
        assert_eq!(ureg.cr2, 0xdead_0000);
        assert_eq!(ureg.eax, 7);
        assert_eq!(ureg.esp, 0xFFBF_F000);
        assert_eq!(ureg.zero, 0);
    }

    #[test]
    fn eflags_delta_mask_blocks_privileged_bits() {
        // Flipping IF must be rejected; flipping ZF must not.
        let iff = crate::arch::EFlags::INTERRUPT.bits();
        let zf = crate::arch::EFlags::ZERO.bits();
        assert_ne!(iff & !arch::USER_EFLAGS_MODIFIABLE, 0);
        assert_eq!(zf & !arch::USER_EFLAGS_MODIFIABLE, 0);
    }
}
