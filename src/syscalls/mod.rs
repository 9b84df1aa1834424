//! System call surface: fixed trap vectors, the dispatcher, and the thin
//! per-call handlers. The convention is the one the user library is built
//! against: the vector number selects the call, `esi` carries the argument
//! (or a pointer to an argument packet), `eax` returns the result, negative
//! values are errors from the stable catalogue.

pub mod error;
pub mod validate;

use error::{KernelError, KernelResult};
use validate::{
    check_buffer, check_string, check_string_array, check_word, read_user_packet,
    write_user_u32,
};

use crate::drivers::{timer, tty};
use crate::interrupts::traps::TrapFrame;
use crate::loader::ramdisk;
use crate::memory::PAGE_SIZE;
use crate::scheduler::{self, lifecycle};
use crate::vga;

/// Trap vector per call. ABI; the user library hardcodes these.
pub mod numbers {
    pub const FORK: u8 = 0x41;
    pub const EXEC: u8 = 0x42;
    pub const WAIT: u8 = 0x44;
    pub const YIELD: u8 = 0x45;
    pub const DESCHEDULE: u8 = 0x46;
    pub const MAKE_RUNNABLE: u8 = 0x47;
    pub const GETTID: u8 = 0x48;
    pub const NEW_PAGES: u8 = 0x49;
    pub const REMOVE_PAGES: u8 = 0x4A;
    pub const SLEEP: u8 = 0x4B;
    pub const GETCHAR: u8 = 0x4C;
    pub const READLINE: u8 = 0x4D;
    pub const PRINT: u8 = 0x4E;
    pub const SET_TERM_COLOR: u8 = 0x4F;
    pub const SET_CURSOR_POS: u8 = 0x50;
    pub const GET_CURSOR_POS: u8 = 0x51;
    pub const THREAD_FORK: u8 = 0x52;
    pub const GET_TICKS: u8 = 0x53;
    pub const HALT: u8 = 0x55;
    pub const SET_STATUS: u8 = 0x59;
    pub const VANISH: u8 = 0x5A;
    pub const READFILE: u8 = 0x5C;
    pub const SWEXN: u8 = 0x5E;
}

pub fn is_syscall_vector(vector: u8) -> bool {
    use numbers::*;
    matches!(
        vector,
        FORK | EXEC
            | WAIT
            | YIELD
            | DESCHEDULE
            | MAKE_RUNNABLE
            | GETTID
            | NEW_PAGES
            | REMOVE_PAGES
            | SLEEP
            | GETCHAR
            | READLINE
            | PRINT
            | SET_TERM_COLOR
            | SET_CURSOR_POS
            | GET_CURSOR_POS
            | THREAD_FORK
            | GET_TICKS
            | HALT
            | SET_STATUS
            | VANISH
            | READFILE
            | SWEXN
    )
}

pub fn init() {
    crate::log_info!("Syscall interface initialized.");
}

/// Central dispatcher, called from the trap path with the caller's register
/// frame. Calls that suspend do so through the scheduler and come back here;
/// calls that never return (exec, vanish, halt) leave through their own
/// paths.
pub fn dispatch(frame: &mut TrapFrame) {
    use numbers::*;

    let arg = frame.esi as usize;
    let result: KernelResult<i32> = match frame.vector as u8 {
        GETTID => Ok(scheduler::current_thread().tid),
        FORK => lifecycle::fork(frame).map(|tid| tid as i32),
        THREAD_FORK => lifecycle::thread_fork(frame).map(|tid| tid as i32),
        EXEC => sys_exec(arg),
        WAIT => sys_wait(arg),
        VANISH => lifecycle::vanish(),
        SET_STATUS => {
            lifecycle::set_status(arg as i32);
            Ok(0)
        }
        YIELD => scheduler::yield_to_tid(arg as i32).map(|_| 0),
        DESCHEDULE => sys_deschedule(arg),
        MAKE_RUNNABLE => scheduler::make_runnable(arg as i32).map(|_| 0),
        SLEEP => sys_sleep(arg as i32),
        GET_TICKS => Ok(timer::get_ticks() as i32),
        NEW_PAGES => sys_new_pages(arg),
        REMOVE_PAGES => lifecycle::remove_pages(arg).map(|_| 0),
        GETCHAR => Ok(tty::getchar() as i32),
        READLINE => sys_readline(arg),
        PRINT => sys_print(arg),
        SET_TERM_COLOR => sys_set_term_color(arg),
        SET_CURSOR_POS => sys_set_cursor_pos(arg),
        GET_CURSOR_POS => sys_get_cursor_pos(arg),
        HALT => crate::halt(),
        READFILE => sys_readfile(arg),
        SWEXN => crate::exceptions::swexn(frame, arg),
        vector => {
            crate::log_warn!("syscall: unknown vector {:#x}", vector);
            Err(KernelError::InvalidArg)
        }
    };

    frame.eax = match result {
        Ok(value) => value as u32,
        Err(e) => e.code() as u32,
    };
}

/// exec packet: `{ name*, argv** }`. Arguments are materialized into kernel
/// memory before the address space is touched.
fn sys_exec(arg: usize) -> KernelResult<i32> {
    let [name_ptr, argv_ptr] = read_user_packet::<2>(arg)?;
    let name = check_string(name_ptr as usize)?;
    let argv = check_string_array(argv_ptr as usize)?;
    // Returns only on failure.
    Err(lifecycle::exec(name, argv))
}

fn sys_wait(status_ptr: usize) -> KernelResult<i32> {
    if status_ptr != 0 {
        check_word(status_ptr, true)?;
    }
    let (original_tid, status) = lifecycle::wait()?;
    if status_ptr != 0 {
        write_user_u32(status_ptr, status as u32)?;
    }
    Ok(original_tid)
}

fn sys_deschedule(flag_ptr: usize) -> KernelResult<i32> {
    check_word(flag_ptr, false)?;
    scheduler::deschedule(flag_ptr as *const i32)?;
    Ok(0)
}

fn sys_sleep(ticks: i32) -> KernelResult<i32> {
    if ticks < 0 {
        return Err(KernelError::InvalidArg);
    }
    scheduler::sleep(ticks as u32);
    Ok(0)
}

/// new_pages packet: `{ base, len }`.
fn sys_new_pages(arg: usize) -> KernelResult<i32> {
    let [base, len] = read_user_packet::<2>(arg)?;
    lifecycle::new_pages(base as usize, len as usize)?;
    Ok(0)
}

/// readline packet: `{ size, buf* }`.
fn sys_readline(arg: usize) -> KernelResult<i32> {
    let [size, buf] = read_user_packet::<2>(arg)?;
    let size = size as usize;
    if size == 0 || size > validate::MAX_STRING {
        return Err(KernelError::InvalidArg);
    }
    check_buffer(buf as usize, size, true)?;
    let line = tty::readline(size);
    validate::copy_to_user(buf as usize, &line)?;
    Ok(line.len() as i32)
}

/// print packet: `{ size, buf* }`.
fn sys_print(arg: usize) -> KernelResult<i32> {
    let [size, buf] = read_user_packet::<2>(arg)?;
    let size = size as usize;
    if size > PAGE_SIZE {
        return Err(KernelError::InvalidArg);
    }
    let bytes = validate::copy_from_user(buf as usize, size)?;
    tty::print(&bytes);
    Ok(0)
}

fn sys_set_term_color(color: usize) -> KernelResult<i32> {
    if color > 0xFF {
        return Err(KernelError::InvalidArg);
    }
    tty::set_term_color(color as u8);
    Ok(0)
}

/// set_cursor_pos packet: `{ row, col }`.
fn sys_set_cursor_pos(arg: usize) -> KernelResult<i32> {
    let [row, col] = read_user_packet::<2>(arg)?;
    if vga::WRITER.lock().set_cursor(row as usize, col as usize) {
        Ok(0)
    } else {
        Err(KernelError::InvalidArg)
    }
}

/// get_cursor_pos packet: `{ row*, col* }`.
fn sys_get_cursor_pos(arg: usize) -> KernelResult<i32> {
    let [row_ptr, col_ptr] = read_user_packet::<2>(arg)?;
    let (row, col) = vga::WRITER.lock().cursor();
    write_user_u32(row_ptr as usize, row as u32)?;
    write_user_u32(col_ptr as usize, col as u32)?;
    Ok(0)
}

/// readfile packet: `{ name*, buf*, count, offset }`.
fn sys_readfile(arg: usize) -> KernelResult<i32> {
    let [name_ptr, buf, count, offset] = read_user_packet::<4>(arg)?;
    let name = check_string(name_ptr as usize)?;
    let count = count as usize;
    check_buffer(buf as usize, count, true)?;
    let file = ramdisk::lookup(&name).ok_or(KernelError::NotFound)?;
    let offset = offset as usize;
    if offset > file.len() {
        return Err(KernelError::InvalidArg);
    }
    let chunk = &file[offset..core::cmp::min(offset + count, file.len())];
    validate::copy_to_user(buf as usize, chunk)?;
    Ok(chunk.len() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_documented_vector_dispatches() {
        use numbers::*;
        for vector in [
            FORK, EXEC, WAIT, YIELD, DESCHEDULE, MAKE_RUNNABLE, GETTID, NEW_PAGES,
            REMOVE_PAGES, SLEEP, GETCHAR, READLINE, PRINT, SET_TERM_COLOR,
            SET_CURSOR_POS, GET_CURSOR_POS, THREAD_FORK, GET_TICKS, HALT, SET_STATUS,
            VANISH, READFILE, SWEXN,
        ] {
            assert!(is_syscall_vector(vector), "vector {:#x}", vector);
        }
        assert!(!is_syscall_vector(0x40));
        assert!(!is_syscall_vector(0x60));
        assert!(!is_syscall_vector(0x20));
    }

    #[test]
    fn vectors_are_unique() {
        use numbers::*;
        let all = [
            FORK, EXEC, WAIT, YIELD, DESCHEDULE, MAKE_RUNNABLE, GETTID, NEW_PAGES,
            REMOVE_PAGES, SLEEP, GETCHAR, READLINE, PRINT, SET_TERM_COLOR,
            SET_CURSOR_POS, GET_CURSOR_POS, THREAD_FORK, GET_TICKS, HALT, SET_STATUS,
            VANISH, READFILE, SWEXN,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
