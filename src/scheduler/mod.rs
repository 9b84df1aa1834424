//! The scheduler: a runnable FIFO (head = executing thread), a wake-ordered
//! sleeping list, per-process waiting lists (owned by the PCBs), and an
//! implicit blocked set reachable only through the tid table. All list
//! surgery happens with interrupts off under one spinlock; the do-not-switch
//! flag additionally vetoes timer preemption across multi-step sections that
//! run with interrupts enabled.

pub mod context;
pub mod lifecycle;
pub mod task;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, MutexGuard};

use crate::arch;
use crate::drivers::timer;
use crate::interrupts::gdt;
use crate::interrupts::idt::{self, TIMER_VECTOR};
use crate::interrupts::traps::TrapFrame;
use crate::syscalls::error::{KernelError, KernelResult};
use task::{Process, Thread, ThreadState, Tid};

pub use task::{lookup_thread, ProcessState};

pub struct Scheduler {
    /// The executing thread. Conceptually the head of the runnable FIFO;
    /// kept in its own slot so queue rotation cannot touch it by accident.
    current: Option<Arc<Thread>>,
    /// Ready threads, FIFO order.
    runnable: VecDeque<Arc<Thread>>,
    /// Sleeping threads ordered by wake tick, earliest first. Stable for
    /// equal ticks.
    sleeping: Vec<Arc<Thread>>,
    /// The idle thread. Parked outside the runnable queue whenever real work
    /// exists; dispatched only when the queue runs dry.
    idle: Option<Arc<Thread>>,
    /// The init process, adopter of orphans.
    init: Option<Arc<Process>>,
}

impl Scheduler {
    const fn new() -> Scheduler {
        Scheduler {
            current: None,
            runnable: VecDeque::new(),
            sleeping: Vec::new(),
            idle: None,
            init: None,
        }
    }

    fn is_idle(&self, thread: &Arc<Thread>) -> bool {
        self.idle
            .as_ref()
            .map(|idle| Arc::ptr_eq(idle, thread))
            .unwrap_or(false)
    }

    fn insert_sleeping(&mut self, thread: Arc<Thread>) {
        let wake = thread.wake_tick.get();
        let position = self
            .sleeping
            .iter()
            .position(|t| t.wake_tick.get() > wake)
            .unwrap_or(self.sleeping.len());
        thread.state.set(ThreadState::Sleeping);
        self.sleeping.insert(position, thread);
    }

    /// Move every thread whose wake tick has passed to the runnable tail.
    fn drain_sleepers(&mut self, now: u64) {
        while let Some(first) = self.sleeping.first() {
            if first.wake_tick.get() > now {
                break;
            }
            let thread = self.sleeping.remove(0);
            thread.state.set(ThreadState::Running);
            self.runnable.push_back(thread);
        }
    }

    fn remove_runnable(&mut self, tid: Tid) -> Option<Arc<Thread>> {
        let index = self.runnable.iter().position(|t| t.tid == tid)?;
        self.runnable.remove(index)
    }

    fn remove_sleeping(&mut self, thread: &Arc<Thread>) {
        if let Some(index) = self
            .sleeping
            .iter()
            .position(|t| Arc::ptr_eq(t, thread))
        {
            self.sleeping.remove(index);
        }
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// The timer handler's veto: while set, ticks are acknowledged but never
/// preempt. Cleared on the far side of every context switch.
static NO_SWITCH: AtomicBool = AtomicBool::new(false);

/// RAII "do not switch me out" section for multi-step scheduler/lifecycle
/// operations that run with interrupts enabled.
pub struct NoSwitchGuard {
    _private: (),
}

pub fn no_switch() -> NoSwitchGuard {
    NO_SWITCH.store(true, Ordering::Release);
    NoSwitchGuard { _private: () }
}

impl Drop for NoSwitchGuard {
    fn drop(&mut self) {
        NO_SWITCH.store(false, Ordering::Release);
    }
}

pub fn current_thread() -> Arc<Thread> {
    arch::without_interrupts(|| {
        SCHEDULER
            .lock()
            .current
            .clone()
            .expect("no current thread")
    })
}

pub fn try_current_thread() -> Option<Arc<Thread>> {
    arch::without_interrupts(|| SCHEDULER.lock().current.clone())
}

pub fn current_process() -> Arc<Process> {
    current_thread().process.clone()
}

/// Program the TSS and address space for `thread` and mark it running. The
/// do-not-switch veto lifts here, on the target side of the switch.
fn set_running(thread: &Arc<Thread>) {
    gdt::set_tss_esp0(thread.esp0);
    unsafe {
        arch::write_cr3(thread.process.page_root() as u32);
    }
    thread.state.set(ThreadState::Running);
    NO_SWITCH.store(false, Ordering::Release);
}

/// Hand the CPU to the next runnable thread (or idle). `prev` is the thread
/// being switched away from, already filed wherever it now belongs; `None`
/// means its stack is dead and must not be saved.
///
/// Called with the scheduler locked and interrupts off; consumes the guard.
fn dispatch(mut guard: MutexGuard<'_, Scheduler>, prev: Option<Arc<Thread>>) {
    // Veto the timer until the target side is consistent again; set_running
    // lifts it.
    NO_SWITCH.store(true, Ordering::Release);

    let next = match guard.runnable.pop_front() {
        Some(thread) => thread,
        None => guard
            .idle
            .clone()
            .expect("scheduler: no runnable thread and no idle thread"),
    };

    if let Some(ref prev) = prev {
        if Arc::ptr_eq(prev, &next) {
            // Sole runnable thread; nothing to switch.
            next.state.set(ThreadState::Running);
            guard.current = Some(next);
            NO_SWITCH.store(false, Ordering::Release);
            return;
        }
    }

    guard.current = Some(next.clone());
    set_running(&next);
    drop(guard);

    match prev {
        Some(prev) => unsafe {
            context::switch_stacks(prev.esp_slot(), next.esp());
        },
        None => unsafe {
            context::switch_discard(next.esp());
        },
    }
}

/// First dispatch off the boot stack. Never returns.
pub fn start() -> ! {
    arch::disable_interrupts();
    let guard = SCHEDULER.lock();
    assert!(guard.current.is_none(), "scheduler already started");
    dispatch(guard, None);
    unreachable!("boot stack resumed after handoff");
}

/// Voluntarily rotate to the next runnable thread, if any.
pub fn yield_now() {
    arch::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(current) = guard.current.take() else {
            return;
        };
        if guard.runnable.is_empty() {
            guard.current = Some(current);
            return;
        }
        current.state.set(ThreadState::Running);
        guard.runnable.push_back(current.clone());
        dispatch(guard, Some(current));
    });
}

/// `yield(tid)`: bring a specific RUNNING thread to the head of the queue.
/// `yield(-1)` is a plain rotation.
pub fn yield_to_tid(tid: Tid) -> KernelResult<()> {
    if tid < 0 {
        yield_now();
        return Ok(());
    }
    arch::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(current) = guard.current.take() else {
            return Err(KernelError::NotRunnable);
        };
        if current.tid == tid {
            guard.current = Some(current);
            return Ok(());
        }
        let Some(target) = guard.remove_runnable(tid) else {
            guard.current = Some(current);
            return Err(KernelError::NotRunnable);
        };
        guard.runnable.push_front(target);
        current.state.set(ThreadState::Running);
        guard.runnable.push_back(current.clone());
        dispatch(guard, Some(current));
        Ok(())
    })
}

/// Donate the CPU to `target` if it is currently runnable; otherwise fall
/// back to a plain rotation. The sync primitives use this to push the lock
/// holder forward instead of spinning against it.
pub fn yield_to_thread(target: &Arc<Thread>) {
    let yielded = arch::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(current) = guard.current.take() else {
            return true;
        };
        if Arc::ptr_eq(&current, target) {
            guard.current = Some(current);
            return true;
        }
        let Some(found) = guard.remove_runnable(target.tid) else {
            guard.current = Some(current);
            return false;
        };
        guard.runnable.push_front(found);
        current.state.set(ThreadState::Running);
        guard.runnable.push_back(current.clone());
        dispatch(guard, Some(current));
        true
    });
    if !yielded {
        yield_now();
    }
}

/// Put the caller to sleep for `ticks` timer ticks. `sleep(0)` degenerates
/// to a yield.
pub fn sleep(ticks: u32) {
    if ticks == 0 {
        yield_now();
        return;
    }
    let wake = timer::get_ticks() + ticks as u64;
    arch::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let current = guard.current.take().expect("sleep with no current thread");
        current.wake_tick.set(wake);
        guard.insert_sleeping(current.clone());
        dispatch(guard, Some(current));
    });
}

/// Take the caller off every scheduler list until someone wakes it. The
/// caller is responsible for having published whatever state the waker needs
/// before this runs (all under one interrupts-off section).
pub fn block_current() {
    arch::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let current = guard.current.take().expect("block with no current thread");
        current.state.set(ThreadState::Blocked);
        dispatch(guard, Some(current));
    });
}

/// Suspend the caller as WAITING. The caller has already queued it on the
/// owning process's waiter list.
pub fn suspend_as_waiting() {
    arch::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let current = guard.current.take().expect("wait with no current thread");
        current.state.set(ThreadState::Waiting);
        dispatch(guard, Some(current));
    });
}

/// Make a suspended thread runnable again. `to_front` puts it at the head so
/// the next switch lands on it (vanish hands off to the awakened waiter this
/// way). A WAITING thread must already be off its process's waiter list.
pub fn wake(thread: &Arc<Thread>, to_front: bool) {
    arch::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        match thread.state.get() {
            ThreadState::Running | ThreadState::Zombie => return,
            ThreadState::Sleeping => guard.remove_sleeping(thread),
            ThreadState::Blocked | ThreadState::Waiting => {}
        }
        thread.state.set(ThreadState::Running);
        if to_front {
            guard.runnable.push_front(thread.clone());
        } else {
            guard.runnable.push_back(thread.clone());
        }
    });
}

/// `make_runnable(tid)`: wake a thread that suspended itself via deschedule.
/// Threads blocked inside kernel primitives are not eligible.
pub fn make_runnable(tid: Tid) -> KernelResult<()> {
    let thread = lookup_thread(tid).ok_or(KernelError::NotBlocked)?;
    arch::without_interrupts(|| {
        if thread.state.get() != ThreadState::Blocked || !thread.descheduled.get() {
            return Err(KernelError::NotBlocked);
        }
        thread.descheduled.set(false);
        wake(&thread, false);
        Ok(())
    })
}

/// `deschedule(flag)`: atomically re-check the user flag and suspend. The
/// flag is read inside the interrupts-off section, which closes the race
/// against a concurrent make_runnable: no other thread runs between the
/// read and the switch.
pub fn deschedule(flag: *const i32) -> KernelResult<()> {
    arch::without_interrupts(|| {
        let value = unsafe { core::ptr::read_volatile(flag) };
        if value != 0 {
            return Ok(());
        }
        let current = current_thread();
        current.descheduled.set(true);
        block_current();
        Ok(())
    })
}

/// Register the thread that exec'd the literal name `idle`.
pub fn register_idle(thread: Arc<Thread>) {
    arch::without_interrupts(|| {
        SCHEDULER.lock().idle = Some(thread);
    });
    crate::log_info!("idle thread registered.");
}

/// Register the process that exec'd the literal name `init`.
pub fn register_init(process: Arc<Process>) {
    arch::without_interrupts(|| {
        SCHEDULER.lock().init = Some(process);
    });
    crate::log_info!("init process registered.");
}

pub fn init_process() -> Option<Arc<Process>> {
    arch::without_interrupts(|| SCHEDULER.lock().init.clone())
}

/// File a brand-new thread (fork/thread_fork child, boot spawn) into the tid
/// table and the runnable queue.
pub fn admit(thread: Arc<Thread>) {
    task::with_tid_table_mut(|table| table.insert(thread.clone()));
    arch::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        thread.state.set(ThreadState::Running);
        guard.runnable.push_back(thread);
    });
}

/// Final switch of a vanishing thread: its stack is dead, its descriptor
/// lives on in the process thread list until burial. `successor`, if given,
/// runs next (the parent's awakened waiter).
pub fn vanish_switch(successor: Option<Arc<Thread>>) -> ! {
    arch::disable_interrupts();
    let mut guard = SCHEDULER.lock();
    let current = guard
        .current
        .take()
        .expect("vanish with no current thread");
    current.state.set(ThreadState::Zombie);
    if let Some(successor) = successor {
        match successor.state.get() {
            ThreadState::Waiting | ThreadState::Blocked => {
                successor.state.set(ThreadState::Running);
                guard.runnable.push_front(successor);
            }
            ThreadState::Running => {
                if let Some(found) = guard.remove_runnable(successor.tid) {
                    guard.runnable.push_front(found);
                }
            }
            _ => {}
        }
    }
    dispatch(guard, None);
    unreachable!("vanished thread resumed");
}

/// 100 Hz preemption. Runs in interrupt context with interrupts off.
pub fn timer_tick(_frame: &mut TrapFrame) {
    let now = timer::increment();

    if NO_SWITCH.load(Ordering::Acquire) {
        idt::ack_interrupt(TIMER_VECTOR);
        return;
    }

    let mut guard = SCHEDULER.lock();
    if guard.current.is_none() {
        // Still on the boot stack.
        drop(guard);
        idt::ack_interrupt(TIMER_VECTOR);
        return;
    }

    guard.drain_sleepers(now);

    let current = guard.current.take().unwrap();
    if guard.is_idle(&current) {
        if guard.runnable.is_empty() {
            // Nothing better to do; stay on idle.
            guard.current = Some(current);
            drop(guard);
            idt::ack_interrupt(TIMER_VECTOR);
            return;
        }
        // Idle parks outside the queue until the next dry spell.
        idt::ack_interrupt(TIMER_VECTOR);
        dispatch(guard, Some(current));
        return;
    }

    if guard.runnable.is_empty() {
        guard.current = Some(current);
        drop(guard);
        idt::ack_interrupt(TIMER_VECTOR);
        return;
    }

    current.state.set(ThreadState::Running);
    guard.runnable.push_back(current.clone());
    idt::ack_interrupt(TIMER_VECTOR);
    dispatch(guard, Some(current));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::PageDirectory;
    use alloc::sync::Weak;

    fn thread() -> Arc<Thread> {
        let dir = PageDirectory::new().unwrap();
        Thread::new(Process::new(Weak::new(), dir))
    }

    fn sleeper(sched: &mut Scheduler, wake: u64) -> Arc<Thread> {
        let t = thread();
        t.wake_tick.set(wake);
        sched.insert_sleeping(t.clone());
        t
    }

    #[test]
    fn sleepers_wake_in_nondecreasing_order() {
        let mut sched = Scheduler::new();
        let c = sleeper(&mut sched, 300);
        let a = sleeper(&mut sched, 100);
        let b = sleeper(&mut sched, 200);
        assert!(sched.sleeping.iter().all(|t| t.state.get() == ThreadState::Sleeping));

        sched.drain_sleepers(250);
        let order: alloc::vec::Vec<Tid> = sched.runnable.iter().map(|t| t.tid).collect();
        assert_eq!(order, alloc::vec![a.tid, b.tid]);
        assert_eq!(sched.sleeping.len(), 1);
        assert_eq!(sched.sleeping[0].tid, c.tid);

        sched.drain_sleepers(300);
        assert!(sched.sleeping.is_empty());
        assert_eq!(sched.runnable.back().unwrap().tid, c.tid);
        assert!(sched.runnable.iter().all(|t| t.state.get() == ThreadState::Running));
    }

    #[test]
    fn equal_wake_ticks_stay_fifo() {
        let mut sched = Scheduler::new();
        let first = sleeper(&mut sched, 100);
        let second = sleeper(&mut sched, 100);
        sched.drain_sleepers(100);
        let order: alloc::vec::Vec<Tid> = sched.runnable.iter().map(|t| t.tid).collect();
        assert_eq!(order, alloc::vec![first.tid, second.tid]);
    }

    #[test]
    fn remove_runnable_finds_by_tid() {
        let mut sched = Scheduler::new();
        let a = thread();
        let b = thread();
        a.state.set(ThreadState::Running);
        b.state.set(ThreadState::Running);
        sched.runnable.push_back(a.clone());
        sched.runnable.push_back(b.clone());

        let taken = sched.remove_runnable(b.tid).unwrap();
        assert_eq!(taken.tid, b.tid);
        assert!(sched.remove_runnable(b.tid).is_none());
        assert_eq!(sched.runnable.len(), 1);
    }

    #[test]
    fn idle_is_recognized_by_identity() {
        let mut sched = Scheduler::new();
        let idle = thread();
        let other = thread();
        sched.idle = Some(idle.clone());
        assert!(sched.is_idle(&idle));
        assert!(!sched.is_idle(&other));
    }
}

/// Diagnostic snapshot used by the invariant checks in the tests and the
/// panic path: every thread's state must agree with its list membership.
pub fn debug_check_invariants() -> bool {
    arch::without_interrupts(|| {
        let guard = SCHEDULER.lock();
        let mut ok = true;
        if let Some(ref current) = guard.current {
            ok &= current.state.get() == ThreadState::Running;
        }
        for t in guard.runnable.iter() {
            ok &= t.state.get() == ThreadState::Running;
        }
        let mut last_wake = 0;
        for t in guard.sleeping.iter() {
            ok &= t.state.get() == ThreadState::Sleeping;
            ok &= t.wake_tick.get() >= last_wake;
            last_wake = t.wake_tick.get();
        }
        ok
    })
}
