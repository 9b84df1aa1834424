//! Condition variables. The waiter list is guarded by an internal mutex;
//! suspension goes through the scheduler's block/wake pair. A signaller that
//! catches its target between "queued" and "actually blocked" donates the
//! CPU to it until the block lands, so no wakeup is ever lost.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;

use super::mutex::Mutex;
use crate::scheduler::{self, task::Thread};
use crate::scheduler::task::ThreadState;

pub struct CondVar {
    guard: Mutex,
    waiters: UnsafeCell<VecDeque<Arc<Thread>>>,
}

// The waiter queue is only touched with `guard` held.
unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    pub const fn new() -> CondVar {
        CondVar {
            guard: Mutex::new(),
            waiters: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// Atomically release `user_mutex` and suspend until signalled; the
    /// mutex is re-held on return.
    pub fn wait(&self, user_mutex: &Mutex) {
        if !super::operational() {
            return;
        }
        let me = scheduler::current_thread();

        self.guard.lock();
        unsafe { (*self.waiters.get()).push_back(me) };
        self.guard.unlock();

        user_mutex.unlock();
        scheduler::block_current();
        user_mutex.lock();
    }

    /// Wake the head waiter, if any.
    pub fn signal(&self) {
        if !super::operational() {
            return;
        }
        self.guard.lock();
        let target = unsafe { (*self.waiters.get()).pop_front() };
        self.guard.unlock();

        if let Some(target) = target {
            wake_when_blocked(&target);
        }
    }

    /// Wake every queued waiter.
    pub fn broadcast(&self) {
        if !super::operational() {
            return;
        }
        loop {
            self.guard.lock();
            let target = unsafe { (*self.waiters.get()).pop_front() };
            self.guard.unlock();
            match target {
                Some(target) => wake_when_blocked(&target),
                None => break,
            }
        }
    }

    pub fn destroy(&self) {
        let empty = unsafe { (*self.waiters.get()).is_empty() };
        debug_assert!(empty, "condvar: destroy with waiters");
    }
}

/// The dequeued thread may not have finished descheduling yet; push it
/// forward until its block takes effect, then make it runnable.
fn wake_when_blocked(target: &Arc<Thread>) {
    loop {
        match target.state.get() {
            ThreadState::Blocked => {
                scheduler::wake(target, false);
                return;
            }
            ThreadState::Zombie => return,
            _ => scheduler::yield_to_thread(target),
        }
    }
}
