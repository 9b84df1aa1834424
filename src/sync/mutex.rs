//! The kernel mutex. One test-and-set bit guards the structure; a FIFO queue
//! of waiting threads decides who gets ownership next. Both spin paths yield
//! directly to the thread that is in the way (the structure holder or the
//! owner), so a preempted holder is pushed forward instead of starved.
//!
//! Every mutex a thread holds is chained through `previous` into the
//! thread's `held_mutexes` stack so vanish can release them involuntarily.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::scheduler::{self, task::Thread};
use crate::scheduler::task::ThreadState;

struct Inner {
    owner: Option<Arc<Thread>>,
    waiters: VecDeque<Arc<Thread>>,
}

pub struct Mutex {
    /// The structure spin bit ("is someone editing owner/waiters").
    lock_bit: AtomicBool,
    /// Tid of the thread holding the spin bit, for yield donation. -1 if
    /// nobody does.
    list_owner: AtomicI32,
    inner: UnsafeCell<Inner>,
    /// Link toward the next mutex in the holding thread's acquired stack.
    previous: Cell<*const Mutex>,
}

// The inner cell is only touched while the spin bit is held; the chain cell
// only by the holding thread itself.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            lock_bit: AtomicBool::new(false),
            list_owner: AtomicI32::new(-1),
            inner: UnsafeCell::new(Inner {
                owner: None,
                waiters: VecDeque::new(),
            }),
            previous: Cell::new(core::ptr::null()),
        }
    }

    /// Take the structure bit, donating the CPU to whoever holds it
    /// meanwhile.
    fn acquire_bit(&self, me: &Arc<Thread>) {
        while self.lock_bit.swap(true, Ordering::AcqRel) {
            let holder = self.list_owner.load(Ordering::Acquire);
            if holder < 0 || scheduler::yield_to_tid(holder).is_err() {
                scheduler::yield_now();
            }
        }
        self.list_owner.store(me.tid, Ordering::Release);
    }

    fn release_bit(&self) {
        self.list_owner.store(-1, Ordering::Release);
        self.lock_bit.store(false, Ordering::Release);
    }

    pub fn lock(&self) {
        if !super::operational() {
            return;
        }
        let me = scheduler::current_thread();
        let mut first_pass = true;

        loop {
            self.acquire_bit(&me);
            let inner = unsafe { &mut *self.inner.get() };

            match inner.owner {
                None => {
                    inner.owner = Some(me.clone());
                    break;
                }
                Some(ref owner) if Arc::ptr_eq(owner, &me) => {
                    if first_pass {
                        panic!("mutex: relock by owner (tid {})", me.tid);
                    }
                    // unlock() handed ownership to us while we were queued.
                    break;
                }
                Some(ref owner) => {
                    let owner = owner.clone();
                    if !inner.waiters.iter().any(|t| Arc::ptr_eq(t, &me)) {
                        inner.waiters.push_back(me.clone());
                    }
                    self.release_bit();
                    scheduler::yield_to_thread(&owner);
                    first_pass = false;
                }
            }
        }

        // Ownership taken; push onto the acquired stack.
        self.previous.set(me.held_mutexes.get());
        me.held_mutexes.set(self as *const Mutex);
        self.release_bit();
    }

    pub fn unlock(&self) {
        if !super::operational() {
            return;
        }
        let me = scheduler::current_thread();
        self.release_as(&me);
    }

    /// Release on behalf of `me`. Also the vanish path, where `me` is the
    /// dying thread walking its acquired stack.
    pub(crate) fn release_as(&self, me: &Arc<Thread>) {
        self.acquire_bit(me);

        self.unchain_from(me);

        let inner = unsafe { &mut *self.inner.get() };
        debug_assert!(
            inner
                .owner
                .as_ref()
                .map(|o| Arc::ptr_eq(o, me))
                .unwrap_or(false),
            "mutex: release by non-owner"
        );

        // Skim the FIFO: hand ownership to the first waiter still alive.
        let mut next_owner = None;
        while let Some(waiter) = inner.waiters.pop_front() {
            if waiter.state.get() != ThreadState::Zombie {
                next_owner = Some(waiter);
                break;
            }
        }
        inner.owner = next_owner.clone();
        self.release_bit();

        if let Some(ref new_owner) = next_owner {
            scheduler::yield_to_thread(new_owner);
        }
    }

    /// Unlink this mutex from `me`'s acquired stack. Handles out-of-order
    /// release; the common case pops the head.
    fn unchain_from(&self, me: &Arc<Thread>) {
        let self_ptr = self as *const Mutex;
        let head = me.held_mutexes.get();
        if head == self_ptr {
            me.held_mutexes.set(self.previous.get());
            self.previous.set(core::ptr::null());
            return;
        }
        let mut cursor = head;
        while !cursor.is_null() {
            let entry = unsafe { &*cursor };
            if entry.previous.get() == self_ptr {
                entry.previous.set(self.previous.get());
                self.previous.set(core::ptr::null());
                return;
            }
            cursor = entry.previous.get();
        }
    }

    /// True if `thread` currently owns this mutex.
    pub(crate) fn owned_by(&self, thread: &Arc<Thread>) -> bool {
        let inner = unsafe { &*self.inner.get() };
        inner
            .owner
            .as_ref()
            .map(|o| Arc::ptr_eq(o, thread))
            .unwrap_or(false)
    }

    /// Drop a mutex that must be quiescent: no owner, no waiters queued.
    /// Destroying a contended mutex is a kernel bug.
    pub fn destroy(&self) {
        let inner = unsafe { &*self.inner.get() };
        debug_assert!(inner.owner.is_none(), "mutex: destroy while owned");
        debug_assert!(inner.waiters.is_empty(), "mutex: destroy with waiters");
    }
}

/// Release every mutex `thread` still holds, acquisition stack order. Called
/// by vanish before the thread's final switch.
pub fn release_all_held(thread: &Arc<Thread>) {
    while !thread.held_mutexes.get().is_null() {
        let mutex = unsafe { &*thread.held_mutexes.get() };
        debug_assert!(mutex.owned_by(thread));
        mutex.release_as(thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::PageDirectory;
    use crate::scheduler::task::Process;
    use alloc::sync::Weak;

    fn thread() -> Arc<Thread> {
        let dir = PageDirectory::new().unwrap();
        Thread::new(Process::new(Weak::new(), dir))
    }

    /// Chain `mutex` onto `t` the way lock() does once ownership is taken.
    fn chain(t: &Arc<Thread>, mutex: &Mutex) {
        mutex.previous.set(t.held_mutexes.get());
        t.held_mutexes.set(mutex as *const Mutex);
    }

    #[test]
    fn held_chain_pops_in_lifo_order() {
        let t = thread();
        let a = Mutex::new();
        let b = Mutex::new();
        chain(&t, &a);
        chain(&t, &b);

        assert_eq!(t.held_mutexes.get(), &b as *const Mutex);
        b.unchain_from(&t);
        assert_eq!(t.held_mutexes.get(), &a as *const Mutex);
        a.unchain_from(&t);
        assert!(t.held_mutexes.get().is_null());
    }

    #[test]
    fn held_chain_handles_middle_removal() {
        let t = thread();
        let a = Mutex::new();
        let b = Mutex::new();
        let c = Mutex::new();
        chain(&t, &a);
        chain(&t, &b);
        chain(&t, &c);

        // Releasing b out of order must splice c -> a.
        b.unchain_from(&t);
        assert_eq!(t.held_mutexes.get(), &c as *const Mutex);
        assert_eq!(c.previous.get(), &a as *const Mutex);
        assert!(b.previous.get().is_null());
    }

    #[test]
    fn unarmed_mutex_is_inert() {
        let m = Mutex::new();
        m.lock();
        m.unlock();
        let inner = unsafe { &*m.inner.get() };
        assert!(inner.owner.is_none());
        assert!(inner.waiters.is_empty());
    }
}
