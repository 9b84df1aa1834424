//! Writer-priority reader/writer lock. Writers queue on `no_threads_in`,
//! readers on `no_writers_in`; a waiting writer blocks new readers, so a
//! steady reader stream cannot starve writers (readers can starve instead,
//! which is the stated policy).

use core::cell::UnsafeCell;

use super::condvar::CondVar;
use super::mutex::Mutex;

struct State {
    readers_in: usize,
    writer_in: bool,
    writers_waiting: usize,
}

pub struct RwLock {
    state: Mutex,
    inner: UnsafeCell<State>,
    /// Writers wait for "no readers, no writer".
    no_threads_in: CondVar,
    /// Readers wait for "no writer in or waiting".
    no_writers_in: CondVar,
}

// State is only touched with `state` held.
unsafe impl Send for RwLock {}
unsafe impl Sync for RwLock {}

impl RwLock {
    pub const fn new() -> RwLock {
        RwLock {
            state: Mutex::new(),
            inner: UnsafeCell::new(State {
                readers_in: 0,
                writer_in: false,
                writers_waiting: 0,
            }),
            no_threads_in: CondVar::new(),
            no_writers_in: CondVar::new(),
        }
    }

    fn state(&self) -> &mut State {
        unsafe { &mut *self.inner.get() }
    }

    pub fn lock_read(&self) {
        if !super::operational() {
            return;
        }
        self.state.lock();
        while self.state().writer_in || self.state().writers_waiting > 0 {
            self.no_writers_in.wait(&self.state);
        }
        self.state().readers_in += 1;
        self.state.unlock();
    }

    pub fn unlock_read(&self) {
        if !super::operational() {
            return;
        }
        self.state.lock();
        debug_assert!(self.state().readers_in > 0);
        self.state().readers_in -= 1;
        if self.state().readers_in == 0 {
            self.no_threads_in.signal();
        }
        self.state.unlock();
    }

    pub fn lock_write(&self) {
        if !super::operational() {
            return;
        }
        self.state.lock();
        self.state().writers_waiting += 1;
        while self.state().writer_in || self.state().readers_in > 0 {
            self.no_threads_in.wait(&self.state);
        }
        self.state().writers_waiting -= 1;
        self.state().writer_in = true;
        self.state.unlock();
    }

    pub fn unlock_write(&self) {
        if !super::operational() {
            return;
        }
        self.state.lock();
        debug_assert!(self.state().writer_in);
        self.state().writer_in = false;
        if self.state().writers_waiting > 0 {
            self.no_threads_in.signal();
        } else {
            self.no_writers_in.broadcast();
        }
        self.state.unlock();
    }

    /// Writer -> reader without letting another writer in between: flips the
    /// write hold into a read hold atomically, then lets other readers try.
    pub fn downgrade(&self) {
        if !super::operational() {
            return;
        }
        self.state.lock();
        debug_assert!(self.state().writer_in);
        self.state().writer_in = false;
        self.state().readers_in += 1;
        self.no_writers_in.broadcast();
        self.state.unlock();
    }

    pub fn destroy(&self) {
        let state = unsafe { &*self.inner.get() };
        debug_assert!(
            !state.writer_in && state.readers_in == 0 && state.writers_waiting == 0,
            "rwlock: destroy while held"
        );
        self.no_threads_in.destroy();
        self.no_writers_in.destroy();
        self.state.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The suspension paths need a live scheduler; with the primitives left
    // unarmed they reduce to their bookkeeping, which is what these check.

    #[test]
    fn unarmed_lock_is_inert() {
        let lock = RwLock::new();
        lock.lock_read();
        lock.unlock_read();
        lock.lock_write();
        lock.unlock_write();
        let state = unsafe { &*lock.inner.get() };
        assert_eq!(state.readers_in, 0);
        assert!(!state.writer_in);
    }

    #[test]
    fn writer_gate_predicate() {
        // A writer may enter only with no readers and no writer in.
        let admit = |writer_in: bool, readers: usize| !writer_in && readers == 0;
        assert!(admit(false, 0));
        assert!(!admit(true, 0));
        assert!(!admit(false, 3));
    }

    #[test]
    fn reader_gate_predicate() {
        // A reader may enter only with no writer in and none waiting.
        let admit = |writer_in: bool, writers_waiting: usize| !writer_in && writers_waiting == 0;
        assert!(admit(false, 0));
        assert!(!admit(true, 0));
        assert!(!admit(false, 1));
    }
}
