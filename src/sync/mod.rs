//! Kernel synchronization primitives, layered bottom-up: a test-and-set
//! mutex that yields to whoever holds the structure, condition variables on
//! top of block/wake, and a writer-priority reader/writer lock on top of
//! both.
//!
//! During single-threaded boot the primitives are inert; `set_operational`
//! arms them once the scheduler can actually suspend threads.

pub mod condvar;
pub mod mutex;
pub mod rwlock;

pub use condvar::CondVar;
pub use mutex::Mutex;
pub use rwlock::RwLock;

use core::sync::atomic::{AtomicBool, Ordering};

static OPERATIONAL: AtomicBool = AtomicBool::new(false);

pub fn set_operational() {
    OPERATIONAL.store(true, Ordering::Release);
    crate::log_info!("synchronization primitives armed.");
}

pub(crate) fn operational() -> bool {
    OPERATIONAL.load(Ordering::Acquire)
}
