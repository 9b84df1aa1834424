//! Process and thread lifecycle: fork, thread_fork, exec, wait, vanish, and
//! the boot-time god process that seeds idle, init, and the shell.
//!
//! Locking discipline: process and scheduler spinlocks are only ever taken
//! with interrupts off, so lock nesting can never interleave with
//! preemption on this single CPU. Anything that must not race a waker
//! (queueing as a waiter, picking a vanish successor) stays inside one
//! interrupts-off section up to and including the context switch.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use super::context;
use super::task::{Process, ProcessState, Thread, Tid};
use crate::arch;
use crate::interrupts::traps::TrapFrame;
use crate::interrupts::usermode;
use crate::loader::{elf, ramdisk};
use crate::memory::paging::{PageDirectory, PageKind};
use crate::memory::{page_align_up, PAGE_SIZE, USER_MEM_START, USER_STACK_TOP};
use crate::scheduler;
use crate::sync;
use crate::syscalls::error::{KernelError, KernelResult};

/// Longest argv blob exec will materialize (strings, terminators included).
const MAX_ARGV_BYTES: usize = 0x10_0000;
/// new_pages length ceiling.
const MAX_NEW_PAGES_LEN: usize = 4095 * PAGE_SIZE;

/// Store the caller's exit status; reported to the parent's `wait`.
pub fn set_status(status: i32) {
    let process = scheduler::current_process();
    arch::without_interrupts(|| {
        process.inner.lock().exit_status = status;
    });
}

/// fork: duplicate the calling single-threaded process. The child's address
/// space shares every frame copy-on-write; its first dispatch returns 0 from
/// the same trap the parent is sitting in.
pub fn fork(frame: &TrapFrame) -> KernelResult<Tid> {
    let parent_thread = scheduler::current_thread();
    let parent = parent_thread.process.clone();

    arch::without_interrupts(|| {
        let mut pinner = parent.inner.lock();
        if pinner.threads > 1 {
            return Err(KernelError::MultipleThreads);
        }

        let parent_dir = pinner
            .page_dir
            .as_ref()
            .expect("fork: live process without page directory");
        let child_dir = parent_dir.clone_for_fork()?;

        let child = Process::new(Arc::downgrade(&parent), child_dir);
        let child_thread = Thread::new(child.clone());
        let child_tid = child_thread.tid;

        child_thread.esp3.set(frame.user_esp);
        child_thread.swexn.set(parent_thread.swexn.get());
        context::forge_fork_stack(&child_thread, frame);

        {
            let mut cinner = child.inner.lock();
            cinner.regions = pinner.regions.clone();
            cinner.threads = 1;
            cinner.original_tid = child_tid;
            cinner.thread_list.push(child_thread.clone());
        }
        pinner.children.push(child.clone());
        drop(pinner);

        scheduler::admit(child_thread);
        Ok(child_tid)
    })
}

/// thread_fork: a second thread in the caller's process, sharing the address
/// space and region table. The exception handler is deliberately not
/// inherited.
pub fn thread_fork(frame: &TrapFrame) -> KernelResult<Tid> {
    let current = scheduler::current_thread();
    let process = current.process.clone();

    arch::without_interrupts(|| {
        let thread = Thread::new(process.clone());
        let tid = thread.tid;
        thread.esp3.set(frame.user_esp);
        context::forge_fork_stack(&thread, frame);

        {
            let mut pinner = process.inner.lock();
            pinner.threads += 1;
            pinner.thread_list.push(thread.clone());
        }

        scheduler::admit(thread);
        Ok(tid)
    })
}

/// exec: replace the caller's address space with the named RAM-disk image.
/// Returns only on failure; failures after the old space has been wiped are
/// not survivable and kill the thread instead.
pub fn exec(name: String, argv: Vec<String>) -> KernelError {
    let Some(file) = ramdisk::lookup(&name) else {
        return KernelError::NotFound;
    };
    let image = match elf::parse(file) {
        Ok(image) => image,
        Err(e) => return e.into(),
    };

    // Kernel-side argv blob: the user copies die with reset_paging below.
    let mut blob: Vec<u8> = Vec::new();
    let mut offsets: Vec<usize> = Vec::new();
    for arg in &argv {
        offsets.push(blob.len());
        blob.extend_from_slice(arg.as_bytes());
        blob.push(0);
    }
    if blob.len() > MAX_ARGV_BYTES {
        return KernelError::InvalidArg;
    }
    // Pointer vector plus the five startup words must fit the stack page.
    if (argv.len() + 1) * 4 + 20 > PAGE_SIZE {
        return KernelError::InvalidArg;
    }

    let thread = scheduler::current_thread();
    let process = thread.process.clone();

    // Sibling threads would keep running on the wiped address space.
    let threads = arch::without_interrupts(|| process.inner.lock().threads);
    if threads > 1 {
        return KernelError::MultipleThreads;
    }

    // Past this point the old address space is gone.
    let entry_esp = arch::without_interrupts(|| -> KernelResult<(u32, u32)> {
        let mut pinner = process.inner.lock();
        pinner.regions.clear();
        let dir = pinner
            .page_dir
            .as_mut()
            .expect("exec: live process without page directory");
        dir.reset();

        // Read-only argv pages above the stack.
        let argv_base = USER_STACK_TOP;
        for page in 0..page_align_up(blob.len()) / PAGE_SIZE {
            dir.create_page(argv_base + page * PAGE_SIZE, PageKind::Rodata, None)?;
        }
        // One fresh stack page.
        let stack_page = USER_STACK_TOP - PAGE_SIZE;
        dir.create_page(stack_page, PageKind::Stack, None)?;

        // The ELF segments.
        elf::load(dir, file, &image)?;

        // Fill argv strings (read-only pages, so through the frame window).
        let mut written = 0;
        while written < blob.len() {
            let page_off = written % PAGE_SIZE;
            let chunk = core::cmp::min(PAGE_SIZE - page_off, blob.len() - written);
            crate::memory::paging::fill_page(
                argv_base + written,
                page_off,
                &blob[written..written + chunk],
            )?;
            written += chunk;
        }

        // Startup stack: argv pointer vector, then the main() argument
        // block: return slot, argc, argv, stack_high, stack_low.
        let vector_addr = USER_STACK_TOP - (argv.len() + 1) * 4;
        for (i, offset) in offsets.iter().enumerate() {
            let pointer = (argv_base + offset) as u32;
            unsafe {
                core::ptr::write((vector_addr + i * 4) as *mut u32, pointer);
            }
        }
        unsafe {
            core::ptr::write((vector_addr + argv.len() * 4) as *mut u32, 0);
        }

        let esp3 = vector_addr - 20;
        let words = [
            0u32,
            argv.len() as u32,
            vector_addr as u32,
            USER_STACK_TOP as u32,
            stack_page as u32,
        ];
        for (i, word) in words.iter().enumerate() {
            unsafe {
                core::ptr::write((esp3 + i * 4) as *mut u32, *word);
            }
        }

        thread.esp3.set(esp3 as u32);
        // A fresh image starts with no exception handler.
        thread.swexn.set(None);
        drop(pinner);

        // The distinguished names hook into the scheduler.
        if name == "idle" {
            scheduler::register_idle(thread.clone());
        } else if name == "init" {
            scheduler::register_init(process.clone());
        }
        Ok((image.entry, esp3 as u32))
    })
    .unwrap_or_else(|e| {
        crate::log_error!("exec('{}') died mid-rebuild: {}", name, e);
        thread_panic(KernelError::Fault.code());
    });

    let (entry, esp3) = entry_esp;
    usermode::enter_user_mode(entry, esp3)
}

/// wait: reap one exited child, blocking until one exists. Returns the
/// child's original tid and exit status; the child's carcass (threads,
/// paging, descriptor) is freed here.
pub fn wait() -> KernelResult<(Tid, i32)> {
    let current = scheduler::current_thread();
    let process = current.process.clone();

    loop {
        arch::disable_interrupts();
        let mut pinner = process.inner.lock();

        if pinner.children.is_empty() {
            drop(pinner);
            arch::enable_interrupts();
            return Err(KernelError::NoChildren);
        }

        let exited = pinner
            .children
            .iter()
            .position(|c| c.inner.lock().state == ProcessState::Exited);
        if let Some(index) = exited {
            let child = pinner.children.remove(index);
            drop(pinner);
            arch::enable_interrupts();
            return Ok(bury(child));
        }

        if pinner.waiters.len() >= pinner.children.len() {
            drop(pinner);
            arch::enable_interrupts();
            return Err(KernelError::WaitFull);
        }

        // Queue and suspend in one interrupts-off breath so a vanishing
        // child cannot slip between the two.
        pinner.waiters.push_back(current.clone());
        drop(pinner);
        scheduler::suspend_as_waiting();
        arch::enable_interrupts();
    }
}

/// Free everything a dead process still owns. The process must be EXITED and
/// detached from its parent; nobody else can reach it.
fn bury(child: Arc<Process>) -> (Tid, i32) {
    let (threads, page_dir, original_tid, status) = arch::without_interrupts(|| {
        let mut cinner = child.inner.lock();
        debug_assert_eq!(cinner.state, ProcessState::Exited);
        debug_assert_eq!(cinner.threads, 0);
        cinner.state = ProcessState::Buried;
        let threads: Vec<Arc<Thread>> = cinner.thread_list.drain(..).collect();
        let page_dir = cinner.page_dir.take();
        (threads, page_dir, cinner.original_tid, cinner.exit_status)
    });

    // Outside the spinlocks: the tid table takes the blocking rwlock, and
    // paging teardown grinds through the frame pool.
    for thread in threads {
        super::task::with_tid_table_mut(|table| {
            table.remove(thread.tid);
        });
    }
    drop(page_dir);

    (original_tid, status)
}

/// vanish: the calling thread is done. Involuntarily releases its held
/// mutexes; the last thread out also exits the process, reparenting live
/// children to init and waking one of the parent's waiters, which the final
/// switch hands the CPU to directly.
pub fn vanish() -> ! {
    let current = scheduler::current_thread();
    sync::mutex::release_all_held(&current);

    let process = current.process.clone();
    let mut successor: Option<Arc<Thread>> = None;
    let mut orphans_to_bury: Vec<Arc<Process>> = Vec::new();

    // The successor we pick below sits on no list until the final switch
    // hands it the CPU; hold the timer off for that whole window.
    let _no_preempt = scheduler::no_switch();

    arch::disable_interrupts();
    {
        let mut pinner = process.inner.lock();
        pinner.threads -= 1;

        if pinner.threads == 0 {
            // Process exit. Hand surviving children to init; zombie
            // children that nobody will ever wait for die with us.
            let children: Vec<Arc<Process>> = pinner.children.drain(..).collect();
            let adopter = scheduler::init_process()
                .filter(|init| init.pid != process.pid);
            for child in children {
                let exited = {
                    let mut cinner = child.inner.lock();
                    if cinner.state == ProcessState::Exited {
                        true
                    } else {
                        match adopter {
                            Some(ref init) => {
                                cinner.parent = Arc::downgrade(init);
                                false
                            }
                            None => {
                                cinner.parent = Weak::new();
                                crate::log_warn!(
                                    "vanish: orphaned pid {} with no init to adopt it",
                                    child.pid
                                );
                                false
                            }
                        }
                    }
                };
                if exited {
                    orphans_to_bury.push(child);
                } else if let Some(ref init) = adopter {
                    init.inner.lock().children.push(child);
                }
            }

            pinner.state = ProcessState::Exited;
            let parent = pinner.parent.upgrade();
            drop(pinner);

            if let Some(parent) = parent {
                successor = parent.inner.lock().waiters.pop_front();
            }
        }
    }
    arch::enable_interrupts();

    for zombie in orphans_to_bury {
        bury(zombie);
    }

    scheduler::vanish_switch(successor)
}

/// Kill the calling thread from kernel context (unhandled fault, doomed
/// exec): records `status` and vanishes.
pub fn thread_panic(status: i32) -> ! {
    let current = scheduler::current_thread();
    crate::log_warn!("thread {} killed (status {})", current.tid, status);
    set_status(status);
    vanish()
}

/// new_pages(base, len): map `len / PAGE_SIZE` fresh writable pages and
/// remember the region. Partial failure unwinds completely.
pub fn new_pages(base: usize, len: usize) -> KernelResult<()> {
    if base % PAGE_SIZE != 0
        || len == 0
        || len % PAGE_SIZE != 0
        || len > MAX_NEW_PAGES_LEN
        || base < USER_MEM_START
        || base.checked_add(len).is_none()
    {
        return Err(KernelError::InvalidArg);
    }
    let pages = len / PAGE_SIZE;
    let process = scheduler::current_process();

    arch::without_interrupts(|| {
        let mut pinner = process.inner.lock();
        if pinner.regions.overlaps(base, pages) {
            return Err(KernelError::InvalidArg);
        }
        pinner
            .regions
            .insert(base, pages)
            .map_err(|_| KernelError::RegionTableFull)?;

        let dir = pinner
            .page_dir
            .as_mut()
            .expect("new_pages: live process without page directory");
        for index in 0..pages {
            if let Err(e) = dir.create_page(base + index * PAGE_SIZE, PageKind::User, None) {
                for undo in 0..index {
                    let _ = dir.destroy_page(base + undo * PAGE_SIZE);
                }
                pinner.regions.remove(base);
                return Err(e.into());
            }
        }
        Ok(())
    })
}

/// remove_pages(base): tear down exactly the region registered at `base`.
pub fn remove_pages(base: usize) -> KernelResult<()> {
    let process = scheduler::current_process();
    arch::without_interrupts(|| {
        let mut pinner = process.inner.lock();
        let pages = pinner
            .regions
            .remove(base)
            .ok_or(KernelError::InvalidArg)?;
        let dir = pinner
            .page_dir
            .as_mut()
            .expect("remove_pages: live process without page directory");
        for index in 0..pages {
            let _ = dir.destroy_page(base + index * PAGE_SIZE);
        }
        Ok(())
    })
}

// ── Boot: the god process and its three children ──

/// Create the first process. Its single thread runs `god_entry` on its own
/// kernel stack once the scheduler starts.
pub fn create_god() -> KernelResult<()> {
    let dir = PageDirectory::new()?;
    let god = Process::new(Weak::new(), dir);
    let thread = Thread::new(god.clone());
    {
        let mut ginner = god.inner.lock();
        ginner.threads = 1;
        ginner.original_tid = thread.tid;
        ginner.thread_list.push(thread.clone());
    }
    context::forge_kernel_stack(&thread, god_entry);
    scheduler::admit(thread);
    crate::log_info!("god process created (pid {}).", god.pid);
    Ok(())
}

/// The god process body: seed idle, init and the shell, then sit in wait
/// as the reaper of last resort.
extern "C" fn god_entry() -> ! {
    arch::enable_interrupts();

    for name in ["idle", "init", "shell"] {
        match spawn_program(name) {
            Ok(pid) => crate::log_info!("spawned '{}' as pid {}.", name, pid),
            Err(e) => crate::log_error!("failed to spawn '{}': {}", name, e),
        }
    }

    loop {
        match wait() {
            Ok((tid, status)) => {
                crate::log_info!("god reaped tid {} (status {}).", tid, status);
            }
            Err(_) => scheduler::sleep(100),
        }
    }
}

/// Fork-and-exec for boot time: a fresh process whose first thread execs
/// `name` from inside its own context, exactly as a forked child would.
fn spawn_program(name: &str) -> KernelResult<i32> {
    let current = scheduler::current_process();
    let dir = PageDirectory::new()?;
    let child = Process::new(Arc::downgrade(&current), dir);
    let thread = Thread::new(child.clone());

    arch::without_interrupts(|| {
        {
            let mut cinner = child.inner.lock();
            cinner.threads = 1;
            cinner.original_tid = thread.tid;
            cinner.thread_list.push(thread.clone());
            cinner.boot_command = Some(String::from(name));
        }
        current.inner.lock().children.push(child.clone());
    });

    context::forge_kernel_stack(&thread, first_exec_entry);
    scheduler::admit(thread);
    Ok(child.pid)
}

/// First code a boot-spawned thread runs, already in its own process and
/// address space: exec the recorded program name.
extern "C" fn first_exec_entry() -> ! {
    arch::enable_interrupts();
    let process = scheduler::current_process();
    let name = arch::without_interrupts(|| process.inner.lock().boot_command.take())
        .expect("boot thread without a command");
    let argv = alloc::vec![name.clone()];
    let error = exec(name.clone(), argv);
    crate::log_error!("boot exec '{}' failed: {}", name, error);
    thread_panic(KernelError::Fault.code())
}
