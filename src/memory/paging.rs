//! IA-32 two-level paging. Page directories and page tables are u32 entry
//! arrays allocated page-aligned from the kernel heap, so their virtual
//! addresses double as physical addresses through the kernel direct map.
//!
//! Two otherwise-unused PTE bits carry kernel policy: ZFOD marks a page that
//! maps the shared read-only zero frame and upgrades to a private frame on
//! first write; COW marks a shared frame that must be duplicated on write.

use bitflags::bitflags;
use spin::Mutex;

use super::frames::{self, FrameError};
use super::{PAGE_SIZE, USER_MEM_START};
use crate::arch;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const GLOBAL        = 1 << 8;
        /// Software: maps the zero frame, upgrade on first write.
        const ZFOD          = 1 << 9;
        /// Software: shared frame, duplicate on first write.
        const COW           = 1 << 10;
    }
}

pub const PTE_ADDR_MASK: u32 = 0xFFFF_F000;

const ENTRIES: usize = 1024;
const KERNEL_TABLE_COUNT: usize = USER_MEM_START / (ENTRIES * PAGE_SIZE);

/// Kernel scratch window: one remappable supervisor page just below user
/// space, used to reach frames that have no user mapping yet.
pub const SCRATCH_VA: usize = USER_MEM_START - PAGE_SIZE;

/// What a page is for; decides frame source and writability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Text,
    Rodata,
    Data,
    Bss,
    Heap,
    Stack,
    User,
}

impl PageKind {
    fn writable(self) -> bool {
        matches!(
            self,
            PageKind::Data | PageKind::Heap | PageKind::Stack | PageKind::User
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    PageAlreadyPresent,
    NotMapped,
    KernelAddress,
    NoFrames,
    OutOfMemory,
}

impl core::fmt::Display for PagingError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            PagingError::PageAlreadyPresent => write!(f, "page already mapped"),
            PagingError::NotMapped => write!(f, "page not mapped"),
            PagingError::KernelAddress => write!(f, "address in kernel space"),
            PagingError::NoFrames => write!(f, "out of physical frames"),
            PagingError::OutOfMemory => write!(f, "kernel heap exhausted"),
        }
    }
}

pub type PagingResult<T> = Result<T, PagingError>;

impl From<FrameError> for PagingError {
    fn from(e: FrameError) -> PagingError {
        match e {
            FrameError::NoFrames => PagingError::NoFrames,
            _ => PagingError::KernelAddress,
        }
    }
}

pub const fn dir_index(va: usize) -> usize {
    (va >> 22) & 0x3FF
}

pub const fn table_index(va: usize) -> usize {
    (va >> 12) & 0x3FF
}

#[repr(C, align(4096))]
struct EntryPage([u32; ENTRIES]);

/// Boot page directory and the kernel page tables direct-mapping the low
/// 16 MiB. Every process directory shares these tables, so a kernel mapping
/// edited once (the scratch window) is visible everywhere.
static mut KERNEL_DIR: EntryPage = EntryPage([0; ENTRIES]);
static mut KERNEL_TABLES: [EntryPage; KERNEL_TABLE_COUNT] =
    [const { EntryPage([0; ENTRIES]) }; KERNEL_TABLE_COUNT];

/// The all-zero page every ZFOD PTE maps. Lives in kernel .bss; its direct
/// mapping loses the writable bit at boot so it can never be dirtied.
#[repr(C, align(4096))]
struct ZeroFrame([u8; PAGE_SIZE]);
static ZERO_FRAME: ZeroFrame = ZeroFrame([0; PAGE_SIZE]);

pub fn zero_frame_addr() -> usize {
    &ZERO_FRAME as *const ZeroFrame as usize
}

static SCRATCH_LOCK: Mutex<()> = Mutex::new(());

fn kernel_dir_addr() -> usize {
    core::ptr::addr_of!(KERNEL_DIR) as usize
}

unsafe fn kernel_table_entry(va: usize) -> *mut u32 {
    let table = core::ptr::addr_of_mut!(KERNEL_TABLES) as *mut EntryPage;
    unsafe {
        let page = table.add(dir_index(va));
        (page as *mut u32).add(table_index(va))
    }
}

/// Build the kernel direct map, drop the zero frame's writable bit, and turn
/// paging on.
///
/// # Safety
/// Must run once, before any user mapping exists, with interrupts off.
pub unsafe fn init_paging() {
    let kernel_flags =
        PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::GLOBAL;

    unsafe {
        let dir = core::ptr::addr_of_mut!(KERNEL_DIR) as *mut u32;
        let tables = core::ptr::addr_of_mut!(KERNEL_TABLES) as *mut EntryPage;

        for dir_slot in 0..KERNEL_TABLE_COUNT {
            let table = tables.add(dir_slot);
            for entry in 0..ENTRIES {
                let frame = (dir_slot * ENTRIES + entry) * PAGE_SIZE;
                (table as *mut u32).add(entry).write(frame as u32 | kernel_flags.bits());
            }
            dir.add(dir_slot).write(
                table as u32 | (PteFlags::PRESENT | PteFlags::WRITABLE).bits(),
            );
        }

        // The scratch window starts unmapped.
        kernel_table_entry(SCRATCH_VA).write(0);

        // Zero frame: read-only even for the kernel (CR0.WP is set).
        let zf = zero_frame_addr();
        let zf_pte = kernel_table_entry(zf);
        zf_pte.write(zf_pte.read() & !PteFlags::WRITABLE.bits());

        arch::enable_global_pages();
        arch::enable_paging(kernel_dir_addr() as u32);
    }
}

/// Map `frame` into the scratch window for the duration of `f`. The window is
/// the only way to touch a frame that no user PTE maps yet.
pub fn with_scratch<R>(frame: usize, f: impl FnOnce(*mut u8) -> R) -> R {
    let _guard = SCRATCH_LOCK.lock();
    unsafe {
        let pte = kernel_table_entry(SCRATCH_VA);
        pte.write(frame as u32 | (PteFlags::PRESENT | PteFlags::WRITABLE).bits());
        arch::invlpg(SCRATCH_VA as u32);
        let result = f(SCRATCH_VA as *mut u8);
        pte.write(0);
        arch::invlpg(SCRATCH_VA as u32);
        result
    }
}

fn zero_frame_via_scratch(frame: usize) {
    with_scratch(frame, |page| unsafe {
        core::ptr::write_bytes(page, 0, PAGE_SIZE);
    });
}

/// A per-process page directory. The backing directory page and all user page
/// tables come from the kernel heap (virtual == physical); user data frames
/// come from the frame pool.
pub struct PageDirectory {
    root: usize,
}

// Directories are handed between threads under the process lock; the raw
// pointers inside never alias another directory's tables.
unsafe impl Send for PageDirectory {}

impl PageDirectory {
    /// Fresh directory containing only the shared kernel mappings.
    pub fn new() -> PagingResult<PageDirectory> {
        let root = crate::allocator::alloc_kernel_page().ok_or(PagingError::OutOfMemory)?;
        let dir = PageDirectory { root: root as usize };
        unsafe {
            let src = kernel_dir_addr() as *const u32;
            let dst = root as *mut u32;
            for slot in 0..KERNEL_TABLE_COUNT {
                dst.add(slot).write(src.add(slot).read());
            }
        }
        Ok(dir)
    }

    pub fn root_addr(&self) -> usize {
        self.root
    }

    unsafe fn pde(&self, va: usize) -> *mut u32 {
        unsafe { (self.root as *mut u32).add(dir_index(va)) }
    }

    /// Pointer to the PTE for `va`, if its page table exists.
    fn pte_ptr(&self, va: usize) -> Option<*mut u32> {
        unsafe {
            let pde = self.pde(va).read();
            if pde & PteFlags::PRESENT.bits() == 0 {
                return None;
            }
            let table = (pde & PTE_ADDR_MASK) as *mut u32;
            Some(table.add(table_index(va)))
        }
    }

    /// PTE pointer for `va`, allocating the page table on first use.
    fn ensure_pte_ptr(&mut self, va: usize) -> PagingResult<*mut u32> {
        if let Some(pte) = self.pte_ptr(va) {
            return Ok(pte);
        }
        let table = crate::allocator::alloc_kernel_page().ok_or(PagingError::OutOfMemory)?;
        unsafe {
            self.pde(va).write(
                table as u32
                    | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER).bits(),
            );
            Ok((table as *mut u32).add(table_index(va)))
        }
    }

    pub fn pte(&self, va: usize) -> Option<u32> {
        let pte = unsafe { self.pte_ptr(va)?.read() };
        if pte & PteFlags::PRESENT.bits() != 0 {
            Some(pte)
        } else {
            None
        }
    }

    /// Map one user page at `va`.
    ///
    /// * `ref_frame` supplied: share that frame copy-on-write.
    /// * `PageKind::Bss`: map the zero frame, zero-fill-on-demand.
    /// * otherwise: claim a fresh (zeroed) frame, writable per `kind`.
    pub fn create_page(
        &mut self,
        va: usize,
        kind: PageKind,
        ref_frame: Option<usize>,
    ) -> PagingResult<()> {
        if va < USER_MEM_START {
            return Err(PagingError::KernelAddress);
        }
        let pte_ptr = self.ensure_pte_ptr(va)?;
        unsafe {
            if pte_ptr.read() & PteFlags::PRESENT.bits() != 0 {
                return Err(PagingError::PageAlreadyPresent);
            }

            let base = PteFlags::PRESENT | PteFlags::USER;
            let pte = match (ref_frame, kind) {
                (Some(frame), _) => {
                    frames::get(frame)?;
                    frame as u32 | (base | PteFlags::COW).bits()
                }
                (None, PageKind::Bss) => {
                    zero_frame_addr() as u32 | (base | PteFlags::ZFOD).bits()
                }
                (None, kind) => {
                    let frame = frames::allocate()?;
                    zero_frame_via_scratch(frame);
                    let mut flags = base;
                    if kind.writable() {
                        flags |= PteFlags::WRITABLE;
                    }
                    frame as u32 | flags.bits()
                }
            };
            pte_ptr.write(pte);
        }
        arch::invlpg(va as u32);
        Ok(())
    }

    /// Unmap one user page and release its frame (the zero frame is shared
    /// and never released).
    pub fn destroy_page(&mut self, va: usize) -> PagingResult<()> {
        if va < USER_MEM_START {
            return Err(PagingError::KernelAddress);
        }
        let pte_ptr = self.pte_ptr(va).ok_or(PagingError::NotMapped)?;
        unsafe {
            let pte = pte_ptr.read();
            if pte & PteFlags::PRESENT.bits() == 0 {
                return Err(PagingError::NotMapped);
            }
            let frame = (pte & PTE_ADDR_MASK) as usize;
            if frame != zero_frame_addr() {
                // Kernel frames (the zero frame aside) never appear in user
                // PTEs, so an error here means corrupted bookkeeping.
                frames::free(frame).expect("frame accounting inconsistent");
            }
            pte_ptr.write(0);
        }
        arch::invlpg(va as u32);
        Ok(())
    }

    /// Release every user mapping, leaving only kernel space. Used by exec to
    /// wipe the caller before loading the new image, and by teardown.
    pub fn reset(&mut self) {
        for dir_slot in KERNEL_TABLE_COUNT..ENTRIES {
            unsafe {
                let pde_ptr = (self.root as *mut u32).add(dir_slot);
                let pde = pde_ptr.read();
                if pde & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let table = (pde & PTE_ADDR_MASK) as *mut u32;
                for entry in 0..ENTRIES {
                    let pte = table.add(entry).read();
                    if pte & PteFlags::PRESENT.bits() == 0 {
                        continue;
                    }
                    let frame = (pte & PTE_ADDR_MASK) as usize;
                    if frame != zero_frame_addr() {
                        frames::free(frame).expect("frame accounting inconsistent");
                    }
                    table.add(entry).write(0);
                }
                crate::allocator::free_kernel_page(table as *mut u8);
                pde_ptr.write(0);
            }
        }
        arch::flush_tlb();
    }

    /// Clone this directory for a forked child. Every shared frame gains a
    /// reference; writable pages lose their writable bit on both sides and
    /// gain COW. A saturated refcount falls back to an eager private copy; a
    /// hard failure destroys the partial child and propagates. The parent may
    /// be left with some writable bits already cleared, which is harmless:
    /// the next write faults, sees a sole owner, and upgrades in place.
    pub fn clone_for_fork(&self) -> PagingResult<PageDirectory> {
        let mut child = PageDirectory::new()?;
        let result = self.clone_into(&mut child);
        arch::flush_tlb();
        match result {
            Ok(()) => Ok(child),
            Err(e) => Err(e),
        }
    }

    fn clone_into(&self, child: &mut PageDirectory) -> PagingResult<()> {
        for dir_slot in KERNEL_TABLE_COUNT..ENTRIES {
            let pde = unsafe { (self.root as *const u32).add(dir_slot).read() };
            if pde & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            let table = (pde & PTE_ADDR_MASK) as *mut u32;
            for entry in 0..ENTRIES {
                let pte_ptr = unsafe { table.add(entry) };
                let pte = unsafe { pte_ptr.read() };
                if pte & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let va = (dir_slot << 22) | (entry << 12);
                let frame = (pte & PTE_ADDR_MASK) as usize;
                let child_pte = child.ensure_pte_ptr(va)?;

                match frames::get(frame) {
                    Ok(_) => {
                        let mut word = pte;
                        if pte & PteFlags::WRITABLE.bits() != 0 {
                            word &= !PteFlags::WRITABLE.bits();
                            word |= PteFlags::COW.bits();
                            unsafe { pte_ptr.write(word) };
                        }
                        unsafe { child_pte.write(word) };
                    }
                    Err(FrameError::TooManyOwners) => {
                        // Sharing is saturated; give the child its own frame
                        // now instead of dropping the excess owner.
                        let fresh = frames::allocate()?;
                        with_scratch(fresh, |dst| unsafe {
                            core::ptr::copy_nonoverlapping(
                                va as *const u8,
                                dst,
                                PAGE_SIZE,
                            );
                        });
                        let mut word = (fresh as u32) | (pte & !PTE_ADDR_MASK);
                        if pte & PteFlags::COW.bits() != 0 {
                            word &= !PteFlags::COW.bits();
                            word |= PteFlags::WRITABLE.bits();
                        }
                        unsafe { child_pte.write(word) };
                    }
                    Err(FrameError::KernelFrame) => {
                        // The zero frame: share as-is, no refcount.
                        unsafe { child_pte.write(pte) };
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if self.root == 0 {
            return;
        }
        self.reset();
        unsafe {
            crate::allocator::free_kernel_page(self.root as *mut u8);
        }
        self.root = 0;
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ── Operations on whatever directory CR3 currently points at ──
//
// The page-fault path and the syscall validators work on the live directory
// rather than chasing the owning process, since a fault is always against the
// faulting thread's own address space.

fn current_pte_ptr(va: usize) -> Option<*mut u32> {
    let root = (arch::read_cr3() & PTE_ADDR_MASK) as usize;
    unsafe {
        let pde = (root as *const u32).add(dir_index(va)).read();
        if pde & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        let table = (pde & PTE_ADDR_MASK) as *mut u32;
        Some(table.add(table_index(va)))
    }
}

pub fn current_pte(va: usize) -> Option<u32> {
    let pte = unsafe { current_pte_ptr(va)?.read() };
    if pte & PteFlags::PRESENT.bits() != 0 {
        Some(pte)
    } else {
        None
    }
}

/// Physical frame backing `va` in the live directory.
pub fn current_frame_of(va: usize) -> Option<usize> {
    current_pte(va).map(|pte| (pte & PTE_ADDR_MASK) as usize)
}

/// Point the live PTE for `va` at a different frame, keeping its flags.
pub fn current_retarget(va: usize, new_frame: usize) {
    if let Some(ptr) = current_pte_ptr(va) {
        unsafe {
            let pte = ptr.read();
            ptr.write((new_frame as u32) | (pte & !PTE_ADDR_MASK));
        }
        arch::invlpg(va as u32);
    }
}

fn current_update_flags(va: usize, set: PteFlags, clear: PteFlags) {
    if let Some(ptr) = current_pte_ptr(va) {
        unsafe {
            let pte = ptr.read();
            ptr.write((pte | set.bits()) & !clear.bits());
        }
        arch::invlpg(va as u32);
    }
}

/// Can user code read (or write, if `write`) the byte at `va` right now?
/// ZFOD and COW pages count as writable: the write will fault and be repaired
/// rather than refused.
pub fn user_accessible(va: usize, write: bool) -> bool {
    if va < USER_MEM_START {
        return false;
    }
    let Some(pte) = current_pte(va) else {
        return false;
    };
    if pte & PteFlags::USER.bits() == 0 {
        return false;
    }
    if !write {
        return true;
    }
    pte & (PteFlags::WRITABLE | PteFlags::ZFOD | PteFlags::COW).bits() != 0
}

/// What became of a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Mapping repaired; retry the instruction.
    Repaired,
    /// Not repairable here; deliver to the thread (swexn or kill).
    Deliver,
}

/// The repair half of the page-fault policy: ZFOD upgrade first, then COW
/// duplication. Anything else (including allocation failure under memory
/// pressure) is handed back for delivery.
pub fn repair_fault(fault_va: usize) -> FaultOutcome {
    if fault_va < USER_MEM_START {
        return FaultOutcome::Deliver;
    }
    let page = super::page_align_down(fault_va);
    let Some(pte) = current_pte(page) else {
        return FaultOutcome::Deliver;
    };

    if pte & PteFlags::ZFOD.bits() != 0 {
        match frames::allocate() {
            Ok(frame) => {
                if let Some(ptr) = current_pte_ptr(page) {
                    unsafe {
                        let word = (frame as u32)
                            | ((pte & !PTE_ADDR_MASK | PteFlags::WRITABLE.bits())
                                & !PteFlags::ZFOD.bits());
                        ptr.write(word);
                    }
                    arch::invlpg(page as u32);
                    unsafe {
                        core::ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE);
                    }
                    return FaultOutcome::Repaired;
                }
                FaultOutcome::Deliver
            }
            Err(_) => FaultOutcome::Deliver,
        }
    } else if pte & PteFlags::COW.bits() != 0 {
        current_update_flags(page, PteFlags::WRITABLE, PteFlags::COW);
        match frames::copy_on_write(page) {
            Ok(()) => FaultOutcome::Repaired,
            Err(_) => FaultOutcome::Deliver,
        }
    } else {
        FaultOutcome::Deliver
    }
}

/// Copy `bytes` into the frame backing `va`, regardless of PTE writability.
/// The loader uses this to fill read-only text/rodata/argv pages.
pub fn fill_page(va: usize, offset: usize, bytes: &[u8]) -> PagingResult<()> {
    assert!(offset + bytes.len() <= PAGE_SIZE);
    let page = super::page_align_down(va);
    let frame = current_frame_of(page).ok_or(PagingError::NotMapped)?;
    with_scratch(frame, |dst| unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.add(offset), bytes.len());
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_split() {
        let va = 0x0123_4567;
        assert_eq!(dir_index(va), 0x4);
        assert_eq!(table_index(va), 0x234);
        assert_eq!(dir_index(USER_MEM_START), KERNEL_TABLE_COUNT);
    }

    #[test]
    fn page_kind_writability() {
        assert!(!PageKind::Text.writable());
        assert!(!PageKind::Rodata.writable());
        assert!(!PageKind::Bss.writable());
        assert!(PageKind::Data.writable());
        assert!(PageKind::Heap.writable());
        assert!(PageKind::Stack.writable());
        assert!(PageKind::User.writable());
    }

    #[test]
    fn cow_flag_algebra() {
        // A shared writable PTE loses WRITABLE and gains COW.
        let pte = 0x0200_0000u32 | (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE).bits();
        let mut word = pte;
        word &= !PteFlags::WRITABLE.bits();
        word |= PteFlags::COW.bits();
        assert_eq!(word & PteFlags::WRITABLE.bits(), 0);
        assert_ne!(word & PteFlags::COW.bits(), 0);
        assert_eq!(word & PTE_ADDR_MASK, pte & PTE_ADDR_MASK);
    }

    #[test]
    fn software_bits_dont_overlap_hardware() {
        let hw = PteFlags::PRESENT
            | PteFlags::WRITABLE
            | PteFlags::USER
            | PteFlags::WRITE_THROUGH
            | PteFlags::NO_CACHE
            | PteFlags::ACCESSED
            | PteFlags::DIRTY
            | PteFlags::GLOBAL;
        assert_eq!(hw.bits() & PteFlags::ZFOD.bits(), 0);
        assert_eq!(hw.bits() & PteFlags::COW.bits(), 0);
        assert_eq!((PteFlags::ZFOD | PteFlags::COW).bits() & PTE_ADDR_MASK, 0);
    }
}
