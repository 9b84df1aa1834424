//! Kernel heap. A fixed window of the direct-mapped kernel region handed to
//! `linked_list_allocator`; page tables and kernel stacks come from here, so
//! virtual == physical for everything the allocator returns.

use core::alloc::Layout;
use linked_list_allocator::LockedHeap;

use crate::memory::PAGE_SIZE;

/// Heap window inside the direct-mapped kernel 16 MiB.
pub const HEAP_START: usize = 0x0040_0000;
pub const HEAP_SIZE: usize = 0x0080_0000;

#[cfg_attr(target_arch = "x86", global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// # Safety
/// Must be called exactly once, after paging maps the heap window.
pub unsafe fn init_heap() {
    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    }
}

/// Allocate one page-aligned page from the kernel heap. Because the heap is
/// direct-mapped, the returned pointer doubles as the physical address.
pub fn alloc_kernel_page() -> Option<*mut u8> {
    let layout = page_layout();
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

/// # Safety
/// `ptr` must have come from `alloc_kernel_page` and not been freed since.
pub unsafe fn free_kernel_page(ptr: *mut u8) {
    unsafe { alloc::alloc::dealloc(ptr, page_layout()) };
}

fn page_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

