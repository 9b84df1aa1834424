pub mod frames;
pub mod paging;

/// One page/frame, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Everything below this address is kernel space: direct-mapped, supervisor,
/// global, identical in every page directory. Everything at or above it is
/// per-process user space.
pub const USER_MEM_START: usize = 0x0100_0000;

/// Per-thread kernel stack (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 4 * PAGE_SIZE;

/// Top of the initial user stack page. The read-only argv pages occupy the
/// 4 MiB above this.
pub const USER_STACK_TOP: usize = 0xFFC0_0000;

pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

/// Bring up the whole memory subsystem from the multiboot2 boot info:
/// kernel page directory + paging enable, then the heap, then the
/// ref-counted user frame pool sized from the memory map.
pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("Failed to load Multiboot2 info!")
    };
    let memory_map_tag = boot_info.memory_map_tag().expect("Memory map tag required");

    // The user frame pool is the tail of the available region that spans
    // USER_MEM_START; holes and reserved ranges beyond it are left alone.
    let mut phys_end: usize = 0;
    for area in memory_map_tag.memory_areas() {
        if area.typ() != multiboot2::MemoryAreaType::Available {
            continue;
        }
        let start = area.start_address() as usize;
        let end = (area.start_address() + area.size()) as usize;
        if start <= USER_MEM_START && end > USER_MEM_START {
            phys_end = end;
        }
    }
    assert!(
        phys_end > USER_MEM_START,
        "machine has no usable memory above USER_MEM_START"
    );

    unsafe {
        paging::init_paging();
    }
    crate::log_info!("Paging enabled, kernel direct map in place.");

    unsafe {
        crate::allocator::init_heap();
    }
    crate::log_info!("Kernel heap initialized.");

    frames::init(USER_MEM_START, page_align_down(phys_end));
    crate::log_info!(
        "Frame pool: {} user frames above {:#x}.",
        frames::frame_count(),
        USER_MEM_START
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(page_align_down(0x1234), 0x1000);
        assert_eq!(page_align_up(0x1234), 0x2000);
        assert_eq!(page_align_up(0x2000), 0x2000);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3001));
    }
}
