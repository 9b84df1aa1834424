//! Flat IA-32 segmentation: kernel/user code and data segments covering the
//! whole address space, plus one TSS whose esp0 field selects the kernel
//! stack the CPU switches to on a ring 3 -> ring 0 transition.

use bit_field::BitField;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
/// User selectors carry RPL 3.
pub const USER_CS: u16 = 0x18 | 3;
pub const USER_DS: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

/// 32-bit task state segment. Only esp0/ss0 matter to us; hardware task
/// switching is not used.
#[repr(C, packed)]
struct TaskStateSegment {
    link: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldtr: u32,
    iomap_base: u32,
}

static mut TSS: TaskStateSegment = TaskStateSegment {
    link: 0,
    esp0: 0,
    ss0: KERNEL_DS as u32,
    esp1: 0,
    ss1: 0,
    esp2: 0,
    ss2: 0,
    cr3: 0,
    eip: 0,
    eflags: 0,
    eax: 0,
    ecx: 0,
    edx: 0,
    ebx: 0,
    esp: 0,
    ebp: 0,
    esi: 0,
    edi: 0,
    es: 0,
    cs: 0,
    ss: 0,
    ds: 0,
    fs: 0,
    gs: 0,
    ldtr: 0,
    // No I/O permission bitmap: base past the segment limit.
    iomap_base: core::mem::size_of::<TaskStateSegment>() as u32,
};

/// Build a segment descriptor from base/limit/access/flags nibble.
fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut desc: u64 = 0;
    desc.set_bits(0..16, (limit & 0xFFFF) as u64);
    desc.set_bits(16..32, (base & 0xFFFF) as u64);
    desc.set_bits(32..40, ((base >> 16) & 0xFF) as u64);
    desc.set_bits(40..48, access as u64);
    desc.set_bits(48..52, ((limit >> 16) & 0xF) as u64);
    desc.set_bits(52..56, flags as u64);
    desc.set_bits(56..64, ((base >> 24) & 0xFF) as u64);
    desc
}

static mut GDT: [u64; 6] = [0; 6];

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

pub fn init() {
    unsafe {
        let tss_base = core::ptr::addr_of!(TSS) as u32;
        let tss_limit = core::mem::size_of::<TaskStateSegment>() as u32 - 1;

        let gdt = core::ptr::addr_of_mut!(GDT);
        // Flat 4 GiB segments, 4 KiB granularity, 32-bit.
        (*gdt)[0] = 0;
        (*gdt)[1] = descriptor(0, 0xFFFFF, 0x9A, 0xC); // kernel code
        (*gdt)[2] = descriptor(0, 0xFFFFF, 0x92, 0xC); // kernel data
        (*gdt)[3] = descriptor(0, 0xFFFFF, 0xFA, 0xC); // user code
        (*gdt)[4] = descriptor(0, 0xFFFFF, 0xF2, 0xC); // user data
        (*gdt)[5] = descriptor(tss_base, tss_limit, 0x89, 0x0); // available TSS

        load(gdt as u32);
    }
    crate::log_info!("GDT and TSS loaded.");
}

#[cfg(target_arch = "x86")]
unsafe fn load(gdt_base: u32) {
    use core::arch::asm;

    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<[u64; 6]>() - 1) as u16,
        base: gdt_base,
    };
    unsafe {
        asm!(
            "lgdt [{ptr}]",
            // Reload CS with a far return, then the data segments.
            "push {kcs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov {tmp}, {kds}",
            "mov ds, {tmp:x}",
            "mov es, {tmp:x}",
            "mov fs, {tmp:x}",
            "mov gs, {tmp:x}",
            "mov ss, {tmp:x}",
            "ltr {tss:x}",
            ptr = in(reg) &pointer as *const DescriptorTablePointer,
            kcs = const KERNEL_CS as u32,
            kds = const KERNEL_DS as u32,
            tmp = out(reg) _,
            tss = in(reg) TSS_SELECTOR as u32,
        );
    }
}

#[cfg(not(target_arch = "x86"))]
unsafe fn load(_gdt_base: u32) {
    unreachable!("IA-32 only");
}

/// Point the TSS at the dispatched thread's kernel stack; the CPU reads this
/// on the next ring 3 -> ring 0 transition.
pub fn set_tss_esp0(kernel_stack_top: u32) {
    unsafe {
        let tss = core::ptr::addr_of_mut!(TSS);
        (*tss).esp0 = kernel_stack_top;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_packs_fields() {
        // Classic flat 32-bit kernel code descriptor.
        assert_eq!(descriptor(0, 0xFFFFF, 0x9A, 0xC), 0x00CF_9A00_0000_FFFF);
        // TSS descriptor keeps its base split across the high bytes.
        let d = descriptor(0x1234_5678, 0x67, 0x89, 0x0);
        assert_eq!(d & 0xFFFF, 0x67);
        assert_eq!((d >> 16) & 0xFFFF, 0x5678);
        assert_eq!((d >> 32) & 0xFF, 0x34);
        assert_eq!((d >> 56) & 0xFF, 0x12);
    }

    #[test]
    fn selectors_encode_privilege() {
        assert_eq!(KERNEL_CS & 3, 0);
        assert_eq!(USER_CS & 3, 3);
        assert_eq!(USER_DS & 3, 3);
    }
}
