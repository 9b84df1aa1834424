//! ELF32 loader. `parse` validates the image and digests its PT_LOAD
//! segments; `load` maps them into a page directory: text and rodata as
//! read-only frames, data as writable frames, fully-uninitialized writable
//! pages as zero-fill-on-demand.

use alloc::vec::Vec;
use core::fmt;

use crate::memory::paging::{PageDirectory, PageKind};
use crate::memory::{page_align_down, page_align_up, PAGE_SIZE, USER_MEM_START, USER_STACK_TOP};
use crate::syscalls::error::KernelResult;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    MemoryError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "File not found"),
            ExecError::InvalidFormat => write!(f, "Invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF type (need ET_EXEC)"),
            ExecError::MemoryError => write!(f, "Memory allocation error"),
        }
    }
}

/// One PT_LOAD segment, digested.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: usize,
    pub offset: usize,
    pub filesz: usize,
    pub memsz: usize,
    pub writable: bool,
    pub executable: bool,
}

impl Segment {
    fn kind(&self) -> PageKind {
        if self.writable {
            PageKind::Data
        } else if self.executable {
            PageKind::Text
        } else {
            PageKind::Rodata
        }
    }
}

pub struct ElfImage {
    pub entry: u32,
    pub segments: Vec<Segment>,
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

/// Validate the header and digest the program headers. Everything that can
/// be rejected is rejected here, before exec wipes the caller.
pub fn parse(data: &[u8]) -> Result<ElfImage, ExecError> {
    if data.len() < 52 || data[0..4] != ELF_MAGIC {
        return Err(ExecError::InvalidFormat);
    }
    if data[4] != ELFCLASS32 || data[5] != ELFDATA2LSB {
        return Err(ExecError::UnsupportedArch);
    }
    let e_type = read_u16(data, 16).ok_or(ExecError::InvalidFormat)?;
    let e_machine = read_u16(data, 18).ok_or(ExecError::InvalidFormat)?;
    if e_type != ET_EXEC {
        return Err(ExecError::UnsupportedType);
    }
    if e_machine != EM_386 {
        return Err(ExecError::UnsupportedArch);
    }

    let entry = read_u32(data, 24).ok_or(ExecError::InvalidFormat)?;
    let phoff = read_u32(data, 28).ok_or(ExecError::InvalidFormat)? as usize;
    let phentsize = read_u16(data, 42).ok_or(ExecError::InvalidFormat)? as usize;
    let phnum = read_u16(data, 44).ok_or(ExecError::InvalidFormat)? as usize;
    if phentsize < 32 || phnum == 0 {
        return Err(ExecError::InvalidFormat);
    }

    let mut segments = Vec::new();
    for index in 0..phnum {
        let at = phoff + index * phentsize;
        let p_type = read_u32(data, at).ok_or(ExecError::InvalidFormat)?;
        if p_type != PT_LOAD {
            continue;
        }
        let offset = read_u32(data, at + 4).ok_or(ExecError::InvalidFormat)? as usize;
        let vaddr = read_u32(data, at + 8).ok_or(ExecError::InvalidFormat)? as usize;
        let filesz = read_u32(data, at + 16).ok_or(ExecError::InvalidFormat)? as usize;
        let memsz = read_u32(data, at + 20).ok_or(ExecError::InvalidFormat)? as usize;
        let flags = read_u32(data, at + 24).ok_or(ExecError::InvalidFormat)?;

        if filesz > memsz {
            return Err(ExecError::InvalidFormat);
        }
        if offset.checked_add(filesz).map(|end| end > data.len()).unwrap_or(true) {
            return Err(ExecError::InvalidFormat);
        }
        let end = vaddr.checked_add(memsz).ok_or(ExecError::InvalidFormat)?;
        if vaddr < USER_MEM_START || end > USER_STACK_TOP - PAGE_SIZE {
            return Err(ExecError::InvalidFormat);
        }

        segments.push(Segment {
            vaddr,
            offset,
            filesz,
            memsz,
            writable: flags & PF_W != 0,
            executable: flags & PF_X != 0,
        });
    }

    if segments.is_empty() {
        return Err(ExecError::InvalidFormat);
    }
    if !(USER_MEM_START..USER_STACK_TOP).contains(&(entry as usize)) {
        return Err(ExecError::InvalidFormat);
    }

    Ok(ElfImage { entry, segments })
}

/// Map and fill every segment page into `dir` (the caller's live directory).
/// Each page is mapped exactly once; overlapping segments surface as
/// PageAlreadyPresent.
pub fn load(dir: &mut PageDirectory, data: &[u8], image: &ElfImage) -> KernelResult<()> {
    for segment in &image.segments {
        let file_end = segment.vaddr + segment.filesz;
        let first_page = page_align_down(segment.vaddr);
        let last_page = page_align_up(segment.vaddr + segment.memsz);

        let mut page = first_page;
        while page < last_page {
            if page < file_end {
                dir.create_page(page, segment.kind(), None)?;
                let copy_from = core::cmp::max(page, segment.vaddr);
                let copy_to = core::cmp::min(page + PAGE_SIZE, file_end);
                let bytes = &data[segment.offset + (copy_from - segment.vaddr)
                    ..segment.offset + (copy_to - segment.vaddr)];
                crate::memory::paging::fill_page(copy_from, copy_from - page, bytes)?;
            } else if segment.writable {
                // Pure BSS pages: shared zero frame, upgraded on write.
                dir.create_page(page, PageKind::Bss, None)?;
            } else {
                dir.create_page(page, PageKind::Rodata, None)?;
            }
            page += PAGE_SIZE;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Handcraft a minimal ELF32 with one PT_LOAD segment.
    fn image(vaddr: u32, filesz: u32, memsz: u32, flags: u32) -> Vec<u8> {
        let mut data = alloc::vec![0u8; 52 + 32 + 64];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS32;
        data[5] = ELFDATA2LSB;
        data[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        data[18..20].copy_from_slice(&EM_386.to_le_bytes());
        data[24..28].copy_from_slice(&vaddr.to_le_bytes()); // entry
        data[28..32].copy_from_slice(&52u32.to_le_bytes()); // phoff
        data[42..44].copy_from_slice(&32u16.to_le_bytes()); // phentsize
        data[44..46].copy_from_slice(&1u16.to_le_bytes()); // phnum

        let ph = 52;
        data[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        data[ph + 4..ph + 8].copy_from_slice(&84u32.to_le_bytes()); // offset
        data[ph + 8..ph + 12].copy_from_slice(&vaddr.to_le_bytes());
        data[ph + 16..ph + 20].copy_from_slice(&filesz.to_le_bytes());
        data[ph + 20..ph + 24].copy_from_slice(&memsz.to_le_bytes());
        data[ph + 24..ph + 28].copy_from_slice(&flags.to_le_bytes());
        data
    }

    #[test]
    fn parses_a_minimal_executable() {
        let data = image(0x0100_0000, 16, 16, PF_X);
        let parsed = parse(&data).unwrap();
        assert_eq!(parsed.entry, 0x0100_0000);
        assert_eq!(parsed.segments.len(), 1);
        assert!(parsed.segments[0].executable);
        assert!(!parsed.segments[0].writable);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = image(0x0100_0000, 16, 16, PF_X);
        data[0] = 0x7E;
        assert!(matches!(parse(&data), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn rejects_sixty_four_bit_images() {
        let mut data = image(0x0100_0000, 16, 16, PF_X);
        data[4] = 2; // ELFCLASS64
        assert!(matches!(parse(&data), Err(ExecError::UnsupportedArch)));
    }

    #[test]
    fn rejects_relocatable_objects() {
        let mut data = image(0x0100_0000, 16, 16, PF_X);
        data[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        assert!(matches!(parse(&data), Err(ExecError::UnsupportedType)));
    }

    #[test]
    fn rejects_kernel_space_segments() {
        let data = image(0x0000_1000, 16, 16, PF_X);
        assert!(matches!(parse(&data), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn rejects_file_larger_than_memory() {
        let data = image(0x0100_0000, 32, 16, PF_X);
        assert!(matches!(parse(&data), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn segment_kind_follows_flags() {
        let text = Segment {
            vaddr: 0,
            offset: 0,
            filesz: 0,
            memsz: 0,
            writable: false,
            executable: true,
        };
        let data = Segment { writable: true, executable: false, ..text };
        let rodata = Segment { writable: false, executable: false, ..text };
        assert_eq!(text.kind(), PageKind::Text);
        assert_eq!(data.kind(), PageKind::Data);
        assert_eq!(rodata.kind(), PageKind::Rodata);
    }
}
