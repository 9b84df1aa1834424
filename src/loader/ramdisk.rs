//! The RAM disk: a read-only table of contents over the program image blob
//! the boot loader hands us as a module. Format, little-endian:
//!
//! ```text
//! magic "QRD1" | count: u32 | count * { name: [u8; 32] NUL-padded,
//!                                       offset: u32, len: u32 } | payload
//! ```
//!
//! `exec` and `readfile` look entries up by exact name.

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

pub const TOC_MAGIC: &[u8; 4] = b"QRD1";
const NAME_LEN: usize = 32;
const ENTRY_LEN: usize = NAME_LEN + 8;

struct Entry {
    name: String,
    data: &'static [u8],
}

static RAMDISK: Mutex<Vec<Entry>> = Mutex::new(Vec::new());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocError {
    BadMagic,
    Truncated,
    BadName,
    BadRange,
}

/// Parse the TOC into (name, byte-range) pairs. Pure; the caller resolves
/// ranges against the blob.
fn parse(blob: &[u8]) -> Result<Vec<(String, usize, usize)>, TocError> {
    if blob.len() < 8 || &blob[0..4] != TOC_MAGIC {
        return Err(TocError::BadMagic);
    }
    let count = u32::from_le_bytes(blob[4..8].try_into().unwrap()) as usize;
    let header_len = 8 + count * ENTRY_LEN;
    if blob.len() < header_len {
        return Err(TocError::Truncated);
    }

    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        let at = 8 + index * ENTRY_LEN;
        let raw_name = &blob[at..at + NAME_LEN];
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        if name_len == 0 {
            return Err(TocError::BadName);
        }
        let name = core::str::from_utf8(&raw_name[..name_len])
            .map_err(|_| TocError::BadName)?;

        let offset =
            u32::from_le_bytes(blob[at + NAME_LEN..at + NAME_LEN + 4].try_into().unwrap())
                as usize;
        let len =
            u32::from_le_bytes(blob[at + NAME_LEN + 4..at + ENTRY_LEN].try_into().unwrap())
                as usize;
        let end = offset.checked_add(len).ok_or(TocError::BadRange)?;
        if offset < header_len || end > blob.len() {
            return Err(TocError::BadRange);
        }
        entries.push((String::from(name), offset, len));
    }
    Ok(entries)
}

/// Mount the boot module as the RAM disk.
pub fn init(blob: &'static [u8]) {
    match parse(blob) {
        Ok(parsed) => {
            let mut disk = RAMDISK.lock();
            for (name, offset, len) in parsed {
                disk.push(Entry {
                    name,
                    data: &blob[offset..offset + len],
                });
            }
            crate::log_info!("RAM disk mounted: {} programs.", disk.len());
            for entry in disk.iter() {
                crate::log_info!("  {} ({} bytes)", entry.name, entry.data.len());
            }
        }
        Err(e) => {
            crate::log_error!("RAM disk rejected: {:?}", e);
        }
    }
}

/// Exact-name lookup.
pub fn lookup(name: &str) -> Option<&'static [u8]> {
    RAMDISK
        .lock()
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let header_len = 8 + entries.len() * ENTRY_LEN;
        let mut toc = Vec::new();
        toc.extend_from_slice(TOC_MAGIC);
        toc.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        let mut payload = Vec::new();
        for (name, data) in entries {
            let mut raw_name = [0u8; NAME_LEN];
            raw_name[..name.len()].copy_from_slice(name.as_bytes());
            toc.extend_from_slice(&raw_name);
            toc.extend_from_slice(&((header_len + payload.len()) as u32).to_le_bytes());
            toc.extend_from_slice(&(data.len() as u32).to_le_bytes());
            payload.extend_from_slice(data);
        }
        toc.extend_from_slice(&payload);
        toc
    }

    #[test]
    fn parses_entries_in_order() {
        let data = blob(&[("idle", b"AAAA"), ("init", b"BBBBBB")]);
        let parsed = parse(&data).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "idle");
        assert_eq!(parsed[1].0, "init");
        let (_, off, len) = parsed[1];
        assert_eq!(&data[off..off + len], b"BBBBBB");
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut data = blob(&[("idle", b"AAAA")]);
        data[0] = b'X';
        assert_eq!(parse(&data), Err(TocError::BadMagic));
    }

    #[test]
    fn rejects_truncated_header() {
        let data = blob(&[("idle", b"AAAA")]);
        assert_eq!(parse(&data[..12]), Err(TocError::Truncated));
    }

    #[test]
    fn rejects_out_of_range_payload() {
        let mut data = blob(&[("idle", b"AAAA")]);
        let at = 8 + NAME_LEN + 4;
        data[at..at + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        assert_eq!(parse(&data), Err(TocError::BadRange));
    }

    #[test]
    fn rejects_empty_names() {
        let data = blob(&[("", b"AAAA")]);
        assert_eq!(parse(&data), Err(TocError::BadName));
    }
}
