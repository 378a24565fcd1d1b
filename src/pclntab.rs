//! PCLNTAB header recognition and byte-pattern search.
//!
//! Stripped binaries (and all PE binaries) carry no `runtime.pclntab`
//! symbol, so the table has to be found by scanning read-only data for its
//! header: a 4-byte version magic, two pad bytes, the instruction quantum
//! and the pointer size.

use crate::error::{Error, Result};

/// Header magics in on-disk order, newest first. The value is stored in the
/// byte order of the target, so the search patterns are built per-endianness.
pub const MAGIC_1_20: u32 = 0xFFFF_FFF1;
pub const MAGIC_1_18: u32 = 0xFFFF_FFF0;
pub const MAGIC_1_16: u32 = 0xFFFF_FFFA;
pub const MAGIC_1_2: u32 = 0xFFFF_FFFB;

const MAGICS: [u32; 4] = [MAGIC_1_20, MAGIC_1_18, MAGIC_1_16, MAGIC_1_2];

/// Checks the six bytes after a magic match: pad must be zero, the quantum
/// and pointer size must be small powers of two.
fn header_sane(buf: &[u8]) -> bool {
    if buf.len() < 16 {
        return false;
    }
    buf[4] == 0
        && buf[5] == 0
        && matches!(buf[6], 1 | 2 | 4)
        && matches!(buf[7], 4 | 8)
}

/// Returns true if `data` begins with a plausible PCLNTAB header.
pub fn has_pclntab_header(data: &[u8], big_endian: bool) -> bool {
    if data.len() < 16 {
        return false;
    }
    let magic = if big_endian {
        u32::from_be_bytes([data[0], data[1], data[2], data[3]])
    } else {
        u32::from_le_bytes([data[0], data[1], data[2], data[3]])
    };
    MAGICS.contains(&magic) && header_sane(data)
}

/// Scans a section for the PCLNTAB and returns the byte offset of the header.
///
/// The newest magic is tried first, scanning backwards from the end of the
/// section; a match with a malformed header resumes the search earlier in
/// the buffer. The caller slices the section tail from the returned offset.
pub fn search_section_for_tab(data: &[u8], big_endian: bool) -> Result<usize> {
    for magic in MAGICS {
        let needle = if big_endian {
            magic.to_be_bytes()
        } else {
            magic.to_le_bytes()
        };

        let mut window = data;
        while let Some(off) = memchr::memmem::rfind(window, &needle) {
            if header_sane(&data[off..]) {
                tracing::debug!(
                    "pclntab header (magic {:#x}) at section offset {:#x}",
                    magic,
                    off
                );
                return Ok(off);
            }
            if off == 0 {
                break;
            }
            window = &window[..off];
        }
    }
    Err(Error::NoPclntab)
}
