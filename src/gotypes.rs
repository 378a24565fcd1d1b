//! Runtime type descriptor recovery.
//!
//! Walks the moduledata typelink table and decodes each referenced rtype:
//! kind, declared name, size, and the kind-specific pointers (element, key,
//! struct fields, interface methods). Individual malformed descriptors are
//! skipped so one bad record cannot sink the whole listing.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::goversion::GoVersion;
use crate::moduledata::Moduledata;
use crate::{FileHandler, FileInfo};

/// Go runtime kind, mirroring the low five bits of the rtype kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum GoKind {
    Invalid,
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uintptr,
    Float32,
    Float64,
    Complex64,
    Complex128,
    Array,
    Chan,
    Func,
    Interface,
    Map,
    Pointer,
    Slice,
    String,
    Struct,
    UnsafePointer,
}

impl GoKind {
    fn from_byte(b: u8) -> GoKind {
        use GoKind::*;
        match b & 0x1F {
            1 => Bool,
            2 => Int,
            3 => Int8,
            4 => Int16,
            5 => Int32,
            6 => Int64,
            7 => Uint,
            8 => Uint8,
            9 => Uint16,
            10 => Uint32,
            11 => Uint64,
            12 => Uintptr,
            13 => Float32,
            14 => Float64,
            15 => Complex64,
            16 => Complex128,
            17 => Array,
            18 => Chan,
            19 => Func,
            20 => Interface,
            21 => Map,
            22 => Pointer,
            23 => Slice,
            24 => String,
            25 => Struct,
            26 => UnsafePointer,
            _ => Invalid,
        }
    }
}

/// A field of a recovered struct type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoTypeField {
    pub name: String,
    /// Address of the field's type descriptor.
    pub type_addr: u64,
    pub offset: u64,
}

/// A recovered named type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoType {
    pub kind: GoKind,
    /// Declared name as rendered by the runtime, e.g. `json.Decoder`.
    pub name: String,
    /// Package qualifier derived from the name; empty for unnamed types.
    pub package_path: String,
    /// Address of the type descriptor; descriptors are deduplicated on it.
    pub addr: u64,
    /// Size of a value of this type in bytes.
    pub size: u64,
    /// Element descriptor address for pointers, slices, arrays and chans.
    pub elem_addr: Option<u64>,
    /// Key descriptor address for maps.
    pub key_addr: Option<u64>,
    pub fields: Vec<GoTypeField>,
    /// Method names for interface types.
    pub methods: Vec<String>,
}

const MAX_TYPELINKS: u64 = 1_000_000;
const MAX_STRUCT_FIELDS: u64 = 4096;
const MAX_IFACE_METHODS: u64 = 4096;

/// Bit in the rtype tflag byte: the name is stored with a leading `*`.
const TFLAG_EXTRA_STAR: u8 = 0x2;

struct TypeReader<'a> {
    fi: &'a FileInfo,
    version: &'a GoVersion,
    md: &'a Moduledata,
    /// Section holding the types region; name offsets resolve inside it.
    base: u64,
    data: Vec<u8>,
}

impl TypeReader<'_> {
    fn word_size(&self) -> usize {
        self.fi.word_size
    }

    fn u32_at(&self, off: usize) -> Option<u32> {
        let b: [u8; 4] = self.data.get(off..off + 4)?.try_into().ok()?;
        Some(if self.fi.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    fn word_at(&self, off: usize) -> Option<u64> {
        if self.word_size() == 4 {
            return self.u32_at(off).map(u64::from);
        }
        let b: [u8; 8] = self.data.get(off..off + 8)?.try_into().ok()?;
        Some(if self.fi.big_endian {
            u64::from_be_bytes(b)
        } else {
            u64::from_le_bytes(b)
        })
    }

    /// Section offset of a virtual address inside the types section.
    fn offset_of(&self, addr: u64) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let off = usize::try_from(addr - self.base).ok()?;
        (off < self.data.len()).then_some(off)
    }

    /// Size of the fixed rtype prefix.
    fn rtype_size(&self) -> usize {
        4 * self.word_size() + 16
    }

    /// Decodes a runtime name record at a section offset. The length prefix
    /// switched from 2-byte big-endian to varint in Go 1.17.
    fn name_at(&self, off: usize) -> Option<String> {
        let _flags = *self.data.get(off)?;
        let (len, start) = if self.version.at_least(1, 17) {
            let mut len = 0usize;
            let mut shift = 0u32;
            let mut pos = off + 1;
            loop {
                let b = *self.data.get(pos)?;
                pos += 1;
                len |= ((b & 0x7F) as usize) << shift;
                if b & 0x80 == 0 {
                    break;
                }
                shift += 7;
                if shift > 21 {
                    return None;
                }
            }
            (len, pos)
        } else {
            let hi = *self.data.get(off + 1)? as usize;
            let lo = *self.data.get(off + 2)? as usize;
            (hi << 8 | lo, off + 3)
        };
        let bytes = self.data.get(start..start + len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Resolves a 32-bit name offset relative to the types base.
    fn name_from_off(&self, name_off: u32) -> Option<String> {
        let addr = self.md.types_addr.checked_add(u64::from(name_off))?;
        self.name_at(self.offset_of(addr)?)
    }

    /// Decodes the rtype at `addr` plus its kind-specific suffix.
    fn parse_type(&self, addr: u64, fh: &dyn FileHandler) -> Option<GoType> {
        let ws = self.word_size();
        let off = self.offset_of(addr)?;

        let size = self.word_at(off)?;
        let tflag = *self.data.get(off + 2 * ws + 4)?;
        let kind = GoKind::from_byte(*self.data.get(off + 2 * ws + 7)?);

        let mut name = if self.md.legacy_typelinks {
            self.legacy_name(off, fh).unwrap_or_default()
        } else {
            let str_off = self.u32_at(off + 4 * ws + 8)?;
            self.name_from_off(str_off).unwrap_or_default()
        };
        if tflag & TFLAG_EXTRA_STAR != 0 {
            if let Some(stripped) = name.strip_prefix('*') {
                name = stripped.to_string();
            }
        }

        let package_path = match name.rfind('.') {
            Some(i) => name[..i].to_string(),
            None => String::new(),
        };

        let mut t = GoType {
            kind,
            name,
            package_path,
            addr,
            size,
            elem_addr: None,
            key_addr: None,
            fields: Vec::new(),
            methods: Vec::new(),
        };

        if self.md.legacy_typelinks {
            return Some(t);
        }

        let body = off + self.rtype_size();
        match kind {
            GoKind::Pointer | GoKind::Slice | GoKind::Array | GoKind::Chan => {
                t.elem_addr = self.word_at(body);
            }
            GoKind::Map => {
                t.key_addr = self.word_at(body);
                t.elem_addr = self.word_at(body + ws);
            }
            GoKind::Struct => {
                t.fields = self.struct_fields(body).unwrap_or_default();
            }
            GoKind::Interface => {
                t.methods = self.iface_methods(body).unwrap_or_default();
            }
            _ => {}
        }

        Some(t)
    }

    /// Struct bodies begin with a package-path name pointer on newer
    /// runtimes but not on the earliest supported ones, so both shapes are
    /// probed and the one with a self-consistent field slice wins.
    fn struct_fields(&self, body: usize) -> Option<Vec<GoTypeField>> {
        let ws = self.word_size();
        for fields_off in [body + ws, body] {
            let ptr = self.word_at(fields_off)?;
            let len = self.word_at(fields_off + ws)?;
            let cap = self.word_at(fields_off + 2 * ws)?;
            if len != cap || len > MAX_STRUCT_FIELDS {
                continue;
            }
            let mut out = Vec::with_capacity(len as usize);
            let mut rec = self.offset_of(ptr)?;
            for _ in 0..len {
                let name_ptr = self.word_at(rec)?;
                let type_addr = self.word_at(rec + ws)?;
                let offset = self.word_at(rec + 2 * ws)?;
                let name = self
                    .offset_of(name_ptr)
                    .and_then(|o| self.name_at(o))
                    .unwrap_or_default();
                // Runtimes between 1.8 and 1.18 double the offset to carry
                // an embed bit in the low bit.
                let offset = if self.version.at_least(1, 8) && !self.version.at_least(1, 19) {
                    offset >> 1
                } else {
                    offset
                };
                out.push(GoTypeField {
                    name,
                    type_addr,
                    offset,
                });
                rec += 3 * ws;
            }
            return Some(out);
        }
        None
    }

    fn iface_methods(&self, body: usize) -> Option<Vec<String>> {
        let ws = self.word_size();
        // interfaceType: pkgPath name pointer, then the method slice.
        let mhdr = body + ws;
        let ptr = self.word_at(mhdr)?;
        let len = self.word_at(mhdr + ws)?;
        let cap = self.word_at(mhdr + 2 * ws)?;
        if len != cap || len > MAX_IFACE_METHODS {
            return None;
        }
        let mut out = Vec::with_capacity(len as usize);
        let mut rec = self.offset_of(ptr)?;
        for _ in 0..len {
            let name_off = self.u32_at(rec)?;
            if let Some(n) = self.name_from_off(name_off) {
                out.push(n);
            }
            rec += 8;
        }
        Some(out)
    }

    /// Go 1.5/1.6 rtypes carry a pointer to a Go string header instead of a
    /// name offset.
    fn legacy_name(&self, off: usize, fh: &dyn FileHandler) -> Option<String> {
        let ws = self.word_size();
        let str_ptr = self.word_at(off + 4 * ws + 8)?;
        let (base, data) = fh.section_from_address(str_ptr).ok()?;
        let hoff = usize::try_from(str_ptr - base).ok()?;
        let read_word = |o: usize| -> Option<u64> {
            let b = data.get(o..o + ws)?;
            Some(match (ws, self.fi.big_endian) {
                (8, false) => u64::from_le_bytes(b.try_into().ok()?),
                (8, true) => u64::from_be_bytes(b.try_into().ok()?),
                (4, false) => u64::from(u32::from_le_bytes(b.try_into().ok()?)),
                _ => u64::from(u32::from_be_bytes(b.try_into().ok()?)),
            })
        };
        let sptr = read_word(hoff)?;
        let slen = read_word(hoff + ws)?;
        if slen > 4096 {
            return None;
        }
        let (sbase, sdata) = fh.section_from_address(sptr).ok()?;
        let soff = usize::try_from(sptr - sbase).ok()?;
        let bytes = sdata.get(soff..soff + slen as usize)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Recovers every type referenced by the typelink table, deduplicated by
/// descriptor address and sorted by package path then name.
pub(crate) fn parse_types(
    fi: &FileInfo,
    version: &GoVersion,
    fh: &dyn FileHandler,
    md: &Moduledata,
) -> Result<Vec<GoType>> {
    if md.typelink_addr == 0 || md.typelink_count == 0 {
        return Ok(Vec::new());
    }
    if md.typelink_count > MAX_TYPELINKS {
        return Err(Error::Parse("implausible typelink count".into()));
    }

    // The typelink table may live in a different section than the types.
    let (lbase, ldata) = fh.section_from_address(md.typelink_addr)?;
    let loff = usize::try_from(md.typelink_addr - lbase)
        .map_err(|_| Error::Parse("typelink address underflow".into()))?;

    let types_anchor = if md.legacy_typelinks {
        // No types base before 1.7; anchor the reader on the first linked
        // descriptor instead.
        read_link_word(&ldata, loff, fi.word_size, fi.big_endian).unwrap_or(md.typelink_addr)
    } else {
        md.types_addr
    };
    let (base, data) = fh.section_from_address(types_anchor)?;
    let reader = TypeReader {
        fi,
        version,
        md,
        base,
        data,
    };

    let mut seen: HashMap<u64, GoType> = HashMap::new();
    for i in 0..md.typelink_count as usize {
        let addr = if md.legacy_typelinks {
            let off = loff + i * fi.word_size;
            match read_link_word(&ldata, off, fi.word_size, fi.big_endian) {
                Some(a) => a,
                None => break,
            }
        } else {
            let off = loff + i * 4;
            let Some(b) = ldata.get(off..off + 4) else { break };
            let b: [u8; 4] = b.try_into().unwrap();
            let rel = if fi.big_endian {
                i32::from_be_bytes(b)
            } else {
                i32::from_le_bytes(b)
            };
            md.types_addr.wrapping_add(rel as i64 as u64)
        };

        if seen.contains_key(&addr) {
            continue;
        }
        match reader.parse_type(addr, fh) {
            Some(t) => {
                seen.insert(addr, t);
            }
            None => tracing::warn!("skipping undecodable type descriptor at {:#x}", addr),
        }
    }

    let mut out: Vec<GoType> = seen.into_values().collect();
    out.sort_by(|a, b| {
        a.package_path
            .cmp(&b.package_path)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(out)
}

fn read_link_word(data: &[u8], off: usize, word_size: usize, big_endian: bool) -> Option<u64> {
    let b = data.get(off..off + word_size)?;
    Some(match (word_size, big_endian) {
        (8, false) => u64::from_le_bytes(b.try_into().ok()?),
        (8, true) => u64::from_be_bytes(b.try_into().ok()?),
        (4, false) => u64::from(u32::from_le_bytes(b.try_into().ok()?)),
        _ => u64::from(u32::from_be_bytes(b.try_into().ok()?)),
    })
}
