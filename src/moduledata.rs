//! Locating and decoding `runtime.firstmoduledata`.
//!
//! The structure's field order changed across Go releases. Each supported
//! release range is described by a data-driven field list; offsets are
//! derived from the word size at run time instead of hand-coding per-version
//! readers. Only the leading fields up to `itablinks` matter here, the tail
//! of the runtime structure is never touched.

use memchr::memmem;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::goversion::GoVersion;
use crate::pclntab::has_pclntab_header;
use crate::{FileHandler, FileInfo};

/// Version-independent view of the moduledata fields the analyses need.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Moduledata {
    pub text_addr: u64,
    pub text_len: u64,
    pub pclntab_addr: u64,
    pub pclntab_len: u64,
    pub types_addr: u64,
    pub types_len: u64,
    pub typelink_addr: u64,
    pub typelink_count: u64,
    pub itablink_addr: u64,
    pub itablink_count: u64,
    pub noptrdata_addr: u64,
    pub noptrdata_len: u64,
    pub data_addr: u64,
    pub data_len: u64,
    /// Go 1.5/1.6 store direct type pointers in typelinks instead of
    /// 32-bit offsets from the types base.
    pub legacy_typelinks: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Ptr,
    Slice,
}

/// One moduledata wire layout: the minimum release it applies to and the
/// ordered field list. Unnamed filler fields keep the offsets honest.
struct Layout {
    since: (u32, u32),
    fields: &'static [(&'static str, Kind)],
}

use Kind::{Ptr, Slice};

static LAYOUT_120: Layout = Layout {
    since: (1, 20),
    fields: &[
        ("pcHeader", Ptr),
        ("funcnametab", Slice),
        ("cutab", Slice),
        ("filetab", Slice),
        ("pctab", Slice),
        ("pclntable", Slice),
        ("ftab", Slice),
        ("findfunctab", Ptr),
        ("minpc", Ptr),
        ("maxpc", Ptr),
        ("text", Ptr),
        ("etext", Ptr),
        ("noptrdata", Ptr),
        ("enoptrdata", Ptr),
        ("data", Ptr),
        ("edata", Ptr),
        ("bss", Ptr),
        ("ebss", Ptr),
        ("noptrbss", Ptr),
        ("enoptrbss", Ptr),
        ("covctrs", Ptr),
        ("ecovctrs", Ptr),
        ("end", Ptr),
        ("gcdata", Ptr),
        ("gcbss", Ptr),
        ("types", Ptr),
        ("etypes", Ptr),
        ("rodata", Ptr),
        ("gofunc", Ptr),
        ("textsectmap", Slice),
        ("typelinks", Slice),
        ("itablinks", Slice),
    ],
};

static LAYOUT_118: Layout = Layout {
    since: (1, 18),
    fields: &[
        ("pcHeader", Ptr),
        ("funcnametab", Slice),
        ("cutab", Slice),
        ("filetab", Slice),
        ("pctab", Slice),
        ("pclntable", Slice),
        ("ftab", Slice),
        ("findfunctab", Ptr),
        ("minpc", Ptr),
        ("maxpc", Ptr),
        ("text", Ptr),
        ("etext", Ptr),
        ("noptrdata", Ptr),
        ("enoptrdata", Ptr),
        ("data", Ptr),
        ("edata", Ptr),
        ("bss", Ptr),
        ("ebss", Ptr),
        ("noptrbss", Ptr),
        ("enoptrbss", Ptr),
        ("end", Ptr),
        ("gcdata", Ptr),
        ("gcbss", Ptr),
        ("types", Ptr),
        ("etypes", Ptr),
        ("rodata", Ptr),
        ("gofunc", Ptr),
        ("textsectmap", Slice),
        ("typelinks", Slice),
        ("itablinks", Slice),
    ],
};

static LAYOUT_116: Layout = Layout {
    since: (1, 16),
    fields: &[
        ("pcHeader", Ptr),
        ("funcnametab", Slice),
        ("cutab", Slice),
        ("filetab", Slice),
        ("pctab", Slice),
        ("pclntable", Slice),
        ("ftab", Slice),
        ("findfunctab", Ptr),
        ("minpc", Ptr),
        ("maxpc", Ptr),
        ("text", Ptr),
        ("etext", Ptr),
        ("noptrdata", Ptr),
        ("enoptrdata", Ptr),
        ("data", Ptr),
        ("edata", Ptr),
        ("bss", Ptr),
        ("ebss", Ptr),
        ("noptrbss", Ptr),
        ("enoptrbss", Ptr),
        ("end", Ptr),
        ("gcdata", Ptr),
        ("gcbss", Ptr),
        ("types", Ptr),
        ("etypes", Ptr),
        ("textsectmap", Slice),
        ("typelinks", Slice),
        ("itablinks", Slice),
    ],
};

static LAYOUT_112: Layout = Layout {
    since: (1, 12),
    fields: &[
        ("pclntable", Slice),
        ("ftab", Slice),
        ("filetab", Slice),
        ("findfunctab", Ptr),
        ("minpc", Ptr),
        ("maxpc", Ptr),
        ("text", Ptr),
        ("etext", Ptr),
        ("noptrdata", Ptr),
        ("enoptrdata", Ptr),
        ("data", Ptr),
        ("edata", Ptr),
        ("bss", Ptr),
        ("ebss", Ptr),
        ("noptrbss", Ptr),
        ("enoptrbss", Ptr),
        ("end", Ptr),
        ("gcdata", Ptr),
        ("gcbss", Ptr),
        ("types", Ptr),
        ("etypes", Ptr),
        ("textsectmap", Slice),
        ("typelinks", Slice),
        ("itablinks", Slice),
    ],
};

static LAYOUT_18: Layout = Layout {
    since: (1, 8),
    fields: &[
        ("pclntable", Slice),
        ("ftab", Slice),
        ("filetab", Slice),
        ("findfunctab", Ptr),
        ("minpc", Ptr),
        ("maxpc", Ptr),
        ("text", Ptr),
        ("etext", Ptr),
        ("noptrdata", Ptr),
        ("enoptrdata", Ptr),
        ("data", Ptr),
        ("edata", Ptr),
        ("bss", Ptr),
        ("ebss", Ptr),
        ("noptrbss", Ptr),
        ("enoptrbss", Ptr),
        ("end", Ptr),
        ("gcdata", Ptr),
        ("gcbss", Ptr),
        ("types", Ptr),
        ("etypes", Ptr),
        ("textsectmap", Slice),
        ("typelinks", Slice),
        ("itablinks", Slice),
    ],
};

static LAYOUT_17: Layout = Layout {
    since: (1, 7),
    fields: &[
        ("pclntable", Slice),
        ("ftab", Slice),
        ("filetab", Slice),
        ("findfunctab", Ptr),
        ("minpc", Ptr),
        ("maxpc", Ptr),
        ("text", Ptr),
        ("etext", Ptr),
        ("noptrdata", Ptr),
        ("enoptrdata", Ptr),
        ("data", Ptr),
        ("edata", Ptr),
        ("bss", Ptr),
        ("ebss", Ptr),
        ("noptrbss", Ptr),
        ("enoptrbss", Ptr),
        ("end", Ptr),
        ("gcdata", Ptr),
        ("gcbss", Ptr),
        ("types", Ptr),
        ("etypes", Ptr),
        ("typelinks", Slice),
        ("itablinks", Slice),
    ],
};

static LAYOUT_15: Layout = Layout {
    since: (1, 5),
    fields: &[
        ("pclntable", Slice),
        ("ftab", Slice),
        ("filetab", Slice),
        ("findfunctab", Ptr),
        ("minpc", Ptr),
        ("maxpc", Ptr),
        ("text", Ptr),
        ("etext", Ptr),
        ("noptrdata", Ptr),
        ("enoptrdata", Ptr),
        ("data", Ptr),
        ("edata", Ptr),
        ("bss", Ptr),
        ("ebss", Ptr),
        ("noptrbss", Ptr),
        ("enoptrbss", Ptr),
        ("end", Ptr),
        ("gcdata", Ptr),
        ("gcbss", Ptr),
        ("typelinks", Slice),
    ],
};

/// All layouts, newest first; the order doubles as the fallback probe order
/// when the compiler version is unknown.
static LAYOUTS: [&Layout; 7] = [
    &LAYOUT_120,
    &LAYOUT_118,
    &LAYOUT_116,
    &LAYOUT_112,
    &LAYOUT_18,
    &LAYOUT_17,
    &LAYOUT_15,
];

#[derive(Debug, Clone, Copy, Default)]
struct FieldValue {
    ptr: u64,
    len: u64,
    cap: u64,
}

/// Raw field values decoded with one layout at one candidate offset.
struct Decoded<'a> {
    layout: &'a Layout,
    values: std::collections::HashMap<&'static str, FieldValue>,
}

impl Decoded<'_> {
    fn ptr(&self, name: &str) -> u64 {
        self.values.get(name).map_or(0, |v| v.ptr)
    }

    fn slice(&self, name: &str) -> FieldValue {
        self.values.get(name).copied().unwrap_or_default()
    }
}

fn read_word(data: &[u8], off: usize, word_size: usize, big_endian: bool) -> Option<u64> {
    let b = data.get(off..off + word_size)?;
    Some(match (word_size, big_endian) {
        (8, false) => u64::from_le_bytes(b.try_into().ok()?),
        (8, true) => u64::from_be_bytes(b.try_into().ok()?),
        (4, false) => u64::from(u32::from_le_bytes(b.try_into().ok()?)),
        (4, true) => u64::from(u32::from_be_bytes(b.try_into().ok()?)),
        _ => return None,
    })
}

fn decode<'a>(
    layout: &'a Layout,
    data: &[u8],
    start: usize,
    word_size: usize,
    big_endian: bool,
) -> Option<Decoded<'a>> {
    let mut values = std::collections::HashMap::new();
    let mut off = start;
    for &(name, kind) in layout.fields {
        let v = match kind {
            Kind::Ptr => {
                let ptr = read_word(data, off, word_size, big_endian)?;
                off += word_size;
                FieldValue { ptr, len: 0, cap: 0 }
            }
            Kind::Slice => {
                let ptr = read_word(data, off, word_size, big_endian)?;
                let len = read_word(data, off + word_size, word_size, big_endian)?;
                let cap = read_word(data, off + 2 * word_size, word_size, big_endian)?;
                off += 3 * word_size;
                FieldValue { ptr, len, cap }
            }
        };
        values.insert(name, v);
    }
    Some(Decoded { layout, values })
}

/// Sanity bound on slice lengths inside candidate structures.
const MAX_SLICE_LEN: u64 = 0x0800_0000;

fn plausible_slice(v: FieldValue) -> bool {
    v.len == v.cap && v.len < MAX_SLICE_LEN
}

/// Validates a decoded candidate: the pclntab pointer must match the table
/// found earlier, text must order correctly and live inside the code
/// section, and the link slices must be self-consistent.
fn validate(d: &Decoded, tab_addr: u64, code_base: u64, code_len: u64) -> bool {
    let pcln_ptr = if d.values.contains_key("pcHeader") {
        d.ptr("pcHeader")
    } else {
        d.slice("pclntable").ptr
    };
    if pcln_ptr != tab_addr {
        return false;
    }

    let text = d.ptr("text");
    let etext = d.ptr("etext");
    if text > etext || text < code_base || text >= code_base + code_len {
        return false;
    }

    if !plausible_slice(d.slice("ftab")) || !plausible_slice(d.slice("typelinks")) {
        return false;
    }
    if d.values.contains_key("itablinks") && !plausible_slice(d.slice("itablinks")) {
        return false;
    }
    if d.values.contains_key("types") && d.ptr("types") > d.ptr("etypes") {
        return false;
    }

    true
}

fn layout_for(version: &GoVersion) -> &'static Layout {
    for layout in LAYOUTS {
        if version.at_least(layout.since.0, layout.since.1) {
            return layout;
        }
    }
    &LAYOUT_15
}

fn build(d: &Decoded, tab_addr: u64, tab_len: u64) -> Moduledata {
    let legacy = !d.values.contains_key("types");
    let typelinks = d.slice("typelinks");
    let itablinks = d.slice("itablinks");
    let pclntable = d.slice("pclntable");

    Moduledata {
        text_addr: d.ptr("text"),
        text_len: d.ptr("etext").saturating_sub(d.ptr("text")),
        pclntab_addr: tab_addr,
        pclntab_len: if pclntable.len > 0 { pclntable.len } else { tab_len },
        types_addr: d.ptr("types"),
        types_len: d.ptr("etypes").saturating_sub(d.ptr("types")),
        typelink_addr: typelinks.ptr,
        typelink_count: typelinks.len,
        itablink_addr: itablinks.ptr,
        itablink_count: itablinks.len,
        noptrdata_addr: d.ptr("noptrdata"),
        noptrdata_len: d.ptr("enoptrdata").saturating_sub(d.ptr("noptrdata")),
        data_addr: d.ptr("data"),
        data_len: d.ptr("edata").saturating_sub(d.ptr("data")),
        legacy_typelinks: legacy,
    }
}

/// Locates the moduledata structure and projects it onto the normalized
/// view. The symbol is used when present; otherwise the designated data
/// section is scanned for the encoded PCLNTAB address.
pub(crate) fn extract_moduledata(
    fi: &FileInfo,
    version: Option<&GoVersion>,
    fh: &dyn FileHandler,
) -> Result<Moduledata> {
    let (tab_addr, tab_data) = fh.pclntab_data()?;
    if !has_pclntab_header(&tab_data, fi.big_endian) {
        return Err(Error::NoPclntab);
    }
    let (code_base, code_data) = fh.code_section()?;
    let code_len = code_data.len() as u64;

    let layouts: Vec<&Layout> = match version {
        Some(v) => vec![layout_for(v)],
        None => LAYOUTS.to_vec(),
    };

    // Candidate buffers: the symbol's section when available, otherwise the
    // per-format moduledata section (with .data as a generic fallback).
    let mut scans: Vec<(u64, Vec<u8>, Vec<usize>)> = Vec::new();

    if let Ok((sym_addr, _)) = fh.get_symbol("runtime.firstmoduledata") {
        if let Ok((base, data)) = fh.section_from_address(sym_addr) {
            let off = (sym_addr - base) as usize;
            scans.push((base, data, vec![off]));
        }
    }

    if scans.is_empty() {
        let needle = encode_addr(tab_addr, fi.word_size, fi.big_endian);
        let mut names = vec![fh.moduledata_section()];
        if !names.contains(&".data") {
            names.push(".data");
        }
        for name in names {
            let Ok((base, data)) = fh.section_data(name) else {
                continue;
            };
            let hits: Vec<usize> = memmem::find_iter(&data, &needle).collect();
            if !hits.is_empty() {
                scans.push((base, data, hits));
            }
        }
    }

    for (base, data, offsets) in &scans {
        for &off in offsets {
            for &layout in &layouts {
                let Some(d) = decode(layout, data, off, fi.word_size, fi.big_endian) else {
                    continue;
                };
                if validate(&d, tab_addr, code_base, code_len) {
                    tracing::debug!(
                        "moduledata (go{}.{} layout) at {:#x}",
                        d.layout.since.0,
                        d.layout.since.1,
                        base + off as u64
                    );
                    return Ok(build(&d, tab_addr, tab_data.len() as u64));
                }
            }
        }
    }

    Err(Error::NoModuledata)
}

fn encode_addr(addr: u64, word_size: usize, big_endian: bool) -> Vec<u8> {
    match (word_size, big_endian) {
        (8, false) => addr.to_le_bytes().to_vec(),
        (8, true) => addr.to_be_bytes().to_vec(),
        (4, false) => (addr as u32).to_le_bytes().to_vec(),
        _ => (addr as u32).to_be_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goversion::resolve_go_version;

    #[test]
    fn layout_selection_tracks_version() {
        let pick = |s: &str| {
            let v = resolve_go_version(s).unwrap();
            layout_for(&v).since
        };
        assert_eq!(pick("go1.21.0"), (1, 20));
        assert_eq!(pick("go1.20"), (1, 20));
        assert_eq!(pick("go1.19.5"), (1, 18));
        assert_eq!(pick("go1.17"), (1, 16));
        assert_eq!(pick("go1.13"), (1, 12));
        assert_eq!(pick("go1.9"), (1, 8));
        assert_eq!(pick("go1.7.2"), (1, 7));
        assert_eq!(pick("go1.5"), (1, 5));
    }

    #[test]
    fn decode_reads_slices_and_pointers() {
        // Two leading fields of the oldest layout: pclntable slice + ftab
        // slice, 64-bit little-endian.
        let mut buf = Vec::new();
        for v in [0x1000u64, 0x20, 0x20, 0x2000, 0x10, 0x10] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.resize(LAYOUT_15.fields.len() * 3 * 8, 0);

        let d = decode(&LAYOUT_15, &buf, 0, 8, false).unwrap();
        assert_eq!(d.slice("pclntable").ptr, 0x1000);
        assert_eq!(d.slice("pclntable").len, 0x20);
        assert_eq!(d.slice("ftab").ptr, 0x2000);
    }

    #[test]
    fn decode_truncated_buffer() {
        assert!(decode(&LAYOUT_120, &[0u8; 16], 0, 8, false).is_none());
    }

    #[test]
    fn validate_rejects_mismatched_pclntab_pointer() {
        let words = LAYOUT_15.fields.iter().map(|&(_, k)| match k {
            Kind::Ptr => 1,
            Kind::Slice => 3,
        });
        let mut buf = vec![0u8; words.sum::<usize>() * 8];
        buf[0..8].copy_from_slice(&0xdead_u64.to_le_bytes());
        let d = decode(&LAYOUT_15, &buf, 0, 8, false).unwrap();
        assert!(!validate(&d, 0x1000, 0x400000, 0x1000));
    }
}
