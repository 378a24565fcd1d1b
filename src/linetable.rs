//! PCLNTAB decoding.
//!
//! The table layout changed at Go 1.16 (region offsets in the header), 1.18
//! (function entries became 32-bit offsets from the text base) and 1.20
//! (new magic, same shape as 1.18). All four wire formats are decoded into
//! one queryable view: function list, PC to source file, PC to line.
//!
//! Every read is bounds-checked. A corrupt or hostile table degrades to
//! `None` for the affected query instead of panicking.

use std::borrow::Cow;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::pclntab::{MAGIC_1_16, MAGIC_1_18, MAGIC_1_2, MAGIC_1_20};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TabVersion {
    V12,
    V116,
    V118,
    V120,
}

/// Upper bound on the function count; anything larger is treated as corrupt.
const MAX_FUNCS: u64 = 10_000_000;

/// A function row recovered from the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFunc {
    /// Full symbol name, e.g. `net/http.(*Client).Do`.
    pub name: String,
    /// Entry PC (virtual address).
    pub entry: u64,
    /// Address of the first instruction past the function.
    pub end: u64,
    #[serde(skip)]
    func_off: usize,
}

impl TableFunc {
    /// Symbol name with any generic instantiation (`[...]`) removed.
    fn name_without_inst(&self) -> Cow<'_, str> {
        let Some(start) = self.name.find('[') else {
            return Cow::Borrowed(&self.name);
        };
        let Some(end) = self.name.rfind(']') else {
            return Cow::Borrowed(&self.name);
        };
        if end < start {
            return Cow::Borrowed(&self.name);
        }
        Cow::Owned(format!("{}{}", &self.name[..start], &self.name[end + 1..]))
    }

    /// Package component of the symbol name. Compiler-generated symbols
    /// (`go:…`, `type:…` and their pre-1.18 dot spellings) have none.
    pub fn package_name(&self) -> String {
        let owned = self.name_without_inst();
        let name: &str = &owned;
        for prefix in ["go.", "go:", "type.", "type:"] {
            if name.starts_with(prefix) {
                return String::new();
            }
        }
        let pathend = name.rfind('/').unwrap_or(0);
        match name[pathend..].find('.') {
            Some(i) => name[..pathend + i].to_string(),
            None => String::new(),
        }
    }

    /// Receiver type for methods, with the surrounding parentheses stripped
    /// but a leading `*` kept: `net/http.(*Client).Do` yields `*Client`.
    /// Plain functions yield the empty string.
    pub fn receiver(&self) -> String {
        // A trailing ']' marks an instantiated generic function; the dots
        // inside its type arguments are not receiver separators.
        let stripped;
        let name: &str = if self.name.ends_with(']') {
            stripped = self.name_without_inst().into_owned();
            &stripped
        } else {
            &self.name
        };
        let pathend = name.rfind('/').unwrap_or(0);
        let tail = &name[pathend..];
        let (Some(l), Some(r)) = (tail.find('.'), tail.rfind('.')) else {
            return String::new();
        };
        if l == r {
            return String::new();
        }
        let recv = &name[pathend + l + 1..pathend + r];
        recv.strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(recv)
            .to_string()
    }

    /// Bare identifier without package or receiver.
    pub fn base_name(&self) -> String {
        let name = self.name_without_inst().into_owned();
        match name.rfind('.') {
            Some(i) => name[i + 1..].to_string(),
            None => name,
        }
    }
}

/// Decoded PCLNTAB. Owns the raw table bytes.
pub struct LineTable {
    data: Vec<u8>,
    version: TabVersion,
    big_endian: bool,
    text_start: u64,
    quantum: u32,
    ptr_size: u32,
    nfunctab: u32,
    functab: usize,
    functab_field_size: usize,
    funcdata: usize,
    funcnametab: usize,
    cutab: usize,
    filetab: usize,
    pctab: usize,
}

impl LineTable {
    /// Parses the table. `text_start` is the runtime text base from
    /// moduledata; for 1.18+ tables a zero value falls back to the base
    /// recorded in the header itself.
    pub fn parse(data: Vec<u8>, text_start: u64, big_endian: bool) -> Result<LineTable> {
        if data.len() < 16 {
            return Err(Error::NoPclntab);
        }

        let mut t = LineTable {
            data,
            version: TabVersion::V12,
            big_endian,
            text_start,
            quantum: 0,
            ptr_size: 0,
            nfunctab: 0,
            functab: 0,
            functab_field_size: 0,
            funcdata: 0,
            funcnametab: 0,
            cutab: 0,
            filetab: 0,
            pctab: 0,
        };

        let magic = t.u32_at(0).ok_or(Error::NoPclntab)?;
        t.version = match magic {
            MAGIC_1_20 => TabVersion::V120,
            MAGIC_1_18 => TabVersion::V118,
            MAGIC_1_16 => TabVersion::V116,
            MAGIC_1_2 => TabVersion::V12,
            _ => return Err(Error::NoPclntab),
        };
        if t.data[4] != 0 || t.data[5] != 0 {
            return Err(Error::NoPclntab);
        }
        t.quantum = u32::from(t.data[6]);
        t.ptr_size = u32::from(t.data[7]);
        if !matches!(t.quantum, 1 | 2 | 4) || !matches!(t.ptr_size, 4 | 8) {
            return Err(Error::NoPclntab);
        }

        let nfunc;
        match t.version {
            TabVersion::V118 | TabVersion::V120 => {
                nfunc = t.header_word(0).ok_or(Error::NoPclntab)?;
                if t.text_start == 0 {
                    t.text_start = t.header_word(2).unwrap_or(0);
                }
                t.funcnametab = t.header_region(3)?;
                t.cutab = t.header_region(4)?;
                t.filetab = t.header_region(5)?;
                t.pctab = t.header_region(6)?;
                t.funcdata = t.header_region(7)?;
                t.functab = t.funcdata;
                t.functab_field_size = 4;
            }
            TabVersion::V116 => {
                nfunc = t.header_word(0).ok_or(Error::NoPclntab)?;
                t.funcnametab = t.header_region(2)?;
                t.cutab = t.header_region(3)?;
                t.filetab = t.header_region(4)?;
                t.pctab = t.header_region(5)?;
                t.funcdata = t.header_region(6)?;
                t.functab = t.funcdata;
                t.functab_field_size = t.ptr_size as usize;
            }
            TabVersion::V12 => {
                nfunc = t.header_word(0).ok_or(Error::NoPclntab)?;
                t.funcnametab = 0;
                t.funcdata = 0;
                t.pctab = 0;
                t.functab = 8 + t.ptr_size as usize;
                t.functab_field_size = t.ptr_size as usize;
            }
        }

        if nfunc > MAX_FUNCS {
            return Err(Error::Parse("implausible function count".into()));
        }
        t.nfunctab = nfunc as u32;

        let functab_size = (t.nfunctab as usize * 2 + 1) * t.functab_field_size;
        if t.functab.checked_add(functab_size).is_none_or(|e| e > t.data.len()) {
            return Err(Error::Parse("function table out of range".into()));
        }

        if t.version == TabVersion::V12 {
            // The file table sits behind a 32-bit offset stored right after
            // the function table; offsets inside it are table-relative.
            let fileoff = t
                .u32_at(t.functab + functab_size)
                .ok_or_else(|| Error::Parse("file table offset truncated".into()))?;
            let filetab = fileoff as usize;
            if filetab >= t.data.len() {
                return Err(Error::Parse("file table out of range".into()));
            }
            t.filetab = filetab;
            t.cutab = filetab;
        }

        Ok(t)
    }

    /// Header word `i` (the words following the 8-byte fixed header).
    fn header_word(&self, i: usize) -> Option<u64> {
        self.word_at(8 + i * self.ptr_size as usize)
    }

    /// Header word `i` interpreted as a region offset into the table.
    fn header_region(&self, i: usize) -> Result<usize> {
        let v = self
            .header_word(i)
            .ok_or_else(|| Error::Parse("pclntab header truncated".into()))?;
        let off =
            usize::try_from(v).map_err(|_| Error::Parse("pclntab offset overflow".into()))?;
        if off >= self.data.len() {
            return Err(Error::Parse("pclntab region out of range".into()));
        }
        Ok(off)
    }

    fn u32_at(&self, off: usize) -> Option<u32> {
        let b = self.data.get(off..off + 4)?;
        let b: [u8; 4] = b.try_into().ok()?;
        Some(if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    fn word_at(&self, off: usize) -> Option<u64> {
        if self.ptr_size == 4 {
            return self.u32_at(off).map(u64::from);
        }
        let b = self.data.get(off..off + 8)?;
        let b: [u8; 8] = b.try_into().ok()?;
        Some(if self.big_endian {
            u64::from_be_bytes(b)
        } else {
            u64::from_le_bytes(b)
        })
    }

    /// Reads a NUL-terminated string from a region offset.
    fn cstring_at(&self, off: usize) -> Option<String> {
        let tail = self.data.get(off..)?;
        let end = memchr::memchr(0, tail)?;
        Some(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    /// Number of functions recorded in the table.
    pub fn num_funcs(&self) -> u32 {
        self.nfunctab
    }

    /// Text base the table resolves PCs against.
    pub fn text_start(&self) -> u64 {
        self.text_start
    }

    /// PC of functab slot `i` (there are `2*nfunctab+1` slots; even slots
    /// are entry PCs, the final slot is the end-of-text sentinel).
    fn functab_pc(&self, slot: usize) -> Option<u64> {
        let off = self.functab + slot * self.functab_field_size;
        if self.functab_field_size == 4 {
            Some(u64::from(self.u32_at(off)?) + self.text_start)
        } else {
            self.word_at(off)
        }
    }

    /// Function-record offset of functab slot `i` (odd slots).
    fn functab_off(&self, slot: usize) -> Option<usize> {
        let off = self.functab + slot * self.functab_field_size;
        let v = if self.functab_field_size == 4 {
            u64::from(self.u32_at(off)?)
        } else {
            self.word_at(off)?
        };
        usize::try_from(v).ok()
    }

    /// Reads field `n` (1-based, 32-bit) of the function record at
    /// `func_off`. Field 0 is the entry PC and has its own accessor.
    fn func_field(&self, func_off: usize, n: usize) -> Option<u32> {
        debug_assert!((1..=9).contains(&n));
        let entry_size = if self.version >= TabVersion::V118 {
            4
        } else {
            self.ptr_size as usize
        };
        self.u32_at(self.funcdata + func_off + entry_size + (n - 1) * 4)
    }

    fn func_name_off(&self, func_off: usize) -> Option<u32> {
        self.func_field(func_off, 1)
    }

    fn func_pcfile(&self, func_off: usize) -> Option<u32> {
        self.func_field(func_off, 5)
    }

    fn func_pcln(&self, func_off: usize) -> Option<u32> {
        self.func_field(func_off, 6)
    }

    fn func_cu_offset(&self, func_off: usize) -> Option<u32> {
        self.func_field(func_off, 8)
    }

    /// Enumerates all functions in table order.
    pub fn funcs(&self) -> Vec<TableFunc> {
        let mut out = Vec::with_capacity(self.nfunctab as usize);
        for i in 0..self.nfunctab as usize {
            let Some(f) = self.func_at(i) else {
                tracing::warn!("skipping undecodable function record {}", i);
                continue;
            };
            out.push(f);
        }
        out
    }

    fn func_at(&self, i: usize) -> Option<TableFunc> {
        let entry = self.functab_pc(2 * i)?;
        let end = self.functab_pc(2 * i + 2)?;
        let func_off = self.functab_off(2 * i + 1)?;
        let name_off = self.func_name_off(func_off)?;
        let name = self.cstring_at(self.funcnametab + name_off as usize)?;
        Some(TableFunc {
            name,
            entry,
            end,
            func_off,
        })
    }

    /// Finds the function containing `pc` by binary search over entry PCs.
    fn find_func(&self, pc: u64) -> Option<TableFunc> {
        let n = self.nfunctab as usize;
        if n == 0 || pc < self.functab_pc(0)? || pc >= self.functab_pc(2 * n)? {
            return None;
        }
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.functab_pc(2 * mid)? <= pc {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return None;
        }
        self.func_at(lo - 1)
    }

    fn read_varint(&self, pos: &mut usize) -> Option<u32> {
        let mut v = 0u32;
        let mut shift = 0u32;
        loop {
            let b = *self.data.get(*pos)?;
            *pos += 1;
            v |= u32::from(b & 0x7F) << shift;
            if b & 0x80 == 0 {
                return Some(v);
            }
            shift += 7;
            if shift > 28 {
                return None;
            }
        }
    }

    /// One step of a pcvalue delta stream. Returns false at end of stream.
    fn step(&self, pos: &mut usize, pc: &mut u64, val: &mut i32, first: bool) -> Option<bool> {
        let mut uvdelta = self.read_varint(pos)?;
        if uvdelta == 0 && !first {
            return Some(false);
        }
        if uvdelta & 1 != 0 {
            uvdelta = !(uvdelta >> 1);
        } else {
            uvdelta >>= 1;
        }
        let pcdelta = self.read_varint(pos)?.checked_mul(self.quantum)?;
        *pc = pc.checked_add(u64::from(pcdelta))?;
        *val = val.wrapping_add(uvdelta as i32);
        Some(true)
    }

    /// Value of the delta stream at `off` for `targetpc` within a function
    /// entered at `entry`.
    fn pcvalue(&self, off: u32, entry: u64, targetpc: u64) -> Option<i32> {
        let mut pos = self.pctab + off as usize;
        let mut pc = entry;
        let mut val = -1i32;
        let mut first = true;
        while self.step(&mut pos, &mut pc, &mut val, first)? {
            first = false;
            if targetpc < pc {
                return Some(val);
            }
        }
        None
    }

    /// Source file recorded for `pc`, verbatim (may be `<autogenerated>`).
    pub fn pc_to_file(&self, pc: u64) -> Option<String> {
        let f = self.find_func(pc)?;
        let pcfile = self.func_pcfile(f.func_off)?;
        let fno = self.pcvalue(pcfile, f.entry, pc)?;

        if self.version == TabVersion::V12 {
            if fno <= 0 {
                return None;
            }
            // File numbers index a table of table-relative string offsets.
            let off = self.u32_at(self.filetab + 4 * fno as usize)?;
            return self.cstring_at(off as usize);
        }

        if fno < 0 {
            return None;
        }
        let cuoff = self.func_cu_offset(f.func_off)?;
        let idx = cuoff.checked_add(fno as u32)?;
        let fnoff = self.u32_at(self.cutab + 4 * idx as usize)?;
        if fnoff == u32::MAX {
            return None;
        }
        self.cstring_at(self.filetab + fnoff as usize)
    }

    /// 1-based source line for `pc`.
    pub fn pc_to_line(&self, pc: u64) -> Option<i32> {
        let f = self.find_func(pc)?;
        let pcln = self.func_pcln(f.func_off)?;
        self.pcvalue(pcln, f.entry, pc)
    }

    /// Minimum and maximum source line across every instruction of the
    /// function spanning `[entry, end)`. The line-number stream is not
    /// monotonic, so the whole stream is walked rather than sampling the
    /// endpoints.
    pub fn line_extent(&self, entry: u64, end: u64) -> Option<(i32, i32)> {
        let f = self.find_func(entry)?;
        let pcln = self.func_pcln(f.func_off)?;

        let mut pos = self.pctab + pcln as usize;
        let mut pc = f.entry;
        let mut val = -1i32;
        let mut first = true;
        let mut lo = i32::MAX;
        let mut hi = i32::MIN;
        while pc < end {
            match self.step(&mut pos, &mut pc, &mut val, first) {
                Some(true) => {}
                _ => break,
            }
            first = false;
            if val >= 0 {
                lo = lo.min(val);
                hi = hi.max(val);
            }
        }
        if lo == i32::MAX {
            return None;
        }
        Some((lo, hi))
    }
}
