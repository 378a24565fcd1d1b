//! Build metadata embedded by the Go linker.
//!
//! Two artifacts are recovered: the build-info blob (compiler version plus
//! the module graph) and the build ID. Both are optional in real binaries;
//! absence degrades to `None`/empty rather than failing the open.

use memchr::memmem;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::goversion::{resolve_go_version, GoVersion};
use crate::FileHandler;

/// `\xff Go buildinf:` — the 14-byte header magic, 16-byte aligned in the
/// data section.
const INFO_MAGIC: &[u8] = b"\xff Go buildinf:";

/// Byte 15 of the header: pointers are big-endian.
const FLAG_ENDIAN_BIG: u8 = 0x1;
/// Byte 15 of the header: strings are inlined after the header (Go 1.18+).
const FLAG_INLINE: u8 = 0x2;

/// Module-graph sentinel wrapping the modinfo payload.
const SENTINEL_LEN: usize = 16;

/// A module recorded in the build info, with its replacement if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Module {
    pub path: String,
    pub version: String,
    pub sum: String,
    pub replace: Option<Box<Module>>,
}

/// Build metadata embedded by the linker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    /// Compiler release parsed from the embedded version string.
    pub compiler: Option<GoVersion>,
    /// Package path of the built binary.
    pub path: String,
    /// The main module.
    pub main: Option<Module>,
    /// Module dependencies.
    pub deps: Vec<Module>,
    /// `build` lines: key/value settings such as `-compiler` or `vcs`.
    pub settings: Vec<(String, String)>,
}

/// Locates and parses the build-info blob. The header self-describes its
/// pointer size and endianness, so no file-level info is needed.
pub(crate) fn extract_build_info(fh: &dyn FileHandler) -> Result<BuildInfo> {
    let (data, off) = find_info_blob(fh)?;
    let blob = &data[off..];
    if blob.len() < 32 {
        return Err(Error::Parse("build info header truncated".into()));
    }

    let ptr_size = blob[14] as usize;
    let flags = blob[15];

    let (version_str, mod_str) = if flags & FLAG_INLINE != 0 {
        let (vers, next) =
            read_inline_string(blob, 32).ok_or_else(|| Error::Parse("build info version string".into()))?;
        let (modinfo, _) =
            read_inline_string(blob, next).ok_or_else(|| Error::Parse("build info mod string".into()))?;
        (vers, modinfo)
    } else {
        if !matches!(ptr_size, 4 | 8) {
            return Err(Error::Parse("build info pointer size".into()));
        }
        let big_endian = flags & FLAG_ENDIAN_BIG != 0;
        let vers_ptr = read_ptr(blob, 16, ptr_size, big_endian)
            .ok_or_else(|| Error::Parse("build info version pointer".into()))?;
        let mod_ptr = read_ptr(blob, 16 + ptr_size, ptr_size, big_endian)
            .ok_or_else(|| Error::Parse("build info mod pointer".into()))?;
        let vers = read_go_string(fh, vers_ptr, ptr_size, big_endian)?;
        let modinfo = read_go_string(fh, mod_ptr, ptr_size, big_endian)?;
        (vers, modinfo)
    };

    let mut bi = BuildInfo {
        compiler: resolve_go_version(&version_str),
        path: String::new(),
        main: None,
        deps: Vec::new(),
        settings: Vec::new(),
    };

    parse_mod_string(&mod_str, &mut bi);
    tracing::debug!(
        "build info: version {:?}, {} deps",
        bi.compiler.as_ref().map(|v| v.name.as_str()),
        bi.deps.len()
    );
    Ok(bi)
}

/// Finds the section containing the build-info header and its offset.
fn find_info_blob(fh: &dyn FileHandler) -> Result<(Vec<u8>, usize)> {
    for name in [".go.buildinfo", "__go_buildinfo"] {
        if let Ok((_, data)) = fh.section_data(name) {
            if data.starts_with(INFO_MAGIC) {
                return Ok((data, 0));
            }
            if let Some(off) = memmem::find(&data, INFO_MAGIC) {
                return Ok((data, off));
            }
        }
    }

    // No dedicated section (PE, stripped binaries): scan the data sections
    // for an aligned header.
    let mut names = vec![fh.moduledata_section()];
    for extra in [".data", "__data"] {
        if !names.contains(&extra) {
            names.push(extra);
        }
    }
    for name in names {
        let Ok((_, data)) = fh.section_data(name) else {
            continue;
        };
        for off in memmem::find_iter(&data, INFO_MAGIC) {
            if off % 16 == 0 {
                return Ok((data, off));
            }
        }
    }
    Err(Error::SectionDoesNotExist)
}

fn read_ptr(data: &[u8], off: usize, ptr_size: usize, big_endian: bool) -> Option<u64> {
    let b = data.get(off..off + ptr_size)?;
    Some(match (ptr_size, big_endian) {
        (8, false) => u64::from_le_bytes(b.try_into().ok()?),
        (8, true) => u64::from_be_bytes(b.try_into().ok()?),
        (4, false) => u64::from(u32::from_le_bytes(b.try_into().ok()?)),
        _ => u64::from(u32::from_be_bytes(b.try_into().ok()?)),
    })
}

/// Reads a length-prefixed (uvarint) string from the blob, returning the
/// string and the offset past it.
fn read_inline_string(data: &[u8], off: usize) -> Option<(String, usize)> {
    let mut len = 0usize;
    let mut shift = 0u32;
    let mut pos = off;
    loop {
        let b = *data.get(pos)?;
        pos += 1;
        len |= ((b & 0x7F) as usize) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
    let bytes = data.get(pos..pos + len)?;
    Some((String::from_utf8_lossy(bytes).into_owned(), pos + len))
}

/// Chases a pointer to a Go string header and reads the string data.
fn read_go_string(
    fh: &dyn FileHandler,
    addr: u64,
    ptr_size: usize,
    big_endian: bool,
) -> Result<String> {
    let (base, data) = fh.section_from_address(addr)?;
    let off = usize::try_from(addr - base).map_err(|_| Error::OutOfBounds)?;
    let sptr = read_ptr(&data, off, ptr_size, big_endian).ok_or(Error::OutOfBounds)?;
    let slen = read_ptr(&data, off + ptr_size, ptr_size, big_endian).ok_or(Error::OutOfBounds)?;
    if slen > 1 << 24 {
        return Err(Error::Parse("build info string too long".into()));
    }
    let (sbase, sdata) = fh.section_from_address(sptr)?;
    let soff = usize::try_from(sptr - sbase).map_err(|_| Error::OutOfBounds)?;
    let bytes = sdata
        .get(soff..soff + slen as usize)
        .ok_or(Error::OutOfBounds)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Parses the tab-separated module-graph payload.
///
/// The payload is wrapped in 16-byte sentinels; without them it is treated
/// as absent (tampered or truncated).
fn parse_mod_string(raw: &str, bi: &mut BuildInfo) {
    let bytes = raw.as_bytes();
    if bytes.len() < 2 * SENTINEL_LEN + 1 || bytes[bytes.len() - SENTINEL_LEN - 1] != b'\n' {
        return;
    }
    let payload = &raw[SENTINEL_LEN..raw.len() - SENTINEL_LEN];

    let mut last_dep: Option<usize> = None;
    for line in payload.lines() {
        let mut parts = line.split('\t');
        match parts.next() {
            Some("path") => {
                bi.path = parts.next().unwrap_or("").to_string();
            }
            Some("mod") => {
                bi.main = parse_module_line(&mut parts);
            }
            Some("dep") => {
                if let Some(m) = parse_module_line(&mut parts) {
                    bi.deps.push(m);
                    last_dep = Some(bi.deps.len() - 1);
                }
            }
            Some("=>") => {
                if let (Some(i), Some(m)) = (last_dep, parse_module_line(&mut parts)) {
                    bi.deps[i].replace = Some(Box::new(m));
                }
            }
            Some("build") => {
                if let Some(kv) = parts.next() {
                    if let Some((k, v)) = kv.split_once('=') {
                        bi.settings.push((k.to_string(), v.to_string()));
                    }
                }
            }
            _ => {}
        }
    }
}

fn parse_module_line<'a>(parts: &mut impl Iterator<Item = &'a str>) -> Option<Module> {
    let path = parts.next()?.to_string();
    let version = parts.next().unwrap_or("").to_string();
    let sum = parts.next().unwrap_or("").to_string();
    Some(Module {
        path,
        version,
        sum,
        replace: None,
    })
}

/// Extracts the build ID from a raw code-section prefix. The linker places
/// it in the first few kilobytes as `Go build ID: "<id>"`.
pub(crate) fn parse_build_id_from_raw(code: &[u8]) -> Result<String> {
    const MARKER: &[u8] = b"Go build ID: \"";
    let window = &code[..code.len().min(64 * 1024)];
    let start = memmem::find(window, MARKER).ok_or_else(|| Error::Parse("no build ID marker".into()))?;
    let id_start = start + MARKER.len();
    let rest = &window[id_start..];
    let end = memchr::memchr(b'"', &rest[..rest.len().min(256)])
        .ok_or_else(|| Error::Parse("unterminated build ID".into()))?;
    Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
}
