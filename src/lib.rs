//! # gander - Go binary reverse engineering
//!
//! This library reconstructs high-level information from compiled Go
//! executables: the source packages (classified by provenance), the
//! functions and methods they contain with source file and line extents,
//! the runtime type descriptors, the embedded build metadata, and the
//! compiler version.
//!
//! It understands the three container formats the Go toolchain emits (ELF,
//! PE, Mach-O) and the on-disk layout changes of the PCLNTAB and moduledata
//! structures across compiler releases. Stripped binaries are handled by
//! pattern-searching for the tables instead of relying on symbols.
//!
//! ## Usage
//!
//! ```no_run
//! let file = gander::GoFile::open("./my_go_binary").unwrap();
//!
//! for pkg in file.packages().unwrap() {
//!     println!("{} ({})", pkg.name, pkg.filepath);
//!     for f in &pkg.functions {
//!         let (src, start, end) = file.source_info(f).unwrap();
//!         println!("  {} {}:{}-{}", f.name, src, start, end);
//!     }
//! }
//! ```
//!
//! Expensive derivations (moduledata, line table, package enumeration) run
//! at most once per handle and memoize their result, including errors.

mod buildinfo;
mod elf;
mod error;
mod goversion;
mod gotypes;
mod linetable;
mod macho;
mod moduledata;
mod packages;
mod pclntab;
mod pe;
mod stdlib;

pub use buildinfo::{BuildInfo, Module};
pub use error::{Error, Result};
pub use goversion::{resolve_go_version, GoVersion};
pub use gotypes::{GoKind, GoType, GoTypeField};
pub use linetable::{LineTable, TableFunc};
pub use moduledata::Moduledata;
pub use packages::{
    FileEntry, Function, Method, ModPackageClassifier, Package, PackageClass, PackageClassifier,
    PathPackageClassifier, SourceFile,
};
pub use stdlib::is_standard_library;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{OnceLock, RwLock};

use serde::Serialize;

use crate::packages::PackageSet;

/// CPU architecture tag of the analyzed binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    I386,
    Arm,
    Arm64,
    Mips,
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Arch::Amd64 => "amd64",
            Arch::I386 => "i386",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::Mips => "mips",
        })
    }
}

/// Information about the analyzed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Architecture the binary is compiled for.
    pub arch: Arch,
    /// Target operating system.
    pub os: &'static str,
    pub big_endian: bool,
    /// Natural integer size in bytes (4 or 8).
    pub word_size: usize,
    /// Compiler release, once detected or set.
    pub version: Option<GoVersion>,
}

impl Default for FileInfo {
    fn default() -> Self {
        FileInfo {
            arch: Arch::Amd64,
            os: "",
            big_endian: false,
            word_size: 8,
            version: None,
        }
    }
}

/// Raw DWARF section blobs, passed through without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DwarfData {
    /// `(section name, bytes)` pairs in file order.
    pub sections: Vec<(String, Vec<u8>)>,
}

/// Uniform view over the container formats. All addresses are virtual
/// (image-base relocated), so consumers can treat the file as a memory
/// image.
pub(crate) trait FileHandler: Send + Sync {
    /// Symbol lookup returning `(value, size)`.
    fn get_symbol(&self, name: &str) -> Result<(u64, u64)>;
    fn has_symbol_table(&self) -> Result<bool>;
    /// The PCLNTAB's virtual address and bytes, located by symbol or by
    /// pattern search.
    fn pclntab_data(&self) -> Result<(u64, Vec<u8>)>;
    fn rdata(&self) -> Result<Vec<u8>>;
    fn code_section(&self) -> Result<(u64, Vec<u8>)>;
    /// The section containing `address`, as `(base, bytes)`.
    fn section_from_address(&self, address: u64) -> Result<(u64, Vec<u8>)>;
    fn section_data(&self, name: &str) -> Result<(u64, Vec<u8>)>;
    fn file_info(&self) -> FileInfo;
    /// Name of the section the moduledata structure lives in.
    fn moduledata_section(&self) -> &'static str;
    fn build_id(&self) -> Result<String>;
    fn dwarf(&self) -> Result<DwarfData>;
}

/// Runs a container-parsing closure, converting any panic from the
/// underlying parser into a parse error. Malformed inputs must never abort
/// the process.
pub(crate) fn catch_parse_panic<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "binary parser panicked".to_string());
            Err(Error::Parse(msg))
        }
    }
}

const ELF_MAGIC: [u8; 4] = [0x7F, 0x45, 0x4C, 0x46];
const PE_MAGIC: [u8; 2] = [0x4D, 0x5A];
const MACHO_MAGICS: [[u8; 4]; 4] = [
    [0xFE, 0xED, 0xFA, 0xCE],
    [0xFE, 0xED, 0xFA, 0xCF],
    [0xCE, 0xFA, 0xED, 0xFE],
    [0xCF, 0xFA, 0xED, 0xFE],
];

/// A handle to an opened Go binary.
pub struct GoFile {
    fh: Box<dyn FileHandler>,
    info: FileInfo,
    build_id: String,
    build_info: Option<BuildInfo>,
    version: RwLock<Option<GoVersion>>,
    version_probe: OnceLock<Result<GoVersion>>,
    moduledata: OnceLock<Result<Moduledata>>,
    linetable: OnceLock<Result<LineTable>>,
    packages: OnceLock<Result<PackageSet>>,
}

impl GoFile {
    /// Opens a file, sniffs its magic and prepares the handle.
    ///
    /// Build ID and build info are extracted eagerly but their absence is
    /// not an error; operations depending on them fail individually later.
    pub fn open(path: impl AsRef<Path>) -> Result<GoFile> {
        let data = fs::read(path)?;
        Self::from_bytes(data)
    }

    fn from_bytes(data: Vec<u8>) -> Result<GoFile> {
        if data.len() < 4 {
            return Err(Error::NotEnoughBytesRead);
        }

        let fh: Box<dyn FileHandler> = if data.starts_with(&ELF_MAGIC) {
            Box::new(elf::ElfFile::new(data)?)
        } else if data.starts_with(&PE_MAGIC) {
            Box::new(pe::PeFile::new(data)?)
        } else if MACHO_MAGICS.iter().any(|m| data.starts_with(m)) {
            Box::new(macho::MachoFile::new(data)?)
        } else {
            return Err(Error::UnsupportedFile);
        };

        let info = fh.file_info();

        // Missing or tampered build IDs are not fatal.
        let build_id = fh.build_id().unwrap_or_default();

        let build_info = buildinfo::extract_build_info(&*fh).ok();
        let version = build_info.as_ref().and_then(|bi| bi.compiler.clone());
        if let Some(v) = &version {
            tracing::debug!("compiler version {} from build info", v);
        }

        Ok(GoFile {
            fh,
            info,
            build_id,
            build_info,
            version: RwLock::new(version),
            version_probe: OnceLock::new(),
            moduledata: OnceLock::new(),
            linetable: OnceLock::new(),
            packages: OnceLock::new(),
        })
    }

    /// Architecture, OS, byte order and word size of the binary, with the
    /// compiler version filled in once known.
    pub fn file_info(&self) -> FileInfo {
        let mut info = self.info.clone();
        info.version = self.version.read().expect("version lock").clone();
        info
    }

    /// Build ID hash embedded by the toolchain; empty when stripped.
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Module metadata embedded by the linker, when present.
    pub fn build_info(&self) -> Option<&BuildInfo> {
        self.build_info.as_ref()
    }

    /// The Go compiler release the binary was built with.
    ///
    /// Resolution order: build info, the `runtime.buildVersion` symbol,
    /// then a version-marker scan over read-only data. The probe runs once;
    /// its outcome (including failure) is sticky.
    pub fn compiler_version(&self) -> Result<GoVersion> {
        if let Some(v) = self.version.read().expect("version lock").clone() {
            return Ok(v);
        }
        let probed = self.version_probe.get_or_init(|| self.detect_version());
        match probed {
            Ok(v) => {
                *self.version.write().expect("version lock") = Some(v.clone());
                Ok(v.clone())
            }
            Err(e) => Err(e.clone()),
        }
    }

    fn detect_version(&self) -> Result<GoVersion> {
        if let Ok((addr, _)) = self.fh.get_symbol("runtime.buildVersion") {
            if let Some(v) = self.read_version_string(addr) {
                return Ok(v);
            }
        }
        if let Ok(rdata) = self.fh.rdata() {
            if let Ok(v) = goversion::scan_for_version(&rdata) {
                return Ok(v);
            }
        }
        let (_, data) = self.fh.section_data(self.fh.moduledata_section())?;
        goversion::scan_for_version(&data)
    }

    /// Chases the `runtime.buildVersion` string header.
    fn read_version_string(&self, addr: u64) -> Option<GoVersion> {
        let ws = self.info.word_size;
        let (base, data) = self.fh.section_from_address(addr).ok()?;
        let off = usize::try_from(addr - base).ok()?;
        let read = |o: usize| -> Option<u64> {
            let b = data.get(o..o + ws)?;
            Some(match (ws, self.info.big_endian) {
                (8, false) => u64::from_le_bytes(b.try_into().ok()?),
                (8, true) => u64::from_be_bytes(b.try_into().ok()?),
                (4, false) => u64::from(u32::from_le_bytes(b.try_into().ok()?)),
                _ => u64::from(u32::from_be_bytes(b.try_into().ok()?)),
            })
        };
        let sptr = read(off)?;
        let slen = read(off + ws)?;
        if slen > 64 {
            return None;
        }
        let (sbase, sdata) = self.fh.section_from_address(sptr).ok()?;
        let soff = usize::try_from(sptr - sbase).ok()?;
        let bytes = sdata.get(soff..soff + slen as usize)?;
        goversion::resolve_go_version(&String::from_utf8_lossy(bytes))
    }

    /// Forces the assumed compiler version, for binaries where detection
    /// fails. The string must be a release string such as `go1.12` or
    /// `go1.7.2`.
    pub fn set_compiler_version(&self, version: &str) -> Result<()> {
        let v = resolve_go_version(version).ok_or(Error::InvalidGoVersion)?;
        *self.version.write().expect("version lock") = Some(v);
        Ok(())
    }

    fn init_moduledata(&self) -> &Result<Moduledata> {
        self.moduledata.get_or_init(|| {
            // A known version narrows the layout search but is not required.
            let version = self.compiler_version().ok();
            moduledata::extract_moduledata(&self.info, version.as_ref(), &*self.fh)
        })
    }

    /// The normalized moduledata view.
    pub fn moduledata(&self) -> Result<Moduledata> {
        self.init_moduledata().clone()
    }

    fn init_linetable(&self) -> &Result<LineTable> {
        self.linetable.get_or_init(|| {
            let md = self.init_moduledata().as_ref().map_err(Clone::clone)?;
            let (_, data) = self.fh.pclntab_data()?;
            LineTable::parse(data, md.text_addr, self.info.big_endian)
        })
    }

    /// The decoded PCLNTAB.
    pub fn pclntab(&self) -> Result<&LineTable> {
        self.init_linetable().as_ref().map_err(Clone::clone)
    }

    fn init_packages(&self) -> &Result<PackageSet> {
        self.packages.get_or_init(|| {
            let tab = self.init_linetable().as_ref().map_err(Clone::clone)?;
            packages::enumerate_packages(tab, self.build_info.as_ref())
        })
    }

    fn package_set(&self) -> Result<&PackageSet> {
        self.init_packages().as_ref().map_err(Clone::clone)
    }

    /// Packages classified as part of the main project.
    pub fn packages(&self) -> Result<&[Package]> {
        Ok(&self.package_set()?.main)
    }

    /// Third-party packages.
    pub fn vendors(&self) -> Result<&[Package]> {
        Ok(&self.package_set()?.vendor)
    }

    /// Standard-library packages.
    pub fn stdlib(&self) -> Result<&[Package]> {
        Ok(&self.package_set()?.std)
    }

    /// Compiler-generated packages.
    pub fn generated(&self) -> Result<&[Package]> {
        Ok(&self.package_set()?.generated)
    }

    /// Packages that could not be classified.
    pub fn unknown(&self) -> Result<&[Package]> {
        Ok(&self.package_set()?.unknown)
    }

    /// All named types recovered from the runtime type tables, sorted by
    /// package path then name.
    pub fn types(&self) -> Result<Vec<GoType>> {
        let version = self.compiler_version()?;
        let md = self.init_moduledata().as_ref().map_err(Clone::clone)?;
        gotypes::parse_types(&self.info, &version, &*self.fh, md)
    }

    /// Source file, first line and last line of a function.
    ///
    /// The extent covers every instruction of the function, so functions
    /// with non-monotonic line assignments report their true span.
    pub fn source_info(&self, function: &Function) -> Result<(String, i32, i32)> {
        let tab = self.pclntab()?;
        let file = tab.pc_to_file(function.offset).unwrap_or_default();
        let (start, end) = tab
            .line_extent(function.offset, function.end)
            .unwrap_or((0, 0));
        Ok((file, start, end))
    }

    /// The source files making up a package, recomputed on demand and
    /// sorted by file name.
    pub fn source_files(&self, pkg: &Package) -> Result<Vec<SourceFile>> {
        let tab = self.pclntab()?;
        let mut by_file: HashMap<String, Vec<FileEntry>> = HashMap::new();

        let mut add = |offset: u64, end: u64, display: String| {
            let file = tab.pc_to_file(offset).unwrap_or_default();
            let (start, stop) = tab.line_extent(offset, end).unwrap_or((0, 0));
            by_file
                .entry(path_base_name(&file).to_string())
                .or_default()
                .push(FileEntry {
                    name: display,
                    start,
                    end: stop,
                });
        };

        for f in &pkg.functions {
            add(f.offset, f.end, f.name.clone());
        }
        for m in &pkg.methods {
            add(
                m.function.offset,
                m.function.end,
                format!("{}{}", m.receiver, m.function.name),
            );
        }

        let mut files: Vec<SourceFile> = by_file
            .into_iter()
            .map(|(name, entries)| SourceFile { name, entries })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Raw bytes at a virtual address.
    ///
    /// Zero-length reads at a mapped address succeed with an empty buffer;
    /// reads crossing the end of the containing section fail rather than
    /// truncate.
    pub fn bytes(&self, address: u64, length: u64) -> Result<Vec<u8>> {
        let (base, section) = self.fh.section_from_address(address).map_err(|e| match e {
            Error::SectionDoesNotExist => Error::OutOfBounds,
            other => other,
        })?;
        let end = address.checked_add(length).ok_or(Error::OutOfBounds)?;
        if end - base > section.len() as u64 {
            return Err(Error::OutOfBounds);
        }
        let start = (address - base) as usize;
        Ok(section[start..start + length as usize].to_vec())
    }

    /// GOROOT of the toolchain that built the binary, derived from the
    /// recorded standard-library source paths.
    pub fn go_root(&self) -> Result<String> {
        let set = self.package_set()?;
        for pkg in &set.std {
            if let Some(i) = pkg.filepath.find("/src/") {
                let root = &pkg.filepath[..i];
                if !root.is_empty() {
                    return Ok(root.to_string());
                }
            }
        }
        Err(Error::Parse("unable to determine GOROOT".into()))
    }

    /// Raw DWARF sections, if the binary was not stripped of them.
    pub fn dwarf(&self) -> Result<DwarfData> {
        self.fh.dwarf()
    }

    /// Releases the handle and everything derived from it.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Base name of a slash-separated path; sentinels pass through.
fn path_base_name(p: &str) -> &str {
    match p.rfind('/') {
        Some(i) => &p[i + 1..],
        None => p,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_short_files() {
        assert_eq!(
            GoFile::from_bytes(vec![0x7F, 0x45]).err(),
            Some(Error::NotEnoughBytesRead)
        );
        assert_eq!(
            GoFile::from_bytes(Vec::new()).err(),
            Some(Error::NotEnoughBytesRead)
        );
    }

    #[test]
    fn open_rejects_unknown_magic() {
        // A fat Mach-O archive is not a thin image and is unsupported.
        assert_eq!(
            GoFile::from_bytes(vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 0]).err(),
            Some(Error::UnsupportedFile)
        );
        assert_eq!(
            GoFile::from_bytes(b"#!/bin/sh\necho hi\n".to_vec()).err(),
            Some(Error::UnsupportedFile)
        );
    }

    #[test]
    fn open_nonexistent_path_is_io_error() {
        match GoFile::open("/definitely/not/here") {
            Err(Error::Io(_)) => {}
            other => panic!("expected io error, got {:?}", other.err()),
        }
    }

    #[test]
    fn corrupt_elf_is_an_error_not_a_panic() {
        let mut data = ELF_MAGIC.to_vec();
        data.extend_from_slice(&[0xFF; 60]);
        assert!(GoFile::from_bytes(data).is_err());
    }

    #[test]
    fn path_base_name_handles_sentinels() {
        assert_eq!(path_base_name("/a/b/main.go"), "main.go");
        assert_eq!(path_base_name("<autogenerated>"), "<autogenerated>");
        assert_eq!(path_base_name(""), "");
    }

    #[test]
    fn arch_display_tags() {
        assert_eq!(Arch::Amd64.to_string(), "amd64");
        assert_eq!(Arch::I386.to_string(), "i386");
        assert_eq!(Arch::Arm64.to_string(), "arm64");
    }
}
