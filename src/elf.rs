//! ELF container reader.

use goblin::elf::section_header::SHT_NOBITS;
use goblin::elf::Elf;

use crate::buildinfo::parse_build_id_from_raw;
use crate::error::{Error, Result};
use crate::pclntab::search_section_for_tab;
use crate::{catch_parse_panic, Arch, DwarfData, FileHandler, FileInfo};

/// Sections probed for a pattern-search when neither the `.gopclntab`
/// section nor the runtime symbols survived stripping.
const PCLNTAB_SEARCH_SECTIONS: [&str; 4] = [
    ".data.rel.ro.gopclntab",
    ".data.rel.ro",
    ".rodata",
    ".text",
];

pub(crate) struct ElfFile {
    data: Vec<u8>,
}

impl ElfFile {
    pub(crate) fn new(data: Vec<u8>) -> Result<ElfFile> {
        // Validate once so later per-call parses cannot fail differently.
        catch_parse_panic(|| Elf::parse(&data).map_err(Error::from))?;
        Ok(ElfFile { data })
    }

    fn parse(&self) -> Result<Elf<'_>> {
        catch_parse_panic(|| Elf::parse(&self.data).map_err(Error::from))
    }

    /// Section header lookup plus a bounds-checked copy of its bytes.
    fn section(&self, elf: &Elf, name: &str) -> Result<(u64, Vec<u8>)> {
        for sh in &elf.section_headers {
            if elf.shdr_strtab.get_at(sh.sh_name) != Some(name) {
                continue;
            }
            if sh.sh_type == SHT_NOBITS {
                return Err(Error::SectionDoesNotExist);
            }
            let start = sh.sh_offset as usize;
            let end = start
                .checked_add(sh.sh_size as usize)
                .ok_or(Error::OutOfBounds)?;
            let bytes = self.data.get(start..end).ok_or(Error::OutOfBounds)?;
            return Ok((sh.sh_addr, bytes.to_vec()));
        }
        Err(Error::SectionDoesNotExist)
    }

    fn symbol_value(&self, elf: &Elf, name: &str) -> Result<(u64, u64)> {
        for sym in elf.syms.iter() {
            if elf.strtab.get_at(sym.st_name) == Some(name) {
                return Ok((sym.st_value, sym.st_size));
            }
        }
        Err(Error::SymbolNotFound)
    }

    /// The pair of runtime symbols bounding the line table.
    fn pclntab_by_symbol(&self, elf: &Elf) -> Result<(u64, Vec<u8>)> {
        let (start, _) = self.symbol_value(elf, "runtime.pclntab")?;
        let (end, _) = self.symbol_value(elf, "runtime.epclntab")?;
        if end < start {
            return Err(Error::Parse("pclntab symbols out of order".into()));
        }
        let (base, sec) = self.section_from_address(start)?;
        let off = (start - base) as usize;
        let len = (end - start) as usize;
        let bytes = sec.get(off..off + len).ok_or(Error::OutOfBounds)?;
        Ok((start, bytes.to_vec()))
    }
}

impl FileHandler for ElfFile {
    fn get_symbol(&self, name: &str) -> Result<(u64, u64)> {
        let elf = self.parse()?;
        self.symbol_value(&elf, name)
    }

    fn has_symbol_table(&self) -> Result<bool> {
        let elf = self.parse()?;
        Ok(!elf.syms.is_empty())
    }

    fn pclntab_data(&self) -> Result<(u64, Vec<u8>)> {
        let elf = self.parse()?;

        match self.section(&elf, ".gopclntab") {
            Err(Error::SectionDoesNotExist) => {}
            other => return other,
        }

        if let Ok(found) = self.pclntab_by_symbol(&elf) {
            return Ok(found);
        }

        let big_endian = !elf.little_endian;
        for name in PCLNTAB_SEARCH_SECTIONS {
            let Ok((addr, data)) = self.section(&elf, name) else {
                continue;
            };
            if let Ok(off) = search_section_for_tab(&data, big_endian) {
                return Ok((addr + off as u64, data[off..].to_vec()));
            }
        }
        Err(Error::NoPclntab)
    }

    fn rdata(&self) -> Result<Vec<u8>> {
        let elf = self.parse()?;
        self.section(&elf, ".rodata").map(|(_, d)| d)
    }

    fn code_section(&self) -> Result<(u64, Vec<u8>)> {
        let elf = self.parse()?;
        self.section(&elf, ".text")
    }

    fn section_from_address(&self, address: u64) -> Result<(u64, Vec<u8>)> {
        let elf = self.parse()?;
        for sh in &elf.section_headers {
            if sh.sh_addr == 0 || sh.sh_type == SHT_NOBITS {
                continue;
            }
            if address >= sh.sh_addr && address < sh.sh_addr + sh.sh_size {
                let start = sh.sh_offset as usize;
                let end = start
                    .checked_add(sh.sh_size as usize)
                    .ok_or(Error::OutOfBounds)?;
                let bytes = self.data.get(start..end).ok_or(Error::OutOfBounds)?;
                return Ok((sh.sh_addr, bytes.to_vec()));
            }
        }
        Err(Error::SectionDoesNotExist)
    }

    fn section_data(&self, name: &str) -> Result<(u64, Vec<u8>)> {
        let elf = self.parse()?;
        self.section(&elf, name)
    }

    fn file_info(&self) -> FileInfo {
        use goblin::elf::header;

        let Ok(elf) = self.parse() else {
            return FileInfo::default();
        };
        let arch = match elf.header.e_machine {
            header::EM_386 => Arch::I386,
            header::EM_X86_64 => Arch::Amd64,
            header::EM_ARM => Arch::Arm,
            header::EM_AARCH64 => Arch::Arm64,
            header::EM_MIPS => Arch::Mips,
            m => {
                tracing::warn!("unrecognized ELF machine {:#x}, assuming amd64", m);
                Arch::Amd64
            }
        };
        FileInfo {
            arch,
            os: "linux",
            big_endian: !elf.little_endian,
            word_size: if elf.is_64 { 8 } else { 4 },
            version: None,
        }
    }

    fn moduledata_section(&self) -> &'static str {
        ".noptrdata"
    }

    fn build_id(&self) -> Result<String> {
        let elf = self.parse()?;
        if let Ok((_, note)) = self.section(&elf, ".note.go.buildid") {
            return parse_go_buildid_note(&note, !elf.little_endian);
        }
        let (_, code) = self.code_section()?;
        parse_build_id_from_raw(&code)
    }

    fn dwarf(&self) -> Result<DwarfData> {
        let elf = self.parse()?;
        let mut sections = Vec::new();
        for sh in &elf.section_headers {
            let Some(name) = elf.shdr_strtab.get_at(sh.sh_name) else {
                continue;
            };
            if !name.starts_with(".debug_") && !name.starts_with(".zdebug_") {
                continue;
            }
            if let Ok((_, data)) = self.section(&elf, name) {
                sections.push((name.to_string(), data));
            }
        }
        if sections.is_empty() {
            return Err(Error::NoDwarf);
        }
        Ok(DwarfData { sections })
    }
}

/// Decodes the `.note.go.buildid` note: 12-byte header, 4-byte "Go" name,
/// then the ID itself as the descriptor.
fn parse_go_buildid_note(note: &[u8], big_endian: bool) -> Result<String> {
    if note.len() < 16 {
        return Err(Error::Parse("buildid note truncated".into()));
    }
    let read_u32 = |b: &[u8]| -> u32 {
        let b: [u8; 4] = b.try_into().unwrap();
        if big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        }
    };
    let namesz = read_u32(&note[0..4]) as usize;
    let descsz = read_u32(&note[4..8]) as usize;
    let name_end = 12 + namesz.div_ceil(4) * 4;
    let desc = note
        .get(name_end..name_end + descsz)
        .ok_or_else(|| Error::Parse("buildid note descriptor out of range".into()))?;
    Ok(String::from_utf8_lossy(desc).into_owned())
}
