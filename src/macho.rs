//! Mach-O container reader.
//!
//! Only thin images are handled; fat archives have their own magic and are
//! rejected at dispatch. Apple targets are little-endian, but the header is
//! trusted over the assumption.

use goblin::mach::cputype::{CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64};
use goblin::mach::MachO;

use crate::buildinfo::parse_build_id_from_raw;
use crate::error::{Error, Result};
use crate::pclntab::search_section_for_tab;
use crate::{catch_parse_panic, Arch, DwarfData, FileHandler, FileInfo};

pub(crate) struct MachoFile {
    data: Vec<u8>,
}

impl MachoFile {
    pub(crate) fn new(data: Vec<u8>) -> Result<MachoFile> {
        catch_parse_panic(|| MachO::parse(&data, 0).map_err(Error::from))?;
        Ok(MachoFile { data })
    }

    fn parse(&self) -> Result<MachO<'_>> {
        catch_parse_panic(|| MachO::parse(&self.data, 0).map_err(Error::from))
    }

    fn section(&self, macho: &MachO, name: &str) -> Result<(u64, Vec<u8>)> {
        for seg in &macho.segments {
            let Ok(sections) = seg.sections() else {
                continue;
            };
            for (sec, data) in sections {
                if sec.name().map(|n| n == name).unwrap_or(false) {
                    return Ok((sec.addr, data.to_vec()));
                }
            }
        }
        Err(Error::SectionDoesNotExist)
    }

    fn pclntab_by_symbol(&self, macho: &MachO) -> Result<(u64, Vec<u8>)> {
        let (start, _) = self.symbol_value(macho, "runtime.pclntab")?;
        let (end, _) = self.symbol_value(macho, "runtime.epclntab")?;
        if end < start {
            return Err(Error::Parse("pclntab symbols out of order".into()));
        }
        let (base, sec) = self.section_from_address(start)?;
        let off = (start - base) as usize;
        let len = (end - start) as usize;
        let bytes = sec.get(off..off + len).ok_or(Error::OutOfBounds)?;
        Ok((start, bytes.to_vec()))
    }

    fn symbol_value(&self, macho: &MachO, name: &str) -> Result<(u64, u64)> {
        for sym in macho.symbols() {
            let Ok((sym_name, nlist)) = sym else {
                continue;
            };
            if sym_name == name {
                // Mach-O symbols carry no size.
                return Ok((nlist.n_value, 0));
            }
        }
        Err(Error::SymbolNotFound)
    }
}

impl FileHandler for MachoFile {
    fn get_symbol(&self, name: &str) -> Result<(u64, u64)> {
        let macho = self.parse()?;
        self.symbol_value(&macho, name)
    }

    fn has_symbol_table(&self) -> Result<bool> {
        let macho = self.parse()?;
        Ok(macho.symbols().next().is_some())
    }

    fn pclntab_data(&self) -> Result<(u64, Vec<u8>)> {
        let macho = self.parse()?;

        match self.section(&macho, "__gopclntab") {
            Err(Error::SectionDoesNotExist) => {}
            other => return other,
        }

        if let Ok(found) = self.pclntab_by_symbol(&macho) {
            return Ok(found);
        }

        for name in ["__rodata", "__text"] {
            let Ok((addr, data)) = self.section(&macho, name) else {
                continue;
            };
            if let Ok(off) = search_section_for_tab(&data, !macho.little_endian) {
                return Ok((addr + off as u64, data[off..].to_vec()));
            }
        }
        Err(Error::NoPclntab)
    }

    fn rdata(&self) -> Result<Vec<u8>> {
        let macho = self.parse()?;
        self.section(&macho, "__rodata").map(|(_, d)| d)
    }

    fn code_section(&self) -> Result<(u64, Vec<u8>)> {
        let macho = self.parse()?;
        self.section(&macho, "__text")
    }

    fn section_from_address(&self, address: u64) -> Result<(u64, Vec<u8>)> {
        let macho = self.parse()?;
        for seg in &macho.segments {
            let Ok(sections) = seg.sections() else {
                continue;
            };
            for (sec, data) in sections {
                if address >= sec.addr && address < sec.addr + sec.size {
                    return Ok((sec.addr, data.to_vec()));
                }
            }
        }
        Err(Error::SectionDoesNotExist)
    }

    fn section_data(&self, name: &str) -> Result<(u64, Vec<u8>)> {
        let macho = self.parse()?;
        self.section(&macho, name)
    }

    fn file_info(&self) -> FileInfo {
        let Ok(macho) = self.parse() else {
            return FileInfo::default();
        };
        let arch = match macho.header.cputype() {
            CPU_TYPE_X86_64 => Arch::Amd64,
            CPU_TYPE_X86 => Arch::I386,
            CPU_TYPE_ARM64 => Arch::Arm64,
            CPU_TYPE_ARM => Arch::Arm,
            c => {
                tracing::warn!("unrecognized Mach-O cputype {:#x}, assuming amd64", c);
                Arch::Amd64
            }
        };
        FileInfo {
            arch,
            os: "macOS",
            big_endian: !macho.little_endian,
            word_size: if macho.is_64 { 8 } else { 4 },
            version: None,
        }
    }

    fn moduledata_section(&self) -> &'static str {
        "__noptrdata"
    }

    fn build_id(&self) -> Result<String> {
        let (_, code) = self.code_section()?;
        parse_build_id_from_raw(&code)
    }

    fn dwarf(&self) -> Result<DwarfData> {
        let macho = self.parse()?;
        let mut sections = Vec::new();
        for seg in &macho.segments {
            if seg.name().map(|n| n != "__DWARF").unwrap_or(true) {
                continue;
            }
            let Ok(secs) = seg.sections() else {
                continue;
            };
            for (sec, data) in secs {
                if let Ok(name) = sec.name() {
                    sections.push((name.to_string(), data.to_vec()));
                }
            }
        }
        if sections.is_empty() {
            return Err(Error::NoDwarf);
        }
        Ok(DwarfData { sections })
    }
}
