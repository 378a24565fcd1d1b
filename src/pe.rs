//! PE/COFF container reader.
//!
//! PE binaries never carry the `runtime.pclntab` symbol, so the table is
//! always located by pattern search. COFF symbol values are section-relative
//! and must be rebased against the image base; sizes are synthesized by
//! sorting symbol addresses and taking successive differences.

use std::collections::HashMap;
use std::sync::OnceLock;

use goblin::pe::PE;

use crate::buildinfo::parse_build_id_from_raw;
use crate::error::{Error, Result};
use crate::pclntab::search_section_for_tab;
use crate::{catch_parse_panic, Arch, DwarfData, FileHandler, FileInfo};

const IMAGE_FILE_MACHINE_I386: u16 = 0x14c;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

/// COFF pseudo section numbers that carry absolute or debug values.
const SYM_UNDEFINED: i16 = 0;
const SYM_ABSOLUTE: i16 = -1;
const SYM_DEBUG: i16 = -2;

#[derive(Debug, Clone, Copy)]
struct PeSymbol {
    value: u64,
    size: u64,
}

pub(crate) struct PeFile {
    data: Vec<u8>,
    image_base: u64,
    symtab: OnceLock<Result<HashMap<String, PeSymbol>>>,
    pcln: OnceLock<Result<(u64, Vec<u8>)>>,
}

impl PeFile {
    pub(crate) fn new(data: Vec<u8>) -> Result<PeFile> {
        let image_base = catch_parse_panic(|| {
            let pe = PE::parse(&data)?;
            let hdr = pe
                .header
                .optional_header
                .ok_or_else(|| Error::Parse("missing optional header".into()))?;
            Ok(hdr.windows_fields.image_base)
        })?;
        Ok(PeFile {
            data,
            image_base,
            symtab: OnceLock::new(),
            pcln: OnceLock::new(),
        })
    }

    fn parse(&self) -> Result<PE<'_>> {
        catch_parse_panic(|| PE::parse(&self.data).map_err(Error::from))
    }

    fn section_name(raw: &[u8; 8]) -> String {
        String::from_utf8_lossy(raw)
            .trim_end_matches('\0')
            .to_string()
    }

    fn section(&self, pe: &PE, name: &str) -> Result<(u64, Vec<u8>)> {
        for sec in &pe.sections {
            if Self::section_name(&sec.name) != name {
                continue;
            }
            let start = sec.pointer_to_raw_data as usize;
            let end = start
                .checked_add(sec.size_of_raw_data as usize)
                .ok_or(Error::OutOfBounds)?;
            let bytes = self.data.get(start..end).ok_or(Error::OutOfBounds)?;
            return Ok((self.image_base + u64::from(sec.virtual_address), bytes.to_vec()));
        }
        Err(Error::SectionDoesNotExist)
    }

    /// Builds the rebased symbol table once. Sizes come from the distance to
    /// the next symbol in address order; the top symbol reports size 0.
    fn init_symtab(&self) -> &Result<HashMap<String, PeSymbol>> {
        self.symtab.get_or_init(|| {
            let pe = self.parse()?;
            let symbols = catch_parse_panic(|| {
                pe.header
                    .coff_header
                    .symbols(&self.data)
                    .map_err(Error::from)
            })?;
            let strings = catch_parse_panic(|| {
                pe.header
                    .coff_header
                    .strings(&self.data)
                    .map_err(Error::from)
            })?
            .unwrap_or_default();

            let mut syms: Vec<(String, PeSymbol)> = Vec::new();
            let mut addrs: Vec<u64> = Vec::new();

            let mut i = 0usize;
            while let Some((inline_name, symbol)) = symbols.as_ref().and_then(|s| s.get(i)) {
                i += 1 + symbol.number_of_aux_symbols as usize;

                let name = match inline_name {
                    Some(n) => n.to_string(),
                    None => symbol.name(&strings).map(str::to_string).unwrap_or_default(),
                };

                let mut value = u64::from(symbol.value);
                match symbol.section_number {
                    SYM_UNDEFINED | SYM_ABSOLUTE | SYM_DEBUG => {}
                    n => {
                        if n < 0 || pe.sections.len() < n as usize {
                            return Err(Error::Parse(
                                "invalid section number in symbol table".into(),
                            ));
                        }
                        let sec = &pe.sections[n as usize - 1];
                        value += self.image_base + u64::from(sec.virtual_address);
                    }
                }
                addrs.push(value);
                syms.push((name, PeSymbol { value, size: 0 }));
            }

            addrs.sort_unstable();
            let mut table = HashMap::with_capacity(syms.len());
            for (name, mut sym) in syms {
                let j = addrs.partition_point(|&a| a <= sym.value);
                if j < addrs.len() {
                    sym.size = addrs[j] - sym.value;
                }
                table.insert(name, sym);
            }
            tracing::debug!("normalized {} COFF symbols", table.len());
            Ok(table)
        })
    }

    fn search_for_pclntab(&self) -> Result<(u64, Vec<u8>)> {
        let pe = self.parse()?;
        for name in [".rdata", ".text"] {
            let Ok((addr, data)) = self.section(&pe, name) else {
                continue;
            };
            match search_section_for_tab(&data, false) {
                Ok(off) => return Ok((addr + off as u64, data[off..].to_vec())),
                Err(_) => continue,
            }
        }
        Err(Error::NoPclntab)
    }
}

impl FileHandler for PeFile {
    fn get_symbol(&self, name: &str) -> Result<(u64, u64)> {
        let table = self.init_symtab().as_ref().map_err(Clone::clone)?;
        let sym = table.get(name).ok_or(Error::SymbolNotFound)?;
        Ok((sym.value, sym.size))
    }

    fn has_symbol_table(&self) -> Result<bool> {
        let table = self.init_symtab().as_ref().map_err(Clone::clone)?;
        Ok(!table.is_empty())
    }

    fn pclntab_data(&self) -> Result<(u64, Vec<u8>)> {
        self.pcln
            .get_or_init(|| self.search_for_pclntab())
            .clone()
    }

    fn rdata(&self) -> Result<Vec<u8>> {
        let pe = self.parse()?;
        self.section(&pe, ".rdata").map(|(_, d)| d)
    }

    fn code_section(&self) -> Result<(u64, Vec<u8>)> {
        let pe = self.parse()?;
        self.section(&pe, ".text")
    }

    fn section_from_address(&self, address: u64) -> Result<(u64, Vec<u8>)> {
        let pe = self.parse()?;
        for sec in &pe.sections {
            if sec.pointer_to_raw_data == 0 {
                // Exists only in memory.
                continue;
            }
            let base = self.image_base + u64::from(sec.virtual_address);
            if address >= base && address < base + u64::from(sec.size_of_raw_data) {
                let start = sec.pointer_to_raw_data as usize;
                let end = start
                    .checked_add(sec.size_of_raw_data as usize)
                    .ok_or(Error::OutOfBounds)?;
                let bytes = self.data.get(start..end).ok_or(Error::OutOfBounds)?;
                return Ok((base, bytes.to_vec()));
            }
        }
        Err(Error::SectionDoesNotExist)
    }

    fn section_data(&self, name: &str) -> Result<(u64, Vec<u8>)> {
        let pe = self.parse()?;
        self.section(&pe, name)
    }

    fn file_info(&self) -> FileInfo {
        let Ok(pe) = self.parse() else {
            return FileInfo::default();
        };
        let (arch, word_size) = match pe.header.coff_header.machine {
            IMAGE_FILE_MACHINE_I386 => (Arch::I386, 4),
            IMAGE_FILE_MACHINE_ARM64 => (Arch::Arm64, 8),
            IMAGE_FILE_MACHINE_AMD64 => (Arch::Amd64, 8),
            _ => (Arch::Amd64, 8),
        };
        FileInfo {
            arch,
            os: "windows",
            big_endian: false,
            word_size,
            version: None,
        }
    }

    fn moduledata_section(&self) -> &'static str {
        ".data"
    }

    fn build_id(&self) -> Result<String> {
        let (_, code) = self.code_section()?;
        parse_build_id_from_raw(&code)
    }

    fn dwarf(&self) -> Result<DwarfData> {
        let pe = self.parse()?;
        let mut sections = Vec::new();
        for sec in &pe.sections {
            let name = Self::section_name(&sec.name);
            if !name.starts_with(".debug_") {
                continue;
            }
            if let Ok((_, data)) = self.section(&pe, &name) {
                sections.push((name, data));
            }
        }
        if sections.is_empty() {
            return Err(Error::NoDwarf);
        }
        Ok(DwarfData { sections })
    }
}
