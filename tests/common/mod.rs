//! Shared builders for synthetic Go tables and containers.
//!
//! The fixtures build byte-exact structures the way the linker lays them
//! out, small enough to reason about by hand in the assertions.

// Not every test binary uses every builder.
#![allow(dead_code)]

/// One function to place in a synthetic line table.
pub struct FuncSpec {
    pub name: &'static str,
    pub entry: u64,
    pub end: u64,
    pub file: &'static str,
    /// `(line, instruction count)` runs, in PC order.
    pub lines: Vec<(i32, u32)>,
}

fn uvarint(out: &mut Vec<u8>, mut v: u32) {
    loop {
        let b = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            out.push(b | 0x80);
        } else {
            out.push(b);
            break;
        }
    }
}

fn zigzag(v: i32) -> u32 {
    if v >= 0 {
        (v as u32) << 1
    } else {
        (!(v as u32)) << 1 | 1
    }
}

/// Emits a value/PC delta stream: value deltas are zig-zag varints, PC
/// deltas plain varints (quantum 1), terminated by a zero delta.
fn pcvalue_stream(pairs: &[(i32, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = -1i32;
    for &(val, npcs) in pairs {
        uvarint(&mut out, zigzag(val - prev));
        uvarint(&mut out, npcs);
        prev = val;
    }
    out.push(0);
    out
}

/// Builds a Go 1.18-format PCLNTAB (little-endian, quantum 1, 64-bit) for
/// the given functions. Functions must be sorted by entry PC.
pub fn build_pclntab_118(text_start: u64, funcs: &[FuncSpec]) -> Vec<u8> {
    const MAGIC_1_18: u32 = 0xFFFF_FFF0;

    // funcnametab: one NUL-terminated string per function.
    let mut funcnametab = Vec::new();
    let mut name_offs = Vec::new();
    for f in funcs {
        name_offs.push(funcnametab.len() as u32);
        funcnametab.extend_from_slice(f.name.as_bytes());
        funcnametab.push(0);
    }

    // filetab: deduplicated file strings; cutab maps file index to offset.
    let mut filetab = vec![0u8];
    let mut file_offs: Vec<u32> = Vec::new();
    let mut file_index: Vec<u32> = Vec::new();
    let mut seen: Vec<&str> = Vec::new();
    for f in funcs {
        match seen.iter().position(|&s| s == f.file) {
            Some(i) => file_index.push(i as u32),
            None => {
                seen.push(f.file);
                file_offs.push(filetab.len() as u32);
                filetab.extend_from_slice(f.file.as_bytes());
                filetab.push(0);
                file_index.push(file_offs.len() as u32 - 1);
            }
        }
    }
    let mut cutab = Vec::new();
    for off in &file_offs {
        cutab.extend_from_slice(&off.to_le_bytes());
    }

    // pctab: the pcfile and pcln streams per function; offset 0 is kept
    // unused so a zero offset never aliases a real stream.
    let mut pctab = vec![0u8];
    let mut pcfile_offs = Vec::new();
    let mut pcln_offs = Vec::new();
    for (i, f) in funcs.iter().enumerate() {
        let total: u32 = f.lines.iter().map(|&(_, n)| n).sum();
        pcfile_offs.push(pctab.len() as u32);
        pctab.extend_from_slice(&pcvalue_stream(&[(file_index[i] as i32, total)]));
        pcln_offs.push(pctab.len() as u32);
        pctab.extend_from_slice(&pcvalue_stream(&f.lines));
    }

    // functab: (entry offset, func record offset) pairs, end sentinel, then
    // the function records themselves. Record offsets are region-relative.
    let functab_head = (funcs.len() * 2 + 1) * 4;
    let mut records = Vec::new();
    let mut func_offs = Vec::new();
    for (i, f) in funcs.iter().enumerate() {
        func_offs.push((functab_head + records.len()) as u32);
        let fields = [
            (f.entry - text_start) as u32,
            name_offs[i],
            0, // args
            0, // deferreturn
            0, // pcsp
            pcfile_offs[i],
            pcln_offs[i],
            0, // npcdata
            0, // cuOffset
            0,
        ];
        for v in fields {
            records.extend_from_slice(&v.to_le_bytes());
        }
    }
    let mut functab = Vec::new();
    for (i, f) in funcs.iter().enumerate() {
        functab.extend_from_slice(&((f.entry - text_start) as u32).to_le_bytes());
        functab.extend_from_slice(&func_offs[i].to_le_bytes());
    }
    let last_end = funcs.last().map(|f| f.end).unwrap_or(text_start);
    functab.extend_from_slice(&((last_end - text_start) as u32).to_le_bytes());
    functab.extend_from_slice(&records);

    // Header: magic, pad, quantum, ptr size, then eight offset words.
    let header_len = 8 + 8 * 8;
    let funcname_off = header_len as u64;
    let cutab_off = funcname_off + funcnametab.len() as u64;
    let filetab_off = cutab_off + cutab.len() as u64;
    let pctab_off = filetab_off + filetab.len() as u64;
    let pcln_off = pctab_off + pctab.len() as u64;

    let mut tab = Vec::new();
    tab.extend_from_slice(&MAGIC_1_18.to_le_bytes());
    tab.extend_from_slice(&[0, 0, 1, 8]);
    for w in [
        funcs.len() as u64,
        file_offs.len() as u64,
        text_start,
        funcname_off,
        cutab_off,
        filetab_off,
        pctab_off,
        pcln_off,
    ] {
        tab.extend_from_slice(&w.to_le_bytes());
    }
    tab.extend_from_slice(&funcnametab);
    tab.extend_from_slice(&cutab);
    tab.extend_from_slice(&filetab);
    tab.extend_from_slice(&pctab);
    tab.extend_from_slice(&functab);
    tab
}

/// The standard fixture: a main function with a non-monotonic line
/// program, a method, a stdlib function and a module-cache vendor function.
pub fn sample_funcs(text: u64) -> Vec<FuncSpec> {
    vec![
        FuncSpec {
            name: "main.main",
            entry: text,
            end: text + 0x40,
            file: "/home/u/proj/cmd/main.go",
            lines: vec![(120, 10), (122, 10), (119, 10), (121, 10), (125, 10), (118, 10)],
        },
        FuncSpec {
            name: "main.(*Foo).Bar",
            entry: text + 0x40,
            end: text + 0x80,
            file: "/home/u/proj/cmd/main.go",
            lines: vec![(30, 0x20), (35, 0x20)],
        },
        FuncSpec {
            name: "fmt.Println",
            entry: text + 0x80,
            end: text + 0xC0,
            file: "/usr/local/go/src/fmt/print.go",
            lines: vec![(274, 0x40)],
        },
        FuncSpec {
            name: "github.com/x/y.Run",
            entry: text + 0xC0,
            end: text + 0x100,
            file: "/root/go/pkg/mod/github.com/x/y@v1.2.3/run.go",
            lines: vec![(10, 0x40)],
        },
    ]
}

/// A section to place in a synthetic ELF image.
pub struct SectionSpec {
    pub name: &'static str,
    pub addr: u64,
    pub data: Vec<u8>,
}

/// Builds a minimal 64-bit little-endian ELF executable containing the
/// given allocated sections.
pub fn build_elf64(sections: &[SectionSpec]) -> Vec<u8> {
    const EHDR_SIZE: usize = 64;
    const SHDR_SIZE: usize = 64;

    // Section name string table; entry 0 is the empty name.
    let mut shstrtab = vec![0u8];
    let mut name_offs = Vec::new();
    for s in sections {
        name_offs.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(s.name.as_bytes());
        shstrtab.push(0);
    }
    let shstrtab_name_off = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");

    // Lay the section payloads out after the header, 16-byte aligned.
    let mut cursor = EHDR_SIZE;
    let mut offsets = Vec::new();
    for s in sections {
        cursor = (cursor + 15) & !15;
        offsets.push(cursor);
        cursor += s.data.len();
    }
    cursor = (cursor + 15) & !15;
    let shstrtab_off = cursor;
    cursor += shstrtab.len();
    cursor = (cursor + 7) & !7;
    let shoff = cursor;

    let shnum = sections.len() + 2; // NULL + sections + .shstrtab
    let mut image = vec![0u8; shoff + shnum * SHDR_SIZE];

    // ELF header.
    image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    image[4] = 2; // 64-bit
    image[5] = 1; // little-endian
    image[6] = 1; // version
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    image[20..24].copy_from_slice(&1u32.to_le_bytes());
    image[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
    image[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    image[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
    image[60..62].copy_from_slice(&(shnum as u16).to_le_bytes());
    image[62..64].copy_from_slice(&((shnum - 1) as u16).to_le_bytes());

    for (i, s) in sections.iter().enumerate() {
        image[offsets[i]..offsets[i] + s.data.len()].copy_from_slice(&s.data);
    }
    image[shstrtab_off..shstrtab_off + shstrtab.len()].copy_from_slice(&shstrtab);

    let mut write_shdr = |index: usize, name: u32, addr: u64, off: u64, size: u64, flags: u64| {
        let base = shoff + index * SHDR_SIZE;
        image[base..base + 4].copy_from_slice(&name.to_le_bytes());
        let sh_type: u32 = if index == 0 { 0 } else if index == shnum - 1 { 3 } else { 1 };
        image[base + 4..base + 8].copy_from_slice(&sh_type.to_le_bytes());
        image[base + 8..base + 16].copy_from_slice(&flags.to_le_bytes());
        image[base + 16..base + 24].copy_from_slice(&addr.to_le_bytes());
        image[base + 24..base + 32].copy_from_slice(&off.to_le_bytes());
        image[base + 32..base + 40].copy_from_slice(&size.to_le_bytes());
        image[base + 48..base + 56].copy_from_slice(&1u64.to_le_bytes());
    };

    write_shdr(0, 0, 0, 0, 0, 0);
    for (i, s) in sections.iter().enumerate() {
        write_shdr(
            i + 1,
            name_offs[i],
            s.addr,
            offsets[i] as u64,
            s.data.len() as u64,
            0x2, // SHF_ALLOC
        );
    }
    write_shdr(
        shnum - 1,
        shstrtab_name_off,
        0,
        shstrtab_off as u64,
        shstrtab.len() as u64,
        0,
    );

    image
}

/// Moduledata blob matching the Go 1.18 field order, 64-bit little-endian.
pub fn build_moduledata_118(
    pclntab_addr: u64,
    text: u64,
    etext: u64,
    nfunc: u64,
    ftab_addr: u64,
) -> Vec<u8> {
    fn word(out: &mut Vec<u8>, v: u64) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    fn slice(out: &mut Vec<u8>, ptr: u64, len: u64) {
        word(out, ptr);
        word(out, len);
        word(out, len);
    }

    let mut out = Vec::new();
    word(&mut out, pclntab_addr); // pcHeader
    slice(&mut out, 0, 0); // funcnametab
    slice(&mut out, 0, 0); // cutab
    slice(&mut out, 0, 0); // filetab
    slice(&mut out, 0, 0); // pctab
    slice(&mut out, 0, 0); // pclntable
    slice(&mut out, ftab_addr, nfunc); // ftab
    word(&mut out, 0); // findfunctab
    word(&mut out, text); // minpc
    word(&mut out, etext); // maxpc
    word(&mut out, text); // text
    word(&mut out, etext); // etext
    for _ in 0..8 {
        // noptrdata/enoptrdata, data/edata, bss/ebss, noptrbss/enoptrbss
        word(&mut out, 0);
    }
    word(&mut out, 0); // end
    word(&mut out, 0); // gcdata
    word(&mut out, 0); // gcbss
    word(&mut out, 0); // types
    word(&mut out, 0); // etypes
    word(&mut out, 0); // rodata
    word(&mut out, 0); // gofunc
    slice(&mut out, 0, 0); // textsectmap
    slice(&mut out, 0, 0); // typelinks
    slice(&mut out, 0, 0); // itablinks
    out
}
