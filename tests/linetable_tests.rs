//! Line-table decoding against byte-exact synthetic tables.

mod common;

use common::{build_pclntab_118, sample_funcs};
use gander::LineTable;

const TEXT: u64 = 0x401000;

fn table() -> LineTable {
    let tab = build_pclntab_118(TEXT, &sample_funcs(TEXT));
    LineTable::parse(tab, TEXT, false).unwrap()
}

#[test]
fn function_enumeration() {
    let t = table();
    assert_eq!(t.num_funcs(), 4);

    let funcs = t.funcs();
    assert_eq!(funcs.len(), 4);
    assert_eq!(funcs[0].name, "main.main");
    assert_eq!(funcs[0].entry, TEXT);
    assert_eq!(funcs[0].end, TEXT + 0x40);
    assert_eq!(funcs[1].name, "main.(*Foo).Bar");
    assert_eq!(funcs[2].name, "fmt.Println");
    assert_eq!(funcs[3].name, "github.com/x/y.Run");
    assert_eq!(funcs[3].end, TEXT + 0x100);
}

#[test]
fn pc_to_file_resolution() {
    let t = table();
    assert_eq!(
        t.pc_to_file(TEXT).as_deref(),
        Some("/home/u/proj/cmd/main.go")
    );
    assert_eq!(
        t.pc_to_file(TEXT + 0x41).as_deref(),
        Some("/home/u/proj/cmd/main.go")
    );
    assert_eq!(
        t.pc_to_file(TEXT + 0x80).as_deref(),
        Some("/usr/local/go/src/fmt/print.go")
    );
    assert_eq!(
        t.pc_to_file(TEXT + 0xC0).as_deref(),
        Some("/root/go/pkg/mod/github.com/x/y@v1.2.3/run.go")
    );
}

#[test]
fn pc_to_line_follows_the_delta_stream() {
    let t = table();
    // main.main's line program: 120,122,119,121,125,118 in 10-byte runs.
    assert_eq!(t.pc_to_line(TEXT), Some(120));
    assert_eq!(t.pc_to_line(TEXT + 9), Some(120));
    assert_eq!(t.pc_to_line(TEXT + 10), Some(122));
    assert_eq!(t.pc_to_line(TEXT + 25), Some(119));
    assert_eq!(t.pc_to_line(TEXT + 50), Some(118));
    // fmt.Println is a single run.
    assert_eq!(t.pc_to_line(TEXT + 0xBF), Some(274));
}

#[test]
fn line_extent_is_not_the_endpoint_lines() {
    let t = table();
    // The entry line is 120 and the last instruction's line is 118; the
    // true extent spans the minimum and maximum of the whole program.
    let (start, end) = t.line_extent(TEXT, TEXT + 0x40).unwrap();
    assert_eq!((start, end), (118, 125));

    let (start, end) = t.line_extent(TEXT + 0x40, TEXT + 0x80).unwrap();
    assert_eq!((start, end), (30, 35));
}

#[test]
fn pcs_outside_the_table_resolve_to_nothing() {
    let t = table();
    assert_eq!(t.pc_to_line(TEXT - 1), None);
    assert_eq!(t.pc_to_line(TEXT + 0x100), None);
    assert_eq!(t.pc_to_file(0), None);
}

#[test]
fn truncated_table_fails_to_parse() {
    let tab = build_pclntab_118(TEXT, &sample_funcs(TEXT));
    assert!(LineTable::parse(tab[..40].to_vec(), TEXT, false).is_err());
}

#[test]
fn corrupted_region_offset_fails_to_parse() {
    let mut tab = build_pclntab_118(TEXT, &sample_funcs(TEXT));
    // Clobber the funcname region offset with a value past the table end.
    let huge = (tab.len() as u64 + 0x1000).to_le_bytes();
    tab[8 + 3 * 8..8 + 4 * 8].copy_from_slice(&huge);
    assert!(LineTable::parse(tab, TEXT, false).is_err());
}

#[test]
fn corrupted_stream_degrades_to_none() {
    let mut tab = build_pclntab_118(TEXT, &sample_funcs(TEXT));
    // Zero the whole pctab region: every pcvalue query now hits a
    // terminator immediately.
    let t = LineTable::parse(tab.clone(), TEXT, false).unwrap();
    let probe = t.funcs();
    assert!(!probe.is_empty());

    // Find the pctab offset from the header and wipe a few bytes of it.
    let pctab_off = u64::from_le_bytes(tab[8 + 6 * 8..8 + 7 * 8].try_into().unwrap()) as usize;
    for b in &mut tab[pctab_off..pctab_off + 8] {
        *b = 0;
    }
    let t = LineTable::parse(tab, TEXT, false).unwrap();
    assert_eq!(t.pc_to_line(TEXT), None);
}

#[test]
fn zero_text_start_falls_back_to_header_value() {
    let tab = build_pclntab_118(TEXT, &sample_funcs(TEXT));
    let t = LineTable::parse(tab, 0, false).unwrap();
    assert_eq!(t.text_start(), TEXT);
    assert_eq!(t.funcs()[0].entry, TEXT);
}
