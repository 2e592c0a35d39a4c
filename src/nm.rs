//! Symbol listing in the style of nm: BSD by default, POSIX and SysV on
//! request.

use crate::elf::*;
use crate::object::{self, parse_symbols, Binding, RawElf, SymKind, Symbol};
use std::fmt::Write;
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmFormat {
    Bsd,
    Posix,
    Sysv,
}

impl FromStr for NmFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<NmFormat, String> {
        match value {
            "bsd" => Ok(NmFormat::Bsd),
            "posix" => Ok(NmFormat::Posix),
            "sysv" => Ok(NmFormat::Sysv),
            other => Err(format!("unknown nm format `{}'", other)),
        }
    }
}

/// BSD-convention type letter: section category picks the letter, local
/// binding lowercases it.
fn type_letter(symbol: &Symbol, raw: &RawElf) -> char {
    let upper = if symbol.shndx == SHN_UNDEF {
        'U'
    } else if symbol.shndx == SHN_ABS {
        'A'
    } else if symbol.shndx == SHN_COMMON || symbol.kind == SymKind::Common {
        'C'
    } else if let Some(hdr) = raw.shdrs.get(symbol.shndx as usize) {
        if hdr.sh_flags & SHF_ALLOC == 0 {
            '?'
        } else if hdr.sh_flags & SHF_EXECINSTR != 0 {
            'T'
        } else if hdr.sh_type == SHT_NOBITS {
            'B'
        } else if hdr.sh_flags & SHF_WRITE != 0 {
            'D'
        } else {
            'R'
        }
    } else {
        '?'
    };

    if symbol.bind == Binding::Local && upper != 'U' {
        upper.to_ascii_lowercase()
    } else {
        upper
    }
}

/// List one file's symbols, sorted by (address, name).
pub fn format_file(path: &Path, format: NmFormat) -> Result<String, object::Error> {
    let display = path.display().to_string();
    let data = fs::read(path).map_err(|source| object::Error::Io {
        path: display.clone(),
        source,
    })?;
    let raw = RawElf::parse(&data, &display)?;
    let mut symbols = parse_symbols(&raw)?;

    symbols.retain(|s| {
        !s.name.is_empty() && !matches!(s.kind, SymKind::Section | SymKind::File)
    });
    symbols.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.name.cmp(&b.name)));

    let mut out = String::new();
    if symbols.is_empty() {
        writeln!(out, "{}: no symbols", display).ok();
        return Ok(out);
    }

    match format {
        NmFormat::Bsd => {
            for symbol in &symbols {
                let letter = type_letter(symbol, &raw);
                if symbol.shndx == SHN_UNDEF {
                    writeln!(out, "{:16} {} {}", "", letter, symbol.name).ok();
                } else {
                    writeln!(out, "{:016x} {} {}", symbol.value, letter, symbol.name).ok();
                }
            }
        }
        NmFormat::Posix => {
            for symbol in &symbols {
                let letter = type_letter(symbol, &raw);
                if symbol.shndx == SHN_UNDEF {
                    writeln!(out, "{} {}", symbol.name, letter).ok();
                } else {
                    writeln!(
                        out,
                        "{} {} {:x} {:x}",
                        symbol.name, letter, symbol.value, symbol.size
                    )
                    .ok();
                }
            }
        }
        NmFormat::Sysv => {
            writeln!(
                out,
                "Symbols from {}:\n\n{:<20}|{:>16}|{:>8}| Type\n",
                display, "Name", "Value", "Size"
            )
            .ok();
            for symbol in &symbols {
                writeln!(
                    out,
                    "{:<20}|{:016x}|{:8x}| {}",
                    symbol.name,
                    symbol.value,
                    symbol.size,
                    type_letter(symbol, &raw)
                )
                .ok();
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ObjBuilder;

    fn sample_path(dir: &Path) -> std::path::PathBuf {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0xc3; 16],
            4,
        );
        let data = b.section(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, vec![0; 8], 8);
        let bss = b.section(".bss", SHT_NOBITS, SHF_ALLOC | SHF_WRITE, vec![0; 8], 8);
        let rodata = b.section(".rodata", SHT_PROGBITS, SHF_ALLOC, vec![0; 8], 8);
        b.symbol("local_fn", STB_LOCAL, STT_FUNC, Some(text), 4, 4);
        b.symbol("main", STB_GLOBAL, STT_FUNC, Some(text), 0, 8);
        b.symbol("counter", STB_GLOBAL, STT_OBJECT, Some(data), 0, 8);
        b.symbol("buffer", STB_GLOBAL, STT_OBJECT, Some(bss), 0, 8);
        b.symbol("banner", STB_GLOBAL, STT_OBJECT, Some(rodata), 0, 8);
        b.symbol("puts", STB_GLOBAL, STT_NOTYPE, None, 0, 0);
        b.symbol_raw("origin", STB_GLOBAL, STT_OBJECT, SHN_ABS, 0x1234, 0);
        let path = dir.join("sample.o");
        fs::write(&path, b.build()).unwrap();
        path
    }

    #[test]
    fn bsd_letters_follow_section_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_path(dir.path());
        let out = format_file(&path, NmFormat::Bsd).unwrap();

        assert!(out.contains("T main"));
        assert!(out.contains("t local_fn"));
        assert!(out.contains("D counter"));
        assert!(out.contains("B buffer"));
        assert!(out.contains("R banner"));
        assert!(out.contains("U puts"));
        assert!(out.contains("A origin"));
    }

    #[test]
    fn symbols_sort_by_address_then_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_path(dir.path());
        let out = format_file(&path, NmFormat::Bsd).unwrap();

        let main_at = out.find(" main").unwrap();
        let local_at = out.find(" local_fn").unwrap();
        // main at offset 0 sorts before local_fn at offset 4
        assert!(main_at < local_at);
    }

    #[test]
    fn posix_format_includes_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_path(dir.path());
        let out = format_file(&path, NmFormat::Posix).unwrap();
        assert!(out.lines().any(|l| l.starts_with("main T ") && l.ends_with(" 8")));
    }

    #[test]
    fn object_without_symtab_reports_no_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = ObjBuilder::new();
        b.section(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, vec![0x90; 4], 4);
        let path = dir.path().join("bare.o");
        // symtab exists but only holds the null entry; drop all symbols
        fs::write(&path, b.build()).unwrap();
        let out = format_file(&path, NmFormat::Bsd).unwrap();
        assert!(out.contains("no symbols"));
    }
}
