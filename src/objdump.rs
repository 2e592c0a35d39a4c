//! Section, symbol and relocation dump, plus a hex dump of executable
//! sections. No disassembly.

use crate::elf::*;
use crate::object::{self, parse_relas, parse_symbols, Arch, RawElf};
use std::fmt::Write;
use std::fs;
use std::path::Path;

fn to_hex_string(bytes: &[u8]) -> String {
    let strs: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    strs.join(" ")
}

fn machine_name(machine: u16) -> String {
    match Arch::from_machine(machine) {
        Some(arch) => arch.to_string(),
        None => format!("machine {}", machine),
    }
}

fn reloc_name(machine: u16, rtype: u32) -> &'static str {
    match Arch::from_machine(machine) {
        Some(arch) => arch.reloc_name(rtype),
        None => "Unknown",
    }
}

/// Render everything we know about one ELF file.
pub fn format_file(path: &Path) -> Result<String, object::Error> {
    let display = path.display().to_string();
    let data = fs::read(path).map_err(|source| object::Error::Io {
        path: display.clone(),
        source,
    })?;
    let raw = RawElf::parse(&data, &display)?;

    let mut out = String::new();
    writeln!(
        out,
        "{}: ELF64 {}, type {}, entry {:#x}, {} sections, {} program headers",
        display,
        machine_name(raw.e_machine),
        raw.e_type,
        raw.e_entry,
        raw.shdrs.len(),
        raw.e_phnum
    )
    .ok();

    if raw.shdrs.is_empty() {
        // the linker's own output carries no section headers at all
        writeln!(
            out,
            "\nno section headers (program header table at {:#x})",
            raw.e_phoff
        )
        .ok();
        return Ok(out);
    }

    // section header table
    writeln!(
        out,
        "\nSections:\n[No] {:<20} {:<10} {:<16} {:<8} {:<8} Flags",
        "Name", "Type", "Address", "Offset", "Size"
    )
    .ok();
    for (index, hdr) in raw.shdrs.iter().enumerate() {
        writeln!(
            out,
            "[{:02}] {:<20} {:<10} {:016x} {:08x} {:08x} {}",
            index,
            raw.section_name(index),
            section_type_name(hdr.sh_type),
            hdr.sh_addr,
            hdr.sh_offset,
            hdr.sh_size,
            section_flags_string(hdr.sh_flags)
        )
        .ok();
    }

    // symbol table
    let symbols = parse_symbols(&raw)?;
    if !symbols.is_empty() {
        writeln!(
            out,
            "\nSymbols:\n{:<6} {:<16} {:<8} {:<10} {:<8} {:<5} Name",
            "Num", "Value", "Size", "Type", "Bind", "Ndx"
        )
        .ok();
        for (index, symbol) in symbols.iter().enumerate() {
            let ndx = match symbol.shndx {
                SHN_UNDEF => "UND".to_owned(),
                SHN_ABS => "ABS".to_owned(),
                SHN_COMMON => "COM".to_owned(),
                other => format!("{:03}", other),
            };
            writeln!(
                out,
                "{:<6} {:016x} {:<8} {:<10} {:<8} {:<5} {}",
                index,
                symbol.value,
                symbol.size,
                format!("{:?}", symbol.kind),
                format!("{:?}", symbol.bind),
                ndx,
                symbol.name
            )
            .ok();
        }
    }

    // relocation sections
    let relas = parse_relas(&raw, symbols.len())?;
    for rela_section in &relas {
        writeln!(
            out,
            "\nRelocations for {}:\n{:<16} {:<26} {:<16} Symbol + Addend",
            raw.section_name(rela_section.target),
            "Offset",
            "Type",
            "Sym. Value"
        )
        .ok();
        for rela in &rela_section.entries {
            let (name, value) = symbols
                .get(rela.sym as usize)
                .map(|s| (s.name.as_str(), s.value))
                .unwrap_or(("", 0));
            writeln!(
                out,
                "{:016x} {:<26} {:016x} {} + {}",
                rela.offset,
                reloc_name(raw.e_machine, rela.rtype),
                value,
                name,
                rela.addend
            )
            .ok();
        }
    }

    // hex dump of executable sections
    for (index, hdr) in raw.shdrs.iter().enumerate() {
        if hdr.sh_flags & SHF_EXECINSTR == 0 || hdr.sh_type == SHT_NOBITS {
            continue;
        }
        writeln!(out, "\nContents of {}:", raw.section_name(index)).ok();
        let bytes = raw.section_data(index)?;
        for (row, chunk) in bytes.chunks(16).enumerate() {
            writeln!(out, "  {:08x}  {}", row * 16, to_hex_string(chunk)).ok();
        }
    }

    Ok(out)
}
