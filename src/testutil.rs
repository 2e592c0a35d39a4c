//! Test-only builders emitting well-formed ELF64 relocatables in memory,
//! so parser and linker tests need no fixture files.

use crate::elf::*;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

struct BuildSection {
    name: String,
    sh_type: u32,
    flags: u64,
    data: Vec<u8>,
    size: u64,
    align: u64,
}

struct BuildSymbol {
    name: String,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

struct BuildRela {
    target: usize,
    offset: u64,
    rtype: u32,
    sym: usize,
    addend: i64,
}

pub struct ObjBuilder {
    machine: u16,
    sections: Vec<BuildSection>,
    symbols: Vec<BuildSymbol>,
    relas: Vec<BuildRela>,
}

impl ObjBuilder {
    pub fn new() -> ObjBuilder {
        ObjBuilder {
            machine: EM_X86_64,
            sections: Vec::new(),
            symbols: Vec::new(),
            relas: Vec::new(),
        }
    }

    pub fn new_aarch64() -> ObjBuilder {
        let mut b = ObjBuilder::new();
        b.machine = EM_AARCH64;
        b
    }

    /// Add a section; returns a handle used by `symbol` and `rela`.
    /// For NOBITS sections only `data.len()` matters.
    pub fn section(
        &mut self,
        name: &str,
        sh_type: u32,
        flags: u64,
        data: Vec<u8>,
        align: u64,
    ) -> usize {
        let size = data.len() as u64;
        self.sections.push(BuildSection {
            name: name.to_owned(),
            sh_type,
            flags,
            data,
            size,
            align,
        });
        self.sections.len() - 1
    }

    /// Add a NOBITS section of the given size without materialising it.
    pub fn section_nobits(&mut self, name: &str, flags: u64, size: u64, align: u64) -> usize {
        self.sections.push(BuildSection {
            name: name.to_owned(),
            sh_type: SHT_NOBITS,
            flags,
            data: Vec::new(),
            size,
            align,
        });
        self.sections.len() - 1
    }

    /// Add a symbol. `section` of `None` makes it undefined.
    pub fn symbol(
        &mut self,
        name: &str,
        bind: u8,
        kind: u8,
        section: Option<usize>,
        value: u64,
        size: u64,
    ) -> usize {
        let shndx = match section {
            Some(handle) => (handle + 1) as u16,
            None => SHN_UNDEF,
        };
        self.symbol_raw(name, bind, kind, shndx, value, size)
    }

    /// Add a symbol with an explicit raw section index (SHN_ABS,
    /// SHN_COMMON, ...).
    pub fn symbol_raw(
        &mut self,
        name: &str,
        bind: u8,
        kind: u8,
        shndx: u16,
        value: u64,
        size: u64,
    ) -> usize {
        self.symbols.push(BuildSymbol {
            name: name.to_owned(),
            info: (bind << 4) | (kind & 0xf),
            shndx,
            value,
            size,
        });
        self.symbols.len() - 1
    }

    /// Add a RELA entry against `target`, referencing a symbol by name.
    pub fn rela(&mut self, target: usize, offset: u64, rtype: u32, sym_name: &str, addend: i64) {
        let sym = self
            .symbols
            .iter()
            .position(|s| s.name == sym_name)
            .expect("rela references a symbol the builder does not have");
        self.relas.push(BuildRela {
            target,
            offset,
            rtype,
            sym,
            addend,
        });
    }

    pub fn build(&self) -> Vec<u8> {
        // header indices: null, user sections, .symtab, .strtab,
        // .shstrtab, then one .rela per target section carrying entries
        let symtab_index = 1 + self.sections.len();
        let strtab_index = symtab_index + 1;
        let shstrndx = strtab_index + 1;

        let mut rela_targets: Vec<usize> = Vec::new();
        for rela in &self.relas {
            if !rela_targets.contains(&rela.target) {
                rela_targets.push(rela.target);
            }
        }
        let shnum = shstrndx + 1 + rela_targets.len();

        // .strtab and symbol name offsets
        let mut strtab = vec![0u8];
        let mut sym_name_offsets = Vec::with_capacity(self.symbols.len());
        for sym in &self.symbols {
            if sym.name.is_empty() {
                sym_name_offsets.push(0u32);
            } else {
                sym_name_offsets.push(strtab.len() as u32);
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
            }
        }

        // .symtab payload, null symbol first
        let mut symtab = Vec::new();
        symtab.extend_from_slice(&[0u8; SYM_SIZE as usize]);
        for (sym, name_off) in self.symbols.iter().zip(&sym_name_offsets) {
            symtab.write_u32::<LittleEndian>(*name_off).unwrap();
            symtab.write_u8(sym.info).unwrap();
            symtab.write_u8(0).unwrap();
            symtab.write_u16::<LittleEndian>(sym.shndx).unwrap();
            symtab.write_u64::<LittleEndian>(sym.value).unwrap();
            symtab.write_u64::<LittleEndian>(sym.size).unwrap();
        }
        let locals = 1 + self
            .symbols
            .iter()
            .take_while(|s| s.info >> 4 == STB_LOCAL)
            .count();

        // .shstrtab and section name offsets
        let mut shstrtab = vec![0u8];
        let name_off = |table: &mut Vec<u8>, name: &str| -> u32 {
            let off = table.len() as u32;
            table.extend_from_slice(name.as_bytes());
            table.push(0);
            off
        };
        let user_name_offs: Vec<u32> = self
            .sections
            .iter()
            .map(|s| name_off(&mut shstrtab, &s.name))
            .collect();
        let symtab_name = name_off(&mut shstrtab, ".symtab");
        let strtab_name = name_off(&mut shstrtab, ".strtab");
        let shstrtab_name = name_off(&mut shstrtab, ".shstrtab");
        let rela_name_offs: Vec<u32> = rela_targets
            .iter()
            .map(|t| name_off(&mut shstrtab, &format!(".rela{}", self.sections[*t].name)))
            .collect();

        // lay out payloads after the ELF header
        let mut out = vec![0u8; EHDR_SIZE as usize];
        let mut offsets: Vec<(u64, u64)> = Vec::new(); // (sh_offset, sh_size) per header

        offsets.push((0, 0)); // null
        for sec in &self.sections {
            let off = out.len() as u64;
            if sec.sh_type != SHT_NOBITS {
                out.extend_from_slice(&sec.data);
            }
            offsets.push((off, sec.size));
        }
        let symtab_off = out.len() as u64;
        out.write_all(&symtab).unwrap();
        offsets.push((symtab_off, symtab.len() as u64));
        let strtab_off = out.len() as u64;
        out.write_all(&strtab).unwrap();
        offsets.push((strtab_off, strtab.len() as u64));
        let shstrtab_off = out.len() as u64;
        out.write_all(&shstrtab).unwrap();
        offsets.push((shstrtab_off, shstrtab.len() as u64));

        let mut rela_payloads: Vec<(u64, u64)> = Vec::new();
        for target in &rela_targets {
            let off = out.len() as u64;
            let mut count = 0u64;
            for rela in self.relas.iter().filter(|r| r.target == *target) {
                out.write_u64::<LittleEndian>(rela.offset).unwrap();
                let info = ((rela.sym as u64 + 1) << 32) | rela.rtype as u64;
                out.write_u64::<LittleEndian>(info).unwrap();
                out.write_i64::<LittleEndian>(rela.addend).unwrap();
                count += 1;
            }
            rela_payloads.push((off, count * RELA_SIZE));
        }

        // section header table
        let e_shoff = out.len() as u64;
        let shdr = |out: &mut Vec<u8>,
                        name: u32,
                        sh_type: u32,
                        flags: u64,
                        off: u64,
                        size: u64,
                        link: u32,
                        info: u32,
                        align: u64,
                        entsize: u64| {
            out.write_u32::<LittleEndian>(name).unwrap();
            out.write_u32::<LittleEndian>(sh_type).unwrap();
            out.write_u64::<LittleEndian>(flags).unwrap();
            out.write_u64::<LittleEndian>(0).unwrap(); // sh_addr
            out.write_u64::<LittleEndian>(off).unwrap();
            out.write_u64::<LittleEndian>(size).unwrap();
            out.write_u32::<LittleEndian>(link).unwrap();
            out.write_u32::<LittleEndian>(info).unwrap();
            out.write_u64::<LittleEndian>(align).unwrap();
            out.write_u64::<LittleEndian>(entsize).unwrap();
        };

        shdr(&mut out, 0, SHT_NULL, 0, 0, 0, 0, 0, 0, 0);
        for (i, sec) in self.sections.iter().enumerate() {
            let (off, size) = offsets[i + 1];
            shdr(
                &mut out,
                user_name_offs[i],
                sec.sh_type,
                sec.flags,
                off,
                size,
                0,
                0,
                sec.align,
                0,
            );
        }
        shdr(
            &mut out,
            symtab_name,
            SHT_SYMTAB,
            0,
            offsets[symtab_index].0,
            offsets[symtab_index].1,
            strtab_index as u32,
            locals as u32,
            8,
            SYM_SIZE,
        );
        shdr(
            &mut out,
            strtab_name,
            SHT_STRTAB,
            0,
            offsets[strtab_index].0,
            offsets[strtab_index].1,
            0,
            0,
            1,
            0,
        );
        shdr(
            &mut out,
            shstrtab_name,
            SHT_STRTAB,
            0,
            offsets[shstrndx].0,
            offsets[shstrndx].1,
            0,
            0,
            1,
            0,
        );
        for (i, target) in rela_targets.iter().enumerate() {
            let (off, size) = rela_payloads[i];
            shdr(
                &mut out,
                rela_name_offs[i],
                SHT_RELA,
                0,
                off,
                size,
                symtab_index as u32,
                (*target + 1) as u32,
                8,
                RELA_SIZE,
            );
        }

        // patch the ELF header in place
        let mut ehdr = Vec::with_capacity(EHDR_SIZE as usize);
        ehdr.extend_from_slice(&ELF_MAGIC);
        ehdr.push(ELFCLASS64);
        ehdr.push(ELFDATA2LSB);
        ehdr.push(1); // EI_VERSION
        ehdr.push(ELFOSABI_SYSV);
        ehdr.extend_from_slice(&[0u8; 8]); // ABI version + padding
        ehdr.write_u16::<LittleEndian>(ET_REL).unwrap();
        ehdr.write_u16::<LittleEndian>(self.machine).unwrap();
        ehdr.write_u32::<LittleEndian>(EV_CURRENT).unwrap();
        ehdr.write_u64::<LittleEndian>(0).unwrap(); // e_entry
        ehdr.write_u64::<LittleEndian>(0).unwrap(); // e_phoff
        ehdr.write_u64::<LittleEndian>(e_shoff).unwrap();
        ehdr.write_u32::<LittleEndian>(0).unwrap(); // e_flags
        ehdr.write_u16::<LittleEndian>(EHDR_SIZE as u16).unwrap();
        ehdr.write_u16::<LittleEndian>(0).unwrap(); // e_phentsize
        ehdr.write_u16::<LittleEndian>(0).unwrap(); // e_phnum
        ehdr.write_u16::<LittleEndian>(SHDR_SIZE as u16).unwrap();
        ehdr.write_u16::<LittleEndian>(shnum as u16).unwrap();
        ehdr.write_u16::<LittleEndian>(shstrndx as u16).unwrap();
        out[..EHDR_SIZE as usize].copy_from_slice(&ehdr);

        out
    }
}
