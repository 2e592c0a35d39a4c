//! Two-pass relocation engine. Pass 1 applies every relocation it can and
//! records 32-bit PC-relative overflows; pass 2 re-applies the batch with
//! the overflowed sites redirected through the synthesised GOT/PLT.

use crate::elf::*;
use crate::merge::{Layout, BASE_VADDR};
use crate::object::{Arch, ObjectFile, Rela};
use crate::resolve::SymbolTable;
use crate::thunk::GotPlt;
use log::{debug, warn};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{object}: unsupported relocation type {rtype} for {arch}")]
    UnsupportedReloc {
        object: String,
        rtype: u32,
        arch: Arch,
    },

    #[error("relocation write of {width} bytes at offset {offset:#x} runs outside section `{section}' ({size} bytes)")]
    OutOfBounds {
        section: String,
        offset: u64,
        width: u64,
        size: u64,
    },

    #[error("PLT stub for `{name}' is unreachable from the site at {site:#x} (displacement {amount:#x})")]
    PltUnreachable { name: String, site: u64, amount: i64 },

    #[error("no PLT stub was synthesised for `{name}'")]
    MissingStub { name: String },
}

/// One relocation translated into merged-image terms: which merged
/// section it patches and at what offset inside that buffer.
#[derive(Debug, Clone, Copy)]
pub struct Site {
    pub object: usize,
    pub rela: Rela,
    pub merged: usize,
    pub offset: u64,
}

/// The flat, sorted batch of every relocation of every input.
#[derive(Debug, Default)]
pub struct RelocBatch {
    pub sites: Vec<Site>,
}

impl RelocBatch {
    /// Collect relocations whose target section made it into the image,
    /// then sort stably by the name of the target merged section so the
    /// write loop touches one buffer at a time.
    pub fn build(objects: &[ObjectFile], layout: &Layout) -> RelocBatch {
        let mut sites = Vec::new();
        for (object_index, object) in objects.iter().enumerate() {
            for rela_section in &object.relas {
                let place = match layout.placement(object_index, rela_section.target) {
                    Some(place) => place,
                    None => continue,
                };
                for rela in &rela_section.entries {
                    sites.push(Site {
                        object: object_index,
                        rela: *rela,
                        merged: place.merged,
                        offset: place.offset + rela.offset,
                    });
                }
            }
        }
        sites.sort_by(|a, b| layout.sections[a.merged].name.cmp(&layout.sections[b.merged].name));
        RelocBatch { sites }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// A site whose pass-1 displacement did not fit in 32 bits. Identified by
/// (merged section, offset, type, symbol name); pass 2 finds the stub by
/// name and the byte to rewrite by position.
#[derive(Debug, Clone)]
pub struct Overflow {
    pub name: String,
    pub value: u64,
    pub merged: usize,
    pub offset: u64,
    pub rtype: u32,
    pub addend: i64,
    pub site_addr: u64,
    pub amount: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyStats {
    pub applied: u64,
    pub skipped: u64,
    pub redirected: u64,
}

enum Outcome {
    Applied,
    Skipped,
    /// 32-bit PC-relative displacement out of range; fixable via PLT.
    Overflowed(i64),
}

pub struct RelocEngine<'a> {
    pub arch: Arch,
    objects: &'a [ObjectFile],
    table: &'a SymbolTable,
}

impl<'a> RelocEngine<'a> {
    pub fn new(arch: Arch, objects: &'a [ObjectFile], table: &'a SymbolTable) -> RelocEngine<'a> {
        RelocEngine {
            arch,
            objects,
            table,
        }
    }

    /// Pass 1: apply everything, collecting overflow candidates.
    pub fn pass1(
        &self,
        layout: &mut Layout,
        batch: &RelocBatch,
        stats: &mut ApplyStats,
    ) -> Result<Vec<Overflow>, Error> {
        let mut overflows = Vec::new();
        self.apply(layout, batch, None, &mut overflows, stats)?;
        Ok(overflows)
    }

    /// Pass 2: re-apply the whole batch against the final layout, with
    /// every overflowed site redirected through its thunk. Any site that
    /// overflows now is a hard error.
    pub fn pass2(
        &self,
        layout: &mut Layout,
        batch: &RelocBatch,
        overflows: &[Overflow],
        thunks: &GotPlt,
        stats: &mut ApplyStats,
    ) -> Result<(), Error> {
        let redirects: HashMap<(usize, u64), &Overflow> = overflows
            .iter()
            .map(|o| ((o.merged, o.offset), o))
            .collect();
        let mut late = Vec::new();
        *stats = ApplyStats::default();
        self.apply(layout, batch, Some((&redirects, thunks)), &mut late, stats)?;

        if let Some(overflow) = late.into_iter().next() {
            return Err(Error::PltUnreachable {
                name: overflow.name,
                site: overflow.site_addr,
                amount: overflow.amount,
            });
        }
        Ok(())
    }

    fn apply(
        &self,
        layout: &mut Layout,
        batch: &RelocBatch,
        redirects: Option<(&HashMap<(usize, u64), &Overflow>, &GotPlt)>,
        overflows: &mut Vec<Overflow>,
        stats: &mut ApplyStats,
    ) -> Result<(), Error> {
        for site in &batch.sites {
            let object = &self.objects[site.object];
            let rela = &site.rela;
            let site_addr = layout.sections[site.merged].vma + site.offset;

            if let Some((map, thunks)) = redirects {
                if map.contains_key(&(site.merged, site.offset)) {
                    self.redirect(layout, site, site_addr, thunks)?;
                    stats.redirected += 1;
                    continue;
                }
            }

            // resolve S: global table first, then section-relative
            let symbol = &object.symbols[rela.sym as usize];
            let resolved = if symbol.name.is_empty() {
                None
            } else {
                self.table.get(&symbol.name).filter(|r| r.is_defined())
            };
            let (value, size) = match resolved {
                Some(resolved) => (resolved.value, resolved.size),
                None if symbol.is_absolute() => (symbol.value, symbol.size),
                None if !symbol.is_undefined() && symbol.shndx < SHN_LORESERVE => {
                    match layout.placement(site.object, symbol.shndx as usize) {
                        Some(place) => (
                            layout.sections[place.merged].vma + place.offset + symbol.value,
                            symbol.size,
                        ),
                        None => {
                            warn!(
                                "{}: relocation against `{}' in a discarded section, skipped",
                                object.path, symbol.name
                            );
                            stats.skipped += 1;
                            continue;
                        }
                    }
                }
                None => {
                    warn!(
                        "{}: relocation against unresolved symbol `{}', skipped",
                        object.path,
                        if symbol.name.is_empty() {
                            "<unnamed>"
                        } else {
                            &symbol.name
                        }
                    );
                    stats.skipped += 1;
                    continue;
                }
            };

            let outcome = match self.arch {
                Arch::X86_64 => {
                    self.apply_x86_64(layout, site, value, size, site_addr, &object.path)?
                }
                Arch::Aarch64 => {
                    self.apply_aarch64(layout, site, value, site_addr, &object.path)?
                }
            };

            match outcome {
                Outcome::Applied => stats.applied += 1,
                Outcome::Skipped => stats.skipped += 1,
                Outcome::Overflowed(amount) => {
                    debug!(
                        "{}: {} against `{}' overflows by {:#x}, queueing for PLT",
                        object.path,
                        self.arch.reloc_name(rela.rtype),
                        symbol.name,
                        amount
                    );
                    overflows.push(Overflow {
                        name: symbol.name.clone(),
                        value,
                        merged: site.merged,
                        offset: site.offset,
                        rtype: rela.rtype,
                        addend: rela.addend,
                        site_addr,
                        amount,
                    });
                }
            }
        }
        Ok(())
    }

    /// Rewrite one overflowed site to go through its thunk: PC32-class
    /// sites through the PLT stub (GOTPCREL loads through the GOT slot,
    /// which holds the symbol's address), branch sites by re-aiming the
    /// branch at the stub.
    fn redirect(
        &self,
        layout: &mut Layout,
        site: &Site,
        site_addr: u64,
        thunks: &GotPlt,
    ) -> Result<(), Error> {
        let symbol = &self.objects[site.object].symbols[site.rela.sym as usize];
        let rtype = site.rela.rtype;

        let target = match rtype {
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
                thunks.got_slot_addr(&symbol.name)
            }
            _ => thunks.plt_stub_addr(&symbol.name),
        }
        .ok_or_else(|| Error::MissingStub {
            name: symbol.name.clone(),
        })?;

        match rtype {
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                let displacement = target as i64 - site_addr as i64;
                if !fits_signed(displacement, 28) {
                    return Err(Error::PltUnreachable {
                        name: symbol.name.clone(),
                        site: site_addr,
                        amount: displacement,
                    });
                }
                patch_insn32(layout, site, 0x03ff_ffff, ((displacement >> 2) as u32) & 0x03ff_ffff)
            }
            _ => {
                let displacement = target as i64 - (site_addr as i64 + 4);
                if !fits_signed(displacement, 32) {
                    return Err(Error::PltUnreachable {
                        name: symbol.name.clone(),
                        site: site_addr,
                        amount: displacement,
                    });
                }
                write_bytes(layout, site, &(displacement as i32).to_le_bytes())
            }
        }
    }

    fn apply_x86_64(
        &self,
        layout: &mut Layout,
        site: &Site,
        value: u64,
        size: u64,
        site_addr: u64,
        object: &str,
    ) -> Result<Outcome, Error> {
        let rela = &site.rela;
        let s = value as i64;
        let a = rela.addend;
        let p = site_addr as i64;

        let outcome = match rela.rtype {
            R_X86_64_NONE => Outcome::Applied,

            R_X86_64_64 => {
                write_bytes(layout, site, &s.wrapping_add(a).to_le_bytes())?;
                Outcome::Applied
            }

            // static link: GOT-relative loads collapse to plain
            // PC-relative addressing of the symbol itself
            R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX
            | R_X86_64_REX_GOTPCRELX => {
                let displacement = s.wrapping_add(a).wrapping_sub(p);
                if fits_signed(displacement, 32) {
                    write_bytes(layout, site, &(displacement as i32).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    Outcome::Overflowed(displacement)
                }
            }

            R_X86_64_32 => {
                let full = s.wrapping_add(a);
                if fits_unsigned(full, 32) || fits_signed(full, 32) {
                    write_bytes(layout, site, &(full as u32).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_X86_64_32 value {:#x} does not fit, skipped", object, full);
                    Outcome::Skipped
                }
            }

            R_X86_64_32S => {
                let full = s.wrapping_add(a);
                if fits_signed(full, 32) {
                    write_bytes(layout, site, &(full as i32).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_X86_64_32S value {:#x} does not fit, skipped", object, full);
                    Outcome::Skipped
                }
            }

            R_X86_64_16 => {
                let full = s.wrapping_add(a);
                if fits_unsigned(full, 16) || fits_signed(full, 16) {
                    write_bytes(layout, site, &(full as u16).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_X86_64_16 value {:#x} does not fit, skipped", object, full);
                    Outcome::Skipped
                }
            }

            R_X86_64_PC16 => {
                let displacement = s.wrapping_add(a).wrapping_sub(p);
                if fits_signed(displacement, 16) {
                    write_bytes(layout, site, &(displacement as i16).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_X86_64_PC16 out of range, skipped", object);
                    Outcome::Skipped
                }
            }

            R_X86_64_8 => {
                let full = s.wrapping_add(a);
                if fits_unsigned(full, 8) || fits_signed(full, 8) {
                    write_bytes(layout, site, &[full as u8])?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_X86_64_8 value {:#x} does not fit, skipped", object, full);
                    Outcome::Skipped
                }
            }

            R_X86_64_PC8 => {
                let displacement = s.wrapping_add(a).wrapping_sub(p);
                if fits_signed(displacement, 8) {
                    write_bytes(layout, site, &[displacement as u8])?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_X86_64_PC8 out of range, skipped", object);
                    Outcome::Skipped
                }
            }

            R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
                write_bytes(layout, site, &value.to_le_bytes())?;
                Outcome::Applied
            }

            R_X86_64_RELATIVE => {
                write_bytes(layout, site, &(BASE_VADDR as i64).wrapping_add(a).to_le_bytes())?;
                Outcome::Applied
            }

            R_X86_64_PC64 => {
                write_bytes(layout, site, &s.wrapping_add(a).wrapping_sub(p).to_le_bytes())?;
                Outcome::Applied
            }

            // SIZE relocations use the symbol's size, not its address
            R_X86_64_SIZE32 => {
                let full = (size as i64).wrapping_add(a);
                if fits_unsigned(full, 32) {
                    write_bytes(layout, site, &(full as u32).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_X86_64_SIZE32 value {:#x} does not fit, skipped", object, full);
                    Outcome::Skipped
                }
            }

            R_X86_64_SIZE64 => {
                write_bytes(layout, site, &(size as i64).wrapping_add(a).to_le_bytes())?;
                Outcome::Applied
            }

            rtype if is_x86_64_tls_reloc(rtype) => {
                warn!(
                    "{}: TLS relocation {} is not supported in a static link, skipped",
                    object,
                    x86_64_reloc_name(rtype)
                );
                Outcome::Skipped
            }

            rtype => {
                return Err(Error::UnsupportedReloc {
                    object: object.to_owned(),
                    rtype,
                    arch: self.arch,
                })
            }
        };
        Ok(outcome)
    }

    fn apply_aarch64(
        &self,
        layout: &mut Layout,
        site: &Site,
        value: u64,
        site_addr: u64,
        object: &str,
    ) -> Result<Outcome, Error> {
        let rela = &site.rela;
        let s = value as i64;
        let a = rela.addend;
        let p = site_addr as i64;
        let full = s.wrapping_add(a);

        let outcome = match rela.rtype {
            R_AARCH64_ABS64 => {
                write_bytes(layout, site, &full.to_le_bytes())?;
                Outcome::Applied
            }

            R_AARCH64_ABS32 => {
                if fits_unsigned(full, 32) || fits_signed(full, 32) {
                    write_bytes(layout, site, &(full as u32).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_AARCH64_ABS32 value {:#x} does not fit, skipped", object, full);
                    Outcome::Skipped
                }
            }

            R_AARCH64_ABS16 => {
                if fits_unsigned(full, 16) || fits_signed(full, 16) {
                    write_bytes(layout, site, &(full as u16).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_AARCH64_ABS16 value {:#x} does not fit, skipped", object, full);
                    Outcome::Skipped
                }
            }

            R_AARCH64_PREL64 => {
                write_bytes(layout, site, &full.wrapping_sub(p).to_le_bytes())?;
                Outcome::Applied
            }

            R_AARCH64_PREL32 => {
                let displacement = full.wrapping_sub(p);
                if fits_signed(displacement, 32) {
                    write_bytes(layout, site, &(displacement as i32).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_AARCH64_PREL32 out of range, skipped", object);
                    Outcome::Skipped
                }
            }

            R_AARCH64_PREL16 => {
                let displacement = full.wrapping_sub(p);
                if fits_signed(displacement, 16) {
                    write_bytes(layout, site, &(displacement as i16).to_le_bytes())?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_AARCH64_PREL16 out of range, skipped", object);
                    Outcome::Skipped
                }
            }

            // branches: bits[25:0] hold the word displacement
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                let displacement = full.wrapping_sub(p);
                if fits_signed(displacement, 28) {
                    patch_insn32(
                        layout,
                        site,
                        0x03ff_ffff,
                        ((displacement >> 2) as u32) & 0x03ff_ffff,
                    )?;
                    Outcome::Applied
                } else {
                    Outcome::Overflowed(displacement)
                }
            }

            R_AARCH64_CONDBR19 => {
                let displacement = full.wrapping_sub(p);
                if fits_signed(displacement, 21) {
                    patch_insn32(
                        layout,
                        site,
                        0x00ff_ffe0,
                        (((displacement >> 2) as u32) & 0x7ffff) << 5,
                    )?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_AARCH64_CONDBR19 out of range, skipped", object);
                    Outcome::Skipped
                }
            }

            R_AARCH64_ADR_PREL_LO21 => {
                let displacement = full.wrapping_sub(p);
                if fits_signed(displacement, 21) {
                    patch_insn32(layout, site, ADR_IMM_MASK, adr_imm(displacement))?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_AARCH64_ADR_PREL_LO21 out of range, skipped", object);
                    Outcome::Skipped
                }
            }

            // ADRP: page delta into the split 21-bit field
            R_AARCH64_ADR_PREL_PG_HI21 => {
                let delta = page(full as u64) as i64 - page(p as u64) as i64;
                let pages = delta >> 12;
                if fits_signed(pages, 21) {
                    patch_insn32(layout, site, ADR_IMM_MASK, adr_imm(pages))?;
                    Outcome::Applied
                } else {
                    warn!("{}: R_AARCH64_ADR_PREL_PG_HI21 out of range, skipped", object);
                    Outcome::Skipped
                }
            }

            R_AARCH64_ADD_ABS_LO12_NC => {
                patch_insn32(layout, site, IMM12_MASK, imm12(full as u64, 0))?;
                Outcome::Applied
            }
            R_AARCH64_LDST8_ABS_LO12_NC => {
                patch_insn32(layout, site, IMM12_MASK, imm12(full as u64, 0))?;
                Outcome::Applied
            }
            R_AARCH64_LDST16_ABS_LO12_NC => {
                patch_insn32(layout, site, IMM12_MASK, imm12(full as u64, 1))?;
                Outcome::Applied
            }
            R_AARCH64_LDST32_ABS_LO12_NC => {
                patch_insn32(layout, site, IMM12_MASK, imm12(full as u64, 2))?;
                Outcome::Applied
            }
            R_AARCH64_LDST64_ABS_LO12_NC => {
                patch_insn32(layout, site, IMM12_MASK, imm12(full as u64, 3))?;
                Outcome::Applied
            }
            R_AARCH64_LDST128_ABS_LO12_NC => {
                patch_insn32(layout, site, IMM12_MASK, imm12(full as u64, 4))?;
                Outcome::Applied
            }

            rtype if is_aarch64_tls_reloc(rtype) => {
                warn!(
                    "{}: TLS relocation {} is not supported in a static link, skipped",
                    object, rtype
                );
                Outcome::Skipped
            }

            rtype => {
                return Err(Error::UnsupportedReloc {
                    object: object.to_owned(),
                    rtype,
                    arch: self.arch,
                })
            }
        };
        Ok(outcome)
    }
}

pub fn fits_signed(value: i64, bits: u32) -> bool {
    let half = 1i64 << (bits - 1);
    value >= -half && value < half
}

pub fn fits_unsigned(value: i64, bits: u32) -> bool {
    value >= 0 && (value as u128) < (1u128 << bits)
}

pub fn page(address: u64) -> u64 {
    address & !0xfff
}

// ADR/ADRP split immediate: immlo at bits [30:29], immhi at bits [23:5]
const ADR_IMM_MASK: u32 = (3 << 29) | (0x7ffff << 5);

fn adr_imm(value: i64) -> u32 {
    let value = value as u32;
    ((value & 3) << 29) | (((value >> 2) & 0x7ffff) << 5)
}

// load/store unsigned-offset immediate at bits [21:10]
const IMM12_MASK: u32 = 0xfff << 10;

fn imm12(value: u64, shift: u32) -> u32 {
    ((((value & 0xfff) >> shift) as u32) & 0xfff) << 10
}

fn write_bytes(layout: &mut Layout, site: &Site, bytes: &[u8]) -> Result<(), Error> {
    let section = &mut layout.sections[site.merged];
    let end = site.offset + bytes.len() as u64;
    if end > section.data.len() as u64 {
        return Err(Error::OutOfBounds {
            section: section.name.clone(),
            offset: site.offset,
            width: bytes.len() as u64,
            size: section.data.len() as u64,
        });
    }
    section.data[site.offset as usize..end as usize].copy_from_slice(bytes);
    Ok(())
}

fn patch_insn32(
    layout: &mut Layout,
    site: &Site,
    mask: u32,
    bits: u32,
) -> Result<(), Error> {
    let section = &mut layout.sections[site.merged];
    let end = site.offset + 4;
    if end > section.data.len() as u64 {
        return Err(Error::OutOfBounds {
            section: section.name.clone(),
            offset: site.offset,
            width: 4,
            size: section.data.len() as u64,
        });
    }
    let range = site.offset as usize..end as usize;
    let mut insn = u32::from_le_bytes([
        section.data[range.start],
        section.data[range.start + 1],
        section.data[range.start + 2],
        section.data[range.start + 3],
    ]);
    insn = (insn & !mask) | (bits & mask);
    section.data[range].copy_from_slice(&insn.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectFile;
    use crate::resolve::SymbolTable;
    use crate::testutil::ObjBuilder;
    use byteorder::{ByteOrder, LittleEndian};

    fn link_fixture(b: ObjBuilder) -> (Vec<ObjectFile>, Layout, SymbolTable) {
        let objects = vec![ObjectFile::parse(&b.build(), "t.o").unwrap()];
        let mut layout = Layout::merge(&objects);
        let mut table = SymbolTable::build(&objects);
        table.allocate_commons(&mut layout);
        layout.assign_addresses();
        table.finalise(&layout);
        (objects, layout, table)
    }

    fn apply_all(
        objects: &[ObjectFile],
        layout: &mut Layout,
        table: &SymbolTable,
        arch: Arch,
    ) -> (Vec<Overflow>, ApplyStats) {
        let batch = RelocBatch::build(objects, layout);
        let engine = RelocEngine::new(arch, objects, table);
        let mut stats = ApplyStats::default();
        let overflows = engine.pass1(layout, &batch, &mut stats).unwrap();
        (overflows, stats)
    }

    #[test]
    fn pc32_matches_hand_computation() {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0x90; 32],
            16,
        );
        b.symbol("callee", STB_GLOBAL, STT_FUNC, Some(text), 24, 8);
        b.rela(text, 4, R_X86_64_PC32, "callee", -4);
        let (objects, mut layout, table) = link_fixture(b);
        let (overflows, stats) = apply_all(&objects, &mut layout, &table, Arch::X86_64);

        assert!(overflows.is_empty());
        assert_eq!(stats.applied, 1);
        let text = layout.section_by_name(".text").unwrap();
        // S + A - P = (vma+24) + (-4) - (vma+4) = 16
        let written = LittleEndian::read_i32(&text.data[4..8]);
        assert_eq!(written, 16);
    }

    #[test]
    fn abs64_and_abs32_write_symbol_plus_addend() {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0; 16],
            8,
        );
        let data = b.section(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, vec![0; 16], 8);
        b.symbol("obj", STB_GLOBAL, STT_OBJECT, Some(data), 8, 4);
        b.rela(text, 0, R_X86_64_64, "obj", 2);
        b.rela(text, 8, R_X86_64_32, "obj", 0);
        let (objects, mut layout, table) = link_fixture(b);
        let (_, stats) = apply_all(&objects, &mut layout, &table, Arch::X86_64);
        assert_eq!(stats.applied, 2);

        let expected = table.get("obj").unwrap().value;
        let text = layout.section_by_name(".text").unwrap();
        assert_eq!(LittleEndian::read_u64(&text.data[0..8]), expected + 2);
        assert_eq!(LittleEndian::read_u32(&text.data[8..12]) as u64, expected);
    }

    #[test]
    fn size_relocs_use_the_symbol_size() {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0; 16],
            8,
        );
        let data = b.section(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, vec![0; 64], 8);
        b.symbol("big", STB_GLOBAL, STT_OBJECT, Some(data), 0, 48);
        b.rela(text, 0, R_X86_64_SIZE32, "big", 0);
        b.rela(text, 8, R_X86_64_SIZE64, "big", 16);
        let (objects, mut layout, table) = link_fixture(b);
        let (_, stats) = apply_all(&objects, &mut layout, &table, Arch::X86_64);
        assert_eq!(stats.applied, 2);

        let text = layout.section_by_name(".text").unwrap();
        assert_eq!(LittleEndian::read_u32(&text.data[0..4]), 48);
        assert_eq!(LittleEndian::read_u64(&text.data[8..16]), 64);
    }

    #[test]
    fn section_relative_symbols_resolve_through_placements() {
        // a local-style relocation against a section symbol
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0; 8],
            8,
        );
        let rodata = b.section(".rodata", SHT_PROGBITS, SHF_ALLOC, vec![0x55; 16], 8);
        b.symbol_raw("", STB_LOCAL, STT_SECTION, (rodata + 1) as u16, 0, 0);
        b.rela(text, 0, R_X86_64_64, "", 6);
        let (objects, mut layout, table) = link_fixture(b);
        let (_, stats) = apply_all(&objects, &mut layout, &table, Arch::X86_64);
        assert_eq!(stats.applied, 1);

        let rodata_vma = layout.section_by_name(".rodata").unwrap().vma;
        let text = layout.section_by_name(".text").unwrap();
        assert_eq!(LittleEndian::read_u64(&text.data[0..8]), rodata_vma + 6);
    }

    #[test]
    fn unresolved_symbol_site_is_skipped_with_no_write() {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0xee; 8],
            8,
        );
        b.symbol("missing", STB_GLOBAL, STT_NOTYPE, None, 0, 0);
        b.rela(text, 0, R_X86_64_PC32, "missing", -4);
        let (objects, mut layout, table) = link_fixture(b);
        let (overflows, stats) = apply_all(&objects, &mut layout, &table, Arch::X86_64);

        assert!(overflows.is_empty());
        assert_eq!(stats.skipped, 1);
        let text = layout.section_by_name(".text").unwrap();
        assert_eq!(&text.data[0..4], &[0xee; 4]);
    }

    #[test]
    fn tls_relocations_warn_and_skip() {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0; 8],
            8,
        );
        b.symbol("tls_var", STB_GLOBAL, STT_OBJECT, Some(text), 0, 8);
        b.rela(text, 0, R_X86_64_TPOFF32, "tls_var", 0);
        let (objects, mut layout, table) = link_fixture(b);
        let (_, stats) = apply_all(&objects, &mut layout, &table, Arch::X86_64);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn unknown_relocation_type_is_a_hard_error() {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0; 8],
            8,
        );
        b.symbol("f", STB_GLOBAL, STT_FUNC, Some(text), 0, 0);
        b.rela(text, 0, 0xdead, "f", 0);
        let (objects, mut layout, table) = link_fixture(b);
        let batch = RelocBatch::build(&objects, &layout);
        let engine = RelocEngine::new(Arch::X86_64, &objects, &table);
        let mut stats = ApplyStats::default();
        let err = engine.pass1(&mut layout, &batch, &mut stats).unwrap_err();
        assert!(matches!(err, Error::UnsupportedReloc { rtype: 0xdead, .. }));
    }

    #[test]
    fn out_of_bounds_write_is_a_hard_error_with_no_partial_write() {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0xaa; 8],
            8,
        );
        b.symbol("f", STB_GLOBAL, STT_FUNC, Some(text), 0, 0);
        // 8-byte write at offset 6 of an 8-byte section
        b.rela(text, 6, R_X86_64_64, "f", 0);
        let (objects, mut layout, table) = link_fixture(b);
        let batch = RelocBatch::build(&objects, &layout);
        let engine = RelocEngine::new(Arch::X86_64, &objects, &table);
        let mut stats = ApplyStats::default();
        let err = engine.pass1(&mut layout, &batch, &mut stats).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
        let text = layout.section_by_name(".text").unwrap();
        assert_eq!(&text.data[..], &[0xaa; 8]);
    }

    #[test]
    fn batch_is_sorted_by_target_section() {
        let mut b = ObjBuilder::new();
        let data = b.section(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, vec![0; 16], 8);
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0; 16],
            8,
        );
        b.symbol("f", STB_GLOBAL, STT_FUNC, Some(text), 0, 0);
        b.rela(data, 0, R_X86_64_64, "f", 0);
        b.rela(text, 0, R_X86_64_PC32, "f", -4);
        b.rela(data, 8, R_X86_64_64, "f", 0);
        let objects = vec![ObjectFile::parse(&b.build(), "t.o").unwrap()];
        let mut layout = Layout::merge(&objects);
        layout.assign_addresses();
        let batch = RelocBatch::build(&objects, &layout);

        let names: Vec<&str> = batch
            .sites
            .iter()
            .map(|s| layout.sections[s.merged].name.as_str())
            .collect();
        assert_eq!(names, vec![".data", ".data", ".text"]);
    }

    #[test]
    fn aarch64_branch_and_page_pair() {
        // adrp x0, sym / add x0, x0, #lo12 / bl sym
        let mut b = ObjBuilder::new_aarch64();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![
                0x00, 0x00, 0x00, 0x90, // adrp x0, .
                0x00, 0x00, 0x00, 0x91, // add x0, x0, #0
                0x00, 0x00, 0x00, 0x94, // bl .
                0xc0, 0x03, 0x5f, 0xd6, // ret
            ],
            4,
        );
        let data = b.section(
            ".data",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_WRITE,
            vec![0; 0x100],
            8,
        );
        b.symbol("sym", STB_GLOBAL, STT_OBJECT, Some(data), 0x45, 8);
        b.symbol("callee", STB_GLOBAL, STT_FUNC, Some(text), 12, 4);
        b.rela(text, 0, R_AARCH64_ADR_PREL_PG_HI21, "sym", 0);
        b.rela(text, 4, R_AARCH64_ADD_ABS_LO12_NC, "sym", 0);
        b.rela(text, 8, R_AARCH64_CALL26, "callee", 0);
        let (objects, mut layout, table) = link_fixture(b);
        let (overflows, stats) = apply_all(&objects, &mut layout, &table, Arch::Aarch64);
        assert!(overflows.is_empty());
        assert_eq!(stats.applied, 3);

        let sym = table.get("sym").unwrap().value;
        let text = layout.section_by_name(".text").unwrap();

        // decode the adrp pair and recompute the address it produces
        let adrp = LittleEndian::read_u32(&text.data[0..4]);
        let immlo = (adrp >> 29) & 3;
        let immhi = (adrp >> 5) & 0x7ffff;
        let imm21 = ((immhi << 2) | immlo) as i64;
        let imm21 = (imm21 << 43) >> 43; // sign-extend 21 bits
        let reached_page = (page(text.vma) as i64 + (imm21 << 12)) as u64;
        assert_eq!(reached_page, page(sym));

        let add = LittleEndian::read_u32(&text.data[4..8]);
        let lo12 = ((add >> 10) & 0xfff) as u64;
        assert_eq!(lo12, sym & 0xfff);
        assert_eq!(reached_page + lo12, sym);

        // bl displacement: callee at text.vma+12, site at text.vma+8
        let bl = LittleEndian::read_u32(&text.data[8..12]);
        let imm26 = (bl & 0x03ff_ffff) as i64;
        let imm26 = (imm26 << 38) >> 38;
        assert_eq!(imm26 * 4, 4);
        // opcode bits untouched
        assert_eq!(bl >> 26, 0x25);
    }

    #[test]
    fn aarch64_ldst_scaling() {
        let mut b = ObjBuilder::new_aarch64();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![
                0x10, 0x02, 0x40, 0xf9, // ldr x16, [x16, #0]
            ],
            4,
        );
        let data = b.section(
            ".data",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_WRITE,
            vec![0; 0x1000],
            8,
        );
        b.symbol("v", STB_GLOBAL, STT_OBJECT, Some(data), 0x458, 8);
        b.rela(text, 0, R_AARCH64_LDST64_ABS_LO12_NC, "v", 0);
        let (objects, mut layout, table) = link_fixture(b);
        let (_, stats) = apply_all(&objects, &mut layout, &table, Arch::Aarch64);
        assert_eq!(stats.applied, 1);

        let v = table.get("v").unwrap().value;
        let text = layout.section_by_name(".text").unwrap();
        let insn = LittleEndian::read_u32(&text.data[0..4]);
        let imm = (insn >> 10) & 0xfff;
        // 64-bit loads scale the low-12 offset by 8
        assert_eq!(imm as u64, (v & 0xfff) >> 3);
    }
}
