//! Groups like-named input sections into merged output sections and
//! assigns virtual addresses in a fixed ordering.

use crate::elf::*;
use crate::object::{ObjectFile, Section};
use log::debug;
use std::collections::HashMap;

/// Load address of the first byte of the image.
pub const BASE_VADDR: u64 = 0x400000;
pub const PAGE_SIZE: u64 = 4096;

pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// Canonical output-section family for an input-section name:
/// `.text.startup` contributes to `.text`, `.rodata.str1.1` to `.rodata`,
/// and so on. Anything else keeps its own name.
pub fn family_name(name: &str) -> &str {
    for family in &[".text", ".rodata", ".data", ".bss"] {
        if name == *family {
            return family;
        }
        if name.len() > family.len()
            && name.starts_with(family)
            && name.as_bytes()[family.len()] == b'.'
        {
            return family;
        }
    }
    name
}

/// Whether a section contributes to the output image at all.
fn keep_section(section: &Section) -> bool {
    match section.sh_type {
        SHT_NULL | SHT_SYMTAB | SHT_STRTAB | SHT_RELA | SHT_REL => return false,
        _ => {}
    }
    if section.flags & SHF_ALLOC == 0 {
        return false;
    }
    // debug info is dropped even when a compiler marked it ALLOC
    if section.name.starts_with(".debug") {
        return false;
    }
    true
}

/// One output section: the concatenation of every contributor of its
/// family, plus the address it was assigned.
#[derive(Debug)]
pub struct MergedSection {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub data: Vec<u8>,
    pub size: u64,
    pub vma: u64,
    pub align: u64,
}

impl MergedSection {
    pub fn is_nobits(&self) -> bool {
        self.sh_type == SHT_NOBITS
    }

    pub fn end(&self) -> u64 {
        self.vma + self.size
    }
}

/// Where a contributing section landed: merged-section index plus byte
/// offset of its first byte inside the merged buffer.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub merged: usize,
    pub offset: u64,
}

#[derive(Debug, Default)]
pub struct Layout {
    pub sections: Vec<MergedSection>,
    by_name: HashMap<String, usize>,
    placements: HashMap<(usize, usize), Placement>,
}

impl Layout {
    /// Phase 2: concatenate every kept section of every object, in input
    /// order, recording a placement per contribution.
    pub fn merge(objects: &[ObjectFile]) -> Layout {
        let mut layout = Layout::default();

        for (object_index, object) in objects.iter().enumerate() {
            for section in &object.sections {
                if !keep_section(section) || section.size == 0 {
                    continue;
                }
                let family = family_name(&section.name).to_owned();
                let merged = layout.get_or_create(&family, section.sh_type);
                let slot = &mut layout.sections[merged];

                let align = slot.align.max(section.align);
                let offset = align_up(slot.size, align);
                slot.align = align;
                slot.flags |= section.flags & (SHF_WRITE | SHF_ALLOC | SHF_EXECINSTR);

                if section.sh_type == SHT_NOBITS {
                    slot.size = offset + section.size;
                } else {
                    // a PROGBITS contributor makes the whole family PROGBITS
                    slot.sh_type = SHT_PROGBITS;
                    slot.data.resize(offset as usize, 0);
                    slot.data.extend_from_slice(&section.data);
                    slot.size = slot.data.len() as u64;
                }

                debug!(
                    "merge {}({}) -> {} at {:#x} ({} bytes)",
                    object.path, section.name, family, offset, section.size
                );
                layout
                    .placements
                    .insert((object_index, section.index), Placement { merged, offset });
            }
        }

        layout
    }

    fn get_or_create(&mut self, name: &str, sh_type: u32) -> usize {
        if let Some(index) = self.by_name.get(name) {
            return *index;
        }
        let index = self.sections.len();
        self.sections.push(MergedSection {
            name: name.to_owned(),
            sh_type: if sh_type == SHT_NOBITS {
                SHT_NOBITS
            } else {
                SHT_PROGBITS
            },
            flags: 0,
            data: Vec::new(),
            size: 0,
            vma: 0,
            align: 1,
        });
        self.by_name.insert(name.to_owned(), index);
        index
    }

    pub fn section_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn section_by_name(&self, name: &str) -> Option<&MergedSection> {
        self.section_index(name).map(|i| &self.sections[i])
    }

    pub fn placement(&self, object: usize, section: usize) -> Option<Placement> {
        self.placements.get(&(object, section)).copied()
    }

    /// Reserve zero-initialised room in `.bss` (created on demand) for a
    /// resolved COMMON symbol. Returns the spot it was given.
    pub fn reserve_common(&mut self, size: u64, align: u64) -> (usize, u64) {
        let index = self.get_or_create(".bss", SHT_NOBITS);
        let slot = &mut self.sections[index];
        slot.flags |= SHF_ALLOC | SHF_WRITE;
        let align = align.max(1);
        let offset = align_up(slot.size, align);
        slot.size = offset + size;
        slot.align = slot.align.max(align);
        (index, offset)
    }

    /// Create the synthesised `.got` and `.plt` sections. They slot in
    /// right after `.text` in the canonical order; the caller re-runs
    /// address assignment afterwards.
    pub fn insert_got_plt(&mut self, got_size: u64, plt_size: u64) -> (usize, usize) {
        let got = self.get_or_create(".got", SHT_PROGBITS);
        {
            let slot = &mut self.sections[got];
            slot.flags = SHF_ALLOC | SHF_WRITE;
            // slots are 8-byte entries; the table itself starts at the
            // first 16-byte boundary past the end of .text
            slot.align = 16;
            slot.size = got_size;
            slot.data = vec![0; got_size as usize];
        }
        let plt = self.get_or_create(".plt", SHT_PROGBITS);
        {
            let slot = &mut self.sections[plt];
            slot.flags = SHF_ALLOC | SHF_EXECINSTR;
            slot.align = 16;
            slot.size = plt_size;
            slot.data = vec![0; plt_size as usize];
        }
        (got, plt)
    }

    pub fn set_section_data(&mut self, index: usize, data: Vec<u8>) {
        let slot = &mut self.sections[index];
        slot.size = data.len() as u64;
        slot.data = data;
    }

    /// Canonical ordering: the fixed families first, then everything else
    /// in creation order.
    pub fn canonical_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.sections.len());
        for family in &[".text", ".got", ".plt", ".rodata", ".data", ".bss"] {
            if let Some(index) = self.section_index(family) {
                order.push(index);
            }
        }
        for index in 0..self.sections.len() {
            if !order.contains(&index) {
                order.push(index);
            }
        }
        order
    }

    /// Phase 2.5: assign virtual addresses starting at the base address.
    /// `.text` and `.data` start fresh pages; `.rodata` is kept close to
    /// `.text` to limit PC-relative spans; the rest honour their own
    /// alignment.
    pub fn assign_addresses(&mut self) {
        let mut address = BASE_VADDR;
        for index in self.canonical_order() {
            let slot = &mut self.sections[index];
            let policy = match slot.name.as_str() {
                ".text" => PAGE_SIZE,
                ".rodata" => 16,
                ".data" => PAGE_SIZE,
                _ => 1,
            };
            let align = policy.max(slot.align);
            address = align_up(address, align);
            slot.vma = address;
            address += slot.size;
            debug!(
                "assign {} at {:#x}..{:#x} align {}",
                slot.name,
                slot.vma,
                slot.end(),
                align
            );
        }
    }

    /// Section indices in ascending VMA order, for the writer.
    pub fn output_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.sections.len()).collect();
        order.sort_by_key(|i| self.sections[*i].vma);
        order
    }
}
