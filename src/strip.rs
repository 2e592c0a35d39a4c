//! Symbol stripping: copy an ELF, dropping sections by policy, then
//! renumber the survivors' cross-references and rewrite the header.

use crate::elf::*;
use crate::object::{self, RawElf};
use byteorder::{ByteOrder, LittleEndian};
use log::info;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Object(#[from] object::Error),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: has no section headers to strip")]
    NoSections { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripMode {
    /// Drop every symbol and string table except `.shstrtab`.
    All,
    /// Drop `.debug*` and `.stab*` sections only.
    Debug,
}

fn should_drop(raw: &RawElf, index: usize, mode: StripMode) -> bool {
    let hdr = &raw.shdrs[index];
    match mode {
        StripMode::All => {
            (hdr.sh_type == SHT_SYMTAB || hdr.sh_type == SHT_STRTAB)
                && index != raw.e_shstrndx as usize
        }
        StripMode::Debug => {
            let name = raw.section_name(index);
            name.starts_with(".debug") || name.starts_with(".stab")
        }
    }
}

/// Strip `input` into `output` (which may be the same path). Section
/// payloads keep their file offsets; the rewritten section header table
/// lands after the last retained payload.
pub fn strip(input: &Path, output: &Path, mode: StripMode) -> Result<(), Error> {
    let display = input.display().to_string();
    let data = fs::read(input).map_err(|source| Error::Io {
        path: display.clone(),
        source,
    })?;
    let raw = RawElf::parse(&data, &display)?;
    if raw.shdrs.is_empty() {
        return Err(Error::NoSections { path: display });
    }

    // old index -> new index for survivors
    let mut remap: Vec<Option<u32>> = vec![None; raw.shdrs.len()];
    let mut kept = 0u32;
    for index in 0..raw.shdrs.len() {
        if !should_drop(&raw, index, mode) {
            remap[index] = Some(kept);
            kept += 1;
        }
    }
    let dropped = raw.shdrs.len() - kept as usize;
    info!("stripping {}: dropping {} sections", display, dropped);

    // keep everything up to the last retained payload byte
    let mut content_end = EHDR_SIZE + raw.e_phnum as u64 * PHDR_SIZE;
    for (index, hdr) in raw.shdrs.iter().enumerate() {
        if remap[index].is_some() && hdr.sh_type != SHT_NOBITS && hdr.sh_type != SHT_NULL {
            content_end = content_end.max(hdr.sh_offset + hdr.sh_size);
        }
    }
    let content_end = (content_end.min(data.len() as u64)) as usize;

    let mut out = data[..content_end].to_vec();
    // section header table goes at the next 8-byte boundary
    while out.len() % 8 != 0 {
        out.push(0);
    }
    let e_shoff = out.len() as u64;

    for (index, hdr) in raw.shdrs.iter().enumerate() {
        if remap[index].is_none() {
            continue;
        }
        let mut entry = [0u8; SHDR_SIZE as usize];
        LittleEndian::write_u32(&mut entry[0..4], hdr.sh_name);
        LittleEndian::write_u32(&mut entry[4..8], hdr.sh_type);
        LittleEndian::write_u64(&mut entry[8..16], hdr.sh_flags);
        LittleEndian::write_u64(&mut entry[16..24], hdr.sh_addr);
        LittleEndian::write_u64(&mut entry[24..32], hdr.sh_offset);
        LittleEndian::write_u64(&mut entry[32..40], hdr.sh_size);

        // links into dropped sections fall back to 0
        let link = remap
            .get(hdr.sh_link as usize)
            .and_then(|m| *m)
            .unwrap_or(0);
        LittleEndian::write_u32(&mut entry[40..44], link);

        // sh_info is a section reference only for relocation sections
        let sh_info = if hdr.sh_type == SHT_RELA || hdr.sh_type == SHT_REL {
            remap
                .get(hdr.sh_info as usize)
                .and_then(|m| *m)
                .unwrap_or(0)
        } else {
            hdr.sh_info
        };
        LittleEndian::write_u32(&mut entry[44..48], sh_info);

        LittleEndian::write_u64(&mut entry[48..56], hdr.sh_addralign);
        LittleEndian::write_u64(&mut entry[56..64], hdr.sh_entsize);
        out.extend_from_slice(&entry);
    }

    // rewrite the header fields that moved
    LittleEndian::write_u64(&mut out[40..48], e_shoff);
    LittleEndian::write_u16(&mut out[60..62], kept as u16);
    let new_shstrndx = remap
        .get(raw.e_shstrndx as usize)
        .and_then(|m| *m)
        .unwrap_or(0);
    LittleEndian::write_u16(&mut out[62..64], new_shstrndx as u16);

    fs::write(output, out).map_err(|source| Error::Io {
        path: output.display().to_string(),
        source,
    })
}
