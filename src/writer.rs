//! Emits the final `ET_EXEC` image: ELF header, one RX and one RW
//! `PT_LOAD`, and the merged section payloads at file offsets congruent
//! to their virtual addresses. No section headers are written; program
//! loaders do not need them.

use crate::elf::*;
use crate::merge::{Layout, PAGE_SIZE};
use crate::object::Arch;
use log::{info, warn};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("nothing to write: the image has no loadable sections")]
    EmptyImage,

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// sections of the read-execute segment; everything else is read-write
fn is_rx_section(name: &str) -> bool {
    matches!(name, ".text" | ".got" | ".plt")
}

struct SegmentSpan {
    vaddr: u64,
    memsz: u64,
    filesz: u64,
    offset: u64,
    flags: u32,
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Build the executable image in memory.
pub fn build_image(arch: Arch, entry: u64, layout: &Layout) -> Result<Vec<u8>, Error> {
    let order = layout.output_order();
    let loadable: Vec<usize> = order
        .into_iter()
        .filter(|i| layout.sections[*i].size > 0)
        .collect();
    if loadable.is_empty() {
        return Err(Error::EmptyImage);
    }

    let rx: Vec<usize> = loadable
        .iter()
        .copied()
        .filter(|i| is_rx_section(&layout.sections[*i].name))
        .collect();
    let rw: Vec<usize> = loadable
        .iter()
        .copied()
        .filter(|i| !is_rx_section(&layout.sections[*i].name))
        .collect();
    let phnum = if rw.is_empty() || rx.is_empty() { 1 } else { 2 };

    // place payloads: each section's file offset must be congruent to its
    // VMA modulo the page size
    let header_size = EHDR_SIZE + phnum as u64 * PHDR_SIZE;
    let mut cursor = header_size;
    let mut file_offsets = vec![0u64; layout.sections.len()];
    let mut payload = Vec::new();

    for index in &loadable {
        let section = &layout.sections[*index];
        let misalign = section.vma % PAGE_SIZE;
        let mut offset = cursor - cursor % PAGE_SIZE + misalign;
        if offset < cursor {
            offset += PAGE_SIZE;
        }
        file_offsets[*index] = offset;
        if !section.is_nobits() {
            payload.resize((offset - header_size) as usize, 0);
            payload.extend_from_slice(&section.data);
            cursor = offset + section.data.len() as u64;
        }
    }

    let span = |set: &[usize], flags: u32| -> Option<SegmentSpan> {
        let first = *set.first()?;
        let vaddr = layout.sections[first].vma;
        let offset = file_offsets[first];
        let memsz = layout.sections[*set.last()?].end() - vaddr;
        // file size runs to the end of the last section that has bytes
        let filesz = set
            .iter()
            .rev()
            .find(|i| !layout.sections[**i].is_nobits())
            .map(|i| file_offsets[*i] + layout.sections[*i].data.len() as u64 - offset)
            .unwrap_or(0);
        Some(SegmentSpan {
            vaddr,
            memsz,
            filesz,
            offset,
            flags,
        })
    };

    let mut segments = Vec::new();
    if let Some(seg) = span(&rx, PF_R | PF_X) {
        segments.push(seg);
    }
    if let Some(seg) = span(&rw, PF_R | PF_W) {
        segments.push(seg);
    }

    let mut out = Vec::with_capacity(header_size as usize + payload.len());

    // Ehdr
    out.extend_from_slice(&ELF_MAGIC);
    out.push(ELFCLASS64);
    out.push(ELFDATA2LSB);
    out.push(1); // EI_VERSION
    out.push(ELFOSABI_SYSV);
    out.extend_from_slice(&[0u8; 8]); // ABI version + padding
    push_u16(&mut out, ET_EXEC);
    push_u16(&mut out, arch.machine());
    push_u32(&mut out, EV_CURRENT);
    push_u64(&mut out, entry);
    push_u64(&mut out, EHDR_SIZE); // e_phoff: right after this header
    push_u64(&mut out, 0); // e_shoff: no section headers
    push_u32(&mut out, 0); // e_flags
    push_u16(&mut out, EHDR_SIZE as u16);
    push_u16(&mut out, PHDR_SIZE as u16);
    push_u16(&mut out, segments.len() as u16);
    push_u16(&mut out, 0); // e_shentsize
    push_u16(&mut out, 0); // e_shnum
    push_u16(&mut out, 0); // e_shstrndx

    // Phdrs
    for segment in &segments {
        push_u32(&mut out, PT_LOAD);
        push_u32(&mut out, segment.flags);
        push_u64(&mut out, segment.offset);
        push_u64(&mut out, segment.vaddr);
        push_u64(&mut out, segment.vaddr); // p_paddr
        push_u64(&mut out, segment.filesz);
        push_u64(&mut out, segment.memsz);
        push_u64(&mut out, PAGE_SIZE);
    }

    out.extend_from_slice(&payload);
    Ok(out)
}

/// Build and write the executable, then mark it executable. A chmod
/// failure is only a warning; a write failure is fatal.
pub fn write_executable(path: &Path, arch: Arch, entry: u64, layout: &Layout) -> Result<(), Error> {
    let image = build_image(arch, entry, layout)?;
    fs::write(path, &image).map_err(|source| Error::Io {
        path: path.display().to_string(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let result = fs::metadata(path).and_then(|meta| {
            let mut perms = meta.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(path, perms)
        });
        if let Err(err) = result {
            warn!("could not mark {} executable: {}", path.display(), err);
        }
    }

    info!("wrote {} ({} bytes)", path.display(), image.len());
    Ok(())
}
