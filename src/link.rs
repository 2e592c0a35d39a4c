//! The pipeline driver: orchestrates loading, archive extraction, symbol
//! resolution, section merging, the two relocation passes and the final
//! write, collecting statistics along the way.

use crate::archive::{ArchiveContext, AR_MAGIC};
use crate::merge::Layout;
use crate::object::ObjectFile;
use crate::reloc::{ApplyStats, RelocBatch, RelocEngine};
use crate::resolve::{self, SymbolTable};
use crate::thunk::GotPlt;
use crate::writer;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

/// Default system library directories searched after `-L` paths.
const DEFAULT_LIB_DIRS: &[&str] = &["/lib", "/usr/lib", "/usr/local/lib"];

/// Runtime objects that stay live under `--gc-sections` no matter what.
const ALWAYS_LIVE_OBJECTS: &[&str] = &["crt.o", "ape.o", "hostos.o", "envp.o", "oldstack.o"];

/// libc backend selector. Only the Cosmopolitan backend exists; the
/// others are recognised and rejected while arguments are parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Libc {
    Cosmo,
}

impl FromStr for Libc {
    type Err = String;

    fn from_str(value: &str) -> Result<Libc, String> {
        match value {
            "cosmo" => Ok(Libc::Cosmo),
            "system" | "mini" => Err(format!("libc backend `{}' is not implemented", value)),
            other => Err(format!("unknown libc backend `{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub search_dirs: Vec<PathBuf>,
    pub libraries: Vec<String>,
    pub libc: Libc,
    pub gc_sections: bool,
    pub dump_symbols: bool,
    pub dump_relocations: bool,
    pub trace_resolve: bool,
}

impl LinkOptions {
    pub fn new(inputs: Vec<PathBuf>, output: PathBuf) -> LinkOptions {
        LinkOptions {
            inputs,
            output,
            search_dirs: Vec::new(),
            libraries: Vec::new(),
            libc: Libc::Cosmo,
            gc_sections: false,
            dump_symbols: false,
            dump_relocations: false,
            trace_resolve: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct LinkStats {
    pub objects: usize,
    pub extracted_members: usize,
    pub synthetics_injected: usize,
    pub defined: usize,
    pub weak: usize,
    pub undefined: usize,
    pub relocs_applied: u64,
    pub relocs_skipped: u64,
    pub relocs_plt: u64,
    pub merged_sections: usize,
    pub code_bytes: u64,
    pub data_bytes: u64,
    pub wall_millis: u128,
}

/// Search `-L` directories and the default locations for `libNAME.a`.
fn find_library(name: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    let file = format!("lib{}.a", name);
    for dir in search_dirs {
        let candidate = dir.join(&file);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    for dir in DEFAULT_LIB_DIRS {
        let candidate = Path::new(dir).join(&file);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn is_archive(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 8];
    let mut file =
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let got = file
        .read(&mut magic)
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(got == 8 && &magic == AR_MAGIC)
}

/// The archive-member part of a diagnostic path (`lib.a(puts.o)`), or the
/// file name for plain objects. Used by the gc-sections root set.
fn object_basename(path: &str) -> &str {
    if let Some(open) = path.rfind('(') {
        if path.ends_with(')') {
            return &path[open + 1..path.len() - 1];
        }
    }
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Dead-code elimination over whole objects: BFS from the entry point and
/// the always-live runtime set along undefined-symbol -> defining-object
/// edges.
fn gc_objects(objects: Vec<ObjectFile>, entry_candidates: &[&str]) -> Vec<ObjectFile> {
    let mut definer: HashMap<&str, usize> = HashMap::new();
    for (index, object) in objects.iter().enumerate() {
        for symbol in object.exported_symbols() {
            definer.entry(symbol.name.as_str()).or_insert(index);
        }
    }

    let mut live = vec![false; objects.len()];
    let mut queue = VecDeque::new();

    for (index, object) in objects.iter().enumerate() {
        let base = object_basename(&object.path);
        if ALWAYS_LIVE_OBJECTS.contains(&base) {
            live[index] = true;
            queue.push_back(index);
        }
    }
    for entry in entry_candidates {
        if let Some(index) = definer.get(entry) {
            if !live[*index] {
                live[*index] = true;
                queue.push_back(*index);
            }
            break;
        }
    }

    while let Some(index) = queue.pop_front() {
        for symbol in objects[index].undefined_symbols() {
            if let Some(target) = definer.get(symbol.name.as_str()) {
                if !live[*target] {
                    live[*target] = true;
                    queue.push_back(*target);
                }
            }
        }
    }

    let mut kept = Vec::with_capacity(objects.len());
    for (index, object) in objects.into_iter().enumerate() {
        if live[index] {
            kept.push(object);
        } else {
            info!("gc-sections: dropping {}", object.path);
        }
    }
    kept
}

fn dump_symbols(table: &SymbolTable) {
    println!("resolved symbols:");
    for symbol in &table.symbols {
        println!(
            "{:#018x} {:>6} {}{} {}",
            symbol.value,
            symbol.size,
            match symbol.bind {
                crate::object::Binding::Weak => "W",
                _ => "G",
            },
            if symbol.is_defined() { " " } else { "U" },
            table.name_of(symbol)
        );
    }
}

fn dump_relocations(batch: &RelocBatch, objects: &[ObjectFile], layout: &Layout) {
    println!("relocation batch ({} entries):", batch.len());
    for site in &batch.sites {
        let object = &objects[site.object];
        let symbol = &object.symbols[site.rela.sym as usize];
        println!(
            "{:<10} {:#010x} {:<24} {} ({})",
            layout.sections[site.merged].name,
            site.offset,
            object.arch.reloc_name(site.rela.rtype),
            symbol.name,
            object.path
        );
    }
}

/// Run a whole link, start to finish.
pub fn link(options: &LinkOptions) -> Result<LinkStats> {
    let start = Instant::now();
    let mut stats = LinkStats::default();

    // phase 1: load the command-line inputs
    let mut objects: Vec<ObjectFile> = Vec::new();
    let mut archives: Vec<ArchiveContext> = Vec::new();
    for input in &options.inputs {
        if is_archive(input)? {
            debug!("input archive {}", input.display());
            archives.push(ArchiveContext::open(input)?);
        } else {
            debug!("input object {}", input.display());
            objects.push(ObjectFile::open(input)?);
        }
    }
    for name in &options.libraries {
        let path = find_library(name, &options.search_dirs)
            .with_context(|| format!("cannot find -l{}", name))?;
        info!("-l{} resolved to {}", name, path.display());
        archives.push(ArchiveContext::open(&path)?);
    }
    if objects.is_empty() {
        bail!("no input objects");
    }

    // phase 2: pull archive members until the undefined set stops moving
    let (mut table, extracted) =
        resolve::resolve_with_archives(&mut objects, &archives, options.trace_resolve)?;
    stats.extracted_members = extracted;

    let arch = objects[0].arch;
    for object in &objects {
        if object.arch != arch {
            bail!(
                "{} is {} but the link started as {}",
                object.path,
                object.arch,
                arch
            );
        }
    }

    // optional: drop objects unreachable from the entry point
    if options.gc_sections {
        let before = objects.len();
        objects = gc_objects(objects, &["_start", "main"]);
        if objects.len() != before {
            table = SymbolTable::build(&objects);
        }
    }
    stats.objects = objects.len();

    // phase 3: synthetic runtime symbols, then report what is left over
    stats.synthetics_injected = table.inject_synthetics();
    for name in table.undefined_names() {
        warn!("undefined symbol `{}'", name);
    }

    // phase 2.5/3.5: merge sections, place COMMON blocks, assign
    // addresses, finalise symbol values
    let mut layout = Layout::merge(&objects);
    table.allocate_commons(&mut layout);
    layout.assign_addresses();
    table.finalise(&layout);
    stats.merged_sections = layout.sections.len();

    if options.dump_symbols {
        dump_symbols(&table);
    }

    // phase 4: relocate
    let batch = RelocBatch::build(&objects, &layout);
    if options.dump_relocations {
        dump_relocations(&batch, &objects, &layout);
    }
    let mut apply_stats = ApplyStats::default();
    let overflows = {
        let engine = RelocEngine::new(arch, &objects, &table);
        engine.pass1(&mut layout, &batch, &mut apply_stats)?
    };

    if !overflows.is_empty() {
        // pass 2: make room for the thunks right after .text, re-derive
        // every address, then re-apply with the overflow sites redirected
        let mut thunks = GotPlt::from_overflows(&overflows);
        info!(
            "{} PC-relative overflows, synthesising {} PLT entries",
            overflows.len(),
            thunks.len()
        );
        let (got_index, plt_index) =
            layout.insert_got_plt(thunks.got_size(), thunks.plt_size());
        layout.assign_addresses();
        table.finalise(&layout);

        let got_vma = layout.sections[got_index].vma;
        let plt_vma = layout.sections[plt_index].vma;
        thunks.set_bases(got_vma, plt_vma);
        for name in thunks.names.clone() {
            match table.get(&name).filter(|s| s.is_defined()) {
                Some(symbol) => thunks.set_value(&name, symbol.value),
                None => bail!("overflowed symbol `{}' lost its definition", name),
            }
        }
        layout.set_section_data(got_index, thunks.got_bytes());
        layout.set_section_data(plt_index, thunks.plt_bytes(arch));

        let engine = RelocEngine::new(arch, &objects, &table);
        engine.pass2(&mut layout, &batch, &overflows, &thunks, &mut apply_stats)?;
    }
    stats.relocs_applied = apply_stats.applied;
    stats.relocs_skipped = apply_stats.skipped;
    stats.relocs_plt = apply_stats.redirected;

    // phase 5: find the entry point and write the image
    let entry = match table.get("_start").filter(|s| s.is_defined()) {
        Some(symbol) => symbol.value,
        None => match table.get("main").filter(|s| s.is_defined()) {
            Some(symbol) => {
                warn!("`_start' not found, using `main' as the entry point");
                symbol.value
            }
            None => bail!("entry symbol `_start' not found"),
        },
    };
    writer::write_executable(&options.output, arch, entry, &layout)?;

    for section in &layout.sections {
        if section.flags & crate::elf::SHF_EXECINSTR != 0 {
            stats.code_bytes += section.size;
        } else {
            stats.data_bytes += section.size;
        }
    }
    let (defined, weak, undefined) = table.counts();
    stats.defined = defined;
    stats.weak = weak;
    stats.undefined = undefined;
    stats.wall_millis = start.elapsed().as_millis();

    info!(
        "linked {} objects ({} from archives), {} synthetic symbols",
        stats.objects, stats.extracted_members, stats.synthetics_injected
    );
    info!(
        "symbols: {} defined, {} weak, {} undefined",
        stats.defined, stats.weak, stats.undefined
    );
    info!(
        "relocations: {} applied, {} skipped, {} via PLT",
        stats.relocs_applied, stats.relocs_skipped, stats.relocs_plt
    );
    info!(
        "{} sections, {} code bytes, {} data bytes, {} ms",
        stats.merged_sections, stats.code_bytes, stats.data_bytes, stats.wall_millis
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;
    use crate::elf::*;
    use crate::testutil::ObjBuilder;
    use byteorder::{ByteOrder, LittleEndian};
    use std::fs;

    fn start_object() -> Vec<u8> {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            // xor edi,edi; mov eax,60; syscall: exit(0), no relocations
            vec![
                0x31, 0xff, 0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05, 0x90, 0x90, 0x90,
            ],
            16,
        );
        b.symbol("_start", STB_GLOBAL, STT_FUNC, Some(text), 0, 12);
        b.build()
    }

    fn caller_object(callee: &str) -> Vec<u8> {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            // call rel32; ret
            vec![0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3, 0x90, 0x90],
            16,
        );
        b.symbol("_start", STB_GLOBAL, STT_FUNC, Some(text), 0, 8);
        b.symbol(callee, STB_GLOBAL, STT_NOTYPE, None, 0, 0);
        b.rela(text, 1, R_X86_64_PLT32, callee, -4);
        b.build()
    }

    fn callee_object(name: &str) -> Vec<u8> {
        let mut b = ObjBuilder::new();
        let text = b.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0xc3, 0x90, 0x90, 0x90],
            16,
        );
        b.symbol(name, STB_GLOBAL, STT_FUNC, Some(text), 0, 4);
        b.build()
    }

    #[test]
    fn links_a_self_contained_object() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("hello.o");
        fs::write(&input, start_object()).unwrap();
        let output = dir.path().join("hello");

        let options = LinkOptions::new(vec![input], output.clone());
        let stats = link(&options).unwrap();
        assert_eq!(stats.objects, 1);
        assert_eq!(stats.extracted_members, 0);
        assert_eq!(stats.undefined, 0);

        let image = fs::read(&output).unwrap();
        assert_eq!(&image[0..4], &ELF_MAGIC);
        assert_eq!(LittleEndian::read_u16(&image[16..18]), ET_EXEC);
        // entry points at the start of .text
        assert_eq!(LittleEndian::read_u64(&image[24..32]), 0x400000);
    }

    #[test]
    fn pulls_exactly_the_needed_archive_member() {
        let dir = tempfile::tempdir().unwrap();
        let puts = dir.path().join("puts.o");
        fs::write(&puts, callee_object("puts")).unwrap();
        let other = dir.path().join("other.o");
        fs::write(&other, callee_object("unrelated")).unwrap();
        let lib = dir.path().join("libc.a");
        archive::create(&lib, &[puts.as_path(), other.as_path()]).unwrap();

        let main = dir.path().join("main.o");
        fs::write(&main, caller_object("puts")).unwrap();
        let output = dir.path().join("a.out");

        let mut options = LinkOptions::new(vec![main], output.clone());
        options.search_dirs = vec![dir.path().to_path_buf()];
        options.libraries = vec!["c".to_owned()];
        let stats = link(&options).unwrap();

        assert_eq!(stats.extracted_members, 1);
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.relocs_applied, 1);
        assert!(output.is_file());
    }

    #[test]
    fn call_displacement_reaches_the_callee() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.o");
        fs::write(&main, caller_object("f")).unwrap();
        let f = dir.path().join("f.o");
        fs::write(&f, callee_object("f")).unwrap();
        let output = dir.path().join("a.out");

        let options = LinkOptions::new(vec![main, f], output.clone());
        link(&options).unwrap();

        let image = fs::read(&output).unwrap();
        let e_phoff = LittleEndian::read_u64(&image[32..40]) as usize;
        let text_off = LittleEndian::read_u64(&image[e_phoff + 8..e_phoff + 16]) as usize;
        // main.o's .text is first: e8 at +0, disp32 at +1
        let disp = LittleEndian::read_i32(&image[text_off + 1..text_off + 5]) as i64;
        // callee is at text+16 (second contribution, 16-aligned); the
        // call resolves relative to its next instruction at text+5
        assert_eq!(disp, 16 - 5);
    }

    #[test]
    fn missing_entry_symbol_fails_the_link() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("f.o");
        fs::write(&input, callee_object("f")).unwrap();
        let output = dir.path().join("a.out");

        let err = link(&LinkOptions::new(vec![input], output)).unwrap_err();
        assert!(err.to_string().contains("_start"));
    }

    #[test]
    fn undefined_symbols_warn_but_do_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("main.o");
        fs::write(&input, caller_object("never_defined")).unwrap();
        let output = dir.path().join("a.out");

        let stats = link(&LinkOptions::new(vec![input], output.clone())).unwrap();
        assert!(stats.undefined >= 1);
        assert_eq!(stats.relocs_skipped, 1);
        assert!(output.is_file());
    }

    #[test]
    fn gc_sections_keeps_the_reachable_objects() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.o");
        fs::write(&main, caller_object("used")).unwrap();
        let used = dir.path().join("used.o");
        fs::write(&used, callee_object("used")).unwrap();
        let dead = dir.path().join("dead.o");
        fs::write(&dead, callee_object("dead_code")).unwrap();
        let output = dir.path().join("a.out");

        let mut options = LinkOptions::new(vec![main, used, dead], output);
        options.gc_sections = true;
        let stats = link(&options).unwrap();
        // dead.o defines nothing reachable from _start
        assert_eq!(stats.objects, 2);
    }

    #[test]
    fn gc_sections_keeps_always_live_runtime_objects() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.o");
        fs::write(&main, start_object()).unwrap();
        let crt = dir.path().join("crt.o");
        fs::write(&crt, callee_object("crt_init")).unwrap();
        let output = dir.path().join("a.out");

        let mut options = LinkOptions::new(vec![main, crt], output);
        options.gc_sections = true;
        let stats = link(&options).unwrap();
        // crt.o is in the always-live set even though nothing calls it
        assert_eq!(stats.objects, 2);
    }

    #[test]
    fn weak_definition_is_overridden_by_global() {
        let dir = tempfile::tempdir().unwrap();

        let mut weak = ObjBuilder::new();
        let text = weak.section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            vec![0x90; 8],
            16,
        );
        weak.symbol("foo", STB_WEAK, STT_FUNC, Some(text), 0, 8);
        let weak_path = dir.path().join("weak.o");
        fs::write(&weak_path, weak.build()).unwrap();

        let strong_path = dir.path().join("strong.o");
        fs::write(&strong_path, callee_object("foo")).unwrap();

        let main = dir.path().join("main.o");
        fs::write(&main, caller_object("foo")).unwrap();
        let output = dir.path().join("a.out");

        // weak.o first on the command line; resolution still picks strong
        let options = LinkOptions::new(vec![main, weak_path, strong_path], output.clone());
        link(&options).unwrap();

        let image = fs::read(&output).unwrap();
        let e_phoff = LittleEndian::read_u64(&image[32..40]) as usize;
        let text_off = LittleEndian::read_u64(&image[e_phoff + 8..e_phoff + 16]) as usize;
        let disp = LittleEndian::read_i32(&image[text_off + 1..text_off + 5]) as i64;
        // strong.o's .text is the third 16-byte-aligned contribution
        assert_eq!(disp, 32 - 5);
    }

    #[test]
    fn plt32_overflow_is_fixed_through_a_synthesised_plt() {
        let dir = tempfile::tempdir().unwrap();

        let main = dir.path().join("main.o");
        fs::write(&main, caller_object("far_away")).unwrap();

        // far_away sits past a zero-fill block laid out between .text and
        // its own section family
        let build_far = |fill: u64| -> Vec<u8> {
            let mut far = ObjBuilder::new();
            far.section_nobits(".farpool", SHF_ALLOC | SHF_WRITE, fill, 16);
            let fartext = far.section(
                ".fartext",
                SHT_PROGBITS,
                SHF_ALLOC | SHF_EXECINSTR,
                vec![0xc3, 0x90, 0x90, 0x90],
                16,
            );
            far.symbol("far_away", STB_GLOBAL, STT_FUNC, Some(fartext), 0, 4);
            far.build()
        };
        let far_path = dir.path().join("far.o");
        fs::write(&far_path, build_far(64)).unwrap();

        let output = dir.path().join("a.out");
        let options = LinkOptions::new(vec![main.clone(), far_path.clone()], output.clone());

        // small link first: no overflow, no PLT
        let stats = link(&options).unwrap();
        assert_eq!(stats.relocs_plt, 0);

        // now rebuild far.o with a fill block big enough to push the
        // callee out of PC32 range (2 GiB and change)
        fs::write(&far_path, build_far(0x8000_0010)).unwrap();

        let stats = link(&options).unwrap();
        assert_eq!(stats.relocs_plt, 1);

        let image = fs::read(&output).unwrap();
        let e_phoff = LittleEndian::read_u64(&image[32..40]) as usize;
        let text_off = LittleEndian::read_u64(&image[e_phoff + 8..e_phoff + 16]) as usize;
        let text_vma = LittleEndian::read_u64(&image[e_phoff + 16..e_phoff + 24]);

        // fix-up invariant: the site now encodes plt_stub - (site + 4)
        let disp = LittleEndian::read_i32(&image[text_off + 1..text_off + 5]) as i64;
        let site = text_vma + 1;
        let stub = (site as i64 + 4 + disp) as u64;
        // the stub is within the RX segment and within 2 GiB of the site
        let rx_memsz = LittleEndian::read_u64(&image[e_phoff + 40..e_phoff + 48]);
        assert!(stub >= text_vma && stub < text_vma + rx_memsz);
        assert!((stub as i64 - site as i64).abs() < (1 << 31));

        // the stub is `ff 25 disp32` jumping through a GOT slot that
        // holds far_away's final address
        let stub_off = text_off + (stub - text_vma) as usize;
        assert_eq!(&image[stub_off..stub_off + 2], &[0xff, 0x25]);
        let got_disp = LittleEndian::read_i32(&image[stub_off + 2..stub_off + 6]) as i64;
        let slot_vma = (stub as i64 + 6 + got_disp) as u64;
        let slot_off = text_off + (slot_vma - text_vma) as usize;
        let target = LittleEndian::read_u64(&image[slot_off..slot_off + 8]);
        // far_away lives past the 2 GiB of rodata
        assert!(target > 0x400000 + 0x8000_0000);
    }
}
