use crate::elf::*;
use crate::reader::{self, Reader};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{path}: file too small for an ELF header ({size} bytes)")]
    TooSmall { path: String, size: usize },

    #[error("{path}: bad ELF magic: got {magic:02x?}, expected {expected:02x?}", expected = ELF_MAGIC)]
    BadMagic { path: String, magic: [u8; 4] },

    #[error("{path}: not a 64-bit ELF (class {class})")]
    WrongClass { path: String, class: u8 },

    #[error("{path}: not little-endian (encoding {encoding})")]
    WrongEncoding { path: String, encoding: u8 },

    #[error("{path}: unsupported machine {machine} (want x86-64 or aarch64)")]
    UnsupportedMachine { path: String, machine: u16 },

    #[error("{path}: not a relocatable object (type {e_type})")]
    NotRelocatable { path: String, e_type: u16 },

    #[error("{path}: {what}")]
    OutOfBounds { path: String, what: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    fn bounds(path: &str, err: reader::Error) -> Error {
        Error::OutOfBounds {
            path: path.to_owned(),
            what: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn from_machine(machine: u16) -> Option<Arch> {
        match machine {
            EM_X86_64 => Some(Arch::X86_64),
            EM_AARCH64 => Some(Arch::Aarch64),
            _ => None,
        }
    }

    pub fn machine(self) -> u16 {
        match self {
            Arch::X86_64 => EM_X86_64,
            Arch::Aarch64 => EM_AARCH64,
        }
    }

    pub fn reloc_name(self, rtype: u32) -> &'static str {
        match self {
            Arch::X86_64 => x86_64_reloc_name(rtype),
            Arch::Aarch64 => aarch64_reloc_name(rtype),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86-64"),
            Arch::Aarch64 => write!(f, "aarch64"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    // Local symbol
    Local,
    // Global symbol
    Global,
    // Weak symbol
    Weak,
    // Anything else (GNU unique and friends)
    Other(u8),
}

impl Binding {
    pub fn new(st_info: u8) -> Binding {
        use Binding::*;

        match st_info >> 4 {
            STB_LOCAL => Local,
            STB_GLOBAL => Global,
            STB_WEAK => Weak,
            other => Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    // Type is unspecified
    NoType,
    // Data object
    Object,
    // Code object
    Func,
    // Symbol associated with a section
    Section,
    // Symbol's name is a file name
    File,
    // Common data object
    Common,
    // Thread-local data object
    Tls,
    Other(u8),
}

impl SymKind {
    pub fn new(st_info: u8) -> SymKind {
        use SymKind::*;

        match st_info & 0xf {
            STT_NOTYPE => NoType,
            STT_OBJECT => Object,
            STT_FUNC => Func,
            STT_SECTION => Section,
            STT_FILE => File,
            STT_COMMON => Common,
            STT_TLS => Tls,
            other => Other(other),
        }
    }
}

/// One symbol record, name already resolved through the object's strtab.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub shndx: u16,
    pub bind: Binding,
    pub kind: SymKind,
    pub vis: u8,
}

impl Symbol {
    pub fn is_undefined(&self) -> bool {
        self.shndx == SHN_UNDEF
    }

    pub fn is_common(&self) -> bool {
        self.shndx == SHN_COMMON || self.kind == SymKind::Common
    }

    pub fn is_absolute(&self) -> bool {
        self.shndx == SHN_ABS
    }
}

/// One contributing section. `data` is empty for NOBITS and for section
/// kinds the linker consumes in parsed form (symtab, strtab, rela).
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub data: Vec<u8>,
    pub size: u64,
    pub align: u64,
    pub index: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Rela {
    pub offset: u64,
    pub rtype: u32,
    pub sym: u32,
    pub addend: i64,
}

/// All RELA entries applying to one target section of the owning object.
#[derive(Debug, Clone)]
pub struct RelaSection {
    pub target: usize,
    pub entries: Vec<Rela>,
}

/// One normalised relocatable input. All buffers are owned copies; the
/// bytes the object was parsed from may be dropped (or unmapped) freely.
#[derive(Debug)]
pub struct ObjectFile {
    pub path: String,
    pub arch: Arch,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub relas: Vec<RelaSection>,
}

/// NUL-terminated string pool. Out-of-range offsets resolve to the empty
/// string instead of failing; a missing name never aborts a link.
#[derive(Debug, Default)]
pub struct StringTable {
    buffer: Vec<u8>,
}

impl StringTable {
    pub fn new(buffer: Vec<u8>) -> StringTable {
        StringTable { buffer }
    }

    pub fn empty() -> StringTable {
        StringTable::default()
    }

    pub fn get(&self, offset: u64) -> String {
        if offset >= self.buffer.len() as u64 {
            return String::new();
        }
        let sub = &self.buffer[offset as usize..];
        let end = sub.iter().position(|b| *b == 0).unwrap_or(sub.len());
        String::from_utf8_lossy(&sub[..end]).into_owned()
    }
}

/// Raw section header as it sits in the file.
#[derive(Debug, Clone)]
pub(crate) struct RawShdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl RawShdr {
    fn parse(r: &mut Reader) -> Result<RawShdr, reader::Error> {
        Ok(RawShdr {
            sh_name: r.read_u32()?,
            sh_type: r.read_u32()?,
            sh_flags: r.read_u64()?,
            sh_addr: r.read_u64()?,
            sh_offset: r.read_u64()?,
            sh_size: r.read_u64()?,
            sh_link: r.read_u32()?,
            sh_info: r.read_u32()?,
            sh_addralign: r.read_u64()?,
            sh_entsize: r.read_u64()?,
        })
    }
}

/// Minimal ELF64 view: validated identification plus the section header
/// table and its name strings. The object reader builds on it, and the
/// inspectors use it directly so they can look at executables too.
pub(crate) struct RawElf<'a> {
    pub path: String,
    pub data: &'a [u8],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_phnum: u16,
    pub e_shstrndx: u16,
    pub shdrs: Vec<RawShdr>,
    pub shstrtab: StringTable,
}

impl<'a> RawElf<'a> {
    pub fn parse(data: &'a [u8], path: &str) -> Result<RawElf<'a>, Error> {
        if data.len() < EHDR_SIZE as usize {
            return Err(Error::TooSmall {
                path: path.to_owned(),
                size: data.len(),
            });
        }

        let mut r = Reader::new(data);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(|e| Error::bounds(path, e))?;
        if magic != ELF_MAGIC {
            return Err(Error::BadMagic {
                path: path.to_owned(),
                magic,
            });
        }

        let class = r.read_u8().map_err(|e| Error::bounds(path, e))?;
        if class != ELFCLASS64 {
            return Err(Error::WrongClass {
                path: path.to_owned(),
                class,
            });
        }
        let encoding = r.read_u8().map_err(|e| Error::bounds(path, e))?;
        if encoding != ELFDATA2LSB {
            return Err(Error::WrongEncoding {
                path: path.to_owned(),
                encoding,
            });
        }

        // version, OS ABI, ABI version, padding
        r.seek(16).map_err(|e| Error::bounds(path, e))?;

        let e_type = r.read_u16().map_err(|e| Error::bounds(path, e))?;
        let e_machine = r.read_u16().map_err(|e| Error::bounds(path, e))?;
        let _e_version = r.read_u32().map_err(|e| Error::bounds(path, e))?;
        let e_entry = r.read_u64().map_err(|e| Error::bounds(path, e))?;
        let e_phoff = r.read_u64().map_err(|e| Error::bounds(path, e))?;
        let e_shoff = r.read_u64().map_err(|e| Error::bounds(path, e))?;
        let _e_flags = r.read_u32().map_err(|e| Error::bounds(path, e))?;
        let _e_ehsize = r.read_u16().map_err(|e| Error::bounds(path, e))?;
        let _e_phentsize = r.read_u16().map_err(|e| Error::bounds(path, e))?;
        let e_phnum = r.read_u16().map_err(|e| Error::bounds(path, e))?;
        let e_shentsize = r.read_u16().map_err(|e| Error::bounds(path, e))?;
        let e_shnum = r.read_u16().map_err(|e| Error::bounds(path, e))?;
        let e_shstrndx = r.read_u16().map_err(|e| Error::bounds(path, e))?;

        if e_shnum > 0 && e_shentsize as u64 != SHDR_SIZE {
            return Err(Error::OutOfBounds {
                path: path.to_owned(),
                what: format!("unexpected section header entry size {}", e_shentsize),
            });
        }

        let mut shdrs = Vec::with_capacity(e_shnum as usize);
        r.seek(e_shoff).map_err(|e| Error::bounds(path, e))?;
        for _ in 0..e_shnum {
            shdrs.push(RawShdr::parse(&mut r).map_err(|e| Error::bounds(path, e))?);
        }

        let shstrtab = if (e_shstrndx as usize) < shdrs.len() {
            let hdr = &shdrs[e_shstrndx as usize];
            let raw = r
                .window(hdr.sh_offset, hdr.sh_size)
                .map_err(|e| Error::bounds(path, e))?;
            StringTable::new(raw.to_vec())
        } else {
            StringTable::empty()
        };

        Ok(RawElf {
            path: path.to_owned(),
            data,
            e_type,
            e_machine,
            e_entry,
            e_phoff,
            e_phnum,
            e_shstrndx,
            shdrs,
            shstrtab,
        })
    }

    pub fn section_name(&self, index: usize) -> String {
        match self.shdrs.get(index) {
            Some(hdr) => self.shstrtab.get(hdr.sh_name as u64),
            None => String::new(),
        }
    }

    /// Bounds-checked payload of section `index`; empty for NOBITS.
    pub fn section_data(&self, index: usize) -> Result<&'a [u8], Error> {
        let hdr = &self.shdrs[index];
        if hdr.sh_type == SHT_NOBITS {
            return Ok(&[]);
        }
        Reader::new(self.data)
            .window(hdr.sh_offset, hdr.sh_size)
            .map_err(|e| Error::bounds(&self.path, e))
    }
}

impl ObjectFile {
    /// Read and parse a relocatable from the filesystem.
    pub fn open(path: &Path) -> Result<ObjectFile, Error> {
        let display = path.display().to_string();
        let data = fs::read(path).map_err(|source| Error::Io {
            path: display.clone(),
            source,
        })?;
        ObjectFile::parse(&data, &display)
    }

    /// Parse a relocatable from a byte slice. `path` is used only in
    /// diagnostics; archive extraction passes `archive(member)` here.
    pub fn parse(data: &[u8], path: &str) -> Result<ObjectFile, Error> {
        let raw = RawElf::parse(data, path)?;

        if raw.e_type != ET_REL {
            return Err(Error::NotRelocatable {
                path: path.to_owned(),
                e_type: raw.e_type,
            });
        }
        let arch = Arch::from_machine(raw.e_machine).ok_or(Error::UnsupportedMachine {
            path: path.to_owned(),
            machine: raw.e_machine,
        })?;

        let mut sections = Vec::with_capacity(raw.shdrs.len());
        for (index, hdr) in raw.shdrs.iter().enumerate() {
            let keep_bytes = match hdr.sh_type {
                SHT_PROGBITS | SHT_NOTE => true,
                _ => false,
            };
            let data = if keep_bytes {
                raw.section_data(index)?.to_vec()
            } else {
                Vec::new()
            };
            sections.push(Section {
                name: raw.shstrtab.get(hdr.sh_name as u64),
                sh_type: hdr.sh_type,
                flags: hdr.sh_flags,
                data,
                size: hdr.sh_size,
                align: hdr.sh_addralign.max(1),
                index,
            });
        }

        let symbols = parse_symbols(&raw)?;
        let relas = parse_relas(&raw, symbols.len())?;

        Ok(ObjectFile {
            path: path.to_owned(),
            arch,
            sections,
            symbols,
            relas,
        })
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Defined global and weak symbols, the ones an archive index records.
    pub fn exported_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|s| {
            !s.is_undefined()
                && matches!(s.bind, Binding::Global | Binding::Weak)
                && !matches!(s.kind, SymKind::Section | SymKind::File)
                && !s.name.is_empty()
        })
    }

    /// Undefined global and weak symbol names.
    pub fn undefined_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|s| {
            s.is_undefined()
                && matches!(s.bind, Binding::Global | Binding::Weak)
                && !s.name.is_empty()
        })
    }
}

pub(crate) fn parse_symbols(raw: &RawElf) -> Result<Vec<Symbol>, Error> {
    let symtab_index = match raw.shdrs.iter().position(|h| h.sh_type == SHT_SYMTAB) {
        Some(i) => i,
        None => return Ok(Vec::new()),
    };
    let symtab = &raw.shdrs[symtab_index];

    let strtab = if (symtab.sh_link as usize) < raw.shdrs.len() {
        StringTable::new(raw.section_data(symtab.sh_link as usize)?.to_vec())
    } else {
        StringTable::empty()
    };

    let bytes = raw.section_data(symtab_index)?;
    let count = bytes.len() as u64 / SYM_SIZE;
    let mut r = Reader::new(bytes);
    let mut symbols = Vec::with_capacity(count as usize);

    for n in 0..count {
        let st_name = r.read_u32().map_err(|e| Error::bounds(&raw.path, e))?;
        let st_info = r.read_u8().map_err(|e| Error::bounds(&raw.path, e))?;
        let st_other = r.read_u8().map_err(|e| Error::bounds(&raw.path, e))?;
        let st_shndx = r.read_u16().map_err(|e| Error::bounds(&raw.path, e))?;
        let st_value = r.read_u64().map_err(|e| Error::bounds(&raw.path, e))?;
        let st_size = r.read_u64().map_err(|e| Error::bounds(&raw.path, e))?;

        if st_shndx != SHN_UNDEF
            && st_shndx < SHN_LORESERVE
            && st_shndx as usize >= raw.shdrs.len()
        {
            return Err(Error::OutOfBounds {
                path: raw.path.clone(),
                what: format!(
                    "symbol {} section index {} out of range ({} sections)",
                    n,
                    st_shndx,
                    raw.shdrs.len()
                ),
            });
        }

        symbols.push(Symbol {
            name: strtab.get(st_name as u64),
            value: st_value,
            size: st_size,
            shndx: st_shndx,
            bind: Binding::new(st_info),
            kind: SymKind::new(st_info),
            vis: st_other & 0x3,
        });
    }

    Ok(symbols)
}

pub(crate) fn parse_relas(raw: &RawElf, symbol_count: usize) -> Result<Vec<RelaSection>, Error> {
    let mut relas = Vec::new();

    for (index, hdr) in raw.shdrs.iter().enumerate() {
        if hdr.sh_type != SHT_RELA {
            continue;
        }
        let target = hdr.sh_info as usize;
        if target >= raw.shdrs.len() {
            return Err(Error::OutOfBounds {
                path: raw.path.clone(),
                what: format!(
                    "relocation section {} targets section {} out of range",
                    raw.section_name(index),
                    target
                ),
            });
        }

        let bytes = raw.section_data(index)?;
        let count = bytes.len() as u64 / RELA_SIZE;
        let mut r = Reader::new(bytes);
        let mut entries = Vec::with_capacity(count as usize);

        for n in 0..count {
            let r_offset = r.read_u64().map_err(|e| Error::bounds(&raw.path, e))?;
            let r_info = r.read_u64().map_err(|e| Error::bounds(&raw.path, e))?;
            let r_addend = r.read_i64().map_err(|e| Error::bounds(&raw.path, e))?;

            let sym = (r_info >> 32) as u32;
            if sym as usize >= symbol_count.max(1) {
                return Err(Error::OutOfBounds {
                    path: raw.path.clone(),
                    what: format!(
                        "relocation {} in {} references symbol {} out of range ({} symbols)",
                        n,
                        raw.section_name(index),
                        sym,
                        symbol_count
                    ),
                });
            }

            entries.push(Rela {
                offset: r_offset,
                rtype: (r_info & 0xffff_ffff) as u32,
                sym,
                addend: r_addend,
            });
        }

        relas.push(RelaSection { target, entries });
    }

    Ok(relas)
}
