//! Reader and writer for `!<arch>\n` static archives: the System V / BSD
//! common format with 60-byte member headers, 2-byte alignment padding and
//! the GNU `//` long-name table (consumed on read, never produced).

use crate::object::{self, ObjectFile};
use log::{debug, info};
use memmap2::Mmap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const AR_HDR_SIZE: u64 = 60;
const AR_HDR_MAGIC: &[u8; 2] = b"`\n";

#[derive(Error, Debug)]
pub enum Error {
    #[error("{path}: not an ar archive (bad global magic)")]
    BadMagic { path: String },

    #[error("{path}: truncated archive member at offset {offset:#x}")]
    Truncated { path: String, offset: u64 },

    #[error("{path}: malformed member header at offset {offset:#x}: {what}")]
    BadHeader {
        path: String,
        offset: u64,
        what: String,
    },

    #[error("{path}: no member named `{name}'")]
    NoSuchMember { path: String, name: String },

    #[error(transparent)]
    Object(#[from] object::Error),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    fn io(path: &Path, source: std::io::Error) -> Error {
        Error::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// One real archive member. Offsets are absolute within the archive file;
/// `header_offset` identifies the member in the symbol index.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: u64,
    pub header_offset: u64,
    pub data_offset: u64,
}

/// Raw record, pseudo-members included. `delete_member` streams these
/// through verbatim so long-name references survive the rewrite.
struct RawRecord {
    name_field: String,
    resolved_name: String,
    mtime: u64,
    uid: u32,
    gid: u32,
    mode: u32,
    size: u64,
    header_offset: u64,
    data_offset: u64,
}

impl RawRecord {
    fn is_symbol_table(&self) -> bool {
        self.name_field == "/"
    }

    fn is_longname_table(&self) -> bool {
        self.name_field == "//"
    }
}

fn parse_decimal(field: &[u8], path: &str, offset: u64, what: &str) -> Result<u64, Error> {
    let text = String::from_utf8_lossy(field);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse().map_err(|_| Error::BadHeader {
        path: path.to_owned(),
        offset,
        what: format!("bad {} field `{}'", what, trimmed),
    })
}

fn parse_octal(field: &[u8]) -> u32 {
    let text = String::from_utf8_lossy(field);
    u32::from_str_radix(text.trim(), 8).unwrap_or(0)
}

fn scan_records(data: &[u8], path: &str) -> Result<Vec<RawRecord>, Error> {
    if data.len() < AR_MAGIC.len() || &data[..AR_MAGIC.len()] != AR_MAGIC {
        return Err(Error::BadMagic {
            path: path.to_owned(),
        });
    }

    let mut records: Vec<RawRecord> = Vec::new();
    let mut longnames: Vec<u8> = Vec::new();
    let mut offset = AR_MAGIC.len() as u64;

    while offset < data.len() as u64 {
        // trailing padding newline is fine
        if data.len() as u64 - offset < AR_HDR_SIZE {
            if data[offset as usize..].iter().all(|b| *b == b'\n') {
                break;
            }
            return Err(Error::Truncated {
                path: path.to_owned(),
                offset,
            });
        }

        let hdr = &data[offset as usize..(offset + AR_HDR_SIZE) as usize];
        if &hdr[58..60] != AR_HDR_MAGIC {
            return Err(Error::BadHeader {
                path: path.to_owned(),
                offset,
                what: "bad member magic".to_owned(),
            });
        }

        let name_field = String::from_utf8_lossy(&hdr[0..16]).trim_end().to_owned();
        let mtime = parse_decimal(&hdr[16..28], path, offset, "mtime")?;
        let uid = parse_decimal(&hdr[28..34], path, offset, "uid")? as u32;
        let gid = parse_decimal(&hdr[34..40], path, offset, "gid")? as u32;
        let mode = parse_octal(&hdr[40..48]);
        let size = parse_decimal(&hdr[48..58], path, offset, "size")?;

        let data_offset = offset + AR_HDR_SIZE;
        if data_offset + size > data.len() as u64 {
            return Err(Error::Truncated {
                path: path.to_owned(),
                offset,
            });
        }

        let resolved_name = if name_field == "//" {
            longnames = data[data_offset as usize..(data_offset + size) as usize].to_vec();
            String::new()
        } else if name_field != "/" && name_field.starts_with('/') {
            // GNU long name: /<decimal offset into the // table>
            let table_offset: usize = name_field[1..].parse().map_err(|_| Error::BadHeader {
                path: path.to_owned(),
                offset,
                what: format!("bad long-name reference `{}'", name_field),
            })?;
            resolve_longname(&longnames, table_offset).ok_or_else(|| Error::BadHeader {
                path: path.to_owned(),
                offset,
                what: format!("long-name offset {} out of range", table_offset),
            })?
        } else {
            // GNU terminates inline names with `/', BSD pads with spaces
            name_field.trim_end_matches('/').to_owned()
        };

        records.push(RawRecord {
            name_field,
            resolved_name,
            mtime,
            uid,
            gid,
            mode,
            size,
            header_offset: offset,
            data_offset,
        });

        offset = data_offset + size;
        if offset % 2 == 1 {
            offset += 1;
        }
    }

    Ok(records)
}

fn resolve_longname(table: &[u8], offset: usize) -> Option<String> {
    if offset >= table.len() {
        return None;
    }
    let rest = &table[offset..];
    let end = rest
        .iter()
        .position(|b| *b == b'\n' || *b == b'/')
        .unwrap_or(rest.len());
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

/// Enumerate the real members of an archive held in memory.
pub fn parse_members(data: &[u8], path: &str) -> Result<Vec<Member>, Error> {
    Ok(scan_records(data, path)?
        .into_iter()
        .filter(|r| !r.is_symbol_table() && !r.is_longname_table())
        .map(|r| Member {
            name: r.resolved_name,
            mtime: r.mtime,
            uid: r.uid,
            gid: r.gid,
            mode: r.mode,
            size: r.size,
            header_offset: r.header_offset,
            data_offset: r.data_offset,
        })
        .collect())
}

pub fn member_data<'a>(data: &'a [u8], member: &Member) -> &'a [u8] {
    &data[member.data_offset as usize..(member.data_offset + member.size) as usize]
}

fn write_member_header<W: Write>(
    out: &mut W,
    name: &str,
    mtime: u64,
    uid: u32,
    gid: u32,
    mode: u32,
    size: u64,
) -> std::io::Result<()> {
    // 16-byte name field; longer names are truncated like BSD ar
    let mut short = name.to_owned();
    short.truncate(16);
    write!(
        out,
        "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}",
        short,
        mtime,
        uid,
        gid,
        format!("{:o}", mode),
        size
    )?;
    out.write_all(AR_HDR_MAGIC)
}

/// Create an archive from object files. Member metadata is canonicalised:
/// mtime/uid/gid 0, mode 0644, names truncated at 16 bytes.
pub fn create(archive: &Path, inputs: &[&Path]) -> Result<(), Error> {
    let mut out = Vec::new();
    out.extend_from_slice(AR_MAGIC);

    for input in inputs {
        let data = fs::read(input).map_err(|e| Error::io(input, e))?;
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        write_member_header(&mut out, &name, 0, 0, 0, 0o644, data.len() as u64)
            .map_err(|e| Error::io(archive, e))?;
        out.extend_from_slice(&data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }

    fs::write(archive, out).map_err(|e| Error::io(archive, e))?;
    info!("created {} with {} members", archive.display(), inputs.len());
    Ok(())
}

pub fn list(archive: &Path) -> Result<Vec<Member>, Error> {
    let data = fs::read(archive).map_err(|e| Error::io(archive, e))?;
    parse_members(&data, &archive.display().to_string())
}

/// Extract every member into `dest_dir`, payloads copied byte-for-byte.
pub fn extract_all(archive: &Path, dest_dir: &Path) -> Result<Vec<String>, Error> {
    let data = fs::read(archive).map_err(|e| Error::io(archive, e))?;
    let members = parse_members(&data, &archive.display().to_string())?;

    let mut names = Vec::with_capacity(members.len());
    for member in &members {
        let dest = dest_dir.join(&member.name);
        fs::write(&dest, member_data(&data, member)).map_err(|e| Error::io(&dest, e))?;
        names.push(member.name.clone());
    }
    Ok(names)
}

pub fn extract_member(archive: &Path, name: &str, dest: &Path) -> Result<(), Error> {
    let data = fs::read(archive).map_err(|e| Error::io(archive, e))?;
    let path = archive.display().to_string();
    let members = parse_members(&data, &path)?;

    let member = members
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| Error::NoSuchMember {
            path,
            name: name.to_owned(),
        })?;
    fs::write(dest, member_data(&data, member)).map_err(|e| Error::io(dest, e))
}

/// Remove one member. The surviving records are staged in a sibling temp
/// file which is atomically renamed over the original; any failure leaves
/// the archive untouched. The stale `/` symbol table, if present, is
/// dropped; the `//` long-name table is kept so references keep resolving.
pub fn delete_member(archive: &Path, name: &str) -> Result<(), Error> {
    let data = fs::read(archive).map_err(|e| Error::io(archive, e))?;
    let path = archive.display().to_string();
    let records = scan_records(&data, &path)?;

    if !records
        .iter()
        .any(|r| !r.is_symbol_table() && !r.is_longname_table() && r.resolved_name == name)
    {
        return Err(Error::NoSuchMember {
            path,
            name: name.to_owned(),
        });
    }

    let dir = archive.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(archive, e))?;

    tmp.write_all(AR_MAGIC).map_err(|e| Error::io(archive, e))?;
    for record in &records {
        if record.is_symbol_table() {
            continue;
        }
        if !record.is_longname_table() && record.resolved_name == name {
            continue;
        }
        let end = record.data_offset + record.size;
        tmp.write_all(&data[record.header_offset as usize..end as usize])
            .map_err(|e| Error::io(archive, e))?;
        if record.size % 2 == 1 {
            tmp.write_all(b"\n").map_err(|e| Error::io(archive, e))?;
        }
    }

    tmp.persist(archive)
        .map_err(|e| Error::io(archive, e.error))?;
    Ok(())
}

/// (symbol, member, member header offset) triple of the lazy-extraction
/// index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub symbol: String,
    pub member: String,
    pub offset: u64,
}

#[derive(Debug, Default)]
pub struct ArchiveIndex {
    pub entries: Vec<IndexEntry>,
}

impl ArchiveIndex {
    /// Members (by header offset) defining any of the `needed` names.
    /// The set is ordered so extraction is deterministic.
    pub fn members_for(&self, needed: &HashSet<String>) -> BTreeSet<u64> {
        self.entries
            .iter()
            .filter(|e| needed.contains(&e.symbol))
            .map(|e| e.offset)
            .collect()
    }
}

/// Single linear scan of the archive recording every defined global or
/// weak symbol of every member that parses as a supported ELF64 object.
/// Members that do not parse are skipped, not fatal.
pub fn build_index(data: &[u8], path: &str) -> Result<ArchiveIndex, Error> {
    let mut index = ArchiveIndex::default();

    for member in parse_members(data, path)? {
        let bytes = member_data(data, &member);
        let diag = format!("{}({})", path, member.name);
        let obj = match ObjectFile::parse(bytes, &diag) {
            Ok(obj) => obj,
            Err(err) => {
                debug!("skipping non-object archive member: {}", err);
                continue;
            }
        };
        for symbol in obj.exported_symbols() {
            index.entries.push(IndexEntry {
                symbol: symbol.name.clone(),
                member: member.name.clone(),
                offset: member.header_offset,
            });
        }
    }

    Ok(index)
}

/// A pre-indexed archive mapped read-only for the whole link. Extraction
/// parses straight out of the map; the produced objects own their buffers,
/// so the map's lifetime is independent of theirs.
pub struct ArchiveContext {
    pub path: String,
    pub index: ArchiveIndex,
    members: BTreeMap<u64, Member>,
    mmap: Mmap,
}

impl ArchiveContext {
    pub fn open(path: &Path) -> Result<ArchiveContext, Error> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
        let display = path.display().to_string();

        let members = parse_members(&mmap, &display)?
            .into_iter()
            .map(|m| (m.header_offset, m))
            .collect();
        let index = build_index(&mmap, &display)?;

        Ok(ArchiveContext {
            path: display,
            index,
            members,
            mmap,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Parse the unique members defining any of `needed`, fewest copies
    /// possible: slices point into the map until the object reader takes
    /// its owned copies.
    pub fn extract_objects_for_symbols(
        &self,
        needed: &HashSet<String>,
    ) -> Result<Vec<ObjectFile>, Error> {
        let mut objects = Vec::new();
        for offset in self.index.members_for(needed) {
            let member = &self.members[&offset];
            let diag = format!("{}({})", self.path, member.name);
            objects.push(ObjectFile::parse(member_data(self.data(), member), &diag)?);
        }
        Ok(objects)
    }
}
