//! Global symbol resolution: strong/weak/common rules, lazy archive
//! extraction driven by the undefined set, and the synthetic symbols the
//! Cosmopolitan runtime expects.

use crate::archive::{self, ArchiveContext};
use crate::elf::SHN_LORESERVE;
use crate::intern::{Interner, NameId};
use crate::merge::Layout;
use crate::object::{Binding, ObjectFile, SymKind, Symbol};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::collections::HashMap;

/// Upper bound on archive extraction rounds; the loop normally stops much
/// earlier because the undefined set stops shrinking.
pub const MAX_EXTRACT_ROUNDS: usize = 10;

/// Names the Cosmopolitan runtime references conditionally. Any of them
/// still undefined once the archives are drained becomes a weak absolute
/// with the listed default.
pub const SYNTHETIC_SYMBOLS: &[(&str, u64)] = &[
    ("_GLOBAL_OFFSET_TABLE_", 0),
    ("ape_pe_base", 0x400000),
    ("ape_pe_size", 0),
    ("v_ntversion", 0),
    ("v_ntsubsystem", 3),
    ("v_ntdllchar", 0),
    ("ape_text_vaddr", 0),
    ("ape_text_filesz", 0),
    ("ape_text_memsz", 0),
    ("ape_ram_vaddr", 0),
    ("ape_ram_filesz", 0),
    ("ape_ram_memsz", 0),
    ("ape_ram_rva", 0),
    ("ape_stack_vaddr", 0),
    ("ape_stack_filesz", 0),
    ("ape_stack_memsz", 0x100000),
    ("ape_stack_round", 0),
    ("_edata", 0),
    ("_end", 0),
    ("__bss_start", 0),
    ("program_invocation_name", 0),
    ("cosmo", 0),
];

/// Where a resolved symbol's definition lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Definition {
    /// Not defined anywhere (yet).
    Undefined,
    /// Offset `value` into section `section` of object `object`.
    Section { object: usize, section: usize },
    /// Absolute value, including the synthetic runtime defaults.
    Absolute,
    /// COMMON block; spot in `.bss` is picked by `allocate_commons`.
    Common,
}

/// One globally-visible name with the definition that won resolution.
#[derive(Debug, Clone)]
pub struct ResolvedSymbol {
    pub name: NameId,
    pub bind: Binding,
    pub definition: Definition,
    /// Pre-layout meaning: section offset, absolute value, or COMMON
    /// alignment.
    pub raw_value: u64,
    pub size: u64,
    /// Final virtual address, valid after `finalise`.
    pub value: u64,
    pub synthetic: bool,
    /// Set by `allocate_commons` for COMMON definitions.
    common_spot: Option<(usize, u64)>,
}

impl ResolvedSymbol {
    pub fn is_defined(&self) -> bool {
        self.definition != Definition::Undefined
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    pub interner: Interner,
    pub symbols: Vec<ResolvedSymbol>,
    index: HashMap<NameId, usize>,
}

impl SymbolTable {
    /// Phase 3: collect every non-local, non-section, non-file symbol of
    /// every loaded object, applying the duplicate-resolution rules in
    /// input order. Deterministic for a given object order.
    pub fn build(objects: &[ObjectFile]) -> SymbolTable {
        let mut table = SymbolTable::default();
        for (object_index, object) in objects.iter().enumerate() {
            for symbol in &object.symbols {
                if symbol.bind == Binding::Local
                    || matches!(symbol.kind, SymKind::Section | SymKind::File)
                    || symbol.name.is_empty()
                {
                    continue;
                }
                table.insert(object_index, object, symbol);
            }
        }
        table
    }

    fn incoming(&mut self, object_index: usize, symbol: &Symbol) -> ResolvedSymbol {
        let definition = if symbol.is_undefined() {
            Definition::Undefined
        } else if symbol.is_common() {
            Definition::Common
        } else if symbol.is_absolute() || symbol.shndx >= SHN_LORESERVE {
            Definition::Absolute
        } else {
            Definition::Section {
                object: object_index,
                section: symbol.shndx as usize,
            }
        };
        ResolvedSymbol {
            name: self.interner.intern(&symbol.name),
            bind: symbol.bind,
            definition,
            raw_value: symbol.value,
            size: symbol.size,
            value: 0,
            synthetic: false,
            common_spot: None,
        }
    }

    fn insert(&mut self, object_index: usize, object: &ObjectFile, symbol: &Symbol) {
        let incoming = self.incoming(object_index, symbol);
        let slot = match self.index.get(&incoming.name) {
            None => {
                self.index.insert(incoming.name, self.symbols.len());
                self.symbols.push(incoming);
                return;
            }
            Some(slot) => *slot,
        };

        let existing_defined = self.symbols[slot].is_defined();
        let existing_definition = self.symbols[slot].definition;
        let existing_bind = self.symbols[slot].bind;
        let name = self.interner.resolve(incoming.name);

        let replace = match (existing_defined, incoming.is_defined()) {
            // an undefined reference never displaces anything
            (_, false) => false,
            (false, true) => true,
            (true, true) => match (existing_definition, incoming.definition) {
                (Definition::Common, Definition::Common) => {
                    // keep the larger block, largest alignment either way
                    let slot_ref = &mut self.symbols[slot];
                    slot_ref.raw_value = slot_ref.raw_value.max(incoming.raw_value);
                    if incoming.size > slot_ref.size {
                        slot_ref.size = incoming.size;
                    }
                    return;
                }
                // a real definition supersedes a tentative COMMON block
                (Definition::Common, _) => true,
                (_, Definition::Common) => false,
                _ => match (existing_bind, incoming.bind) {
                    (Binding::Weak, Binding::Global) => true,
                    (Binding::Global, Binding::Weak) => false,
                    (Binding::Global, Binding::Global) => {
                        warn!(
                            "duplicate definition of `{}' in {} (keeping the first)",
                            name, object.path
                        );
                        false
                    }
                    _ => false,
                },
            },
        };

        if replace {
            debug!("`{}' resolved to definition in {}", name, object.path);
            self.symbols[slot] = incoming;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedSymbol> {
        let id = self.interner.get(name)?;
        self.index.get(&id).map(|slot| &self.symbols[*slot])
    }

    pub fn name_of(&self, symbol: &ResolvedSymbol) -> &str {
        self.interner.resolve(symbol.name)
    }

    /// Names of still-undefined globals; weak references do not pull
    /// archive members.
    pub fn undefined_names(&self) -> HashSet<String> {
        self.symbols
            .iter()
            .filter(|s| !s.is_defined() && s.bind == Binding::Global)
            .map(|s| self.interner.resolve(s.name).to_owned())
            .collect()
    }

    /// Define every still-missing runtime symbol as a weak absolute with
    /// its canonical default. Returns how many were injected.
    pub fn inject_synthetics(&mut self) -> usize {
        let mut injected = 0;
        for (name, default) in SYNTHETIC_SYMBOLS {
            let id = self.interner.intern(name);
            match self.index.get(&id).copied() {
                Some(slot) if self.symbols[slot].is_defined() => {}
                slot => {
                    let symbol = ResolvedSymbol {
                        name: id,
                        bind: Binding::Weak,
                        definition: Definition::Absolute,
                        raw_value: *default,
                        size: 0,
                        value: 0,
                        synthetic: true,
                        common_spot: None,
                    };
                    match slot {
                        Some(slot) => self.symbols[slot] = symbol,
                        None => {
                            self.index.insert(id, self.symbols.len());
                            self.symbols.push(symbol);
                        }
                    }
                    injected += 1;
                }
            }
        }
        injected
    }

    /// Give every COMMON symbol its spot in `.bss`. The recorded value of
    /// a COMMON symbol is its required alignment.
    pub fn allocate_commons(&mut self, layout: &mut Layout) {
        for symbol in &mut self.symbols {
            if symbol.definition == Definition::Common && symbol.common_spot.is_none() {
                let align = symbol.raw_value.max(1);
                symbol.common_spot = Some(layout.reserve_common(symbol.size, align));
            }
        }
    }

    /// Phase 3.5: turn section-relative values into virtual addresses.
    /// Symbols whose defining section was discarded from the image become
    /// undefined again, with a warning.
    pub fn finalise(&mut self, layout: &Layout) {
        for symbol in &mut self.symbols {
            match symbol.definition {
                Definition::Undefined => {}
                Definition::Absolute => symbol.value = symbol.raw_value,
                Definition::Common => {
                    if let Some((merged, offset)) = symbol.common_spot {
                        symbol.value = layout.sections[merged].vma + offset;
                    }
                }
                Definition::Section { object, section } => {
                    match layout.placement(object, section) {
                        Some(place) => {
                            symbol.value =
                                layout.sections[place.merged].vma + place.offset + symbol.raw_value;
                        }
                        None => {
                            warn!(
                                "`{}' is defined in a section that was discarded",
                                self.interner.resolve(symbol.name)
                            );
                            symbol.definition = Definition::Undefined;
                        }
                    }
                }
            }
        }
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let mut defined = 0;
        let mut weak = 0;
        let mut undefined = 0;
        for symbol in &self.symbols {
            if !symbol.is_defined() {
                undefined += 1;
            } else if symbol.bind == Binding::Weak {
                weak += 1;
            } else {
                defined += 1;
            }
        }
        (defined, weak, undefined)
    }
}

/// Phase 2: iteratively pull archive members that define currently
/// undefined globals. Bounded, and stops as soon as a round makes no
/// progress. Returns the final table and how many members were extracted.
pub fn resolve_with_archives(
    objects: &mut Vec<ObjectFile>,
    archives: &[ArchiveContext],
    trace: bool,
) -> Result<(SymbolTable, usize), archive::Error> {
    let mut table = SymbolTable::build(objects);
    let mut seen_members: HashSet<String> = HashSet::new();
    let mut extracted = 0;

    for round in 0..MAX_EXTRACT_ROUNDS {
        let undefined = table.undefined_names();
        if undefined.is_empty() {
            break;
        }
        if trace {
            info!(
                "resolve round {}: {} undefined symbols",
                round + 1,
                undefined.len()
            );
        }

        let mut pulled = 0;
        for context in archives {
            for object in context.extract_objects_for_symbols(&undefined)? {
                if !seen_members.insert(object.path.clone()) {
                    continue;
                }
                if trace {
                    info!("  pulling {}", object.path);
                }
                objects.push(object);
                pulled += 1;
            }
        }
        if pulled == 0 {
            break;
        }
        extracted += pulled;

        table = SymbolTable::build(objects);
        if table.undefined_names() == undefined {
            // new members brought no new definitions
            break;
        }
    }

    Ok((table, extracted))
}
