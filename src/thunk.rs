//! GOT/PLT synthesis for 32-bit PC-relative overflows. One 8-byte GOT
//! slot holding the target's absolute address and one 16-byte PLT stub
//! jumping through it, per unique overflowed symbol.

use crate::object::Arch;
use crate::reloc::Overflow;
use std::collections::HashMap;

pub const GOT_SLOT_SIZE: u64 = 8;
pub const PLT_STUB_SIZE: u64 = 16;

/// The synthesised trampoline tables. Built from the overflow list, given
/// addresses once the layout has made room, then rendered to bytes.
#[derive(Debug, Default)]
pub struct GotPlt {
    /// Unique overflowed symbols in first-appearance order.
    pub names: Vec<String>,
    index: HashMap<String, usize>,
    /// Final absolute addresses of the targets, one per name.
    values: Vec<u64>,
    pub got_base: u64,
    pub plt_base: u64,
}

impl GotPlt {
    pub fn from_overflows(overflows: &[Overflow]) -> GotPlt {
        let mut thunks = GotPlt::default();
        for overflow in overflows {
            if !thunks.index.contains_key(&overflow.name) {
                thunks.index.insert(overflow.name.clone(), thunks.names.len());
                thunks.names.push(overflow.name.clone());
                thunks.values.push(overflow.value);
            }
        }
        thunks
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn got_size(&self) -> u64 {
        self.names.len() as u64 * GOT_SLOT_SIZE
    }

    pub fn plt_size(&self) -> u64 {
        self.names.len() as u64 * PLT_STUB_SIZE
    }

    pub fn set_bases(&mut self, got_base: u64, plt_base: u64) {
        self.got_base = got_base;
        self.plt_base = plt_base;
    }

    /// Refresh a target address after the layout shifted.
    pub fn set_value(&mut self, name: &str, value: u64) {
        if let Some(slot) = self.index.get(name) {
            self.values[*slot] = value;
        }
    }

    pub fn got_slot_addr(&self, name: &str) -> Option<u64> {
        self.index
            .get(name)
            .map(|slot| self.got_base + *slot as u64 * GOT_SLOT_SIZE)
    }

    pub fn plt_stub_addr(&self, name: &str) -> Option<u64> {
        self.index
            .get(name)
            .map(|slot| self.plt_base + *slot as u64 * PLT_STUB_SIZE)
    }

    /// The `.got` payload: little-endian absolute target addresses.
    pub fn got_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.got_size() as usize);
        for value in &self.values {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// The `.plt` payload: one stub per slot, each jumping indirect
    /// through its paired GOT entry.
    pub fn plt_bytes(&self, arch: Arch) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.plt_size() as usize);
        for slot in 0..self.names.len() {
            let stub_addr = self.plt_base + slot as u64 * PLT_STUB_SIZE;
            let slot_addr = self.got_base + slot as u64 * GOT_SLOT_SIZE;
            match arch {
                Arch::X86_64 => {
                    // jmpq *disp32(%rip); the displacement is relative to
                    // the end of the 6-byte instruction
                    let disp = slot_addr as i64 - (stub_addr as i64 + 6);
                    out.push(0xff);
                    out.push(0x25);
                    out.extend_from_slice(&(disp as i32).to_le_bytes());
                    // pad to 16 bytes with nops
                    out.extend_from_slice(&[0x90; 10]);
                }
                Arch::Aarch64 => {
                    // adrp x16, page(slot); ldr x17, [x16, lo12(slot)];
                    // br x17; nop
                    let pages = ((slot_addr & !0xfff) as i64 - (stub_addr & !0xfff) as i64) >> 12;
                    let adrp = 0x9000_0010u32
                        | (((pages & 3) as u32) << 29)
                        | ((((pages >> 2) & 0x7ffff) as u32) << 5);
                    let ldr = 0xf940_0211u32 | ((((slot_addr & 0xfff) >> 3) as u32) << 10);
                    let br = 0xd61f_0220u32;
                    let nop = 0xd503_201fu32;
                    out.extend_from_slice(&adrp.to_le_bytes());
                    out.extend_from_slice(&ldr.to_le_bytes());
                    out.extend_from_slice(&br.to_le_bytes());
                    out.extend_from_slice(&nop.to_le_bytes());
                }
            }
        }
        out
    }
}
