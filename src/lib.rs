pub mod archive;
pub mod elf;
pub mod intern;
pub mod link;
pub mod merge;
pub mod nm;
pub mod objdump;
pub mod object;
pub mod reader;
pub mod reloc;
pub mod resolve;
pub mod strip;
pub mod thunk;
pub mod writer;

#[cfg(test)]
pub mod testutil;
