use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("read of {want} bytes at offset {at:#x} runs past the end of the buffer ({len} bytes)")]
    Truncated { at: u64, want: u64, len: usize },
}

/// Bounds-checked little-endian cursor over a byte buffer. Every offset
/// coming from an ELF or archive header goes through here before it is
/// dereferenced; a bad offset surfaces as `Truncated`, never as a panic.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), Error> {
        if pos > self.buf.len() as u64 {
            return Err(Error::Truncated {
                at: pos,
                want: 0,
                len: self.buf.len(),
            });
        }
        self.pos = pos as usize;
        Ok(())
    }

    /// Borrow `want` bytes at `at` without moving the cursor.
    pub fn window(&self, at: u64, want: u64) -> Result<&'a [u8], Error> {
        let end = at.checked_add(want).ok_or(Error::Truncated {
            at,
            want,
            len: self.buf.len(),
        })?;
        if end > self.buf.len() as u64 {
            return Err(Error::Truncated {
                at,
                want,
                len: self.buf.len(),
            });
        }
        Ok(&self.buf[at as usize..end as usize])
    }

    fn take(&mut self, want: usize) -> Result<&'a [u8], Error> {
        let slice = self.window(self.pos as u64, want as u64)?;
        self.pos += want;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<(), Error> {
        out.copy_from_slice(self.take(out.len())?);
        Ok(())
    }

    /// Owned copy of `want` bytes at the cursor.
    pub fn read_bytes(&mut self, want: u64) -> Result<Vec<u8>, Error> {
        Ok(self.take(want as usize)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_advance_in_order() {
        let buf = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0xff];
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u16().unwrap(), 1);
        assert_eq!(r.read_u32().unwrap(), 2);
        assert_eq!(r.read_u8().unwrap(), 0xff);
        assert_eq!(r.pos(), 7);
    }

    #[test]
    fn out_of_bounds_read_is_an_error() {
        let buf = [0u8; 3];
        let mut r = Reader::new(&buf);
        assert!(r.read_u32().is_err());
        // the failed read must not move the cursor
        assert_eq!(r.pos(), 0);
        assert_eq!(r.read_u16().unwrap(), 0);
    }

    #[test]
    fn seek_past_end_is_an_error() {
        let buf = [0u8; 8];
        let mut r = Reader::new(&buf);
        assert!(r.seek(8).is_ok());
        assert!(r.seek(9).is_err());
    }

    #[test]
    fn window_checks_overflowing_ranges() {
        let buf = [0u8; 8];
        let r = Reader::new(&buf);
        assert!(r.window(4, 4).is_ok());
        assert!(r.window(4, 5).is_err());
        assert!(r.window(u64::MAX, 2).is_err());
    }
}
