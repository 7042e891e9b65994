use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::core::error::{Error, Result};

use super::obit::ObitStream;

/// Default refill size for file-backed cursors.
pub const DEFAULT_BIT_BUFFER_SIZE: usize = 4096;

/// Byte supplier behind an [`IbitStream`]. Reading past the end of the data
/// yields zero bytes; gamma loops at sync boundaries terminate on them.
pub trait BitSource: Send {
    fn next_byte(&mut self) -> Result<u8>;
    fn clone_source(&self) -> Box<dyn BitSource>;
}

struct MemSource {
    data: Arc<Vec<u8>>,
    pos: usize,
}

impl BitSource for MemSource {
    fn next_byte(&mut self) -> Result<u8> {
        match self.data.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => Ok(0),
        }
    }

    fn clone_source(&self) -> Box<dyn BitSource> {
        Box::new(MemSource { data: self.data.clone(), pos: self.pos })
    }
}

struct FileSource {
    file: Arc<File>,
    offset: u64,
    buffer: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl BitSource for FileSource {
    fn next_byte(&mut self) -> Result<u8> {
        if self.pos >= self.buffer.len() {
            self.buffer.resize(self.chunk, 0);
            let n = self
                .file
                .read_at(&mut self.buffer, self.offset)
                .map_err(|e| Error::io(e, "bit stream read"))?;
            self.buffer.truncate(n);
            self.offset += n as u64;
            self.pos = 0;
            if n == 0 {
                return Ok(0);
            }
        }
        let b = self.buffer[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn clone_source(&self) -> Box<dyn BitSource> {
        Box::new(FileSource {
            file: self.file.clone(),
            offset: self.offset,
            buffer: self.buffer[self.pos..].to_vec(),
            pos: 0,
            chunk: self.chunk,
        })
    }
}

/// Cursor over a bit stream, MSB-first.
pub struct IbitStream {
    source: Box<dyn BitSource>,
    byte: u8,
    bit_offset: i8,
}

impl Clone for IbitStream {
    fn clone(&self) -> Self {
        IbitStream {
            source: self.source.clone_source(),
            byte: self.byte,
            bit_offset: self.bit_offset,
        }
    }
}

impl IbitStream {
    pub fn from_source(mut source: Box<dyn BitSource>) -> Result<Self> {
        let byte = source.next_byte()?;
        Ok(IbitStream { source, byte, bit_offset: 7 })
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_source(Box::new(MemSource { data: Arc::new(data), pos: 0 }))
    }

    /// Cursor over everything written to `bits` so far, synced or not.
    pub fn from_obit(bits: &ObitStream) -> Result<Self> {
        Self::from_bytes(bits.bytes()?)
    }

    /// Cursor over a file region starting at `offset`.
    pub fn from_file(file: Arc<File>, offset: u64) -> Result<Self> {
        Self::from_source(Box::new(FileSource {
            file,
            offset,
            buffer: Vec::new(),
            pos: 0,
            chunk: DEFAULT_BIT_BUFFER_SIZE,
        }))
    }

    pub fn read_bit(&mut self) -> Result<u8> {
        let result = (self.byte >> self.bit_offset) & 1;
        self.bit_offset -= 1;
        if self.bit_offset < 0 {
            self.byte = self.source.next_byte()?;
            self.bit_offset = 7;
        }
        Ok(result)
    }

    pub fn read_binary(&mut self, n_bits: u32) -> Result<u64> {
        let mut value = 0u64;
        for _ in 0..n_bits {
            value = value << 1 | u64::from(self.read_bit()?);
        }
        Ok(value)
    }

    pub fn read_gamma(&mut self) -> Result<u64> {
        let mut value = 1u64;
        let mut e = 0u32;
        while self.read_bit()? == 1 {
            value <<= 1;
            e += 1;
            if value == 0 {
                return Err(Error::corruption("gamma run exceeds 64 bits"));
            }
        }
        let mut rest = 0u64;
        while e > 0 {
            e -= 1;
            rest = rest << 1 | u64::from(self.read_bit()?);
        }
        Ok(value + rest)
    }

    /// Consume the terminating 0 bit plus 1-padding written by
    /// [`ObitStream::sync`], leaving the cursor byte aligned.
    pub fn sync(&mut self) -> Result<()> {
        self.read_bit()?;
        while self.bit_offset != 7 {
            self.read_bit()?;
        }
        Ok(())
    }

    pub fn skip(&mut self, n_bits: u32) -> Result<()> {
        let mut n = n_bits;
        if n == 0 {
            return Ok(());
        }
        if n >= self.bit_offset as u32 + 1 {
            n -= self.bit_offset as u32 + 1;
            self.byte = self.source.next_byte()?;
            self.bit_offset = 7;
        }
        while n >= 8 {
            n -= 8;
            self.byte = self.source.next_byte()?;
        }
        self.bit_offset -= n as i8;
        Ok(())
    }

    /// Read the next 8 bits as a byte, regardless of alignment.
    pub fn next_byte(&mut self) -> Result<u8> {
        let mut out = self.byte << (7 - self.bit_offset);
        self.byte = self.source.next_byte()?;
        if self.bit_offset < 7 {
            out |= self.byte >> (self.bit_offset + 1);
        }
        Ok(out)
    }
}
