use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::{Error, Result};

/// Bytes kept on the stream itself before spilling to a backing buffer.
const INLINE_SIZE: usize = 22;

/// Flush unit of the file backing.
const FILE_BUFFER_SIZE: usize = 16384;

struct FileBacking {
    file: File,
    buffer: Vec<u8>,
    written: u64,
}

impl FileBacking {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut data = data;
        loop {
            let free = FILE_BUFFER_SIZE - self.buffer.len();
            if data.len() <= free {
                self.buffer.extend_from_slice(data);
                return Ok(());
            }
            self.buffer.extend_from_slice(&data[..free]);
            data = &data[free..];
            self.file
                .write_all(&self.buffer)
                .map_err(|e| Error::io(e, "bit stream flush"))?;
            self.written += self.buffer.len() as u64;
            self.buffer.clear();
        }
    }

    fn sync(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file
                .write_all(&self.buffer)
                .map_err(|e| Error::io(e, "bit stream sync"))?;
            self.written += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.written + self.buffer.len() as u64
    }
}

#[derive(Clone, Default)]
enum Backing {
    #[default]
    None,
    Mem(Arc<Vec<u8>>),
    File(Arc<Mutex<FileBacking>>),
}

/// Append-only bit sink, MSB-first within each byte.
///
/// Bits accumulate in a small inline region and spill to either a growable
/// in-memory buffer or a buffered file. Cloning shares the spilled backing;
/// a clone that keeps writing copies the memory backing first.
#[derive(Clone)]
pub struct ObitStream {
    backing: Backing,
    data: [u8; INLINE_SIZE],
    byte_offset: usize,
    bit_offset: i8,
    synced_bits: Option<u64>,
}

impl Default for ObitStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ObitStream {
    pub fn new() -> Self {
        ObitStream {
            backing: Backing::None,
            data: [0; INLINE_SIZE],
            byte_offset: 0,
            bit_offset: 7,
            synced_bits: None,
        }
    }

    /// A sink that spills to `file` in 16 KiB units.
    pub fn to_file(file: File) -> Self {
        ObitStream {
            backing: Backing::File(Arc::new(Mutex::new(FileBacking {
                file,
                buffer: Vec::with_capacity(FILE_BUFFER_SIZE),
                written: 0,
            }))),
            data: [0; INLINE_SIZE],
            byte_offset: 0,
            bit_offset: 7,
            synced_bits: None,
        }
    }

    pub fn write_bit(&mut self, bit: bool) -> Result<()> {
        self.synced_bits = None;
        if bit {
            self.data[self.byte_offset] |= 1 << self.bit_offset;
        }
        self.bit_offset -= 1;
        if self.bit_offset < 0 {
            self.byte_offset += 1;
            self.bit_offset = 7;
            if self.byte_offset >= INLINE_SIZE {
                self.overflow()?;
            }
            self.data[self.byte_offset] = 0;
        }
        Ok(())
    }

    /// Append the low `n_bits` of `value`, most-significant bit first.
    pub fn write_binary(&mut self, n_bits: u32, value: u64) -> Result<()> {
        debug_assert!(n_bits >= 1 && n_bits <= 64);
        let mut n = n_bits;
        while n > 0 {
            n -= 1;
            self.write_bit(value & (1u64 << n) != 0)?;
        }
        Ok(())
    }

    /// Elias gamma. Not defined for 0.
    pub fn write_gamma(&mut self, value: u64) -> Result<()> {
        debug_assert!(value > 0);
        let mut v = value;
        let mut e = 0u32;
        while v > 1 {
            v >>= 1;
            e += 1;
            self.write_bit(true)?;
        }
        self.write_bit(false)?;
        let mut b = 1u64 << e;
        while e > 0 {
            e -= 1;
            b >>= 1;
            self.write_bit(value & b != 0)?;
        }
        Ok(())
    }

    /// Append a whole byte starting at the current bit position.
    pub(crate) fn add_byte(&mut self, byte: u8) -> Result<()> {
        self.synced_bits = None;
        self.data[self.byte_offset] |= byte >> (7 - self.bit_offset);
        self.byte_offset += 1;
        if self.byte_offset >= INLINE_SIZE {
            self.overflow()?;
        }
        // shifting by 8 would be UB in C, here it is just wrong: mask it out
        self.data[self.byte_offset] = if self.bit_offset == 7 {
            0
        } else {
            byte << (1 + self.bit_offset)
        };
        Ok(())
    }

    fn overflow(&mut self) -> Result<()> {
        if matches!(self.backing, Backing::None) {
            self.backing = Backing::Mem(Arc::new(Vec::new()));
        }
        if self.byte_offset > 0 {
            let (data, n) = (self.data, self.byte_offset);
            match &mut self.backing {
                Backing::None => unreachable!(),
                Backing::Mem(buf) => Arc::make_mut(buf).extend_from_slice(&data[..n]),
                Backing::File(backing) => backing.lock().write(&data[..n])?,
            }
            self.byte_offset = 0;
        }
        Ok(())
    }

    /// Emit a terminating 0 bit, pad with 1 bits to the byte boundary and
    /// flush. The pre-padding bit length is recorded and `bit_size` keeps
    /// returning it.
    pub fn sync(&mut self) -> Result<()> {
        let exact = self.live_bit_size();
        self.write_bit(false)?;
        while self.bit_offset != 7 {
            self.write_bit(true)?;
        }
        self.overflow()?;
        if let Backing::File(backing) = &self.backing {
            backing.lock().sync()?;
        }
        self.synced_bits = Some(exact);
        Ok(())
    }

    fn backing_size(&self) -> u64 {
        match &self.backing {
            Backing::None => 0,
            Backing::Mem(buf) => buf.len() as u64,
            Backing::File(backing) => backing.lock().size(),
        }
    }

    fn live_bit_size(&self) -> u64 {
        (self.backing_size() + self.byte_offset as u64) * 8 + (7 - self.bit_offset) as u64
    }

    /// Exact number of content bits: the live count while writing, the
    /// recorded pre-padding count once synced.
    pub fn bit_size(&self) -> u64 {
        self.synced_bits.unwrap_or_else(|| self.live_bit_size())
    }

    /// Bytes occupied, including the current partial byte.
    pub fn byte_size(&self) -> u64 {
        self.backing_size() + self.byte_offset as u64 + u64::from(self.bit_offset != 7)
    }

    pub fn is_empty(&self) -> bool {
        self.bit_size() == 0
    }

    pub fn clear(&mut self) {
        self.backing = Backing::None;
        self.data[0] = 0;
        self.byte_offset = 0;
        self.bit_offset = 7;
        self.synced_bits = None;
    }

    /// Every byte written so far, spilled backing first, then the inline
    /// region including the current partial byte. File-backed streams cannot
    /// be read back this way.
    pub(crate) fn bytes(&self) -> Result<Vec<u8>> {
        let mut out = match &self.backing {
            Backing::None => Vec::new(),
            Backing::Mem(buf) => buf.as_ref().clone(),
            Backing::File(_) => {
                return Err(Error::invariant("cannot read back a file-backed bit stream"))
            }
        };
        let partial = usize::from(self.bit_offset != 7);
        out.extend_from_slice(&self.data[..self.byte_offset + partial]);
        Ok(out)
    }
}
