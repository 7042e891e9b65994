use crate::storage::PageKind;

/// Per-entry payload of a leaf page. Branch pages always carry `u32` child
/// pointers through the same accessors.
pub trait IndexValue: Clone + Send + Sync + 'static {
    const SIZE: usize;
    const LEAF_KIND: PageKind;

    fn write(&self, out: &mut [u8]);
    fn read(data: &[u8]) -> Self;
}

impl IndexValue for u32 {
    const SIZE: usize = 4;
    const LEAF_KIND: PageKind = PageKind::LeafSimple;

    fn write(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn read(data: &[u8]) -> Self {
        u32::from_le_bytes(data[..4].try_into().unwrap())
    }
}

/// Posting-list envelope: the 20 bytes either hold the compressed bits
/// themselves (byte 0 high bit set, bits in bytes 1..20) or a pointer into
/// the bit-vector page chain (byte 0 zero, page nr big-endian in bytes 1..5,
/// byte offset in bytes 5..10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingsEnvelope(pub [u8; 20]);

impl PostingsEnvelope {
    pub fn is_inline(&self) -> bool {
        self.0[0] & 0x80 != 0
    }
}

/// Value of a character multi / weighted leaf: doc count plus the envelope.
#[derive(Debug, Clone, Copy)]
pub struct MultiData {
    pub count: u32,
    pub bits: PostingsEnvelope,
}

impl IndexValue for MultiData {
    const SIZE: usize = 24;
    const LEAF_KIND: PageKind = PageKind::LeafMulti;

    fn write(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.count.to_le_bytes());
        out[4..24].copy_from_slice(&self.bits.0);
    }

    fn read(data: &[u8]) -> Self {
        let mut bits = [0u8; 20];
        bits.copy_from_slice(&data[4..24]);
        MultiData {
            count: u32::from_le_bytes(data[..4].try_into().unwrap()),
            bits: PostingsEnvelope(bits),
        }
    }
}

/// Value of a phrase-capable leaf: as [`MultiData`], plus the byte offset of
/// this key's per-document position arrays in the companion `.idl` file.
#[derive(Debug, Clone, Copy)]
pub struct MultiIdlData {
    pub count: u32,
    pub bits: PostingsEnvelope,
    pub idl_offset: i64,
}

impl IndexValue for MultiIdlData {
    const SIZE: usize = 32;
    const LEAF_KIND: PageKind = PageKind::LeafMultiIdl;

    fn write(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.count.to_le_bytes());
        out[4..24].copy_from_slice(&self.bits.0);
        out[24..32].copy_from_slice(&self.idl_offset.to_le_bytes());
    }

    fn read(data: &[u8]) -> Self {
        let mut bits = [0u8; 20];
        bits.copy_from_slice(&data[4..24]);
        MultiIdlData {
            count: u32::from_le_bytes(data[..4].try_into().unwrap()),
            bits: PostingsEnvelope(bits),
            idl_offset: i64::from_le_bytes(data[24..32].try_into().unwrap()),
        }
    }
}
