use roaring::RoaringBitmap;

use crate::bitstream::{IbitStream, ObitStream};
use crate::core::error::{Error, Result};
use crate::core::types::DocNr;

struct Selector {
    databits: i32,
    span: u32,
}

/// Selector 0 resets the width to 32 bits; the others nudge it by up to
/// three bits while covering runs of 1, 2 or 4 deltas.
const SELECTORS: [Selector; 16] = [
    Selector { databits: 0, span: 1 },
    Selector { databits: -3, span: 1 },
    Selector { databits: -2, span: 1 },
    Selector { databits: -2, span: 2 },
    Selector { databits: -1, span: 1 },
    Selector { databits: -1, span: 2 },
    Selector { databits: -1, span: 4 },
    Selector { databits: 0, span: 1 },
    Selector { databits: 0, span: 2 },
    Selector { databits: 0, span: 4 },
    Selector { databits: 1, span: 1 },
    Selector { databits: 1, span: 2 },
    Selector { databits: 1, span: 4 },
    Selector { databits: 2, span: 1 },
    Selector { databits: 2, span: 2 },
    Selector { databits: 3, span: 1 },
];

const MAX_WIDTH: i32 = 32;
const START_WIDTH: i32 = MAX_WIDTH / 2;

/// Pick the selector with the best yield for the buffered deltas, or 0
/// (width reset) when nothing else fits.
fn select(bits_needed: &[i32; 4], count: u32, width: i32) -> usize {
    let mut result = 0;
    let mut best = bits_needed[0] - MAX_WIDTH;

    for (i, sel) in SELECTORS.iter().enumerate().skip(1) {
        if sel.span > count {
            continue;
        }

        let w = width + sel.databits;
        if w > MAX_WIDTH || w < 0 {
            continue;
        }

        let mut fits = true;
        let mut waste = 0;
        for j in 0..sel.span as usize {
            fits = fits && bits_needed[j] <= w;
            waste += w - bits_needed[j];
        }
        if !fits {
            continue;
        }

        let yield_ = (sel.span as i32 - 1) * 4 - waste;
        if yield_ > best {
            result = i;
            best = yield_;
        }
    }

    result
}

/// Encode a strictly ascending sequence of positive integers as selector
/// groups, without a count prefix. The count must be stored elsewhere.
pub fn compress_array(bits: &mut ObitStream, values: &[DocNr]) -> Result<()> {
    let mut width = START_WIDTH;
    let mut last = 0u32;

    let mut bn = [0i32; 4];
    let mut dv = [0u32; 4];
    let mut bc = 0usize;
    let mut idx = 0usize;

    while idx < values.len() || bc > 0 {
        while bc < 4 && idx < values.len() {
            let next = values[idx];
            idx += 1;
            if next <= last {
                return Err(Error::invariant(
                    "posting list must be strictly ascending and positive",
                ));
            }
            let delta = next - last - 1;
            last = next;
            dv[bc] = delta;
            bn[bc] = (32 - delta.leading_zeros()) as i32;
            bc += 1;
        }

        let s = select(&bn, bc as u32, width);
        if s == 0 {
            width = MAX_WIDTH;
        } else {
            width += SELECTORS[s].databits;
        }

        let n = SELECTORS[s].span as usize;
        bits.write_binary(4, s as u64)?;
        if width > 0 {
            for &delta in dv.iter().take(n) {
                bits.write_binary(width as u32, u64::from(delta))?;
            }
        }

        bc -= n;
        if bc > 0 {
            for i in 0..(4 - n) {
                bn[i] = bn[i + n];
                dv[i] = dv[i + n];
            }
        }
    }

    Ok(())
}

/// Array wire format: gamma-coded count followed by the selector groups.
pub fn write_array(bits: &mut ObitStream, values: &[DocNr]) -> Result<()> {
    if values.is_empty() {
        return Err(Error::invariant("cannot write an empty array"));
    }
    bits.write_gamma(values.len() as u64)?;
    compress_array(bits, values)
}

/// Read back an array written by [`write_array`].
pub fn read_array(bits: &mut IbitStream) -> Result<Vec<DocNr>> {
    let size = bits.read_gamma()? as u32;
    let mut out = Vec::with_capacity(size as usize);

    let mut iter = RawArrayDecoder::new(size);
    while let Some(v) = iter.next(bits)? {
        out.push(v);
    }

    Ok(out)
}

/// Decode an array written by [`write_array`] directly into a bitmap,
/// counting bits that were newly set. Values above `max_value` end the scan.
pub fn read_array_into_bitmap(
    bits: &mut IbitStream,
    bitmap: &mut RoaringBitmap,
    max_value: DocNr,
) -> Result<(u32, u32)> {
    let size = bits.read_gamma()? as u32;
    let updated = read_simple_array_into_bitmap(bits, size, bitmap, max_value)?;
    Ok((size, updated))
}

/// Bitmap decode of a count-less selector stream; the count comes from the
/// caller (the leaf entry stores it).
pub fn read_simple_array_into_bitmap(
    bits: &mut IbitStream,
    count: u32,
    bitmap: &mut RoaringBitmap,
    max_value: DocNr,
) -> Result<u32> {
    let mut updated = 0;
    let mut iter = RawArrayDecoder::new(count);
    while let Some(v) = iter.next(bits)? {
        if v > max_value {
            break;
        }
        if bitmap.insert(v) {
            updated += 1;
        }
    }
    Ok(updated)
}

/// Shared decoder state for the selector-group stream.
pub(crate) struct RawArrayDecoder {
    count: u32,
    width: i32,
    span: u32,
    current: u32,
}

impl RawArrayDecoder {
    pub(crate) fn new(count: u32) -> Self {
        RawArrayDecoder { count, width: START_WIDTH, span: 0, current: 0 }
    }

    pub(crate) fn next(&mut self, bits: &mut IbitStream) -> Result<Option<DocNr>> {
        if self.count == 0 {
            return Ok(None);
        }

        if self.span == 0 {
            let selector = bits.read_binary(4)? as usize;
            self.span = SELECTORS[selector].span;
            if selector == 0 {
                self.width = MAX_WIDTH;
            } else {
                self.width += SELECTORS[selector].databits;
            }
            if self.width < 0 || self.width > MAX_WIDTH {
                return Err(Error::corruption("selector width out of range"));
            }
        }

        if self.width > 0 {
            let delta = bits.read_binary(self.width as u32)? as u32;
            self.current = self.current.wrapping_add(delta);
        }
        self.current = self.current.wrapping_add(1);

        self.span -= 1;
        self.count -= 1;

        Ok(Some(self.current))
    }
}

/// Streaming decoder over a compressed posting list of known length.
pub struct CompressedArrayIterator {
    bits: IbitStream,
    decoder: RawArrayDecoder,
}

impl CompressedArrayIterator {
    pub fn new(bits: IbitStream, length: u32) -> Self {
        CompressedArrayIterator { bits, decoder: RawArrayDecoder::new(length) }
    }

    pub fn next(&mut self) -> Result<Option<DocNr>> {
        self.decoder.next(&mut self.bits)
    }

    pub fn remaining(&self) -> u32 {
        self.decoder.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(values: &[u32]) {
        let mut bits = ObitStream::new();
        write_array(&mut bits, values).unwrap();
        bits.sync().unwrap();

        let mut ibits = IbitStream::from_obit(&bits).unwrap();
        assert_eq!(read_array(&mut ibits).unwrap(), values);
    }

    #[test]
    fn array_of_multiples_of_twenty() {
        let values: Vec<u32> = (1..=1000).map(|i| i * 20).collect();
        round_trip(&values);
    }

    #[test]
    fn irregular_array() {
        let values = [
            3458u32, 3483, 3600, 5200, 5217, 5272, 5280, 5297, 5343, 5386, 5475, 5490,
            5536, 5572, 5596, 5661, 5679, 5721, 5742, 6519, 6520, 6521, 6522,
        ];
        round_trip(&values);
    }

    #[test]
    fn small_arrays() {
        round_trip(&[3]);
        round_trip(&[1, 2, 5, 8, 9]);
        round_trip(&[1, 2, 4, 5, 8, 9]);
        round_trip(&[294, 771]);
        round_trip(&[1]);
        round_trip(&[u32::MAX]);
    }

    #[test]
    fn consecutive_arrays_in_one_stream() {
        let mut bits = ObitStream::new();
        let arrays: Vec<Vec<u32>> = (0..10)
            .map(|i| {
                let start = 100 + i * 13;
                (start..start + 100 + i * 13).collect()
            })
            .collect();
        for a in &arrays {
            write_array(&mut bits, a).unwrap();
        }
        bits.sync().unwrap();

        let mut ibits = IbitStream::from_obit(&bits).unwrap();
        for a in &arrays {
            assert_eq!(&read_array(&mut ibits).unwrap(), a);
        }
    }

    #[test]
    fn streaming_iterator_matches_vector_decode() {
        let values = [3458u32, 3483, 3600, 5200, 5217, 6519, 6520, 6521, 6522];
        let mut bits = ObitStream::new();
        compress_array(&mut bits, &values).unwrap();
        bits.sync().unwrap();

        let ibits = IbitStream::from_obit(&bits).unwrap();
        let mut iter = CompressedArrayIterator::new(ibits, values.len() as u32);
        let mut decoded = Vec::new();
        while let Some(v) = iter.next().unwrap() {
            decoded.push(v);
        }
        assert_eq!(decoded, values);
    }

    #[test]
    fn rejects_unsorted_input() {
        let mut bits = ObitStream::new();
        assert!(write_array(&mut bits, &[5, 3]).is_err());
        assert!(write_array(&mut bits, &[0, 3]).is_err());
        assert!(write_array(&mut bits, &[]).is_err());
    }

    #[test]
    fn bitmap_decode_counts_new_bits() {
        let values = [2u32, 7, 9, 40, 41];
        let mut bits = ObitStream::new();
        write_array(&mut bits, &values).unwrap();
        bits.sync().unwrap();

        let mut bitmap = RoaringBitmap::new();
        bitmap.insert(7);
        let mut ibits = IbitStream::from_obit(&bits).unwrap();
        let (count, updated) = read_array_into_bitmap(&mut ibits, &mut bitmap, 100).unwrap();
        assert_eq!(count, 5);
        assert_eq!(updated, 4);
        for &v in &values {
            assert!(bitmap.contains(v));
        }
    }

    #[test]
    fn random_sequences_round_trip() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x5eeb);
        for _ in 0..50 {
            let len = rng.gen_range(1..500);
            let mut v = Vec::with_capacity(len);
            let mut cur = 0u32;
            for _ in 0..len {
                cur = cur.saturating_add(rng.gen_range(1..10_000));
                v.push(cur);
            }
            round_trip(&v);
        }
    }
}
