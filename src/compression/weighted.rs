use crate::bitstream::{IbitStream, ObitStream};
use crate::core::error::{Error, Result};
use crate::core::types::{DocNr, MAX_WEIGHT};

use super::selector::{write_array, RawArrayDecoder};

/// Encode a weighted posting list: weight classes in descending weight
/// order, each class a gamma-coded weight (first absolute, then positive
/// decrements) followed by its doc-nrs as a counted compressed array.
/// Doc-nrs are ascending within a class so the array codec invariant holds.
pub fn write_weighted_list(bits: &mut ObitStream, entries: &[(DocNr, u8)]) -> Result<()> {
    if entries.is_empty() {
        return Err(Error::invariant("cannot write an empty weighted list"));
    }

    let mut sorted = entries.to_vec();
    for &(doc, weight) in &sorted {
        if doc == 0 || weight == 0 || weight > MAX_WEIGHT {
            return Err(Error::invariant("weighted entry out of range"));
        }
    }
    sorted.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut last_weight = sorted[0].1;
    bits.write_gamma(u64::from(last_weight))?;

    let mut i = 0;
    let mut docs = Vec::new();
    while i < sorted.len() {
        let weight = sorted[i].1;
        docs.clear();
        while i < sorted.len() && sorted[i].1 == weight {
            docs.push(sorted[i].0);
            i += 1;
        }

        let decrement = last_weight - weight;
        if decrement > 0 {
            bits.write_gamma(u64::from(decrement))?;
        }
        write_array(bits, &docs)?;
        last_weight = weight;
    }

    Ok(())
}

/// Streaming reader over a weighted posting list of known total length.
pub struct WeightedArrayIterator {
    bits: IbitStream,
    remaining: u32,
    weight: u8,
    class: Option<RawArrayDecoder>,
    started: bool,
}

impl WeightedArrayIterator {
    pub fn new(bits: IbitStream, length: u32) -> Self {
        WeightedArrayIterator {
            bits,
            remaining: length,
            weight: 0,
            class: None,
            started: false,
        }
    }

    pub fn next(&mut self) -> Result<Option<(DocNr, u8)>> {
        loop {
            if self.remaining == 0 {
                return Ok(None);
            }

            if let Some(decoder) = &mut self.class {
                if let Some(doc) = decoder.next(&mut self.bits)? {
                    self.remaining -= 1;
                    return Ok(Some((doc, self.weight)));
                }
                self.class = None;
            }

            // next class header
            let gamma = self.bits.read_gamma()?;
            if self.started {
                if gamma == 0 || gamma >= u64::from(self.weight) {
                    return Err(Error::corruption("weight classes must descend"));
                }
                self.weight -= gamma as u8;
            } else {
                if gamma == 0 || gamma > u64::from(MAX_WEIGHT) {
                    return Err(Error::corruption("first weight out of range"));
                }
                self.weight = gamma as u8;
                self.started = true;
            }

            let count = self.bits.read_gamma()? as u32;
            if count == 0 || count > self.remaining {
                return Err(Error::corruption("weight class count out of range"));
            }
            self.class = Some(RawArrayDecoder::new(count));
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(entries: &[(DocNr, u8)]) {
        let mut bits = ObitStream::new();
        write_weighted_list(&mut bits, entries).unwrap();
        bits.sync().unwrap();

        let ibits = IbitStream::from_obit(&bits).unwrap();
        let mut iter = WeightedArrayIterator::new(ibits, entries.len() as u32);
        let mut decoded = Vec::new();
        while let Some(pair) = iter.next().unwrap() {
            decoded.push(pair);
        }

        let mut expected = entries.to_vec();
        expected.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        assert_eq!(decoded, expected);
    }

    #[test]
    fn single_class() {
        round_trip(&[(1, 5), (7, 5), (9, 5)]);
    }

    #[test]
    fn descending_classes() {
        round_trip(&[(10, 31), (3, 31), (5, 17), (4, 17), (80, 1), (2, 1)]);
    }

    #[test]
    fn one_entry() {
        round_trip(&[(42, 7)]);
    }

    #[test]
    fn rejects_zero_weight_and_doc() {
        let mut bits = ObitStream::new();
        assert!(write_weighted_list(&mut bits, &[(1, 0)]).is_err());
        assert!(write_weighted_list(&mut bits, &[(0, 3)]).is_err());
        assert!(write_weighted_list(&mut bits, &[(1, 32)]).is_err());
        assert!(write_weighted_list(&mut bits, &[]).is_err());
    }
}
