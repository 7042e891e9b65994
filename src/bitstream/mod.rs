//! Bit-level I/O: append-only sinks, cursors, and the gamma/binary codecs
//! shared by the posting-list compression and the on-disk index formats.

mod ibit;
mod obit;

pub use ibit::{BitSource, IbitStream, DEFAULT_BIT_BUFFER_SIZE};
pub use obit::ObitStream;

use crate::core::error::Result;

/// Append `src` to `dst` prefixed with its gamma-coded bit length.
pub fn write_bits(dst: &mut ObitStream, src: &ObitStream) -> Result<()> {
    let length = src.bit_size();
    dst.write_gamma(length + 1)?;
    copy_bits(dst, src)
}

/// Read back a stream written by [`write_bits`].
pub fn read_bits(src: &mut IbitStream) -> Result<ObitStream> {
    let mut length = src.read_gamma()? - 1;
    let mut out = ObitStream::new();
    while length >= 8 {
        let byte = src.next_byte()?;
        out.add_byte(byte)?;
        length -= 8;
    }
    while length > 0 {
        let bit = src.read_bit()?;
        out.write_bit(bit != 0)?;
        length -= 1;
    }
    Ok(out)
}

/// Append the exact bits of `src` to `dst`, without a length prefix.
pub fn copy_bits(dst: &mut ObitStream, src: &ObitStream) -> Result<()> {
    let mut bits = IbitStream::from_obit(src)?;
    let mut count = src.bit_size();
    while count >= 8 {
        let byte = bits.next_byte()?;
        dst.add_byte(byte)?;
        count -= 8;
    }
    while count > 0 {
        let bit = bits.read_bit()?;
        dst.write_bit(bit != 0)?;
        count -= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_round_trip() {
        let mut bits = ObitStream::new();
        for i in 1u64..100 {
            bits.write_gamma(i).unwrap();
        }
        bits.sync().unwrap();

        let mut ibits = IbitStream::from_obit(&bits).unwrap();
        for i in 1u64..100 {
            assert_eq!(ibits.read_gamma().unwrap(), i);
        }
    }

    #[test]
    fn gamma_large_values() {
        let values = [1u64, 2, 3, 127, 128, 255, 1 << 20, (1 << 40) + 17, (1 << 62) + 3];
        let mut bits = ObitStream::new();
        for &v in &values {
            bits.write_gamma(v).unwrap();
        }
        bits.sync().unwrap();

        let mut ibits = IbitStream::from_obit(&bits).unwrap();
        for &v in &values {
            assert_eq!(ibits.read_gamma().unwrap(), v);
        }
    }

    #[test]
    fn binary_round_trip() {
        let mut bits = ObitStream::new();
        bits.write_binary(32, 0x0123_4567).unwrap();
        let mut ibits = IbitStream::from_obit(&bits).unwrap();
        assert_eq!(ibits.read_binary(32).unwrap(), 0x0123_4567);
    }

    #[test]
    fn binary_mixed_widths() {
        let cases: &[(u32, u64)] = &[
            (1, 1),
            (3, 5),
            (7, 99),
            (13, 8000),
            (32, 0xdead_beef),
            (64, 0x0123_4567_89ab_cdef),
        ];
        let mut bits = ObitStream::new();
        for &(n, v) in cases {
            bits.write_binary(n, v).unwrap();
        }
        bits.sync().unwrap();

        let mut ibits = IbitStream::from_obit(&bits).unwrap();
        for &(n, v) in cases {
            let mask = if n == 64 { u64::MAX } else { (1u64 << n) - 1 };
            assert_eq!(ibits.read_binary(n).unwrap(), v & mask);
        }
    }

    #[test]
    fn read_past_end_yields_zero() {
        let mut bits = ObitStream::new();
        bits.write_binary(4, 0b1111).unwrap();
        bits.sync().unwrap();

        let mut ibits = IbitStream::from_obit(&bits).unwrap();
        assert_eq!(ibits.read_binary(4).unwrap(), 0b1111);
        ibits.sync().unwrap();
        for _ in 0..64 {
            assert_eq!(ibits.read_bit().unwrap(), 0);
        }
    }

    #[test]
    fn copy_bits_is_exact() {
        // lengths straddling the inline buffer and byte boundaries
        for n in 1u32..200 {
            let mut bits = ObitStream::new();
            for _ in 0..n {
                bits.write_bit(true).unwrap();
            }

            let mut b2 = ObitStream::new();
            copy_bits(&mut b2, &bits).unwrap();
            assert_eq!(b2.bit_size(), n as u64);

            let mut ib = IbitStream::from_obit(&b2).unwrap();
            for _ in 0..n {
                assert_eq!(ib.read_bit().unwrap(), 1);
            }
            assert_eq!(ib.read_bit().unwrap(), 0);
        }
    }

    #[test]
    fn write_bits_round_trip() {
        let mut inner = ObitStream::new();
        for i in 1u64..50 {
            inner.write_gamma(i).unwrap();
        }

        let mut outer = ObitStream::new();
        write_bits(&mut outer, &inner).unwrap();
        outer.sync().unwrap();

        let mut ib = IbitStream::from_obit(&outer).unwrap();
        let mut restored = read_bits(&mut ib).unwrap();
        restored.sync().unwrap();

        let mut check = IbitStream::from_obit(&restored).unwrap();
        for i in 1u64..50 {
            assert_eq!(check.read_gamma().unwrap(), i);
        }
    }

    #[test]
    fn bit_size_counts_content_only() {
        let mut bits = ObitStream::new();
        for _ in 0..13 {
            bits.write_bit(true).unwrap();
        }
        assert_eq!(bits.bit_size(), 13);
        bits.sync().unwrap();
        assert_eq!(bits.bit_size(), 13);
        assert_eq!(bits.byte_size(), 2);
    }
}
