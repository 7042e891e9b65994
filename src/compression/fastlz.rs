//! LZ77-class byte-block compressor for stored document text. Literal runs
//! of up to 32 bytes, back-references with a 5-bit length (extension byte
//! beyond 264 total) and 13-bit distance, 8 KiB window.

const MAX_COPY: usize = 32;
const MAX_LEN: usize = 264;
const MAX_DIST: usize = 8192;

const HASH_LOG: u32 = 13;
const HASH_SIZE: usize = 1 << HASH_LOG;
const HASH_MASK: usize = HASH_SIZE - 1;

#[inline]
fn hash(p: &[u8]) -> usize {
    let p1 = p[0] as u16;
    let p2 = p[1] as u16;
    let p3 = p[2] as u16;
    let mut v = p1 | (p2 << 8);
    v ^= (p2 | (p3 << 8)) ^ (v >> (16 - HASH_LOG));
    v as usize & HASH_MASK
}

/// Compress `input`. Returns `None` when the data is incompressible within
/// a `len + len/20` output budget, in which case the caller stores it raw.
pub fn compress(input: &[u8]) -> Option<Vec<u8>> {
    let length = input.len();
    if length == 0 {
        return None;
    }

    let budget = length + length / 20 + 1;
    let mut out: Vec<u8> = Vec::with_capacity(budget);

    if length < 4 {
        // literal run only
        out.push((length - 1) as u8);
        out.extend_from_slice(input);
        return Some(out);
    }

    let ip_bound = length - 2;
    let ip_limit = length.saturating_sub(12);

    let mut htab = [0usize; HASH_SIZE];

    // start with a literal copy
    let mut copy = 2usize;
    out.push((MAX_COPY - 1) as u8);
    out.push(input[0]);
    out.push(input[1]);
    let mut ip = 2usize;

    while ip < ip_limit {
        if out.len() + 4 > budget {
            return None;
        }

        let anchor = ip;
        let hval = hash(&input[ip..]);
        let r = htab[hval];
        let distance = anchor - r;
        htab[hval] = anchor;

        let is_match = distance != 0
            && distance < MAX_DIST
            && input[r] == input[ip]
            && input[r + 1] == input[ip + 1]
            && input[r + 2] == input[ip + 2];

        if !is_match {
            out.push(input[anchor]);
            ip = anchor + 1;
            copy += 1;
            if copy == MAX_COPY {
                copy = 0;
                out.push((MAX_COPY - 1) as u8);
            }
            continue;
        }

        // extend the match past the first three bytes
        ip = anchor + 3;
        let mut r = r + 3;
        while ip < ip_bound && input[r] == input[ip] {
            r += 1;
            ip += 1;
        }

        let distance = distance - 1;

        if copy > 0 {
            let at = out.len() - copy - 1;
            out[at] = (copy - 1) as u8;
        } else {
            out.pop();
        }
        copy = 0;

        // biased: 1 encodes a 3-byte match, and the decoder reproduces
        // len + 2 bytes per control
        let mut len = ip - anchor - 2;

        while len > MAX_LEN - 2 {
            out.push(((7 << 5) + (distance >> 8)) as u8);
            out.push((MAX_LEN - 2 - 7 - 2) as u8);
            out.push((distance & 255) as u8);
            len -= MAX_LEN - 2;
            if out.len() + 4 > budget {
                return None;
            }
        }

        if len < 7 {
            out.push(((len << 5) + (distance >> 8)) as u8);
            out.push((distance & 255) as u8);
        } else {
            out.push(((7 << 5) + (distance >> 8)) as u8);
            out.push((len - 7) as u8);
            out.push((distance & 255) as u8);
        }

        // refresh the hash over the last two consumed positions
        htab[hash(&input[ip - 2..])] = ip - 2;
        htab[hash(&input[ip - 1..])] = ip - 1;

        out.push((MAX_COPY - 1) as u8);
    }

    // left-over as literal copy
    while ip < length {
        if out.len() + 2 > budget {
            return None;
        }
        out.push(input[ip]);
        ip += 1;
        copy += 1;
        if copy == MAX_COPY {
            copy = 0;
            out.push((MAX_COPY - 1) as u8);
        }
    }

    if copy > 0 {
        let at = out.len() - copy - 1;
        out[at] = (copy - 1) as u8;
    } else {
        out.pop();
    }

    if out.len() > budget {
        return None;
    }

    Some(out)
}

/// Decompress into a buffer of exactly `max_out` bytes. Returns `None` on a
/// malformed stream (reference before start, overrun of either buffer).
pub fn decompress(input: &[u8], max_out: usize) -> Option<Vec<u8>> {
    if input.is_empty() {
        return Some(Vec::new());
    }

    let mut out: Vec<u8> = Vec::with_capacity(max_out);
    let mut ip = 0usize;
    let mut ctrl = (input[ip] & 31) as usize;
    ip += 1;
    let mut more = true;

    while more {
        if ctrl >= 32 {
            let mut len = (ctrl >> 5) - 1;
            let mut ofs = (ctrl & 31) << 8;

            if len == 7 - 1 {
                len += *input.get(ip)? as usize;
                ip += 1;
            }
            ofs += *input.get(ip)? as usize;
            ip += 1;

            let r = out.len().checked_sub(ofs + 1)?;
            if out.len() + len + 3 > max_out {
                return None;
            }

            if ip < input.len() {
                ctrl = input[ip] as usize;
                ip += 1;
            } else {
                more = false;
            }

            for i in 0..len + 3 {
                let b = out[r + i];
                out.push(b);
            }
        } else {
            let run = ctrl + 1;
            if out.len() + run > max_out || ip + run > input.len() {
                return None;
            }
            out.extend_from_slice(&input[ip..ip + run]);
            ip += run;

            more = ip < input.len();
            if more {
                ctrl = input[ip] as usize;
                ip += 1;
            }
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(data: &[u8]) {
        match compress(data) {
            Some(packed) => {
                let restored = decompress(&packed, data.len()).unwrap();
                assert_eq!(restored, data);
            }
            None => assert!(!data.is_empty()),
        }
    }

    #[test]
    fn tiny_inputs() {
        round_trip(b"");
        round_trip(b"a");
        round_trip(b"ab");
        round_trip(b"abc");
    }

    #[test]
    fn repetitive_text_shrinks() {
        let data = b"ATGCATGCATGCATGCATGCATGCATGCATGCATGCATGC".repeat(20);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn flat_file_record() {
        let data = b"ID   CRAM_CRAAB              Reviewed;          46 AA.\n\
                     AC   P01542;\n\
                     DT   21-JUL-1986, integrated into UniProtKB/Swiss-Prot.\n\
                     SQ   SEQUENCE   46 AA;  4736 MW;  D6A1E39A7F2F3E4C CRC64;\n"
            .repeat(8);
        round_trip(&data);
    }

    #[test]
    fn long_runs() {
        round_trip(&vec![0u8; 10_000]);
        round_trip(&[b"x".repeat(500), b"y".repeat(500)].concat());
    }

    #[test]
    fn random_bytes_round_trip_or_bail() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(99);
        for len in [5usize, 64, 1000, 9000] {
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            round_trip(&data);
        }
    }

    #[test]
    fn truncated_stream_fails() {
        let data = b"ATGCATGCATGCATGCATGCATGCATGCATGC".repeat(10);
        let packed = compress(&data).unwrap();
        assert!(decompress(&packed[..packed.len() / 2], data.len()).is_none());
    }
}
