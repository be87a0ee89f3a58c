use crate::error::PlatenError;
use rayon::prelude::*;
use std::io::Read;

const ADLER_BASE: u32 = 65_521;

const CHUNK_BYTES: usize = 128 * 1024;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 258;
const MAX_DISTANCE: usize = 32 * 1024;
const MAX_CHAIN_STEPS: usize = 64;
const HASH_BITS: usize = 15;
const HASH_SIZE: usize = 1 << HASH_BITS;

const LENGTH_BASE: [usize; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];

const LENGTH_EXTRA_BITS: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];

const DIST_BASE: [usize; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];

const DIST_EXTRA_BITS: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

/// Compress with a zlib wrapper (fixed-Huffman DEFLATE blocks). Chunks are
/// tokenized in parallel but emitted in order, so the output is deterministic
/// across thread counts.
pub(crate) fn deflate(data: &[u8]) -> Vec<u8> {
    let chunks = split_ranges(data.len());

    let tokenized: Vec<Vec<Token>> = chunks
        .par_iter()
        .map(|(start, end)| tokenize_chunk(&data[*start..*end]))
        .collect();

    let adler = adler32(data);

    let mut bw = BitWriter::with_capacity(2 + data.len() / 2 + 64);
    // zlib header: CMF=0x78 (deflate, 32K window), FLG chosen for a valid FCHECK.
    bw.out.extend_from_slice(&[0x78, 0x01]);

    for (idx, tokens) in tokenized.iter().enumerate() {
        let final_block = idx + 1 == tokenized.len();
        encode_block(&mut bw, tokens, final_block);
    }

    let mut out = bw.finish();
    out.extend_from_slice(&adler.to_be_bytes());
    out
}

/// Decompress a zlib stream, as found in PNG `IDAT` payloads. The `format`
/// tag attributes failures to the decoder that owned the stream.
pub(crate) fn inflate(data: &[u8], format: &'static str) -> Result<Vec<u8>, PlatenError> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PlatenError::format(format, format!("corrupt zlib stream: {e}")))?;
    Ok(out)
}

#[derive(Clone, Copy, Debug)]
enum Token {
    Literal(u8),
    Match { len: u16, dist: u16 },
}

#[derive(Default)]
struct BitWriter {
    out: Vec<u8>,
    bit_buf: u64,
    bit_count: u8,
}

impl BitWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            out: Vec::with_capacity(capacity),
            bit_buf: 0,
            bit_count: 0,
        }
    }

    fn write_bits(&mut self, bits: u32, count: u8) {
        if count == 0 {
            return;
        }
        self.bit_buf |= (bits as u64) << self.bit_count;
        self.bit_count += count;
        while self.bit_count >= 8 {
            self.out.push((self.bit_buf & 0xFF) as u8);
            self.bit_buf >>= 8;
            self.bit_count -= 8;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bit_count > 0 {
            self.out.push((self.bit_buf & 0xFF) as u8);
        }
        self.out
    }
}

fn split_ranges(total_len: usize) -> Vec<(usize, usize)> {
    if total_len == 0 {
        return vec![(0, 0)];
    }
    let mut out = Vec::with_capacity(total_len.div_ceil(CHUNK_BYTES));
    let mut start = 0usize;
    while start < total_len {
        let end = (start + CHUNK_BYTES).min(total_len);
        out.push((start, end));
        start = end;
    }
    out
}

fn adler32(data: &[u8]) -> u32 {
    // Serial per chunk, merged with the standard combine identity; the split
    // keeps the mod-reduction windows small enough for u32 arithmetic.
    let partials: Vec<(u32, u32, usize)> = split_ranges(data.len())
        .par_iter()
        .map(|(start, end)| {
            let mut a: u32 = 1;
            let mut b: u32 = 0;
            for &byte in &data[*start..*end] {
                a += byte as u32;
                if a >= ADLER_BASE {
                    a -= ADLER_BASE;
                }
                b += a;
                b %= ADLER_BASE;
            }
            (a, b, end - start)
        })
        .collect();

    let (mut a, mut b, mut len) = (1u32, 0u32, 0usize);
    for (ra, rb, rlen) in partials {
        if len == 0 {
            a = ra;
            b = rb;
            len = rlen;
            continue;
        }
        if rlen == 0 {
            continue;
        }
        let merged_a = (a + ra + ADLER_BASE - 1) % ADLER_BASE;
        let merged_b = (b as u64
            + rb as u64
            + ((rlen as u64 % ADLER_BASE as u64) * ((a + ADLER_BASE - 1) as u64)))
            % ADLER_BASE as u64;
        a = merged_a;
        b = merged_b as u32;
        len += rlen;
    }
    (b << 16) | a
}

fn hash3(data: &[u8], i: usize) -> usize {
    let v = ((data[i] as u32) << 16) ^ ((data[i + 1] as u32) << 8) ^ (data[i + 2] as u32);
    (v.wrapping_mul(0x1E35_A7BD) >> (32 - HASH_BITS)) as usize
}

fn common_prefix(data: &[u8], a: usize, b: usize, max_len: usize) -> usize {
    let mut l = 0usize;
    while l < max_len && data[a + l] == data[b + l] {
        l += 1;
    }
    l
}

fn tokenize_chunk(data: &[u8]) -> Vec<Token> {
    let n = data.len();
    if n == 0 {
        return Vec::new();
    }

    let mut head = vec![-1_i32; HASH_SIZE];
    let mut prev = vec![-1_i32; n];
    let mut tokens = Vec::with_capacity(n / 2);

    let mut i = 0usize;
    while i < n {
        if i + MIN_MATCH > n {
            tokens.push(Token::Literal(data[i]));
            i += 1;
            continue;
        }

        let h = hash3(data, i);
        let mut cand = head[h];
        prev[i] = cand;
        head[h] = i as i32;

        let mut best_len = 0usize;
        let mut best_dist = 0usize;
        let mut steps = 0usize;

        while cand >= 0 && steps < MAX_CHAIN_STEPS {
            let c = cand as usize;
            let dist = i - c;
            if dist > MAX_DISTANCE {
                break;
            }

            if data[c] == data[i] && data[c + 1] == data[i + 1] && data[c + 2] == data[i + 2] {
                let max_len = MAX_MATCH.min(n - i);
                let len = common_prefix(data, c, i, max_len);
                if len >= MIN_MATCH && (len > best_len || (len == best_len && dist < best_dist)) {
                    best_len = len;
                    best_dist = dist;
                    if best_len == MAX_MATCH {
                        break;
                    }
                }
            }

            cand = prev[c];
            steps += 1;
        }

        if best_len >= MIN_MATCH {
            tokens.push(Token::Match {
                len: best_len as u16,
                dist: best_dist as u16,
            });

            let end = (i + best_len).min(n);
            let mut j = i + 1;
            while j < end {
                if j + MIN_MATCH <= n {
                    let hj = hash3(data, j);
                    prev[j] = head[hj];
                    head[hj] = j as i32;
                }
                j += 1;
            }

            i += best_len;
        } else {
            tokens.push(Token::Literal(data[i]));
            i += 1;
        }
    }

    tokens
}

fn reverse_bits(mut value: u16, len: u8) -> u16 {
    let mut out = 0u16;
    for _ in 0..len {
        out = (out << 1) | (value & 1);
        value >>= 1;
    }
    out
}

fn fixed_litlen_code(sym: u16) -> (u16, u8) {
    match sym {
        0..=143 => (0x30 + sym, 8),
        144..=255 => (0x190 + (sym - 144), 9),
        256..=279 => (sym - 256, 7),
        280..=287 => (0x0C0 + (sym - 280), 8),
        _ => (0, 0),
    }
}

fn put_litlen(bw: &mut BitWriter, sym: u16) {
    let (code, len) = fixed_litlen_code(sym);
    bw.write_bits(reverse_bits(code, len) as u32, len);
}

fn symbol_for(value: usize, base: &[usize], extra: &[u8]) -> (usize, u8, u16) {
    for (idx, (&b, &e)) in base.iter().zip(extra.iter()).enumerate() {
        let max = if e == 0 { b } else { b + ((1usize << e) - 1) };
        if value <= max {
            return (idx, e, (value - b) as u16);
        }
    }
    (base.len() - 1, 0, 0)
}

fn encode_block(bw: &mut BitWriter, tokens: &[Token], final_block: bool) {
    // BFINAL + BTYPE(01 = fixed Huffman), packed LSB-first.
    let header = (if final_block { 1u32 } else { 0u32 }) | (0b01 << 1);
    bw.write_bits(header, 3);

    for token in tokens {
        match *token {
            Token::Literal(byte) => put_litlen(bw, byte as u16),
            Token::Match { len, dist } => {
                let (len_idx, len_extra, len_extra_val) =
                    symbol_for(len as usize, &LENGTH_BASE, &LENGTH_EXTRA_BITS);
                put_litlen(bw, 257 + len_idx as u16);
                if len_extra > 0 {
                    bw.write_bits(len_extra_val as u32, len_extra);
                }

                let (dist_idx, dist_extra, dist_extra_val) =
                    symbol_for(dist as usize, &DIST_BASE, &DIST_EXTRA_BITS);
                bw.write_bits(reverse_bits(dist_idx as u16, 5) as u32, 5);
                if dist_extra > 0 {
                    bw.write_bits(dist_extra_val as u32, dist_extra);
                }
            }
        }
    }

    // End-of-block symbol.
    put_litlen(bw, 256);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_small() {
        let src = b"platen flate roundtrip";
        let encoded = deflate(src);
        let decoded = inflate(&encoded, "test").unwrap();
        assert_eq!(decoded, src);
    }

    #[test]
    fn roundtrip_empty() {
        let src: Vec<u8> = Vec::new();
        let encoded = deflate(&src);
        let decoded = inflate(&encoded, "test").unwrap();
        assert_eq!(decoded, src);
    }

    #[test]
    fn roundtrip_spans_multiple_chunks() {
        let src: Vec<u8> = (0..300_000).map(|i| (i % 251) as u8).collect();
        let encoded = deflate(&src);
        let decoded = inflate(&encoded, "test").unwrap();
        assert_eq!(decoded, src);
    }

    #[test]
    fn repetitive_payload_compresses() {
        let src = vec![0xABu8; 80_000];
        let encoded = deflate(&src);
        assert!(encoded.len() < src.len() / 10);
        assert_eq!(inflate(&encoded, "test").unwrap(), src);
    }

    #[test]
    fn deterministic_across_thread_counts() {
        let src: Vec<u8> = (0..320_000).map(|i| (i % 239) as u8).collect();
        let run_with_threads = |threads: usize| -> Vec<u8> {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .expect("thread pool");
            pool.install(|| deflate(&src))
        };
        assert_eq!(run_with_threads(1), run_with_threads(4));
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(inflate(&[0x12, 0x34, 0x56], "png").is_err());
    }
}
