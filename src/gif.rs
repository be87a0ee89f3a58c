use crate::cursor::Cursor;
use crate::error::PlatenError;
use crate::flate;
use crate::raster::{ColorModel, DecodedImage, StreamFilter};

const FORMAT: &str = "gif";

const BLOCK_EXTENSION: u8 = 0x21;
const BLOCK_IMAGE: u8 = 0x2C;
const BLOCK_TRAILER: u8 = 0x3B;
const LABEL_GRAPHIC_CONTROL: u8 = 0xF9;

const MAX_CODE_BITS: u8 = 12;

/// Decode the first image of a GIF stream. Extension blocks ahead of the
/// image descriptor are skipped via their sub-block chains; a GIF89a graphic
/// control block contributes a transparency index that becomes a binary soft
/// mask.
pub fn decode(data: &[u8]) -> Result<DecodedImage, PlatenError> {
    let mut cur = Cursor::new(data, FORMAT);

    let signature = cur.read_bytes(6)?;
    if signature != b"GIF87a" && signature != b"GIF89a" {
        return Err(PlatenError::format(FORMAT, "missing GIF signature"));
    }

    let _screen_width = cur.read_u16_le()?;
    let _screen_height = cur.read_u16_le()?;
    let flags = cur.read_u8()?;
    let _background = cur.read_u8()?;
    let _aspect = cur.read_u8()?;

    let mut palette = if flags & 0x80 != 0 {
        read_color_table(&mut cur, 2usize << (flags & 0x07))?
    } else {
        Vec::new()
    };

    let mut transparent_index: Option<u8> = None;

    loop {
        match cur.read_u8()? {
            BLOCK_EXTENSION => {
                let label = cur.read_u8()?;
                if label == LABEL_GRAPHIC_CONTROL {
                    transparent_index = read_graphic_control(&mut cur)?;
                } else {
                    skip_sub_blocks(&mut cur)?;
                }
            }
            BLOCK_IMAGE => {
                return decode_image_block(&mut cur, &mut palette, transparent_index);
            }
            BLOCK_TRAILER => {
                return Err(PlatenError::format(FORMAT, "no image descriptor before trailer"));
            }
            other => {
                return Err(PlatenError::format(
                    FORMAT,
                    format!("unexpected block introducer 0x{other:02X}"),
                ));
            }
        }
    }
}

fn read_color_table(cur: &mut Cursor<'_>, entries: usize) -> Result<Vec<[u8; 3]>, PlatenError> {
    let raw = cur.read_bytes(entries * 3)?;
    Ok(raw.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

fn read_graphic_control(cur: &mut Cursor<'_>) -> Result<Option<u8>, PlatenError> {
    let block_len = cur.read_u8()? as usize;
    let body = cur.read_bytes(block_len)?;
    let transparent = if block_len >= 4 && body[0] & 0x01 != 0 {
        Some(body[3])
    } else {
        None
    };
    skip_sub_blocks(cur)?;
    Ok(transparent)
}

fn skip_sub_blocks(cur: &mut Cursor<'_>) -> Result<(), PlatenError> {
    loop {
        let len = cur.read_u8()? as usize;
        if len == 0 {
            return Ok(());
        }
        cur.skip(len)?;
    }
}

fn collect_sub_blocks(cur: &mut Cursor<'_>) -> Result<Vec<u8>, PlatenError> {
    let mut out = Vec::new();
    loop {
        let len = cur.read_u8()? as usize;
        if len == 0 {
            return Ok(out);
        }
        out.extend_from_slice(cur.read_bytes(len)?);
    }
}

fn decode_image_block(
    cur: &mut Cursor<'_>,
    palette: &mut Vec<[u8; 3]>,
    transparent_index: Option<u8>,
) -> Result<DecodedImage, PlatenError> {
    let _left = cur.read_u16_le()?;
    let _top = cur.read_u16_le()?;
    let width = cur.read_u16_le()? as usize;
    let height = cur.read_u16_le()? as usize;
    let flags = cur.read_u8()?;
    if width == 0 || height == 0 {
        return Err(PlatenError::format(FORMAT, "degenerate image dimensions"));
    }

    // A local color table overrides the global one for this image.
    if flags & 0x80 != 0 {
        *palette = read_color_table(cur, 2usize << (flags & 0x07))?;
    }
    if palette.is_empty() {
        // No color table anywhere; fall back to a gray ramp so the output
        // stays valid at reduced fidelity.
        *palette = (0..=255u8).map(|v| [v, v, v]).collect();
    }

    let min_code_size = cur.read_u8()?;
    let compressed = collect_sub_blocks(cur)?;
    let mut indices = lzw_decode(min_code_size, &compressed, width * height)?;

    if flags & 0x40 != 0 {
        indices = deinterlace(&indices, width, height);
    }

    let alpha = transparent_index.map(|t| {
        let mask: Vec<u8> = indices
            .iter()
            .map(|&idx| if idx == t { 0u8 } else { 255u8 })
            .collect();
        flate::deflate(&mask)
    });

    Ok(DecodedImage {
        width: width as u32,
        height: height as u32,
        bits_per_component: 8,
        color: ColorModel::Indexed(std::mem::take(palette)),
        alpha,
        data: flate::deflate(&indices),
        filter: StreamFilter::Flate,
        decode_array: None,
    })
}

struct BitReader<'a> {
    data: &'a [u8],
    byte: usize,
    bit: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte: 0,
            bit: 0,
        }
    }

    /// LSB-first read of `count` bits; None once the stream runs dry.
    fn read(&mut self, count: u8) -> Option<u16> {
        let mut out = 0u16;
        for i in 0..count {
            if self.byte >= self.data.len() {
                return None;
            }
            let bit = (self.data[self.byte] >> self.bit) & 1;
            out |= (bit as u16) << i;
            self.bit += 1;
            if self.bit == 8 {
                self.bit = 0;
                self.byte += 1;
            }
        }
        Some(out)
    }
}

const NO_PREFIX: u16 = u16::MAX;

/// Variable-width GIF LZW. The dictionary resets on the clear code, grows by
/// one slot per emitted code up to the 12-bit ceiling, and a code equal to
/// the next free slot resolves to the previous code's expansion plus that
/// expansion's first byte.
fn lzw_decode(
    min_code_size: u8,
    data: &[u8],
    capacity: usize,
) -> Result<Vec<u8>, PlatenError> {
    if !(2..=8).contains(&min_code_size) {
        return Err(PlatenError::format(
            FORMAT,
            format!("invalid LZW minimum code size {min_code_size}"),
        ));
    }

    let clear_code = 1u16 << min_code_size;
    let eoi_code = clear_code + 1;

    // (prefix, suffix) entries; roots have no prefix.
    let mut dict: Vec<(u16, u8)> = Vec::with_capacity(1 << MAX_CODE_BITS);
    let reset_dict = |dict: &mut Vec<(u16, u8)>| {
        dict.clear();
        for v in 0..clear_code {
            dict.push((NO_PREFIX, v as u8));
        }
        dict.push((NO_PREFIX, 0)); // clear
        dict.push((NO_PREFIX, 0)); // end of information
    };
    reset_dict(&mut dict);

    let mut code_size = min_code_size + 1;
    let mut prev_code: Option<u16> = None;
    let mut reader = BitReader::new(data);
    let mut out = Vec::with_capacity(capacity);
    let mut scratch = Vec::with_capacity(64);

    while out.len() < capacity {
        let Some(code) = reader.read(code_size) else {
            return Err(PlatenError::truncated(FORMAT, capacity, out.len()));
        };

        if code == clear_code {
            reset_dict(&mut dict);
            code_size = min_code_size + 1;
            prev_code = None;
            continue;
        }
        if code == eoi_code {
            break;
        }

        let next_slot = dict.len() as u16;
        match prev_code {
            None => {
                if code >= clear_code {
                    return Err(PlatenError::format(
                        FORMAT,
                        "first code after clear is not a root",
                    ));
                }
                out.push(code as u8);
            }
            Some(prev) => {
                if code < next_slot {
                    if dict.len() < (1 << MAX_CODE_BITS) {
                        dict.push((prev, first_byte(&dict, code)));
                    }
                    expand(&dict, code, &mut scratch);
                    out.extend_from_slice(&scratch);
                } else if code == next_slot {
                    // Self-referential case: the code being read is the slot
                    // about to be created from prev_code.
                    let first = first_byte(&dict, prev);
                    if dict.len() < (1 << MAX_CODE_BITS) {
                        dict.push((prev, first));
                    }
                    expand(&dict, prev, &mut scratch);
                    out.extend_from_slice(&scratch);
                    out.push(first);
                } else {
                    return Err(PlatenError::format(
                        FORMAT,
                        format!("LZW code {code} beyond next slot {next_slot}"),
                    ));
                }
            }
        }

        prev_code = Some(code);
        if dict.len() as u16 == (1 << code_size) && code_size < MAX_CODE_BITS {
            code_size += 1;
        }
    }

    out.truncate(capacity);
    if out.len() < capacity {
        return Err(PlatenError::truncated(FORMAT, capacity, out.len()));
    }
    Ok(out)
}

fn first_byte(dict: &[(u16, u8)], mut code: u16) -> u8 {
    loop {
        let (prefix, suffix) = dict[code as usize];
        if prefix == NO_PREFIX {
            return suffix;
        }
        code = prefix;
    }
}

fn expand(dict: &[(u16, u8)], code: u16, out: &mut Vec<u8>) {
    out.clear();
    let mut cur = code;
    loop {
        let (prefix, suffix) = dict[cur as usize];
        out.push(suffix);
        if prefix == NO_PREFIX {
            break;
        }
        cur = prefix;
    }
    out.reverse();
}

/// Re-weave interlaced rows: decode order visits strides {8,8,4,2} starting
/// at rows {0,4,2,1}.
fn deinterlace(indices: &[u8], width: usize, height: usize) -> Vec<u8> {
    const PASSES: [(usize, usize); 4] = [(0, 8), (4, 8), (2, 4), (1, 2)];
    let mut out = vec![0u8; indices.len()];
    let mut src_row = 0usize;
    for (start, step) in PASSES {
        let mut row = start;
        while row < height {
            out[row * width..(row + 1) * width]
                .copy_from_slice(&indices[src_row * width..(src_row + 1) * width]);
            src_row += 1;
            row += step;
        }
    }
    out
}
