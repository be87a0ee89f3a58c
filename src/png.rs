use crate::cursor::Cursor;
use crate::error::PlatenError;
use crate::flate;
use crate::raster::{ColorModel, DecodedImage, StreamFilter};

const FORMAT: &str = "png";

const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

const COLOR_GRAY: u8 = 0;
const COLOR_RGB: u8 = 2;
const COLOR_PALETTE: u8 = 3;
const COLOR_GRAY_ALPHA: u8 = 4;
const COLOR_RGBA: u8 = 6;

struct Ihdr {
    width: u32,
    height: u32,
    bit_depth: u8,
    color_type: u8,
}

/// Decode a PNG: IHDR, then PLTE/tRNS collected ahead of the concatenated
/// IDAT zlib stream, scanline defiltering, and re-encoding. An alpha channel
/// or transparency table yields a grayscale `/SMask`; in that case both the
/// color and mask images are padded up to the next power-of-two square with
/// zero pixels, which a downstream texture consumer requires.
pub fn decode(data: &[u8]) -> Result<DecodedImage, PlatenError> {
    let mut cur = Cursor::new(data, FORMAT);
    if cur.read_bytes(8)? != SIGNATURE {
        return Err(PlatenError::format(FORMAT, "missing PNG signature"));
    }

    let mut header: Option<Ihdr> = None;
    let mut palette: Vec<[u8; 3]> = Vec::new();
    let mut trns: Vec<u8> = Vec::new();
    let mut idat: Vec<u8> = Vec::new();

    loop {
        let length = cur.read_u32_be()? as usize;
        let chunk_type: [u8; 4] = cur.read_bytes(4)?.try_into().unwrap_or([0; 4]);
        let body = cur.read_bytes(length)?;
        cur.skip(4)?; // CRC is not verified; corrupt payloads fail in inflate

        match &chunk_type {
            b"IHDR" => {
                if header.is_some() {
                    return Err(PlatenError::format(FORMAT, "duplicate IHDR"));
                }
                header = Some(parse_ihdr(body)?);
            }
            b"PLTE" => {
                if length % 3 != 0 || length / 3 > 256 {
                    return Err(PlatenError::format(
                        FORMAT,
                        format!("palette chunk of {length} bytes"),
                    ));
                }
                palette = body.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
            }
            b"tRNS" => {
                trns = body.to_vec();
            }
            b"IDAT" => {
                idat.extend_from_slice(body);
            }
            b"IEND" => break,
            _ => {}
        }
    }

    let Some(header) = header else {
        return Err(PlatenError::format(FORMAT, "missing IHDR"));
    };
    if idat.is_empty() {
        return Err(PlatenError::format(FORMAT, "missing IDAT"));
    }
    if header.color_type == COLOR_PALETTE && palette.is_empty() {
        return Err(PlatenError::format(FORMAT, "palette image without PLTE"));
    }

    let raw = flate::inflate(&idat, FORMAT)?;
    let scanlines = defilter(&raw, &header)?;
    assemble(scanlines, header, palette, trns)
}

fn parse_ihdr(body: &[u8]) -> Result<Ihdr, PlatenError> {
    let mut cur = Cursor::new(body, FORMAT);
    let width = cur.read_u32_be()?;
    let height = cur.read_u32_be()?;
    let bit_depth = cur.read_u8()?;
    let color_type = cur.read_u8()?;
    let compression = cur.read_u8()?;
    let filter_method = cur.read_u8()?;
    let interlace = cur.read_u8()?;

    if width == 0 || height == 0 {
        return Err(PlatenError::format(FORMAT, "degenerate dimensions"));
    }
    if compression != 0 || filter_method != 0 {
        return Err(PlatenError::format(
            FORMAT,
            "nonzero compression or filter method",
        ));
    }
    if interlace != 0 {
        return Err(PlatenError::format(FORMAT, "Adam7 interlacing unsupported"));
    }
    let depth_ok = match color_type {
        COLOR_PALETTE => matches!(bit_depth, 1 | 2 | 4 | 8),
        COLOR_GRAY | COLOR_RGB | COLOR_GRAY_ALPHA | COLOR_RGBA => bit_depth == 8,
        _ => false,
    };
    if !depth_ok {
        return Err(PlatenError::format(
            FORMAT,
            format!("color type {color_type} at depth {bit_depth} unsupported"),
        ));
    }

    Ok(Ihdr {
        width,
        height,
        bit_depth,
        color_type,
    })
}

fn channels(color_type: u8) -> usize {
    match color_type {
        COLOR_GRAY | COLOR_PALETTE => 1,
        COLOR_GRAY_ALPHA => 2,
        COLOR_RGB => 3,
        _ => 4,
    }
}

fn line_bytes(header: &Ihdr) -> usize {
    (header.width as usize * channels(header.color_type) * header.bit_depth as usize + 7) / 8
}

/// Filter distance in whole bytes: pixels narrower than one byte use their
/// immediate left neighbor byte.
fn filter_bpp(header: &Ihdr) -> usize {
    (channels(header.color_type) * header.bit_depth as usize + 7) / 8
}

fn defilter(raw: &[u8], header: &Ihdr) -> Result<Vec<u8>, PlatenError> {
    let line_len = line_bytes(header);
    let rows = header.height as usize;
    let needed = rows * (line_len + 1);
    if raw.len() < needed {
        return Err(PlatenError::truncated(FORMAT, needed, raw.len()));
    }

    let bpp = filter_bpp(header);
    let mut out = vec![0u8; rows * line_len];
    let mut prev_start: Option<usize> = None;

    for row in 0..rows {
        let src = &raw[row * (line_len + 1)..];
        let filter = src[0];
        let start = row * line_len;
        out[start..start + line_len].copy_from_slice(&src[1..1 + line_len]);
        let (before, line_region) = out.split_at_mut(start);
        let line = &mut line_region[..line_len];
        let prev = prev_start.map(|p| &before[p..p + line_len]);
        unfilter_line(filter, line, prev, bpp)?;
        prev_start = Some(start);
    }
    Ok(out)
}

fn unfilter_line(
    filter: u8,
    line: &mut [u8],
    prev: Option<&[u8]>,
    bpp: usize,
) -> Result<(), PlatenError> {
    match filter {
        0 => {}
        1 => {
            for i in bpp..line.len() {
                line[i] = line[i].wrapping_add(line[i - bpp]);
            }
        }
        2 => {
            if let Some(prev) = prev {
                for i in 0..line.len() {
                    line[i] = line[i].wrapping_add(prev[i]);
                }
            }
        }
        3 => {
            for i in 0..line.len() {
                let left = if i >= bpp { line[i - bpp] as u16 } else { 0 };
                let above = prev.map(|p| p[i] as u16).unwrap_or(0);
                line[i] = line[i].wrapping_add(((left + above) / 2) as u8);
            }
        }
        4 => {
            for i in 0..line.len() {
                let left = if i >= bpp { line[i - bpp] } else { 0 };
                let above = prev.map(|p| p[i]).unwrap_or(0);
                let upper_left = if i >= bpp {
                    prev.map(|p| p[i - bpp]).unwrap_or(0)
                } else {
                    0
                };
                line[i] = line[i].wrapping_add(paeth(left, above, upper_left));
            }
        }
        other => {
            return Err(PlatenError::format(
                FORMAT,
                format!("unknown scanline filter {other}"),
            ));
        }
    }
    Ok(())
}

/// Paeth predictor: nearest of left/above/upper-left to left+above-upper_left,
/// ties broken left, then above, then upper-left.
fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

fn assemble(
    scanlines: Vec<u8>,
    header: Ihdr,
    palette: Vec<[u8; 3]>,
    trns: Vec<u8>,
) -> Result<DecodedImage, PlatenError> {
    let width = header.width as usize;
    let height = header.height as usize;
    let pixel_count = width * height;

    match header.color_type {
        COLOR_PALETTE => {
            let mut indices = vec![0u8; pixel_count];
            let line_len = line_bytes(&header);
            for row in 0..height {
                let line = &scanlines[row * line_len..(row + 1) * line_len];
                unpack_indices(
                    line,
                    width,
                    header.bit_depth,
                    palette.len(),
                    &mut indices[row * width..(row + 1) * width],
                );
            }
            let alpha = if trns.is_empty() {
                None
            } else {
                Some(
                    indices
                        .iter()
                        .map(|&idx| trns.get(idx as usize).copied().unwrap_or(255))
                        .collect::<Vec<u8>>(),
                )
            };
            finish(indices, alpha, ColorModel::Indexed(palette), header)
        }
        COLOR_GRAY => {
            let mut rgb = Vec::with_capacity(pixel_count * 3);
            for &v in &scanlines {
                rgb.extend_from_slice(&[v, v, v]);
            }
            finish(rgb, None, ColorModel::DeviceRgb, header)
        }
        COLOR_RGB => finish(scanlines, None, ColorModel::DeviceRgb, header),
        COLOR_GRAY_ALPHA => {
            let mut rgb = Vec::with_capacity(pixel_count * 3);
            let mut alpha = Vec::with_capacity(pixel_count);
            for px in scanlines.chunks_exact(2) {
                rgb.extend_from_slice(&[px[0], px[0], px[0]]);
                alpha.push(px[1]);
            }
            finish(rgb, Some(alpha), ColorModel::DeviceRgb, header)
        }
        _ => {
            let mut rgb = Vec::with_capacity(pixel_count * 3);
            let mut alpha = Vec::with_capacity(pixel_count);
            for px in scanlines.chunks_exact(4) {
                rgb.extend_from_slice(&[px[0], px[1], px[2]]);
                alpha.push(px[3]);
            }
            finish(rgb, Some(alpha), ColorModel::DeviceRgb, header)
        }
    }
}

/// Expand packed palette indices to one byte each. Indices at or beyond the
/// palette length have their bit order reversed within the declared depth;
/// some legacy encoders write them that way, and viewers expect the reversed
/// value rather than a clamp.
fn unpack_indices(line: &[u8], width: usize, depth: u8, palette_len: usize, out: &mut [u8]) {
    let per_byte = 8 / depth as usize;
    let mask = ((1u16 << depth) - 1) as u8;
    for x in 0..width {
        let byte = line[x / per_byte];
        let shift = 8 - depth as usize * (x % per_byte + 1);
        let mut idx = (byte >> shift) & mask;
        if (idx as usize) >= palette_len {
            idx = reverse_within(idx, depth);
        }
        out[x] = idx;
    }
}

fn reverse_within(value: u8, depth: u8) -> u8 {
    let mut out = 0u8;
    for bit in 0..depth {
        if value & (1 << bit) != 0 {
            out |= 1 << (depth - 1 - bit);
        }
    }
    out
}

fn finish(
    pixels: Vec<u8>,
    alpha: Option<Vec<u8>>,
    color: ColorModel,
    header: Ihdr,
) -> Result<DecodedImage, PlatenError> {
    let samples = match color {
        ColorModel::DeviceRgb => 3usize,
        _ => 1usize,
    };

    let (pixels, alpha, width, height) = match alpha {
        None => (pixels, None, header.width, header.height),
        Some(alpha) => {
            let side = header.width.max(header.height).next_power_of_two();
            let padded = pad_to_square(&pixels, header.width, header.height, samples, side);
            let padded_alpha = pad_to_square(&alpha, header.width, header.height, 1, side);
            (padded, Some(padded_alpha), side, side)
        }
    };

    Ok(DecodedImage {
        width,
        height,
        bits_per_component: 8,
        color,
        alpha: alpha.map(|a| flate::deflate(&a)),
        data: flate::deflate(&pixels),
        filter: StreamFilter::Flate,
        decode_array: None,
    })
}

fn pad_to_square(pixels: &[u8], width: u32, height: u32, samples: usize, side: u32) -> Vec<u8> {
    if width == side && height == side {
        return pixels.to_vec();
    }
    let side = side as usize;
    let width = width as usize;
    let mut out = vec![0u8; side * side * samples];
    for row in 0..height as usize {
        let src = &pixels[row * width * samples..(row + 1) * width * samples];
        out[row * side * samples..row * side * samples + width * samples].copy_from_slice(src);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flate::inflate;

    fn chunk(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(body);
        out.extend_from_slice(&[0u8; 4]);
        out
    }

    fn build_png(
        width: u32,
        height: u32,
        depth: u8,
        color_type: u8,
        palette: &[[u8; 3]],
        trns: &[u8],
        raw_scanlines: &[u8],
    ) -> Vec<u8> {
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&width.to_be_bytes());
        ihdr.extend_from_slice(&height.to_be_bytes());
        ihdr.extend_from_slice(&[depth, color_type, 0, 0, 0]);

        let mut out = SIGNATURE.to_vec();
        out.extend_from_slice(&chunk(b"IHDR", &ihdr));
        if !palette.is_empty() {
            let body: Vec<u8> = palette.iter().flatten().copied().collect();
            out.extend_from_slice(&chunk(b"PLTE", &body));
        }
        if !trns.is_empty() {
            out.extend_from_slice(&chunk(b"tRNS", trns));
        }
        out.extend_from_slice(&chunk(b"IDAT", &flate::deflate(raw_scanlines)));
        out.extend_from_slice(&chunk(b"IEND", &[]));
        out
    }

    fn filter_line(filter: u8, line: &[u8], prev: Option<&[u8]>, bpp: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(line.len());
        for i in 0..line.len() {
            let left = if i >= bpp { line[i - bpp] } else { 0 };
            let above = prev.map(|p| p[i]).unwrap_or(0);
            let upper_left = if i >= bpp {
                prev.map(|p| p[i - bpp]).unwrap_or(0)
            } else {
                0
            };
            let predictor = match filter {
                0 => 0,
                1 => left,
                2 => above,
                3 => (((left as u16) + (above as u16)) / 2) as u8,
                _ => paeth(left, above, upper_left),
            };
            out.push(line[i].wrapping_sub(predictor));
        }
        out
    }

    #[test]
    fn defilter_inverts_every_filter() {
        let prev: Vec<u8> = (0..24).map(|i| (i * 7 + 3) as u8).collect();
        let line: Vec<u8> = (0..24).map(|i| (i * 13 + 101) as u8).collect();
        for filter in 0u8..=4 {
            for bpp in [1usize, 2, 3, 4] {
                let mut filtered = filter_line(filter, &line, Some(&prev), bpp);
                unfilter_line(filter, &mut filtered, Some(&prev), bpp).unwrap();
                assert_eq!(filtered, line, "filter {filter} bpp {bpp}");

                // First row: no predecessor.
                let mut filtered = filter_line(filter, &line, None, bpp);
                unfilter_line(filter, &mut filtered, None, bpp).unwrap();
                assert_eq!(filtered, line, "filter {filter} bpp {bpp} first row");
            }
        }
    }

    #[test]
    fn paeth_tie_break_prefers_left_then_above() {
        assert_eq!(paeth(10, 10, 10), 10);
        // p = 4 + 4 - 2 = 6; pa = 2, pb = 2, pc = 4: left wins the tie.
        assert_eq!(paeth(4, 4, 2), 4);
        // p = 0 + 4 - 2 = 2; all three deviations are 2: left still wins.
        assert_eq!(paeth(0, 4, 2), 0);
    }

    #[test]
    fn one_by_one_truecolor_has_no_mask() {
        let png = build_png(1, 1, 8, COLOR_RGB, &[], &[], &[0, 10, 20, 30]);
        let image = decode(&png).unwrap();
        assert_eq!(image.width, 1);
        assert_eq!(image.height, 1);
        assert_eq!(image.color, ColorModel::DeviceRgb);
        assert!(image.alpha.is_none());
        let pixels = inflate(&image.data, "test").unwrap();
        assert_eq!(pixels, vec![10, 20, 30]);
    }

    #[test]
    fn sub_filter_reconstructs_across_pixels() {
        // 2x1 RGB, filter 1: second pixel stored as delta from the first.
        let png = build_png(2, 1, 8, COLOR_RGB, &[], &[], &[1, 10, 20, 30, 5, 5, 5]);
        let image = decode(&png).unwrap();
        let pixels = inflate(&image.data, "test").unwrap();
        assert_eq!(pixels, vec![10, 20, 30, 15, 25, 35]);
    }

    #[test]
    fn rgba_splits_into_rgb_and_padded_mask() {
        // 2x1 RGBA: alpha forces a mask and power-of-two square padding.
        let png = build_png(
            2,
            1,
            8,
            COLOR_RGBA,
            &[],
            &[],
            &[0, 1, 2, 3, 128, 4, 5, 6, 255],
        );
        let image = decode(&png).unwrap();
        assert_eq!((image.width, image.height), (2, 2));
        let pixels = inflate(&image.data, "test").unwrap();
        assert_eq!(
            pixels,
            vec![1, 2, 3, 4, 5, 6, 0, 0, 0, 0, 0, 0],
            "second row is zero padding"
        );
        let mask = inflate(image.alpha.as_deref().unwrap(), "test").unwrap();
        assert_eq!(mask, vec![128, 255, 0, 0]);
    }

    #[test]
    fn palette_trns_yields_indexed_mask() {
        let palette = [[255u8, 0, 0], [0u8, 255, 0]];
        // 1x1 depth 8 palette image, index 1, tRNS makes entry 1 translucent.
        let png = build_png(1, 1, 8, COLOR_PALETTE, &palette, &[255, 64], &[0, 1]);
        let image = decode(&png).unwrap();
        match &image.color {
            ColorModel::Indexed(entries) => assert_eq!(entries.len(), 2),
            other => panic!("expected indexed, got {other:?}"),
        }
        let pixels = inflate(&image.data, "test").unwrap();
        assert_eq!(pixels, vec![1]);
        let mask = inflate(image.alpha.as_deref().unwrap(), "test").unwrap();
        assert_eq!(mask, vec![64]);
    }

    #[test]
    fn out_of_range_index_reverses_bit_order() {
        // Depth 2, palette of 2: raw index 0b10 is out of range and decodes
        // as its bit reversal 0b01.
        let palette = [[0u8, 0, 0], [255u8, 255, 255]];
        let png = build_png(1, 1, 2, COLOR_PALETTE, &palette, &[], &[0, 0b1000_0000]);
        let image = decode(&png).unwrap();
        let pixels = inflate(&image.data, "test").unwrap();
        assert_eq!(pixels, vec![1]);
    }

    #[test]
    fn rejects_interlaced_and_bad_signature() {
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&1u32.to_be_bytes());
        ihdr.extend_from_slice(&1u32.to_be_bytes());
        ihdr.extend_from_slice(&[8, COLOR_RGB, 0, 0, 1]);
        let mut png = SIGNATURE.to_vec();
        png.extend_from_slice(&chunk(b"IHDR", &ihdr));
        png.extend_from_slice(&chunk(b"IEND", &[]));
        assert!(decode(&png).is_err());
        assert!(decode(b"not a png").is_err());
    }

    #[test]
    fn short_idat_is_truncation() {
        let png = build_png(2, 2, 8, COLOR_RGB, &[], &[], &[0, 1, 2, 3, 4, 5, 6]);
        assert!(matches!(decode(&png), Err(PlatenError::Truncated { .. })));
    }
}
