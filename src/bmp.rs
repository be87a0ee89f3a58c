use crate::cursor::Cursor;
use crate::error::PlatenError;
use crate::flate;
use crate::raster::{ColorModel, DecodedImage, StreamFilter};

const FORMAT: &str = "bmp";

// Legacy BITMAPCOREHEADER; anything >= 40 carries the BITMAPINFOHEADER
// layout with possible trailing extensions.
const CORE_HEADER_SIZE: u32 = 12;
const INFO_HEADER_SIZE: u32 = 40;

struct DibHeader {
    width: u32,
    height: u32,
    top_down: bool,
    bits_per_pixel: u16,
    palette_entries: usize,
    palette_entry_len: usize,
}

/// Decode a Windows bitmap. Rows are stored bottom-up (unless the declared
/// height is negative), padded to 4-byte boundaries; truecolor pixels are
/// BGR-ordered. The payload is always re-encoded as a zlib stream.
pub fn decode(data: &[u8]) -> Result<DecodedImage, PlatenError> {
    let mut cur = Cursor::new(data, FORMAT);

    let magic = cur.read_bytes(2)?;
    if magic != b"BM" {
        return Err(PlatenError::format(FORMAT, "missing BM signature"));
    }
    let _file_size = cur.read_u32_le()?;
    cur.skip(4)?; // reserved
    let pixel_offset = cur.read_u32_le()? as usize;

    let header = read_dib_header(&mut cur)?;

    let palette = if header.bits_per_pixel < 16 {
        read_palette(&mut cur, &header)?
    } else {
        Vec::new()
    };

    cur.seek_to(pixel_offset)?;

    let stride = row_stride(header.width, header.bits_per_pixel);
    let samples = if header.bits_per_pixel < 16 { 1usize } else { 3 };
    let mut pixels = vec![0u8; header.width as usize * header.height as usize * samples];

    for out_row in 0..header.height as usize {
        let src = cur.read_bytes(stride)?;
        let row = if header.top_down {
            out_row
        } else {
            header.height as usize - 1 - out_row
        };
        let dst = &mut pixels[row * header.width as usize * samples..][..header.width as usize * samples];
        unpack_row(src, header.width as usize, header.bits_per_pixel, dst);
    }

    let color = if header.bits_per_pixel < 16 {
        ColorModel::Indexed(palette)
    } else {
        ColorModel::DeviceRgb
    };

    Ok(DecodedImage {
        width: header.width,
        height: header.height,
        bits_per_component: 8,
        color,
        alpha: None,
        data: flate::deflate(&pixels),
        filter: StreamFilter::Flate,
        decode_array: None,
    })
}

fn read_dib_header(cur: &mut Cursor<'_>) -> Result<DibHeader, PlatenError> {
    let header_start = cur.pos();
    let header_size = cur.read_u32_le()?;

    let (width, height_raw, bits_per_pixel, compression, clr_used, palette_entry_len);
    if header_size == CORE_HEADER_SIZE {
        width = cur.read_u16_le()? as i64;
        height_raw = cur.read_u16_le()? as i64;
        let _planes = cur.read_u16_le()?;
        bits_per_pixel = cur.read_u16_le()?;
        compression = 0u32;
        clr_used = 0u32;
        palette_entry_len = 3usize;
    } else if header_size >= INFO_HEADER_SIZE {
        width = cur.read_i32_le()? as i64;
        height_raw = cur.read_i32_le()? as i64;
        let _planes = cur.read_u16_le()?;
        bits_per_pixel = cur.read_u16_le()?;
        compression = cur.read_u32_le()?;
        cur.skip(12)?; // biSizeImage, biXPelsPerMeter, biYPelsPerMeter
        clr_used = cur.read_u32_le()?;
        cur.skip(4)?; // biClrImportant
        palette_entry_len = 4usize;
        // V4/V5 extensions carry color-space fields we do not consume.
        cur.seek_to(header_start + header_size as usize)?;
    } else {
        return Err(PlatenError::format(
            FORMAT,
            format!("unknown DIB header size {header_size}"),
        ));
    }

    if compression != 0 {
        return Err(PlatenError::format(
            FORMAT,
            format!("unsupported compression {compression}"),
        ));
    }
    if !matches!(bits_per_pixel, 1 | 4 | 8 | 24 | 32) {
        return Err(PlatenError::format(
            FORMAT,
            format!("unsupported bit depth {bits_per_pixel}"),
        ));
    }

    let top_down = height_raw < 0;
    let height = height_raw.unsigned_abs();
    if width <= 0 || height == 0 {
        return Err(PlatenError::format(FORMAT, "degenerate dimensions"));
    }

    let palette_entries = if bits_per_pixel < 16 {
        let declared = if clr_used != 0 {
            clr_used as usize
        } else {
            1usize << bits_per_pixel
        };
        if declared > 256 {
            return Err(PlatenError::format(
                FORMAT,
                format!("palette of {declared} entries exceeds 256"),
            ));
        }
        declared
    } else {
        0
    };

    Ok(DibHeader {
        width: width as u32,
        height: height as u32,
        top_down,
        bits_per_pixel,
        palette_entries,
        palette_entry_len,
    })
}

fn read_palette(cur: &mut Cursor<'_>, header: &DibHeader) -> Result<Vec<[u8; 3]>, PlatenError> {
    let mut palette = Vec::with_capacity(header.palette_entries);
    for _ in 0..header.palette_entries {
        let entry = cur.read_bytes(header.palette_entry_len)?;
        // Stored blue, green, red (plus a reserved byte in the info layout).
        palette.push([entry[2], entry[1], entry[0]]);
    }
    Ok(palette)
}

/// File row stride: pixels packed at the declared depth, padded to 4 bytes.
pub(crate) fn row_stride(width: u32, bits_per_pixel: u16) -> usize {
    ((width as usize * bits_per_pixel as usize + 31) / 32) * 4
}

fn unpack_row(src: &[u8], width: usize, bits_per_pixel: u16, dst: &mut [u8]) {
    match bits_per_pixel {
        1 => {
            for x in 0..width {
                dst[x] = (src[x / 8] >> (7 - (x % 8))) & 1;
            }
        }
        4 => {
            for x in 0..width {
                let byte = src[x / 2];
                dst[x] = if x % 2 == 0 { byte >> 4 } else { byte & 0x0F };
            }
        }
        8 => dst.copy_from_slice(&src[..width]),
        24 => {
            for x in 0..width {
                let px = &src[x * 3..x * 3 + 3];
                dst[x * 3] = px[2];
                dst[x * 3 + 1] = px[1];
                dst[x * 3 + 2] = px[0];
            }
        }
        _ => {
            // 32 bpp; the fourth byte is reserved padding and dropped.
            for x in 0..width {
                let px = &src[x * 4..x * 4 + 4];
                dst[x * 3] = px[2];
                dst[x * 3 + 1] = px[1];
                dst[x * 3 + 2] = px[0];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flate::inflate;

    fn build_bmp(
        width: u32,
        height: i32,
        bits_per_pixel: u16,
        palette: &[[u8; 3]],
        rows: &[Vec<u8>],
    ) -> Vec<u8> {
        let palette_len = palette.len() * 4;
        let pixel_offset = 14 + 40 + palette_len;
        let mut out = Vec::new();
        out.extend_from_slice(b"BM");
        let data_len: usize = rows.iter().map(|r| r.len()).sum();
        out.extend_from_slice(&((pixel_offset + data_len) as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&(pixel_offset as u32).to_le_bytes());
        out.extend_from_slice(&40u32.to_le_bytes());
        out.extend_from_slice(&(width as i32).to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&bits_per_pixel.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&(palette.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for entry in palette {
            out.extend_from_slice(&[entry[2], entry[1], entry[0], 0]);
        }
        for row in rows {
            out.extend_from_slice(row);
        }
        out
    }

    #[test]
    fn row_stride_pads_to_dword() {
        for &(bpp, expected) in &[(1u16, 4usize), (4, 4), (8, 8), (24, 24), (32, 32)] {
            assert_eq!(row_stride(8, bpp), expected);
            let formula = ((8usize * bpp as usize / 8) + 3) / 4 * 4;
            assert_eq!(row_stride(8, bpp), formula);
        }
    }

    #[test]
    fn one_bit_palette_image() {
        // 2x2, 1-bit, two palette entries; rows padded to 4 bytes.
        let palette = [[0u8, 0, 0], [255u8, 255, 255]];
        let rows = vec![
            vec![0b1000_0000, 0, 0, 0], // bottom row in file order: pixels 1,0
            vec![0b0100_0000, 0, 0, 0], // top row: pixels 0,1
        ];
        let bmp = build_bmp(2, 2, 1, &palette, &rows);
        let image = decode(&bmp).unwrap();
        assert_eq!(image.width, 2);
        assert_eq!(image.height, 2);
        match &image.color {
            ColorModel::Indexed(entries) => assert_eq!(entries.len(), 2),
            other => panic!("expected indexed color, got {other:?}"),
        }
        let pixels = inflate(&image.data, "test").unwrap();
        // Bottom-up storage: file row 0 is the visual bottom.
        assert_eq!(pixels, vec![0, 1, 1, 0]);
    }

    #[test]
    fn truecolor_bgr_reversal() {
        let rows = vec![vec![255u8, 0, 0, 0]]; // one blue pixel + row padding
        let bmp = build_bmp(1, 1, 24, &[], &rows);
        let image = decode(&bmp).unwrap();
        assert_eq!(image.color, ColorModel::DeviceRgb);
        let pixels = inflate(&image.data, "test").unwrap();
        assert_eq!(pixels, vec![0, 0, 255]);
    }

    #[test]
    fn negative_height_is_top_down() {
        let rows = vec![vec![7u8, 0, 0, 0], vec![9u8, 0, 0, 0]];
        let palette: Vec<[u8; 3]> = (0u8..16).map(|i| [i * 16; 3]).collect();
        let bmp = build_bmp(1, -2, 8, &palette, &rows);
        let image = decode(&bmp).unwrap();
        let pixels = inflate(&image.data, "test").unwrap();
        assert_eq!(pixels, vec![7, 9]);
    }

    #[test]
    fn rejects_bad_magic_and_depth() {
        assert!(decode(b"XX000000").is_err());
        let bmp = build_bmp(1, 1, 16, &[], &[vec![0, 0, 0, 0]]);
        assert!(decode(&bmp).is_err());
    }

    #[test]
    fn truncated_pixel_data_errors() {
        let bmp = build_bmp(4, 4, 24, &[], &[vec![0u8; 12]]);
        assert!(matches!(
            decode(&bmp),
            Err(PlatenError::Truncated { .. })
        ));
    }
}
