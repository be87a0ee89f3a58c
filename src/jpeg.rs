use crate::cursor::Cursor;
use crate::error::PlatenError;
use crate::raster::{ColorModel, DecodedImage, StreamFilter};

const FORMAT: &str = "jpeg";

const MARKER_SOI: u8 = 0xD8;
const MARKER_EOI: u8 = 0xD9;
const MARKER_SOS: u8 = 0xDA;
const MARKER_SOF0: u8 = 0xC0;
const MARKER_SOF2: u8 = 0xC2;

/// Inspect a JPEG's frame header and embed the file byte-for-byte as a
/// `/DCTDecode` stream; no pixel-level decode happens here. Only baseline
/// (SOF0) and progressive (SOF2) frames are accepted. CMYK output carries a
/// `/Decode` inversion because Adobe-style JPEGs store inverted ink values.
pub fn decode(data: &[u8]) -> Result<DecodedImage, PlatenError> {
    let mut cur = Cursor::new(data, FORMAT);

    if cur.read_u8()? != 0xFF || cur.read_u8()? != MARKER_SOI {
        return Err(PlatenError::format(FORMAT, "missing SOI marker"));
    }

    loop {
        // Markers may be preceded by fill bytes (0xFF runs).
        let mut marker = cur.read_u8()?;
        if marker != 0xFF {
            return Err(PlatenError::format(
                FORMAT,
                format!("expected marker, found 0x{marker:02X}"),
            ));
        }
        while marker == 0xFF {
            marker = cur.read_u8()?;
        }

        match marker {
            MARKER_SOF0 | MARKER_SOF2 => {
                let _length = cur.read_u16_be()?;
                let precision = cur.read_u8()?;
                if precision != 8 {
                    return Err(PlatenError::format(
                        FORMAT,
                        format!("sample precision {precision} unsupported"),
                    ));
                }
                let height = cur.read_u16_be()? as u32;
                let width = cur.read_u16_be()? as u32;
                let components = cur.read_u8()?;
                if width == 0 || height == 0 {
                    return Err(PlatenError::format(FORMAT, "degenerate frame dimensions"));
                }

                let (color, decode_array) = match components {
                    1 => (ColorModel::DeviceGray, None),
                    3 => (ColorModel::DeviceRgb, None),
                    4 => (ColorModel::DeviceCmyk, Some("[1 0 1 0 1 0 1 0]")),
                    other => {
                        return Err(PlatenError::format(
                            FORMAT,
                            format!("{other}-component frame unsupported"),
                        ));
                    }
                };

                return Ok(DecodedImage {
                    width,
                    height,
                    bits_per_component: 8,
                    color,
                    alpha: None,
                    data: data.to_vec(),
                    filter: StreamFilter::Dct,
                    decode_array,
                });
            }
            // Frame types we cannot represent (lossless, arithmetic, ...).
            0xC1 | 0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                return Err(PlatenError::format(
                    FORMAT,
                    format!("frame marker 0xFF{marker:02X} unsupported"),
                ));
            }
            MARKER_EOI | MARKER_SOS => {
                return Err(PlatenError::format(FORMAT, "no frame header before scan"));
            }
            // Standalone markers carry no length field.
            0x01 | 0xD0..=0xD7 => {}
            _ => {
                let length = cur.read_u16_be()? as usize;
                if length < 2 {
                    return Err(PlatenError::format(FORMAT, "segment length below 2"));
                }
                cur.skip(length - 2)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(marker: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0xFF, marker];
        out.extend_from_slice(&((body.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn sof_body(height: u16, width: u16, components: u8) -> Vec<u8> {
        let mut body = vec![8u8];
        body.extend_from_slice(&height.to_be_bytes());
        body.extend_from_slice(&width.to_be_bytes());
        body.push(components);
        for id in 0..components {
            body.extend_from_slice(&[id + 1, 0x11, 0]);
        }
        body
    }

    fn build_jpeg(frame_marker: u8, height: u16, width: u16, components: u8) -> Vec<u8> {
        let mut out = vec![0xFF, 0xD8];
        out.extend_from_slice(&segment(0xE0, b"JFIF\0rest"));
        out.extend_from_slice(&segment(frame_marker, &sof_body(height, width, components)));
        out.extend_from_slice(&[0xFF, 0xD9]);
        out
    }

    #[test]
    fn baseline_rgb_frame() {
        let jpeg = build_jpeg(MARKER_SOF0, 24, 17, 3);
        let image = decode(&jpeg).unwrap();
        assert_eq!((image.width, image.height), (17, 24));
        assert_eq!(image.color, ColorModel::DeviceRgb);
        assert_eq!(image.filter, StreamFilter::Dct);
        assert_eq!(image.data, jpeg, "payload is the untouched file");
        assert!(image.decode_array.is_none());
    }

    #[test]
    fn progressive_cmyk_gets_decode_inversion() {
        let jpeg = build_jpeg(MARKER_SOF2, 5, 5, 4);
        let image = decode(&jpeg).unwrap();
        assert_eq!(image.color, ColorModel::DeviceCmyk);
        assert_eq!(image.decode_array, Some("[1 0 1 0 1 0 1 0]"));
    }

    #[test]
    fn grayscale_single_component() {
        let jpeg = build_jpeg(MARKER_SOF0, 2, 2, 1);
        let image = decode(&jpeg).unwrap();
        assert_eq!(image.color, ColorModel::DeviceGray);
    }

    #[test]
    fn rejects_missing_soi_and_lossless_frames() {
        assert!(decode(&[0x00, 0x01]).is_err());
        let jpeg = build_jpeg(0xC3, 2, 2, 3);
        assert!(decode(&jpeg).is_err());
    }

    #[test]
    fn truncated_segment_is_an_error() {
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x40, 0x00]);
        assert!(matches!(
            decode(&jpeg),
            Err(PlatenError::Truncated { .. })
        ));
    }
}
