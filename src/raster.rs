use crate::error::PlatenError;
use crate::{bmp, gif, jpeg, png};

/// Color model of a decoded image as it will be declared in the PDF.
#[derive(Debug, Clone, PartialEq)]
pub enum ColorModel {
    DeviceRgb,
    DeviceGray,
    DeviceCmyk,
    /// Indexed over DeviceRGB; at most 256 entries.
    Indexed(Vec<[u8; 3]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFilter {
    /// Payload is a zlib stream (`/FlateDecode`).
    Flate,
    /// Payload is a raw JPEG file (`/DCTDecode`).
    Dct,
}

/// A decoded raster asset, re-encoded and ready for embedding.
///
/// `data` is the compressed payload; before compression it held exactly
/// `width * height` bytes per 8-bit component (one byte per pixel for
/// indexed/gray, three for RGB, four for CMYK). `alpha`, when present, is a
/// zlib-compressed `width * height` grayscale mask emitted as an `/SMask`.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub bits_per_component: u8,
    pub color: ColorModel,
    pub alpha: Option<Vec<u8>>,
    pub data: Vec<u8>,
    pub filter: StreamFilter,
    /// `/Decode` array override; used for CMYK JPEG inversion.
    pub decode_array: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Bmp,
    Gif,
    Png,
    Jpeg,
}

/// Identify a raster format from its magic bytes.
pub fn sniff(data: &[u8]) -> Option<ImageKind> {
    if data.starts_with(b"BM") {
        Some(ImageKind::Bmp)
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some(ImageKind::Gif)
    } else if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some(ImageKind::Png)
    } else if data.starts_with(&[0xFF, 0xD8]) {
        Some(ImageKind::Jpeg)
    } else {
        None
    }
}

/// Decode any supported raster format, dispatching on the magic bytes.
pub fn decode_image(data: &[u8]) -> Result<DecodedImage, PlatenError> {
    match sniff(data) {
        Some(ImageKind::Bmp) => bmp::decode(data),
        Some(ImageKind::Gif) => gif::decode(data),
        Some(ImageKind::Png) => png::decode(data),
        Some(ImageKind::Jpeg) => jpeg::decode(data),
        None => Err(PlatenError::format(
            "image",
            "unrecognized image signature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_recognizes_magics() {
        assert_eq!(sniff(b"BM\x00\x00"), Some(ImageKind::Bmp));
        assert_eq!(sniff(b"GIF89a rest"), Some(ImageKind::Gif));
        assert_eq!(
            sniff(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0]),
            Some(ImageKind::Png)
        );
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageKind::Jpeg));
        assert_eq!(sniff(b"not an image"), None);
    }

    #[test]
    fn decode_rejects_unknown_signature() {
        assert!(decode_image(b"????").is_err());
    }
}
