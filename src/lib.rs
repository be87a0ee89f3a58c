mod cursor;
mod debug;
mod error;
mod flate;
mod gdi;
mod pdf;
mod raster;
mod types;

pub mod bmp;
pub mod emf;
pub mod gif;
pub mod jpeg;
pub mod png;
pub mod wmf;

pub use debug::DebugLogger;
pub use error::PlatenError;
pub use gdi::{
    Fragment, HorizontalAlign, MetafileGeometry, PlacementOptions, ScaleMode, VerticalAlign,
};
pub use pdf::{ImageRef, ObjectStream, PdfOptions, PdfWriter};
pub use raster::{ColorModel, DecodedImage, ImageKind, StreamFilter, decode_image, sniff};
pub use types::{Color, Margins, Pt, Size};
