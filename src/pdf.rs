use crate::debug::DebugLogger;
use crate::error::PlatenError;
use crate::raster::{ColorModel, DecodedImage, StreamFilter, decode_image};
use crate::types::{Size, fmt_pt};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

const PDF_CATALOG_ID: usize = 1;
const PDF_PAGES_ID: usize = 2;
const PDF_RESOURCES_ID: usize = 3;

// Keep the page tree shallow but avoid huge /Kids arrays for large outputs.
const PDF_PAGE_NODE_MAX_KIDS: usize = 256;

#[derive(Debug, Clone)]
pub struct PdfOptions {
    // When true, identical image payloads are embedded once and reused via a
    // single XObject resource.
    pub reuse_xobjects: bool,
    pub producer: Option<String>,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            reuse_xobjects: true,
            producer: None,
        }
    }
}

/// Handle to an embedded image XObject: the resource name to use from
/// content-stream text plus the dimensions the dictionary declares.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub name: String,
    pub object_id: usize,
    pub width: u32,
    pub height: u32,
}

/// Low-level indirect-object sink: monotonically increasing object ids, a
/// byte-offset slot per id, and one-shot cross-reference emission. Offsets
/// are tentatively captured at allocation and re-stamped the moment the
/// object's bytes are written, so reserve-then-write patterns stay correct.
pub struct ObjectStream<'a, W: Write> {
    writer: &'a mut W,
    offset: usize,
    offsets: Vec<usize>, // index by object id; 0 is the free object.
    next_id: usize,
    finished: Option<usize>,
}

impl<'a, W: Write> ObjectStream<'a, W> {
    pub fn new(writer: &'a mut W) -> io::Result<Self> {
        let mut offset = 0usize;
        write_bytes(writer, b"%PDF-1.7\n", &mut offset)?;
        write_bytes(writer, b"%\xE2\xE3\xCF\xD3\n", &mut offset)?;
        Ok(Self {
            writer,
            offset,
            offsets: vec![0],
            next_id: 1,
            finished: None,
        })
    }

    pub fn alloc_id(&mut self) -> usize {
        self.alloc_ids(1)
    }

    pub fn alloc_ids(&mut self, count: usize) -> usize {
        let start = self.next_id;
        self.next_id = self.next_id.saturating_add(count);
        self.offsets.resize(self.next_id, self.offset);
        start
    }

    /// Current write position of the sink.
    pub fn bytes_written(&self) -> usize {
        self.offset
    }

    pub fn write_object(&mut self, obj_id: usize, body: &[u8]) -> io::Result<()> {
        if let Some(slot) = self.offsets.get_mut(obj_id) {
            *slot = self.offset;
        }
        write_bytes(
            self.writer,
            format!("{} 0 obj\n", obj_id).as_bytes(),
            &mut self.offset,
        )?;
        write_bytes(self.writer, body, &mut self.offset)?;
        write_bytes(self.writer, b"\nendobj\n", &mut self.offset)?;
        Ok(())
    }

    /// Emit the cross-reference section and trailer. Idempotent: the second
    /// and later calls do nothing and report the same byte count.
    pub fn finish(&mut self, root_id: usize, info_id: Option<usize>) -> io::Result<usize> {
        if let Some(total) = self.finished {
            return Ok(total);
        }
        let total_objects = self.next_id - 1;
        let xref_start = self.offset;
        write_bytes(
            self.writer,
            format!("xref\n0 {}\n", total_objects + 1).as_bytes(),
            &mut self.offset,
        )?;
        write_bytes(self.writer, b"0000000000 65535 f \n", &mut self.offset)?;
        for id in 1..=total_objects {
            let obj_offset = self.offsets.get(id).copied().unwrap_or(0);
            write_bytes(
                self.writer,
                format!("{:010} 00000 n \n", obj_offset).as_bytes(),
                &mut self.offset,
            )?;
        }
        let mut trailer = format!(
            "trailer\n<< /Size {} /Root {} 0 R",
            total_objects + 1,
            root_id
        );
        if let Some(id) = info_id {
            trailer.push_str(&format!(" /Info {} 0 R", id));
        }
        trailer.push_str(&format!(" >>\nstartxref\n{}\n%%EOF", xref_start));
        write_bytes(self.writer, trailer.as_bytes(), &mut self.offset)?;
        self.finished = Some(self.offset);
        Ok(self.offset)
    }
}

struct PdfPageNode {
    id: usize,
    kids: Vec<usize>,
}

/// Streaming document writer: owns the object sink, the structural objects
/// (catalog, page tree, shared resources) and the image XObject resources.
pub struct PdfWriter<'a, W: Write> {
    objects: ObjectStream<'a, W>,
    page_size: Size,
    options: PdfOptions,
    debug: Option<Arc<DebugLogger>>,

    image_resources: Vec<(String, usize)>,
    image_content_map: HashMap<u64, ImageRef>,
    next_image_index: usize,
    image_bytes_total: usize,

    page_nodes: Vec<PdfPageNode>,
    current_node: Option<PdfPageNode>,
    page_count: usize,
    finished: Option<usize>,
}

impl<'a, W: Write> PdfWriter<'a, W> {
    pub fn new(
        writer: &'a mut W,
        page_size: Size,
        options: PdfOptions,
        debug: Option<Arc<DebugLogger>>,
    ) -> io::Result<Self> {
        let mut objects = ObjectStream::new(writer)?;
        // Ids 1..=3 are reserved for catalog, page-tree root and resources.
        let reserved = objects.alloc_ids(PDF_RESOURCES_ID);
        debug_assert_eq!(reserved, PDF_CATALOG_ID);
        Ok(Self {
            objects,
            page_size,
            options,
            debug,
            image_resources: Vec::new(),
            image_content_map: HashMap::new(),
            next_image_index: 1,
            image_bytes_total: 0,
            page_nodes: Vec::new(),
            current_node: None,
            page_count: 0,
            finished: None,
        })
    }

    pub fn page_size(&self) -> Size {
        self.page_size
    }

    /// Decode raw image bytes (dispatching on the magic) and embed them.
    pub fn embed_image_bytes(&mut self, data: &[u8]) -> Result<ImageRef, PlatenError> {
        let image = decode_image(data)?;
        self.embed_image(&image)
    }

    /// Embed a decoded image as an XObject, synthesizing an `/SMask` object
    /// when the image carries an alpha plane. The stream dictionaries declare
    /// their `/Length` through a separate indirect object written right after
    /// each stream.
    pub fn embed_image(&mut self, image: &DecodedImage) -> Result<ImageRef, PlatenError> {
        let hash = hash_image(image);
        if self.options.reuse_xobjects {
            if let Some(existing) = self.image_content_map.get(&hash) {
                return Ok(existing.clone());
            }
        }

        let smask_id = match image.alpha.as_deref() {
            Some(alpha) => {
                let obj_id = self.objects.alloc_id();
                let length_id = self.objects.alloc_id();
                let dict = format!(
                    "<< /Type /XObject /Subtype /Image /Width {} /Height {} \
                     /ColorSpace /DeviceGray /BitsPerComponent 8 /Filter /FlateDecode \
                     /Length {} 0 R >>",
                    image.width, image.height, length_id
                );
                self.write_stream(obj_id, length_id, &dict, alpha)?;
                self.image_bytes_total += alpha.len();
                Some(obj_id)
            }
            None => None,
        };

        let obj_id = self.objects.alloc_id();
        let length_id = self.objects.alloc_id();
        let mut dict = format!(
            "<< /Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace {} \
             /BitsPerComponent {} /Filter {}",
            image.width,
            image.height,
            colorspace_entry(&image.color),
            image.bits_per_component,
            match image.filter {
                StreamFilter::Flate => "/FlateDecode",
                StreamFilter::Dct => "/DCTDecode",
            },
        );
        if let Some(decode) = image.decode_array {
            dict.push_str(&format!(" /Decode {}", decode));
        }
        if let Some(id) = smask_id {
            dict.push_str(&format!(" /SMask {} 0 R", id));
        }
        dict.push_str(&format!(" /Length {} 0 R >>", length_id));
        self.write_stream(obj_id, length_id, &dict, &image.data)?;
        self.image_bytes_total += image.data.len();

        let name = format!("Im{}", self.next_image_index);
        self.next_image_index += 1;
        self.image_resources.push((name.clone(), obj_id));

        let image_ref = ImageRef {
            name,
            object_id: obj_id,
            width: image.width,
            height: image.height,
        };
        if self.options.reuse_xobjects {
            self.image_content_map.insert(hash, image_ref.clone());
        }
        if let Some(logger) = self.debug.as_deref() {
            logger.log_event(
                "pdf.image",
                &[
                    ("name", format!("\"{}\"", image_ref.name)),
                    ("object", image_ref.object_id.to_string()),
                    ("width", image.width.to_string()),
                    ("height", image.height.to_string()),
                    ("bytes", image.data.len().to_string()),
                    ("smask", smask_id.is_some().to_string()),
                ],
            );
            logger.increment("pdf.images", 1);
        }
        Ok(image_ref)
    }

    /// Append a page whose content stream is composed by the caller; resource
    /// names (`/Im1` and friends) resolve through the shared resources
    /// dictionary.
    pub fn add_page(&mut self, content: &str) -> io::Result<()> {
        let parent_id = self.ensure_page_node();
        let start = self.objects.alloc_ids(2);
        let content_id = start;
        let page_id = start + 1;

        if let Some(node) = self.current_node.as_mut() {
            node.kids.push(page_id);
        }

        self.objects
            .write_object(content_id, stream_object(content).as_bytes())?;
        let page_obj = format!(
            "<< /Type /Page /Parent {} 0 R /MediaBox [0 0 {} {}] /Resources {} 0 R /Contents {} 0 R >>",
            parent_id,
            fmt_pt(self.page_size.width),
            fmt_pt(self.page_size.height),
            PDF_RESOURCES_ID,
            content_id
        );
        self.objects.write_object(page_id, page_obj.as_bytes())?;
        self.page_count += 1;
        Ok(())
    }

    /// Write the remaining structural objects, then the cross-reference table
    /// and trailer. Idempotent like [`ObjectStream::finish`].
    pub fn finish(&mut self) -> io::Result<usize> {
        if let Some(total) = self.finished {
            return Ok(total);
        }
        if let Some(node) = self.current_node.take() {
            self.page_nodes.push(node);
        }

        let mut resources = String::from("<< ");
        if !self.image_resources.is_empty() {
            resources.push_str("/XObject << ");
            for (name, id) in &self.image_resources {
                resources.push_str(&format!("/{} {} 0 R ", name, id));
            }
            resources.push_str(">> ");
        }
        resources.push_str(">>");
        self.objects
            .write_object(PDF_RESOURCES_ID, resources.as_bytes())?;

        let page_nodes = std::mem::take(&mut self.page_nodes);
        for node in &page_nodes {
            let kids = node
                .kids
                .iter()
                .map(|id| format!("{} 0 R", id))
                .collect::<Vec<_>>()
                .join(" ");
            self.objects.write_object(
                node.id,
                format!(
                    "<< /Type /Pages /Parent {} 0 R /Count {} /Kids [{}] >>",
                    PDF_PAGES_ID,
                    node.kids.len(),
                    kids
                )
                .as_bytes(),
            )?;
        }

        let kids = page_nodes
            .iter()
            .map(|n| format!("{} 0 R", n.id))
            .collect::<Vec<_>>()
            .join(" ");
        self.objects.write_object(
            PDF_PAGES_ID,
            format!(
                "<< /Type /Pages /Count {} /Kids [{}] >>",
                self.page_count, kids
            )
            .as_bytes(),
        )?;

        let info_id = match self.options.producer.clone() {
            Some(producer) => {
                let id = self.objects.alloc_id();
                self.objects.write_object(
                    id,
                    format!("<< /Producer ({}) >>", escape_pdf_string(&producer)).as_bytes(),
                )?;
                Some(id)
            }
            None => None,
        };

        self.objects.write_object(
            PDF_CATALOG_ID,
            format!("<< /Type /Catalog /Pages {} 0 R >>", PDF_PAGES_ID).as_bytes(),
        )?;

        let total = self.objects.finish(PDF_CATALOG_ID, info_id)?;
        self.finished = Some(total);

        if let Some(logger) = self.debug.as_deref() {
            logger.log_event(
                "pdf.link",
                &[
                    ("bytes", total.to_string()),
                    ("pages", self.page_count.to_string()),
                    ("images", self.image_resources.len().to_string()),
                    ("image_bytes", self.image_bytes_total.to_string()),
                ],
            );
            logger.flush();
        }
        Ok(total)
    }

    fn ensure_page_node(&mut self) -> usize {
        let needs_new = self
            .current_node
            .as_ref()
            .map(|n| n.kids.len() >= PDF_PAGE_NODE_MAX_KIDS)
            .unwrap_or(true);
        if needs_new {
            if let Some(node) = self.current_node.take() {
                self.page_nodes.push(node);
            }
            let id = self.objects.alloc_id();
            self.current_node = Some(PdfPageNode {
                id,
                kids: Vec::with_capacity(PDF_PAGE_NODE_MAX_KIDS),
            });
        }
        self.current_node
            .as_ref()
            .map(|n| n.id)
            .unwrap_or(PDF_PAGES_ID)
    }

    /// Stream dictionary + binary payload, then the deferred length object.
    fn write_stream(
        &mut self,
        obj_id: usize,
        length_id: usize,
        dict: &str,
        payload: &[u8],
    ) -> io::Result<()> {
        let mut body = Vec::with_capacity(dict.len() + payload.len() + 20);
        body.extend_from_slice(dict.as_bytes());
        body.extend_from_slice(b"\nstream\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(b"\nendstream");
        self.objects.write_object(obj_id, &body)?;
        self.objects
            .write_object(length_id, payload.len().to_string().as_bytes())?;
        Ok(())
    }
}

fn colorspace_entry(color: &ColorModel) -> String {
    match color {
        ColorModel::DeviceRgb => "/DeviceRGB".to_string(),
        ColorModel::DeviceGray => "/DeviceGray".to_string(),
        ColorModel::DeviceCmyk => "/DeviceCMYK".to_string(),
        ColorModel::Indexed(palette) => {
            let mut hex = String::with_capacity(palette.len() * 6);
            for entry in palette {
                hex.push_str(&format!("{:02X}{:02X}{:02X}", entry[0], entry[1], entry[2]));
            }
            format!(
                "[/Indexed /DeviceRGB {} <{}>]",
                palette.len().saturating_sub(1),
                hex
            )
        }
    }
}

fn stream_object(content: &str) -> String {
    let length = content.as_bytes().len();
    format!("<< /Length {} >>\nstream\n{}\nendstream", length, content)
}

fn write_bytes<W: Write>(writer: &mut W, data: &[u8], offset: &mut usize) -> io::Result<()> {
    writer.write_all(data)?;
    *offset += data.len();
    Ok(())
}

fn escape_pdf_string(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

fn hash_image(image: &DecodedImage) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    image.data.hash(&mut hasher);
    if let Some(alpha) = &image.alpha {
        alpha.hash(&mut hasher);
    }
    image.width.hash(&mut hasher);
    image.height.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flate;
    use crate::types::Pt;

    fn page_size() -> Size {
        Size {
            width: Pt::from_f32(200.0),
            height: Pt::from_f32(100.0),
        }
    }

    fn rgb_image() -> DecodedImage {
        DecodedImage {
            width: 2,
            height: 1,
            bits_per_component: 8,
            color: ColorModel::DeviceRgb,
            alpha: None,
            data: flate::deflate(&[1, 2, 3, 4, 5, 6]),
            filter: StreamFilter::Flate,
            decode_array: None,
        }
    }

    #[test]
    fn recorded_offsets_match_sink_positions() {
        let mut buf: Vec<u8> = Vec::new();
        let mut positions = Vec::new();
        {
            let mut objects = ObjectStream::new(&mut buf).unwrap();
            let root = objects.alloc_id();
            objects.write_object(root, b"<< /Type /Catalog >>").unwrap();
            for _ in 0..5 {
                let id = objects.alloc_id();
                positions.push((id, objects.bytes_written()));
                objects.write_object(id, b"0").unwrap();
            }
            objects.finish(root, None).unwrap();
        }
        let text = String::from_utf8_lossy(&buf);
        let xref_at = text.find("xref\n").unwrap();
        let lines: Vec<&str> = text[xref_at..].lines().collect();
        assert_eq!(lines[1], "0 7");
        for (id, position) in positions {
            let line = lines[2 + id];
            assert_eq!(
                line,
                format!("{:010} 00000 n ", position),
                "object {id} offset"
            );
        }
    }

    #[test]
    fn five_trivial_objects_give_size_six() {
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut objects = ObjectStream::new(&mut buf).unwrap();
            let start = objects.alloc_ids(5);
            assert_eq!(start, 1);
            for id in 1..=5 {
                objects.write_object(id, b"0").unwrap();
            }
            objects.finish(1, None).unwrap();
        }
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("xref\n0 6\n"));
        assert!(text.contains("/Size 6"));
        let entries = text
            .lines()
            .filter(|l| l.ends_with("n ") || l.ends_with("f "))
            .count();
        assert_eq!(entries, 6);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut buf: Vec<u8> = Vec::new();
        let len_after_first;
        {
            let mut writer =
                PdfWriter::new(&mut buf, page_size(), PdfOptions::default(), None).unwrap();
            writer.add_page("0 0 10 10 re f").unwrap();
            let first = writer.finish().unwrap();
            len_after_first = first;
            let second = writer.finish().unwrap();
            assert_eq!(first, second);
        }
        assert_eq!(buf.len(), len_after_first);
    }

    #[test]
    fn identical_images_are_embedded_once() {
        let mut buf: Vec<u8> = Vec::new();
        let mut writer =
            PdfWriter::new(&mut buf, page_size(), PdfOptions::default(), None).unwrap();
        let a = writer.embed_image(&rgb_image()).unwrap();
        let b = writer.embed_image(&rgb_image()).unwrap();
        assert_eq!(a.name, b.name);
        assert_eq!(a.object_id, b.object_id);
    }

    #[test]
    fn indexed_colorspace_lists_hex_triples() {
        let entry = colorspace_entry(&ColorModel::Indexed(vec![[0, 0, 0], [255, 128, 0]]));
        assert_eq!(entry, "[/Indexed /DeviceRGB 1 <000000FF8000>]");
    }

    #[test]
    fn document_parses_with_lopdf() {
        let mut buf: Vec<u8> = Vec::new();
        let image_id;
        {
            let mut writer = PdfWriter::new(
                &mut buf,
                page_size(),
                PdfOptions {
                    producer: Some("platen test".to_string()),
                    ..PdfOptions::default()
                },
                None,
            )
            .unwrap();
            let image = writer.embed_image(&rgb_image()).unwrap();
            image_id = image.object_id;
            let content = format!(
                "q {} 0 0 {} 10 10 cm /{} Do Q",
                image.width, image.height, image.name
            );
            writer.add_page(&content).unwrap();
            writer.finish().unwrap();
        }

        let doc = lopdf::Document::load_mem(&buf).expect("valid pdf");
        assert_eq!(doc.get_pages().len(), 1);
        let size = doc
            .trailer
            .get(b"Size")
            .and_then(|o| o.as_i64())
            .expect("trailer size");
        assert!(size > 6);

        let stream = doc
            .get_object((image_id as u32, 0))
            .and_then(|o| o.as_stream())
            .expect("image stream");
        let width = stream
            .dict
            .get(b"Width")
            .and_then(|o| o.as_i64())
            .expect("width");
        assert_eq!(width, 2);
        let pixels = stream
            .get_plain_content()
            .expect("flate-decoded image payload");
        assert_eq!(pixels, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn smask_image_links_mask_object() {
        let mut buf: Vec<u8> = Vec::new();
        let image = DecodedImage {
            alpha: Some(flate::deflate(&[255, 0])),
            ..rgb_image()
        };
        let mut writer =
            PdfWriter::new(&mut buf, page_size(), PdfOptions::default(), None).unwrap();
        let image_ref = writer.embed_image(&image).unwrap();
        writer.add_page(&format!("/{} Do", image_ref.name)).unwrap();
        writer.finish().unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("/SMask"));
        assert!(text.contains("/DeviceGray"));
    }
}
