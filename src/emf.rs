use crate::cursor::Cursor;
use crate::error::PlatenError;
use crate::gdi::{
    Brush, DeviceContext, Fragment, FragmentWriter, GdiObject, HandleTable, MetafileGeometry,
    PaintOp, PathPhase, Pen, Placement, PlacementOptions, auto_paint, mat_mul, push_font,
    utf16_facename,
};
use crate::types::Color;
use crate::wmf::emit_ellipse;

const FORMAT: &str = "emf";

const EMF_SIGNATURE: u32 = 0x464D_4520; // " EMF"
const HEADER_BASE_LEN: usize = 88;
const HEADER_WITH_PIXEL_FORMAT_LEN: usize = 100;
const HEADER_WITH_MICROMETERS_LEN: usize = 108;

const EMR_HEADER: u32 = 1;
const EMR_POLYBEZIER: u32 = 2;
const EMR_POLYGON: u32 = 3;
const EMR_POLYLINE: u32 = 4;
const EMR_POLYBEZIERTO: u32 = 5;
const EMR_POLYLINETO: u32 = 6;
const EMR_POLYPOLYGON: u32 = 8;
const EMR_SETWINDOWEXTEX: u32 = 9;
const EMR_SETWINDOWORGEX: u32 = 10;
const EMR_SETVIEWPORTEXTEX: u32 = 11;
const EMR_SETVIEWPORTORGEX: u32 = 12;
const EMR_EOF: u32 = 14;
const EMR_SETMAPMODE: u32 = 17;
const EMR_SETPOLYFILLMODE: u32 = 19;
const EMR_SETROP2: u32 = 20;
const EMR_SETSTRETCHBLTMODE: u32 = 21;
const EMR_SETTEXTCOLOR: u32 = 24;
const EMR_SETBKCOLOR: u32 = 25;
const EMR_MOVETOEX: u32 = 27;
const EMR_SAVEDC: u32 = 33;
const EMR_RESTOREDC: u32 = 34;
const EMR_SETWORLDTRANSFORM: u32 = 35;
const EMR_MODIFYWORLDTRANSFORM: u32 = 36;
const EMR_SELECTOBJECT: u32 = 37;
const EMR_CREATEPEN: u32 = 38;
const EMR_CREATEBRUSHINDIRECT: u32 = 39;
const EMR_DELETEOBJECT: u32 = 40;
const EMR_ELLIPSE: u32 = 42;
const EMR_RECTANGLE: u32 = 43;
const EMR_LINETO: u32 = 54;
const EMR_BEGINPATH: u32 = 59;
const EMR_ENDPATH: u32 = 60;
const EMR_CLOSEFIGURE: u32 = 61;
const EMR_FILLPATH: u32 = 62;
const EMR_STROKEANDFILLPATH: u32 = 63;
const EMR_STROKEPATH: u32 = 64;
const EMR_SELECTCLIPPATH: u32 = 67;
const EMR_EXTCREATEFONTINDIRECTW: u32 = 82;
const EMR_POLYBEZIER16: u32 = 85;
const EMR_POLYGON16: u32 = 86;
const EMR_POLYLINE16: u32 = 87;
const EMR_POLYBEZIERTO16: u32 = 88;
const EMR_POLYLINETO16: u32 = 89;
const EMR_POLYPOLYGON16: u32 = 91;
const EMR_EXTCREATEPEN: u32 = 95;

const MWT_IDENTITY: u32 = 1;
const MWT_LEFTMULTIPLY: u32 = 2;
const MWT_RIGHTMULTIPLY: u32 = 3;
const MWT_SET: u32 = 4;

const STOCK_OBJECT_FLAG: u32 = 0x8000_0000;

/// Read the fixed EMF header. The declared record size selects which of the
/// optional trailing blocks (pixel-format descriptor, micrometer extent) are
/// present; whatever remains of the declared length is skipped verbatim, and
/// nothing past it is ever read.
pub fn read_header(data: &[u8]) -> Result<MetafileGeometry, PlatenError> {
    let mut cur = Cursor::new(data, FORMAT);

    let record_type = cur.read_u32_le()?;
    if record_type != EMR_HEADER {
        return Err(PlatenError::format(FORMAT, "missing EMR_HEADER record"));
    }
    let header_len = cur.read_u32_le()? as usize;
    if header_len < HEADER_BASE_LEN {
        return Err(PlatenError::format(
            FORMAT,
            format!("header of {header_len} bytes"),
        ));
    }

    let bounds_left = cur.read_i32_le()?;
    let bounds_top = cur.read_i32_le()?;
    let bounds_right = cur.read_i32_le()?;
    let bounds_bottom = cur.read_i32_le()?;
    let frame_left = cur.read_i32_le()?;
    let frame_top = cur.read_i32_le()?;
    let frame_right = cur.read_i32_le()?;
    let frame_bottom = cur.read_i32_le()?;

    let signature = cur.read_u32_le()?;
    if signature != EMF_SIGNATURE {
        return Err(PlatenError::format(FORMAT, "bad EMF signature"));
    }
    let _version = cur.read_u32_le()?;
    let _file_bytes = cur.read_u32_le()?;
    let _record_count = cur.read_u32_le()?;
    let _handle_count = cur.read_u16_le()?;
    let _reserved = cur.read_u16_le()?;
    let _description_len = cur.read_u32_le()?;
    let _description_off = cur.read_u32_le()?;
    let _palette_entries = cur.read_u32_le()?;
    let _device_px = (cur.read_u32_le()?, cur.read_u32_le()?);
    let _device_mm = (cur.read_u32_le()?, cur.read_u32_le()?);

    if header_len >= HEADER_WITH_PIXEL_FORMAT_LEN {
        let _pixel_format_len = cur.read_u32_le()?;
        let _pixel_format_off = cur.read_u32_le()?;
        let _opengl = cur.read_u32_le()?;
    }
    if header_len >= HEADER_WITH_MICROMETERS_LEN {
        let _micrometers = (cur.read_u32_le()?, cur.read_u32_le()?);
    }
    // Descriptions or future extensions occupy the rest of the declared size.
    cur.seek_to(header_len)?;

    // Frame is in hundredths of a millimeter.
    let width_pt = (frame_right - frame_left) as f32 / 100.0 / 25.4 * 72.0;
    let height_pt = (frame_bottom - frame_top) as f32 / 100.0 / 25.4 * 72.0;
    if width_pt <= 0.0 || height_pt <= 0.0 {
        return Err(PlatenError::format(FORMAT, "empty frame rectangle"));
    }
    let logical_width = (bounds_right - bounds_left) as f32;
    let logical_height = (bounds_bottom - bounds_top) as f32;
    if logical_width <= 0.0 || logical_height <= 0.0 {
        return Err(PlatenError::format(FORMAT, "empty bounds rectangle"));
    }

    Ok(MetafileGeometry {
        width_pt,
        height_pt,
        logical_left: bounds_left as f32,
        logical_top: bounds_top as f32,
        logical_width,
        logical_height,
        records_offset: header_len,
    })
}

struct Interpreter {
    placement: Placement,
    writer: FragmentWriter,
    dc: DeviceContext,
    dc_stack: Vec<DeviceContext>,
    table: HandleTable,
    fonts: Vec<String>,
    phase: PathPhase,
    skipped: usize,
}

/// Replay an EMF record stream into a PDF content fragment.
pub fn interpret(data: &[u8], options: &PlacementOptions) -> Result<Fragment, PlatenError> {
    let geometry = read_header(data)?;
    let placement = Placement::compute(&geometry, options)?;

    let mut cur = Cursor::new(data, FORMAT);
    cur.seek_to(geometry.records_offset)?;

    let mut ip = Interpreter {
        placement,
        writer: FragmentWriter::new(&placement),
        dc: DeviceContext::new(&geometry),
        dc_stack: Vec::new(),
        table: HandleTable::default(),
        fonts: Vec::new(),
        phase: PathPhase::Idle,
        skipped: 0,
    };

    let mut records = 0usize;
    loop {
        let record_type = cur.read_u32_le()?;
        let record_len = cur.read_u32_le()? as usize;
        if record_len < 8 {
            return Err(PlatenError::format(
                FORMAT,
                format!("record of {record_len} bytes"),
            ));
        }
        if record_type == EMR_EOF {
            break;
        }
        records += 1;
        let params = cur.read_bytes(record_len - 8)?;
        ip.dispatch(record_type, params)?;
    }

    // A path left open or unpainted at end of stream is flushed without ink.
    if ip.writer.has_shape() {
        ip.writer.end_group(PaintOp::None, None, None, 1.0);
    }

    Ok(Fragment {
        content: ip.writer.finish(&placement),
        fonts: ip.fonts,
        records,
        skipped: ip.skipped,
    })
}

impl Interpreter {
    fn dispatch(&mut self, record_type: u32, params: &[u8]) -> Result<(), PlatenError> {
        let mut p = Cursor::new(params, FORMAT);
        match record_type {
            EMR_SETWINDOWORGEX => {
                let x = p.read_i32_le()? as f32;
                let y = p.read_i32_le()? as f32;
                self.dc.window_org = (x, y);
            }
            EMR_SETWINDOWEXTEX => {
                let cx = p.read_i32_le()? as f32;
                let cy = p.read_i32_le()? as f32;
                self.dc.window_ext = (cx, cy);
            }
            EMR_MOVETOEX => {
                let x = p.read_i32_le()? as f32;
                let y = p.read_i32_le()? as f32;
                self.dc.position = (x, y);
                if self.phase == PathPhase::Open {
                    let (px, py) = self.dc.map(&self.placement, x, y);
                    self.writer.move_to(px, py);
                }
            }
            EMR_LINETO => {
                let x = p.read_i32_le()? as f32;
                let y = p.read_i32_le()? as f32;
                if self.phase == PathPhase::Open {
                    self.ensure_subpath();
                    let (px, py) = self.dc.map(&self.placement, x, y);
                    self.writer.line_to(px, py);
                } else {
                    let pen_active = self.dc.pen.map(|p| !p.is_null()).unwrap_or(true);
                    if pen_active {
                        let (sx, sy) =
                            self.dc.map(&self.placement, self.dc.position.0, self.dc.position.1);
                        let (ex, ey) = self.dc.map(&self.placement, x, y);
                        self.writer.move_to(sx, sy);
                        self.writer.line_to(ex, ey);
                        self.end_shape(PaintOp::Stroke);
                    }
                }
                self.dc.position = (x, y);
            }
            EMR_POLYGON | EMR_POLYGON16 | EMR_POLYLINE | EMR_POLYLINE16 => {
                let wide = matches!(record_type, EMR_POLYGON | EMR_POLYLINE);
                let points = read_poly_points(&mut p, wide)?;
                if points.is_empty() {
                    return Ok(());
                }
                self.emit_points(&points, true);
                let closed = matches!(record_type, EMR_POLYGON | EMR_POLYGON16);
                if closed {
                    self.writer.close_figure();
                }
                if self.phase == PathPhase::Idle {
                    let paint = if closed {
                        auto_paint(self.dc.pen.as_ref(), self.dc.brush.as_ref())
                    } else {
                        PaintOp::Stroke
                    };
                    self.end_shape(paint);
                }
            }
            EMR_POLYLINETO | EMR_POLYLINETO16 => {
                let wide = record_type == EMR_POLYLINETO;
                let points = read_poly_points(&mut p, wide)?;
                if points.is_empty() {
                    return Ok(());
                }
                self.ensure_subpath();
                for &(x, y) in &points {
                    let (px, py) = self.dc.map(&self.placement, x, y);
                    self.writer.line_to(px, py);
                }
                self.dc.position = *points.last().expect("nonempty");
                if self.phase == PathPhase::Idle {
                    self.end_shape(PaintOp::Stroke);
                }
            }
            EMR_POLYBEZIER | EMR_POLYBEZIER16 | EMR_POLYBEZIERTO | EMR_POLYBEZIERTO16 => {
                let wide = matches!(record_type, EMR_POLYBEZIER | EMR_POLYBEZIERTO);
                let continues =
                    matches!(record_type, EMR_POLYBEZIERTO | EMR_POLYBEZIERTO16);
                let points = read_poly_points(&mut p, wide)?;
                self.emit_beziers(&points, continues)?;
                if self.phase == PathPhase::Idle && self.writer.has_shape() {
                    self.end_shape(auto_paint(self.dc.pen.as_ref(), self.dc.brush.as_ref()));
                }
            }
            EMR_POLYPOLYGON | EMR_POLYPOLYGON16 => {
                let wide = record_type == EMR_POLYPOLYGON;
                p.skip(16)?; // bounds
                let polygon_count = p.read_u32_le()? as usize;
                let _total_points = p.read_u32_le()?;
                let mut counts = Vec::with_capacity(polygon_count);
                for _ in 0..polygon_count {
                    counts.push(p.read_u32_le()? as usize);
                }
                for count in counts {
                    let points = read_points(&mut p, count, wide)?;
                    if points.is_empty() {
                        continue;
                    }
                    self.emit_points(&points, true);
                    self.writer.close_figure();
                }
                if self.phase == PathPhase::Idle {
                    self.end_shape(auto_paint(self.dc.pen.as_ref(), self.dc.brush.as_ref()));
                }
            }
            EMR_RECTANGLE | EMR_ELLIPSE => {
                let left = p.read_i32_le()? as f32;
                let top = p.read_i32_le()? as f32;
                let right = p.read_i32_le()? as f32;
                let bottom = p.read_i32_le()? as f32;
                if record_type == EMR_RECTANGLE {
                    let corners = [(left, top), (right, top), (right, bottom), (left, bottom)];
                    self.emit_points(&corners, true);
                    self.writer.close_figure();
                } else {
                    emit_ellipse(
                        &mut self.writer,
                        &self.dc,
                        &self.placement,
                        left,
                        top,
                        right,
                        bottom,
                    );
                }
                if self.phase == PathPhase::Idle {
                    self.end_shape(auto_paint(self.dc.pen.as_ref(), self.dc.brush.as_ref()));
                }
            }
            EMR_BEGINPATH => {
                if self.phase == PathPhase::Open {
                    return Err(PlatenError::state("BeginPath while a path is open"));
                }
                // An ended path that was never painted is dropped without ink.
                if self.phase == PathPhase::Complete && self.writer.has_shape() {
                    self.writer.end_group(PaintOp::None, None, None, 1.0);
                }
                self.phase = PathPhase::Open;
            }
            EMR_ENDPATH => {
                if self.phase != PathPhase::Open {
                    return Err(PlatenError::state("EndPath without an open path"));
                }
                self.phase = PathPhase::Complete;
            }
            EMR_CLOSEFIGURE => {
                if self.phase != PathPhase::Open {
                    return Err(PlatenError::state("CloseFigure outside a path"));
                }
                self.writer.close_figure();
            }
            EMR_FILLPATH | EMR_STROKEPATH | EMR_STROKEANDFILLPATH => {
                if self.phase == PathPhase::Idle {
                    return Err(PlatenError::state("paint of a path that was never opened"));
                }
                let paint = match record_type {
                    EMR_FILLPATH => PaintOp::Fill,
                    EMR_STROKEPATH => PaintOp::Stroke,
                    _ => PaintOp::FillStroke,
                };
                self.end_shape(paint);
                self.phase = PathPhase::Idle;
            }
            EMR_SELECTCLIPPATH => {
                if self.phase != PathPhase::Complete {
                    return Err(PlatenError::state("SelectClipPath without an ended path"));
                }
                self.writer.clip_group();
                self.phase = PathPhase::Idle;
            }
            EMR_SETWORLDTRANSFORM => {
                self.dc.transform = read_xform(&mut p)?;
            }
            EMR_MODIFYWORLDTRANSFORM => {
                let xform = read_xform(&mut p)?;
                let mode = p.read_u32_le()?;
                match mode {
                    MWT_IDENTITY => self.dc.transform = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
                    MWT_LEFTMULTIPLY => {
                        self.dc.transform = mat_mul(self.dc.transform, xform);
                    }
                    MWT_RIGHTMULTIPLY => {
                        self.dc.transform = mat_mul(xform, self.dc.transform);
                    }
                    MWT_SET => self.dc.transform = xform,
                    other => {
                        return Err(PlatenError::format(
                            FORMAT,
                            format!("world transform mode {other}"),
                        ));
                    }
                }
            }
            EMR_SAVEDC => self.dc_stack.push(self.dc),
            EMR_RESTOREDC => {
                let _depth = p.read_i32_le()?;
                if let Some(saved) = self.dc_stack.pop() {
                    self.dc = saved;
                }
            }
            EMR_SELECTOBJECT => {
                let handle = p.read_u32_le()?;
                self.select_object(handle)?;
            }
            EMR_CREATEPEN => {
                let handle = p.read_u32_le()? as usize;
                let style = p.read_u32_le()?;
                let width = p.read_i32_le()? as f32;
                let _width_y = p.read_i32_le()?;
                let color = Color::from_colorref(p.read_u32_le()?);
                self.table
                    .insert_at(handle, GdiObject::Pen(Pen { color, width, style }));
            }
            EMR_EXTCREATEPEN => {
                let handle = p.read_u32_le()? as usize;
                p.skip(16)?; // DIB offsets/sizes for pattern pens
                let style = p.read_u32_le()?;
                let width = p.read_u32_le()? as f32;
                let _brush_style = p.read_u32_le()?;
                let color = Color::from_colorref(p.read_u32_le()?);
                self.table
                    .insert_at(handle, GdiObject::Pen(Pen { color, width, style }));
            }
            EMR_CREATEBRUSHINDIRECT => {
                let handle = p.read_u32_le()? as usize;
                let style = p.read_u32_le()?;
                let color = Color::from_colorref(p.read_u32_le()?);
                let _hatch = p.read_u32_le()?;
                self.table
                    .insert_at(handle, GdiObject::Brush(Brush { color, style }));
            }
            EMR_DELETEOBJECT => {
                let handle = p.read_u32_le()? as usize;
                self.table.remove(handle);
            }
            EMR_EXTCREATEFONTINDIRECTW => {
                let handle = p.read_u32_le()? as usize;
                // LOGFONTW: five LONG metrics, eight attribute bytes, then a
                // 32-character UTF-16 facename.
                p.skip(20)?;
                p.skip(8)?;
                let name_len = p.remaining().min(64);
                let name = utf16_facename(p.read_bytes(name_len)?);
                push_font(&mut self.fonts, name.clone());
                self.table.insert_at(handle, GdiObject::Font(name));
            }
            EMR_SETVIEWPORTEXTEX | EMR_SETVIEWPORTORGEX | EMR_SETMAPMODE
            | EMR_SETPOLYFILLMODE | EMR_SETROP2 | EMR_SETSTRETCHBLTMODE | EMR_SETTEXTCOLOR
            | EMR_SETBKCOLOR => {}
            _ => self.skipped += 1,
        }
        Ok(())
    }

    fn select_object(&mut self, handle: u32) -> Result<(), PlatenError> {
        if handle & STOCK_OBJECT_FLAG != 0 {
            match handle & !STOCK_OBJECT_FLAG {
                0 => self.dc.brush = Some(Brush { color: Color::WHITE, style: 0 }),
                1 => self.dc.brush = Some(Brush { color: Color::rgb(0.75, 0.75, 0.75), style: 0 }),
                2 => self.dc.brush = Some(Brush { color: Color::rgb(0.5, 0.5, 0.5), style: 0 }),
                3 => self.dc.brush = Some(Brush { color: Color::rgb(0.25, 0.25, 0.25), style: 0 }),
                4 => self.dc.brush = Some(Brush { color: Color::BLACK, style: 0 }),
                5 => self.dc.brush = Some(Brush { color: Color::WHITE, style: crate::gdi::BS_NULL }),
                6 => self.dc.pen = Some(Pen { color: Color::WHITE, width: 0.0, style: 0 }),
                7 => self.dc.pen = Some(Pen { color: Color::BLACK, width: 0.0, style: 0 }),
                8 => self.dc.pen = Some(Pen { color: Color::BLACK, width: 0.0, style: crate::gdi::PS_NULL }),
                _ => {}
            }
            return Ok(());
        }
        match self.table.get(handle as usize)? {
            GdiObject::Pen(pen) => self.dc.pen = Some(*pen),
            GdiObject::Brush(brush) => self.dc.brush = Some(*brush),
            GdiObject::Font(_) | GdiObject::Unsupported => {}
        }
        Ok(())
    }

    fn ensure_subpath(&mut self) {
        if !self.writer.has_shape() {
            let (px, py) = self
                .dc
                .map(&self.placement, self.dc.position.0, self.dc.position.1);
            self.writer.move_to(px, py);
        }
    }

    fn emit_points(&mut self, points: &[(f32, f32)], start_subpath: bool) {
        for (i, &(x, y)) in points.iter().enumerate() {
            let (px, py) = self.dc.map(&self.placement, x, y);
            if i == 0 && start_subpath {
                self.writer.move_to(px, py);
            } else {
                self.writer.line_to(px, py);
            }
        }
        if let Some(&last) = points.last() {
            self.dc.position = last;
        }
    }

    fn emit_beziers(&mut self, points: &[(f32, f32)], continues: bool) -> Result<(), PlatenError> {
        let curve_points = if continues {
            self.ensure_subpath();
            points
        } else {
            let Some((&first, rest)) = points.split_first() else {
                return Ok(());
            };
            let (px, py) = self.dc.map(&self.placement, first.0, first.1);
            self.writer.move_to(px, py);
            self.dc.position = first;
            rest
        };
        if curve_points.len() % 3 != 0 {
            return Err(PlatenError::format(
                FORMAT,
                format!("bezier run of {} control points", curve_points.len()),
            ));
        }
        for triple in curve_points.chunks_exact(3) {
            let (c1x, c1y) = self.dc.map(&self.placement, triple[0].0, triple[0].1);
            let (c2x, c2y) = self.dc.map(&self.placement, triple[1].0, triple[1].1);
            let (ex, ey) = self.dc.map(&self.placement, triple[2].0, triple[2].1);
            self.writer.curve_to(c1x, c1y, c2x, c2y, ex, ey);
            self.dc.position = triple[2];
        }
        Ok(())
    }

    fn end_shape(&mut self, paint: PaintOp) {
        let scale = self.dc.unit_scale(&self.placement);
        self.writer
            .end_group(paint, self.dc.pen.as_ref(), self.dc.brush.as_ref(), scale);
    }
}

fn read_xform(p: &mut Cursor<'_>) -> Result<[f32; 6], PlatenError> {
    Ok([
        p.read_f32_le()?,
        p.read_f32_le()?,
        p.read_f32_le()?,
        p.read_f32_le()?,
        p.read_f32_le()?,
        p.read_f32_le()?,
    ])
}

fn read_points(
    p: &mut Cursor<'_>,
    count: usize,
    wide: bool,
) -> Result<Vec<(f32, f32)>, PlatenError> {
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let (x, y) = if wide {
            (p.read_i32_le()? as f32, p.read_i32_le()? as f32)
        } else {
            (p.read_i16_le()? as f32, p.read_i16_le()? as f32)
        };
        points.push((x, y));
    }
    Ok(points)
}

/// Bounds rectangle, point count, then the points themselves.
fn read_poly_points(p: &mut Cursor<'_>, wide: bool) -> Result<Vec<(f32, f32)>, PlatenError> {
    p.skip(16)?;
    let count = p.read_u32_le()? as usize;
    read_points(p, count, wide)
}
