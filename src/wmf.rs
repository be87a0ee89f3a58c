use crate::cursor::Cursor;
use crate::error::PlatenError;
use crate::gdi::{
    Brush, DeviceContext, Fragment, FragmentWriter, GdiObject, HandleTable, MetafileGeometry,
    PaintOp, Pen, Placement, PlacementOptions, ascii_facename, auto_paint, push_font,
};
use crate::types::Color;

const FORMAT: &str = "wmf";

const PLACEABLE_MAGIC: u32 = 0x9AC6_CDD7;
const PLACEABLE_LEN: usize = 22;
const HEADER_LEN: usize = 18;
/// Logical units per inch when no placeable header declares one (twips).
const DEFAULT_UNITS_PER_INCH: f32 = 1440.0;

const META_EOF: u16 = 0x0000;
const META_SAVEDC: u16 = 0x001E;
const META_CREATEPALETTE: u16 = 0x00F7;
const META_SETBKMODE: u16 = 0x0102;
const META_SETMAPMODE: u16 = 0x0103;
const META_SETROP2: u16 = 0x0104;
const META_SETPOLYFILLMODE: u16 = 0x0106;
const META_RESTOREDC: u16 = 0x0127;
const META_SELECTOBJECT: u16 = 0x012D;
const META_DIBCREATEPATTERNBRUSH: u16 = 0x0142;
const META_DELETEOBJECT: u16 = 0x01F0;
const META_CREATEPATTERNBRUSH: u16 = 0x01F9;
const META_SETBKCOLOR: u16 = 0x0201;
const META_SETWINDOWORG: u16 = 0x020B;
const META_SETWINDOWEXT: u16 = 0x020C;
const META_LINETO: u16 = 0x0213;
const META_MOVETO: u16 = 0x0214;
const META_CREATEPENINDIRECT: u16 = 0x02FA;
const META_CREATEFONTINDIRECT: u16 = 0x02FB;
const META_CREATEBRUSHINDIRECT: u16 = 0x02FC;
const META_POLYGON: u16 = 0x0324;
const META_POLYLINE: u16 = 0x0325;
const META_ELLIPSE: u16 = 0x0418;
const META_RECTANGLE: u16 = 0x041B;
const META_POLYPOLYGON: u16 = 0x0538;
const META_CREATEREGION: u16 = 0x06FF;

const BEZIER_CIRCLE_KAPPA: f32 = 0.552_284_75;

/// Parse the optional 22-byte Aldus placeable prefix and the standard WMF
/// header, and derive the physical frame. Without a placeable prefix the
/// frame comes from the first window origin/extent records at twips scale.
pub fn read_header(data: &[u8]) -> Result<MetafileGeometry, PlatenError> {
    let mut cur = Cursor::new(data, FORMAT);

    let mut placeable = None;
    if data.len() >= 4 && u32::from_le_bytes([data[0], data[1], data[2], data[3]]) == PLACEABLE_MAGIC
    {
        cur.skip(4)?;
        let _hmf = cur.read_u16_le()?;
        let left = cur.read_i16_le()?;
        let top = cur.read_i16_le()?;
        let right = cur.read_i16_le()?;
        let bottom = cur.read_i16_le()?;
        let inch = cur.read_u16_le()?;
        let _reserved = cur.read_u32_le()?;
        let _checksum = cur.read_u16_le()?;
        if inch == 0 {
            return Err(PlatenError::format(FORMAT, "placeable header with zero inch"));
        }
        placeable = Some((left, top, right, bottom, inch));
    }

    let header_start = cur.pos();
    let file_type = cur.read_u16_le()?;
    if !matches!(file_type, 1 | 2) {
        return Err(PlatenError::format(
            FORMAT,
            format!("unknown metafile type {file_type}"),
        ));
    }
    let header_words = cur.read_u16_le()?;
    if header_words != 9 {
        return Err(PlatenError::format(
            FORMAT,
            format!("header of {header_words} words"),
        ));
    }
    let _version = cur.read_u16_le()?;
    let _file_words = cur.read_u32_le()?;
    let _object_count = cur.read_u16_le()?;
    let _max_record_words = cur.read_u32_le()?;
    let _param_count = cur.read_u16_le()?;
    let records_offset = header_start + HEADER_LEN;

    let (left, top, right, bottom, units_per_inch) = match placeable {
        Some((l, t, r, b, inch)) => (l as f32, t as f32, r as f32, b as f32, inch as f32),
        None => {
            let (org, ext) = scan_window(data, records_offset)?;
            (
                org.0,
                org.1,
                org.0 + ext.0,
                org.1 + ext.1,
                DEFAULT_UNITS_PER_INCH,
            )
        }
    };

    let logical_width = right - left;
    let logical_height = bottom - top;
    if logical_width <= 0.0 || logical_height <= 0.0 {
        return Err(PlatenError::format(FORMAT, "empty drawing bounds"));
    }

    Ok(MetafileGeometry {
        width_pt: logical_width / units_per_inch * 72.0,
        height_pt: logical_height / units_per_inch * 72.0,
        logical_left: left,
        logical_top: top,
        logical_width,
        logical_height,
        records_offset,
    })
}

/// Walk record sizes looking for the declared window origin/extent, leaving
/// the record stream untouched.
fn scan_window(data: &[u8], records_offset: usize) -> Result<((f32, f32), (f32, f32)), PlatenError> {
    let mut cur = Cursor::new(data, FORMAT);
    cur.seek_to(records_offset)?;
    let mut org: Option<(f32, f32)> = None;
    let mut ext: Option<(f32, f32)> = None;
    while cur.remaining() >= 6 {
        let size_words = cur.read_u32_le()? as usize;
        let function = cur.read_u16_le()?;
        if function == META_EOF || size_words < 3 {
            break;
        }
        let params = cur.read_bytes((size_words - 3) * 2)?;
        let mut p = Cursor::new(params, FORMAT);
        match function {
            META_SETWINDOWORG => {
                let y = p.read_i16_le()? as f32;
                let x = p.read_i16_le()? as f32;
                org = Some((x, y));
            }
            META_SETWINDOWEXT => {
                let cy = p.read_i16_le()? as f32;
                let cx = p.read_i16_le()? as f32;
                ext = Some((cx, cy));
            }
            _ => {}
        }
        if org.is_some() && ext.is_some() {
            break;
        }
    }
    let Some(ext) = ext else {
        return Err(PlatenError::format(
            FORMAT,
            "no placeable header and no window extent",
        ));
    };
    Ok((org.unwrap_or((0.0, 0.0)), ext))
}

/// Replay the record stream into a PDF content fragment.
pub fn interpret(data: &[u8], options: &PlacementOptions) -> Result<Fragment, PlatenError> {
    let geometry = read_header(data)?;
    let placement = Placement::compute(&geometry, options)?;

    let mut cur = Cursor::new(data, FORMAT);
    cur.seek_to(geometry.records_offset)?;

    let mut dc = DeviceContext::new(&geometry);
    let mut dc_stack: Vec<DeviceContext> = Vec::new();
    let mut table = HandleTable::default();
    let mut writer = FragmentWriter::new(&placement);
    let mut fonts: Vec<String> = Vec::new();
    let mut records = 0usize;
    let mut skipped = 0usize;

    loop {
        let size_words = cur.read_u32_le()? as usize;
        let function = cur.read_u16_le()?;
        if size_words < 3 {
            return Err(PlatenError::format(
                FORMAT,
                format!("record of {size_words} words"),
            ));
        }
        if function == META_EOF {
            break;
        }
        records += 1;
        let params = cur.read_bytes((size_words - 3) * 2)?;
        let mut p = Cursor::new(params, FORMAT);

        match function {
            META_SETWINDOWORG => {
                let y = p.read_i16_le()? as f32;
                let x = p.read_i16_le()? as f32;
                dc.window_org = (x, y);
            }
            META_SETWINDOWEXT => {
                let cy = p.read_i16_le()? as f32;
                let cx = p.read_i16_le()? as f32;
                dc.window_ext = (cx, cy);
            }
            META_MOVETO => {
                let y = p.read_i16_le()? as f32;
                let x = p.read_i16_le()? as f32;
                dc.position = (x, y);
            }
            META_LINETO => {
                let y = p.read_i16_le()? as f32;
                let x = p.read_i16_le()? as f32;
                let pen_active = dc.pen.map(|p| !p.is_null()).unwrap_or(true);
                if pen_active {
                    let (sx, sy) = dc.map(&placement, dc.position.0, dc.position.1);
                    let (ex, ey) = dc.map(&placement, x, y);
                    writer.move_to(sx, sy);
                    writer.line_to(ex, ey);
                    writer.end_group(
                        PaintOp::Stroke,
                        dc.pen.as_ref(),
                        dc.brush.as_ref(),
                        dc.unit_scale(&placement),
                    );
                }
                dc.position = (x, y);
            }
            META_POLYGON | META_POLYLINE => {
                let count = p.read_u16_le()? as usize;
                let points = read_points(&mut p, count)?;
                if points.is_empty() {
                    continue;
                }
                emit_polyline(&mut writer, &dc, &placement, &points);
                if function == META_POLYGON {
                    writer.close_figure();
                    writer.end_group(
                        auto_paint(dc.pen.as_ref(), dc.brush.as_ref()),
                        dc.pen.as_ref(),
                        dc.brush.as_ref(),
                        dc.unit_scale(&placement),
                    );
                } else {
                    writer.end_group(
                        PaintOp::Stroke,
                        dc.pen.as_ref(),
                        dc.brush.as_ref(),
                        dc.unit_scale(&placement),
                    );
                }
            }
            META_POLYPOLYGON => {
                let polygon_count = p.read_u16_le()? as usize;
                let mut counts = Vec::with_capacity(polygon_count);
                for _ in 0..polygon_count {
                    counts.push(p.read_u16_le()? as usize);
                }
                for count in counts {
                    let points = read_points(&mut p, count)?;
                    if points.is_empty() {
                        continue;
                    }
                    emit_polyline(&mut writer, &dc, &placement, &points);
                    writer.close_figure();
                }
                writer.end_group(
                    auto_paint(dc.pen.as_ref(), dc.brush.as_ref()),
                    dc.pen.as_ref(),
                    dc.brush.as_ref(),
                    dc.unit_scale(&placement),
                );
            }
            META_RECTANGLE => {
                let bottom = p.read_i16_le()? as f32;
                let right = p.read_i16_le()? as f32;
                let top = p.read_i16_le()? as f32;
                let left = p.read_i16_le()? as f32;
                let corners = [(left, top), (right, top), (right, bottom), (left, bottom)];
                emit_polyline(&mut writer, &dc, &placement, &corners);
                writer.close_figure();
                writer.end_group(
                    auto_paint(dc.pen.as_ref(), dc.brush.as_ref()),
                    dc.pen.as_ref(),
                    dc.brush.as_ref(),
                    dc.unit_scale(&placement),
                );
            }
            META_ELLIPSE => {
                let bottom = p.read_i16_le()? as f32;
                let right = p.read_i16_le()? as f32;
                let top = p.read_i16_le()? as f32;
                let left = p.read_i16_le()? as f32;
                emit_ellipse(&mut writer, &dc, &placement, left, top, right, bottom);
                writer.end_group(
                    auto_paint(dc.pen.as_ref(), dc.brush.as_ref()),
                    dc.pen.as_ref(),
                    dc.brush.as_ref(),
                    dc.unit_scale(&placement),
                );
            }
            META_SAVEDC => dc_stack.push(dc),
            META_RESTOREDC => {
                if let Some(saved) = dc_stack.pop() {
                    dc = saved;
                }
            }
            META_SELECTOBJECT => {
                let index = p.read_u16_le()? as usize;
                match table.get(index)? {
                    GdiObject::Pen(pen) => dc.pen = Some(*pen),
                    GdiObject::Brush(brush) => dc.brush = Some(*brush),
                    GdiObject::Font(_) | GdiObject::Unsupported => {}
                }
            }
            META_DELETEOBJECT => {
                let index = p.read_u16_le()? as usize;
                table.remove(index);
            }
            META_CREATEPENINDIRECT => {
                let style = p.read_u16_le()? as u32;
                let width_x = p.read_i16_le()? as f32;
                let _width_y = p.read_i16_le()?;
                let color = Color::from_colorref(p.read_u32_le()?);
                table.insert(GdiObject::Pen(Pen {
                    color,
                    width: width_x,
                    style,
                }));
            }
            META_CREATEBRUSHINDIRECT => {
                let style = p.read_u16_le()? as u32;
                let color = Color::from_colorref(p.read_u32_le()?);
                let _hatch = p.read_u16_le()?;
                table.insert(GdiObject::Brush(Brush { color, style }));
            }
            META_CREATEFONTINDIRECT => {
                // LOGFONT: 9 metric/flag fields (18 bytes), then the facename.
                p.skip(18)?;
                let name = ascii_facename(p.read_bytes(p.remaining())?);
                push_font(&mut fonts, name.clone());
                table.insert(GdiObject::Font(name));
            }
            META_CREATEPALETTE
            | META_CREATEPATTERNBRUSH
            | META_DIBCREATEPATTERNBRUSH
            | META_CREATEREGION => {
                // Not replayed, but the handle slot must stay occupied.
                table.insert(GdiObject::Unsupported);
                skipped += 1;
            }
            META_SETBKCOLOR | META_SETBKMODE | META_SETMAPMODE | META_SETROP2
            | META_SETPOLYFILLMODE => {}
            _ => skipped += 1,
        }
    }

    Ok(Fragment {
        content: writer.finish(&placement),
        fonts,
        records,
        skipped,
    })
}

fn read_points(p: &mut Cursor<'_>, count: usize) -> Result<Vec<(f32, f32)>, PlatenError> {
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let x = p.read_i16_le()? as f32;
        let y = p.read_i16_le()? as f32;
        points.push((x, y));
    }
    Ok(points)
}

fn emit_polyline(
    writer: &mut FragmentWriter,
    dc: &DeviceContext,
    placement: &Placement,
    points: &[(f32, f32)],
) {
    for (i, &(x, y)) in points.iter().enumerate() {
        let (px, py) = dc.map(placement, x, y);
        if i == 0 {
            writer.move_to(px, py);
        } else {
            writer.line_to(px, py);
        }
    }
}

pub(crate) fn emit_ellipse(
    writer: &mut FragmentWriter,
    dc: &DeviceContext,
    placement: &Placement,
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
) {
    let cx = (left + right) / 2.0;
    let cy = (top + bottom) / 2.0;
    let rx = (right - left) / 2.0;
    let ry = (bottom - top) / 2.0;
    let kx = rx * BEZIER_CIRCLE_KAPPA;
    let ky = ry * BEZIER_CIRCLE_KAPPA;

    let map = |x: f32, y: f32| dc.map(placement, x, y);
    let (sx, sy) = map(cx + rx, cy);
    writer.move_to(sx, sy);
    let arcs = [
        ((cx + rx, cy + ky), (cx + kx, cy + ry), (cx, cy + ry)),
        ((cx - kx, cy + ry), (cx - rx, cy + ky), (cx - rx, cy)),
        ((cx - rx, cy - ky), (cx - kx, cy - ry), (cx, cy - ry)),
        ((cx + kx, cy - ry), (cx + rx, cy - ky), (cx + rx, cy)),
    ];
    for ((x1, y1), (x2, y2), (x3, y3)) in arcs {
        let (c1x, c1y) = map(x1, y1);
        let (c2x, c2y) = map(x2, y2);
        let (ex, ey) = map(x3, y3);
        writer.curve_to(c1x, c1y, c2x, c2y, ex, ey);
    }
    writer.close_figure();
}
