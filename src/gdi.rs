use crate::error::PlatenError;
use crate::types::{Color, Margins, Size, fmt};

/// How a metafile frame is sized onto the page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleMode {
    /// Percentage of the metafile's declared size.
    Percent(f32),
    /// Largest uniform scale that fits inside the page margins.
    FitPage,
    OneToOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizontalAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerticalAlign {
    Top,
    Middle,
    Bottom,
}

#[derive(Debug, Clone, Copy)]
pub struct PlacementOptions {
    pub page_size: Size,
    pub margins: Margins,
    pub scale: ScaleMode,
    pub halign: HorizontalAlign,
    pub valign: VerticalAlign,
    /// Mirror the drawing vertically inside its frame.
    pub flip_vertical: bool,
    /// Rotation about the frame center, radians, counter-clockwise.
    pub rotation: f32,
}

impl Default for PlacementOptions {
    fn default() -> Self {
        Self {
            page_size: Size::a4(),
            margins: Margins::default(),
            scale: ScaleMode::FitPage,
            halign: HorizontalAlign::Center,
            valign: VerticalAlign::Middle,
            flip_vertical: false,
            rotation: 0.0,
        }
    }
}

/// Declared geometry of a parsed metafile header: physical frame size in
/// points plus the logical coordinate window its records draw in.
#[derive(Debug, Clone, Copy)]
pub struct MetafileGeometry {
    pub width_pt: f32,
    pub height_pt: f32,
    pub(crate) logical_left: f32,
    pub(crate) logical_top: f32,
    pub(crate) logical_width: f32,
    pub(crate) logical_height: f32,
    pub(crate) records_offset: usize,
}

/// Page placement resolved once at header-parse time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Placement {
    pub origin_x: f32,
    pub origin_y: f32,
    pub target_w: f32,
    pub target_h: f32,
    pub flip_vertical: bool,
    pub rotation: f32,
}

impl Placement {
    pub fn compute(
        geometry: &MetafileGeometry,
        options: &PlacementOptions,
    ) -> Result<Placement, PlatenError> {
        if geometry.width_pt <= 0.0 || geometry.height_pt <= 0.0 {
            return Err(PlatenError::InvalidConfiguration(
                "metafile declares a degenerate frame".to_string(),
            ));
        }
        let page_w = options.page_size.width.to_f32();
        let page_h = options.page_size.height.to_f32();
        let content_w = page_w - options.margins.left.to_f32() - options.margins.right.to_f32();
        let content_h = page_h - options.margins.top.to_f32() - options.margins.bottom.to_f32();
        if content_w <= 0.0 || content_h <= 0.0 {
            return Err(PlatenError::InvalidConfiguration(
                "margins leave no drawable area".to_string(),
            ));
        }

        let scale = match options.scale {
            ScaleMode::Percent(p) => {
                if !(p.is_finite() && p > 0.0) {
                    return Err(PlatenError::InvalidConfiguration(format!(
                        "scale percentage {p} out of range"
                    )));
                }
                p / 100.0
            }
            ScaleMode::FitPage => {
                (content_w / geometry.width_pt).min(content_h / geometry.height_pt)
            }
            ScaleMode::OneToOne => 1.0,
        };

        let target_w = geometry.width_pt * scale;
        let target_h = geometry.height_pt * scale;

        let origin_x = match options.halign {
            HorizontalAlign::Left => options.margins.left.to_f32(),
            HorizontalAlign::Center => {
                options.margins.left.to_f32() + (content_w - target_w) / 2.0
            }
            HorizontalAlign::Right => page_w - options.margins.right.to_f32() - target_w,
        };
        let origin_y = match options.valign {
            VerticalAlign::Top => page_h - options.margins.top.to_f32() - target_h,
            VerticalAlign::Middle => {
                options.margins.bottom.to_f32() + (content_h - target_h) / 2.0
            }
            VerticalAlign::Bottom => options.margins.bottom.to_f32(),
        };

        Ok(Placement {
            origin_x,
            origin_y,
            target_w,
            target_h,
            flip_vertical: options.flip_vertical,
            rotation: options.rotation,
        })
    }
}

/// Replay output of one metafile: a content-stream fragment plus the fonts
/// its records referenced.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub content: String,
    pub fonts: Vec<String>,
    pub records: usize,
    pub skipped: usize,
}

pub(crate) const PS_NULL: u32 = 5;
pub(crate) const BS_NULL: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Pen {
    pub color: Color,
    pub width: f32,
    pub style: u32,
}

impl Pen {
    pub fn is_null(&self) -> bool {
        self.style & 0x0F == PS_NULL
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Brush {
    pub color: Color,
    pub style: u32,
}

impl Brush {
    pub fn is_null(&self) -> bool {
        self.style == BS_NULL
    }
}

#[derive(Debug, Clone)]
pub(crate) enum GdiObject {
    Pen(Pen),
    Brush(Brush),
    Font(String),
    /// Created by a record class we do not replay; occupies its slot so
    /// later handle indices stay aligned.
    Unsupported,
}

/// GDI object handle table: `create` fills the first free slot, `select`
/// looks a slot up, `delete` frees it.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    slots: Vec<Option<GdiObject>>,
}

impl HandleTable {
    pub fn insert(&mut self, object: GdiObject) -> usize {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            self.slots[free] = Some(object);
            free
        } else {
            self.slots.push(Some(object));
            self.slots.len() - 1
        }
    }

    pub fn insert_at(&mut self, index: usize, object: GdiObject) {
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(object);
    }

    pub fn get(&self, index: usize) -> Result<&GdiObject, PlatenError> {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| PlatenError::state(format!("select of unregistered handle {index}")))
    }

    pub fn remove(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
        }
    }
}

/// Mutable drawing state of one device context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceContext {
    pub pen: Option<Pen>,
    pub brush: Option<Brush>,
    pub position: (f32, f32),
    /// World transform as [m11, m12, m21, m22, dx, dy]; identity unless an
    /// EMF stream replaces or composes it.
    pub transform: [f32; 6],
    pub window_org: (f32, f32),
    pub window_ext: (f32, f32),
}

impl DeviceContext {
    pub fn new(geometry: &MetafileGeometry) -> Self {
        Self {
            pen: None,
            brush: None,
            position: (geometry.logical_left, geometry.logical_top),
            transform: [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            window_org: (geometry.logical_left, geometry.logical_top),
            window_ext: (geometry.logical_width, geometry.logical_height),
        }
    }

    pub fn apply_transform(&self, x: f32, y: f32) -> (f32, f32) {
        let [m11, m12, m21, m22, dx, dy] = self.transform;
        (m11 * x + m21 * y + dx, m12 * x + m22 * y + dy)
    }


    /// Logical units per output point on each axis, for pen-width scaling.
    pub fn unit_scale(&self, placement: &Placement) -> f32 {
        if self.window_ext.0.abs() < f32::EPSILON {
            return 1.0;
        }
        (placement.target_w / self.window_ext.0).abs()
    }

    /// Map a world-transformed logical point into page space (y flipped).
    pub fn map(&self, placement: &Placement, x: f32, y: f32) -> (f32, f32) {
        let (x, y) = self.apply_transform(x, y);
        let ext_x = if self.window_ext.0.abs() < f32::EPSILON {
            1.0
        } else {
            self.window_ext.0
        };
        let ext_y = if self.window_ext.1.abs() < f32::EPSILON {
            1.0
        } else {
            self.window_ext.1
        };
        let px = placement.origin_x + (x - self.window_org.0) / ext_x * placement.target_w;
        let fy = (y - self.window_org.1) / ext_y * placement.target_h;
        // GDI y grows downward; PDF upward. A vertical flip cancels the
        // inversion instead of stacking a second one.
        let py = if placement.flip_vertical {
            placement.origin_y + fy
        } else {
            placement.origin_y + placement.target_h - fy
        };
        (px, py)
    }
}

/// Compose affine transforms: the result applies `first`, then `then`.
pub(crate) fn mat_mul(first: [f32; 6], then: [f32; 6]) -> [f32; 6] {
    let a = first;
    let b = then;
    [
        a[0] * b[0] + a[1] * b[2],
        a[0] * b[1] + a[1] * b[3],
        a[2] * b[0] + a[3] * b[2],
        a[2] * b[1] + a[3] * b[3],
        a[4] * b[0] + a[5] * b[2] + b[4],
        a[4] * b[1] + a[5] * b[3] + b[5],
    ]
}

/// Shared path state machine. `Open` spans BeginPath..EndPath; `Complete`
/// covers an ended path awaiting its paint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathPhase {
    Idle,
    Open,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PaintOp {
    Fill,
    Stroke,
    FillStroke,
    /// Path ends without paint (`n`); used when a defined path is abandoned.
    None,
}

impl PaintOp {
    fn operator(self) -> &'static str {
        match self {
            PaintOp::Fill => "f",
            PaintOp::Stroke => "S",
            PaintOp::FillStroke => "B",
            PaintOp::None => "n",
        }
    }
}

/// Paint operator for geometry emitted outside an explicit path: fill when a
/// brush is active, fill+stroke when pen and brush both are, stroke
/// otherwise.
pub(crate) fn auto_paint(pen: Option<&Pen>, brush: Option<&Brush>) -> PaintOp {
    let pen_on = pen.map(|p| !p.is_null()).unwrap_or(false);
    let brush_on = brush.map(|b| !b.is_null()).unwrap_or(false);
    match (brush_on, pen_on) {
        (true, true) => PaintOp::FillStroke,
        (true, false) => PaintOp::Fill,
        _ => PaintOp::Stroke,
    }
}

/// Builds the PDF content fragment. Path construction operators accumulate in
/// a shape buffer; `end_group` prepends the group's graphics state so color
/// operators never interleave with path construction.
#[derive(Debug, Default)]
pub(crate) struct FragmentWriter {
    out: String,
    shape: String,
}

impl FragmentWriter {
    pub fn new(placement: &Placement) -> Self {
        let mut writer = Self::default();
        if placement.rotation.abs() > f32::EPSILON {
            let sin = libm::sinf(placement.rotation);
            let cos = libm::cosf(placement.rotation);
            let cx = placement.origin_x + placement.target_w / 2.0;
            let cy = placement.origin_y + placement.target_h / 2.0;
            writer.out.push_str("q\n");
            writer.out.push_str(&format!(
                "{} {} {} {} {} {} cm\n",
                fmt(cos),
                fmt(sin),
                fmt(-sin),
                fmt(cos),
                fmt(cx - cx * cos + cy * sin),
                fmt(cy - cx * sin - cy * cos)
            ));
        }
        writer
    }

    pub fn move_to(&mut self, x: f32, y: f32) {
        self.shape.push_str(&format!("{} {} m\n", fmt(x), fmt(y)));
    }

    pub fn line_to(&mut self, x: f32, y: f32) {
        self.shape.push_str(&format!("{} {} l\n", fmt(x), fmt(y)));
    }

    pub fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        self.shape.push_str(&format!(
            "{} {} {} {} {} {} c\n",
            fmt(x1),
            fmt(y1),
            fmt(x2),
            fmt(y2),
            fmt(x),
            fmt(y)
        ));
    }

    pub fn close_figure(&mut self) {
        self.shape.push_str("h\n");
    }

    pub fn has_shape(&self) -> bool {
        !self.shape.is_empty()
    }

    /// Turn the buffered shape into a clip region for everything that
    /// follows in this fragment. Not wrapped in `q .. Q`, which would undo
    /// the clip immediately.
    pub fn clip_group(&mut self) {
        if self.shape.is_empty() {
            return;
        }
        self.out.push_str(&self.shape);
        self.shape.clear();
        self.out.push_str("W\nn\n");
    }

    /// Flush the buffered shape as one `q .. Q` group ending in exactly one
    /// paint operator.
    pub fn end_group(
        &mut self,
        paint: PaintOp,
        pen: Option<&Pen>,
        brush: Option<&Brush>,
        pen_scale: f32,
    ) {
        if self.shape.is_empty() {
            return;
        }
        self.out.push_str("q\n");
        if matches!(paint, PaintOp::Fill | PaintOp::FillStroke) {
            let color = brush.map(|b| b.color).unwrap_or(Color::WHITE);
            self.out.push_str(&format!(
                "{} {} {} rg\n",
                fmt(color.r),
                fmt(color.g),
                fmt(color.b)
            ));
        }
        if matches!(paint, PaintOp::Stroke | PaintOp::FillStroke) {
            let color = pen.map(|p| p.color).unwrap_or(Color::BLACK);
            self.out.push_str(&format!(
                "{} {} {} RG\n",
                fmt(color.r),
                fmt(color.g),
                fmt(color.b)
            ));
            let width = pen.map(|p| p.width).unwrap_or(0.0) * pen_scale;
            let width = if width > 0.0 { width } else { 1.0 };
            self.out.push_str(&format!("{} w\n", fmt(width)));
        }
        self.out.push_str(&self.shape);
        self.shape.clear();
        self.out.push_str(paint.operator());
        self.out.push('\n');
        self.out.push_str("Q\n");
    }

    pub fn finish(mut self, placement: &Placement) -> String {
        if placement.rotation.abs() > f32::EPSILON {
            self.out.push_str("Q\n");
        }
        self.out
    }
}

pub(crate) fn push_font(fonts: &mut Vec<String>, name: String) {
    if name.is_empty() {
        return;
    }
    if !fonts.iter().any(|f| f == &name) {
        fonts.push(name);
    }
}

/// NUL-terminated single-byte facename (WMF LOGFONT).
pub(crate) fn ascii_facename(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect()
}

/// NUL-terminated UTF-16LE facename (EMF LOGFONTW).
pub(crate) fn utf16_facename(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pt;

    fn geometry(width_pt: f32, height_pt: f32) -> MetafileGeometry {
        MetafileGeometry {
            width_pt,
            height_pt,
            logical_left: 0.0,
            logical_top: 0.0,
            logical_width: 100.0,
            logical_height: 100.0,
            records_offset: 0,
        }
    }

    fn options() -> PlacementOptions {
        PlacementOptions {
            page_size: Size {
                width: Pt::from_f32(600.0),
                height: Pt::from_f32(800.0),
            },
            margins: Margins::all(50.0),
            ..PlacementOptions::default()
        }
    }

    #[test]
    fn fit_page_scales_uniformly_and_centers() {
        let placement = Placement::compute(&geometry(100.0, 50.0), &options()).unwrap();
        // Content area 500x700; width-limited scale of 5.
        assert!((placement.target_w - 500.0).abs() < 1e-3);
        assert!((placement.target_h - 250.0).abs() < 1e-3);
        assert!((placement.origin_x - 50.0).abs() < 1e-3);
        assert!((placement.origin_y - (50.0 + (700.0 - 250.0) / 2.0)).abs() < 1e-3);
    }

    #[test]
    fn percent_and_alignment_corners() {
        let mut opts = options();
        opts.scale = ScaleMode::Percent(200.0);
        opts.halign = HorizontalAlign::Right;
        opts.valign = VerticalAlign::Bottom;
        let placement = Placement::compute(&geometry(100.0, 50.0), &opts).unwrap();
        assert!((placement.target_w - 200.0).abs() < 1e-3);
        assert!((placement.origin_x - (600.0 - 50.0 - 200.0)).abs() < 1e-3);
        assert!((placement.origin_y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn degenerate_frame_is_a_configuration_error() {
        assert!(matches!(
            Placement::compute(&geometry(0.0, 50.0), &options()),
            Err(PlatenError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn auto_paint_follows_pen_brush_state() {
        let pen = Pen {
            color: Color::BLACK,
            width: 1.0,
            style: 0,
        };
        let null_pen = Pen { style: PS_NULL, ..pen };
        let brush = Brush {
            color: Color::WHITE,
            style: 0,
        };
        assert_eq!(auto_paint(None, None), PaintOp::Stroke);
        assert_eq!(auto_paint(Some(&pen), None), PaintOp::Stroke);
        assert_eq!(auto_paint(None, Some(&brush)), PaintOp::Fill);
        assert_eq!(auto_paint(Some(&pen), Some(&brush)), PaintOp::FillStroke);
        assert_eq!(auto_paint(Some(&null_pen), Some(&brush)), PaintOp::Fill);
    }

    #[test]
    fn handle_table_reuses_freed_slots_and_rejects_unknown() {
        let mut table = HandleTable::default();
        let a = table.insert(GdiObject::Unsupported);
        let b = table.insert(GdiObject::Unsupported);
        assert_eq!((a, b), (0, 1));
        table.remove(0);
        assert_eq!(table.insert(GdiObject::Unsupported), 0);
        assert!(table.get(7).is_err());
    }

    #[test]
    fn groups_are_balanced_with_single_paint() {
        let placement = Placement {
            origin_x: 0.0,
            origin_y: 0.0,
            target_w: 100.0,
            target_h: 100.0,
            flip_vertical: false,
            rotation: 0.0,
        };
        let mut writer = FragmentWriter::new(&placement);
        for _ in 0..3 {
            writer.move_to(0.0, 0.0);
            writer.line_to(10.0, 10.0);
            writer.close_figure();
            writer.end_group(PaintOp::Fill, None, None, 1.0);
        }
        let content = writer.finish(&placement);
        assert_eq!(content.matches("q\n").count(), 3);
        assert_eq!(content.matches("Q\n").count(), 3);
        assert_eq!(content.matches("\nf\n").count(), 3);
    }

    #[test]
    fn map_flips_y_axis() {
        let geometry = geometry(100.0, 100.0);
        let placement = Placement {
            origin_x: 10.0,
            origin_y: 20.0,
            target_w: 200.0,
            target_h: 200.0,
            flip_vertical: false,
            rotation: 0.0,
        };
        let dc = DeviceContext::new(&geometry);
        let (x, y) = dc.map(&placement, 0.0, 0.0);
        assert!((x - 10.0).abs() < 1e-3);
        assert!((y - 220.0).abs() < 1e-3, "logical top maps to page top");
        let (_, y) = dc.map(&placement, 0.0, 100.0);
        assert!((y - 20.0).abs() < 1e-3, "logical bottom maps to page bottom");

        let flipped = Placement {
            flip_vertical: true,
            ..placement
        };
        let (_, y) = dc.map(&flipped, 0.0, 0.0);
        assert!((y - 20.0).abs() < 1e-3, "flip keeps logical top at page bottom");
    }

    #[test]
    fn facename_decoding() {
        assert_eq!(ascii_facename(b"Arial\0junk"), "Arial");
        let utf16: Vec<u8> = "Symbol\0"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(utf16_facename(&utf16), "Symbol");
    }
}
