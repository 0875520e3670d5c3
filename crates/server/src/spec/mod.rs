//! The normalised set of transformation attributes for one derivative.
//!
//! `ImageSpec` is the value object the whole pipeline keys on: HTTP
//! parameters parse into it, templates and server defaults merge into it,
//! normalisation erases semantic no-ops, and the fingerprint derived from
//! it addresses the derivative cache.

mod fingerprint;
mod normalise;
mod suitability;

pub use suitability::{attr_group_hash, suitable_for, Unsuitable};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::colour;
use crate::error::{AppError, AppResult};

/// Output formats a request may name.
pub const FORMATS: &[&str] = &[
    "jpg", "jpeg", "pjpg", "pjpeg", "png", "gif", "webp", "tif", "tiff", "bmp",
];

/// Overlay anchor positions.
pub const OVERLAY_POSITIONS: &[&str] = &["nw", "n", "ne", "w", "c", "e", "sw", "s", "se"];

/// Mirror axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flip {
    H,
    V,
}

impl Flip {
    pub fn as_str(self) -> &'static str {
        match self {
            Flip::H => "h",
            Flip::V => "v",
        }
    }
}

impl FromStr for Flip {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "h" => Ok(Flip::H),
            "v" => Ok(Flip::V),
            _ => Err(()),
        }
    }
}

/// Target colour model. Synonyms (`srgb`, `grey`) collapse at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colorspace {
    Rgb,
    Gray,
    Cmyk,
}

impl Colorspace {
    pub fn as_str(self) -> &'static str {
        match self {
            Colorspace::Rgb => "rgb",
            Colorspace::Gray => "gray",
            Colorspace::Cmyk => "cmyk",
        }
    }
}

impl FromStr for Colorspace {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "rgb" | "srgb" => Ok(Colorspace::Rgb),
            "gray" | "grey" => Ok(Colorspace::Gray),
            "cmyk" => Ok(Colorspace::Cmyk),
            _ => Err(()),
        }
    }
}

/// ICC rendering intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IccIntent {
    Saturation,
    Perceptual,
    Absolute,
    Relative,
}

impl IccIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            IccIntent::Saturation => "saturation",
            IccIntent::Perceptual => "perceptual",
            IccIntent::Absolute => "absolute",
            IccIntent::Relative => "relative",
        }
    }
}

impl FromStr for IccIntent {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "saturation" => Ok(IccIntent::Saturation),
            "perceptual" => Ok(IccIntent::Perceptual),
            "absolute" => Ok(IccIntent::Absolute),
            "relative" => Ok(IccIntent::Relative),
            _ => Err(()),
        }
    }
}

/// Edge alignment: an edge letter plus a fractional position, e.g. `L0.5`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Align {
    pub edge: char,
    pub pos: f64,
}

impl Align {
    fn parse(s: &str, edges: &[char]) -> Option<Self> {
        let mut chars = s.chars();
        let edge = chars.next()?.to_ascii_uppercase();
        if !edges.contains(&edge) {
            return None;
        }
        let pos: f64 = chars.as_str().parse().ok()?;
        if !(0.0..=1.0).contains(&pos) {
            return None;
        }
        Some(Align { edge, pos })
    }

    /// The centred alignment that normalisation erases.
    pub fn is_identity(self) -> bool {
        self.edge == 'C' && (self.pos - 0.5).abs() < f64::EPSILON
    }
}

impl fmt::Display for Align {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.edge, self.pos)
    }
}

/// Fractional crop rectangle; all values in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
}

impl CropRect {
    pub const FULL: CropRect = CropRect {
        top: 0.0,
        left: 0.0,
        bottom: 1.0,
        right: 1.0,
    };

    pub fn is_full(&self) -> bool {
        *self == Self::FULL
    }
}

/// A tile address: 1-based index into a grid of `grid` cells, where
/// `grid` is a perfect square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSpec {
    pub index: u32,
    pub grid: u32,
}

impl TileSpec {
    /// Cells per side of the grid.
    pub fn side(&self) -> u32 {
        (self.grid as f64).sqrt().round() as u32
    }
}

/// The transformation attributes for one derivative image.
///
/// Immutable once finalised: the manager validates, merges template and
/// server defaults, then normalises, and only then fingerprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImageSpec {
    pub source: String,
    /// Opaque integer assigned by the database on first sight;
    /// required (> 0) before fingerprinting.
    #[serde(default)]
    pub source_id: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub align_h: Option<Align>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub align_v: Option<Align>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rotation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flip: Option<Flip>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub crop: Option<CropRect>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub crop_fit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size_fit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fill: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sharpen: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub overlay_src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub overlay_pos: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub overlay_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub overlay_opacity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub icc_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub icc_intent: Option<IccIntent>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub icc_bpc: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub colorspace: Option<Colorspace>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub strip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dpi: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tile: Option<TileSpec>,
}

/// Server defaults merged into a spec after its template (never quality:
/// the imaging engine supplies that only when an operation actually runs).
#[derive(Debug, Clone, Default)]
pub struct ImagingDefaults {
    pub format: Option<String>,
    pub colorspace: Option<Colorspace>,
    pub strip: Option<bool>,
    pub dpi: Option<u32>,
}

/// Range or membership check for one request field.
enum Check {
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    OneOf(&'static [&'static str]),
    Bool,
    AlignH,
    AlignV,
    Colour,
    Tile,
    Text { max_len: usize },
}

/// The validators table: every request field and its allowed values.
/// Adding a spec field means one entry here plus its handling in
/// `normalise` and the fingerprint.
static VALIDATORS: &[(&str, Check)] = &[
    ("src", Check::Text { max_len: 1024 }),
    ("page", Check::Int { min: 1, max: 999_999 }),
    ("format", Check::OneOf(FORMATS)),
    ("tmp", Check::Text { max_len: 64 }),
    ("width", Check::Int { min: 0, max: 32_000 }),
    ("height", Check::Int { min: 0, max: 32_000 }),
    ("halign", Check::AlignH),
    ("valign", Check::AlignV),
    ("angle", Check::Float { min: -360.0, max: 360.0 }),
    ("flip", Check::OneOf(&["h", "v"])),
    ("top", Check::Float { min: 0.0, max: 1.0 }),
    ("left", Check::Float { min: 0.0, max: 1.0 }),
    ("bottom", Check::Float { min: 0.0, max: 1.0 }),
    ("right", Check::Float { min: 0.0, max: 1.0 }),
    ("autocropfit", Check::Bool),
    ("autosizefit", Check::Bool),
    ("fill", Check::Colour),
    ("quality", Check::Int { min: 1, max: 100 }),
    ("sharpen", Check::Int { min: -500, max: 500 }),
    ("overlay", Check::Text { max_len: 1024 }),
    ("ovpos", Check::OneOf(OVERLAY_POSITIONS)),
    ("ovsize", Check::Float { min: 0.0, max: 1.0 }),
    ("ovopacity", Check::Float { min: 0.0, max: 1.0 }),
    ("icc", Check::Text { max_len: 64 }),
    (
        "intent",
        Check::OneOf(&["saturation", "perceptual", "absolute", "relative"]),
    ),
    ("bpc", Check::Bool),
    (
        "colorspace",
        Check::OneOf(&["rgb", "srgb", "gray", "grey", "cmyk"]),
    ),
    ("strip", Check::Bool),
    ("dpi", Check::Int { min: 0, max: 1200 }),
    ("tile", Check::Tile),
];

fn check_for(field: &str) -> &'static Check {
    // The table is compile-time complete; a miss is a programming error
    // surfaced loudly in tests.
    VALIDATORS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, check)| check)
        .unwrap_or(&Check::Text { max_len: 1024 })
}

fn invalid(field: &str, raw: &str) -> AppError {
    AppError::InvalidParameter(format!("{field}: invalid value '{raw}'"))
}

fn parse_int(field: &str, raw: &str) -> AppResult<i64> {
    let Check::Int { min, max } = check_for(field) else {
        return Err(invalid(field, raw));
    };
    let v: i64 = raw.trim().parse().map_err(|_| invalid(field, raw))?;
    if v < *min || v > *max {
        return Err(AppError::InvalidParameter(format!(
            "{field}: {v} outside {min}..{max}"
        )));
    }
    Ok(v)
}

fn parse_float(field: &str, raw: &str) -> AppResult<f64> {
    let Check::Float { min, max } = check_for(field) else {
        return Err(invalid(field, raw));
    };
    let v: f64 = raw.trim().parse().map_err(|_| invalid(field, raw))?;
    if !v.is_finite() || v < *min || v > *max {
        return Err(AppError::InvalidParameter(format!(
            "{field}: {v} outside {min}..{max}"
        )));
    }
    Ok(v)
}

fn parse_one_of(field: &str, raw: &str) -> AppResult<String> {
    let Check::OneOf(allowed) = check_for(field) else {
        return Err(invalid(field, raw));
    };
    let v = raw.trim().to_lowercase();
    if !allowed.contains(&v.as_str()) {
        return Err(invalid(field, raw));
    }
    Ok(v)
}

fn parse_bool(field: &str, raw: &str) -> AppResult<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(invalid(field, raw)),
    }
}

fn parse_align(field: &str, raw: &str) -> AppResult<Align> {
    let edges: &[char] = match check_for(field) {
        Check::AlignH => &['L', 'C', 'R'],
        Check::AlignV => &['T', 'C', 'B'],
        _ => return Err(invalid(field, raw)),
    };
    Align::parse(raw.trim(), edges).ok_or_else(|| invalid(field, raw))
}

fn parse_tile(raw: &str) -> AppResult<TileSpec> {
    let (idx, grid) = raw
        .trim()
        .split_once(':')
        .ok_or_else(|| invalid("tile", raw))?;
    let index: u32 = idx.parse().map_err(|_| invalid("tile", raw))?;
    let grid: u32 = grid.parse().map_err(|_| invalid("tile", raw))?;
    let tile = TileSpec { index, grid };
    validate_tile(&tile)?;
    Ok(tile)
}

/// A grid below 2 is degenerate and allowed (normalisation clears it);
/// otherwise the grid must be a perfect square of at least 4 with the
/// index inside it.
fn validate_tile(tile: &TileSpec) -> AppResult<()> {
    if tile.index < 1 {
        return Err(AppError::InvalidParameter("tile: index must be >= 1".into()));
    }
    if tile.grid < 2 {
        return Ok(());
    }
    let side = tile.side();
    if side * side != tile.grid || tile.grid < 4 {
        return Err(AppError::InvalidParameter(format!(
            "tile: grid {} is not a perfect square >= 4",
            tile.grid
        )));
    }
    if tile.index > tile.grid {
        return Err(AppError::InvalidParameter(format!(
            "tile: index {} outside grid {}",
            tile.index, tile.grid
        )));
    }
    Ok(())
}

fn parse_text(field: &str, raw: &str) -> AppResult<String> {
    let Check::Text { max_len } = check_for(field) else {
        return Err(invalid(field, raw));
    };
    if raw.is_empty() || raw.len() > *max_len || raw.contains('\0') {
        return Err(invalid(field, raw));
    }
    Ok(raw.to_string())
}

fn parse_fill(raw: &str) -> AppResult<String> {
    let v = raw.trim().to_lowercase();
    if v == "auto" || colour::parse_colour(&v).is_some() {
        return Ok(v);
    }
    Err(invalid("fill", raw))
}

impl ImageSpec {
    /// A bare spec for a source with no transformations.
    pub fn for_source(source: impl Into<String>) -> Self {
        ImageSpec {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Build a spec from raw request parameters, validating every
    /// supplied field against the validators table. Unknown keys are
    /// ignored (delivery flags are handled by the HTTP layer).
    pub fn from_params(params: &HashMap<String, String>) -> AppResult<Self> {
        let source = params
            .get("src")
            .map(|v| parse_text("src", v))
            .transpose()?
            .ok_or_else(|| AppError::InvalidParameter("src: parameter is required".into()))?;

        Self::from_param_map(source, params)
    }

    /// Build a sourceless parameter bundle, e.g. a template body. The
    /// same validators apply; only the `src` requirement is waived.
    pub fn from_template_params(params: &HashMap<String, String>) -> AppResult<Self> {
        let mut spec = Self::from_param_map(String::new(), params)?;
        // Bundles hold defaults, never an identity.
        spec.template = None;
        Ok(spec)
    }

    fn from_param_map(source: String, params: &HashMap<String, String>) -> AppResult<Self> {
        let mut spec = ImageSpec::for_source(source);

        if let Some(v) = params.get("page") {
            spec.page = Some(parse_int("page", v)? as u32);
        }
        if let Some(v) = params.get("format") {
            spec.format = Some(parse_one_of("format", v)?);
        }
        if let Some(v) = params.get("tmp") {
            spec.template = Some(parse_text("tmp", v)?.to_lowercase());
        }
        if let Some(v) = params.get("width") {
            spec.width = Some(parse_int("width", v)? as u32);
        }
        if let Some(v) = params.get("height") {
            spec.height = Some(parse_int("height", v)? as u32);
        }
        if let Some(v) = params.get("halign") {
            spec.align_h = Some(parse_align("halign", v)?);
        }
        if let Some(v) = params.get("valign") {
            spec.align_v = Some(parse_align("valign", v)?);
        }
        if let Some(v) = params.get("angle") {
            spec.rotation = Some(parse_float("angle", v)?);
        }
        if let Some(v) = params.get("flip") {
            let s = parse_one_of("flip", v)?;
            spec.flip = s.parse().ok();
        }
        let crop_given = ["top", "left", "bottom", "right"]
            .iter()
            .any(|k| params.contains_key(*k));
        if crop_given {
            let get = |k: &str, default: f64| -> AppResult<f64> {
                params.get(k).map(|v| parse_float(k, v)).transpose().map(|o| o.unwrap_or(default))
            };
            let crop = CropRect {
                top: get("top", 0.0)?,
                left: get("left", 0.0)?,
                bottom: get("bottom", 1.0)?,
                right: get("right", 1.0)?,
            };
            validate_crop(&crop)?;
            spec.crop = Some(crop);
        }
        if let Some(v) = params.get("autocropfit") {
            spec.crop_fit = Some(parse_bool("autocropfit", v)?);
        }
        if let Some(v) = params.get("autosizefit") {
            spec.size_fit = Some(parse_bool("autosizefit", v)?);
        }
        if let Some(v) = params.get("fill") {
            spec.fill = Some(parse_fill(v)?);
        }
        if let Some(v) = params.get("quality") {
            spec.quality = Some(parse_int("quality", v)? as u8);
        }
        if let Some(v) = params.get("sharpen") {
            spec.sharpen = Some(parse_int("sharpen", v)? as i32);
        }
        if let Some(v) = params.get("overlay") {
            spec.overlay_src = Some(parse_text("overlay", v)?);
        }
        if let Some(v) = params.get("ovpos") {
            spec.overlay_pos = Some(parse_one_of("ovpos", v)?);
        }
        if let Some(v) = params.get("ovsize") {
            spec.overlay_size = Some(parse_float("ovsize", v)?);
        }
        if let Some(v) = params.get("ovopacity") {
            spec.overlay_opacity = Some(parse_float("ovopacity", v)?);
        }
        if let Some(v) = params.get("icc") {
            spec.icc_profile = Some(parse_text("icc", v)?.to_lowercase());
        }
        if let Some(v) = params.get("intent") {
            let s = parse_one_of("intent", v)?;
            spec.icc_intent = s.parse().ok();
        }
        if let Some(v) = params.get("bpc") {
            spec.icc_bpc = Some(parse_bool("bpc", v)?);
        }
        if let Some(v) = params.get("colorspace") {
            let s = parse_one_of("colorspace", v)?;
            spec.colorspace = s.parse().ok();
        }
        if let Some(v) = params.get("strip") {
            spec.strip = Some(parse_bool("strip", v)?);
        }
        if let Some(v) = params.get("dpi") {
            spec.dpi = Some(parse_int("dpi", v)? as u32);
        }
        if let Some(v) = params.get("tile") {
            spec.tile = Some(parse_tile(v)?);
        }

        spec.validate()?;
        Ok(spec)
    }

    /// Re-check every typed field against its allowed range. Used after
    /// template merges, which may introduce values that never passed
    /// through `from_params`.
    pub fn validate(&self) -> AppResult<()> {
        if let Some(p) = self.page {
            if p < 1 {
                return Err(AppError::InvalidParameter("page: must be >= 1".into()));
            }
        }
        if let Some(ref f) = self.format {
            if !FORMATS.contains(&f.as_str()) {
                return Err(invalid("format", f));
            }
        }
        if let Some(w) = self.width {
            if w > 32_000 {
                return Err(AppError::InvalidParameter("width: outside 0..32000".into()));
            }
        }
        if let Some(h) = self.height {
            if h > 32_000 {
                return Err(AppError::InvalidParameter("height: outside 0..32000".into()));
            }
        }
        if let Some(r) = self.rotation {
            if !r.is_finite() || !(-360.0..=360.0).contains(&r) {
                return Err(AppError::InvalidParameter("angle: outside -360..360".into()));
            }
        }
        if let Some(ref c) = self.crop {
            validate_crop(c)?;
        }
        if let Some(q) = self.quality {
            if !(1..=100).contains(&q) {
                return Err(AppError::InvalidParameter("quality: outside 1..100".into()));
            }
        }
        if let Some(s) = self.sharpen {
            if !(-500..=500).contains(&s) {
                return Err(AppError::InvalidParameter("sharpen: outside -500..500".into()));
            }
        }
        if let Some(ref p) = self.overlay_pos {
            if !OVERLAY_POSITIONS.contains(&p.as_str()) {
                return Err(invalid("ovpos", p));
            }
        }
        for (field, v) in [("ovsize", self.overlay_size), ("ovopacity", self.overlay_opacity)] {
            if let Some(v) = v {
                if !(0.0..=1.0).contains(&v) {
                    return Err(AppError::InvalidParameter(format!("{field}: outside 0..1")));
                }
            }
        }
        if let Some(ref f) = self.fill {
            if f != "auto" && colour::parse_colour(f).is_none() {
                return Err(invalid("fill", f));
            }
        }
        if let Some(ref t) = self.tile {
            validate_tile(t)?;
        }
        Ok(())
    }

    /// Merge another spec's transformation fields into this one.
    ///
    /// With `override` false, only fields still unset here are filled.
    /// Source, source id and template name are never merged.
    pub fn apply_template(&mut self, other: &ImageSpec, override_set: bool) {
        macro_rules! merge {
            ($field:ident) => {
                if other.$field.is_some() && (override_set || self.$field.is_none()) {
                    self.$field = other.$field.clone();
                }
            };
        }
        merge!(page);
        merge!(format);
        merge!(width);
        merge!(height);
        merge!(align_h);
        merge!(align_v);
        merge!(rotation);
        merge!(flip);
        merge!(crop);
        merge!(crop_fit);
        merge!(size_fit);
        merge!(fill);
        merge!(quality);
        merge!(sharpen);
        merge!(overlay_src);
        merge!(overlay_pos);
        merge!(overlay_size);
        merge!(overlay_opacity);
        merge!(icc_profile);
        merge!(icc_intent);
        merge!(icc_bpc);
        merge!(colorspace);
        merge!(strip);
        merge!(dpi);
        merge!(tile);
    }

    /// Fill still-unset format, colorspace, strip and dpi from the server
    /// defaults. Quality is deliberately not defaulted here.
    pub fn apply_defaults(&mut self, defaults: &ImagingDefaults) {
        if self.format.is_none() {
            self.format = defaults.format.clone();
        }
        if self.colorspace.is_none() {
            self.colorspace = defaults.colorspace;
        }
        if self.strip.is_none() {
            self.strip = defaults.strip;
        }
        if self.dpi.is_none() {
            self.dpi = defaults.dpi;
        }
    }

    /// The canonical lowercase extension of the source path.
    pub fn src_extension(&self) -> String {
        let ext = std::path::Path::new(&self.source)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        canonical_format(&ext)
    }

    /// The output format: the explicit format field, or the source's own.
    pub fn output_format(&self) -> String {
        self.format.clone().unwrap_or_else(|| self.src_extension())
    }

    /// Whether this spec addresses a tile of the derivative.
    pub fn is_tiled(&self) -> bool {
        self.tile.is_some()
    }

    /// Width/height aspect ratio, defined only when both are set.
    pub fn aspect(&self) -> Option<f64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(w as f64 / h as f64),
            _ => None,
        }
    }
}

fn validate_crop(crop: &CropRect) -> AppResult<()> {
    for (name, v) in [
        ("top", crop.top),
        ("left", crop.left),
        ("bottom", crop.bottom),
        ("right", crop.right),
    ] {
        if !(0.0..=1.0).contains(&v) {
            return Err(AppError::InvalidParameter(format!("{name}: outside 0..1")));
        }
    }
    if crop.right <= crop.left || crop.bottom <= crop.top {
        return Err(AppError::InvalidParameter(
            "crop: rectangle has no area".into(),
        ));
    }
    Ok(())
}

/// Collapse format synonyms to their canonical spelling.
pub fn canonical_format(format: &str) -> String {
    match format {
        "jpeg" => "jpg".to_string(),
        "pjpeg" => "pjpg".to_string(),
        "tiff" => "tif".to_string(),
        other => other.to_string(),
    }
}

/// MIME type for an output format key.
pub fn mime_for(format: &str) -> &'static str {
    match format {
        "jpg" | "jpeg" | "pjpg" | "pjpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_a_full_request() {
        let spec = ImageSpec::from_params(&params(&[
            ("src", "test_images/cathedral.jpg"),
            ("width", "200"),
            ("height", "100"),
            ("format", "png"),
            ("angle", "90"),
            ("flip", "h"),
            ("quality", "75"),
            ("tile", "3:16"),
        ]))
        .unwrap();

        assert_eq!(spec.source, "test_images/cathedral.jpg");
        assert_eq!(spec.width, Some(200));
        assert_eq!(spec.height, Some(100));
        assert_eq!(spec.format.as_deref(), Some("png"));
        assert_eq!(spec.rotation, Some(90.0));
        assert_eq!(spec.flip, Some(Flip::H));
        assert_eq!(spec.quality, Some(75));
        assert_eq!(spec.tile, Some(TileSpec { index: 3, grid: 16 }));
    }

    #[test]
    fn missing_src_is_rejected() {
        let err = ImageSpec::from_params(&params(&[("width", "200")])).unwrap_err();
        assert!(matches!(err, AppError::InvalidParameter(_)));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for (k, v) in [
            ("width", "50000"),
            ("quality", "0"),
            ("quality", "101"),
            ("angle", "400"),
            ("sharpen", "501"),
            ("top", "1.5"),
            ("page", "0"),
        ] {
            let err = ImageSpec::from_params(&params(&[("src", "a.jpg"), (k, v)]));
            assert!(err.is_err(), "{k}={v} should fail");
        }
    }

    #[test]
    fn enum_membership_is_enforced() {
        for (k, v) in [
            ("format", "exe"),
            ("flip", "x"),
            ("intent", "fast"),
            ("colorspace", "hsv"),
            ("ovpos", "middle"),
            ("fill", "notacolour"),
        ] {
            let err = ImageSpec::from_params(&params(&[("src", "a.jpg"), (k, v)]));
            assert!(err.is_err(), "{k}={v} should fail");
        }
    }

    #[test]
    fn tile_specs() {
        // Smallest legal square grid, first and last tiles.
        for t in ["1:4", "4:4", "7:16", "1:1"] {
            assert!(
                ImageSpec::from_params(&params(&[("src", "a.jpg"), ("tile", t)])).is_ok(),
                "tile={t} should parse"
            );
        }
        for t in ["0:4", "5:4", "3:6", "2:9999", "x:4", "3"] {
            assert!(
                ImageSpec::from_params(&params(&[("src", "a.jpg"), ("tile", t)])).is_err(),
                "tile={t} should fail"
            );
        }
    }

    #[test]
    fn crop_needs_area() {
        let err = ImageSpec::from_params(&params(&[
            ("src", "a.jpg"),
            ("left", "0.5"),
            ("right", "0.5"),
        ]));
        assert!(err.is_err());
    }

    #[test]
    fn colorspace_synonyms_collapse_at_parse() {
        let spec =
            ImageSpec::from_params(&params(&[("src", "a.jpg"), ("colorspace", "srgb")])).unwrap();
        assert_eq!(spec.colorspace, Some(Colorspace::Rgb));

        let spec =
            ImageSpec::from_params(&params(&[("src", "a.jpg"), ("colorspace", "grey")])).unwrap();
        assert_eq!(spec.colorspace, Some(Colorspace::Gray));
    }

    #[test]
    fn template_merge_fills_unset_only() {
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.width = Some(300);

        let mut tmpl = ImageSpec::for_source("");
        tmpl.width = Some(200);
        tmpl.height = Some(200);
        tmpl.format = Some("jpg".into());

        spec.apply_template(&tmpl, false);
        assert_eq!(spec.width, Some(300));
        assert_eq!(spec.height, Some(200));
        assert_eq!(spec.format.as_deref(), Some("jpg"));

        spec.apply_template(&tmpl, true);
        assert_eq!(spec.width, Some(200));
    }

    #[test]
    fn defaults_never_touch_quality() {
        let mut spec = ImageSpec::for_source("a.png");
        spec.apply_defaults(&ImagingDefaults {
            format: Some("jpg".into()),
            colorspace: None,
            strip: Some(true),
            dpi: None,
        });
        assert_eq!(spec.format.as_deref(), Some("jpg"));
        assert_eq!(spec.strip, Some(true));
        assert_eq!(spec.quality, None);
    }

    #[test]
    fn src_extension_is_canonical() {
        assert_eq!(ImageSpec::for_source("a/b.JPEG").src_extension(), "jpg");
        assert_eq!(ImageSpec::for_source("a/b.tiff").src_extension(), "tif");
        assert_eq!(ImageSpec::for_source("noext").src_extension(), "");
    }
}
