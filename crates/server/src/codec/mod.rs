//! Codec adapter.
//!
//! The imaging engine behind the image manager. `adjust` receives the
//! *delta* of operations between a base image and the target spec and
//! emits encoded bytes; it never re-applies an operation already baked
//! into the base. Implementations report their capabilities so the
//! manager can downgrade configuration at startup instead of failing
//! requests at runtime.

mod fallback;
mod raster;

pub use fallback::FallbackCodec;
pub use raster::RasterCodec;

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;

use crate::colour::Rgba;
use crate::spec::{Align, Colorspace, CropRect, Flip, IccIntent, ImageSpec, TileSpec};

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input bytes could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The output could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The implementation does not support this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Fill behaviour for padding and rotation backgrounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStyle {
    /// Sample the image border for a matching colour.
    Auto,
    /// Transparent (alpha-capable formats) or white elsewhere.
    Transparent,
    Colour(Rgba),
}

/// A resolved overlay operation.
#[derive(Debug, Clone)]
pub struct OverlayOp {
    pub bytes: Vec<u8>,
    pub pos: Option<String>,
    pub size: Option<f64>,
    pub opacity: Option<f64>,
}

/// A resolved ICC application.
#[derive(Debug, Clone)]
pub struct IccOp {
    pub data: Vec<u8>,
    pub intent: Option<IccIntent>,
    pub bpc: bool,
}

/// The keyed set of operations for one `adjust` call. Field names match
/// the ImageSpec fields they come from.
#[derive(Debug, Clone, Default)]
pub struct AdjustOps {
    /// Output codec key (always present).
    pub format: String,
    /// Encoding quality (the engine's default when the request left it
    /// unset; an operation is running, so an encode is happening).
    pub quality: u8,
    pub page: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size_fit: bool,
    pub align_h: Option<Align>,
    pub align_v: Option<Align>,
    pub flip: Option<Flip>,
    pub rotation: Option<f64>,
    pub crop: Option<CropRect>,
    pub crop_fit: bool,
    pub fill: Option<FillStyle>,
    pub sharpen: Option<i32>,
    pub overlay: Option<OverlayOp>,
    pub icc: Option<IccOp>,
    pub colorspace: Option<Colorspace>,
    pub strip: bool,
    pub dpi: Option<u32>,
    pub tile: Option<TileSpec>,
}

/// One extracted embedded property (EXIF etc.).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileProperty {
    pub profile: String,
    pub key: String,
    pub value: String,
}

/// The pluggable imaging back end.
pub trait Codec: Send + Sync {
    /// Apply `ops` to `bytes` and return the encoded result.
    fn adjust(&self, bytes: &[u8], hint: &str, ops: &AdjustOps) -> Result<Vec<u8>, CodecError>;

    /// Pixel dimensions without a full decode.
    fn dimensions(&self, bytes: &[u8], hint: &str) -> Result<(u32, u32), CodecError>;

    /// Embedded properties (EXIF and friends).
    fn profile_data(&self, bytes: &[u8], hint: &str) -> Result<Vec<ProfileProperty>, CodecError>;

    /// Rasterise each page of a PDF into `dest_dir`.
    fn burst_pdf(&self, bytes: &[u8], dest_dir: &Path, dpi: u32) -> Result<bool, CodecError>;

    /// Operation keys this implementation supports.
    fn supported_operations(&self) -> HashSet<&'static str>;

    /// File extensions this implementation can decode.
    fn supported_file_types(&self) -> HashSet<&'static str>;
}

/// Capability keys beyond the plain field names.
pub mod caps {
    /// Right-angle rotation.
    pub const ROTATION: &str = "rotation";
    /// Rotation at arbitrary angles.
    pub const ROTATION_ANY: &str = "rotation_any";
    /// PDF bursting.
    pub const PDF: &str = "pdf";
}

/// Resources the delta computation needs but the spec only names.
#[derive(Debug, Default)]
pub struct DeltaResources {
    pub overlay_bytes: Option<Vec<u8>>,
    pub icc_data: Option<Vec<u8>>,
    pub default_quality: u8,
}

/// Compute the operations needed to turn `base` (the spec already baked
/// into the input bytes) into `target`. Relies on the base-suitability
/// rules: anything present on the base matches the target exactly and
/// is therefore omitted here.
pub fn delta_ops(base: &ImageSpec, target: &ImageSpec, resources: DeltaResources) -> AdjustOps {
    let mut ops = AdjustOps {
        format: target.output_format(),
        quality: target.quality.unwrap_or(resources.default_quality),
        ..Default::default()
    };

    if base.page.is_none() {
        ops.page = target.page;
    }
    if base.flip.is_none() {
        ops.flip = target.flip;
    }
    if base.rotation.is_none() {
        ops.rotation = target.rotation;
    }
    if base.crop.is_none() {
        ops.crop = target.crop;
        ops.crop_fit = target.crop_fit == Some(true);
    }

    // Resize whenever the base is not already at the target size.
    let needs_resize = (target.width.is_some() || target.height.is_some())
        && (base.width != target.width || base.height != target.height);
    if needs_resize {
        ops.width = target.width;
        ops.height = target.height;
        ops.size_fit = target.size_fit == Some(true);
        ops.align_h = target.align_h;
        ops.align_v = target.align_v;
    }

    // Fill backs rotation and padding; pass it whenever either may run.
    if ops.rotation.is_some() || needs_resize {
        ops.fill = target.fill.as_deref().map(|f| match f {
            "auto" => FillStyle::Auto,
            "none" => FillStyle::Transparent,
            other => crate::colour::parse_colour(other)
                .map(FillStyle::Colour)
                .unwrap_or(FillStyle::Transparent),
        });
    }

    // A sharpened base never reaches this point.
    ops.sharpen = target.sharpen;

    if base.overlay_src.is_none() {
        if let (Some(_), Some(bytes)) = (&target.overlay_src, resources.overlay_bytes) {
            ops.overlay = Some(OverlayOp {
                bytes,
                pos: target.overlay_pos.clone(),
                size: target.overlay_size,
                opacity: target.overlay_opacity,
            });
        }
    }

    if base.icc_profile.is_none() {
        if let (Some(_), Some(data)) = (&target.icc_profile, resources.icc_data) {
            ops.icc = Some(IccOp {
                data,
                intent: target.icc_intent,
                bpc: target.icc_bpc == Some(true),
            });
        }
    }

    if base.colorspace.is_none() {
        ops.colorspace = target.colorspace;
    }
    if base.strip.is_none() {
        ops.strip = target.strip == Some(true);
    }
    ops.dpi = target.dpi;

    if base.tile.is_none() {
        ops.tile = target.tile;
    }

    ops
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn spec(src: &str) -> ImageSpec {
        let mut s = ImageSpec::for_source(src);
        s.source_id = 1;
        s
    }

    #[test]
    fn delta_from_raw_original_includes_everything() {
        let base = spec("a.jpg");
        let mut target = spec("a.jpg");
        target.width = Some(200);
        target.height = Some(100);
        target.flip = Some(Flip::H);
        target.quality = Some(70);
        target.strip = Some(true);

        let ops = delta_ops(&base, &target, DeltaResources::default());
        assert_eq!(ops.width, Some(200));
        assert_eq!(ops.height, Some(100));
        assert_eq!(ops.flip, Some(Flip::H));
        assert_eq!(ops.quality, 70);
        assert!(ops.strip);
        assert_eq!(ops.format, "jpg");
    }

    #[test]
    fn delta_skips_operations_already_on_base() {
        let mut base = spec("a.jpg");
        base.flip = Some(Flip::H);
        base.width = Some(400);
        base.height = Some(200);

        let mut target = spec("a.jpg");
        target.flip = Some(Flip::H);
        target.width = Some(200);
        target.height = Some(100);

        let ops = delta_ops(&base, &target, DeltaResources::default());
        // The flip is baked in; only the resize remains.
        assert_eq!(ops.flip, None);
        assert_eq!(ops.width, Some(200));
    }

    #[test]
    fn delta_skips_resize_when_base_is_at_size() {
        let mut base = spec("a.jpg");
        base.width = Some(200);
        base.height = Some(100);

        let mut target = spec("a.jpg");
        target.width = Some(200);
        target.height = Some(100);
        target.tile = Some(TileSpec { index: 1, grid: 4 });

        let ops = delta_ops(&base, &target, DeltaResources::default());
        assert_eq!(ops.width, None);
        assert_eq!(ops.tile, Some(TileSpec { index: 1, grid: 4 }));
    }

    #[test]
    fn quality_defaults_only_at_operation_time() {
        let base = spec("a.jpg");
        let mut target = spec("a.jpg");
        target.width = Some(200);

        let ops = delta_ops(
            &base,
            &target,
            DeltaResources {
                default_quality: 80,
                ..Default::default()
            },
        );
        assert_eq!(ops.quality, 80);
    }

    #[test]
    fn fill_styles_resolve() {
        let base = spec("a.jpg");
        let mut target = spec("a.jpg");
        target.rotation = Some(45.0);
        target.fill = Some("auto".into());
        let ops = delta_ops(&base, &target, DeltaResources::default());
        assert_eq!(ops.fill, Some(FillStyle::Auto));

        target.fill = Some("none".into());
        let ops = delta_ops(&base, &target, DeltaResources::default());
        assert_eq!(ops.fill, Some(FillStyle::Transparent));

        target.fill = Some("red".into());
        let ops = delta_ops(&base, &target, DeltaResources::default());
        assert_eq!(ops.fill, Some(FillStyle::Colour([255, 0, 0, 255])));
    }
}
