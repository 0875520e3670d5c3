//! Base-image reuse rules.
//!
//! A cached derivative ("base") may serve as the starting point for a
//! new derivative ("target") only when re-applying the remaining
//! operations downstream cannot change the result. The checks below are
//! ordered so the cheapest disqualifiers run first; the first failure
//! wins and its reason code is reported.

use sha2::{Digest, Sha256};

use super::ImageSpec;

/// Why a candidate base image cannot serve a target. Code 0 (suitable)
/// is the absence of a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsuitable {
    /// Different source path or page.
    DifferentSource = 1,
    /// Output format or fill colour differ.
    FormatOrFill = 2,
    /// The base has been sharpened. Sharpening is not idempotent, so a
    /// sharpened base is disqualified even when the values match.
    BaseSharpened = 3,
    /// Aspect ratios differ (2 dp).
    AspectRatio = 4,
    /// The base was encoded at a lower quality than the target wants.
    LowerQuality = 5,
    /// The base is smaller than the target.
    TooSmall = 6,
    /// A transformation already on the base differs from the target's.
    AttributeMismatch = 7,
    /// The base carries a crop that is not identical to the target's.
    CropMismatch = 8,
    /// The base carries an overlay and the target is not a tile of that
    /// same overlaid image; overlays are never re-applied downstream.
    OverlayNotTile = 9,
    /// The base is itself a tile that is not the requested tile.
    TileMismatch = 10,
    /// The base has been processed past the target's place in the
    /// flip -> rotate -> crop pipeline.
    PipelineOrder = 11,
    /// Padding-affecting attributes (size-fit, aligns) differ.
    PaddingMismatch = 12,
}

impl Unsuitable {
    /// Numeric reason code; 0 means suitable.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Quality of a spec with quality unset: one above the maximum, i.e. the
/// raw-original quality no encode can surpass.
const UNSET_QUALITY: u16 = 101;

/// Dimension of a spec with the dimension unset: unbounded.
const UNSET_DIM: u64 = u64::MAX;

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Decide whether `base`'s cached bytes may start the production of
/// `target`. Both specs must be normalised.
pub fn suitable_for(base: &ImageSpec, target: &ImageSpec) -> Result<(), Unsuitable> {
    // 1. Same source, same page.
    if base.source != target.source || base.page != target.page {
        return Err(Unsuitable::DifferentSource);
    }

    // 2. Same output format and fill; a lossy base cannot produce a
    // lossless target.
    if base.format != target.format || base.fill != target.fill {
        return Err(Unsuitable::FormatOrFill);
    }

    // 3. Sharpened bases never qualify.
    if base.sharpen.is_some() {
        return Err(Unsuitable::BaseSharpened);
    }

    // 10. A tiled base serves only the identical tile.
    if base.tile.is_some() && base.tile != target.tile {
        return Err(Unsuitable::TileMismatch);
    }

    // 9. An overlaid base serves only tiles of that same overlaid image.
    if base.overlay_src.is_some() {
        let overlay_matches = base.overlay_src == target.overlay_src
            && base.overlay_pos == target.overlay_pos
            && base.overlay_size == target.overlay_size
            && base.overlay_opacity == target.overlay_opacity;
        if !overlay_matches || target.tile.is_none() {
            return Err(Unsuitable::OverlayNotTile);
        }
    }

    // 4. Aspect ratios match (2 dp) when both define one. A base with a
    // forced aspect cannot serve a target without one; rule 6 covers
    // that case via the unbounded target dimension.
    if let (Some(ba), Some(ta)) = (base.aspect(), target.aspect()) {
        if round2(ba) != round2(ta) {
            return Err(Unsuitable::AspectRatio);
        }
    }

    // 5. The base must be encoded at or above the target quality.
    let bq = base.quality.map_or(UNSET_QUALITY, u16::from);
    let tq = target.quality.map_or(UNSET_QUALITY, u16::from);
    if bq < tq {
        return Err(Unsuitable::LowerQuality);
    }

    // 6. The base must be at least as large as the target.
    let bw = base.width.map_or(UNSET_DIM, u64::from);
    let bh = base.height.map_or(UNSET_DIM, u64::from);
    let tw = target.width.map_or(UNSET_DIM, u64::from);
    let th = target.height.map_or(UNSET_DIM, u64::from);
    if bw < tw || bh < th {
        return Err(Unsuitable::TooSmall);
    }

    // 8. Crop: identical crop or no crop at all.
    if base.crop.is_some() && base.crop != target.crop {
        return Err(Unsuitable::CropMismatch);
    }

    // 7. Operations already on the base must match the target exactly.
    if base.flip.is_some() && base.flip != target.flip {
        return Err(Unsuitable::AttributeMismatch);
    }
    if base.rotation.is_some() && base.rotation != target.rotation {
        return Err(Unsuitable::AttributeMismatch);
    }
    if base.icc_profile.is_some()
        && (base.icc_profile != target.icc_profile
            || base.icc_intent != target.icc_intent
            || base.icc_bpc != target.icc_bpc)
    {
        return Err(Unsuitable::AttributeMismatch);
    }
    if base.colorspace.is_some() && base.colorspace != target.colorspace {
        return Err(Unsuitable::AttributeMismatch);
    }
    if base.strip.is_some() && base.strip != target.strip {
        return Err(Unsuitable::AttributeMismatch);
    }
    // DPI matters only for PDF sources, where it selects the raster size.
    if base.src_extension() == "pdf" && base.dpi.is_some() && base.dpi != target.dpi {
        return Err(Unsuitable::AttributeMismatch);
    }

    // 11. Pipeline ordering: flip -> rotate -> crop. A pending flip
    // forbids a rotated or cropped base; a pending rotation forbids a
    // cropped base.
    let flip_pending = target.flip.is_some() && base.flip.is_none();
    let rotation_pending = target.rotation.is_some() && base.rotation.is_none();
    if flip_pending && (base.rotation.is_some() || base.crop.is_some()) {
        return Err(Unsuitable::PipelineOrder);
    }
    if rotation_pending && base.crop.is_some() {
        return Err(Unsuitable::PipelineOrder);
    }

    // 12. Padding placement must agree where it may already be baked in.
    if base.size_fit.is_some() && base.size_fit != target.size_fit {
        return Err(Unsuitable::PaddingMismatch);
    }
    if base.crop_fit.is_some() && base.crop_fit != target.crop_fit {
        return Err(Unsuitable::PaddingMismatch);
    }
    let base_sized = base.width.is_some() && base.height.is_some();
    if base_sized && (base.align_h != target.align_h || base.align_v != target.align_v) {
        return Err(Unsuitable::PaddingMismatch);
    }

    Ok(())
}

/// Group candidates by the attributes a base can never change: output
/// format, fill, and whether the entry is a tile. The cache index stores
/// this hash so the base search can pre-filter with a range query.
pub fn attr_group_hash(spec: &ImageSpec) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(spec.format.as_deref().unwrap_or(""));
    hasher.update(b"|");
    hasher.update(spec.fill.as_deref().unwrap_or(""));
    hasher.update(b"|");
    hasher.update(if spec.is_tiled() { b"t" } else { b"-" });
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    // Keep it non-negative so the error-sentinel group (-1) never collides.
    i64::from_be_bytes(bytes) & i64::MAX
}

/// The hash for the untiled sibling of a spec; the tile special case
/// searches this group for a full-frame base at the target size.
pub fn attr_group_hash_untiled(spec: &ImageSpec) -> i64 {
    let mut untiled = spec.clone();
    untiled.tile = None;
    attr_group_hash(&untiled)
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::spec::{CropRect, Flip, TileSpec};

    fn spec(source: &str) -> ImageSpec {
        let mut s = ImageSpec::for_source(source);
        s.source_id = 1;
        s
    }

    fn sized(source: &str, w: u32, h: u32) -> ImageSpec {
        let mut s = spec(source);
        s.width = Some(w);
        s.height = Some(h);
        s
    }

    #[test]
    fn raw_style_base_serves_smaller_target() {
        // A format-only derivative can serve any sized request for the
        // same source and format.
        let base = spec("a.jpg");
        let target = sized("a.jpg", 200, 100);
        assert_eq!(suitable_for(&base, &target), Ok(()));
    }

    #[test]
    fn different_source_or_page_rejected() {
        let base = spec("a.jpg");
        let target = spec("b.jpg");
        assert_eq!(
            suitable_for(&base, &target),
            Err(Unsuitable::DifferentSource)
        );

        let mut target = spec("a.jpg");
        target.page = Some(2);
        assert_eq!(
            suitable_for(&spec("a.jpg"), &target),
            Err(Unsuitable::DifferentSource)
        );
    }

    #[test]
    fn format_and_fill_must_match() {
        let mut base = spec("a.jpg");
        base.format = Some("png".into());
        let target = spec("a.jpg");
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::FormatOrFill));

        let mut base = sized("a.jpg", 400, 200);
        base.fill = Some("red".into());
        let target = sized("a.jpg", 400, 200);
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::FormatOrFill));
    }

    #[test]
    fn sharpened_base_always_disqualified() {
        let mut base = sized("a.jpg", 400, 200);
        base.sharpen = Some(100);
        let mut target = sized("a.jpg", 200, 100);
        target.sharpen = Some(100);
        // Even an exact sharpen match disqualifies.
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::BaseSharpened));
    }

    #[test]
    fn aspect_ratio_compared_at_two_decimals() {
        let base = sized("a.jpg", 400, 200);
        let target = sized("a.jpg", 200, 100);
        assert_eq!(suitable_for(&base, &target), Ok(()));

        let target = sized("a.jpg", 200, 150);
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::AspectRatio));
    }

    #[test]
    fn quality_ladder() {
        let mut base = sized("a.jpg", 400, 200);
        base.quality = Some(60);
        let mut target = sized("a.jpg", 200, 100);
        target.quality = Some(80);
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::LowerQuality));

        // Unset quality on the base is the raw original: serves anything.
        let base = sized("a.jpg", 400, 200);
        assert_eq!(suitable_for(&base, &target), Ok(()));

        // Unset quality on the target cannot be met by an encoded base.
        let mut base = sized("a.jpg", 400, 200);
        base.quality = Some(100);
        let target = sized("a.jpg", 200, 100);
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::LowerQuality));
    }

    #[test]
    fn base_must_cover_target_size() {
        let base = sized("a.jpg", 200, 100);
        let target = sized("a.jpg", 400, 200);
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::TooSmall));

        // An unsized target needs an unsized base.
        let base = sized("a.jpg", 400, 200);
        let target = spec("a.jpg");
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::TooSmall));
    }

    #[test]
    fn crop_identical_or_absent() {
        let c = CropRect { top: 0.1, left: 0.1, bottom: 0.9, right: 0.9 };
        let c2 = CropRect { top: 0.2, left: 0.1, bottom: 0.9, right: 0.9 };

        let mut base = spec("a.jpg");
        base.crop = Some(c);
        let mut target = spec("a.jpg");
        target.crop = Some(c);
        assert_eq!(suitable_for(&base, &target), Ok(()));

        target.crop = Some(c2);
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::CropMismatch));

        target.crop = None;
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::CropMismatch));
    }

    #[test]
    fn overlay_base_only_serves_its_tiles() {
        let mut base = sized("a.jpg", 400, 400);
        base.overlay_src = Some("logo.png".into());

        // Same overlay, tiled target: allowed.
        let mut target = sized("a.jpg", 400, 400);
        target.overlay_src = Some("logo.png".into());
        target.tile = Some(TileSpec { index: 1, grid: 4 });
        assert_eq!(suitable_for(&base, &target), Ok(()));

        // Same overlay, untiled target: the overlay is never re-applied,
        // but neither can it be checked, so the base is rejected.
        let mut target = sized("a.jpg", 400, 400);
        target.overlay_src = Some("logo.png".into());
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::OverlayNotTile));

        // Different overlay: rejected.
        let mut target = sized("a.jpg", 400, 400);
        target.overlay_src = Some("other.png".into());
        target.tile = Some(TileSpec { index: 1, grid: 4 });
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::OverlayNotTile));
    }

    #[test]
    fn tiled_base_serves_only_the_identical_tile() {
        let t = TileSpec { index: 3, grid: 16 };
        let mut base = sized("a.jpg", 400, 400);
        base.tile = Some(t);

        let mut target = sized("a.jpg", 400, 400);
        target.tile = Some(t);
        assert_eq!(suitable_for(&base, &target), Ok(()));

        target.tile = Some(TileSpec { index: 4, grid: 16 });
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::TileMismatch));

        target.tile = None;
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::TileMismatch));
    }

    #[test]
    fn pipeline_order_flip_rotate_crop() {
        // Target needs a flip; base already rotated: reject.
        let mut base = spec("a.jpg");
        base.rotation = Some(90.0);
        let mut target = spec("a.jpg");
        target.rotation = Some(90.0);
        target.flip = Some(Flip::H);
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::PipelineOrder));

        // Target needs a flip; base already cropped: reject.
        let c = CropRect { top: 0.0, left: 0.0, bottom: 0.5, right: 0.5 };
        let mut base = spec("a.jpg");
        base.crop = Some(c);
        let mut target = spec("a.jpg");
        target.crop = Some(c);
        target.flip = Some(Flip::H);
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::PipelineOrder));

        // Target needs a rotation; base already cropped: reject.
        let mut base = spec("a.jpg");
        base.crop = Some(c);
        let mut target = spec("a.jpg");
        target.crop = Some(c);
        target.rotation = Some(90.0);
        assert_eq!(suitable_for(&base, &target), Err(Unsuitable::PipelineOrder));

        // Base flipped, target flipped the same way, rotation pending: fine.
        let mut base = spec("a.jpg");
        base.flip = Some(Flip::H);
        let mut target = spec("a.jpg");
        target.flip = Some(Flip::H);
        target.rotation = Some(90.0);
        assert_eq!(suitable_for(&base, &target), Ok(()));
    }

    #[test]
    fn already_applied_attributes_must_match() {
        let mut base = spec("a.jpg");
        base.flip = Some(Flip::H);
        let mut target = spec("a.jpg");
        target.flip = Some(Flip::V);
        assert_eq!(
            suitable_for(&base, &target),
            Err(Unsuitable::AttributeMismatch)
        );

        let mut base = spec("a.jpg");
        base.colorspace = Some(crate::spec::Colorspace::Gray);
        let target = spec("a.jpg");
        assert_eq!(
            suitable_for(&base, &target),
            Err(Unsuitable::AttributeMismatch)
        );
    }

    #[test]
    fn padding_attributes_must_agree() {
        let mut base = sized("a.jpg", 400, 200);
        base.size_fit = Some(true);
        let target = sized("a.jpg", 400, 200);
        assert_eq!(
            suitable_for(&base, &target),
            Err(Unsuitable::PaddingMismatch)
        );

        let mut base = sized("a.jpg", 400, 200);
        base.align_h = Some(crate::spec::Align { edge: 'L', pos: 0.0 });
        let target = sized("a.jpg", 400, 200);
        assert_eq!(
            suitable_for(&base, &target),
            Err(Unsuitable::PaddingMismatch)
        );
    }

    #[test]
    fn group_hash_distinguishes_format_fill_and_tiling() {
        let a = spec("a.jpg");
        let mut b = spec("a.jpg");
        b.format = Some("png".into());
        let mut c = spec("a.jpg");
        c.fill = Some("red".into());
        let mut d = spec("a.jpg");
        d.tile = Some(TileSpec { index: 1, grid: 4 });

        let hashes = [
            attr_group_hash(&a),
            attr_group_hash(&b),
            attr_group_hash(&c),
            attr_group_hash(&d),
        ];
        for i in 0..hashes.len() {
            for j in (i + 1)..hashes.len() {
                assert_ne!(hashes[i], hashes[j]);
            }
        }

        // The untiled hash of a tiled spec equals the untiled spec's hash.
        assert_eq!(attr_group_hash_untiled(&d), attr_group_hash(&a));
    }
}
