//! Normalisation: erase semantic no-ops so that equivalent requests
//! produce identical fingerprints.
//!
//! Every rule here is idempotent; `normalise` applied twice yields the
//! same spec as applied once.

use crate::colour;

use super::{canonical_format, ImageSpec};

impl ImageSpec {
    /// Erase fields whose value is a semantic no-op and collapse
    /// equivalent transformations onto one canonical form.
    pub fn normalise(&mut self) {
        // Format synonyms collapse; a format equal to the source's own
        // extension is a no-op re-encode.
        if let Some(f) = self.format.take() {
            let f = canonical_format(&f.to_lowercase());
            if f != self.src_extension() {
                self.format = Some(f);
            }
        }

        // Page 1 is the default for multi-page sources.
        if self.page == Some(1) {
            self.page = None;
        }

        // A zero dimension means "unspecified".
        if self.width == Some(0) {
            self.width = None;
        }
        if self.height == Some(0) {
            self.height = None;
        }

        // Full turns are identity.
        if let Some(r) = self.rotation {
            if r == 0.0 || r == 360.0 || r == -360.0 {
                self.rotation = None;
            }
        }

        // rotate 180 + flip v is the same image as flip h.
        if let (Some(r), Some(super::Flip::V)) = (self.rotation, self.flip) {
            if r == 180.0 || r == -180.0 {
                self.rotation = None;
                self.flip = Some(super::Flip::H);
            }
        }

        // Centred alignment is where content lands anyway.
        if self.align_h.is_some_and(|a| a.is_identity()) {
            self.align_h = None;
        }
        if self.align_v.is_some_and(|a| a.is_identity()) {
            self.align_v = None;
        }

        // The full-frame crop selects everything.
        if self.crop.as_ref().is_some_and(|c| c.is_full()) {
            self.crop = None;
        }

        // crop-fit only means something alongside a crop.
        if self.crop_fit == Some(false) || self.crop.is_none() {
            self.crop_fit = None;
        }

        // size-fit only means something when both dimensions are given.
        if self.size_fit == Some(false) || self.width.is_none() || self.height.is_none() {
            self.size_fit = None;
        }

        if self.sharpen == Some(0) {
            self.sharpen = None;
        }

        // Overlay sub-fields without an overlay are dangling; full-size,
        // fully-opaque, centred are the defaults.
        if self.overlay_src.is_none() {
            self.overlay_pos = None;
            self.overlay_size = None;
            self.overlay_opacity = None;
        } else {
            if self.overlay_pos.as_deref() == Some("c") {
                self.overlay_pos = None;
            }
            if self.overlay_size == Some(1.0) {
                self.overlay_size = None;
            }
            if self.overlay_opacity == Some(1.0) {
                self.overlay_opacity = None;
            }
        }

        // Intent and black-point compensation require a profile.
        if self.icc_profile.is_none() {
            self.icc_intent = None;
            self.icc_bpc = None;
        }
        if self.icc_bpc == Some(false) {
            self.icc_bpc = None;
        }

        if self.strip == Some(false) {
            self.strip = None;
        }

        if self.dpi == Some(0) {
            self.dpi = None;
        }

        // Degenerate grids address the whole image.
        if self.tile.is_some_and(|t| t.grid < 2) {
            self.tile = None;
        }

        // Fill: white is the default canvas; fill is invisible unless the
        // image is rotated or padded into an explicit width x height box.
        if let Some(f) = self.fill.take() {
            let f = f.to_lowercase();
            let f = if f == "transparent" { "none".to_string() } else { f };
            let visible = self.rotation.is_some() || (self.width.is_some() && self.height.is_some());
            if visible && !colour::is_white(&f) {
                self.fill = Some(f);
            }
        }
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use crate::spec::{Align, CropRect, Flip, ImageSpec, TileSpec};

    fn normalised(spec: &ImageSpec) -> ImageSpec {
        let mut s = spec.clone();
        s.normalise();
        s
    }

    #[test]
    fn erases_no_ops() {
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.format = Some("jpeg".into());
        spec.page = Some(1);
        spec.width = Some(0);
        spec.height = Some(0);
        spec.rotation = Some(360.0);
        spec.align_h = Some(Align { edge: 'C', pos: 0.5 });
        spec.align_v = Some(Align { edge: 'C', pos: 0.5 });
        spec.crop = Some(CropRect::FULL);
        spec.crop_fit = Some(true);
        spec.size_fit = Some(true);
        spec.fill = Some("white".into());
        spec.sharpen = Some(0);
        spec.strip = Some(false);
        spec.dpi = Some(0);
        spec.tile = Some(TileSpec { index: 1, grid: 1 });

        spec.normalise();
        assert_eq!(spec, ImageSpec::for_source("a.jpg"));
    }

    #[test]
    fn format_synonyms_collapse() {
        let mut spec = ImageSpec::for_source("a.png");
        spec.format = Some("pjpeg".into());
        spec.normalise();
        assert_eq!(spec.format.as_deref(), Some("pjpg"));

        let mut spec = ImageSpec::for_source("a.tif");
        spec.format = Some("tiff".into());
        spec.normalise();
        assert_eq!(spec.format, None);
    }

    #[test]
    fn rotate_180_flip_v_becomes_flip_h() {
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.rotation = Some(180.0);
        spec.flip = Some(Flip::V);
        spec.normalise();
        assert_eq!(spec.rotation, None);
        assert_eq!(spec.flip, Some(Flip::H));

        // The negative half-turn is the same half-turn.
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.rotation = Some(-180.0);
        spec.flip = Some(Flip::V);
        spec.normalise();
        assert_eq!(spec.flip, Some(Flip::H));

        // flip h is left alone.
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.rotation = Some(180.0);
        spec.flip = Some(Flip::H);
        spec.normalise();
        assert_eq!(spec.rotation, Some(180.0));
        assert_eq!(spec.flip, Some(Flip::H));
    }

    #[test]
    fn fill_cleared_when_invisible() {
        // No rotation, no full box: fill can't show.
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.width = Some(200);
        spec.fill = Some("red".into());
        spec.normalise();
        assert_eq!(spec.fill, None);

        // Rotation makes fill visible.
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.rotation = Some(45.0);
        spec.fill = Some("red".into());
        spec.normalise();
        assert_eq!(spec.fill.as_deref(), Some("red"));

        // A full box makes fill visible, but white is the default canvas.
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.width = Some(200);
        spec.height = Some(200);
        spec.fill = Some("#FFFFFF".into());
        spec.normalise();
        assert_eq!(spec.fill, None);

        let mut spec = ImageSpec::for_source("a.jpg");
        spec.width = Some(200);
        spec.height = Some(200);
        spec.fill = Some("TRANSPARENT".into());
        spec.normalise();
        assert_eq!(spec.fill.as_deref(), Some("none"));
    }

    #[test]
    fn overlay_defaults_erased() {
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.overlay_src = Some("logo.png".into());
        spec.overlay_pos = Some("c".into());
        spec.overlay_size = Some(1.0);
        spec.overlay_opacity = Some(1.0);
        spec.normalise();
        assert_eq!(spec.overlay_src.as_deref(), Some("logo.png"));
        assert_eq!(spec.overlay_pos, None);
        assert_eq!(spec.overlay_size, None);
        assert_eq!(spec.overlay_opacity, None);

        // Dangling overlay attributes without an overlay source.
        let mut spec = ImageSpec::for_source("a.jpg");
        spec.overlay_opacity = Some(0.5);
        spec.normalise();
        assert_eq!(spec.overlay_opacity, None);
    }

    #[test]
    fn normalise_is_idempotent_on_handpicked_specs() {
        let mut spec = ImageSpec::for_source("x/y.jpg");
        spec.format = Some("jpeg".into());
        spec.width = Some(300);
        spec.height = Some(150);
        spec.rotation = Some(180.0);
        spec.flip = Some(Flip::V);
        spec.fill = Some("grey".into());
        spec.crop = Some(CropRect { top: 0.1, left: 0.1, bottom: 0.9, right: 0.9 });
        spec.crop_fit = Some(true);

        let once = normalised(&spec);
        let twice = normalised(&once);
        assert_eq!(once, twice);
    }

    proptest! {
        // Normalisation idempotence over arbitrary well-formed requests.
        #[test]
        fn normalise_is_idempotent(
            width in 0u32..400,
            height in 0u32..400,
            angle in prop::sample::select(vec![-360.0, -180.0, -90.0, 0.0, 45.0, 90.0, 180.0, 360.0]),
            flip in prop::sample::select(vec!["", "h", "v"]),
            format in prop::sample::select(vec!["", "jpg", "jpeg", "png", "pjpeg"]),
            fill in prop::sample::select(vec!["", "white", "black", "none", "auto", "#fff"]),
            quality in 1u8..=100,
            sharpen in -500i32..=500,
            tile_grid in prop::sample::select(vec![0u32, 1, 4, 16]),
        ) {
            let mut params: HashMap<String, String> = HashMap::new();
            params.insert("src".into(), "t/img.jpg".into());
            params.insert("width".into(), width.to_string());
            params.insert("height".into(), height.to_string());
            params.insert("angle".into(), angle.to_string());
            params.insert("quality".into(), quality.to_string());
            params.insert("sharpen".into(), sharpen.to_string());
            if !flip.is_empty() { params.insert("flip".into(), flip.into()); }
            if !format.is_empty() { params.insert("format".into(), format.into()); }
            if !fill.is_empty() { params.insert("fill".into(), fill.into()); }
            if tile_grid > 0 { params.insert("tile".into(), format!("1:{tile_grid}")); }

            let spec = ImageSpec::from_params(&params).unwrap();
            let once = normalised(&spec);
            let twice = normalised(&once);
            prop_assert_eq!(once, twice);
        }
    }
}
