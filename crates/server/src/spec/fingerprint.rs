//! Cache-key derivation.
//!
//! The fingerprint is a deterministic, prefix-tagged concatenation of
//! every set field in a fixed order. Floats are rendered at 5 decimal
//! places so equality is bit-stable across platforms. The metadata
//! fingerprint addresses the per-derivative metadata record under a
//! separate prefix.

use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

use super::ImageSpec;

/// Keys must fit the cache's 250-byte ASCII limit; overlay paths are
/// unbounded, so they enter the key as a short digest.
fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

fn fmt_f(v: f64) -> String {
    format!("{v:.5}")
}

impl ImageSpec {
    /// The cache key for this derivative.
    ///
    /// Preconditions: the source id is resolved, the template applied and
    /// the spec normalised.
    pub fn fingerprint(&self) -> AppResult<String> {
        if self.source_id <= 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "fingerprint requires a resolved source id"
            )));
        }
        Ok(format!("IMG:{}{}", self.source_id, self.attr_suffix()))
    }

    /// The key of the metadata record paired with this derivative.
    pub fn metadata_fingerprint(&self) -> AppResult<String> {
        if self.source_id <= 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "fingerprint requires a resolved source id"
            )));
        }
        Ok(format!("MET:{}{}", self.source_id, self.attr_suffix()))
    }

    /// Every set attribute, prefix-tagged, in a fixed order.
    fn attr_suffix(&self) -> String {
        let mut out = String::new();
        let mut push = |tag: &str, value: String| {
            out.push(',');
            out.push_str(tag);
            out.push_str(&value);
        };

        if let Some(p) = self.page {
            push("p", p.to_string());
        }
        if let Some(ref t) = self.template {
            push("tmp", t.clone());
        }
        if let Some(ref f) = self.format {
            push("f", f.clone());
        }
        if let Some(w) = self.width {
            push("w", w.to_string());
        }
        if let Some(h) = self.height {
            push("h", h.to_string());
        }
        if let Some(a) = self.align_h {
            push("ha", a.to_string());
        }
        if let Some(a) = self.align_v {
            push("va", a.to_string());
        }
        if let Some(r) = self.rotation {
            push("r", fmt_f(r));
        }
        if let Some(fl) = self.flip {
            push("fl", fl.as_str().to_string());
        }
        if let Some(ref c) = self.crop {
            push(
                "c",
                format!(
                    "{}:{}:{}:{}",
                    fmt_f(c.top),
                    fmt_f(c.left),
                    fmt_f(c.bottom),
                    fmt_f(c.right)
                ),
            );
        }
        if self.crop_fit == Some(true) {
            push("cf", String::new());
        }
        if self.size_fit == Some(true) {
            push("sf", String::new());
        }
        if let Some(ref f) = self.fill {
            push("fi", f.clone());
        }
        if let Some(q) = self.quality {
            push("q", q.to_string());
        }
        if let Some(s) = self.sharpen {
            push("sh", s.to_string());
        }
        if let Some(ref o) = self.overlay_src {
            push("ov", short_hash(o));
        }
        if let Some(ref p) = self.overlay_pos {
            push("op", p.clone());
        }
        if let Some(s) = self.overlay_size {
            push("os", fmt_f(s));
        }
        if let Some(o) = self.overlay_opacity {
            push("oo", fmt_f(o));
        }
        if let Some(ref i) = self.icc_profile {
            push("icc", i.clone());
        }
        if let Some(i) = self.icc_intent {
            push("in", i.as_str().to_string());
        }
        if self.icc_bpc == Some(true) {
            push("bpc", String::new());
        }
        if let Some(cs) = self.colorspace {
            push("cs", cs.as_str().to_string());
        }
        if self.strip == Some(true) {
            push("st", String::new());
        }
        if let Some(d) = self.dpi {
            push("d", d.to_string());
        }
        if let Some(t) = self.tile {
            push("t", format!("{}:{}", t.index, t.grid));
        }

        out
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use crate::spec::{Flip, ImageSpec};

    fn spec_for(pairs: &[(&str, &str)]) -> ImageSpec {
        let params: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut spec = ImageSpec::from_params(&params).unwrap();
        spec.source_id = 42;
        spec.normalise();
        spec
    }

    #[test]
    fn requires_source_id() {
        let mut spec = ImageSpec::for_source("a.jpg");
        assert!(spec.fingerprint().is_err());
        spec.source_id = 7;
        assert!(spec.fingerprint().is_ok());
    }

    #[test]
    fn bare_spec_key_is_just_the_source() {
        let spec = spec_for(&[("src", "a.jpg")]);
        assert_eq!(spec.fingerprint().unwrap(), "IMG:42");
        assert_eq!(spec.metadata_fingerprint().unwrap(), "MET:42");
    }

    #[test]
    fn equivalent_requests_share_a_key() {
        // rotate 180 + flip v normalises to flip h.
        let a = spec_for(&[("src", "a.jpg"), ("angle", "180"), ("flip", "v")]);
        let b = spec_for(&[("src", "a.jpg"), ("flip", "h")]);
        assert_eq!(a.flip, Some(Flip::H));
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn every_set_attribute_changes_the_key() {
        let base = spec_for(&[("src", "a.jpg"), ("width", "200")]);
        let variants = [
            spec_for(&[("src", "a.jpg"), ("width", "201")]),
            spec_for(&[("src", "a.jpg"), ("width", "200"), ("height", "100")]),
            spec_for(&[("src", "a.jpg"), ("width", "200"), ("format", "png")]),
            spec_for(&[("src", "a.jpg"), ("width", "200"), ("quality", "50")]),
            spec_for(&[("src", "a.jpg"), ("width", "200"), ("flip", "h")]),
            spec_for(&[("src", "a.jpg"), ("width", "200"), ("angle", "90")]),
            spec_for(&[("src", "a.jpg"), ("width", "200"), ("tile", "1:4")]),
            spec_for(&[("src", "a.jpg"), ("width", "200"), ("strip", "1")]),
        ];
        let base_fp = base.fingerprint().unwrap();
        for v in &variants {
            assert_ne!(base_fp, v.fingerprint().unwrap());
        }
    }

    #[test]
    fn floats_are_rendered_at_fixed_precision() {
        let spec = spec_for(&[("src", "a.jpg"), ("angle", "45")]);
        assert!(spec.fingerprint().unwrap().contains("r45.00000"));

        let spec = spec_for(&[
            ("src", "a.jpg"),
            ("top", "0.1"),
            ("bottom", "0.9"),
        ]);
        let fp = spec.fingerprint().unwrap();
        assert!(fp.contains("c0.10000:0.00000:0.90000:1.00000"), "{fp}");
    }

    #[test]
    fn key_stays_within_cache_limit_with_long_overlay_paths() {
        let long = "x/".repeat(400) + "logo.png";
        let spec = spec_for(&[("src", "a.jpg"), ("width", "100"), ("height", "100"), ("overlay", long.as_str())]);
        let fp = spec.fingerprint().unwrap();
        assert!(fp.len() <= 250, "key too long: {}", fp.len());
        assert!(fp.is_ascii());
    }
}
