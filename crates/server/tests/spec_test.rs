#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Spec pipeline integration tests.
//!
//! Request parameters -> validation -> template -> defaults ->
//! normalisation -> fingerprint, plus the base-suitability rules, as
//! one flow.

use std::collections::HashMap;

use refract_server::spec::{
    attr_group_hash, suitable_for, ImageSpec, ImagingDefaults, Unsuitable,
};

fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn finalised(pairs: &[(&str, &str)]) -> ImageSpec {
    let mut spec = ImageSpec::from_params(&params(pairs)).unwrap();
    spec.source_id = 7;
    spec.apply_defaults(&ImagingDefaults {
        format: Some("jpg".to_string()),
        colorspace: None,
        strip: Some(false),
        dpi: None,
    });
    spec.normalise();
    spec
}

#[test]
fn rotate_180_flip_v_request_matches_flip_h_request() {
    // The generated bytes and the cache key must match those of flip=h.
    let a = finalised(&[
        ("src", "test_images/cathedral.jpg"),
        ("angle", "180"),
        ("flip", "v"),
    ]);
    let b = finalised(&[("src", "test_images/cathedral.jpg"), ("flip", "h")]);
    assert_eq!(a, b);
    assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
}

#[test]
fn zero_dimensions_request_original_size() {
    let spec = finalised(&[
        ("src", "test_images/cathedral.jpg"),
        ("width", "0"),
        ("height", "0"),
        ("quality", "70"),
    ]);
    assert_eq!(spec.width, None);
    assert_eq!(spec.height, None);
    // The default jpg format is erased for a .jpg source; only the
    // quality adjustment remains in the key.
    assert_eq!(spec.fingerprint().unwrap(), "IMG:7,q70");
}

#[test]
fn default_format_erased_for_matching_source() {
    // A .jpg source with the server default of jpg is a no-op re-encode.
    let spec = finalised(&[("src", "a.jpg"), ("width", "200")]);
    assert_eq!(spec.format, None);

    // A .png source picks the default up for real.
    let spec = finalised(&[("src", "a.png"), ("width", "200")]);
    assert_eq!(spec.format.as_deref(), Some("jpg"));
}

#[test]
fn defaults_never_set_quality() {
    let spec = finalised(&[("src", "a.png"), ("width", "200")]);
    assert_eq!(spec.quality, None);
}

#[test]
fn template_values_fill_only_unset_fields() {
    let mut spec = ImageSpec::from_params(&params(&[
        ("src", "test_images/cathedral.jpg"),
        ("width", "400"),
    ]))
    .unwrap();

    let template = ImageSpec::from_template_params(&params(&[
        ("format", "jpg"),
        ("width", "200"),
        ("height", "200"),
        ("strip", "1"),
    ]))
    .unwrap();

    spec.apply_template(&template, false);
    assert_eq!(spec.width, Some(400));
    assert_eq!(spec.height, Some(200));
    assert_eq!(spec.strip, Some(true));
}

#[test]
fn smallest_square_grid_tiles_are_valid() {
    for index in ["1", "4"] {
        let spec = finalised(&[
            ("src", "a.jpg"),
            ("width", "256"),
            ("height", "256"),
            ("tile", &format!("{index}:4")),
        ]);
        assert!(spec.tile.is_some());
        assert!(spec.fingerprint().unwrap().contains(&format!("t{index}:4")));
    }
}

#[test]
fn pyramid_style_base_chain_is_suitable() {
    // Each pyramid level serves requests at or below its size with the
    // same aspect.
    let level = finalised(&[
        ("src", "big.jpg"),
        ("width", "2000"),
        ("height", "1000"),
    ]);
    let request = finalised(&[
        ("src", "big.jpg"),
        ("width", "500"),
        ("height", "250"),
    ]);
    assert_eq!(suitable_for(&level, &request), Ok(()));
    assert_eq!(attr_group_hash(&level), attr_group_hash(&request));
}

#[test]
fn flip_then_crop_request_rejects_cropped_base() {
    // Order of operations: a target needing a flip cannot start from a
    // base that is already cropped.
    let base = finalised(&[
        ("src", "a.jpg"),
        ("top", "0.1"),
        ("bottom", "0.9"),
    ]);
    let target = finalised(&[
        ("src", "a.jpg"),
        ("top", "0.1"),
        ("bottom", "0.9"),
        ("flip", "h"),
    ]);
    assert_eq!(
        suitable_for(&base, &target),
        Err(Unsuitable::PipelineOrder)
    );
}

#[test]
fn quality_and_size_ladders_hold_together() {
    let base = finalised(&[
        ("src", "a.png"),
        ("width", "800"),
        ("height", "400"),
        ("quality", "85"),
    ]);

    let ok = finalised(&[
        ("src", "a.png"),
        ("width", "400"),
        ("height", "200"),
        ("quality", "70"),
    ]);
    assert_eq!(suitable_for(&base, &ok), Ok(()));

    let too_big = finalised(&[
        ("src", "a.png"),
        ("width", "1600"),
        ("height", "800"),
        ("quality", "70"),
    ]);
    assert_eq!(suitable_for(&base, &too_big), Err(Unsuitable::TooSmall));

    let too_good = finalised(&[
        ("src", "a.png"),
        ("width", "400"),
        ("height", "200"),
        ("quality", "95"),
    ]);
    assert_eq!(suitable_for(&base, &too_good), Err(Unsuitable::LowerQuality));
}

#[test]
fn fingerprints_fit_the_cache_key_limit() {
    // Worst-case realistic request with everything set.
    let spec = finalised(&[
        ("src", "some/deep/folder/structure/image-name.png"),
        ("page", "3"),
        ("format", "webp"),
        ("width", "32000"),
        ("height", "32000"),
        ("halign", "L0.33333"),
        ("valign", "B0.66667"),
        ("angle", "-359.99999"),
        ("flip", "v"),
        ("top", "0.00001"),
        ("left", "0.00001"),
        ("bottom", "0.99999"),
        ("right", "0.99999"),
        ("autocropfit", "1"),
        ("autosizefit", "1"),
        ("fill", "#abcdef"),
        ("quality", "100"),
        ("sharpen", "-500"),
        ("overlay", "watermarks/company-logo-extra-long-name.png"),
        ("ovpos", "se"),
        ("ovsize", "0.25"),
        ("ovopacity", "0.5"),
        ("icc", "someprofile"),
        ("intent", "perceptual"),
        ("bpc", "1"),
        ("colorspace", "gray"),
        ("strip", "1"),
        ("dpi", "300"),
        ("tile", "7:16"),
    ]);
    let fp = spec.fingerprint().unwrap();
    assert!(fp.len() <= 250, "fingerprint too long: {} ({fp})", fp.len());
    assert!(fp.is_ascii());
}
