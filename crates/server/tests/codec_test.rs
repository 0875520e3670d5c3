#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Codec pipeline integration tests.
//!
//! Exercises the spec -> delta -> codec flow end to end: a base image
//! accepted by the suitability rules must produce the same derivative
//! (within codec tolerance) as starting over from the original.

use std::collections::HashMap;
use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb};
use refract_server::codec::{delta_ops, Codec, DeltaResources, RasterCodec};
use refract_server::spec::{suitable_for, ImageSpec};

fn gradient_png(w: u32, h: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(image::ImageBuffer::from_fn(w, h, |x, y| {
        Rgb([
            (x * 255 / w.max(1)) as u8,
            (y * 255 / h.max(1)) as u8,
            128,
        ])
    }));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn spec_of(pairs: &[(&str, &str)]) -> ImageSpec {
    let params: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mut spec = ImageSpec::from_params(&params).unwrap();
    spec.source_id = 1;
    spec.normalise();
    spec
}

fn adjust(codec: &RasterCodec, input: &[u8], base: &ImageSpec, target: &ImageSpec) -> Vec<u8> {
    let ops = delta_ops(
        base,
        target,
        DeltaResources {
            overlay_bytes: None,
            icc_data: None,
            default_quality: 80,
        },
    );
    codec.adjust(input, "png", &ops).unwrap()
}

fn mean_rgb(bytes: &[u8]) -> [f64; 3] {
    let img = image::load_from_memory(bytes).unwrap().to_rgb8();
    let mut sum = [0f64; 3];
    let count = (img.width() * img.height()) as f64;
    for p in img.pixels() {
        for i in 0..3 {
            sum[i] += f64::from(p.0[i]);
        }
    }
    [sum[0] / count, sum[1] / count, sum[2] / count]
}

#[test]
fn base_image_route_matches_direct_route() {
    let codec = RasterCodec::new();
    let original_bytes = gradient_png(400, 200);
    let original = spec_of(&[("src", "g.png")]);

    // Intermediate derivative: 200x100.
    let base = spec_of(&[("src", "g.png"), ("width", "200"), ("height", "100")]);
    let base_bytes = adjust(&codec, &original_bytes, &original, &base);

    // Target: 100x50, same aspect, same (absent) everything else.
    let target = spec_of(&[("src", "g.png"), ("width", "100"), ("height", "50")]);
    assert_eq!(suitable_for(&base, &target), Ok(()));

    let via_base = adjust(&codec, &base_bytes, &base, &target);
    let direct = adjust(&codec, &original_bytes, &original, &target);

    let dims_a = codec.dimensions(&via_base, "png").unwrap();
    let dims_b = codec.dimensions(&direct, "png").unwrap();
    assert_eq!(dims_a, (100, 50));
    assert_eq!(dims_a, dims_b);

    // Pixel content within codec tolerance.
    let a = mean_rgb(&via_base);
    let b = mean_rgb(&direct);
    for i in 0..3 {
        assert!(
            (a[i] - b[i]).abs() < 2.0,
            "channel {i} diverged: {} vs {}",
            a[i],
            b[i]
        );
    }
}

#[test]
fn tile_from_untiled_base_matches_direct_tile() {
    let codec = RasterCodec::new();
    let original_bytes = gradient_png(400, 400);
    let original = spec_of(&[("src", "g.png")]);

    // The untiled derivative at the target size.
    let untiled = spec_of(&[("src", "g.png"), ("width", "200"), ("height", "200")]);
    let untiled_bytes = adjust(&codec, &original_bytes, &original, &untiled);

    // Tile 1 of a 2x2 grid, cut from the untiled base.
    let tiled = spec_of(&[
        ("src", "g.png"),
        ("width", "200"),
        ("height", "200"),
        ("tile", "1:4"),
    ]);
    assert_eq!(suitable_for(&untiled, &tiled), Ok(()));
    let via_base = adjust(&codec, &untiled_bytes, &untiled, &tiled);

    // The same tile generated straight from the original.
    let direct = adjust(&codec, &original_bytes, &original, &tiled);

    assert_eq!(codec.dimensions(&via_base, "png").unwrap(), (100, 100));
    assert_eq!(codec.dimensions(&direct, "png").unwrap(), (100, 100));

    let a = mean_rgb(&via_base);
    let b = mean_rgb(&direct);
    for i in 0..3 {
        assert!((a[i] - b[i]).abs() < 2.0);
    }
}

#[test]
fn flip_is_not_reapplied_on_a_flipped_base() {
    let codec = RasterCodec::new();
    let original_bytes = gradient_png(100, 100);
    let original = spec_of(&[("src", "g.png")]);

    let flipped = spec_of(&[("src", "g.png"), ("flip", "h")]);
    let flipped_bytes = adjust(&codec, &original_bytes, &original, &flipped);

    // Target: flipped and resized. Delta from the flipped base must
    // only resize; re-flipping would undo the mirror.
    let target = spec_of(&[
        ("src", "g.png"),
        ("flip", "h"),
        ("width", "50"),
        ("height", "50"),
    ]);
    assert_eq!(suitable_for(&flipped, &target), Ok(()));
    let via_base = adjust(&codec, &flipped_bytes, &flipped, &target);
    let direct = adjust(&codec, &original_bytes, &original, &target);

    // Compare a corner: the top-left of a mirrored gradient is red-heavy.
    let img_a = image::load_from_memory(&via_base).unwrap().to_rgb8();
    let img_b = image::load_from_memory(&direct).unwrap().to_rgb8();
    let pa = img_a.get_pixel(0, 0);
    let pb = img_b.get_pixel(0, 0);
    assert!((f64::from(pa.0[0]) - f64::from(pb.0[0])).abs() < 6.0);
    assert!(pa.0[0] > 128, "top-left should be from the right edge");
}

#[test]
fn jpeg_conversion_of_png_source() {
    let codec = RasterCodec::new();
    let original_bytes = gradient_png(300, 150);
    let original = spec_of(&[("src", "g.png")]);

    let target = spec_of(&[
        ("src", "g.png"),
        ("format", "jpg"),
        ("width", "200"),
        ("quality", "75"),
    ]);
    let out = adjust(&codec, &original_bytes, &original, &target);
    assert_eq!(&out[..2], &[0xFF, 0xD8], "not a JPEG");
    assert_eq!(codec.dimensions(&out, "jpg").unwrap(), (200, 100));
}

#[test]
fn zero_byte_source_is_a_decode_failure() {
    let codec = RasterCodec::new();
    let original = spec_of(&[("src", "g.png")]);
    let target = spec_of(&[("src", "g.png"), ("width", "100")]);

    let ops = delta_ops(
        &original,
        &target,
        DeltaResources {
            overlay_bytes: None,
            icc_data: None,
            default_quality: 80,
        },
    );
    let err = codec.adjust(&[], "png", &ops).unwrap_err();
    assert!(matches!(
        err,
        refract_server::codec::CodecError::Decode(_)
    ));
}
