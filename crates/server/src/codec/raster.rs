//! High-capability raster codec.
//!
//! Decoding and encoding via `image`, SIMD resizing via
//! `fast_image_resize`, EXIF extraction via `kamadak-exif`. Arbitrary
//! rotation uses an internal bilinear sampler; right angles are
//! lossless.
//!
//! Operation order inside one `adjust` call is fixed: page -> flip ->
//! rotate -> crop -> resize/pad -> overlay -> tile -> colourspace ->
//! sharpen -> encode.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use fast_image_resize::{self as fir, PixelType, ResizeOptions};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{
    DynamicImage, GenericImageView, ImageEncoder, ImageFormat, ImageReader, Rgba, RgbaImage,
};
use tracing::debug;

use crate::spec::{Align, Colorspace, CropRect, Flip, TileSpec};

use super::{caps, AdjustOps, Codec, CodecError, FillStyle, OverlayOp, ProfileProperty};

/// Raster codec over the `image` crate.
#[derive(Debug, Default)]
pub struct RasterCodec;

impl RasterCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for RasterCodec {
    fn adjust(&self, bytes: &[u8], hint: &str, ops: &AdjustOps) -> Result<Vec<u8>, CodecError> {
        if ops.page.is_some_and(|p| p > 1) {
            return Err(CodecError::Unsupported("page"));
        }
        if ops.colorspace == Some(Colorspace::Cmyk) {
            return Err(CodecError::Unsupported("colorspace"));
        }

        let mut img = decode(bytes, hint)?;

        if let Some(flip) = ops.flip {
            img = match flip {
                Flip::H => img.fliph(),
                Flip::V => img.flipv(),
            };
        }

        if let Some(degrees) = ops.rotation {
            img = rotate(&img, degrees, background(ops, &img));
        }

        if let Some(crop) = ops.crop {
            img = apply_crop(&img, crop, ops);
        }

        if ops.width.is_some() || ops.height.is_some() {
            img = resize_and_pad(&img, ops)?;
        }

        if let Some(overlay) = &ops.overlay {
            img = apply_overlay(img, overlay, hint)?;
        }

        if let Some(tile) = ops.tile {
            img = extract_tile(&img, tile);
        }

        if ops.colorspace == Some(Colorspace::Gray) {
            img = DynamicImage::ImageLuma8(img.to_luma8());
        }

        if let Some(sharpen) = ops.sharpen {
            img = apply_sharpen(&img, sharpen);
        }

        encode(
            &img,
            &ops.format,
            ops.quality,
            ops.icc.as_ref().map(|i| i.data.as_slice()),
        )
    }

    fn dimensions(&self, bytes: &[u8], hint: &str) -> Result<(u32, u32), CodecError> {
        let reader = reader_for(bytes, hint)?;
        reader
            .into_dimensions()
            .map_err(|e| CodecError::Decode(format!("failed to read dimensions: {e}")))
    }

    fn profile_data(&self, bytes: &[u8], _hint: &str) -> Result<Vec<ProfileProperty>, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let exif = match exif::Reader::new().read_from_container(&mut cursor) {
            Ok(exif) => exif,
            // No embedded metadata is an empty answer, not a failure.
            Err(_) => return Ok(Vec::new()),
        };

        let props = exif
            .fields()
            .map(|field| ProfileProperty {
                profile: "EXIF".to_string(),
                key: field.tag.to_string(),
                value: field.display_value().with_unit(&exif).to_string(),
            })
            .collect();
        Ok(props)
    }

    fn burst_pdf(&self, _bytes: &[u8], _dest_dir: &Path, _dpi: u32) -> Result<bool, CodecError> {
        Err(CodecError::Unsupported("pdf"))
    }

    fn supported_operations(&self) -> HashSet<&'static str> {
        [
            "format",
            "quality",
            "width",
            "height",
            "size_fit",
            "align_h",
            "align_v",
            "flip",
            caps::ROTATION,
            caps::ROTATION_ANY,
            "crop",
            "crop_fit",
            "fill",
            "sharpen",
            "overlay_src",
            "icc_profile",
            "colorspace",
            "strip",
            "tile",
        ]
        .into_iter()
        .collect()
    }

    fn supported_file_types(&self) -> HashSet<&'static str> {
        ["jpg", "jpeg", "pjpg", "png", "gif", "webp", "tif", "tiff", "bmp"]
            .into_iter()
            .collect()
    }
}

fn reader_for<'a>(bytes: &'a [u8], hint: &str) -> Result<ImageReader<Cursor<&'a [u8]>>, CodecError> {
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode(format!("failed to read image header: {e}")))?;
    if reader.format().is_none() {
        if let Some(format) = ImageFormat::from_extension(hint) {
            reader.set_format(format);
        }
    }
    Ok(reader)
}

fn decode(bytes: &[u8], hint: &str) -> Result<DynamicImage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Decode("empty input".to_string()));
    }
    reader_for(bytes, hint)?
        .decode()
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// The background colour for rotation and padding.
fn background(ops: &AdjustOps, img: &DynamicImage) -> Rgba<u8> {
    match ops.fill {
        Some(FillStyle::Colour(c)) => Rgba(c),
        Some(FillStyle::Transparent) => Rgba([0, 0, 0, 0]),
        Some(FillStyle::Auto) => border_colour(img),
        // White is the default canvas.
        None => Rgba([255, 255, 255, 255]),
    }
}

/// Average of the four corner pixels; what "fill=auto" resolves to.
fn border_colour(img: &DynamicImage) -> Rgba<u8> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Rgba([255, 255, 255, 255]);
    }
    let corners = [
        img.get_pixel(0, 0),
        img.get_pixel(w - 1, 0),
        img.get_pixel(0, h - 1),
        img.get_pixel(w - 1, h - 1),
    ];
    let mut sum = [0u32; 4];
    for c in &corners {
        for i in 0..4 {
            sum[i] += u32::from(c.0[i]);
        }
    }
    Rgba([
        (sum[0] / 4) as u8,
        (sum[1] / 4) as u8,
        (sum[2] / 4) as u8,
        (sum[3] / 4) as u8,
    ])
}

/// Rotate by any angle. Right angles are lossless; anything else maps
/// each output pixel back into the source with bilinear sampling over an
/// expanded canvas.
fn rotate(img: &DynamicImage, degrees: f64, bg: Rgba<u8>) -> DynamicImage {
    let normalised = degrees.rem_euclid(360.0);
    if normalised == 0.0 {
        return img.clone();
    } else if normalised == 90.0 {
        return img.rotate90();
    } else if normalised == 180.0 {
        return img.rotate180();
    } else if normalised == 270.0 {
        return img.rotate270();
    }

    let src = img.to_rgba8();
    let (w, h) = src.dimensions();
    let theta = normalised.to_radians();
    let (sin, cos) = theta.sin_cos();

    let new_w = ((f64::from(w) * cos.abs()) + (f64::from(h) * sin.abs())).ceil() as u32;
    let new_h = ((f64::from(w) * sin.abs()) + (f64::from(h) * cos.abs())).ceil() as u32;

    let cx = f64::from(w) / 2.0;
    let cy = f64::from(h) / 2.0;
    let ncx = f64::from(new_w) / 2.0;
    let ncy = f64::from(new_h) / 2.0;

    let mut out = RgbaImage::from_pixel(new_w, new_h, bg);
    for y in 0..new_h {
        for x in 0..new_w {
            // Inverse mapping: where did this output pixel come from?
            let dx = f64::from(x) + 0.5 - ncx;
            let dy = f64::from(y) + 0.5 - ncy;
            let sx = dx * cos + dy * sin + cx - 0.5;
            let sy = -dx * sin + dy * cos + cy - 0.5;

            if sx >= -0.5 && sy >= -0.5 && sx < f64::from(w) && sy < f64::from(h) {
                out.put_pixel(x, y, bilinear(&src, sx, sy, bg));
            }
        }
    }

    DynamicImage::ImageRgba8(out)
}

fn bilinear(src: &RgbaImage, x: f64, y: f64, bg: Rgba<u8>) -> Rgba<u8> {
    let (w, h) = src.dimensions();
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let sample = |ix: i64, iy: i64| -> [f64; 4] {
        if ix < 0 || iy < 0 || ix >= i64::from(w) || iy >= i64::from(h) {
            [f64::from(bg.0[0]), f64::from(bg.0[1]), f64::from(bg.0[2]), f64::from(bg.0[3])]
        } else {
            let p = src.get_pixel(ix as u32, iy as u32);
            [f64::from(p.0[0]), f64::from(p.0[1]), f64::from(p.0[2]), f64::from(p.0[3])]
        }
    };

    let p00 = sample(x0 as i64, y0 as i64);
    let p10 = sample(x0 as i64 + 1, y0 as i64);
    let p01 = sample(x0 as i64, y0 as i64 + 1);
    let p11 = sample(x0 as i64 + 1, y0 as i64 + 1);

    let mut out = [0u8; 4];
    for i in 0..4 {
        let top = p00[i] * (1.0 - fx) + p10[i] * fx;
        let bottom = p01[i] * (1.0 - fx) + p11[i] * fx;
        out[i] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

/// Apply a fractional crop. With crop-fit and a target box, the window
/// first grows toward the target aspect so no padding is needed.
fn apply_crop(img: &DynamicImage, crop: CropRect, ops: &AdjustOps) -> DynamicImage {
    let (w, h) = img.dimensions();
    let mut rect = crop;

    if ops.crop_fit {
        if let (Some(tw), Some(th)) = (ops.width, ops.height) {
            rect = fit_crop_to_aspect(rect, w, h, f64::from(tw) / f64::from(th));
        }
    }

    let x = (rect.left * f64::from(w)).round() as u32;
    let y = (rect.top * f64::from(h)).round() as u32;
    let cw = (((rect.right - rect.left) * f64::from(w)).round() as u32).max(1);
    let ch = (((rect.bottom - rect.top) * f64::from(h)).round() as u32).max(1);

    let x = x.min(w.saturating_sub(1));
    let y = y.min(h.saturating_sub(1));
    let cw = cw.min(w - x);
    let ch = ch.min(h - y);

    img.crop_imm(x, y, cw, ch)
}

/// Grow a crop window around its centre toward a target aspect ratio,
/// clamped to the image bounds.
fn fit_crop_to_aspect(crop: CropRect, w: u32, h: u32, target_aspect: f64) -> CropRect {
    let px_w = (crop.right - crop.left) * f64::from(w);
    let px_h = (crop.bottom - crop.top) * f64::from(h);
    if px_w <= 0.0 || px_h <= 0.0 {
        return crop;
    }
    let current = px_w / px_h;
    let mut rect = crop;

    if current < target_aspect {
        // Too narrow: widen around the centre.
        let want_w = (px_h * target_aspect).min(f64::from(w));
        let grow = (want_w - px_w) / f64::from(w) / 2.0;
        rect.left = (rect.left - grow).max(0.0);
        rect.right = (rect.right + grow).min(1.0);
    } else if current > target_aspect {
        // Too wide: heighten around the centre.
        let want_h = (px_w / target_aspect).min(f64::from(h));
        let grow = (want_h - px_h) / f64::from(h) / 2.0;
        rect.top = (rect.top - grow).max(0.0);
        rect.bottom = (rect.bottom + grow).min(1.0);
    }

    rect
}

/// Scale to the requested box and, unless size-fit asked for a shrunk
/// canvas, pad to exactly that box with the fill colour, placing the
/// image per the alignment attributes.
fn resize_and_pad(img: &DynamicImage, ops: &AdjustOps) -> Result<DynamicImage, CodecError> {
    let (iw, ih) = img.dimensions();
    if iw == 0 || ih == 0 {
        return Err(CodecError::Decode("zero-sized image".to_string()));
    }

    let (scaled_w, scaled_h, canvas) = match (ops.width, ops.height) {
        (Some(w), Some(h)) => {
            let scale = (f64::from(w) / f64::from(iw)).min(f64::from(h) / f64::from(ih));
            let sw = ((f64::from(iw) * scale).round() as u32).clamp(1, w.max(1));
            let sh = ((f64::from(ih) * scale).round() as u32).clamp(1, h.max(1));
            let canvas = if ops.size_fit { None } else { Some((w, h)) };
            (sw, sh, canvas)
        }
        (Some(w), None) => {
            let scale = f64::from(w) / f64::from(iw);
            (w, ((f64::from(ih) * scale).round() as u32).max(1), None)
        }
        (None, Some(h)) => {
            let scale = f64::from(h) / f64::from(ih);
            (((f64::from(iw) * scale).round() as u32).max(1), h, None)
        }
        (None, None) => (iw, ih, None),
    };

    let scaled = if (scaled_w, scaled_h) == (iw, ih) {
        img.clone()
    } else {
        fast_resize(img, scaled_w, scaled_h)?
    };

    let Some((cw, ch)) = canvas else {
        return Ok(scaled);
    };
    if (cw, ch) == (scaled_w, scaled_h) {
        return Ok(scaled);
    }

    let bg = background(ops, img);
    let mut out = RgbaImage::from_pixel(cw, ch, bg);
    let x = place(ops.align_h, cw, scaled_w);
    let y = place(ops.align_v, ch, scaled_h);
    image::imageops::overlay(&mut out, &scaled.to_rgba8(), i64::from(x), i64::from(y));
    Ok(DynamicImage::ImageRgba8(out))
}

/// Position one dimension of the image on its canvas. The edge letter
/// picks which image edge lands at the fractional canvas position.
fn place(align: Option<Align>, canvas: u32, size: u32) -> u32 {
    let free = f64::from(canvas.saturating_sub(size));
    let pos = match align {
        None => free / 2.0,
        Some(a) => {
            let anchor = a.pos * f64::from(canvas);
            match a.edge {
                'L' | 'T' => anchor,
                'R' | 'B' => anchor - f64::from(size),
                _ => anchor - f64::from(size) / 2.0,
            }
        }
    };
    pos.round().clamp(0.0, free) as u32
}

/// SIMD Lanczos3 resize, with the plain resizer as a silent fallback.
fn fast_resize(img: &DynamicImage, dst_w: u32, dst_h: u32) -> Result<DynamicImage, CodecError> {
    let rgba = img.to_rgba8();
    let (src_w, src_h) = rgba.dimensions();

    let fir_result = (|| -> Result<DynamicImage, String> {
        let src_image =
            fir::images::Image::from_vec_u8(src_w, src_h, rgba.as_raw().clone(), PixelType::U8x4)
                .map_err(|e| format!("fir source image error: {e:?}"))?;

        let mut dst_image = fir::images::Image::new(dst_w, dst_h, PixelType::U8x4);

        let mut resizer = fir::Resizer::new();
        let options =
            ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3));
        resizer
            .resize(&src_image, &mut dst_image, &options)
            .map_err(|e| format!("fir resize error: {e:?}"))?;

        let out = RgbaImage::from_raw(dst_w, dst_h, dst_image.into_vec())
            .ok_or("failed to build image from resized data")?;
        Ok(DynamicImage::ImageRgba8(out))
    })();

    match fir_result {
        Ok(out) => Ok(out),
        Err(e) => {
            debug!(error = %e, "fast resize failed, using plain resizer");
            Ok(img.resize_exact(dst_w, dst_h, image::imageops::FilterType::Lanczos3))
        }
    }
}

/// Composite an overlay image, scaled to a fraction of the base width,
/// at the requested anchor with the requested opacity.
fn apply_overlay(
    base: DynamicImage,
    overlay: &OverlayOp,
    hint: &str,
) -> Result<DynamicImage, CodecError> {
    let decoded = decode(&overlay.bytes, hint)
        .map_err(|e| CodecError::Decode(format!("overlay: {e}")))?;

    let (bw, bh) = base.dimensions();
    let fraction = overlay.size.unwrap_or(1.0).clamp(0.0, 1.0);
    let target_w = ((f64::from(bw) * fraction).round() as u32).clamp(1, bw);
    let scale = f64::from(target_w) / f64::from(decoded.width().max(1));
    let target_h = ((f64::from(decoded.height()) * scale).round() as u32).clamp(1, bh);

    let scaled = if (target_w, target_h) == decoded.dimensions() {
        decoded
    } else {
        fast_resize(&decoded, target_w, target_h)?
    };

    let mut top = scaled.to_rgba8();
    if let Some(opacity) = overlay.opacity {
        let opacity = opacity.clamp(0.0, 1.0);
        for pixel in top.pixels_mut() {
            pixel.0[3] = (f64::from(pixel.0[3]) * opacity).round() as u8;
        }
    }

    let (x, y) = overlay_position(overlay.pos.as_deref(), bw, bh, target_w, target_h);

    let mut out = base.to_rgba8();
    image::imageops::overlay(&mut out, &top, x, y);
    Ok(DynamicImage::ImageRgba8(out))
}

fn overlay_position(pos: Option<&str>, bw: u32, bh: u32, ow: u32, oh: u32) -> (i64, i64) {
    let free_x = i64::from(bw.saturating_sub(ow));
    let free_y = i64::from(bh.saturating_sub(oh));
    let (fx, fy) = match pos.unwrap_or("c") {
        "nw" => (0, 0),
        "n" => (1, 0),
        "ne" => (2, 0),
        "w" => (0, 1),
        "e" => (2, 1),
        "sw" => (0, 2),
        "s" => (1, 2),
        "se" => (2, 2),
        _ => (1, 1),
    };
    (free_x * fx / 2, free_y * fy / 2)
}

/// Extract one tile of a square grid; edge tiles absorb the remainder.
fn extract_tile(img: &DynamicImage, tile: TileSpec) -> DynamicImage {
    let side = tile.side().max(1);
    let (w, h) = img.dimensions();
    let tile_w = (w / side).max(1);
    let tile_h = (h / side).max(1);

    let idx = tile.index.saturating_sub(1);
    let col = idx % side;
    let row = idx / side;

    let x = col * tile_w;
    let y = row * tile_h;
    let cw = if col == side - 1 { w - x } else { tile_w };
    let ch = if row == side - 1 { h - y } else { tile_h };

    img.crop_imm(x, y, cw.max(1), ch.max(1))
}

/// Positive values unsharpen, negative values blur; the magnitude maps
/// onto the filter sigma.
fn apply_sharpen(img: &DynamicImage, amount: i32) -> DynamicImage {
    if amount > 0 {
        let sigma = (f32::from(amount as i16) / 100.0).clamp(0.1, 5.0);
        img.unsharpen(sigma, 1)
    } else {
        let sigma = (f32::from((-amount) as i16) / 100.0).clamp(0.1, 5.0);
        img.blur(sigma)
    }
}

/// Formats whose encoders accept no alpha channel.
fn needs_flatten(format: &str) -> bool {
    matches!(format, "jpg" | "jpeg" | "pjpg" | "bmp")
}

fn flatten(img: &DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => img.clone(),
        DynamicImage::ImageLumaA8(_) => DynamicImage::ImageLuma8(img.to_luma8()),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

fn encode(
    img: &DynamicImage,
    format: &str,
    quality: u8,
    icc: Option<&[u8]>,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();

    match format {
        "jpg" | "jpeg" | "pjpg" | "pjpeg" => {
            let flat = flatten(img);
            let mut enc = JpegEncoder::new_with_quality(&mut buf, quality);
            if let Some(icc) = icc {
                if enc.set_icc_profile(icc.to_vec()).is_err() {
                    debug!("jpeg encoder rejected ICC profile");
                }
            }
            flat.write_with_encoder(enc)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
        "png" => {
            let mut enc = PngEncoder::new(&mut buf);
            if let Some(icc) = icc {
                if enc.set_icc_profile(icc.to_vec()).is_err() {
                    debug!("png encoder rejected ICC profile");
                }
            }
            img.write_with_encoder(enc)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
        "webp" => {
            // The lossless encoder takes RGB/RGBA only.
            let source = match img {
                DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => img.clone(),
                other => DynamicImage::ImageRgba8(other.to_rgba8()),
            };
            let enc = WebPEncoder::new_lossless(&mut buf);
            source
                .write_with_encoder(enc)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
        other => {
            let fmt = ImageFormat::from_extension(other)
                .ok_or(CodecError::Unsupported("format"))?;
            let source = if needs_flatten(other) { flatten(img) } else { img.clone() };
            let mut cursor = Cursor::new(&mut buf);
            source
                .write_to(&mut cursor, fmt)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
    }

    Ok(buf)
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use image::Rgb;

    fn test_png(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(image::ImageBuffer::from_fn(w, h, |x, _| {
            if x < w / 2 {
                Rgb([200u8, 30, 30])
            } else {
                Rgb([30, 30, 200])
            }
        }));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    fn dims_of(bytes: &[u8]) -> (u32, u32) {
        RasterCodec::new().dimensions(bytes, "png").unwrap()
    }

    #[test]
    fn resize_to_exact_box() {
        let codec = RasterCodec::new();
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            width: Some(100),
            height: Some(50),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(400, 200), "png", &ops).unwrap();
        assert_eq!(dims_of(&out), (100, 50));
    }

    #[test]
    fn resize_pads_mismatched_aspect() {
        let codec = RasterCodec::new();
        // 400x200 into a 100x100 box: scaled to 100x50, padded to 100x100.
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            width: Some(100),
            height: Some(100),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(400, 200), "png", &ops).unwrap();
        assert_eq!(dims_of(&out), (100, 100));

        // size-fit shrinks the canvas instead of padding.
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            width: Some(100),
            height: Some(100),
            size_fit: true,
            ..Default::default()
        };
        let out = codec.adjust(&test_png(400, 200), "png", &ops).unwrap();
        assert_eq!(dims_of(&out), (100, 50));
    }

    #[test]
    fn width_only_preserves_aspect() {
        let codec = RasterCodec::new();
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            width: Some(200),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(400, 200), "png", &ops).unwrap();
        assert_eq!(dims_of(&out), (200, 100));
    }

    #[test]
    fn right_angle_rotation_swaps_dimensions() {
        let codec = RasterCodec::new();
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            rotation: Some(90.0),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(400, 200), "png", &ops).unwrap();
        assert_eq!(dims_of(&out), (200, 400));
    }

    #[test]
    fn arbitrary_rotation_expands_canvas() {
        let codec = RasterCodec::new();
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            rotation: Some(45.0),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(100, 100), "png", &ops).unwrap();
        let (w, h) = dims_of(&out);
        // 100x100 at 45 degrees needs a ~142x142 canvas.
        assert!(w >= 141 && w <= 143, "width {w}");
        assert!(h >= 141 && h <= 143, "height {h}");
    }

    #[test]
    fn crop_selects_fraction() {
        let codec = RasterCodec::new();
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            crop: Some(CropRect {
                top: 0.0,
                left: 0.0,
                bottom: 0.5,
                right: 0.5,
            }),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(400, 200), "png", &ops).unwrap();
        assert_eq!(dims_of(&out), (200, 100));
    }

    #[test]
    fn tiles_cover_the_image() {
        let codec = RasterCodec::new();
        // 2x2 grid of a 100x100 image: each tile 50x50.
        for index in 1..=4 {
            let ops = AdjustOps {
                format: "png".into(),
                quality: 80,
                tile: Some(TileSpec { index, grid: 4 }),
                ..Default::default()
            };
            let out = codec.adjust(&test_png(100, 100), "png", &ops).unwrap();
            assert_eq!(dims_of(&out), (50, 50), "tile {index}");
        }
    }

    #[test]
    fn tile_edges_absorb_remainder() {
        let codec = RasterCodec::new();
        // 101 wide: column 0 gets 50, last column gets 51.
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            tile: Some(TileSpec { index: 4, grid: 4 }),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(101, 101), "png", &ops).unwrap();
        assert_eq!(dims_of(&out), (51, 51));
    }

    #[test]
    fn format_conversion_and_grayscale() {
        let codec = RasterCodec::new();
        let ops = AdjustOps {
            format: "jpg".into(),
            quality: 80,
            colorspace: Some(Colorspace::Gray),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(50, 50), "png", &ops).unwrap();
        // JPEG magic.
        assert_eq!(&out[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn empty_input_is_a_decode_error() {
        let codec = RasterCodec::new();
        let ops = AdjustOps {
            format: "jpg".into(),
            quality: 80,
            ..Default::default()
        };
        let err = codec.adjust(&[], "jpg", &ops).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn garbage_input_is_a_decode_error() {
        let codec = RasterCodec::new();
        let err = codec
            .dimensions(b"this is not an image at all", "jpg")
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn overlay_composites() {
        let codec = RasterCodec::new();
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            overlay: Some(OverlayOp {
                bytes: test_png(20, 20),
                pos: Some("se".into()),
                size: Some(0.25),
                opacity: Some(0.5),
            }),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(100, 100), "png", &ops).unwrap();
        assert_eq!(dims_of(&out), (100, 100));
    }

    #[test]
    fn capability_set_names_the_hard_features() {
        let supported = RasterCodec::new().supported_operations();
        assert!(supported.contains("tile"));
        assert!(supported.contains(caps::ROTATION_ANY));
        assert!(supported.contains("overlay_src"));
        assert!(!supported.contains(caps::PDF));
        assert!(!supported.contains("page"));
    }

    #[test]
    fn alignment_places_the_image() {
        // Left-aligned at 0: image starts at x=0.
        assert_eq!(place(Some(Align { edge: 'L', pos: 0.0 }), 100, 50), 0);
        // Right edge at canvas end.
        assert_eq!(place(Some(Align { edge: 'R', pos: 1.0 }), 100, 50), 50);
        // Default centres.
        assert_eq!(place(None, 100, 50), 25);
    }
}
