//! Fallback codec.
//!
//! A minimal back end over the `image` crate alone: resize, flip,
//! right-angle rotation, crop and tiles. It exists so the server keeps
//! serving basic derivatives when the full raster pipeline is disabled,
//! and as the reference for what capability-driven downgrading looks
//! like: everything it cannot do is absent from its capability set, and
//! the manager turns those features off at startup.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat, ImageReader};

use crate::spec::{CropRect, Flip, TileSpec};

use super::{caps, AdjustOps, Codec, CodecError, ProfileProperty};

/// Minimal codec implementation.
#[derive(Debug, Default)]
pub struct FallbackCodec;

impl FallbackCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for FallbackCodec {
    fn adjust(&self, bytes: &[u8], hint: &str, ops: &AdjustOps) -> Result<Vec<u8>, CodecError> {
        if ops.overlay.is_some() {
            return Err(CodecError::Unsupported("overlay_src"));
        }
        if ops.icc.is_some() {
            return Err(CodecError::Unsupported("icc_profile"));
        }
        if ops.sharpen.is_some() {
            return Err(CodecError::Unsupported("sharpen"));
        }
        if ops.page.is_some_and(|p| p > 1) {
            return Err(CodecError::Unsupported("page"));
        }

        let mut img = decode(bytes, hint)?;

        if let Some(flip) = ops.flip {
            img = match flip {
                Flip::H => img.fliph(),
                Flip::V => img.flipv(),
            };
        }

        if let Some(degrees) = ops.rotation {
            img = rotate_right_angle(&img, degrees)?;
        }

        if let Some(crop) = ops.crop {
            img = apply_crop(&img, crop);
        }

        if ops.width.is_some() || ops.height.is_some() {
            img = resize(&img, ops.width, ops.height);
        }

        if let Some(tile) = ops.tile {
            img = extract_tile(&img, tile);
        }

        if ops.colorspace == Some(crate::spec::Colorspace::Gray) {
            img = DynamicImage::ImageLuma8(img.to_luma8());
        }

        encode(&img, &ops.format, ops.quality)
    }

    fn dimensions(&self, bytes: &[u8], hint: &str) -> Result<(u32, u32), CodecError> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        if reader.format().is_none() {
            if let Some(format) = ImageFormat::from_extension(hint) {
                reader.set_format(format);
            }
        }
        reader
            .into_dimensions()
            .map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn profile_data(&self, _bytes: &[u8], _hint: &str) -> Result<Vec<ProfileProperty>, CodecError> {
        Ok(Vec::new())
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
            "flip",
            caps::ROTATION,
            "crop",
            "colorspace",
            "strip",
            "tile",
        ]
        .into_iter()
        .collect()
    }

    fn supported_file_types(&self) -> HashSet<&'static str> {
        ["jpg", "jpeg", "png", "gif", "bmp"].into_iter().collect()
    }
}

fn decode(bytes: &[u8], hint: &str) -> Result<DynamicImage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Decode("empty input".to_string()));
    }
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    if reader.format().is_none() {
        if let Some(format) = ImageFormat::from_extension(hint) {
            reader.set_format(format);
        }
    }
    reader.decode().map_err(|e| CodecError::Decode(e.to_string()))
}

fn rotate_right_angle(img: &DynamicImage, degrees: f64) -> Result<DynamicImage, CodecError> {
    let normalised = degrees.rem_euclid(360.0);
    if normalised == 0.0 {
        Ok(img.clone())
    } else if normalised == 90.0 {
        Ok(img.rotate90())
    } else if normalised == 180.0 {
        Ok(img.rotate180())
    } else if normalised == 270.0 {
        Ok(img.rotate270())
    } else {
        Err(CodecError::Unsupported(caps::ROTATION_ANY))
    }
}

fn apply_crop(img: &DynamicImage, crop: CropRect) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    let x = ((crop.left * f64::from(w)).round() as u32).min(w.saturating_sub(1));
    let y = ((crop.top * f64::from(h)).round() as u32).min(h.saturating_sub(1));
    let cw = ((((crop.right - crop.left) * f64::from(w)).round() as u32).max(1)).min(w - x);
    let ch = ((((crop.bottom - crop.top) * f64::from(h)).round() as u32).max(1)).min(h - y);
    img.crop_imm(x, y, cw, ch)
}

fn resize(img: &DynamicImage, width: Option<u32>, height: Option<u32>) -> DynamicImage {
    let (iw, ih) = (img.width().max(1), img.height().max(1));
    let (w, h) = match (width, height) {
        (Some(w), Some(h)) => {
            let scale = (f64::from(w) / f64::from(iw)).min(f64::from(h) / f64::from(ih));
            (
                ((f64::from(iw) * scale).round() as u32).max(1),
                ((f64::from(ih) * scale).round() as u32).max(1),
            )
        }
        (Some(w), None) => {
            let scale = f64::from(w) / f64::from(iw);
            (w, ((f64::from(ih) * scale).round() as u32).max(1))
        }
        (None, Some(h)) => {
            let scale = f64::from(h) / f64::from(ih);
            (((f64::from(iw) * scale).round() as u32).max(1), h)
        }
        (None, None) => (iw, ih),
    };
    if (w, h) == (iw, ih) {
        img.clone()
    } else {
        img.resize_exact(w, h, image::imageops::FilterType::Lanczos3)
    }
}

fn extract_tile(img: &DynamicImage, tile: TileSpec) -> DynamicImage {
    let side = tile.side().max(1);
    let (w, h) = (img.width(), img.height());
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

fn encode(img: &DynamicImage, format: &str, quality: u8) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    match format {
        "jpg" | "jpeg" | "pjpg" | "pjpeg" => {
            let flat = match img {
                DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => img.clone(),
                other => DynamicImage::ImageRgb8(other.to_rgb8()),
            };
            let enc = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
            flat.write_with_encoder(enc)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
        other => {
            let fmt =
                ImageFormat::from_extension(other).ok_or(CodecError::Unsupported("format"))?;
            let mut cursor = Cursor::new(&mut buf);
            img.write_to(&mut cursor, fmt)
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
        let img = DynamicImage::ImageRgb8(image::ImageBuffer::from_pixel(w, h, Rgb([90u8, 90, 90])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn basic_resize_works() {
        let codec = FallbackCodec::new();
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            width: Some(40),
            height: Some(20),
            ..Default::default()
        };
        let out = codec.adjust(&test_png(80, 40), "png", &ops).unwrap();
        assert_eq!(codec.dimensions(&out, "png").unwrap(), (40, 20));
    }

    #[test]
    fn arbitrary_rotation_is_unsupported() {
        let codec = FallbackCodec::new();
        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            rotation: Some(45.0),
            ..Default::default()
        };
        let err = codec.adjust(&test_png(10, 10), "png", &ops).unwrap_err();
        assert!(matches!(err, CodecError::Unsupported(_)));

        let ops = AdjustOps {
            format: "png".into(),
            quality: 80,
            rotation: Some(-90.0),
            ..Default::default()
        };
        assert!(codec.adjust(&test_png(10, 10), "png", &ops).is_ok());
    }

    #[test]
    fn capability_set_is_smaller_than_raster() {
        let fallback = FallbackCodec::new().supported_operations();
        let raster = super::super::RasterCodec::new().supported_operations();
        assert!(fallback.is_subset(&raster));
        assert!(!fallback.contains("overlay_src"));
        assert!(!fallback.contains(caps::ROTATION_ANY));
    }
}
