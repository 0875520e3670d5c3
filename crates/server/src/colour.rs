//! Fill-colour parsing shared by spec validation and the raster codec.

/// An RGBA colour value.
pub type Rgba = [u8; 4];

/// Named colours accepted in `fill` values.
const NAMED: &[(&str, Rgba)] = &[
    ("white", [255, 255, 255, 255]),
    ("black", [0, 0, 0, 255]),
    ("red", [255, 0, 0, 255]),
    ("green", [0, 128, 0, 255]),
    ("blue", [0, 0, 255, 255]),
    ("yellow", [255, 255, 0, 255]),
    ("cyan", [0, 255, 255, 255]),
    ("magenta", [255, 0, 255, 255]),
    ("gray", [128, 128, 128, 255]),
    ("silver", [192, 192, 192, 255]),
    ("maroon", [128, 0, 0, 255]),
    ("olive", [128, 128, 0, 255]),
    ("purple", [128, 0, 128, 255]),
    ("teal", [0, 128, 128, 255]),
    ("navy", [0, 0, 128, 255]),
    ("orange", [255, 165, 0, 255]),
    ("brown", [165, 42, 42, 255]),
    ("pink", [255, 192, 203, 255]),
];

/// Parse a colour string: a name, `#rgb`, `#rrggbb`, or bare hex digits.
///
/// `none` and `transparent` yield fully transparent black. `auto` is not
/// a colour and returns None; callers handle it before parsing.
pub fn parse_colour(value: &str) -> Option<Rgba> {
    let v = value.trim().to_lowercase();

    if v == "none" || v == "transparent" {
        return Some([0, 0, 0, 0]);
    }

    let name = if v == "grey" { "gray" } else { v.as_str() };
    if let Some((_, rgba)) = NAMED.iter().find(|(n, _)| *n == name) {
        return Some(*rgba);
    }

    let hex = v.strip_prefix('#').unwrap_or(&v);
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    match hex.len() {
        3 => {
            let mut out = [0u8, 0, 0, 255];
            for (i, c) in hex.chars().enumerate() {
                let d = c.to_digit(16)? as u8;
                out[i] = d * 17;
            }
            Some(out)
        }
        6 => {
            let bytes = u32::from_str_radix(hex, 16).ok()?;
            Some([
                (bytes >> 16) as u8,
                (bytes >> 8) as u8,
                bytes as u8,
                255,
            ])
        }
        _ => None,
    }
}

/// Whether a colour string denotes opaque white (the default fill).
pub fn is_white(value: &str) -> bool {
    parse_colour(value) == Some([255, 255, 255, 255])
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_hex() {
        assert_eq!(parse_colour("white"), Some([255, 255, 255, 255]));
        assert_eq!(parse_colour("GREY"), Some([128, 128, 128, 255]));
        assert_eq!(parse_colour("#fff"), Some([255, 255, 255, 255]));
        assert_eq!(parse_colour("#ff8000"), Some([255, 128, 0, 255]));
        assert_eq!(parse_colour("ff8000"), Some([255, 128, 0, 255]));
        assert_eq!(parse_colour("none"), Some([0, 0, 0, 0]));
        assert_eq!(parse_colour("auto"), None);
        assert_eq!(parse_colour("nonsense"), None);
    }

    #[test]
    fn white_detection() {
        assert!(is_white("white"));
        assert!(is_white("#ffffff"));
        assert!(is_white("FFFFFF"));
        assert!(!is_white("black"));
        assert!(!is_white("none"));
    }
}
