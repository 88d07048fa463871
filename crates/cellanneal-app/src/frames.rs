//! Input image discovery and PNG conversion.

use anyhow::{Context, Result, bail};
use cellanneal_core::Image;
use std::path::{Path, PathBuf};

/// Expands a printf-style frame pattern such as `frames/t%03d.png`.
///
/// Only a single `%d` conversion with an optional zero-padded width is
/// recognized; `%%` produces a literal percent sign.
pub fn expand_pattern(pattern: &str, index: usize) -> Result<String> {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars().peekable();
    let mut conversions = 0;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let zero = chars.next_if_eq(&'0').is_some();
        let mut width = 0usize;
        while let Some(digit) = chars.next_if(char::is_ascii_digit) {
            width = width * 10 + digit.to_digit(10).map_or(0, |d| d as usize);
        }
        if chars.next() != Some('d') {
            bail!("unsupported conversion in frame pattern {pattern:?}");
        }
        conversions += 1;
        if zero {
            out.push_str(&format!("{index:0width$}"));
        } else {
            out.push_str(&format!("{index:width$}"));
        }
    }
    if conversions != 1 {
        bail!("frame pattern {pattern:?} must contain exactly one %d");
    }
    Ok(out)
}

/// Lists the frames matched by `pattern` from `first` up to `last` inclusive.
///
/// Without `last`, frames are collected until the first missing file. With
/// `last`, every frame in the range must exist.
pub fn discover_frames(pattern: &str, first: usize, last: Option<usize>) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut index = first;
    loop {
        if last.is_some_and(|last| index > last) {
            break;
        }
        let path = PathBuf::from(expand_pattern(pattern, index)?);
        if !path.is_file() {
            if last.is_some() {
                bail!("input frame {} not found", path.display());
            }
            break;
        }
        paths.push(path);
        index += 1;
    }
    if paths.is_empty() {
        bail!("no input frames match {pattern:?} starting at {first}");
    }
    Ok(paths)
}

/// Loads an image as grayscale intensities in `[0, 1]`.
pub fn load_gray(path: &Path) -> Result<Image<f64>> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_luma32f();
    let (width, height) = decoded.dimensions();
    let pixels = decoded
        .into_raw()
        .into_iter()
        .map(|value| f64::from(value).clamp(0.0, 1.0))
        .collect();
    Image::from_vec(width as usize, height as usize, pixels)
        .with_context(|| format!("{} has no pixels", path.display()))
}

/// Writes intensities as an 8-bit grayscale PNG, clamping to `[0, 1]`.
pub fn save_gray(image: &Image<f64>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let bytes: Vec<u8> = image
        .pixels()
        .iter()
        .map(|value| (value.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    let width = u32::try_from(image.width()).context("image too wide")?;
    let height = u32::try_from(image.height()).context("image too tall")?;
    let buffer = image::GrayImage::from_raw(width, height, bytes)
        .context("pixel buffer does not match image size")?;
    buffer
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_expansion_handles_padding() {
        assert_eq!(expand_pattern("t%03d.png", 7).expect("pattern"), "t007.png");
        assert_eq!(expand_pattern("t%d.png", 12).expect("pattern"), "t12.png");
        assert_eq!(expand_pattern("100%%/%02d", 3).expect("pattern"), "100%/03");
        assert!(expand_pattern("plain.png", 0).is_err());
        assert!(expand_pattern("%s.png", 0).is_err());
        assert!(expand_pattern("%d_%d.png", 0).is_err());
    }

    #[test]
    fn discovery_stops_at_gap_or_requires_full_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let frame = Image::new(4, 3, 0.5).expect("image");
        for i in [0, 1, 3] {
            save_gray(&frame, &dir.path().join(format!("f{i}.png"))).expect("save");
        }
        let pattern = format!("{}/f%d.png", dir.path().display());
        assert_eq!(discover_frames(&pattern, 0, None).expect("frames").len(), 2);
        assert!(discover_frames(&pattern, 0, Some(3)).is_err());
        assert_eq!(discover_frames(&pattern, 3, Some(3)).expect("frames").len(), 1);
    }

    #[test]
    fn png_round_trip_keeps_intensities_to_8_bits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out").join("frame.png");
        let image = Image::from_vec(3, 1, vec![0.0, 0.5, 2.0]).expect("image");
        save_gray(&image, &path).expect("save");
        let loaded = load_gray(&path).expect("load");
        assert_eq!((loaded.width(), loaded.height()), (3, 1));
        let pixels = loaded.pixels();
        assert_eq!(pixels[0], 0.0);
        assert!((pixels[1] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(pixels[2], 1.0);
    }
}
