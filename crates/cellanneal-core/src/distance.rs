//! Exact Euclidean distance transform and the edge-emphasis weight map.

use crate::image::{Image, ImageError};

/// Threshold separating cell pixels from background in the real image.
pub const FOREGROUND_THRESHOLD: f64 = 0.5;

// Lower envelope of parabolas (Felzenszwalb & Huttenlocher), in place over `f`.
// Infinite samples never contribute a parabola.
fn squared_distance_1d(f: &mut [f64], scratch: &mut Scratch) {
    let n = f.len();
    scratch.reset(n);
    let Scratch { v, z, d } = scratch;
    let mut hull: Option<usize> = None;
    for q in 0..n {
        if !f[q].is_finite() {
            continue;
        }
        let anchor = f[q] + (q * q) as f64;
        let mut top = hull;
        loop {
            match top {
                None => {
                    v[0] = q;
                    z[0] = f64::NEG_INFINITY;
                    z[1] = f64::INFINITY;
                    hull = Some(0);
                    break;
                }
                Some(k) => {
                    let p = v[k];
                    let s = (anchor - (f[p] + (p * p) as f64)) / (2.0 * (q - p) as f64);
                    if s <= z[k] {
                        top = k.checked_sub(1);
                        continue;
                    }
                    v[k + 1] = q;
                    z[k + 1] = s;
                    z[k + 2] = f64::INFINITY;
                    hull = Some(k + 1);
                    break;
                }
            }
        }
    }
    if hull.is_none() {
        return;
    }
    let mut k = 0usize;
    for (q, slot) in d.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let offset = q as f64 - v[k] as f64;
        *slot = offset * offset + f[v[k]];
    }
    f.copy_from_slice(d);
}

#[derive(Default)]
struct Scratch {
    v: Vec<usize>,
    z: Vec<f64>,
    d: Vec<f64>,
}

impl Scratch {
    fn reset(&mut self, n: usize) {
        self.v.clear();
        self.v.resize(n, 0);
        self.z.clear();
        self.z.resize(n + 2, 0.0);
        self.d.clear();
        self.d.resize(n, 0.0);
    }
}

/// Distance from every pixel to the nearest pixel where `mask` is `false`.
///
/// Pixels already `false` get zero. When the mask has no `false` pixel at all
/// every distance is infinite.
pub fn euclidean_distance(mask: &Image<bool>) -> Result<Image<f64>, ImageError> {
    let (width, height) = (mask.width(), mask.height());
    let mut grid: Vec<f64> = mask
        .pixels()
        .iter()
        .map(|&inside| if inside { f64::INFINITY } else { 0.0 })
        .collect();
    let mut scratch = Scratch::default();

    let mut column = vec![0.0; height];
    for x in 0..width {
        for y in 0..height {
            column[y] = grid[y * width + x];
        }
        squared_distance_1d(&mut column, &mut scratch);
        for y in 0..height {
            grid[y * width + x] = column[y];
        }
    }
    for row in grid.chunks_mut(width) {
        squared_distance_1d(row, &mut scratch);
    }
    for value in &mut grid {
        *value = value.sqrt();
    }
    Image::from_vec(width, height, grid)
}

/// Per-pixel residual weights growing with distance from cell pixels.
///
/// `weight = 1 + distance / (divisor * pixels_per_micron)`, where distance is
/// measured from background pixels (`real < 0.5`) to the nearest cell pixel.
/// An image without any cell pixel gets uniform weights.
pub fn distance_weights(
    real: &Image<f64>,
    divisor: f64,
    pixels_per_micron: f64,
) -> Result<Image<f64>, ImageError> {
    let mask = Image::from_vec(
        real.width(),
        real.height(),
        real.pixels()
            .iter()
            .map(|&value| value < FOREGROUND_THRESHOLD)
            .collect(),
    )?;
    let mut weights = euclidean_distance(&mask)?;
    let scale = divisor * pixels_per_micron;
    for weight in weights.pixels_mut() {
        *weight = if weight.is_finite() && scale > 0.0 {
            1.0 + *weight / scale
        } else {
            1.0
        };
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(mask: &Image<bool>) -> Vec<f64> {
        let mut out = Vec::new();
        for y in 0..mask.height() as i64 {
            for x in 0..mask.width() as i64 {
                let mut best = f64::INFINITY;
                for yy in 0..mask.height() as i64 {
                    for xx in 0..mask.width() as i64 {
                        if mask.get(xx, yy) == Some(false) {
                            let d = (((x - xx).pow(2) + (y - yy).pow(2)) as f64).sqrt();
                            best = best.min(d);
                        }
                    }
                }
                out.push(best);
            }
        }
        out
    }

    #[test]
    fn matches_brute_force() {
        let pattern = [
            1, 1, 1, 1, 1, 1, 1, //
            1, 0, 1, 1, 1, 1, 1, //
            1, 1, 1, 1, 1, 1, 1, //
            1, 1, 1, 1, 1, 0, 1, //
            1, 1, 1, 1, 1, 1, 1, //
        ];
        let mask =
            Image::from_vec(7, 5, pattern.iter().map(|&v| v == 1).collect()).expect("mask");
        let fast = euclidean_distance(&mask).expect("edt");
        for (a, b) in fast.pixels().iter().zip(brute_force(&mask)) {
            assert!((a - b).abs() < 1e-9, "{a} != {b}");
        }
    }

    #[test]
    fn all_background_means_unit_weights() {
        let real = Image::new(6, 4, 0.0).expect("real");
        let weights = distance_weights(&real, 2.0, 1.0).expect("weights");
        assert!(weights.pixels().iter().all(|&w| (w - 1.0).abs() < 1e-12));
    }

    #[test]
    fn weights_grow_away_from_cells() {
        let mut real = Image::new(9, 1, 0.0).expect("real");
        *real.get_mut(0, 0).expect("pixel") = 1.0;
        let weights = distance_weights(&real, 2.0, 2.0).expect("weights");
        assert!((weights.get(0, 0).expect("w") - 1.0).abs() < 1e-12);
        assert!((weights.get(8, 0).expect("w") - 3.0).abs() < 1e-12);
    }
}
