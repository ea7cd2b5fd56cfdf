// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Multi-resolution pyramid of composite image buffers.
//!
//! All pairs are stacked channel-wise into one fixed and one moving composite
//! per level, so the metric evaluators walk a single cache-friendly buffer.
//! Moving images are brought into the reference grid once, at build time;
//! every later per-level buffer shares the reference geometry of its level.

use crate::error::{RegError, Result};
use crate::img::{Geometry, Image, MAX_DIM};
use crate::kernels::{par_voxel_map, resample_to_geometry};
use crate::utils::Lcg;

/// A fixed/moving pair with the weight of its contribution to the aggregate
/// metric.
#[derive(Debug, Clone)]
pub struct ImagePair {
    pub fixed: Image,
    pub moving: Image,
    pub weight: f32,
}

/// Intensity bounds of one composite channel, frozen at build time so that
/// histogram binning stays constant across iterations.
#[derive(Debug, Clone, Copy)]
pub struct ChannelRange {
    pub fixed: (f32, f32),
    pub moving: (f32, f32),
}

/// Immutable per-level state: composite buffers and derived geometry.
#[derive(Debug)]
pub struct PyramidLevel {
    pub factor: usize,
    pub fixed: Image,
    pub moving: Image,
    pub gradient_mask: Option<Image>,
    pub channel_weights: Vec<f32>,
    pub ranges: Vec<ChannelRange>,
}

impl PyramidLevel {
    pub fn reference_space(&self) -> &Geometry {
        self.fixed.geometry()
    }
}

/// Resolution levels ordered coarsest to finest.
#[derive(Debug)]
pub struct Pyramid {
    levels: Vec<PyramidLevel>,
    moving_geometry: Geometry,
}

fn block_average(img: &Image, factor: usize) -> Image {
    if factor == 1 {
        return img.clone();
    }
    let fine_geom = img.geometry().clone();
    let coarse_geom = fine_geom.downsample(factor);
    let d = fine_geom.ndim();
    let k = img.channels();
    let fine_size = fine_geom.size().to_vec();
    let fine_strides = fine_geom.strides();

    let mut out = Image::zeros(coarse_geom.clone(), k);
    par_voxel_map(&mut out, |vi, voxel| {
        let mut cj = [0usize; MAX_DIM];
        coarse_geom.delinearize(vi, &mut cj[..d]);
        let mut lo = [0usize; MAX_DIM];
        let mut hi = [0usize; MAX_DIM];
        for a in 0..d {
            lo[a] = cj[a] * factor;
            hi[a] = (lo[a] + factor).min(fine_size[a]);
        }
        let mut acc = vec![0.0f64; k];
        let mut count = 0usize;
        let mut cur = lo;
        loop {
            let mut fvi = 0;
            for a in 0..d {
                fvi += cur[a] * fine_strides[a];
            }
            let values = img.voxel(fvi);
            for c in 0..k {
                acc[c] += values[c] as f64;
            }
            count += 1;
            // Odometer over the block.
            let mut a = 0;
            loop {
                cur[a] += 1;
                if cur[a] < hi[a] {
                    break;
                }
                cur[a] = lo[a];
                a += 1;
                if a == d {
                    break;
                }
            }
            if a == d {
                break;
            }
        }
        for c in 0..k {
            voxel[c] = (acc[c] / count as f64) as f32;
        }
    });
    out
}

fn stack_channels(images: &[&Image]) -> Image {
    let geom = images[0].geometry().clone();
    let total: usize = images.iter().map(|i| i.channels()).sum();
    let mut out = Image::zeros(geom, total);
    let n = out.voxel_count();
    for vi in 0..n {
        let voxel = out.voxel_mut(vi);
        let mut c = 0;
        for img in images {
            let values = img.voxel(vi);
            voxel[c..c + values.len()].copy_from_slice(values);
            c += values.len();
        }
    }
    out
}

fn add_noise(img: &mut Image, fraction: f64, rng: &mut Lcg) {
    let k = img.channels();
    let mut amplitudes = Vec::with_capacity(k);
    for c in 0..k {
        let (lo, hi) = img.channel_range(c);
        amplitudes.push(fraction * (hi - lo) as f64);
    }
    let n = img.voxel_count();
    for vi in 0..n {
        let voxel = img.voxel_mut(vi);
        for c in 0..k {
            voxel[c] += rng.next_symmetric(amplitudes[c]) as f32;
        }
    }
}

fn channel_ranges(fixed: &Image, moving: &Image) -> Vec<ChannelRange> {
    (0..fixed.channels())
        .map(|c| ChannelRange {
            fixed: fixed.channel_range(c),
            moving: moving.channel_range(c),
        })
        .collect()
}

impl Pyramid {
    /// Build `levels` resolution levels from the input pairs. The default
    /// factor schedule is powers of two ending at 1 for the finest level.
    /// A positive `noise` fraction injects deterministic per-voxel noise into
    /// the composites (NCC variance stabilization).
    pub fn build(
        pairs: Vec<ImagePair>,
        levels: usize,
        factors: Option<Vec<usize>>,
        noise: f64,
        gradient_mask: Option<&Image>,
    ) -> Result<Pyramid> {
        if pairs.is_empty() {
            return Err(RegError::Input("no image pairs".into()));
        }
        if levels == 0 {
            return Err(RegError::Config("empty iteration schedule".into()));
        }
        let reference = pairs[0].fixed.geometry().clone();
        let moving_geometry = pairs[0].moving.geometry().clone();
        let d = reference.ndim();

        let factors = match factors {
            Some(f) => {
                if f.len() != levels || f.iter().any(|&x| x == 0) {
                    return Err(RegError::Config("bad downsampling factor schedule".into()));
                }
                f
            }
            None => (0..levels).map(|l| 1usize << (levels - 1 - l)).collect(),
        };

        // Bring every buffer onto the reference grid, then stack.
        let mut fixed_refs = Vec::with_capacity(pairs.len());
        let mut moving_refs = Vec::with_capacity(pairs.len());
        let mut channel_weights = Vec::new();
        for pair in pairs.iter() {
            if pair.fixed.geometry().ndim() != d || pair.moving.geometry().ndim() != d {
                return Err(RegError::Input("mixed dimensionality across pairs".into()));
            }
            if pair.fixed.channels() != pair.moving.channels() {
                return Err(RegError::Input(
                    "fixed/moving channel mismatch within a pair".into(),
                ));
            }
            if pair.weight <= 0.0 {
                return Err(RegError::Config("pair weight must be positive".into()));
            }
            let fixed = if pair.fixed.geometry() == &reference {
                pair.fixed.clone()
            } else {
                return Err(RegError::Input(
                    "all fixed images must share the reference grid".into(),
                ));
            };
            let moving = if pair.moving.geometry() == &reference {
                pair.moving.clone()
            } else {
                resample_to_geometry(&pair.moving, &reference)?
            };
            for _ in 0..pair.fixed.channels() {
                channel_weights.push(pair.weight);
            }
            fixed_refs.push(fixed);
            moving_refs.push(moving);
        }
        let fixed_full = stack_channels(&fixed_refs.iter().collect::<Vec<_>>());
        let moving_full = stack_channels(&moving_refs.iter().collect::<Vec<_>>());

        if let Some(mask) = gradient_mask {
            if mask.channels() != 1 || !mask.geometry().same_size(&reference) {
                return Err(RegError::Input(
                    "gradient mask must be a scalar image on the reference grid".into(),
                ));
            }
        }

        let mut built = Vec::with_capacity(levels);
        for (l, &factor) in factors.iter().enumerate() {
            let mut fixed = block_average(&fixed_full, factor);
            let mut moving = block_average(&moving_full, factor);
            if noise > 0.0 {
                let mut rng = Lcg::new(0x5eed + l as u32);
                add_noise(&mut fixed, noise, &mut rng);
                add_noise(&mut moving, noise, &mut rng);
            }
            let ranges = channel_ranges(&fixed, &moving);
            let gradient_mask = gradient_mask.map(|m| block_average(m, factor));
            built.push(PyramidLevel {
                factor,
                fixed,
                moving,
                gradient_mask,
                channel_weights: channel_weights.clone(),
                ranges,
            });
        }

        Ok(Pyramid {
            levels: built,
            moving_geometry,
        })
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn level(&self, l: usize) -> &PyramidLevel {
        &self.levels[l]
    }

    pub fn finest(&self) -> &PyramidLevel {
        self.levels.last().unwrap()
    }

    /// Reference (fixed) grid of a level.
    pub fn reference_space(&self, level: usize) -> &Geometry {
        self.levels[level].reference_space()
    }

    /// The original moving grid derived at a level's factor; reported for
    /// diagnostics and reslice seeding.
    pub fn moving_reference_space(&self, level: usize) -> Geometry {
        self.moving_geometry.downsample(self.levels[level].factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gradient_image(n: usize) -> Image {
        let geom = Geometry::identity(vec![n, n]).unwrap();
        let mut img = Image::zeros(geom, 1);
        for y in 0..n {
            for x in 0..n {
                img.set(y * n + x, 0, x as f32);
            }
        }
        img
    }

    #[test]
    fn default_factors_are_powers_of_two() {
        let img = gradient_image(16);
        let pairs = vec![ImagePair {
            fixed: img.clone(),
            moving: img,
            weight: 1.0,
        }];
        let pyr = Pyramid::build(pairs, 3, None, 0.0, None).unwrap();
        let factors: Vec<usize> = pyr.levels().iter().map(|l| l.factor).collect();
        assert_eq!(factors, vec![4, 2, 1]);
        assert_eq!(pyr.reference_space(0).size(), &[4, 4]);
        assert_eq!(pyr.reference_space(2).size(), &[16, 16]);
    }

    #[test]
    fn block_average_means() {
        let img = gradient_image(4);
        let coarse = block_average(&img, 2);
        // First block covers x in {0, 1}: mean 0.5.
        assert_relative_eq!(coarse.get(0, 0), 0.5, epsilon = 1e-6);
        // Second block covers x in {2, 3}: mean 2.5.
        assert_relative_eq!(coarse.get(1, 0), 2.5, epsilon = 1e-6);
    }

    #[test]
    fn composites_stack_pair_channels() {
        let img = gradient_image(8);
        let pairs = vec![
            ImagePair {
                fixed: img.clone(),
                moving: img.clone(),
                weight: 1.0,
            },
            ImagePair {
                fixed: img.clone(),
                moving: img,
                weight: 2.5,
            },
        ];
        let pyr = Pyramid::build(pairs, 1, None, 0.0, None).unwrap();
        let level = pyr.finest();
        assert_eq!(level.fixed.channels(), 2);
        assert_eq!(level.channel_weights, vec![1.0, 2.5]);
    }

    #[test]
    fn noise_is_deterministic() {
        let img = gradient_image(8);
        let make = || {
            Pyramid::build(
                vec![ImagePair {
                    fixed: img.clone(),
                    moving: img.clone(),
                    weight: 1.0,
                }],
                2,
                None,
                1e-3,
                None,
            )
            .unwrap()
        };
        let a = make();
        let b = make();
        assert_eq!(a.finest().fixed.data(), b.finest().fixed.data());
    }
}
