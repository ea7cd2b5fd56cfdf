// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Image-wide kernels: separable smoothing, displacement resampling, field
//! composition, step-size policies and the Jacobian determinant.
//!
//! Every kernel partitions the output voxel range across rayon workers in
//! fixed-size chunks and writes disjoint slices, so results are bit-identical
//! across runs. Reductions combine chunk partials in index order.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::img::{Geometry, Image, MAX_DIM};
use crate::interp::{sample_linear, sample_nearest, Boundary};
use crate::utils::{reduce_chunks, Reducer, CHUNK};

/// Interpolation scheme for resampling kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interp {
    Linear,
    Nearest,
}

/// Policy governing how the smoothed gradient is scaled before composition
/// into the running field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Use the field as-is.
    Const,
    /// Always normalize the maximum vector norm to epsilon.
    Scale,
    /// Normalize only when the maximum vector norm exceeds epsilon.
    ScaleDown,
}

/// Run `f(vi, voxel)` over every output voxel, partitioned across workers.
pub(crate) fn par_voxel_map<F>(out: &mut Image, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    let k = out.channels();
    out.data_mut()
        .par_chunks_mut(k * CHUNK)
        .enumerate()
        .for_each(|(ci, chunk)| {
            let base = ci * CHUNK;
            for (j, voxel) in chunk.chunks_exact_mut(k).enumerate() {
                f(base + j, voxel);
            }
        });
}

/// Dense affine `x -> M x + b` over fixed-capacity arrays, for inner loops
/// that must not allocate.
#[derive(Debug, Clone)]
pub(crate) struct AffineArr {
    d: usize,
    m: [[f64; MAX_DIM]; MAX_DIM],
    b: [f64; MAX_DIM],
}

impl AffineArr {
    pub fn new(m: &DMatrix<f64>, b: &DVector<f64>) -> Self {
        let d = b.len();
        let mut arr = AffineArr {
            d,
            m: [[0.0; MAX_DIM]; MAX_DIM],
            b: [0.0; MAX_DIM],
        };
        for r in 0..d {
            arr.b[r] = b[r];
            for c in 0..d {
                arr.m[r][c] = m[(r, c)];
            }
        }
        arr
    }

    #[inline]
    pub fn apply(&self, x: &[f64], out: &mut [f64]) {
        for r in 0..self.d {
            let mut acc = self.b[r];
            for c in 0..self.d {
                acc += self.m[r][c] * x[c];
            }
            out[r] = acc;
        }
    }
}

fn gaussian_weights(sigma: f64) -> Vec<f64> {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let mut w = Vec::with_capacity(2 * radius + 1);
    let inv = 1.0 / (2.0 * sigma * sigma);
    for k in -(radius as isize)..=(radius as isize) {
        w.push((-(k * k) as f64 * inv).exp());
    }
    let total: f64 = w.iter().sum();
    for v in w.iter_mut() {
        *v /= total;
    }
    w
}

fn smooth_axis(src: &Image, axis: usize, sigma: f64) -> Image {
    let weights = gaussian_weights(sigma);
    let radius = weights.len() / 2;
    let geom = src.geometry();
    let n = geom.size()[axis];
    let stride = geom.strides()[axis];
    let k = src.channels();

    let mut out = Image::new_like(src);
    par_voxel_map(&mut out, |vi, voxel| {
        let ia = (vi / stride) % n;
        for v in voxel.iter_mut() {
            *v = 0.0;
        }
        for (wi, &w) in weights.iter().enumerate() {
            let off = wi as isize - radius as isize;
            let mut j = ia as isize + off;
            // Replicated border: the response near the boundary matches the
            // padded-domain result.
            if j < 0 {
                j = 0;
            } else if j as usize >= n {
                j = n as isize - 1;
            }
            let src_vi = (vi as isize + (j - ia as isize) * stride as isize) as usize;
            let values = src.voxel(src_vi);
            for c in 0..k {
                voxel[c] += (w * values[c] as f64) as f32;
            }
        }
    });
    out
}

/// Separable Gaussian smoothing with replicated borders; sigma is given per
/// axis in voxel units. Axes with negligible sigma are passed through.
pub fn gaussian_smooth(img: &Image, sigma: &[f64]) -> Image {
    assert_eq!(sigma.len(), img.geometry().ndim());
    let mut current: Option<Image> = None;
    for (axis, &s) in sigma.iter().enumerate() {
        if s < 1e-6 {
            continue;
        }
        let src = current.as_ref().unwrap_or(img);
        current = Some(smooth_axis(src, axis, s));
    }
    current.unwrap_or_else(|| img.clone())
}

fn box_axis(src: &Image, axis: usize, radius: usize) -> Image {
    let geom = src.geometry();
    let n = geom.size()[axis];
    let stride = geom.strides()[axis];
    let k = src.channels();

    let mut out = Image::new_like(src);
    par_voxel_map(&mut out, |vi, voxel| {
        let ia = (vi / stride) % n;
        let lo = ia.saturating_sub(radius);
        let hi = (ia + radius).min(n - 1);
        for v in voxel.iter_mut() {
            *v = 0.0;
        }
        for j in lo..=hi {
            let src_vi = (vi as isize + (j as isize - ia as isize) * stride as isize) as usize;
            let values = src.voxel(src_vi);
            for c in 0..k {
                voxel[c] += values[c];
            }
        }
    });
    out
}

/// Sum of every channel over the box window of the given per-axis radius,
/// truncated at the domain border (outside voxels contribute nothing).
pub fn box_sum(img: &Image, radius: &[usize]) -> Image {
    assert_eq!(radius.len(), img.geometry().ndim());
    let mut current: Option<Image> = None;
    for (axis, &r) in radius.iter().enumerate() {
        if r == 0 {
            continue;
        }
        let src = current.as_ref().unwrap_or(img);
        current = Some(box_axis(src, axis, r));
    }
    current.unwrap_or_else(|| img.clone())
}

/// Resample on the shared grid: `out(i) = src(i + u(i))`.
pub fn resample_displaced(src: &Image, field: &Image, interp: Interp, boundary: Boundary) -> Image {
    let geom = field.geometry();
    let d = geom.ndim();
    assert_eq!(field.channels(), d);
    let mut out = Image::zeros(geom.clone(), src.channels());
    let geom = geom.clone();
    par_voxel_map(&mut out, |vi, voxel| {
        let mut idx = [0usize; MAX_DIM];
        let mut point = [0.0f64; MAX_DIM];
        geom.delinearize(vi, &mut idx[..d]);
        let u = field.voxel(vi);
        for a in 0..d {
            point[a] = idx[a] as f64 + u[a] as f64;
        }
        match interp {
            Interp::Linear => {
                sample_linear(src, &point[..d], voxel, boundary);
            }
            Interp::Nearest => {
                sample_nearest(src, &point[..d], voxel);
            }
        }
    });
    out
}

/// Warp `src` through `field` mapping between physical frames: the mapped
/// reference point `ref_geom(i + u(i))` is located in the source image using
/// the source's own geometry. Samples outside the source are zero.
pub fn resample_displaced_physical(
    src: &Image,
    field: &Image,
    interp: Interp,
) -> crate::error::Result<Image> {
    let ref_geom = field.geometry().clone();
    let d = ref_geom.ndim();
    let (ra, rb) = ref_geom.index_to_physical_affine();
    let (sa, sb) = src.geometry().physical_to_index_affine()?;
    let to_phys = AffineArr::new(&ra, &rb);
    let to_src = AffineArr::new(&sa, &sb);

    let mut out = Image::zeros(ref_geom.clone(), src.channels());
    par_voxel_map(&mut out, |vi, voxel| {
        let mut idx = [0usize; MAX_DIM];
        let mut point = [0.0f64; MAX_DIM];
        let mut phys = [0.0f64; MAX_DIM];
        let mut x = [0.0f64; MAX_DIM];
        ref_geom.delinearize(vi, &mut idx[..d]);
        let u = field.voxel(vi);
        for a in 0..d {
            point[a] = idx[a] as f64 + u[a] as f64;
        }
        to_phys.apply(&point[..d], &mut phys[..d]);
        to_src.apply(&phys[..d], &mut x[..d]);
        match interp {
            Interp::Linear => {
                sample_linear(src, &x[..d], voxel, Boundary::Zero);
            }
            Interp::Nearest => {
                sample_nearest(src, &x[..d], voxel);
            }
        }
    });
    Ok(out)
}

/// Resample any image onto a new geometry through physical space (identity
/// transform), linear interpolation with replicated borders.
pub fn resample_to_geometry(src: &Image, new_geom: &Geometry) -> crate::error::Result<Image> {
    let d = new_geom.ndim();
    let (na, nb) = new_geom.index_to_physical_affine();
    let (sa, sb) = src.geometry().physical_to_index_affine()?;
    let to_phys = AffineArr::new(&na, &nb);
    let to_src = AffineArr::new(&sa, &sb);

    let mut out = Image::zeros(new_geom.clone(), src.channels());
    let new_geom = new_geom.clone();
    par_voxel_map(&mut out, |vi, voxel| {
        let mut idx = [0usize; MAX_DIM];
        let mut point = [0.0f64; MAX_DIM];
        let mut phys = [0.0f64; MAX_DIM];
        let mut x = [0.0f64; MAX_DIM];
        new_geom.delinearize(vi, &mut idx[..d]);
        for a in 0..d {
            point[a] = idx[a] as f64;
        }
        to_phys.apply(&point[..d], &mut phys[..d]);
        to_src.apply(&phys[..d], &mut x[..d]);
        sample_linear(src, &x[..d], voxel, Boundary::Replicate);
    });
    Ok(out)
}

/// Expand a voxel-frame linear transform into the displacement field
/// `u(i) = T i + b - i` on the field's grid.
pub fn fill_affine_field(t: &crate::transform::LinearTransform, field: &mut Image) {
    let geom = field.geometry().clone();
    let d = geom.ndim();
    assert_eq!(field.channels(), d);
    assert_eq!(t.ndim(), d);
    let t_arr = AffineArr::new(&t.matrix, &t.offset);
    par_voxel_map(field, |vi, voxel| {
        let mut idx = [0usize; MAX_DIM];
        let mut x = [0.0f64; MAX_DIM];
        let mut y = [0.0f64; MAX_DIM];
        geom.delinearize(vi, &mut idx[..d]);
        for a in 0..d {
            x[a] = idx[a] as f64;
        }
        t_arr.apply(&x[..d], &mut y[..d]);
        for a in 0..d {
            voxel[a] = (y[a] - x[a]) as f32;
        }
    });
}

/// Field composition: `(u o v)(i) = v(i) + u(i + v(i))`, linear sampling of
/// `u` with replicated borders. Composing with the zero field is the
/// identity on either side.
pub fn compose(u: &Image, v: &Image) -> Image {
    let geom = v.geometry().clone();
    let d = geom.ndim();
    assert_eq!(u.channels(), d);
    assert_eq!(v.channels(), d);
    let mut out = Image::new_like(v);
    par_voxel_map(&mut out, |vi, voxel| {
        let mut idx = [0usize; MAX_DIM];
        let mut point = [0.0f64; MAX_DIM];
        let mut sampled = [0.0f32; MAX_DIM];
        geom.delinearize(vi, &mut idx[..d]);
        let vv = v.voxel(vi);
        for a in 0..d {
            point[a] = idx[a] as f64 + vv[a] as f64;
        }
        sample_linear(u, &point[..d], &mut sampled[..d], Boundary::Replicate);
        for a in 0..d {
            voxel[a] = vv[a] + sampled[a];
        }
    });
    out
}

struct MaxReducer;

impl Reducer for MaxReducer {
    type Partial = f64;
    fn identity(&self) -> f64 {
        0.0
    }
    fn combine(&self, a: f64, b: f64) -> f64 {
        a.max(b)
    }
}

/// Maximum Euclidean vector norm over the field.
pub fn max_vector_norm(field: &Image) -> f64 {
    let k = field.channels();
    let max_sq = reduce_chunks(field.voxel_count(), &MaxReducer, |range| {
        let mut best = 0.0f64;
        for vi in range {
            let u = field.voxel(vi);
            let mut sq = 0.0f64;
            for c in 0..k {
                sq += (u[c] as f64) * (u[c] as f64);
            }
            if sq > best {
                best = sq;
            }
        }
        best
    });
    max_sq.sqrt()
}

/// Apply a step-size policy in place; returns the max norm found before
/// scaling.
pub fn normalize_max_norm(field: &mut Image, epsilon: f64, mode: StepMode) -> f64 {
    let max_norm = max_vector_norm(field);
    let rescale = match mode {
        StepMode::Const => false,
        StepMode::Scale => max_norm > 0.0,
        StepMode::ScaleDown => max_norm > epsilon,
    };
    if rescale {
        field.scale_in_place((epsilon / max_norm) as f32);
    }
    max_norm
}

fn det_arr(m: &[[f64; MAX_DIM]; MAX_DIM], d: usize) -> f64 {
    match d {
        2 => m[0][0] * m[1][1] - m[0][1] * m[1][0],
        3 => {
            m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
                - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
                + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
        }
        4 => {
            let mut det = 0.0;
            for c in 0..4 {
                let mut sub = [[0.0; MAX_DIM]; MAX_DIM];
                for r in 1..4 {
                    let mut cc = 0;
                    for c2 in 0..4 {
                        if c2 == c {
                            continue;
                        }
                        sub[r - 1][cc] = m[r][c2];
                        cc += 1;
                    }
                }
                let sign = if c % 2 == 0 { 1.0 } else { -1.0 };
                det += sign * m[0][c] * det_arr(&sub, 3);
            }
            det
        }
        _ => unreachable!(),
    }
}

/// Per-voxel Jacobian determinant of `id + u` from central differences
/// (one-sided at the borders).
pub fn jacobian_determinant(field: &Image) -> Image {
    let geom = field.geometry().clone();
    let d = geom.ndim();
    assert_eq!(field.channels(), d);
    let size = geom.size().to_vec();
    let strides = geom.strides();

    let mut out = Image::zeros(geom.clone(), 1);
    par_voxel_map(&mut out, |vi, voxel| {
        let mut idx = [0usize; MAX_DIM];
        geom.delinearize(vi, &mut idx[..d]);
        let mut jac = [[0.0f64; MAX_DIM]; MAX_DIM];
        for a in 0..d {
            let ia = idx[a];
            let fwd = (ia + 1).min(size[a] - 1);
            let bwd = ia.saturating_sub(1);
            let denom = (fwd - bwd) as f64;
            let vf = vi + (fwd - ia) * strides[a];
            let vb = vi - (ia - bwd) * strides[a];
            let uf = field.voxel(vf);
            let ub = field.voxel(vb);
            for r in 0..d {
                let mut e = (uf[r] as f64 - ub[r] as f64) / denom;
                if r == a {
                    e += 1.0;
                }
                jac[r][a] = e;
            }
        }
        voxel[0] = det_arr(&jac, d) as f32;
    });
    out
}
