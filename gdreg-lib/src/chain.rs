// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Transform chains and the reslicer.
//!
//! A chain is a sequence of `(file, exponent)` specs composed into a single
//! displacement field in the reference space; each file holds either a RAS
//! affine matrix (text) or a displacement field (volume), told apart by
//! probing. The composed field then drives linear, nearest or labelwise
//! resampling of moving images.

use std::path::{Path, PathBuf};

use crate::deformable::invert_field;
use crate::error::{RegError, Result};
use crate::img::{Geometry, Image, MAX_DIM};
use crate::io::{field_physical_to_voxel, probe_affine_matrix, VolumeSource};
use crate::kernels::{
    compose, gaussian_smooth, par_voxel_map, resample_displaced_physical, AffineArr, Interp,
};
use crate::transform::ras_to_voxel;
use crate::utils::Sigma;

/// One element of a transform chain.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSpec {
    pub path: PathBuf,
    pub exponent: f64,
}

impl TransformSpec {
    /// Parse `file[,exponent]`. The exponent grammar accepts any decimal
    /// number, but only +1 and -1 are meaningful today; everything else is
    /// rejected rather than silently ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let (path, exponent) = match s.rfind(',') {
            Some(idx) => match s[idx + 1..].parse::<f64>() {
                Ok(e) => (&s[..idx], e),
                Err(_) => (s, 1.0),
            },
            None => (s, 1.0),
        };
        if exponent != 1.0 && exponent != -1.0 {
            return Err(RegError::Config(format!(
                "unsupported transform exponent {} in \"{}\" (only +1 and -1)",
                exponent, s
            )));
        }
        Ok(TransformSpec {
            path: PathBuf::from(path),
            exponent,
        })
    }
}

/// A materialized chain element.
pub enum LoadedTransform {
    /// Homogeneous physical-RAS matrix.
    Affine(nalgebra::DMatrix<f64>),
    /// Displacement field in voxel units of its own grid.
    Warp(Image),
}

/// Load a chain element, probing text-affine content first.
pub fn load_transform(
    path: &Path,
    dim: usize,
    source: &mut dyn VolumeSource,
) -> Result<LoadedTransform> {
    if let Some(m) = probe_affine_matrix(path, dim) {
        return Ok(LoadedTransform::Affine(m));
    }
    let stored = source.read_volume(path, dim)?;
    Ok(LoadedTransform::Warp(field_physical_to_voxel(&stored)?))
}

/// Fixed-point budget when a chain asks for the inverse of a warp file.
const INVERT_EXPONENT: u32 = 2;
const INVERT_ITERATIONS: usize = 20;
const INVERT_TOLERANCE: f64 = 1e-3;

/// Compose a chain of specs into one displacement field on the reference
/// grid, applying each transform after the running composite.
pub fn compose_chain(
    specs: &[TransformSpec],
    reference: &Geometry,
    source: &mut dyn VolumeSource,
) -> Result<Image> {
    let d = reference.ndim();
    let mut u = Image::zeros(reference.clone(), d);
    for spec in specs {
        match load_transform(&spec.path, d, source)? {
            LoadedTransform::Affine(mut m) => {
                if spec.exponent == -1.0 {
                    m = m.try_inverse().ok_or_else(|| {
                        RegError::Numeric(format!(
                            "matrix in {} is not invertible",
                            spec.path.display()
                        ))
                    })?;
                }
                let t = ras_to_voxel(&m, reference, reference)?;
                // u(i) <- T(i + u(i)) - i, evaluated exactly rather than by
                // sampling an expanded affine field.
                let t_arr = AffineArr::new(&t.matrix, &t.offset);
                let geom = reference.clone();
                let mut next = Image::zeros(geom.clone(), d);
                par_voxel_map(&mut next, |vi, voxel| {
                    let mut idx = [0usize; MAX_DIM];
                    let mut y = [0.0f64; MAX_DIM];
                    let mut z = [0.0f64; MAX_DIM];
                    geom.delinearize(vi, &mut idx[..d]);
                    let cur = u.voxel(vi);
                    for a in 0..d {
                        y[a] = idx[a] as f64 + cur[a] as f64;
                    }
                    t_arr.apply(&y[..d], &mut z[..d]);
                    for a in 0..d {
                        voxel[a] = (z[a] - idx[a] as f64) as f32;
                    }
                });
                u = next;
            }
            LoadedTransform::Warp(w) => {
                if !w.geometry().same_size(reference) {
                    return Err(RegError::Input(format!(
                        "warp {} does not live on the reference grid",
                        spec.path.display()
                    )));
                }
                let w = if spec.exponent == -1.0 {
                    let (inv, residual) =
                        invert_field(&w, INVERT_EXPONENT, INVERT_ITERATIONS, INVERT_TOLERANCE);
                    if residual > INVERT_TOLERANCE {
                        log::warn!(
                            "inverse of {} converged to residual {:.3e} only",
                            spec.path.display(),
                            residual
                        );
                    }
                    inv
                } else {
                    w
                };
                u = compose(&w, &u);
            }
        }
    }
    Ok(u)
}

/// Interpolation used when reslicing a moving image through a composed
/// field. The label sigma carries its unit explicitly.
#[derive(Debug, Clone)]
pub enum ResliceInterp {
    Linear,
    Nearest,
    Label { sigma: Sigma },
}

/// Hard cap on the label count in labelwise mode.
const MAX_LABELS: usize = 1000;

fn unique_labels(image: &Image) -> Result<Vec<i64>> {
    let mut labels: Vec<i64> = Vec::new();
    for &v in image.data() {
        let label = v.round() as i64;
        if let Err(pos) = labels.binary_search(&label) {
            labels.insert(pos, label);
            if labels.len() > MAX_LABELS {
                return Err(RegError::Config(format!(
                    "label image has more than {} unique labels",
                    MAX_LABELS
                )));
            }
        }
    }
    Ok(labels)
}

fn reslice_labelwise(moving: &Image, field: &Image, sigma: &Sigma) -> Result<Image> {
    if moving.channels() != 1 {
        return Err(RegError::Input(
            "labelwise reslicing needs a scalar label image".into(),
        ));
    }
    let labels = unique_labels(moving)?;
    let spacing: Vec<f64> = moving.geometry().spacing().iter().cloned().collect();
    let sigma_vox = sigma.to_voxel_units(&spacing);

    let out_geom = field.geometry().clone();
    let mut best = Image::zeros(out_geom.clone(), 1);
    best.fill(f32::NEG_INFINITY);
    let mut out = Image::zeros(out_geom, 1);

    // Ascending label order with a strict comparison breaks probability ties
    // toward the smallest label.
    for &label in labels.iter() {
        let mut indicator = Image::zeros(moving.geometry().clone(), 1);
        for (dst, &src) in indicator.data_mut().iter_mut().zip(moving.data().iter()) {
            if src.round() as i64 == label {
                *dst = 1.0;
            }
        }
        let smoothed = gaussian_smooth(&indicator, &sigma_vox);
        let warped = resample_displaced_physical(&smoothed, field, Interp::Linear)?;
        for vi in 0..out.voxel_count() {
            let p = warped.get(vi, 0);
            if p > best.get(vi, 0) {
                best.set(vi, 0, p);
                out.set(vi, 0, label as f32);
            }
        }
    }
    Ok(out)
}

/// Apply a composed field to a moving image.
pub fn reslice(moving: &Image, field: &Image, interp: &ResliceInterp) -> Result<Image> {
    match interp {
        ResliceInterp::Linear => resample_displaced_physical(moving, field, Interp::Linear),
        ResliceInterp::Nearest => resample_displaced_physical(moving, field, Interp::Nearest),
        ResliceInterp::Label { sigma } => reslice_labelwise(moving, field, sigma),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{sample_linear, Boundary};

    #[test]
    fn spec_parsing() {
        let spec = TransformSpec::parse("warp.nii.gz").unwrap();
        assert_eq!(spec.exponent, 1.0);
        let spec = TransformSpec::parse("affine.txt,-1").unwrap();
        assert_eq!(spec.path, PathBuf::from("affine.txt"));
        assert_eq!(spec.exponent, -1.0);
        assert!(TransformSpec::parse("warp.nii,0.5").is_err());
        assert!(TransformSpec::parse("warp.nii,2").is_err());
    }

    #[test]
    fn labels_survive_reslicing() {
        let geom = Geometry::identity(vec![12, 12]).unwrap();
        let mut labels_img = Image::zeros(geom.clone(), 1);
        for y in 0..12 {
            for x in 0..12 {
                let label = if x < 6 { 2.0 } else { 7.0 };
                labels_img.set(y * 12 + x, 0, label);
            }
        }
        // Half-voxel shift along x.
        let mut field = Image::zeros(geom, 2);
        for vi in 0..field.voxel_count() {
            field.set(vi, 0, 0.5);
        }
        let out = reslice(
            &labels_img,
            &field,
            &ResliceInterp::Label {
                sigma: Sigma::vox(0.8),
            },
        )
        .unwrap();
        for &v in out.data() {
            assert!(v == 2.0 || v == 7.0, "unexpected label {}", v);
        }
    }

    #[test]
    fn label_cap_is_enforced() {
        let geom = Geometry::identity(vec![40, 40]).unwrap();
        let mut img = Image::zeros(geom.clone(), 1);
        for vi in 0..img.voxel_count() {
            img.set(vi, 0, vi as f32);
        }
        let field = Image::zeros(geom, 2);
        let err = reslice(
            &img,
            &field,
            &ResliceInterp::Label {
                sigma: Sigma::vox(0.5),
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn nearest_reslice_moves_content() {
        let geom = Geometry::identity(vec![8, 8]).unwrap();
        let mut img = Image::zeros(geom.clone(), 1);
        img.set(3 * 8 + 3, 0, 9.0);
        let mut field = Image::zeros(geom, 2);
        for vi in 0..field.voxel_count() {
            field.set(vi, 0, 1.0);
        }
        let out = reslice(&img, &field, &ResliceInterp::Nearest).unwrap();
        assert_eq!(out.get(3 * 8 + 2, 0), 9.0);
        let mut probe = [0.0f32];
        sample_linear(&out, &[3.0, 3.0], &mut probe, Boundary::Zero);
        assert_eq!(probe[0], 0.0);
    }
}
