// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Linear transforms and the conversions between the three coordinate
//! frames: voxel index, physical LPS and physical RAS.
//!
//! All axis-flip bookkeeping lives here; solver code never touches raw sign
//! conventions. Serialized matrices are `(D+1) x (D+1)` homogeneous in RAS,
//! internal transforms live in voxel coordinates of the reference level.

use nalgebra::{DMatrix, DVector};

use crate::error::{RegError, Result};
use crate::img::Geometry;

/// Affine map in voxel coordinates: `j = M i + b`, fixed index to moving
/// index.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearTransform {
    pub matrix: DMatrix<f64>,
    pub offset: DVector<f64>,
}

impl LinearTransform {
    pub fn identity(d: usize) -> Self {
        LinearTransform {
            matrix: DMatrix::identity(d, d),
            offset: DVector::zeros(d),
        }
    }

    pub fn ndim(&self) -> usize {
        self.offset.len()
    }

    pub fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        &self.matrix * x + &self.offset
    }

    /// Homogeneous `(D+1) x (D+1)` packing.
    pub fn to_homogeneous(&self) -> DMatrix<f64> {
        let d = self.ndim();
        let mut h = DMatrix::identity(d + 1, d + 1);
        for r in 0..d {
            h[(r, d)] = self.offset[r];
            for c in 0..d {
                h[(r, c)] = self.matrix[(r, c)];
            }
        }
        h
    }

    pub fn from_homogeneous(h: &DMatrix<f64>) -> Result<Self> {
        let (rows, cols) = h.shape();
        if rows != cols || rows < 3 {
            return Err(RegError::Input(format!(
                "expected square homogeneous matrix, got {}x{}",
                rows, cols
            )));
        }
        let d = rows - 1;
        let mut matrix = DMatrix::zeros(d, d);
        let mut offset = DVector::zeros(d);
        for r in 0..d {
            offset[r] = h[(r, d)];
            for c in 0..d {
                matrix[(r, c)] = h[(r, c)];
            }
        }
        Ok(LinearTransform { matrix, offset })
    }

    /// `self` applied after `other`.
    pub fn compose(&self, other: &LinearTransform) -> LinearTransform {
        LinearTransform {
            matrix: &self.matrix * &other.matrix,
            offset: &self.matrix * &other.offset + &self.offset,
        }
    }

    pub fn try_inverse(&self) -> Result<LinearTransform> {
        let inv = self
            .matrix
            .clone()
            .try_inverse()
            .ok_or_else(|| RegError::Numeric("singular linear transform".into()))?;
        let offset = -&inv * &self.offset;
        Ok(LinearTransform {
            matrix: inv,
            offset,
        })
    }
}

/// Homogeneous LPS<->RAS flip: sign change on the first two axes (its own
/// inverse). Time-like axes beyond the third are untouched.
pub fn lps_ras_flip(d: usize) -> DMatrix<f64> {
    let mut f = DMatrix::identity(d + 1, d + 1);
    for a in 0..d.min(2) {
        f[(a, a)] = -1.0;
    }
    f
}

fn index_to_physical_homogeneous(geom: &Geometry) -> DMatrix<f64> {
    let d = geom.ndim();
    let (a, b) = geom.index_to_physical_affine();
    let mut h = DMatrix::identity(d + 1, d + 1);
    for r in 0..d {
        h[(r, d)] = b[r];
        for c in 0..d {
            h[(r, c)] = a[(r, c)];
        }
    }
    h
}

/// Express a voxel-frame transform (fixed index -> moving index) as a
/// homogeneous physical-RAS matrix.
pub fn voxel_to_ras(
    t: &LinearTransform,
    fixed: &Geometry,
    moving: &Geometry,
) -> Result<DMatrix<f64>> {
    let d = t.ndim();
    let s_f = index_to_physical_homogeneous(fixed);
    let s_m = index_to_physical_homogeneous(moving);
    let s_f_inv = s_f
        .try_inverse()
        .ok_or_else(|| RegError::Numeric("singular fixed geometry".into()))?;
    let flip = lps_ras_flip(d);
    // RAS = F . S_m . T . S_f^-1 . F
    Ok(&flip * s_m * t.to_homogeneous() * s_f_inv * &flip)
}

/// Convert a homogeneous physical-RAS matrix into the voxel frame of the
/// given geometries.
pub fn ras_to_voxel(
    ras: &DMatrix<f64>,
    fixed: &Geometry,
    moving: &Geometry,
) -> Result<LinearTransform> {
    let d = fixed.ndim();
    if ras.shape() != (d + 1, d + 1) {
        return Err(RegError::Input(format!(
            "expected {0}x{0} RAS matrix, got {1}x{2}",
            d + 1,
            ras.nrows(),
            ras.ncols()
        )));
    }
    let s_f = index_to_physical_homogeneous(fixed);
    let s_m = index_to_physical_homogeneous(moving);
    let s_m_inv = s_m
        .try_inverse()
        .ok_or_else(|| RegError::Numeric("singular moving geometry".into()))?;
    let flip = lps_ras_flip(d);
    let h = s_m_inv * &flip * ras * &flip * s_f;
    LinearTransform::from_homogeneous(&h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    fn skewed_geometry() -> Geometry {
        Geometry::new(
            vec![32, 24, 16],
            DVector::from_column_slice(&[12.0, -7.5, 3.25]),
            DVector::from_column_slice(&[0.8, 1.25, 2.0]),
            DMatrix::from_row_slice(3, 3, &[0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]),
        )
        .unwrap()
    }

    #[test]
    fn ras_round_trip_is_exact() {
        let fixed = skewed_geometry();
        let moving = Geometry::identity(vec![20, 20, 20]).unwrap();
        let t = LinearTransform {
            matrix: DMatrix::from_row_slice(
                3,
                3,
                &[1.02, 0.05, 0.0, -0.04, 0.98, 0.01, 0.0, 0.02, 1.01],
            ),
            offset: DVector::from_column_slice(&[2.5, -1.75, 0.5]),
        };
        let ras = voxel_to_ras(&t, &fixed, &moving).unwrap();
        let back = ras_to_voxel(&ras, &fixed, &moving).unwrap();
        for r in 0..3 {
            assert_relative_eq!(back.offset[r], t.offset[r], epsilon = 1e-12);
            for c in 0..3 {
                assert_relative_eq!(back.matrix[(r, c)], t.matrix[(r, c)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn flip_is_involutive() {
        let f = lps_ras_flip(3);
        let id = &f * &f;
        assert_relative_eq!(id[(0, 0)], 1.0, epsilon = 1e-15);
        assert_relative_eq!(id[(1, 1)], 1.0, epsilon = 1e-15);
        assert_eq!(f[(2, 2)], 1.0);
    }

    #[test]
    fn compose_and_invert() {
        let a = LinearTransform {
            matrix: DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 0.5]),
            offset: DVector::from_column_slice(&[1.0, -3.0]),
        };
        let inv = a.try_inverse().unwrap();
        let id = a.compose(&inv);
        assert_relative_eq!(id.matrix[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(id.offset[0], 0.0, epsilon = 1e-12);
    }
}
