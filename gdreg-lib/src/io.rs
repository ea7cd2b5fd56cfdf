// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! File-facing helpers that stay inside the engine: affine matrix text
//! formats and the physical-units conversion of serialized warps.
//!
//! Volume files (NIfTI and friends) are an external collaborator; the engine
//! only sees the `VolumeSource` / `VolumeSink` traits.

use nalgebra::DMatrix;
use std::path::Path;

use crate::error::{RegError, Result};
use crate::img::Image;
use crate::kernels::{par_voxel_map, AffineArr};

/// Reader of volume files into dense buffers; implemented by the driver.
pub trait VolumeSource {
    fn read_volume(&mut self, path: &Path, dim: usize) -> Result<Image>;
}

/// Writer of dense buffers to volume files; implemented by the driver.
pub trait VolumeSink {
    fn write_volume(&mut self, path: &Path, image: &Image) -> Result<()>;
}

const ITK_HEADER: &str = "#Insight Transform File";

fn parse_floats(text: &str) -> Vec<f64> {
    text.split_whitespace()
        .filter_map(|t| t.parse::<f64>().ok())
        .collect()
}

fn itk_to_homogeneous(text: &str, d: usize) -> Result<DMatrix<f64>> {
    let mut parameters: Option<Vec<f64>> = None;
    let mut fixed_parameters: Option<Vec<f64>> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Parameters:") {
            parameters = Some(parse_floats(rest));
        } else if let Some(rest) = line.strip_prefix("FixedParameters:") {
            fixed_parameters = Some(parse_floats(rest));
        }
    }
    let parameters =
        parameters.ok_or_else(|| RegError::Input("transform file has no Parameters line".into()))?;
    if parameters.len() != d * d + d {
        return Err(RegError::Input(format!(
            "expected {} transform parameters, found {}",
            d * d + d,
            parameters.len()
        )));
    }
    let center = fixed_parameters.unwrap_or_else(|| vec![0.0; d]);
    if center.len() != d {
        return Err(RegError::Input("bad FixedParameters line".into()));
    }

    // x -> M (x - c) + c + t, folded into homogeneous form.
    let mut h = DMatrix::identity(d + 1, d + 1);
    for r in 0..d {
        let mut mc = 0.0;
        for c in 0..d {
            h[(r, c)] = parameters[r * d + c];
            mc += parameters[r * d + c] * center[c];
        }
        h[(r, d)] = parameters[d * d + r] + center[r] - mc;
    }
    Ok(h)
}

fn plain_to_homogeneous(text: &str, d: usize) -> Result<DMatrix<f64>> {
    let values = parse_floats(text);
    let n = d + 1;
    if values.len() != n * n {
        return Err(RegError::Input(format!(
            "expected a {0}x{0} matrix ({1} values), found {2}",
            n,
            n * n,
            values.len()
        )));
    }
    Ok(DMatrix::from_row_slice(n, n, &values))
}

/// Read an affine matrix file, ITK-style or plain `(D+1)x(D+1)`. The stored
/// matrix is in RAS convention either way.
pub fn read_affine_matrix(path: &Path, dim: usize) -> Result<DMatrix<f64>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RegError::Input(format!("cannot read {}: {}", path.display(), e)))?;
    if text.starts_with(ITK_HEADER) {
        itk_to_homogeneous(&text, dim)
    } else {
        plain_to_homogeneous(&text, dim)
    }
}

/// Probe a file for an affine matrix; `None` means "not an affine text
/// file", leaving the caller to treat it as a volume.
pub fn probe_affine_matrix(path: &Path, dim: usize) -> Option<DMatrix<f64>> {
    let text = std::fs::read_to_string(path).ok()?;
    if text.starts_with(ITK_HEADER) {
        return itk_to_homogeneous(&text, dim).ok();
    }
    plain_to_homogeneous(&text, dim).ok()
}

/// Write a homogeneous RAS matrix as whitespace-separated rows.
pub fn write_affine_matrix(path: &Path, matrix: &DMatrix<f64>) -> Result<()> {
    let mut out = String::new();
    for r in 0..matrix.nrows() {
        for c in 0..matrix.ncols() {
            if c > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{}", matrix[(r, c)]));
        }
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

fn physical_flip_map(field: &Image) -> (DMatrix<f64>, DMatrix<f64>) {
    let geom = field.geometry();
    let d = geom.ndim();
    // Components map through R * diag(s) and the LPS->RAS sign flip.
    let (mut phi, _) = geom.index_to_physical_affine();
    for r in 0..d.min(2) {
        for c in 0..d {
            phi[(r, c)] = -phi[(r, c)];
        }
    }
    let inv = phi.clone().try_inverse().expect("singular geometry");
    (phi, inv)
}

/// Convert a voxel-units displacement field to the serialized physical-units
/// convention. A positive `precision` first quantizes each component to the
/// nearest multiple of that many voxels.
pub fn field_voxel_to_physical(field: &Image, precision: f64) -> Image {
    let d = field.geometry().ndim();
    assert_eq!(field.channels(), d);
    let (phi, _) = physical_flip_map(field);
    let map = AffineArr::new(&phi, &nalgebra::DVector::zeros(d));
    let mut out = Image::new_like(field);
    par_voxel_map(&mut out, |vi, voxel| {
        let u = field.voxel(vi);
        let mut q = [0.0f64; crate::img::MAX_DIM];
        let mut p = [0.0f64; crate::img::MAX_DIM];
        for a in 0..d {
            let v = u[a] as f64;
            q[a] = if precision > 0.0 {
                (v / precision).round() * precision
            } else {
                v
            };
        }
        map.apply(&q[..d], &mut p[..d]);
        for a in 0..d {
            voxel[a] = p[a] as f32;
        }
    });
    out
}

/// Inverse of [`field_voxel_to_physical`] (no quantization on read).
pub fn field_physical_to_voxel(field: &Image) -> Result<Image> {
    let d = field.geometry().ndim();
    if field.channels() != d {
        return Err(RegError::Input(format!(
            "expected a {}-component displacement field, found {} channels",
            d,
            field.channels()
        )));
    }
    let (_, inv) = physical_flip_map(field);
    let map = AffineArr::new(&inv, &nalgebra::DVector::zeros(d));
    let mut out = Image::new_like(field);
    par_voxel_map(&mut out, |vi, voxel| {
        let u = field.voxel(vi);
        let mut p = [0.0f64; crate::img::MAX_DIM];
        let mut q = [0.0f64; crate::img::MAX_DIM];
        for a in 0..d {
            p[a] = u[a] as f64;
        }
        map.apply(&p[..d], &mut q[..d]);
        for a in 0..d {
            voxel[a] = q[a] as f32;
        }
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::img::Geometry;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    #[test]
    fn plain_matrix_round_trip() {
        let dir = std::env::temp_dir().join("gdreg-io-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mat.txt");
        let m = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 0.25, 3.0, -0.25, 1.0, -2.0, 0.0, 0.0, 1.0],
        );
        write_affine_matrix(&path, &m).unwrap();
        let back = read_affine_matrix(&path, 2).unwrap();
        for r in 0..3 {
            for c in 0..3 {
                assert_relative_eq!(back[(r, c)], m[(r, c)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn itk_transform_folds_center() {
        let dir = std::env::temp_dir().join("gdreg-io-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("itk.txt");
        std::fs::write(
            &path,
            "#Insight Transform File V1.0\n#Transform 0\n\
             Transform: MatrixOffsetTransformBase_double_2_2\n\
             Parameters: 2 0 0 2 1 -1\nFixedParameters: 3 5\n",
        )
        .unwrap();
        let h = read_affine_matrix(&path, 2).unwrap();
        // x -> M (x - c) + c + t with M = 2I, c = (3, 5), t = (1, -1).
        assert_relative_eq!(h[(0, 0)], 2.0);
        assert_relative_eq!(h[(0, 2)], 1.0 + 3.0 - 6.0);
        assert_relative_eq!(h[(1, 2)], -1.0 + 5.0 - 10.0);
    }

    #[test]
    fn physical_round_trip_with_quantization() {
        let geom = Geometry::new(
            vec![4, 4],
            DVector::zeros(2),
            DVector::from_column_slice(&[0.5, 2.0]),
            DMatrix::identity(2, 2),
        )
        .unwrap();
        let mut field = Image::zeros(geom, 2);
        for vi in 0..field.voxel_count() {
            field.set(vi, 0, 1.23456);
            field.set(vi, 1, -0.7);
        }
        let phys = field_voxel_to_physical(&field, 0.01);
        // Axis 0: quantized to 1.23 voxels, spacing 0.5, LPS->RAS flip.
        assert_relative_eq!(phys.get(0, 0), -1.23 * 0.5, epsilon = 1e-5);
        let back = field_physical_to_voxel(&phys).unwrap();
        assert_relative_eq!(back.get(0, 0), 1.23, epsilon = 1e-5);
        assert_relative_eq!(back.get(0, 1), -0.7, epsilon = 1e-5);
    }
}
