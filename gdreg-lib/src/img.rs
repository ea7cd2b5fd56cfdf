// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dense N-dimensional image buffers and their geometry descriptor.
//!
//! A buffer is a flat `Vec<f32>` with axis 0 fastest and channels interleaved
//! per voxel, so the solvers' inner loops are plain slice walks. Geometry
//! (origin, spacing, direction cosines) lives alongside and provides the
//! voxel-to-physical map `p = O + R * diag(s) * i`. All physical coordinates
//! inside the engine are in the LPS convention.

use nalgebra::{DMatrix, DVector};

use crate::error::{RegError, Result};

/// Largest supported image dimensionality.
pub const MAX_DIM: usize = 4;

/// Grid descriptor shared by every dense buffer: voxel counts, physical
/// origin, spacing and direction cosines.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    size: Vec<usize>,
    origin: DVector<f64>,
    spacing: DVector<f64>,
    direction: DMatrix<f64>,
}

impl Geometry {
    pub fn new(
        size: Vec<usize>,
        origin: DVector<f64>,
        spacing: DVector<f64>,
        direction: DMatrix<f64>,
    ) -> Result<Self> {
        let d = size.len();
        if d < 2 || d > MAX_DIM {
            return Err(RegError::Input(format!(
                "unsupported dimensionality {} (expected 2..={})",
                d, MAX_DIM
            )));
        }
        if origin.len() != d || spacing.len() != d || direction.shape() != (d, d) {
            return Err(RegError::Input(
                "geometry fields have inconsistent dimensions".into(),
            ));
        }
        if size.iter().any(|&n| n == 0) || spacing.iter().any(|&s| s <= 0.0) {
            return Err(RegError::Input("empty size or non-positive spacing".into()));
        }
        Ok(Geometry {
            size,
            origin,
            spacing,
            direction,
        })
    }

    /// Axis-aligned grid with unit spacing at the origin.
    pub fn identity(size: Vec<usize>) -> Result<Self> {
        let d = size.len();
        Geometry::new(
            size,
            DVector::zeros(d),
            DVector::from_element(d, 1.0),
            DMatrix::identity(d, d),
        )
    }

    pub fn ndim(&self) -> usize {
        self.size.len()
    }

    pub fn size(&self) -> &[usize] {
        &self.size
    }

    pub fn origin(&self) -> &DVector<f64> {
        &self.origin
    }

    pub fn spacing(&self) -> &DVector<f64> {
        &self.spacing
    }

    pub fn direction(&self) -> &DMatrix<f64> {
        &self.direction
    }

    pub fn voxel_count(&self) -> usize {
        self.size.iter().product()
    }

    /// Per-axis strides for linearization, axis 0 fastest.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.ndim()];
        for a in 1..self.ndim() {
            strides[a] = strides[a - 1] * self.size[a - 1];
        }
        strides
    }

    pub fn linear_index(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.ndim());
        let mut vi = 0;
        let mut stride = 1;
        for a in 0..self.ndim() {
            vi += index[a] * stride;
            stride *= self.size[a];
        }
        vi
    }

    /// Decompose a linear voxel index into per-axis coordinates.
    pub fn delinearize(&self, mut vi: usize, index: &mut [usize]) {
        for a in 0..self.ndim() {
            index[a] = vi % self.size[a];
            vi /= self.size[a];
        }
    }

    /// Voxel-to-physical affine as `(A, b)` with `p = A*i + b`,
    /// `A = R * diag(s)`.
    pub fn index_to_physical_affine(&self) -> (DMatrix<f64>, DVector<f64>) {
        let mut a = self.direction.clone();
        for c in 0..self.ndim() {
            let s = self.spacing[c];
            for r in 0..self.ndim() {
                a[(r, c)] *= s;
            }
        }
        (a, self.origin.clone())
    }

    /// Physical-to-voxel affine as `(A, b)` with `i = A*p + b`.
    pub fn physical_to_index_affine(&self) -> Result<(DMatrix<f64>, DVector<f64>)> {
        let (a, b) = self.index_to_physical_affine();
        let a_inv = a
            .try_inverse()
            .ok_or_else(|| RegError::Numeric("singular voxel-to-physical map".into()))?;
        let b_inv = -&a_inv * b;
        Ok((a_inv, b_inv))
    }

    pub fn index_to_physical(&self, index: &[f64]) -> DVector<f64> {
        let (a, b) = self.index_to_physical_affine();
        a * DVector::from_column_slice(index) + b
    }

    /// Geometry of the same physical extent sampled with an integer
    /// downsampling factor. Voxel centers of the coarse grid sit at the mean
    /// position of the fine voxels they cover.
    pub fn downsample(&self, factor: usize) -> Geometry {
        assert!(factor >= 1);
        let d = self.ndim();
        let size: Vec<usize> = self
            .size
            .iter()
            .map(|&n| ((n + factor - 1) / factor).max(1))
            .collect();
        let spacing = &self.spacing * factor as f64;
        let (a, _) = self.index_to_physical_affine();
        let shift = DVector::from_element(d, (factor as f64 - 1.0) / 2.0);
        let origin = &self.origin + a * shift;
        Geometry {
            size,
            origin,
            spacing,
            direction: self.direction.clone(),
        }
    }

    /// Same voxel lattice: size only (buffers may differ in physical frame
    /// when comparing fixed and moving levels).
    pub fn same_size(&self, other: &Geometry) -> bool {
        self.size == other.size
    }
}

/// Dense K-channel image buffer over a [`Geometry`].
///
/// Scalar images have one channel, displacement fields have `ndim` channels
/// (values in voxel units of their own grid), composites carry one channel
/// per stacked input channel.
#[derive(Debug, Clone)]
pub struct Image {
    geom: Geometry,
    channels: usize,
    data: Vec<f32>,
}

impl Image {
    pub fn zeros(geom: Geometry, channels: usize) -> Self {
        let len = geom.voxel_count() * channels;
        Image {
            geom,
            channels,
            data: vec![0.0; len],
        }
    }

    /// Buffer with geometry and channel count copied from a template.
    pub fn new_like(template: &Image) -> Self {
        Image::zeros(template.geom.clone(), template.channels)
    }

    pub fn from_data(geom: Geometry, channels: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != geom.voxel_count() * channels {
            return Err(RegError::Input(format!(
                "buffer length {} does not match geometry ({} voxels x {} channels)",
                data.len(),
                geom.voxel_count(),
                channels
            )));
        }
        Ok(Image {
            geom,
            channels,
            data,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn voxel_count(&self) -> usize {
        self.geom.voxel_count()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Channel values at a linear voxel index.
    #[inline]
    pub fn voxel(&self, vi: usize) -> &[f32] {
        let o = vi * self.channels;
        &self.data[o..o + self.channels]
    }

    #[inline]
    pub fn voxel_mut(&mut self, vi: usize) -> &mut [f32] {
        let o = vi * self.channels;
        &mut self.data[o..o + self.channels]
    }

    #[inline]
    pub fn get(&self, vi: usize, channel: usize) -> f32 {
        self.data[vi * self.channels + channel]
    }

    #[inline]
    pub fn set(&mut self, vi: usize, channel: usize, value: f32) {
        self.data[vi * self.channels + channel] = value;
    }

    pub fn fill(&mut self, value: f32) {
        for v in self.data.iter_mut() {
            *v = value;
        }
    }

    pub fn scale_in_place(&mut self, factor: f32) {
        for v in self.data.iter_mut() {
            *v *= factor;
        }
    }

    /// `self += factor * other`, element-wise over identical shapes.
    pub fn add_scaled_in_place(&mut self, other: &Image, factor: f32) {
        assert_eq!(self.data.len(), other.data.len());
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += factor * b;
        }
    }

    /// Multiply every channel by a one-channel weight image.
    pub fn weight_in_place(&mut self, weight: &Image) {
        assert_eq!(weight.channels, 1);
        assert_eq!(self.voxel_count(), weight.voxel_count());
        for (vi, w) in weight.data.iter().enumerate() {
            for v in self.voxel_mut(vi) {
                *v *= w;
            }
        }
    }

    /// Min and max of one channel over the whole domain.
    pub fn channel_range(&self, channel: usize) -> (f32, f32) {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        let mut i = channel;
        while i < self.data.len() {
            let v = self.data[i];
            if v < lo {
                lo = v;
            }
            if v > hi {
                hi = v;
            }
            i += self.channels;
        }
        (lo, hi)
    }
}
