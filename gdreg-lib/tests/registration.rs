// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end registration scenarios on synthetic images.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gdreg::affine::{self, AffineConfig, AffineSeed};
use gdreg::chain::{compose_chain, TransformSpec};
use gdreg::deformable::{self, DeformableConfig};
use gdreg::error::{RegError, Result};
use gdreg::img::{Geometry, Image};
use gdreg::interp::{sample_linear, Boundary};
use gdreg::io::{field_physical_to_voxel, field_voxel_to_physical, VolumeSource};
use gdreg::kernels::{compose, max_vector_norm, StepMode};
use gdreg::metric::MetricKind;
use gdreg::pyramid::{ImagePair, Pyramid};
use gdreg::transform::ras_to_voxel;
use gdreg::utils::Sigma;

fn blob(n: usize, cx: f64, cy: f64, sigma: f64) -> Image {
    let geom = Geometry::identity(vec![n, n]).unwrap();
    let mut img = Image::zeros(geom, 1);
    for y in 0..n {
        for x in 0..n {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let v = (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            img.set(y * n + x, 0, v as f32);
        }
    }
    img
}

fn shifted_copy(src: &Image, shift: &[f64]) -> Image {
    let mut out = Image::new_like(src);
    let geom = src.geometry().clone();
    let d = geom.ndim();
    let mut idx = vec![0usize; d];
    let mut point = vec![0.0f64; d];
    let mut value = vec![0.0f32; src.channels()];
    for vi in 0..out.voxel_count() {
        geom.delinearize(vi, &mut idx);
        for a in 0..d {
            point[a] = idx[a] as f64 - shift[a];
        }
        sample_linear(src, &point, &mut value, Boundary::Replicate);
        out.voxel_mut(vi).copy_from_slice(&value);
    }
    out
}

fn pair_pyramid(fixed: Image, moving: Image, levels: usize, noise: f64) -> Pyramid {
    Pyramid::build(
        vec![ImagePair {
            fixed,
            moving,
            weight: 1.0,
        }],
        levels,
        None,
        noise,
        None,
    )
    .unwrap()
}

fn deformable_config(iterations: Vec<usize>, metric: MetricKind, epsilon: f64) -> DeformableConfig {
    DeformableConfig {
        iterations,
        metric,
        sigma_pre: Sigma::vox(1.7),
        sigma_post: Sigma::vox(0.6),
        step_mode: StepMode::ScaleDown,
        epsilon,
    }
}

/// S1: identical inputs stay put and the metric never degrades.
#[test]
fn identical_inputs_produce_no_motion() {
    let img = blob(64, 32.0, 32.0, 10.0);
    let pyr = pair_pyramid(img.clone(), img, 2, 0.0);
    let config = deformable_config(vec![20, 20], MetricKind::Ssd, 0.5);

    let mut values: Vec<f64> = Vec::new();
    let mut observer = |event: &deformable::IterationEvent| {
        values.push(event.metric_value);
    };
    let field = deformable::run(&pyr, &config, None, Some(&mut observer)).unwrap();
    assert!(max_vector_norm(&field) < 1e-3);
    // Metric stays at zero within numerical noise.
    for &v in values.iter() {
        assert!(v.abs() < 1e-6, "metric drifted to {}", v);
    }
}

/// Deformable SSD recovers most of a small translation.
#[test]
fn deformable_reduces_misalignment() {
    let fixed = blob(64, 32.0, 32.0, 8.0);
    let moving = shifted_copy(&fixed, &[1.5, -1.0]);
    let pyr = pair_pyramid(fixed, moving, 2, 0.0);
    let config = deformable_config(vec![40, 40], MetricKind::Ssd, 0.5);

    // Track the metric trace of the finest level only; sums across levels
    // have different voxel counts.
    let mut fine_values: Vec<f64> = Vec::new();
    let mut observer = |event: &deformable::IterationEvent| {
        if event.level == 1 {
            fine_values.push(event.metric_value);
        }
    };
    let field = deformable::run(&pyr, &config, None, Some(&mut observer)).unwrap();
    let first = fine_values[0];
    let last = *fine_values.last().unwrap();
    assert!(
        last <= first * 1.01,
        "metric degraded: {} -> {}",
        first,
        last
    );
    // The recovered displacement at the blob center points toward the
    // moving position.
    let vi = 32 * 64 + 32;
    let u = field.voxel(vi);
    assert!(u[0] > 0.5, "u_x = {}", u[0]);
    assert!(u[1] < -0.2, "u_y = {}", u[1]);
}

/// S2: affine recovery of a known translation.
#[test]
fn affine_recovers_translation() {
    let fixed = blob(64, 30.0, 34.0, 10.0);
    let moving = shifted_copy(&fixed, &[3.0, -2.0]);
    let pyr = pair_pyramid(fixed, moving, 2, 0.0);
    let config = AffineConfig {
        iterations: vec![60, 60],
        metric: MetricKind::Ssd,
        use_powell: false,
        tolerance: 1e-10,
        jitter_seed: 42,
        debug_deriv: None,
    };
    let ras = affine::run(&pyr, &config, &AffineSeed::Identity).unwrap();
    let geom = pyr.reference_space(1).clone();
    let t = ras_to_voxel(&ras, &geom, &geom).unwrap();
    assert!((t.offset[0] - 3.0).abs() < 0.1, "tx = {}", t.offset[0]);
    assert!((t.offset[1] + 2.0).abs() < 0.1, "ty = {}", t.offset[1]);
    // Rotation within half a degree.
    let angle = t.matrix[(1, 0)].atan2(t.matrix[(0, 0)]).abs();
    assert!(angle < 0.5f64.to_radians(), "angle = {}", angle);
}

/// S3: NCC is invariant to affine intensity changes.
#[test]
fn ncc_ignores_contrast_changes() {
    let fixed = blob(48, 24.0, 24.0, 7.0);
    let mut moving = fixed.clone();
    for v in moving.data_mut() {
        *v = 2.0 * *v + 5.0;
    }
    let pyr = pair_pyramid(fixed, moving, 2, 1e-3);
    let config = deformable_config(
        vec![20, 20],
        MetricKind::Ncc {
            radius: vec![3, 3],
        },
        0.25,
    );
    let field = deformable::run(&pyr, &config, None, None).unwrap();
    assert!(
        max_vector_norm(&field) < 0.5,
        "spurious motion {}",
        max_vector_norm(&field)
    );
}

/// S6: the inverse warp of a small affine field composes to near identity.
#[test]
fn inverse_warp_composes_to_identity() {
    use gdreg::kernels::fill_affine_field;
    use gdreg::transform::LinearTransform;
    use nalgebra::{DMatrix, DVector};

    let geom = Geometry::identity(vec![48, 48]).unwrap();
    let t = LinearTransform {
        matrix: DMatrix::from_row_slice(2, 2, &[1.015, 0.008, -0.005, 0.99]),
        offset: DVector::from_column_slice(&[0.6, -0.4]),
    };
    let mut u = Image::zeros(geom, 2);
    fill_affine_field(&t, &mut u);

    let (v, residual) = deformable::invert_field(&u, 2, 20, 1e-4);
    assert!(residual < 0.05, "residual = {}", residual);
    let round_trip = compose(&u, &v);
    assert!(max_vector_norm(&round_trip) < 0.05);
}

/// P5: stepping a field to the finer level (resample + doubled components)
/// evaluates the metric as if the field had been built on the fine grid.
#[test]
fn level_step_preserves_metric() {
    use gdreg::kernels::resample_to_geometry;
    use gdreg::metric::MetricEval;

    let fixed = blob(32, 16.0, 16.0, 5.0);
    let moving = shifted_copy(&fixed, &[1.2, -0.8]);
    let pyr = pair_pyramid(fixed, moving, 2, 0.0);
    let coarse = pyr.level(0);
    let fine = pyr.level(1);

    let mut u_coarse = Image::zeros(coarse.reference_space().clone(), 2);
    for vi in 0..u_coarse.voxel_count() {
        u_coarse.set(vi, 0, 0.6);
        u_coarse.set(vi, 1, -0.4);
    }
    let mut refined = resample_to_geometry(&u_coarse, fine.reference_space()).unwrap();
    refined.scale_in_place(2.0);

    let mut direct = Image::zeros(fine.reference_space().clone(), 2);
    for vi in 0..direct.voxel_count() {
        direct.set(vi, 0, 1.2);
        direct.set(vi, 1, -0.8);
    }

    let mut eval = MetricEval::new(fine, &MetricKind::Ssd).unwrap();
    let mut grad = Image::new_like(&refined);
    let refined_value = eval.dense(&refined, &mut grad).unwrap().value;
    let direct_value = eval.dense(&direct, &mut grad).unwrap().value;
    let scale = direct_value.abs().max(1e-12);
    assert!(
        ((refined_value - direct_value) / scale).abs() < 1e-4,
        "{} vs {}",
        refined_value,
        direct_value
    );
}

struct MemorySource {
    volumes: HashMap<PathBuf, Image>,
}

impl MemorySource {
    fn new() -> Self {
        MemorySource {
            volumes: HashMap::new(),
        }
    }

    fn insert(&mut self, name: &str, img: Image) {
        self.volumes.insert(PathBuf::from(name), img);
    }
}

impl VolumeSource for MemorySource {
    fn read_volume(&mut self, path: &Path, _dim: usize) -> Result<Image> {
        self.volumes
            .get(path)
            .cloned()
            .ok_or_else(|| RegError::Input(format!("no such volume: {}", path.display())))
    }
}

fn smooth_test_field(geom: &Geometry, ax: f64, ay: f64) -> Image {
    let n = geom.size()[0] as f64;
    let mut field = Image::zeros(geom.clone(), 2);
    for vi in 0..field.voxel_count() {
        let x = (vi % geom.size()[0]) as f64;
        let y = (vi / geom.size()[0]) as f64;
        let wx = (std::f64::consts::PI * x / n).sin();
        let wy = (std::f64::consts::PI * y / n).sin();
        field.set(vi, 0, (ax * wx * wy) as f32);
        field.set(vi, 1, (ay * wx * wy) as f32);
    }
    field
}

/// S5: chaining two warps equals composing them first, within quantization.
#[test]
fn chain_matches_direct_composition() {
    let geom = Geometry::identity(vec![32, 32]).unwrap();
    let warp_a = smooth_test_field(&geom, 1.2, -0.8);
    let warp_b = smooth_test_field(&geom, -0.6, 0.9);
    let precision = 0.01;

    let mut source = MemorySource::new();
    source.insert("a.nii", field_voxel_to_physical(&warp_a, precision));
    source.insert("b.nii", field_voxel_to_physical(&warp_b, precision));

    let specs = vec![
        TransformSpec::parse("a.nii").unwrap(),
        TransformSpec::parse("b.nii").unwrap(),
    ];
    let chained = compose_chain(&specs, &geom, &mut source).unwrap();

    // Direct composition of the quantized fields.
    let qa = field_physical_to_voxel(&field_voxel_to_physical(&warp_a, precision)).unwrap();
    let qb = field_physical_to_voxel(&field_voxel_to_physical(&warp_b, precision)).unwrap();
    let direct = compose(&qb, &qa);

    let mut worst = 0.0f32;
    for (x, y) in chained.data().iter().zip(direct.data().iter()) {
        worst = worst.max((x - y).abs());
    }
    assert!(worst <= precision as f32, "worst difference {}", worst);
}

/// An affine chain element maps voxels exactly.
#[test]
fn affine_chain_element_is_exact() {
    use gdreg::io::write_affine_matrix;
    use nalgebra::DMatrix;

    let dir = std::env::temp_dir().join("gdreg-chain-test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("shift.txt");
    // RAS translation by (-2, 1): with identity geometry the LPS flip turns
    // it into a voxel translation of (2, -1).
    let mut m = DMatrix::identity(3, 3);
    m[(0, 2)] = -2.0;
    m[(1, 2)] = 1.0;
    write_affine_matrix(&path, &m).unwrap();

    let geom = Geometry::identity(vec![16, 16]).unwrap();
    let mut source = MemorySource::new();
    let specs = vec![TransformSpec::parse(path.to_str().unwrap()).unwrap()];
    let field = compose_chain(&specs, &geom, &mut source).unwrap();
    for vi in 0..field.voxel_count() {
        assert!((field.get(vi, 0) - 2.0).abs() < 1e-5);
        assert!((field.get(vi, 1) + 1.0).abs() < 1e-5);
    }
}
