// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Brute-force solver: exhaustive integer-offset search under windowed NCC.
//!
//! Every offset within the search radius is tried as a constant displacement
//! and the per-voxel correlation maps are reduced with an argmax, producing
//! a discrete displacement field. Only NCC is supported.

use crate::error::{RegError, Result};
use crate::img::Image;
use crate::metric::{MetricEval, MetricKind};
use crate::pyramid::PyramidLevel;

/// Search the offsets in `[-search_radius, +search_radius]` per axis and
/// return the per-voxel best displacement. Only the NCC metric is accepted.
pub fn run(level: &PyramidLevel, metric: &MetricKind, search_radius: &[usize]) -> Result<Image> {
    let geom = level.reference_space().clone();
    let d = geom.ndim();
    if !matches!(metric, MetricKind::Ncc { .. }) {
        return Err(RegError::Config(
            "brute-force search requires the NCC metric".into(),
        ));
    }
    if search_radius.len() != d {
        return Err(RegError::Config(format!(
            "search radius has {} axes, image has {}",
            search_radius.len(),
            d
        )));
    }
    let mut eval = MetricEval::new(level, metric)?;

    let mut field = Image::zeros(geom.clone(), d);
    let mut map = Image::zeros(geom.clone(), 1);
    let mut best_value = Image::zeros(geom.clone(), 1);
    best_value.fill(f32::NEG_INFINITY);
    let mut best_offset = Image::zeros(geom.clone(), d);

    // Lexicographic enumeration of the offsets, axis 0 fastest; ties keep
    // the first offset found.
    let mut offset: Vec<i64> = search_radius.iter().map(|&r| -(r as i64)).collect();
    loop {
        for (a, &o) in offset.iter().enumerate() {
            let value = o as f32;
            for vi in 0..field.voxel_count() {
                field.set(vi, a, value);
            }
        }
        eval.value_map(&field, &mut map)?;
        for vi in 0..map.voxel_count() {
            let v = map.get(vi, 0);
            if v > best_value.get(vi, 0) {
                best_value.set(vi, 0, v);
                for a in 0..d {
                    best_offset.set(vi, a, offset[a] as f32);
                }
            }
        }

        let mut axis = 0;
        loop {
            offset[axis] += 1;
            if offset[axis] <= search_radius[axis] as i64 {
                break;
            }
            offset[axis] = -(search_radius[axis] as i64);
            axis += 1;
            if axis == d {
                break;
            }
        }
        if axis == d {
            break;
        }
    }
    Ok(best_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::img::Geometry;
    use crate::pyramid::{ImagePair, Pyramid};

    #[test]
    fn recovers_single_pixel_shift() {
        // Bright pixel at (10, 10) in fixed and (12, 9) in moving.
        let geom = Geometry::identity(vec![32, 32]).unwrap();
        let mut fixed = Image::zeros(geom.clone(), 1);
        let mut moving = Image::zeros(geom, 1);
        fixed.set(10 * 32 + 10, 0, 1.0);
        moving.set(9 * 32 + 12, 0, 1.0);
        let pyr = Pyramid::build(
            vec![ImagePair {
                fixed,
                moving,
                weight: 1.0,
            }],
            1,
            None,
            0.0,
            None,
        )
        .unwrap();
        let metric = MetricKind::Ncc {
            radius: vec![1, 1],
        };
        let field = run(pyr.finest(), &metric, &[4, 4]).unwrap();
        let vi = 10 * 32 + 10;
        assert_eq!(field.get(vi, 0), 2.0);
        assert_eq!(field.get(vi, 1), -1.0);
    }

    fn flat_pyramid() -> Pyramid {
        let geom = Geometry::identity(vec![8, 8]).unwrap();
        let img = Image::zeros(geom, 1);
        Pyramid::build(
            vec![ImagePair {
                fixed: img.clone(),
                moving: img,
                weight: 1.0,
            }],
            1,
            None,
            0.0,
            None,
        )
        .unwrap()
    }

    #[test]
    fn radius_mismatch_is_rejected() {
        let pyr = flat_pyramid();
        let metric = MetricKind::Ncc {
            radius: vec![1, 1],
        };
        assert!(run(pyr.finest(), &metric, &[4]).is_err());
    }

    #[test]
    fn non_ncc_metric_is_a_configuration_error() {
        use crate::error::RegError;
        let pyr = flat_pyramid();
        match run(pyr.finest(), &MetricKind::Ssd, &[4, 4]) {
            Err(RegError::Config(_)) => {}
            other => panic!("expected a configuration error, got {:?}", other.err()),
        }
    }
}
