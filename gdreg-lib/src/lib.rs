// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Greedy diffeomorphic registration
//!
//! Multi-resolution registration of N-dimensional medical images: greedy
//! deformable alignment producing a dense displacement field, affine
//! alignment in physical coordinates, a brute-force discrete search, and a
//! reslicer applying chains of previously computed transforms.

// #![warn(missing_docs)]

pub mod affine;
pub mod brute;
pub mod chain;
pub mod deformable;
pub mod error;
pub mod img;
pub mod interp;
pub mod io;
pub mod kernels;
pub mod metric;
pub mod optimizer;
pub mod pyramid;
pub mod transform;
pub mod utils;
