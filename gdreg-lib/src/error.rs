// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error types surfaced by the registration engine.

use thiserror::Error;

/// Failure kinds bubbled to the top-level driver.
#[derive(Debug, Error)]
pub enum RegError {
    /// Missing or malformed inputs: files, matrices, images.
    #[error("input: {0}")]
    Input(String),
    /// Inconsistent configuration: bad radius, unknown metric, bad exponent.
    #[error("configuration: {0}")]
    Config(String),
    /// Numerical failure that is fatal in the current context.
    #[error("numeric: {0}")]
    Numeric(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegError>;
