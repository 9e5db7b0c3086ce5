// Pacer
// Copyright (c) 2025-2026 The Project Pacer Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `errors` module defines the common error type.

use std::error::Error as StdError;
use std::fmt;
use std::result;

/// `PacerError` provides an enumeration of all possible errors reported by Pacer.
#[derive(Debug)]
pub enum PacerError {
    /// A configuration value was invalid and could not be corrected by clamping it into its legal
    /// range.
    InvalidConfig(&'static str),
    /// An unsupported codec or rate-control feature was encountered.
    Unsupported(&'static str),
}

impl fmt::Display for PacerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PacerError::InvalidConfig(msg) => {
                write!(f, "invalid configuration: {}", msg)
            }
            PacerError::Unsupported(feature) => {
                write!(f, "unsupported feature: {}", feature)
            }
        }
    }
}

impl StdError for PacerError {}

pub type Result<T> = result::Result<T, PacerError>;

/// Convenience function to create an invalid configuration error.
pub fn invalid_config_error<T>(desc: &'static str) -> Result<T> {
    Err(PacerError::InvalidConfig(desc))
}

/// Convenience function to create an unsupported feature error.
pub fn unsupported_error<T>(feature: &'static str) -> Result<T> {
    Err(PacerError::Unsupported(feature))
}
