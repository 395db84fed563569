//! Error types for sky flat acquisition
//!
//! Two outcomes that look like failures are deliberately absent here:
//! running out of exposure time is an [`ExposureEstimate::Exceeded`] value,
//! and an abort request ends the sequence in [`FlatSequenceState::Aborted`].
//!
//! [`ExposureEstimate::Exceeded`]: crate::sky_model::ExposureEstimate::Exceeded
//! [`FlatSequenceState::Aborted`]: crate::sky_flat::FlatSequenceState::Aborted

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by a flat sequence
#[derive(Error, Debug)]
pub enum SkyFlatError {
    /// Camera rejected the request or returned no frames
    #[error("Exposure failed: {0}")]
    ExposureFailure(String),

    /// A frame was taken but its pixel data could not be retrieved
    #[error("Failed to download frame {frame}: {reason}")]
    DownloadFailure {
        frame: String,
        reason: String,
    },

    /// Coefficients document could not be parsed or holds invalid values
    #[error("Malformed coefficients file {path}: {reason}")]
    MalformedCoefficients {
        path: PathBuf,
        reason: String,
    },

    #[error("No sky model coefficients for filter '{0}'")]
    UnknownFilter(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another `get_flats` call is already running on this instrument binding
    #[error("A flat sequence is already active on this instrument")]
    SessionActive,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SkyFlatError>;
