//! Sky flat configuration
//!
//! Loaded from a JSON document that may carry `#` or `//` comments.
//! Every key has a default, so an empty object is a valid configuration.

use crate::device_ops::PierSide;
use crate::error::{Result, SkyFlatError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for automated sky flats
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkyFlatConfig {
    /// Track the sky during exposures
    #[serde(default)]
    pub tracking: bool,

    /// Flat field pose altitude (degrees)
    #[serde(default = "default_flat_alt")]
    pub flat_alt: f64,

    /// Flat field pose azimuth (degrees)
    #[serde(default)]
    pub flat_az: f64,

    /// Skip the slew when the telescope is already this close to the flat pose (degrees)
    #[serde(default = "default_flat_position_max")]
    pub flat_position_max: f64,

    /// Side of pier requested before positioning, if any
    #[serde(default)]
    pub pier_side: Option<PierSide>,

    /// Upper solar altitude bound of the flat window (degrees)
    #[serde(default = "default_sun_alt_hi")]
    pub sun_alt_hi: f64,

    /// Lower solar altitude bound of the flat window (degrees)
    #[serde(default = "default_sun_alt_low")]
    pub sun_alt_low: f64,

    /// Integration step of the exposure time calculation (seconds)
    #[serde(default = "default_exptime_increment")]
    pub exptime_increment: f64,

    /// Plans shorter than this are too short to be useful (seconds)
    #[serde(default = "default_exptime_min")]
    pub exptime_min: f64,

    /// Longest allowed exposure (seconds)
    #[serde(default = "default_exptime_max")]
    pub exptime_max: f64,

    /// Target mean counts per flat
    #[serde(default = "default_ideal_counts", rename = "idealCounts", alias = "ideal_counts")]
    pub ideal_counts: f64,

    /// Path to the per-filter sky model coefficients
    #[serde(default = "default_coefficients_file")]
    pub coefficients_file: PathBuf,

    /// How often the Sun is checked while waiting for the window (seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Wait before replanning when the dawn sky is still too dark or too bright (seconds)
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,

    /// Number of 100 ms polls waiting for tracking to start
    #[serde(default = "default_tracking_wait_polls")]
    pub tracking_wait_polls: u32,
}

impl Default for SkyFlatConfig {
    fn default() -> Self {
        Self {
            tracking: false,
            flat_alt: default_flat_alt(),
            flat_az: 0.0,
            flat_position_max: default_flat_position_max(),
            pier_side: None,
            sun_alt_hi: default_sun_alt_hi(),
            sun_alt_low: default_sun_alt_low(),
            exptime_increment: default_exptime_increment(),
            exptime_min: default_exptime_min(),
            exptime_max: default_exptime_max(),
            ideal_counts: default_ideal_counts(),
            coefficients_file: default_coefficients_file(),
            poll_interval_secs: default_poll_interval_secs(),
            retry_delay_secs: default_retry_delay_secs(),
            tracking_wait_polls: default_tracking_wait_polls(),
        }
    }
}

fn default_flat_alt() -> f64 {
    89.0
}

fn default_flat_position_max() -> f64 {
    5.0
}

fn default_sun_alt_hi() -> f64 {
    -5.0
}

fn default_sun_alt_low() -> f64 {
    -30.0
}

fn default_exptime_increment() -> f64 {
    0.2
}

fn default_exptime_min() -> f64 {
    1.0
}

fn default_exptime_max() -> f64 {
    180.0
}

fn default_ideal_counts() -> f64 {
    25000.0
}

fn default_coefficients_file() -> PathBuf {
    PathBuf::from("skyflat_coefficients.json")
}

fn default_poll_interval_secs() -> f64 {
    10.0
}

fn default_retry_delay_secs() -> f64 {
    5.0
}

fn default_tracking_wait_polls() -> u32 {
    20
}

impl SkyFlatConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json(&text)?;
        tracing::info!("Loaded sky flat configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a configuration document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(&strip_comments(text))
            .map_err(|e| SkyFlatError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SkyFlatError::InvalidConfig(msg));

        if !(self.sun_alt_hi > self.sun_alt_low) {
            return invalid(format!(
                "sun_alt_hi ({}) must be above sun_alt_low ({})",
                self.sun_alt_hi, self.sun_alt_low
            ));
        }
        if !(self.exptime_increment > 0.0) {
            return invalid(format!("exptime_increment must be positive, got {}", self.exptime_increment));
        }
        if !(self.exptime_min >= 0.0) || !(self.exptime_max >= self.exptime_min) {
            return invalid(format!(
                "need 0 <= exptime_min ({}) <= exptime_max ({})",
                self.exptime_min, self.exptime_max
            ));
        }
        if !(self.ideal_counts > 0.0) {
            return invalid(format!("idealCounts must be positive, got {}", self.ideal_counts));
        }
        let positive_secs = |secs: f64| secs > 0.0 && secs.is_finite();
        if !positive_secs(self.poll_interval_secs) || !positive_secs(self.retry_delay_secs) {
            return invalid("poll_interval_secs and retry_delay_secs must be positive and finite".to_string());
        }
        if !(self.flat_position_max >= 0.0) {
            return invalid(format!("flat_position_max must not be negative, got {}", self.flat_position_max));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }

    /// True while `altitude` lies strictly inside the flat window
    pub fn in_window(&self, altitude: f64) -> bool {
        self.sun_alt_low < altitude && altitude < self.sun_alt_hi
    }
}

/// Remove `#` and `//` line comments, leaving string literals untouched.
pub(crate) fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        let mut in_string = false;
        let mut escaped = false;
        let mut end = line.len();
        let bytes = line.as_bytes();

        for (i, &b) in bytes.iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'#' => {
                    end = i;
                    break;
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }

        out.push_str(&line[..end]);
        out.push('\n');
    }

    out
}
