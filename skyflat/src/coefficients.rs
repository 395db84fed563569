//! Per-filter sky model coefficients
//!
//! The coefficients file is a JSON object keyed by filter name, each value a
//! `[scale, slope, bias]` triple. `#` and `//` comments are allowed:
//!
//! ```text
//! # Sloan filters, fitted 2016-05
//! {
//!     "R": [2000000.0, 68.0, 17.0],
//!     "V": [1500000.0, 70.0, 12.0]   // pending refit
//! }
//! ```

use crate::config::strip_comments;
use crate::error::{Result, SkyFlatError};
use crate::sky_model::evaluate_rate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Exponential sky model for one filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyModelCoefficients {
    /// Multiplicative amplitude, always positive
    pub scale: f64,
    /// Exponent applied to the altitude in radians
    pub slope: f64,
    /// Additive floor (dark counts)
    pub bias: f64,
}

impl SkyModelCoefficients {
    pub fn new(scale: f64, slope: f64, bias: f64) -> Self {
        Self { scale, slope, bias }
    }

    /// Sky counts per second at `altitude_degrees`
    pub fn rate(&self, altitude_degrees: f64) -> f64 {
        evaluate_rate(altitude_degrees, self.scale, self.slope, self.bias)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !(self.scale.is_finite() && self.slope.is_finite() && self.bias.is_finite()) {
            return Err("coefficients must be finite".to_string());
        }
        if self.scale <= 0.0 {
            return Err(format!("scale must be positive, got {}", self.scale));
        }
        Ok(())
    }
}

/// Coefficients for every known filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoefficientTable {
    filters: HashMap<String, SkyModelCoefficients>,
}

impl CoefficientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, filter: impl Into<String>, coefficients: SkyModelCoefficients) {
        self.filters.insert(filter.into(), coefficients);
    }

    pub fn get(&self, filter: &str) -> Option<&SkyModelCoefficients> {
        self.filters.get(filter)
    }

    /// Look up a filter, failing with [`SkyFlatError::UnknownFilter`]
    pub fn for_filter(&self, filter: &str) -> Result<SkyModelCoefficients> {
        self.get(filter)
            .copied()
            .ok_or_else(|| SkyFlatError::UnknownFilter(filter.to_string()))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Parse a coefficients document. `source` is only used in error messages.
    pub fn parse(text: &str, source: &Path) -> Result<Self> {
        let malformed = |reason: String| SkyFlatError::MalformedCoefficients {
            path: source.to_path_buf(),
            reason,
        };

        let raw: HashMap<String, [f64; 3]> =
            serde_json::from_str(&strip_comments(text)).map_err(|e| malformed(e.to_string()))?;

        let mut table = Self::new();
        for (filter, [scale, slope, bias]) in raw {
            let coefficients = SkyModelCoefficients::new(scale, slope, bias);
            coefficients
                .validate()
                .map_err(|reason| malformed(format!("filter '{}': {}", filter, reason)))?;
            table.insert(filter, coefficients);
        }
        Ok(table)
    }
}

/// Source of the coefficient table, read at the start of every sequence
pub trait CoefficientStore: Send + Sync {
    fn load(&self) -> Result<CoefficientTable>;
}

/// Coefficients kept in a file on disk
#[derive(Debug, Clone)]
pub struct FileCoefficientStore {
    path: PathBuf,
}

impl FileCoefficientStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CoefficientStore for FileCoefficientStore {
    fn load(&self) -> Result<CoefficientTable> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| SkyFlatError::MalformedCoefficients {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let table = CoefficientTable::parse(&text, self.path())?;
        if table.is_empty() {
            tracing::warn!("No sky model coefficients in {}", self.path().display());
        } else {
            tracing::debug!(
                "Loaded sky model coefficients for {} filters from {}",
                table.len(),
                self.path().display()
            );
        }
        Ok(table)
    }
}

/// A fixed table, for callers that do not keep coefficients on disk
impl CoefficientStore for CoefficientTable {
    fn load(&self) -> Result<CoefficientTable> {
        Ok(self.clone())
    }
}
