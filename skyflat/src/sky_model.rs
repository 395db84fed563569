//! Twilight sky brightness model
//!
//! Sky counts per second follow an exponential in solar altitude:
//!
//! ```text
//! rate = scale * exp(slope * radians(altitude)) + bias
//! ```
//!
//! The exposure time for a flat is found by integrating that rate forward in
//! time while the Sun keeps moving, until the integrated counts reach the
//! target level.

use crate::coefficients::SkyModelCoefficients;
use serde::{Deserialize, Serialize};

/// Result of one successful model integration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposurePlan {
    /// Exposure duration in seconds
    pub exposure_time: f64,
    /// Counts the model expects the exposure to collect
    pub predicted_integrated_counts: f64,
}

impl ExposurePlan {
    /// Per-second counts the plan was built on
    pub fn predicted_rate(&self) -> f64 {
        self.predicted_integrated_counts / self.exposure_time
    }
}

/// Outcome of [`compute_exposure_time`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExposureEstimate {
    Planned(ExposurePlan),
    /// The target was not reached within the maximum exposure time
    Exceeded,
}

/// Expected sky counts per second at the given solar altitude.
///
/// Overflow saturates at `f64::MAX` rather than producing infinity.
pub fn evaluate_rate(altitude_degrees: f64, scale: f64, slope: f64, bias: f64) -> f64 {
    let rate = scale * (slope * altitude_degrees.to_radians()).exp() + bias;
    if rate == f64::INFINITY {
        f64::MAX
    } else if rate == f64::NEG_INFINITY {
        f64::MIN
    } else {
        rate
    }
}

/// Integrate the model forward from now until `ideal_counts` is reached.
///
/// `altitude_at` maps elapsed seconds since the start of the exposure to the
/// solar altitude in degrees. At least one step is always taken, so the
/// shortest plan is one `time_step` long. A plan never exceeds
/// `max_exposure`.
pub fn compute_exposure_time<F>(
    altitude_at: F,
    coefficients: &SkyModelCoefficients,
    correction_factor: f64,
    ideal_counts: f64,
    time_step: f64,
    max_exposure: f64,
) -> ExposureEstimate
where
    F: Fn(f64) -> f64,
{
    if !(time_step > 0.0) {
        tracing::warn!("Non-positive integration step {}, cannot plan exposure", time_step);
        return ExposureEstimate::Exceeded;
    }

    let mut exposure_time = 0.0;
    let mut integrated_counts = 0.0;

    loop {
        let altitude = altitude_at(exposure_time);
        let rate = coefficients.rate(altitude) + correction_factor;
        integrated_counts += rate * time_step;
        exposure_time += time_step;

        if exposure_time > max_exposure {
            tracing::debug!(
                "Exposure time exceeded limit of {:.1}s (reached {:.0} of {:.0} counts)",
                max_exposure,
                integrated_counts,
                ideal_counts
            );
            return ExposureEstimate::Exceeded;
        }

        if integrated_counts >= ideal_counts {
            tracing::debug!(
                "Exposure time {:.2}s, computed counts {:.0} (altitude {:.3}°)",
                exposure_time,
                integrated_counts,
                altitude
            );
            return ExposureEstimate::Planned(ExposurePlan {
                exposure_time,
                predicted_integrated_counts: integrated_counts,
            });
        }
    }
}

/// Apply one measurement to the running correction factor.
///
/// The factor is the accumulated difference between measured and predicted
/// counts per second.
pub fn update_correction_factor(
    correction_factor: f64,
    measured_level: f64,
    plan: &ExposurePlan,
) -> f64 {
    correction_factor + measured_level / plan.exposure_time - plan.predicted_rate()
}
