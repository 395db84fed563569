//! Nightshade Sky Flats
//!
//! Automated twilight flat field acquisition. The exposure time of each flat
//! is predicted from an exponential model of sky brightness versus solar
//! altitude, corrected online from the level measured in previous flats.
//!
//! Hardware is reached only through the traits in [`device_ops`]; see
//! [`sim`] for simulated instruments.

pub mod coefficients;
pub mod config;
pub mod device_ops;
pub mod error;
pub mod logging;
pub mod observer;
pub mod sim;
pub mod site;
pub mod sky_flat;
pub mod sky_model;
pub mod stats;

pub use coefficients::{CoefficientStore, CoefficientTable, FileCoefficientStore, SkyModelCoefficients};
pub use config::SkyFlatConfig;
pub use device_ops::{
    Camera, DeviceResult, Dome, ExposureRequest, FilterWheel, FrameHandle, ImageData, ImageStore, Instruments,
    PierSide, Site, Telescope,
};
pub use error::{Result, SkyFlatError};
pub use observer::{FlatObservers, FlatTaken};
pub use site::ObservatorySite;
pub use sky_flat::{AutoSkyFlat, FlatSequenceOutcome, FlatSequenceState};
pub use sky_model::{compute_exposure_time, evaluate_rate, ExposureEstimate, ExposurePlan};
