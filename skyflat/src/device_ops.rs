//! Instrument collaborator traits
//!
//! The acquisition loop only talks to hardware through these traits.
//! Real drivers live elsewhere; `crate::sim` provides simulated ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, String>;

/// Mechanical side of an equatorial mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PierSide {
    #[serde(rename = "E", alias = "East")]
    East,
    #[serde(rename = "W", alias = "West")]
    West,
}

/// Handle to a frame produced by the camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHandle {
    pub id: String,
    /// Where the camera stored the frame, possibly on a remote host
    pub path: String,
}

/// Pixel data of a downloaded frame
#[derive(Debug, Clone)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
    pub exposure_secs: f64,
    pub filter: Option<String>,
}

/// Exposure request sent to the camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureRequest {
    pub exptime: f64,
    pub frames: u32,
    pub shutter_open: bool,
    pub filename: String,
    pub image_type: String,
    pub filter: Option<String>,
}

impl ExposureRequest {
    /// Single open-shutter sky flat named after `at`
    pub fn sky_flat(exptime: f64, filter: Option<&str>, at: DateTime<Utc>) -> Self {
        Self {
            exptime,
            frames: 1,
            shutter_open: true,
            filename: format!("skyflat-{}", at.format("%Y%m%d-%H%M%S")),
            image_type: "sky-flat".to_string(),
            filter: filter.map(str::to_string),
        }
    }
}

/// Observing site ephemeris
pub trait Site: Send + Sync {
    /// Solar altitude in degrees at `at`
    fn sun_altitude(&self, at: DateTime<Utc>) -> f64;

    fn current_time(&self) -> DateTime<Utc>;

    /// True between local noon and midnight, i.e. dusk flats
    fn is_afternoon(&self) -> bool;
}

#[async_trait]
pub trait Telescope: Send + Sync {
    /// Current pointing as (altitude, azimuth) in degrees
    async fn current_alt_az(&self) -> DeviceResult<(f64, f64)>;

    async fn slew_to_alt_az(&self, alt: f64, az: f64) -> DeviceResult<()>;

    async fn start_tracking(&self) -> DeviceResult<()>;

    async fn stop_tracking(&self) -> DeviceResult<()>;

    async fn is_tracking(&self) -> DeviceResult<bool>;

    /// Mounts without pier side control accept and ignore the request
    async fn set_pier_side(&self, side: PierSide) -> DeviceResult<()> {
        tracing::debug!("Mount ignores pier side request {:?}", side);
        Ok(())
    }
}

#[async_trait]
pub trait Dome: Send + Sync {
    /// Slave the dome slit to the telescope
    async fn track(&self) -> DeviceResult<()>;
}

#[async_trait]
pub trait FilterWheel: Send + Sync {
    async fn set_filter(&self, name: &str) -> DeviceResult<()>;
}

#[async_trait]
pub trait Camera: Send + Sync {
    /// Take the requested exposure, blocking until it is read out
    async fn expose(&self, request: &ExposureRequest) -> DeviceResult<Vec<FrameHandle>>;

    async fn abort_exposure(&self) -> DeviceResult<()>;
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Fetch the pixel data of a frame, downloading it if needed
    async fn fetch(&self, frame: &FrameHandle) -> DeviceResult<ImageData>;
}

/// Everything the acquisition loop drives
#[derive(Clone)]
pub struct Instruments {
    pub site: Arc<dyn Site>,
    pub telescope: Arc<dyn Telescope>,
    pub camera: Arc<dyn Camera>,
    pub images: Arc<dyn ImageStore>,
    pub dome: Option<Arc<dyn Dome>>,
    pub filter_wheel: Option<Arc<dyn FilterWheel>>,
}
