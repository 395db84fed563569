//! Simulated instruments
//!
//! The sky follows the same exponential model the controller uses, so a
//! simulated flat lands on the target level unless `sky_factor` says the
//! real sky is brighter or darker than the model. Time is taken from
//! `tokio::time`, so paused-clock tests run whole twilights instantly.

use crate::coefficients::SkyModelCoefficients;
use crate::device_ops::{
    Camera, DeviceResult, Dome, ExposureRequest, FilterWheel, FrameHandle, ImageData, ImageStore, Instruments,
    PierSide, Site, Telescope,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Simulation step used to integrate sky counts during an exposure
const EXPOSURE_STEP_SECS: f64 = 0.1;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A Sun moving linearly in altitude
#[derive(Debug, Clone)]
pub struct SimSite {
    epoch: DateTime<Utc>,
    started: Instant,
    start_altitude: f64,
    degrees_per_sec: f64,
    afternoon: bool,
}

impl SimSite {
    pub fn new(start_altitude: f64, degrees_per_sec: f64, afternoon: bool) -> Self {
        Self {
            epoch: Utc::now(),
            started: Instant::now(),
            start_altitude,
            degrees_per_sec,
            afternoon,
        }
    }

    pub fn dusk(start_altitude: f64, degrees_per_sec: f64) -> Self {
        Self::new(start_altitude, degrees_per_sec, true)
    }

    pub fn dawn(start_altitude: f64, degrees_per_sec: f64) -> Self {
        Self::new(start_altitude, degrees_per_sec, false)
    }
}

impl Site for SimSite {
    fn sun_altitude(&self, at: DateTime<Utc>) -> f64 {
        let elapsed = (at - self.epoch).num_milliseconds() as f64 / 1000.0;
        self.start_altitude + self.degrees_per_sec * elapsed
    }

    fn current_time(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.epoch + elapsed
    }

    fn is_afternoon(&self) -> bool {
        self.afternoon
    }
}

/// Alt-az mount that records what it was asked to do
pub struct SimTelescope {
    alt_az: Mutex<(f64, f64)>,
    tracking: AtomicBool,
    pier_side: Mutex<Option<PierSide>>,
    fail_slews: bool,
    slews: AtomicU32,
    start_tracking_calls: AtomicU32,
    stop_tracking_calls: AtomicU32,
}

impl Default for SimTelescope {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTelescope {
    /// Parked at the horizon, not tracking
    pub fn new() -> Self {
        Self {
            alt_az: Mutex::new((0.0, 0.0)),
            tracking: AtomicBool::new(false),
            pier_side: Mutex::new(None),
            fail_slews: false,
            slews: AtomicU32::new(0),
            start_tracking_calls: AtomicU32::new(0),
            stop_tracking_calls: AtomicU32::new(0),
        }
    }

    pub fn pointing_at(self, alt: f64, az: f64) -> Self {
        *lock(&self.alt_az) = (alt, az);
        self
    }

    pub fn with_failing_slews(mut self) -> Self {
        self.fail_slews = true;
        self
    }

    pub fn slews(&self) -> u32 {
        self.slews.load(Ordering::SeqCst)
    }

    pub fn start_tracking_calls(&self) -> u32 {
        self.start_tracking_calls.load(Ordering::SeqCst)
    }

    pub fn stop_tracking_calls(&self) -> u32 {
        self.stop_tracking_calls.load(Ordering::SeqCst)
    }

    pub fn tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    pub fn pier_side(&self) -> Option<PierSide> {
        *lock(&self.pier_side)
    }
}

#[async_trait]
impl Telescope for SimTelescope {
    async fn current_alt_az(&self) -> DeviceResult<(f64, f64)> {
        Ok(*lock(&self.alt_az))
    }

    async fn slew_to_alt_az(&self, alt: f64, az: f64) -> DeviceResult<()> {
        if self.fail_slews {
            return Err("Slew rejected: mount in fault state".to_string());
        }
        tracing::info!("[SIM] Slew to Alt={:.2}°, Az={:.2}°", alt, az);
        self.slews.fetch_add(1, Ordering::SeqCst);
        *lock(&self.alt_az) = (alt, az);
        Ok(())
    }

    async fn start_tracking(&self) -> DeviceResult<()> {
        self.start_tracking_calls.fetch_add(1, Ordering::SeqCst);
        self.tracking.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_tracking(&self) -> DeviceResult<()> {
        self.stop_tracking_calls.fetch_add(1, Ordering::SeqCst);
        self.tracking.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_tracking(&self) -> DeviceResult<bool> {
        Ok(self.tracking())
    }

    async fn set_pier_side(&self, side: PierSide) -> DeviceResult<()> {
        *lock(&self.pier_side) = Some(side);
        Ok(())
    }
}

#[derive(Default)]
pub struct SimDome {
    track_calls: AtomicU32,
}

impl SimDome {
    pub fn track_calls(&self) -> u32 {
        self.track_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dome for SimDome {
    async fn track(&self) -> DeviceResult<()> {
        self.track_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct SimFilterWheel {
    current: Mutex<Option<String>>,
}

impl SimFilterWheel {
    pub fn current(&self) -> Option<String> {
        lock(&self.current).clone()
    }
}

#[async_trait]
impl FilterWheel for SimFilterWheel {
    async fn set_filter(&self, name: &str) -> DeviceResult<()> {
        *lock(&self.current) = Some(name.to_string());
        Ok(())
    }
}

/// Camera and image server in one: frames are kept in memory until fetched
pub struct SimCamera {
    site: SimSite,
    sky: SkyModelCoefficients,
    sky_factor: f64,
    noise_adu: i32,
    return_frames: bool,
    fail_downloads: bool,
    width: u32,
    height: u32,
    exposures: AtomicU32,
    aborts: AtomicU32,
    abort_notify: Notify,
    frames: Mutex<HashMap<String, ImageData>>,
}

impl SimCamera {
    pub fn new(site: SimSite, sky: SkyModelCoefficients) -> Self {
        Self {
            site,
            sky,
            sky_factor: 1.0,
            noise_adu: 0,
            return_frames: true,
            fail_downloads: false,
            width: 32,
            height: 32,
            exposures: AtomicU32::new(0),
            aborts: AtomicU32::new(0),
            abort_notify: Notify::new(),
            frames: Mutex::new(HashMap::new()),
        }
    }

    /// Real sky brightness relative to the model
    pub fn with_sky_factor(mut self, factor: f64) -> Self {
        self.sky_factor = factor;
        self
    }

    /// Uniform per-pixel noise amplitude
    pub fn with_noise(mut self, adu: i32) -> Self {
        self.noise_adu = adu.max(0);
        self
    }

    /// Exposures succeed but return no frames
    pub fn without_frames(mut self) -> Self {
        self.return_frames = false;
        self
    }

    /// Frames are produced but can never be downloaded
    pub fn with_failing_downloads(mut self) -> Self {
        self.fail_downloads = true;
        self
    }

    pub fn exposures(&self) -> u32 {
        self.exposures.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> u32 {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Sky counts collected between `start` and `start + exptime`
    fn integrated_level(&self, start: DateTime<Utc>, exptime: f64) -> f64 {
        let mut level = 0.0;
        let mut t = 0.0;
        while t < exptime {
            let step = EXPOSURE_STEP_SECS.min(exptime - t);
            let at = start + chrono::Duration::milliseconds((t * 1000.0).round() as i64);
            level += self.sky.rate(self.site.sun_altitude(at)) * step;
            t += step;
        }
        level * self.sky_factor
    }

    fn render(&self, level: f64, request: &ExposureRequest) -> ImageData {
        let mut rng = rand::thread_rng();
        let data = (0..self.width * self.height)
            .map(|_| {
                let noise = if self.noise_adu > 0 {
                    rng.gen_range(-self.noise_adu..=self.noise_adu) as f64
                } else {
                    0.0
                };
                (level + noise).round().clamp(0.0, u16::MAX as f64) as u16
            })
            .collect();

        ImageData {
            width: self.width,
            height: self.height,
            data,
            exposure_secs: request.exptime,
            filter: request.filter.clone(),
        }
    }
}

#[async_trait]
impl Camera for SimCamera {
    async fn expose(&self, request: &ExposureRequest) -> DeviceResult<Vec<FrameHandle>> {
        self.exposures.fetch_add(1, Ordering::SeqCst);
        let start = self.site.current_time();
        tracing::info!("[SIM] Starting {:.2}s exposure {}", request.exptime, request.filename);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(request.exptime.max(0.0))) => {}
            _ = self.abort_notify.notified() => {
                return Err(format!("Exposure {} aborted", request.filename));
            }
        }

        if !self.return_frames {
            return Ok(Vec::new());
        }

        let level = self.integrated_level(start, request.exptime);
        let image = self.render(level, request);
        let handle = FrameHandle {
            id: uuid::Uuid::new_v4().to_string(),
            path: format!("/sim/{}.fits", request.filename),
        };
        lock(&self.frames).insert(handle.id.clone(), image);
        Ok(vec![handle])
    }

    async fn abort_exposure(&self) -> DeviceResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.abort_notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl ImageStore for SimCamera {
    async fn fetch(&self, frame: &FrameHandle) -> DeviceResult<ImageData> {
        if self.fail_downloads {
            return Err(format!("Image server unreachable for {}", frame.path));
        }
        let image = lock(&self.frames).remove(&frame.id);
        image.ok_or_else(|| format!("No such frame {}", frame.path))
    }
}

/// A complete simulated observatory
pub struct SimObservatory {
    pub site: Arc<SimSite>,
    pub telescope: Arc<SimTelescope>,
    pub camera: Arc<SimCamera>,
    pub dome: Arc<SimDome>,
    pub filter_wheel: Arc<SimFilterWheel>,
}

impl SimObservatory {
    pub fn new(site: SimSite, sky: SkyModelCoefficients) -> Self {
        let camera = SimCamera::new(site.clone(), sky);
        Self::with_camera(site, camera)
    }

    pub fn with_camera(site: SimSite, camera: SimCamera) -> Self {
        Self {
            site: Arc::new(site),
            telescope: Arc::new(SimTelescope::new()),
            camera: Arc::new(camera),
            dome: Arc::new(SimDome::default()),
            filter_wheel: Arc::new(SimFilterWheel::default()),
        }
    }

    pub fn with_telescope(site: SimSite, sky: SkyModelCoefficients, telescope: SimTelescope) -> Self {
        let mut observatory = Self::new(site, sky);
        observatory.telescope = Arc::new(telescope);
        observatory
    }

    pub fn instruments(&self) -> Instruments {
        Instruments {
            site: self.site.clone(),
            telescope: self.telescope.clone(),
            camera: self.camera.clone(),
            images: self.camera.clone(),
            dome: Some(self.dome.clone()),
            filter_wheel: Some(self.filter_wheel.clone()),
        }
    }
}
