//! Automated twilight sky flats
//!
//! 1. Wait for the Sun to enter the altitude strip where flats can be taken
//! 2. Predict the exposure time from the sky brightness model
//! 3. Take the flat and measure its mean level
//! 4. Fold the measured/predicted discrepancy into the correction factor
//! 5. Repeat until the Sun leaves the strip, enough flats are taken, or abort
//!
//! Dusk and dawn are handled asymmetrically. At dusk the sky only gets
//! darker, so a plan that cannot be met ends the filter. At dawn the sky
//! only gets brighter, so the loop waits and replans.

use crate::coefficients::{CoefficientStore, FileCoefficientStore, SkyModelCoefficients};
use crate::config::SkyFlatConfig;
use crate::device_ops::{ExposureRequest, Instruments};
use crate::error::{Result, SkyFlatError};
use crate::observer::{FlatObservers, FlatTaken};
use crate::sky_model::{compute_exposure_time, update_correction_factor, ExposureEstimate, ExposurePlan};
use crate::stats::mean_sky_level;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TRACKING_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a flat sequence ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlatSequenceState {
    /// Flat count reached or the Sun left the window
    Complete,
    /// Abort was requested
    Aborted,
    /// No more flats possible for this filter: window missed or sky too dark
    FilterExhausted,
}

/// Summary returned by [`AutoSkyFlat::get_flats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatSequenceOutcome {
    pub state: FlatSequenceState,
    pub filter: String,
    pub flats_taken: u32,
    pub correction_factor: f64,
    /// At least one slew, tracking, dome or pier side command failed
    pub positioning_degraded: bool,
}

/// State of one `get_flats` call
struct LoopSession {
    filter: String,
    coefficients: SkyModelCoefficients,
    correction_factor: f64,
    flats_taken: u32,
    dusk: bool,
    positioning_degraded: bool,
}

impl LoopSession {
    fn finish(self, state: FlatSequenceState) -> FlatSequenceOutcome {
        FlatSequenceOutcome {
            state,
            filter: self.filter,
            flats_taken: self.flats_taken,
            correction_factor: self.correction_factor,
            positioning_degraded: self.positioning_degraded,
        }
    }

    fn twilight(&self) -> &'static str {
        if self.dusk {
            "dusk"
        } else {
            "dawn"
        }
    }
}

/// Marks the instrument busy for the lifetime of one sequence
struct SessionGuard<'a>(&'a AtomicBool);

impl<'a> SessionGuard<'a> {
    fn acquire(active: &'a AtomicBool) -> Result<Self> {
        active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SkyFlatError::SessionActive)?;
        Ok(Self(active))
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sky flat controller bound to one set of instruments
pub struct AutoSkyFlat {
    config: SkyFlatConfig,
    instruments: Instruments,
    coefficients: Arc<dyn CoefficientStore>,
    observers: FlatObservers,
    abort_flag: Arc<AtomicBool>,
    session_active: AtomicBool,
}

impl AutoSkyFlat {
    /// Coefficients are read from `config.coefficients_file`
    pub fn new(config: SkyFlatConfig, instruments: Instruments) -> Self {
        let coefficients = Arc::new(FileCoefficientStore::new(config.coefficients_file.clone()));
        Self::with_coefficient_store(config, instruments, coefficients)
    }

    pub fn with_coefficient_store(
        config: SkyFlatConfig,
        instruments: Instruments,
        coefficients: Arc<dyn CoefficientStore>,
    ) -> Self {
        Self {
            config,
            instruments,
            coefficients,
            observers: FlatObservers::new(),
            abort_flag: Arc::new(AtomicBool::new(false)),
            session_active: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SkyFlatConfig {
        &self.config
    }

    pub fn observers(&self) -> &FlatObservers {
        &self.observers
    }

    /// Register a callback fired after every flat
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&FlatTaken) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.observers.subscribe(callback);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_flag.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.session_active.load(Ordering::Acquire)
    }

    /// Ask the running sequence to stop and cancel any exposure in flight
    pub async fn abort(&self) {
        tracing::warn!("Sky flat abort requested");
        self.abort_flag.store(true, Ordering::SeqCst);

        if let Err(e) = self.instruments.camera.abort_exposure().await {
            tracing::warn!("Failed to abort camera exposure: {}", e);
        }
    }

    /// Take sky flats in `filter` until the twilight window closes, `max_flats`
    /// are taken, or an abort is requested.
    pub async fn get_flats(&self, filter: &str, max_flats: Option<u32>) -> Result<FlatSequenceOutcome> {
        let _guard = SessionGuard::acquire(&self.session_active)?;
        self.abort_flag.store(false, Ordering::SeqCst);
        self.config.validate()?;

        let table = self.coefficients.load()?;
        let coefficients = table.for_filter(filter)?;

        let site = &self.instruments.site;
        let mut session = LoopSession {
            filter: filter.to_string(),
            coefficients,
            correction_factor: 0.0,
            flats_taken: 0,
            dusk: site.is_afternoon(),
            positioning_degraded: false,
        };

        let altitude = site.sun_altitude(site.current_time());
        tracing::info!(
            "Starting {} sky flats in {}: Sun altitude {:.2}°, window {:.1}° to {:.1}°, max flats {:?}",
            session.twilight(),
            filter,
            altitude,
            self.config.sun_alt_low,
            self.config.sun_alt_hi,
            max_flats
        );

        if self.window_missed(altitude, session.dusk) {
            tracing::info!(
                "Sun at {:.2}° is already past the {} flat window, nothing to do",
                altitude,
                session.twilight()
            );
            return Ok(session.finish(FlatSequenceState::FilterExhausted));
        }

        let result = self.run_sequence(&mut session, max_flats).await;
        self.release_telescope(&mut session).await;

        match result {
            Ok(state) => {
                tracing::info!(
                    "Sky flats in {} finished: {:?}, {} taken, correction factor {:.2}",
                    filter,
                    state,
                    session.flats_taken,
                    session.correction_factor
                );
                Ok(session.finish(state))
            }
            Err(e) => {
                tracing::error!("Sky flats in {} failed after {} flats: {}", filter, session.flats_taken, e);
                Err(e)
            }
        }
    }

    async fn run_sequence(&self, session: &mut LoopSession, max_flats: Option<u32>) -> Result<FlatSequenceState> {
        // Wait with the telescope at the flat position
        self.position_telescope(session, false).await;

        if let Some(state) = self.wait_for_window(session).await {
            return Ok(state);
        }

        let site = self.instruments.site.clone();

        loop {
            if self.abort_requested() {
                tracing::warn!("Aborting sky flats");
                return Ok(FlatSequenceState::Aborted);
            }

            if let Some(max) = max_flats {
                if session.flats_taken >= max {
                    tracing::info!("Took all {} requested flats", max);
                    return Ok(FlatSequenceState::Complete);
                }
            }

            let altitude = site.sun_altitude(site.current_time());
            if !self.config.in_window(altitude) {
                tracing::info!("Sun at {:.2}° left the flat window", altitude);
                return Ok(FlatSequenceState::Complete);
            }

            self.position_telescope(session, self.config.tracking).await;

            let start = site.current_time();
            let estimate = compute_exposure_time(
                |elapsed| site.sun_altitude(start + chrono::Duration::milliseconds((elapsed * 1000.0).round() as i64)),
                &session.coefficients,
                session.correction_factor,
                self.config.ideal_counts,
                self.config.exptime_increment,
                self.config.exptime_max,
            );

            let plan = match estimate {
                ExposureEstimate::Planned(plan)
                    if plan.exposure_time > 0.0 && plan.exposure_time >= self.config.exptime_min =>
                {
                    plan
                }
                other => {
                    let reason = match other {
                        ExposureEstimate::Exceeded => {
                            format!("exposure would exceed {:.1}s", self.config.exptime_max)
                        }
                        ExposureEstimate::Planned(plan) => {
                            format!("exposure of {:.2}s is too short", plan.exposure_time)
                        }
                    };

                    if session.dusk {
                        tracing::info!("Sun at {:.2}°: {}, filter {} finished", altitude, reason, session.filter);
                        return Ok(FlatSequenceState::FilterExhausted);
                    }

                    tracing::debug!(
                        "Sun at {:.2}°: {}, waiting {:.1}s",
                        altitude,
                        reason,
                        self.config.retry_delay_secs
                    );
                    tokio::time::sleep(self.config.retry_delay()).await;
                    continue;
                }
            };

            let Some(sky_level) = self.take_flat(session, &plan).await? else {
                tracing::warn!("Aborting sky flats");
                return Ok(FlatSequenceState::Aborted);
            };

            let previous = session.correction_factor;
            session.correction_factor = update_correction_factor(previous, sky_level, &plan);
            session.flats_taken += 1;

            tracing::info!(
                "Flat #{} in {}: {:.2}s, mean {:.0} (predicted {:.0}), correction {:.2} -> {:.2}",
                session.flats_taken,
                session.filter,
                plan.exposure_time,
                sky_level,
                plan.predicted_integrated_counts,
                previous,
                session.correction_factor
            );

            self.observers.notify(&FlatTaken {
                filter: session.filter.clone(),
                index: session.flats_taken,
                exposure_time: plan.exposure_time,
                sky_level,
            });
        }
    }

    /// Poll the Sun until it enters the window. `Some` means the sequence
    /// ended while waiting.
    async fn wait_for_window(&self, session: &LoopSession) -> Option<FlatSequenceState> {
        let site = &self.instruments.site;
        let mut altitude = site.sun_altitude(site.current_time());

        while !self.config.in_window(altitude) {
            if self.abort_requested() {
                tracing::warn!("Aborting while waiting for the flat window");
                return Some(FlatSequenceState::Aborted);
            }

            if self.window_missed(altitude, session.dusk) {
                tracing::info!("Sun at {:.2}° skipped past the {} window", altitude, session.twilight());
                return Some(FlatSequenceState::FilterExhausted);
            }

            tokio::time::sleep(self.config.poll_interval()).await;
            altitude = site.sun_altitude(site.current_time());
            tracing::debug!(
                "Sun altitude is {:.2}°, waiting to be between {:.1}° and {:.1}°",
                altitude,
                self.config.sun_alt_low,
                self.config.sun_alt_hi
            );
        }

        None
    }

    /// At dusk the Sun only sinks, at dawn it only rises
    fn window_missed(&self, altitude: f64, dusk: bool) -> bool {
        if dusk {
            altitude <= self.config.sun_alt_low
        } else {
            altitude >= self.config.sun_alt_hi
        }
    }

    /// Expose one flat and return its mean level, or `None` if aborted
    async fn take_flat(&self, session: &LoopSession, plan: &ExposurePlan) -> Result<Option<f64>> {
        if let Some(fw) = &self.instruments.filter_wheel {
            fw.set_filter(&session.filter)
                .await
                .map_err(|e| SkyFlatError::ExposureFailure(format!("Failed to change filter: {}", e)))?;
        }

        if self.abort_requested() {
            return Ok(None);
        }

        let request = ExposureRequest::sky_flat(
            plan.exposure_time,
            Some(&session.filter),
            self.instruments.site.current_time(),
        );
        tracing::debug!("Taking sky flat {} with exptime = {:.2}s", request.filename, request.exptime);

        let frames = self.instruments.camera.expose(&request).await;

        if self.abort_requested() {
            return Ok(None);
        }

        let frames = frames.map_err(SkyFlatError::ExposureFailure)?;
        let frame = frames
            .first()
            .ok_or_else(|| SkyFlatError::ExposureFailure("Camera returned no frames".to_string()))?;

        let image = self
            .instruments
            .images
            .fetch(frame)
            .await
            .map_err(|reason| SkyFlatError::DownloadFailure {
                frame: frame.id.clone(),
                reason,
            })?;

        if image.filter.as_deref().is_some_and(|f| f != session.filter) {
            tracing::warn!(
                "Frame {} was taken in filter {:?}, expected {}",
                frame.id,
                image.filter,
                session.filter
            );
        }
        tracing::debug!(
            "Downloaded frame {}: {}x{}, {:.2}s",
            frame.id,
            image.width,
            image.height,
            image.exposure_secs
        );

        mean_sky_level(&image)
            .map(Some)
            .ok_or_else(|| SkyFlatError::ExposureFailure(format!("Frame {} has no pixels", frame.id)))
    }

    /// Best effort: failures are logged and mark the session as degraded
    async fn position_telescope(&self, session: &mut LoopSession, tracking: bool) {
        let telescope = &self.instruments.telescope;
        let (flat_alt, flat_az) = (self.config.flat_alt, self.config.flat_az);

        if let Some(side) = self.config.pier_side {
            if let Err(e) = telescope.set_pier_side(side).await {
                tracing::warn!("Failed to set pier side {:?}: {}", side, e);
                session.positioning_degraded = true;
            }
        }

        let needs_slew = match telescope.current_alt_az().await {
            Ok((alt, az)) => {
                let separation = angular_separation(alt, az, flat_alt, flat_az);
                if separation > self.config.flat_position_max {
                    true
                } else {
                    tracing::debug!("Telescope is {:.2}° from the flat position, not slewing", separation);
                    false
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read telescope position: {}", e);
                true
            }
        };

        if needs_slew {
            tracing::debug!("Slewing telescope to alt {:.2}° az {:.2}°", flat_alt, flat_az);
            if let Err(e) = telescope.slew_to_alt_az(flat_alt, flat_az).await {
                tracing::warn!("Error moving the telescope: {}", e);
                session.positioning_degraded = true;
            }
        }

        if tracking {
            if !self.start_tracking().await {
                session.positioning_degraded = true;
            }
        } else if let Err(e) = telescope.stop_tracking().await {
            tracing::warn!("Error stopping telescope tracking: {}", e);
            session.positioning_degraded = true;
        }

        if let Some(dome) = &self.instruments.dome {
            if let Err(e) = dome.track().await {
                tracing::warn!("Failed to slave the dome: {}", e);
                session.positioning_degraded = true;
            }
        }
    }

    async fn start_tracking(&self) -> bool {
        let telescope = &self.instruments.telescope;

        if let Err(e) = telescope.start_tracking().await {
            tracing::warn!("Error starting telescope tracking: {}", e);
            return false;
        }

        for _ in 0..self.config.tracking_wait_polls.max(1) {
            match telescope.is_tracking().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Error reading tracking state: {}", e);
                    return false;
                }
            }
            tokio::time::sleep(TRACKING_POLL_INTERVAL).await;
        }

        tracing::warn!("Telescope did not report tracking after start");
        false
    }

    async fn release_telescope(&self, session: &mut LoopSession) {
        tracing::debug!("Stopping telescope tracking");
        if let Err(e) = self.instruments.telescope.stop_tracking().await {
            tracing::warn!("Error stopping telescope tracking: {}", e);
            session.positioning_degraded = true;
        }
    }
}

/// Great circle distance between two horizontal positions (degrees)
pub fn angular_separation(alt1: f64, az1: f64, alt2: f64, az2: f64) -> f64 {
    let (alt1, alt2) = (alt1.to_radians(), alt2.to_radians());
    let delta_az = (az1 - az2).to_radians();

    let cos_sep = alt1.sin() * alt2.sin() + alt1.cos() * alt2.cos() * delta_az.cos();
    cos_sep.clamp(-1.0, 1.0).acos().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::CoefficientTable;
    use crate::sim::{SimCamera, SimObservatory, SimSite, SimTelescope};
    use std::sync::Mutex;

    fn coefficients() -> SkyModelCoefficients {
        SkyModelCoefficients::new(2_000_000.0, 68.0, 17.0)
    }

    fn table() -> Arc<CoefficientTable> {
        let mut table = CoefficientTable::new();
        table.insert("R", coefficients());
        Arc::new(table)
    }

    fn config() -> SkyFlatConfig {
        SkyFlatConfig {
            sun_alt_hi: -5.0,
            sun_alt_low: -12.0,
            exptime_max: 60.0,
            ..SkyFlatConfig::default()
        }
    }

    fn observatory(site: SimSite) -> SimObservatory {
        SimObservatory::new(site, coefficients())
    }

    fn controller(obs: &SimObservatory, config: SkyFlatConfig) -> AutoSkyFlat {
        AutoSkyFlat::with_coefficient_store(config, obs.instruments(), table())
    }

    fn record(flats: &AutoSkyFlat) -> Arc<Mutex<Vec<FlatTaken>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        flats.subscribe(move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        });
        events
    }

    #[test]
    fn test_angular_separation() {
        assert!(angular_separation(89.0, 0.0, 89.0, 0.0).abs() < 1e-9);
        assert!((angular_separation(0.0, 0.0, 0.0, 90.0) - 90.0).abs() < 1e-9);
        assert!((angular_separation(45.0, 10.0, 50.0, 10.0) - 5.0).abs() < 1e-9);
        // Near zenith azimuth barely matters
        assert!(angular_separation(89.5, 0.0, 89.5, 180.0) < 1.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_at_flat_count() {
        let obs = observatory(SimSite::dusk(-6.0, 0.0));
        let flats = controller(&obs, config());
        let events = record(&flats);

        let outcome = flats.get_flats("R", Some(3)).await.unwrap();

        assert_eq!(outcome.state, FlatSequenceState::Complete);
        assert_eq!(outcome.flats_taken, 3);
        assert_eq!(obs.camera.exposures(), 3);
        assert!(obs.telescope.stop_tracking_calls() >= 1);
        assert!(!outcome.positioning_degraded);

        let events = events.lock().unwrap();
        let indices: Vec<u32> = events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        for e in events.iter() {
            assert_eq!(e.filter, "R");
            assert!((e.exposure_time - 15.4).abs() < 1.0);
            assert!((e.sky_level - 25_000.0).abs() < 1_000.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_correction_factor_tracks_brighter_sky() {
        let site = SimSite::dusk(-6.0, 0.0);
        let obs = SimObservatory::with_camera(site.clone(), SimCamera::new(site, coefficients()).with_sky_factor(1.2));
        let flats = controller(&obs, config());
        let events = record(&flats);

        let outcome = flats.get_flats("R", Some(2)).await.unwrap();

        assert_eq!(outcome.flats_taken, 2);
        // Measured ~20% above the model: roughly +0.2 * 1633 counts/s
        assert!(outcome.correction_factor > 250.0 && outcome.correction_factor < 400.0);

        let events = events.lock().unwrap();
        assert!(events[1].exposure_time < events[0].exposure_time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_waiting() {
        // Dusk, Sun still above the window
        let obs = observatory(SimSite::dusk(2.0, 0.0));
        let flats = Arc::new(controller(&obs, config()));

        let runner = flats.clone();
        let handle = tokio::spawn(async move { runner.get_flats("R", None).await });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(flats.is_running());
        flats.abort().await;

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.state, FlatSequenceState::Aborted);
        assert_eq!(outcome.flats_taken, 0);
        assert_eq!(obs.camera.exposures(), 0);
        assert_eq!(obs.camera.aborts(), 1);
        assert!(obs.telescope.stop_tracking_calls() >= 1);
        assert!(!flats.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_exposure_discards_frame() {
        let obs = observatory(SimSite::dusk(-6.0, 0.0));
        let flats = Arc::new(controller(&obs, config()));
        let events = record(&flats);

        let runner = flats.clone();
        let handle = tokio::spawn(async move { runner.get_flats("R", None).await });

        // First exposure is ~15s long
        tokio::time::sleep(Duration::from_secs(5)).await;
        flats.abort().await;

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.state, FlatSequenceState::Aborted);
        assert_eq!(outcome.flats_taken, 0);
        assert_eq!(obs.camera.exposures(), 1);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_dusk_window() {
        let obs = observatory(SimSite::dusk(-20.0, -0.01));
        let flats = controller(&obs, config());

        let started = tokio::time::Instant::now();
        let outcome = flats.get_flats("R", None).await.unwrap();

        assert_eq!(outcome.state, FlatSequenceState::FilterExhausted);
        assert_eq!(outcome.flats_taken, 0);
        assert_eq!(obs.camera.exposures(), 0);
        assert_eq!(obs.telescope.slews(), 0);
        assert_eq!(tokio::time::Instant::now(), started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_dawn_window() {
        let obs = observatory(SimSite::dawn(-1.0, 0.01));
        let flats = controller(&obs, config());

        let started = tokio::time::Instant::now();
        let outcome = flats.get_flats("R", Some(5)).await.unwrap();

        assert_eq!(outcome.state, FlatSequenceState::FilterExhausted);
        assert_eq!(obs.camera.exposures(), 0);
        assert_eq!(tokio::time::Instant::now(), started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_dusk_window() {
        // Enters the window after ~50s
        let obs = observatory(SimSite::dusk(-4.5, -0.01));
        let flats = controller(&obs, config());

        let started = tokio::time::Instant::now();
        let outcome = flats.get_flats("R", Some(1)).await.unwrap();

        assert_eq!(outcome.state, FlatSequenceState::Complete);
        assert_eq!(outcome.flats_taken, 1);
        assert!(started.elapsed() >= Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dusk_too_dark_exhausts_filter() {
        // ~800s needed at -10°, cap is 60s
        let obs = observatory(SimSite::dusk(-10.0, -0.01));
        let flats = controller(&obs, config());

        let outcome = flats.get_flats("R", None).await.unwrap();

        assert_eq!(outcome.state, FlatSequenceState::FilterExhausted);
        assert_eq!(outcome.flats_taken, 0);
        assert_eq!(obs.camera.exposures(), 0);
        assert!(obs.telescope.stop_tracking_calls() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dawn_waits_until_bright_enough() {
        // Too dark at -10°, feasible once past about -7.2°
        let obs = observatory(SimSite::dawn(-10.0, 0.01));
        let flats = controller(&obs, config());

        let started = tokio::time::Instant::now();
        let outcome = flats.get_flats("R", Some(2)).await.unwrap();

        assert_eq!(outcome.state, FlatSequenceState::Complete);
        assert_eq!(outcome.flats_taken, 2);
        assert_eq!(obs.camera.exposures(), 2);
        assert!(started.elapsed() >= Duration::from_secs(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dusk_too_short_exhausts_filter() {
        let obs = observatory(SimSite::dusk(-6.0, 0.0));
        let flats = controller(
            &obs,
            SkyFlatConfig {
                exptime_min: 20.0,
                ..config()
            },
        );

        let outcome = flats.get_flats("R", None).await.unwrap();
        assert_eq!(outcome.state, FlatSequenceState::FilterExhausted);
        assert_eq!(obs.camera.exposures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dawn_too_short_waits_without_using_slots() {
        // ~15s plans at -6°, getting shorter as the Sun rises
        let obs = observatory(SimSite::dawn(-6.0, 0.01));
        let flats = controller(
            &obs,
            SkyFlatConfig {
                exptime_min: 20.0,
                ..config()
            },
        );

        let started = tokio::time::Instant::now();
        let outcome = flats.get_flats("R", Some(3)).await.unwrap();

        assert_eq!(outcome.state, FlatSequenceState::Complete);
        assert_eq!(outcome.flats_taken, 0);
        assert_eq!(obs.camera.exposures(), 0);
        // Kept replanning until the Sun rose out of the window at -5°
        assert!(started.elapsed() >= Duration::from_secs(90));
        assert!(obs.telescope.stop_tracking_calls() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_dawn_retry() {
        // Too dark for a 60s flat until roughly -7.4°
        let obs = observatory(SimSite::dawn(-10.0, 0.01));
        let flats = Arc::new(controller(&obs, config()));

        let runner = flats.clone();
        let handle = tokio::spawn(async move { runner.get_flats("R", None).await });

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(flats.is_running());
        flats.abort().await;

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.state, FlatSequenceState::Aborted);
        assert_eq!(outcome.flats_taken, 0);
        assert_eq!(obs.camera.exposures(), 0);
        assert!(obs.telescope.stop_tracking_calls() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_when_sun_leaves_window() {
        // Dawn, rising fast enough to leave the window after a few flats
        let obs = observatory(SimSite::dawn(-6.0, 0.02));
        let flats = controller(&obs, config());

        let outcome = flats.get_flats("R", None).await.unwrap();

        assert_eq!(outcome.state, FlatSequenceState::Complete);
        assert!(outcome.flats_taken >= 1);
        assert_eq!(outcome.flats_taken, obs.camera.exposures());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_session_rejected() {
        let obs = observatory(SimSite::dusk(2.0, 0.0));
        let flats = Arc::new(controller(&obs, config()));

        let runner = flats.clone();
        let handle = tokio::spawn(async move { runner.get_flats("R", None).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let second = flats.get_flats("R", None).await;
        assert!(matches!(second, Err(SkyFlatError::SessionActive)));

        flats.abort().await;
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.state, FlatSequenceState::Aborted);

        // The binding is free again once the first session returned
        assert!(!flats.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exposure_failure_is_surfaced() {
        let site = SimSite::dusk(-6.0, 0.0);
        let obs = SimObservatory::with_camera(site.clone(), SimCamera::new(site, coefficients()).without_frames());
        let flats = controller(&obs, config());

        let result = flats.get_flats("R", Some(3)).await;
        assert!(matches!(result, Err(SkyFlatError::ExposureFailure(_))));
        assert!(obs.telescope.stop_tracking_calls() >= 1);
        assert!(!flats.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_failure_is_surfaced() {
        let site = SimSite::dusk(-6.0, 0.0);
        let obs = SimObservatory::with_camera(
            site.clone(),
            SimCamera::new(site, coefficients()).with_failing_downloads(),
        );
        let flats = controller(&obs, config());

        let result = flats.get_flats("R", Some(2)).await;
        assert!(matches!(result, Err(SkyFlatError::DownloadFailure { .. })));
        assert_eq!(obs.camera.exposures(), 1);
        assert!(obs.telescope.stop_tracking_calls() >= 1);
        assert!(!flats.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let obs = observatory(SimSite::dawn(-10.0, 0.01));
        let flats = controller(
            &obs,
            SkyFlatConfig {
                retry_delay_secs: -1.0,
                ..config()
            },
        );
        assert_eq!(flats.config().retry_delay_secs, -1.0);

        let result = flats.get_flats("R", Some(1)).await;
        assert!(matches!(result, Err(SkyFlatError::InvalidConfig(_))));
        assert_eq!(obs.camera.exposures(), 0);
        assert_eq!(obs.telescope.slews(), 0);
        assert!(!flats.is_running());

        let flats = controller(
            &obs,
            SkyFlatConfig {
                poll_interval_secs: f64::NAN,
                ..config()
            },
        );
        assert!(matches!(flats.get_flats("R", Some(1)).await, Err(SkyFlatError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_filter_fails_fast() {
        let obs = observatory(SimSite::dusk(-6.0, 0.0));
        let flats = controller(&obs, config());

        let result = flats.get_flats("Ha", None).await;
        assert!(matches!(result, Err(SkyFlatError::UnknownFilter(_))));
        assert_eq!(obs.telescope.slews(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_coefficients_file_fails_fast() {
        let path = std::env::temp_dir().join(format!("skyflat-bad-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"R": [-1.0, 68.0, 17.0]}"#).unwrap();

        let obs = observatory(SimSite::dusk(-6.0, 0.0));
        let flats = AutoSkyFlat::new(
            SkyFlatConfig {
                coefficients_file: path.clone(),
                ..config()
            },
            obs.instruments(),
        );

        let result = flats.get_flats("R", None).await;
        assert!(matches!(result, Err(SkyFlatError::MalformedCoefficients { .. })));
        assert_eq!(obs.camera.exposures(), 0);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_positioning_failure_is_tolerated() {
        let site = SimSite::dusk(-6.0, 0.0);
        let obs = SimObservatory::with_telescope(site, coefficients(), SimTelescope::new().with_failing_slews());
        let flats = controller(&obs, config());

        let outcome = flats.get_flats("R", Some(1)).await.unwrap();
        assert_eq!(outcome.state, FlatSequenceState::Complete);
        assert_eq!(outcome.flats_taken, 1);
        assert!(outcome.positioning_degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_slew_near_flat_position() {
        let site = SimSite::dusk(-6.0, 0.0);
        let obs = SimObservatory::with_telescope(site, coefficients(), SimTelescope::new().pointing_at(88.0, 0.0));
        let flats = controller(&obs, config());

        flats.get_flats("R", Some(2)).await.unwrap();
        assert_eq!(obs.telescope.slews(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_pier_side_and_dome() {
        let obs = observatory(SimSite::dusk(-6.0, 0.0));
        let flats = controller(
            &obs,
            SkyFlatConfig {
                tracking: true,
                pier_side: Some(crate::device_ops::PierSide::East),
                ..config()
            },
        );

        flats.get_flats("R", Some(1)).await.unwrap();

        assert!(obs.telescope.start_tracking_calls() >= 1);
        assert_eq!(obs.telescope.pier_side(), Some(crate::device_ops::PierSide::East));
        assert!(obs.dome.track_calls() >= 1);
        assert_eq!(obs.filter_wheel.current().as_deref(), Some("R"));
        // Released at the end
        assert!(!obs.telescope.tracking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_subscriber_does_not_stop_sequence() {
        let obs = observatory(SimSite::dusk(-6.0, 0.0));
        let flats = controller(&obs, config());
        flats.subscribe(|_| Err("archive offline".to_string()));
        flats.subscribe(|_| panic!("subscriber bug"));
        let events = record(&flats);

        assert_eq!(flats.observers().len(), 3);

        let outcome = flats.get_flats("R", Some(2)).await.unwrap();
        assert_eq!(outcome.state, FlatSequenceState::Complete);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_flag_reset_on_new_session() {
        let obs = observatory(SimSite::dusk(-6.0, 0.0));
        let flats = controller(&obs, config());

        flats.abort().await;
        assert!(flats.abort_requested());

        let outcome = flats.get_flats("R", Some(1)).await.unwrap();
        assert_eq!(outcome.state, FlatSequenceState::Complete);
        assert_eq!(outcome.flats_taken, 1);
    }
}
