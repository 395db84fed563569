//! Observing site with a low precision solar ephemeris
//!
//! Accurate to a few tenths of a degree, which is plenty for deciding when
//! twilight flats can start and for the brightness model.

use crate::device_ops::Site;
use chrono::{DateTime, Timelike, Utc};

/// A fixed site on Earth
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservatorySite {
    /// Geodetic latitude (degrees, north positive)
    pub latitude: f64,
    /// Longitude (degrees, east positive)
    pub longitude: f64,
}

impl ObservatorySite {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Local mean solar time in hours, 0..24
    pub fn local_solar_hour(&self, at: DateTime<Utc>) -> f64 {
        let utc_hours = at.hour() as f64 + at.minute() as f64 / 60.0 + at.second() as f64 / 3600.0;
        (utc_hours + self.longitude / 15.0).rem_euclid(24.0)
    }
}

impl Site for ObservatorySite {
    fn sun_altitude(&self, at: DateTime<Utc>) -> f64 {
        let jd = julian_day(&at);
        let (sun_ra, sun_dec) = sun_equatorial(jd);

        let lst_deg = local_sidereal_time(jd, self.longitude) * 15.0;
        let ha_rad = (lst_deg - sun_ra).to_radians();
        let dec_rad = sun_dec.to_radians();
        let lat_rad = self.latitude.to_radians();

        (lat_rad.sin() * dec_rad.sin() + lat_rad.cos() * dec_rad.cos() * ha_rad.cos())
            .clamp(-1.0, 1.0)
            .asin()
            .to_degrees()
    }

    fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn is_afternoon(&self) -> bool {
        self.local_solar_hour(self.current_time()) >= 12.0
    }
}

/// Sun right ascension and declination in degrees
fn sun_equatorial(jd: f64) -> (f64, f64) {
    let days_since_j2000 = jd - 2451545.0;
    let mean_longitude = (280.460 + 0.9856474 * days_since_j2000).rem_euclid(360.0);
    let mean_anomaly = (357.528 + 0.9856003 * days_since_j2000).rem_euclid(360.0).to_radians();

    let ecliptic_longitude = (mean_longitude
        + 1.915 * mean_anomaly.sin()
        + 0.020 * (2.0 * mean_anomaly).sin())
    .to_radians();
    let obliquity = (23.439 - 0.0000004 * days_since_j2000).to_radians();

    let ra = (obliquity.cos() * ecliptic_longitude.sin())
        .atan2(ecliptic_longitude.cos())
        .to_degrees()
        .rem_euclid(360.0);
    let dec = (obliquity.sin() * ecliptic_longitude.sin()).asin().to_degrees();
    (ra, dec)
}

/// Calculate Julian Day from a chrono DateTime
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 86_400_000.0 + 2440587.5
}

/// Local sidereal time in hours
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let t = (jd - 2451545.0) / 36525.0;

    // Greenwich Mean Sidereal Time in degrees
    let gmst = 280.46061837 + 360.98564736629 * (jd - 2451545.0) + 0.000387933 * t * t
        - t * t * t / 38710000.0;

    (gmst + longitude).rem_euclid(360.0) / 15.0
}
