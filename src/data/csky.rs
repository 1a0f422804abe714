//! Modelled clear-sky irradiance for a site.
//!
//! Sun position follows Spencer's declination and equation of time, the
//! clear-sky beam and diffuse components a simplified Bird model, and the
//! plane-of-array value an isotropic-sky transposition with ground
//! reflection. Fixed-tilt arrays and single-axis trackers (optionally
//! backtracking) are supported.

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::groups::ColumnGroups;
use super::model::TimeSeriesFrame;
use crate::error::{CapTestError, Result};

/// Modelled plane-of-array irradiance column.
pub const POA_CSKY: &str = "poa_mod_csky";
/// Modelled global horizontal irradiance column.
pub const GHI_CSKY: &str = "ghi_mod_csky";

const SOLAR_CONSTANT: f64 = 1361.0;
const DEG: f64 = PI / 180.0;
/// Linke-style turbidity of a typical continental atmosphere.
const TURBIDITY: f64 = 3.0;

// ---------------------------------------------------------------------------
// Site and array description
// ---------------------------------------------------------------------------

/// Time zone of the naive timestamps in the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeZoneSpec {
    /// Fixed offset in hours from UTC, e.g. `-6`.
    Hours(f64),
    /// IANA zone name, e.g. `"America/Chicago"`.
    Name(String),
}

impl Default for TimeZoneSpec {
    fn default() -> Self {
        TimeZoneSpec::Name("UTC".to_string())
    }
}

enum Zone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl TimeZoneSpec {
    fn zone(&self) -> Result<Zone> {
        match self {
            TimeZoneSpec::Hours(h) => {
                let secs = (h * 3600.0).round();
                FixedOffset::east_opt(secs as i32)
                    .filter(|_| secs.abs() < 86_400.0)
                    .map(Zone::Fixed)
                    .ok_or_else(|| {
                        CapTestError::InvalidArgument(format!("UTC offset of {h} hours is out of range"))
                    })
            }
            TimeZoneSpec::Name(name) => name.parse::<Tz>().map(Zone::Named).map_err(|e| {
                CapTestError::InvalidArgument(format!("unknown time zone '{name}': {e}"))
            }),
        }
    }
}

impl Zone {
    /// `None` for local times skipped by a daylight-saving change. Repeated
    /// local times resolve to the first occurrence.
    fn to_utc(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Zone::Fixed(offset) => offset
                .from_local_datetime(&local)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
            Zone::Named(tz) => tz
                .from_local_datetime(&local)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level.
    #[serde(default)]
    pub altitude: f64,
    #[serde(default)]
    pub tz: TimeZoneSpec,
}

fn default_albedo() -> f64 {
    0.2
}

fn default_max_angle() -> f64 {
    90.0
}

fn default_gcr() -> f64 {
    2.0 / 7.0
}

/// Array mounting. Angles in degrees, azimuths clockwise from north.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum System {
    Tracker {
        axis_tilt: f64,
        axis_azimuth: f64,
        #[serde(default = "default_max_angle")]
        max_angle: f64,
        #[serde(default)]
        backtrack: bool,
        /// Ground coverage ratio, used when backtracking.
        #[serde(default = "default_gcr")]
        gcr: f64,
        #[serde(default = "default_albedo")]
        albedo: f64,
    },
    Fixed {
        surface_tilt: f64,
        surface_azimuth: f64,
        #[serde(default = "default_albedo")]
        albedo: f64,
    },
}

/// Location and array used to model clear-sky irradiance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearSkyConfig {
    pub loc: Location,
    pub sys: System,
}

// ---------------------------------------------------------------------------
// Sun position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarPosition {
    pub zenith: f64,
    pub azimuth: f64,
    pub elevation: f64,
}

pub fn solar_position(utc: DateTime<Utc>, latitude: f64, longitude: f64) -> SolarPosition {
    let doy = f64::from(utc.ordinal());
    let hours = f64::from(utc.hour())
        + f64::from(utc.minute()) / 60.0
        + f64::from(utc.second()) / 3600.0;
    let b = day_angle(doy);

    let decl = 0.006918 - 0.399912 * b.cos() + 0.070257 * b.sin()
        - 0.006758 * (2.0 * b).cos()
        + 0.000907 * (2.0 * b).sin()
        - 0.002697 * (3.0 * b).cos()
        + 0.00148 * (3.0 * b).sin();
    let eot_min = 229.18
        * (0.000075 + 0.001868 * b.cos()
            - 0.032077 * b.sin()
            - 0.014615 * (2.0 * b).cos()
            - 0.04089 * (2.0 * b).sin());

    let solar_time = hours + longitude / 15.0 + eot_min / 60.0;
    let hour_angle = ((15.0 * (solar_time - 12.0) + 180.0).rem_euclid(360.0) - 180.0) * DEG;

    let lat = latitude * DEG;
    let sin_elev = (lat.sin() * decl.sin() + lat.cos() * decl.cos() * hour_angle.cos()).clamp(-1.0, 1.0);
    let elev = sin_elev.asin();

    let denom = elev.cos() * lat.cos();
    let cos_az = if denom.abs() > 1e-9 {
        ((decl.sin() - sin_elev * lat.sin()) / denom).clamp(-1.0, 1.0)
    } else {
        1.0
    };
    let az = cos_az.acos() / DEG;
    let azimuth = if hour_angle > 0.0 { 360.0 - az } else { az };

    SolarPosition {
        zenith: 90.0 - elev / DEG,
        azimuth,
        elevation: elev / DEG,
    }
}

fn day_angle(doy: f64) -> f64 {
    2.0 * PI * (doy - 1.0) / 365.0
}

// ---------------------------------------------------------------------------
// Clear-sky irradiance
// ---------------------------------------------------------------------------

/// Clear-sky components in W/m².
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Irradiance {
    pub ghi: f64,
    pub dni: f64,
    pub dhi: f64,
}

/// Simplified Bird clear-sky model.
pub fn clear_sky(pos: &SolarPosition, doy: u32, altitude: f64) -> Irradiance {
    if pos.elevation <= 0.0 {
        return Irradiance::default();
    }
    let b = day_angle(f64::from(doy));
    let e0 = SOLAR_CONSTANT
        * (1.00011 + 0.034221 * b.cos() + 0.00128 * b.sin() + 0.000719 * (2.0 * b).cos()
            + 0.000077 * (2.0 * b).sin());

    let cos_z = (pos.zenith * DEG).cos();
    // Kasten and Young, corrected for site pressure
    let am = (1.0 / (cos_z + 0.50572 * (96.07995 - pos.zenith).powf(-1.6364))).max(1.0);
    let am_p = am * (-altitude / 8434.5).exp();

    let t_rayleigh = (-0.0903 * am_p.powf(0.84) * (1.0 + am_p - am_p.powf(1.01))).exp();
    let t_ozone = 1.0 - 0.0013 * am;
    let t_aerosol = (-0.09 * TURBIDITY.powf(0.978) * am_p.powf(0.9455)).exp();
    let t_water = 1.0 - 0.0075 * am.powf(0.65);
    let t_absorb = 1.0 - 0.1 * (1.0 - am_p + am_p.powf(1.06)) * (1.0 - t_aerosol);
    let t_scatter = t_aerosol / t_absorb;

    let dni = 0.9662 * e0 * t_rayleigh * t_ozone * t_aerosol * t_water;
    let dhi = 0.79 * e0 * cos_z * t_ozone * t_water * t_absorb
        * (0.5 * (1.0 - t_rayleigh) + 0.84 * (1.0 - t_scatter))
        / (1.0 - am_p + am_p.powf(1.02));
    let dhi = dhi.max(0.0);
    Irradiance {
        ghi: dni * cos_z + dhi,
        dni,
        dhi,
    }
}

// ---------------------------------------------------------------------------
// Array orientation and transposition
// ---------------------------------------------------------------------------

impl System {
    fn albedo(&self) -> f64 {
        match self {
            System::Tracker { albedo, .. } | System::Fixed { albedo, .. } => *albedo,
        }
    }

    /// Surface `(tilt, azimuth)` in degrees with the sun at `pos`.
    pub fn orientation(&self, pos: &SolarPosition) -> (f64, f64) {
        match *self {
            System::Fixed {
                surface_tilt,
                surface_azimuth,
                ..
            } => (surface_tilt, surface_azimuth),
            System::Tracker {
                axis_tilt,
                axis_azimuth,
                max_angle,
                backtrack,
                gcr,
                ..
            } => {
                let ideal = if pos.elevation <= 0.0 {
                    0.0
                } else {
                    tracker_rotation(pos, axis_tilt, axis_azimuth, backtrack, gcr)
                };
                let rotation = ideal.clamp(-max_angle, max_angle);
                let (r, beta) = (rotation * DEG, axis_tilt * DEG);
                let tilt = (r.cos() * beta.cos()).clamp(-1.0, 1.0).acos() / DEG;
                let azimuth = if tilt.abs() < 1e-9 {
                    axis_azimuth
                } else {
                    axis_azimuth + r.sin().atan2(beta.sin() * r.cos()) / DEG
                };
                (tilt, azimuth.rem_euclid(360.0))
            }
        }
    }

    /// Plane-of-array irradiance for the given sun position and sky.
    pub fn poa(&self, pos: &SolarPosition, sky: &Irradiance) -> f64 {
        if pos.elevation <= 0.0 {
            return 0.0;
        }
        let (tilt, azimuth) = self.orientation(pos);
        let (t, z) = (tilt * DEG, pos.zenith * DEG);
        let cos_aoi = (z.cos() * t.cos() + z.sin() * t.sin() * ((pos.azimuth - azimuth) * DEG).cos()).max(0.0);
        let beam = sky.dni * cos_aoi;
        let diffuse = sky.dhi * (1.0 + t.cos()) / 2.0;
        let ground = sky.ghi * self.albedo() * (1.0 - t.cos()) / 2.0;
        (beam + diffuse + ground).max(0.0)
    }
}

/// Rotation in degrees about the tracker axis that points the array at the
/// sun; positive rotation tilts the surface clockwise of the axis azimuth.
fn tracker_rotation(pos: &SolarPosition, axis_tilt: f64, axis_azimuth: f64, backtrack: bool, gcr: f64) -> f64 {
    let (z, rel_az, beta) = (
        pos.zenith * DEG,
        (pos.azimuth - axis_azimuth) * DEG,
        axis_tilt * DEG,
    );
    let ideal = (z.sin() * rel_az.sin()).atan2(z.sin() * rel_az.cos() * beta.sin() + z.cos() * beta.cos());
    if !backtrack || gcr <= 0.0 {
        return ideal / DEG;
    }
    // rows shade each other once |cos R| / gcr drops below one
    let temp = (ideal.cos() / gcr).clamp(-1.0, 1.0);
    let correction = -ideal.signum() * temp.acos();
    (ideal + correction) / DEG
}

// ---------------------------------------------------------------------------
// Frame integration
// ---------------------------------------------------------------------------

impl ClearSkyConfig {
    /// Modelled `(poa, ghi)` for each local timestamp. Timestamps that do
    /// not exist in the site's time zone give `NaN`.
    pub fn model(&self, index: &[NaiveDateTime]) -> Result<(Vec<f64>, Vec<f64>)> {
        let zone = self.loc.tz.zone()?;
        let mut poa = Vec::with_capacity(index.len());
        let mut ghi = Vec::with_capacity(index.len());
        for &local in index {
            let Some(utc) = zone.to_utc(local) else {
                poa.push(f64::NAN);
                ghi.push(f64::NAN);
                continue;
            };
            let pos = solar_position(utc, self.loc.latitude, self.loc.longitude);
            let sky = clear_sky(&pos, utc.ordinal(), self.loc.altitude);
            poa.push(self.sys.poa(&pos, &sky));
            ghi.push(sky.ghi);
        }
        Ok((poa, ghi))
    }
}

/// Add the modelled clear-sky columns to `frame`.
pub fn append_csky(frame: &mut TimeSeriesFrame, cfg: &ClearSkyConfig) -> Result<()> {
    let (poa, ghi) = cfg.model(frame.index())?;
    let skipped = poa.iter().filter(|v| v.is_nan()).count();
    if skipped > 0 {
        log::warn!("{skipped} timestamps do not exist in the site time zone; clear-sky values are NaN");
    }
    frame.insert_column(POA_CSKY, poa)?;
    frame.insert_column(GHI_CSKY, ghi)?;
    Ok(())
}

/// Register the clear-sky columns under the ids `ColumnGroups::infer`
/// gives them.
pub fn add_csky_groups(groups: &mut ColumnGroups) {
    groups.insert("irr_poa_clear_sky", vec![POA_CSKY.to_string()]);
    groups.insert("irr_ghi_clear_sky", vec![GHI_CSKY.to_string()]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn fixed(tilt: f64) -> System {
        System::Fixed {
            surface_tilt: tilt,
            surface_azimuth: 180.0,
            albedo: 0.2,
        }
    }

    fn site(lat: f64, lon: f64, tz: TimeZoneSpec, sys: System) -> ClearSkyConfig {
        ClearSkyConfig {
            loc: Location {
                latitude: lat,
                longitude: lon,
                altitude: 0.0,
                tz,
            },
            sys,
        }
    }

    #[test]
    fn equinox_noon_on_the_equator_is_overhead() {
        let utc = local(2022, 3, 21, 12, 7).and_utc();
        let pos = solar_position(utc, 0.0, 0.0);
        assert!(pos.zenith < 2.0, "{pos:?}");
        let midnight = solar_position(local(2022, 3, 21, 0, 0).and_utc(), 0.0, 0.0);
        assert!(midnight.elevation < -80.0);
        assert_eq!(clear_sky(&midnight, 80, 0.0), Irradiance::default());
    }

    #[test]
    fn morning_sun_is_in_the_east() {
        let pos = solar_position(local(2022, 6, 21, 8, 0).and_utc(), 33.0, 0.0);
        assert!(pos.azimuth > 45.0 && pos.azimuth < 120.0, "{pos:?}");
        assert!(pos.elevation > 20.0 && pos.elevation < 50.0, "{pos:?}");
    }

    #[test]
    fn summer_noon_clear_sky_levels() {
        let cfg = site(45.0, 7.3, TimeZoneSpec::Name("Europe/Rome".into()), fixed(30.0));
        let (poa, ghi) = cfg.model(&[local(2022, 6, 21, 13, 30), local(2022, 6, 21, 23, 0)]).unwrap();
        assert!(ghi[0] > 850.0 && ghi[0] < 1250.0, "{}", ghi[0]);
        assert!(poa[0] > 850.0 && poa[0] < 1300.0, "{}", poa[0]);
        assert_eq!((poa[1], ghi[1]), (0.0, 0.0));

        // the same instant given as a fixed offset
        let offset = site(45.0, 7.3, TimeZoneSpec::Hours(2.0), fixed(30.0));
        let (poa2, _) = offset.model(&[local(2022, 6, 21, 13, 30)]).unwrap();
        assert!((poa2[0] - poa[0]).abs() < 1e-9);
    }

    #[test]
    fn altitude_raises_clear_sky_beam() {
        let pos = solar_position(local(2022, 6, 21, 12, 0).and_utc(), 40.0, 0.0);
        let low = clear_sky(&pos, 172, 0.0);
        let high = clear_sky(&pos, 172, 2000.0);
        assert!(high.dni > low.dni);
    }

    #[test]
    fn tracker_beats_flat_plate_in_the_morning() {
        let tracker = System::Tracker {
            axis_tilt: 0.0,
            axis_azimuth: 180.0,
            max_angle: 45.0,
            backtrack: false,
            gcr: 0.4,
            albedo: 0.2,
        };
        let pos = solar_position(local(2022, 6, 21, 8, 0).and_utc(), 33.0, 0.0);
        let sky = clear_sky(&pos, 172, 0.0);
        assert!(tracker.poa(&pos, &sky) > fixed(0.0).poa(&pos, &sky));

        let (tilt, azimuth) = tracker.orientation(&pos);
        assert!((tilt - 45.0).abs() < 1e-6, "{tilt}");
        assert!((azimuth - 90.0).abs() < 1e-6, "{azimuth}");
    }

    #[test]
    fn backtracking_flattens_low_sun_rotation() {
        let make = |backtrack| System::Tracker {
            axis_tilt: 0.0,
            axis_azimuth: 180.0,
            max_angle: 90.0,
            backtrack,
            gcr: 0.4,
            albedo: 0.2,
        };
        let pos = solar_position(local(2022, 6, 21, 6, 0).and_utc(), 33.0, 0.0);
        assert!(pos.elevation > 0.0 && pos.elevation < 20.0, "{pos:?}");
        let (ideal, _) = make(false).orientation(&pos);
        let (backtracked, _) = make(true).orientation(&pos);
        assert!(backtracked < ideal, "{backtracked} vs {ideal}");
    }

    #[test]
    fn skipped_local_time_is_nan() {
        let cfg = site(40.7, -74.0, TimeZoneSpec::Name("America/New_York".into()), fixed(20.0));
        let (poa, ghi) = cfg.model(&[local(2022, 3, 13, 2, 30)]).unwrap();
        assert!(poa[0].is_nan() && ghi[0].is_nan());
    }

    #[test]
    fn bad_time_zone_is_an_error() {
        let cfg = site(40.0, -100.0, TimeZoneSpec::Name("Mars/Olympus".into()), fixed(20.0));
        assert!(matches!(cfg.model(&[]), Err(CapTestError::InvalidArgument(_))));
        let cfg = site(40.0, -100.0, TimeZoneSpec::Hours(30.0), fixed(20.0));
        assert!(cfg.model(&[]).is_err());
    }

    #[test]
    fn system_reads_fixed_or_tracker() {
        let fixed: System =
            serde_json::from_str(r#"{"surface_tilt": 20, "surface_azimuth": 180}"#).unwrap();
        assert_eq!(
            fixed,
            System::Fixed {
                surface_tilt: 20.0,
                surface_azimuth: 180.0,
                albedo: 0.2
            }
        );
        let tracker: System = serde_json::from_str(
            r#"{"axis_tilt": 0, "axis_azimuth": 0, "max_angle": 52, "backtrack": true, "gcr": 0.33}"#,
        )
        .unwrap();
        assert!(matches!(tracker, System::Tracker { backtrack: true, .. }));
        let loc: Location = serde_json::from_str(r#"{"latitude": 30, "longitude": -97, "tz": -6}"#).unwrap();
        assert_eq!(loc.tz, TimeZoneSpec::Hours(-6.0));
    }

    #[test]
    fn appended_columns_are_grouped_as_clear_sky() {
        let index: Vec<NaiveDateTime> = (0..24).map(|h| local(2022, 8, 1, h, 0)).collect();
        let mut frame =
            TimeSeriesFrame::from_columns(index, vec![("meter_kw".into(), vec![0.0; 24])]).unwrap();
        let cfg = site(35.0, -106.0, TimeZoneSpec::Hours(-7.0), fixed(25.0));
        append_csky(&mut frame, &cfg).unwrap();
        let poa = frame.column(POA_CSKY).unwrap();
        assert_eq!(poa[2], 0.0);
        assert!(poa[12] > 700.0);

        let inferred = ColumnGroups::infer(&frame);
        assert_eq!(inferred.get("irr_poa_clear_sky").unwrap(), &[POA_CSKY]);
        assert_eq!(inferred.get("irr_ghi_clear_sky").unwrap(), &[GHI_CSKY]);
        let mut groups = ColumnGroups::default();
        add_csky_groups(&mut groups);
        assert_eq!(groups.get("irr_ghi_clear_sky"), inferred.get("irr_ghi_clear_sky"));
    }
}
