//! Telescope mount device
//!
//! Equatorial coordinates only: right ascension in hours `[0, 24)`,
//! declination in degrees `[-90, 90]`. The mount hardware slews and
//! tracks; this driver owns park state, targets and site data.

use crate::commands::{CommandEntry, CommandTable, Verb};
use crate::device::DeviceIdentity;
use crate::driver::{CommandContext, DeviceDriver};
use crate::status::{AlpacaError, AlpacaResult, AscomStatus};
use crate::AlpacaDeviceType;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const COMPONENT: &str = "Telescope";

pub const TELESCOPE_SLEWING_POLL: Duration = Duration::from_millis(100);
pub const TELESCOPE_IDLE_POLL: Duration = Duration::from_secs(1);

/// Sidereal hours per solar hour
pub const SIDEREAL_RATE: f64 = 1.002_737_909_35;

/// Declination the mount parks at
pub const PARK_DECLINATION: f64 = 90.0;

pub mod cmd {
    use crate::commands::CommandCode;

    pub const ALIGNMENT_MODE: CommandCode = 1000;
    pub const AT_HOME: CommandCode = 1001;
    pub const AT_PARK: CommandCode = 1002;
    pub const CAN_PARK: CommandCode = 1003;
    pub const CAN_SET_TRACKING: CommandCode = 1004;
    pub const CAN_SLEW: CommandCode = 1005;
    pub const CAN_SLEW_ASYNC: CommandCode = 1006;
    pub const CAN_SYNC: CommandCode = 1007;
    pub const CAN_UNPARK: CommandCode = 1008;
    pub const DECLINATION: CommandCode = 1009;
    pub const RIGHT_ASCENSION: CommandCode = 1010;
    pub const SIDEREAL_TIME: CommandCode = 1011;
    pub const SITE_LATITUDE: CommandCode = 1012;
    pub const SITE_LONGITUDE: CommandCode = 1013;
    pub const SLEWING: CommandCode = 1014;
    pub const TARGET_DECLINATION: CommandCode = 1015;
    pub const TARGET_RIGHT_ASCENSION: CommandCode = 1016;
    pub const TRACKING: CommandCode = 1017;
    pub const TRACKING_RATE: CommandCode = 1018;
    pub const TRACKING_RATES: CommandCode = 1019;
    pub const ABORT_SLEW: CommandCode = 1020;
    pub const PARK: CommandCode = 1021;
    pub const SLEW_TO_COORDINATES_ASYNC: CommandCode = 1022;
    pub const SLEW_TO_TARGET_ASYNC: CommandCode = 1023;
    pub const SYNC_TO_COORDINATES: CommandCode = 1024;
    pub const SYNC_TO_TARGET: CommandCode = 1025;
    pub const UNPARK: CommandCode = 1026;
    pub const EXTRAS: CommandCode = 1027;
    pub const HOUR_ANGLE: CommandCode = 1028;
    pub const READ_ALL: CommandCode = 1029;
}

pub static TELESCOPE_COMMANDS: &[CommandEntry] = &[
    CommandEntry::get("alignmentmode", cmd::ALIGNMENT_MODE),
    CommandEntry::get("athome", cmd::AT_HOME),
    CommandEntry::get("atpark", cmd::AT_PARK),
    CommandEntry::get("canpark", cmd::CAN_PARK),
    CommandEntry::get("cansettracking", cmd::CAN_SET_TRACKING),
    CommandEntry::get("canslew", cmd::CAN_SLEW),
    CommandEntry::get("canslewasync", cmd::CAN_SLEW_ASYNC),
    CommandEntry::get("cansync", cmd::CAN_SYNC),
    CommandEntry::get("canunpark", cmd::CAN_UNPARK),
    CommandEntry::get("declination", cmd::DECLINATION),
    CommandEntry::get("rightascension", cmd::RIGHT_ASCENSION),
    CommandEntry::get("siderealtime", cmd::SIDEREAL_TIME),
    CommandEntry::both("sitelatitude", cmd::SITE_LATITUDE),
    CommandEntry::both("sitelongitude", cmd::SITE_LONGITUDE),
    CommandEntry::get("slewing", cmd::SLEWING),
    CommandEntry::both("targetdeclination", cmd::TARGET_DECLINATION),
    CommandEntry::both("targetrightascension", cmd::TARGET_RIGHT_ASCENSION),
    CommandEntry::both("tracking", cmd::TRACKING),
    CommandEntry::both("trackingrate", cmd::TRACKING_RATE),
    CommandEntry::get("trackingrates", cmd::TRACKING_RATES),
    CommandEntry::put("abortslew", cmd::ABORT_SLEW),
    CommandEntry::put("park", cmd::PARK),
    CommandEntry::put("slewtocoordinatesasync", cmd::SLEW_TO_COORDINATES_ASYNC),
    CommandEntry::put("slewtotargetasync", cmd::SLEW_TO_TARGET_ASYNC),
    CommandEntry::put("synctocoordinates", cmd::SYNC_TO_COORDINATES),
    CommandEntry::put("synctotarget", cmd::SYNC_TO_TARGET),
    CommandEntry::put("unpark", cmd::UNPARK),
    CommandEntry::get("--extras", cmd::EXTRAS),
    CommandEntry::get("hourangle", cmd::HOUR_ANGLE),
    CommandEntry::get("readall", cmd::READ_ALL),
];

/// ASCOM `AlignmentModes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentMode {
    AltAz = 0,
    Polar = 1,
    GermanPolar = 2,
}

/// ASCOM `DriveRates`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveRate {
    Sidereal = 0,
    Lunar = 1,
    Solar = 2,
    King = 3,
}

impl DriveRate {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DriveRate::Sidereal),
            1 => Some(DriveRate::Lunar),
            2 => Some(DriveRate::Solar),
            3 => Some(DriveRate::King),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Wrap hours into `[0, 24)`
pub fn wrap_hours(hours: f64) -> f64 {
    let wrapped = hours.rem_euclid(24.0);
    if wrapped >= 24.0 {
        0.0
    } else {
        wrapped
    }
}

/// Local apparent sidereal time in hours for `utc` at `longitude` degrees east.
pub fn local_sidereal_time(utc: DateTime<Utc>, longitude: f64) -> f64 {
    let j2000 = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).single();
    let days = j2000
        .map(|epoch| (utc - epoch).num_milliseconds() as f64 / 86_400_000.0)
        .unwrap_or(0.0);
    let gmst = 18.697_374_558 + 24.065_709_824_419_08 * days;
    wrap_hours(gmst + longitude / 15.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountCapabilities {
    pub alignment_mode: AlignmentMode,
    pub can_park: bool,
    pub can_set_tracking: bool,
    pub can_slew_async: bool,
    pub can_sync: bool,
    pub tracking_rates: &'static [DriveRate],
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountStatus {
    pub right_ascension: f64,
    pub declination: f64,
    pub slewing: bool,
    pub tracking: bool,
}

/// Hardware strategy behind [`TelescopeDriver`]
pub trait MountHardware: Send {
    fn model(&self) -> &str;

    fn capabilities(&self) -> MountCapabilities;

    /// Begin slewing to equatorial coordinates; must not block.
    fn start_slew(&mut self, right_ascension: f64, declination: f64) -> AlpacaResult<()>;

    fn abort_slew(&mut self) -> AlpacaResult<()>;

    /// Declare the current pointing to be these coordinates
    fn sync(&mut self, right_ascension: f64, declination: f64) -> AlpacaResult<()>;

    fn set_tracking(&mut self, tracking: bool) -> AlpacaResult<()>;

    fn poll(&mut self, now: Instant) -> AlpacaResult<MountStatus>;
}

/// Telescope device-type handler
pub struct TelescopeDriver {
    hardware: Box<dyn MountHardware>,
    capabilities: MountCapabilities,
    status: MountStatus,
    at_park: bool,
    parking: bool,
    target_right_ascension: Option<f64>,
    target_declination: Option<f64>,
    tracking_rate: DriveRate,
    site_latitude: f64,
    site_longitude: f64,
}

impl TelescopeDriver {
    pub fn new(hardware: Box<dyn MountHardware>) -> Self {
        let capabilities = hardware.capabilities();
        let mut driver = Self {
            hardware,
            capabilities,
            status: MountStatus {
                right_ascension: 0.0,
                declination: 0.0,
                slewing: false,
                tracking: false,
            },
            at_park: false,
            parking: false,
            target_right_ascension: None,
            target_declination: None,
            tracking_rate: DriveRate::Sidereal,
            site_latitude: 0.0,
            site_longitude: 0.0,
        };
        if let Ok(status) = driver.hardware.poll(Instant::now()) {
            driver.status = status;
        }
        driver
    }

    pub fn simulator() -> Self {
        Self::new(Box::new(SimulatedMount::default()))
    }

    pub fn status(&self) -> &MountStatus {
        &self.status
    }

    pub fn at_park(&self) -> bool {
        self.at_park
    }

    pub fn sidereal_time(&self) -> f64 {
        local_sidereal_time(Utc::now(), self.site_longitude)
    }

    /// Hour angle in `(-12, 12]`
    pub fn hour_angle(&self) -> f64 {
        let ha = wrap_hours(self.sidereal_time() - self.status.right_ascension);
        if ha > 12.0 {
            ha - 24.0
        } else {
            ha
        }
    }

    #[track_caller]
    fn require_unparked(&self) -> AlpacaResult<()> {
        if self.at_park || self.parking {
            Err(AlpacaError::new(AscomStatus::InvalidWhileParked, COMPONENT, "Invalid while parked"))
        } else {
            Ok(())
        }
    }

    #[track_caller]
    fn require_tracking(&self, what: &str) -> AlpacaResult<()> {
        if self.status.tracking {
            Ok(())
        } else {
            Err(AlpacaError::new(
                AscomStatus::InvalidOperation,
                COMPONENT,
                format!("{} needs tracking enabled", what),
            ))
        }
    }

    #[track_caller]
    fn target(&self) -> AlpacaResult<(f64, f64)> {
        match (self.target_right_ascension, self.target_declination) {
            (Some(ra), Some(dec)) => Ok((ra, dec)),
            _ => Err(AlpacaError::new(AscomStatus::ValueNotSet, COMPONENT, "Target not set")),
        }
    }

    fn slew_to(&mut self, right_ascension: f64, declination: f64) -> AlpacaResult<()> {
        self.hardware.start_slew(right_ascension, declination)?;
        self.target_right_ascension = Some(right_ascension);
        self.target_declination = Some(declination);
        self.status.slewing = true;
        debug!(right_ascension, declination, "Telescope slew started");
        Ok(())
    }

    fn sync_to(&mut self, right_ascension: f64, declination: f64) -> AlpacaResult<()> {
        self.hardware.sync(right_ascension, declination)?;
        self.status.right_ascension = right_ascension;
        self.status.declination = declination;
        info!(right_ascension, declination, "Telescope synced");
        Ok(())
    }

    fn park(&mut self) -> AlpacaResult<()> {
        if !self.capabilities.can_park {
            return Err(AlpacaError::not_implemented(COMPONENT, "park"));
        }
        if self.at_park || self.parking {
            return Ok(());
        }
        self.hardware.set_tracking(false)?;
        self.status.tracking = false;
        self.hardware.start_slew(self.status.right_ascension, PARK_DECLINATION)?;
        self.status.slewing = true;
        self.parking = true;
        info!("Telescope parking");
        Ok(())
    }

    fn write_read_all(&self, ctx: &mut CommandContext<'_>) {
        ctx.write_common_properties();
        let out = &mut *ctx.response;
        out.field("alignmentmode", self.capabilities.alignment_mode as i32);
        out.field("athome", false);
        out.field("atpark", self.at_park);
        out.field("canpark", self.capabilities.can_park);
        out.field("cansettracking", self.capabilities.can_set_tracking);
        out.field("canslew", false);
        out.field("canslewasync", self.capabilities.can_slew_async);
        out.field("cansync", self.capabilities.can_sync);
        out.field("canunpark", self.capabilities.can_park);
        out.field("declination", self.status.declination);
        out.field("hourangle", self.hour_angle());
        out.field("rightascension", self.status.right_ascension);
        out.field("siderealtime", self.sidereal_time());
        out.field("sitelatitude", self.site_latitude);
        out.field("sitelongitude", self.site_longitude);
        out.field("slewing", self.status.slewing);
        if let Some(dec) = self.target_declination {
            out.field("targetdeclination", dec);
        }
        if let Some(ra) = self.target_right_ascension {
            out.field("targetrightascension", ra);
        }
        out.field("tracking", self.status.tracking);
        out.field("trackingrate", self.tracking_rate.code());
    }
}

#[track_caller]
fn right_ascension_in_range(hours: f64) -> AlpacaResult<f64> {
    if (0.0..24.0).contains(&hours) {
        Ok(hours)
    } else {
        Err(AlpacaError::invalid_value(
            COMPONENT,
            format!("RightAscension {} outside 0..24", hours),
        ))
    }
}

#[track_caller]
fn degrees_in_range(name: &str, degrees: f64, limit: f64) -> AlpacaResult<f64> {
    if (-limit..=limit).contains(&degrees) {
        Ok(degrees)
    } else {
        Err(AlpacaError::invalid_value(
            COMPONENT,
            format!("{} {} outside -{}..{}", name, degrees, limit, limit),
        ))
    }
}

impl DeviceDriver for TelescopeDriver {
    fn device_type(&self) -> AlpacaDeviceType {
        AlpacaDeviceType::Telescope
    }

    fn command_table(&self) -> CommandTable {
        TELESCOPE_COMMANDS
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: format!("Telescope {}", self.hardware.model()),
            description: "Alpaca telescope mount".to_string(),
            manufacturer: "alpaca_host".to_string(),
            model: self.hardware.model().to_string(),
            driver_info: "Equatorial mount driver with pluggable back end".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            interface_version: 3,
            ..Default::default()
        }
    }

    fn handle_command(&mut self, entry: &CommandEntry, ctx: &mut CommandContext<'_>) -> AlpacaResult<()> {
        let request = ctx.request;
        let params = &request.params;
        match entry.code {
            cmd::ALIGNMENT_MODE => ctx.response.value(self.capabilities.alignment_mode as i32),
            cmd::AT_HOME => ctx.response.value(false),
            cmd::AT_PARK => ctx.response.value(self.at_park),
            cmd::CAN_PARK | cmd::CAN_UNPARK => ctx.response.value(self.capabilities.can_park),
            cmd::CAN_SET_TRACKING => ctx.response.value(self.capabilities.can_set_tracking),
            cmd::CAN_SLEW => ctx.response.value(false),
            cmd::CAN_SLEW_ASYNC => ctx.response.value(self.capabilities.can_slew_async),
            cmd::CAN_SYNC => ctx.response.value(self.capabilities.can_sync),
            cmd::DECLINATION => ctx.response.value(self.status.declination),
            cmd::RIGHT_ASCENSION => ctx.response.value(self.status.right_ascension),
            cmd::SIDEREAL_TIME => ctx.response.value(self.sidereal_time()),
            cmd::HOUR_ANGLE => ctx.response.value(self.hour_angle()),
            cmd::SLEWING => ctx.response.value(self.status.slewing),
            cmd::SITE_LATITUDE => match request.verb {
                Verb::Get => ctx.response.value(self.site_latitude),
                Verb::Put => {
                    let latitude = params.required_f64(COMPONENT, "SiteLatitude")?;
                    self.site_latitude = degrees_in_range("SiteLatitude", latitude, 90.0)?;
                }
            },
            cmd::SITE_LONGITUDE => match request.verb {
                Verb::Get => ctx.response.value(self.site_longitude),
                Verb::Put => {
                    let longitude = params.required_f64(COMPONENT, "SiteLongitude")?;
                    self.site_longitude = degrees_in_range("SiteLongitude", longitude, 180.0)?;
                }
            },
            cmd::TARGET_DECLINATION => match request.verb {
                Verb::Get => match self.target_declination {
                    Some(dec) => ctx.response.value(dec),
                    None => return Err(AlpacaError::new(AscomStatus::ValueNotSet, COMPONENT, "Target not set")),
                },
                Verb::Put => {
                    let dec = params.required_f64(COMPONENT, "TargetDeclination")?;
                    self.target_declination = Some(degrees_in_range("TargetDeclination", dec, 90.0)?);
                }
            },
            cmd::TARGET_RIGHT_ASCENSION => match request.verb {
                Verb::Get => match self.target_right_ascension {
                    Some(ra) => ctx.response.value(ra),
                    None => return Err(AlpacaError::new(AscomStatus::ValueNotSet, COMPONENT, "Target not set")),
                },
                Verb::Put => {
                    let ra = params.required_f64(COMPONENT, "TargetRightAscension")?;
                    self.target_right_ascension = Some(right_ascension_in_range(ra)?);
                }
            },
            cmd::TRACKING => match request.verb {
                Verb::Get => ctx.response.value(self.status.tracking),
                Verb::Put => {
                    let tracking = params.required_bool(COMPONENT, "Tracking")?;
                    if !self.capabilities.can_set_tracking {
                        return Err(AlpacaError::not_implemented(COMPONENT, "tracking"));
                    }
                    ctx.require_connected(COMPONENT)?;
                    self.require_unparked()?;
                    self.hardware.set_tracking(tracking)?;
                    self.status.tracking = tracking;
                }
            },
            cmd::TRACKING_RATE => match request.verb {
                Verb::Get => ctx.response.value(self.tracking_rate.code()),
                Verb::Put => {
                    let code = params.required_i32(COMPONENT, "TrackingRate")?;
                    match DriveRate::from_code(code) {
                        Some(rate) if self.capabilities.tracking_rates.contains(&rate) => self.tracking_rate = rate,
                        _ => {
                            return Err(AlpacaError::invalid_value(
                                COMPONENT,
                                format!("TrackingRate {} not supported", code),
                            ))
                        }
                    }
                }
            },
            cmd::TRACKING_RATES => {
                let rates: Vec<i32> = self.capabilities.tracking_rates.iter().map(|r| r.code()).collect();
                ctx.response.value(rates);
            }
            cmd::ABORT_SLEW => {
                ctx.require_connected(COMPONENT)?;
                if self.at_park {
                    return Err(AlpacaError::new(AscomStatus::InvalidWhileParked, COMPONENT, "Invalid while parked"));
                }
                self.hardware.abort_slew()?;
                self.status.slewing = false;
                if self.parking {
                    self.parking = false;
                    info!("Telescope park aborted");
                }
            }
            cmd::PARK => {
                ctx.require_connected(COMPONENT)?;
                self.park()?;
            }
            cmd::UNPARK => {
                ctx.require_connected(COMPONENT)?;
                if !self.capabilities.can_park {
                    return Err(AlpacaError::not_implemented(COMPONENT, "unpark"));
                }
                if self.at_park {
                    info!("Telescope unparked");
                }
                self.at_park = false;
            }
            cmd::SLEW_TO_COORDINATES_ASYNC => {
                ctx.require_connected(COMPONENT)?;
                if !self.capabilities.can_slew_async {
                    return Err(AlpacaError::not_implemented(COMPONENT, entry.name));
                }
                let ra = right_ascension_in_range(params.required_f64(COMPONENT, "RightAscension")?)?;
                let dec = degrees_in_range("Declination", params.required_f64(COMPONENT, "Declination")?, 90.0)?;
                self.require_unparked()?;
                self.require_tracking(entry.name)?;
                self.slew_to(ra, dec)?;
            }
            cmd::SLEW_TO_TARGET_ASYNC => {
                ctx.require_connected(COMPONENT)?;
                if !self.capabilities.can_slew_async {
                    return Err(AlpacaError::not_implemented(COMPONENT, entry.name));
                }
                let (ra, dec) = self.target()?;
                self.require_unparked()?;
                self.require_tracking(entry.name)?;
                self.slew_to(ra, dec)?;
            }
            cmd::SYNC_TO_COORDINATES => {
                ctx.require_connected(COMPONENT)?;
                if !self.capabilities.can_sync {
                    return Err(AlpacaError::not_implemented(COMPONENT, entry.name));
                }
                let ra = right_ascension_in_range(params.required_f64(COMPONENT, "RightAscension")?)?;
                let dec = degrees_in_range("Declination", params.required_f64(COMPONENT, "Declination")?, 90.0)?;
                self.require_unparked()?;
                self.require_tracking(entry.name)?;
                self.target_right_ascension = Some(ra);
                self.target_declination = Some(dec);
                self.sync_to(ra, dec)?;
            }
            cmd::SYNC_TO_TARGET => {
                ctx.require_connected(COMPONENT)?;
                if !self.capabilities.can_sync {
                    return Err(AlpacaError::not_implemented(COMPONENT, entry.name));
                }
                let (ra, dec) = self.target()?;
                self.require_unparked()?;
                self.require_tracking(entry.name)?;
                self.sync_to(ra, dec)?;
            }
            cmd::READ_ALL => self.write_read_all(ctx),
            _ => {
                return Err(AlpacaError::new(
                    AscomStatus::InvalidOperation,
                    COMPONENT,
                    format!("Unrecognized command '{}'", entry.name),
                ))
            }
        }
        Ok(())
    }

    fn tick(&mut self, now: Instant) -> Duration {
        match self.hardware.poll(now) {
            Ok(status) => self.status = status,
            Err(e) => debug!(error = %e, "Telescope poll failed"),
        }
        if self.parking && !self.status.slewing {
            self.parking = false;
            self.at_park = true;
            info!("Telescope parked");
        }
        if self.status.slewing {
            TELESCOPE_SLEWING_POLL
        } else {
            TELESCOPE_IDLE_POLL
        }
    }

    fn device_state(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("AtPark", Value::from(self.at_park)),
            ("Declination", Value::from(self.status.declination)),
            ("RightAscension", Value::from(self.status.right_ascension)),
            ("SiderealTime", Value::from(self.sidereal_time())),
            ("Slewing", Value::from(self.status.slewing)),
            ("Tracking", Value::from(self.status.tracking)),
        ]
    }

    fn watchdog_timeout(&mut self) {
        if self.status.slewing {
            info!(
                right_ascension = self.status.right_ascension,
                declination = self.status.declination,
                "Watchdog expired, aborting slew"
            );
            if self.hardware.abort_slew().is_ok() {
                self.status.slewing = false;
                self.parking = false;
            }
        }
    }
}

/// Software mount slewing both axes at a fixed rate.
///
/// With tracking off the mount stands still against the ground, so its
/// right ascension advances at the sidereal rate.
#[derive(Debug, Clone)]
pub struct SimulatedMount {
    right_ascension: f64,
    declination: f64,
    target: Option<(f64, f64)>,
    tracking: bool,
    degrees_per_sec: f64,
    last_poll: Option<Instant>,
}

impl Default for SimulatedMount {
    fn default() -> Self {
        Self {
            right_ascension: 0.0,
            declination: 0.0,
            target: None,
            tracking: false,
            degrees_per_sec: 4.0,
            last_poll: None,
        }
    }
}

fn approach(current: f64, target: f64, step: f64) -> f64 {
    let delta = target - current;
    if delta.abs() <= step {
        target
    } else {
        current + step.copysign(delta)
    }
}

impl MountHardware for SimulatedMount {
    fn model(&self) -> &str {
        "Simulator"
    }

    fn capabilities(&self) -> MountCapabilities {
        MountCapabilities {
            alignment_mode: AlignmentMode::GermanPolar,
            can_park: true,
            can_set_tracking: true,
            can_slew_async: true,
            can_sync: true,
            tracking_rates: &[DriveRate::Sidereal, DriveRate::Lunar, DriveRate::Solar, DriveRate::King],
        }
    }

    fn start_slew(&mut self, right_ascension: f64, declination: f64) -> AlpacaResult<()> {
        self.target = Some((right_ascension, declination));
        Ok(())
    }

    fn abort_slew(&mut self) -> AlpacaResult<()> {
        self.target = None;
        Ok(())
    }

    fn sync(&mut self, right_ascension: f64, declination: f64) -> AlpacaResult<()> {
        self.right_ascension = right_ascension;
        self.declination = declination;
        Ok(())
    }

    fn set_tracking(&mut self, tracking: bool) -> AlpacaResult<()> {
        self.tracking = tracking;
        Ok(())
    }

    fn poll(&mut self, now: Instant) -> AlpacaResult<MountStatus> {
        let elapsed = self
            .last_poll
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_poll = Some(now);

        if !self.tracking {
            self.right_ascension = wrap_hours(self.right_ascension + elapsed / 3600.0 * SIDEREAL_RATE);
        }

        if let Some((target_ra, target_dec)) = self.target {
            let step = self.degrees_per_sec * elapsed;
            // shortest way round in hours, in (-12, 12]
            let mut delta = (target_ra - self.right_ascension).rem_euclid(24.0);
            if delta > 12.0 {
                delta -= 24.0;
            }
            let ra = approach(0.0, delta, step / 15.0);
            self.right_ascension = wrap_hours(self.right_ascension + ra);
            self.declination = approach(self.declination, target_dec, step);
            if (ra - delta).abs() < 1e-12 && (self.declination - target_dec).abs() < 1e-12 {
                self.right_ascension = target_ra;
                self.target = None;
            }
        }

        Ok(MountStatus {
            right_ascension: self.right_ascension,
            declination: self.declination,
            slewing: self.target.is_some(),
            tracking: self.tracking,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::run_command;
    use crate::request::AlpacaRequest;

    fn value_f64(out: &crate::request::ResponseFields) -> f64 {
        out.get("Value").and_then(Value::as_f64).expect("numeric Value")
    }

    fn tracking_on(driver: &mut TelescopeDriver) {
        let request = AlpacaRequest::put("telescope", 0, "tracking").with_param("Tracking", "true");
        assert!(run_command(driver, &request, true).0.is_ok());
    }

    #[test]
    fn test_wrap_hours() {
        assert_eq!(wrap_hours(25.0), 1.0);
        assert_eq!(wrap_hours(-1.0), 23.0);
        assert_eq!(wrap_hours(24.0), 0.0);
    }

    #[test]
    fn test_sidereal_time_at_epoch() {
        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((local_sidereal_time(epoch, 0.0) - 18.697_374_558).abs() < 1e-9);
        let east = local_sidereal_time(epoch, 15.0);
        assert!((east - 19.697_374_558).abs() < 1e-9);
    }

    #[test]
    fn test_slew_reaches_coordinates() {
        let mut driver = TelescopeDriver::simulator();
        let start = Instant::now();
        driver.tick(start);
        tracking_on(&mut driver);

        let request = AlpacaRequest::put("telescope", 0, "slewtocoordinatesasync")
            .with_param("RightAscension", "2")
            .with_param("Declination", "20");
        assert!(run_command(&mut driver, &request, true).0.is_ok());
        assert!(driver.status().slewing);

        assert_eq!(driver.tick(start + Duration::from_secs(1)), TELESCOPE_SLEWING_POLL);
        assert_eq!(driver.tick(start + Duration::from_secs(10)), TELESCOPE_IDLE_POLL);
        assert!((driver.status().right_ascension - 2.0).abs() < 1e-9);
        assert!((driver.status().declination - 20.0).abs() < 1e-9);

        let (_, out) = run_command(&mut driver, &AlpacaRequest::get("telescope", 0, "targetrightascension"), true);
        assert_eq!(value_f64(&out), 2.0);
    }

    #[test]
    fn test_slew_needs_tracking_and_valid_coordinates() {
        let mut driver = TelescopeDriver::simulator();
        let request = AlpacaRequest::put("telescope", 0, "slewtocoordinatesasync")
            .with_param("RightAscension", "2")
            .with_param("Declination", "20");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidOperation);

        tracking_on(&mut driver);
        let request = AlpacaRequest::put("telescope", 0, "slewtocoordinatesasync")
            .with_param("RightAscension", "24")
            .with_param("Declination", "20");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidValue);
        let request = AlpacaRequest::put("telescope", 0, "slewtocoordinatesasync")
            .with_param("RightAscension", "2")
            .with_param("Declination", "-91");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidValue);
    }

    #[test]
    fn test_target_must_be_set() {
        let mut driver = TelescopeDriver::simulator();
        tracking_on(&mut driver);
        let (result, _) = run_command(&mut driver, &AlpacaRequest::get("telescope", 0, "targetdeclination"), true);
        assert_eq!(result.unwrap_err().status, AscomStatus::ValueNotSet);
        let (result, _) = run_command(&mut driver, &AlpacaRequest::put("telescope", 0, "slewtotargetasync"), true);
        assert_eq!(result.unwrap_err().status, AscomStatus::ValueNotSet);

        let request = AlpacaRequest::put("telescope", 0, "targetrightascension").with_param("TargetRightAscension", "5.5");
        assert!(run_command(&mut driver, &request, true).0.is_ok());
        let request = AlpacaRequest::put("telescope", 0, "targetdeclination").with_param("TargetDeclination", "-10");
        assert!(run_command(&mut driver, &request, true).0.is_ok());
        let (result, _) = run_command(&mut driver, &AlpacaRequest::put("telescope", 0, "synctotarget"), true);
        assert!(result.is_ok());
        assert_eq!(driver.status().right_ascension, 5.5);
        assert_eq!(driver.status().declination, -10.0);
    }

    #[test]
    fn test_park_and_unpark() {
        let mut driver = TelescopeDriver::simulator();
        let start = Instant::now();
        driver.tick(start);
        tracking_on(&mut driver);

        assert!(run_command(&mut driver, &AlpacaRequest::put("telescope", 0, "park"), true).0.is_ok());
        assert!(!driver.status().tracking);
        assert!(!driver.at_park());

        driver.tick(start + Duration::from_secs(30));
        assert!(driver.at_park());
        assert!((driver.status().declination - PARK_DECLINATION).abs() < 1e-9);

        let request = AlpacaRequest::put("telescope", 0, "slewtocoordinatesasync")
            .with_param("RightAscension", "2")
            .with_param("Declination", "20");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidWhileParked);
        let request = AlpacaRequest::put("telescope", 0, "tracking").with_param("Tracking", "true");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidWhileParked);
        let (result, _) = run_command(&mut driver, &AlpacaRequest::put("telescope", 0, "abortslew"), true);
        assert_eq!(result.unwrap_err().status, AscomStatus::InvalidWhileParked);

        assert!(run_command(&mut driver, &AlpacaRequest::put("telescope", 0, "unpark"), true).0.is_ok());
        assert!(!driver.at_park());
        tracking_on(&mut driver);
    }

    #[test]
    fn test_abort_cancels_park() {
        let mut driver = TelescopeDriver::simulator();
        let start = Instant::now();
        driver.tick(start);
        assert!(run_command(&mut driver, &AlpacaRequest::put("telescope", 0, "park"), true).0.is_ok());
        assert!(run_command(&mut driver, &AlpacaRequest::put("telescope", 0, "abortslew"), true).0.is_ok());
        driver.tick(start + Duration::from_secs(60));
        assert!(!driver.at_park());
        assert!(!driver.status().slewing);
    }

    #[test]
    fn test_untracked_mount_drifts_in_right_ascension() {
        let mut driver = TelescopeDriver::simulator();
        let start = Instant::now();
        driver.tick(start);
        driver.tick(start + Duration::from_secs(3600));
        let drifted = driver.status().right_ascension;
        assert!((drifted - SIDEREAL_RATE).abs() < 1e-6, "right ascension {}", drifted);

        tracking_on(&mut driver);
        driver.tick(start + Duration::from_secs(7200));
        assert_eq!(driver.status().right_ascension, drifted);
    }

    #[test]
    fn test_tracking_rates() {
        let mut driver = TelescopeDriver::simulator();
        let (_, out) = run_command(&mut driver, &AlpacaRequest::get("telescope", 0, "trackingrates"), true);
        assert_eq!(out.get("Value"), Some(&serde_json::json!([0, 1, 2, 3])));

        let request = AlpacaRequest::put("telescope", 0, "trackingrate").with_param("TrackingRate", "2");
        assert!(run_command(&mut driver, &request, true).0.is_ok());
        let (_, out) = run_command(&mut driver, &AlpacaRequest::get("telescope", 0, "trackingrate"), true);
        assert_eq!(out.get("Value"), Some(&Value::from(2)));

        let request = AlpacaRequest::put("telescope", 0, "trackingrate").with_param("TrackingRate", "7");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidValue);
    }

    #[test]
    fn test_site_validation_and_hour_angle() {
        let mut driver = TelescopeDriver::simulator();
        let request = AlpacaRequest::put("telescope", 0, "sitelatitude").with_param("SiteLatitude", "95");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidValue);
        let request = AlpacaRequest::put("telescope", 0, "sitelongitude").with_param("SiteLongitude", "-71.5");
        assert!(run_command(&mut driver, &request, true).0.is_ok());

        let ha = driver.hour_angle();
        assert!(ha > -12.0 && ha <= 12.0);
        let (_, out) = run_command(&mut driver, &AlpacaRequest::get("telescope", 0, "siderealtime"), true);
        let lst = value_f64(&out);
        assert!((0.0..24.0).contains(&lst));
    }

    #[test]
    fn test_moves_need_connection() {
        let mut driver = TelescopeDriver::simulator();
        let (result, _) = run_command(&mut driver, &AlpacaRequest::put("telescope", 0, "park"), false);
        assert_eq!(result.unwrap_err().status, AscomStatus::NotConnected);
    }

    #[test]
    fn test_watchdog_aborts_slew() {
        let mut driver = TelescopeDriver::simulator();
        let start = Instant::now();
        driver.tick(start);
        tracking_on(&mut driver);
        let request = AlpacaRequest::put("telescope", 0, "slewtocoordinatesasync")
            .with_param("RightAscension", "6")
            .with_param("Declination", "45");
        assert!(run_command(&mut driver, &request, true).0.is_ok());

        driver.watchdog_timeout();
        assert!(!driver.status().slewing);
        driver.tick(start + Duration::from_secs(1));
        assert!(!driver.status().slewing);
    }

    #[test]
    fn test_device_state_names() {
        let driver = TelescopeDriver::simulator();
        let names: Vec<&str> = driver.device_state().into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec!["AtPark", "Declination", "RightAscension", "SiderealTime", "Slewing", "Tracking"]
        );
    }
}
