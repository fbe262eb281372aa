//! Observing conditions (weather station) device

use crate::commands::{CommandEntry, CommandTable, Verb};
use crate::device::DeviceIdentity;
use crate::driver::{CommandContext, DeviceDriver};
use crate::status::{AlpacaError, AlpacaResult, AscomStatus};
use crate::AlpacaDeviceType;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const COMPONENT: &str = "ObservingConditions";

/// Samples in the averaging window
pub const AVG_SAMPLE_COUNT: usize = 20;
/// Interval between samples once the window is full
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);
/// Gap between back-to-back samples while filling the window
pub const STARTUP_INTERVAL: Duration = Duration::from_millis(10);

pub mod cmd {
    use crate::commands::CommandCode;

    pub const AVERAGE_PERIOD: CommandCode = 1000;
    pub const CLOUD_COVER: CommandCode = 1001;
    pub const DEW_POINT: CommandCode = 1002;
    pub const HUMIDITY: CommandCode = 1003;
    pub const PRESSURE: CommandCode = 1004;
    pub const RAIN_RATE: CommandCode = 1005;
    pub const SKY_BRIGHTNESS: CommandCode = 1006;
    pub const SKY_QUALITY: CommandCode = 1007;
    pub const SKY_TEMPERATURE: CommandCode = 1008;
    pub const STAR_FWHM: CommandCode = 1009;
    pub const TEMPERATURE: CommandCode = 1010;
    pub const WIND_DIRECTION: CommandCode = 1011;
    pub const WIND_GUST: CommandCode = 1012;
    pub const WIND_SPEED: CommandCode = 1013;
    pub const REFRESH: CommandCode = 1014;
    pub const SENSOR_DESCRIPTION: CommandCode = 1015;
    pub const TIME_SINCE_LAST_UPDATE: CommandCode = 1016;
    pub const READ_ALL: CommandCode = 1017;
}

pub static OBSERVING_CONDITIONS_COMMANDS: &[CommandEntry] = &[
    CommandEntry::both("averageperiod", cmd::AVERAGE_PERIOD),
    CommandEntry::get("cloudcover", cmd::CLOUD_COVER),
    CommandEntry::get("dewpoint", cmd::DEW_POINT),
    CommandEntry::get("humidity", cmd::HUMIDITY),
    CommandEntry::get("pressure", cmd::PRESSURE),
    CommandEntry::get("rainrate", cmd::RAIN_RATE),
    CommandEntry::get("skybrightness", cmd::SKY_BRIGHTNESS),
    CommandEntry::get("skyquality", cmd::SKY_QUALITY),
    CommandEntry::get("skytemperature", cmd::SKY_TEMPERATURE),
    CommandEntry::get("starfwhm", cmd::STAR_FWHM),
    CommandEntry::get("temperature", cmd::TEMPERATURE),
    CommandEntry::get("winddirection", cmd::WIND_DIRECTION),
    CommandEntry::get("windgust", cmd::WIND_GUST),
    CommandEntry::get("windspeed", cmd::WIND_SPEED),
    CommandEntry::put("refresh", cmd::REFRESH),
    CommandEntry::get("sensordescription", cmd::SENSOR_DESCRIPTION),
    CommandEntry::get("timesincelastupdate", cmd::TIME_SINCE_LAST_UPDATE),
    CommandEntry::get("readall", cmd::READ_ALL),
];

/// Individual measurements a station may provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sensor {
    CloudCover,
    DewPoint,
    Humidity,
    Pressure,
    RainRate,
    SkyBrightness,
    SkyQuality,
    SkyTemperature,
    StarFwhm,
    Temperature,
    WindDirection,
    WindGust,
    WindSpeed,
}

impl Sensor {
    pub const ALL: [Sensor; 13] = [
        Sensor::CloudCover,
        Sensor::DewPoint,
        Sensor::Humidity,
        Sensor::Pressure,
        Sensor::RainRate,
        Sensor::SkyBrightness,
        Sensor::SkyQuality,
        Sensor::SkyTemperature,
        Sensor::StarFwhm,
        Sensor::Temperature,
        Sensor::WindDirection,
        Sensor::WindGust,
        Sensor::WindSpeed,
    ];

    /// Property name, as used in command names and `SensorName`
    pub fn property(&self) -> &'static str {
        match self {
            Sensor::CloudCover => "cloudcover",
            Sensor::DewPoint => "dewpoint",
            Sensor::Humidity => "humidity",
            Sensor::Pressure => "pressure",
            Sensor::RainRate => "rainrate",
            Sensor::SkyBrightness => "skybrightness",
            Sensor::SkyQuality => "skyquality",
            Sensor::SkyTemperature => "skytemperature",
            Sensor::StarFwhm => "starfwhm",
            Sensor::Temperature => "temperature",
            Sensor::WindDirection => "winddirection",
            Sensor::WindGust => "windgust",
            Sensor::WindSpeed => "windspeed",
        }
    }

    pub fn from_property(name: &str) -> Option<Self> {
        Sensor::ALL
            .into_iter()
            .find(|sensor| sensor.property().eq_ignore_ascii_case(name))
    }

    fn from_code(code: crate::commands::CommandCode) -> Option<Self> {
        let sensor = match code {
            cmd::CLOUD_COVER => Sensor::CloudCover,
            cmd::DEW_POINT => Sensor::DewPoint,
            cmd::HUMIDITY => Sensor::Humidity,
            cmd::PRESSURE => Sensor::Pressure,
            cmd::RAIN_RATE => Sensor::RainRate,
            cmd::SKY_BRIGHTNESS => Sensor::SkyBrightness,
            cmd::SKY_QUALITY => Sensor::SkyQuality,
            cmd::SKY_TEMPERATURE => Sensor::SkyTemperature,
            cmd::STAR_FWHM => Sensor::StarFwhm,
            cmd::TEMPERATURE => Sensor::Temperature,
            cmd::WIND_DIRECTION => Sensor::WindDirection,
            cmd::WIND_GUST => Sensor::WindGust,
            cmd::WIND_SPEED => Sensor::WindSpeed,
            _ => return None,
        };
        Some(sensor)
    }
}

/// One reading from the station. Missing sensors stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentSample {
    pub temperature: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub humidity: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub rain_rate: Option<f64>,
    pub sky_brightness: Option<f64>,
    pub sky_quality: Option<f64>,
    pub sky_temperature: Option<f64>,
    pub star_fwhm: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_gust: Option<f64>,
    pub wind_speed: Option<f64>,
}

/// Hardware strategy behind [`ObservingConditionsDriver`]
pub trait EnvironmentSensor: Send {
    fn model(&self) -> &str;

    /// Human-readable description of one sensor, `None` if absent
    fn describe(&self, sensor: Sensor) -> Option<String>;

    /// Take one reading; must not block beyond a short bus transaction.
    fn sample(&mut self) -> AlpacaResult<EnvironmentSample>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservingState {
    /// Filling the averaging window
    Startup,
    Idle,
}

/// Magnus-formula dew point in degrees C
pub fn dew_point(temperature_c: f64, humidity_pct: f64) -> f64 {
    const B: f64 = 17.62;
    const C: f64 = 243.12;
    let gamma = (humidity_pct.clamp(0.1, 100.0) / 100.0).ln() + B * temperature_c / (C + temperature_c);
    C * gamma / (B - gamma)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Observing-conditions device-type handler
pub struct ObservingConditionsDriver {
    sensor: Box<dyn EnvironmentSensor>,
    state: ObservingState,
    window: VecDeque<EnvironmentSample>,
    latest: EnvironmentSample,
    last_update: Option<Instant>,
    average_period_hours: f64,
}

impl ObservingConditionsDriver {
    pub fn new(sensor: Box<dyn EnvironmentSensor>) -> Self {
        Self {
            sensor,
            state: ObservingState::Startup,
            window: VecDeque::with_capacity(AVG_SAMPLE_COUNT),
            latest: EnvironmentSample::default(),
            last_update: None,
            average_period_hours: (AVG_SAMPLE_COUNT as f64 * SAMPLE_INTERVAL.as_secs_f64()) / 3600.0,
        }
    }

    pub fn simulator() -> Self {
        Self::new(Box::new(SimulatedWeather::default()))
    }

    pub fn state(&self) -> ObservingState {
        self.state
    }

    pub fn samples_in_window(&self) -> usize {
        self.window.len()
    }

    fn take_sample(&mut self, now: Instant) -> AlpacaResult<()> {
        let sample = self.sensor.sample()?;
        if self.window.len() == AVG_SAMPLE_COUNT {
            self.window.pop_front();
        }
        self.window.push_back(sample.clone());
        self.latest = sample;
        self.last_update = Some(now);
        Ok(())
    }

    fn averaged(&self, pick: fn(&EnvironmentSample) -> Option<f64>) -> Option<f64> {
        mean(self.window.iter().filter_map(pick))
    }

    /// Current value of a sensor, `None` when the station lacks it
    pub fn reading(&self, sensor: Sensor) -> Option<f64> {
        match sensor {
            Sensor::Temperature => self.averaged(|s| s.temperature),
            Sensor::Pressure => self.averaged(|s| s.pressure_hpa),
            Sensor::Humidity => self.averaged(|s| s.humidity),
            Sensor::DewPoint => {
                let temperature = self.reading(Sensor::Temperature)?;
                let humidity = self.reading(Sensor::Humidity)?;
                Some(dew_point(temperature, humidity))
            }
            Sensor::CloudCover => self.latest.cloud_cover,
            Sensor::RainRate => self.latest.rain_rate,
            Sensor::SkyBrightness => self.latest.sky_brightness,
            Sensor::SkyQuality => self.latest.sky_quality,
            Sensor::SkyTemperature => self.latest.sky_temperature,
            Sensor::StarFwhm => self.latest.star_fwhm,
            Sensor::WindDirection => self.latest.wind_direction,
            Sensor::WindGust => self.latest.wind_gust,
            Sensor::WindSpeed => self.latest.wind_speed,
        }
    }

    fn supports(&self, sensor: Sensor) -> bool {
        match sensor {
            Sensor::DewPoint => {
                self.sensor.describe(Sensor::Temperature).is_some()
                    && self.sensor.describe(Sensor::Humidity).is_some()
            }
            other => self.sensor.describe(other).is_some(),
        }
    }

    #[track_caller]
    fn sensor_argument(&self, ctx: &CommandContext<'_>) -> AlpacaResult<Option<Sensor>> {
        let name = ctx.request.params.required(COMPONENT, "SensorName")?;
        if name.trim().is_empty() {
            return Ok(None);
        }
        match Sensor::from_property(name.trim()) {
            Some(sensor) if self.supports(sensor) => Ok(Some(sensor)),
            Some(sensor) => Err(AlpacaError::not_implemented(COMPONENT, sensor.property())),
            None => Err(AlpacaError::invalid_value(COMPONENT, format!("unknown sensor '{}'", name))),
        }
    }

    fn write_read_all(&self, ctx: &mut CommandContext<'_>) {
        ctx.write_common_properties();
        let out = &mut *ctx.response;
        out.field("averageperiod", self.average_period_hours);
        for sensor in Sensor::ALL {
            if let Some(value) = self.reading(sensor) {
                out.field(sensor.property(), value);
            }
        }
        if let Some(last) = self.last_update {
            out.field("timesincelastupdate", last.elapsed().as_secs_f64());
        }
    }
}

impl DeviceDriver for ObservingConditionsDriver {
    fn device_type(&self) -> AlpacaDeviceType {
        AlpacaDeviceType::ObservingConditions
    }

    fn command_table(&self) -> CommandTable {
        OBSERVING_CONDITIONS_COMMANDS
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: format!("Weather {}", self.sensor.model()),
            description: "Alpaca observing conditions".to_string(),
            manufacturer: "alpaca_host".to_string(),
            model: self.sensor.model().to_string(),
            driver_info: "Averaging observing-conditions driver".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            interface_version: 1,
            ..Default::default()
        }
    }

    fn handle_command(&mut self, entry: &CommandEntry, ctx: &mut CommandContext<'_>) -> AlpacaResult<()> {
        if let Some(sensor) = Sensor::from_code(entry.code) {
            return match self.reading(sensor) {
                Some(value) => {
                    ctx.response.value(value);
                    Ok(())
                }
                None if self.supports(sensor) => Err(AlpacaError::new(
                    AscomStatus::ValueNotSet,
                    COMPONENT,
                    format!("no {} reading yet", sensor.property()),
                )),
                None => Err(AlpacaError::not_implemented(COMPONENT, sensor.property())),
            };
        }

        match entry.code {
            cmd::AVERAGE_PERIOD => match ctx.request.verb {
                Verb::Get => ctx.response.value(self.average_period_hours),
                Verb::Put => {
                    let hours = ctx.request.params.required_f64(COMPONENT, "AveragePeriod")?;
                    if !(0.0..=24.0).contains(&hours) {
                        return Err(AlpacaError::invalid_value(
                            COMPONENT,
                            format!("AveragePeriod {} outside 0..24 hours", hours),
                        ));
                    }
                    self.average_period_hours = hours;
                }
            },
            cmd::REFRESH => {
                ctx.require_connected(COMPONENT)?;
                self.take_sample(Instant::now())?;
            }
            cmd::SENSOR_DESCRIPTION => {
                let description = match self.sensor_argument(ctx)? {
                    Some(Sensor::DewPoint) => "Derived from temperature and humidity".to_string(),
                    Some(sensor) => self.sensor.describe(sensor).unwrap_or_default(),
                    None => self.sensor.model().to_string(),
                };
                ctx.response.value(description);
            }
            cmd::TIME_SINCE_LAST_UPDATE => {
                self.sensor_argument(ctx)?;
                match self.last_update {
                    Some(last) => ctx.response.value(last.elapsed().as_secs_f64()),
                    None => {
                        return Err(AlpacaError::new(
                            AscomStatus::ValueNotSet,
                            COMPONENT,
                            "no sample taken yet",
                        ))
                    }
                }
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
        match self.state {
            ObservingState::Startup => {
                if let Err(e) = self.take_sample(now) {
                    warn!(error = %e, "Weather sample failed during startup");
                    return SAMPLE_INTERVAL;
                }
                if self.window.len() >= AVG_SAMPLE_COUNT {
                    info!(samples = self.window.len(), "Averaging window filled");
                    self.state = ObservingState::Idle;
                    SAMPLE_INTERVAL
                } else {
                    STARTUP_INTERVAL
                }
            }
            ObservingState::Idle => {
                let due = self
                    .last_update
                    .map(|last| now.saturating_duration_since(last) >= SAMPLE_INTERVAL)
                    .unwrap_or(true);
                if due {
                    if let Err(e) = self.take_sample(now) {
                        warn!(error = %e, "Weather sample failed");
                    }
                    return SAMPLE_INTERVAL;
                }
                self.last_update
                    .map(|last| SAMPLE_INTERVAL.saturating_sub(now.saturating_duration_since(last)))
                    .unwrap_or(SAMPLE_INTERVAL)
            }
        }
    }

    fn device_state(&self) -> Vec<(&'static str, Value)> {
        let mut state = Vec::new();
        for (name, sensor) in [
            ("DewPoint", Sensor::DewPoint),
            ("Humidity", Sensor::Humidity),
            ("Pressure", Sensor::Pressure),
            ("Temperature", Sensor::Temperature),
        ] {
            if let Some(value) = self.reading(sensor) {
                state.push((name, Value::from(value)));
            }
        }
        state
    }

    fn temperature(&self) -> Option<f64> {
        self.reading(Sensor::Temperature)
    }

    fn reports_temperature(&self) -> bool {
        self.supports(Sensor::Temperature)
    }
}

/// Simulated station with a slowly drifting temperature
#[derive(Debug, Clone)]
pub struct SimulatedWeather {
    counter: u32,
    base_temperature: f64,
}

impl Default for SimulatedWeather {
    fn default() -> Self {
        Self {
            counter: 0,
            base_temperature: 12.5,
        }
    }
}

impl EnvironmentSensor for SimulatedWeather {
    fn model(&self) -> &str {
        "Simulator"
    }

    fn describe(&self, sensor: Sensor) -> Option<String> {
        match sensor {
            Sensor::Temperature => Some("Simulated temperature sensor".to_string()),
            Sensor::Pressure => Some("Simulated barometer".to_string()),
            Sensor::Humidity => Some("Simulated hygrometer".to_string()),
            _ => None,
        }
    }

    fn sample(&mut self) -> AlpacaResult<EnvironmentSample> {
        self.counter = self.counter.wrapping_add(1);
        let drift = (f64::from(self.counter % 20) - 10.0) * 0.05;
        Ok(EnvironmentSample {
            temperature: Some(self.base_temperature + drift),
            pressure_hpa: Some(1013.2),
            humidity: Some(55.0),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::run_command;
    use crate::request::AlpacaRequest;

    fn filled() -> ObservingConditionsDriver {
        let mut driver = ObservingConditionsDriver::simulator();
        let mut now = Instant::now();
        while driver.state() == ObservingState::Startup {
            now += driver.tick(now);
        }
        driver
    }

    #[test]
    fn test_startup_fills_window_then_idles() {
        let mut driver = ObservingConditionsDriver::simulator();
        let now = Instant::now();
        assert_eq!(driver.tick(now), STARTUP_INTERVAL);
        assert_eq!(driver.state(), ObservingState::Startup);

        let driver = filled();
        assert_eq!(driver.state(), ObservingState::Idle);
        assert_eq!(driver.samples_in_window(), AVG_SAMPLE_COUNT);
    }

    #[test]
    fn test_idle_samples_every_interval() {
        let mut driver = filled();
        let now = Instant::now() + Duration::from_secs(60);
        assert_eq!(driver.tick(now), SAMPLE_INTERVAL);
        let remaining = driver.tick(now + Duration::from_secs(4));
        assert_eq!(remaining, Duration::from_secs(6));
        assert_eq!(driver.samples_in_window(), AVG_SAMPLE_COUNT);
    }

    #[test]
    fn test_readings_are_averaged() {
        let driver = filled();
        let temperature = driver.reading(Sensor::Temperature).unwrap();
        assert!((temperature - 12.475).abs() < 1e-9);
        let pressure = driver.reading(Sensor::Pressure).unwrap();
        assert!((pressure - 1013.2).abs() < 1e-9, "pressure {}", pressure);
        let dew = driver.reading(Sensor::DewPoint).unwrap();
        assert!(dew > 3.0 && dew < 4.0, "dew point {}", dew);
    }

    #[test]
    fn test_missing_sensor_is_not_implemented() {
        let mut driver = filled();
        let (result, _) = run_command(&mut driver, &AlpacaRequest::get("observingconditions", 0, "windspeed"), true);
        assert_eq!(result.unwrap_err().status, AscomStatus::NotImplemented);

        let (result, out) = run_command(&mut driver, &AlpacaRequest::get("observingconditions", 0, "humidity"), true);
        assert!(result.is_ok());
        assert_eq!(out.get("Value"), Some(&Value::from(55.0)));
    }

    #[test]
    fn test_no_reading_before_first_sample() {
        let mut driver = ObservingConditionsDriver::simulator();
        let (result, _) = run_command(&mut driver, &AlpacaRequest::get("observingconditions", 0, "temperature"), true);
        assert_eq!(result.unwrap_err().status, AscomStatus::ValueNotSet);
    }

    #[test]
    fn test_sensor_description_arguments() {
        let mut driver = filled();
        let request = AlpacaRequest::get("observingconditions", 0, "sensordescription")
            .with_param("SensorName", "Pressure");
        let (result, out) = run_command(&mut driver, &request, true);
        assert!(result.is_ok());
        assert_eq!(out.get("Value"), Some(&Value::from("Simulated barometer")));

        let request = AlpacaRequest::get("observingconditions", 0, "sensordescription")
            .with_param("SensorName", "starfwhm");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::NotImplemented);

        let request = AlpacaRequest::get("observingconditions", 0, "sensordescription")
            .with_param("SensorName", "banana");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidValue);

        let request = AlpacaRequest::get("observingconditions", 0, "timesincelastupdate");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidValue);
    }

    #[test]
    fn test_average_period_bounds() {
        let mut driver = filled();
        let request = AlpacaRequest::put("observingconditions", 0, "averageperiod").with_param("AveragePeriod", "-1");
        assert_eq!(run_command(&mut driver, &request, true).0.unwrap_err().status, AscomStatus::InvalidValue);
        let request = AlpacaRequest::put("observingconditions", 0, "averageperiod").with_param("AveragePeriod", "0.5");
        assert!(run_command(&mut driver, &request, true).0.is_ok());
        let (_, out) = run_command(&mut driver, &AlpacaRequest::get("observingconditions", 0, "averageperiod"), true);
        assert_eq!(out.get("Value"), Some(&Value::from(0.5)));
    }

    #[test]
    fn test_dew_point_formula() {
        assert!((dew_point(20.0, 100.0) - 20.0).abs() < 0.01);
        assert!(dew_point(20.0, 50.0) < 10.0);
    }
}
