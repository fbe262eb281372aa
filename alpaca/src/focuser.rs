//! Focuser device: command handling over a pluggable motor back end

use crate::commands::{CommandEntry, CommandTable, Verb};
use crate::device::DeviceIdentity;
use crate::driver::{CommandContext, DeviceDriver};
use crate::status::{AlpacaError, AlpacaResult, AscomStatus};
use crate::AlpacaDeviceType;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const COMPONENT: &str = "Focuser";

/// Polling cadence while the motor is running
pub const FOCUSER_MOVING_POLL: Duration = Duration::from_millis(100);
/// Polling cadence at rest
pub const FOCUSER_IDLE_POLL: Duration = Duration::from_secs(1);

pub mod cmd {
    use crate::commands::CommandCode;

    pub const ABSOLUTE: CommandCode = 1000;
    pub const IS_MOVING: CommandCode = 1001;
    pub const MAX_INCREMENT: CommandCode = 1002;
    pub const MAX_STEP: CommandCode = 1003;
    pub const POSITION: CommandCode = 1004;
    pub const STEP_SIZE: CommandCode = 1005;
    pub const TEMP_COMP: CommandCode = 1006;
    pub const TEMP_COMP_AVAILABLE: CommandCode = 1007;
    pub const TEMPERATURE: CommandCode = 1008;
    pub const HALT: CommandCode = 1009;
    pub const MOVE: CommandCode = 1010;
    pub const EXTRAS: CommandCode = 1011;
    pub const MOVE_RELATIVE: CommandCode = 1012;
    pub const READ_ALL: CommandCode = 1013;
}

pub static FOCUSER_COMMANDS: &[CommandEntry] = &[
    CommandEntry::get("absolute", cmd::ABSOLUTE),
    CommandEntry::get("ismoving", cmd::IS_MOVING),
    CommandEntry::get("maxincrement", cmd::MAX_INCREMENT),
    CommandEntry::get("maxstep", cmd::MAX_STEP),
    CommandEntry::get("position", cmd::POSITION),
    CommandEntry::get("stepsize", cmd::STEP_SIZE),
    CommandEntry::both("tempcomp", cmd::TEMP_COMP),
    CommandEntry::get("tempcompavailable", cmd::TEMP_COMP_AVAILABLE),
    CommandEntry::get("temperature", cmd::TEMPERATURE),
    CommandEntry::put("halt", cmd::HALT),
    CommandEntry::put("move", cmd::MOVE),
    CommandEntry::get("--extras", cmd::EXTRAS),
    CommandEntry::put("moverelative", cmd::MOVE_RELATIVE),
    CommandEntry::get("readall", cmd::READ_ALL),
];

/// Fixed characteristics of a focuser
#[derive(Debug, Clone, PartialEq)]
pub struct FocuserCapabilities {
    pub absolute: bool,
    pub max_step: i32,
    pub max_increment: i32,
    pub step_size: f64,
    pub temp_comp_available: bool,
    /// A temperature probe is fitted
    pub has_temperature: bool,
}

/// Last state read from the hardware
#[derive(Debug, Clone, PartialEq)]
pub struct FocuserStatus {
    pub position: i32,
    pub is_moving: bool,
    pub temperature: Option<f64>,
}

/// Hardware strategy behind [`FocuserDriver`]
pub trait FocuserHardware: Send {
    fn model(&self) -> &str;

    fn capabilities(&self) -> FocuserCapabilities;

    /// Begin moving to an absolute step position; must not block.
    fn start_move(&mut self, target: i32) -> AlpacaResult<()>;

    fn halt(&mut self) -> AlpacaResult<()>;

    /// Read the current state
    fn poll(&mut self, now: Instant) -> AlpacaResult<FocuserStatus>;
}

/// Focuser device-type handler
pub struct FocuserDriver {
    hardware: Box<dyn FocuserHardware>,
    capabilities: FocuserCapabilities,
    status: FocuserStatus,
    target: i32,
    temp_comp: bool,
}

impl FocuserDriver {
    pub fn new(hardware: Box<dyn FocuserHardware>) -> Self {
        let capabilities = hardware.capabilities();
        Self {
            hardware,
            capabilities,
            status: FocuserStatus {
                position: 0,
                is_moving: false,
                temperature: None,
            },
            target: 0,
            temp_comp: false,
        }
        .primed()
    }

    pub fn simulator() -> Self {
        Self::new(Box::new(SimulatedFocuser::default()))
    }

    /// First read forces a full status refresh
    fn primed(mut self) -> Self {
        if let Ok(status) = self.hardware.poll(Instant::now()) {
            self.target = status.position;
            self.status = status;
        }
        self
    }

    pub fn status(&self) -> &FocuserStatus {
        &self.status
    }

    fn move_to(&mut self, target: i32) -> AlpacaResult<()> {
        if target < 0 || target > self.capabilities.max_step {
            return Err(AlpacaError::invalid_value(
                COMPONENT,
                format!("Position {} outside 0..{}", target, self.capabilities.max_step),
            ));
        }
        self.hardware.start_move(target)?;
        self.target = target;
        self.status.is_moving = target != self.status.position;
        debug!(target, "Focuser move started");
        Ok(())
    }

    fn current_temperature(&self) -> AlpacaResult<f64> {
        match self.status.temperature {
            Some(degrees_c) => Ok(degrees_c),
            None => Err(AlpacaError::not_implemented(COMPONENT, "temperature")),
        }
    }

    fn write_read_all(&self, ctx: &mut CommandContext<'_>) {
        ctx.write_common_properties();
        let out = &mut *ctx.response;
        out.field("absolute", self.capabilities.absolute);
        out.field("ismoving", self.status.is_moving);
        out.field("maxincrement", self.capabilities.max_increment);
        out.field("maxstep", self.capabilities.max_step);
        out.field("position", self.status.position);
        out.field("stepsize", self.capabilities.step_size);
        out.field("tempcomp", self.temp_comp);
        out.field("tempcompavailable", self.capabilities.temp_comp_available);
        if let Some(temperature) = self.status.temperature {
            out.field("temperature", temperature);
        }
    }
}

impl DeviceDriver for FocuserDriver {
    fn device_type(&self) -> AlpacaDeviceType {
        AlpacaDeviceType::Focuser
    }

    fn command_table(&self) -> CommandTable {
        FOCUSER_COMMANDS
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: format!("Focuser {}", self.hardware.model()),
            description: "Alpaca focuser".to_string(),
            manufacturer: "alpaca_host".to_string(),
            model: self.hardware.model().to_string(),
            driver_info: "Focuser driver with pluggable motor back end".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            interface_version: 3,
            ..Default::default()
        }
    }

    fn handle_command(&mut self, entry: &CommandEntry, ctx: &mut CommandContext<'_>) -> AlpacaResult<()> {
        let request = ctx.request;
        let params = &request.params;
        match entry.code {
            cmd::ABSOLUTE => ctx.response.value(self.capabilities.absolute),
            cmd::IS_MOVING => ctx.response.value(self.status.is_moving),
            cmd::MAX_INCREMENT => ctx.response.value(self.capabilities.max_increment),
            cmd::MAX_STEP => ctx.response.value(self.capabilities.max_step),
            cmd::POSITION => ctx.response.value(self.status.position),
            cmd::STEP_SIZE => ctx.response.value(self.capabilities.step_size),
            cmd::TEMP_COMP_AVAILABLE => ctx.response.value(self.capabilities.temp_comp_available),
            cmd::TEMP_COMP => match request.verb {
                Verb::Get => ctx.response.value(self.temp_comp),
                Verb::Put => {
                    let enabled = params.required_bool(COMPONENT, "TempComp")?;
                    if !self.capabilities.temp_comp_available {
                        return Err(AlpacaError::not_implemented(COMPONENT, "tempcomp"));
                    }
                    self.temp_comp = enabled;
                }
            },
            cmd::TEMPERATURE => {
                let degrees_c = self.current_temperature()?;
                ctx.response.value(degrees_c);
                ctx.response.field("Degrees-F", degrees_c * 9.0 / 5.0 + 32.0);
            }
            cmd::HALT => {
                ctx.require_connected(COMPONENT)?;
                self.hardware.halt()?;
                self.status.is_moving = false;
                self.target = self.status.position;
            }
            cmd::MOVE => {
                ctx.require_connected(COMPONENT)?;
                let target = params.required_i32(COMPONENT, "Position")?;
                self.move_to(target)?;
            }
            cmd::MOVE_RELATIVE => {
                ctx.require_connected(COMPONENT)?;
                let offset = params.required_i32(COMPONENT, "Position")?;
                self.move_to(self.status.position.saturating_add(offset))?;
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
            Err(e) => debug!(error = %e, "Focuser poll failed"),
        }
        if self.status.is_moving {
            FOCUSER_MOVING_POLL
        } else {
            FOCUSER_IDLE_POLL
        }
    }

    fn device_state(&self) -> Vec<(&'static str, Value)> {
        let mut state = vec![
            ("IsMoving", Value::from(self.status.is_moving)),
            ("Position", Value::from(self.status.position)),
        ];
        if let Some(temperature) = self.status.temperature {
            state.push(("Temperature", Value::from(temperature)));
        }
        state
    }

    fn temperature(&self) -> Option<f64> {
        self.status.temperature
    }

    fn reports_temperature(&self) -> bool {
        self.capabilities.has_temperature
    }

    fn watchdog_timeout(&mut self) {
        if self.status.is_moving {
            info!(position = self.status.position, "Watchdog expired, halting focuser");
            if self.hardware.halt().is_ok() {
                self.status.is_moving = false;
            }
        }
    }
}

/// Software focuser that walks toward its target at a fixed rate
#[derive(Debug, Clone)]
pub struct SimulatedFocuser {
    position: f64,
    target: i32,
    steps_per_sec: f64,
    temperature: f64,
    last_poll: Option<Instant>,
}

impl Default for SimulatedFocuser {
    fn default() -> Self {
        Self {
            position: 4570.0,
            target: 4570,
            steps_per_sec: 2000.0,
            temperature: 22.3,
            last_poll: None,
        }
    }
}

impl SimulatedFocuser {
    fn is_moving(&self) -> bool {
        (self.position - f64::from(self.target)).abs() >= 0.5
    }
}

impl FocuserHardware for SimulatedFocuser {
    fn model(&self) -> &str {
        "Simulator"
    }

    fn capabilities(&self) -> FocuserCapabilities {
        FocuserCapabilities {
            absolute: true,
            max_step: 87000,
            max_increment: 10000,
            step_size: 0.2667,
            temp_comp_available: false,
            has_temperature: true,
        }
    }

    fn start_move(&mut self, target: i32) -> AlpacaResult<()> {
        self.target = target;
        Ok(())
    }

    fn halt(&mut self) -> AlpacaResult<()> {
        self.target = self.position.round() as i32;
        self.position = f64::from(self.target);
        Ok(())
    }

    fn poll(&mut self, now: Instant) -> AlpacaResult<FocuserStatus> {
        let elapsed = self
            .last_poll
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_poll = Some(now);

        let remaining = f64::from(self.target) - self.position;
        let step = self.steps_per_sec * elapsed;
        if remaining.abs() <= step {
            self.position = f64::from(self.target);
        } else {
            self.position += step.copysign(remaining);
        }

        Ok(FocuserStatus {
            position: self.position.round() as i32,
            is_moving: self.is_moving(),
            temperature: Some(self.temperature),
        })
    }
}
