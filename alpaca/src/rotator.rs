//! Rotator device

use crate::commands::{CommandEntry, CommandTable, Verb};
use crate::device::DeviceIdentity;
use crate::driver::{CommandContext, DeviceDriver};
use crate::status::{AlpacaError, AlpacaResult, AscomStatus};
use crate::AlpacaDeviceType;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const COMPONENT: &str = "Rotator";

pub const ROTATOR_MOVING_POLL: Duration = Duration::from_millis(100);
pub const ROTATOR_IDLE_POLL: Duration = Duration::from_secs(1);

pub mod cmd {
    use crate::commands::CommandCode;

    pub const CAN_REVERSE: CommandCode = 1000;
    pub const IS_MOVING: CommandCode = 1001;
    pub const MECHANICAL_POSITION: CommandCode = 1002;
    pub const POSITION: CommandCode = 1003;
    pub const REVERSE: CommandCode = 1004;
    pub const STEP_SIZE: CommandCode = 1005;
    pub const TARGET_POSITION: CommandCode = 1006;
    pub const HALT: CommandCode = 1007;
    pub const MOVE: CommandCode = 1008;
    pub const MOVE_ABSOLUTE: CommandCode = 1009;
    pub const MOVE_MECHANICAL: CommandCode = 1010;
    pub const SYNC: CommandCode = 1011;
    pub const EXTRAS: CommandCode = 1012;
    pub const STEP: CommandCode = 1013;
    pub const STEP_ABSOLUTE: CommandCode = 1014;
    pub const READ_ALL: CommandCode = 1015;
}

pub static ROTATOR_COMMANDS: &[CommandEntry] = &[
    CommandEntry::get("canreverse", cmd::CAN_REVERSE),
    CommandEntry::get("ismoving", cmd::IS_MOVING),
    CommandEntry::get("mechanicalposition", cmd::MECHANICAL_POSITION),
    CommandEntry::get("position", cmd::POSITION),
    CommandEntry::both("reverse", cmd::REVERSE),
    CommandEntry::get("stepsize", cmd::STEP_SIZE),
    CommandEntry::get("targetposition", cmd::TARGET_POSITION),
    CommandEntry::put("halt", cmd::HALT),
    CommandEntry::put("move", cmd::MOVE),
    CommandEntry::put("moveabsolute", cmd::MOVE_ABSOLUTE),
    CommandEntry::put("movemechanical", cmd::MOVE_MECHANICAL),
    CommandEntry::put("sync", cmd::SYNC),
    CommandEntry::get("--extras", cmd::EXTRAS),
    CommandEntry::put("step", cmd::STEP),
    CommandEntry::put("stepabsolute", cmd::STEP_ABSOLUTE),
    CommandEntry::get("readall", cmd::READ_ALL),
];

/// Wrap an angle into `[0, 360)`
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RotatorCapabilities {
    pub can_reverse: bool,
    pub steps_per_rev: u32,
}

impl RotatorCapabilities {
    pub fn step_size(&self) -> f64 {
        360.0 / f64::from(self.steps_per_rev.max(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RotatorStatus {
    /// Mechanical angle in degrees
    pub mechanical: f64,
    pub is_moving: bool,
}

/// Hardware strategy behind [`RotatorDriver`]
pub trait RotatorHardware: Send {
    fn model(&self) -> &str;

    fn capabilities(&self) -> RotatorCapabilities;

    /// Begin moving to a mechanical angle in `[0, 360)`
    fn start_move(&mut self, mechanical: f64) -> AlpacaResult<()>;

    fn halt(&mut self) -> AlpacaResult<()>;

    fn set_reverse(&mut self, _reverse: bool) -> AlpacaResult<()> {
        Err(AlpacaError::not_implemented(COMPONENT, "reverse"))
    }

    fn poll(&mut self, now: Instant) -> AlpacaResult<RotatorStatus>;
}

/// Rotator device-type handler.
///
/// Sky position is the mechanical angle plus a sync offset.
pub struct RotatorDriver {
    hardware: Box<dyn RotatorHardware>,
    capabilities: RotatorCapabilities,
    status: RotatorStatus,
    target_mechanical: f64,
    sync_offset: f64,
    reverse: bool,
}

impl RotatorDriver {
    pub fn new(hardware: Box<dyn RotatorHardware>) -> Self {
        let capabilities = hardware.capabilities();
        let mut driver = Self {
            hardware,
            capabilities,
            status: RotatorStatus {
                mechanical: 0.0,
                is_moving: false,
            },
            target_mechanical: 0.0,
            sync_offset: 0.0,
            reverse: false,
        };
        if let Ok(status) = driver.hardware.poll(Instant::now()) {
            driver.target_mechanical = status.mechanical;
            driver.status = status;
        }
        driver
    }

    pub fn simulator() -> Self {
        Self::new(Box::new(SimulatedRotator::default()))
    }

    pub fn status(&self) -> &RotatorStatus {
        &self.status
    }

    pub fn position(&self) -> f64 {
        wrap_degrees(self.status.mechanical + self.sync_offset)
    }

    pub fn target_position(&self) -> f64 {
        wrap_degrees(self.target_mechanical + self.sync_offset)
    }

    fn move_mechanical(&mut self, mechanical: f64) -> AlpacaResult<()> {
        let mechanical = wrap_degrees(mechanical);
        self.hardware.start_move(mechanical)?;
        self.target_mechanical = mechanical;
        self.status.is_moving = (mechanical - self.status.mechanical).abs() > f64::EPSILON;
        debug!(mechanical, "Rotator move started");
        Ok(())
    }

    fn write_read_all(&self, ctx: &mut CommandContext<'_>) {
        ctx.write_common_properties();
        let out = &mut *ctx.response;
        out.field("canreverse", self.capabilities.can_reverse);
        out.field("ismoving", self.status.is_moving);
        out.field("mechanicalposition", self.status.mechanical);
        out.field("position", self.position());
        out.field("reverse", self.reverse);
        out.field("stepsize", self.capabilities.step_size());
        out.field("targetposition", self.target_position());
    }
}

#[track_caller]
fn angle_in_range(angle: f64) -> AlpacaResult<f64> {
    if (0.0..360.0).contains(&angle) {
        Ok(angle)
    } else {
        Err(AlpacaError::invalid_value(
            COMPONENT,
            format!("Position {} outside 0..360", angle),
        ))
    }
}

impl DeviceDriver for RotatorDriver {
    fn device_type(&self) -> AlpacaDeviceType {
        AlpacaDeviceType::Rotator
    }

    fn command_table(&self) -> CommandTable {
        ROTATOR_COMMANDS
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: format!("Rotator {}", self.hardware.model()),
            description: "Alpaca rotator".to_string(),
            manufacturer: "alpaca_host".to_string(),
            model: self.hardware.model().to_string(),
            driver_info: "Rotator driver with pluggable motor back end".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            interface_version: 3,
            ..Default::default()
        }
    }

    fn handle_command(&mut self, entry: &CommandEntry, ctx: &mut CommandContext<'_>) -> AlpacaResult<()> {
        let request = ctx.request;
        let params = &request.params;
        match entry.code {
            cmd::CAN_REVERSE => ctx.response.value(self.capabilities.can_reverse),
            cmd::IS_MOVING => ctx.response.value(self.status.is_moving),
            cmd::MECHANICAL_POSITION => ctx.response.value(self.status.mechanical),
            cmd::POSITION => ctx.response.value(self.position()),
            cmd::STEP_SIZE => ctx.response.value(self.capabilities.step_size()),
            cmd::TARGET_POSITION => ctx.response.value(self.target_position()),
            cmd::REVERSE => match request.verb {
                Verb::Get => ctx.response.value(self.reverse),
                Verb::Put => {
                    let reverse = params.required_bool(COMPONENT, "Reverse")?;
                    if !self.capabilities.can_reverse {
                        return Err(AlpacaError::not_implemented(COMPONENT, "reverse"));
                    }
                    self.hardware.set_reverse(reverse)?;
                    self.reverse = reverse;
                }
            },
            cmd::HALT => {
                ctx.require_connected(COMPONENT)?;
                self.hardware.halt()?;
                self.status.is_moving = false;
                self.target_mechanical = self.status.mechanical;
            }
            cmd::MOVE => {
                ctx.require_connected(COMPONENT)?;
                let offset = params.required_f64(COMPONENT, "Position")?;
                self.move_mechanical(self.target_mechanical + offset)?;
            }
            cmd::MOVE_ABSOLUTE => {
                ctx.require_connected(COMPONENT)?;
                let sky = angle_in_range(params.required_f64(COMPONENT, "Position")?)?;
                self.move_mechanical(sky - self.sync_offset)?;
            }
            cmd::MOVE_MECHANICAL => {
                ctx.require_connected(COMPONENT)?;
                let mechanical = angle_in_range(params.required_f64(COMPONENT, "Position")?)?;
                self.move_mechanical(mechanical)?;
            }
            cmd::SYNC => {
                let sky = angle_in_range(params.required_f64(COMPONENT, "Position")?)?;
                self.sync_offset = sky - self.status.mechanical;
                info!(offset = self.sync_offset, "Rotator synced");
            }
            cmd::STEP => {
                ctx.require_connected(COMPONENT)?;
                let steps = params.required_i32(COMPONENT, "Step")?;
                let degrees = f64::from(steps) * self.capabilities.step_size();
                self.move_mechanical(self.target_mechanical + degrees)?;
            }
            cmd::STEP_ABSOLUTE => {
                ctx.require_connected(COMPONENT)?;
                let steps = params.required_i32(COMPONENT, "Step")?;
                if steps < 0 || steps as u32 >= self.capabilities.steps_per_rev {
                    return Err(AlpacaError::invalid_value(
                        COMPONENT,
                        format!("Step {} outside 0..{}", steps, self.capabilities.steps_per_rev),
                    ));
                }
                self.move_mechanical(f64::from(steps) * self.capabilities.step_size())?;
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
            Err(e) => debug!(error = %e, "Rotator poll failed"),
        }
        if self.status.is_moving {
            ROTATOR_MOVING_POLL
        } else {
            ROTATOR_IDLE_POLL
        }
    }

    fn device_state(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("IsMoving", Value::from(self.status.is_moving)),
            ("MechanicalPosition", Value::from(self.status.mechanical)),
            ("Position", Value::from(self.position())),
        ]
    }

    fn watchdog_timeout(&mut self) {
        if self.status.is_moving {
            info!(position = self.position(), "Watchdog expired, halting rotator");
            if self.hardware.halt().is_ok() {
                self.status.is_moving = false;
            }
        }
    }
}

/// Software rotator turning at a fixed angular rate along the short way
#[derive(Debug, Clone)]
pub struct SimulatedRotator {
    mechanical: f64,
    target: f64,
    degrees_per_sec: f64,
    last_poll: Option<Instant>,
}

impl Default for SimulatedRotator {
    fn default() -> Self {
        Self {
            mechanical: 0.0,
            target: 0.0,
            degrees_per_sec: 10.0,
            last_poll: None,
        }
    }
}

impl RotatorHardware for SimulatedRotator {
    fn model(&self) -> &str {
        "Simulator"
    }

    fn capabilities(&self) -> RotatorCapabilities {
        RotatorCapabilities {
            can_reverse: false,
            steps_per_rev: 1000,
        }
    }

    fn start_move(&mut self, mechanical: f64) -> AlpacaResult<()> {
        self.target = mechanical;
        Ok(())
    }

    fn halt(&mut self) -> AlpacaResult<()> {
        self.target = self.mechanical;
        Ok(())
    }

    fn poll(&mut self, now: Instant) -> AlpacaResult<RotatorStatus> {
        let elapsed = self
            .last_poll
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_poll = Some(now);

        // shortest signed distance, in (-180, 180]
        let mut delta = (self.target - self.mechanical).rem_euclid(360.0);
        if delta > 180.0 {
            delta -= 360.0;
        }
        let step = self.degrees_per_sec * elapsed;
        if delta.abs() <= step {
            self.mechanical = self.target;
        } else {
            self.mechanical = wrap_degrees(self.mechanical + step.copysign(delta));
        }

        Ok(RotatorStatus {
            mechanical: self.mechanical,
            is_moving: (self.mechanical - self.target).abs() > 1e-9,
        })
    }
}
