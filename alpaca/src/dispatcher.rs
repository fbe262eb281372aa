//! Request dispatch
//!
//! Resolves `(device type, device number, command, verb)` to a handler,
//! runs it under the device lock and wraps the outcome in the response
//! envelope. Statistics are updated while the same lock is held, so a
//! command is never observable half-recorded.

use crate::commands::{
    advertised_names, common, resolve, resolve_for_device, CommandEntry, Resolved, Verb, COMMON_COMMANDS,
};
use crate::device::{DeviceIdentity, DeviceRecord, DeviceSummary};
use crate::driver::{CommandContext, HostTotals, ServerInfo};
use crate::registry::{DeviceHandle, Registry};
use crate::request::{AlpacaRequest, AlpacaResponse, ResponseFields};
use crate::stats::CmdStats;
use crate::status::{AlpacaError, AlpacaResult, AscomStatus};
use crate::AlpacaDeviceType;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const COMPONENT: &str = "Dispatcher";

pub struct Dispatcher {
    registry: Arc<Registry>,
    server: ServerInfo,
    server_transaction_id: AtomicU32,
    total_commands: AtomicU64,
    total_errors: AtomicU64,
}

/// Usage row shown on the diagnostics page
#[derive(Debug, Clone, PartialEq)]
pub struct CommandUsage {
    pub name: &'static str,
    pub code: u16,
    pub stats: CmdStats,
}

/// Read-only copy of a device's state for diagnostics
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub summary: DeviceSummary,
    pub identity: DeviceIdentity,
    pub connected: bool,
    pub properties: Map<String, Value>,
    pub usage: Vec<CommandUsage>,
    pub total_commands: u64,
    pub total_errors: u64,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, server: ServerInfo) -> Self {
        Self {
            registry,
            server,
            server_transaction_id: AtomicU32::new(0),
            total_commands: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub fn totals(&self) -> HostTotals {
        HostTotals {
            commands: self.total_commands.load(Ordering::Relaxed),
            errors: self.total_errors.load(Ordering::Relaxed),
        }
    }

    fn next_server_transaction_id(&self) -> u32 {
        self.server_transaction_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Handle one request. Always produces a complete envelope.
    pub async fn handle(&self, request: &AlpacaRequest) -> AlpacaResponse {
        let client_transaction_id = request.client_transaction_id();
        let server_transaction_id = self.next_server_transaction_id();

        let outcome = self.route(request).await;
        debug!(
            device_type = %request.device_type,
            device_number = %request.device_number,
            command = %request.command,
            verb = %request.verb,
            client_id = request.client_id(),
            server_transaction_id,
            error_number = outcome.as_ref().err().map(|e| e.code()).unwrap_or(0),
            "Dispatched request"
        );

        match outcome {
            Ok(fields) => AlpacaResponse::success(fields, client_transaction_id, server_transaction_id),
            Err(error) => AlpacaResponse::failure(&error, client_transaction_id, server_transaction_id),
        }
    }

    /// Find the addressed device; failures here leave statistics untouched.
    #[track_caller]
    pub fn lookup(&self, device_type: &str, device_number: &str) -> AlpacaResult<DeviceHandle> {
        let Some(kind) = AlpacaDeviceType::from_str(device_type) else {
            return Err(AlpacaError::invalid_value(
                COMPONENT,
                format!("unknown device type '{}'", device_type),
            ));
        };
        let Ok(number) = device_number.trim().parse::<u32>() else {
            return Err(AlpacaError::invalid_value(
                COMPONENT,
                format!("invalid device number '{}'", device_number),
            ));
        };
        match self.registry.find(kind, number) {
            Some(handle) => Ok(handle),
            None => Err(AlpacaError::invalid_value(
                COMPONENT,
                format!("{} {} is not registered", kind.as_str(), number),
            )),
        }
    }

    async fn route(&self, request: &AlpacaRequest) -> AlpacaResult<ResponseFields> {
        let handle = self.lookup(&request.device_type, &request.device_number)?;
        let mut record = handle.lock().await;

        let Some(resolved) = resolve_for_device(&request.command, record.driver.command_table())
            .filter(|resolved| !resolved.entry().is_hidden())
        else {
            record.stats.record_unresolved();
            self.count(true);
            return Err(AlpacaError::new(
                AscomStatus::NotImplemented,
                record.component(),
                format!("Unrecognized command '{}'", request.command),
            ));
        };

        let entry = resolved.entry();
        let outcome = if entry.verb.allows(request.verb) {
            let mut fields = ResponseFields::new();
            let totals = self.totals();
            self.execute(&mut record, resolved, request, &mut fields, totals)
                .map(|()| fields)
        } else {
            Err(AlpacaError::new(
                AscomStatus::NotImplemented,
                record.component(),
                format!("{} is not supported for '{}'", request.verb, entry.name),
            ))
        };

        let failed = outcome.is_err();
        record.stats.record(entry.code, request.verb, failed);
        if !failed {
            record.last_valid_command = Instant::now();
        }
        self.count(failed);
        outcome
    }

    fn count(&self, failed: bool) {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn execute(
        &self,
        record: &mut DeviceRecord,
        resolved: Resolved,
        request: &AlpacaRequest,
        fields: &mut ResponseFields,
        totals: HostTotals,
    ) -> AlpacaResult<()> {
        if let Resolved::Common(entry) = resolved {
            if let Some(result) = self.common_command(record, entry, request, fields) {
                return result;
            }
        }

        let component = record.component();
        let DeviceRecord {
            identity,
            connected,
            driver,
            ..
        } = record;
        let mut ctx = CommandContext {
            request,
            response: fields,
            identity,
            connected: *connected,
            registry: &self.registry,
            server: &self.server,
            totals,
        };

        match resolved {
            Resolved::Device(entry) => {
                let result = driver.handle_command(entry, &mut ctx);
                if result.is_err() {
                    ctx.response.clear();
                }
                result
            }
            Resolved::Common(entry) if entry.code == common::ACTION => {
                let name = request.params.required(component, "Action")?;
                let parameters = request.params.get("Parameters").unwrap_or_default();
                driver.action(name, parameters, &mut ctx)
            }
            Resolved::Common(entry) => Err(AlpacaError::new(
                AscomStatus::NotImplemented,
                COMPONENT,
                format!("Unrecognized command '{}'", entry.name),
            )),
        }
    }

    /// Shared commands that only touch the record itself.
    ///
    /// Returns `None` for commands that need the driver's full context.
    fn common_command(
        &self,
        record: &mut DeviceRecord,
        entry: &CommandEntry,
        request: &AlpacaRequest,
        out: &mut ResponseFields,
    ) -> Option<AlpacaResult<()>> {
        let component = record.component();
        let result = match entry.code {
            common::ACTION => return None,
            common::COMMAND_BLIND | common::COMMAND_BOOL | common::COMMAND_STRING => {
                Err(AlpacaError::not_implemented(component, entry.name))
            }
            common::CONNECTED => match request.verb {
                Verb::Get => {
                    out.value(record.connected);
                    Ok(())
                }
                Verb::Put => request
                    .params
                    .required_bool(component, "Connected")
                    .and_then(|connected| set_connected(record, connected)),
            },
            common::CONNECT => set_connected(record, true),
            common::DISCONNECT => set_connected(record, false),
            common::CONNECTING => {
                out.value(false);
                Ok(())
            }
            common::DEVICE_STATE => {
                let mut state: Vec<Value> = record
                    .driver
                    .device_state()
                    .into_iter()
                    .map(|(name, value)| json!({ "Name": name, "Value": value }))
                    .collect();
                state.push(json!({
                    "Name": "TimeStamp",
                    "Value": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                }));
                out.value(state);
                Ok(())
            }
            common::DESCRIPTION => {
                out.value(record.identity.description.as_str());
                Ok(())
            }
            common::DRIVER_INFO => {
                out.value(record.identity.driver_info.as_str());
                Ok(())
            }
            common::DRIVER_VERSION => {
                out.value(record.identity.driver_version.as_str());
                Ok(())
            }
            common::INTERFACE_VERSION => {
                out.value(record.identity.interface_version);
                Ok(())
            }
            common::NAME => {
                out.value(record.identity.name.as_str());
                Ok(())
            }
            common::SUPPORTED_ACTIONS => {
                out.value(advertised_names(record.driver.command_table()));
                Ok(())
            }
            common::TEMPERATURE_LOG => {
                if !record.driver.reports_temperature() {
                    Err(AlpacaError::not_implemented(component, entry.name))
                } else {
                    let samples: Vec<Value> = record
                        .temperature_log
                        .samples()
                        .filter_map(|sample| serde_json::to_value(sample).ok())
                        .collect();
                    out.value(samples);
                    Ok(())
                }
            }
            _ => Err(AlpacaError::new(
                AscomStatus::NotImplemented,
                component,
                format!("Unrecognized command '{}'", entry.name),
            )),
        };
        Some(result)
    }

    /// Copy of a device's identity, live properties and usage table.
    ///
    /// Does not count as a command and does not touch statistics.
    pub async fn snapshot(&self, handle: &DeviceHandle) -> DeviceSnapshot {
        let mut record = handle.lock().await;
        let mut fields = ResponseFields::new();
        let request = AlpacaRequest::get(
            record.device_type().as_str(),
            record.device_number(),
            "readall",
        );
        let totals = self.totals();
        if let Some(entry) = resolve("readall", record.driver.command_table()) {
            let DeviceRecord {
                identity,
                connected,
                driver,
                ..
            } = &mut *record;
            let mut ctx = CommandContext {
                request: &request,
                response: &mut fields,
                identity,
                connected: *connected,
                registry: &self.registry,
                server: &self.server,
                totals,
            };
            if driver.handle_command(entry, &mut ctx).is_err() {
                fields.clear();
            }
        }

        let usage = COMMON_COMMANDS
            .iter()
            .chain(record.driver.command_table().iter())
            .filter(|entry| !entry.is_hidden())
            .filter_map(|entry| {
                record.stats.lookup(entry.code).map(|stats| CommandUsage {
                    name: entry.name,
                    code: entry.code,
                    stats: *stats,
                })
            })
            .collect();

        DeviceSnapshot {
            summary: record.summary.clone(),
            identity: record.identity.clone(),
            connected: record.connected,
            properties: fields.into_map(),
            usage,
            total_commands: record.stats.total_commands,
            total_errors: record.stats.total_errors,
        }
    }
}

fn set_connected(record: &mut DeviceRecord, connected: bool) -> AlpacaResult<()> {
    record.driver.set_connected(connected)?;
    if record.connected != connected {
        info!(
            device_type = record.device_type().as_str(),
            device_number = record.device_number(),
            connected,
            "Connection state changed"
        );
    }
    record.connected = connected;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::resolve;
    use crate::registry::RegisterOptions;
    use crate::{FocuserDriver, ManagementDriver, ObservingConditionsDriver, RotatorDriver, TelescopeDriver};
    use std::time::Duration;

    fn host() -> Dispatcher {
        let registry = Arc::new(Registry::new());
        registry.register(Box::new(ManagementDriver::new()), RegisterOptions::connected()).unwrap();
        registry.register(Box::new(FocuserDriver::simulator()), RegisterOptions::connected()).unwrap();
        registry.register(Box::new(RotatorDriver::simulator()), RegisterOptions::connected()).unwrap();
        registry
            .register(Box::new(ObservingConditionsDriver::simulator()), RegisterOptions::connected())
            .unwrap();
        registry.register(Box::new(TelescopeDriver::simulator()), RegisterOptions::connected()).unwrap();
        Dispatcher::new(registry, ServerInfo::default())
    }

    async fn tick_all(dispatcher: &Dispatcher, now: Instant) {
        for handle in dispatcher.registry().all() {
            handle.lock().await.driver.tick(now);
        }
    }

    #[tokio::test]
    async fn test_move_then_position_reports_target() {
        let dispatcher = host();
        let start = Instant::now();
        tick_all(&dispatcher, start).await;

        let request = AlpacaRequest::put("focuser", 0, "move").with_param("Position", "5000");
        let response = dispatcher.handle(&request).await;
        assert!(response.is_success(), "{:?}", response);

        tick_all(&dispatcher, start + Duration::from_secs(5)).await;
        let position = dispatcher.handle(&AlpacaRequest::get("focuser", 0, "position")).await;
        assert_eq!(position.value(), Some(&Value::from(5000)));
        let moving = dispatcher.handle(&AlpacaRequest::get("focuser", 0, "ismoving")).await;
        assert_eq!(moving.value(), Some(&Value::from(false)));
    }

    #[tokio::test]
    async fn test_put_on_get_only_command_fails_without_side_effects() {
        let dispatcher = host();
        let before = dispatcher.handle(&AlpacaRequest::get("focuser", 0, "position")).await;

        let request = AlpacaRequest::put("focuser", 0, "position").with_param("Position", "10");
        let response = dispatcher.handle(&request).await;
        assert_ne!(response.error_number, 0);
        assert!(!response.error_message.is_empty());

        let after = dispatcher.handle(&AlpacaRequest::get("focuser", 0, "position")).await;
        assert_eq!(before.value(), after.value());

        let handle = dispatcher.registry().first(AlpacaDeviceType::Focuser).unwrap();
        let record = handle.lock().await;
        let stats = record.stats.lookup(crate::focuser::cmd::POSITION).copied().unwrap();
        assert_eq!(stats, CmdStats { connection: 3, get: 2, put: 1, error: 1 });
    }

    #[tokio::test]
    async fn test_unknown_device_is_invalid_value_and_not_counted() {
        let dispatcher = host();
        for (device_type, number) in [("focuser", "7"), ("focuser", "x"), ("toaster", "0"), ("telescope", "0")] {
            let request = AlpacaRequest::new(device_type, number, "position", Verb::Get);
            let response = dispatcher.handle(&request).await;
            assert_eq!(response.status(), Some(AscomStatus::InvalidValue), "{}/{}", device_type, number);
        }
        assert_eq!(dispatcher.totals(), HostTotals::default());
    }

    #[tokio::test]
    async fn test_unknown_command_reports_error() {
        let dispatcher = host();
        let response = dispatcher.handle(&AlpacaRequest::get("focuser", 0, "frobnicate")).await;
        assert_eq!(response.status(), Some(AscomStatus::NotImplemented));
        assert!(response.error_message.contains("Unrecognized command 'frobnicate'"));

        let response = dispatcher.handle(&AlpacaRequest::get("focuser", 0, "--extras")).await;
        assert_eq!(response.status(), Some(AscomStatus::NotImplemented));
        assert_eq!(dispatcher.totals(), HostTotals { commands: 2, errors: 2 });
    }

    #[tokio::test]
    async fn test_server_transaction_ids_increase_and_client_ids_echo() {
        let dispatcher = host();
        let mut last = 0;
        for i in 0..20u32 {
            let request = AlpacaRequest::get("focuser", 0, "name")
                .with_param("ClientTransactionID", i.to_string());
            let response = dispatcher.handle(&request).await;
            assert!(response.server_transaction_id > last);
            assert_eq!(response.client_transaction_id, i);
            last = response.server_transaction_id;
        }
    }

    #[tokio::test]
    async fn test_repeated_gets_are_identical() {
        let dispatcher = host();
        tick_all(&dispatcher, Instant::now()).await;
        for command in ["position", "temperature", "maxstep", "connected", "name"] {
            let first = dispatcher.handle(&AlpacaRequest::get("focuser", 0, command)).await;
            let second = dispatcher.handle(&AlpacaRequest::get("focuser", 0, command)).await;
            assert_eq!(first.fields, second.fields, "{}", command);
        }
    }

    #[tokio::test]
    async fn test_supported_actions_round_trip_with_tables() {
        let dispatcher = host();
        for (device_type, table) in [
            ("focuser", crate::focuser::FOCUSER_COMMANDS),
            ("rotator", crate::rotator::ROTATOR_COMMANDS),
            ("observingconditions", crate::observingconditions::OBSERVING_CONDITIONS_COMMANDS),
            ("management", crate::management::MANAGEMENT_COMMANDS),
            ("telescope", crate::telescope::TELESCOPE_COMMANDS),
        ] {
            let response = dispatcher.handle(&AlpacaRequest::get(device_type, 0, "supportedactions")).await;
            let names: Vec<String> = response
                .value()
                .and_then(Value::as_array)
                .unwrap()
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();

            for name in &names {
                assert!(
                    resolve_for_device(name, table).is_some(),
                    "{} advertises unresolvable '{}'",
                    device_type,
                    name
                );
            }
            for entry in table.iter().chain(COMMON_COMMANDS.iter()).filter(|e| !e.is_hidden()) {
                assert!(names.iter().any(|n| n == entry.name), "{} hides '{}'", device_type, entry.name);
            }
            assert!(resolve("supportedactions", COMMON_COMMANDS).is_some());
        }
    }

    #[test]
    fn test_tables_agree_on_shared_names() {
        let tables = [
            COMMON_COMMANDS,
            crate::focuser::FOCUSER_COMMANDS,
            crate::rotator::ROTATOR_COMMANDS,
            crate::observingconditions::OBSERVING_CONDITIONS_COMMANDS,
            crate::management::MANAGEMENT_COMMANDS,
            crate::telescope::TELESCOPE_COMMANDS,
        ];
        for (i, left) in tables.iter().enumerate() {
            for right in &tables[i + 1..] {
                for entry in left.iter().filter(|e| !e.is_hidden()) {
                    if let Some(other) = resolve(entry.name, *right) {
                        assert_eq!(entry.verb, other.verb, "verb conflict on '{}'", entry.name);
                    }
                }
            }
        }
        for table in &tables[1..] {
            for entry in table.iter() {
                assert!(entry.code >= crate::commands::DEVICE_CODE_BASE, "{}", entry.name);
            }
        }
    }

    #[tokio::test]
    async fn test_connected_put_requires_keyword() {
        let dispatcher = host();
        let response = dispatcher.handle(&AlpacaRequest::put("rotator", 0, "connected")).await;
        assert_eq!(response.status(), Some(AscomStatus::InvalidValue));

        let request = AlpacaRequest::put("rotator", 0, "connected").with_param("connected", "False");
        assert!(dispatcher.handle(&request).await.is_success());
        let response = dispatcher.handle(&AlpacaRequest::get("rotator", 0, "connected")).await;
        assert_eq!(response.value(), Some(&Value::from(false)));

        let request = AlpacaRequest::put("rotator", 0, "move").with_param("Position", "10");
        let response = dispatcher.handle(&request).await;
        assert_eq!(response.status(), Some(AscomStatus::NotConnected));

        assert!(dispatcher.handle(&AlpacaRequest::put("rotator", 0, "connect")).await.is_success());
        assert!(dispatcher.handle(&request).await.is_success());
    }

    #[tokio::test]
    async fn test_action_and_command_strings() {
        let dispatcher = host();
        let request = AlpacaRequest::put("focuser", 0, "action").with_param("Action", "dance");
        let response = dispatcher.handle(&request).await;
        assert_eq!(response.status(), Some(AscomStatus::ActionNotImplemented));

        let response = dispatcher.handle(&AlpacaRequest::put("focuser", 0, "action")).await;
        assert_eq!(response.status(), Some(AscomStatus::InvalidValue));

        let request = AlpacaRequest::put("focuser", 0, "commandstring").with_param("Command", "X");
        let response = dispatcher.handle(&request).await;
        assert_eq!(response.status(), Some(AscomStatus::NotImplemented));
    }

    #[tokio::test]
    async fn test_device_state_lists_named_values() {
        let dispatcher = host();
        let response = dispatcher.handle(&AlpacaRequest::get("focuser", 0, "devicestate")).await;
        let state = response.value().and_then(Value::as_array).unwrap();
        let names: Vec<&str> = state.iter().filter_map(|item| item["Name"].as_str()).collect();
        assert_eq!(names, vec!["IsMoving", "Position", "Temperature", "TimeStamp"]);
    }

    #[tokio::test]
    async fn test_management_description_shadows_common_description() {
        let dispatcher = host();
        let response = dispatcher.handle(&AlpacaRequest::get("management", 0, "description")).await;
        assert!(response.value().and_then(Value::as_object).is_some());
        let response = dispatcher.handle(&AlpacaRequest::get("focuser", 0, "description")).await;
        assert_eq!(response.value(), Some(&Value::from("Alpaca focuser")));
    }

    #[tokio::test]
    async fn test_temperature_log_support() {
        let dispatcher = host();
        let response = dispatcher.handle(&AlpacaRequest::get("rotator", 0, "temperaturelog")).await;
        assert_eq!(response.status(), Some(AscomStatus::NotImplemented));
        let response = dispatcher.handle(&AlpacaRequest::get("focuser", 0, "temperaturelog")).await;
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_temperature_log_supported_before_first_reading() {
        let dispatcher = host();
        let response = dispatcher
            .handle(&AlpacaRequest::get("observingconditions", 0, "temperaturelog"))
            .await;
        assert!(response.is_success());
        assert_eq!(response.value(), Some(&Value::Array(Vec::new())));

        tick_all(&dispatcher, Instant::now()).await;
        let response = dispatcher
            .handle(&AlpacaRequest::get("observingconditions", 0, "temperaturelog"))
            .await;
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_telescope_park_through_dispatcher() {
        let dispatcher = host();
        let response = dispatcher.handle(&AlpacaRequest::put("telescope", 0, "park")).await;
        assert!(response.is_success());
        tick_all(&dispatcher, Instant::now() + Duration::from_secs(60)).await;

        let response = dispatcher.handle(&AlpacaRequest::get("telescope", 0, "atpark")).await;
        assert_eq!(response.value(), Some(&Value::from(true)));
        let request = AlpacaRequest::put("telescope", 0, "tracking").with_param("Tracking", "true");
        let response = dispatcher.handle(&request).await;
        assert_eq!(response.status(), Some(AscomStatus::InvalidWhileParked));

        let response = dispatcher.handle(&AlpacaRequest::get("telescope", 0, "readall")).await;
        assert_eq!(response.field("atpark"), Some(&Value::from(true)));
        assert!(response.field("siderealtime").is_some());
    }

    #[tokio::test]
    async fn test_snapshot_does_not_count_as_command() {
        let dispatcher = host();
        dispatcher.handle(&AlpacaRequest::get("focuser", 0, "position")).await;
        let handle = dispatcher.registry().first(AlpacaDeviceType::Focuser).unwrap();
        let snapshot = dispatcher.snapshot(&handle).await;
        assert_eq!(snapshot.total_commands, 1);
        assert_eq!(snapshot.properties.get("position"), Some(&Value::from(4570)));
        let position = snapshot.usage.iter().find(|row| row.name == "position").unwrap();
        assert_eq!(position.stats.get, 1);
        assert!(snapshot.usage.iter().all(|row| !row.name.starts_with('-')));
    }
}
