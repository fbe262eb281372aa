//! Read-only HTML diagnostics pages

use crate::dispatcher::{DeviceSnapshot, Dispatcher};
use crate::driver::{HostTotals, ServerInfo};
use crate::status::AlpacaResult;
use serde_json::Value;
use std::fmt::Write;

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title>\
         <style>body{{font-family:sans-serif}}table{{border-collapse:collapse}}\
         td,th{{border:1px solid #999;padding:2px 8px;text-align:left}}</style></head>\
         <body><h1>{title}</h1>\n{body}</body></html>\n",
        title = escape(title),
        body = body
    )
}

fn device_path(snapshot: &DeviceSnapshot) -> String {
    format!(
        "/setup/v1/{}/{}/setup",
        snapshot.summary.device_type.as_str(),
        snapshot.summary.device_number
    )
}

pub fn render_device_page(snapshot: &DeviceSnapshot) -> String {
    let identity = &snapshot.identity;
    let mut body = String::new();

    body.push_str("<h2>Identity</h2>\n<table>\n");
    let rows = [
        ("Device type", snapshot.summary.device_type.display_name().to_string()),
        ("Device number", snapshot.summary.device_number.to_string()),
        ("Unique ID", snapshot.summary.unique_id.to_string()),
        ("Name", identity.name.clone()),
        ("Description", identity.description.clone()),
        ("Manufacturer", identity.manufacturer.clone()),
        ("Model", identity.model.clone()),
        ("Serial number", identity.serial_number.clone()),
        ("Driver info", identity.driver_info.clone()),
        ("Driver version", identity.driver_version.clone()),
        ("Interface version", identity.interface_version.to_string()),
        ("Connected", snapshot.connected.to_string()),
    ];
    for (label, value) in rows {
        let _ = writeln!(body, "<tr><th>{}</th><td>{}</td></tr>", label, escape(&value));
    }
    body.push_str("</table>\n");

    body.push_str("<h2>Properties</h2>\n<table>\n");
    if snapshot.properties.is_empty() {
        body.push_str("<tr><td>unavailable</td></tr>\n");
    }
    for (name, value) in &snapshot.properties {
        let _ = writeln!(
            body,
            "<tr><th>{}</th><td>{}</td></tr>",
            escape(name),
            escape(&display_value(value))
        );
    }
    body.push_str("</table>\n");

    body.push_str("<h2>Command usage</h2>\n<table>\n");
    body.push_str("<tr><th>Command</th><th>Code</th><th>Conn</th><th>GET</th><th>PUT</th><th>Err</th></tr>\n");
    for row in &snapshot.usage {
        let _ = writeln!(
            body,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(row.name),
            row.code,
            row.stats.connection,
            row.stats.get,
            row.stats.put,
            row.stats.error
        );
    }
    let _ = writeln!(
        body,
        "<tr><th colspan=\"2\">Total</th><td>{}</td><td colspan=\"2\"></td><td>{}</td></tr>",
        snapshot.total_commands, snapshot.total_errors
    );
    body.push_str("</table>\n");

    page(&snapshot.summary.name, &body)
}

pub fn render_index(server: &ServerInfo, totals: HostTotals, devices: &[DeviceSnapshot]) -> String {
    let mut body = String::new();
    let _ = writeln!(
        body,
        "<p>{} {} at {}, up {}s. Commands: {}, errors: {}.</p>",
        escape(&server.manufacturer),
        escape(&server.manufacturer_version),
        escape(&server.location),
        server.started.elapsed().as_secs(),
        totals.commands,
        totals.errors
    );
    body.push_str("<table>\n<tr><th>Device</th><th>Type</th><th>Number</th><th>Connected</th><th>Commands</th><th>Errors</th></tr>\n");
    for snapshot in devices {
        let _ = writeln!(
            body,
            "<tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            device_path(snapshot),
            escape(&snapshot.summary.name),
            snapshot.summary.device_type.display_name(),
            snapshot.summary.device_number,
            snapshot.connected,
            snapshot.total_commands,
            snapshot.total_errors
        );
    }
    body.push_str("</table>\n");
    page(&server.server_name, &body)
}

/// Page for one device; unknown devices fail like any other request would.
pub async fn device_page(dispatcher: &Dispatcher, device_type: &str, device_number: &str) -> AlpacaResult<String> {
    let handle = dispatcher.lookup(device_type, device_number)?;
    let snapshot = dispatcher.snapshot(&handle).await;
    Ok(render_device_page(&snapshot))
}

pub async fn index_page(dispatcher: &Dispatcher) -> String {
    let mut snapshots = Vec::new();
    for handle in dispatcher.registry().all() {
        snapshots.push(dispatcher.snapshot(&handle).await);
    }
    render_index(dispatcher.server(), dispatcher.totals(), &snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegisterOptions, Registry};
    use crate::request::AlpacaRequest;
    use crate::status::AscomStatus;
    use crate::{FocuserDriver, ManagementDriver};
    use std::sync::Arc;

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(Registry::new());
        registry.register(Box::new(ManagementDriver::new()), RegisterOptions::connected()).unwrap();
        let options = RegisterOptions {
            name: Some("<Main> focuser".to_string()),
            ..RegisterOptions::connected()
        };
        registry.register(Box::new(FocuserDriver::simulator()), options).unwrap();
        Dispatcher::new(registry, ServerInfo::default())
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&#39;");
    }

    #[tokio::test]
    async fn test_device_page_sections() {
        let dispatcher = dispatcher();
        dispatcher.handle(&AlpacaRequest::get("focuser", 0, "position")).await;

        let html = device_page(&dispatcher, "focuser", "0").await.unwrap();
        assert!(html.contains("&lt;Main&gt; focuser"));
        assert!(html.contains("<th>position</th><td>4570</td>"));
        assert!(html.contains("<tr><td>position</td><td>1004</td><td>1</td><td>1</td><td>0</td><td>0</td></tr>"));
        assert!(!html.contains("--extras"));
    }

    #[tokio::test]
    async fn test_unknown_device_page() {
        let dispatcher = dispatcher();
        let err = device_page(&dispatcher, "focuser", "3").await.unwrap_err();
        assert_eq!(err.status, AscomStatus::InvalidValue);
    }

    #[tokio::test]
    async fn test_index_links_every_device() {
        let dispatcher = dispatcher();
        let html = index_page(&dispatcher).await;
        assert!(html.contains("href=\"/setup/v1/focuser/0/setup\""));
        assert!(html.contains("href=\"/setup/v1/management/0/setup\""));
        assert!(html.contains("Alpaca Device Host"));
    }
}
