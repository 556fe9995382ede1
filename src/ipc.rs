//! JSONL IPC server (C15): a Unix-domain stream socket that frontends talk to
//! instead of linking this crate's component modules directly.
//!
//! Each connection is a sequence of compact, `\n`-terminated JSON objects, one
//! request per line, answered with one response per line. A single command
//! (`watch_start`) switches the connection into a streaming mode that emits
//! `live_did` events until the client sends `watch_stop` or `max_ticks` is
//! reached; while streaming, any other command is rejected without leaving
//! streaming mode.
//!
//! This is deliberately synchronous and single-threaded per connection:
//! there is exactly one [`crate::can::CanTransport`] and exactly one
//! [`DiagnosticService`] backing the whole server, so connections are serviced
//! one at a time rather than concurrently. No async runtime, no worker pool --
//! a blocking accept loop with deadline-checked socket reads is the correct
//! shape for this component's contract.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::discovery::{Addressing, ScanConfig};
use crate::service::DiagnosticService;
use crate::watch::{EmitMode, WatchTick};

/// Poll interval used while a watch is streaming, so the server can notice a
/// `watch_stop` without missing a tick deadline by more than this much.
const STREAM_POLL_MS: u64 = 100;

/// Errors raised by the IPC server's connection handling. Per-request failures
/// (bad JSON, a failed service call) never reach this type -- they become
/// `{ok:false, error}` response lines instead; this type is only for I/O
/// failures on the socket itself.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The underlying socket I/O failed.
    #[error("ipc I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Drives a [`DiagnosticService`] from JSONL requests arriving on a Unix-domain
/// stream socket. Owns no transport of its own -- it borrows the service,
/// which in turn owns the CAN transport -- and holds the default scan
/// configuration `scan_ecus` falls back to when a request does not override it.
#[derive(Debug)]
pub struct IpcServer<'a, 'b> {
    service: &'b mut DiagnosticService<'a>,
    default_scan: ScanConfig,
}

impl<'a, 'b> IpcServer<'a, 'b> {
    /// Builds a server around `service`, using `default_scan` for any
    /// `scan_ecus` request that does not override its fields.
    pub fn new(service: &'b mut DiagnosticService<'a>, default_scan: ScanConfig) -> Self {
        Self { service, default_scan }
    }

    /// Binds a fresh Unix-domain listener at `socket_path`, removing a stale
    /// socket file left over from a previous run (a plain `bind` on an
    /// already-existing path fails with `AddrInUse`).
    pub fn bind(socket_path: &Path) -> Result<UnixListener, IpcError> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        Ok(UnixListener::bind(socket_path)?)
    }

    /// Serves connections from `listener` forever, one at a time. A
    /// connection's own I/O failure is logged and the server moves on to the
    /// next connection; only a failure to `accept` at all propagates.
    pub fn serve(&mut self, listener: &UnixListener) -> Result<(), IpcError> {
        for stream in listener.incoming() {
            let stream = stream?;
            if let Err(e) = self.handle_connection(stream) {
                log::warn!("ipc connection error: {e}");
            }
        }
        Ok(())
    }

    /// Accepts and fully services exactly one connection from `listener`, then
    /// returns. Used by this crate's own tests; also suitable for an embedder
    /// that wants to interleave IPC servicing with other work itself.
    pub fn serve_one(&mut self, listener: &UnixListener) -> Result<(), IpcError> {
        let (stream, _) = listener.accept()?;
        self.handle_connection(stream)?;
        Ok(())
    }

    fn handle_connection(&mut self, stream: UnixStream) -> Result<(), IpcError> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;
        loop {
            reader.get_ref().set_read_timeout(None)?;
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Ok(()); // client closed the connection
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let req: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    write_line(&mut writer, &err_value(format!("invalid JSON request: {e}")))?;
                    continue;
                }
            };
            let cmd = req.get("cmd").and_then(Value::as_str).unwrap_or("").to_string();
            if cmd == "watch_start" {
                match parse_watch_start(&req) {
                    Ok(watch_req) => {
                        write_line(&mut writer, &json!({"ok": true, "watching": true}))?;
                        self.stream_watch(&mut reader, &mut writer, watch_req)?;
                    }
                    Err(e) => write_line(&mut writer, &e)?,
                }
            } else {
                let resp = self.dispatch(&cmd, &req);
                write_line(&mut writer, &resp)?;
            }
        }
    }

    /// Handles one request/response-shaped (non-streaming) command.
    fn dispatch(&mut self, cmd: &str, req: &Value) -> Value {
        match cmd {
            "scan_ecus" => self.cmd_scan_ecus(req),
            "read_dtcs" => self.cmd_read_dtcs(req),
            "clear_dtcs" => self.cmd_clear_dtcs(req),
            "read_did" => self.cmd_read_did(req),
            "watch_stop" => err_value("no watch is active"),
            "" => err_value("missing 'cmd' field"),
            other => err_value(format!("unknown command: {other:?}")),
        }
    }

    fn cmd_scan_ecus(&mut self, req: &Value) -> Value {
        let mut scan_config = self.default_scan.clone();
        if let Some(addressing) = req.get("addressing").and_then(Value::as_str) {
            match Addressing::parse(addressing) {
                Some(a) => scan_config.addressing = a,
                None => return err_value(format!("unknown addressing: {addressing:?}")),
            }
        }
        if let Some(timeout_ms) = req.get("timeout_ms").and_then(Value::as_u64) {
            scan_config.timeout_ms = timeout_ms as u32;
        }
        if let Some(retries) = req.get("retries").and_then(Value::as_u64) {
            scan_config.retries = retries as u32;
        }
        match self.service.scan(&scan_config) {
            Ok(topology) => {
                let ecus: Vec<&str> = topology.nodes.iter().map(|n| n.ecu.as_str()).collect();
                let nodes: Vec<Value> = topology
                    .nodes
                    .iter()
                    .map(|n| json!({"ecu": n.ecu, "ecu_name": n.ecu_name}))
                    .collect();
                json!({"ok": true, "ecus": ecus, "nodes": nodes})
            }
            Err(e) => err_value(e.to_string()),
        }
    }

    fn cmd_read_dtcs(&mut self, req: &Value) -> Value {
        if let Err(e) = self.set_ecu_from(req) {
            return e;
        }
        match self.service.read_dtcs(0xFF) {
            Ok(dtcs) => json!({"ok": true, "dtcs": dtcs}),
            Err(e) => err_value(e.to_string()),
        }
    }

    fn cmd_clear_dtcs(&mut self, req: &Value) -> Value {
        if let Err(e) = self.set_ecu_from(req) {
            return e;
        }
        match self.service.clear_dtcs() {
            Ok(()) => json!({"ok": true}),
            Err(e) => err_value(e.to_string()),
        }
    }

    fn cmd_read_did(&mut self, req: &Value) -> Value {
        if let Err(e) = self.set_ecu_from(req) {
            return e;
        }
        let did = match get_did_field(req, "did") {
            Ok(d) => d,
            Err(e) => return e,
        };
        match self.service.read_did(did) {
            Ok((name, value)) => {
                let unit = crate::did::lookup(did).map(|s| s.unit).unwrap_or("");
                json!({
                    "ok": true,
                    "item": {
                        "did": format!("{did:04X}"),
                        "name": name,
                        "value": value,
                        "unit": unit,
                    },
                })
            }
            Err(e) => err_value(e.to_string()),
        }
    }

    /// Normalizes and sets the active ECU from `req`'s `ecu` field.
    fn set_ecu_from(&mut self, req: &Value) -> Result<(), Value> {
        let ecu_str = req
            .get("ecu")
            .and_then(Value::as_str)
            .ok_or_else(|| err_value("missing 'ecu' field"))?;
        self.service.set_active_ecu(ecu_str).map_err(|e| err_value(e.to_string()))
    }

    /// Drives a watch stream until the client sends `watch_stop`, `max_ticks`
    /// is reached, or a service call fails. The socket read timeout is
    /// used only to interleave tick emission with a `watch_stop` check; the
    /// main connection loop resets it to blocking once streaming ends.
    fn stream_watch(
        &mut self,
        reader: &mut BufReader<UnixStream>,
        writer: &mut UnixStream,
        watch_req: WatchRequest,
    ) -> Result<(), IpcError> {
        let mut watcher = self.service.new_watcher(watch_req.items, watch_req.emit);
        reader.get_ref().set_read_timeout(Some(Duration::from_millis(STREAM_POLL_MS)))?;
        let mut next_tick = Instant::now();
        let mut pending_line = String::new();

        loop {
            match reader.read_line(&mut pending_line) {
                Ok(0) => return Ok(()), // client disconnected mid-watch
                Ok(_) => {
                    if pending_line.ends_with('\n') {
                        let trimmed = pending_line.trim().to_string();
                        pending_line.clear();
                        if !trimmed.is_empty() {
                            let is_stop = serde_json::from_str::<Value>(&trimmed)
                                .ok()
                                .and_then(|v| v.get("cmd").and_then(Value::as_str).map(str::to_string))
                                == Some("watch_stop".to_string());
                            if is_stop {
                                write_line(writer, &json!({"ok": true, "stopped": true}))?;
                                return Ok(());
                            }
                            write_line(writer, &err_value("watch active; only watch_stop is accepted"))?;
                        }
                    }
                    // else: a partial line was buffered without a trailing
                    // newline yet; keep accumulating on the next poll.
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() < next_tick {
                continue;
            }

            let tick: WatchTick = match self.service.tick_watch(&mut watcher) {
                Ok(t) => t,
                Err(e) => {
                    write_line(writer, &err_value(e.to_string()))?;
                    return Ok(());
                }
            };
            for sample in &tick.samples {
                let unit = crate::did::lookup(sample.did).map(|s| s.unit).unwrap_or("");
                write_line(
                    writer,
                    &json!({
                        "event": "live_did",
                        "tick": tick.tick,
                        "ecu": sample.ecu,
                        "did": format!("{:04X}", sample.did),
                        "name": sample.name,
                        "value": sample.value,
                        "unit": unit,
                    }),
                )?;
            }
            if let Some(max) = watch_req.max_ticks {
                if tick.tick >= max {
                    write_line(writer, &json!({"ok": true, "done": true}))?;
                    return Ok(());
                }
            }
            next_tick = Instant::now() + Duration::from_millis(watch_req.tick_ms);
        }
    }
}

/// Parsed `watch_start` request fields.
struct WatchRequest {
    items: Vec<(String, u16)>,
    emit: EmitMode,
    tick_ms: u64,
    max_ticks: Option<u64>,
}

fn parse_watch_start(req: &Value) -> Result<WatchRequest, Value> {
    let items_val = req
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| err_value("missing 'items' field"))?;
    let mut items = Vec::with_capacity(items_val.len());
    for item in items_val {
        let ecu_str = item
            .get("ecu")
            .and_then(Value::as_str)
            .ok_or_else(|| err_value("watch item missing 'ecu' field"))?;
        let ecu = crate::normalize_ecu(ecu_str).map_err(|e| err_value(e.to_string()))?;
        let did = get_did_field(item, "did")?;
        items.push((ecu, did));
    }
    let emit = match req.get("emit").and_then(Value::as_str) {
        Some("always") => EmitMode::Always,
        Some("changed") | None => EmitMode::Changed,
        Some(other) => return Err(err_value(format!("unknown emit mode: {other:?}"))),
    };
    let tick_ms = req.get("tick_ms").and_then(Value::as_u64).unwrap_or(1000);
    let max_ticks = req.get("max_ticks").and_then(Value::as_u64);
    Ok(WatchRequest {
        items,
        emit,
        tick_ms,
        max_ticks,
    })
}

/// Reads `field` off `req` as a DID, accepting either a hex string (the
/// convention used everywhere else in this crate's JSON) or a bare integer.
fn get_did_field(req: &Value, field: &str) -> Result<u16, Value> {
    match req.get(field) {
        Some(Value::String(s)) => crate::parse_did_str(s).map_err(|e| err_value(e.to_string())),
        Some(Value::Number(n)) => n
            .as_u64()
            .filter(|&v| v <= 0xFFFF)
            .map(|v| v as u16)
            .ok_or_else(|| err_value(format!("did out of range: {n}"))),
        _ => Err(err_value(format!("missing or invalid '{field}' field"))),
    }
}

fn err_value(message: impl Into<String>) -> Value {
    json!({"ok": false, "error": message.into()})
}

fn write_line(writer: &mut UnixStream, value: &Value) -> Result<(), IpcError> {
    let mut line = serde_json::to_string(value).expect("response values always serialize");
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceConfig;
    use crate::sim::{ChannelPair, SimEcu};
    use crate::CanIdMode;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    fn temp_socket_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("uds_diag_core_ipc_{tag}_{}.sock", std::process::id()))
    }

    fn temp_service_config(tag: &str) -> ServiceConfig {
        let id = std::process::id();
        ServiceConfig {
            can_id_mode: CanIdMode::Bit11,
            brand: None,
            datasets_root: std::env::temp_dir().join(format!("uds_diag_core_ipc_datasets_{tag}_{id}")),
            backups_root: std::env::temp_dir().join(format!("uds_diag_core_ipc_backups_{tag}_{id}")),
            credential_path: None,
        }
    }

    fn default_scan() -> ScanConfig {
        ScanConfig::new("vcan0", CanIdMode::Bit11, Addressing::Functional)
    }

    fn request_line(client: &mut UnixStream, reader: &mut BufReader<UnixStream>, req: &Value) -> Value {
        let mut line = serde_json::to_string(req).unwrap();
        line.push('\n');
        client.write_all(line.as_bytes()).unwrap();
        client.flush().unwrap();
        let mut resp_line = String::new();
        reader.read_line(&mut resp_line).unwrap();
        serde_json::from_str(resp_line.trim()).unwrap()
    }

    #[test]
    fn read_dtcs_round_trips_over_the_socket() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| {
            if req == [0x19, 0x02, 0xFF] {
                Some(vec![0x59, 0x02, 0xFF, 0x03, 0x00, 0x01])
            } else {
                None
            }
        });
        let config = temp_service_config("read_dtcs");
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let socket_path = temp_socket_path("read_dtcs");
        let listener = IpcServer::bind(&socket_path).unwrap();

        let handle = std::thread::spawn({
            let socket_path = socket_path.clone();
            move || {
                let mut client = UnixStream::connect(&socket_path).unwrap();
                let mut reader = BufReader::new(client.try_clone().unwrap());
                request_line(&mut client, &mut reader, &json!({"cmd": "read_dtcs", "ecu": "01"}))
            }
        });

        let mut server = IpcServer::new(&mut service, default_scan());
        server.serve_one(&listener).unwrap();
        let resp = handle.join().unwrap();

        assert_eq!(resp["ok"], json!(true));
        assert_eq!(resp["dtcs"][0]["code"], json!("P0300"));
        assert_eq!(resp["dtcs"][0]["status"], json!("active"));

        drop(service);
        sim.join();
        std::fs::remove_dir_all(&config.backups_root).ok();
        std::fs::remove_file(&socket_path).ok();
    }

    #[test]
    fn read_did_returns_the_decoded_item() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, |req| {
            if req == [0x22, 0xF1, 0x90] {
                Some(vec![0x62, 0xF1, 0x90, b'X', b'Y'])
            } else {
                None
            }
        });
        let config = temp_service_config("read_did");
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let socket_path = temp_socket_path("read_did");
        let listener = IpcServer::bind(&socket_path).unwrap();

        let handle = std::thread::spawn({
            let socket_path = socket_path.clone();
            move || {
                let mut client = UnixStream::connect(&socket_path).unwrap();
                let mut reader = BufReader::new(client.try_clone().unwrap());
                request_line(
                    &mut client,
                    &mut reader,
                    &json!({"cmd": "read_did", "ecu": "01", "did": "F190"}),
                )
            }
        });

        let mut server = IpcServer::new(&mut service, default_scan());
        server.serve_one(&listener).unwrap();
        let resp = handle.join().unwrap();

        assert_eq!(resp["ok"], json!(true));
        assert_eq!(resp["item"]["did"], json!("F190"));
        assert_eq!(resp["item"]["name"], json!("VIN"));
        assert_eq!(resp["item"]["value"], json!("XY"));

        drop(service);
        sim.join();
        std::fs::remove_dir_all(&config.backups_root).ok();
        std::fs::remove_file(&socket_path).ok();
    }

    #[test]
    fn unknown_command_is_reported_without_closing_the_connection() {
        let (mut tester, _ecu_side) = ChannelPair::new();
        let config = temp_service_config("unknown_cmd");
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let socket_path = temp_socket_path("unknown_cmd");
        let listener = IpcServer::bind(&socket_path).unwrap();

        let handle = std::thread::spawn({
            let socket_path = socket_path.clone();
            move || {
                let mut client = UnixStream::connect(&socket_path).unwrap();
                let mut reader = BufReader::new(client.try_clone().unwrap());
                let bad = request_line(&mut client, &mut reader, &json!({"cmd": "frobnicate"}));
                let ok = request_line(&mut client, &mut reader, &json!({"cmd": "clear_dtcs", "ecu": "01"}));
                (bad, ok)
            }
        });

        let mut server = IpcServer::new(&mut service, default_scan());
        // Two requests over one connection: serve the connection fully, not
        // just a single request/response pair.
        let stream = listener.accept().unwrap().0;
        server.handle_connection(stream).ok();
        let (bad, ok) = handle.join().unwrap();

        assert_eq!(bad["ok"], json!(false));
        assert!(bad["error"].as_str().unwrap().contains("unknown command"));
        assert_eq!(ok["ok"], json!(true));

        drop(service);
        std::fs::remove_dir_all(&config.backups_root).ok();
        std::fs::remove_file(&socket_path).ok();
    }

    #[test]
    fn watch_stream_emits_ticks_then_stops_on_request() {
        let (mut tester, ecu_side) = ChannelPair::new();
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU16::new(850));
        let counter_for_ecu = counter.clone();
        let sim = SimEcu::spawn(ecu_side, 0x7E1, 0x7E9, move |req| {
            if req == [0x22, 0x12, 0x34] {
                let v = counter_for_ecu.fetch_add(50, std::sync::atomic::Ordering::SeqCst);
                Some(vec![0x62, 0x12, 0x34, (v >> 8) as u8, v as u8])
            } else {
                None
            }
        });
        let config = temp_service_config("watch");
        let mut service = DiagnosticService::new(&mut tester, config.clone(), "01").unwrap();
        let socket_path = temp_socket_path("watch");
        let listener = IpcServer::bind(&socket_path).unwrap();

        let handle = std::thread::spawn({
            let socket_path = socket_path.clone();
            move || {
                let mut client = UnixStream::connect(&socket_path).unwrap();
                let mut reader = BufReader::new(client.try_clone().unwrap());
                let started = request_line(
                    &mut client,
                    &mut reader,
                    &json!({
                        "cmd": "watch_start",
                        "items": [{"ecu": "01", "did": "1234"}],
                        "emit": "always",
                        "tick_ms": 10,
                    }),
                );
                let mut events = Vec::new();
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    let v: Value = serde_json::from_str(line.trim()).unwrap();
                    if v.get("event").is_some() {
                        events.push(v);
                        if events.len() == 2 {
                            let mut stop = serde_json::to_string(&json!({"cmd": "watch_stop"})).unwrap();
                            stop.push('\n');
                            client.write_all(stop.as_bytes()).unwrap();
                            client.flush().unwrap();
                        }
                    } else {
                        return (started, events, v);
                    }
                }
            }
        });

        let mut server = IpcServer::new(&mut service, default_scan());
        server.serve_one(&listener).unwrap();
        let (started, events, terminal) = handle.join().unwrap();

        assert_eq!(started["ok"], json!(true));
        assert_eq!(started["watching"], json!(true));
        assert!(events.len() >= 2);
        assert_eq!(events[0]["tick"], json!(1));
        assert_eq!(events[0]["event"], json!("live_did"));
        assert_eq!(terminal["ok"], json!(true));
        assert_eq!(terminal["stopped"], json!(true));

        drop(service);
        sim.join();
        std::fs::remove_dir_all(&config.backups_root).ok();
        std::fs::remove_file(&socket_path).ok();
    }
}
