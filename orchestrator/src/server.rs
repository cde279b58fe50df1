//! Control and telemetry server
//!
//! Accepts TCP connections, sends each new client the signal schema, then
//! serves JSON control commands (pause/resume/reset/step/set/subscribe) and
//! broadcasts binary telemetry frames to subscribed clients at a fixed rate.
//! Each connection owns its outbound queue; one failing client never affects
//! the others.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hermes_core::backplane::Backplane;
use hermes_core::error::{ResultExt, SystemError, TypedResult};
use hermes_core::protocol::{
    self, make_ack, make_error, make_event, make_schema, Command, Event, WireKind,
};
use hermes_core::signal::SignalDescriptor;
use hermes_core::telemetry::TelemetryEncoder;
use serde_json::{json, Value};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::ServerSettings;
use crate::scheduler::SchedulerHandle;

/// Grace period for connection handlers after a shutdown request
const STOP_GRACE: Duration = Duration::from_secs(1);

/// A queued outbound message
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

struct ClientState {
    tx: mpsc::UnboundedSender<Outbound>,
    encoder: Option<TelemetryEncoder>,
    remote: String,
}

struct ServerShared {
    backplane: Arc<Backplane>,
    catalog: Vec<SignalDescriptor>,
    scheduler: Option<SchedulerHandle>,
    clients: Mutex<HashMap<u64, ClientState>>,
    next_client_id: AtomicU64,
}

/// The control server; owns its listener and telemetry tasks
pub struct ControlServer {
    shared: Arc<ServerShared>,
    settings: ServerSettings,
    shutdown_tx: watch::Sender<bool>,
    listener_task: Option<JoinHandle<()>>,
    telemetry_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ControlServer {
    /// `catalog` carries the declared signal types for the schema message;
    /// the scheduler handle is optional so a bare backplane can be observed
    pub fn new(
        backplane: Arc<Backplane>,
        catalog: Vec<SignalDescriptor>,
        scheduler: Option<SchedulerHandle>,
        settings: ServerSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(ServerShared {
                backplane,
                catalog,
                scheduler,
                clients: Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(0),
            }),
            settings,
            shutdown_tx,
            listener_task: None,
            telemetry_task: None,
            local_addr: None,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.shared.clients.lock().await.len()
    }

    /// Address the listener is bound to (available after `start_background`)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the listener and starts accepting connections in the background
    pub async fn start_background(&mut self) -> TypedResult<SocketAddr> {
        let listener = TcpListener::bind((self.settings.host.as_str(), self.settings.port))
            .await
            .typ(SystemError::Resource)?;
        let addr = listener.local_addr().typ(SystemError::Resource)?;
        self.local_addr = Some(addr);
        info!("Control server listening on {addr}");

        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let conn_shutdown = shutdown_rx.clone();
        self.listener_task = Some(tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            connections.spawn(handle_connection(
                                shared.clone(),
                                stream,
                                conn_shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!("Accept failed: {e}");
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }

            drop(listener);
            let drain = async {
                while connections.join_next().await.is_some() {}
            };
            if tokio::time::timeout(STOP_GRACE, drain).await.is_err() {
                connections.abort_all();
            }
        }));

        Ok(addr)
    }

    /// Starts the periodic telemetry broadcaster
    pub fn start_telemetry_loop(&mut self, rate_hz: f64) {
        let interval = Duration::from_secs_f64(1.0 / rate_hz);
        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!("Telemetry loop at {rate_hz} Hz");
        self.telemetry_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => shared.broadcast_telemetry().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    /// Stops the listener, the telemetry loop and all connection handlers
    pub async fn stop(&mut self) {
        info!("Stopping control server");
        let _ = self.shutdown_tx.send(true);

        for task in [self.telemetry_task.take(), self.listener_task.take()]
            .into_iter()
            .flatten()
        {
            if tokio::time::timeout(STOP_GRACE * 2, task).await.is_err() {
                warn!("Server task did not stop within grace period");
            }
        }
        self.shared.clients.lock().await.clear();
    }
}

impl ServerShared {
    /// Builds the schema message: signals grouped by module prefix,
    /// unqualified names under `"_default"`
    fn schema_json(&self) -> String {
        let mut modules: Vec<(String, Vec<Value>)> = Vec::new();
        for sig in &self.catalog {
            let (module, local) = sig.split_name();
            let module = module.unwrap_or("_default").to_string();
            let entry = json!({"name": local, "type": sig.ty.to_string()});
            match modules.iter_mut().find(|(name, _)| *name == module) {
                Some((_, signals)) => signals.push(entry),
                None => modules.push((module, vec![entry])),
            }
        }

        let mut map = serde_json::Map::new();
        for (module, signals) in modules {
            map.insert(module, json!({"signals": signals}));
        }
        make_schema(Value::Object(map))
    }

    /// Expands subscription patterns against the directory, de-duplicating
    /// while preserving first occurrence
    fn expand_patterns(&self, patterns: &[String]) -> Vec<String> {
        let all = self.backplane.signal_names();
        let mut result = Vec::new();

        for pattern in patterns {
            if pattern == "*" {
                result.extend(all.iter().cloned());
            } else if let Some(prefix) = pattern.strip_suffix(".*") {
                let prefix = format!("{prefix}.");
                result.extend(all.iter().filter(|s| s.starts_with(&prefix)).cloned());
            } else if self.backplane.contains(pattern) {
                result.push(pattern.clone());
            }
        }

        let mut seen = HashSet::new();
        result.retain(|s| seen.insert(s.clone()));
        result
    }

    async fn broadcast_text(&self, message: String) {
        for client in self.clients.lock().await.values() {
            let _ = client.tx.send(Outbound::Text(message.clone()));
        }
    }

    async fn broadcast_event(&self, event: Event) {
        self.broadcast_text(make_event(event)).await;
    }

    async fn broadcast_telemetry(&self) {
        for client in self.clients.lock().await.values() {
            let Some(encoder) = &client.encoder else {
                continue;
            };
            match encoder.encode() {
                Ok(frame) => {
                    if client.tx.send(Outbound::Binary(frame)).is_err() {
                        warn!("Telemetry send failed for {}", client.remote);
                    }
                }
                Err(e) => warn!("Telemetry encode failed for {}: {e}", client.remote),
            }
        }
    }

    /// Dispatches one validated command; returns the response message
    async fn dispatch(&self, client_id: u64, cmd: &Command) -> String {
        match cmd.action.as_str() {
            "subscribe" => self.handle_subscribe(client_id, cmd).await,
            "pause" => match &self.scheduler {
                None => make_error("No scheduler attached", None),
                Some(scheduler) => {
                    scheduler.pause();
                    self.broadcast_event(Event::Paused).await;
                    make_ack("pause", None)
                }
            },
            "resume" => match &self.scheduler {
                None => make_error("No scheduler attached", None),
                Some(scheduler) => {
                    scheduler.resume();
                    self.broadcast_event(Event::Running).await;
                    make_ack("resume", None)
                }
            },
            "reset" => match &self.scheduler {
                None => make_error("No scheduler attached", None),
                Some(scheduler) => match scheduler.reset().await {
                    Ok(()) => {
                        self.broadcast_event(Event::Reset).await;
                        make_ack("reset", None)
                    }
                    Err(e) => make_error(&e.to_string(), None),
                },
            },
            "step" => match &self.scheduler {
                None => make_error("No scheduler attached", None),
                Some(scheduler) => {
                    let count = cmd
                        .params
                        .get("count")
                        .and_then(Value::as_u64)
                        .unwrap_or(1);
                    match scheduler.step(count).await {
                        Ok(frame) => {
                            make_ack("step", Some(json!({"count": count, "frame": frame})))
                        }
                        Err(e) => make_error(&e.to_string(), None),
                    }
                }
            },
            "set" => {
                let signal = cmd.params.get("signal").and_then(Value::as_str);
                let value = cmd.params.get("value").and_then(Value::as_f64);
                match (signal, value) {
                    (Some(signal), Some(value)) => {
                        match self.backplane.set_signal(signal, value) {
                            Ok(()) => make_ack(
                                "set",
                                Some(json!({"signal": signal, "value": value})),
                            ),
                            Err(_) => make_error(&format!("Unknown signal: {signal}"), None),
                        }
                    }
                    _ => make_error("Invalid set parameters", None),
                }
            }
            other => make_error(&format!("Unknown action: {other}"), None),
        }
    }

    async fn handle_subscribe(&self, client_id: u64, cmd: &Command) -> String {
        let patterns: Vec<String> = match cmd.params.get("signals") {
            Some(Value::Array(items)) => {
                let mut patterns = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => patterns.push(s.to_string()),
                        None => return make_error("subscribe patterns must be strings", None),
                    }
                }
                patterns
            }
            _ => return make_error("subscribe 'signals' must be a list", None),
        };

        let expanded = self.expand_patterns(&patterns);
        let encoder = TelemetryEncoder::new(self.backplane.clone(), expanded.clone());

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get_mut(&client_id) {
            info!("Client {} subscribed to {} signals", client.remote, expanded.len());
            client.encoder = Some(encoder);
        }

        make_ack(
            "subscribe",
            Some(json!({"count": expanded.len(), "signals": expanded})),
        )
    }
}

/// Sends queued outbound messages until the queue closes or the socket fails
async fn write_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Text(text) => {
                protocol::write_frame(&mut wr, WireKind::Text, text.as_bytes()).await
            }
            Outbound::Binary(frame) => {
                protocol::write_frame(&mut wr, WireKind::Binary, &frame).await
            }
        };
        if result.is_err() {
            break;
        }
    }
}

async fn handle_connection(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let remote = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(wr, rx));

    let client_id = shared.next_client_id.fetch_add(1, Ordering::SeqCst);
    {
        let mut clients = shared.clients.lock().await;
        clients.insert(
            client_id,
            ClientState {
                tx: tx.clone(),
                encoder: None,
                remote: remote.clone(),
            },
        );
        info!("Client connected: {remote} ({} clients)", clients.len());
    }

    let _ = tx.send(Outbound::Text(shared.schema_json()));

    loop {
        let frame = tokio::select! {
            frame = protocol::read_frame(&mut rd) => frame,
            _ = shutdown_rx.changed() => break,
        };

        match frame {
            Ok((WireKind::Text, payload)) => {
                let response = handle_text(&shared, client_id, &payload).await;
                if tx.send(Outbound::Text(response)).is_err() {
                    break;
                }
            }
            Ok((WireKind::Binary, _)) => {
                warn!("Unexpected binary message from {remote}");
            }
            Err(e) if e.err() == SystemError::ClientDisconnect => {
                debug!("Client {remote} disconnected");
                break;
            }
            Err(e) => {
                // Frame-level corruption desynchronizes the stream
                let _ = tx.send(Outbound::Text(make_error(&e.to_string(), None)));
                break;
            }
        }
    }

    let mut clients = shared.clients.lock().await;
    clients.remove(&client_id);
    info!("Client disconnected: {remote} ({} clients)", clients.len());
    drop(clients);
    drop(tx);
    let _ = writer.await;
}

/// Parses and dispatches one text command, producing the response message.
/// Protocol errors never close the connection.
async fn handle_text(shared: &Arc<ServerShared>, client_id: u64, payload: &[u8]) -> String {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => return make_error(&format!("Invalid UTF-8: {e}"), None),
    };

    let cmd = match Command::from_json(text) {
        Ok(cmd) => cmd,
        Err(e) => return make_error(&e.to_string(), None),
    };
    if let Err(e) = cmd.validate() {
        return make_error(&e.to_string(), None);
    }

    shared.dispatch(client_id, &cmd).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::process::ProcessManager;
    use crate::scheduler::Scheduler;
    use hermes_core::signal::SignalDescriptor;
    use hermes_core::telemetry;
    use tokio::net::TcpStream;

    fn test_settings() -> ServerSettings {
        ServerSettings {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 0,
            telemetry_hz: 100.0,
        }
    }

    fn standalone_backplane(tag: &str) -> (Arc<Backplane>, Vec<SignalDescriptor>) {
        let shm = format!("/hermes_server_test_{}_{tag}", std::process::id());
        let catalog = vec![
            SignalDescriptor::new("a.x"),
            SignalDescriptor::new("a.y"),
            SignalDescriptor::new("b.z"),
        ];
        let bp = Arc::new(Backplane::create(&shm, &catalog).unwrap());
        (bp, catalog)
    }

    async fn next_text(stream: &mut TcpStream) -> Value {
        loop {
            let (kind, payload) =
                tokio::time::timeout(Duration::from_secs(5), protocol::read_frame(stream))
                    .await
                    .expect("timed out waiting for text frame")
                    .unwrap();
            if kind == WireKind::Text {
                return serde_json::from_slice(&payload).unwrap();
            }
        }
    }

    async fn next_binary(stream: &mut TcpStream) -> Vec<u8> {
        loop {
            let (kind, payload) =
                tokio::time::timeout(Duration::from_secs(5), protocol::read_frame(stream))
                    .await
                    .expect("timed out waiting for binary frame")
                    .unwrap();
            if kind == WireKind::Binary {
                return payload;
            }
        }
    }

    async fn send_text(stream: &mut TcpStream, text: &str) {
        protocol::write_frame(stream, WireKind::Text, text.as_bytes())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn schema_on_connect_and_pattern_subscription() {
        let (bp, catalog) = standalone_backplane("subscribe");
        bp.set_signal("a.x", 1.5).unwrap();
        bp.set_signal("a.y", -2.0).unwrap();

        let mut server = ControlServer::new(bp.clone(), catalog, None, test_settings());
        let addr = server.start_background().await.unwrap();
        server.start_telemetry_loop(100.0);

        let mut client = TcpStream::connect(addr).await.unwrap();

        let schema = next_text(&mut client).await;
        assert_eq!(schema["type"], "schema");
        assert_eq!(schema["modules"]["a"]["signals"][0]["name"], "x");
        assert_eq!(schema["modules"]["a"]["signals"][0]["type"], "f64");
        assert_eq!(schema["modules"]["b"]["signals"][0]["name"], "z");

        send_text(
            &mut client,
            r#"{"action":"subscribe","params":{"signals":["a.*"]}}"#,
        )
        .await;
        let ack = next_text(&mut client).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["action"], "subscribe");
        assert_eq!(ack["count"], 2);
        assert_eq!(ack["signals"], json!(["a.x", "a.y"]));

        let frame = telemetry::decode(&next_binary(&mut client).await).unwrap();
        assert_eq!(frame.values, vec![1.5, -2.0]);

        server.stop().await;
        bp.destroy().unwrap();
    }

    #[tokio::test]
    async fn wildcard_and_duplicate_patterns() {
        let (bp, catalog) = standalone_backplane("wildcard");
        let mut server = ControlServer::new(bp.clone(), catalog, None, test_settings());
        let addr = server.start_background().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        next_text(&mut client).await; // schema

        send_text(
            &mut client,
            r#"{"action":"subscribe","params":{"signals":["*","a.x","ghost.q"]}}"#,
        )
        .await;
        let ack = next_text(&mut client).await;
        assert_eq!(ack["count"], 3);
        assert_eq!(ack["signals"], json!(["a.x", "a.y", "b.z"]));

        server.stop().await;
        bp.destroy().unwrap();
    }

    #[tokio::test]
    async fn control_without_scheduler_is_rejected() {
        let (bp, catalog) = standalone_backplane("no_sched");
        let mut server = ControlServer::new(bp.clone(), catalog, None, test_settings());
        let addr = server.start_background().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        next_text(&mut client).await;

        send_text(&mut client, r#"{"action":"pause"}"#).await;
        let err = next_text(&mut client).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["message"], "No scheduler attached");

        server.stop().await;
        bp.destroy().unwrap();
    }

    #[tokio::test]
    async fn set_signal_and_unknown_signal() {
        let (bp, catalog) = standalone_backplane("set");
        let mut server = ControlServer::new(bp.clone(), catalog, None, test_settings());
        let addr = server.start_background().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        next_text(&mut client).await;

        send_text(
            &mut client,
            r#"{"action":"set","params":{"signal":"a.x","value":7.25}}"#,
        )
        .await;
        let ack = next_text(&mut client).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(bp.get_signal("a.x").unwrap(), 7.25);

        send_text(
            &mut client,
            r#"{"action":"set","params":{"signal":"ghost.q","value":1}}"#,
        )
        .await;
        let err = next_text(&mut client).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["message"], "Unknown signal: ghost.q");

        server.stop().await;
        bp.destroy().unwrap();
    }

    #[tokio::test]
    async fn malformed_input_keeps_connection_open() {
        let (bp, catalog) = standalone_backplane("malformed");
        let mut server = ControlServer::new(bp.clone(), catalog, None, test_settings());
        let addr = server.start_background().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        next_text(&mut client).await;

        send_text(&mut client, "this is not json").await;
        assert_eq!(next_text(&mut client).await["type"], "error");

        send_text(&mut client, r#"{"action":"warp"}"#).await;
        assert_eq!(next_text(&mut client).await["type"], "error");

        // Binary frames from clients are discarded without a response
        protocol::write_frame(&mut client, WireKind::Binary, &[1, 2, 3])
            .await
            .unwrap();

        // The connection is still serviceable
        send_text(
            &mut client,
            r#"{"action":"subscribe","params":{"signals":["b.z"]}}"#,
        )
        .await;
        assert_eq!(next_text(&mut client).await["count"], 1);

        server.stop().await;
        bp.destroy().unwrap();
    }

    fn sim_config() -> Config {
        serde_yaml::from_str(
            "
modules:
  inputs:
    kind: inproc
    inproc_id: injection
    signals: [{name: cmd, writable: true}]
  physics:
    kind: inproc
    inproc_id: mock_physics
    signals:
      - {name: input, writable: true}
      - {name: output}
      - {name: state}
wiring:
  - {src: inputs.cmd, dst: physics.input}
execution:
  mode: single_frame
  rate_hz: 100.0
server:
  enabled: true
  host: 127.0.0.1
  port: 0
  telemetry_hz: 100.0
",
        )
        .unwrap()
    }

    async fn sim_server() -> (ControlServer, SchedulerHandle, SocketAddr) {
        let config = sim_config();
        config.validate().unwrap();
        let mut pm = ProcessManager::new(config.clone()).unwrap();
        pm.initialize().unwrap();
        pm.load_all().unwrap();
        let catalog = pm.signals().to_vec();
        let backplane = pm.backplane().unwrap();
        let mut scheduler = Scheduler::new(pm, &config).unwrap();
        scheduler.stage().unwrap();
        let handle = SchedulerHandle::new(scheduler);

        let mut server = ControlServer::new(
            backplane,
            catalog,
            Some(handle.clone()),
            ServerSettings {
                port: 0,
                ..config.server
            },
        );
        let addr = server.start_background().await.unwrap();
        (server, handle, addr)
    }

    #[tokio::test]
    async fn step_and_reset_through_server() {
        let (mut server, handle, addr) = sim_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        next_text(&mut client).await;

        send_text(
            &mut client,
            r#"{"action":"set","params":{"signal":"inputs.cmd","value":5.0}}"#,
        )
        .await;
        next_text(&mut client).await;

        send_text(&mut client, r#"{"action":"step","params":{"count":3}}"#).await;
        let ack = next_text(&mut client).await;
        assert_eq!(ack["action"], "step");
        assert_eq!(ack["frame"], 3);
        assert_eq!(handle.frame().await, 3);

        // The broadcast event and the ack both arrive; order is unspecified
        send_text(&mut client, r#"{"action":"reset"}"#).await;
        let first = next_text(&mut client).await;
        let second = next_text(&mut client).await;
        let types: Vec<_> = [&first, &second]
            .iter()
            .map(|m| m["type"].as_str().unwrap().to_string())
            .collect();
        assert!(types.contains(&"ack".to_string()));
        assert!(types.contains(&"event".to_string()));
        assert_eq!(handle.frame().await, 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn control_acks_arrive_under_telemetry_load() {
        let (mut server, _handle, addr) = sim_server().await;
        server.start_telemetry_loop(100.0);

        let mut client = TcpStream::connect(addr).await.unwrap();
        next_text(&mut client).await;

        send_text(
            &mut client,
            r#"{"action":"subscribe","params":{"signals":["*"]}}"#,
        )
        .await;
        let ack = next_text(&mut client).await;
        assert_eq!(ack["action"], "subscribe");
        assert_eq!(ack["count"], 4);

        // Let binary frames interleave before sending controls
        next_binary(&mut client).await;

        send_text(&mut client, r#"{"action":"pause"}"#).await;
        let mut saw_pause_ack = false;
        let mut saw_paused_event = false;
        for _ in 0..10 {
            let msg = next_text(&mut client).await;
            match msg["type"].as_str() {
                Some("ack") if msg["action"] == "pause" => saw_pause_ack = true,
                Some("event") if msg["event"] == "paused" => saw_paused_event = true,
                _ => {}
            }
            if saw_pause_ack && saw_paused_event {
                break;
            }
        }
        assert!(saw_pause_ack && saw_paused_event);

        send_text(&mut client, r#"{"action":"resume"}"#).await;
        let mut saw_resume_ack = false;
        let mut saw_running_event = false;
        for _ in 0..10 {
            let msg = next_text(&mut client).await;
            match msg["type"].as_str() {
                Some("ack") if msg["action"] == "resume" => saw_resume_ack = true,
                Some("event") if msg["event"] == "running" => saw_running_event = true,
                _ => {}
            }
            if saw_resume_ack && saw_running_event {
                break;
            }
        }
        assert!(saw_resume_ack && saw_running_event);

        server.stop().await;
    }
}
