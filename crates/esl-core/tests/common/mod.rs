//! Loopback event-socket server for integration tests
//!
//! Speaks enough of the protocol for the client: auth handshake, event
//! subscription, `api`, `bgapi` with `BACKGROUND_JOB` completion and `exit`.
//! Tests push events and drop connections through the handle.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rvoip_esl_core::{EslConfig, SnapshotConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const PASSWORD: &str = "ClueCon";

/// Maps an api command to its output; `None` means never answer
pub type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

enum Outbound {
    Data(String),
    Close,
}

pub struct MockSwitch {
    pub addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
    connections: Arc<AtomicUsize>,
    drop_after_subscribe: Arc<AtomicBool>,
}

pub fn default_responder(command: &str) -> Option<String> {
    if command == "status" {
        return Some("UP 0 years, 0 days, 1 hour\n100 session(s) since startup\n".to_string());
    }
    if command == "show channels as json" {
        return Some(r#"{"row_count":0}"#.to_string());
    }
    if let Some(uuid) = origination_uuid(command) {
        return Some(format!("+OK {}\n", uuid));
    }
    Some("+OK\n".to_string())
}

/// `origination_uuid` value of an originate command line
pub fn origination_uuid(command: &str) -> Option<String> {
    let start = command.find("origination_uuid=")? + "origination_uuid=".len();
    let rest = &command[start..];
    let end = rest.find([',', '}']).unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

impl MockSwitch {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(Arc::new(default_responder)).await
    }

    pub async fn start_with(responder: Responder) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let commands = Arc::new(Mutex::new(Vec::new()));
        let outbound = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));
        let drop_after_subscribe = Arc::new(AtomicBool::new(false));

        {
            let commands = commands.clone();
            let outbound = outbound.clone();
            let connections = connections.clone();
            let drop_after_subscribe = drop_after_subscribe.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (read, mut write) = socket.into_split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
                    *outbound.lock() = Some(tx.clone());

                    tokio::spawn(async move {
                        while let Some(message) = rx.recv().await {
                            match message {
                                Outbound::Data(data) => {
                                    if write.write_all(data.as_bytes()).await.is_err() {
                                        break;
                                    }
                                }
                                Outbound::Close => break,
                            }
                        }
                        let _ = write.shutdown().await;
                    });

                    let _ = tx.send(Outbound::Data("Content-Type: auth/request\n\n".to_string()));
                    tokio::spawn(serve_commands(
                        read,
                        tx,
                        commands.clone(),
                        responder.clone(),
                        drop_after_subscribe.clone(),
                    ));
                }
            });
        }

        Ok(Self {
            addr,
            commands,
            outbound,
            connections,
            drop_after_subscribe,
        })
    }

    /// Close every new connection right after acknowledging the event subscription
    pub fn set_drop_after_subscribe(&self, enabled: bool) {
        self.drop_after_subscribe.store(enabled, Ordering::SeqCst);
    }

    /// Client configuration with short timeouts pointed at this server
    pub fn config(&self) -> EslConfig {
        EslConfig::new("127.0.0.1", self.addr.port(), PASSWORD)
            .with_command_timeout(Duration::from_millis(1_000))
            .with_job_timeout(Duration::from_millis(1_000))
            .with_reconnect(Duration::from_millis(25), 3)
            .with_snapshot(SnapshotConfig {
                poll_interval_ms: 60_000,
                stats_interval_ms: 60_000,
                history_capacity: 10,
            })
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn received(&self, command: &str) -> bool {
        self.commands.lock().iter().any(|c| c == command)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Push a plain event to the current connection
    pub fn send_event(&self, headers: &[(&str, &str)]) {
        self.send_raw(event_frame(headers, None));
    }

    pub fn send_raw(&self, data: String) {
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(Outbound::Data(data));
        }
    }

    /// Close the current connection without a disconnect notice
    pub fn drop_connection(&self) {
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(Outbound::Close);
        }
    }
}

async fn serve_commands(
    read: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Outbound>,
    commands: Arc<Mutex<Vec<String>>>,
    responder: Responder,
    drop_after_subscribe: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(read);
    while let Some(command) = read_command(&mut reader).await {
        commands.lock().push(command.clone());
        for message in respond(&command, &responder) {
            let _ = tx.send(message);
        }
        if command == "event plain ALL" && drop_after_subscribe.load(Ordering::SeqCst) {
            let _ = tx.send(Outbound::Close);
            return;
        }
    }
}

async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            return Some(lines.join("\n"));
        }
        lines.push(line.to_string());
    }
}

fn respond(command: &str, responder: &Responder) -> Vec<Outbound> {
    if let Some(password) = command.strip_prefix("auth ") {
        let text = if password == PASSWORD {
            "+OK accepted"
        } else {
            "-ERR invalid"
        };
        return vec![Outbound::Data(command_reply(text))];
    }
    if command == "event plain ALL" {
        return vec![Outbound::Data(command_reply("+OK event listener enabled plain"))];
    }
    if command == "exit" {
        return vec![
            Outbound::Data(command_reply("+OK bye")),
            Outbound::Data("Content-Type: text/disconnect-notice\nContent-Length: 0\n\n".to_string()),
            Outbound::Close,
        ];
    }
    if let Some(api) = command.strip_prefix("api ") {
        return match responder(api) {
            Some(body) => vec![Outbound::Data(api_response(&body))],
            None => Vec::new(),
        };
    }
    if let Some(rest) = command.strip_prefix("bgapi ") {
        let mut lines = rest.lines();
        let api = lines.next().unwrap_or_default().to_string();
        let job_id = lines
            .find_map(|l| l.strip_prefix("Job-UUID: "))
            .unwrap_or("server-job")
            .to_string();

        let mut out = vec![Outbound::Data(command_reply(&format!("+OK Job-UUID: {}", job_id)))];
        if let Some(body) = responder(&api) {
            out.push(Outbound::Data(event_frame(
                &[("Event-Name", "BACKGROUND_JOB"), ("Job-UUID", &job_id)],
                Some(&body),
            )));
        }
        return out;
    }
    vec![Outbound::Data(command_reply("-ERR command not found"))]
}

pub fn command_reply(text: &str) -> String {
    format!("Content-Type: command/reply\nReply-Text: {}\n\n", text)
}

pub fn api_response(body: &str) -> String {
    format!(
        "Content-Type: api/response\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
}

/// `text/event-plain` frame with percent-encoded header values
pub fn event_frame(headers: &[(&str, &str)], body: Option<&str>) -> String {
    let mut inner = String::new();
    for (name, value) in headers {
        inner.push_str(&format!("{}: {}\n", name, utf8_percent_encode(value, NON_ALPHANUMERIC)));
    }
    match body {
        Some(body) => inner.push_str(&format!("Content-Length: {}\n\n{}", body.len(), body)),
        None => inner.push('\n'),
    }
    format!(
        "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
        inner.len(),
        inner
    )
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
