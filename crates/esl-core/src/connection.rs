//! Connection manager for the switch control socket
//!
//! Owns the single TCP connection to the event socket. The manager performs
//! the authentication handshake, subscribes to the full event feed and then
//! runs one read loop per connection that:
//!
//! - forwards events, in socket order, to the dispatcher channel
//! - completes synchronous command replies in FIFO order
//! - detects socket errors, EOF and disconnect notices
//!
//! When the connection drops every outstanding reply slot is failed, a
//! [`ConnectionSignal::Disconnected`] is broadcast and a reconnect task is
//! started. The task retries with exponential backoff until the
//! [`ReconnectPolicy`] budget is spent, then broadcasts
//! [`ConnectionSignal::MaxReconnectAttemptsReached`] and stops. An explicit
//! [`ConnectionManager::connect`] starts over with a fresh budget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::config::{EslConfig, ReconnectConfig};
use crate::error::{EslError, EslResult};
use crate::protocol::{ContentType, EslCodec, EslEvent, EslFrame};

type FrameReader = FramedRead<OwnedReadHalf, EslCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, EslCodec>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Signals broadcast to connection listeners
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSignal {
    /// Handshake finished, events are flowing
    Connected,
    /// Socket lost or closed
    Disconnected { reason: String },
    /// A reconnect attempt will run after `delay`
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The reconnect budget is spent, no further automatic attempts
    MaxReconnectAttemptsReached { attempts: u32 },
}

/// Exponential reconnect backoff: the n-th retry waits `base x 2^n`
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay(), config.max_attempts)
    }

    /// Count one more attempt and return its delay, `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        let factor = 2u32.saturating_pow(self.attempt);
        Some(self.base_delay.saturating_mul(factor))
    }

    /// Attempts counted since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Owner of the control socket
pub struct ConnectionManager {
    config: EslConfig,
    state: RwLock<ConnectionState>,
    /// Set while a handshake is in flight; guards against parallel attempts
    connecting: AtomicBool,
    /// Set while a reconnect task is alive
    reconnecting: AtomicBool,
    /// Set by `disconnect()`, suppresses automatic reconnection
    shutdown: AtomicBool,
    /// Bumped on every new connection so a stale read loop cannot tear down its successor
    epoch: AtomicU64,
    policy: Mutex<ReconnectPolicy>,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    /// Reply slots of synchronous commands, in the order they were written
    pending: Mutex<VecDeque<oneshot::Sender<EslFrame>>>,
    connected_since: RwLock<Option<DateTime<Utc>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::Sender<EslEvent>,
    signals: broadcast::Sender<ConnectionSignal>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("addr", &self.config.addr())
            .field("state", &*self.state.read())
            .field("pending_replies", &self.pending.lock().len())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager and the receiving end of its ordered event channel
    pub fn new(config: EslConfig) -> (Arc<Self>, mpsc::Receiver<EslEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (signals, _) = broadcast::channel(64);
        let policy = ReconnectPolicy::from_config(&config.reconnect);

        let manager = Arc::new(Self {
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            connecting: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            policy: Mutex::new(policy),
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            connected_since: RwLock::new(None),
            read_task: Mutex::new(None),
            events_tx,
            signals,
        });
        (manager, events_rx)
    }

    pub fn config(&self) -> &EslConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// The single liveness predicate used by every other component
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Time the current connection was established
    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        *self.connected_since.read()
    }

    /// Attempts counted by the reconnect policy since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.policy.lock().attempt()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    /// Connect, authenticate and subscribe to events.
    ///
    /// A no-op while connected or while another attempt is in flight. An
    /// exhausted reconnect budget is reset, so this is also how an operator
    /// restarts a manager that gave up. On failure a reconnect is scheduled
    /// and the error is returned.
    pub async fn connect(self: &Arc<Self>) -> EslResult<()> {
        self.shutdown.store(false, Ordering::SeqCst);
        {
            let mut policy = self.policy.lock();
            if policy.is_exhausted() {
                info!("Resetting exhausted reconnect budget on explicit connect");
                policy.reset();
            }
        }

        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !self.shutdown.load(Ordering::SeqCst) {
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    /// Close the socket with `exit` and stop reconnecting
    pub async fn disconnect(&self) -> EslResult<()> {
        self.shutdown.store(true, Ordering::SeqCst);

        if self.is_connected() {
            if let Err(e) = self.send_command("exit", self.config.command_timeout()).await {
                debug!(error = %e, "exit command did not complete cleanly");
            }
        }

        // Invalidate the current read loop before tearing down
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        self.writer.lock().await.take();

        let was_connected = self.set_disconnected();
        self.fail_pending();
        if was_connected {
            let _ = self.signals.send(ConnectionSignal::Disconnected {
                reason: "client requested disconnect".to_string(),
            });
        }
        info!(addr = %self.config.addr(), "Disconnected from switch");
        Ok(())
    }

    /// Write a command and wait for its `command/reply` or `api/response`
    pub async fn send_command(&self, command: &str, timeout: Duration) -> EslResult<EslFrame> {
        if !self.is_connected() {
            return Err(EslError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(EslError::NotConnected)?;

            // Pushed under the writer lock so slot order matches write order
            self.pending.lock().push_back(tx);
            if let Err(e) = writer.send(command.to_string()).await {
                self.pending.lock().pop_back();
                return Err(e);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(EslError::ConnectionClosed {
                reason: format!("connection lost before reply to '{}'", command_verb(command)),
            }),
            // The slot stays queued with a dropped receiver, the late reply is discarded
            Err(_) => Err(EslError::CommandTimeout {
                command: command_verb(command),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn try_connect(self: &Arc<Self>) -> EslResult<()> {
        if self.is_connected() {
            debug!("Already connected, connect is a no-op");
            return Ok(());
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Connection attempt already in progress");
            return Ok(());
        }

        *self.state.write() = ConnectionState::Connecting;
        let result = self.establish().await;
        self.connecting.store(false, Ordering::SeqCst);

        if let Err(e) = &result {
            *self.state.write() = ConnectionState::Disconnected;
            warn!(addr = %self.config.addr(), error = %e, "Connection attempt failed");
        }
        result
    }

    async fn establish(self: &Arc<Self>) -> EslResult<()> {
        let addr = self.config.addr();
        let connect_timeout = self.config.connect_timeout();
        debug!(addr = %addr, "Connecting to event socket");

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| EslError::ConnectionFailed {
                addr: addr.clone(),
                reason: format!("connect timed out after {}ms", connect_timeout.as_millis()),
            })?
            .map_err(|e| EslError::ConnectionFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, EslCodec::new());
        let mut writer = FramedWrite::new(write_half, EslCodec::new());

        tokio::time::timeout(
            connect_timeout,
            handshake(&mut reader, &mut writer, &self.config.password),
        )
        .await
        .map_err(|_| EslError::ConnectionFailed {
            addr: addr.clone(),
            reason: "handshake timed out".to_string(),
        })??;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some(writer);

        // Published before the read loop starts: a close it detects must be applied last
        self.policy.lock().reset();
        *self.connected_since.write() = Some(Utc::now());
        *self.state.write() = ConnectionState::Connected;
        let _ = self.signals.send(ConnectionSignal::Connected);
        info!(addr = %addr, "Connected to switch event socket");

        // Held across the spawn so a faster successor cannot be overwritten
        let mut read_task = self.read_task.lock();
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.read_loop(reader, epoch).await });
        if let Some(old) = read_task.replace(task) {
            old.abort();
        }
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut reader: FrameReader, epoch: u64) {
        let reason = loop {
            let frame = match reader.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break e.to_string(),
                None => break "socket closed by peer".to_string(),
            };

            match frame.content_type() {
                Some(ct) if ct.is_reply() => self.complete_reply(frame),
                Some(ct) if ct.is_event() => match EslEvent::from_frame(&frame) {
                    Ok(event) => {
                        if self.events_tx.send(event).await.is_err() {
                            debug!("Event receiver dropped, discarding event");
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed event"),
                },
                Some(ContentType::DisconnectNotice) => {
                    break "disconnect notice from switch".to_string()
                }
                Some(ContentType::RudeRejection) => break "rejected by switch".to_string(),
                other => debug!(content_type = ?other, "Ignoring frame"),
            }
        };

        self.handle_disconnect(epoch, reason).await;
    }

    fn complete_reply(&self, frame: EslFrame) {
        let slot = self.pending.lock().pop_front();
        match slot {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    debug!("Discarding reply for a command that already timed out");
                }
            }
            None => warn!(
                reply = frame.reply_text().unwrap_or_default(),
                "Reply with no outstanding command"
            ),
        }
    }

    async fn handle_disconnect(self: &Arc<Self>, epoch: u64, reason: String) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(epoch, "Ignoring close of a superseded connection");
            return;
        }

        self.writer.lock().await.take();
        self.set_disconnected();
        self.fail_pending();
        warn!(reason = %reason, "Lost connection to switch");
        let _ = self.signals.send(ConnectionSignal::Disconnected { reason });

        if !self.shutdown.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    /// Returns whether the manager was connected before
    fn set_disconnected(&self) -> bool {
        let mut state = self.state.write();
        let was_connected = *state == ConnectionState::Connected;
        *state = ConnectionState::Disconnected;
        *self.connected_since.write() = None;
        was_connected
    }

    /// Dropping the senders wakes every waiting caller with an error
    fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain(..).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Failing outstanding reply slots");
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.reconnect_loop().await;
            this.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) || self.is_connected() {
                return;
            }

            let (delay, attempt, max_attempts) = {
                let mut policy = self.policy.lock();
                let delay = policy.next_delay();
                (delay, policy.attempt(), policy.max_attempts())
            };
            let Some(delay) = delay else {
                error!(
                    attempts = max_attempts,
                    "Max reconnect attempts reached, giving up until connect() is called"
                );
                let _ = self.signals.send(ConnectionSignal::MaxReconnectAttemptsReached {
                    attempts: max_attempts,
                });
                return;
            };

            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            let _ = self
                .signals
                .send(ConnectionSignal::ReconnectScheduled { attempt, delay });
            tokio::time::sleep(delay).await;

            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if self.try_connect().await.is_ok() && self.is_connected() {
                return;
            }
        }
    }
}

async fn handshake(reader: &mut FrameReader, writer: &mut FrameWriter, password: &str) -> EslResult<()> {
    let greeting = next_frame(reader).await?;
    if greeting.content_type() != Some(ContentType::AuthRequest) {
        return Err(EslError::protocol(format!(
            "expected auth/request, got {:?}",
            greeting.content_type()
        )));
    }

    writer.send(format!("auth {}", password)).await?;
    let reply = next_reply(reader).await?;
    if !reply.is_ok_reply() {
        return Err(EslError::AuthenticationFailed {
            reason: reply.reply_text().unwrap_or("no reply text").to_string(),
        });
    }

    writer.send("event plain ALL".to_string()).await?;
    let reply = next_reply(reader).await?;
    if !reply.is_ok_reply() {
        return Err(EslError::protocol(format!(
            "event subscription refused: {}",
            reply.reply_text().unwrap_or("no reply text")
        )));
    }
    Ok(())
}

async fn next_frame(reader: &mut FrameReader) -> EslResult<EslFrame> {
    match reader.next().await {
        Some(Ok(frame)) => match frame.content_type() {
            Some(ContentType::RudeRejection) => Err(EslError::AuthenticationFailed {
                reason: frame.body().unwrap_or("rejected by access list").trim().to_string(),
            }),
            Some(ContentType::DisconnectNotice) => Err(EslError::ConnectionClosed {
                reason: "disconnect notice during handshake".to_string(),
            }),
            _ => Ok(frame),
        },
        Some(Err(e)) => Err(e),
        None => Err(EslError::ConnectionClosed {
            reason: "socket closed during handshake".to_string(),
        }),
    }
}

async fn next_reply(reader: &mut FrameReader) -> EslResult<EslFrame> {
    loop {
        let frame = next_frame(reader).await?;
        if frame.content_type() == Some(ContentType::CommandReply) {
            return Ok(frame);
        }
        debug!(content_type = ?frame.content_type(), "Skipping frame while waiting for reply");
    }
}

/// First line of a command without arguments, safe for errors and logs
fn command_verb(command: &str) -> String {
    let line = command.lines().next().unwrap_or_default();
    match line.strip_prefix("auth ") {
        Some(_) => "auth".to_string(),
        None => line.to_string(),
    }
}
