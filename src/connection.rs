//! Connection lifecycle: phase machine, reconnect timer and heartbeat.
//!
//! ```text
//! idle ──connect──▶ connecting ──ok──▶ connected
//!                       ▲                 │ drop / error
//!                       │ retry tick      ▼
//!                       └────────── reconnecting ──attempts exhausted──▶ failed
//! ```
//!
//! `failed` is terminal until [`ConnectionManager::force_reconnect`]. There is
//! one reconnect timer and one heartbeat timer, both stored as deadlines: the
//! owner asks for [`ConnectionManager::next_deadline`], sleeps, and calls
//! [`ConnectionManager::poll_timers`]. Cancelling a timer clears its deadline,
//! so a cancelled timer can never fire late.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::protocol::packet::Packet;
use crate::session::Input;
use crate::transport::{Connector, EventSink, Transport};

/// Where the connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Reconnect and heartbeat tuning.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Fixed delay between reconnect attempts.
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Timer outcomes the owner has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerSignal {
    /// Time to send a liveness check.
    Heartbeat,
    /// A reconnect attempt was started.
    Retrying { attempt: u32, max: u32 },
    /// Attempts are exhausted; the phase is now `Failed`.
    GaveUp { max: u32 },
}

pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    inputs: mpsc::UnboundedSender<Input>,
    settings: ConnectionSettings,
    transport: Option<Box<dyn Transport>>,
    generation: u64,
    phase: ConnectionPhase,
    connection_id: Option<String>,
    attempt: u32,
    retry_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        connector: Box<dyn Connector>,
        inputs: mpsc::UnboundedSender<Input>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            connector,
            inputs,
            settings,
            transport: None,
            generation: 0,
            phase: ConnectionPhase::Idle,
            connection_id: None,
            attempt: 0,
            retry_at: None,
            heartbeat_at: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Server-assigned id of the current connection, while connected.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.settings.max_reconnect_attempts
    }

    /// Generation of the transport currently open (0 before the first connect).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an input tagged with `generation` belongs to the live transport.
    pub fn is_current(&self, generation: u64) -> bool {
        self.transport.is_some() && generation == self.generation
    }

    /// Open a fresh transport, tearing down any existing one first.
    pub fn connect(&mut self) {
        self.teardown();
        self.generation += 1;
        self.phase = ConnectionPhase::Connecting;
        debug!(generation = self.generation, "connecting");
        let sink = EventSink::new(self.generation, self.inputs.clone());
        self.transport = Some(self.connector.open(sink));
    }

    /// The transport completed its handshake.
    pub fn on_connected(&mut self, sid: String, now: Instant) {
        info!(sid = %sid, "Connected to chat backend");
        self.phase = ConnectionPhase::Connected;
        self.attempt = 0;
        self.retry_at = None;
        self.connection_id = Some(sid);
        self.heartbeat_at = Some(now + self.settings.heartbeat_interval);
    }

    /// The transport failed to connect or dropped. Starts the reconnect timer
    /// unless one is already running.
    pub fn on_transport_failure(&mut self, now: Instant) {
        self.teardown();
        if self.phase == ConnectionPhase::Failed {
            return;
        }
        if self.retry_at.is_some() {
            self.phase = ConnectionPhase::Reconnecting;
            return;
        }
        if self.attempt < self.settings.max_reconnect_attempts {
            self.phase = ConnectionPhase::Reconnecting;
            self.retry_at = Some(now + self.settings.reconnect_interval);
            debug!(
                delay_ms = self.settings.reconnect_interval.as_millis(),
                "reconnect scheduled"
            );
        } else {
            warn!(attempts = self.attempt, "Reconnect attempts exhausted");
            self.phase = ConnectionPhase::Failed;
        }
    }

    /// Manual retry: resets the attempt counter and reconnects immediately.
    pub fn force_reconnect(&mut self) {
        info!("Forcing reconnect");
        self.attempt = 0;
        self.retry_at = None;
        self.connect();
    }

    /// Release the transport and stop all timers.
    pub fn shutdown(&mut self) {
        self.teardown();
        self.retry_at = None;
        self.phase = ConnectionPhase::Idle;
    }

    /// Send a packet. Fails unless the phase is `Connected`.
    pub fn send(&mut self, packet: Packet) -> Result<(), ChatError> {
        if self.phase != ConnectionPhase::Connected {
            return Err(ChatError::NotConnected);
        }
        match self.transport.as_mut() {
            Some(transport) => transport.send(packet),
            None => Err(ChatError::NotConnected),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.retry_at, self.heartbeat_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire every timer whose deadline has passed.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<TimerSignal> {
        let mut signals = Vec::new();

        if self.retry_at.is_some_and(|at| at <= now) {
            let max = self.settings.max_reconnect_attempts;
            if self.attempt >= max {
                warn!("Could not reconnect after {max} attempts");
                self.retry_at = None;
                self.teardown();
                self.phase = ConnectionPhase::Failed;
                signals.push(TimerSignal::GaveUp { max });
            } else {
                self.attempt += 1;
                self.retry_at = Some(now + self.settings.reconnect_interval);
                info!(attempt = self.attempt, max, "Reconnecting");
                signals.push(TimerSignal::Retrying {
                    attempt: self.attempt,
                    max,
                });
                self.connect();
            }
        }

        if self.heartbeat_at.is_some_and(|at| at <= now) {
            if self.phase == ConnectionPhase::Connected {
                self.heartbeat_at = Some(now + self.settings.heartbeat_interval);
                signals.push(TimerSignal::Heartbeat);
            } else {
                self.heartbeat_at = None;
            }
        }

        signals
    }

    fn teardown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            debug!(generation = self.generation, "closing transport");
            transport.close();
        }
        self.connection_id = None;
        self.heartbeat_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        opened: u32,
        closed: u32,
        sent: Vec<Packet>,
    }

    struct FakeTransport(Arc<Mutex<Log>>);

    impl Transport for FakeTransport {
        fn send(&mut self, packet: Packet) -> Result<(), ChatError> {
            self.0.lock().unwrap().sent.push(packet);
            Ok(())
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closed += 1;
        }
    }

    struct FakeConnector(Arc<Mutex<Log>>);

    impl Connector for FakeConnector {
        fn open(&mut self, _sink: EventSink) -> Box<dyn Transport> {
            self.0.lock().unwrap().opened += 1;
            Box::new(FakeTransport(self.0.clone()))
        }
    }

    fn manager() -> (ConnectionManager, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mgr = ConnectionManager::new(
            Box::new(FakeConnector(log.clone())),
            tx,
            ConnectionSettings::default(),
        );
        (mgr, log)
    }

    #[test]
    fn connect_replaces_existing_transport() {
        let (mut mgr, log) = manager();
        mgr.connect();
        mgr.connect();
        let log = log.lock().unwrap();
        assert_eq!(log.opened, 2);
        assert_eq!(log.closed, 1);
        assert_eq!(mgr.generation(), 2);
        assert!(mgr.is_current(2));
        assert!(!mgr.is_current(1));
    }

    #[test]
    fn send_requires_connected_phase() {
        let (mut mgr, log) = manager();
        let t0 = Instant::now();
        mgr.connect();
        assert!(matches!(
            mgr.send(Packet::event("pong", serde_json::Value::Null)),
            Err(ChatError::NotConnected)
        ));
        mgr.on_connected("sid-1".into(), t0);
        mgr.send(Packet::event("pong", serde_json::Value::Null)).unwrap();
        assert_eq!(log.lock().unwrap().sent.len(), 1);
        assert_eq!(mgr.connection_id(), Some("sid-1"));
    }

    #[test]
    fn retries_then_fails_after_max_attempts() {
        let (mut mgr, _log) = manager();
        let mut now = Instant::now();
        mgr.connect();
        mgr.on_transport_failure(now);
        assert_eq!(mgr.phase(), ConnectionPhase::Reconnecting);

        for expected in 1..=5 {
            now += Duration::from_secs(5);
            let signals = mgr.poll_timers(now);
            assert_eq!(
                signals,
                vec![TimerSignal::Retrying {
                    attempt: expected,
                    max: 5
                }]
            );
            assert_eq!(mgr.phase(), ConnectionPhase::Connecting);
            mgr.on_transport_failure(now);
            assert!(mgr.reconnect_attempt() <= 5);
        }

        now += Duration::from_secs(5);
        assert_eq!(mgr.poll_timers(now), vec![TimerSignal::GaveUp { max: 5 }]);
        assert_eq!(mgr.phase(), ConnectionPhase::Failed);
        assert_eq!(mgr.next_deadline(), None);

        // Terminal: further failures schedule nothing.
        mgr.on_transport_failure(now);
        assert_eq!(mgr.phase(), ConnectionPhase::Failed);
        assert_eq!(mgr.next_deadline(), None);
    }

    #[test]
    fn connected_resets_attempts_and_cancels_retry() {
        let (mut mgr, _log) = manager();
        let mut now = Instant::now();
        mgr.connect();
        mgr.on_transport_failure(now);
        now += Duration::from_secs(5);
        mgr.poll_timers(now);
        assert_eq!(mgr.reconnect_attempt(), 1);

        mgr.on_connected("sid".into(), now);
        assert_eq!(mgr.reconnect_attempt(), 0);
        // Only the heartbeat remains scheduled.
        assert_eq!(mgr.next_deadline(), Some(now + Duration::from_secs(30)));
        assert!(mgr.poll_timers(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn force_reconnect_leaves_failed() {
        let (mut mgr, log) = manager();
        let mut now = Instant::now();
        mgr.connect();
        mgr.on_transport_failure(now);
        for _ in 0..6 {
            now += Duration::from_secs(5);
            mgr.poll_timers(now);
            mgr.on_transport_failure(now);
        }
        assert_eq!(mgr.phase(), ConnectionPhase::Failed);

        mgr.force_reconnect();
        assert_eq!(mgr.phase(), ConnectionPhase::Connecting);
        assert_eq!(mgr.reconnect_attempt(), 0);
        assert_eq!(log.lock().unwrap().opened, 7);
    }

    #[test]
    fn force_reconnect_cancels_pending_retry() {
        let (mut mgr, log) = manager();
        let t0 = Instant::now();
        mgr.connect();
        mgr.on_connected("sid".into(), t0);
        mgr.on_transport_failure(t0);
        assert_eq!(mgr.next_deadline(), Some(t0 + Duration::from_secs(5)));

        mgr.force_reconnect();
        assert_eq!(mgr.phase(), ConnectionPhase::Connecting);
        assert_eq!(mgr.reconnect_attempt(), 0);
        assert_eq!(mgr.next_deadline(), None);
        assert!(mgr.poll_timers(t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(log.lock().unwrap().opened, 2);
    }

    #[test]
    fn heartbeat_fires_every_interval_while_connected() {
        let (mut mgr, _log) = manager();
        let t0 = Instant::now();
        mgr.connect();
        mgr.on_connected("sid".into(), t0);
        assert_eq!(
            mgr.poll_timers(t0 + Duration::from_secs(30)),
            vec![TimerSignal::Heartbeat]
        );
        assert!(mgr.poll_timers(t0 + Duration::from_secs(45)).is_empty());
        assert_eq!(
            mgr.poll_timers(t0 + Duration::from_secs(60)),
            vec![TimerSignal::Heartbeat]
        );
    }

    #[test]
    fn drop_stops_heartbeat() {
        let (mut mgr, _log) = manager();
        let t0 = Instant::now();
        mgr.connect();
        mgr.on_connected("sid".into(), t0);
        mgr.on_transport_failure(t0 + Duration::from_secs(1));
        assert_eq!(mgr.connection_id(), None);
        assert_eq!(mgr.next_deadline(), Some(t0 + Duration::from_secs(6)));
    }
}
