//! Inbound event routing and outbound acknowledgement tracking.
//!
//! Handlers are plain function pointers over the owning state `S`, looked up
//! by event name and invoked by the owner with `&mut S`, so a handler always
//! sees current state. Several names may share one handler.
//!
//! Requests that expect an acknowledgement get a fresh ack id and a deadline.
//! Whichever comes first, the ack or the deadline, removes the pending entry
//! and hands its callback back to the owner; the other path then finds
//! nothing. Each callback therefore runs exactly once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::error::ChatError;
use crate::protocol::packet::Packet;

/// Handler for a named inbound event.
pub type Handler<S> = fn(&mut S, Value, Instant);

/// Continuation for an acknowledged request.
pub type AckCallback<S> = Box<dyn FnOnce(&mut S, Result<Value, ChatError>, Instant) + Send>;

/// A request waiting for its acknowledgement.
pub struct PendingAck<S> {
    pub event: &'static str,
    pub timeout: Duration,
    deadline: Instant,
    callback: AckCallback<S>,
}

impl<S> PendingAck<S> {
    /// Resolve with the server's answer.
    pub fn resolve(self, state: &mut S, data: Value, now: Instant) {
        (self.callback)(state, Ok(data), now);
    }

    /// Resolve with a synthetic timeout.
    pub fn expire(self, state: &mut S, now: Instant) {
        let err = ChatError::Timeout {
            event: self.event.to_string(),
            after: self.timeout,
        };
        (self.callback)(state, Err(err), now);
    }
}

pub struct EventDispatcher<S> {
    handlers: HashMap<&'static str, Handler<S>>,
    pending: HashMap<u64, PendingAck<S>>,
    next_ack: u64,
}

impl<S> Default for EventDispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> EventDispatcher<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            pending: HashMap::new(),
            next_ack: 0,
        }
    }

    /// Bind `handler` to every name in `events`.
    pub fn on(&mut self, events: &[&'static str], handler: Handler<S>) {
        for &event in events {
            self.handlers.insert(event, handler);
        }
    }

    pub fn handler(&self, event: &str) -> Option<Handler<S>> {
        self.handlers.get(event).copied()
    }

    /// Emit `event` expecting an ack within `timeout`.
    ///
    /// If the packet cannot be handed to the transport, nothing is registered
    /// and the callback comes back in the error so the caller can run it.
    pub fn send_with_ack(
        &mut self,
        connection: &mut ConnectionManager,
        event: &'static str,
        payload: Value,
        timeout: Duration,
        now: Instant,
        callback: AckCallback<S>,
    ) -> Result<u64, (ChatError, AckCallback<S>)> {
        let id = self.next_ack;
        if let Err(e) = connection.send(Packet::event_with_ack(event, payload, id)) {
            return Err((e, callback));
        }
        self.next_ack += 1;
        debug!(event, ack = id, "awaiting ack");
        self.pending.insert(
            id,
            PendingAck {
                event,
                timeout,
                deadline: now + timeout,
                callback,
            },
        );
        Ok(id)
    }

    /// Claim the pending request for an inbound ack. `None` for unknown or
    /// already-expired ids.
    pub fn take_ack(&mut self, id: u64) -> Option<PendingAck<S>> {
        let pending = self.pending.remove(&id);
        if pending.is_none() {
            debug!(ack = id, "ignoring ack with no pending request");
        }
        pending
    }

    /// Remove every request whose deadline has passed, oldest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingAck<S>> {
        let mut ids: Vec<(Instant, u64)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, p)| (p.deadline, *id))
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|(_, id)| self.pending.remove(&id))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSettings;
    use crate::transport::{Connector, EventSink, Transport};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&mut self, _packet: Packet) -> Result<(), ChatError> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    struct NullConnector;

    impl Connector for NullConnector {
        fn open(&mut self, _sink: EventSink) -> Box<dyn Transport> {
            Box::new(NullTransport)
        }
    }

    #[derive(Default)]
    struct Probe {
        seen: Vec<String>,
        results: Vec<Result<Value, String>>,
    }

    fn record(p: &mut Probe, data: Value, _now: Instant) {
        p.seen.push(data.to_string());
    }

    fn callback() -> AckCallback<Probe> {
        Box::new(|p: &mut Probe, r: Result<Value, ChatError>, _: Instant| {
            p.results.push(r.map_err(|e| e.to_string()));
        })
    }

    fn connected(now: Instant) -> ConnectionManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn =
            ConnectionManager::new(Box::new(NullConnector), tx, ConnectionSettings::default());
        conn.connect();
        conn.on_connected("sid".into(), now);
        conn
    }

    #[test]
    fn aliases_share_handler() {
        let mut d = EventDispatcher::<Probe>::new();
        d.on(&["message", "newMessage"], record);
        let mut probe = Probe::default();
        for name in ["message", "newMessage"] {
            let h = d.handler(name).unwrap();
            h(&mut probe, json!(name), Instant::now());
        }
        assert_eq!(probe.seen.len(), 2);
        assert!(d.handler("other").is_none());
    }

    #[test]
    fn ack_before_deadline_resolves_once() {
        let t0 = Instant::now();
        let mut conn = connected(t0);
        let mut d = EventDispatcher::<Probe>::new();
        let mut probe = Probe::default();
        let id = d
            .send_with_ack(&mut conn, "clientMessage", json!({}), Duration::from_secs(15), t0, callback())
            .ok()
            .unwrap();

        d.take_ack(id).unwrap().resolve(&mut probe, json!({"success": true}), t0);
        assert!(d.take_expired(t0 + Duration::from_secs(20)).is_empty());
        assert!(d.take_ack(id).is_none());
        assert_eq!(probe.results.len(), 1);
        assert!(probe.results[0].is_ok());
    }

    #[test]
    fn deadline_before_ack_resolves_with_timeout() {
        let t0 = Instant::now();
        let mut conn = connected(t0);
        let mut d = EventDispatcher::<Probe>::new();
        let mut probe = Probe::default();
        let id = d
            .send_with_ack(&mut conn, "clientMessage", json!({}), Duration::from_secs(15), t0, callback())
            .ok()
            .unwrap();

        assert!(d.take_expired(t0 + Duration::from_secs(14)).is_empty());
        for pending in d.take_expired(t0 + Duration::from_secs(15)) {
            pending.expire(&mut probe, t0);
        }
        assert!(d.take_ack(id).is_none());
        assert_eq!(probe.results.len(), 1);
        assert_eq!(
            probe.results[0].as_ref().unwrap_err(),
            "No acknowledgement for 'clientMessage' after 15s"
        );
    }

    #[test]
    fn failed_send_returns_callback() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn =
            ConnectionManager::new(Box::new(NullConnector), tx, ConnectionSettings::default());
        let mut d = EventDispatcher::<Probe>::new();
        let result = d.send_with_ack(
            &mut conn,
            "joinChat",
            json!({}),
            Duration::from_secs(10),
            Instant::now(),
            callback(),
        );
        let Err((err, cb)) = result else {
            panic!("send should fail while idle");
        };
        assert!(matches!(err, ChatError::NotConnected));
        let mut probe = Probe::default();
        cb(&mut probe, Err(err), Instant::now());
        assert_eq!(probe.results.len(), 1);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn ack_ids_are_unique() {
        let t0 = Instant::now();
        let mut conn = connected(t0);
        let mut d = EventDispatcher::<Probe>::new();
        let a = d
            .send_with_ack(&mut conn, "a", Value::Null, Duration::from_secs(1), t0, callback())
            .ok()
            .unwrap();
        let b = d
            .send_with_ack(&mut conn, "b", Value::Null, Duration::from_secs(2), t0, callback())
            .ok()
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(d.next_deadline(), Some(t0 + Duration::from_secs(1)));
    }
}
