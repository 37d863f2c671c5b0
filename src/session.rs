//! Session controller: one user, one connection, at most one active
//! conversation.
//!
//! [`SessionController`] owns the [`ConnectionManager`], the
//! [`EventDispatcher`] and the [`MessageLedger`]. It is driven by discrete
//! [`Input`]s (transport events, user intents, REST completions) and by
//! [`SessionController::poll_timers`]; each call runs to completion before the
//! next one starts. Every observable change is reported as a
//! [`SessionEvent`] for the presentation layer.
//!
//! ## Conversation protocol
//!
//! ```text
//! connect ─▶ joinChat (ack) ─▶ getUserConversations ─▶ userConversations
//!                                                     ├─ active found ─▶ adopt + getMessages
//!                                                     └─ none ─────────▶ createConversation
//! ```
//!
//! A send while no conversation is active queues the message and goes through
//! the same guarded creation path; the creation-in-flight flag makes sure only
//! one `createConversation` is ever outstanding.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::ChatApiClient;
use crate::connection::{ConnectionManager, ConnectionPhase, ConnectionSettings, TimerSignal};
use crate::dispatcher::{AckCallback, EventDispatcher};
use crate::error::{ChatError, ErrorClass};
use crate::ledger::{Admission, Confirmation, MessageLedger};
use crate::model::{Conversation, ConversationStatus, Message};
use crate::protocol::{self, packet::Packet, Reply, SendReceipt};
use crate::transport::{Connector, TransportEvent};

const AGENT_JOINED: &str = "An agent has joined the chat and will be with you shortly.";
const CHAT_ARCHIVED: &str =
    "This chat has been archived. If you need more help, please start a new chat.";

/// Something the session loop has to react to.
#[derive(Debug)]
pub enum Input {
    /// Reported by the transport opened under `generation`.
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Intent(Intent),
    /// Outcome of a REST conversation creation.
    ConversationCreated(Result<String, ChatError>),
}

/// User intents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Send(String),
    ForceReconnect,
    Shutdown,
}

/// State changes published to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(String),
    Phase(ConnectionPhase),
    ActiveConversation(Option<String>),
    Sending(bool),
    MessageAppended(Message),
    MessageConfirmed { local_id: String, id: String },
    MessageDiscarded { local_id: String },
    HistoryReplaced(Vec<Message>),
}

/// How a new conversation is requested.
#[derive(Clone)]
pub enum ConversationCreator {
    /// `createConversation` socket event with ack.
    Event,
    /// `POST /chat/start-chat`.
    Rest(ChatApiClient),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub user_id: String,
    pub office_id: Option<String>,
    pub send_ack_timeout: Duration,
    pub request_ack_timeout: Duration,
    pub duplicate_window: Duration,
    pub connection: ConnectionSettings,
}

impl SessionSettings {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            office_id: None,
            send_ack_timeout: Duration::from_secs(15),
            request_ack_timeout: Duration::from_secs(10),
            duplicate_window: Duration::from_secs(3),
            connection: ConnectionSettings::default(),
        }
    }
}

/// A message typed before any conversation existed.
struct QueuedSend {
    local_id: String,
    body: String,
}

pub struct SessionController {
    settings: SessionSettings,
    creator: ConversationCreator,
    connection: ConnectionManager,
    dispatcher: EventDispatcher<SessionController>,
    ledger: MessageLedger,
    inputs: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<SessionEvent>,
    active: Option<String>,
    /// Set while a creation is in flight and once a conversation exists;
    /// cleared on creation failure and on archive.
    conversation_requested: bool,
    queued: Vec<QueuedSend>,
    /// `clientMessage` requests still waiting for their ack or timeout.
    in_flight: usize,
    sending: bool,
    status: String,
    reported_phase: ConnectionPhase,
}

impl SessionController {
    pub fn new(
        settings: SessionSettings,
        connector: Box<dyn Connector>,
        creator: ConversationCreator,
        inputs: mpsc::UnboundedSender<Input>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let connection =
            ConnectionManager::new(connector, inputs.clone(), settings.connection.clone());
        let ledger = MessageLedger::new(settings.duplicate_window);
        Self {
            settings,
            creator,
            connection,
            dispatcher: Self::routes(),
            ledger,
            inputs,
            events,
            active: None,
            conversation_requested: false,
            queued: Vec::new(),
            in_flight: 0,
            sending: false,
            status: String::new(),
            reported_phase: ConnectionPhase::Idle,
        }
    }

    fn routes() -> EventDispatcher<SessionController> {
        let mut d = EventDispatcher::new();
        d.on(&[protocol::MESSAGE, protocol::NEW_MESSAGE], Self::on_message);
        d.on(&[protocol::MESSAGE_HISTORY], Self::on_history);
        d.on(&[protocol::MESSAGE_CONFIRMATION], Self::on_confirmation);
        d.on(&[protocol::USER_CONVERSATIONS], Self::on_conversations);
        d.on(&[protocol::AGENT_ASSIGNED], Self::on_agent_assigned);
        d.on(&[protocol::CHAT_ARCHIVED], Self::on_chat_archived);
        d.on(&[protocol::PING], Self::on_ping);
        d.on(&[protocol::ERROR], Self::on_error);
        d.on(&[protocol::MESSAGE_ERROR], Self::on_message_error);
        d
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn phase(&self) -> ConnectionPhase {
        self.connection.phase()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection.connection_id()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.connection.reconnect_attempt()
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        self.ledger.messages()
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Earliest timer deadline across reconnect, heartbeat and pending acks.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.connection.next_deadline(), self.dispatcher.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ─── Driving ────────────────────────────────────────────────────────────

    /// Open the first connection.
    pub fn start(&mut self) {
        self.set_status("Connecting to chat...");
        self.connection.connect();
        self.sync_phase();
    }

    /// React to one input. `Break` once the session has shut down.
    pub fn handle_input(&mut self, input: Input, now: Instant) -> ControlFlow<()> {
        match input {
            Input::Transport { generation, event } => {
                if self.connection.is_current(generation) {
                    self.on_transport(event, now);
                } else {
                    debug!(generation, "dropping event from stale transport");
                }
            }
            Input::Intent(Intent::Send(text)) => self.send_message(&text, now),
            Input::Intent(Intent::ForceReconnect) => self.force_reconnect(),
            Input::Intent(Intent::Shutdown) => {
                info!("Session shutting down");
                self.connection.shutdown();
                self.sync_phase();
                return ControlFlow::Break(());
            }
            Input::ConversationCreated(result) => self.on_conversation_created(result, now),
        }
        ControlFlow::Continue(())
    }

    /// Fire due timers: reconnect ticks, heartbeat, ack timeouts.
    pub fn poll_timers(&mut self, now: Instant) {
        for signal in self.connection.poll_timers(now) {
            match signal {
                TimerSignal::Retrying { attempt, max } => {
                    self.set_status(&format!("Reconnecting ({attempt}/{max})..."));
                }
                TimerSignal::GaveUp { max } => {
                    self.set_status(&format!(
                        "Could not reconnect after {max} attempts. Reconnect manually to try again."
                    ));
                }
                TimerSignal::Heartbeat => self.check_connection(now),
            }
        }
        self.sync_phase();

        for pending in self.dispatcher.take_expired(now) {
            warn!(event = pending.event, "acknowledgement timed out");
            pending.expire(self, now);
        }
    }

    // ─── Connection lifecycle ───────────────────────────────────────────────

    fn on_transport(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Connected { sid, kind } => {
                debug!(transport = kind.as_str(), "transport up");
                self.on_connect(sid, now);
            }
            TransportEvent::ConnectError(message) => {
                warn!("Connection error: {message}");
                self.connection.on_transport_failure(now);
                self.set_status(&format!("Connection error: {message}. Retrying..."));
                self.report_exhausted();
                self.sync_phase();
            }
            TransportEvent::Disconnected(reason) => {
                warn!("Disconnected: {reason}");
                self.connection.on_transport_failure(now);
                self.set_status(&format!("Disconnected: {reason}. Retrying..."));
                self.report_exhausted();
                self.sync_phase();
            }
            TransportEvent::Packet(packet) => self.on_packet(packet, now),
        }
    }

    fn on_connect(&mut self, sid: String, now: Instant) {
        self.connection.on_connected(sid, now);
        self.set_status("Connected");
        self.sync_phase();

        let payload = self.user_payload();
        self.request(
            protocol::JOIN_CHAT,
            payload,
            self.settings.request_ack_timeout,
            now,
            Box::new(Self::on_join_reply),
        );
        self.check_connection(now);
    }

    fn force_reconnect(&mut self) {
        self.set_status("Reconnecting...");
        self.connection.force_reconnect();
        self.sync_phase();
    }

    fn report_exhausted(&mut self) {
        if self.connection.phase() == ConnectionPhase::Failed {
            let max = self.connection.max_reconnect_attempts();
            self.set_status(&format!(
                "Could not reconnect after {max} attempts. Reconnect manually to try again."
            ));
        }
    }

    /// Liveness probe. The answer is only logged.
    fn check_connection(&mut self, now: Instant) {
        self.request(
            protocol::CHECK_CONNECTION,
            Value::Null,
            self.settings.request_ack_timeout,
            now,
            Box::new(|_: &mut Self, result: Result<Value, ChatError>, _: Instant| match result {
                Ok(status) => debug!(%status, "connection check"),
                Err(e) => debug!("connection check failed: {e}"),
            }),
        );
    }

    fn on_join_reply(&mut self, result: Result<Value, ChatError>, _now: Instant) {
        // Some servers ack joinChat with nothing; only an explicit failure counts.
        let joined = result.and_then(|data| match data {
            Value::Object(_) if data.get("success") == Some(&Value::Bool(false)) => {
                Reply::parse(protocol::JOIN_CHAT, data)?.into_data()
            }
            other => Ok(other),
        });
        match joined {
            Ok(_) => {
                debug!("joined chat");
                self.request_conversations();
            }
            Err(e) if e.is_timeout() => {
                warn!("{e}; requesting conversations anyway");
                self.request_conversations();
            }
            Err(e) => {
                warn!("joinChat failed: {e}");
                self.set_status(&format!("Could not join chat: {e}"));
            }
        }
    }

    fn request_conversations(&mut self) {
        let payload = self.user_payload();
        self.emit_event(protocol::GET_USER_CONVERSATIONS, payload);
    }

    fn on_packet(&mut self, packet: Packet, now: Instant) {
        match packet {
            Packet::Event { name, data, ack } => {
                if ack.is_some() {
                    debug!(event = %name, "server requested an ack; not supported");
                }
                match self.dispatcher.handler(&name) {
                    Some(handler) => handler(self, data, now),
                    None => debug!(event = %name, "unhandled event"),
                }
            }
            Packet::Ack { id, data } => {
                if let Some(pending) = self.dispatcher.take_ack(id) {
                    pending.resolve(self, data, now);
                }
            }
            Packet::ConnectError(data) => self.on_transport(
                TransportEvent::ConnectError(protocol::notice_text(&data)),
                now,
            ),
            Packet::Disconnect => self.on_transport(
                TransportEvent::Disconnected("io server disconnect".into()),
                now,
            ),
            Packet::Connect(_) => {}
        }
    }

    // ─── Conversations ──────────────────────────────────────────────────────

    fn on_conversations(&mut self, data: Value, now: Instant) {
        let conversations: Vec<Conversation> = if data.is_null() {
            Vec::new()
        } else {
            match protocol::decode(protocol::USER_CONVERSATIONS, data) {
                Ok(list) => list,
                Err(e) => {
                    warn!("{e}");
                    return;
                }
            }
        };

        let first_active = conversations
            .into_iter()
            .find(|c| c.status == ConversationStatus::Active);

        match (first_active, self.active.clone()) {
            (Some(conv), None) => {
                info!(conversation = %conv.id, "Resuming active conversation");
                self.activate(conv.id, now);
            }
            (Some(conv), Some(current)) if conv.id == current => {
                self.emit_event(
                    protocol::GET_MESSAGES,
                    protocol::get_messages_payload(&current),
                );
            }
            (Some(conv), Some(current)) => {
                debug!(listed = %conv.id, current = %current, "keeping current conversation");
            }
            (None, None) => self.ensure_conversation(now),
            (None, Some(_)) => {}
        }
    }

    /// Request a conversation unless one exists or is already being created.
    fn ensure_conversation(&mut self, now: Instant) {
        if self.active.is_some() || self.conversation_requested {
            debug!("conversation already active or requested");
            return;
        }
        self.conversation_requested = true;
        info!("Creating conversation");

        match self.creator.clone() {
            ConversationCreator::Event => {
                let payload = self.user_payload();
                self.request(
                    protocol::CREATE_CONVERSATION,
                    payload,
                    self.settings.request_ack_timeout,
                    now,
                    Box::new(|s: &mut Self, result: Result<Value, ChatError>, now: Instant| {
                        let created = result.and_then(|data| {
                            let data =
                                Reply::parse(protocol::CREATE_CONVERSATION, data)?.into_data()?;
                            protocol::conversation_id(&data)
                        });
                        s.on_conversation_created(created, now);
                    }),
                );
            }
            ConversationCreator::Rest(client) => {
                let inputs = self.inputs.clone();
                let user_id = self.settings.user_id.clone();
                tokio::spawn(async move {
                    let result = client.start_chat(&user_id).await;
                    let _ = inputs.send(Input::ConversationCreated(result));
                });
            }
        }
    }

    fn on_conversation_created(&mut self, result: Result<String, ChatError>, now: Instant) {
        match result {
            Ok(id) => {
                match self.active.as_deref() {
                    None => {
                        info!(conversation = %id, "Conversation created");
                        self.activate(id, now);
                    }
                    Some(current) if current == id => {}
                    Some(current) => {
                        warn!(created = %id, current = %current, "conversation created after another was adopted");
                    }
                }
                self.flush_queue(now);
            }
            Err(e) if self.active.is_some() => {
                debug!("creation failed after a conversation was adopted: {e}");
                self.flush_queue(now);
            }
            Err(e) => {
                warn!("Conversation creation failed: {e}");
                self.conversation_requested = false;
                for queued in std::mem::take(&mut self.queued) {
                    self.roll_back(&queued.local_id);
                }
                self.ledger.clear_last_sent();
                self.set_status(&format!("Could not start a conversation: {e}"));
            }
        }
    }

    /// Make `id` the active conversation, fetch its history and forward
    /// anything typed while no conversation existed.
    fn activate(&mut self, id: String, now: Instant) {
        self.conversation_requested = true;
        self.emit_event(protocol::GET_MESSAGES, protocol::get_messages_payload(&id));
        self.active = Some(id.clone());
        self.emit(SessionEvent::ActiveConversation(Some(id)));
        self.flush_queue(now);
    }

    fn on_agent_assigned(&mut self, data: Value, now: Instant) {
        let assigned: protocol::AgentAssigned = match protocol::decode(protocol::AGENT_ASSIGNED, data)
        {
            Ok(a) => a,
            Err(e) => {
                warn!("{e}");
                return;
            }
        };
        match self.active.as_deref() {
            Some(current) if current == assigned.conversation_id => {}
            Some(current) => {
                debug!(event = %assigned.conversation_id, current = %current, "agent assigned elsewhere");
                return;
            }
            None => self.activate(assigned.conversation_id.clone(), now),
        }
        info!(agent = ?assigned.agent_id, "Agent assigned");
        self.push_system(AGENT_JOINED, assigned.conversation_id);
    }

    fn on_chat_archived(&mut self, data: Value, _now: Instant) {
        let archived: protocol::ChatArchived = match protocol::decode(protocol::CHAT_ARCHIVED, data) {
            Ok(a) => a,
            Err(e) => {
                warn!("{e}");
                return;
            }
        };
        if self.active.as_deref() != Some(archived.conversation_id.as_str()) {
            debug!(conversation = %archived.conversation_id, "archive for inactive conversation");
            return;
        }
        info!(conversation = %archived.conversation_id, "Conversation archived");
        self.push_system(CHAT_ARCHIVED, archived.conversation_id);
        self.active = None;
        self.conversation_requested = false;
        self.emit(SessionEvent::ActiveConversation(None));
    }

    // ─── Messages ───────────────────────────────────────────────────────────

    fn send_message(&mut self, text: &str, now: Instant) {
        let body = text.trim();
        if body.is_empty() {
            return;
        }
        if self.connection.phase() != ConnectionPhase::Connected {
            self.set_status("Not connected. Message not sent.");
            return;
        }

        let message = Message::optimistic(body, self.active.clone());
        let local_id = message.key().to_string();
        self.ledger.push_optimistic(message.clone());
        self.emit(SessionEvent::MessageAppended(message));

        match self.active.clone() {
            Some(conversation) => self.deliver(local_id, body.to_string(), &conversation, now),
            None => {
                self.queued.push(QueuedSend {
                    local_id,
                    body: body.to_string(),
                });
                self.ensure_conversation(now);
            }
        }
    }

    /// Forward messages queued while the conversation was being created.
    fn flush_queue(&mut self, now: Instant) {
        let Some(conversation) = self.active.clone() else {
            return;
        };
        for queued in std::mem::take(&mut self.queued) {
            self.ledger.assign_conversation(&queued.local_id, &conversation);
            self.deliver(queued.local_id, queued.body, &conversation, now);
        }
    }

    fn deliver(&mut self, local_id: String, body: String, conversation: &str, now: Instant) {
        self.in_flight += 1;
        self.sync_sending();
        let payload =
            protocol::client_message_payload(&self.settings.user_id, &body, conversation);
        self.request(
            protocol::CLIENT_MESSAGE,
            payload,
            self.settings.send_ack_timeout,
            now,
            Box::new(move |s: &mut Self, result: Result<Value, ChatError>, _: Instant| {
                s.on_send_reply(&local_id, result);
            }),
        );
    }

    fn on_send_reply(&mut self, local_id: &str, result: Result<Value, ChatError>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.sync_sending();
        let receipt = result.and_then(|data| {
            let data = Reply::parse(protocol::CLIENT_MESSAGE, data)?.into_data()?;
            SendReceipt::from_data(&data)
        });
        match receipt {
            Ok(receipt) => {
                if let Some(c) = self
                    .ledger
                    .confirm(local_id, receipt.message_id, receipt.timestamp)
                {
                    self.emit_confirmed(c);
                }
            }
            Err(e) if e.class() == ErrorClass::Timeout => {
                warn!("{e}");
                self.set_status("Message not confirmed by the server yet. It may not have been delivered.");
            }
            Err(e) => {
                warn!("Message rejected: {e}");
                self.roll_back(local_id);
                self.ledger.clear_last_sent();
                self.set_status(&format!("Message not sent: {e}"));
            }
        }
    }

    fn on_message(&mut self, data: Value, now: Instant) {
        let message: Message = match protocol::decode(protocol::MESSAGE, data) {
            Ok(m) => m,
            Err(e) => {
                warn!("{e}");
                return;
            }
        };
        match self.ledger.admit(message, self.active.as_deref()) {
            Admission::Appended { message, adopted } => {
                if let Some(conversation) = adopted {
                    info!(conversation = %conversation, "Adopting conversation from inbound message");
                    self.activate(conversation, now);
                }
                self.emit(SessionEvent::MessageAppended(message));
            }
            Admission::Echo(confirmation) => {
                debug!("suppressed echo of last sent message");
                if let Some(c) = confirmation {
                    self.emit_confirmed(c);
                }
            }
            Admission::Duplicate => debug!("dropped duplicate message"),
            Admission::Foreign => debug!("dropped message for another conversation"),
        }
    }

    fn on_history(&mut self, data: Value, _now: Instant) {
        let history: Vec<Message> = if data.is_null() {
            Vec::new()
        } else {
            match protocol::decode(protocol::MESSAGE_HISTORY, data) {
                Ok(h) => h,
                Err(e) => {
                    warn!("{e}");
                    return;
                }
            }
        };
        if let Some(active) = self.active.as_deref() {
            let stale = history
                .iter()
                .filter_map(|m| m.conversation_id.as_deref())
                .any(|c| c != active);
            if stale {
                debug!("ignoring history for another conversation");
                return;
            }
        }
        debug!(count = history.len(), "history received");
        let snapshot = self.ledger.replace_history(history);
        self.emit(SessionEvent::HistoryReplaced(snapshot));
    }

    fn on_confirmation(&mut self, data: Value, _now: Instant) {
        let receipt = Reply::parse(protocol::MESSAGE_CONFIRMATION, data)
            .and_then(Reply::into_data)
            .and_then(|data| SendReceipt::from_data(&data));
        match receipt {
            Ok(receipt) => {
                if let Some(c) = self
                    .ledger
                    .confirm_latest(receipt.message_id, receipt.timestamp)
                {
                    self.emit_confirmed(c);
                }
            }
            Err(e) => debug!("confirmation ignored: {e}"),
        }
    }

    fn on_ping(&mut self, _data: Value, _now: Instant) {
        self.emit_event(protocol::PONG, Value::Null);
    }

    fn on_error(&mut self, data: Value, _now: Instant) {
        let text = protocol::notice_text(&data);
        warn!("Socket error: {text}");
        self.set_status(&format!("Socket error: {text}"));
    }

    fn on_message_error(&mut self, data: Value, _now: Instant) {
        let text = protocol::notice_text(&data);
        warn!("Message error: {text}");
        self.set_status(&format!("Message error: {text}"));
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    fn user_payload(&self) -> Value {
        protocol::user_payload(&self.settings.user_id, self.settings.office_id.as_deref())
    }

    /// Send with ack; if the send itself fails the callback runs right away.
    fn request(
        &mut self,
        event: &'static str,
        payload: Value,
        timeout: Duration,
        now: Instant,
        callback: AckCallback<Self>,
    ) {
        if let Err((e, callback)) =
            self.dispatcher
                .send_with_ack(&mut self.connection, event, payload, timeout, now, callback)
        {
            debug!(event, "request not sent: {e}");
            callback(self, Err(e), now);
        }
    }

    /// Fire-and-forget event.
    fn emit_event(&mut self, event: &'static str, payload: Value) {
        if let Err(e) = self.connection.send(Packet::event(event, payload)) {
            debug!(event, "event not sent: {e}");
        }
    }

    fn push_system(&mut self, text: &str, conversation: String) {
        let message = Message::system(text, Some(conversation));
        self.ledger.push_system(message.clone());
        self.emit(SessionEvent::MessageAppended(message));
    }

    fn roll_back(&mut self, local_id: &str) {
        if self.ledger.discard(local_id) {
            self.emit(SessionEvent::MessageDiscarded {
                local_id: local_id.to_string(),
            });
        }
    }

    fn emit_confirmed(&mut self, c: Confirmation) {
        self.emit(SessionEvent::MessageConfirmed {
            local_id: c.local_id,
            id: c.id,
        });
    }

    fn set_status(&mut self, text: &str) {
        info!("{text}");
        self.status = text.to_string();
        self.emit(SessionEvent::Status(self.status.clone()));
    }

    /// The indicator stays on while any send awaits its ack or timeout.
    fn sync_sending(&mut self) {
        let sending = self.in_flight > 0;
        if self.sending != sending {
            self.sending = sending;
            self.emit(SessionEvent::Sending(sending));
        }
    }

    fn sync_phase(&mut self) {
        let phase = self.connection.phase();
        if phase != self.reported_phase {
            self.reported_phase = phase;
            debug!(phase = phase.as_str(), "connection phase changed");
            self.emit(SessionEvent::Phase(phase));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // The presentation layer may have gone away; the session keeps running.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    use crate::transport::{EventSink, Transport};

    struct Recorder(Arc<Mutex<Vec<Packet>>>);

    impl Transport for Recorder {
        fn send(&mut self, packet: Packet) -> Result<(), ChatError> {
            self.0.lock().unwrap().push(packet);
            Ok(())
        }
        fn close(&mut self) {}
    }

    struct RecordingConnector(Arc<Mutex<Vec<Packet>>>);

    impl Connector for RecordingConnector {
        fn open(&mut self, _sink: EventSink) -> Box<dyn Transport> {
            Box::new(Recorder(self.0.clone()))
        }
    }

    fn session() -> (SessionController, Arc<Mutex<Vec<Packet>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (in_tx, _in_rx) = mpsc::unbounded_channel();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let mut s = SessionController::new(
            SessionSettings::new("u1"),
            Box::new(RecordingConnector(sent.clone())),
            ConversationCreator::Event,
            in_tx,
            ev_tx,
        );
        s.start();
        (s, sent)
    }

    fn transport(s: &mut SessionController, event: TransportEvent, now: Instant) {
        let generation = s.connection.generation();
        let _ = s.handle_input(Input::Transport { generation, event }, now);
    }

    fn names(sent: &Arc<Mutex<Vec<Packet>>>) -> Vec<String> {
        sent.lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.event_name().map(String::from))
            .collect()
    }

    #[test]
    fn connect_joins_and_checks() {
        let (mut s, sent) = session();
        let now = Instant::now();
        transport(
            &mut s,
            TransportEvent::Connected {
                sid: "abc".into(),
                kind: crate::transport::TransportKind::WebSocket,
            },
            now,
        );
        assert_eq!(s.phase(), ConnectionPhase::Connected);
        assert_eq!(s.connection_id(), Some("abc"));
        assert_eq!(names(&sent), vec!["joinChat", "checkConnection"]);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let (mut s, _sent) = session();
        let now = Instant::now();
        let _ = s.handle_input(
            Input::Transport {
                generation: 99,
                event: TransportEvent::Connected {
                    sid: "x".into(),
                    kind: crate::transport::TransportKind::Polling,
                },
            },
            now,
        );
        assert_eq!(s.phase(), ConnectionPhase::Connecting);
    }

    #[test]
    fn ping_answered_with_pong() {
        let (mut s, sent) = session();
        let now = Instant::now();
        transport(
            &mut s,
            TransportEvent::Connected {
                sid: "abc".into(),
                kind: crate::transport::TransportKind::WebSocket,
            },
            now,
        );
        transport(
            &mut s,
            TransportEvent::Packet(Packet::event("ping", Value::Null)),
            now,
        );
        assert_eq!(names(&sent).last().map(String::as_str), Some("pong"));
    }

    #[test]
    fn send_while_disconnected_is_refused() {
        let (mut s, sent) = session();
        let _ = s.handle_input(Input::Intent(Intent::Send("hi".into())), Instant::now());
        assert!(s.messages().is_empty());
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(s.status(), "Not connected. Message not sent.");
    }

    #[test]
    fn shutdown_breaks_loop() {
        let (mut s, _sent) = session();
        let flow = s.handle_input(Input::Intent(Intent::Shutdown), Instant::now());
        assert!(flow.is_break());
        assert_eq!(s.phase(), ConnectionPhase::Idle);
    }

    #[test]
    fn error_event_sets_status() {
        let (mut s, _sent) = session();
        let now = Instant::now();
        transport(
            &mut s,
            TransportEvent::Connected {
                sid: "abc".into(),
                kind: crate::transport::TransportKind::WebSocket,
            },
            now,
        );
        transport(
            &mut s,
            TransportEvent::Packet(Packet::event("error", json!({"message": "boom"}))),
            now,
        );
        assert_eq!(s.status(), "Socket error: boom");
    }

    fn join_ack(s: &mut SessionController, sent: &Arc<Mutex<Vec<Packet>>>, data: Value) {
        let id = sent
            .lock()
            .unwrap()
            .iter()
            .find_map(|p| match p {
                Packet::Event { name, ack, .. } if name == protocol::JOIN_CHAT => *ack,
                _ => None,
            })
            .unwrap();
        transport(s, TransportEvent::Packet(Packet::Ack { id, data }), Instant::now());
    }

    fn connected() -> (SessionController, Arc<Mutex<Vec<Packet>>>) {
        let (mut s, sent) = session();
        transport(
            &mut s,
            TransportEvent::Connected {
                sid: "abc".into(),
                kind: crate::transport::TransportKind::WebSocket,
            },
            Instant::now(),
        );
        (s, sent)
    }

    #[test]
    fn bare_join_ack_counts_as_joined() {
        let (mut s, sent) = connected();
        join_ack(&mut s, &sent, Value::Null);
        assert_eq!(names(&sent).last().map(String::as_str), Some("getUserConversations"));
    }

    #[test]
    fn rejected_join_sets_status() {
        let (mut s, sent) = connected();
        join_ack(&mut s, &sent, json!({"success": false, "message": "banned"}));
        assert_eq!(s.status(), "Could not join chat: banned");
        assert!(!names(&sent).iter().any(|n| n == "getUserConversations"));
    }
}
