//! Ordered, deduplicated message sequence for one session.
//!
//! [`MessageLedger`] is append-only: insertion order is display order, and
//! entries are only ever amended in place (an optimistic entry gaining its
//! server id). The one exception is [`MessageLedger::discard`], which rolls
//! back an optimistic entry the server refused.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{Message, Sender};

/// An optimistic entry that just received its server id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub local_id: String,
    pub id: String,
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Appended at the end. `adopted` is set when the message's conversation
    /// should become the active one (no conversation was active yet).
    Appended {
        message: Message,
        adopted: Option<String>,
    },
    /// The server echoing the local user's last send. Carries the amendment
    /// when the echo confirmed a pending entry.
    Echo(Option<Confirmation>),
    Duplicate,
    /// Belongs to a conversation other than the active one.
    Foreign,
}

pub struct MessageLedger {
    entries: Vec<Message>,
    /// Local ids of entries still waiting for a server id, oldest first.
    pending: Vec<String>,
    /// Body of the most recent local send, until its echo is seen.
    last_sent: Option<String>,
    window: Duration,
}

impl MessageLedger {
    /// `window` is the content/time duplicate window.
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            pending: Vec::new(),
            last_sent: None,
            window,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_sent(&self) -> Option<&str> {
        self.last_sent.as_deref()
    }

    pub fn clear_last_sent(&mut self) {
        self.last_sent = None;
    }

    /// Local ids still awaiting confirmation, oldest first.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Append a message typed locally and remember its text for echo
    /// suppression.
    pub fn push_optimistic(&mut self, message: Message) {
        if let Some(local_id) = &message.local_id {
            self.pending.push(local_id.clone());
        }
        self.last_sent = Some(message.body.clone());
        self.entries.push(message);
    }

    /// Append a session-only notice.
    pub fn push_system(&mut self, message: Message) {
        debug_assert_eq!(message.sender, Sender::System);
        self.entries.push(message);
    }

    /// Apply the insertion rules to a message from the network.
    pub fn admit(&mut self, mut message: Message, active: Option<&str>) -> Admission {
        let mut adopted = None;
        if let Some(conv) = message.conversation_id.as_deref() {
            match active {
                Some(active) if active != conv => return Admission::Foreign,
                Some(_) => {}
                None => adopted = Some(conv.to_string()),
            }
        }

        if self.last_sent.as_deref() == Some(message.body.as_str()) {
            self.last_sent = None;
            let confirmation = message
                .id
                .clone()
                .and_then(|id| self.confirm_by_body(&message.body, id, message.timestamp));
            return Admission::Echo(confirmation);
        }

        if self
            .entries
            .iter()
            .any(|existing| message.is_duplicate_of(existing, self.window))
        {
            return Admission::Duplicate;
        }

        message.ensure_key("msg");
        self.entries.push(message.clone());
        Admission::Appended { message, adopted }
    }

    /// Attach a server id to the optimistic entry `local_id`.
    pub fn confirm(
        &mut self,
        local_id: &str,
        id: String,
        timestamp: Option<DateTime<Utc>>,
    ) -> Option<Confirmation> {
        if self.contains_id(&id) {
            debug!(id = %id, "confirmation for an id already in the ledger");
            return None;
        }
        let index = self
            .entries
            .iter()
            .position(|m| m.local_id.as_deref() == Some(local_id))?;
        Some(self.amend(index, id, timestamp))
    }

    /// Attach a server id to the most recent still-pending entry.
    pub fn confirm_latest(
        &mut self,
        id: String,
        timestamp: Option<DateTime<Utc>>,
    ) -> Option<Confirmation> {
        let local_id = self.pending.last()?.clone();
        self.confirm(&local_id, id, timestamp)
    }

    /// Set the conversation on an optimistic entry created before one existed.
    pub fn assign_conversation(&mut self, local_id: &str, conversation_id: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|m| m.local_id.as_deref() == Some(local_id))
        {
            entry.conversation_id = Some(conversation_id.to_string());
        }
    }

    /// Remove an optimistic entry. Returns whether one was removed.
    pub fn discard(&mut self, local_id: &str) -> bool {
        self.pending.retain(|p| p != local_id);
        let before = self.entries.len();
        self.entries
            .retain(|m| m.id.is_some() || m.local_id.as_deref() != Some(local_id));
        self.entries.len() != before
    }

    /// Replace everything with the server's history.
    ///
    /// Entries without a server id get a synthetic `hist-` key. Pending
    /// optimistic entries survive unless the history already contains a
    /// client message with the same text; each history entry can absorb at
    /// most one pending entry.
    pub fn replace_history(&mut self, history: Vec<Message>) -> Vec<Message> {
        let mut unmatched: Vec<&str> = history
            .iter()
            .filter(|m| m.sender == Sender::Client)
            .map(|m| m.body.as_str())
            .collect();

        let mut survivors = Vec::new();
        for local_id in &self.pending {
            let Some(entry) = self
                .entries
                .iter()
                .find(|m| m.local_id.as_deref() == Some(local_id.as_str()))
            else {
                continue;
            };
            if let Some(pos) = unmatched.iter().position(|body| *body == entry.body) {
                unmatched.swap_remove(pos);
            } else {
                survivors.push(entry.clone());
            }
        }

        let mut entries: Vec<Message> = history
            .into_iter()
            .map(|mut m| {
                m.ensure_key("hist");
                m
            })
            .collect();
        self.pending = survivors
            .iter()
            .filter_map(|m| m.local_id.clone())
            .collect();
        entries.extend(survivors);
        self.entries = entries;
        self.entries.clone()
    }

    fn contains_id(&self, id: &str) -> bool {
        self.entries.iter().any(|m| m.id.as_deref() == Some(id))
    }

    fn confirm_by_body(
        &mut self,
        body: &str,
        id: String,
        timestamp: DateTime<Utc>,
    ) -> Option<Confirmation> {
        let local_id = self
            .pending
            .iter()
            .rev()
            .find(|local_id| {
                self.entries.iter().any(|m| {
                    m.local_id.as_deref() == Some(local_id.as_str()) && m.body == body
                })
            })?
            .clone();
        self.confirm(&local_id, id, Some(timestamp))
    }

    fn amend(
        &mut self,
        index: usize,
        id: String,
        timestamp: Option<DateTime<Utc>>,
    ) -> Confirmation {
        let entry = &mut self.entries[index];
        let local_id = entry.local_id.take().unwrap_or_default();
        entry.id = Some(id.clone());
        if let Some(ts) = timestamp {
            entry.timestamp = ts;
        }
        self.pending.retain(|p| *p != local_id);
        Confirmation { local_id, id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ledger() -> MessageLedger {
        MessageLedger::new(Duration::from_secs(3))
    }

    fn inbound(id: Option<&str>, sender: &str, body: &str, at: &str, conv: &str) -> Message {
        serde_json::from_value(json!({
            "id": id,
            "sender": sender,
            "message": body,
            "timestamp": at,
            "conversationId": conv,
        }))
        .unwrap()
    }

    #[test]
    fn same_id_twice_is_one_entry() {
        let mut l = ledger();
        let m = inbound(Some("m1"), "agent", "Hi", "2025-03-01T10:00:00Z", "c1");
        assert!(matches!(l.admit(m.clone(), Some("c1")), Admission::Appended { .. }));
        let mut later = m;
        later.timestamp = later.timestamp + chrono::Duration::minutes(5);
        assert_eq!(l.admit(later, Some("c1")), Admission::Duplicate);
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn content_duplicate_inside_window() {
        let mut l = ledger();
        let a = inbound(None, "agent", "Hi", "2025-03-01T10:00:00.000Z", "c1");
        let b = inbound(None, "agent", "Hi", "2025-03-01T10:00:01.200Z", "c1");
        assert!(matches!(l.admit(a, Some("c1")), Admission::Appended { .. }));
        assert_eq!(l.admit(b, Some("c1")), Admission::Duplicate);
        assert_eq!(l.len(), 1);
        assert!(l.messages()[0].local_id.as_deref().unwrap().starts_with("msg-"));
    }

    #[test]
    fn foreign_conversation_rejected() {
        let mut l = ledger();
        let m = inbound(Some("m1"), "agent", "Hi", "2025-03-01T10:00:00Z", "c2");
        assert_eq!(l.admit(m, Some("c1")), Admission::Foreign);
        assert!(l.is_empty());
    }

    #[test]
    fn first_conversation_is_adopted() {
        let mut l = ledger();
        let m = inbound(Some("m1"), "agent", "Hi", "2025-03-01T10:00:00Z", "c9");
        match l.admit(m, None) {
            Admission::Appended { adopted, .. } => assert_eq!(adopted.as_deref(), Some("c9")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn echo_suppressed_once_and_confirms() {
        let mut l = ledger();
        let local = Message::optimistic("M", Some("c1".into()));
        let local_id = local.local_id.clone().unwrap();
        l.push_optimistic(local);

        let echo = inbound(Some("s1"), "client", "M", "2025-03-01T10:00:00Z", "c1");
        assert_eq!(
            l.admit(echo, Some("c1")),
            Admission::Echo(Some(Confirmation {
                local_id,
                id: "s1".into()
            }))
        );
        assert_eq!(l.last_sent(), None);
        assert!(l.pending().is_empty());

        let agent = inbound(Some("s2"), "agent", "M", "2025-03-01T10:00:05Z", "c1");
        assert!(matches!(l.admit(agent, Some("c1")), Admission::Appended { .. }));
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn confirm_amends_in_place() {
        let mut l = ledger();
        l.push_optimistic(Message::optimistic("one", Some("c1".into())));
        let second = Message::optimistic("two", Some("c1".into()));
        let local_id = second.local_id.clone().unwrap();
        l.push_optimistic(second);

        let c = l.confirm(&local_id, "srv-2".into(), None).unwrap();
        assert_eq!(c.id, "srv-2");
        assert_eq!(l.messages()[1].id.as_deref(), Some("srv-2"));
        assert_eq!(l.messages()[1].local_id, None);
        assert_eq!(l.pending().len(), 1);
        // Already known id: no-op.
        assert!(l.confirm_latest("srv-2".into(), None).is_none());
    }

    #[test]
    fn confirm_latest_targets_newest_pending() {
        let mut l = ledger();
        l.push_optimistic(Message::optimistic("one", Some("c1".into())));
        l.push_optimistic(Message::optimistic("two", Some("c1".into())));
        l.confirm_latest("srv".into(), None).unwrap();
        assert_eq!(l.messages()[1].id.as_deref(), Some("srv"));
        assert!(l.messages()[0].id.is_none());
    }

    #[test]
    fn discard_rolls_back_optimistic_entry() {
        let mut l = ledger();
        let m = Message::optimistic("oops", None);
        let local_id = m.local_id.clone().unwrap();
        l.push_optimistic(m);
        assert!(l.discard(&local_id));
        assert!(l.is_empty());
        assert!(l.pending().is_empty());
        assert!(!l.discard(&local_id));
    }

    #[test]
    fn history_replaces_and_keys_entries() {
        let mut l = ledger();
        l.admit(
            inbound(Some("old"), "agent", "stale", "2025-03-01T09:00:00Z", "c1"),
            Some("c1"),
        );
        let history = vec![
            inbound(Some("h1"), "agent", "Welcome", "2025-03-01T10:00:00Z", "c1"),
            inbound(None, "client", "Thanks", "2025-03-01T10:01:00Z", "c1"),
        ];
        let snapshot = l.replace_history(history);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key(), "h1");
        assert!(snapshot[1].key().starts_with("hist-"));
    }

    #[test]
    fn history_keeps_unmatched_pending_entries() {
        let mut l = ledger();
        l.push_optimistic(Message::optimistic("Hello", Some("c1".into())));
        l.push_optimistic(Message::optimistic("Still here", Some("c1".into())));
        let history = vec![inbound(Some("h1"), "client", "Hello", "2025-03-01T10:00:00Z", "c1")];
        let snapshot = l.replace_history(history);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].body, "Still here");
        assert_eq!(l.pending().len(), 1);
    }
}
