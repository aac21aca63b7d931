//! At-least-once fan-out for rooms hosted on this node.
//!
//! Each chat message is tracked until every recipient has acknowledged it.
//! The server does not keep enough to retransmit on its own; an overdue
//! message makes it ask the original sender for a resend instead.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::protocol::{ClientId, Message, MessageId};

#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub message_id: MessageId,
    pub sender: ClientId,
    pub room: String,
    pub awaiting: BTreeSet<ClientId>,
    pub payload: Message,
    pub created_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub struct FanOut {
    pub recipients: Vec<ClientId>,
    /// Nobody else is in the room; confirm to the sender right away.
    pub delivered: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Unknown,
    Waiting(usize),
    Complete { sender: ClientId },
}

#[derive(Debug, Default)]
pub struct DeliveryTracker {
    pending: HashMap<MessageId, PendingDelivery>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chat message and return who it must go to. A message id
    /// that is already pending is a sender retransmission: only members
    /// still awaiting it get another copy, and its deadline is re-armed.
    pub fn on_chat_message(
        &mut self,
        message_id: &str,
        sender: &str,
        room: &str,
        payload: Message,
        members: &BTreeSet<ClientId>,
        now: Instant,
    ) -> FanOut {
        if let Some(entry) = self.pending.get_mut(message_id) {
            entry.created_at = now;
            debug!("retransmission of {} to {} member(s)", message_id, entry.awaiting.len());
            return FanOut { recipients: entry.awaiting.iter().cloned().collect(), delivered: false };
        }

        let awaiting: BTreeSet<ClientId> = members.iter().filter(|m| m.as_str() != sender).cloned().collect();
        if awaiting.is_empty() {
            return FanOut { recipients: Vec::new(), delivered: true };
        }

        let recipients = awaiting.iter().cloned().collect();
        self.pending.insert(
            message_id.to_string(),
            PendingDelivery {
                message_id: message_id.to_string(),
                sender: sender.to_string(),
                room: room.to_string(),
                awaiting,
                payload,
                created_at: now,
            },
        );
        FanOut { recipients, delivered: false }
    }

    pub fn on_ack(&mut self, message_id: &str, client: &str) -> AckOutcome {
        let Some(entry) = self.pending.get_mut(message_id) else {
            return AckOutcome::Unknown;
        };
        entry.awaiting.remove(client);
        if !entry.awaiting.is_empty() {
            return AckOutcome::Waiting(entry.awaiting.len());
        }
        // awaiting is empty, so the entry goes
        let done = self.pending.remove(message_id).map(|e| e.sender).unwrap_or_default();
        info!("message {} delivered to every member", message_id);
        AckOutcome::Complete { sender: done }
    }

    /// (message id, sender) for every entry older than `ack_timeout`. Their
    /// clocks restart so each one fires at most once per timeout.
    pub fn sweep(&mut self, now: Instant, ack_timeout: Duration) -> Vec<(MessageId, ClientId)> {
        let mut overdue = Vec::new();
        for entry in self.pending.values_mut() {
            if now.saturating_duration_since(entry.created_at) > ack_timeout {
                entry.created_at = now;
                overdue.push((entry.message_id.clone(), entry.sender.clone()));
            }
        }
        overdue.sort();
        overdue
    }

    pub fn get(&self, message_id: &str) -> Option<&PendingDelivery> {
        self.pending.get(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACK_TIMEOUT: Duration = Duration::from_secs(5);

    fn members(names: &[&str]) -> BTreeSet<ClientId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn chat(id: &str) -> Message {
        Message::ChatMsg {
            message_id: id.into(),
            from: "A".into(),
            room: "r".into(),
            body: "hello".into(),
        }
    }

    #[test]
    fn fans_out_to_everyone_but_sender_and_completes_on_all_acks() {
        let now = Instant::now();
        let mut t = DeliveryTracker::new();
        let fan = t.on_chat_message("m1", "A", "r", chat("m1"), &members(&["A", "B", "C"]), now);
        assert_eq!(fan.recipients, vec!["B".to_string(), "C".to_string()]);
        assert!(!fan.delivered);

        assert_eq!(t.on_ack("m1", "B"), AckOutcome::Waiting(1));
        assert_eq!(t.on_ack("m1", "B"), AckOutcome::Waiting(1));
        assert_eq!(t.on_ack("m1", "C"), AckOutcome::Complete { sender: "A".into() });
        assert!(t.get("m1").is_none());
        assert_eq!(t.on_ack("m1", "C"), AckOutcome::Unknown);
    }

    #[test]
    fn lone_sender_is_confirmed_immediately() {
        let mut t = DeliveryTracker::new();
        let fan = t.on_chat_message("m1", "A", "r", chat("m1"), &members(&["A"]), Instant::now());
        assert!(fan.delivered);
        assert!(t.is_empty());
    }

    #[test]
    fn sweep_requests_resend_once_per_timeout() {
        let t0 = Instant::now();
        let mut t = DeliveryTracker::new();
        t.on_chat_message("m1", "A", "r", chat("m1"), &members(&["A", "B", "C"]), t0);
        t.on_ack("m1", "C");

        assert!(t.sweep(t0 + Duration::from_secs(5), ACK_TIMEOUT).is_empty());
        let due = t.sweep(t0 + Duration::from_secs(6), ACK_TIMEOUT);
        assert_eq!(due, vec![("m1".to_string(), "A".to_string())]);
        assert!(t.sweep(t0 + Duration::from_secs(7), ACK_TIMEOUT).is_empty());
        assert_eq!(t.sweep(t0 + Duration::from_secs(12), ACK_TIMEOUT).len(), 1);
        assert_eq!(t.get("m1").unwrap().awaiting, members(&["B"]));
    }

    #[test]
    fn retransmission_only_reaches_members_still_awaiting() {
        let t0 = Instant::now();
        let mut t = DeliveryTracker::new();
        t.on_chat_message("m1", "A", "r", chat("m1"), &members(&["A", "B", "C"]), t0);
        t.on_ack("m1", "C");

        let later = t0 + Duration::from_secs(6);
        let fan = t.on_chat_message("m1", "A", "r", chat("m1"), &members(&["A", "B", "C"]), later);
        assert_eq!(fan.recipients, vec!["B".to_string()]);
        assert_eq!(t.get("m1").unwrap().created_at, later);
        assert_eq!(t.len(), 1);
    }
}
