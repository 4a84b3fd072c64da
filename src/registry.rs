//! Connection and subscription bookkeeping.
//!
//! Each connection owns a bounded outbound queue; the websocket layer
//! forwards queued frames to the socket. Live fan-out walks every
//! subscription while holding the registry lock, so concurrent broadcasts
//! are serialized and every subscriber observes accepted events in the
//! same order.
//!
//! A fresh subscription starts in a replay phase: live events that arrive
//! while stored history is still being sent are buffered on the
//! subscription and flushed, deduplicated against the replayed ids, when
//! the replay finishes. A subscriber therefore never sees a live event
//! before a stored one, and never sees the same event twice.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use crate::event::Event;
use crate::filter::Filter;

enum Phase {
    Replaying { pending: Vec<Event> },
    Live,
}

struct SubState {
    filters: Vec<Filter>,
    phase: Phase,
}

struct ConnSubs {
    tx: mpsc::Sender<Message>,
    subs: HashMap<String, SubState>,
}

/// Outcome of handing an event to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Buffered,
    Dropped,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    conns: Mutex<HashMap<u64, ConnSubs>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection and its outbound queue.
    pub fn register_connection(&self, conn: u64, tx: mpsc::Sender<Message>) {
        let mut conns = self.conns.lock().unwrap();
        conns.insert(
            conn,
            ConnSubs {
                tx,
                subs: HashMap::new(),
            },
        );
    }

    /// Drop a connection and all of its subscriptions.
    pub fn remove_connection(&self, conn: u64) {
        self.conns.lock().unwrap().remove(&conn);
    }

    /// Install a subscription in the replay phase. Reusing an id on the same
    /// connection atomically replaces the old subscription; returns whether a
    /// previous one was replaced.
    pub fn subscribe(&self, conn: u64, sub_id: &str, filters: Vec<Filter>) -> bool {
        let mut conns = self.conns.lock().unwrap();
        match conns.get_mut(&conn) {
            Some(c) => c
                .subs
                .insert(
                    sub_id.to_string(),
                    SubState {
                        filters,
                        phase: Phase::Replaying { pending: vec![] },
                    },
                )
                .is_some(),
            None => false,
        }
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, conn: u64, sub_id: &str) -> bool {
        let mut conns = self.conns.lock().unwrap();
        conns
            .get_mut(&conn)
            .map(|c| c.subs.remove(sub_id).is_some())
            .unwrap_or(false)
    }

    /// Fan an accepted event out to every matching subscription except those
    /// on `skip_conn` (the publisher). Replaying subscriptions buffer the
    /// event instead of sending it. Returns per-delivery outcomes for
    /// accounting.
    pub fn deliver(&self, event: &Event, skip_conn: Option<u64>) -> Vec<Delivery> {
        let mut outcomes = vec![];
        let mut conns = self.conns.lock().unwrap();
        for (id, conn) in conns.iter_mut() {
            if Some(*id) == skip_conn {
                continue;
            }
            for (sub_id, sub) in conn.subs.iter_mut() {
                if !sub.filters.iter().any(|f| f.matches(event)) {
                    continue;
                }
                match &mut sub.phase {
                    Phase::Replaying { pending } => {
                        pending.push(event.clone());
                        outcomes.push(Delivery::Buffered);
                    }
                    Phase::Live => {
                        outcomes.push(send_event(&conn.tx, sub_id, event));
                    }
                }
            }
        }
        outcomes
    }

    /// Move a subscription from replay to live, flushing any events buffered
    /// during replay. Events whose ids appear in `already_sent` were part of
    /// the replay and are skipped. Returns outcomes for the flushed events.
    pub fn finish_replay(
        &self,
        conn: u64,
        sub_id: &str,
        already_sent: &HashSet<String>,
    ) -> Vec<Delivery> {
        let mut outcomes = vec![];
        let mut conns = self.conns.lock().unwrap();
        let Some(c) = conns.get_mut(&conn) else {
            return outcomes;
        };
        let Some(sub) = c.subs.get_mut(sub_id) else {
            return outcomes;
        };
        if let Phase::Replaying { pending } = std::mem::replace(&mut sub.phase, Phase::Live) {
            for ev in pending {
                if already_sent.contains(&ev.id) {
                    continue;
                }
                outcomes.push(send_event(&c.tx, sub_id, &ev));
            }
        }
        outcomes
    }

    /// Number of active subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.conns.lock().unwrap().values().map(|c| c.subs.len()).sum()
    }

    /// Number of subscriptions on one connection.
    pub fn subscription_count_for(&self, conn: u64) -> usize {
        self.conns
            .lock()
            .unwrap()
            .get(&conn)
            .map(|c| c.subs.len())
            .unwrap_or(0)
    }
}

/// Queue an EVENT frame without blocking. A full queue drops this delivery
/// rather than stalling the broadcast.
fn send_event(tx: &mpsc::Sender<Message>, sub_id: &str, event: &Event) -> Delivery {
    let frame = serde_json::json!(["EVENT", sub_id, event]).to_string();
    match tx.try_send(Message::Text(frame.into())) {
        Ok(()) => Delivery::Sent,
        Err(_) => Delivery::Dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn sample_event(id: &str, kind: u32) -> Event {
        Event {
            id: id.into(),
            pubkey: "p1".into(),
            kind,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn kind_filter(kind: u32) -> Filter {
        Filter::from_value(&serde_json::json!({ "kinds": [kind] }))
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn live_subscription_receives_matching_events() {
        let reg = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        reg.register_connection(1, tx);
        reg.subscribe(1, "s1", vec![kind_filter(1)]);
        reg.finish_replay(1, "s1", &HashSet::new());

        let outcomes = reg.deliver(&sample_event("aa", 1), None);
        assert_eq!(outcomes, vec![Delivery::Sent]);
        let frame = text_of(rx.recv().await.unwrap());
        assert!(frame.starts_with("[\"EVENT\",\"s1\","));

        // Non-matching kind produces nothing.
        assert!(reg.deliver(&sample_event("bb", 2), None).is_empty());
    }

    #[tokio::test]
    async fn publisher_connection_is_skipped() {
        let reg = SubscriptionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        reg.register_connection(1, tx1);
        reg.register_connection(2, tx2);
        for conn in [1, 2] {
            reg.subscribe(conn, "s", vec![kind_filter(1)]);
            reg.finish_replay(conn, "s", &HashSet::new());
        }
        let outcomes = reg.deliver(&sample_event("aa", 1), Some(1));
        assert_eq!(outcomes, vec![Delivery::Sent]);
        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn replay_buffers_then_flushes_without_duplicates() {
        let reg = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        reg.register_connection(1, tx);
        reg.subscribe(1, "s1", vec![kind_filter(1)]);

        // Events arriving during replay are buffered, not sent.
        let outcomes = reg.deliver(&sample_event("aa", 1), None);
        assert_eq!(outcomes, vec![Delivery::Buffered]);
        let outcomes = reg.deliver(&sample_event("bb", 1), None);
        assert_eq!(outcomes, vec![Delivery::Buffered]);
        assert!(rx.try_recv().is_err());

        // "aa" was part of the replay, so only "bb" is flushed.
        let sent: HashSet<String> = ["aa".to_string()].into();
        let outcomes = reg.finish_replay(1, "s1", &sent);
        assert_eq!(outcomes, vec![Delivery::Sent]);
        let frame = text_of(rx.recv().await.unwrap());
        assert!(frame.contains("\"bb\""));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribing_replaces_filters() {
        let reg = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        reg.register_connection(1, tx);
        reg.subscribe(1, "s1", vec![kind_filter(1)]);
        reg.finish_replay(1, "s1", &HashSet::new());

        reg.subscribe(1, "s1", vec![kind_filter(2)]);
        reg.finish_replay(1, "s1", &HashSet::new());
        assert_eq!(reg.subscription_count_for(1), 1);

        // Old filter no longer applies.
        assert!(reg.deliver(&sample_event("aa", 1), None).is_empty());
        let outcomes = reg.deliver(&sample_event("bb", 2), None);
        assert_eq!(outcomes, vec![Delivery::Sent]);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn full_queue_drops_delivery() {
        let reg = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        reg.register_connection(1, tx);
        reg.subscribe(1, "s1", vec![kind_filter(1)]);
        reg.finish_replay(1, "s1", &HashSet::new());

        assert_eq!(reg.deliver(&sample_event("aa", 1), None), vec![Delivery::Sent]);
        assert_eq!(
            reg.deliver(&sample_event("bb", 1), None),
            vec![Delivery::Dropped]
        );
    }

    #[tokio::test]
    async fn unsubscribe_and_remove_connection() {
        let reg = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        reg.register_connection(1, tx);
        reg.subscribe(1, "s1", vec![kind_filter(1)]);
        assert_eq!(reg.subscription_count(), 1);
        assert!(reg.unsubscribe(1, "s1"));
        assert!(!reg.unsubscribe(1, "s1"));
        assert_eq!(reg.subscription_count(), 0);

        reg.subscribe(1, "s2", vec![kind_filter(1)]);
        reg.remove_connection(1);
        assert_eq!(reg.subscription_count(), 0);
        assert!(reg.deliver(&sample_event("aa", 1), None).is_empty());
    }
}
