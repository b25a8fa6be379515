//! COOP Bus - Inter-Agent Message Delivery
//!
//! All inter-agent traffic flows through the `MessageBus`: messages are
//! appended to a bounded FIFO history ring and delivered synchronously to
//! subscribed handlers. Subscriptions are keyed either by topic (a logical
//! event name) or by destination agent, and are removable by handle.
//!
//! Notification order for a `send` is fixed: the generic message-received
//! topic first, then the destination agent's subscribers, then subscribers
//! of the message's specific type topic (`message:{type}`).

use coop_core::{AgentId, Message, MessageId, MessagePayload};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Topic every delivered message is published to, ahead of any
/// agent- or type-specific delivery.
pub const MESSAGE_RECEIVED: &str = "message_received";

/// Default history ring capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Handle identifying a subscription, usable to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    history: VecDeque<Message>,
    topics: HashMap<String, Vec<Subscription>>,
    agents: HashMap<AgentId, Vec<Subscription>>,
}

/// Publish/subscribe bus with a bounded message history.
pub struct MessageBus {
    state: RwLock<BusState>,
    capacity: usize,
    next_subscription: AtomicU64,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MessageBus {
    /// Create a bus retaining at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(BusState::default()),
            capacity: capacity.max(1),
            next_subscription: AtomicU64::new(1),
        }
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    /// Create and deliver a message. The message is appended to history
    /// (evicting the oldest entry past capacity) before any handler runs.
    pub fn send(
        &self,
        from: AgentId,
        to: Option<AgentId>,
        message_type: impl Into<String>,
        payload: MessagePayload,
    ) -> Message {
        let message = Message::new(from, to, message_type, payload);
        self.deliver(message.clone());
        message
    }

    /// Send a direct message to a single agent.
    pub fn send_direct(
        &self,
        from: AgentId,
        to: AgentId,
        content: impl Into<String>,
        data: Option<Value>,
    ) -> Message {
        self.send(
            from,
            Some(to),
            "direct",
            MessagePayload::Direct {
                content: content.into(),
                data,
            },
        )
    }

    /// Broadcast an event to every agent subscriber.
    pub fn broadcast(
        &self,
        from: AgentId,
        event: impl Into<String>,
        data: Option<Value>,
    ) -> Message {
        self.send(
            from,
            None,
            "broadcast",
            MessagePayload::Broadcast {
                event: event.into(),
                data,
            },
        )
    }

    fn deliver(&self, message: Message) {
        // Handlers are collected under the lock but invoked outside it, so
        // a subscriber may query the bus without deadlocking.
        let handlers: Vec<Handler> = {
            let mut state = self.state.write().unwrap();
            state.history.push_back(message.clone());
            while state.history.len() > self.capacity {
                state.history.pop_front();
            }

            let mut handlers = Vec::new();
            if let Some(subs) = state.topics.get(MESSAGE_RECEIVED) {
                handlers.extend(subs.iter().map(|s| Arc::clone(&s.handler)));
            }
            match message.to {
                Some(to) => {
                    if let Some(subs) = state.agents.get(&to) {
                        handlers.extend(subs.iter().map(|s| Arc::clone(&s.handler)));
                    }
                }
                // Broadcast scope reaches every agent subscriber.
                None => {
                    for subs in state.agents.values() {
                        handlers.extend(subs.iter().map(|s| Arc::clone(&s.handler)));
                    }
                }
            }
            let type_topic = format!("message:{}", message.message_type);
            if let Some(subs) = state.topics.get(&type_topic) {
                handlers.extend(subs.iter().map(|s| Arc::clone(&s.handler)));
            }
            handlers
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                tracing::warn!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    "message handler panicked; continuing delivery"
                );
            }
        }
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Subscribe to a topic ("message_received" or "message:{type}").
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.state
            .write()
            .unwrap()
            .topics
            .entry(event_type.into())
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Subscribe on behalf of an agent. The handler fires for messages
    /// addressed to that agent and for untargeted broadcasts.
    pub fn subscribe_agent<F>(&self, agent_id: AgentId, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.state
            .write()
            .unwrap()
            .agents
            .entry(agent_id)
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove a subscription by handle. Returns false if unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.write().unwrap();
        let mut removed = false;
        for subs in state.topics.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        for subs in state.agents.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        state.topics.retain(|_, subs| !subs.is_empty());
        state.agents.retain(|_, subs| !subs.is_empty());
        removed
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Fetch a message by id from the retained history.
    pub fn get_message(&self, id: MessageId) -> Option<Message> {
        self.state
            .read()
            .unwrap()
            .history
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// All retained messages, oldest first.
    pub fn get_all_messages(&self) -> Vec<Message> {
        self.state.read().unwrap().history.iter().cloned().collect()
    }

    /// Messages the agent sent, received, or was in broadcast scope of.
    pub fn get_messages_for_agent(&self, agent_id: AgentId) -> Vec<Message> {
        self.state
            .read()
            .unwrap()
            .history
            .iter()
            .filter(|m| m.involves(agent_id))
            .cloned()
            .collect()
    }

    /// Messages exchanged directly between two agents, in either direction.
    pub fn get_messages_between(&self, a: AgentId, b: AgentId) -> Vec<Message> {
        self.state
            .read()
            .unwrap()
            .history
            .iter()
            .filter(|m| {
                (m.from == a && m.to == Some(b)) || (m.from == b && m.to == Some(a))
            })
            .cloned()
            .collect()
    }

    /// The trailing `count` messages, oldest first.
    pub fn get_recent_messages(&self, count: usize) -> Vec<Message> {
        let state = self.state.read().unwrap();
        let skip = state.history.len().saturating_sub(count);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.state.read().unwrap().history.len()
    }

    /// Discard all stored messages. Subscriptions are unaffected.
    pub fn clear_history(&self) {
        self.state.write().unwrap().history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn direct_payload(content: &str) -> MessagePayload {
        MessagePayload::Direct {
            content: content.to_string(),
            data: None,
        }
    }

    #[test]
    fn send_appends_to_history() {
        let bus = MessageBus::default();
        let from = AgentId::new();
        let sent = bus.send(from, None, "broadcast", direct_payload("hello"));
        assert_eq!(bus.get_message(sent.id), Some(sent));
        assert_eq!(bus.history_len(), 1);
    }

    #[test]
    fn history_evicts_oldest_past_capacity() {
        let bus = MessageBus::new(3);
        let from = AgentId::new();
        let ids: Vec<MessageId> = (0..5)
            .map(|i| bus.send(from, None, "t", direct_payload(&i.to_string())).id)
            .collect();

        let retained = bus.get_all_messages();
        assert_eq!(retained.len(), 3);
        let retained_ids: Vec<MessageId> = retained.iter().map(|m| m.id).collect();
        assert_eq!(retained_ids, ids[2..].to_vec());
        assert!(bus.get_message(ids[0]).is_none());
    }

    #[test]
    fn notification_order_is_generic_then_agent_then_type() {
        let bus = MessageBus::default();
        let from = AgentId::new();
        let to = AgentId::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        bus.subscribe(MESSAGE_RECEIVED, move |_| o.lock().unwrap().push("generic"));
        let o = Arc::clone(&order);
        bus.subscribe_agent(to, move |_| o.lock().unwrap().push("agent"));
        let o = Arc::clone(&order);
        bus.subscribe("message:direct", move |_| o.lock().unwrap().push("type"));

        bus.send_direct(from, to, "hi", None);
        assert_eq!(*order.lock().unwrap(), vec!["generic", "agent", "type"]);
    }

    #[test]
    fn agent_subscriber_receives_broadcasts() {
        let bus = MessageBus::default();
        let from = AgentId::new();
        let subscriber = AgentId::new();
        let other = AgentId::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let r = Arc::clone(&received);
        bus.subscribe_agent(subscriber, move |m| {
            r.lock().unwrap().push(m.message_type.clone())
        });

        bus.broadcast(from, "sync", None);
        bus.send_direct(from, subscriber, "for you", None);
        bus.send_direct(from, other, "not for you", None);

        assert_eq!(*received.lock().unwrap(), vec!["broadcast", "direct"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = MessageBus::default();
        let from = AgentId::new();
        let count = Arc::new(Mutex::new(0));

        let c = Arc::clone(&count);
        let sub = bus.subscribe(MESSAGE_RECEIVED, move |_| *c.lock().unwrap() += 1);

        bus.broadcast(from, "one", None);
        assert!(bus.unsubscribe(sub));
        assert!(!bus.unsubscribe(sub));
        bus.broadcast(from, "two", None);

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_handler_does_not_block_delivery() {
        let bus = MessageBus::default();
        let from = AgentId::new();
        let count = Arc::new(Mutex::new(0));

        bus.subscribe(MESSAGE_RECEIVED, |_| panic!("broken subscriber"));
        let c = Arc::clone(&count);
        bus.subscribe(MESSAGE_RECEIVED, move |_| *c.lock().unwrap() += 1);

        bus.broadcast(from, "event", None);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn messages_between_filters_both_directions() {
        let bus = MessageBus::default();
        let a = AgentId::new();
        let b = AgentId::new();
        let c = AgentId::new();

        bus.send_direct(a, b, "a->b", None);
        bus.send_direct(b, a, "b->a", None);
        bus.send_direct(a, c, "a->c", None);
        bus.broadcast(a, "everyone", None);

        let between = bus.get_messages_between(a, b);
        assert_eq!(between.len(), 2);
    }

    #[test]
    fn messages_for_agent_includes_broadcasts() {
        let bus = MessageBus::default();
        let a = AgentId::new();
        let b = AgentId::new();
        let c = AgentId::new();

        bus.send_direct(a, b, "direct", None);
        bus.broadcast(b, "everyone", None);

        let for_c = bus.get_messages_for_agent(c);
        assert_eq!(for_c.len(), 1);
        assert_eq!(for_c[0].message_type, "broadcast");
    }

    #[test]
    fn recent_messages_returns_trailing_slice_in_order() {
        let bus = MessageBus::default();
        let from = AgentId::new();
        for i in 0..5 {
            bus.send(from, None, "t", direct_payload(&i.to_string()));
        }
        let recent = bus.get_recent_messages(2);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].timestamp <= recent[1].timestamp);
    }

    #[test]
    fn clear_history_preserves_subscriptions() {
        let bus = MessageBus::default();
        let from = AgentId::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(MESSAGE_RECEIVED, move |_| *c.lock().unwrap() += 1);

        bus.broadcast(from, "before", None);
        bus.clear_history();
        assert_eq!(bus.history_len(), 0);

        bus.broadcast(from, "after", None);
        assert_eq!(*count.lock().unwrap(), 2);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn ring_retains_exactly_last_capacity_in_order(
            capacity in 1usize..16,
            total in 0usize..48,
        ) {
            let bus = MessageBus::new(capacity);
            let from = AgentId::new();
            let mut sent = Vec::new();
            for i in 0..total {
                let message = bus.send(
                    from,
                    None,
                    "t",
                    MessagePayload::Direct { content: i.to_string(), data: None },
                );
                sent.push(message.id);
            }

            let retained: Vec<MessageId> =
                bus.get_all_messages().iter().map(|m| m.id).collect();
            let expected: Vec<MessageId> =
                sent.iter().skip(total.saturating_sub(capacity)).copied().collect();
            prop_assert_eq!(retained, expected);
        }
    }
}
