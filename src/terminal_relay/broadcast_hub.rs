//! Topic-keyed fan-out of raw terminal bytes.
//!
//! No replay: a receiver only sees payloads published after `subscribe`
//! returned, and publishing to a topic nobody listens on drops the payload.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;

pub fn terminal_topic(session_id: Uuid) -> String {
    format!("terminal:{}", session_id)
}

pub struct BroadcastHub {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Sends `payload` to current subscribers, returning how many received it.
    pub fn publish(&self, topic: &str, payload: Bytes) -> usize {
        let sender = match self.topics.lock() {
            Ok(topics) => topics.get(topic).cloned(),
            Err(poisoned) => poisoned.into_inner().get(topic).cloned(),
        };
        let Some(sender) = sender else {
            trace!("No listeners on {}, dropped {} bytes", topic, payload.len());
            return 0;
        };
        match sender.send(payload) {
            Ok(receivers) => receivers,
            Err(dropped) => {
                trace!("No listeners on {}, dropped {} bytes", topic, dropped.0.len());
                0
            }
        }
    }

    /// Registers a receiver; it is live as soon as this returns.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes> {
        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(poisoned) => {
                warn!("Broadcast topic map was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        debug!("New subscriber on {} ({} total)", topic, sender.receiver_count() + 1);
        sender.subscribe()
    }

    /// Drops a topic; existing receivers observe the channel as closed.
    pub fn remove_topic(&self, topic: &str) {
        let removed = match self.topics.lock() {
            Ok(mut topics) => topics.remove(topic),
            Err(poisoned) => poisoned.into_inner().remove(topic),
        };
        if removed.is_some() {
            debug!("Removed topic {}", topic);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        match self.topics.lock() {
            Ok(topics) => topics.get(topic).map_or(0, |s| s.receiver_count()),
            Err(poisoned) => poisoned
                .into_inner()
                .get(topic)
                .map_or(0, |s| s.receiver_count()),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
