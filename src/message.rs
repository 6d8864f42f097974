//! Message bus for inter-agent communication.
//!
//! Every registered agent owns an unbounded FIFO inbox. Direct messages go
//! to one inbox, topic messages fan out to the topic's current subscribers
//! (never back to the sender), and Responses are matched to the waiting
//! requester by correlation id. All deliveries happen under one lock, so
//! ordering per sender/receiver pair is the publish order.
//!
//! The bus also keeps a bounded message history for inspection, and the
//! newest activity time per agent, which the health monitor reads to infer
//! liveness. Eviction from the history never affects liveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::core::Artifact;
use crate::error::{Error, Result};

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

/// Where a message is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Recipient {
    /// A single registered agent.
    Agent(String),
    /// Every current subscriber of a topic.
    Topic(String),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Agent(name) => write!(f, "{}", name),
            Recipient::Topic(topic) => write!(f, "#{}", topic),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub recipient: Recipient,
    pub kind: MessageKind,
    pub payload: Value,
    pub correlation_id: Option<MessageId>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: &str, recipient: Recipient, kind: MessageKind, payload: Value) -> Self {
        Self {
            id: MessageId::new(),
            sender: sender.to_string(),
            recipient,
            kind,
            payload,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// A Request carrying a freshly generated correlation id.
    pub fn request(sender: &str, receiver: &str, payload: Value) -> Self {
        let mut message = Self::new(
            sender,
            Recipient::Agent(receiver.to_string()),
            MessageKind::Request,
            payload,
        );
        message.correlation_id = Some(MessageId::new());
        message
    }

    pub fn notification(sender: &str, recipient: Recipient, payload: Value) -> Self {
        Self::new(sender, recipient, MessageKind::Notification, payload)
    }

    /// Build the Response to this message, addressed back to its sender.
    pub fn reply(&self, payload: Value) -> Self {
        let sender = match &self.recipient {
            Recipient::Agent(name) => name.clone(),
            Recipient::Topic(topic) => topic.clone(),
        };
        let mut response = Self::new(
            &sender,
            Recipient::Agent(self.sender.clone()),
            MessageKind::Response,
            payload,
        );
        response.correlation_id = self.correlation_id.or(Some(self.id));
        response
    }

    /// Whether `agent` sent this message or was its direct receiver.
    pub fn involves(&self, agent: &str) -> bool {
        self.sender == agent || self.recipient == Recipient::Agent(agent.to_string())
    }
}

/// Receiving half of an agent's inbox.
pub type Inbox = mpsc::UnboundedReceiver<Message>;

/// Messages kept by [`MessageBus::history`] unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

#[derive(Default)]
struct BusInner {
    inboxes: HashMap<String, mpsc::UnboundedSender<Message>>,
    topics: HashMap<String, Vec<String>>,
    pending: HashMap<MessageId, oneshot::Sender<Message>>,
    history: VecDeque<Message>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl BusInner {
    fn touch(&mut self, agent: &str, at: DateTime<Utc>) {
        let seen = self.last_seen.entry(agent.to_string()).or_insert(at);
        if at > *seen {
            *seen = at;
        }
    }
}

/// Pub/sub and request/response delivery between agents.
pub struct MessageBus {
    inner: Mutex<BusInner>,
    history_limit: usize,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus keeping at most `limit` messages of history; the oldest are
    /// dropped first.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            history_limit: limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or replace) the inbox for `agent`.
    pub fn register(&self, agent: &str) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(agent.to_string(), tx);
        tracing::debug!(agent, "inbox registered");
        rx
    }

    /// Drop the inbox and every topic subscription of `agent`.
    pub fn unregister(&self, agent: &str) {
        let mut inner = self.lock();
        inner.inboxes.remove(agent);
        for subscribers in inner.topics.values_mut() {
            subscribers.retain(|s| s != agent);
        }
    }

    pub fn is_registered(&self, agent: &str) -> bool {
        self.lock().inboxes.contains_key(agent)
    }

    pub fn subscribe(&self, topic: &str, agent: &str) {
        let mut inner = self.lock();
        let subscribers = inner.topics.entry(topic.to_string()).or_default();
        if !subscribers.iter().any(|s| s == agent) {
            subscribers.push(agent.to_string());
        }
    }

    pub fn unsubscribe(&self, topic: &str, agent: &str) {
        if let Some(subscribers) = self.lock().topics.get_mut(topic) {
            subscribers.retain(|s| s != agent);
        }
    }

    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.lock().topics.get(topic).cloned().unwrap_or_default()
    }

    /// Record and deliver a message; returns the number of deliveries.
    ///
    /// Messages for an unregistered receiver are dropped with a warning.
    pub fn publish(&self, message: Message) -> usize {
        let mut inner = self.lock();
        inner.touch(&message.sender, message.timestamp);
        if let Recipient::Agent(receiver) = &message.recipient {
            inner.touch(receiver, message.timestamp);
        }
        if self.history_limit > 0 {
            if inner.history.len() >= self.history_limit {
                inner.history.pop_front();
            }
            inner.history.push_back(message.clone());
        }
        tracing::trace!(
            message_id = %message.id,
            sender = %message.sender,
            recipient = %message.recipient,
            kind = ?message.kind,
            "publish"
        );

        if message.kind == MessageKind::Response {
            if let Some(waiter) = message
                .correlation_id
                .and_then(|cid| inner.pending.remove(&cid))
            {
                return usize::from(waiter.send(message).is_ok());
            }
        }

        match &message.recipient {
            Recipient::Agent(name) => {
                let delivered = inner
                    .inboxes
                    .get(name)
                    .map(|tx| tx.send(message.clone()).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    tracing::warn!(
                        message_id = %message.id,
                        sender = %message.sender,
                        receiver = %name,
                        "message dropped: receiver not registered"
                    );
                }
                usize::from(delivered)
            }
            Recipient::Topic(topic) => {
                let subscribers = inner.topics.get(topic).cloned().unwrap_or_default();
                subscribers
                    .iter()
                    .filter(|s| **s != message.sender)
                    .filter(|s| {
                        inner
                            .inboxes
                            .get(s.as_str())
                            .map(|tx| tx.send(message.clone()).is_ok())
                            .unwrap_or(false)
                    })
                    .count()
            }
        }
    }

    /// Ask `receiver` to run `skill` and wait for its artifact.
    ///
    /// The receiver must be serving its inbox (see `Agent::serve`). An
    /// error embedded in the Response is returned as `SkillFailed`.
    pub async fn request(
        &self,
        sender: &str,
        receiver: &str,
        skill: &str,
        input: Map<String, Value>,
        project: &str,
    ) -> Result<Artifact> {
        let message = Message::request(
            sender,
            receiver,
            json!({ "skill": skill, "input": input, "project": project }),
        );
        let correlation = message.correlation_id.unwrap_or(message.id);
        let message_id = message.id;
        let (tx, rx) = oneshot::channel();
        self.lock().pending.insert(correlation, tx);

        if self.publish(message) == 0 {
            self.lock().pending.remove(&correlation);
            return Err(Error::MessageDelivery {
                project: project.to_string(),
                receiver: receiver.to_string(),
                message_id: message_id.to_string(),
            });
        }

        let response = rx.await.map_err(|_| Error::MessageDelivery {
            project: project.to_string(),
            receiver: receiver.to_string(),
            message_id: message_id.to_string(),
        })?;
        parse_response(response, project, receiver, skill)
    }

    /// Message history, optionally filtered to one agent.
    pub fn history(&self, agent: Option<&str>) -> Vec<Message> {
        let inner = self.lock();
        match agent {
            None => inner.history.iter().cloned().collect(),
            Some(agent) => inner
                .history
                .iter()
                .filter(|m| m.involves(agent))
                .cloned()
                .collect(),
        }
    }

    /// Newest timestamp of any message sent by or addressed to `agent`.
    pub fn last_activity(&self, agent: &str) -> Option<DateTime<Utc>> {
        self.lock().last_seen.get(agent).copied()
    }

    /// Forget both the history and the recorded activity.
    pub fn clear_history(&self) {
        let mut inner = self.lock();
        inner.history.clear();
        inner.last_seen.clear();
    }
}

fn parse_response(response: Message, project: &str, agent: &str, skill: &str) -> Result<Artifact> {
    let failed = |message: String| Error::SkillFailed {
        project: project.to_string(),
        agent: agent.to_string(),
        skill: skill.to_string(),
        message,
    };

    match response.payload.get("status").and_then(Value::as_str) {
        Some("success") => {
            let artifact = response
                .payload
                .get("artifact")
                .cloned()
                .ok_or_else(|| failed("response carries no artifact".to_string()))?;
            Ok(serde_json::from_value(artifact)?)
        }
        _ => {
            let error = response
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(failed(error.to_string()))
        }
    }
}
