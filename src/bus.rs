//! Channel bus - pub/sub delivery layered over the message log

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{ConclaveError, Result};
use crate::log::MessageLog;
use crate::protocol::{Message, MessageDraft, MessageId, Target};

/// Which messages a subscriber receives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    name: Option<String>,
    roles: Vec<String>,
    broadcast: bool,
    everything: bool,
}

impl Filter {
    /// Messages addressed to `name`, plus broadcasts from other senders
    pub fn agent(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            broadcast: true,
            ..Default::default()
        }
    }

    /// Also accept `role:<role>` selectors
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Every message on the bus
    pub fn observer() -> Self {
        Self {
            everything: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        if self.everything {
            return true;
        }
        match &message.target {
            Target::Agent(name) => self.name.as_deref() == Some(name.as_str()),
            Target::Role(role) => self.roles.iter().any(|r| r == role),
            Target::All => {
                self.broadcast && self.name.as_deref() != Some(message.sender.as_str())
            }
        }
    }
}

struct Subscriber {
    id: u64,
    label: String,
    filter: Filter,
    tx: mpsc::UnboundedSender<Message>,
}

struct BusInner {
    log: MessageLog,
    /// Held across append + fan-out so delivery order is append order
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
}

/// Shared handle to the log and its live subscribers
#[derive(Clone)]
pub struct ChannelBus {
    inner: Arc<BusInner>,
}

impl ChannelBus {
    pub fn new(log: MessageLog) -> Self {
        Self {
            inner: Arc::new(BusInner {
                log,
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MessageLog::in_memory())
    }

    pub fn log(&self) -> &MessageLog {
        &self.inner.log
    }

    /// Append to the log, then push to every matching subscriber.
    ///
    /// Only the append can fail the call. An unreachable subscriber is
    /// dropped without affecting the others.
    pub fn publish(&self, draft: MessageDraft) -> Result<Message> {
        let mut subscribers = self.inner.subscribers.lock();
        let message = self.inner.log.append(draft)?;

        subscribers.retain(|sub| {
            if !sub.filter.matches(&message) {
                return true;
            }
            match sub.tx.send(message.clone()) {
                Ok(()) => true,
                Err(_) => {
                    let err = ConclaveError::Delivery {
                        subscriber: sub.label.clone(),
                    };
                    warn!(error = %err, id = %message.id, "Dropping unreachable subscriber");
                    false
                }
            }
        });

        debug!(
            id = %message.id,
            kind = %message.kind,
            sender = %message.sender,
            target = %message.target,
            "Published message"
        );
        Ok(message)
    }

    /// Subscribe with `filter`.
    ///
    /// `since = None` delivers only messages published from now on.
    /// `since = Some(id)` first replays matching entries after `id`
    /// ([`MessageId::ORIGIN`] replays the whole log), then continues live
    /// with no gap between the two.
    pub fn subscribe(
        &self,
        label: impl Into<String>,
        filter: Filter,
        since: Option<MessageId>,
    ) -> Subscription {
        let label = label.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.inner.subscribers.lock();

        let last_seen = match since {
            Some(since) => {
                let backlog = self.inner.log.read_from(Some(since));
                let mut replayed = 0usize;
                for message in backlog.into_iter().filter(|m| filter.matches(m)) {
                    let _ = tx.send(message);
                    replayed += 1;
                }
                debug!(subscriber = %label, after = %since, replayed, "Replayed backlog");
                None
            }
            None => self.inner.log.last_id(),
        };

        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        subscribers.push(Subscriber {
            id,
            label: label.clone(),
            filter,
            tx,
        });

        Subscription {
            id,
            label,
            rx,
            last_seen,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Ordered, deduplicated stream of messages for one subscriber
pub struct Subscription {
    id: u64,
    label: String,
    rx: mpsc::UnboundedReceiver<Message>,
    last_seen: Option<MessageId>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Wait for the next message; `None` once the bus is gone
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            let message = self.rx.recv().await?;
            if self.accept(&message) {
                return Some(message);
            }
        }
    }

    /// Next already-delivered message, without waiting
    pub fn try_next(&mut self) -> Option<Message> {
        while let Ok(message) = self.rx.try_recv() {
            if self.accept(&message) {
                return Some(message);
            }
        }
        None
    }

    /// Stop accepting new deliveries; buffered messages can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn last_seen(&self) -> Option<MessageId> {
        self.last_seen
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn accept(&mut self, message: &Message) -> bool {
        if self.last_seen.is_some_and(|last| message.id <= last) {
            trace!(subscriber = %self.label, id = %message.id, "Dropping duplicate delivery");
            return false;
        }
        self.last_seen = Some(message.id);
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.subscribers.lock().retain(|sub| sub.id != self.id);
        }
    }
}
