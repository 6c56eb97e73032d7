// In-process bus used by tests and embedded deployments.
//
// Delivery mirrors a broker: plain subscriptions fan out, queue-group
// members compete round-robin, and subject wildcards are resolved here so
// the dispatch layers never see them.
use crate::{
    BusConnector, BusMessage, BusSubscription, BusTransport, ConnectionStatus, Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use slab::Slab;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tether_wire::Headers;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

// Per-subscriber bounded delivery queue depth. Deliveries to a full queue
// are dropped rather than blocking the publisher.
const DELIVERY_QUEUE_DEPTH: usize = 1024;
const STATUS_CHANNEL_DEPTH: usize = 16;
const INBOX_PREFIX: &str = "_inbox.";

#[derive(Debug)]
struct SubscriptionEntry {
    subject: String,
    queue_group: Option<String>,
    sender: mpsc::Sender<BusMessage>,
}

#[derive(Debug)]
struct Inner {
    subscriptions: Mutex<Slab<SubscriptionEntry>>,
    // Round-robin cursors keyed by queue-group name.
    group_cursors: Mutex<HashMap<String, usize>>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    closed: AtomicBool,
}

/// In-process pub/sub bus.
///
/// ```
/// use bytes::Bytes;
/// use tether_transport::{BusTransport, MemoryBus};
///
/// let bus = MemoryBus::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut sub = bus.subscribe("updates", None).await.expect("subscribe");
///     bus.publish("updates", Bytes::from_static(b"{}"), None, None)
///         .await
///         .expect("publish");
///     let message = sub.next().await.expect("delivery");
///     assert_eq!(message.subject, "updates");
/// });
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_DEPTH);
        Self {
            inner: Arc::new(Inner {
                subscriptions: Mutex::new(Slab::new()),
                group_cursors: Mutex::new(HashMap::new()),
                status_tx,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connector handing out this bus as the shared transport.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { bus: self.clone() }
    }

    /// Number of live subscription bindings. Test observability hook.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply: Option<&str>,
        headers: Option<Headers>,
    ) -> Result<()> {
        self.ensure_open()?;
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
            reply: reply.map(str::to_string),
            headers,
        };

        // Snapshot matching senders under the lock, deliver outside it.
        let mut plain = Vec::new();
        let mut groups: HashMap<String, Vec<(usize, mpsc::Sender<BusMessage>)>> = HashMap::new();
        {
            let subscriptions = self.inner.subscriptions.lock();
            for (id, entry) in subscriptions.iter() {
                if !subject_matches(&entry.subject, subject) {
                    continue;
                }
                match &entry.queue_group {
                    None => plain.push((id, entry.sender.clone())),
                    Some(group) => groups
                        .entry(group.clone())
                        .or_default()
                        .push((id, entry.sender.clone())),
                }
            }
        }

        let mut dead = Vec::new();
        for (id, sender) in plain {
            deliver(&sender, message.clone(), id, &mut dead);
        }
        for (group, mut members) in groups {
            // Stable pick order so the round-robin cursor is meaningful.
            members.sort_by_key(|(id, _)| *id);
            let cursor = {
                let mut cursors = self.inner.group_cursors.lock();
                let cursor = cursors.entry(group).or_insert(0);
                let current = *cursor;
                *cursor = cursor.wrapping_add(1);
                current
            };
            let (id, sender) = &members[cursor % members.len()];
            deliver(sender, message.clone(), *id, &mut dead);
        }

        if !dead.is_empty() {
            let mut subscriptions = self.inner.subscriptions.lock();
            for id in dead {
                subscriptions.try_remove(id);
            }
        }

        metrics::counter!("tether_bus_published_total").increment(1);
        Ok(())
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<BusSubscription> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::channel(DELIVERY_QUEUE_DEPTH);
        let id = self.inner.subscriptions.lock().insert(SubscriptionEntry {
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            sender,
        });
        metrics::gauge!("tether_bus_subscriptions").set(self.subscription_count() as f64);

        // Weak so a dangling handle cannot keep a closed bus alive.
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(BusSubscription::new(receiver, move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscriptions.lock().try_remove(id);
            }
        }))
    }

    fn new_inbox(&self) -> String {
        format!("{INBOX_PREFIX}{}", Uuid::new_v4().simple())
    }

    fn status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the senders ends every subscription loop.
        self.inner.subscriptions.lock().clear();
        let _ = self.inner.status_tx.send(ConnectionStatus::Disconnected);
        debug!("memory bus closed");
        Ok(())
    }
}

fn deliver(
    sender: &mpsc::Sender<BusMessage>,
    message: BusMessage,
    id: usize,
    dead: &mut Vec<usize>,
) {
    match sender.try_send(message) {
        Ok(()) => {
            metrics::counter!("tether_bus_delivered_total").increment(1);
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Slow consumer: drop the delivery rather than stall publishers.
            metrics::counter!("tether_bus_dropped_total").increment(1);
            debug!(subscription = id, "delivery queue full, message dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
    }
}

// NATS-style token matching: `*` matches exactly one token, `>` matches one
// or more trailing tokens.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(want), Some(got)) if want == got => continue,
            _ => return false,
        }
    }
}

/// Connector for a shared in-process bus.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    bus: MemoryBus,
}

#[async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BusTransport>> {
        self.bus.ensure_open()?;
        let _ = self
            .bus
            .inner
            .status_tx
            .send(ConnectionStatus::Connecting);
        let _ = self.bus.inner.status_tx.send(ConnectionStatus::Connected);
        Ok(Arc::new(self.bus.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_matching() {
        assert!(subject_matches("math.sum", "math.sum"));
        assert!(subject_matches("math.*", "math.sum"));
        assert!(!subject_matches("math.*", "math.sum.extra"));
        assert!(subject_matches("math.>", "math.sum.extra"));
        assert!(!subject_matches("math.>", "math"));
        assert!(subject_matches(">", "anything.at.all"));
        assert!(!subject_matches("math.sum", "math.mul"));
        assert!(!subject_matches("math.sum.extra", "math.sum"));
    }

    #[tokio::test]
    async fn plain_subscriptions_fan_out() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("updates", None).await.expect("subscribe");
        let mut second = bus.subscribe("updates", None).await.expect("subscribe");

        bus.publish("updates", Bytes::from_static(b"{}"), None, None)
            .await
            .expect("publish");

        assert_eq!(first.next().await.expect("first").subject, "updates");
        assert_eq!(second.next().await.expect("second").subject, "updates");
    }

    #[tokio::test]
    async fn queue_group_delivers_to_one_member() {
        let bus = MemoryBus::new();
        let mut first = bus
            .subscribe("work.item", Some("workers"))
            .await
            .expect("subscribe");
        let mut second = bus
            .subscribe("work.item", Some("workers"))
            .await
            .expect("subscribe");

        for _ in 0..4 {
            bus.publish("work.item", Bytes::from_static(b"{}"), None, None)
                .await
                .expect("publish");
        }

        // Round-robin: two deliveries each, four in total.
        let mut first_seen = 0;
        let mut second_seen = 0;
        for _ in 0..2 {
            first.next().await.expect("first delivery");
            first_seen += 1;
            second.next().await.expect("second delivery");
            second_seen += 1;
        }
        assert_eq!(first_seen + second_seen, 4);
        // No further deliveries are pending for either member.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), first.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn wildcard_subscription_receives_concrete_subjects() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("math.*", None).await.expect("subscribe");
        bus.publish("math.sum", Bytes::from_static(b"{}"), None, None)
            .await
            .expect("publish");
        let message = sub.next().await.expect("delivery");
        assert_eq!(message.subject, "math.sum");
    }

    #[tokio::test]
    async fn unsubscribe_removes_binding() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("updates", None).await.expect("subscribe");
        assert_eq!(bus.subscription_count(), 1);
        sub.unsubscribe();
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn drop_removes_binding() {
        let bus = MemoryBus::new();
        {
            let _sub = bus.subscribe("updates", None).await.expect("subscribe");
            assert_eq!(bus.subscription_count(), 1);
        }
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn close_fails_later_calls_deterministically() {
        let bus = MemoryBus::new();
        let mut status = bus.status();
        bus.close().await.expect("close");

        let err = bus
            .publish("updates", Bytes::new(), None, None)
            .await
            .expect_err("publish after close");
        assert!(matches!(err, Error::NotConnected));
        let err = bus.subscribe("updates", None).await.expect_err("subscribe");
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(
            status.recv().await.expect("status"),
            ConnectionStatus::Disconnected
        );

        let err = bus.connector().connect().await.expect_err("connect");
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn close_ends_subscription_streams() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("updates", None).await.expect("subscribe");
        bus.close().await.expect("close");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn inboxes_are_unique() {
        let bus = MemoryBus::new();
        let first = bus.new_inbox();
        let second = bus.new_inbox();
        assert!(first.starts_with(INBOX_PREFIX));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn reply_and_headers_travel_with_the_message() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("updates", None).await.expect("subscribe");
        let mut headers = Headers::new();
        headers.set("x-version", "1.0.0");
        bus.publish(
            "updates",
            Bytes::from_static(b"{}"),
            Some("_inbox.reply"),
            Some(headers),
        )
        .await
        .expect("publish");

        let message = sub.next().await.expect("delivery");
        assert_eq!(message.reply.as_deref(), Some("_inbox.reply"));
        assert_eq!(
            message.headers.expect("headers").get("x-version"),
            Some("1.0.0")
        );
    }
}
