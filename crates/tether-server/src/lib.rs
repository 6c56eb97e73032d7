// Server dispatcher: binds one bus subscription per registered pattern,
// classifies inbound messages into requests and events, and publishes
// framed replies.
//
// Classification uses a single signal: a message carrying a reply address
// is a request, a message without one is an event. The correlation id only
// stamps reply frames; it never decides how a message is dispatched.
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;
use tether_transport::{
    BusConnector, BusMessage, BusSubscription, BusTransport, StatusLogPolicy, spawn_status_monitor,
};
use tether_wire::{
    Envelope, EnvelopeCodec, Headers, JsonCodec, MALFORMED_REQUEST, NO_HANDLER, Pattern,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("transport failure: {0}")]
    Transport(#[from] tether_transport::Error),
    #[error("duplicate handler for pattern {0}")]
    DuplicatePattern(String),
}

/// Stream of values produced by a handler. An `Err` item ends the stream
/// and becomes the terminal error frame.
pub type ValueStream = BoxStream<'static, std::result::Result<Value, Value>>;

/// What a handler produced for its caller: a single value, a failure, or a
/// sequence of streamed values.
pub enum Outcome {
    Value(Value),
    Failure(Value),
    Stream(ValueStream),
}

impl Outcome {
    pub fn value(data: impl Into<Value>) -> Self {
        Outcome::Value(data.into())
    }

    pub fn error(err: impl Into<Value>) -> Self {
        Outcome::Failure(err.into())
    }

    /// Failure carrying a `{"message": ...}` error payload.
    pub fn error_message(message: impl Into<String>) -> Self {
        Outcome::Failure(serde_json::json!({ "message": message.into() }))
    }

    pub fn stream(
        stream: impl futures::Stream<Item = std::result::Result<Value, Value>> + Send + 'static,
    ) -> Self {
        Outcome::Stream(stream.boxed())
    }

    /// Stream a fixed sequence of values in order.
    pub fn stream_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Outcome::Stream(futures::stream::iter(values.into_iter().map(Ok)).boxed())
    }
}

type HandlerFuture = futures::future::BoxFuture<'static, Outcome>;
type BoxHandler = Arc<dyn Fn(Value, RequestContext) -> HandlerFuture + Send + Sync>;

/// Read-only view of the transport message a handler is responding to.
#[derive(Clone)]
pub struct RequestContext {
    message: Arc<BusMessage>,
}

impl RequestContext {
    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn reply(&self) -> Option<&str> {
        self.message.reply.as_deref()
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.message.headers.as_ref()
    }

    /// The raw transport message.
    pub fn message(&self) -> &BusMessage {
        &self.message
    }
}

struct Registration {
    handler: Option<BoxHandler>,
    queue_group: Option<String>,
}

/// Builds the handler registry and binds it to the bus.
///
/// The registry is immutable once `serve` has bound it: exactly one bus
/// subscription per canonical pattern, each optionally scoped to a queue
/// group for competing consumption across server instances.
///
/// ```no_run
/// use tether_server::{Outcome, ServerBuilder};
/// use tether_transport::MemoryBus;
///
/// async fn start(bus: MemoryBus) -> tether_server::Result<()> {
///     let handle = ServerBuilder::new()
///         .handle("math.sum", |data: serde_json::Value, _ctx| async move {
///             let total: i64 = data
///                 .as_array()
///                 .map(|items| items.iter().filter_map(|v| v.as_i64()).sum())
///                 .unwrap_or(0);
///             Outcome::value(total)
///         })
///         .serve(&bus.connector())
///         .await?;
///     handle.shutdown();
///     Ok(())
/// }
/// ```
pub struct ServerBuilder {
    registrations: HashMap<String, Registration>,
    queue_group: Option<String>,
    codec: Arc<dyn EnvelopeCodec>,
    debug: bool,
    duplicates: Vec<String>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
            queue_group: None,
            codec: Arc::new(JsonCodec),
            debug: false,
            duplicates: Vec::new(),
        }
    }

    /// Non-default envelope codec.
    pub fn codec(mut self, codec: impl EnvelopeCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Server-wide queue group applied to every binding that does not carry
    /// its own.
    pub fn queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    /// Log ping-timeout status updates from the transport.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Register a handler under a pattern. A `Scoped` pattern's queue group
    /// overrides the server-wide one for this binding.
    pub fn handle<F, Fut>(mut self, pattern: impl Into<Pattern>, handler: F) -> Self
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let pattern = pattern.into();
        let canonical = pattern.canonical();
        let queue_group = pattern.queue_group().map(str::to_string);
        let handler: BoxHandler =
            Arc::new(move |data, context| Box::pin(handler(data, context)) as HandlerFuture);
        match self.registrations.entry(canonical) {
            Entry::Occupied(mut entry) => {
                if entry.get().handler.is_some() {
                    self.duplicates.push(entry.key().clone());
                } else {
                    let registration = entry.get_mut();
                    registration.handler = Some(handler);
                    if registration.queue_group.is_none() {
                        registration.queue_group = queue_group;
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Registration {
                    handler: Some(handler),
                    queue_group,
                });
            }
        }
        self
    }

    /// Bind a subscription with no handler of its own, e.g. a wildcard
    /// catch-all. Requests landing on it are answered with the reserved
    /// no-handler frame; events landing on it are dropped.
    pub fn bind(mut self, pattern: impl Into<Pattern>) -> Self {
        let pattern = pattern.into();
        let canonical = pattern.canonical();
        let queue_group = pattern.queue_group().map(str::to_string);
        self.registrations.entry(canonical).or_insert(Registration {
            handler: None,
            queue_group,
        });
        self
    }

    /// Connect and bind every registered pattern. The registry is frozen
    /// from here on.
    pub async fn serve(self, connector: &dyn BusConnector) -> Result<ServerHandle> {
        if let Some(pattern) = self.duplicates.into_iter().next() {
            return Err(ServerError::DuplicatePattern(pattern));
        }
        let transport = connector.connect().await?;
        let monitor = spawn_status_monitor(
            &transport,
            StatusLogPolicy {
                log_ping_timeouts: self.debug,
            },
        );

        let handlers: HashMap<String, BoxHandler> = self
            .registrations
            .iter()
            .filter_map(|(canonical, registration)| {
                registration
                    .handler
                    .clone()
                    .map(|handler| (canonical.clone(), handler))
            })
            .collect();
        let dispatcher = Arc::new(Dispatcher {
            transport: Arc::clone(&transport),
            codec: self.codec,
            handlers,
        });

        let default_group = self.queue_group;
        let mut loops = Vec::with_capacity(self.registrations.len());
        for (canonical, registration) in self.registrations {
            let group = registration.queue_group.or_else(|| default_group.clone());
            let subscription = transport.subscribe(&canonical, group.as_deref()).await?;
            debug!(pattern = %canonical, queue_group = ?group, "bound subscription");
            loops.push(tokio::spawn(run_subscription_loop(
                subscription,
                canonical,
                Arc::clone(&dispatcher),
            )));
        }
        Ok(ServerHandle { loops, monitor })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Running server. Shutdown aborts the subscription loops, releasing their
/// bindings; the shared transport stays open for other users.
#[derive(Debug)]
pub struct ServerHandle {
    loops: Vec<JoinHandle<()>>,
    monitor: JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        for task in &self.loops {
            task.abort();
        }
        self.monitor.abort();
    }
}

async fn run_subscription_loop(
    mut subscription: BusSubscription,
    channel: String,
    dispatcher: Arc<Dispatcher>,
) {
    while let Some(message) = subscription.next().await {
        let dispatcher = Arc::clone(&dispatcher);
        let channel = channel.clone();
        // Distinct messages dispatch concurrently, including same-pattern
        // messages with different correlation ids. Handlers own their own
        // synchronization.
        tokio::spawn(async move {
            dispatcher.dispatch(&channel, Arc::new(message)).await;
        });
    }
}

struct Dispatcher {
    transport: Arc<dyn BusTransport>,
    codec: Arc<dyn EnvelopeCodec>,
    handlers: HashMap<String, BoxHandler>,
}

impl Dispatcher {
    async fn dispatch(&self, channel: &str, message: Arc<BusMessage>) {
        let context = RequestContext {
            message: Arc::clone(&message),
        };
        match message.reply.clone() {
            None => self.dispatch_event(channel, &message, context).await,
            Some(reply) => {
                self.dispatch_request(channel, &message, context, &reply)
                    .await
            }
        }
    }

    async fn dispatch_event(&self, channel: &str, message: &BusMessage, context: RequestContext) {
        metrics::counter!("tether_server_events_total").increment(1);
        let envelope = match self.codec.decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(channel, error = %err, "dropping undecodable event");
                return;
            }
        };
        let Some(handler) = self.handlers.get(channel) else {
            debug!(channel, "no handler bound for event");
            return;
        };
        // Events are side effects only: discard the outcome, never publish
        // a reply, and keep failures away from the emitter.
        match handler(envelope.data, context).await {
            Outcome::Failure(err) => warn!(channel, error = %err, "event handler failed"),
            Outcome::Value(_) | Outcome::Stream(_) => {}
        }
    }

    async fn dispatch_request(
        &self,
        channel: &str,
        message: &BusMessage,
        context: RequestContext,
        reply: &str,
    ) {
        metrics::counter!("tether_server_requests_total").increment(1);
        let envelope = match self.codec.decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Fold the decode failure into the reply channel; the caller
                // gets a terminal error frame instead of silence. No id
                // could be read, so the frame travels without one.
                debug!(channel, error = %err, "undecodable request");
                self.publish_reply(reply, Envelope::reply_error(None, Value::from(MALFORMED_REQUEST)))
                    .await;
                return;
            }
        };
        let id = envelope.id.clone();
        let Some(handler) = self.handlers.get(channel) else {
            metrics::counter!("tether_server_no_handler_total").increment(1);
            self.publish_reply(reply, Envelope::reply_error(id, Value::from(NO_HANDLER)))
                .await;
            return;
        };
        match handler(envelope.data, context).await {
            Outcome::Value(data) => self.publish_reply(reply, Envelope::reply(id, data)).await,
            Outcome::Failure(err) => {
                self.publish_reply(reply, Envelope::reply_error(id, err))
                    .await
            }
            Outcome::Stream(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(data) => {
                            self.publish_reply(reply, Envelope::reply_item(id.clone(), data))
                                .await
                        }
                        Err(err) => {
                            // The error is the terminal outcome of the stream.
                            self.publish_reply(reply, Envelope::reply_error(id, err))
                                .await;
                            return;
                        }
                    }
                }
                self.publish_reply(reply, Envelope::reply_end(id)).await;
            }
        }
    }

    async fn publish_reply(&self, reply: &str, frame: Envelope) {
        let bytes = match self.codec.encode(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode reply frame");
                return;
            }
        };
        if let Err(err) = self.transport.publish(reply, bytes, None, None).await {
            // The requester is gone or the link dropped; nothing left to do.
            warn!(error = %err, "failed to publish reply frame");
        }
    }
}
