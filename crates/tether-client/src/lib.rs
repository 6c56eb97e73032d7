// Client dispatcher: correlated requests over ephemeral reply
// subscriptions, plus fire-and-forget event emission.
//
// A request is a publish-and-subscribe exchange. The reply inbox is bound
// BEFORE the request is published so a fast responder cannot race the
// subscription into existence, and the binding is released on every exit
// path: terminal frame, application error, transport error, deadline, or
// cancellation.
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_transport::{
    BusConnector, BusSubscription, BusTransport, StatusLogPolicy, spawn_status_monitor,
};
use tether_wire::{
    Envelope, EnvelopeCodec, Headers, JsonCodec, NO_HANDLER, Pattern, Record, encode_call,
};
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

pub mod config;

pub use config::ClientConfig;


pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Transport(#[from] tether_transport::Error),
    #[error("failed to encode request")]
    Encode(#[source] tether_wire::Error),
    #[error("failed to decode reply")]
    Decode(#[source] tether_wire::Error),
    #[error("empty response for pattern {0}")]
    EmptyResponse(String),
    #[error("handler failed: {0}")]
    Application(Value),
    #[error("request timed out")]
    TimedOut,
    #[error("config error: {0}")]
    Config(String),
}

impl ClientError {
    /// True when the server reported the reserved no-handler code.
    pub fn is_no_handler(&self) -> bool {
        matches!(self, ClientError::Application(err) if err == &Value::from(NO_HANDLER))
    }
}

/// Issues correlated requests and fire-and-forget events over a shared bus
/// connection.
///
/// The connection is established lazily on first use and shared by every
/// call; concurrent first calls share one pending connect. After `close`,
/// every further call fails with [`ClientError::NotConnected`].
pub struct Client {
    connector: Arc<dyn BusConnector>,
    config: ClientConfig,
    codec: Arc<dyn EnvelopeCodec>,
    transport: OnceCell<Arc<dyn BusTransport>>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Client {
    pub fn new(connector: impl BusConnector + 'static, config: ClientConfig) -> Self {
        Self::with_codec(connector, config, JsonCodec)
    }

    /// Client with a non-default envelope codec.
    pub fn with_codec(
        connector: impl BusConnector + 'static,
        config: ClientConfig,
        codec: impl EnvelopeCodec + 'static,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
            codec: Arc::new(codec),
            transport: OnceCell::new(),
            monitor: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Establish (or reuse) the shared bus connection.
    pub async fn connect(&self) -> Result<Arc<dyn BusTransport>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        let transport = self
            .transport
            .get_or_try_init(|| async {
                let transport = self.connector.connect().await?;
                let handle = spawn_status_monitor(
                    &transport,
                    StatusLogPolicy {
                        log_ping_timeouts: self.config.debug,
                    },
                );
                *self.monitor.lock() = Some(handle);
                debug!("bus connection established");
                Ok::<_, ClientError>(transport)
            })
            .await?;
        Ok(Arc::clone(transport))
    }

    /// Close the shared connection. Idempotent; later calls on this client
    /// fail deterministically instead of blocking.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        if let Some(transport) = self.transport.get() {
            transport.close().await?;
        }
        Ok(())
    }

    /// Issue a correlated request and return the stream of reply values.
    ///
    /// ```no_run
    /// use tether_client::Client;
    ///
    /// async fn call(client: &Client) -> tether_client::Result<()> {
    ///     let total = client
    ///         .request("math.sum", serde_json::json!([1, 2, 3, 4, 5]))
    ///         .await?
    ///         .last()
    ///         .await?;
    ///     assert_eq!(total, serde_json::json!(15));
    ///     Ok(())
    /// }
    /// ```
    pub async fn request(
        &self,
        pattern: impl Into<Pattern>,
        payload: impl Into<Record>,
    ) -> Result<ReplyStream> {
        let transport = self.connect().await?;
        let subject = pattern.into().canonical();
        let record = payload.into();

        let mut envelope = Envelope {
            pattern: Some(subject.clone()),
            ..Envelope::default()
        };
        let id = assign_correlation_id(&mut envelope);
        let (bytes, call_headers) =
            encode_call(self.codec.as_ref(), envelope, record).map_err(ClientError::Encode)?;
        let headers = merge_headers(call_headers, self.config.headers.as_ref());

        // Bind the reply inbox first; publish only once replies can land.
        let inbox = transport.new_inbox();
        let subscription = transport.subscribe(&inbox, None).await?;
        if let Err(err) = transport
            .publish(&subject, bytes, Some(&inbox), headers)
            .await
        {
            subscription.unsubscribe();
            return Err(err.into());
        }
        metrics::counter!("tether_client_requests_total").increment(1);

        Ok(ReplyStream::spawn(
            subscription,
            id,
            subject,
            Arc::clone(&self.codec),
            self.config.reply_queue_depth,
        ))
    }

    /// Publish a fire-and-forget event. Resolves once the local driver has
    /// accepted the publish, independent of delivery or handler outcome.
    pub async fn emit(
        &self,
        pattern: impl Into<Pattern>,
        payload: impl Into<Record>,
    ) -> Result<()> {
        let transport = self.connect().await?;
        let subject = pattern.into().canonical();
        let record = payload.into();

        // No correlation id and no reply address: the publish is the call.
        let envelope = Envelope {
            pattern: Some(subject.clone()),
            ..Envelope::default()
        };
        let (bytes, call_headers) =
            encode_call(self.codec.as_ref(), envelope, record).map_err(ClientError::Encode)?;
        let headers = merge_headers(call_headers, self.config.headers.as_ref());
        transport.publish(&subject, bytes, None, headers).await?;
        metrics::counter!("tether_client_events_total").increment(1);
        Ok(())
    }
}

/// Attach a fresh correlation id unless the envelope already carries one.
/// Returns the effective id. Random tokens keep ids unique among in-flight
/// requests without coordination.
fn assign_correlation_id(envelope: &mut Envelope) -> String {
    if let Some(id) = &envelope.id {
        return id.clone();
    }
    let id = Uuid::new_v4().to_string();
    envelope.id = Some(id.clone());
    id
}

/// Combine per-call headers with connection defaults. Per-call values win;
/// defaults only fill gaps. When neither side has headers the result is
/// absent, not an empty set.
pub fn merge_headers(per_call: Option<Headers>, defaults: Option<&Headers>) -> Option<Headers> {
    if per_call.is_none() && defaults.is_none() {
        return None;
    }
    let mut headers = per_call.unwrap_or_default();
    if let Some(defaults) = defaults {
        for (key, value) in defaults.iter() {
            if !headers.contains(key) {
                headers.set(key, value);
            }
        }
    }
    Some(headers)
}

/// Stream of reply values for one in-flight request.
///
/// Dropping the handle cancels the request and releases its reply inbox;
/// frames arriving afterwards are never received.
#[derive(Debug)]
pub struct ReplyStream {
    frames: mpsc::Receiver<Result<Value>>,
    pump: JoinHandle<()>,
    deadline: Option<Instant>,
}

impl ReplyStream {
    fn spawn(
        subscription: BusSubscription,
        id: String,
        subject: String,
        codec: Arc<dyn EnvelopeCodec>,
        queue_depth: usize,
    ) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(queue_depth.max(1));
        let pump = tokio::spawn(run_reply_pump(subscription, id, subject, codec, frame_tx));
        Self {
            frames: frame_rx,
            pump,
            deadline: None,
        }
    }

    /// Deployment-level timeout: fail the caller with `TimedOut` if the
    /// terminal frame has not arrived by then. Teardown is identical to
    /// cancellation.
    pub fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(Instant::now() + limit);
        self
    }

    /// Next reply value, or a terminal error. `None` once the reply stream
    /// has ended.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.frames.recv()).await {
                Ok(frame) => frame,
                Err(_) => {
                    self.deadline = None;
                    self.pump.abort();
                    self.frames.close();
                    Some(Err(ClientError::TimedOut))
                }
            },
            None => self.frames.recv().await,
        }
    }

    /// Await the terminal outcome and resolve to the last value seen.
    /// A stream that terminates bare resolves to `Value::Null`.
    pub async fn last(mut self) -> Result<Value> {
        let mut last = Value::Null;
        while let Some(frame) = self.next().await {
            last = frame?;
        }
        Ok(last)
    }

    /// Cancel the request. Equivalent to dropping the handle; named so the
    /// release point reads explicitly at call sites.
    pub fn cancel(self) {}
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        // Aborting the pump drops its subscription, releasing the inbox.
        self.pump.abort();
    }
}

async fn run_reply_pump(
    mut subscription: BusSubscription,
    id: String,
    subject: String,
    codec: Arc<dyn EnvelopeCodec>,
    frame_tx: mpsc::Sender<Result<Value>>,
) {
    loop {
        let Some(message) = subscription.next().await else {
            break;
        };
        // A zero-length payload is a transport-level "no response" signal,
        // reserved and distinct from every application value.
        if message.payload.is_empty() {
            let _ = frame_tx
                .send(Err(ClientError::EmptyResponse(subject.clone())))
                .await;
            break;
        }
        let envelope = match codec.decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Malformed reply: terminal for this request only.
                debug!(subject = %subject, error = %err, "undecodable reply frame");
                let _ = frame_tx.send(Err(ClientError::Decode(err))).await;
                break;
            }
        };
        if let Some(reply_id) = &envelope.id
            && *reply_id != id
        {
            // Stray frame for another request; keep listening.
            metrics::counter!("tether_client_mismatched_replies_total").increment(1);
            continue;
        }
        if let Some(err) = envelope.err {
            let _ = frame_tx.send(Err(ClientError::Application(err))).await;
            break;
        }
        if envelope.disposed.unwrap_or(false) {
            if !envelope.data.is_null() {
                let _ = frame_tx.send(Ok(envelope.data)).await;
            }
            break;
        }
        if frame_tx.send(Ok(envelope.data)).await.is_err() {
            // Caller cancelled.
            break;
        }
    }
    subscription.unsubscribe();
}
