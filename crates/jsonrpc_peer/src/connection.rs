use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, warn};

use crate::cancellation::{CancellationSource, CancellationStrategy, CancellationToken};
use crate::codec::CodecError;
use crate::message::{
    error_codes, Arguments, CancelParams, MalformedMessage, Message, MethodType,
    NotificationMessage, Params, ProgressParams, ProgressToken, RequestId, RequestMessage,
    ResponseError, ResponseMessage, METHOD_CANCEL_REQUEST, METHOD_LOG_TRACE, METHOD_PROGRESS,
    METHOD_SET_TRACE,
};
use crate::reader::{AlreadyListening, MessageReader, ReaderEvent};
use crate::runtime::Runtime;
use crate::trace::{
    format_payload, LogTraceParams, SetTraceParams, TraceFormat, TraceLevel, TraceOptions, Tracer,
};
use crate::writer::{MessageWriter, WriteError};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type handlers may bubble up; a [`ResponseError`] inside is forwarded
/// to the peer verbatim, anything else becomes `InternalError`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return value of request handlers.
pub type HandlerOutcome = Result<Value, HandlerError>;

/// Synthesizes the reply for a request cancelled while still queued; `None`
/// falls back to a `RequestCancelled` rejection.
pub type CancelUndispatchedHook =
    Arc<dyn Fn(&RequestMessage) -> Option<Result<Value, ResponseError>> + Send + Sync>;

type RequestHandlerFn =
    Arc<dyn Fn(Arguments, CancellationToken) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;
type StarRequestHandlerFn = Arc<
    dyn Fn(String, Arguments, CancellationToken) -> BoxFuture<'static, HandlerOutcome>
        + Send
        + Sync,
>;
type NotificationHandlerFn = Arc<dyn Fn(Arguments) -> BoxFuture<'static, ()> + Send + Sync>;
type StarNotificationHandlerFn =
    Arc<dyn Fn(String, Arguments) -> BoxFuture<'static, ()> + Send + Sync>;
type ProgressHandlerFn = Arc<dyn Fn(Value) + Send + Sync>;

/// State-machine violations raised by connection operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection is already listening")]
    AlreadyListening,
    #[error("connection is not listening yet")]
    NotListening,
    #[error("connection is closed")]
    Closed,
    #[error("connection is disposed")]
    Disposed,
    #[error("progress token {0} is already registered")]
    DuplicateProgressToken(ProgressToken),
}

/// Failure of an outbound call.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Peer rejection, or an engine-synthesized one (`MessageWriteError`,
    /// `RequestCancelled`, `PendingResponseRejected`).
    #[error(transparent)]
    Rejected(#[from] ResponseError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("failed to deserialize result: {0}")]
    Result(#[source] serde_json::Error),
}

/// Stream-level fault carried by the `on_error` event.
#[derive(Debug)]
pub enum ConnectionFault {
    Read(crate::reader::ReadError),
    Write(WriteError),
}

/// Payload of the `on_error` event.
#[derive(Debug)]
pub struct ErrorEvent {
    pub fault: ConnectionFault,
    /// The message whose delivery failed, when the fault is tied to one.
    pub message: Option<Message>,
    /// Running writer failure count, for write faults.
    pub count: Option<u32>,
}

/// Behavioural knobs for [`Connection`].
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    pub cancellation: CancellationStrategy,
    pub cancel_undispatched: Option<CancelUndispatchedHook>,
    pub reader: crate::reader::ReaderOptions,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("cancellation", &self.cancellation)
            .field("cancel_undispatched", &self.cancel_undispatched.is_some())
            .field("reader", &self.reader)
            .finish()
    }
}

/// Removes its handler when disposed; dropping the guard leaves the handler
/// registered.
pub struct Registration {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    pub fn dispose(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectionState {
    New,
    Listening,
    Closed,
    Disposed,
}

#[derive(Clone)]
struct RegisteredRequest {
    ty: MethodType,
    handler: RequestHandlerFn,
}

#[derive(Clone)]
struct RegisteredNotification {
    ty: MethodType,
    handler: NotificationHandlerFn,
}

struct PendingEntry {
    method: String,
    started: Instant,
    tx: oneshot::Sender<Result<Value, ResponseError>>,
    /// Releases the cancellation watcher once the request settles.
    settled: Arc<Notify>,
}

struct QueuedMessage {
    key: String,
    message: Message,
}

/// Ingress queue plus the cancellation bookkeeping it must stay atomic with.
///
/// One lock guards all three collections so the read-side cancellation fast
/// path and the dispatch pop observe a request id in exactly one state:
/// still queued, registered as running, or not seen yet. Splitting these
/// behind separate locks would open a window between the queue pop and the
/// token registration in which a concurrent cancel lands in the
/// known-cancelled set after the dispatched request last consulted it.
struct DispatchState {
    queue: VecDeque<QueuedMessage>,
    request_tokens: HashMap<RequestId, CancellationSource>,
    known_cancelled: HashSet<RequestId>,
}

struct TraceSink {
    format: TraceFormat,
    tracer: Arc<dyn Tracer>,
}

/// Object-safe facade over the generic [`MessageWriter`].
trait WriteSink: Send + Sync {
    fn write_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), WriteError>>;
    fn end_stream(&self) -> BoxFuture<'_, Result<(), std::io::Error>>;
    fn error_count(&self) -> u32;
}

impl<W> WriteSink for MessageWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn write_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), WriteError>> {
        Box::pin(self.write(message))
    }

    fn end_stream(&self) -> BoxFuture<'_, Result<(), std::io::Error>> {
        Box::pin(self.end())
    }

    fn error_count(&self) -> u32 {
        self.error_count()
    }
}

/// Object-safe facade over the generic [`MessageReader`].
trait ReaderControl: Send {
    fn start(
        &mut self,
        callback: Box<dyn FnMut(ReaderEvent) + Send>,
    ) -> Result<(), AlreadyListening>;
    fn dispose(&mut self);
}

impl<R> ReaderControl for MessageReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn start(
        &mut self,
        callback: Box<dyn FnMut(ReaderEvent) + Send>,
    ) -> Result<(), AlreadyListening> {
        self.listen(callback)
    }

    fn dispose(&mut self) {
        MessageReader::dispose(self);
    }
}

type Callbacks<T> = Mutex<Vec<Box<dyn Fn(&T) + Send + Sync>>>;

struct ConnectionInner {
    state: Mutex<ConnectionState>,
    writer: Arc<dyn WriteSink>,
    reader: Mutex<Box<dyn ReaderControl>>,
    cancellation: CancellationStrategy,
    cancel_undispatched: Option<CancelUndispatchedHook>,

    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    dispatch: Mutex<DispatchState>,

    request_handlers: Mutex<HashMap<String, RegisteredRequest>>,
    star_request: Mutex<Option<StarRequestHandlerFn>>,
    notification_handlers: Mutex<HashMap<String, RegisteredNotification>>,
    star_notification: Mutex<Option<StarNotificationHandlerFn>>,
    progress_handlers: Mutex<HashMap<ProgressToken, ProgressHandlerFn>>,

    queue_signal: Arc<Notify>,
    notification_seq: AtomicU64,
    unknown_response_seq: AtomicU64,

    trace_level: AtomicU8,
    trace_sink: Mutex<Option<TraceSink>>,

    error_callbacks: Callbacks<ErrorEvent>,
    close_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    unhandled_notification_callbacks: Callbacks<NotificationMessage>,
    unhandled_progress_callbacks: Callbacks<ProgressParams>,
    dispose_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // Wake the dispatch task so it observes the dead weak reference.
        self.queue_signal.notify_one();
    }
}

/// Bidirectional JSON-RPC 2.0 peer over one byte stream pair.
///
/// Either side may issue requests and notifications; both sides may cancel
/// in-flight requests and emit `$/progress` updates. Handles are cheap to
/// clone and share one underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn display_id(id: &Option<RequestId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "null".to_string(),
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}

fn into_response_error(err: HandlerError) -> ResponseError {
    match err.downcast::<ResponseError>() {
        Ok(response) => *response,
        Err(other) => ResponseError::new(error_codes::INTERNAL_ERROR, other.to_string()),
    }
}

/// Rebuilds a write error so it can be both returned and put on the error
/// event; `io::Error` is not clonable.
fn duplicate_write_error(err: &WriteError) -> WriteError {
    match err {
        WriteError::Io { source, count } => WriteError::Io {
            source: std::io::Error::new(source.kind(), source.to_string()),
            count: *count,
        },
        WriteError::Codec(CodecError::Encode(detail)) => {
            WriteError::Codec(CodecError::Encode(detail.clone()))
        }
        WriteError::Codec(CodecError::Decode(detail)) => {
            WriteError::Codec(CodecError::Decode(detail.clone()))
        }
        WriteError::Closed => WriteError::Closed,
    }
}

impl Connection {
    /// Builds a connection over a read/write stream pair. Must be called
    /// within a tokio runtime; nothing is read until [`Connection::listen`].
    pub fn new<R, W>(read: R, write: W, runtime: Runtime) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_options(read, write, runtime, ConnectionOptions::default())
    }

    pub fn with_options<R, W>(
        read: R,
        write: W,
        runtime: Runtime,
        options: ConnectionOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let reader = MessageReader::with_options(read, runtime.clone(), options.reader);
        let writer = MessageWriter::new(write, runtime);
        Self {
            inner: Arc::new(ConnectionInner {
                state: Mutex::new(ConnectionState::New),
                writer: Arc::new(writer),
                reader: Mutex::new(Box::new(reader)),
                cancellation: options.cancellation,
                cancel_undispatched: options.cancel_undispatched,
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
                dispatch: Mutex::new(DispatchState {
                    queue: VecDeque::new(),
                    request_tokens: HashMap::new(),
                    known_cancelled: HashSet::new(),
                }),
                request_handlers: Mutex::new(HashMap::new()),
                star_request: Mutex::new(None),
                notification_handlers: Mutex::new(HashMap::new()),
                star_notification: Mutex::new(None),
                progress_handlers: Mutex::new(HashMap::new()),
                queue_signal: Arc::new(Notify::new()),
                notification_seq: AtomicU64::new(0),
                unknown_response_seq: AtomicU64::new(0),
                trace_level: AtomicU8::new(TraceLevel::Off.as_u8()),
                trace_sink: Mutex::new(None),
                error_callbacks: Mutex::new(Vec::new()),
                close_callbacks: Mutex::new(Vec::new()),
                unhandled_notification_callbacks: Mutex::new(Vec::new()),
                unhandled_progress_callbacks: Mutex::new(Vec::new()),
                dispose_callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts reading and dispatching inbound messages.
    pub fn listen(&self) -> Result<(), ConnectionError> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                ConnectionState::New => *state = ConnectionState::Listening,
                ConnectionState::Listening => return Err(ConnectionError::AlreadyListening),
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                ConnectionState::Disposed => return Err(ConnectionError::Disposed),
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let installed = lock(&self.inner.reader).start(Box::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                ConnectionInner::on_reader_event(&inner, event);
            }
        }));
        if installed.is_err() {
            return Err(ConnectionError::AlreadyListening);
        }

        let weak = Arc::downgrade(&self.inner);
        let signal = Arc::clone(&self.inner.queue_signal);
        tokio::spawn(dispatch_loop(weak, signal));
        Ok(())
    }

    /// Sends a request and awaits the correlated response.
    pub async fn send_request(
        &self,
        ty: impl Into<MethodType>,
        args: Vec<Value>,
    ) -> Result<Value, SendError> {
        self.send_request_impl(ty.into(), args, None).await
    }

    /// Like [`Connection::send_request`], wiring the token into the sender
    /// cancellation strategy.
    pub async fn send_request_with_token(
        &self,
        ty: impl Into<MethodType>,
        args: Vec<Value>,
        token: CancellationToken,
    ) -> Result<Value, SendError> {
        self.send_request_impl(ty.into(), args, Some(token)).await
    }

    /// Sends a request and deserializes the result.
    pub async fn send_request_as<T: DeserializeOwned>(
        &self,
        ty: impl Into<MethodType>,
        args: Vec<Value>,
    ) -> Result<T, SendError> {
        let value = self.send_request_impl(ty.into(), args, None).await?;
        serde_json::from_value(value).map_err(SendError::Result)
    }

    async fn send_request_impl(
        &self,
        ty: MethodType,
        args: Vec<Value>,
        token: Option<CancellationToken>,
    ) -> Result<Value, SendError> {
        let inner = &self.inner;
        inner.ensure_listening()?;
        let params = ty.encode_args(args).map_err(SendError::Rejected)?;

        let id = RequestId::Number(inner.next_id.fetch_add(1, Ordering::SeqCst));
        let request = RequestMessage {
            id: id.clone(),
            method: ty.method.clone(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        let settled = Arc::new(Notify::new());
        lock(&inner.pending).insert(
            id.clone(),
            PendingEntry {
                method: ty.method.clone(),
                started: Instant::now(),
                tx,
                settled: Arc::clone(&settled),
            },
        );

        inner.cancellation.sender.enable_cancellation(&id);
        if let Some(token) = token {
            let weak = Arc::downgrade(inner);
            let watch_id = id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        if let Some(inner) = weak.upgrade() {
                            if inner.cancellation.sender.cancel(&watch_id) {
                                inner.send_cancel_notification(watch_id).await;
                            }
                        }
                    }
                    _ = settled.notified() => {}
                }
            });
        }

        inner.trace_sending_request(&request);
        let message = Message::Request(request);
        if let Err(err) = inner.writer.write_message(&message).await {
            let rejection = ResponseError::new(error_codes::MESSAGE_WRITE_ERROR, err.to_string());
            if let Some(entry) = lock(&inner.pending).remove(&id) {
                entry.settled.notify_one();
                drop(entry.tx);
            }
            let count = inner.writer.error_count();
            inner.fire_error(ConnectionFault::Write(err), Some(message), Some(count));
            inner.cancellation.sender.cleanup(&id);
            return Err(SendError::Rejected(rejection));
        }

        let outcome = rx.await;
        inner.cancellation.sender.cleanup(&id);
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(SendError::Rejected(error)),
            Err(_) => Err(SendError::Rejected(ResponseError::new(
                error_codes::PENDING_RESPONSE_REJECTED,
                "connection went away before the response arrived",
            ))),
        }
    }

    /// Sends a notification; completes once the transport accepted it.
    pub async fn send_notification(
        &self,
        ty: impl Into<MethodType>,
        args: Vec<Value>,
    ) -> Result<(), SendError> {
        let ty = ty.into();
        let inner = &self.inner;
        inner.ensure_listening()?;
        let params = ty.encode_args(args).map_err(SendError::Rejected)?;
        let notification = NotificationMessage {
            method: ty.method,
            params,
        };
        inner.trace_sending_notification(&notification);
        let message = Message::Notification(notification);
        match inner.writer.write_message(&message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let returned = duplicate_write_error(&err);
                let count = inner.writer.error_count();
                inner.fire_error(ConnectionFault::Write(err), Some(message), Some(count));
                Err(SendError::Write(returned))
            }
        }
    }

    /// Registers the request handler for a method; replaces any previous one.
    pub fn on_request<F, Fut>(&self, ty: impl Into<MethodType>, handler: F) -> Registration
    where
        F: Fn(Arguments, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        let ty = ty.into();
        let method = ty.method.clone();
        let handler: RequestHandlerFn =
            Arc::new(move |args, token| -> BoxFuture<'static, HandlerOutcome> {
                Box::pin(handler(args, token))
            });
        lock(&self.inner.request_handlers).insert(method.clone(), RegisteredRequest { ty, handler });
        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.request_handlers).remove(&method);
            }
        })
    }

    /// Fallback request handler for methods without a dedicated one.
    pub fn on_any_request<F, Fut>(&self, handler: F) -> Registration
    where
        F: Fn(String, Arguments, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        let handler: StarRequestHandlerFn =
            Arc::new(move |method, args, token| -> BoxFuture<'static, HandlerOutcome> {
                Box::pin(handler(method, args, token))
            });
        *lock(&self.inner.star_request) = Some(handler);
        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                *lock(&inner.star_request) = None;
            }
        })
    }

    /// Registers the notification handler for a method; replaces any
    /// previous one.
    pub fn on_notification<F, Fut>(&self, ty: impl Into<MethodType>, handler: F) -> Registration
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ty = ty.into();
        let method = ty.method.clone();
        let handler: NotificationHandlerFn =
            Arc::new(move |args| -> BoxFuture<'static, ()> { Box::pin(handler(args)) });
        lock(&self.inner.notification_handlers)
            .insert(method.clone(), RegisteredNotification { ty, handler });
        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.notification_handlers).remove(&method);
            }
        })
    }

    /// Fallback notification handler for methods without a dedicated one.
    pub fn on_any_notification<F, Fut>(&self, handler: F) -> Registration
    where
        F: Fn(String, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: StarNotificationHandlerFn =
            Arc::new(move |method, args| -> BoxFuture<'static, ()> {
                Box::pin(handler(method, args))
            });
        *lock(&self.inner.star_notification) = Some(handler);
        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                *lock(&inner.star_notification) = None;
            }
        })
    }

    /// Routes `$/progress` notifications carrying `token` to `handler`.
    pub fn on_progress(
        &self,
        token: impl Into<ProgressToken>,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<Registration, ConnectionError> {
        let token = token.into();
        {
            let mut handlers = lock(&self.inner.progress_handlers);
            if handlers.contains_key(&token) {
                return Err(ConnectionError::DuplicateProgressToken(token));
            }
            handlers.insert(token.clone(), Arc::new(handler));
        }
        let weak = Arc::downgrade(&self.inner);
        Ok(Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.progress_handlers).remove(&token);
            }
        }))
    }

    /// Shorthand for a `$/progress` notification.
    pub async fn send_progress(
        &self,
        token: impl Into<ProgressToken>,
        value: Value,
    ) -> Result<(), SendError> {
        let params = ProgressParams {
            token: token.into(),
            value,
        };
        self.inner
            .send_builtin_notification(METHOD_PROGRESS, json!(params))
            .await
    }

    /// Sends a `$/logTrace` notification to the peer.
    pub async fn log_trace(
        &self,
        message: impl Into<String>,
        verbose: Option<String>,
    ) -> Result<(), SendError> {
        let params = LogTraceParams {
            message: message.into(),
            verbose,
        };
        self.inner
            .send_builtin_notification(METHOD_LOG_TRACE, json!(params))
            .await
    }

    /// Installs the tracer and level; optionally announces the change with
    /// `$/setTrace`. Passing [`TraceLevel::Off`] makes tracing a no-op again.
    pub async fn trace(
        &self,
        level: TraceLevel,
        tracer: Arc<dyn Tracer>,
        options: TraceOptions,
    ) -> Result<(), SendError> {
        *lock(&self.inner.trace_sink) = Some(TraceSink {
            format: options.format,
            tracer,
        });
        self.inner.trace_level.store(level.as_u8(), Ordering::SeqCst);
        if options.send_notification {
            let params = SetTraceParams { value: level };
            self.inner
                .send_builtin_notification(METHOD_SET_TRACE, json!(params))
                .await?;
        }
        Ok(())
    }

    /// Currently effective trace level.
    pub fn trace_level(&self) -> TraceLevel {
        TraceLevel::from_u8(self.inner.trace_level.load(Ordering::SeqCst))
    }

    pub fn on_error(&self, callback: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        lock(&self.inner.error_callbacks).push(Box::new(callback));
    }

    pub fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.close_callbacks).push(Box::new(callback));
    }

    pub fn on_unhandled_notification(
        &self,
        callback: impl Fn(&NotificationMessage) + Send + Sync + 'static,
    ) {
        lock(&self.inner.unhandled_notification_callbacks).push(Box::new(callback));
    }

    pub fn on_unhandled_progress(
        &self,
        callback: impl Fn(&ProgressParams) + Send + Sync + 'static,
    ) {
        lock(&self.inner.unhandled_progress_callbacks).push(Box::new(callback));
    }

    pub fn on_dispose(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.dispose_callbacks).push(Box::new(callback));
    }

    /// Shuts down the write half of the transport.
    pub async fn end(&self) -> Result<(), std::io::Error> {
        self.inner.writer.end_stream().await
    }

    /// Tears the connection down: every pending response is rejected with
    /// `PendingResponseRejected`, queue and tables are cleared, in-flight
    /// handler tokens are cancelled, and the reader stops. Idempotent.
    pub fn dispose(&self) {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if *state == ConnectionState::Disposed {
                return;
            }
            *state = ConnectionState::Disposed;
        }

        inner.reject_pending("Pending response rejected since connection got disposed");
        {
            let mut state = lock(&inner.dispatch);
            for (_, source) in state.request_tokens.drain() {
                source.cancel();
            }
            state.known_cancelled.clear();
            state.queue.clear();
        }
        lock(&inner.request_handlers).clear();
        *lock(&inner.star_request) = None;
        lock(&inner.notification_handlers).clear();
        *lock(&inner.star_notification) = None;
        lock(&inner.progress_handlers).clear();
        lock(&inner.reader).dispose();
        inner.queue_signal.notify_one();

        let callbacks = std::mem::take(&mut *lock(&inner.dispose_callbacks));
        for callback in &callbacks {
            callback();
        }
        lock(&inner.error_callbacks).clear();
        lock(&inner.close_callbacks).clear();
        lock(&inner.unhandled_notification_callbacks).clear();
        lock(&inner.unhandled_progress_callbacks).clear();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &*lock(&self.inner.state))
            .field("pending", &lock(&self.inner.pending).len())
            .finish_non_exhaustive()
    }
}

async fn dispatch_loop(weak: Weak<ConnectionInner>, signal: Arc<Notify>) {
    loop {
        loop {
            let Some(inner) = weak.upgrade() else { return };
            if inner.is_disposed() {
                return;
            }
            let Some(queued) = inner.pop_next() else {
                break;
            };
            ConnectionInner::process(&inner, queued).await;
        }
        signal.notified().await;
    }
}

impl ConnectionInner {
    fn is_disposed(&self) -> bool {
        *lock(&self.state) == ConnectionState::Disposed
    }

    fn ensure_listening(&self) -> Result<(), ConnectionError> {
        match *lock(&self.state) {
            ConnectionState::Listening => Ok(()),
            ConnectionState::New => Err(ConnectionError::NotListening),
            ConnectionState::Closed => Err(ConnectionError::Closed),
            ConnectionState::Disposed => Err(ConnectionError::Disposed),
        }
    }

    fn on_reader_event(inner: &Arc<Self>, event: ReaderEvent) {
        match event {
            ReaderEvent::Message(message) => Self::enqueue(inner, message),
            ReaderEvent::Partial(info) => {
                debug!(
                    token = info.message_token,
                    waited_ms = info.waiting_time.as_millis() as u64,
                    "message body overdue"
                );
            }
            ReaderEvent::Error(err) => {
                inner.fire_error(ConnectionFault::Read(err), None, None);
            }
            ReaderEvent::Closed => inner.handle_close(),
        }
    }

    /// Appends an inbound message to the dispatch queue. `$/cancelRequest`
    /// takes the fast path here and never enters the queue.
    fn enqueue(inner: &Arc<Self>, message: Message) {
        if let Message::Notification(notification) = &message {
            if notification.method == METHOD_CANCEL_REQUEST {
                Self::handle_cancel(inner, notification.params.clone());
                return;
            }
        }

        let key = match &message {
            Message::Request(request) => format!("req-{}", request.id),
            Message::Response(response) => match &response.id {
                Some(id) => format!("res-{id}"),
                None => format!(
                    "res-unknown-{}",
                    inner.unknown_response_seq.fetch_add(1, Ordering::SeqCst)
                ),
            },
            Message::Notification(_) => format!(
                "not-{}",
                inner.notification_seq.fetch_add(1, Ordering::SeqCst)
            ),
            Message::Malformed(_) => format!(
                "res-unknown-{}",
                inner.unknown_response_seq.fetch_add(1, Ordering::SeqCst)
            ),
        };

        lock(&inner.dispatch)
            .queue
            .push_back(QueuedMessage { key, message });
        inner.queue_signal.notify_one();
    }

    /// Pops one queued message. For a request, the cancellation source is
    /// created, the known-cancelled set consulted, and the token registered
    /// inside the same critical section as the pop, so a concurrent
    /// [`ConnectionInner::handle_cancel`] can never fall between the two and
    /// lose the cancellation.
    fn pop_next(&self) -> Option<QueuedMessage> {
        let mut state = lock(&self.dispatch);
        let queued = state.queue.pop_front()?;
        if let Message::Request(request) = &queued.message {
            let source = self.cancellation.receiver.create_source(&request.id);
            if state.known_cancelled.remove(&request.id) {
                source.cancel();
            }
            state.request_tokens.insert(request.id.clone(), source);
        }
        Some(queued)
    }

    /// Read-time cancellation fast path: drop the request if it is still
    /// queued, signal its token if the handler already started, otherwise
    /// remember the id so the token is born cancelled.
    fn handle_cancel(inner: &Arc<Self>, params: Option<Params>) {
        let Some(params) = params else {
            warn!("$/cancelRequest without params");
            return;
        };
        let cancel: CancelParams = match serde_json::from_value(params.into_value()) {
            Ok(cancel) => cancel,
            Err(err) => {
                warn!("malformed $/cancelRequest params: {err}");
                return;
            }
        };
        let id = cancel.id;

        // One critical section with the dispatch pop, so the id is observed
        // in exactly one state: still queued, running, or not seen yet.
        let undispatched = {
            let mut state = lock(&inner.dispatch);
            let key = format!("req-{id}");
            match state.queue.iter().position(|queued| queued.key == key) {
                Some(index) => state.queue.remove(index),
                None => {
                    if let Some(source) = state.request_tokens.get(&id) {
                        source.cancel();
                    } else {
                        state.known_cancelled.insert(id);
                    }
                    None
                }
            }
        };
        if let Some(queued) = undispatched {
            if let Message::Request(request) = queued.message {
                let outcome = inner
                    .cancel_undispatched
                    .as_ref()
                    .and_then(|hook| hook(&request))
                    .unwrap_or_else(|| {
                        Err(ResponseError::new(
                            error_codes::REQUEST_CANCELLED,
                            format!("request {} got cancelled before dispatch", request.id),
                        ))
                    });
                let weak = Arc::downgrade(inner);
                let RequestMessage { id, method, .. } = request;
                tokio::spawn(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.send_response(id, method, Instant::now(), outcome).await;
                    }
                });
            }
        }
    }

    async fn process(inner: &Arc<Self>, queued: QueuedMessage) {
        match queued.message {
            Message::Request(request) => Self::dispatch_request(inner, request).await,
            Message::Response(response) => inner.settle_response(response),
            Message::Notification(notification) => {
                Self::dispatch_notification(inner, notification).await;
            }
            Message::Malformed(malformed) => inner.handle_malformed(malformed),
        }
    }

    async fn dispatch_request(inner: &Arc<Self>, request: RequestMessage) {
        let received = Instant::now();
        inner.trace_received_request(&request);
        let RequestMessage { id, method, params } = request;

        enum Target {
            Typed(RegisteredRequest),
            Star(StarRequestHandlerFn),
        }
        let target = lock(&inner.request_handlers)
            .get(&method)
            .cloned()
            .map(Target::Typed)
            .or_else(|| lock(&inner.star_request).clone().map(Target::Star));
        let Some(target) = target else {
            lock(&inner.dispatch).request_tokens.remove(&id);
            inner
                .send_response(
                    id,
                    method.clone(),
                    received,
                    Err(ResponseError::method_not_found(&method)),
                )
                .await;
            return;
        };

        // The source was registered by `pop_next` in the same critical
        // section as the queue pop; a missing entry means the connection is
        // being torn down.
        let token = {
            let state = lock(&inner.dispatch);
            match state.request_tokens.get(&id) {
                Some(source) => source.token(),
                None => return,
            }
        };

        let future = match &target {
            Target::Typed(registered) => match registered.ty.convert_params(params, true) {
                Ok(arguments) => (registered.handler)(arguments, token),
                Err(invalid) => {
                    lock(&inner.dispatch).request_tokens.remove(&id);
                    inner.send_response(id, method, received, Err(invalid)).await;
                    return;
                }
            },
            Target::Star(handler) => handler(method.clone(), Arguments::from_params(params), token),
        };

        // The handler future runs as its own task so responses go out in
        // resolution order; the join handle turns a panic into an
        // InternalError reply.
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let joined = tokio::spawn(future).await;
            let outcome = match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(into_response_error(err)),
                Err(join_err) => Err(ResponseError::new(
                    error_codes::INTERNAL_ERROR,
                    format!("request handler for {method} failed: {join_err}"),
                )),
            };
            let Some(inner) = weak.upgrade() else { return };
            lock(&inner.dispatch).request_tokens.remove(&id);
            inner.send_response(id, method, received, outcome).await;
        });
    }

    async fn send_response(
        &self,
        id: RequestId,
        method: String,
        received: Instant,
        outcome: Result<Value, ResponseError>,
    ) {
        if self.is_disposed() {
            return;
        }
        let response = ResponseMessage {
            id: Some(id),
            outcome,
        };
        self.trace_sending_response(&response, &method, received);
        let message = Message::Response(response);
        if let Err(err) = self.writer.write_message(&message).await {
            let count = self.writer.error_count();
            self.fire_error(ConnectionFault::Write(err), Some(message), Some(count));
        }
    }

    fn settle_response(&self, response: ResponseMessage) {
        let Some(id) = response.id.clone() else {
            error!("received response with null id; cannot correlate");
            return;
        };
        let Some(entry) = lock(&self.pending).remove(&id) else {
            warn!(id = %id, "received response for unknown request");
            return;
        };
        // Trace while the entry is alive so the elapsed time survives.
        self.trace_received_response(&response, &entry);
        entry.settled.notify_one();
        let _ = entry.tx.send(response.outcome);
    }

    async fn dispatch_notification(inner: &Arc<Self>, notification: NotificationMessage) {
        inner.trace_received_notification(&notification);
        let NotificationMessage { method, params } = notification;

        match method.as_str() {
            // Consumed on the read path; nothing left to do here.
            METHOD_CANCEL_REQUEST => return,
            METHOD_PROGRESS => {
                inner.handle_progress(params);
                return;
            }
            METHOD_SET_TRACE => {
                inner.handle_set_trace(params);
                return;
            }
            METHOD_LOG_TRACE => {
                inner.handle_log_trace(params);
                return;
            }
            _ => {}
        }

        enum Target {
            Typed(RegisteredNotification),
            Star(StarNotificationHandlerFn),
        }
        let target = lock(&inner.notification_handlers)
            .get(&method)
            .cloned()
            .map(Target::Typed)
            .or_else(|| lock(&inner.star_notification).clone().map(Target::Star));
        let Some(target) = target else {
            let notification = NotificationMessage { method, params };
            debug!(method = %notification.method, "unhandled notification");
            inner.fire_unhandled_notification(&notification);
            return;
        };

        let future = match &target {
            Target::Typed(registered) => {
                let arguments = registered
                    .ty
                    .convert_params(params, false)
                    .unwrap_or(Arguments::None);
                (registered.handler)(arguments)
            }
            Target::Star(handler) => handler(method.clone(), Arguments::from_params(params)),
        };

        tokio::spawn(async move {
            if let Err(join_err) = tokio::spawn(future).await {
                error!("notification handler for {method} failed: {join_err}");
            }
        });
    }

    fn handle_progress(&self, params: Option<Params>) {
        let Some(params) = params else {
            warn!("$/progress without params");
            return;
        };
        let progress: ProgressParams = match serde_json::from_value(params.into_value()) {
            Ok(progress) => progress,
            Err(err) => {
                warn!("malformed $/progress params: {err}");
                return;
            }
        };
        let handler = lock(&self.progress_handlers).get(&progress.token).cloned();
        match handler {
            Some(handler) => handler(progress.value),
            None => {
                debug!(token = %progress.token, "unhandled progress");
                self.fire_unhandled_progress(&progress);
            }
        }
    }

    fn handle_set_trace(&self, params: Option<Params>) {
        let Some(params) = params else {
            warn!("$/setTrace without params");
            return;
        };
        match serde_json::from_value::<SetTraceParams>(params.into_value()) {
            Ok(set_trace) => {
                self.trace_level
                    .store(set_trace.value.as_u8(), Ordering::SeqCst);
            }
            Err(err) => warn!("malformed $/setTrace params: {err}"),
        }
    }

    fn handle_log_trace(&self, params: Option<Params>) {
        let Some(params) = params else {
            warn!("$/logTrace without params");
            return;
        };
        match serde_json::from_value::<LogTraceParams>(params.into_value()) {
            Ok(log_trace) => {
                let sink = lock(&self.trace_sink);
                match &*sink {
                    Some(sink) => sink
                        .tracer
                        .log_trace(&log_trace.message, log_trace.verbose.as_deref()),
                    None => debug!("peer trace: {}", log_trace.message),
                }
            }
            Err(err) => warn!("malformed $/logTrace params: {err}"),
        }
    }

    /// Malformed envelopes are logged; a recoverable id rejects the matching
    /// pending response.
    fn handle_malformed(&self, malformed: MalformedMessage) {
        error!(raw = %malformed.raw, "received malformed message");
        if let Some(id) = malformed.id {
            if let Some(entry) = lock(&self.pending).remove(&id) {
                entry.settled.notify_one();
                let _ = entry.tx.send(Err(ResponseError::new(
                    error_codes::INTERNAL_ERROR,
                    "response message lacks both result and error",
                )));
            }
        }
    }

    fn handle_close(&self) {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::New | ConnectionState::Listening => {
                    *state = ConnectionState::Closed;
                }
                // Close after dispose is suppressed; a second close is a
                // no-op.
                ConnectionState::Closed | ConnectionState::Disposed => return,
            }
        }
        self.reject_pending("Pending response rejected since connection got closed");
        let callbacks = lock(&self.close_callbacks);
        for callback in callbacks.iter() {
            callback();
        }
    }

    fn reject_pending(&self, detail: &str) {
        let entries: Vec<PendingEntry> = {
            let mut pending = lock(&self.pending);
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.settled.notify_one();
            let _ = entry.tx.send(Err(ResponseError::new(
                error_codes::PENDING_RESPONSE_REJECTED,
                detail,
            )));
        }
    }

    async fn send_cancel_notification(&self, id: RequestId) {
        self.send_builtin(METHOD_CANCEL_REQUEST, json!(CancelParams { id }))
            .await;
    }

    /// Builds and writes a reserved `$/…` notification, logging failures.
    async fn send_builtin(&self, method: &str, params: Value) {
        if let Err(err) = self.send_builtin_notification(method, params).await {
            warn!("failed to send {method}: {err}");
        }
    }

    async fn send_builtin_notification(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(), SendError> {
        self.ensure_listening()?;
        let params = match params {
            Value::Object(map) => Some(Params::Object(map)),
            Value::Array(values) => Some(Params::Array(values)),
            _ => None,
        };
        let notification = NotificationMessage {
            method: method.to_string(),
            params,
        };
        self.trace_sending_notification(&notification);
        let message = Message::Notification(notification);
        match self.writer.write_message(&message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let returned = duplicate_write_error(&err);
                let count = self.writer.error_count();
                self.fire_error(ConnectionFault::Write(err), Some(message), Some(count));
                Err(SendError::Write(returned))
            }
        }
    }

    fn fire_error(&self, fault: ConnectionFault, message: Option<Message>, count: Option<u32>) {
        match &fault {
            ConnectionFault::Read(err) => error!("read fault: {err}"),
            ConnectionFault::Write(err) => error!("write fault: {err}"),
        }
        let event = ErrorEvent {
            fault,
            message,
            count,
        };
        let callbacks = lock(&self.error_callbacks);
        for callback in callbacks.iter() {
            callback(&event);
        }
    }

    fn fire_unhandled_notification(&self, notification: &NotificationMessage) {
        let callbacks = lock(&self.unhandled_notification_callbacks);
        for callback in callbacks.iter() {
            callback(notification);
        }
    }

    fn fire_unhandled_progress(&self, progress: &ProgressParams) {
        let callbacks = lock(&self.unhandled_progress_callbacks);
        for callback in callbacks.iter() {
            callback(progress);
        }
    }

    fn trace_sink(&self) -> Option<(TraceLevel, TraceFormat, Arc<dyn Tracer>)> {
        let level = TraceLevel::from_u8(self.trace_level.load(Ordering::Relaxed));
        if level == TraceLevel::Off {
            return None;
        }
        let sink = lock(&self.trace_sink);
        sink.as_ref()
            .map(|sink| (level, sink.format, Arc::clone(&sink.tracer)))
    }

    fn trace_json(tracer: &Arc<dyn Tracer>, kind: &str, message: &Message) {
        let record = json!({
            "kind": kind,
            "timestamp": unix_millis() as u64,
            "message": message.to_value(),
        });
        if let Ok(line) = serde_json::to_string(&record) {
            tracer.log(&line, None);
        }
    }

    fn trace_sending_request(&self, request: &RequestMessage) {
        let Some((level, format, tracer)) = self.trace_sink() else {
            return;
        };
        match format {
            TraceFormat::Text => {
                let line = format!("Sending request '{} - ({})'.", request.method, request.id);
                let data = request
                    .params
                    .as_ref()
                    .and_then(|params| format_payload(level, &params.clone().into_value()));
                tracer.log(&line, data.as_deref());
            }
            TraceFormat::Json => {
                Self::trace_json(&tracer, "send-request", &Message::Request(request.clone()));
            }
        }
    }

    fn trace_sending_notification(&self, notification: &NotificationMessage) {
        let Some((level, format, tracer)) = self.trace_sink() else {
            return;
        };
        match format {
            TraceFormat::Text => {
                let line = format!("Sending notification '{}'.", notification.method);
                let data = notification
                    .params
                    .as_ref()
                    .and_then(|params| format_payload(level, &params.clone().into_value()));
                tracer.log(&line, data.as_deref());
            }
            TraceFormat::Json => Self::trace_json(
                &tracer,
                "send-notification",
                &Message::Notification(notification.clone()),
            ),
        }
    }

    fn trace_sending_response(
        &self,
        response: &ResponseMessage,
        method: &str,
        received: Instant,
    ) {
        let Some((level, format, tracer)) = self.trace_sink() else {
            return;
        };
        match format {
            TraceFormat::Text => {
                let line = format!(
                    "Sending response '{} - ({})'. Processing request took {}ms",
                    method,
                    display_id(&response.id),
                    received.elapsed().as_millis()
                );
                let data = Self::response_payload(level, response);
                tracer.log(&line, data.as_deref());
            }
            TraceFormat::Json => Self::trace_json(
                &tracer,
                "send-response",
                &Message::Response(response.clone()),
            ),
        }
    }

    fn trace_received_request(&self, request: &RequestMessage) {
        let Some((level, format, tracer)) = self.trace_sink() else {
            return;
        };
        match format {
            TraceFormat::Text => {
                let line = format!("Received request '{} - ({})'.", request.method, request.id);
                let data = request
                    .params
                    .as_ref()
                    .and_then(|params| format_payload(level, &params.clone().into_value()));
                tracer.log(&line, data.as_deref());
            }
            TraceFormat::Json => Self::trace_json(
                &tracer,
                "receive-request",
                &Message::Request(request.clone()),
            ),
        }
    }

    fn trace_received_response(&self, response: &ResponseMessage, entry: &PendingEntry) {
        let Some((level, format, tracer)) = self.trace_sink() else {
            return;
        };
        match format {
            TraceFormat::Text => {
                let line = format!(
                    "Received response '{} - ({})' in {}ms.",
                    entry.method,
                    display_id(&response.id),
                    entry.started.elapsed().as_millis()
                );
                let data = Self::response_payload(level, response);
                tracer.log(&line, data.as_deref());
            }
            TraceFormat::Json => Self::trace_json(
                &tracer,
                "receive-response",
                &Message::Response(response.clone()),
            ),
        }
    }

    fn trace_received_notification(&self, notification: &NotificationMessage) {
        let Some((level, format, tracer)) = self.trace_sink() else {
            return;
        };
        match format {
            TraceFormat::Text => {
                let line = format!("Received notification '{}'.", notification.method);
                let data = notification
                    .params
                    .as_ref()
                    .and_then(|params| format_payload(level, &params.clone().into_value()));
                tracer.log(&line, data.as_deref());
            }
            TraceFormat::Json => Self::trace_json(
                &tracer,
                "receive-notification",
                &Message::Notification(notification.clone()),
            ),
        }
    }

    fn response_payload(level: TraceLevel, response: &ResponseMessage) -> Option<String> {
        match &response.outcome {
            Ok(result) => format_payload(level, result),
            Err(error) => format_payload(level, &json!(error)),
        }
    }
}
