//! Near side of the bridge.
//!
//! A single reader task routes incoming frames to the pending request they
//! belong to: unary responses complete a oneshot, stream chunks go into a
//! bounded per-request queue that the consumer pulls from. Frames for
//! requests nobody waits for any more are dropped.
//!
//! The reader never waits on a consumer. A stream whose queue is full is
//! failed and aborted on its own so other requests keep flowing.

use super::channel::{send_frame, Channel};
use super::protocol::{Command, Frame, RequestFrame, ResponseFrame, StreamEnvelope, READY_TIMEOUT, STREAM_CAPACITY};
use crate::error::AssistantError;
use crate::lock;
use crate::scope::ExecutionScope;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
enum StreamEvent {
    Chunk(Value),
    Done,
    Failed(AssistantError),
}

/// Producer half of a stream's queue. `overflowed` is shared with the
/// consumer so it can tell a dropped stream from a closed channel.
#[derive(Clone)]
struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
    overflowed: Arc<AtomicBool>,
}

enum Pending {
    Unary(oneshot::Sender<Result<Value, AssistantError>>),
    Stream(StreamSink),
}

type PendingMap = Arc<Mutex<HashMap<Uuid, Pending>>>;

struct Inner {
    outgoing: mpsc::Sender<String>,
    pending: PendingMap,
    ready: watch::Receiver<bool>,
    ready_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<Inner>,
}

impl BridgeClient {
    /// Start routing frames from `channel`. Must be called inside a Tokio
    /// runtime.
    pub fn connect(channel: Channel) -> Self {
        Self::with_ready_timeout(channel, READY_TIMEOUT)
    }

    pub fn with_ready_timeout(channel: Channel, ready_timeout: Duration) -> Self {
        let (outgoing, incoming) = channel.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = watch::channel(false);
        let reader = tokio::spawn(run_reader(incoming, outgoing.clone(), pending.clone(), ready_tx));
        Self {
            inner: Arc::new(Inner {
                outgoing,
                pending,
                ready: ready_rx,
                ready_timeout,
                reader,
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait for the far side's `ready` frame.
    pub async fn wait_ready(&self) -> Result<(), AssistantError> {
        let mut ready = self.inner.ready.clone();
        let became_ready = async { ready.wait_for(|r| *r).await.map(|_| ()) };
        match tokio::time::timeout(self.inner.ready_timeout, became_ready).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                log::warn!(
                    "Bridge: far side not ready after {} ms",
                    self.inner.ready_timeout.as_millis()
                );
                Err(AssistantError::channel_unavailable(self.inner.ready_timeout))
            }
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), AssistantError> {
        send_frame(&self.inner.outgoing, frame).await
    }

    async fn abort_request(&self, request_id: Uuid) {
        lock(&self.inner.pending).remove(&request_id);
        if let Err(e) = self.send(&Frame::Abort { request_id }).await {
            log::debug!("Bridge: could not send abort for {}: {}", request_id, e);
        }
    }

    async fn start(
        &self,
        scope: ExecutionScope,
        command: Command,
        timeout: Duration,
        pending: Pending,
    ) -> Result<Uuid, AssistantError> {
        self.wait_ready().await?;
        let request_id = Uuid::new_v4();
        log::debug!("Bridge: -> {} ({})", command.name(), request_id);
        lock(&self.inner.pending).insert(request_id, pending);

        let frame = Frame::Request(RequestFrame {
            request_id,
            scope,
            command,
            timeout_ms: Some(timeout.as_millis() as u64),
        });
        if let Err(e) = self.send(&frame).await {
            lock(&self.inner.pending).remove(&request_id);
            return Err(e);
        }
        Ok(request_id)
    }

    /// Run a unary command with its default timeout.
    pub async fn call(&self, scope: ExecutionScope, command: Command) -> Result<Value, AssistantError> {
        self.call_with(scope, command, None, &CancellationToken::new()).await
    }

    /// Run a unary command. Timing out or cancelling sends an abort frame.
    pub async fn call_with(
        &self,
        scope: ExecutionScope,
        command: Command,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Value, AssistantError> {
        let timeout = timeout.unwrap_or_else(|| command.default_timeout());
        let operation = command.name();
        let (tx, rx) = oneshot::channel();
        let request_id = self.start(scope, command, timeout, Pending::Unary(tx)).await?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = tokio::time::timeout(timeout, rx) => Some(outcome),
        };

        match outcome {
            Some(Ok(Ok(result))) => result,
            Some(Ok(Err(_))) => Err(AssistantError::protocol("bridge closed before responding")),
            Some(Err(_)) => {
                log::warn!("Bridge: {} ({}) timed out", operation, request_id);
                self.abort_request(request_id).await;
                Err(AssistantError::timeout(operation, timeout))
            }
            None => {
                self.abort_request(request_id).await;
                Err(AssistantError::Cancelled)
            }
        }
    }

    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        scope: ExecutionScope,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<T, AssistantError> {
        let value = self.call_with(scope, command, None, cancel).await?;
        serde_json::from_value(value).map_err(|e| AssistantError::protocol(format!("unexpected reply: {}", e)))
    }

    /// Start a streaming command. The deadline covers the whole stream.
    pub async fn stream(
        &self,
        scope: ExecutionScope,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<ResponseStream, AssistantError> {
        let timeout = timeout.unwrap_or_else(|| command.default_timeout());
        let operation = command.name();
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));
        let sink = StreamSink {
            tx,
            overflowed: overflowed.clone(),
        };
        let request_id = self.start(scope, command, timeout, Pending::Stream(sink)).await?;
        Ok(ResponseStream {
            client: self.clone(),
            request_id,
            operation,
            timeout,
            deadline: Instant::now() + timeout,
            rx,
            overflowed,
            finished: false,
        })
    }
}

/// Pull side of a streamed response.
pub struct ResponseStream {
    client: BridgeClient,
    request_id: Uuid,
    operation: &'static str,
    timeout: Duration,
    deadline: Instant,
    rx: mpsc::Receiver<StreamEvent>,
    overflowed: Arc<AtomicBool>,
    finished: bool,
}

impl ResponseStream {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Next chunk in emission order. After a terminal error every chunk
    /// queued before it has already been returned; then the error is
    /// returned once and the stream yields `None`.
    pub async fn next(&mut self) -> Option<Result<Value, AssistantError>> {
        if self.finished {
            return None;
        }
        match tokio::time::timeout_at(self.deadline, self.rx.recv()).await {
            Ok(Some(StreamEvent::Chunk(value))) => Some(Ok(value)),
            Ok(Some(StreamEvent::Done)) => {
                self.finished = true;
                None
            }
            Ok(Some(StreamEvent::Failed(e))) => {
                self.finished = true;
                Some(Err(e))
            }
            Ok(None) => {
                self.finished = true;
                if self.overflowed.load(Ordering::SeqCst) {
                    return Some(Err(AssistantError::protocol(format!(
                        "{} stream dropped after {} unread chunks",
                        self.operation, STREAM_CAPACITY
                    ))));
                }
                Some(Err(AssistantError::protocol("stream ended without a terminal envelope")))
            }
            Err(_) => {
                self.finished = true;
                log::warn!("Bridge: stream {} ({}) passed its deadline", self.operation, self.request_id);
                self.client.abort_request(self.request_id).await;
                Some(Err(AssistantError::timeout(self.operation, self.timeout)))
            }
        }
    }

    /// Stop the stream now and tell the far side to stop producing.
    pub async fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.rx.close();
        self.client.abort_request(self.request_id).await;
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        lock(&self.client.inner.pending).remove(&self.request_id);
        send_abort_now(&self.client.inner.outgoing, self.request_id);
    }
}

/// Queue an abort frame without waiting for room on the channel.
fn send_abort_now(outgoing: &mpsc::Sender<String>, request_id: Uuid) {
    let json = match (Frame::Abort { request_id }).to_json() {
        Ok(json) => json,
        Err(e) => {
            log::warn!("Bridge: could not encode abort for {}: {}", request_id, e);
            return;
        }
    };
    match outgoing.try_send(json) {
        Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
        Err(mpsc::error::TrySendError::Full(json)) => {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let outgoing = outgoing.clone();
                handle.spawn(async move {
                    let _ = outgoing.send(json).await;
                });
            }
        }
    }
}

async fn run_reader(
    mut incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<String>,
    pending: PendingMap,
    ready: watch::Sender<bool>,
) {
    while let Some(raw) = incoming.recv().await {
        let frame = match Frame::parse(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Bridge: dropping frame: {}", e);
                continue;
            }
        };

        match frame {
            Frame::Ready => {
                log::info!("Bridge: far side ready");
                ready.send_replace(true);
            }
            Frame::Response(response) => deliver_response(&pending, &outgoing, response),
            Frame::Chunk(envelope) => deliver_chunk(&pending, &outgoing, envelope),
            Frame::Request(request) => {
                log::debug!("Bridge: ignoring request {} sent to the client", request.request_id)
            }
            Frame::Abort { request_id } => {
                log::debug!("Bridge: ignoring abort {} sent to the client", request_id)
            }
        }
    }

    log::info!("Bridge: channel closed");
    let orphaned: Vec<Pending> = lock(&pending).drain().map(|(_, p)| p).collect();
    for entry in orphaned {
        let err = AssistantError::protocol("bridge closed before responding");
        match entry {
            Pending::Unary(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Stream(sink) => {
                let _ = sink.tx.try_send(StreamEvent::Failed(err));
            }
        }
    }
}

fn deliver_response(pending: &PendingMap, outgoing: &mpsc::Sender<String>, response: ResponseFrame) {
    let request_id = response.request_id;
    let entry = lock(pending).remove(&request_id);
    match entry {
        Some(Pending::Unary(tx)) => {
            let _ = tx.send(response.into_result());
        }
        Some(Pending::Stream(sink)) => {
            let event = match response.into_result() {
                Ok(_) => StreamEvent::Done,
                Err(e) => StreamEvent::Failed(e),
            };
            push_event(pending, outgoing, request_id, &sink, event);
        }
        None => log::debug!("Bridge: response for unknown request {}", request_id),
    }
}

fn deliver_chunk(pending: &PendingMap, outgoing: &mpsc::Sender<String>, envelope: StreamEnvelope) {
    let request_id = envelope.request_id;
    let terminal = envelope.is_terminal();
    let sink = {
        let mut pending = lock(pending);
        let entry = if terminal {
            pending.remove(&request_id)
        } else {
            match pending.get(&request_id) {
                Some(Pending::Stream(sink)) => Some(Pending::Stream(sink.clone())),
                _ => None,
            }
        };
        match entry {
            Some(Pending::Stream(sink)) => Some(sink),
            _ => None,
        }
    };

    let Some(sink) = sink else {
        log::debug!("Bridge: chunk for unknown request {}", request_id);
        return;
    };

    let event = match envelope {
        StreamEnvelope { error: Some(e), .. } => StreamEvent::Failed(e),
        StreamEnvelope { done: true, .. } => StreamEvent::Done,
        StreamEnvelope { chunk, .. } => StreamEvent::Chunk(chunk.unwrap_or(Value::Null)),
    };
    push_event(pending, outgoing, request_id, &sink, event);
}

/// Hand an event to the stream's consumer. A full queue drops the stream:
/// its entry is removed so the consumer sees the close after the queued
/// chunks, and the far side is told to stop.
fn push_event(
    pending: &PendingMap,
    outgoing: &mpsc::Sender<String>,
    request_id: Uuid,
    sink: &StreamSink,
    event: StreamEvent,
) {
    match sink.tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Closed(_)) => {
            lock(pending).remove(&request_id);
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::warn!(
                "Bridge: stream {} fell {} chunks behind, aborting it",
                request_id,
                STREAM_CAPACITY
            );
            sink.overflowed.store(true, Ordering::SeqCst);
            lock(pending).remove(&request_id);
            send_abort_now(outgoing, request_id);
        }
    }
}
