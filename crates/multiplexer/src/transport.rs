//! The single physical connection to the chat backend.
//!
//! A [`Transport`] never buffers and never retries. Each call to
//! [`Transport::open`] starts a new attempt; every attempt produces at most one
//! [`TransportEvent::Opened`], any number of messages, and exactly one
//! [`TransportEvent::Closed`]. Retrying is the reconnection policy's job.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::domain::ConnectionState;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

pub type AttemptId = u64;

/// Close code used when the transport dies without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// How long a locally initiated close waits for the peer's close frame
/// before the connection is dropped.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened {
        attempt: AttemptId,
    },
    Message {
        attempt: AttemptId,
        bytes: Vec<u8>,
    },
    Error {
        attempt: AttemptId,
        reason: String,
    },
    Closed {
        attempt: AttemptId,
        code: u16,
        reason: String,
    },
}

impl TransportEvent {
    pub fn attempt(&self) -> AttemptId {
        match self {
            Self::Opened { attempt }
            | Self::Message { attempt, .. }
            | Self::Error { attempt, .. }
            | Self::Closed { attempt, .. } => *attempt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not open (state {0:?})")]
    NotReady(ConnectionState),
}

pub trait Transport: Send {
    fn state(&self) -> ConnectionState;
    /// Starts a new connection attempt, abandoning any previous one.
    fn open(&mut self, endpoint: &Url, subprotocol: &str) -> AttemptId;
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;
    fn close(&mut self, code: u16, reason: &str);
}

/// Websocket transport on top of `tokio-tungstenite`. Events are pushed to
/// the channel given at construction.
pub struct WsTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    next_attempt: AttemptId,
    close_grace: Duration,
    current: Option<ActiveAttempt>,
}

struct ActiveAttempt {
    attempt: AttemptId,
    state: Arc<Mutex<ConnectionState>>,
    writer: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

impl WsTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            next_attempt: 0,
            close_grace: DEFAULT_CLOSE_GRACE,
            current: None,
        }
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }
}

impl Transport for WsTransport {
    fn state(&self) -> ConnectionState {
        self.current
            .as_ref()
            .map(|active| *lock_state(&active.state))
            .unwrap_or(ConnectionState::Closed)
    }

    fn open(&mut self, endpoint: &Url, subprotocol: &str) -> AttemptId {
        if let Some(previous) = self.current.take() {
            previous.task.abort();
            finish_attempt(
                &previous.state,
                &self.events,
                previous.attempt,
                CLOSE_ABNORMAL,
                "superseded by a new attempt",
            );
        }

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        let (writer, writer_rx) = mpsc::unbounded_channel();
        info!(attempt, endpoint = %endpoint, "transport: connecting");
        let task = tokio::spawn(run_connection(
            attempt,
            endpoint.clone(),
            subprotocol.to_string(),
            self.close_grace,
            Arc::clone(&state),
            writer_rx,
            self.events.clone(),
        ));
        self.current = Some(ActiveAttempt {
            attempt,
            state,
            writer,
            task,
        });
        attempt
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let Some(active) = self.current.as_ref() else {
            return Err(TransportError::NotReady(ConnectionState::Closed));
        };
        let state = *lock_state(&active.state);
        if state != ConnectionState::Open {
            return Err(TransportError::NotReady(state));
        }
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(err) => Message::Binary(err.into_bytes()),
        };
        active
            .writer
            .send(message)
            .map_err(|_| TransportError::NotReady(ConnectionState::Closed))
    }

    fn close(&mut self, code: u16, reason: &str) {
        let Some(active) = self.current.as_ref() else {
            return;
        };
        let mut guard = lock_state(&active.state);
        match *guard {
            ConnectionState::Open => {
                *guard = ConnectionState::Closing;
                drop(guard);
                info!(attempt = active.attempt, code, reason, "transport: closing");
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.to_string().into(),
                };
                if active.writer.send(Message::Close(Some(frame))).is_err() {
                    finish_attempt(&active.state, &self.events, active.attempt, code, reason);
                }
            }
            ConnectionState::Connecting => {
                // run_connection re-checks the state under the lock before
                // reporting Opened.
                *guard = ConnectionState::Closed;
                drop(guard);
                active.task.abort();
                info!(attempt = active.attempt, code, reason, "transport: closed while connecting");
                let _ = self.events.send(TransportEvent::Closed {
                    attempt: active.attempt,
                    code,
                    reason: reason.to_string(),
                });
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(active) = self.current.take() {
            active.task.abort();
        }
    }
}

fn lock_state(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Moves the attempt to `Closed` and emits the terminal event, unless some
/// other path already did.
fn finish_attempt(
    state: &Mutex<ConnectionState>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    attempt: AttemptId,
    code: u16,
    reason: &str,
) {
    let mut guard = lock_state(state);
    if *guard == ConnectionState::Closed {
        return;
    }
    *guard = ConnectionState::Closed;
    info!(attempt, code, reason, "transport: closed");
    let _ = events.send(TransportEvent::Closed {
        attempt,
        code,
        reason: reason.to_string(),
    });
}

async fn run_connection(
    attempt: AttemptId,
    endpoint: Url,
    subprotocol: String,
    close_grace: Duration,
    state: Arc<Mutex<ConnectionState>>,
    mut writer_rx: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let report_failure = |reason: String| {
        warn!(attempt, "transport: {reason}");
        let _ = events.send(TransportEvent::Error {
            attempt,
            reason: reason.clone(),
        });
        finish_attempt(&state, &events, attempt, CLOSE_ABNORMAL, &reason);
    };

    let mut request = match endpoint.as_str().into_client_request() {
        Ok(request) => request,
        Err(err) => return report_failure(format!("invalid websocket request: {err}")),
    };
    if !subprotocol.is_empty() {
        match HeaderValue::from_str(&subprotocol) {
            Ok(value) => {
                request
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", value);
            }
            Err(err) => return report_failure(format!("invalid subprotocol {subprotocol}: {err}")),
        }
    }

    let stream = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(err) => return report_failure(format!("connect failed: {err}")),
    };

    {
        let mut guard = lock_state(&state);
        if *guard != ConnectionState::Connecting {
            return;
        }
        *guard = ConnectionState::Open;
        info!(attempt, "transport: open");
        let _ = events.send(TransportEvent::Opened { attempt });
    }

    let (mut sink, mut reader) = stream.split();
    let mut close_code = CLOSE_ABNORMAL;
    let mut close_reason = String::from("connection lost");
    let mut close_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            outbound = writer_rx.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                let closing = matches!(message, Message::Close(_));
                if let Message::Close(Some(frame)) = &message {
                    close_code = u16::from(frame.code);
                    close_reason = frame.reason.to_string();
                }
                if let Err(err) = sink.send(message).await {
                    let reason = format!("send failed: {err}");
                    warn!(attempt, "transport: {reason}");
                    let _ = events.send(TransportEvent::Error { attempt, reason });
                    break;
                }
                if closing {
                    close_deadline = Some(Instant::now() + close_grace);
                }
            }
            _ = wait_for_deadline(close_deadline) => {
                debug!(attempt, "transport: peer never answered close, dropping connection");
                break;
            }
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message {
                        attempt,
                        bytes: text.into_bytes(),
                    });
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = events.send(TransportEvent::Message { attempt, bytes });
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        close_code = u16::from(frame.code);
                        close_reason = frame.reason.to_string();
                    }
                    debug!(attempt, close_code, "transport: close frame received");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let reason = format!("receive failed: {err}");
                    warn!(attempt, "transport: {reason}");
                    let _ = events.send(TransportEvent::Error { attempt, reason });
                    break;
                }
                None => break,
            },
        }
    }

    finish_attempt(&state, &events, attempt, close_code, &close_reason);
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
