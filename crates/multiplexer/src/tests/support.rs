use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConnectionState, MessageId},
    protocol::{BackendFrame, BinaryReference, ContentMessage},
};
use tokio::{sync::mpsc, time::Instant};
use url::Url;

use crate::{
    fetch::{FetchedFile, FileFetcher},
    store::MessageStore,
    transport::{AttemptId, Transport, TransportError, TransportEvent},
};

#[derive(Debug)]
pub struct OpenRecord {
    pub url: Url,
    pub subprotocol: String,
    pub at: Instant,
}

#[derive(Debug, Default)]
pub struct TransportLog {
    pub state: ConnectionState,
    pub attempt: AttemptId,
    pub opens: Vec<OpenRecord>,
    pub sent: Vec<Vec<u8>>,
    pub closes: Vec<(u16, String)>,
}

/// In-memory transport. The test plays the server through `accept`,
/// `push_frame` and `server_close`; every event goes out on the events
/// channel the multiplexer listens to.
#[derive(Clone)]
pub struct RecordingTransport {
    log: Arc<Mutex<TransportLog>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl RecordingTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            log: Arc::default(),
            events,
        }
    }

    pub fn log(&self) -> MutexGuard<'_, TransportLog> {
        self.log.lock().expect("transport log poisoned")
    }

    pub fn open_count(&self) -> usize {
        self.log().opens.len()
    }

    /// Sent frames decoded back into JSON for assertions.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.log()
            .sent
            .iter()
            .map(|frame| serde_json::from_slice(frame).expect("sent frame is json"))
            .collect()
    }

    pub fn accept(&self) {
        let attempt = {
            let mut log = self.log();
            log.state = ConnectionState::Open;
            log.attempt
        };
        self.emit(TransportEvent::Opened { attempt });
    }

    pub fn push_frame(&self, frame: &BackendFrame) {
        let bytes = serde_json::to_vec(frame).expect("encode frame");
        self.push_bytes(bytes);
    }

    pub fn push_bytes(&self, bytes: Vec<u8>) {
        let attempt = self.log().attempt;
        self.emit(TransportEvent::Message { attempt, bytes });
    }

    pub fn server_close(&self, code: u16, reason: &str) {
        let attempt = {
            let mut log = self.log();
            log.state = ConnectionState::Closed;
            log.attempt
        };
        self.emit(TransportEvent::Closed {
            attempt,
            code,
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

impl Transport for RecordingTransport {
    fn state(&self) -> ConnectionState {
        self.log().state
    }

    fn open(&mut self, endpoint: &Url, subprotocol: &str) -> AttemptId {
        let mut log = self.log();
        log.attempt += 1;
        log.state = ConnectionState::Connecting;
        log.opens.push(OpenRecord {
            url: endpoint.clone(),
            subprotocol: subprotocol.to_string(),
            at: Instant::now(),
        });
        log.attempt
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut log = self.log();
        if log.state != ConnectionState::Open {
            return Err(TransportError::NotReady(log.state));
        }
        log.sent.push(frame);
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let attempt = {
            let mut log = self.log();
            log.closes.push((code, reason.to_string()));
            if log.state == ConnectionState::Closed {
                return;
            }
            log.state = ConnectionState::Closed;
            log.attempt
        };
        self.emit(TransportEvent::Closed {
            attempt,
            code,
            reason: reason.to_string(),
        });
    }
}

/// Fetcher serving canned bodies by url; unknown urls fail.
#[derive(Default)]
pub struct StaticFetcher {
    files: HashMap<String, FetchedFile>,
}

impl StaticFetcher {
    pub fn with_file(mut self, url: &str, bytes: &[u8], mime_type: &str) -> Self {
        self.files.insert(
            url.to_string(),
            FetchedFile {
                bytes: bytes.to_vec(),
                mime_type: Some(mime_type.to_string()),
            },
        );
        self
    }
}

#[async_trait]
impl FileFetcher for StaticFetcher {
    async fn fetch(&self, reference: &BinaryReference) -> Result<FetchedFile> {
        self.files
            .get(&reference.url)
            .cloned()
            .ok_or_else(|| anyhow!("404 for {}", reference.url))
    }
}

/// Append-ordered store kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    messages: tokio::sync::Mutex<Vec<ContentMessage>>,
}

impl MemoryStore {
    pub fn seeded(messages: Vec<ContentMessage>) -> Self {
        Self {
            messages: tokio::sync::Mutex::new(messages),
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .map(|message| message.id.to_string())
            .collect()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn load_since(&self, last_known_id: Option<&MessageId>) -> Result<Vec<ContentMessage>> {
        let messages = self.messages.lock().await;
        let start = last_known_id
            .and_then(|id| messages.iter().position(|message| &message.id == id))
            .map_or(0, |index| index + 1);
        Ok(messages[start..].to_vec())
    }

    async fn upsert(&self, message: &ContentMessage) -> Result<()> {
        let mut messages = self.messages.lock().await;
        match messages.iter_mut().find(|stored| stored.id == message.id) {
            Some(stored) => *stored = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(())
    }

    async fn delete(&self, message_id: &MessageId) -> Result<()> {
        self.messages
            .lock()
            .await
            .retain(|message| &message.id != message_id);
        Ok(())
    }
}
