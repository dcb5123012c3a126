//! The shared aggregate: one transport, one outgoing queue, one history and
//! the attached clients, mutated only through the handlers below.
//!
//! Handlers are synchronous and run to completion. Anything slow (binary
//! fetches, store writes) is handed to a task and comes back through the
//! inbox as a new [`MuxInput`].

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientId, ConnectionState, MessageId, MessageStatus},
    error::{ApiError, ErrorCode},
    protocol::{
        BackendFrame, BinaryReference, ClientEvent, ClientRequest, ContentMessage, JoinConfig,
        MessagePayload, OutgoingEnvelope,
    },
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    codec::WireCodec,
    endpoint::{connect_url, validate_endpoint},
    error::MuxError,
    fetch::{resolved_body, unresolved_body, FetchedFile, FileFetcher},
    history::MessageHistory,
    queue::{OutgoingQueue, DEFAULT_MAX_QUEUE_LEN},
    reconnect::{
        CloseDecision, ConnectDecision, ReconnectionPolicy, DEFAULT_MIN_RECONNECT_INTERVAL,
    },
    registry::{ClientEndpoint, ClientRegistry},
    store::StoreWriter,
    transport::{AttemptId, Transport, TransportEvent},
};

pub const DEFAULT_SUBPROTOCOL: &str = "chat-mux.v1";

/// Last client left; nothing is wrong with the connection.
pub const CLOSE_NO_LISTENERS: u16 = 1000;
pub const CLOSE_REASON_NO_LISTENERS: &str = "no listeners";
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_OFFLINE: u16 = 4001;
/// Offline signal arrived while the transport still reported open.
pub const CLOSE_OFFLINE_WHILE_OPEN: u16 = 4002;

#[derive(Debug, Clone)]
pub struct MuxOptions {
    pub min_reconnect_interval: Duration,
    /// `None` leaves the outgoing queue unbounded.
    pub max_queue_len: Option<usize>,
    pub subprotocol: String,
    pub initially_online: bool,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            min_reconnect_interval: DEFAULT_MIN_RECONNECT_INTERVAL,
            max_queue_len: Some(DEFAULT_MAX_QUEUE_LEN),
            subprotocol: DEFAULT_SUBPROTOCOL.to_string(),
            initially_online: true,
        }
    }
}

pub struct MuxDependencies {
    pub transport: Box<dyn Transport>,
    pub codec: Arc<dyn WireCodec>,
    pub fetcher: Arc<dyn FileFetcher>,
    pub store: StoreWriter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    PendingJoin,
    Joined,
    BackingOff,
}

/// Binary content waiting for its bytes before it becomes visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFetch {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub reference: BinaryReference,
    /// Ids this message consolidates; removed once it lands.
    pub supersedes: Vec<MessageId>,
}

#[derive(Debug)]
pub enum MuxInput {
    Attach {
        endpoint: ClientEndpoint,
        last_known_id: Option<MessageId>,
        restored: Vec<ContentMessage>,
    },
    Request {
        client: ClientId,
        request: ClientRequest,
    },
    Resync {
        client: ClientId,
        last_known_id: Option<MessageId>,
        restored: Vec<ContentMessage>,
    },
    Detach {
        client: ClientId,
    },
    Connectivity {
        online: bool,
    },
    FetchCompleted {
        fetch: PendingFetch,
        result: Result<FetchedFile, String>,
    },
    Shutdown,
}

struct ActiveJoin {
    config: JoinConfig,
    endpoint: Url,
}

#[derive(Debug)]
struct Outbound {
    envelope: OutgoingEnvelope,
    frame: Vec<u8>,
}

pub struct Multiplexer {
    options: MuxOptions,
    transport: Box<dyn Transport>,
    codec: Arc<dyn WireCodec>,
    fetcher: Arc<dyn FileFetcher>,
    store: StoreWriter,
    inbox: mpsc::UnboundedSender<MuxInput>,
    queue: OutgoingQueue<Outbound>,
    history: MessageHistory,
    registry: ClientRegistry,
    policy: ReconnectionPolicy,
    join: Option<ActiveJoin>,
    online: bool,
    attempt: Option<AttemptId>,
    session: SessionState,
}

impl Multiplexer {
    pub fn new(
        options: MuxOptions,
        dependencies: MuxDependencies,
        inbox: mpsc::UnboundedSender<MuxInput>,
    ) -> Self {
        Self {
            queue: OutgoingQueue::new(options.max_queue_len),
            policy: ReconnectionPolicy::new(options.min_reconnect_interval),
            online: options.initially_online,
            options,
            transport: dependencies.transport,
            codec: dependencies.codec,
            fetcher: dependencies.fetcher,
            store: dependencies.store,
            inbox,
            history: MessageHistory::new(),
            registry: ClientRegistry::new(),
            join: None,
            attempt: None,
            session: SessionState::Closed,
        }
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn queued_message_ids(&self) -> Vec<MessageId> {
        self.queue
            .iter()
            .map(|outbound| outbound.envelope.message_id().clone())
            .collect()
    }

    pub fn session_state(&self) -> SessionState {
        self.session
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn join_config(&self) -> Option<&JoinConfig> {
        self.join.as_ref().map(|join| &join.config)
    }

    /// When the pending reconnection, if any, is due.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.policy.deadline()
    }

    pub fn handle_input(&mut self, input: MuxInput) {
        match input {
            MuxInput::Attach {
                endpoint,
                last_known_id,
                restored,
            } => self.attach(endpoint, last_known_id.as_ref(), restored),
            MuxInput::Request { client, request } => self.handle_request(client, request),
            MuxInput::Resync {
                client,
                last_known_id,
                restored,
            } => self.resync(client, last_known_id.as_ref(), restored),
            MuxInput::Detach { client } => self.detach(client),
            MuxInput::Connectivity { online } => self.set_online(online),
            MuxInput::FetchCompleted { fetch, result } => self.on_fetch_completed(fetch, result),
            MuxInput::Shutdown => self.shutdown(),
        }
    }

    pub fn attach(
        &mut self,
        endpoint: ClientEndpoint,
        last_known_id: Option<&MessageId>,
        restored: Vec<ContentMessage>,
    ) {
        let client = endpoint.id();
        let restored = self.history.merge_restored(restored);
        let messages = self.history.since(last_known_id);
        info!(
            client_id = %client,
            replayed = messages.len(),
            restored,
            clients = self.registry.len() + 1,
            "mux: client attached"
        );
        self.registry.attach(endpoint);
        self.registry.send_to(
            client,
            ClientEvent::Snapshot {
                messages,
                connection: self.transport.state(),
            },
        );
        self.connect_if_wanted();
    }

    pub fn handle_request(&mut self, client: ClientId, request: ClientRequest) {
        let result = match request {
            ClientRequest::Join { config } => self.join(client, config),
            ClientRequest::Send { message } => self.send(client, message),
            ClientRequest::Delete { message_id } => {
                self.delete(client, &message_id);
                Ok(())
            }
            ClientRequest::Detach => {
                self.detach(client);
                Ok(())
            }
            ClientRequest::SetOnline { online } => {
                self.set_online(online);
                Ok(())
            }
            ClientRequest::Reconnect => self.reconnect(),
            ClientRequest::Resync { last_known_id } => {
                self.resync(client, last_known_id.as_ref(), Vec::new());
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(client_id = %client, code = ?err.code(), "mux: request rejected: {err}");
            self.registry
                .send_to(client, ClientEvent::Error(ApiError::from(&err)));
        }
    }

    /// The first join fixes the endpoint for the life of the process; later
    /// joins may only add eager connect.
    pub fn join(&mut self, client: ClientId, config: JoinConfig) -> Result<(), MuxError> {
        let endpoint = validate_endpoint(&config.endpoint)?;
        match self.join.as_mut() {
            Some(active) => {
                if active.endpoint != endpoint {
                    return Err(MuxError::ConfigConflict {
                        active: active.endpoint.to_string(),
                        requested: config.endpoint,
                    });
                }
                if config.eagerly_connect && !active.config.eagerly_connect {
                    active.config.eagerly_connect = true;
                    info!(client_id = %client, "mux: eager connect enabled by later join");
                }
                debug!(client_id = %client, "mux: join coalesced into active session");
            }
            None => {
                info!(
                    client_id = %client,
                    endpoint = %endpoint,
                    member_id = %config.member_id,
                    eager = config.eagerly_connect,
                    "mux: session joined"
                );
                self.join = Some(ActiveJoin { config, endpoint });
                self.session = SessionState::PendingJoin;
            }
        }
        self.connect_if_wanted();
        Ok(())
    }

    pub fn send(&mut self, client: ClientId, mut message: ContentMessage) -> Result<(), MuxError> {
        if self.join.is_none() {
            return Err(MuxError::NotJoined { operation: "send" });
        }

        if let Some(existing) = self.history.get(&message.id) {
            if existing.status != MessageStatus::Failed {
                message.edited = true;
            }
        }
        message.status = MessageStatus::Unknown;
        self.history.upsert(message.clone());
        self.broadcast(
            ClientEvent::MessageUpserted {
                message: message.clone(),
                replaces: None,
            },
            Some(client),
        );

        if let Err(err) = self.enqueue(&message) {
            if let Some(failed) = self
                .history
                .set_status(&message.id, MessageStatus::Failed)
                .cloned()
            {
                self.announce(failed, None);
            }
            return Err(err);
        }
        self.store.upsert(&message);
        debug!(
            client_id = %client,
            message_id = %message.id,
            queued = self.queue.len(),
            "mux: message queued"
        );
        self.pump();
        Ok(())
    }

    pub fn delete(&mut self, client: ClientId, message_id: &MessageId) {
        let removed = self.history.remove(message_id).is_some();
        self.queue
            .retain(|outbound| outbound.envelope.message_id() != message_id);
        self.store.delete(message_id);
        info!(client_id = %client, message_id = %message_id, removed, "mux: message deleted");
        self.broadcast(
            ClientEvent::MessageDeleted {
                message_id: message_id.clone(),
            },
            Some(client),
        );
    }

    pub fn resync(
        &mut self,
        client: ClientId,
        last_known_id: Option<&MessageId>,
        restored: Vec<ContentMessage>,
    ) {
        let restored = self.history.merge_restored(restored);
        let messages = self.history.since(last_known_id);
        debug!(client_id = %client, replayed = messages.len(), restored, "mux: client resync");
        self.registry.send_to(
            client,
            ClientEvent::Snapshot {
                messages,
                connection: self.transport.state(),
            },
        );
    }

    pub fn detach(&mut self, client: ClientId) {
        if !self.registry.detach(client) {
            debug!(client_id = %client, "mux: detach for unknown client");
            return;
        }
        info!(client_id = %client, remaining = self.registry.len(), "mux: client detached");
        if self.registry.is_empty() {
            self.teardown();
        }
    }

    pub fn set_online(&mut self, online: bool) {
        if self.online != online {
            info!(online, "mux: connectivity changed");
        }
        self.online = online;
        if online {
            self.connect_if_wanted();
            return;
        }

        self.policy.cancel();
        match self.transport.state() {
            ConnectionState::Open => {
                warn!("mux: transport still open after going offline; forcing close");
                self.transport.close(CLOSE_OFFLINE_WHILE_OPEN, "offline while open");
            }
            ConnectionState::Connecting => self.transport.close(CLOSE_OFFLINE, "offline"),
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
        if self.session == SessionState::BackingOff {
            self.session = SessionState::Closed;
        }
    }

    pub fn reconnect(&mut self) -> Result<(), MuxError> {
        if self.join.is_none() {
            return Err(MuxError::NotJoined {
                operation: "reconnect",
            });
        }
        info!("mux: explicit reconnect requested");
        self.request_connect();
        Ok(())
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.attempt != Some(event.attempt()) {
            debug!(
                attempt = event.attempt(),
                current = ?self.attempt,
                "mux: ignoring event from a stale attempt"
            );
            return;
        }

        let now = Instant::now();
        match event {
            TransportEvent::Opened { attempt } => {
                self.policy.on_open(now);
                self.session = SessionState::Joined;
                info!(attempt, queued = self.queue.len(), "mux: transport open");
                self.broadcast(ClientEvent::Online, None);
                self.flush();
            }
            TransportEvent::Message { bytes, .. } => self.on_frame(&bytes),
            TransportEvent::Error { attempt, reason } => {
                warn!(attempt, "mux: transport error: {reason}");
            }
            TransportEvent::Closed {
                attempt,
                code,
                reason,
            } => self.on_closed(now, attempt, code, &reason),
        }
    }

    pub fn on_reconnect_timer(&mut self) {
        let now = Instant::now();
        if !self.policy.is_due(now) {
            return;
        }
        if self.join.is_none() || !self.online || self.registry.is_empty() {
            self.policy.cancel();
            self.session = SessionState::Closed;
            return;
        }
        info!("mux: reconnect timer fired");
        self.connect(now);
    }

    pub fn on_fetch_completed(&mut self, fetch: PendingFetch, result: Result<FetchedFile, String>) {
        let PendingFetch {
            id,
            timestamp,
            reference,
            supersedes,
        } = fetch;
        let (body, status) = match result {
            Ok(file) => (resolved_body(&reference, file), MessageStatus::Delivered),
            Err(reason) => {
                warn!(message_id = %id, url = %reference.url, "mux: binary fetch failed: {reason}");
                (unresolved_body(&reference), MessageStatus::Failed)
            }
        };
        let message = ContentMessage {
            id: id.clone(),
            timestamp,
            status,
            edited: false,
            payload: MessagePayload::File(body),
        };
        self.publish(message);

        if supersedes.is_empty() {
            return;
        }
        info!(message_id = %id, consolidated = supersedes.len(), "mux: files consolidated");
        for superseded in supersedes {
            if superseded == id {
                continue;
            }
            self.history.remove(&superseded);
            self.store.delete(&superseded);
            self.broadcast(
                ClientEvent::MessageDeleted {
                    message_id: superseded,
                },
                None,
            );
        }
    }

    pub fn shutdown(&mut self) {
        info!(clients = self.registry.len(), "mux: shutting down");
        self.policy.cancel();
        if self.transport.state() != ConnectionState::Closed {
            self.transport.close(CLOSE_GOING_AWAY, "shutting down");
        }
    }

    fn on_closed(&mut self, now: Instant, attempt: AttemptId, code: u16, reason: &str) {
        self.attempt = None;
        if let Some(session) = self.policy.session_duration(now) {
            self.broadcast(
                ClientEvent::Offline {
                    session_duration_ms: session.as_millis() as u64,
                },
                None,
            );
        }

        let listeners = self.join.is_some() && !self.registry.is_empty();
        match self.policy.on_close(now, self.online, listeners) {
            CloseDecision::ReconnectAt(at) if at <= now => {
                info!(attempt, code, reason, "mux: transport closed; reconnecting");
                self.connect(now);
            }
            CloseDecision::ReconnectAt(at) => {
                self.session = SessionState::BackingOff;
                info!(
                    attempt,
                    code,
                    reason,
                    delay_ms = at.saturating_duration_since(now).as_millis() as u64,
                    "mux: transport closed; reconnect scheduled"
                );
            }
            CloseDecision::TearDown => {
                self.session = SessionState::Closed;
                info!(
                    attempt,
                    code,
                    reason,
                    online = self.online,
                    clients = self.registry.len(),
                    "mux: transport closed; session torn down"
                );
            }
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        let frame = match self.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(len = bytes.len(), "mux: {err}");
                self.broadcast(
                    ClientEvent::Error(ApiError::new(ErrorCode::Decode, err.to_string())),
                    None,
                );
                return;
            }
        };

        match frame {
            BackendFrame::Ack {
                local_id,
                canonical_id,
                timestamp,
            } => self.on_ack(local_id, canonical_id, timestamp),
            BackendFrame::Error { code, reason } => {
                warn!(code, "mux: backend error: {reason}");
                self.broadcast(
                    ClientEvent::Error(ApiError::new(
                        ErrorCode::Backend,
                        format!("{code}: {reason}"),
                    )),
                    None,
                );
            }
            BackendFrame::Plaintext {
                id,
                timestamp,
                text,
                edited,
            } => self.publish(ContentMessage {
                id,
                timestamp,
                status: MessageStatus::Delivered,
                edited,
                payload: MessagePayload::Plaintext { text },
            }),
            BackendFrame::Binary {
                id,
                timestamp,
                reference,
            } => self.start_fetch(PendingFetch {
                id,
                timestamp,
                reference,
                supersedes: Vec::new(),
            }),
            BackendFrame::Zipped {
                id,
                timestamp,
                reference,
                supersedes,
            } => self.start_fetch(PendingFetch {
                id,
                timestamp,
                reference,
                supersedes,
            }),
            BackendFrame::UploadFailed { local_id, reason } => {
                warn!(message_id = %local_id, "mux: upload failed: {reason}");
                if let Some(failed) = self
                    .history
                    .set_status(&local_id, MessageStatus::Failed)
                    .cloned()
                {
                    self.announce(failed, None);
                }
            }
        }
    }

    fn on_ack(&mut self, local_id: MessageId, canonical_id: MessageId, timestamp: DateTime<Utc>) {
        let Some(message) = self
            .history
            .acknowledge(&local_id, &canonical_id, timestamp)
            .cloned()
        else {
            warn!(
                local_id = %local_id,
                canonical_id = %canonical_id,
                "mux: ack matches no local message; relaying as is"
            );
            self.broadcast(
                ClientEvent::Acknowledged {
                    local_id,
                    canonical_id,
                    timestamp,
                },
                None,
            );
            return;
        };

        debug!(local_id = %local_id, canonical_id = %canonical_id, "mux: message acknowledged");
        let replaces = if local_id != canonical_id {
            self.store.delete(&local_id);
            Some(local_id)
        } else {
            None
        };
        self.announce(message, replaces);
    }

    fn start_fetch(&mut self, fetch: PendingFetch) {
        debug!(message_id = %fetch.id, url = %fetch.reference.url, "mux: fetching binary content");
        let fetcher = Arc::clone(&self.fetcher);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = fetcher
                .fetch(&fetch.reference)
                .await
                .map_err(|err| format!("{err:#}"));
            let _ = inbox.send(MuxInput::FetchCompleted { fetch, result });
        });
    }

    /// Records a message in history and tells everyone about it.
    fn publish(&mut self, message: ContentMessage) {
        self.history.upsert(message.clone());
        self.announce(message, None);
    }

    fn announce(&mut self, message: ContentMessage, replaces: Option<MessageId>) {
        self.store.upsert(&message);
        self.broadcast(ClientEvent::MessageUpserted { message, replaces }, None);
    }

    fn broadcast(&mut self, event: ClientEvent, exclude: Option<ClientId>) {
        let had_clients = !self.registry.is_empty();
        self.registry.broadcast(&event, exclude);
        if had_clients && self.registry.is_empty() {
            self.teardown();
        }
    }

    fn enqueue(&mut self, message: &ContentMessage) -> Result<(), MuxError> {
        let envelope = envelope_for(message);
        let frame = self
            .codec
            .encode(&envelope)
            .map_err(|err| MuxError::Encode {
                message_id: message.id.to_string(),
                reason: err.to_string(),
            })?;
        self.queue.enqueue(Outbound { envelope, frame })?;
        Ok(())
    }

    fn pump(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        if self.transport.state() == ConnectionState::Open {
            self.flush();
        } else if self.online {
            self.request_connect();
        }
    }

    fn flush(&mut self) {
        let transport = &mut self.transport;
        let report = self
            .queue
            .flush(|outbound| transport.send(outbound.frame.clone()));
        if report.sent > 0 {
            debug!(sent = report.sent, remaining = report.remaining, "mux: flushed outgoing queue");
        }
        if let Some(err) = report.failure {
            debug!(remaining = report.remaining, "mux: flush stopped: {err}");
            if self.online {
                self.request_connect();
            }
        }
    }

    fn connect_if_wanted(&mut self) {
        let eager = self
            .join
            .as_ref()
            .is_some_and(|join| join.config.eagerly_connect);
        if ReconnectionPolicy::wants_connection(
            !self.registry.is_empty(),
            !self.queue.is_empty(),
            eager,
        ) {
            self.request_connect();
        }
    }

    fn request_connect(&mut self) {
        if self.join.is_none() || !self.online || self.registry.is_empty() {
            return;
        }
        if self.transport.state() != ConnectionState::Closed {
            return;
        }
        let now = Instant::now();
        match self.policy.request_connect(now) {
            ConnectDecision::ConnectNow => self.connect(now),
            ConnectDecision::ConnectAt(at) => {
                self.session = SessionState::BackingOff;
                debug!(
                    delay_ms = at.saturating_duration_since(now).as_millis() as u64,
                    "mux: connection deferred until reconnect floor passes"
                );
            }
            ConnectDecision::AlreadyActive => {}
        }
    }

    fn connect(&mut self, now: Instant) {
        let Some(join) = self.join.as_ref() else {
            return;
        };
        let url = connect_url(&join.endpoint, &join.config);
        self.policy.on_attempt(now);
        let attempt = self.transport.open(&url, &self.options.subprotocol);
        self.attempt = Some(attempt);
        self.session = SessionState::PendingJoin;
        info!(attempt, "mux: opening transport");
    }

    fn teardown(&mut self) {
        self.policy.cancel();
        self.session = SessionState::Closed;
        if self.transport.state() != ConnectionState::Closed {
            info!("mux: no clients left; closing transport");
            self.transport
                .close(CLOSE_NO_LISTENERS, CLOSE_REASON_NO_LISTENERS);
        }
    }
}

fn envelope_for(message: &ContentMessage) -> OutgoingEnvelope {
    match &message.payload {
        MessagePayload::Plaintext { .. } => OutgoingEnvelope::Message {
            message: message.clone(),
        },
        MessagePayload::File(body) => OutgoingEnvelope::UploadIntent {
            local_id: message.id.clone(),
            timestamp: message.timestamp,
            file_name: body.file_ref.name.clone(),
            mime_type: body.file_ref.mime_type.clone(),
            size_bytes: body.file_ref.size_bytes,
            batch_id: body.batch_id.clone(),
            total_files: body.total_files,
        },
    }
}

#[cfg(test)]
#[path = "tests/multiplexer_tests.rs"]
mod tests;
