use std::sync::Arc;

use anyhow::{anyhow, Result};
use shared::{
    domain::{ClientId, MessageId},
    protocol::{ClientEvent, ClientRequest, ContentMessage},
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{info, warn};

use crate::{
    codec::WireCodec,
    fetch::FileFetcher,
    multiplexer::{MuxDependencies, MuxInput, MuxOptions, Multiplexer},
    registry::ClientEndpoint,
    store::{MessageStore, StoreWriter},
    transport::{Transport, TransportEvent, WsTransport},
};

/// One attached client: its id for requests and the stream of events the
/// multiplexer addresses to it.
#[derive(Debug)]
pub struct ClientSession {
    pub id: ClientId,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Cheap, cloneable front door to a running multiplexer task.
#[derive(Clone)]
pub struct MultiplexerHandle {
    inbox: mpsc::UnboundedSender<MuxInput>,
    store: Arc<dyn MessageStore>,
}

impl MultiplexerHandle {
    /// Attaches a new client. Stored messages after `last_known_id` are
    /// loaded first so the initial snapshot covers what this process has not
    /// seen yet.
    pub async fn attach(&self, last_known_id: Option<MessageId>) -> Result<ClientSession> {
        let restored = self.load_since(last_known_id.as_ref()).await;
        let id = ClientId::random();
        let (endpoint, events) = ClientEndpoint::channel(id);
        self.submit(MuxInput::Attach {
            endpoint,
            last_known_id,
            restored,
        })?;
        Ok(ClientSession { id, events })
    }

    pub async fn request(&self, client: ClientId, request: ClientRequest) -> Result<()> {
        match request {
            ClientRequest::Resync { last_known_id } => {
                let restored = self.load_since(last_known_id.as_ref()).await;
                self.submit(MuxInput::Resync {
                    client,
                    last_known_id,
                    restored,
                })
            }
            request => self.submit(MuxInput::Request { client, request }),
        }
    }

    pub fn detach(&self, client: ClientId) -> Result<()> {
        self.submit(MuxInput::Detach { client })
    }

    pub fn set_online(&self, online: bool) -> Result<()> {
        self.submit(MuxInput::Connectivity { online })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.submit(MuxInput::Shutdown)
    }

    async fn load_since(&self, last_known_id: Option<&MessageId>) -> Vec<ContentMessage> {
        match self.store.load_since(last_known_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!("mux: failed to load stored messages: {err:#}");
                Vec::new()
            }
        }
    }

    fn submit(&self, input: MuxInput) -> Result<()> {
        self.inbox
            .send(input)
            .map_err(|_| anyhow!("multiplexer is not running"))
    }
}

/// Starts the multiplexer over a real websocket transport.
pub fn spawn_multiplexer(
    options: MuxOptions,
    codec: Arc<dyn WireCodec>,
    fetcher: Arc<dyn FileFetcher>,
    store: Arc<dyn MessageStore>,
) -> (MultiplexerHandle, JoinHandle<()>) {
    spawn_multiplexer_with(options, codec, fetcher, store, |events| {
        Box::new(WsTransport::new(events))
    })
}

/// Starts the multiplexer task. `make_transport` receives the sender the
/// transport must report its events on.
pub fn spawn_multiplexer_with<F>(
    options: MuxOptions,
    codec: Arc<dyn WireCodec>,
    fetcher: Arc<dyn FileFetcher>,
    store: Arc<dyn MessageStore>,
    make_transport: F,
) -> (MultiplexerHandle, JoinHandle<()>)
where
    F: FnOnce(mpsc::UnboundedSender<TransportEvent>) -> Box<dyn Transport>,
{
    let (inbox, inbox_rx) = mpsc::unbounded_channel();
    let (transport_events, transport_rx) = mpsc::unbounded_channel();
    let (writer, writer_task) = StoreWriter::spawn(Arc::clone(&store));

    let multiplexer = Multiplexer::new(
        options,
        MuxDependencies {
            transport: make_transport(transport_events),
            codec,
            fetcher,
            store: writer,
        },
        inbox.clone(),
    );
    let task = tokio::spawn(run_multiplexer(
        multiplexer,
        inbox_rx,
        transport_rx,
        writer_task,
    ));
    (MultiplexerHandle { inbox, store }, task)
}

async fn run_multiplexer(
    mut multiplexer: Multiplexer,
    mut inbox: mpsc::UnboundedReceiver<MuxInput>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    writer_task: JoinHandle<()>,
) {
    info!("mux: multiplexer started");
    loop {
        let deadline = multiplexer.reconnect_deadline();
        tokio::select! {
            input = inbox.recv() => match input {
                Some(MuxInput::Shutdown) | None => {
                    multiplexer.shutdown();
                    break;
                }
                Some(input) => multiplexer.handle_input(input),
            },
            Some(event) = transport_events.recv() => multiplexer.handle_transport_event(event),
            _ = wait_for(deadline) => multiplexer.on_reconnect_timer(),
        }
    }

    // Dropping the aggregate closes the store channel so pending writes drain.
    drop(multiplexer);
    if let Err(err) = writer_task.await {
        warn!("mux: store writer ended abnormally: {err}");
    }
    info!("mux: multiplexer stopped");
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/service_tests.rs"]
mod tests;
