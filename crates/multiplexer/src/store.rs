use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{domain::MessageId, protocol::ContentMessage};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

/// Durable message storage, consulted when a client attaches or resyncs and
/// written behind every history mutation.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages stored after `last_known_id` in append order; everything when
    /// `last_known_id` is `None` or unknown to the store.
    async fn load_since(&self, last_known_id: Option<&MessageId>) -> Result<Vec<ContentMessage>>;
    async fn upsert(&self, message: &ContentMessage) -> Result<()>;
    async fn delete(&self, message_id: &MessageId) -> Result<()>;
}

/// Store used when persistence is not configured.
pub struct EphemeralStore;

#[async_trait]
impl MessageStore for EphemeralStore {
    async fn load_since(&self, _last_known_id: Option<&MessageId>) -> Result<Vec<ContentMessage>> {
        Ok(Vec::new())
    }

    async fn upsert(&self, _message: &ContentMessage) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _message_id: &MessageId) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCommand {
    Upsert(ContentMessage),
    Delete(MessageId),
}

/// Non-blocking front of the store: commands are queued from handlers and
/// applied by one writer task in the order they were issued.
#[derive(Debug, Clone)]
pub struct StoreWriter {
    commands: Option<mpsc::UnboundedSender<StoreCommand>>,
}

impl StoreWriter {
    pub fn spawn(store: Arc<dyn MessageStore>) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_store_writer(store, receiver));
        (
            Self {
                commands: Some(commands),
            },
            task,
        )
    }

    pub fn from_sender(commands: mpsc::UnboundedSender<StoreCommand>) -> Self {
        Self {
            commands: Some(commands),
        }
    }

    /// A writer that discards everything.
    pub fn disabled() -> Self {
        Self { commands: None }
    }

    pub fn upsert(&self, message: &ContentMessage) {
        self.submit(StoreCommand::Upsert(message.clone()));
    }

    pub fn delete(&self, message_id: &MessageId) {
        self.submit(StoreCommand::Delete(message_id.clone()));
    }

    fn submit(&self, command: StoreCommand) {
        let Some(commands) = &self.commands else {
            return;
        };
        if commands.send(command).is_err() {
            warn!("store: writer task is gone; dropping command");
        }
    }
}

async fn run_store_writer(
    store: Arc<dyn MessageStore>,
    mut commands: mpsc::UnboundedReceiver<StoreCommand>,
) {
    while let Some(command) = commands.recv().await {
        let result = match &command {
            StoreCommand::Upsert(message) => store.upsert(message).await,
            StoreCommand::Delete(message_id) => store.delete(message_id).await,
        };
        if let Err(err) = result {
            warn!(?command, "store: write failed: {err:#}");
        }
    }
    debug!("store: writer stopped");
}
