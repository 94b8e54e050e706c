use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callback::CallbackDispatcher;
use crate::config::Config;
use crate::groups::{GroupSink, MediaGroupBuffer};
use crate::media::{MediaInspector, MediaPolicy, ProcessedMedia};
use crate::payload::{build_group, build_single, CallbackPayload};
use crate::platform::{InboundMessage, Transport};
use crate::typing::TypingRegistry;

fn chat_label(payload: &CallbackPayload) -> &str {
    payload.chat.title.as_deref().unwrap_or("Private Chat")
}

fn media_tag(media: &ProcessedMedia) -> String {
    match &media.violation {
        Some(violation) => format!(" [{} SKIPPED: {}]", media.kind, violation.kind.as_str()),
        None => format!(" [{}]", media.kind),
    }
}

/// Turns inbound messages into payloads and hands them to the dispatcher.
pub struct Forwarder {
    inspector: MediaInspector,
    dispatcher: Arc<CallbackDispatcher>,
}

impl Forwarder {
    pub fn new(inspector: MediaInspector, dispatcher: Arc<CallbackDispatcher>) -> Self {
        Self {
            inspector,
            dispatcher,
        }
    }

    /// Forward a message that is not part of an album. Returns whether it was delivered.
    pub async fn forward_single(&self, message: InboundMessage) -> bool {
        let media = self.inspector.inspect(&message).await;
        let tag = media.as_ref().map(media_tag).unwrap_or_default();
        let payload = build_single(&message, media);

        let preview: String = payload
            .text
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(50)
            .collect();
        info!(
            "New message from {} in {}: {}...{}",
            payload.sender.name,
            chat_label(&payload),
            preview,
            tag
        );

        self.dispatcher.deliver(&payload).await
    }

    /// Forward a whole album as one payload. Returns whether it was delivered.
    pub async fn forward_group(&self, group_id: &str, messages: Vec<InboundMessage>) -> bool {
        info!(
            "Processing media group {} with {} items",
            group_id,
            messages.len()
        );

        let mut media_files = Vec::new();
        for message in &messages {
            if let Some(media) = self.inspector.inspect(message).await {
                media_files.push(media);
            }
        }
        let downloaded = media_files.iter().filter(|m| m.downloaded).count();
        let skipped = media_files.len() - downloaded;

        let Some(payload) = build_group(group_id, &messages, media_files) else {
            debug!("Media group {} was empty, nothing to send", group_id);
            return false;
        };
        drop(messages);

        let skip_info = if skipped > 0 {
            format!(" ({} skipped)", skipped)
        } else {
            String::new()
        };
        info!(
            "Media group from {} in {}: {} downloaded{}",
            payload.sender.name,
            chat_label(&payload),
            downloaded,
            skip_info
        );

        self.dispatcher.deliver(&payload).await
    }
}

#[async_trait]
impl GroupSink for Forwarder {
    async fn flush_group(&self, group_id: String, messages: Vec<InboundMessage>) {
        let outcome = AssertUnwindSafe(self.forward_group(&group_id, messages))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            error!("Panic while processing media group {}", group_id);
        }
    }
}

/// Routes the inbound stream and owns every component's lifecycle.
pub struct IngestionLoop {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<CallbackDispatcher>,
    forwarder: Arc<Forwarder>,
    groups: MediaGroupBuffer,
    typing: Arc<TypingRegistry>,
}

impl IngestionLoop {
    pub fn new(transport: Arc<dyn Transport>, config: &Config, typing: Arc<TypingRegistry>) -> Self {
        let dispatcher = Arc::new(CallbackDispatcher::new(&config.callback));
        let inspector = MediaInspector::new(transport.clone(), MediaPolicy::from(&config.media));
        let forwarder = Arc::new(Forwarder::new(inspector, dispatcher.clone()));
        let groups = MediaGroupBuffer::new(config.media.group_timeout(), forwarder.clone());

        Self {
            transport,
            dispatcher,
            forwarder,
            groups,
            typing,
        }
    }

    pub async fn start(&self) {
        self.dispatcher.start().await;
    }

    /// Route one message: albums are buffered, everything else is forwarded at once.
    pub async fn handle(&self, message: InboundMessage) {
        if let Some(group_id) = message.media_group_id.clone() {
            self.groups.append(&group_id, message).await;
            return;
        }

        let forwarder = self.forwarder.clone();
        let message_id = message.message_id;
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(forwarder.forward_single(message))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!("Panic while handling message {}", message_id);
            }
        });
    }

    /// Consume inbound messages until the stream ends or `shutdown` fires.
    pub async fn run(&self, mut events: mpsc::Receiver<InboundMessage>, shutdown: CancellationToken) {
        info!("Listening for incoming messages...");
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = events.recv() => match message {
                    Some(message) => message,
                    None => {
                        info!("Inbound stream closed");
                        break;
                    }
                },
            };
            self.handle(message).await;
        }
    }

    /// Tear down in dependency order: no flush of pending albums, typing tasks
    /// cleaned up, HTTP client released, then the transport disconnected.
    pub async fn shutdown(&self) {
        self.groups.shutdown().await;
        self.typing.shutdown().await;
        self.dispatcher.stop().await;
        if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to disconnect transport: {:#}", e);
        }
        info!("Client stopped.");
    }
}
