use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::platform::InboundMessage;

/// Receives a complete album once its debounce window has closed.
#[async_trait]
pub trait GroupSink: Send + Sync {
    async fn flush_group(&self, group_id: String, messages: Vec<InboundMessage>);
}

struct GroupBuffer {
    messages: Vec<InboundMessage>,
    /// Generation of the only timer allowed to flush this buffer
    generation: u64,
    token: CancellationToken,
}

type GroupMap = Arc<Mutex<HashMap<String, GroupBuffer>>>;

/// Collects album items by group id and flushes each album once no new item
/// has arrived for the debounce period.
pub struct MediaGroupBuffer {
    debounce: Duration,
    sink: Arc<dyn GroupSink>,
    groups: GroupMap,
    next_generation: AtomicU64,
}

impl MediaGroupBuffer {
    pub fn new(debounce: Duration, sink: Arc<dyn GroupSink>) -> Self {
        Self {
            debounce,
            sink,
            groups: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Add one album item and restart the group's debounce timer.
    pub async fn append(&self, group_id: &str, message: InboundMessage) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let mut groups = self.groups.lock().await;
        let buffer = groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupBuffer {
                messages: Vec::new(),
                generation,
                token: CancellationToken::new(),
            });
        buffer.messages.push(message);
        buffer.token.cancel();
        buffer.token = token.clone();
        buffer.generation = generation;

        debug!(
            "Buffered message for media group {} (total: {})",
            group_id,
            buffer.messages.len()
        );

        tokio::spawn(run_timer(
            self.groups.clone(),
            self.sink.clone(),
            group_id.to_string(),
            generation,
            token,
            self.debounce,
        ));
    }

    pub async fn pending_groups(&self) -> usize {
        self.groups.lock().await.len()
    }

    /// Cancel all pending timers and discard their buffers without flushing.
    pub async fn shutdown(&self) -> usize {
        let mut groups = self.groups.lock().await;
        let discarded = groups.len();
        for (_, buffer) in groups.drain() {
            buffer.token.cancel();
        }
        if discarded > 0 {
            info!("Discarded {} pending media group(s)", discarded);
        }
        discarded
    }
}

async fn run_timer(
    groups: GroupMap,
    sink: Arc<dyn GroupSink>,
    group_id: String,
    generation: u64,
    token: CancellationToken,
    debounce: Duration,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(debounce) => {}
    }

    let messages = {
        let mut groups = groups.lock().await;
        // A newer append may have slipped in between the sleep and the lock.
        let current = groups
            .get(&group_id)
            .is_some_and(|b| b.generation == generation && !b.token.is_cancelled());
        if !current {
            debug!("Superseded timer for media group {} exiting", group_id);
            return;
        }
        match groups.remove(&group_id) {
            Some(buffer) => buffer.messages,
            None => return,
        }
    };

    sink.flush_group(group_id, messages).await;
}
