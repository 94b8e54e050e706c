use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::platform::{ChatAction, ChatRef, Transport};

struct TypingTask {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TypingTask {
    fn is_live(&self) -> bool {
        !self.handle.is_finished() && !self.token.is_cancelled()
    }
}

type TaskMap = Arc<Mutex<HashMap<String, TypingTask>>>;

/// Per-chat typing indicators, at most one background task per chat.
///
/// A second `start` for the same chat cancels the running task and replaces it.
/// Tasks remove themselves from the map when they end, unless they have
/// already been replaced.
pub struct TypingRegistry {
    transport: Arc<dyn Transport>,
    refresh: Option<Duration>,
    tasks: TaskMap,
    next_id: AtomicU64,
}

impl TypingRegistry {
    pub fn new(transport: Arc<dyn Transport>, refresh: Option<Duration>) -> Self {
        Self {
            transport,
            refresh,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Show "typing" in `chat` for `duration`, replacing any running indicator.
    pub async fn start(&self, chat: &ChatRef, duration: Duration) {
        let key = chat.key();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.remove(&key) {
            if previous.is_live() {
                debug!("Resetting typing task for chat {}", key);
            }
            previous.token.cancel();
        }

        let handle = tokio::spawn(run_typing(
            self.transport.clone(),
            self.tasks.clone(),
            chat.clone(),
            id,
            duration,
            self.refresh,
            token.clone(),
        ));
        tasks.insert(key, TypingTask { id, token, handle });
    }

    /// Stop the indicator in `chat` right away.
    ///
    /// Returns whether a running task was found. The cancel signal is sent
    /// either way, which also clears indicators started outside this registry.
    pub async fn cancel(&self, chat: &ChatRef) -> bool {
        let key = chat.key();
        let cancelled_task = {
            let tasks = self.tasks.lock().await;
            match tasks.get(&key) {
                Some(task) if task.is_live() => {
                    task.token.cancel();
                    true
                }
                _ => false,
            }
        };

        if let Err(e) = self
            .transport
            .send_chat_action(chat, ChatAction::Cancel)
            .await
        {
            warn!("Failed to send typing cancel for chat {}: {:#}", key, e);
        }

        cancelled_task
    }

    pub async fn is_active(&self, chat: &ChatRef) -> bool {
        self.tasks
            .lock()
            .await
            .get(&chat.key())
            .is_some_and(TypingTask::is_live)
    }

    pub async fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|task| task.is_live())
            .count()
    }

    /// Cancel every task and wait for their cleanup signals to go out.
    pub async fn shutdown(&self) {
        let drained: Vec<TypingTask> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, task)| task).collect()
        };
        if drained.is_empty() {
            return;
        }

        debug!("Cancelling {} typing task(s)", drained.len());
        let handles: Vec<JoinHandle<()>> = drained
            .into_iter()
            .map(|task| {
                task.token.cancel();
                task.handle
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Typing task ended abnormally: {}", e);
            }
        }
    }
}

async fn send_typing(transport: &dyn Transport, chat: &ChatRef) {
    if let Err(e) = transport.send_chat_action(chat, ChatAction::Typing).await {
        warn!("Typing task error for chat {}: {:#}", chat, e);
    }
}

async fn run_typing(
    transport: Arc<dyn Transport>,
    tasks: TaskMap,
    chat: ChatRef,
    id: u64,
    duration: Duration,
    refresh: Option<Duration>,
    token: CancellationToken,
) {
    send_typing(transport.as_ref(), &chat).await;

    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait = refresh.map_or(remaining, |r| r.min(remaining));
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        if refresh.is_some() && Instant::now() < deadline {
            send_typing(transport.as_ref(), &chat).await;
        }
    }

    // Runs on every exit path: completion and cancellation alike.
    if let Err(e) = transport.send_chat_action(&chat, ChatAction::Cancel).await {
        debug!("Typing cleanup for chat {} failed: {:#}", chat, e);
    }

    let key = chat.key();
    let mut tasks = tasks.lock().await;
    if tasks.get(&key).is_some_and(|task| task.id == id) {
        tasks.remove(&key);
    }
}
