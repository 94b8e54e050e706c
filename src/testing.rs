//! Test doubles shared by the unit tests: a recording transport and a local webhook.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use serde_json::Value;

use crate::platform::{
    Attachment, ChatAction, ChatInfo, ChatRef, ChatType, FileRef, InboundMessage, SenderInfo,
    Transport,
};

#[derive(Default)]
pub struct FakeTransport {
    media: Mutex<HashMap<String, Vec<u8>>>,
    fetches: Mutex<Vec<String>>,
    actions: Mutex<Vec<(String, ChatAction)>>,
    sent: Mutex<Vec<(String, usize, Option<String>)>>,
    fail_actions: AtomicBool,
    disconnected: AtomicBool,
    panic_on: Mutex<Option<String>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_media(&self, file_id: &str, bytes: Vec<u8>) {
        self.media
            .lock()
            .unwrap()
            .insert(file_id.to_string(), bytes);
    }

    /// Make `fetch_media` panic for this file id.
    pub fn set_panic_on(&self, file_id: &str) {
        *self.panic_on.lock().unwrap() = Some(file_id.to_string());
    }

    pub fn set_fail_actions(&self, fail: bool) {
        self.fail_actions.store(fail, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<(String, ChatAction)> {
        self.actions.lock().unwrap().clone()
    }

    pub fn count_actions(&self, key: &str, action: ChatAction) -> usize {
        self.actions()
            .iter()
            .filter(|(k, a)| k == key && *a == action)
            .count()
    }

    pub fn sent(&self) -> Vec<(String, usize, Option<String>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch_media(&self, file: &FileRef) -> Result<Vec<u8>> {
        self.fetches.lock().unwrap().push(file.file_id.clone());
        let should_panic = self.panic_on.lock().unwrap().as_deref() == Some(file.file_id.as_str());
        if should_panic {
            panic!("fetch of {} blew up", file.file_id);
        }
        let media = self.media.lock().unwrap();
        match media.get(&file.file_id) {
            Some(bytes) => Ok(bytes.clone()),
            None => anyhow::bail!("file {} not found", file.file_id),
        }
    }

    async fn send_chat_action(&self, chat: &ChatRef, action: ChatAction) -> Result<()> {
        self.actions.lock().unwrap().push((chat.key(), action));
        if self.fail_actions.load(Ordering::SeqCst) {
            anyhow::bail!("chat action rejected");
        }
        Ok(())
    }

    async fn send_message(
        &self,
        chat: &ChatRef,
        images: Vec<Vec<u8>>,
        caption: Option<String>,
    ) -> Result<Vec<i64>> {
        let count = images.len().max(1);
        self.sent
            .lock()
            .unwrap()
            .push((chat.key(), images.len(), caption));
        Ok((1..=count as i64).collect())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn text_message(id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        message_id: id,
        media_group_id: None,
        date: Some(Utc::now()),
        text: Some(text.to_string()),
        chat: ChatInfo {
            id: 42,
            chat_type: ChatType::Private,
            title: Some("Ann Lee".to_string()),
            username: Some("ann".to_string()),
        },
        sender: SenderInfo {
            id: Some(42),
            name: "Ann Lee".to_string(),
            username: Some("ann".to_string()),
            is_bot: false,
        },
        reply_to_message_id: None,
        forward: None,
        entities: Vec::new(),
        is_outgoing: false,
        attachment: None,
    }
}

pub fn photo_message(id: i64, group: Option<&str>, file_id: &str) -> InboundMessage {
    let mut message = text_message(id, &format!("photo {}", id));
    message.media_group_id = group.map(str::to_string);
    message.attachment = Some(Attachment::Photo {
        file: FileRef {
            file_id: file_id.to_string(),
            size: Some(3),
        },
        width: 640,
        height: 480,
    });
    message
}

struct HookState {
    hits: AtomicUsize,
    fail_first: usize,
    payloads: Mutex<Vec<Value>>,
}

async fn receive(State(state): State<Arc<HookState>>, Json(body): Json<Value>) -> StatusCode {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    if hit < state.fail_first {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state.payloads.lock().unwrap().push(body);
    StatusCode::OK
}

/// Local webhook that answers 500 to the first `fail_first` requests, then 200.
pub struct CaptureWebhook {
    addr: SocketAddr,
    state: Arc<HookState>,
}

impl CaptureWebhook {
    pub async fn spawn(fail_first: usize) -> Self {
        let state = Arc::new(HookState {
            hits: AtomicUsize::new(0),
            fail_first,
            payloads: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/hook", post(receive))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// Payloads that were answered with 200, in arrival order.
    pub fn payloads(&self) -> Vec<Value> {
        self.state.payloads.lock().unwrap().clone()
    }

    /// Poll until at least `count` payloads arrived or `timeout` elapsed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let payloads = self.payloads();
            if payloads.len() >= count || tokio::time::Instant::now() >= deadline {
                return payloads;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
