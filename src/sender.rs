use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::platform::{ChatRef, Transport};

const IMAGE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// One outbound message: images, a caption, or both.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundMessage {
    pub chat_id: ChatRef,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub success: bool,
    pub message_ids: Vec<i64>,
    pub chat_id: ChatRef,
    pub error: Option<String>,
}

impl SendResult {
    fn failed(chat_id: ChatRef, error: String) -> Self {
        Self {
            success: false,
            message_ids: Vec::new(),
            chat_id,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<SendResult>,
}

/// Downloads images from URLs and posts them to chats through the transport.
pub struct Sender {
    transport: Arc<dyn Transport>,
    client: reqwest::Client,
}

impl Sender {
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(IMAGE_DOWNLOAD_TIMEOUT)
            .build()
            .context("Failed to build image download client")?;
        Ok(Self { transport, client })
    }

    async fn download_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch image {}", url))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            bail!("Image {} returned HTTP {}", url, status.as_u16());
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read image {}", url))?;
        Ok(bytes.to_vec())
    }

    async fn try_send(&self, message: &OutboundMessage) -> Result<Vec<i64>> {
        let caption = message.caption.clone().filter(|c| !c.is_empty());
        if message.image_urls.is_empty() && caption.is_none() {
            bail!("Message needs at least one image or a caption");
        }

        let mut images = Vec::with_capacity(message.image_urls.len());
        for url in &message.image_urls {
            images.push(self.download_image(url).await?);
        }

        self.transport
            .send_message(&message.chat_id, images, caption)
            .await
    }

    /// Send one message. Failures are reported in the result, never raised.
    pub async fn send(&self, message: &OutboundMessage) -> SendResult {
        match self.try_send(message).await {
            Ok(message_ids) => SendResult {
                success: true,
                message_ids,
                chat_id: message.chat_id.clone(),
                error: None,
            },
            Err(e) => {
                warn!("Failed to send message to {}: {:#}", message.chat_id, e);
                SendResult::failed(message.chat_id.clone(), format!("{:#}", e))
            }
        }
    }

    /// Send every message in order and summarize the outcomes.
    pub async fn send_batch(&self, messages: &[OutboundMessage]) -> BatchResult {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.send(message).await);
        }

        let successful = results.iter().filter(|r| r.success).count();
        let total = results.len();
        info!("Sent {}/{} outbound message(s)", successful, total);

        BatchResult {
            total,
            successful,
            failed: total - successful,
            results,
        }
    }
}
