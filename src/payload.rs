use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::media::ProcessedMedia;
use crate::platform::{Attachment, ChatInfo, EntityInfo, ForwardInfo, InboundMessage, SenderInfo};

/// The envelope POSTed to the webhook. Built once, never modified afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload {
    pub message_id: i64,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub chat: ChatInfo,
    pub sender: SenderInfo,
    pub reply_to_message_id: Option<i64>,
    pub forward: Option<ForwardInfo>,
    pub media: Option<Attachment>,
    pub entities: Option<Vec<EntityInfo>>,
    pub is_outgoing: bool,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_files: Option<Vec<ProcessedMedia>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_media_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_group_messages: Option<Vec<GroupMessageSummary>>,
}

/// One album item as listed in a group payload.
#[derive(Debug, Clone, Serialize)]
pub struct GroupMessageSummary {
    pub message_id: i64,
    pub text: Option<String>,
    pub media: Option<Attachment>,
}

impl CallbackPayload {
    /// Identifier used in logs: the album id for groups, the message id otherwise.
    pub fn diagnostic_id(&self) -> String {
        match &self.media_group_id {
            Some(group_id) => format!("group {}", group_id),
            None => self.message_id.to_string(),
        }
    }
}

fn envelope(message: &InboundMessage, media_files: Vec<ProcessedMedia>) -> CallbackPayload {
    CallbackPayload {
        message_id: message.message_id,
        date: message.date,
        text: message.text.clone(),
        chat: message.chat.clone(),
        sender: message.sender.clone(),
        reply_to_message_id: message.reply_to_message_id,
        forward: message.forward.clone(),
        media: message.attachment.clone(),
        entities: (!message.entities.is_empty()).then(|| message.entities.clone()),
        is_outgoing: message.is_outgoing,
        received_at: Utc::now(),
        media_files: (!media_files.is_empty()).then_some(media_files),
        is_media_group: false,
        media_group_id: None,
        media_group_messages: None,
    }
}

/// Payload for a message that is not part of an album.
pub fn build_single(message: &InboundMessage, media: Option<ProcessedMedia>) -> CallbackPayload {
    envelope(message, media.into_iter().collect())
}

/// Payload for a whole album, using the first message as the envelope.
/// Returns `None` for an empty group.
pub fn build_group(
    group_id: &str,
    messages: &[InboundMessage],
    media_files: Vec<ProcessedMedia>,
) -> Option<CallbackPayload> {
    let first = messages.first()?;
    let mut payload = envelope(first, media_files);
    payload.is_media_group = true;
    payload.media_group_id = Some(group_id.to_string());
    payload.media_group_messages = Some(
        messages
            .iter()
            .map(|m| GroupMessageSummary {
                message_id: m.message_id,
                text: m.text.clone(),
                media: m.attachment.clone(),
            })
            .collect(),
    );
    Some(payload)
}
