use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::dispatching::ShutdownToken;
use teloxide::net::Download;
use teloxide::payloads::SendPhotoSetters;
use teloxide::prelude::*;
use teloxide::types::{
    FileId, InputFile, InputMedia, InputMediaPhoto, MediaKind as TgMediaKind, MessageKind,
    Recipient,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::platform::{
    Attachment, ChatAction, ChatInfo, ChatRef, ChatType, EntityInfo, FileRef, ForwardInfo,
    InboundMessage, SenderInfo, Transport,
};

/// Telegram's hard limit for a single text message.
const MAX_TEXT_LEN: usize = 4096;

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

fn recipient(chat: &ChatRef) -> Recipient {
    match chat {
        ChatRef::Id(id) => Recipient::Id(ChatId(*id)),
        ChatRef::Username(name) => {
            let name = if name.starts_with('@') {
                name.clone()
            } else {
                format!("@{}", name)
            };
            Recipient::ChannelUsername(name)
        }
    }
}

/// Bot API transport: long-polls updates and performs outbound calls.
pub struct TelegramTransport {
    bot: Bot,
    listener: Mutex<Option<Listener>>,
}

/// Handles to the running dispatcher task.
struct Listener {
    token: ShutdownToken,
    task: AbortHandle,
}

impl TelegramTransport {
    pub fn new(token: &str) -> Self {
        Self::with_bot(Bot::new(token))
    }

    pub fn with_bot(bot: Bot) -> Self {
        Self {
            bot,
            listener: Mutex::new(None),
        }
    }

    /// Start polling and push every converted message into `events`.
    pub async fn listen(&self, events: mpsc::Sender<InboundMessage>) -> JoinHandle<()> {
        info!("Starting Telegram update listener...");

        let handler = Update::filter_message().endpoint(forward_update);

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![events])
            .default_handler(|upd| async move {
                debug!("Unhandled update: {:?}", upd.id);
            })
            .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
            .build();

        let token = dispatcher.shutdown_token();
        let handle = tokio::spawn(async move {
            dispatcher.dispatch().await;
            info!("Telegram update listener stopped");
        });

        *self.listener.lock().await = Some(Listener {
            token,
            task: handle.abort_handle(),
        });
        handle
    }
}

async fn forward_update(msg: Message, events: mpsc::Sender<InboundMessage>) -> ResponseResult<()> {
    let inbound = convert_message(&msg);
    if events.send(inbound).await.is_err() {
        warn!("Inbound channel closed, dropping message {}", msg.id.0);
    }
    Ok(())
}

fn chat_info(msg: &Message) -> ChatInfo {
    let chat = &msg.chat;
    let chat_type = if chat.is_private() {
        ChatType::Private
    } else if chat.is_channel() {
        ChatType::Channel
    } else if chat.is_supergroup() {
        ChatType::Supergroup
    } else if chat.is_group() {
        ChatType::Group
    } else {
        ChatType::Unknown
    };

    let title = match chat.title() {
        Some(title) => Some(title.to_string()),
        None => {
            let name = [chat.first_name(), chat.last_name()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            (!name.is_empty()).then_some(name)
        }
    };

    ChatInfo {
        id: chat.id.0,
        chat_type,
        title,
        username: chat.username().map(str::to_string),
    }
}

fn sender_info(msg: &Message) -> SenderInfo {
    if let Some(user) = msg.from.as_ref() {
        return SenderInfo {
            id: Some(user.id.0 as i64),
            name: user.full_name(),
            username: user.username.clone(),
            is_bot: user.is_bot,
        };
    }
    if let Some(chat) = msg.sender_chat.as_ref() {
        return SenderInfo {
            id: Some(chat.id.0),
            name: chat.title().unwrap_or("Unknown").to_string(),
            username: chat.username().map(str::to_string),
            is_bot: false,
        };
    }
    SenderInfo::unknown()
}

fn forward_info(msg: &Message) -> Option<ForwardInfo> {
    msg.forward_origin()?;

    let user = msg.forward_from_user();
    let chat = msg.forward_from_chat();
    let from_name = user
        .map(|u| u.full_name())
        .or_else(|| msg.forward_from_sender_name().map(str::to_string))
        .or_else(|| chat.and_then(|c| c.title()).map(str::to_string));

    Some(ForwardInfo {
        date: msg.forward_date(),
        from_id: user.map(|u| u.id.0 as i64),
        from_name,
        channel_id: chat.filter(|c| c.is_channel()).map(|c| c.id.0),
        channel_post: msg.forward_from_message_id().map(|id| id.0 as i64),
    })
}

fn entity_info(msg: &Message) -> Vec<EntityInfo> {
    let entities = msg.entities().or_else(|| msg.caption_entities());
    let Some(entities) = entities else {
        return Vec::new();
    };

    entities
        .iter()
        .map(|entity| {
            // The serialized kind carries the Bot API type name plus its extra fields.
            let value = serde_json::to_value(&entity.kind).unwrap_or_default();
            let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(str::to_string);
            EntityInfo {
                kind: field("type").unwrap_or_else(|| "unknown".to_string()),
                offset: entity.offset,
                length: entity.length,
                url: field("url"),
                user_id: value
                    .get("user")
                    .and_then(|u| u.get("id"))
                    .and_then(|id| id.as_u64()),
                language: field("language"),
            }
        })
        .collect()
}

fn file_ref(id: impl ToString, size: u32) -> FileRef {
    FileRef {
        file_id: id.to_string(),
        size: (size > 0).then_some(size as u64),
    }
}

fn attachment(msg: &Message) -> Option<Attachment> {
    let MessageKind::Common(common) = &msg.kind else {
        return None;
    };

    let attachment = match &common.media_kind {
        TgMediaKind::Text(_) => return None,
        TgMediaKind::Photo(p) => {
            // Sizes are listed smallest first
            let largest = p.photo.last()?;
            Attachment::Photo {
                file: file_ref(&largest.file.id, largest.file.size),
                width: largest.width,
                height: largest.height,
            }
        }
        TgMediaKind::Video(v) => Attachment::Video {
            file: file_ref(&v.video.file.id, v.video.file.size),
            mime_type: v.video.mime_type.as_ref().map(|m| m.to_string()),
            filename: v.video.file_name.clone(),
            duration: v.video.duration.seconds(),
            width: v.video.width,
            height: v.video.height,
        },
        TgMediaKind::VideoNote(v) => Attachment::Video {
            file: file_ref(&v.video_note.file.id, v.video_note.file.size),
            mime_type: Some("video/mp4".to_string()),
            filename: None,
            duration: v.video_note.duration.seconds(),
            width: v.video_note.length,
            height: v.video_note.length,
        },
        TgMediaKind::Audio(a) => Attachment::Audio {
            file: file_ref(&a.audio.file.id, a.audio.file.size),
            mime_type: a.audio.mime_type.as_ref().map(|m| m.to_string()),
            filename: a.audio.file_name.clone(),
            duration: a.audio.duration.seconds(),
            title: a.audio.title.clone(),
            performer: a.audio.performer.clone(),
        },
        TgMediaKind::Voice(v) => Attachment::Voice {
            file: file_ref(&v.voice.file.id, v.voice.file.size),
            mime_type: v.voice.mime_type.as_ref().map(|m| m.to_string()),
            duration: v.voice.duration.seconds(),
        },
        TgMediaKind::Document(d) => Attachment::Document {
            file: file_ref(&d.document.file.id, d.document.file.size),
            mime_type: d.document.mime_type.as_ref().map(|m| m.to_string()),
            filename: d.document.file_name.clone(),
        },
        TgMediaKind::Sticker(s) => Attachment::Sticker {
            file: file_ref(&s.sticker.file.id, s.sticker.file.size),
            alt: s.sticker.emoji.clone(),
        },
        TgMediaKind::Animation(a) => Attachment::Animation {
            file: file_ref(&a.animation.file.id, a.animation.file.size),
            mime_type: a.animation.mime_type.as_ref().map(|m| m.to_string()),
            filename: a.animation.file_name.clone(),
            duration: a.animation.duration.seconds(),
            width: a.animation.width,
            height: a.animation.height,
        },
        TgMediaKind::Contact(c) => Attachment::Contact {
            phone: c.contact.phone_number.clone(),
            first_name: c.contact.first_name.clone(),
            last_name: c.contact.last_name.clone(),
            user_id: c.contact.user_id.map(|id| id.0),
        },
        TgMediaKind::Location(l) => Attachment::Location {
            latitude: l.location.latitude,
            longitude: l.location.longitude,
        },
        TgMediaKind::Venue(v) => Attachment::Location {
            latitude: v.venue.location.latitude,
            longitude: v.venue.location.longitude,
        },
        TgMediaKind::Poll(p) => Attachment::Poll {
            question: p.poll.question.clone(),
            answers: p.poll.options.iter().map(|o| o.text.clone()).collect(),
        },
        #[allow(unreachable_patterns)]
        _ => Attachment::Unknown {
            label: "unsupported".to_string(),
        },
    };

    Some(attachment)
}

/// Convert a Bot API message into the transport-neutral form.
pub fn convert_message(msg: &Message) -> InboundMessage {
    InboundMessage {
        message_id: msg.id.0 as i64,
        media_group_id: msg.media_group_id().map(|id| id.to_string()),
        date: Some(msg.date),
        text: msg.text().or_else(|| msg.caption()).map(str::to_string),
        chat: chat_info(msg),
        sender: sender_info(msg),
        reply_to_message_id: msg.reply_to_message().map(|m| m.id.0 as i64),
        forward: forward_info(msg),
        entities: entity_info(msg),
        // Bot accounts only receive messages they did not send.
        is_outgoing: false,
        attachment: attachment(msg),
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn fetch_media(&self, file: &FileRef) -> Result<Vec<u8>> {
        let meta = self
            .bot
            .get_file(FileId(file.file_id.clone()))
            .await
            .with_context(|| format!("Failed to resolve file {}", file.file_id))?;

        let mut buf = Vec::new();
        self.bot
            .download_file(&meta.path, &mut buf)
            .await
            .with_context(|| format!("Failed to download file {}", file.file_id))?;
        Ok(buf)
    }

    async fn send_chat_action(&self, chat: &ChatRef, action: ChatAction) -> Result<()> {
        match action {
            ChatAction::Typing => {
                self.bot
                    .send_chat_action(recipient(chat), teloxide::types::ChatAction::Typing)
                    .await
                    .with_context(|| format!("Failed to send typing to {}", chat))?;
            }
            // The Bot API has no explicit stop; the indicator lapses on its own.
            ChatAction::Cancel => debug!("Typing indicator for {} left to expire", chat),
        }
        Ok(())
    }

    async fn send_message(
        &self,
        chat: &ChatRef,
        images: Vec<Vec<u8>>,
        caption: Option<String>,
    ) -> Result<Vec<i64>> {
        let target = recipient(chat);

        match images.len() {
            0 => {
                let text = caption.unwrap_or_default();
                let mut ids = Vec::new();
                for chunk in split_message(&text, MAX_TEXT_LEN) {
                    let sent = self
                        .bot
                        .send_message(target.clone(), chunk)
                        .await
                        .with_context(|| format!("Failed to send text to {}", chat))?;
                    ids.push(sent.id.0 as i64);
                }
                Ok(ids)
            }
            1 => {
                let bytes = images.into_iter().next().unwrap_or_default();
                let mut request = self
                    .bot
                    .send_photo(target, InputFile::memory(bytes).file_name("image.jpg"));
                if let Some(caption) = caption {
                    request = request.caption(caption);
                }
                let sent = request
                    .await
                    .with_context(|| format!("Failed to send photo to {}", chat))?;
                Ok(vec![sent.id.0 as i64])
            }
            _ => {
                let media: Vec<InputMedia> = images
                    .into_iter()
                    .enumerate()
                    .map(|(i, bytes)| {
                        let file = InputFile::memory(bytes).file_name(format!("image_{}.jpg", i));
                        let mut photo = InputMediaPhoto::new(file);
                        if i == 0 {
                            photo.caption = caption.clone();
                        }
                        InputMedia::Photo(photo)
                    })
                    .collect();
                let sent = self
                    .bot
                    .send_media_group(target, media)
                    .await
                    .with_context(|| format!("Failed to send album to {}", chat))?;
                Ok(sent.iter().map(|m| m.id.0 as i64).collect())
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Ok(());
        };
        match listener.token.shutdown() {
            Ok(done) => {
                done.await;
                info!("Telegram dispatcher shut down");
            }
            // Not dispatching yet (or already done): a graceful stop cannot
            // reach it, so the task is aborted before it starts polling.
            Err(_) => {
                debug!("Telegram dispatcher idle, aborting listener task");
                listener.task.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(extra: serde_json::Value) -> Message {
        let mut base = json!({
            "message_id": 7,
            "date": 1700000000,
            "chat": { "id": 42, "type": "private", "first_name": "Alice", "last_name": "Doe", "username": "alice" },
            "from": { "id": 1001, "is_bot": false, "first_name": "Alice", "last_name": "Doe", "username": "alice" }
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).expect("deserialize message")
    }

    #[test]
    fn test_split_short_message() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn test_split_long_message_at_newline() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_message(&text, 15);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{}\n", "a".repeat(10)));
        assert_eq!(chunks[1], "b".repeat(10));
    }

    #[test]
    fn test_split_multibyte_characters() {
        let text = "é".repeat(10);
        let chunks = split_message(&text, 5);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_recipient_mapping() {
        assert_eq!(recipient(&ChatRef::Id(-100)), Recipient::Id(ChatId(-100)));
        assert_eq!(
            recipient(&ChatRef::Username("news".to_string())),
            Recipient::ChannelUsername("@news".to_string())
        );
        assert_eq!(
            recipient(&ChatRef::Username("@news".to_string())),
            Recipient::ChannelUsername("@news".to_string())
        );
    }

    #[test]
    fn test_convert_text_message() {
        let msg = message(json!({ "text": "hello there" }));
        let inbound = convert_message(&msg);

        assert_eq!(inbound.message_id, 7);
        assert_eq!(inbound.text.as_deref(), Some("hello there"));
        assert_eq!(inbound.chat.id, 42);
        assert_eq!(inbound.chat.chat_type, ChatType::Private);
        assert_eq!(inbound.chat.title.as_deref(), Some("Alice Doe"));
        assert_eq!(inbound.sender.id, Some(1001));
        assert_eq!(inbound.sender.name, "Alice Doe");
        assert_eq!(inbound.sender.username.as_deref(), Some("alice"));
        assert!(inbound.attachment.is_none());
        assert!(inbound.media_group_id.is_none());
        assert!(inbound.forward.is_none());
        assert!(!inbound.is_outgoing);
    }

    #[test]
    fn test_convert_photo_album_item() {
        let msg = message(json!({
            "media_group_id": "album-1",
            "caption": "holiday",
            "photo": [
                { "file_id": "small", "file_unique_id": "s", "file_size": 100, "width": 90, "height": 60 },
                { "file_id": "large", "file_unique_id": "l", "file_size": 5000, "width": 1280, "height": 853 }
            ]
        }));
        let inbound = convert_message(&msg);

        assert_eq!(inbound.media_group_id.as_deref(), Some("album-1"));
        assert_eq!(inbound.text.as_deref(), Some("holiday"));
        match inbound.attachment {
            Some(Attachment::Photo { file, width, height }) => {
                assert_eq!(file.file_id, "large");
                assert_eq!(file.size, Some(5000));
                assert_eq!((width, height), (1280, 853));
            }
            other => panic!("expected photo, got {:?}", other),
        }
    }

    #[test]
    fn test_convert_document_and_voice() {
        let doc = message(json!({
            "document": {
                "file_id": "doc-1",
                "file_unique_id": "d",
                "file_name": "report.pdf",
                "mime_type": "application/pdf",
                "file_size": 2048
            }
        }));
        let descriptor = convert_message(&doc).attachment.unwrap().descriptor();
        assert_eq!(descriptor.mime_type, "application/pdf");
        assert_eq!(descriptor.filename.as_deref(), Some("report.pdf"));
        assert_eq!(descriptor.size, Some(2048));

        let voice = message(json!({
            "voice": {
                "file_id": "voice-file-id",
                "file_unique_id": "voice-unique-id",
                "duration": 3,
                "mime_type": "audio/ogg",
                "file_size": 123
            }
        }));
        match convert_message(&voice).attachment {
            Some(Attachment::Voice { file, duration, .. }) => {
                assert_eq!(file.file_id, "voice-file-id");
                assert_eq!(duration, 3);
            }
            other => panic!("expected voice, got {:?}", other),
        }
    }

    #[test]
    fn test_convert_location_has_no_file() {
        let msg = message(json!({
            "location": { "latitude": 52.52, "longitude": 13.405 }
        }));
        let attachment = convert_message(&msg).attachment.unwrap();
        assert!(attachment.file().is_none());
        assert_eq!(
            attachment,
            Attachment::Location {
                latitude: 52.52,
                longitude: 13.405
            }
        );
    }

    #[test]
    fn test_convert_group_chat_and_entities() {
        let msg = message(json!({
            "chat": { "id": -100123, "type": "supergroup", "title": "Team" },
            "text": "see https://example.com",
            "entities": [ { "type": "url", "offset": 4, "length": 19 } ],
            "reply_to_message": {
                "message_id": 3,
                "date": 1700000000,
                "chat": { "id": -100123, "type": "supergroup", "title": "Team" },
                "text": "earlier"
            }
        }));
        let inbound = convert_message(&msg);

        assert_eq!(inbound.chat.chat_type, ChatType::Supergroup);
        assert_eq!(inbound.chat.title.as_deref(), Some("Team"));
        assert_eq!(inbound.reply_to_message_id, Some(3));
        assert_eq!(inbound.entities.len(), 1);
        assert_eq!(inbound.entities[0].kind, "url");
        assert_eq!(inbound.entities[0].offset, 4);
        assert_eq!(inbound.entities[0].length, 19);
    }

    #[tokio::test]
    async fn test_disconnect_before_dispatch_starts_stops_listener() {
        let api = reqwest::Url::parse("http://127.0.0.1:9/").unwrap();
        let transport = TelegramTransport::with_bot(Bot::new("123:test").set_api_url(api));
        let (tx, _rx) = mpsc::channel(8);

        // Disconnect right away, racing the task before it starts dispatching.
        let handle = transport.listen(tx).await;
        transport.disconnect().await.unwrap();

        let finished = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        assert!(finished.is_ok(), "listener kept running after disconnect");
        assert!(transport.listener.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_without_listener_is_noop() {
        let transport = TelegramTransport::new("123:test");
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
    }
}
