pub mod telegram;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Target chat for outbound calls: a numeric chat id or an `@username`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatRef {
    Id(i64),
    Username(String),
}

impl ChatRef {
    /// Registry key for per-chat state.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRef::Id(id) => write!(f, "{}", id),
            ChatRef::Username(name) => write!(f, "{}", name),
        }
    }
}

/// Chat presence signal sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
    Cancel,
}

impl fmt::Display for ChatAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatAction::Typing => write!(f, "typing"),
            ChatAction::Cancel => write!(f, "cancel"),
        }
    }
}

/// Connection to the messaging backend.
///
/// Inbound messages arrive on the channel the transport was built with;
/// everything else the core needs from the backend goes through this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the raw bytes behind a file handle.
    async fn fetch_media(&self, file: &FileRef) -> Result<Vec<u8>>;

    async fn send_chat_action(&self, chat: &ChatRef, action: ChatAction) -> Result<()>;

    /// Send images (as a photo or album) or a plain text message.
    /// Returns the ids of the messages that were created.
    async fn send_message(
        &self,
        chat: &ChatRef,
        images: Vec<Vec<u8>>,
        caption: Option<String>,
    ) -> Result<Vec<i64>>;

    /// Stop receiving updates. Safe to call more than once.
    async fn disconnect(&self) -> Result<()>;
}

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Voice,
    Document,
    Sticker,
    Animation,
    Contact,
    Location,
    Webpage,
    Poll,
    Unknown,
}

impl MediaKind {
    /// Kinds backed by a file that can be downloaded.
    pub const DOWNLOADABLE: [MediaKind; 7] = [
        MediaKind::Photo,
        MediaKind::Video,
        MediaKind::Audio,
        MediaKind::Voice,
        MediaKind::Document,
        MediaKind::Sticker,
        MediaKind::Animation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
            MediaKind::Animation => "animation",
            MediaKind::Contact => "contact",
            MediaKind::Location => "location",
            MediaKind::Webpage => "webpage",
            MediaKind::Poll => "poll",
            MediaKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "photo" => Ok(MediaKind::Photo),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            "voice" => Ok(MediaKind::Voice),
            "document" => Ok(MediaKind::Document),
            "sticker" => Ok(MediaKind::Sticker),
            "animation" => Ok(MediaKind::Animation),
            "contact" => Ok(MediaKind::Contact),
            "location" => Ok(MediaKind::Location),
            "webpage" => Ok(MediaKind::Webpage),
            "poll" => Ok(MediaKind::Poll),
            "unknown" => Ok(MediaKind::Unknown),
            other => anyhow::bail!("Unknown media type: '{}'", other),
        }
    }
}

/// Handle to a downloadable file on the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRef {
    #[serde(rename = "id")]
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Media attached to an inbound message. Serializes as the per-message media summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    Photo {
        #[serde(flatten)]
        file: FileRef,
        width: u32,
        height: u32,
    },
    Video {
        #[serde(flatten)]
        file: FileRef,
        mime_type: Option<String>,
        filename: Option<String>,
        duration: u32,
        width: u32,
        height: u32,
    },
    Audio {
        #[serde(flatten)]
        file: FileRef,
        mime_type: Option<String>,
        filename: Option<String>,
        duration: u32,
        title: Option<String>,
        performer: Option<String>,
    },
    Voice {
        #[serde(flatten)]
        file: FileRef,
        mime_type: Option<String>,
        duration: u32,
    },
    Document {
        #[serde(flatten)]
        file: FileRef,
        mime_type: Option<String>,
        filename: Option<String>,
    },
    Sticker {
        #[serde(flatten)]
        file: FileRef,
        alt: Option<String>,
    },
    Animation {
        #[serde(flatten)]
        file: FileRef,
        mime_type: Option<String>,
        filename: Option<String>,
        duration: u32,
        width: u32,
        height: u32,
    },
    Contact {
        phone: String,
        first_name: String,
        last_name: Option<String>,
        user_id: Option<u64>,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    Webpage {
        url: String,
        title: Option<String>,
        description: Option<String>,
    },
    Poll {
        question: String,
        answers: Vec<String>,
    },
    Unknown {
        label: String,
    },
}

/// Size, type and name facts about one attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    pub mime_type: String,
    pub size: Option<u64>,
    pub filename: Option<String>,
}

const OCTET_STREAM: &str = "application/octet-stream";

impl Attachment {
    pub fn kind(&self) -> MediaKind {
        match self {
            Attachment::Photo { .. } => MediaKind::Photo,
            Attachment::Video { .. } => MediaKind::Video,
            Attachment::Audio { .. } => MediaKind::Audio,
            Attachment::Voice { .. } => MediaKind::Voice,
            Attachment::Document { .. } => MediaKind::Document,
            Attachment::Sticker { .. } => MediaKind::Sticker,
            Attachment::Animation { .. } => MediaKind::Animation,
            Attachment::Contact { .. } => MediaKind::Contact,
            Attachment::Location { .. } => MediaKind::Location,
            Attachment::Webpage { .. } => MediaKind::Webpage,
            Attachment::Poll { .. } => MediaKind::Poll,
            Attachment::Unknown { .. } => MediaKind::Unknown,
        }
    }

    /// The file handle, if this kind of media can be downloaded at all.
    pub fn file(&self) -> Option<&FileRef> {
        match self {
            Attachment::Photo { file, .. }
            | Attachment::Video { file, .. }
            | Attachment::Audio { file, .. }
            | Attachment::Voice { file, .. }
            | Attachment::Document { file, .. }
            | Attachment::Sticker { file, .. }
            | Attachment::Animation { file, .. } => Some(file),
            Attachment::Contact { .. }
            | Attachment::Location { .. }
            | Attachment::Webpage { .. }
            | Attachment::Poll { .. }
            | Attachment::Unknown { .. } => None,
        }
    }

    pub fn descriptor(&self) -> MediaDescriptor {
        let (mime_type, filename) = match self {
            Attachment::Photo { .. } => (Some("image/jpeg".to_string()), None),
            Attachment::Sticker { .. } => (Some("image/webp".to_string()), None),
            Attachment::Voice { mime_type, .. } => (mime_type.clone(), None),
            Attachment::Video {
                mime_type,
                filename,
                ..
            }
            | Attachment::Audio {
                mime_type,
                filename,
                ..
            }
            | Attachment::Document {
                mime_type,
                filename,
                ..
            }
            | Attachment::Animation {
                mime_type,
                filename,
                ..
            } => (mime_type.clone(), filename.clone()),
            _ => (None, None),
        };

        MediaDescriptor {
            kind: self.kind(),
            mime_type: mime_type.unwrap_or_else(|| OCTET_STREAM.to_string()),
            size: self.file().and_then(|f| f.size),
            filename,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatInfo {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    pub title: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SenderInfo {
    pub id: Option<i64>,
    pub name: String,
    pub username: Option<String>,
    pub is_bot: bool,
}

impl SenderInfo {
    pub fn unknown() -> Self {
        Self {
            id: None,
            name: "Unknown".to_string(),
            username: None,
            is_bot: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardInfo {
    pub date: Option<DateTime<Utc>>,
    pub from_id: Option<i64>,
    pub from_name: Option<String>,
    pub channel_id: Option<i64>,
    pub channel_post: Option<i64>,
}

/// A formatting or link entity inside the message text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A message received from the backend, detached from the transport's own types.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: i64,
    /// Set when the message is one item of an album.
    pub media_group_id: Option<String>,
    pub date: Option<DateTime<Utc>>,
    /// Message text, or the caption for media messages.
    pub text: Option<String>,
    pub chat: ChatInfo,
    pub sender: SenderInfo,
    pub reply_to_message_id: Option<i64>,
    pub forward: Option<ForwardInfo>,
    pub entities: Vec<EntityInfo>,
    pub is_outgoing: bool,
    pub attachment: Option<Attachment>,
}
