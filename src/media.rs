use std::sync::Arc;

use base64::Engine as _;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::{MediaConfig, MediaTypeFilter, BYTES_PER_MB};
use crate::platform::{Attachment, InboundMessage, MediaDescriptor, MediaKind, Transport};

/// Why a piece of media was not downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DownloadDisabled,
    NotDownloadable,
    TypeNotEnabled,
    SizeExceeded,
    DownloadError,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::DownloadDisabled => "download_disabled",
            ViolationKind::NotDownloadable => "not_downloadable",
            ViolationKind::TypeNotEnabled => "type_not_enabled",
            ViolationKind::SizeExceeded => "size_exceeded",
            ViolationKind::DownloadError => "download_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub reason: String,
}

/// Result of inspecting one attachment: either the encoded bytes or a violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedMedia {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub mime_type: String,
    pub filename: Option<String>,
    pub size: Option<u64>,
    pub downloaded: bool,
    pub base64: Option<String>,
    pub violation: Option<Violation>,
}

impl ProcessedMedia {
    fn downloaded(descriptor: MediaDescriptor, bytes: &[u8]) -> Self {
        Self {
            kind: descriptor.kind,
            mime_type: descriptor.mime_type,
            filename: descriptor.filename,
            size: Some(bytes.len() as u64),
            downloaded: true,
            base64: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            violation: None,
        }
    }

    fn skipped(descriptor: MediaDescriptor, kind: ViolationKind, reason: String) -> Self {
        Self {
            kind: descriptor.kind,
            mime_type: descriptor.mime_type,
            filename: descriptor.filename,
            size: descriptor.size,
            downloaded: false,
            base64: None,
            violation: Some(Violation { kind, reason }),
        }
    }
}

/// Download policy derived from configuration.
#[derive(Debug, Clone)]
pub struct MediaPolicy {
    pub enabled: bool,
    pub allowed: MediaTypeFilter,
    pub max_size_mb: u64,
}

impl MediaPolicy {
    fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(BYTES_PER_MB)
    }
}

impl From<&MediaConfig> for MediaPolicy {
    fn from(config: &MediaConfig) -> Self {
        Self {
            enabled: config.enable_download,
            allowed: config.download_types.clone(),
            max_size_mb: config.max_size_mb,
        }
    }
}

fn as_mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

/// Decides per attachment whether to fetch its bytes, and fetches them.
pub struct MediaInspector {
    transport: Arc<dyn Transport>,
    policy: MediaPolicy,
}

impl MediaInspector {
    pub fn new(transport: Arc<dyn Transport>, policy: MediaPolicy) -> Self {
        Self { transport, policy }
    }

    /// Inspect the message's attachment. `None` only when there is no attachment;
    /// every failure mode is folded into the returned violation.
    pub async fn inspect(&self, message: &InboundMessage) -> Option<ProcessedMedia> {
        let attachment = message.attachment.as_ref()?;
        Some(self.inspect_attachment(attachment).await)
    }

    pub async fn inspect_attachment(&self, attachment: &Attachment) -> ProcessedMedia {
        let descriptor = attachment.descriptor();
        let kind = descriptor.kind;

        if !self.policy.enabled {
            debug!("Media download disabled globally");
            return ProcessedMedia::skipped(
                descriptor,
                ViolationKind::DownloadDisabled,
                "Media download is disabled in configuration".to_string(),
            );
        }

        let file = match attachment.file() {
            Some(file) => file,
            None => {
                debug!("Media type not downloadable: {}", kind);
                return ProcessedMedia::skipped(
                    descriptor,
                    ViolationKind::NotDownloadable,
                    format!("Media type '{}' cannot be downloaded as file", kind),
                );
            }
        };

        if !self.policy.allowed.allows(kind) {
            debug!("Media type '{}' not enabled for download, skipping", kind);
            return ProcessedMedia::skipped(
                descriptor,
                ViolationKind::TypeNotEnabled,
                format!("Media type '{}' is not enabled for download", kind),
            );
        }

        let max_bytes = self.policy.max_size_bytes();
        if let Some(size) = descriptor.size.filter(|&size| size > max_bytes) {
            warn!(
                "Media size ({:.2} MB) exceeds limit ({} MB), skipping download",
                as_mb(size),
                self.policy.max_size_mb
            );
            return self.size_exceeded(descriptor, size);
        }

        let bytes = match self.transport.fetch_media(file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to download media {}: {:#}", file.file_id, e);
                return ProcessedMedia::skipped(
                    descriptor,
                    ViolationKind::DownloadError,
                    format!("Download failed: {}", e),
                );
            }
        };

        // Unknown sizes are only checked once the real byte count is known.
        let actual = bytes.len() as u64;
        if actual > max_bytes {
            warn!(
                "Downloaded media ({:.2} MB) exceeds limit ({} MB), dropping",
                as_mb(actual),
                self.policy.max_size_mb
            );
            return self.size_exceeded(descriptor, actual);
        }

        debug!("Downloaded media: {} ({:.2} KB)", kind, actual as f64 / 1024.0);
        ProcessedMedia::downloaded(descriptor, &bytes)
    }

    fn size_exceeded(&self, mut descriptor: MediaDescriptor, size: u64) -> ProcessedMedia {
        descriptor.size = Some(size);
        ProcessedMedia::skipped(
            descriptor,
            ViolationKind::SizeExceeded,
            format!(
                "File size ({:.2} MB) exceeds {} MB limit",
                as_mb(size),
                self.policy.max_size_mb
            ),
        )
    }
}
