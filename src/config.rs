use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::platform::MediaKind;

pub const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub typing: TypingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallbackConfig {
    /// Webhook that receives every forwarded payload
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_callback_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_callback_retries")]
    pub retries: u32,
    /// Base delay for exponential backoff between attempts
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    #[serde(default = "default_true")]
    pub enable_download: bool,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    /// Quiet period after the last album item before the album is flushed
    #[serde(default = "default_group_timeout")]
    pub group_timeout_secs: f64,
    #[serde(default)]
    pub download_types: MediaTypeFilter,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TypingConfig {
    /// How often a running typing task re-sends the indicator (0 = never)
    #[serde(default = "default_typing_refresh")]
    pub refresh_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

/// Set of media kinds allowed for download. Parsed from `"all"` or a comma-separated list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct MediaTypeFilter(BTreeSet<MediaKind>);

impl MediaTypeFilter {
    pub fn all() -> Self {
        Self(MediaKind::DOWNLOADABLE.into_iter().collect())
    }

    pub fn allows(&self, kind: MediaKind) -> bool {
        self.0.contains(&kind)
    }
}

impl Default for MediaTypeFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for MediaTypeFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::all());
        }
        let kinds = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(MediaKind::from_str)
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Self(kinds))
    }
}

impl TryFrom<String> for MediaTypeFilter {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for MediaTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(MediaKind::as_str).collect();
        write!(f, "{}", names.join(", "))
    }
}

fn default_true() -> bool {
    true
}

fn default_callback_timeout() -> u64 {
    10
}

fn default_callback_retries() -> u32 {
    3
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_max_size_mb() -> u64 {
    10
}

fn default_group_timeout() -> f64 {
    5.0
}

fn default_typing_refresh() -> u64 {
    4
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_callback_timeout(),
            retries: default_callback_retries(),
            backoff_unit_ms: default_backoff_unit_ms(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enable_download: true,
            max_size_mb: default_max_size_mb(),
            group_timeout_secs: default_group_timeout(),
            download_types: MediaTypeFilter::all(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_typing_refresh(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
        }
    }
}

impl CallbackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

impl MediaConfig {
    /// Falls back to the default window for values `validate()` would reject.
    pub fn group_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.group_timeout_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_group_timeout()))
    }
}

impl TypingConfig {
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_secs > 0).then(|| Duration::from_secs(self.refresh_secs))
    }
}

/// Parse an optional variable, falling back to `default` when it is unset.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", name, raw, e)),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let media_defaults = MediaConfig::default();
        let enable_download = lookup("ENABLE_MEDIA_DOWNLOAD")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(media_defaults.enable_download);

        Ok(Self {
            telegram: TelegramConfig {
                bot_token: lookup("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            },
            callback: CallbackConfig {
                url: lookup("CALLBACK_URL").unwrap_or_default(),
                timeout_secs: parse_var(&lookup, "CALLBACK_TIMEOUT", default_callback_timeout())?,
                retries: parse_var(&lookup, "CALLBACK_RETRIES", default_callback_retries())?,
                backoff_unit_ms: parse_var(
                    &lookup,
                    "CALLBACK_BACKOFF_MS",
                    default_backoff_unit_ms(),
                )?,
            },
            media: MediaConfig {
                enable_download,
                max_size_mb: parse_var(&lookup, "MAX_MEDIA_SIZE", media_defaults.max_size_mb)?,
                group_timeout_secs: parse_var(
                    &lookup,
                    "MEDIA_GROUP_TIMEOUT",
                    media_defaults.group_timeout_secs,
                )?,
                download_types: parse_var(
                    &lookup,
                    "DOWNLOAD_MEDIA_TYPES",
                    media_defaults.download_types,
                )?,
            },
            typing: TypingConfig {
                refresh_secs: parse_var(&lookup, "TYPING_REFRESH_SECS", default_typing_refresh())?,
            },
            api: ApiConfig {
                listen: parse_var(&lookup, "API_LISTEN", default_api_listen())?,
            },
        })
    }

    /// Check required values; all problems are reported in one error.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.telegram.bot_token.trim().is_empty() {
            errors.push("TELEGRAM_BOT_TOKEN is required");
        }
        if self.callback.url.trim().is_empty() {
            errors.push("CALLBACK_URL is required");
        }
        if self.callback.retries == 0 {
            errors.push("CALLBACK_RETRIES must be at least 1");
        }
        let group_timeout = Duration::try_from_secs_f64(self.media.group_timeout_secs);
        if !group_timeout.is_ok_and(|d| !d.is_zero()) {
            errors.push("MEDIA_GROUP_TIMEOUT must be a positive, representable number of seconds");
        }
        if self.media.max_size_mb.checked_mul(BYTES_PER_MB).is_none() {
            errors.push("MAX_MEDIA_SIZE is too large");
        }

        if !errors.is_empty() {
            let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
            anyhow::bail!("Configuration errors:\n{}", lines.join("\n"));
        }
        Ok(())
    }
}
