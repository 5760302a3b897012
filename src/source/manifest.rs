//! HTTP-backed message source driven by a JSON manifest.
//!
//! The manifest lists the channel's messages in order:
//!
//! ```json
//! {
//!   "messages": [
//!     {
//!       "id": 101,
//!       "date": "2024-05-02T18:30:00Z",
//!       "text": "#F0001 .mp4\nCourse\n=Intro",
//!       "document": { "url": "https://cdn.example.com/101.mp4", "size": 1048576, "video": true },
//!       "forwarded": false,
//!       "reply_to": null
//!     }
//!   ]
//! }
//! ```
//!
//! A bare JSON array of messages is accepted as well. Relative document URLs
//! are resolved against the manifest URL when the manifest itself is remote.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt, stream};
use reqwest::header::{RANGE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{ChunkStream, DocumentRef, MediaSource, MessageStream, SourceError, SourceMessage};

/// Connect timeout for manifest and document requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout between body chunks (large media can stall briefly).
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Wait used when a 429 arrives without a usable `Retry-After` header.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Wrapped { messages: Vec<ManifestMessage> },
    Bare(Vec<ManifestMessage>),
}

impl ManifestFile {
    fn into_messages(self) -> Vec<ManifestMessage> {
        match self {
            Self::Wrapped { messages } | Self::Bare(messages) => messages,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestMessage {
    id: i64,
    date: DateTime<Utc>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    document: Option<ManifestDocument>,
    #[serde(default)]
    forwarded: bool,
    #[serde(default)]
    reply_to: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    url: String,
    size: u64,
    #[serde(default)]
    video: bool,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Message source reading a JSON manifest and fetching documents over HTTP.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    identity: String,
    client: Client,
    messages: Vec<SourceMessage>,
}

impl ManifestSource {
    /// Loads the manifest at `identity`, a local path or an `http(s)` URL.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unavailable`] when the manifest cannot be read,
    /// parsed, or references an unusable document URL, and
    /// [`SourceError::Client`] if the HTTP client cannot be built.
    #[instrument]
    pub async fn open(identity: &str) -> Result<Self, SourceError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(SourceError::Client)?;

        let remote = Url::parse(identity)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"));

        let raw = match &remote {
            Some(url) => fetch_manifest(&client, url, identity).await?,
            None => tokio::fs::read(Path::new(identity))
                .await
                .map_err(|e| SourceError::unavailable(identity, e.to_string()))?,
        };

        let manifest: ManifestFile = serde_json::from_slice(&raw)
            .map_err(|e| SourceError::unavailable(identity, format!("invalid manifest: {e}")))?;

        let messages = manifest
            .into_messages()
            .into_iter()
            .map(|message| convert_message(message, remote.as_ref(), identity))
            .collect::<Result<Vec<_>, _>>()?;

        info!(messages = messages.len(), "manifest loaded");

        Ok(Self {
            identity: identity.to_string(),
            client,
            messages,
        })
    }
}

async fn fetch_manifest(client: &Client, url: &Url, identity: &str) -> Result<Vec<u8>, SourceError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| SourceError::unavailable(identity, e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::unavailable(identity, format!("HTTP {}", status.as_u16())));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| SourceError::unavailable(identity, e.to_string()))?;
    Ok(body.to_vec())
}

fn convert_message(
    message: ManifestMessage,
    base: Option<&Url>,
    identity: &str,
) -> Result<SourceMessage, SourceError> {
    let document = message
        .document
        .map(|document| {
            let locator = resolve_document_url(&document.url, base).ok_or_else(|| {
                SourceError::unavailable(
                    identity,
                    format!("message {} has unusable document url {}", message.id, document.url),
                )
            })?;
            Ok::<_, SourceError>(DocumentRef {
                locator,
                size: document.size,
                is_video: document.video,
                mime_type: document.mime_type,
            })
        })
        .transpose()?;

    Ok(SourceMessage {
        id: message.id,
        date: message.date,
        text: message.text,
        document,
        forwarded: message.forwarded,
        reply_to: message.reply_to,
    })
}

fn resolve_document_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(raw).ok()?,
        Err(_) => return None,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

#[async_trait]
impl MediaSource for ManifestSource {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn messages(&self) -> Result<MessageStream<'_>, SourceError> {
        Ok(stream::iter(self.messages.iter().cloned().map(Ok)).boxed())
    }

    #[instrument(skip(self, document), fields(url = %document.locator))]
    async fn read_from(
        &self,
        document: &DocumentRef,
        offset: u64,
    ) -> Result<ChunkStream<'_>, SourceError> {
        let locator = document.locator.clone();
        let mut request = self.client.get(&locator);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(locator.as_str(), e))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after)
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
            return Err(SourceError::RateLimited { wait });
        }
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                locator,
                status: status.as_u16(),
            });
        }
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(SourceError::RangeIgnored { locator, offset });
        }

        debug!(status = status.as_u16(), offset, "document stream opened");
        Ok(response
            .bytes_stream()
            .map_err(move |e| SourceError::from_reqwest(locator.as_str(), e))
            .boxed())
    }
}

/// Parses a `Retry-After` header value into a wait duration.
///
/// Accepts delay-seconds and HTTP-date forms. Values are capped at one hour;
/// negative values and dates in the past yield `None`.
///
/// ```
/// use std::time::Duration;
/// use channel_dl::source::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) if duration > MAX_RETRY_AFTER => {
            warn!(
                delay_secs = duration.as_secs(),
                "Retry-After date exceeds maximum, capping at 1 hour"
            );
            Some(MAX_RETRY_AFTER)
        }
        Ok(duration) => Some(duration),
        Err(_) => {
            debug!(header_value, "Retry-After date is in the past");
            None
        }
    }
}
