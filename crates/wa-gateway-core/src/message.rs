//! Outbound message content and destination addresses.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Suffix for individual chat addresses.
const USER_SUFFIX: &str = "@c.us";

/// Default file name for media without one.
const DEFAULT_FILE_NAME: &str = "file";

/// Content validation error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("no message or media provided")]
    Empty,
    #[error("recipient address is empty")]
    EmptyAddress,
    #[error("media mime type is required")]
    MissingMimeType,
    #[error("media payload is empty")]
    EmptyMedia,
    #[error("media payload is not valid base64: {0}")]
    InvalidBase64(String),
}

/// Network destination address (`<id>@<server>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    /// Normalize a target into a qualified address.
    ///
    /// Addresses that already contain a server part are kept as-is,
    /// bare numbers get the individual-chat suffix.
    ///
    /// # Errors
    /// Returns error if the target is blank.
    pub fn normalize(target: &str) -> Result<Self, ContentError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ContentError::EmptyAddress);
        }
        if target.contains('@') {
            Ok(Self(target.to_string()))
        } else {
            Ok(Self(format!("{target}{USER_SUFFIX}")))
        }
    }

    /// Address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded media attachment.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub mime_type: String,
    pub file_name: String,
    pub data: Bytes,
}

impl fmt::Debug for MediaPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaPayload")
            .field("mime_type", &self.mime_type)
            .field("file_name", &self.file_name)
            .field("len", &self.data.len())
            .finish()
    }
}

impl MediaPayload {
    /// Decode a base64 payload, stripping `data:<mime>;base64,` or bare
    /// `base64,` prefixes first.
    ///
    /// # Errors
    /// Returns error if the mime type is missing or the payload does not
    /// decode to at least one byte.
    pub fn from_base64(
        encoded: &str,
        mime_type: &str,
        file_name: Option<&str>,
    ) -> Result<Self, ContentError> {
        let mime_type = mime_type.trim();
        if mime_type.is_empty() {
            return Err(ContentError::MissingMimeType);
        }

        let raw = strip_base64_prefix(encoded.trim());
        let data = BASE64
            .decode(raw)
            .map_err(|e| ContentError::InvalidBase64(e.to_string()))?;
        if data.is_empty() {
            return Err(ContentError::EmptyMedia);
        }

        let file_name = file_name
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_FILE_NAME);

        Ok(Self {
            mime_type: mime_type.to_string(),
            file_name: file_name.to_string(),
            data: Bytes::from(data),
        })
    }
}

fn strip_base64_prefix(s: &str) -> &str {
    if s.starts_with("data:") {
        if let Some(idx) = s.find(";base64,") {
            return &s[idx + ";base64,".len()..];
        }
    }
    s.strip_prefix("base64,").unwrap_or(s)
}

/// What to send: text, or media with an optional caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Media {
        media: MediaPayload,
        caption: Option<String>,
    },
}

impl MessageContent {
    /// Build content from optional text and media.
    ///
    /// With media present, the text becomes its caption.
    ///
    /// # Errors
    /// Returns error if neither text nor media is supplied.
    pub fn new(text: Option<String>, media: Option<MediaPayload>) -> Result<Self, ContentError> {
        let text = text.filter(|t| !t.is_empty());
        match (text, media) {
            (caption, Some(media)) => Ok(Self::Media { media, caption }),
            (Some(text), None) => Ok(Self::Text(text)),
            (None, None) => Err(ContentError::Empty),
        }
    }

    /// Text body or caption.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Media { caption, .. } => caption.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bare_number() {
        let id = ChatId::normalize(" 6281111 ").unwrap();
        assert_eq!(id.as_str(), "6281111@c.us");
    }

    #[test]
    fn test_normalize_keeps_qualified_address() {
        let id = ChatId::normalize("12036302@g.us").unwrap();
        assert_eq!(id.as_str(), "12036302@g.us");
    }

    #[test]
    fn test_normalize_rejects_blank() {
        assert_eq!(ChatId::normalize("   "), Err(ContentError::EmptyAddress));
    }

    #[test]
    fn test_media_strips_data_uri() {
        let encoded = format!("data:image/png;base64,{}", BASE64.encode(b"png-bytes"));
        let media = MediaPayload::from_base64(&encoded, "image/png", None).unwrap();
        assert_eq!(&media.data[..], b"png-bytes");
        assert_eq!(media.file_name, "file");
    }

    #[test]
    fn test_media_strips_bare_prefix() {
        let encoded = format!("base64,{}", BASE64.encode(b"pdf"));
        let media = MediaPayload::from_base64(&encoded, "application/pdf", Some("invoice.pdf"))
            .unwrap();
        assert_eq!(&media.data[..], b"pdf");
        assert_eq!(media.file_name, "invoice.pdf");
    }

    #[test]
    fn test_media_rejects_garbage() {
        let err = MediaPayload::from_base64("not base64!!", "image/png", None).unwrap_err();
        assert!(matches!(err, ContentError::InvalidBase64(_)));
    }

    #[test]
    fn test_media_requires_mime() {
        let err = MediaPayload::from_base64("aGk=", " ", None).unwrap_err();
        assert_eq!(err, ContentError::MissingMimeType);
    }

    #[test]
    fn test_content_requires_something() {
        assert_eq!(MessageContent::new(None, None), Err(ContentError::Empty));
        assert_eq!(
            MessageContent::new(Some(String::new()), None),
            Err(ContentError::Empty)
        );
    }

    #[test]
    fn test_content_text_becomes_caption() {
        let media = MediaPayload::from_base64("aGk=", "image/png", None).unwrap();
        let content = MessageContent::new(Some("look".into()), Some(media)).unwrap();
        assert!(matches!(content, MessageContent::Media { .. }));
        assert_eq!(content.text(), Some("look"));
    }
}
