//! Wire protocol for the gateway's HTTP boundary.
//!
//! Every response is wrapped in `{ "status": { "code", "message" }, "data" }`.
//! Request bodies are camelCase and are validated into the session crate's
//! typed requests before anything reaches the manager.

use serde::{Deserialize, Serialize};
use wa_gateway_core::{MediaPayload, MessageContent};
use wa_gateway_session::{
    BroadcastRequest, ErrorKind, ManagerError, PairingArtifact, PairingOutcome, SendRequest,
};

/// Status half of the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus {
    pub code: u16,
    pub message: String,
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: ApiStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Successful response carrying `data`.
    pub fn ok(code: u16, message: impl Into<String>, data: T) -> Self {
        Self {
            status: ApiStatus {
                code,
                message: message.into(),
            },
            data: Some(data),
        }
    }

    /// Response without data.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            status: ApiStatus {
                code,
                message: message.into(),
            },
            data: None,
        }
    }
}

/// HTTP status code for an error class.
#[must_use]
pub const fn status_code(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::NotFound => 404,
        ErrorKind::AlreadyExists | ErrorKind::AlreadyTerminal | ErrorKind::NotReady => 409,
        ErrorKind::Validation => 400,
        ErrorKind::AuthFailure | ErrorKind::Disconnected | ErrorKind::DownstreamFailure => 502,
        ErrorKind::Timeout => 504,
    }
}

/// Body of `qr-sign-in` and `sign-out`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    #[serde(default)]
    pub session_name: String,
}

impl SignRequest {
    /// Trimmed, non-empty session name.
    ///
    /// # Errors
    /// Returns `Validation` if the name is missing.
    pub fn session_name(&self) -> Result<&str, ManagerError> {
        required(&self.session_name, "sessionName")
    }
}

/// Body of `send` and `send-mass`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub session_name: String,
    /// One address for `send`; `address|alias,...` for `send-mass`.
    #[serde(default)]
    pub to: String,
    pub message: Option<String>,
    pub media_base64: Option<String>,
    pub media_mime_type: Option<String>,
    pub media_file_name: Option<String>,
    #[serde(default)]
    pub enable_time_notes: bool,
}

impl SendMessageRequest {
    fn media(&self) -> Result<Option<MediaPayload>, ManagerError> {
        let Some(encoded) = self.media_base64.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        let mime = self.media_mime_type.as_deref().unwrap_or_default();
        Ok(Some(MediaPayload::from_base64(
            encoded,
            mime,
            self.media_file_name.as_deref(),
        )?))
    }

    /// Validate into a single-message send.
    ///
    /// # Errors
    /// Returns `Validation` for a missing session, target or content, or
    /// malformed media.
    pub fn into_send_request(self) -> Result<SendRequest, ManagerError> {
        let session_name = required(&self.session_name, "sessionName")?.to_string();
        let to = required(&self.to, "to")?.to_string();
        let media = self.media()?;
        let content = MessageContent::new(self.message, media)?;

        Ok(SendRequest {
            session_name,
            to,
            content,
        })
    }

    /// Validate into a broadcast.
    ///
    /// # Errors
    /// Returns `Validation` for a missing session or recipient list, or
    /// malformed media.
    pub fn into_broadcast_request(self) -> Result<BroadcastRequest, ManagerError> {
        let session_name = required(&self.session_name, "sessionName")?.to_string();
        let recipients = required(&self.to, "to")?.to_string();
        let media = self.media()?;

        Ok(BroadcastRequest {
            session_name,
            recipients,
            template: self.message,
            media,
            timestamp_footer: self.enable_time_notes,
        })
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, ManagerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ManagerError::Validation(format!("{field} is required")));
    }
    Ok(value)
}

/// Data of a pairing response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PairingResponse {
    /// Scan `image` (a QR rendering of `code`).
    Qr { code: String, image: String },
    AlreadyConnected,
}

impl From<PairingArtifact> for PairingResponse {
    fn from(artifact: PairingArtifact) -> Self {
        Self::Qr {
            code: artifact.code,
            image: artifact.image,
        }
    }
}

impl From<PairingOutcome> for PairingResponse {
    fn from(outcome: PairingOutcome) -> Self {
        match outcome {
            PairingOutcome::Pairing(artifact) => artifact.into(),
            PairingOutcome::AlreadyConnected => Self::AlreadyConnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_omits_missing_data() {
        let json = serde_json::to_value(ApiResponse::<()>::error(404, "session x not found")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": {"code": 404, "message": "session x not found"}})
        );
    }

    #[test]
    fn test_send_request_decodes_media_with_caption() {
        let request: SendMessageRequest = serde_json::from_value(serde_json::json!({
            "sessionName": "shop",
            "to": "6281111",
            "message": "invoice attached",
            "mediaBase64": "data:application/pdf;base64,JVBERi0=",
            "mediaMimeType": "application/pdf",
        }))
        .unwrap();

        let send = request.into_send_request().unwrap();
        assert_eq!(send.session_name, "shop");
        match send.content {
            MessageContent::Media { media, caption } => {
                assert_eq!(media.file_name, "file");
                assert_eq!(&media.data[..], b"%PDF-");
                assert_eq!(caption.as_deref(), Some("invoice attached"));
            }
            other @ MessageContent::Text(_) => panic!("expected media, got {other:?}"),
        }
    }

    #[test]
    fn test_send_request_validation() {
        let missing_content = SendMessageRequest {
            session_name: "shop".into(),
            to: "6281111".into(),
            ..SendMessageRequest::default()
        };
        assert_eq!(
            missing_content.into_send_request().unwrap_err().kind(),
            ErrorKind::Validation
        );

        let missing_mime = SendMessageRequest {
            session_name: "shop".into(),
            to: "6281111".into(),
            media_base64: Some("JVBERi0=".into()),
            ..SendMessageRequest::default()
        };
        assert_eq!(
            missing_mime.into_send_request().unwrap_err().kind(),
            ErrorKind::Validation
        );

        let missing_session = SendMessageRequest {
            to: "6281111".into(),
            message: Some("hi".into()),
            ..SendMessageRequest::default()
        };
        let err = missing_session.into_send_request().unwrap_err();
        assert_eq!(err.to_string(), "sessionName is required");
    }

    #[test]
    fn test_broadcast_request_maps_time_notes() {
        let request: SendMessageRequest = serde_json::from_value(serde_json::json!({
            "sessionName": "shop",
            "to": "6281111|Alice,6281112|Bob",
            "message": "Hi {{name}}",
            "enableTimeNotes": true,
        }))
        .unwrap();

        let broadcast = request.into_broadcast_request().unwrap();
        assert!(broadcast.timestamp_footer);
        assert_eq!(broadcast.template.as_deref(), Some("Hi {{name}}"));
        assert!(broadcast.media.is_none());
    }

    #[test]
    fn test_pairing_response_shape() {
        let json = serde_json::to_value(PairingResponse::AlreadyConnected).unwrap();
        assert_eq!(json, serde_json::json!({"result": "already_connected"}));
    }
}
