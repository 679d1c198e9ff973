//! 3-D host IPC contracts and framing.
//!
//! Defines the wire format shared by the controller and the 3-D host process:
//! a 4-byte big-endian length prefix followed by a UTF-8 JSON record.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Records are camelCase JSON objects. Every optional field defaults when
//! absent and unknown fields are ignored, so the two processes can be built
//! and deployed independently.

use crate::algorithm::ParamMap;
use crate::config::IpcConfig;
use crate::error::{InspectaError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

/// Command carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreeDIpcCommand {
    GetStatus,
    Configure,
    ExecuteWithLocalImages,
    SaveAfterJudgement,
    /// Best-effort notice that the caller abandoned another request.
    Cancel,
    Shutdown,
}

/// Which payload a response to a command carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Status,
    ExecuteResult,
}

impl ThreeDIpcCommand {
    pub fn response_shape(&self) -> ResponseShape {
        match self {
            ThreeDIpcCommand::ExecuteWithLocalImages => ResponseShape::ExecuteResult,
            _ => ResponseShape::Status,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreeDIpcCommand::GetStatus => "GetStatus",
            ThreeDIpcCommand::Configure => "Configure",
            ThreeDIpcCommand::ExecuteWithLocalImages => "ExecuteWithLocalImages",
            ThreeDIpcCommand::SaveAfterJudgement => "SaveAfterJudgement",
            ThreeDIpcCommand::Cancel => "Cancel",
            ThreeDIpcCommand::Shutdown => "Shutdown",
        }
    }
}

impl std::fmt::Display for ThreeDIpcCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host configuration applied by `Configure`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreeDConfig {
    /// Vendor project/solution file driving the 3-D tools.
    pub project_path: Option<String>,
    pub template_name: String,
    pub product_code: String,
    /// Directory the host writes judged images into.
    pub image_save_dir: Option<String>,
    pub parameters: ParamMap,
}

/// Payload of `ExecuteWithLocalImages`: the host reads images from disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreeDExecuteRequest {
    pub height_image_path: String,
    pub gray_image_path: String,
    pub template_name: String,
    pub lot_id: String,
    pub image_id: String,
    /// Travels as a plain JSON object; keys compare case-insensitively on
    /// both ends.
    pub parameters: ParamMap,
}

/// Payload of `SaveAfterJudgement`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreeDSaveAfterJudgementRequest {
    pub is_ok: bool,
    pub save_ok_images: bool,
    pub save_ng_images: bool,
    pub lot_id: String,
    pub image_id: String,
    pub output_dir: Option<String>,
}

/// Host state reported by status-shaped responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreeDStatus {
    pub is_initialized: bool,
    pub is_configured: bool,
    pub sdk_version: String,
    pub template_name: String,
    pub in_flight: u32,
    pub last_error: Option<String>,
}

/// One measurement as produced by the host's 3-D tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreeDMeasurement {
    pub name: String,
    /// Non-finite values are written as JSON `null` and read back as NaN.
    #[serde(deserialize_with = "nullable_f64")]
    pub value: f64,
    pub is_valid: bool,
    pub lower_limit: Option<f64>,
    pub upper_limit: Option<f64>,
    pub tool_index: Option<u32>,
}

impl ThreeDMeasurement {
    /// True when the host judged the value usable and it is a real number.
    pub fn is_usable(&self) -> bool {
        self.is_valid && self.value.is_finite()
    }
}

fn nullable_f64<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Just enough of a response to route it, used when the full record fails
/// to decode.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHeader {
    pub request_id: Uuid,
}

/// Execution outcome reported by `ExecuteWithLocalImages`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreeDExecuteResult {
    pub is_judge_all_ok: bool,
    pub defect_type: String,
    pub measurements: Vec<ThreeDMeasurement>,
    pub elapsed_ms: u64,
}

/// Failure classification carried on unsuccessful responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreeDErrorKind {
    Timeout,
    ChannelFaulted,
    NotInitialized,
    ExecutionFailed,
    InvalidRequest,
    Cancelled,
    /// A kind introduced by a newer peer.
    #[serde(other)]
    Unknown,
}

impl ThreeDErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreeDErrorKind::Timeout => "Timeout",
            ThreeDErrorKind::ChannelFaulted => "ChannelFaulted",
            ThreeDErrorKind::NotInitialized => "NotInitialized",
            ThreeDErrorKind::ExecutionFailed => "ExecutionFailed",
            ThreeDErrorKind::InvalidRequest => "InvalidRequest",
            ThreeDErrorKind::Cancelled => "Cancelled",
            ThreeDErrorKind::Unknown => "Unknown",
        }
    }
}

/// Request envelope. Build it with the per-command constructors so the
/// payload always matches the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreeDIpcRequest {
    pub request_id: Uuid,
    pub command: ThreeDIpcCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ThreeDConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<ThreeDExecuteRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_after_judgement: Option<ThreeDSaveAfterJudgementRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_target: Option<Uuid>,
}

impl ThreeDIpcRequest {
    fn new(command: ThreeDIpcCommand) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            command,
            config: None,
            execute: None,
            save_after_judgement: None,
            cancel_target: None,
        }
    }

    pub fn get_status() -> Self {
        Self::new(ThreeDIpcCommand::GetStatus)
    }

    pub fn configure(config: ThreeDConfig) -> Self {
        Self {
            config: Some(config),
            ..Self::new(ThreeDIpcCommand::Configure)
        }
    }

    pub fn execute_with_local_images(request: ThreeDExecuteRequest) -> Self {
        Self {
            execute: Some(request),
            ..Self::new(ThreeDIpcCommand::ExecuteWithLocalImages)
        }
    }

    pub fn save_after_judgement(request: ThreeDSaveAfterJudgementRequest) -> Self {
        Self {
            save_after_judgement: Some(request),
            ..Self::new(ThreeDIpcCommand::SaveAfterJudgement)
        }
    }

    pub fn cancel(target: Uuid) -> Self {
        Self {
            cancel_target: Some(target),
            ..Self::new(ThreeDIpcCommand::Cancel)
        }
    }

    pub fn shutdown() -> Self {
        Self::new(ThreeDIpcCommand::Shutdown)
    }

    /// Check that exactly the payload the command needs is present.
    ///
    /// A mismatch is a caller programming error, reported before anything
    /// is sent.
    pub fn validate(&self) -> Result<()> {
        let present = [
            ("config", self.config.is_some()),
            ("execute", self.execute.is_some()),
            ("saveAfterJudgement", self.save_after_judgement.is_some()),
            ("cancelTarget", self.cancel_target.is_some()),
        ];
        let required = match self.command {
            ThreeDIpcCommand::GetStatus | ThreeDIpcCommand::Shutdown => None,
            ThreeDIpcCommand::Configure => Some("config"),
            ThreeDIpcCommand::ExecuteWithLocalImages => Some("execute"),
            ThreeDIpcCommand::SaveAfterJudgement => Some("saveAfterJudgement"),
            ThreeDIpcCommand::Cancel => Some("cancelTarget"),
        };

        for (name, is_present) in present {
            let wanted = required == Some(name);
            if wanted && !is_present {
                return Err(InspectaError::PayloadMismatch {
                    command: self.command.to_string(),
                    message: format!("missing '{}' payload", name),
                });
            }
            if !wanted && is_present {
                return Err(InspectaError::PayloadMismatch {
                    command: self.command.to_string(),
                    message: format!("unexpected '{}' payload", name),
                });
            }
        }
        Ok(())
    }
}

/// Response envelope. Carries the request id it answers and at most one of
/// `status` / `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreeDIpcResponse {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ThreeDErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ThreeDStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ThreeDExecuteResult>,
}

impl ThreeDIpcResponse {
    pub fn with_status(request_id: Uuid, status: ThreeDStatus) -> Self {
        Self {
            request_id,
            success: true,
            error_message: None,
            error_kind: None,
            status: Some(status),
            result: None,
        }
    }

    pub fn with_result(request_id: Uuid, result: ThreeDExecuteResult) -> Self {
        Self {
            request_id,
            success: true,
            error_message: None,
            error_kind: None,
            status: None,
            result: Some(result),
        }
    }

    pub fn failure(request_id: Uuid, kind: ThreeDErrorKind, message: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            error_message: Some(message.into()),
            error_kind: Some(kind),
            status: None,
            result: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind == Some(ThreeDErrorKind::Timeout)
    }

    pub fn is_channel_fault(&self) -> bool {
        self.error_kind == Some(ThreeDErrorKind::ChannelFaulted)
    }

    /// Error text, falling back to a generic message for bare failures.
    pub fn error_text(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "3-D host reported failure without a message".to_string())
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(InspectaError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "IPC message size {} exceeds maximum {}",
                len,
                IpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(InspectaError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "IPC message size {} exceeds maximum {}",
                payload.len(),
                IpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a contract record into a frame payload.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Deserialize a frame payload into a contract record.
pub fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| InspectaError::Json {
        message: format!("Failed to parse IPC record: {}", e),
        source: Some(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_decodes_with_request_id() {
        let request = ThreeDIpcRequest::execute_with_local_images(ThreeDExecuteRequest {
            height_image_path: "h.png".into(),
            gray_image_path: "g.png".into(),
            ..Default::default()
        });
        let wire = encode(&request).unwrap();
        let received: ThreeDIpcRequest = decode(&wire).unwrap();
        assert_eq!(received.command, ThreeDIpcCommand::ExecuteWithLocalImages);

        let response = ThreeDIpcResponse::with_result(
            received.request_id,
            ThreeDExecuteResult {
                is_judge_all_ok: true,
                ..Default::default()
            },
        );
        let back: ThreeDIpcResponse = decode(&encode(&response).unwrap()).unwrap();
        assert_eq!(back.request_id, request.request_id);
        assert!(back.success);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = ThreeDIpcRequest::get_status();
        let b = ThreeDIpcRequest::get_status();
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{
                "requestId": "{}",
                "success": true,
                "status": {{ "isInitialized": true, "gpuTemperature": 71 }},
                "traceToken": "abc"
            }}"#,
            id
        );
        let response: ThreeDIpcResponse = decode(json.as_bytes()).unwrap();
        assert_eq!(response.request_id, id);
        assert!(response.status.unwrap().is_initialized);
    }

    #[test]
    fn test_absent_fields_default() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{ "requestId": "{}", "success": true, "result": {{ "isJudgeAllOk": true }} }}"#,
            id
        );
        let response: ThreeDIpcResponse = decode(json.as_bytes()).unwrap();
        let result = response.result.unwrap();
        assert!(result.is_judge_all_ok);
        assert!(result.measurements.is_empty());
        assert_eq!(result.elapsed_ms, 0);
    }

    #[test]
    fn test_non_finite_measurement_survives_the_wire() {
        let response = ThreeDIpcResponse::with_result(
            Uuid::new_v4(),
            ThreeDExecuteResult {
                measurements: vec![ThreeDMeasurement {
                    name: "Flatness".into(),
                    value: f64::NAN,
                    is_valid: true,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let wire = encode(&response).unwrap();
        assert!(String::from_utf8_lossy(&wire).contains(r#""value":null"#));

        let back: ThreeDIpcResponse = decode(&wire).unwrap();
        let measurement = &back.result.unwrap().measurements[0];
        assert!(measurement.value.is_nan());
        assert!(!measurement.is_usable());
    }

    #[test]
    fn test_header_reads_id_of_undecodable_response() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{ "requestId": "{}", "success": true, "result": {{ "elapsedMs": "soon" }} }}"#,
            id
        );
        assert!(decode::<ThreeDIpcResponse>(json.as_bytes()).is_err());
        let header: ResponseHeader = decode(json.as_bytes()).unwrap();
        assert_eq!(header.request_id, id);
    }

    #[test]
    fn test_unknown_error_kind_falls_back() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{ "requestId": "{}", "success": false, "errorKind": "LicenseExpired" }}"#,
            id
        );
        let response: ThreeDIpcResponse = decode(json.as_bytes()).unwrap();
        assert_eq!(response.error_kind, Some(ThreeDErrorKind::Unknown));
    }

    #[test]
    fn test_validate_rejects_mismatched_payload() {
        let mut request = ThreeDIpcRequest::get_status();
        request.config = Some(ThreeDConfig::default());
        assert!(matches!(
            request.validate(),
            Err(InspectaError::PayloadMismatch { .. })
        ));

        let mut request = ThreeDIpcRequest::configure(ThreeDConfig::default());
        request.config = None;
        assert!(request.validate().is_err());

        assert!(ThreeDIpcRequest::cancel(Uuid::new_v4()).validate().is_ok());
        assert!(ThreeDIpcRequest::shutdown().validate().is_ok());
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(
            ThreeDIpcCommand::ExecuteWithLocalImages.response_shape(),
            ResponseShape::ExecuteResult
        );
        assert_eq!(
            ThreeDIpcCommand::SaveAfterJudgement.response_shape(),
            ResponseShape::Status
        );
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (IpcConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
