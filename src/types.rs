//! Request, response and event types shared across the gateway, plus the
//! error taxonomy exposed to clients.
//!
//! Errors carry stable numeric wire codes: clients match on `errorCode`, not
//! on Rust type names, so the numbers here must never be reused or renumbered.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Classifies every failure the gateway reports to a client.
///
/// The numeric value is the wire representation; the description is the
/// default human-readable text attached when no more specific one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InternalError,
    InputError,
    EstimateGas,
    SignedTx,
    SendTransaction,
    InvalidNonce,
    ExceedsBalance,
    TransactionReceipt,
    TransactionReceiptStatus,
    ExecuteFailed,
    OutOfFunds,
    QueueNotFound,
    PayloadDataTooShort,
    MissingData,
    AadMismatch,
}

impl ErrorCode {
    /// Stable numeric wire value.
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::InternalError => 1000,
            ErrorCode::EstimateGas => 1001,
            ErrorCode::SignedTx => 1002,
            ErrorCode::SendTransaction => 1003,
            ErrorCode::InvalidNonce => 1004,
            ErrorCode::ExceedsBalance => 1005,
            ErrorCode::TransactionReceipt => 1006,
            ErrorCode::TransactionReceiptStatus => 1007,
            ErrorCode::ExecuteFailed => 1008,
            ErrorCode::OutOfFunds => 1009,
            ErrorCode::InputError => 2001,
            ErrorCode::QueueNotFound => 2002,
            ErrorCode::PayloadDataTooShort => 3001,
            ErrorCode::MissingData => 3002,
            ErrorCode::AadMismatch => 3003,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::InternalError => "Internal error.",
            ErrorCode::EstimateGas => "Failed to estimate gas for the transaction.",
            ErrorCode::SignedTx => "Failed to sign the transaction.",
            ErrorCode::SendTransaction => "Failed to send the transaction.",
            ErrorCode::InvalidNonce => "Transaction rejected for an invalid nonce.",
            ErrorCode::ExceedsBalance => "Transaction cost exceeds the wallet balance.",
            ErrorCode::TransactionReceipt => "Failed to retrieve the transaction receipt.",
            ErrorCode::TransactionReceiptStatus => {
                "Transaction receipt reports an execution failure."
            }
            ErrorCode::ExecuteFailed => "Failed to execute the service.",
            ErrorCode::OutOfFunds => "The wallet is out of funds.",
            ErrorCode::InputError => "Invalid input provided.",
            ErrorCode::QueueNotFound => "Queue does not exist.",
            ErrorCode::PayloadDataTooShort => "Payload data is too short.",
            ErrorCode::MissingData => "Missing data.",
            ErrorCode::AadMismatch => "AAD does not match.",
        }
    }
}

/// Client-visible structured error: `{errorCode, description}` on the wire.
///
/// The underlying cause stays in the logs; it is never serialized to the
/// client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{error_code}] {description}")]
#[serde(rename_all = "camelCase")]
pub struct Error {
    pub error_code: u32,
    pub description: String,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error {
            error_code: code.code(),
            description: code.description().to_string(),
        }
    }

    pub fn with_description(code: ErrorCode, description: impl Into<String>) -> Self {
        Error {
            error_code: code.code(),
            description: description.into(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self.error_code {
            2001 | 2002 => StatusCode::BAD_REQUEST,
            3001..=3003 => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

/// Asynchronous result of an execute request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteServiceEvent {
    /// Identifies the originating request and orders the event in the
    /// subscription stream.
    pub id: u64,
    /// Address of the executed service.
    pub address: String,
    /// Output produced by the service execution.
    pub output: String,
}

/// Asynchronous result of a deploy request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployServiceEvent {
    pub id: u64,
    /// Address the service was deployed at, taken from the receipt.
    pub address: String,
}

/// Asynchronous failure report for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub id: u64,
    pub cause: Error,
}

/// Everything a client can poll out of its subscription stream.
///
/// The `type` tag doubles as the mailbox element type, so the wire shape of
/// a polled element and of a synchronous response is identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "executeServiceEvent")]
    ExecuteService(ExecuteServiceEvent),
    #[serde(rename = "deployServiceEvent")]
    DeployService(DeployServiceEvent),
    #[serde(rename = "errorEvent")]
    Error(ErrorEvent),
}

impl Event {
    pub fn error(id: u64, cause: Error) -> Self {
        Event::Error(ErrorEvent { id, cause })
    }

    /// The originating request id.
    pub fn id(&self) -> u64 {
        match self {
            Event::ExecuteService(ev) => ev.id,
            Event::DeployService(ev) => ev.id,
            Event::Error(ev) => ev.id,
        }
    }

    /// The mailbox element type under which the event is stored.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ExecuteService(_) => "executeServiceEvent",
            Event::DeployService(_) => "deployServiceEvent",
            Event::Error(_) => "errorEvent",
        }
    }
}

/// Request to invoke an already-deployed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteServiceRequest {
    /// `0x`-prefixed 20-byte hex address of the service.
    pub address: String,
    /// Opaque payload handed to the service as its argument.
    pub data: String,
}

/// Request to deploy a new service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployServiceRequest {
    /// Opaque payload used as the deployment argument.
    pub data: String,
}

/// Request for the public key bound to a deployed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPublicKeyRequest {
    pub address: String,
}

/// Public key material served by the backend key manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPublicKeyResponse {
    /// Expiry timestamp of the key.
    pub timestamp: u64,
    pub address: String,
    pub public_key: String,
    /// Key-manager signature authenticating the public key.
    pub signature: String,
}

/// Request to poll the caller's subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollServiceRequest {
    /// Offset to start retrieving events from.
    pub offset: u64,
    /// Maximum number of events to return.
    pub count: usize,
    /// Drop all events before `offset` as part of the poll.
    #[serde(default)]
    pub discard_previous: bool,
}

/// Window of events returned by a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollServiceResponse {
    /// Offset of the first element in the scanned window.
    pub offset: u64,
    pub events: Vec<serde_json::Value>,
}

/// Validates the service address of an execute request: a `0x`-prefixed
/// 20-byte hex value. Deploy requests carry no address and skip this check.
pub fn validate_service_address(address: &str) -> Result<(), Error> {
    let invalid = || Error::with_description(ErrorCode::InputError, "Provided invalid address.");
    let hex_part = address.strip_prefix("0x").ok_or_else(invalid)?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape_is_tagged() {
        let event = Event::DeployService(DeployServiceEvent {
            id: 7,
            address: "0x00".to_string(),
        });
        let json = serde_json::to_value(&event).expect("serializes");
        assert_eq!(json["type"], "deployServiceEvent");
        assert_eq!(json["id"], 7);

        let back: Event = serde_json::from_value(json).expect("round-trips");
        assert_eq!(back, event);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::InternalError.code(), 1000);
        assert_eq!(ErrorCode::InputError.code(), 2001);
        assert_eq!(ErrorCode::QueueNotFound.code(), 2002);
        assert_eq!(ErrorCode::PayloadDataTooShort.code(), 3001);
        assert_eq!(ErrorCode::AadMismatch.code(), 3003);
    }

    #[test]
    fn service_address_validation() {
        let valid = format!("0x{}", "6f".repeat(20));
        assert!(validate_service_address(&valid).is_ok());

        let truncated = valid[..10].to_string();
        let overlong = format!("{valid}00");
        for invalid in ["", "0x", "6f6704e5", truncated.as_str(), overlong.as_str()] {
            let err = validate_service_address(invalid).expect_err("must reject");
            assert_eq!(err.error_code, ErrorCode::InputError.code());
            assert_eq!(err.description, "Provided invalid address.");
        }
    }
}
