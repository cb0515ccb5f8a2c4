//! Chain backend capability.
//!
//! The wallet owners and the executor only ever see the [`Client`] trait;
//! the wire protocol behind it lives in [`eth`]. Error sentinels matter
//! here: nonce conflicts and exhausted balances drive distinct recovery
//! paths in the wallet owner.

pub mod eth;

use alloy::primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use serde::Deserialize;

/// Call parameters for gas estimation.
#[derive(Debug, Clone)]
pub struct CallMsg {
    pub from: Address,
    /// Absent for contract creation.
    pub to: Option<Address>,
    pub gas: u64,
    pub gas_price: u128,
    pub value: U256,
    pub data: Bytes,
}

/// Outcome reported by the backend for an accepted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTransactionResponse {
    pub status: SendStatus,
    /// Output produced by the call, if the backend surfaces one.
    pub output: String,
    pub hash: B256,
}

/// The subset of a transaction receipt the gateway consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    /// `1` denotes a successful execution.
    pub status: u64,
    /// Populated for contract-creation transactions.
    pub contract_address: Option<Address>,
}

/// Public key material returned by the backend key manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyPayload {
    pub timestamp: u64,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Submission rejected because of the transaction nonce. Retried by the
    /// wallet owner with a refreshed nonce.
    #[error("Invalid nonce")]
    InvalidNonce,
    /// Submission rejected because the wallet cannot cover the cost.
    #[error("Transaction cost exceeds balance")]
    ExceedsBalance,
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("transport failure: {0}")]
    Transport(#[from] crate::pool::PoolError),
    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Whether the error belongs to the nonce class: either the sentinel or
    /// a backend message mentioning the nonce.
    pub fn is_nonce_error(&self) -> bool {
        match self {
            ClientError::InvalidNonce => true,
            ClientError::Rpc(message) => message.contains("nonce"),
            _ => false,
        }
    }

    /// The wire error code a client sees for this failure.
    pub fn error_code(&self) -> crate::types::ErrorCode {
        match self {
            ClientError::InvalidNonce => crate::types::ErrorCode::InvalidNonce,
            ClientError::ExceedsBalance => crate::types::ErrorCode::ExceedsBalance,
            ClientError::Rpc(_) | ClientError::Transport(_) | ClientError::Decode(_) => {
                crate::types::ErrorCode::SendTransaction
            }
        }
    }
}

/// Everything the gateway needs from the chain backend.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    async fn estimate_gas(&self, msg: CallMsg) -> Result<u64, ClientError>;

    /// Pending-state nonce of `address`.
    async fn nonce_at(&self, address: Address) -> Result<u64, ClientError>;

    async fn balance_at(&self, address: Address) -> Result<U256, ClientError>;

    /// Submits a signed, encoded transaction.
    async fn send_transaction(&self, raw_tx: Bytes) -> Result<SendTransactionResponse, ClientError>;

    async fn transaction_receipt(&self, hash: B256) -> Result<TransactionReceipt, ClientError>;

    /// Public key bound to a deployed service, from the key manager.
    async fn get_public_key(&self, address: Address) -> Result<PublicKeyPayload, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_class_errors() {
        assert!(ClientError::InvalidNonce.is_nonce_error());
        assert!(ClientError::Rpc("nonce too low".to_string()).is_nonce_error());
        assert!(!ClientError::Rpc("out of gas".to_string()).is_nonce_error());
        assert!(!ClientError::ExceedsBalance.is_nonce_error());
    }

    #[test]
    fn client_errors_map_to_wire_codes() {
        use crate::types::ErrorCode;

        assert_eq!(ClientError::InvalidNonce.error_code(), ErrorCode::InvalidNonce);
        assert_eq!(
            ClientError::ExceedsBalance.error_code(),
            ErrorCode::ExceedsBalance
        );
        assert_eq!(
            ClientError::Rpc("reverted".to_string()).error_code(),
            ErrorCode::SendTransaction
        );
    }
}
