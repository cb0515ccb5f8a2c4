//! JSON-RPC-over-WebSocket implementation of the backend [`Client`].
//!
//! All traffic flows through the fixed connection pool: each call is one
//! request/response exchange on whichever pooled WebSocket connection is
//! free. Receipts are polled because the backend may index them a little
//! after accepting the transaction.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::hex;
use alloy::primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::instrument;

use crate::backend::{
    CallMsg, Client, ClientError, PublicKeyPayload, SendStatus, SendTransactionResponse,
    TransactionReceipt,
};
use crate::pool::{Channel, Conn, FixedConnPool, FixedConnPoolProps};
use crate::stats::MethodTracker;

const RECEIPT_POLL_ATTEMPTS: usize = 20;
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const TRACKED_METHODS: &[&str] = &[
    "estimateGas",
    "nonceAt",
    "balanceAt",
    "sendTransaction",
    "transactionReceipt",
    "getPublicKey",
];

/// Dials WebSocket connections to the backend RPC endpoint.
pub struct WsChannel {
    url: String,
}

pub struct WsConn {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    type Conn = WsConn;

    async fn dial(&self) -> io::Result<WsConn> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|err| io::Error::other(err.to_string()))?;
        Ok(WsConn { stream })
    }
}

#[async_trait]
impl Conn for WsConn {
    async fn exchange(&mut self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let text = std::str::from_utf8(payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.stream
            .send(Message::text(text.to_string()))
            .await
            .map_err(|err| io::Error::other(err.to_string()))?;

        while let Some(message) = self.stream.next().await {
            match message.map_err(|err| io::Error::other(err.to_string()))? {
                Message::Text(text) => return Ok(text.as_bytes().to_vec()),
                Message::Binary(bytes) => return Ok(bytes.to_vec()),
                Message::Close(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection closed by the backend",
                    ));
                }
                // Control frames; keep waiting for the response.
                _ => continue,
            }
        }

        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection dropped before a response arrived",
        ))
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

pub struct EthClientProps {
    pub url: String,
    pub conns: usize,
}

/// Backend client speaking JSON-RPC over the pooled WebSocket transport.
pub struct EthClient {
    pool: FixedConnPool,
    next_id: AtomicU64,
    tracker: MethodTracker,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    status: Option<String>,
    contract_address: Option<Address>,
}

impl EthClient {
    /// Connects the pool to the backend. Only `ws` and `wss` endpoints are
    /// accepted.
    pub async fn dial(props: EthClientProps) -> Result<Self, ClientError> {
        let url = reqwest::Url::parse(&props.url)
            .map_err(|err| ClientError::Decode(format!("invalid backend url: {err}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::Decode(format!(
                "unsupported backend url scheme {:?}, only ws and wss are supported",
                url.scheme()
            )));
        }

        let pool = FixedConnPool::dial(FixedConnPoolProps {
            conns: props.conns,
            channel: WsChannel { url: props.url },
        })
        .await?;

        Ok(EthClient {
            pool,
            next_id: AtomicU64::new(1),
            tracker: MethodTracker::new(TRACKED_METHODS),
        })
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let payload =
            serde_json::to_vec(&request).map_err(|err| ClientError::Decode(err.to_string()))?;

        let raw = self.pool.request(payload).await?;
        let response: RpcResponse =
            serde_json::from_slice(&raw).map_err(|err| ClientError::Decode(err.to_string()))?;

        if let Some(error) = response.error {
            return Err(classify_rpc_error(error.message));
        }
        response
            .result
            .ok_or_else(|| ClientError::Decode("response carries neither result nor error".into()))
    }
}

impl crate::stats::StatsSource for EthClient {
    fn name(&self) -> &'static str {
        "backend.eth"
    }

    fn stats(&self) -> Vec<crate::stats::MethodSnapshot> {
        self.tracker.snapshot()
    }
}

/// Maps backend error messages onto the sentinels the wallet owner recovers
/// from.
fn classify_rpc_error(message: String) -> ClientError {
    let lowered = message.to_lowercase();
    if lowered.contains("nonce") {
        ClientError::InvalidNonce
    } else if lowered.contains("insufficient funds") || lowered.contains("exceeds balance") {
        ClientError::ExceedsBalance
    } else {
        ClientError::Rpc(message)
    }
}

fn quantity(value: impl Into<u128>) -> String {
    format!("0x{:x}", value.into())
}

fn parse_quantity(value: &Value) -> Result<u64, ClientError> {
    let text = value
        .as_str()
        .ok_or_else(|| ClientError::Decode(format!("expected hex quantity, got {value}")))?;
    u64::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|err| ClientError::Decode(format!("bad hex quantity {text:?}: {err}")))
}

#[async_trait]
impl Client for EthClient {
    #[instrument(skip_all, err)]
    async fn estimate_gas(&self, msg: CallMsg) -> Result<u64, ClientError> {
        self.tracker
            .instrument("estimateGas", async {
                let mut call = serde_json::Map::new();
                call.insert("from".into(), json!(format!("{}", msg.from)));
                if let Some(to) = msg.to {
                    call.insert("to".into(), json!(format!("{to}")));
                }
                if msg.gas > 0 {
                    call.insert("gas".into(), json!(quantity(msg.gas)));
                }
                call.insert("gasPrice".into(), json!(quantity(msg.gas_price)));
                call.insert("value".into(), json!(format!("0x{:x}", msg.value)));
                call.insert("data".into(), json!(format!("0x{}", hex::encode(&msg.data))));

                let result = self.call("eth_estimateGas", json!([call])).await?;
                parse_quantity(&result)
            })
            .await
    }

    #[instrument(skip_all, err, fields(address = %address))]
    async fn nonce_at(&self, address: Address) -> Result<u64, ClientError> {
        self.tracker
            .instrument("nonceAt", async {
                let result = self
                    .call(
                        "eth_getTransactionCount",
                        json!([format!("{address}"), "pending"]),
                    )
                    .await?;
                parse_quantity(&result)
            })
            .await
    }

    #[instrument(skip_all, err, fields(address = %address))]
    async fn balance_at(&self, address: Address) -> Result<U256, ClientError> {
        self.tracker
            .instrument("balanceAt", async {
                let result = self
                    .call("eth_getBalance", json!([format!("{address}"), "latest"]))
                    .await?;
                let text = result.as_str().ok_or_else(|| {
                    ClientError::Decode(format!("expected hex balance, got {result}"))
                })?;
                U256::from_str_radix(text.trim_start_matches("0x"), 16)
                    .map_err(|err| ClientError::Decode(format!("bad balance {text:?}: {err}")))
            })
            .await
    }

    #[instrument(skip_all, err)]
    async fn send_transaction(
        &self,
        raw_tx: Bytes,
    ) -> Result<SendTransactionResponse, ClientError> {
        self.tracker
            .instrument("sendTransaction", async {
                let result = self
                    .call(
                        "eth_sendRawTransaction",
                        json!([format!("0x{}", hex::encode(&raw_tx))]),
                    )
                    .await?;
                let hash: B256 = serde_json::from_value(result)
                    .map_err(|err| ClientError::Decode(format!("bad transaction hash: {err}")))?;
                Ok(SendTransactionResponse {
                    status: SendStatus::Ok,
                    output: String::new(),
                    hash,
                })
            })
            .await
    }

    #[instrument(skip_all, err, fields(hash = %hash))]
    async fn transaction_receipt(&self, hash: B256) -> Result<TransactionReceipt, ClientError> {
        self.tracker
            .instrument("transactionReceipt", async {
                for attempt in 0..RECEIPT_POLL_ATTEMPTS {
                    if attempt > 0 {
                        tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                    }

                    let result = self
                        .call("eth_getTransactionReceipt", json!([format!("{hash}")]))
                        .await?;
                    if result.is_null() {
                        continue;
                    }

                    let raw: RawReceipt = serde_json::from_value(result)
                        .map_err(|err| ClientError::Decode(format!("bad receipt: {err}")))?;
                    let status = match raw.status {
                        Some(text) => parse_quantity(&Value::String(text))?,
                        None => 0,
                    };
                    return Ok(TransactionReceipt {
                        status,
                        contract_address: raw.contract_address,
                    });
                }

                Err(ClientError::Rpc(
                    "transaction receipt not available".to_string(),
                ))
            })
            .await
    }

    #[instrument(skip_all, err, fields(address = %address))]
    async fn get_public_key(&self, address: Address) -> Result<PublicKeyPayload, ClientError> {
        self.tracker
            .instrument("getPublicKey", async {
                let result = self
                    .call("keymanager_getPublicKey", json!([format!("{address}")]))
                    .await?;
                serde_json::from_value(result)
                    .map_err(|err| ClientError::Decode(format!("bad public key payload: {err}")))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_errors_map_to_sentinels() {
        assert!(matches!(
            classify_rpc_error("nonce too low".to_string()),
            ClientError::InvalidNonce
        ));
        assert!(matches!(
            classify_rpc_error("Insufficient funds for gas * price + value".to_string()),
            ClientError::ExceedsBalance
        ));
        assert!(matches!(
            classify_rpc_error("execution reverted".to_string()),
            ClientError::Rpc(_)
        ));
    }

    #[test]
    fn quantities_parse_as_hex() {
        assert_eq!(parse_quantity(&json!("0x5208")).unwrap(), 21_000);
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert!(parse_quantity(&json!(21000)).is_err());
    }
}
