//! The wallet-owner actor.
//!
//! Exactly one task owns each private key. It consumes requests strictly
//! serially from its inbound channel, so the nonce counter is mutated by a
//! single task and never locked. A submission rejected for its nonce puts
//! the request back at the tail of the channel with a refreshed counter;
//! everything else terminates the request with exactly one event on its
//! reply channel.

use std::str::FromStr;
use std::sync::Arc;

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::hex;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, U256};
use alloy::signers::local::PrivateKeySigner;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::{CallMsg, Client, ClientError, SendStatus};
use crate::callback::{Callbacks, WalletOutOfFundsBody};
use crate::types::{
    DeployServiceEvent, DeployServiceRequest, Error, ErrorCode, Event, ExecuteServiceEvent,
    ExecuteServiceRequest, GetPublicKeyRequest, GetPublicKeyResponse,
};

/// Bound on processing attempts per request and on nonce-refresh fetches.
const MAX_ATTEMPTS: u32 = 10;
const GAS_PRICE: u128 = 1_000_000_000;

pub struct WalletOwnerServices {
    pub client: Arc<dyn Client>,
    pub callbacks: Arc<dyn Callbacks>,
}

pub struct WalletOwnerProps {
    pub signer: PrivateKeySigner,
    /// Pending nonce of the wallet at startup.
    pub nonce: u64,
    pub queue_depth: usize,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Execute,
    Deploy,
}

struct PendingTransaction {
    id: u64,
    /// Empty for contract creation.
    address: String,
    data: String,
    attempts: u32,
    out: oneshot::Sender<Event>,
}

impl PendingTransaction {
    fn reply(self, event: Event) {
        // A closed reply channel means the caller went away; the event is
        // dropped, the transaction outcome stands.
        let _ = self.out.send(event);
    }
}

enum OwnerRequest {
    Execute(PendingTransaction),
    Deploy(PendingTransaction),
}

/// Handle to one wallet-owner actor.
#[derive(Clone)]
pub struct WalletOwner {
    tx: mpsc::Sender<OwnerRequest>,
    address: Address,
    client: Arc<dyn Client>,
}

impl WalletOwner {
    pub fn start(services: WalletOwnerServices, props: WalletOwnerProps) -> Self {
        let address = props.signer.address();
        let (tx, rx) = mpsc::channel(props.queue_depth);

        tokio::spawn(
            OwnerTask {
                client: Arc::clone(&services.client),
                callbacks: services.callbacks,
                signer: props.signer,
                address,
                nonce: props.nonce,
                rx,
                retry_tx: tx.clone(),
                cancel: props.cancel,
            }
            .run(),
        );

        WalletOwner {
            tx,
            address,
            client: services.client,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Invokes a deployed service. Resolves once the transaction reaches a
    /// terminal state.
    pub async fn execute(&self, id: u64, req: ExecuteServiceRequest) -> Event {
        self.submit(id, req.address, req.data, RequestKind::Execute)
            .await
    }

    /// Deploys a service; the success event carries the address assigned by
    /// the backend.
    pub async fn deploy(&self, id: u64, req: DeployServiceRequest) -> Event {
        self.submit(id, String::new(), req.data, RequestKind::Deploy)
            .await
    }

    async fn submit(&self, id: u64, address: String, data: String, kind: RequestKind) -> Event {
        let (out, response) = oneshot::channel();
        let pending = PendingTransaction {
            id,
            address,
            data,
            attempts: 0,
            out,
        };
        let request = match kind {
            RequestKind::Execute => OwnerRequest::Execute(pending),
            RequestKind::Deploy => OwnerRequest::Deploy(pending),
        };

        if self.tx.send(request).await.is_err() {
            return Event::error(
                id,
                Error::with_description(ErrorCode::InternalError, "wallet owner is shut down"),
            );
        }
        response.await.unwrap_or_else(|_| {
            Event::error(
                id,
                Error::with_description(ErrorCode::InternalError, "wallet owner is shut down"),
            )
        })
    }

    /// Fetches the public key bound to a service. Bypasses the transaction
    /// loop: no signing or nonce involved.
    pub async fn get_public_key(
        &self,
        req: GetPublicKeyRequest,
    ) -> Result<GetPublicKeyResponse, Error> {
        let decoded = hex::decode(req.address.trim_start_matches("0x"))
            .map_err(|_| Error::with_description(ErrorCode::InputError, "Provided invalid address."))?;
        if decoded.len() != 20 {
            return Err(Error::with_description(
                ErrorCode::InputError,
                "Provided invalid address.",
            ));
        }

        let payload = self
            .client
            .get_public_key(Address::from_slice(&decoded))
            .await
            .map_err(|err| {
                tracing::debug!(address = %req.address, error = %err, "public key request failed");
                Error::new(ErrorCode::InternalError)
            })?;

        Ok(GetPublicKeyResponse {
            timestamp: payload.timestamp,
            address: req.address,
            public_key: payload.public_key,
            signature: payload.signature,
        })
    }
}

struct OwnerTask {
    client: Arc<dyn Client>,
    callbacks: Arc<dyn Callbacks>,
    signer: PrivateKeySigner,
    address: Address,
    /// Number of transactions this owner has committed to submit. Only this
    /// task reads or writes it.
    nonce: u64,
    rx: mpsc::Receiver<OwnerRequest>,
    /// Loops retried requests back to the tail of our own channel.
    retry_tx: mpsc::Sender<OwnerRequest>,
    cancel: CancellationToken,
}

impl OwnerTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                request = self.rx.recv() => match request {
                    None => return,
                    Some(OwnerRequest::Execute(pending)) => {
                        self.run_transaction(RequestKind::Execute, pending).await;
                    }
                    Some(OwnerRequest::Deploy(pending)) => {
                        self.run_transaction(RequestKind::Deploy, pending).await;
                    }
                },
            }
        }
    }

    async fn run_transaction(&mut self, kind: RequestKind, mut pending: PendingTransaction) {
        if pending.attempts >= MAX_ATTEMPTS {
            let id = pending.id;
            pending.reply(Event::error(id, Error::new(ErrorCode::ExecuteFailed)));
            return;
        }

        if pending.attempts > 0 && self.refresh_nonce().await.is_err() {
            let id = pending.id;
            pending.reply(Event::error(
                id,
                Error::with_description(ErrorCode::ExecuteFailed, "failed to refresh wallet nonce"),
            ));
            return;
        }

        let nonce = self.nonce;
        self.nonce += 1;

        match self.execute_transaction(nonce, kind, &pending).await {
            Ok(event) => pending.reply(event),
            Err(err) if err.is_nonce_error() => {
                tracing::debug!(
                    id = pending.id,
                    wallet = %self.address,
                    attempts = pending.attempts,
                    error = %err,
                    "nonce conflict, requeueing"
                );
                pending.attempts += 1;
                let request = match kind {
                    RequestKind::Execute => OwnerRequest::Execute(pending),
                    RequestKind::Deploy => OwnerRequest::Deploy(pending),
                };
                // try_send: awaiting our own bounded channel here would
                // deadlock the loop against itself.
                if let Err(err) = self.retry_tx.try_send(request) {
                    let pending = match err {
                        mpsc::error::TrySendError::Full(request)
                        | mpsc::error::TrySendError::Closed(request) => match request {
                            OwnerRequest::Execute(pending) | OwnerRequest::Deploy(pending) => {
                                pending
                            }
                        },
                    };
                    let id = pending.id;
                    pending.reply(Event::error(
                        id,
                        Error::with_description(
                            ErrorCode::ExecuteFailed,
                            "wallet queue saturated during nonce retry",
                        ),
                    ));
                }
            }
            Err(ClientError::ExceedsBalance) => {
                self.callbacks
                    .wallet_out_of_funds(WalletOutOfFundsBody {
                        address: format!("{}", self.address),
                    })
                    .await;
                let id = pending.id;
                pending.reply(Event::error(id, Error::new(ErrorCode::OutOfFunds)));
            }
            Err(err) => {
                tracing::debug!(
                    id = pending.id,
                    wallet = %self.address,
                    error = %err,
                    "failed to send transaction"
                );
                let id = pending.id;
                let code = err.error_code();
                pending.reply(Event::error(id, Error::new(code)));
            }
        }
    }

    /// Re-synchronizes the local counter with the backend, keeping whichever
    /// is higher. Transient fetch failures are retried up to the attempt
    /// bound.
    async fn refresh_nonce(&mut self) -> Result<(), ()> {
        for _ in 0..MAX_ATTEMPTS {
            match self.client.nonce_at(self.address).await {
                Ok(remote) => {
                    if self.nonce < remote {
                        self.nonce = remote;
                    }
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(wallet = %self.address, error = %err, "nonce fetch failed");
                }
            }
        }
        Err(())
    }

    /// Runs the estimate/sign/submit/receipt pipeline for one attempt.
    ///
    /// Failures that must not be retried come back as `Ok(ErrorEvent)`;
    /// submission failures come back as `Err` so the caller can classify
    /// them for retry, callback, or a terminal event.
    async fn execute_transaction(
        &self,
        nonce: u64,
        kind: RequestKind,
        pending: &PendingTransaction,
    ) -> Result<Event, ClientError> {
        let id = pending.id;
        let to = if pending.address.is_empty() {
            None
        } else {
            match Address::from_str(&pending.address) {
                Ok(address) => Some(address),
                Err(_) => {
                    return Ok(Event::error(
                        id,
                        Error::with_description(ErrorCode::InputError, "Provided invalid address."),
                    ));
                }
            }
        };
        let payload = decode_payload(&pending.data);

        let gas = match self
            .client
            .estimate_gas(CallMsg {
                from: self.address,
                to,
                gas: 0,
                gas_price: GAS_PRICE,
                value: U256::ZERO,
                data: payload.clone(),
            })
            .await
        {
            Ok(gas) => gas,
            Err(err) => {
                tracing::debug!(id, wallet = %self.address, error = %err, "failed to estimate gas");
                return Ok(Event::error(id, Error::new(ErrorCode::EstimateGas)));
            }
        };

        let mut tx = TxLegacy {
            chain_id: None,
            nonce,
            gas_price: GAS_PRICE,
            gas_limit: gas,
            to: to.map(TxKind::Call).unwrap_or(TxKind::Create),
            value: U256::ZERO,
            input: payload,
        };
        let signature = match self.signer.sign_transaction_sync(&mut tx) {
            Ok(signature) => signature,
            Err(err) => {
                tracing::debug!(id, wallet = %self.address, error = %err, "failed to sign transaction");
                return Ok(Event::error(id, Error::new(ErrorCode::SignedTx)));
            }
        };
        let envelope = TxEnvelope::Legacy(tx.into_signed(signature));
        let raw = envelope.encoded_2718();

        let response = self.client.send_transaction(Bytes::from(raw)).await?;
        if response.status != SendStatus::Ok {
            return Ok(Event::error(id, Error::new(ErrorCode::SendTransaction)));
        }

        let receipt = match self.client.transaction_receipt(response.hash).await {
            Ok(receipt) => receipt,
            Err(err) => {
                tracing::debug!(id, wallet = %self.address, error = %err, "failed to retrieve receipt");
                return Ok(Event::error(id, Error::new(ErrorCode::TransactionReceipt)));
            }
        };
        if receipt.status != 1 {
            return Ok(Event::error(
                id,
                Error::new(ErrorCode::TransactionReceiptStatus),
            ));
        }

        Ok(match kind {
            RequestKind::Deploy => Event::DeployService(DeployServiceEvent {
                id,
                address: receipt
                    .contract_address
                    .map(|address| format!("{address}"))
                    .unwrap_or_default(),
            }),
            RequestKind::Execute => Event::ExecuteService(ExecuteServiceEvent {
                id,
                address: pending.address.clone(),
                output: response.output,
            }),
        })
    }
}

/// Request payloads arrive as strings; `0x`-prefixed hex decodes to its
/// bytes, anything else is taken verbatim.
fn decode_payload(data: &str) -> Bytes {
    if let Some(hex_part) = data.strip_prefix("0x") {
        if let Ok(decoded) = hex::decode(hex_part) {
            return Bytes::from(decoded);
        }
    }
    Bytes::from(data.as_bytes().to_vec())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{PublicKeyPayload, SendTransactionResponse, TransactionReceipt};
    use alloy::consensus::Transaction as _;
    use alloy::eips::eip2718::Decodable2718;
    use alloy::primitives::B256;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) const TEST_PRIVATE_KEY: &str =
        "0x17be884d0713e46a983fe65900c0ee0f45696cee60e5c8c58b66a35e9d3007b7";

    /// Scripted backend double: `send_results` are consumed in order, the
    /// nonce of every submitted transaction is recorded.
    pub(crate) struct MockClient {
        pub nonce: u64,
        pub estimate: Result<u64, ()>,
        pub receipt_status: u64,
        pub send_results: Mutex<VecDeque<Result<SendTransactionResponse, ClientError>>>,
        pub sent_nonces: Mutex<Vec<u64>>,
    }

    impl Default for MockClient {
        fn default() -> Self {
            MockClient {
                nonce: 1,
                estimate: Ok(0),
                receipt_status: 1,
                send_results: Mutex::new(VecDeque::new()),
                sent_nonces: Mutex::new(Vec::new()),
            }
        }
    }

    fn accepted() -> SendTransactionResponse {
        SendTransactionResponse {
            status: SendStatus::Ok,
            output: "Success".to_string(),
            hash: B256::ZERO,
        }
    }

    #[async_trait]
    impl Client for MockClient {
        async fn estimate_gas(&self, _msg: CallMsg) -> Result<u64, ClientError> {
            self.estimate
                .map_err(|_| ClientError::Rpc("estimate failed".to_string()))
        }

        async fn nonce_at(&self, _address: Address) -> Result<u64, ClientError> {
            Ok(self.nonce)
        }

        async fn balance_at(&self, _address: Address) -> Result<U256, ClientError> {
            Ok(U256::from(1u64))
        }

        async fn send_transaction(
            &self,
            raw_tx: Bytes,
        ) -> Result<SendTransactionResponse, ClientError> {
            let envelope =
                TxEnvelope::decode_2718(&mut raw_tx.as_ref()).expect("submitted tx decodes");
            self.sent_nonces.lock().unwrap().push(envelope.nonce());

            self.send_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(accepted()))
        }

        async fn transaction_receipt(&self, _hash: B256) -> Result<TransactionReceipt, ClientError> {
            Ok(TransactionReceipt {
                status: self.receipt_status,
                contract_address: Some(Address::ZERO),
            })
        }

        async fn get_public_key(&self, _address: Address) -> Result<PublicKeyPayload, ClientError> {
            Ok(PublicKeyPayload {
                timestamp: 1_596_673_292,
                public_key: "0x04deadbeef".to_string(),
                signature: "0xsigned".to_string(),
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct MockCallbacks {
        pub fired: Mutex<Vec<WalletOutOfFundsBody>>,
    }

    #[async_trait]
    impl Callbacks for MockCallbacks {
        async fn wallet_out_of_funds(&self, body: WalletOutOfFundsBody) {
            self.fired.lock().unwrap().push(body);
        }
    }

    pub(crate) fn new_owner(
        client: Arc<MockClient>,
        callbacks: Arc<MockCallbacks>,
    ) -> WalletOwner {
        WalletOwner::start(
            WalletOwnerServices {
                client,
                callbacks,
            },
            WalletOwnerProps {
                signer: PrivateKeySigner::from_str(TEST_PRIVATE_KEY).expect("test key parses"),
                nonce: 0,
                queue_depth: 64,
                cancel: CancellationToken::new(),
            },
        )
    }

    fn service_address() -> String {
        format!("0x{}", "6f".repeat(20))
    }

    #[tokio::test]
    async fn deploy_success_returns_the_contract_address() {
        let client = Arc::new(MockClient::default());
        let owner = new_owner(Arc::clone(&client), Arc::new(MockCallbacks::default()));

        let event = owner
            .deploy(
                1,
                DeployServiceRequest {
                    data: "0x0000".to_string(),
                },
            )
            .await;

        assert_eq!(
            event,
            Event::DeployService(DeployServiceEvent {
                id: 1,
                address: format!("{}", Address::ZERO),
            })
        );
    }

    #[tokio::test]
    async fn nonce_conflict_retries_with_a_refreshed_nonce() {
        let client = Arc::new(MockClient::default());
        client
            .send_results
            .lock()
            .unwrap()
            .push_back(Err(ClientError::InvalidNonce));
        client.send_results.lock().unwrap().push_back(Ok(accepted()));

        let owner = new_owner(Arc::clone(&client), Arc::new(MockCallbacks::default()));
        let event = owner
            .execute(
                0,
                ExecuteServiceRequest {
                    address: service_address(),
                    data: "0x00".to_string(),
                },
            )
            .await;

        assert!(matches!(event, Event::ExecuteService(_)));
        // First attempt used the initial nonce, the retry picked up the
        // backend's pending nonce.
        assert_eq!(*client.sent_nonces.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn nonces_increase_across_requests() {
        let client = Arc::new(MockClient::default());
        let owner = new_owner(Arc::clone(&client), Arc::new(MockCallbacks::default()));

        for id in 0..3 {
            let event = owner
                .execute(
                    id,
                    ExecuteServiceRequest {
                        address: service_address(),
                        data: "0x00".to_string(),
                    },
                )
                .await;
            assert!(matches!(event, Event::ExecuteService(_)));
        }

        assert_eq!(*client.sent_nonces.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn exceeds_balance_fires_the_callback_once() {
        let client = Arc::new(MockClient::default());
        client
            .send_results
            .lock()
            .unwrap()
            .push_back(Err(ClientError::ExceedsBalance));
        let callbacks = Arc::new(MockCallbacks::default());

        let owner = new_owner(Arc::clone(&client), Arc::clone(&callbacks));
        let event = owner
            .execute(
                0,
                ExecuteServiceRequest {
                    address: service_address(),
                    data: String::new(),
                },
            )
            .await;

        match event {
            Event::Error(error) => {
                assert_eq!(error.cause.error_code, ErrorCode::OutOfFunds.code())
            }
            other => panic!("expected an error event, got {other:?}"),
        }

        let fired = callbacks.fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].address, format!("{}", owner.address()));
    }

    #[tokio::test]
    async fn attempts_are_capped() {
        let client = Arc::new(MockClient::default());
        {
            let mut send_results = client.send_results.lock().unwrap();
            for _ in 0..20 {
                send_results.push_back(Err(ClientError::InvalidNonce));
            }
        }

        let owner = new_owner(Arc::clone(&client), Arc::new(MockCallbacks::default()));
        let event = owner
            .execute(
                0,
                ExecuteServiceRequest {
                    address: service_address(),
                    data: String::new(),
                },
            )
            .await;

        match event {
            Event::Error(error) => {
                assert_eq!(error.cause.error_code, ErrorCode::ExecuteFailed.code())
            }
            other => panic!("expected an error event, got {other:?}"),
        }
        assert_eq!(client.sent_nonces.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn estimate_failure_is_terminal() {
        let client = Arc::new(MockClient {
            estimate: Err(()),
            ..MockClient::default()
        });
        let owner = new_owner(Arc::clone(&client), Arc::new(MockCallbacks::default()));

        let event = owner
            .execute(
                3,
                ExecuteServiceRequest {
                    address: service_address(),
                    data: String::new(),
                },
            )
            .await;

        match event {
            Event::Error(error) => {
                assert_eq!(error.id, 3);
                assert_eq!(error.cause.error_code, ErrorCode::EstimateGas.code());
            }
            other => panic!("expected an error event, got {other:?}"),
        }
        assert!(client.sent_nonces.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_receipt_status_is_terminal() {
        let client = Arc::new(MockClient {
            receipt_status: 0,
            ..MockClient::default()
        });
        let owner = new_owner(Arc::clone(&client), Arc::new(MockCallbacks::default()));

        let event = owner
            .execute(
                0,
                ExecuteServiceRequest {
                    address: service_address(),
                    data: String::new(),
                },
            )
            .await;

        match event {
            Event::Error(error) => assert_eq!(
                error.cause.error_code,
                ErrorCode::TransactionReceiptStatus.code()
            ),
            other => panic!("expected an error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_public_key_rejects_malformed_addresses() {
        let owner = new_owner(
            Arc::new(MockClient::default()),
            Arc::new(MockCallbacks::default()),
        );

        for bad in ["", "0x1234", "not-hex"] {
            let err = owner
                .get_public_key(GetPublicKeyRequest {
                    address: bad.to_string(),
                })
                .await
                .unwrap_err();
            assert_eq!(err.error_code, ErrorCode::InputError.code());
        }

        let response = owner
            .get_public_key(GetPublicKeyRequest {
                address: service_address(),
            })
            .await
            .unwrap();
        assert_eq!(response.timestamp, 1_596_673_292);
        assert_eq!(response.address, service_address());
    }
}
