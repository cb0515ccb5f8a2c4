//! Routes service requests to wallet owners and lands their events in the
//! mailbox.
//!
//! Request ids are allocated through the mailbox's `next` for the caller's
//! key, which makes them strictly increasing per key and ties every event
//! to the offset a client will poll it at.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::Client;
use crate::callback::Callbacks;
use crate::config::BackendConfig;
use crate::mailbox::{DiscardRequest, Element, Mailbox, MailboxError};
use crate::types::{
    DeployServiceRequest, Error, ErrorCode, Event, ExecuteServiceRequest, GetPublicKeyRequest,
    GetPublicKeyResponse, PollServiceRequest, PollServiceResponse, validate_service_address,
};

use super::owner::{WalletOwner, WalletOwnerProps, WalletOwnerServices};

const OWNER_QUEUE_DEPTH: usize = 64;

/// Front door of the transaction pipeline: one instance serves every
/// authenticated session, holding one wallet owner per configured key.
pub struct Executor {
    owners: Vec<WalletOwner>,
    mailbox: Arc<dyn Mailbox>,
}

impl Executor {
    /// Creates one wallet owner per configured private key, fetching each
    /// wallet's pending nonce first.
    pub async fn start(
        cfg: &BackendConfig,
        client: Arc<dyn Client>,
        callbacks: Arc<dyn Callbacks>,
        mailbox: Arc<dyn Mailbox>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let mut owners = Vec::with_capacity(cfg.private_keys.len());
        for signer in &cfg.private_keys {
            let address = signer.address();
            let nonce = client.nonce_at(address).await.map_err(|err| {
                tracing::error!(wallet = %address, error = %err, "failed to fetch wallet nonce");
                Error::with_description(
                    ErrorCode::InternalError,
                    "failed to fetch the wallet nonce at startup",
                )
            })?;

            let owner = WalletOwner::start(
                WalletOwnerServices {
                    client: Arc::clone(&client),
                    callbacks: Arc::clone(&callbacks),
                },
                WalletOwnerProps {
                    signer: signer.clone(),
                    nonce,
                    queue_depth: OWNER_QUEUE_DEPTH,
                    cancel: cancel.clone(),
                },
            );
            tracing::info!(wallet = %owner.address(), nonce, "wallet owner started");
            owners.push(owner);
        }

        Ok(Executor { owners, mailbox })
    }

    #[cfg(test)]
    pub(crate) fn with_owners(owners: Vec<WalletOwner>, mailbox: Arc<dyn Mailbox>) -> Self {
        Executor { owners, mailbox }
    }

    /// Binds a session key to one wallet owner. The mapping is stable for
    /// the process lifetime, so a session's transactions stay serialized on
    /// one wallet.
    fn owner_for(&self, key: &str) -> &WalletOwner {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.owners[(hasher.finish() % self.owners.len() as u64) as usize]
    }

    pub async fn execute_service(&self, key: &str, req: ExecuteServiceRequest) -> Event {
        let id = match self.allocate_id(key).await {
            Ok(id) => id,
            Err(event) => return event,
        };

        if let Err(err) = validate_service_address(&req.address) {
            return self.finish(key, Event::error(id, err)).await;
        }

        let event = self.owner_for(key).execute(id, req).await;
        self.finish(key, event).await
    }

    pub async fn deploy_service(&self, key: &str, req: DeployServiceRequest) -> Event {
        let id = match self.allocate_id(key).await {
            Ok(id) => id,
            Err(event) => return event,
        };

        let event = self.owner_for(key).deploy(id, req).await;
        self.finish(key, event).await
    }

    pub async fn get_public_key_service(
        &self,
        req: GetPublicKeyRequest,
    ) -> Result<GetPublicKeyResponse, Error> {
        // Key material is wallet-independent; any owner can serve this.
        self.owners[0].get_public_key(req).await
    }

    /// Retrieves a window of events for the caller, optionally discarding
    /// everything before the requested offset first.
    pub async fn poll_service(
        &self,
        key: &str,
        req: PollServiceRequest,
    ) -> Result<PollServiceResponse, Error> {
        if req.discard_previous && req.offset > 0 {
            match self
                .mailbox
                .discard(
                    key,
                    DiscardRequest {
                        offset: req.offset - 1,
                        ..Default::default()
                    },
                )
                .await
            {
                // Nothing to drop for a stream that has no queue yet.
                Ok(()) | Err(MailboxError::QueueNotFound) => {}
                Err(err) => return Err(internal(err)),
            }
        }

        let window = self
            .mailbox
            .retrieve(key, req.offset, req.count)
            .await
            .map_err(internal)?;

        let mut events = Vec::with_capacity(window.elements.len());
        for element in window.elements {
            let mut decoded: serde_json::Value =
                serde_json::from_str(&element.value).map_err(|err| {
                    tracing::error!(key, offset = element.offset, error = %err, "corrupt mailbox element");
                    Error::new(ErrorCode::InternalError)
                })?;
            if let Some(object) = decoded.as_object_mut() {
                object.insert("type".to_string(), element.kind.clone().into());
            }
            events.push(decoded);
        }

        Ok(PollServiceResponse {
            offset: window.offset,
            events,
        })
    }

    async fn allocate_id(&self, key: &str) -> Result<u64, Event> {
        self.mailbox.next(key).await.map_err(|err| {
            tracing::error!(key, error = %err, "failed to allocate a request id");
            Event::error(
                0,
                Error::with_description(
                    ErrorCode::InternalError,
                    "failed to allocate a request id",
                ),
            )
        })
    }

    /// Lands the event in the caller's stream at the offset matching its
    /// id, then hands it back for the synchronous response. A mailbox
    /// failure loses the polled copy, not the response.
    async fn finish(&self, key: &str, event: Event) -> Event {
        let serialized = match serde_json::to_string(&event) {
            Ok(serialized) => serialized,
            Err(err) => {
                tracing::error!(key, error = %err, "failed to serialize event");
                return event;
            }
        };

        let element = Element {
            offset: event.id(),
            kind: event.kind().to_string(),
            value: serialized,
        };
        if let Err(err) = self.mailbox.insert(key, element).await {
            tracing::error!(key, id = event.id(), error = %err, "failed to store event");
        }

        event
    }
}

fn internal(err: MailboxError) -> Error {
    tracing::error!(error = %err, "mailbox operation failed");
    match err {
        MailboxError::QueueNotFound => Error::new(ErrorCode::QueueNotFound),
        _ => Error::new(ErrorCode::InternalError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::mem::{MemMailbox, MemMailboxProps};
    use crate::tx::owner::tests::{MockCallbacks, MockClient, new_owner};
    use crate::types::ErrorEvent;

    fn executor(client: Arc<MockClient>) -> Executor {
        let mailbox: Arc<dyn Mailbox> = Arc::new(MemMailbox::start(MemMailboxProps::default()));
        let owner = new_owner(client, Arc::new(MockCallbacks::default()));
        Executor::with_owners(vec![owner], mailbox)
    }

    #[tokio::test]
    async fn empty_address_fails_without_touching_the_backend() {
        let client = Arc::new(MockClient::default());
        let executor = executor(Arc::clone(&client));

        let event = executor
            .execute_service(
                "session",
                ExecuteServiceRequest {
                    address: String::new(),
                    data: "0x00".to_string(),
                },
            )
            .await;

        assert_eq!(
            event,
            Event::Error(ErrorEvent {
                id: 0,
                cause: Error::with_description(
                    ErrorCode::InputError,
                    "Provided invalid address."
                ),
            })
        );
        assert!(client.sent_nonces.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_land_in_the_mailbox_under_their_id() {
        let client = Arc::new(MockClient::default());
        let executor = executor(client);

        let first = executor
            .deploy_service(
                "session",
                DeployServiceRequest {
                    data: "0x00".to_string(),
                },
            )
            .await;
        let second = executor
            .deploy_service(
                "session",
                DeployServiceRequest {
                    data: "0x01".to_string(),
                },
            )
            .await;

        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);

        let polled = executor
            .poll_service(
                "session",
                PollServiceRequest {
                    offset: 0,
                    count: 10,
                    discard_previous: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(polled.offset, 0);
        assert_eq!(polled.events.len(), 2);
        assert_eq!(polled.events[0]["id"], 0);
        assert_eq!(polled.events[0]["type"], "deployServiceEvent");
        assert_eq!(polled.events[1]["id"], 1);
    }

    #[tokio::test]
    async fn ids_stay_isolated_between_keys() {
        let client = Arc::new(MockClient::default());
        let executor = executor(client);

        let a = executor
            .deploy_service("session-a", DeployServiceRequest { data: String::new() })
            .await;
        let b = executor
            .deploy_service("session-b", DeployServiceRequest { data: String::new() })
            .await;

        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 0);
    }

    #[tokio::test]
    async fn poll_discards_previous_events_when_asked() {
        let client = Arc::new(MockClient::default());
        let executor = executor(client);

        for _ in 0..3 {
            executor
                .deploy_service("session", DeployServiceRequest { data: String::new() })
                .await;
        }

        let polled = executor
            .poll_service(
                "session",
                PollServiceRequest {
                    offset: 2,
                    count: 10,
                    discard_previous: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(polled.events.len(), 1);
        assert_eq!(polled.events[0]["id"], 2);

        // The discarded range stays gone for subsequent polls.
        let replay = executor
            .poll_service(
                "session",
                PollServiceRequest {
                    offset: 0,
                    count: 10,
                    discard_previous: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(replay.offset, 2);
        assert_eq!(replay.events.len(), 1);
    }
}
