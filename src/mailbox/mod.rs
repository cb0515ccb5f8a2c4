//! Subscription mailbox: ordered per-key event storage polled by offset.
//!
//! Two interchangeable backends implement the same capability set: the
//! in-process sharded actor variant ([`mem`]) and the redis variant driven
//! by server-side scripts ([`redis`]). Which one runs is a configuration
//! choice; everything above this module talks to the [`Mailbox`] trait.

pub mod mem;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{MailboxConfig, MailboxProvider};
use crate::stats::StatsSource;

/// One stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub offset: u64,
    /// Discriminator the client uses to decode `value`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque serialized payload.
    pub value: String,
}

/// Window of elements returned by a retrieve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Elements {
    /// Offset of the first element in the scanned window, whether or not
    /// that element was set.
    pub offset: u64,
    pub elements: Vec<Element>,
}

/// Parameters of a discard.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardRequest {
    /// Drop all elements at or below this offset.
    pub offset: u64,
    /// With `keep_previous`, how many of the newest elements survive.
    pub count: usize,
    /// Keep only the newest `count` elements instead of cutting at
    /// `offset`.
    pub keep_previous: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("queue does not exist")]
    QueueNotFound,
    #[error("mailbox is shut down")]
    Shutdown,
    #[error("failed to serialize element: {0}")]
    Serialize(String),
    #[error("store operation failed: {0}")]
    Store(String),
    #[error("store refused the operation")]
    OpNotOk,
}

/// The mailbox capability: ordered per-key storage with offset-based
/// retrieval.
///
/// Offsets within a key are allocated by `next` and form a contiguous range
/// from the lowest retained offset; `discard` is the only way the lower
/// bound advances.
#[async_trait]
pub trait Mailbox: Send + Sync + 'static {
    /// Stores `element` under `key`. Creates the queue if needed; offsets
    /// below the retained range are ignored.
    async fn insert(&self, key: &str, element: Element) -> Result<(), MailboxError>;

    /// Returns up to `count` set elements at or after `offset`. Unknown
    /// keys yield an empty window, not an error.
    async fn retrieve(&self, key: &str, offset: u64, count: usize)
    -> Result<Elements, MailboxError>;

    /// Drops elements per `req`. Fails with [`MailboxError::QueueNotFound`]
    /// on unknown keys; otherwise idempotent.
    async fn discard(&self, key: &str, req: DiscardRequest) -> Result<(), MailboxError>;

    /// Allocates the next offset for `key`. Strictly increasing per key.
    async fn next(&self, key: &str) -> Result<u64, MailboxError>;

    /// Deletes the queue outright. Fails with
    /// [`MailboxError::QueueNotFound`] on unknown keys.
    async fn remove(&self, key: &str) -> Result<(), MailboxError>;

    async fn exists(&self, key: &str) -> Result<bool, MailboxError>;
}

/// Builds the configured mailbox backend. The second value is its stats
/// source, for backends that track per-method statistics.
pub async fn from_config(
    cfg: &MailboxConfig,
) -> Result<(Arc<dyn Mailbox>, Option<Arc<dyn StatsSource>>), MailboxError> {
    match cfg.provider {
        MailboxProvider::Mem => {
            let mailbox = Arc::new(mem::MemMailbox::start(mem::MemMailboxProps::default()));
            Ok((mailbox, None))
        }
        MailboxProvider::RedisSingle => {
            let addr = cfg
                .addr
                .clone()
                .ok_or_else(|| MailboxError::Store("redis-single requires an address".into()))?;
            let mailbox = Arc::new(redis::RedisMailbox::single(&addr).await?);
            Ok((mailbox.clone(), Some(mailbox)))
        }
        MailboxProvider::RedisCluster => {
            let mailbox = Arc::new(redis::RedisMailbox::cluster(cfg.addrs.clone()).await?);
            Ok((mailbox.clone(), Some(mailbox)))
        }
    }
}
