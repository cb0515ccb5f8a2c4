//! Redis-backed mailbox.
//!
//! Every operation is a single server-side Lua script evaluated against the
//! queue key, so each operation is atomic without any coordination from the
//! gateway. A queue is one redis hash: `base` and `next` fields plus one
//! `e:<offset>` field per element, each holding a JSON blob
//! `{offset, type, content, set}`. Keeping everything under one key also
//! keeps every script cluster-safe.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{FromRedisValue, Script};
use serde::{Deserialize, Serialize};

use crate::mailbox::{DiscardRequest, Element, Elements, Mailbox, MailboxError};
use crate::stats::{MethodSnapshot, MethodTracker};

const TRACKED_METHODS: &[&str] = &["insert", "retrieve", "discard", "next", "remove", "exists"];

const NEXT_SCRIPT: &str = r#"
redis.call('HSETNX', KEYS[1], 'base', 0)
local next = tonumber(redis.call('HGET', KEYS[1], 'next') or '0')
redis.call('HSET', KEYS[1], 'next', next + 1)
return next
"#;

const INSERT_SCRIPT: &str = r#"
redis.call('HSETNX', KEYS[1], 'base', 0)
local offset = tonumber(ARGV[1])
local base = tonumber(redis.call('HGET', KEYS[1], 'base') or '0')
local next = tonumber(redis.call('HGET', KEYS[1], 'next') or '0')
if offset < base then
  return 'OK'
end
for i = next, offset - 1 do
  redis.call('HSETNX', KEYS[1], 'e:' .. i, cjson.encode({offset = i, set = false}))
end
redis.call('HSET', KEYS[1], 'e:' .. offset, ARGV[2])
if offset >= next then
  redis.call('HSET', KEYS[1], 'next', offset + 1)
end
return 'OK'
"#;

const RETRIEVE_SCRIPT: &str = r#"
local offset = tonumber(ARGV[1])
local count = tonumber(ARGV[2])
local base = tonumber(redis.call('HGET', KEYS[1], 'base') or '0')
local next = tonumber(redis.call('HGET', KEYS[1], 'next') or '0')
local start = offset
if start < base then
  start = base
end
local res = {}
local set_count = 0
local i = start
while i < next and set_count < count do
  local el = redis.call('HGET', KEYS[1], 'e:' .. i)
  if el then
    table.insert(res, el)
    if cjson.decode(el).set then
      set_count = set_count + 1
    end
  end
  i = i + 1
end
return res
"#;

const DISCARD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'QueueNotFound'
end
local base = tonumber(redis.call('HGET', KEYS[1], 'base') or '0')
local next = tonumber(redis.call('HGET', KEYS[1], 'next') or '0')
local target
if ARGV[3] == '1' then
  target = next - tonumber(ARGV[2])
  if target < base then
    target = base
  end
else
  target = tonumber(ARGV[1]) + 1
  if target > next then
    target = next
  end
end
for i = base, target - 1 do
  redis.call('HDEL', KEYS[1], 'e:' .. i)
end
if target > base then
  redis.call('HSET', KEYS[1], 'base', target)
end
return 'OK'
"#;

const REMOVE_SCRIPT: &str = r#"
return redis.call('DEL', KEYS[1])
"#;

/// Wire shape of one stored element inside the hash.
#[derive(Debug, Serialize, Deserialize)]
struct RedisElement {
    offset: u64,
    #[serde(rename = "type")]
    kind: Option<String>,
    content: Option<String>,
    set: bool,
}

#[derive(Clone)]
enum RedisConn {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

struct Scripts {
    insert: Script,
    retrieve: Script,
    discard: Script,
    next: Script,
    remove: Script,
}

/// Mailbox backed by a redis instance or cluster.
pub struct RedisMailbox {
    conn: RedisConn,
    scripts: Scripts,
    tracker: MethodTracker,
}

impl RedisMailbox {
    pub async fn single(addr: &str) -> Result<Self, MailboxError> {
        let client = redis::Client::open(redis_url(addr)).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        Ok(Self::with_conn(RedisConn::Single(conn)))
    }

    pub async fn cluster(addrs: Vec<String>) -> Result<Self, MailboxError> {
        let urls: Vec<String> = addrs.iter().map(|addr| redis_url(addr)).collect();
        let client = ClusterClient::new(urls).map_err(store_error)?;
        let conn = client.get_async_connection().await.map_err(store_error)?;
        Ok(Self::with_conn(RedisConn::Cluster(conn)))
    }

    fn with_conn(conn: RedisConn) -> Self {
        RedisMailbox {
            conn,
            scripts: Scripts {
                insert: Script::new(INSERT_SCRIPT),
                retrieve: Script::new(RETRIEVE_SCRIPT),
                discard: Script::new(DISCARD_SCRIPT),
                next: Script::new(NEXT_SCRIPT),
                remove: Script::new(REMOVE_SCRIPT),
            },
            tracker: MethodTracker::new(TRACKED_METHODS),
        }
    }

    async fn eval<T: FromRedisValue>(
        &self,
        script: &Script,
        key: &str,
        args: &[String],
    ) -> Result<T, MailboxError> {
        let mut invocation = script.prepare_invoke();
        invocation.key(key);
        for arg in args {
            invocation.arg(arg.as_str());
        }

        match self.conn.clone() {
            RedisConn::Single(mut conn) => {
                invocation.invoke_async(&mut conn).await.map_err(store_error)
            }
            RedisConn::Cluster(mut conn) => {
                invocation.invoke_async(&mut conn).await.map_err(store_error)
            }
        }
    }
}

impl crate::stats::StatsSource for RedisMailbox {
    fn name(&self) -> &'static str {
        "mailbox.redis"
    }

    fn stats(&self) -> Vec<MethodSnapshot> {
        self.tracker.snapshot()
    }
}

fn redis_url(addr: &str) -> String {
    if addr.starts_with("redis://") || addr.starts_with("rediss://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    }
}

fn store_error(err: redis::RedisError) -> MailboxError {
    MailboxError::Store(err.to_string())
}

fn expect_ok(status: String) -> Result<(), MailboxError> {
    match status.as_str() {
        "OK" => Ok(()),
        "QueueNotFound" => Err(MailboxError::QueueNotFound),
        _ => Err(MailboxError::OpNotOk),
    }
}

#[async_trait]
impl Mailbox for RedisMailbox {
    async fn insert(&self, key: &str, element: Element) -> Result<(), MailboxError> {
        self.tracker
            .instrument("insert", async {
                let blob = serde_json::to_string(&RedisElement {
                    offset: element.offset,
                    kind: Some(element.kind),
                    content: Some(element.value),
                    set: true,
                })
                .map_err(|err| MailboxError::Serialize(err.to_string()))?;

                let status: String = self
                    .eval(
                        &self.scripts.insert,
                        key,
                        &[element.offset.to_string(), blob],
                    )
                    .await?;
                expect_ok(status)
            })
            .await
    }

    async fn retrieve(
        &self,
        key: &str,
        offset: u64,
        count: usize,
    ) -> Result<Elements, MailboxError> {
        self.tracker
            .instrument("retrieve", async {
                let blobs: Vec<String> = self
                    .eval(
                        &self.scripts.retrieve,
                        key,
                        &[offset.to_string(), count.to_string()],
                    )
                    .await?;

                let mut window_offset = None;
                let mut elements = Vec::new();
                for blob in blobs {
                    let decoded: RedisElement = serde_json::from_str(&blob)
                        .map_err(|err| MailboxError::Serialize(err.to_string()))?;

                    // The first scanned entry positions the window whether
                    // or not it has been set yet.
                    if window_offset.is_none() {
                        window_offset = Some(decoded.offset);
                    }
                    if !decoded.set {
                        continue;
                    }

                    elements.push(Element {
                        offset: decoded.offset,
                        kind: decoded.kind.unwrap_or_default(),
                        value: decoded.content.unwrap_or_default(),
                    });
                }

                Ok(Elements {
                    offset: window_offset.unwrap_or(0),
                    elements,
                })
            })
            .await
    }

    async fn discard(&self, key: &str, req: DiscardRequest) -> Result<(), MailboxError> {
        self.tracker
            .instrument("discard", async {
                let status: String = self
                    .eval(
                        &self.scripts.discard,
                        key,
                        &[
                            req.offset.to_string(),
                            req.count.to_string(),
                            if req.keep_previous { "1" } else { "0" }.to_string(),
                        ],
                    )
                    .await?;
                expect_ok(status)
            })
            .await
    }

    async fn next(&self, key: &str) -> Result<u64, MailboxError> {
        self.tracker
            .instrument("next", async {
                let offset: i64 = self.eval(&self.scripts.next, key, &[]).await?;
                Ok(offset as u64)
            })
            .await
    }

    async fn remove(&self, key: &str) -> Result<(), MailboxError> {
        self.tracker
            .instrument("remove", async {
                let deleted: i64 = self.eval(&self.scripts.remove, key, &[]).await?;
                if deleted == 0 {
                    return Err(MailboxError::QueueNotFound);
                }
                Ok(())
            })
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool, MailboxError> {
        self.tracker
            .instrument("exists", async {
                let found: i64 = match self.conn.clone() {
                    RedisConn::Single(mut conn) => redis::cmd("EXISTS")
                        .arg(key)
                        .query_async(&mut conn)
                        .await
                        .map_err(store_error)?,
                    RedisConn::Cluster(mut conn) => redis::cmd("EXISTS")
                        .arg(key)
                        .query_async(&mut conn)
                        .await
                        .map_err(store_error)?,
                };
                Ok(found == 1)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_blob_round_trips() {
        let blob = serde_json::to_string(&RedisElement {
            offset: 3,
            kind: Some("errorEvent".to_string()),
            content: Some("{\"id\":3}".to_string()),
            set: true,
        })
        .unwrap();

        let decoded: RedisElement = serde_json::from_str(&blob).unwrap();
        assert_eq!(decoded.offset, 3);
        assert_eq!(decoded.kind.as_deref(), Some("errorEvent"));
        assert!(decoded.set);
    }

    #[test]
    fn unset_placeholder_blob_decodes() {
        // The insert script pads holes with entries shaped like this.
        let decoded: RedisElement = serde_json::from_str(r#"{"offset":4,"set":false}"#).unwrap();
        assert_eq!(decoded.offset, 4);
        assert!(decoded.kind.is_none());
        assert!(!decoded.set);
    }

    #[test]
    fn status_mapping() {
        assert!(expect_ok("OK".to_string()).is_ok());
        assert!(matches!(
            expect_ok("QueueNotFound".to_string()),
            Err(MailboxError::QueueNotFound)
        ));
        assert!(matches!(
            expect_ok("???".to_string()),
            Err(MailboxError::OpNotOk)
        ));
    }
}
