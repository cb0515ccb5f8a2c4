//! Fixed-size connection pool multiplexing request/response exchanges over a
//! streaming transport.
//!
//! The pool owns its connections outright. Callers only ever touch the
//! shared request channel: exchanges wait there in FIFO order and any free
//! connection task picks the next one up, so pairing of request to
//! connection is arbitrary.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const REQUEST_QUEUE_DEPTH: usize = 64;

/// Dials connections for the pool.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    type Conn: Conn;

    async fn dial(&self) -> io::Result<Self::Conn>;
}

/// One established connection capable of serial request/response exchanges.
#[async_trait]
pub trait Conn: Send + 'static {
    /// Writes `payload` and reads the matching response.
    async fn exchange(&mut self, payload: &[u8]) -> io::Result<Vec<u8>>;

    /// Closes the connection. Errors during close are not interesting.
    async fn close(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to establish connection pool: {0}")]
    DialFailed(io::Error),
    #[error("connection pool is shut down")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(io::Error),
}

pub struct FixedConnPoolProps<C> {
    pub conns: usize,
    pub channel: C,
}

struct Exchange {
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<u8>, PoolError>>,
}

/// Fixed pool of long-lived connections behind a single request channel.
pub struct FixedConnPool {
    request_tx: mpsc::Sender<Exchange>,
    cancel: CancellationToken,
}

impl FixedConnPool {
    /// Establishes `conns` connections up front.
    ///
    /// If any dial fails, every connection established so far is closed and
    /// [`PoolError::DialFailed`] is returned.
    pub async fn dial<C: Channel>(props: FixedConnPoolProps<C>) -> Result<Self, PoolError> {
        let mut conns = Vec::with_capacity(props.conns);
        for _ in 0..props.conns {
            match props.channel.dial().await {
                Ok(conn) => conns.push(conn),
                Err(err) => {
                    for mut conn in conns {
                        conn.close().await;
                    }
                    return Err(PoolError::DialFailed(err));
                }
            }
        }

        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let request_rx = Arc::new(Mutex::new(request_rx));
        let cancel = CancellationToken::new();

        for conn in conns {
            tokio::spawn(conn_loop(conn, Arc::clone(&request_rx), cancel.clone()));
        }

        Ok(FixedConnPool { request_tx, cancel })
    }

    /// Submits one exchange and waits for its response.
    ///
    /// If the caller stops waiting, the response that may still arrive on
    /// the connection is dropped by the serving task.
    pub async fn request(&self, payload: Vec<u8>) -> Result<Vec<u8>, PoolError> {
        let (reply, response) = oneshot::channel();
        self.request_tx
            .send(Exchange { payload, reply })
            .await
            .map_err(|_| PoolError::Closed)?;
        response.await.map_err(|_| PoolError::Closed)?
    }

    /// Stops all connection tasks. In-flight exchanges finish; queued ones
    /// receive [`PoolError::Closed`] when their reply channel is dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FixedConnPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn conn_loop<C: Conn>(
    mut conn: C,
    request_rx: Arc<Mutex<mpsc::Receiver<Exchange>>>,
    cancel: CancellationToken,
) {
    loop {
        // The receiver lock is held only while waiting for work, never
        // across the exchange itself.
        let exchange = {
            let mut rx = request_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(exchange) => exchange,
                    None => break,
                },
            }
        };

        let result = conn
            .exchange(&exchange.payload)
            .await
            .map_err(PoolError::Transport);
        // A send failure means the caller abandoned the exchange.
        let _ = exchange.reply.send(result);
    }

    conn.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoConn {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Conn for EchoConn {
        async fn exchange(&mut self, payload: &[u8]) -> io::Result<Vec<u8>> {
            let mut response = b"echo:".to_vec();
            response.extend_from_slice(payload);
            Ok(response)
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct EchoChannel {
        fail_after: Option<usize>,
        dialed: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Channel for EchoChannel {
        type Conn = EchoConn;

        async fn dial(&self) -> io::Result<EchoConn> {
            let n = self.dialed.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.fail_after {
                return Err(io::Error::other("dial refused"));
            }
            Ok(EchoConn {
                closed: Arc::clone(&self.closed),
            })
        }
    }

    fn channel(fail_after: Option<usize>) -> (EchoChannel, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        (
            EchoChannel {
                fail_after,
                dialed: AtomicUsize::new(0),
                closed: Arc::clone(&closed),
            },
            closed,
        )
    }

    #[tokio::test]
    async fn concurrent_exchanges_share_the_pool() {
        let (channel, _closed) = channel(None);
        let pool = Arc::new(
            FixedConnPool::dial(FixedConnPoolProps { conns: 3, channel })
                .await
                .expect("pool dials"),
        );

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.request(vec![i]).await.expect("exchange succeeds")
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let response = handle.await.expect("task completes");
            assert_eq!(response, [b"echo:".as_slice(), &[i as u8]].concat());
        }
    }

    #[tokio::test]
    async fn failed_dial_closes_established_connections() {
        let (channel, closed) = channel(Some(2));
        let result = FixedConnPool::dial(FixedConnPoolProps { conns: 4, channel }).await;

        assert!(matches!(result, Err(PoolError::DialFailed(_))));
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let (channel, _closed) = channel(None);
        let pool = FixedConnPool::dial(FixedConnPoolProps { conns: 1, channel })
            .await
            .expect("pool dials");

        pool.shutdown();
        // Let the serving task observe the cancellation and drop the
        // request receiver.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let result = pool.request(b"late".to_vec()).await;
        assert!(matches!(result, Err(PoolError::Closed)));
    }
}
