//! In-process mailbox backend.
//!
//! A single supervisor task owns the `key -> queue` map and routes every
//! operation; each active key runs its own single-consumer actor so
//! operations on one key are linearised without any shared locks. Actors
//! that sit idle long enough report themselves on a shared done channel and
//! the supervisor deregisters them; their state is gone after that.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use crate::mailbox::{DiscardRequest, Element, Elements, Mailbox, MailboxError};

#[derive(Debug, Clone, Copy)]
pub struct MemMailboxProps {
    /// How long a queue actor may sit without traffic before it evicts
    /// itself, destroying the queue state.
    pub idle_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for MemMailboxProps {
    fn default() -> Self {
        MemMailboxProps {
            idle_timeout: Duration::from_secs(300),
            queue_depth: 64,
        }
    }
}

enum ServerOp {
    Insert {
        key: String,
        element: Element,
        out: oneshot::Sender<Result<(), MailboxError>>,
    },
    Retrieve {
        key: String,
        offset: u64,
        count: usize,
        out: oneshot::Sender<Elements>,
    },
    Discard {
        key: String,
        req: DiscardRequest,
        out: oneshot::Sender<Result<(), MailboxError>>,
    },
    Next {
        key: String,
        out: oneshot::Sender<u64>,
    },
    Remove {
        key: String,
        out: oneshot::Sender<Result<(), MailboxError>>,
    },
    Exists {
        key: String,
        out: oneshot::Sender<bool>,
    },
}

enum QueueOp {
    Insert {
        element: Element,
        out: oneshot::Sender<Result<(), MailboxError>>,
    },
    Retrieve {
        offset: u64,
        count: usize,
        out: oneshot::Sender<Elements>,
    },
    Discard {
        req: DiscardRequest,
        out: oneshot::Sender<Result<(), MailboxError>>,
    },
    Next {
        out: oneshot::Sender<u64>,
    },
}

/// Handle to the in-memory mailbox server.
pub struct MemMailbox {
    tx: mpsc::Sender<ServerOp>,
}

impl MemMailbox {
    pub fn start(props: MemMailboxProps) -> Self {
        let (tx, rx) = mpsc::channel(props.queue_depth);
        let (done_tx, done_rx) = mpsc::channel(props.queue_depth);
        tokio::spawn(
            Supervisor {
                rx,
                done_tx,
                done_rx,
                queues: HashMap::new(),
                props,
            }
            .run(),
        );
        MemMailbox { tx }
    }

    async fn dispatch<T>(
        &self,
        op: ServerOp,
        response: oneshot::Receiver<T>,
    ) -> Result<T, MailboxError> {
        self.tx.send(op).await.map_err(|_| MailboxError::Shutdown)?;
        response.await.map_err(|_| MailboxError::Shutdown)
    }
}

struct Supervisor {
    rx: mpsc::Receiver<ServerOp>,
    done_tx: mpsc::Sender<String>,
    done_rx: mpsc::Receiver<String>,
    queues: HashMap<String, mpsc::Sender<QueueOp>>,
    props: MemMailboxProps,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(key) = self.done_rx.recv() => {
                    // The actor evicted itself; dropping the sender lets it
                    // drain whatever is still buffered and exit.
                    self.queues.remove(&key);
                }
                op = self.rx.recv() => match op {
                    None => break,
                    Some(op) => self.serve(op).await,
                },
            }
        }
    }

    async fn serve(&mut self, op: ServerOp) {
        match op {
            ServerOp::Insert { key, element, out } => {
                let queue = self.queue_for(&key);
                if queue.send(QueueOp::Insert { element, out }).await.is_err() {
                    tracing::warn!(key, "queue actor rejected an insert while deregistering");
                }
            }
            ServerOp::Retrieve {
                key,
                offset,
                count,
                out,
            } => match self.queues.get(&key) {
                None => {
                    let _ = out.send(Elements::default());
                }
                Some(queue) => {
                    let _ = queue.send(QueueOp::Retrieve { offset, count, out }).await;
                }
            },
            ServerOp::Discard { key, req, out } => match self.queues.get(&key) {
                None => {
                    let _ = out.send(Err(MailboxError::QueueNotFound));
                }
                Some(queue) => {
                    let _ = queue.send(QueueOp::Discard { req, out }).await;
                }
            },
            ServerOp::Next { key, out } => {
                let queue = self.queue_for(&key);
                let _ = queue.send(QueueOp::Next { out }).await;
            }
            ServerOp::Remove { key, out } => {
                let result = match self.queues.remove(&key) {
                    Some(_) => Ok(()),
                    None => Err(MailboxError::QueueNotFound),
                };
                let _ = out.send(result);
            }
            ServerOp::Exists { key, out } => {
                let _ = out.send(self.queues.contains_key(&key));
            }
        }
    }

    fn queue_for(&mut self, key: &str) -> mpsc::Sender<QueueOp> {
        if let Some(queue) = self.queues.get(key) {
            return queue.clone();
        }

        let (tx, rx) = mpsc::channel(self.props.queue_depth);
        tokio::spawn(
            QueueActor {
                key: key.to_string(),
                rx,
                done: self.done_tx.clone(),
                idle_timeout: self.props.idle_timeout,
                base: 0,
                next: 0,
                slots: VecDeque::new(),
            }
            .run(),
        );
        self.queues.insert(key.to_string(), tx.clone());
        tx
    }
}

struct Slot {
    kind: String,
    value: String,
    set: bool,
}

struct QueueActor {
    key: String,
    rx: mpsc::Receiver<QueueOp>,
    done: mpsc::Sender<String>,
    idle_timeout: Duration,
    /// Lowest retained offset; the front slot, when any slots exist.
    base: u64,
    /// Next offset to hand out. Always above every stored offset.
    next: u64,
    slots: VecDeque<Slot>,
}

impl QueueActor {
    async fn run(mut self) {
        let mut evicting = false;
        loop {
            tokio::select! {
                op = self.rx.recv() => match op {
                    None => break,
                    Some(op) => self.serve(op),
                },
                _ = sleep(self.idle_timeout), if !evicting => {
                    let _ = self.done.send(self.key.clone()).await;
                    // Keep serving whatever is already buffered until the
                    // supervisor drops our sender.
                    evicting = true;
                }
            }
        }
    }

    fn serve(&mut self, op: QueueOp) {
        match op {
            QueueOp::Insert { element, out } => {
                self.insert(element);
                let _ = out.send(Ok(()));
            }
            QueueOp::Retrieve { offset, count, out } => {
                let _ = out.send(self.retrieve(offset, count));
            }
            QueueOp::Discard { req, out } => {
                self.discard(req);
                let _ = out.send(Ok(()));
            }
            QueueOp::Next { out } => {
                let _ = out.send(self.next);
                self.next += 1;
            }
        }
    }

    fn insert(&mut self, element: Element) {
        if element.offset < self.base {
            // Below the retained range; already discarded.
            return;
        }

        // Pad with unset placeholders so offsets stay contiguous up to the
        // inserted one.
        while self.base + self.slots.len() as u64 <= element.offset {
            self.slots.push_back(Slot {
                kind: String::new(),
                value: String::new(),
                set: false,
            });
        }

        let index = (element.offset - self.base) as usize;
        self.slots[index] = Slot {
            kind: element.kind,
            value: element.value,
            set: true,
        };

        if element.offset >= self.next {
            self.next = element.offset + 1;
        }
    }

    fn retrieve(&self, offset: u64, count: usize) -> Elements {
        let start = offset.max(self.base);
        let end = self.base + self.slots.len() as u64;
        if start >= end {
            return Elements::default();
        }

        let mut elements = Vec::new();
        for current in start..end {
            if elements.len() >= count {
                break;
            }
            let slot = &self.slots[(current - self.base) as usize];
            if slot.set {
                elements.push(Element {
                    offset: current,
                    kind: slot.kind.clone(),
                    value: slot.value.clone(),
                });
            }
        }

        Elements {
            offset: start,
            elements,
        }
    }

    fn discard(&mut self, req: DiscardRequest) {
        if req.keep_previous {
            let keep = req.count.min(self.slots.len());
            while self.slots.len() > keep {
                self.slots.pop_front();
                self.base += 1;
            }
        } else {
            while !self.slots.is_empty() && self.base <= req.offset {
                self.slots.pop_front();
                self.base += 1;
            }
        }
    }
}

#[async_trait]
impl Mailbox for MemMailbox {
    async fn insert(&self, key: &str, element: Element) -> Result<(), MailboxError> {
        let (out, response) = oneshot::channel();
        self.dispatch(
            ServerOp::Insert {
                key: key.to_string(),
                element,
                out,
            },
            response,
        )
        .await?
    }

    async fn retrieve(
        &self,
        key: &str,
        offset: u64,
        count: usize,
    ) -> Result<Elements, MailboxError> {
        let (out, response) = oneshot::channel();
        self.dispatch(
            ServerOp::Retrieve {
                key: key.to_string(),
                offset,
                count,
                out,
            },
            response,
        )
        .await
    }

    async fn discard(&self, key: &str, req: DiscardRequest) -> Result<(), MailboxError> {
        let (out, response) = oneshot::channel();
        self.dispatch(
            ServerOp::Discard {
                key: key.to_string(),
                req,
                out,
            },
            response,
        )
        .await?
    }

    async fn next(&self, key: &str) -> Result<u64, MailboxError> {
        let (out, response) = oneshot::channel();
        self.dispatch(
            ServerOp::Next {
                key: key.to_string(),
                out,
            },
            response,
        )
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), MailboxError> {
        let (out, response) = oneshot::channel();
        self.dispatch(
            ServerOp::Remove {
                key: key.to_string(),
                out,
            },
            response,
        )
        .await?
    }

    async fn exists(&self, key: &str) -> Result<bool, MailboxError> {
        let (out, response) = oneshot::channel();
        self.dispatch(
            ServerOp::Exists {
                key: key.to_string(),
                out,
            },
            response,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox() -> MemMailbox {
        MemMailbox::start(MemMailboxProps::default())
    }

    fn element(offset: u64, value: &str) -> Element {
        Element {
            offset,
            kind: "executeServiceEvent".to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn retrieve_from_unknown_key_is_empty() {
        let mailbox = mailbox();
        let window = mailbox.retrieve("k", 0, 10).await.unwrap();
        assert_eq!(window.offset, 0);
        assert!(window.elements.is_empty());
    }

    #[tokio::test]
    async fn insert_then_retrieve_round_trips() {
        let mailbox = mailbox();
        let offset = mailbox.next("k").await.unwrap();
        mailbox.insert("k", element(offset, "a")).await.unwrap();

        let window = mailbox.retrieve("k", offset, 1).await.unwrap();
        assert_eq!(window.offset, offset);
        assert_eq!(window.elements, vec![element(offset, "a")]);
    }

    #[tokio::test]
    async fn next_is_strictly_increasing() {
        let mailbox = mailbox();
        let mut previous = None;
        for _ in 0..10 {
            let offset = mailbox.next("k").await.unwrap();
            if let Some(previous) = previous {
                assert!(offset > previous);
            }
            previous = Some(offset);
        }
    }

    #[tokio::test]
    async fn unset_offsets_are_skipped_but_position_the_window() {
        let mailbox = mailbox();
        for _ in 0..3 {
            mailbox.next("k").await.unwrap();
        }
        mailbox.insert("k", element(2, "late")).await.unwrap();

        let window = mailbox.retrieve("k", 0, 10).await.unwrap();
        assert_eq!(window.offset, 0);
        assert_eq!(window.elements, vec![element(2, "late")]);
    }

    #[tokio::test]
    async fn retrieve_respects_offset_and_count() {
        let mailbox = mailbox();
        for i in 0..5 {
            let offset = mailbox.next("k").await.unwrap();
            mailbox
                .insert("k", element(offset, &format!("v{i}")))
                .await
                .unwrap();
        }

        let window = mailbox.retrieve("k", 1, 2).await.unwrap();
        assert_eq!(window.offset, 1);
        assert_eq!(
            window.elements,
            vec![element(1, "v1"), element(2, "v2")]
        );
        for returned in &window.elements {
            assert!(returned.offset >= 1);
        }
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let mailbox = mailbox();
        for i in 0..3 {
            let offset = mailbox.next("k").await.unwrap();
            mailbox
                .insert("k", element(offset, &format!("v{i}")))
                .await
                .unwrap();
        }

        let req = DiscardRequest {
            offset: 1,
            ..Default::default()
        };
        mailbox.discard("k", req).await.unwrap();
        let first = mailbox.retrieve("k", 0, 10).await.unwrap();

        mailbox.discard("k", req).await.unwrap();
        let second = mailbox.retrieve("k", 0, 10).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.offset, 2);
        assert_eq!(first.elements, vec![element(2, "v2")]);
    }

    #[tokio::test]
    async fn discard_keep_previous_retains_the_newest() {
        let mailbox = mailbox();
        for i in 0..4 {
            let offset = mailbox.next("k").await.unwrap();
            mailbox
                .insert("k", element(offset, &format!("v{i}")))
                .await
                .unwrap();
        }

        mailbox
            .discard(
                "k",
                DiscardRequest {
                    offset: 0,
                    count: 2,
                    keep_previous: true,
                },
            )
            .await
            .unwrap();

        let window = mailbox.retrieve("k", 0, 10).await.unwrap();
        assert_eq!(window.offset, 2);
        assert_eq!(
            window.elements,
            vec![element(2, "v2"), element(3, "v3")]
        );
    }

    #[tokio::test]
    async fn discard_on_unknown_key_fails() {
        let mailbox = mailbox();
        let err = mailbox
            .discard("missing", DiscardRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MailboxError::QueueNotFound));
    }

    #[tokio::test]
    async fn remove_destroys_the_queue() {
        let mailbox = mailbox();
        mailbox.insert("k", element(0, "a")).await.unwrap();
        assert!(mailbox.exists("k").await.unwrap());

        mailbox.remove("k").await.unwrap();
        assert!(!mailbox.exists("k").await.unwrap());
        let window = mailbox.retrieve("k", 0, 10).await.unwrap();
        assert!(window.elements.is_empty());

        let err = mailbox.remove("k").await.unwrap_err();
        assert!(matches!(err, MailboxError::QueueNotFound));
    }

    #[tokio::test]
    async fn idle_queues_evict_themselves() {
        let mailbox = MemMailbox::start(MemMailboxProps {
            idle_timeout: Duration::from_millis(50),
            queue_depth: 8,
        });
        mailbox.insert("k", element(0, "a")).await.unwrap();
        assert!(mailbox.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!mailbox.exists("k").await.unwrap());
    }
}
