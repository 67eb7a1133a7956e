//! Bounded FIFO queues connecting a pump to the caller.
//!
//! A queue is split into a [`QueueSender`] and a [`QueueReceiver`]. The input
//! queue hands the sender to the caller and the receiver to the input pump; the
//! output and error queues do the reverse. A full queue suspends its producer
//! until the consumer removes an entry. A closed queue keeps its buffered chunks
//! available and only reports "no more data" once they have all been drained.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::SendError;
use crate::error::StreamError;
use crate::error::StreamKind;
use crate::error::TryRecvError;

/// One queue entry. Chunk boundaries carry no meaning.
pub type Chunk = Vec<u8>;

/// Why a queue stopped admitting chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The stream reported end-of-file.
    EndOfStream,
    /// `close()` was called on one of the queue halves.
    ClosedByCaller,
    /// The owning process is shutting down.
    Shutdown,
    /// The pump was aborted before it could observe end-of-stream.
    Aborted,
    /// Every sender was dropped without an explicit close.
    SenderDropped,
    /// The consumer went away; buffered chunks were discarded.
    ReceiverDropped,
    /// The pump hit a read, write or enqueue failure.
    Failed(StreamError),
}

impl CloseReason {
    pub fn error(&self) -> Option<&StreamError> {
        match self {
            CloseReason::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// True when the stream ended without a failure.
    pub fn is_clean(&self) -> bool {
        !matches!(self, CloseReason::Failed(_) | CloseReason::Aborted)
    }
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<Chunk>,
    close_reason: Option<CloseReason>,
    dropped: u64,
}

struct Shared {
    stream: StreamKind,
    capacity: usize,
    state: StdMutex<QueueState>,
    senders: AtomicUsize,
    readable: Notify,
    writable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_push(&self, chunk: Chunk) -> Result<(), SendError> {
        let mut state = self.lock();
        if state.close_reason.is_some() {
            return Err(SendError::Closed(chunk));
        }
        if state.chunks.len() >= self.capacity {
            return Err(SendError::Full(chunk));
        }
        state.chunks.push_back(chunk);
        drop(state);
        self.readable.notify_waiters();
        Ok(())
    }

    fn push_evicting(&self, chunk: Chunk) -> Result<Option<Chunk>, SendError> {
        let mut state = self.lock();
        if state.close_reason.is_some() {
            return Err(SendError::Closed(chunk));
        }
        let evicted = if state.chunks.len() >= self.capacity {
            state.dropped = state.dropped.saturating_add(1);
            state.chunks.pop_front()
        } else {
            None
        };
        state.chunks.push_back(chunk);
        drop(state);
        self.readable.notify_waiters();
        Ok(evicted)
    }

    fn try_pop(&self) -> Result<Chunk, TryRecvError> {
        let mut state = self.lock();
        match state.chunks.pop_front() {
            Some(chunk) => {
                drop(state);
                self.writable.notify_waiters();
                Ok(chunk)
            }
            None if state.close_reason.is_some() => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Records the first close reason; later calls are ignored.
    fn close(&self, reason: CloseReason) -> bool {
        let mut state = self.lock();
        if state.close_reason.is_some() {
            return false;
        }
        state.close_reason = Some(reason);
        drop(state);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        true
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.lock().close_reason.clone()
    }

    fn is_closed(&self) -> bool {
        self.lock().close_reason.is_some()
    }

    fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

/// Create a bounded queue for `stream` holding at most `capacity` chunks.
///
/// # Panics
///
/// Panics if `capacity` is zero. Launchers reject such a configuration through
/// [`crate::BridgeConfig::validate`] before any queue is built.
pub fn message_queue(stream: StreamKind, capacity: usize) -> (QueueSender, QueueReceiver) {
    assert!(capacity > 0, "message queue capacity must be at least 1");
    let shared = Arc::new(Shared {
        stream,
        capacity,
        state: StdMutex::new(QueueState::default()),
        senders: AtomicUsize::new(1),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        QueueSender {
            shared: Arc::clone(&shared),
        },
        QueueReceiver { shared },
    )
}

/// Producer half of a queue. Cloneable; the queue closes once the last clone is
/// dropped.
pub struct QueueSender {
    shared: Arc<Shared>,
}

/// The caller's end of the input queue.
pub type InputQueue = QueueSender;

impl QueueSender {
    /// Enqueue `chunk`, suspending while the queue is full.
    pub async fn send(&self, chunk: Chunk) -> Result<(), SendError> {
        let mut chunk = chunk;
        loop {
            let writable = self.shared.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();
            match self.shared.try_push(chunk) {
                Ok(()) => return Ok(()),
                Err(SendError::Full(returned)) => chunk = returned,
                Err(err) => return Err(err),
            }
            writable.await;
        }
    }

    /// Like [`QueueSender::send`], but gives the chunk back once `timeout`
    /// passes without room becoming available.
    pub async fn send_timeout(&self, chunk: Chunk, timeout: Duration) -> Result<(), SendError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = chunk;
        loop {
            let writable = self.shared.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();
            match self.shared.try_push(chunk) {
                Ok(()) => return Ok(()),
                Err(SendError::Full(returned)) => chunk = returned,
                Err(err) => return Err(err),
            }
            if tokio::time::timeout_at(deadline, writable).await.is_err() {
                return match self.shared.try_push(chunk) {
                    Err(SendError::Full(returned)) => Err(SendError::Timeout(returned)),
                    other => other,
                };
            }
        }
    }

    pub fn try_send(&self, chunk: Chunk) -> Result<(), SendError> {
        self.shared.try_push(chunk)
    }

    /// Enqueue without blocking, evicting the oldest buffered chunk when the
    /// queue is full. Returns the evicted chunk, if any.
    pub fn send_drop_oldest(&self, chunk: Chunk) -> Result<Option<Chunk>, SendError> {
        self.shared.push_evicting(chunk)
    }

    /// Signal "no more data". Chunks already buffered stay available to the
    /// consumer.
    pub fn close(&self) {
        self.shared.close(CloseReason::ClosedByCaller);
    }

    pub(crate) fn close_with(&self, reason: CloseReason) -> bool {
        self.shared.close(reason)
    }

    /// Resolves once the queue has been closed from either side.
    pub async fn closed(&self) {
        loop {
            let writable = self.shared.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();
            if self.shared.is_closed() {
                return;
            }
            writable.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// The failure that closed this queue, if it did not close cleanly.
    pub fn last_error(&self) -> Option<StreamError> {
        self.shared.close_reason().and_then(|reason| reason.error().cloned())
    }

    pub fn stream(&self) -> StreamKind {
        self.shared.stream
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub(crate) fn closer(&self) -> QueueCloser {
        QueueCloser {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Clone for QueueSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for QueueSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.close(CloseReason::SenderDropped);
        }
    }
}

impl fmt::Debug for QueueSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSender")
            .field("stream", &self.shared.stream)
            .field("len", &self.shared.len())
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

/// Consumer half of a queue.
pub struct QueueReceiver {
    shared: Arc<Shared>,
}

/// The caller's end of an output or error queue.
pub type OutputQueue = QueueReceiver;

impl QueueReceiver {
    /// Wait for the next chunk. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Chunk> {
        loop {
            let readable = self.shared.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();
            match self.shared.try_pop() {
                Ok(chunk) => return Some(chunk),
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Empty) => {}
            }
            readable.await;
        }
    }

    pub fn try_recv(&mut self) -> Result<Chunk, TryRecvError> {
        self.shared.try_pop()
    }

    /// Stop admitting new chunks. Buffered chunks can still be received.
    pub fn close(&self) {
        self.shared.close(CloseReason::ClosedByCaller);
    }

    pub(crate) fn close_with(&self, reason: CloseReason) -> bool {
        self.shared.close(reason)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// True once the queue is closed and nothing is left to receive.
    pub fn is_finished(&self) -> bool {
        let state = self.shared.lock();
        state.close_reason.is_some() && state.chunks.is_empty()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// The failure that closed this queue, if it did not close cleanly.
    pub fn last_error(&self) -> Option<StreamError> {
        self.shared.close_reason().and_then(|reason| reason.error().cloned())
    }

    /// Chunks evicted under the drop-oldest overflow policy.
    pub fn dropped_chunks(&self) -> u64 {
        self.shared.dropped()
    }

    pub fn stream(&self) -> StreamKind {
        self.shared.stream
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub(crate) fn closer(&self) -> QueueCloser {
        QueueCloser {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for QueueReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.chunks.clear();
        drop(state);
        self.shared.close(CloseReason::ReceiverDropped);
        // Wake a producer parked on a full queue even if it was already closed.
        self.shared.writable.notify_waiters();
    }
}

impl fmt::Debug for QueueReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueReceiver")
            .field("stream", &self.shared.stream)
            .field("len", &self.shared.len())
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

/// Closes a queue without holding either half. Held by the process handle so
/// shutdown can close queues whose pumps it is about to abort.
#[derive(Clone)]
pub(crate) struct QueueCloser {
    shared: Arc<Shared>,
}

impl QueueCloser {
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        self.shared.close(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    #[should_panic(expected = "capacity must be at least 1")]
    fn zero_capacity_is_rejected() {
        let _ = message_queue(StreamKind::Stdout, 0);
    }

    #[test]
    fn preserves_fifo_order_and_rejects_beyond_capacity() {
        let (tx, mut rx) = message_queue(StreamKind::Stdout, 2);

        assert_eq!(tx.try_send(b"a".to_vec()), Ok(()));
        assert_eq!(tx.try_send(b"b".to_vec()), Ok(()));
        assert_eq!(tx.try_send(b"c".to_vec()), Err(SendError::Full(b"c".to_vec())));
        assert_eq!(rx.len(), 2);

        assert_eq!(rx.try_recv(), Ok(b"a".to_vec()));
        assert_eq!(rx.try_recv(), Ok(b"b".to_vec()));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn closed_queue_drains_before_reporting_closed() {
        let (tx, mut rx) = message_queue(StreamKind::Stderr, 4);
        assert_eq!(tx.try_send(b"tail".to_vec()), Ok(()));
        assert!(tx.close_with(CloseReason::EndOfStream));
        assert!(!tx.close_with(CloseReason::Shutdown));

        assert_eq!(
            tx.try_send(b"late".to_vec()),
            Err(SendError::Closed(b"late".to_vec()))
        );
        assert!(!rx.is_finished());
        assert_eq!(rx.try_recv(), Ok(b"tail".to_vec()));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
        assert!(rx.is_finished());
        assert_eq!(rx.close_reason(), Some(CloseReason::EndOfStream));
        assert_eq!(rx.last_error(), None);
    }

    #[test]
    fn failed_close_exposes_last_error() {
        let (tx, rx) = message_queue(StreamKind::Stdout, 1);
        let err = StreamError::EnqueueTimeout {
            stream: StreamKind::Stdout,
            timeout: Duration::from_millis(5),
        };
        tx.close_with(CloseReason::Failed(err.clone()));

        assert_eq!(rx.last_error(), Some(err.clone()));
        assert_eq!(tx.last_error(), Some(err));
        assert!(!rx.close_reason().is_some_and(|reason| reason.is_clean()));
    }

    #[test]
    fn drop_oldest_evicts_and_counts() {
        let (tx, mut rx) = message_queue(StreamKind::Stdout, 2);
        for chunk in [b"1", b"2", b"3", b"4"] {
            let _ = tx.send_drop_oldest(chunk.to_vec());
        }

        assert_eq!(rx.dropped_chunks(), 2);
        assert_eq!(rx.try_recv(), Ok(b"3".to_vec()));
        assert_eq!(rx.try_recv(), Ok(b"4".to_vec()));
    }

    #[test]
    fn dropping_last_sender_closes_queue() {
        let (tx, mut rx) = message_queue(StreamKind::Stdin, 2);
        let second = tx.clone();
        assert_eq!(tx.try_send(b"x".to_vec()), Ok(()));
        drop(tx);
        assert!(!rx.is_closed());
        drop(second);

        assert_eq!(rx.close_reason(), Some(CloseReason::SenderDropped));
        assert_eq!(rx.try_recv(), Ok(b"x".to_vec()));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[tokio::test]
    async fn full_queue_suspends_sender_until_consumer_removes_entry() -> anyhow::Result<()> {
        let (tx, mut rx) = message_queue(StreamKind::Stdout, 1);
        tx.send(b"first".to_vec()).await?;

        let producer = tokio::spawn(async move {
            tx.send(b"second".to_vec()).await?;
            Ok::<_, SendError>(tx)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished(), "send should block on a full queue");
        assert_eq!(rx.len(), 1);

        assert_eq!(rx.recv().await, Some(b"first".to_vec()));
        let tx = producer.await??;
        assert_eq!(rx.recv().await, Some(b"second".to_vec()));

        tx.close();
        assert_eq!(rx.recv().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn send_timeout_hands_chunk_back() {
        let (tx, _rx) = message_queue(StreamKind::Stdout, 1);
        assert_eq!(tx.try_send(b"a".to_vec()), Ok(()));

        let result = tx
            .send_timeout(b"b".to_vec(), Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(SendError::Timeout(b"b".to_vec())));
    }

    #[tokio::test]
    async fn dropping_receiver_releases_blocked_sender() -> anyhow::Result<()> {
        let (tx, rx) = message_queue(StreamKind::Stdout, 1);
        tx.send(b"a".to_vec()).await?;

        let producer = tokio::spawn(async move { tx.send(b"b".to_vec()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);

        let result = tokio::time::timeout(Duration::from_secs(2), producer).await??;
        assert_eq!(result, Err(SendError::Closed(b"b".to_vec())));
        Ok(())
    }

    #[tokio::test]
    async fn recv_wakes_on_close() -> anyhow::Result<()> {
        let (tx, mut rx) = message_queue(StreamKind::Stdout, 1);
        let consumer = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.close();

        let received = tokio::time::timeout(Duration::from_secs(2), consumer).await??;
        assert_eq!(received, None);
        Ok(())
    }
}
