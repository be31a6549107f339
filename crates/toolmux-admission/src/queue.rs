use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use toolmux_core::OrchestratorError;

/// Outcome delivered to a queued waiter. `Admitted` carries whatever grant
/// the admitting side reserved for it (e.g. a `ConcurrencyGuard`) so the
/// waiter never has to re-compete for the slot that was just handed to it.
#[derive(Debug)]
pub enum QueueOutcome<G> {
    Admitted(G),
    TimedOut,
    ShuttingDown,
}

struct Entry<G> {
    request_id: String,
    client_id: String,
    tool_name: String,
    enqueued_at: Instant,
    deadline: Instant,
    waker: oneshot::Sender<QueueOutcome<G>>,
}

/// Bounded FIFO admission queue. A single internal mutex guards the buffer
/// (the `queue-write` named mutex made explicit); all mutation — enqueue,
/// dequeue, cleanup — runs under it. Generic over the grant type `G` handed
/// to an admitted waiter, so this crate never needs to know about the
/// downstream pool's concurrency guard.
pub struct ConnectionQueue<G> {
    max_size: usize,
    buffer: Mutex<VecDeque<Entry<G>>>,
}

pub struct QueueTicket<G> {
    pub request_id: String,
    receiver: oneshot::Receiver<QueueOutcome<G>>,
}

impl<G> QueueTicket<G> {
    pub async fn wait(self) -> QueueOutcome<G> {
        self.receiver.await.unwrap_or(QueueOutcome::ShuttingDown)
    }
}

impl<G> ConnectionQueue<G> {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends an entry if the queue has room; otherwise fails with
    /// `queue-full`. Returns a ticket the caller awaits for admission,
    /// timeout, or shutdown.
    pub async fn enqueue(
        &self,
        request_id: impl Into<String>,
        client_id: impl Into<String>,
        tool_name: impl Into<String>,
        deadline: Instant,
    ) -> Result<QueueTicket<G>, OrchestratorError> {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() >= self.max_size {
            return Err(OrchestratorError::QueueFull);
        }
        let request_id = request_id.into();
        let (tx, rx) = oneshot::channel();
        buffer.push_back(Entry {
            request_id: request_id.clone(),
            client_id: client_id.into(),
            tool_name: tool_name.into(),
            enqueued_at: Instant::now(),
            deadline,
            waker: tx,
        });
        Ok(QueueTicket {
            request_id,
            receiver: rx,
        })
    }

    /// Hands `grant` to the oldest non-expired waiter, if any. Expired
    /// entries encountered along the way are dropped and their waiters
    /// woken with `TimedOut`, matching `cleanup_expired`'s effect without a
    /// separate pass. If the queue has no one waiting, `grant` is handed
    /// straight back so the caller can release whatever it reserved rather
    /// than leak it.
    pub async fn dequeue(&self, grant: G) -> Result<(), G> {
        let mut buffer = self.buffer.lock().await;
        let now = Instant::now();
        while let Some(front) = buffer.pop_front() {
            if front.deadline <= now {
                let _ = front.waker.send(QueueOutcome::TimedOut);
                continue;
            }
            match front.waker.send(QueueOutcome::Admitted(grant)) {
                Ok(()) => return Ok(()),
                Err(QueueOutcome::Admitted(grant)) => return Err(grant),
                Err(_) => unreachable!("send() only returns back what it was given"),
            }
        }
        Err(grant)
    }

    /// Removes all entries past their deadline and wakes their waiters with
    /// `queue-timeout`. Intended to run from a periodic timer in addition
    /// to the handoff inside `dequeue`.
    pub async fn cleanup_expired(&self) -> usize {
        let mut buffer = self.buffer.lock().await;
        let now = Instant::now();
        let before = buffer.len();
        let mut kept = VecDeque::with_capacity(buffer.len());
        while let Some(entry) = buffer.pop_front() {
            if entry.deadline <= now {
                let _ = entry.waker.send(QueueOutcome::TimedOut);
            } else {
                kept.push_back(entry);
            }
        }
        *buffer = kept;
        before - buffer.len()
    }

    /// Cancels every waiting entry with `shutting-down`, used during
    /// graceful shutdown's drain step.
    pub async fn cancel_all(&self) {
        let mut buffer = self.buffer.lock().await;
        while let Some(entry) = buffer.pop_front() {
            let _ = entry.waker.send(QueueOutcome::ShuttingDown);
        }
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_admitted<G: std::fmt::Debug>(outcome: QueueOutcome<G>) -> G {
        match outcome {
            QueueOutcome::Admitted(grant) => grant,
            other => panic!("expected Admitted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_returns_fifo_order() {
        let queue: ConnectionQueue<u32> = ConnectionQueue::new(10);
        let deadline = Instant::now() + Duration::from_secs(5);
        let ticket_a = queue
            .enqueue("req-a", "client-1", "tool-a", deadline)
            .await
            .unwrap();
        let ticket_b = queue
            .enqueue("req-b", "client-1", "tool-a", deadline)
            .await
            .unwrap();

        queue.dequeue(1).await.unwrap();
        assert_eq!(assert_admitted(ticket_a.wait().await), 1);

        queue.dequeue(2).await.unwrap();
        assert_eq!(assert_admitted(ticket_b.wait().await), 2);
    }

    #[tokio::test]
    async fn dequeue_with_nobody_waiting_returns_grant() {
        let queue: ConnectionQueue<u32> = ConnectionQueue::new(10);
        let result = queue.dequeue(7).await;
        assert!(matches!(result, Err(7)));
    }

    #[tokio::test]
    async fn queue_full_rejects_admission() {
        let queue: ConnectionQueue<()> = ConnectionQueue::new(1);
        let deadline = Instant::now() + Duration::from_secs(5);
        let _ticket = queue
            .enqueue("req-a", "client-1", "tool-a", deadline)
            .await
            .unwrap();
        let result = queue.enqueue("req-b", "client-1", "tool-a", deadline).await;
        assert!(matches!(result, Err(OrchestratorError::QueueFull)));
    }

    #[tokio::test]
    async fn expired_entry_is_woken_with_timed_out() {
        let queue: ConnectionQueue<()> = ConnectionQueue::new(10);
        let deadline = Instant::now() + Duration::from_millis(5);
        let ticket = queue
            .enqueue("req-a", "client-1", "tool-a", deadline)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = queue.cleanup_expired().await;
        assert_eq!(removed, 1);
        assert!(matches!(ticket.wait().await, QueueOutcome::TimedOut));
    }

    #[tokio::test]
    async fn dequeue_skips_expired_entries_before_admitting() {
        let queue: ConnectionQueue<u32> = ConnectionQueue::new(10);
        let expired_deadline = Instant::now() + Duration::from_millis(5);
        let live_deadline = Instant::now() + Duration::from_secs(5);
        let expired_ticket = queue
            .enqueue("req-a", "client-1", "tool-a", expired_deadline)
            .await
            .unwrap();
        let live_ticket = queue
            .enqueue("req-b", "client-1", "tool-a", live_deadline)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.dequeue(9).await.unwrap();
        assert!(matches!(expired_ticket.wait().await, QueueOutcome::TimedOut));
        assert_eq!(assert_admitted(live_ticket.wait().await), 9);
    }

    #[tokio::test]
    async fn cancel_all_wakes_with_shutting_down() {
        let queue: ConnectionQueue<()> = ConnectionQueue::new(10);
        let deadline = Instant::now() + Duration::from_secs(5);
        let ticket = queue
            .enqueue("req-a", "client-1", "tool-a", deadline)
            .await
            .unwrap();
        queue.cancel_all().await;
        assert!(matches!(ticket.wait().await, QueueOutcome::ShuttingDown));
    }
}
