//! Queue facade over the external broker.
//!
//! Three queues drive the job lifecycle: `incoming` (FIFO work), the
//! delayed-retry queue (ordered by due time), and `dead_letter`
//! (inspection holding pen). Delivery is at-least-once: a reservation
//! that is never acked becomes visible again after its visibility
//! timeout, so consumers must re-read job state before acting.
//!
//! [`MemoryBroker`] is the process-local implementation; a Redis-backed
//! implementation of [`Broker`] lives with the deployment, not here.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::QueueError;

/// Queue names used by the dispatcher.
pub const INCOMING: &str = "incoming_jobs";
pub const RETRY_SCHEDULE: &str = "retry_schedule";
pub const DEAD_LETTER: &str = "dead_letter";

/// Handle for acking a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub id: Uuid,
    pub queue: String,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a payload to the back of a queue.
    async fn publish(&self, queue: &str, payload: Value) -> Result<(), QueueError>;

    /// Pop the next payload, leasing it for `visibility`. The payload is
    /// re-delivered if not acked before the lease expires.
    async fn reserve(
        &self,
        queue: &str,
        visibility: Duration,
    ) -> Result<Option<(Receipt, Value)>, QueueError>;

    /// Settle a reservation, removing the payload permanently.
    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError>;

    /// Park a payload until `due_at` (delayed-retry scheduling).
    async fn schedule(
        &self,
        queue: &str,
        payload: Value,
        due_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Remove and return every scheduled payload with `due_at <= now`,
    /// in due-time order.
    async fn due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Value>, QueueError>;
}

#[derive(Debug)]
struct InFlight {
    payload: Value,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Value>,
    in_flight: HashMap<Uuid, InFlight>,
    /// Keyed by (due_at epoch seconds, insertion seq) so same-second
    /// entries keep insertion order.
    delayed: BTreeMap<(i64, u64), Value>,
}

impl QueueState {
    /// Return expired leases to the front of the ready queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                self.ready.push_front(flight.payload);
            }
        }
    }
}

/// In-memory broker.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    seq: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of immediately-deliverable payloads (test/diagnostic aid).
    pub async fn ready_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, payload: Value) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().ready.push_back(payload);
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        visibility: Duration,
    ) -> Result<Option<(Receipt, Value)>, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.reclaim_expired(Instant::now());

        let Some(payload) = state.ready.pop_front() else {
            return Ok(None);
        };

        let receipt = Receipt {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
        };
        state.in_flight.insert(
            receipt.id,
            InFlight {
                payload: payload.clone(),
                deadline: Instant::now() + visibility,
            },
        );
        Ok(Some((receipt, payload)))
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&receipt.queue)
            .ok_or(QueueError::UnknownReceipt { receipt: receipt.id })?;
        state
            .in_flight
            .remove(&receipt.id)
            .map(|_| ())
            .ok_or(QueueError::UnknownReceipt { receipt: receipt.id })
    }

    async fn schedule(
        &self,
        queue: &str,
        payload: Value,
        due_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .delayed
            .insert((due_at.timestamp(), seq), payload);
        Ok(())
    }

    async fn due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Value>, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        // split_off keeps entries strictly after the cutoff key.
        let still_parked = state.delayed.split_off(&(now.timestamp() + 1, 0));
        let due = std::mem::replace(&mut state.delayed, still_parked);
        Ok(due.into_values().collect())
    }
}
