//! Serialization Queue
//!
//! One FIFO lane per resource key. Within a lane at most one ticket holds
//! the lane at any instant; unrelated lanes never wait on each other.
//!
//! # Ticket lifecycle
//!
//! ```text
//!   enqueue ──► Waiting ──grant──► Holding ──release/drop──► Released
//!                  │                                            ▲
//!                  └──────────────── drop (withdraw) ───────────┘
//! ```
//!
//! `enqueue` is synchronous: it registers the ticket under the lane lock and
//! returns. If the lane was idle the ticket is granted on the spot,
//! otherwise the caller awaits `Ticket::granted()`.
//!
//! Granting happens inside `release` of the previous holder, under the same
//! lock that `enqueue` takes, so a grant can never slip between "check lane
//! is busy" and "register as waiter".
//!
//! Release is tied to `Drop`. A ticket that is dropped while waiting (its
//! caller timed out or was cancelled) withdraws itself; a ticket dropped
//! while holding hands the lane to the next waiter. Both decisions are made
//! under the lane lock, so a grant racing with a timeout is resolved one way
//! or the other and the lane is never left held by nobody.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::config::QueueConfig;
use crate::idgen::{IdGen, TicketId};
use crate::key::ResourceKey;

// ============================================================================
// Errors
// ============================================================================

/// Concurrency-layer failures of a single-lane operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The lane already has `limit` tickets queued
    LaneFull { key: ResourceKey, limit: usize },
    /// The ticket was not granted before the lane timeout
    LaneTimeout { key: ResourceKey },
    /// The work exceeded its budget while holding the lane
    OperationTimeout { key: ResourceKey },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaneFull { key, limit } => {
                write!(f, "Lane '{key}' is full ({limit} pending tickets)")
            }
            Self::LaneTimeout { key } => write!(f, "Timed out waiting for lane '{key}'"),
            Self::OperationTimeout { key } => {
                write!(f, "Operation on lane '{key}' exceeded its time budget")
            }
        }
    }
}

impl std::error::Error for QueueError {}

// ============================================================================
// Lane
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Waiting,
    Holding,
    Released,
}

/// A ticket waiting for its turn on a lane
struct Waiter {
    ticket: TicketId,
    /// Fired exactly once, after `holder` has been set to `ticket`
    sender: tokio::sync::oneshot::Sender<()>,
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

/// Invariant: `holder.is_none()` implies `waiting.is_empty()`
#[derive(Debug, Default)]
struct LaneState {
    holder: Option<TicketId>,
    waiting: VecDeque<Waiter>,
}

impl LaneState {
    fn pending(&self) -> usize {
        usize::from(self.holder.is_some()) + self.waiting.len()
    }
}

/// Per-key FIFO execution channel
pub struct Lane {
    key: ResourceKey,
    state: Mutex<LaneState>,
}

impl fmt::Debug for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Lane")
            .field("key", &self.key)
            .field("holder", &state.holder)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

impl Lane {
    fn new(key: ResourceKey) -> Self {
        Self {
            key,
            state: Mutex::new(LaneState::default()),
        }
    }

    #[must_use]
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Holder plus waiters
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending()
    }

    /// Hand the lane to the first waiter still listening.
    ///
    /// Precondition: caller holds the lane lock and the lane has no holder.
    fn grant_next(&self, state: &mut LaneState) {
        while let Some(waiter) = state.waiting.pop_front() {
            state.holder = Some(waiter.ticket);
            if waiter.sender.send(()).is_ok() {
                log::trace!("lane '{}': granted {}", self.key, waiter.ticket);
                return;
            }
            // The receiver lives in the Ticket, and a dropped Ticket removes
            // its waiter under this lock first, so this is not expected.
            log::debug!(
                "lane '{}': grant receiver for {} is gone, skipping",
                self.key,
                waiter.ticket
            );
            state.holder = None;
        }
    }
}

// ============================================================================
// Ticket
// ============================================================================

/// One operation's claim on one lane
///
/// Owned by exactly one invocation. Released explicitly with
/// [`Ticket::release`] or implicitly on drop.
pub struct Ticket {
    id: TicketId,
    lane: Arc<Lane>,
    /// `None` once the grant has been observed (or was immediate)
    grant: Option<tokio::sync::oneshot::Receiver<()>>,
    released: bool,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("key", &self.lane.key)
            .field("state", &self.state())
            .finish()
    }
}

impl Ticket {
    #[must_use]
    pub fn id(&self) -> TicketId {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> &ResourceKey {
        &self.lane.key
    }

    #[must_use]
    pub fn state(&self) -> TicketState {
        if self.released {
            return TicketState::Released;
        }
        if self.lane.state.lock().holder == Some(self.id) {
            TicketState::Holding
        } else {
            TicketState::Waiting
        }
    }

    /// Wait until this ticket holds its lane.
    ///
    /// Cancel-safe: dropping the future leaves the ticket queued, and
    /// dropping the ticket withdraws it.
    pub async fn granted(&mut self) {
        if let Some(rx) = self.grant.as_mut() {
            // The sender is only consumed by `grant_next`, which sets the
            // holder before sending. It is dropped without sending only if
            // this ticket already withdrew, which cannot happen while we
            // are awaiting it, so the error case is ignored.
            let _ = rx.await;
            self.grant = None;
        }
    }

    /// Release the lane (or withdraw from it if not yet granted)
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.lane.state.lock();
        if state.holder == Some(self.id) {
            state.holder = None;
            log::trace!("lane '{}': released {}", self.lane.key, self.id);
            self.lane.grant_next(&mut state);
        } else {
            state.waiting.retain(|w| w.ticket != self.id);
            log::trace!("lane '{}': withdrew {}", self.lane.key, self.id);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Process-wide map of lanes
///
/// Lanes are created lazily on first use and live as long as the queue.
pub struct SerialQueue {
    lanes: Mutex<HashMap<ResourceKey, Arc<Lane>>>,
    ids: IdGen,
    config: QueueConfig,
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl SerialQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            ids: IdGen::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Get the lane for `key`, creating it if absent.
    ///
    /// The map lock makes "create if absent" atomic; everything after this
    /// works on the returned lane only.
    fn lane(&self, key: &ResourceKey) -> Arc<Lane> {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get(key) {
            return Arc::clone(lane);
        }
        log::debug!("queue: creating lane '{key}'");
        let lane = Arc::new(Lane::new(key.clone()));
        lanes.insert(key.clone(), Arc::clone(&lane));
        lane
    }

    /// Append a ticket for `key`.
    ///
    /// The ticket is `Holding` on return if the lane was idle, otherwise
    /// `Waiting` behind every earlier ticket for the same key.
    ///
    /// # Errors
    /// Returns `QueueError::LaneFull` if the lane has reached
    /// `max_pending_per_lane`.
    pub fn enqueue(&self, key: &ResourceKey) -> Result<Ticket, QueueError> {
        let lane = self.lane(key);
        let id = self.ids.get_next();
        let limit = self.config.max_pending_per_lane;

        let mut state = lane.state.lock();
        if state.pending() >= limit {
            log::warn!("queue.enqueue: lane '{key}' full ({limit} pending), rejecting {id}");
            return Err(QueueError::LaneFull {
                key: key.clone(),
                limit,
            });
        }

        let grant = if state.holder.is_none() {
            state.holder = Some(id);
            log::trace!("lane '{key}': granted {id} immediately");
            None
        } else {
            let (tx, rx) = tokio::sync::oneshot::channel();
            state.waiting.push_back(Waiter {
                ticket: id,
                sender: tx,
            });
            log::trace!(
                "lane '{key}': {id} waiting behind {} ticket(s)",
                state.pending() - 1
            );
            Some(rx)
        };
        drop(state);

        Ok(Ticket {
            id,
            lane,
            grant,
            released: false,
        })
    }

    /// Explicit form of `ticket.release()`
    pub fn release(&self, ticket: Ticket) {
        ticket.release();
    }

    /// Run `work` with exclusive access to `key`.
    ///
    /// Waits at most `lane_timeout` for the grant and gives `work` at most
    /// `operation_timeout`. The ticket is released on every exit path.
    ///
    /// # Errors
    /// `LaneFull`, `LaneTimeout` or `OperationTimeout`. Errors produced by
    /// `work` itself are part of `T` and are passed through untouched.
    pub async fn run<F, Fut, T>(&self, key: &ResourceKey, work: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut ticket = self.enqueue(key)?;

        if tokio::time::timeout(self.config.lane_timeout, ticket.granted())
            .await
            .is_err()
        {
            log::warn!("queue.run: {} timed out waiting for lane '{key}'", ticket.id());
            return Err(QueueError::LaneTimeout { key: key.clone() });
        }

        let result = tokio::time::timeout(self.config.operation_timeout, work()).await;
        ticket.release();

        result.map_err(|_| {
            log::warn!("queue.run: operation on lane '{key}' exceeded its budget");
            QueueError::OperationTimeout { key: key.clone() }
        })
    }

    /// Number of lanes created so far
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Holder plus waiters for `key`; zero for a lane never used
    #[must_use]
    pub fn pending(&self, key: &ResourceKey) -> usize {
        let lane = self.lanes.lock().get(key).cloned();
        lane.map_or(0, |lane| lane.pending())
    }
}
