//! Transaction Coordinator
//!
//! Runs an operation body that needs several resource keys at once.
//!
//! 1. Deduplicate and sort the declared keys.
//! 2. Acquire one ticket per key in ascending order, each grant awaited
//!    before the next request, all under one lane deadline.
//! 3. Run the body with a `Txn` handle, under the operation budget.
//! 4. If the body returned `Ok`, write every staged document.
//! 5. Release every ticket, whatever happened.
//!
//! Because every invocation requests keys in the same global order, no
//! cycle of invocations waiting on each other can form.
//!
//! Writes are staged in the `Txn` and only reach the store in step 4, so a
//! body that fails, panics or times out leaves every document untouched.
//! Step 4 runs on its own task, holding the tickets, so neither the budget
//! nor a caller dropping the future can cut it short. If one save fails, the
//! documents already written in that commit are put back.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::config::QueueConfig;
use crate::error::{Error, TxnError};
use crate::key::ResourceKey;
use crate::queue::{QueueError, SerialQueue, Ticket};
use crate::store::{Document, Store, StoreError};

// ============================================================================
// Txn
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Staged {
    Put(Document),
    Delete,
}

struct TxnState {
    declared: BTreeSet<ResourceKey>,
    /// What the store held for a key when this transaction first read it
    snapshots: Mutex<HashMap<ResourceKey, Option<Document>>>,
    staged: Mutex<BTreeMap<ResourceKey, Staged>>,
    closed: AtomicBool,
}

/// The operation body's view of its declared documents
///
/// Reads see the transaction's own staged writes. Nothing is written to the
/// store until the body has returned `Ok`.
pub struct Txn<S: Store> {
    store: Arc<S>,
    state: Arc<TxnState>,
}

impl<S: Store> Clone for Txn<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: Store> Txn<S> {
    fn new(store: Arc<S>, declared: BTreeSet<ResourceKey>) -> Self {
        Self {
            store,
            state: Arc::new(TxnState {
                declared,
                snapshots: Mutex::new(HashMap::new()),
                staged: Mutex::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The keys this operation holds, ascending
    pub fn declared(&self) -> impl Iterator<Item = &ResourceKey> {
        self.state.declared.iter()
    }

    fn check(&self, key: &ResourceKey) -> Result<(), TxnError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(TxnError::Closed);
        }
        if !self.state.declared.contains(key) {
            return Err(TxnError::Undeclared(key.clone()));
        }
        Ok(())
    }

    /// Current document for `key`, `None` if it does not exist
    ///
    /// # Errors
    /// `Undeclared`, `Closed`, or `Read` if the store fails.
    pub async fn fetch(&self, key: &ResourceKey) -> Result<Option<Document>, TxnError> {
        self.check(key)?;
        let staged = self.state.staged.lock().get(key).cloned();
        if let Some(staged) = staged {
            return Ok(match staged {
                Staged::Put(doc) => Some(doc),
                Staged::Delete => None,
            });
        }
        let snapshot = self.state.snapshots.lock().get(key).cloned();
        if let Some(snapshot) = snapshot {
            return Ok(snapshot);
        }

        let current = self.store.fetch(key).await.map_err(TxnError::Read)?;
        self.state
            .snapshots
            .lock()
            .entry(key.clone())
            .or_insert_with(|| current.clone());
        Ok(current)
    }

    /// Current document for `key`, or the empty document on first use
    ///
    /// # Errors
    /// Same as [`Txn::fetch`].
    pub async fn load(&self, key: &ResourceKey) -> Result<Document, TxnError> {
        Ok(self.fetch(key).await?.unwrap_or_default())
    }

    /// Typed load; a missing document yields `T::default()`
    ///
    /// # Errors
    /// Same as [`Txn::fetch`], plus `Codec` if the document does not match `T`.
    pub async fn load_as<T>(&self, key: &ResourceKey) -> Result<T, TxnError>
    where
        T: DeserializeOwned + Default,
    {
        match self.fetch(key).await? {
            Some(doc) => doc.to_typed().map_err(TxnError::Codec),
            None => Ok(T::default()),
        }
    }

    /// Stage `doc` as the new document for `key`
    ///
    /// # Errors
    /// `Undeclared` or `Closed`.
    pub fn stage(&self, key: &ResourceKey, doc: Document) -> Result<(), TxnError> {
        self.check(key)?;
        trace!("txn: staged put '{key}'");
        self.state
            .staged
            .lock()
            .insert(key.clone(), Staged::Put(doc));
        Ok(())
    }

    /// Typed [`Txn::stage`]
    ///
    /// # Errors
    /// `Undeclared`, `Closed`, or `Encode` if `value` cannot be encoded.
    pub fn stage_as<T: Serialize>(&self, key: &ResourceKey, value: &T) -> Result<(), TxnError> {
        self.check(key)?;
        let doc = Document::from_typed(value).map_err(TxnError::Encode)?;
        self.stage(key, doc)
    }

    /// Stage removal of the document for `key`
    ///
    /// # Errors
    /// `Undeclared` or `Closed`.
    pub fn delete(&self, key: &ResourceKey) -> Result<(), TxnError> {
        self.check(key)?;
        trace!("txn: staged delete '{key}'");
        self.state.staged.lock().insert(key.clone(), Staged::Delete);
        Ok(())
    }

    /// Close the handle and hand over what was staged
    fn close(&self) -> BTreeMap<ResourceKey, Staged> {
        self.state.closed.store(true, Ordering::Release);
        std::mem::take(&mut *self.state.staged.lock())
    }

    fn snapshot(&self, key: &ResourceKey) -> Option<Option<Document>> {
        self.state.snapshots.lock().get(key).cloned()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Entry point for every mutation of coordinated documents
pub struct Coordinator<S: Store> {
    queue: Arc<SerialQueue>,
    store: Arc<S>,
}

impl<S: Store> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> Coordinator<S> {
    #[must_use]
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self::with_queue(Arc::new(store), Arc::new(SerialQueue::new(config)))
    }

    /// Share an existing queue, e.g. with single-key users of `SerialQueue::run`
    #[must_use]
    pub fn with_queue(store: Arc<S>, queue: Arc<SerialQueue>) -> Self {
        Self { queue, store }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<SerialQueue> {
        &self.queue
    }

    /// The backing store. Reading is fine; writing through it bypasses the
    /// lanes and breaks mutual exclusion.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `body` holding every key in `keys`.
    ///
    /// The body must declare its full key set up front; touching any other
    /// key fails with `Error::UndeclaredKey`.
    ///
    /// # Errors
    /// Any `Error` variant; see its documentation. On every error path all
    /// held lanes are released and no document is left partially written.
    pub async fn run<I, F, Fut, T, E>(&self, keys: I, body: F) -> Result<T, Error<E>>
    where
        I: IntoIterator<Item = ResourceKey>,
        S: 'static,
        F: FnOnce(Txn<S>) -> Fut,
        Fut: Future<Output = Result<T, Error<E>>>,
    {
        let declared: BTreeSet<ResourceKey> = keys.into_iter().collect();
        let tickets = self.acquire(&declared).await?;
        debug!("coordinator: holding {} lane(s)", tickets.len());

        let txn = Txn::new(Arc::clone(&self.store), declared);
        let body_txn = txn.clone();
        let guarded = AssertUnwindSafe(async move { body(body_txn).await }).catch_unwind();
        let outcome = tokio::time::timeout(self.queue.config().operation_timeout, guarded).await;

        let value = match outcome {
            Err(_) => {
                warn!("coordinator: operation exceeded its budget, nothing written");
                txn.close();
                return Err(Error::OperationTimeout);
            }
            Ok(Err(panic)) => {
                let msg = panic_message(panic.as_ref());
                warn!("coordinator: operation panicked ({msg}), nothing written");
                txn.close();
                return Err(Error::Panicked(msg));
            }
            Ok(Ok(Err(e))) => {
                txn.close();
                return Err(e);
            }
            Ok(Ok(Ok(value))) => value,
        };

        // The commit task owns the tickets, so dropping this future cannot
        // stop a commit halfway or free the lanes before it is done.
        let staged = txn.close();
        let task = tokio::spawn(commit(Arc::clone(&self.store), txn, staged, tickets));
        match task.await {
            Ok(Ok(())) => Ok(value),
            Ok(Err(failure)) => Err(failure.into()),
            Err(e) if e.is_panic() => Err(Error::Panicked(panic_message(e.into_panic().as_ref()))),
            Err(e) => Err(Error::StoreWrite(StoreError::Backend(format!(
                "commit task did not finish: {e}"
            )))),
        }
    }

    /// Single-key form of [`Coordinator::run`]
    ///
    /// # Errors
    /// Same as [`Coordinator::run`].
    pub async fn run_one<F, Fut, T, E>(&self, key: ResourceKey, body: F) -> Result<T, Error<E>>
    where
        S: 'static,
        F: FnOnce(Txn<S>) -> Fut,
        Fut: Future<Output = Result<T, Error<E>>>,
    {
        self.run([key], body).await
    }

    /// Acquire tickets in ascending key order under one deadline.
    ///
    /// On failure the tickets acquired so far are dropped, which releases
    /// them.
    async fn acquire(&self, keys: &BTreeSet<ResourceKey>) -> Result<Vec<Ticket>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.queue.config().lane_timeout;
        let mut held = Vec::with_capacity(keys.len());

        for key in keys {
            let mut ticket = self.queue.enqueue(key)?;
            if tokio::time::timeout_at(deadline, ticket.granted())
                .await
                .is_err()
            {
                warn!(
                    "coordinator: lane '{key}' not granted in time, releasing {} held",
                    held.len()
                );
                return Err(QueueError::LaneTimeout { key: key.clone() });
            }
            held.push(ticket);
        }
        Ok(held)
    }
}

// ============================================================================
// Commit
// ============================================================================

enum CommitError {
    Read(StoreError),
    Write(StoreError),
}

impl<E> From<CommitError> for Error<E> {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::Read(e) => Self::StoreRead(e),
            CommitError::Write(e) => Self::StoreWrite(e),
        }
    }
}

/// Write staged documents in key order; undo on the first failure.
///
/// The lanes stay held until this returns.
async fn commit<S: Store>(
    store: Arc<S>,
    txn: Txn<S>,
    staged: BTreeMap<ResourceKey, Staged>,
    tickets: Vec<Ticket>,
) -> Result<(), CommitError> {
    let _held = tickets;

    // Prior state of every key about to change, for undo
    let mut plan = Vec::with_capacity(staged.len());
    for (key, change) in staged {
        let prior = match txn.snapshot(&key) {
            Some(prior) => prior,
            None => store.fetch(&key).await.map_err(CommitError::Read)?,
        };
        let unchanged = match (&change, &prior) {
            (Staged::Put(doc), Some(old)) => doc == old,
            (Staged::Delete, None) => true,
            _ => false,
        };
        if !unchanged {
            plan.push((key, change, prior));
        }
    }

    let mut applied: Vec<(ResourceKey, Option<Document>)> = Vec::with_capacity(plan.len());
    for (key, change, prior) in plan {
        let written = match &change {
            Staged::Put(doc) => store.save(&key, doc).await,
            Staged::Delete => store.remove(&key).await,
        };
        if let Err(e) = written {
            warn!(
                "coordinator: writing '{key}' failed ({e}), undoing {} write(s)",
                applied.len()
            );
            undo(store.as_ref(), applied).await;
            return Err(CommitError::Write(e));
        }
        applied.push((key, prior));
    }

    debug!("coordinator: committed {} document(s)", applied.len());
    Ok(())
}

async fn undo<S: Store>(store: &S, applied: Vec<(ResourceKey, Option<Document>)>) {
    for (key, prior) in applied.into_iter().rev() {
        let restored = match &prior {
            Some(doc) => store.save(&key, doc).await,
            None => store.remove(&key).await,
        };
        if let Err(e) = restored {
            error!("coordinator: could not restore '{key}' after failed commit: {e}");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
