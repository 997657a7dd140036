use crate::doc::DocId;
use crate::id::StateVector;
use crate::id_set::DeleteSet;
use crate::transaction::TransactionMut;
use crate::types::{BranchPtr, Path};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(0);

type Callback<T> = Box<dyn Fn(&T)>;

struct Entry<T> {
    id: u64,
    callback: Callback<T>,
}

/// A small named-topic publish/subscribe bus with synchronous dispatch (spec.md §9
/// "Observers": "Observable is a named-topic publish/subscribe with synchronous dispatch").
/// Used both per-[crate::Doc] and per-[crate::Workspace].
pub struct Observer<T> {
    entries: Rc<RefCell<Vec<Entry<T>>>>,
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Observer {
            entries: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<T: 'static> Observer<T> {
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + 'static,
    {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        self.entries.borrow_mut().push(Entry {
            id,
            callback: Box::new(f),
        });
        Subscription {
            id,
            registry: Rc::new(Rc::downgrade(&self.entries)),
        }
    }

    /// Dispatches `value` to every live subscriber in registration order. Rust closures aren't a
    /// fallible boundary the way a JS callback is, so per-callback isolation (spec.md §7
    /// "Observer failure") is left to each callback to log from internally rather than caught
    /// here with `catch_unwind`, matching the source's "log and continue, don't stop siblings"
    /// intent without pretending panics are recoverable.
    pub fn trigger(&self, value: &T) {
        for entry in self.entries.borrow().iter() {
            (entry.callback)(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

trait Unsubscribe {
    fn unsubscribe(&self, id: u64);
}

impl<T: 'static> Unsubscribe for Weak<RefCell<Vec<Entry<T>>>> {
    fn unsubscribe(&self, id: u64) {
        if let Some(entries) = self.upgrade() {
            entries.borrow_mut().retain(|e| e.id != id);
        }
    }
}

/// A subscription handle: dropping it unsubscribes the associated callback. Returned by every
/// `on_*`/`observe_*` method (spec.md §6 `Store.on(...)` / `Block.on(...)`).
pub struct Subscription {
    id: u64,
    registry: Rc<dyn Unsubscribe>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.id);
    }
}

/// A single shallow or deep change notification (spec.md §4.5 step 2: "fire shallow observers
/// ... fire deep observers sorted ascending by `event.path.length`").
#[derive(Clone)]
pub struct Event {
    pub target: BranchPtr,
    pub path: Path,
    pub keys_changed: Vec<Option<std::sync::Arc<str>>>,
}

impl Event {
    pub fn new(
        target: BranchPtr,
        path: Path,
        keys_changed: Vec<Option<std::sync::Arc<str>>>,
    ) -> Self {
        Event {
            target,
            path,
            keys_changed,
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("path_len", &self.path.len())
            .field("keys_changed", &self.keys_changed)
            .finish()
    }
}

/// Per-[crate::Doc] `updateV2` payload (spec.md §6): the bytes produced for this one doc by the
/// cleanup pipeline's encoding step, alongside the state vectors that bracket the transaction.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub update: Vec<u8>,
    pub before_state: StateVector,
    pub after_state: StateVector,
    pub delete_set: DeleteSet,
}

impl UpdateEvent {
    pub fn new(txn: &TransactionMut, update: Vec<u8>) -> Self {
        UpdateEvent {
            update,
            before_state: txn.before_state.clone(),
            after_state: txn.after_state.clone(),
            delete_set: txn.delete_set.clone(),
        }
    }
}

/// Store-level `afterTransactionCleanup` payload: the per-doc update bytes produced this
/// workspace-transaction (spec.md §4.5 step 5).
#[derive(Debug, Clone, Default)]
pub struct WorkspaceUpdateEvent {
    pub updates: std::collections::HashMap<DocId, Vec<u8>>,
}

/// `callRootObservers` payload (spec.md §4.5 step 3): the deep events produced across every doc
/// owned by one root doc this workspace-transaction, bucketed by that root doc's id.
#[derive(Debug, Clone)]
pub struct RootObserverEvent {
    pub root_doc: DocId,
    pub events: Vec<Event>,
}

#[derive(Default)]
pub(crate) struct DocEvents {
    pub(crate) update: Observer<UpdateEvent>,
    pub(crate) before_transaction: Observer<TransactionMut>,
    pub(crate) before_observer_calls: Observer<TransactionMut>,
    pub(crate) after_transaction: Observer<TransactionMut>,
    pub(crate) after_transaction_cleanup: Observer<TransactionMut>,
    pub(crate) after_all_transactions: Observer<()>,
}

#[derive(Default)]
pub(crate) struct WorkspaceEvents {
    pub(crate) update_v2: Observer<WorkspaceUpdateEvent>,
    pub(crate) after_transaction_cleanup: Observer<WorkspaceUpdateEvent>,
    pub(crate) root_observers: Observer<RootObserverEvent>,
}
