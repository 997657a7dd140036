use crate::doc::{root_doc_id, Doc, DocCell, DocId, DocOptions};
use crate::error::{Error, Result};
use crate::event::{Event, RootObserverEvent, Subscription, WorkspaceEvents, WorkspaceUpdateEvent};
use crate::id::{ClientID, ID};
use crate::transaction::{Origin, TransactionMut};
use crate::types::{BranchPtr, DocType};
use crate::update::PendingDocUpdate;
use atomic_refcell::AtomicRefCell;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Construction-time configuration for a [Workspace] (spec.md §6 `Store.new(opts{gc, gc_filter,
/// auto_ref})`).
#[derive(Clone)]
pub struct WorkspaceOptions {
    pub client_id: Option<ClientID>,
    pub gc: bool,
    pub gc_filter: Arc<dyn Fn(&crate::block::Item) -> bool + Send + Sync>,
    /// Whether plain `Type` assignments of a doc's root type should be auto-wrapped in a `Ref`
    /// rather than requiring an explicit `set_ref`/`push_ref` call.
    pub auto_ref: bool,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        WorkspaceOptions {
            client_id: None,
            gc: true,
            gc_filter: Arc::new(|_| true),
            auto_ref: false,
        }
    }
}

impl WorkspaceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id(mut self, id: ClientID) -> Self {
        self.client_id = Some(id);
        self
    }

    pub fn gc(mut self, gc: bool) -> Self {
        self.gc = gc;
        self
    }

    pub fn auto_ref(mut self, auto_ref: bool) -> Self {
        self.auto_ref = auto_ref;
        self
    }

    fn doc_options(&self, client_id: ClientID) -> DocOptions {
        DocOptions::new()
            .client_id(client_id)
            .gc(self.gc)
            .gc_filter({
                let f = self.gc_filter.clone();
                move |item: &crate::block::Item| f(item)
            })
    }
}

/// Weak handle a [TransactionMut] uses to reach the [WorkspaceTransaction] that spawned it,
/// without the two forming an uncollectable `Rc` cycle (the transaction owns its per-doc
/// transactions, each of which needs to reach back up).
pub(crate) type WorkspaceTransactionHandle = Weak<RefCell<WorkspaceTransaction>>;

/// Aggregates every per-doc [TransactionMut] spawned during one [Workspace::transact] call
/// (spec.md §4.5 `StoreTransaction`).
pub struct WorkspaceTransaction {
    pub workspace: WorkspaceCell,
    pub origin: Option<Origin>,
    pub local: bool,
    self_handle: WorkspaceTransactionHandle,
    pub doc_transactions: HashMap<DocId, TransactionMut>,
    pub docs_added: HashSet<DocId>,
    pub(crate) doc_refs_added: Vec<(DocId, crate::block::ItemPtr)>,
    pub(crate) doc_refs_removed: Vec<(DocId, crate::block::ItemPtr)>,
    pub(crate) doc_unrefs_added: Vec<crate::block::ItemPtr>,
    pub root_doc_events: HashMap<DocId, Vec<Event>>,
}

impl WorkspaceTransaction {
    fn new(workspace: WorkspaceCell, origin: Option<Origin>, local: bool) -> Self {
        WorkspaceTransaction {
            workspace,
            origin,
            local,
            self_handle: Weak::new(),
            doc_transactions: HashMap::new(),
            docs_added: HashSet::new(),
            doc_refs_added: Vec::new(),
            doc_refs_removed: Vec::new(),
            doc_unrefs_added: Vec::new(),
            root_doc_events: HashMap::new(),
        }
    }

    /// Returns the per-doc transaction for `doc_id`, creating it on first touch within this
    /// workspace transaction (spec.md §4.5: "a nested call shares the outer StoreTransaction and
    /// writes into the same per-block Transactions").
    pub fn doc(&mut self, doc_id: &DocId) -> Result<&mut TransactionMut> {
        if !self.doc_transactions.contains_key(doc_id) {
            let doc = self
                .workspace
                .get_doc(doc_id)
                .ok_or_else(|| Error::DocNotFound(doc_id.clone()))?;
            let mut txn = TransactionMut::new(doc, self.origin.clone(), self.local);
            txn.workspace_txn = Some(self.self_handle.clone());
            self.doc_transactions.insert(doc_id.clone(), txn);
        }
        Ok(self.doc_transactions.get_mut(doc_id).unwrap())
    }

    /// Convenience: root type of `doc_id`'s per-doc transaction.
    pub fn root(&mut self, doc_id: &DocId) -> Result<BranchPtr> {
        let txn = self.doc(doc_id)?;
        Ok(txn.doc.clone().borrow_mut().root())
    }
}

/// The top-level registry of every [Doc] a peer knows about, and the unit transactions are
/// coordinated across (spec.md §4 `Store`).
pub struct Workspace {
    pub client_id: ClientID,
    docs: HashMap<DocId, DocCell>,
    options: WorkspaceOptions,
    active_txn: Option<Rc<RefCell<WorkspaceTransaction>>>,
    cleanup_running: bool,
    transaction_cleanups: VecDeque<Rc<RefCell<WorkspaceTransaction>>>,
    /// Remote updates targeting a doc this workspace hasn't seen yet (spec.md supplement,
    /// modeled on `yrs::Store::pending`), keyed by the doc they're waiting on.
    pub pending: HashMap<DocId, PendingDocUpdate>,
    pub(crate) events: WorkspaceEvents,
}

impl Workspace {
    fn new(options: WorkspaceOptions) -> Self {
        let client_id = options.client_id.unwrap_or_else(|| rand::random::<u64>());
        Workspace {
            client_id,
            docs: HashMap::new(),
            options,
            active_txn: None,
            cleanup_running: false,
            transaction_cleanups: VecDeque::new(),
            pending: HashMap::new(),
            events: WorkspaceEvents::default(),
        }
    }
}

/// Shared, interior-mutable handle to a [Workspace] — the same `Arc<AtomicRefCell<_>>` pattern
/// [crate::doc::DocCell] uses, so transactions and observers can all reach the same registry.
#[derive(Clone)]
pub struct WorkspaceCell(Arc<AtomicRefCell<Workspace>>);

impl WorkspaceCell {
    pub fn new(options: WorkspaceOptions) -> Self {
        WorkspaceCell(Arc::new(AtomicRefCell::new(Workspace::new(options))))
    }

    pub fn client_id(&self) -> ClientID {
        self.0.borrow().client_id
    }

    pub fn get_doc(&self, id: &DocId) -> Option<DocCell> {
        self.0.borrow().docs.get(id).cloned()
    }

    fn mark_added(&self, doc_id: &DocId) {
        if let Some(txn) = self.0.borrow().active_txn.clone() {
            txn.borrow_mut().docs_added.insert(doc_id.clone());
        }
    }

    /// `Store.create_block(type)` (spec.md §4.3): a fresh, unnamed doc with a UUIDv4 id.
    pub fn create_doc(&self, doc_type: DocType) -> DocCell {
        let (client_id, opts) = {
            let ws = self.0.borrow();
            (ws.client_id, ws.options.doc_options(ws.client_id))
        };
        let id = crate::doc::new_doc_id();
        let doc = Doc::new(id.clone(), false, doc_type, client_id, &opts);
        let cell = DocCell::new(doc);
        self.0.borrow_mut().docs.insert(id.clone(), cell.clone());
        self.mark_added(&id);
        cell
    }

    /// `Store.get_or_create_root_type(name, type)` (spec.md §4.4), lifted one level: returns the
    /// root *doc* named `name`, creating it (and its root type) on first access.
    pub fn get_or_create_root_doc(&self, name: &str, doc_type: DocType) -> Result<DocCell> {
        let id = root_doc_id(name);
        if let Some(existing) = self.get_doc(&id) {
            let existing_type = existing.borrow().doc_type.clone();
            if existing_type != doc_type {
                return Err(Error::TypeMismatch {
                    id,
                    existing: existing_type,
                    requested: doc_type,
                });
            }
            return Ok(existing);
        }
        let (client_id, opts) = {
            let ws = self.0.borrow();
            (ws.client_id, ws.options.doc_options(ws.client_id))
        };
        let doc = Doc::new(id.clone(), true, doc_type, client_id, &opts);
        let cell = DocCell::new(doc);
        self.0.borrow_mut().docs.insert(id.clone(), cell.clone());
        self.mark_added(&id);
        Ok(cell)
    }

    /// `Store.get_or_create_block(id, type)` (spec.md §4.4): used when integrating a remote `Ref`
    /// whose target hasn't been seen locally yet.
    pub fn get_or_create_doc(&self, id: &DocId, doc_type: DocType) -> DocCell {
        if let Some(existing) = self.get_doc(id) {
            return existing;
        }
        let (client_id, opts) = {
            let ws = self.0.borrow();
            (ws.client_id, ws.options.doc_options(ws.client_id))
        };
        let doc = Doc::new(id.clone(), false, doc_type, client_id, &opts);
        let cell = DocCell::new(doc);
        self.0.borrow_mut().docs.insert(id.clone(), cell.clone());
        self.mark_added(id);
        cell
    }

    /// `Store.apply_update_v2` (spec.md §6): decodes a remote update and integrates it into
    /// `doc_id` as a non-local transaction, so ref conflicts follow the remote-loses-existing
    /// policy (spec.md §4.6 step 4, [crate::refs::resolve_doc_refs]) rather than the local one.
    /// Creates the target doc first if this workspace hasn't seen it yet (spec.md §4.4
    /// `get_or_create_block`).
    pub fn apply_update(
        &self,
        doc_id: &DocId,
        doc_type: DocType,
        bytes: &[u8],
        origin: Option<Origin>,
    ) -> Result<()> {
        let update = crate::encoding::decode_update(bytes)?;
        self.get_or_create_doc(doc_id, doc_type);
        let doc_id = doc_id.clone();
        self.transact_remote(origin, move |wtx| -> Result<()> {
            let txn = wtx.doc(&doc_id)?;
            for item in update.items {
                txn.apply_remote_item(item)?;
            }
            for (client, ranges) in update.delete_set.iter() {
                for range in ranges {
                    let mut clock = range.clock;
                    while clock < range.end() {
                        let found = txn.doc.borrow_mut().store.find_item(&ID::new(*client, clock));
                        match found {
                            Some(ptr) => {
                                let len = ptr.len;
                                txn.delete(ptr)?;
                                clock += len.max(1);
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// `Store.encode_state_as_update_v2(doc_id)` (spec.md §6), optionally diffed against
    /// `state_vector`.
    pub fn encode_state_as_update_v2(&self, doc_id: &DocId, state_vector: Option<&crate::id::StateVector>) -> Result<Vec<u8>> {
        let doc = self.get_doc(doc_id).ok_or_else(|| Error::DocNotFound(doc_id.clone()))?;
        Ok(crate::encoding::encode_state_as_update_v2(&doc, state_vector))
    }

    /// `Store.state_vector(doc_id)`: the frontier a peer would send back to ask for only what
    /// it's missing of that doc.
    pub fn state_vector(&self, doc_id: &DocId) -> Result<crate::id::StateVector> {
        let doc = self.get_doc(doc_id).ok_or_else(|| Error::DocNotFound(doc_id.clone()))?;
        Ok(doc.borrow().store.get_state_vector())
    }

    pub fn on_update_v2<F>(&self, f: F) -> Subscription
    where
        F: Fn(&WorkspaceUpdateEvent) + 'static,
    {
        self.0.borrow().events.update_v2.subscribe(f)
    }

    pub fn on_after_transaction_cleanup<F>(&self, f: F) -> Subscription
    where
        F: Fn(&WorkspaceUpdateEvent) + 'static,
    {
        self.0.borrow().events.after_transaction_cleanup.subscribe(f)
    }

    /// `callRootObservers` subscription (spec.md §4.5 step 3): fires once per root doc that had
    /// at least one deep event this workspace-transaction.
    pub fn on_root_observers<F>(&self, f: F) -> Subscription
    where
        F: Fn(&RootObserverEvent) + 'static,
    {
        self.0.borrow().events.root_observers.subscribe(f)
    }

    /// `Store.transact(f, origin?)` (spec.md §4.5). Re-entrant: a nested call sharing the same
    /// in-flight transaction just runs `f` against it; only the outermost call runs cleanup.
    /// Transactions started by an observer callback *during* cleanup are queued
    /// (`_transaction_cleanups`) and drained serially afterwards rather than nested, per §4.5's
    /// last paragraph.
    pub fn transact<F, R>(&self, origin: Option<Origin>, f: F) -> R
    where
        F: FnOnce(&mut WorkspaceTransaction) -> R,
    {
        self.transact_with_locality(origin, true, f)
    }

    /// Entry point for integrating a remote update (spec.md §6 `apply_update_v2`): runs as a
    /// non-local transaction, so [crate::refs::resolve_doc_refs] applies the remote-loses-
    /// pre-existing-referrer policy (spec.md §4.6 step 4) instead of the local one, and
    /// [Self::check_client_id_collision] actually gets to inspect it.
    fn transact_remote<F, R>(&self, origin: Option<Origin>, f: F) -> R
    where
        F: FnOnce(&mut WorkspaceTransaction) -> R,
    {
        self.transact_with_locality(origin, false, f)
    }

    fn transact_with_locality<F, R>(&self, origin: Option<Origin>, local: bool, f: F) -> R
    where
        F: FnOnce(&mut WorkspaceTransaction) -> R,
    {
        let existing = self.0.borrow().active_txn.clone();
        if let Some(txn_rc) = existing {
            let mut txn = txn_rc.borrow_mut();
            return f(&mut txn);
        }

        let cleanup_running = self.0.borrow().cleanup_running;
        let txn_rc = self.new_transaction(origin, local);

        if cleanup_running {
            let result = f(&mut txn_rc.borrow_mut());
            self.0.borrow_mut().transaction_cleanups.push_back(txn_rc);
            return result;
        }

        self.0.borrow_mut().active_txn = Some(txn_rc.clone());
        let result = f(&mut txn_rc.borrow_mut());
        self.0.borrow_mut().active_txn = None;

        self.0.borrow_mut().cleanup_running = true;
        self.run_cleanup(txn_rc);
        loop {
            let next = self.0.borrow_mut().transaction_cleanups.pop_front();
            match next {
                Some(pending) => self.run_cleanup(pending),
                None => break,
            }
        }
        self.0.borrow_mut().cleanup_running = false;

        result
    }

    /// Guards against two peers having picked the same client id (spec.md §4.4): if cleanup of a
    /// non-local transaction shows our own client id's clock moved, someone else used it
    /// concurrently. The existing local log keeps its old id; only the workspace's id for *new*
    /// writes changes.
    fn check_client_id_collision(&self, txn_rc: &Rc<RefCell<WorkspaceTransaction>>) {
        let wtx = txn_rc.borrow();
        if wtx.local {
            return;
        }
        let my_id = self.0.borrow().client_id;
        let collided = wtx.doc_transactions.values().any(|txn| {
            txn.before_state.get(&my_id) != txn.after_state.get(&my_id)
        });
        drop(wtx);
        if collided {
            let fresh = rand::random::<u64>();
            log::warn!("client id {} collided with a remote peer, regenerating as {}", my_id, fresh);
            self.0.borrow_mut().client_id = fresh;
        }
    }

    fn new_transaction(&self, origin: Option<Origin>, local: bool) -> Rc<RefCell<WorkspaceTransaction>> {
        let txn_rc = Rc::new(RefCell::new(WorkspaceTransaction::new(self.clone(), origin, local)));
        txn_rc.borrow_mut().self_handle = Rc::downgrade(&txn_rc);
        txn_rc
    }

    /// The cleanup pipeline (spec.md §4.5 "Cleanup pipeline (outermost only)"), steps 1-5.
    fn run_cleanup(&self, txn_rc: Rc<RefCell<WorkspaceTransaction>>) {
        {
            let mut wtx = txn_rc.borrow_mut();
            for txn in wtx.doc_transactions.values_mut() {
                txn.delete_set.sort_and_merge();
                txn.after_state = txn.doc.borrow().store.get_state_vector();
            }
        }

        // step 1: resolve_block_refs.
        if let Err(e) = crate::refs::resolve_doc_refs(&mut txn_rc.borrow_mut()) {
            log::warn!("resolve_doc_refs failed: {}", e);
        }

        self.check_client_id_collision(&txn_rc);

        // step 2: per-doc observer dispatch.
        let mut root_events: HashMap<DocId, Vec<Event>> = HashMap::new();
        {
            let mut wtx = txn_rc.borrow_mut();
            let doc_ids: Vec<DocId> = wtx.doc_transactions.keys().cloned().collect();
            for doc_id in doc_ids {
                let (mut deep_events, branch_events): (Vec<Event>, Vec<(BranchPtr, Event)>) = {
                    let txn = wtx.doc_transactions.get(&doc_id).unwrap();
                    txn.doc.borrow().events.before_observer_calls.trigger(txn);
                    let mut events = Vec::new();
                    for (branch, keys) in &txn.changed {
                        let is_live = branch.item.map(|i| !i.is_deleted()).unwrap_or(true);
                        if !is_live {
                            continue;
                        }
                        let event = Event::new(
                            *branch,
                            crate::types::Path::new(),
                            keys.iter().cloned().collect(),
                        );
                        events.push((*branch, event));
                    }
                    let deep = events.iter().map(|(_, e)| e.clone()).collect();
                    (deep, events)
                };
                for (mut branch, event) in branch_events {
                    branch.notify_shallow(&event);
                }
                deep_events.sort_by_key(|e| e.path.len());
                if let Some(root) = wtx
                    .doc_transactions
                    .get(&doc_id)
                    .and_then(|txn| txn.doc.clone().borrow_mut().get_type(""))
                {
                    root.notify_deep(&deep_events);
                }

                let root_doc = root_doc_id_of(&wtx.workspace, &doc_id);
                root_events.entry(root_doc).or_default().extend(deep_events);

                if let Some(txn) = wtx.doc_transactions.get(&doc_id) {
                    txn.doc.borrow().events.after_transaction.trigger(txn);
                }
            }
            wtx.root_doc_events = root_events.clone();
        }

        // step 3: callRootObservers. `root_events` buckets every doc's deep events under its
        // root doc id via `owner_doc`; fire once per root doc that actually changed.
        for (root_doc, events) in &root_events {
            if events.is_empty() {
                continue;
            }
            self.0.borrow().events.root_observers.trigger(&RootObserverEvent {
                root_doc: root_doc.clone(),
                events: events.clone(),
            });
        }

        // step 4: per-doc GC + merge.
        {
            let mut wtx = txn_rc.borrow_mut();
            for txn in wtx.doc_transactions.values_mut() {
                let mut doc = txn.doc.borrow_mut();
                if doc.gc {
                    let filter = doc.gc_filter.clone();
                    let delete_set = txn.delete_set.clone();
                    for (client, ranges) in delete_set.iter() {
                        if let Some(list) = doc.store.get_client_mut(client) {
                            for range in ranges {
                                let mut clock = range.clock;
                                while clock < range.end() {
                                    if let Some(idx) = list.find_pivot(clock) {
                                        if let Some(cell) = list.get_mut(idx) {
                                            let should_gc = match cell.as_item() {
                                                Some(item) => {
                                                    item.is_deleted() && !item.is_keep() && filter(item)
                                                }
                                                None => false,
                                            };
                                            if should_gc {
                                                cell.gc();
                                            }
                                            clock = cell.clock_end();
                                            continue;
                                        }
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }

                // merge structs right-to-left over every client this transaction touched (spec.md
                // §4.5 step 4's second half), after GC so freshly created GC tombstones can merge
                // with their neighbours too.
                let touched: HashSet<ClientID> = txn
                    .before_state
                    .iter()
                    .map(|(c, _)| *c)
                    .chain(txn.after_state.iter().map(|(c, _)| *c))
                    .chain(txn.delete_set.iter().map(|(c, _)| *c))
                    .collect();
                for client in touched {
                    if let Some(list) = doc.store.get_client_mut(&client) {
                        list.merge_adjacent();
                    }
                }
            }
        }

        // step 5: emitStoreTransactionCleanupEvents.
        let mut updates = HashMap::new();
        {
            let wtx = txn_rc.borrow();
            for (doc_id, txn) in &wtx.doc_transactions {
                let bytes = crate::encoding::encode_update_v2(txn);
                if !bytes.is_empty() {
                    let event = crate::event::UpdateEvent::new(txn, bytes.clone());
                    txn.doc.borrow().events.update.trigger(&event);
                    updates.insert(doc_id.clone(), bytes);
                }
            }
        }
        let ws_event = WorkspaceUpdateEvent { updates };
        {
            let ws = self.0.borrow();
            ws.events.update_v2.trigger(&ws_event);
            ws.events.after_transaction_cleanup.trigger(&ws_event);
        }
    }
}

fn root_doc_id_of(workspace: &WorkspaceCell, doc_id: &DocId) -> DocId {
    let mut cursor = doc_id.clone();
    loop {
        let owner = workspace.get_doc(&cursor).and_then(|d| d.borrow().owner_doc.clone());
        match owner {
            Some(parent) => cursor = parent,
            None => return cursor,
        }
    }
}

impl PartialEq for WorkspaceCell {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for WorkspaceCell {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MapRef;

    #[test]
    fn transact_creates_root_doc_and_mutates_it() {
        let ws = WorkspaceCell::new(WorkspaceOptions::new());
        let root = ws.get_or_create_root_doc("config", DocType::Map).unwrap();
        let root_id = root.borrow().id.clone();

        ws.transact(None, |wtx| {
            let txn = wtx.doc(&root_id).unwrap();
            let branch = txn.doc.clone().borrow_mut().root();
            txn.set(branch, "greeting", crate::block::ItemContent::String("hi".into()))
                .unwrap();
        });

        let branch = root.borrow_mut().root();
        let map = MapRef::from(branch);
        assert!(map.contains_key("greeting"));
    }

    #[test]
    fn reentrant_transact_shares_same_transaction() {
        let ws = WorkspaceCell::new(WorkspaceOptions::new());
        let root = ws.get_or_create_root_doc("doc", DocType::Array).unwrap();
        let root_id = root.borrow().id.clone();

        ws.transact(None, |wtx| {
            {
                let txn = wtx.doc(&root_id).unwrap();
                let branch = txn.doc.clone().borrow_mut().root();
                txn.push(branch, crate::block::ItemContent::String("a".into()))
                    .unwrap();
            }
            ws.transact(None, |inner| {
                let txn = inner.doc(&root_id).unwrap();
                let branch = txn.doc.clone().borrow_mut().root();
                txn.push(branch, crate::block::ItemContent::String("b".into()))
                    .unwrap();
            });
        });

        let arr = crate::types::ArrayRef::from(root.borrow_mut().root());
        assert_eq!(arr.len(), 2);
    }
}
