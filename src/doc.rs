use crate::block::ItemPtr;
use crate::block_store::BlockStore;
use crate::event::{DocEvents, Subscription};
use crate::id::ClientID;
use crate::types::{Branch, BranchPtr, DocType};
use atomic_refcell::AtomicRefCell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of a [Doc] (spec.md §3 `Block.id`): either a fresh UUIDv4 string for a regular doc,
/// or `"@" + root_name` for a root doc.
pub type DocId = Arc<str>;

pub fn root_doc_id(name: &str) -> DocId {
    DocId::from(format!("@{}", name))
}

pub fn new_doc_id() -> DocId {
    DocId::from(Uuid::new_v4().to_string())
}

/// Construction-time configuration for a [Doc] (spec.md §6 `Store.new(opts{gc, gc_filter,
/// auto_ref})`, applied per-doc here and at the workspace level in
/// [crate::workspace::WorkspaceOptions]).
#[derive(Clone)]
pub struct DocOptions {
    pub client_id: Option<ClientID>,
    pub gc: bool,
    pub gc_filter: Arc<dyn Fn(&crate::block::Item) -> bool + Send + Sync>,
}

impl Default for DocOptions {
    fn default() -> Self {
        DocOptions {
            client_id: None,
            gc: true,
            gc_filter: Arc::new(|_| true),
        }
    }
}

impl DocOptions {
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

    pub fn gc_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::block::Item) -> bool + Send + Sync + 'static,
    {
        self.gc_filter = Arc::new(f);
        self
    }
}

/// A single, independently mutable CRDT document (spec.md §3 `Block`).
///
/// Every `Doc` owns its own [BlockStore] and `share` map of named top-level types (by convention
/// the empty-string key is the root type, per spec.md §3's invariant I5). Cross-doc embedding is
/// tracked here via `referrer`/`prev_referrer`, the only mutable edge that crosses doc
/// boundaries (spec.md §5).
pub struct Doc {
    pub id: DocId,
    pub is_root: bool,
    pub doc_type: DocType,
    pub client_id: ClientID,
    pub store: BlockStore,
    pub share: HashMap<Arc<str>, Box<Branch>>,
    /// The item (content = `DocRef`) that currently embeds this doc, if any (spec.md §3
    /// `_referrer`). At most one at a time (invariant I1).
    pub referrer: Option<ItemPtr>,
    /// The last `referrer` before it was cleared, kept around so an `Unref` can be emitted
    /// describing exactly which item used to own this doc (spec.md §3 `_prevReferrer`).
    pub prev_referrer: Option<ItemPtr>,
    /// Id of the doc that owns `referrer` (the item embedding this doc lives inside that doc's
    /// block store), kept alongside `referrer` so the cleanup pipeline can bucket root-level
    /// events by walking this chain without a reverse item-to-doc index.
    pub owner_doc: Option<DocId>,
    pub gc: bool,
    pub gc_filter: Arc<dyn Fn(&crate::block::Item) -> bool + Send + Sync>,
    root_cache: AtomicRefCell<Option<Option<DocId>>>,
    pub(crate) events: DocEvents,
    /// Standalone (no-[crate::Workspace]) cleanup-queue state (spec.md §4.3: "standalone blocks
    /// keep their own cleanup queue"). Unused once a doc is adopted by a workspace — at that
    /// point [crate::workspace::Workspace::transact] drives cleanup instead.
    active_txn: Option<Rc<RefCell<crate::transaction::TransactionMut>>>,
    cleanup_running: bool,
    cleanup_queue: std::collections::VecDeque<Rc<RefCell<crate::transaction::TransactionMut>>>,
}

impl Doc {
    pub(crate) fn new(id: DocId, is_root: bool, doc_type: DocType, client_id: ClientID, opts: &DocOptions) -> Self {
        let mut share = HashMap::new();
        let root_type_ref = doc_type.clone();
        let mut root = Box::new(Branch::new(root_type_ref));
        root.name = Some(Arc::from(""));
        share.insert(Arc::from(""), root);
        Doc {
            id,
            is_root,
            doc_type,
            client_id,
            store: BlockStore::new(),
            share,
            referrer: None,
            prev_referrer: None,
            owner_doc: None,
            gc: opts.gc,
            gc_filter: opts.gc_filter.clone(),
            root_cache: AtomicRefCell::new(None),
            events: DocEvents::default(),
            active_txn: None,
            cleanup_running: false,
            cleanup_queue: std::collections::VecDeque::new(),
        }
    }

    /// Creates a doc with no [crate::Workspace] (spec.md §4.3's "standalone blocks"). It can
    /// mutate and emit `update`/`afterTransaction` events on its own via [DocCell::transact], but
    /// any attempt to embed or be embedded by a `DocRef` fails with
    /// [crate::error::Error::RequiresWorkspace] until it's adopted by a workspace.
    pub fn detached(doc_type: DocType, opts: &DocOptions) -> DocCell {
        let client_id = opts.client_id.unwrap_or_else(|| rand::random::<u64>());
        let doc = Doc::new(new_doc_id(), false, doc_type, client_id, opts);
        DocCell::new(doc)
    }

    /// Returns a pointer to this doc's root type, exactly the type instance `get_type(doc_type)`
    /// would yield (spec.md §3 invariant I5).
    pub fn root(&mut self) -> BranchPtr {
        let branch = self.share.get_mut("").unwrap();
        BranchPtr::new(branch.as_mut())
    }

    pub fn get_or_create_type(&mut self, name: &str, type_ref: DocType) -> BranchPtr {
        let branch = self.share.entry(Arc::from(name)).or_insert_with(|| {
            let mut b = Box::new(Branch::new(type_ref));
            b.name = Some(Arc::from(name));
            b
        });
        BranchPtr::new(branch.as_mut())
    }

    pub fn get_type(&self, name: &str) -> Option<BranchPtr> {
        let branch = self.share.get(name)?;
        // SAFETY: only used to hand out a read-capable pointer into a heap-stable Box; the
        // mutable aliasing discipline is enforced by callers going through `TransactionMut`.
        Some(BranchPtr::new(unsafe {
            &mut *(branch.as_ref() as *const Branch as *mut Branch)
        }))
    }

    /// Invalidates the memoized root lookup (spec.md §4.3 `get_root_block`: "memoized"),
    /// e.g. after this doc's `referrer` changes.
    pub fn invalidate_root_cache(&self) {
        *self.root_cache.borrow_mut() = None;
    }

    /// Reassigns this doc's id once it already has one. Per spec.md §6/§9 (an explicit Open
    /// Question, resolved literally as the source behaves): this is logged and ignored rather
    /// than rejected with an error.
    pub fn set_guid(&mut self, new_id: DocId) {
        if !self.store.is_empty() || self.referrer.is_some() {
            log::warn!(
                "ignoring attempt to reassign doc id `{}` to `{}`: doc is already in use",
                self.id,
                new_id
            );
            return;
        }
        self.id = new_id;
    }

    pub fn on_update<F>(&self, f: F) -> Subscription
    where
        F: Fn(&crate::event::UpdateEvent) + 'static,
    {
        self.events.update.subscribe(f)
    }

    pub fn on_after_transaction<F>(&self, f: F) -> Subscription
    where
        F: Fn(&crate::transaction::TransactionMut) + 'static,
    {
        self.events.after_transaction.subscribe(f)
    }

    pub fn on_before_observer_calls<F>(&self, f: F) -> Subscription
    where
        F: Fn(&crate::transaction::TransactionMut) + 'static,
    {
        self.events.before_observer_calls.subscribe(f)
    }

    pub fn on_after_transaction_cleanup<F>(&self, f: F) -> Subscription
    where
        F: Fn(&crate::transaction::TransactionMut) + 'static,
    {
        self.events.after_transaction_cleanup.subscribe(f)
    }
}

impl Debug for Doc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doc")
            .field("id", &self.id)
            .field("is_root", &self.is_root)
            .field("doc_type", &self.doc_type)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Shared, interior-mutable handle to a [Doc], the same `Arc<AtomicRefCell<_>>` pattern `yrs`
/// uses for its own `StoreRef` — lets a [crate::workspace::Workspace] and every
/// [crate::transaction::TransactionMut] spawned against the same doc observe one another's
/// writes without a borrow-checker standoff.
#[derive(Clone)]
pub struct DocCell(pub(crate) Arc<AtomicRefCell<Doc>>);

impl DocCell {
    pub fn new(doc: Doc) -> Self {
        DocCell(Arc::new(AtomicRefCell::new(doc)))
    }

    pub fn borrow(&self) -> atomic_refcell::AtomicRef<'_, Doc> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> atomic_refcell::AtomicRefMut<'_, Doc> {
        self.0.borrow_mut()
    }

    /// `Block.transact(f, origin?)` for a doc with no [crate::Workspace] (spec.md §4.3). Re-entrant
    /// the same way [crate::workspace::Workspace::transact] is: a nested call sharing the same
    /// in-flight transaction just runs `f` against it, and only the outermost call runs cleanup.
    /// Docs that *do* belong to a workspace should mutate through
    /// [crate::workspace::Workspace::transact] instead, where cross-doc ref resolution can run.
    pub fn transact<F, R>(&self, origin: Option<crate::transaction::Origin>, f: F) -> R
    where
        F: FnOnce(&mut crate::transaction::TransactionMut) -> R,
    {
        self.transact_with_locality(origin, true, f)
    }

    /// Entry point for integrating a remote update into a standalone doc (spec.md §6
    /// `apply_update_v2`): runs as a non-local transaction so observers see the true provenance,
    /// even though a standalone doc has no `DocRef` conflict policy to switch on.
    fn transact_remote<F, R>(&self, origin: Option<crate::transaction::Origin>, f: F) -> R
    where
        F: FnOnce(&mut crate::transaction::TransactionMut) -> R,
    {
        self.transact_with_locality(origin, false, f)
    }

    fn transact_with_locality<F, R>(
        &self,
        origin: Option<crate::transaction::Origin>,
        local: bool,
        f: F,
    ) -> R
    where
        F: FnOnce(&mut crate::transaction::TransactionMut) -> R,
    {
        let existing = self.0.borrow().active_txn.clone();
        if let Some(txn_rc) = existing {
            let mut txn = txn_rc.borrow_mut();
            return f(&mut txn);
        }

        let cleanup_running = self.0.borrow().cleanup_running;
        let txn_rc = Rc::new(RefCell::new(crate::transaction::TransactionMut::new(
            self.clone(),
            origin,
            local,
        )));

        if cleanup_running {
            let result = f(&mut txn_rc.borrow_mut());
            self.0.borrow_mut().cleanup_queue.push_back(txn_rc);
            return result;
        }

        self.0.borrow_mut().active_txn = Some(txn_rc.clone());
        let result = f(&mut txn_rc.borrow_mut());
        self.0.borrow_mut().active_txn = None;

        self.0.borrow_mut().cleanup_running = true;
        self.run_standalone_cleanup(&txn_rc);
        loop {
            let next = self.0.borrow_mut().cleanup_queue.pop_front();
            match next {
                Some(pending) => self.run_standalone_cleanup(&pending),
                None => break,
            }
        }
        self.0.borrow_mut().cleanup_running = false;

        result
    }

    /// `Block.apply_update_v2` for a standalone doc (spec.md §6): decodes a remote update and
    /// integrates it as a non-local transaction. A standalone doc can never hold `DocRef` content
    /// (spec.md §4.6's `integrate_ref` requires a workspace), so decoded items only ever need
    /// splicing into this doc's own root/typed branches.
    pub fn apply_update(&self, bytes: &[u8], origin: Option<crate::transaction::Origin>) -> crate::error::Result<()> {
        let update = crate::encoding::decode_update(bytes)?;
        self.transact_remote(origin, move |txn| -> crate::error::Result<()> {
            for item in update.items {
                txn.apply_remote_item(item)?;
            }
            for (client, ranges) in update.delete_set.iter() {
                for range in ranges {
                    let mut clock = range.clock;
                    while clock < range.end() {
                        let found = txn
                            .doc
                            .borrow_mut()
                            .store
                            .find_item(&crate::id::ID::new(*client, clock));
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

    /// `Block.encode_state_as_update_v2` (spec.md §6), optionally diffed against `state_vector`.
    pub fn encode_state_as_update_v2(&self, state_vector: Option<&crate::id::StateVector>) -> Vec<u8> {
        crate::encoding::encode_state_as_update_v2(self, state_vector)
    }

    /// This doc's current [crate::id::StateVector] — the frontier a peer would send back to ask
    /// for only what it's missing.
    pub fn state_vector(&self) -> crate::id::StateVector {
        self.0.borrow().store.get_state_vector()
    }

    /// Standalone cleanup pipeline (spec.md §4.5 steps 2, 4, 5): no workspace means no
    /// ref-conflict resolution (step 1) and no root observers (step 3) — a doc with no workspace
    /// can never hold a `DocRef` (spec.md §4.6's `integrate_ref` requires one).
    fn run_standalone_cleanup(&self, txn_rc: &Rc<RefCell<crate::transaction::TransactionMut>>) {
        {
            let mut txn = txn_rc.borrow_mut();
            txn.delete_set.sort_and_merge();
            txn.after_state = txn.doc.borrow().store.get_state_vector();
        }

        let mut deep_events = Vec::new();
        {
            let txn = txn_rc.borrow();
            txn.doc.borrow().events.before_observer_calls.trigger(&txn);
            for (branch, keys) in &txn.changed {
                let is_live = branch.item.map(|i| !i.is_deleted()).unwrap_or(true);
                if !is_live {
                    continue;
                }
                let event = crate::event::Event::new(
                    *branch,
                    crate::types::Path::new(),
                    keys.iter().cloned().collect(),
                );
                let mut target = *branch;
                target.notify_shallow(&event);
                deep_events.push(event);
            }
            deep_events.sort_by_key(|e| e.path.len());
            if let Some(root) = txn.doc.clone().borrow_mut().get_type("") {
                root.notify_deep(&deep_events);
            }
            txn.doc.borrow().events.after_transaction.trigger(&txn);
        }

        {
            let txn = txn_rc.borrow();
            let mut doc_mut = txn.doc.borrow_mut();
            if doc_mut.gc {
                let filter = doc_mut.gc_filter.clone();
                let delete_set = txn.delete_set.clone();
                for (client, ranges) in delete_set.iter() {
                    if let Some(list) = doc_mut.store.get_client_mut(client) {
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
            // §4.5 step 4's second half), mirroring the workspace cleanup pipeline's merge pass.
            let touched: std::collections::HashSet<ClientID> = txn
                .before_state
                .iter()
                .map(|(c, _)| *c)
                .chain(txn.after_state.iter().map(|(c, _)| *c))
                .chain(txn.delete_set.iter().map(|(c, _)| *c))
                .collect();
            for client in touched {
                if let Some(list) = doc_mut.store.get_client_mut(&client) {
                    list.merge_adjacent();
                }
            }
        }

        let txn = txn_rc.borrow();
        let bytes = crate::encoding::encode_update_v2(&txn);
        if !bytes.is_empty() {
            let event = crate::event::UpdateEvent::new(&txn, bytes);
            txn.doc.borrow().events.update.trigger(&event);
        }
        txn.doc.borrow().events.after_transaction_cleanup.trigger(&txn);
    }
}

impl PartialEq for DocCell {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for DocCell {}
