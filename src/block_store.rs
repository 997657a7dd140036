use crate::block::{Item, ItemPtr};
use crate::id::{ClientID, Clock, StateVector, ID};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

/// A tombstone that replaced a garbage-collected [Item], preserving its ID range while dropping
/// its content (spec.md §4.1: "GC replaces a deleted Item in-place to reclaim content while
/// preserving ID range").
#[derive(Debug, Clone, Copy)]
pub struct GCRef {
    pub id: ID,
    pub len: Clock,
}

/// A placeholder occupying an ID range whose content was never observed locally — e.g. left
/// behind when decoding an update whose client ids skip ahead. Carried for completeness of the
/// per-client clock sequence; spec.md §3 lists `Skip` as a `Struct` variant alongside `Item`/`GC`.
#[derive(Debug, Clone, Copy)]
pub struct SkipRef {
    pub id: ID,
    pub len: Clock,
}

/// A single entry in a client's append-only operation log (spec.md §3 `Struct`).
pub enum BlockCell {
    Item(Box<Item>),
    GC(GCRef),
    Skip(SkipRef),
}

impl BlockCell {
    pub fn id(&self) -> ID {
        match self {
            BlockCell::Item(i) => i.id,
            BlockCell::GC(g) => g.id,
            BlockCell::Skip(s) => s.id,
        }
    }

    pub fn len(&self) -> Clock {
        match self {
            BlockCell::Item(i) => i.len,
            BlockCell::GC(g) => g.len,
            BlockCell::Skip(s) => s.len,
        }
    }

    pub fn clock_end(&self) -> Clock {
        self.id().clock + self.len()
    }

    pub fn contains(&self, id: &ID) -> bool {
        id.client == self.id().client && id.clock >= self.id().clock && id.clock < self.clock_end()
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            BlockCell::Item(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            BlockCell::Item(i) => Some(i),
            _ => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            BlockCell::Item(i) => i.is_deleted(),
            BlockCell::GC(_) => true,
            BlockCell::Skip(_) => false,
        }
    }

    /// Reclaims whatever heap-allocated content an `Item` holds, replacing it with a cheap
    /// `ItemContent::Deleted` placeholder over the same ID range (spec.md §4.5 step 4: "GC
    /// replaces a deleted Item in-place to reclaim content while preserving ID range"). This
    /// mutates the `Item` in place rather than swapping the whole cell for a `BlockCell::GC`:
    /// other items in the same client log reach this one through raw `left`/`right` `ItemPtr`s,
    /// and dropping the boxed `Item` out from under them would leave those pointers dangling.
    /// `BlockCell::GC` itself is reserved for ranges whose `Item` was never materialized locally
    /// in the first place (e.g. a GC entry arriving over the wire for content we never held).
    pub fn gc(&mut self) {
        if let BlockCell::Item(item) = self {
            item.content = crate::block::ItemContent::Deleted(item.len);
        }
    }

    /// Attempts to collapse `other` into `self` in place, spec.md §4.1's merge rule. Only two
    /// adjacent `Item`s with mergeable content ever report `true`; `GC` and `Skip` ranges merge
    /// by simple clock-range concatenation.
    pub fn try_merge(&mut self, other: &BlockCell) -> bool {
        match (self, other) {
            (BlockCell::Item(a), BlockCell::Item(b)) => {
                if a.can_merge(b) {
                    a.len += b.len;
                    a.right = b.right;
                    true
                } else {
                    false
                }
            }
            (BlockCell::GC(a), BlockCell::GC(b)) if a.id.client == b.id.client => {
                if a.id.clock + a.len == b.id.clock {
                    a.len += b.len;
                    true
                } else {
                    false
                }
            }
            (BlockCell::Skip(a), BlockCell::Skip(b)) if a.id.client == b.id.client => {
                if a.id.clock + a.len == b.id.clock {
                    a.len += b.len;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

impl Debug for BlockCell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockCell::Item(i) => Debug::fmt(i, f),
            BlockCell::GC(g) => write!(f, "GC({:?}, len={})", g.id, g.len),
            BlockCell::Skip(s) => write!(f, "Skip({:?}, len={})", s.id, s.len),
        }
    }
}

/// One client's append-only log, kept sorted by clock. Binary search (`find_pivot`, spec.md §4.1
/// `find_index_ss`) is the load-bearing operation here: integration, GC and merge all use it to
/// locate the cell containing a given ID.
#[derive(Default)]
pub struct ClientBlockList {
    list: Vec<BlockCell>,
}

impl ClientBlockList {
    pub fn new() -> Self {
        ClientBlockList { list: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Next free clock for this client: the clock the next appended cell would receive.
    pub fn clock(&self) -> Clock {
        self.list.last().map(|c| c.clock_end()).unwrap_or(0)
    }

    pub fn push(&mut self, cell: BlockCell) {
        self.list.push(cell);
    }

    pub fn insert(&mut self, index: usize, cell: BlockCell) {
        self.list.insert(index, cell);
    }

    pub fn get(&self, index: usize) -> Option<&BlockCell> {
        self.list.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut BlockCell> {
        self.list.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BlockCell> {
        self.list.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, BlockCell> {
        self.list.iter_mut()
    }

    /// Binary search for the index of the cell whose `[id.clock, id.clock+len)` range contains
    /// `clock`. The returned index may need splitting first if `clock` doesn't land on a cell
    /// boundary (spec.md §4.1: "callers that need exact boundaries request splitting first").
    pub fn find_pivot(&self, clock: Clock) -> Option<usize> {
        if self.list.is_empty() {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.list.len() - 1;
        if self.list[hi].id().clock <= clock {
            return Some(hi);
        }
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let cell = &self.list[mid];
            if cell.id().clock <= clock && clock < cell.clock_end() {
                return Some(mid);
            }
            if cell.id().clock < clock {
                lo = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            }
        }
        Some(lo.min(self.list.len() - 1))
    }

    /// Collapses runs of adjacent mergeable cells in place, right-into-left (spec.md §4.5 step 4
    /// "Merge structs from right to left"). Idempotent, matching spec.md §8 P3.
    ///
    /// Merging an `Item` cell drops its `Box`, so any surviving neighbour's `left`/`right` pointer
    /// into it would otherwise dangle: after a successful merge, the absorbed cell's right
    /// neighbour (now reachable through the merged-into item's `right`, which `try_merge` already
    /// repoints) has its `left` pointer patched to the merged-into item before the absorbed cell
    /// is actually removed.
    pub fn merge_adjacent(&mut self) {
        let mut i = 0;
        while i + 1 < self.list.len() {
            let merged = {
                let (left, right) = self.list.split_at_mut(i + 1);
                left[i].try_merge(&right[0])
            };
            if merged {
                if let BlockCell::Item(a) = &mut self.list[i] {
                    let a_ptr = ItemPtr::new(a.as_mut());
                    if let Some(mut new_right) = a_ptr.right {
                        new_right.left = Some(a_ptr);
                    }
                }
                self.list.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

impl std::ops::Index<usize> for ClientBlockList {
    type Output = BlockCell;
    fn index(&self, index: usize) -> &BlockCell {
        &self.list[index]
    }
}

impl std::ops::IndexMut<usize> for ClientBlockList {
    fn index_mut(&mut self, index: usize) -> &mut BlockCell {
        &mut self.list[index]
    }
}

/// Per-client append-only logs of operations, keyed by `(client, clock)` (spec.md §4.1
/// `StructStore`).
#[derive(Default)]
pub struct BlockStore {
    clients: HashMap<ClientID, ClientBlockList>,
}

impl BlockStore {
    pub fn new() -> Self {
        BlockStore {
            clients: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.values().all(|c| c.is_empty())
    }

    pub fn get_client(&self, client: &ClientID) -> Option<&ClientBlockList> {
        self.clients.get(client)
    }

    pub fn get_client_mut(&mut self, client: &ClientID) -> Option<&mut ClientBlockList> {
        self.clients.get_mut(client)
    }

    pub fn get_or_create_client(&mut self, client: ClientID) -> &mut ClientBlockList {
        self.clients.entry(client).or_default()
    }

    pub fn get_clock(&self, client: &ClientID) -> Clock {
        self.clients.get(client).map(|c| c.clock()).unwrap_or(0)
    }

    pub fn get_state_vector(&self) -> StateVector {
        self.clients
            .iter()
            .map(|(client, list)| (*client, list.clock()))
            .collect()
    }

    /// Every client id with at least one entry, in no particular order — used by full-state
    /// encoding (spec.md §6 `encodeStateAsUpdateV2`) to walk every log rather than just a diff.
    pub fn client_ids(&self) -> impl Iterator<Item = &ClientID> {
        self.clients.keys()
    }

    /// Locates the `Item` exactly starting at `id`. Returns `None` if `id.clock` falls in the
    /// interior of a cell rather than on its boundary — callers that need exact boundaries split
    /// the cell first (spec.md §4.1), via [Self::get_client_mut] + [ClientBlockList::find_pivot].
    pub fn find_item(&mut self, id: &ID) -> Option<ItemPtr> {
        let list = self.clients.get_mut(&id.client)?;
        let idx = list.find_pivot(id.clock)?;
        let cell = list.get_mut(idx)?;
        match cell {
            BlockCell::Item(item) if item.id.clock == id.clock => {
                Some(ItemPtr::new(item.as_mut()))
            }
            _ => None,
        }
    }

    pub fn append(&mut self, client: ClientID, cell: BlockCell) {
        self.get_or_create_client(client).push(cell);
    }
}

impl Debug for BlockStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut m = f.debug_map();
        for (client, list) in &self.clients {
            m.entry(client, &list.len());
        }
        m.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{DocUnref, Item, ItemContent, TypePtr};
    use crate::types::{Branch, BranchPtr, DocType};

    fn item(client: ClientID, clock: Clock, len: Clock) -> BlockCell {
        let branch: &'static mut Branch = Box::leak(Box::new(Branch::new(DocType::Array)));
        let parent = TypePtr::Branch(BranchPtr::new(branch));
        let it = Item::new(
            ID::new(client, clock),
            None,
            None,
            None,
            None,
            parent,
            None,
            ItemContent::Deleted(len),
        );
        BlockCell::Item(Box::new(it))
    }

    #[test]
    fn find_pivot_locates_containing_cell() {
        let mut list = ClientBlockList::new();
        list.push(item(1, 0, 5)); // [0,5)
        list.push(item(1, 5, 3)); // [5,8)
        list.push(item(1, 8, 2)); // [8,10)

        assert_eq!(list.find_pivot(0), Some(0));
        assert_eq!(list.find_pivot(4), Some(0));
        assert_eq!(list.find_pivot(5), Some(1));
        assert_eq!(list.find_pivot(7), Some(1));
        assert_eq!(list.find_pivot(9), Some(2));
    }

    #[test]
    fn state_vector_tracks_next_free_clock() {
        let mut store = BlockStore::new();
        store.append(1, item(1, 0, 4));
        store.append(1, item(1, 4, 1));
        store.append(2, item(2, 0, 10));

        let sv = store.get_state_vector();
        assert_eq!(sv.get(&1), 5);
        assert_eq!(sv.get(&2), 10);
        assert_eq!(sv.get(&3), 0);
    }

    #[test]
    fn merge_adjacent_collapses_a_mergeable_run_and_repairs_the_right_neighbours_left_pointer() {
        use crate::doc::{root_doc_id, Doc, DocCell, DocOptions};
        use crate::transaction::TransactionMut;

        let doc = DocCell::new(Doc::new(root_doc_id("t"), true, DocType::Array, 1, &DocOptions::new()));
        let root = doc.borrow_mut().root();
        let mut txn = TransactionMut::new(doc.clone(), None, true);
        txn.push_str(root, "a").unwrap();
        txn.push_str(root, "b").unwrap();
        // a different content variant breaks the mergeable run right after the "a"+"b" pair.
        txn.push(root, ItemContent::Json(vec![lib0::any::Any::Number(1.0)]))
            .unwrap();

        let mut d = doc.borrow_mut();
        let list = d.store.get_client_mut(&1).unwrap();
        assert_eq!(list.len(), 3);

        list.merge_adjacent();
        assert_eq!(list.len(), 2, "the two String cells should have collapsed into one");

        let merged_ptr = {
            let cell = list.get_mut(0).unwrap();
            ItemPtr::new(cell.as_item_mut().unwrap())
        };
        assert_eq!(merged_ptr.len, 2, "merged cell should report the combined length");

        let json_ptr = {
            let cell = list.get_mut(1).unwrap();
            ItemPtr::new(cell.as_item_mut().unwrap())
        };
        assert_eq!(
            json_ptr.left,
            Some(merged_ptr),
            "the surviving right neighbour's left pointer must be repointed at the merged cell, \
             not left dangling at the absorbed one"
        );
        assert_eq!(merged_ptr.right, Some(json_ptr));
    }

    #[test]
    fn unref_content_is_not_reclaimed_by_gc_merge_path() {
        // Exercises that BlockCell::gc() only touches Item cells; DocUnref-bearing items are
        // protected from this path entirely by `keep=true` set at integration (spec.md §4.2).
        let mut cell = item(1, 0, 1);
        cell.gc();
        assert!(matches!(
            cell.as_item().map(|i| &i.content),
            Some(crate::block::ItemContent::Deleted(_))
        ));

        let unref = DocUnref {
            doc_id: std::sync::Arc::from("x"),
            ref_client: 1,
            ref_clock: 0,
        };
        assert_eq!(unref.ref_client, 1);
    }
}
