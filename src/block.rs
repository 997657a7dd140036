use crate::id::{Clock, ID};
use crate::types::{Branch, BranchPtr, DocType};
use crate::DocId;
use bitflags::bitflags;
use lib0::any::Any;
use smallstr::SmallString;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

pub type ContentStr = SmallString<[u8; 8]>;

bitflags! {
    /// Per-item flags (spec.md §3 Item: `deleted`, `keep`, `countable`).
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct ItemFlags: u8 {
        const DELETED   = 0b0000_0001;
        const KEEP      = 0b0000_0010;
        const COUNTABLE = 0b0000_0100;
    }
}

/// An unresolved or resolved reference to the parent container of an [Item].
///
/// Items integrated locally always carry a resolved `Branch` parent. Items decoded from a
/// remote update may temporarily carry `Named` (a root type name) until the doc that owns that
/// root has been materialized — mirrors spec.md §3's "reference to an AbstractType or an
/// unresolved parent-ID".
#[derive(Clone)]
pub enum TypePtr {
    Branch(BranchPtr),
    Named(std::sync::Arc<str>),
}

impl Debug for TypePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TypePtr::Branch(b) => write!(f, "Branch({:p})", b.as_ptr()),
            TypePtr::Named(n) => write!(f, "Named({})", n),
        }
    }
}

/// The atomic CRDT operation (spec.md §3 `Item`).
pub struct Item {
    pub id: ID,
    pub len: Clock,
    pub left: Option<ItemPtr>,
    pub right: Option<ItemPtr>,
    pub origin_left: Option<ID>,
    pub origin_right: Option<ID>,
    pub parent: TypePtr,
    pub parent_sub: Option<std::sync::Arc<str>>,
    pub content: ItemContent,
    pub info: ItemFlags,
}

impl Item {
    pub fn new(
        id: ID,
        left: Option<ItemPtr>,
        origin_left: Option<ID>,
        right: Option<ItemPtr>,
        origin_right: Option<ID>,
        parent: TypePtr,
        parent_sub: Option<std::sync::Arc<str>>,
        content: ItemContent,
    ) -> Self {
        let mut info = ItemFlags::empty();
        if content.is_countable() {
            info |= ItemFlags::COUNTABLE;
        }
        let len = content.len();
        Item {
            id,
            len,
            left,
            right,
            origin_left,
            origin_right,
            parent,
            parent_sub,
            content,
            info,
        }
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.info.contains(ItemFlags::DELETED)
    }

    #[inline]
    pub fn is_keep(&self) -> bool {
        self.info.contains(ItemFlags::KEEP)
    }

    #[inline]
    pub fn set_keep(&mut self) {
        self.info |= ItemFlags::KEEP;
    }

    #[inline]
    pub fn is_countable(&self) -> bool {
        self.info.contains(ItemFlags::COUNTABLE)
    }

    pub fn mark_deleted(&mut self) {
        self.info |= ItemFlags::DELETED;
    }

    #[inline]
    pub fn clock_end(&self) -> Clock {
        self.id.clock + self.len
    }

    pub fn contains(&self, id: &ID) -> bool {
        id.client == self.id.client && id.clock >= self.id.clock && id.clock < self.clock_end()
    }

    /// Whether `self` and `other` can collapse into a single [crate::BlockCell] (spec.md §4.1
    /// merge rule). `DocRef`/`DocUnref` never merge, mirroring "Ref/Unref are never mergeable"
    /// verbatim.
    pub fn can_merge(&self, other: &Item) -> bool {
        self.id.client == other.id.client
            && self.clock_end() == other.id.clock
            && self.is_deleted() == other.is_deleted()
            && other.origin_left == Some(self.last_id())
            && self.origin_right == other.origin_right
            && self.content.can_merge(&other.content)
    }

    pub fn last_id(&self) -> ID {
        ID::new(self.id.client, self.id.clock + self.len - 1)
    }
}

impl Debug for Item {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Item({:?}, len={}, deleted={}, content={:?})",
            self.id,
            self.len,
            self.is_deleted(),
            self.content
        )
    }
}

/// A stable, dereferenceable pointer to a heap-allocated [Item].
///
/// Items live boxed inside a [crate::BlockCell::Item] so that their address stays stable even
/// as the owning `Vec<BlockCell>` grows; `ItemPtr` is the unsafe-but-ergonomic handle the rest of
/// the crate navigates left/right/parent links with, the same pattern `yrs` uses for its own
/// `ItemPtr`/`BranchPtr`.
#[derive(Clone, Copy)]
pub struct ItemPtr(NonNull<Item>);

impl ItemPtr {
    pub fn new(item: &mut Item) -> Self {
        ItemPtr(NonNull::from(item))
    }

    pub fn id(&self) -> ID {
        self.deref().id
    }

    pub fn as_ptr(&self) -> *const Item {
        self.0.as_ptr()
    }
}

impl Deref for ItemPtr {
    type Target = Item;
    fn deref(&self) -> &Item {
        unsafe { self.0.as_ref() }
    }
}

impl DerefMut for ItemPtr {
    fn deref_mut(&mut self) -> &mut Item {
        unsafe { self.0.as_mut() }
    }
}

impl PartialEq for ItemPtr {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ItemPtr {}

impl std::hash::Hash for ItemPtr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl Debug for ItemPtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self.deref(), f)
    }
}

/// The polymorphic payload of an [Item] (spec.md §3 `content` / §9 "polymorphic content").
///
/// Represented as a tagged sum rather than a trait object so that every content kind's
/// `integrate`/`delete`/`gc`/`can_merge` obligations (spec.md §4.2, §9) are exhaustively checked
/// at compile time.
pub enum ItemContent {
    /// Placeholder for content that has been garbage collected or never had user-visible
    /// content (spec.md §4.1: "GC replaces a deleted Item in-place ... content lost").
    Deleted(Clock),
    Json(Vec<Any>),
    Binary(Vec<u8>),
    String(ContentStr),
    Embed(Any),
    Format(std::sync::Arc<str>, Box<Any>),
    /// An embedded child collection (array/map/text/xml) that lives *inside* the same doc as
    /// this item — not a cross-doc [DocRef].
    Type(Box<Branch>),
    /// `Ref` content: embeds another [crate::Doc] by reference (spec.md §4.6).
    DocRef(DocRef),
    /// `Unref` content: records that a previous `DocRef` has been forgotten (spec.md §4.6/§4.7).
    DocUnref(DocUnref),
}

impl ItemContent {
    pub fn len(&self) -> Clock {
        match self {
            ItemContent::Deleted(len) => *len,
            ItemContent::Json(items) => items.len() as Clock,
            ItemContent::String(s) => s.chars().count() as Clock,
            ItemContent::Binary(_) => 1,
            ItemContent::Embed(_) => 1,
            ItemContent::Format(_, _) => 1,
            ItemContent::Type(_) => 1,
            ItemContent::DocRef(_) => 1,
            ItemContent::DocUnref(_) => 1,
        }
    }

    pub fn is_countable(&self) -> bool {
        matches!(
            self,
            ItemContent::Json(_)
                | ItemContent::String(_)
                | ItemContent::Binary(_)
                | ItemContent::Embed(_)
                | ItemContent::Type(_)
                | ItemContent::DocRef(_)
                | ItemContent::DocUnref(_)
        )
    }

    /// Content-level mergeability (spec.md §4.1). `DocRef`/`DocUnref` always report `false`.
    pub fn can_merge(&self, other: &ItemContent) -> bool {
        match (self, other) {
            (ItemContent::Deleted(_), ItemContent::Deleted(_)) => true,
            (ItemContent::Json(_), ItemContent::Json(_)) => true,
            (ItemContent::String(_), ItemContent::String(_)) => true,
            (ItemContent::Binary(_), ItemContent::Binary(_)) => false,
            (ItemContent::DocRef(_), ItemContent::DocRef(_)) => false,
            (ItemContent::DocUnref(_), ItemContent::DocUnref(_)) => false,
            _ => false,
        }
    }

    pub fn type_ref(&self) -> Option<&Branch> {
        match self {
            ItemContent::Type(b) => Some(b),
            _ => None,
        }
    }
}

impl Debug for ItemContent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemContent::Deleted(len) => write!(f, "deleted({})", len),
            ItemContent::Json(v) => write!(f, "json({:?})", v),
            ItemContent::Binary(v) => write!(f, "binary({} bytes)", v.len()),
            ItemContent::String(s) => write!(f, "{:?}", s.as_str()),
            ItemContent::Embed(v) => write!(f, "embed({:?})", v),
            ItemContent::Format(k, v) => write!(f, "format({}: {:?})", k, v),
            ItemContent::Type(b) => write!(f, "type({:?})", b.type_ref),
            ItemContent::DocRef(r) => write!(f, "ref({:?})", r.doc_id),
            ItemContent::DocUnref(u) => write!(f, "unref({:?})", u.doc_id),
        }
    }
}

/// `Ref` content (spec.md §3 `ContentBlockRef`, §4.6). Only `doc_id`/`doc_type` are part of the
/// wire format; `doc`/`branch`/`item` are process-local caches rebuilt on integration.
pub struct DocRef {
    pub doc_id: DocId,
    pub doc_type: DocType,
    /// Cached handle of the target doc (`_block` in spec.md).
    pub doc: Option<crate::doc::DocCell>,
    /// Cached root branch of the target doc (`_type` in spec.md).
    pub branch: Option<BranchPtr>,
    /// The item whose content this is (`_item` in spec.md); set once the item is integrated.
    pub item: Option<ItemPtr>,
}

impl DocRef {
    pub fn new(doc_id: DocId, doc_type: DocType) -> Self {
        DocRef {
            doc_id,
            doc_type,
            doc: None,
            branch: None,
            item: None,
        }
    }
}

/// `Unref` content (spec.md §3 `ContentBlockUnref`, §4.7).
#[derive(Debug, Clone)]
pub struct DocUnref {
    pub doc_id: DocId,
    pub ref_client: crate::id::ClientID,
    pub ref_clock: Clock,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_content_length() {
        let content = ItemContent::String(ContentStr::from("hello"));
        assert_eq!(content.len(), 5);
        assert!(content.is_countable());
    }

    #[test]
    fn ref_and_unref_never_merge() {
        let a = ItemContent::DocRef(DocRef::new(DocId::from("x"), DocType::Map));
        let b = ItemContent::DocRef(DocRef::new(DocId::from("y"), DocType::Map));
        assert!(!a.can_merge(&b));

        let a = ItemContent::DocUnref(DocUnref {
            doc_id: DocId::from("x"),
            ref_client: 1,
            ref_clock: 0,
        });
        let b = ItemContent::DocUnref(DocUnref {
            doc_id: DocId::from("x"),
            ref_client: 1,
            ref_clock: 1,
        });
        assert!(!a.can_merge(&b));
    }
}
