pub mod array;
pub mod map;
pub mod text;
pub mod xml;

pub use array::ArrayRef;
pub use map::MapRef;
pub use text::TextRef;
pub use xml::{XmlElementRef, XmlFragmentRef, XmlTextRef};

use crate::block::{ItemContent, ItemPtr, TypePtr};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

/// Type ref identifier for an [ArrayRef]-backed [Branch], matching spec.md §3's
/// `block_type: enum {Array, Map, Text, XmlFragment, XmlElement, XmlText}`.
pub const TYPE_REFS_ARRAY: u8 = 0;
pub const TYPE_REFS_MAP: u8 = 1;
pub const TYPE_REFS_TEXT: u8 = 2;
pub const TYPE_REFS_XML_FRAGMENT: u8 = 3;
pub const TYPE_REFS_XML_ELEMENT: u8 = 4;
pub const TYPE_REFS_XML_TEXT: u8 = 5;

/// The kind of CRDT document/collection a [Branch] or a whole [crate::Doc] represents (spec.md
/// §3). A plain `enum` rather than a trait object, matching `yrs`'s `TypeRef`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocType {
    Array,
    Map,
    Text,
    XmlFragment,
    /// Carries its tag name, just like `yrs::types::TypeRef::XmlElement(name)`.
    XmlElement(Arc<str>),
    XmlText,
}

impl DocType {
    pub fn kind(&self) -> u8 {
        match self {
            DocType::Array => TYPE_REFS_ARRAY,
            DocType::Map => TYPE_REFS_MAP,
            DocType::Text => TYPE_REFS_TEXT,
            DocType::XmlFragment => TYPE_REFS_XML_FRAGMENT,
            DocType::XmlElement(_) => TYPE_REFS_XML_ELEMENT,
            DocType::XmlText => TYPE_REFS_XML_TEXT,
        }
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DocType::Array => write!(f, "Array"),
            DocType::Map => write!(f, "Map"),
            DocType::Text => write!(f, "Text"),
            DocType::XmlFragment => write!(f, "XmlFragment"),
            DocType::XmlElement(tag) => write!(f, "XmlElement({})", tag),
            DocType::XmlText => write!(f, "XmlText"),
        }
    }
}

/// A single segment of a [Path] from a doc's root type down to a nested value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(Arc<str>),
    Index(u32),
}

pub type Path = std::collections::VecDeque<PathSegment>;

/// In-memory projection of a subset of [Item]s belonging to one doc (spec.md §3
/// `AbstractType`). Sequence types (`Array`/`Text`/`Xml*`) use `start`/`len`; map-like access
/// uses `map`, keyed by the latest (head) item for that key.
pub struct Branch {
    pub start: Option<ItemPtr>,
    pub map: HashMap<Arc<str>, ItemPtr>,
    pub len: u32,
    pub type_ref: DocType,
    /// The item (whose content is `Type`) that embeds this branch, if it's nested inside another
    /// collection of the *same* doc. `None` for a doc's root type or for an orphaned branch.
    pub item: Option<ItemPtr>,
    /// Name this branch is registered under in its doc's `share` map, if any.
    pub name: Option<Arc<str>>,
    /// Set by [crate::refs::clone_doc] on a freshly cloned branch so the surrounding insert path
    /// knows to wrap it in a brand new `DocRef` rather than re-attach the clone source (spec.md
    /// §4.6 `clone_block`, Open Question in §9).
    pub pending_ref: bool,
    shallow_handlers: Vec<Box<dyn Fn(&crate::event::Event)>>,
    deep_handlers: Vec<Box<dyn Fn(&[crate::event::Event])>>,
}

impl Branch {
    pub fn new(type_ref: DocType) -> Self {
        Branch {
            start: None,
            map: HashMap::new(),
            len: 0,
            type_ref,
            item: None,
            name: None,
            pending_ref: false,
            shallow_handlers: Vec::new(),
            deep_handlers: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.item.is_none()
    }

    /// Iterates the sequence from `start`, skipping deleted items, matching `i`th countable
    /// position. Returns the item holding that position and the in-item offset.
    pub fn get_at(&self, mut index: u32) -> Option<(&ItemContent, u32)> {
        let mut current = self.start;
        while let Some(item) = current {
            if !item.is_deleted() && item.is_countable() {
                if index < item.len {
                    return Some((&item.content, index));
                }
                index -= item.len;
            }
            current = item.right;
        }
        None
    }

    pub fn observe_shallow<F>(&mut self, f: F)
    where
        F: Fn(&crate::event::Event) + 'static,
    {
        self.shallow_handlers.push(Box::new(f));
    }

    pub fn observe_deep<F>(&mut self, f: F)
    where
        F: Fn(&[crate::event::Event]) + 'static,
    {
        self.deep_handlers.push(Box::new(f));
    }

    pub(crate) fn notify_shallow(&self, event: &crate::event::Event) {
        for h in &self.shallow_handlers {
            h(event);
        }
    }

    pub(crate) fn notify_deep(&self, events: &[crate::event::Event]) {
        for h in &self.deep_handlers {
            h(events);
        }
    }
}

impl Debug for Branch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("type_ref", &self.type_ref)
            .field("len", &self.len)
            .field("name", &self.name)
            .finish()
    }
}

/// A stable pointer to a heap-allocated [Branch] (see [crate::block::ItemPtr] for the same
/// pattern applied to [Item]).
#[derive(Clone, Copy)]
pub struct BranchPtr(NonNull<Branch>);

impl BranchPtr {
    pub fn new(branch: &mut Branch) -> Self {
        BranchPtr(NonNull::from(branch))
    }

    pub fn as_ptr(&self) -> *const Branch {
        self.0.as_ptr()
    }

    /// Walks up through `item`'s doc-local parent chain to find the owning doc's root type.
    /// Returns `None` if this branch is itself a root (no owning `item`).
    pub fn root_ancestor(&self) -> Option<BranchPtr> {
        let mut current = *self;
        loop {
            let item = current.item?;
            match &item.parent {
                TypePtr::Branch(parent) => current = *parent,
                TypePtr::Named(_) => return Some(current),
            }
            if current.is_root() {
                return Some(current);
            }
        }
    }
}

impl Deref for BranchPtr {
    type Target = Branch;
    fn deref(&self) -> &Branch {
        unsafe { self.0.as_ref() }
    }
}

impl DerefMut for BranchPtr {
    fn deref_mut(&mut self) -> &mut Branch {
        unsafe { self.0.as_mut() }
    }
}

impl PartialEq for BranchPtr {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for BranchPtr {}

impl std::hash::Hash for BranchPtr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl Debug for BranchPtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self.deref(), f)
    }
}

/// Marker implemented by the thin, typed wrappers (`ArrayRef`, `MapRef`, ...) around a
/// [BranchPtr], so generic doc/transaction code can accept "any shared type" without knowing
/// its concrete flavor.
pub trait SharedRef: From<BranchPtr> {
    fn branch(&self) -> BranchPtr;
}

