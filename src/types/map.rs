use crate::block::ItemContent;
use crate::types::{BranchPtr, DocType, SharedRef};
use std::fmt::{Debug, Formatter};

/// A map-like shared type (spec.md §2 component 5: "concrete Map").
///
/// `Branch::map` always points at the *head* (latest-wins) [crate::Item] for each key; reads
/// walk straight to that head, writes go through [crate::TransactionMut::set] so each one is
/// recorded as a fresh `Item` superseding the previous head rather than mutating in place.
#[derive(Clone, Copy)]
pub struct MapRef(BranchPtr);

impl MapRef {
    pub fn len(&self) -> usize {
        self.0
            .map
            .values()
            .filter(|item| !item.is_deleted())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<&ItemContent> {
        let item = self.0.map.get(key)?;
        if item.is_deleted() {
            None
        } else {
            Some(&item.content)
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0
            .map
            .iter()
            .filter(|(_, item)| !item.is_deleted())
            .map(|(k, _)| k.as_ref())
    }

    pub fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl From<BranchPtr> for MapRef {
    fn from(branch: BranchPtr) -> Self {
        debug_assert!(matches!(branch.type_ref, DocType::Map));
        MapRef(branch)
    }
}

impl SharedRef for MapRef {
    fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl Debug for MapRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MapRef(len={})", self.len())
    }
}
